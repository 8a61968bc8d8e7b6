//! One hop of a circuit

use super::crypto::HopCryptoState;
use super::flow_control::{DeliverWindow, SendWindow};
use super::handshake::{ClientHandshake, HandshakeKind};
use super::relay_cell::HopIndex;
use super::router::Router;
use crate::error::{Result, TorError};
use rand::{CryptoRng, RngCore};
use std::sync::Arc;

/// A hop: the router, its handshake while in flight, then its keys
///
/// A node is created unkeyed when its router is chosen. It becomes usable
/// once a handshake reply has populated its crypto state, and is never
/// re-keyed after that.
#[derive(Debug)]
pub struct CircuitNode {
    router: Arc<Router>,
    handshake: Option<ClientHandshake>,
    crypto: Option<HopCryptoState>,
    pub(crate) package_window: SendWindow,
    pub(crate) deliver_window: DeliverWindow,
    /// Hop that wraps this one on the wire (`None` for the first hop)
    previous: Option<HopIndex>,
}

impl CircuitNode {
    pub fn new(router: Arc<Router>, previous: Option<HopIndex>) -> Self {
        Self {
            router,
            handshake: None,
            crypto: None,
            package_window: SendWindow::circuit(),
            deliver_window: DeliverWindow::circuit(),
            previous,
        }
    }

    /// Start this hop's handshake, returning the client message
    pub fn begin_handshake<R: RngCore + CryptoRng>(
        &mut self,
        kind: HandshakeKind,
        rng: &mut R,
    ) -> Result<Vec<u8>> {
        if self.crypto.is_some() || self.handshake.is_some() {
            return Err(TorError::InvalidState(format!(
                "hop {} already has a handshake",
                self.router.nickname
            )));
        }
        let (handshake, message) = ClientHandshake::start(kind, &self.router, rng)?;
        self.handshake = Some(handshake);
        Ok(message)
    }

    /// Finish the handshake with the relay's reply and key the hop
    pub fn complete_handshake(&mut self, reply: &[u8]) -> Result<()> {
        let handshake = self.handshake.take().ok_or_else(|| {
            TorError::InvalidState(format!("no handshake pending for {}", self.router.nickname))
        })?;
        let crypto = handshake.complete(reply)?.into_hop_state()?;
        self.crypto = Some(crypto);
        Ok(())
    }

    pub fn handshake_kind(&self) -> Option<HandshakeKind> {
        self.handshake.as_ref().map(ClientHandshake::kind)
    }

    pub fn is_keyed(&self) -> bool {
        self.crypto.is_some()
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn previous(&self) -> Option<HopIndex> {
        self.previous
    }

    pub(crate) fn crypto_mut(&mut self) -> Result<&mut HopCryptoState> {
        self.crypto
            .as_mut()
            .ok_or_else(|| TorError::InvalidState(format!("hop {} is not keyed", self.router.nickname)))
    }
}
