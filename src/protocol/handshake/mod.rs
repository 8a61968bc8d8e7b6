//! Circuit handshakes
//!
//! Every variant produces a [`HandshakeOutput`]: the raw shared secret, the
//! KDF that expands it, and the value the relay sent to prove it derived the
//! same keys.

pub mod fast;
pub mod ntor;
pub mod tap;

use super::crypto::{HopCryptoState, HopKeys, KdfKind};
use super::router::Router;
use crate::error::{Result, TorError};
use rand::{CryptoRng, RngCore};
use std::fmt;
use zeroize::Zeroizing;

pub use fast::FastClient;
pub use ntor::NtorClient;
pub use tap::TapClient;

/// Handshake variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeKind {
    /// CREATE_FAST (first hop only)
    Fast,
    /// TAP: DH wrapped in RSA
    Tap,
    /// ntor: Curve25519
    Ntor,
}

impl HandshakeKind {
    /// KDF that turns this variant's shared secret into keys
    pub fn kdf(self) -> KdfKind {
        match self {
            HandshakeKind::Fast | HandshakeKind::Tap => KdfKind::Tor,
            HandshakeKind::Ntor => KdfKind::Ntor,
        }
    }
}

/// Result of a completed client handshake
pub struct HandshakeOutput {
    /// KDF to run over `shared_secret`
    pub kdf: KdfKind,

    /// Raw shared secret
    pub shared_secret: Zeroizing<Vec<u8>>,

    /// Verification value sent by the relay (KH or AUTH)
    pub peer_verify: Vec<u8>,
}

impl HandshakeOutput {
    /// Derive keys, check the relay's verification value and build the hop state
    pub fn into_hop_state(self) -> Result<HopCryptoState> {
        let keys = HopKeys::derive(self.kdf, &self.shared_secret)?;
        let state = HopCryptoState::new(&keys);
        if !state.verify_peer(&self.peer_verify) {
            return Err(TorError::handshake("relay key verification failed"));
        }
        Ok(state)
    }
}

/// A client handshake in flight
pub enum ClientHandshake {
    Fast(FastClient),
    Tap(TapClient),
    Ntor(NtorClient),
}

impl ClientHandshake {
    /// Start a handshake of `kind` towards `router`, returning the message to send
    pub fn start<R: RngCore + CryptoRng>(
        kind: HandshakeKind,
        router: &Router,
        rng: &mut R,
    ) -> Result<(Self, Vec<u8>)> {
        match kind {
            HandshakeKind::Fast => {
                let (client, msg) = FastClient::new(rng);
                Ok((ClientHandshake::Fast(client), msg))
            }
            HandshakeKind::Tap => {
                let key = router.onion_key.as_ref().ok_or_else(|| {
                    TorError::InvalidRelay(format!("{} has no TAP onion key", router.nickname))
                })?;
                let (client, msg) = TapClient::new(rng, key)?;
                Ok((ClientHandshake::Tap(client), msg))
            }
            HandshakeKind::Ntor => {
                let key = router.ntor_onion_key.ok_or_else(|| {
                    TorError::InvalidRelay(format!("{} has no ntor onion key", router.nickname))
                })?;
                let (client, msg) = NtorClient::new(rng, router.identity, key);
                Ok((ClientHandshake::Ntor(client), msg))
            }
        }
    }

    pub fn kind(&self) -> HandshakeKind {
        match self {
            ClientHandshake::Fast(_) => HandshakeKind::Fast,
            ClientHandshake::Tap(_) => HandshakeKind::Tap,
            ClientHandshake::Ntor(_) => HandshakeKind::Ntor,
        }
    }

    /// Consume the relay's reply
    pub fn complete(self, reply: &[u8]) -> Result<HandshakeOutput> {
        match self {
            ClientHandshake::Fast(client) => client.complete(reply),
            ClientHandshake::Tap(client) => client.complete(reply),
            ClientHandshake::Ntor(client) => client.complete(reply),
        }
    }
}

impl fmt::Debug for ClientHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientHandshake({:?})", self.kind())
    }
}
