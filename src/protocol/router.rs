//! Router records and path-choice strategies
//!
//! Routers are immutable records handed to us by whatever directory layer
//! the caller runs. Path selection policy lives outside this crate; a
//! circuit only sees it through the [`PathChooser`] trait object.

use super::handshake::HandshakeKind;
use crate::error::{Result, TorError};
use base64::Engine;
use rsa::RsaPublicKey;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// A relay's identity, address and onion keys
#[derive(Clone)]
pub struct Router {
    /// Relay nickname
    pub nickname: String,

    /// IPv4/IPv6 address
    pub address: IpAddr,

    /// OR (Onion Router) port
    pub or_port: u16,

    /// SHA-1 digest of the RSA identity key
    pub identity: [u8; 20],

    /// ntor onion key (Curve25519)
    pub ntor_onion_key: Option<[u8; 32]>,

    /// TAP onion key (RSA-1024)
    pub onion_key: Option<RsaPublicKey>,
}

impl Router {
    /// Create a router record with no onion keys
    pub fn new(nickname: impl Into<String>, address: IpAddr, or_port: u16, identity: [u8; 20]) -> Self {
        Self {
            nickname: nickname.into(),
            address,
            or_port,
            identity,
            ntor_onion_key: None,
            onion_key: None,
        }
    }

    /// Create a router from a hex-encoded identity fingerprint
    pub fn from_fingerprint(
        nickname: impl Into<String>,
        addr: SocketAddr,
        fingerprint: &str,
    ) -> Result<Self> {
        let fingerprint = fingerprint.trim_start_matches('$');
        let bytes = hex::decode(fingerprint)
            .map_err(|e| TorError::InvalidRelay(format!("bad fingerprint {}: {}", fingerprint, e)))?;
        let identity: [u8; 20] = bytes.try_into().map_err(|_| {
            TorError::InvalidRelay(format!("fingerprint {} is not 20 bytes", fingerprint))
        })?;
        Ok(Self::new(nickname, addr.ip(), addr.port(), identity))
    }

    pub fn with_ntor_key(mut self, key: [u8; 32]) -> Self {
        self.ntor_onion_key = Some(key);
        self
    }

    /// Attach an ntor key in the base64 form used by descriptors (padding optional)
    pub fn with_ntor_key_base64(self, encoded: &str) -> Result<Self> {
        let trimmed = encoded.trim().trim_end_matches('=');
        let bytes = base64::engine::general_purpose::STANDARD_NO_PAD
            .decode(trimmed)
            .map_err(|e| TorError::InvalidRelay(format!("bad ntor key: {}", e)))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| TorError::InvalidRelay("ntor key is not 32 bytes".into()))?;
        Ok(self.with_ntor_key(key))
    }

    pub fn with_onion_key(mut self, key: RsaPublicKey) -> Self {
        self.onion_key = Some(key);
        self
    }

    /// Get the SocketAddr for connecting to this relay
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.or_port)
    }

    /// Hex-encoded identity fingerprint
    pub fn fingerprint(&self) -> String {
        hex::encode_upper(self.identity)
    }

    /// Best public-key handshake this router supports
    pub fn preferred_handshake(&self, prefer_ntor: bool) -> Option<HandshakeKind> {
        match (self.ntor_onion_key.is_some(), self.onion_key.is_some()) {
            (true, false) => Some(HandshakeKind::Ntor),
            (true, true) if prefer_ntor => Some(HandshakeKind::Ntor),
            (_, true) => Some(HandshakeKind::Tap),
            (false, false) => None,
        }
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("nickname", &self.nickname)
            .field("addr", &self.socket_addr())
            .field("fingerprint", &self.fingerprint())
            .field("ntor", &self.ntor_onion_key.is_some())
            .field("tap", &self.onion_key.is_some())
            .finish()
    }
}

/// What a circuit will be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitPurpose {
    /// Directory fetches (BEGIN_DIR at the last hop)
    Directory,
    /// General exit traffic
    Exit,
    /// Internal circuits that never leave the network
    Internal,
}

/// Path-choice strategy injected into the builder
pub trait PathChooser: Send + Sync {
    /// Choose the routers for a new circuit, in path order
    fn choose_path(&self, purpose: CircuitPurpose) -> Result<Vec<Arc<Router>>>;
}

/// A path fixed up front, used for every purpose
#[derive(Debug, Clone)]
pub struct FixedPath(pub Vec<Arc<Router>>);

impl PathChooser for FixedPath {
    fn choose_path(&self, _purpose: CircuitPurpose) -> Result<Vec<Arc<Router>>> {
        if self.0.is_empty() {
            return Err(TorError::InvalidRelay("empty path".into()));
        }
        Ok(self.0.clone())
    }
}
