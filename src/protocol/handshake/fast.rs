//! CREATE_FAST handshake
//!
//! The client sends 20 random bytes X, the relay answers with its own
//! random Y and KH. The shared secret is X | Y fed through KDF-TOR. There is
//! no public-key crypto here, so it is only ever used towards the first hop,
//! whose identity the link layer has already authenticated.

use super::HandshakeOutput;
use crate::error::{Result, TorError};
use crate::protocol::crypto::{HopKeys, KdfKind, DIGEST_LEN};
use rand::{CryptoRng, RngCore};
use zeroize::Zeroizing;

/// Client handshake length (X)
pub const FAST_C_HANDSHAKE_LEN: usize = DIGEST_LEN;

/// Relay handshake length (Y | KH)
pub const FAST_S_HANDSHAKE_LEN: usize = 2 * DIGEST_LEN;

/// Client half of a CREATE_FAST handshake
pub struct FastClient {
    x: Zeroizing<[u8; FAST_C_HANDSHAKE_LEN]>,
}

impl FastClient {
    pub fn new<R: RngCore + CryptoRng>(rng: &mut R) -> (Self, Vec<u8>) {
        let mut x = Zeroizing::new([0u8; FAST_C_HANDSHAKE_LEN]);
        rng.fill_bytes(&mut x[..]);
        let msg = x.to_vec();
        (Self { x }, msg)
    }

    /// Process a CREATED_FAST body: Y (20) | KH (20)
    pub fn complete(self, reply: &[u8]) -> Result<HandshakeOutput> {
        if reply.len() < FAST_S_HANDSHAKE_LEN {
            return Err(TorError::protocol(format!(
                "CREATED_FAST body too short: {} bytes",
                reply.len()
            )));
        }
        let mut secret = Zeroizing::new(Vec::with_capacity(2 * DIGEST_LEN));
        secret.extend_from_slice(&self.x[..]);
        secret.extend_from_slice(&reply[..DIGEST_LEN]);
        Ok(HandshakeOutput {
            kdf: KdfKind::Tor,
            shared_secret: secret,
            peer_verify: reply[DIGEST_LEN..FAST_S_HANDSHAKE_LEN].to_vec(),
        })
    }
}

/// Relay side of CREATE_FAST
pub fn server_reply<R: RngCore + CryptoRng>(
    rng: &mut R,
    client_msg: &[u8],
) -> Result<(Vec<u8>, HopKeys)> {
    let x = client_msg
        .get(..FAST_C_HANDSHAKE_LEN)
        .ok_or_else(|| TorError::protocol("CREATE_FAST body too short"))?;
    let mut y = [0u8; DIGEST_LEN];
    rng.fill_bytes(&mut y);

    let mut secret = Zeroizing::new(x.to_vec());
    secret.extend_from_slice(&y);
    let keys = HopKeys::derive(KdfKind::Tor, &secret)?;

    let mut reply = y.to_vec();
    reply.extend_from_slice(&keys.verify);
    Ok((reply, keys.reversed()))
}
