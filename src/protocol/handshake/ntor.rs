//! ntor handshake
//!
//! Implements the ntor (ntor1) key exchange used by CREATE2 and EXTEND2.
//! Based on X25519 Elliptic Curve Diffie-Hellman.
//!
//! ```text
//! client -> relay: ID (20) | B (32) | X (32)
//! relay -> client: Y (32) | AUTH (32)
//!
//! secret_input = EXP(Y,x) | EXP(B,x) | ID | B | X | Y | PROTOID
//! KEY_SEED     = H(secret_input, t_key)
//! verify       = H(secret_input, t_verify)
//! auth_input   = verify | ID | B | Y | X | PROTOID | "Server"
//! AUTH         = H(auth_input, t_mac)
//! ```
//!
//! Security: AUTH is compared in constant time, and an all-zero shared point
//! is rejected regardless of what AUTH says.

use super::HandshakeOutput;
use crate::error::{Result, TorError};
use crate::protocol::crypto::{HopKeys, KdfKind};
use hmac::{Hmac, Mac};
use rand::{CryptoRng, RngCore};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";

/// CREATE2 handshake type for ntor
pub const NTOR_HTYPE: u16 = 0x0002;

/// Client onion skin length: ID | B | X
pub const NTOR_ONIONSKIN_LEN: usize = 20 + 32 + 32;

/// Relay reply length: Y | AUTH
pub const NTOR_REPLY_LEN: usize = 32 + 32;

const SECRET_INPUT_LEN: usize = 32 + 32 + 20 + 32 + 32 + 32 + 24;

/// Client half of an ntor handshake in flight
///
/// SECURITY: the ephemeral secret is zeroized on drop by x25519-dalek.
pub struct NtorClient {
    secret: StaticSecret,
    public: PublicKey,
    relay_id: [u8; 20],
    relay_ntor_key: PublicKey,
}

/// Outputs of the ntor extract step
pub(crate) struct NtorMaterial {
    pub(crate) key_seed: Zeroizing<[u8; 32]>,
    pub(crate) auth: [u8; 32],
}

impl NtorClient {
    /// Generate an ephemeral keypair and the 84-byte onion skin
    pub fn new<R: RngCore + CryptoRng>(
        rng: &mut R,
        relay_id: [u8; 20],
        relay_ntor_key: [u8; 32],
    ) -> (Self, Vec<u8>) {
        let secret = StaticSecret::random_from_rng(rng);
        let public = PublicKey::from(&secret);
        let relay_ntor_key = PublicKey::from(relay_ntor_key);

        let mut onionskin = Vec::with_capacity(NTOR_ONIONSKIN_LEN);
        onionskin.extend_from_slice(&relay_id);
        onionskin.extend_from_slice(relay_ntor_key.as_bytes());
        onionskin.extend_from_slice(public.as_bytes());

        log::trace!("ntor client key X: {:02x?}...", &public.as_bytes()[..8]);

        (
            Self {
                secret,
                public,
                relay_id,
                relay_ntor_key,
            },
            onionskin,
        )
    }

    /// Process the relay's Y | AUTH reply
    pub fn complete(self, reply: &[u8]) -> Result<HandshakeOutput> {
        if reply.len() < NTOR_REPLY_LEN {
            return Err(TorError::protocol(format!(
                "ntor reply too short: {} bytes",
                reply.len()
            )));
        }
        let mut y = [0u8; 32];
        y.copy_from_slice(&reply[..32]);
        let server_public = PublicKey::from(y);
        let server_auth = &reply[32..64];

        let exp_yx = self.secret.diffie_hellman(&server_public);
        let exp_bx = self.secret.diffie_hellman(&self.relay_ntor_key);
        let degenerate = is_zero(&exp_yx) | is_zero(&exp_bx);

        let secret_input = secret_input(
            &exp_yx,
            &exp_bx,
            &self.relay_id,
            &self.relay_ntor_key,
            &self.public,
            &server_public,
        );
        let material = key_material(&secret_input)?;

        // Verify AUTH using CONSTANT-TIME comparison
        let auth_ok: bool = material.auth.ct_eq(server_auth).into();

        if degenerate {
            log::warn!("ntor: relay sent a point with an all-zero shared secret");
            return Err(TorError::handshake("ntor shared secret is all-zero"));
        }
        if !auth_ok {
            log::warn!("ntor: server AUTH verification failed");
            return Err(TorError::handshake("ntor AUTH mismatch"));
        }

        Ok(HandshakeOutput {
            kdf: KdfKind::Ntor,
            shared_secret: secret_input,
            peer_verify: server_auth.to_vec(),
        })
    }
}

/// Relay side of ntor: answer an onion skin with Y | AUTH and the relay's keys
pub fn server_reply<R: RngCore + CryptoRng>(
    rng: &mut R,
    relay_id: &[u8; 20],
    ntor_secret: &StaticSecret,
    onionskin: &[u8],
) -> Result<(Vec<u8>, HopKeys)> {
    if onionskin.len() < NTOR_ONIONSKIN_LEN {
        return Err(TorError::protocol("ntor onion skin too short"));
    }
    let ntor_key = PublicKey::from(ntor_secret);
    if &onionskin[..20] != relay_id || &onionskin[20..52] != ntor_key.as_bytes() {
        return Err(TorError::handshake("ntor onion skin addressed to another relay"));
    }
    let mut x = [0u8; 32];
    x.copy_from_slice(&onionskin[52..84]);
    let client_public = PublicKey::from(x);

    let ephemeral = StaticSecret::random_from_rng(rng);
    let server_public = PublicKey::from(&ephemeral);
    let exp_xy = ephemeral.diffie_hellman(&client_public);
    let exp_xb = ntor_secret.diffie_hellman(&client_public);
    if is_zero(&exp_xy) | is_zero(&exp_xb) {
        return Err(TorError::handshake("ntor shared secret is all-zero"));
    }

    let secret_input = secret_input(
        &exp_xy,
        &exp_xb,
        relay_id,
        &ntor_key,
        &client_public,
        &server_public,
    );
    let keys = HopKeys::derive(KdfKind::Ntor, &secret_input)?;

    let mut reply = Vec::with_capacity(NTOR_REPLY_LEN);
    reply.extend_from_slice(server_public.as_bytes());
    reply.extend_from_slice(&keys.verify);
    Ok((reply, keys.reversed()))
}

fn is_zero(shared: &SharedSecret) -> bool {
    shared.as_bytes().ct_eq(&[0u8; 32]).into()
}

fn secret_input(
    exp_y: &SharedSecret,
    exp_b: &SharedSecret,
    id: &[u8; 20],
    b: &PublicKey,
    x: &PublicKey,
    y: &PublicKey,
) -> Zeroizing<Vec<u8>> {
    let mut si = Zeroizing::new(Vec::with_capacity(SECRET_INPUT_LEN));
    si.extend_from_slice(exp_y.as_bytes());
    si.extend_from_slice(exp_b.as_bytes());
    si.extend_from_slice(id);
    si.extend_from_slice(b.as_bytes());
    si.extend_from_slice(x.as_bytes());
    si.extend_from_slice(y.as_bytes());
    si.extend_from_slice(PROTOID);
    si
}

fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| TorError::Crypto("HMAC key rejected".into()))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// Extract KEY_SEED and AUTH from a `secret_input`
pub(crate) fn key_material(secret_input: &[u8]) -> Result<NtorMaterial> {
    if secret_input.len() != SECRET_INPUT_LEN || !secret_input.ends_with(PROTOID) {
        return Err(TorError::Internal("malformed ntor secret_input".into()));
    }
    let id = &secret_input[64..84];
    let b = &secret_input[84..116];
    let x = &secret_input[116..148];
    let y = &secret_input[148..180];

    let key_seed = Zeroizing::new(hmac_sha256(T_KEY, &[secret_input])?);
    let verify = Zeroizing::new(hmac_sha256(T_VERIFY, &[secret_input])?);
    let auth = hmac_sha256(T_MAC, &[&verify[..], id, b, y, x, PROTOID, b"Server"])?;

    Ok(NtorMaterial { key_seed, auth })
}
