//! TAP handshake
//!
//! Diffie-Hellman over the 1024-bit Oakley group 2, with the client's g^x
//! hybrid-encrypted to the relay's RSA onion key:
//!
//! ```text
//! onion skin = RSA-OAEP-SHA1(K | g^x[0..70]) | AES-CTR(K, g^x[70..128])   (186 bytes)
//! reply      = g^y (128) | KH (20)                                        (148 bytes)
//! ```
//!
//! The shared secret g^xy (128 bytes, big-endian, left-padded) goes through
//! KDF-TOR; KH is the first 20 bytes of that output.

use super::HandshakeOutput;
use crate::error::{Result, TorError};
use crate::protocol::crypto::{HopKeys, KdfKind, DIGEST_LEN};
use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use rand::{CryptoRng, RngCore};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use zeroize::Zeroizing;

type Aes128Ctr = Ctr128BE<Aes128>;

const DH_PRIME_HEX: &[u8] = b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381\
FFFFFFFFFFFFFFFF";

/// Length of a DH public value
pub const DH_LEN: usize = 128;

/// Length of an RSA-1024 ciphertext block
pub const PK_ENC_LEN: usize = 128;

/// OAEP overhead on one RSA block
const PK_PAD_LEN: usize = 42;

const KEY_LEN: usize = 16;

/// Private exponent size: 320 bits
const DH_PRIVATE_LEN: usize = 40;

/// Bytes of g^x that ride inside the RSA block
const RSA_PART: usize = PK_ENC_LEN - PK_PAD_LEN - KEY_LEN;

/// Client onion skin length
pub const TAP_C_HANDSHAKE_LEN: usize = DH_LEN + KEY_LEN + PK_PAD_LEN;

/// Relay reply length
pub const TAP_S_HANDSHAKE_LEN: usize = DH_LEN + DIGEST_LEN;

fn dh_prime() -> Result<BigUint> {
    BigUint::parse_bytes(DH_PRIME_HEX, 16)
        .ok_or_else(|| TorError::Internal("bad DH prime constant".into()))
}

/// Big-endian, left-padded to [`DH_LEN`]
fn to_dh_bytes(n: &BigUint) -> Result<Zeroizing<Vec<u8>>> {
    let raw = Zeroizing::new(n.to_bytes_be());
    if raw.len() > DH_LEN {
        return Err(TorError::Internal("DH value wider than the group".into()));
    }
    let mut out = Zeroizing::new(vec![0u8; DH_LEN - raw.len()]);
    out.extend_from_slice(&raw);
    Ok(out)
}

/// Parse a peer's DH public value, rejecting anything outside (1, p-1)
fn parse_dh_public(bytes: &[u8], p: &BigUint) -> Result<BigUint> {
    let value = BigUint::from_bytes_be(bytes);
    let one = BigUint::from(1u32);
    let p_minus_one = p - &one;
    if value <= one || value >= p_minus_one {
        return Err(TorError::handshake("TAP: invalid DH public value"));
    }
    Ok(value)
}

fn dh_keypair<R: RngCore + CryptoRng>(rng: &mut R, p: &BigUint) -> Result<(Zeroizing<Vec<u8>>, Zeroizing<Vec<u8>>)> {
    let mut x = Zeroizing::new(vec![0u8; DH_PRIVATE_LEN]);
    rng.fill_bytes(&mut x);
    let gx = BigUint::from(2u32).modpow(&BigUint::from_bytes_be(&x), p);
    Ok((x, to_dh_bytes(&gx)?))
}

fn shared_secret(private: &[u8], peer: &BigUint, p: &BigUint) -> Result<Zeroizing<Vec<u8>>> {
    to_dh_bytes(&peer.modpow(&BigUint::from_bytes_be(private), p))
}

fn apply_ctr(key: &[u8; KEY_LEN], data: &mut [u8]) {
    let iv = [0u8; 16];
    let mut cipher = Aes128Ctr::new(key.into(), (&iv).into());
    cipher.apply_keystream(data);
}

/// Client half of a TAP handshake
pub struct TapClient {
    x: Zeroizing<Vec<u8>>,
}

impl TapClient {
    /// Generate x and the hybrid-encrypted onion skin for `onion_key`
    pub fn new<R: RngCore + CryptoRng>(
        rng: &mut R,
        onion_key: &RsaPublicKey,
    ) -> Result<(Self, Vec<u8>)> {
        if onion_key.size() != PK_ENC_LEN {
            return Err(TorError::InvalidRelay(format!(
                "TAP onion key must be 1024 bits, got {}",
                onion_key.size() * 8
            )));
        }
        let p = dh_prime()?;
        let (x, gx) = dh_keypair(rng, &p)?;

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        rng.fill_bytes(&mut key[..]);

        let mut block = Zeroizing::new(Vec::with_capacity(KEY_LEN + RSA_PART));
        block.extend_from_slice(&key[..]);
        block.extend_from_slice(&gx[..RSA_PART]);
        let mut onionskin = onion_key
            .encrypt(rng, Oaep::new::<Sha1>(), &block)
            .map_err(|e| TorError::Crypto(format!("TAP RSA encryption failed: {}", e)))?;

        let mut tail = gx[RSA_PART..].to_vec();
        apply_ctr(&key, &mut tail);
        onionskin.extend_from_slice(&tail);
        debug_assert_eq!(onionskin.len(), TAP_C_HANDSHAKE_LEN);

        Ok((Self { x }, onionskin))
    }

    /// Process the relay's g^y | KH reply
    pub fn complete(self, reply: &[u8]) -> Result<HandshakeOutput> {
        if reply.len() < TAP_S_HANDSHAKE_LEN {
            return Err(TorError::protocol(format!(
                "TAP reply too short: {} bytes",
                reply.len()
            )));
        }
        let p = dh_prime()?;
        let gy = parse_dh_public(&reply[..DH_LEN], &p)?;
        Ok(HandshakeOutput {
            kdf: KdfKind::Tor,
            shared_secret: shared_secret(&self.x, &gy, &p)?,
            peer_verify: reply[DH_LEN..TAP_S_HANDSHAKE_LEN].to_vec(),
        })
    }
}

/// Relay side of TAP: decrypt the onion skin with the private onion key
pub fn server_reply<R: RngCore + CryptoRng>(
    rng: &mut R,
    onion_key: &RsaPrivateKey,
    onionskin: &[u8],
) -> Result<(Vec<u8>, HopKeys)> {
    if onionskin.len() < TAP_C_HANDSHAKE_LEN {
        return Err(TorError::protocol("TAP onion skin too short"));
    }
    let block = Zeroizing::new(
        onion_key
            .decrypt(Oaep::new::<Sha1>(), &onionskin[..PK_ENC_LEN])
            .map_err(|_| TorError::handshake("TAP onion skin did not decrypt"))?,
    );
    if block.len() != KEY_LEN + RSA_PART {
        return Err(TorError::handshake("TAP onion skin has the wrong size"));
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&block[..KEY_LEN]);

    let mut gx = Zeroizing::new(block[KEY_LEN..].to_vec());
    let mut tail = onionskin[PK_ENC_LEN..TAP_C_HANDSHAKE_LEN].to_vec();
    apply_ctr(&key, &mut tail);
    gx.extend_from_slice(&tail);

    let p = dh_prime()?;
    let gx = parse_dh_public(&gx, &p)?;
    let (y, gy) = dh_keypair(rng, &p)?;
    let secret = shared_secret(&y, &gx, &p)?;
    let keys = HopKeys::derive(KdfKind::Tor, &secret)?;

    let mut reply = gy.to_vec();
    reply.extend_from_slice(&keys.verify);
    Ok((reply, keys.reversed()))
}
