//! Per-hop cryptography
//!
//! - KDF-TOR (iterated SHA-1) for the fast and TAP handshakes
//! - HKDF-SHA256 expansion for ntor
//! - AES-128-CTR for the layered encryption, one stateful keystream per
//!   direction per hop
//! - Running SHA-1 digests for relay cell recognition
//!
//! Security: All key material is zeroized on drop to prevent memory leakage.

use super::relay_cell::{digest_matches, RelayCell};
use crate::error::{Result, TorError};
use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hkdf::Hkdf;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// AES-128-CTR cipher type
type Aes128Ctr = Ctr128BE<Aes128>;

/// Digest seed length (SHA-1 output)
pub const DIGEST_LEN: usize = 20;

/// AES-128 key length
pub const CIPHER_KEY_LEN: usize = 16;

/// Bytes of KDF-TOR output consumed by [`HopKeys`]
const KDF_TOR_LEN: usize = 100;

/// ntor key expansion label
const M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";

/// Which key derivation turns a handshake's shared secret into hop keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdfKind {
    /// Iterated SHA-1 (CREATE_FAST and TAP)
    Tor,
    /// HMAC-SHA256 extract/expand (ntor)
    Ntor,
}

/// Key material for one hop
///
/// SECURITY: Keys are automatically zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct HopKeys {
    /// Handshake verification value (KH for KDF-TOR, AUTH for ntor)
    pub verify: Vec<u8>,

    /// Forward digest seed (Df)
    pub forward_digest: [u8; DIGEST_LEN],

    /// Backward digest seed (Db)
    pub backward_digest: [u8; DIGEST_LEN],

    /// Forward encryption key (Kf)
    pub forward_key: [u8; CIPHER_KEY_LEN],

    /// Backward encryption key (Kb)
    pub backward_key: [u8; CIPHER_KEY_LEN],
}

impl HopKeys {
    /// Derive hop keys from a handshake's shared secret
    ///
    /// KDF-TOR layout: KH (20) | Df (20) | Db (20) | Kf (16) | Kb (16).
    /// For ntor the secret is the handshake's `secret_input`; KEY_SEED and
    /// AUTH come out of it and KEY_SEED is expanded into
    /// Df (20) | Db (20) | Kf (16) | Kb (16).
    pub fn derive(kind: KdfKind, shared_secret: &[u8]) -> Result<Self> {
        match kind {
            KdfKind::Tor => {
                let k = kdf_tor(shared_secret, KDF_TOR_LEN);
                Ok(Self::split(k[..DIGEST_LEN].to_vec(), &k[DIGEST_LEN..]))
            }
            KdfKind::Ntor => {
                let material = super::handshake::ntor::key_material(shared_secret)?;
                let okm = ntor_expand(&material.key_seed[..], 2 * DIGEST_LEN + 2 * CIPHER_KEY_LEN)?;
                Ok(Self::split(material.auth.to_vec(), &okm))
            }
        }
    }

    /// Split Df | Db | Kf | Kb out of `okm`
    fn split(verify: Vec<u8>, okm: &[u8]) -> Self {
        let mut keys = Self {
            verify,
            forward_digest: [0u8; DIGEST_LEN],
            backward_digest: [0u8; DIGEST_LEN],
            forward_key: [0u8; CIPHER_KEY_LEN],
            backward_key: [0u8; CIPHER_KEY_LEN],
        };
        keys.forward_digest.copy_from_slice(&okm[0..20]);
        keys.backward_digest.copy_from_slice(&okm[20..40]);
        keys.forward_key.copy_from_slice(&okm[40..56]);
        keys.backward_key.copy_from_slice(&okm[56..72]);
        keys
    }

    /// The same keys seen from the relay's side of the hop
    pub fn reversed(&self) -> Self {
        Self {
            verify: self.verify.clone(),
            forward_digest: self.backward_digest,
            backward_digest: self.forward_digest,
            forward_key: self.backward_key,
            backward_key: self.forward_key,
        }
    }
}

impl fmt::Debug for HopKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HopKeys { .. }")
    }
}

/// KDF-TOR: SHA1(K0 | 00) | SHA1(K0 | 01) | ... truncated to `len`
pub fn kdf_tor(seed: &[u8], len: usize) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(Vec::with_capacity(len + DIGEST_LEN));
    let mut counter = 0u8;
    while out.len() < len {
        let mut h = Sha1::new();
        h.update(seed);
        h.update([counter]);
        out.extend_from_slice(&h.finalize());
        counter = counter.wrapping_add(1);
    }
    out.truncate(len);
    out
}

/// Expand an ntor KEY_SEED with HKDF-SHA256
///
/// KEY_SEED is already the output of HMAC-SHA256, so it is used directly as
/// the PRK and only the expand step runs.
pub fn ntor_expand(key_seed: &[u8], len: usize) -> Result<Zeroizing<Vec<u8>>> {
    let hkdf = Hkdf::<Sha256>::from_prk(key_seed)
        .map_err(|_| TorError::Crypto("Invalid PRK length".into()))?;
    let mut okm = Zeroizing::new(vec![0u8; len]);
    hkdf.expand(M_EXPAND, &mut okm)
        .map_err(|_| TorError::Crypto("Key expansion failed".into()))?;
    Ok(okm)
}

/// Symmetric state of one established hop
///
/// Ciphers run for the lifetime of the circuit and are never reset. The
/// running digests only ever move forward; a peel attempt works on a clone
/// and commits it only when the cell is recognized.
pub struct HopCryptoState {
    verify: Zeroizing<Vec<u8>>,
    forward_digest: Sha1,
    backward_digest: Sha1,
    forward_cipher: Aes128Ctr,
    backward_cipher: Aes128Ctr,
}

impl HopCryptoState {
    /// Initialize from freshly derived keys (IVs start at zero)
    pub fn new(keys: &HopKeys) -> Self {
        let iv = [0u8; 16];
        Self {
            verify: Zeroizing::new(keys.verify.clone()),
            forward_digest: Sha1::new_with_prefix(keys.forward_digest),
            backward_digest: Sha1::new_with_prefix(keys.backward_digest),
            forward_cipher: Aes128Ctr::new((&keys.forward_key).into(), (&iv).into()),
            backward_cipher: Aes128Ctr::new((&keys.backward_key).into(), (&iv).into()),
        }
    }

    /// One-shot check of the handshake verification value
    pub fn verify_peer(&self, candidate: &[u8]) -> bool {
        self.verify.len() == candidate.len() && bool::from(self.verify.ct_eq(candidate))
    }

    /// Fold a cell this hop's peer will recognize into the forward digest and
    /// embed the first four bytes of the result
    ///
    /// Must run on the plaintext, before any [`encrypt_forward`](Self::encrypt_forward).
    pub fn originate(&mut self, cell: &mut RelayCell) {
        cell.clear_digest();
        self.forward_digest.update(cell.payload());
        let digest = self.forward_digest.clone().finalize();
        cell.embed_digest([digest[0], digest[1], digest[2], digest[3]]);
    }

    /// Add this hop's layer to an outbound payload
    pub fn encrypt_forward(&mut self, payload: &mut [u8]) {
        self.forward_cipher.apply_keystream(payload);
    }

    /// Peel this hop's layer off an inbound payload and test recognition
    ///
    /// The keystream is applied unconditionally so a cell meant for a later
    /// hop comes out ready for that hop's attempt.
    pub fn decrypt_backward(&mut self, payload: &mut [u8]) -> bool {
        self.backward_cipher.apply_keystream(payload);
        match digest_matches(payload, &self.backward_digest) {
            Some(advanced) => {
                self.backward_digest = advanced;
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for HopCryptoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HopCryptoState { .. }")
    }
}
