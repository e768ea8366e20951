//! Key derivation for the encrypted session.
//!
//! Implements the HKDF-SHA256 key schedule:
//! - Extract with the ASCII salt `"bitcoinecdh"` over the ECDH secret
//!   concatenated with the one-byte cipher identifier.
//! - Expand into the two 32-byte traffic keys (`"BitcoinK1"`, `"BitcoinK2"`)
//!   and the 32-byte session identifier (`"BitcoinSessionID"`).
//!
//! Re-keying derives replacement traffic keys without a new key exchange:
//! `Kn' = SHA256(SHA256(SID || Kn))`.

use crate::{Error, Result};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// HKDF-Extract salt for the session key schedule.
pub const KDF_SALT: &[u8] = b"bitcoinecdh";

/// HKDF-Expand info for the first traffic key (size cipher).
pub const INFO_K1: &[u8] = b"BitcoinK1";

/// HKDF-Expand info for the second traffic key (body cipher).
pub const INFO_K2: &[u8] = b"BitcoinK2";

/// HKDF-Expand info for the session identifier.
pub const INFO_SESSION_ID: &[u8] = b"BitcoinSessionID";

/// Keys established for one direction of a session.
pub struct SessionKeys {
    /// Traffic key for the payload-size cipher.
    pub k1: Zeroizing<[u8; 32]>,
    /// Traffic key for the authenticated body cipher.
    pub k2: Zeroizing<[u8; 32]>,
    /// Session identifier. Not itself a secret, but unique per handshake.
    pub session_id: [u8; 32],
}

/// Generic HKDF-SHA256 derivation per RFC 5869.
///
/// # Arguments
/// * `ikm` - Input key material
/// * `salt` - Salt value (empty slice for no salt)
/// * `info` - Context and application-specific information
/// * `okm` - Output buffer to fill with derived key material
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8], okm: &mut [u8]) -> Result<()> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    hk.expand(info, okm)
        .map_err(|_| Error::KeyDerivation("HKDF expansion failed".into()))
}

/// Derive the session keys for one direction from an ECDH shared secret.
///
/// The input key material is `secret || cipher` (33 bytes); the salt is
/// [`KDF_SALT`]. Both peers derive identical keys for a direction because
/// the ECDH secret and the negotiated cipher identifier agree.
pub fn derive_session_keys(secret: &[u8; 32], cipher: u8) -> Result<SessionKeys> {
    let mut ikm = Zeroizing::new([0u8; 33]);
    ikm[..32].copy_from_slice(secret);
    ikm[32] = cipher;

    let mut k1 = Zeroizing::new([0u8; 32]);
    let mut k2 = Zeroizing::new([0u8; 32]);
    let mut session_id = [0u8; 32];

    hkdf_sha256(&*ikm, KDF_SALT, INFO_K1, &mut *k1)?;
    hkdf_sha256(&*ikm, KDF_SALT, INFO_K2, &mut *k2)?;
    hkdf_sha256(&*ikm, KDF_SALT, INFO_SESSION_ID, &mut session_id)?;

    Ok(SessionKeys {
        k1,
        k2,
        session_id,
    })
}

/// Derive a replacement traffic key: `SHA256(SHA256(session_id || key))`.
pub fn rekey(session_id: &[u8; 32], key: &[u8; 32]) -> Zeroizing<[u8; 32]> {
    let mut buf = Zeroizing::new([0u8; 64]);
    buf[..32].copy_from_slice(session_id);
    buf[32..].copy_from_slice(key);

    let first = Sha256::digest(&*buf);
    let second = Sha256::digest(first);

    let mut next = Zeroizing::new([0u8; 32]);
    next.copy_from_slice(&second);
    next
}
