//! Cryptographic primitives for the BIP151 encrypted transport.
//!
//! This crate implements the cryptographic foundations of the link
//! encryption engine:
//! - Ephemeral key exchange over secp256k1 (X-coordinate shared secret)
//! - HKDF-SHA256 session key schedule and SHA256d re-key derivation
//! - SSH-style ChaCha20-Poly1305 framing ciphers (separate size cipher,
//!   MAC-then-decrypt body cipher)
//!
//! Security posture:
//! - No unsafe code
//! - Secrets are wrapped in `Zeroizing` or erased on drop
//! - Tag comparisons are constant time via the `subtle` crate
//! - No logging of key material

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cipher;
pub mod ecdh;
pub mod error;
pub mod kdf;

pub use cipher::{BodyCipher, SizeCipher, IV_SIZE, KEY_SIZE, TAG_SIZE};
pub use ecdh::{EcdhKeypair, PUBLIC_KEY_SIZE};
pub use error::{Error, Result};
