//! Stateful frame ciphers.
//!
//! Implements the SSH-style `chacha20-poly1305` construction used by the
//! encrypted transport: two independent cipher streams sharing one 8-byte IV.
//!
//! - [`SizeCipher`]: raw ChaCha20 keyed with K1, XORs the 4-byte length
//!   prefix so frame boundaries stay confidential but can be parsed before
//!   the payload arrives.
//! - [`BodyCipher`]: ChaCha20 keyed with K2 plus a Poly1305 one-time MAC.
//!   The MAC key is the first 32 bytes of keystream block 0; payload
//!   encryption starts at block 1. The tag is computed over the ciphertext
//!   followed by zero padding to 16 bytes and the little-endian lengths
//!   block, and is compared in constant time.
//!
//! Both ciphers use the original 64-bit-nonce ChaCha20 variant, which is
//! what gives the construction its 8-byte IV.

use chacha20::cipher::{NewCipher, StreamCipher};
use chacha20::{ChaCha20Legacy, Key, LegacyNonce};
use poly1305::universal_hash::{KeyInit, UniversalHash};
use poly1305::{Block, Poly1305};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// Size of a cipher key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of the shared IV in bytes.
pub const IV_SIZE: usize = 8;

/// Size of the Poly1305 authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Raw ChaCha20 stream cipher for the encrypted length prefix.
pub struct SizeCipher {
    cipher: ChaCha20Legacy,
}

impl SizeCipher {
    /// Initialize the cipher with a traffic key and the current IV.
    pub fn new(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> Self {
        Self {
            cipher: ChaCha20Legacy::new(Key::from_slice(key), LegacyNonce::from_slice(iv)),
        }
    }

    /// XOR `buf` with the keystream, in place. Encryption and decryption
    /// are the same operation.
    pub fn crypt(&mut self, buf: &mut [u8]) {
        self.cipher.apply_keystream(buf);
    }
}

impl core::fmt::Debug for SizeCipher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SizeCipher").finish()
    }
}

/// ChaCha20-Poly1305 state for one frame direction.
///
/// Unlike a sealed AEAD API, the cipher and MAC halves are exposed
/// separately: a receiver authenticates the ciphertext and verifies the tag
/// *before* decrypting, so a forged frame never touches the cipher state.
pub struct BodyCipher {
    cipher: ChaCha20Legacy,
    mac: Poly1305,
    ciphertext_len: u64,
    tag: [u8; TAG_SIZE],
}

impl BodyCipher {
    /// Initialize the cipher with a traffic key and the current IV.
    ///
    /// Consumes keystream block 0 to key the Poly1305 MAC; payload bytes are
    /// enciphered from block 1 onward.
    pub fn new(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> Self {
        let mut cipher = ChaCha20Legacy::new(Key::from_slice(key), LegacyNonce::from_slice(iv));
        let mut block0 = Zeroizing::new([0u8; 64]);
        cipher.apply_keystream(&mut *block0);
        let mac = Poly1305::new(poly1305::Key::from_slice(&block0[..32]));
        Self {
            cipher,
            mac,
            ciphertext_len: 0,
            tag: [0u8; TAG_SIZE],
        }
    }

    /// Encipher `data` in place and feed the resulting ciphertext to the MAC.
    pub fn encrypt(&mut self, data: &mut [u8]) {
        self.cipher.apply_keystream(data);
        self.mac.update_padded(data);
        self.ciphertext_len += data.len() as u64;
    }

    /// Decipher `data` in place. Does not touch the MAC; the ciphertext must
    /// have been fed through [`auth`](Self::auth) and verified first.
    pub fn decrypt(&mut self, data: &mut [u8]) {
        self.cipher.apply_keystream(data);
    }

    /// Feed ciphertext to the MAC without altering the cipher state.
    pub fn auth(&mut self, data: &[u8]) {
        self.mac.update_padded(data);
        self.ciphertext_len += data.len() as u64;
    }

    /// Compute and record the tag for the frame processed so far.
    ///
    /// The MAC input is closed with the 16-byte lengths block
    /// (LE64 associated-data length, always zero here, then LE64
    /// ciphertext length).
    pub fn finalize(&mut self) -> [u8; TAG_SIZE] {
        let mut lengths = [0u8; TAG_SIZE];
        lengths[8..].copy_from_slice(&self.ciphertext_len.to_le_bytes());

        let mut mac = self.mac.clone();
        mac.update(core::slice::from_ref(Block::from_slice(&lengths)));
        self.tag.copy_from_slice(mac.finalize().as_slice());
        self.tag
    }

    /// Constant-time comparison of the last [`finalize`](Self::finalize)d
    /// tag against a received tag.
    pub fn verify(&self, tag: &[u8; TAG_SIZE]) -> bool {
        bool::from(self.tag[..].ct_eq(&tag[..]))
    }
}

impl core::fmt::Debug for BodyCipher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BodyCipher")
            .field("ciphertext_len", &self.ciphertext_len)
            .finish()
    }
}
