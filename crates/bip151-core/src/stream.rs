//! Per-direction encrypted stream state.
//!
//! Each direction of a session owns a [`Stream`]: the ephemeral keypair, the
//! derived traffic keys, the IV/sequence discipline, and the pair of frame
//! ciphers (size cipher under K1, authenticated body cipher under K2).
//!
//! The 8-byte IV is `LE32(seq) || 0x00000000`; the sequence counter advances
//! exactly once per frame and wraps at 2^32 to stay wire-compatible. Both
//! ciphers are re-initialized from the current keys whenever the IV changes.

use crate::packet::Cipher;
use crate::{Error, Result};
use bip151_crypto::cipher::{BodyCipher, SizeCipher, IV_SIZE, TAG_SIZE};
use bip151_crypto::ecdh::{EcdhKeypair, PUBLIC_KEY_SIZE};
use bip151_crypto::kdf;
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

/// Bytes processed in one direction before a re-key is triggered (1 GiB).
pub const HIGH_WATER_MARK: u64 = 1024 * (1 << 20);

/// Elapsed time before a re-key is triggered.
pub const REKEY_INTERVAL: Duration = Duration::from_secs(10);

/// One direction of an encrypted session.
pub struct Stream {
    keypair: EcdhKeypair,
    cipher: Cipher,
    peer_public_key: Option<[u8; PUBLIC_KEY_SIZE]>,
    k1: Option<Zeroizing<[u8; 32]>>,
    k2: Option<Zeroizing<[u8; 32]>>,
    session_id: Option<[u8; 32]>,
    seq: u32,
    iv: [u8; IV_SIZE],
    size_cipher: Option<SizeCipher>,
    body_cipher: Option<BodyCipher>,
    processed: u64,
    last_rekey: Instant,
}

impl Stream {
    /// Create a stream with a fresh ephemeral keypair.
    pub fn new(cipher: Cipher) -> Self {
        Self::with_keypair(EcdhKeypair::generate(), cipher)
    }

    /// Create a stream around an existing keypair.
    ///
    /// A session shares one ephemeral keypair between its two directions so
    /// that both peers derive a single session identifier.
    pub(crate) fn with_keypair(keypair: EcdhKeypair, cipher: Cipher) -> Self {
        Self {
            keypair,
            cipher,
            peer_public_key: None,
            k1: None,
            k2: None,
            session_id: None,
            seq: 0,
            iv: [0u8; IV_SIZE],
            size_cipher: None,
            body_cipher: None,
            processed: 0,
            last_rekey: Instant::now(),
        }
    }

    /// Our compressed public key.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.keypair.public_key()
    }

    /// The configured cipher.
    pub fn cipher(&self) -> Cipher {
        self.cipher
    }

    /// The peer's public key, once established.
    pub fn peer_public_key(&self) -> Option<&[u8; PUBLIC_KEY_SIZE]> {
        self.peer_public_key.as_ref()
    }

    /// The 32-byte session identifier, once established.
    pub fn session_id(&self) -> Option<&[u8; 32]> {
        self.session_id.as_ref()
    }

    /// Current sequence number.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Whether keys have been established for this direction.
    pub fn is_ready(&self) -> bool {
        self.session_id.is_some()
    }

    /// Establish the traffic keys from the peer's public key.
    ///
    /// Computes the ECDH shared secret (the X coordinate of the shared
    /// point), runs the HKDF schedule, and initializes both ciphers at
    /// sequence zero. May be called again to renegotiate from scratch.
    pub fn init(&mut self, peer_public: &[u8; PUBLIC_KEY_SIZE]) -> Result<()> {
        let secret = self.keypair.exchange(peer_public)?;
        let keys = kdf::derive_session_keys(&secret, self.cipher.to_u8())?;

        self.peer_public_key = Some(*peer_public);
        self.k1 = Some(keys.k1);
        self.k2 = Some(keys.k2);
        self.session_id = Some(keys.session_id);
        self.seq = 0;
        self.write_iv();
        self.reset_ciphers()?;
        self.processed = 0;
        self.last_rekey = Instant::now();
        Ok(())
    }

    /// Account for `frame_len` transferred bytes and report whether the
    /// direction is due for a re-key (10 seconds elapsed or 1 GiB moved).
    ///
    /// Resets both trigger counters when returning `true`; applying the
    /// re-key itself is the caller's job.
    pub fn should_rekey(&mut self, frame_len: usize) -> bool {
        self.processed += frame_len as u64;
        if self.last_rekey.elapsed() >= REKEY_INTERVAL || self.processed >= HIGH_WATER_MARK {
            self.processed = 0;
            self.last_rekey = Instant::now();
            return true;
        }
        false
    }

    /// Rotate the traffic keys in place: `Kn' = SHA256d(SID || Kn)`.
    ///
    /// The sequence counter and IV are preserved; both ciphers restart under
    /// the new keys.
    pub fn rekey(&mut self) -> Result<()> {
        let session_id = self.session_id.ok_or(Error::HandshakeIncomplete)?;
        let (k1, k2) = match (&self.k1, &self.k2) {
            (Some(k1), Some(k2)) => (k1, k2),
            _ => return Err(Error::HandshakeIncomplete),
        };
        let next_k1 = kdf::rekey(&session_id, k1);
        let next_k2 = kdf::rekey(&session_id, k2);
        self.k1 = Some(next_k1);
        self.k2 = Some(next_k2);
        tracing::debug!(seq = self.seq, "stream re-keyed");
        self.reset_ciphers()
    }

    /// Replace the traffic keys with externally derived ones (used by an
    /// authenticated re-key provider). Sequence and IV are preserved.
    pub fn rekey_with(
        &mut self,
        k1: Zeroizing<[u8; 32]>,
        k2: Zeroizing<[u8; 32]>,
    ) -> Result<()> {
        if self.session_id.is_none() {
            return Err(Error::HandshakeIncomplete);
        }
        self.k1 = Some(k1);
        self.k2 = Some(k2);
        self.reset_ciphers()
    }

    /// Advance the sequence counter after a frame, rewrite the IV, and
    /// restart both ciphers under the unchanged keys.
    pub fn sequence(&mut self) -> Result<()> {
        self.seq = self.seq.wrapping_add(1);
        self.write_iv();
        self.reset_ciphers()
    }

    /// Encrypt the 4-byte length prefix in place.
    pub fn encrypt_size(&mut self, buf: &mut [u8]) -> Result<()> {
        self.size_cipher
            .as_mut()
            .ok_or(Error::HandshakeIncomplete)?
            .crypt(buf);
        Ok(())
    }

    /// Decrypt the 4-byte length prefix in place and read it.
    pub fn decrypt_size(&mut self, buf: &mut [u8; 4]) -> Result<u32> {
        self.size_cipher
            .as_mut()
            .ok_or(Error::HandshakeIncomplete)?
            .crypt(buf);
        Ok(u32::from_le_bytes(*buf))
    }

    /// Encrypt payload bytes in place, feeding the ciphertext to the MAC.
    pub fn encrypt(&mut self, data: &mut [u8]) -> Result<()> {
        self.body_cipher
            .as_mut()
            .ok_or(Error::HandshakeIncomplete)?
            .encrypt(data);
        Ok(())
    }

    /// Decrypt payload bytes in place. The ciphertext must have been
    /// authenticated first.
    pub fn decrypt(&mut self, data: &mut [u8]) -> Result<()> {
        self.body_cipher
            .as_mut()
            .ok_or(Error::HandshakeIncomplete)?
            .decrypt(data);
        Ok(())
    }

    /// Feed received ciphertext to the MAC without touching cipher state.
    pub fn auth(&mut self, data: &[u8]) -> Result<()> {
        self.body_cipher
            .as_mut()
            .ok_or(Error::HandshakeIncomplete)?
            .auth(data);
        Ok(())
    }

    /// Compute the authentication tag for the frame processed so far.
    pub fn final_tag(&mut self) -> Result<[u8; TAG_SIZE]> {
        Ok(self
            .body_cipher
            .as_mut()
            .ok_or(Error::HandshakeIncomplete)?
            .finalize())
    }

    /// Constant-time comparison of the last computed tag with `tag`.
    pub fn verify(&self, tag: &[u8; TAG_SIZE]) -> bool {
        self.body_cipher.as_ref().is_some_and(|c| c.verify(tag))
    }

    fn write_iv(&mut self) {
        // Low 4 bytes track the sequence; high 4 bytes stay zero.
        self.iv[..4].copy_from_slice(&self.seq.to_le_bytes());
    }

    fn reset_ciphers(&mut self) -> Result<()> {
        let (k1, k2) = match (&self.k1, &self.k2) {
            (Some(k1), Some(k2)) => (k1, k2),
            _ => return Err(Error::HandshakeIncomplete),
        };
        self.size_cipher = Some(SizeCipher::new(k1, &self.iv));
        self.body_cipher = Some(BodyCipher::new(k2, &self.iv));
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_seq(&mut self, seq: u32) {
        self.seq = seq;
        self.write_iv();
    }
}

impl Default for Stream {
    fn default() -> Self {
        Self::new(Cipher::ChaCha20Poly1305)
    }
}

impl core::fmt::Debug for Stream {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Stream")
            .field("cipher", &self.cipher)
            .field("ready", &self.is_ready())
            .field("seq", &self.seq)
            .finish()
    }
}
