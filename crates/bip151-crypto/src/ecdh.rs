//! Ephemeral secp256k1 key exchange.
//!
//! Implements the Elliptic Curve Diffie-Hellman exchange over secp256k1, the
//! same curve used by Bitcoin itself. The shared secret is the 32-byte X
//! coordinate of the shared point, equal to bytes 1..33 of its compressed
//! serialization (the sign byte is discarded).
//!
//! # Security
//!
//! - A fresh keypair is generated per session; the secret scalar is erased
//!   when the keypair is dropped.
//! - Shared secrets are wrapped in `Zeroizing<>` so they are cleared from
//!   memory as soon as the key schedule has consumed them.
//!
//! # Example
//!
//! ```
//! use bip151_crypto::ecdh::EcdhKeypair;
//!
//! # fn example() -> Result<(), bip151_crypto::Error> {
//! let alice = EcdhKeypair::generate();
//! let bob = EcdhKeypair::generate();
//!
//! let alice_secret = alice.exchange(&bob.public_key())?;
//! let bob_secret = bob.exchange(&alice.public_key())?;
//!
//! assert_eq!(*alice_secret, *bob_secret);
//! # Ok(())
//! # }
//! ```

use crate::{Error, Result};
use secp256k1::ecdh::shared_secret_point;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use zeroize::{Zeroize, Zeroizing};

/// Size of a compressed secp256k1 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 33;

/// Size of the derived shared secret in bytes.
pub const SHARED_SECRET_SIZE: usize = 32;

/// Ephemeral secp256k1 keypair for Diffie-Hellman key exchange.
///
/// The secret scalar is erased when the keypair is dropped; clones erase
/// their own copy.
#[derive(Clone)]
pub struct EcdhKeypair {
    secret_key: SecretKey,
    public_key: PublicKey,
}

impl EcdhKeypair {
    /// Generate a new random keypair using the system CSPRNG.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut rand::thread_rng());
        Self {
            secret_key,
            public_key,
        }
    }

    /// Get the compressed public key (33 bytes, 0x02/0x03 prefix).
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public_key.serialize()
    }

    /// Perform the key exchange with a peer's compressed public key.
    ///
    /// Returns the X coordinate of the shared point, wrapped in `Zeroizing`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPublicKey`] if `peer_public` is not a valid
    /// compressed curve point.
    pub fn exchange(
        &self,
        peer_public: &[u8; PUBLIC_KEY_SIZE],
    ) -> Result<Zeroizing<[u8; SHARED_SECRET_SIZE]>> {
        let peer = PublicKey::from_slice(peer_public)
            .map_err(|e| Error::InvalidPublicKey(e.to_string()))?;

        // 64 bytes of affine coordinates: x || y, big-endian.
        let mut point = shared_secret_point(&peer, &self.secret_key);
        let mut secret = Zeroizing::new([0u8; SHARED_SECRET_SIZE]);
        secret.copy_from_slice(&point[..SHARED_SECRET_SIZE]);
        point.zeroize();

        Ok(secret)
    }

    /// Create a keypair from a raw secret scalar.
    ///
    /// This is primarily used for testing with known vectors. In production,
    /// use `generate()` instead.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPrivateKey`] if the scalar is zero or exceeds
    /// the curve order.
    #[doc(hidden)]
    pub fn from_secret(secret: [u8; 32]) -> Result<Self> {
        let secp = Secp256k1::new();
        let secret_key =
            SecretKey::from_slice(&secret).map_err(|e| Error::InvalidPrivateKey(e.to_string()))?;
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Ok(Self {
            secret_key,
            public_key,
        })
    }
}

impl Drop for EcdhKeypair {
    fn drop(&mut self) {
        self.secret_key.non_secure_erase();
    }
}

impl core::fmt::Debug for EcdhKeypair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EcdhKeypair")
            .field("public_key", &self.public_key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::Scalar;

    /// Test that both sides of the exchange arrive at the same secret.
    #[test]
    fn test_exchange_symmetry() {
        let alice = EcdhKeypair::generate();
        let bob = EcdhKeypair::generate();

        let alice_secret = alice.exchange(&bob.public_key()).unwrap();
        let bob_secret = bob.exchange(&alice.public_key()).unwrap();

        assert_eq!(*alice_secret, *bob_secret);
        assert_ne!(*alice_secret, [0u8; 32]);
    }

    /// The shared secret must equal the X coordinate of the shared point,
    /// i.e. bytes 1..33 of its compressed serialization. Verified against an
    /// independent scalar multiplication.
    #[test]
    fn test_secret_is_x_coordinate() {
        let secp = Secp256k1::new();
        let alice = EcdhKeypair::from_secret([0x11u8; 32]).unwrap();
        let bob = EcdhKeypair::from_secret([0x22u8; 32]).unwrap();

        let secret = alice.exchange(&bob.public_key()).unwrap();

        let bob_point = PublicKey::from_slice(&bob.public_key()).unwrap();
        let tweak = Scalar::from(SecretKey::from_slice(&[0x11u8; 32]).unwrap());
        let shared_point = bob_point.mul_tweak(&secp, &tweak).unwrap();
        let compressed = shared_point.serialize();

        assert_eq!(&*secret, &compressed[1..33]);
    }

    /// Test that a malformed compressed point is rejected.
    #[test]
    fn test_reject_invalid_public_key() {
        let alice = EcdhKeypair::generate();
        let bad_public = [0u8; PUBLIC_KEY_SIZE];

        let result = alice.exchange(&bad_public);
        assert!(matches!(result, Err(Error::InvalidPublicKey(_))));
    }

    /// Test that the zero scalar is rejected.
    #[test]
    fn test_reject_zero_secret() {
        let result = EcdhKeypair::from_secret([0u8; 32]);
        assert!(matches!(result, Err(Error::InvalidPrivateKey(_))));
    }

    /// Test that repeated exchanges with the same keys are deterministic.
    #[test]
    fn test_deterministic() {
        let alice = EcdhKeypair::generate();
        let bob = EcdhKeypair::generate();

        let secret1 = alice.exchange(&bob.public_key()).unwrap();
        let secret2 = alice.exchange(&bob.public_key()).unwrap();

        assert_eq!(*secret1, *secret2);
    }

    #[test]
    fn test_public_key_prefix() {
        let keypair = EcdhKeypair::generate();
        let public = keypair.public_key();
        assert!(public[0] == 0x02 || public[0] == 0x03);
    }
}
