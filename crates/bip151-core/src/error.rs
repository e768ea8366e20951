//! Error types for protocol operations.

use thiserror::Error;

/// Result type alias for protocol operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Protocol operation errors.
///
/// Handshake violations are returned synchronously by the operation that
/// detects them; inbound parsing failures are surfaced through the session's
/// `Error` event instead, after which the parser refuses further input.
#[derive(Debug, Error)]
pub enum Error {
    /// The handshake promise already settled; no further progress allowed.
    #[error("handshake already completed")]
    HandshakeCompleted,

    /// An encinit was built or received twice.
    #[error("duplicate encinit")]
    DuplicateInit,

    /// An encack was built or received twice.
    #[error("duplicate encack")]
    DuplicateAck,

    /// An encack arrived before our encinit was sent.
    #[error("unsolicited encack")]
    UnsolicitedAck,

    /// The peer proposed a cipher other than the one negotiated.
    #[error("cipher mismatch: expected {expected}, got {got}")]
    CipherMismatch {
        /// Locally configured cipher identifier.
        expected: u8,
        /// Cipher identifier received from the peer.
        got: u8,
    },

    /// A re-key signal arrived before the handshake finished.
    #[error("re-key before handshake completion")]
    EarlyRekey,

    /// Encryption has not been negotiated for this direction yet.
    #[error("encryption not negotiated")]
    HandshakeIncomplete,

    /// The command is empty, too long, or not ASCII.
    #[error("invalid command: {0:?}")]
    InvalidCommand(String),

    /// The framed payload would exceed the maximum message size.
    #[error("packet too large: {0} bytes")]
    OversizedPacket(usize),

    /// The decrypted length prefix is out of bounds.
    #[error("Bad packet size: {0}.")]
    BadPacketSize(u32),

    /// Tag verification failed for an inbound frame.
    #[error("Bad tag: {0}.")]
    BadTag(String),

    /// An inner message could not be parsed.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// The handshake wait elapsed before completion.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The session was destroyed while a handshake wait was outstanding.
    #[error("stream destroyed")]
    StreamDestroyed,

    /// Cryptographic error.
    #[error("Crypto error: {0}")]
    Crypto(#[from] bip151_crypto::Error),
}
