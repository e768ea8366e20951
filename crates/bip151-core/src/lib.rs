//! BIP151 session engine: handshake state machine and encrypted framing.
//!
//! This crate implements the core of a peer-to-peer link encryption layer:
//! - EncInit/EncAck wire messages and the four-way handshake state machine
//! - Per-direction streams with the HKDF key schedule, IV/sequence
//!   discipline, and periodic re-keying
//! - The framing codec turning `(command, body)` pairs into authenticated
//!   ciphertext frames and an arriving byte stream back into packet events
//!
//! Socket I/O, peer management, and the surrounding message encodings are
//! external collaborators; one task owns and drives each [`Session`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod buffer;
pub mod error;
pub mod packet;
pub mod session;
pub mod stream;

pub use error::{Error, Result};
pub use packet::{Cipher, EncAck, EncInit};
pub use session::{Event, RekeySidecar, Session};
pub use stream::Stream;
