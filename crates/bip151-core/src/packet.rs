//! Wire encoding for handshake messages and framed commands.
//!
//! Implements the out-of-band handshake messages with exact wire formats:
//! - EncInit (33-byte compressed public key + 1-byte cipher identifier)
//! - EncAck (33-byte compressed public key; all zeros signals a re-key)
//!
//! plus the Bitcoin compact-size varint and varstring primitives used to
//! frame `(command, body)` pairs inside an encrypted payload.
//!
//! All multi-byte integers are little-endian.

use crate::{Error, Result};
use bip151_crypto::PUBLIC_KEY_SIZE;
use bytes::Bytes;

/// Maximum decrypted payload size accepted from a peer, in bytes.
pub const MAX_MESSAGE: u32 = 12_000_000;

/// Minimum payload size: a one-byte command's varstring plus the four-byte
/// body length field.
pub const MIN_PAYLOAD: u32 = 6;

/// Maximum command length in bytes, by p2p convention.
pub const MAX_COMMAND_SIZE: usize = 12;

/// The reserved all-zero public key carried by a re-key acknowledgement.
pub const REKEY_PUBLIC_KEY: [u8; PUBLIC_KEY_SIZE] = [0u8; PUBLIC_KEY_SIZE];

/// Symmetric ciphers negotiable via EncInit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Cipher {
    /// ChaCha20-Poly1305, SSH variant: separate ChaCha20 size cipher,
    /// authenticated payload cipher. The only defined cipher.
    #[default]
    ChaCha20Poly1305 = 0,
}

impl Cipher {
    /// Convert from wire format.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::ChaCha20Poly1305),
            _ => None,
        }
    }

    /// Convert to wire format.
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Handshake initiation: the sender's ephemeral public key and the cipher it
/// expects for the frames it will receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncInit {
    /// Compressed secp256k1 public key (33 bytes).
    pub pubkey: [u8; PUBLIC_KEY_SIZE],
    /// Proposed cipher identifier.
    pub cipher: u8,
}

impl EncInit {
    /// Size of a serialized EncInit in bytes.
    pub const SIZE: usize = PUBLIC_KEY_SIZE + 1;

    /// Serialize to bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.pubkey);
        buf.push(self.cipher);
        buf
    }

    /// Parse from bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        check_len(data, Self::SIZE)?;
        let mut pubkey = [0u8; PUBLIC_KEY_SIZE];
        pubkey.copy_from_slice(&data[..PUBLIC_KEY_SIZE]);
        Ok(Self {
            pubkey,
            cipher: data[PUBLIC_KEY_SIZE],
        })
    }
}

/// Handshake acknowledgement carrying the responder's ephemeral public key.
///
/// An all-zero key is the in-band re-key signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncAck {
    /// Compressed secp256k1 public key (33 bytes), or all zeros.
    pub pubkey: [u8; PUBLIC_KEY_SIZE],
}

impl EncAck {
    /// Size of a serialized EncAck in bytes.
    pub const SIZE: usize = PUBLIC_KEY_SIZE;

    /// The re-key signal acknowledgement.
    pub fn rekey() -> Self {
        Self {
            pubkey: REKEY_PUBLIC_KEY,
        }
    }

    /// Whether this acknowledgement is the re-key signal.
    pub fn is_rekey(&self) -> bool {
        self.pubkey == REKEY_PUBLIC_KEY
    }

    /// Serialize to bytes.
    pub fn serialize(&self) -> Vec<u8> {
        self.pubkey.to_vec()
    }

    /// Parse from bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        check_len(data, Self::SIZE)?;
        let mut pubkey = [0u8; PUBLIC_KEY_SIZE];
        pubkey.copy_from_slice(&data[..PUBLIC_KEY_SIZE]);
        Ok(Self { pubkey })
    }
}

/// Size of a compact-size varint for `n`.
pub fn varint_size(n: u64) -> usize {
    match n {
        0..=0xFC => 1,
        0xFD..=0xFFFF => 3,
        0x1_0000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}

/// Append a compact-size varint to `buf`.
pub fn write_varint(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xFC => buf.push(n as u8),
        0xFD..=0xFFFF => {
            buf.push(0xFD);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xFFFF_FFFF => {
            buf.push(0xFE);
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xFF);
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }
}

/// Read a compact-size varint from `data` at `offset`, advancing it.
pub fn read_varint(data: &[u8], offset: &mut usize) -> Result<u64> {
    check_len(data, *offset + 1)?;
    let prefix = data[*offset];
    *offset += 1;
    match prefix {
        0xFD => {
            check_len(data, *offset + 2)?;
            let n = read_u16_le(&data[*offset..*offset + 2]) as u64;
            *offset += 2;
            Ok(n)
        }
        0xFE => {
            check_len(data, *offset + 4)?;
            let n = read_u32_le(&data[*offset..*offset + 4]) as u64;
            *offset += 4;
            Ok(n)
        }
        0xFF => {
            check_len(data, *offset + 8)?;
            let n = read_u64_le(&data[*offset..*offset + 8]);
            *offset += 8;
            Ok(n)
        }
        n => Ok(n as u64),
    }
}

/// Size of a varstring (compact-size length prefix plus the bytes).
pub fn varstring_size(s: &str) -> usize {
    varint_size(s.len() as u64) + s.len()
}

/// Append a varstring to `buf`.
pub fn write_varstring(buf: &mut Vec<u8>, s: &str) {
    write_varint(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

/// Read a varstring from `data` at `offset`, advancing it.
///
/// The content must be ASCII.
pub fn read_varstring(data: &[u8], offset: &mut usize) -> Result<String> {
    let len = read_varint(data, offset)? as usize;
    check_len(data, *offset + len)?;
    let bytes = &data[*offset..*offset + len];
    if !bytes.is_ascii() {
        return Err(Error::MalformedPacket("command is not ascii".into()));
    }
    *offset += len;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::MalformedPacket("command is not ascii".into()))
}

/// Split a decrypted frame payload into its inner messages.
///
/// A payload is one or more concatenated `varstring(cmd) || u32_le(len) ||
/// body` records; senders may batch several commands per frame.
pub fn split_messages(payload: &[u8]) -> Result<Vec<(String, Bytes)>> {
    let mut messages = Vec::new();
    let mut offset = 0;

    while offset < payload.len() {
        let cmd = read_varstring(payload, &mut offset)?;
        check_len(payload, offset + 4)?;
        let len = read_u32_le(&payload[offset..offset + 4]) as usize;
        offset += 4;
        check_len(payload, offset + len)?;
        let body = Bytes::copy_from_slice(&payload[offset..offset + len]);
        offset += len;
        messages.push((cmd, body));
    }

    Ok(messages)
}

// === Helper functions ===

#[inline]
fn check_len(data: &[u8], needed: usize) -> Result<()> {
    if data.len() < needed {
        Err(Error::MalformedPacket(format!(
            "unexpected end of input: need {} bytes, have {}",
            needed,
            data.len()
        )))
    } else {
        Ok(())
    }
}

#[inline]
fn read_u16_le(data: &[u8]) -> u16 {
    u16::from_le_bytes([data[0], data[1]])
}

#[inline]
fn read_u32_le(data: &[u8]) -> u32 {
    u32::from_le_bytes([data[0], data[1], data[2], data[3]])
}

#[inline]
fn read_u64_le(data: &[u8]) -> u64 {
    u64::from_le_bytes([
        data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
    ])
}
