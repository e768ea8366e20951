//! Encrypted session: handshake state machine and framing codec.
//!
//! A [`Session`] aggregates the two directional [`Stream`]s of a peer
//! connection. It drives the four-message handshake (encinit/encack in each
//! direction), frames outbound `(command, body)` pairs into authenticated
//! ciphertext with [`pack`](Session::pack), and turns an arriving ciphertext
//! byte stream back into [`Event::Packet`]s with [`feed`](Session::feed).
//!
//! Exactly one owner drives a session; there is no internal locking. State
//! changes surface as [`Event`]s drained with [`poll`](Session::poll), and
//! the handshake completion is awaited through [`wait`](Session::wait).

use crate::buffer::PendingBuffer;
use crate::packet::{self, Cipher, EncAck, EncInit, MAX_COMMAND_SIZE, MAX_MESSAGE, MIN_PAYLOAD};
use crate::stream::Stream;
use crate::{Error, Result};
use bip151_crypto::cipher::TAG_SIZE;
use bip151_crypto::ecdh::EcdhKeypair;
use bytes::Bytes;
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;

/// State changes surfaced by a session.
///
/// Events are queued in the order they occur and drained with
/// [`Session::poll`]. A frame is never partially emitted: its packets are
/// queued before `feed` returns or not at all.
#[derive(Debug)]
pub enum Event {
    /// The four-way handshake completed. Emitted exactly once.
    Handshake,
    /// The outbound direction hit a re-key trigger while packing. The
    /// caller must transmit [`Session::build_rekey`]'s acknowledgement
    /// before the frame returned by the `pack` call that emitted this.
    Rekey,
    /// A decrypted inner message.
    Packet {
        /// ASCII command name.
        cmd: String,
        /// Message body.
        body: Bytes,
    },
    /// Inbound parsing failed; the parser is halted and the connection
    /// should be dropped.
    Error(Error),
}

/// Optional authenticated re-key provider.
///
/// An identity-authentication layer stacked on the session may take over the
/// re-key side effects (for instance to mix authenticated state into the new
/// keys). The session hands it the affected stream; the provider never
/// reaches back into the session.
pub trait RekeySidecar {
    /// Whether the peer identity has been authenticated. The session only
    /// delegates re-keys while this is true.
    fn authenticated(&self) -> bool;

    /// Apply a re-key to the inbound stream.
    fn rekey_input(&mut self, input: &mut Stream);

    /// Apply a re-key to the outbound stream.
    fn rekey_output(&mut self, output: &mut Stream);
}

/// An encrypted peer session.
pub struct Session {
    input: Stream,
    output: Stream,

    init_sent: bool,
    init_recv: bool,
    ack_sent: bool,
    ack_recv: bool,
    handshake_done: bool,
    completed: bool,

    pending: PendingBuffer,
    waiting: usize,
    has_size: bool,
    poisoned: bool,

    events: VecDeque<Event>,
    completion: Option<oneshot::Sender<Result<()>>>,
    sidecar: Option<Box<dyn RekeySidecar + Send>>,
}

impl Session {
    /// Create a session with the default cipher.
    pub fn new() -> Self {
        Self::with_cipher(Cipher::ChaCha20Poly1305)
    }

    /// Create a session negotiating the given cipher.
    ///
    /// One ephemeral keypair backs both directions, so the peers agree on a
    /// single session identifier once the handshake completes.
    pub fn with_cipher(cipher: Cipher) -> Self {
        let keypair = EcdhKeypair::generate();
        Self {
            input: Stream::with_keypair(keypair.clone(), cipher),
            output: Stream::with_keypair(keypair, cipher),
            init_sent: false,
            init_recv: false,
            ack_sent: false,
            ack_recv: false,
            handshake_done: false,
            completed: false,
            pending: PendingBuffer::new(),
            waiting: 4,
            has_size: false,
            poisoned: false,
            events: VecDeque::new(),
            completion: None,
            sidecar: None,
        }
    }

    /// Install an authenticated re-key provider.
    pub fn set_sidecar(&mut self, sidecar: Box<dyn RekeySidecar + Send>) {
        self.sidecar = Some(sidecar);
    }

    /// The inbound stream.
    pub fn input(&self) -> &Stream {
        &self.input
    }

    /// The outbound stream.
    pub fn output(&self) -> &Stream {
        &self.output
    }

    /// Whether the four-way handshake has completed.
    pub fn handshake_complete(&self) -> bool {
        self.handshake_done
    }

    /// Whether inbound parsing has been halted by an error.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Drain the next queued event, if any.
    pub fn poll(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    // === Handshake ===

    /// Build our handshake initiation message.
    pub fn build_encinit(&mut self) -> Result<EncInit> {
        self.reap_completion();
        if self.completed {
            return Err(Error::HandshakeCompleted);
        }
        if self.init_sent {
            return Err(Error::DuplicateInit);
        }
        self.init_sent = true;
        Ok(EncInit {
            pubkey: self.input.public_key(),
            cipher: self.input.cipher().to_u8(),
        })
    }

    /// Process the peer's handshake initiation: establishes the outbound
    /// keys from the peer's public key.
    pub fn on_encinit(&mut self, init: &EncInit) -> Result<()> {
        self.reap_completion();
        if self.completed {
            return Err(Error::HandshakeCompleted);
        }
        if self.init_recv {
            return Err(Error::DuplicateInit);
        }
        let expected = self.output.cipher().to_u8();
        if init.cipher != expected {
            return Err(Error::CipherMismatch {
                expected,
                got: init.cipher,
            });
        }
        self.init_recv = true;
        self.output.init(&init.pubkey)?;
        Ok(())
    }

    /// Build our handshake acknowledgement. Requires the outbound keys
    /// (i.e. the peer's encinit) to be established.
    pub fn build_encack(&mut self) -> Result<EncAck> {
        self.reap_completion();
        if self.completed {
            return Err(Error::HandshakeCompleted);
        }
        if !self.output.is_ready() {
            return Err(Error::HandshakeIncomplete);
        }
        if self.ack_sent {
            return Err(Error::DuplicateAck);
        }
        self.ack_sent = true;
        self.finish_handshake();
        Ok(EncAck {
            pubkey: self.output.public_key(),
        })
    }

    /// Process the peer's handshake acknowledgement.
    ///
    /// An all-zero public key is the re-key signal: the inbound stream
    /// rotates its keys (via the sidecar when one is authenticated) and the
    /// handshake flags are untouched. Otherwise the inbound keys are
    /// established from the carried public key.
    pub fn on_encack(&mut self, ack: &EncAck) -> Result<()> {
        self.reap_completion();
        if ack.is_rekey() {
            if !self.handshake_done {
                return Err(Error::EarlyRekey);
            }
            match self.sidecar.as_mut() {
                Some(sidecar) if sidecar.authenticated() => sidecar.rekey_input(&mut self.input),
                _ => self.input.rekey()?,
            }
            return Ok(());
        }
        if self.completed {
            return Err(Error::HandshakeCompleted);
        }
        if !self.init_sent {
            return Err(Error::UnsolicitedAck);
        }
        if self.ack_recv {
            return Err(Error::DuplicateAck);
        }
        self.ack_recv = true;
        self.input.init(&ack.pubkey)?;
        self.finish_handshake();
        Ok(())
    }

    /// Build a re-key signal for the peer (an all-zero-key encack).
    ///
    /// Pair it with [`rekey_output`](Session::rekey_output): the peer
    /// rotates its inbound keys on receipt, so our outbound keys must rotate
    /// before the next frame is packed.
    pub fn build_rekey(&mut self) -> Result<EncAck> {
        if !self.handshake_done {
            return Err(Error::HandshakeIncomplete);
        }
        Ok(EncAck::rekey())
    }

    /// Rotate the outbound keys, via the sidecar when one is authenticated.
    pub fn rekey_output(&mut self) -> Result<()> {
        match self.sidecar.as_mut() {
            Some(sidecar) if sidecar.authenticated() => {
                sidecar.rekey_output(&mut self.output);
                Ok(())
            }
            _ => self.output.rekey(),
        }
    }

    /// Await handshake completion, for at most `timeout`.
    ///
    /// The returned future is independent of the session borrow, so the
    /// owner can keep driving `feed`/`on_encack` while awaiting it. It
    /// settles exactly once: with `Ok(())` when the handshake completes,
    /// [`Error::HandshakeTimeout`] when the timer fires first, or
    /// [`Error::StreamDestroyed`] if the session is destroyed.
    pub fn wait(&mut self, timeout: Duration) -> impl Future<Output = Result<()>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        if self.handshake_done {
            self.completed = true;
            let _ = tx.send(Ok(()));
        } else if self.completed {
            let _ = tx.send(Err(Error::StreamDestroyed));
        } else {
            self.completion = Some(tx);
        }
        async move {
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(Error::StreamDestroyed),
                Err(_) => Err(Error::HandshakeTimeout),
            }
        }
    }

    /// Tear the session down, rejecting any outstanding handshake wait and
    /// halting the parser.
    pub fn destroy(&mut self) {
        self.poisoned = true;
        self.completed = true;
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(Err(Error::StreamDestroyed));
        }
    }

    // === Framing ===

    /// Frame `(cmd, body)` into an encrypted wire frame.
    ///
    /// Layout: 4-byte encrypted payload size, then the AEAD-encrypted
    /// `varstring(cmd) || u32_le(body_len) || body`, then the 16-byte tag.
    /// May emit [`Event::Rekey`] when the outbound direction hits a re-key
    /// trigger; the re-key is applied before this frame is encrypted, so the
    /// signal must reach the peer first.
    pub fn pack(&mut self, cmd: &str, body: &[u8]) -> Result<Vec<u8>> {
        if !self.output.is_ready() {
            return Err(Error::HandshakeIncomplete);
        }
        if cmd.is_empty() || cmd.len() > MAX_COMMAND_SIZE || !cmd.is_ascii() {
            return Err(Error::InvalidCommand(cmd.into()));
        }

        let payload_size = packet::varstring_size(cmd) + 4 + body.len();
        if payload_size > MAX_MESSAGE as usize {
            return Err(Error::OversizedPacket(payload_size));
        }
        let total = 4 + payload_size + TAG_SIZE;

        let mut frame = Vec::with_capacity(total);
        frame.extend_from_slice(&(payload_size as u32).to_le_bytes());
        packet::write_varstring(&mut frame, cmd);
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(body);
        frame.resize(total, 0);

        if self.output.should_rekey(total) {
            tracing::debug!("outbound re-key triggered");
            self.events.push_back(Event::Rekey);
            self.rekey_output()?;
        }

        let (head, rest) = frame.split_at_mut(4);
        let (payload, tag_slot) = rest.split_at_mut(payload_size);
        self.output.encrypt_size(head)?;
        self.output.encrypt(payload)?;
        let tag = self.output.final_tag()?;
        tag_slot.copy_from_slice(&tag);
        self.output.sequence()?;

        Ok(frame)
    }

    /// Feed raw ciphertext received from the peer.
    ///
    /// Synchronously decodes every complete frame buffered so far, queueing
    /// a [`Event::Packet`] per inner message. On any parse failure a single
    /// [`Event::Error`] is queued and the parser halts for good.
    pub fn feed(&mut self, data: impl Into<Bytes>) {
        self.pending.push(data.into());
        self.parse();
    }

    fn parse(&mut self) {
        while !self.poisoned && self.input.is_ready() {
            let Some(chunk) = self.pending.read(self.waiting) else {
                break;
            };

            if !self.has_size {
                let mut size_buf = [0u8; 4];
                size_buf.copy_from_slice(&chunk);
                let size = match self.input.decrypt_size(&mut size_buf) {
                    Ok(size) => size,
                    Err(err) => return self.poison(err),
                };
                if !(MIN_PAYLOAD..=MAX_MESSAGE).contains(&size) {
                    return self.poison(Error::BadPacketSize(size));
                }
                self.has_size = true;
                self.waiting = size as usize + TAG_SIZE;
                continue;
            }

            let payload_size = self.waiting - TAG_SIZE;
            let mut payload = chunk[..payload_size].to_vec();
            let mut tag = [0u8; TAG_SIZE];
            tag.copy_from_slice(&chunk[payload_size..]);
            self.has_size = false;
            self.waiting = 4;

            if let Err(err) = self.input.auth(&payload) {
                return self.poison(err);
            }
            if let Err(err) = self.input.final_tag() {
                return self.poison(err);
            }
            if !self.input.verify(&tag) {
                // The peer advanced its counter to produce this frame;
                // mirror it so both sides stay aligned, even though the
                // connection is done for.
                let _ = self.input.sequence();
                return self.poison(Error::BadTag(hex::encode(tag)));
            }
            if let Err(err) = self.input.decrypt(&mut payload) {
                return self.poison(err);
            }
            if let Err(err) = self.input.sequence() {
                return self.poison(err);
            }

            match packet::split_messages(&payload) {
                Ok(messages) => {
                    for (cmd, body) in messages {
                        self.events.push_back(Event::Packet { cmd, body });
                    }
                }
                Err(err) => return self.poison(err),
            }
        }
    }

    fn poison(&mut self, err: Error) {
        tracing::warn!(error = %err, "inbound stream poisoned");
        self.poisoned = true;
        self.events.push_back(Event::Error(err));
    }

    fn finish_handshake(&mut self) {
        if self.init_sent && self.init_recv && self.ack_sent && self.ack_recv
            && !self.handshake_done
        {
            self.handshake_done = true;
            tracing::debug!("encrypted session established");
            self.events.push_back(Event::Handshake);
            if let Some(tx) = self.completion.take() {
                debug_assert!(!self.completed, "handshake completion resolved twice");
                self.completed = true;
                let _ = tx.send(Ok(()));
            }
        }
    }

    // A timed-out `wait` drops its receiver; observe that here so the
    // session refuses further handshake progress afterwards.
    fn reap_completion(&mut self) {
        if let Some(tx) = &self.completion {
            if tx.is_closed() {
                self.completion = None;
                self.completed = true;
            }
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Session {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session")
            .field("init_sent", &self.init_sent)
            .field("init_recv", &self.init_recv)
            .field("ack_sent", &self.ack_sent)
            .field("ack_recv", &self.ack_recv)
            .field("handshake_done", &self.handshake_done)
            .field("completed", &self.completed)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}
