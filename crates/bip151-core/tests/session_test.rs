//! End-to-end session tests.
//!
//! Drives two sessions against each other through the four-way handshake
//! and the framing codec, and exercises the failure paths a real peer
//! connection has to survive: undersized frames, tampered tags, one-sided
//! re-keys, and handshake timeouts.

use std::time::Duration;

use bip151_core::packet::{self, EncAck, EncInit};
use bip151_core::{Error, Event, RekeySidecar, Session, Stream};
use bip151_crypto::kdf;

/// Run the four-way handshake between two sessions.
fn connect(a: &mut Session, b: &mut Session) {
    let a_init = a.build_encinit().expect("a encinit");
    b.on_encinit(&a_init).expect("b accepts encinit");
    let b_ack = b.build_encack().expect("b encack");
    a.on_encack(&b_ack).expect("a accepts encack");

    let b_init = b.build_encinit().expect("b encinit");
    a.on_encinit(&b_init).expect("a accepts encinit");
    let a_ack = a.build_encack().expect("a encack");
    b.on_encack(&a_ack).expect("b accepts encack");
}

/// Connected session pair with the handshake events drained.
fn connected_pair() -> (Session, Session) {
    let mut a = Session::new();
    let mut b = Session::new();
    connect(&mut a, &mut b);
    assert!(matches!(a.poll(), Some(Event::Handshake)));
    assert!(matches!(b.poll(), Some(Event::Handshake)));
    (a, b)
}

/// Drive the handshake between a session and a pair of raw streams, so
/// tests can hand-craft traffic for the session's inbound direction.
/// Returns `(peer_in, peer_out)`: `peer_out` mirrors `session.input`.
fn raw_peer(session: &mut Session) -> (Stream, Stream) {
    let mut peer_in = Stream::default();
    let mut peer_out = Stream::default();

    session
        .on_encinit(&EncInit {
            pubkey: peer_in.public_key(),
            cipher: 0,
        })
        .expect("session accepts encinit");
    let ack = session.build_encack().expect("session encack");
    peer_in.init(&ack.pubkey).expect("peer input init");

    let init = session.build_encinit().expect("session encinit");
    peer_out.init(&init.pubkey).expect("peer output init");
    session
        .on_encack(&EncAck {
            pubkey: peer_out.public_key(),
        })
        .expect("session accepts encack");

    (peer_in, peer_out)
}

/// Frame an already-encoded payload through a raw outbound stream.
fn pack_raw(stream: &mut Stream, payload: &[u8]) -> Vec<u8> {
    let total = 4 + payload.len() + 16;
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    frame.resize(total, 0);

    let (head, rest) = frame.split_at_mut(4);
    let (body, tag_slot) = rest.split_at_mut(payload.len());
    stream.encrypt_size(head).expect("size encrypt");
    stream.encrypt(body).expect("body encrypt");
    tag_slot.copy_from_slice(&stream.final_tag().expect("tag"));
    stream.sequence().expect("sequence");
    frame
}

#[test]
fn test_happy_handshake() {
    let mut a = Session::new();
    let mut b = Session::new();
    connect(&mut a, &mut b);

    assert!(a.handshake_complete());
    assert!(b.handshake_complete());

    // Exactly one handshake event each.
    assert!(matches!(a.poll(), Some(Event::Handshake)));
    assert!(a.poll().is_none());
    assert!(matches!(b.poll(), Some(Event::Handshake)));
    assert!(b.poll().is_none());

    // Both peers agree on a single session identifier.
    let sid = a.input().session_id().expect("a input sid");
    assert_eq!(Some(sid), a.output().session_id());
    assert_eq!(Some(sid), b.input().session_id());
    assert_eq!(Some(sid), b.output().session_id());
}

#[test]
fn test_ping_roundtrip() {
    let (mut a, mut b) = connected_pair();

    let nonce = 1u64.to_le_bytes();
    let frame = a.pack("ping", &nonce).expect("pack ping");
    b.feed(frame);

    match b.poll() {
        Some(Event::Packet { cmd, body }) => {
            assert_eq!(cmd, "ping");
            assert_eq!(&body[..], &nonce);
        }
        other => panic!("expected packet event, got {other:?}"),
    }
    assert!(b.poll().is_none());

    assert_eq!(a.output().seq(), 1);
    assert_eq!(b.input().seq(), 1);
}

#[test]
fn test_sequence_counts_per_frame() {
    let (mut a, mut b) = connected_pair();

    for i in 0..5u8 {
        let frame = a.pack("inv", &[i]).expect("pack");
        b.feed(frame);
        assert!(matches!(b.poll(), Some(Event::Packet { .. })));
    }

    assert_eq!(a.output().seq(), 5);
    assert_eq!(b.input().seq(), 5);
}

#[test]
fn test_roundtrip_various_shapes() {
    let (mut a, mut b) = connected_pair();

    let cases: Vec<(&str, Vec<u8>)> = vec![
        ("a", Vec::new()),
        ("verack", Vec::new()),
        ("tx", vec![0u8; 1]),
        ("getheaders", (0..255u8).collect()),
        ("twelveletter", vec![0xAB; 4096]),
    ];

    for (cmd, body) in cases {
        let frame = a.pack(cmd, &body).expect("pack");
        b.feed(frame);
        match b.poll() {
            Some(Event::Packet { cmd: got_cmd, body: got_body }) => {
                assert_eq!(got_cmd, cmd);
                assert_eq!(&got_body[..], &body[..]);
            }
            other => panic!("expected packet for {cmd}, got {other:?}"),
        }
    }
}

#[test]
fn test_incremental_feed() {
    let (mut a, mut b) = connected_pair();

    let frame = a.pack("ping", &7u64.to_le_bytes()).expect("pack");
    for byte in frame {
        b.feed(vec![byte]);
    }

    assert!(matches!(b.poll(), Some(Event::Packet { .. })));
    assert!(b.poll().is_none());
}

#[test]
fn test_batched_inner_messages() {
    let mut b = Session::new();
    let (_peer_in, mut peer_out) = raw_peer(&mut b);
    while b.poll().is_some() {}

    // Two inner messages in one frame.
    let mut payload = Vec::new();
    packet::write_varstring(&mut payload, "inv");
    payload.extend_from_slice(&3u32.to_le_bytes());
    payload.extend_from_slice(b"abc");
    packet::write_varstring(&mut payload, "ping");
    payload.extend_from_slice(&0u32.to_le_bytes());

    b.feed(pack_raw(&mut peer_out, &payload));

    match b.poll() {
        Some(Event::Packet { cmd, body }) => {
            assert_eq!(cmd, "inv");
            assert_eq!(&body[..], b"abc");
        }
        other => panic!("expected inv, got {other:?}"),
    }
    match b.poll() {
        Some(Event::Packet { cmd, body }) => {
            assert_eq!(cmd, "ping");
            assert!(body.is_empty());
        }
        other => panic!("expected ping, got {other:?}"),
    }
    assert_eq!(b.input().seq(), 1, "one frame, one sequence step");
}

#[test]
fn test_rekey_roundtrip() {
    let (mut a, mut b) = connected_pair();

    let signal = a.build_rekey().expect("rekey signal");
    b.on_encack(&signal).expect("b applies rekey");
    a.rekey_output().expect("a rotates output");

    let frame = a.pack("ping", &2u64.to_le_bytes()).expect("pack after rekey");
    b.feed(frame);
    assert!(matches!(b.poll(), Some(Event::Packet { .. })));
}

/// A re-key provider with its own derivation, as an identity-auth layer
/// would install. Both peers mix the same inputs, so their keys agree.
struct AuthSidecar {
    authenticated: bool,
}

impl AuthSidecar {
    fn apply(stream: &mut Stream) {
        let session_id = *stream.session_id().expect("stream ready");
        let k1 = kdf::rekey(&session_id, &[0x51; 32]);
        let k2 = kdf::rekey(&session_id, &[0x52; 32]);
        stream.rekey_with(k1, k2).expect("sidecar rekey");
    }
}

impl RekeySidecar for AuthSidecar {
    fn authenticated(&self) -> bool {
        self.authenticated
    }

    fn rekey_input(&mut self, input: &mut Stream) {
        Self::apply(input);
    }

    fn rekey_output(&mut self, output: &mut Stream) {
        Self::apply(output);
    }
}

#[test]
fn test_authenticated_sidecar_intercepts_rekey() {
    let (mut a, mut b) = connected_pair();
    a.set_sidecar(Box::new(AuthSidecar { authenticated: true }));
    b.set_sidecar(Box::new(AuthSidecar { authenticated: true }));

    let signal = a.build_rekey().expect("rekey signal");
    b.on_encack(&signal).expect("b delegates to sidecar");
    a.rekey_output().expect("a delegates to sidecar");

    let frame = a.pack("ping", &9u64.to_le_bytes()).expect("pack");
    b.feed(frame);
    assert!(matches!(b.poll(), Some(Event::Packet { .. })));
}

#[test]
fn test_unauthenticated_sidecar_is_bypassed() {
    let (mut a, mut b) = connected_pair();
    // Only b carries a sidecar, and it is not authenticated: both peers
    // must fall back to the derived re-key and stay in sync.
    b.set_sidecar(Box::new(AuthSidecar {
        authenticated: false,
    }));

    let signal = a.build_rekey().expect("rekey signal");
    b.on_encack(&signal).expect("b applies derived rekey");
    a.rekey_output().expect("a applies derived rekey");

    let frame = a.pack("ping", &10u64.to_le_bytes()).expect("pack");
    b.feed(frame);
    assert!(matches!(b.poll(), Some(Event::Packet { .. })));
}

#[test]
fn test_one_sided_rekey_desynchronizes() {
    let (mut a, mut b) = connected_pair();

    let signal = a.build_rekey().expect("rekey signal");
    b.on_encack(&signal).expect("b applies rekey");
    // a deliberately does not rotate its output keys.

    let frame = a.pack("ping", &3u64.to_le_bytes()).expect("pack");
    b.feed(frame);

    // Both frame ciphers rotated on b, so the stale frame fails either at
    // the length prefix or at tag verification; the session is dead
    // regardless.
    match b.poll() {
        Some(Event::Error(Error::BadPacketSize(_) | Error::BadTag(_))) => {}
        other => panic!("expected fatal parse error, got {other:?}"),
    }
    assert!(b.is_poisoned());
}

#[test]
fn test_undersized_frame_rejected() {
    let mut b = Session::new();
    let (_peer_in, mut peer_out) = raw_peer(&mut b);
    while b.poll().is_some() {}

    // Encrypted length prefix decrypting to 5, below the minimum of 6.
    let mut frame = vec![0u8; 4 + 5 + 16];
    frame[..4].copy_from_slice(&5u32.to_le_bytes());
    peer_out.encrypt_size(&mut frame[..4]).expect("size encrypt");

    b.feed(frame);

    match b.poll() {
        Some(Event::Error(err)) => {
            assert_eq!(err.to_string(), "Bad packet size: 5.");
            assert!(matches!(err, Error::BadPacketSize(5)));
        }
        other => panic!("expected size error, got {other:?}"),
    }
    assert!(b.is_poisoned());

    // Parser is halted: a subsequent valid frame is ignored.
    let mut payload = Vec::new();
    packet::write_varstring(&mut payload, "ping");
    payload.extend_from_slice(&0u32.to_le_bytes());
    b.feed(pack_raw(&mut peer_out, &payload));
    assert!(b.poll().is_none());
}

#[test]
fn test_oversized_frame_rejected() {
    let mut b = Session::new();
    let (_peer_in, mut peer_out) = raw_peer(&mut b);
    while b.poll().is_some() {}

    let mut prefix = vec![0u8; 4];
    prefix.copy_from_slice(&12_000_001u32.to_le_bytes());
    peer_out.encrypt_size(&mut prefix).expect("size encrypt");

    b.feed(prefix);

    match b.poll() {
        Some(Event::Error(Error::BadPacketSize(size))) => assert_eq!(size, 12_000_001),
        other => panic!("expected size error, got {other:?}"),
    }
}

#[test]
fn test_tampered_tag_halts_parser() {
    let (mut a, mut b) = connected_pair();

    let mut frame = a.pack("ping", &1u64.to_le_bytes()).expect("pack");
    let last = frame.len() - 1;
    frame[last] ^= 0x01;
    b.feed(frame);

    match b.poll() {
        Some(Event::Error(Error::BadTag(hex))) => {
            assert_eq!(hex.len(), 32, "16-byte tag rendered as hex");
        }
        other => panic!("expected bad tag, got {other:?}"),
    }

    // The sequence still advanced to mirror the peer.
    assert_eq!(b.input().seq(), 1);

    // A subsequent valid frame must not be decoded.
    let frame = a.pack("ping", &2u64.to_le_bytes()).expect("pack");
    b.feed(frame);
    assert!(b.poll().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout() {
    let mut a = Session::new();

    let wait = a.wait(Duration::from_millis(50));
    let err = wait.await.expect_err("no counterparty traffic");
    assert!(matches!(err, Error::HandshakeTimeout));
    assert_eq!(err.to_string(), "handshake timed out");

    // The session refuses further handshake progress.
    assert!(matches!(
        a.build_encinit(),
        Err(Error::HandshakeCompleted)
    ));
}

#[tokio::test]
async fn test_wait_resolves_on_handshake() {
    let mut a = Session::new();
    let mut b = Session::new();

    let wait = a.wait(Duration::from_secs(5));
    connect(&mut a, &mut b);

    wait.await.expect("handshake completed before timeout");
}

#[tokio::test]
async fn test_wait_after_completion_is_immediate() {
    let (mut a, _b) = connected_pair();

    a.wait(Duration::from_millis(1))
        .await
        .expect("already established");
}

#[tokio::test]
async fn test_destroy_rejects_pending_wait() {
    let mut a = Session::new();

    let wait = a.wait(Duration::from_secs(5));
    a.destroy();

    let err = wait.await.expect_err("destroyed");
    assert!(matches!(err, Error::StreamDestroyed));
    assert_eq!(err.to_string(), "stream destroyed");
}
