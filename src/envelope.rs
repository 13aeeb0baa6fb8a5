//! Authenticated envelope over encoded frames.
//!
//! On-air layout is `nonce ‖ tag ‖ ciphertext` (12 + 16 + N bytes). Sealing
//! uses ChaCha20-Poly1305 with a detached tag; the tag comparison inside the
//! AEAD open is constant time. Nonces are either caller-supplied or derived
//! deterministically from the frame header, so the transmitter needs no
//! nonce state. Replay suppression runs after a successful open and decode,
//! keyed by source id.

use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce, Tag};

use crate::codec::{decode_mesh_frame_clear, encode_mesh_frame, EncodedFrame};
use crate::telemetry::{FrameHeader, MeshFrame, NodeId};
use crate::{
    MeshError, ENVELOPE_OVERHEAD, MAX_ENVELOPE_LEN, MAX_FRAME_LEN, MESH_KEY_LEN, NONCE_LEN,
    REPLAY_WINDOW_SIZE,
};

/// Sequence regressions larger than this are treated as a source-side
/// session reset instead of a replay.
const SEQ_RESET_DELTA: u32 = 1 << 31;

/// Shared mesh key, loaded from configuration at boot.
#[derive(Clone, Copy)]
pub struct MeshKey(pub [u8; MESH_KEY_LEN]);

/// A sealed frame as it travels on air. `len == 0` marks a failed seal.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct EncryptedFrame {
    pub bytes: [u8; MAX_ENVELOPE_LEN],
    pub len: usize,
}

impl Default for EncryptedFrame {
    fn default() -> Self {
        EncryptedFrame {
            bytes: [0u8; MAX_ENVELOPE_LEN],
            len: 0,
        }
    }
}

impl EncryptedFrame {
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

fn nonce_is_zero(nonce: &[u8; NONCE_LEN]) -> bool {
    nonce.iter().all(|&b| b == 0)
}

/// Deterministic nonce: little-endian `seq_no` in bytes 0..4, the first
/// eight bytes of the source id XORed into bytes 4..12.
pub fn derive_nonce(header: &FrameHeader) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..4].copy_from_slice(&header.seq_no.to_le_bytes());
    let src = header.src_node_id.raw();
    for i in 0..NONCE_LEN - 4 {
        nonce[4 + i] ^= src[i];
    }
    nonce
}

/// Seals a cleartext buffer under `key` and `nonce`.
///
/// Fails with [`MeshError::EncodeTooLarge`] when the sealed form would not
/// fit the envelope buffer.
pub fn seal(plaintext: &[u8], key: &MeshKey, nonce: &[u8; NONCE_LEN]) -> Result<EncryptedFrame, MeshError> {
    if plaintext.len() + ENVELOPE_OVERHEAD > MAX_ENVELOPE_LEN {
        return Err(MeshError::EncodeTooLarge);
    }
    let mut out = EncryptedFrame::default();
    out.bytes[..NONCE_LEN].copy_from_slice(nonce);
    out.bytes[ENVELOPE_OVERHEAD..ENVELOPE_OVERHEAD + plaintext.len()].copy_from_slice(plaintext);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key.0));
    let tag = cipher
        .encrypt_in_place_detached(
            Nonce::from_slice(nonce),
            &[],
            &mut out.bytes[ENVELOPE_OVERHEAD..ENVELOPE_OVERHEAD + plaintext.len()],
        )
        .map_err(|_| MeshError::EncodeTooLarge)?;
    out.bytes[NONCE_LEN..ENVELOPE_OVERHEAD].copy_from_slice(tag.as_slice());
    out.len = ENVELOPE_OVERHEAD + plaintext.len();
    Ok(out)
}

/// Opens an envelope, verifying the tag before any plaintext is exposed.
pub fn open(envelope: &[u8], key: &MeshKey) -> Result<EncodedFrame, MeshError> {
    if envelope.len() < ENVELOPE_OVERHEAD {
        return Err(MeshError::DecodeMalformed);
    }
    let clear_len = envelope.len() - ENVELOPE_OVERHEAD;
    if clear_len > MAX_FRAME_LEN {
        return Err(MeshError::DecodeMalformed);
    }
    let nonce = &envelope[..NONCE_LEN];
    let tag = &envelope[NONCE_LEN..ENVELOPE_OVERHEAD];

    let mut clear = EncodedFrame::default();
    clear.bytes[..clear_len].copy_from_slice(&envelope[ENVELOPE_OVERHEAD..]);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key.0));
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(nonce),
            &[],
            &mut clear.bytes[..clear_len],
            Tag::from_slice(tag),
        )
        .map_err(|_| MeshError::AuthFail)?;
    clear.len = clear_len;
    Ok(clear)
}

/// Encodes and seals a frame for transmission.
///
/// An all-zero `security.nonce` triggers deterministic derivation; the
/// derived nonce is stamped into the encoded frame so the receiver sees it
/// both in the envelope and in the security block. Any failure yields
/// `len == 0` and nothing observable on the wire.
pub fn encrypt_mesh_frame(frame: &MeshFrame, key: &MeshKey) -> EncryptedFrame {
    let mut framed = *frame;
    if nonce_is_zero(&framed.security.nonce) {
        framed.security.nonce = derive_nonce(&framed.header);
    }

    let clear = encode_mesh_frame(&framed);
    if clear.len == 0 {
        return EncryptedFrame::default();
    }
    seal(&clear.bytes[..clear.len], key, &framed.security.nonce).unwrap_or_default()
}

/// Opens, decodes and replay-checks a received envelope.
///
/// The replay window is only consulted after authentication and a clean
/// decode, so malformed or forged traffic cannot disturb it.
pub fn decrypt_mesh_frame(
    envelope: &[u8],
    key: &MeshKey,
    replay: &mut ReplayWindow,
) -> Result<MeshFrame, MeshError> {
    let clear = open(envelope, key)?;
    let frame = decode_mesh_frame_clear(&clear.bytes[..clear.len])?;
    if !replay.check_and_update(&frame.header.src_node_id, frame.header.seq_no) {
        return Err(MeshError::Replay);
    }
    Ok(frame)
}

#[derive(Clone, Copy, Default)]
struct ReplaySlot {
    src: NodeId,
    last_seq: u32,
}

/// Per-source last-accepted sequence numbers, consulted by the decode path.
///
/// Fixed capacity: a known source must advance its sequence to be accepted,
/// an unknown source claims the first free slot, and when every slot is
/// taken slot 0 is sacrificed.
#[derive(Clone, Copy, Default)]
pub struct ReplayWindow {
    slots: [ReplaySlot; REPLAY_WINDOW_SIZE],
}

impl ReplayWindow {
    pub const fn new() -> Self {
        ReplayWindow {
            slots: [ReplaySlot {
                src: NodeId::EMPTY,
                last_seq: 0,
            }; REPLAY_WINDOW_SIZE],
        }
    }

    pub fn reset(&mut self) {
        *self = ReplayWindow::new();
    }

    /// Returns true when the frame should be accepted, updating the slot.
    pub fn check_and_update(&mut self, src: &NodeId, seq_no: u32) -> bool {
        for slot in self.slots.iter_mut() {
            if slot.src.is_empty() {
                slot.src = *src;
                slot.last_seq = seq_no;
                return true;
            }
            if slot.src == *src {
                if seq_no > slot.last_seq {
                    slot.last_seq = seq_no;
                    return true;
                }
                if slot.last_seq - seq_no > SEQ_RESET_DELTA {
                    // Source restarted its session; re-seed instead of
                    // rejecting everything until the counter catches up.
                    slot.last_seq = seq_no;
                    return true;
                }
                return false;
            }
        }
        self.slots[0] = ReplaySlot {
            src: *src,
            last_seq: seq_no,
        };
        true
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::telemetry::MsgType;

    fn key() -> MeshKey {
        MeshKey([0x11; MESH_KEY_LEN])
    }

    fn sample_frame(seq: u32, src: &str) -> MeshFrame {
        let mut f = MeshFrame::default();
        f.header.version = 1;
        f.header.msg_type = MsgType::Telemetry;
        f.header.ttl = 3;
        f.header.seq_no = seq;
        f.header.src_node_id = NodeId::new(src);
        f.header.dest_node_id = NodeId::new("gw");
        f.security.encrypted = true;
        f.telemetry.rf_event.features.avg_dbm = -55.0;
        f.telemetry.rf_event.features.peak_dbm = -42.0;
        f
    }

    #[test]
    fn seal_open_round_trip() {
        let plain = [0x5Au8; 200];
        let nonce = [7u8; NONCE_LEN];
        let sealed = seal(&plain, &key(), &nonce).unwrap();
        assert_eq!(sealed.len, 200 + ENVELOPE_OVERHEAD);
        assert_eq!(&sealed.bytes[..NONCE_LEN], &nonce);

        let opened = open(sealed.as_slice(), &key()).unwrap();
        assert_eq!(&opened.bytes[..opened.len], &plain);
    }

    #[test]
    fn seal_rejects_oversized_plaintext() {
        let plain = [0u8; MAX_ENVELOPE_LEN - ENVELOPE_OVERHEAD + 1];
        let nonce = [1u8; NONCE_LEN];
        assert!(matches!(seal(&plain, &key(), &nonce), Err(MeshError::EncodeTooLarge)));
    }

    #[test]
    fn open_rejects_short_input() {
        assert!(matches!(
            open(&[0u8; ENVELOPE_OVERHEAD - 1], &key()),
            Err(MeshError::DecodeMalformed)
        ));
    }

    #[test]
    fn ciphertext_differs_from_plaintext() {
        let plain = [0x00u8; 64];
        let sealed = seal(&plain, &key(), &[3u8; NONCE_LEN]).unwrap();
        assert_ne!(&sealed.bytes[ENVELOPE_OVERHEAD..ENVELOPE_OVERHEAD + 64], &plain);
    }

    #[test]
    fn derived_nonce_layout() {
        let mut frame = sample_frame(0x0102_0304, "node-gold");
        frame.header.seq_no = 0x0102_0304;
        let nonce = derive_nonce(&frame.header);
        assert_eq!(&nonce[..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&nonce[4..], b"node-gol");
    }

    #[test]
    fn zero_nonce_triggers_derivation() {
        let frame = sample_frame(9, "node-A");
        let env = encrypt_mesh_frame(&frame, &key());
        assert!(env.len > 0);
        assert_eq!(&env.bytes[..NONCE_LEN], &derive_nonce(&frame.header));
    }

    #[test]
    fn caller_nonce_is_preserved() {
        let mut frame = sample_frame(9, "node-A");
        frame.security.nonce = [0xC4; NONCE_LEN];
        let env = encrypt_mesh_frame(&frame, &key());
        assert_eq!(&env.bytes[..NONCE_LEN], &[0xC4; NONCE_LEN]);
    }

    #[test]
    fn encryption_is_deterministic_for_equal_frames() {
        let frame = sample_frame(21, "node-A");
        let a = encrypt_mesh_frame(&frame, &key());
        let b = encrypt_mesh_frame(&frame, &key());
        assert_eq!(a.len, b.len);
        assert_eq!(a.as_slice(), b.as_slice());
    }

    #[test]
    fn flipping_any_byte_breaks_authentication() {
        let frame = sample_frame(3, "node-sec");
        let env = encrypt_mesh_frame(&frame, &key());
        assert!(env.len > 0);

        for i in 0..env.len {
            let mut tampered = env;
            tampered.bytes[i] ^= 0x01;
            assert!(
                open(tampered.as_slice(), &key()).is_err(),
                "byte {} flip must fail authentication",
                i
            );
        }
    }

    #[test]
    fn wrong_key_fails() {
        let frame = sample_frame(4, "node-sec");
        let env = encrypt_mesh_frame(&frame, &key());
        let other = MeshKey([0x22; MESH_KEY_LEN]);
        assert!(matches!(open(env.as_slice(), &other), Err(MeshError::AuthFail)));
    }

    #[test]
    fn decrypt_round_trip_and_replay() {
        let frame = sample_frame(42, "node-X");
        let env = encrypt_mesh_frame(&frame, &key());
        let mut replay = ReplayWindow::new();

        let decoded = decrypt_mesh_frame(env.as_slice(), &key(), &mut replay).unwrap();
        assert_eq!(decoded.header.seq_no, 42);
        assert_eq!(decoded.header.src_node_id, NodeId::new("node-X"));

        // Identical envelope a second time is a replay.
        assert_eq!(
            decrypt_mesh_frame(env.as_slice(), &key(), &mut replay),
            Err(MeshError::Replay)
        );
    }

    #[test]
    fn malformed_plaintext_does_not_touch_replay_window() {
        let mut replay = ReplayWindow::new();
        let garbage = seal(&[0xFF; 40], &key(), &[9u8; NONCE_LEN]).unwrap();
        assert_eq!(
            decrypt_mesh_frame(garbage.as_slice(), &key(), &mut replay),
            Err(MeshError::DecodeMalformed)
        );

        // A real frame from any source at any sequence still passes.
        let env = encrypt_mesh_frame(&sample_frame(1, "node-X"), &key());
        assert!(decrypt_mesh_frame(env.as_slice(), &key(), &mut replay).is_ok());
    }

    #[test]
    fn replay_window_is_monotonic_per_source() {
        let mut w = ReplayWindow::new();
        let a = NodeId::new("A");
        assert!(w.check_and_update(&a, 5));
        assert!(!w.check_and_update(&a, 5));
        assert!(!w.check_and_update(&a, 4));
        assert!(w.check_and_update(&a, 6));
    }

    #[test]
    fn replay_window_overwrites_slot_zero_when_full() {
        let mut w = ReplayWindow::new();
        for i in 0..REPLAY_WINDOW_SIZE {
            let id = NodeId::new(match i {
                0 => "n0",
                1 => "n1",
                2 => "n2",
                3 => "n3",
                4 => "n4",
                5 => "n5",
                6 => "n6",
                _ => "n7",
            });
            assert!(w.check_and_update(&id, 1));
        }
        // Ninth source claims slot 0.
        assert!(w.check_and_update(&NodeId::new("n8"), 1));
        // The evicted source re-registers (slot 0 again), so an old
        // sequence is accepted once more.
        assert!(w.check_and_update(&NodeId::new("n0"), 1));
    }

    #[test]
    fn large_sequence_regression_is_treated_as_session_reset() {
        let mut w = ReplayWindow::new();
        let a = NodeId::new("A");
        assert!(w.check_and_update(&a, u32::MAX - 5));
        // Small regression: replay.
        assert!(!w.check_and_update(&a, u32::MAX - 10));
        // Huge regression: the source rebooted and restarted its counter.
        assert!(w.check_and_update(&a, 10));
        assert!(w.check_and_update(&a, 11));
    }
}
