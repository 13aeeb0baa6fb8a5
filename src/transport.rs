//! Send pipeline and retrying transport queue.
//!
//! The packet builder pushes finished frames here; each service pass seals
//! the head frame and hands it to the radio. A refused send is retried with
//! a flat backoff until the retry budget is spent, then dropped with a
//! metric. The queue is a fixed-depth ring owned by the transport task and
//! fed only by the packet builder.

use log::{log, Level};

use crate::envelope::{encrypt_mesh_frame, MeshKey};
use crate::fault::{FaultMonitor, MeshMetrics};
use crate::radio::RadioLink;
use crate::telemetry::MeshFrame;
use crate::{
    MeshError, LINK_MTU, MAX_FRAGMENTS, TRANSPORT_MAX_RETRIES, TRANSPORT_QUEUE_DEPTH,
    TRANSPORT_RETRY_BACKOFF_MS,
};

/// Number of link-MTU fragments an envelope of `len` bytes would occupy.
pub(crate) fn fragments_needed(len: usize) -> usize {
    len.div_ceil(LINK_MTU)
}

/// Seals and transmits one frame.
///
/// Pipeline order: TTL guard, seal, fragmentation guard, radio. Returns
/// false on any refusal so the caller can schedule a retry.
pub(crate) fn send_mesh_frame<R: RadioLink>(
    frame: &MeshFrame,
    key: &MeshKey,
    radio: &mut R,
    metrics: &mut MeshMetrics,
) -> bool {
    if frame.header.ttl == 0 || frame.header.hop_count >= frame.header.ttl {
        metrics.ttl_drops += 1;
        return false;
    }

    let envelope = encrypt_mesh_frame(frame, key);
    if envelope.len == 0 {
        // Fail closed: nothing observable on the wire.
        return false;
    }

    let fragments = fragments_needed(envelope.len);
    if fragments > MAX_FRAGMENTS {
        metrics.fragments_dropped += 1;
        return false;
    }
    if fragments > 1 {
        metrics.fragments_sent += fragments as u32;
    }

    log!(
        Level::Trace,
        "[{}] tx seq={} ttl={} hop={} len={}",
        frame.header.src_node_id,
        frame.header.seq_no,
        frame.header.ttl,
        frame.header.hop_count,
        envelope.len
    );
    radio.send(&envelope)
}

#[derive(Clone, Copy, Default)]
struct QueueSlot {
    frame: MeshFrame,
    attempts: u8,
    next_attempt_ms: u32,
}

/// Bounded FIFO of frames awaiting transmission, with per-item retry state.
pub struct TransportQueue {
    slots: [QueueSlot; TRANSPORT_QUEUE_DEPTH],
    head: usize,
    tail: usize,
    size: usize,
}

impl TransportQueue {
    pub fn new() -> Self {
        TransportQueue {
            slots: [QueueSlot::default(); TRANSPORT_QUEUE_DEPTH],
            head: 0,
            tail: 0,
            size: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn is_full(&self) -> bool {
        self.size >= TRANSPORT_QUEUE_DEPTH
    }

    pub fn push(&mut self, frame: MeshFrame) -> Result<(), MeshError> {
        if self.is_full() {
            return Err(MeshError::QueueFull);
        }
        self.slots[self.tail] = QueueSlot {
            frame,
            attempts: 0,
            next_attempt_ms: 0,
        };
        self.tail = (self.tail + 1) % TRANSPORT_QUEUE_DEPTH;
        self.size += 1;
        Ok(())
    }

    fn pop(&mut self) {
        if self.size == 0 {
            return;
        }
        self.head = (self.head + 1) % TRANSPORT_QUEUE_DEPTH;
        self.size -= 1;
    }

    /// One service pass: attempts the head frame if its backoff has expired.
    pub fn service<R: RadioLink>(
        &mut self,
        now_ms: u32,
        key: &MeshKey,
        radio: &mut R,
        metrics: &mut MeshMetrics,
        fault: &mut FaultMonitor,
    ) {
        if self.size == 0 {
            return;
        }
        let idx = self.head;
        if now_ms < self.slots[idx].next_attempt_ms {
            return;
        }

        if send_mesh_frame(&self.slots[idx].frame, key, radio, metrics) {
            self.pop();
            return;
        }

        self.slots[idx].attempts += 1;
        if self.slots[idx].attempts > TRANSPORT_MAX_RETRIES {
            log!(
                Level::Warn,
                "[{}] dropping frame seq={} after {} attempts",
                self.slots[idx].frame.header.src_node_id,
                self.slots[idx].frame.header.seq_no,
                self.slots[idx].attempts
            );
            fault.record_fault("Transport retries exceeded");
            metrics.retry_drops += 1;
            self.pop();
            return;
        }
        self.slots[idx].next_attempt_ms = now_ms + TRANSPORT_RETRY_BACKOFF_MS;
    }
}

impl Default for TransportQueue {
    fn default() -> Self {
        TransportQueue::new()
    }
}
