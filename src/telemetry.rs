//! Telemetry data model: the in-memory representation of everything a node
//! reports per cycle. The on-wire form of [`MeshFrame`] is produced by the
//! codec module and sealed by the envelope module.

use core::fmt;

use crate::fault::FaultStatus;
use crate::ota::OtaStatus;
use crate::{MAX_NODE_ID_LEN, MAX_RF_SAMPLES, MAX_ROUTES};

/// Node identifier: a short text token, at most 15 printable bytes.
///
/// Stored NUL-padded in a fixed 16-byte buffer so it can be compared and
/// copied without allocation. An empty id marks a broadcast destination.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct NodeId {
    bytes: [u8; MAX_NODE_ID_LEN],
}

impl NodeId {
    pub const EMPTY: NodeId = NodeId {
        bytes: [0u8; MAX_NODE_ID_LEN],
    };

    /// Builds an id from a string, truncating to 15 bytes.
    pub fn new(id: &str) -> Self {
        Self::from_wire(id.as_bytes())
    }

    /// Builds an id from raw wire bytes, truncating to 15 bytes and
    /// stopping at the first NUL.
    pub fn from_wire(raw: &[u8]) -> Self {
        let mut bytes = [0u8; MAX_NODE_ID_LEN];
        let mut len = 0;
        while len < MAX_NODE_ID_LEN - 1 && len < raw.len() && raw[len] != 0 {
            bytes[len] = raw[len];
            len += 1;
        }
        NodeId { bytes }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes[0] == 0
    }

    pub fn len(&self) -> usize {
        self.bytes.iter().position(|&b| b == 0).unwrap_or(MAX_NODE_ID_LEN)
    }

    /// Significant bytes, without NUL padding.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len()]
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(self.as_bytes()).unwrap_or("")
    }

    /// Full padded buffer, used by nonce derivation.
    pub(crate) fn raw(&self) -> &[u8; MAX_NODE_ID_LEN] {
        &self.bytes
    }
}

impl Default for NodeId {
    fn default() -> Self {
        NodeId::EMPTY
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.as_str())
    }
}

/// Message class carried in the frame header.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum MsgType {
    #[default]
    Telemetry = 1,
    Routing = 2,
    Control = 3,
    Ota = 4,
}

impl MsgType {
    pub(crate) fn from_wire(value: u32) -> Option<MsgType> {
        match value {
            1 => Some(MsgType::Telemetry),
            2 => Some(MsgType::Routing),
            3 => Some(MsgType::Control),
            4 => Some(MsgType::Ota),
            _ => None,
        }
    }
}

/// Frame header: addressing, loop control and per-source ordering.
#[derive(Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct FrameHeader {
    pub version: u8,
    pub msg_type: MsgType,
    pub ttl: u8,
    pub hop_count: u8,
    /// Monotonic per source; doubles as the transmit counter.
    pub seq_no: u32,
    pub src_node_id: NodeId,
    /// Empty id means broadcast.
    pub dest_node_id: NodeId,
}

/// Security block. The nonce and tag mirrored here are advisory; the
/// authoritative copies travel in the outer envelope.
#[derive(Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct FrameSecurity {
    pub encrypted: bool,
    pub nonce: [u8; crate::NONCE_LEN],
    pub auth_tag: [u8; crate::AUTH_TAG_LEN],
}

#[derive(Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct FrameCounters {
    /// Equal to `seq_no` on emit.
    pub tx_counter: u32,
    /// Advisory only; receiver-side replay state is authoritative.
    pub replay_window: u32,
}

/// Features extracted from one RF sample window.
#[derive(Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct RfFeatures {
    pub avg_dbm: f32,
    pub peak_dbm: f32,
}

/// One scored RF observation.
#[derive(Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct RFEvent {
    pub timestamp_ms: u32,
    pub center_freq_hz: u32,
    pub features: RfFeatures,
    /// Anomaly score in [0, 1].
    pub anomaly_score: f32,
    pub model_version: u8,
}

#[derive(Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct GpsStatus {
    pub timestamp_ms: u32,
    pub latitude_deg: f32,
    pub longitude_deg: f32,
    pub altitude_m: f32,
    pub num_sats: u8,
    pub hdop: f32,
    pub valid_fix: bool,
    pub jamming_detected: bool,
    pub spoof_detected: bool,
    pub cn0_db_hz_avg: f32,
}

#[derive(Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct HealthStatus {
    pub timestamp_ms: u32,
    pub battery_v: f32,
    pub temp_c: f32,
    pub imu_tilt_deg: f32,
    pub tamper_flag: bool,
}

/// One row of the routing table: a reachable neighbor and the metrics used
/// for parent selection.
#[derive(Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct RouteEntry {
    pub neighbor_id: NodeId,
    pub rssi_dbm: i8,
    /// Advisory 0-255 metric, higher is better. Independent of RSSI.
    pub link_quality: u8,
    pub cost: u8,
}

/// Routing advertisement carried inside a frame: a bounded snapshot of the
/// sender's routing table.
#[derive(Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct RoutingPayload {
    pub epoch_ms: u32,
    /// Monotonic per table change.
    pub version: u32,
    pub entries: [RouteEntry; MAX_ROUTES],
    pub entry_count: usize,
}

#[derive(Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct TelemetryPayload {
    pub rf_event: RFEvent,
    pub gps: GpsStatus,
    pub health: HealthStatus,
}

/// The unit of communication: everything a node ships per report cycle.
///
/// Values are transient. The packet builder constructs one per cycle and the
/// transport queue consumes it; nothing holds a frame across cycles.
#[derive(Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct MeshFrame {
    pub header: FrameHeader,
    pub security: FrameSecurity,
    pub counters: FrameCounters,
    pub telemetry: TelemetryPayload,
    pub routing: RoutingPayload,
    pub fault: FaultStatus,
    pub ota: OtaStatus,
}

/// Producer/consumer buffer filled by the RF scan task and drained by
/// feature extraction. Single writer, single reader.
#[derive(Clone, Copy, PartialEq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct RFSampleWindow {
    pub timestamp_ms: u32,
    pub center_freq_hz: u32,
    pub samples: [i16; MAX_RF_SAMPLES],
    pub sample_count: usize,
}

impl Default for RFSampleWindow {
    fn default() -> Self {
        RFSampleWindow {
            timestamp_ms: 0,
            center_freq_hz: 0,
            samples: [0i16; MAX_RF_SAMPLES],
            sample_count: 0,
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn node_id_truncates_to_fifteen_bytes() {
        let id = NodeId::new("abcdefghijklmnopqrstuvwxyz");
        assert_eq!(id.len(), 15);
        assert_eq!(id.as_str(), "abcdefghijklmno");
    }

    #[test]
    fn node_id_stops_at_nul() {
        let id = NodeId::from_wire(b"node-A\0garbage");
        assert_eq!(id.as_str(), "node-A");
        assert_eq!(id, NodeId::new("node-A"));
    }

    #[test]
    fn empty_node_id_is_broadcast() {
        assert!(NodeId::EMPTY.is_empty());
        assert_eq!(NodeId::default(), NodeId::EMPTY);
        assert!(!NodeId::new("gw").is_empty());
    }

    #[test]
    fn msg_type_round_trips_known_values() {
        for mt in [MsgType::Telemetry, MsgType::Routing, MsgType::Control, MsgType::Ota] {
            assert_eq!(MsgType::from_wire(mt as u32), Some(mt));
        }
        assert_eq!(MsgType::from_wire(0), None);
        assert_eq!(MsgType::from_wire(5), None);
    }

    #[test]
    fn default_frame_is_well_formed() {
        let f = MeshFrame::default();
        assert_eq!(f.header.seq_no, 0);
        assert!(f.header.dest_node_id.is_empty());
        assert_eq!(f.routing.entry_count, 0);
    }
}
