//! Self-describing, field-tagged binary codec for [`MeshFrame`].
//!
//! The wire form is a CBOR subset: unsigned integers, byte strings, text
//! strings, arrays, maps and 32-bit floats. The top level is a map with nine
//! integer keys (1=header, 2=security, 3=counters, 4=rf, 5=gps, 6=health,
//! 7=routing, 8=fault, 9=ota); each value is a map keyed by small integers
//! in struct declaration order. Decoders skip unknown keys at every level,
//! so a field can be added without a version bump.
//!
//! Integer heads carry big-endian magnitudes (1, 2, 3 or 5 bytes). Floats
//! are a simple-26 head followed by four little-endian IEEE-754 bytes.

use crate::telemetry::{MeshFrame, MsgType, NodeId, RoutingPayload};
use crate::ota::OtaState;
use crate::{MeshError, MAX_FRAME_LEN, MAX_NODE_ID_LEN, MAX_ROUTES};

const MAJOR_UINT: u8 = 0;
const MAJOR_NEGATIVE: u8 = 1;
const MAJOR_BYTES: u8 = 2;
const MAJOR_TEXT: u8 = 3;
const MAJOR_ARRAY: u8 = 4;
const MAJOR_MAP: u8 = 5;
const MAJOR_SIMPLE: u8 = 7;

/// Additional-information value marking a 32-bit float.
const SIMPLE_FLOAT32: u32 = 26;

/// Unknown nested values deeper than this are rejected instead of skipped.
const MAX_SKIP_DEPTH: u8 = 16;

/// A frame encoded to the tagged-map form. `len == 0` means the encoder
/// failed closed (the frame would have exceeded [`MAX_FRAME_LEN`]).
#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct EncodedFrame {
    pub bytes: [u8; MAX_FRAME_LEN],
    pub len: usize,
}

impl Default for EncodedFrame {
    fn default() -> Self {
        EncodedFrame {
            bytes: [0u8; MAX_FRAME_LEN],
            len: 0,
        }
    }
}

struct FrameWriter<'a> {
    buf: &'a mut [u8; MAX_FRAME_LEN],
    idx: usize,
}

impl<'a> FrameWriter<'a> {
    fn new(buf: &'a mut [u8; MAX_FRAME_LEN]) -> Self {
        FrameWriter { buf, idx: 0 }
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), MeshError> {
        if self.idx + bytes.len() > self.buf.len() {
            return Err(MeshError::EncodeTooLarge);
        }
        self.buf[self.idx..self.idx + bytes.len()].copy_from_slice(bytes);
        self.idx += bytes.len();
        Ok(())
    }

    fn write_head(&mut self, major: u8, val: u32) -> Result<(), MeshError> {
        if val < 24 {
            self.put(&[(major << 5) | val as u8])
        } else if val <= 0xFF {
            self.put(&[(major << 5) | 24, val as u8])
        } else if val <= 0xFFFF {
            self.put(&[(major << 5) | 25, (val >> 8) as u8, val as u8])
        } else {
            self.put(&[
                (major << 5) | 26,
                (val >> 24) as u8,
                (val >> 16) as u8,
                (val >> 8) as u8,
                val as u8,
            ])
        }
    }

    fn write_uint(&mut self, val: u32) -> Result<(), MeshError> {
        self.write_head(MAJOR_UINT, val)
    }

    fn write_bool(&mut self, val: bool) -> Result<(), MeshError> {
        self.write_uint(val as u32)
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<(), MeshError> {
        self.write_head(MAJOR_BYTES, data.len() as u32)?;
        self.put(data)
    }

    fn write_text(&mut self, id: &NodeId) -> Result<(), MeshError> {
        let data = id.as_bytes();
        self.write_head(MAJOR_TEXT, data.len() as u32)?;
        self.put(data)
    }

    fn write_float(&mut self, val: f32) -> Result<(), MeshError> {
        self.write_head(MAJOR_SIMPLE, SIMPLE_FLOAT32)?;
        self.put(&val.to_le_bytes())
    }

    fn write_map(&mut self, count: u32) -> Result<(), MeshError> {
        self.write_head(MAJOR_MAP, count)
    }

    fn write_array(&mut self, count: u32) -> Result<(), MeshError> {
        self.write_head(MAJOR_ARRAY, count)
    }
}

struct FrameReader<'a> {
    data: &'a [u8],
    idx: usize,
}

impl<'a> FrameReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        FrameReader { data, idx: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], MeshError> {
        let end = self.idx.checked_add(len).ok_or(MeshError::DecodeMalformed)?;
        if end > self.data.len() {
            return Err(MeshError::DecodeMalformed);
        }
        let slice = &self.data[self.idx..end];
        self.idx = end;
        Ok(slice)
    }

    fn read_head(&mut self) -> Result<(u8, u32), MeshError> {
        let initial = self.take(1)?[0];
        let major = initial >> 5;
        let ai = initial & 0x1F;
        let val = match ai {
            0..=23 => ai as u32,
            24 => self.take(1)?[0] as u32,
            25 => {
                let b = self.take(2)?;
                ((b[0] as u32) << 8) | b[1] as u32
            }
            26 => {
                let b = self.take(4)?;
                ((b[0] as u32) << 24) | ((b[1] as u32) << 16) | ((b[2] as u32) << 8) | b[3] as u32
            }
            _ => return Err(MeshError::DecodeMalformed),
        };
        Ok((major, val))
    }

    fn read_uint(&mut self) -> Result<u32, MeshError> {
        match self.read_head()? {
            (MAJOR_UINT, val) => Ok(val),
            _ => Err(MeshError::DecodeMalformed),
        }
    }

    fn read_u8(&mut self) -> Result<u8, MeshError> {
        Ok((self.read_uint()? & 0xFF) as u8)
    }

    fn read_bool(&mut self) -> Result<bool, MeshError> {
        Ok(self.read_uint()? != 0)
    }

    fn read_bytes_into(&mut self, out: &mut [u8]) -> Result<usize, MeshError> {
        let (major, len) = self.read_head()?;
        if major != MAJOR_BYTES || len as usize > out.len() {
            return Err(MeshError::DecodeMalformed);
        }
        let data = self.take(len as usize)?;
        out[..data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    fn read_node_id(&mut self) -> Result<NodeId, MeshError> {
        let (major, len) = self.read_head()?;
        if major != MAJOR_TEXT || len as usize >= MAX_NODE_ID_LEN {
            return Err(MeshError::DecodeMalformed);
        }
        Ok(NodeId::from_wire(self.take(len as usize)?))
    }

    fn read_float(&mut self) -> Result<f32, MeshError> {
        match self.read_head()? {
            (MAJOR_SIMPLE, SIMPLE_FLOAT32) => {
                let b = self.take(4)?;
                Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            }
            _ => Err(MeshError::DecodeMalformed),
        }
    }

    fn read_array_len(&mut self) -> Result<usize, MeshError> {
        match self.read_head()? {
            (MAJOR_ARRAY, val) => Ok(val as usize),
            _ => Err(MeshError::DecodeMalformed),
        }
    }

    fn read_map_len(&mut self) -> Result<usize, MeshError> {
        match self.read_head()? {
            (MAJOR_MAP, val) => Ok(val as usize),
            _ => Err(MeshError::DecodeMalformed),
        }
    }

    fn skip_value(&mut self) -> Result<(), MeshError> {
        self.skip_value_at(0)
    }

    fn skip_value_at(&mut self, depth: u8) -> Result<(), MeshError> {
        if depth >= MAX_SKIP_DEPTH {
            return Err(MeshError::DecodeMalformed);
        }
        let (major, val) = self.read_head()?;
        match major {
            MAJOR_UINT | MAJOR_NEGATIVE => Ok(()),
            MAJOR_BYTES | MAJOR_TEXT => self.take(val as usize).map(|_| ()),
            MAJOR_ARRAY => {
                for _ in 0..val {
                    self.skip_value_at(depth + 1)?;
                }
                Ok(())
            }
            MAJOR_MAP => {
                for _ in 0..val {
                    self.skip_value_at(depth + 1)?;
                    self.skip_value_at(depth + 1)?;
                }
                Ok(())
            }
            MAJOR_SIMPLE if val == SIMPLE_FLOAT32 => self.take(4).map(|_| ()),
            _ => Err(MeshError::DecodeMalformed),
        }
    }
}

fn encode_routing(w: &mut FrameWriter<'_>, routing: &RoutingPayload) -> Result<(), MeshError> {
    let entry_count = routing.entry_count.min(MAX_ROUTES);
    w.write_map(4)?;
    w.write_uint(1)?;
    w.write_uint(routing.epoch_ms)?;
    w.write_uint(2)?;
    w.write_uint(routing.version)?;
    w.write_uint(3)?;
    w.write_array(entry_count as u32)?;
    for entry in &routing.entries[..entry_count] {
        w.write_map(4)?;
        w.write_uint(1)?;
        w.write_text(&entry.neighbor_id)?;
        w.write_uint(2)?;
        w.write_uint(entry.rssi_dbm as u8 as u32)?;
        w.write_uint(3)?;
        w.write_uint(entry.link_quality as u32)?;
        w.write_uint(4)?;
        w.write_uint(entry.cost as u32)?;
    }
    w.write_uint(4)?;
    w.write_uint(entry_count as u32)
}

fn decode_routing(r: &mut FrameReader<'_>, out: &mut RoutingPayload) -> Result<(), MeshError> {
    let map_len = r.read_map_len()?;
    for _ in 0..map_len {
        match r.read_uint()? {
            1 => out.epoch_ms = r.read_uint()?,
            2 => out.version = r.read_uint()?,
            3 => {
                let arr_len = r.read_array_len()?;
                out.entry_count = arr_len.min(MAX_ROUTES);
                for j in 0..out.entry_count {
                    let entry_map = r.read_map_len()?;
                    for _ in 0..entry_map {
                        match r.read_uint()? {
                            1 => out.entries[j].neighbor_id = r.read_node_id()?,
                            2 => out.entries[j].rssi_dbm = r.read_u8()? as i8,
                            3 => out.entries[j].link_quality = r.read_u8()?,
                            4 => out.entries[j].cost = r.read_u8()?,
                            _ => r.skip_value()?,
                        }
                    }
                }
                // Anything beyond capacity stays on the wire but not in the table.
                for _ in out.entry_count..arr_len {
                    r.skip_value()?;
                }
            }
            4 => {
                let count = r.read_uint()? as usize;
                out.entry_count = count.min(out.entry_count);
            }
            _ => r.skip_value()?,
        }
    }
    Ok(())
}

fn encode_into(frame: &MeshFrame, buf: &mut [u8; MAX_FRAME_LEN]) -> Result<usize, MeshError> {
    let mut w = FrameWriter::new(buf);
    w.write_map(9)?;

    // Header
    w.write_uint(1)?;
    w.write_map(7)?;
    w.write_uint(1)?;
    w.write_uint(frame.header.version as u32)?;
    w.write_uint(2)?;
    w.write_uint(frame.header.msg_type as u32)?;
    w.write_uint(3)?;
    w.write_uint(frame.header.ttl as u32)?;
    w.write_uint(4)?;
    w.write_uint(frame.header.hop_count as u32)?;
    w.write_uint(5)?;
    w.write_uint(frame.header.seq_no)?;
    w.write_uint(6)?;
    w.write_text(&frame.header.src_node_id)?;
    w.write_uint(7)?;
    w.write_text(&frame.header.dest_node_id)?;

    // Security
    w.write_uint(2)?;
    w.write_map(3)?;
    w.write_uint(1)?;
    w.write_bool(frame.security.encrypted)?;
    w.write_uint(2)?;
    w.write_bytes(&frame.security.nonce)?;
    w.write_uint(3)?;
    w.write_bytes(&frame.security.auth_tag)?;

    // Counters
    w.write_uint(3)?;
    w.write_map(2)?;
    w.write_uint(1)?;
    w.write_uint(frame.counters.tx_counter)?;
    w.write_uint(2)?;
    w.write_uint(frame.counters.replay_window)?;

    // RF event
    let rf = &frame.telemetry.rf_event;
    w.write_uint(4)?;
    w.write_map(6)?;
    w.write_uint(1)?;
    w.write_uint(rf.timestamp_ms)?;
    w.write_uint(2)?;
    w.write_uint(rf.center_freq_hz)?;
    w.write_uint(3)?;
    w.write_float(rf.features.avg_dbm)?;
    w.write_uint(4)?;
    w.write_float(rf.features.peak_dbm)?;
    w.write_uint(5)?;
    w.write_float(rf.anomaly_score)?;
    w.write_uint(6)?;
    w.write_uint(rf.model_version as u32)?;

    // GPS
    let gps = &frame.telemetry.gps;
    w.write_uint(5)?;
    w.write_map(10)?;
    w.write_uint(1)?;
    w.write_uint(gps.timestamp_ms)?;
    w.write_uint(2)?;
    w.write_float(gps.latitude_deg)?;
    w.write_uint(3)?;
    w.write_float(gps.longitude_deg)?;
    w.write_uint(4)?;
    w.write_float(gps.altitude_m)?;
    w.write_uint(5)?;
    w.write_uint(gps.num_sats as u32)?;
    w.write_uint(6)?;
    w.write_float(gps.hdop)?;
    w.write_uint(7)?;
    w.write_bool(gps.valid_fix)?;
    w.write_uint(8)?;
    w.write_bool(gps.jamming_detected)?;
    w.write_uint(9)?;
    w.write_bool(gps.spoof_detected)?;
    w.write_uint(10)?;
    w.write_float(gps.cn0_db_hz_avg)?;

    // Health
    let health = &frame.telemetry.health;
    w.write_uint(6)?;
    w.write_map(5)?;
    w.write_uint(1)?;
    w.write_uint(health.timestamp_ms)?;
    w.write_uint(2)?;
    w.write_float(health.battery_v)?;
    w.write_uint(3)?;
    w.write_float(health.temp_c)?;
    w.write_uint(4)?;
    w.write_float(health.imu_tilt_deg)?;
    w.write_uint(5)?;
    w.write_bool(health.tamper_flag)?;

    // Routing
    w.write_uint(7)?;
    encode_routing(&mut w, &frame.routing)?;

    // Fault
    w.write_uint(8)?;
    w.write_map(4)?;
    w.write_uint(1)?;
    w.write_bool(frame.fault.fault_active)?;
    w.write_uint(2)?;
    w.write_uint(frame.fault.counters.watchdog_resets)?;
    w.write_uint(3)?;
    w.write_uint(frame.fault.counters.ota_failures)?;
    w.write_uint(4)?;
    w.write_uint(frame.fault.counters.tamper_events)?;

    // OTA
    w.write_uint(9)?;
    w.write_map(4)?;
    w.write_uint(1)?;
    w.write_uint(frame.ota.state as u32)?;
    w.write_uint(2)?;
    w.write_uint(frame.ota.current_offset)?;
    w.write_uint(3)?;
    w.write_uint(frame.ota.total_size)?;
    w.write_uint(4)?;
    w.write_bool(frame.ota.signature_valid)?;

    Ok(w.idx)
}

/// Encodes a frame to its tagged-map wire form.
///
/// A frame that would exceed [`MAX_FRAME_LEN`] yields `len == 0`; nothing of
/// the oversized frame is observable on the wire.
pub fn encode_mesh_frame(frame: &MeshFrame) -> EncodedFrame {
    let mut out = EncodedFrame::default();
    match encode_into(frame, &mut out.bytes) {
        Ok(len) => out.len = len,
        Err(_) => out.len = 0,
    }
    out
}

fn decode_header(r: &mut FrameReader<'_>, frame: &mut MeshFrame) -> Result<(), MeshError> {
    let map_len = r.read_map_len()?;
    for _ in 0..map_len {
        match r.read_uint()? {
            1 => frame.header.version = r.read_u8()?,
            2 => {
                frame.header.msg_type =
                    MsgType::from_wire(r.read_uint()?).ok_or(MeshError::DecodeMalformed)?;
            }
            3 => frame.header.ttl = r.read_u8()?,
            4 => frame.header.hop_count = r.read_u8()?,
            5 => frame.header.seq_no = r.read_uint()?,
            6 => frame.header.src_node_id = r.read_node_id()?,
            7 => frame.header.dest_node_id = r.read_node_id()?,
            _ => r.skip_value()?,
        }
    }
    Ok(())
}

fn decode_security(r: &mut FrameReader<'_>, frame: &mut MeshFrame) -> Result<(), MeshError> {
    let map_len = r.read_map_len()?;
    for _ in 0..map_len {
        match r.read_uint()? {
            1 => frame.security.encrypted = r.read_bool()?,
            2 => {
                r.read_bytes_into(&mut frame.security.nonce)?;
            }
            3 => {
                r.read_bytes_into(&mut frame.security.auth_tag)?;
            }
            _ => r.skip_value()?,
        }
    }
    Ok(())
}

fn decode_counters(r: &mut FrameReader<'_>, frame: &mut MeshFrame) -> Result<(), MeshError> {
    let map_len = r.read_map_len()?;
    for _ in 0..map_len {
        match r.read_uint()? {
            1 => frame.counters.tx_counter = r.read_uint()?,
            2 => frame.counters.replay_window = r.read_uint()?,
            _ => r.skip_value()?,
        }
    }
    Ok(())
}

fn decode_rf(r: &mut FrameReader<'_>, frame: &mut MeshFrame) -> Result<(), MeshError> {
    let rf = &mut frame.telemetry.rf_event;
    let map_len = r.read_map_len()?;
    for _ in 0..map_len {
        match r.read_uint()? {
            1 => rf.timestamp_ms = r.read_uint()?,
            2 => rf.center_freq_hz = r.read_uint()?,
            3 => rf.features.avg_dbm = r.read_float()?,
            4 => rf.features.peak_dbm = r.read_float()?,
            5 => rf.anomaly_score = r.read_float()?,
            6 => rf.model_version = r.read_u8()?,
            _ => r.skip_value()?,
        }
    }
    Ok(())
}

fn decode_gps(r: &mut FrameReader<'_>, frame: &mut MeshFrame) -> Result<(), MeshError> {
    let gps = &mut frame.telemetry.gps;
    let map_len = r.read_map_len()?;
    for _ in 0..map_len {
        match r.read_uint()? {
            1 => gps.timestamp_ms = r.read_uint()?,
            2 => gps.latitude_deg = r.read_float()?,
            3 => gps.longitude_deg = r.read_float()?,
            4 => gps.altitude_m = r.read_float()?,
            5 => gps.num_sats = r.read_u8()?,
            6 => gps.hdop = r.read_float()?,
            7 => gps.valid_fix = r.read_bool()?,
            8 => gps.jamming_detected = r.read_bool()?,
            9 => gps.spoof_detected = r.read_bool()?,
            10 => gps.cn0_db_hz_avg = r.read_float()?,
            _ => r.skip_value()?,
        }
    }
    Ok(())
}

fn decode_health(r: &mut FrameReader<'_>, frame: &mut MeshFrame) -> Result<(), MeshError> {
    let health = &mut frame.telemetry.health;
    let map_len = r.read_map_len()?;
    for _ in 0..map_len {
        match r.read_uint()? {
            1 => health.timestamp_ms = r.read_uint()?,
            2 => health.battery_v = r.read_float()?,
            3 => health.temp_c = r.read_float()?,
            4 => health.imu_tilt_deg = r.read_float()?,
            5 => health.tamper_flag = r.read_bool()?,
            _ => r.skip_value()?,
        }
    }
    Ok(())
}

fn decode_fault(r: &mut FrameReader<'_>, frame: &mut MeshFrame) -> Result<(), MeshError> {
    let map_len = r.read_map_len()?;
    for _ in 0..map_len {
        match r.read_uint()? {
            1 => frame.fault.fault_active = r.read_bool()?,
            2 => frame.fault.counters.watchdog_resets = r.read_uint()?,
            3 => frame.fault.counters.ota_failures = r.read_uint()?,
            4 => frame.fault.counters.tamper_events = r.read_uint()?,
            _ => r.skip_value()?,
        }
    }
    Ok(())
}

fn decode_ota(r: &mut FrameReader<'_>, frame: &mut MeshFrame) -> Result<(), MeshError> {
    let map_len = r.read_map_len()?;
    for _ in 0..map_len {
        match r.read_uint()? {
            1 => {
                frame.ota.state =
                    OtaState::from_wire(r.read_uint()?).ok_or(MeshError::DecodeMalformed)?;
            }
            2 => frame.ota.current_offset = r.read_uint()?,
            3 => frame.ota.total_size = r.read_uint()?,
            4 => frame.ota.signature_valid = r.read_bool()?,
            _ => r.skip_value()?,
        }
    }
    Ok(())
}

/// Decodes a cleartext tagged-map encoding back into a frame.
///
/// Unknown keys are skipped at every level. Any length reaching past the
/// input fails the whole decode; the caller never observes a partial frame.
pub fn decode_mesh_frame_clear(bytes: &[u8]) -> Result<MeshFrame, MeshError> {
    let mut frame = MeshFrame::default();
    let mut r = FrameReader::new(bytes);
    let top_len = r.read_map_len()?;
    for _ in 0..top_len {
        match r.read_uint()? {
            1 => decode_header(&mut r, &mut frame)?,
            2 => decode_security(&mut r, &mut frame)?,
            3 => decode_counters(&mut r, &mut frame)?,
            4 => decode_rf(&mut r, &mut frame)?,
            5 => decode_gps(&mut r, &mut frame)?,
            6 => decode_health(&mut r, &mut frame)?,
            7 => decode_routing(&mut r, &mut frame.routing)?,
            8 => decode_fault(&mut r, &mut frame)?,
            9 => decode_ota(&mut r, &mut frame)?,
            _ => r.skip_value()?,
        }
    }
    Ok(frame)
}
