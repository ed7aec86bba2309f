//! # codec
//!
//! Serialises and parses the two stacked framings used on the gateway wire:
//! PMESH (routed mesh) and the DLMS frame nested in its payload. Also
//! computes the sum-mod-256 checksums used by both layers.
//!
//! ## Wire layout
//! PMESH: `start(1) | length(1) | packet_type(1) | pan_id(4) | source_addr(4)
//! | router_index(1) | hop_count(1) | hop_addresses(max(1,hop_count)*4) |
//! payload | checksum(1)`.
//!
//! DLMS (nested in the PMESH payload): `start(1) | length(1 or 2, direction-
//! dependent) | page_index(1) | frame_id(1) | command(1) | sub_command(1) |
//! records... | checksum(1)`.
//!
//! Everything here is byte-by-byte, no host-memory struct packing — integers
//! are explicitly big-endian on the wire per spec §9.

use crate::error::WireFormatError;

pub const MESH_START_TX: u8 = 0x2E;
pub const MESH_START_RX_GATEWAY: u8 = 0x2E;
pub const MESH_START_RX_NMS: u8 = 0x2A;

pub const DLMS_START_REQUEST: u8 = 0x2B;
pub const DLMS_START_RESPONSE: u8 = 0x2D;

/// PMESH header is fixed at 13 bytes before the hop-address block.
pub const MESH_FIXED_HEADER_LEN: usize = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MeshPacketType {
    Commission = 0x03,
    CommissionResponse = 0x04,
    DataQuery = 0x07,
    DataResponse = 0x08,
    FuotaDataQuery = 0x09,
    FuotaResponse = 0x0A,
    ScanB = 0x0B,
    ScanC = 0x0C,
    Ping = 0x0D,
    PingResponse = 0x0E,
    ScanF = 0x0F,
    Scan10 = 0x10,
}

impl MeshPacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        use MeshPacketType::*;
        Some(match v {
            0x03 => Commission,
            0x04 => CommissionResponse,
            0x07 => DataQuery,
            0x08 => DataResponse,
            0x09 => FuotaDataQuery,
            0x0A => FuotaResponse,
            0x0B => ScanB,
            0x0C => ScanC,
            0x0D => Ping,
            0x0E => PingResponse,
            0x0F => ScanF,
            0x10 => Scan10,
            _ => return None,
        })
    }
}

/// Low byte of the sum of `bytes`.
pub fn sum_mod_256(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

// ── PMESH frame ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshView {
    pub start: u8,
    pub total_length: usize,
    pub packet_type: u8,
    pub pan_id: [u8; 4],
    pub source_addr: [u8; 4],
    pub router_index: u8,
    pub hop_count: u8,
    /// `max(1, hop_count) * 4` bytes; last 4-byte group is the final destination.
    pub hop_addresses: Vec<u8>,
    pub payload: Vec<u8>,
    pub checksum: u8,
}

impl MeshView {
    /// The last 4-byte group of the hop-address block — the final destination.
    pub fn final_destination(&self) -> [u8; 4] {
        let n = self.hop_addresses.len();
        let mut out = [0u8; 4];
        out.copy_from_slice(&self.hop_addresses[n - 4..n]);
        out
    }
}

fn header_bytes_for(hop_count: u8) -> usize {
    MESH_FIXED_HEADER_LEN + (hop_count.max(1) as usize) * 4
}

/// `build_mesh`. Pre: `hop_addresses.len() == max(1, hop_count) * 4`.
/// Post: length field correct; a payload-level checksum (low byte of the sum
/// of payload bytes) is appended as the frame's trailing byte.
pub fn build_mesh(
    packet_type: u8,
    pan_id: [u8; 4],
    source_addr: [u8; 4],
    hop_count: u8,
    hop_addresses: &[u8],
    payload: &[u8],
) -> Result<Vec<u8>, WireFormatError> {
    let expected_hop_bytes = (hop_count.max(1) as usize) * 4;
    if hop_addresses.len() != expected_hop_bytes {
        return Err(WireFormatError::LengthMismatch);
    }

    let total_length = header_bytes_for(hop_count) + payload.len() + 1;
    let mut out = Vec::with_capacity(total_length);
    out.push(MESH_START_TX);
    out.push((total_length - 1) as u8);
    out.push(packet_type);
    out.extend_from_slice(&pan_id);
    out.extend_from_slice(&source_addr);
    out.push(0); // router_index always 0 on TX
    out.push(hop_count);
    out.extend_from_slice(hop_addresses);
    out.extend_from_slice(payload);
    out.push(sum_mod_256(payload));

    Ok(out)
}

/// `parse_mesh`. Fails with `TooShort`, `BadStart`, `LengthMismatch`, or
/// `BadChecksum`.
pub fn parse_mesh(bytes: &[u8]) -> Result<MeshView, WireFormatError> {
    if bytes.len() < MESH_FIXED_HEADER_LEN + 4 + 1 {
        return Err(WireFormatError::TooShort);
    }
    let start = bytes[0];
    if start != MESH_START_RX_GATEWAY && start != MESH_START_RX_NMS {
        return Err(WireFormatError::BadStart);
    }

    let declared_remainder = bytes[1] as usize;
    let total_length = declared_remainder + 1;
    if total_length != bytes.len() {
        return Err(WireFormatError::LengthMismatch);
    }

    let packet_type = bytes[2];
    let mut pan_id = [0u8; 4];
    pan_id.copy_from_slice(&bytes[3..7]);
    let mut source_addr = [0u8; 4];
    source_addr.copy_from_slice(&bytes[7..11]);
    let router_index = bytes[11];
    let hop_count = bytes[12];

    let hop_bytes = (hop_count.max(1) as usize) * 4;
    let header_len = MESH_FIXED_HEADER_LEN + hop_bytes;
    if bytes.len() < header_len + 1 {
        return Err(WireFormatError::TooShort);
    }

    let hop_addresses = bytes[MESH_FIXED_HEADER_LEN..header_len].to_vec();
    let payload = bytes[header_len..bytes.len() - 1].to_vec();
    let checksum = bytes[bytes.len() - 1];

    if sum_mod_256(&payload) != checksum {
        return Err(WireFormatError::BadChecksum);
    }

    Ok(MeshView {
        start,
        total_length,
        packet_type,
        pan_id,
        source_addr,
        router_index,
        hop_count,
        hop_addresses,
        payload,
        checksum,
    })
}

// ── DLMS frame ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlmsView {
    pub start: u8,
    pub length_field: u16,
    pub page_index: u8,
    pub frame_id: u8,
    pub command: u8,
    pub sub_command: u8,
    pub records: Vec<u8>,
    pub checksum: u8,
}

/// Offset of the length field's width: 1 byte for a request, 2 (big-endian)
/// for a response.
fn length_field_width(direction: Direction) -> usize {
    match direction {
        Direction::Request => 1,
        Direction::Response => 2,
    }
}

/// `build_dlms`. Post: checksum equals low byte of the sum of the preceding
/// bytes (every byte of the frame except the checksum itself).
pub fn build_dlms(
    direction: Direction,
    page: u8,
    frame_id: u8,
    cmd: u8,
    subcmd: u8,
    payload: &[u8],
) -> Vec<u8> {
    let start = match direction {
        Direction::Request => DLMS_START_REQUEST,
        Direction::Response => DLMS_START_RESPONSE,
    };

    // length field covers everything after itself, including the checksum.
    let body_len = 1 /*page*/ + 1 /*frame_id*/ + 1 /*cmd*/ + 1 /*subcmd*/ + payload.len() + 1 /*checksum*/;

    let mut out = Vec::with_capacity(2 + length_field_width(direction) + body_len);
    out.push(start);
    match direction {
        Direction::Request => out.push(body_len as u8),
        Direction::Response => {
            out.push(((body_len >> 8) & 0xFF) as u8);
            out.push((body_len & 0xFF) as u8);
        }
    }
    out.push(page);
    out.push(frame_id);
    out.push(cmd);
    out.push(subcmd);
    out.extend_from_slice(payload);

    let checksum = sum_mod_256(&out);
    out.push(checksum);
    out
}

/// `parse_dlms`.
pub fn parse_dlms(bytes: &[u8], direction: Direction) -> Result<DlmsView, WireFormatError> {
    let len_width = length_field_width(direction);
    if bytes.len() < 1 + len_width + 4 + 1 {
        return Err(WireFormatError::TooShort);
    }
    let start = bytes[0];
    let expected_start = match direction {
        Direction::Request => DLMS_START_REQUEST,
        Direction::Response => DLMS_START_RESPONSE,
    };
    if start != expected_start {
        return Err(WireFormatError::BadStart);
    }

    let length_field: u16 = match direction {
        Direction::Request => bytes[1] as u16,
        Direction::Response => ((bytes[1] as u16) << 8) | bytes[2] as u16,
    };

    let header_end = 1 + len_width;
    let declared_total = header_end + length_field as usize;
    if declared_total != bytes.len() {
        // "the outer wins" — callers that already validated an outer mesh
        // length should prefer that result; parse_dlms reports the
        // disagreement as LengthMismatch either way.
        return Err(WireFormatError::LengthMismatch);
    }

    let page_index = bytes[header_end];
    let frame_id = bytes[header_end + 1];
    let command = bytes[header_end + 2];
    let sub_command = bytes[header_end + 3];
    let records = bytes[header_end + 4..bytes.len() - 1].to_vec();
    let checksum = bytes[bytes.len() - 1];

    if sum_mod_256(&bytes[..bytes.len() - 1]) != checksum {
        return Err(WireFormatError::BadChecksum);
    }

    Ok(DlmsView {
        start,
        length_field,
        page_index,
        frame_id,
        command,
        sub_command,
        records,
        checksum,
    })
}

/// Locates the DLMS sub-frame by scanning past the PMESH header (offset
/// depends on hop-count) and rewrites the final byte to the recalculated
/// checksum. Used when the engine must mutate a field (e.g. page-index)
/// mid-flight without rebuilding the whole frame.
pub fn recalculate_dlms_checksum(frame: &mut [u8], total_length: usize) -> Result<(), WireFormatError> {
    if frame.len() < total_length || total_length < MESH_FIXED_HEADER_LEN + 4 + 1 {
        return Err(WireFormatError::TooShort);
    }
    let hop_count = frame[12];
    let hop_bytes = (hop_count.max(1) as usize) * 4;
    let dlms_start = MESH_FIXED_HEADER_LEN + hop_bytes;
    if dlms_start >= total_length {
        return Err(WireFormatError::TooShort);
    }
    let checksum = sum_mod_256(&frame[dlms_start..total_length - 1]);
    frame[total_length - 1] = checksum;
    Ok(())
}

// ── DLMS typed values ──────────────────────────────────────────────────────

/// Wire type tag carried in each record's `dlms-type` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DlmsType {
    None = 0x00,
    Array = 0x01,
    Structure = 0x02,
    Bool = 0x03,
    BitString = 0x04,
    Int32 = 0x05,
    Uint32 = 0x06,
    OctetString = 0x09,
    VisibleString = 0x0A,
    Int8 = 0x0F,
    Int16 = 0x10,
    Uint8 = 0x11,
    Uint16 = 0x12,
    CompactArray = 0x13,
    Int64 = 0x14,
    Uint64 = 0x15,
    Enum = 0x16,
    Float32 = 0x17,
    Float64 = 0x18,
    DateTime = 0x19,
}

impl DlmsType {
    pub fn from_u8(v: u8) -> Option<Self> {
        use DlmsType::*;
        Some(match v {
            0x00 => None,
            0x01 => Array,
            0x02 => Structure,
            0x03 => Bool,
            0x04 => BitString,
            0x05 => Int32,
            0x06 => Uint32,
            0x09 => OctetString,
            0x0A => VisibleString,
            0x0F => Int8,
            0x10 => Int16,
            0x11 => Uint8,
            0x12 => Uint16,
            0x13 => CompactArray,
            0x14 => Int64,
            0x15 => Uint64,
            0x16 => Enum,
            0x17 => Float32,
            0x18 => Float64,
            0x19 => DateTime,
            _ => return None,
        })
    }

    /// Fixed wire width in bytes, or `None` for a variable-length type whose
    /// value is preceded by a 1-byte length in the record envelope.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            DlmsType::Bool | DlmsType::Int8 | DlmsType::Uint8 | DlmsType::Enum => Some(1),
            DlmsType::Int16 | DlmsType::Uint16 => Some(2),
            DlmsType::Int32 | DlmsType::Uint32 | DlmsType::Float32 | DlmsType::DateTime => Some(4),
            DlmsType::Int64 | DlmsType::Uint64 | DlmsType::Float64 => Some(8),
            DlmsType::OctetString
            | DlmsType::VisibleString
            | DlmsType::BitString
            | DlmsType::Array
            | DlmsType::Structure
            | DlmsType::CompactArray => None,
            DlmsType::None => Some(0),
        }
    }
}

/// Tagged union over the DLMS value space (spec §3, §9 — a Rust sum type
/// standing in for the original's raw-union-plus-type-tag value).
#[derive(Debug, Clone, PartialEq)]
pub enum DlmsValue {
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    Float32(f32),
    Float64(f64),
    /// Raw seconds since epoch, wire-endian already decoded; apply
    /// `format_datetime_ist` for display.
    DateTime(u32),
    OctetString(Vec<u8>),
    String(String),
    Enum(u8),
    None,
}

/// India local-time offset applied to `DlmsValue::DateTime` for display only
/// — the stored value stays raw seconds since epoch.
pub const IST_OFFSET_SECS: i64 = 5 * 3600 + 30 * 60;

pub fn format_datetime_ist(raw_secs: u32) -> String {
    use chrono::{TimeZone, Utc};
    let shifted = raw_secs as i64 + IST_OFFSET_SECS;
    match Utc.timestamp_opt(shifted, 0).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => format!("invalid-timestamp({raw_secs})"),
    }
}

/// `extract_value`. Integer encodings are big-endian on the wire.
pub fn extract_value(dlms_type: DlmsType, bytes: &[u8]) -> Result<DlmsValue, WireFormatError> {
    use DlmsType::*;
    let need = |n: usize| -> Result<(), WireFormatError> {
        if bytes.len() < n {
            Err(WireFormatError::TooShort)
        } else {
            Ok(())
        }
    };
    Ok(match dlms_type {
        DlmsType::None => DlmsValue::None,
        Bool => {
            need(1)?;
            DlmsValue::Bool(bytes[0] != 0)
        }
        Int8 => {
            need(1)?;
            DlmsValue::Int8(bytes[0] as i8)
        }
        Uint8 => {
            need(1)?;
            DlmsValue::Uint8(bytes[0])
        }
        Enum => {
            need(1)?;
            DlmsValue::Enum(bytes[0])
        }
        Int16 => {
            need(2)?;
            DlmsValue::Int16(i16::from_be_bytes([bytes[0], bytes[1]]))
        }
        Uint16 => {
            need(2)?;
            DlmsValue::Uint16(u16::from_be_bytes([bytes[0], bytes[1]]))
        }
        Int32 => {
            need(4)?;
            DlmsValue::Int32(i32::from_be_bytes(bytes[0..4].try_into().unwrap()))
        }
        Uint32 => {
            need(4)?;
            DlmsValue::Uint32(u32::from_be_bytes(bytes[0..4].try_into().unwrap()))
        }
        Float32 => {
            need(4)?;
            DlmsValue::Float32(f32::from_be_bytes(bytes[0..4].try_into().unwrap()))
        }
        DateTime => {
            need(4)?;
            DlmsValue::DateTime(u32::from_be_bytes(bytes[0..4].try_into().unwrap()))
        }
        Int64 => {
            need(8)?;
            DlmsValue::Int64(i64::from_be_bytes(bytes[0..8].try_into().unwrap()))
        }
        Uint64 => {
            need(8)?;
            DlmsValue::Uint64(u64::from_be_bytes(bytes[0..8].try_into().unwrap()))
        }
        Float64 => {
            need(8)?;
            DlmsValue::Float64(f64::from_be_bytes(bytes[0..8].try_into().unwrap()))
        }
        OctetString => DlmsValue::OctetString(bytes.to_vec()),
        VisibleString => DlmsValue::String(String::from_utf8_lossy(bytes).into_owned()),
        BitString | Array | Structure | CompactArray => DlmsValue::OctetString(bytes.to_vec()),
    })
}

// ── typed record walk ──────────────────────────────────────────────────────

/// One `data_index | status | type | [length] | value` record, decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct DlmsRecord {
    pub data_index: u8,
    pub status: u8,
    pub dlms_type: DlmsType,
    pub value: DlmsValue,
    /// Total bytes this record occupied on the wire, for cursor advancement.
    pub wire_len: usize,
}

/// Reads one typed record starting at `bytes[0]`.
pub fn read_record(bytes: &[u8]) -> Result<DlmsRecord, WireFormatError> {
    if bytes.len() < 3 {
        return Err(WireFormatError::TooShort);
    }
    let data_index = bytes[0];
    let status = bytes[1];
    let dlms_type =
        DlmsType::from_u8(bytes[2]).ok_or(WireFormatError::LengthMismatch)?;

    let mut cursor = 3usize;
    let value_len = match dlms_type.fixed_width() {
        Some(w) => w,
        None => {
            if bytes.len() < cursor + 1 {
                return Err(WireFormatError::TooShort);
            }
            let len = bytes[cursor] as usize;
            cursor += 1;
            len
        }
    };

    if bytes.len() < cursor + value_len {
        return Err(WireFormatError::TooShort);
    }
    let value_bytes = &bytes[cursor..cursor + value_len];
    let value = extract_value(dlms_type, value_bytes)?;

    Ok(DlmsRecord {
        data_index,
        status,
        dlms_type,
        value,
        wire_len: cursor + value_len,
    })
}
