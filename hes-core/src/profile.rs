//! # profile
//!
//! Converts a sequence of (potentially paged) DLMS response frames for one
//! profile kind into a keyed structure of `DlmsValue`s, and implements the
//! paging-rewrite rule that lets the transactor re-issue a DLP/BLP/BHP
//! request for its next page.

use std::collections::BTreeMap;

use crate::codec::{self, DlmsRecord, DlmsValue};
use crate::error::WireFormatError;

/// Frame-ID byte values from the dispatch table (§4.4).
pub mod frame_id {
    pub const INSTANT_DATA: u8 = 0x0E;
    pub const OBIS_SCALAR_LIST: u8 = 0x0A;
    pub const SINGLE_OBIS: u8 = 0x0F;
    pub const CACHE_DATA: u8 = 0x0C;
}

/// Single-OBIS (frame 0x0F) command id for an internal-firmware-version
/// read. The other single-OBIS commands this network issues (RTC, capture
/// period, load-limit, load-status, action-scheduler) occupy ids below this
/// one; IFV takes the next free slot in that same command space.
pub const IFV_COMMAND: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileKind {
    Nameplate,
    Instantaneous,
    Billing,
    DailyLoad,
    BlockLoad,
    Events,
    ScalarMetadata,
}

impl ProfileKind {
    /// Command-ID byte used under `frame_id::INSTANT_DATA` / `OBIS_SCALAR_LIST`.
    pub fn command_id(self) -> u8 {
        match self {
            ProfileKind::Nameplate => 0,
            ProfileKind::Instantaneous => 1,
            ProfileKind::Billing => 2,
            ProfileKind::DailyLoad => 3,
            ProfileKind::BlockLoad => 4,
            ProfileKind::Events => 8,
            ProfileKind::ScalarMetadata => 0, // reuses nameplate's command id, but under OBIS_SCALAR_LIST frame
        }
    }

    /// Whether this profile takes the two-stage (truncate-and-substitute)
    /// paging rewrite of §4.4, vs. the plain page-index-increment rule.
    pub fn uses_tail_rewrite(self) -> bool {
        matches!(self, ProfileKind::DailyLoad | ProfileKind::BlockLoad | ProfileKind::Billing)
    }

    /// Byte length of the trailing span the engine truncates on first `NextPage`.
    pub fn rewrite_tail_len(self) -> Option<usize> {
        match self {
            ProfileKind::DailyLoad | ProfileKind::BlockLoad => Some(18),
            ProfileKind::Billing => Some(13), // BHP
            _ => None,
        }
    }

    /// The literal 8-byte next-page-fetch template substituted in place of
    /// the truncated tail. DLP's is given verbatim by the protocol
    /// (`2B 07 01 0E 03 00 00 44`); BLP/BHP follow the same shape with their
    /// own command byte and a checksum recomputed to match.
    pub fn next_page_template(self) -> Option<[u8; 8]> {
        match self {
            ProfileKind::DailyLoad => Some([0x2B, 0x07, 0x01, 0x0E, 0x03, 0x00, 0x00, 0x44]),
            ProfileKind::BlockLoad => {
                let mut tpl = [0x2B, 0x07, 0x01, 0x0E, 0x04, 0x00, 0x00, 0x00];
                tpl[7] = codec::sum_mod_256(&tpl[0..7]);
                Some(tpl)
            }
            ProfileKind::Billing => {
                let mut tpl = [0x2B, 0x07, 0x01, 0x0E, 0x02, 0x00, 0x00, 0x00];
                tpl[7] = codec::sum_mod_256(&tpl[0..7]);
                Some(tpl)
            }
            _ => None,
        }
    }
}

/// Accumulated decode state for one profile pull across however many pages
/// the meter sends.
#[derive(Debug, Clone, Default)]
pub struct ProfileBuffer {
    pub fields: BTreeMap<u8, Vec<DlmsValue>>,
    pub last_packet_timestamp: Option<u32>,
    pub packet_count: u32,
}

impl ProfileBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest_page(&mut self, records: &[DlmsRecord]) {
        for rec in records {
            self.fields.entry(rec.data_index).or_default().push(rec.value.clone());
            if let DlmsValue::DateTime(raw) = rec.value {
                self.last_packet_timestamp = Some(raw);
            }
        }
        self.packet_count += 1;
    }
}

/// Walks `bytes` as a sequence of typed records until fully consumed.
pub fn walk_records(bytes: &[u8]) -> Result<Vec<DlmsRecord>, WireFormatError> {
    let mut out = Vec::new();
    let mut cursor = 0usize;
    while cursor < bytes.len() {
        let rec = codec::read_record(&bytes[cursor..])?;
        cursor += rec.wire_len;
        out.push(rec);
    }
    Ok(out)
}

/// Rewrites `frame` (a full mesh-framed request) for the next page of a
/// DLP/BLP/BHP pull: truncates the profile's tail span and substitutes the
/// literal 8-byte next-page template, updating the mesh length byte and
/// recomputing the trailing payload checksum.
pub fn rewrite_for_next_page(frame: &[u8], kind: ProfileKind) -> Result<Vec<u8>, WireFormatError> {
    let tail_len = kind.rewrite_tail_len().ok_or(WireFormatError::LengthMismatch)?;
    let template = kind.next_page_template().ok_or(WireFormatError::LengthMismatch)?;
    if frame.len() < tail_len {
        return Err(WireFormatError::TooShort);
    }

    let mut out = frame[..frame.len() - tail_len].to_vec();
    out.extend_from_slice(&template);

    let total_len = out.len();
    out[1] = (total_len - 1) as u8;

    let hop_count = out[12];
    let hop_bytes = (hop_count.max(1) as usize) * 4;
    let header_len = codec::MESH_FIXED_HEADER_LEN + hop_bytes;
    if header_len >= total_len {
        return Err(WireFormatError::TooShort);
    }
    let checksum = codec::sum_mod_256(&out[header_len..total_len - 1]);
    let last = total_len - 1;
    out[last] = checksum;

    Ok(out)
}

/// `"CONNECTED"` / `"DISCONNECTED"` decode for the single-byte ping-meter
/// load-status response (frame 0x0F).
pub fn decode_ping_load_status(byte: u8) -> &'static str {
    if byte != 0 {
        "CONNECTED"
    } else {
        "DISCONNECTED"
    }
}

/// The seven event sub-commands of §4.4's `parse_events`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    PowerFailure,
    VoltageRelated,
    CurrentRelated,
    TransactionRelated,
    TamperRelated,
    OtherRelated,
    NonRollOverRelated,
}

impl EventKind {
    pub fn from_sub_command(v: u8) -> Option<Self> {
        Some(match v {
            0 => EventKind::PowerFailure,
            1 => EventKind::VoltageRelated,
            2 => EventKind::CurrentRelated,
            3 => EventKind::TransactionRelated,
            4 => EventKind::TamperRelated,
            5 => EventKind::OtherRelated,
            6 => EventKind::NonRollOverRelated,
            _ => return None,
        })
    }
}

/// One decoded event record: the per-kind `EventDataIndex` byte plus its
/// concrete field records.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub kind: EventKind,
    pub event_data_index: u8,
    pub fields: Vec<DlmsRecord>,
}

/// `parse_events`. `bytes` is the DLMS response body following the
/// frame/command/sub-command header: one `EventDataIndex` byte, then the
/// typed records for that event.
pub fn parse_events(sub_command: u8, bytes: &[u8]) -> Result<EventRecord, WireFormatError> {
    let kind = EventKind::from_sub_command(sub_command).ok_or(WireFormatError::LengthMismatch)?;
    if bytes.is_empty() {
        return Err(WireFormatError::TooShort);
    }
    let event_data_index = bytes[0];
    let fields = walk_records(&bytes[1..])?;
    Ok(EventRecord { kind, event_data_index, fields })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DlmsType;

    #[test]
    fn ingest_page_accumulates_across_pages() {
        let mut buf = ProfileBuffer::new();
        let rec1 = DlmsRecord {
            data_index: 1,
            status: 0,
            dlms_type: DlmsType::Uint32,
            value: DlmsValue::Uint32(10),
            wire_len: 7,
        };
        let rec2 = DlmsRecord {
            data_index: 1,
            status: 0,
            dlms_type: DlmsType::Uint32,
            value: DlmsValue::Uint32(20),
            wire_len: 7,
        };
        buf.ingest_page(&[rec1]);
        buf.ingest_page(&[rec2]);
        assert_eq!(buf.packet_count, 2);
        assert_eq!(buf.fields[&1], vec![DlmsValue::Uint32(10), DlmsValue::Uint32(20)]);
    }

    #[test]
    fn walk_records_consumes_fixed_and_variable_widths() {
        let mut bytes = vec![1, 0, DlmsType::Uint16 as u8, 0x00, 0x2A];
        bytes.extend_from_slice(&[2, 0, DlmsType::OctetString as u8, 2, 0xAB, 0xCD]);
        let records = walk_records(&bytes).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].value, DlmsValue::Uint16(0x2A));
        assert_eq!(records[1].value, DlmsValue::OctetString(vec![0xAB, 0xCD]));
    }

    #[test]
    fn scenario_d_paging_rewrite() {
        // Build an 18-byte DLP "tail" standing in for whatever the original
        // first-page request happened to end with, appended to a minimal
        // hop-count-0 mesh header so the rewrite can locate and recompute.
        let original_tail = [0u8; 18];
        let mut frame = vec![0x2E, 0, 0x07, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 2, 3, 4];
        frame.extend_from_slice(&original_tail);
        let total_len = frame.len();
        frame[1] = (total_len - 1) as u8;

        let rewritten = rewrite_for_next_page(&frame, ProfileKind::DailyLoad).unwrap();
        let new_total = rewritten.len();
        assert_eq!(new_total, total_len - 18 + 8);
        assert_eq!(rewritten[1], (new_total - 1) as u8);
        let tail: &[u8] = &rewritten[rewritten.len() - 8..];
        assert_eq!(tail, &[0x2B, 0x07, 0x01, 0x0E, 0x03, 0x00, 0x00, 0x44]);
    }

    #[test]
    fn ping_load_status_decode() {
        assert_eq!(decode_ping_load_status(0), "DISCONNECTED");
        assert_eq!(decode_ping_load_status(1), "CONNECTED");
    }

    #[test]
    fn parse_events_reads_data_index_then_fields() {
        let mut bytes = vec![0x05u8]; // EventDataIndex
        bytes.extend_from_slice(&[1, 0, DlmsType::Uint8 as u8, 7]);
        let event = parse_events(4, &bytes).unwrap();
        assert_eq!(event.kind, EventKind::TamperRelated);
        assert_eq!(event.event_data_index, 0x05);
        assert_eq!(event.fields.len(), 1);
        assert_eq!(event.fields[0].value, DlmsValue::Uint8(7));
    }
}
