//! # fuota
//!
//! The firmware-update-over-the-air engine (§4.6): a linear 16-phase state
//! machine that silences the mesh, transfers a firmware image page by page
//! with CRC verification, activates it, and un-silences — with page/subpage
//! resume on mismatch and a fall-through to `NetworkUnsilence` whenever a
//! phase's retry ladder is exhausted.

use std::sync::OnceLock;

use crate::path_book::PathInfo;

/// `header + 8` overhead subtracted from the 128-byte frame budget to get
/// the image-transfer max payload (§4.6 step 6). `header` is this mesh
/// hop's own PMESH header length; the trailing 8 covers the DLMS/FUOTA
/// command envelope (`2F 06 06 01 s ph pl` plus checksum).
const FUOTA_COMMAND_ENVELOPE: usize = 8;
const FUOTA_FRAME_BUDGET: usize = 128;

pub fn max_payload_size(hop_count: u8) -> usize {
    let hop_bytes = (hop_count.max(1) as usize) * 4;
    let header = crate::codec::MESH_FIXED_HEADER_LEN + hop_bytes;
    FUOTA_FRAME_BUDGET - header - FUOTA_COMMAND_ENVELOPE
}

pub fn compute_page_count(image_size: u32, sector_size: u16) -> u32 {
    image_size / sector_size as u32
}

pub fn compute_subpage_count(sector_size: u16, max_payload: usize) -> u32 {
    sector_size as u32 / max_payload as u32 + 1
}

// ── CRC-16/0xA001 ───────────────────────────────────────────────────────────

fn build_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        let mut crc = i as u16;
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xA001 } else { crc >> 1 };
        }
        *slot = crc;
    }
    table
}

static CRC16_TABLE: OnceLock<[u16; 256]> = OnceLock::new();

/// CRC-16, polynomial 0xA001, initial value 0, reflected. The table is
/// built once per process and reused by every call (§4.6, §9).
pub fn crc16(data: &[u8]) -> u16 {
    let table = CRC16_TABLE.get_or_init(build_crc16_table);
    let mut crc = 0u16;
    for &b in data {
        let idx = ((crc ^ b as u16) & 0xFF) as usize;
        crc = (crc >> 8) ^ table[idx];
    }
    crc
}

// ── phases ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuotaPhase {
    OpenFile,
    GatewayPathSilence,
    TargetNodeSilence,
    NetworkSilence,
    SectorRead,
    FirmwareSectorCount,
    EraseFlash,
    ImageTransfer,
    EndOfPage,
    CrcCompute,
    Activate,
    ReadCompareFirmwareVersion,
    NetworkUnsilence,
    TargetNodeUnsilence,
    GatewayPathUnsilence,
    RollbackToNormal,
}

impl FuotaPhase {
    pub fn next_on_success(self) -> Self {
        use FuotaPhase::*;
        match self {
            OpenFile => GatewayPathSilence,
            GatewayPathSilence => TargetNodeSilence,
            TargetNodeSilence => NetworkSilence,
            NetworkSilence => SectorRead,
            SectorRead => FirmwareSectorCount,
            FirmwareSectorCount => EraseFlash,
            EraseFlash => ImageTransfer,
            ImageTransfer => EndOfPage,
            EndOfPage => CrcCompute,
            CrcCompute => Activate,
            Activate => ReadCompareFirmwareVersion,
            ReadCompareFirmwareVersion => NetworkUnsilence,
            NetworkUnsilence => TargetNodeUnsilence,
            TargetNodeUnsilence => GatewayPathUnsilence,
            GatewayPathUnsilence => RollbackToNormal,
            RollbackToNormal => RollbackToNormal,
        }
    }

    /// Where retry-ladder exhaustion in this phase lands: the unsilence
    /// chain restores normal comms unless we're already in it, in which case
    /// we fall straight through to rollback.
    pub fn on_retries_exhausted(self) -> Self {
        use FuotaPhase::*;
        match self {
            NetworkUnsilence | TargetNodeUnsilence | GatewayPathUnsilence | RollbackToNormal => {
                RollbackToNormal
            }
            _ => NetworkUnsilence,
        }
    }

    /// `dlms_fuota_upload.status` value while this phase is in progress.
    /// `0` and `1` are reserved terminal markers (rollback-failure / success
    /// at activation, §4.6) so `recent_fuota_resume`'s `status NOT IN (0, 1)`
    /// filter only ever resumes a session actually mid-flight.
    pub fn status_code(self) -> u8 {
        use FuotaPhase::*;
        match self {
            OpenFile => 2,
            GatewayPathSilence => 3,
            TargetNodeSilence => 4,
            NetworkSilence => 5,
            SectorRead => 6,
            FirmwareSectorCount => 7,
            EraseFlash => 8,
            ImageTransfer => 9,
            EndOfPage => 10,
            CrcCompute => 11,
            Activate => 12,
            ReadCompareFirmwareVersion => 13,
            NetworkUnsilence => 14,
            TargetNodeUnsilence => 15,
            GatewayPathUnsilence => 16,
            RollbackToNormal => 17,
        }
    }
}

/// §4.6: "at session start, the engine consults the store for a FUOTA record
/// scheduled within the last 30 minutes for this gateway; if found, it jumps
/// directly to OpenFile with that record."
pub const RESUME_WINDOW_SECS: u64 = 30 * 60;

/// The four-step silence/un-silence sub-sequence (§4.6 phases 2-4, 13-15).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SilenceStep {
    FuotaEnable,
    FuotaModeEntry,
    FlashSave,
    FlashExit,
}

impl SilenceStep {
    pub fn next(self) -> Option<Self> {
        use SilenceStep::*;
        match self {
            FuotaEnable => Some(FuotaModeEntry),
            FuotaModeEntry => Some(FlashSave),
            FlashSave => Some(FlashExit),
            FlashExit => None,
        }
    }
}

/// Enumerates leaves — nodes not used as an intermediate hop by any other
/// node's primary route — excluding `target`. Used by `NetworkSilence`
/// (§4.6 phase 4, Testable Property #8).
pub fn detect_leaves(routes: &[([u8; 8], PathInfo)], target: [u8; 8]) -> Vec<[u8; 8]> {
    let mut used_as_hop: std::collections::HashSet<[u8; 4]> = Default::default();
    for (_, path) in routes {
        let n = path.hop_addresses.len();
        if n > 4 {
            for chunk in path.hop_addresses[..n - 4].chunks(4) {
                let mut addr = [0u8; 4];
                addr.copy_from_slice(chunk);
                used_as_hop.insert(addr);
            }
        }
    }
    routes
        .iter()
        .filter(|(mac, _)| *mac != target)
        .filter(|(_, path)| !used_as_hop.contains(&path.final_destination()))
        .map(|(mac, _)| *mac)
        .collect()
}

// ── wire frames ──────────────────────────────────────────────────────────

/// Start byte for a FUOTA image-transfer/CRC request, distinct from the
/// ordinary `DLMS_START_REQUEST` (0x2B) — responses still come back tagged
/// `DLMS_START_RESPONSE` (0x2D), same as any other DLMS reply.
pub const FUOTA_REQUEST_START: u8 = 0x2F;

const IMAGE_TRANSFER_FRAME_ID: u8 = 0x06;
const IMAGE_TRANSFER_COMMAND: u8 = 0x01;
const IMAGE_TRANSFER_RESPONSE_FRAME_ID: u8 = 0x07;
const CRC_FRAME_ID: u8 = 0x0A;
const CRC_COMMAND: u8 = 0x01;

/// `2F <len> 06 01 <subpage> <page-hi> <page-lo> <payload...> <checksum>`
/// — one image-transfer subpage command (§4.6 step 8). `len` is the request's
/// single-byte length field, same convention as `codec::build_dlms`: it
/// covers everything after itself, including the trailing checksum.
pub fn build_image_transfer_frame(subpage: u8, page: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(7 + payload.len());
    out.push(FUOTA_REQUEST_START);
    out.push(0); // patched below
    out.push(IMAGE_TRANSFER_FRAME_ID);
    out.push(IMAGE_TRANSFER_COMMAND);
    out.push(subpage);
    out.push((page >> 8) as u8);
    out.push(page as u8);
    out.extend_from_slice(payload);
    let body_len = (out.len() - 2) + 1; // frame_id..payload, plus the checksum byte
    out[1] = body_len as u8;
    let checksum = crate::codec::sum_mod_256(&out);
    out.push(checksum);
    out
}

/// Parses the image-transfer ack/mismatch response
/// `2D <len> 07 01 <subpage> <page-hi> <page-lo> <status>` into the event the
/// image-transfer ladder reacts to. `00` and `01` ack the subpage (last of its
/// page, or not); `02`/`03` report a subpage/page mismatch the target wants
/// resumed from.
pub fn parse_image_transfer_response(bytes: &[u8]) -> Result<ImageTransferEvent, crate::error::WireFormatError> {
    use crate::error::WireFormatError;
    if bytes.len() < 8 {
        return Err(WireFormatError::TooShort);
    }
    if bytes[0] != crate::codec::DLMS_START_RESPONSE {
        return Err(WireFormatError::BadStart);
    }
    let checksum = bytes[bytes.len() - 1];
    if crate::codec::sum_mod_256(&bytes[..bytes.len() - 1]) != checksum {
        return Err(WireFormatError::BadChecksum);
    }
    if bytes[2] != IMAGE_TRANSFER_RESPONSE_FRAME_ID {
        return Err(WireFormatError::LengthMismatch);
    }
    let subpage = bytes[4] as u32;
    let page = ((bytes[5] as u32) << 8) | bytes[6] as u32;
    let status = bytes[7];
    Ok(match status {
        0x00 => ImageTransferEvent::Ack { last_subpage_of_page: true },
        0x01 => ImageTransferEvent::Ack { last_subpage_of_page: false },
        0x02 => ImageTransferEvent::SubpageMismatch { page, subpage },
        0x03 => ImageTransferEvent::PageMismatch { page, subpage },
        _ => return Err(WireFormatError::LengthMismatch),
    })
}

/// `2F <len> 0A 01 <crc-hi> <crc-lo> <checksum>` — whole-file CRC verify
/// (§4.6 step 10).
pub fn build_crc_frame(crc: u16) -> Vec<u8> {
    let mut out = vec![FUOTA_REQUEST_START, 0, CRC_FRAME_ID, CRC_COMMAND];
    out.extend_from_slice(&crc.to_be_bytes());
    let body_len = (out.len() - 2) + 1;
    out[1] = body_len as u8;
    let checksum = crate::codec::sum_mod_256(&out);
    out.push(checksum);
    out
}

// ── image transfer loop ────────────────────────────────────────────────────

pub const IMAGE_RETRY_COUNT_MAX: u8 = 3;
pub const IMAGE_ALTERNATE_RETRY_COUNT_MAX: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageTransferEvent {
    /// `00` (last subpage of its page) or `01` (more subpages follow).
    Ack { last_subpage_of_page: bool },
    Timeout,
    /// Mesh payload tail `02` — target reports its last-completed (page, subpage).
    SubpageMismatch { page: u32, subpage: u32 },
    /// Mesh payload tail `03` — page mismatch, same recovery as subpage mismatch.
    PageMismatch { page: u32, subpage: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageTransferAction {
    SendSubpage { page: u32, subpage: u32 },
    ResendSameRoute,
    SwitchAlternateSameHopCount,
    SeekAndResume { file_offset: u64, resume_page: u32, resume_subpage: u32 },
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ImageTransferState {
    pub page: u32,
    pub subpage: u32,
    pub page_count: u32,
    pub subpage_count: u32,
    pub sector_size: u16,
    pub max_payload: usize,
    retry_count: u8,
    alternate_retry_count: u8,
}

impl ImageTransferState {
    pub fn new(page_count: u32, subpage_count: u32, sector_size: u16, max_payload: usize) -> Self {
        Self {
            page: 0,
            subpage: 0,
            page_count,
            subpage_count,
            sector_size,
            max_payload,
            retry_count: 0,
            alternate_retry_count: 0,
        }
    }

    fn seek_offset(&self, page: u32, subpage: u32) -> u64 {
        page as u64 * self.sector_size as u64 + subpage as u64 * self.max_payload as u64
    }

    pub fn on_event(&mut self, event: ImageTransferEvent) -> ImageTransferAction {
        match event {
            ImageTransferEvent::Ack { last_subpage_of_page } => {
                self.retry_count = 0;
                self.alternate_retry_count = 0;
                if last_subpage_of_page {
                    self.subpage = 0;
                    self.page += 1;
                } else {
                    self.subpage += 1;
                }
                if self.page >= self.page_count {
                    ImageTransferAction::Done
                } else {
                    ImageTransferAction::SendSubpage { page: self.page, subpage: self.subpage }
                }
            }
            ImageTransferEvent::Timeout => {
                self.retry_count += 1;
                if self.retry_count < IMAGE_RETRY_COUNT_MAX {
                    return ImageTransferAction::ResendSameRoute;
                }
                self.alternate_retry_count += 1;
                if self.alternate_retry_count > IMAGE_ALTERNATE_RETRY_COUNT_MAX {
                    return ImageTransferAction::Failed;
                }
                self.retry_count = 0;
                ImageTransferAction::SwitchAlternateSameHopCount
            }
            ImageTransferEvent::SubpageMismatch { page, subpage } | ImageTransferEvent::PageMismatch { page, subpage } => {
                let offset = self.seek_offset(page, subpage);
                self.page = page;
                self.subpage = subpage + 1;
                if self.subpage >= self.subpage_count {
                    self.subpage = 0;
                    self.page += 1;
                }
                ImageTransferAction::SeekAndResume {
                    file_offset: offset,
                    resume_page: self.page,
                    resume_subpage: self.subpage,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_stable_across_calls_property_7() {
        let data = b"firmware image bytes, repeated enough to matter";
        let first = crc16(data);
        let second = crc16(data);
        assert_eq!(first, second);
        assert_eq!(crc16(b""), 0);
    }

    #[test]
    fn leaf_detection_excludes_target_and_intermediate_hops() {
        let leaf_a = (
            [0, 0, 0, 0, 0, 0, 0, 1],
            PathInfo { hop_count: 0, hop_addresses: vec![9, 9, 9, 1] },
        );
        let leaf_b = (
            [0, 0, 0, 0, 0, 0, 0, 2],
            PathInfo { hop_count: 0, hop_addresses: vec![9, 9, 9, 2] },
        );
        // target routed through leaf_a's address as an intermediate hop.
        let target = (
            [0, 0, 0, 0, 0, 0, 0, 3],
            PathInfo { hop_count: 1, hop_addresses: vec![9, 9, 9, 1, 9, 9, 9, 3] },
        );
        let routes = vec![leaf_a.clone(), leaf_b.clone(), target.clone()];
        let leaves = detect_leaves(&routes, target.0);
        assert_eq!(leaves, vec![leaf_b.0]);
    }

    #[test]
    fn scenario_f_subpage_mismatch_resumes_from_reported_plus_one() {
        let sector = 4096u16;
        let max_payload = 120usize;
        let mut state = ImageTransferState::new(50, 10, sector, max_payload);
        state.page = 10;
        state.subpage = 3;

        let action = state.on_event(ImageTransferEvent::SubpageMismatch { page: 8, subpage: 5 });
        let expected_offset = 8u64 * sector as u64 + 5 * max_payload as u64;
        assert_eq!(
            action,
            ImageTransferAction::SeekAndResume {
                file_offset: expected_offset,
                resume_page: 8,
                resume_subpage: 6,
            }
        );
        assert_eq!(state.page, 8);
        assert_eq!(state.subpage, 6);
    }

    #[test]
    fn image_transfer_retry_then_alternate_then_fail() {
        let mut state = ImageTransferState::new(2, 2, 4096, 120);
        assert_eq!(state.on_event(ImageTransferEvent::Timeout), ImageTransferAction::ResendSameRoute);
        assert_eq!(state.on_event(ImageTransferEvent::Timeout), ImageTransferAction::ResendSameRoute);
        assert_eq!(
            state.on_event(ImageTransferEvent::Timeout),
            ImageTransferAction::SwitchAlternateSameHopCount
        );
        for _ in 0..IMAGE_ALTERNATE_RETRY_COUNT_MAX {
            assert_eq!(state.on_event(ImageTransferEvent::Timeout), ImageTransferAction::ResendSameRoute);
            assert_eq!(state.on_event(ImageTransferEvent::Timeout), ImageTransferAction::ResendSameRoute);
            let switch_or_fail = state.on_event(ImageTransferEvent::Timeout);
            if switch_or_fail == ImageTransferAction::Failed {
                return;
            }
            assert_eq!(switch_or_fail, ImageTransferAction::SwitchAlternateSameHopCount);
        }
        panic!("expected Failed before exhausting the loop");
    }

    #[test]
    fn image_transfer_frame_round_trips_through_its_own_checksum() {
        let frame = build_image_transfer_frame(3, 12, &[0xAA, 0xBB, 0xCC]);
        assert_eq!(frame[0], FUOTA_REQUEST_START);
        assert_eq!(frame[2], IMAGE_TRANSFER_FRAME_ID);
        assert_eq!(frame[3], IMAGE_TRANSFER_COMMAND);
        assert_eq!(frame[4], 3); // subpage
        assert_eq!(frame[5], 0); // page hi
        assert_eq!(frame[6], 12); // page lo
        let checksum = *frame.last().unwrap();
        assert_eq!(crate::codec::sum_mod_256(&frame[..frame.len() - 1]), checksum);
    }

    #[test]
    fn image_transfer_response_parses_ack_and_mismatch_status_bytes() {
        let mut resp = vec![crate::codec::DLMS_START_RESPONSE, 0, IMAGE_TRANSFER_RESPONSE_FRAME_ID, 0x01, 5, 0, 9, 0x00];
        let checksum = crate::codec::sum_mod_256(&resp);
        resp.push(checksum);
        assert_eq!(
            parse_image_transfer_response(&resp).unwrap(),
            ImageTransferEvent::Ack { last_subpage_of_page: true }
        );

        let mut mismatch = vec![crate::codec::DLMS_START_RESPONSE, 0, IMAGE_TRANSFER_RESPONSE_FRAME_ID, 0x01, 4, 0, 7, 0x02];
        let checksum = crate::codec::sum_mod_256(&mismatch);
        mismatch.push(checksum);
        assert_eq!(
            parse_image_transfer_response(&mismatch).unwrap(),
            ImageTransferEvent::SubpageMismatch { page: 7, subpage: 4 }
        );
    }

    #[test]
    fn crc_frame_carries_big_endian_crc_and_valid_checksum() {
        let frame = build_crc_frame(0x1234);
        assert_eq!(frame[2], CRC_FRAME_ID);
        assert_eq!(frame[3], CRC_COMMAND);
        assert_eq!(frame[4], 0x12);
        assert_eq!(frame[5], 0x34);
        let checksum = *frame.last().unwrap();
        assert_eq!(crate::codec::sum_mod_256(&frame[..frame.len() - 1]), checksum);
    }

    #[test]
    fn phase_status_codes_avoid_the_reserved_terminal_markers() {
        assert_ne!(FuotaPhase::OpenFile.status_code(), 0);
        assert_ne!(FuotaPhase::OpenFile.status_code(), 1);
        assert_ne!(FuotaPhase::RollbackToNormal.status_code(), 0);
        assert_ne!(FuotaPhase::RollbackToNormal.status_code(), 1);
    }

    #[test]
    fn ack_advances_subpage_then_page_then_completes() {
        let mut state = ImageTransferState::new(1, 2, 4096, 120);
        let a1 = state.on_event(ImageTransferEvent::Ack { last_subpage_of_page: false });
        assert_eq!(a1, ImageTransferAction::SendSubpage { page: 0, subpage: 1 });
        let a2 = state.on_event(ImageTransferEvent::Ack { last_subpage_of_page: true });
        assert_eq!(a2, ImageTransferAction::Done);
    }
}
