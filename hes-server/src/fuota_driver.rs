//! # fuota_driver
//!
//! Walks one FUOTA session end to end (§4.6): silence the mesh, transfer the
//! firmware page by page, activate, un-silence, or roll back on exhausted
//! retries. Reuses the same `Transactor`/`classify_response` retry ladder as
//! `gateway::issue_pull`/`dispatch_odm` for every phase except
//! `ImageTransfer`, whose ack/mismatch semantics have their own ladder in
//! `hes_core::fuota::ImageTransferState` — per §4.6, every other phase
//! "retries under the §4.3 ladder on failure".

use std::time::Duration;

use tracing::{info, warn};

use hes_core::codec::{self, Direction, DlmsView, MeshPacketType};
use hes_core::error::EngineError;
use hes_core::fuota::{self, FuotaPhase, ImageTransferAction, ImageTransferEvent, ImageTransferState, SilenceStep};
use hes_core::path_book::{PathBook, PathInfo};
use hes_core::store_api::Store;
use hes_core::transactor::{LadderAction, TerminalOutcome, Transactor};

use crate::config::Config;
use crate::firmware::FirmwareFile;
use crate::transport::TcpTransport;

/// FUOTA phase command frame-ids (§4.6 phases 2-3, 5-7, 9, 11-12, 13-15).
/// `ImageTransfer` and `CrcCompute` instead use the literal wire shapes in
/// `hes_core::fuota::build_image_transfer_frame`/`build_crc_frame`.
mod phase_frame_id {
    pub const SILENCE_ENABLE: u8 = 0x20;
    pub const SILENCE_MODE_ENTRY: u8 = 0x21;
    pub const SILENCE_FLASH_SAVE: u8 = 0x22;
    pub const SILENCE_FLASH_EXIT: u8 = 0x23;
    pub const UNSILENCE_ENABLE: u8 = 0x24;
    pub const UNSILENCE_MODE_ENTRY: u8 = 0x25;
    pub const UNSILENCE_FLASH_SAVE: u8 = 0x26;
    pub const UNSILENCE_FLASH_EXIT: u8 = 0x27;
    pub const SECTOR_READ: u8 = 0x28;
    pub const SECTOR_COUNT: u8 = 0x29;
    pub const ERASE_FLASH: u8 = 0x2A;
    pub const END_OF_PAGE: u8 = 0x2B;
    pub const ACTIVATE_READ: u8 = 0x2C;
    pub const ACTIVATE_STATUS_READ: u8 = 0x2D;
    pub const FW_VERSION_READ: u8 = 0x2E;
}

const FUOTA_COMMAND: u8 = 0x01;

pub struct FuotaRequest {
    pub target_mac: [u8; 8],
    pub firmware_path: String,
}

fn alt_refs(v: &[PathInfo]) -> Vec<&PathInfo> {
    v.iter().collect()
}

fn wrap_mesh(route: &PathInfo, inner: Vec<u8>) -> Result<Vec<u8>, EngineError> {
    let hop_addresses = if route.hop_addresses.is_empty() { vec![0, 0, 0, 0] } else { route.hop_addresses.clone() };
    Ok(codec::build_mesh(MeshPacketType::FuotaDataQuery as u8, [0; 4], [0; 4], route.hop_count, &hop_addresses, &inner)?)
}

/// Drives `route`'s retry ladder, rebuilding the inner frame with
/// `build_inner` whenever the route changes (so alternate switches still
/// address the right hop chain). `build_inner`'s argument is the current
/// route; most callers ignore it.
async fn run_ladder_command(
    transport: &TcpTransport,
    route: &PathInfo,
    alternates: &[&PathInfo],
    timeout: Duration,
    mut build_inner: impl FnMut(&PathInfo) -> Vec<u8>,
) -> Result<TerminalOutcome, EngineError> {
    let mut transactor = Transactor::new(route, alternates, false);
    let mut frame = wrap_mesh(route, build_inner(route))?;
    loop {
        transport.send(&frame).await?;
        let raw = transport.recv(timeout).await?;
        let event = hes_core::transactor::classify_response(&raw, route.final_destination(), transactor.expected_page_index());
        match transactor.on_event(event) {
            LadderAction::Done(outcome) => return Ok(outcome),
            LadderAction::ResendSameRoute | LadderAction::WaitAndResend => continue,
            LadderAction::SwitchAlternateAndResend => {
                let current = transactor.current_route();
                frame = wrap_mesh(current, build_inner(current))?;
            }
            LadderAction::SendNextPage => continue,
            LadderAction::SendDlmsEnable => {
                transport.send(&hes_core::transactor::DLMS_ENABLE_REQUEST).await?;
            }
            LadderAction::RecomputeChecksumAndResend => {
                let len = frame.len();
                codec::recalculate_dlms_checksum(&mut frame, len)?;
            }
        }
    }
}

async fn run_phase_command(
    transport: &TcpTransport,
    route: &PathInfo,
    alternates: &[&PathInfo],
    timeout: Duration,
    frame_id: u8,
    payload: Vec<u8>,
) -> Result<TerminalOutcome, EngineError> {
    run_ladder_command(transport, route, alternates, timeout, move |_| {
        codec::build_dlms(Direction::Request, 0, frame_id, FUOTA_COMMAND, 0, &payload)
    })
    .await
}

fn outcome_succeeded(outcome: &TerminalOutcome) -> bool {
    matches!(outcome, TerminalOutcome::Success(_) | TerminalOutcome::DlmsError(_))
}

/// Reads the first two response bytes of the last accumulated page as a
/// big-endian value (sector size / firmware size echoes, §4.6 steps 5-6).
fn extract_u16(outcome: &TerminalOutcome) -> Option<u16> {
    if let TerminalOutcome::Success(pages) = outcome {
        let last: &DlmsView = pages.last()?;
        if last.records.len() >= 2 {
            return Some(((last.records[0] as u16) << 8) | last.records[1] as u16);
        }
    }
    None
}

/// The four-step silence/un-silence sub-sequence (§4.6 phases 2-4, 13-15).
/// After `FlashSave`/`FlashExit` an extra `post_flash_command_sleep` elapses
/// before the next send, per §5.
async fn run_silence_steps(
    transport: &TcpTransport,
    route: &PathInfo,
    alternates: &[&PathInfo],
    config: &Config,
    enable_id: u8,
    mode_entry_id: u8,
    flash_save_id: u8,
    flash_exit_id: u8,
) -> bool {
    let mut step = Some(SilenceStep::FuotaEnable);
    while let Some(s) = step {
        let frame_id = match s {
            SilenceStep::FuotaEnable => enable_id,
            SilenceStep::FuotaModeEntry => mode_entry_id,
            SilenceStep::FlashSave => flash_save_id,
            SilenceStep::FlashExit => flash_exit_id,
        };
        let outcome = match run_phase_command(transport, route, alternates, config.silence_step_ack_wait, frame_id, Vec::new()).await {
            Ok(o) => o,
            Err(err) => {
                warn!(?err, ?s, "fuota silence step failed");
                return false;
            }
        };
        if !outcome_succeeded(&outcome) {
            return false;
        }
        if matches!(s, SilenceStep::FlashSave | SilenceStep::FlashExit) {
            tokio::time::sleep(config.post_flash_command_sleep).await;
        }
        step = s.next();
    }
    true
}

/// §4.6 phase 4: silences every leaf (excluding the target) regardless of
/// individual leaf failures, recording each success.
async fn run_network_silence(
    transport: &TcpTransport,
    store: &dyn Store,
    gateway_id: &str,
    path_book: &PathBook,
    target_mac: [u8; 8],
    config: &Config,
) -> bool {
    let routes = path_book.all_routes();
    let leaves = fuota::detect_leaves(&routes, target_mac);
    for leaf in leaves {
        let Some(leaf_primary) = path_book.primary(leaf).cloned() else { continue };
        let leaf_alternates: Vec<PathInfo> =
            path_book.alternates(leaf, Some(leaf_primary.hop_count)).into_iter().cloned().collect();
        let ok = run_silence_steps(
            transport,
            &leaf_primary,
            &alt_refs(&leaf_alternates),
            config,
            phase_frame_id::SILENCE_ENABLE,
            phase_frame_id::SILENCE_MODE_ENTRY,
            phase_frame_id::SILENCE_FLASH_SAVE,
            phase_frame_id::SILENCE_FLASH_EXIT,
        )
        .await;
        if ok {
            let _ = store.record_silenced(gateway_id, leaf).await;
        } else {
            warn!(gateway_id, mac = ?leaf, "fuota leaf silence failed, continuing with remaining leaves");
        }
    }
    true
}

/// §4.6 step 8: one page/subpage at a time, switching routes and resuming
/// from a reported position on mismatch.
async fn run_image_transfer(
    transport: &TcpTransport,
    route: &PathInfo,
    alternates: &[&PathInfo],
    config: &Config,
    firmware: &mut FirmwareFile,
    mut state: ImageTransferState,
) -> bool {
    let mut current_alt: Option<usize> = None;
    let mut page = state.page;
    let mut subpage = state.subpage;

    loop {
        let current_route = match current_alt {
            None => route,
            Some(i) => alternates.get(i).copied().unwrap_or(route),
        };
        let offset = page as u64 * state.sector_size as u64 + subpage as u64 * state.max_payload as u64;
        let payload = match firmware.read_at(offset, state.max_payload) {
            Ok(p) => p,
            Err(err) => {
                warn!(?err, "fuota firmware read failed mid-transfer");
                return false;
            }
        };

        let inner = fuota::build_image_transfer_frame(subpage as u8, page, &payload);
        let frame = match wrap_mesh(current_route, inner) {
            Ok(f) => f,
            Err(err) => {
                warn!(?err, "fuota image-transfer frame build failed");
                return false;
            }
        };
        if transport.send(&frame).await.is_err() {
            return false;
        }

        let event = match transport.recv(config.socket_recv_timeout_extended).await {
            Ok(raw) => fuota::parse_image_transfer_response(&raw).unwrap_or(ImageTransferEvent::Timeout),
            Err(_) => ImageTransferEvent::Timeout,
        };

        match state.on_event(event) {
            ImageTransferAction::SendSubpage { page: p, subpage: s } => {
                page = p;
                subpage = s;
            }
            ImageTransferAction::ResendSameRoute => {}
            ImageTransferAction::SwitchAlternateSameHopCount => {
                current_alt = Some(current_alt.map(|i| i + 1).unwrap_or(0).min(alternates.len().saturating_sub(1)));
            }
            ImageTransferAction::SeekAndResume { resume_page, resume_subpage, .. } => {
                page = resume_page;
                subpage = resume_subpage;
            }
            ImageTransferAction::Done => return true,
            ImageTransferAction::Failed => return false,
        }
    }
}

/// Drives one FUOTA session end to end for `request.target_mac` against
/// `request.firmware_path`. Called both for a fresh FUOTA dequeue and, with
/// `resume_phase` set, from the session-startup resume path (§4.6).
pub async fn run_fuota_session(
    gateway_id: &str,
    transport: &TcpTransport,
    store: &dyn Store,
    path_book: &PathBook,
    config: &Config,
    request: FuotaRequest,
    resume_phase: Option<FuotaPhase>,
) {
    let target_mac = request.target_mac;
    let Some(primary) = path_book.primary(target_mac).cloned() else {
        warn!(gateway_id, mac = ?target_mac, "fuota target has no known route, aborting session");
        return;
    };
    let alternates: Vec<PathInfo> =
        path_book.alternates(target_mac, Some(primary.hop_count)).into_iter().cloned().collect();
    let alt_ref = alt_refs(&alternates);
    let max_payload = fuota::max_payload_size(primary.hop_count);

    let mut phase = resume_phase.unwrap_or(FuotaPhase::OpenFile);
    let mut firmware: Option<FirmwareFile> = None;
    let mut sector_size: u16 = 0;
    let mut page_count: u32 = 0;
    let mut subpage_count: u32 = 0;
    let mut crc: u16 = 0;
    let mut succeeded = false;

    loop {
        info!(gateway_id, mac = ?target_mac, ?phase, "fuota phase");

        if phase == FuotaPhase::RollbackToNormal {
            let _ = store.set_fuota_status(gateway_id, target_mac, if succeeded { 1 } else { 0 }).await;
            info!(gateway_id, mac = ?target_mac, succeeded, "fuota session ended");
            return;
        }

        let ok = match phase {
            FuotaPhase::OpenFile => match FirmwareFile::open(&request.firmware_path) {
                Ok(f) => {
                    firmware = Some(f);
                    true
                }
                Err(err) => {
                    warn!(gateway_id, mac = ?target_mac, ?err, "fuota firmware open failed");
                    false
                }
            },
            FuotaPhase::GatewayPathSilence => {
                let gateway_route = PathInfo { hop_count: 0, hop_addresses: vec![0, 0, 0, 0] };
                run_silence_steps(
                    transport,
                    &gateway_route,
                    &[],
                    config,
                    phase_frame_id::SILENCE_ENABLE,
                    phase_frame_id::SILENCE_MODE_ENTRY,
                    phase_frame_id::SILENCE_FLASH_SAVE,
                    phase_frame_id::SILENCE_FLASH_EXIT,
                )
                .await
            }
            FuotaPhase::TargetNodeSilence => {
                let ok = run_silence_steps(
                    transport,
                    &primary,
                    &alt_ref,
                    config,
                    phase_frame_id::SILENCE_ENABLE,
                    phase_frame_id::SILENCE_MODE_ENTRY,
                    phase_frame_id::SILENCE_FLASH_SAVE,
                    phase_frame_id::SILENCE_FLASH_EXIT,
                )
                .await;
                if ok {
                    let _ = store.record_silenced(gateway_id, target_mac).await;
                }
                ok
            }
            FuotaPhase::NetworkSilence => {
                run_network_silence(transport, store, gateway_id, path_book, target_mac, config).await
            }
            FuotaPhase::SectorRead => {
                match run_phase_command(
                    transport,
                    &primary,
                    &alt_ref,
                    config.socket_recv_timeout_extended,
                    phase_frame_id::SECTOR_READ,
                    Vec::new(),
                )
                .await
                {
                    Ok(outcome) => match extract_u16(&outcome) {
                        Some(size) if size > 0 => {
                            sector_size = size;
                            true
                        }
                        _ => false,
                    },
                    Err(err) => {
                        warn!(gateway_id, ?err, "fuota sector read failed");
                        false
                    }
                }
            }
            FuotaPhase::FirmwareSectorCount => match firmware.as_ref() {
                Some(fw) => {
                    let payload = (fw.size as u32).to_be_bytes().to_vec();
                    match run_phase_command(
                        transport,
                        &primary,
                        &alt_ref,
                        config.socket_recv_timeout_extended,
                        phase_frame_id::SECTOR_COUNT,
                        payload,
                    )
                    .await
                    {
                        Ok(outcome) if outcome_succeeded(&outcome) => {
                            page_count = fuota::compute_page_count(fw.size as u32, sector_size);
                            subpage_count = fuota::compute_subpage_count(sector_size, max_payload);
                            true
                        }
                        Ok(_) => false,
                        Err(err) => {
                            warn!(gateway_id, ?err, "fuota sector count failed");
                            false
                        }
                    }
                }
                None => false,
            },
            FuotaPhase::EraseFlash => {
                match run_phase_command(
                    transport,
                    &primary,
                    &alt_ref,
                    config.socket_recv_timeout_extended,
                    phase_frame_id::ERASE_FLASH,
                    Vec::new(),
                )
                .await
                {
                    Ok(outcome) => outcome_succeeded(&outcome),
                    Err(err) => {
                        warn!(gateway_id, ?err, "fuota erase flash failed");
                        false
                    }
                }
            }
            FuotaPhase::ImageTransfer => match firmware.as_mut() {
                Some(fw) => {
                    let state = ImageTransferState::new(page_count, subpage_count, sector_size, max_payload);
                    run_image_transfer(transport, &primary, &alt_ref, config, fw, state).await
                }
                None => false,
            },
            FuotaPhase::EndOfPage => {
                match run_phase_command(
                    transport,
                    &primary,
                    &alt_ref,
                    config.fuota_response_wait,
                    phase_frame_id::END_OF_PAGE,
                    Vec::new(),
                )
                .await
                {
                    Ok(outcome) => outcome_succeeded(&outcome),
                    Err(err) => {
                        warn!(gateway_id, ?err, "fuota end-of-page failed");
                        false
                    }
                }
            }
            FuotaPhase::CrcCompute => match firmware.as_mut() {
                Some(fw) => match fw.whole_file_crc16() {
                    Ok(value) => {
                        crc = value;
                        match run_ladder_command(
                            transport,
                            &primary,
                            &alt_ref,
                            config.fuota_response_wait,
                            |_| fuota::build_crc_frame(crc),
                        )
                        .await
                        {
                            Ok(outcome) => outcome_succeeded(&outcome),
                            Err(err) => {
                                warn!(gateway_id, ?err, "fuota crc verify failed");
                                false
                            }
                        }
                    }
                    Err(err) => {
                        warn!(gateway_id, ?err, "fuota crc compute failed");
                        false
                    }
                },
                None => false,
            },
            FuotaPhase::Activate => {
                let read_ok = match run_phase_command(
                    transport,
                    &primary,
                    &alt_ref,
                    config.fuota_response_wait,
                    phase_frame_id::ACTIVATE_READ,
                    Vec::new(),
                )
                .await
                {
                    Ok(outcome) => outcome_succeeded(&outcome),
                    Err(err) => {
                        warn!(gateway_id, ?err, "fuota activate read failed");
                        false
                    }
                };
                tokio::time::sleep(config.post_flash_command_sleep).await;
                let status_ok = read_ok
                    && match run_phase_command(
                        transport,
                        &primary,
                        &alt_ref,
                        config.fuota_response_wait,
                        phase_frame_id::ACTIVATE_STATUS_READ,
                        Vec::new(),
                    )
                    .await
                    {
                        Ok(outcome) => outcome_succeeded(&outcome),
                        Err(err) => {
                            warn!(gateway_id, ?err, "fuota activate status read failed");
                            false
                        }
                    };
                if status_ok {
                    succeeded = true;
                }
                status_ok
            }
            FuotaPhase::ReadCompareFirmwareVersion => {
                match run_phase_command(
                    transport,
                    &primary,
                    &alt_ref,
                    config.fuota_response_wait,
                    phase_frame_id::FW_VERSION_READ,
                    Vec::new(),
                )
                .await
                {
                    Ok(outcome) => outcome_succeeded(&outcome),
                    Err(err) => {
                        warn!(gateway_id, ?err, "fuota firmware version readback failed");
                        false
                    }
                }
            }
            FuotaPhase::NetworkUnsilence => {
                for mac in store.silenced_nodes(gateway_id).await.unwrap_or_default() {
                    if mac == target_mac {
                        continue;
                    }
                    if let Some(node_primary) = path_book.primary(mac).cloned() {
                        let node_alts: Vec<PathInfo> =
                            path_book.alternates(mac, Some(node_primary.hop_count)).into_iter().cloned().collect();
                        let ok = run_silence_steps(
                            transport,
                            &node_primary,
                            &alt_refs(&node_alts),
                            config,
                            phase_frame_id::UNSILENCE_ENABLE,
                            phase_frame_id::UNSILENCE_MODE_ENTRY,
                            phase_frame_id::UNSILENCE_FLASH_SAVE,
                            phase_frame_id::UNSILENCE_FLASH_EXIT,
                        )
                        .await;
                        if ok {
                            let _ = store.record_unsilenced(gateway_id, mac).await;
                        }
                    }
                }
                true
            }
            FuotaPhase::TargetNodeUnsilence => {
                let ok = run_silence_steps(
                    transport,
                    &primary,
                    &alt_ref,
                    config,
                    phase_frame_id::UNSILENCE_ENABLE,
                    phase_frame_id::UNSILENCE_MODE_ENTRY,
                    phase_frame_id::UNSILENCE_FLASH_SAVE,
                    phase_frame_id::UNSILENCE_FLASH_EXIT,
                )
                .await;
                if ok {
                    let _ = store.record_unsilenced(gateway_id, target_mac).await;
                }
                true // unsilence proceeds to gateway-path unsilence regardless
            }
            FuotaPhase::GatewayPathUnsilence => {
                let gateway_route = PathInfo { hop_count: 0, hop_addresses: vec![0, 0, 0, 0] };
                run_silence_steps(
                    transport,
                    &gateway_route,
                    &[],
                    config,
                    phase_frame_id::UNSILENCE_ENABLE,
                    phase_frame_id::UNSILENCE_MODE_ENTRY,
                    phase_frame_id::UNSILENCE_FLASH_SAVE,
                    phase_frame_id::UNSILENCE_FLASH_EXIT,
                )
                .await;
                true // the unsilence chain always reaches rollback
            }
            FuotaPhase::RollbackToNormal => unreachable!("handled above the match"),
        };

        let next = if ok { phase.next_on_success() } else { phase.on_retries_exhausted() };
        let _ = store.set_fuota_status(gateway_id, target_mac, next.status_code()).await;
        phase = next;
    }
}
