//! # gateway
//!
//! One cooperative task per gateway session (§5): multiplexes the TCP
//! socket, the MQTT wake source and the pull tick via `tokio::select!`,
//! gluing `hes-core`'s pure state machines (`Transactor`, `scheduler`,
//! `fuota`) to the live collaborators. Mirrors the teacher's
//! `run_engine_tick` in shape — a loop around `tokio::time::interval` that
//! drives a tick-based engine and reacts to its result — generalized to a
//! three-way `select!` instead of a single timer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use hes_core::codec::{self, Direction, MeshPacketType};
use hes_core::mqtt_api::{self, MqttSource, OdmCommand, ParsedCommand};
use hes_core::path_book::{PathBook, PathInfo};
use hes_core::profile::ProfileKind;
use hes_core::registry::{Evictable, GatewayRegistry};
use hes_core::scheduler::{self, CyclePlan, DoneMask, PullTask};
use hes_core::store_api::{ProfileRecordBatch, RequestStatus, Store};
use hes_core::transactor::{
    LadderAction, TerminalOutcome, Transactor, TransactionEvent, Transport,
};

use crate::config::Config;
use crate::firmware;
use crate::fuota_driver::{self, FuotaRequest};
use crate::transport::TcpTransport;

/// Marks a session evicted (registry duplicate, spec §5) — the running
/// session loop checks this flag between suspension points and exits.
pub struct GatewaySession {
    gateway_id: String,
    cancelled: AtomicBool,
}

impl Evictable for GatewaySession {
    fn evict(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Runs one gateway's full session lifetime: register, load routing,
/// cooperative pull/ODM loop, then deregister and mark queued ODM requests
/// `GW_DISCONNECTED` on any terminal disconnect (§5, §7).
pub async fn run(
    gateway_id: String,
    transport: Arc<TcpTransport>,
    store: Arc<dyn Store>,
    mqtt: Arc<dyn MqttSource>,
    registry: Arc<GatewayRegistry>,
    config: Arc<Config>,
) {
    let session = Arc::new(GatewaySession {
        gateway_id: gateway_id.clone(),
        cancelled: AtomicBool::new(false),
    });
    let evictable: Arc<dyn Evictable> = session.clone();
    registry.register(&gateway_id, evictable.clone());

    let mut path_book = PathBook::new(gateway_id.clone());
    if let Err(err) = path_book.load(store.as_ref()).await {
        warn!(gateway_id, ?err, "failed to load path book, ending session");
        registry.deregister(&gateway_id, &evictable);
        return;
    }

    match store.recent_fuota_resume(&gateway_id, hes_core::fuota::RESUME_WINDOW_SECS).await {
        Ok(Some(record)) => {
            info!(gateway_id, mac = ?record.target_mac, "resuming fuota session from OpenFile");
            fuota_driver::run_fuota_session(
                &gateway_id,
                transport.as_ref(),
                store.as_ref(),
                &path_book,
                &config,
                FuotaRequest { target_mac: record.target_mac, firmware_path: record.firmware_path },
                Some(hes_core::fuota::FuotaPhase::OpenFile),
            )
            .await;
        }
        Ok(None) => {}
        Err(err) => warn!(gateway_id, ?err, "fuota resume lookup failed"),
    }

    let mut done_mask = DoneMask::new();
    let mut tick = tokio::time::interval(config.pull_tick_interval);

    loop {
        if session.cancelled.load(Ordering::SeqCst) {
            info!(gateway_id, "session evicted, ending task");
            break;
        }

        tokio::select! {
            _ = tick.tick() => {
                if let Err(err) = run_pull_cycle(
                    &gateway_id,
                    transport.as_ref(),
                    store.as_ref(),
                    &path_book,
                    &mut done_mask,
                    &config,
                ).await {
                    warn!(gateway_id, ?err, "pull cycle aborted");
                }
            }
            cmd = mqtt.next_command(&gateway_id) => {
                match cmd {
                    Some(payload) => {
                        run_odm_batch(&gateway_id, transport.as_ref(), store.as_ref(), mqtt.as_ref(), &path_book, &payload, &config).await;
                    }
                    None => {
                        info!(gateway_id, "mqtt source closed, ending session");
                        break;
                    }
                }
            }
        }
    }

    registry.deregister(&gateway_id, &evictable);
}

/// §4.5 steps 1-6: acquire the cross-controller sync flag, plan the cycle,
/// and issue each node's ordered pulls in turn.
async fn run_pull_cycle(
    gateway_id: &str,
    transport: &TcpTransport,
    store: &dyn Store,
    path_book: &PathBook,
    done_mask: &mut DoneMask,
    config: &Config,
) -> Result<(), hes_core::error::EngineError> {
    let acquired = scheduler::acquire_gateway_sync(
        store,
        gateway_id,
        config.sync_acquire_poll_interval,
        config.sync_acquire_max_wait,
    )
    .await?;
    if !acquired {
        debug!(gateway_id, "gateway sync not acquired this tick, skipping");
        return Ok(());
    }

    let now = chrono::Utc::now();
    let hour = now.hour_of_day();
    let cycle_id = scheduler::calculate_cycle_id(hour, now.minute_of_hour());
    done_mask.roll_to_hour(hour);
    if done_mask.is_done(cycle_id) {
        return Ok(());
    }

    let plan: CyclePlan = scheduler::plan_cycle(store, gateway_id, path_book.node_order(), cycle_id).await?;

    for mac in &plan.nodes_to_unsilence {
        store.record_unsilenced(gateway_id, *mac).await?;
    }

    for (mac, tasks) in &plan.node_pulls {
        let Some(primary) = path_book.primary(*mac) else { continue };
        let alternates = path_book.alternates(*mac, None);
        for task in tasks {
            issue_pull(gateway_id, transport, store, *mac, primary, &alternates, *task, cycle_id, config)
                .await?;
        }
    }
    done_mask.mark_done(cycle_id);
    Ok(())
}

trait TimeParts {
    fn hour_of_day(&self) -> u8;
    fn minute_of_hour(&self) -> u8;
}

impl TimeParts for chrono::DateTime<chrono::Utc> {
    fn hour_of_day(&self) -> u8 {
        use chrono::Timelike;
        self.hour() as u8
    }
    fn minute_of_hour(&self) -> u8 {
        use chrono::Timelike;
        self.minute() as u8
    }
}

fn profile_kind_for(task: PullTask) -> Option<ProfileKind> {
    match task {
        PullTask::Nameplate => Some(ProfileKind::Nameplate),
        PullTask::Ifv => None, // single-OBIS read, not a paged profile pull
        PullTask::InstantaneousCycle(_) => Some(ProfileKind::Instantaneous),
        PullTask::DailyLoad => Some(ProfileKind::DailyLoad),
        PullTask::BlockLoad => Some(ProfileKind::BlockLoad),
        PullTask::BillingHistory => Some(ProfileKind::Billing),
    }
}

fn frame_id_for(kind: ProfileKind) -> u8 {
    match kind {
        ProfileKind::ScalarMetadata => hes_core::profile::frame_id::OBIS_SCALAR_LIST,
        _ => hes_core::profile::frame_id::INSTANT_DATA,
    }
}

/// Builds the first-page request frame for `kind` addressed to `path`.
fn build_profile_request(path: &PathInfo, source_addr: [u8; 4], kind: ProfileKind) -> Result<Vec<u8>, hes_core::error::EngineError> {
    let dlms = codec::build_dlms(Direction::Request, 0, frame_id_for(kind), kind.command_id(), 0, &[]);
    let hop_addresses = if path.hop_addresses.is_empty() { vec![0, 0, 0, 0] } else { path.hop_addresses.clone() };
    let frame = codec::build_mesh(
        MeshPacketType::DataQuery as u8,
        [0; 4],
        source_addr,
        path.hop_count,
        &hop_addresses,
        &dlms,
    )?;
    Ok(frame)
}

/// Drives one profile pull end to end against the transactor ladder,
/// resending/paging/switching routes until a terminal outcome, then records
/// it in the store (§4.3, §4.4, §6).
async fn issue_pull(
    gateway_id: &str,
    transport: &TcpTransport,
    store: &dyn Store,
    mac: [u8; 8],
    primary: &PathInfo,
    alternates: &[&PathInfo],
    task: PullTask,
    cycle_id: u8,
    config: &Config,
) -> Result<(), hes_core::error::EngineError> {
    let Some(kind) = profile_kind_for(task) else {
        return issue_ifv_pull(gateway_id, transport, store, mac, primary, alternates, cycle_id, config).await;
    };

    let mut transactor = Transactor::new(primary, alternates, false);
    let mut frame = build_profile_request(primary, [0; 4], kind)?;
    let mut buffer = hes_core::profile::ProfileBuffer::new();

    let outcome = loop {
        transport.send(&frame).await?;
        let raw = transport.recv(config.socket_recv_timeout).await?;
        let event = hes_core::transactor::classify_response(&raw, primary.final_destination(), transactor.expected_page_index());

        if let TransactionEvent::Success(view) | TransactionEvent::NextPage(view) = &event {
            if let Ok(records) = hes_core::profile::walk_records(&view.records) {
                buffer.ingest_page(&records);
            }
        }

        match transactor.on_event(event) {
            LadderAction::Done(outcome) => break outcome,
            LadderAction::ResendSameRoute | LadderAction::WaitAndResend => continue,
            LadderAction::SwitchAlternateAndResend => {
                frame = build_profile_request(transactor.current_route(), [0; 4], kind)?;
            }
            LadderAction::SendNextPage => {
                frame = hes_core::profile::rewrite_for_next_page(&frame, kind)?;
            }
            LadderAction::SendDlmsEnable => {
                transport.send(&hes_core::transactor::DLMS_ENABLE_REQUEST).await?;
            }
            LadderAction::RecomputeChecksumAndResend => {
                let len = frame.len();
                codec::recalculate_dlms_checksum(&mut frame, len)?;
            }
        }
    };

    record_pull_outcome(gateway_id, store, mac, task, cycle_id, buffer, outcome).await
}

/// §4.5 step 5: a single-OBIS (frame 0x0F) read for the internal firmware
/// version, stored directly to `meter_details` rather than any of the
/// profile-batch tables.
async fn issue_ifv_pull(
    gateway_id: &str,
    transport: &TcpTransport,
    store: &dyn Store,
    mac: [u8; 8],
    primary: &PathInfo,
    alternates: &[&PathInfo],
    cycle_id: u8,
    config: &Config,
) -> Result<(), hes_core::error::EngineError> {
    let mut transactor = Transactor::new(primary, alternates, false);
    let dlms = codec::build_dlms(
        Direction::Request,
        0,
        hes_core::profile::frame_id::SINGLE_OBIS,
        hes_core::profile::IFV_COMMAND,
        0,
        &[],
    );
    let hop_addresses = if primary.hop_addresses.is_empty() { vec![0, 0, 0, 0] } else { primary.hop_addresses.clone() };
    let mut frame = codec::build_mesh(MeshPacketType::DataQuery as u8, [0; 4], [0; 4], primary.hop_count, &hop_addresses, &dlms)?;

    let outcome = loop {
        transport.send(&frame).await?;
        let raw = transport.recv(config.socket_recv_timeout).await?;
        let event = hes_core::transactor::classify_response(&raw, primary.final_destination(), transactor.expected_page_index());
        match transactor.on_event(event) {
            LadderAction::Done(outcome) => break outcome,
            LadderAction::ResendSameRoute | LadderAction::WaitAndResend => continue,
            LadderAction::SwitchAlternateAndResend => {
                let route = transactor.current_route();
                let hop_addresses = if route.hop_addresses.is_empty() { vec![0, 0, 0, 0] } else { route.hop_addresses.clone() };
                frame = codec::build_mesh(MeshPacketType::DataQuery as u8, [0; 4], [0; 4], route.hop_count, &hop_addresses, &dlms)?;
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
    };

    if let TerminalOutcome::Success(view) = &outcome {
        let version = String::from_utf8_lossy(&view.records).trim_end_matches('\0').to_string();
        let batch = hes_core::store_api::ProfileRecordBatch {
            mac,
            gateway_id: gateway_id.to_string(),
            cycle_id,
            fields: vec![("rf_module_internal_fw_version".to_string(), hes_core::codec::DlmsValue::String(version))],
        };
        store.upsert_meter_details(batch).await?;
    } else {
        debug!(gateway_id, mac = ?mac, ?outcome, "ifv pull did not complete");
    }
    Ok(())
}

async fn record_pull_outcome(
    gateway_id: &str,
    store: &dyn Store,
    mac: [u8; 8],
    task: PullTask,
    cycle_id: u8,
    buffer: hes_core::profile::ProfileBuffer,
    outcome: TerminalOutcome,
) -> Result<(), hes_core::error::EngineError> {
    match outcome {
        TerminalOutcome::Success(_) | TerminalOutcome::DlmsError(_) => {
            let fields = buffer
                .fields
                .iter()
                .map(|(idx, values)| (format!("field_{idx}"), values.last().cloned().unwrap_or(hes_core::codec::DlmsValue::None)))
                .collect();
            let batch = ProfileRecordBatch { mac, gateway_id: gateway_id.to_string(), cycle_id, fields };
            match task {
                PullTask::Nameplate => store.append_nameplate(batch).await?,
                PullTask::InstantaneousCycle(_) => store.append_ip_push(batch).await?,
                PullTask::DailyLoad => store.append_dlp_push(batch).await?,
                PullTask::BlockLoad => store.append_blp_push(batch).await?,
                PullTask::BillingHistory => store.append_history(batch).await?,
                PullTask::Ifv => {}
            }
        }
        TerminalOutcome::FailedRfTimeout
        | TerminalOutcome::FailedMeshProtocol(_)
        | TerminalOutcome::FailedChecksum
        | TerminalOutcome::InvalidResponse
        | TerminalOutcome::Cancelled
        | TerminalOutcome::PollTimeout => {
            debug!(gateway_id, mac = ?mac, ?outcome, "pull did not complete");
        }
    }
    Ok(())
}

/// §4.5 step 6 / §6: drains cancellations, then dispatches each ODM command
/// in `payload` in order.
async fn run_odm_batch(
    gateway_id: &str,
    transport: &TcpTransport,
    store: &dyn Store,
    mqtt: &dyn MqttSource,
    path_book: &PathBook,
    payload: &str,
    config: &Config,
) {
    let cancelled = match scheduler::drain_cancellations(mqtt, store, gateway_id).await {
        Ok(c) => c,
        Err(err) => {
            warn!(gateway_id, ?err, "failed to drain cancellations");
            Vec::new()
        }
    };
    let cancelled: std::collections::HashSet<u64> = cancelled.into_iter().collect();

    for parsed in mqtt_api::parse_topic_payload(gateway_id, payload) {
        match parsed {
            Ok(ParsedCommand::Odm(cmd)) => {
                if cancelled.contains(&cmd.request_id) {
                    continue;
                }
                if mqtt_api::QueueClass::of(cmd.download_type) == mqtt_api::QueueClass::Fuota {
                    dispatch_fuota(gateway_id, transport, store, path_book, &cmd, config).await;
                } else if let Err(err) = dispatch_odm(gateway_id, transport, store, path_book, &cmd, config).await {
                    warn!(gateway_id, request_id = cmd.request_id, ?err, "odm dispatch failed");
                }
            }
            Ok(ParsedCommand::Cancel(_)) => {} // already drained via MqttSource::drain_cancelled
            Err(err) => warn!(gateway_id, ?err, "rejected malformed mqtt command"),
        }
    }
}

/// §4.6: a FUOTA (download-type 27) ODM command carries a firmware
/// path/filename instead of a DLMS command, and drives the full phase
/// engine rather than a single request/response.
async fn dispatch_fuota(
    gateway_id: &str,
    transport: &TcpTransport,
    store: &dyn Store,
    path_book: &PathBook,
    cmd: &OdmCommand,
    config: &Config,
) {
    let mut target_mac = [0u8; 8];
    let dest_tail = &cmd.dest_path[cmd.dest_path.len().saturating_sub(4)..];
    target_mac[4..].copy_from_slice(&dest_tail[..dest_tail.len().min(4)]);

    let (Some(base_path), Some(filename)) = (&cmd.firmware_path, &cmd.firmware_filename) else {
        warn!(gateway_id, request_id = cmd.request_id, "fuota command missing firmware path/filename");
        return;
    };
    let firmware_path = firmware::path_for(base_path, gateway_id, filename);

    fuota_driver::run_fuota_session(
        gateway_id,
        transport,
        store,
        path_book,
        config,
        FuotaRequest { target_mac, firmware_path },
        None,
    )
    .await;
}

async fn dispatch_odm(
    gateway_id: &str,
    transport: &TcpTransport,
    store: &dyn Store,
    path_book: &PathBook,
    cmd: &OdmCommand,
    config: &Config,
) -> Result<(), hes_core::error::EngineError> {
    store.set_request_status(cmd.request_id, RequestStatus::InProgress, None).await?;

    let mut mac = [0u8; 8];
    let dest_tail = &cmd.dest_path[cmd.dest_path.len().saturating_sub(4)..];
    mac[4..].copy_from_slice(&dest_tail[..dest_tail.len().min(4)]);
    let fallback_primary = PathInfo { hop_count: cmd.hop_count, hop_addresses: cmd.dest_path.clone() };
    let primary = path_book.primary(mac).unwrap_or(&fallback_primary);
    let is_ping = cmd.ping_count.is_some();

    let mut transactor = Transactor::new(primary, &[], is_ping);
    let dlms = codec::build_dlms(Direction::Request, 0, cmd.command_hex.first().copied().unwrap_or(0), 0, 0, &cmd.command_hex);
    let mut frame = codec::build_mesh(
        MeshPacketType::DataQuery as u8,
        [0; 4],
        [0; 4],
        primary.hop_count,
        if primary.hop_addresses.is_empty() { &[0, 0, 0, 0] } else { &primary.hop_addresses },
        &dlms,
    )?;

    let outcome = loop {
        transport.send(&frame).await?;
        // §5: all-events (download-type 8) reads get the extended socket
        // timeout; everything else uses the default.
        let timeout = if cmd.download_type == 8 {
            config.socket_recv_timeout_extended
        } else {
            config.socket_recv_timeout
        };
        let raw = transport.recv(timeout).await?;
        let event = hes_core::transactor::classify_response(&raw, primary.final_destination(), transactor.expected_page_index());
        match transactor.on_event(event) {
            LadderAction::Done(outcome) => break outcome,
            LadderAction::ResendSameRoute | LadderAction::WaitAndResend => continue,
            LadderAction::SwitchAlternateAndResend => continue, // ODM commands address a single node directly; no alternates supplied
            LadderAction::SendNextPage => continue,
            LadderAction::SendDlmsEnable => {
                transport.send(&hes_core::transactor::DLMS_ENABLE_REQUEST).await?;
            }
            LadderAction::RecomputeChecksumAndResend => {
                let len = frame.len();
                codec::recalculate_dlms_checksum(&mut frame, len)?;
            }
        }
    };

    let (status, error_code) = status_for_outcome(&outcome);
    store.set_request_status(cmd.request_id, status, error_code).await?;
    info!(gateway_id, request_id = cmd.request_id, ?status, "odm request completed");
    Ok(())
}

fn status_for_outcome(outcome: &TerminalOutcome) -> (RequestStatus, Option<u16>) {
    match outcome {
        TerminalOutcome::Success(_) => (RequestStatus::Success, None),
        TerminalOutcome::DlmsError(code) => (RequestStatus::Success, Some(*code)),
        TerminalOutcome::FailedRfTimeout => (RequestStatus::FailedRfTimeout, None),
        TerminalOutcome::FailedMeshProtocol(code) => (RequestStatus::FailedMeshProtocol, Some(*code as u16)),
        TerminalOutcome::FailedChecksum => (RequestStatus::FailedChecksum, None),
        TerminalOutcome::InvalidResponse => (RequestStatus::FailedInvalidResponse, None),
        TerminalOutcome::Cancelled => (RequestStatus::Cancelled, None),
        TerminalOutcome::PollTimeout => (RequestStatus::FailedTimeout, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ifv_has_no_profile_kind_but_everything_else_does() {
        assert_eq!(profile_kind_for(PullTask::Ifv), None);
        assert_eq!(profile_kind_for(PullTask::Nameplate), Some(ProfileKind::Nameplate));
        assert_eq!(profile_kind_for(PullTask::DailyLoad), Some(ProfileKind::DailyLoad));
        assert_eq!(profile_kind_for(PullTask::BlockLoad), Some(ProfileKind::BlockLoad));
        assert_eq!(profile_kind_for(PullTask::BillingHistory), Some(ProfileKind::Billing));
        assert_eq!(profile_kind_for(PullTask::InstantaneousCycle(5)), Some(ProfileKind::Instantaneous));
    }

    #[test]
    fn frame_id_for_scalar_metadata_uses_the_obis_scalar_list_frame() {
        assert_eq!(frame_id_for(ProfileKind::ScalarMetadata), hes_core::profile::frame_id::OBIS_SCALAR_LIST);
        assert_eq!(frame_id_for(ProfileKind::Nameplate), hes_core::profile::frame_id::INSTANT_DATA);
        assert_eq!(frame_id_for(ProfileKind::DailyLoad), hes_core::profile::frame_id::INSTANT_DATA);
    }

    #[test]
    fn dlms_error_outcome_records_as_success_with_error_code() {
        let (status, code) = status_for_outcome(&TerminalOutcome::DlmsError(42));
        assert_eq!(status, RequestStatus::Success);
        assert_eq!(code, Some(42));
    }

    #[test]
    fn terminal_outcomes_map_to_distinct_request_statuses() {
        assert_eq!(status_for_outcome(&TerminalOutcome::FailedRfTimeout).0, RequestStatus::FailedRfTimeout);
        assert_eq!(status_for_outcome(&TerminalOutcome::FailedChecksum).0, RequestStatus::FailedChecksum);
        assert_eq!(status_for_outcome(&TerminalOutcome::InvalidResponse).0, RequestStatus::FailedInvalidResponse);
        assert_eq!(status_for_outcome(&TerminalOutcome::Cancelled).0, RequestStatus::Cancelled);
        assert_eq!(status_for_outcome(&TerminalOutcome::PollTimeout).0, RequestStatus::FailedTimeout);
        let (status, code) = status_for_outcome(&TerminalOutcome::FailedMeshProtocol(0x08));
        assert_eq!(status, RequestStatus::FailedMeshProtocol);
        assert_eq!(code, Some(0x08));
    }
}
