//! # transactor
//!
//! Sends one framed command, correlates the response, and drives the retry /
//! alternate-path ladder of §4.3. The ladder itself is a plain synchronous
//! state machine — `Transactor::on_event` — fed by whatever already decoded
//! one response (scenario-driven in tests, socket-driven in `hes-server`).
//! Keeping it synchronous means the retry bookkeeping is exercised without a
//! mock transport.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::codec::{self, Direction, DlmsView};
use crate::error::EngineError;
use crate::path_book::PathInfo;

pub const RETRY_COUNT_MAX: u8 = 3;
pub const ALTERNATE_RETRY_COUNT_MAX: u8 = 2;
pub const DLMS_CONNECTION_RETRY_MAX: u8 = 3;
pub const DLMS_CHECKSUM_RETRY_MAX: u8 = 3;

pub const DLMS_ENABLE_REQUEST: [u8; 8] = [0x2B, 0x07, 0x00, 0x00, 0x00, 0x02, 0x01, 0x35];

/// A decoded inbound frame, reduced to what the ladder needs to react to.
/// Produced by `classify_response` from raw wire bytes, or directly in tests.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionEvent {
    Success(DlmsView),
    NextPage(DlmsView),
    RetryTimeout,
    CommandInProgress,
    DlmsConnectionFailed,
    DlmsChecksumError,
    DlmsError(u16),
    InvalidResponse,
    PmeshError(u8),
    PollTimeout,
    Cancelled,
}

/// Terminal result handed back to the scheduler / FUOTA engine.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalOutcome {
    Success(Vec<DlmsView>),
    DlmsError(u16),
    FailedRfTimeout,
    FailedMeshProtocol(u8),
    FailedChecksum,
    InvalidResponse,
    Cancelled,
    PollTimeout,
}

/// Next thing the caller must do before calling `on_event` again.
#[derive(Debug, Clone, PartialEq)]
pub enum LadderAction {
    /// Send the original frame again on the current route.
    ResendSameRoute,
    /// Wait briefly (no backoff step consumed) and resend on the current route.
    WaitAndResend,
    /// Switch to the next alternate route and resend the original frame there.
    SwitchAlternateAndResend,
    /// Send the 8-byte DLMS-enable sequence, then resume the outer request.
    SendDlmsEnable,
    /// Recompute the DLMS checksum in place and resend.
    RecomputeChecksumAndResend,
    /// Send the next-page request (page index already advanced).
    SendNextPage,
    /// The transaction is finished.
    Done(TerminalOutcome),
}

/// Per-transaction retry bookkeeping (§3 `RetryContext`).
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    pub retry_count: u8,
    pub alternate_retry_count: u8,
    pub dlms_connection_retry_count: u8,
    pub dlms_checksum_retry_count: u8,
    pub active: bool,
}

/// Drives one transaction end to end: tracks page accumulation, retry
/// counters, and which route (primary or which alternate) is current.
pub struct Transactor<'a> {
    primary: &'a PathInfo,
    alternates: &'a [&'a PathInfo],
    is_ping_node: bool,
    current_alternate: Option<usize>,
    expecting_dlms_enable: bool,
    ctx: RetryContext,
    pages: Vec<DlmsView>,
    expected_page_index: u8,
}

impl<'a> Transactor<'a> {
    pub fn new(primary: &'a PathInfo, alternates: &'a [&'a PathInfo], is_ping_node: bool) -> Self {
        Self {
            primary,
            alternates,
            is_ping_node,
            current_alternate: None,
            expecting_dlms_enable: false,
            ctx: RetryContext { active: true, ..Default::default() },
            pages: Vec::new(),
            expected_page_index: 0,
        }
    }

    /// The route currently in use.
    pub fn current_route(&self) -> &'a PathInfo {
        match self.current_alternate {
            None => self.primary,
            Some(i) => self.alternates[i],
        }
    }

    /// Feeds one classified response event and returns what to do next.
    pub fn on_event(&mut self, event: TransactionEvent) -> LadderAction {
        if !self.ctx.active {
            return LadderAction::Done(TerminalOutcome::Cancelled);
        }

        match event {
            TransactionEvent::Cancelled => {
                self.ctx.active = false;
                LadderAction::Done(TerminalOutcome::Cancelled)
            }
            TransactionEvent::PollTimeout if self.is_ping_node => {
                self.ctx.active = false;
                LadderAction::Done(TerminalOutcome::PollTimeout)
            }
            TransactionEvent::PollTimeout => self.retry_or_switch(),
            TransactionEvent::CommandInProgress => LadderAction::WaitAndResend,
            TransactionEvent::RetryTimeout => self.retry_or_switch(),
            TransactionEvent::DlmsConnectionFailed => {
                if self.ctx.dlms_connection_retry_count >= DLMS_CONNECTION_RETRY_MAX {
                    warn!("dlms enable sequence exhausted on route");
                    return self.switch_alternate_or_terminal(TerminalOutcome::FailedRfTimeout);
                }
                self.ctx.dlms_connection_retry_count += 1;
                self.expecting_dlms_enable = true;
                LadderAction::SendDlmsEnable
            }
            TransactionEvent::DlmsChecksumError => {
                if self.ctx.dlms_checksum_retry_count >= DLMS_CHECKSUM_RETRY_MAX {
                    return self.switch_alternate_or_terminal(TerminalOutcome::FailedChecksum);
                }
                self.ctx.dlms_checksum_retry_count += 1;
                LadderAction::RecomputeChecksumAndResend
            }
            TransactionEvent::DlmsError(code) => {
                self.ctx.active = false;
                LadderAction::Done(TerminalOutcome::DlmsError(code))
            }
            TransactionEvent::PmeshError(0x08) => {
                // NMS disabled — aborts rather than retrying.
                self.ctx.active = false;
                LadderAction::Done(TerminalOutcome::FailedMeshProtocol(0x08))
            }
            TransactionEvent::PmeshError(code) => {
                debug!(code, "pmesh error, retrying");
                self.retry_or_switch_with(TerminalOutcome::FailedMeshProtocol(code))
            }
            TransactionEvent::InvalidResponse => {
                self.ctx.active = false;
                LadderAction::Done(TerminalOutcome::InvalidResponse)
            }
            TransactionEvent::Success(view) => {
                self.expecting_dlms_enable = false;
                self.expected_page_index = self.expected_page_index.wrapping_add(1);
                self.pages.push(view);
                self.ctx.active = false;
                LadderAction::Done(TerminalOutcome::Success(std::mem::take(&mut self.pages)))
            }
            TransactionEvent::NextPage(view) => {
                self.expecting_dlms_enable = false;
                self.expected_page_index = self.expected_page_index.wrapping_add(1);
                self.pages.push(view);
                self.ctx.retry_count = 0;
                LadderAction::SendNextPage
            }
        }
    }

    pub fn expected_page_index(&self) -> u8 {
        self.expected_page_index
    }

    fn retry_or_switch(&mut self) -> LadderAction {
        self.retry_or_switch_with(TerminalOutcome::FailedRfTimeout)
    }

    fn retry_or_switch_with(&mut self, on_exhaustion: TerminalOutcome) -> LadderAction {
        self.ctx.retry_count += 1;
        if self.ctx.retry_count < RETRY_COUNT_MAX {
            return LadderAction::ResendSameRoute;
        }
        self.switch_alternate_or_terminal(on_exhaustion)
    }

    fn switch_alternate_or_terminal(&mut self, on_exhaustion: TerminalOutcome) -> LadderAction {
        if self.ctx.alternate_retry_count >= ALTERNATE_RETRY_COUNT_MAX {
            self.ctx.active = false;
            return LadderAction::Done(on_exhaustion);
        }
        let next = self.current_alternate.map(|i| i + 1).unwrap_or(0);
        if next >= self.alternates.len() {
            self.ctx.active = false;
            return LadderAction::Done(on_exhaustion);
        }
        self.current_alternate = Some(next);
        self.ctx.alternate_retry_count += 1;
        self.ctx.retry_count = 0;
        LadderAction::SwitchAlternateAndResend
    }
}

/// Collaborator boundary for the gateway socket (spec §1, §6): a per-session
/// byte-stream send/receive pair with a caller-supplied timeout.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, frame: &[u8]) -> Result<(), EngineError>;
    async fn recv(&self, timeout: std::time::Duration) -> Result<Vec<u8>, EngineError>;
}

/// Reserved record `data_index` carrying a DLMS error word in place of a
/// normal value, and the DLMS `command` byte reserved to signal the
/// mesh-level connection-not-ready condition. These two sentinels aren't
/// part of a published DLMS object catalogue — they're this network's own
/// convention for folding protocol-level errors into the same frame shape
/// as data responses.
pub const DLMS_ERROR_RECORD_INDEX: u8 = 0xFF;
pub const DLMS_CONNECTION_FAILED_COMMAND: u8 = 0xFD;

/// `more-pages` bit of the DLMS `sub_command` byte.
const MORE_PAGES_BIT: u8 = 0x01;

/// Classifies one raw inbound mesh frame per the §4.3 correlation rules.
/// Wire-format failures are never retried at this layer (§7) — they surface
/// as `InvalidResponse` directly.
pub fn classify_response(
    raw: &[u8],
    expected_source: [u8; 4],
    expected_page: u8,
) -> TransactionEvent {
    let mesh = match codec::parse_mesh(raw) {
        Ok(m) => m,
        Err(_) => return TransactionEvent::InvalidResponse,
    };

    if mesh.payload.len() == 1 {
        return match mesh.payload[0] {
            0x06 => TransactionEvent::RetryTimeout,
            0x07 => TransactionEvent::CommandInProgress,
            code => TransactionEvent::PmeshError(code),
        };
    }

    if mesh.source_addr != expected_source {
        return TransactionEvent::InvalidResponse;
    }

    let dlms = match codec::parse_dlms(&mesh.payload, Direction::Response) {
        Ok(v) => v,
        Err(crate::error::WireFormatError::BadChecksum) => return TransactionEvent::DlmsChecksumError,
        Err(_) => return TransactionEvent::InvalidResponse,
    };

    if dlms.command == DLMS_CONNECTION_FAILED_COMMAND {
        return TransactionEvent::DlmsConnectionFailed;
    }

    if dlms.records.len() >= 5 && dlms.records[0] == DLMS_ERROR_RECORD_INDEX {
        let code = u16::from_be_bytes([dlms.records[3], dlms.records[4]]);
        return TransactionEvent::DlmsError(code);
    }

    if dlms.page_index != expected_page {
        return TransactionEvent::InvalidResponse;
    }

    if dlms.sub_command & MORE_PAGES_BIT != 0 {
        TransactionEvent::NextPage(dlms)
    } else {
        TransactionEvent::Success(dlms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path_book::PathInfo;

    fn path(hop_count: u8) -> PathInfo {
        PathInfo { hop_count, hop_addresses: vec![1, 2, 3, 4] }
    }

    #[test]
    fn next_page_index_wraps_mod_256() {
        let primary = path(0);
        let alts: Vec<&PathInfo> = Vec::new();
        let mut t = Transactor::new(&primary, &alts, false);
        for p in 0u16..300 {
            let view = DlmsView {
                start: codec::DLMS_START_RESPONSE,
                length_field: 0,
                page_index: (p % 256) as u8,
                frame_id: 0x0E,
                command: 0,
                sub_command: MORE_PAGES_BIT,
                records: vec![],
                checksum: 0,
            };
            let action = t.on_event(TransactionEvent::NextPage(view));
            assert_eq!(action, LadderAction::SendNextPage);
            assert_eq!(t.expected_page_index(), ((p + 1) % 256) as u8);
        }
    }

    #[test]
    fn retry_ladder_bound_property_5() {
        let primary = path(0);
        let alt1 = path(0);
        let alt2 = path(0);
        let alts: Vec<&PathInfo> = vec![&alt1, &alt2];
        let mut t = Transactor::new(&primary, &alts, false);

        let mut attempts = 0u32;
        let outcome = loop {
            attempts += 1;
            match t.on_event(TransactionEvent::RetryTimeout) {
                LadderAction::Done(outcome) => break outcome,
                _ => continue,
            }
        };
        assert_eq!(outcome, TerminalOutcome::FailedRfTimeout);
        // 3 timeouts per route × (1 primary + 2 alternates) == 9.
        assert_eq!(attempts, RETRY_COUNT_MAX as u32 * (1 + ALTERNATE_RETRY_COUNT_MAX as u32));
    }

    #[test]
    fn scenario_e_switches_to_alternate_after_three_timeouts() {
        let primary = path(0);
        let alt1 = path(0);
        let alts: Vec<&PathInfo> = vec![&alt1];
        let mut t = Transactor::new(&primary, &alts, false);

        // Three consecutive timeouts on the primary route; the third decides
        // to switch (its resend happens on the alternate).
        assert_eq!(t.on_event(TransactionEvent::RetryTimeout), LadderAction::ResendSameRoute);
        assert_eq!(t.on_event(TransactionEvent::RetryTimeout), LadderAction::ResendSameRoute);
        let third = t.on_event(TransactionEvent::RetryTimeout);
        assert_eq!(third, LadderAction::SwitchAlternateAndResend);
        assert_eq!(t.current_route() as *const _, &alt1 as *const _);

        // Three further timeouts on that alternate; no alternates remain, so
        // the third is terminal.
        assert_eq!(t.on_event(TransactionEvent::RetryTimeout), LadderAction::ResendSameRoute);
        assert_eq!(t.on_event(TransactionEvent::RetryTimeout), LadderAction::ResendSameRoute);
        let terminal = t.on_event(TransactionEvent::RetryTimeout);
        assert_eq!(terminal, LadderAction::Done(TerminalOutcome::FailedRfTimeout));
    }

    #[test]
    fn command_in_progress_does_not_advance_retry_count() {
        let primary = path(0);
        let alts: Vec<&PathInfo> = Vec::new();
        let mut t = Transactor::new(&primary, &alts, false);
        for _ in 0..10 {
            assert_eq!(t.on_event(TransactionEvent::CommandInProgress), LadderAction::WaitAndResend);
        }
        assert_eq!(t.ctx.retry_count, 0);
    }

    #[test]
    fn dlms_connection_failed_sub_flow_bounded_at_three() {
        let primary = path(0);
        let alts: Vec<&PathInfo> = Vec::new();
        let mut t = Transactor::new(&primary, &alts, false);
        for _ in 0..DLMS_CONNECTION_RETRY_MAX {
            assert_eq!(t.on_event(TransactionEvent::DlmsConnectionFailed), LadderAction::SendDlmsEnable);
        }
        let exhausted = t.on_event(TransactionEvent::DlmsConnectionFailed);
        assert_eq!(exhausted, LadderAction::Done(TerminalOutcome::FailedRfTimeout));
    }

    #[test]
    fn poll_timeout_terminal_for_ping_node() {
        let primary = path(0);
        let alts: Vec<&PathInfo> = Vec::new();
        let mut t = Transactor::new(&primary, &alts, true);
        assert_eq!(
            t.on_event(TransactionEvent::PollTimeout),
            LadderAction::Done(TerminalOutcome::PollTimeout)
        );
    }

    #[test]
    fn classify_response_detects_checksum_and_mismatch() {
        let dlms = codec::build_dlms(Direction::Response, 0, 0x0E, 0, 0, &[1, 2, 3]);
        let mut mesh = codec::build_mesh(
            codec::MeshPacketType::DataResponse as u8,
            [0; 4],
            [9, 9, 9, 9],
            0,
            &[1, 2, 3, 4],
            &dlms,
        )
        .unwrap();
        let event = classify_response(&mesh, [9, 9, 9, 9], 0);
        assert_eq!(event, TransactionEvent::Success(codec::parse_dlms(&dlms, Direction::Response).unwrap()));

        // Corrupt source address correlation.
        let wrong_source = classify_response(&mesh, [1, 1, 1, 1], 0);
        assert_eq!(wrong_source, TransactionEvent::InvalidResponse);

        // Flip the DLMS frame's own trailing checksum byte (embedded inside the
        // mesh payload), then recompute the mesh's own trailing checksum so
        // only the inner DLMS check fails.
        let payload_start = mesh.len() - dlms.len() - 1;
        mesh[payload_start + dlms.len() - 1] ^= 0xFF;
        let new_checksum = codec::sum_mod_256(&mesh[payload_start..mesh.len() - 1]);
        let last = mesh.len() - 1;
        mesh[last] = new_checksum;
        let event = classify_response(&mesh, [9, 9, 9, 9], 0);
        assert_eq!(event, TransactionEvent::DlmsChecksumError);
    }
}
