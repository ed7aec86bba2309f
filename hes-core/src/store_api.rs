//! # store_api
//!
//! The relational store collaborator, named at its interface boundary
//! (spec §1, §6): the engine never builds SQL itself, it calls typed
//! operations against this trait. `hes-server::store` supplies the real
//! sqlx-backed implementation; `MockStore` here backs the core's own unit
//! tests so the engine is testable without a live database.

use async_trait::async_trait;

use crate::error::EngineError;

/// A stored source route, still including its 4-byte gateway prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPath {
    pub path_bytes: Vec<u8>,
}

/// Canonical `RequestStatus` transitions (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestStatus {
    Requested = 0,
    InProgress = 2,
    Success = 3,
    Cancelled = 5,
    FailedTimeout = 6,
    FailedRfTimeout = 7,
    FailedChecksum = 8,
    FailedInvalidResponse = 9,
    GwDisconnected = 10,
    FailedMeshProtocol = 11,
    FailedFirmwareIo = 12,
    FailedOther = 13,
    RetryInProgress = 4,
}

#[derive(Debug, Clone)]
pub struct PathRow {
    pub mac: [u8; 8],
    pub path: RawPath,
}

/// Which of the last four instantaneous-profile cycles, plus the coarser
/// profile kinds, are missing for a node (§4.5 step 3).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissingCycleInfo {
    pub missing_ip_cycles: Vec<u8>,
    pub missing_blp_last_hour: bool,
    pub missing_dlp_yesterday: bool,
    pub missing_bhp_last_month: bool,
    pub missing_nameplate: bool,
    pub missing_ifv: bool,
    pub is_silenced: bool,
}

#[derive(Debug, Clone)]
pub struct ProfileRecordBatch {
    pub mac: [u8; 8],
    pub gateway_id: String,
    pub cycle_id: u8,
    pub fields: Vec<(String, crate::codec::DlmsValue)>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn load_primary_routes(&self, gateway_id: &str) -> Result<Vec<PathRow>, EngineError>;
    async fn load_alternate_routes(&self, gateway_id: &str) -> Result<Vec<PathRow>, EngineError>;

    async fn missing_cycle_info(
        &self,
        gateway_id: &str,
        mac: [u8; 8],
        current_cycle_id: u8,
    ) -> Result<MissingCycleInfo, EngineError>;

    async fn append_nameplate(&self, batch: ProfileRecordBatch) -> Result<(), EngineError>;
    async fn upsert_meter_details(&self, batch: ProfileRecordBatch) -> Result<(), EngineError>;
    async fn append_ip_push(&self, batch: ProfileRecordBatch) -> Result<(), EngineError>;
    async fn append_dlp_push(&self, batch: ProfileRecordBatch) -> Result<(), EngineError>;
    async fn append_blp_push(&self, batch: ProfileRecordBatch) -> Result<(), EngineError>;
    async fn append_history(&self, batch: ProfileRecordBatch) -> Result<(), EngineError>;

    async fn set_request_status(
        &self,
        request_id: u64,
        status: RequestStatus,
        error_code: Option<u16>,
    ) -> Result<(), EngineError>;

    async fn set_fuota_status(&self, gateway_id: &str, mac: [u8; 8], phase: u8) -> Result<(), EngineError>;

    async fn record_silenced(&self, gateway_id: &str, mac: [u8; 8]) -> Result<(), EngineError>;
    async fn record_unsilenced(&self, gateway_id: &str, mac: [u8; 8]) -> Result<(), EngineError>;
    async fn silenced_nodes(&self, gateway_id: &str) -> Result<Vec<[u8; 8]>, EngineError>;

    /// Acquire the gateway from the other (NMS) controller — §4.5 step 1.
    /// Returns `true` if acquired, `false` if the peer controller still
    /// holds it.
    async fn try_acquire_sync(&self, gateway_id: &str) -> Result<bool, EngineError>;

    async fn recent_fuota_resume(
        &self,
        gateway_id: &str,
        within_secs: u64,
    ) -> Result<Option<FuotaResumeRecord>, EngineError>;
}

#[derive(Debug, Clone)]
pub struct FuotaResumeRecord {
    pub target_mac: [u8; 8],
    pub firmware_path: String,
}

/// In-memory `Store` used only by `hes-core`'s own unit tests.
#[derive(Default)]
pub struct MockStore {
    pub primary_routes: Vec<([u8; 8], RawPath)>,
    pub alternate_routes: Vec<([u8; 8], RawPath)>,
}

#[async_trait]
impl Store for MockStore {
    async fn load_primary_routes(&self, _gateway_id: &str) -> Result<Vec<PathRow>, EngineError> {
        Ok(self
            .primary_routes
            .iter()
            .map(|(mac, p)| PathRow { mac: *mac, path: p.clone() })
            .collect())
    }

    async fn load_alternate_routes(&self, _gateway_id: &str) -> Result<Vec<PathRow>, EngineError> {
        Ok(self
            .alternate_routes
            .iter()
            .map(|(mac, p)| PathRow { mac: *mac, path: p.clone() })
            .collect())
    }

    async fn missing_cycle_info(
        &self,
        _gateway_id: &str,
        _mac: [u8; 8],
        _current_cycle_id: u8,
    ) -> Result<MissingCycleInfo, EngineError> {
        Ok(MissingCycleInfo::default())
    }

    async fn append_nameplate(&self, _batch: ProfileRecordBatch) -> Result<(), EngineError> { Ok(()) }
    async fn upsert_meter_details(&self, _batch: ProfileRecordBatch) -> Result<(), EngineError> { Ok(()) }
    async fn append_ip_push(&self, _batch: ProfileRecordBatch) -> Result<(), EngineError> { Ok(()) }
    async fn append_dlp_push(&self, _batch: ProfileRecordBatch) -> Result<(), EngineError> { Ok(()) }
    async fn append_blp_push(&self, _batch: ProfileRecordBatch) -> Result<(), EngineError> { Ok(()) }
    async fn append_history(&self, _batch: ProfileRecordBatch) -> Result<(), EngineError> { Ok(()) }

    async fn set_request_status(
        &self,
        _request_id: u64,
        _status: RequestStatus,
        _error_code: Option<u16>,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    async fn set_fuota_status(&self, _gateway_id: &str, _mac: [u8; 8], _phase: u8) -> Result<(), EngineError> {
        Ok(())
    }

    async fn record_silenced(&self, _gateway_id: &str, _mac: [u8; 8]) -> Result<(), EngineError> { Ok(()) }
    async fn record_unsilenced(&self, _gateway_id: &str, _mac: [u8; 8]) -> Result<(), EngineError> { Ok(()) }
    async fn silenced_nodes(&self, _gateway_id: &str) -> Result<Vec<[u8; 8]>, EngineError> { Ok(Vec::new()) }

    async fn try_acquire_sync(&self, _gateway_id: &str) -> Result<bool, EngineError> { Ok(true) }

    async fn recent_fuota_resume(
        &self,
        _gateway_id: &str,
        _within_secs: u64,
    ) -> Result<Option<FuotaResumeRecord>, EngineError> {
        Ok(None)
    }
}
