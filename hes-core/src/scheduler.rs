//! # scheduler
//!
//! Per-gateway pull-cycle planner (§4.5): computes the current cycle-id,
//! acquires the gateway from the peer (NMS) controller, decides which
//! profiles are missing for each node, and orders the resulting pulls.
//! Issuing the transactions themselves is `hes-server`'s job — this module
//! only plans.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::EngineError;
use crate::mqtt_api::MqttSource;
use crate::store_api::{MissingCycleInfo, RequestStatus, Store};

pub const CYCLES_PER_DAY: u8 = 96;
pub const CYCLES_PER_HOUR: u8 = 4;
pub const CYCLE_TOLERANCE_MINUTES: u32 = 5;

pub const SYNC_ACQUIRE_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const SYNC_ACQUIRE_MAX_WAIT: Duration = Duration::from_secs(120);

/// `calculate_cycle_id` — the tolerance variant (add 5 minutes before `/15`)
/// is canonical per the original source's duplicated helpers (§9).
pub fn calculate_cycle_id(hour: u8, minute: u8) -> u8 {
    let total_minutes = hour as u32 * 60 + minute as u32 + CYCLE_TOLERANCE_MINUTES;
    let id = total_minutes / 15 + 1;
    id.clamp(1, CYCLES_PER_DAY as u32) as u8
}

/// Bit position of `cycle_id` within the 4-cycle-per-hour `done-mask`.
fn quarter_bit(cycle_id: u8) -> u8 {
    (cycle_id.saturating_sub(1)) % CYCLES_PER_HOUR
}

/// Tracks which of the current hour's quarter cycles have been pulled.
/// Cleared whenever the hour changes (§3 invariant).
#[derive(Debug, Clone, Default)]
pub struct DoneMask {
    bits: u8,
    current_hour: Option<u8>,
}

impl DoneMask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets to zero if `hour` differs from the last hour observed.
    pub fn roll_to_hour(&mut self, hour: u8) {
        if self.current_hour != Some(hour) {
            self.bits = 0;
            self.current_hour = Some(hour);
        }
    }

    pub fn mark_done(&mut self, cycle_id: u8) {
        self.bits |= 1 << quarter_bit(cycle_id);
    }

    pub fn is_done(&self, cycle_id: u8) -> bool {
        self.bits & (1 << quarter_bit(cycle_id)) != 0
    }
}

/// One unit of work the scheduler wants pulled, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullTask {
    Nameplate,
    Ifv,
    InstantaneousCycle(u8),
    DailyLoad,
    BlockLoad,
    BillingHistory,
}

/// Builds the ordered pull plan for one node from its `MissingCycleInfo`.
/// Priority: Nameplate > IFV > IP > DLP > BLP > BHP — later profiles depend
/// on the meter having announced itself first. Silenced nodes get no pulls.
pub fn plan_pulls_for_node(missing: &MissingCycleInfo) -> Vec<PullTask> {
    if missing.is_silenced {
        return Vec::new();
    }
    let mut tasks = Vec::new();
    if missing.missing_nameplate {
        tasks.push(PullTask::Nameplate);
    }
    if missing.missing_ifv {
        tasks.push(PullTask::Ifv);
    }
    for &cycle in &missing.missing_ip_cycles {
        tasks.push(PullTask::InstantaneousCycle(cycle));
    }
    if missing.missing_dlp_yesterday {
        tasks.push(PullTask::DailyLoad);
    }
    if missing.missing_blp_last_hour {
        tasks.push(PullTask::BlockLoad);
    }
    if missing.missing_bhp_last_month {
        tasks.push(PullTask::BillingHistory);
    }
    tasks
}

/// Step 1: acquire the gateway from the peer controller, polling at
/// `poll_interval` up to `max_wait` before giving up.
pub async fn acquire_gateway_sync(
    store: &dyn Store,
    gateway_id: &str,
    poll_interval: Duration,
    max_wait: Duration,
) -> Result<bool, EngineError> {
    let mut waited = Duration::ZERO;
    loop {
        if store.try_acquire_sync(gateway_id).await? {
            return Ok(true);
        }
        if waited >= max_wait {
            warn!(gateway_id, "gateway sync acquire timed out");
            return Ok(false);
        }
        tokio::time::sleep(poll_interval).await;
        waited += poll_interval;
    }
}

/// The complete per-cycle plan: which nodes to un-silence, and each node's
/// ordered pulls, in path-book iteration order.
#[derive(Debug, Clone, Default)]
pub struct CyclePlan {
    pub nodes_to_unsilence: Vec<[u8; 8]>,
    pub node_pulls: Vec<([u8; 8], Vec<PullTask>)>,
}

/// Builds the plan for one node list (step 3-5 of §4.5). Step 1 (acquire)
/// and step 2 (path-book load) are the caller's responsibility since they
/// touch collaborators this pure function doesn't need.
pub async fn plan_cycle(
    store: &dyn Store,
    gateway_id: &str,
    nodes: &[[u8; 8]],
    current_cycle_id: u8,
) -> Result<CyclePlan, EngineError> {
    let mut plan = CyclePlan::default();
    for &mac in nodes {
        let missing = store.missing_cycle_info(gateway_id, mac, current_cycle_id).await?;
        if missing.is_silenced {
            plan.nodes_to_unsilence.push(mac);
            continue;
        }
        let pulls = plan_pulls_for_node(&missing);
        if !pulls.is_empty() {
            plan.node_pulls.push((mac, pulls));
        }
    }
    debug!(
        gateway_id,
        nodes = plan.node_pulls.len(),
        unsilence = plan.nodes_to_unsilence.len(),
        "cycle plan built"
    );
    Ok(plan)
}

/// Drains the MQTT cancel-set, recording each id CANCELLED in the store.
/// Called at the top of every ODM batch and checkpointed mid-cycle (§4.5
/// step 6, §5 ordering guarantees).
pub async fn drain_cancellations(
    mqtt: &dyn MqttSource,
    store: &dyn Store,
    gateway_id: &str,
) -> Result<Vec<u64>, EngineError> {
    let cancelled = mqtt.drain_cancelled(gateway_id).await;
    for &id in &cancelled {
        store.set_request_status(id, RequestStatus::Cancelled, None).await?;
    }
    Ok(cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_api::MockStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn cycle_id_testable_property_6() {
        assert_eq!(calculate_cycle_id(0, 7), 1);
        assert_eq!(calculate_cycle_id(0, 22), 2);
        assert_eq!(calculate_cycle_id(23, 52), 96);
        assert_eq!(calculate_cycle_id(15, 18), 62);
    }

    #[test]
    fn done_mask_resets_on_hour_rollover() {
        let mut mask = DoneMask::new();
        mask.roll_to_hour(10);
        mask.mark_done(41); // hour 10, quarter 0
        assert!(mask.is_done(41));
        mask.roll_to_hour(11);
        assert!(!mask.is_done(41));
    }

    #[test]
    fn pull_plan_priority_order_and_silenced_skip() {
        let missing = MissingCycleInfo {
            missing_ip_cycles: vec![5, 6],
            missing_blp_last_hour: true,
            missing_dlp_yesterday: true,
            missing_bhp_last_month: true,
            missing_nameplate: true,
            missing_ifv: true,
            is_silenced: false,
        };
        let tasks = plan_pulls_for_node(&missing);
        assert_eq!(
            tasks,
            vec![
                PullTask::Nameplate,
                PullTask::Ifv,
                PullTask::InstantaneousCycle(5),
                PullTask::InstantaneousCycle(6),
                PullTask::DailyLoad,
                PullTask::BlockLoad,
                PullTask::BillingHistory,
            ]
        );

        let silenced = MissingCycleInfo { is_silenced: true, ..missing };
        assert!(plan_pulls_for_node(&silenced).is_empty());
    }

    struct CountingAcquireStore {
        inner: MockStore,
        acquire_after: u32,
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl Store for CountingAcquireStore {
        async fn load_primary_routes(&self, g: &str) -> Result<Vec<crate::store_api::PathRow>, EngineError> {
            self.inner.load_primary_routes(g).await
        }
        async fn load_alternate_routes(&self, g: &str) -> Result<Vec<crate::store_api::PathRow>, EngineError> {
            self.inner.load_alternate_routes(g).await
        }
        async fn missing_cycle_info(
            &self,
            g: &str,
            mac: [u8; 8],
            c: u8,
        ) -> Result<MissingCycleInfo, EngineError> {
            self.inner.missing_cycle_info(g, mac, c).await
        }
        async fn append_nameplate(&self, b: crate::store_api::ProfileRecordBatch) -> Result<(), EngineError> {
            self.inner.append_nameplate(b).await
        }
        async fn upsert_meter_details(&self, b: crate::store_api::ProfileRecordBatch) -> Result<(), EngineError> {
            self.inner.upsert_meter_details(b).await
        }
        async fn append_ip_push(&self, b: crate::store_api::ProfileRecordBatch) -> Result<(), EngineError> {
            self.inner.append_ip_push(b).await
        }
        async fn append_dlp_push(&self, b: crate::store_api::ProfileRecordBatch) -> Result<(), EngineError> {
            self.inner.append_dlp_push(b).await
        }
        async fn append_blp_push(&self, b: crate::store_api::ProfileRecordBatch) -> Result<(), EngineError> {
            self.inner.append_blp_push(b).await
        }
        async fn append_history(&self, b: crate::store_api::ProfileRecordBatch) -> Result<(), EngineError> {
            self.inner.append_history(b).await
        }
        async fn set_request_status(
            &self,
            id: u64,
            s: RequestStatus,
            e: Option<u16>,
        ) -> Result<(), EngineError> {
            self.inner.set_request_status(id, s, e).await
        }
        async fn set_fuota_status(&self, g: &str, mac: [u8; 8], p: u8) -> Result<(), EngineError> {
            self.inner.set_fuota_status(g, mac, p).await
        }
        async fn record_silenced(&self, g: &str, mac: [u8; 8]) -> Result<(), EngineError> {
            self.inner.record_silenced(g, mac).await
        }
        async fn record_unsilenced(&self, g: &str, mac: [u8; 8]) -> Result<(), EngineError> {
            self.inner.record_unsilenced(g, mac).await
        }
        async fn silenced_nodes(&self, g: &str) -> Result<Vec<[u8; 8]>, EngineError> {
            self.inner.silenced_nodes(g).await
        }
        async fn try_acquire_sync(&self, _gateway_id: &str) -> Result<bool, EngineError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(n >= self.acquire_after)
        }
        async fn recent_fuota_resume(
            &self,
            g: &str,
            s: u64,
        ) -> Result<Option<crate::store_api::FuotaResumeRecord>, EngineError> {
            self.inner.recent_fuota_resume(g, s).await
        }
    }

    #[tokio::test]
    async fn acquire_gateway_sync_polls_until_granted() {
        let store = CountingAcquireStore {
            inner: MockStore::default(),
            acquire_after: 3,
            calls: AtomicU32::new(0),
        };
        let granted = acquire_gateway_sync(
            &store,
            "GW1",
            Duration::from_millis(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert!(granted);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn acquire_gateway_sync_gives_up_after_max_wait() {
        let store = Arc::new(CountingAcquireStore {
            inner: MockStore::default(),
            acquire_after: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let granted = acquire_gateway_sync(
            store.as_ref(),
            "GW1",
            Duration::from_millis(1),
            Duration::from_millis(5),
        )
        .await
        .unwrap();
        assert!(!granted);
    }

    struct FixedMqtt {
        cancelled: Vec<u64>,
    }

    #[async_trait::async_trait]
    impl MqttSource for FixedMqtt {
        async fn next_command(&self, _gateway_id: &str) -> Option<String> {
            None
        }
        async fn drain_cancelled(&self, _gateway_id: &str) -> Vec<u64> {
            self.cancelled.clone()
        }
    }

    #[tokio::test]
    async fn drain_cancellations_marks_store_cancelled() {
        let mqtt = FixedMqtt { cancelled: vec![10, 11] };
        let store = MockStore::default();
        let drained = drain_cancellations(&mqtt, &store, "GW1").await.unwrap();
        assert_eq!(drained, vec![10, 11]);
    }
}
