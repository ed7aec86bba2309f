//! Exercises `scheduler::plan_cycle` and `path_book::PathBook` together
//! against a hand-built `Store`, the way `hes-server::gateway` drives them.

use std::sync::Mutex;

use async_trait::async_trait;
use hes_core::error::EngineError;
use hes_core::path_book::PathBook;
use hes_core::scheduler::{self, PullTask};
use hes_core::store_api::{
    FuotaResumeRecord, MissingCycleInfo, PathRow, ProfileRecordBatch, RawPath, RequestStatus, Store,
};

const GATEWAY: &str = "GW0000000000001";
const METER_A: [u8; 8] = [0, 0, 0, 0, 0, 0, 0, 1];
const METER_B: [u8; 8] = [0, 0, 0, 0, 0, 0, 0, 2];

#[derive(Default)]
struct FixtureStore {
    appended: Mutex<Vec<&'static str>>,
}

#[async_trait]
impl Store for FixtureStore {
    async fn load_primary_routes(&self, _gateway_id: &str) -> Result<Vec<PathRow>, EngineError> {
        Ok(vec![
            PathRow { mac: METER_A, path: RawPath { path_bytes: vec![0, 0, 0, 0, 1, 2, 3, 4] } },
            PathRow { mac: METER_B, path: RawPath { path_bytes: vec![0, 0, 0, 0, 5, 6, 7, 8] } },
        ])
    }

    async fn load_alternate_routes(&self, _gateway_id: &str) -> Result<Vec<PathRow>, EngineError> {
        Ok(Vec::new())
    }

    async fn missing_cycle_info(
        &self,
        _gateway_id: &str,
        mac: [u8; 8],
        _current_cycle_id: u8,
    ) -> Result<MissingCycleInfo, EngineError> {
        if mac == METER_A {
            Ok(MissingCycleInfo { missing_nameplate: true, missing_ip_cycles: vec![3], ..Default::default() })
        } else {
            Ok(MissingCycleInfo { is_silenced: true, ..Default::default() })
        }
    }

    async fn append_nameplate(&self, _batch: ProfileRecordBatch) -> Result<(), EngineError> {
        self.appended.lock().unwrap().push("nameplate");
        Ok(())
    }
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
    async fn record_unsilenced(&self, _gateway_id: &str, _mac: [u8; 8]) -> Result<(), EngineError> {
        self.appended.lock().unwrap().push("unsilenced");
        Ok(())
    }
    async fn silenced_nodes(&self, _gateway_id: &str) -> Result<Vec<[u8; 8]>, EngineError> {
        Ok(vec![METER_B])
    }

    async fn try_acquire_sync(&self, _gateway_id: &str) -> Result<bool, EngineError> {
        Ok(true)
    }

    async fn recent_fuota_resume(
        &self,
        _gateway_id: &str,
        _within_secs: u64,
    ) -> Result<Option<FuotaResumeRecord>, EngineError> {
        Ok(None)
    }
}

#[tokio::test]
async fn path_book_loads_and_scheduler_plans_around_silenced_nodes() {
    let store = FixtureStore::default();
    let mut path_book = PathBook::new(GATEWAY.to_string());
    path_book.load(&store).await.expect("path book load");

    assert!(path_book.primary(METER_A).is_some());
    assert!(path_book.primary(METER_B).is_some());

    let plan = scheduler::plan_cycle(&store, GATEWAY, path_book.node_order(), 1)
        .await
        .expect("plan cycle");

    assert_eq!(plan.nodes_to_unsilence, vec![METER_B]);
    assert_eq!(plan.node_pulls.len(), 1);
    let (mac, tasks) = &plan.node_pulls[0];
    assert_eq!(*mac, METER_A);
    assert_eq!(tasks, &vec![PullTask::Nameplate, PullTask::InstantaneousCycle(3)]);

    for mac in &plan.nodes_to_unsilence {
        store.record_unsilenced(GATEWAY, *mac).await.unwrap();
    }
    assert_eq!(*store.appended.lock().unwrap(), vec!["unsilenced"]);
}

#[tokio::test]
async fn gateway_sync_acquired_immediately_when_store_grants_it() {
    let store = FixtureStore::default();
    let acquired = scheduler::acquire_gateway_sync(
        &store,
        GATEWAY,
        std::time::Duration::from_millis(1),
        std::time::Duration::from_millis(50),
    )
    .await
    .unwrap();
    assert!(acquired);
}
