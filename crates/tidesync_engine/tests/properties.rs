//! Property tests: whatever the interleaving of edits, failures and lost
//! responses, a drained outbox leaves client and server in agreement.

use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tidesync_engine::testing::{LoopbackHttp, MemoryServer};
use tidesync_engine::{EngineConfig, Intent, ManualClock, SyncEngine};
use tidesync_protocol::{RecordId, SyncStatus, Timestamp};
use tidesync_store::{DurableStore, LocalDataSource, MemoryJournal};

#[derive(Debug, Clone)]
enum Step {
    Write(usize, u8),
    Remove(usize),
    Cycle,
    Fail(u16),
    Lose,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (0..4usize, any::<u8>()).prop_map(|(id, byte)| Step::Write(id, byte)),
        1 => (0..4usize).prop_map(Step::Remove),
        3 => Just(Step::Cycle),
        1 => prop_oneof![Just(500u16), Just(503u16), Just(429u16)].prop_map(Step::Fail),
        1 => Just(Step::Lose),
    ]
}

struct World {
    engine: SyncEngine,
    store: Arc<DurableStore>,
    server: Arc<MemoryServer>,
    http: Arc<LoopbackHttp>,
    clock: Arc<ManualClock>,
}

fn world() -> World {
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000_000)));
    let server = Arc::new(MemoryServer::new(clock.clone()));
    let http = Arc::new(LoopbackHttp::new(server.clone()));
    let store = Arc::new(DurableStore::open(Box::new(MemoryJournal::new())).unwrap());
    let engine = SyncEngine::with_http(store.clone(), http.clone())
        .clock(clock.clone())
        .config(EngineConfig::default().with_batch_size(3))
        .build()
        .unwrap();
    engine
        .login(server.issue_session(Duration::from_secs(365 * 24 * 3600)))
        .unwrap();
    World {
        engine,
        store,
        server,
        http,
        clock,
    }
}

fn record_id(n: usize) -> RecordId {
    RecordId::from(format!("k{}", n).as_str())
}

impl World {
    async fn apply(&self, step: &Step) {
        self.clock.advance(Duration::from_secs(1));
        match step {
            Step::Write(n, byte) => {
                let id = record_id(*n);
                let intent = match self.store.get(&id).unwrap() {
                    None => Intent::Create {
                        id: Some(id),
                        payload: vec![*byte],
                    },
                    Some(record) if record.sync_status == SyncStatus::PendingDelete => return,
                    Some(_) => Intent::Update {
                        id,
                        payload: vec![*byte],
                    },
                };
                self.engine.submit_intent(intent).unwrap();
            }
            Step::Remove(n) => {
                let id = record_id(*n);
                if let Some(record) = self.store.get(&id).unwrap() {
                    if record.sync_status == SyncStatus::Synced {
                        self.engine.submit_intent(Intent::Delete { id }).unwrap();
                    }
                }
            }
            Step::Cycle => {
                self.engine.run_cycle().await.unwrap();
            }
            Step::Fail(status) => self.server.fail_next(*status),
            Step::Lose => self.http.lose_responses(1),
        }
    }

    async fn drain(&self) {
        for _ in 0..100 {
            if self.store.outbox().unwrap().is_empty() {
                return;
            }
            self.clock.advance(Duration::from_secs(5 * 60));
            self.engine.run_cycle().await.unwrap();
        }
    }
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn drained_outbox_matches_server(steps in prop::collection::vec(step_strategy(), 1..40)) {
        let (outbox, records, live) = block_on(async {
            let w = world();
            for step in &steps {
                w.apply(step).await;
            }
            w.drain().await;
            (
                w.store.outbox().unwrap(),
                w.store.records().unwrap(),
                w.server.live_records(),
            )
        });

        prop_assert!(outbox.is_empty(), "outbox not drained: {:?}", outbox);
        for record in &records {
            prop_assert_eq!(record.sync_status, SyncStatus::Synced);
        }
        let mut local: Vec<(RecordId, Vec<u8>)> = records
            .into_iter()
            .map(|r| (r.id, r.payload))
            .collect();
        local.sort();
        prop_assert_eq!(local, live);
    }

    #[test]
    fn one_entry_per_pending_record(steps in prop::collection::vec(step_strategy(), 1..40)) {
        block_on(async {
            let w = world();
            for step in &steps {
                w.apply(step).await;

                let outbox = w.store.outbox().unwrap();
                let ids: HashSet<_> = outbox.iter().map(|e| e.record_id.clone()).collect();
                assert_eq!(ids.len(), outbox.len());

                let pending = w
                    .store
                    .records()
                    .unwrap()
                    .into_iter()
                    .filter(|r| r.sync_status.is_pending())
                    .count();
                assert_eq!(pending, outbox.len());
            }
        });
    }
}
