//! Integration tests for the session store on a real execution pool:
//! durable round-trips, TTL expiry through the background sweep, and
//! isolation of the blocking persistence loop.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use bazaar_core::{SessionId, SessionRecord, UserId};
use bazaard::pool::LoopPool;
use bazaard::store::{spawn_store, spawn_sweeper, SessionStore};

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

struct TestStore {
    store: SessionStore,
    cancel: CancellationToken,
    pool: Arc<LoopPool>,
    _temp_dir: TempDir,
}

impl TestStore {
    fn spawn(sweep_interval: Duration) -> Self {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let db_path = temp_dir.path().join("sessions.db");

        let pool = Arc::new(LoopPool::new(1).expect("pool"));
        let store = spawn_store(&db_path, &pool.store_loop()).expect("spawn store");

        let cancel = CancellationToken::new();
        spawn_sweeper(
            store.clone(),
            sweep_interval,
            cancel.clone(),
            &pool.scheduler(),
        );

        Self {
            store,
            cancel,
            pool,
            _temp_dir: temp_dir,
        }
    }

    fn stop(self) {
        self.cancel.cancel();
        self.pool.stop();
    }
}

fn record(user: i64) -> SessionRecord {
    SessionRecord {
        user: Some(UserId(user)),
        verify_phone: None,
        verify_token: None,
    }
}

#[tokio::test]
async fn test_save_load_roundtrip_on_disk() {
    let harness = TestStore::spawn(Duration::from_secs(3600));
    let store = harness.store.clone();

    let id = SessionId::new("round-trip");
    let rec = SessionRecord {
        user: Some(UserId(21)),
        verify_phone: Some("15550007777".into()),
        verify_token: Some("481516".into()),
    };

    store
        .save(id.clone(), rec.clone(), Duration::from_secs(60))
        .await
        .expect("save");

    assert!(store.exist(id.clone()).await.expect("exist"));
    assert_eq!(store.load(id).await.expect("load"), Some(rec));

    harness.stop();
}

#[tokio::test]
async fn test_expired_record_removed_by_background_sweep() {
    let harness = TestStore::spawn(Duration::from_millis(50));
    let store = harness.store.clone();

    let id = SessionId::new("short-lived");
    store
        .save(id.clone(), record(1), Duration::from_secs(0))
        .await
        .expect("save");

    // The sweep runs on its own loop; wait for it to catch the record
    let result = timeout(STEP_TIMEOUT, async {
        loop {
            if !store.exist(id.clone()).await.expect("exist") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "expired record survived the sweep");

    harness.stop();
}

#[tokio::test]
async fn test_live_record_survives_sweeps() {
    let harness = TestStore::spawn(Duration::from_millis(50));
    let store = harness.store.clone();

    let id = SessionId::new("long-lived");
    store
        .save(id.clone(), record(2), Duration::from_secs(600))
        .await
        .expect("save");

    // Several sweep cycles pass
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(store.exist(id).await.expect("exist"));

    harness.stop();
}

#[tokio::test]
async fn test_update_lifetime_extends_expiry() {
    let harness = TestStore::spawn(Duration::from_millis(50));
    let store = harness.store.clone();

    let id = SessionId::new("refreshed");
    store
        .save(id.clone(), record(3), Duration::from_secs(0))
        .await
        .expect("save");
    assert!(store
        .update_lifetime(id.clone(), Duration::from_secs(600))
        .await
        .expect("update"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(store.exist(id).await.expect("exist"));

    harness.stop();
}

#[tokio::test]
async fn test_concurrent_saves_last_writer_wins() {
    let harness = TestStore::spawn(Duration::from_secs(3600));
    let store = harness.store.clone();

    let id = SessionId::new("contended");
    let mut tasks = Vec::new();
    for user in 0..16i64 {
        let store = store.clone();
        let id = id.clone();
        tasks.push(tokio::spawn(async move {
            store
                .save(id, record(user), Duration::from_secs(60))
                .await
                .expect("save");
        }));
    }
    for task in tasks {
        task.await.expect("join");
    }

    // Whichever save landed last, the record is complete and decodable
    let loaded = store.load(id).await.expect("load").expect("present");
    assert!(loaded.user.is_some());

    harness.stop();
}

#[tokio::test]
async fn test_network_loops_stay_responsive_during_writes() {
    let harness = TestStore::spawn(Duration::from_secs(3600));
    let store = harness.store.clone();

    // Saturate the persistence loop
    let writer = tokio::spawn(async move {
        for n in 0..200i64 {
            let id = SessionId::new(format!("bulk-{n}"));
            store
                .save(id, record(n), Duration::from_secs(60))
                .await
                .expect("save");
        }
    });

    // A timer on the test loop must not be starved meanwhile
    let started = tokio::time::Instant::now();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(started.elapsed() < Duration::from_millis(500));

    writer.await.expect("writer");
    harness.stop();
}
