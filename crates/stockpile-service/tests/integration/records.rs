use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use stockpile_cache::CacheSettings;
use stockpile_service::Error;
use stockpile_service::services::RecordService;
use stockpile_service::storage::Storage;
use stockpile_test::{MemoryStorage, ready_scope, setup};

#[derive(Clone, Debug, PartialEq)]
struct Player {
    name: String,
    balance: u64,
}

fn player(name: &str, balance: u64) -> Player {
    Player {
        name: name.to_owned(),
        balance,
    }
}

type Players = RecordService<u32, Player, MemoryStorage<u32, Player>>;

fn service(storage: MemoryStorage<u32, Player>) -> (Arc<Players>, Arc<MemoryStorage<u32, Player>>) {
    let storage = Arc::new(storage);
    let service = RecordService::new(
        &CacheSettings::named("players"),
        Arc::clone(&storage),
        ready_scope(),
    );
    (Arc::new(service), storage)
}

#[tokio::test]
async fn test_get_loads_once() {
    setup();
    let (service, storage) = service(MemoryStorage::new());
    storage.seed(1, player("alice", 10));

    assert_eq!(service.get(&1).await, Some(player("alice", 10)));
    assert_eq!(service.get(&1).await, Some(player("alice", 10)));
    assert_eq!(storage.reads(), 1);

    let stats = service.stats();
    assert_eq!(stats.hit_count, 1);
    assert_eq!(stats.miss_count, 1);
    assert_eq!(stats.load_success_count, 1);
}

#[tokio::test]
async fn test_concurrent_misses_read_storage_once() {
    setup();
    let storage = MemoryStorage::new().with_latency(Duration::from_millis(50));
    let (service, storage) = service(storage);
    storage.seed(1, player("alice", 10));

    let reads = (0..10).map(|_| service.get(&1));
    let results = futures::future::join_all(reads).await;

    assert_eq!(storage.reads(), 1);
    assert!(results.iter().all(|result| *result == Some(player("alice", 10))));
    assert!(!service.is_loading(&1));
}

#[tokio::test]
async fn test_overlapping_fetches_share_latency() {
    setup();
    let storage = MemoryStorage::new().with_latency(Duration::from_millis(100));
    let (service, storage) = service(storage);
    storage.seed(7, player("bob", 3));

    let start = Instant::now();
    let first = service.fetch(&7);
    let second = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        service.fetch(&7).await
    };
    let (first, second) = futures::join!(first, second);

    assert_eq!(first.unwrap(), Some(player("bob", 3)));
    assert_eq!(second.unwrap(), Some(player("bob", 3)));
    assert_eq!(storage.reads(), 1);
    assert!(start.elapsed() < Duration::from_millis(180));
}

#[tokio::test]
async fn test_get_absorbs_failures_fetch_reports_them() {
    setup();
    let (service, storage) = service(MemoryStorage::new());
    storage.seed(1, player("alice", 10));
    storage.fail_on(1);

    assert_eq!(service.get(&1).await, None);
    assert_eq!(service.stats().load_failure_count, 1);

    let error = service.fetch(&1).await.unwrap_err();
    assert!(matches!(error, Error::LoadFailure { .. }));
    assert_eq!(error.cause().unwrap().to_string(), "storage unavailable");

    // nothing was cached, the next read goes to storage again
    storage.recover(&1);
    assert_eq!(service.fetch(&1).await.unwrap(), Some(player("alice", 10)));
    assert_eq!(storage.reads(), 3);
}

#[tokio::test]
async fn test_missing_record() {
    setup();
    let (service, storage) = service(MemoryStorage::new());

    assert_eq!(service.get(&404).await, None);
    assert_eq!(service.fetch(&404).await.unwrap(), None);
    assert!(!service.exists(&404).await.unwrap());
    assert_eq!(storage.reads(), 3);
}

#[tokio::test]
async fn test_save_update_delete() {
    setup();
    let (service, storage) = service(MemoryStorage::new());

    service.save(1, player("alice", 10)).await.unwrap();
    assert_eq!(storage.writes(), 1);
    assert_eq!(service.get(&1).await, Some(player("alice", 10)));
    // read our own write from the cache
    assert_eq!(storage.reads(), 0);

    let updated = service
        .update(1, |mut player| {
            player.balance += 5;
            player
        })
        .await
        .unwrap();
    assert_eq!(updated, Some(player("alice", 15)));
    assert_eq!(storage.record(&1), Some(player("alice", 15)));

    let untouched = service.update(2, |player| player).await.unwrap();
    assert_eq!(untouched, None);
    assert_eq!(storage.writes(), 2);

    assert!(service.exists(&1).await.unwrap());
    service.delete(&1).await.unwrap();
    assert_eq!(storage.record(&1), None);
    assert!(!service.exists(&1).await.unwrap());
}

#[tokio::test]
async fn test_failed_save_keeps_cache() {
    setup();
    let (service, storage) = service(MemoryStorage::new());
    service.save(1, player("alice", 10)).await.unwrap();

    storage.fail_on(1);
    let error = service.save(1, player("alice", 0)).await.unwrap_err();
    assert!(matches!(error, Error::Storage(_)));
    assert_eq!(service.get(&1).await, Some(player("alice", 10)));
}

#[tokio::test]
async fn test_get_many() {
    setup();
    let (service, storage) = service(MemoryStorage::new());
    storage.seed(1, player("alice", 1));
    storage.seed(2, player("bob", 2));
    storage.fail_on(3);

    let players = service.get_many([1, 2, 3, 4]).await;
    assert_eq!(players.len(), 4);
    assert_eq!(players[&1], Some(player("alice", 1)));
    assert_eq!(players[&2], Some(player("bob", 2)));
    assert_eq!(players[&3], None);
    assert_eq!(players[&4], None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handles() {
    setup();
    let (service, storage) = service(MemoryStorage::new());
    storage.seed(1, player("alice", 10));

    let handle = service.get_handle(1).unwrap();
    let outcome = tokio::task::spawn_blocking(move || handle.wait()).await.unwrap();
    assert_eq!(outcome.completed(), Some(Some(player("alice", 10))));

    let saved = service.save_handle(2, player("bob", 1)).unwrap();
    assert!(saved.outcome().await.is_completed());
    assert_eq!(storage.record(&2), Some(player("bob", 1)));

    let exists = service.exists_handle(2).unwrap();
    assert_eq!(exists.outcome().await.completed(), Some(true));

    let many = service.get_many_handle(vec![1, 2, 3]).unwrap();
    let players = many.outcome().await.completed().unwrap();
    assert_eq!(players[&1], Some(player("alice", 10)));
    assert_eq!(players[&2], Some(player("bob", 1)));
    assert_eq!(players[&3], None);

    let deleted = service.delete_handle(2).unwrap();
    assert!(deleted.outcome().await.is_completed());
    assert_eq!(storage.record(&2), None);

    storage.fail_on(3);
    let failed = service.get_handle(3).unwrap();
    match failed.outcome().await {
        stockpile_service::Outcome::Failed(cause) => {
            assert_eq!(cause.to_string(), "storage unavailable")
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_cancelled_handle_leaves_fetch_running() {
    setup();
    let storage = MemoryStorage::new().with_latency(Duration::from_millis(50));
    let (service, storage) = service(storage);
    storage.seed(1, player("alice", 10));

    let cancelled = service.get_handle(1).unwrap();
    let patient = service.get_handle(1).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(cancelled.cancel());
    assert!(cancelled.outcome().await.is_cancelled());

    // the shared read keeps going for the other waiter
    let outcome = patient.outcome().await;
    assert_eq!(outcome.completed(), Some(Some(player("alice", 10))));
    assert_eq!(storage.reads(), 1);
}

/// Answers reads with the record as it was when the read started, `delay` later.
/// Writes apply at once.
struct SnapshotReads {
    records: MemoryStorage<u32, Player>,
    delay: Duration,
}

impl Storage<u32, Player> for SnapshotReads {
    fn get<'a>(&'a self, key: &'a u32) -> BoxFuture<'a, anyhow::Result<Option<Player>>> {
        let snapshot = self.records.record(key);
        async move {
            tokio::time::sleep(self.delay).await;
            Ok(snapshot)
        }
        .boxed()
    }

    fn put(&self, key: u32, value: Player) -> BoxFuture<'_, anyhow::Result<()>> {
        self.records.put(key, value)
    }

    fn delete<'a>(&'a self, key: &'a u32) -> BoxFuture<'a, anyhow::Result<()>> {
        self.records.delete(key)
    }
}

fn snapshot_service() -> Arc<RecordService<u32, Player, SnapshotReads>> {
    let storage = SnapshotReads {
        records: MemoryStorage::new(),
        delay: Duration::from_millis(50),
    };
    storage.records.seed(1, player("alice", 10));
    let service = RecordService::new(
        &CacheSettings::named("players"),
        Arc::new(storage),
        ready_scope(),
    );
    Arc::new(service)
}

#[tokio::test]
async fn test_save_during_read_wins() {
    setup();
    let service = snapshot_service();

    let early = tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.get(&1).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    service.save(1, player("alice", 20)).await.unwrap();

    // the read started before the save and must not bring back the old record
    assert_eq!(early.await.unwrap(), Some(player("alice", 20)));
    assert_eq!(service.get(&1).await, Some(player("alice", 20)));
    assert_eq!(service.fetch(&1).await.unwrap(), Some(player("alice", 20)));
}

#[tokio::test]
async fn test_delete_during_read_stays_deleted() {
    setup();
    let service = snapshot_service();

    let get = tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.get(&1).await }
    });
    let fetch = tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.fetch(&1).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    service.delete(&1).await.unwrap();

    // misses the cache and joins the read that started before the delete
    let late = tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.get(&1).await }
    });

    assert_eq!(get.await.unwrap(), None);
    assert_eq!(late.await.unwrap(), None);
    assert_eq!(fetch.await.unwrap().unwrap(), None);
    assert_eq!(service.get(&1).await, None);
    assert!(!service.exists(&1).await.unwrap());
}
