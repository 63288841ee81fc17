use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use stockpile_service::Error;
use stockpile_service::config::ScopeConfig;
use stockpile_service::inflight::InFlight;
use stockpile_service::scope::TaskScope;
use stockpile_test::{ready_scope, setup};
use tokio::runtime::Handle;

#[tokio::test]
async fn test_one_failure_among_ten() {
    setup();
    let scope = ready_scope();

    let handles: Vec<_> = (1..=10)
        .map(|unit| {
            scope
                .spawn_with_result(&format!("unit-{unit}"), async move {
                    tokio::time::sleep(Duration::from_millis(unit)).await;
                    if unit == 5 {
                        panic!("unit {unit} failed");
                    }
                    unit * 10
                })
                .unwrap()
        })
        .collect();

    let mut completed = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(value) => completed.push(value),
            Err(error) => assert!(matches!(error, Error::Panicked { .. })),
        }
    }

    assert_eq!(completed, [10, 20, 30, 40, 60, 70, 80, 90, 100]);
    assert_eq!(scope.failure_count(), 1);
}

#[tokio::test]
async fn test_shutdown_with_running_fetches() {
    setup();
    let scope = ready_scope();
    let table = InFlight::<u32, u32>::new("players", Arc::clone(&scope));
    let loads = Arc::new(AtomicUsize::new(0));

    let fetches: Vec<_> = (0..3)
        .map(|key| {
            let loads = Arc::clone(&loads);
            table.fetch(key, move || async move {
                loads.fetch_add(1, Ordering::SeqCst);
                futures::future::pending::<()>().await;
                Ok::<_, anyhow::Error>(key)
            })
        })
        .collect();
    assert_eq!(table.len(), 3);

    scope.shutdown().await;

    for result in futures::future::join_all(fetches).await {
        assert!(matches!(result, Err(Error::Cancelled)));
    }
    assert!(table.is_empty());
    assert_eq!(scope.failure_count(), 0);
}

#[test]
fn test_blocking_shutdown_is_bounded() {
    setup();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    let scope = TaskScope::new(
        runtime.handle().clone(),
        ScopeConfig {
            shutdown_timeout: Duration::from_millis(100),
        },
    );
    scope.initialize();

    // ignores cancellation by never yielding
    scope
        .spawn("stuck", async {
            std::thread::sleep(Duration::from_millis(400));
            Ok(())
        })
        .unwrap();
    std::thread::sleep(Duration::from_millis(20));

    let start = Instant::now();
    scope.shutdown_blocking();
    assert!(start.elapsed() < Duration::from_millis(300));

    // a second shutdown returns right away
    let start = Instant::now();
    scope.shutdown_blocking();
    assert!(start.elapsed() < Duration::from_millis(50));

    runtime.shutdown_timeout(Duration::from_secs(1));
}

#[tokio::test]
async fn test_uninitialized_scope_rejects_work() {
    setup();
    let scope = Arc::new(TaskScope::new(Handle::current(), ScopeConfig::default()));
    let table = InFlight::<u32, u32>::new("players", Arc::clone(&scope));

    let result = table
        .fetch(1, || async { Ok::<_, anyhow::Error>(1) })
        .await;
    assert!(matches!(result, Err(Error::NotReady)));
    assert!(matches!(
        scope.spawn("early", async { Ok(()) }),
        Err(Error::NotReady)
    ));
}
