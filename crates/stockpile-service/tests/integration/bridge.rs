use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use stockpile_service::Outcome;
use stockpile_service::config::ScopeConfig;
use stockpile_service::dispatch::Dispatch;
use stockpile_service::scope::TaskScope;
use stockpile_test::setup;

/// Runs dispatched work on a dedicated thread, like a host with a main thread would.
struct MainThread {
    queue: mpsc::Sender<Box<dyn FnOnce() + Send>>,
}

impl Dispatch for MainThread {
    type Context = ();

    fn run_on(&self, _context: &(), work: Box<dyn FnOnce() + Send>) {
        self.queue.send(work).ok();
    }
}

#[test]
fn test_blocking_caller() {
    setup();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let scope = TaskScope::new(runtime.handle().clone(), ScopeConfig::default());
    scope.initialize();

    let handle = scope
        .to_completion_handle("slow", async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, anyhow::Error>("loaded")
        })
        .unwrap();

    assert!(!handle.is_done());
    assert!(handle.wait_timeout(Duration::from_millis(5)).is_none());
    assert_eq!(handle.wait().completed(), Some("loaded"));
    assert!(handle.is_done());

    scope.shutdown_blocking();
}

#[test]
fn test_callbacks_on_host_thread() {
    setup();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap();
    let scope = TaskScope::new(runtime.handle().clone(), ScopeConfig::default());
    scope.initialize();

    let (queue, jobs) = mpsc::channel::<Box<dyn FnOnce() + Send>>();
    let (results, received) = mpsc::channel();
    let host = thread::spawn(move || {
        for job in jobs {
            job();
        }
    });
    let host_id = host.thread().id();

    let handle = scope
        .to_completion_handle("lookup", async { Ok::<_, anyhow::Error>(5) })
        .unwrap();
    handle.on_complete_on(Arc::new(MainThread { queue }), (), move |outcome| {
        results
            .send((thread::current().id(), outcome.completed()))
            .unwrap();
    });

    let (ran_on, value) = received.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(ran_on, host_id);
    assert_eq!(value, Some(5));

    scope.shutdown_blocking();
    drop(handle);
    host.join().unwrap();
}

#[tokio::test]
async fn test_outcomes_are_exclusive() {
    setup();
    let scope = stockpile_test::ready_scope();

    let completed = scope
        .to_completion_handle("ok", async { Ok::<u32, anyhow::Error>(1) })
        .unwrap();
    let failed = scope
        .to_completion_handle("err", async { Err::<u32, _>(anyhow::anyhow!("broken")) })
        .unwrap();
    let cancelled = scope
        .to_completion_handle("cancel", async {
            futures::future::pending::<()>().await;
            Ok::<u32, anyhow::Error>(1)
        })
        .unwrap();
    cancelled.cancel();

    let outcomes = [
        completed.outcome().await,
        failed.outcome().await,
        cancelled.outcome().await,
    ];
    for (outcome, expected) in outcomes.iter().zip(["completed", "failed", "cancelled"]) {
        let states = [
            outcome.is_completed(),
            outcome.is_failed(),
            outcome.is_cancelled(),
        ];
        assert_eq!(states.iter().filter(|state| **state).count(), 1);
        let actual = match outcome {
            Outcome::Completed(_) => "completed",
            Outcome::Failed(_) => "failed",
            Outcome::Cancelled => "cancelled",
        };
        assert_eq!(actual, expected);
    }
}
