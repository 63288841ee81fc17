use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sketches_ddsketch::DDSketch;
use stockpile_service::config::Config;
use stockpile_service::scope::TaskScope;
use stockpile_service::services::RecordService;
use stockpile_test::MemoryStorage;
use tokio::sync::Semaphore;

use crate::workloads::{Workload, WorkloadsConfig};

#[derive(Clone, Debug)]
struct Record {
    revision: u64,
}

type Records = RecordService<u32, Record, MemoryStorage<u32, Record>>;

struct PreparedWorkload {
    workload: Workload,
    storage: Arc<MemoryStorage<u32, Record>>,
    service: Arc<Records>,
}

fn prepare_workload(
    config: &Config,
    scope: &Arc<TaskScope>,
    workload: Workload,
) -> PreparedWorkload {
    let storage = MemoryStorage::new()
        .with_latency(workload.latency)
        .with_failure_rate(workload.failure_rate);
    for key in 0..workload.keys {
        storage.seed(key, Record { revision: 0 });
    }
    let storage = Arc::new(storage);

    let settings = config.cache_settings(&workload.cache);
    let service = RecordService::new(&settings, Arc::clone(&storage), Arc::clone(scope));

    PreparedWorkload {
        workload,
        storage,
        service: Arc::new(service),
    }
}

async fn run_operation(service: &Records, workload: &Workload) {
    let key = rand::random_range(0..workload.keys.max(1));
    if rand::random::<f64>() < workload.write_ratio {
        let result = service
            .update(key, |record| Record {
                revision: record.revision + 1,
            })
            .await;
        if let Err(error) = result {
            tracing::debug!(key, "Update failed: {error}");
        }
    } else {
        service.get(&key).await;
    }
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let runtime = tokio::runtime::Handle::current();
    let scope = Arc::new(TaskScope::new(runtime, config.scope));
    scope.initialize();

    // initialize workloads
    let workloads: Vec<_> = workloads
        .workloads
        .into_iter()
        .map(|workload| Arc::new(prepare_workload(&config, &scope, workload)))
        .collect();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for prepared in workloads.iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let prepared = Arc::clone(prepared);

        let task = tokio::spawn(async move {
            let concurrency = prepared.workload.concurrency.max(1);
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let prepared = Arc::clone(&prepared);
                        let task_durations = Arc::clone(&task_durations);
                        let task_start = Instant::now();

                        tokio::spawn(async move {
                            run_operation(&prepared.service, &prepared.workload).await;

                            let elapsed = task_start.elapsed().as_secs_f64();
                            task_durations.lock().unwrap_or_else(|e| e.into_inner()).add(elapsed);

                            drop(permit);
                        });
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the permits, we wait for all outstanding operations to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = {
                let mut task_durations = task_durations.lock().unwrap_or_else(|e| e.into_inner());
                std::mem::take(&mut task_durations)
            };
            (concurrency, task_durations)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, (task, prepared)) in finished_tasks.into_iter().zip(&workloads).enumerate() {
        let (concurrency, task_durations) = task.context("workload task failed")?;

        let ops = task_durations.count();
        let ops_ps = ops as f64 / duration.as_secs_f64();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");

        if ops > 0 {
            let sum = task_durations.sum().unwrap_or_default();
            let avg = Duration::from_secs_f64(sum / ops as f64);
            let quantile = |q| {
                let seconds = task_durations.quantile(q).ok().flatten().unwrap_or_default();
                Duration::from_secs_f64(seconds)
            };
            let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
            println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
        }

        let stats = prepared.service.stats();
        println!(
            "  storage reads: {}; storage writes: {}; cache misses: {}",
            prepared.storage.reads(),
            prepared.storage.writes(),
            stats.miss_count,
        );
        println!("  {stats}");
        prepared.service.report_metrics();
    }

    scope.shutdown().await;
    if scope.failure_count() > 0 {
        println!("Uncaught task failures: {}", scope.failure_count());
    }

    Ok(())
}
