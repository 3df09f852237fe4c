use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use refcache::{CacheConfig, EntryScope, KeyedCache};
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{
    PreparedWorkload, ResourceCache, ResourceKey, WorkloadsConfig, create_resource,
    process_operation,
};

pub async fn perform_stresstest(
    cache_config: &CacheConfig,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let factory_calls = Arc::new(AtomicUsize::new(0));
    let cache: ResourceCache = {
        let factory_calls = Arc::clone(&factory_calls);
        KeyedCache::builder(move |scope: &EntryScope, key: &ResourceKey| {
            factory_calls.fetch_add(1, Ordering::Relaxed);
            create_resource(scope, key)
        })
        .name("stresstest")
        .config(cache_config)
        .build()
    };

    // initialize workloads
    let workloads: Vec<_> = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| Arc::new(PreparedWorkload::new(i, workload)))
        .collect();

    // warmup: run each workload once to make sure the cache is populated
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|workload| {
            let cache = cache.clone();
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                process_operation(&cache, &workload).await;
            })
        });

        for result in futures::future::join_all(futures).await {
            result.context("warmup operation panicked")?;
        }

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for workload in workloads.into_iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let cache = cache.clone();

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency;
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let cache = cache.clone();
                        let task_durations = Arc::clone(&task_durations);
                        let task_start = Instant::now();

                        tokio::spawn(async move {
                            process_operation(&cache, &workload).await;

                            task_durations
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        });
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = {
                let mut task_durations = task_durations
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *task_durations)
            };

            (workload, task_durations)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for task in finished_tasks {
        let (workload, task_durations) = task.context("workload panicked")?;
        let i = workload.index;
        let concurrency = workload.concurrency;

        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");

        if ops == 0 {
            continue;
        }
        let quantile = |q| {
            let secs = task_durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    println!();
    println!(
        "Cache: {} entries ({} idle), {} resources created",
        cache.len(),
        cache.idle_count(),
        factory_calls.load(Ordering::Relaxed)
    );
    if let Some(error) = cache.policy_error() {
        println!("  eviction policy failed: {error}");
    }

    Ok(())
}
