use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use sieve_core::{
    PoolState, RefillConfig, RefillOrchestrator, RemovalSets, StopReason, StreamingLoader,
    TaskPool, TaskPoolConfig, load_sources,
};

use crate::common::{
    CheckpointWriter, CountingExecutor, ScriptedLoader, drain_counter, records, write_file,
};

const LOW_WATER: usize = 20;

fn refill_config() -> RefillConfig {
    RefillConfig::for_concurrency(1, 1000)
        .with_low_water_mark(LOW_WATER)
        .with_start_delay(Duration::ZERO)
        .with_poll_interval(Duration::from_millis(1))
        .with_retry_delay(Duration::from_millis(5))
}

fn pool_config() -> TaskPoolConfig {
    TaskPoolConfig::default()
        .with_concurrency(1)
        .with_collection("accounts")
        .with_metrics_interval(Duration::from_millis(50))
}

fn orchestrator(
    loader: ScriptedLoader,
    config: RefillConfig,
) -> RefillOrchestrator<ScriptedLoader> {
    RefillOrchestrator::new(
        Arc::new(loader),
        vec![PathBuf::from("source.txt")],
        RemovalSets::new(),
        config,
    )
}

#[tokio::test]
async fn small_initial_chunk_never_refills() {
    let (drains, on_drain) = drain_counter();
    let executor = CountingExecutor::new(Duration::from_millis(1));
    let loader = ScriptedLoader::new(vec![Ok(records(100..200))], executor.completed_counter());

    let mut pool: TaskPool<(), CountingExecutor> = TaskPool::new(pool_config())
        .with_executor(executor.clone())
        .with_records("accounts", records(0..15))
        .on_drain(on_drain);
    let handle = pool.handle();

    let refill = orchestrator(loader.clone(), refill_config()).spawn(handle.clone(), 15);
    assert!(refill.is_none());

    pool.start().unwrap();
    handle.wait_drained().await;

    assert!(loader.observations().is_empty());
    assert_eq!(executor.completed(), 15);
    assert_eq!(drains.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn refill_waits_for_low_water_and_skips_pending_records() {
    let (drains, on_drain) = drain_counter();
    let executor = CountingExecutor::new(Duration::from_millis(20));
    // Overlaps the initial chunk on 10..25, which is still pending when the
    // refill runs.
    let loader = ScriptedLoader::new(vec![Ok(records(10..35))], executor.completed_counter());

    let mut pool: TaskPool<(), CountingExecutor> = TaskPool::new(pool_config())
        .with_executor(executor.clone())
        .with_records("accounts", records(0..25))
        .on_drain(on_drain);
    let handle = pool.handle();

    let refill = orchestrator(loader.clone(), refill_config())
        .spawn(handle.clone(), 25)
        .unwrap();

    pool.start().unwrap();
    handle.wait_drained().await;
    let summary = refill.await.unwrap();

    // The first load only happened once depth fell to the low-water mark.
    let observations = loader.observations();
    assert_eq!(observations.len(), 2);
    assert!(observations[0] >= 25 - LOW_WATER);

    assert_eq!(summary.rounds, 2);
    assert_eq!(summary.added, 10);
    assert_eq!(summary.stop, StopReason::NothingNew);

    for record in records(10..25).iter().chain(records(25..35).iter()) {
        assert_eq!(executor.runs_of(record), 1, "{record}");
    }
    assert_eq!(executor.total_runs(), 35);
    assert_eq!(drains.load(Ordering::SeqCst), 1);
    assert_eq!(handle.state(), PoolState::Drained);
}

#[tokio::test]
async fn short_refill_chunk_ends_the_loop() {
    let (_, on_drain) = drain_counter();
    let executor = CountingExecutor::new(Duration::from_millis(2));
    let loader = ScriptedLoader::new(
        vec![Ok(records(100..105)), Ok(records(200..300))],
        executor.completed_counter(),
    );

    let mut pool: TaskPool<(), CountingExecutor> = TaskPool::new(pool_config())
        .with_executor(executor.clone())
        .with_records("accounts", records(0..40))
        .on_drain(on_drain);
    let handle = pool.handle();
    let refill = orchestrator(loader.clone(), refill_config())
        .spawn(handle.clone(), 40)
        .unwrap();

    pool.start().unwrap();
    handle.wait_drained().await;
    let summary = refill.await.unwrap();

    assert_eq!(summary.rounds, 1);
    assert_eq!(summary.added, 5);
    assert_eq!(loader.observations().len(), 1);
    assert_eq!(executor.total_runs(), 45);
}

#[tokio::test]
async fn refill_errors_are_retried() {
    let (drains, on_drain) = drain_counter();
    let executor = CountingExecutor::new(Duration::from_millis(1));
    let loader = ScriptedLoader::new(
        vec![Err("disk hiccup".to_string()), Ok(records(100..130))],
        Arc::new(AtomicUsize::new(0)),
    );

    let mut pool: TaskPool<(), CountingExecutor> = TaskPool::new(pool_config())
        .with_executor(executor.clone())
        .with_records("accounts", records(0..25))
        .on_drain(on_drain);
    let handle = pool.handle();
    let refill = orchestrator(loader.clone(), refill_config())
        .spawn(handle.clone(), 25)
        .unwrap();

    pool.start().unwrap();
    handle.wait_drained().await;
    let summary = refill.await.unwrap();

    assert!(summary.rounds >= 1);
    assert_eq!(summary.added, 30);
    assert_eq!(executor.total_runs(), 55);
    assert_eq!(drains.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn persistent_refill_failures_release_the_pool() {
    let (drains, on_drain) = drain_counter();
    let executor = CountingExecutor::new(Duration::ZERO);
    let loader = ScriptedLoader::new(
        vec![Err("gone".to_string()), Err("gone".to_string())],
        Arc::new(AtomicUsize::new(0)),
    );
    let config = refill_config().with_max_failures(2);

    let mut pool: TaskPool<(), CountingExecutor> = TaskPool::new(pool_config())
        .with_executor(executor.clone())
        .with_records("accounts", records(0..25))
        .on_drain(on_drain);
    let handle = pool.handle();
    let refill = orchestrator(loader, config)
        .spawn(handle.clone(), 25)
        .unwrap();

    pool.start().unwrap();
    let summary = refill.await.unwrap();
    handle.wait_drained().await;

    assert_eq!(summary.stop, StopReason::Failed);
    assert_eq!(summary.rounds, 0);
    assert_eq!(executor.completed(), 25);
    assert_eq!(drains.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn checkpointed_records_are_not_reloaded() {
    let dir = tempfile::tempdir().unwrap();
    let lines: String = (0..40).map(|i| format!("user{i}@x.com:pass{i}\n")).collect();
    let source = write_file(dir.path(), "source.txt", &lines);
    let checkpoint = write_file(dir.path(), "checked.txt", "");
    let removal = RemovalSets::new().with_exact(&checkpoint);
    let sources = vec![source];

    let loader = Arc::new(StreamingLoader::new());
    let first = load_sources(loader.as_ref(), &sources, &removal, 30).await.unwrap();
    assert_eq!(first.len(), 30);

    let (drains, on_drain) = drain_counter();
    let executor = CheckpointWriter::new(&checkpoint, Duration::from_millis(1));
    let mut pool: TaskPool<(), CheckpointWriter> = TaskPool::new(pool_config())
        .with_executor(executor)
        .with_records("accounts", first)
        .on_drain(on_drain);
    let handle = pool.handle();

    let config = RefillConfig::for_concurrency(1, 30)
        .with_low_water_mark(LOW_WATER)
        .with_start_delay(Duration::ZERO)
        .with_poll_interval(Duration::from_millis(1))
        .with_retry_delay(Duration::from_millis(5));
    let refill = RefillOrchestrator::new(loader, sources, removal, config)
        .spawn(handle.clone(), 30)
        .unwrap();

    pool.start().unwrap();
    tokio::time::timeout(Duration::from_secs(10), handle.wait_drained())
        .await
        .expect("pool should drain once every source record is checkpointed");
    let summary = refill.await.unwrap();

    let written = std::fs::read_to_string(&checkpoint).unwrap();
    let lines: Vec<&str> = written.lines().collect();
    let unique: std::collections::HashSet<&str> = lines.iter().copied().collect();
    assert_eq!(lines.len(), 40);
    assert_eq!(unique.len(), 40);
    assert_eq!(summary.added, 10);
    assert_eq!(handle.metrics().get("checked"), 40);
    assert_eq!(drains.load(Ordering::SeqCst), 1);
}
