//! Leader election, relaying, and failover across contexts of one origin.

use std::time::{Duration, Instant};

use strata_kernel::config::{StorageMode, StrataConfig};
use strata_kernel::coord::{ContextHandle, Origin, Role};
use strata_kernel::protocol::SyncClient;
use strata_types::{CallError, Op, Reply};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

const READY: Duration = Duration::from_secs(10);

fn config(dir: &TempDir) -> StrataConfig {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let mut config = StrataConfig::default();
    config.store.container = dir.path().join("origin.bin");
    config.coordinator.origin = "test".into();
    config.coordinator.leader_timeout_ms = 5_000;
    config.protocol.call_timeout_ms = Some(15_000);
    config.protocol.executor_poll_ms = 5;
    config
}

/// Run a blocking call off the runtime.
async fn call(client: &SyncClient, op: Op) -> Result<Reply, CallError> {
    let client = client.clone();
    tokio::task::spawn_blocking(move || client.call(op)).await.unwrap()
}

/// Poll `check` until it holds or the deadline passes.
async fn eventually(what: &str, check: impl Fn() -> bool) {
    let start = Instant::now();
    while !check() {
        assert!(start.elapsed() < READY, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn spawn_ready(origin: &Origin, n: usize) -> Vec<ContextHandle> {
    let contexts: Vec<_> = (0..n).map(|_| origin.spawn_context().unwrap()).collect();
    for context in &contexts {
        context.wait_ready(READY).await.unwrap();
    }
    contexts
}

fn primaries(contexts: &[ContextHandle]) -> Vec<usize> {
    contexts
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_primary())
        .map(|(i, _)| i)
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exactly_one_primary_and_secondaries_relay() {
    let dir = TempDir::new().unwrap();
    let origin = Origin::new(config(&dir));
    let contexts = spawn_ready(&origin, 3).await;

    let leaders = primaries(&contexts);
    assert_eq!(leaders.len(), 1);
    let primary = &contexts[leaders[0]];
    for context in contexts.iter().filter(|c| !c.is_primary()) {
        assert_eq!(context.role(), Role::Secondary { primary: primary.id() });
    }

    let secondary = contexts.iter().find(|c| !c.is_primary()).unwrap();
    call(secondary.client(), Op::mkdir("/shared", false)).await.unwrap();
    call(secondary.client(), Op::write("/shared/note", b"via relay".to_vec()))
        .await
        .unwrap();
    let read = call(primary.client(), Op::read("/shared/note")).await.unwrap();
    assert_eq!(read, Reply::Bytes(b"via relay".to_vec()));

    let err = call(secondary.client(), Op::read("/nope")).await.unwrap_err();
    assert_eq!(err.syscall, "read");
    assert_eq!(err.path.as_deref(), Some("/nope"));

    let others: Vec<_> = contexts.iter().filter(|c| !c.is_primary()).map(|c| c.id()).collect();
    eventually("primary to learn every peer", || {
        let peers = primary.peers();
        others.iter().all(|id| peers.contains(id))
    })
    .await;
    let record = primary.record();
    assert_eq!(record.role, Role::Primary);
    assert_eq!(record.lock_id, primary.id().lock_name());

    for context in contexts {
        context.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failover_promotes_exactly_one_and_keeps_data() {
    let dir = TempDir::new().unwrap();
    let origin = Origin::new(config(&dir));
    let mut contexts = spawn_ready(&origin, 3).await;

    let leader = primaries(&contexts)[0];
    let old = contexts.remove(leader);
    let old_id = old.id();
    call(old.client(), Op::write("/before", b"durable".to_vec())).await.unwrap();
    old.shutdown().await;

    eventually("a new primary", || primaries(&contexts).len() == 1).await;
    let new_leader = primaries(&contexts)[0];
    let new_id = contexts[new_leader].id();
    assert_ne!(new_id, old_id);
    eventually("the survivor to follow the new primary", || {
        contexts
            .iter()
            .filter(|c| !c.is_primary())
            .all(|c| c.role() == Role::Secondary { primary: new_id })
    })
    .await;
    assert_eq!(primaries(&contexts).len(), 1);

    let survivor = contexts.iter().find(|c| !c.is_primary()).unwrap();
    let read = call(survivor.client(), Op::read("/before")).await.unwrap();
    assert_eq!(read, Reply::Bytes(b"durable".to_vec()));
    call(survivor.client(), Op::write("/after", b"still relayed".to_vec()))
        .await
        .unwrap();

    eventually("the departure to be noticed", || {
        contexts.iter().all(|c| !c.peers().contains(&old_id))
    })
    .await;

    for context in contexts {
        context.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_late_context_joins_running_primary() {
    let dir = TempDir::new().unwrap();
    let origin = Origin::new(config(&dir));
    let first = spawn_ready(&origin, 1).await.remove(0);
    assert_eq!(first.role(), Role::Primary);
    call(first.client(), Op::write("/early", b"1".to_vec())).await.unwrap();

    let late = origin.spawn_context().unwrap();
    let role = late.wait_ready(READY).await.unwrap();
    assert_eq!(role, Role::Secondary { primary: first.id() });
    let read = call(late.client(), Op::read("/early")).await.unwrap();
    assert_eq!(read, Reply::Bytes(b"1".to_vec()));

    let dump = {
        let client = late.client().clone();
        tokio::task::spawn_blocking(move || client.request_path_dump(READY))
            .await
            .unwrap()
            .unwrap()
    };
    assert_eq!(dump, "/early");

    late.shutdown().await;
    first.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hybrid_primary_mirrors_to_host() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    let native = dir.path().join("mirror");
    config.store.mode = StorageMode::Hybrid;
    config.store.native_root = Some(native.clone());
    config.sync.debounce_ms = 10;
    config.sync.max_delay_ms = 50;

    let origin = Origin::new(config);
    let context = spawn_ready(&origin, 1).await.remove(0);
    call(context.client(), Op::mkdir("/docs", false)).await.unwrap();
    call(context.client(), Op::write("/docs/readme", b"mirrored".to_vec()))
        .await
        .unwrap();

    let host = native.join("docs").join("readme");
    eventually("the write-behind mirror", || {
        std::fs::read(&host).map(|b| b == b"mirrored").unwrap_or(false)
    })
    .await;

    context.shutdown().await;
}
