//! Tests for `src/supervisor/mod.rs`: registry upsert, application GC,
//! container GC and shutdown.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use fleet_agent::engine::EngineError;
use fleet_agent::supervisor::Supervisor;

use super::support::{
    application, bundle, deps, eventually, fast_config, manual_config, release, service,
    FakeFactory, FixedPolicy, MockEngine, RecordingSink,
};

fn supervisor_with(engine: Arc<MockEngine>, factory: Arc<FakeFactory>, concurrency: usize) -> Supervisor {
    Supervisor::with_factory(
        deps(engine, RecordingSink::new(), FixedPolicy::default()),
        manual_config(concurrency),
        factory,
    )
}

// ---------------------------------------------------------------------------
// set
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_set_reuses_the_application_supervisor() {
    let factory = FakeFactory::new();
    let supervisor = supervisor_with(MockEngine::new(), Arc::clone(&factory), 4);

    let first = [application("a", Some(release("r1", vec![("web", service("nginx"))])))];
    supervisor.set(&bundle(&first), &first);
    let second = [application("a", Some(release("r2", vec![("web", service("nginx"))])))];
    supervisor.set(&bundle(&second), &second);

    assert_eq!(factory.created_count("a"), 1);
    let app = factory.latest("a");
    assert_eq!(app.set_calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        app.last_release.lock().expect("release lock").as_deref(),
        Some("r2")
    );
    assert_eq!(supervisor.application_ids(), vec!["a"]);
    assert_eq!(supervisor.desired_application_ids(), vec!["a"]);
}

#[tokio::test]
async fn set_replaces_the_desired_set_wholesale() {
    let factory = FakeFactory::new();
    let supervisor = supervisor_with(MockEngine::new(), Arc::clone(&factory), 4);

    let both = [application("a", None), application("b", None)];
    supervisor.set(&bundle(&both), &both);
    let only_b = [application("b", None)];
    supervisor.set(&bundle(&only_b), &only_b);

    assert_eq!(supervisor.desired_application_ids(), vec!["b"]);
    // Undesired supervisors linger until the next GC cycle.
    assert_eq!(supervisor.application_ids(), vec!["a", "b"]);
}

#[test]
fn set_outside_a_runtime_records_state_without_loops() {
    let factory = FakeFactory::new();
    let supervisor = supervisor_with(MockEngine::new(), Arc::clone(&factory), 4);

    let apps = [application("a", None)];
    supervisor.set(&bundle(&apps), &apps);

    assert!(!supervisor.is_started());
    assert_eq!(supervisor.application_ids(), vec!["a"]);
}

// ---------------------------------------------------------------------------
// Application GC
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dangling_application_is_stopped_then_forgotten() {
    let factory = FakeFactory::new();
    let supervisor = supervisor_with(MockEngine::new(), Arc::clone(&factory), 4);

    let both = [application("a", None), application("b", None)];
    supervisor.set(&bundle(&both), &both);
    let only_b = [application("b", None)];
    supervisor.set(&bundle(&only_b), &only_b);

    let collected = supervisor.collect_dangling_applications().await;

    assert_eq!(collected, vec!["a"]);
    assert_eq!(factory.latest("a").stop_calls.load(Ordering::SeqCst), 1);
    assert_eq!(factory.latest("b").stop_calls.load(Ordering::SeqCst), 0);
    assert_eq!(supervisor.application_ids(), vec!["b"]);
}

#[tokio::test]
async fn converged_registry_collects_nothing() {
    let factory = FakeFactory::new();
    let supervisor = supervisor_with(MockEngine::new(), Arc::clone(&factory), 4);

    let apps = [application("a", None)];
    supervisor.set(&bundle(&apps), &apps);

    assert!(supervisor.collect_dangling_applications().await.is_empty());
    assert_eq!(factory.latest("a").stop_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn redesired_application_gets_a_fresh_supervisor() {
    let factory = FakeFactory::new();
    let supervisor = supervisor_with(MockEngine::new(), Arc::clone(&factory), 4);

    let apps = [application("a", None)];
    supervisor.set(&bundle(&apps), &apps);
    supervisor.set(&bundle(&[]), &[]);
    supervisor.collect_dangling_applications().await;
    supervisor.set(&bundle(&apps), &apps);

    assert_eq!(factory.created_count("a"), 2);
    assert_eq!(supervisor.application_ids(), vec!["a"]);
}

#[tokio::test]
async fn application_desired_again_during_stop_keeps_a_supervisor() {
    let engine = MockEngine::new();
    engine.add_container("a-1", "a", true);
    let factory = FakeFactory::with_stop_delay(Duration::from_millis(200));
    let supervisor = Arc::new(supervisor_with(Arc::clone(&engine), Arc::clone(&factory), 4));

    let apps = [application("a", Some(release("r1", vec![("web", service("nginx"))])))];
    supervisor.set(&bundle(&apps), &apps);
    let stale = factory.latest("a");
    supervisor.set(&bundle(&[]), &[]);

    let gc = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.collect_dangling_applications().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    // Desired again while the old supervisor is still stopping.
    supervisor.set(&bundle(&apps), &apps);

    let collected = gc.await.expect("gc task should not panic");
    assert!(collected.is_empty());
    assert_eq!(stale.stop_calls.load(Ordering::SeqCst), 1);

    assert_eq!(supervisor.application_ids(), vec!["a"]);
    assert_eq!(factory.created_count("a"), 2);
    let fresh = factory.latest("a");
    assert_eq!(fresh.set_calls.load(Ordering::SeqCst), 1);
    assert_eq!(fresh.stop_calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        fresh.last_release.lock().expect("release lock").as_deref(),
        Some("r1")
    );

    let removed = supervisor
        .collect_orphaned_containers()
        .await
        .expect("listing should succeed");
    assert!(removed.is_empty());
    assert_eq!(engine.container_ids(), vec!["a-1"]);
}

#[tokio::test]
async fn concurrent_cycles_forget_a_supervisor_once() {
    let factory = FakeFactory::with_stop_delay(Duration::from_millis(200));
    let supervisor = Arc::new(supervisor_with(MockEngine::new(), Arc::clone(&factory), 4));

    let apps = [application("a", None)];
    supervisor.set(&bundle(&apps), &apps);
    supervisor.set(&bundle(&[]), &[]);

    let first = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.collect_dangling_applications().await })
    };
    let second = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.collect_dangling_applications().await })
    };

    let mut collected = first.await.expect("gc task should not panic");
    collected.extend(second.await.expect("gc task should not panic"));

    // Both cycles stopped the same instance; only one removes it.
    assert_eq!(collected, vec!["a"]);
    assert_eq!(factory.created_count("a"), 1);
    assert!(supervisor.application_ids().is_empty());
}

// ---------------------------------------------------------------------------
// Container GC
// ---------------------------------------------------------------------------

#[tokio::test]
async fn orphaned_containers_are_reclaimed() {
    let engine = MockEngine::new();
    engine.add_container("a-1", "a", true);
    engine.add_container("b-1", "b", true);
    engine.add_container("c-1", "c", false);
    engine.add_labelled("unmanaged", &[("com.example.owner", "ops")], true);

    let supervisor = supervisor_with(Arc::clone(&engine), FakeFactory::new(), 4);
    let apps = [application("a", None)];
    supervisor.set(&bundle(&apps), &apps);

    let mut removed = supervisor
        .collect_orphaned_containers()
        .await
        .expect("listing should succeed");
    removed.sort();

    assert_eq!(removed, vec!["b-1", "c-1"]);
    assert_eq!(engine.container_ids(), vec!["a-1", "unmanaged"]);
    let stopped = engine.stopped();
    assert!(!stopped.contains(&"a-1".to_owned()));
    assert!(stopped.contains(&"b-1".to_owned()));
}

#[tokio::test]
async fn containers_of_undesired_but_live_applications_survive() {
    let engine = MockEngine::new();
    engine.add_container("a-1", "a", true);

    let supervisor = supervisor_with(Arc::clone(&engine), FakeFactory::new(), 4);
    let apps = [application("a", None)];
    supervisor.set(&bundle(&apps), &apps);
    supervisor.set(&bundle(&[]), &[]);

    // "a" is no longer desired but its supervisor has not been collected yet.
    let removed = supervisor
        .collect_orphaned_containers()
        .await
        .expect("listing should succeed");
    assert!(removed.is_empty());

    supervisor.collect_dangling_applications().await;
    let removed = supervisor
        .collect_orphaned_containers()
        .await
        .expect("listing should succeed");
    assert_eq!(removed, vec!["a-1"]);
}

#[tokio::test]
async fn list_failure_skips_the_cycle() {
    let engine = MockEngine::new();
    engine.add_container("b-1", "b", true);
    engine.fail_list.store(true, Ordering::SeqCst);

    let supervisor = supervisor_with(Arc::clone(&engine), FakeFactory::new(), 4);

    let result = supervisor.collect_orphaned_containers().await;
    assert!(matches!(result, Err(EngineError::Api(_))));
    assert!(engine.stopped().is_empty());
    assert_eq!(engine.container_ids(), vec!["b-1"]);
}

#[tokio::test]
async fn container_gc_respects_the_concurrency_cap() {
    let engine = MockEngine::with_delay(Duration::from_millis(20));
    for n in 0..8 {
        engine.add_container(&format!("orphan-{n}"), "gone", true);
    }

    let supervisor = supervisor_with(Arc::clone(&engine), FakeFactory::new(), 2);
    let removed = supervisor
        .collect_orphaned_containers()
        .await
        .expect("listing should succeed");

    assert_eq!(removed.len(), 8);
    assert!(engine.container_ids().is_empty());
    assert!(engine.max_in_flight() <= 2, "cap exceeded: {}", engine.max_in_flight());
    assert!(engine.max_in_flight() >= 1);
}

// ---------------------------------------------------------------------------
// Background loops and shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn background_loops_converge_on_their_own() {
    let engine = MockEngine::new();
    engine.add_container("a-1", "a", true);
    engine.add_container("stray-1", "stray", true);
    let factory = FakeFactory::new();

    let supervisor = Supervisor::with_factory(
        deps(Arc::clone(&engine), RecordingSink::new(), FixedPolicy::default()),
        fast_config(),
        factory.clone(),
    );

    let apps = [application("a", None)];
    supervisor.set(&bundle(&apps), &apps);
    assert!(supervisor.is_started());

    assert!(
        eventually(|| engine.container_ids() == vec!["a-1".to_owned()]).await,
        "stray container should be reclaimed"
    );

    supervisor.set(&bundle(&[]), &[]);
    assert!(
        eventually(|| supervisor.application_ids().is_empty()).await,
        "undesired application should be collected"
    );
    assert_eq!(factory.latest("a").stop_calls.load(Ordering::SeqCst), 1);
    assert!(
        eventually(|| engine.container_ids().is_empty()).await,
        "containers of the collected application should be reclaimed"
    );

    supervisor.shutdown();
    tokio::time::timeout(Duration::from_secs(2), supervisor.join())
        .await
        .expect("loops should exit after shutdown");
}

#[tokio::test]
async fn shutdown_stops_both_loops() {
    let engine = MockEngine::new();
    let supervisor = Supervisor::with_factory(
        deps(Arc::clone(&engine), RecordingSink::new(), FixedPolicy::default()),
        fast_config(),
        FakeFactory::new(),
    );
    let apps = [application("a", None)];
    supervisor.set(&bundle(&apps), &apps);

    supervisor.shutdown();
    supervisor.shutdown();
    tokio::time::timeout(Duration::from_secs(2), supervisor.join())
        .await
        .expect("loops should exit after shutdown");

    engine.add_container("late-orphan", "gone", true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.container_ids(), vec!["late-orphan"]);
}

#[tokio::test]
async fn shutdown_aborts_in_flight_engine_calls() {
    let engine = MockEngine::with_delay(Duration::from_secs(30));
    engine.add_container("orphan", "gone", true);
    let supervisor = Arc::new(supervisor_with(Arc::clone(&engine), FakeFactory::new(), 1));

    let gc = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.collect_orphaned_containers().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    supervisor.shutdown();

    let removed = tokio::time::timeout(Duration::from_secs(2), gc)
        .await
        .expect("cycle should end promptly after shutdown")
        .expect("gc task should not panic")
        .expect("listing should succeed");
    assert!(removed.is_empty());
    assert_eq!(engine.container_ids(), vec!["orphan"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_sets_start_the_loops_once() {
    let factory = FakeFactory::new();
    let supervisor = Arc::new(Supervisor::with_factory(
        deps(MockEngine::new(), RecordingSink::new(), FixedPolicy::default()),
        manual_config(4),
        factory.clone(),
    ));

    let mut callers = tokio::task::JoinSet::new();
    for _ in 0..16 {
        let supervisor = Arc::clone(&supervisor);
        callers.spawn(async move {
            let apps = [application("a", None)];
            supervisor.set(&bundle(&apps), &apps);
        });
    }
    while let Some(joined) = callers.join_next().await {
        joined.expect("set caller should not panic");
    }

    assert!(supervisor.is_started());
    assert_eq!(supervisor.loop_count(), 2);
    assert_eq!(factory.created_count("a"), 1);
    assert_eq!(factory.latest("a").set_calls.load(Ordering::SeqCst), 16);

    supervisor.shutdown();
    tokio::time::timeout(Duration::from_secs(2), supervisor.join())
        .await
        .expect("loops should exit after shutdown");
    assert_eq!(supervisor.loop_count(), 0);
}

#[tokio::test]
async fn zero_gc_interval_still_runs_the_loops() {
    let engine = MockEngine::new();
    engine.add_container("stray-1", "stray", true);
    let mut config = fast_config();
    config.gc_interval_ms = 0;
    let supervisor = Supervisor::with_factory(
        deps(Arc::clone(&engine), RecordingSink::new(), FixedPolicy::default()),
        config,
        FakeFactory::new(),
    );

    let apps = [application("a", None)];
    supervisor.set(&bundle(&apps), &apps);
    assert!(
        eventually(|| engine.container_ids().is_empty()).await,
        "container gc should run with a zero interval"
    );

    supervisor.shutdown();
    tokio::time::timeout(Duration::from_secs(2), supervisor.join())
        .await
        .expect("loops should exit after shutdown");
}

#[tokio::test]
async fn set_after_shutdown_does_not_start_loops() {
    let supervisor = supervisor_with(MockEngine::new(), FakeFactory::new(), 4);
    supervisor.shutdown();

    let apps = [application("a", None)];
    supervisor.set(&bundle(&apps), &apps);

    assert!(!supervisor.is_started());
    assert_eq!(supervisor.application_ids(), vec!["a"]);
}
