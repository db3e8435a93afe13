//! Integration tests for the processor host.
//!
//! Covers routing across resources, successor generations, parked state and
//! its eviction, shutdown, and resuming from residual stores.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use event_serializer_core::applier::EventApplier;
use event_serializer_core::stream::{ResourceId, SequenceId};
use event_serializer_runtime::{
    ConfigError, HostHandle, ProcessorConfig, ProcessorError, ProcessorHost,
};
use event_serializer_testing::{RecordingApplier, event, init_tracing};
use std::sync::Arc;
use std::time::Duration;

fn spawn_host(applier: &RecordingApplier, config: ProcessorConfig) -> HostHandle<String> {
    let applier: Arc<dyn EventApplier<String>> = Arc::new(applier.clone());
    ProcessorHost::spawn(applier, config).unwrap()
}

async fn deliver_all(host: &HostHandle<String>, resource: &ResourceId, ids: &[u64]) {
    for &id in ids {
        host.deliver(resource.clone(), event(id)).await.unwrap();
    }
}

#[tokio::test]
async fn resources_are_ordered_independently() {
    init_tracing();
    let applier = RecordingApplier::new();
    let host = spawn_host(&applier, ProcessorConfig::default());
    let alpha = ResourceId::new("alpha");
    let beta = ResourceId::new("beta");

    for (a, b) in [(3, 2), (1, 1), (2, 4), (4, 3)] {
        host.deliver(alpha.clone(), event(a)).await.unwrap();
        host.deliver(beta.clone(), event(b)).await.unwrap();
    }

    let residual = host.shutdown().await.unwrap();

    assert_eq!(applier.applied_for(&alpha), vec![1, 2, 3, 4]);
    assert_eq!(applier.applied_for(&beta), vec![1, 2, 3, 4]);
    assert_eq!(residual.len(), 2);
    for store in residual.values() {
        assert_eq!(store.last_applied(), SequenceId::new(4));
        assert!(!store.has_pending());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_with_redelivery() {
    let applier = RecordingApplier::new();
    let host = spawn_host(
        &applier,
        ProcessorConfig::default().with_max_events_per_generation(5),
    );
    let resources: Vec<ResourceId> = (0..8)
        .map(|n| ResourceId::new(format!("account-{n}")))
        .collect();

    // Two producers per resource, each delivering every id once
    let producers = resources.iter().flat_map(|resource| {
        [false, true].map(|reversed| {
            let host = host.clone();
            let resource = resource.clone();
            async move {
                let ids: Vec<u64> = if reversed {
                    (1..=40).rev().collect()
                } else {
                    (1..=40).collect()
                };
                for id in ids {
                    tokio_test::assert_ok!(host.deliver(resource.clone(), event(id)).await);
                }
            }
        })
    });
    futures::future::join_all(producers).await;

    let residual = host.shutdown().await.unwrap();

    for resource in &resources {
        assert_eq!(applier.applied_for(resource), (1..=40).collect::<Vec<_>>());
        assert_eq!(residual[resource].last_applied(), SequenceId::new(40));
    }
}

#[tokio::test]
async fn successor_generation_inherits_pending_events() {
    let applier = RecordingApplier::new();
    // Every second delivery retires the generation
    let host = spawn_host(
        &applier,
        ProcessorConfig::default().with_max_events_per_generation(2),
    );
    let resource = ResourceId::new("account-1");

    deliver_all(&host, &resource, &[1, 3, 5, 2, 4, 6]).await;

    let residual = host.shutdown().await.unwrap();

    assert_eq!(applier.applied_for(&resource), vec![1, 2, 3, 4, 5, 6]);
    let store = &residual[&resource];
    assert_eq!(store.last_applied(), SequenceId::new(6));
    assert!(!store.has_pending());
}

#[tokio::test]
async fn retired_resource_still_rejects_old_duplicates() {
    let applier = RecordingApplier::new();
    let host = spawn_host(&applier, ProcessorConfig::default());
    let resource = ResourceId::new("account-1");

    deliver_all(&host, &resource, &[1, 2]).await;
    host.retire(resource.clone()).await.unwrap();
    deliver_all(&host, &resource, &[1, 2, 3]).await;

    host.shutdown().await.unwrap();

    assert_eq!(applier.applied_for(&resource), vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn events_rejected_while_draining_go_to_successor() {
    let applier = RecordingApplier::new().with_delay(Duration::from_millis(100));
    // Generation 1 retires as soon as it has applied one event
    let host = spawn_host(
        &applier,
        ProcessorConfig::default().with_max_events_per_generation(1),
    );
    let resource = ResourceId::new("account-1");

    deliver_all(&host, &resource, &[1]).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    // Still accepted: generation 1 is busy applying 1
    deliver_all(&host, &resource, &[2]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    // Generation 1 is now draining 2, so these are held for its successor
    deliver_all(&host, &resource, &[4, 3]).await;
    assert_eq!(applier.applied_for(&resource), vec![1]);

    let residual = host.shutdown().await.unwrap();

    assert_eq!(applier.applied_for(&resource), vec![1, 2, 3, 4]);
    assert_eq!(residual[&resource].last_applied(), SequenceId::new(4));
    assert!(!residual[&resource].has_pending());
}

#[tokio::test]
async fn deliveries_queued_behind_shutdown_are_applied() {
    let applier = RecordingApplier::new();
    let host = spawn_host(&applier, ProcessorConfig::default());
    let resource = ResourceId::new("account-1");

    // The shutdown request is queued first, the deliveries right behind it
    let (residual, ()) = tokio::join!(host.shutdown(), deliver_all(&host, &resource, &[2, 1, 3]));
    let residual = residual.unwrap();

    assert_eq!(applier.applied_for(&resource), vec![1, 2, 3]);
    assert_eq!(residual[&resource].last_applied(), SequenceId::new(3));
}

#[tokio::test]
async fn evicted_resource_starts_over() {
    let applier = RecordingApplier::new();
    let host = spawn_host(&applier, ProcessorConfig::default());
    let resource = ResourceId::new("account-1");

    deliver_all(&host, &resource, &[1, 2]).await;
    host.retire(resource.clone()).await.unwrap();
    let evicted = loop {
        if let Some(store) = host.evict(resource.clone()).await.unwrap() {
            break store;
        }
        tokio::task::yield_now().await;
    };
    assert_eq!(evicted.last_applied(), SequenceId::new(2));

    let residual = host.shutdown().await.unwrap();
    assert!(residual.is_empty());
}

#[tokio::test]
async fn active_resource_is_not_evicted() {
    let applier = RecordingApplier::new();
    let host = spawn_host(&applier, ProcessorConfig::default());
    let resource = ResourceId::new("account-1");

    deliver_all(&host, &resource, &[2]).await;
    assert!(host.evict(resource.clone()).await.unwrap().is_none());
    assert!(host.evict(ResourceId::new("nobody")).await.unwrap().is_none());
    deliver_all(&host, &resource, &[1]).await;

    let residual = host.shutdown().await.unwrap();

    assert_eq!(applier.applied_for(&resource), vec![1, 2]);
    assert_eq!(residual[&resource].last_applied(), SequenceId::new(2));
}

#[tokio::test]
async fn retire_of_unknown_resource_is_a_no_op() {
    let applier = RecordingApplier::new();
    let host = spawn_host(&applier, ProcessorConfig::default());

    host.retire(ResourceId::new("nobody")).await.unwrap();

    let residual = host.shutdown().await.unwrap();
    assert!(residual.is_empty());
}

#[tokio::test]
async fn shutdown_returns_unfilled_gaps() {
    let applier = RecordingApplier::new();
    let host = spawn_host(&applier, ProcessorConfig::default());
    let resource = ResourceId::new("account-1");

    deliver_all(&host, &resource, &[2, 3]).await;

    let residual = host.shutdown().await.unwrap();

    assert!(applier.is_empty());
    let store = &residual[&resource];
    assert!(store.last_applied().is_initial());
    assert_eq!(
        store.pending_ids().collect::<Vec<_>>(),
        vec![SequenceId::new(2), SequenceId::new(3)]
    );
}

#[tokio::test]
async fn new_host_resumes_from_residual_state() {
    let applier = RecordingApplier::new();
    let resource = ResourceId::new("account-1");

    let first = spawn_host(&applier, ProcessorConfig::default());
    deliver_all(&first, &resource, &[1, 3, 4]).await;
    let residual = first.shutdown().await.unwrap();
    assert_eq!(applier.applied_for(&resource), vec![1]);

    // Survives a trip through the handoff codec
    let bytes = residual[&resource].to_bytes().unwrap();
    let mut restored = residual;
    restored.insert(
        resource.clone(),
        event_serializer_core::event_store::EventStore::from_bytes(&bytes).unwrap(),
    );

    let dyn_applier: Arc<dyn EventApplier<String>> = Arc::new(applier.clone());
    let second =
        ProcessorHost::spawn_with_state(dyn_applier, ProcessorConfig::default(), restored)
            .unwrap();
    deliver_all(&second, &resource, &[3, 2]).await;
    let residual = second.shutdown().await.unwrap();

    assert_eq!(applier.applied_for(&resource), vec![1, 2, 3, 4]);
    assert_eq!(residual[&resource].last_applied(), SequenceId::new(4));
}

#[tokio::test]
async fn deliveries_fail_after_shutdown() {
    let applier = RecordingApplier::new();
    let host = spawn_host(&applier, ProcessorConfig::default());
    let resource = ResourceId::new("account-1");

    host.shutdown().await.unwrap();

    assert!(matches!(
        host.deliver(resource.clone(), event(1)).await,
        Err(ProcessorError::HostStopped)
    ));
    assert!(matches!(
        host.retire(resource.clone()).await,
        Err(ProcessorError::HostStopped)
    ));
    assert!(matches!(
        host.evict(resource).await,
        Err(ProcessorError::HostStopped)
    ));
    assert!(matches!(host.shutdown().await, Err(ProcessorError::HostStopped)));
    assert!(host.is_stopped());
}

#[tokio::test(start_paused = true)]
async fn timed_out_generation_is_replaced_by_successor() {
    let applier = RecordingApplier::new();
    let host = spawn_host(
        &applier,
        ProcessorConfig::default().with_generation_timeout(Duration::from_secs(30)),
    );
    let resource = ResourceId::new("account-1");

    deliver_all(&host, &resource, &[1, 3]).await;
    // Outlive several generations while the gap stays open
    tokio::time::sleep(Duration::from_secs(95)).await;
    deliver_all(&host, &resource, &[2]).await;

    host.shutdown().await.unwrap();

    assert_eq!(applier.applied_for(&resource), vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn shutdown_times_out_behind_slow_applier() {
    let applier = RecordingApplier::new().with_delay(Duration::from_secs(60));
    let host = spawn_host(
        &applier,
        ProcessorConfig::default().with_shutdown_timeout(Duration::from_secs(1)),
    );

    host.deliver(ResourceId::new("account-1"), event(1))
        .await
        .unwrap();

    match host.shutdown().await {
        Err(ProcessorError::ShutdownTimeout(timeout)) => {
            assert_eq!(timeout, Duration::from_secs(1));
        }
        other => panic!("expected shutdown timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_config_is_rejected_at_spawn() {
    let applier: Arc<dyn EventApplier<String>> = Arc::new(RecordingApplier::new());

    let result = ProcessorHost::spawn(applier, ProcessorConfig::default().with_drain_sweep_attempts(0));

    assert!(matches!(
        result,
        Err(ProcessorError::Config(ConfigError::Validation(_)))
    ));
}
