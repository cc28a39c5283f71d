//! Facade lifecycle: idempotent init/shutdown and the aggregate status.

mod common;

use std::time::Duration;

use common::{harness, harness_with_sampler, test_config, wait_until};

use conductor::application::{LoadLevel, ScriptedSampler};
use conductor::services::event_bus::{Event, EventKind};

#[tokio::test]
async fn test_init_and_shutdown_are_idempotent() {
    let h = harness(test_config()).await;
    assert!(!h.system.is_initialized());

    h.system.init().await.unwrap();
    let first = h.system.status().await;
    h.system.init().await.unwrap();
    let second = h.system.status().await;

    assert!(second.initialized);
    assert_eq!(first.bus.subscribers, second.bus.subscribers, "no duplicate wiring");
    assert_eq!(first.started_at, second.started_at);
    assert!(second.scanners.iter().all(|s| s.running));
    assert!(second.resources.running);
    assert!(second.qa.enabled && second.spawn.enabled);

    h.system.shutdown().await;
    h.system.shutdown().await;

    let stopped = h.system.status().await;
    assert!(!stopped.initialized);
    assert!(stopped.started_at.is_none());
    assert_eq!(stopped.bus.subscribers, 0);
    assert!(stopped.scanners.iter().all(|s| !s.running));
    assert!(!stopped.resources.running);
    assert!(!stopped.qa.enabled && !stopped.spawn.enabled);
    assert_eq!(h.system.bus().published_count(EventKind::SystemShutdown), 1);
}

#[tokio::test]
async fn test_system_can_restart_after_shutdown() {
    let h = harness(test_config()).await;
    h.system.init().await.unwrap();
    let wired = h.system.status().await.bus.subscribers;
    h.system.shutdown().await;

    h.system.init().await.unwrap();
    let status = h.system.status().await;
    assert!(status.initialized);
    assert_eq!(status.bus.subscribers, wired);
    h.system.shutdown().await;
}

#[tokio::test]
async fn test_status_lists_every_scanner() {
    let h = harness(test_config()).await;
    h.start().await;

    let status = h.system.status().await;
    let mut names: Vec<&str> = status.scanners.iter().map(|s| s.name).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["cleanup", "pending_task", "planning", "ready_for_qa", "stuck_agent"]);
    assert!(h.system.poll_scanner("nonexistent").await.is_none());

    let json = serde_json::to_value(&status).unwrap();
    for key in ["initialized", "qa", "spawn", "resources", "backoff", "scanners", "bus"] {
        assert!(json.get(key).is_some(), "status is missing {key}");
    }

    h.system.shutdown().await;
}

#[tokio::test]
async fn test_rate_limit_pauses_spawn() {
    let h = harness(test_config()).await;
    h.start().await;

    let outcome = h.system.report_rate_limit(Some(Duration::from_secs(30))).await;
    assert_eq!(outcome.duration, Duration::from_secs(30));
    assert_eq!(outcome.escalation, 1);
    assert!(h.system.backoff().is_limited());

    h.add_worker("worker-1").await;
    let task = h.add_task("must wait").await;
    h.system.bus().publish(Event::TaskPending { task_id: task.id });
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(h.launcher.launches().is_empty(), "no launch while rate limited");
    let status = h.system.status().await;
    assert!(status.spawn.rate_limited);
    assert_eq!(status.spawn.queue_length, 1);

    h.system.shutdown().await;
}

#[tokio::test]
async fn test_cpu_pressure_pauses_spawn_until_normal() {
    let h = harness(test_config()).await;
    h.start().await;
    h.add_worker("worker-1").await;
    let task = h.add_task("heavy").await;

    h.system.bus().publish(Event::SystemCpuHigh { percent: 95.0 });
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.system.bus().publish(Event::TaskPending { task_id: task.id });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.launcher.launches().is_empty());
    assert!(h.system.status().await.spawn.paused_for_cpu);

    h.system.bus().publish(Event::SystemCpuNormal { percent: 40.0 });
    let hr = &h;
    let launched =
        common::wait_until(|| async move { !hr.launcher.launches().is_empty() }, 3000).await;
    assert!(launched, "spawn resumes once CPU is normal");

    h.system.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_first_load_edge_reaches_spawn() {
    for _ in 0..10 {
        let h = harness_with_sampler(test_config(), ScriptedSampler::new([(10.0, 95.0)])).await;
        h.system.init().await.unwrap();

        let hr = &h;
        assert!(
            wait_until(
                || async move { hr.system.status().await.resources.memory == LoadLevel::High },
                3000
            )
            .await
        );
        assert!(
            wait_until(
                || async move { hr.system.status().await.spawn.paused_for_memory },
                3000
            )
            .await,
            "memory_high edge was lost"
        );

        h.system.shutdown().await;
    }
}

#[tokio::test]
async fn test_restart_under_load_keeps_services_paused() {
    let h = harness_with_sampler(test_config(), ScriptedSampler::new([(95.0, 10.0)])).await;
    h.start().await;
    let hr = &h;
    assert!(
        wait_until(
            || async move {
                let status = hr.system.status().await;
                !status.qa.enabled && status.spawn.paused_for_cpu
            },
            3000
        )
        .await
    );
    h.system.shutdown().await;

    // The gate is still high, so no new edge is published on restart.
    h.system.init().await.unwrap();
    let status = h.system.status().await;
    assert_eq!(status.resources.cpu, LoadLevel::High);
    assert!(!status.qa.enabled, "QA must stay off while CPU is high");
    assert!(status.spawn.paused_for_cpu);

    h.system.shutdown().await;
}
