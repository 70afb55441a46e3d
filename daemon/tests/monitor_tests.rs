mod common;

use common::{sample, snapshot, system_sample, ScriptedSource, MIB};
use procwatch_daemon::collector::SampleCollector;
use procwatch_daemon::config::Config;
use procwatch_daemon::detector::Breach;
use procwatch_daemon::error::AcquisitionError;
use procwatch_daemon::monitor::{Monitor, MonitorEvent};
use procwatch_daemon::sample::{Classification, ProcessIdentity};
use procwatch_daemon::source::ProcessInfoSource;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::TryRecvError};

fn config(threshold: f64, k: u32) -> Config {
    let mut config = Config::default();
    config.detection.cpu_threshold_percent = threshold;
    config.detection.cpu_recovery_percent = threshold - 10.0;
    config.detection.consecutive_samples = k;
    config.history.capacity = 16;
    config.history.retention_cycles = 2;
    config.registry.termination_grace_cycles = 1;
    config
}

fn drain(rx: &mut broadcast::Receiver<MonitorEvent>) -> Vec<MonitorEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            Err(TryRecvError::Lagged(_)) => continue,
        }
    }
    events
}

fn changes(events: &[MonitorEvent]) -> Vec<(ProcessIdentity, Classification)> {
    events
        .iter()
        .filter_map(|e| match e {
            MonitorEvent::ClassificationChanged(c) => Some((c.identity, c.classification)),
            _ => None,
        })
        .collect()
}

/// Three samples at 95% against a 90% threshold with K=3 flag the process
/// on the third, not before.
#[tokio::test]
async fn test_sustained_breach_flags_on_kth_sample() {
    let monitor = Monitor::new(&config(90.0, 3));
    let mut rx = monitor.subscribe();
    let id = ProcessIdentity::new(1234, 500);

    let mut seen = Vec::new();
    for (t, cpu) in [(1000, 10.0), (2000, 95.0), (3000, 95.0), (4000, 95.0)] {
        monitor.process_snapshot(&snapshot(t, vec![sample(1234, 500, cpu)])).await;
        seen.push(monitor.classification(&id).await.unwrap());
    }
    assert_eq!(
        seen,
        vec![
            Classification::Unclassified,
            Classification::Unclassified,
            Classification::Unclassified,
            Classification::Suspicious,
        ]
    );

    let events = drain(&mut rx);
    assert_eq!(changes(&events), vec![(id, Classification::Suspicious)]);
    let change = events
        .iter()
        .find_map(|e| match e {
            MonitorEvent::ClassificationChanged(c) => Some(c.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(change.previous, Classification::Unclassified);
    assert_eq!(change.breach, Some(Breach::Cpu));
    assert_eq!(change.name, "proc-1234");
    assert_eq!(monitor.suspicious_count().await, 1);

    let series = monitor.history(&id).await.unwrap();
    assert_eq!(series.len(), 4);
    assert_eq!(series.last().unwrap().timestamp, 4000);
}

#[tokio::test]
async fn test_recovery_clears_suspicious() {
    let monitor = Monitor::new(&config(90.0, 2));
    let id = ProcessIdentity::new(7, 7);
    for (t, cpu) in [(1, 95.0), (2, 95.0), (3, 85.0), (4, 50.0), (5, 50.0)] {
        monitor.process_snapshot(&snapshot(t, vec![sample(7, 7, cpu)])).await;
        if t == 3 {
            assert_eq!(monitor.classification(&id).await, Some(Classification::Suspicious));
        }
    }
    assert_eq!(monitor.classification(&id).await, Some(Classification::Unclassified));
}

/// A process hovering between the recovery and alert thresholds stays
/// flagged even after the breaching points have left the ring buffer.
#[tokio::test]
async fn test_verdict_survives_history_wraparound() {
    let mut short = config(90.0, 2);
    short.history.capacity = 4;
    let monitor = Monitor::new(&short);
    let mut rx = monitor.subscribe();
    let id = ProcessIdentity::new(11, 11);

    let mut seen = Vec::new();
    for (t, cpu) in [(1, 95.0), (2, 95.0), (3, 85.0), (4, 85.0), (5, 85.0), (6, 85.0)] {
        monitor.process_snapshot(&snapshot(t, vec![sample(11, 11, cpu)])).await;
        seen.push(monitor.classification(&id).await.unwrap());
    }
    assert_eq!(seen[0], Classification::Unclassified);
    assert!(seen[1..].iter().all(|c| *c == Classification::Suspicious), "{:?}", seen);

    let cpus: Vec<f64> = monitor.history(&id).await.unwrap().iter().map(|p| p.cpu_percent).collect();
    assert_eq!(cpus, vec![85.0; 4]);
    assert_eq!(changes(&drain(&mut rx)), vec![(id, Classification::Suspicious)]);

    for t in 7..=8 {
        monitor.process_snapshot(&snapshot(t, vec![sample(11, 11, 50.0)])).await;
    }
    assert_eq!(monitor.classification(&id).await, Some(Classification::Unclassified));
}

#[tokio::test]
async fn test_acquisition_failure_changes_nothing() {
    let monitor = Monitor::new(&config(90.0, 3));
    monitor.process_snapshot(&snapshot(1, vec![sample(1, 1, 95.0)])).await;
    let before = monitor.processes().await;
    let mut rx = monitor.subscribe();

    monitor.report_failure(&AcquisitionError::Unavailable("boom".into()));

    assert_eq!(monitor.processes().await, before);
    assert_eq!(monitor.history(&ProcessIdentity::new(1, 1)).await.unwrap().len(), 1);
    let events = drain(&mut rx);
    assert!(matches!(
        events.as_slice(),
        [MonitorEvent::AcquisitionFailed { message }] if message.contains("boom")
    ));
}

/// A reused pid starts a fresh history and never inherits a verdict.
#[tokio::test]
async fn test_pid_reuse_does_not_merge_history() {
    let monitor = Monitor::new(&config(90.0, 2));
    let old = ProcessIdentity::new(100, 1);
    let new = ProcessIdentity::new(100, 2);

    monitor.process_snapshot(&snapshot(1, vec![sample(100, 1, 99.0)])).await;
    monitor.process_snapshot(&snapshot(2, vec![sample(100, 1, 99.0)])).await;
    assert_eq!(monitor.classification(&old).await, Some(Classification::Suspicious));

    let result = monitor.process_snapshot(&snapshot(3, vec![sample(100, 2, 99.0)])).await;
    assert_eq!(result.terminated, vec![old]);
    assert_eq!(result.created, vec![new]);

    assert_eq!(monitor.classification(&new).await, Some(Classification::Unclassified));
    assert_eq!(monitor.history(&new).await.unwrap().len(), 1);
    assert_eq!(monitor.history(&old).await.unwrap().len(), 2);
    assert_eq!(monitor.by_pid(100).await.unwrap().start_time, 2);

    // Terminated identity is still inspectable until it expires
    let retired = monitor.process(&old).await.unwrap();
    assert_eq!(retired.classification, Classification::Suspicious);
    assert_eq!(monitor.suspicious_count().await, 0);
}

#[tokio::test]
async fn test_expired_history_is_evicted() {
    let monitor = Monitor::new(&config(90.0, 3));
    let id = ProcessIdentity::new(5, 5);
    monitor.process_snapshot(&snapshot(1, vec![sample(5, 5, 1.0)])).await;
    monitor.trust(id).await;

    let terminated = monitor.process_snapshot(&snapshot(2, vec![])).await;
    assert_eq!(terminated.terminated, vec![id]);
    assert!(monitor.history(&id).await.is_some());

    monitor.process_snapshot(&snapshot(3, vec![])).await;
    let expired = monitor.process_snapshot(&snapshot(4, vec![])).await;
    assert_eq!(expired.expired, vec![id]);

    assert!(monitor.history(&id).await.is_none());
    assert!(monitor.process(&id).await.is_none());
    assert!(monitor.trusted().await.is_empty());
    assert_eq!(monitor.tracked_count().await, 0);
}

#[tokio::test]
async fn test_trust_and_untrust_emit_changes() {
    let monitor = Monitor::new(&config(90.0, 1));
    let id = ProcessIdentity::new(9, 9);
    monitor.process_snapshot(&snapshot(1, vec![sample(9, 9, 99.0)])).await;
    let mut rx = monitor.subscribe();

    assert!(monitor.trust(id).await);
    assert!(!monitor.trust(id).await);
    assert_eq!(monitor.classification(&id).await, Some(Classification::Trusted));
    assert_eq!(monitor.trusted().await, vec![id]);

    assert!(monitor.untrust(&id).await);
    assert_eq!(monitor.classification(&id).await, Some(Classification::Suspicious));

    let events = drain(&mut rx);
    assert_eq!(
        changes(&events),
        vec![(id, Classification::Trusted), (id, Classification::Suspicious)]
    );
}

#[tokio::test]
async fn test_trust_before_first_sighting() {
    let monitor = Monitor::new(&config(90.0, 1));
    let id = ProcessIdentity::new(3, 3);
    monitor.trust(id).await;
    monitor.process_snapshot(&snapshot(1, vec![sample(3, 3, 99.0)])).await;
    assert_eq!(monitor.classification(&id).await, Some(Classification::Trusted));
}

/// An override for an identity that never shows up is dropped once the
/// retention window passes, and reported so it can be unpersisted.
#[tokio::test]
async fn test_trust_for_absent_identity_expires() {
    let monitor = Monitor::new(&config(90.0, 1));
    let ghost = ProcessIdentity::new(404, 1);
    let present = ProcessIdentity::new(1, 1);
    monitor.trust(ghost).await;
    monitor.trust(present).await;
    let mut rx = monitor.subscribe();

    for t in 1..=2 {
        monitor.process_snapshot(&snapshot(t, vec![sample(1, 1, 5.0)])).await;
    }
    assert_eq!(monitor.trusted().await, vec![present, ghost]);

    monitor.process_snapshot(&snapshot(3, vec![sample(1, 1, 5.0)])).await;
    assert_eq!(monitor.trusted().await, vec![present]);

    let expired: Vec<Vec<ProcessIdentity>> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            MonitorEvent::TrustExpired { identities } => Some(identities),
            _ => None,
        })
        .collect();
    assert_eq!(expired, vec![vec![ghost]]);
}

#[tokio::test]
async fn test_restore_trusted_skips_exited_processes() {
    let source = ScriptedSource::new(vec![Ok(vec![sample(7, 70, 1.0)])]);
    source.snapshot().unwrap();
    let monitor = Monitor::new(&config(90.0, 1));
    let alive = ProcessIdentity::new(7, 70);
    let reused_pid = ProcessIdentity::new(7, 69);
    let gone = ProcessIdentity::new(8, 80);

    let stale = monitor.restore_trusted(vec![alive, reused_pid, gone], &source).await;

    assert_eq!(stale, vec![reused_pid, gone]);
    assert_eq!(monitor.trusted().await, vec![alive]);
}

#[tokio::test]
async fn test_system_totals_tracked_in_bounded_series() {
    let mut small = config(90.0, 2);
    small.history.capacity = 3;
    let monitor = Monitor::new(&small);
    assert!(monitor.system().await.is_none());

    for (t, cpu) in [(1, 10.0), (2, 20.0), (3, 30.0), (4, 40.0)] {
        let mut snap = snapshot(t, vec![sample(1, 1, 1.0)]);
        snap.system = Some(system_sample(cpu, 512));
        monitor.process_snapshot(&snap).await;
    }
    // A cycle without totals keeps the last reading
    monitor.process_snapshot(&snapshot(5, vec![sample(1, 1, 1.0)])).await;

    let view = monitor.system().await.unwrap();
    assert_eq!(view.timestamp, 4);
    assert_eq!(view.cpu_percent, 40.0);
    assert_eq!(view.memory_used_bytes, 512 * MIB);
    assert_eq!(view.memory_percent, 50.0);
    let average = view.average.unwrap();
    assert_eq!(average.points, 3);
    assert_eq!(average.cpu_percent, 30.0);

    let series = monitor.system_history().await;
    let cpus: Vec<f64> = series.iter().map(|p| p.cpu_percent).collect();
    assert_eq!(cpus, vec![20.0, 30.0, 40.0]);
}

#[tokio::test]
async fn test_reconfigure_applies_and_rejects() {
    let monitor = Monitor::new(&config(90.0, 5));
    let id = ProcessIdentity::new(2, 2);
    for t in 1..=3 {
        monitor.process_snapshot(&snapshot(t, vec![sample(2, 2, 95.0)])).await;
    }
    assert_eq!(monitor.classification(&id).await, Some(Classification::Unclassified));

    let mut bad = config(90.0, 2);
    bad.detection.consecutive_samples = 0;
    assert!(monitor.reconfigure(&bad).await.is_err());
    assert_eq!(monitor.classification(&id).await, Some(Classification::Unclassified));

    // Lower K reclassifies immediately from the retained history
    monitor.reconfigure(&config(90.0, 2)).await.unwrap();
    assert_eq!(monitor.classification(&id).await, Some(Classification::Suspicious));
}

#[tokio::test]
async fn test_views_sorted_and_searchable() {
    let monitor = Monitor::new(&config(90.0, 3));
    let mut big = sample(30, 3, 5.0);
    big.name = "Postgres".to_string();
    big.resident_memory_bytes = 900 * MIB;
    monitor
        .process_snapshot(&snapshot(1, vec![sample(10, 1, 20.0), sample(20, 2, 40.0), big]))
        .await;

    let pids: Vec<u32> = monitor.processes().await.iter().map(|v| v.pid).collect();
    assert_eq!(pids, vec![20, 10, 30]);

    let found = monitor.find_by_name("postgres").await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].memory_bytes, 900 * MIB);
    assert_eq!(found[0].average.unwrap().points, 1);
    assert_eq!(monitor.find_by_name("proc-").await.len(), 2);
}

/// Collector-driven run with a failed cycle in the middle: the failure
/// adds nothing and the following cycle reconciles against the state from
/// before it.
#[tokio::test]
async fn test_collector_feeds_monitor_end_to_end() {
    let source = Arc::new(ScriptedSource::new(vec![
        Ok(vec![sample(1, 0, 10.0)]),
        Ok(vec![sample(1, 0, 95.0)]),
        Err("transient".to_string()),
        Ok(vec![sample(1, 0, 96.0)]),
        Ok(vec![sample(1, 0, 97.0)]),
    ]));
    let monitor = Arc::new(Monitor::new(&config(90.0, 3)));
    let mut rx = monitor.subscribe();
    let id = ProcessIdentity::new(1, 0);

    let mut collector = SampleCollector::new(source);
    collector.on_sample(monitor.clone()).await;
    collector.start(Duration::from_millis(5)).unwrap();
    for _ in 0..200 {
        if monitor.history(&id).await.map(|s| s.len()) == Some(4) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    collector.stop().await;

    assert_eq!(monitor.classification(&id).await, Some(Classification::Suspicious));
    let series = monitor.history(&id).await.unwrap();
    let cpus: Vec<f64> = series.iter().map(|p| p.cpu_percent).collect();
    assert_eq!(cpus, vec![10.0, 95.0, 96.0, 97.0]);

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(e, MonitorEvent::AcquisitionFailed { .. })));
    assert_eq!(changes(&events), vec![(id, Classification::Suspicious)]);
    // Only the first reconciliation created the process
    let created: usize = events
        .iter()
        .filter_map(|e| match e {
            MonitorEvent::Reconciled(r) => Some(r.created.len()),
            _ => None,
        })
        .sum();
    assert_eq!(created, 1);
}
