//! End-to-end scheduler behaviour against fake capture utilities.
//!
//! Each test writes its own shell script into a temp dir, so orphan reaping
//! in one test never matches another test's processes.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;

use spectra_core::events::StatusChange;
use spectra_core::{
    ErrorKind, Frequency, SpectraConfig, SweepConfiguration, SweepEvent, SweepPhase,
};
use spectra_daemon::{EventHub, Scheduler, SchedulerHandle, Subscription, SweepError};
use spectra_grid::Aggregator;

const LINE: &str = "2024-03-01, 12:00:00.000000, ${low}000000, ${low}100000, 10000.00, 20, -70.0, -45.5, -80.0";

/// Streams one sweep line every 50 ms for the requested range.
fn streaming_body() -> String {
    format!(
        "low=\"${{2%%:*}}\"\nwhile true; do\n  echo \"{LINE}\"\n  sleep 0.05\ndone\n"
    )
}

fn write_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-capture");
    fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod script");
    path
}

fn fast_config(program: &Path) -> SpectraConfig {
    let mut config = SpectraConfig::default();
    config.capture.program = program.display().to_string();
    config.timing.startup_timeout_ms = 2_000;
    config.timing.stop_grace_ms = 300;
    config.timing.cooldown_ms = 20;
    config.limits.min_cycle_time_ms = 500;
    config
}

struct Harness {
    handle: SchedulerHandle,
    events: Subscription,
    _shutdown: broadcast::Sender<()>,
    _dir: TempDir,
}

fn harness(body: &str, tweak: impl FnOnce(&mut SpectraConfig)) -> Harness {
    let dir = TempDir::new().expect("tempdir");
    let program = write_script(dir.path(), body);
    let mut config = fast_config(&program);
    tweak(&mut config);

    let hub = EventHub::new(4_096);
    let events = hub.subscribe();
    let aggregator = Arc::new(Aggregator::new(&config.aggregation).expect("aggregator"));
    let (scheduler, handle) = Scheduler::new(&config, hub, aggregator, Arc::new(Notify::new()));
    let (shutdown, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(scheduler.run(shutdown_rx));
    Harness {
        handle,
        events,
        _shutdown: shutdown,
        _dir: dir,
    }
}

fn sweep(frequencies: &[f64], cycle_ms: u64, config: &SpectraConfig) -> SweepConfiguration {
    SweepConfiguration::new(
        frequencies.iter().map(|f| Frequency::mhz(*f)).collect(),
        Duration::from_millis(cycle_ms),
        &config.limits,
    )
    .expect("valid sweep")
}

fn limits_config() -> SpectraConfig {
    let mut config = SpectraConfig::default();
    config.limits.min_cycle_time_ms = 500;
    config
}

impl Harness {
    /// Collect events until `stop` matches or `within` elapses.
    async fn collect_until(
        &mut self,
        within: Duration,
        mut stop: impl FnMut(&SweepEvent) -> bool,
    ) -> Vec<(Instant, SweepEvent)> {
        let deadline = Instant::now() + within;
        let mut seen = Vec::new();
        while let Ok(Some(envelope)) =
            tokio::time::timeout_at(deadline, self.events.events.recv()).await
        {
            let done = stop(&envelope.event);
            seen.push((Instant::now(), envelope.event));
            if done {
                break;
            }
        }
        seen
    }
}

fn status(event: &SweepEvent) -> Option<&StatusChange> {
    match event {
        SweepEvent::StatusChange(change) => Some(change),
        _ => None,
    }
}

fn is_active(event: &SweepEvent) -> bool {
    status(event).is_some_and(|s| s.phase == SweepPhase::Active)
}

#[tokio::test]
async fn second_start_is_rejected_and_first_session_survives() {
    let mut h = harness(&streaming_body(), |_| {});
    let config = limits_config();

    h.handle
        .start(sweep(&[100.0], 10_000, &config))
        .await
        .expect("first start");
    let err = h
        .handle
        .start(sweep(&[433.0], 10_000, &config))
        .await
        .unwrap_err();
    assert!(matches!(err, SweepError::AlreadyRunning), "got {err}");

    let seen = h.collect_until(Duration::from_secs(5), is_active).await;
    assert!(seen.iter().any(|(_, e)| is_active(e)), "session never became active");
    let state = h.handle.state();
    assert!(state.is_running);
    assert_eq!(state.current_frequency.map(|f| f.key()), Some(100_000_000));

    h.handle.stop().await.expect("stop");
    assert!(!h.handle.state().is_running);
    assert!(matches!(h.handle.stop().await, Err(SweepError::NotRunning)));
}

#[tokio::test]
async fn single_frequency_never_switches() {
    let mut h = harness(&streaming_body(), |_| {});
    let config = limits_config();
    h.handle
        .start(sweep(&[100.0], 1_000, &config))
        .await
        .expect("start");

    let seen = h
        .collect_until(Duration::from_millis(2_500), |_| false)
        .await;
    let phases: Vec<_> = seen
        .iter()
        .filter_map(|(_, e)| status(e))
        .map(|s| s.phase)
        .collect();
    assert!(!phases.contains(&SweepPhase::Switching), "phases: {phases:?}");
    assert_eq!(
        phases.iter().filter(|p| **p == SweepPhase::Active).count(),
        1
    );
    assert!(seen
        .iter()
        .any(|(_, e)| matches!(e, SweepEvent::SweepData(_))));
    h.handle.stop().await.expect("stop");
}

#[tokio::test]
async fn published_snapshot_only_moves_with_its_version() {
    let mut h = harness(&streaming_body(), |_| {});
    let config = limits_config();
    h.handle
        .start(sweep(&[100.0], 10_000, &config))
        .await
        .expect("start");
    h.collect_until(Duration::from_secs(5), is_active).await;

    let mut state = h.handle.watch_state();
    let active = state.borrow_and_update().clone();
    assert!(active.last_data_at.is_some());

    let seen = h
        .collect_until(Duration::from_millis(600), |_| false)
        .await;
    assert!(
        seen.iter()
            .filter(|(_, e)| matches!(e, SweepEvent::SweepData(_)))
            .count()
            >= 3
    );
    assert!(!state.has_changed().expect("scheduler alive"));
    assert_eq!(h.handle.state(), active);

    // Live data time stays visible through diagnostics.
    let diagnostics = h.handle.diagnostics().await.expect("diagnostics");
    assert_eq!(diagnostics.seconds_since_data, Some(0));
    h.handle.stop().await.expect("stop");
}

#[tokio::test]
async fn cycling_alternates_with_the_configured_period() {
    let mut h = harness(&streaming_body(), |_| {});
    let config = limits_config();
    h.handle
        .start(sweep(&[433.0, 915.0], 1_000, &config))
        .await
        .expect("start");

    let mut actives = 0;
    let seen = h
        .collect_until(Duration::from_secs(6), |e| {
            if is_active(e) {
                actives += 1;
            }
            actives >= 3
        })
        .await;
    h.handle.stop().await.expect("stop");

    let first_status = seen
        .iter()
        .position(|(_, e)| status(e).is_some())
        .expect("status events");
    let first_config = seen
        .iter()
        .position(|(_, e)| matches!(e, SweepEvent::CycleConfig(_)))
        .expect("cycle_config");
    assert!(first_config < first_status, "cycle_config comes first");

    let active: Vec<(Instant, usize)> = seen
        .iter()
        .filter_map(|(at, e)| {
            status(e)
                .filter(|s| s.phase == SweepPhase::Active)
                .map(|s| (*at, s.index.unwrap_or(usize::MAX)))
        })
        .collect();
    assert_eq!(
        active.iter().map(|(_, i)| *i).collect::<Vec<_>>(),
        vec![0, 1, 0]
    );
    // Consecutive activations are one cycle apart, within the switching window.
    for pair in active.windows(2) {
        let gap = pair[1].0.duration_since(pair[0].0);
        assert!(
            gap >= Duration::from_millis(750) && gap <= Duration::from_millis(1_250),
            "gap {gap:?}"
        );
    }

    let switching = seen
        .iter()
        .filter_map(|(_, e)| status(e))
        .find(|s| s.phase == SweepPhase::Switching)
        .expect("switching event");
    assert_eq!(switching.index, Some(0));
    assert_eq!(switching.next_frequency.map(|f| f.key()), Some(915_000_000));
}

#[tokio::test]
async fn failing_frequency_is_blacklisted_and_rotation_continues() {
    let body = format!("case \"$2\" in\n  905:925) exit 1 ;;\nesac\n{}", streaming_body());
    let mut h = harness(&body, |_| {});
    let config = limits_config();
    h.handle
        .start(sweep(&[433.0, 915.0], 1_000, &config))
        .await
        .expect("start");

    let seen = h
        .collect_until(Duration::from_secs(10), |e| {
            matches!(e, SweepEvent::FrequencyError(f) if f.blacklisted)
        })
        .await;

    let failures: Vec<_> = seen
        .iter()
        .filter_map(|(_, e)| match e {
            SweepEvent::FrequencyError(f) => Some(f.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        failures.iter().map(|f| f.consecutive_errors).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(failures
        .iter()
        .all(|f| f.error.frequency.map(|f| f.key()) == Some(915_000_000)));
    assert!(seen
        .iter()
        .any(|(_, e)| matches!(e, SweepEvent::CyclingError(_))));

    // The next configuration excludes the frequency for good.
    let after = h.collect_until(Duration::from_secs(2), |_| false).await;
    let configs: Vec<_> = after
        .iter()
        .filter_map(|(_, e)| match e {
            SweepEvent::CycleConfig(c) => Some(c.clone()),
            _ => None,
        })
        .collect();
    assert!(!configs.is_empty());
    for config in &configs {
        assert!(config.frequencies.iter().all(|f| f.key() != 915_000_000));
        assert_eq!(config.blacklisted.len(), 1);
    }
    assert!(!after
        .iter()
        .any(|(_, e)| matches!(e, SweepEvent::GracefulStop(_))));

    let state = h.handle.state();
    assert!(state.is_running);
    assert_eq!(state.frequencies.len(), 1);
    h.handle.stop().await.expect("stop");
}

#[tokio::test]
async fn flapping_process_ends_in_exactly_one_graceful_stop() {
    let body = format!("low=\"${{2%%:*}}\"\necho \"{LINE}\"\nexit 0\n");
    let mut h = harness(&body, |_| {});
    let config = limits_config();
    h.handle
        .start(sweep(&[100.0], 1_000, &config))
        .await
        .expect("start");

    let seen = h
        .collect_until(Duration::from_secs(15), |e| {
            matches!(e, SweepEvent::GracefulStop(_))
        })
        .await;
    let stop = seen
        .iter()
        .find_map(|(_, e)| match e {
            SweepEvent::GracefulStop(stop) => Some(stop.clone()),
            _ => None,
        })
        .expect("graceful_stop");
    assert_eq!(stop.total_failures, 6);
    assert!(stop.reason.contains("within one minute"), "{}", stop.reason);
    assert_eq!(stop.error_tally.get("100.000 MHz"), Some(&6));

    let later = h.collect_until(Duration::from_secs(1), |_| false).await;
    assert!(!later
        .iter()
        .any(|(_, e)| matches!(e, SweepEvent::GracefulStop(_))));
    let state = h.handle.state();
    assert!(!state.is_running);
    assert_eq!(state.phase, SweepPhase::Idle);
}

#[tokio::test]
async fn consecutive_failures_across_frequencies_stop_the_session() {
    // Only the very first launch streams; every relaunch exits at once.
    let body = format!(
        "marker=\"$(dirname \"$0\")/launched\"\nif [ -e \"$marker\" ]; then exit 1; fi\ntouch \"$marker\"\n{}",
        streaming_body()
    );
    let mut h = harness(&body, |c| c.failures.max_failures_per_minute = 100);
    let config = limits_config();
    h.handle
        .start(sweep(&[100.0, 433.0, 915.0], 1_000, &config))
        .await
        .expect("start");

    let seen = h
        .collect_until(Duration::from_secs(20), |e| {
            matches!(e, SweepEvent::GracefulStop(_))
        })
        .await;

    let failures: Vec<_> = seen
        .iter()
        .filter_map(|(_, e)| match e {
            SweepEvent::FrequencyError(f) => Some(f.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(failures.len(), 8);
    assert_eq!(
        failures
            .iter()
            .map(|f| f.error.frequency.map(|f| f.key()).unwrap_or_default() / 1_000_000)
            .collect::<Vec<_>>(),
        vec![433, 915, 100, 433, 915, 100, 433, 915]
    );
    assert_eq!(
        failures.iter().filter(|f| f.blacklisted).count(),
        2,
        "433 and 915 reach the per-frequency threshold"
    );

    // 433 is dropped from the rotation before the session gives up.
    let blacklist_config = seen
        .iter()
        .find_map(|(_, e)| match e {
            SweepEvent::CycleConfig(c) if !c.blacklisted.is_empty() => Some(c.clone()),
            _ => None,
        })
        .expect("cycle_config after blacklisting");
    assert_eq!(
        blacklist_config
            .frequencies
            .iter()
            .map(|f| f.key())
            .collect::<Vec<_>>(),
        vec![100_000_000, 915_000_000]
    );
    assert_eq!(blacklist_config.blacklisted[0].key(), 433_000_000);

    let config_at = seen
        .iter()
        .position(|(_, e)| matches!(e, SweepEvent::CycleConfig(c) if !c.blacklisted.is_empty()))
        .expect("cycle_config position");
    let stop_at = seen
        .iter()
        .position(|(_, e)| matches!(e, SweepEvent::GracefulStop(_)))
        .expect("graceful_stop position");
    assert!(config_at < stop_at);

    let SweepEvent::GracefulStop(stop) = &seen[stop_at].1 else {
        unreachable!()
    };
    assert_eq!(stop.total_failures, 8);
    assert!(
        stop.reason.contains("consecutive failures across the session"),
        "{}",
        stop.reason
    );
    assert_eq!(stop.blacklisted.len(), 2);
    assert_eq!(stop.error_tally.get("100.000 MHz"), Some(&2));
    assert_eq!(stop.error_tally.get("433.000 MHz"), Some(&3));
    assert_eq!(stop.error_tally.get("915.000 MHz"), Some(&3));

    let later = h.collect_until(Duration::from_secs(1), |_| false).await;
    assert!(!later
        .iter()
        .any(|(_, e)| matches!(e, SweepEvent::GracefulStop(_))));
    assert_eq!(h.handle.state().phase, SweepPhase::Idle);
}

#[tokio::test]
async fn stuck_session_recovers_then_stops_when_attempts_run_out() {
    // One line per launch, then the process stays alive but silent.
    let body = format!("low=\"${{2%%:*}}\"\necho \"{LINE}\"\nsleep 30\n");
    let mut h = harness(&body, |c| {
        c.timing.stuck_after_ms = 400;
        c.timing.health_interval_ms = 100;
        c.timing.max_recovery_attempts = 1;
    });
    let config = limits_config();
    h.handle
        .start(sweep(&[100.0], 1_000, &config))
        .await
        .expect("start");

    let seen = h
        .collect_until(Duration::from_secs(10), |e| {
            matches!(e, SweepEvent::GracefulStop(_))
        })
        .await;
    let trace: Vec<String> = seen
        .iter()
        .filter_map(|(_, e)| match e {
            SweepEvent::StatusChange(s) => Some(format!("status:{}", s.phase)),
            SweepEvent::SweepData(_) | SweepEvent::GracefulStop(_) => Some(e.name().to_string()),
            _ => None,
        })
        .collect();
    let first_active = trace
        .iter()
        .position(|t| t == "status:active")
        .expect("session became active");
    assert_eq!(
        trace[first_active..],
        [
            "status:active",
            "sweep_data",
            "status:starting",
            "status:active",
            "sweep_data",
            "status:error",
            "status:idle",
            "graceful_stop",
        ]
    );

    let SweepEvent::GracefulStop(stop) = &seen.last().expect("events").1 else {
        panic!("last event is not graceful_stop");
    };
    assert!(stop.reason.contains("recovery attempt"), "{}", stop.reason);
    assert_eq!(stop.total_failures, 0);
    assert!(!h.handle.state().is_running);

    let ops = h.handle.diagnostics().await.expect("diagnostics").recent_ops;
    assert!(ops.iter().any(|op| op.detail.contains("attempt 1/1")));
}

#[tokio::test]
async fn silent_process_is_a_startup_failure() {
    let mut h = harness("sleep 30\n", |c| c.timing.startup_timeout_ms = 400);
    let config = limits_config();
    h.handle
        .start(sweep(&[100.0], 1_000, &config))
        .await
        .expect("spawn succeeds");

    let seen = h
        .collect_until(Duration::from_secs(5), |e| matches!(e, SweepEvent::Error(_)))
        .await;
    let error = seen
        .iter()
        .find_map(|(_, e)| match e {
            SweepEvent::Error(err) => Some(err.clone()),
            _ => None,
        })
        .expect("startup error");
    assert_eq!(error.kind, ErrorKind::Startup);
    assert!(error.retryable);
    assert!(!h.handle.state().is_running);

    // The daemon stays operable for the next attempt.
    assert!(matches!(h.handle.stop().await, Err(SweepError::NotRunning)));
}

#[tokio::test]
async fn emergency_stop_kills_and_allows_restart() {
    let mut h = harness(&streaming_body(), |_| {});
    let config = limits_config();
    h.handle
        .start(sweep(&[100.0], 1_000, &config))
        .await
        .expect("start");
    h.collect_until(Duration::from_secs(5), is_active).await;

    let diagnostics = h.handle.diagnostics().await.expect("diagnostics");
    assert!(diagnostics.pid.is_some());

    let report = h.handle.emergency_stop("test").await.expect("emergency");
    assert!(report.killed);
    assert!(!report.state.is_running);
    let seen = h.collect_until(Duration::from_millis(500), |_| false).await;
    assert!(seen
        .iter()
        .any(|(_, e)| matches!(e, SweepEvent::EmergencyStop(_))));

    h.handle
        .start(sweep(&[100.0], 1_000, &config))
        .await
        .expect("restart after emergency stop");
    h.handle.stop().await.expect("stop");
}

#[tokio::test]
async fn force_cleanup_is_idempotent() {
    let h = harness(&streaming_body(), |_| {});
    let first = h.handle.force_cleanup().await.expect("cleanup");
    let second = h.handle.force_cleanup().await.expect("cleanup again");
    assert!(!first.killed && !second.killed);
    assert!(!second.state.is_running);
    assert!(second.state.version > first.state.version);
}
