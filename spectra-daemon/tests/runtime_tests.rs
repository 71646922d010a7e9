//! Socket-level behaviour of a running daemon in a temp home.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use spectra_core::{SpectraConfig, SweepEvent, SweepPhase};
use spectra_daemon::{
    request, request_health, ClientMirror, ClientView, DaemonError, DaemonRequest, EventStream,
    FrequencyInput, StartRequest,
};

fn write_capture_script(dir: &Path) -> PathBuf {
    let path = dir.join("fake-capture");
    let script = "#!/bin/sh\nlow=\"${2%%:*}\"\nwhile true; do\n  echo \"2024-03-01, 12:00:00.000000, ${low}000000, ${low}100000, 10000.00, 20, -70.0, -45.5, -80.0\"\n  sleep 0.05\ndone\n";
    fs::write(&path, script).expect("write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
    path
}

fn config_for(program: &Path) -> SpectraConfig {
    let mut config = SpectraConfig::default();
    config.capture.program = program.display().to_string();
    config.timing.stop_grace_ms = 300;
    config.timing.cooldown_ms = 20;
    config
}

fn wait_for_socket(home: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if request_health(home).is_ok() {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    panic!("daemon socket never came up");
}

/// Read until `pred` matches, failing after `within`.
fn read_until(
    stream: &mut EventStream,
    within: Duration,
    pred: impl Fn(&SweepEvent) -> bool,
) -> Vec<SweepEvent> {
    let deadline = Instant::now() + within;
    let mut seen = Vec::new();
    while Instant::now() < deadline {
        if let Some(envelope) = stream
            .next_event(Duration::from_millis(200))
            .expect("event stream")
        {
            let done = pred(&envelope.event);
            seen.push(envelope.event);
            if done {
                return seen;
            }
        }
    }
    panic!("condition not met; saw {} events", seen.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnecting_client_is_restored_to_the_running_state() {
    let home = TempDir::new().expect("tempdir");
    let program = write_capture_script(home.path());
    let daemon = tokio::spawn(spectra_daemon::run(
        home.path().to_path_buf(),
        config_for(&program),
    ));

    let home_path = home.path().to_path_buf();
    tokio::task::spawn_blocking(move || {
        let home = home_path.as_path();
        wait_for_socket(home);

        let started = request(
            home,
            &DaemonRequest::Start(StartRequest {
                frequency: Some(FrequencyInput::Value(100.0)),
                ..StartRequest::default()
            }),
        )
        .expect("start accepted");
        assert_eq!(started["is_running"], true);

        let mut first = EventStream::connect(home, None).expect("subscribe");
        let seen = read_until(&mut first, Duration::from_secs(5), |e| {
            matches!(e, SweepEvent::SweepData(_))
        });
        assert!(matches!(seen.first(), Some(SweepEvent::StateSync(_))));
        drop(first);

        // A reconnecting client that believes nothing is running.
        let mut mirror = ClientMirror::default();
        mirror.reset(std::time::Instant::now());
        let stale = ClientView::default();
        let mut second = EventStream::connect(home, Some(stale)).expect("resubscribe");
        assert!(second.ack["version"].as_u64().is_some());

        let envelope = second
            .next_event(Duration::from_secs(2))
            .expect("stream")
            .expect("initial event");
        let SweepEvent::StateSync(state) = envelope.event else {
            panic!("first event after reconnect must be state_sync");
        };
        assert!(state.is_running);
        assert_eq!(
            state.current_frequency.map(|f| f.key()),
            Some(100_000_000)
        );
        mirror.offer(state);
        assert!(mirror.is_scanning());
        assert_eq!(
            mirror.current_frequency().map(|f| f.key()),
            Some(100_000_000)
        );

        let next = second
            .next_event(Duration::from_secs(2))
            .expect("stream")
            .expect("cycle config");
        assert!(matches!(next.event, SweepEvent::CycleConfig(_)));
        drop(second);

        let stopped = request(home, &DaemonRequest::Stop).expect("stop");
        assert_eq!(stopped["is_running"], false);
        let again = request(home, &DaemonRequest::Stop).unwrap_err();
        assert!(matches!(again, DaemonError::Rejected { .. }));

        request(home, &DaemonRequest::Shutdown).expect("shutdown");
    })
    .await
    .expect("client thread");

    tokio::time::timeout(Duration::from_secs(10), daemon)
        .await
        .expect("daemon exits after shutdown")
        .expect("daemon task")
        .expect("daemon result");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconcile_reports_divergence_and_health_has_every_section() {
    let home = TempDir::new().expect("tempdir");
    let program = write_capture_script(home.path());
    let daemon = tokio::spawn(spectra_daemon::run(
        home.path().to_path_buf(),
        config_for(&program),
    ));

    let home_path = home.path().to_path_buf();
    tokio::task::spawn_blocking(move || {
        let home = home_path.as_path();
        wait_for_socket(home);

        let outcome = request(
            home,
            &DaemonRequest::Reconcile {
                view: ClientView {
                    is_scanning: true,
                    current_frequency: None,
                    version: Some(3),
                },
            },
        )
        .expect("reconcile");
        assert_eq!(outcome["in_sync"], false);
        assert_eq!(outcome["divergence"]["divergence"], "running");
        assert_eq!(outcome["state"]["phase"], serde_json::json!(SweepPhase::Idle));

        let health = request_health(home).expect("health");
        for section in ["service", "process", "device", "grid", "recent_ops"] {
            assert!(health.get(section).is_some(), "missing {section}");
        }

        request(home, &DaemonRequest::Shutdown).expect("shutdown");
    })
    .await
    .expect("client thread");

    tokio::time::timeout(Duration::from_secs(10), daemon)
        .await
        .expect("daemon exits after shutdown")
        .expect("daemon task")
        .expect("daemon result");
}
