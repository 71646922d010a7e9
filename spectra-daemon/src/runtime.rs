use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, Notify};
use tokio::time::{Instant, MissedTickBehavior};

use spectra_core::events::{CycleConfig, Heartbeat};
use spectra_core::{ErrorKind as SweepErrorKind, ServerState, SpectraConfig, SweepEvent};
use spectra_grid::Aggregator;

use crate::error::{io_err, DaemonError, SweepError};
use crate::hub::EventHub;
use crate::paths::{socket_path, spectra_root};
use crate::protocol::{DaemonRequest, DaemonResponse};
use crate::reconcile::{self, ClientView, Reconciler};
use crate::scheduler::{Scheduler, SchedulerHandle};

const AGGREGATION_TICK: Duration = Duration::from_millis(100);
const PRUNE_TICK: Duration = Duration::from_secs(5);

/// Shared state handed to every socket client.
struct DaemonContext {
    home: PathBuf,
    config: SpectraConfig,
    scheduler: SchedulerHandle,
    hub: EventHub,
    reconciler: Reconciler,
    aggregator: Arc<Aggregator>,
    started: Instant,
    started_at: DateTime<Utc>,
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let config = spectra_core::config::load_at(home)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf(), config))
}

/// Run the daemon runtime.
pub async fn run(home: PathBuf, config: SpectraConfig) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;

    let hub = EventHub::new(config.events.subscriber_queue);
    let aggregator = Arc::new(Aggregator::new(&config.aggregation)?);
    let flush = Arc::new(Notify::new());
    let (scheduler, handle) =
        Scheduler::new(&config, hub.clone(), aggregator.clone(), flush.clone());
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let ctx = Arc::new(DaemonContext {
        reconciler: Reconciler::new(
            hub.clone(),
            Duration::from_millis(config.events.reconcile_debounce_ms),
        ),
        home: home.clone(),
        config,
        scheduler: handle,
        hub,
        aggregator: aggregator.clone(),
        started: Instant::now(),
        started_at: Utc::now(),
    });
    tracing::info!(socket = %socket_path(&home).display(), "spectra daemon starting");

    let scheduler_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let result = scheduler.run(shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let result = socket_server_task(ctx, shutdown.clone(), shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let aggregation_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let result = aggregation_task(aggregator, flush, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let heartbeat_handle = {
        let shutdown = shutdown_tx.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let result = heartbeat_task(ctx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (scheduler_result, socket_result, aggregation_result, heartbeat_result, signal_result) = tokio::join!(
        scheduler_handle,
        socket_handle,
        aggregation_handle,
        heartbeat_handle,
        signal_handle
    );

    handle_join("scheduler", scheduler_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("aggregation", aggregation_result)?;
    handle_join("heartbeat", heartbeat_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("spectra daemon stopped");
    Ok(())
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Flushes the detection buffer when its window elapses or when the
/// scheduler signals back-pressure, and prunes idle cells.
async fn aggregation_task(
    aggregator: Arc<Aggregator>,
    flush: Arc<Notify>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut tick = tokio::time::interval(AGGREGATION_TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut prune = tokio::time::interval(PRUNE_TICK);
    prune.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                aggregator.flush(now_ms());
                break;
            }
            _ = flush.notified() => {
                aggregator.flush(now_ms());
            }
            _ = tick.tick() => {
                aggregator.flush_if_due(now_ms());
            }
            _ = prune.tick() => {
                let pruned = aggregator.prune(now_ms());
                if pruned > 0 {
                    tracing::debug!(pruned, "pruned idle grid cells");
                }
            }
        }
    }
    Ok(())
}

async fn heartbeat_task(
    ctx: Arc<DaemonContext>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let period = Duration::from_millis(ctx.config.events.heartbeat_interval_ms.max(100));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                ctx.hub.publish(SweepEvent::Heartbeat(Heartbeat {
                    version: ctx.scheduler.state().version,
                    subscribers: ctx.hub.subscriber_count(),
                    uptime_secs: ctx.started.elapsed().as_secs(),
                }));
            }
        }
    }
    Ok(())
}

async fn socket_server_task(
    ctx: Arc<DaemonContext>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&ctx.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let ctx = ctx.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, ctx, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    ctx: Arc<DaemonContext>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<DaemonRequest>(&line) {
            Ok(request) => request,
            Err(err) => {
                write_json(
                    &mut writer,
                    &DaemonResponse::error(
                        SweepErrorKind::InvalidRequest,
                        format!("invalid request JSON: {err}"),
                    ),
                )
                .await?;
                continue;
            }
        };

        match request {
            DaemonRequest::Subscribe { view } => {
                let shutdown_rx = shutdown_tx.subscribe();
                return stream_events(ctx, view, lines, writer, shutdown_rx).await;
            }
            DaemonRequest::Shutdown => {
                write_json(&mut writer, &DaemonResponse::ok(json!({ "stopping": true }))).await?;
                let _ = shutdown_tx.send(());
                break;
            }
            other => {
                let response = match dispatch(&ctx, other).await {
                    Ok(data) => DaemonResponse::ok(data),
                    Err(err) => {
                        tracing::debug!(error = %err, kind = %err.kind(), "request rejected");
                        DaemonResponse::from(&err)
                    }
                };
                write_json(&mut writer, &response).await?;
            }
        }
    }

    Ok(())
}

async fn dispatch(ctx: &DaemonContext, request: DaemonRequest) -> Result<Value, DaemonError> {
    let aggregator = &ctx.aggregator;
    let data = match request {
        DaemonRequest::Start(start) => {
            let config = start
                .into_configuration(&ctx.config.limits)
                .map_err(SweepError::from)?;
            json!(ctx.scheduler.start(config).await?)
        }
        DaemonRequest::Stop => json!(ctx.scheduler.stop().await?),
        DaemonRequest::EmergencyStop { reason } => {
            let reason = reason.unwrap_or_else(|| "operator request".to_string());
            json!(ctx.scheduler.emergency_stop(reason).await?)
        }
        DaemonRequest::ForceCleanup => json!(ctx.scheduler.force_cleanup().await?),
        DaemonRequest::Health => build_health_payload(ctx).await?,
        DaemonRequest::CycleStatus => json!(ctx.scheduler.state()),
        DaemonRequest::Reconcile { view } => {
            json!(ctx.reconciler.reconcile(&view, ctx.scheduler.state()))
        }
        DaemonRequest::GridSnapshot { viewport, profile } => {
            json!(aggregator.snapshot(&viewport.unwrap_or_default(), profile.as_deref())?)
        }
        DaemonRequest::SetProfile { name } => json!(aggregator.set_profile(&name)?),
        DaemonRequest::ListProfiles => json!({
            "active": aggregator.active_profile().name,
            "profiles": aggregator.profiles(),
        }),
        DaemonRequest::GridCell { id } => json!(aggregator.cell(&id)?),
        DaemonRequest::GridExport => json!(aggregator.export(Utc::now())),
        DaemonRequest::ReportPerformance(sample) => {
            let adjustment = aggregator.report_performance(sample, now_ms());
            json!({
                "adjustment": adjustment,
                "profile": aggregator.active_profile(),
            })
        }
        DaemonRequest::SuggestProfile { viewport } => json!(aggregator.suggest_profile(&viewport)?),
        DaemonRequest::DeviceReset => json!({ "output": ctx.scheduler.device_reset().await? }),
        DaemonRequest::Subscribe { .. } | DaemonRequest::Shutdown => {
            return Err(DaemonError::Protocol(
                "subscribe and shutdown are connection-level commands".to_string(),
            ))
        }
    };
    Ok(data)
}

/// Serve one subscriber until it disconnects, is dropped for falling
/// behind, or the daemon shuts down. The first two events are always the
/// current `state_sync` and, while running, `cycle_config`.
async fn stream_events(
    ctx: Arc<DaemonContext>,
    view: Option<ClientView>,
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    mut writer: OwnedWriteHalf,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut snapshot: Option<ServerState> = None;
    let mut subscription = ctx.hub.subscribe_with(|| {
        let state = ctx.scheduler.state();
        let mut initial = vec![SweepEvent::StateSync(state.clone())];
        if let Some(config) = CycleConfig::from_state(&state) {
            initial.push(SweepEvent::CycleConfig(config));
        }
        snapshot = Some(state);
        initial
    });
    let id = subscription.id;

    if let (Some(view), Some(state)) = (&view, &snapshot) {
        if let Some(divergence) = reconcile::detect(view, state) {
            tracing::info!(
                subscriber = id,
                divergence = ?divergence,
                "resubscribing client diverged; state_sync sent"
            );
        }
    }

    let ack = DaemonResponse::ok(json!({
        "subscriber": id,
        "version": snapshot.as_ref().map(|s| s.version),
    }));
    if let Err(err) = write_json(&mut writer, &ack).await {
        ctx.hub.unsubscribe(id);
        return Err(err);
    }

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            envelope = subscription.events.recv() => {
                let Some(envelope) = envelope else {
                    tracing::info!(subscriber = id, "subscriber dropped by the distributor");
                    break;
                };
                if let Err(err) = write_json(&mut writer, &envelope).await {
                    tracing::debug!(subscriber = id, error = %err, "subscriber went away");
                    break;
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(_)) => {}
                    Ok(None) | Err(_) => break,
                }
            }
        }
    }

    ctx.hub.unsubscribe(id);
    Ok(())
}

async fn build_health_payload(ctx: &DaemonContext) -> Result<Value, DaemonError> {
    let diagnostics = ctx.scheduler.diagnostics().await?;
    let state = ctx.scheduler.state();
    let grid = ctx.aggregator.status();

    Ok(json!({
        "service": {
            "running": true,
            "started_at": ctx.started_at,
            "uptime_secs": ctx.started.elapsed().as_secs(),
            "subscribers": ctx.hub.subscriber_count(),
            "version": state.version,
            "socket": socket_path(&ctx.home).display().to_string(),
        },
        "process": {
            "pid": diagnostics.pid,
            "phase": state.phase,
            "seconds_since_data": diagnostics.seconds_since_data,
            "parse_errors": diagnostics.parse_errors,
            "last_parse_error": diagnostics.last_parse_error,
            "total_failures": diagnostics.total_failures,
        },
        "device": {
            "program": diagnostics.program,
            "on_path": diagnostics.program_on_path,
            "last_busy_at": diagnostics.device_busy_at,
        },
        "grid": {
            "profile": grid.profile,
            "cells": grid.cells,
            "buffered": grid.buffered,
            "auto_adjust": grid.auto_adjust,
        },
        "recent_ops": diagnostics.recent_ops,
    }))
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    let root = spectra_root(home);
    if !root.exists() {
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
    }
    Ok(())
}

async fn write_json<T: Serialize>(writer: &mut OwnedWriteHalf, value: &T) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(value)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn stale_socket_file_is_removed() {
        let home = TempDir::new().expect("home");
        ensure_runtime_dirs(home.path()).expect("dirs");
        let socket = socket_path(home.path());
        fs::write(&socket, b"").expect("stale file");

        prepare_socket_for_bind(&socket).expect("stale socket cleared");
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn live_socket_is_not_stolen() {
        let home = TempDir::new().expect("home");
        ensure_runtime_dirs(home.path()).expect("dirs");
        let socket = socket_path(home.path());
        let _listener = UnixListener::bind(&socket).expect("bind");

        let err = prepare_socket_for_bind(&socket).unwrap_err();
        assert!(matches!(err, DaemonError::Protocol(_)));
        assert!(socket.exists());
    }

    #[tokio::test]
    async fn aggregation_task_flushes_on_shutdown() {
        let aggregator = Arc::new(
            Aggregator::new(&SpectraConfig::default().aggregation).expect("aggregator"),
        );
        let detection = spectra_core::Detection::new(433e6, -60.0, Utc::now());
        for _ in 0..5 {
            aggregator.add_detection(detection.clone(), now_ms());
        }
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(aggregation_task(
            aggregator.clone(),
            Arc::new(Notify::new()),
            shutdown_rx,
        ));
        shutdown_tx.send(()).expect("send shutdown");
        task.await.expect("join").expect("task result");

        assert_eq!(aggregator.buffered(), 0);
        assert_eq!(aggregator.status().cells, 1);
    }
}
