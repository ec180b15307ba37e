use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use cohort_core::paths::socket_path;
use cohort_core::InstanceId;
use cohort_engine::{CoordError, Coordinator, SweepReport};

use crate::audit_rotation::rotate_audit;
use crate::error::{io_err, DaemonError};
use crate::protocol::{DaemonRequest, DaemonResponse};

/// What the daemon has done since it started, reported by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonState {
    pub instance_id: InstanceId,
    pub started_at_unix: u64,
    pub pings: u64,
    pub sweeps: u64,
    pub last_sweep_at_unix: u64,
    pub locks_swept: usize,
    pub audit_rotations: u64,
}

impl DaemonState {
    fn new(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            started_at_unix: unix_seconds_now(),
            pings: 0,
            sweeps: 0,
            last_sweep_at_unix: 0,
            locks_swept: 0,
            audit_rotations: 0,
        }
    }

    fn record_sweep(&mut self, report: &SweepReport) {
        self.sweeps += 1;
        self.last_sweep_at_unix = unix_seconds_now();
        self.locks_swept += report.count();
    }
}

type SharedState = Arc<RwLock<DaemonState>>;

/// Install tracing, build a runtime and block until the daemon exits.
pub fn start_blocking(coordinator: Coordinator) -> Result<(), DaemonError> {
    crate::init_tracing("info");
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(Arc::new(coordinator)))
}

/// Register, then heartbeat, sweep and serve the socket until `stop` or
/// ctrl-c. Deregisters on the way out.
pub async fn run(coordinator: Arc<Coordinator>) -> Result<(), DaemonError> {
    let registration = blocking(&coordinator, |c| c.register_instance()).await?;
    let instance_id = registration.instance.instance_id;
    tracing::info!(
        instance = %instance_id,
        context = coordinator.context(),
        reused = registration.reused,
        "daemon started"
    );

    let state: SharedState = Arc::new(RwLock::new(DaemonState::new(instance_id)));
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let heartbeat_handle = supervised(
        &shutdown_tx,
        heartbeat_task(coordinator.clone(), state.clone(), shutdown_tx.subscribe()),
    );
    let sweep_handle = supervised(
        &shutdown_tx,
        sweep_task(coordinator.clone(), state.clone(), shutdown_tx.subscribe()),
    );
    let socket_handle = supervised(
        &shutdown_tx,
        socket_server_task(
            coordinator.clone(),
            state.clone(),
            shutdown_tx.clone(),
            shutdown_tx.subscribe(),
        ),
    );
    let signal_handle = supervised(&shutdown_tx, wait_for_ctrl_c(shutdown_tx.subscribe()));

    let (heartbeat_result, sweep_result, socket_result, signal_result) =
        tokio::join!(heartbeat_handle, sweep_handle, socket_handle, signal_handle);

    let deregistered = blocking(&coordinator, |c| c.deregister_instance()).await;

    handle_join("heartbeat", heartbeat_result)?;
    handle_join("sweep", sweep_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    if let Some(id) = deregistered? {
        tracing::info!(instance = %id, "daemon stopped");
    }
    Ok(())
}

/// Spawn a daemon task; whichever task ends first stops the others.
fn supervised<F>(
    shutdown_tx: &broadcast::Sender<()>,
    task: F,
) -> JoinHandle<Result<(), DaemonError>>
where
    F: Future<Output = Result<(), DaemonError>> + Send + 'static,
{
    let shutdown_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        let result = task.await;
        let _ = shutdown_tx.send(());
        result
    })
}

async fn wait_for_ctrl_c(mut shutdown_rx: broadcast::Receiver<()>) -> Result<(), DaemonError> {
    tokio::select! {
        _ = shutdown_rx.recv() => Ok(()),
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => {
                tracing::info!("ctrl-c received, stopping daemon");
                Ok(())
            }
            Err(err) => Err(DaemonError::Protocol(format!("cannot listen for ctrl-c: {err}"))),
        },
    }
}

async fn heartbeat_task(
    coordinator: Arc<Coordinator>,
    state: SharedState,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let period = coordinator
        .config()
        .heartbeat_interval()
        .max(Duration::from_secs(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // Registration already pinged.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                match blocking(&coordinator, |c| c.heartbeat()).await {
                    Ok(_) => state.write().await.pings += 1,
                    Err(err) => tracing::warn!(error = %err, "heartbeat failed"),
                }
            }
        }
    }
    Ok(())
}

async fn sweep_task(
    coordinator: Arc<Coordinator>,
    state: SharedState,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let period = Duration::from_secs(coordinator.config().sweep_interval_secs.max(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                match blocking(&coordinator, |c| c.monitor().maybe_sweep()).await {
                    Ok(Some(report)) => state.write().await.record_sweep(&report),
                    Ok(None) => {}
                    Err(err) => tracing::warn!(error = %err, "scheduled sweep failed"),
                }

                let dir = coordinator.config().coordination_dir.clone();
                let max_bytes = coordinator.config().audit_rotate_bytes;
                let rotated = tokio::task::spawn_blocking(move || rotate_audit(&dir, max_bytes))
                    .await
                    .unwrap_or(false); // rotation errors are logged inside rotate_audit
                if rotated {
                    state.write().await.audit_rotations += 1;
                }
            }
        }
    }
    Ok(())
}

async fn socket_server_task(
    coordinator: Arc<Coordinator>,
    state: SharedState,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&coordinator.config().coordination_dir, coordinator.context());
    if let Some(run) = socket.parent() {
        fs::create_dir_all(run).map_err(|e| io_err(run, e))?;
    }
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let coordinator = coordinator.clone();
                let state = state.clone();
                let shutdown_tx = shutdown_tx.clone();
                let socket = socket.clone();
                tokio::spawn(async move {
                    if let Err(err) =
                        handle_socket_client(stream, coordinator, state, shutdown_tx, socket).await
                    {
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
    coordinator: Arc<Coordinator>,
    state: SharedState,
    shutdown_tx: broadcast::Sender<()>,
    socket: PathBuf,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err(&socket, e))?
    {
        if line.trim().is_empty() {
            continue;
        }
        let request = match serde_json::from_str::<DaemonRequest>(&line) {
            Ok(request) => request,
            Err(err) => {
                tracing::debug!(error = %err, "rejected socket request");
                let response = DaemonResponse::error(format!("bad request: {err}"));
                write_response(&mut writer, &socket, &response).await?;
                continue;
            }
        };

        let response = match dispatch(request, &coordinator, &state, &socket).await {
            Ok(data) => DaemonResponse::ok(data),
            Err(err) => DaemonResponse::error(err.to_string()),
        };
        write_response(&mut writer, &socket, &response).await?;

        if request == DaemonRequest::Stop {
            let _ = shutdown_tx.send(());
            break;
        }
    }
    Ok(())
}

async fn dispatch(
    request: DaemonRequest,
    coordinator: &Arc<Coordinator>,
    state: &SharedState,
    socket: &Path,
) -> Result<Value, DaemonError> {
    tracing::debug!(cmd = request.name(), "socket request");
    match request {
        DaemonRequest::Status => build_status_payload(coordinator, state, socket).await,
        DaemonRequest::Ping => {
            let heartbeat = blocking(coordinator, |c| c.heartbeat()).await?;
            state.write().await.pings += 1;
            Ok(json!(heartbeat))
        }
        DaemonRequest::Sweep => {
            let report = blocking(coordinator, |c| c.cleanup_stale()).await?;
            state.write().await.record_sweep(&report);
            Ok(json!({
                "released": report.released.len(),
                "purged": report.purged.len(),
                "dead_instances": report.dead_instances,
                "messages_purged": report.messages_purged,
            }))
        }
        DaemonRequest::Stop => Ok(json!({ "stopping": true })),
    }
}

async fn build_status_payload(
    coordinator: &Arc<Coordinator>,
    state: &SharedState,
    socket: &Path,
) -> Result<Value, DaemonError> {
    let snapshot = state.read().await.clone();
    let id = snapshot.instance_id.clone();
    let (heartbeat, locks_held, pending_messages) = blocking(coordinator, move |c| {
        let heartbeat = c.store().get_heartbeat(&id)?;
        let held = c
            .list_locks(false)?
            .into_iter()
            .filter(|r| r.is_held_by(&id))
            .count();
        Ok((heartbeat, held, c.pending_message_count()?))
    })
    .await?;

    let config = coordinator.config();
    Ok(json!({
        "running": true,
        "pid": std::process::id(),
        "context": coordinator.context(),
        "instance_id": snapshot.instance_id,
        "backend": coordinator.store().backend(),
        "coordination_dir": config.coordination_dir.display().to_string(),
        "socket": socket.display().to_string(),
        "started_at_unix": snapshot.started_at_unix,
        "pings": snapshot.pings,
        "sweeps": snapshot.sweeps,
        "last_sweep_at_unix": snapshot.last_sweep_at_unix,
        "locks_swept": snapshot.locks_swept,
        "audit_rotations": snapshot.audit_rotations,
        "locks_held": locks_held,
        "pending_messages": pending_messages,
        "heartbeat": heartbeat,
    }))
}

/// Run a coordinator call on the blocking pool.
async fn blocking<T, F>(coordinator: &Arc<Coordinator>, call: F) -> Result<T, DaemonError>
where
    T: Send + 'static,
    F: FnOnce(&Coordinator) -> Result<T, CoordError> + Send + 'static,
{
    let coordinator = coordinator.clone();
    let result = tokio::task::spawn_blocking(move || call(&coordinator))
        .await
        .map_err(|err| DaemonError::Protocol(format!("blocking task join error: {err}")))?;
    Ok(result?)
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

async fn write_response(
    writer: &mut OwnedWriteHalf,
    socket: &Path,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let mut line = serde_json::to_vec(response)?;
    line.push(b'\n');
    writer.write_all(&line).await.map_err(|e| io_err(socket, e))?;
    writer.flush().await.map_err(|e| io_err(socket, e))
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

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_core::{BackendKind, CoordConfig, LockType};
    use tempfile::TempDir;

    fn coordinator(dir: &TempDir) -> Arc<Coordinator> {
        let config = CoordConfig::for_root(dir.path()).with_backend(BackendKind::File);
        Arc::new(Coordinator::open(config, Some("status"), std::process::id()).unwrap())
    }

    #[tokio::test]
    async fn status_payload_reports_instance_and_locks() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(&dir);
        coordinator
            .acquire_file_lock(Path::new("a.rs"), LockType::ExclusiveWrite, None, "edit")
            .unwrap();
        let id = coordinator.current_instance().unwrap().unwrap().instance_id;
        let state: SharedState = Arc::new(RwLock::new(DaemonState::new(id.clone())));

        let payload = build_status_payload(&coordinator, &state, Path::new("/tmp/x.sock"))
            .await
            .unwrap();
        assert_eq!(payload["running"], json!(true));
        assert_eq!(payload["context"], json!("status"));
        assert_eq!(payload["instance_id"], json!(id.as_str()));
        assert_eq!(payload["backend"], json!("file"));
        assert_eq!(payload["locks_held"], json!(1));
        assert_eq!(payload["heartbeat"]["ping_count"], json!(1));
        assert_eq!(payload["pending_messages"], json!(null));
    }

    #[tokio::test]
    async fn stale_socket_file_is_replaced() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("stale.sock");
        fs::write(&socket, b"").unwrap();
        prepare_socket_for_bind(&socket).unwrap();
        assert!(!socket.exists());
    }

    #[test]
    fn sweep_counts_accumulate() {
        let mut state = DaemonState::new(InstanceId::from("inst-a"));
        state.record_sweep(&SweepReport::default());
        assert_eq!(state.sweeps, 1);
        assert!(state.last_sweep_at_unix > 0);
    }
}
