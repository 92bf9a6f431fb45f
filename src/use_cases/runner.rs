// One-battle engine runner: process lifecycle, autohost UDP channel and the
// Starting -> Running -> Stopping -> Stopped state machine.

use crate::domain::battle::{BattleId, BattleState};
use crate::domain::events::EngineEvent;
use crate::interface_adapters::{engine_codec, start_script};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Sleep;
use tracing::{debug, info, warn};

/// Grace period between SIGTERM and SIGKILL on close.
pub const ENGINE_KILL_GRACE: Duration = Duration::from_secs(20);

#[cfg(windows)]
pub const ENGINE_BINARY: &str = "spring-dedicated.exe";
#[cfg(not(windows))]
pub const ENGINE_BINARY: &str = "spring-dedicated";

/// Location of the dedicated-server binary for an installed version.
pub fn engine_binary_path(engines_dir: &Path, version: &str) -> PathBuf {
    engines_dir.join(version).join(ENGINE_BINARY)
}

/// Everything a runner needs to bring up one battle.
#[derive(Debug, Clone)]
pub struct RunnerOpts {
    pub battle_id: BattleId,
    pub engine_version: String,
    pub script: start_script::StartScriptSpec,
    pub settings: BTreeMap<String, String>,
    pub engines_dir: PathBuf,
    pub instances_dir: PathBuf,
    /// Bind address for the engine's battle socket, written into the script.
    pub engine_bind_ip: String,
    pub host_port: u16,
    pub autohost_port: u16,
}

/// Events emitted by a runner, in order: at most one `Started`, then any
/// number of `Packet`/`Error`, then exactly one `Exited`.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEvent {
    Started { engine_addr: SocketAddr },
    Packet(EngineEvent),
    Error { details: String },
    Exited,
}

#[derive(Debug)]
pub enum RunnerError {
    /// The battle is not in the Running state.
    NotRunning,
    /// The runner task is gone.
    Closed,
    Io(std::io::Error),
}

impl fmt::Display for RunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerError::NotRunning => f.write_str("battle is not running"),
            RunnerError::Closed => f.write_str("runner is closed"),
            RunnerError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

/// Operations on a live runner. `close` is idempotent from any state.
#[async_trait]
pub trait RunnerControl: Send + Sync {
    async fn send_packet(&self, data: Vec<u8>) -> Result<(), RunnerError>;
    async fn close(&self);
}

/// Construction seam so tests can substitute a synthetic runner.
#[async_trait]
pub trait RunnerSpawner: Send + Sync {
    async fn spawn(
        &self,
        opts: RunnerOpts,
        events: mpsc::Sender<RunnerEvent>,
    ) -> Arc<dyn RunnerControl>;
}

/// Production spawner backed by a real engine process.
pub struct ProcessRunnerSpawner;

#[async_trait]
impl RunnerSpawner for ProcessRunnerSpawner {
    async fn spawn(
        &self,
        opts: RunnerOpts,
        events: mpsc::Sender<RunnerEvent>,
    ) -> Arc<dyn RunnerControl> {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        tokio::spawn(run_battle(opts, events, cmd_rx));
        Arc::new(EngineRunner { cmd_tx })
    }
}

enum RunnerCommand {
    SendPacket(Vec<u8>, oneshot::Sender<Result<(), RunnerError>>),
    Close,
}

/// Handle to the runner task. Runs exactly one battle; dropping every handle
/// closes the battle.
pub struct EngineRunner {
    cmd_tx: mpsc::Sender<RunnerCommand>,
}

#[async_trait]
impl RunnerControl for EngineRunner {
    async fn send_packet(&self, data: Vec<u8>) -> Result<(), RunnerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RunnerCommand::SendPacket(data, reply_tx))
            .await
            .map_err(|_| RunnerError::Closed)?;
        reply_rx.await.map_err(|_| RunnerError::Closed)?
    }

    async fn close(&self) {
        // A closed channel means the task already stopped; nothing to do.
        let _ = self.cmd_tx.send(RunnerCommand::Close).await;
    }
}

#[cfg(unix)]
fn signal_pid(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::unistd::Pid;
    if let Err(e) = nix::sys::signal::kill(Pid::from_raw(pid as i32), signal) {
        debug!(pid, %signal, error = %e, "failed to signal engine");
    }
}

#[cfg(unix)]
fn terminate_engine(pid: u32) {
    signal_pid(pid, nix::sys::signal::Signal::SIGTERM);
}

#[cfg(unix)]
fn kill_engine(pid: u32) {
    signal_pid(pid, nix::sys::signal::Signal::SIGKILL);
}

#[cfg(not(unix))]
fn terminate_engine(_pid: u32) {
    warn!("graceful engine termination is not supported on this platform");
}

#[cfg(not(unix))]
fn kill_engine(_pid: u32) {
    warn!("forced engine kill is not supported on this platform");
}

struct BattleSetup {
    socket: UdpSocket,
    child: Child,
    pid: u32,
}

async fn setup_battle(opts: &RunnerOpts) -> Result<BattleSetup, String> {
    let instance_dir = opts.instances_dir.join(opts.battle_id.as_str());
    tokio::fs::create_dir_all(&instance_dir)
        .await
        .map_err(|e| format!("failed to create instance directory: {e}"))?;

    let script = start_script::render(
        &opts.script,
        &opts.engine_bind_ip,
        opts.host_port,
        opts.autohost_port,
    )
    .map_err(|e| format!("failed to render start script: {e}"))?;
    let script_path = instance_dir.join("script.txt");
    tokio::fs::write(&script_path, script)
        .await
        .map_err(|e| format!("failed to write start script: {e}"))?;

    let settings = start_script::render_settings(&opts.settings);
    tokio::fs::write(instance_dir.join("settings.txt"), settings)
        .await
        .map_err(|e| format!("failed to write settings: {e}"))?;

    let socket = UdpSocket::bind(("127.0.0.1", opts.autohost_port))
        .await
        .map_err(|e| format!("failed to bind autohost socket: {e}"))?;

    let binary = engine_binary_path(&opts.engines_dir, &opts.engine_version);
    let mut child = Command::new(&binary)
        .arg("-isolation")
        .arg(&script_path)
        .current_dir(&instance_dir)
        .env("SPRING_WRITEDIR", &instance_dir)
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn engine {}: {e}", binary.display()))?;

    let pid = child.id().ok_or_else(|| {
        // id() is None only when the child already reaped; treat as failure.
        let _ = child.start_kill();
        "engine exited during spawn".to_string()
    })?;

    Ok(BattleSetup { socket, child, pid })
}

async fn run_battle(
    opts: RunnerOpts,
    events: mpsc::Sender<RunnerEvent>,
    mut cmd_rx: mpsc::Receiver<RunnerCommand>,
) {
    let battle_id = opts.battle_id.clone();
    let autohost_port = opts.autohost_port;

    match setup_battle(&opts).await {
        Ok(setup) => {
            info!(
                battle_id = %battle_id,
                engine_version = %opts.engine_version,
                pid = setup.pid,
                autohost_port,
                "engine spawned"
            );
            battle_loop(&battle_id, setup, &events, &mut cmd_rx).await;
        }
        Err(details) => {
            warn!(battle_id = %battle_id, error = %details, "engine start failed");
            let _ = events.send(RunnerEvent::Error { details }).await;
        }
    }

    // The socket is dropped and the process reaped by now; yield one tick so
    // the port is observably reusable before exit is published.
    tokio::task::yield_now().await;
    let _ = events.send(RunnerEvent::Exited).await;
    debug!(battle_id = %battle_id, "runner stopped");
}

async fn battle_loop(
    battle_id: &BattleId,
    setup: BattleSetup,
    events: &mpsc::Sender<RunnerEvent>,
    cmd_rx: &mut mpsc::Receiver<RunnerCommand>,
) {
    let BattleSetup { socket, child, pid } = setup;

    // The child is owned by a dedicated wait task; signalling goes through
    // the pid so the select loop below keeps no mutable borrow on it.
    let (exit_tx, mut exit_rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut child = child;
        let _ = exit_tx.send(child.wait().await);
    });

    let mut buf = vec![0u8; 8192];
    let mut state = BattleState::Starting;
    let mut engine_addr: Option<SocketAddr> = None;
    let mut closing = false;
    // At most one kill timer; cleared on exit so a reused pid is never hit.
    let mut kill_timer: Option<Pin<Box<Sleep>>> = None;

    loop {
        tokio::select! {
            status = &mut exit_rx => {
                kill_timer = None;
                match status {
                    Ok(Ok(status)) if status.success() => {
                        info!(battle_id = %battle_id, "engine exited cleanly");
                    }
                    Ok(Ok(status)) => {
                        let details = format!("engine exited abnormally: {status}");
                        warn!(battle_id = %battle_id, %status, "engine exited abnormally");
                        let _ = events.send(RunnerEvent::Error { details }).await;
                    }
                    Ok(Err(e)) => {
                        let details = format!("failed to await engine exit: {e}");
                        warn!(battle_id = %battle_id, error = %e, "engine wait failed");
                        let _ = events.send(RunnerEvent::Error { details }).await;
                    }
                    Err(_) => {
                        let _ = events
                            .send(RunnerEvent::Error {
                                details: "engine wait task vanished".to_string(),
                            })
                            .await;
                    }
                }
                break;
            }

            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        debug!(battle_id = %battle_id, error = %e, "autohost socket recv error");
                        continue;
                    }
                };
                handle_datagram(
                    battle_id,
                    &buf[..len],
                    from,
                    &mut state,
                    &mut engine_addr,
                    events,
                )
                .await;
                if state == BattleState::Stopping && !closing {
                    // Unexpected first packet: shut the engine down.
                    closing = true;
                    terminate_engine(pid);
                    kill_timer = Some(Box::pin(tokio::time::sleep(ENGINE_KILL_GRACE)));
                }
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(RunnerCommand::SendPacket(data, reply)) => {
                        let result = match (state, engine_addr) {
                            (BattleState::Running, Some(addr)) => socket
                                .send_to(&data, addr)
                                .await
                                .map(|_| ())
                                .map_err(RunnerError::Io),
                            _ => Err(RunnerError::NotRunning),
                        };
                        let _ = reply.send(result);
                    }
                    // Dropping every handle counts as a close request.
                    Some(RunnerCommand::Close) | None => {
                        if !closing {
                            closing = true;
                            if state != BattleState::Stopping {
                                state = BattleState::Stopping;
                            }
                            info!(battle_id = %battle_id, pid, "terminating engine");
                            terminate_engine(pid);
                            kill_timer = Some(Box::pin(tokio::time::sleep(ENGINE_KILL_GRACE)));
                        }
                    }
                }
            }

            _ = async { kill_timer.as_mut().expect("kill timer present").await },
                if kill_timer.is_some() =>
            {
                warn!(battle_id = %battle_id, pid, "engine ignored SIGTERM; killing");
                kill_engine(pid);
                kill_timer = None;
            }
        }
    }

    drop(socket);
}

async fn handle_datagram(
    battle_id: &BattleId,
    data: &[u8],
    from: SocketAddr,
    state: &mut BattleState,
    engine_addr: &mut Option<SocketAddr>,
    events: &mpsc::Sender<RunnerEvent>,
) {
    match *state {
        BattleState::Starting => match engine_codec::decode(data) {
            Ok(EngineEvent::ServerStarted) => {
                *engine_addr = Some(from);
                *state = BattleState::Running;
                info!(battle_id = %battle_id, engine_addr = %from, "engine started");
                let _ = events.send(RunnerEvent::Started { engine_addr: from }).await;
            }
            Ok(other) => {
                warn!(battle_id = %battle_id, event = ?other, "expected SERVER_STARTED first");
                *state = BattleState::Stopping;
                let _ = events
                    .send(RunnerEvent::Error {
                        details: "expected SERVER_STARTED first".to_string(),
                    })
                    .await;
            }
            Err(e) => {
                debug!(battle_id = %battle_id, error = %e, "dropping undecodable datagram");
            }
        },
        BattleState::Running | BattleState::Stopping => {
            // Only the engine's own port is trusted.
            if *engine_addr != Some(from) {
                warn!(battle_id = %battle_id, from = %from, "dropping datagram from unknown source");
                return;
            }
            match engine_codec::decode(data) {
                Ok(event) => {
                    let _ = events.send(RunnerEvent::Packet(event)).await;
                }
                Err(e) => {
                    debug!(battle_id = %battle_id, error = %e, "dropping undecodable datagram");
                }
            }
        }
        BattleState::Stopped => {}
    }
}
