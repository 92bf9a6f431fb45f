// Framework bootstrap: wiring, the lobby reconnect loop and shutdown.

use crate::frameworks::config::{self, Config};
use crate::interface_adapters::clients::lobby::{
    self, LobbyClientSettings, LobbyConnection,
};
use crate::interface_adapters::dispatch::Dispatcher;
use crate::interface_adapters::protocol::{self, commands};
use crate::use_cases::adapter::AutohostService;
use crate::use_cases::buffer::EventsBuffer;
use crate::use_cases::manager::{GamesManager, GamesSettings};
use crate::use_cases::registry::{EngineRegistry, RegistrySettings};
use crate::use_cases::runner::ProcessRunnerSpawner;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, error, info, warn};

const RECONNECT_INITIAL_DELAY: Duration = Duration::from_millis(50);
const MANAGER_EVENT_CAPACITY: usize = 256;
const OUTBOUND_FRAME_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownPhase {
    Running,
    /// First signal: no new battles, running ones may finish.
    Draining,
    /// Second signal: hard-kill everything and leave.
    Forced,
}

enum ConnectionEnd {
    Reconnect,
    Shutdown,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = matches!(std::env::var("LOG_FORMAT").as_deref(), Ok("json"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }

    std::panic::set_hook(Box::new(|info| {
        let backtrace = std::backtrace::Backtrace::capture();
        tracing::error!(%info, ?backtrace, "panic");
    }));
}

/// Full startup: env, tracing, config. Returns the process exit code.
pub async fn run_with_config() -> i32 {
    // Load .env locally; safe to ignore when not present.
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = match config::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return 1;
        }
    };
    run(config).await
}

/// Wire all components and run until shutdown. Returns the exit code.
pub async fn run(config: Config) -> i32 {
    let registry = match EngineRegistry::open(RegistrySettings {
        engines_dir: config.engines_dir.clone(),
        cdn_base_url: config.engine_cdn_base_url.clone(),
        install_timeout: config.engine_install_timeout,
        download_max_attempts: config.engine_download_max_attempts,
        download_retry_backoff_base: config.engine_download_retry_backoff_base,
    }) {
        Ok(registry) => registry,
        Err(e) => {
            error!(error = %e, "cannot initialize engine registry");
            return 1;
        }
    };

    let buffer = Arc::new(EventsBuffer::new(config.max_updates_subscription_age));
    let (manager_tx, manager_rx) = mpsc::channel(MANAGER_EVENT_CAPACITY);
    let manager = GamesManager::new(
        GamesSettings {
            max_battles: config.max_battles,
            engine_start_port: config.engine_start_port,
            engine_autohost_start_port: config.engine_autohost_start_port,
            max_ports_used: config.max_ports_used,
            max_game_duration: config.max_game_duration,
            engines_dir: config.engines_dir.clone(),
            instances_dir: config.instances_dir.clone(),
            engine_bind_ip: config.engine_bind_ip.clone(),
            engine_settings: config.engine_settings.clone(),
        },
        Arc::new(ProcessRunnerSpawner),
        manager_tx,
    );
    let service = AutohostService::new(
        manager.clone(),
        buffer.clone(),
        registry,
        config.hosting_ip.clone(),
    );
    service.spawn_event_loops(manager_rx);

    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownPhase::Running);
    spawn_signal_listener(shutdown_tx);

    let (drained_tx, drained_rx) = watch::channel(false);
    let drain_task = spawn_drain_controller(
        manager.clone(),
        service.subscribe_idle(),
        shutdown_rx.clone(),
        drained_tx,
    );

    let lobby_settings = LobbyClientSettings {
        host: config.tachyon_server.clone(),
        port: config.tachyon_server_port,
        secure: config.use_secure_connection,
        client_id: config.auth_client_id.clone(),
        client_secret: config.auth_client_secret.clone(),
    };

    connection_loop(
        lobby_settings,
        service,
        buffer,
        shutdown_rx,
        drained_rx,
        config.max_reconnect_delay,
    )
    .await;

    // The drain controller owns the kill/drain work; it must have finished
    // before the process is allowed to exit.
    if drain_task.await.is_err() {
        warn!("drain controller task failed");
    }

    info!("shutdown complete");
    0
}

fn spawn_signal_listener(shutdown_tx: watch::Sender<ShutdownPhase>) {
    tokio::spawn(async move {
        loop {
            shutdown_signal().await;
            let next = match *shutdown_tx.borrow() {
                ShutdownPhase::Running => {
                    info!("shutdown requested; draining running battles");
                    ShutdownPhase::Draining
                }
                _ => {
                    warn!("second shutdown signal; forcing exit");
                    ShutdownPhase::Forced
                }
            };
            let _ = shutdown_tx.send(next);
            if next == ShutdownPhase::Forced {
                break;
            }
        }
    });
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut interrupt =
        signal(SignalKind::interrupt()).expect("cannot install SIGINT handler");
    let mut terminate =
        signal(SignalKind::terminate()).expect("cannot install SIGTERM handler");
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn spawn_drain_controller(
    manager: Arc<GamesManager>,
    mut adapter_idle: watch::Receiver<bool>,
    mut shutdown_rx: watch::Receiver<ShutdownPhase>,
    drained_tx: watch::Sender<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while *shutdown_rx.borrow() == ShutdownPhase::Running {
            if shutdown_rx.changed().await.is_err() {
                return;
            }
        }
        manager.set_max_battles(0).await;

        let mut busy = manager.busy_battles();
        let mut forced = false;
        loop {
            if *shutdown_rx.borrow() == ShutdownPhase::Forced {
                forced = true;
                break;
            }
            if *busy.borrow() == 0 {
                break;
            }
            tokio::select! {
                changed = busy.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        }

        if forced {
            // The supervisor joins this task, so the hard kill is guaranteed
            // to have run before the process exits.
            manager.kill_all().await;
            // Exits and their terminal updates get a short window to land.
            let _ = tokio::time::timeout(Duration::from_secs(1), async {
                let _ = busy.wait_for(|busy| *busy == 0).await;
                let _ = adapter_idle.wait_for(|idle| *idle).await;
            })
            .await;
        } else {
            info!("all battles finished");
            // The events buffer counts as drained once the adapter has
            // pushed and delivered the terminal update of every battle.
            let _ = adapter_idle.wait_for(|idle| *idle).await;
        }
        let _ = drained_tx.send(true);
    })
}

async fn connection_loop(
    lobby_settings: LobbyClientSettings,
    service: Arc<AutohostService>,
    buffer: Arc<EventsBuffer>,
    mut shutdown_rx: watch::Receiver<ShutdownPhase>,
    mut drained_rx: watch::Receiver<bool>,
    max_reconnect_delay: Duration,
) {
    let mut delay = RECONNECT_INITIAL_DELAY;
    loop {
        if *drained_rx.borrow() || *shutdown_rx.borrow() == ShutdownPhase::Forced {
            return;
        }

        match lobby::connect(&lobby_settings).await {
            Ok(connection) => {
                delay = RECONNECT_INITIAL_DELAY;
                let end = run_connection(
                    connection,
                    &service,
                    &mut shutdown_rx,
                    &mut drained_rx,
                )
                .await;
                // The subscription belongs to the dead connection.
                buffer.unsubscribe().await;
                if matches!(end, ConnectionEnd::Shutdown) {
                    return;
                }
                info!("lobby connection lost; reconnecting");
            }
            Err(e) => {
                warn!(error = %e, delay_ms = delay.as_millis() as u64, "lobby connection failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => {}
            _ = drained_rx.changed() => {}
        }
        delay = (delay * 2).min(max_reconnect_delay);
    }
}

async fn run_connection(
    mut connection: LobbyConnection,
    service: &Arc<AutohostService>,
    shutdown_rx: &mut watch::Receiver<ShutdownPhase>,
    drained_rx: &mut watch::Receiver<bool>,
) -> ConnectionEnd {
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_FRAME_CAPACITY);
    let dispatcher = Arc::new(Dispatcher::new(service.clone(), outbound_tx.clone()));
    let mut status_rx = service.subscribe_status();

    // The lobby gets a status snapshot on every (re)connect.
    if send_status(&mut connection, service).await.is_err() {
        return ConnectionEnd::Reconnect;
    }

    loop {
        tokio::select! {
            inbound = connection.recv_text() => {
                match inbound {
                    None => return ConnectionEnd::Reconnect,
                    Some(Err(e)) => {
                        warn!(error = %e, "lobby receive failed");
                        return ConnectionEnd::Reconnect;
                    }
                    Some(Ok(text)) => match protocol::parse_envelope(&text) {
                        Err(e) => {
                            warn!(error = %e, "unparsable lobby frame");
                            connection.close(CloseCode::Policy, "parse error").await;
                            return ConnectionEnd::Reconnect;
                        }
                        Ok(envelope) => {
                            // One task per request: a slow start must not
                            // head-of-line block other commands.
                            let dispatcher = dispatcher.clone();
                            let outbound = outbound_tx.clone();
                            tokio::spawn(async move {
                                if let Some(response) = dispatcher.handle(envelope).await {
                                    let _ = outbound.send(response).await;
                                }
                            });
                        }
                    }
                }
            }

            frame = outbound_rx.recv() => {
                // Never None: this task holds a sender.
                let Some(frame) = frame else { return ConnectionEnd::Reconnect; };
                if let Err(e) = connection.send_text(frame).await {
                    warn!(error = %e, "lobby send failed");
                    return ConnectionEnd::Reconnect;
                }
            }

            changed = status_rx.changed() => {
                if changed.is_ok() {
                    // Status publication failures drop the connection and
                    // the next connect re-publishes; nothing else to do.
                    if send_status(&mut connection, service).await.is_err() {
                        return ConnectionEnd::Reconnect;
                    }
                }
            }

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() == ShutdownPhase::Forced {
                    connection.close(CloseCode::Away, "shutting down").await;
                    return ConnectionEnd::Shutdown;
                }
                // Draining: keep serving running battles.
            }

            _ = drained_rx.changed() => {
                if *drained_rx.borrow() {
                    // Updates already delivered by the buffer may still sit
                    // in the outbound queue; flush them before the goodbye.
                    while let Ok(frame) = outbound_rx.try_recv() {
                        if connection.send_text(frame).await.is_err() {
                            break;
                        }
                    }
                    connection.close(CloseCode::Away, "drained").await;
                    return ConnectionEnd::Shutdown;
                }
            }
        }
    }
}

async fn send_status(
    connection: &mut LobbyConnection,
    service: &Arc<AutohostService>,
) -> Result<(), ()> {
    let status = service.status();
    debug!(?status, "publishing status");
    let data = serde_json::to_value(&status).unwrap_or(Value::Null);
    let frame = protocol::event_frame(commands::STATUS_EVENT, data);
    connection.send_text(frame.to_string()).await.map_err(|e| {
        warn!(error = %e, "failed to publish status");
    })
}
