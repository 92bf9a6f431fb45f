// Pool of engine runners: port allocation, capacity accounting and
// per-battle event fan-out.

use crate::domain::battle::BattleId;
use crate::domain::errors::{CommandError, reason};
use crate::domain::events::EngineEvent;
use crate::interface_adapters::start_script::StartScriptSpec;
use crate::use_cases::runner::{RunnerControl, RunnerEvent, RunnerOpts, RunnerSpawner};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const RUNNER_EVENT_CAPACITY: usize = 64;

/// Process-wide settings applied to every battle.
#[derive(Debug, Clone)]
pub struct GamesSettings {
    pub max_battles: usize,
    pub engine_start_port: u16,
    pub engine_autohost_start_port: u16,
    pub max_ports_used: u16,
    pub max_game_duration: Duration,
    pub engines_dir: PathBuf,
    pub instances_dir: PathBuf,
    pub engine_bind_ip: String,
    pub engine_settings: BTreeMap<String, String>,
}

/// A validated request to host one battle.
#[derive(Debug, Clone)]
pub struct StartBattle {
    pub battle_id: BattleId,
    pub engine_version: String,
    pub script: StartScriptSpec,
}

/// Events the manager fans out to its single consumer. For one battle,
/// `BattleStarted` precedes every `Packet`, which precede `BattleExited`.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    BattleStarted {
        battle_id: BattleId,
    },
    Packet {
        battle_id: BattleId,
        event: EngineEvent,
    },
    BattleError {
        battle_id: BattleId,
        details: String,
    },
    BattleExited {
        battle_id: BattleId,
    },
    Capacity {
        current_battles: usize,
        max_battles: usize,
    },
}

struct BattleEntry {
    control: Arc<dyn RunnerControl>,
    port_offset: u16,
    timeout_task: Option<tokio::task::JoinHandle<()>>,
}

struct ManagerState {
    max_battles: usize,
    /// Ids ever seen by this process; never shrinks.
    used_battle_ids: HashSet<BattleId>,
    used_offsets: HashSet<u16>,
    next_offset: u16,
    battles: HashMap<BattleId, BattleEntry>,
    /// Starts that have allocated resources but not yet reached `start`.
    pending_starts: usize,
    /// Battles that emitted `start` and not yet `exit`.
    current_battles: usize,
}

/// Owns all engine runners and the port allocator.
pub struct GamesManager {
    settings: GamesSettings,
    spawner: Arc<dyn RunnerSpawner>,
    events_tx: mpsc::Sender<ManagerEvent>,
    state: Mutex<ManagerState>,
    busy_tx: watch::Sender<usize>,
}

impl GamesManager {
    pub fn new(
        settings: GamesSettings,
        spawner: Arc<dyn RunnerSpawner>,
        events_tx: mpsc::Sender<ManagerEvent>,
    ) -> Arc<Self> {
        let max_battles = settings.max_battles;
        let (busy_tx, _) = watch::channel(0);
        Arc::new(Self {
            settings,
            spawner,
            events_tx,
            state: Mutex::new(ManagerState {
                max_battles,
                used_battle_ids: HashSet::new(),
                used_offsets: HashSet::new(),
                next_offset: 0,
                battles: HashMap::new(),
                pending_starts: 0,
                current_battles: 0,
            }),
            busy_tx,
        })
    }

    /// Battles holding resources (running or starting); zero means drained.
    pub fn busy_battles(&self) -> watch::Receiver<usize> {
        self.busy_tx.subscribe()
    }

    /// Snapshot of (currentBattles, maxBattles).
    pub fn capacity(&self) -> (usize, usize) {
        let state = self.state.lock().expect("manager state poisoned");
        (state.current_battles, state.max_battles)
    }

    fn publish_busy(&self, state: &ManagerState) {
        let _ = self.busy_tx.send(state.battles.len() + state.pending_starts);
    }

    /// Start a battle and wait until its engine is accepting connections.
    /// Returns the port players should connect to.
    pub async fn start(self: &Arc<Self>, request: StartBattle) -> Result<u16, CommandError> {
        let offset = {
            let mut state = self.state.lock().expect("manager state poisoned");
            if state.used_battle_ids.contains(&request.battle_id) {
                return Err(CommandError::with_details(
                    reason::BATTLE_ALREADY_EXISTS,
                    format!("battle {} was already hosted here", request.battle_id),
                ));
            }
            if state.current_battles >= state.max_battles {
                return Err(CommandError::invalid_request(format!(
                    "already hosting {} of {} battles",
                    state.current_battles, state.max_battles
                )));
            }
            let offset = find_free_offset(&mut state, self.settings.max_ports_used)
                .ok_or_else(|| CommandError::internal("no free ports"))?;
            state.used_battle_ids.insert(request.battle_id.clone());
            state.used_offsets.insert(offset);
            state.pending_starts += 1;
            self.publish_busy(&state);
            offset
        };

        let host_port = self.settings.engine_start_port + offset;
        let autohost_port = self.settings.engine_autohost_start_port + offset;
        let opts = RunnerOpts {
            battle_id: request.battle_id.clone(),
            engine_version: request.engine_version,
            script: request.script,
            settings: self.settings.engine_settings.clone(),
            engines_dir: self.settings.engines_dir.clone(),
            instances_dir: self.settings.instances_dir.clone(),
            engine_bind_ip: self.settings.engine_bind_ip.clone(),
            host_port,
            autohost_port,
        };

        let (runner_tx, mut runner_rx) = mpsc::channel(RUNNER_EVENT_CAPACITY);
        let control = self.spawner.spawn(opts, runner_tx).await;

        // Hold the caller until the engine reports SERVER_STARTED; a failed
        // start is only unwound once the runner has fully stopped, so the
        // port offset stays reserved until the socket is closed.
        let mut failure: Option<String> = None;
        let started = loop {
            match runner_rx.recv().await {
                Some(RunnerEvent::Started { engine_addr }) => break Some(engine_addr),
                Some(RunnerEvent::Error { details }) => failure = Some(details),
                Some(RunnerEvent::Packet(_)) => {}
                Some(RunnerEvent::Exited) | None => break None,
            }
        };

        let Some(engine_addr) = started else {
            let details =
                failure.unwrap_or_else(|| "engine exited before reporting startup".to_string());
            {
                let mut state = self.state.lock().expect("manager state poisoned");
                state.used_offsets.remove(&offset);
                state.pending_starts -= 1;
                self.publish_busy(&state);
            }
            warn!(battle_id = %request.battle_id, error = %details, "battle failed to start");
            return Err(CommandError::internal(details));
        };

        let timeout_task = {
            let control = control.clone();
            let battle_id = request.battle_id.clone();
            let duration = self.settings.max_game_duration;
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                info!(battle_id = %battle_id, "battle reached maximum duration; closing");
                control.close().await;
            })
        };

        let (current, max) = {
            let mut state = self.state.lock().expect("manager state poisoned");
            state.pending_starts -= 1;
            state.current_battles += 1;
            state.battles.insert(
                request.battle_id.clone(),
                BattleEntry {
                    control,
                    port_offset: offset,
                    timeout_task: Some(timeout_task),
                },
            );
            self.publish_busy(&state);
            (state.current_battles, state.max_battles)
        };

        info!(
            battle_id = %request.battle_id,
            engine_addr = %engine_addr,
            host_port,
            current_battles = current,
            "battle started"
        );
        let _ = self
            .events_tx
            .send(ManagerEvent::BattleStarted {
                battle_id: request.battle_id.clone(),
            })
            .await;
        let _ = self
            .events_tx
            .send(ManagerEvent::Capacity {
                current_battles: current,
                max_battles: max,
            })
            .await;

        let manager = self.clone();
        tokio::spawn(manager.forward_runner_events(request.battle_id, runner_rx));
        Ok(host_port)
    }

    async fn forward_runner_events(
        self: Arc<Self>,
        battle_id: BattleId,
        mut runner_rx: mpsc::Receiver<RunnerEvent>,
    ) {
        while let Some(event) = runner_rx.recv().await {
            match event {
                RunnerEvent::Packet(event) => {
                    let _ = self
                        .events_tx
                        .send(ManagerEvent::Packet {
                            battle_id: battle_id.clone(),
                            event,
                        })
                        .await;
                }
                RunnerEvent::Error { details } => {
                    let _ = self
                        .events_tx
                        .send(ManagerEvent::BattleError {
                            battle_id: battle_id.clone(),
                            details,
                        })
                        .await;
                }
                RunnerEvent::Exited => break,
                // The start event was consumed before this task existed.
                RunnerEvent::Started { .. } => {}
            }
        }

        let (current, max) = {
            let mut state = self.state.lock().expect("manager state poisoned");
            if let Some(entry) = state.battles.remove(&battle_id) {
                state.used_offsets.remove(&entry.port_offset);
                state.current_battles -= 1;
                if let Some(task) = entry.timeout_task {
                    task.abort();
                }
            }
            self.publish_busy(&state);
            (state.current_battles, state.max_battles)
        };

        debug!(battle_id = %battle_id, current_battles = current, "battle exited");
        let _ = self
            .events_tx
            .send(ManagerEvent::BattleExited {
                battle_id: battle_id.clone(),
            })
            .await;
        let _ = self
            .events_tx
            .send(ManagerEvent::Capacity {
                current_battles: current,
                max_battles: max,
            })
            .await;
    }

    /// Ask a battle's engine to shut down. Safe to call repeatedly.
    pub async fn kill(&self, battle_id: &BattleId) -> Result<(), CommandError> {
        let control = self
            .battle_control(battle_id)
            .ok_or_else(|| unknown_battle(battle_id))?;
        control.close().await;
        Ok(())
    }

    /// Forward a raw autohost packet to a battle's engine.
    pub async fn send_packet(
        &self,
        battle_id: &BattleId,
        data: Vec<u8>,
    ) -> Result<(), CommandError> {
        let control = self
            .battle_control(battle_id)
            .ok_or_else(|| unknown_battle(battle_id))?;
        control
            .send_packet(data)
            .await
            .map_err(|e| CommandError::invalid_request(format!("cannot reach battle: {e}")))
    }

    fn battle_control(&self, battle_id: &BattleId) -> Option<Arc<dyn RunnerControl>> {
        let state = self.state.lock().expect("manager state poisoned");
        state
            .battles
            .get(battle_id)
            .map(|entry| entry.control.clone())
    }

    /// Change capacity; zero prevents new starts while letting running
    /// battles finish.
    pub async fn set_max_battles(&self, max_battles: usize) {
        let (current, max) = {
            let mut state = self.state.lock().expect("manager state poisoned");
            state.max_battles = max_battles;
            (state.current_battles, state.max_battles)
        };
        info!(max_battles, "capacity changed");
        let _ = self
            .events_tx
            .send(ManagerEvent::Capacity {
                current_battles: current,
                max_battles: max,
            })
            .await;
    }

    /// Force every runner to close. Used by the second shutdown signal.
    pub async fn kill_all(&self) {
        let controls: Vec<Arc<dyn RunnerControl>> = {
            let state = self.state.lock().expect("manager state poisoned");
            state
                .battles
                .values()
                .map(|entry| entry.control.clone())
                .collect()
        };
        info!(battles = controls.len(), "closing all battles");
        for control in controls {
            control.close().await;
        }
    }
}

fn unknown_battle(battle_id: &BattleId) -> CommandError {
    CommandError::invalid_request(format!("unknown battle {battle_id}"))
}

fn find_free_offset(state: &mut ManagerState, max_ports_used: u16) -> Option<u16> {
    for step in 0..max_ports_used as u32 {
        let offset = ((state.next_offset as u32 + step) % max_ports_used as u32) as u16;
        if !state.used_offsets.contains(&offset) {
            state.next_offset = ((offset as u32 + 1) % max_ports_used as u32) as u16;
            return Some(offset);
        }
    }
    None
}
