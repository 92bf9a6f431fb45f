// Glue between the lobby protocol and the games manager: request handling,
// the EngineEvent -> LobbyUpdate projection, and status aggregation.

use crate::domain::battle::{BattleId, PlayerIdentity};
use crate::domain::errors::CommandError;
use crate::domain::events::{
    ChatDestination, EngineEvent, LobbyUpdate, UpdateChatDestination,
};
use crate::domain::multi_index::PlayerIndex;
use crate::interface_adapters::protocol::{
    AddPlayerRequest, InstallEngineRequest, KickPlayerRequest, KillRequest, MutePlayerRequest,
    SendCommandRequest, SendMessageRequest, SpecPlayersRequest, StartRequest, StartResponse,
    SubscribeUpdatesRequest,
};
use crate::interface_adapters::{engine_codec, start_script};
use crate::use_cases::buffer::{EventsBuffer, UpdateSink};
use crate::use_cases::manager::{GamesManager, ManagerEvent, StartBattle};
use crate::use_cases::registry::{EngineRegistry, InstallError};
use base64::Engine as _;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

/// Aggregated controller status published to the lobby.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub current_battles: usize,
    pub max_battles: usize,
    pub available_engines: Vec<String>,
}

/// The autohost seen from the lobby's side.
pub struct AutohostService {
    manager: Arc<GamesManager>,
    buffer: Arc<EventsBuffer>,
    registry: Arc<EngineRegistry>,
    hosting_ip: String,
    players: Mutex<HashMap<BattleId, PlayerIndex>>,
    status_tx: watch::Sender<Status>,
    /// True while no observed battle still owes a terminal update and the
    /// manager event queue is empty. The drain path gates on this.
    idle_tx: watch::Sender<bool>,
}

impl AutohostService {
    pub fn new(
        manager: Arc<GamesManager>,
        buffer: Arc<EventsBuffer>,
        registry: Arc<EngineRegistry>,
        hosting_ip: String,
    ) -> Arc<Self> {
        let (current_battles, max_battles) = manager.capacity();
        let (status_tx, _) = watch::channel(Status {
            current_battles,
            max_battles,
            available_engines: registry.versions(),
        });
        // Starts false so the drain path always waits for the event loop's
        // own verdict rather than a pre-loop default.
        let (idle_tx, _) = watch::channel(false);
        Arc::new(Self {
            manager,
            buffer,
            registry,
            hosting_ip,
            players: Mutex::new(HashMap::new()),
            status_tx,
            idle_tx,
        })
    }

    pub fn subscribe_status(&self) -> watch::Receiver<Status> {
        self.status_tx.subscribe()
    }

    /// Becomes true once every battle whose start was observed has had its
    /// terminal update pushed into the events buffer and nothing is queued.
    pub fn subscribe_idle(&self) -> watch::Receiver<bool> {
        self.idle_tx.subscribe()
    }

    fn publish_idle(&self, idle: bool) {
        self.idle_tx.send_if_modified(|current| {
            if *current == idle {
                return false;
            }
            *current = idle;
            true
        });
    }

    pub fn status(&self) -> Status {
        self.status_tx.borrow().clone()
    }

    /// Spawn the long-lived projection loops: manager events into the buffer
    /// and registry changes into the status.
    pub fn spawn_event_loops(self: &Arc<Self>, manager_rx: mpsc::Receiver<ManagerEvent>) {
        let service = self.clone();
        tokio::spawn(service.run_manager_events(manager_rx));

        let service = self.clone();
        let mut versions_rx = self.registry.subscribe_versions();
        tokio::spawn(async move {
            while versions_rx.changed().await.is_ok() {
                let versions = versions_rx.borrow().clone();
                service.status_tx.send_modify(|status| {
                    status.available_engines = versions;
                });
            }
        });
    }

    // --- lobby request surface -------------------------------------------

    pub async fn start(&self, request: StartRequest) -> Result<StartResponse, CommandError> {
        let battle_id = BattleId::from(request.battle_id.clone());
        if !self.registry.is_installed(&request.engine_version) {
            return Err(CommandError::invalid_request(format!(
                "engine version {:?} is not installed",
                request.engine_version
            )));
        }

        let script = request.to_script_spec();
        let identities = start_script::player_identities(&script);
        if identities.is_empty() {
            return Err(CommandError::invalid_request(
                "battle description has no players",
            ));
        }
        let mut index = PlayerIndex::new();
        for identity in identities {
            index.insert(identity).map_err(|_| {
                CommandError::invalid_request("duplicate player identity in battle description")
            })?;
        }

        let port = self
            .manager
            .start(StartBattle {
                battle_id: battle_id.clone(),
                engine_version: request.engine_version,
                script,
            })
            .await?;

        self.players.lock().await.insert(battle_id, index);
        Ok(StartResponse {
            ips: vec![self.hosting_ip.clone()],
            port,
        })
    }

    pub async fn kill(&self, request: KillRequest) -> Result<(), CommandError> {
        self.manager.kill(&BattleId::from(request.battle_id)).await
    }

    /// The only command that introduces a new identity after start. The
    /// identity is recorded only once the `adduser` packet reached the
    /// engine; a failed send leaves the index untouched.
    pub async fn add_player(&self, request: AddPlayerRequest) -> Result<(), CommandError> {
        let battle_id = BattleId::from(request.battle_id);
        let mut players = self.players.lock().await;
        let index = players
            .get_mut(&battle_id)
            .ok_or_else(|| unknown_battle(&battle_id))?;

        if let Some(existing) = index.get_by_user_id(&request.user_id) {
            if existing.name != request.name {
                return Err(CommandError::invalid_request(format!(
                    "user {} is already registered as {:?}",
                    request.user_id, existing.name
                )));
            }
            // Known user keeps their slot; this only updates the password.
            let packet = engine_codec::command("adduser", &[&request.name, &request.password])
                .map_err(serialize_error)?;
            self.manager.send_packet(&battle_id, packet).await?;
            return Ok(());
        }

        if index.has_name(&request.name) {
            return Err(CommandError::invalid_request(format!(
                "name {:?} is already taken by another user",
                request.name
            )));
        }

        let player_number = index.len() as u8;
        let packet =
            engine_codec::command("adduser", &[&request.name, &request.password, "1"])
                .map_err(serialize_error)?;
        self.manager.send_packet(&battle_id, packet).await?;

        index
            .insert(PlayerIdentity {
                user_id: request.user_id,
                name: request.name,
                player_number,
            })
            .map_err(|_| CommandError::internal("player index collision after send"))?;
        Ok(())
    }

    pub async fn kick_player(&self, request: KickPlayerRequest) -> Result<(), CommandError> {
        let battle_id = BattleId::from(request.battle_id);
        let name = self.player_name(&battle_id, &request.user_id).await?;
        let packet = engine_codec::command("kick", &[&name]).map_err(serialize_error)?;
        self.manager.send_packet(&battle_id, packet).await
    }

    pub async fn mute_player(&self, request: MutePlayerRequest) -> Result<(), CommandError> {
        let battle_id = BattleId::from(request.battle_id);
        let name = self.player_name(&battle_id, &request.user_id).await?;
        let packet = engine_codec::command(
            "mute",
            &[&name, bool_arg(request.chat), bool_arg(request.draw)],
        )
        .map_err(serialize_error)?;
        self.manager.send_packet(&battle_id, packet).await
    }

    /// All-or-none: every user id must resolve before any packet is sent.
    pub async fn spec_players(&self, request: SpecPlayersRequest) -> Result<(), CommandError> {
        let battle_id = BattleId::from(request.battle_id);
        let names = {
            let players = self.players.lock().await;
            let index = players
                .get(&battle_id)
                .ok_or_else(|| unknown_battle(&battle_id))?;
            let mut names = Vec::with_capacity(request.user_ids.len());
            for user_id in &request.user_ids {
                let identity = index.get_by_user_id(user_id).ok_or_else(|| {
                    CommandError::invalid_request(format!("unknown user {user_id}"))
                })?;
                names.push(identity.name.clone());
            }
            names
        };

        for name in names {
            let packet = engine_codec::command("spec", &[&name]).map_err(serialize_error)?;
            self.manager.send_packet(&battle_id, packet).await?;
        }
        Ok(())
    }

    pub async fn send_command(&self, request: SendCommandRequest) -> Result<(), CommandError> {
        let battle_id = BattleId::from(request.battle_id);
        let arguments: Vec<&str> = request.arguments.iter().map(String::as_str).collect();
        let packet =
            engine_codec::command(&request.command, &arguments).map_err(serialize_error)?;
        self.manager.send_packet(&battle_id, packet).await
    }

    pub async fn send_message(&self, request: SendMessageRequest) -> Result<(), CommandError> {
        let battle_id = BattleId::from(request.battle_id);
        let packet = engine_codec::chat_message(&request.message).map_err(serialize_error)?;
        self.manager.send_packet(&battle_id, packet).await
    }

    pub async fn subscribe_updates(
        &self,
        request: SubscribeUpdatesRequest,
        sink: UpdateSink,
    ) -> Result<(), CommandError> {
        self.buffer
            .subscribe(request.since, sink)
            .await
            .map_err(|e| CommandError::invalid_request(e.to_string()))
    }

    pub async fn install_engine(&self, request: InstallEngineRequest) -> Result<(), CommandError> {
        self.registry
            .install(&request.version)
            .await
            .map_err(|e| match e {
                InstallError::NotFound { .. } | InstallError::InvalidVersion { .. } => {
                    CommandError::invalid_request(e.to_string())
                }
                other => CommandError::internal(other.to_string()),
            })
    }

    // --- engine event projection -----------------------------------------

    async fn run_manager_events(self: Arc<Self>, mut manager_rx: mpsc::Receiver<ManagerEvent>) {
        // Battles that already emitted their terminal update; at most one of
        // {engine_quit, engine_crash} ever reaches the lobby per battle.
        let mut finished: HashSet<BattleId> = HashSet::new();
        // Battles whose start was observed and whose terminal update has not
        // been pushed yet.
        let mut settling: HashSet<BattleId> = HashSet::new();

        loop {
            let event = match manager_rx.try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Empty) => {
                    // Everything queued has been handled; the idle flag may
                    // only turn true here, so a drain never races an exit
                    // that is still waiting for its buffer push.
                    self.publish_idle(settling.is_empty());
                    match manager_rx.recv().await {
                        Some(event) => event,
                        None => break,
                    }
                }
                Err(TryRecvError::Disconnected) => break,
            };

            match event {
                ManagerEvent::BattleStarted { battle_id } => {
                    debug!(battle_id = %battle_id, "battle start observed");
                    settling.insert(battle_id);
                    self.publish_idle(false);
                }
                ManagerEvent::Packet { battle_id, event } => {
                    self.handle_engine_event(&mut finished, battle_id, event)
                        .await;
                }
                ManagerEvent::BattleError { battle_id, details } => {
                    if finished.insert(battle_id.clone()) {
                        self.buffer
                            .push(battle_id, LobbyUpdate::EngineCrash { details })
                            .await;
                    } else {
                        debug!(battle_id = %battle_id, "suppressing crash after terminal update");
                    }
                }
                ManagerEvent::BattleExited { battle_id } => {
                    // A runner that exits without SERVER_QUIT still owes the
                    // lobby a terminal update.
                    if finished.insert(battle_id.clone()) {
                        self.buffer
                            .push(battle_id.clone(), LobbyUpdate::EngineQuit)
                            .await;
                    }
                    self.players.lock().await.remove(&battle_id);
                    // Ids are never reused, so the entries can be dropped.
                    finished.remove(&battle_id);
                    settling.remove(&battle_id);
                }
                ManagerEvent::Capacity {
                    current_battles,
                    max_battles,
                } => {
                    self.status_tx.send_modify(|status| {
                        status.current_battles = current_battles;
                        status.max_battles = max_battles;
                    });
                }
            }
        }
        // Nothing can owe updates once the stream is gone.
        self.publish_idle(true);
        info!("manager event stream closed");
    }

    async fn handle_engine_event(
        &self,
        finished: &mut HashSet<BattleId>,
        battle_id: BattleId,
        event: EngineEvent,
    ) {
        if let EngineEvent::ServerQuit = event {
            if finished.insert(battle_id.clone()) {
                self.buffer.push(battle_id, LobbyUpdate::EngineQuit).await;
            }
            return;
        }
        let Some(update) = self.project(&battle_id, event).await else {
            return;
        };
        self.buffer.push(battle_id, update).await;
    }

    /// Translate one engine event into its lobby update, resolving player
    /// numbers through the battle's index. Unresolvable events are dropped.
    async fn project(&self, battle_id: &BattleId, event: EngineEvent) -> Option<LobbyUpdate> {
        match event {
            // No lobby-facing meaning.
            EngineEvent::ServerStarted
            | EngineEvent::PlayerReady { .. }
            | EngineEvent::GameTeamStat { .. } => None,
            // Terminal updates are handled with de-duplication by the caller.
            EngineEvent::ServerQuit => None,
            EngineEvent::ServerStartPlaying { .. } => Some(LobbyUpdate::Start),
            EngineEvent::ServerGameOver {
                player,
                winning_ally_teams,
            } => {
                if winning_ally_teams.is_empty() {
                    warn!(battle_id = %battle_id, "dropping game over without winners");
                    return None;
                }
                let user_id = self.resolve_user(battle_id, player).await?;
                Some(LobbyUpdate::Finished {
                    user_id,
                    winning_ally_teams,
                })
            }
            EngineEvent::ServerMessage { message } => {
                Some(LobbyUpdate::EngineMessage { message })
            }
            EngineEvent::ServerWarning { message } => {
                Some(LobbyUpdate::EngineWarning { message })
            }
            EngineEvent::PlayerJoined { player, name } => {
                let user_id = self.resolve_user(battle_id, player).await?;
                Some(LobbyUpdate::PlayerJoined { user_id, name })
            }
            EngineEvent::PlayerLeft { player, reason } => {
                let user_id = self.resolve_user(battle_id, player).await?;
                Some(LobbyUpdate::PlayerLeft { user_id, reason })
            }
            EngineEvent::PlayerChat {
                from,
                destination,
                message,
            } => {
                let user_id = self.resolve_user(battle_id, from).await?;
                let (destination, to_user_id) = match destination {
                    ChatDestination::Player(to) => {
                        let to_user_id = self.resolve_user(battle_id, to).await?;
                        (UpdateChatDestination::Player, Some(to_user_id))
                    }
                    ChatDestination::Allies => (UpdateChatDestination::Allies, None),
                    ChatDestination::Spectators => (UpdateChatDestination::Spectators, None),
                    ChatDestination::All => (UpdateChatDestination::All, None),
                };
                Some(LobbyUpdate::PlayerChat {
                    user_id,
                    to_user_id,
                    destination,
                    message,
                })
            }
            EngineEvent::PlayerDefeated { player } => {
                let user_id = self.resolve_user(battle_id, player).await?;
                Some(LobbyUpdate::PlayerDefeated { user_id })
            }
            EngineEvent::GameLuaMsg {
                player,
                script,
                ui_mode,
                data,
            } => {
                let user_id = self.resolve_user(battle_id, player).await?;
                Some(LobbyUpdate::LuaMsg {
                    user_id,
                    script,
                    ui_mode,
                    data: base64::engine::general_purpose::STANDARD.encode(data),
                })
            }
        }
    }

    async fn resolve_user(&self, battle_id: &BattleId, player: u8) -> Option<String> {
        let players = self.players.lock().await;
        let resolved = players
            .get(battle_id)
            .and_then(|index| index.get_by_number(player))
            .map(|identity| identity.user_id.clone());
        if resolved.is_none() {
            warn!(battle_id = %battle_id, player, "dropping event for unknown player number");
        }
        resolved
    }

    async fn player_name(
        &self,
        battle_id: &BattleId,
        user_id: &str,
    ) -> Result<String, CommandError> {
        let players = self.players.lock().await;
        let index = players
            .get(battle_id)
            .ok_or_else(|| unknown_battle(battle_id))?;
        index
            .get_by_user_id(user_id)
            .map(|identity| identity.name.clone())
            .ok_or_else(|| CommandError::invalid_request(format!("unknown user {user_id}")))
    }
}

fn unknown_battle(battle_id: &BattleId) -> CommandError {
    CommandError::invalid_request(format!("unknown battle {battle_id}"))
}

fn serialize_error(e: engine_codec::SerializeError) -> CommandError {
    CommandError::invalid_request(e.to_string())
}

fn bool_arg(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}
