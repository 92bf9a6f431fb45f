// Lobby wire protocol: envelope shapes, per-command DTOs and the pure
// response/event builders.

use crate::interface_adapters::start_script::{
    AllyTeamSpec, PlayerSpec, StartScriptSpec, TeamSpec,
};
use crate::use_cases::buffer::BufferedEvent;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

/// Command ids of the lobby surface.
pub mod commands {
    pub const START: &str = "autohost/start";
    pub const KILL: &str = "autohost/kill";
    pub const ADD_PLAYER: &str = "autohost/addPlayer";
    pub const KICK_PLAYER: &str = "autohost/kickPlayer";
    pub const MUTE_PLAYER: &str = "autohost/mutePlayer";
    pub const SPEC_PLAYERS: &str = "autohost/specPlayers";
    pub const SEND_COMMAND: &str = "autohost/sendCommand";
    pub const SEND_MESSAGE: &str = "autohost/sendMessage";
    pub const SUBSCRIBE_UPDATES: &str = "autohost/subscribeUpdates";
    pub const INSTALL_ENGINE: &str = "autohost/installEngine";

    /// Events published by the controller.
    pub const STATUS_EVENT: &str = "autohost/status";
    pub const UPDATE_EVENT: &str = "autohost/update";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Event,
}

/// The outer message shape shared by requests, responses and events. Fields
/// beyond these are command-specific and validated later.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub message_id: String,
    pub command_id: String,
    #[serde(default)]
    pub data: Option<Value>,
}

pub fn parse_envelope(text: &str) -> Result<Envelope, serde_json::Error> {
    serde_json::from_str(text)
}

pub fn success_response(request: &Envelope, data: Option<Value>) -> Value {
    let mut frame = json!({
        "type": "response",
        "status": "success",
        "commandId": request.command_id,
        "messageId": request.message_id,
    });
    if let Some(data) = data {
        frame["data"] = data;
    }
    frame
}

pub fn failed_response(request: &Envelope, reason: &str, details: Option<&str>) -> Value {
    let mut frame = json!({
        "type": "response",
        "status": "failed",
        "commandId": request.command_id,
        "messageId": request.message_id,
        "reason": reason,
    });
    if let Some(details) = details {
        frame["details"] = details.into();
    }
    frame
}

/// Build an event frame with a fresh message id.
pub fn event_frame(command_id: &str, data: Value) -> Value {
    json!({
        "type": "event",
        "commandId": command_id,
        "messageId": Uuid::new_v4().to_string(),
        "data": data,
    })
}

/// Event data for one buffered lobby update.
pub fn update_event_data(event: &BufferedEvent) -> Value {
    json!({
        "time": event.time_us,
        "battleId": event.battle_id,
        "update": event.update,
    })
}

// --- command payloads ----------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PlayerDto {
    pub user_id: String,
    pub name: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TeamDto {
    pub players: Vec<PlayerDto>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AllyTeamDto {
    pub teams: Vec<TeamDto>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StartRequest {
    pub battle_id: String,
    pub engine_version: String,
    pub game_name: String,
    pub map_name: String,
    #[serde(default)]
    pub start_pos_type: Option<u8>,
    pub ally_teams: Vec<AllyTeamDto>,
    #[serde(default)]
    pub spectators: Vec<PlayerDto>,
    #[serde(default)]
    pub game_options: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub map_options: std::collections::BTreeMap<String, String>,
}

impl From<PlayerDto> for PlayerSpec {
    fn from(player: PlayerDto) -> Self {
        Self {
            user_id: player.user_id,
            name: player.name,
            password: player.password,
        }
    }
}

impl StartRequest {
    pub fn to_script_spec(&self) -> StartScriptSpec {
        StartScriptSpec {
            game_name: self.game_name.clone(),
            map_name: self.map_name.clone(),
            start_pos_type: self.start_pos_type,
            ally_teams: self
                .ally_teams
                .iter()
                .map(|ally| AllyTeamSpec {
                    teams: ally
                        .teams
                        .iter()
                        .map(|team| TeamSpec {
                            players: team.players.iter().cloned().map(Into::into).collect(),
                        })
                        .collect(),
                })
                .collect(),
            spectators: self.spectators.iter().cloned().map(Into::into).collect(),
            game_options: self.game_options.clone(),
            map_options: self.map_options.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub ips: Vec<String>,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KillRequest {
    pub battle_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AddPlayerRequest {
    pub battle_id: String,
    pub user_id: String,
    pub name: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KickPlayerRequest {
    pub battle_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MutePlayerRequest {
    pub battle_id: String,
    pub user_id: String,
    pub chat: bool,
    pub draw: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SpecPlayersRequest {
    pub battle_id: String,
    pub user_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SendCommandRequest {
    pub battle_id: String,
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SendMessageRequest {
    pub battle_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SubscribeUpdatesRequest {
    /// Microseconds since the unix epoch; replay starts strictly after.
    pub since: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InstallEngineRequest {
    pub version: String,
}
