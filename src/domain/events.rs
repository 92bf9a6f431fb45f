// Engine-side events and their lobby-facing projections.

use serde::Serialize;

/// Reason a player disappeared from a running battle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaveReason {
    /// Connection to the player was lost.
    Lost,
    /// The player left on their own.
    Left,
    /// The player was kicked by the host.
    Kicked,
}

impl LeaveReason {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Lost),
            1 => Some(Self::Left),
            2 => Some(Self::Kicked),
            _ => None,
        }
    }
}

/// Recipient class of an in-game chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatDestination {
    /// Directed at a single player number.
    Player(u8),
    Allies,
    Spectators,
    All,
}

/// Which lua environment produced a lua message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LuaScript {
    Ui,
    Gaia,
    Rules,
}

/// Visibility of a UI lua message. Only meaningful for [`LuaScript::Ui`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LuaUiMode {
    All,
    Allies,
    Spectators,
}

/// Per-team statistics snapshot reported by the engine.
///
/// Decoded for wire completeness but intentionally projected to no lobby
/// update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TeamStatistics {
    pub frame: i32,
    pub metal_used: f32,
    pub energy_used: f32,
    pub metal_produced: f32,
    pub energy_produced: f32,
    pub metal_excess: f32,
    pub energy_excess: f32,
    pub metal_received: f32,
    pub energy_received: f32,
    pub metal_sent: f32,
    pub energy_sent: f32,
    pub damage_dealt: f32,
    pub damage_received: f32,
    pub units_produced: i32,
    pub units_died: i32,
    pub units_received: i32,
    pub units_sent: i32,
    pub units_captured: i32,
    pub units_out_captured: i32,
    pub units_killed: i32,
}

/// One decoded datagram from the engine's autohost channel.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    ServerStarted,
    ServerQuit,
    ServerStartPlaying {
        game_id: [u8; 16],
        demo_path: String,
    },
    ServerGameOver {
        player: u8,
        winning_ally_teams: Vec<u8>,
    },
    ServerMessage {
        message: String,
    },
    ServerWarning {
        message: String,
    },
    PlayerJoined {
        player: u8,
        name: String,
    },
    PlayerLeft {
        player: u8,
        reason: LeaveReason,
    },
    PlayerReady {
        player: u8,
        state: u8,
    },
    PlayerChat {
        from: u8,
        destination: ChatDestination,
        message: String,
    },
    PlayerDefeated {
        player: u8,
    },
    GameLuaMsg {
        player: u8,
        script: LuaScript,
        ui_mode: Option<LuaUiMode>,
        data: Vec<u8>,
    },
    GameTeamStat {
        team: u8,
        stats: TeamStatistics,
    },
}

/// Chat destination as seen by the lobby.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateChatDestination {
    Player,
    Allies,
    Spectators,
    All,
}

/// Lobby-facing projection of an [`EngineEvent`], keyed by stable user ids
/// instead of engine-local player numbers.
///
/// `PlayerReady`, `ServerStarted` and `GameTeamStat` have no projection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LobbyUpdate {
    Start,
    Finished {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "winningAllyTeams")]
        winning_ally_teams: Vec<u8>,
    },
    EngineMessage {
        message: String,
    },
    EngineWarning {
        message: String,
    },
    EngineQuit,
    EngineCrash {
        details: String,
    },
    PlayerJoined {
        #[serde(rename = "userId")]
        user_id: String,
        name: String,
    },
    PlayerLeft {
        #[serde(rename = "userId")]
        user_id: String,
        reason: LeaveReason,
    },
    PlayerChat {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "toUserId", skip_serializing_if = "Option::is_none")]
        to_user_id: Option<String>,
        destination: UpdateChatDestination,
        message: String,
    },
    PlayerDefeated {
        #[serde(rename = "userId")]
        user_id: String,
    },
    #[serde(rename = "luamsg")]
    LuaMsg {
        #[serde(rename = "userId")]
        user_id: String,
        script: LuaScript,
        #[serde(rename = "uiMode", skip_serializing_if = "Option::is_none")]
        ui_mode: Option<LuaUiMode>,
        /// Base64 of the opaque lua payload.
        data: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lobby_update_uses_snake_case_tags() {
        let update = LobbyUpdate::EngineCrash {
            details: "exit code 1".to_string(),
        };
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["type"], "engine_crash");
        assert_eq!(value["details"], "exit code 1");
    }

    #[test]
    fn chat_update_omits_to_user_id_when_not_directed() {
        let update = LobbyUpdate::PlayerChat {
            user_id: "u1".to_string(),
            to_user_id: None,
            destination: UpdateChatDestination::Allies,
            message: "go".to_string(),
        };
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["type"], "player_chat");
        assert_eq!(value["destination"], "allies");
        assert!(value.get("toUserId").is_none());
    }

    #[test]
    fn leave_reason_rejects_out_of_range() {
        assert_eq!(LeaveReason::from_wire(2), Some(LeaveReason::Kicked));
        assert_eq!(LeaveReason::from_wire(3), None);
    }
}
