// Domain layer: battle identities, engine events and their lobby projections.

pub mod battle;
pub mod errors;
pub mod events;
pub mod multi_index;

pub use battle::{BattleId, BattleState, PlayerIdentity};
pub use errors::CommandError;
pub use events::{
    ChatDestination, EngineEvent, LeaveReason, LobbyUpdate, LuaScript, LuaUiMode, TeamStatistics,
    UpdateChatDestination,
};
pub use multi_index::{IndexError, PlayerIndex};
