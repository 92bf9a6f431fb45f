// Core battle identity and lifecycle types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Externally assigned opaque battle identifier (UUID-shaped string).
///
/// Once observed by the controller, an id is never accepted again for the
/// lifetime of the process, even after the original battle terminates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BattleId(pub String);

impl BattleId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BattleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BattleId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for BattleId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lifecycle of one engine instance.
///
/// ```text
/// None --run--> Starting --first SERVER_STARTED--> Running
/// Starting|Running --close or fatal error--> Stopping
/// Stopping --process exited and socket closed--> Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BattleState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// One participant of a battle, under all three of its identities.
///
/// Within a single battle each field is unique; the three fields form a
/// bijection maintained by [`crate::domain::PlayerIndex`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerIdentity {
    /// Stable cross-battle identifier used by the lobby.
    pub user_id: String,
    /// Display name, unique within the battle.
    pub name: String,
    /// Dense zero-based engine-local number, assigned in battle-description
    /// order: teams in ally-team order first, spectators appended.
    pub player_number: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn battle_id_displays_verbatim() {
        let id = BattleId::from("4d9bde60-4a5a-4b5b-b606-06c46d2e1b9a");
        assert_eq!(id.to_string(), "4d9bde60-4a5a-4b5b-b606-06c46d2e1b9a");
    }
}
