// Rendering of the engine's hierarchical-key start script and the per-battle
// settings file.
//
// Player numbers are positional: the order of `[playerN]` sections written
// here is the order identities were assigned, so the renderer and
// `player_identities` must walk the description identically.

use crate::domain::battle::PlayerIdentity;
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;

/// A participant as described by the lobby in a start request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerSpec {
    pub user_id: String,
    pub name: String,
    pub password: String,
}

/// One controllable team; every team belongs to exactly one ally team.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TeamSpec {
    pub players: Vec<PlayerSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AllyTeamSpec {
    pub teams: Vec<TeamSpec>,
}

/// Everything needed to render a start script, minus the endpoints that are
/// only known once a port offset has been allocated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartScriptSpec {
    pub game_name: String,
    pub map_name: String,
    pub start_pos_type: Option<u8>,
    pub ally_teams: Vec<AllyTeamSpec>,
    pub spectators: Vec<PlayerSpec>,
    pub game_options: BTreeMap<String, String>,
    pub map_options: BTreeMap<String, String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ScriptError {
    /// A key or value contains characters the format cannot carry.
    BadValue { key: String },
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptError::BadValue { key } => {
                write!(f, "value for {key:?} cannot be represented in a start script")
            }
        }
    }
}

/// The identities implied by a start description, in player-number order:
/// ally teams in order, their teams in order, their players in order, then
/// spectators.
pub fn player_identities(spec: &StartScriptSpec) -> Vec<PlayerIdentity> {
    let mut identities = Vec::new();
    let players = spec
        .ally_teams
        .iter()
        .flat_map(|ally| ally.teams.iter())
        .flat_map(|team| team.players.iter())
        .chain(spec.spectators.iter());
    for player in players {
        identities.push(PlayerIdentity {
            user_id: player.user_id.clone(),
            name: player.name.clone(),
            player_number: identities.len() as u8,
        });
    }
    identities
}

fn check_value(key: &str, value: &str) -> Result<(), ScriptError> {
    let bad = value
        .chars()
        .any(|c| matches!(c, ';' | '{' | '}' | '[' | ']' | '\n' | '\r'));
    if bad {
        return Err(ScriptError::BadValue {
            key: key.to_string(),
        });
    }
    Ok(())
}

fn write_entry(out: &mut String, indent: &str, key: &str, value: &str) -> Result<(), ScriptError> {
    check_value(key, value)?;
    let _ = writeln!(out, "{indent}{key}={value};");
    Ok(())
}

fn write_player(
    out: &mut String,
    number: usize,
    player: &PlayerSpec,
    team: Option<usize>,
) -> Result<(), ScriptError> {
    let _ = writeln!(out, "\t[player{number}]\n\t{{");
    write_entry(out, "\t\t", "name", &player.name)?;
    write_entry(out, "\t\t", "userid", &player.user_id)?;
    write_entry(out, "\t\t", "password", &player.password)?;
    match team {
        Some(team) => write_entry(out, "\t\t", "team", &team.to_string())?,
        None => write_entry(out, "\t\t", "spectator", "1")?,
    }
    let _ = writeln!(out, "\t}}");
    Ok(())
}

fn write_section(
    out: &mut String,
    name: &str,
    options: &BTreeMap<String, String>,
) -> Result<(), ScriptError> {
    if options.is_empty() {
        return Ok(());
    }
    let _ = writeln!(out, "\t[{name}]\n\t{{");
    for (key, value) in options {
        check_value(key, key)?;
        write_entry(out, "\t\t", key, value)?;
    }
    let _ = writeln!(out, "\t}}");
    Ok(())
}

/// Render the full start script for one battle.
pub fn render(
    spec: &StartScriptSpec,
    host_ip: &str,
    host_port: u16,
    autohost_port: u16,
) -> Result<String, ScriptError> {
    let mut out = String::new();
    let _ = writeln!(out, "[game]\n{{");

    let mut player_number = 0usize;
    let mut team_number = 0usize;
    for (ally_number, ally) in spec.ally_teams.iter().enumerate() {
        let _ = writeln!(out, "\t[allyteam{ally_number}]\n\t{{");
        write_entry(&mut out, "\t\t", "numallies", "0")?;
        let _ = writeln!(out, "\t}}");

        for team in &ally.teams {
            let _ = writeln!(out, "\t[team{team_number}]\n\t{{");
            write_entry(&mut out, "\t\t", "allyteam", &ally_number.to_string())?;
            write_entry(&mut out, "\t\t", "teamleader", &player_number.to_string())?;
            let _ = writeln!(out, "\t}}");

            for player in &team.players {
                write_player(&mut out, player_number, player, Some(team_number))?;
                player_number += 1;
            }
            team_number += 1;
        }
    }
    for spectator in &spec.spectators {
        write_player(&mut out, player_number, spectator, None)?;
        player_number += 1;
    }

    write_section(&mut out, "modoptions", &spec.game_options)?;
    write_section(&mut out, "mapoptions", &spec.map_options)?;

    write_entry(&mut out, "\t", "gametype", &spec.game_name)?;
    write_entry(&mut out, "\t", "mapname", &spec.map_name)?;
    if let Some(start_pos_type) = spec.start_pos_type {
        write_entry(&mut out, "\t", "startpostype", &start_pos_type.to_string())?;
    }
    write_entry(&mut out, "\t", "ishost", "1")?;
    write_entry(&mut out, "\t", "hostip", host_ip)?;
    write_entry(&mut out, "\t", "hostport", &host_port.to_string())?;
    write_entry(&mut out, "\t", "autohostip", "127.0.0.1")?;
    write_entry(&mut out, "\t", "autohostport", &autohost_port.to_string())?;
    write_entry(&mut out, "\t", "numplayers", &player_number.to_string())?;
    write_entry(&mut out, "\t", "numteams", &team_number.to_string())?;
    write_entry(
        &mut out,
        "\t",
        "numallyteams",
        &spec.ally_teams.len().to_string(),
    )?;

    let _ = writeln!(out, "}}");
    Ok(out)
}

/// Render the settings file: the caller-supplied map with the controller's
/// mandatory overrides applied on top.
pub fn render_settings(settings: &BTreeMap<String, String>) -> String {
    let mut merged = settings.clone();
    // Anonymous spectators must not be able to join, and the controller must
    // be able to add players after start.
    merged.insert("WhitelistSpectators".to_string(), "1".to_string());
    merged.insert("AllowAdditionalPlayers".to_string(), "1".to_string());

    let mut out = String::new();
    for (key, value) in &merged {
        let _ = writeln!(out, "{key} = {value}");
    }
    out
}
