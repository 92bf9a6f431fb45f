// Wire codec for the engine's autohost UDP channel.
//
// Inbound datagrams are binary, little-endian, type byte first. Outbound
// messages are plain UTF-8 byte strings (chat text or `/command arg...`).
// Both directions are pure and synchronous.

use crate::domain::events::{
    ChatDestination, EngineEvent, LeaveReason, LuaScript, LuaUiMode, TeamStatistics,
};
use byteorder::{LittleEndian, ReadBytesExt};
use std::fmt;

const SERVER_STARTED: u8 = 0;
const SERVER_QUIT: u8 = 1;
const SERVER_STARTPLAYING: u8 = 2;
const SERVER_GAMEOVER: u8 = 3;
const SERVER_MESSAGE: u8 = 4;
const SERVER_WARNING: u8 = 5;
const PLAYER_JOINED: u8 = 10;
const PLAYER_LEFT: u8 = 11;
const PLAYER_READY: u8 = 12;
const PLAYER_CHAT: u8 = 13;
const PLAYER_DEFEATED: u8 = 14;
const GAME_LUAMSG: u8 = 20;
const GAME_TEAMSTAT: u8 = 60;

const LUAMSG_MAGIC: u8 = 50;
const LUA_SCRIPT_UI: u16 = 2000;
const LUA_SCRIPT_GAIA: u16 = 300;
const LUA_SCRIPT_RULES: u16 = 100;

const CHAT_DEST_ALLIES: u8 = 252;
const CHAT_DEST_SPECTATORS: u8 = 253;
const CHAT_DEST_ALL: u8 = 254;

const TEAMSTAT_LEN: usize = 82;
const MAX_CHAT_BYTES: usize = 127;

/// Why a datagram failed to decode. Never fatal: the runner logs the error
/// and drops the datagram.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeError {
    Empty,
    UnknownType(u8),
    /// The datagram length does not satisfy the variant's layout.
    BadLength { packet_type: u8, len: usize },
    /// An embedded size field disagrees with the datagram length.
    SizeMismatch { packet_type: u8, declared: usize, len: usize },
    /// An enum-coded field is outside its allowed range.
    BadEnum { packet_type: u8, field: &'static str, value: u16 },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Empty => f.write_str("empty datagram"),
            DecodeError::UnknownType(t) => write!(f, "unknown packet type {t}"),
            DecodeError::BadLength { packet_type, len } => {
                write!(f, "bad length {len} for packet type {packet_type}")
            }
            DecodeError::SizeMismatch {
                packet_type,
                declared,
                len,
            } => write!(
                f,
                "size field {declared} does not match datagram length {len} for packet type {packet_type}"
            ),
            DecodeError::BadEnum {
                packet_type,
                field,
                value,
            } => write!(
                f,
                "out-of-range {field} value {value} for packet type {packet_type}"
            ),
        }
    }
}

/// Why an outbound message could not be serialized.
#[derive(Debug, PartialEq, Eq)]
pub enum SerializeError {
    /// Chat text exceeds the engine's 127-byte limit.
    MessageTooLong { len: usize },
    /// Command name does not match `[a-z0-9_-]+`.
    BadCommandName(String),
    /// An argument is empty or contains a forbidden sequence.
    BadArgument { index: usize, details: &'static str },
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializeError::MessageTooLong { len } => {
                write!(f, "chat message of {len} bytes exceeds {MAX_CHAT_BYTES}")
            }
            SerializeError::BadCommandName(name) => write!(f, "bad command name {name:?}"),
            SerializeError::BadArgument { index, details } => {
                write!(f, "bad command argument at index {index}: {details}")
            }
        }
    }
}

fn text_from(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Decode one UDP datagram into an [`EngineEvent`].
pub fn decode(data: &[u8]) -> Result<EngineEvent, DecodeError> {
    let packet_type = *data.first().ok_or(DecodeError::Empty)?;
    let len = data.len();
    let bad_length = || DecodeError::BadLength { packet_type, len };

    match packet_type {
        SERVER_STARTED => {
            if len != 1 {
                return Err(bad_length());
            }
            Ok(EngineEvent::ServerStarted)
        }
        SERVER_QUIT => {
            if len != 1 {
                return Err(bad_length());
            }
            Ok(EngineEvent::ServerQuit)
        }
        SERVER_STARTPLAYING => {
            if len < 21 {
                return Err(bad_length());
            }
            let mut body = &data[1..];
            let declared = body
                .read_u32::<LittleEndian>()
                .map_err(|_| bad_length())? as usize;
            if declared != len {
                return Err(DecodeError::SizeMismatch {
                    packet_type,
                    declared,
                    len,
                });
            }
            let mut game_id = [0u8; 16];
            game_id.copy_from_slice(&data[5..21]);
            Ok(EngineEvent::ServerStartPlaying {
                game_id,
                demo_path: text_from(&data[21..]),
            })
        }
        SERVER_GAMEOVER => {
            if len < 3 {
                return Err(bad_length());
            }
            let declared = data[1] as usize;
            if declared != len {
                return Err(DecodeError::SizeMismatch {
                    packet_type,
                    declared,
                    len,
                });
            }
            Ok(EngineEvent::ServerGameOver {
                player: data[2],
                winning_ally_teams: data[3..].to_vec(),
            })
        }
        SERVER_MESSAGE => Ok(EngineEvent::ServerMessage {
            message: text_from(&data[1..]),
        }),
        SERVER_WARNING => Ok(EngineEvent::ServerWarning {
            message: text_from(&data[1..]),
        }),
        PLAYER_JOINED => {
            if len < 3 {
                return Err(bad_length());
            }
            Ok(EngineEvent::PlayerJoined {
                player: data[1],
                name: text_from(&data[2..]),
            })
        }
        PLAYER_LEFT => {
            if len != 3 {
                return Err(bad_length());
            }
            let reason = LeaveReason::from_wire(data[2]).ok_or(DecodeError::BadEnum {
                packet_type,
                field: "reason",
                value: data[2] as u16,
            })?;
            Ok(EngineEvent::PlayerLeft {
                player: data[1],
                reason,
            })
        }
        PLAYER_READY => {
            if len != 3 {
                return Err(bad_length());
            }
            if data[2] > 3 {
                return Err(DecodeError::BadEnum {
                    packet_type,
                    field: "state",
                    value: data[2] as u16,
                });
            }
            Ok(EngineEvent::PlayerReady {
                player: data[1],
                state: data[2],
            })
        }
        PLAYER_CHAT => {
            if len < 3 {
                return Err(bad_length());
            }
            let destination = match data[2] {
                CHAT_DEST_ALLIES => ChatDestination::Allies,
                CHAT_DEST_SPECTATORS => ChatDestination::Spectators,
                CHAT_DEST_ALL => ChatDestination::All,
                to @ 0..=251 => ChatDestination::Player(to),
                other => {
                    return Err(DecodeError::BadEnum {
                        packet_type,
                        field: "destination",
                        value: other as u16,
                    });
                }
            };
            Ok(EngineEvent::PlayerChat {
                from: data[1],
                destination,
                message: text_from(&data[3..]),
            })
        }
        PLAYER_DEFEATED => {
            if len != 2 {
                return Err(bad_length());
            }
            Ok(EngineEvent::PlayerDefeated { player: data[1] })
        }
        GAME_LUAMSG => decode_luamsg(data),
        GAME_TEAMSTAT => decode_teamstat(data),
        other => Err(DecodeError::UnknownType(other)),
    }
}

fn decode_luamsg(data: &[u8]) -> Result<EngineEvent, DecodeError> {
    let packet_type = GAME_LUAMSG;
    let len = data.len();
    // type + magic + innerSize(u16) + player + script(u16) + uiMode
    if len < 8 {
        return Err(DecodeError::BadLength { packet_type, len });
    }
    if data[1] != LUAMSG_MAGIC {
        return Err(DecodeError::BadEnum {
            packet_type,
            field: "magic",
            value: data[1] as u16,
        });
    }
    let mut body = &data[2..];
    let inner_size = body
        .read_u16::<LittleEndian>()
        .map_err(|_| DecodeError::BadLength { packet_type, len })? as usize;
    if inner_size != len - 1 {
        return Err(DecodeError::SizeMismatch {
            packet_type,
            declared: inner_size,
            len,
        });
    }
    let player = data[4];
    let script_raw = u16::from_le_bytes([data[5], data[6]]);
    let script = match script_raw {
        LUA_SCRIPT_UI => LuaScript::Ui,
        LUA_SCRIPT_GAIA => LuaScript::Gaia,
        LUA_SCRIPT_RULES => LuaScript::Rules,
        other => {
            return Err(DecodeError::BadEnum {
                packet_type,
                field: "script",
                value: other,
            });
        }
    };
    let ui_mode_raw = data[7];
    let ui_mode = match (script, ui_mode_raw) {
        (LuaScript::Ui, 0) => Some(LuaUiMode::All),
        (LuaScript::Ui, b'a') => Some(LuaUiMode::Allies),
        (LuaScript::Ui, b's') => Some(LuaUiMode::Spectators),
        (LuaScript::Ui, other) => {
            return Err(DecodeError::BadEnum {
                packet_type,
                field: "uiMode",
                value: other as u16,
            });
        }
        (_, 0) => None,
        (_, other) => {
            return Err(DecodeError::BadEnum {
                packet_type,
                field: "uiMode",
                value: other as u16,
            });
        }
    };
    Ok(EngineEvent::GameLuaMsg {
        player,
        script,
        ui_mode,
        data: data[8..].to_vec(),
    })
}

fn decode_teamstat(data: &[u8]) -> Result<EngineEvent, DecodeError> {
    let len = data.len();
    if len != TEAMSTAT_LEN {
        return Err(DecodeError::BadLength {
            packet_type: GAME_TEAMSTAT,
            len,
        });
    }
    let team = data[1];
    let mut body = &data[2..];
    // The reads below cannot fail on an 82-byte datagram; map anyway so a
    // layout change fails loudly instead of panicking.
    let bad = |_| DecodeError::BadLength {
        packet_type: GAME_TEAMSTAT,
        len,
    };
    let stats = TeamStatistics {
        frame: body.read_i32::<LittleEndian>().map_err(bad)?,
        metal_used: body.read_f32::<LittleEndian>().map_err(bad)?,
        energy_used: body.read_f32::<LittleEndian>().map_err(bad)?,
        metal_produced: body.read_f32::<LittleEndian>().map_err(bad)?,
        energy_produced: body.read_f32::<LittleEndian>().map_err(bad)?,
        metal_excess: body.read_f32::<LittleEndian>().map_err(bad)?,
        energy_excess: body.read_f32::<LittleEndian>().map_err(bad)?,
        metal_received: body.read_f32::<LittleEndian>().map_err(bad)?,
        energy_received: body.read_f32::<LittleEndian>().map_err(bad)?,
        metal_sent: body.read_f32::<LittleEndian>().map_err(bad)?,
        energy_sent: body.read_f32::<LittleEndian>().map_err(bad)?,
        damage_dealt: body.read_f32::<LittleEndian>().map_err(bad)?,
        damage_received: body.read_f32::<LittleEndian>().map_err(bad)?,
        units_produced: body.read_i32::<LittleEndian>().map_err(bad)?,
        units_died: body.read_i32::<LittleEndian>().map_err(bad)?,
        units_received: body.read_i32::<LittleEndian>().map_err(bad)?,
        units_sent: body.read_i32::<LittleEndian>().map_err(bad)?,
        units_captured: body.read_i32::<LittleEndian>().map_err(bad)?,
        units_out_captured: body.read_i32::<LittleEndian>().map_err(bad)?,
        units_killed: body.read_i32::<LittleEndian>().map_err(bad)?,
    };
    Ok(EngineEvent::GameTeamStat { team, stats })
}

/// Serialize a chat line for the engine.
///
/// A leading `/` is doubled so the text cannot be mistaken for a command.
pub fn chat_message(text: &str) -> Result<Vec<u8>, SerializeError> {
    if text.len() > MAX_CHAT_BYTES {
        return Err(SerializeError::MessageTooLong { len: text.len() });
    }
    if text.starts_with('/') {
        let mut out = Vec::with_capacity(text.len() + 1);
        out.push(b'/');
        out.extend_from_slice(text.as_bytes());
        Ok(out)
    } else {
        Ok(text.as_bytes().to_vec())
    }
}

fn valid_command_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// Serialize `/name arg...` for the engine.
///
/// Arguments are space-joined, so whitespace inside an argument would change
/// how the engine splits the line; no argument may be empty, contain
/// whitespace, or contain `//`.
pub fn command(name: &str, args: &[&str]) -> Result<Vec<u8>, SerializeError> {
    if !valid_command_name(name) {
        return Err(SerializeError::BadCommandName(name.to_string()));
    }

    for (index, arg) in args.iter().enumerate() {
        if arg.is_empty() {
            return Err(SerializeError::BadArgument {
                index,
                details: "empty argument",
            });
        }
        if arg.contains("//") {
            return Err(SerializeError::BadArgument {
                index,
                details: "argument contains //",
            });
        }
        if arg.contains(' ') || arg.contains('\t') {
            return Err(SerializeError::BadArgument {
                index,
                details: "argument contains whitespace",
            });
        }
    }

    let mut out = String::with_capacity(name.len() + 1);
    out.push('/');
    out.push_str(name);
    for arg in args {
        out.push(' ');
        out.push_str(arg);
    }
    Ok(out.into_bytes())
}
