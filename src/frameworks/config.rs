// Startup configuration: a TOML file with per-option environment overrides.
// Invalid configuration is fatal.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "autohost.toml";
pub const CONFIG_PATH_ENV: &str = "AUTOHOST_CONFIG";

#[derive(Debug)]
pub enum ConfigError {
    Read { path: String, details: String },
    Parse { path: String, details: String },
    Missing { option: &'static str },
    Invalid { option: &'static str, details: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, details } => {
                write!(f, "cannot read config file {path:?}: {details}")
            }
            ConfigError::Parse { path, details } => {
                write!(f, "cannot parse config file {path:?}: {details}")
            }
            ConfigError::Missing { option } => write!(f, "missing required option {option}"),
            ConfigError::Invalid { option, details } => {
                write!(f, "invalid option {option}: {details}")
            }
        }
    }
}

/// Raw file shape; every option is optional here so environment overrides
/// and defaults can be applied uniformly afterwards.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawConfig {
    tachyon_server: Option<String>,
    tachyon_server_port: Option<u16>,
    use_secure_connection: Option<bool>,
    auth_client_id: Option<String>,
    auth_client_secret: Option<String>,
    hosting_ip: Option<String>,
    engine_bind_ip: Option<String>,
    max_reconnect_delay_seconds: Option<u64>,
    engine_settings: Option<BTreeMap<String, String>>,
    max_battles: Option<usize>,
    max_updates_subscription_age_seconds: Option<u64>,
    engine_start_port: Option<u16>,
    engine_autohost_start_port: Option<u16>,
    max_ports_used: Option<u16>,
    engine_install_timeout_seconds: Option<u64>,
    engine_download_max_attempts: Option<u32>,
    engine_download_retry_backoff_base_ms: Option<u64>,
    engine_cdn_base_url: Option<String>,
    max_game_duration_seconds: Option<u64>,
    engines_dir: Option<String>,
    instances_dir: Option<String>,
}

/// Fully resolved and validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub tachyon_server: String,
    pub tachyon_server_port: Option<u16>,
    pub use_secure_connection: bool,
    pub auth_client_id: String,
    pub auth_client_secret: String,
    pub hosting_ip: String,
    pub engine_bind_ip: String,
    pub max_reconnect_delay: Duration,
    pub engine_settings: BTreeMap<String, String>,
    pub max_battles: usize,
    pub max_updates_subscription_age: Duration,
    pub engine_start_port: u16,
    pub engine_autohost_start_port: u16,
    pub max_ports_used: u16,
    pub engine_install_timeout: Duration,
    pub engine_download_max_attempts: u32,
    pub engine_download_retry_backoff_base: Duration,
    pub engine_cdn_base_url: String,
    pub max_game_duration: Duration,
    pub engines_dir: PathBuf,
    pub instances_dir: PathBuf,
}

/// Load from the default path (or `AUTOHOST_CONFIG`) with `AUTOHOST_*`
/// environment overrides.
pub fn load() -> Result<Config, ConfigError> {
    let path =
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let raw = if std::path::Path::new(&path).exists() {
        let contents = std::fs::read_to_string(&path).map_err(|e| ConfigError::Read {
            path: path.clone(),
            details: e.to_string(),
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.clone(),
            details: e.to_string(),
        })?
    } else {
        RawConfig::default()
    };
    resolve(raw, &|key| std::env::var(key).ok())
}

fn resolve(
    raw: RawConfig,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<Config, ConfigError> {
    let tachyon_server = string_option(env, "AUTOHOST_TACHYON_SERVER", raw.tachyon_server)
        .ok_or(ConfigError::Missing {
            option: "tachyonServer",
        })?;

    let config = Config {
        use_secure_connection: parse_option(
            env,
            "AUTOHOST_USE_SECURE_CONNECTION",
            "useSecureConnection",
            raw.use_secure_connection,
        )?
        // Local development against a lobby on the same machine is the one
        // place plaintext is the sane default.
        .unwrap_or(tachyon_server != "localhost"),
        tachyon_server_port: parse_option(
            env,
            "AUTOHOST_TACHYON_SERVER_PORT",
            "tachyonServerPort",
            raw.tachyon_server_port,
        )?,
        auth_client_id: string_option(env, "AUTOHOST_AUTH_CLIENT_ID", raw.auth_client_id)
            .ok_or(ConfigError::Missing {
                option: "authClientId",
            })?,
        auth_client_secret:
            string_option(env, "AUTOHOST_AUTH_CLIENT_SECRET", raw.auth_client_secret).ok_or(
                ConfigError::Missing {
                    option: "authClientSecret",
                },
            )?,
        hosting_ip: string_option(env, "AUTOHOST_HOSTING_IP", raw.hosting_ip).ok_or(
            ConfigError::Missing {
                option: "hostingIP",
            },
        )?,
        engine_bind_ip: string_option(env, "AUTOHOST_ENGINE_BIND_IP", raw.engine_bind_ip)
            .unwrap_or_else(|| "0.0.0.0".to_string()),
        max_reconnect_delay: Duration::from_secs(
            parse_option(
                env,
                "AUTOHOST_MAX_RECONNECT_DELAY_SECONDS",
                "maxReconnectDelaySeconds",
                raw.max_reconnect_delay_seconds,
            )?
            .unwrap_or(30),
        ),
        engine_settings: raw.engine_settings.unwrap_or_default(),
        max_battles: parse_option(env, "AUTOHOST_MAX_BATTLES", "maxBattles", raw.max_battles)?
            .unwrap_or(50),
        max_updates_subscription_age: Duration::from_secs(
            parse_option(
                env,
                "AUTOHOST_MAX_UPDATES_SUBSCRIPTION_AGE_SECONDS",
                "maxUpdatesSubscriptionAgeSeconds",
                raw.max_updates_subscription_age_seconds,
            )?
            .unwrap_or(600),
        ),
        engine_start_port: parse_option(
            env,
            "AUTOHOST_ENGINE_START_PORT",
            "engineStartPort",
            raw.engine_start_port,
        )?
        .unwrap_or(20000),
        engine_autohost_start_port: parse_option(
            env,
            "AUTOHOST_ENGINE_AUTOHOST_START_PORT",
            "engineAutohostStartPort",
            raw.engine_autohost_start_port,
        )?
        .unwrap_or(22000),
        max_ports_used: parse_option(
            env,
            "AUTOHOST_MAX_PORTS_USED",
            "maxPortsUsed",
            raw.max_ports_used,
        )?
        .unwrap_or(1000),
        engine_install_timeout: Duration::from_secs(
            parse_option(
                env,
                "AUTOHOST_ENGINE_INSTALL_TIMEOUT_SECONDS",
                "engineInstallTimeoutSeconds",
                raw.engine_install_timeout_seconds,
            )?
            .unwrap_or(600),
        ),
        engine_download_max_attempts: parse_option(
            env,
            "AUTOHOST_ENGINE_DOWNLOAD_MAX_ATTEMPTS",
            "engineDownloadMaxAttempts",
            raw.engine_download_max_attempts,
        )?
        .unwrap_or(3),
        engine_download_retry_backoff_base: Duration::from_millis(
            parse_option(
                env,
                "AUTOHOST_ENGINE_DOWNLOAD_RETRY_BACKOFF_BASE_MS",
                "engineDownloadRetryBackoffBaseMs",
                raw.engine_download_retry_backoff_base_ms,
            )?
            .unwrap_or(1000),
        ),
        engine_cdn_base_url: string_option(
            env,
            "AUTOHOST_ENGINE_CDN_BASE_URL",
            raw.engine_cdn_base_url,
        )
        .unwrap_or_else(|| "https://files-cdn.beyondallreason.dev".to_string()),
        max_game_duration: Duration::from_secs(
            parse_option(
                env,
                "AUTOHOST_MAX_GAME_DURATION_SECONDS",
                "maxGameDurationSeconds",
                raw.max_game_duration_seconds,
            )?
            .unwrap_or(28800),
        ),
        engines_dir: PathBuf::from(
            string_option(env, "AUTOHOST_ENGINES_DIR", raw.engines_dir)
                .unwrap_or_else(|| "engines".to_string()),
        ),
        instances_dir: PathBuf::from(
            string_option(env, "AUTOHOST_INSTANCES_DIR", raw.instances_dir)
                .unwrap_or_else(|| "instances".to_string()),
        ),
        tachyon_server,
    };

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    config
        .hosting_ip
        .parse::<Ipv4Addr>()
        .map_err(|_| ConfigError::Invalid {
            option: "hostingIP",
            details: format!("{:?} is not an IPv4 address", config.hosting_ip),
        })?;

    if config.max_ports_used == 0 {
        return Err(ConfigError::Invalid {
            option: "maxPortsUsed",
            details: "must be at least 1".to_string(),
        });
    }

    for (option, start) in [
        ("engineStartPort", config.engine_start_port),
        ("engineAutohostStartPort", config.engine_autohost_start_port),
    ] {
        if u32::from(start) + u32::from(config.max_ports_used) - 1 > u32::from(u16::MAX) {
            return Err(ConfigError::Invalid {
                option,
                details: format!(
                    "range [{start}, {start}+{}) exceeds the port space",
                    config.max_ports_used
                ),
            });
        }
    }

    // Both ranges hand out one port per offset; overlap would double-book.
    let battle = config.engine_start_port;
    let autohost = config.engine_autohost_start_port;
    let span = config.max_ports_used;
    let overlap = battle < autohost + span && autohost < battle + span;
    if overlap {
        return Err(ConfigError::Invalid {
            option: "engineAutohostStartPort",
            details: format!(
                "autohost port range overlaps the battle port range \
                 ([{battle}, {battle}+{span}) vs [{autohost}, {autohost}+{span}))"
            ),
        });
    }
    Ok(())
}

fn string_option(
    env: &dyn Fn(&str) -> Option<String>,
    env_key: &str,
    file_value: Option<String>,
) -> Option<String> {
    env(env_key).filter(|v| !v.is_empty()).or(file_value)
}

fn parse_option<T: FromStr + Copy>(
    env: &dyn Fn(&str) -> Option<String>,
    env_key: &'static str,
    option: &'static str,
    file_value: Option<T>,
) -> Result<Option<T>, ConfigError> {
    match env(env_key) {
        Some(value) if !value.is_empty() => {
            value.parse::<T>().map(Some).map_err(|_| ConfigError::Invalid {
                option,
                details: format!("cannot parse {value:?} (from {env_key})"),
            })
        }
        _ => Ok(file_value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn minimal_raw() -> RawConfig {
        RawConfig {
            tachyon_server: Some("lobby.example.com".to_string()),
            auth_client_id: Some("client".to_string()),
            auth_client_secret: Some("secret".to_string()),
            hosting_ip: Some("203.0.113.7".to_string()),
            ..RawConfig::default()
        }
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let config = resolve(minimal_raw(), &no_env).unwrap();
        assert!(config.use_secure_connection);
        assert_eq!(config.engine_bind_ip, "0.0.0.0");
        assert_eq!(config.max_reconnect_delay, Duration::from_secs(30));
        assert_eq!(config.max_battles, 50);
        assert_eq!(
            config.max_updates_subscription_age,
            Duration::from_secs(600)
        );
        assert_eq!(config.engine_start_port, 20000);
        assert_eq!(config.engine_autohost_start_port, 22000);
        assert_eq!(config.max_ports_used, 1000);
        assert_eq!(config.engine_install_timeout, Duration::from_secs(600));
        assert_eq!(config.engine_download_max_attempts, 3);
        assert_eq!(
            config.engine_download_retry_backoff_base,
            Duration::from_millis(1000)
        );
        assert_eq!(config.max_game_duration, Duration::from_secs(28800));
        assert_eq!(config.engines_dir, PathBuf::from("engines"));
    }

    #[test]
    fn localhost_defaults_to_plaintext() {
        let mut raw = minimal_raw();
        raw.tachyon_server = Some("localhost".to_string());
        let config = resolve(raw, &no_env).unwrap();
        assert!(!config.use_secure_connection);

        // An explicit setting still wins.
        let mut raw = minimal_raw();
        raw.tachyon_server = Some("localhost".to_string());
        raw.use_secure_connection = Some(true);
        let config = resolve(raw, &no_env).unwrap();
        assert!(config.use_secure_connection);
    }

    #[test]
    fn missing_required_options_fail() {
        let mut raw = minimal_raw();
        raw.auth_client_secret = None;
        assert!(matches!(
            resolve(raw, &no_env),
            Err(ConfigError::Missing {
                option: "authClientSecret"
            })
        ));
    }

    #[test]
    fn bad_hosting_ip_fails() {
        let mut raw = minimal_raw();
        raw.hosting_ip = Some("not-an-ip".to_string());
        assert!(matches!(
            resolve(raw, &no_env),
            Err(ConfigError::Invalid {
                option: "hostingIP",
                ..
            })
        ));
    }

    #[test]
    fn overlapping_port_ranges_fail() {
        let mut raw = minimal_raw();
        raw.engine_start_port = Some(20000);
        raw.engine_autohost_start_port = Some(20500);
        raw.max_ports_used = Some(1000);
        assert!(matches!(
            resolve(raw, &no_env),
            Err(ConfigError::Invalid {
                option: "engineAutohostStartPort",
                ..
            })
        ));
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let env = |key: &str| match key {
            "AUTOHOST_MAX_BATTLES" => Some("3".to_string()),
            "AUTOHOST_TACHYON_SERVER" => Some("other.example.com".to_string()),
            _ => None,
        };
        let config = resolve(minimal_raw(), &env).unwrap();
        assert_eq!(config.max_battles, 3);
        assert_eq!(config.tachyon_server, "other.example.com");
    }

    #[test]
    fn unparsable_env_override_fails() {
        let env = |key: &str| match key {
            "AUTOHOST_MAX_BATTLES" => Some("lots".to_string()),
            _ => None,
        };
        assert!(matches!(
            resolve(minimal_raw(), &env),
            Err(ConfigError::Invalid {
                option: "maxBattles",
                ..
            })
        ));
    }
}
