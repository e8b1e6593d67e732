//! Server and station configuration.
//!
//! Both configs are plain structs with defaults; the binaries build them
//! from the process environment with `from_env`.
//!
//! | variable                       | default               |
//! |--------------------------------|-----------------------|
//! | `PORT`                         | 5000                  |
//! | `NUMCALL_HOST`                 | 0.0.0.0               |
//! | `NUMCALL_CORS_ORIGIN`          | `*`                   |
//! | `NUMCALL_RECOVERY_WINDOW_SECS` | 120                   |
//! | `NUMCALL_REPLAY_CAPACITY`      | 256                   |
//! | `NUMCALL_BROADCAST_CAPACITY`   | 256                   |
//! | `NUMCALL_SERVER_URL`           | ws://127.0.0.1:5000   |
//! | `NUMCALL_REPEAT_MINUTES`       | 5                     |
//! | `NUMCALL_DELETE_BY`            | id                    |
//! | `NUMCALL_TTS_COMMAND`          | unset (log only)      |

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::reconciler::DeleteAddressing;

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_REPEAT_MINUTES: u32 = 5;
pub const MIN_REPEAT_MINUTES: u32 = 1;

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set but unusable
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    /// Repeat interval below the one-minute floor
    IntervalTooShort(u32),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid { key, value, reason } => {
                write!(f, "Invalid {key}={value:?}: {reason}")
            }
            Self::IntervalTooShort(m) => {
                write!(f, "Repeat interval must be at least {MIN_REPEAT_MINUTES} minute(s), got {m}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Which browser origins may open a WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OriginPolicy {
    #[default]
    Any,
    AllowList(Vec<String>),
}

impl OriginPolicy {
    pub fn allows(&self, origin: &str) -> bool {
        match self {
            Self::Any => true,
            Self::AllowList(list) => list.iter().any(|o| o.eq_ignore_ascii_case(origin)),
        }
    }
}

impl FromStr for OriginPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "*" {
            return Ok(Self::Any);
        }
        let list: Vec<String> = s
            .split(',')
            .map(|o| o.trim().trim_end_matches('/').to_string())
            .filter(|o| !o.is_empty())
            .collect();
        if list.is_empty() {
            return Err("expected `*` or a comma-separated origin list".into());
        }
        Ok(Self::AllowList(list))
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity (events buffered per connection)
    pub broadcast_capacity: usize,
    /// How long a disconnected session stays resumable
    pub recovery_window: Duration,
    /// Max events buffered per detached session
    pub replay_capacity: usize,
    pub origin_policy: OriginPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
            broadcast_capacity: 256,
            recovery_window: Duration::from_secs(120),
            replay_capacity: 256,
            origin_policy: OriginPolicy::Any,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let port: u16 = parse_var(&lookup, "PORT")?.unwrap_or(DEFAULT_PORT);
        let host = lookup("NUMCALL_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let recovery_secs: Option<u64> = parse_var(&lookup, "NUMCALL_RECOVERY_WINDOW_SECS")?;

        Ok(Self {
            bind_addr: format!("{host}:{port}"),
            broadcast_capacity: positive(&lookup, "NUMCALL_BROADCAST_CAPACITY")?
                .unwrap_or(defaults.broadcast_capacity),
            recovery_window: recovery_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.recovery_window),
            replay_capacity: positive(&lookup, "NUMCALL_REPLAY_CAPACITY")?
                .unwrap_or(defaults.replay_capacity),
            origin_policy: parse_var(&lookup, "NUMCALL_CORS_ORIGIN")?.unwrap_or_default(),
        })
    }
}

/// Client station configuration.
#[derive(Debug, Clone)]
pub struct StationConfig {
    /// Server URL without query, e.g. `ws://127.0.0.1:5000`
    pub server_url: String,
    /// Periodic announcement interval in minutes (>= 1)
    pub repeat_minutes: u32,
    pub delete_by: DeleteAddressing,
    /// Start muted
    pub muted: bool,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub connect_timeout: Duration,
    /// External TTS program; `None` logs instead of speaking
    pub tts_command: Option<String>,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            server_url: format!("ws://127.0.0.1:{DEFAULT_PORT}"),
            repeat_minutes: DEFAULT_REPEAT_MINUTES,
            delete_by: DeleteAddressing::Identifier,
            muted: false,
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            tts_command: None,
        }
    }
}

impl StationConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let repeat_minutes = match parse_var::<u32>(&lookup, "NUMCALL_REPEAT_MINUTES")? {
            Some(m) => repeat_interval(m).map(|_| m)?,
            None => defaults.repeat_minutes,
        };

        Ok(Self {
            server_url: lookup("NUMCALL_SERVER_URL").unwrap_or(defaults.server_url),
            repeat_minutes,
            delete_by: parse_var(&lookup, "NUMCALL_DELETE_BY")?.unwrap_or(defaults.delete_by),
            tts_command: lookup("NUMCALL_TTS_COMMAND").filter(|c| !c.trim().is_empty()),
            ..defaults
        })
    }
}

/// Convert a minutes setting into a timer period, enforcing the floor.
pub fn repeat_interval(minutes: u32) -> Result<Duration, ConfigError> {
    if minutes < MIN_REPEAT_MINUTES {
        return Err(ConfigError::IntervalTooShort(minutes));
    }
    Ok(Duration::from_secs(u64::from(minutes) * 60))
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

fn positive(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<usize>, ConfigError> {
    match parse_var::<usize>(lookup, key)? {
        Some(0) => Err(ConfigError::Invalid {
            key,
            value: "0".into(),
            reason: "must be greater than zero".into(),
        }),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::from_lookup(vars(&[])).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:5000");
        assert_eq!(config.recovery_window, Duration::from_secs(120));
        assert_eq!(config.replay_capacity, 256);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.origin_policy, OriginPolicy::Any);
    }

    #[test]
    fn test_server_config_from_env_vars() {
        let config = ServerConfig::from_lookup(vars(&[
            ("PORT", "8080"),
            ("NUMCALL_HOST", "127.0.0.1"),
            ("NUMCALL_RECOVERY_WINDOW_SECS", "30"),
            ("NUMCALL_REPLAY_CAPACITY", "8"),
            ("NUMCALL_CORS_ORIGIN", "https://a.example, https://b.example/"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.recovery_window, Duration::from_secs(30));
        assert_eq!(config.replay_capacity, 8);
        assert!(config.origin_policy.allows("https://b.example"));
        assert!(!config.origin_policy.allows("https://evil.example"));
    }

    #[test]
    fn test_server_config_rejects_bad_values() {
        let err = ServerConfig::from_lookup(vars(&[("PORT", "http")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PORT", .. }));

        let err =
            ServerConfig::from_lookup(vars(&[("NUMCALL_REPLAY_CAPACITY", "0")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "NUMCALL_REPLAY_CAPACITY",
                ..
            }
        ));

        assert!(ServerConfig::from_lookup(vars(&[("NUMCALL_CORS_ORIGIN", " , ")])).is_err());
    }

    #[test]
    fn test_origin_policy() {
        assert!(OriginPolicy::Any.allows("http://anything"));
        let policy: OriginPolicy = "http://localhost:3000".parse().unwrap();
        assert!(policy.allows("http://LOCALHOST:3000"));
        assert!(!policy.allows("http://localhost:3001"));
        assert_eq!("*".parse::<OriginPolicy>().unwrap(), OriginPolicy::Any);
    }

    #[test]
    fn test_station_config() {
        let config = StationConfig::from_lookup(vars(&[])).unwrap();
        assert_eq!(config.repeat_minutes, 5);
        assert_eq!(config.delete_by, DeleteAddressing::Identifier);
        assert!(config.tts_command.is_none());

        let config = StationConfig::from_lookup(vars(&[
            ("NUMCALL_SERVER_URL", "ws://10.0.0.2:5000"),
            ("NUMCALL_REPEAT_MINUTES", "2"),
            ("NUMCALL_DELETE_BY", "position"),
            ("NUMCALL_TTS_COMMAND", "espeak"),
        ]))
        .unwrap();
        assert_eq!(config.server_url, "ws://10.0.0.2:5000");
        assert_eq!(config.repeat_minutes, 2);
        assert_eq!(config.delete_by, DeleteAddressing::Position);
        assert_eq!(config.tts_command.as_deref(), Some("espeak"));
    }

    #[test]
    fn test_repeat_interval_floor() {
        assert_eq!(repeat_interval(1).unwrap(), Duration::from_secs(60));
        assert_eq!(repeat_interval(0), Err(ConfigError::IntervalTooShort(0)));
        assert!(StationConfig::from_lookup(vars(&[("NUMCALL_REPEAT_MINUTES", "0")])).is_err());
    }
}
