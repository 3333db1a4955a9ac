//! Configuration
//!
//! Environment-driven runtime configuration. Values are read once at
//! startup; parse failures fall back to defaults with a note on
//! stderr, since logging is not up yet when this runs.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::game::engine::EngineConfig;
use crate::network::server::ServerConfig;

/// Runtime environment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development: permissive admin surface, no self-healing.
    Development,
    /// Production: gated admin surface, self-healing on.
    Production,
    /// Test runs.
    Test,
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" => Ok(Environment::Development),
            "production" => Ok(Environment::Production),
            "test" => Ok(Environment::Test),
            other => Err(format!("unknown environment '{}'", other)),
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Environment::Development => "development",
            Environment::Production => "production",
            Environment::Test => "test",
        };
        f.write_str(name)
    }
}

/// Server configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket bind address (`PORT`).
    pub ws_bind: SocketAddr,
    /// Admin HTTP bind address (`ADMIN_PORT`, default `PORT + 1`).
    pub admin_bind: SocketAddr,
    /// Runtime environment (`APP_ENV`).
    pub environment: Environment,
    /// CORS allow-origin echoed by the admin surface (`CLIENT_URL`).
    pub client_url: String,
    /// Default racer capacity (`MAX_PLAYERS_PER_GAME`).
    pub max_players_per_game: usize,
    /// Racers required to start (`MIN_PLAYERS_TO_START`).
    pub min_players_to_start: usize,
    /// Countdown length (`COUNTDOWN_SECONDS`).
    pub countdown_seconds: u32,
    /// Race deadline (`MAX_RACE_TIME_MINUTES`, clamped 1-3).
    pub max_race_time: Duration,
    /// Finished-to-destroyed delay (`CLEANUP_DELAY_MINUTES`, clamped 3-5).
    pub cleanup_delay: Duration,
    /// Default tracing filter (`LOG_LEVEL`, overridden by `RUST_LOG`).
    pub log_level: String,
    /// Admin API key (`ADMIN_API_KEY`), required in production for the
    /// gated monitor routes.
    pub admin_api_key: Option<String>,
    /// Corpus file path (`TEXTS_PATH`).
    pub texts_path: String,
    /// Whether the self-healing controller runs (production, or
    /// `SELF_HEALING=1`).
    pub self_healing: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_bind: "0.0.0.0:8080".parse().expect("static bind address"),
            admin_bind: "0.0.0.0:8081".parse().expect("static bind address"),
            environment: Environment::Development,
            client_url: "*".to_string(),
            max_players_per_game: 4,
            min_players_to_start: 2,
            countdown_seconds: 3,
            max_race_time: Duration::from_secs(120),
            cleanup_delay: Duration::from_secs(180),
            log_level: "info".to_string(),
            admin_api_key: None,
            texts_path: "data/texts.json".to_string(),
            self_healing: false,
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                eprintln!("Ignoring unparseable {}={:?}; using default", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        let environment: Environment = env_parse("APP_ENV", Environment::Development);
        let port: u16 = env_parse("PORT", 8080);
        let admin_port: u16 = env_parse("ADMIN_PORT", port.saturating_add(1));
        let max_race_minutes: u64 = env_parse::<u64>("MAX_RACE_TIME_MINUTES", 2).clamp(1, 3);
        let cleanup_minutes: u64 = env_parse::<u64>("CLEANUP_DELAY_MINUTES", 3).clamp(3, 5);
        let self_healing = environment == Environment::Production
            || std::env::var("SELF_HEALING").map(|v| v == "1").unwrap_or(false);

        Self {
            ws_bind: SocketAddr::from(([0, 0, 0, 0], port)),
            admin_bind: SocketAddr::from(([0, 0, 0, 0], admin_port)),
            environment,
            client_url: std::env::var("CLIENT_URL").unwrap_or_else(|_| "*".to_string()),
            max_players_per_game: env_parse("MAX_PLAYERS_PER_GAME", 4),
            min_players_to_start: env_parse("MIN_PLAYERS_TO_START", 2),
            countdown_seconds: env_parse("COUNTDOWN_SECONDS", 3),
            max_race_time: Duration::from_secs(max_race_minutes * 60),
            cleanup_delay: Duration::from_secs(cleanup_minutes * 60),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            admin_api_key: std::env::var("ADMIN_API_KEY").ok().filter(|k| !k.is_empty()),
            texts_path: std::env::var("TEXTS_PATH")
                .unwrap_or_else(|_| "data/texts.json".to_string()),
            self_healing,
        }
    }

    /// Engine slice of the configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_players_per_game: self.max_players_per_game,
            min_players_to_start: self.min_players_to_start,
            countdown_seconds: self.countdown_seconds,
            max_race_time: self.max_race_time,
            cleanup_delay: self.cleanup_delay,
        }
    }

    /// Fan-out server slice of the configuration.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.ws_bind,
            max_connections: 1000,
            environment: self.environment,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.max_players_per_game, 4);
        assert_eq!(config.min_players_to_start, 2);
        assert_eq!(config.countdown_seconds, 3);
        assert_eq!(config.max_race_time, Duration::from_secs(120));
        assert_eq!(config.cleanup_delay, Duration::from_secs(180));
        assert!(!config.self_healing);
        assert!(config.admin_api_key.is_none());
    }

    #[test]
    fn test_environment_parsing() {
        assert_eq!("development".parse(), Ok(Environment::Development));
        assert_eq!("PRODUCTION".parse(), Ok(Environment::Production));
        assert_eq!("test".parse(), Ok(Environment::Test));
        assert!("staging".parse::<Environment>().is_err());
        assert_eq!(Environment::Production.to_string(), "production");
    }

    #[test]
    fn test_config_slices() {
        let config = Config::default();
        let engine = config.engine_config();
        assert_eq!(engine.max_players_per_game, 4);
        assert_eq!(engine.countdown_seconds, 3);
        let server = config.server_config();
        assert_eq!(server.bind_addr, config.ws_bind);
        assert_eq!(server.environment, Environment::Development);
    }

    // Environment variables are process-global, so everything that
    // touches them lives in this single test.
    #[test]
    fn test_from_env_reads_and_clamps() {
        let vars = [
            ("APP_ENV", "production"),
            ("PORT", "9100"),
            ("MAX_PLAYERS_PER_GAME", "6"),
            ("MAX_RACE_TIME_MINUTES", "10"),
            ("CLEANUP_DELAY_MINUTES", "1"),
            ("ADMIN_API_KEY", "sekrit"),
        ];
        for (k, v) in vars {
            std::env::set_var(k, v);
        }

        let config = Config::from_env();
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.ws_bind.port(), 9100);
        assert_eq!(config.admin_bind.port(), 9101);
        assert_eq!(config.max_players_per_game, 6);
        // Out-of-range values clamp into the documented bands.
        assert_eq!(config.max_race_time, Duration::from_secs(3 * 60));
        assert_eq!(config.cleanup_delay, Duration::from_secs(3 * 60));
        assert_eq!(config.admin_api_key.as_deref(), Some("sekrit"));
        // Production implies self-healing.
        assert!(config.self_healing);

        for (k, _) in vars {
            std::env::remove_var(k);
        }
    }
}
