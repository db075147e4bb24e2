//! Runtime configuration.
//!
//! Defaults suit a four-player loopback match; environment variables
//! override individual fields.

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::game::machine::MatchConfig;
use crate::network::session::SessionConfig;

/// Session name used when none is configured.
pub const DEFAULT_SESSION_NAME: &str = "arena";

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A count or limit that must be positive is zero
    #[error("{0} must be at least 1")]
    Zero(&'static str),

    /// The match cannot start with more players than fit in a session
    #[error("min_players_to_start ({min}) exceeds max_players ({max})")]
    TooManyRequired {
        /// Players required to start
        min: usize,
        /// Session capacity
        max: usize,
    },

    /// Empty session name
    #[error("session name is empty")]
    EmptySessionName,
}

/// Everything a peer needs to run.
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    /// Session joining
    pub session: SessionConfig,
    /// Match rules
    pub rules: MatchConfig,
    /// Gameplay levels, lobby excluded
    pub level_count: usize,
    /// Session to host or join
    pub session_name: String,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            rules: MatchConfig::default(),
            level_count: 4,
            session_name: DEFAULT_SESSION_NAME.to_string(),
        }
    }
}

impl ArenaConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from any key lookup. Unparsable values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(name) = lookup("ARENA_SESSION") {
            config.session_name = name;
        }

        if let Some(ms) = parse::<u64>(&lookup, "ARENA_CONNECT_TIMEOUT_MS") {
            if ms > 0 {
                config.session.connect_timeout = Duration::from_millis(ms);
            } else {
                warn!("ARENA_CONNECT_TIMEOUT_MS must be > 0, using default");
            }
        }

        if let Some(score) = parse::<u8>(&lookup, "ARENA_MAX_SCORE") {
            config.rules.max_score = score;
        }

        if let Some(lives) = parse::<u8>(&lookup, "ARENA_MAX_LIVES") {
            config.rules.max_lives = lives;
        }

        if let Some(min) = parse::<usize>(&lookup, "ARENA_MIN_PLAYERS") {
            config.rules.min_players_to_start = min;
        }

        if let Some(count) = parse::<usize>(&lookup, "ARENA_LEVEL_COUNT") {
            if (1..=64).contains(&count) {
                config.level_count = count;
            } else {
                warn!("ARENA_LEVEL_COUNT must be 1-64, using default");
            }
        }

        if let Some(seed) = parse::<u64>(&lookup, "ARENA_SEED") {
            config.rules.seed = Some(seed);
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_name.trim().is_empty() {
            return Err(ConfigError::EmptySessionName);
        }
        if self.session.max_players == 0 {
            return Err(ConfigError::Zero("max_players"));
        }
        if self.level_count == 0 {
            return Err(ConfigError::Zero("level_count"));
        }
        if self.rules.max_score == 0 {
            return Err(ConfigError::Zero("max_score"));
        }
        if self.rules.max_lives == 0 {
            return Err(ConfigError::Zero("max_lives"));
        }
        if self.rules.min_players_to_start > self.session.max_players {
            return Err(ConfigError::TooManyRequired {
                min: self.rules.min_players_to_start,
                max: self.session.max_players,
            });
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Invalid {} '{}', using default", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ArenaConfig::default();
        assert_eq!(config.session_name, "arena");
        assert_eq!(config.session.max_players, 4);
        assert_eq!(config.session.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.rules.max_score, 3);
        assert_eq!(config.rules.min_players_to_start, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides_from_lookup() {
        let config = ArenaConfig::from_lookup(lookup(&[
            ("ARENA_SESSION", "finals"),
            ("ARENA_CONNECT_TIMEOUT_MS", "2500"),
            ("ARENA_MAX_SCORE", "5"),
            ("ARENA_LEVEL_COUNT", "2"),
            ("ARENA_SEED", "99"),
        ]));
        assert_eq!(config.session_name, "finals");
        assert_eq!(config.session.connect_timeout, Duration::from_millis(2500));
        assert_eq!(config.rules.max_score, 5);
        assert_eq!(config.level_count, 2);
        assert_eq!(config.rules.seed, Some(99));
    }

    #[test]
    fn test_bad_values_keep_defaults() {
        let config = ArenaConfig::from_lookup(lookup(&[
            ("ARENA_MAX_LIVES", "lots"),
            ("ARENA_CONNECT_TIMEOUT_MS", "0"),
            ("ARENA_LEVEL_COUNT", "0"),
        ]));
        assert_eq!(config.rules.max_lives, 3);
        assert_eq!(config.session.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.level_count, 4);
    }

    #[test]
    fn test_validate_rejects_unstartable_match() {
        let config = ArenaConfig::from_lookup(lookup(&[("ARENA_MIN_PLAYERS", "6")]));
        assert_eq!(
            config.validate(),
            Err(ConfigError::TooManyRequired { min: 6, max: 4 })
        );

        let mut config = ArenaConfig::default();
        config.rules.max_score = 0;
        assert_eq!(config.validate(), Err(ConfigError::Zero("max_score")));
    }
}
