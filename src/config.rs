//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use regex::{Regex, RegexBuilder};

use crate::error::ConfigError;

/// Folder name of the privileged main group.
pub const MAIN_GROUP_FOLDER: &str = "main";

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Assistant name; doubles as trigger word and bot-message prefix.
    pub assistant_name: String,
    /// Project root. `store/`, `groups/` and `data/` live below it.
    pub root_dir: PathBuf,
    /// Delivery loop tick.
    pub poll_interval: Duration,
    /// File sender tick.
    pub ipc_poll_interval: Duration,
    /// How long a container stays up after its last result.
    pub idle_timeout: Duration,
    /// Hard per-container timeout.
    pub container_timeout: Duration,
    /// Maximum bytes of container stdout retained.
    pub container_max_output_size: usize,
    /// Container image used for every agent container.
    pub container_image: String,
    /// Container runtime binary.
    pub container_runtime: String,
    /// Global ceiling on active + standby containers.
    pub max_concurrent_containers: usize,
    /// Whether standby containers are kept per registered chat.
    pub warm_pool_enabled: bool,
    /// Settle delay before a standby container is respawned.
    pub warm_respawn_delay: Duration,
    /// Grace period given to active containers on shutdown.
    pub shutdown_grace: Duration,
    /// Prior user/assistant exchanges injected into cold-start prompts.
    pub recent_context_pairs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            assistant_name: "Andy".to_string(),
            root_dir: PathBuf::from("."),
            poll_interval: Duration::from_millis(2000),
            ipc_poll_interval: Duration::from_millis(1000),
            idle_timeout: Duration::from_millis(1_800_000), // 30 minutes
            container_timeout: Duration::from_millis(1_800_000),
            container_max_output_size: 10 * 1024 * 1024,
            container_image: "nanoclaw-agent:latest".to_string(),
            container_runtime: "docker".to_string(),
            max_concurrent_containers: 5,
            warm_pool_enabled: true,
            warm_respawn_delay: Duration::from_millis(2000),
            shutdown_grace: Duration::from_millis(10_000),
            recent_context_pairs: 3,
        }
    }
}

impl Config {
    /// Build configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let root_dir = match std::env::var("NANOCLAW_ROOT") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => std::env::current_dir().map_err(|e| ConfigError::InvalidValue {
                key: "NANOCLAW_ROOT".to_string(),
                message: format!("unset and the working directory is unreadable: {e}"),
            })?,
        };

        let warm_pool_enabled = std::env::var("WARM_POOL_ENABLED")
            .map(|v| v.trim() != "false")
            .unwrap_or(defaults.warm_pool_enabled);

        Ok(Self {
            assistant_name: std::env::var("ASSISTANT_NAME")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.assistant_name),
            root_dir,
            poll_interval: env_millis("POLL_INTERVAL_MS", defaults.poll_interval)?,
            ipc_poll_interval: env_millis("IPC_POLL_INTERVAL_MS", defaults.ipc_poll_interval)?,
            idle_timeout: env_millis("IDLE_TIMEOUT", defaults.idle_timeout)?,
            container_timeout: env_millis("CONTAINER_TIMEOUT", defaults.container_timeout)?,
            container_max_output_size: env_parse(
                "CONTAINER_MAX_OUTPUT_SIZE",
                defaults.container_max_output_size,
            )?,
            container_image: std::env::var("CONTAINER_IMAGE")
                .unwrap_or(defaults.container_image),
            container_runtime: std::env::var("CONTAINER_RUNTIME")
                .unwrap_or(defaults.container_runtime),
            max_concurrent_containers: env_parse(
                "MAX_CONCURRENT_CONTAINERS",
                defaults.max_concurrent_containers,
            )?
            .max(1),
            warm_pool_enabled,
            warm_respawn_delay: env_millis("WARM_RESPAWN_DELAY_MS", defaults.warm_respawn_delay)?,
            shutdown_grace: env_millis("SHUTDOWN_GRACE_MS", defaults.shutdown_grace)?,
            recent_context_pairs: env_parse("RECENT_CONTEXT_PAIRS", defaults.recent_context_pairs)?,
        })
    }

    /// Directory holding the persistent store.
    pub fn store_dir(&self) -> PathBuf {
        self.root_dir.join("store")
    }

    /// Path of the message database.
    pub fn db_path(&self) -> PathBuf {
        self.store_dir().join("messages.db")
    }

    /// Directory holding one folder per registered group.
    pub fn groups_dir(&self) -> PathBuf {
        self.root_dir.join("groups")
    }

    /// Runtime data directory (IPC, sessions).
    pub fn data_dir(&self) -> PathBuf {
        self.root_dir.join("data")
    }

    /// Pattern a message must match to wake the agent in a trigger-gated chat.
    pub fn trigger_pattern(&self) -> Result<Regex, ConfigError> {
        trigger_pattern_for(&self.assistant_name).map_err(|e| ConfigError::InvalidValue {
            key: "ASSISTANT_NAME".to_string(),
            message: e.to_string(),
        })
    }

    /// Whether `folder` names the privileged main group.
    pub fn is_main_folder(folder: &str) -> bool {
        folder == MAIN_GROUP_FOLDER
    }
}

/// Build the case-insensitive `^@<name>\b` trigger pattern.
pub fn trigger_pattern_for(assistant_name: &str) -> Result<Regex, regex::Error> {
    let pattern = format!(r"^@{}\b", regex::escape(assistant_name));
    RegexBuilder::new(&pattern).case_insensitive(true).build()
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(default),
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let millis = env_parse(key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.assistant_name, "Andy");
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.max_concurrent_containers, 5);
        assert_eq!(config.warm_respawn_delay, Duration::from_secs(2));
        assert!(config.warm_pool_enabled);
    }

    #[test]
    fn trigger_pattern_is_anchored_and_case_insensitive() {
        let re = trigger_pattern_for("Andy").unwrap();
        assert!(re.is_match("@Andy what's up"));
        assert!(re.is_match("@andy hi"));
        assert!(!re.is_match("hey @Andy"));
        assert!(!re.is_match("@Andyx"));
    }

    #[test]
    fn trigger_pattern_escapes_name() {
        let re = trigger_pattern_for("a.b").unwrap();
        assert!(re.is_match("@a.b hello"));
        assert!(!re.is_match("@axb hello"));
    }

    #[test]
    fn derived_paths() {
        let config = Config {
            root_dir: PathBuf::from("/srv/claw"),
            ..Config::default()
        };
        assert_eq!(config.db_path(), PathBuf::from("/srv/claw/store/messages.db"));
        assert_eq!(config.groups_dir(), PathBuf::from("/srv/claw/groups"));
        assert_eq!(config.data_dir(), PathBuf::from("/srv/claw/data"));
    }

    #[test]
    fn main_folder_detection() {
        assert!(Config::is_main_folder("main"));
        assert!(!Config::is_main_folder("family"));
    }
}
