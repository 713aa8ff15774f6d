//! Ambient TOML configuration (§6.4): settings that are not part of a
//! capture session (so don't belong on the CLI) but still need to be
//! tunable without a rebuild — output locations, the agent re-exec path,
//! commit cadence, logging.

use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/gatord/config.toml";
const ENV_CONFIG_PATH: &str = "GATORD_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads from the path named by `GATORD_CONFIG`, falling back to
    /// `/etc/gatord/config.toml`. A missing or unparsable file yields
    /// defaults rather than failing startup — the daemon is expected to run
    /// with no config present at all on a freshly provisioned host.
    pub fn load() -> Self {
        let path = std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    /// Directory captures are written to in local-capture mode.
    #[serde(default = "default_apc_output_dir")]
    pub apc_output_dir: String,

    /// Path re-exec'd as the `agent-perf` subcommand; `/proc/self/exe` lets
    /// the daemon re-launch itself without relying on `$PATH`.
    #[serde(default = "default_agent_exe_path")]
    pub agent_exe_path: String,

    /// `BLOCK_COUNTER` commit cadence; 0 disables the time-based trigger,
    /// leaving `needs_flush`'s watermark as the only commit path.
    #[serde(default = "default_commit_rate_ns")]
    pub commit_rate_ns: u64,

    /// Ceiling on one outbound response record's payload length.
    #[serde(default = "default_max_response_length")]
    pub max_response_length: usize,

    /// How often polled counter drivers are ticked.
    #[serde(default = "default_polled_driver_interval_ms")]
    pub polled_driver_interval_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            apc_output_dir: default_apc_output_dir(),
            agent_exe_path: default_agent_exe_path(),
            commit_rate_ns: default_commit_rate_ns(),
            max_response_length: default_max_response_length(),
            polled_driver_interval_ms: default_polled_driver_interval_ms(),
        }
    }
}

fn default_apc_output_dir() -> String {
    "./apc".to_string()
}
fn default_agent_exe_path() -> String {
    "/proc/self/exe".to_string()
}
fn default_commit_rate_ns() -> u64 {
    100_000_000 // 100ms
}
fn default_max_response_length() -> usize {
    1 << 20
}
fn default_polled_driver_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Overrides `RUST_LOG` when `-v` is not passed on the command line.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Mirror logs to the systemd journal in addition to stderr.
    #[serde(default)]
    pub journald: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            journald: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parse_config_defaults() {
        let toml = r#"[daemon]
apc_output_dir = "/var/lib/gatord/apc"
commit_rate_ns = 50000000

[logging]
level = "debug"
"#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.daemon.apc_output_dir, "/var/lib/gatord/apc");
        assert_eq!(cfg.daemon.commit_rate_ns, 50_000_000);
        assert_eq!(cfg.daemon.agent_exe_path, "/proc/self/exe");
        assert_eq!(cfg.logging.level, "debug");
        assert!(!cfg.logging.journald);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.daemon.max_response_length, 1 << 20);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn env_override_points_load_at_a_temp_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[daemon]\ncommit_rate_ns = 1").unwrap();
        unsafe {
            std::env::set_var(ENV_CONFIG_PATH, file.path());
        }
        let cfg = Config::load();
        assert_eq!(cfg.daemon.commit_rate_ns, 1);
        unsafe {
            std::env::remove_var(ENV_CONFIG_PATH);
        }
    }

    #[test]
    fn unreadable_path_falls_back_to_defaults() {
        unsafe {
            std::env::set_var(ENV_CONFIG_PATH, "/nonexistent/gatord.toml");
        }
        let cfg = Config::load();
        assert_eq!(cfg.daemon.commit_rate_ns, default_commit_rate_ns());
        unsafe {
            std::env::remove_var(ENV_CONFIG_PATH);
        }
    }
}
