//! Command-line surface (§6.4). `Cli::parse()` is the single entry point
//! `main` calls; everything else in the daemon takes a [`SessionConfig`]
//! built from it plus the TOML ambient config, never `std::env::args`
//! directly.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::buffer::BufferMode;

#[derive(Debug, Parser)]
#[command(name = "gatord", about = "Host-side performance-monitoring daemon")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Ring buffer size class for the outbound buffer.
    #[arg(long, value_enum, default_value = "normal")]
    pub buffer_mode: BufferModeArg,

    /// Sample rate in Hz for counter-based sampling.
    #[arg(long, default_value_t = 1000)]
    pub sample_rate: u32,

    /// Capture duration in seconds; 0 means run until stopped.
    #[arg(long, default_value_t = 0)]
    pub duration: u32,

    /// Attempt call-stack unwinding (DWARF/frame-pointer) while sampling.
    #[arg(long, default_value_t = false)]
    pub call_stack_unwinding: bool,

    /// Send a stop signal to an already-running gatord and exit.
    #[arg(long, default_value_t = false)]
    pub stop_gator: bool,

    /// Command line to launch and capture, if any.
    #[arg(long)]
    pub capture_command: Option<String>,

    /// Run the captured command as this user.
    #[arg(long)]
    pub capture_user: Option<String>,

    /// Capture system-wide rather than scoped to `capture_command`'s pids.
    #[arg(long, default_value_t = false)]
    pub system_wide: bool,

    /// Path to the ambient TOML configuration file.
    #[arg(long, default_value = "/etc/gatord/config.toml")]
    pub config: PathBuf,

    /// Raise the log level; repeatable (`-v`, `-vv`, `-vvv`).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BufferModeArg {
    Streaming,
    Normal,
    Large,
}

impl From<BufferModeArg> for BufferMode {
    fn from(value: BufferModeArg) -> Self {
        match value {
            BufferModeArg::Streaming => BufferMode::Streaming,
            BufferModeArg::Normal => BufferMode::Normal,
            BufferModeArg::Large => BufferMode::Large,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Hidden entry point re-exec'd as the privileged perf-capture agent
    /// (§6.3); never invoked directly by a user. Communicates with the
    /// parent over the stdin/stdout pipes the parent set up when spawning
    /// this process — there is no separate fd argument.
    #[command(hide = true, name = "agent-perf")]
    AgentPerf,
}

/// Validated session configuration built from [`Cli`] plus the counter set
/// and SPE flag obtained elsewhere. Replaces XML session ingestion in the
/// core (§3.1) — the core never parses `session.xml` itself.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub buffer_mode: BufferMode,
    pub sample_rate: u32,
    pub duration_secs: u32,
    pub call_stack_unwinding: bool,
    pub capture_command: Option<String>,
    pub capture_user: Option<String>,
    pub system_wide: bool,
    /// Opaque to the core: forwarded verbatim to the agent/session layer.
    pub requested_counters: Vec<String>,
    pub spe_requested: bool,
}

impl SessionConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self, String> {
        if cli.sample_rate == 0 {
            return Err("sample-rate must be non-zero".into());
        }
        if !cli.system_wide && cli.capture_command.is_none() {
            return Err("one of --system-wide or --capture-command is required".into());
        }

        Ok(Self {
            buffer_mode: cli.buffer_mode.into(),
            sample_rate: cli.sample_rate,
            duration_secs: cli.duration,
            call_stack_unwinding: cli.call_stack_unwinding,
            capture_command: cli.capture_command.clone(),
            capture_user: cli.capture_user.clone(),
            system_wide: cli.system_wide,
            requested_counters: Vec::new(),
            spe_requested: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn system_wide_capture_validates() {
        let cli = Cli::parse_from(["gatord", "--system-wide"]);
        let session = SessionConfig::from_cli(&cli).unwrap();
        assert!(session.system_wide);
        assert_eq!(session.buffer_mode, BufferMode::Normal);
    }

    #[test]
    fn missing_target_is_rejected() {
        let cli = Cli::parse_from(["gatord"]);
        assert!(SessionConfig::from_cli(&cli).is_err());
    }

    #[test]
    fn zero_sample_rate_is_rejected() {
        let cli = Cli::parse_from(["gatord", "--system-wide", "--sample-rate", "0"]);
        assert!(SessionConfig::from_cli(&cli).is_err());
    }

    #[test]
    fn agent_perf_subcommand_parses() {
        let cli = Cli::parse_from(["gatord", "agent-perf"]);
        assert!(matches!(cli.command, Some(Command::AgentPerf)));
    }
}
