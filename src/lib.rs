pub mod agent;
pub mod annotate;
pub mod block_counter;
pub mod buffer;
pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod metrics;
pub mod perf;
pub mod sender;
pub mod sync_thread;
pub mod timebase;

pub use cli::{Cli, SessionConfig};
pub use config::{Config, DaemonConfig, LoggingConfig};
pub use error::GatordError;
pub use metrics::Metrics;
