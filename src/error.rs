//! Error taxonomy (§7). `GatordError` carries one variant per failure
//! category; call sites that can only lose one subsystem catch-and-log
//! rather than propagating. `anyhow` is still used at the outermost layer
//! (task setup, `main`) where a chain of unrelated failure sources is
//! collapsed into one bail-out point.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum GatordError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("backpressure exceeded")]
    Backpressure,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("capture exec failed: {0}")]
    CaptureExec(String),

    #[error("kernel capability gap: {0}")]
    KernelCapability(String),
}

impl GatordError {
    /// Distinguishes a transient I/O condition (caller should retry) from a
    /// fatal one (capture must abort), per §7's propagation policy.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatordError::Io(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn would_block_is_transient() {
        let err = GatordError::Io(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(err.is_transient());
    }

    #[test]
    fn broken_pipe_is_fatal() {
        let err = GatordError::Io(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(!err.is_transient());
    }

    #[test]
    fn non_io_variants_are_never_transient() {
        assert!(!GatordError::Backpressure.is_transient());
        assert!(!GatordError::Configuration("bad session xml".into()).is_transient());
    }
}
