use thiserror::Error;

/// Errors surfaced by the lifecycle controller.
///
/// Data-plane failures never reach the caller; they degrade to per-flow
/// peer behaviour (RST or silent timeout) and counters.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is already running")]
    AlreadyRunning,

    #[error("tun descriptor unavailable: {0}")]
    Tun(#[from] std::io::Error),
}
