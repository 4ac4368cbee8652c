//! Error taxonomy for the agent core
//!
//! Maps every failure to one of the recovery classes the agent understands:
//! - AuthFailed: bad/missing credential, fatal to startup, never auto-retried
//! - SessionExpired: recovered transparently with exactly one re-auth + replay
//! - Transport: backend unreachable, flips the connectivity flag
//! - Protocol: a single device read/test failed, never stops its timer
//! - Stream: push channel abort/close/silence, always followed by one reconnect
//! - Backend: the backend answered but rejected the call

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("authentication rejected: {0}")]
    AuthFailed(String),

    #[error("session expired")]
    SessionExpired,

    #[error("backend unreachable: {0}")]
    Transport(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("device protocol error: {0}")]
    Protocol(String),

    #[error("event stream failed: {0}")]
    Stream(String),

    #[error("not authenticated")]
    NotAuthenticated,
}

impl AgentError {
    /// Transport-level failures are the only ones that touch the
    /// level-triggered connectivity flag.
    pub fn is_transport(&self) -> bool {
        matches!(self, AgentError::Transport(_))
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
