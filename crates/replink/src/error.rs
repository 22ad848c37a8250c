//! Session-level errors surfaced to the frontend.

use core::fmt;

use replink_core::RpcError;

use crate::session::SessionState;

#[derive(Debug)]
pub enum SessionError {
    /// An operation was invoked while the session was not running.
    /// Surfaced synchronously, before any side effect.
    NotRunning(SessionState),
    /// `job_status` was asked about an operation id that was never issued,
    /// or was cancelled.
    JobNotFound(u64),
    Rpc(RpcError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRunning(state) => write!(f, "session is not running (state: {state})"),
            Self::JobNotFound(op_id) => write!(f, "no such job: {op_id}"),
            Self::Rpc(e) => write!(f, "RPC failed: {e}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Rpc(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RpcError> for SessionError {
    fn from(e: RpcError) -> Self {
        Self::Rpc(e)
    }
}
