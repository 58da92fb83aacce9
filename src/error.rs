//! # Error Taxonomy
//!
//! Typed error kinds surfaced by the core. Every fallible core operation
//! returns [`IbResult`]; binaries and integration tests wrap these in
//! `anyhow::Result` at the outermost seam.
//!
//! The policy per kind:
//!
//! | Kind | Policy |
//! |---|---|
//! | `Misconfiguration` | Fatal at participant creation |
//! | `Transport` | Escalate the participant to the `Error` state |
//! | `Protocol` | Drop the offending connection, then escalate |
//! | `State` | Returned to the caller; no state change |
//! | `Timeout` | Returned to the caller; retry policy is the caller's |
//! | `UserCallback` | Caught panic from a user handler; escalate |
//!
//! There is deliberately no thread-local last-error string here; that
//! pattern belongs to an (out-of-scope) C façade, not to the core.

use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the core.
pub type IbResult<T> = Result<T, IbError>;

/// Error kinds surfaced by the core.
#[derive(Debug, Error)]
pub enum IbError {
    /// A static configuration integrity rule was violated.
    #[error("misconfiguration: {0}")]
    Misconfiguration(String),

    /// A connect, read, or write on a peer or registry connection failed.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The remote side violated the wire format or announced an
    /// incompatible protocol version.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The requested operation is not valid in the current state.
    #[error("invalid operation while in state {state}: {reason}")]
    State { state: String, reason: String },

    /// A bounded wait elapsed without the expected event.
    #[error("timeout after {after:?} while {what}")]
    Timeout { what: String, after: Duration },

    /// A user-supplied callback panicked; the participant escalates to
    /// the `Error` lifecycle state.
    #[error("user callback panicked: {0}")]
    UserCallback(String),
}

impl IbError {
    /// Shorthand for a [`IbError::State`] error.
    pub fn state(state: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        IbError::State {
            state: state.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this error escalates the participant to the `Error`
    /// lifecycle state when it occurs on the dispatch path.
    pub fn escalates(&self) -> bool {
        matches!(
            self,
            IbError::Transport(_) | IbError::Protocol(_) | IbError::UserCallback(_)
        )
    }
}

impl From<std::io::Error> for IbError {
    fn from(err: std::io::Error) -> Self {
        IbError::Transport(err.to_string())
    }
}

impl From<bincode::Error> for IbError {
    fn from(err: bincode::Error) -> Self {
        IbError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalation_policy() {
        assert!(IbError::Transport("peer gone".into()).escalates());
        assert!(IbError::UserCallback("panicked".into()).escalates());
        assert!(!IbError::state("Stopped", "cannot send").escalates());
        assert!(!IbError::Misconfiguration("dup link".into()).escalates());
    }

    #[test]
    fn test_io_error_maps_to_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: IbError = io.into();
        assert!(matches!(err, IbError::Transport(_)));
    }
}
