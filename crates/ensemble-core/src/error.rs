//! Error types for the coordination core.
//!
//! Every failure mode is a distinct variant carrying the resource, holder or
//! invariant it concerns, so the CLI can print a specific message and map it
//! to an exit code.

use std::{io, path::PathBuf};

use thiserror::Error;

/// Result alias used throughout `ensemble-core`.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Transient contention: the lock is live and not stale.
    #[error(
        "lock on '{resource}' is held by agent '{agent_id}' (pid {pid} on {hostname}, age {age_secs}s, {liveness})"
    )]
    LockHeld {
        resource: String,
        agent_id: String,
        pid: u32,
        hostname: String,
        age_secs: i64,
        liveness: String,
    },

    /// Release attempted by someone other than the recorded holder.
    #[error(
        "cannot release '{resource}': held by agent '{holder}' on {holder_host}, not by '{caller}' on {caller_host}"
    )]
    NotLockHolder {
        resource: String,
        holder: String,
        holder_host: String,
        caller: String,
        caller_host: String,
    },

    #[error("task {task}: transition {from} -> {to} is not allowed")]
    InvalidTransition {
        task: String,
        from: String,
        to: String,
    },

    /// Close was attempted without a passing verification result.
    #[error("task {task} cannot be completed: verification is {status}")]
    VerificationRequired { task: String, status: String },

    #[error("invalid resource '{resource}': {reason}")]
    InvalidResource { resource: String, reason: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("{context}: {source}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    /// The state directory cannot be created or written. Aborts the command.
    #[error("workspace state directory {path} is unavailable: {source}")]
    WorkspaceUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn serialization(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            context: context.into(),
            source,
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Process exit code for this error.
    ///
    /// 1 invalid input or config, 2 system failure, 3 not found,
    /// 4 contention or protocol violation.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidInput(_) | Self::InvalidConfig(_) | Self::InvalidResource { .. } => 1,
            Self::Io { .. } | Self::Serialization { .. } | Self::WorkspaceUnavailable { .. } => 2,
            Self::NotFound { .. } => 3,
            Self::LockHeld { .. }
            | Self::NotLockHolder { .. }
            | Self::InvalidTransition { .. }
            | Self::VerificationRequired { .. } => 4,
        }
    }

    /// True for errors a caller may reasonably retry later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::LockHeld { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_held_names_holder_and_age() {
        let err = Error::LockHeld {
            resource: "src/x.py".into(),
            agent_id: "agent-a".into(),
            pid: 4242,
            hostname: "build-1".into(),
            age_secs: 10,
            liveness: "alive".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("src/x.py"));
        assert!(msg.contains("agent-a"));
        assert!(msg.contains("pid 4242"));
        assert!(msg.contains("age 10s"));
        assert_eq!(err.exit_code(), 4);
        assert!(err.is_transient());
    }

    #[test]
    fn exit_codes_follow_categories() {
        assert_eq!(Error::InvalidInput("x".into()).exit_code(), 1);
        assert_eq!(Error::not_found("task", "TASK-1").exit_code(), 3);
        assert_eq!(
            Error::io("reading", io::Error::other("boom")).exit_code(),
            2
        );
        let violation = Error::VerificationRequired {
            task: "TASK-1".into(),
            status: "absent".into(),
        };
        assert_eq!(violation.exit_code(), 4);
        assert!(!violation.is_transient());
    }
}
