use std::path::PathBuf;

use app_server_client::{ClientError, ExitReason, SpawnError, WriteError};
use serde::Serialize;
use thiserror::Error;

use crate::ids::{ApprovalId, ThreadId, WorkspaceId};

/// Why a turn did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum TurnFailure {
    #[error("backend process crashed ({})", crash_detail(*code, *signal))]
    ProcessCrashed {
        code: Option<i32>,
        signal: Option<i32>,
    },
    #[error("backend process was stopped")]
    ProcessKilled,
    #[error("backend protocol failed: {detail}")]
    ProtocolFailure { detail: String },
    #[error("backend reported an error: {message}")]
    Backend { message: String },
    #[error("session closed before the turn could run")]
    SessionClosed,
}

impl TurnFailure {
    /// Map an unexpected process exit onto a failure reason.
    #[must_use]
    pub fn from_exit(reason: ExitReason) -> Self {
        match reason {
            ExitReason::Killed => Self::ProcessKilled,
            ExitReason::Exited { code } => Self::ProcessCrashed {
                code: Some(code),
                signal: None,
            },
            ExitReason::Signaled { signal } => Self::ProcessCrashed {
                code: None,
                signal: Some(signal),
            },
            ExitReason::Unknown => Self::ProcessCrashed {
                code: None,
                signal: None,
            },
        }
    }
}

fn crash_detail(code: Option<i32>, signal: Option<i32>) -> String {
    match (code, signal) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("signal {signal}"),
        (None, None) => "no exit status".to_string(),
    }
}

/// Synchronous validation errors from the turn coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TurnError {
    #[error("approval {0} was already answered")]
    DuplicateResponse(ApprovalId),
    #[error("approval {0} is not pending in this session")]
    UnknownApproval(ApprovalId),
    #[error("approval {0} expired before it was answered")]
    ApprovalTimeout(ApprovalId),
    #[error("session is closed")]
    SessionClosed,
}

/// Errors from a backend adapter call.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("backend did not finish initializing within {0:?}")]
    InitializeTimeout(std::time::Duration),
    #[error("{0}")]
    Backend(String),
}

impl AdapterError {
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Client(err) => err.is_disconnect(),
            Self::Write(WriteError::ProcessExited) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum BindingError {
    #[error("unknown backend kind: {0}")]
    UnknownBackend(String),
    #[error("invalid argument string for {kind}: {source}")]
    InvalidArgs {
        kind: String,
        #[source]
        source: shell_words::ParseError,
    },
    #[error("invalid tier for {kind}: {value}")]
    InvalidTier { kind: String, value: String },
    #[error("invalid headless mode for {kind}: {value}")]
    InvalidMode { kind: String, value: String },
    #[error("custom backend has no binary configured")]
    MissingBinary,
    #[error("invalid headless pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Errors from creating a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Binding(#[from] BindingError),
    #[error("backend handshake failed: {0}")]
    Handshake(#[source] AdapterError),
    #[error("backend could not open thread: {0}")]
    Thread(#[source] AdapterError),
    #[error("backend exited while the session was opening")]
    ExitedDuringStartup,
}

/// Errors from reading or writing the thread record file.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read thread store {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse thread store {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write thread store {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode thread records: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Errors surfaced by the command surface.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("unknown workspace: {0}")]
    UnknownWorkspace(WorkspaceId),
    #[error("workspace {0} is not connected")]
    WorkspaceNotConnected(WorkspaceId),
    #[error("unknown thread: {0}")]
    UnknownThread(ThreadId),
    #[error("thread {0} is archived")]
    ThreadArchived(ThreadId),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Turn(#[from] TurnError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

impl From<SpawnError> for HostError {
    fn from(err: SpawnError) -> Self {
        Self::Session(SessionError::Spawn(err))
    }
}

impl From<BindingError> for HostError {
    fn from(err: BindingError) -> Self {
        Self::Session(SessionError::Binding(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_reasons_map_to_failures() {
        assert_eq!(
            TurnFailure::from_exit(ExitReason::Exited { code: 1 }),
            TurnFailure::ProcessCrashed {
                code: Some(1),
                signal: None
            }
        );
        assert_eq!(
            TurnFailure::from_exit(ExitReason::Killed),
            TurnFailure::ProcessKilled
        );
    }

    #[test]
    fn failures_have_readable_messages() {
        let crashed = TurnFailure::ProcessCrashed {
            code: Some(1),
            signal: None,
        };
        assert_eq!(crashed.to_string(), "backend process crashed (exit code 1)");
        let value = serde_json::to_value(&crashed).unwrap_or_default();
        assert_eq!(value["type"], "processCrashed");
        assert_eq!(value["code"], 1);
    }
}
