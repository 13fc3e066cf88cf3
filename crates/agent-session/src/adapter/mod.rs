//! Uniform backend surface over the two adapter tiers.
//!
//! Every adapter pushes [`AdapterEvent`]s into an mpsc channel consumed by
//! the session loop. The headless tier has two modes: an interactive process
//! matched line by line, or a stream-json process per turn. Operations a tier cannot perform resolve immediately with
//! [`CapabilityOutcome::Unsupported`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use app_server_client::{
    AppServerWireLog, ClientInfo, ExitReason, ModelInfo, ReasoningEffort, ThreadSummary,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::binding::AdapterBinding;
use crate::capability::{AdapterTier, Capabilities, CapabilityOutcome, HeadlessMode};
use crate::error::{AdapterError, SessionError};
use crate::ids::ApprovalId;

pub mod headless;
pub mod native;
pub mod stream_json;

pub use headless::HeadlessAdapter;
pub use native::NativeAdapter;
pub use stream_json::StreamJsonAdapter;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One user message as submitted to a turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnContent {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effort: Option<ReasoningEffort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collaboration_mode: Option<Value>,
}

impl TurnContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProgressKind {
    AgentMessage,
    Reasoning,
    CommandOutput,
    FileChange,
    Plan,
    Diff,
    ItemStarted,
    ItemCompleted,
    ToolStarted,
    Error,
    /// Unclassified assistant text from a text-stream backend.
    Text,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnProgress {
    pub kind: ProgressKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl TurnProgress {
    pub fn delta(kind: ProgressKind, delta: impl Into<String>) -> Self {
        Self {
            kind,
            delta: Some(delta.into()),
            method: None,
            raw: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ApprovalKind {
    CommandExecution,
    FileChange,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    pub id: ApprovalId,
    pub kind: ApprovalKind,
    pub details: Value,
}

/// The user's answer to an approval request. `Cancel` is sent by the host
/// when the turn that asked is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApprovalDecision {
    Accept,
    AcceptForSession,
    Reject,
    Cancel,
}

impl ApprovalDecision {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "accept" | "approve" | "yes" | "y" => Some(Self::Accept),
            "acceptforsession" | "accept-for-session" | "always" | "a" => {
                Some(Self::AcceptForSession)
            }
            "reject" | "decline" | "no" | "n" => Some(Self::Reject),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_wire(self) -> app_server_client::ApprovalDecision {
        match self {
            Self::Accept => app_server_client::ApprovalDecision::Accept,
            Self::AcceptForSession => app_server_client::ApprovalDecision::AcceptForSession,
            Self::Reject => app_server_client::ApprovalDecision::Decline,
            Self::Cancel => app_server_client::ApprovalDecision::Cancel,
        }
    }
}

/// How the backend says a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendTurnOutcome {
    Completed,
    Failed { message: String },
    Interrupted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    TurnStarted {
        backend_turn_id: String,
    },
    Progress {
        backend_turn_id: Option<String>,
        progress: TurnProgress,
    },
    ApprovalRequested {
        backend_turn_id: Option<String>,
        approval: PendingApproval,
    },
    TurnCompleted {
        backend_turn_id: Option<String>,
        outcome: BackendTurnOutcome,
    },
    /// The backend named its conversation after the session opened.
    BackendThreadAssigned {
        backend_thread_id: String,
    },
    /// Non-protocol output (stderr, undecodable lines).
    Diagnostic {
        message: String,
    },
    /// The transport gave up; the process is being stopped.
    ProtocolFailure {
        detail: String,
    },
    /// Always the last event of an adapter.
    Exited {
        reason: ExitReason,
    },
}

/// What `start_turn` achieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnDispatch {
    Started { backend_turn_id: String },
    /// The backend answered without a turn id, so nothing later can be
    /// correlated to this turn; it is complete as of the response.
    Completed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCatalog {
    pub models: Vec<ModelInfo>,
    pub default_model: Option<String>,
}

#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn tier(&self) -> AdapterTier;

    fn capabilities(&self) -> Capabilities;

    fn is_alive(&self) -> bool;

    /// Open a backend conversation. Returns the backend's thread id when it
    /// assigns one.
    async fn start_thread(&self, cwd: &Path) -> Result<Option<String>, AdapterError>;

    async fn resume_thread(
        &self,
        backend_thread_id: &str,
        cwd: &Path,
    ) -> Result<CapabilityOutcome<String>, AdapterError>;

    async fn list_threads(
        &self,
        cwd: &Path,
    ) -> Result<CapabilityOutcome<Vec<ThreadSummary>>, AdapterError>;

    async fn start_turn(
        &self,
        backend_thread_id: &str,
        content: &TurnContent,
    ) -> Result<TurnDispatch, AdapterError>;

    async fn interrupt_turn(
        &self,
        backend_thread_id: &str,
        backend_turn_id: &str,
    ) -> Result<CapabilityOutcome<()>, AdapterError>;

    async fn respond_to_approval(
        &self,
        id: &ApprovalId,
        decision: ApprovalDecision,
    ) -> Result<CapabilityOutcome<()>, AdapterError>;

    async fn list_models(&self) -> Result<CapabilityOutcome<ModelCatalog>, AdapterError>;

    /// Stop the process: graceful first, forced after `grace`.
    async fn shutdown(&self, grace: Duration) -> Option<ExitReason>;
}

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub cwd: PathBuf,
    pub client_info: ClientInfo,
    pub initialize_timeout: Duration,
    /// Response deadline for requests after the handshake.
    pub request_timeout: Option<Duration>,
    pub max_consecutive_malformed: usize,
    pub grace: Duration,
    pub wire_log: Option<AppServerWireLog>,
}

impl LaunchOptions {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            client_info: default_client_info(),
            initialize_timeout: Duration::from_secs(15),
            request_timeout: Some(Duration::from_secs(60)),
            max_consecutive_malformed: app_server_client::DEFAULT_MAX_CONSECUTIVE_MALFORMED,
            grace: Duration::from_secs(3),
            wire_log: None,
        }
    }
}

#[must_use]
pub fn default_client_info() -> ClientInfo {
    ClientInfo {
        name: "agent_monitor".to_string(),
        title: Some("Agent Monitor".to_string()),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

pub type AdapterEvents = mpsc::Receiver<AdapterEvent>;

/// Spawn the backend for `binding` and return the adapter matching its tier.
pub async fn launch(
    binding: &AdapterBinding,
    options: &LaunchOptions,
) -> Result<(Arc<dyn BackendAdapter>, AdapterEvents), SessionError> {
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let adapter: Arc<dyn BackendAdapter> = match binding.tier {
        AdapterTier::Native => Arc::new(NativeAdapter::launch(binding, options, events_tx).await?),
        AdapterTier::Headless => match binding.headless_mode {
            HeadlessMode::Interactive => {
                Arc::new(HeadlessAdapter::launch(binding, options, events_tx)?)
            }
            HeadlessMode::StreamJson(dialect) => Arc::new(StreamJsonAdapter::launch(
                binding, options, dialect, events_tx,
            )?),
        },
    };
    tracing::info!(
        backend = %binding.kind,
        tier = binding.tier.as_str(),
        mode = binding.headless_mode.as_str(),
        program = %binding.program,
        cwd = %options.cwd.display(),
        "Backend adapter launched"
    );
    Ok((adapter, events_rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decisions_parse_user_input() {
        assert_eq!(ApprovalDecision::parse("Accept"), Some(ApprovalDecision::Accept));
        assert_eq!(
            ApprovalDecision::parse("always"),
            Some(ApprovalDecision::AcceptForSession)
        );
        assert_eq!(ApprovalDecision::parse("decline"), Some(ApprovalDecision::Reject));
        assert_eq!(ApprovalDecision::parse("cancel"), None);
    }

    #[test]
    fn reject_maps_to_decline_on_the_wire() {
        assert_eq!(
            ApprovalDecision::Reject.to_wire(),
            app_server_client::ApprovalDecision::Decline
        );
    }

    #[test]
    fn progress_serializes_without_empty_fields() {
        let value = serde_json::to_value(TurnProgress::delta(ProgressKind::AgentMessage, "hi"))
            .unwrap_or_default();
        assert_eq!(value, serde_json::json!({"kind": "agentMessage", "delta": "hi"}));
    }
}
