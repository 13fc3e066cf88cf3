//! Session orchestration for coding-agent backends.
//!
//! One backend per conversation thread, driven over the app-server JSON-RPC
//! protocol, by adapting an interactive text CLI, or by running a stream-json
//! print-mode process per turn, all into the same event shape. [`AgentHost`] is the entry point; it resolves each
//! workspace's [`AdapterBinding`], keeps at most one live [`Session`] per
//! thread in the [`SessionRegistry`] and publishes [`SessionEvent`]s on the
//! [`EventHub`].

pub mod adapter;
pub mod binding;
pub mod capability;
pub mod config;
pub mod error;
pub mod events;
pub mod host;
pub mod ids;
pub mod registry;
pub mod rules;
pub mod session;
pub mod store;
pub mod turn;

pub use adapter::{
    AdapterEvent, ApprovalDecision, ApprovalKind, BackendAdapter, LaunchOptions, ModelCatalog,
    ProgressKind, StreamJsonAdapter, TurnContent, TurnProgress,
};
pub use binding::{
    ACTIVE_BACKEND_KEY, AdapterBinding, BindingOverride, DetectedBackend,
    detect_installed_backends, resolve_binding,
};
pub use capability::{
    AdapterTier, BackendKind, Capabilities, CapabilityOutcome, HeadlessMode, StreamDialect,
    TierPreference,
};
pub use config::{ConfigError, MonitorConfig};
pub use error::{
    AdapterError, BindingError, HostError, SessionError, StoreError, TurnError, TurnFailure,
};
pub use events::{
    ApprovalOutcome, DisconnectReason, EventHub, EventSubscription, SessionEvent, SessionEventKind,
};
pub use host::{AgentHost, WorkspaceConnection};
pub use ids::{ApprovalId, ThreadId, TurnId, WorkspaceId};
pub use registry::SessionRegistry;
pub use session::{BackendThreadHook, Session, SessionRequest, SessionSnapshot, SubmitReceipt};
pub use store::{
    JsonThreadStore, MemorySettings, MemoryThreads, MemoryWorkspaces, SettingsStore, ThreadFlags,
    ThreadRecord, ThreadStore, WorkspaceEntry, WorkspaceStore,
};
pub use turn::{CoordinatorState, TurnCoordinator};
