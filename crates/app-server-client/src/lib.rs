//! Child-process plumbing and the line-delimited JSON-RPC "app-server"
//! protocol spoken by structured coding-agent backends.
//!
//! [`ProcessHandle`] owns one backend child process and its standard streams.
//! [`codec`] turns frames into lines and back. [`AppServerClient`] layers the
//! request/response bookkeeping, server-request routing and the optional wire
//! log on top of either a spawned process or arbitrary async I/O.

mod client;
pub mod codec;
mod locate;
mod process;
mod types;

pub use client::{
    AppServerChannels, AppServerClient, AppServerConfig, AppServerWireLog, ClientError,
    DEFAULT_MAX_CONSECUTIVE_MALFORMED, SUPPORTED_CLIENT_REQUEST_METHODS,
    SUPPORTED_SERVER_NOTIFICATION_METHODS, SUPPORTED_SERVER_REQUEST_METHODS, TransportDiagnostic,
    TransportFailure,
};
pub use codec::{
    InboundFrame, MalformedFrame, RequestId, RequestIdAllocator, RpcError, ServerNotification,
    ServerRequest, read_line_lossy,
};
pub use locate::{augmented_path, common_bin_dirs, find_in_common_bins, resolve_binary};
pub use process::{
    ExitReason, INHERITED_ENV_VARS, ProcessConfig, ProcessHandle, ProcessOutput, SpawnError,
    WriteError,
};
pub use types::*;
