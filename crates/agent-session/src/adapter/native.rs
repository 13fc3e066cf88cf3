//! Adapter for backends that speak the app-server JSON-RPC protocol.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use app_server_client::{
    AppServerChannels, AppServerClient, AppServerConfig, ApprovalResponse, ClientError,
    ExitReason, InitializeCapabilities, InitializeParams, ModelListParams, ProcessConfig,
    ProcessHandle, RpcError, ServerNotification, ServerRequest, ThreadListParams,
    ThreadResumeParams, ThreadStartParams, ThreadSummary, TransportDiagnostic, TransportFailure,
    TurnInterruptParams, TurnStartParams, UserInput,
};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{
    AdapterEvent, ApprovalDecision, ApprovalKind, BackendAdapter, BackendTurnOutcome,
    LaunchOptions, ModelCatalog, PendingApproval, ProgressKind, TurnContent, TurnDispatch,
    TurnProgress,
};
use crate::binding::AdapterBinding;
use crate::capability::{AdapterTier, Capabilities, CapabilityOutcome};
use crate::error::{AdapterError, SessionError};
use crate::ids::ApprovalId;

const METHOD_NOT_FOUND: i64 = -32601;
const PAGE_LIMIT: u32 = 100;

pub struct NativeAdapter {
    client: Arc<AppServerClient>,
    process: Arc<ProcessHandle>,
    capabilities: Capabilities,
    cwd: PathBuf,
}

impl NativeAdapter {
    /// Spawn the app-server, start the event pump and run the
    /// `initialize`/`initialized` handshake.
    pub async fn launch(
        binding: &AdapterBinding,
        options: &LaunchOptions,
        events: mpsc::Sender<AdapterEvent>,
    ) -> Result<Self, SessionError> {
        let mut config = AppServerConfig::new(ProcessConfig {
            program: binding.program.clone(),
            args: binding.args.clone(),
            cwd: options.cwd.clone(),
            env: binding.env.clone(),
            home: binding.home.clone(),
            inherit_env: binding.inherit_env.clone(),
        });
        config.wire_log = options.wire_log.clone();
        config.max_consecutive_malformed = options.max_consecutive_malformed;
        config.request_timeout = options.request_timeout;

        let (client, channels) = AppServerClient::spawn(config)?;
        let Some(process) = client.process().cloned() else {
            return Err(SessionError::Handshake(AdapterError::Backend(
                "app-server client has no process".to_string(),
            )));
        };
        let client = Arc::new(client);

        tokio::spawn(pump_events(
            channels,
            client.clone(),
            process.clone(),
            events,
            options.grace,
        ));

        let params = InitializeParams {
            client_info: options.client_info.clone(),
            capabilities: Some(InitializeCapabilities {
                experimental_api: true,
                opt_out_notification_methods: None,
            }),
        };
        match tokio::time::timeout(options.initialize_timeout, client.initialize(params)).await {
            Ok(Ok(response)) => {
                tracing::debug!(user_agent = ?response.user_agent, "App-server initialized");
            }
            Ok(Err(err)) => {
                process.kill();
                return Err(SessionError::Handshake(err.into()));
            }
            Err(_) => {
                tracing::warn!(program = %binding.program, timeout = ?options.initialize_timeout, "App-server did not respond to initialize");
                process.kill();
                return Err(SessionError::Handshake(AdapterError::InitializeTimeout(
                    options.initialize_timeout,
                )));
            }
        }

        Ok(Self {
            client,
            process,
            capabilities: binding.capabilities,
            cwd: options.cwd.clone(),
        })
    }

    fn cwd_string(&self) -> String {
        self.cwd.display().to_string()
    }
}

#[async_trait]
impl BackendAdapter for NativeAdapter {
    fn tier(&self) -> AdapterTier {
        AdapterTier::Native
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn is_alive(&self) -> bool {
        self.process.is_alive()
    }

    async fn start_thread(&self, cwd: &Path) -> Result<Option<String>, AdapterError> {
        let params = ThreadStartParams {
            cwd: Some(cwd.display().to_string()),
            ..ThreadStartParams::default()
        };
        let response: Value = self.client.request("thread/start", Some(&params)).await?;
        Ok(thread_id_from_result(&response))
    }

    async fn resume_thread(
        &self,
        backend_thread_id: &str,
        cwd: &Path,
    ) -> Result<CapabilityOutcome<String>, AdapterError> {
        let params = ThreadResumeParams {
            thread_id: backend_thread_id.to_string(),
            cwd: Some(cwd.display().to_string()),
            ..ThreadResumeParams::default()
        };
        let response: Value = self.client.request("thread/resume", Some(&params)).await?;
        Ok(CapabilityOutcome::Done(
            thread_id_from_result(&response).unwrap_or_else(|| backend_thread_id.to_string()),
        ))
    }

    async fn list_threads(
        &self,
        cwd: &Path,
    ) -> Result<CapabilityOutcome<Vec<ThreadSummary>>, AdapterError> {
        if !self.capabilities.thread_list {
            return Ok(CapabilityOutcome::Unsupported);
        }
        let mut cursor = None;
        let mut threads = Vec::new();
        loop {
            let response = self
                .client
                .thread_list(ThreadListParams {
                    cursor: cursor.clone(),
                    limit: Some(PAGE_LIMIT),
                    cwd: Some(cwd.display().to_string()),
                    ..ThreadListParams::default()
                })
                .await?;
            threads.extend(response.data);
            match response.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(CapabilityOutcome::Done(threads))
    }

    async fn start_turn(
        &self,
        backend_thread_id: &str,
        content: &TurnContent,
    ) -> Result<TurnDispatch, AdapterError> {
        let collaboration_mode = if self.capabilities.collaboration_modes {
            content.collaboration_mode.clone()
        } else {
            None
        };
        let params = TurnStartParams {
            thread_id: backend_thread_id.to_string(),
            input: vec![UserInput::Text {
                text: content.text.clone(),
            }],
            cwd: Some(self.cwd.clone()),
            model: content.model.clone(),
            effort: content.effort,
            collaboration_mode,
            ..TurnStartParams::default()
        };
        let response: Value = self.client.request("turn/start", Some(&params)).await?;
        Ok(match turn_id_from_value(&response) {
            Some(backend_turn_id) => TurnDispatch::Started { backend_turn_id },
            None => {
                tracing::debug!(thread_id = backend_thread_id, cwd = %self.cwd_string(), "turn/start returned no turn id");
                TurnDispatch::Completed
            }
        })
    }

    async fn interrupt_turn(
        &self,
        backend_thread_id: &str,
        backend_turn_id: &str,
    ) -> Result<CapabilityOutcome<()>, AdapterError> {
        if !self.capabilities.interrupt {
            return Ok(CapabilityOutcome::Unsupported);
        }
        let params = TurnInterruptParams {
            thread_id: backend_thread_id.to_string(),
            turn_id: backend_turn_id.to_string(),
        };
        match self.client.turn_interrupt(params).await {
            Ok(_) => {}
            // The turn may already be over; the server says so with an error.
            Err(ClientError::Rpc(err)) => {
                tracing::debug!(turn_id = backend_turn_id, error = %err, "turn/interrupt rejected");
            }
            // Servers that answer with a bare result are fine too.
            Err(ClientError::Decode { .. }) => {}
            Err(err) => return Err(err.into()),
        }
        Ok(CapabilityOutcome::Done(()))
    }

    async fn respond_to_approval(
        &self,
        id: &ApprovalId,
        decision: ApprovalDecision,
    ) -> Result<CapabilityOutcome<()>, AdapterError> {
        if !self.capabilities.approvals {
            return Ok(CapabilityOutcome::Unsupported);
        }
        self.client
            .respond(
                id.request_id(),
                &ApprovalResponse {
                    decision: decision.to_wire(),
                },
            )
            .await?;
        Ok(CapabilityOutcome::Done(()))
    }

    async fn list_models(&self) -> Result<CapabilityOutcome<ModelCatalog>, AdapterError> {
        if !self.capabilities.model_list {
            return Ok(CapabilityOutcome::Unsupported);
        }
        let mut cursor = None;
        let mut raw = Vec::new();
        loop {
            let response = self
                .client
                .model_list(ModelListParams {
                    cursor: cursor.clone(),
                    limit: Some(PAGE_LIMIT),
                })
                .await?;
            raw.extend(response.data);
            match response.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(CapabilityOutcome::Done(dedup_models(raw)))
    }

    async fn shutdown(&self, grace: Duration) -> Option<ExitReason> {
        Some(self.process.shutdown(grace).await)
    }
}

fn dedup_models(raw: Vec<app_server_client::ModelInfo>) -> ModelCatalog {
    let mut seen = HashSet::new();
    let mut catalog = ModelCatalog::default();
    for model in raw {
        let name = if model.model.trim().is_empty() {
            model.id.trim().to_string()
        } else {
            model.model.trim().to_string()
        };
        if name.is_empty() || !seen.insert(name.clone()) {
            continue;
        }
        if model.is_default && catalog.default_model.is_none() {
            catalog.default_model = Some(name);
        }
        catalog.models.push(model);
    }
    catalog
}

async fn pump_events(
    mut channels: AppServerChannels,
    client: Arc<AppServerClient>,
    process: Arc<ProcessHandle>,
    events: mpsc::Sender<AdapterEvent>,
    grace: Duration,
) {
    let failure = loop {
        tokio::select! {
            biased;
            Some(notification) = channels.notifications.recv() => {
                if let Some(event) = normalize_notification(notification) {
                    let _ = events.send(event).await;
                }
            }
            Some(request) = channels.requests.recv() => {
                if let Some(event) = route_server_request(&client, request).await {
                    let _ = events.send(event).await;
                }
            }
            Some(diagnostic) = channels.diagnostics.recv() => {
                let _ = events.send(diagnostic_event(diagnostic)).await;
            }
            closed = &mut channels.closed => {
                break closed.unwrap_or(TransportFailure::Closed);
            }
        }
    };

    // The reader queued everything before signalling close.
    while let Ok(notification) = channels.notifications.try_recv() {
        if let Some(event) = normalize_notification(notification) {
            let _ = events.send(event).await;
        }
    }

    let detail = match failure {
        TransportFailure::Closed => None,
        TransportFailure::Read(err) => Some(format!("reading backend output failed: {err}")),
        TransportFailure::MalformedLimit { consecutive } => {
            Some(format!("{consecutive} consecutive malformed frames"))
        }
    };
    if let Some(detail) = detail {
        tracing::warn!(program = %process.program(), %detail, "App-server transport failed, stopping backend");
        let _ = events.send(AdapterEvent::ProtocolFailure { detail }).await;
        process.kill();
    }

    let reason = match tokio::time::timeout(grace, process.wait()).await {
        Ok(reason) => reason,
        Err(_) => process.shutdown(grace).await,
    };
    while let Ok(diagnostic) = channels.diagnostics.try_recv() {
        let _ = events.send(diagnostic_event(diagnostic)).await;
    }
    tracing::info!(program = %process.program(), exit = %reason.label(), "App-server exited");
    let _ = events.send(AdapterEvent::Exited { reason }).await;
}

fn diagnostic_event(diagnostic: TransportDiagnostic) -> AdapterEvent {
    let message = match diagnostic {
        TransportDiagnostic::Stderr(line) => line,
        TransportDiagnostic::MalformedFrame { error, raw } => {
            format!("ignored malformed frame ({error}): {raw}")
        }
    };
    AdapterEvent::Diagnostic { message }
}

async fn route_server_request(
    client: &AppServerClient,
    request: ServerRequest,
) -> Option<AdapterEvent> {
    let kind = match request.method.as_str() {
        "item/commandExecution/requestApproval" => ApprovalKind::CommandExecution,
        "item/fileChange/requestApproval" => ApprovalKind::FileChange,
        method => {
            tracing::debug!(method, id = %request.id, "Rejecting unsupported server request");
            let error = RpcError {
                code: METHOD_NOT_FOUND,
                message: format!("unsupported server request: {method}"),
                data: None,
            };
            if let Err(err) = client.respond_error(&request.id, &error).await {
                tracing::warn!(method, error = %err, "Failed to reject server request");
            }
            return None;
        }
    };
    let params = request.params.unwrap_or(Value::Null);
    Some(AdapterEvent::ApprovalRequested {
        backend_turn_id: string_field(&params, "turnId"),
        approval: PendingApproval {
            id: ApprovalId::new(request.id),
            kind,
            details: params,
        },
    })
}

fn normalize_notification(notification: ServerNotification) -> Option<AdapterEvent> {
    let method = notification.method;
    let params = notification.params.unwrap_or(Value::Null);
    let backend_turn_id =
        string_field(&params, "turnId").or_else(|| turn_id_from_value(&params));

    let progress = |kind: ProgressKind, delta: Option<String>| AdapterEvent::Progress {
        backend_turn_id: backend_turn_id.clone(),
        progress: TurnProgress {
            kind,
            delta,
            method: Some(method.clone()),
            raw: None,
        },
    };

    let event = match method.as_str() {
        "turn/started" => AdapterEvent::TurnStarted {
            backend_turn_id: backend_turn_id.clone()?,
        },
        "turn/completed" => AdapterEvent::TurnCompleted {
            backend_turn_id: backend_turn_id.clone(),
            outcome: turn_outcome(&params),
        },
        "item/agentMessage/delta" | "agent_message/delta" => {
            progress(ProgressKind::AgentMessage, string_field(&params, "delta"))
        }
        "item/reasoning/summaryTextDelta" | "item/reasoning/textDelta" => {
            progress(ProgressKind::Reasoning, string_field(&params, "delta"))
        }
        "item/commandExecution/outputDelta" => {
            progress(ProgressKind::CommandOutput, string_field(&params, "delta"))
        }
        "item/fileChange/outputDelta" => {
            progress(ProgressKind::FileChange, string_field(&params, "delta"))
        }
        "item/plan/delta" => progress(ProgressKind::Plan, string_field(&params, "delta")),
        "turn/plan/updated" => progress(ProgressKind::Plan, string_field(&params, "explanation")),
        "turn/diff/updated" => progress(ProgressKind::Diff, string_field(&params, "diff")),
        "item/started" | "item/completed" => {
            let kind = if method == "item/started" {
                ProgressKind::ItemStarted
            } else {
                ProgressKind::ItemCompleted
            };
            AdapterEvent::Progress {
                backend_turn_id: backend_turn_id.clone(),
                progress: TurnProgress {
                    kind,
                    delta: params
                        .get("item")
                        .and_then(|item| item.get("type"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    method: Some(method.clone()),
                    raw: params.get("item").cloned(),
                },
            }
        }
        "error" | "turn/error" => progress(
            ProgressKind::Error,
            Some(error_message(&params).unwrap_or_else(|| "unknown turn error".to_string())),
        ),
        _ => {
            // Thread-level chatter outside a turn is of no interest here.
            backend_turn_id.as_ref()?;
            AdapterEvent::Progress {
                backend_turn_id: backend_turn_id.clone(),
                progress: TurnProgress {
                    kind: ProgressKind::Other,
                    delta: None,
                    method: Some(method.clone()),
                    raw: Some(params.clone()),
                },
            }
        }
    };
    Some(event)
}

fn turn_outcome(params: &Value) -> BackendTurnOutcome {
    let status = params
        .get("turn")
        .and_then(|turn| turn.get("status"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| string_field(params, "status"));
    let error = params
        .get("turn")
        .and_then(error_message)
        .or_else(|| error_message(params));
    match (status.as_deref(), error) {
        (Some("interrupted"), _) => BackendTurnOutcome::Interrupted,
        (Some("failed"), message) | (_, message @ Some(_)) => BackendTurnOutcome::Failed {
            message: message.unwrap_or_else(|| "turn failed".to_string()),
        },
        _ => BackendTurnOutcome::Completed,
    }
}

fn error_message(value: &Value) -> Option<String> {
    value
        .get("error")
        .and_then(|error| error.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// `threadId`, `thread_id` or `thread.id`, in that order.
fn thread_id_from_result(value: &Value) -> Option<String> {
    string_field(value, "threadId")
        .or_else(|| string_field(value, "thread_id"))
        .or_else(|| {
            value
                .get("thread")
                .and_then(|thread| thread.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
}

fn turn_id_from_value(value: &Value) -> Option<String> {
    value
        .get("turn")
        .and_then(|turn| turn.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn string_field(value: &Value, field: &str) -> Option<String> {
    value.get(field).and_then(Value::as_str).map(str::to_string)
}
