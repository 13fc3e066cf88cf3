//! Adapter for CLIs with a print mode that emits one JSON event per line.
//!
//! Every turn is its own process: the prompt goes on the command line with
//! `--output-format stream-json`, and `--resume <session>` is added once the
//! CLI has reported its session id. The process ends with the turn, so an
//! interrupt is a kill. Claude, Gemini and Cursor name their events
//! differently; [`StreamDialect`] selects the vocabulary.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use app_server_client::{
    ExitReason, ModelInfo, ProcessConfig, ProcessHandle, ProcessOutput, SpawnError, ThreadSummary,
    WriteError, read_line_lossy, resolve_binary,
};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::BufReader;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use super::{
    AdapterEvent, ApprovalDecision, BackendAdapter, BackendTurnOutcome, LaunchOptions,
    ModelCatalog, ProgressKind, TurnContent, TurnDispatch, TurnProgress,
};
use crate::binding::AdapterBinding;
use crate::capability::{AdapterTier, Capabilities, CapabilityOutcome, StreamDialect};
use crate::error::{AdapterError, SessionError};
use crate::ids::ApprovalId;

/// Upper bound on waiting for a killed turn's output to drain.
const STOP_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

struct ActiveTurn {
    backend_turn_id: String,
    process: Arc<ProcessHandle>,
    interrupted: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

pub struct StreamJsonAdapter {
    dialect: StreamDialect,
    program: String,
    user_args: Vec<String>,
    cwd: PathBuf,
    env: Vec<(String, String)>,
    home: Option<(String, PathBuf)>,
    inherit_env: Vec<String>,
    capabilities: Capabilities,
    models: Vec<ModelInfo>,
    session_id: Arc<StdMutex<Option<String>>>,
    active: Mutex<Option<ActiveTurn>>,
    events: mpsc::Sender<AdapterEvent>,
    closed: AtomicBool,
    next_turn: AtomicU64,
    grace: Duration,
}

impl StreamJsonAdapter {
    /// Nothing runs until the first turn, but a missing binary or working
    /// directory fails here like it does for the long-lived adapters.
    pub fn launch(
        binding: &AdapterBinding,
        options: &LaunchOptions,
        dialect: StreamDialect,
        events: mpsc::Sender<AdapterEvent>,
    ) -> Result<Self, SessionError> {
        if !options.cwd.is_dir() {
            return Err(SpawnError::WorkingDirInvalid {
                path: options.cwd.clone(),
            }
            .into());
        }
        let home_var = binding.home.as_ref().map(|(var, _)| var.as_str());
        if resolve_binary(&binding.program, home_var).is_none() {
            return Err(SpawnError::BinaryNotFound {
                program: binding.program.clone(),
            }
            .into());
        }
        Ok(Self {
            dialect,
            program: binding.program.clone(),
            user_args: binding.args.clone(),
            cwd: options.cwd.clone(),
            env: binding.env.clone(),
            home: binding.home.clone(),
            inherit_env: binding.inherit_env.clone(),
            capabilities: binding.capabilities,
            models: binding.models.clone(),
            session_id: Arc::new(StdMutex::new(None)),
            active: Mutex::new(None),
            events,
            closed: AtomicBool::new(false),
            next_turn: AtomicU64::new(1),
            grace: options.grace,
        })
    }

    fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Kill a turn's process and wait for its reader to report the end.
    async fn stop(&self, turn: ActiveTurn, grace: Duration) -> ExitReason {
        turn.interrupted.store(true, Ordering::SeqCst);
        let reason = turn.process.shutdown(grace).await;
        let mut reader = turn.reader;
        if tokio::time::timeout(STOP_SETTLE_TIMEOUT, &mut reader)
            .await
            .is_err()
        {
            tracing::warn!(program = %self.program, backend_turn_id = %turn.backend_turn_id, "Turn output did not drain after kill");
            reader.abort();
        }
        reason
    }
}

#[async_trait]
impl BackendAdapter for StreamJsonAdapter {
    fn tier(&self) -> AdapterTier {
        AdapterTier::Headless
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn start_thread(&self, _cwd: &Path) -> Result<Option<String>, AdapterError> {
        Ok(None)
    }

    async fn resume_thread(
        &self,
        backend_thread_id: &str,
        _cwd: &Path,
    ) -> Result<CapabilityOutcome<String>, AdapterError> {
        *self
            .session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(backend_thread_id.to_string());
        Ok(CapabilityOutcome::Done(backend_thread_id.to_string()))
    }

    async fn list_threads(
        &self,
        _cwd: &Path,
    ) -> Result<CapabilityOutcome<Vec<ThreadSummary>>, AdapterError> {
        Ok(CapabilityOutcome::Unsupported)
    }

    async fn start_turn(
        &self,
        _backend_thread_id: &str,
        content: &TurnContent,
    ) -> Result<TurnDispatch, AdapterError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WriteError::ProcessExited.into());
        }
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            self.stop(previous, Duration::ZERO).await;
        }

        let session_id = self.session_id();
        let mut args = self.user_args.clone();
        args.extend(turn_args(self.dialect, session_id.as_deref(), content));
        let (process, output) = ProcessHandle::spawn(ProcessConfig {
            program: self.program.clone(),
            args,
            cwd: self.cwd.clone(),
            env: self.env.clone(),
            home: self.home.clone(),
            inherit_env: self.inherit_env.clone(),
        })?;
        process.close_stdin().await;
        let process = Arc::new(process);

        let backend_turn_id = format!(
            "stream-turn-{}",
            self.next_turn.fetch_add(1, Ordering::Relaxed)
        );
        let interrupted = Arc::new(AtomicBool::new(false));
        let reader = TurnReader {
            dialect: self.dialect,
            backend_turn_id: backend_turn_id.clone(),
            events: self.events.clone(),
            session_id: self.session_id.clone(),
            interrupted: interrupted.clone(),
            finished: false,
        };
        let reader = tokio::spawn(read_turn(reader, output, process.clone(), self.grace));
        tracing::debug!(
            program = %self.program,
            %backend_turn_id,
            resume = ?session_id,
            pid = ?process.pid(),
            "Stream-json turn spawned"
        );
        *active = Some(ActiveTurn {
            backend_turn_id: backend_turn_id.clone(),
            process,
            interrupted,
            reader,
        });
        Ok(TurnDispatch::Started { backend_turn_id })
    }

    async fn interrupt_turn(
        &self,
        _backend_thread_id: &str,
        backend_turn_id: &str,
    ) -> Result<CapabilityOutcome<()>, AdapterError> {
        let mut active = self.active.lock().await;
        match active.take() {
            Some(turn) if turn.backend_turn_id == backend_turn_id => {
                self.stop(turn, self.grace).await;
            }
            other => *active = other,
        }
        Ok(CapabilityOutcome::Done(()))
    }

    async fn respond_to_approval(
        &self,
        _id: &ApprovalId,
        _decision: ApprovalDecision,
    ) -> Result<CapabilityOutcome<()>, AdapterError> {
        Ok(CapabilityOutcome::Unsupported)
    }

    async fn list_models(&self) -> Result<CapabilityOutcome<ModelCatalog>, AdapterError> {
        if !self.capabilities.model_list || self.models.is_empty() {
            return Ok(CapabilityOutcome::Unsupported);
        }
        Ok(CapabilityOutcome::Done(ModelCatalog {
            default_model: self
                .models
                .iter()
                .find(|model| model.is_default)
                .map(|model| model.id.clone()),
            models: self.models.clone(),
        }))
    }

    async fn shutdown(&self, grace: Duration) -> Option<ExitReason> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return None;
        }
        let active = self.active.lock().await.take();
        let exit = match active {
            Some(turn) => Some(self.stop(turn, grace).await),
            None => None,
        };
        tracing::info!(program = %self.program, exit = ?exit.map(ExitReason::label), "Stream-json backend closed");
        let _ = self
            .events
            .send(AdapterEvent::Exited {
                reason: exit.unwrap_or(ExitReason::Killed),
            })
            .await;
        exit
    }
}

/// Arguments for one turn, appended after the user's own.
fn turn_args(dialect: StreamDialect, session_id: Option<&str>, content: &TurnContent) -> Vec<String> {
    let mut args: Vec<String> = match dialect {
        StreamDialect::Claude => vec!["-p", "--output-format", "stream-json", "--verbose"],
        StreamDialect::Gemini => vec!["--output-format", "stream-json"],
        StreamDialect::Cursor => vec!["-p", "--output-format", "stream-json"],
    }
    .into_iter()
    .map(str::to_string)
    .collect();
    if let Some(model) = content.model.as_deref().filter(|model| !model.trim().is_empty()) {
        args.extend(["--model".to_string(), model.to_string()]);
    }
    if let Some(session_id) = session_id {
        args.extend(["--resume".to_string(), session_id.to_string()]);
    }
    // Gemini's -p takes the prompt as its value.
    if dialect == StreamDialect::Gemini {
        args.push("-p".to_string());
    }
    args.push(content.text.clone());
    args
}

/// What one decoded event line carries.
#[derive(Debug, Clone, PartialEq)]
enum StreamItem {
    Session(String),
    Progress(TurnProgress),
    Finished(BackendTurnOutcome),
}

fn parse_event(dialect: StreamDialect, event: &Value) -> Vec<StreamItem> {
    let Some(event_type) = event.get("type").and_then(Value::as_str) else {
        return Vec::new();
    };
    let subtype = event.get("subtype").and_then(Value::as_str).unwrap_or("");
    let mut items = Vec::new();
    match (dialect, event_type) {
        (_, "result") => {
            if let Some(session_id) = str_field(event, "session_id") {
                items.push(StreamItem::Session(session_id.to_string()));
            }
            items.push(StreamItem::Finished(result_outcome(event)));
        }
        (StreamDialect::Claude | StreamDialect::Cursor, "system") if subtype == "init" => {
            items.extend(session_item(event));
        }
        (StreamDialect::Gemini, "init") => items.extend(session_item(event)),

        (StreamDialect::Claude, "content_block_delta") => {
            if event.pointer("/delta/type").and_then(Value::as_str) == Some("text_delta")
                && let Some(text) = event.pointer("/delta/text").and_then(Value::as_str)
            {
                items.push(progress(ProgressKind::AgentMessage, text));
            }
        }
        (StreamDialect::Claude, "content_block_start") => {
            if event.pointer("/content_block/type").and_then(Value::as_str) == Some("tool_use")
                && let Some(name) = event.pointer("/content_block/name").and_then(Value::as_str)
            {
                items.push(progress(ProgressKind::ToolStarted, name));
            }
        }
        (StreamDialect::Claude, "assistant" | "user") => {
            for block in content_blocks(event) {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => items.extend(
                        str_field(block, "text").map(|text| progress(ProgressKind::AgentMessage, text)),
                    ),
                    Some("thinking") => items.extend(
                        str_field(block, "thinking")
                            .map(|text| progress(ProgressKind::Reasoning, text)),
                    ),
                    Some("tool_use") => items.extend(
                        str_field(block, "name").map(|name| progress(ProgressKind::ToolStarted, name)),
                    ),
                    Some("tool_result") => items.push(progress(
                        ProgressKind::ItemCompleted,
                        str_field(block, "tool_use_id").unwrap_or(""),
                    )),
                    _ => {}
                }
            }
        }
        (StreamDialect::Claude, "tool_result") => items.push(progress(
            ProgressKind::ItemCompleted,
            str_field(event, "tool_use_id").unwrap_or(""),
        )),

        (StreamDialect::Gemini, "message") => {
            if str_field(event, "role") == Some("assistant")
                && let Some(text) = str_field(event, "content")
            {
                items.push(progress(ProgressKind::AgentMessage, text));
            }
        }
        (StreamDialect::Gemini, "tool_use") => items.push(progress(
            ProgressKind::ToolStarted,
            str_field(event, "tool_name").unwrap_or("tool"),
        )),
        (StreamDialect::Gemini, "tool_result") => items.push(progress(
            ProgressKind::ItemCompleted,
            str_field(event, "tool_id").unwrap_or(""),
        )),
        (StreamDialect::Gemini, "error") => items.push(progress(
            ProgressKind::Error,
            str_field(event, "message").unwrap_or("backend error"),
        )),

        (StreamDialect::Cursor, "assistant") => {
            for block in content_blocks(event) {
                if let Some(text) = str_field(block, "text") {
                    items.push(progress(ProgressKind::AgentMessage, text));
                }
            }
        }
        (StreamDialect::Cursor, "tool_call") => match subtype {
            "started" => items.push(progress(ProgressKind::ToolStarted, cursor_tool_name(event))),
            "completed" => items.push(progress(
                ProgressKind::ItemCompleted,
                str_field(event, "call_id").unwrap_or(""),
            )),
            _ => {}
        },
        _ => {}
    }
    items
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn session_item(event: &Value) -> Option<StreamItem> {
    str_field(event, "session_id")
        .filter(|id| !id.is_empty())
        .map(|id| StreamItem::Session(id.to_string()))
}

fn content_blocks(event: &Value) -> impl Iterator<Item = &Value> {
    event
        .pointer("/message/content")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn progress(kind: ProgressKind, delta: &str) -> StreamItem {
    StreamItem::Progress(TurnProgress::delta(kind, delta))
}

/// Cursor names a tool by a `<Name>ToolCall` key.
fn cursor_tool_name(event: &Value) -> &str {
    event
        .as_object()
        .and_then(|fields| fields.keys().find_map(|key| key.strip_suffix("ToolCall")))
        .or_else(|| str_field(event, "tool_name"))
        .unwrap_or("tool")
}

fn result_outcome(event: &Value) -> BackendTurnOutcome {
    let failed = event.get("is_error").and_then(Value::as_bool) == Some(true)
        || str_field(event, "status") == Some("error")
        || str_field(event, "subtype").is_some_and(|subtype| subtype.starts_with("error"));
    if !failed {
        return BackendTurnOutcome::Completed;
    }
    let message = event
        .pointer("/error/message")
        .and_then(Value::as_str)
        .or_else(|| str_field(event, "result"))
        .or_else(|| str_field(event, "subtype"))
        .unwrap_or("turn failed");
    BackendTurnOutcome::Failed {
        message: message.to_string(),
    }
}

/// How a turn ended when the CLI exited without a result event.
fn exit_outcome(reason: ExitReason, interrupted: bool) -> BackendTurnOutcome {
    if interrupted || reason == ExitReason::Killed {
        BackendTurnOutcome::Interrupted
    } else if reason.is_clean() {
        BackendTurnOutcome::Completed
    } else {
        BackendTurnOutcome::Failed {
            message: format!("backend {}", reason.label()),
        }
    }
}

struct TurnReader {
    dialect: StreamDialect,
    backend_turn_id: String,
    events: mpsc::Sender<AdapterEvent>,
    session_id: Arc<StdMutex<Option<String>>>,
    interrupted: Arc<AtomicBool>,
    finished: bool,
}

impl TurnReader {
    /// Translate one stdout line into events.
    fn translate(&mut self, line: &str) -> Vec<AdapterEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        let Ok(event) = serde_json::from_str::<Value>(trimmed) else {
            return vec![AdapterEvent::Diagnostic {
                message: line.to_string(),
            }];
        };
        let mut events = Vec::new();
        for item in parse_event(self.dialect, &event) {
            match item {
                StreamItem::Session(session_id) => {
                    let mut current = self.session_id.lock().unwrap_or_else(PoisonError::into_inner);
                    if current.as_deref() != Some(session_id.as_str()) {
                        *current = Some(session_id.clone());
                        events.push(AdapterEvent::BackendThreadAssigned {
                            backend_thread_id: session_id,
                        });
                    }
                }
                StreamItem::Progress(progress) => events.push(AdapterEvent::Progress {
                    backend_turn_id: Some(self.backend_turn_id.clone()),
                    progress,
                }),
                StreamItem::Finished(outcome) => {
                    if !self.finished {
                        self.finished = true;
                        events.push(AdapterEvent::TurnCompleted {
                            backend_turn_id: Some(self.backend_turn_id.clone()),
                            outcome,
                        });
                    }
                }
            }
        }
        events
    }

    async fn send(&self, event: AdapterEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!(backend_turn_id = %self.backend_turn_id, "Stream-json event receiver dropped");
        }
    }
}

async fn read_turn(
    mut reader: TurnReader,
    output: ProcessOutput,
    process: Arc<ProcessHandle>,
    grace: Duration,
) {
    let mut stdout = BufReader::new(output.stdout);
    let mut stderr = BufReader::new(output.stderr);
    let (mut stdout_buf, mut stderr_buf) = (Vec::new(), Vec::new());
    let mut stdout_open = true;
    let mut stderr_open = true;

    while stdout_open || stderr_open {
        tokio::select! {
            line = read_line_lossy(&mut stdout, &mut stdout_buf), if stdout_open => match line {
                Ok(Some(line)) => {
                    for event in reader.translate(&line) {
                        reader.send(event).await;
                    }
                }
                Ok(None) => stdout_open = false,
                Err(err) => {
                    tracing::debug!(error = %err, "Stream-json stdout read failed");
                    stdout_open = false;
                }
            },
            line = read_line_lossy(&mut stderr, &mut stderr_buf), if stderr_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => reader.send(AdapterEvent::Diagnostic { message: line }).await,
                Ok(None) => stderr_open = false,
                Err(err) => {
                    tracing::debug!(error = %err, "Stream-json stderr read failed");
                    stderr_open = false;
                }
            },
        }
    }

    let reason = match tokio::time::timeout(grace, process.wait()).await {
        Ok(reason) => reason,
        Err(_) => process.shutdown(grace).await,
    };
    tracing::debug!(
        program = %process.program(),
        backend_turn_id = %reader.backend_turn_id,
        exit = %reason.label(),
        "Stream-json turn process exited"
    );
    if !reader.finished {
        reader.finished = true;
        let outcome = exit_outcome(reason, reader.interrupted.load(Ordering::SeqCst));
        reader
            .send(AdapterEvent::TurnCompleted {
                backend_turn_id: Some(reader.backend_turn_id.clone()),
                outcome,
            })
            .await;
    }
}
