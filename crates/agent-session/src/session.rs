//! One live backend conversation: adapter, turn coordinator and the task
//! that turns adapter events into session events.
//!
//! Every coordinator transition happens under the session mutex and the
//! matching events are emitted before the mutex is released, so subscribers
//! see a thread's events in transition order. Adapter calls are made with
//! the mutex released.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use app_server_client::{ExitReason, ThreadSummary};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};

use crate::adapter::{
    self, AdapterEvent, AdapterEvents, ApprovalDecision, BackendAdapter, BackendTurnOutcome,
    LaunchOptions, ModelCatalog, TurnContent, TurnDispatch,
};
use crate::binding::AdapterBinding;
use crate::capability::{AdapterTier, BackendKind, CapabilityOutcome};
use crate::error::{AdapterError, HostError, SessionError, TurnError, TurnFailure};
use crate::events::{ApprovalOutcome, DisconnectReason, EventHub, SessionEvent, SessionEventKind};
use crate::ids::{ApprovalId, ThreadId, TurnId, WorkspaceId};
use crate::turn::{
    ApprovalRequest, CoordinatorState, InterruptOutcome, Resolved, StartAck, SubmitOutcome,
    Teardown, TurnCoordinator, TurnResolution, TurnTicket,
};

/// Everything needed to open a session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub workspace_id: WorkspaceId,
    pub thread_id: ThreadId,
    pub cwd: PathBuf,
    pub binding: AdapterBinding,
    pub launch: LaunchOptions,
    /// Backend thread to resume instead of starting a new one.
    pub resume: Option<String>,
    pub approval_timeout: Option<Duration>,
    /// Told when the backend assigns its thread id after the session opened.
    pub on_backend_thread: Option<BackendThreadHook>,
}

#[derive(Clone)]
pub struct BackendThreadHook(Arc<dyn Fn(&str) + Send + Sync>);

impl BackendThreadHook {
    pub fn new(hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self(Arc::new(hook))
    }
}

impl std::fmt::Debug for BackendThreadHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BackendThreadHook")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub turn_id: TurnId,
    /// Set when the turn had to wait behind others.
    pub queued_position: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub thread_id: ThreadId,
    pub workspace_id: WorkspaceId,
    pub backend_thread_id: Option<String>,
    pub backend: BackendKind,
    pub tier: AdapterTier,
    pub state: CoordinatorState,
    pub running_turn: Option<TurnId>,
    pub queued_turns: Vec<TurnId>,
    pub pending_approvals: Vec<ApprovalRequest>,
    pub opened_at: DateTime<Utc>,
}

/// Called once when the session's event loop ends.
pub type ExitHook = Box<dyn FnOnce() + Send>;

pub struct Session {
    workspace_id: WorkspaceId,
    thread_id: ThreadId,
    backend_thread_id: StdMutex<Option<String>>,
    on_backend_thread: Option<BackendThreadHook>,
    binding: AdapterBinding,
    adapter: Arc<dyn BackendAdapter>,
    coordinator: Mutex<TurnCoordinator>,
    hub: EventHub,
    grace: Duration,
    approval_timeout: Option<Duration>,
    opened_at: DateTime<Utc>,
    releasing: AtomicBool,
    evicting: AtomicBool,
    disconnected: AtomicBool,
    protocol_failure: StdMutex<Option<String>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("thread_id", &self.thread_id)
            .field("backend_thread_id", &self.backend_thread_id())
            .field("backend", &self.binding.kind)
            .field("tier", &self.binding.tier)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Spawn the backend, open or resume its thread and start the event
    /// loop. `on_exit` runs after the loop has emitted its final event.
    pub async fn open(
        request: SessionRequest,
        hub: EventHub,
        on_exit: Option<ExitHook>,
    ) -> Result<Arc<Self>, SessionError> {
        let SessionRequest {
            workspace_id,
            thread_id,
            cwd,
            binding,
            launch,
            resume,
            approval_timeout,
            on_backend_thread,
        } = request;
        let grace = launch.grace;
        let (adapter, events) = adapter::launch(&binding, &launch).await?;

        let backend_thread_id = match open_thread(adapter.as_ref(), &cwd, resume.as_deref()).await {
            Ok(id) => id,
            Err(err) => {
                tracing::warn!(
                    thread_id = %thread_id,
                    backend = %binding.kind,
                    error = %err,
                    "Backend could not open thread; stopping process"
                );
                let _ = adapter.shutdown(grace).await;
                return Err(SessionError::Thread(err));
            }
        };

        let session = Arc::new(Self {
            workspace_id,
            thread_id,
            backend_thread_id: StdMutex::new(backend_thread_id),
            on_backend_thread,
            binding,
            adapter,
            coordinator: Mutex::new(TurnCoordinator::new()),
            hub,
            grace,
            approval_timeout,
            opened_at: Utc::now(),
            releasing: AtomicBool::new(false),
            evicting: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            protocol_failure: StdMutex::new(None),
        });
        tracing::info!(
            thread_id = %session.thread_id,
            workspace_id = %session.workspace_id,
            backend_thread_id = ?session.backend_thread_id(),
            backend = %session.binding.kind,
            tier = session.binding.tier.as_str(),
            "Session opened"
        );
        session.emit(SessionEventKind::SessionConnected {
            backend: session.binding.kind,
            tier: session.binding.tier,
            capabilities: session.binding.capabilities,
        });
        tokio::spawn(Arc::clone(&session).run(events, on_exit));
        Ok(session)
    }

    #[must_use]
    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    #[must_use]
    pub fn workspace_id(&self) -> &WorkspaceId {
        &self.workspace_id
    }

    /// The backend's id for this conversation. `None` until the backend
    /// assigns one; stream-json CLIs report it with their first turn.
    #[must_use]
    pub fn backend_thread_id(&self) -> Option<String> {
        self.backend_thread_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// What adapter calls address: the backend id, else the host's own id.
    fn backend_thread_key(&self) -> String {
        self.backend_thread_id()
            .unwrap_or_else(|| self.thread_id.to_string())
    }

    #[must_use]
    pub fn binding(&self) -> &AdapterBinding {
        &self.binding
    }

    /// False once the process exited or the session was torn down.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
            && !self.releasing.load(Ordering::SeqCst)
            && self.adapter.is_alive()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let coordinator = self.coordinator.lock().await;
        SessionSnapshot {
            thread_id: self.thread_id.clone(),
            workspace_id: self.workspace_id.clone(),
            backend_thread_id: self.backend_thread_id(),
            backend: self.binding.kind,
            tier: self.binding.tier,
            state: coordinator.state(),
            running_turn: coordinator.running_turn(),
            queued_turns: coordinator.queued(),
            pending_approvals: coordinator.open_approvals().to_vec(),
            opened_at: self.opened_at,
        }
    }

    /// Queue a user message. It starts right away when nothing else runs.
    pub async fn send(self: &Arc<Self>, content: TurnContent) -> Result<SubmitReceipt, TurnError> {
        let mut coordinator = self.coordinator.lock().await;
        match coordinator.submit(content)? {
            SubmitOutcome::Dispatch(ticket) => {
                let turn_id = ticket.id;
                self.start_dispatch(&coordinator, ticket);
                Ok(SubmitReceipt {
                    turn_id,
                    queued_position: None,
                })
            }
            SubmitOutcome::Queued { turn_id, position } => {
                tracing::debug!(thread_id = %self.thread_id, %turn_id, position, "Turn queued");
                self.emit(SessionEventKind::TurnQueued { turn_id, position });
                Ok(SubmitReceipt {
                    turn_id,
                    queued_position: Some(position),
                })
            }
        }
    }

    /// Stop the running turn. `Done(false)` when nothing was running.
    pub async fn interrupt(self: &Arc<Self>) -> Result<CapabilityOutcome<bool>, HostError> {
        if !self.binding.capabilities.interrupt {
            return Ok(CapabilityOutcome::Unsupported);
        }
        let outcome = {
            let mut coordinator = self.coordinator.lock().await;
            let outcome = coordinator.interrupt();
            if let InterruptOutcome::Interrupted {
                turn_id, cancelled, ..
            } = &outcome
            {
                self.emit_cancelled(cancelled);
                self.emit(SessionEventKind::TurnInterrupted { turn_id: *turn_id });
            }
            outcome
        };
        let InterruptOutcome::Interrupted {
            turn_id,
            backend_turn_id,
            cancelled,
        } = outcome
        else {
            return Ok(CapabilityOutcome::Done(false));
        };
        tracing::info!(thread_id = %self.thread_id, %turn_id, "Turn interrupted");
        self.cancel_toward_backend(&cancelled).await;

        // Without a backend turn id the dispatch task finishes the interrupt
        // once the backend answers turn/start.
        let Some(backend_turn_id) = backend_turn_id else {
            return Ok(CapabilityOutcome::Done(true));
        };
        let result = self
            .adapter
            .interrupt_turn(&self.backend_thread_key(), &backend_turn_id)
            .await;
        self.settle_interrupt().await;
        match result {
            Ok(_) => Ok(CapabilityOutcome::Done(true)),
            Err(err) if err.is_disconnect() => Ok(CapabilityOutcome::Done(true)),
            Err(err) => Err(err.into()),
        }
    }

    /// Answer an approval. Each approval accepts exactly one answer.
    pub async fn respond_to_approval(
        &self,
        id: &ApprovalId,
        decision: ApprovalDecision,
    ) -> Result<CapabilityOutcome<()>, HostError> {
        if !self.binding.capabilities.approvals {
            return Ok(CapabilityOutcome::Unsupported);
        }
        {
            let mut coordinator = self.coordinator.lock().await;
            let request = coordinator.resolve_approval(id)?;
            self.emit(SessionEventKind::ApprovalResolved {
                turn_id: request.turn_id,
                request_id: request.id,
                outcome: approval_outcome(decision),
            });
        }
        tracing::info!(thread_id = %self.thread_id, approval_id = %id, ?decision, "Approval answered");
        Ok(self.adapter.respond_to_approval(id, decision).await?)
    }

    pub async fn list_models(&self) -> Result<CapabilityOutcome<ModelCatalog>, AdapterError> {
        self.adapter.list_models().await
    }

    pub async fn list_backend_threads(
        &self,
        cwd: &std::path::Path,
    ) -> Result<CapabilityOutcome<Vec<ThreadSummary>>, AdapterError> {
        self.adapter.list_threads(cwd).await
    }

    /// Tear the session down: fail outstanding turns, stop the process
    /// (forced after the grace period) and report `Released`.
    pub async fn close(&self, grace: Option<Duration>) -> Option<ExitReason> {
        self.releasing.store(true, Ordering::SeqCst);
        self.teardown(&TurnFailure::SessionClosed).await;
        let exit = self.adapter.shutdown(grace.unwrap_or(self.grace)).await;
        tracing::info!(
            thread_id = %self.thread_id,
            exit = ?exit.map(ExitReason::label),
            "Session released"
        );
        self.disconnect(DisconnectReason::Released);
        exit
    }

    /// Drop a session whose process is already gone.
    pub async fn evict(&self) {
        self.evicting.store(true, Ordering::SeqCst);
        let exit = self.adapter.shutdown(Duration::ZERO).await;
        self.teardown(&exit.map_or(TurnFailure::ProcessKilled, TurnFailure::from_exit))
            .await;
        self.disconnect(DisconnectReason::Evicted);
    }

    fn emit(&self, kind: SessionEventKind) {
        self.hub.emit(SessionEvent {
            workspace_id: self.workspace_id.clone(),
            thread_id: self.thread_id.clone(),
            kind,
        });
    }

    fn emit_cancelled(&self, cancelled: &[ApprovalRequest]) {
        for approval in cancelled {
            self.emit(SessionEventKind::ApprovalResolved {
                turn_id: approval.turn_id,
                request_id: approval.id.clone(),
                outcome: ApprovalOutcome::Cancelled,
            });
        }
    }

    fn emit_resolution(&self, turn_id: TurnId, resolution: &TurnResolution) {
        let kind = match resolution {
            TurnResolution::Completed => SessionEventKind::TurnCompleted { turn_id },
            TurnResolution::Interrupted => SessionEventKind::TurnInterrupted { turn_id },
            TurnResolution::Failed(reason) => SessionEventKind::TurnFailed {
                turn_id,
                message: reason.to_string(),
                reason: reason.clone(),
            },
        };
        self.emit(kind);
    }

    /// Emit a resolved turn and start whatever comes next.
    fn finish(self: &Arc<Self>, coordinator: &MutexGuard<'_, TurnCoordinator>, resolved: Resolved) {
        tracing::debug!(
            thread_id = %self.thread_id,
            turn_id = %resolved.turn_id,
            resolution = ?resolved.resolution,
            "Turn resolved"
        );
        self.emit_cancelled(&resolved.cancelled);
        self.emit_resolution(resolved.turn_id, &resolved.resolution);
        if let Some(next) = resolved.next {
            self.start_dispatch(coordinator, next);
        }
        let cancelled = resolved.cancelled;
        if !cancelled.is_empty() {
            let session = Arc::clone(self);
            tokio::spawn(async move { session.cancel_toward_backend(&cancelled).await });
        }
    }

    /// Emit `TurnStarted` and hand the ticket to the backend. The guard
    /// proves the caller holds the coordinator.
    fn start_dispatch(self: &Arc<Self>, _coordinator: &MutexGuard<'_, TurnCoordinator>, ticket: TurnTicket) {
        self.emit(SessionEventKind::TurnStarted { turn_id: ticket.id });
        let session = Arc::clone(self);
        tokio::spawn(async move { session.dispatch(ticket).await });
    }

    async fn dispatch(self: Arc<Self>, ticket: TurnTicket) {
        let turn_id = ticket.id;
        let result = self
            .adapter
            .start_turn(&self.backend_thread_key(), &ticket.content)
            .await;
        let resolution = match result {
            Ok(TurnDispatch::Started { backend_turn_id }) => {
                let ack = self
                    .coordinator
                    .lock()
                    .await
                    .turn_started(turn_id, &backend_turn_id);
                tracing::debug!(thread_id = %self.thread_id, %turn_id, %backend_turn_id, ?ack, "Backend started turn");
                if ack == StartAck::InterruptBackend {
                    if let Err(err) = self
                        .adapter
                        .interrupt_turn(&self.backend_thread_key(), &backend_turn_id)
                        .await
                    {
                        tracing::warn!(thread_id = %self.thread_id, %turn_id, error = %err, "Late interrupt failed");
                    }
                    self.settle_interrupt().await;
                }
                return;
            }
            Ok(TurnDispatch::Completed) => TurnResolution::Completed,
            Err(err) if err.is_disconnect() => {
                // The exit handler fails the turn with the process's reason.
                tracing::debug!(thread_id = %self.thread_id, %turn_id, error = %err, "Backend gone while starting turn");
                return;
            }
            Err(err) => {
                tracing::warn!(thread_id = %self.thread_id, %turn_id, error = %err, "Backend rejected turn");
                TurnResolution::Failed(TurnFailure::Backend {
                    message: err.to_string(),
                })
            }
        };
        let mut coordinator = self.coordinator.lock().await;
        if let Some(resolved) = coordinator.complete(turn_id, resolution) {
            self.finish(&coordinator, resolved);
        } else if let Some(next) = coordinator.start_abandoned(turn_id) {
            self.start_dispatch(&coordinator, next);
        }
    }

    async fn settle_interrupt(self: &Arc<Self>) {
        let mut coordinator = self.coordinator.lock().await;
        if let Some(next) = coordinator.interrupt_settled() {
            self.start_dispatch(&coordinator, next);
        }
    }

    async fn cancel_toward_backend(&self, cancelled: &[ApprovalRequest]) {
        self.answer_toward_backend(cancelled, ApprovalDecision::Cancel)
            .await;
    }

    async fn answer_toward_backend(&self, approvals: &[ApprovalRequest], decision: ApprovalDecision) {
        if !self.adapter.is_alive() {
            return;
        }
        for approval in approvals {
            if let Err(err) = self.adapter.respond_to_approval(&approval.id, decision).await {
                tracing::debug!(
                    thread_id = %self.thread_id,
                    approval_id = %approval.id,
                    error = %err,
                    "Could not answer approval toward backend"
                );
            }
        }
    }

    async fn run(self: Arc<Self>, mut events: AdapterEvents, on_exit: Option<ExitHook>) {
        let mut expiry = self.approval_timeout.map(|timeout| {
            let period = (timeout / 4).clamp(Duration::from_millis(50), Duration::from_secs(1));
            tokio::time::interval(period)
        });
        let exit = loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(AdapterEvent::Exited { reason }) => break reason,
                    Some(event) => self.handle_event(event).await,
                    None => break ExitReason::Unknown,
                },
                () = next_tick(expiry.as_mut()) => self.expire_approvals().await,
            }
        };
        self.handle_exit(exit).await;
        if let Some(on_exit) = on_exit {
            on_exit();
        }
    }

    async fn handle_event(self: &Arc<Self>, event: AdapterEvent) {
        match event {
            AdapterEvent::TurnStarted { backend_turn_id } => {
                let claimed = self
                    .coordinator
                    .lock()
                    .await
                    .claim_event(Some(&backend_turn_id));
                if claimed.is_none() {
                    tracing::debug!(thread_id = %self.thread_id, %backend_turn_id, "Ignoring start of unknown backend turn");
                }
            }
            AdapterEvent::Progress {
                backend_turn_id,
                progress,
            } => {
                let mut coordinator = self.coordinator.lock().await;
                match coordinator.claim_event(backend_turn_id.as_deref()) {
                    Some(turn_id) => self.emit(SessionEventKind::TurnProgress { turn_id, progress }),
                    None => tracing::trace!(
                        thread_id = %self.thread_id,
                        backend_turn_id = ?backend_turn_id,
                        "Dropping progress for stale turn"
                    ),
                }
            }
            AdapterEvent::ApprovalRequested {
                backend_turn_id,
                approval,
            } => {
                let approval_id = approval.id.clone();
                let recorded = {
                    let mut coordinator = self.coordinator.lock().await;
                    let recorded = coordinator.approval_requested(
                        backend_turn_id.as_deref(),
                        approval,
                        Instant::now(),
                    );
                    if let Some(request) = &recorded {
                        self.emit(SessionEventKind::ApprovalRequested {
                            turn_id: request.turn_id,
                            request_id: request.id.clone(),
                            approval_kind: request.kind,
                            details: request.details.clone(),
                        });
                    }
                    recorded
                };
                if recorded.is_none() {
                    tracing::info!(
                        thread_id = %self.thread_id,
                        approval_id = %approval_id,
                        "Approval for a finished turn; cancelling"
                    );
                    if let Err(err) = self
                        .adapter
                        .respond_to_approval(&approval_id, ApprovalDecision::Cancel)
                        .await
                    {
                        tracing::debug!(thread_id = %self.thread_id, error = %err, "Could not cancel approval");
                    }
                }
            }
            AdapterEvent::TurnCompleted {
                backend_turn_id,
                outcome,
            } => {
                let resolution = match outcome {
                    BackendTurnOutcome::Completed => TurnResolution::Completed,
                    BackendTurnOutcome::Interrupted => TurnResolution::Interrupted,
                    BackendTurnOutcome::Failed { message } => {
                        TurnResolution::Failed(TurnFailure::Backend { message })
                    }
                };
                let mut coordinator = self.coordinator.lock().await;
                match coordinator.backend_completed(backend_turn_id.as_deref(), resolution) {
                    Some(resolved) => self.finish(&coordinator, resolved),
                    None => tracing::debug!(
                        thread_id = %self.thread_id,
                        backend_turn_id = ?backend_turn_id,
                        "Ignoring completion of stale turn"
                    ),
                }
            }
            AdapterEvent::BackendThreadAssigned { backend_thread_id } => {
                let previous = self
                    .backend_thread_id
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .replace(backend_thread_id.clone());
                if previous.as_deref() == Some(backend_thread_id.as_str()) {
                    return;
                }
                tracing::info!(thread_id = %self.thread_id, %backend_thread_id, "Backend assigned thread id");
                if let Some(hook) = &self.on_backend_thread {
                    (hook.0)(&backend_thread_id);
                }
            }
            AdapterEvent::Diagnostic { message } => {
                self.emit(SessionEventKind::Diagnostic { message });
            }
            AdapterEvent::ProtocolFailure { detail } => {
                tracing::warn!(thread_id = %self.thread_id, %detail, "Backend protocol failure");
                *self
                    .protocol_failure
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(detail);
            }
            AdapterEvent::Exited { .. } => {}
        }
    }

    async fn expire_approvals(&self) {
        let Some(timeout) = self.approval_timeout else {
            return;
        };
        let expired = {
            let mut coordinator = self.coordinator.lock().await;
            let expired = coordinator.expire_approvals(Instant::now(), timeout);
            for approval in &expired {
                self.emit(SessionEventKind::ApprovalResolved {
                    turn_id: approval.turn_id,
                    request_id: approval.id.clone(),
                    outcome: ApprovalOutcome::Expired,
                });
            }
            expired
        };
        if !expired.is_empty() {
            tracing::info!(thread_id = %self.thread_id, count = expired.len(), "Approvals expired");
            self.answer_toward_backend(&expired, ApprovalDecision::Reject)
                .await;
        }
    }

    async fn handle_exit(&self, exit: ExitReason) {
        let protocol_failure = self
            .protocol_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let failure = match &protocol_failure {
            Some(detail) => TurnFailure::ProtocolFailure {
                detail: detail.clone(),
            },
            None if self.releasing.load(Ordering::SeqCst) => TurnFailure::SessionClosed,
            None => TurnFailure::from_exit(exit),
        };
        self.teardown(&failure).await;
        if self.releasing.load(Ordering::SeqCst) || self.evicting.load(Ordering::SeqCst) {
            // close/evict report the disconnect themselves.
            return;
        }
        tracing::warn!(thread_id = %self.thread_id, exit = %exit.label(), "Backend process exited");
        let reason = match protocol_failure {
            Some(detail) => DisconnectReason::ProtocolFailure { detail },
            None => DisconnectReason::ProcessExited { exit },
        };
        self.disconnect(reason);
    }

    async fn teardown(&self, failure: &TurnFailure) {
        let mut coordinator = self.coordinator.lock().await;
        let Teardown {
            running,
            queued,
            cancelled,
        } = coordinator.fail_all(failure);
        self.emit_cancelled(&cancelled);
        if let Some((turn_id, failure)) = running {
            self.emit_resolution(turn_id, &TurnResolution::Failed(failure));
        }
        for turn_id in queued {
            self.emit_resolution(turn_id, &TurnResolution::Failed(TurnFailure::SessionClosed));
        }
    }

    fn disconnect(&self, reason: DisconnectReason) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.emit(SessionEventKind::SessionDisconnected { reason });
    }
}

async fn open_thread(
    adapter: &dyn BackendAdapter,
    cwd: &std::path::Path,
    resume: Option<&str>,
) -> Result<Option<String>, AdapterError> {
    if let Some(backend_thread_id) = resume {
        match adapter.resume_thread(backend_thread_id, cwd).await? {
            CapabilityOutcome::Done(id) => return Ok(Some(id)),
            CapabilityOutcome::Unsupported => {
                tracing::debug!(backend_thread_id, "Backend cannot resume threads; starting fresh");
            }
        }
    }
    adapter.start_thread(cwd).await
}

async fn next_tick(interval: Option<&mut tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn approval_outcome(decision: ApprovalDecision) -> ApprovalOutcome {
    match decision {
        ApprovalDecision::Accept => ApprovalOutcome::Accepted,
        ApprovalDecision::AcceptForSession => ApprovalOutcome::AcceptedForSession,
        ApprovalDecision::Reject => ApprovalOutcome::Rejected,
        ApprovalDecision::Cancel => ApprovalOutcome::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decisions_map_to_outcomes() {
        assert_eq!(approval_outcome(ApprovalDecision::Reject), ApprovalOutcome::Rejected);
        assert_eq!(
            approval_outcome(ApprovalDecision::AcceptForSession),
            ApprovalOutcome::AcceptedForSession
        );
    }

    #[tokio::test]
    async fn missing_interval_never_ticks() {
        let ticked = tokio::time::timeout(Duration::from_millis(20), next_tick(None)).await;
        assert!(ticked.is_err());
    }
}
