//! Command surface for the presentation layer.
//!
//! `AgentHost` ties the stores, binding resolution, the session registry and
//! the event hub together. Sessions are created lazily: a thread whose
//! process died is brought back on the next command that needs it. Thread
//! records are written through to a [`ThreadStore`] so a restarted host can
//! resume them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use app_server_client::{AppServerWireLog, SpawnError, ThreadSummary, resolve_binary};
use serde::Serialize;

use crate::adapter::{ApprovalDecision, LaunchOptions, ModelCatalog, TurnContent};
use crate::binding::{AdapterBinding, plan_binding};
use crate::capability::{AdapterTier, BackendKind, Capabilities, CapabilityOutcome};
use crate::config::MonitorConfig;
use crate::error::{HostError, StoreError, TurnError};
use crate::events::{EventHub, EventSubscription};
use crate::ids::{ApprovalId, ThreadId, WorkspaceId};
use crate::registry::SessionRegistry;
use crate::session::{BackendThreadHook, Session, SessionRequest, SessionSnapshot, SubmitReceipt};
use crate::store::{
    MemoryThreads, SettingsStore, ThreadFlags, ThreadRecord, ThreadStore, WorkspaceStore,
};

/// A connected workspace and the binding its sessions launch with.
#[derive(Debug, Clone)]
struct ConnectedWorkspace {
    path: PathBuf,
    binding: AdapterBinding,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceConnection {
    pub workspace_id: WorkspaceId,
    pub path: PathBuf,
    pub backend: BackendKind,
    pub tier: AdapterTier,
    pub program: String,
    pub capabilities: Capabilities,
}

/// Thread records, saved to the store after every change.
struct ThreadBook {
    records: Mutex<HashMap<ThreadId, ThreadRecord>>,
    store: Arc<dyn ThreadStore>,
}

impl ThreadBook {
    fn new(store: Arc<dyn ThreadStore>, records: Vec<ThreadRecord>) -> Self {
        Self {
            records: Mutex::new(
                records
                    .into_iter()
                    .map(|record| (record.id.clone(), record))
                    .collect(),
            ),
            store,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ThreadId, ThreadRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, thread_id: &ThreadId) -> Option<ThreadRecord> {
        self.lock().get(thread_id).cloned()
    }

    fn insert(&self, record: ThreadRecord) {
        let mut records = self.lock();
        records.insert(record.id.clone(), record);
        self.persist(&records);
    }

    /// Change one record and save. `None` when the thread is unknown.
    fn update<T>(&self, thread_id: &ThreadId, change: impl FnOnce(&mut ThreadRecord) -> T) -> Option<T> {
        let mut records = self.lock();
        let changed = change(records.get_mut(thread_id)?);
        self.persist(&records);
        Some(changed)
    }

    /// Save failures are logged; the in-memory record stays authoritative.
    fn persist(&self, records: &HashMap<ThreadId, ThreadRecord>) {
        let mut all: Vec<ThreadRecord> = records.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Err(err) = self.store.save(&all) {
            tracing::warn!(error = %err, threads = all.len(), "Could not save thread records");
        }
    }
}

pub struct AgentHost {
    config: MonitorConfig,
    settings: Arc<dyn SettingsStore>,
    workspaces: Arc<dyn WorkspaceStore>,
    registry: SessionRegistry,
    hub: EventHub,
    connected: Mutex<HashMap<WorkspaceId, ConnectedWorkspace>>,
    threads: Arc<ThreadBook>,
    wire_log: Option<AppServerWireLog>,
}

impl AgentHost {
    pub fn new(
        config: MonitorConfig,
        settings: Arc<dyn SettingsStore>,
        workspaces: Arc<dyn WorkspaceStore>,
    ) -> Self {
        let hub = EventHub::new(config.events.capacity);
        Self {
            registry: SessionRegistry::new(hub.clone()),
            hub,
            config,
            settings,
            workspaces,
            connected: Mutex::new(HashMap::new()),
            threads: Arc::new(ThreadBook::new(Arc::new(MemoryThreads::new()), Vec::new())),
            wire_log: None,
        }
    }

    /// Keep thread records in `store`, starting from the records it holds.
    pub fn with_thread_store(mut self, store: Arc<dyn ThreadStore>) -> Result<Self, StoreError> {
        let records = store.load()?;
        tracing::info!(threads = records.len(), "Thread records loaded");
        self.threads = Arc::new(ThreadBook::new(store, records));
        Ok(self)
    }

    /// Mirror every protocol frame of future sessions into `wire_log`.
    #[must_use]
    pub fn with_wire_log(mut self, wire_log: AppServerWireLog) -> Self {
        self.wire_log = Some(wire_log);
        self
    }

    #[must_use]
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    fn connected(&self) -> MutexGuard<'_, HashMap<WorkspaceId, ConnectedWorkspace>> {
        self.connected.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve the workspace's binding and check that it can launch. No
    /// process is started until a thread needs one.
    pub async fn connect_workspace(
        &self,
        workspace_id: &WorkspaceId,
    ) -> Result<WorkspaceConnection, HostError> {
        let entry = self
            .workspaces
            .workspace(workspace_id)
            .ok_or_else(|| HostError::UnknownWorkspace(workspace_id.clone()))?;
        if !entry.path.is_dir() {
            return Err(SpawnError::WorkingDirInvalid { path: entry.path }.into());
        }
        let plan = plan_binding(
            entry.backend_override.as_ref(),
            self.settings.as_ref(),
            &self.config,
        )?;
        if resolve_binary(&plan.program, None).is_none() {
            return Err(SpawnError::BinaryNotFound {
                program: plan.program,
            }
            .into());
        }
        let binding = plan.finalize(&entry.path).await;
        let connection = WorkspaceConnection {
            workspace_id: workspace_id.clone(),
            path: entry.path.clone(),
            backend: binding.kind,
            tier: binding.tier,
            program: binding.program.clone(),
            capabilities: binding.capabilities,
        };
        tracing::info!(
            workspace_id = %workspace_id,
            backend = %binding.kind,
            tier = binding.tier.as_str(),
            program = %binding.program,
            "Workspace connected"
        );
        self.connected().insert(
            workspace_id.clone(),
            ConnectedWorkspace {
                path: entry.path,
                binding,
            },
        );
        Ok(connection)
    }

    /// Forget the workspace's binding and stop all of its sessions.
    pub async fn disconnect_workspace(&self, workspace_id: &WorkspaceId) -> Vec<ThreadId> {
        self.connected().remove(workspace_id);
        let released = self
            .registry
            .release_workspace(workspace_id, Some(self.config.session.grace()))
            .await;
        tracing::info!(workspace_id = %workspace_id, sessions = released.len(), "Workspace disconnected");
        released
    }

    /// Open a new thread and its backend session.
    pub async fn start_thread(&self, workspace_id: &WorkspaceId) -> Result<ThreadRecord, HostError> {
        let mut record = ThreadRecord::new(ThreadId::generate(), workspace_id.clone());
        record.apply_flags(self.workspaces.thread_flags(workspace_id, &record.id));
        let session = self.open_session(&record).await?;
        record.backend_thread_id = session.backend_thread_id();
        self.threads.insert(record.clone());
        tracing::info!(
            workspace_id = %workspace_id,
            thread_id = %record.id,
            backend_thread_id = ?record.backend_thread_id,
            "Thread started"
        );
        Ok(record)
    }

    /// Make sure `thread` has a live session, resuming the backend thread
    /// when the process was recreated.
    pub async fn resume_thread(&self, thread_id: &ThreadId) -> Result<ThreadRecord, HostError> {
        let record = self.live_record(thread_id)?;
        self.session_for(&record).await?;
        self.record(thread_id)
    }

    /// Submit a user message; it runs now or queues behind the running turn.
    pub async fn send_user_message(
        &self,
        thread_id: &ThreadId,
        content: TurnContent,
    ) -> Result<SubmitReceipt, HostError> {
        let record = self.live_record(thread_id)?;
        let session = self.session_for(&record).await?;
        let receipt = session.send(content).await?;
        self.threads.update(thread_id, ThreadRecord::touch);
        Ok(receipt)
    }

    /// Interrupt the running turn. A thread without a live session has
    /// nothing running.
    pub async fn interrupt_turn(
        &self,
        thread_id: &ThreadId,
    ) -> Result<CapabilityOutcome<bool>, HostError> {
        match self.registry.get(thread_id) {
            Some(session) => session.interrupt().await,
            None => Ok(CapabilityOutcome::Done(false)),
        }
    }

    pub async fn respond_to_approval(
        &self,
        thread_id: &ThreadId,
        approval_id: &ApprovalId,
        decision: ApprovalDecision,
    ) -> Result<CapabilityOutcome<()>, HostError> {
        let session = self
            .registry
            .get(thread_id)
            .ok_or(HostError::Turn(TurnError::SessionClosed))?;
        session.respond_to_approval(approval_id, decision).await
    }

    pub async fn list_models(
        &self,
        thread_id: &ThreadId,
    ) -> Result<CapabilityOutcome<ModelCatalog>, HostError> {
        let record = self.live_record(thread_id)?;
        let session = self.session_for(&record).await?;
        Ok(session.list_models().await?)
    }

    /// Threads the backend itself remembers for this thread's workspace.
    pub async fn list_backend_threads(
        &self,
        thread_id: &ThreadId,
    ) -> Result<CapabilityOutcome<Vec<ThreadSummary>>, HostError> {
        let record = self.live_record(thread_id)?;
        let cwd = self.connection(&record.workspace_id)?.path;
        let session = self.session_for(&record).await?;
        Ok(session.list_backend_threads(&cwd).await?)
    }

    /// Known threads of a workspace, pinned first, then most recent.
    #[must_use]
    pub fn list_threads(&self, workspace_id: &WorkspaceId, include_archived: bool) -> Vec<ThreadRecord> {
        let mut threads: Vec<ThreadRecord> = self
            .threads
            .lock()
            .values()
            .filter(|record| &record.workspace_id == workspace_id)
            .filter(|record| include_archived || !record.archived)
            .cloned()
            .collect();
        threads.sort_by(|a, b| {
            b.pinned
                .cmp(&a.pinned)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
        });
        threads
    }

    /// Archive a thread: its session is released, its record kept.
    pub async fn archive_thread(&self, thread_id: &ThreadId) -> Result<ThreadRecord, HostError> {
        let record = self.update_flags(thread_id, |flags| flags.archived = true)?;
        self.registry
            .release(thread_id, Some(self.config.session.grace()))
            .await;
        tracing::info!(thread_id = %thread_id, "Thread archived");
        Ok(record)
    }

    pub fn set_thread_pinned(&self, thread_id: &ThreadId, pinned: bool) -> Result<ThreadRecord, HostError> {
        self.update_flags(thread_id, |flags| flags.pinned = pinned)
    }

    /// Evict sessions whose process has exited.
    pub async fn revalidate_sessions(&self) -> Vec<ThreadId> {
        self.registry.revalidate().await
    }

    pub async fn sessions(&self) -> Vec<SessionSnapshot> {
        let sessions = self.registry.sessions();
        let mut snapshots = Vec::with_capacity(sessions.len());
        for session in sessions {
            snapshots.push(session.snapshot().await);
        }
        snapshots
    }

    #[must_use]
    pub fn subscribe(&self) -> EventSubscription {
        self.hub.subscribe()
    }

    #[must_use]
    pub fn subscribe_thread(&self, thread_id: &ThreadId) -> EventSubscription {
        self.hub.subscribe_thread(thread_id.clone())
    }

    /// Stop every session.
    pub async fn shutdown(&self) {
        self.registry
            .shutdown(Some(self.config.session.grace()))
            .await;
    }

    fn connection(&self, workspace_id: &WorkspaceId) -> Result<ConnectedWorkspace, HostError> {
        self.connected()
            .get(workspace_id)
            .cloned()
            .ok_or_else(|| HostError::WorkspaceNotConnected(workspace_id.clone()))
    }

    fn record(&self, thread_id: &ThreadId) -> Result<ThreadRecord, HostError> {
        self.threads
            .get(thread_id)
            .ok_or_else(|| HostError::UnknownThread(thread_id.clone()))
    }

    fn live_record(&self, thread_id: &ThreadId) -> Result<ThreadRecord, HostError> {
        let record = self.record(thread_id)?;
        if record.archived {
            return Err(HostError::ThreadArchived(thread_id.clone()));
        }
        Ok(record)
    }

    fn update_flags(
        &self,
        thread_id: &ThreadId,
        update: impl FnOnce(&mut ThreadFlags),
    ) -> Result<ThreadRecord, HostError> {
        let record = self
            .threads
            .update(thread_id, |record| {
                let mut flags = record.flags();
                update(&mut flags);
                record.apply_flags(flags);
                record.clone()
            })
            .ok_or_else(|| HostError::UnknownThread(thread_id.clone()))?;
        self.workspaces
            .set_thread_flags(&record.workspace_id, thread_id, record.flags());
        Ok(record)
    }

    async fn session_for(&self, record: &ThreadRecord) -> Result<Arc<Session>, HostError> {
        if let Some(session) = self.registry.get(&record.id) {
            return Ok(session);
        }
        let session = self.open_session(record).await?;
        if let Some(backend_thread_id) = session.backend_thread_id() {
            self.threads.update(&record.id, |stored| {
                stored.backend_thread_id = Some(backend_thread_id);
            });
        }
        Ok(session)
    }

    async fn open_session(&self, record: &ThreadRecord) -> Result<Arc<Session>, HostError> {
        let connection = self.connection(&record.workspace_id)?;
        let mut launch = LaunchOptions::new(&connection.path);
        launch.initialize_timeout = self.config.session.initialize_timeout();
        launch.request_timeout = self.config.session.request_timeout();
        launch.max_consecutive_malformed = self.config.session.max_consecutive_malformed;
        launch.grace = self.config.session.grace();
        launch.wire_log.clone_from(&self.wire_log);
        let threads = self.threads.clone();
        let thread_id = record.id.clone();
        let on_backend_thread = BackendThreadHook::new(move |backend_thread_id| {
            threads.update(&thread_id, |stored| {
                stored.backend_thread_id = Some(backend_thread_id.to_string());
                stored.touch();
            });
        });
        let request = SessionRequest {
            workspace_id: record.workspace_id.clone(),
            thread_id: record.id.clone(),
            cwd: connection.path,
            binding: connection.binding,
            launch,
            resume: record.backend_thread_id.clone(),
            approval_timeout: self.config.session.approval_timeout(),
            on_backend_thread: Some(on_backend_thread),
        };
        Ok(self.registry.acquire(request).await?)
    }
}
