//! Boundaries to the settings, workspace and thread persistence layers,
//! in-memory implementations used by the harness and tests, and the JSON
//! file that keeps thread records across restarts.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::binding::BindingOverride;
use crate::error::StoreError;
use crate::ids::{ThreadId, WorkspaceId};

/// Key-value settings. Keys used here: `backend.active` and
/// `backend.<kind>.{bin,args,home,tier,mode}`.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceEntry {
    pub id: WorkspaceId,
    pub path: PathBuf,
    #[serde(default)]
    pub backend_override: Option<BindingOverride>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadFlags {
    pub pinned: bool,
    pub archived: bool,
}

pub trait WorkspaceStore: Send + Sync {
    fn workspace(&self, id: &WorkspaceId) -> Option<WorkspaceEntry>;
    fn thread_flags(&self, workspace: &WorkspaceId, thread: &ThreadId) -> ThreadFlags;
    fn set_thread_flags(&self, workspace: &WorkspaceId, thread: &ThreadId, flags: ThreadFlags);
}

/// Host-side record of a conversation thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadRecord {
    pub id: ThreadId,
    pub workspace_id: WorkspaceId,
    /// Id assigned by the backend, used to resume after the process is
    /// recreated.
    pub backend_thread_id: Option<String>,
    pub pinned: bool,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ThreadRecord {
    #[must_use]
    pub fn new(id: ThreadId, workspace_id: WorkspaceId) -> Self {
        let now = Utc::now();
        Self {
            id,
            workspace_id,
            backend_thread_id: None,
            pinned: false,
            archived: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags {
            pinned: self.pinned,
            archived: self.archived,
        }
    }

    pub fn apply_flags(&mut self, flags: ThreadFlags) {
        self.pinned = flags.pinned;
        self.archived = flags.archived;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Durable home of thread records. `save` always receives every record.
pub trait ThreadStore: Send + Sync {
    fn load(&self) -> Result<Vec<ThreadRecord>, StoreError>;
    fn save(&self, records: &[ThreadRecord]) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ThreadFile {
    #[serde(default)]
    threads: Vec<ThreadRecord>,
}

/// Thread records in one pretty-printed JSON file, replaced atomically on
/// every save.
#[derive(Debug, Clone)]
pub struct JsonThreadStore {
    path: PathBuf,
}

impl JsonThreadStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data dir>/agent-monitor/threads.json`.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("agent-monitor").join("threads.json"))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ThreadStore for JsonThreadStore {
    fn load(&self) -> Result<Vec<ThreadRecord>, StoreError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let file: ThreadFile =
            serde_json::from_str(&text).map_err(|source| StoreError::Parse {
                path: self.path.clone(),
                source,
            })?;
        Ok(file.threads)
    }

    fn save(&self, records: &[ThreadRecord]) -> Result<(), StoreError> {
        let write_error = |source: io::Error| StoreError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(write_error)?;
        }
        let text = serde_json::to_string_pretty(&ThreadFile {
            threads: records.to_vec(),
        })
        .map_err(StoreError::Encode)?;
        let staging = self.path.with_extension("json.tmp");
        std::fs::write(&staging, text).map_err(write_error)?;
        std::fs::rename(&staging, &self.path).map_err(write_error)
    }
}

#[derive(Debug, Default)]
pub struct MemoryThreads {
    records: RwLock<Vec<ThreadRecord>>,
}

impl MemoryThreads {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ThreadStore for MemoryThreads {
    fn load(&self) -> Result<Vec<ThreadRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, records: &[ThreadRecord]) -> Result<(), StoreError> {
        *self.records.write().unwrap_or_else(PoisonError::into_inner) = records.to_vec();
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemorySettings {
    values: RwLock<HashMap<String, String>>,
}

impl MemorySettings {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
    }
}

#[derive(Debug, Default)]
pub struct MemoryWorkspaces {
    workspaces: RwLock<HashMap<WorkspaceId, WorkspaceEntry>>,
    flags: RwLock<HashMap<(WorkspaceId, ThreadId), ThreadFlags>>,
}

impl MemoryWorkspaces {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: WorkspaceEntry) {
        self.workspaces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.id.clone(), entry);
    }
}

impl WorkspaceStore for MemoryWorkspaces {
    fn workspace(&self, id: &WorkspaceId) -> Option<WorkspaceEntry> {
        self.workspaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn thread_flags(&self, workspace: &WorkspaceId, thread: &ThreadId) -> ThreadFlags {
        self.flags
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(workspace.clone(), thread.clone()))
            .copied()
            .unwrap_or_default()
    }

    fn set_thread_flags(&self, workspace: &WorkspaceId, thread: &ThreadId, flags: ThreadFlags) {
        self.flags
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((workspace.clone(), thread.clone()), flags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_settings_round_trip_values() {
        let settings = MemorySettings::new();
        assert_eq!(settings.get("backend.active"), None);
        settings.set("backend.active", "claude");
        settings.set("backend.active", "gemini");
        assert_eq!(settings.get("backend.active").as_deref(), Some("gemini"));
    }

    #[test]
    fn thread_flags_default_to_unset() {
        let store = MemoryWorkspaces::new();
        let workspace = WorkspaceId::from("ws");
        let thread = ThreadId::from("t1");
        assert_eq!(store.thread_flags(&workspace, &thread), ThreadFlags::default());

        let flags = ThreadFlags {
            pinned: true,
            archived: false,
        };
        store.set_thread_flags(&workspace, &thread, flags);
        assert_eq!(store.thread_flags(&workspace, &thread), flags);
        assert_eq!(
            store.thread_flags(&WorkspaceId::from("other"), &thread),
            ThreadFlags::default()
        );
    }

    #[test]
    fn json_store_keeps_records_across_instances() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("threads.json");
        let store = JsonThreadStore::new(&path);
        assert!(store.load()?.is_empty());

        let mut record = ThreadRecord::new(ThreadId::from("t1"), WorkspaceId::from("ws"));
        record.backend_thread_id = Some("backend-7".to_string());
        record.pinned = true;
        store.save(std::slice::from_ref(&record))?;

        let reopened = JsonThreadStore::new(&path).load()?;
        assert_eq!(reopened, vec![record]);
        assert!(!path.with_extension("json.tmp").exists());
        Ok(())
    }

    #[test]
    fn corrupt_thread_files_are_reported() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("threads.json");
        std::fs::write(&path, "{ not json")?;
        match JsonThreadStore::new(&path).load() {
            Err(StoreError::Parse { path: reported, .. }) => assert_eq!(reported, path),
            other => anyhow::bail!("unexpected result: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn applying_flags_bumps_updated_at() {
        let mut record = ThreadRecord::new(ThreadId::from("t1"), WorkspaceId::from("ws"));
        let created = record.updated_at;
        record.apply_flags(ThreadFlags {
            pinned: false,
            archived: true,
        });
        assert!(record.archived);
        assert!(record.updated_at >= created);
    }
}
