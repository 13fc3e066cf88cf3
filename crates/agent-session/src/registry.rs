//! Live sessions keyed by thread.
//!
//! Sessions live in a generational arena so a session's exit hook can remove
//! its own slot without ever touching a newer session that reused it.
//! Creation for one thread is serialized by a per-thread async lock; the
//! arena lock itself is never held across an await.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex;

use crate::error::SessionError;
use crate::events::EventHub;
use crate::ids::{ThreadId, WorkspaceId};
use crate::session::{ExitHook, Session, SessionRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    index: usize,
    generation: u64,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    session: Option<Arc<Session>>,
}

#[derive(Debug, Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<usize>,
    by_thread: HashMap<ThreadId, SessionKey>,
}

impl Arena {
    fn get(&self, thread: &ThreadId) -> Option<Arc<Session>> {
        let key = self.by_thread.get(thread)?;
        let slot = self.slots.get(key.index)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.session.clone()
    }

    fn reserve(&mut self) -> SessionKey {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        slot.generation += 1;
        slot.session = None;
        SessionKey {
            index,
            generation: slot.generation,
        }
    }

    fn fill(&mut self, key: SessionKey, session: Arc<Session>) {
        let Some(slot) = self.slots.get_mut(key.index) else {
            return;
        };
        if slot.generation != key.generation {
            return;
        }
        self.by_thread.insert(session.thread_id().clone(), key);
        slot.session = Some(session);
    }

    /// Give back a reserved slot that was never filled.
    fn abandon(&mut self, key: SessionKey) {
        if let Some(slot) = self.slots.get_mut(key.index)
            && slot.generation == key.generation
            && slot.session.is_none()
        {
            slot.generation += 1;
            self.free.push(key.index);
        }
    }

    fn remove_key(&mut self, key: SessionKey) -> Option<Arc<Session>> {
        let slot = self.slots.get_mut(key.index)?;
        if slot.generation != key.generation {
            return None;
        }
        let session = slot.session.take()?;
        slot.generation += 1;
        self.free.push(key.index);
        if self.by_thread.get(session.thread_id()) == Some(&key) {
            self.by_thread.remove(session.thread_id());
        }
        Some(session)
    }

    fn remove_thread(&mut self, thread: &ThreadId) -> Option<Arc<Session>> {
        let key = *self.by_thread.get(thread)?;
        self.remove_key(key)
    }

    fn remove_where(&mut self, mut predicate: impl FnMut(&Session) -> bool) -> Vec<Arc<Session>> {
        let keys: Vec<SessionKey> = self
            .by_thread
            .values()
            .copied()
            .filter(|key| {
                self.slots
                    .get(key.index)
                    .and_then(|slot| slot.session.as_deref())
                    .is_some_and(&mut predicate)
            })
            .collect();
        keys.into_iter()
            .filter_map(|key| self.remove_key(key))
            .collect()
    }

    fn sessions(&self) -> Vec<Arc<Session>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.session.clone())
            .collect()
    }
}

type CreationLocks = Arc<StdMutex<HashMap<ThreadId, Arc<Mutex<()>>>>>;

/// A claim on one thread's creation lock. Dropping the last claim removes
/// the map entry, including when the acquiring future is cancelled.
struct CreationLease {
    creating: CreationLocks,
    thread: ThreadId,
    lock: Arc<Mutex<()>>,
}

impl Drop for CreationLease {
    fn drop(&mut self) {
        let mut creating = self.creating.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map and this lease hold it: nobody else is waiting.
        if Arc::strong_count(&self.lock) == 2
            && creating
                .get(&self.thread)
                .is_some_and(|lock| Arc::ptr_eq(lock, &self.lock))
        {
            creating.remove(&self.thread);
        }
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    arena: Arc<StdMutex<Arena>>,
    creating: CreationLocks,
    hub: EventHub,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(hub: EventHub) -> Self {
        Self {
            arena: Arc::new(StdMutex::new(Arena::default())),
            creating: Arc::new(StdMutex::new(HashMap::new())),
            hub,
        }
    }

    #[must_use]
    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    fn arena(&self) -> MutexGuard<'_, Arena> {
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The live session of `thread`, if any.
    #[must_use]
    pub fn get(&self, thread: &ThreadId) -> Option<Arc<Session>> {
        self.arena()
            .get(thread)
            .filter(|session| session.is_alive())
    }

    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.arena().sessions()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.arena().by_thread.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the live session of the request's thread, creating it when
    /// there is none. Concurrent callers for one thread share one creation.
    pub async fn acquire(&self, request: SessionRequest) -> Result<Arc<Session>, SessionError> {
        if let Some(session) = self.get(&request.thread_id) {
            return Ok(session);
        }
        let thread = request.thread_id.clone();
        self.serialized(&thread, self.create(request)).await
    }

    /// Run `work` while holding `thread`'s creation lock.
    async fn serialized<T>(&self, thread: &ThreadId, work: impl Future<Output = T>) -> T {
        let lease = self.creation_lease(thread);
        let _creating = lease.lock.lock().await;
        work.await
    }

    fn creation_lease(&self, thread: &ThreadId) -> CreationLease {
        let mut creating = self.creating.lock().unwrap_or_else(PoisonError::into_inner);
        CreationLease {
            creating: Arc::clone(&self.creating),
            thread: thread.clone(),
            lock: Arc::clone(creating.entry(thread.clone()).or_default()),
        }
    }

    async fn create(&self, request: SessionRequest) -> Result<Arc<Session>, SessionError> {
        let thread = request.thread_id.clone();
        let stale = {
            let mut arena = self.arena();
            match arena.get(&thread) {
                Some(session) if session.is_alive() => return Ok(session),
                Some(_) => arena.remove_thread(&thread),
                None => None,
            }
        };
        if let Some(stale) = stale {
            tracing::info!(thread_id = %thread, "Replacing dead session");
            stale.evict().await;
        }

        let key = self.arena().reserve();
        let arena: Weak<StdMutex<Arena>> = Arc::downgrade(&self.arena);
        let exited_thread = thread.clone();
        let on_exit: ExitHook = Box::new(move || {
            let Some(arena) = arena.upgrade() else {
                return;
            };
            let removed = arena
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove_key(key);
            if removed.is_some() {
                tracing::debug!(thread_id = %exited_thread, "Exited session removed from registry");
            }
        });

        match Session::open(request, self.hub.clone(), Some(on_exit)).await {
            Ok(session) => {
                // Checked under the arena lock: the exit hook takes it too, so
                // a session that died first is never filled in after it.
                let mut arena = self.arena();
                if session.is_alive() {
                    arena.fill(key, Arc::clone(&session));
                    Ok(session)
                } else {
                    arena.abandon(key);
                    drop(arena);
                    tracing::warn!(thread_id = %thread, "Backend exited while the session was opening");
                    Err(SessionError::ExitedDuringStartup)
                }
            }
            Err(err) => {
                self.arena().abandon(key);
                tracing::warn!(thread_id = %thread, error = %err, "Session creation failed");
                Err(err)
            }
        }
    }

    /// Remove and shut down the session of `thread`. False when there was
    /// none.
    pub async fn release(&self, thread: &ThreadId, grace: Option<Duration>) -> bool {
        let Some(session) = self.arena().remove_thread(thread) else {
            return false;
        };
        session.close(grace).await;
        true
    }

    /// Shut down every session of `workspace`, returning their threads.
    pub async fn release_workspace(
        &self,
        workspace: &WorkspaceId,
        grace: Option<Duration>,
    ) -> Vec<ThreadId> {
        let sessions = self
            .arena()
            .remove_where(|session| session.workspace_id() == workspace);
        join_all(sessions.iter().map(|session| session.close(grace))).await;
        sessions
            .iter()
            .map(|session| session.thread_id().clone())
            .collect()
    }

    /// Evict sessions whose process is gone. They are recreated on next use.
    pub async fn revalidate(&self) -> Vec<ThreadId> {
        let dead = self.arena().remove_where(|session| !session.is_alive());
        join_all(dead.iter().map(|session| session.evict())).await;
        let evicted: Vec<ThreadId> = dead
            .iter()
            .map(|session| session.thread_id().clone())
            .collect();
        if !evicted.is_empty() {
            tracing::info!(count = evicted.len(), "Evicted dead sessions");
        }
        evicted
    }

    pub async fn shutdown(&self, grace: Option<Duration>) {
        let sessions = self.arena().remove_where(|_| true);
        join_all(sessions.iter().map(|session| session.close(grace))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reused_slots_get_a_new_generation() {
        let mut arena = Arena::default();
        let first = arena.reserve();
        arena.abandon(first);
        let second = arena.reserve();
        assert_eq!(first.index, second.index);
        assert_ne!(first.generation, second.generation);
        // A stale key never removes the newer occupant.
        assert!(arena.remove_key(first).is_none());
    }

    #[test]
    fn abandoning_twice_frees_the_slot_once() {
        let mut arena = Arena::default();
        let key = arena.reserve();
        arena.abandon(key);
        arena.abandon(key);
        assert_eq!(arena.free, vec![key.index]);
    }

    fn creation_entries(registry: &SessionRegistry) -> usize {
        registry
            .creating
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[tokio::test]
    async fn creation_locks_are_dropped_when_unused() {
        let registry = SessionRegistry::new(EventHub::new(8));
        let thread = ThreadId::from("t");
        let first = registry.creation_lease(&thread);
        let waiter = registry.creation_lease(&thread);
        drop(first);
        assert_eq!(creation_entries(&registry), 1);
        drop(waiter);
        assert_eq!(creation_entries(&registry), 0);
    }

    #[tokio::test]
    async fn cancelled_creation_releases_its_lock_entry() -> anyhow::Result<()> {
        let registry = SessionRegistry::new(EventHub::new(8));
        let thread = ThreadId::from("t");
        let holder = registry.creation_lease(&thread);
        let held = holder.lock.lock().await;

        let waited = tokio::time::timeout(
            Duration::from_millis(20),
            registry.serialized(&thread, async {}),
        )
        .await;
        if waited.is_ok() {
            anyhow::bail!("creation ran while the lock was held");
        }
        assert_eq!(creation_entries(&registry), 1);

        drop(held);
        drop(holder);
        assert_eq!(creation_entries(&registry), 0);
        registry.serialized(&thread, async {}).await;
        assert_eq!(creation_entries(&registry), 0);
        Ok(())
    }
}
