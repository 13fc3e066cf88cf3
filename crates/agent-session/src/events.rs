//! Fan-out of session events to subscribers.
//!
//! A single broadcast channel carries events from every session. Slow
//! subscribers lose the oldest events and are told how many were skipped;
//! emitters never block.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use app_server_client::ExitReason;

use crate::adapter::{ApprovalKind, TurnProgress};
use crate::capability::{AdapterTier, BackendKind, Capabilities};
use crate::error::TurnFailure;
use crate::ids::{ApprovalId, ThreadId, TurnId, WorkspaceId};

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub workspace_id: WorkspaceId,
    pub thread_id: ThreadId,
    #[serde(flatten)]
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ApprovalOutcome {
    Accepted,
    AcceptedForSession,
    Rejected,
    /// The turn ended before anyone answered.
    Cancelled,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DisconnectReason {
    Released,
    ProcessExited { exit: ExitReason },
    ProtocolFailure { detail: String },
    Evicted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SessionEventKind {
    SessionConnected {
        backend: BackendKind,
        tier: AdapterTier,
        capabilities: Capabilities,
    },
    TurnQueued {
        turn_id: TurnId,
        position: usize,
    },
    TurnStarted {
        turn_id: TurnId,
    },
    TurnProgress {
        turn_id: TurnId,
        progress: TurnProgress,
    },
    ApprovalRequested {
        turn_id: TurnId,
        request_id: ApprovalId,
        approval_kind: ApprovalKind,
        details: Value,
    },
    ApprovalResolved {
        turn_id: TurnId,
        request_id: ApprovalId,
        outcome: ApprovalOutcome,
    },
    TurnCompleted {
        turn_id: TurnId,
    },
    TurnFailed {
        turn_id: TurnId,
        reason: TurnFailure,
        message: String,
    },
    TurnInterrupted {
        turn_id: TurnId,
    },
    SessionDisconnected {
        reason: DisconnectReason,
    },
    /// Backend output that is not part of any turn.
    Diagnostic {
        message: String,
    },
}

impl SessionEventKind {
    #[must_use]
    pub fn turn_id(&self) -> Option<TurnId> {
        match self {
            Self::TurnQueued { turn_id, .. }
            | Self::TurnStarted { turn_id }
            | Self::TurnProgress { turn_id, .. }
            | Self::ApprovalRequested { turn_id, .. }
            | Self::ApprovalResolved { turn_id, .. }
            | Self::TurnCompleted { turn_id }
            | Self::TurnFailed { turn_id, .. }
            | Self::TurnInterrupted { turn_id } => Some(*turn_id),
            Self::SessionConnected { .. }
            | Self::SessionDisconnected { .. }
            | Self::Diagnostic { .. } => None,
        }
    }

    /// Whether this event ends a turn.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::TurnCompleted { .. } | Self::TurnFailed { .. } | Self::TurnInterrupted { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct EventHub {
    sender: broadcast::Sender<SessionEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventHub {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: SessionEvent) {
        tracing::trace!(
            thread_id = %event.thread_id,
            turn_id = ?event.kind.turn_id(),
            "Session event"
        );
        let _ = self.sender.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
            thread: None,
        }
    }

    /// Receive only events of `thread`.
    #[must_use]
    pub fn subscribe_thread(&self, thread: ThreadId) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
            thread: Some(thread),
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

pub struct EventSubscription {
    receiver: broadcast::Receiver<SessionEvent>,
    thread: Option<ThreadId>,
}

impl EventSubscription {
    /// Next matching event, or `None` once the hub is gone. Lag is logged
    /// and skipped over.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self
                        .thread
                        .as_ref()
                        .is_none_or(|thread| *thread == event.thread_id)
                    {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(thread: &str, kind: SessionEventKind) -> SessionEvent {
        SessionEvent {
            workspace_id: WorkspaceId::from("ws"),
            thread_id: ThreadId::from(thread),
            kind,
        }
    }

    #[tokio::test]
    async fn thread_subscription_filters_other_threads() {
        let hub = EventHub::new(16);
        let mut only_a = hub.subscribe_thread(ThreadId::from("a"));
        hub.emit(event(
            "b",
            SessionEventKind::TurnStarted {
                turn_id: TurnId::new(1),
            },
        ));
        hub.emit(event(
            "a",
            SessionEventKind::TurnStarted {
                turn_id: TurnId::new(2),
            },
        ));
        let received = only_a.recv().await;
        assert_eq!(
            received.map(|event| event.kind.turn_id()),
            Some(Some(TurnId::new(2)))
        );
    }

    #[tokio::test]
    async fn lagging_subscriber_keeps_receiving() {
        let hub = EventHub::new(2);
        let mut subscriber = hub.subscribe();
        for turn in 1..=5 {
            hub.emit(event(
                "a",
                SessionEventKind::TurnCompleted {
                    turn_id: TurnId::new(turn),
                },
            ));
        }
        let first = subscriber.recv().await;
        assert_eq!(
            first.map(|event| event.kind.turn_id()),
            Some(Some(TurnId::new(4)))
        );
    }

    #[tokio::test]
    async fn subscription_ends_with_the_hub() {
        let hub = EventHub::new(4);
        let mut subscriber = hub.subscribe();
        drop(hub);
        assert!(subscriber.recv().await.is_none());
    }

    #[test]
    fn events_serialize_flat_and_camel_case() {
        let value = serde_json::to_value(event(
            "t1",
            SessionEventKind::TurnFailed {
                turn_id: TurnId::new(3),
                reason: TurnFailure::ProcessKilled,
                message: "backend process was stopped".to_string(),
            },
        ))
        .unwrap_or_default();
        assert_eq!(value["type"], "turnFailed");
        assert_eq!(value["threadId"], "t1");
        assert_eq!(value["turnId"], 3);
        assert_eq!(value["reason"]["type"], "processKilled");
    }
}
