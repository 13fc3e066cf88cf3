//! Per-session turn state machine.
//!
//! The coordinator is synchronous and owns no I/O: the session calls it under
//! its mutex and performs whatever adapter calls the returned values ask for.
//! At most one turn runs at a time; later submissions queue in FIFO order and
//! are handed out again only when nothing runs, no interrupt is settling and
//! no approval is outstanding.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::adapter::{ApprovalKind, PendingApproval, TurnContent};
use crate::error::{TurnError, TurnFailure};
use crate::ids::{ApprovalId, TurnId};

#[derive(Debug, Clone, PartialEq)]
pub struct TurnTicket {
    pub id: TurnId,
    pub content: TurnContent,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Nothing was running; the caller dispatches this ticket now.
    Dispatch(TurnTicket),
    /// 1-based position in the queue.
    Queued { turn_id: TurnId, position: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnResolution {
    Completed,
    Failed(TurnFailure),
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub id: ApprovalId,
    pub turn_id: TurnId,
    pub kind: ApprovalKind,
    pub details: Value,
    #[serde(skip)]
    pub requested_at: Instant,
}

/// A turn left the running state.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub turn_id: TurnId,
    pub resolution: TurnResolution,
    /// Approvals still open when the turn ended.
    pub cancelled: Vec<ApprovalRequest>,
    pub next: Option<TurnTicket>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InterruptOutcome {
    NoOp,
    Interrupted {
        turn_id: TurnId,
        /// `None` when the backend had not acknowledged the turn yet.
        backend_turn_id: Option<String>,
        cancelled: Vec<ApprovalRequest>,
    },
}

/// What the caller does after `turn_started`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAck {
    Recorded,
    /// The turn was interrupted before the backend acknowledged it; the
    /// backend turn must be interrupted now.
    InterruptBackend,
    /// The turn already finished; nothing to do.
    Finished,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Teardown {
    pub running: Option<(TurnId, TurnFailure)>,
    pub queued: Vec<TurnId>,
    pub cancelled: Vec<ApprovalRequest>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CoordinatorState {
    Idle,
    Running,
    AwaitingApproval,
    Closed,
}

#[derive(Debug, Clone)]
struct RunningTurn {
    id: TurnId,
    backend_turn_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct TurnCoordinator {
    next_turn: u64,
    running: Option<RunningTurn>,
    queue: VecDeque<TurnTicket>,
    approvals: Vec<ApprovalRequest>,
    /// Closed approvals and the turn that asked. Only the most recently
    /// resolved turn's entries are kept.
    answered: HashMap<ApprovalId, TurnId>,
    expired: HashMap<ApprovalId, TurnId>,
    /// Backend turns whose events must be dropped, pruned like `answered`.
    stale_backend_turns: HashMap<String, TurnId>,
    interrupted_before_start: HashSet<TurnId>,
    settling: bool,
    closed: bool,
}

impl TurnCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self) -> CoordinatorState {
        if self.closed {
            CoordinatorState::Closed
        } else if !self.approvals.is_empty() {
            CoordinatorState::AwaitingApproval
        } else if self.running.is_some() {
            CoordinatorState::Running
        } else {
            CoordinatorState::Idle
        }
    }

    #[must_use]
    pub fn running_turn(&self) -> Option<TurnId> {
        self.running.as_ref().map(|running| running.id)
    }

    #[must_use]
    pub fn queued(&self) -> Vec<TurnId> {
        self.queue.iter().map(|ticket| ticket.id).collect()
    }

    #[must_use]
    pub fn open_approvals(&self) -> &[ApprovalRequest] {
        &self.approvals
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn submit(&mut self, content: TurnContent) -> Result<SubmitOutcome, TurnError> {
        if self.closed {
            return Err(TurnError::SessionClosed);
        }
        self.next_turn += 1;
        let ticket = TurnTicket {
            id: TurnId::new(self.next_turn),
            content,
            submitted_at: Utc::now(),
        };
        if self.queue.is_empty() && self.can_dispatch() {
            self.running = Some(RunningTurn {
                id: ticket.id,
                backend_turn_id: None,
            });
            return Ok(SubmitOutcome::Dispatch(ticket));
        }
        let turn_id = ticket.id;
        self.queue.push_back(ticket);
        Ok(SubmitOutcome::Queued {
            turn_id,
            position: self.queue.len(),
        })
    }

    fn can_dispatch(&self) -> bool {
        !self.closed && self.running.is_none() && !self.settling && self.approvals.is_empty()
    }

    fn next_dispatch(&mut self) -> Option<TurnTicket> {
        if !self.can_dispatch() {
            return None;
        }
        let ticket = self.queue.pop_front()?;
        self.running = Some(RunningTurn {
            id: ticket.id,
            backend_turn_id: None,
        });
        Some(ticket)
    }

    /// The backend acknowledged `turn_id` as `backend_turn_id`.
    pub fn turn_started(&mut self, turn_id: TurnId, backend_turn_id: &str) -> StartAck {
        if let Some(running) = self.running.as_mut()
            && running.id == turn_id
        {
            if let Some(existing) = &running.backend_turn_id
                && existing != backend_turn_id
            {
                tracing::warn!(%turn_id, %existing, backend_turn_id, "Backend turn id changed");
            }
            running.backend_turn_id = Some(backend_turn_id.to_string());
            return StartAck::Recorded;
        }
        self.stale_backend_turns
            .insert(backend_turn_id.to_string(), turn_id);
        if self.interrupted_before_start.remove(&turn_id) {
            StartAck::InterruptBackend
        } else {
            StartAck::Finished
        }
    }

    /// The backend never started `turn_id`. If the turn was interrupted while
    /// waiting, that interrupt has now settled.
    pub fn start_abandoned(&mut self, turn_id: TurnId) -> Option<TurnTicket> {
        if self.interrupted_before_start.remove(&turn_id) {
            self.interrupt_settled()
        } else {
            None
        }
    }

    /// Attribute an adapter event to the running turn. Events without a turn
    /// id belong to whatever runs; an unknown id is adopted when the running
    /// turn has not been acknowledged yet.
    pub fn claim_event(&mut self, backend_turn_id: Option<&str>) -> Option<TurnId> {
        let running = self.running.as_mut()?;
        let Some(backend_turn_id) = backend_turn_id else {
            return Some(running.id);
        };
        if self.stale_backend_turns.contains_key(backend_turn_id) {
            return None;
        }
        match &running.backend_turn_id {
            Some(current) if current == backend_turn_id => Some(running.id),
            Some(_) => None,
            None => {
                running.backend_turn_id = Some(backend_turn_id.to_string());
                Some(running.id)
            }
        }
    }

    /// The backend ended a turn.
    pub fn backend_completed(
        &mut self,
        backend_turn_id: Option<&str>,
        resolution: TurnResolution,
    ) -> Option<Resolved> {
        let turn_id = self.claim_event(backend_turn_id)?;
        self.complete(turn_id, resolution)
    }

    /// Resolve the running turn. `None` when `turn_id` is not running.
    pub fn complete(&mut self, turn_id: TurnId, resolution: TurnResolution) -> Option<Resolved> {
        if self.running.as_ref().map(|running| running.id) != Some(turn_id) {
            return None;
        }
        let running = self.running.take()?;
        if let Some(backend_turn_id) = running.backend_turn_id {
            self.stale_backend_turns.insert(backend_turn_id, turn_id);
        }
        let cancelled = self.cancel_approvals();
        self.forget_before(turn_id);
        Some(Resolved {
            turn_id,
            resolution,
            cancelled,
            next: self.next_dispatch(),
        })
    }

    fn cancel_approvals(&mut self) -> Vec<ApprovalRequest> {
        let cancelled: Vec<ApprovalRequest> = self.approvals.drain(..).collect();
        self.answered.extend(
            cancelled
                .iter()
                .map(|approval| (approval.id.clone(), approval.turn_id)),
        );
        cancelled
    }

    /// Drop bookkeeping of turns older than `turn_id`, which just resolved.
    /// Its own entries stay so late answers and events for it are still
    /// recognized.
    fn forget_before(&mut self, turn_id: TurnId) {
        self.answered.retain(|_, owner| *owner >= turn_id);
        self.expired.retain(|_, owner| *owner >= turn_id);
        self.stale_backend_turns.retain(|_, owner| *owner >= turn_id);
    }

    /// Record an approval request. `None` means nothing is waiting for it
    /// (stale turn or repeated id) and the caller answers it as cancelled.
    pub fn approval_requested(
        &mut self,
        backend_turn_id: Option<&str>,
        pending: PendingApproval,
        now: Instant,
    ) -> Option<ApprovalRequest> {
        if self.answered.contains_key(&pending.id)
            || self.expired.contains_key(&pending.id)
            || self.approvals.iter().any(|open| open.id == pending.id)
        {
            return None;
        }
        let turn_id = self.claim_event(backend_turn_id)?;
        let request = ApprovalRequest {
            id: pending.id,
            turn_id,
            kind: pending.kind,
            details: pending.details,
            requested_at: now,
        };
        self.approvals.push(request.clone());
        Some(request)
    }

    /// Accept exactly one answer per approval.
    pub fn resolve_approval(&mut self, id: &ApprovalId) -> Result<ApprovalRequest, TurnError> {
        if self.closed {
            return Err(TurnError::SessionClosed);
        }
        if self.expired.contains_key(id) {
            return Err(TurnError::ApprovalTimeout(id.clone()));
        }
        if self.answered.contains_key(id) {
            return Err(TurnError::DuplicateResponse(id.clone()));
        }
        let index = self
            .approvals
            .iter()
            .position(|open| &open.id == id)
            .ok_or_else(|| TurnError::UnknownApproval(id.clone()))?;
        let request = self.approvals.remove(index);
        self.answered.insert(request.id.clone(), request.turn_id);
        Ok(request)
    }

    /// Expire approvals open for at least `timeout`.
    pub fn expire_approvals(&mut self, now: Instant, timeout: Duration) -> Vec<ApprovalRequest> {
        let (expired, open): (Vec<_>, Vec<_>) = self
            .approvals
            .drain(..)
            .partition(|approval| now.saturating_duration_since(approval.requested_at) >= timeout);
        self.approvals = open;
        self.expired.extend(
            expired
                .iter()
                .map(|approval| (approval.id.clone(), approval.turn_id)),
        );
        expired
    }

    /// Stop the running turn. Dispatch stays paused until
    /// [`Self::interrupt_settled`].
    pub fn interrupt(&mut self) -> InterruptOutcome {
        let Some(running) = self.running.take() else {
            return InterruptOutcome::NoOp;
        };
        match &running.backend_turn_id {
            Some(backend_turn_id) => {
                self.stale_backend_turns
                    .insert(backend_turn_id.clone(), running.id);
            }
            None => {
                self.interrupted_before_start.insert(running.id);
            }
        }
        self.settling = true;
        let cancelled = self.cancel_approvals();
        self.forget_before(running.id);
        InterruptOutcome::Interrupted {
            turn_id: running.id,
            backend_turn_id: running.backend_turn_id,
            cancelled,
        }
    }

    /// The backend finished handling an interrupt.
    pub fn interrupt_settled(&mut self) -> Option<TurnTicket> {
        self.settling = false;
        self.next_dispatch()
    }

    /// Fail everything and refuse further work.
    pub fn fail_all(&mut self, failure: &TurnFailure) -> Teardown {
        if self.closed {
            return Teardown::default();
        }
        self.closed = true;
        let running = self
            .running
            .take()
            .map(|running| (running.id, failure.clone()));
        let queued = self.queue.drain(..).map(|ticket| ticket.id).collect();
        let cancelled = self.cancel_approvals();
        self.interrupted_before_start.clear();
        self.stale_backend_turns.clear();
        Teardown {
            running,
            queued,
            cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use app_server_client::RequestId;
    use quickcheck::{Arbitrary, Gen, QuickCheck};
    use serde_json::json;

    fn approval(id: i64) -> PendingApproval {
        PendingApproval {
            id: ApprovalId::new(RequestId::Integer(id)),
            kind: ApprovalKind::CommandExecution,
            details: json!({"command": "ls"}),
        }
    }

    fn dispatched(outcome: Result<SubmitOutcome, TurnError>) -> Option<TurnTicket> {
        match outcome {
            Ok(SubmitOutcome::Dispatch(ticket)) => Some(ticket),
            _ => None,
        }
    }

    #[test]
    fn second_submit_queues_instead_of_dispatching() {
        let mut coordinator = TurnCoordinator::new();
        let first = dispatched(coordinator.submit(TurnContent::text("a")));
        assert!(first.is_some());
        assert_eq!(
            coordinator.submit(TurnContent::text("b")),
            Ok(SubmitOutcome::Queued {
                turn_id: TurnId::new(2),
                position: 1
            })
        );
        assert_eq!(coordinator.state(), CoordinatorState::Running);
    }

    #[test]
    fn completion_dispatches_the_oldest_queued_turn() {
        let mut coordinator = TurnCoordinator::new();
        let first = dispatched(coordinator.submit(TurnContent::text("run")));
        let _ = coordinator.submit(TurnContent::text("a"));
        let _ = coordinator.submit(TurnContent::text("b"));
        let first = first.map(|ticket| ticket.id).unwrap_or(TurnId::new(0));

        let resolved = coordinator.complete(first, TurnResolution::Completed);
        let next = resolved.and_then(|resolved| resolved.next);
        assert_eq!(next.map(|ticket| ticket.content.text), Some("a".to_string()));
        assert_eq!(coordinator.queued(), vec![TurnId::new(3)]);
    }

    #[test]
    fn approvals_resolve_exactly_once() {
        let mut coordinator = TurnCoordinator::new();
        let _ = coordinator.submit(TurnContent::text("run"));
        let request = coordinator.approval_requested(Some("t1"), approval(7), Instant::now());
        assert!(request.is_some());
        assert_eq!(coordinator.state(), CoordinatorState::AwaitingApproval);

        let id = ApprovalId::new(RequestId::Integer(7));
        assert!(coordinator.resolve_approval(&id).is_ok());
        assert_eq!(
            coordinator.resolve_approval(&id),
            Err(TurnError::DuplicateResponse(id.clone()))
        );
        let unknown = ApprovalId::new(RequestId::Integer(99));
        assert_eq!(
            coordinator.resolve_approval(&unknown),
            Err(TurnError::UnknownApproval(unknown.clone()))
        );
        assert_eq!(coordinator.state(), CoordinatorState::Running);
    }

    #[test]
    fn interrupt_pauses_dispatch_until_settled() -> anyhow::Result<()> {
        let mut coordinator = TurnCoordinator::new();
        let _ = coordinator.submit(TurnContent::text("run"));
        let _ = coordinator.submit(TurnContent::text("queued"));
        let _ = coordinator.approval_requested(None, approval(1), Instant::now());

        let InterruptOutcome::Interrupted {
            turn_id, cancelled, ..
        } = coordinator.interrupt()
        else {
            anyhow::bail!("running turn was not interrupted");
        };
        assert_eq!(turn_id, TurnId::new(1));
        assert_eq!(cancelled.len(), 1);
        assert_eq!(coordinator.running_turn(), None);
        assert!(matches!(
            coordinator.submit(TurnContent::text("more")),
            Ok(SubmitOutcome::Queued { position: 2, .. })
        ));
        let next = coordinator.interrupt_settled();
        assert_eq!(next.map(|ticket| ticket.id), Some(TurnId::new(2)));
        Ok(())
    }

    #[test]
    fn interrupt_when_idle_is_a_no_op() {
        let mut coordinator = TurnCoordinator::new();
        assert_eq!(coordinator.interrupt(), InterruptOutcome::NoOp);
        assert_eq!(coordinator.interrupt_settled(), None);
        assert_eq!(coordinator.state(), CoordinatorState::Idle);
    }

    #[test]
    fn events_from_interrupted_backend_turns_are_dropped() {
        let mut coordinator = TurnCoordinator::new();
        let _ = coordinator.submit(TurnContent::text("a"));
        assert_eq!(
            coordinator.turn_started(TurnId::new(1), "backend-1"),
            StartAck::Recorded
        );
        let _ = coordinator.interrupt();
        assert_eq!(coordinator.interrupt_settled(), None);
        assert!(matches!(
            coordinator.submit(TurnContent::text("b")),
            Ok(SubmitOutcome::Dispatch(_))
        ));

        assert_eq!(coordinator.claim_event(Some("backend-1")), None);
        assert!(
            coordinator
                .backend_completed(Some("backend-1"), TurnResolution::Interrupted)
                .is_none()
        );
        assert_eq!(coordinator.claim_event(Some("backend-2")), Some(TurnId::new(2)));
        assert_eq!(coordinator.claim_event(Some("other")), None);
    }

    #[test]
    fn interrupt_before_acknowledgement_asks_for_backend_interrupt() {
        let mut coordinator = TurnCoordinator::new();
        let ticket = dispatched(coordinator.submit(TurnContent::text("a")));
        let ticket = ticket.map(|ticket| ticket.id).unwrap_or(TurnId::new(0));
        assert!(matches!(
            coordinator.interrupt(),
            InterruptOutcome::Interrupted {
                backend_turn_id: None,
                ..
            }
        ));
        assert_eq!(
            coordinator.turn_started(ticket, "late"),
            StartAck::InterruptBackend
        );
        assert_eq!(coordinator.claim_event(Some("late")), None);
    }

    #[test]
    fn fail_all_fails_running_and_queued_turns() {
        let mut coordinator = TurnCoordinator::new();
        let _ = coordinator.submit(TurnContent::text("a"));
        let _ = coordinator.submit(TurnContent::text("b"));
        let _ = coordinator.approval_requested(None, approval(3), Instant::now());

        let failure = TurnFailure::ProcessCrashed {
            code: Some(1),
            signal: None,
        };
        let teardown = coordinator.fail_all(&failure);
        assert_eq!(teardown.running, Some((TurnId::new(1), failure.clone())));
        assert_eq!(teardown.queued, vec![TurnId::new(2)]);
        assert_eq!(teardown.cancelled.len(), 1);
        assert_eq!(coordinator.fail_all(&failure), Teardown::default());
        assert_eq!(
            coordinator.submit(TurnContent::text("c")),
            Err(TurnError::SessionClosed)
        );
        assert_eq!(coordinator.state(), CoordinatorState::Closed);
    }

    #[test]
    fn expired_approvals_reject_late_answers() {
        let mut coordinator = TurnCoordinator::new();
        let _ = coordinator.submit(TurnContent::text("a"));
        let asked = Instant::now();
        let _ = coordinator.approval_requested(None, approval(5), asked);
        assert!(
            coordinator
                .expire_approvals(asked, Duration::from_secs(60))
                .is_empty()
        );
        let expired =
            coordinator.expire_approvals(asked + Duration::from_secs(61), Duration::from_secs(60));
        assert_eq!(expired.len(), 1);
        let id = ApprovalId::new(RequestId::Integer(5));
        assert_eq!(
            coordinator.resolve_approval(&id),
            Err(TurnError::ApprovalTimeout(id.clone()))
        );
    }

    #[test]
    fn bookkeeping_of_older_turns_is_pruned() {
        let mut coordinator = TurnCoordinator::new();
        for turn in 1..=5_i64 {
            let _ = coordinator.submit(TurnContent::text("run"));
            let turn_id = TurnId::new(turn as u64);
            let backend_turn_id = format!("backend-{turn}");
            assert_eq!(
                coordinator.turn_started(turn_id, &backend_turn_id),
                StartAck::Recorded
            );
            let asked = Instant::now();
            let answered = approval(turn * 10);
            let answered_id = answered.id.clone();
            let _ = coordinator.approval_requested(Some(&backend_turn_id), answered, asked);
            let _ = coordinator.resolve_approval(&answered_id);
            let _ =
                coordinator.approval_requested(Some(&backend_turn_id), approval(turn * 10 + 1), asked);
            let _ = coordinator
                .expire_approvals(asked + Duration::from_secs(2), Duration::from_secs(1));
            assert!(
                coordinator
                    .complete(turn_id, TurnResolution::Completed)
                    .is_some()
            );
        }

        assert_eq!(coordinator.answered.len(), 1);
        assert_eq!(coordinator.expired.len(), 1);
        assert_eq!(coordinator.stale_backend_turns.len(), 1);
        let last = ApprovalId::new(RequestId::Integer(50));
        assert_eq!(
            coordinator.resolve_approval(&last),
            Err(TurnError::DuplicateResponse(last.clone()))
        );
        assert_eq!(coordinator.claim_event(Some("backend-5")), None);
    }

    #[test]
    fn teardown_clears_pending_bookkeeping() {
        let mut coordinator = TurnCoordinator::new();
        let _ = coordinator.submit(TurnContent::text("a"));
        let _ = coordinator.interrupt();
        let _ = coordinator.fail_all(&TurnFailure::SessionClosed);
        assert!(coordinator.interrupted_before_start.is_empty());
        assert!(coordinator.stale_backend_turns.is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Submit,
        CompleteRunning,
        Interrupt,
        Settle,
        Approval,
        ResolveApproval,
    }

    impl Arbitrary for Op {
        fn arbitrary(g: &mut Gen) -> Self {
            g.choose(&[
                Op::Submit,
                Op::Submit,
                Op::CompleteRunning,
                Op::Interrupt,
                Op::Settle,
                Op::Approval,
                Op::ResolveApproval,
            ])
            .cloned()
            .unwrap_or(Op::Submit)
        }
    }

    /// Whatever the interleaving, turns start in submission order and no
    /// approval outlives its turn.
    fn serial_fifo_dispatch(ops: Vec<Op>) -> bool {
        let mut coordinator = TurnCoordinator::new();
        let mut submitted = Vec::new();
        let mut started = Vec::new();
        let mut next_approval = 0;

        for op in ops {
            match op {
                Op::Submit => match coordinator.submit(TurnContent::text("m")) {
                    Ok(SubmitOutcome::Dispatch(ticket)) => {
                        submitted.push(ticket.id);
                        started.push(ticket.id);
                    }
                    Ok(SubmitOutcome::Queued { turn_id, .. }) => submitted.push(turn_id),
                    Err(_) => return false,
                },
                Op::CompleteRunning => {
                    if let Some(turn_id) = coordinator.running_turn()
                        && let Some(resolved) =
                            coordinator.complete(turn_id, TurnResolution::Completed)
                        && let Some(next) = resolved.next
                    {
                        started.push(next.id);
                    }
                }
                Op::Interrupt => {
                    let _ = coordinator.interrupt();
                }
                Op::Settle => {
                    if let Some(next) = coordinator.interrupt_settled() {
                        started.push(next.id);
                    }
                }
                Op::Approval => {
                    next_approval += 1;
                    let _ = coordinator.approval_requested(
                        None,
                        approval(next_approval),
                        Instant::now(),
                    );
                }
                Op::ResolveApproval => {
                    if let Some(open) = coordinator.open_approvals().first().cloned() {
                        let _ = coordinator.resolve_approval(&open.id);
                    }
                }
            }
            if coordinator.running_turn().is_none() && !coordinator.open_approvals().is_empty() {
                return false;
            }
        }

        started.windows(2).all(|pair| pair[0] < pair[1])
            && started.iter().all(|id| submitted.contains(id))
    }

    #[test]
    fn dispatch_is_serial_and_fifo() {
        QuickCheck::new()
            .tests(300)
            .quickcheck(serial_fifo_dispatch as fn(Vec<Op>) -> bool);
    }
}
