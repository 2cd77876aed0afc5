//! Task record: lease + envelope + state.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{TaskEnvelope, TaskId, TaskState, WorkerId};

/// A time-bounded claim of one worker over one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub task_id: TaskId,
    pub owner: WorkerId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// What a worker reports when it lets go of a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Task done.
    Ack,
    /// Handler failed; count a retry and go back to pending.
    Retry,
    /// Hand back without counting a retry (shutdown).
    Redeliver,
    /// Give up.
    Fail,
}

/// Single source of truth for one task inside the lease manager.
///
/// All state transitions happen through the methods here.
#[derive(Debug, Clone)]
pub(crate) struct TaskRecord {
    pub envelope: TaskEnvelope,
    pub state: TaskState,
    pub lease: Option<Lease>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn pending(envelope: TaskEnvelope) -> Self {
        Self {
            envelope,
            state: TaskState::Pending,
            lease: None,
            finished_at: None,
        }
    }

    /// Lease still valid at `now`.
    pub fn active_lease(&self, now: DateTime<Utc>) -> Option<&Lease> {
        self.lease.as_ref().filter(|l| !l.is_expired(now))
    }

    pub fn start_lease(&mut self, lease: Lease) {
        self.state = TaskState::Leased;
        self.lease = Some(lease);
    }

    pub fn back_to_pending(&mut self, count_retry: bool) {
        if count_retry {
            self.envelope.increment_retry();
        }
        self.state = TaskState::Pending;
        self.lease = None;
    }

    pub fn finish(&mut self, state: TaskState, now: DateTime<Utc>) {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.lease = None;
        self.finished_at = Some(now);
    }

    /// Lease ran out: counts as a failed attempt.
    /// Returns `true` when the task went back to pending, `false` when the
    /// retry budget is spent and the task failed.
    pub fn expire(&mut self, now: DateTime<Utc>) -> bool {
        if self.envelope.is_exhausted() {
            self.finish(TaskState::Failed, now);
            false
        } else {
            self.back_to_pending(true);
            true
        }
    }

    /// Terminal and past its retention.
    pub fn is_prunable(&self, now: DateTime<Utc>) -> bool {
        let Some(finished_at) = self.finished_at else {
            return false;
        };
        let retention =
            chrono::Duration::from_std(self.envelope.retention()).unwrap_or(chrono::Duration::MAX);
        finished_at
            .checked_add_signed(retention)
            .is_some_and(|until| until <= now)
    }
}
