//! LeaseManager - in-flight タスクの所有権管理
//!
//! # 不変条件
//! - 1 つの task_id に対して有効な lease は常に高々 1 つ
//! - すべての acquire / release は単一の Mutex の内側で行う（線形化可能）
//!
//! # 状態遷移
//! `Pending → Leased → {Acked | Pending (retry/redeliver/expiry) | Failed}`
//!
//! lease の期限切れを判定して回収するのは `sweep` だけです。期限切れでも
//! まだ誰にも回収されていない lease は、元の持ち主が renew / release できます。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::record::{Lease, Release, TaskRecord};
use crate::domain::{TaskEnvelope, TaskId, TaskState, TaskloomError, WorkerId};
use crate::ports::{Clock, SystemClock, saturating_after};

/// A granted lease plus the authoritative envelope to process.
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    pub lease: Lease,
    pub envelope: TaskEnvelope,
}

/// What one sweep did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    /// Expired leases sent back to pending; the caller must requeue them.
    pub requeued: Vec<TaskEnvelope>,
    /// Expired leases whose retry budget was spent; the caller must archive them.
    pub failed: Vec<TaskEnvelope>,
    /// Terminal records dropped after their retention.
    pub pruned: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty() && self.pruned == 0
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LeaseCounts {
    pub pending: usize,
    pub leased: usize,
    pub acked: usize,
    pub failed: usize,
}

pub struct LeaseManager {
    table: Mutex<HashMap<TaskId, TaskRecord>>,
    clock: Arc<dyn Clock>,
}

impl LeaseManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Claim `envelope` for `owner` until `now + ttl`.
    ///
    /// Fails with `AlreadyLeased` while another lease is active and with
    /// `TaskFinished` for tasks already acked or failed. A lease that expired
    /// but was not swept yet may be taken over.
    pub async fn acquire(
        &self,
        envelope: &TaskEnvelope,
        owner: WorkerId,
        ttl: Duration,
    ) -> Result<Claim, TaskloomError> {
        let now = self.clock.now();
        let expires_at = saturating_after(now, ttl);
        let task_id = envelope.id();

        let mut table = self.table.lock().await;
        let record = table
            .entry(task_id)
            .or_insert_with(|| TaskRecord::pending(envelope.clone()));

        if record.state.is_terminal() {
            return Err(TaskloomError::TaskFinished(task_id));
        }
        if let Some(active) = record.active_lease(now) {
            return Err(TaskloomError::AlreadyLeased {
                task_id,
                owner: active.owner,
            });
        }
        if let Some(stale) = record.lease {
            warn!(%task_id, previous_owner = %stale.owner, new_owner = %owner, "taking over expired lease");
        }

        let lease = Lease {
            task_id,
            owner,
            acquired_at: now,
            expires_at,
        };
        record.start_lease(lease);
        Ok(Claim {
            lease,
            envelope: record.envelope.clone(),
        })
    }

    /// Extend a lease held by `owner` to `now + ttl`.
    pub async fn renew(
        &self,
        task_id: TaskId,
        owner: WorkerId,
        ttl: Duration,
    ) -> Result<Lease, TaskloomError> {
        let now = self.clock.now();
        let mut table = self.table.lock().await;
        let record = table
            .get_mut(&task_id)
            .ok_or(TaskloomError::UnknownTask(task_id))?;
        let lease = record
            .lease
            .as_mut()
            .ok_or(TaskloomError::LeaseExpired(task_id))?;
        if lease.owner != owner {
            return Err(TaskloomError::NotLeaseHolder {
                task_id,
                worker_id: owner,
            });
        }
        lease.expires_at = saturating_after(now, ttl);
        Ok(*lease)
    }

    /// Let go of a lease and record the outcome.
    ///
    /// Returns the updated envelope (with `retry_count` already incremented
    /// for `Release::Retry`).
    pub async fn release(
        &self,
        task_id: TaskId,
        owner: WorkerId,
        release: Release,
    ) -> Result<TaskEnvelope, TaskloomError> {
        let now = self.clock.now();
        let mut table = self.table.lock().await;
        let record = table
            .get_mut(&task_id)
            .ok_or(TaskloomError::UnknownTask(task_id))?;

        if record.state.is_terminal() {
            return Err(TaskloomError::TaskFinished(task_id));
        }
        let lease = record.lease.ok_or(TaskloomError::LeaseExpired(task_id))?;
        if lease.owner != owner {
            return Err(TaskloomError::NotLeaseHolder {
                task_id,
                worker_id: owner,
            });
        }

        match release {
            Release::Ack => record.finish(TaskState::Acked, now),
            Release::Fail => record.finish(TaskState::Failed, now),
            Release::Retry => record.back_to_pending(true),
            Release::Redeliver => record.back_to_pending(false),
        }
        debug!(%task_id, worker_id = %owner, ?release, state = ?record.state, "lease released");
        Ok(record.envelope.clone())
    }

    /// Reclaim expired leases and prune finished records past retention.
    pub async fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let mut report = SweepReport::default();
        let mut table = self.table.lock().await;

        for record in table.values_mut() {
            let expired = record.state == TaskState::Leased
                && record.lease.is_some_and(|l| l.is_expired(now));
            if !expired {
                continue;
            }
            if record.expire(now) {
                report.requeued.push(record.envelope.clone());
            } else {
                report.failed.push(record.envelope.clone());
            }
        }

        let before = table.len();
        table.retain(|_, record| !record.is_prunable(now));
        report.pruned = before - table.len();
        report
    }

    /// Hand back every lease `owner` holds, without counting retries.
    pub async fn release_owned_by(&self, owner: WorkerId) -> Vec<TaskEnvelope> {
        let mut table = self.table.lock().await;
        table
            .values_mut()
            .filter(|r| r.state == TaskState::Leased && r.lease.is_some_and(|l| l.owner == owner))
            .map(|record| {
                record.back_to_pending(false);
                record.envelope.clone()
            })
            .collect()
    }

    pub async fn state(&self, task_id: TaskId) -> Option<TaskState> {
        self.table.lock().await.get(&task_id).map(|r| r.state)
    }

    pub async fn lease(&self, task_id: TaskId) -> Option<Lease> {
        self.table.lock().await.get(&task_id).and_then(|r| r.lease)
    }

    pub async fn counts(&self) -> LeaseCounts {
        let table = self.table.lock().await;
        let mut counts = LeaseCounts::default();
        for record in table.values() {
            match record.state {
                TaskState::Pending => counts.pending += 1,
                TaskState::Leased => counts.leased += 1,
                TaskState::Acked => counts.acked += 1,
                TaskState::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

impl Default for LeaseManager {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}
