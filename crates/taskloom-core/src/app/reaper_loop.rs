//! ReaperLoop - Lease 期限切れの回収
//!
//! # フロー
//! 1. LeaseManager::sweep() で期限切れ lease を回収
//! 2. retry が残っていれば TaskQueue::requeue()（at-least-once 配送）
//! 3. retry を使い切っていれば TaskQueue::archive()

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::lease::{LeaseManager, SweepReport};
use crate::ports::{MAX_WAIT, TaskQueue};

pub struct ReaperLoop {
    leases: Arc<LeaseManager>,
    queue: Arc<dyn TaskQueue>,
    interval: Duration,
}

impl ReaperLoop {
    pub fn new(leases: Arc<LeaseManager>, queue: Arc<dyn TaskQueue>, interval: Duration) -> Self {
        Self {
            leases,
            queue,
            interval,
        }
    }

    /// Sweep every `interval` until shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(self.interval.clamp(Duration::from_millis(1), MAX_WAIT));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while !*shutdown.borrow() {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
            }
        }
        debug!("reaper stopped");
    }

    /// One sweep; hands expired tasks back to the queue.
    pub async fn sweep_once(&self) -> SweepReport {
        let report = self.leases.sweep().await;

        for envelope in &report.requeued {
            warn!(
                task_id = %envelope.id(),
                task_type = %envelope.task_type(),
                retry_count = envelope.retry_count(),
                "lease expired, requeueing"
            );
            if let Err(e) = self.queue.requeue(envelope.clone()).await {
                error!(task_id = %envelope.id(), error = %e, "requeue after lease expiry failed");
            }
        }

        for envelope in &report.failed {
            error!(
                task_id = %envelope.id(),
                task_type = %envelope.task_type(),
                retry_count = envelope.retry_count(),
                "lease expired with no retries left, archiving"
            );
            let reason = "lease expired after exhausting retries".to_string();
            if let Err(e) = self.queue.archive(envelope.clone(), reason).await {
                error!(task_id = %envelope.id(), error = %e, "archive after lease expiry failed");
            }
        }

        if report.pruned > 0 {
            debug!(pruned = report.pruned, "pruned finished task records");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskEnvelope, TaskId, TaskState, WorkerId};
    use crate::impls::InMemoryQueue;
    use crate::ports::ManualClock;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn expired_lease_goes_back_to_the_queue() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let queue = Arc::new(InMemoryQueue::with_clock(Arc::new(clock.clone())));
        let leases = Arc::new(LeaseManager::new(Arc::new(clock.clone())));
        let reaper = ReaperLoop::new(Arc::clone(&leases), queue.clone(), Duration::from_secs(1));

        let env = TaskEnvelope::new(TaskId::generate(), "email:send", b"{}".to_vec());
        queue.enqueue(env.clone(), None).await.unwrap();
        let pulled = queue.pull(Duration::from_millis(10)).await.unwrap().unwrap();
        leases
            .acquire(&pulled, WorkerId::generate(), Duration::from_secs(5))
            .await
            .unwrap();

        // worker が落ちたまま ttl が過ぎる
        clock.advance(chrono::Duration::seconds(6));
        let report = reaper.sweep_once().await;

        assert_eq!(report.requeued.len(), 1);
        assert_eq!(leases.state(env.id()).await, Some(TaskState::Pending));
        let redelivered = queue.pull(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(redelivered.id(), env.id());
        assert_eq!(redelivered.retry_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_expiry_is_archived() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let queue = Arc::new(InMemoryQueue::with_clock(Arc::new(clock.clone())));
        let leases = Arc::new(LeaseManager::new(Arc::new(clock.clone())));
        let reaper = ReaperLoop::new(Arc::clone(&leases), queue.clone(), Duration::from_secs(1));

        let env =
            TaskEnvelope::new(TaskId::generate(), "email:send", b"{}".to_vec()).with_max_retries(0);
        queue.enqueue(env.clone(), None).await.unwrap();
        let pulled = queue.pull(Duration::from_millis(10)).await.unwrap().unwrap();
        leases
            .acquire(&pulled, WorkerId::generate(), Duration::from_secs(5))
            .await
            .unwrap();

        clock.advance(chrono::Duration::seconds(6));
        reaper.sweep_once().await;

        assert_eq!(leases.state(env.id()).await, Some(TaskState::Failed));
        assert_eq!(queue.archived().await.len(), 1);
        assert!(queue.is_idle().await);
    }
}
