//! WorkerLoop - 1 worker 分の実行ループ
//!
//! # フロー
//! 1. TaskQueue::pull() で envelope 取得（shutdown と select で競合）
//! 2. LeaseManager::acquire() で lease 発行
//! 3. Dispatcher::dispatch()（実行中は ttl/2 ごとに lease を renew）
//! 4. finalize: lease を release してからキューへ反映
//!
//! stop 要求後に終わった handler の結果は Ack 以外すべて Redeliver
//! （retry を数えず、backoff なしで Pending に戻す）に置き換えます。
//!
//! pull から最後のキュー更新までの間、worker は手元の task を [`HeldSlot`] に
//! 置いておきます。drain timeout で abort された場合は pool がそれを回収します。
//!
//! キューに到達できない（`QueueError::Unavailable`）場合はこの worker だけを
//! 停止します。他の worker は動き続けます。

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::dispatcher::Dispatcher;
use crate::domain::{DispatchOutcome, QueueError, TaskEnvelope, TaskId, TaskloomError, WorkerId};
use crate::lease::{LeaseManager, Release};
use crate::ports::{Clock, MAX_WAIT, TaskQueue, instant_after, saturating_after};
use crate::typed::HandlerContext;

/// How a worker loop ended.
#[derive(Debug)]
pub(crate) enum WorkerExit {
    /// Shutdown was requested.
    Stopped,
    /// Infrastructure failure; the worker gave up.
    Halted(TaskloomError),
}

/// The queue-side half of finalize.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum QueueUpdate {
    Ack(TaskId),
    Requeue(TaskEnvelope),
    Archive { envelope: TaskEnvelope, reason: String },
}

impl QueueUpdate {
    pub(crate) async fn apply(self, queue: &dyn TaskQueue) -> Result<(), QueueError> {
        match self {
            Self::Ack(task_id) => queue.ack(task_id).await,
            Self::Requeue(envelope) => queue.requeue(envelope).await,
            Self::Archive { envelope, reason } => queue.archive(envelope, reason).await,
        }
    }
}

/// What a worker has in hand between `pull` and the last queue call.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Held {
    /// Pulled; the lease is not settled yet.
    Pulled(TaskEnvelope),
    /// Lease released; the queue has not heard about it yet.
    Settling(QueueUpdate),
}

/// Shared between a worker and the pool. Never locked across an `.await`.
#[derive(Debug, Clone, Default)]
pub(crate) struct HeldSlot(Arc<Mutex<Option<Held>>>);

impl HeldSlot {
    fn set(&self, held: Held) {
        *self.lock() = Some(held);
    }

    fn clear(&self) {
        *self.lock() = None;
    }

    pub(crate) fn take(&self) -> Option<Held> {
        self.lock().take()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Held>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) struct WorkerLoop {
    pub worker_id: WorkerId,
    pub queue: Arc<dyn TaskQueue>,
    pub leases: Arc<LeaseManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub clock: Arc<dyn Clock>,
    pub lease_ttl: Duration,
    pub poll_interval: Duration,
    pub shutdown: watch::Receiver<bool>,
    pub held: HeldSlot,
}

impl WorkerLoop {
    pub async fn run(mut self) -> WorkerExit {
        let worker_id = self.worker_id;
        debug!(%worker_id, "worker started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            // pull は待つ可能性があるので shutdown と競合させる
            let pulled = tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                pulled = self.queue.pull(self.poll_interval) => pulled,
            };

            let envelope = match pulled {
                Ok(Some(envelope)) => envelope,
                Ok(None) => continue,
                Err(e) => return self.halt(e.into()),
            };

            // pull の戻りからここまで await を挟まない
            self.held.set(Held::Pulled(envelope.clone()));
            if let Err(e) = self.process(envelope).await {
                return self.halt(e);
            }
            self.held.clear();
        }

        debug!(%worker_id, "worker stopped");
        WorkerExit::Stopped
    }

    fn halt(&self, err: TaskloomError) -> WorkerExit {
        error!(worker_id = %self.worker_id, error = %err, "worker halted on infrastructure error");
        WorkerExit::Halted(err)
    }

    /// One lease → dispatch → finalize cycle. `Err` only for queue failures.
    async fn process(&self, envelope: TaskEnvelope) -> Result<(), TaskloomError> {
        let worker_id = self.worker_id;
        let task_id = envelope.id();

        let claim = match self.leases.acquire(&envelope, worker_id, self.lease_ttl).await {
            Ok(claim) => claim,
            Err(TaskloomError::TaskFinished(_)) => {
                debug!(%task_id, %worker_id, "dropping duplicate delivery of finished task");
                return match self.queue.ack(task_id).await {
                    Ok(()) | Err(QueueError::NotFound(_)) => Ok(()),
                    Err(e) => Err(e.into()),
                };
            }
            Err(e @ TaskloomError::AlreadyLeased { .. }) => {
                debug!(%task_id, %worker_id, reason = %e, "skipping task leased by another worker");
                return Ok(());
            }
            Err(e) => {
                warn!(%task_id, %worker_id, error = %e, "could not lease task");
                return Ok(());
            }
        };

        let envelope = claim.envelope;
        info!(
            %task_id,
            task_type = %envelope.task_type(),
            %worker_id,
            retry_count = envelope.retry_count(),
            "processing task"
        );

        let ctx = HandlerContext::for_envelope(&envelope)
            .with_worker(worker_id)
            .with_shutdown(self.shutdown.clone());
        let outcome = self.dispatch_with_heartbeat(&envelope, ctx).await;
        self.finalize(envelope, outcome).await
    }

    /// Dispatch while renewing the lease every `ttl / 2`.
    async fn dispatch_with_heartbeat(
        &self,
        envelope: &TaskEnvelope,
        ctx: HandlerContext,
    ) -> DispatchOutcome {
        let task_id = envelope.id();
        let period = (self.lease_ttl / 2).clamp(Duration::from_millis(1), MAX_WAIT);
        let mut heartbeat = tokio::time::interval_at(instant_after(period), period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let dispatch = self.dispatcher.dispatch(envelope, ctx);
        tokio::pin!(dispatch);

        loop {
            tokio::select! {
                outcome = &mut dispatch => return outcome,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.leases.renew(task_id, self.worker_id, self.lease_ttl).await {
                        warn!(%task_id, worker_id = %self.worker_id, error = %e, "lease renewal failed");
                    }
                }
            }
        }
    }

    async fn finalize(
        &self,
        envelope: TaskEnvelope,
        outcome: DispatchOutcome,
    ) -> Result<(), TaskloomError> {
        let task_id = envelope.id();
        let stopping = *self.shutdown.borrow();
        let release = match &outcome {
            DispatchOutcome::Ack => Release::Ack,
            _ if stopping => Release::Redeliver,
            DispatchOutcome::RetryWithBackoff { .. } => Release::Retry,
            DispatchOutcome::PermanentFail { .. } => Release::Fail,
        };

        let mut updated = match self.leases.release(task_id, self.worker_id, release).await {
            Ok(updated) => updated,
            Err(e) => {
                // lease が回収済みなら、結果は捨てて新しい持ち主に任せる
                warn!(
                    %task_id,
                    worker_id = %self.worker_id,
                    decision = outcome.label(),
                    error = %e,
                    "lease lost before finalize, discarding outcome"
                );
                return Ok(());
            }
        };

        let decision = outcome.label();
        let update = match outcome {
            DispatchOutcome::Ack => QueueUpdate::Ack(task_id),
            _ if stopping => {
                info!(
                    %task_id,
                    worker_id = %self.worker_id,
                    decision,
                    "stop requested, redelivering task"
                );
                updated.schedule_at(None);
                QueueUpdate::Requeue(updated)
            }
            DispatchOutcome::RetryWithBackoff { delay, .. } => {
                updated.schedule_at(Some(saturating_after(self.clock.now(), delay)));
                QueueUpdate::Requeue(updated)
            }
            DispatchOutcome::PermanentFail { reason } => QueueUpdate::Archive {
                envelope: updated,
                reason,
            },
        };

        self.held.set(Held::Settling(update.clone()));
        update.apply(self.queue.as_ref()).await?;
        Ok(())
    }
}
