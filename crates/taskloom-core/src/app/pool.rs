//! WorkerPool - 並行 worker と reaper の起動・停止
//!
//! # 停止手順（drain）
//! 1. shutdown を通知（pull 中の worker はすぐ抜ける、handler は `ctx.cancelled()` で検知）
//! 2. `shutdown_timeout` まで worker の終了を待つ
//! 3. 間に合わない worker は abort し、持っていた lease を Pending に戻してキューへ再投入
//! 4. lease を取る前、またはキュー更新の途中で止まった task も worker の
//!    `HeldSlot` から拾って片付ける
//!
//! 停止後に Leased のまま残るタスクはありません。

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::dispatcher::Dispatcher;
use super::reaper_loop::ReaperLoop;
use super::worker_loop::{Held, HeldSlot, QueueUpdate, WorkerExit, WorkerLoop};
use crate::config::WorkerConfig;
use crate::domain::{QueueError, TaskEnvelope, TaskState, WorkerId};
use crate::lease::LeaseManager;
use crate::ports::{Clock, EventSink, SystemClock, TaskQueue, TracingEventSink, instant_after};
use crate::typed::HandlerRegistry;

pub struct WorkerPool {
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    leases: Arc<LeaseManager>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

/// How the pool wound down.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Workers that exited on their own after the stop signal.
    pub stopped: usize,
    /// Workers that had already stopped on an infrastructure error or panic.
    pub halted: usize,
    /// Workers still busy at the drain timeout.
    pub aborted: usize,
    /// Tasks the pool put back in the queue for workers that did not
    /// finish cleanly. Workers that stop on their own requeue their
    /// interrupted task themselves and are not counted here.
    pub redelivered: usize,
}

struct WorkerSlot {
    worker_id: WorkerId,
    join: JoinHandle<WorkerExit>,
    held: HeldSlot,
}

/// A running pool. Dropping it without calling `shutdown` leaves the
/// workers running until the runtime stops.
pub struct PoolHandle {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<WorkerSlot>,
    reaper: JoinHandle<()>,
    leases: Arc<LeaseManager>,
    queue: Arc<dyn TaskQueue>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(registry: HandlerRegistry, config: WorkerConfig) -> Self {
        Self::from_shared(Arc::new(registry), config)
    }

    pub fn from_shared(registry: Arc<HandlerRegistry>, config: WorkerConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            registry,
            config,
            leases: Arc::new(LeaseManager::new(Arc::clone(&clock))),
            sink: Arc::new(TracingEventSink),
            clock,
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replaces the clock and starts from an empty lease table.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.leases = Arc::new(LeaseManager::new(Arc::clone(&clock)));
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn leases(&self) -> Arc<LeaseManager> {
        Arc::clone(&self.leases)
    }

    /// Spawn `concurrency` workers and the reaper against `queue`.
    pub fn start(&self, queue: Arc<dyn TaskQueue>) -> PoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = Arc::new(
            Dispatcher::new(Arc::clone(&self.registry))
                .with_retry_policy(self.config.retry_policy())
                .with_event_sink(Arc::clone(&self.sink))
                .with_clock(Arc::clone(&self.clock)),
        );

        let workers = (0..self.config.concurrency)
            .map(|_| {
                let worker_id = WorkerId::generate();
                let held = HeldSlot::default();
                let worker = WorkerLoop {
                    worker_id,
                    queue: Arc::clone(&queue),
                    leases: Arc::clone(&self.leases),
                    dispatcher: Arc::clone(&dispatcher),
                    clock: Arc::clone(&self.clock),
                    lease_ttl: self.config.lease_ttl(),
                    poll_interval: self.config.poll_interval(),
                    shutdown: shutdown_rx.clone(),
                    held: held.clone(),
                };
                WorkerSlot {
                    worker_id,
                    join: tokio::spawn(worker.run()),
                    held,
                }
            })
            .collect();

        let reaper = ReaperLoop::new(
            Arc::clone(&self.leases),
            Arc::clone(&queue),
            self.config.sweep_interval(),
        );
        let reaper = tokio::spawn(reaper.run(shutdown_rx));

        info!(
            concurrency = self.config.concurrency,
            queues = ?self.config.queues,
            handlers = ?self.registry.registered_types(),
            "worker pool started"
        );

        PoolHandle {
            shutdown_tx,
            workers,
            reaper,
            leases: Arc::clone(&self.leases),
            queue,
            config: self.config.clone(),
        }
    }

    /// Run until `shutdown` resolves, then drain.
    pub async fn run<F>(&self, queue: Arc<dyn TaskQueue>, shutdown: F) -> DrainReport
    where
        F: Future<Output = ()>,
    {
        let handle = self.start(queue);
        shutdown.await;
        handle.shutdown().await
    }
}

impl PoolHandle {
    pub fn leases(&self) -> Arc<LeaseManager> {
        Arc::clone(&self.leases)
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.iter().map(|w| w.worker_id).collect()
    }

    /// Stop pulling, wait up to `shutdown_timeout`, then abort stragglers
    /// and redeliver whatever they still held.
    pub async fn shutdown(mut self) -> DrainReport {
        info!("worker pool shutting down");
        // receiver が全部 drop 済みでも問題ない
        let _ = self.shutdown_tx.send(true);

        let deadline = instant_after(self.config.shutdown_timeout());
        let mut report = DrainReport::default();

        for WorkerSlot {
            worker_id,
            mut join,
            held,
        } in std::mem::take(&mut self.workers)
        {
            match tokio::time::timeout_at(deadline, &mut join).await {
                Ok(Ok(WorkerExit::Stopped)) => report.stopped += 1,
                Ok(Ok(WorkerExit::Halted(e))) => {
                    warn!(%worker_id, error = %e, "worker had already halted");
                    report.halted += 1;
                }
                Ok(Err(e)) => {
                    error!(%worker_id, error = %e, "worker task panicked");
                    report.halted += 1;
                }
                Err(_) => {
                    warn!(%worker_id, "worker did not drain in time, aborting");
                    join.abort();
                    // abort が反映されるまで待ってから lease を回収する
                    let _ = join.await;
                    report.aborted += 1;
                }
            }
            report.redelivered +=
                recover(&self.leases, self.queue.as_ref(), worker_id, held.take()).await;
        }

        if let Err(e) = self.reaper.await {
            error!(error = %e, "reaper task panicked");
        }

        info!(
            stopped = report.stopped,
            halted = report.halted,
            aborted = report.aborted,
            redelivered = report.redelivered,
            "worker pool stopped"
        );
        report
    }
}

/// Put back whatever `worker_id` left behind once it is no longer running.
///
/// Leases it still holds go back to Pending. A task it had pulled but not
/// leased is requeued unless someone else owns it now. A queue update it
/// started after releasing the lease is carried out here.
async fn recover(
    leases: &LeaseManager,
    queue: &dyn TaskQueue,
    worker_id: WorkerId,
    held: Option<Held>,
) -> usize {
    let mut redelivered = 0;
    let mut returned = HashSet::new();
    for envelope in leases.release_owned_by(worker_id).await {
        returned.insert(envelope.id());
        if requeue(queue, worker_id, envelope).await {
            redelivered += 1;
        }
    }

    match held {
        Some(Held::Pulled(envelope)) if !returned.contains(&envelope.id()) => {
            let task_id = envelope.id();
            match leases.state(task_id).await {
                Some(TaskState::Leased) => {}
                Some(TaskState::Acked | TaskState::Failed) => match queue.ack(task_id).await {
                    Ok(()) | Err(QueueError::NotFound(_)) => {}
                    Err(e) => error!(%task_id, %worker_id, error = %e, "dropping finished task failed"),
                },
                Some(TaskState::Pending) | None => {
                    if requeue(queue, worker_id, envelope).await {
                        redelivered += 1;
                    }
                }
            }
        }
        Some(Held::Settling(update)) => {
            let requeues = matches!(update, QueueUpdate::Requeue(_));
            match update.apply(queue).await {
                Ok(()) if requeues => redelivered += 1,
                Ok(()) => {}
                Err(e) => error!(%worker_id, error = %e, "finishing interrupted queue update failed"),
            }
        }
        _ => {}
    }
    redelivered
}

async fn requeue(queue: &dyn TaskQueue, worker_id: WorkerId, envelope: TaskEnvelope) -> bool {
    let task_id = envelope.id();
    match queue.requeue(envelope).await {
        Ok(()) => true,
        Err(e) => {
            error!(%task_id, %worker_id, error = %e, "redelivery on shutdown failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HandlerOutcome, TaskId};
    use crate::impls::InMemoryQueue;
    use crate::ports::{EventLevel, MemoryEventSink};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Never finishes the first requeue; everything else goes straight through.
    struct StallFirstRequeue {
        inner: Arc<InMemoryQueue>,
        stalled: AtomicBool,
    }

    #[async_trait]
    impl TaskQueue for StallFirstRequeue {
        async fn enqueue(
            &self,
            envelope: TaskEnvelope,
            unique_ttl: Option<Duration>,
        ) -> Result<(), QueueError> {
            self.inner.enqueue(envelope, unique_ttl).await
        }

        async fn pull(&self, timeout: Duration) -> Result<Option<TaskEnvelope>, QueueError> {
            self.inner.pull(timeout).await
        }

        async fn requeue(&self, envelope: TaskEnvelope) -> Result<(), QueueError> {
            if !self.stalled.swap(true, Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.inner.requeue(envelope).await
        }

        async fn ack(&self, task_id: TaskId) -> Result<(), QueueError> {
            self.inner.ack(task_id).await
        }

        async fn archive(&self, envelope: TaskEnvelope, reason: String) -> Result<(), QueueError> {
            self.inner.archive(envelope, reason).await
        }
    }

    fn config(concurrency: usize) -> WorkerConfig {
        WorkerConfig {
            concurrency,
            lease_ttl_ms: 5_000,
            sweep_interval_ms: 50,
            poll_interval_ms: 20,
            shutdown_timeout_ms: 500,
            ..WorkerConfig::default()
        }
    }

    async fn wait_until_idle(queue: &InMemoryQueue) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !queue.is_idle().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("queue did not drain");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn drains_every_task_exactly_once() {
        let seen: Arc<Mutex<HashMap<TaskId, u32>>> = Arc::default();
        let recorder = Arc::clone(&seen);
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("noop", move |ctx, _payload| {
                let recorder = Arc::clone(&recorder);
                async move {
                    *recorder.lock().unwrap().entry(ctx.task_id()).or_default() += 1;
                    HandlerOutcome::success()
                }
            })
            .unwrap();

        let sink = MemoryEventSink::new();
        let pool = WorkerPool::new(registry, config(4)).with_event_sink(Arc::new(sink.clone()));
        let queue = Arc::new(InMemoryQueue::new());
        let mut ids = Vec::new();
        for _ in 0..50 {
            let env = TaskEnvelope::new(TaskId::generate(), "noop", b"{}".to_vec());
            ids.push(env.id());
            queue.enqueue(env, None).await.unwrap();
        }

        let handle = pool.start(queue.clone());
        wait_until_idle(&queue).await;
        let report = handle.shutdown().await;

        assert_eq!(report.stopped, 4);
        assert_eq!(report.redelivered, 0);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 50);
        assert!(seen.values().all(|&n| n == 1));
        assert_eq!(sink.count(EventLevel::Info), 50);
        for id in ids {
            assert_eq!(pool.leases().state(id).await, Some(TaskState::Acked));
        }
    }

    #[tokio::test]
    async fn cooperative_handlers_leave_nothing_leased_on_shutdown() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("long", |ctx, _payload| async move {
                ctx.cancelled().await;
                HandlerOutcome::retry("interrupted by shutdown")
            })
            .unwrap();
        let pool = WorkerPool::new(registry, config(2));
        let queue = Arc::new(InMemoryQueue::new());
        for _ in 0..2 {
            let env = TaskEnvelope::new(TaskId::generate(), "long", b"{}".to_vec());
            queue.enqueue(env, None).await.unwrap();
        }

        let handle = pool.start(queue.clone());
        let leases = handle.leases();
        tokio::time::timeout(Duration::from_secs(5), async {
            while leases.counts().await.leased < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let report = handle.shutdown().await;

        assert_eq!(report.stopped, 2);
        assert_eq!(report.aborted, 0);
        let counts = leases.counts().await;
        assert_eq!(counts.leased, 0);
        assert_eq!(counts.pending, 2);
        let queued = queue.counts().await;
        assert_eq!(queued.pending, 2);
        assert_eq!(queued.scheduled, 0);
    }

    #[tokio::test]
    async fn interrupted_task_without_retries_left_is_not_failed() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("long", |ctx, _payload| async move {
                ctx.cancelled().await;
                HandlerOutcome::retry("interrupted by shutdown")
            })
            .unwrap();
        let pool = WorkerPool::new(registry, config(1));
        let queue = Arc::new(InMemoryQueue::new());
        let env = TaskEnvelope::new(TaskId::generate(), "long", b"{}".to_vec()).with_max_retries(0);
        queue.enqueue(env.clone(), None).await.unwrap();

        let handle = pool.start(queue.clone());
        let leases = handle.leases();
        tokio::time::timeout(Duration::from_secs(5), async {
            while leases.state(env.id()).await != Some(TaskState::Leased) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let report = handle.shutdown().await;

        assert_eq!(report.stopped, 1);
        assert_eq!(leases.state(env.id()).await, Some(TaskState::Pending));
        assert!(queue.archived().await.is_empty());
        let requeued = queue.get(env.id()).await.unwrap();
        assert_eq!(requeued.retry_count(), 0);
        assert_eq!(requeued.process_at(), None);
    }

    #[tokio::test]
    async fn aborted_between_release_and_requeue_still_requeues() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("flaky", |_ctx, _payload| async {
                HandlerOutcome::retry("upstream busy")
            })
            .unwrap();
        let pool = WorkerPool::new(registry, config(1));
        let inner = Arc::new(InMemoryQueue::new());
        let queue = Arc::new(StallFirstRequeue {
            inner: Arc::clone(&inner),
            stalled: AtomicBool::new(false),
        });
        let env = TaskEnvelope::new(TaskId::generate(), "flaky", b"{}".to_vec());
        inner.enqueue(env.clone(), None).await.unwrap();

        let handle = pool.start(queue);
        let leases = handle.leases();
        // release(Retry) done, requeue stuck
        tokio::time::timeout(Duration::from_secs(5), async {
            while leases.state(env.id()).await != Some(TaskState::Pending) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let report = handle.shutdown().await;

        assert_eq!(report.aborted, 1);
        assert_eq!(report.redelivered, 1);
        assert_eq!(inner.counts().await.in_flight, 0);
        assert_eq!(inner.get(env.id()).await.unwrap().retry_count(), 1);
    }

    #[tokio::test]
    async fn pulled_but_unleased_task_goes_back_to_the_queue() {
        let leases = LeaseManager::default();
        let queue = InMemoryQueue::new();
        let env = TaskEnvelope::new(TaskId::generate(), "noop", b"{}".to_vec());
        queue.enqueue(env.clone(), None).await.unwrap();
        let pulled = queue.pull(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(queue.counts().await.in_flight, 1);

        let redelivered =
            recover(&leases, &queue, WorkerId::generate(), Some(Held::Pulled(pulled))).await;

        assert_eq!(redelivered, 1);
        let counts = queue.counts().await;
        assert_eq!(counts.in_flight, 0);
        assert_eq!(counts.pending, 1);
    }

    #[tokio::test]
    async fn held_task_that_is_also_leased_is_redelivered_once() {
        let leases = LeaseManager::default();
        let queue = InMemoryQueue::new();
        let worker_id = WorkerId::generate();
        let env = TaskEnvelope::new(TaskId::generate(), "noop", b"{}".to_vec());
        queue.enqueue(env.clone(), None).await.unwrap();
        let pulled = queue.pull(Duration::from_millis(10)).await.unwrap().unwrap();
        leases
            .acquire(&pulled, worker_id, Duration::from_secs(30))
            .await
            .unwrap();

        let redelivered = recover(&leases, &queue, worker_id, Some(Held::Pulled(pulled))).await;

        assert_eq!(redelivered, 1);
        assert_eq!(leases.state(env.id()).await, Some(TaskState::Pending));
        assert_eq!(queue.counts().await.pending, 1);
    }

    #[tokio::test]
    async fn held_task_leased_by_another_worker_is_left_alone() {
        let leases = LeaseManager::default();
        let queue = InMemoryQueue::new();
        let env = TaskEnvelope::new(TaskId::generate(), "noop", b"{}".to_vec());
        queue.enqueue(env.clone(), None).await.unwrap();
        let pulled = queue.pull(Duration::from_millis(10)).await.unwrap().unwrap();
        leases
            .acquire(&pulled, WorkerId::generate(), Duration::from_secs(30))
            .await
            .unwrap();

        let redelivered =
            recover(&leases, &queue, WorkerId::generate(), Some(Held::Pulled(pulled))).await;

        assert_eq!(redelivered, 0);
        assert_eq!(queue.counts().await.in_flight, 1);
    }

    #[tokio::test]
    async fn huge_timeouts_do_not_overflow() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("noop", |_ctx, _payload| async { HandlerOutcome::success() })
            .unwrap();
        let config = WorkerConfig {
            concurrency: 1,
            lease_ttl_ms: u64::MAX,
            sweep_interval_ms: u64::MAX,
            poll_interval_ms: u64::MAX,
            shutdown_timeout_ms: u64::MAX,
            ..WorkerConfig::default()
        };
        assert!(config.validate().is_ok());
        let pool = WorkerPool::new(registry, config);
        let queue = Arc::new(InMemoryQueue::new());
        let env = TaskEnvelope::new(TaskId::generate(), "noop", b"{}".to_vec());
        queue.enqueue(env.clone(), None).await.unwrap();

        let handle = pool.start(queue.clone());
        wait_until_idle(&queue).await;
        let report = handle.shutdown().await;

        assert_eq!(report.stopped, 1);
        assert_eq!(pool.leases().state(env.id()).await, Some(TaskState::Acked));
    }

    #[tokio::test]
    async fn stuck_handlers_are_aborted_and_redelivered() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("stuck", |_ctx, _payload| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                HandlerOutcome::success()
            })
            .unwrap();
        let pool = WorkerPool::new(registry, config(1));
        let queue = Arc::new(InMemoryQueue::new());
        let env = TaskEnvelope::new(TaskId::generate(), "stuck", b"{}".to_vec());
        queue.enqueue(env.clone(), None).await.unwrap();

        let handle = pool.start(queue.clone());
        let leases = handle.leases();
        tokio::time::timeout(Duration::from_secs(5), async {
            while leases.state(env.id()).await != Some(TaskState::Leased) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let report = handle.shutdown().await;

        assert_eq!(report.aborted, 1);
        assert_eq!(report.redelivered, 1);
        assert_eq!(leases.state(env.id()).await, Some(TaskState::Pending));
        let counts = queue.counts().await;
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.in_flight, 0);
        // redelivery does not count as a retry
        assert_eq!(queue.get(env.id()).await.unwrap().retry_count(), 0);
    }

    #[tokio::test]
    async fn run_stops_when_shutdown_future_resolves() {
        let pool = WorkerPool::new(HandlerRegistry::new(), config(3));
        let queue = Arc::new(InMemoryQueue::new());

        let report = pool
            .run(queue, tokio::time::sleep(Duration::from_millis(50)))
            .await;

        assert_eq!(report.stopped, 3);
    }
}
