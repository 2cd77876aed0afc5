//! InMemoryQueue - 開発用・テスト用の配送キュー
//!
//! # 学習ポイント
//! - `tokio::sync::Mutex` + `Notify` による blocking pull
//! - BinaryHeap（min-heap）による遅延実行（retry backoff / process_at）
//! - queue 名ごとの ready キューと優先順位
//!
//! # 実装詳細
//! - `tasks` が正本。ready / scheduled は TaskId だけを持つ
//! - pull は lock 内で pop して即 return するので、future を drop しても取りこぼさない

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};

use crate::domain::{QueueError, TaskEnvelope, TaskId, TaskType};
use crate::observability::QueueCounts;
use crate::ports::{Clock, MAX_WAIT, SystemClock, TaskQueue, instant_after};

/// Scheduled task entry for the priority queue.
///
/// Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledTask {
    process_at: DateTime<Utc>,
    task_id: TaskId,
}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .process_at
            .cmp(&self.process_at)
            .then_with(|| other.task_id.cmp(&self.task_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Ready,
    Scheduled,
    InFlight,
}

#[derive(Debug, Clone)]
struct Slot {
    envelope: TaskEnvelope,
    location: Location,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct UniqueKey {
    queue: String,
    task_type: TaskType,
    payload: Vec<u8>,
}

impl UniqueKey {
    fn of(envelope: &TaskEnvelope) -> Self {
        Self {
            queue: envelope.queue().to_string(),
            task_type: envelope.task_type().clone(),
            payload: envelope.payload().to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct UniqueLock {
    task_id: TaskId,
    expires_at: DateTime<Utc>,
}

/// A permanently failed task kept for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedTask {
    pub envelope: TaskEnvelope,
    pub reason: String,
    pub archived_at: DateTime<Utc>,
}

#[derive(Default)]
struct QueueState {
    /// All live (not acked, not archived) tasks.
    tasks: HashMap<TaskId, Slot>,
    /// queue 名ごとの ready キュー
    ready: BTreeMap<String, VecDeque<TaskId>>,
    scheduled: BinaryHeap<ScheduledTask>,
    unique: HashMap<UniqueKey, UniqueLock>,
    archived: HashMap<TaskId, ArchivedTask>,
    closed: bool,
}

impl QueueState {
    fn place(&mut self, envelope: TaskEnvelope, now: DateTime<Utc>) {
        let task_id = envelope.id();
        let location = match envelope.process_at() {
            Some(at) if !envelope.is_due(now) => {
                self.scheduled.push(ScheduledTask {
                    process_at: at,
                    task_id,
                });
                Location::Scheduled
            }
            _ => {
                self.ready
                    .entry(envelope.queue().to_string())
                    .or_default()
                    .push_back(task_id);
                Location::Ready
            }
        };
        self.tasks.insert(task_id, Slot { envelope, location });
    }

    /// Move due scheduled tasks to their ready queue.
    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(entry) = self.scheduled.peek() {
            if entry.process_at > now {
                break;
            }
            let Some(entry) = self.scheduled.pop() else {
                break;
            };
            // 古いエントリ（ack / 再配置済み）は読み飛ばす
            if let Some(slot) = self.tasks.get_mut(&entry.task_id)
                && slot.location == Location::Scheduled
                && slot.envelope.process_at() == Some(entry.process_at)
            {
                slot.location = Location::Ready;
                self.ready
                    .entry(slot.envelope.queue().to_string())
                    .or_default()
                    .push_back(entry.task_id);
            }
        }
    }

    fn pop_ready(&mut self, priorities: &[String]) -> Option<TaskEnvelope> {
        let ordered: Vec<String> = priorities
            .iter()
            .cloned()
            .chain(
                self.ready
                    .keys()
                    .filter(|name| !priorities.contains(name))
                    .cloned()
                    .collect::<Vec<_>>(),
            )
            .collect();

        for name in ordered {
            let Some(queue) = self.ready.get_mut(&name) else {
                continue;
            };
            while let Some(task_id) = queue.pop_front() {
                if let Some(slot) = self.tasks.get_mut(&task_id)
                    && slot.location == Location::Ready
                {
                    slot.location = Location::InFlight;
                    return Some(slot.envelope.clone());
                }
            }
        }
        None
    }

    fn next_due_in(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.scheduled
            .peek()
            .map(|entry| (entry.process_at - now).to_std().unwrap_or(Duration::ZERO))
    }

    fn release_unique(&mut self, task_id: TaskId) {
        self.unique.retain(|_, lock| lock.task_id != task_id);
    }

    fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for slot in self.tasks.values() {
            match slot.location {
                Location::Ready => counts.pending += 1,
                Location::Scheduled => counts.scheduled += 1,
                Location::InFlight => counts.in_flight += 1,
            }
        }
        counts.archived = self.archived.len();
        counts
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed {
            return Err(QueueError::Unavailable("queue closed".to_string()));
        }
        Ok(())
    }
}

/// In-memory queue implementation.
///
/// # 使用例
/// ```ignore
/// let queue = InMemoryQueue::new().with_priorities(["critical", "default"]);
/// queue.enqueue(envelope, None).await?;
/// let next = queue.pull(Duration::from_secs(1)).await?;
/// ```
pub struct InMemoryQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    clock: Arc<dyn Clock>,
    priorities: Vec<String>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
            clock,
            priorities: Vec::new(),
        }
    }

    /// Strict priority: earlier names are always served first.
    /// Queues not listed are served afterwards in name order.
    pub fn with_priorities<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.priorities = queues.into_iter().map(Into::into).collect();
        self
    }

    /// Simulate losing the backend: every later call fails with
    /// `QueueError::Unavailable`.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    pub async fn counts(&self) -> QueueCounts {
        self.state.lock().await.counts()
    }

    /// Nothing pending, scheduled or in flight.
    pub async fn is_idle(&self) -> bool {
        self.state.lock().await.tasks.is_empty()
    }

    pub async fn archived(&self) -> Vec<ArchivedTask> {
        let state = self.state.lock().await;
        let mut archived: Vec<ArchivedTask> = state.archived.values().cloned().collect();
        archived.sort_by_key(|a| a.archived_at);
        archived
    }

    pub async fn get(&self, task_id: TaskId) -> Option<TaskEnvelope> {
        let state = self.state.lock().await;
        state.tasks.get(&task_id).map(|slot| slot.envelope.clone())
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for InMemoryQueue {
    async fn enqueue(
        &self,
        envelope: TaskEnvelope,
        unique_ttl: Option<Duration>,
    ) -> Result<(), QueueError> {
        let now = self.clock.now();
        {
            let mut state = self.state.lock().await;
            state.ensure_open()?;

            let task_id = envelope.id();
            if state.tasks.contains_key(&task_id) || state.archived.contains_key(&task_id) {
                return Err(QueueError::TaskIdConflict(task_id));
            }

            if let Some(ttl) = unique_ttl {
                let key = UniqueKey::of(&envelope);
                if state.unique.get(&key).is_some_and(|lock| lock.expires_at > now) {
                    return Err(QueueError::DuplicateTask);
                }
                let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
                let expires_at = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
                state.unique.insert(
                    key,
                    UniqueLock {
                        task_id,
                        expires_at,
                    },
                );
            }

            state.place(envelope, now);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pull(&self, timeout: Duration) -> Result<Option<TaskEnvelope>, QueueError> {
        let give_up_at = instant_after(timeout);
        loop {
            // 通知を取りこぼさないよう、状態チェックの前に登録しておく
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut state = self.state.lock().await;
                state.ensure_open()?;
                let now = self.clock.now();
                state.promote_due(now);
                if let Some(envelope) = state.pop_ready(&self.priorities) {
                    return Ok(Some(envelope));
                }
                state.next_due_in(now)
            };

            let now = tokio::time::Instant::now();
            if now >= give_up_at {
                return Ok(None);
            }
            let wake_at = match next_due {
                Some(due) => give_up_at.min(now + due.clamp(Duration::from_millis(1), MAX_WAIT)),
                None => give_up_at,
            };

            tokio::select! {
                _ = &mut notified => {},
                _ = tokio::time::sleep_until(wake_at) => {},
            }
        }
    }

    async fn requeue(&self, envelope: TaskEnvelope) -> Result<(), QueueError> {
        let now = self.clock.now();
        {
            let mut state = self.state.lock().await;
            state.ensure_open()?;
            state.place(envelope, now);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn ack(&self, task_id: TaskId) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        if state.tasks.remove(&task_id).is_none() {
            return Err(QueueError::NotFound(task_id));
        }
        state.release_unique(task_id);
        Ok(())
    }

    async fn archive(&self, envelope: TaskEnvelope, reason: String) -> Result<(), QueueError> {
        let archived_at = self.clock.now();
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        let task_id = envelope.id();
        state.tasks.remove(&task_id);
        state.archived.insert(
            task_id,
            ArchivedTask {
                envelope,
                reason,
                archived_at,
            },
        );
        Ok(())
    }
}
