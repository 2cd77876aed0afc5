//! TaskQueue port - 配送キュー
//!
//! Worker 側から見たキューの契約です。Redis などの実装に差し替えられるよう
//! trait として定義しています（開発用実装は `impls::InMemoryQueue`）。
//!
//! # 設計原則
//! - `pull` は timeout 付きの blocking 取得。キャンセル（future の drop）に安全であること
//! - 状態の正本は lease manager。キューは配送順と遅延実行だけを担当する
//! - キューに到達できない場合は `QueueError::Unavailable` を返す

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{QueueError, TaskEnvelope, TaskId};

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Add a new task. With `unique_ttl`, an identical
    /// (queue, type, payload) task is rejected until the ttl passes.
    async fn enqueue(
        &self,
        envelope: TaskEnvelope,
        unique_ttl: Option<Duration>,
    ) -> Result<(), QueueError>;

    /// Wait up to `timeout` for a due task. `Ok(None)` on timeout.
    async fn pull(&self, timeout: Duration) -> Result<Option<TaskEnvelope>, QueueError>;

    /// Put a task back; it becomes pullable at its `process_at`.
    async fn requeue(&self, envelope: TaskEnvelope) -> Result<(), QueueError>;

    /// Task finished; forget it.
    async fn ack(&self, task_id: TaskId) -> Result<(), QueueError>;

    /// Task failed for good; keep it for inspection.
    async fn archive(&self, envelope: TaskEnvelope, reason: String) -> Result<(), QueueError>;
}
