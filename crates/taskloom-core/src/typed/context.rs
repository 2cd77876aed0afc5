//! HandlerContext - handler に渡す実行コンテキスト

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::domain::{TaskEnvelope, TaskId, TaskType, WorkerId};

/// Per-attempt metadata plus the pool's cancellation signal.
///
/// Long-running handlers should poll [`HandlerContext::is_cancelled`] or
/// race against [`HandlerContext::cancelled`]; the pool never kills a
/// handler mid-flight before the drain timeout.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    task_id: TaskId,
    task_type: TaskType,
    queue: String,
    retry_count: u32,
    max_retries: u32,
    deadline: Option<DateTime<Utc>>,
    worker_id: Option<WorkerId>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl HandlerContext {
    pub fn for_envelope(envelope: &TaskEnvelope) -> Self {
        Self {
            task_id: envelope.id(),
            task_type: envelope.task_type().clone(),
            queue: envelope.queue().to_string(),
            retry_count: envelope.retry_count(),
            max_retries: envelope.max_retries(),
            deadline: envelope.deadline(),
            worker_id: None,
            shutdown: None,
        }
    }

    pub fn with_worker(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    pub fn worker_id(&self) -> Option<WorkerId> {
        self.worker_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once shutdown is requested. Never resolves without a
    /// shutdown channel.
    pub async fn cancelled(&self) {
        match &self.shutdown {
            Some(rx) => {
                let mut rx = rx.clone();
                // sender が drop された場合も停止扱い
                let _ = rx.wait_for(|stop| *stop).await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}
