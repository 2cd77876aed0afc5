//! Errors - エラー型と分類
//!
//! ErrorKind で運用上の分類を付けています。
//! - Transient: 一時的なエラー（リトライ推奨）
//! - Permanent: 恒久的なエラー（リトライ無意味）
//! - Infrastructure: インフラエラー（キューに到達できないなど）

use thiserror::Error;

use super::envelope::TaskType;
use super::ids::{TaskId, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// Errors reported by a queue implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("task id {0} already exists")]
    TaskIdConflict(TaskId),

    #[error("duplicate task: unique key held until the ttl expires")]
    DuplicateTask,

    #[error("task {0} not found in queue")]
    NotFound(TaskId),
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::Unavailable(_) => ErrorKind::Infrastructure,
            QueueError::TaskIdConflict(_) | QueueError::DuplicateTask => ErrorKind::Permanent,
            QueueError::NotFound(_) => ErrorKind::Transient,
        }
    }
}

/// TaskloomError はドメインエラー
#[derive(Debug, Error)]
pub enum TaskloomError {
    #[error("duplicate handler registration for task_type={0}")]
    DuplicateRegistration(TaskType),

    #[error("no handler registered for task_type={0}")]
    NotFound(TaskType),

    #[error("malformed payload for task_type={task_type}: {reason}")]
    PayloadError { task_type: TaskType, reason: String },

    #[error("handler failed: {0}")]
    HandlerError(String),

    #[error("task {task_id} is already leased by {owner}")]
    AlreadyLeased { task_id: TaskId, owner: WorkerId },

    #[error("lease on task {0} expired")]
    LeaseExpired(TaskId),

    #[error("worker {worker_id} does not hold the lease on task {task_id}")]
    NotLeaseHolder { task_id: TaskId, worker_id: WorkerId },

    #[error("task {0} already finished")]
    TaskFinished(TaskId),

    #[error("task {0} is not tracked")]
    UnknownTask(TaskId),

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl TaskloomError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskloomError::HandlerError(_)
            | TaskloomError::AlreadyLeased { .. }
            | TaskloomError::LeaseExpired(_) => ErrorKind::Transient,
            TaskloomError::Queue(e) => e.kind(),
            _ => ErrorKind::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<config::ConfigError> for TaskloomError {
    fn from(e: config::ConfigError) -> Self {
        TaskloomError::Config(e.to_string())
    }
}

pub type Result<T, E = TaskloomError> = std::result::Result<T, E>;
