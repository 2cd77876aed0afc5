//! Task envelope and enqueue options.
//!
//! The envelope is what travels through the queue: type tag, payload bytes
//! and the delivery metadata the worker side needs (retry budget, timeout,
//! deadline, schedule).

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;

pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_MAX_RETRY: u32 = 25;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

/// String tag that selects the handler, e.g. `email:send`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// TaskType + Payload + 配送メタデータの“運搬用”データ。
///
/// Immutable after enqueue except for `retry_count` (owned by the lease
/// manager) and `process_at` (set when a retry is scheduled).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    id: TaskId,
    task_type: TaskType,
    payload: Vec<u8>,
    queue: String,
    retry_count: u32,
    max_retries: u32,
    timeout: Option<Duration>,
    deadline: Option<DateTime<Utc>>,
    process_at: Option<DateTime<Utc>>,
    retention: Duration,
    enqueued_at: DateTime<Utc>,
}

impl TaskEnvelope {
    pub fn new(id: TaskId, task_type: impl Into<TaskType>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            task_type: task_type.into(),
            payload: payload.into(),
            queue: DEFAULT_QUEUE.to_string(),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRY,
            timeout: Some(DEFAULT_TIMEOUT),
            deadline: None,
            process_at: None,
            retention: Duration::ZERO,
            enqueued_at: Utc::now(),
        }
    }

    /// Convenience constructor: serialize `payload` as JSON.
    pub fn json<P: Serialize>(
        id: TaskId,
        task_type: impl Into<TaskType>,
        payload: &P,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(id, task_type, serde_json::to_vec(payload)?))
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<DateTime<Utc>>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_process_at(mut self, process_at: Option<DateTime<Utc>>) -> Self {
        self.process_at = process_at;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_enqueued_at(mut self, enqueued_at: DateTime<Utc>) -> Self {
        self.enqueued_at = enqueued_at;
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
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

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    pub fn process_at(&self) -> Option<DateTime<Utc>> {
        self.process_at
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    /// No retries left: another failure is final.
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.process_at.is_none_or(|at| at <= now)
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }

    /// Time budget for one attempt: the smaller of `timeout` and the time
    /// left until `deadline`. `None` means unbounded.
    pub fn attempt_budget(&self, now: DateTime<Utc>) -> Option<Duration> {
        let until_deadline = self
            .deadline
            .map(|d| (d - now).to_std().unwrap_or(Duration::ZERO));
        match (self.timeout, until_deadline) {
            (Some(t), Some(d)) => Some(t.min(d)),
            (t, d) => t.or(d),
        }
    }

    pub(crate) fn increment_retry(&mut self) {
        self.retry_count += 1;
    }

    pub(crate) fn schedule_at(&mut self, at: Option<DateTime<Utc>>) {
        self.process_at = at;
    }
}

/// When a task becomes eligible for pulling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Schedule {
    At(DateTime<Utc>),
    In(Duration),
}

/// Defaults a producer applies to options left unset.
#[derive(Debug, Clone)]
pub struct EnqueueDefaults {
    pub max_retry: u32,
    pub timeout: Duration,
}

impl Default for EnqueueDefaults {
    fn default() -> Self {
        Self {
            max_retry: DEFAULT_MAX_RETRY,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Fluent per-task options for [`crate::app::Client::enqueue`].
///
/// ```ignore
/// let opts = TaskOptions::new()
///     .queue("critical")
///     .max_retry(3)
///     .delay(Duration::from_secs(60));
/// ```
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    max_retry: Option<u32>,
    timeout: Option<Duration>,
    deadline: Option<DateTime<Utc>>,
    queue: Option<String>,
    unique_ttl: Option<Duration>,
    schedule: Option<Schedule>,
    retention: Option<Duration>,
    task_id: Option<TaskId>,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry);
        self
    }

    /// A zero timeout means "not set".
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Blank names are ignored.
    pub fn queue(mut self, queue: impl AsRef<str>) -> Self {
        let queue = queue.as_ref().trim();
        if !queue.is_empty() {
            self.queue = Some(queue.to_string());
        }
        self
    }

    /// Reject identical (queue, type, payload) tasks for `ttl`.
    /// A zero ttl is ignored.
    pub fn unique(mut self, ttl: Duration) -> Self {
        self.unique_ttl = (!ttl.is_zero()).then_some(ttl);
        self
    }

    pub fn process_at(mut self, at: DateTime<Utc>) -> Self {
        self.schedule = Some(Schedule::At(at));
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.schedule = Some(Schedule::In(delay));
        self
    }

    /// Keep the finished task record around for `retention`.
    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn task_id(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Use `task_id` unless an id was set explicitly.
    pub(crate) fn or_task_id(mut self, task_id: TaskId) -> Self {
        self.task_id.get_or_insert(task_id);
        self
    }

    pub fn unique_ttl(&self) -> Option<Duration> {
        self.unique_ttl
    }

    /// Build the envelope, filling unset options from `defaults`.
    ///
    /// The default timeout only applies when neither a timeout nor a deadline
    /// was given.
    pub fn into_envelope(
        self,
        task_type: TaskType,
        payload: Vec<u8>,
        defaults: &EnqueueDefaults,
        now: DateTime<Utc>,
    ) -> TaskEnvelope {
        let timeout = match (self.timeout, self.deadline) {
            (Some(t), _) => Some(t),
            (None, Some(_)) => None,
            (None, None) => Some(defaults.timeout),
        };
        let process_at = match self.schedule {
            Some(Schedule::At(at)) if at > now => Some(at),
            Some(Schedule::In(delay)) if !delay.is_zero() => {
                chrono::Duration::from_std(delay).ok().map(|d| now + d)
            }
            _ => None,
        };

        TaskEnvelope::new(
            self.task_id.unwrap_or_else(TaskId::generate),
            task_type,
            payload,
        )
        .with_queue(self.queue.unwrap_or_else(|| DEFAULT_QUEUE.to_string()))
        .with_max_retries(self.max_retry.unwrap_or(defaults.max_retry))
        .with_timeout(timeout)
        .with_deadline(self.deadline)
        .with_process_at(process_at)
        .with_retention(self.retention.unwrap_or(Duration::ZERO))
        .with_enqueued_at(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn options_default_to_client_defaults() {
        let env = TaskOptions::new().into_envelope(
            TaskType::new("email:send"),
            b"{}".to_vec(),
            &EnqueueDefaults::default(),
            t0(),
        );

        assert_eq!(env.queue(), DEFAULT_QUEUE);
        assert_eq!(env.max_retries(), DEFAULT_MAX_RETRY);
        assert_eq!(env.timeout(), Some(DEFAULT_TIMEOUT));
        assert_eq!(env.retry_count(), 0);
        assert_eq!(env.process_at(), None);
        assert_eq!(env.enqueued_at(), t0());
    }

    #[test]
    fn deadline_without_timeout_disables_default_timeout() {
        let deadline = t0() + chrono::Duration::seconds(30);
        let env = TaskOptions::new().deadline(deadline).into_envelope(
            TaskType::new("x"),
            vec![],
            &EnqueueDefaults::default(),
            t0(),
        );

        assert_eq!(env.timeout(), None);
        assert_eq!(env.attempt_budget(t0()), Some(Duration::from_secs(30)));
    }

    #[rstest]
    #[case::blank_queue(TaskOptions::new().queue("   "), DEFAULT_QUEUE)]
    #[case::trimmed_queue(TaskOptions::new().queue(" critical "), "critical")]
    fn blank_queue_names_are_ignored(#[case] opts: TaskOptions, #[case] expected: &str) {
        let env = opts.into_envelope(TaskType::new("x"), vec![], &EnqueueDefaults::default(), t0());
        assert_eq!(env.queue(), expected);
    }

    #[test]
    fn zero_unique_ttl_is_ignored() {
        assert_eq!(TaskOptions::new().unique(Duration::ZERO).unique_ttl(), None);
        assert_eq!(
            TaskOptions::new().unique(Duration::from_secs(5)).unique_ttl(),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn delay_sets_process_at() {
        let env = TaskOptions::new().delay(Duration::from_secs(60)).into_envelope(
            TaskType::new("x"),
            vec![],
            &EnqueueDefaults::default(),
            t0(),
        );

        assert_eq!(env.process_at(), Some(t0() + chrono::Duration::seconds(60)));
        assert!(!env.is_due(t0()));
        assert!(env.is_due(t0() + chrono::Duration::seconds(60)));
    }

    #[test]
    fn process_at_in_the_past_is_immediate() {
        let env = TaskOptions::new()
            .process_at(t0() - chrono::Duration::seconds(1))
            .into_envelope(TaskType::new("x"), vec![], &EnqueueDefaults::default(), t0());
        assert_eq!(env.process_at(), None);
    }

    #[rstest]
    #[case(Some(10), Some(30), Some(10))]
    #[case(Some(60), Some(30), Some(30))]
    #[case(None, Some(30), Some(30))]
    #[case(Some(10), None, Some(10))]
    #[case(None, None, None)]
    fn attempt_budget_is_min_of_timeout_and_deadline(
        #[case] timeout_secs: Option<u64>,
        #[case] deadline_secs: Option<i64>,
        #[case] expected_secs: Option<u64>,
    ) {
        let env = TaskEnvelope::new(TaskId::generate(), "x", vec![])
            .with_timeout(timeout_secs.map(Duration::from_secs))
            .with_deadline(deadline_secs.map(|s| t0() + chrono::Duration::seconds(s)));

        assert_eq!(env.attempt_budget(t0()), expected_secs.map(Duration::from_secs));
    }

    #[test]
    fn exhausted_when_retry_count_reaches_max() {
        let mut env = TaskEnvelope::new(TaskId::generate(), "x", vec![]).with_max_retries(1);
        assert!(!env.is_exhausted());
        env.increment_retry();
        assert!(env.is_exhausted());
    }
}
