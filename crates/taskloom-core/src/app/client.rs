//! Client - producer 側の enqueue API
//!
//! # フロー
//! 1. task_type / payload の検証（空は `InvalidTask`）
//! 2. middleware を登録順に適用
//! 3. `TaskOptions` をデフォルト値で補完して envelope を作成
//! 4. `TaskQueue::enqueue()`（process_at が未来なら scheduled）

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::domain::{EnqueueDefaults, TaskId, TaskOptions, TaskType, TaskloomError};
use crate::ports::{Clock, IdGenerator, SystemClock, TaskQueue, UlidGenerator};
use crate::typed::{PayloadCodec, Task};

/// What a middleware sees and may rewrite before a task is built.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub options: TaskOptions,
}

/// Runs on every enqueue, in registration order. Returning `Err` rejects
/// the task.
pub trait EnqueueMiddleware: Send + Sync {
    fn apply(&self, request: EnqueueRequest) -> Result<EnqueueRequest, TaskloomError>;
}

impl<F> EnqueueMiddleware for F
where
    F: Fn(EnqueueRequest) -> Result<EnqueueRequest, TaskloomError> + Send + Sync,
{
    fn apply(&self, request: EnqueueRequest) -> Result<EnqueueRequest, TaskloomError> {
        self(request)
    }
}

/// Summary of an accepted task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInfo {
    pub id: TaskId,
    pub task_type: TaskType,
    pub queue: String,
    pub max_retries: u32,
    pub timeout: Option<Duration>,
    pub deadline: Option<DateTime<Utc>>,
    pub process_at: Option<DateTime<Utc>>,
}

impl TaskInfo {
    /// Waiting for `process_at` rather than ready now.
    pub fn is_scheduled(&self) -> bool {
        self.process_at.is_some()
    }
}

pub struct Client {
    queue: Arc<dyn TaskQueue>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    defaults: EnqueueDefaults,
    middleware: Vec<Arc<dyn EnqueueMiddleware>>,
}

impl Client {
    pub fn new(queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            queue,
            ids: Arc::new(UlidGenerator::new(SystemClock)),
            clock: Arc::new(SystemClock),
            defaults: EnqueueDefaults::default(),
            middleware: Vec::new(),
        }
    }

    /// Also drives the timestamp part of generated ids.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        self.clock = clock;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.defaults.timeout = timeout;
        self
    }

    pub fn with_default_max_retry(mut self, max_retry: u32) -> Self {
        self.defaults.max_retry = max_retry;
        self
    }

    pub fn with_middleware(mut self, middleware: impl EnqueueMiddleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub async fn enqueue<P: Serialize + ?Sized>(
        &self,
        task_type: impl Into<TaskType>,
        payload: &P,
        options: TaskOptions,
    ) -> Result<TaskInfo, TaskloomError> {
        let task_type = task_type.into();
        let result = self.try_enqueue(task_type.clone(), payload, options).await;
        if let Err(e) = &result {
            error!(%task_type, error = %e, "enqueue failed");
        }
        result
    }

    /// Enqueue to run after `delay`. A zero delay is rejected.
    pub async fn enqueue_in<P: Serialize + ?Sized>(
        &self,
        task_type: impl Into<TaskType>,
        payload: &P,
        delay: Duration,
        options: TaskOptions,
    ) -> Result<TaskInfo, TaskloomError> {
        if delay.is_zero() {
            return Err(TaskloomError::InvalidTask("delay must be positive".into()));
        }
        self.enqueue(task_type, payload, options.delay(delay)).await
    }

    pub async fn enqueue_task<T: Task>(
        &self,
        task: &T,
        options: TaskOptions,
    ) -> Result<TaskInfo, TaskloomError> {
        self.enqueue(T::TYPE, task, options).await
    }

    async fn try_enqueue<P: Serialize + ?Sized>(
        &self,
        task_type: TaskType,
        payload: &P,
        options: TaskOptions,
    ) -> Result<TaskInfo, TaskloomError> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| TaskloomError::InvalidTask(format!("payload is not serializable: {e}")))?;
        let mut request = EnqueueRequest {
            task_type,
            payload,
            options,
        };
        validate(&request)?;

        for middleware in &self.middleware {
            request = middleware.apply(request)?;
        }
        validate(&request)?;

        let EnqueueRequest {
            task_type,
            payload,
            options,
        } = request;
        let unique_ttl = options.unique_ttl();
        let payload = PayloadCodec::encode(&payload)?;
        let envelope = options
            .or_task_id(self.ids.generate_task_id())
            .into_envelope(task_type, payload, &self.defaults, self.clock.now());

        let info = TaskInfo {
            id: envelope.id(),
            task_type: envelope.task_type().clone(),
            queue: envelope.queue().to_string(),
            max_retries: envelope.max_retries(),
            timeout: envelope.timeout(),
            deadline: envelope.deadline(),
            process_at: envelope.process_at(),
        };

        self.queue.enqueue(envelope, unique_ttl).await?;
        info!(
            task_id = %info.id,
            task_type = %info.task_type,
            queue = %info.queue,
            scheduled = info.is_scheduled(),
            "task enqueued"
        );
        Ok(info)
    }
}

fn validate(request: &EnqueueRequest) -> Result<(), TaskloomError> {
    if request.task_type.is_empty() {
        return Err(TaskloomError::InvalidTask("task type cannot be empty".into()));
    }
    let empty = match &request.payload {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        serde_json::Value::Array(items) => items.is_empty(),
        serde_json::Value::String(s) => s.is_empty(),
        _ => false,
    };
    if empty {
        return Err(TaskloomError::InvalidTask("task payload cannot be empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DEFAULT_MAX_RETRY, DEFAULT_TIMEOUT, QueueError};
    use crate::impls::InMemoryQueue;
    use crate::ports::ManualClock;
    use chrono::TimeZone;
    use rstest::rstest;
    use serde_json::json;

    fn setup() -> (Client, Arc<InMemoryQueue>, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        let queue = Arc::new(InMemoryQueue::with_clock(Arc::new(clock.clone())));
        let client = Client::new(queue.clone()).with_clock(Arc::new(clock.clone()));
        (client, queue, clock)
    }

    #[tokio::test]
    async fn enqueue_applies_defaults() {
        let (client, queue, _) = setup();

        let info = client
            .enqueue("email:send", &json!({"to": "user@example.com"}), TaskOptions::new())
            .await
            .unwrap();

        assert_eq!(info.queue, "default");
        assert_eq!(info.max_retries, DEFAULT_MAX_RETRY);
        assert_eq!(info.timeout, Some(DEFAULT_TIMEOUT));
        assert!(!info.is_scheduled());
        let stored = queue.get(info.id).await.unwrap();
        let payload: serde_json::Value = serde_json::from_slice(stored.payload()).unwrap();
        assert_eq!(payload, json!({"to": "user@example.com"}));
    }

    #[rstest]
    #[case::blank_type("  ", json!({"k": 1}))]
    #[case::null_payload("email:send", json!(null))]
    #[case::empty_object("email:send", json!({}))]
    #[case::empty_array("email:send", json!([]))]
    #[tokio::test]
    async fn empty_type_or_payload_is_rejected(
        #[case] task_type: &str,
        #[case] payload: serde_json::Value,
    ) {
        let (client, queue, _) = setup();

        let err = client
            .enqueue(task_type, &payload, TaskOptions::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TaskloomError::InvalidTask(_)));
        assert!(queue.is_idle().await);
    }

    #[tokio::test]
    async fn enqueue_in_schedules_and_rejects_zero_delay() {
        let (client, queue, clock) = setup();
        let payload = json!({"user_id": 42});

        let info = client
            .enqueue_in("email:reminder", &payload, Duration::from_secs(60), TaskOptions::new())
            .await
            .unwrap();
        assert_eq!(
            info.process_at,
            Some(clock.now() + chrono::Duration::seconds(60))
        );
        assert_eq!(queue.counts().await.scheduled, 1);

        let err = client
            .enqueue_in("email:reminder", &payload, Duration::ZERO, TaskOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskloomError::InvalidTask(_)));
    }

    #[tokio::test]
    async fn middleware_can_rewrite_and_reject() {
        let (client, _, _) = setup();
        let client = client
            .with_middleware(|mut req: EnqueueRequest| -> Result<_, TaskloomError> {
                req.options = req.options.queue("critical");
                Ok(req)
            })
            .with_middleware(|req: EnqueueRequest| -> Result<_, TaskloomError> {
                if req.task_type.as_str().starts_with("blocked:") {
                    Err(TaskloomError::InvalidTask("blocked task type".into()))
                } else {
                    Ok(req)
                }
            });

        let info = client
            .enqueue("email:send", &json!({"to": "a@b.c"}), TaskOptions::new())
            .await
            .unwrap();
        assert_eq!(info.queue, "critical");

        let err = client
            .enqueue("blocked:spam", &json!({"to": "a@b.c"}), TaskOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskloomError::InvalidTask(reason) if reason.contains("blocked")));
    }

    #[tokio::test]
    async fn unique_option_rejects_duplicates() {
        let (client, _, _) = setup();
        let opts = TaskOptions::new().unique(Duration::from_secs(300));
        let payload = json!({"user_id": 7});

        client
            .enqueue("email:welcome", &payload, opts.clone())
            .await
            .unwrap();
        let err = client
            .enqueue("email:welcome", &payload, opts)
            .await
            .unwrap_err();

        assert!(matches!(err, TaskloomError::Queue(QueueError::DuplicateTask)));
    }

    #[tokio::test]
    async fn explicit_task_id_conflicts_are_reported() {
        let (client, _, _) = setup();
        let id = TaskId::generate();
        let payload = json!({"k": "v"});

        let info = client
            .enqueue("analytics:track", &payload, TaskOptions::new().task_id(id))
            .await
            .unwrap();
        assert_eq!(info.id, id);

        let err = client
            .enqueue("analytics:track", &payload, TaskOptions::new().task_id(id))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskloomError::Queue(QueueError::TaskIdConflict(conflict)) if conflict == id));
    }

    #[tokio::test]
    async fn typed_tasks_use_their_type_tag() {
        use crate::typed::task::TestTask;
        let (client, queue, _) = setup();

        let info = client
            .enqueue_task(&TestTask { value: 3 }, TaskOptions::new().max_retry(2))
            .await
            .unwrap();

        assert_eq!(info.task_type.as_str(), TestTask::TYPE);
        assert_eq!(info.max_retries, 2);
        assert_eq!(queue.get(info.id).await.unwrap().payload(), br#"{"value":3}"#);
    }
}
