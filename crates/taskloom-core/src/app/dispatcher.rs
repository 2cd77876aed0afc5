//! Dispatcher - handler の実行と結果の判定
//!
//! # フロー
//! 1. HandlerRegistry::lookup（未登録なら warning を 1 件出して Ack）
//! 2. deadline 超過なら handler を呼ばずに PermanentFail
//! 3. handler を別タスクで実行（timeout / panic を捕捉）
//! 4. HandlerOutcome と retry 残数から DispatchOutcome を決定
//!
//! どの経路でも EventSink への記録はちょうど 1 件です。

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::domain::{DispatchOutcome, HandlerOutcome, RetryPolicy, TaskEnvelope, TaskloomError};
use crate::ports::{Clock, DispatchRecord, EventLevel, EventSink, SystemClock, TracingEventSink};
use crate::typed::{DynHandler, HandlerContext, HandlerRegistry, Lookup};

pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    retry_policy: RetryPolicy,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

/// A decision plus the log entry that explains it.
struct Verdict {
    outcome: DispatchOutcome,
    level: EventLevel,
    message: String,
}

impl Verdict {
    fn new(outcome: DispatchOutcome, level: EventLevel, message: impl Into<String>) -> Self {
        Self {
            outcome,
            level,
            message: message.into(),
        }
    }
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self {
            registry,
            retry_policy: RetryPolicy::default(),
            sink: Arc::new(TracingEventSink),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Run one attempt of `envelope` and decide what happens next.
    pub async fn dispatch(&self, envelope: &TaskEnvelope, ctx: HandlerContext) -> DispatchOutcome {
        let verdict = self.decide(envelope, ctx).await;
        self.sink.record(DispatchRecord {
            level: verdict.level,
            message: verdict.message,
            task_id: envelope.id(),
            task_type: envelope.task_type().clone(),
            retry_count: envelope.retry_count(),
            decision: verdict.outcome.label(),
        });
        verdict.outcome
    }

    async fn decide(&self, envelope: &TaskEnvelope, ctx: HandlerContext) -> Verdict {
        let handler = match self.registry.lookup(envelope.task_type()) {
            Lookup::Found(handler) => handler,
            Lookup::NotFound(task_type) => {
                return Verdict::new(
                    DispatchOutcome::Ack,
                    EventLevel::Warn,
                    format!("no handler registered for task_type={task_type}, acking"),
                );
            }
        };

        let now = self.clock.now();
        if envelope.is_past_deadline(now) {
            return give_up("deadline exceeded before dispatch");
        }

        match invoke(handler, envelope, ctx, envelope.attempt_budget(now)).await {
            Ok(HandlerOutcome::Success) => {
                Verdict::new(DispatchOutcome::Ack, EventLevel::Info, "task processed")
            }
            Ok(HandlerOutcome::PermanentError(reason)) => give_up(reason),
            Ok(HandlerOutcome::RetryableError(reason)) => self.retry_or_give_up(envelope, reason),
            Err(e) if e.is_retryable() => self.retry_or_give_up(envelope, e.to_string()),
            Err(e) => give_up(e.to_string()),
        }
    }

    fn retry_or_give_up(&self, envelope: &TaskEnvelope, reason: String) -> Verdict {
        if envelope.is_exhausted() {
            return give_up(format!(
                "retries exhausted ({}/{}): {reason}",
                envelope.retry_count(),
                envelope.max_retries()
            ));
        }
        let delay = self.retry_policy.next_delay(envelope.retry_count());
        Verdict::new(
            DispatchOutcome::RetryWithBackoff {
                delay,
                reason: reason.clone(),
            },
            EventLevel::Warn,
            format!("task failed, retrying in {delay:?}: {reason}"),
        )
    }
}

fn give_up(reason: impl Into<String>) -> Verdict {
    let reason = reason.into();
    Verdict::new(
        DispatchOutcome::PermanentFail {
            reason: reason.clone(),
        },
        EventLevel::Error,
        format!("task failed permanently: {reason}"),
    )
}

/// Aborts the handler task if the dispatch future is dropped mid-flight.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run the handler on its own task so a panic or overrun stays contained.
async fn invoke(
    handler: Arc<dyn DynHandler>,
    envelope: &TaskEnvelope,
    ctx: HandlerContext,
    budget: Option<Duration>,
) -> Result<HandlerOutcome, TaskloomError> {
    let payload = envelope.payload().to_vec();
    let mut task = AbortOnDrop(tokio::spawn(async move {
        handler.handle_raw(ctx, payload).await
    }));

    let joined = match budget {
        Some(budget) => match tokio::time::timeout(budget, &mut task.0).await {
            Ok(joined) => joined,
            Err(_) => {
                return Err(TaskloomError::HandlerError(format!(
                    "handler timed out after {budget:?}"
                )));
            }
        },
        None => (&mut task.0).await,
    };

    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(TaskloomError::HandlerError("handler panicked".to_string())),
        Err(_) => Err(TaskloomError::HandlerError("handler was cancelled".to_string())),
    }
}
