//! Demo handlers for the sample task types.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use taskloom_core::app::{AppBuilder, BuildError};
use taskloom_core::domain::HandlerOutcome;
use taskloom_core::typed::{Handler, HandlerContext, Task, json_handler_fn};
use tracing::info;

pub const TASK_TYPES: [&str; 6] = [
    "email:send",
    "notification:push",
    "reminder:send",
    "analytics:track",
    "email:welcome",
    "email:reminder",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WelcomeEmail {
    #[serde(alias = "UserID")]
    pub user_id: i64,
}

impl Task for WelcomeEmail {
    const TYPE: &'static str = "email:welcome";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderEmail {
    #[serde(alias = "UserID")]
    pub user_id: i64,
}

impl Task for ReminderEmail {
    const TYPE: &'static str = "email:reminder";
}

struct WelcomeEmailHandler;

#[async_trait]
impl Handler<WelcomeEmail> for WelcomeEmailHandler {
    async fn handle(&self, ctx: HandlerContext, task: WelcomeEmail) -> HandlerOutcome {
        info!(task_id = %ctx.task_id(), user_id = task.user_id, "send welcome email");
        HandlerOutcome::success()
    }
}

struct ReminderEmailHandler;

#[async_trait]
impl Handler<ReminderEmail> for ReminderEmailHandler {
    async fn handle(&self, ctx: HandlerContext, task: ReminderEmail) -> HandlerOutcome {
        info!(task_id = %ctx.task_id(), user_id = task.user_id, "send reminder email");
        HandlerOutcome::success()
    }
}

pub fn register(builder: AppBuilder) -> Result<AppBuilder, BuildError> {
    builder
        .register::<WelcomeEmail, _>(WelcomeEmailHandler)?
        .register::<ReminderEmail, _>(ReminderEmailHandler)?
        .register_handler("email:send", Arc::new(json_handler_fn(send_email)))?
        .register_handler("notification:push", Arc::new(json_handler_fn(push_notification)))?
        .register_handler("reminder:send", Arc::new(json_handler_fn(send_reminder)))?
        .register_handler("analytics:track", Arc::new(json_handler_fn(track_event)))
}

async fn send_email(ctx: HandlerContext, p: Map<String, Value>) -> HandlerOutcome {
    if !p.contains_key("to") {
        return HandlerOutcome::permanent("email:send needs a recipient");
    }
    info!(
        task_id = %ctx.task_id(),
        to = %field(&p, "to"),
        subject = %field(&p, "subject"),
        "send email"
    );
    HandlerOutcome::success()
}

async fn push_notification(ctx: HandlerContext, p: Map<String, Value>) -> HandlerOutcome {
    info!(
        task_id = %ctx.task_id(),
        user_id = %field(&p, "user_id"),
        message = %field(&p, "message"),
        "send notification"
    );
    HandlerOutcome::success()
}

async fn send_reminder(ctx: HandlerContext, p: Map<String, Value>) -> HandlerOutcome {
    info!(
        task_id = %ctx.task_id(),
        user_id = %field(&p, "user_id"),
        kind = %field(&p, "type"),
        at = %field(&p, "time"),
        "send reminder"
    );
    HandlerOutcome::success()
}

async fn track_event(ctx: HandlerContext, p: Map<String, Value>) -> HandlerOutcome {
    info!(
        task_id = %ctx.task_id(),
        event = %field(&p, "event"),
        user_id = %field(&p, "user_id"),
        page = %field(&p, "page"),
        "track analytics event"
    );
    HandlerOutcome::success()
}

fn field(p: &Map<String, Value>, key: &str) -> String {
    match p.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "-".to_string(),
    }
}
