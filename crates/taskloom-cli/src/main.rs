mod handlers;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use taskloom_core::app::{AppBuilder, Client};
use taskloom_core::config::WorkerConfig;
use taskloom_core::domain::TaskOptions;
use taskloom_core::impls::InMemoryQueue;
use taskloom_core::observability::init_tracing;
use taskloom_core::typed::Task;
use tracing::{info, warn};

use crate::handlers::{ReminderEmail, TASK_TYPES, WelcomeEmail};

/// Usage: `taskloom-cli [config-file]`
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args().nth(1);
    let config = WorkerConfig::load(config_path.as_deref())?;
    init_tracing(config.json_logs);

    // (A) Queue と handler を用意
    let queue = Arc::new(InMemoryQueue::new().with_priorities(config.queues.clone()));
    let pool = handlers::register(AppBuilder::new().config(config))?
        .expect_tasks(&TASK_TYPES)
        .build()?;

    // (B) サンプルタスクを投入
    let client = Client::new(queue.clone());
    enqueue_samples(&client).await?;

    // (C) Ctrl-C か、キューが空になるまで処理
    let idle = Arc::clone(&queue);
    let report = pool
        .run(queue.clone(), async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("interrupt received"),
                _ = wait_until_idle(&idle) => info!("queue drained"),
            }
        })
        .await;

    let counts = queue.counts().await;
    for archived in queue.archived().await {
        warn!(
            task_id = %archived.envelope.id(),
            task_type = %archived.envelope.task_type(),
            reason = %archived.reason,
            "archived task"
        );
    }
    info!(?report, ?counts, "worker exited");
    Ok(())
}

async fn enqueue_samples(client: &Client) -> Result<(), Box<dyn std::error::Error>> {
    client
        .enqueue(
            "email:send",
            &json!({
                "to": "user@example.com",
                "subject": "Welcome!",
                "body": "Thank you for registering."
            }),
            TaskOptions::new().max_retry(3),
        )
        .await?;
    client
        .enqueue(
            "notification:push",
            &json!({"user_id": 123, "message": "Your order has been shipped!"}),
            TaskOptions::new().queue("critical"),
        )
        .await?;
    client
        .enqueue(
            "reminder:send",
            &json!({"user_id": 123, "type": "payment", "time": "2024-01-01 09:00"}),
            TaskOptions::new(),
        )
        .await?;
    client
        .enqueue(
            "analytics:track",
            &json!({"event": "page_view", "user_id": 123, "page": "/checkout"}),
            TaskOptions::new().unique(Duration::from_secs(60)),
        )
        .await?;
    client
        .enqueue_task(&WelcomeEmail { user_id: 42 }, TaskOptions::new())
        .await?;
    client
        .enqueue_in(
            ReminderEmail::TYPE,
            &ReminderEmail { user_id: 42 },
            Duration::from_secs(2),
            TaskOptions::new(),
        )
        .await?;

    // 未登録の type は warning を出して ack される
    client
        .enqueue("report:generate", &json!({"report_id": 9}), TaskOptions::new())
        .await?;
    // 宛先なしは PermanentError で archive される
    client
        .enqueue("email:send", &json!({"subject": "no recipient"}), TaskOptions::new())
        .await?;
    Ok(())
}

async fn wait_until_idle(queue: &InMemoryQueue) {
    loop {
        if queue.is_idle().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
