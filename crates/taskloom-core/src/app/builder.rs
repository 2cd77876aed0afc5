//! AppBuilder - worker pool の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 開発体験の改善（明確なエラーメッセージ）

use std::future::Future;
use std::sync::Arc;

use super::pool::WorkerPool;
use crate::config::WorkerConfig;
use crate::domain::{HandlerOutcome, TaskType, TaskloomError};
use crate::ports::EventSink;
use crate::typed::{DynHandler, Handler, HandlerContext, HandlerRegistry, Task};

/// AppBuilder は handler を登録して WorkerPool を組み立てる
///
/// # 使用例
/// ```ignore
/// let pool = AppBuilder::new()
///     .config(WorkerConfig::load(None)?)
///     .register::<WelcomeEmail, _>(WelcomeEmailHandler)?
///     .register_fn("notification:push", |ctx, payload| async move {
///         HandlerOutcome::success()
///     })?
///     .expect_tasks(&["email:welcome", "notification:push"])
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - expect_tasks() で期待される task_type を宣言
/// - build() 時に「期待集合 ⊆ 登録済み集合」と設定値をチェック
pub struct AppBuilder {
    registry: HandlerRegistry,
    config: WorkerConfig,
    sink: Option<Arc<dyn EventSink>>,
    expected_tasks: Option<Vec<String>>,
}

/// BuildError は構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error(transparent)]
    Taskloom(#[from] TaskloomError),
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            config: WorkerConfig::default(),
            sink: None,
            expected_tasks: None,
        }
    }

    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Typed handler for `T::TYPE`.
    pub fn register<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, BuildError> {
        self.registry.register_task::<T, H>(handler)?;
        Ok(self)
    }

    /// Raw handler for an arbitrary tag.
    pub fn register_handler(
        mut self,
        task_type: impl Into<TaskType>,
        handler: Arc<dyn DynHandler>,
    ) -> Result<Self, BuildError> {
        self.registry.register(task_type, handler)?;
        Ok(self)
    }

    pub fn register_fn<F, Fut>(
        mut self,
        task_type: impl Into<TaskType>,
        f: F,
    ) -> Result<Self, BuildError>
    where
        F: Fn(HandlerContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerOutcome> + Send + 'static,
    {
        self.registry.register_fn(task_type, f)?;
        Ok(self)
    }

    /// Tags that must be registered by `build()`.
    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<WorkerPool, BuildError> {
        if let Some(expected_tasks) = &self.expected_tasks {
            let registered_types = self.registry.registered_types();
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|x| !registered_types.contains(x))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }
        self.config.validate()?;

        let pool = WorkerPool::new(self.registry, self.config);
        Ok(match self.sink {
            Some(sink) => pool.with_event_sink(sink),
            None => pool,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}
