//! HandlerRegistry - Handler の登録と管理
//!
//! # 学習ポイント
//! - HashMap での型消去された trait object の管理
//! - Generic methods での登録と型安全性
//! - 未登録を `Lookup::NotFound` という明示的な variant で表す
//!
//! 起動時に組み立てて `Arc` で dispatcher に渡します。実行中は不変なので
//! ロックは不要です。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use super::context::HandlerContext;
use super::handler::{DynHandler, Handler, TypedHandler, handler_fn};
use super::task::Task;
use crate::domain::{HandlerOutcome, TaskType, TaskloomError};

/// Result of a registry lookup.
#[derive(Clone)]
pub enum Lookup {
    Found(Arc<dyn DynHandler>),
    /// No handler for this tag. The dispatcher acks it with a warning.
    NotFound(TaskType),
}

impl Lookup {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }
}

/// HandlerRegistry は task_type → handler の対応表
///
/// # 使用例
/// ```ignore
/// let mut registry = HandlerRegistry::new();
/// registry.register_task::<WelcomeEmail, _>(WelcomeEmailHandler)?;
/// registry.register_fn("notification:push", |ctx, payload| async move {
///     HandlerOutcome::success()
/// })?;
/// ```
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn DynHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Bind `task_type` to a raw handler.
    pub fn register(
        &mut self,
        task_type: impl Into<TaskType>,
        handler: Arc<dyn DynHandler>,
    ) -> Result<(), TaskloomError> {
        let task_type = task_type.into();
        if task_type.is_empty() {
            return Err(TaskloomError::InvalidTask(
                "task type cannot be empty".to_string(),
            ));
        }
        if self.handlers.contains_key(&task_type) {
            return Err(TaskloomError::DuplicateRegistration(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    /// Bind `T::TYPE` to a typed handler; payloads are decoded into `T`.
    pub fn register_task<T: Task, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), TaskloomError> {
        self.register(T::TYPE, Arc::new(TypedHandler::new(handler)))
    }

    pub fn register_fn<F, Fut>(
        &mut self,
        task_type: impl Into<TaskType>,
        f: F,
    ) -> Result<(), TaskloomError>
    where
        F: Fn(HandlerContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerOutcome> + Send + 'static,
    {
        self.register(task_type, Arc::new(handler_fn(f)))
    }

    pub fn lookup(&self, task_type: &TaskType) -> Lookup {
        match self.handlers.get(task_type) {
            Some(handler) => Lookup::Found(Arc::clone(handler)),
            None => Lookup::NotFound(task_type.clone()),
        }
    }

    /// Registered tags, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .keys()
            .map(|t| t.as_str().to_string())
            .collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed::handler::{AnotherTestTaskHandler, TestTaskHandler};
    use crate::typed::task::{AnotherTestTask, TestTask};

    #[test]
    fn test_register_and_lookup() {
        let mut registry = HandlerRegistry::new();
        registry.register_task::<TestTask, _>(TestTaskHandler).unwrap();

        assert!(registry.lookup(&TaskType::new(TestTask::TYPE)).is_found());
    }

    #[test]
    fn test_double_registration() {
        let mut registry = HandlerRegistry::new();
        registry.register_task::<TestTask, _>(TestTaskHandler).unwrap();
        let result = registry.register_task::<TestTask, _>(TestTaskHandler);

        assert!(matches!(
            result,
            Err(TaskloomError::DuplicateRegistration(t)) if t.as_str() == TestTask::TYPE
        ));
    }

    #[test]
    fn test_unknown_tag_is_explicit_not_found() {
        let registry = HandlerRegistry::new();
        let lookup = registry.lookup(&TaskType::new("email:unknown"));

        assert!(matches!(lookup, Lookup::NotFound(t) if t.as_str() == "email:unknown"));
    }

    #[test]
    fn test_empty_tag_is_rejected() {
        let mut registry = HandlerRegistry::new();
        let result = registry.register_fn(" ", |_ctx, _payload| async {
            HandlerOutcome::success()
        });
        assert!(matches!(result, Err(TaskloomError::InvalidTask(_))));
    }

    #[test]
    fn test_registered_types_are_sorted() {
        let mut registry = HandlerRegistry::new();
        registry.register_task::<TestTask, _>(TestTaskHandler).unwrap();
        registry
            .register_task::<AnotherTestTask, _>(AnotherTestTaskHandler)
            .unwrap();
        registry
            .register_fn("email:send", |_ctx, _payload| async {
                HandlerOutcome::success()
            })
            .unwrap();

        assert_eq!(
            registry.registered_types(),
            vec![
                "email:send".to_string(),
                AnotherTestTask::TYPE.to_string(),
                TestTask::TYPE.to_string(),
            ]
        );
        assert_eq!(registry.len(), 3);
    }
}
