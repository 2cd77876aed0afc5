//! Handler trait - Task を実行する Handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (Handler<T>)
//! - Object-safe trait (DynHandler)
//! - Type erasure パターン (TypedHandler<T, H> → DynHandler)
//! - クロージャを handler にするアダプタ (handler_fn / json_handler_fn)

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::codec::PayloadCodec;
use super::context::HandlerContext;
use super::task::Task;
use crate::domain::{HandlerOutcome, TaskloomError};

/// Handler は Task を実行して HandlerOutcome を返す
///
/// # 使用例
/// ```ignore
/// struct WelcomeEmailHandler;
///
/// #[async_trait]
/// impl Handler<WelcomeEmail> for WelcomeEmailHandler {
///     async fn handle(&self, ctx: HandlerContext, task: WelcomeEmail) -> HandlerOutcome {
///         println!("welcome user {}", task.user_id);
///         HandlerOutcome::success()
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, ctx: HandlerContext, task: T) -> HandlerOutcome;
}

/// DynHandler は object-safe な Handler の抽象化
///
/// `HashMap<TaskType, Arc<dyn DynHandler>>` に格納するための層です。
/// `Err` を返すのは payload の decode に失敗したときだけ
/// (`TaskloomError::PayloadError`)。handler 自身の失敗は `HandlerOutcome` で表す。
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_raw(
        &self,
        ctx: HandlerContext,
        payload: Vec<u8>,
    ) -> Result<HandlerOutcome, TaskloomError>;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_raw(
        &self,
        ctx: HandlerContext,
        payload: Vec<u8>,
    ) -> Result<HandlerOutcome, TaskloomError> {
        let task: T = PayloadCodec::decode(ctx.task_type(), &payload)?;
        Ok(self.handler.handle(ctx, task).await)
    }
}

/// Raw byte handler built from a closure.
pub struct FnHandler<F> {
    f: F,
}

/// Wrap `Fn(HandlerContext, Vec<u8>) -> impl Future<Output = HandlerOutcome>`.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(HandlerContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> DynHandler for FnHandler<F>
where
    F: Fn(HandlerContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    async fn handle_raw(
        &self,
        ctx: HandlerContext,
        payload: Vec<u8>,
    ) -> Result<HandlerOutcome, TaskloomError> {
        Ok((self.f)(ctx, payload).await)
    }
}

/// Closure handler whose payload is decoded from JSON into `P` first.
pub struct JsonFnHandler<P, F> {
    f: F,
    _marker: PhantomData<fn() -> P>,
}

pub fn json_handler_fn<P, F, Fut>(f: F) -> JsonFnHandler<P, F>
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(HandlerContext, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    JsonFnHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<P, F, Fut> DynHandler for JsonFnHandler<P, F>
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(HandlerContext, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    async fn handle_raw(
        &self,
        ctx: HandlerContext,
        payload: Vec<u8>,
    ) -> Result<HandlerOutcome, TaskloomError> {
        let decoded: P = PayloadCodec::decode(ctx.task_type(), &payload)?;
        Ok((self.f)(ctx, decoded).await)
    }
}

#[cfg(test)]
pub(crate) struct TestTaskHandler;

#[cfg(test)]
#[async_trait]
impl Handler<super::task::TestTask> for TestTaskHandler {
    async fn handle(&self, _ctx: HandlerContext, _task: super::task::TestTask) -> HandlerOutcome {
        HandlerOutcome::success()
    }
}

#[cfg(test)]
pub(crate) struct AnotherTestTaskHandler;

#[cfg(test)]
#[async_trait]
impl Handler<super::task::AnotherTestTask> for AnotherTestTaskHandler {
    async fn handle(
        &self,
        _ctx: HandlerContext,
        _task: super::task::AnotherTestTask,
    ) -> HandlerOutcome {
        HandlerOutcome::success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskEnvelope, TaskId};
    use crate::typed::task::TestTask;

    fn ctx(task_type: &str) -> HandlerContext {
        HandlerContext::for_envelope(&TaskEnvelope::new(TaskId::generate(), task_type, vec![]))
    }

    #[tokio::test]
    async fn typed_handler_decodes_payload() {
        let typed_handler = TypedHandler::<TestTask, _>::new(TestTaskHandler);

        let outcome = typed_handler
            .handle_raw(ctx(TestTask::TYPE), br#"{"value":100}"#.to_vec())
            .await
            .unwrap();
        assert_eq!(outcome, HandlerOutcome::Success);
    }

    #[tokio::test]
    async fn typed_handler_reports_payload_error() {
        let typed_handler = TypedHandler::<TestTask, _>::new(TestTaskHandler);

        let err = typed_handler
            .handle_raw(ctx(TestTask::TYPE), br#"{"value":"nope"}"#.to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskloomError::PayloadError { .. }));
    }

    #[tokio::test]
    async fn closure_handlers() {
        let raw = handler_fn(|_ctx, payload: Vec<u8>| async move {
            if payload.is_empty() {
                HandlerOutcome::permanent("empty")
            } else {
                HandlerOutcome::success()
            }
        });
        assert_eq!(
            raw.handle_raw(ctx("raw"), vec![]).await.unwrap(),
            HandlerOutcome::permanent("empty")
        );

        let json = json_handler_fn(|_ctx, p: serde_json::Value| async move {
            match p.get("to") {
                Some(_) => HandlerOutcome::success(),
                None => HandlerOutcome::retry("missing recipient"),
            }
        });
        assert_eq!(
            json.handle_raw(ctx("json"), br#"{"to":"a@b.c"}"#.to_vec())
                .await
                .unwrap(),
            HandlerOutcome::Success
        );
        assert!(json.handle_raw(ctx("json"), b"{".to_vec()).await.is_err());
    }
}
