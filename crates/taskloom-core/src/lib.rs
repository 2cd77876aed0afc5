//! taskloom-core
//!
//! In-process core of a task-queue worker.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, envelope, outcome, retry, state, errors）
//! - **ports**: 抽象化レイヤー（TaskQueue, Clock, IdGenerator, EventSink）
//! - **typed**: 型付き handler API（Task trait, Handler trait, HandlerRegistry, PayloadCodec）
//! - **lease**: LeaseManager（in-flight タスクの所有権）
//! - **app**: アプリケーションロジック（builder, client, dispatcher, pool, reaper）
//! - **impls**: 実装（InMemoryQueue）
//! - **config**: WorkerConfig
//! - **observability**: tracing 初期化と状態ビュー

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod lease;
pub mod observability;
pub mod ports;
pub mod typed;
