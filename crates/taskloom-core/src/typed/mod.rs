//! Typed - handler API
//!
//! # 二層構造
//! - **表層（Typed）**: `Task` trait, `Handler<T>` trait - 型安全
//! - **内部（Dyn）**: `DynHandler` trait - object-safe, type erasure
//!
//! registry は内部の `DynHandler` だけを扱います。

pub mod codec;
pub mod context;
pub mod handler;
pub mod registry;
pub mod task;

pub use self::codec::PayloadCodec;
pub use self::context::HandlerContext;
pub use self::handler::{
    DynHandler, FnHandler, Handler, JsonFnHandler, TypedHandler, handler_fn, json_handler_fn,
};
pub use self::registry::{HandlerRegistry, Lookup};
pub use self::task::Task;
