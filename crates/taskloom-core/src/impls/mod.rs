//! Impls - ports の実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryQueue**: TaskQueue のインメモリ実装
//!
//! 本番用のキュー実装（Redis など）は別クレートに置く想定です。

pub mod memory_queue;

pub use self::memory_queue::{ArchivedTask, InMemoryQueue};
