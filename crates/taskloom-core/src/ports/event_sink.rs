//! EventSink port - dispatch 判定の記録
//!
//! Dispatcher は 1 回の dispatch につき 1 件だけ記録します。
//!
//! # 実装
//! - TracingEventSink: `tracing` に出力（デフォルト）
//! - MemoryEventSink: テスト用に保持

use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::domain::{TaskId, TaskType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

/// One structured entry per dispatch decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchRecord {
    pub level: EventLevel,
    pub message: String,
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub retry_count: u32,
    pub decision: &'static str,
}

pub trait EventSink: Send + Sync {
    fn record(&self, entry: DispatchRecord);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, entry: DispatchRecord) {
        let DispatchRecord {
            level,
            message,
            task_id,
            task_type,
            retry_count,
            decision,
        } = entry;
        match level {
            EventLevel::Info => tracing::info!(
                %task_id, %task_type, retry_count, decision, "{message}"
            ),
            EventLevel::Warn => tracing::warn!(
                %task_id, %task_type, retry_count, decision, "{message}"
            ),
            EventLevel::Error => tracing::error!(
                %task_id, %task_type, retry_count, decision, "{message}"
            ),
        }
    }
}

/// Keeps every entry in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventSink {
    entries: Arc<Mutex<Vec<DispatchRecord>>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<DispatchRecord> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn count(&self, level: EventLevel) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.level == level)
            .count()
    }
}

impl EventSink for MemoryEventSink {
    fn record(&self, entry: DispatchRecord) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
    }
}
