//! State - タスクの状態
//!
//! # 状態遷移
//! - Pending -> Leased -> Acked
//! - Pending -> Leased -> Pending（retry / 再配送 / lease 期限切れ）
//! - Pending -> Leased -> Failed（リトライ上限 or 恒久エラー）

use serde::{Deserialize, Serialize};

/// TaskState は lease manager が追跡するタスクの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// 取得待ち
    Pending,
    /// worker が lease を保持して実行中
    Leased,
    /// 成功
    Acked,
    /// 失敗（archive 済み）
    Failed,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Acked | TaskState::Failed)
    }
}
