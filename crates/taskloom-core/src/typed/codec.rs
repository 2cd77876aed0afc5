//! PayloadCodec - payload bytes と型の相互変換
//!
//! JSON（serde_json）固定です。decode 失敗は `PayloadError` になり、
//! dispatcher はこれを恒久エラーとして扱います。

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{TaskType, TaskloomError};

pub struct PayloadCodec;

impl PayloadCodec {
    pub fn decode<T: DeserializeOwned>(
        task_type: &TaskType,
        payload: &[u8],
    ) -> Result<T, TaskloomError> {
        serde_json::from_slice(payload).map_err(|e| TaskloomError::PayloadError {
            task_type: task_type.clone(),
            reason: e.to_string(),
        })
    }

    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, TaskloomError> {
        serde_json::to_vec(value)
            .map_err(|e| TaskloomError::InvalidTask(format!("payload encode: {e}")))
    }
}
