//! Task trait - 型付き Task の定義
//!
//! # 学習ポイント
//! - Associated Constants (`const TYPE`)
//! - Trait bounds の組み合わせ (Serialize + DeserializeOwned + Send + Sync + 'static)

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Task は task_type と payload の型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct WelcomeEmail {
///     user_id: u64,
/// }
///
/// impl Task for WelcomeEmail {
///     const TYPE: &'static str = "email:welcome";
/// }
/// ```
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// task_type の定義（例: `email:send`）
    const TYPE: &'static str;
}

#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct TestTask {
    pub value: i32,
}

#[cfg(test)]
impl Task for TestTask {
    const TYPE: &'static str = "test:create";
}

#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct AnotherTestTask {
    pub name: String,
}

#[cfg(test)]
impl Task for AnotherTestTask {
    const TYPE: &'static str = "test:another";
}
