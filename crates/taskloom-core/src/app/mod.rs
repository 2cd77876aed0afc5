//! App - アプリケーション層
//!
//! ports と lease manager を組み合わせて worker の実行ロジックを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: handler 登録と起動時検証
//! - **Client**: producer 側の enqueue API
//! - **Dispatcher**: handler 実行と ack / retry / fail の判定
//! - **WorkerLoop**: pull→lease→dispatch→finalize
//! - **ReaperLoop**: Lease 期限切れの回収
//! - **WorkerPool**: worker と reaper の起動、drain

pub mod builder;
pub mod client;
pub mod dispatcher;
pub mod pool;
pub mod reaper_loop;
mod worker_loop;

pub use self::builder::{AppBuilder, BuildError};
pub use self::client::{Client, EnqueueMiddleware, EnqueueRequest, TaskInfo};
pub use self::dispatcher::Dispatcher;
pub use self::pool::{DrainReport, PoolHandle, WorkerPool};
pub use self::reaper_loop::ReaperLoop;
