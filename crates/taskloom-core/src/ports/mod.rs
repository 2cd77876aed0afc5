//! Ports - 抽象化レイヤー
//!
//! 外部システム（キュー、時刻、ログ出力先）へのインターフェースを定義し、
//! 実装の詳細を隠蔽します。

pub mod clock;
pub mod event_sink;
pub mod id_generator;
pub mod task_queue;

pub use self::clock::{Clock, MAX_WAIT, ManualClock, SystemClock, instant_after, saturating_after};
pub use self::event_sink::{DispatchRecord, EventLevel, EventSink, MemoryEventSink, TracingEventSink};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_queue::TaskQueue;
