//! Domain model (IDs, envelopes, outcomes, state, errors).
//!
//! このモジュールはキューや worker の実装を前提にしません。
//! データの「形」だけを定義します。

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod outcome;
pub mod retry;
pub mod state;

pub use self::envelope::{
    DEFAULT_MAX_RETRY, DEFAULT_QUEUE, DEFAULT_TIMEOUT, EnqueueDefaults, TaskEnvelope, TaskOptions,
    TaskType,
};
pub use self::errors::{ErrorKind, QueueError, Result, TaskloomError};
pub use self::ids::{Id, IdMarker, ParseIdError, TaskId, WorkerId};
pub use self::outcome::{DispatchOutcome, HandlerOutcome};
pub use self::retry::RetryPolicy;
pub use self::state::TaskState;
