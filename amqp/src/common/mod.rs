pub mod async_operation_queue;
pub mod context;
pub mod registry;

pub use async_operation_queue::{AsyncOperationQueue, DEFAULT_POLL_INTERVAL, Pollable, QueueMode};
pub use context::Context;
pub use registry::{Handle, Registry};
pub(crate) use registry::{HandleRef, Liveness};
