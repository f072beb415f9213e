//! A blocking FIFO queue of integers shared between threads.
//!
//! [`Queue`] is a linked chain guarded by a mutex, paired with a condition
//! variable on which removers sleep while the queue is empty. [`global`]
//! hands out one process-wide instance, created on first use.

mod error;
mod queue;
mod singleton;

pub use self::error::{AllocationFailure, RemoveError};
pub use self::queue::Queue;
pub use self::singleton::{LazyQueue, global};
