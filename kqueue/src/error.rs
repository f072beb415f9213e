use thiserror::Error;

/// A queue node could not be allocated. The queue is left unchanged.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
#[error("failed to allocate a queue node")]
pub struct AllocationFailure;

/// Why a remove returned without a value. The queue is left unchanged.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum RemoveError {
    /// The queue was still empty when the remover gave up. Retryable.
    #[error("no data available")]
    NoData,
    /// The wait was ended by [`Queue::interrupt`](crate::Queue::interrupt)
    /// before any data arrived.
    #[error("interrupted while waiting for data")]
    Interrupted,
}
