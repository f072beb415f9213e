use std::sync::OnceLock;

use allocator_api2::alloc::{Allocator, Global};

use crate::queue::Queue;

/// A [`Queue`] created on first access and shared by every caller after.
///
/// Construction goes through [`OnceLock`], so threads racing on the first
/// access all observe the same instance and only one queue is ever built.
pub struct LazyQueue<A: Allocator = Global> {
    cell: OnceLock<Queue<A>>,
    alloc: fn() -> A,
}

impl LazyQueue<Global> {
    pub const fn new() -> Self {
        Self::with_allocator(global_allocator)
    }
}

impl Default for LazyQueue<Global> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Allocator> LazyQueue<A> {
    /// `alloc` is called once, when the queue is created.
    pub const fn with_allocator(alloc: fn() -> A) -> Self {
        Self {
            cell: OnceLock::new(),
            alloc,
        }
    }

    pub fn get_or_create(&self) -> &Queue<A> {
        self.cell.get_or_init(|| {
            tracing::info!(thread = ?std::thread::current().id(), "created shared queue");
            Queue::new_in((self.alloc)())
        })
    }

    /// Returns the queue if it has been created already.
    pub fn get(&self) -> Option<&Queue<A>> {
        self.cell.get()
    }
}

fn global_allocator() -> Global {
    Global
}

/// The process-wide queue.
pub fn global() -> &'static Queue {
    static QUEUE: LazyQueue = LazyQueue::new();
    QUEUE.get_or_create()
}
