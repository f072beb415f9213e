use std::fmt;
use std::ptr::NonNull;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use allocator_api2::alloc::{Allocator, Global, Layout};

use crate::error::{AllocationFailure, RemoveError};

struct Node {
    value: i32,
    /// Owning link to the successor.
    next: Option<NonNull<Node>>,
}

impl Node {
    const LAYOUT: Layout = Layout::new::<Self>();
}

/// The linked chain guarded by the lock of a [`Queue`].
///
/// `head` owns the first node and, through `next`, every node after it.
/// `tail` merely points at the last node so that appending is O(1); nodes
/// are never released through it.
struct Chain {
    head: Option<NonNull<Node>>,
    tail: Option<NonNull<Node>>,
    len: usize,
    /// Bumped by [`Queue::interrupt`].
    interrupts: u64,
}

// SAFETY: the chain exclusively owns its nodes, which only carry `i32`s.
unsafe impl Send for Chain {}

impl Chain {
    const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            interrupts: 0,
        }
    }

    fn push_back(&mut self, node: NonNull<Node>) {
        match self.tail {
            // SAFETY: `tail` points at the last live node of this chain.
            Some(mut tail) => unsafe { tail.as_mut().next = Some(node) },
            None => self.head = Some(node),
        }
        self.tail = Some(node);
        self.len += 1;
    }

    fn push_front(&mut self, mut node: NonNull<Node>) {
        // SAFETY: `node` is fresh and not linked anywhere else yet.
        unsafe { node.as_mut().next = self.head };
        if self.tail.is_none() {
            self.tail = Some(node);
        }
        self.head = Some(node);
        self.len += 1;
    }

    /// Unlinks the first node and hands its ownership to the caller.
    fn pop_front(&mut self) -> Option<NonNull<Node>> {
        let head = self.head?;
        // SAFETY: `head` is a live node owned by this chain.
        self.head = unsafe { head.as_ref().next };
        if self.head.is_none() {
            self.tail = None;
        }
        self.len -= 1;
        Some(head)
    }
}

/// A blocking FIFO queue of `i32`s.
///
/// Producers call [`insert`](Self::insert), which never blocks beyond the
/// short critical section. Consumers call [`remove`](Self::remove), which
/// sleeps on a condition variable while the queue is empty. Each inserted
/// value is delivered to exactly one remover.
pub struct Queue<A: Allocator = Global> {
    alloc: A,
    chain: Mutex<Chain>,
    cond: Condvar,
}

impl Queue<Global> {
    /// Creates an empty queue backed by the global allocator.
    pub const fn new() -> Self {
        Self::new_in(Global)
    }
}

impl Default for Queue<Global> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Allocator> Queue<A> {
    /// Creates an empty queue whose nodes come from `alloc`.
    pub const fn new_in(alloc: A) -> Self {
        Self {
            alloc,
            chain: Mutex::new(Chain::new()),
            cond: Condvar::new(),
        }
    }

    /// Returns the allocator that queue nodes are taken from.
    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `value` and wakes one blocked remover.
    pub fn insert(&self, value: i32) -> Result<(), AllocationFailure> {
        let node = self.make_node(value)?;
        let mut chain = self.lock();
        chain.push_back(node);
        drop(chain);
        // Notify after unlocking, so the woken remover does not immediately
        // block on the lock we still hold.
        self.cond.notify_one();
        tracing::debug!(value, thread = ?std::thread::current().id(), "inserted");
        Ok(())
    }

    /// Puts `value` back at the head of the queue, ahead of everything
    /// already inserted, and wakes one blocked remover.
    pub fn requeue_front(&self, value: i32) -> Result<(), AllocationFailure> {
        let node = self.make_node(value)?;
        let mut chain = self.lock();
        chain.push_front(node);
        drop(chain);
        self.cond.notify_one();
        tracing::debug!(value, thread = ?std::thread::current().id(), "requeued");
        Ok(())
    }

    /// Removes the oldest value, sleeping while the queue is empty.
    ///
    /// Returns [`RemoveError::Interrupted`] if [`interrupt`](Self::interrupt)
    /// is called while this thread waits and no data has arrived.
    pub fn remove(&self) -> Result<i32, RemoveError> {
        self.remove_until(None)
    }

    /// Like [`remove`](Self::remove), but gives up with
    /// [`RemoveError::NoData`] once `timeout` has elapsed.
    pub fn remove_timeout(&self, timeout: Duration) -> Result<i32, RemoveError> {
        self.remove_until(Instant::now().checked_add(timeout))
    }

    /// Removes the oldest value without waiting.
    pub fn try_remove(&self) -> Result<i32, RemoveError> {
        let node = self.lock().pop_front().ok_or(RemoveError::NoData)?;
        // SAFETY: `node` was just unlinked from the chain.
        Ok(unsafe { self.consume_node(node) })
    }

    /// Wakes every remover that is currently waiting. Those that still find
    /// the queue empty return [`RemoveError::Interrupted`]; removers that
    /// start waiting afterwards are not affected.
    pub fn interrupt(&self) {
        let mut chain = self.lock();
        chain.interrupts = chain.interrupts.wrapping_add(1);
        drop(chain);
        self.cond.notify_all();
        tracing::debug!(thread = ?std::thread::current().id(), "interrupted waiters");
    }

    /// Releases every node and leaves the queue empty, returning the number
    /// of values discarded.
    ///
    /// The lock is held for the whole drain. Callers must not race other
    /// operations against teardown; doing so is memory safe, but their
    /// values may be discarded too.
    pub fn destroy(&self) -> usize {
        let mut chain = self.lock();
        let mut freed = 0;
        while let Some(node) = chain.pop_front() {
            // SAFETY: `node` was just unlinked from the chain.
            unsafe { self.consume_node(node) };
            freed += 1;
        }
        freed
    }

    fn remove_until(&self, deadline: Option<Instant>) -> Result<i32, RemoveError> {
        let mut chain = self.lock();
        let interrupts = chain.interrupts;
        // Every wakeup re-checks the queue under the lock, since another
        // remover may have taken the item we were woken for.
        let node = loop {
            if let Some(node) = chain.pop_front() {
                break node;
            }
            if chain.interrupts != interrupts {
                return Err(RemoveError::Interrupted);
            }
            chain = match deadline {
                None => self.cond.wait(chain).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    if timeout.is_zero() {
                        return Err(RemoveError::NoData);
                    }
                    self.cond
                        .wait_timeout(chain, timeout)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                },
            };
        };
        drop(chain);

        // SAFETY: `node` was unlinked from the chain above.
        let value = unsafe { self.consume_node(node) };
        tracing::debug!(value, thread = ?std::thread::current().id(), "removed");
        Ok(value)
    }

    /// No code panics while holding the lock, so a poisoned chain is still
    /// consistent.
    fn lock(&self) -> MutexGuard<'_, Chain> {
        self.chain.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn make_node(&self, value: i32) -> Result<NonNull<Node>, AllocationFailure> {
        let node = self
            .alloc
            .allocate(Node::LAYOUT)
            .map_err(|_| AllocationFailure)?
            .cast::<Node>();
        // SAFETY: `node` is a fresh allocation with the layout of `Node`.
        unsafe { node.write(Node { value, next: None }) };
        Ok(node)
    }

    /// Releases `node` and returns the value it carried.
    ///
    /// # Safety
    ///
    /// `node` must come from [`make_node`](Self::make_node), must no longer be
    /// reachable from the chain, and must not be consumed twice.
    unsafe fn consume_node(&self, node: NonNull<Node>) -> i32 {
        unsafe {
            let value = node.as_ref().value;
            self.alloc.deallocate(node.cast(), Node::LAYOUT);
            value
        }
    }
}

impl<A: Allocator> Drop for Queue<A> {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl<A: Allocator> fmt::Debug for Queue<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use allocator_api2::alloc::AllocError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts live allocations and refuses to allocate once `budget` runs out.
    struct Counting {
        live: AtomicUsize,
        budget: AtomicUsize,
    }

    impl Counting {
        fn new() -> Self {
            Self::with_budget(usize::MAX)
        }

        fn with_budget(budget: usize) -> Self {
            Self {
                live: AtomicUsize::new(0),
                budget: AtomicUsize::new(budget),
            }
        }

        fn live(&self) -> usize {
            self.live.load(Ordering::Relaxed)
        }
    }

    unsafe impl Allocator for Counting {
        fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
            self.budget
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .map_err(|_| AllocError)?;
            let ptr = Global.allocate(layout)?;
            self.live.fetch_add(1, Ordering::Relaxed);
            Ok(ptr)
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
            self.live.fetch_sub(1, Ordering::Relaxed);
            unsafe { Global.deallocate(ptr, layout) }
        }
    }

    #[test]
    fn insert_then_remove() {
        let queue = Queue::new();
        queue.insert(10).unwrap();
        queue.insert(20).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.remove(), Ok(10));
        assert_eq!(queue.remove(), Ok(20));
        assert!(queue.is_empty());
    }

    #[test]
    fn fifo_order() {
        let input = std::iter::repeat_with(|| fastrand::i32(..))
            .take(100)
            .collect::<Vec<_>>();

        let queue = Queue::new();
        for &i in input.iter() {
            queue.insert(i).unwrap();
        }
        let output = (0..input.len())
            .map(|_| queue.remove().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(output, input);
        assert_eq!(queue.try_remove(), Err(RemoveError::NoData));
    }

    #[test]
    fn round_trip_after_drain() {
        let queue = Queue::new();
        for i in 0..3 {
            queue.insert(i).unwrap();
            assert_eq!(queue.remove(), Ok(i));
        }
        // The chain must be reusable after it became empty again.
        queue.insert(42).unwrap();
        queue.insert(43).unwrap();
        assert_eq!(queue.try_remove(), Ok(42));
        assert_eq!(queue.try_remove(), Ok(43));
    }

    #[test]
    fn requeue_goes_first() {
        let queue = Queue::new();
        queue.requeue_front(1).unwrap();
        queue.insert(2).unwrap();
        queue.requeue_front(0).unwrap();
        queue.insert(3).unwrap();
        let output = (0..4).map(|_| queue.remove().unwrap()).collect::<Vec<_>>();
        assert_eq!(output, [0, 1, 2, 3]);
    }

    #[test]
    fn allocation_failure_keeps_queue() {
        let queue = Queue::new_in(Counting::with_budget(2));
        queue.insert(1).unwrap();
        queue.insert(2).unwrap();
        assert_eq!(queue.insert(3), Err(AllocationFailure));
        assert_eq!(queue.requeue_front(0), Err(AllocationFailure));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.remove(), Ok(1));
        assert_eq!(queue.remove(), Ok(2));
        assert_eq!(queue.try_remove(), Err(RemoveError::NoData));
        assert_eq!(queue.allocator().live(), 0);
    }

    #[test]
    fn destroy_releases_all() {
        let queue = Queue::new_in(Counting::new());
        for i in 0..100 {
            queue.insert(i).unwrap();
        }
        assert_eq!(queue.allocator().live(), 100);
        assert_eq!(queue.destroy(), 100);
        assert_eq!(queue.allocator().live(), 0);
        assert!(queue.is_empty());
        assert_eq!(queue.try_remove(), Err(RemoveError::NoData));

        queue.insert(7).unwrap();
        assert_eq!(queue.remove(), Ok(7));
        assert_eq!(queue.destroy(), 0);
    }

    #[test]
    fn drop_releases_all() {
        let alloc = Counting::new();
        let queue = Queue::new_in(&alloc);
        for i in 0..10 {
            queue.insert(i).unwrap();
        }
        assert_eq!(queue.remove(), Ok(0));
        drop(queue);
        assert_eq!(alloc.live(), 0);
    }

    #[test]
    fn remove_blocks_until_insert() {
        let queue = Queue::new();
        std::thread::scope(|cx| {
            let remover = cx.spawn(|| {
                let value = queue.remove();
                (value, Instant::now())
            });
            std::thread::sleep(Duration::from_millis(50));
            assert!(!remover.is_finished());

            let inserted_at = Instant::now();
            queue.insert(5).unwrap();
            let (value, removed_at) = remover.join().unwrap();
            assert_eq!(value, Ok(5));
            assert!(removed_at >= inserted_at);
        });
    }

    #[test]
    fn remove_timeout_on_empty() {
        let queue = Queue::new();
        let timeout = Duration::from_millis(20);
        let now = Instant::now();
        assert_eq!(queue.remove_timeout(timeout), Err(RemoveError::NoData));
        assert!(now.elapsed() >= timeout);

        queue.insert(1).unwrap();
        assert_eq!(queue.remove_timeout(timeout), Ok(1));
    }

    #[test]
    fn interrupt_wakes_remover() {
        let queue = Queue::new();
        std::thread::scope(|cx| {
            let remover = cx.spawn(|| queue.remove());
            // The remover may not be waiting yet, so keep signalling until it
            // returns.
            while !remover.is_finished() {
                queue.interrupt();
                std::thread::sleep(Duration::from_millis(1));
            }
            assert_eq!(remover.join().unwrap(), Err(RemoveError::Interrupted));
        });

        // Earlier interrupts do not affect new removers.
        queue.insert(9).unwrap();
        assert_eq!(queue.remove(), Ok(9));
    }

    #[test]
    fn two_producers_two_consumers() {
        let queue = Queue::new();
        let mut output = std::thread::scope(|cx| {
            for range in [1..=10, 100..=109] {
                let queue = &queue;
                cx.spawn(move || {
                    for i in range {
                        queue.insert(i).unwrap();
                    }
                });
            }
            let queue = &queue;
            let consumers = (0..2)
                .map(|_| cx.spawn(move || (0..10).map(|_| queue.remove().unwrap()).collect::<Vec<_>>()))
                .collect::<Vec<_>>();
            consumers
                .into_iter()
                .flat_map(|c| c.join().unwrap())
                .collect::<Vec<_>>()
        });
        output.sort_unstable();
        let expected = (1..=10).chain(100..=109).collect::<Vec<_>>();
        assert_eq!(output, expected);
    }

    #[test]
    fn threaded_no_loss_no_dup() {
        const PRODUCERS: i32 = 4;
        const CONSUMERS: usize = 3;
        const ITEMS: i32 = 1000;

        let queue = Queue::new_in(Counting::new());
        let remaining = AtomicUsize::new((PRODUCERS * ITEMS) as usize);
        let outputs = std::thread::scope(|cx| {
            for p in 0..PRODUCERS {
                let queue = &queue;
                cx.spawn(move || {
                    for i in 0..ITEMS {
                        queue.insert(p * ITEMS + i).unwrap();
                        if fastrand::u8(..) == 0 {
                            std::thread::yield_now();
                        }
                    }
                });
            }
            let (queue, remaining) = (&queue, &remaining);
            let consumers = (0..CONSUMERS)
                .map(|_| {
                    cx.spawn(move || {
                        let mut r = vec![];
                        while remaining
                            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                            .is_ok()
                        {
                            r.push(queue.remove().unwrap());
                        }
                        r
                    })
                })
                .collect::<Vec<_>>();
            consumers
                .into_iter()
                .map(|c| c.join().unwrap())
                .collect::<Vec<_>>()
        });

        // Each consumer sees every producer's values in insertion order.
        for r in outputs.iter() {
            for p in 0..PRODUCERS {
                let own = r.iter().filter(|&&v| v / ITEMS == p).collect::<Vec<_>>();
                assert!(own.is_sorted());
            }
        }
        let mut all = outputs.into_iter().flatten().collect::<Vec<_>>();
        all.sort_unstable();
        assert_eq!(all, (0..PRODUCERS * ITEMS).collect::<Vec<_>>());
        assert!(queue.is_empty());
        assert_eq!(queue.allocator().live(), 0);
    }
}
