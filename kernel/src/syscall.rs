use allocator_api2::alloc::Allocator;
use common::syscall::*;
use kqueue::{AllocationFailure, Queue, RemoveError};
use nix::errno::Errno;
use thiserror::Error;

use crate::uaccess::{self, Fault};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum SyscallError {
    #[error(transparent)]
    Alloc(#[from] AllocationFailure),
    #[error(transparent)]
    Remove(#[from] RemoveError),
    #[error(transparent)]
    Fault(#[from] Fault),
    #[error("unsupported syscall: {0}")]
    Unsupported(usize),
}

impl SyscallError {
    pub fn errno(&self) -> Errno {
        match self {
            Self::Alloc(_) => Errno::ENOMEM,
            Self::Remove(RemoveError::NoData) => Errno::EAGAIN,
            Self::Remove(RemoveError::Interrupted) => Errno::EINTR,
            Self::Fault(_) => Errno::EFAULT,
            Self::Unsupported(_) => Errno::ENOSYS,
        }
    }
}

/// Runs syscall `id` against the process-wide queue, which is created on
/// the first call.
///
/// # Safety
///
/// See [`dispatch`].
pub unsafe fn handle(id: usize, args: [usize; 3]) -> isize {
    unsafe { dispatch(kqueue::global(), id, args) }
}

/// Runs syscall `id` against `queue`. Returns `0` on success or a negated
/// errno.
///
/// # Safety
///
/// Pointer arguments must be null, misaligned, or valid for writes.
pub unsafe fn dispatch<A: Allocator>(queue: &Queue<A>, id: usize, args: [usize; 3]) -> isize {
    let ret = match id {
        SYS_QUEUE_INSERT => sys_queue_insert(queue, args[0] as i32),
        SYS_QUEUE_REMOVE => unsafe { sys_queue_remove(queue, args[0] as *mut i32) },
        id => Err(SyscallError::Unsupported(id)),
    };
    match ret {
        Ok(()) => 0,
        Err(e) => {
            tracing::debug!(id, "syscall failed: {e}");
            -(e.errno() as isize)
        },
    }
}

pub fn sys_queue_insert<A: Allocator>(queue: &Queue<A>, val: i32) -> Result<(), SyscallError> {
    queue.insert(val)?;
    Ok(())
}

/// Removes a value, blocking while the queue is empty, and copies it to
/// `out`.
///
/// If the copy faults, the value is put back at the head of the queue so
/// that the next remover receives it.
///
/// # Safety
///
/// See [`uaccess::copy_to_user`].
pub unsafe fn sys_queue_remove<A: Allocator>(
    queue: &Queue<A>,
    out: *mut i32,
) -> Result<(), SyscallError> {
    let val = queue.remove()?;
    if let Err(fault) = unsafe { uaccess::copy_to_user(out, val) } {
        match queue.requeue_front(val) {
            Ok(()) => tracing::warn!(val, "requeued value after {fault}"),
            Err(e) => tracing::error!(val, "dropped value after {fault}: {e}"),
        }
        return Err(fault.into());
    }
    Ok(())
}
