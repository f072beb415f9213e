use nix::errno::Errno;

pub mod syscall {
    use common::syscall::*;

    /// # Safety
    ///
    /// The caller must follow the specified syscall convention.
    pub unsafe fn syscall(id: usize, args: [usize; 3]) -> isize {
        unsafe { kernel::syscall::handle(id, args) }
    }

    pub fn sys_queue_insert(val: i32) -> isize {
        unsafe { syscall(SYS_QUEUE_INSERT, [val as usize, 0, 0]) }
    }

    pub fn sys_queue_remove(out: &mut i32) -> isize {
        unsafe { syscall(SYS_QUEUE_REMOVE, [out as *mut i32 as usize, 0, 0]) }
    }
}
pub use syscall::*;

/// Inserts `val` into the shared queue.
pub fn enqueue(val: i32) -> nix::Result<()> {
    check(sys_queue_insert(val))
}

/// Removes the oldest value from the shared queue, blocking while it is
/// empty. [`Errno::EAGAIN`] and [`Errno::EINTR`] are worth retrying.
pub fn dequeue() -> nix::Result<i32> {
    let mut val = 0;
    check(sys_queue_remove(&mut val))?;
    Ok(val)
}

fn check(ret: isize) -> nix::Result<()> {
    if ret < 0 {
        Err(Errno::from_raw(-ret as i32))
    } else {
        Ok(())
    }
}
