//! The privileged side of the queue syscalls.
//!
//! [`syscall::handle`] receives a call number and raw arguments, runs the
//! operation against the process-wide [`kqueue::Queue`] and reports failures
//! as negative errno values.

pub mod syscall;
pub mod uaccess;
