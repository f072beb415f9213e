#![no_std]

#[rustfmt::skip]
pub mod syscall {
    pub const SYS_QUEUE_INSERT: usize = 548;
    pub const SYS_QUEUE_REMOVE: usize = 549;
}
