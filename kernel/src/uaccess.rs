use thiserror::Error;

/// A user address could not be written to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
#[error("bad user address: {addr:#x}")]
pub struct Fault {
    pub addr: usize,
}

/// Copies `val` to the user location `dst`.
///
/// Null and misaligned addresses are rejected with a [`Fault`] before
/// anything is written.
///
/// # Safety
///
/// If `dst` is non-null and aligned, it must be valid for writes of `T`.
pub unsafe fn copy_to_user<T: Copy>(dst: *mut T, val: T) -> Result<(), Fault> {
    if dst.is_null() || !dst.is_aligned() {
        return Err(Fault { addr: dst as usize });
    }
    unsafe { dst.write(val) };
    Ok(())
}
