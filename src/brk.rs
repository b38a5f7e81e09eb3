//! Program-break adapter.
//!
//! The heap's backing storage changes size only through this module. The
//! kernel is treated as a provider of a single primitive: move the end of
//! the data segment by a signed amount and report the old end.

use libc::{c_void, intptr_t, sbrk};

/// Moves the program break by `delta` bytes and returns the previous break.
///
/// A positive `delta` grows the data segment, so the returned pointer is the
/// first byte of the newly granted region. A negative `delta` contracts it;
/// callers releasing memory ignore the returned value. Zero is legal and
/// simply reports the current break.
///
/// Returns `None` when the kernel refuses to move the break.
pub(crate) fn grow_or_shrink(delta: isize) -> Option<*mut u8> {
  // sbrk reports failure as (void*)-1
  let old = unsafe { sbrk(delta as intptr_t) };
  if old == usize::MAX as *mut c_void {
    None
  } else {
    Some(old as *mut u8)
  }
}
