use std::{mem, process, ptr};

use static_assertions::const_assert;
use tracing::error;

/// Sentinel stored in every header. A header whose `magic` diverges was
/// overwritten by the caller (or the pointer never came from this heap);
/// both are fatal.
pub(crate) const MAGIC: usize = 0xDEAD_BEEF;

/// Footprint of the in-band metadata record preceding every payload.
pub(crate) const HEADER_SIZE: usize = mem::size_of::<Block>();

// Payloads get exactly the header's natural alignment, nothing more.
const_assert!(mem::align_of::<Block>() == mem::align_of::<usize>());
const_assert!(mem::size_of::<Block>() % mem::align_of::<Block>() == 0);

/// In-band metadata preceding every payload.
///
/// The list order is the address order: `next` (when present) sits exactly
/// `HEADER_SIZE + size` bytes above this header.
#[repr(C)]
pub(crate) struct Block {
  pub(crate) magic: usize,
  pub(crate) size: usize,
  pub(crate) used: bool,
  pub(crate) next: *mut Block,
  pub(crate) prev: *mut Block,
}

impl Block {
  /// A freshly minted header: live, unlinked, `size` payload bytes.
  pub(crate) fn new(size: usize) -> Self {
    Self {
      magic: MAGIC,
      size,
      used: true,
      next: ptr::null_mut(),
      prev: ptr::null_mut(),
    }
  }
}

/// First payload byte of `block`; this is the pointer handed to callers.
///
/// # Safety
///
/// `block` must point to a live header inside the heap.
pub(crate) unsafe fn payload_of(block: *mut Block) -> *mut u8 {
  unsafe { block.add(1) as *mut u8 }
}

/// Recovers the header from a user pointer by stepping back one header unit.
///
/// # Safety
///
/// `ptr` must have been produced by [`payload_of`]; the result must still be
/// validated with [`check_magic`] before use.
pub(crate) unsafe fn from_payload(ptr: *mut u8) -> *mut Block {
  unsafe { (ptr as *mut Block).sub(1) }
}

/// Validates the magic sentinel of `block`, aborting the process on
/// divergence. Continuing with corrupted metadata is unsafe, so there is no
/// recoverable error path here.
///
/// # Safety
///
/// `block` must be readable as a `Block`; an arbitrary invalid pointer may
/// fault before the check can fire.
pub(crate) unsafe fn check_magic(
  block: *mut Block,
  op: &str,
) {
  let magic = unsafe { (*block).magic };
  if magic != MAGIC {
    error!(op, block = ?block, magic, "magic sentinel corrupted");
    eprintln!("{op}: magic sentinel corrupted at {block:p}, aborting");
    process::abort();
  }
}

/// Appends `block` after the current tail of the list starting at `from`.
///
/// # Safety
///
/// Caller holds the global heap lock; `from` is a reachable header and
/// `block` is a fresh, unlinked header.
pub(crate) unsafe fn append_tail(
  from: *mut Block,
  block: *mut Block,
) {
  unsafe {
    let mut current = from;
    loop {
      check_magic(current, "append");
      let next = (*current).next;
      if next.is_null() {
        (*current).next = block;
        (*block).prev = current;
        return;
      }
      current = next;
    }
  }
}

/// Detaches `block` from its predecessor, making the predecessor the new
/// list tail. The block itself keeps its links; it is about to be handed
/// back to the kernel.
///
/// # Safety
///
/// Caller holds the global heap lock; `block` is the current list tail.
pub(crate) unsafe fn detach_tail(block: *mut Block) {
  unsafe {
    let prev = (*block).prev;
    if !prev.is_null() {
      (*prev).next = ptr::null_mut();
    }
  }
}

/// Points `result` past a merged run: `result.next = successor` and, when a
/// successor exists, `successor.prev = result`.
///
/// # Safety
///
/// Caller holds the global heap lock; `result` is the surviving header of a
/// merge and `successor` is either null or the first header past the run.
pub(crate) unsafe fn relink_after_merge(
  result: *mut Block,
  successor: *mut Block,
) {
  unsafe {
    (*result).next = successor;
    if !successor.is_null() {
      (*successor).prev = result;
    }
  }
}
