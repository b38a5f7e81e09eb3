//! Process-global heap facade.
//!
//! All four public operations funnel through one `static Mutex<Heap>`; the
//! lock is taken once at the entry of every operation and every internal
//! routine runs with it held, including the allocate fallback inside
//! [`resize`]. The heap state itself is nothing but the address-lowest
//! header; everything else lives in-band in the blocks.
//!
//! ## Lifecycle of a block
//!
//! ```text
//!               allocate                release
//!   (no block) ──────────► LIVE ──────────────────► FREE
//!                            ▲                        │
//!                            │ reuse / merge          │ absorbed by a
//!                            └────────────────────────┤ neighboring merge
//!                                                     │      │
//!                                 tail-shrink         ▼      ▼
//!                              RECLAIMED ◄───────── FREE   MERGED_AWAY
//! ```
//!
//! A block is destroyed in exactly two ways: its header dissolves into a
//! neighbor's payload during a merge, or it sits at the tail with no used
//! block above it and the break contracts past it.

use std::ptr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::block::{self, Block, HEADER_SIZE};
use crate::brk;
use crate::merge;

/// Distinguished value returned by [`allocate`] (and propagated by
/// [`zero_allocate`] and [`resize`]) when the kernel refuses to grow the
/// data segment. Deliberately not null: a zero-size request answers null.
pub const ALLOC_FAILED: *mut u8 = usize::MAX as *mut u8;

/// Mutable heap state: the address-lowest block header, or null while the
/// heap is empty.
pub(crate) struct Heap {
  head: *mut Block,
}

// SAFETY: the raw head pointer (and every header reachable from it) is only
// touched through the HEAP mutex, so moving the state between threads is
// sound.
unsafe impl Send for Heap {}

static HEAP: Mutex<Heap> = Mutex::new(Heap::new());

/// Acquires the process-wide heap lock.
///
/// Every public operation finishes its list mutations before any caller
/// code can panic, so a poisoned guard still holds a consistent heap and is
/// simply recovered.
fn lock() -> MutexGuard<'static, Heap> {
  HEAP.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Heap {
  const fn new() -> Self {
    Self {
      head: ptr::null_mut(),
    }
  }

  /// First-fit scan for a free block holding `size` bytes, coalescing a
  /// free run in place when that is what makes a block fit.
  unsafe fn find_free_block(
    &mut self,
    size: usize,
  ) -> *mut Block {
    unsafe {
      let mut current = self.head;
      while !current.is_null() {
        block::check_magic(current, "allocate");
        if !(*current).used {
          if (*current).size >= size {
            return current;
          }
          if merge::can_forward_satisfy(current, size) {
            merge::forward_merge(current, size);
            return current;
          }
        }
        current = (*current).next;
      }
      ptr::null_mut()
    }
  }

  unsafe fn allocate(
    &mut self,
    size: usize,
  ) -> *mut u8 {
    unsafe {
      let found = self.find_free_block(size);
      if !found.is_null() {
        (*found).used = true;
        debug!(block = ?found, capacity = (*found).size, requested = size, "reused block");
        return block::payload_of(found);
      }

      let delta = match HEADER_SIZE.checked_add(size).and_then(|n| isize::try_from(n).ok()) {
        Some(n) => n,
        None => return ALLOC_FAILED,
      };
      let Some(raw) = brk::grow_or_shrink(delta) else {
        return ALLOC_FAILED;
      };

      let new_block = raw as *mut Block;
      ptr::write(new_block, Block::new(size));

      if self.head.is_null() {
        self.head = new_block;
      } else {
        block::append_tail(self.head, new_block);
      }
      debug!(block = ?new_block, size, "grew heap for new block");
      block::payload_of(new_block)
    }
  }

  unsafe fn resize(
    &mut self,
    old: *mut u8,
    size: usize,
  ) -> *mut u8 {
    unsafe {
      let block = block::from_payload(old);
      block::check_magic(block, "resize");
      let old_size = (*block).size;

      // The block participates in its own merge accounting.
      (*block).used = false;

      if !(*block).next.is_null() && merge::can_forward_satisfy(block, size) {
        merge::forward_merge(block, size);
        // The header did not move, so neither did the payload.
        return old;
      }

      if !(*block).prev.is_null() && merge::can_backward_satisfy(block, size) {
        let merged = merge::backward_merge(block, size);
        let dst = block::payload_of(merged);
        // Destination is lower-addressed and overlaps the old payload.
        ptr::copy(old, dst, old_size);
        return dst;
      }

      let fresh = self.allocate(size);
      if fresh.is_null() || fresh == ALLOC_FAILED {
        // Nothing moved; hand the block back to the caller untouched.
        (*block).used = true;
        return fresh;
      }

      // The scan above may have satisfied the request by coalescing a free
      // run that swallowed the old block itself. Its bytes then already sit
      // inside the fresh payload; copy overlap-safely and skip the release.
      let fresh_block = block::from_payload(fresh);
      let fresh_end = fresh.add((*fresh_block).size);
      let absorbed = (old as usize) >= (fresh as usize) && (old as usize) < (fresh_end as usize);

      ptr::copy(old, fresh, old_size.min(size));

      if !absorbed {
        // The old block stays free; contract the break if it now forms the
        // free suffix of the list.
        if (*block).next.is_null() {
          self.shrink_tail(block);
        }
        debug!(block = ?block, "released old block after relocating resize");
      }
      fresh
    }
  }

  unsafe fn release(
    &mut self,
    ptr_in: *mut u8,
  ) {
    unsafe {
      let block = block::from_payload(ptr_in);
      block::check_magic(block, "release");

      if !(*block).used {
        // Already free; releasing twice is a no-op.
        return;
      }
      (*block).used = false;
      debug!(block = ?block, size = (*block).size, "released block");

      if (*block).next.is_null() {
        self.shrink_tail(block);
      }
    }
  }

  /// Hands the free suffix of the list back to the kernel, block by block,
  /// stopping at the first used predecessor. Clearing the last block also
  /// clears `head`.
  unsafe fn shrink_tail(
    &mut self,
    tail: *mut Block,
  ) {
    unsafe {
      let mut current = tail;
      while !current.is_null() {
        block::check_magic(current, "release");
        if (*current).used {
          break;
        }

        let prev = (*current).prev;
        let footprint = HEADER_SIZE + (*current).size;
        block::detach_tail(current);
        let _ = brk::grow_or_shrink(-(footprint as isize));
        debug!(block = ?current, footprint, "returned tail block to kernel");

        if prev.is_null() {
          self.head = ptr::null_mut();
        }
        current = prev;
      }
    }
  }
}

/// Allocates `size` bytes and returns the payload pointer.
///
/// Returns null for a zero-size request and [`ALLOC_FAILED`] when the
/// kernel refuses to grow the heap. Freed blocks are reused first-fit,
/// coalescing adjacent free blocks when that makes one fit; an oversized
/// reused block keeps its full capacity (no splitting).
///
/// # Safety
///
/// The returned pointer is valid for `size` bytes until passed to
/// [`release`] or [`resize`]; the usual raw-pointer rules apply.
pub unsafe fn allocate(size: usize) -> *mut u8 {
  if size == 0 {
    return ptr::null_mut();
  }
  unsafe { lock().allocate(size) }
}

/// Allocates `count * size` bytes and zeroes them.
///
/// Returns null when either factor is zero or the product overflows;
/// propagates [`ALLOC_FAILED`] (un-zeroed) on exhaustion.
///
/// # Safety
///
/// Same contract as [`allocate`].
pub unsafe fn zero_allocate(
  count: usize,
  size: usize,
) -> *mut u8 {
  let Some(total) = count.checked_mul(size) else {
    return ptr::null_mut();
  };
  if total == 0 {
    return ptr::null_mut();
  }

  let ptr_out = unsafe { lock().allocate(total) };
  if !ptr_out.is_null() && ptr_out != ALLOC_FAILED {
    unsafe { ptr::write_bytes(ptr_out, 0, total) };
  }
  ptr_out
}

/// Grows or shrinks the allocation behind `ptr` to `size` bytes.
///
/// Tries, in order: extending in place over free successors (pointer
/// unchanged), merging into free predecessors (payload moves down, contents
/// preserved), and finally allocating fresh memory, copying
/// `min(old_size, size)` bytes and releasing the old block. A null `ptr` is
/// equivalent to [`allocate`]. On exhaustion the old allocation is left
/// intact and the failure value is returned.
///
/// # Safety
///
/// `ptr` must be null or a live pointer from this heap; the old pointer is
/// invalidated whenever a different pointer is returned.
pub unsafe fn resize(
  ptr: *mut u8,
  size: usize,
) -> *mut u8 {
  if ptr.is_null() {
    return unsafe { allocate(size) };
  }
  unsafe { lock().resize(ptr, size) }
}

/// Releases an allocation. Null is a no-op, releasing twice is a no-op, and
/// releasing the address-highest block contracts the data segment back to
/// the last used block.
///
/// # Safety
///
/// `ptr` must be null or a pointer previously returned by this heap and not
/// invalidated since.
pub unsafe fn release(ptr: *mut u8) {
  if ptr.is_null() {
    return;
  }
  unsafe { lock().release(ptr) }
}

/// Capacity in bytes of the allocation behind `ptr`. At least as large as
/// the size requested; larger when a reused or merged block carried excess.
/// Aborts on a corrupted header.
///
/// # Safety
///
/// `ptr` must be a live pointer from this heap.
pub unsafe fn allocation_size(ptr: *mut u8) -> usize {
  let _guard = lock();
  unsafe {
    let block = block::from_payload(ptr);
    block::check_magic(block, "allocation size");
    (*block).size
  }
}

/// Footprint of the in-band header preceding every payload.
pub fn header_size() -> usize {
  HEADER_SIZE
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::MutexGuard as TestGuard;

  /// The heap is process-global; tests touching it run one at a time.
  fn serial() -> TestGuard<'static, ()> {
    crate::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
  }

  #[test]
  fn zero_size_requests_return_null() {
    unsafe {
      assert!(allocate(0).is_null());
      assert!(zero_allocate(0, 16).is_null());
      assert!(zero_allocate(16, 0).is_null());
    }
  }

  #[test]
  fn zero_allocate_rejects_overflowing_products() {
    unsafe {
      assert!(zero_allocate(usize::MAX, 2).is_null());
    }
  }

  #[test]
  fn header_size_matches_block_footprint() {
    assert_eq!(header_size(), std::mem::size_of::<Block>());
  }

  #[test]
  fn freed_block_is_reused_first_fit() {
    let _serial = serial();
    unsafe {
      let p1 = allocate(64);
      let p2 = allocate(64);
      assert!(!p1.is_null() && !p2.is_null());

      for i in 0..64 {
        p2.add(i).write(0xC3);
      }

      release(p1);
      let p3 = allocate(32);

      // First fit hands back the freed block at its full capacity.
      assert_eq!(p3, p1);
      assert_eq!(allocation_size(p3), 64);
      for i in 0..64 {
        assert_eq!(p2.add(i).read(), 0xC3);
      }

      release(p3);
      release(p2);
    }
  }

  #[test]
  fn releasing_the_tail_restores_the_break() {
    let _serial = serial();
    unsafe {
      let before = libc::sbrk(0) as usize;

      let p = allocate(100);
      assert!(!p.is_null());
      assert_eq!(libc::sbrk(0) as usize, before + header_size() + 100);

      release(p);
      assert_eq!(libc::sbrk(0) as usize, before);
    }
  }

  #[test]
  fn releasing_a_free_run_at_the_tail_contracts_past_all_of_it() {
    let _serial = serial();
    unsafe {
      let before = libc::sbrk(0) as usize;

      let a = allocate(32);
      let b = allocate(48);
      let c = allocate(16);

      // a and b are not the tail yet, so they only become free.
      release(a);
      release(b);
      assert_eq!(
        libc::sbrk(0) as usize,
        before + 3 * header_size() + 32 + 48 + 16
      );

      // Releasing c leaves the whole list free; everything goes back.
      release(c);
      assert_eq!(libc::sbrk(0) as usize, before);
    }
  }

  #[test]
  fn allocate_coalesces_adjacent_free_blocks() {
    let _serial = serial();
    unsafe {
      let a = allocate(32);
      let b = allocate(32);
      let c = allocate(32);

      for i in 0..32 {
        c.add(i).write(0x7E);
      }

      release(a);
      release(b);

      let big = allocate(70);
      assert_eq!(big, a);
      // a's payload, b's header, and b's payload fused into one capacity.
      assert_eq!(allocation_size(big), 64 + header_size());
      for i in 0..32 {
        assert_eq!(c.add(i).read(), 0x7E);
      }

      release(big);
      release(c);
    }
  }

  #[test]
  fn resize_extends_forward_in_place() {
    let _serial = serial();
    unsafe {
      let p = allocate(32);
      let q = allocate(64);
      let guard = allocate(16);

      for i in 0..32 {
        p.add(i).write(0x5A);
      }

      release(q);
      let r = resize(p, 80);

      assert_eq!(r, p);
      assert!(allocation_size(r) >= 80);
      for i in 0..32 {
        assert_eq!(r.add(i).read(), 0x5A);
      }

      release(r);
      release(guard);
    }
  }

  #[test]
  fn resize_merges_backward_and_moves_payload_down() {
    let _serial = serial();
    unsafe {
      let a = allocate(32);
      let b = allocate(32);
      let guard = allocate(16);

      for i in 0..32 {
        b.add(i).write(i as u8);
      }

      release(a);
      let r = resize(b, 80);

      // The result starts at the freed predecessor's payload.
      assert_eq!(r, a);
      assert_eq!(allocation_size(r), 64 + header_size());
      for i in 0..32 {
        assert_eq!(r.add(i).read(), i as u8);
      }

      release(r);
      release(guard);
    }
  }

  #[test]
  fn resize_falls_back_to_copy_and_releases_the_old_block() {
    let _serial = serial();
    unsafe {
      let p = allocate(16);
      let q = allocate(16);

      let message = b"hello\0";
      ptr::copy_nonoverlapping(message.as_ptr(), p, message.len());

      let r = resize(p, 4096);
      assert!(!r.is_null() && r != ALLOC_FAILED);
      assert_ne!(r, p);
      for (i, &byte) in message.iter().enumerate() {
        assert_eq!(r.add(i).read(), byte);
      }

      // The old block was released, so an equally sized request reuses it.
      let s = allocate(16);
      assert_eq!(s, p);

      release(s);
      release(q);
      release(r);
    }
  }

  #[test]
  fn resize_of_null_allocates() {
    let _serial = serial();
    unsafe {
      let p = resize(ptr::null_mut(), 24);
      assert!(!p.is_null() && p != ALLOC_FAILED);
      assert_eq!(allocation_size(p), 24);
      release(p);
    }
  }

  #[test]
  fn zero_allocate_zeroes_recycled_memory() {
    let _serial = serial();
    unsafe {
      let p = allocate(64);
      let guard = allocate(16);

      for i in 0..64 {
        p.add(i).write(0xAB);
      }
      release(p);

      let z = zero_allocate(8, 8);
      assert_eq!(z, p);
      for i in 0..64 {
        assert_eq!(z.add(i).read(), 0);
      }

      release(z);
      release(guard);
    }
  }

  #[test]
  fn release_of_null_and_double_release_are_noops() {
    let _serial = serial();
    unsafe {
      release(ptr::null_mut());

      let p = allocate(32);
      let guard = allocate(32);

      release(p);
      release(p);

      // The double release must not have clobbered anything: the block is
      // still reusable exactly once.
      let r = allocate(32);
      assert_eq!(r, p);

      release(r);
      release(guard);
    }
  }

  #[test]
  fn allocation_size_reports_stored_capacity() {
    let _serial = serial();
    unsafe {
      let p = allocate(40);
      assert_eq!(allocation_size(p), 40);
      release(p);
    }
  }

  #[test]
  fn corrupted_sentinel_aborts_the_process() {
    // The abort cannot be observed in-process, so the test re-runs itself
    // as a child and watches the exit status.
    let _serial = serial();

    if std::env::var_os("BRKALLOC_CORRUPTION_CHILD").is_some() {
      unsafe {
        let p = allocate(64);
        ptr::write_bytes(p.sub(header_size()), 0, std::mem::size_of::<usize>());
        release(p);
      }
      unreachable!("release must abort on a corrupted sentinel");
    }

    let exe = std::env::current_exe().unwrap();
    let status = std::process::Command::new(exe)
      .args(["corrupted_sentinel_aborts_the_process", "--test-threads", "1"])
      .env("BRKALLOC_CORRUPTION_CHILD", "1")
      .status()
      .unwrap();
    assert!(!status.success());
  }
}
