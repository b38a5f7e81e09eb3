//! Coalescing engine: deciding whether a run of adjacent free blocks can
//! satisfy a request, and collapsing such a run into one in-use block.
//!
//! Capacity accounting is the same on both sides of the split: the starting
//! block contributes only its payload (its header survives as the result
//! header), while every absorbed neighbor contributes its payload *plus* its
//! header, because that header vanishes into the merged payload.
//!
//! ```text
//!   Before (forward merge, need = 70):
//!   ┌────────┬──────────┬────────┬──────────┬────────┬──────────┐
//!   │ hdr A  │ 32 free  │ hdr B  │ 32 free  │ hdr C  │ 32 used  │
//!   └────────┴──────────┴────────┴──────────┴────────┴──────────┘
//!
//!   After:
//!   ┌────────┬────────────────────────────────┬────────┬──────────┐
//!   │ hdr A  │ 32 + hdr + 32 used             │ hdr C  │ 32 used  │
//!   └────────┴────────────────────────────────┴────────┴──────────┘
//! ```
//!
//! The planners are pure reads; the executors mutate headers and links and
//! require the matching planner to have accepted first. All of it runs under
//! the global heap lock.

use tracing::debug;

use crate::block::{self, Block, HEADER_SIZE};

/// Whether `start` plus zero or more consecutive free successors can hold
/// `need` payload bytes.
///
/// Walks `next` links, failing at the first used block or at the list tail.
///
/// # Safety
///
/// Caller holds the global heap lock and `start` points to a reachable
/// header.
pub(crate) unsafe fn can_forward_satisfy(
  start: *mut Block,
  need: usize,
) -> bool {
  unsafe {
    let mut available = 0usize;
    let mut current = start;
    while !current.is_null() {
      block::check_magic(current, "forward merge check");
      if (*current).used {
        return false;
      }
      available += if current == start {
        (*current).size
      } else {
        HEADER_SIZE + (*current).size
      };
      if available >= need {
        return true;
      }
      current = (*current).next;
    }
    false
  }
}

/// Whether `start` plus zero or more consecutive free predecessors can hold
/// `need` payload bytes.
///
/// Walks `prev` links, failing at the first used block or at the list head.
///
/// # Safety
///
/// Caller holds the global heap lock and `start` points to a reachable
/// header.
pub(crate) unsafe fn can_backward_satisfy(
  start: *mut Block,
  need: usize,
) -> bool {
  unsafe {
    let mut available = 0usize;
    let mut current = start;
    while !current.is_null() {
      block::check_magic(current, "backward merge check");
      if (*current).used {
        return false;
      }
      available += if current == start {
        (*current).size
      } else {
        HEADER_SIZE + (*current).size
      };
      if available >= need {
        return true;
      }
      current = (*current).prev;
    }
    false
  }
}

/// Collapses `first` and as many free successors as `need` requires into a
/// single in-use block keeping `first`'s address. Absorbed headers dissolve
/// into the payload; the list skips past the last absorbed block.
///
/// # Safety
///
/// Caller holds the global heap lock and [`can_forward_satisfy`] returned
/// true for the same `first` and `need` with the list unchanged since.
pub(crate) unsafe fn forward_merge(
  first: *mut Block,
  need: usize,
) {
  unsafe {
    let mut available = (*first).size;
    let mut last = first;
    while available < need {
      last = (*last).next;
      block::check_magic(last, "forward merge");
      available += HEADER_SIZE + (*last).size;
    }

    block::relink_after_merge(first, (*last).next);
    (*first).size = available;
    (*first).used = true;
    debug!(first = ?first, through = ?last, size = available, "forward merge");
  }
}

/// Collapses `first` and as many free predecessors as `need` requires into a
/// single in-use block. The result keeps the address-lowest absorbed header
/// and spans through `first`; the caller is responsible for moving payload
/// bytes down into the returned block.
///
/// # Safety
///
/// Caller holds the global heap lock and [`can_backward_satisfy`] returned
/// true for the same `first` and `need` with the list unchanged since.
pub(crate) unsafe fn backward_merge(
  first: *mut Block,
  need: usize,
) -> *mut Block {
  unsafe {
    let mut available = (*first).size;
    let mut result = first;
    while available < need {
      result = (*result).prev;
      block::check_magic(result, "backward merge");
      available += HEADER_SIZE + (*result).size;
    }

    block::relink_after_merge(result, (*first).next);
    (*result).size = available;
    (*result).used = true;
    debug!(from = ?first, result = ?result, size = available, "backward merge");
    result
  }
}
