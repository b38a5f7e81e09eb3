//! # brkalloc - A Coalescing Free-List Allocator Library
//!
//! This crate provides a classical four-operation heap allocator
//! (allocate / zero-allocate / resize / release) for a single process-global
//! heap that grows and shrinks the program's data segment via the `sbrk`
//! system call.
//!
//! ## Overview
//!
//! Every allocation is preceded, in address order, by an in-band metadata
//! header; the headers form a doubly-linked list whose order is the address
//! order of the blocks:
//!
//! ```text
//!   ┌────────────┬───────────┬────────────┬───────────┬────────────┬───────────┐
//!   │  Header A  │ payload A │  Header B  │ payload B │  Header C  │ payload C │
//!   ├────────────┤           ├────────────┤           ├────────────┤           │
//!   │ magic      │           │ magic      │           │ magic      │           │
//!   │ size       │           │ size       │           │ size       │           │
//!   │ used       │           │ used       │           │ used       │           │
//!   │ next ──────┼───────────►            │           │ next: null │           │
//!   │ prev: null │         ◄─┼─ prev      │    ...    │            │           │
//!   └────────────┴───────────┴────────────┴───────────┴────────────┴───────────┘
//!   ▲                                                                         ▲
//!   head                                                          program break
//! ```
//!
//! Blocks are contiguous: each header's successor sits exactly
//! `header + size` bytes above it. Freed blocks are reused first-fit, and a
//! request that no single free block can hold may be satisfied by coalescing
//! a run of adjacent free blocks, forward (in `allocate` and `resize`) or
//! backward (in `resize`, moving the payload down). When the suffix of the
//! list becomes free, the data segment contracts back to the last used
//! block.
//!
//! Every header carries a magic sentinel that is validated on every access;
//! a corrupted sentinel aborts the process, because continuing with broken
//! metadata is unsafe.
//!
//! ## Crate Structure
//!
//! ```text
//!   brkalloc
//!   ├── brk        - program-break adapter (internal)
//!   ├── block      - block header, sentinel, list mutators (internal)
//!   ├── merge      - coalescing planner and executor (internal)
//!   └── heap       - global heap state and the public operations
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use brkalloc::{allocate, release, resize};
//!
//! unsafe {
//!     let p = allocate(64);
//!     assert!(!p.is_null());
//!
//!     p.write_bytes(0x2A, 64);
//!
//!     // Grows in place when a free neighbor can be absorbed.
//!     let p = resize(p, 128);
//!
//!     release(p);
//! }
//! ```
//!
//! ## Limitations
//!
//! - **No block splitting**: a reused block keeps its full capacity, so a
//!   small request can occupy a large free block until it is released again.
//! - **Natural alignment only**: payloads are aligned like the header
//!   itself (machine word), nothing stronger.
//! - **Single global lock**: operations are serialized; scalability under
//!   contention is not a goal.
//! - **Sole break user**: the heap assumes nothing else moves the program
//!   break while it owns blocks.
//! - **Unix-only**: requires `libc` and `sbrk` (POSIX systems).
//!
//! ## Safety
//!
//! This crate is inherently unsafe as it deals with raw memory management.
//! All allocation and deallocation operations require `unsafe` blocks, and
//! callers must uphold the usual rules: no use after release, releasing only
//! pointers this heap handed out, staying within the allocated size.

mod block;
mod brk;
mod heap;
mod merge;

pub use heap::{ALLOC_FAILED, allocate, allocation_size, header_size, release, resize, zero_allocate};

/// The heap (and the program break) is process-global state; tests that
/// touch either serialize on this lock.
#[cfg(test)]
pub(crate) static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
