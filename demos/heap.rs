use std::{io::Read, ptr};

use brkalloc::{allocate, allocation_size, header_size, release, resize, zero_allocate};
use libc::sbrk;

/// Waits until the user presses ENTER.
/// Useful when you want to inspect memory state with tools like `pmap`,
/// `htop`, `gdb`, or just visually track how the program break moves.
fn block_until_enter_pressed() {
  println!("\n>>> Press ENTER to continue...");
  let _ = std::io::stdin().bytes().next();
}

/// Prints the current program break using `sbrk(0)`.
/// The program break is the upper boundary of the heap managed via brk/sbrk.
fn print_program_break(label: &str) {
  println!(
    "[{}] PID = {}, program break (sbrk(0)) = {:?}",
    label,
    std::process::id(),
    unsafe { sbrk(0) },
  );
}

fn main() {
  println!("Header footprint: {} bytes", header_size());

  unsafe {
    // Initial heap state
    print_program_break("start");
    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 1) Allocate 64 bytes and write into them. The break moves up by
    //    exactly header + 64.
    // --------------------------------------------------------------------
    let first = allocate(64);
    println!("\n[1] Allocate 64 bytes -> {:?}", first);
    ptr::write_bytes(first, 0xAB, 64);
    print_program_break("after first alloc");
    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 2) Allocate a second block so the first one is not the list tail.
    // --------------------------------------------------------------------
    let second = allocate(32);
    println!("\n[2] Allocate 32 bytes -> {:?}", second);
    print_program_break("after second alloc");
    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 3) Release the first block and allocate again. The freed block is
    //    reused first-fit; a smaller request still gets its full capacity.
    // --------------------------------------------------------------------
    release(first);
    println!("\n[3] Released the first block");

    let reused = allocate(16);
    println!(
      "[3] Allocate 16 bytes -> {:?} ({})",
      reused,
      if reused == first {
        "reused the freed block"
      } else {
        "allocated somewhere else"
      }
    );
    println!("[3] Capacity of the reused block: {}", allocation_size(reused));
    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 4) Forward coalescing: free two adjacent blocks, then ask for more
    //    than either can hold on its own.
    // --------------------------------------------------------------------
    let a = allocate(32);
    let b = allocate(32);
    let guard = allocate(32);
    release(a);
    release(b);

    let big = allocate(70);
    println!(
      "\n[4] Allocate 70 bytes after freeing two 32-byte neighbors -> {:?}",
      big
    );
    println!(
      "[4] big == a? {} (capacity {})",
      big == a,
      allocation_size(big)
    );
    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 5) Resize in place: the reused block still has spare capacity from
    //    its 64-byte past, so the pointer does not move.
    // --------------------------------------------------------------------
    let message = b"hello\0";
    ptr::copy_nonoverlapping(message.as_ptr(), reused, message.len());
    let grown = resize(reused, 40);
    println!("\n[5] Resize 16 -> 40 bytes: {:?} -> {:?}", reused, grown);
    println!(
      "[5] First bytes after resize: {:?}",
      std::slice::from_raw_parts(grown, message.len())
    );
    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 6) Zeroed allocation.
    // --------------------------------------------------------------------
    let zeroed = zero_allocate(8, 8);
    println!("\n[6] zero_allocate(8, 8) -> {:?}", zeroed);
    println!(
      "[6] First 8 bytes: {:?}",
      std::slice::from_raw_parts(zeroed, 8)
    );
    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 7) Release everything. Once the whole suffix of the list is free the
    //    break contracts back to where we started.
    // --------------------------------------------------------------------
    release(zeroed);
    release(grown);
    release(big);
    release(guard);
    release(second);
    println!("\n[7] Released every allocation");
    print_program_break("end");
  }
}
