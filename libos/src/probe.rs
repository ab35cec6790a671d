//! User-memory probes
//!
//! `test_user_memory` and `test_user_string` decide whether a user-supplied
//! buffer is addressable before a syscall touches it, so the syscall layer
//! can fail with EFAULT the way applications expect.
//!
//! Two strategies share the per-thread test range on the TCB:
//!
//! - touch-and-trap: publish the watched range plus a continuation address,
//!   then touch one byte per page; the memory-fault upcall spots the active
//!   range and lands the thread on the continuation with `has_fault` set.
//! - VMA traversal: on enclave PALs fault addresses are not reliable, so
//!   addressability is answered from the VMA table without touching memory.
//!
//! At most one probe can be active per thread; a probe cannot be cancelled,
//! but any legitimate fault inside its range aborts it.

use crate::{pal, tls, vma, PAGE_SIZE};
use core::arch::asm;
use core::sync::atomic::Ordering;
use x86_64::{align_up, VirtAddr};

/// Exclusive upper bound of application addresses.
pub const USER_ADDRESS_TOP: u64 = 0x0000_7fff_ffff_f000;

/// Basic plausibility check on `[addr, addr + size)`: non-null, canonical,
/// no wraparound, below the user ceiling.
pub(crate) fn access_ok(addr: u64, size: u64) -> bool {
    if addr == 0 {
        return false;
    }
    let Some(end) = addr.checked_add(size) else {
        return false;
    };
    VirtAddr::try_new(addr).is_ok() && end <= USER_ADDRESS_TOP
}

/// Is `[addr, addr + size)` readable (or writable, with `write`)?
///
/// Returns `true` when the range faults. A zero-size range never faults and
/// touches no thread state.
pub fn test_user_memory(addr: u64, size: u64, write: bool) -> bool {
    if size == 0 {
        return false;
    }
    if !access_ok(addr, size) {
        return true;
    }
    if pal::is_enclave() {
        return probe_by_vma(addr, size);
    }
    probe_by_touch(addr, size, write)
}

/// Enclave path: addressable iff the whole range is covered by mappings.
pub(crate) fn probe_by_vma(addr: u64, size: u64) -> bool {
    !vma::is_in_adjacent_vmas(addr, size)
}

fn probe_by_touch(addr: u64, size: u64, write: bool) -> bool {
    let Some(tcb) = tls::current_tcb() else {
        // No TCB to anchor the fault continuation; claim a fault rather
        // than touch memory unprotected.
        return true;
    };

    tcb.disable_preempt();
    debug_assert!(!tcb.test_range.is_active());
    let end = addr + size - 1;
    tcb.test_range.has_fault.store(false, Ordering::Relaxed);
    tcb.test_range.start.store(addr, Ordering::Relaxed);
    tcb.test_range.end.store(end, Ordering::Release);

    // The continuation address is published from inside the block, before
    // the first touch; a fault anywhere in the loop resumes at `2:`.
    unsafe {
        asm!(
            "lea {tmp}, [rip + 2f]",
            "mov [{cont}], {tmp}",
            "mov {cur}, {start}",
            "3:",
            "cmp {cur}, {end}",
            "ja 2f",
            "mov {b}, byte ptr [{cur}]",
            "test {w}, {w}",
            "jz 4f",
            "mov byte ptr [{cur}], {b}",
            "4:",
            "add {cur}, {page}",
            "and {cur}, {pagemask}",
            "jmp 3b",
            "2:",
            cont = in(reg) tcb.test_range.cont_addr.as_ptr(),
            start = in(reg) addr,
            end = in(reg) end,
            w = in(reg) write as u64,
            page = in(reg) PAGE_SIZE,
            pagemask = in(reg) !(PAGE_SIZE - 1),
            tmp = out(reg) _,
            cur = out(reg) _,
            b = out(reg_byte) _,
        );
    }

    let has_fault = tcb.test_range.has_fault.load(Ordering::Acquire);
    tcb.test_range.clear();
    tcb.enable_preempt();
    has_fault
}

/// Is the NUL-terminated string at `addr` readable?
///
/// Returns `true` when the string faults before a terminator is found. The
/// scan is bounded page by page so it never reads past the page a fault
/// would have hit.
pub fn test_user_string(addr: u64) -> bool {
    if !access_ok(addr, 1) {
        return true;
    }
    if pal::is_enclave() {
        return string_probe_by_vma(addr);
    }
    string_probe_by_touch(addr)
}

/// Enclave path: verify addressability page chunk by page chunk, only then
/// scan the chunk for the terminator.
pub(crate) fn string_probe_by_vma(mut addr: u64) -> bool {
    let mut next = align_up(addr + 1, PAGE_SIZE);
    loop {
        let maxlen = next - addr;
        if !access_ok(addr, maxlen) || !vma::is_in_adjacent_vmas(addr, maxlen) {
            return true;
        }
        let chunk = unsafe { core::slice::from_raw_parts(addr as *const u8, maxlen as usize) };
        if chunk.iter().any(|&b| b == 0) {
            return false;
        }
        addr = next;
        next = align_up(addr + 1, PAGE_SIZE);
    }
}

fn string_probe_by_touch(addr: u64) -> bool {
    let Some(tcb) = tls::current_tcb() else {
        return true;
    };

    tcb.disable_preempt();
    debug_assert!(!tcb.test_range.is_active());
    tcb.test_range.has_fault.store(false, Ordering::Relaxed);

    // The watched range tracks the page being scanned; `found` leaves the
    // block as 1 on a terminator, 0 on a fault or on running out of user
    // address space.
    let found: u64;
    unsafe {
        asm!(
            "lea {tmp}, [rip + 2f]",
            "mov [{cont}], {tmp}",
            "mov {cur}, {start}",
            "5:",
            "cmp {cur}, {top}",
            "jae 2f",
            "mov [{tr_start}], {cur}",
            "mov {tmp}, {cur}",
            "or {tmp}, {pageoff}",
            "mov [{tr_end}], {tmp}",
            "6:",
            "mov {b}, byte ptr [{cur}]",
            "test {b}, {b}",
            "jz 7f",
            "add {cur}, 1",
            "test {cur}, {pageoff}",
            "jnz 6b",
            "jmp 5b",
            "7:",
            "mov {found}, 1",
            "jmp 8f",
            "2:",
            "mov {found}, 0",
            "8:",
            cont = in(reg) tcb.test_range.cont_addr.as_ptr(),
            tr_start = in(reg) tcb.test_range.start.as_ptr(),
            tr_end = in(reg) tcb.test_range.end.as_ptr(),
            start = in(reg) addr,
            top = in(reg) USER_ADDRESS_TOP,
            pageoff = in(reg) PAGE_SIZE - 1,
            found = out(reg) found,
            tmp = out(reg) _,
            cur = out(reg) _,
            b = out(reg_byte) _,
        );
    }

    let has_fault = tcb.test_range.has_fault.load(Ordering::Acquire) || found == 0;
    tcb.test_range.clear();
    tcb.enable_preempt();
    has_fault
}
