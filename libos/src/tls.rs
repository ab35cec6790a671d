//! Current-thread TCB lookup
//!
//! On a live thread the PAL points the gs segment base at the thread's
//! [`ShimTcb`](crate::tcb::ShimTcb) before the thread first enters LibOS
//! code, so the lookup is a single `gs:[0]` load and works from any context,
//! including a fault upcall. The hosted test build substitutes an ordinary
//! thread-local slot.

use crate::tcb::ShimTcb;

#[cfg(not(test))]
mod imp {
    use super::ShimTcb;
    use core::arch::asm;

    pub fn current_raw() -> *const ShimTcb {
        let tcb: usize;
        // self_ptr lives at offset 0 of the TCB, which is the gs base.
        unsafe {
            asm!("mov {}, qword ptr gs:[0]", out(reg) tcb, options(nostack, readonly, preserves_flags));
        }
        tcb as *const ShimTcb
    }

    /// The PAL installs the gs base itself; binding the TCB's self pointer
    /// is all that is left to do here.
    pub unsafe fn install(tcb: *const ShimTcb) {
        unsafe { (*tcb).bind() };
    }

    pub fn clear() {}
}

#[cfg(test)]
mod imp {
    use super::ShimTcb;
    use core::cell::Cell;

    std::thread_local! {
        static CURRENT: Cell<usize> = const { Cell::new(0) };
    }

    pub fn current_raw() -> *const ShimTcb {
        CURRENT.with(|slot| slot.get()) as *const ShimTcb
    }

    pub unsafe fn install(tcb: *const ShimTcb) {
        unsafe { (*tcb).bind() };
        CURRENT.with(|slot| slot.set(tcb as usize));
    }

    pub fn clear() {
        CURRENT.with(|slot| slot.set(0));
    }
}

/// The current thread's TCB, or `None` before the thread is adopted.
pub fn current_tcb() -> Option<&'static ShimTcb> {
    let ptr = imp::current_raw();
    if ptr.is_null() {
        None
    } else {
        // TCBs are owned by the thread registry and outlive any borrow taken
        // on the thread they belong to.
        Some(unsafe { &*ptr })
    }
}

/// Adopt `tcb` as the current thread's control block.
///
/// # Safety
///
/// `tcb` must stay valid until [`clear`] is called on this thread (or the
/// thread exits), and the PAL must have pointed the gs base at it on
/// non-test builds.
pub unsafe fn install(tcb: *const ShimTcb) {
    unsafe { imp::install(tcb) }
}

/// Drop the current thread's TCB binding.
pub fn clear() {
    imp::clear()
}
