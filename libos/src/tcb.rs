//! Per-thread LibOS control block
//!
//! The TCB carries everything the signal core needs to reach from a fault
//! upcall or from assembly: the deliver-pending flag, the preempt counter,
//! the register-save area filled by the syscall entry path, and the probe
//! test range. All fields are atomics; upcalls interrupt the owning thread
//! at arbitrary points and peer threads flip the deliver flag remotely.

use crate::sysret::ShimRegs;
use crate::thread::Thread;
use core::sync::atomic::{
    AtomicBool, AtomicI64, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering,
};

/// A queued signal may be deliverable; checked on the syscall return path.
pub const TCB_FLAG_MAY_DELIVER_SIGNAL: u64 = 1 << 0;

/// Address range watched by an active memory probe.
///
/// While `cont_addr` is non-zero, the memory-fault upcall redirects any
/// fault inside `[start, end]` to `cont_addr` instead of raising a signal.
#[repr(C)]
#[derive(Default)]
pub struct TestRange {
    pub start: AtomicU64,
    pub end: AtomicU64,
    pub cont_addr: AtomicU64,
    pub has_fault: AtomicBool,
}

impl TestRange {
    pub fn is_active(&self) -> bool {
        self.cont_addr.load(Ordering::Acquire) != 0
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.start.load(Ordering::Acquire) <= addr && addr <= self.end.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.cont_addr.store(0, Ordering::Release);
        self.start.store(0, Ordering::Relaxed);
        self.end.store(0, Ordering::Relaxed);
        self.has_fault.store(false, Ordering::Release);
    }
}

/// LibOS thread control block.
///
/// On a live thread the gs segment base points at this structure, so the
/// assembly paths address fields as `gs:[offset]`. `self_ptr` must stay the
/// first field: `gs:[0]` is how the TCB finds itself.
#[repr(C)]
pub struct ShimTcb {
    self_ptr: AtomicUsize,
    flags: AtomicU64,
    preempt: AtomicI64,
    regs: AtomicPtr<ShimRegs>,
    tmp_rip: AtomicU64,
    pub test_range: TestRange,
    tid: AtomicU32,
    tp: AtomicPtr<Thread>,
}

/// Field offsets for the gs-relative assembly paths.
pub(crate) const TCB_OFF_FLAGS: usize = core::mem::offset_of!(ShimTcb, flags);
pub(crate) const TCB_OFF_REGS: usize = core::mem::offset_of!(ShimTcb, regs);
pub(crate) const TCB_OFF_TMP_RIP: usize = core::mem::offset_of!(ShimTcb, tmp_rip);

impl ShimTcb {
    pub fn new(tid: u32) -> Self {
        ShimTcb {
            self_ptr: AtomicUsize::new(0),
            flags: AtomicU64::new(0),
            preempt: AtomicI64::new(0),
            regs: AtomicPtr::new(core::ptr::null_mut()),
            tmp_rip: AtomicU64::new(0),
            test_range: TestRange::default(),
            tid: AtomicU32::new(tid),
            tp: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Record the TCB's own address; must be called once the TCB has its
    /// final location (it never moves afterwards).
    pub(crate) fn bind(&self) {
        self.self_ptr
            .store(self as *const ShimTcb as usize, Ordering::Release);
    }

    pub fn tid(&self) -> u32 {
        self.tid.load(Ordering::Relaxed)
    }

    pub fn set_flag(&self, flag: u64) {
        self.flags.fetch_or(flag, Ordering::SeqCst);
    }

    pub fn clear_flag(&self, flag: u64) {
        self.flags.fetch_and(!flag, Ordering::SeqCst);
    }

    pub fn test_flag(&self, flag: u64) -> bool {
        self.flags.load(Ordering::SeqCst) & flag != 0
    }

    /// Enter a no-delivery section. Returns the post-increment depth; the
    /// delivery engine may only run when it is <= 1.
    pub fn disable_preempt(&self) -> i64 {
        self.preempt.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn enable_preempt(&self) {
        self.preempt.fetch_sub(1, Ordering::SeqCst);
    }

    /// Register-save area published by the syscall entry path, or null when
    /// the thread is executing application code.
    pub fn regs(&self) -> *mut ShimRegs {
        self.regs.load(Ordering::Acquire)
    }

    pub fn set_regs(&self, regs: *mut ShimRegs) {
        self.regs.store(regs, Ordering::Release);
    }

    pub fn take_regs(&self) -> *mut ShimRegs {
        self.regs.swap(core::ptr::null_mut(), Ordering::AcqRel)
    }

    pub fn tmp_rip(&self) -> u64 {
        self.tmp_rip.load(Ordering::Acquire)
    }

    pub fn set_tmp_rip(&self, rip: u64) {
        self.tmp_rip.store(rip, Ordering::Release);
    }

    pub(crate) fn set_thread(&self, thread: *mut Thread) {
        self.tp.store(thread, Ordering::Release);
    }

    /// The owning thread, or `None` before the thread is fully set up.
    pub fn thread(&self) -> Option<&Thread> {
        let ptr = self.tp.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // The registry keeps the Thread alive for as long as its TCB is
            // reachable through TLS.
            Some(unsafe { &*ptr })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preempt_nesting() {
        let tcb = ShimTcb::new(1);
        assert_eq!(tcb.disable_preempt(), 1);
        assert_eq!(tcb.disable_preempt(), 2);
        tcb.enable_preempt();
        assert_eq!(tcb.disable_preempt(), 2);
        tcb.enable_preempt();
        tcb.enable_preempt();
        assert_eq!(tcb.disable_preempt(), 1);
        tcb.enable_preempt();
    }

    #[test]
    fn test_flags() {
        let tcb = ShimTcb::new(1);
        assert!(!tcb.test_flag(TCB_FLAG_MAY_DELIVER_SIGNAL));
        tcb.set_flag(TCB_FLAG_MAY_DELIVER_SIGNAL);
        assert!(tcb.test_flag(TCB_FLAG_MAY_DELIVER_SIGNAL));
        tcb.clear_flag(TCB_FLAG_MAY_DELIVER_SIGNAL);
        assert!(!tcb.test_flag(TCB_FLAG_MAY_DELIVER_SIGNAL));
    }

    #[test]
    fn test_test_range_bounds() {
        let range = TestRange::default();
        assert!(!range.is_active());
        range.start.store(0x1000, Ordering::Relaxed);
        range.end.store(0x1fff, Ordering::Relaxed);
        range.cont_addr.store(0xabc, Ordering::Release);
        assert!(range.is_active());
        assert!(range.contains(0x1000));
        assert!(range.contains(0x1fff));
        assert!(!range.contains(0x2000));
        range.clear();
        assert!(!range.is_active());
        assert!(!range.has_fault.load(Ordering::Relaxed));
    }
}
