//! Thread bookkeeping for signal delivery
//!
//! The registry tracks every LibOS-managed thread with the state the signal
//! core needs: pending-signal rings, the blocked-signal mask, dispositions
//! and the alternate stack under the per-thread lock, and liveness for the
//! process-exit coordination.

use crate::signal::queue::SignalLog;
use crate::signal::{SigAction, SigAltStack, SigSet, SIGNAL_COUNT};
use crate::tcb::ShimTcb;
use crate::{pal, tls};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use lazy_static::lazy_static;
use spin::{Mutex, RwLock};

/// Thread ID type
pub type Tid = u32;

static NEXT_TID: AtomicU32 = AtomicU32::new(1);

/// Signal state guarded by the per-thread lock.
pub struct ThreadSigState {
    /// Installed `sigaction`s, indexed by `signo - 1`; `None` means default.
    pub dispositions: [Option<SigAction>; SIGNAL_COUNT],
    /// Alternate signal stack.
    pub altstack: SigAltStack,
}

impl Default for ThreadSigState {
    fn default() -> Self {
        ThreadSigState {
            dispositions: [None; SIGNAL_COUNT],
            altstack: SigAltStack::default(),
        }
    }
}

/// One LibOS-managed thread.
pub struct Thread {
    pub tid: Tid,
    /// Thread-group (process) ID.
    pub tgid: Tid,
    /// LibOS helper thread; never receives user signals.
    internal: bool,
    /// Opaque PAL handle used to resume the thread from a peer.
    pub pal_handle: AtomicU64,
    alive: AtomicBool,
    sleeping: AtomicBool,
    /// Number of records currently queued across all signals.
    pub(crate) has_signal: AtomicI64,
    pub(crate) log: SignalLog,
    /// Blocked-signal mask; reads are lock-free on the delivery path.
    mask: AtomicU64,
    /// Dispositions and alternate stack.
    pub inner: Mutex<ThreadSigState>,
    tcb: Box<ShimTcb>,
}

lazy_static! {
    static ref THREADS: RwLock<BTreeMap<Tid, Arc<Thread>>> = RwLock::new(BTreeMap::new());
}

impl Thread {
    /// Create and register a thread. `tgid == 0` starts a new thread group.
    pub fn new(tgid: Tid, internal: bool) -> Arc<Thread> {
        let tid = NEXT_TID.fetch_add(1, Ordering::SeqCst);
        let thread = Arc::new(Thread {
            tid,
            tgid: if tgid == 0 { tid } else { tgid },
            internal,
            pal_handle: AtomicU64::new(0),
            alive: AtomicBool::new(true),
            sleeping: AtomicBool::new(false),
            has_signal: AtomicI64::new(0),
            log: SignalLog::new(),
            mask: AtomicU64::new(0),
            inner: Mutex::new(ThreadSigState::default()),
            tcb: Box::new(ShimTcb::new(tid)),
        });
        // The TCB needs a back pointer once the thread has its final address.
        thread.tcb.set_thread(Arc::as_ptr(&thread) as *mut Thread);
        thread.tcb.bind();
        THREADS.write().insert(tid, thread.clone());
        thread
    }

    pub fn tcb(&self) -> &ShimTcb {
        &self.tcb
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn set_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleeping.load(Ordering::Acquire)
    }

    pub fn set_sleeping(&self, sleeping: bool) {
        self.sleeping.store(sleeping, Ordering::Release);
    }

    pub fn get_mask(&self) -> SigSet {
        SigSet::from_raw(self.mask.load(Ordering::Acquire))
    }

    /// Replace the blocked-signal mask. SIGKILL and SIGSTOP can never be
    /// blocked, whatever the caller asked for.
    pub fn set_mask(&self, set: SigSet) {
        self.mask.store(set.sanitized().raw(), Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn new_for_test() -> Arc<Thread> {
        Thread::new(0, false)
    }
}

/// Look up a registered thread.
pub fn get(tid: Tid) -> Option<Arc<Thread>> {
    THREADS.read().get(&tid).cloned()
}

/// Drop a thread from the registry.
pub fn unregister(tid: Tid) {
    THREADS.write().remove(&tid);
}

/// The thread the calling OS thread is executing.
pub fn current() -> Option<Arc<Thread>> {
    let tcb = tls::current_tcb()?;
    get(tcb.tid())
}

pub fn cur_thread_is_alive() -> bool {
    current().map(|t| t.is_alive()).unwrap_or(false)
}

/// Whether `tid` names a LibOS helper thread.
pub fn is_internal_tid(tid: Tid) -> bool {
    get(tid).map(|t| t.is_internal()).unwrap_or(false)
}

/// Bind the calling OS thread to `thread`.
///
/// # Safety
///
/// The caller must keep `thread` registered until the binding is cleared,
/// and on non-test builds the PAL must have pointed the gs base at the
/// thread's TCB.
pub unsafe fn adopt(thread: &Arc<Thread>) {
    unsafe { tls::install(thread.tcb() as *const ShimTcb) }
}

/// Wake a thread blocked inside a LibOS call so it re-checks its pending
/// signals on the way out.
pub fn wakeup(thread: &Thread) {
    thread.set_sleeping(false);
}

/// All live threads of one thread group.
pub fn threads_in_group(tgid: Tid) -> Vec<Arc<Thread>> {
    THREADS
        .read()
        .values()
        .filter(|t| t.tgid == tgid && t.is_alive())
        .cloned()
        .collect()
}

/// Is any *other* thread of `cur`'s group still alive?
pub fn check_last_thread(cur: &Thread) -> bool {
    THREADS
        .read()
        .values()
        .any(|t| t.tgid == cur.tgid && t.tid != cur.tid && t.is_alive())
}

/// Queue `signo` on thread `tid` and wake it out of any blocking LibOS
/// call.
pub fn send_signal(tid: Tid, signo: u32, info: Option<&crate::signal::SigInfo>) -> Result<(), i32> {
    if !crate::signal::is_valid_signal(signo) {
        return Err(crate::errno::EINVAL);
    }
    let thread = get(tid).ok_or(crate::errno::ESRCH)?;
    if !thread.is_alive() {
        return Err(crate::errno::ESRCH);
    }
    let mut state = thread.inner.lock();
    crate::signal::deliver::append_signal(&thread, &mut state, signo, info, true);
    Ok(())
}

/// Queue `signo` on every thread of the group and wake them all.
pub fn kill_process_group(tgid: Tid, signo: u32) {
    let targets = threads_in_group(tgid);
    for thread in targets {
        let mut state = thread.inner.lock();
        crate::signal::deliver::append_signal(&thread, &mut state, signo, None, true);
    }
}

/// Kill the current thread; when it is the last one of its group, exit the
/// process with a wait-style status built from `code` and `term_signal`
/// (core-dump bit included when the caller set it).
pub fn thread_or_process_exit(code: i32, term_signal: u32) -> ! {
    let status = (code << 8) | (term_signal as i32 & 0xff);
    let Some(cur) = current() else {
        pal::process_exit(status);
    };
    cur.set_dead();
    if !check_last_thread(&cur) {
        pal::process_exit(status);
    }
    // Not the last thread: this one just stops running.
    loop {
        pal::thread_yield();
        core::hint::spin_loop();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A thread adopted by the calling test thread; drops clean up TLS and
    /// the registry so tests stay independent.
    pub struct Adopted(pub Arc<Thread>);

    impl Drop for Adopted {
        fn drop(&mut self) {
            tls::clear();
            unregister(self.0.tid);
        }
    }

    pub fn adopt_new() -> Adopted {
        let thread = Thread::new(0, false);
        unsafe { adopt(&thread) };
        Adopted(thread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::sig;

    #[test]
    fn test_mask_assignment_clears_unmaskable() {
        let t = Thread::new_for_test();
        let mut set = SigSet::EMPTY;
        set.add(sig::SIGKILL);
        set.add(sig::SIGSTOP);
        set.add(sig::SIGUSR1);
        t.set_mask(set);
        let mask = t.get_mask();
        assert!(!mask.contains(sig::SIGKILL));
        assert!(!mask.contains(sig::SIGSTOP));
        assert!(mask.contains(sig::SIGUSR1));
        unregister(t.tid);
    }

    #[test]
    fn test_registry_and_adoption() {
        let adopted = testing::adopt_new();
        let tid = adopted.0.tid;
        assert!(get(tid).is_some());
        assert!(cur_thread_is_alive());
        let cur = current().unwrap();
        assert_eq!(cur.tid, tid);
        assert!(!is_internal_tid(tid));
        drop(adopted);
        assert!(get(tid).is_none());
        assert!(current().is_none());
    }

    #[test]
    fn test_group_queries() {
        let a = Thread::new(0, false);
        let b = Thread::new(a.tgid, false);
        assert_eq!(threads_in_group(a.tgid).len(), 2);
        assert!(check_last_thread(&a));
        b.set_dead();
        assert!(!check_last_thread(&a));
        unregister(a.tid);
        unregister(b.tid);
    }

    #[test]
    fn test_internal_thread_flag() {
        let helper = Thread::new(0, true);
        assert!(is_internal_tid(helper.tid));
        unregister(helper.tid);
    }

    #[test]
    fn test_send_signal_routing() {
        use crate::errno;
        use crate::signal::SigInfo;
        use core::sync::atomic::Ordering;

        assert_eq!(send_signal(0, sig::SIGUSR1, None), Err(errno::ESRCH));

        let t = Thread::new_for_test();
        assert_eq!(send_signal(t.tid, 0, None), Err(errno::EINVAL));
        assert_eq!(send_signal(t.tid, 99, None), Err(errno::EINVAL));

        // A default-terminate signal queues and wakes the target.
        t.set_sleeping(true);
        let info = SigInfo::user(sig::SIGUSR1, 7);
        send_signal(t.tid, sig::SIGUSR1, Some(&info)).unwrap();
        assert!(!t.is_sleeping());
        assert_eq!(t.has_signal.load(Ordering::SeqCst), 1);

        t.set_dead();
        assert_eq!(send_signal(t.tid, sig::SIGUSR1, None), Err(errno::ESRCH));
        unregister(t.tid);
    }
}
