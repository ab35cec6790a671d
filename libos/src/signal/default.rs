//! Default terminate actions
//!
//! Terminate-class default dispositions kill the thread or the whole
//! process. They never return, so the delivery engine calls them inline
//! instead of building a signal frame ("direct call").
//!
//! No core-dump file is written; core-class signals only flag the dump bit
//! in the wait-style exit status.

use super::{sig, signal_name, SigDispatch, SigInfo};
use crate::{pal, thread};
use core::sync::atomic::{AtomicBool, Ordering};

/// Core-dump bit in a wait-style exit status.
pub const WCOREDUMP_BIT: u32 = 0x80;

/// Invoke a terminate-class dispatch inline. Any other dispatch is left to
/// the caller.
pub(crate) fn direct_call_if_default(dispatch: SigDispatch, signo: u32, info: &SigInfo) {
    match dispatch {
        SigDispatch::Terminate => sighandler_kill(signo, info),
        SigDispatch::TerminateCoreDump => sighandler_core(signo, info),
        _ => {}
    }
}

/// Default terminate handler.
///
/// SIGABRT always takes the whole process down; SIGTERM and SIGINT do so
/// only when sent by the host itself (`si_pid == 0`). Everything else kills
/// just the current thread, with the process exiting when it was the last
/// one.
pub(crate) fn sighandler_kill(signo: u32, info: &SigInfo) -> ! {
    let plain = signo & !WCOREDUMP_BIT;
    log_debug!("[SIGNAL] killed by {}", signal_name(plain));

    if plain == sig::SIGABRT
        || (info.si_pid() == 0 && (plain == sig::SIGTERM || plain == sig::SIGINT))
    {
        // If several terminating signals arrive at once, only the first
        // thread past this point runs the group teardown; the rest just
        // stop making progress until SIGKILL reaps them.
        static FIRST: AtomicBool = AtomicBool::new(false);
        if FIRST.swap(true, Ordering::SeqCst) {
            loop {
                pal::thread_yield();
                core::hint::spin_loop();
            }
        }

        if let Some(cur) = thread::current() {
            thread::kill_process_group(cur.tgid, sig::SIGKILL);
            // The winner sets the process exit status, so it must be the
            // last thread out.
            while thread::check_last_thread(&cur) {
                pal::thread_yield();
            }
        }
    }

    thread::thread_or_process_exit(0, signo)
}

/// Terminate with the core-dump bit set in the exit status.
pub(crate) fn sighandler_core(signo: u32, info: &SigInfo) -> ! {
    sighandler_kill(signo | WCOREDUMP_BIT, info)
}
