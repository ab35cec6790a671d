//! Signal delivery engine
//!
//! Decides which pending signal is deliverable, builds the signal frame on
//! the right stack, and rewrites the interrupted context (or the syscall
//! register-save area) to enter the handler. Exactly one signal is
//! delivered per engine invocation; `sigreturn` chains to the next pending
//! one through [`handle_next_signal`].
//!
//! Delivery never happens while the interrupted context is inside LibOS or
//! PAL code; such deliveries are deferred to the syscall return path via
//! the per-thread deliver flag.

use super::default::direct_call_if_default;
use super::queue::{self, SigRecord};
use super::ucontext::{
    frame_of_ucontext, get_signal_stack, greg, user_csgsfs, xstate_size_of, UContext,
    UC_FP_XSTATE, UC_SIGCONTEXT_SS, UC_STRICT_RESTORE_SS,
};
use super::{
    get_sighandler, resolve_locked, sig, signal_name, SigDispatch, SigInfo, SigSet, SIGNAL_COUNT,
};
use crate::pal::PalContext;
use crate::tcb::{ShimTcb, TCB_FLAG_MAY_DELIVER_SIGNAL};
use crate::thread::{self, Thread, ThreadSigState};
use crate::{fpu, pal, tls, upcall};
use alloc::boxed::Box;
use core::sync::atomic::Ordering;

/// One signal picked for delivery.
struct Deliver {
    signo: u32,
    record: Box<SigRecord>,
    dispatch: SigDispatch,
}

/// Scan the pending queues in ascending signal order and pop the first
/// deliverable record. Ignored signals drain their whole queue on the way.
fn get_signal_to_deliver(thread: &Thread) -> Option<Deliver> {
    if thread.has_signal.load(Ordering::SeqCst) == 0 {
        return None;
    }

    let mask = thread.get_mask();
    for signo in 1..SIGNAL_COUNT as u32 {
        if mask.contains(signo) {
            continue;
        }
        let Some(record) = queue::fetch(thread, signo) else {
            continue;
        };
        let dispatch = get_sighandler(thread, signo);
        if dispatch == SigDispatch::Ignore {
            drop(record);
            while let Some(extra) = queue::fetch(thread, signo) {
                drop(extra);
            }
            if thread.has_signal.load(Ordering::SeqCst) == 0 {
                break;
            }
            continue;
        }
        return Some(Deliver {
            signo,
            record,
            dispatch,
        });
    }
    None
}

/// Write a full signal frame on the chosen stack and point `ctx` at the
/// handler. `ctx` must be a pure application context.
fn setup_sigframe(
    thread: &Thread,
    signo: u32,
    info: &SigInfo,
    ctx: &mut PalContext,
    handler: u64,
    restorer: u64,
) {
    let xstate_src = ctx.fpregs;
    let xstate_size = xstate_size_of(xstate_src);
    let altstack = thread.inner.lock().altstack;
    let (frame, user_xstate) = get_signal_stack(&altstack, ctx.rsp, xstate_size);

    unsafe {
        (*frame).restorer = restorer;
        (*frame).info = *info;

        let uc = &mut (*frame).uc;
        uc.uc_flags = UC_SIGCONTEXT_SS | UC_STRICT_RESTORE_SS;
        uc.uc_link = 0;
        uc.uc_stack = altstack;
        uc.uc_mcontext.gregs = *ctx.gregs();
        if xstate_size > 0 {
            core::ptr::copy_nonoverlapping(
                xstate_src as *const u8,
                user_xstate as *mut u8,
                xstate_size,
            );
            uc.uc_mcontext.fpregs = user_xstate as u64;
            if fpu::xstate_enabled() {
                uc.uc_flags |= UC_FP_XSTATE;
            }
        } else {
            uc.uc_mcontext.fpregs = 0;
        }
        // FIXME: the user signal mask should be reflected here; that needs
        // a peek primitive on the signal log and restore-on-return
        // discipline.
        uc.uc_sigmask = 0;
    }

    ctx.fpregs = core::ptr::null_mut();
    ctx.rsp = frame as u64;
    ctx.rip = handler;
    ctx.rdi = signo as u64;
    ctx.rsi = unsafe { core::ptr::addr_of!((*frame).info) } as u64;
    ctx.rdx = unsafe { core::ptr::addr_of!((*frame).uc) } as u64;
    ctx.rax = 0;

    log_debug!(
        "[SIGNAL] delivering {} to handler {:#x}, frame at {:#x}",
        signal_name(signo),
        handler,
        ctx.rsp
    );
}

/// Deliver one pending signal onto `ctx` if the context allows it.
///
/// With no context, or a context still inside LibOS/PAL code, the signal
/// stays queued and the deliver flag is raised for the syscall return path.
/// A `signo_hint` restricts the scan to one signal (the fault upcalls pass
/// the signal they just queued).
pub(crate) fn handle_signal_inner(
    tcb: &ShimTcb,
    signo_hint: Option<u32>,
    ctx: Option<&mut PalContext>,
) {
    let Some(ctx) = ctx else {
        tcb.set_flag(TCB_FLAG_MAY_DELIVER_SIGNAL);
        return;
    };
    if upcall::context_is_internal(ctx) || upcall::context_is_pal(ctx) {
        tcb.set_flag(TCB_FLAG_MAY_DELIVER_SIGNAL);
        return;
    }
    let Some(thread) = tcb.thread() else {
        return;
    };
    if thread.has_signal.load(Ordering::SeqCst) == 0 {
        return;
    }

    let deliver = match signo_hint {
        Some(signo) => {
            if thread.get_mask().contains(signo) {
                return;
            }
            let Some(record) = queue::fetch(thread, signo) else {
                return;
            };
            let dispatch = get_sighandler(thread, signo);
            Deliver {
                signo,
                record,
                dispatch,
            }
        }
        None => {
            let Some(deliver) = get_signal_to_deliver(thread) else {
                return;
            };
            deliver
        }
    };

    direct_call_if_default(deliver.dispatch, deliver.signo, &deliver.record.info);
    if let SigDispatch::User { handler, restorer } = deliver.dispatch {
        setup_sigframe(
            thread,
            deliver.signo,
            &deliver.record.info,
            ctx,
            handler,
            restorer,
        );
    }
    // Ignore: the record is simply dropped without delivery.
}

/// Queue a signal on the current thread and, when the preempt state allows,
/// deliver it right away onto `ctx`.
///
/// Does nothing before the application first runs or after the current
/// thread died.
pub fn deliver_signal(info: &SigInfo, ctx: Option<&mut PalContext>) {
    let Some(tcb) = tls::current_tcb() else {
        return;
    };
    let Some(thread) = tcb.thread() else {
        return;
    };
    if !thread.is_alive() {
        return;
    }

    let signo = info.si_signo as u32;
    if !super::is_valid_signal(signo) {
        return;
    }
    // Allocation failure silently drops the signal; a fault context is no
    // place to start killing the process over memory pressure.
    let Some(record) = SigRecord::try_alloc(*info) else {
        return;
    };

    let preempt = tcb.disable_preempt();
    if let Err(record) = queue::post(thread, signo, record) {
        log_warn!(
            "[SIGNAL] signal queue is full (TID = {}, SIG = {})",
            thread.tid,
            signo
        );
        drop(record);
    }
    // Even if this record was dropped, an earlier one of the same signal
    // may still be deliverable.
    if preempt <= 1 {
        handle_signal_inner(tcb, Some(signo), ctx);
    }
    tcb.enable_preempt();
}

/// Cross-thread enqueue. The caller holds `thread`'s lock and passes the
/// locked state in; `need_interrupt` wakes the target out of a blocking
/// LibOS call so it re-checks pending signals on its way back out.
pub fn append_signal(
    thread: &Thread,
    state: &mut ThreadSigState,
    signo: u32,
    info: Option<&SigInfo>,
    mut need_interrupt: bool,
) {
    if !super::is_valid_signal(signo) {
        return;
    }

    let dispatch = resolve_locked(state, signo);
    if dispatch == SigDispatch::Ignore {
        // An ignored, unmasked signal would be discarded at delivery anyway,
        // so drop it now instead of leaking it into the queue. SIGCHLD is
        // discardable even while masked.
        if !thread.get_mask().contains(signo) || signo == sig::SIGCHLD {
            return;
        }
        // Queued for a possible later sigaction change, but not worth a
        // wakeup.
        need_interrupt = false;
    }

    let payload = match info {
        Some(info) => *info,
        None => SigInfo::new(signo, super::SI_USER),
    };
    let Some(record) = SigRecord::try_alloc(payload) else {
        return;
    };

    match queue::post(thread, signo, record) {
        Ok(()) => {
            if need_interrupt {
                log_debug!("[SIGNAL] resuming thread {}", thread.tid);
                thread::wakeup(thread);
                pal::thread_resume(thread.pal_handle.load(Ordering::Acquire));
            }
        }
        Err(record) => {
            log_warn!(
                "[SIGNAL] signal queue is full (TID = {}, SIG = {})",
                thread.tid,
                signo
            );
            drop(record);
        }
    }
}

/// The current thread's blocked-signal mask.
pub fn get_sig_mask(thread: &Thread) -> SigSet {
    thread.get_mask()
}

/// Replace the blocked-signal mask; SIGKILL and SIGSTOP never stick.
pub fn set_sig_mask(thread: &Thread, set: SigSet) {
    thread.set_mask(set);
}

/// Voluntary pending-signal poll, called from LibOS safe points.
pub extern "C" fn handle_signal() {
    let Some(tcb) = tls::current_tcb() else {
        return;
    };
    let Some(thread) = tcb.thread() else {
        return;
    };
    // Fast path
    if thread.has_signal.load(Ordering::SeqCst) == 0 {
        return;
    }

    let preempt = tcb.disable_preempt();
    if preempt > 1 {
        log_debug!("[SIGNAL] delivery delayed ({})", preempt);
    } else {
        handle_signal_inner(tcb, None, None);
    }
    tcb.enable_preempt();
}

/// Maintain the deliver flag on syscall return.
///
/// Producers may queue concurrently, so the order is: clear, test, re-set.
/// A false positive only costs a no-op engine run; a lost flag would lose a
/// wakeup, and this ordering cannot lose one.
pub extern "C" fn handle_sysret_signal() {
    let Some(tcb) = tls::current_tcb() else {
        return;
    };
    let Some(thread) = tcb.thread() else {
        return;
    };
    tcb.clear_flag(TCB_FLAG_MAY_DELIVER_SIGNAL);
    if thread.has_signal.load(Ordering::SeqCst) != 0 {
        tcb.set_flag(TCB_FLAG_MAY_DELIVER_SIGNAL);
    }
}

/// Sysret-path delivery: called on the way back to the application with the
/// syscall result. When a signal is deliverable, synthesize its frame from
/// the register-save area and rewrite the save area to enter the handler;
/// the trampoline's register restore then does the rest. Returns the value
/// to put in rax: 0 when entering a handler, `syscall_ret` untouched
/// otherwise.
pub extern "C" fn deliver_signal_on_sysret(syscall_ret: u64) -> u64 {
    let Some(tcb) = tls::current_tcb() else {
        return syscall_ret;
    };
    tcb.clear_flag(TCB_FLAG_MAY_DELIVER_SIGNAL);
    let Some(thread) = tcb.thread() else {
        return syscall_ret;
    };

    // FIXME: sigsuspend, sigwait, sigwaitinfo, pselect and ppoll swap the
    // mask while blocking and restore it before we get here, so a signal
    // that was only unmasked during the block can be missed.
    let Some(deliver) = get_signal_to_deliver(thread) else {
        return syscall_ret;
    };

    direct_call_if_default(deliver.dispatch, deliver.signo, &deliver.record.info);
    let SigDispatch::User { handler, restorer } = deliver.dispatch else {
        return syscall_ret;
    };

    let regs_ptr = tcb.regs();
    debug_assert!(!regs_ptr.is_null());
    if regs_ptr.is_null() {
        return syscall_ret;
    }
    let regs = unsafe { &mut *regs_ptr };

    let xstate_size = fpu::xstate_size();
    let altstack = thread.inner.lock().altstack;
    let (frame, user_xstate) = get_signal_stack(&altstack, regs.rsp, xstate_size);

    unsafe {
        let frame = &mut *frame;
        frame.restorer = restorer;
        frame.info = deliver.record.info;

        let uc = &mut frame.uc;
        uc.uc_flags = UC_SIGCONTEXT_SS | UC_STRICT_RESTORE_SS;
        uc.uc_link = 0;
        uc.uc_stack = altstack;

        let gregs = &mut uc.uc_mcontext.gregs;
        gregs[greg::R8] = regs.r8;
        gregs[greg::R9] = regs.r9;
        gregs[greg::R10] = regs.r10;
        gregs[greg::R11] = regs.r11;
        gregs[greg::R12] = regs.r12;
        gregs[greg::R13] = regs.r13;
        gregs[greg::R14] = regs.r14;
        gregs[greg::R15] = regs.r15;
        gregs[greg::RDI] = regs.rdi;
        gregs[greg::RSI] = regs.rsi;
        gregs[greg::RBP] = regs.rbp;
        gregs[greg::RBX] = regs.rbx;
        gregs[greg::RDX] = regs.rdx;
        gregs[greg::RAX] = syscall_ret;
        gregs[greg::RCX] = regs.rcx;
        gregs[greg::RSP] = regs.rsp;
        gregs[greg::RIP] = regs.rip;
        gregs[greg::EFL] = regs.rflags;
        gregs[greg::CSGSFS] = user_csgsfs();
        gregs[greg::ERR] = deliver.record.info.si_errno as u64;
        gregs[greg::TRAPNO] = deliver.record.info.si_code as u64;
        gregs[greg::OLDMASK] = 0;
        gregs[greg::CR2] = deliver.record.info.si_addr();

        uc.uc_mcontext.fpregs = user_xstate as u64;
        core::ptr::write_bytes(user_xstate as *mut u8, 0, xstate_size);
        fpu::xstate_save(user_xstate);
        if fpu::xstate_enabled() {
            uc.uc_flags |= UC_FP_XSTATE;
        }

        // FIXME: empty mask, same gap as the interrupted-context path.
        uc.uc_sigmask = 0;
    }

    drop(deliver.record);

    // Enter the handler with a clean FP unit.
    fpu::xstate_reset();
    regs.rsp = frame as u64;
    regs.rip = handler;
    regs.rdi = deliver.signo as u64;
    regs.rsi = unsafe { &(*frame).info as *const SigInfo as u64 };
    regs.rdx = unsafe { &(*frame).uc as *const UContext as u64 };
    0
}

/// Chain the next pending signal during `sigreturn`, reusing the existing
/// frame. Returns 1 when the save area now enters another handler, 0 when
/// `sigreturn` should complete normally.
pub extern "C" fn handle_next_signal(user_uc: *mut UContext) -> i32 {
    let Some(tcb) = tls::current_tcb() else {
        return 0;
    };
    let Some(thread) = tcb.thread() else {
        return 0;
    };
    let Some(deliver) = get_signal_to_deliver(thread) else {
        return 0;
    };

    direct_call_if_default(deliver.dispatch, deliver.signo, &deliver.record.info);
    let SigDispatch::User { handler, restorer } = deliver.dispatch else {
        return 0;
    };

    let regs_ptr = tcb.regs();
    debug_assert!(!regs_ptr.is_null());
    if regs_ptr.is_null() {
        return 0;
    }
    let regs = unsafe { &mut *regs_ptr };

    let frame = unsafe { frame_of_ucontext(user_uc) };
    unsafe {
        (*frame).restorer = restorer;
        (*frame).info = deliver.record.info;
        regs.rsp = frame as u64;
        regs.rip = handler;
        regs.rdi = deliver.signo as u64;
        regs.rsi = &(*frame).info as *const SigInfo as u64;
        regs.rdx = &(*frame).uc as *const UContext as u64;
    }
    1
}

/// Drain every queue on thread exit. Terminate-class defaults still fire
/// (the thread is going away regardless); everything else is discarded.
pub fn handle_exit_signal() {
    let Some(thread) = thread::current() else {
        return;
    };
    while thread.has_signal.load(Ordering::SeqCst) != 0 {
        for signo in 1..SIGNAL_COUNT as u32 {
            while let Some(record) = queue::fetch(&thread, signo) {
                if !thread.get_mask().contains(signo) {
                    let dispatch = get_sighandler(&thread, signo);
                    direct_call_if_default(dispatch, signo, &record.info);
                }
                drop(record);
            }
        }
    }
}
