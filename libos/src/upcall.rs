//! Fault upcall router
//!
//! One entry point per PAL event. Each upcall classifies its origin first:
//! faults raised by an internal thread, or with the interrupted IP inside
//! LibOS or PAL text, are fatal diagnostics, never user signals. User
//! faults turn into queued signals via the delivery engine; quit, suspend
//! and resume notifications first rewind an interrupted syscall-return
//! trampoline so delivery lands on a pure application context.

use crate::pal::{self, PalContext, PalEvent, ERR_WRITE_ACCESS};
use crate::signal::deliver::{deliver_signal, handle_signal_inner};
use crate::signal::{
    sig, SigInfo, BUS_ADRERR, FPE_INTDIV, ILL_ILLOPC, SEGV_ACCERR, SEGV_MAPERR,
};
use crate::vma::{self, VmaFlags, VmaProt};
use crate::{sysret, thread, tls};
use core::sync::atomic::Ordering;

/// Register the six upcalls with the PAL.
pub fn init_signal() -> Result<(), i32> {
    pal::set_exception_handler(PalEvent::ArithmeticError, arithmetic_error_upcall)?;
    pal::set_exception_handler(PalEvent::MemFault, memfault_upcall)?;
    pal::set_exception_handler(PalEvent::Illegal, illegal_upcall)?;
    pal::set_exception_handler(PalEvent::Quit, quit_upcall)?;
    pal::set_exception_handler(PalEvent::Suspend, suspend_upcall)?;
    pal::set_exception_handler(PalEvent::Resume, resume_upcall)?;
    Ok(())
}

/// Interrupted inside PAL text?
pub(crate) fn context_is_pal(ctx: &PalContext) -> bool {
    pal::control_block().pal_text.contains(ctx.rip)
}

/// Interrupted inside LibOS text?
pub(crate) fn context_is_internal(ctx: &PalContext) -> bool {
    pal::control_block().libos_text.contains(ctx.rip)
}

fn cur_tid() -> u32 {
    tls::current_tcb().map(|tcb| tcb.tid()).unwrap_or(0)
}

fn fault_is_internal(ctx: Option<&PalContext>) -> bool {
    thread::is_internal_tid(cur_tid())
        || ctx.map(|c| context_is_internal(c) || context_is_pal(c)).unwrap_or(false)
}

/// Fatal diagnostic for a fault the application cannot have caused; the
/// thread is parked, not recovered.
fn internal_fault(errstr: &str, addr: u64, ctx: Option<&PalContext>) -> ! {
    let cb = pal::control_block();
    let tid = cur_tid();
    let tid = if thread::is_internal_tid(tid) { 0 } else { tid };
    match ctx {
        Some(ctx) if cb.libos_text.contains(ctx.rip) => {
            log_error!(
                "[SIGNAL] {} at {:#x} (IP = +{:#x}, VMID = {}, TID = {})",
                errstr,
                addr,
                ctx.rip - cb.libos_text.start,
                cb.vmid,
                tid
            );
        }
        Some(ctx) => {
            log_error!(
                "[SIGNAL] {} at {:#x} (IP = {:#x}, VMID = {}, TID = {})",
                errstr,
                addr,
                ctx.rip,
                cb.vmid,
                tid
            );
        }
        None => {
            log_error!(
                "[SIGNAL] {} at {:#x} (IP = 0, VMID = {}, TID = {})",
                errstr,
                addr,
                cb.vmid,
                tid
            );
        }
    }
    pal::pause()
}

fn return_event(event: u32) {
    if let Some(event) = PalEvent::from_u32(event) {
        pal::exception_return(event);
    }
}

pub(crate) extern "C" fn arithmetic_error_upcall(event: u32, arg: u64, context: *mut PalContext) {
    let mut ctx = unsafe { context.as_mut() };
    if fault_is_internal(ctx.as_deref()) {
        internal_fault("Internal arithmetic fault", arg, ctx.as_deref());
    }
    if let Some(ctx) = ctx.as_deref() {
        log_debug!("[SIGNAL] arithmetic fault at {:#x}", ctx.rip);
    }
    deliver_signal(
        &SigInfo::fault(sig::SIGFPE, FPE_INTDIV, arg),
        ctx.as_deref_mut(),
    );
    return_event(event);
}

/// Decide which signal a user memory fault becomes. `None` means the fault
/// hit a LibOS-internal mapping and must be treated as internal.
pub(crate) fn classify_memfault(addr: u64, err: u64) -> Option<(u32, i32)> {
    if addr == 0 {
        return Some((sig::SIGSEGV, SEGV_MAPERR));
    }
    match vma::lookup_vma(addr) {
        Some(vma) => {
            if vma.flags.contains(VmaFlags::INTERNAL) {
                return None;
            }
            if let Some(eof) = vma.eof_in_vma() {
                if addr > eof {
                    // Mapped, but past the end of the backing file.
                    Some((sig::SIGBUS, BUS_ADRERR))
                } else if err & ERR_WRITE_ACCESS != 0 && !vma.prot.contains(VmaProt::WRITE) {
                    Some((sig::SIGSEGV, SEGV_ACCERR))
                } else {
                    // Mapped and within the file; be conservative.
                    Some((sig::SIGBUS, BUS_ADRERR))
                }
            } else {
                Some((sig::SIGSEGV, SEGV_ACCERR))
            }
        }
        None => Some((sig::SIGSEGV, SEGV_MAPERR)),
    }
}

pub(crate) extern "C" fn memfault_upcall(event: u32, arg: u64, context: *mut PalContext) {
    let mut ctx = unsafe { context.as_mut() };

    // An active memory probe owns faults inside its watched range: record
    // the fault and land on the probe's continuation instead of delivering
    // anything.
    if let (Some(tcb), Some(ctx)) = (tls::current_tcb(), ctx.as_deref_mut()) {
        let range = &tcb.test_range;
        if range.is_active() && range.contains(arg) {
            range.has_fault.store(true, Ordering::Release);
            ctx.rip = range.cont_addr.load(Ordering::Acquire);
            return_event(event);
            return;
        }
    }

    if fault_is_internal(ctx.as_deref()) {
        internal_fault("Internal memory fault", arg, ctx.as_deref());
    }
    if let Some(ctx) = ctx.as_deref() {
        log_debug!("[SIGNAL] memory fault at {:#x} (IP = {:#x})", arg, ctx.rip);
    }

    let err = ctx.as_deref().map(|c| c.err).unwrap_or(0);
    let Some((signo, code)) = classify_memfault(arg, err) else {
        internal_fault("Internal memory fault with VMA", arg, ctx.as_deref());
    };

    deliver_signal(&SigInfo::fault(signo, code, arg), ctx.as_deref_mut());
    return_event(event);
}

pub(crate) extern "C" fn illegal_upcall(event: u32, arg: u64, context: *mut PalContext) {
    let mut ctx = unsafe { context.as_mut() };

    let in_user_vma = vma::lookup_vma(arg)
        .map(|vma| !vma.flags.contains(VmaFlags::INTERNAL))
        .unwrap_or(false);
    if fault_is_internal(ctx.as_deref()) || !in_user_vma {
        internal_fault("Internal illegal fault", arg, ctx.as_deref());
    }
    let Some(ctx) = ctx.as_deref_mut() else {
        internal_fault("Internal illegal fault", arg, None);
    };
    log_debug!("[SIGNAL] illegal instruction at {:#x}", ctx.rip);

    let opcode = unsafe { core::slice::from_raw_parts(ctx.rip as *const u8, 2) };
    if opcode == [0x0f, 0x05] {
        // A `syscall` opcode the host refused to run (enclave PALs raise it
        // as an illegal instruction). Emulate what the instruction itself
        // would have architecturally done, then continue inside the LibOS
        // syscall entry.
        ctx.rcx = ctx.rip + 2;
        ctx.r11 = ctx.efl;
        ctx.rip = sysret::syscall_entry_addr();
    } else {
        deliver_signal(&SigInfo::fault(sig::SIGILL, ILL_ILLOPC, arg), Some(ctx));
    }
    // TODO: hosts that trap `syscall` through seccomp raise SIGSYS with the
    // IP already past the opcode; emulating that here (rewinding rip by two
    // and routing si_syscall) is still disabled until the host contract for
    // it settles.
    return_event(event);
}

pub(crate) extern "C" fn quit_upcall(event: u32, _arg: u64, context: *mut PalContext) {
    let mut ctx = unsafe { context.as_mut() };
    if let Some(ctx) = ctx.as_deref_mut() {
        sysret::sysret_return_emulate(ctx);
    }
    if !thread::is_internal_tid(cur_tid()) {
        deliver_signal(&SigInfo::user(sig::SIGTERM, 0), ctx.as_deref_mut());
    }
    return_event(event);
}

pub(crate) extern "C" fn suspend_upcall(event: u32, _arg: u64, context: *mut PalContext) {
    let mut ctx = unsafe { context.as_mut() };
    if let Some(ctx) = ctx.as_deref_mut() {
        sysret::sysret_return_emulate(ctx);
    }
    if !thread::is_internal_tid(cur_tid()) {
        deliver_signal(&SigInfo::user(sig::SIGINT, 0), ctx.as_deref_mut());
    }
    return_event(event);
}

pub(crate) extern "C" fn resume_upcall(event: u32, _arg: u64, context: *mut PalContext) {
    let mut ctx = unsafe { context.as_mut() };
    let Some(tcb) = tls::current_tcb() else {
        return_event(event);
        return;
    };
    if tcb.thread().is_none() {
        return_event(event);
        return;
    }

    if let Some(ctx) = ctx.as_deref_mut() {
        sysret::sysret_return_emulate(ctx);
    }
    if !thread::is_internal_tid(cur_tid()) {
        let preempt = tcb.disable_preempt();
        if preempt <= 1 {
            handle_signal_inner(tcb, None, ctx.as_deref_mut());
        }
        tcb.enable_preempt();
    }
    return_event(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::ucontext::SigFrame;
    use crate::signal::{SaFlags, SigAction, SigSet};
    use crate::thread::testing;
    use crate::vma::{Vma, VmaFile};
    use alloc::vec;

    const HANDLER: u64 = 0x5100_1000;

    fn install_handler(thread: &crate::thread::Thread, signo: u32) {
        let mut state = thread.inner.lock();
        state.dispositions[(signo - 1) as usize] = Some(SigAction {
            handler: HANDLER,
            flags: SaFlags::empty(),
            restorer: 0x5100_2000,
            mask: SigSet::EMPTY,
        });
    }

    fn user_stack() -> (alloc::vec::Vec<u8>, u64) {
        let stack = vec![0u8; 64 * 1024];
        let top = stack.as_ptr() as u64 + stack.len() as u64;
        (stack, top & !15)
    }

    #[test]
    fn test_classify_null_address() {
        assert_eq!(classify_memfault(0, 0), Some((sig::SIGSEGV, SEGV_MAPERR)));
    }

    #[test]
    fn test_classify_unmapped() {
        assert_eq!(
            classify_memfault(0x4400_0000, 0),
            Some((sig::SIGSEGV, SEGV_MAPERR))
        );
    }

    #[test]
    fn test_classify_write_to_readonly_file() {
        vma::add_vma(Vma {
            start: 0x4500_0000,
            end: 0x4500_4000,
            prot: VmaProt::READ,
            flags: VmaFlags::PRIVATE,
            offset: 0,
            file: Some(VmaFile { size: 0x4000 }),
        });
        assert_eq!(
            classify_memfault(0x4500_1000, ERR_WRITE_ACCESS),
            Some((sig::SIGSEGV, SEGV_ACCERR))
        );
        // Read fault in the mapped file range stays conservative.
        assert_eq!(
            classify_memfault(0x4500_1000, 0),
            Some((sig::SIGBUS, BUS_ADRERR))
        );
        vma::remove_vma_range(0x4500_0000, 0x4500_4000);
    }

    #[test]
    fn test_classify_past_eof() {
        vma::add_vma(Vma {
            start: 0x4600_0000,
            end: 0x4600_4000,
            prot: VmaProt::READ,
            flags: VmaFlags::PRIVATE,
            offset: 0,
            file: Some(VmaFile { size: 0x1800 }),
        });
        assert_eq!(
            classify_memfault(0x4600_2000, 0),
            Some((sig::SIGBUS, BUS_ADRERR))
        );
        vma::remove_vma_range(0x4600_0000, 0x4600_4000);
    }

    #[test]
    fn test_classify_internal_vma() {
        vma::add_vma(Vma {
            start: 0x4700_0000,
            end: 0x4700_1000,
            prot: VmaProt::READ,
            flags: VmaFlags::INTERNAL,
            offset: 0,
            file: None,
        });
        assert_eq!(classify_memfault(0x4700_0800, 0), None);
        vma::remove_vma_range(0x4700_0000, 0x4700_1000);
    }

    #[test]
    fn test_classify_mapped_anonymous() {
        vma::add_vma(Vma {
            start: 0x4800_0000,
            end: 0x4800_1000,
            prot: VmaProt::READ,
            flags: VmaFlags::ANONYMOUS,
            offset: 0,
            file: None,
        });
        assert_eq!(
            classify_memfault(0x4800_0800, 0),
            Some((sig::SIGSEGV, SEGV_ACCERR))
        );
        vma::remove_vma_range(0x4800_0000, 0x4800_1000);
    }

    #[test]
    fn test_memfault_delivers_segv_frame() {
        let adopted = testing::adopt_new();
        install_handler(&adopted.0, sig::SIGSEGV);

        let (_stack, top) = user_stack();
        let mut ctx = crate::pal::PalContext::zeroed();
        ctx.rsp = top;
        ctx.rip = 0x4000_5678;

        memfault_upcall(PalEvent::MemFault as u32, 0, &mut ctx);

        assert_eq!(ctx.rip, HANDLER);
        assert_eq!(ctx.rdi, sig::SIGSEGV as u64);
        let frame = unsafe { &*(ctx.rsp as *const SigFrame) };
        assert_eq!(frame.info.si_signo, sig::SIGSEGV as i32);
        assert_eq!(frame.info.si_code, SEGV_MAPERR);
        assert_eq!(frame.info.si_addr(), 0);
        assert_eq!(
            frame.uc.uc_mcontext.gregs[crate::signal::ucontext::greg::RIP],
            0x4000_5678
        );
    }

    #[test]
    fn test_memfault_respects_active_probe() {
        let adopted = testing::adopt_new();
        let tcb = adopted.0.tcb();
        tcb.test_range.start.store(0x9000_0000, Ordering::Relaxed);
        tcb.test_range.end.store(0x9000_0fff, Ordering::Relaxed);
        tcb.test_range.cont_addr.store(0x5200_0000, Ordering::Release);

        let mut ctx = crate::pal::PalContext::zeroed();
        ctx.rip = 0x4000_0000;
        memfault_upcall(PalEvent::MemFault as u32, 0x9000_0800, &mut ctx);

        assert!(tcb.test_range.has_fault.load(Ordering::Acquire));
        assert_eq!(ctx.rip, 0x5200_0000);
        // Nothing was queued.
        assert_eq!(adopted.0.has_signal.load(Ordering::SeqCst), 0);
        tcb.test_range.clear();
    }

    #[test]
    fn test_arith_fault_delivers_sigfpe() {
        let adopted = testing::adopt_new();
        install_handler(&adopted.0, sig::SIGFPE);

        let (_stack, top) = user_stack();
        let mut ctx = crate::pal::PalContext::zeroed();
        ctx.rsp = top;
        ctx.rip = 0x4000_1111;

        arithmetic_error_upcall(PalEvent::ArithmeticError as u32, 0x4000_1111, &mut ctx);
        assert_eq!(ctx.rip, HANDLER);
        let frame = unsafe { &*(ctx.rsp as *const SigFrame) };
        assert_eq!(frame.info.si_signo, sig::SIGFPE as i32);
        assert_eq!(frame.info.si_code, FPE_INTDIV);
    }

    #[test]
    fn test_illegal_syscall_opcode_is_emulated() {
        let adopted = testing::adopt_new();
        let _ = &adopted;

        // Two-byte `syscall` encoding at the interrupted IP.
        let code = vec![0x0fu8, 0x05u8, 0x90u8];
        let code_addr = code.as_ptr() as u64;
        let page = code_addr & !0xfff;
        vma::add_vma(Vma {
            start: page,
            end: page + 0x2000,
            prot: VmaProt::READ | VmaProt::EXEC,
            flags: VmaFlags::PRIVATE,
            offset: 0,
            file: None,
        });

        let mut ctx = crate::pal::PalContext::zeroed();
        ctx.rip = code_addr;
        ctx.efl = 0x246;
        illegal_upcall(PalEvent::Illegal as u32, code_addr, &mut ctx);

        assert_eq!(ctx.rip, sysret::syscall_entry_addr());
        assert_eq!(ctx.rcx, code_addr + 2);
        assert_eq!(ctx.r11, 0x246);
        vma::remove_vma_range(page, page + 0x2000);
    }

    #[test]
    fn test_illegal_opcode_delivers_sigill() {
        let adopted = testing::adopt_new();
        install_handler(&adopted.0, sig::SIGILL);

        let (_stack, top) = user_stack();
        let code = vec![0x06u8, 0x00u8]; // not a syscall encoding
        let code_addr = code.as_ptr() as u64;
        let page = code_addr & !0xfff;
        vma::add_vma(Vma {
            start: page,
            end: page + 0x2000,
            prot: VmaProt::READ | VmaProt::EXEC,
            flags: VmaFlags::PRIVATE,
            offset: 0,
            file: None,
        });

        let mut ctx = crate::pal::PalContext::zeroed();
        ctx.rip = code_addr;
        ctx.rsp = top;
        illegal_upcall(PalEvent::Illegal as u32, code_addr, &mut ctx);

        assert_eq!(ctx.rip, HANDLER);
        let frame = unsafe { &*(ctx.rsp as *const SigFrame) };
        assert_eq!(frame.info.si_signo, sig::SIGILL as i32);
        assert_eq!(frame.info.si_code, ILL_ILLOPC);
        vma::remove_vma_range(page, page + 0x2000);
    }

    #[test]
    fn test_suspend_delivers_sigint() {
        let adopted = testing::adopt_new();
        install_handler(&adopted.0, sig::SIGINT);

        let (_stack, top) = user_stack();
        let mut ctx = crate::pal::PalContext::zeroed();
        ctx.rsp = top;
        ctx.rip = 0x4000_2222;
        suspend_upcall(PalEvent::Suspend as u32, 0, &mut ctx);

        assert_eq!(ctx.rip, HANDLER);
        let frame = unsafe { &*(ctx.rsp as *const SigFrame) };
        assert_eq!(frame.info.si_signo, sig::SIGINT as i32);
        assert_eq!(frame.info.si_pid(), 0);
    }

    #[test]
    fn test_resume_drains_pending() {
        let adopted = testing::adopt_new();
        let thread = &adopted.0;
        install_handler(thread, sig::SIGUSR1);
        {
            let mut state = thread.inner.lock();
            crate::signal::deliver::append_signal(thread, &mut state, sig::SIGUSR1, None, false);
        }

        let (_stack, top) = user_stack();
        let mut ctx = crate::pal::PalContext::zeroed();
        ctx.rsp = top;
        ctx.rip = 0x4000_3333;
        resume_upcall(PalEvent::Resume as u32, 0, &mut ctx);

        assert_eq!(ctx.rip, HANDLER);
        assert_eq!(thread.has_signal.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_init_signal_registers_upcalls() {
        let adopted = testing::adopt_new();
        install_handler(&adopted.0, sig::SIGFPE);
        init_signal().unwrap();

        let (_stack, top) = user_stack();
        let mut ctx = crate::pal::PalContext::zeroed();
        ctx.rsp = top;
        ctx.rip = 0x4000_4444;
        crate::pal::raise_event(PalEvent::ArithmeticError, 0, &mut ctx);
        assert_eq!(ctx.rip, HANDLER);
    }
}
