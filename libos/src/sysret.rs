//! Syscall entry/return trampoline and safe-point rewind
//!
//! The assembly below is the only LibOS code an application context ever
//! touches directly: the `syscall`-opcode emulation jumps to
//! `lantern_syscall_entry`, and the return path restores the application
//! registers and jumps back out. A quit/suspend/resume notification can
//! interrupt a thread anywhere inside that return path, after the last
//! pending-signal check; [`sysret_return_emulate`] recognizes the three
//! windows by interrupted RIP and rewinds the context to the equivalent
//! pure application context, so a signal delivered afterwards always lands
//! on application state.

use crate::pal::PalContext;
use crate::tls;
use core::sync::atomic::{AtomicU64, Ordering};

/// Application registers saved by the syscall entry path. Lives on the
/// LibOS stack while a syscall is emulated; `tcb.regs` points at it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ShimRegs {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rflags: u64,
    pub rip: u64,
    pub rsp: u64,
    /// Syscall number as the application issued it.
    pub orig_rax: u64,
}

// The entry path subtracts the save area from rsp and then calls into Rust,
// so the area must preserve 16-byte call alignment.
const _: () = assert!(core::mem::size_of::<ShimRegs>() % 16 == 0);

/// Syscall dispatcher installed by the syscall layer:
/// `extern "C" fn(number, &mut ShimRegs) -> result`. The entry trampoline
/// calls through this slot.
pub static SYSCALL_DISPATCH: AtomicU64 = AtomicU64::new(0);

pub type SyscallDispatchFn = extern "C" fn(u64, *mut ShimRegs) -> u64;

pub fn set_syscall_dispatcher(dispatch: SyscallDispatchFn) {
    SYSCALL_DISPATCH.store(dispatch as u64, Ordering::Release);
}

#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    ".text",
    ".balign 16",
    // Syscall entry: rcx = return rip, r11 = rflags, rax = number, exactly
    // what the hardware `syscall` instruction leaves behind (the
    // illegal-opcode emulation synthesizes the same state).
    ".globl lantern_syscall_entry",
    "lantern_syscall_entry:",
    "sub rsp, {regs_size}",
    "mov [rsp + {off_r15}], r15",
    "mov [rsp + {off_r14}], r14",
    "mov [rsp + {off_r13}], r13",
    "mov [rsp + {off_r12}], r12",
    "mov [rsp + {off_r11}], r11",
    "mov [rsp + {off_r10}], r10",
    "mov [rsp + {off_r9}], r9",
    "mov [rsp + {off_r8}], r8",
    "mov [rsp + {off_rcx}], rcx",
    "mov [rsp + {off_rdx}], rdx",
    "mov [rsp + {off_rsi}], rsi",
    "mov [rsp + {off_rdi}], rdi",
    "mov [rsp + {off_rbx}], rbx",
    "mov [rsp + {off_rbp}], rbp",
    "mov [rsp + {off_rflags}], r11",
    "mov [rsp + {off_rip}], rcx",
    "mov [rsp + {off_orig_rax}], rax",
    "lea rcx, [rsp + {regs_size}]",
    "mov [rsp + {off_rsp}], rcx",
    "mov gs:[{tcb_regs}], rsp",
    "mov rdi, rax",
    "mov rsi, rsp",
    "call qword ptr [rip + {dispatch}]",
    // rax now carries the syscall result. From here to the final jump the
    // context can be rewound by sysret_return_emulate.
    ".globl lantern_sysret_begin",
    "lantern_sysret_begin:",
    "mov rdi, rax",
    "call {deliver}",
    "mov r15, [rsp + {off_r15}]",
    "mov r14, [rsp + {off_r14}]",
    "mov r13, [rsp + {off_r13}]",
    "mov r12, [rsp + {off_r12}]",
    "mov r11, [rsp + {off_rflags}]",
    "mov r10, [rsp + {off_r10}]",
    "mov r9, [rsp + {off_r9}]",
    "mov r8, [rsp + {off_r8}]",
    "mov rdx, [rsp + {off_rdx}]",
    "mov rsi, [rsp + {off_rsi}]",
    "mov rdi, [rsp + {off_rdi}]",
    "mov rbx, [rsp + {off_rbx}]",
    "mov rbp, [rsp + {off_rbp}]",
    "mov rcx, [rsp + {off_rip}]",
    "mov gs:[{tcb_tmp_rip}], rcx",
    "mov qword ptr gs:[{tcb_regs}], 0",
    "mov rcx, [rsp + {off_rcx}]",
    "mov rsp, [rsp + {off_rsp}]",
    ".globl lantern_sysret_before_jmp",
    "lantern_sysret_before_jmp:",
    "jmp qword ptr gs:[{tcb_tmp_rip}]",
    ".globl lantern_sysret_end",
    "lantern_sysret_end:",
    // Voluntary pending-signal check, called from LibOS safe points. The
    // rewind for this window just pops the return address: the caller is
    // about to deliver anyway.
    ".balign 16",
    ".globl lantern_check_sigpending_begin",
    "lantern_check_sigpending_begin:",
    "bt qword ptr gs:[{tcb_flags}], 0",
    "jnc 2f",
    "push rax",
    "push rcx",
    "push rdx",
    "push rsi",
    "push rdi",
    "push r8",
    "push r9",
    "push r10",
    "push r11",
    "call {handle_signal}",
    "pop r11",
    "pop r10",
    "pop r9",
    "pop r8",
    "pop rdi",
    "pop rsi",
    "pop rdx",
    "pop rcx",
    "pop rax",
    "2:",
    "ret",
    ".globl lantern_check_sigpending_end",
    "lantern_check_sigpending_end:",
    regs_size = const core::mem::size_of::<ShimRegs>(),
    off_r15 = const core::mem::offset_of!(ShimRegs, r15),
    off_r14 = const core::mem::offset_of!(ShimRegs, r14),
    off_r13 = const core::mem::offset_of!(ShimRegs, r13),
    off_r12 = const core::mem::offset_of!(ShimRegs, r12),
    off_r11 = const core::mem::offset_of!(ShimRegs, r11),
    off_r10 = const core::mem::offset_of!(ShimRegs, r10),
    off_r9 = const core::mem::offset_of!(ShimRegs, r9),
    off_r8 = const core::mem::offset_of!(ShimRegs, r8),
    off_rcx = const core::mem::offset_of!(ShimRegs, rcx),
    off_rdx = const core::mem::offset_of!(ShimRegs, rdx),
    off_rsi = const core::mem::offset_of!(ShimRegs, rsi),
    off_rdi = const core::mem::offset_of!(ShimRegs, rdi),
    off_rbx = const core::mem::offset_of!(ShimRegs, rbx),
    off_rbp = const core::mem::offset_of!(ShimRegs, rbp),
    off_rflags = const core::mem::offset_of!(ShimRegs, rflags),
    off_rip = const core::mem::offset_of!(ShimRegs, rip),
    off_rsp = const core::mem::offset_of!(ShimRegs, rsp),
    off_orig_rax = const core::mem::offset_of!(ShimRegs, orig_rax),
    tcb_regs = const crate::tcb::TCB_OFF_REGS,
    tcb_tmp_rip = const crate::tcb::TCB_OFF_TMP_RIP,
    tcb_flags = const crate::tcb::TCB_OFF_FLAGS,
    dispatch = sym SYSCALL_DISPATCH,
    deliver = sym crate::signal::deliver::deliver_signal_on_sysret,
    handle_signal = sym crate::signal::deliver::handle_signal,
);

extern "C" {
    static lantern_syscall_entry: u8;
    static lantern_sysret_begin: u8;
    static lantern_sysret_before_jmp: u8;
    static lantern_sysret_end: u8;
    static lantern_check_sigpending_begin: u8;
    static lantern_check_sigpending_end: u8;
}

/// Address of the syscall entry trampoline; where the illegal-instruction
/// emulation points an application `syscall` opcode.
pub fn syscall_entry_addr() -> u64 {
    unsafe { &lantern_syscall_entry as *const u8 as u64 }
}

fn sysret_body_range() -> (u64, u64) {
    unsafe {
        (
            &lantern_sysret_begin as *const u8 as u64,
            &lantern_sysret_end as *const u8 as u64,
        )
    }
}

fn sysret_before_jmp_addr() -> u64 {
    unsafe { &lantern_sysret_before_jmp as *const u8 as u64 }
}

fn check_sigpending_range() -> (u64, u64) {
    unsafe {
        (
            &lantern_check_sigpending_begin as *const u8 as u64,
            &lantern_check_sigpending_end as *const u8 as u64,
        )
    }
}

/// If `ctx` was interrupted inside the syscall-return trampoline or the
/// pending-signal check, rewind it to the application context the
/// trampoline was about to produce. No-op anywhere else.
pub fn sysret_return_emulate(ctx: &mut PalContext) {
    let Some(tcb) = tls::current_tcb() else {
        return;
    };
    let rip = ctx.rip;

    let before_jmp = sysret_before_jmp_addr();
    let (body_begin, body_end) = sysret_body_range();
    let (csp_begin, csp_end) = check_sigpending_range();

    if rip == before_jmp {
        // At the final jump the save area is already gone; only the target
        // rip still lives in the TCB.
        debug_assert!(tcb.regs().is_null());
        ctx.rip = tcb.tmp_rip();
    } else if body_begin <= rip && rip <= body_end {
        let regs = tcb.take_regs();
        if regs.is_null() {
            return;
        }
        let regs = unsafe { &*regs };
        ctx.r15 = regs.r15;
        ctx.r14 = regs.r14;
        ctx.r13 = regs.r13;
        ctx.r12 = regs.r12;
        ctx.r11 = regs.r11;
        ctx.r10 = regs.r10;
        ctx.r9 = regs.r9;
        ctx.r8 = regs.r8;
        ctx.rcx = regs.rcx;
        ctx.rdx = regs.rdx;
        ctx.rsi = regs.rsi;
        ctx.rdi = regs.rdi;
        ctx.rbx = regs.rbx;
        ctx.rbp = regs.rbp;
        ctx.efl = regs.rflags;
        ctx.rsp = regs.rsp;
        ctx.rip = regs.rip;
    } else if csp_begin <= rip && rip <= csp_end {
        // Emulate the ret and skip the pending check; the caller is about
        // to deliver the signal itself.
        unsafe {
            ctx.rip = *(ctx.rsp as *const u64);
        }
        ctx.rsp += 8;
    }
}
