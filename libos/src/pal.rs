//! Platform Abstraction Layer interface
//!
//! The PAL owns the host: it loads the LibOS, reflects hardware exceptions
//! and host notifications as upcalls on the victim thread's stack, and
//! provides the few thread/debug primitives the LibOS cannot express itself.
//! This module holds the upcall registration table, the control block
//! published by the PAL at load time, and thin wrappers over the host
//! primitives.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::RwLock;

/// Exception/notification events a PAL can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PalEvent {
    /// Arithmetic fault (divide error).
    ArithmeticError = 1,
    /// Memory access fault.
    MemFault = 2,
    /// Illegal instruction.
    Illegal = 3,
    /// Host asked the process to quit.
    Quit = 4,
    /// Host asked the process to suspend.
    Suspend = 5,
    /// Another thread asked this one to re-check its pending signals.
    Resume = 6,
}

pub const PAL_EVENT_COUNT: usize = 6;

impl PalEvent {
    pub fn from_u32(raw: u32) -> Option<PalEvent> {
        match raw {
            1 => Some(PalEvent::ArithmeticError),
            2 => Some(PalEvent::MemFault),
            3 => Some(PalEvent::Illegal),
            4 => Some(PalEvent::Quit),
            5 => Some(PalEvent::Suspend),
            6 => Some(PalEvent::Resume),
            _ => None,
        }
    }

    fn index(self) -> usize {
        self as usize - 1
    }
}

/// Write-access bit in [`PalContext::err`] for memory faults.
pub const ERR_WRITE_ACCESS: u64 = 0x4;

/// Interrupted machine context as handed to an upcall.
///
/// The general registers are laid out exactly like the `gregs` array of the
/// host `ucontext`, so the delivery engine can copy them wholesale into a
/// signal frame.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PalContext {
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rsp: u64,
    pub rip: u64,
    pub efl: u64,
    pub csgsfs: u64,
    pub err: u64,
    pub trapno: u64,
    pub oldmask: u64,
    pub cr2: u64,
    /// Saved extended FP state, or null.
    pub fpregs: *mut crate::signal::ucontext::XregsState,
}

impl PalContext {
    pub fn zeroed() -> Self {
        // All-zero is a valid value for every field, including the pointer.
        unsafe { core::mem::zeroed() }
    }

    /// Number of general registers shared with the `ucontext` gregs layout.
    pub const GREG_COUNT: usize = 23;

    pub fn gregs(&self) -> &[u64; Self::GREG_COUNT] {
        unsafe { &*(self as *const PalContext as *const [u64; Self::GREG_COUNT]) }
    }
}

/// Upcall entry point: `(event, fault address, interrupted context)`.
pub type UpcallFn = extern "C" fn(u32, u64, *mut PalContext);

/// An address range of executable text.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextRange {
    pub start: u64,
    pub end: u64,
}

impl TextRange {
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }
}

/// Control block published by the PAL when it loads the LibOS.
#[derive(Debug, Clone, Copy)]
pub struct PalControlBlock {
    /// Host type string; `"Linux-SGX"` selects enclave mode.
    pub host_type: &'static str,
    /// Host-assigned VM identifier, used in diagnostics.
    pub vmid: u32,
    /// PAL text range; faults inside it are internal.
    pub pal_text: TextRange,
    /// LibOS text range; faults inside it are internal.
    pub libos_text: TextRange,
}

impl PalControlBlock {
    const DEFAULT: PalControlBlock = PalControlBlock {
        host_type: "Linux",
        vmid: 0,
        pal_text: TextRange { start: 0, end: 0 },
        libos_text: TextRange { start: 0, end: 0 },
    };
}

/// Host primitives supplied by the PAL.
#[derive(Clone, Copy)]
pub struct PalBackend {
    pub thread_resume: fn(u64),
    pub thread_yield: fn(),
    pub debug_write: fn(&str),
    pub process_exit: fn(i32) -> !,
}

fn resume_stub(_handle: u64) {}

fn yield_stub() {}

fn debug_stub(_line: &str) {}

fn exit_stub(_status: i32) -> ! {
    // No host to exit to; spin until the PAL tears the process down.
    loop {
        core::hint::spin_loop();
    }
}

impl PalBackend {
    const DEFAULT: PalBackend = PalBackend {
        thread_resume: resume_stub,
        thread_yield: yield_stub,
        debug_write: debug_stub,
        process_exit: exit_stub,
    };
}

static CONTROL: RwLock<PalControlBlock> = RwLock::new(PalControlBlock::DEFAULT);
static BACKEND: RwLock<PalBackend> = RwLock::new(PalBackend::DEFAULT);

/// Registered upcalls, one slot per event (stored as fn addresses).
static UPCALLS: [AtomicUsize; PAL_EVENT_COUNT] = [
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
];

/// Install the control block and host primitives. Called once by the loader.
pub fn init(cb: PalControlBlock, backend: PalBackend) {
    *CONTROL.write() = cb;
    *BACKEND.write() = backend;
}

pub fn control_block() -> PalControlBlock {
    *CONTROL.read()
}

pub fn set_backend(backend: PalBackend) {
    *BACKEND.write() = backend;
}

/// Register `upcall` for `event`. Later registrations replace earlier ones.
pub fn set_exception_handler(event: PalEvent, upcall: UpcallFn) -> Result<(), i32> {
    UPCALLS[event.index()].store(upcall as usize, Ordering::Release);
    Ok(())
}

/// Dispatch an event to the registered upcall. Invoked by the PAL's host
/// signal trampoline on the victim thread.
pub fn raise_event(event: PalEvent, arg: u64, context: *mut PalContext) {
    let raw = UPCALLS[event.index()].load(Ordering::Acquire);
    if raw == 0 {
        log_warn!("[PAL] event {:?} raised with no handler installed", event);
        return;
    }
    let upcall: UpcallFn = unsafe { core::mem::transmute(raw) };
    upcall(event as u32, arg, context);
}

/// Acknowledge an upcall; the PAL resumes the interrupted context after this.
pub fn exception_return(_event: PalEvent) {}

pub fn thread_resume(handle: u64) {
    (BACKEND.read().thread_resume)(handle)
}

pub fn thread_yield() {
    (BACKEND.read().thread_yield)()
}

pub fn debug_write(s: &str) {
    (BACKEND.read().debug_write)(s)
}

pub fn process_exit(status: i32) -> ! {
    let exit = BACKEND.read().process_exit;
    exit(status)
}

/// Park the current thread forever. Terminal state for internal faults.
pub fn pause() -> ! {
    loop {
        thread_yield();
        core::hint::spin_loop();
    }
}

pub(crate) fn host_is_enclave(host_type: &str) -> bool {
    host_type == "Linux-SGX"
}

/// Whether the PAL is an enclave PAL (fault addresses unreliable, probes
/// must walk VMAs). The answer never changes after load, so it is computed
/// once and cached.
pub fn is_enclave() -> bool {
    static INITED: AtomicBool = AtomicBool::new(false);
    static ENCLAVE: AtomicBool = AtomicBool::new(false);

    if !INITED.load(Ordering::Acquire) {
        let value = host_is_enclave(control_block().host_type);
        ENCLAVE.store(value, Ordering::Relaxed);
        // The value must be visible before the initialized flag.
        INITED.store(true, Ordering::Release);
    }
    ENCLAVE.load(Ordering::Relaxed)
}
