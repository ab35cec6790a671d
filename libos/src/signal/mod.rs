//! POSIX signal model
//!
//! Signal numbering, `siginfo` payloads, per-thread dispositions and masks,
//! alternate-stack descriptors, and the process-global default-action table.
//! Linux-compatible numbering and semantics.

pub mod default;
pub mod deliver;
pub mod queue;
pub mod ucontext;

use bitflags::bitflags;

/// Signal numbers (Linux compatible)
pub mod sig {
    pub const SIGHUP: u32 = 1;
    pub const SIGINT: u32 = 2;
    pub const SIGQUIT: u32 = 3;
    pub const SIGILL: u32 = 4;
    pub const SIGTRAP: u32 = 5;
    pub const SIGABRT: u32 = 6;
    pub const SIGBUS: u32 = 7;
    pub const SIGFPE: u32 = 8;
    pub const SIGKILL: u32 = 9; // Cannot be caught, blocked or ignored
    pub const SIGUSR1: u32 = 10;
    pub const SIGSEGV: u32 = 11;
    pub const SIGUSR2: u32 = 12;
    pub const SIGPIPE: u32 = 13;
    pub const SIGALRM: u32 = 14;
    pub const SIGTERM: u32 = 15;
    pub const SIGSTKFLT: u32 = 16;
    pub const SIGCHLD: u32 = 17;
    pub const SIGCONT: u32 = 18;
    pub const SIGSTOP: u32 = 19; // Cannot be caught, blocked or ignored
    pub const SIGTSTP: u32 = 20;
    pub const SIGTTIN: u32 = 21;
    pub const SIGTTOU: u32 = 22;
    pub const SIGURG: u32 = 23;
    pub const SIGXCPU: u32 = 24;
    pub const SIGXFSZ: u32 = 25;
    pub const SIGVTALRM: u32 = 26;
    pub const SIGPROF: u32 = 27;
    pub const SIGWINCH: u32 = 28;
    pub const SIGIO: u32 = 29;
    pub const SIGPWR: u32 = 30;
    pub const SIGSYS: u32 = 31;
}

/// Size of the per-thread signal tables; standard signals are `1..SIGNAL_COUNT`.
pub const SIGNAL_COUNT: usize = 32;

/// Is `signo` a standard signal this core handles?
pub fn is_valid_signal(signo: u32) -> bool {
    signo >= 1 && (signo as usize) < SIGNAL_COUNT
}

/// `si_code` values
pub const SI_USER: i32 = 0;
pub const ILL_ILLOPC: i32 = 1;
pub const FPE_INTDIV: i32 = 1;
pub const SEGV_MAPERR: i32 = 1;
pub const SEGV_ACCERR: i32 = 2;
pub const BUS_ADRERR: i32 = 2;

/// Special handler values
pub const SIG_DFL: u64 = 0;
pub const SIG_IGN: u64 = 1;

bitflags! {
    /// `sigaction` flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SaFlags: u64 {
        const NOCLDSTOP = 0x0000_0001;
        const NOCLDWAIT = 0x0000_0002;
        const SIGINFO = 0x0000_0004;
        const RESTORER = 0x0400_0000;
        const ONSTACK = 0x0800_0000;
        const RESTART = 0x1000_0000;
        const NODEFER = 0x4000_0000;
        const RESETHAND = 0x8000_0000;
    }
}

/// Per-signal disposition installed with `rt_sigaction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigAction {
    /// Handler address, or [`SIG_DFL`] / [`SIG_IGN`].
    pub handler: u64,
    pub flags: SaFlags,
    /// `sa_restorer` trampoline the handler returns through.
    pub restorer: u64,
    /// Signals blocked while the handler runs.
    pub mask: SigSet,
}

/// A signal mask: one bit per signal, bit `signo - 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SigSet(u64);

impl SigSet {
    pub const EMPTY: SigSet = SigSet(0);

    /// Bits that can never be masked.
    const UNMASKABLE: u64 = (1 << (sig::SIGKILL - 1)) | (1 << (sig::SIGSTOP - 1));

    pub const fn from_raw(raw: u64) -> SigSet {
        SigSet(raw)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }

    pub fn add(&mut self, signo: u32) {
        if is_valid_signal(signo) {
            self.0 |= 1 << (signo - 1);
        }
    }

    pub fn remove(&mut self, signo: u32) {
        if is_valid_signal(signo) {
            self.0 &= !(1 << (signo - 1));
        }
    }

    pub fn contains(&self, signo: u32) -> bool {
        is_valid_signal(signo) && self.0 & (1 << (signo - 1)) != 0
    }

    /// The mask as it may actually be installed: SIGKILL and SIGSTOP removed.
    pub fn sanitized(self) -> SigSet {
        SigSet(self.0 & !Self::UNMASKABLE)
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct SigKill {
    pid: u32,
    uid: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct SigFault {
    addr: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct SigSysInfo {
    call_addr: u64,
    syscall: i32,
    arch: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
union SigFields {
    kill: SigKill,
    fault: SigFault,
    sys: SigSysInfo,
    _pad: [u64; 14],
}

/// Signal payload, laid out like the kernel `siginfo_t` (128 bytes, the
/// sender/fault fields overlapping in a union after the common header).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SigInfo {
    pub si_signo: i32,
    pub si_errno: i32,
    pub si_code: i32,
    _pad: i32,
    fields: SigFields,
}

const _: () = assert!(core::mem::size_of::<SigInfo>() == 128);

impl SigInfo {
    pub fn new(signo: u32, code: i32) -> SigInfo {
        SigInfo {
            si_signo: signo as i32,
            si_errno: 0,
            si_code: code,
            _pad: 0,
            fields: SigFields { _pad: [0; 14] },
        }
    }

    /// A hardware-fault payload (`SIGSEGV`, `SIGBUS`, `SIGILL`, `SIGFPE`).
    pub fn fault(signo: u32, code: i32, addr: u64) -> SigInfo {
        let mut info = SigInfo::new(signo, code);
        info.fields.fault = SigFault { addr };
        info
    }

    /// A sender-identified payload; `pid == 0` means the host itself.
    pub fn user(signo: u32, pid: u32) -> SigInfo {
        let mut info = SigInfo::new(signo, SI_USER);
        info.fields.kill = SigKill { pid, uid: 0 };
        info
    }

    pub fn si_pid(&self) -> u32 {
        unsafe { self.fields.kill.pid }
    }

    pub fn si_uid(&self) -> u32 {
        unsafe { self.fields.kill.uid }
    }

    pub fn si_addr(&self) -> u64 {
        unsafe { self.fields.fault.addr }
    }

    pub fn si_syscall(&self) -> i32 {
        unsafe { self.fields.sys.syscall }
    }
}

impl core::fmt::Debug for SigInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SigInfo")
            .field("si_signo", &self.si_signo)
            .field("si_code", &self.si_code)
            .field("si_errno", &self.si_errno)
            .finish()
    }
}

/// `sigaltstack` flags
pub const SS_ONSTACK: i32 = 1;
pub const SS_DISABLE: i32 = 2;

/// Bytes below the stack pointer the ABI reserves for the interrupted
/// function; signal frames must not touch them.
pub const RED_ZONE_SIZE: u64 = 128;

/// Per-thread alternate signal stack (`stack_t` layout).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SigAltStack {
    pub ss_sp: u64,
    pub ss_flags: i32,
    pub ss_size: u64,
}

impl Default for SigAltStack {
    fn default() -> Self {
        SigAltStack {
            ss_sp: 0,
            ss_flags: SS_DISABLE,
            ss_size: 0,
        }
    }
}

/// What a signal does when no user handler is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    /// Kill the thread (or process, see the terminate contract).
    Terminate,
    /// Kill and flag a core dump in the exit status.
    CoreDump,
    /// Do nothing; the pending queue is drained without delivery.
    Ignore,
}

/// Process-global default-action table, indexed by `signo - 1`.
static DEFAULT_ACTIONS: [DefaultAction; SIGNAL_COUNT] = {
    use DefaultAction::*;
    [
        Terminate, // SIGHUP
        Terminate, // SIGINT
        CoreDump,  // SIGQUIT
        CoreDump,  // SIGILL
        CoreDump,  // SIGTRAP
        CoreDump,  // SIGABRT
        CoreDump,  // SIGBUS
        CoreDump,  // SIGFPE
        Terminate, // SIGKILL
        Terminate, // SIGUSR1
        CoreDump,  // SIGSEGV
        Terminate, // SIGUSR2
        Terminate, // SIGPIPE
        Terminate, // SIGALRM
        Terminate, // SIGTERM
        Terminate, // SIGSTKFLT
        Ignore,    // SIGCHLD
        Ignore,    // SIGCONT
        Ignore,    // SIGSTOP (stop states are not implemented)
        Ignore,    // SIGTSTP
        Ignore,    // SIGTTIN
        Ignore,    // SIGTTOU
        Ignore,    // SIGURG
        CoreDump,  // SIGXCPU
        CoreDump,  // SIGXFSZ
        Terminate, // SIGVTALRM
        Terminate, // SIGPROF
        Ignore,    // SIGWINCH
        Terminate, // SIGIO
        Terminate, // SIGPWR
        CoreDump,  // SIGSYS
        Ignore,    // (unused slot)
    ]
};

/// Default action for `signo`.
pub fn default_action(signo: u32) -> DefaultAction {
    if is_valid_signal(signo) {
        DEFAULT_ACTIONS[(signo - 1) as usize]
    } else {
        DefaultAction::Ignore
    }
}

/// Fully resolved way to dispatch one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigDispatch {
    /// Jump into an application handler through a signal frame.
    User { handler: u64, restorer: u64 },
    /// Default terminate; called inline, never returns to the application.
    Terminate,
    /// Default terminate with the core-dump bit in the exit status.
    TerminateCoreDump,
    /// Drop the signal.
    Ignore,
}

impl SigDispatch {
    pub fn is_terminate(&self) -> bool {
        matches!(self, SigDispatch::Terminate | SigDispatch::TerminateCoreDump)
    }
}

/// Resolve the disposition of `signo` for a thread whose state is already
/// locked. `SA_RESETHAND` fires here: resolving such an entry removes it.
pub(crate) fn resolve_locked(
    state: &mut crate::thread::ThreadSigState,
    signo: u32,
) -> SigDispatch {
    let idx = (signo - 1) as usize;
    let mut handler = SIG_DFL;
    let mut restorer = 0;

    if let Some(action) = state.dispositions[idx] {
        handler = action.handler;
        restorer = action.restorer;
        if action.flags.contains(SaFlags::RESETHAND) {
            state.dispositions[idx] = None;
        }
    }

    if handler == SIG_IGN {
        return SigDispatch::Ignore;
    }
    if handler == SIG_DFL {
        return match default_action(signo) {
            DefaultAction::Terminate => SigDispatch::Terminate,
            DefaultAction::CoreDump => SigDispatch::TerminateCoreDump,
            DefaultAction::Ignore => SigDispatch::Ignore,
        };
    }
    SigDispatch::User { handler, restorer }
}

/// Resolve the disposition of `signo`, taking the thread lock.
pub fn get_sighandler(thread: &crate::thread::Thread, signo: u32) -> SigDispatch {
    let mut state = thread.inner.lock();
    resolve_locked(&mut state, signo)
}

/// Get signal name
pub fn signal_name(signo: u32) -> &'static str {
    match signo {
        sig::SIGHUP => "SIGHUP",
        sig::SIGINT => "SIGINT",
        sig::SIGQUIT => "SIGQUIT",
        sig::SIGILL => "SIGILL",
        sig::SIGTRAP => "SIGTRAP",
        sig::SIGABRT => "SIGABRT",
        sig::SIGBUS => "SIGBUS",
        sig::SIGFPE => "SIGFPE",
        sig::SIGKILL => "SIGKILL",
        sig::SIGUSR1 => "SIGUSR1",
        sig::SIGSEGV => "SIGSEGV",
        sig::SIGUSR2 => "SIGUSR2",
        sig::SIGPIPE => "SIGPIPE",
        sig::SIGALRM => "SIGALRM",
        sig::SIGTERM => "SIGTERM",
        sig::SIGSTKFLT => "SIGSTKFLT",
        sig::SIGCHLD => "SIGCHLD",
        sig::SIGCONT => "SIGCONT",
        sig::SIGSTOP => "SIGSTOP",
        sig::SIGTSTP => "SIGTSTP",
        sig::SIGTTIN => "SIGTTIN",
        sig::SIGTTOU => "SIGTTOU",
        sig::SIGURG => "SIGURG",
        sig::SIGXCPU => "SIGXCPU",
        sig::SIGXFSZ => "SIGXFSZ",
        sig::SIGVTALRM => "SIGVTALRM",
        sig::SIGPROF => "SIGPROF",
        sig::SIGWINCH => "SIGWINCH",
        sig::SIGIO => "SIGIO",
        sig::SIGPWR => "SIGPWR",
        sig::SIGSYS => "SIGSYS",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigset_forced_unmaskable() {
        let mut set = SigSet::EMPTY;
        for signo in 1..SIGNAL_COUNT as u32 {
            set.add(signo);
        }
        let sanitized = set.sanitized();
        assert!(!sanitized.contains(sig::SIGKILL));
        assert!(!sanitized.contains(sig::SIGSTOP));
        assert!(sanitized.contains(sig::SIGTERM));
        assert!(sanitized.contains(sig::SIGSEGV));
    }

    #[test]
    fn test_sigset_membership() {
        let mut set = SigSet::EMPTY;
        set.add(sig::SIGUSR1);
        assert!(set.contains(sig::SIGUSR1));
        assert!(!set.contains(sig::SIGUSR2));
        set.remove(sig::SIGUSR1);
        assert_eq!(set, SigSet::EMPTY);
        // Out-of-range signals never enter the mask.
        set.add(0);
        set.add(64);
        assert_eq!(set, SigSet::EMPTY);
    }

    #[test]
    fn test_siginfo_layout() {
        assert_eq!(core::mem::size_of::<SigInfo>(), 128);
        let info = SigInfo::fault(sig::SIGSEGV, SEGV_MAPERR, 0xdead_b000);
        assert_eq!(info.si_signo, 11);
        assert_eq!(info.si_code, SEGV_MAPERR);
        assert_eq!(info.si_addr(), 0xdead_b000);
        let info = SigInfo::user(sig::SIGTERM, 42);
        assert_eq!(info.si_pid(), 42);
        assert_eq!(info.si_code, SI_USER);
    }

    #[test]
    fn test_default_actions() {
        assert_eq!(default_action(sig::SIGABRT), DefaultAction::CoreDump);
        assert_eq!(default_action(sig::SIGSEGV), DefaultAction::CoreDump);
        assert_eq!(default_action(sig::SIGTERM), DefaultAction::Terminate);
        assert_eq!(default_action(sig::SIGCHLD), DefaultAction::Ignore);
        assert_eq!(default_action(sig::SIGWINCH), DefaultAction::Ignore);
        assert_eq!(default_action(sig::SIGSYS), DefaultAction::CoreDump);
        assert_eq!(default_action(0), DefaultAction::Ignore);
        assert_eq!(default_action(99), DefaultAction::Ignore);
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(signal_name(sig::SIGKILL), "SIGKILL");
        assert_eq!(signal_name(sig::SIGSYS), "SIGSYS");
        assert_eq!(signal_name(0), "UNKNOWN");
    }
}
