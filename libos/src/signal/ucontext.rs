//! Signal frame and user context layout (x86-64)
//!
//! Binary layout of what a POSIX handler finds on its stack on entry:
//! restorer return slot, `siginfo`, `ucontext`, and the optional extended
//! FP state area referenced from `uc_mcontext.fpregs`. Offsets and
//! alignment follow the host ABI so unmodified handler code works
//! unchanged.

use super::{SigAltStack, SigInfo, RED_ZONE_SIZE, SS_DISABLE};

/// `uc_flags` bits
pub const UC_FP_XSTATE: u64 = 0x1;
pub const UC_SIGCONTEXT_SS: u64 = 0x2;
pub const UC_STRICT_RESTORE_SS: u64 = 0x4;

/// Magic values marking an extended (xsave) FP area in `sw_reserved`.
pub const FP_XSTATE_MAGIC1: u32 = 0x4650_5853;
pub const FP_XSTATE_MAGIC2: u32 = 0x4650_5845;
pub const FP_XSTATE_MAGIC2_SIZE: u32 = 4;

/// Alignment the xsave area requires.
pub const XSTATE_ALIGN: u64 = 64;

/// Software-reserved bytes of the legacy FP save area; the kernel uses them
/// to describe how large the full xsave image is.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FpxSwBytes {
    pub magic1: u32,
    pub extended_size: u32,
    pub xfeatures: u64,
    pub xstate_size: u32,
    pub padding: [u32; 7],
}

/// Legacy `fxsave` image, 512 bytes.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FpState {
    pub cwd: u16,
    pub swd: u16,
    pub ftw: u16,
    pub fop: u16,
    pub rip: u64,
    pub rdp: u64,
    pub mxcsr: u32,
    pub mxcr_mask: u32,
    pub st_space: [u32; 32],
    pub xmm_space: [u32; 64],
    pub reserved: [u32; 12],
    pub sw_reserved: FpxSwBytes,
}

const _: () = assert!(core::mem::size_of::<FpState>() == 512);

/// Head of an xsave image: the legacy area plus the xsave header. The
/// component data that follows is opaque to the signal core; it is copied
/// by size, never interpreted.
#[repr(C, align(64))]
pub struct XregsState {
    pub fpstate: FpState,
    pub xstate_hdr: [u64; 8],
}

/// Size of the FP image hanging off `context.fpregs`, derived from the
/// software-reserved magic fields; falls back to the legacy 512-byte image
/// when the magics do not line up. Null pointer means no FP state at all.
pub fn xstate_size_of(xstate: *const XregsState) -> usize {
    if xstate.is_null() {
        return 0;
    }
    let sw = unsafe { &(*xstate).fpstate.sw_reserved };
    if sw.magic1 == FP_XSTATE_MAGIC1 && sw.xstate_size < sw.extended_size {
        let magic2 =
            unsafe { *((xstate as *const u8).add(sw.xstate_size as usize) as *const u32) };
        if magic2 == FP_XSTATE_MAGIC2 {
            return sw.extended_size as usize;
        }
    }
    core::mem::size_of::<FpState>()
}

/// Saved machine context (`mcontext_t`). The gregs array layout matches
/// [`crate::pal::PalContext`], which is what makes wholesale copies valid.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct MContext {
    pub gregs: [u64; 23],
    pub fpregs: u64,
    pub reserved1: [u64; 8],
}

/// Indices into [`MContext::gregs`].
pub mod greg {
    pub const R8: usize = 0;
    pub const R9: usize = 1;
    pub const R10: usize = 2;
    pub const R11: usize = 3;
    pub const R12: usize = 4;
    pub const R13: usize = 5;
    pub const R14: usize = 6;
    pub const R15: usize = 7;
    pub const RDI: usize = 8;
    pub const RSI: usize = 9;
    pub const RBP: usize = 10;
    pub const RBX: usize = 11;
    pub const RDX: usize = 12;
    pub const RAX: usize = 13;
    pub const RCX: usize = 14;
    pub const RSP: usize = 15;
    pub const RIP: usize = 16;
    pub const EFL: usize = 17;
    pub const CSGSFS: usize = 18;
    pub const ERR: usize = 19;
    pub const TRAPNO: usize = 20;
    pub const OLDMASK: usize = 21;
    pub const CR2: usize = 22;
}

/// User segment selectors packed the way `REG_CSGSFS` expects them.
pub const USER_CS: u16 = 0x33;
pub const USER_SS: u16 = 0x2b;

pub fn user_csgsfs() -> u64 {
    // cs | gs << 16 | fs << 32 | ss << 48
    (USER_CS as u64) | ((USER_SS as u64) << 48)
}

/// Userspace signal context.
#[repr(C)]
pub struct UContext {
    pub uc_flags: u64,
    pub uc_link: u64,
    pub uc_stack: SigAltStack,
    pub uc_mcontext: MContext,
    pub uc_sigmask: u64,
    pub fpregs_mem: FpState,
    pub ssp: [u64; 4],
}

/// The frame a handler runs on: the restorer sits where a return address
/// would after a call, so a plain `ret` from the handler enters it.
#[repr(C)]
pub struct SigFrame {
    pub restorer: u64,
    pub uc: UContext,
    pub info: SigInfo,
}

/// `uc` must land 16-byte aligned with `restorer` right below it, exactly
/// the stack shape after a call instruction.
pub const SIGFRAME_UC_OFFSET: usize = core::mem::offset_of!(SigFrame, uc);
const _: () = assert!(SIGFRAME_UC_OFFSET == 8);

/// Recover the enclosing frame from the `ucontext` pointer a handler (or
/// `sigreturn`) holds.
///
/// # Safety
///
/// `uc` must point at the `uc` field of a live [`SigFrame`].
pub unsafe fn frame_of_ucontext(uc: *mut UContext) -> *mut SigFrame {
    unsafe { (uc as *mut u8).sub(SIGFRAME_UC_OFFSET) as *mut SigFrame }
}

/// Pick the stack for a signal frame and carve out the xstate area plus the
/// frame itself. Returns `(frame, xstate)`; `xstate` is null when
/// `xstate_size` is zero.
///
/// Stack choice: a disabled alt stack or a stack pointer already inside the
/// alt stack keep the current stack (minus the red zone, and without
/// double-switching on nested delivery); otherwise the frame goes to the
/// top of the alt stack.
pub fn get_signal_stack(
    altstack: &SigAltStack,
    current_sp: u64,
    xstate_size: usize,
) -> (*mut SigFrame, *mut XregsState) {
    let on_altstack = altstack.ss_sp < current_sp && current_sp <= altstack.ss_sp + altstack.ss_size;

    let mut sp = if altstack.ss_flags & SS_DISABLE != 0 || on_altstack {
        current_sp - RED_ZONE_SIZE
    } else {
        altstack.ss_sp + altstack.ss_size
    };

    let xstate = if xstate_size > 0 {
        sp = (sp - xstate_size as u64) & !(XSTATE_ALIGN - 1);
        sp as *mut XregsState
    } else {
        core::ptr::null_mut()
    };

    let frame_above_uc = (core::mem::size_of::<SigFrame>() - SIGFRAME_UC_OFFSET) as u64;
    let uc = (sp - frame_above_uc) & !15;
    let frame = (uc - SIGFRAME_UC_OFFSET as u64) as *mut SigFrame;
    debug_assert!(uc % 16 == 0);
    (frame, xstate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disabled() -> SigAltStack {
        SigAltStack::default()
    }

    fn altstack(sp: u64, size: u64) -> SigAltStack {
        SigAltStack {
            ss_sp: sp,
            ss_flags: 0,
            ss_size: size,
        }
    }

    #[test]
    fn test_disabled_altstack_uses_red_zone() {
        let sp = 0x7000_0000_0000u64;
        let (frame, _) = get_signal_stack(&disabled(), sp, 0);
        let frame_end = frame as u64 + core::mem::size_of::<SigFrame>() as u64;
        assert!(frame_end <= sp - RED_ZONE_SIZE);
        assert_eq!((frame as u64 + SIGFRAME_UC_OFFSET as u64) % 16, 0);
    }

    #[test]
    fn test_altstack_switch() {
        let alt = altstack(0x1_0000_0000, 0x8000);
        let (frame, _) = get_signal_stack(&alt, 0x7000_0000_0000, 0);
        let top = alt.ss_sp + alt.ss_size;
        assert!((frame as u64) < top);
        assert!(frame as u64 >= alt.ss_sp);
    }

    #[test]
    fn test_nested_altstack_keeps_stack() {
        let alt = altstack(0x1_0000_0000, 0x8000);
        let sp_inside = alt.ss_sp + 0x4000;
        let (frame, _) = get_signal_stack(&alt, sp_inside, 0);
        let frame_end = frame as u64 + core::mem::size_of::<SigFrame>() as u64;
        // No double switch: stays below the in-use alt-stack position.
        assert!(frame_end <= sp_inside - RED_ZONE_SIZE);
    }

    #[test]
    fn test_xstate_alignment() {
        let sp = 0x7000_0000_0000u64;
        let (frame, xstate) = get_signal_stack(&disabled(), sp, 2696);
        assert!(!xstate.is_null());
        assert_eq!(xstate as u64 % XSTATE_ALIGN, 0);
        assert!((frame as u64 + core::mem::size_of::<SigFrame>() as u64) <= xstate as u64);
    }

    #[test]
    fn test_xstate_size_parsing() {
        assert_eq!(xstate_size_of(core::ptr::null()), 0);

        // A legacy image without the magics reports the fxsave size.
        let mut buf = alloc::vec![0u8; 4096];
        let base = {
            let addr = buf.as_mut_ptr() as usize;
            (addr + 63) & !63
        } as *mut XregsState;
        assert_eq!(xstate_size_of(base), core::mem::size_of::<FpState>());

        // With both magics in place the extended size wins.
        unsafe {
            let sw = &mut (*base).fpstate.sw_reserved;
            sw.magic1 = FP_XSTATE_MAGIC1;
            sw.xstate_size = 832;
            sw.extended_size = 832 + FP_XSTATE_MAGIC2_SIZE;
            *((base as *mut u8).add(832) as *mut u32) = FP_XSTATE_MAGIC2;
        }
        assert_eq!(xstate_size_of(base), 836);
    }
}
