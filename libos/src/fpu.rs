//! Extended FP state primitives
//!
//! Saving and resetting the x87/SSE/AVX register file around sysret-path
//! signal delivery. The image format is whatever `xsave` produces for the
//! currently enabled feature set, with the software-reserved magic fields
//! filled in so consumers can size the area from the frame alone.

use crate::signal::ucontext::{
    FpState, XregsState, FP_XSTATE_MAGIC1, FP_XSTATE_MAGIC2, FP_XSTATE_MAGIC2_SIZE,
};
use core::arch::asm;
use core::arch::x86_64::__cpuid_count;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Cached `(image_size << 1) | xsave_enabled`; 0 means not probed yet.
static XSTATE: AtomicUsize = AtomicUsize::new(0);

fn probe() -> usize {
    // CPUID.1:ECX bit 27 (OSXSAVE): the OS exposes xsave/xgetbv.
    let leaf1 = unsafe { __cpuid_count(1, 0) };
    let osxsave = leaf1.ecx & (1 << 27) != 0;
    let (enabled, image_size) = if osxsave {
        // CPUID.0xD.0:EBX is the xsave image size for the enabled features.
        let leafd = unsafe { __cpuid_count(0xd, 0) };
        let size = leafd.ebx as usize;
        if size >= core::mem::size_of::<FpState>() {
            (1, size)
        } else {
            (0, core::mem::size_of::<FpState>())
        }
    } else {
        (0, core::mem::size_of::<FpState>())
    };
    let packed = (image_size << 1) | enabled;
    XSTATE.store(packed, Ordering::Relaxed);
    packed
}

fn state() -> usize {
    let packed = XSTATE.load(Ordering::Relaxed);
    if packed != 0 {
        packed
    } else {
        probe()
    }
}

/// Whether the extended (`xsave`) image format is in use.
pub fn xstate_enabled() -> bool {
    state() & 1 != 0
}

/// Bytes a signal frame must reserve for the FP area: the save image plus
/// the trailing end-marker magic.
pub fn xstate_size() -> usize {
    (state() >> 1) + FP_XSTATE_MAGIC2_SIZE as usize
}

fn xfeatures_in_use() -> u64 {
    if !xstate_enabled() {
        return 0;
    }
    let lo: u32;
    let hi: u32;
    unsafe {
        asm!("xgetbv", in("ecx") 0u32, out("eax") lo, out("edx") hi, options(nomem, nostack));
    }
    ((hi as u64) << 32) | lo as u64
}

/// Save the FP register file into `dst` and describe it in `sw_reserved`.
///
/// # Safety
///
/// `dst` must point to at least [`xstate_size`] zeroed bytes, 64-byte
/// aligned.
pub unsafe fn xstate_save(dst: *mut XregsState) {
    let image_size = state() >> 1;
    unsafe {
        if xstate_enabled() {
            asm!(
                "xsave64 [{area}]",
                area = in(reg) dst,
                in("eax") u32::MAX,
                in("edx") u32::MAX,
                options(nostack),
            );
            // Mark the image as extended so consumers can size it from the
            // frame alone; a plain fxsave image keeps the magics clear and
            // is sized as legacy.
            let sw = &mut (*dst).fpstate.sw_reserved;
            sw.magic1 = FP_XSTATE_MAGIC1;
            sw.xstate_size = image_size as u32;
            sw.extended_size = image_size as u32 + FP_XSTATE_MAGIC2_SIZE;
            sw.xfeatures = xfeatures_in_use();
            *((dst as *mut u8).add(image_size) as *mut u32) = FP_XSTATE_MAGIC2;
        } else {
            asm!("fxsave64 [{area}]", area = in(reg) dst, options(nostack));
        }
    }
}

/// Put the FP unit into its boot state before entering a signal handler.
pub fn xstate_reset() {
    let default_mxcsr: u32 = 0x1f80;
    unsafe {
        asm!(
            "fninit",
            "ldmxcsr [{mxcsr}]",
            mxcsr = in(reg) &default_mxcsr,
            options(nostack),
        );
    }
}
