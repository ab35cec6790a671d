//! Virtual Memory Area (VMA) bookkeeping
//!
//! Tracks the application's memory mappings so the fault router can decide
//! between SIGSEGV and SIGBUS and the enclave-mode probes can check
//! addressability without touching memory.

use alloc::vec::Vec;
use bitflags::bitflags;
use spin::RwLock;

bitflags! {
    /// VMA protection bits (matches Linux `PROT_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmaProt: u32 {
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
    }
}

bitflags! {
    /// VMA kind bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmaFlags: u32 {
        /// Mapping belongs to the LibOS itself; application faults inside it
        /// are internal errors, never user signals.
        const INTERNAL = 1 << 0;
        const ANONYMOUS = 1 << 1;
        const PRIVATE = 1 << 2;
    }
}

/// File backing of a mapping, as far as fault classification cares.
#[derive(Debug, Clone, Copy)]
pub struct VmaFile {
    /// Current size of the backing file in bytes.
    pub size: u64,
}

/// One contiguous mapping.
#[derive(Debug, Clone)]
pub struct Vma {
    /// Page-aligned start address
    pub start: u64,
    /// Page-aligned end address (exclusive)
    pub end: u64,
    pub prot: VmaProt,
    pub flags: VmaFlags,
    /// File offset the mapping starts at; 0 for anonymous mappings.
    pub offset: u64,
    /// Backing file, if any.
    pub file: Option<VmaFile>,
}

impl Vma {
    /// Check if this VMA contains the given address
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// End of the backing file as an address within this mapping, if the
    /// mapping is file-backed.
    pub fn eof_in_vma(&self) -> Option<u64> {
        let file = self.file.as_ref()?;
        Some(self.start + file.size.saturating_sub(self.offset))
    }
}

/// All mappings of the (single) application address space, sorted by start.
static VMA_TABLE: RwLock<Vec<Vma>> = RwLock::new(Vec::new());

/// Register a new mapping.
pub fn add_vma(vma: Vma) {
    let mut table = VMA_TABLE.write();
    let pos = table.partition_point(|v| v.start < vma.start);
    table.insert(pos, vma);
}

/// Look up the mapping containing `addr`.
pub fn lookup_vma(addr: u64) -> Option<Vma> {
    let table = VMA_TABLE.read();
    table.iter().find(|vma| vma.contains(addr)).cloned()
}

/// Remove mappings overlapping `[start, end)`, splitting partial overlaps.
pub fn remove_vma_range(start: u64, end: u64) {
    let mut table = VMA_TABLE.write();
    let mut new_table = Vec::new();
    for vma in table.drain(..) {
        if vma.end <= start || vma.start >= end {
            new_table.push(vma);
        } else {
            if vma.start < start {
                let mut left = vma.clone();
                left.end = start;
                new_table.push(left);
            }
            if vma.end > end {
                let mut right = vma.clone();
                right.offset += end - right.start;
                right.start = end;
                new_table.push(right);
            }
        }
    }
    *table = new_table;
}

/// Check that `[addr, addr + size)` is fully covered by mappings with no
/// hole between them. This is the probe path on enclave PALs, where fault
/// addresses are not reliable enough for touch-and-trap.
pub fn is_in_adjacent_vmas(addr: u64, size: u64) -> bool {
    let Some(end) = addr.checked_add(size) else {
        return false;
    };
    let table = VMA_TABLE.read();
    let mut cursor = addr;
    for vma in table.iter() {
        if vma.end <= cursor {
            continue;
        }
        if vma.start > cursor {
            return false;
        }
        cursor = vma.end;
        if cursor >= end {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anon(start: u64, end: u64, prot: VmaProt) -> Vma {
        Vma {
            start,
            end,
            prot,
            flags: VmaFlags::ANONYMOUS | VmaFlags::PRIVATE,
            offset: 0,
            file: None,
        }
    }

    #[test]
    fn test_lookup() {
        add_vma(anon(0x7000_0000, 0x7000_2000, VmaProt::READ | VmaProt::WRITE));
        let vma = lookup_vma(0x7000_1fff).unwrap();
        assert_eq!(vma.start, 0x7000_0000);
        assert!(lookup_vma(0x7000_2000).is_none());
        remove_vma_range(0x7000_0000, 0x7000_2000);
        assert!(lookup_vma(0x7000_0000).is_none());
    }

    #[test]
    fn test_adjacency() {
        add_vma(anon(0x6100_0000, 0x6100_1000, VmaProt::READ));
        add_vma(anon(0x6100_1000, 0x6100_3000, VmaProt::READ));
        assert!(is_in_adjacent_vmas(0x6100_0000, 0x3000));
        assert!(is_in_adjacent_vmas(0x6100_0800, 0x1000));
        // Hole right after the second mapping.
        assert!(!is_in_adjacent_vmas(0x6100_0000, 0x4000));
        assert!(!is_in_adjacent_vmas(0x60ff_f000, 0x2000));
        remove_vma_range(0x6100_0000, 0x6100_3000);
    }

    #[test]
    fn test_split_on_remove() {
        add_vma(anon(0x6200_0000, 0x6200_4000, VmaProt::READ));
        remove_vma_range(0x6200_1000, 0x6200_2000);
        assert!(lookup_vma(0x6200_0000).is_some());
        assert!(lookup_vma(0x6200_1000).is_none());
        let right = lookup_vma(0x6200_2000).unwrap();
        assert_eq!(right.offset, 0x2000);
        remove_vma_range(0x6200_0000, 0x6200_4000);
    }

    #[test]
    fn test_eof_in_vma() {
        let vma = Vma {
            start: 0x6300_0000,
            end: 0x6300_4000,
            prot: VmaProt::READ,
            flags: VmaFlags::PRIVATE,
            offset: 0x1000,
            file: Some(VmaFile { size: 0x2800 }),
        };
        assert_eq!(vma.eof_in_vma(), Some(0x6300_1800));
        assert!(anon(0, 0x1000, VmaProt::READ).eof_in_vma().is_none());
    }
}
