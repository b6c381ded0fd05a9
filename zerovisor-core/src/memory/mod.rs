//! Memory subsystem: guest RAM arena, the 4-level EPT/NPT wrapping
//! [`zerovisor_hal::RadixTable`], and the dirty bitmap (§4.3).

pub mod dirty;

use std::sync::RwLock;

use thiserror::Error;
use zerovisor_hal::addr::{is_page_aligned, page_index, PAGE_SIZE};
use zerovisor_hal::page_table::PageFlags;
use zerovisor_hal::radix_table::{RadixTable, TranslateFault};

pub use dirty::DirtyBitmap;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    #[error("address or length is not 4 KiB aligned")]
    Unaligned,
    #[error("page fault: not present at {0:#x}")]
    NotPresent(u64),
    #[error("page fault: write to read-only page at {0:#x}")]
    WriteProtected(u64),
    #[error("EPT misconfiguration at {0:#x} (reserved bits set)")]
    Misconfigured(u64),
    #[error("access at {0:#x} falls outside guest RAM and outside the MMIO window")]
    OutOfRange(u64),
}

/// Classification of an EPT_VIOLATION qualification, used by the exit
/// dispatcher to decide whether to demand-map, forward to the DeviceBus, or
/// surface a fatal fault (§4.2 "EPT_VIOLATION").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// Not-present fault on a GPA within guest RAM: a demand-map event.
    DemandMap { gpa: u64, write: bool },
    /// Violation inside the MMIO window: forward to `DeviceBus`.
    Mmio { gpa: u64, write: bool },
    /// Outside both ranges, or a misconfiguration: fatal.
    Fatal(MemoryError),
}

/// Guest RAM: a contiguous host allocation exclusively owned by the VM.
pub struct GuestRam {
    bytes: RwLock<Vec<u8>>,
    mmio_base: u64,
    mmio_len: u64,
}

impl GuestRam {
    pub fn new(memory_size: u64, mmio_base: u64, mmio_len: u64) -> Self {
        assert!(is_page_aligned(memory_size), "guest memory size must be 4 KiB aligned");
        Self { bytes: RwLock::new(vec![0u8; memory_size as usize]), mmio_base, mmio_len }
    }

    pub fn len(&self) -> u64 {
        self.bytes.read().unwrap().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&self, gpa: u64, out: &mut [u8]) -> Result<(), MemoryError> {
        let guard = self.bytes.read().unwrap();
        let start = gpa as usize;
        let end = start.checked_add(out.len()).ok_or(MemoryError::OutOfRange(gpa))?;
        let slice = guard.get(start..end).ok_or(MemoryError::OutOfRange(gpa))?;
        out.copy_from_slice(slice);
        Ok(())
    }

    pub fn write(&self, gpa: u64, data: &[u8]) -> Result<(), MemoryError> {
        let mut guard = self.bytes.write().unwrap();
        let start = gpa as usize;
        let end = start.checked_add(data.len()).ok_or(MemoryError::OutOfRange(gpa))?;
        let slice = guard.get_mut(start..end).ok_or(MemoryError::OutOfRange(gpa))?;
        slice.copy_from_slice(data);
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.read().unwrap().clone()
    }

    pub fn restore(&self, data: &[u8]) {
        let mut guard = self.bytes.write().unwrap();
        guard.clear();
        guard.extend_from_slice(data);
    }

    pub fn is_mmio(&self, gpa: u64) -> bool {
        gpa >= self.mmio_base && gpa < self.mmio_base + self.mmio_len
    }

    pub fn is_ram(&self, gpa: u64) -> bool {
        gpa < self.len()
    }
}

/// Extended/Nested Page Table: translates GPA to HPA, where HPA here is an
/// offset into the VM's [`GuestRam`] arena (or, for MMIO/pass-through
/// regions, an opaque host address the embedder assigned).
pub struct Ept {
    table: RwLock<RadixTable>,
    dirty: DirtyBitmap,
}

impl Ept {
    pub fn new(guest_memory_size: u64) -> Self {
        Self {
            table: RwLock::new(RadixTable::new()),
            dirty: DirtyBitmap::new(guest_memory_size / PAGE_SIZE),
        }
    }

    pub fn dirty_tracker(&self) -> &DirtyBitmap {
        &self.dirty
    }

    /// Creates or updates PTEs covering `[gpa, gpa+len)`. `len` must be a
    /// multiple of 4 KiB; both addresses must be 4 KiB aligned (§4.3 `map`).
    pub fn map(&self, gpa: u64, hpa: u64, len: u64, flags: PageFlags) -> Result<(), MemoryError> {
        self.table.write().unwrap().map(gpa, hpa, len, flags).map_err(|_| MemoryError::Unaligned)
    }

    /// Clears PTEs and (conceptually) issues the TLB invalidation the
    /// dispatcher's re-entry rendezvous observes (§4.3 `unmap`).
    pub fn unmap(&self, gpa: u64, len: u64) -> Result<(), MemoryError> {
        self.table.write().unwrap().unmap(gpa, len).map_err(|_| MemoryError::Unaligned)
    }

    /// Walks the table and returns `(hpa, flags)` or a fault classification
    /// (§4.3 `translate`).
    pub fn translate(&self, gpa: u64) -> Result<(u64, PageFlags), MemoryError> {
        self.table.read().unwrap().translate(gpa).map_err(|fault| match fault {
            TranslateFault::NotPresent => MemoryError::NotPresent(gpa),
            TranslateFault::WriteProtected => MemoryError::WriteProtected(gpa),
            TranslateFault::Misconfigured => MemoryError::Misconfigured(gpa),
        })
    }

    /// Sets the corresponding dirty bitmap bit. Called by the
    /// hardware-assisted dirty-tracking path or by MMIO write-emulation.
    pub fn mark_dirty(&self, gpa: u64) {
        self.dirty.mark_dirty(page_index(gpa));
    }

    /// Classifies an EPT_VIOLATION qualification per §4.2/§4.3's failure
    /// semantics: a not-present fault inside RAM is a demand-map event; a
    /// fault inside the MMIO window forwards to the device bus; anything
    /// else is fatal.
    pub fn classify_violation(&self, ram: &GuestRam, gpa: u64, write: bool) -> FaultClass {
        match self.translate(gpa) {
            Ok(_) => FaultClass::Fatal(MemoryError::Misconfigured(gpa)),
            Err(MemoryError::NotPresent(_)) if ram.is_ram(gpa) => FaultClass::DemandMap { gpa, write },
            Err(MemoryError::NotPresent(_)) if ram.is_mmio(gpa) => FaultClass::Mmio { gpa, write },
            Err(MemoryError::NotPresent(_)) => FaultClass::Fatal(MemoryError::OutOfRange(gpa)),
            Err(MemoryError::Misconfigured(_)) => FaultClass::Fatal(MemoryError::Misconfigured(gpa)),
            Err(other) => FaultClass::Fatal(other),
        }
    }

    /// Satisfies a demand-map miss inside RAM by lazily mapping a zero page.
    pub fn demand_map_zero_page(&self, gpa: u64, hpa: u64) -> Result<(), MemoryError> {
        let page_gpa = gpa & !(PAGE_SIZE - 1);
        let page_hpa = hpa & !(PAGE_SIZE - 1);
        self.map(page_gpa, page_hpa, PAGE_SIZE, PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_ram_write_then_read_round_trips() {
        let ram = GuestRam::new(4096 * 4, 0x1000_0000, 4096);
        ram.write(0x1000, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        ram.read(0x1000, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn translate_unmapped_is_not_present() {
        let ept = Ept::new(4096 * 16);
        assert_eq!(ept.translate(0x2000), Err(MemoryError::NotPresent(0x2000)));
    }

    #[test]
    fn map_then_translate_round_trips_flags() {
        let ept = Ept::new(4096 * 16);
        ept.map(0x1000, 0x5000, PAGE_SIZE, PageFlags::PRESENT | PageFlags::WRITABLE).unwrap();
        let (hpa, flags) = ept.translate(0x1000).unwrap();
        assert_eq!(hpa, 0x5000);
        assert!(flags.contains(PageFlags::WRITABLE));
    }

    #[test]
    fn classify_violation_routes_demand_map_vs_mmio_vs_fatal() {
        let ram = GuestRam::new(4096 * 16, 0x1_0000_0000, 4096);
        let ept = Ept::new(4096 * 16);
        assert_eq!(ept.classify_violation(&ram, 0x1000, true), FaultClass::DemandMap { gpa: 0x1000, write: true });
        assert_eq!(ept.classify_violation(&ram, 0x1_0000_0000, false), FaultClass::Mmio { gpa: 0x1_0000_0000, write: false });
        assert_eq!(ept.classify_violation(&ram, 0xFFFF_0000, false), FaultClass::Fatal(MemoryError::OutOfRange(0xFFFF_0000)));
    }

    #[test]
    fn demand_map_then_write_marks_dirty() {
        let ept = Ept::new(4096 * 16);
        ept.dirty_tracker().enable();
        ept.demand_map_zero_page(0x10_0000 & 0xF_FFFF, 0x2000).unwrap();
        ept.mark_dirty(0x10_0000 & 0xF_FFFF);
        assert!(ept.dirty_tracker().dirty_pages().contains(&page_index(0x10_0000 & 0xF_FFFF)));
    }
}
