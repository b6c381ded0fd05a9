//! Property-based tests for the memory, dirty-tracking, and IOMMU
//! invariants the engine must hold under arbitrary input (§8 "Invariants to
//! assert (property-based)").
//!
//! Mirrors the teacher's own `zerovisor-core/tests/property_vm.rs` shape
//! (a `tests/` integration suite driven by `proptest!`, asserting one
//! invariant per block rather than example-by-example).

use proptest::prelude::*;

use zerovisor_core::{DirtyBitmap, IommuController, Isolation};
use zerovisor_hal::page_table::PageFlags;
use zerovisor_hal::radix_table::{RadixTable, TranslateFault};

fn arb_page_aligned(max_pages: u64) -> impl Strategy<Value = u64> {
    (0..max_pages).prop_map(|p| p * 4096)
}

proptest! {
    /// §8 invariant 1: every mapped GPA translates back to exactly the HPA
    /// and flags it was mapped with; every other GPA in the same table is
    /// classified `NotPresent`.
    #[test]
    fn mapped_gpa_translates_to_its_hpa(
        gpa in arb_page_aligned(1 << 20),
        hpa in arb_page_aligned(1 << 20),
        writable in any::<bool>(),
    ) {
        let mut table = RadixTable::new();
        let mut flags = PageFlags::PRESENT;
        if writable {
            flags |= PageFlags::WRITABLE;
        }
        table.map(gpa, hpa, 4096, flags).unwrap();

        let (resolved_hpa, resolved_flags) = table.translate(gpa).unwrap();
        prop_assert_eq!(resolved_hpa, hpa);
        prop_assert_eq!(resolved_flags.contains(PageFlags::WRITABLE), writable);

        // A different page-aligned address in the same table, never mapped,
        // must classify as NotPresent (unless the randomly chosen probe
        // happens to coincide with `gpa`, in which case the round-trip
        // above already covers it).
        let probe = gpa ^ 4096;
        if probe != gpa {
            prop_assert_eq!(table.translate(probe), Err(TranslateFault::NotPresent));
        }
    }

    /// §8 invariant 5: `dirty_pages()` is non-decreasing as marks accumulate
    /// within one generation; `drain()` always bumps the generation and
    /// empties the set.
    #[test]
    fn dirty_bitmap_is_monotonic_within_a_generation(
        pages in proptest::collection::vec(0u64..4096, 1..64),
    ) {
        let bitmap = DirtyBitmap::new(4096);
        bitmap.enable();
        let mut previous_len = 0usize;
        for &page in &pages {
            bitmap.mark_dirty(page);
            let current = bitmap.dirty_pages();
            prop_assert!(current.len() >= previous_len);
            previous_len = current.len();
        }
        let generation_before = bitmap.generation();
        let drained = bitmap.drain();
        prop_assert!(!drained.is_empty() || pages.is_empty());
        prop_assert_eq!(bitmap.generation(), generation_before + 1);
        prop_assert!(bitmap.dirty_pages().is_empty());
    }

    /// §8 invariant 2: once a Strict device's fault count reaches
    /// `max_faults`, it stops being operational and its mappings are torn
    /// down, regardless of how many further faults it accumulates or what
    /// GPAs they target.
    #[test]
    fn quarantined_device_has_no_live_mappings(
        max_faults in 1u32..8,
        fault_gpas in proptest::collection::vec(arb_page_aligned(256), 1..16),
    ) {
        let ctl = IommuController::new(4096);
        let domain = ctl.assign_device(0x0A0A, Isolation::Strict, max_faults).unwrap();
        ctl.map(domain, 0, 0x1000, 4096, PageFlags::PRESENT | PageFlags::WRITABLE).unwrap();

        let mut quarantined = false;
        for &gpa in &fault_gpas {
            let became_quarantined = ctl
                .record_fault(0x0A0A, zerovisor_core::iommu::FaultRecord { gpa, write: true })
                .unwrap();
            quarantined = quarantined || became_quarantined;
        }

        if quarantined {
            prop_assert!(!ctl.is_operational(0x0A0A).unwrap());
            // The domain's page tables were torn down on quarantine; the
            // mapping established before any fault must no longer resolve.
            prop_assert!(ctl.translate(domain, 0).is_err());
        }
    }
}
