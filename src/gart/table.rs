use crate::backend::{
    ApertureSize, GattEntry, GattStore, HardwareBackend, MemoryType, PAGE_SHIFT,
};
use crate::error::{GartError, GartResult};
use crate::gart::memory::MemoryBlock;
use log::info;

/// The GART page table covering the mapped aperture.
///
/// Storage lives behind [`GattStore`], so the table addresses slots by index
/// whether the chipset keeps one flat array or pages the table itself. Every
/// slot is either the scratch encoding (empty) or one page of exactly one
/// bound block.
pub struct AperturePageTable {
    store: Box<dyn GattStore>,
    size: ApertureSize,
    scratch: GattEntry,
    reserved_entries: usize,
}

impl AperturePageTable {
    /// Builds the table at the largest aperture size the backend can back,
    /// walking the size list downward on allocation failure, and fills
    /// every slot with the scratch encoding.
    ///
    /// `reserved_bytes` is aperture space carved out for other consumers;
    /// those entries exist but are never handed to the bind path.
    ///
    /// # Errors
    /// `NoMemoryForTable` when even the smallest size cannot be allocated.
    pub fn create(
        backend: &mut dyn HardwareBackend,
        scratch: GattEntry,
        reserved_bytes: u64,
    ) -> GartResult<Self> {
        let sizes = backend.aperture_sizes().to_vec();

        for (attempt, size) in sizes.iter().enumerate() {
            let Ok(mut store) = backend.create_gatt(*size) else {
                continue;
            };
            if attempt > 0 {
                info!("aperture downsized to {} MiB", size.size_mb);
            }
            for index in 0..store.num_entries() {
                store.write(index, scratch);
            }
            backend.cache_flush();
            return Ok(Self {
                store,
                size: *size,
                scratch,
                reserved_entries: (reserved_bytes >> PAGE_SHIFT) as usize,
            });
        }
        Err(GartError::NoMemoryForTable)
    }

    #[must_use]
    pub fn size(&self) -> ApertureSize {
        self.size
    }

    #[must_use]
    pub fn bus_address(&self) -> u64 {
        self.store.bus_address()
    }

    #[must_use]
    pub fn num_entries(&self) -> usize {
        self.store.num_entries()
    }

    /// Entries the bind path may use: the table minus the reserved carve-out.
    #[must_use]
    pub fn usable_entries(&self) -> usize {
        self.store.num_entries().saturating_sub(self.reserved_entries)
    }

    /// Claims `[pg_start, pg_start + block.page_count())` for `block`.
    ///
    /// Generic blocks go through the occupancy-checked path here; vendor
    /// types are handed to the backend's own insert, which owns their range
    /// policy. The TLB is flushed after every successful insert; most
    /// chipsets can only flush the whole table, and the whole-table flush is
    /// kept even where a range flush exists.
    ///
    /// # Errors
    /// `InvalidRange`, `Occupied` or `TypeMismatch` per the rules above.
    pub fn insert(
        &mut self,
        backend: &mut dyn HardwareBackend,
        block: &MemoryBlock,
        pg_start: usize,
    ) -> GartResult<()> {
        if block.mem_type() != MemoryType::Generic {
            backend.insert_typed(self.store.as_mut(), block.pages(), pg_start, block.mem_type())?;
            backend.tlb_flush();
            return Ok(());
        }

        let end = pg_start
            .checked_add(block.page_count())
            .ok_or(GartError::InvalidRange)?;
        if end > self.usable_entries() {
            return Err(GartError::InvalidRange);
        }
        for index in pg_start..end {
            if self.store.read(index) != self.scratch {
                return Err(GartError::Occupied);
            }
        }

        for (offset, page) in block.pages().iter().enumerate() {
            self.store
                .write(pg_start + offset, backend.mask_memory(*page, MemoryType::Generic));
        }
        backend.tlb_flush();
        Ok(())
    }

    /// Returns a bound block's slots to the scratch encoding.
    ///
    /// # Errors
    /// `NotBound` if the block is not currently bound; `TypeMismatch` from
    /// the vendor path.
    pub fn remove(
        &mut self,
        backend: &mut dyn HardwareBackend,
        block: &MemoryBlock,
    ) -> GartResult<()> {
        let pg_start = block.aperture_offset().ok_or(GartError::NotBound)?;

        if block.mem_type() != MemoryType::Generic {
            backend.remove_typed(
                self.store.as_mut(),
                pg_start,
                block.page_count(),
                block.mem_type(),
            )?;
            backend.tlb_flush();
            return Ok(());
        }

        for index in pg_start..pg_start + block.page_count() {
            self.store.write(index, self.scratch);
        }
        backend.tlb_flush();
        Ok(())
    }

    /// Slot contents at `index`; test and diagnostic use.
    #[must_use]
    pub fn entry(&self, index: usize) -> GattEntry {
        self.store.read(index)
    }

    /// True if `index` holds the scratch encoding.
    #[must_use]
    pub fn is_scratch(&self, index: usize) -> bool {
        self.store.read(index) == self.scratch
    }

    /// Releases the table storage. Only called during full teardown, after
    /// all memory has been freed; bound blocks at this point are a caller
    /// bug.
    pub fn free(self, backend: &mut dyn HardwareBackend) {
        backend.free_gatt(self.store);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PhysPage;
    use crate::backend::sim::{SIM_FIXED_PHYS, SimBackend};

    fn table_on(sim: &mut SimBackend) -> AperturePageTable {
        let scratch = sim.alloc_scratch_page().unwrap();
        AperturePageTable::create(sim, scratch, 0).unwrap()
    }

    fn generic_block(sim: &mut SimBackend, key: u32, pages: usize) -> MemoryBlock {
        let pages: Vec<PhysPage> = (0..pages).map(|_| sim.alloc_page().unwrap()).collect();
        let physical = pages.first().map_or(0, |p| p.0);
        MemoryBlock::new(key, pages, MemoryType::Generic, physical)
    }

    #[test]
    fn create_fills_every_slot_with_scratch() {
        let mut sim = SimBackend::new();
        let table = table_on(&mut sim);

        assert_eq!(table.size().size_mb, 256);
        for index in [0, 1, table.num_entries() / 2, table.num_entries() - 1] {
            assert!(table.is_scratch(index));
        }
    }

    #[test]
    fn create_walks_down_the_size_list() {
        // A budget of 8 table pages backs 4096 entries: 16 MiB at most.
        let mut sim = SimBackend::new().with_table_page_budget(8);
        let table = table_on(&mut sim);
        assert_eq!(table.size().size_mb, 16);
    }

    #[test]
    fn create_fails_when_no_size_fits() {
        let mut sim = SimBackend::new().with_table_page_budget(0);
        let scratch = sim.alloc_scratch_page().unwrap();
        assert!(matches!(
            AperturePageTable::create(&mut sim, scratch, 0),
            Err(GartError::NoMemoryForTable)
        ));
    }

    #[test]
    fn insert_remove_round_trip_restores_scratch() {
        let mut sim = SimBackend::new();
        let mut table = table_on(&mut sim);
        let mut block = generic_block(&mut sim, 0, 4);

        table.insert(&mut sim, &block, 10).unwrap();
        block.set_bound(10);
        for index in 10..14 {
            assert!(!table.is_scratch(index));
        }

        table.remove(&mut sim, &block).unwrap();
        for index in 10..14 {
            assert!(table.is_scratch(index));
        }
    }

    #[test]
    fn insert_rejects_occupied_slots() {
        let mut sim = SimBackend::new();
        let mut table = table_on(&mut sim);
        let mut first = generic_block(&mut sim, 0, 4);
        let second = generic_block(&mut sim, 1, 4);

        table.insert(&mut sim, &first, 0).unwrap();
        first.set_bound(0);

        // Overlap anywhere in the target range fails without side effects.
        assert_eq!(table.insert(&mut sim, &second, 2), Err(GartError::Occupied));
        assert!(table.is_scratch(4));
        table.insert(&mut sim, &second, 4).unwrap();
    }

    #[test]
    fn insert_checks_the_usable_range() {
        let mut sim = SimBackend::new();
        let mut table = table_on(&mut sim);
        let entries = table.num_entries();
        let block = generic_block(&mut sim, 0, 4);

        assert_eq!(
            table.insert(&mut sim, &block, entries - 3),
            Err(GartError::InvalidRange)
        );
        table.insert(&mut sim, &block, entries - 4).unwrap();
    }

    #[test]
    fn reserved_entries_shrink_the_usable_range() {
        let mut sim = SimBackend::new();
        let scratch = sim.alloc_scratch_page().unwrap();
        // Reserve 1 MiB: 256 entries off the end.
        let mut table = AperturePageTable::create(&mut sim, scratch, 1 << 20).unwrap();
        assert_eq!(table.usable_entries(), table.num_entries() - 256);

        let block = generic_block(&mut sim, 0, 1);
        assert_eq!(
            table.insert(&mut sim, &block, table.usable_entries()),
            Err(GartError::InvalidRange)
        );
    }

    #[test]
    fn every_mutation_flushes_the_tlb() {
        let mut sim = SimBackend::new();
        let mut table = table_on(&mut sim);
        let mut block = generic_block(&mut sim, 0, 2);

        let baseline = sim.tlb_flushes();
        table.insert(&mut sim, &block, 0).unwrap();
        assert_eq!(sim.tlb_flushes(), baseline + 1);

        block.set_bound(0);
        table.remove(&mut sim, &block).unwrap();
        assert_eq!(sim.tlb_flushes(), baseline + 2);
    }

    #[test]
    fn vendor_blocks_go_through_the_backend_path() {
        let mut sim = SimBackend::new();
        let mut table = table_on(&mut sim);

        let typed = sim.alloc_typed(1, SIM_FIXED_PHYS).unwrap();
        let mut block = MemoryBlock::new(3, typed.pages, SIM_FIXED_PHYS, typed.physical);

        table.insert(&mut sim, &block, 8).unwrap();
        assert!(!table.is_scratch(8));

        block.set_bound(8);
        table.remove(&mut sim, &block).unwrap();
        assert!(table.is_scratch(8));
    }

    #[test]
    fn two_level_storage_behaves_identically() {
        let mut sim = SimBackend::new().paged_table();
        let mut table = table_on(&mut sim);
        let mut block = generic_block(&mut sim, 0, 3);

        // Straddle a table-page boundary (512 entries per table page).
        table.insert(&mut sim, &block, 511).unwrap();
        block.set_bound(511);
        assert!(!table.is_scratch(511));
        assert!(!table.is_scratch(513));

        table.remove(&mut sim, &block).unwrap();
        assert!(table.is_scratch(511));
        assert!(table.is_scratch(513));
    }
}
