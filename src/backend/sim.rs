//! Simulated chipset backend.
//!
//! This module provides an in-memory [`HardwareBackend`] so the generic
//! engine can be exercised without real bridge hardware: a fake physical
//! page allocator with page-attribute bookkeeping, a scratch page, flat and
//! paged GATT storage, and one vendor memory type. It doubles as the test
//! backend and as the driver for the demo binaries.

use super::{
    AgpMode, ApertureSize, GattEntry, GattStore, HardwareBackend, MemoryType, PAGE_SIZE, PhysPage,
    TypedPages, negotiate_mode,
};
use crate::error::{GartError, GartResult};
use log::{debug, warn};
use std::collections::HashMap;

/// Vendor memory type understood by the simulated chipset: a single page at
/// a stable physical address, in the manner of the i810 "physical memory"
/// class consumed by cursor and overlay registers.
pub const SIM_FIXED_PHYS: MemoryType = MemoryType::Vendor(1);

/// PTE valid bit used by the simulated encoding.
const PTE_VALID: GattEntry = 0b001;
/// Extra PTE bit the vendor type carries.
const PTE_FIXED: GattEntry = 0b100;

/// Slots held by one page of table storage in the paged variant.
const SLOTS_PER_TABLE_PAGE: usize = PAGE_SIZE / size_of::<GattEntry>();

/// Cache mode tracked per simulated page frame.
///
/// Pages handed to the GART stay uncached for as long as the hardware can
/// reach them and are reclassified write-back when returned, mirroring the
/// page-attribute pairing real backends perform around alloc and free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    WriteBack,
    Uncached,
}

/// Flat single-level GATT storage.
#[derive(Debug)]
pub struct VecGatt {
    bus_address: u64,
    entries: Vec<GattEntry>,
}

impl GattStore for VecGatt {
    fn num_entries(&self) -> usize {
        self.entries.len()
    }

    fn read(&self, index: usize) -> GattEntry {
        self.entries[index]
    }

    fn write(&mut self, index: usize, entry: GattEntry) {
        self.entries[index] = entry;
    }

    fn bus_address(&self) -> u64 {
        self.bus_address
    }
}

/// Two-level GATT storage: a directory of table pages, each holding
/// [`SLOTS_PER_TABLE_PAGE`] entries. Slot indices address it exactly like
/// the flat variant; nothing upstream may assume contiguity.
#[derive(Debug)]
pub struct PagedGatt {
    bus_address: u64,
    num_entries: usize,
    pages: Vec<Vec<GattEntry>>,
}

impl GattStore for PagedGatt {
    fn num_entries(&self) -> usize {
        self.num_entries
    }

    fn read(&self, index: usize) -> GattEntry {
        self.pages[index / SLOTS_PER_TABLE_PAGE][index % SLOTS_PER_TABLE_PAGE]
    }

    fn write(&mut self, index: usize, entry: GattEntry) {
        self.pages[index / SLOTS_PER_TABLE_PAGE][index % SLOTS_PER_TABLE_PAGE] = entry;
    }

    fn bus_address(&self) -> u64 {
        self.bus_address
    }
}

/// The simulated chipset.
pub struct SimBackend {
    sizes: Vec<ApertureSize>,
    size_index: usize,
    aperture_base: u64,
    gatt_base: Option<u64>,

    status: AgpMode,
    device_status: Vec<AgpMode>,
    command: AgpMode,
    claimed: bool,

    next_frame: u64,
    page_attrs: HashMap<u64, CacheMode>,
    scratch: Option<PhysPage>,

    paged_table: bool,
    table_page_budget: Option<usize>,
    fail_configure: bool,
    alloc_successes_left: Option<usize>,

    tlb_flushes: usize,
    cache_flushes: usize,
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sizes: [256, 128, 64, 32, 16, 8, 4]
                .into_iter()
                .map(ApertureSize::new)
                .collect(),
            size_index: 0,
            aperture_base: 0xe000_0000,
            gatt_base: None,
            status: (AgpMode::RATE_1X | AgpMode::RATE_2X | AgpMode::RATE_4X | AgpMode::SBA)
                .with_rq_depth(32),
            device_status: vec![
                (AgpMode::RATE_1X | AgpMode::RATE_2X | AgpMode::RATE_4X | AgpMode::SBA)
                    .with_rq_depth(32),
            ],
            command: AgpMode::empty(),
            claimed: false,
            next_frame: 0x0100_0000,
            page_attrs: HashMap::new(),
            scratch: None,
            paged_table: false,
            table_page_budget: None,
            fail_configure: false,
            alloc_successes_left: None,
            tlb_flushes: 0,
            cache_flushes: 0,
        }
    }

    /// Use the two-level table storage instead of the flat one.
    #[must_use]
    pub fn paged_table(mut self) -> Self {
        self.paged_table = true;
        self
    }

    /// Caps table storage at `pages` table pages, so larger aperture sizes
    /// fail and bring-up has to walk down the size list.
    #[must_use]
    pub fn with_table_page_budget(mut self, pages: usize) -> Self {
        self.table_page_budget = Some(pages);
        self
    }

    /// Makes `configure` fail, for bring-up error paths.
    #[must_use]
    pub fn with_configure_failure(mut self) -> Self {
        self.fail_configure = true;
        self
    }

    /// Lets the next `successes` page allocations succeed, then fails one.
    #[must_use]
    pub fn with_page_alloc_failure_after(mut self, successes: usize) -> Self {
        self.alloc_successes_left = Some(successes);
        self
    }

    /// Replaces the simulated AGP device population behind the bridge.
    #[must_use]
    pub fn with_devices(mut self, device_status: Vec<AgpMode>) -> Self {
        self.device_status = device_status;
        self
    }

    fn alloc_frame(&mut self, mode: CacheMode) -> PhysPage {
        let frame = self.next_frame;
        self.next_frame += PAGE_SIZE as u64;
        self.page_attrs.insert(frame, mode);
        PhysPage(frame)
    }

    fn scratch_entry_value(&self) -> GattEntry {
        self.scratch
            .map_or(0, |page| (page.0 & !0xfff) | PTE_VALID)
    }

    /// Pages currently live in the simulated allocator (scratch included).
    #[must_use]
    pub fn live_pages(&self) -> usize {
        self.page_attrs
            .values()
            .filter(|mode| **mode == CacheMode::Uncached)
            .count()
    }

    /// Cache mode of a live page, if tracked.
    #[must_use]
    pub fn page_attr(&self, page: PhysPage) -> Option<CacheMode> {
        self.page_attrs.get(&page.0).copied()
    }

    #[must_use]
    pub fn tlb_flushes(&self) -> usize {
        self.tlb_flushes
    }

    #[must_use]
    pub fn cache_flushes(&self) -> usize {
        self.cache_flushes
    }

    #[must_use]
    pub fn is_claimed(&self) -> bool {
        self.claimed
    }

    /// Table base the bridge was last programmed with.
    #[must_use]
    pub fn gatt_base(&self) -> Option<u64> {
        self.gatt_base
    }

    #[must_use]
    pub fn command(&self) -> AgpMode {
        self.command
    }
}

impl HardwareBackend for SimBackend {
    fn aperture_sizes(&self) -> &[ApertureSize] {
        &self.sizes
    }

    fn fetch_size(&mut self) -> ApertureSize {
        self.sizes[self.size_index]
    }

    fn configure(&mut self, gatt_base: u64) -> GartResult<u64> {
        if self.fail_configure {
            return Err(GartError::BackendConfigureFailed(
                "simulated bridge rejected the table base".into(),
            ));
        }
        self.gatt_base = Some(gatt_base);
        debug!("sim: table base {gatt_base:#x}, aperture at {:#x}", self.aperture_base);
        Ok(self.aperture_base)
    }

    fn enable(&mut self, requested: AgpMode) -> AgpMode {
        self.command = negotiate_mode(self.status, &self.device_status, requested);
        self.command
    }

    fn acquire(&mut self) -> GartResult<()> {
        if self.claimed {
            return Err(GartError::Busy);
        }
        self.claimed = true;
        Ok(())
    }

    fn release(&mut self) {
        self.claimed = false;
    }

    fn alloc_scratch_page(&mut self) -> GartResult<GattEntry> {
        let page = self.alloc_frame(CacheMode::Uncached);
        self.scratch = Some(page);
        Ok(self.scratch_entry_value())
    }

    fn destroy_scratch_page(&mut self) {
        if let Some(page) = self.scratch.take() {
            self.page_attrs.insert(page.0, CacheMode::WriteBack);
        }
    }

    fn alloc_page(&mut self) -> Option<PhysPage> {
        if let Some(left) = self.alloc_successes_left {
            if left == 0 {
                self.alloc_successes_left = None;
                return None;
            }
            self.alloc_successes_left = Some(left - 1);
        }
        Some(self.alloc_frame(CacheMode::Uncached))
    }

    fn destroy_page(&mut self, page: PhysPage) {
        if self
            .page_attrs
            .insert(page.0, CacheMode::WriteBack)
            .is_none()
        {
            warn!("sim: destroying untracked page {:#x}", page.0);
        }
    }

    fn alloc_typed(&mut self, page_count: usize, mem_type: MemoryType) -> GartResult<TypedPages> {
        if mem_type != SIM_FIXED_PHYS {
            return Err(GartError::TypeMismatch);
        }
        // The fixed-physical class is a single page by definition.
        if page_count != 1 {
            return Err(GartError::OutOfMemory);
        }
        let page = self.alloc_frame(CacheMode::Uncached);
        Ok(TypedPages {
            physical: page.0,
            pages: vec![page],
        })
    }

    fn free_typed(&mut self, pages: Vec<PhysPage>, mem_type: MemoryType) {
        debug_assert_eq!(mem_type, SIM_FIXED_PHYS);
        for page in pages {
            self.destroy_page(page);
        }
    }

    fn insert_typed(
        &mut self,
        gatt: &mut dyn GattStore,
        pages: &[PhysPage],
        pg_start: usize,
        mem_type: MemoryType,
    ) -> GartResult<()> {
        if mem_type != SIM_FIXED_PHYS {
            return Err(GartError::TypeMismatch);
        }
        if pg_start + pages.len() > gatt.num_entries() {
            return Err(GartError::InvalidRange);
        }
        let scratch = self.scratch_entry_value();
        for i in 0..pages.len() {
            if gatt.read(pg_start + i) != scratch {
                return Err(GartError::Occupied);
            }
        }
        for (i, page) in pages.iter().enumerate() {
            gatt.write(pg_start + i, self.mask_memory(*page, mem_type));
        }
        Ok(())
    }

    fn remove_typed(
        &mut self,
        gatt: &mut dyn GattStore,
        pg_start: usize,
        page_count: usize,
        mem_type: MemoryType,
    ) -> GartResult<()> {
        if mem_type != SIM_FIXED_PHYS {
            return Err(GartError::TypeMismatch);
        }
        let scratch = self.scratch_entry_value();
        for i in pg_start..pg_start + page_count {
            gatt.write(i, scratch);
        }
        Ok(())
    }

    fn create_gatt(&mut self, size: ApertureSize) -> GartResult<Box<dyn GattStore>> {
        let table_pages = size.num_entries.div_ceil(SLOTS_PER_TABLE_PAGE);
        if self.table_page_budget.is_some_and(|budget| table_pages > budget) {
            return Err(GartError::OutOfMemory);
        }
        if let Some(index) = self.sizes.iter().position(|s| *s == size) {
            self.size_index = index;
        }
        let bus_address = self.next_frame;
        self.next_frame += (table_pages * PAGE_SIZE) as u64;

        if self.paged_table {
            Ok(Box::new(PagedGatt {
                bus_address,
                num_entries: size.num_entries,
                pages: (0..table_pages)
                    .map(|_| vec![0; SLOTS_PER_TABLE_PAGE])
                    .collect(),
            }))
        } else {
            Ok(Box::new(VecGatt {
                bus_address,
                entries: vec![0; size.num_entries],
            }))
        }
    }

    fn mask_memory(&self, page: PhysPage, mem_type: MemoryType) -> GattEntry {
        let base = (page.0 & !0xfff) | PTE_VALID;
        match mem_type {
            MemoryType::Generic => base,
            MemoryType::Vendor(_) => base | PTE_FIXED,
        }
    }

    fn tlb_flush(&mut self) {
        self.tlb_flushes += 1;
    }

    fn cache_flush(&mut self) {
        self.cache_flushes += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_are_reclassified_when_destroyed() {
        let mut sim = SimBackend::new();
        let page = sim.alloc_page().unwrap();
        assert_eq!(sim.page_attr(page), Some(CacheMode::Uncached));
        assert_eq!(sim.live_pages(), 1);

        sim.destroy_page(page);
        assert_eq!(sim.page_attr(page), Some(CacheMode::WriteBack));
        assert_eq!(sim.live_pages(), 0);
    }

    #[test]
    fn page_alloc_failure_fires_once() {
        let mut sim = SimBackend::new().with_page_alloc_failure_after(2);
        assert!(sim.alloc_page().is_some());
        assert!(sim.alloc_page().is_some());
        assert!(sim.alloc_page().is_none());
        assert!(sim.alloc_page().is_some());
    }

    #[test]
    fn paged_gatt_addresses_like_flat() {
        let mut sim = SimBackend::new().paged_table();
        let mut gatt = sim.create_gatt(ApertureSize::new(8)).unwrap();

        // One entry in the second table page.
        gatt.write(SLOTS_PER_TABLE_PAGE + 3, 0xdead_b001);
        assert_eq!(gatt.read(SLOTS_PER_TABLE_PAGE + 3), 0xdead_b001);
        assert_eq!(gatt.num_entries(), ApertureSize::new(8).num_entries);
    }

    #[test]
    fn fixed_phys_is_single_page_only() {
        let mut sim = SimBackend::new();
        assert_eq!(
            sim.alloc_typed(2, SIM_FIXED_PHYS),
            Err(GartError::OutOfMemory)
        );
        let typed = sim.alloc_typed(1, SIM_FIXED_PHYS).unwrap();
        assert_eq!(typed.pages.len(), 1);
        assert_eq!(typed.physical, typed.pages[0].0);
    }

    #[test]
    fn unknown_vendor_type_is_rejected() {
        let mut sim = SimBackend::new();
        assert_eq!(
            sim.alloc_typed(1, MemoryType::Vendor(7)),
            Err(GartError::TypeMismatch)
        );
    }

    #[test]
    fn acquire_is_exclusive() {
        let mut sim = SimBackend::new();
        sim.acquire().unwrap();
        assert_eq!(sim.acquire(), Err(GartError::Busy));
        sim.release();
        sim.acquire().unwrap();
    }
}
