use crate::backend::{AgpMode, HardwareBackend, MemoryType, PAGE_SHIFT};
use crate::config::GartConfig;
use crate::error::{GartError, GartResult};
use crate::gart::keys::KeySpace;
use crate::gart::memory::MemoryBlock;
use crate::gart::table::AperturePageTable;
use log::info;

/// Interface version reported through [`GartInfo`].
pub const INTERFACE_VERSION: (u32, u32) = (0, 99);

/// System-RAM-to-usable-AGP interpolation table, both columns in MiB.
const MAX_TABLE: [(u64, u64); 9] = [
    (0, 0),
    (32, 4),
    (64, 28),
    (128, 96),
    (256, 204),
    (512, 440),
    (1024, 942),
    (2048, 1920),
    (4096, 3932),
];

/// Ceiling on pages usable for aperture allocation, derived from installed
/// system RAM by linear interpolation between the table breakpoints.
#[must_use]
pub fn max_memory_pages(system_memory_mb: u64) -> usize {
    let mut index = 1;
    while index < MAX_TABLE.len() - 1 && system_memory_mb > MAX_TABLE[index].0 {
        index += 1;
    }
    let (low_mem, low_agp) = MAX_TABLE[index - 1];
    let (high_mem, high_agp) = MAX_TABLE[index];

    let agp_mb =
        low_agp + (system_memory_mb - low_mem) * (high_agp - low_agp) / (high_mem - low_mem);
    (agp_mb as usize) << (20 - PAGE_SHIFT)
}

/// Snapshot answering the Info request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GartInfo {
    pub version: (u32, u32),
    pub aperture_base: u64,
    pub aperture_size_mb: u32,
    pub mode: AgpMode,
    pub max_pages: usize,
    pub current_pages: usize,
}

/// The chipset-independent GART engine.
///
/// Owns the backend, the key space, the aperture page table and the global
/// page accounting. Session bookkeeping (who may call what) lives a layer
/// up; everything here assumes an authorized caller.
pub struct GartManager {
    backend: Box<dyn HardwareBackend>,
    keys: KeySpace,
    table: AperturePageTable,
    aperture_base: u64,
    mode: AgpMode,
    max_pages: usize,
    current_pages: usize,
    reserved_mb: u32,
}

impl GartManager {
    /// Brings the subsystem up: memory ceiling, scratch page, aperture
    /// size negotiation, page table, then chipset configuration, unwinding
    /// completely on failure.
    ///
    /// # Errors
    /// `NoMemoryForTable` or `BackendConfigureFailed`; both are fatal to
    /// the subsystem, no controller can ever be acquired afterwards.
    pub fn bring_up(mut backend: Box<dyn HardwareBackend>, config: &GartConfig) -> GartResult<Self> {
        let max_pages = max_memory_pages(config.system_memory_mb);
        info!(
            "maximum main memory to use for aperture memory: {} MiB",
            max_pages >> (20 - PAGE_SHIFT)
        );

        let scratch = backend.alloc_scratch_page()?;
        let negotiated = backend.fetch_size();

        let table = match AperturePageTable::create(backend.as_mut(), scratch, config.reserved_bytes)
        {
            Ok(table) => table,
            Err(err) => {
                backend.destroy_scratch_page();
                return Err(err);
            }
        };

        let aperture_base = match backend.configure(table.bus_address()) {
            Ok(base) => base,
            Err(err) => {
                table.free(backend.as_mut());
                backend.destroy_scratch_page();
                return Err(err);
            }
        };

        info!(
            "aperture configured: {} MiB at {:#x} (negotiated {} MiB)",
            table.size().size_mb,
            aperture_base,
            negotiated.size_mb
        );

        Ok(Self {
            backend,
            keys: KeySpace::new(),
            table,
            aperture_base,
            mode: AgpMode::empty(),
            max_pages,
            current_pages: 0,
            reserved_mb: (config.reserved_bytes >> 20) as u32,
        })
    }

    /// Tears the subsystem down in reverse bring-up order.
    pub fn tear_down(self) {
        let Self {
            mut backend, table, ..
        } = self;
        table.free(backend.as_mut());
        backend.destroy_scratch_page();
    }

    /// Creates an unbound block of `page_count` pages.
    ///
    /// Vendor types delegate wholly to the backend. The generic path
    /// allocates page by page; any single-page failure tears the whole
    /// block down again, so no partial allocation is ever observable.
    ///
    /// # Errors
    /// `OutOfMemory` against the global ceiling or backend exhaustion,
    /// `Exhausted` when the key space is full, `TypeMismatch` for unknown
    /// vendor types.
    pub fn allocate_memory(
        &mut self,
        page_count: usize,
        mem_type: MemoryType,
    ) -> GartResult<MemoryBlock> {
        if self.current_pages.saturating_add(page_count) > self.max_pages {
            return Err(GartError::OutOfMemory);
        }

        match mem_type {
            MemoryType::Generic => {
                let Some(key) = self.keys.allocate() else {
                    return Err(GartError::Exhausted);
                };
                let mut pages = Vec::with_capacity(page_count);
                for _ in 0..page_count {
                    match self.backend.alloc_page() {
                        Some(page) => pages.push(page),
                        None => {
                            for page in pages {
                                self.backend.destroy_page(page);
                            }
                            self.keys.release(key);
                            return Err(GartError::OutOfMemory);
                        }
                    }
                }
                self.current_pages += page_count;
                let physical = pages.first().map_or(0, |page| page.0);
                Ok(MemoryBlock::new(key, pages, mem_type, physical))
            }
            MemoryType::Vendor(_) => {
                let typed = self.backend.alloc_typed(page_count, mem_type)?;
                let Some(key) = self.keys.allocate() else {
                    self.backend.free_typed(typed.pages, mem_type);
                    return Err(GartError::Exhausted);
                };
                self.current_pages += typed.pages.len();
                Ok(MemoryBlock::new(key, typed.pages, mem_type, typed.physical))
            }
        }
    }

    /// Destroys a block, unbinding it first if needed, and returns its key
    /// and pages to their pools.
    pub fn free_memory(&mut self, mut block: MemoryBlock) {
        if block.is_bound() {
            // Cannot fail on a bound block.
            let _ = self.unbind_memory(&mut block);
        }
        let key = block.key();
        let mem_type = block.mem_type();
        let pages = block.into_pages();
        let count = pages.len();

        match mem_type {
            MemoryType::Generic => {
                for page in pages {
                    self.backend.destroy_page(page);
                }
            }
            MemoryType::Vendor(_) => self.backend.free_typed(pages, mem_type),
        }
        self.current_pages -= count;
        self.keys.release(key);
    }

    /// Inserts a block's pages at `pg_start`.
    ///
    /// The first bind of freshly-allocated data performs one global cache
    /// flush so page contents are visible on the hardware-coherent path;
    /// re-binding already-flushed data skips it.
    ///
    /// # Errors
    /// `Occupied` if the block is already bound or any target slot is
    /// taken, `InvalidRange`/`TypeMismatch` per the table rules.
    pub fn bind_memory(&mut self, block: &mut MemoryBlock, pg_start: usize) -> GartResult<()> {
        if block.is_bound() {
            return Err(GartError::Occupied);
        }
        if !block.is_flushed() {
            self.backend.cache_flush();
            block.mark_flushed();
        }
        self.table.insert(self.backend.as_mut(), block, pg_start)?;
        block.set_bound(pg_start);
        Ok(())
    }

    /// Removes a bound block from the table.
    ///
    /// # Errors
    /// `NotBound` if the block is not currently bound.
    pub fn unbind_memory(&mut self, block: &mut MemoryBlock) -> GartResult<()> {
        if !block.is_bound() {
            return Err(GartError::NotBound);
        }
        self.table.remove(self.backend.as_mut(), block)?;
        block.clear_bound();
        Ok(())
    }

    /// Negotiates and enables a transfer mode.
    pub fn enable(&mut self, requested: AgpMode) -> AgpMode {
        self.mode = self.backend.enable(requested);
        self.mode
    }

    /// # Errors
    /// `Busy` if the hardware is claimed out of band.
    pub fn acquire_hw(&mut self) -> GartResult<()> {
        self.backend.acquire()
    }

    pub fn release_hw(&mut self) {
        self.backend.release();
    }

    /// # Errors
    /// Propagates backend save-state failures.
    pub fn suspend(&mut self) -> GartResult<()> {
        self.backend.suspend()
    }

    pub fn resume(&mut self) {
        self.backend.resume();
    }

    #[must_use]
    pub fn info(&self) -> GartInfo {
        GartInfo {
            version: INTERFACE_VERSION,
            aperture_base: self.aperture_base,
            aperture_size_mb: self.table.size().size_mb - self.reserved_mb,
            mode: self.mode,
            max_pages: self.max_pages,
            current_pages: self.current_pages,
        }
    }

    #[must_use]
    pub fn current_pages(&self) -> usize {
        self.current_pages
    }

    #[cfg(test)]
    pub(crate) fn key_in_use(&self, key: crate::gart::Key) -> bool {
        self.keys.is_in_use(key)
    }
}
