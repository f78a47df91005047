//! The hardware back-end seam.
//!
//! Everything chipset-specific sits behind [`HardwareBackend`]: aperture size
//! enumeration, page-table-entry encoding, TLB maintenance and the
//! bring-up/teardown register work. The generic engine in [`crate::gart`]
//! drives these capabilities without any vendor knowledge of its own.

use crate::error::{GartError, GartResult};
use bitflags::bitflags;

pub mod sim;

/// Hardware page size assumed throughout the aperture math.
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// A raw page-table-entry value as the chipset expects it in the GATT.
pub type GattEntry = u64;

/// A physical page frame backing one aperture slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysPage(pub u64);

/// Memory class of an allocation.
///
/// `Generic` is scratch-backed system memory handled entirely by the generic
/// path. `Vendor` values are opaque to the core; only the active backend
/// knows how to allocate, encode and insert them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryType {
    Generic,
    Vendor(u32),
}

/// One aperture size the chipset can be programmed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApertureSize {
    /// Aperture span in MiB.
    pub size_mb: u32,
    /// GATT slots covering that span.
    pub num_entries: usize,
}

impl ApertureSize {
    #[must_use]
    pub const fn new(size_mb: u32) -> Self {
        Self {
            size_mb,
            num_entries: (size_mb as usize) << (20 - PAGE_SHIFT),
        }
    }
}

/// Result of a vendor-type allocation.
///
/// `physical` is the address reported back to the caller; for "fixed
/// physical" style types it is the stable bus address of the first page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedPages {
    pub pages: Vec<PhysPage>,
    pub physical: u64,
}

bitflags! {
    /// AGP 2.0 status/command word.
    ///
    /// The same layout serves both directions: capability reporting (status)
    /// and the negotiated command written back at enable time. The top byte
    /// carries the request-queue depth.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AgpMode: u32 {
        const RATE_1X = 1 << 0;
        const RATE_2X = 1 << 1;
        const RATE_4X = 1 << 2;
        const FAST_WRITE = 1 << 4;
        const OVER_4G = 1 << 5;
        const ENABLED = 1 << 8;
        const SBA = 1 << 9;
        const _ = 0xff00_0000;
    }
}

impl AgpMode {
    const RATE_MASK: Self = Self::RATE_1X.union(Self::RATE_2X).union(Self::RATE_4X);

    /// Request-queue depth from the top byte of the word.
    #[must_use]
    pub const fn rq_depth(self) -> u32 {
        self.bits() >> 24
    }

    /// Replaces the request-queue depth, keeping all other bits.
    #[must_use]
    pub const fn with_rq_depth(self, depth: u32) -> Self {
        Self::from_bits_retain((self.bits() & 0x00ff_ffff) | (depth << 24))
    }

    /// Highest transfer rate advertised by this word, if any.
    #[must_use]
    pub fn best_rate(self) -> Option<Self> {
        [Self::RATE_4X, Self::RATE_2X, Self::RATE_1X]
            .into_iter()
            .find(|&r| self.contains(r))
    }
}

/// Computes the AGP command word for a bridge and the devices behind it.
///
/// The rules follow the AGP 2.0 enable sequence: the request-queue depth is
/// the minimum across all parties, the data rate is the highest rate every
/// party supports, and side-band addressing / fast writes are granted only
/// if nobody lacks them. The requested mode can only narrow the result,
/// never widen it.
#[must_use]
pub fn negotiate_mode(bridge: AgpMode, devices: &[AgpMode], requested: AgpMode) -> AgpMode {
    let mut rates = bridge & requested & AgpMode::RATE_MASK;
    let mut sba = (bridge & requested).contains(AgpMode::SBA);
    let mut fw = (bridge & requested).contains(AgpMode::FAST_WRITE);
    let mut rq = bridge.rq_depth();

    for dev in devices {
        rates &= *dev;
        sba = sba && dev.contains(AgpMode::SBA);
        fw = fw && dev.contains(AgpMode::FAST_WRITE);
        rq = rq.min(dev.rq_depth());
    }

    // A device that advertises nothing in common still gets 1x; the bus
    // cannot run without a rate at all.
    let rate = rates.best_rate().unwrap_or(AgpMode::RATE_1X);

    let mut command = AgpMode::ENABLED | rate;
    if sba {
        command |= AgpMode::SBA;
    }
    if fw {
        command |= AgpMode::FAST_WRITE;
    }
    command.with_rq_depth(rq)
}

/// Storage for the GART page table.
///
/// Flat single-level tables and paged two-level tables both hide behind this
/// contract; the generic engine addresses slots by index and never assumes
/// the entries are contiguous in one array.
pub trait GattStore: Send {
    fn num_entries(&self) -> usize;

    fn read(&self, index: usize) -> GattEntry;

    fn write(&mut self, index: usize, entry: GattEntry);

    /// Bus address the chipset was (or will be) pointed at for this table.
    fn bus_address(&self) -> u64;
}

/// The chipset capability contract.
///
/// One implementation exists per supported chipset family, selected once at
/// startup. The generic engine calls these in a fixed bring-up order:
/// scratch page, `fetch_size`, `create_gatt` (walking the size table
/// downward on failure), then `configure`. `Send` because the device
/// serving concurrent processes holds the backend behind its lock.
pub trait HardwareBackend: Send {
    /// Supported aperture sizes, largest first.
    fn aperture_sizes(&self) -> &[ApertureSize];

    /// The aperture size currently negotiated with the hardware.
    fn fetch_size(&mut self) -> ApertureSize;

    /// Programs the chipset with the page-table base and returns the bus
    /// address of the aperture itself.
    ///
    /// # Errors
    /// Fails if the hardware rejects the configuration; the subsystem is
    /// unusable afterwards.
    fn configure(&mut self, gatt_base: u64) -> GartResult<u64>;

    /// Negotiates and enables a transfer mode, returning the command word
    /// actually programmed.
    fn enable(&mut self, requested: AgpMode) -> AgpMode;

    /// # Errors
    /// Propagates hardware save-state failures.
    fn suspend(&mut self) -> GartResult<()> {
        Ok(())
    }

    fn resume(&mut self) {}

    /// Claims the hardware for exclusive use.
    ///
    /// # Errors
    /// `Busy` if the chipset is already claimed by an out-of-band owner.
    fn acquire(&mut self) -> GartResult<()> {
        Ok(())
    }

    fn release(&mut self) {}

    /// Allocates the scratch page and returns its encoded entry. Backends
    /// whose unmapped slots are plain zero keep the default.
    ///
    /// # Errors
    /// `OutOfMemory` if the page cannot be allocated.
    fn alloc_scratch_page(&mut self) -> GartResult<GattEntry> {
        Ok(0)
    }

    fn destroy_scratch_page(&mut self) {}

    /// Allocates one backing page, including any page-attribute
    /// reclassification the chipset needs. `None` on exhaustion.
    fn alloc_page(&mut self) -> Option<PhysPage>;

    /// Returns a page from [`Self::alloc_page`], undoing any attribute
    /// change.
    fn destroy_page(&mut self, page: PhysPage);

    /// Allocates a vendor-type block.
    ///
    /// # Errors
    /// `TypeMismatch` for types this chipset does not define.
    fn alloc_typed(&mut self, page_count: usize, mem_type: MemoryType) -> GartResult<TypedPages> {
        let _ = (page_count, mem_type);
        Err(GartError::TypeMismatch)
    }

    fn free_typed(&mut self, pages: Vec<PhysPage>, mem_type: MemoryType) {
        let _ = (pages, mem_type);
    }

    /// Writes a vendor-type block into the table.
    ///
    /// # Errors
    /// `TypeMismatch` for types this chipset does not define, plus the
    /// vendor path's own range/occupancy failures.
    fn insert_typed(
        &mut self,
        gatt: &mut dyn GattStore,
        pages: &[PhysPage],
        pg_start: usize,
        mem_type: MemoryType,
    ) -> GartResult<()> {
        let _ = (gatt, pages, pg_start, mem_type);
        Err(GartError::TypeMismatch)
    }

    /// # Errors
    /// `TypeMismatch` for types this chipset does not define.
    fn remove_typed(
        &mut self,
        gatt: &mut dyn GattStore,
        pg_start: usize,
        page_count: usize,
        mem_type: MemoryType,
    ) -> GartResult<()> {
        let _ = (gatt, pg_start, page_count, mem_type);
        Err(GartError::TypeMismatch)
    }

    /// Allocates table storage for one aperture size.
    ///
    /// # Errors
    /// `OutOfMemory` if backing the table at this size fails; the caller
    /// retries with the next smaller size.
    fn create_gatt(&mut self, size: ApertureSize) -> GartResult<Box<dyn GattStore>>;

    fn free_gatt(&mut self, gatt: Box<dyn GattStore>) {
        drop(gatt);
    }

    /// Encodes a physical page into the PTE form this chipset reads.
    fn mask_memory(&self, page: PhysPage, mem_type: MemoryType) -> GattEntry;

    /// Flushes the GART TLB. Most chipsets can only flush the whole table.
    fn tlb_flush(&mut self);

    /// Global data-cache flush, so page contents written by the CPU are
    /// visible on the hardware-coherent path before a mapping appears.
    fn cache_flush(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(rate: AgpMode, extras: AgpMode, rq: u32) -> AgpMode {
        (rate | extras).with_rq_depth(rq)
    }

    #[test]
    fn negotiate_picks_highest_common_rate() {
        let bridge = status(
            AgpMode::RATE_1X | AgpMode::RATE_2X | AgpMode::RATE_4X,
            AgpMode::SBA,
            32,
        );
        let card = status(AgpMode::RATE_1X | AgpMode::RATE_2X, AgpMode::SBA, 16);
        let requested = AgpMode::all();

        let cmd = negotiate_mode(bridge, &[card], requested);
        assert!(cmd.contains(AgpMode::RATE_2X));
        assert!(!cmd.contains(AgpMode::RATE_4X));
        assert!(cmd.contains(AgpMode::ENABLED));
        assert_eq!(cmd.rq_depth(), 16);
    }

    #[test]
    fn negotiate_drops_sba_and_fw_unless_unanimous() {
        let bridge = status(AgpMode::RATE_4X, AgpMode::SBA | AgpMode::FAST_WRITE, 32);
        let sba_only = status(AgpMode::RATE_4X, AgpMode::SBA, 32);

        let cmd = negotiate_mode(bridge, &[sba_only], AgpMode::all());
        assert!(cmd.contains(AgpMode::SBA));
        assert!(!cmd.contains(AgpMode::FAST_WRITE));
    }

    #[test]
    fn negotiate_respects_requested_narrowing() {
        let bridge = status(AgpMode::RATE_1X | AgpMode::RATE_2X | AgpMode::RATE_4X, AgpMode::SBA, 32);
        let card = bridge;
        let requested = AgpMode::RATE_2X.with_rq_depth(0xff);

        let cmd = negotiate_mode(bridge, &[card], requested);
        assert_eq!(cmd.best_rate(), Some(AgpMode::RATE_2X));
        assert!(!cmd.contains(AgpMode::SBA));
    }

    #[test]
    fn negotiate_falls_back_to_1x() {
        let bridge = status(AgpMode::RATE_4X, AgpMode::empty(), 32);
        let card = status(AgpMode::RATE_2X, AgpMode::empty(), 32);

        let cmd = negotiate_mode(bridge, &[card], AgpMode::all());
        assert_eq!(cmd.best_rate(), Some(AgpMode::RATE_1X));
    }

    #[test]
    fn aperture_size_entry_count() {
        assert_eq!(ApertureSize::new(256).num_entries, 65536);
        assert_eq!(ApertureSize::new(4).num_entries, 1024);
    }
}
