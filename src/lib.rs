//! Chipset-independent AGP GART memory manager.
//!
//! The GART (Graphics Address Remapping Table) makes scattered physical
//! pages appear contiguous through a bus-address aperture. This crate
//! implements the generic side of managing one: allocation keys, page
//! accounting against a RAM-derived ceiling, the aperture page table with
//! its scratch-fill/occupancy rules, and the controller/client session
//! model that gates access to it all.
//!
//! Chipset specifics (aperture sizes, PTE encoding, TLB maintenance) sit
//! behind [`backend::HardwareBackend`]; [`backend::sim::SimBackend`]
//! provides an in-memory chipset for tests and demos.
//!
//! ```
//! use agpgart_rs::backend::MemoryType;
//! use agpgart_rs::backend::sim::SimBackend;
//! use agpgart_rs::{GartConfig, GartDevice};
//!
//! let device = GartDevice::new(Box::new(SimBackend::new()), GartConfig::default())?;
//! device.acquire(100, true)?;
//!
//! let block = device.allocate(100, 4, MemoryType::Generic)?;
//! device.bind(100, block.key, 0)?;
//! device.unbind(100, block.key)?;
//! device.deallocate(100, block.key)?;
//!
//! device.release(100)?;
//! device.detach(100);
//! # Ok::<(), agpgart_rs::GartError>(())
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod frontend;
pub mod gart;

pub use backend::{AgpMode, HardwareBackend, MemoryType};
pub use config::GartConfig;
pub use error::{GartError, GartResult};
pub use frontend::{AllocatedBlock, GartDevice};
pub use frontend::session::{Pid, Protection, Segment};
pub use gart::{GartInfo, Key};
