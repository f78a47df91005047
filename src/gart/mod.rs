pub mod keys;
pub mod manager;
pub mod memory;
pub mod table;

/// Opaque small-integer handle identifying one in-flight allocation to
/// callers.
pub type Key = u32;

// Re-export the engine types for easy access
pub use manager::{GartInfo, GartManager, INTERFACE_VERSION, max_memory_pages};
pub use memory::MemoryBlock;
pub use table::AperturePageTable;
