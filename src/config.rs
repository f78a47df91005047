/// Hard cap on segments in a single reserve request.
pub const MAX_SEGMENTS: usize = 16_384;

/// Static bring-up configuration.
///
/// Callers construct this once and hand it to [`crate::GartDevice::new`];
/// nothing here changes at runtime.
#[derive(Debug, Clone)]
pub struct GartConfig {
    /// Installed system RAM in MiB; drives the ceiling on pages usable for
    /// aperture allocation.
    pub system_memory_mb: u64,
    /// Aperture bytes carved out for other consumers. Shrinks both the
    /// usable page-table range and the aperture size reported by Info.
    pub reserved_bytes: u64,
    /// Per-request segment cap for client reservations.
    pub max_segments: usize,
}

impl Default for GartConfig {
    fn default() -> Self {
        Self {
            system_memory_mb: 256,
            reserved_bytes: 0,
            max_segments: MAX_SEGMENTS,
        }
    }
}
