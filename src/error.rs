use thiserror::Error;

/// Errors surfaced by the GART control plane.
///
/// The taxonomy is deliberately flat: callers of the original character-device
/// interface only ever saw one errno per request, and nothing in this layer
/// needs richer structure than that.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GartError {
    #[error("hardware is already held by a controller")]
    Busy,

    #[error("caller is not the current controller")]
    NotOwner,

    #[error("caller lacks the privilege required to control the device")]
    PermissionDenied,

    #[error("out of memory for AGP allocation")]
    OutOfMemory,

    #[error("allocation key space exhausted")]
    Exhausted,

    #[error("key {0} does not resolve to a live allocation")]
    InvalidKey(u32),

    #[error("no matching segment reservation")]
    NotFound,

    #[error("page range falls outside the usable aperture")]
    InvalidRange,

    #[error("target aperture range is already occupied")]
    Occupied,

    #[error("memory type is not handled by this path")]
    TypeMismatch,

    #[error("memory is not bound to the aperture")]
    NotBound,

    #[error("segment list exceeds the per-reservation limit")]
    TooManySegments,

    #[error("no supported aperture size could be backed with a page table")]
    NoMemoryForTable,

    #[error("backend configuration failed: {0}")]
    BackendConfigureFailed(String),
}

// A convenient alias
pub type GartResult<T> = Result<T, GartError>;
