//! Error kinds shared by the handle pool, the dependency scheduler, and the
//! raster builder, plus the collaborator-contract kinds owned by composition
//! (out of scope here, but part of the same error type so the two sides of
//! the FFI-shaped boundary in `collab` can share one `Result`).

use thiserror::Error;

/// Every error a public operation in this crate can return.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpinelError {
    /// A handle was out of range, double-released, or otherwise not live.
    #[error("handle is not live")]
    InvalidHandle,

    /// A `retain` would have pushed a refcount half past its 16-bit ceiling.
    #[error("handle refcount overflow")]
    HandleOverflow,

    /// The raster builder has transitioned to `Lost` and will fail every
    /// operation but `release` until it is dropped.
    #[error("raster builder is lost")]
    BuilderLost,

    /// A single raster's command count exceeds the `cf` ring's capacity.
    #[error("raster requires more commands than the ring can ever hold")]
    BuilderTooManyPaths,

    /// The composition has been sealed and no longer accepts placements.
    #[error("composition is sealed")]
    CompositionSealed,

    /// A composition would exceed its configured raster capacity.
    #[error("composition raster capacity exceeded")]
    CompositionTooManyRasters,

    /// A layer id fell outside the composition's configured layer range.
    #[error("layer id is invalid")]
    LayerIdInvalid,

    /// Fatal: an unbounded wait could not make progress (handle exhaustion
    /// with nothing left to reclaim, or an allocator exhaustion draining
    /// cannot resolve). The device's lost hook has already been invoked by
    /// the time this is returned.
    #[error("device lost")]
    DeviceLost,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = ::core::result::Result<T, SpinelError>;
