//! Composition, styling and render collaborator contracts (§6 "Composition
//! / Styling / Render").
//!
//! Placement, styling encoding and the final render/blit are out of scope
//! (§1): this module names the seam a composition collaborator crosses when
//! it consumes a [`Raster`], the same way [`crate::path`] names the seam a
//! path builder crosses when it produces a [`crate::path::Path`]. Nothing
//! here drives GPU work; it only describes the contract composition must
//! honor and the handle→delayed attachment that makes a raster handle safe
//! to place before its dispatch has actually signalled.

use crate::builder::Raster;
use crate::error::Result;
use crate::sched::{DepsScheduler, QueueBackend};

/// Stable identifier for a layer within a composition. Distinct from
/// [`crate::handle::Handle`] — layer ids are composition-local and never
/// interned through the weakref table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerId(pub u32);

/// The contract a composition collaborator fulfills when it places a raster.
///
/// A raster handle returned from [`crate::builder::RasterBuilder::end`] is
/// only fully materialized once the delayed semaphore attached to its
/// producing dispatch has signalled. `place` does not wait on that
/// semaphore itself — it depends on it transparently by attaching to the
/// same handle→delayed multimap the scheduler already maintains, the way a
/// path builder's tessellation dispatch is waited on by `add` rather than
/// by the path builder.
pub trait Composition<B: QueueBackend> {
    /// Place `raster` under `layer`, recording the placement's dependency
    /// on the raster's producing dispatch. Returns [`crate::error::SpinelError::CompositionSealed`]
    /// if the composition has already been sealed for rendering, and
    /// [`crate::error::SpinelError::LayerIdInvalid`] if `layer` was never
    /// unsealed for placement.
    fn place(&mut self, scheduler: &mut DepsScheduler<B>, layer: LayerId, raster: &Raster) -> Result<()>;

    /// Seal the composition: no further `place` calls are valid until the
    /// composition is reset. Returns [`crate::error::SpinelError::CompositionTooManyRasters`]
    /// if more rasters were placed than the composition's target supports.
    fn seal(&mut self) -> Result<()>;
}

/// The contract a styling collaborator fulfills: encoding the paint/cover
/// state a composition's layers reference. Out of scope beyond this shape
/// (§1) — the raster builder never reads styling state itself.
pub trait Styling {
    /// Encode the styling group for `layer`, returning the command-stream
    /// offset composition's `place` records alongside the raster handle.
    fn group(&mut self, layer: LayerId) -> Result<u32>;
}

/// The contract a render collaborator fulfills: consuming a sealed
/// composition and a styling encoding to blit into a target surface. Out of
/// scope beyond this shape (§1).
pub trait Render<B: QueueBackend> {
    /// Render `composition` styled by `styling` into whatever target the
    /// implementation was constructed against.
    fn render(&mut self, scheduler: &mut DepsScheduler<B>) -> Result<()>;
}
