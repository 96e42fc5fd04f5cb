//! Path handles and the path builder's narrow contract (§6 "Path builder").
//!
//! Producing path geometry — tessellating curves into block-pool storage —
//! is out of scope (§1): a path builder is a collaborator this crate only
//! needs to know the shape of, not implement. What the raster builder
//! actually depends on is the handle it hands back and the promise that
//! the handle's materialization is gated by a delayed semaphore the
//! scheduler already knows how to wait on.

use crate::error::Result;
use crate::handle::Handle;
use crate::sched::{DepsScheduler, QueueBackend};

/// A path handle. Identical wire representation to `Raster`; the two are
/// never interchangeable at the type level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Path(Handle);

impl Path {
    /// Wrap an already-acquired handle as a path. A `PathBuilder`
    /// collaborator calls this from `end` to produce the value it must
    /// return — without a public constructor here, no implementation of
    /// that trait outside this crate could ever construct one.
    pub fn from_handle(handle: Handle) -> Self {
        Path(handle)
    }

    pub(crate) fn handle(&self) -> Handle {
        self.0
    }

    /// Raw slot id, for passing into `cf` fill commands and the deps
    /// scheduler's handle→delayed attachment multimap.
    pub fn raw(&self) -> u32 {
        self.0.raw()
    }
}

/// The contract a path builder collaborator fulfills: acquiring a handle
/// from the shared handle pool and attaching a delayed semaphore to it
/// whose submission action records the tessellation work. The raster
/// builder's `add` only ever consumes `Path` values that already satisfy
/// this contract — it never calls `materialize` itself.
pub trait PathBuilder<B: QueueBackend> {
    /// Begin accumulating one path's segments.
    fn begin(&mut self) -> Result<()>;

    /// Finish the current path: acquire its handle, attach a delayed
    /// semaphore whose submission action records and submits the
    /// tessellation dispatch, and wrap the handle as a `Path` (via
    /// [`Path::from_handle`]). Until that semaphore flushes, the path is
    /// valid to reference (e.g. in a raster builder `add` call) but not yet
    /// materialized on the device.
    fn end(&mut self, scheduler: &mut DepsScheduler<B>) -> Result<Path>;
}
