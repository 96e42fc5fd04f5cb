//! The raster builder (§4G): the crate's central pipeline. Accumulates
//! path/transform/clip references into a set of host-mapped rings, batches
//! them into cohorts, and submits one compute command buffer per cohort
//! that rasterizes every accumulated path into a set of raster handles.
//!
//! Builder state lives behind `Rc<RefCell<..>>` because the submission
//! action registered with the scheduler (§4D) must read the dispatch's
//! final accumulated span at *flush* time, not at the time `dispatch_acquire`
//! constructs the closure — the same shared-mutability shape `handle.rs`
//! uses for its reclaim-completion flags, one level up.

use std::cell::RefCell;
use std::rc::Rc;

use ash::vk;

use crate::alloc::{StagedRing, Suballocator};
use crate::config::TargetConfig;
use crate::device::{BlockPoolAddresses, CommandRecorder, DeviceInfo, DeviceLostHook, RadixSortIndirectArgs};
use crate::error::{Result, SpinelError};
use crate::handle::{Handle, HandleKind, HandlePool};
use crate::path::Path;
use crate::ring::{Next, Ring};
use crate::sched::{DelayedSemaphore, DepsScheduler, QueueBackend, SignalSet, WaitSet};
use crate::weak::{self, Epoch, Weakref};

/// A raster handle. Identical wire representation to `path::Path`; the two
/// are never interchangeable at the type level. Produced by `end`, consumed
/// by composition's `place` (§6, out of scope here).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Raster(Handle);

impl Raster {
    pub(crate) fn from_handle(handle: Handle) -> Self {
        Raster(handle)
    }

    pub(crate) fn handle(&self) -> Handle {
        self.0
    }

    /// Raw slot id, for passing to composition's `place` and the deps
    /// scheduler's handle→delayed attachment multimap.
    pub fn raw(&self) -> u32 {
        self.0.raw()
    }
}

/// One transform-or-clip quad in the `tc` ring. A transform occupies two
/// consecutive quads (via `Next::acquire_2`); a clip occupies one (via
/// `acquire_1`).
pub type Quad = [f32; 4];

/// Permute an 8-wide transform `{sx, shx, tx, shy, sy, ty, w0, w1}` into the
/// two `tc`-ring quads the GPU reads: `{sx, shx, shy, sy}` then
/// `{tx, ty, w0, w1}`. `w0 == 0.0 && w1 == 0.0` marks an affine transform.
pub fn permute_transform(t: &[f32; 8]) -> (Quad, Quad) {
    let [sx, shx, tx, shy, sy, ty, w0, w1] = *t;
    ([sx, shx, shy, sy], [tx, ty, w0, w1])
}

/// A 4-word descriptor referencing one path, one transform, one clip, and
/// the cohort slot the raster being built will occupy once `end` appends
/// it to `rc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FillCommand {
    /// The path this fill command rasterizes.
    pub path_handle: u32,
    /// Index this raster will occupy in the dispatch's `rc` span — fixed at
    /// `begin` (the dispatch's `rc_span` at that moment), shared by every
    /// fill command the raster's `add` calls write.
    pub cohort: u32,
    /// `0` affine, `1` projective (`w0 != 0.0 || w1 != 0.0`).
    pub transform_type: u8,
    /// Index of this fill's transform quad pair in the `tc` ring.
    pub transform_index: u32,
    /// Index of this fill's clip quad in the `tc` ring.
    pub clip_index: u32,
}

/// The eight primitive types `fill_expand` seeds and `rasterize` consumes,
/// in pipeline-array order (§4G step 10).
pub const PRIMITIVE_COUNT: usize = 8;
/// Names of the eight primitive types, in the same order as
/// [`Pipelines::rasterize`] and step 10's dispatch sequence.
pub const PRIMITIVE_NAMES: [&str; PRIMITIVE_COUNT] = [
    "proj_line",
    "proj_quad",
    "proj_cubic",
    "line",
    "quad",
    "cubic",
    "rat_quad",
    "rat_cubic",
];

/// Opaque compute pipelines the submission action binds (§6: shader
/// authorship is out of scope, only the dispatch shape).
#[derive(Debug, Clone, Copy)]
pub struct Pipelines {
    /// Shared compute pipeline layout every pipeline below is bound against.
    pub layout: vk::PipelineLayout,
    /// Step 4: scans `cf` into per-primitive-type counts.
    pub fill_scan: vk::Pipeline,
    /// Step 6: seeds the eight indirect-dispatch triples.
    pub fill_dispatch: vk::Pipeline,
    /// Step 8: expands scanned fills into per-curve-type work items.
    pub fill_expand: vk::Pipeline,
    /// Step 10: one rasterize pipeline per [`PRIMITIVE_NAMES`] entry.
    pub rasterize: [vk::Pipeline; PRIMITIVE_COUNT],
    /// Step 14: prepares the indirect triple for `ttrks_segment`.
    pub ttrks_segment_dispatch: vk::Pipeline,
    /// Step 16: segments the sorted TTRK keyvals.
    pub ttrks_segment: vk::Pipeline,
    /// Step 18: allocates block-pool storage for the cohort's rasters.
    pub rasters_alloc: vk::Pipeline,
    /// Step 20: prefix-sums the raster allocations.
    pub rasters_prefix: vk::Pipeline,
}

/// Precomputed requirements for the external radix sort collaborator (§6):
/// the builder only needs enough to size its per-dispatch arena and record
/// the indirect-sort command, never the sort's own implementation.
#[derive(Debug, Clone, Copy)]
pub struct RadixSortRequirements {
    /// Byte size of the TTRK keyvals region the sort runs over.
    pub keyvals_size: u64,
    /// Required alignment of the keyvals region.
    pub keyvals_align: u64,
    /// Byte size of the sort's own internal scratch.
    pub internal_size: u64,
    /// Required alignment of the internal scratch.
    pub internal_align: u64,
    /// Byte size of the sort's indirect-dispatch scratch.
    pub indirect_size: u64,
    /// Required alignment of the indirect scratch.
    pub indirect_align: u64,
}

/// Byte offsets of one in-flight dispatch's device-local scratch regions,
/// carved once from a fixed-capacity arena at builder construction (§9:
/// "rather than dynamically sub-allocating per flush... pre-size one arena
/// per in-flight dispatch").
#[derive(Debug, Clone, Copy, Default)]
struct DispatchArena {
    ttrks: u64,
    fill_scan_counts: u64,
    rs_internal: u64,
    rs_indirect: u64,
    temp_scratch: u64,
}

/// TTRK keys are sortable 64-bit integers (glossary).
const TTRK_STRIDE: u64 = 8;
const TTRK_ALIGN: u64 = 8;
/// One `u32` counter per primitive type plus the shared dispatch-count word.
const FILL_SCAN_COUNTS_SIZE: u64 = (PRIMITIVE_COUNT as u64 + 1) * 4;
const FILL_SCAN_COUNTS_ALIGN: u64 = 4;
const TEMP_SCRATCH_SIZE: u64 = 256;
const TEMP_SCRATCH_ALIGN: u64 = 16;

fn layout_dispatch_arena(config: &TargetConfig, radix: &RadixSortRequirements) -> DispatchArena {
    let mut sub = Suballocator::new(
        config.ttrks as u64 * TTRK_STRIDE
            + FILL_SCAN_COUNTS_SIZE
            + radix.internal_size
            + radix.indirect_size
            + TEMP_SCRATCH_SIZE,
    );
    let ttrks = sub
        .alloc(config.ttrks as u64 * TTRK_STRIDE, TTRK_ALIGN)
        .expect("dispatch arena capacity too small for ttrks region");
    let fill_scan_counts = sub
        .alloc(FILL_SCAN_COUNTS_SIZE, FILL_SCAN_COUNTS_ALIGN)
        .expect("dispatch arena capacity too small for fill_scan counts");
    let rs_internal = sub
        .alloc(radix.internal_size, radix.internal_align)
        .expect("dispatch arena capacity too small for radix-sort internal scratch");
    let rs_indirect = sub
        .alloc(radix.indirect_size, radix.indirect_align)
        .expect("dispatch arena capacity too small for radix-sort indirect scratch");
    let temp_scratch = sub
        .alloc(TEMP_SCRATCH_SIZE, TEMP_SCRATCH_ALIGN)
        .expect("dispatch arena capacity too small for temp scratch");
    DispatchArena {
        ttrks,
        fill_scan_counts,
        rs_internal,
        rs_indirect,
        temp_scratch,
    }
}

/// Device buffer identifiers the submission action records against.
/// Allocation and binding are a collaborator's concern (§1); this crate
/// only needs to know which buffer each region lives in.
#[derive(Debug, Clone, Copy)]
pub struct Buffers {
    /// The fill-command ring's host/device buffer pair.
    pub cf: StagedRing,
    /// The transform/clip-quad ring's host/device buffer pair.
    pub tc: StagedRing,
    /// The raster-cohort ring's host/device buffer pair.
    pub rc: StagedRing,
    /// One `DispatchArena`-shaped region per in-flight dispatch slot,
    /// concatenated; slot `i` starts at `i * per_dispatch_arena_capacity`.
    pub arena: vk::Buffer,
    /// Byte size of one dispatch slot's region within `arena`.
    pub per_dispatch_arena_capacity: u64,
    /// TTRK copyback: `max_in_flight` host-readable `u32`s (§4G).
    pub copyback: vk::Buffer,
}

impl Buffers {
    fn arena_base(&self, dispatch_slot: u32) -> u64 {
        dispatch_slot as u64 * self.per_dispatch_arena_capacity
    }
}

/// Lifecycle of one dispatch-ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchState {
    /// Free; not associated with any accumulated work.
    Invalid,
    /// The working dispatch: `add`/`end` calls accumulate into it.
    Recording,
    /// Submitted; waiting on GPU completion.
    Pending,
    /// GPU completion callback has fired; waiting for the tail walk to
    /// release its `cf` span and dispatch-ring slot.
    Complete,
}

/// One dispatch-ring slot's accumulated span and submission bookkeeping.
#[derive(Debug, Clone, Copy)]
struct Dispatch {
    state: DispatchState,
    cf_head: u32,
    cf_span: u32,
    rc_head: u32,
    rc_span: u32,
    delayed: DelayedSemaphore,
    arena: DispatchArena,
}

impl Dispatch {
    fn invalid(placeholder: DelayedSemaphore) -> Self {
        Dispatch {
            state: DispatchState::Invalid,
            cf_head: 0,
            cf_span: 0,
            rc_head: 0,
            rc_span: 0,
            delayed: placeholder,
            arena: DispatchArena::default(),
        }
    }
}

/// The shared mutable state behind `Rc<RefCell<..>>`: every ring, the
/// dispatch table, and the epoch. Read and written both by `RasterBuilder`'s
/// public methods and by the submission/completion closures registered
/// with the scheduler.
struct BuilderRings {
    lost: bool,
    epoch: Epoch,

    cf_ring: Ring<FillCommand>,
    cf: Vec<FillCommand>,
    tc_next: Next<Quad>,
    tc: Vec<Quad>,
    rc_ring: Ring<u32>,
    rc: Vec<u32>,
    copyback: Vec<u32>,

    cf_staging: StagedRing,
    tc_staging: StagedRing,
    rc_staging: StagedRing,

    /// Commands written for the raster currently being built, since the
    /// last `begin`/`end`. Folded into the current dispatch's `cf_span` at
    /// `end` and reset to zero.
    wip_cf: u32,
    /// The cohort slot this raster will occupy once `end` appends it —
    /// fixed at `begin` as the current dispatch's `rc_span`.
    cohort: u32,

    dispatch_ring: Ring<Dispatch>,
    dispatches: Vec<Dispatch>,
    /// Index into `dispatches` of the `Recording` slot.
    current: u32,

    /// Raster handles a completion callback has finished with, queued here
    /// instead of detaching them directly (§9 "reentrant reclamation": the
    /// callback runs from inside `scheduler.borrow_mut()`, so it cannot
    /// re-borrow the same `RefCell` to call `delayed_detach`). Drained by
    /// `RasterBuilder::drain_pending_detach` right after the borrow that
    /// invoked the callback is released.
    pending_detach: Vec<u32>,
}

impl BuilderRings {
    fn current(&self) -> &Dispatch {
        &self.dispatches[self.current as usize]
    }

    fn current_mut(&mut self) -> &mut Dispatch {
        &mut self.dispatches[self.current as usize]
    }
}

/// The raster builder (§4G). `begin`/`add`/`end` accumulate one raster at a
/// time into the current cohort; `flush` submits the cohort; `release`
/// drains and tears the builder down. Once `lost` is set every operation
/// but `release` fails with `BuilderLost` (§7).
pub struct RasterBuilder<B: QueueBackend> {
    handles: Rc<RefCell<HandlePool>>,
    scheduler: Rc<RefCell<DepsScheduler<B>>>,
    device: DeviceInfo,
    block_pool: BlockPoolAddresses,
    config: TargetConfig,
    pipelines: Pipelines,
    radix_sort: RadixSortRequirements,
    buffers: Buffers,
    lost_hook: Rc<dyn DeviceLostHook>,
    state: Rc<RefCell<BuilderRings>>,

    // Per-raster caller-visible accumulation, not shared with the
    // submission closures: `begin` resets these, `add` appends to them.
    wip_started: bool,
}

impl<B: QueueBackend + 'static> RasterBuilder<B> {
    /// Construct a builder over a freshly created (fully `Invalid`)
    /// dispatch ring; no dispatch is acquired until the first `add`.
    pub fn new(
        handles: Rc<RefCell<HandlePool>>,
        scheduler: Rc<RefCell<DepsScheduler<B>>>,
        device: DeviceInfo,
        block_pool: BlockPoolAddresses,
        config: TargetConfig,
        pipelines: Pipelines,
        radix_sort: RadixSortRequirements,
        buffers: Buffers,
        lost_hook: Rc<dyn DeviceLostHook>,
    ) -> Self {
        let cf_capacity = config.ring;
        let tc_capacity = 3 * config.ring + 1;
        let rc_capacity = config.cohort * config.dispatches;
        let dispatch_capacity = config.dispatches;
        let arena = layout_dispatch_arena(&config, &radix_sort);

        let placeholder = scheduler
            .borrow_mut()
            .delayed_acquire(|_| unreachable!("invalid-slot placeholder semaphore is never flushed"));

        let state = BuilderRings {
            lost: false,
            epoch: Epoch::init(),
            cf_ring: Ring::init(cf_capacity),
            cf: vec![FillCommand::default(); cf_capacity as usize],
            tc_next: Next::init(tc_capacity),
            tc: vec![[0.0; 4]; tc_capacity as usize],
            rc_ring: Ring::init(rc_capacity),
            rc: vec![0; rc_capacity as usize],
            copyback: vec![0; config.dispatches as usize],
            cf_staging: buffers.cf,
            tc_staging: buffers.tc,
            rc_staging: buffers.rc,
            wip_cf: 0,
            cohort: 0,
            dispatch_ring: Ring::init(dispatch_capacity),
            dispatches: vec![Dispatch::invalid(placeholder); dispatch_capacity as usize],
            current: 0,
            pending_detach: Vec::new(),
        };

        let mut builder = RasterBuilder {
            handles,
            scheduler,
            device,
            block_pool,
            config,
            pipelines,
            radix_sort,
            buffers,
            lost_hook,
            state: Rc::new(RefCell::new(state)),
            wip_started: false,
        };
        builder.dispatch_acquire(arena);
        builder
    }

    fn mark_lost(&self) {
        log::warn!("spinel-raster: raster builder transitioning to Lost");
        self.state.borrow_mut().lost = true;
    }

    fn check_lost(&self) -> Result<()> {
        if self.state.borrow().lost {
            return Err(SpinelError::BuilderLost);
        }
        Ok(())
    }

    fn device_lost(&self) -> SpinelError {
        self.lost_hook.device_lost();
        SpinelError::DeviceLost
    }

    /// Collect whatever reclaim completions the last `drain_1` delivered,
    /// and flush either reclaim ring whose in-progress span has since
    /// crossed the eager threshold (§4C). Called after every `drain_1` in
    /// the retry loops below.
    fn handles_drain_step(&mut self) {
        let mut hp = self.handles.borrow_mut();
        let mut sched = self.scheduler.borrow_mut();
        hp.drain_step(&mut sched);
    }

    /// Force both reclaim rings to flush now, regardless of the eager
    /// threshold — used when a handle acquire reports `HandleOverflow`
    /// (§4C: "flush any non-empty reclaim ring and retry"), since an
    /// in-progress reclaim span below the eager threshold would otherwise
    /// never be submitted to the scheduler and `drain_1` would never see
    /// it complete.
    fn handles_force_flush_reclaim(&mut self) {
        let mut hp = self.handles.borrow_mut();
        let mut sched = self.scheduler.borrow_mut();
        hp.flush_reclaim(&mut sched);
    }

    /// Drain handles a completion callback queued for detaching (see
    /// `BuilderRings::pending_detach`). Safe to call any time — never
    /// invoked from inside a callback itself, only after a `drain_1`/
    /// `drain_all` call has returned.
    fn drain_pending_detach(&mut self) {
        let pending = std::mem::take(&mut self.state.borrow_mut().pending_detach);
        if !pending.is_empty() {
            self.scheduler.borrow_mut().delayed_detach(&pending);
        }
    }

    /// Begin accumulating one raster. Fails only if the builder is already
    /// `Lost`.
    pub fn begin(&mut self) -> Result<()> {
        self.check_lost()?;
        let mut state = self.state.borrow_mut();
        state.cohort = state.current().rc_span;
        drop(state);
        self.wip_started = true;
        Ok(())
    }

    /// Acquire a free dispatch-ring slot, draining the scheduler until one
    /// is available, and register its submission action. `arena` is the
    /// pre-sized per-dispatch scratch layout shared by every slot.
    fn dispatch_acquire(&mut self, arena: DispatchArena) {
        loop {
            let ready = {
                let state = self.state.borrow();
                !state.dispatch_ring.is_empty()
            };
            if ready {
                break;
            }
            let progressed = self.scheduler.borrow_mut().drain_1();
            self.drain_pending_detach();
            self.handles_drain_step();
            if !progressed {
                // Nothing left to drain and still no slot: the dispatch
                // ring itself is the bottleneck, not a reclaim-pending
                // situation the handle pool tracks — this is the builder's
                // own fatal exhaustion path.
                log::warn!("spinel-raster: dispatch ring exhausted with nothing left to drain");
                self.mark_lost();
                return;
            }
        }

        let slot = {
            let mut state = self.state.borrow_mut();
            let slot = state.dispatch_ring.acquire_1();
            let cf_head = state.cf_ring.head_index();
            let rc_head = state.rc_ring.head_index();
            slot_init(&mut state.dispatches[slot as usize], cf_head, rc_head, arena);
            state.current = slot;
            slot
        };

        let state_for_action = self.state.clone();
        let handles_for_action = self.handles.clone();
        let device = self.device;
        let block_pool = self.block_pool;
        let config = self.config.clone();
        let pipelines = self.pipelines;
        let buffers = self.buffers;

        let delayed = self.scheduler.borrow_mut().delayed_acquire(move |scheduler| {
            Self::record_and_submit(
                slot,
                &state_for_action,
                &handles_for_action,
                scheduler,
                &device,
                &block_pool,
                &config,
                &pipelines,
                &buffers,
            )
        });
        self.state.borrow_mut().dispatches[slot as usize].delayed = delayed;
    }

    /// Accumulate `count` fill commands referencing `paths`, reusing cached
    /// transform/clip `tc` indices when the supplied weakrefs hit the
    /// current epoch, minting fresh ones otherwise.
    pub fn add(
        &mut self,
        paths: &[Path],
        transform_weakrefs: &mut [Weakref],
        transforms: &[[f32; 8]],
        clip_weakrefs: &mut [Weakref],
        clips: &[Quad],
        count: usize,
    ) -> Result<()> {
        self.check_lost()?;
        if count == 0 {
            return Ok(());
        }
        debug_assert!(self.wip_started, "add called without a preceding begin");

        let ring_size = self.state.borrow().cf_ring.size();
        let wip_cf = self.state.borrow().wip_cf;
        if wip_cf + count as u32 > ring_size {
            if wip_cf == 0 {
                // A fresh raster that alone can never fit: recoverable, the
                // builder stays READY (§8 scenario 5).
                return Err(SpinelError::BuilderTooManyPaths);
            }
            // An in-progress raster pushed over the edge: the ring can
            // never be flushed small enough to make room without losing
            // part of this raster, so there is no way to recover.
            self.mark_lost();
            return Err(SpinelError::BuilderLost);
        }

        loop {
            let (rem, wip_cf) = {
                let state = self.state.borrow();
                (state.cf_ring.rem(), state.wip_cf)
            };
            if count as u32 <= rem {
                break;
            }
            // A raster with `wip_cf > 0` is still open: `end` is the only
            // place that folds `wip_cf` into the current dispatch's
            // `cf_span`, and a fresh dispatch's `cf_head` is read *after*
            // those commands were already written. Flushing here would
            // submit the current dispatch's span without them, and the new
            // dispatch's span would start past them — lost fill commands
            // and a `cf_ring` leak, since the physical slots they occupy
            // would never belong to any submitted span. Only an untouched
            // raster (`wip_cf == 0`) may trigger a flush; otherwise this can
            // only wait on already-submitted dispatches to free room, which
            // the outer `wip_cf + count > ring_size` check above guarantees
            // is eventually enough.
            if wip_cf == 0 {
                self.flush()?;
            }
            let progressed = self.scheduler.borrow_mut().drain_1();
            self.drain_pending_detach();
            self.handles_drain_step();
            if !progressed {
                self.mark_lost();
                return Err(self.device_lost());
            }
        }

        // Validates every handle before retaining any (whole-or-nothing).
        let path_handles: Vec<Handle> = paths.iter().map(Path::handle).collect();
        self.handles.borrow_mut().retain_device(&path_handles)?;

        let mut state = self.state.borrow_mut();
        let epoch = state.epoch;
        let cohort = state.cohort;
        for i in 0..count {
            let path_handle = paths[i].raw();

            let w0 = transforms[i][6];
            let w1 = transforms[i][7];
            let transform_type = if w0 == 0.0 && w1 == 0.0 { 0 } else { 1 };

            let mut transform_index = 0;
            if !weak::get_index(transform_weakrefs, i, epoch, &mut transform_index) {
                let idx = state.tc_next.acquire_2();
                let (a, b) = permute_transform(&transforms[i]);
                state.tc[idx as usize] = a;
                state.tc[idx as usize + 1] = b;
                weak::init(transform_weakrefs, i, epoch, idx);
                transform_index = idx;
            }

            let mut clip_index = 0;
            if !weak::get_index(clip_weakrefs, i, epoch, &mut clip_index) {
                let idx = state.tc_next.acquire_1();
                state.tc[idx as usize] = clips[i];
                weak::init(clip_weakrefs, i, epoch, idx);
                clip_index = idx;
            }

            let pos = state.cf_ring.acquire_1();
            state.cf[pos as usize] = FillCommand {
                path_handle,
                cohort,
                transform_type,
                transform_index,
                clip_index,
            };
            state.wip_cf += 1;
        }

        Ok(())
    }

    /// Finish the raster started by `begin`: acquire its handle, attach the
    /// current dispatch's delayed semaphore, append it to `rc`, fold `wip`
    /// into the current dispatch's spans, and auto-flush if the cohort is
    /// full or the eager threshold is reached.
    pub fn end(&mut self) -> Result<Raster> {
        self.check_lost()?;
        let handle = loop {
            match self.handles.borrow_mut().acquire() {
                Ok(h) => break h,
                Err(SpinelError::DeviceLost) => return Err(self.device_lost()),
                Err(SpinelError::HandleOverflow) => {
                    // A reclaim span may be sitting below its eager
                    // threshold with nothing yet submitted to the
                    // scheduler; force it out now or `drain_1` below would
                    // never see it complete (§4C: "flush any non-empty
                    // reclaim ring and retry").
                    self.handles_force_flush_reclaim();
                    let progressed = self.scheduler.borrow_mut().drain_1();
                    self.drain_pending_detach();
                    self.handles_drain_step();
                    if !progressed {
                        return Err(self.device_lost());
                    }
                }
                Err(e) => return Err(e),
            }
        };

        let delayed = {
            let mut state = self.state.borrow_mut();
            let delayed = state.current().delayed;
            let rc_pos = state.rc_ring.acquire_1();
            state.rc[rc_pos as usize] = handle.raw();

            let wip_cf = state.wip_cf;
            state.current_mut().cf_span += wip_cf;
            state.current_mut().rc_span += 1;
            state.wip_cf = 0;
            delayed
        };
        self.scheduler.borrow_mut().delayed_attach(handle.raw(), delayed);

        self.wip_started = false;
        let raster = Raster::from_handle(handle);

        let should_flush = {
            let state = self.state.borrow();
            let d = state.current();
            d.rc_span >= self.config.cohort || d.cf_span >= self.config.eager
        };
        if should_flush {
            self.flush()?;
        }
        Ok(raster)
    }

    /// Submit the current dispatch if it has accumulated any rasters,
    /// advance the epoch (invalidating every outstanding weakref), and
    /// acquire the next dispatch slot. A no-op if the current dispatch is
    /// still empty.
    pub fn flush(&mut self) -> Result<()> {
        self.check_lost()?;
        let (delayed, empty) = {
            let state = self.state.borrow();
            (state.current().delayed, state.current().rc_span == 0)
        };
        if empty {
            return Ok(());
        }

        self.scheduler.borrow_mut().delayed_flush(delayed);

        let arena = {
            let mut state = self.state.borrow_mut();
            let current = state.current;
            state.dispatches[current as usize].state = DispatchState::Pending;
            state.epoch.increment();
            log::trace!(
                "spinel-raster: flushed dispatch slot {}, epoch now {}",
                current,
                state.epoch.value()
            );
            state.current().arena
        };
        self.dispatch_acquire(arena);
        self.check_lost()
    }

    /// Flush, then drain until the dispatch ring is entirely quiescent —
    /// every submitted dispatch has completed and released its slot.
    pub fn release(&mut self) -> Result<()> {
        // Per §7, release is the one operation that still succeeds once
        // the builder is lost — it only needs to unwind draining cleanly.
        let _ = self.flush();
        loop {
            let idle = self.state.borrow().dispatch_ring.is_full();
            if idle {
                break;
            }
            if !self.scheduler.borrow_mut().drain_1() {
                break;
            }
            self.drain_pending_detach();
            self.handles_drain_step();
        }
        Ok(())
    }

    /// Record and submit the phase-1 command buffer for dispatch slot
    /// `slot`, and register the completion callback that detaches/releases
    /// handles and walks the dispatch-ring tail (§4G "Submission action",
    /// "Completion callback"). Runs from inside `delayed_flush`, so `state`
    /// reflects every `add`/`end` call made before the flush that forced
    /// it.
    fn record_and_submit(
        slot: u32,
        state: &Rc<RefCell<BuilderRings>>,
        handles: &Rc<RefCell<HandlePool>>,
        scheduler: &mut DepsScheduler<B>,
        device: &DeviceInfo,
        block_pool: &BlockPoolAddresses,
        config: &TargetConfig,
        pipelines: &Pipelines,
        buffers: &Buffers,
    ) -> crate::sched::ImmediateSemaphore {
        let (cf_head, cf_span, rc_head, rc_span, arena, cf_size, tc_size, rc_size) = {
            let s = state.borrow();
            let d = &s.dispatches[slot as usize];
            (
                d.cf_head,
                d.cf_span,
                d.rc_head,
                d.rc_span,
                d.arena,
                s.cf_ring.size(),
                s.tc.len() as u32,
                s.rc_ring.size(),
            )
        };

        let wait_handles: Vec<u32> = {
            let s = state.borrow();
            (0..cf_span)
                .map(|i| s.cf[((cf_head + i) % cf_size) as usize].path_handle)
                .collect()
        };

        let device_rec = *device;
        let block_pool_rec = *block_pool;
        let config_rec = config.clone();
        let pipelines_rec = *pipelines;
        let buffers_rec = *buffers;
        let record = move |rec: &mut dyn CommandRecorder| {
            Self::record_submission(
                rec,
                slot,
                cf_head,
                cf_span,
                cf_size,
                tc_size,
                rc_head,
                rc_span,
                rc_size,
                arena,
                &device_rec,
                &block_pool_rec,
                &config_rec,
                &pipelines_rec,
                &buffers_rec,
            );
        };

        let complete_state = state.clone();
        let complete_handles = handles.clone();
        let completion = move || {
            Self::on_complete(&complete_state, &complete_handles, slot, cf_head, cf_span, cf_size, rc_head, rc_span, rc_size);
        };

        scheduler.immediate_submit(
            record,
            WaitSet {
                delayed_handles: wait_handles,
                ..Default::default()
            },
            SignalSet::default(),
            completion,
        )
    }

    /// The literal 20-step command buffer (§4G "Submission action").
    #[allow(clippy::too_many_arguments)]
    fn record_submission(
        rec: &mut dyn CommandRecorder,
        dispatch_slot: u32,
        cf_head: u32,
        cf_span: u32,
        cf_size: u32,
        tc_size: u32,
        rc_head: u32,
        rc_span: u32,
        rc_size: u32,
        arena: DispatchArena,
        _device: &DeviceInfo,
        _block_pool: &BlockPoolAddresses,
        config: &TargetConfig,
        pipelines: &Pipelines,
        buffers: &Buffers,
    ) {
        let arena_base = buffers.arena_base(dispatch_slot);
        let ttrks_meta = arena_base + arena.ttrks;

        // 1. Fill-zero the cohort-meta tail of `ttrks`, its dispatch-count
        // field, and `fill_scan`'s counts.
        rec.fill_buffer(buffers.arena, ttrks_meta, config.ttrks as u64 * TTRK_STRIDE, 0);
        rec.fill_buffer(buffers.arena, arena_base + arena.fill_scan_counts, FILL_SCAN_COUNTS_SIZE, 0);

        // 2. Staged copies, up to two `BufferCopy` regions per ring.
        let cf_regions = buffers.cf.copy_regions(cf_size, cf_head, cf_span, std::mem::size_of::<FillCommand>() as u64);
        if !cf_regions.is_empty() {
            rec.copy_buffer(buffers.cf.host_buffer(), buffers.cf.device_buffer(), &cf_regions);
        }
        let tc_regions = buffers.tc.copy_regions(tc_size, 0, tc_size, std::mem::size_of::<Quad>() as u64);
        if !tc_regions.is_empty() {
            rec.copy_buffer(buffers.tc.host_buffer(), buffers.tc.device_buffer(), &tc_regions);
        }
        let rc_regions = buffers.rc.copy_regions(rc_size, rc_head, rc_span, 4);
        if !rc_regions.is_empty() {
            rec.copy_buffer(buffers.rc.host_buffer(), buffers.rc.device_buffer(), &rc_regions);
        }

        // 3. Transfer -> compute.
        rec.pipeline_barrier(vk::PipelineStageFlags::TRANSFER, vk::PipelineStageFlags::COMPUTE_SHADER);

        // 4. fill_scan.
        let fill_scan_groups = div_ceil(cf_span, config.fill_scan.rows * config.group_size("fill_scan").workgroup);
        rec.bind_compute_pipeline(pipelines.fill_scan);
        rec.push_constants(pipelines.layout, 0, &cf_span.to_ne_bytes());
        rec.dispatch(fill_scan_groups.max(1), 1, 1);

        // 5. compute -> compute.
        rec.pipeline_barrier(vk::PipelineStageFlags::COMPUTE_SHADER, vk::PipelineStageFlags::COMPUTE_SHADER);

        // 6. fill_dispatch: one workgroup, seeds the 8 indirect triples.
        rec.bind_compute_pipeline(pipelines.fill_dispatch);
        rec.dispatch(1, 1, 1);

        // 7. compute -> compute.
        rec.pipeline_barrier(vk::PipelineStageFlags::COMPUTE_SHADER, vk::PipelineStageFlags::COMPUTE_SHADER);

        // 8. fill_expand.
        let expand_group = config.group_size("fill_expand");
        let expand_groups = div_ceil(cf_span, expand_group.workgroup / expand_group.subgroup());
        rec.bind_compute_pipeline(pipelines.fill_expand);
        rec.dispatch(expand_groups.max(1), 1, 1);

        // 9. compute -> indirect|compute.
        rec.pipeline_barrier(
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::PipelineStageFlags::DRAW_INDIRECT | vk::PipelineStageFlags::COMPUTE_SHADER,
        );

        // 10. Eight primitive-type rasterize dispatches, indirect off the
        // triples fill_dispatch just seeded.
        let fill_scan_dispatch_base = arena_base + arena.fill_scan_counts;
        for (i, &pipeline) in pipelines.rasterize.iter().enumerate() {
            rec.bind_compute_pipeline(pipeline);
            rec.dispatch_indirect(buffers.arena, fill_scan_dispatch_base + i as u64 * 12);
        }

        // 11. compute -> indirect|compute.
        rec.pipeline_barrier(
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::PipelineStageFlags::DRAW_INDIRECT | vk::PipelineStageFlags::COMPUTE_SHADER,
        );

        // 12. Radix-sort-indirect on the TTRK keyvals (external collaborator,
        // §6 — the builder only records the call and the buffers it runs
        // over, not the sort shader itself).
        rec.radix_sort_indirect(RadixSortIndirectArgs {
            keyvals: buffers.arena,
            keyvals_offset: ttrks_meta,
            count: buffers.arena,
            count_offset: ttrks_meta,
            internal: buffers.arena,
            internal_offset: arena_base + arena.rs_internal,
            indirect: buffers.arena,
            indirect_offset: arena_base + arena.rs_indirect,
        });

        // 13. compute -> compute.
        rec.pipeline_barrier(vk::PipelineStageFlags::COMPUTE_SHADER, vk::PipelineStageFlags::COMPUTE_SHADER);

        // 14. ttrks_segment_dispatch: one workgroup.
        rec.bind_compute_pipeline(pipelines.ttrks_segment_dispatch);
        rec.dispatch(1, 1, 1);

        // 15. compute -> indirect|compute.
        rec.pipeline_barrier(
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::PipelineStageFlags::DRAW_INDIRECT | vk::PipelineStageFlags::COMPUTE_SHADER,
        );

        // 16. ttrks_segment, indirect.
        rec.bind_compute_pipeline(pipelines.ttrks_segment);
        rec.dispatch_indirect(buffers.arena, arena_base + arena.ttrks);

        // 17. compute -> compute.
        rec.pipeline_barrier(vk::PipelineStageFlags::COMPUTE_SHADER, vk::PipelineStageFlags::COMPUTE_SHADER);

        // 18. rasters_alloc.
        let alloc_groups = div_ceil(rc_span, config.group_size("rasters_alloc").workgroup);
        rec.bind_compute_pipeline(pipelines.rasters_alloc);
        rec.dispatch(alloc_groups.max(1), 1, 1);

        // 19. compute -> compute.
        rec.pipeline_barrier(vk::PipelineStageFlags::COMPUTE_SHADER, vk::PipelineStageFlags::COMPUTE_SHADER);

        // 20. rasters_prefix.
        let prefix_group = config.group_size("rasters_prefix");
        let prefix_groups = div_ceil(rc_span, prefix_group.workgroup / prefix_group.subgroup());
        rec.bind_compute_pipeline(pipelines.rasters_prefix);
        rec.dispatch(prefix_groups.max(1), 1, 1);
    }

    /// Completion callback (§4G "Completion callback"): detach the
    /// dispatch's delayed semaphore from its `rc` span, device-release its
    /// `cf`/`rc` handles, mark `Complete`, and walk the dispatch-ring tail.
    fn on_complete(
        state: &Rc<RefCell<BuilderRings>>,
        handles: &Rc<RefCell<HandlePool>>,
        slot: u32,
        cf_head: u32,
        cf_span: u32,
        cf_size: u32,
        rc_head: u32,
        rc_span: u32,
        rc_size: u32,
    ) {
        let rc_snapshot: Vec<u32> = {
            let s = state.borrow();
            (0..rc_size as usize).map(|i| s.rc[i]).collect()
        };
        let cf_path_snapshot: Vec<u32> = {
            let s = state.borrow();
            (0..cf_size as usize).map(|i| s.cf[i].path_handle).collect()
        };

        // The dispatch's raster handles are now fully materialized; queue
        // them for detaching once the caller's drain unwinds (see
        // `pending_detach`'s doc comment — this callback cannot reach back
        // into the scheduler that is currently invoking it).
        {
            let mut s = state.borrow_mut();
            for i in 0..rc_span {
                let idx = ((rc_head + i) % rc_size) as usize;
                s.pending_detach.push(rc_snapshot[idx]);
            }
        }

        let mut hp = handles.borrow_mut();
        hp.release_device_ring(&cf_path_snapshot, HandleKind::Path, cf_size, cf_head, cf_span);
        hp.release_device_ring(&rc_snapshot, HandleKind::Raster, rc_size, rc_head, rc_span);
        drop(hp);

        let mut s = state.borrow_mut();
        s.dispatches[slot as usize].state = DispatchState::Complete;
        log::trace!("spinel-raster: dispatch slot {} complete", slot);

        // The dispatch ring's physical slot order matches submission order
        // (each `dispatch_acquire` call advances its head by one), so the
        // ring's own tail index is exactly the tail-walk index.
        loop {
            let idx = s.dispatch_ring.tail_index();
            if s.dispatch_ring.is_full() {
                break;
            }
            if s.dispatches[idx as usize].state != DispatchState::Complete {
                break;
            }
            let span = s.dispatches[idx as usize].cf_span;
            s.cf_ring.release_n(span);
            s.dispatch_ring.release_n(1);
            s.dispatches[idx as usize].state = DispatchState::Invalid;
            log::trace!("spinel-raster: dispatch ring tail released slot {} ({} cf commands)", idx, span);
        }
    }
}

fn slot_init(dispatch: &mut Dispatch, cf_head: u32, rc_head: u32, arena: DispatchArena) {
    dispatch.state = DispatchState::Recording;
    dispatch.cf_head = cf_head;
    dispatch.cf_span = 0;
    dispatch.rc_head = rc_head;
    dispatch.rc_span = 0;
    dispatch.arena = arena;
}

fn div_ceil(n: u32, d: u32) -> u32 {
    (n + d - 1) / d
}
