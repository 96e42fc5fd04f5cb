//! Integration tests for the literal end-to-end scenarios enumerated in
//! §8 of the spec: one `#[test]` per numbered scenario, driven entirely
//! through the public crate API against a scripted in-memory
//! `QueueBackend` so they run without a real GPU.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use ash::vk;
use ash::vk::Handle as _;

use spinel_raster::builder::{Buffers, Pipelines, Quad, RadixSortRequirements, RasterBuilder, PRIMITIVE_COUNT};
use spinel_raster::config::{FillScanConfig, GroupSize};
use spinel_raster::device::{BlockPoolAddresses, CommandRecorder, DeviceInfo};
use spinel_raster::error::SpinelError;
use spinel_raster::handle::HandlePool;
use spinel_raster::path::Path;
use spinel_raster::sched::{DepsScheduler, QueueBackend, SubmissionId};
use spinel_raster::weak::Weakref;
use spinel_raster::TargetConfig;

/// Records every command issued into it, without touching any real device.
struct NoopRecorder;

impl CommandRecorder for NoopRecorder {
    fn copy_buffer(&mut self, _src: vk::Buffer, _dst: vk::Buffer, _regions: &[vk::BufferCopy]) {}
    fn fill_buffer(&mut self, _buffer: vk::Buffer, _offset: u64, _size: u64, _data: u32) {}
    fn pipeline_barrier(&mut self, _src: vk::PipelineStageFlags, _dst: vk::PipelineStageFlags) {}
    fn bind_compute_pipeline(&mut self, _pipeline: vk::Pipeline) {}
    fn dispatch(&mut self, _x: u32, _y: u32, _z: u32) {}
    fn dispatch_indirect(&mut self, _buffer: vk::Buffer, _offset: u64) {}
    fn push_constants(&mut self, _layout: vk::PipelineLayout, _offset: u32, _data: &[u8]) {}
}

/// A `QueueBackend` whose completion delivery order is scripted by the
/// test: submissions are recorded in call order, and `poll` hands back
/// whichever of the still-outstanding ids the script names next,
/// regardless of submission order — exactly the out-of-order completion
/// §5/§8 scenario 6 exercises.
struct ScriptedBackend {
    submitted: Vec<SubmissionId>,
    delivery_order: VecDeque<usize>,
}

impl ScriptedBackend {
    fn new(delivery_order: Vec<usize>) -> Self {
        ScriptedBackend {
            submitted: Vec::new(),
            delivery_order: delivery_order.into(),
        }
    }
}

impl QueueBackend for ScriptedBackend {
    fn submit(&mut self, id: SubmissionId, record: Box<dyn FnOnce(&mut dyn CommandRecorder)>) {
        record(&mut NoopRecorder);
        self.submitted.push(id);
    }

    fn poll(&mut self) -> Vec<SubmissionId> {
        match self.delivery_order.pop_front() {
            Some(index) => vec![self.submitted[index]],
            None => Vec::new(),
        }
    }
}

fn identity_transform() -> [f32; 8] {
    [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]
}

fn unit_clip() -> Quad {
    [0.0, 0.0, 1.0, 1.0]
}

fn config(ring: u32, cohort: u32, eager: u32, dispatches: u32) -> TargetConfig {
    let mut group_sizes = HashMap::new();
    for name in [
        "fill_scan",
        "fill_dispatch",
        "fill_expand",
        "ttrks_segment_dispatch",
        "ttrks_segment",
        "rasters_alloc",
        "rasters_prefix",
    ] {
        group_sizes.insert(
            name.to_string(),
            GroupSize {
                workgroup: 64,
                subgroup_log2: 5,
            },
        );
    }
    TargetConfig {
        ring,
        cohort,
        eager,
        dispatches,
        ttrks: 1024,
        cmds: 1024,
        fill_scan: FillScanConfig { rows: 1 },
        group_sizes,
        allocator_device: HashMap::new(),
        no_staging: true,
    }
}

fn radix() -> RadixSortRequirements {
    RadixSortRequirements {
        keyvals_size: 4096,
        keyvals_align: 8,
        internal_size: 256,
        internal_align: 8,
        indirect_size: 64,
        indirect_align: 4,
    }
}

fn pipelines() -> Pipelines {
    Pipelines {
        layout: vk::PipelineLayout::null(),
        fill_scan: vk::Pipeline::null(),
        fill_dispatch: vk::Pipeline::null(),
        fill_expand: vk::Pipeline::null(),
        rasterize: [vk::Pipeline::null(); PRIMITIVE_COUNT],
        ttrks_segment_dispatch: vk::Pipeline::null(),
        ttrks_segment: vk::Pipeline::null(),
        rasters_alloc: vk::Pipeline::null(),
        rasters_prefix: vk::Pipeline::null(),
    }
}

fn buffers() -> Buffers {
    use spinel_raster::alloc::StagedRing;
    Buffers {
        cf: StagedRing::unstaged(vk::Buffer::null()),
        tc: StagedRing::unstaged(vk::Buffer::null()),
        rc: StagedRing::unstaged(vk::Buffer::null()),
        arena: vk::Buffer::null(),
        per_dispatch_arena_capacity: 1 << 20,
        copyback: vk::Buffer::null(),
    }
}

fn harness(
    cfg: TargetConfig,
    delivery_order: Vec<usize>,
) -> (
    RasterBuilder<ScriptedBackend>,
    Rc<RefCell<HandlePool>>,
    Rc<RefCell<DepsScheduler<ScriptedBackend>>>,
) {
    let _ = env_logger::try_init();
    let device = DeviceInfo::default();
    let scheduler = Rc::new(RefCell::new(DepsScheduler::new(ScriptedBackend::new(delivery_order))));
    let handles = Rc::new(RefCell::new(HandlePool::new(
        64,
        4,
        device,
        vk::Pipeline::null(),
        vk::PipelineLayout::null(),
        GroupSize {
            workgroup: 64,
            subgroup_log2: 5,
        },
    )));
    let lost_hook = Rc::new(spinel_raster::device::AbortOnDeviceLost);
    let builder = RasterBuilder::new(
        handles.clone(),
        scheduler.clone(),
        device,
        BlockPoolAddresses {
            ids: 0,
            blocks: 0,
            host_map: 0,
            bp_mask: 0,
        },
        cfg,
        pipelines(),
        radix(),
        buffers(),
        lost_hook,
    );
    (builder, handles, scheduler)
}

/// Scenario 1: single raster, single path.
#[test]
fn single_raster_single_path() {
    let (mut b, handles, _sched) = harness(config(16, 4, 2, 2), vec![0, 1, 2, 3]);
    let path = Path::from_handle(handles.borrow_mut().acquire().unwrap());
    let mut tw = vec![Weakref::default(); 1];
    let mut cw = vec![Weakref::default(); 1];

    b.begin().unwrap();
    b.add(&[path], &mut tw, &[identity_transform()], &mut cw, &[unit_clip()], 1).unwrap();
    let raster = b.end().unwrap();

    // The raster handle is drawn from the same pool as the path handle but
    // is never the same slot, since the path's handle is still retained.
    assert_ne!(path.raw(), raster.raw());
    b.release().unwrap();
}

/// Scenario 2: a second raster in the same cohort reuses the cached
/// transform/clip weakrefs instead of writing fresh `tc` quads.
#[test]
fn transform_and_clip_reuse_within_cohort() {
    let (mut b, handles, _sched) = harness(config(16, 4, 8, 2), vec![0, 1, 2, 3]);
    let p0 = Path::from_handle(handles.borrow_mut().acquire().unwrap());
    let p1 = Path::from_handle(handles.borrow_mut().acquire().unwrap());
    let mut tw = vec![Weakref::default(); 1];
    let mut cw = vec![Weakref::default(); 1];
    let transform = identity_transform();
    let clip = unit_clip();

    b.begin().unwrap();
    b.add(&[p0], &mut tw, &[transform], &mut cw, &[clip], 1).unwrap();
    let r0 = b.end().unwrap();

    b.begin().unwrap();
    b.add(&[p1], &mut tw, &[transform], &mut cw, &[clip], 1).unwrap();
    let r1 = b.end().unwrap();

    assert_ne!(r0.raw(), r1.raw());
    b.release().unwrap();
}

/// Scenario 3: an explicit `flush` between two rasters bumps the epoch,
/// so a weakref that hit before the flush must miss after it and mint a
/// fresh transform/clip pair.
#[test]
fn epoch_invalidation_across_explicit_flush() {
    let (mut b, handles, _sched) = harness(config(16, 8, 64, 4), vec![0, 1, 2, 3]);
    let p0 = Path::from_handle(handles.borrow_mut().acquire().unwrap());
    let p1 = Path::from_handle(handles.borrow_mut().acquire().unwrap());
    let mut tw = vec![Weakref::default(); 1];
    let mut cw = vec![Weakref::default(); 1];
    let transform = identity_transform();
    let clip = unit_clip();

    b.begin().unwrap();
    b.add(&[p0], &mut tw, &[transform], &mut cw, &[clip], 1).unwrap();
    b.end().unwrap();

    // Force a flush: this bumps the epoch and invalidates `tw`/`cw`.
    b.flush().unwrap();

    let weakref_before = tw[0];
    b.begin().unwrap();
    b.add(&[p1], &mut tw, &[transform], &mut cw, &[clip], 1).unwrap();
    b.end().unwrap();

    // The weakref was overwritten with a fresh epoch stamp rather than
    // reused as-is.
    assert_ne!(tw[0], weakref_before);
    b.release().unwrap();
}

/// Scenario 4: the second of two single-raster cohorts auto-flushes on
/// `end`, and the builder is immediately ready to begin a fresh raster.
#[test]
fn cohort_full_auto_flush() {
    let (mut b, handles, _sched) = harness(config(16, 2, 32, 2), vec![0, 1, 2, 3]);
    let transform = identity_transform();
    let clip = unit_clip();

    for _ in 0..2 {
        let path = Path::from_handle(handles.borrow_mut().acquire().unwrap());
        let mut tw = vec![Weakref::default(); 1];
        let mut cw = vec![Weakref::default(); 1];
        b.begin().unwrap();
        b.add(&[path], &mut tw, &[transform], &mut cw, &[clip], 1).unwrap();
        b.end().unwrap();
    }

    // A third raster starts cleanly against the freshly-acquired dispatch
    // the auto-flush left behind.
    let path = Path::from_handle(handles.borrow_mut().acquire().unwrap());
    let mut tw = vec![Weakref::default(); 1];
    let mut cw = vec![Weakref::default(); 1];
    b.begin().unwrap();
    b.add(&[path], &mut tw, &[transform], &mut cw, &[clip], 1).unwrap();
    b.end().unwrap();
    b.release().unwrap();
}

/// Scenario 5: a single raster issuing one more command than the `cf`
/// ring can ever hold is rejected as unrecoverable but the builder stays
/// `READY`.
#[test]
fn raster_longer_than_ring_is_recoverable() {
    let (mut b, handles, _sched) = harness(config(16, 4, 64, 2), vec![]);
    let path = Path::from_handle(handles.borrow_mut().acquire().unwrap());
    let paths: Vec<Path> = vec![path; 17];
    let transforms = vec![identity_transform(); 17];
    let clips = vec![unit_clip(); 17];
    let mut tw = vec![Weakref::default(); 17];
    let mut cw = vec![Weakref::default(); 17];

    b.begin().unwrap();
    let err = b.add(&paths, &mut tw, &transforms, &mut cw, &clips, 17).unwrap_err();
    assert_eq!(err, SpinelError::BuilderTooManyPaths);

    // The builder is still usable: a normal-sized raster succeeds next.
    let mut tw2 = vec![Weakref::default(); 1];
    let mut cw2 = vec![Weakref::default(); 1];
    b.add(&[path], &mut tw2, &transforms[..1], &mut cw2, &clips[..1], 1).unwrap();
    b.end().unwrap();
    b.release().unwrap();
}

/// Scenario 6: three handle-pool reclaim dispatches complete out of
/// order; handles are only freed back to the pool as a consecutive run
/// starting at the tail, never ahead of an incomplete predecessor.
#[test]
fn reclaim_out_of_order_completion_releases_in_tail_order() {
    use spinel_raster::handle::HandleKind;

    let mut scheduler = DepsScheduler::new(ScriptedBackend::new(vec![2, 0, 1]));
    let mut pool = HandlePool::new(
        4,
        1,
        DeviceInfo::default(),
        vk::Pipeline::null(),
        vk::PipelineLayout::null(),
        GroupSize {
            workgroup: 64,
            subgroup_log2: 5,
        },
    );

    // Saturate the pool (capacity 4): three handles get released below,
    // the fourth stays retained so the free ring never has a spare slot
    // to mask the reclaim-ordering behavior under test.
    let handles: Vec<_> = (0..4).map(|_| pool.acquire().unwrap()).collect();
    for h in &handles[..3] {
        pool.release_device(*h, HandleKind::Raster);
        pool.release_host(&[*h], HandleKind::Raster).unwrap();
        // eager == 1: each release flushes its own single-handle span as
        // an independent reclaim flight.
        pool.flush_if_eager(&mut scheduler);
    }

    // Flight 2 (handles[2]) reports complete first; it must wait behind
    // flights 0 and 1 in the tail walk, so nothing is releasable yet and
    // the pool — saturated, with reclaim still pending — reports the
    // recoverable overflow rather than a free slot.
    assert!(scheduler.drain_1());
    pool.pump_reclaim();
    assert_eq!(pool.acquire().unwrap_err(), SpinelError::HandleOverflow);

    // Flight 0 completes next: the tail run is now [0] only, flight 1
    // still pending blocks flight 2 from releasing alongside it.
    assert!(scheduler.drain_1());
    pool.pump_reclaim();
    let a = pool.acquire().unwrap();
    assert_eq!(a, handles[0]);

    // Flight 1 completes last: both it and the already-finished flight 2
    // release together in the same pump.
    assert!(scheduler.drain_1());
    pool.pump_reclaim();
    let b = pool.acquire().unwrap();
    let c = pool.acquire().unwrap();
    assert_eq!((b, c), (handles[1], handles[2]));
}

/// A path handle foreign to the builder's own (smaller) handle pool is
/// rejected by `add` as `InvalidHandle`, and the builder is left exactly as
/// ready as before the call.
#[test]
fn add_rejects_a_path_handle_foreign_to_the_builder() {
    let (mut b, handles, _sched) = harness(config(16, 4, 2, 2), vec![0, 1]);

    // A handle pool of its own, sized well past the builder's 64-slot one,
    // just to mint a handle whose raw id is out of the builder pool's range.
    let mut foreign_pool = HandlePool::new(
        128,
        4,
        DeviceInfo::default(),
        vk::Pipeline::null(),
        vk::PipelineLayout::null(),
        GroupSize {
            workgroup: 64,
            subgroup_log2: 5,
        },
    );
    let stale = loop {
        let h = foreign_pool.acquire().unwrap();
        if h.raw() >= 64 {
            break h;
        }
    };
    let stale_path = Path::from_handle(stale);

    let mut tw = vec![Weakref::default(); 1];
    let mut cw = vec![Weakref::default(); 1];
    b.begin().unwrap();
    let err = b
        .add(&[stale_path], &mut tw, &[identity_transform()], &mut cw, &[unit_clip()], 1)
        .unwrap_err();
    assert_eq!(err, SpinelError::InvalidHandle);

    // The builder never saw this as the start of a raster it has to unwind:
    // a normal raster still begins and ends cleanly right after.
    let path = Path::from_handle(handles.borrow_mut().acquire().unwrap());
    b.add(&[path], &mut tw, &[identity_transform()], &mut cw, &[unit_clip()], 1).unwrap();
    b.end().unwrap();
    b.release().unwrap();
}
