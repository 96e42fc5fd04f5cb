//! The narrow device/queue/memory contract the rest of this crate is built
//! against. Actual device creation, physical-device selection, and memory
//! allocator plumbing are out of scope (§1) — this module only names the
//! seam: seam, not a backend.
//!
//! Command recording is modeled as a trait so the raster builder's
//! submission action (§4G) can be exercised in tests against a fake, while
//! the shapes of its methods mirror `ash::Device`'s real compute/transfer
//! entry points one-for-one.

use ash::vk;

bitflags::bitflags! {
    /// Memory-type properties relevant to ring placement decisions. Mirrors
    /// the subset of `vk::MemoryPropertyFlags` the host allocator cares
    /// about (§4C, §6 `allocator.device.*`).
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct MemoryProperties: u8 {
        /// GPU-local memory.
        const DEVICE_LOCAL = 0x1;
        /// Mappable from the host.
        const HOST_VISIBLE = 0x2;
        /// Host writes are visible to the device without an explicit flush.
        const HOST_COHERENT = 0x4;
    }
}

/// Static properties of the device the builder is attached to. Queried once
/// at builder creation; never mutated.
#[derive(Debug, Clone, Copy)]
pub struct DeviceInfo {
    /// Whether a single memory type satisfies `HOST_VISIBLE | HOST_COHERENT
    /// | DEVICE_LOCAL` simultaneously. When `false`, the raster builder's
    /// rings are staged (§3, §9 `StagedBuffer`).
    pub has_host_coherent_device_local: bool,
    /// Non-coherent atom size in bytes. Mapped-range flushes for
    /// non-coherent memory round outward to this boundary (§4C, §9).
    pub non_coherent_atom_size: u64,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        DeviceInfo {
            has_host_coherent_device_local: false,
            non_coherent_atom_size: 256,
        }
    }
}

/// Round `[offset, offset+size)` outward to `atom` so a
/// `vkFlushMappedMemoryRanges` call is valid for non-coherent memory. `atom`
/// must be a power of two.
pub fn round_to_non_coherent_atom(offset: u64, size: u64, atom: u64) -> (u64, u64) {
    let mask = atom - 1;
    let aligned_offset = offset & !mask;
    let end = offset + size;
    let aligned_end = (end + mask) & !mask;
    (aligned_offset, aligned_end - aligned_offset)
}

/// Called when an unbounded wait cannot make progress (§7 fatal path). The
/// reference hook aborts the process; tests install one that records the
/// call instead.
pub trait DeviceLostHook {
    /// Invoked exactly once before a public operation returns
    /// `SpinelError::DeviceLost`.
    fn device_lost(&self);
}

/// The reference hook: log and abort.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortOnDeviceLost;

impl DeviceLostHook for AbortOnDeviceLost {
    fn device_lost(&self) {
        log::error!("spinel-raster: device lost, no pending work can be drained to make progress");
        std::process::abort();
    }
}

/// Records the compute/transfer commands the submission action (§4G) needs.
/// Implemented once for real `ash::Device` + `vk::CommandBuffer` pairs, and
/// by a recording fake in `tests/`.
pub trait CommandRecorder {
    /// `vkCmdCopyBuffer`.
    fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]);
    /// `vkCmdFillBuffer`.
    fn fill_buffer(&mut self, buffer: vk::Buffer, offset: u64, size: u64, data: u32);
    /// `vkCmdPipelineBarrier`, stage masks only — the builder never needs
    /// access-mask precision beyond what §4G's step list already implies.
    fn pipeline_barrier(&mut self, src_stage: vk::PipelineStageFlags, dst_stage: vk::PipelineStageFlags);
    /// `vkCmdBindPipeline` for `VK_PIPELINE_BIND_POINT_COMPUTE`.
    fn bind_compute_pipeline(&mut self, pipeline: vk::Pipeline);
    /// `vkCmdDispatch`.
    fn dispatch(&mut self, x: u32, y: u32, z: u32);
    /// `vkCmdDispatchIndirect`.
    fn dispatch_indirect(&mut self, buffer: vk::Buffer, offset: u64);
    /// `vkCmdPushConstants`, compute stage only — every pipeline this crate
    /// binds is a compute pipeline.
    fn push_constants(&mut self, layout: vk::PipelineLayout, offset: u32, data: &[u8]);

    /// Invokes the external radix-sort collaborator (§6, §4G step 12) over
    /// the TTRK keyvals buffer, dispatched indirectly off the sort count
    /// the fill passes produced, using its own internal/indirect scratch.
    /// The sort algorithm and its command-recording logic are out of scope
    /// (§1) — a real implementation wires this straight through to the
    /// external library's own command-buffer-recording entry point. The
    /// default is a no-op so fakes under test need not implement it.
    fn radix_sort_indirect(&mut self, _args: RadixSortIndirectArgs) {}
}

/// Arguments for one radix-sort-indirect invocation (§4G step 12): buffer
/// identifiers and byte offsets, all carved from the same per-dispatch
/// arena the rest of the command buffer's scratch regions live in.
#[derive(Debug, Clone, Copy)]
pub struct RadixSortIndirectArgs {
    /// The TTRK keyvals to sort in place.
    pub keyvals: vk::Buffer,
    /// Byte offset of the keyvals region within `keyvals`.
    pub keyvals_offset: u64,
    /// Where the sort count produced by `fill_scan`/`fill_dispatch` lives.
    pub count: vk::Buffer,
    /// Byte offset of the count word within `count`.
    pub count_offset: u64,
    /// The external sort's own internal scratch.
    pub internal: vk::Buffer,
    /// Byte offset of the internal scratch within `internal`.
    pub internal_offset: u64,
    /// The external sort's own indirect-dispatch scratch.
    pub indirect: vk::Buffer,
    /// Byte offset of the indirect scratch within `indirect`.
    pub indirect_offset: u64,
}

/// `CommandRecorder` backed by a real `ash::Device`.
pub struct AshRecorder<'a> {
    /// The loaded device entry points.
    pub device: &'a ash::Device,
    /// The command buffer currently being recorded.
    pub cmd: vk::CommandBuffer,
}

impl<'a> CommandRecorder for AshRecorder<'a> {
    fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        unsafe { self.device.cmd_copy_buffer(self.cmd, src, dst, regions) };
    }

    fn fill_buffer(&mut self, buffer: vk::Buffer, offset: u64, size: u64, data: u32) {
        unsafe { self.device.cmd_fill_buffer(self.cmd, buffer, offset, size, data) };
    }

    fn pipeline_barrier(&mut self, src_stage: vk::PipelineStageFlags, dst_stage: vk::PipelineStageFlags) {
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[],
            )
        };
    }

    fn bind_compute_pipeline(&mut self, pipeline: vk::Pipeline) {
        unsafe {
            self.device
                .cmd_bind_pipeline(self.cmd, vk::PipelineBindPoint::COMPUTE, pipeline)
        };
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        unsafe { self.device.cmd_dispatch(self.cmd, x, y, z) };
    }

    fn dispatch_indirect(&mut self, buffer: vk::Buffer, offset: u64) {
        unsafe { self.device.cmd_dispatch_indirect(self.cmd, buffer, offset) };
    }

    fn push_constants(&mut self, layout: vk::PipelineLayout, offset: u32, data: &[u8]) {
        unsafe {
            self.device
                .cmd_push_constants(self.cmd, layout, vk::ShaderStageFlags::COMPUTE, offset, data)
        };
    }
}

/// Device addresses handed to the shaders the raster builder invokes (§6
/// Block pool). The raster builder treats these as opaque — it writes only
/// through the shaders, never directly.
#[derive(Debug, Clone, Copy)]
pub struct BlockPoolAddresses {
    /// Device address of the block-id table.
    pub ids: u64,
    /// Device address of the block storage.
    pub blocks: u64,
    /// Device address of the host-mapped view, when the pool is host
    /// visible.
    pub host_map: u64,
    /// Mask applied to block indices (`bp_mask`, §6).
    pub bp_mask: u32,
}

#[cfg(test)]
mod device_tests {
    use super::*;

    #[test]
    fn rounds_outward_not_inward() {
        let (off, size) = round_to_non_coherent_atom(300, 10, 256);
        assert_eq!(off, 256);
        assert_eq!(size, 512 - 256);
        assert!(off <= 300);
        assert!(off + size >= 310);
    }

    #[test]
    fn already_aligned_range_is_unchanged() {
        let (off, size) = round_to_non_coherent_atom(256, 256, 256);
        assert_eq!((off, size), (256, 256));
    }
}
