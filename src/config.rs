//! `TargetConfig` (§6): target-specific tuning the raster builder and the
//! handle pool are built against. Parsing this from a file or CLI is out of
//! scope (§1) — only the struct itself, as the contract a host application
//! hands the builder at construction time.

use std::collections::HashMap;

use ash::vk;

use crate::device::MemoryProperties;

/// `fill_scan` pipeline tuning (§6 `fill_scan.rows`).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillScanConfig {
    /// Rows processed per workgroup invocation of `fill_scan`.
    pub rows: u32,
}

/// Workgroup/subgroup shape for one compute pipeline (§6
/// `group_sizes.named.<pipeline>`).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupSize {
    /// Invocations per workgroup.
    pub workgroup: u32,
    /// `log2` of the subgroup size, so `subgroup = 1 << subgroup_log2`.
    pub subgroup_log2: u32,
}

impl GroupSize {
    /// Invocations per subgroup.
    pub fn subgroup(&self) -> u32 {
        1 << self.subgroup_log2
    }
}

/// One entry of `allocator.device.*` (§6): a candidate memory type and the
/// buffer usage it is expected to back.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy)]
pub struct MemoryTypeConfig {
    /// Required memory properties for this role.
    pub properties: MemoryProperties,
    /// Buffer usage flags the allocations under this role are created with.
    #[cfg_attr(feature = "serde", serde(with = "usage_flags"))]
    pub usage: vk::BufferUsageFlags,
}

#[cfg(feature = "serde")]
mod usage_flags {
    use ash::vk;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(flags: &vk::BufferUsageFlags, s: S) -> Result<S::Ok, S::Error> {
        flags.as_raw().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<vk::BufferUsageFlags, D::Error> {
        let raw = u32::deserialize(d)?;
        Ok(vk::BufferUsageFlags::from_raw(raw))
    }
}

/// Target-specific configuration for the raster builder and handle pool.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct TargetConfig {
    /// `cf` ring size. Must be a power of two.
    pub ring: u32,
    /// Maximum rasters per flush (cohort size).
    pub cohort: u32,
    /// Command count at which `end` auto-flushes.
    pub eager: u32,
    /// Maximum in-flight dispatches.
    pub dispatches: u32,
    /// Conservative per-dispatch TTRK key capacity.
    pub ttrks: u32,
    /// Conservative per-dispatch rasterization-command capacity.
    pub cmds: u32,
    /// `fill_scan` tuning.
    pub fill_scan: FillScanConfig,
    /// Workgroup/subgroup shape, keyed by pipeline name (`fill_dispatch`,
    /// `fill_expand`, `ttrks_segment`, `rasters_alloc`, `rasters_prefix`,
    /// the eight rasterize pipelines, the reclaim pipeline, …).
    pub group_sizes: HashMap<String, GroupSize>,
    /// Candidate memory types, keyed by role (e.g. `"hw_dr"`, `"hrw_dr"`,
    /// `"drw"`).
    pub allocator_device: HashMap<String, MemoryTypeConfig>,
    /// Disables host-to-device staging even on a discrete device.
    pub no_staging: bool,
}

impl TargetConfig {
    /// Look up a pipeline's group size, panicking with the pipeline name on
    /// miss — a missing entry here is a configuration bug, not a runtime
    /// condition the builder can recover from.
    pub fn group_size(&self, pipeline: &str) -> GroupSize {
        *self
            .group_sizes
            .get(pipeline)
            .unwrap_or_else(|| panic!("missing group_sizes entry for pipeline `{}`", pipeline))
    }
}
