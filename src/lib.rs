// Copyright 2017 The Gfx-rs Developers.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A GPU-resident 2D path rasterizer built on Vulkan compute.
//!
//! This crate owns the raster builder's host-side pipeline: a refcounted
//! handle pool, a ring/dispatch scheduler that tracks in-flight GPU
//! submissions, and the raster builder itself, which batches path
//! references and transforms into fill commands and flushes them as
//! compute dispatches. Path production, composition placement, styling,
//! final render/blit, device/queue/memory allocation, and the GPU shaders
//! themselves are out of scope — this crate only names the seams those
//! collaborators cross ([`path`], [`collab`], [`device`]).
//!
//! Start at [`builder::RasterBuilder`].

#![deny(missing_docs)]

/// Host allocator collaborators: the per-dispatch arena suballocator and the
/// staged host/device ring abstraction (component C).
pub mod alloc;
/// The raster builder pipeline (component G) — the crate's core.
pub mod builder;
/// Composition/styling/render collaborator contracts (component H, §6).
pub mod collab;
/// `TargetConfig` and its nested tuning structs (§6).
pub mod config;
/// The device/queue/memory contract the rest of the crate is generic over.
pub mod device;
/// Crate-wide error kinds (§7).
pub mod error;
/// The refcounted handle pool (component D).
pub mod handle;
/// Path handles and the path builder collaborator contract (component F).
pub mod path;
/// Mod-pow2 ring/cursor index accounting (component A).
pub mod ring;
/// The immediate/delayed dependency scheduler (component E).
pub mod sched;
/// Epoch-invalidated weakref index interning (component B).
pub mod weak;

pub use builder::{Raster, RasterBuilder};
pub use config::TargetConfig;
pub use error::{Result, SpinelError};
pub use handle::{Handle, HandlePool};
pub use path::{Path, PathBuilder};
pub use sched::{DepsScheduler, QueueBackend};
