//! SSTable Lifecycle: Build, Scatter, Read
//!
//! This crate carries the LTC-side table machinery and the plumbing both
//! roles share:
//!
//! - `MemManager`: slab allocator of pinned, fabric-registered buffers.
//! - `BlockClient`: request-id allocation, in-flight contexts, completion
//!   demux over a narrow `Transport` seam.
//! - `TableBuilder` + `ScatterFile`: assemble an SSTable in a pinned buffer,
//!   split its data blocks into key-ordered groups, scatter the groups across
//!   StoCs, then rewrite and persist the metadata blob.
//! - `StocReadableFile` + `Table`: resolve logical blocks back through group
//!   handles, lazily or via whole-table prefetch.
//! - `StorageSelector`: scatter-policy peer choice driven by per-peer load.

pub mod bloom;
pub mod builder;
pub mod client;
pub mod filename;
pub mod mem_manager;
pub mod reader;
pub mod scatter;
pub mod selector;

#[cfg(test)]
pub(crate) mod testutil;

pub use builder::TableBuilder;
pub use client::{BlockClient, LocalBlockReader, RequestKind, StocResponse, Transport};
pub use mem_manager::{MemManager, PinnedBuf};
pub use reader::{StocReadableFile, Table};
pub use scatter::{partition_into_groups, ScatterFile, ScatterResult};
pub use selector::StorageSelector;
