//! Shared Types for the Blockhouse Storage Engine
//!
//! This crate holds everything both server roles agree on: global block
//! handles, internal keys, SSTable metadata, version edits, the compaction
//! request payload, the wire protocol frames, and the on-disk block format.
//!
//! ## The Two Roles
//!
//! A blockhouse cluster splits responsibilities between:
//!
//! - **LTC** (log/table coordinator) nodes: own the write path, memtables,
//!   and the LSM logical state.
//! - **StoC** (storage component) nodes: own append-only segment files that
//!   hold the actual SSTable bytes.
//!
//! An SSTable built on an LTC is scattered across several StoCs as
//! contiguous data-block groups; everything needed to find those bytes again
//! travels through the types in this crate.
//!
//! ## Encoding Conventions
//!
//! All integers are fixed-width little-endian. Strings are u32
//! length-prefixed. Every block written through the table builder carries a
//! 6-byte trailer: compression type, masked CRC32, and a non-zero sentinel
//! byte that readers use to detect whether a one-sided write has landed.

pub mod block;
pub mod codec;
pub mod compaction;
pub mod error;
pub mod handle;
pub mod key;
pub mod meta;
pub mod version_edit;
pub mod wire;

pub use compaction::CompactionRequest;
pub use error::{Error, Result};
pub use handle::{BlockHandle, StoCBlockHandle};
pub use key::{InternalKey, ValueKind};
pub use meta::{DeletedFileIdentifier, FileMetaData, SubRange};
pub use version_edit::VersionEdit;
pub use wire::RequestType;
