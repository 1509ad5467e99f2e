//! Error Taxonomy
//!
//! One error enum shared by both roles. The variants map directly onto the
//! recovery contract each caller has:
//!
//! - `Transport` / `PeerFailed` / `ScatterFailed`: surfaced at the nearest
//!   `wait()` boundary; the caller reselects peers and retries.
//! - `OutOfSpace`: the caller retries the append on another segment.
//! - `Io`: fatal for the segment, retryable for the logical request.
//! - `Corruption`: never recovered; a corrupt block or footer stops the read
//!   (and, at the DB level, the process).
//! - `EpochMismatch`: cross-epoch request rejected with advisory.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport failure talking to server {server_id}: {reason}")]
    Transport { server_id: u32, reason: String },

    #[error("server {server_id} is declared failed")]
    PeerFailed { server_id: u32 },

    #[error("scatter write to server {server_id} failed: {reason}")]
    ScatterFailed { server_id: u32, reason: String },

    #[error("segment {stoc_file_id} out of space ({needed} bytes needed, {available} available)")]
    OutOfSpace {
        stoc_file_id: u32,
        needed: u64,
        available: u64,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("epoch mismatch: request carries epoch {requested}, current is {current}")]
    EpochMismatch { requested: u32, current: u32 },

    #[error("pinned memory exhausted: {0} bytes requested")]
    OutOfMemory(u64),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl Error {
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    pub fn transport(server_id: u32, reason: impl Into<String>) -> Self {
        Error::Transport {
            server_id,
            reason: reason.into(),
        }
    }

    /// True for errors a caller may retry after reselecting a peer or
    /// segment. Corruption and epoch mismatches are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. }
                | Error::PeerFailed { .. }
                | Error::ScatterFailed { .. }
                | Error::OutOfSpace { .. }
        )
    }
}
