// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error types.
//
// Would-block is deliberately not represented here: the `try_*` queue
// operations surface it as a distinguished non-error outcome (`Ok(false)`
// or `None`) instead.

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShmError {
    /// An OS call failed (allocation, segment creation, mapping, ...).
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// The caller passed something unusable: zero size, a name with an
    /// interior NUL, a misshapen key, ...
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// An operation was applied to an object in the wrong state, e.g. a
    /// queue that was never initialized or a region missing from the
    /// expected bookkeeping list.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Enqueue payload larger than the queue's configured limit.
    #[error("payload size {size} exceeds queue limit {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    /// A contact token that does not decode under this backend's format.
    #[error("malformed contact token: {0}")]
    BadContactToken(&'static str),

    /// A `RegionId` that this manager does not track.
    #[error("unknown region handle")]
    UnknownRegion,
}

impl ShmError {
    /// Capture `errno` for the OS call `op` that just failed.
    pub(crate) fn os(op: &'static str) -> Self {
        ShmError::Os {
            op,
            source: io::Error::last_os_error(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ShmError>;
