// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 zenedge contributors
//
// Error kinds for the bridge. All of these are recovered locally: the
// dispatcher turns any handler failure into an ERROR response, and startup
// errors are the only ones that escape main.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("backing file not found: {0} (start the kernel first or pass --create)")]
    ShmMissing(PathBuf),

    #[error("backing file {path} is {actual} bytes, expected {expected}")]
    ShmSize {
        path: PathBuf,
        actual: u64,
        expected: u64,
    },

    #[error("heap not initialized (control magic {found:#010x})")]
    HeapUninit { found: u32 },

    #[error("not enough free blocks ({free} < {needed})")]
    OutOfCapacity { needed: usize, free: usize },

    #[error("no contiguous run of {0} blocks")]
    Fragmented(usize),

    #[error("blob {0} not found")]
    NotFound(u16),

    #[error("payload too large ({len} > {capacity})")]
    SizeMismatch { len: usize, capacity: usize },

    #[error("{ring} ring is full")]
    RingFull { ring: &'static str },

    #[error("{what} magic mismatch: found {found:#010x}, expected {expected:#010x}")]
    MagicMismatch {
        what: &'static str,
        found: u32,
        expected: u32,
    },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("handler failure: {0}")]
    Handler(String),

    #[error("external I/O: {0}")]
    ExternalIo(#[from] std::io::Error),
}
