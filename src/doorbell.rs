// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 zenedge contributors
//
// Doorbell control block: a pair of advisory counters either side uses to
// nudge the other out of a poll sleep. Correctness never depends on these;
// ring head/tail remain authoritative.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::proto::{
    DB_CMD_DOORBELL_OFFSET, DB_CMD_WRITES_OFFSET, DB_MAGIC_OFFSET, DB_RSP_DOORBELL_OFFSET,
    DB_RSP_WRITES_OFFSET, DB_VERSION_OFFSET, DOORBELL_MAGIC, IPC_DOORBELL_OFFSET,
};
use crate::shm::SharedMem;

pub struct Doorbell {
    shm: Arc<SharedMem>,
}

impl Doorbell {
    pub fn new(shm: Arc<SharedMem>) -> Self {
        Self { shm }
    }

    pub fn stored_magic(&self) -> u32 {
        self.shm
            .atomic_u32(IPC_DOORBELL_OFFSET + DB_MAGIC_OFFSET)
            .load(Ordering::Acquire)
    }

    pub fn is_ready(&self) -> bool {
        self.stored_magic() == DOORBELL_MAGIC
    }

    /// Ring the response doorbell after publishing a response ring head.
    /// Stores the new head value and bumps the write counter.
    pub fn ring_response(&self, head: u32) {
        self.shm
            .atomic_u32(IPC_DOORBELL_OFFSET + DB_RSP_DOORBELL_OFFSET)
            .store(head, Ordering::Release);
        self.shm
            .atomic_u32(IPC_DOORBELL_OFFSET + DB_RSP_WRITES_OFFSET)
            .fetch_add(1, Ordering::AcqRel);
    }

    /// Current command doorbell value (written by the peer).
    pub fn cmd_doorbell(&self) -> u32 {
        self.shm
            .atomic_u32(IPC_DOORBELL_OFFSET + DB_CMD_DOORBELL_OFFSET)
            .load(Ordering::Acquire)
    }

    pub fn cmd_writes(&self) -> u32 {
        self.shm
            .atomic_u32(IPC_DOORBELL_OFFSET + DB_CMD_WRITES_OFFSET)
            .load(Ordering::Acquire)
    }

    pub fn rsp_writes(&self) -> u32 {
        self.shm
            .atomic_u32(IPC_DOORBELL_OFFSET + DB_RSP_WRITES_OFFSET)
            .load(Ordering::Acquire)
    }

    /// Peer-style initialisation for the demo peer and tests.
    pub fn init(&self) {
        self.shm
            .zero_bytes(IPC_DOORBELL_OFFSET, crate::proto::DOORBELL_SIZE);
        self.shm
            .atomic_u32(IPC_DOORBELL_OFFSET + DB_VERSION_OFFSET)
            .store(1, Ordering::Relaxed);
        self.shm
            .atomic_u32(IPC_DOORBELL_OFFSET + DB_MAGIC_OFFSET)
            .store(DOORBELL_MAGIC, Ordering::Release);
    }
}
