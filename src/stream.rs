// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 zenedge contributors
//
// Streaming obs/action rings.
//
// Kernel: produces actions, consumes observations.
// Host:   consumes actions, produces observations.
//
// Both rings self-identify with the stream magic and 64 slots; `ready()`
// gates streaming mode on the peer having initialised them.

use std::sync::Arc;

use crate::error::Result;
use crate::proto::{
    ActEntry, ObsEntry, IPC_ACT_RING_OFFSET, IPC_OBS_RING_OFFSET, IPC_STREAM_MAGIC,
    IPC_STREAM_RING_SIZE, IPC_STREAM_WINDOW,
};
use crate::ring::SpscRing;
use crate::shm::SharedMem;

pub struct StreamRings {
    obs: SpscRing<ObsEntry>,
    act: SpscRing<ActEntry>,
}

impl StreamRings {
    pub fn new(shm: Arc<SharedMem>) -> Self {
        Self {
            obs: SpscRing::new(
                Arc::clone(&shm),
                IPC_OBS_RING_OFFSET,
                IPC_STREAM_WINDOW,
                IPC_STREAM_MAGIC,
                "obs",
            ),
            act: SpscRing::new(
                shm,
                IPC_ACT_RING_OFFSET,
                IPC_STREAM_WINDOW,
                IPC_STREAM_MAGIC,
                "act",
            ),
        }
    }

    /// Both rings initialised by the peer.
    pub fn ready(&self) -> bool {
        self.obs.is_ready() && self.act.is_ready()
    }

    /// Consume one action entry, if any.
    pub fn pop_action(&self) -> Option<ActEntry> {
        self.act.consume()
    }

    /// Publish one observation entry.
    pub fn push_obs(&self, entry: &ObsEntry) -> Result<()> {
        self.obs.produce(entry)
    }

    pub fn obs_ring(&self) -> &SpscRing<ObsEntry> {
        &self.obs
    }

    pub fn act_ring(&self) -> &SpscRing<ActEntry> {
        &self.act
    }

    /// Peer-style initialisation of both rings (demo peer, tests).
    pub fn init(&self) {
        self.obs.init_header(IPC_STREAM_RING_SIZE);
        self.act.init_header(IPC_STREAM_RING_SIZE);
    }
}
