// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 zenedge contributors
//
// The bridge: owns the mapping, the rings, the heap and the handler
// registry, and runs the polling loop. One host thread does everything;
// the kernel peer is the other side of every ring.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::arbiter::ModelLifecycle;
use crate::doorbell::Doorbell;
use crate::env::{make_env, Environment};
use crate::error::{BridgeError, Result};
use crate::heap::HeapManager;
use crate::models::ModelCache;
use crate::proto::{
    cmd_name, timestamp_usec, ObsEntry, Packet, Response, DOORBELL_MAGIC, IPC_CMD_RING_OFFSET,
    IPC_MAGIC, IPC_RING_WINDOW, IPC_RSP_MAGIC, IPC_RSP_RING_OFFSET, RING_HEAD_OFFSET,
    RING_MAGIC_OFFSET, RING_SIZE_OFFSET, RING_TAIL_OFFSET, RSP_ERROR,
};
use crate::ring::SpscRing;
use crate::shm::SharedMem;
use crate::stream::StreamRings;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub shm_path: PathBuf,
    pub model_dir: PathBuf,
    pub create: bool,
    pub poll_interval: Duration,
    pub env_name: String,
    pub ifr_dir: PathBuf,
    /// `ZENEDGE_ARBITER_URL`; `None` or empty disables remote arbitration.
    pub arbiter_url: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            shm_path: PathBuf::from("/dev/shm/zenedge.shm"),
            model_dir: PathBuf::from("./models"),
            create: false,
            poll_interval: Duration::from_millis(1),
            env_name: "CartPole-v1".to_owned(),
            ifr_dir: PathBuf::from("/tmp/zenedge_ifr"),
            arbiter_url: std::env::var("ZENEDGE_ARBITER_URL").ok(),
        }
    }
}

// ---------------------------------------------------------------------------
// Session state (environment, streaming, obs pool, model lifecycle)
// ---------------------------------------------------------------------------

/// Fixed pool of observation blobs reused round-robin; the peer hands a
/// blob back through the ack half of the next step payload.
pub struct ObsPool {
    free: VecDeque<u16>,
    outstanding: VecDeque<u16>,
}

pub const OBS_POOL_SIZE: usize = 8;
/// Pool blobs hold 7 floats (obs[4], reward, done, model id) with headroom.
pub const OBS_BLOB_SIZE: usize = 32;

impl ObsPool {
    fn new() -> Self {
        Self {
            free: VecDeque::new(),
            outstanding: VecDeque::new(),
        }
    }

    pub fn is_allocated(&self) -> bool {
        !self.free.is_empty() || !self.outstanding.is_empty()
    }

    /// Allocate the pool blobs on first use.
    pub fn ensure_allocated(&mut self, heap: &mut HeapManager) -> Result<()> {
        if self.is_allocated() {
            return Ok(());
        }
        for _ in 0..OBS_POOL_SIZE {
            let id = heap.allocate_blob(OBS_BLOB_SIZE, crate::proto::BLOB_TYPE_RAW)?;
            self.free.push_back(id);
        }
        Ok(())
    }

    /// Take a blob for the next observation. When the peer has stopped
    /// acking, the oldest outstanding blob is recycled.
    pub fn acquire(&mut self) -> Option<u16> {
        let id = self.free.pop_front().or_else(|| self.outstanding.pop_front())?;
        self.outstanding.push_back(id);
        Some(id)
    }

    /// Peer handed a blob back.
    pub fn ack(&mut self, id: u16) {
        if let Some(pos) = self.outstanding.iter().position(|&x| x == id) {
            self.outstanding.remove(pos);
            self.free.push_back(id);
        }
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

pub struct SessionState {
    pub env: Box<dyn Environment>,
    /// Blob holding the fixed-weight linear policy; 0 until first reset.
    pub policy_blob_id: u16,
    pub obs_pool: ObsPool,
    pub streaming: bool,
    pub lifecycle: ModelLifecycle,
}

impl SessionState {
    pub fn new(env_name: &str) -> Result<Self> {
        Ok(Self {
            env: make_env(env_name)?,
            policy_blob_id: 0,
            obs_pool: ObsPool::new(),
            streaming: false,
            lifecycle: ModelLifecycle::new(0),
        })
    }
}

// ---------------------------------------------------------------------------
// Handler plumbing
// ---------------------------------------------------------------------------

/// Capabilities handed to a handler: everything it may touch, nothing that
/// would let it re-enter the dispatcher.
pub struct HandlerCtx<'a> {
    pub heap: &'a mut HeapManager,
    pub models: &'a mut ModelCache,
    pub streams: &'a StreamRings,
    pub session: &'a mut SessionState,
    pub config: &'a BridgeConfig,
}

/// Handlers return `(status, result)`; errors become `RSP_ERROR/0` at the
/// dispatch boundary.
pub type Handler = fn(&mut HandlerCtx<'_>, &Packet) -> Result<(u16, u32)>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub commands_received: u64,
    pub responses_sent: u64,
    pub errors: u64,
    pub stream_steps: u64,
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

pub struct Bridge {
    shm: Arc<SharedMem>,
    cmd_ring: SpscRing<Packet>,
    rsp_ring: SpscRing<Response>,
    doorbell: Doorbell,
    streams: StreamRings,
    heap: HeapManager,
    models: ModelCache,
    session: SessionState,
    config: BridgeConfig,
    handlers: BTreeMap<u16, Handler>,
    stats: BridgeStats,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Result<Self> {
        let shm = Arc::new(SharedMem::open(&config.shm_path, config.create)?);
        info!(
            path = %config.shm_path.display(),
            bytes = shm.len(),
            "mapped shared memory"
        );

        let cmd_ring = SpscRing::new(
            Arc::clone(&shm),
            IPC_CMD_RING_OFFSET,
            IPC_RING_WINDOW,
            IPC_MAGIC,
            "command",
        );
        let rsp_ring = SpscRing::new(
            Arc::clone(&shm),
            IPC_RSP_RING_OFFSET,
            IPC_RING_WINDOW,
            IPC_RSP_MAGIC,
            "response",
        );
        let doorbell = Doorbell::new(Arc::clone(&shm));
        let streams = StreamRings::new(Arc::clone(&shm));
        let heap = HeapManager::new(Arc::clone(&shm));
        let models = ModelCache::new(&config.model_dir);
        let session = SessionState::new(&config.env_name)?;

        let bridge = Self {
            shm,
            cmd_ring,
            rsp_ring,
            doorbell,
            streams,
            heap,
            models,
            session,
            config,
            handlers: BTreeMap::new(),
            stats: BridgeStats::default(),
        };
        bridge.verify_initialization();
        Ok(bridge)
    }

    /// Log the peer-visible header state; the peer may still be booting,
    /// so unset magics are warnings, not errors.
    fn verify_initialization(&self) {
        for (label, base, expected) in [
            ("command", IPC_CMD_RING_OFFSET, IPC_MAGIC),
            ("response", IPC_RSP_RING_OFFSET, IPC_RSP_MAGIC),
        ] {
            let magic = self.shm.read_u32(base + RING_MAGIC_OFFSET);
            info!(
                ring = label,
                magic = %format_args!("{magic:#010x}"),
                head = self.shm.read_u32(base + RING_HEAD_OFFSET),
                tail = self.shm.read_u32(base + RING_TAIL_OFFSET),
                size = self.shm.read_u32(base + RING_SIZE_OFFSET),
                "ring header"
            );
            if magic != expected {
                warn!(
                    ring = label,
                    expected = %format_args!("{expected:#010x}"),
                    "ring not initialized yet"
                );
            }
        }
        if !self.doorbell.is_ready() {
            warn!(
                found = %format_args!("{:#010x}", self.doorbell.stored_magic()),
                expected = %format_args!("{DOORBELL_MAGIC:#010x}"),
                "doorbell not initialized yet"
            );
        }
    }

    pub fn register_handler(&mut self, cmd: u16, handler: Handler) {
        self.handlers.insert(cmd, handler);
    }

    /// Consume one command packet if available.
    pub fn poll_command(&mut self) -> Option<Packet> {
        let packet = self.cmd_ring.consume()?;
        self.stats.commands_received += 1;
        Some(packet)
    }

    /// Send a response. A full response ring is logged and the response
    /// dropped; the producer notices through its own timeout.
    pub fn send_response(&mut self, status: u16, orig_cmd: u16, result: u32, duration_us: u64) {
        let response = Response {
            status,
            orig_cmd,
            result,
            timestamp: if duration_us > 0 {
                duration_us
            } else {
                timestamp_usec()
            },
        };
        match self.rsp_ring.produce(&response) {
            Ok(()) => {
                let (head, _) = self.rsp_ring.cursors();
                self.doorbell.ring_response(head);
                self.stats.responses_sent += 1;
            }
            Err(e @ BridgeError::RingFull { .. }) => {
                error!(error = %e, "dropping response");
            }
            Err(e) => {
                error!(error = %e, "cannot send response");
            }
        }
    }

    /// Dispatch one packet; returns `(status, result, duration_us)`.
    pub fn dispatch(&mut self, packet: &Packet) -> (u16, u32, u64) {
        debug!(
            cmd = cmd_name(packet.cmd),
            code = %format_args!("{:#06x}", packet.cmd),
            payload = packet.payload_id,
            flags = %format_args!("{:#06x}", packet.flags),
            "received"
        );

        let Some(handler) = self.handlers.get(&packet.cmd).copied() else {
            warn!(cmd = cmd_name(packet.cmd), code = %format_args!("{:#06x}", packet.cmd), "no handler");
            self.stats.errors += 1;
            return (RSP_ERROR, 0, 0);
        };

        let start = Instant::now();
        let mut ctx = HandlerCtx {
            heap: &mut self.heap,
            models: &mut self.models,
            streams: &self.streams,
            session: &mut self.session,
            config: &self.config,
        };
        match handler(&mut ctx, packet) {
            Ok((status, result)) => {
                let duration_us = start.elapsed().as_micros() as u64;
                (status, result, duration_us)
            }
            Err(e) => {
                warn!(cmd = cmd_name(packet.cmd), error = %e, "handler failed");
                self.stats.errors += 1;
                (RSP_ERROR, 0, 0)
            }
        }
    }

    /// Process one command if available. Returns whether one was processed.
    pub fn run_once(&mut self) -> bool {
        let Some(packet) = self.poll_command() else {
            return false;
        };
        let (status, result, duration_us) = self.dispatch(&packet);
        self.send_response(status, packet.cmd, result, duration_us);
        true
    }

    /// One streaming-step attempt: consume an action, step the environment,
    /// publish the observation with `seq = action.seq + 1`. The environment
    /// auto-resets after a terminal step so the ring keeps flowing.
    pub fn stream_step_once(&mut self) -> bool {
        if !self.session.streaming {
            return false;
        }
        let Some(act) = self.streams.pop_action() else {
            return false;
        };

        let outcome = self.session.env.step(act.action);
        let entry = ObsEntry {
            seq: act.seq.wrapping_add(1),
            obs: outcome.obs,
            reward: outcome.reward,
            done: if outcome.done() { 1.0 } else { 0.0 },
            model_id: self.session.policy_blob_id as f32,
        };
        if let Err(e) = self.streams.push_obs(&entry) {
            warn!(error = %e, seq = entry.seq, "dropping observation");
        }
        if outcome.done() {
            self.session.env.reset();
        }
        self.stats.stream_steps += 1;
        true
    }

    /// Main loop: poll commands and the action stream, sleeping only when
    /// both are idle. `stop` is checked between iterations.
    pub fn run(&mut self, stop: &AtomicBool) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_secs_f64() * 1e3,
            "starting main loop"
        );
        let started = Instant::now();

        while !stop.load(Ordering::Acquire) {
            let did_cmd = self.run_once();
            let did_stream = self.stream_step_once();
            if !did_cmd && !did_stream {
                std::thread::sleep(self.config.poll_interval);
            }
        }

        let elapsed = started.elapsed().as_secs_f64();
        info!(
            duration_s = %format_args!("{elapsed:.1}"),
            commands = self.stats.commands_received,
            responses = self.stats.responses_sent,
            errors = self.stats.errors,
            stream_steps = self.stats.stream_steps,
            "session finished"
        );
    }

    // --- accessors ---

    pub fn stats(&self) -> BridgeStats {
        self.stats
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn heap_mut(&mut self) -> &mut HeapManager {
        &mut self.heap
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut SessionState {
        &mut self.session
    }

    pub fn streams(&self) -> &StreamRings {
        &self.streams
    }

    pub fn doorbell(&self) -> &Doorbell {
        &self.doorbell
    }
}
