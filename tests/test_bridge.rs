// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 zenedge contributors
//
// End-to-end bridge tests. A stub peer maps the same backing file through a
// second mapping, initialises the shared structures the way the kernel
// would, and exchanges packets with a real Bridge.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use zenedge_bridge::bridge::{Bridge, BridgeConfig};
use zenedge_bridge::handlers;
use zenedge_bridge::heap::HeapManager;
use zenedge_bridge::proto::{
    pack_step_payload, Packet, Response, BLOB_TYPE_RAW, CMD_ENV_RESET, CMD_ENV_STEP,
    CMD_HEAP_STATS, CMD_IFR_PERSIST, CMD_PING, CMD_PRINT, CMD_RUN_MODEL, CMD_TELEMETRY_POLL,
    CMD_TENSOR_ALLOC, CMD_TENSOR_FREE, IPC_CMD_RING_OFFSET, IPC_MAGIC, IPC_RING_SIZE,
    IPC_RING_WINDOW, IPC_RSP_MAGIC, IPC_RSP_RING_OFFSET, RSP_ERROR, RSP_OK,
};
use zenedge_bridge::ring::SpscRing;
use zenedge_bridge::shm::SharedMem;
use zenedge_bridge::stream::StreamRings;
use zenedge_bridge::tensor::Tensor;
use zenedge_bridge::Doorbell;

struct Peer {
    shm: Arc<SharedMem>,
    cmd: SpscRing<Packet>,
    rsp: SpscRing<Response>,
}

impl Peer {
    fn attach(path: &Path) -> Self {
        let shm = Arc::new(SharedMem::open(path, true).expect("peer map"));
        let cmd = SpscRing::new(
            Arc::clone(&shm),
            IPC_CMD_RING_OFFSET,
            IPC_RING_WINDOW,
            IPC_MAGIC,
            "command",
        );
        let rsp = SpscRing::new(
            Arc::clone(&shm),
            IPC_RSP_RING_OFFSET,
            IPC_RING_WINDOW,
            IPC_RSP_MAGIC,
            "response",
        );
        Self { shm, cmd, rsp }
    }

    /// Everything the kernel initialises on boot.
    fn init_shared(&self) {
        self.cmd.init_header(IPC_RING_SIZE);
        self.rsp.init_header(IPC_RING_SIZE);
        Doorbell::new(Arc::clone(&self.shm)).init();
        HeapManager::new(Arc::clone(&self.shm)).init_control();
        StreamRings::new(Arc::clone(&self.shm)).init();
    }

    fn heap(&self) -> HeapManager {
        HeapManager::new(Arc::clone(&self.shm))
    }

    fn send(&self, cmd: u16, payload_id: u32) {
        let packet = Packet {
            cmd,
            flags: 0,
            payload_id,
            timestamp: 1,
        };
        self.cmd.produce(&packet).expect("peer produce");
    }

    fn recv(&self) -> Response {
        self.rsp.consume().expect("expected a response")
    }
}

fn setup(ifr_dir: Option<&Path>) -> (tempfile::TempDir, Bridge, Peer) {
    let dir = tempfile::tempdir().expect("tempdir");
    let shm_path = dir.path().join("zenedge.shm");

    let peer = Peer::attach(&shm_path);
    peer.init_shared();

    let config = BridgeConfig {
        shm_path: shm_path.clone(),
        model_dir: dir.path().join("models"),
        create: false,
        poll_interval: Duration::from_millis(1),
        env_name: "CartPole-v1".to_owned(),
        ifr_dir: ifr_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| dir.path().join("ifr")),
        arbiter_url: None,
    };
    let mut bridge = Bridge::new(config).expect("bridge");
    handlers::register_all(&mut bridge);
    (dir, bridge, peer)
}

// Cold start: the peer initialises the rings, then a PING round-trips
#[test]
fn cold_start_ping() {
    let (_dir, mut bridge, peer) = setup(None);

    peer.send(CMD_PING, 0);
    assert!(bridge.run_once(), "one command should be processed");

    let (rsp_head, _) = peer.rsp.cursors();
    assert_eq!(rsp_head, 1, "response head advances to 1");

    let rsp = peer.recv();
    assert_eq!(rsp.status, RSP_OK);
    assert_eq!(rsp.orig_cmd, CMD_PING);
    assert_eq!(rsp.result, 0);
    assert!(rsp.timestamp > 0);

    // Host rang the response doorbell.
    assert_eq!(bridge.doorbell().rsp_writes(), 1);

    let stats = bridge.stats();
    assert_eq!(stats.commands_received, 1);
    assert_eq!(stats.responses_sent, 1);
    assert_eq!(stats.errors, 0);
}

#[test]
fn idle_poll_processes_nothing() {
    let (_dir, mut bridge, peer) = setup(None);
    assert!(!bridge.run_once());
    assert!(peer.rsp.consume().is_none());
}

#[test]
fn unknown_command_answers_error() {
    let (_dir, mut bridge, peer) = setup(None);

    peer.send(0x0999, 0);
    assert!(bridge.run_once());

    let rsp = peer.recv();
    assert_eq!(rsp.status, RSP_ERROR);
    assert_eq!(rsp.orig_cmd, 0x0999);
    assert_eq!(rsp.result, 0);
    assert_eq!(bridge.stats().errors, 1);
}

#[test]
fn print_surfaces_blob_text() {
    let (_dir, mut bridge, peer) = setup(None);

    let mut heap = peer.heap();
    let blob = heap.allocate_blob(32, BLOB_TYPE_RAW).expect("alloc");
    heap.write_blob_data(blob, b"hello bridge\0junk").expect("write");

    peer.send(CMD_PRINT, blob as u32);
    assert!(bridge.run_once());
    assert_eq!(peer.recv().status, RSP_OK);

    // Missing blob answers ERROR.
    peer.send(CMD_PRINT, 4242);
    assert!(bridge.run_once());
    assert_eq!(peer.recv().status, RSP_ERROR);
}

#[test]
fn tensor_alloc_free_and_stats() {
    let (_dir, mut bridge, peer) = setup(None);

    peer.send(CMD_TENSOR_ALLOC, 130);
    assert!(bridge.run_once());
    let rsp = peer.recv();
    assert_eq!(rsp.status, RSP_OK);
    let blob_id = rsp.result;
    assert_ne!(blob_id, 0);

    peer.send(CMD_HEAP_STATS, 0);
    assert!(bridge.run_once());
    let stats_rsp = peer.recv();
    assert_eq!(stats_rsp.status, RSP_OK);
    let free_before = stats_rsp.result;

    peer.send(CMD_TENSOR_FREE, blob_id);
    assert!(bridge.run_once());
    assert_eq!(peer.recv().status, RSP_OK);

    peer.send(CMD_HEAP_STATS, 0);
    assert!(bridge.run_once());
    assert_eq!(peer.recv().result, free_before + 3);

    // Double free answers ERROR.
    peer.send(CMD_TENSOR_FREE, blob_id);
    assert!(bridge.run_once());
    assert_eq!(peer.recv().status, RSP_ERROR);
}

#[test]
fn run_model_produces_result_blob() {
    let (_dir, mut bridge, peer) = setup(None);

    // (1, 784) input selects the built-in linear model.
    let input = Tensor::from_f32(&[1, 784], &vec![0.01f32; 784]).expect("tensor");
    let mut heap = peer.heap();
    let input_id = heap.allocate_tensor(&input).expect("alloc input");

    peer.send(CMD_RUN_MODEL, input_id as u32);
    assert!(bridge.run_once());
    let rsp = peer.recv();
    assert_eq!(rsp.status, RSP_OK);
    assert_ne!(rsp.result, 0);
    assert_ne!(rsp.result, input_id as u32);

    let view_dims = {
        let mut peer_heap = peer.heap();
        let view = peer_heap.read_tensor(rsp.result as u16).expect("result tensor");
        view.dims().to_vec()
    };
    assert_eq!(view_dims, vec![1, 10]);
}

#[test]
fn run_model_rejects_missing_input() {
    let (_dir, mut bridge, peer) = setup(None);

    peer.send(CMD_RUN_MODEL, 0);
    assert!(bridge.run_once());
    assert_eq!(peer.recv().status, RSP_ERROR);

    peer.send(CMD_RUN_MODEL, 999);
    assert!(bridge.run_once());
    assert_eq!(peer.recv().status, RSP_ERROR);
}

#[test]
fn telemetry_poll_returns_snapshot_blob() {
    let (_dir, mut bridge, peer) = setup(None);

    peer.send(CMD_TELEMETRY_POLL, 0);
    assert!(bridge.run_once());
    let rsp = peer.recv();
    assert_eq!(rsp.status, RSP_OK);

    let mut heap = peer.heap();
    let data = heap.read_blob_data(rsp.result as u16).expect("snapshot");
    assert!(data.len() >= 20);

    let ts = u64::from_le_bytes(data[0..8].try_into().expect("ts"));
    assert!(ts > 0);
    for chunk in [&data[8..12], &data[12..16], &data[16..20]] {
        let v = f32::from_le_bytes(chunk.try_into().expect("f32"));
        assert!(v.is_finite());
    }
}

#[test]
fn ifr_persist_writes_pair() {
    let out = tempfile::tempdir().expect("ifr dir");
    let (_dir, mut bridge, peer) = setup(Some(out.path()));

    let raw = zenedge_bridge::ifr::build_v2(7, 9, 1, &[0.5, 0.6]);
    let mut heap = peer.heap();
    let blob = heap.allocate_blob(raw.len(), BLOB_TYPE_RAW).expect("alloc");
    heap.write_blob_data(blob, &raw).expect("write");

    peer.send(CMD_IFR_PERSIST, blob as u32);
    assert!(bridge.run_once());
    assert_eq!(peer.recv().status, RSP_OK);

    let entries: Vec<_> = std::fs::read_dir(out.path())
        .expect("read dir")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert!(entries.iter().any(|n| n.starts_with("ifr-7-9-") && n.ends_with(".bin")));
    assert!(entries.iter().any(|n| n.starts_with("ifr-7-9-") && n.ends_with(".json")));
}

#[test]
fn ifr_persist_tampered_record_errors_but_persists() {
    let out = tempfile::tempdir().expect("ifr dir");
    let (_dir, mut bridge, peer) = setup(Some(out.path()));

    let mut raw = zenedge_bridge::ifr::build_v2(8, 1, 1, &[0.5]);
    raw[60] ^= 0xFF;
    let mut heap = peer.heap();
    let blob = heap.allocate_blob(raw.len(), BLOB_TYPE_RAW).expect("alloc");
    heap.write_blob_data(blob, &raw).expect("write");

    peer.send(CMD_IFR_PERSIST, blob as u32);
    assert!(bridge.run_once());
    assert_eq!(peer.recv().status, RSP_ERROR);
    assert_eq!(std::fs::read_dir(out.path()).expect("dir").count(), 2);
}

#[test]
fn ifr_persist_garbage_errors_without_files() {
    let out = tempfile::tempdir().expect("ifr dir");
    let (_dir, mut bridge, peer) = setup(Some(out.path()));

    let mut heap = peer.heap();
    let blob = heap.allocate_blob(64, BLOB_TYPE_RAW).expect("alloc");
    heap.write_blob_data(blob, &[0xABu8; 64]).expect("write");

    peer.send(CMD_IFR_PERSIST, blob as u32);
    assert!(bridge.run_once());
    assert_eq!(peer.recv().status, RSP_ERROR);
    assert_eq!(std::fs::read_dir(out.path()).expect("dir").count(), 0);
}

#[test]
fn env_reset_and_step_through_pool() {
    let (_dir, mut bridge, peer) = setup(None);

    peer.send(CMD_ENV_RESET, 0);
    assert!(bridge.run_once());
    let reset_rsp = peer.recv();
    assert_eq!(reset_rsp.status, RSP_OK);
    let obs_blob = reset_rsp.result as u16;
    assert_ne!(obs_blob, 0);

    // The pooled blob holds obs[4], reward, done, model id (7 floats).
    let mut heap = peer.heap();
    let data = heap.read_blob_data(obs_blob).expect("obs blob");
    assert!(data.len() >= 28);
    let done = f32::from_le_bytes(data[20..24].try_into().expect("done"));
    assert_eq!(done, 0.0);
    let model_id = f32::from_le_bytes(data[24..28].try_into().expect("model"));
    assert!(model_id >= 1.0, "policy blob uploaded on first reset");

    // Step with the reset blob acked back to the pool.
    peer.send(CMD_ENV_STEP, pack_step_payload(1, obs_blob));
    assert!(bridge.run_once());
    let step_rsp = peer.recv();
    assert_eq!(step_rsp.status, RSP_OK);
    let step_blob = step_rsp.result as u16;
    assert_ne!(step_blob, 0);

    let data = heap.read_blob_data(step_blob).expect("step blob");
    let reward = f32::from_le_bytes(data[16..20].try_into().expect("reward"));
    assert_eq!(reward, 1.0);
}

#[test]
fn obs_pool_survives_many_steps_without_acks() {
    let (_dir, mut bridge, peer) = setup(None);

    peer.send(CMD_ENV_RESET, 0);
    assert!(bridge.run_once());
    assert_eq!(peer.recv().status, RSP_OK);

    // Never ack: the pool must recycle round-robin instead of draining.
    for _ in 0..50 {
        peer.send(CMD_ENV_STEP, pack_step_payload(0, 0));
        assert!(bridge.run_once());
        let rsp = peer.recv();
        assert_eq!(rsp.status, RSP_OK);
        assert_ne!(rsp.result, 0);
    }
}
