// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 zenedge contributors
//
// Arbitration tests: ARB_EPISODE against a local single-thread HTTP stub,
// driving the promote/reject model lifecycle end to end.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use zenedge_bridge::arbiter::{query_next_profile, LifecycleState};
use zenedge_bridge::bridge::{Bridge, BridgeConfig};
use zenedge_bridge::handlers;
use zenedge_bridge::heap::HeapManager;
use zenedge_bridge::ifr::{build_v2, parse_ifr};
use zenedge_bridge::proto::{
    Packet, Response, BLOB_TYPE_RAW, CMD_ARB_EPISODE, IPC_CMD_RING_OFFSET, IPC_MAGIC,
    IPC_RING_SIZE, IPC_RING_WINDOW, IPC_RSP_MAGIC, IPC_RSP_RING_OFFSET, RSP_OK,
};
use zenedge_bridge::ring::SpscRing;
use zenedge_bridge::shm::SharedMem;
use zenedge_bridge::stream::StreamRings;
use zenedge_bridge::Doorbell;

// ---------------------------------------------------------------------------
// Minimal HTTP stub: one canned JSON body per expected request.
// ---------------------------------------------------------------------------

fn spawn_arbiter(bodies: Vec<&'static str>) -> (String, std::thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let handle = std::thread::spawn(move || {
        for body in bodies {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            read_full_request(&mut stream);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes());
        }
    });
    (format!("http://{addr}"), handle)
}

fn read_full_request(stream: &mut TcpStream) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];

    let header_end = loop {
        match stream.read(&mut tmp) {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                buf.extend_from_slice(&tmp[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            }
        }
    };

    let headers = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
    let content_length = headers
        .lines()
        .find_map(|l| l.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        match stream.read(&mut tmp) {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
        }
    }
}

// ---------------------------------------------------------------------------
// Bridge + peer plumbing
// ---------------------------------------------------------------------------

struct Peer {
    shm: Arc<SharedMem>,
    cmd: SpscRing<Packet>,
    rsp: SpscRing<Response>,
}

fn setup(arbiter_url: Option<String>) -> (tempfile::TempDir, Bridge, Peer) {
    let dir = tempfile::tempdir().expect("tempdir");
    let shm_path = dir.path().join("zenedge.shm");

    let shm = Arc::new(SharedMem::open(&shm_path, true).expect("peer map"));
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
    cmd.init_header(IPC_RING_SIZE);
    rsp.init_header(IPC_RING_SIZE);
    Doorbell::new(Arc::clone(&shm)).init();
    HeapManager::new(Arc::clone(&shm)).init_control();
    StreamRings::new(Arc::clone(&shm)).init();

    let config = BridgeConfig {
        shm_path,
        model_dir: dir.path().join("models"),
        create: false,
        poll_interval: Duration::from_millis(1),
        env_name: "CartPole-v1".to_owned(),
        ifr_dir: dir.path().join("ifr"),
        arbiter_url,
    };
    let mut bridge = Bridge::new(config).expect("bridge");
    handlers::register_all(&mut bridge);
    (dir, bridge, Peer { shm, cmd, rsp })
}

fn arbitrate_episode(bridge: &mut Bridge, peer: &Peer, episode: u32) -> Response {
    let raw = build_v2(1, episode, 1, &[0.1, 0.2]);
    let mut heap = HeapManager::new(Arc::clone(&peer.shm));
    let blob = heap.allocate_blob(raw.len(), BLOB_TYPE_RAW).expect("alloc ifr");
    heap.write_blob_data(blob, &raw).expect("write ifr");

    peer.cmd
        .produce(&Packet {
            cmd: CMD_ARB_EPISODE,
            flags: 0,
            payload_id: blob as u32,
            timestamp: 1,
        })
        .expect("produce");
    assert!(bridge.run_once());
    peer.rsp.consume().expect("response")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

// Promote adopts the candidate as baseline; reject rolls back to it.
#[test]
fn promote_then_reject_round_trip() {
    let (url, server) = spawn_arbiter(vec![
        r#"{"decision_code":0,"recommended_model_id":5}"#,
        r#"{"decision_code":1}"#,
        r#"{"decision_code":0,"recommended_model_id":9}"#,
        r#"{"decision_code":2}"#,
    ]);
    let (_dir, mut bridge, peer) = setup(Some(url));

    // keep + recommendation: model 5 becomes the candidate
    let rsp = arbitrate_episode(&mut bridge, &peer, 1);
    assert_eq!(rsp.status, RSP_OK);
    assert_eq!(rsp.result, 5);
    assert_eq!(bridge.session().lifecycle.state, LifecycleState::Candidate);
    assert_eq!(bridge.session().lifecycle.baseline_model_id, 0);

    // promote: candidate becomes the baseline
    let rsp = arbitrate_episode(&mut bridge, &peer, 2);
    assert_eq!(rsp.result, (1 << 16) | 5);
    assert_eq!(bridge.session().lifecycle.state, LifecycleState::Baseline);
    assert_eq!(bridge.session().lifecycle.baseline_model_id, 5);
    assert_eq!(bridge.session().lifecycle.current_model_id, 5);

    // a newer candidate appears
    let rsp = arbitrate_episode(&mut bridge, &peer, 3);
    assert_eq!(rsp.result, 9);
    assert_eq!(bridge.session().lifecycle.current_model_id, 9);

    // reject: rollback to the promoted baseline
    let rsp = arbitrate_episode(&mut bridge, &peer, 4);
    assert_eq!(rsp.result, (2 << 16) | 5);
    assert_eq!(bridge.session().lifecycle.current_model_id, 5);
    assert_eq!(bridge.session().lifecycle.state, LifecycleState::Baseline);

    server.join().expect("server thread");
}

#[test]
fn safe_mode_rolls_back() {
    let (url, server) = spawn_arbiter(vec![
        r#"{"decision_code":0,"recommended_model_id":7}"#,
        r#"{"decision_code":3}"#,
    ]);
    let (_dir, mut bridge, peer) = setup(Some(url));

    arbitrate_episode(&mut bridge, &peer, 1);
    assert_eq!(bridge.session().lifecycle.current_model_id, 7);

    let rsp = arbitrate_episode(&mut bridge, &peer, 2);
    assert_eq!(rsp.result >> 16, 3);
    assert_eq!(bridge.session().lifecycle.current_model_id, 0);

    server.join().expect("server thread");
}

#[test]
fn no_arbiter_keeps_current_model() {
    let (_dir, mut bridge, peer) = setup(None);

    let rsp = arbitrate_episode(&mut bridge, &peer, 1);
    assert_eq!(rsp.status, RSP_OK);
    assert_eq!(rsp.result, 0, "keep decision, model id 0");
    assert_eq!(bridge.session().lifecycle.state, LifecycleState::Baseline);
}

#[test]
fn unreachable_arbiter_degrades_to_keep() {
    // Nothing listens on this port; the 2 s timeout path answers keep.
    let (_dir, mut bridge, peer) = setup(Some("http://127.0.0.1:9".to_owned()));

    let rsp = arbitrate_episode(&mut bridge, &peer, 1);
    assert_eq!(rsp.status, RSP_OK);
    assert_eq!(rsp.result, 0);
}

#[test]
fn profile_env_fallback_parses() {
    std::env::set_var("ZENEDGE_ARB_PROFILE", "0.25, 0.5,0.75");
    let raw = build_v2(1, 1, 1, &[]);
    let rec = parse_ifr(&raw).expect("parse");
    let answer = query_next_profile(None, &raw, &rec);
    std::env::remove_var("ZENEDGE_ARB_PROFILE");

    assert_eq!(answer.profile, Some(vec![0.25, 0.5, 0.75]));
    assert_eq!(answer.decision, None);
}
