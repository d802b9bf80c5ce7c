// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 zenedge contributors
//
// Stub kernel peer for manual end-to-end testing.
//
// Usage:
//   demo_peer init <shm-path>          initialise rings, doorbell and heap
//   demo_peer ping <shm-path>          send PING, wait for the response
//   demo_peer print <shm-path> <text>  store <text> in a blob, send PRINT
//
// Run `zenedge_bridge --shm <shm-path> --create` in another terminal; this
// binary plays the kernel side of the protocol.

use std::sync::Arc;
use std::time::{Duration, Instant};

use zenedge_bridge::heap::HeapManager;
use zenedge_bridge::proto::{
    timestamp_usec, Packet, Response, BLOB_TYPE_RAW, CMD_PING, CMD_PRINT, IPC_CMD_RING_OFFSET,
    IPC_MAGIC, IPC_RING_SIZE, IPC_RING_WINDOW, IPC_RSP_MAGIC, IPC_RSP_RING_OFFSET,
};
use zenedge_bridge::ring::SpscRing;
use zenedge_bridge::shm::SharedMem;
use zenedge_bridge::stream::StreamRings;
use zenedge_bridge::Doorbell;

struct Peer {
    shm: Arc<SharedMem>,
    cmd_ring: SpscRing<Packet>,
    rsp_ring: SpscRing<Response>,
}

impl Peer {
    fn open(path: &str) -> Peer {
        let shm = Arc::new(
            SharedMem::open(std::path::Path::new(path), true).expect("map shared memory"),
        );
        Peer {
            cmd_ring: SpscRing::new(
                Arc::clone(&shm),
                IPC_CMD_RING_OFFSET,
                IPC_RING_WINDOW,
                IPC_MAGIC,
                "command",
            ),
            rsp_ring: SpscRing::new(
                Arc::clone(&shm),
                IPC_RSP_RING_OFFSET,
                IPC_RING_WINDOW,
                IPC_RSP_MAGIC,
                "response",
            ),
            shm,
        }
    }

    /// Initialise everything the kernel would set up on boot.
    fn init(&self) {
        self.cmd_ring.init_header(IPC_RING_SIZE);
        self.rsp_ring.init_header(IPC_RING_SIZE);
        Doorbell::new(Arc::clone(&self.shm)).init();
        HeapManager::new(Arc::clone(&self.shm)).init_control();
        StreamRings::new(Arc::clone(&self.shm)).init();
        println!("peer: initialised rings, doorbell, heap and streams");
    }

    fn send(&self, cmd: u16, payload_id: u32) {
        let packet = Packet {
            cmd,
            flags: 0,
            payload_id,
            timestamp: timestamp_usec(),
        };
        self.cmd_ring.produce(&packet).expect("command ring produce");
        println!("peer: sent cmd {cmd:#06x} payload {payload_id}");
    }

    fn await_response(&self, timeout: Duration) -> Option<Response> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(rsp) = self.rsp_ring.consume() {
                return Some(rsp);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        None
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("usage: demo_peer init <shm-path>");
        eprintln!("       demo_peer ping <shm-path>");
        eprintln!("       demo_peer print <shm-path> <text>");
        std::process::exit(1);
    }

    let peer = Peer::open(&args[2]);

    match args[1].as_str() {
        "init" => peer.init(),
        "ping" => {
            peer.send(CMD_PING, 0);
            match peer.await_response(Duration::from_secs(2)) {
                Some(rsp) => println!(
                    "peer: response status={:#06x} orig={:#06x} result={}",
                    rsp.status, rsp.orig_cmd, rsp.result
                ),
                None => {
                    eprintln!("peer: no response (is the bridge running?)");
                    std::process::exit(1);
                }
            }
        }
        "print" => {
            let text = args.get(3).map(String::as_str).unwrap_or("hello from peer");
            let mut heap = HeapManager::new(Arc::clone(&peer.shm));
            let mut bytes = text.as_bytes().to_vec();
            bytes.push(0);
            let blob_id = heap
                .allocate_blob(bytes.len(), BLOB_TYPE_RAW)
                .expect("allocate print blob");
            heap.write_blob_data(blob_id, &bytes).expect("write print blob");
            peer.send(CMD_PRINT, blob_id as u32);
            match peer.await_response(Duration::from_secs(2)) {
                Some(rsp) => println!("peer: response status={:#06x}", rsp.status),
                None => eprintln!("peer: no response"),
            }
            let _ = heap.free_blob(blob_id);
        }
        other => {
            eprintln!("unknown subcommand '{other}'");
            std::process::exit(1);
        }
    }
}
