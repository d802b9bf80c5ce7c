// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 zenedge contributors
//
// ZENEDGE IPC protocol definitions.
//
// Constants and record layouts mirroring the C definitions in
// kernel/ipc/ipc_proto.h. All values must match the kernel side exactly;
// everything on the wire is little-endian.

// ---------------------------------------------------------------------------
// Shared region layout (1 MiB, byte offsets)
// ---------------------------------------------------------------------------

/// Total size of the shared memory region.
pub const IPC_SHARED_MEM_SIZE: usize = 0x100000;

pub const IPC_CMD_RING_OFFSET: usize = 0x00000;
pub const IPC_RSP_RING_OFFSET: usize = 0x08000;
pub const IPC_DOORBELL_OFFSET: usize = 0x10000;
pub const IPC_HEAP_CTL_OFFSET: usize = 0x10100;
pub const IPC_HEAP_DATA_OFFSET: usize = 0x11000;
pub const IPC_OBS_RING_OFFSET: usize = 0xFE000;
pub const IPC_ACT_RING_OFFSET: usize = 0xFF000;

/// Bytes available to each of the command and response ring windows.
pub const IPC_RING_WINDOW: usize = 0x8000;
/// Bytes available to each streaming ring window.
pub const IPC_STREAM_WINDOW: usize = 0x1000;

/// Size of the heap data region.
pub const IPC_HEAP_DATA_SIZE: usize = 0xED000;

/// Default slot count the kernel initialises the command/response rings with.
/// The implementation always trusts the header-declared value instead.
pub const IPC_RING_SIZE: u32 = 1024;
/// Slot count of the obs/act streaming rings.
pub const IPC_STREAM_RING_SIZE: u32 = 64;

// ---------------------------------------------------------------------------
// Magic numbers
// ---------------------------------------------------------------------------

pub const IPC_MAGIC: u32 = 0x51DE_CA9E;
pub const IPC_RSP_MAGIC: u32 = 0x5253_5030;
pub const DOORBELL_MAGIC: u32 = 0x444F_4F52;
pub const IPC_HEAP_MAGIC: u32 = 0x4845_4150;
pub const BLOB_MAGIC: u32 = 0x424C_4F42;
pub const IPC_STREAM_MAGIC: u32 = 0x5354_524D;
pub const IFR_MAGIC: u32 = 0x3046_5249;

// ---------------------------------------------------------------------------
// Command and status ids
// ---------------------------------------------------------------------------

pub const CMD_PING: u16 = 0x0001;
pub const CMD_PRINT: u16 = 0x0002;
pub const CMD_RUN_MODEL: u16 = 0x0010;
pub const CMD_TENSOR_ALLOC: u16 = 0x0020;
pub const CMD_TENSOR_FREE: u16 = 0x0021;
pub const CMD_HEAP_STATS: u16 = 0x0022;
pub const CMD_MODEL_LOAD: u16 = 0x0030;
pub const CMD_ENV_RESET: u16 = 0x0040;
pub const CMD_ENV_STEP: u16 = 0x0041;
pub const CMD_IFR_PERSIST: u16 = 0x0050;
pub const CMD_TELEMETRY_POLL: u16 = 0x0051;
pub const CMD_ARB_EPISODE: u16 = 0x0052;

pub const RSP_OK: u16 = 0x8000;
pub const RSP_ERROR: u16 = 0x8001;
pub const RSP_BUSY: u16 = 0x8002;

/// Human-readable command name for log lines.
pub fn cmd_name(cmd: u16) -> &'static str {
    match cmd {
        CMD_PING => "PING",
        CMD_PRINT => "PRINT",
        CMD_RUN_MODEL => "RUN_MODEL",
        CMD_TENSOR_ALLOC => "TENSOR_ALLOC",
        CMD_TENSOR_FREE => "TENSOR_FREE",
        CMD_HEAP_STATS => "HEAP_STATS",
        CMD_MODEL_LOAD => "MODEL_LOAD",
        CMD_ENV_RESET => "ENV_RESET",
        CMD_ENV_STEP => "ENV_STEP",
        CMD_IFR_PERSIST => "IFR_PERSIST",
        CMD_TELEMETRY_POLL => "TELEMETRY_POLL",
        CMD_ARB_EPISODE => "ARB_EPISODE",
        _ => "UNKNOWN",
    }
}

// ---------------------------------------------------------------------------
// Ring header (32 bytes at the start of every ring window)
// ---------------------------------------------------------------------------

pub const RING_HEADER_SIZE: usize = 32;

/// Byte offsets of the ring header fields.
pub const RING_MAGIC_OFFSET: usize = 0;
pub const RING_HEAD_OFFSET: usize = 4;
pub const RING_TAIL_OFFSET: usize = 8;
pub const RING_SIZE_OFFSET: usize = 12;

// ---------------------------------------------------------------------------
// Command / response packets (16 bytes each)
// ---------------------------------------------------------------------------

/// Command packet produced by the kernel, consumed by the host.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Packet {
    pub cmd: u16,
    pub flags: u16,
    pub payload_id: u32,
    pub timestamp: u64,
}

/// Response packet produced by the host, consumed by the kernel.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Response {
    pub status: u16,
    pub orig_cmd: u16,
    pub result: u32,
    pub timestamp: u64,
}

pub const PACKET_SIZE: usize = 16;
pub const RESPONSE_SIZE: usize = 16;

const _: () = assert!(std::mem::size_of::<Packet>() == PACKET_SIZE);
const _: () = assert!(std::mem::size_of::<Response>() == RESPONSE_SIZE);

// ---------------------------------------------------------------------------
// Streaming ring entries
// ---------------------------------------------------------------------------

/// Observation entry (host → kernel), 32 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ObsEntry {
    pub seq: u32,
    pub obs: [f32; 4],
    pub reward: f32,
    pub done: f32,
    pub model_id: f32,
}

/// Action entry (kernel → host), 16 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActEntry {
    pub seq: u32,
    pub action: u16,
    pub flags: u16,
    pub ack_seq: u32,
    pub reserved: u32,
}

const _: () = assert!(std::mem::size_of::<ObsEntry>() == 32);
const _: () = assert!(std::mem::size_of::<ActEntry>() == 16);

// ---------------------------------------------------------------------------
// Doorbell block (256 bytes)
// ---------------------------------------------------------------------------

pub const DOORBELL_SIZE: usize = 256;

pub const DB_MAGIC_OFFSET: usize = 0;
pub const DB_VERSION_OFFSET: usize = 4;
pub const DB_CMD_DOORBELL_OFFSET: usize = 8;
pub const DB_CMD_FLAGS_OFFSET: usize = 12;
pub const DB_CMD_IRQ_COUNT_OFFSET: usize = 16;
pub const DB_RSP_DOORBELL_OFFSET: usize = 20;
pub const DB_RSP_FLAGS_OFFSET: usize = 24;
pub const DB_RSP_IRQ_COUNT_OFFSET: usize = 28;
pub const DB_CMD_WRITES_OFFSET: usize = 32;
pub const DB_RSP_WRITES_OFFSET: usize = 36;

// ---------------------------------------------------------------------------
// Heap control and blob headers
// ---------------------------------------------------------------------------

pub const HEAP_BLOCK_SIZE: usize = 64;
pub const HEAP_MAX_BLOCKS: usize = IPC_HEAP_DATA_SIZE / HEAP_BLOCK_SIZE;
pub const HEAP_BITMAP_SIZE: usize = HEAP_MAX_BLOCKS.div_ceil(8);
pub const HEAP_CTL_HEADER_SIZE: usize = 32;
pub const HEAP_VERSION: u32 = 1;

// Control header: magic, version, total_blocks, free_blocks, next_blob_id,
// reserved[3]. The bitmap follows immediately after.
pub const HEAP_CTL_MAGIC_OFFSET: usize = 0;
pub const HEAP_CTL_VERSION_OFFSET: usize = 4;
pub const HEAP_CTL_TOTAL_OFFSET: usize = 8;
pub const HEAP_CTL_FREE_OFFSET: usize = 12;
pub const HEAP_CTL_NEXT_ID_OFFSET: usize = 16;

pub const BLOB_HEADER_SIZE: usize = 32;

pub const BLOB_TYPE_RAW: u8 = 0x01;
pub const BLOB_TYPE_TENSOR: u8 = 0x02;
pub const BLOB_TYPE_MODEL_REF: u8 = 0x03;
pub const BLOB_TYPE_RESULT: u8 = 0x04;

/// Decoded blob header. `offset` is the blob's own location within the data
/// region, stored for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobHeader {
    pub magic: u32,
    pub blob_id: u16,
    pub blob_type: u8,
    pub flags: u8,
    pub size: u32,
    pub offset: u32,
    pub checksum: u32,
}

impl BlobHeader {
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < BLOB_HEADER_SIZE {
            return None;
        }
        Some(Self {
            magic: u32::from_le_bytes(buf[0..4].try_into().ok()?),
            blob_id: u16::from_le_bytes(buf[4..6].try_into().ok()?),
            blob_type: buf[6],
            flags: buf[7],
            size: u32::from_le_bytes(buf[8..12].try_into().ok()?),
            offset: u32::from_le_bytes(buf[12..16].try_into().ok()?),
            checksum: u32::from_le_bytes(buf[16..20].try_into().ok()?),
        })
    }

    pub fn encode(&self) -> [u8; BLOB_HEADER_SIZE] {
        let mut buf = [0u8; BLOB_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..6].copy_from_slice(&self.blob_id.to_le_bytes());
        buf[6] = self.blob_type;
        buf[7] = self.flags;
        buf[8..12].copy_from_slice(&self.size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.offset.to_le_bytes());
        buf[16..20].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Blocks occupied by this blob, header included.
    pub fn blocks_used(&self) -> usize {
        (BLOB_HEADER_SIZE + self.size as usize).div_ceil(HEAP_BLOCK_SIZE)
    }
}

/// Blocks needed for a blob with `payload_size` bytes of data.
pub fn blocks_for(payload_size: usize) -> usize {
    (BLOB_HEADER_SIZE + payload_size).div_ceil(HEAP_BLOCK_SIZE)
}

/// Additive checksum over blob payload bytes, modulo 2^32.
pub fn compute_checksum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
}

// ---------------------------------------------------------------------------
// ENV_STEP payload packing
// ---------------------------------------------------------------------------

/// Pack an env-step payload: ack blob id in the high half, action in the low.
pub fn pack_step_payload(action: u16, ack_blob_id: u16) -> u32 {
    ((ack_blob_id as u32) << 16) | action as u32
}

/// Unpack an env-step payload into `(action, ack_blob_id)`.
pub fn unpack_step_payload(payload: u32) -> (u16, u16) {
    ((payload & 0xFFFF) as u16, (payload >> 16) as u16)
}

/// Microseconds since the Unix epoch.
pub fn timestamp_usec() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn blob_header_round_trip() {
        let hdr = BlobHeader {
            magic: BLOB_MAGIC,
            blob_id: 7,
            blob_type: BLOB_TYPE_TENSOR,
            flags: 0,
            size: 130,
            offset: 0x40,
            checksum: 0xDEAD_BEEF,
        };
        let decoded = BlobHeader::decode(&hdr.encode()).unwrap();
        assert_eq!(decoded, hdr);
    }

    #[test]
    fn blocks_for_includes_header() {
        assert_eq!(blocks_for(0), 1);
        assert_eq!(blocks_for(32), 1);
        assert_eq!(blocks_for(33), 2);
        // a 130-byte payload needs 3 blocks, header included
        assert_eq!(blocks_for(130), 3);
    }

    #[test]
    fn checksum_wraps() {
        assert_eq!(compute_checksum(&[]), 0);
        assert_eq!(compute_checksum(&[1, 2, 3]), 6);
        assert_eq!(compute_checksum(&[0xFF; 4]), 0x3FC);
    }

    proptest! {
        // P7: step payload pack/unpack round-trips both halves.
        #[test]
        fn step_payload_round_trip(action in any::<u16>(), ack in any::<u16>()) {
            let packed = pack_step_payload(action, ack);
            prop_assert_eq!(unpack_step_payload(packed), (action, ack));
        }
    }
}
