// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 zenedge contributors
//
// Shared heap manager: bitmap allocator over the 64-byte-block data region,
// plus blob and tensor read/write addressed by 16-bit blob ids.
//
// The control block holds magic, counters and the bitmap (1 bit per block,
// LSB-first within each byte). Either peer may allocate; the id -> offset
// cache is best-effort and a miss falls back to a block-stepping scan of the
// data region, which tolerates arbitrary allocation order.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{BridgeError, Result};
use crate::proto::{
    blocks_for, compute_checksum, BlobHeader, BLOB_HEADER_SIZE, BLOB_MAGIC, BLOB_TYPE_TENSOR,
    HEAP_BITMAP_SIZE, HEAP_BLOCK_SIZE, HEAP_CTL_FREE_OFFSET, HEAP_CTL_HEADER_SIZE,
    HEAP_CTL_MAGIC_OFFSET, HEAP_CTL_NEXT_ID_OFFSET, HEAP_CTL_TOTAL_OFFSET,
    HEAP_CTL_VERSION_OFFSET, HEAP_MAX_BLOCKS, HEAP_VERSION, IPC_HEAP_CTL_OFFSET,
    IPC_HEAP_DATA_OFFSET, IPC_HEAP_DATA_SIZE, IPC_HEAP_MAGIC,
};
use crate::shm::SharedMem;
use crate::tensor::{Tensor, TensorHeader, TensorView, TENSOR_HEADER_SIZE};

#[derive(Debug, Clone, Copy)]
struct HeapControl {
    magic: u32,
    total_blocks: u32,
    free_blocks: u32,
    next_blob_id: u32,
}

/// Heap statistics, read fresh from the control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub magic_valid: bool,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub used_blocks: u32,
    pub next_blob_id: u32,
    pub total_bytes: u64,
    pub free_bytes: u64,
}

pub struct HeapManager {
    shm: Arc<SharedMem>,
    // blob_id -> offset within the data region
    cache: HashMap<u16, u32>,
}

impl HeapManager {
    pub fn new(shm: Arc<SharedMem>) -> Self {
        Self {
            shm,
            cache: HashMap::new(),
        }
    }

    // --- control block ---

    fn read_control(&self) -> HeapControl {
        HeapControl {
            magic: self.shm.read_u32(IPC_HEAP_CTL_OFFSET + HEAP_CTL_MAGIC_OFFSET),
            total_blocks: self.shm.read_u32(IPC_HEAP_CTL_OFFSET + HEAP_CTL_TOTAL_OFFSET),
            free_blocks: self.shm.read_u32(IPC_HEAP_CTL_OFFSET + HEAP_CTL_FREE_OFFSET),
            next_blob_id: self.shm.read_u32(IPC_HEAP_CTL_OFFSET + HEAP_CTL_NEXT_ID_OFFSET),
        }
    }

    fn update_control(&self, free_blocks: u32, next_blob_id: u32) {
        self.shm
            .write_u32(IPC_HEAP_CTL_OFFSET + HEAP_CTL_FREE_OFFSET, free_blocks);
        self.shm
            .write_u32(IPC_HEAP_CTL_OFFSET + HEAP_CTL_NEXT_ID_OFFSET, next_blob_id);
    }

    fn checked_control(&self) -> Result<HeapControl> {
        let ctl = self.read_control();
        if ctl.magic != IPC_HEAP_MAGIC {
            return Err(BridgeError::HeapUninit { found: ctl.magic });
        }
        Ok(ctl)
    }

    /// Initialise the control block over an all-free data region. Host-side
    /// setup path (--create, demo peer, tests); the kernel normally does
    /// this before the bridge attaches.
    pub fn init_control(&mut self) {
        self.shm
            .zero_bytes(IPC_HEAP_CTL_OFFSET, HEAP_CTL_HEADER_SIZE + HEAP_BITMAP_SIZE);
        self.shm
            .write_u32(IPC_HEAP_CTL_OFFSET + HEAP_CTL_VERSION_OFFSET, HEAP_VERSION);
        self.shm.write_u32(
            IPC_HEAP_CTL_OFFSET + HEAP_CTL_TOTAL_OFFSET,
            HEAP_MAX_BLOCKS as u32,
        );
        self.shm.write_u32(
            IPC_HEAP_CTL_OFFSET + HEAP_CTL_FREE_OFFSET,
            HEAP_MAX_BLOCKS as u32,
        );
        self.shm
            .write_u32(IPC_HEAP_CTL_OFFSET + HEAP_CTL_NEXT_ID_OFFSET, 1);
        self.shm
            .write_u32(IPC_HEAP_CTL_OFFSET + HEAP_CTL_MAGIC_OFFSET, IPC_HEAP_MAGIC);
        self.cache.clear();
    }

    pub fn is_ready(&self) -> bool {
        self.read_control().magic == IPC_HEAP_MAGIC
    }

    // --- bitmap ---

    fn bitmap_offset() -> usize {
        IPC_HEAP_CTL_OFFSET + HEAP_CTL_HEADER_SIZE
    }

    fn read_bitmap(&self) -> Vec<u8> {
        let mut bm = vec![0u8; HEAP_BITMAP_SIZE];
        self.shm.read_bytes(Self::bitmap_offset(), &mut bm);
        bm
    }

    fn write_bitmap(&self, bm: &[u8]) {
        self.shm.write_bytes(Self::bitmap_offset(), bm);
    }

    /// First-fit scan for `count` contiguous free blocks. LSB-first bits.
    fn find_free_run(bitmap: &[u8], total_blocks: usize, count: usize) -> Option<usize> {
        let mut run_start = 0usize;
        let mut run_len = 0usize;
        for block in 0..total_blocks.min(bitmap.len() * 8) {
            let used = (bitmap[block / 8] >> (block % 8)) & 1 == 1;
            if used {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = block;
                }
                run_len += 1;
                if run_len >= count {
                    return Some(run_start);
                }
            }
        }
        None
    }

    fn set_blocks(bitmap: &mut [u8], start: usize, count: usize) {
        for block in start..start + count {
            bitmap[block / 8] |= 1 << (block % 8);
        }
    }

    fn clear_blocks(bitmap: &mut [u8], start: usize, count: usize) {
        for block in start..start + count {
            bitmap[block / 8] &= !(1 << (block % 8));
        }
    }

    // --- blob lookup ---

    fn data_abs(offset: u32) -> usize {
        IPC_HEAP_DATA_OFFSET + offset as usize
    }

    /// Find a blob's data-region offset by id: cache first, then a
    /// block-stepping scan that also repopulates the cache with every live
    /// blob it walks past.
    fn find_blob_offset(&mut self, blob_id: u16) -> Option<u32> {
        if let Some(&off) = self.cache.get(&blob_id) {
            // The peer may have freed and reused the slot; trust but verify.
            let mut hdr = [0u8; BLOB_HEADER_SIZE];
            self.shm.read_bytes(Self::data_abs(off), &mut hdr);
            if let Some(h) = BlobHeader::decode(&hdr) {
                if h.magic == BLOB_MAGIC && h.blob_id == blob_id {
                    return Some(off);
                }
            }
            self.cache.remove(&blob_id);
        }

        let mut offset = 0usize;
        let mut hdr_buf = [0u8; BLOB_HEADER_SIZE];
        while offset + BLOB_HEADER_SIZE <= IPC_HEAP_DATA_SIZE {
            self.shm.read_bytes(Self::data_abs(offset as u32), &mut hdr_buf);
            match BlobHeader::decode(&hdr_buf) {
                Some(h) if h.magic == BLOB_MAGIC => {
                    self.cache.insert(h.blob_id, offset as u32);
                    if h.blob_id == blob_id {
                        return Some(offset as u32);
                    }
                    offset += h.blocks_used() * HEAP_BLOCK_SIZE;
                }
                _ => offset += HEAP_BLOCK_SIZE,
            }
        }
        None
    }

    pub fn read_blob_header(&mut self, blob_id: u16) -> Result<BlobHeader> {
        let off = self
            .find_blob_offset(blob_id)
            .ok_or(BridgeError::NotFound(blob_id))?;
        let mut buf = [0u8; BLOB_HEADER_SIZE];
        self.shm.read_bytes(Self::data_abs(off), &mut buf);
        BlobHeader::decode(&buf).ok_or(BridgeError::NotFound(blob_id))
    }

    /// Read a blob's payload (excluding the header).
    pub fn read_blob_data(&mut self, blob_id: u16) -> Result<Vec<u8>> {
        let off = self
            .find_blob_offset(blob_id)
            .ok_or(BridgeError::NotFound(blob_id))?;
        let hdr = self.header_at(off)?;
        let mut data = vec![0u8; hdr.size as usize];
        self.shm
            .read_bytes(Self::data_abs(off) + BLOB_HEADER_SIZE, &mut data);
        Ok(data)
    }

    fn header_at(&self, off: u32) -> Result<BlobHeader> {
        let mut buf = [0u8; BLOB_HEADER_SIZE];
        self.shm.read_bytes(Self::data_abs(off), &mut buf);
        let hdr = BlobHeader::decode(&buf)
            .ok_or_else(|| BridgeError::Decode("blob header truncated".into()))?;
        if hdr.magic != BLOB_MAGIC {
            return Err(BridgeError::MagicMismatch {
                what: "blob",
                found: hdr.magic,
                expected: BLOB_MAGIC,
            });
        }
        // The peer writes headers too; a corrupt size must not walk the
        // accessors off the end of the region.
        if off as usize + BLOB_HEADER_SIZE + hdr.size as usize > IPC_HEAP_DATA_SIZE {
            return Err(BridgeError::Decode(format!(
                "blob {} declares {} bytes past the data region",
                hdr.blob_id, hdr.size
            )));
        }
        Ok(hdr)
    }

    /// Overwrite a blob's payload and refresh its checksum.
    pub fn write_blob_data(&mut self, blob_id: u16, data: &[u8]) -> Result<()> {
        let off = self
            .find_blob_offset(blob_id)
            .ok_or(BridgeError::NotFound(blob_id))?;
        let mut hdr = self.header_at(off)?;
        if data.len() > hdr.size as usize {
            return Err(BridgeError::SizeMismatch {
                len: data.len(),
                capacity: hdr.size as usize,
            });
        }
        self.shm
            .write_bytes(Self::data_abs(off) + BLOB_HEADER_SIZE, data);
        hdr.checksum = compute_checksum(data);
        self.shm.write_bytes(Self::data_abs(off), &hdr.encode());
        Ok(())
    }

    // --- tensors ---

    /// Zero-copy read of a TENSOR blob. The view aliases the mapping and
    /// must be dropped before the blob is freed.
    pub fn read_tensor(&mut self, blob_id: u16) -> Result<TensorView<'_>> {
        let off = self
            .find_blob_offset(blob_id)
            .ok_or(BridgeError::NotFound(blob_id))?;
        let hdr = self.header_at(off)?;
        if hdr.blob_type != BLOB_TYPE_TENSOR {
            return Err(BridgeError::Decode(format!(
                "blob {blob_id} is not a tensor (type {:#04x})",
                hdr.blob_type
            )));
        }
        let mut thdr_buf = [0u8; TENSOR_HEADER_SIZE];
        self.shm
            .read_bytes(Self::data_abs(off) + BLOB_HEADER_SIZE, &mut thdr_buf);
        let thdr = TensorHeader::decode(&thdr_buf)?;

        let data_size = thdr.data_size();
        if TENSOR_HEADER_SIZE + data_size > hdr.size as usize {
            return Err(BridgeError::SizeMismatch {
                len: TENSOR_HEADER_SIZE + data_size,
                capacity: hdr.size as usize,
            });
        }
        let data = self.shm.slice_at(
            Self::data_abs(off) + BLOB_HEADER_SIZE + TENSOR_HEADER_SIZE,
            data_size,
        );
        TensorView::new(thdr, data)
    }

    /// Write an owned tensor into an existing TENSOR blob.
    pub fn write_tensor(&mut self, blob_id: u16, tensor: &Tensor) -> Result<()> {
        let off = self
            .find_blob_offset(blob_id)
            .ok_or(BridgeError::NotFound(blob_id))?;
        let mut hdr = self.header_at(off)?;
        if hdr.blob_type != BLOB_TYPE_TENSOR {
            return Err(BridgeError::Decode(format!(
                "blob {blob_id} is not a tensor (type {:#04x})",
                hdr.blob_type
            )));
        }
        let total = TENSOR_HEADER_SIZE + tensor.data.len();
        if total > hdr.size as usize {
            return Err(BridgeError::SizeMismatch {
                len: total,
                capacity: hdr.size as usize,
            });
        }

        let thdr = tensor.header.encode();
        self.shm
            .write_bytes(Self::data_abs(off) + BLOB_HEADER_SIZE, &thdr);
        self.shm.write_bytes(
            Self::data_abs(off) + BLOB_HEADER_SIZE + TENSOR_HEADER_SIZE,
            &tensor.data,
        );

        // Checksum covers the tensor header plus the element bytes.
        let mut sum = compute_checksum(&thdr);
        sum = sum.wrapping_add(compute_checksum(&tensor.data));
        hdr.checksum = sum;
        self.shm.write_bytes(Self::data_abs(off), &hdr.encode());
        Ok(())
    }

    /// Allocate a TENSOR blob sized for `tensor` and write it.
    pub fn allocate_tensor(&mut self, tensor: &Tensor) -> Result<u16> {
        let size = TENSOR_HEADER_SIZE + tensor.data.len();
        let blob_id = self.allocate_blob(size, BLOB_TYPE_TENSOR)?;
        match self.write_tensor(blob_id, tensor) {
            Ok(()) => Ok(blob_id),
            Err(e) => {
                // Roll the allocation back so a failed write leaks nothing.
                let _ = self.free_blob(blob_id);
                Err(e)
            }
        }
    }

    // --- allocation ---

    /// Allocate a blob with `size` payload bytes. Returns the new blob id.
    pub fn allocate_blob(&mut self, size: usize, blob_type: u8) -> Result<u16> {
        let blocks_needed = blocks_for(size);
        let ctl = self.checked_control()?;

        if (ctl.free_blocks as usize) < blocks_needed {
            return Err(BridgeError::OutOfCapacity {
                needed: blocks_needed,
                free: ctl.free_blocks as usize,
            });
        }

        let mut bitmap = self.read_bitmap();
        let start_block =
            Self::find_free_run(&bitmap, ctl.total_blocks as usize, blocks_needed)
                .ok_or(BridgeError::Fragmented(blocks_needed))?;
        Self::set_blocks(&mut bitmap, start_block, blocks_needed);

        // Ids are u16 on the wire; the counter wraps past 0xFFFF to 1.
        let mut blob_id = (ctl.next_blob_id & 0xFFFF) as u16;
        if blob_id == 0 {
            blob_id = 1;
        }

        let data_offset = (start_block * HEAP_BLOCK_SIZE) as u32;
        let hdr = BlobHeader {
            magic: BLOB_MAGIC,
            blob_id,
            blob_type,
            flags: 0,
            size: size as u32,
            offset: data_offset,
            checksum: 0,
        };

        self.shm.write_bytes(Self::data_abs(data_offset), &hdr.encode());
        self.write_bitmap(&bitmap);
        self.update_control(
            ctl.free_blocks - blocks_needed as u32,
            blob_id as u32 + 1,
        );
        self.cache.insert(blob_id, data_offset);

        debug!(
            blob_id,
            blocks = blocks_needed,
            offset = %format_args!("{data_offset:#x}"),
            "allocated blob"
        );
        Ok(blob_id)
    }

    /// Free a blob: clear its blocks, poison the header magic, drop the
    /// cache entry. Unknown ids fail with `NotFound` and change nothing.
    pub fn free_blob(&mut self, blob_id: u16) -> Result<()> {
        let off = self
            .find_blob_offset(blob_id)
            .ok_or(BridgeError::NotFound(blob_id))?;
        let hdr = self.header_at(off)?;

        let blocks_used = hdr.blocks_used();
        let start_block = off as usize / HEAP_BLOCK_SIZE;

        let mut bitmap = self.read_bitmap();
        Self::clear_blocks(&mut bitmap, start_block, blocks_used);

        // Poison the magic so stale lookups cannot resolve this slot.
        self.shm.write_bytes(Self::data_abs(off), &[0u8; 4]);
        self.write_bitmap(&bitmap);

        let ctl = self.read_control();
        self.update_control(ctl.free_blocks + blocks_used as u32, ctl.next_blob_id);
        self.cache.remove(&blob_id);

        debug!(blob_id, blocks = blocks_used, "freed blob");
        Ok(())
    }

    pub fn stats(&self) -> HeapStats {
        let ctl = self.read_control();
        let magic_valid = ctl.magic == IPC_HEAP_MAGIC;
        if !magic_valid {
            warn!(found = %format_args!("{:#010x}", ctl.magic), "heap control magic invalid");
        }
        HeapStats {
            magic_valid,
            total_blocks: ctl.total_blocks,
            free_blocks: ctl.free_blocks,
            used_blocks: ctl.total_blocks.saturating_sub(ctl.free_blocks),
            next_blob_id: ctl.next_blob_id,
            total_bytes: ctl.total_blocks as u64 * HEAP_BLOCK_SIZE as u64,
            free_bytes: ctl.free_blocks as u64 * HEAP_BLOCK_SIZE as u64,
        }
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }
}
