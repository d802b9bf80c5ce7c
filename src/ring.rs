// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 zenedge contributors
//
// Lock-free single-producer single-consumer ring buffers over the shared
// region. One ring instance covers one window of the mapping: a 32-byte
// header (magic, head, tail, size) followed by `size` fixed-width slots.
//
// Head is advanced only by the producer, tail only by the consumer.
// empty <=> head == tail; full <=> (head + 1) % size == tail, so capacity is
// size - 1 slots. The slot count is re-read from the header on every pass to
// tolerate whatever size the peer negotiated.

use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::{BridgeError, Result};
use crate::proto::{
    RING_HEADER_SIZE, RING_HEAD_OFFSET, RING_MAGIC_OFFSET, RING_SIZE_OFFSET, RING_TAIL_OFFSET,
};
use crate::shm::SharedMem;

/// SPSC ring over a fixed window of the shared region.
///
/// `T` must be `Copy` with a `#[repr(C)]` layout matching the wire format.
/// The same type serves both peers; the host uses the consumer API on the
/// command and action rings and the producer API on the response and
/// observation rings.
pub struct SpscRing<T: Copy> {
    shm: Arc<SharedMem>,
    base: usize,
    window: usize,
    magic: u32,
    name: &'static str,
    _marker: PhantomData<T>,
}

impl<T: Copy> SpscRing<T> {
    pub fn new(
        shm: Arc<SharedMem>,
        base: usize,
        window: usize,
        magic: u32,
        name: &'static str,
    ) -> Self {
        Self {
            shm,
            base,
            window,
            magic,
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Magic currently stored in the header.
    pub fn stored_magic(&self) -> u32 {
        self.shm
            .atomic_u32(self.base + RING_MAGIC_OFFSET)
            .load(Ordering::Acquire)
    }

    /// Whether the peer (or a test) has initialised this ring.
    pub fn is_ready(&self) -> bool {
        self.stored_magic() == self.magic && self.declared_size().is_some()
    }

    /// Header-declared slot count, if it is sane for this window.
    fn declared_size(&self) -> Option<u32> {
        let size = self
            .shm
            .atomic_u32(self.base + RING_SIZE_OFFSET)
            .load(Ordering::Relaxed);
        if size == 0 {
            return None;
        }
        let slots_bytes = (size as usize).checked_mul(std::mem::size_of::<T>())?;
        if RING_HEADER_SIZE + slots_bytes > self.window {
            return None;
        }
        Some(size)
    }

    fn slot_offset(&self, idx: u32) -> usize {
        self.base + RING_HEADER_SIZE + idx as usize * std::mem::size_of::<T>()
    }

    fn read_slot(&self, idx: u32) -> T {
        let mut out = std::mem::MaybeUninit::<T>::uninit();
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.shm.ptr_at(self.slot_offset(idx)),
                out.as_mut_ptr() as *mut u8,
                std::mem::size_of::<T>(),
            );
            out.assume_init()
        }
    }

    fn write_slot(&self, idx: u32, item: &T) {
        unsafe {
            std::ptr::copy_nonoverlapping(
                item as *const T as *const u8,
                self.shm.ptr_at(self.slot_offset(idx)),
                std::mem::size_of::<T>(),
            );
        }
    }

    // --- Consumer API (host owns tail) ---

    /// Consume one entry, or `None` if the ring is empty or uninitialised.
    pub fn consume(&self) -> Option<T> {
        if self.stored_magic() != self.magic {
            return None;
        }
        let size = self.declared_size()?;

        // Acquire on head pairs with the producer's release store and makes
        // the slot payload visible before we read it.
        let head = self
            .shm
            .atomic_u32(self.base + RING_HEAD_OFFSET)
            .load(Ordering::Acquire);
        let tail_ref = self.shm.atomic_u32(self.base + RING_TAIL_OFFSET);
        let tail = tail_ref.load(Ordering::Relaxed);
        if head >= size || tail >= size {
            return None; // header corrupt; do not touch slots
        }
        if head == tail {
            return None;
        }

        let item = self.read_slot(tail);
        // Release the slot back to the producer.
        tail_ref.store((tail + 1) % size, Ordering::Release);
        Some(item)
    }

    // --- Producer API (host owns head) ---

    /// Produce one entry. Fails with `MagicMismatch` when the ring is not
    /// initialised and `RingFull` when all capacity is in use.
    pub fn produce(&self, item: &T) -> Result<()> {
        let found = self.stored_magic();
        if found != self.magic {
            return Err(BridgeError::MagicMismatch {
                what: self.name,
                found,
                expected: self.magic,
            });
        }
        let size = self.declared_size().ok_or_else(|| {
            BridgeError::Decode(format!("{} ring declares an unusable size", self.name))
        })?;

        let head_ref = self.shm.atomic_u32(self.base + RING_HEAD_OFFSET);
        let head = head_ref.load(Ordering::Relaxed);
        let tail = self
            .shm
            .atomic_u32(self.base + RING_TAIL_OFFSET)
            .load(Ordering::Acquire);
        if head >= size || tail >= size {
            return Err(BridgeError::Decode(format!(
                "{} ring cursors out of range",
                self.name
            )));
        }

        let next = (head + 1) % size;
        if next == tail {
            return Err(BridgeError::RingFull { ring: self.name });
        }

        self.write_slot(head, item);
        // Publish: the head store must become visible after the slot bytes.
        head_ref.store(next, Ordering::Release);
        Ok(())
    }

    /// Entries currently waiting to be consumed.
    pub fn available(&self) -> u32 {
        if self.stored_magic() != self.magic {
            return 0;
        }
        let Some(size) = self.declared_size() else {
            return 0;
        };
        let head = self
            .shm
            .atomic_u32(self.base + RING_HEAD_OFFSET)
            .load(Ordering::Acquire);
        let tail = self
            .shm
            .atomic_u32(self.base + RING_TAIL_OFFSET)
            .load(Ordering::Acquire);
        if head >= size || tail >= size {
            return 0;
        }
        (head + size - tail) % size
    }

    /// Current (head, tail) cursor pair, for diagnostics and tests.
    pub fn cursors(&self) -> (u32, u32) {
        (
            self.shm
                .atomic_u32(self.base + RING_HEAD_OFFSET)
                .load(Ordering::Acquire),
            self.shm
                .atomic_u32(self.base + RING_TAIL_OFFSET)
                .load(Ordering::Acquire),
        )
    }

    /// Peer-style initialisation: zero the slots, set head = tail = 0 and
    /// the slot count, then publish the magic last. Used by the demo peer
    /// and tests; the bridge itself never initialises a ring it consumes.
    pub fn init_header(&self, size: u32) {
        let slots_bytes = size as usize * std::mem::size_of::<T>();
        assert!(
            RING_HEADER_SIZE + slots_bytes <= self.window,
            "{} ring: {size} slots do not fit the window",
            self.name
        );
        self.shm.zero_bytes(self.base, RING_HEADER_SIZE + slots_bytes);
        self.shm
            .atomic_u32(self.base + RING_SIZE_OFFSET)
            .store(size, Ordering::Relaxed);
        self.shm
            .atomic_u32(self.base + RING_HEAD_OFFSET)
            .store(0, Ordering::Relaxed);
        self.shm
            .atomic_u32(self.base + RING_TAIL_OFFSET)
            .store(0, Ordering::Relaxed);
        self.shm
            .atomic_u32(self.base + RING_MAGIC_OFFSET)
            .store(self.magic, Ordering::Release);
    }
}
