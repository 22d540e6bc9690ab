// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Uni-directional, circular, lock-free SPSC FIFO queue laid out in place
// inside a shared memory region (or any byte range, for inter-thread use).
//
// Layout at the caller-chosen, cache-line-aligned base address:
//
//   QueueHeader   — exactly one cache line
//   slot 0        — slot_stride bytes
//   slot 1
//   ...
//   slot N-1
//
// Each slot starts with a status word and a payload length, followed by
// the inline payload. The stride is the smallest multiple of the cache
// line that fits the slot header plus the payload limit, so slots never
// share a cache line.
//
// Full and empty are per-slot states, not a head/tail comparison: a queue
// of N slots holds exactly N in-flight messages.

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::config::{align_up, CACHE_LINE_SIZE};
use crate::error::{Result, ShmError};
use crate::manager::ShmRegion;

/// Slot is ready for reading.
pub(crate) const SLOT_FULL: u32 = 0;
/// Slot is ready for writing.
pub(crate) const SLOT_EMPTY: u32 = 1;

// ---------------------------------------------------------------------------
// Shared layout
// ---------------------------------------------------------------------------

/// Queue header, padded to exactly one cache line.
///
/// Every field except `initialized` is written once by the creator before
/// the initialized flag is release-stored, and read-only afterwards.
#[repr(C, align(64))]
pub(crate) struct QueueHeader {
    /// 0 until the creator finishes initialization; release-stored to 1
    /// as the last step, acquire-loaded by openers.
    pub(crate) initialized: AtomicI32,
    pub(crate) max_slots: u32,
    pub(crate) max_payload: usize,
    pub(crate) slot_stride: usize,
    pub(crate) total_size: usize,
}

const _: () = assert!(std::mem::size_of::<QueueHeader>() == CACHE_LINE_SIZE);
const _: () = assert!(std::mem::align_of::<QueueHeader>() == CACHE_LINE_SIZE);

/// Per-slot header preceding the inline payload bytes.
///
/// `status` is the only word both sides ever store to, and never
/// concurrently: the sender writes EMPTY→FULL, the receiver FULL→EMPTY.
/// `len` and the payload are handed between the sides by the
/// release/acquire pair on `status`.
#[repr(C)]
pub(crate) struct SlotHeader {
    pub(crate) status: AtomicU32,
    pub(crate) len: usize,
}

pub(crate) const SLOT_HEADER_SIZE: usize = std::mem::size_of::<SlotHeader>();

// ---------------------------------------------------------------------------
// Size calculation
// ---------------------------------------------------------------------------

/// Bytes one slot occupies: slot header plus payload limit, rounded up to
/// a whole number of cache lines.
pub fn calculate_slot_size(max_payload: usize) -> usize {
    assert!(max_payload > 0, "max_payload must be positive");
    align_up(SLOT_HEADER_SIZE + max_payload, CACHE_LINE_SIZE)
}

/// Total bytes a queue with the given configuration occupies, header
/// included.
pub fn calculate_queue_size(max_slots: u32, max_payload: usize) -> usize {
    assert!(max_slots > 0, "max_slots must be positive");
    std::mem::size_of::<QueueHeader>() + max_slots as usize * calculate_slot_size(max_payload)
}

// ---------------------------------------------------------------------------
// ShmQueue
// ---------------------------------------------------------------------------

/// Handle onto a queue living at some address inside a region.
///
/// The handle borrows the region (or whatever byte range the queue was
/// placed in), so the region cannot be destroyed out from under live
/// queues or endpoints — the borrow checker rejects it.
#[derive(Debug)]
pub struct ShmQueue<'r> {
    header: NonNull<QueueHeader>,
    _place: PhantomData<&'r [u8]>,
}

// Safety: the handle is a pointer into memory shared by design; the slot
// protocol serializes all cross-thread access.
unsafe impl Send for ShmQueue<'_> {}
unsafe impl Sync for ShmQueue<'_> {}

impl<'r> ShmQueue<'r> {
    /// Create a queue in place at `addr`, which must be cache-line aligned
    /// and have room for [`calculate_queue_size`] bytes.
    ///
    /// All slots are marked empty before the initialized flag becomes
    /// visible, so a peer that observes the flag set sees a fully built
    /// queue.
    ///
    /// # Safety
    /// `addr` must be valid for reads and writes of
    /// `calculate_queue_size(max_slots, max_payload)` bytes for the
    /// lifetime `'r`, and nothing else may touch those bytes while the
    /// queue lives there.
    pub unsafe fn create_at(
        addr: NonNull<u8>,
        max_slots: u32,
        max_payload: usize,
    ) -> Result<ShmQueue<'r>> {
        if max_slots == 0 {
            return Err(ShmError::InvalidArgument("queue must have at least one slot"));
        }
        if max_payload == 0 {
            return Err(ShmError::InvalidArgument("payload limit must be positive"));
        }
        if addr.as_ptr() as usize % CACHE_LINE_SIZE != 0 {
            return Err(ShmError::InvalidArgument(
                "queue base address must be cache-line aligned",
            ));
        }

        let slot_stride = calculate_slot_size(max_payload);
        let total_size = calculate_queue_size(max_slots, max_payload);

        let header = addr.as_ptr() as *mut QueueHeader;
        header.write(QueueHeader {
            initialized: AtomicI32::new(0),
            max_slots,
            max_payload,
            slot_stride,
            total_size,
        });

        let slots_start = addr.as_ptr().add(std::mem::size_of::<QueueHeader>());
        for i in 0..max_slots as usize {
            let slot = slots_start.add(i * slot_stride) as *mut SlotHeader;
            slot.write(SlotHeader {
                status: AtomicU32::new(SLOT_EMPTY),
                len: 0,
            });
        }

        // Publish: everything above must be visible before the flag.
        (*header).initialized.store(1, Ordering::Release);

        Ok(ShmQueue {
            header: NonNull::new_unchecked(header),
            _place: PhantomData,
        })
    }

    /// Open a queue some other party created at `addr`.
    ///
    /// Fails if no initialized queue is there (yet).
    ///
    /// # Safety
    /// `addr` must point at a queue created by [`ShmQueue::create_at`] in
    /// a mapping of the same shared bytes, valid for `'r`.
    pub unsafe fn open_at(addr: NonNull<u8>) -> Result<ShmQueue<'r>> {
        if addr.as_ptr() as usize % CACHE_LINE_SIZE != 0 {
            return Err(ShmError::InvalidArgument(
                "queue base address must be cache-line aligned",
            ));
        }
        let header = addr.as_ptr() as *mut QueueHeader;
        if (*header).initialized.load(Ordering::Acquire) != 1 {
            return Err(ShmError::InvalidState("queue is not initialized"));
        }
        Ok(ShmQueue {
            header: NonNull::new_unchecked(header),
            _place: PhantomData,
        })
    }

    /// Create a queue inside `region` at `offset` bytes from its base.
    /// The offset must be cache-line aligned and the queue must fit.
    pub fn create_in(
        region: &'r ShmRegion,
        offset: usize,
        max_slots: u32,
        max_payload: usize,
    ) -> Result<ShmQueue<'r>> {
        if max_slots == 0 {
            return Err(ShmError::InvalidArgument("queue must have at least one slot"));
        }
        if max_payload == 0 {
            return Err(ShmError::InvalidArgument("payload limit must be positive"));
        }
        let total = calculate_queue_size(max_slots, max_payload);
        if offset.checked_add(total).map_or(true, |end| end > region.len()) {
            return Err(ShmError::InvalidArgument("queue does not fit in the region"));
        }
        let addr = NonNull::new(region.at_offset(offset)).expect("region base is non-null");
        // Safety: bounds checked against the region, which stays mapped
        // for 'r; alignment checked inside create_at.
        unsafe { Self::create_at(addr, max_slots, max_payload) }
    }

    /// Open a queue a peer created inside `region` at `offset`.
    pub fn open_in(region: &'r ShmRegion, offset: usize) -> Result<ShmQueue<'r>> {
        if offset.checked_add(std::mem::size_of::<QueueHeader>())
            .map_or(true, |end| end > region.len())
        {
            return Err(ShmError::InvalidArgument("offset out of region bounds"));
        }
        let addr = NonNull::new(region.at_offset(offset)).expect("region base is non-null");
        // Safety: the header fits per the check above; open_at validates
        // alignment and the initialized flag before trusting the rest.
        let queue = unsafe { Self::open_at(addr) }?;
        if offset + queue.total_size() > region.len() {
            return Err(ShmError::InvalidArgument("queue does not fit in the region"));
        }
        Ok(queue)
    }

    pub(crate) fn header(&self) -> &QueueHeader {
        unsafe { self.header.as_ref() }
    }

    /// Base address of slot `index`.
    pub(crate) fn slot_ptr(&self, index: usize) -> NonNull<u8> {
        let hdr = self.header();
        debug_assert!(index < hdr.max_slots as usize);
        unsafe {
            NonNull::new_unchecked(
                (self.header.as_ptr() as *mut u8)
                    .add(std::mem::size_of::<QueueHeader>() + index * hdr.slot_stride),
            )
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.header().initialized.load(Ordering::Acquire) == 1
    }

    pub fn max_slots(&self) -> u32 {
        self.header().max_slots
    }

    pub fn max_payload(&self) -> usize {
        self.header().max_payload
    }

    pub fn slot_stride(&self) -> usize {
        self.header().slot_stride
    }

    /// Total byte footprint of the queue, header included.
    pub fn total_size(&self) -> usize {
        self.header().total_size
    }

    /// Destroy the queue in place: only the initialized flag is cleared;
    /// the bytes stay whatever they were. Endpoints must be closed first
    /// (the borrow on `self` enforces that).
    pub fn destroy(self) {
        self.header().initialized.store(0, Ordering::Release);
    }
}
