// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Sender and receiver endpoints onto a queue.
//
// An endpoint is strictly process-local: a cursor plus a precomputed table
// of slot base addresses, so the hot path is `slots[cursor]` and two
// atomic operations. Exactly one sender and one receiver may operate on a
// queue at a time — a second sender, even in another process, breaks the
// protocol and the results are undefined.
//
// Blocking calls busy-spin on the slot status word with the CPU pause
// hint; there is no yield and no kernel wait. The expected wait in the
// target workloads is tens of nanoseconds, where any kernel transition
// would dominate.

use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Result, ShmError};
use crate::queue::{QueueHeader, ShmQueue, SlotHeader, SLOT_EMPTY, SLOT_FULL, SLOT_HEADER_SIZE};

// ---------------------------------------------------------------------------
// Raw slot field access.
//
// References are only ever formed to the status atomic. The length and
// payload are touched through raw pointers: they are plain memory handed
// between the two sides by the release/acquire pair on the status word,
// and each side accesses them only while it holds the slot.
// ---------------------------------------------------------------------------

const LEN_OFFSET: usize = std::mem::offset_of!(SlotHeader, len);

#[inline]
fn slot_status<'a>(slot: NonNull<u8>) -> &'a AtomicU32 {
    // The status word is the first field of the slot.
    unsafe { &*(slot.as_ptr() as *const AtomicU32) }
}

#[inline]
unsafe fn slot_len_ptr(slot: NonNull<u8>) -> *mut usize {
    slot.as_ptr().add(LEN_OFFSET) as *mut usize
}

#[inline]
unsafe fn slot_payload_ptr(slot: NonNull<u8>) -> *mut u8 {
    slot.as_ptr().add(SLOT_HEADER_SIZE)
}

fn slot_table(queue: &ShmQueue<'_>) -> Box<[NonNull<u8>]> {
    (0..queue.max_slots() as usize)
        .map(|i| queue.slot_ptr(i))
        .collect()
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// The producing end of a queue.
pub struct Sender<'q> {
    slots: Box<[NonNull<u8>]>,
    cursor: usize,
    max_payload: usize,
    _queue: PhantomData<&'q QueueHeader>,
}

// Safety: an endpoint may move to the thread that drives it; the slot
// protocol serializes everything it touches in shared memory.
unsafe impl Send for Sender<'_> {}

/// The consuming end of a queue.
pub struct Receiver<'q> {
    slots: Box<[NonNull<u8>]>,
    cursor: usize,
    _queue: PhantomData<&'q QueueHeader>,
}

unsafe impl Send for Receiver<'_> {}

impl<'r> ShmQueue<'r> {
    /// Open the sender endpoint. Fails if the queue is not initialized.
    pub fn sender(&self) -> Result<Sender<'_>> {
        if !self.is_initialized() {
            return Err(ShmError::InvalidState("queue is not initialized"));
        }
        Ok(Sender {
            slots: slot_table(self),
            cursor: 0,
            max_payload: self.max_payload(),
            _queue: PhantomData,
        })
    }

    /// Open the receiver endpoint. Fails if the queue is not initialized.
    pub fn receiver(&self) -> Result<Receiver<'_>> {
        if !self.is_initialized() {
            return Err(ShmError::InvalidState("queue is not initialized"));
        }
        Ok(Receiver {
            slots: slot_table(self),
            cursor: 0,
            _queue: PhantomData,
        })
    }
}

impl Sender<'_> {
    /// Copy `data` into the next slot, blocking while it is still held by
    /// the receiver.
    pub fn enqueue(&mut self, data: &[u8]) -> Result<()> {
        self.enqueue_vector(&[data])
    }

    /// Gather-enqueue: concatenate `segments` in order into one slot.
    /// Blocks like [`Self::enqueue`]. The combined length must fit the
    /// queue's payload limit; on an oversize payload the slot and cursor
    /// are left untouched.
    pub fn enqueue_vector(&mut self, segments: &[&[u8]]) -> Result<()> {
        let total = self.check_size(segments)?;
        let slot = self.slots[self.cursor];
        let status = slot_status(slot);
        while status.load(Ordering::Acquire) != SLOT_EMPTY {
            std::hint::spin_loop();
        }
        unsafe { self.fill_slot(slot, segments, total) };
        self.advance();
        Ok(())
    }

    /// Non-blocking enqueue. `Ok(true)` on success, `Ok(false)` if the
    /// next slot is still full (all state untouched).
    pub fn try_enqueue(&mut self, data: &[u8]) -> Result<bool> {
        self.try_enqueue_vector(&[data])
    }

    /// Non-blocking gather-enqueue. See [`Self::try_enqueue`].
    pub fn try_enqueue_vector(&mut self, segments: &[&[u8]]) -> Result<bool> {
        let total = self.check_size(segments)?;
        let slot = self.slots[self.cursor];
        if slot_status(slot).load(Ordering::Acquire) != SLOT_EMPTY {
            return Ok(false);
        }
        unsafe { self.fill_slot(slot, segments, total) };
        self.advance();
        Ok(true)
    }

    /// Whether the very next enqueue would succeed without blocking.
    /// This probes the single slot at the cursor; it does not count free
    /// slots.
    pub fn is_enqueue_possible(&self) -> bool {
        slot_status(self.slots[self.cursor]).load(Ordering::Acquire) == SLOT_EMPTY
    }

    /// Payload limit this queue was created with.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    fn check_size(&self, segments: &[&[u8]]) -> Result<usize> {
        let total: usize = segments.iter().map(|s| s.len()).sum();
        if total > self.max_payload {
            return Err(ShmError::PayloadTooLarge {
                size: total,
                limit: self.max_payload,
            });
        }
        Ok(total)
    }

    /// Copy the payload, publish the length, then release-store FULL so
    /// the receiver cannot observe the status before the bytes.
    unsafe fn fill_slot(&self, slot: NonNull<u8>, segments: &[&[u8]], total: usize) {
        let mut dst = slot_payload_ptr(slot);
        for seg in segments {
            std::ptr::copy_nonoverlapping(seg.as_ptr(), dst, seg.len());
            dst = dst.add(seg.len());
        }
        slot_len_ptr(slot).write(total);
        slot_status(slot).store(SLOT_FULL, Ordering::Release);
    }

    fn advance(&mut self) {
        self.cursor = (self.cursor + 1) % self.slots.len();
    }
}

impl<'q> Receiver<'q> {
    /// Wait for the next slot to fill and hand out its payload without
    /// copying. The slot is released (and the cursor advanced) when the
    /// returned [`RecvMsg`] is dropped.
    pub fn dequeue(&mut self) -> RecvMsg<'_, 'q> {
        let slot = self.slots[self.cursor];
        let status = slot_status(slot);
        while status.load(Ordering::Acquire) != SLOT_FULL {
            std::hint::spin_loop();
        }
        unsafe { self.msg_from(slot) }
    }

    /// Non-blocking dequeue: `None` if the next slot is empty (all state
    /// untouched).
    pub fn try_dequeue(&mut self) -> Option<RecvMsg<'_, 'q>> {
        let slot = self.slots[self.cursor];
        if slot_status(slot).load(Ordering::Acquire) != SLOT_FULL {
            return None;
        }
        Some(unsafe { self.msg_from(slot) })
    }

    /// Whether the very next dequeue would succeed without blocking.
    pub fn is_dequeue_possible(&self) -> bool {
        slot_status(self.slots[self.cursor]).load(Ordering::Acquire) == SLOT_FULL
    }

    /// Safety: the slot must have been observed FULL with an acquire load.
    unsafe fn msg_from(&mut self, slot: NonNull<u8>) -> RecvMsg<'_, 'q> {
        let len = slot_len_ptr(slot).read();
        let ptr = slot_payload_ptr(slot) as *const u8;
        RecvMsg {
            rx: self,
            ptr,
            len,
        }
    }

    /// Zero the length, release-store EMPTY, move to the next slot. The
    /// release ordering keeps our payload reads from sinking past the
    /// hand-back.
    fn release_current(&mut self) {
        let slot = self.slots[self.cursor];
        unsafe { slot_len_ptr(slot).write(0) };
        slot_status(slot).store(SLOT_EMPTY, Ordering::Release);
        self.cursor = (self.cursor + 1) % self.slots.len();
    }
}

// ---------------------------------------------------------------------------
// RecvMsg
// ---------------------------------------------------------------------------

/// A dequeued message, borrowed straight out of the live slot.
///
/// Dereferences to the payload bytes. Dropping it releases the slot back
/// to the sender; copy anything you need to keep first.
pub struct RecvMsg<'r, 'q> {
    rx: &'r mut Receiver<'q>,
    ptr: *const u8,
    len: usize,
}

impl RecvMsg<'_, '_> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Release the slot. Equivalent to dropping the message; spelled out
    /// for call sites where the hand-back is the point.
    pub fn release(self) {}
}

impl Deref for RecvMsg<'_, '_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl AsRef<[u8]> for RecvMsg<'_, '_> {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl Drop for RecvMsg<'_, '_> {
    fn drop(&mut self) {
        self.rx.release_current();
    }
}
