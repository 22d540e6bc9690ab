// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Region manager: uniform create/attach/contact/destroy lifecycle over a
// chosen backend, with per-process bookkeeping.
//
// Regions this process created and regions it merely attached to live in
// two separate lists. The creator is responsible for eventually removing
// the OS object (destroy); attachers only ever unmap (detach). Keeping the
// lists apart lets finalize apply the right disposition to every region
// left over at shutdown without consulting per-region role flags.

use std::ptr::NonNull;

use crate::backend::{self, Backend, BackendKind, RegionState};
use crate::config;
use crate::error::{Result, ShmError};

/// Creator pid sentinel for regions attached by name, where the peer's
/// identity is unknown.
pub const UNKNOWN_PID: libc::pid_t = -1;

// ---------------------------------------------------------------------------
// ContactToken
// ---------------------------------------------------------------------------

/// Opaque byte string that lets a peer locate and size a region.
///
/// The format is backend-specific; a token produced by one backend can only
/// be consumed by the same backend. Ship it to the peer over any
/// out-of-band byte transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactToken(Vec<u8>);

impl ContactToken {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

// ---------------------------------------------------------------------------
// ShmRegion
// ---------------------------------------------------------------------------

/// Handle to one mapped shared byte range.
///
/// The range `[as_ptr(), as_ptr() + len())` is mapped read/write in this
/// process for as long as the handle is tracked by its manager. The same
/// bytes may sit at a different virtual address in the peer, so locations
/// inside the region must travel as offsets, never as raw pointers —
/// see [`ShmRegion::offset_of`] and [`ShmRegion::at_offset`].
#[derive(Debug)]
pub struct ShmRegion {
    serial: u64,
    size: usize,
    addr: NonNull<u8>,
    creator: libc::pid_t,
    state: RegionState,
}

// Safety: the handle owns no thread-local state; the shared bytes it points
// at are process-shared by design and all mutation goes through raw
// pointers under the queue protocol.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Region size in bytes (rounded up to page granularity).
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Starting address of the region in this process.
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Pid of the creating process, or `None` for regions attached by name
    /// where the creator is unknown.
    pub fn creator_pid(&self) -> Option<libc::pid_t> {
        (self.creator != UNKNOWN_PID).then_some(self.creator)
    }

    /// Translate an address inside the region to a region-relative offset.
    ///
    /// # Panics
    /// Panics if `addr` does not point into the region.
    pub fn offset_of(&self, addr: *const u8) -> usize {
        let base = self.addr.as_ptr() as usize;
        let a = addr as usize;
        assert!(
            a >= base && a < base + self.size,
            "address does not point into the region"
        );
        a - base
    }

    /// Translate a region-relative offset to an address in this process.
    ///
    /// # Panics
    /// Panics if `offset` is out of bounds.
    pub fn at_offset(&self, offset: usize) -> *mut u8 {
        assert!(offset < self.size, "offset {offset} out of bounds");
        unsafe { self.addr.as_ptr().add(offset) }
    }
}

/// Identifies one region tracked by a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(u64);

// ---------------------------------------------------------------------------
// ShmManager
// ---------------------------------------------------------------------------

/// Per-process manager for shared memory regions over one backend.
///
/// One manager drives one backend, fixed at construction. Every region it
/// hands out is destroyed or detached either explicitly or when the
/// manager is finalized/dropped.
pub struct ShmManager {
    backend: Box<dyn Backend>,
    kind: BackendKind,
    created: Vec<ShmRegion>,
    foreign: Vec<ShmRegion>,
    next_serial: u64,
    my_pid: libc::pid_t,
    finalized: bool,
}

// Safety: same reasoning as ShmRegion; the backend structs hold only plain
// bookkeeping (paths, keys, counters).
unsafe impl Send for ShmManager {}

impl ShmManager {
    /// Initialize the chosen backend and produce a manager with empty
    /// bookkeeping lists.
    pub fn new(kind: BackendKind) -> Result<Self> {
        let backend = backend::open_backend(kind)?;
        Ok(Self {
            backend,
            kind,
            created: Vec::new(),
            foreign: Vec::new(),
            next_serial: 0,
            my_pid: unsafe { libc::getpid() },
            finalized: false,
        })
    }

    /// The backend this manager drives.
    pub fn backend_kind(&self) -> BackendKind {
        self.kind
    }

    /// Number of regions created by this manager and still alive.
    pub fn created_regions(&self) -> usize {
        self.created.len()
    }

    /// Number of foreign regions currently attached through this manager.
    pub fn foreign_regions(&self) -> usize {
        self.foreign.len()
    }

    /// Look up a region handle by id.
    pub fn region(&self, id: RegionId) -> Option<&ShmRegion> {
        self.created
            .iter()
            .chain(self.foreign.iter())
            .find(|r| r.serial == id.0)
    }

    fn next_id(&mut self) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        serial
    }

    /// Create a shared memory region of at least `size` bytes and map it
    /// into this process, at `hint` if the OS allows.
    pub fn create(&mut self, size: usize, hint: Option<NonNull<u8>>) -> Result<RegionId> {
        if size == 0 {
            return Err(ShmError::InvalidArgument("region size must be positive"));
        }
        let size = config::align_up(size, config::PAGE_SIZE);
        let (state, addr) = self.backend.create_region(size, hint)?;
        Ok(self.track_created(size, addr, state))
    }

    /// Create a region with a caller-supplied identity: a file path for
    /// file-mapping, a native key for SysV, a shm name for POSIX.
    pub fn create_named(
        &mut self,
        name: &[u8],
        size: usize,
        hint: Option<NonNull<u8>>,
    ) -> Result<RegionId> {
        if size == 0 {
            return Err(ShmError::InvalidArgument("region size must be positive"));
        }
        if name.is_empty() {
            return Err(ShmError::InvalidArgument("region name must not be empty"));
        }
        let size = config::align_up(size, config::PAGE_SIZE);
        let (state, addr) = self.backend.create_named_region(name, size, hint)?;
        Ok(self.track_created(size, addr, state))
    }

    fn track_created(&mut self, size: usize, addr: NonNull<u8>, state: RegionState) -> RegionId {
        let serial = self.next_id();
        self.created.insert(
            0,
            ShmRegion {
                serial,
                size,
                addr,
                creator: self.my_pid,
                state,
            },
        );
        RegionId(serial)
    }

    /// Serialize the contact token a peer needs to attach `id`.
    pub fn contact(&self, id: RegionId) -> Result<ContactToken> {
        let region = self.region(id).ok_or(ShmError::UnknownRegion)?;
        self.backend.region_contact(&region.state)
    }

    /// Attach a region created by another process. `peer_pid` is the
    /// creator's pid if known; it determines how `destroy` on this handle
    /// behaves (a non-creator only ever detaches).
    pub fn attach(
        &mut self,
        peer_pid: Option<libc::pid_t>,
        contact: &ContactToken,
        size: usize,
        hint: Option<NonNull<u8>>,
    ) -> Result<RegionId> {
        if size == 0 {
            return Err(ShmError::InvalidArgument("region size must be positive"));
        }
        let size = config::align_up(size, config::PAGE_SIZE);
        let (state, addr) = self.backend.attach_region(contact.as_bytes(), size, hint)?;
        let serial = self.next_id();
        self.foreign.insert(
            0,
            ShmRegion {
                serial,
                size,
                addr,
                creator: peer_pid.unwrap_or(UNKNOWN_PID),
                state,
            },
        );
        Ok(RegionId(serial))
    }

    /// Attach a region by well-known name (see [`Self::create_named`]).
    /// The creator is recorded as unknown.
    pub fn attach_named(
        &mut self,
        name: &[u8],
        size: usize,
        hint: Option<NonNull<u8>>,
    ) -> Result<RegionId> {
        // A well-known name is its own contact info for the name-based
        // backends; for SysV it is the key, which is the token format too.
        let token = match self.kind {
            BackendKind::SysV => ContactToken::from_bytes(name),
            BackendKind::FileMapping | BackendKind::PosixShm => {
                backend::encode_name_contact(
                    std::str::from_utf8(name)
                        .map_err(|_| ShmError::InvalidArgument("region name is not valid UTF-8"))?,
                    config::align_up(size, config::PAGE_SIZE),
                )
            }
        };
        self.attach(None, &token, size, hint)
    }

    /// Unmap a foreign region and drop its handle. The underlying OS
    /// object is untouched.
    pub fn detach(&mut self, id: RegionId) -> Result<()> {
        let pos = self
            .foreign
            .iter()
            .position(|r| r.serial == id.0)
            .ok_or(ShmError::InvalidState("region is not on the foreign list"))?;
        let region = self.foreign.remove(pos);
        self.backend.detach_region(&region.state)
    }

    /// Destroy a region: unmap it and remove the underlying OS object.
    ///
    /// Only meaningful for regions this process created; invoked on an
    /// attached region it degrades to [`Self::detach`] and leaves the OS
    /// object alone.
    pub fn destroy(&mut self, id: RegionId) -> Result<()> {
        if let Some(pos) = self.created.iter().position(|r| r.serial == id.0) {
            let region = self.created.remove(pos);
            return self.backend.destroy_region(&region.state);
        }
        if self.foreign.iter().any(|r| r.serial == id.0) {
            return self.detach(id);
        }
        Err(ShmError::UnknownRegion)
    }

    /// Destroy every remaining created region, detach every remaining
    /// foreign region, and run the backend's finalize. Called implicitly
    /// (best effort, errors logged) when the manager is dropped.
    pub fn finalize(mut self) -> Result<()> {
        self.cleanup()
    }

    fn cleanup(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;

        let mut first_err = None;
        for region in self.created.drain(..) {
            if let Err(e) = self.backend.destroy_region(&region.state) {
                log::warn!("destroy of region {} at finalize failed: {e}", region.serial);
                first_err.get_or_insert(e);
            }
        }
        for region in self.foreign.drain(..) {
            if let Err(e) = self.backend.detach_region(&region.state) {
                log::warn!("detach of region {} at finalize failed: {e}", region.serial);
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = self.backend.finalize() {
            log::warn!("backend finalize failed: {e}");
            first_err.get_or_insert(e);
        }

        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

impl Drop for ShmManager {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}
