// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Backend abstraction over the underlying shared memory mechanisms.
//
// Each backend implements the same eight-operation lifecycle: init (the
// constructor), create / create-named / attach a region, serialize a
// region's contact token, detach, destroy, finalize. The manager selects
// one backend at construction time and never changes it.

use std::ptr::NonNull;

use crate::config;
use crate::error::{Result, ShmError};
use crate::manager::ContactToken;

pub(crate) mod mmap;
pub(crate) mod posixshm;
pub(crate) mod sysv;

/// Which shared memory mechanism a manager drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// A mmap()-ed backing file under the system temp directory.
    FileMapping,
    /// A System V segment located by an integer key.
    SysV,
    /// A POSIX named object under the OS shm namespace.
    PosixShm,
}

/// Backend-private per-region state. Tagged so a state handed to the wrong
/// backend is caught instead of misinterpreted.
#[derive(Debug)]
pub(crate) enum RegionState {
    FileMap {
        path: String,
        file_len: usize,
        addr: NonNull<u8>,
        map_len: usize,
    },
    SysV {
        key: libc::key_t,
        id: libc::c_int,
        addr: NonNull<u8>,
    },
    PosixShm {
        name: String,
        file_len: usize,
        addr: NonNull<u8>,
        map_len: usize,
    },
}

/// One concrete shared memory mechanism.
///
/// `create_*` and `attach_region` return the backend-private region state
/// together with the address the range was actually mapped at. `detach`
/// releases the local mapping only; `destroy` also removes the underlying
/// OS object and must only run on the creator's side (the manager enforces
/// that). `finalize` tears down process-wide artifacts such as the SysV
/// key-seed file.
pub(crate) trait Backend {
    fn create_region(
        &mut self,
        size: usize,
        hint: Option<NonNull<u8>>,
    ) -> Result<(RegionState, NonNull<u8>)>;

    fn create_named_region(
        &mut self,
        name: &[u8],
        size: usize,
        hint: Option<NonNull<u8>>,
    ) -> Result<(RegionState, NonNull<u8>)>;

    fn region_contact(&self, state: &RegionState) -> Result<ContactToken>;

    fn attach_region(
        &mut self,
        contact: &[u8],
        size: usize,
        hint: Option<NonNull<u8>>,
    ) -> Result<(RegionState, NonNull<u8>)>;

    fn detach_region(&mut self, state: &RegionState) -> Result<()>;

    fn destroy_region(&mut self, state: &RegionState) -> Result<()>;

    fn finalize(&mut self) -> Result<()>;
}

/// Run the chosen backend's init and box it behind the trait.
pub(crate) fn open_backend(kind: BackendKind) -> Result<Box<dyn Backend>> {
    Ok(match kind {
        BackendKind::FileMapping => Box::new(mmap::MmapBackend::new()),
        BackendKind::SysV => Box::new(sysv::SysvBackend::new()?),
        BackendKind::PosixShm => Box::new(posixshm::PosixShmBackend::new()),
    })
}

// ---------------------------------------------------------------------------
// Contact token codec shared by the name-based backends.
//
// Layout: the name bytes, a single 0x00 terminator, then the region length
// as a native-endian usize. Readers scan to the terminator and read the
// length immediately after.
// ---------------------------------------------------------------------------

pub(crate) fn encode_name_contact(name: &str, region_len: usize) -> ContactToken {
    let mut bytes = Vec::with_capacity(name.len() + 1 + std::mem::size_of::<usize>());
    bytes.extend_from_slice(name.as_bytes());
    bytes.push(0);
    bytes.extend_from_slice(&region_len.to_ne_bytes());
    ContactToken::from_bytes(&bytes)
}

pub(crate) fn decode_name_contact(contact: &[u8]) -> Result<(&str, usize)> {
    let nul = contact
        .iter()
        .position(|&b| b == 0)
        .ok_or(ShmError::BadContactToken("missing name terminator"))?;
    let name = std::str::from_utf8(&contact[..nul])
        .map_err(|_| ShmError::BadContactToken("name is not valid UTF-8"))?;
    if name.is_empty() {
        return Err(ShmError::BadContactToken("empty name"));
    }
    let rest = &contact[nul + 1..];
    if rest.len() < std::mem::size_of::<usize>() {
        return Err(ShmError::BadContactToken("truncated length field"));
    }
    let len = usize::from_ne_bytes(
        rest[..std::mem::size_of::<usize>()]
            .try_into()
            .expect("sized slice"),
    );
    Ok((name, len))
}

// ---------------------------------------------------------------------------
// Address-placement policy shared by all backends: a hint is honored on a
// best-effort basis. A misaligned hint and a mapping that lands elsewhere
// are warnings, never errors.
// ---------------------------------------------------------------------------

pub(crate) fn warn_if_misaligned(hint: Option<NonNull<u8>>, align: usize) {
    if let Some(h) = hint {
        if h.as_ptr() as usize % align != 0 {
            log::warn!(
                "starting address hint {:p} is not aligned to {} bytes",
                h.as_ptr(),
                align
            );
        }
    }
}

pub(crate) fn warn_if_moved(actual: NonNull<u8>, hint: Option<NonNull<u8>>) {
    if let Some(h) = hint {
        if actual != h {
            log::warn!(
                "shared memory region attached at {:p} instead of {:p}",
                actual.as_ptr(),
                h.as_ptr()
            );
        }
    }
}

pub(crate) fn hint_ptr(hint: Option<NonNull<u8>>) -> *mut libc::c_void {
    hint.map_or(std::ptr::null_mut(), |h| h.as_ptr().cast())
}

// ---------------------------------------------------------------------------
// mmap/munmap wrappers shared by the file-mapping and POSIX backends.
// ---------------------------------------------------------------------------

/// Map `size` bytes of `fd` read/write and shared, at `hint` if possible.
pub(crate) fn map_shared(
    fd: libc::c_int,
    size: usize,
    hint: Option<NonNull<u8>>,
) -> Result<NonNull<u8>> {
    warn_if_misaligned(hint, config::PAGE_SIZE);
    let addr = unsafe {
        libc::mmap(
            hint_ptr(hint),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(ShmError::os("mmap"));
    }
    let mapped = NonNull::new(addr as *mut u8).expect("mmap returned a non-null mapping");
    warn_if_moved(mapped, hint);
    Ok(mapped)
}

pub(crate) fn unmap(addr: NonNull<u8>, len: usize) -> Result<()> {
    let rc = unsafe { libc::munmap(addr.as_ptr().cast(), len) };
    if rc == -1 {
        return Err(ShmError::os("munmap"));
    }
    Ok(())
}
