// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// System V shared memory backend.
//
// Keys come from ftok() over a per-process seed file
// (`<tmp>/df_shm_sysv.<pid>`) and an incrementing project id, so each
// region created by this process gets a distinct key. Segments are created
// exclusively with mode 0600 and marked for removal on destroy. The seed
// file is unlinked at finalize.
//
// The contact token is the key itself: exactly size_of::<key_t>() bytes,
// native byte order.

use std::ffi::CString;
use std::ptr::NonNull;

use crate::backend::{self, Backend, RegionState};
use crate::error::{Result, ShmError};
use crate::manager::ContactToken;

const DEFAULT_SYSV_SHM_MODE: libc::c_int = 0o600;

pub(crate) struct SysvBackend {
    /// Seed file path fed to ftok(); exists for the manager's lifetime.
    seed_path: CString,
    /// Next ftok() project id. Incremented per created region.
    token_id: libc::c_int,
}

impl SysvBackend {
    pub(crate) fn new() -> Result<Self> {
        let pid = unsafe { libc::getpid() };
        let path = std::env::temp_dir().join(format!("df_shm_sysv.{pid}"));
        let seed_path = CString::new(path.to_string_lossy().into_owned())
            .expect("temp dir paths contain no NUL");

        let fd = unsafe {
            libc::open(
                seed_path.as_ptr(),
                libc::O_RDWR | libc::O_CREAT,
                DEFAULT_SYSV_SHM_MODE as libc::c_uint,
            )
        };
        if fd == -1 {
            return Err(ShmError::os("open"));
        }
        unsafe { libc::close(fd) };
        log::debug!("process {pid} created SysV key seed {seed_path:?}");

        Ok(Self {
            seed_path,
            token_id: 1,
        })
    }

    /// shmget + shmat for a known key, shared by every acquisition path.
    /// `shmget_flags` carries IPC_CREAT|IPC_EXCL on the create paths and
    /// nothing extra on attach.
    fn get_and_attach(
        &self,
        key: libc::key_t,
        size: usize,
        shmget_flags: libc::c_int,
        hint: Option<NonNull<u8>>,
    ) -> Result<(RegionState, NonNull<u8>)> {
        let id = unsafe { libc::shmget(key, size, shmget_flags | DEFAULT_SYSV_SHM_MODE) };
        if id == -1 {
            return Err(ShmError::os("shmget"));
        }

        // SysV attachments align to SHMLBA, which is the page size on the
        // targets we support.
        backend::warn_if_misaligned(hint, crate::config::PAGE_SIZE);
        let addr = unsafe { libc::shmat(id, backend::hint_ptr(hint), libc::SHM_RND) };
        if addr as isize == -1 {
            return Err(ShmError::os("shmat"));
        }
        let attached = NonNull::new(addr as *mut u8).expect("shmat returned a non-null mapping");
        backend::warn_if_moved(attached, hint);

        Ok((
            RegionState::SysV {
                key,
                id,
                addr: attached,
            },
            attached,
        ))
    }
}

impl Backend for SysvBackend {
    fn create_region(
        &mut self,
        size: usize,
        hint: Option<NonNull<u8>>,
    ) -> Result<(RegionState, NonNull<u8>)> {
        let key = unsafe { libc::ftok(self.seed_path.as_ptr(), self.token_id) };
        if key == -1 {
            return Err(ShmError::os("ftok"));
        }
        self.token_id += 1;

        self.get_and_attach(key, size, libc::IPC_CREAT | libc::IPC_EXCL, hint)
    }

    fn create_named_region(
        &mut self,
        name: &[u8],
        size: usize,
        hint: Option<NonNull<u8>>,
    ) -> Result<(RegionState, NonNull<u8>)> {
        // The "name" of a SysV region is its key.
        let key = decode_key(name)
            .ok_or(ShmError::InvalidArgument("SysV region name must be a native key_t value"))?;

        // A segment already existing under this key is an error: SysV has
        // no truncate-and-reuse, so exclusive creation is required.
        self.get_and_attach(key, size, libc::IPC_CREAT | libc::IPC_EXCL, hint)
    }

    fn region_contact(&self, state: &RegionState) -> Result<ContactToken> {
        match state {
            RegionState::SysV { key, .. } => Ok(ContactToken::from_bytes(&key.to_ne_bytes())),
            _ => Err(ShmError::InvalidState("region does not belong to the SysV backend")),
        }
    }

    fn attach_region(
        &mut self,
        contact: &[u8],
        size: usize,
        hint: Option<NonNull<u8>>,
    ) -> Result<(RegionState, NonNull<u8>)> {
        let key = decode_key(contact)
            .ok_or(ShmError::BadContactToken("expected a native key_t value"))?;

        self.get_and_attach(key, size, 0, hint)
    }

    fn detach_region(&mut self, state: &RegionState) -> Result<()> {
        match state {
            RegionState::SysV { addr, .. } => {
                if unsafe { libc::shmdt(addr.as_ptr().cast()) } == -1 {
                    return Err(ShmError::os("shmdt"));
                }
                Ok(())
            }
            _ => Err(ShmError::InvalidState("region does not belong to the SysV backend")),
        }
    }

    fn destroy_region(&mut self, state: &RegionState) -> Result<()> {
        match state {
            RegionState::SysV { id, addr, .. } => {
                if unsafe { libc::shmdt(addr.as_ptr().cast()) } == -1 {
                    return Err(ShmError::os("shmdt"));
                }
                // Mark the segment for removal; it disappears once every
                // attachment is gone.
                if unsafe { libc::shmctl(*id, libc::IPC_RMID, std::ptr::null_mut()) } == -1 {
                    log::warn!(
                        "IPC_RMID of SysV segment {id} failed: {}",
                        std::io::Error::last_os_error()
                    );
                }
                Ok(())
            }
            _ => Err(ShmError::InvalidState("region does not belong to the SysV backend")),
        }
    }

    fn finalize(&mut self) -> Result<()> {
        if unsafe { libc::unlink(self.seed_path.as_ptr()) } == -1 {
            return Err(ShmError::os("unlink"));
        }
        Ok(())
    }
}

/// Read a native key_t from exactly size_of::<key_t>() bytes.
fn decode_key(bytes: &[u8]) -> Option<libc::key_t> {
    let raw: [u8; std::mem::size_of::<libc::key_t>()] = bytes.try_into().ok()?;
    Some(libc::key_t::from_ne_bytes(raw))
}
