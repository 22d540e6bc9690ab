// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX named shared memory backend.
//
// Regions live under the OS shm namespace (on Linux, /dev/shm). Anonymous
// regions are named `/df_shm_posixshm.<pid>.<counter>` and created
// exclusively; named regions use the caller's name and replace any
// existing object. Objects are created mode 0600 and unlinked on destroy.
// The contact token carries the shm name and the region length, the same
// shape as the file-mapping backend.

use std::ffi::CString;
use std::ptr::NonNull;

use crate::backend::{self, Backend, RegionState};
use crate::error::{Result, ShmError};
use crate::manager::ContactToken;

const DEFAULT_OPEN_MODE: libc::mode_t = 0o600;

pub(crate) struct PosixShmBackend {
    /// Name stem for anonymous regions, e.g. `/df_shm_posixshm.1234`.
    base_name: String,
    /// Suffix for the next anonymous region.
    counter: u32,
}

impl PosixShmBackend {
    pub(crate) fn new() -> Self {
        let pid = unsafe { libc::getpid() };
        Self {
            base_name: format!("/df_shm_posixshm.{pid}"),
            counter: 0,
        }
    }

    fn open_truncate_map(
        &self,
        name: String,
        oflag: libc::c_int,
        size: usize,
        hint: Option<NonNull<u8>>,
    ) -> Result<(RegionState, NonNull<u8>)> {
        let c_name = CString::new(name.clone())
            .map_err(|_| ShmError::InvalidArgument("shm name contains NUL"))?;

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), oflag, DEFAULT_OPEN_MODE as libc::c_uint) };
        if fd == -1 {
            return Err(ShmError::os("shm_open"));
        }

        if unsafe { libc::ftruncate(fd, size as libc::off_t) } == -1 {
            let err = ShmError::os("ftruncate");
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(err);
        }

        let addr = match backend::map_shared(fd, size, hint) {
            Ok(a) => a,
            Err(e) => {
                unsafe {
                    libc::close(fd);
                    libc::shm_unlink(c_name.as_ptr());
                }
                return Err(e);
            }
        };

        if unsafe { libc::close(fd) } == -1 {
            let err = ShmError::os("close");
            let _ = backend::unmap(addr, size);
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
            return Err(err);
        }

        log::debug!("POSIX shm region at {:p}, object {name}", addr.as_ptr());
        Ok((
            RegionState::PosixShm {
                name,
                file_len: size,
                addr,
                map_len: size,
            },
            addr,
        ))
    }
}

impl Backend for PosixShmBackend {
    fn create_region(
        &mut self,
        size: usize,
        hint: Option<NonNull<u8>>,
    ) -> Result<(RegionState, NonNull<u8>)> {
        let name = format!("{}.{}", self.base_name, self.counter);
        self.counter += 1;

        // The pid+counter name is unique to this process; exclusive
        // creation keeps a stale object from a crashed run from being
        // silently reused with the wrong size.
        self.open_truncate_map(name, libc::O_RDWR | libc::O_CREAT | libc::O_EXCL, size, hint)
    }

    fn create_named_region(
        &mut self,
        name: &[u8],
        size: usize,
        hint: Option<NonNull<u8>>,
    ) -> Result<(RegionState, NonNull<u8>)> {
        let mut name = std::str::from_utf8(name)
            .map_err(|_| ShmError::InvalidArgument("shm name is not valid UTF-8"))?
            .to_owned();
        if !name.starts_with('/') {
            name.insert(0, '/');
        }

        // A pre-existing object under this name is replaced.
        self.open_truncate_map(name, libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC, size, hint)
    }

    fn region_contact(&self, state: &RegionState) -> Result<ContactToken> {
        match state {
            RegionState::PosixShm { name, file_len, .. } => {
                Ok(backend::encode_name_contact(name, *file_len))
            }
            _ => Err(ShmError::InvalidState("region does not belong to the POSIX shm backend")),
        }
    }

    fn attach_region(
        &mut self,
        contact: &[u8],
        size: usize,
        hint: Option<NonNull<u8>>,
    ) -> Result<(RegionState, NonNull<u8>)> {
        let (name, file_len) = backend::decode_name_contact(contact)?;
        let c_name = CString::new(name)
            .map_err(|_| ShmError::BadContactToken("name contains NUL"))?;

        let fd = unsafe {
            libc::shm_open(c_name.as_ptr(), libc::O_RDWR, DEFAULT_OPEN_MODE as libc::c_uint)
        };
        if fd == -1 {
            return Err(ShmError::os("shm_open"));
        }

        let addr = match backend::map_shared(fd, size, hint) {
            Ok(a) => a,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };

        if unsafe { libc::close(fd) } == -1 {
            let err = ShmError::os("close");
            let _ = backend::unmap(addr, size);
            return Err(err);
        }

        Ok((
            RegionState::PosixShm {
                name: name.to_owned(),
                file_len,
                addr,
                map_len: size,
            },
            addr,
        ))
    }

    fn detach_region(&mut self, state: &RegionState) -> Result<()> {
        match state {
            RegionState::PosixShm { addr, map_len, .. } => backend::unmap(*addr, *map_len),
            _ => Err(ShmError::InvalidState("region does not belong to the POSIX shm backend")),
        }
    }

    fn destroy_region(&mut self, state: &RegionState) -> Result<()> {
        match state {
            RegionState::PosixShm {
                name,
                addr,
                map_len,
                ..
            } => {
                backend::unmap(*addr, *map_len)?;
                if let Ok(c_name) = CString::new(name.as_str()) {
                    if unsafe { libc::shm_unlink(c_name.as_ptr()) } == -1 {
                        log::warn!(
                            "shm_unlink of {name} failed: {}",
                            std::io::Error::last_os_error()
                        );
                    }
                }
                Ok(())
            }
            _ => Err(ShmError::InvalidState("region does not belong to the POSIX shm backend")),
        }
    }

    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}
