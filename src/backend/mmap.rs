// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared memory backed by a mmap()-ed file.
//
// Anonymous regions get a unique backing file from mkstemp() under the
// system temp directory (template `df_shm_mmap.<pid>.XXXXXX`, mode 0600).
// Named regions use a caller-supplied path, truncating whatever is there.
// The contact token carries the file path and the region length.

use std::ffi::CString;
use std::ptr::NonNull;

use crate::backend::{self, Backend, RegionState};
use crate::error::{Result, ShmError};
use crate::manager::ContactToken;

const DEFAULT_OPEN_MODE: libc::mode_t = 0o600;

pub(crate) struct MmapBackend {
    /// mkstemp() template, e.g. `/tmp/df_shm_mmap.1234.XXXXXX`.
    base_template: String,
}

impl MmapBackend {
    pub(crate) fn new() -> Self {
        let pid = unsafe { libc::getpid() };
        let base_template = std::env::temp_dir()
            .join(format!("df_shm_mmap.{pid}.XXXXXX"))
            .to_string_lossy()
            .into_owned();
        Self { base_template }
    }

    /// Size the freshly created backing file, map it, and close the
    /// descriptor (not needed once the mapping exists). On failure the
    /// file is removed again so nothing half-built is left behind.
    fn truncate_map_close(
        &self,
        fd: libc::c_int,
        path: String,
        size: usize,
        hint: Option<NonNull<u8>>,
    ) -> Result<(RegionState, NonNull<u8>)> {
        let unlink_backing = |p: &str| {
            if let Ok(c) = CString::new(p) {
                unsafe { libc::unlink(c.as_ptr()) };
            }
        };

        if unsafe { libc::ftruncate(fd, size as libc::off_t) } == -1 {
            let err = ShmError::os("ftruncate");
            unsafe { libc::close(fd) };
            unlink_backing(&path);
            return Err(err);
        }

        let addr = match backend::map_shared(fd, size, hint) {
            Ok(a) => a,
            Err(e) => {
                unsafe { libc::close(fd) };
                unlink_backing(&path);
                return Err(e);
            }
        };

        if unsafe { libc::close(fd) } == -1 {
            let err = ShmError::os("close");
            let _ = backend::unmap(addr, size);
            unlink_backing(&path);
            return Err(err);
        }

        log::debug!("file-mapping region at {:p}, backing file {path}", addr.as_ptr());
        Ok((
            RegionState::FileMap {
                path,
                file_len: size,
                addr,
                map_len: size,
            },
            addr,
        ))
    }
}

impl Backend for MmapBackend {
    fn create_region(
        &mut self,
        size: usize,
        hint: Option<NonNull<u8>>,
    ) -> Result<(RegionState, NonNull<u8>)> {
        // mkstemp rewrites the XXXXXX suffix in place and creates the file
        // exclusively with mode 0600.
        let mut template = self.base_template.clone().into_bytes();
        template.push(0);
        let fd = unsafe { libc::mkstemp(template.as_mut_ptr() as *mut libc::c_char) };
        if fd == -1 {
            return Err(ShmError::os("mkstemp"));
        }
        template.pop();
        let path = String::from_utf8(template)
            .expect("mkstemp only replaces ASCII placeholder characters");

        self.truncate_map_close(fd, path, size, hint)
    }

    fn create_named_region(
        &mut self,
        name: &[u8],
        size: usize,
        hint: Option<NonNull<u8>>,
    ) -> Result<(RegionState, NonNull<u8>)> {
        let path = std::str::from_utf8(name)
            .map_err(|_| ShmError::InvalidArgument("backing file path is not valid UTF-8"))?
            .to_owned();
        let c_path = CString::new(path.clone())
            .map_err(|_| ShmError::InvalidArgument("backing file path contains NUL"))?;

        // A pre-existing file at this path is truncated and reused.
        let fd = unsafe {
            libc::open(
                c_path.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC,
                DEFAULT_OPEN_MODE as libc::c_uint,
            )
        };
        if fd == -1 {
            return Err(ShmError::os("open"));
        }

        self.truncate_map_close(fd, path, size, hint)
    }

    fn region_contact(&self, state: &RegionState) -> Result<ContactToken> {
        match state {
            RegionState::FileMap { path, file_len, .. } => {
                Ok(backend::encode_name_contact(path, *file_len))
            }
            _ => Err(ShmError::InvalidState("region does not belong to the file-mapping backend")),
        }
    }

    fn attach_region(
        &mut self,
        contact: &[u8],
        size: usize,
        hint: Option<NonNull<u8>>,
    ) -> Result<(RegionState, NonNull<u8>)> {
        let (path, file_len) = backend::decode_name_contact(contact)?;
        let c_path = CString::new(path)
            .map_err(|_| ShmError::BadContactToken("path contains NUL"))?;

        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR) };
        if fd == -1 {
            return Err(ShmError::os("open"));
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
            RegionState::FileMap {
                path: path.to_owned(),
                file_len,
                addr,
                map_len: size,
            },
            addr,
        ))
    }

    fn detach_region(&mut self, state: &RegionState) -> Result<()> {
        match state {
            RegionState::FileMap { addr, map_len, .. } => backend::unmap(*addr, *map_len),
            _ => Err(ShmError::InvalidState("region does not belong to the file-mapping backend")),
        }
    }

    fn destroy_region(&mut self, state: &RegionState) -> Result<()> {
        match state {
            RegionState::FileMap {
                path,
                addr,
                map_len,
                ..
            } => {
                backend::unmap(*addr, *map_len)?;
                // The mapping is already gone; a failed unlink leaks the
                // backing file but cannot be undone.
                if let Ok(c_path) = CString::new(path.as_str()) {
                    if unsafe { libc::unlink(c_path.as_ptr()) } == -1 {
                        log::warn!(
                            "unlink of backing file {path} failed: {}",
                            std::io::Error::last_os_error()
                        );
                    }
                }
                Ok(())
            }
            _ => Err(ShmError::InvalidState("region does not belong to the file-mapping backend")),
        }
    }

    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}
