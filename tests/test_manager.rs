// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Manager bookkeeping tests: the created/foreign list split, ownership
// discipline on destroy, named regions, argument validation, finalize.

use std::sync::{Mutex, MutexGuard, OnceLock};

use df_shm::{BackendKind, ContactToken, ShmError, ShmManager};

fn sysv_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

#[test]
fn created_and_foreign_lists_are_separate() {
    let mut creator = ShmManager::new(BackendKind::FileMapping).expect("creator");
    let mut peer = ShmManager::new(BackendKind::FileMapping).expect("peer");

    assert_eq!(creator.created_regions(), 0);
    assert_eq!(creator.foreign_regions(), 0);

    let a = creator.create(4096, None).expect("create a");
    let b = creator.create(4096, None).expect("create b");
    assert_eq!(creator.created_regions(), 2);
    assert_eq!(creator.foreign_regions(), 0);

    let token = creator.contact(a).expect("token");
    let fa = peer.attach(None, &token, 4096, None).expect("attach");
    assert_eq!(peer.created_regions(), 0);
    assert_eq!(peer.foreign_regions(), 1);

    peer.detach(fa).expect("detach");
    assert_eq!(peer.foreign_regions(), 0);

    creator.destroy(a).expect("destroy a");
    assert_eq!(creator.created_regions(), 1);
    creator.destroy(b).expect("destroy b");
    assert_eq!(creator.created_regions(), 0);
}

#[test]
fn destroy_by_non_creator_degrades_to_detach() {
    let mut creator = ShmManager::new(BackendKind::FileMapping).expect("creator");
    let mut peer = ShmManager::new(BackendKind::FileMapping).expect("peer");

    let rid = creator.create(4096, None).expect("create");
    let token = creator.contact(rid).expect("token");

    let fa = peer.attach(None, &token, 4096, None).expect("attach");
    // "destroy" from the attacher side only unmaps.
    peer.destroy(fa).expect("destroy degrades");
    assert_eq!(peer.foreign_regions(), 0);

    // The OS object survived: attaching again still works.
    let fa2 = peer.attach(None, &token, 4096, None).expect("re-attach");
    peer.detach(fa2).expect("detach");

    // The real destroy by the creator removes it.
    creator.destroy(rid).expect("destroy");
    assert!(peer.attach(None, &token, 4096, None).is_err());
}

#[test]
fn unknown_ids_are_rejected() {
    let mut a = ShmManager::new(BackendKind::FileMapping).expect("a");
    let mut b = ShmManager::new(BackendKind::FileMapping).expect("b");

    let rid = a.create(4096, None).expect("create");

    // Another manager never saw this id.
    assert!(matches!(b.destroy(rid), Err(ShmError::UnknownRegion)));
    assert!(matches!(b.contact(rid), Err(ShmError::UnknownRegion)));
    assert!(b.region(rid).is_none());

    // Detach of a self-created region: it is not on the foreign list.
    assert!(matches!(a.detach(rid), Err(ShmError::InvalidState(_))));

    a.destroy(rid).expect("destroy");
    // Stale id after destroy.
    assert!(matches!(a.destroy(rid), Err(ShmError::UnknownRegion)));
}

#[test]
fn zero_size_is_invalid() {
    let mut mgr = ShmManager::new(BackendKind::FileMapping).expect("manager");
    assert!(matches!(
        mgr.create(0, None),
        Err(ShmError::InvalidArgument(_))
    ));
    assert!(matches!(
        mgr.create_named(b"/tmp/df_shm_zero_size_test", 0, None),
        Err(ShmError::InvalidArgument(_))
    ));
    let token = ContactToken::from_bytes(b"bogus\0\0\0\0\0\0\0\0\0");
    assert!(matches!(
        mgr.attach(None, &token, 0, None),
        Err(ShmError::InvalidArgument(_))
    ));
}

#[test]
fn malformed_tokens_are_rejected() {
    let mut mgr = ShmManager::new(BackendKind::FileMapping).expect("manager");

    // No NUL terminator at all.
    let token = ContactToken::from_bytes(b"no-terminator");
    assert!(matches!(
        mgr.attach(None, &token, 4096, None),
        Err(ShmError::BadContactToken(_))
    ));

    // Terminator but a truncated size field.
    let token = ContactToken::from_bytes(b"/tmp/x\0\x01\x02");
    assert!(matches!(
        mgr.attach(None, &token, 4096, None),
        Err(ShmError::BadContactToken(_))
    ));
}

#[test]
fn named_region_file_mapping() {
    let pid = unsafe { libc::getpid() };
    let path = std::env::temp_dir().join(format!("df_shm_named_test.{pid}"));
    let name = path.to_str().expect("utf-8 path").as_bytes().to_vec();

    let mut creator = ShmManager::new(BackendKind::FileMapping).expect("creator");
    let mut peer = ShmManager::new(BackendKind::FileMapping).expect("peer");

    let rid = creator.create_named(&name, 4096, None).expect("create named");
    let region = creator.region(rid).expect("region");
    unsafe { region.as_ptr().write(0x5A) };

    // The name is the rendezvous: no token exchange needed.
    let fa = peer.attach_named(&name, 4096, None).expect("attach named");
    let attached = peer.region(fa).expect("attached");
    assert_eq!(attached.creator_pid(), None);
    assert_eq!(unsafe { attached.as_ptr().read() }, 0x5A);

    peer.detach(fa).expect("detach");
    creator.destroy(rid).expect("destroy");
    assert!(!path.exists());
}

#[test]
fn named_region_posix_shm() {
    let pid = unsafe { libc::getpid() };
    let name = format!("/df_shm_named_test.{pid}");

    let mut creator = ShmManager::new(BackendKind::PosixShm).expect("creator");
    let mut peer = ShmManager::new(BackendKind::PosixShm).expect("peer");

    let rid = creator
        .create_named(name.as_bytes(), 4096, None)
        .expect("create named");
    unsafe { creator.region(rid).expect("region").as_ptr().write(0x77) };

    let fa = peer
        .attach_named(name.as_bytes(), 4096, None)
        .expect("attach named");
    assert_eq!(unsafe { peer.region(fa).expect("region").as_ptr().read() }, 0x77);

    peer.detach(fa).expect("detach");
    creator.destroy(rid).expect("destroy");
}

#[test]
fn named_region_sysv_key() {
    let _guard = sysv_lock();

    let mut creator = ShmManager::new(BackendKind::SysV).expect("creator");
    let mut peer = ShmManager::new(BackendKind::SysV).expect("peer");

    // A SysV region's name is its key, as native bytes.
    let pid = unsafe { libc::getpid() };
    let key: libc::key_t = (pid as libc::key_t) << 8 | 0x5D;
    let name = key.to_ne_bytes();

    let rid = creator.create_named(&name, 4096, None).expect("create named");
    unsafe { creator.region(rid).expect("region").as_ptr().write(0x33) };

    // Exclusive creation: the same key cannot be created twice.
    assert!(creator.create_named(&name, 4096, None).is_err());

    let fa = peer.attach_named(&name, 4096, None).expect("attach named");
    assert_eq!(unsafe { peer.region(fa).expect("region").as_ptr().read() }, 0x33);

    peer.detach(fa).expect("detach");
    creator.destroy(rid).expect("destroy");
}

#[test]
fn sysv_name_must_be_a_key() {
    let _guard = sysv_lock();

    let mut mgr = ShmManager::new(BackendKind::SysV).expect("manager");
    assert!(matches!(
        mgr.create_named(b"not-a-key", 4096, None),
        Err(ShmError::InvalidArgument(_))
    ));
}

#[test]
fn finalize_cleans_up_leftovers() {
    let mut creator = ShmManager::new(BackendKind::FileMapping).expect("creator");

    let rid = creator.create(4096, None).expect("create");
    let token = creator.contact(rid).expect("token");
    let bytes = token.as_bytes();
    let nul = bytes.iter().position(|&b| b == 0).expect("terminator");
    let path = std::str::from_utf8(&bytes[..nul]).expect("path").to_owned();
    assert!(std::path::Path::new(&path).exists());

    // Regions left behind are destroyed by finalize.
    creator.finalize().expect("finalize");
    assert!(!std::path::Path::new(&path).exists());
}

#[test]
fn sysv_finalize_removes_key_seed() {
    let _guard = sysv_lock();

    let pid = unsafe { libc::getpid() };
    let seed = std::env::temp_dir().join(format!("df_shm_sysv.{pid}"));

    let mgr = ShmManager::new(BackendKind::SysV).expect("manager");
    assert!(seed.exists(), "seed file should exist while the manager lives");
    mgr.finalize().expect("finalize");
    assert!(!seed.exists(), "seed file should be unlinked at finalize");
}

#[test]
fn backend_kind_is_recorded() {
    let mgr = ShmManager::new(BackendKind::PosixShm).expect("manager");
    assert_eq!(mgr.backend_kind(), BackendKind::PosixShm);
}
