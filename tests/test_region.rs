// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Region lifecycle tests, run once per backend: create, mirror through a
// second manager standing in for the peer process, detach, destroy.
//
// SysV managers in one process share the per-pid ftok seed file, so the
// SysV cases are serialized behind a lock.

use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, OnceLock};

use df_shm::config::PAGE_SIZE;
use df_shm::{calculate_queue_size, BackendKind, ShmManager, ShmQueue};

fn sysv_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

fn guard_for(kind: BackendKind) -> Option<MutexGuard<'static, ()>> {
    matches!(kind, BackendKind::SysV).then(sysv_lock)
}

/// The S1 shape: A creates and writes, B attaches and mirrors, B detaches,
/// A destroys. Both "processes" are managers in this process; the attach
/// path is identical.
fn create_attach_roundtrip(kind: BackendKind) {
    let _guard = guard_for(kind);

    let mut creator = ShmManager::new(kind).expect("creator manager");
    let mut peer = ShmManager::new(kind).expect("peer manager");

    let rid = creator.create(4096, None).expect("create region");
    let region = creator.region(rid).expect("region handle");
    assert_eq!(region.len(), 4096);
    unsafe { region.as_ptr().write(0xAB) };

    let token = creator.contact(rid).expect("contact token");

    let my_pid = unsafe { libc::getpid() };
    let arid = peer
        .attach(Some(my_pid), &token, 4096, None)
        .expect("attach region");
    let attached = peer.region(arid).expect("attached handle");
    assert_eq!(attached.len(), 4096);
    assert_eq!(attached.creator_pid(), Some(my_pid));

    // Byte content mirrors in both directions.
    assert_eq!(unsafe { attached.as_ptr().read() }, 0xAB);
    unsafe { attached.as_ptr().add(1).write(0xCD) };
    assert_eq!(unsafe { region.as_ptr().add(1).read() }, 0xCD);

    peer.detach(arid).expect("detach");
    creator.destroy(rid).expect("destroy");
}

#[test]
fn roundtrip_file_mapping() {
    create_attach_roundtrip(BackendKind::FileMapping);
}

#[test]
fn roundtrip_sysv() {
    create_attach_roundtrip(BackendKind::SysV);
}

#[test]
fn roundtrip_posix_shm() {
    create_attach_roundtrip(BackendKind::PosixShm);
}

/// Queues built inside a region work through an attached mapping the same
/// way they do through the creator's: the S2/S4 flow collapsed into one
/// process, once per backend.
fn queue_through_attached_region(kind: BackendKind) {
    let _guard = guard_for(kind);

    const SLOTS: u32 = 4;
    const PAYLOAD: usize = 256;

    let mut creator = ShmManager::new(kind).expect("creator manager");
    let mut peer = ShmManager::new(kind).expect("peer manager");

    let size = calculate_queue_size(SLOTS, PAYLOAD);
    let rid = creator.create(size, None).expect("create region");
    let token = creator.contact(rid).expect("token");
    let arid = peer.attach(None, &token, size, None).expect("attach");

    let region = creator.region(rid).expect("region");
    let attached = peer.region(arid).expect("attached");

    let q = ShmQueue::create_in(region, 0, SLOTS, PAYLOAD).expect("create queue");
    let peer_q = ShmQueue::open_in(attached, 0).expect("open queue");
    assert_eq!(peer_q.max_slots(), SLOTS);
    assert_eq!(peer_q.max_payload(), PAYLOAD);

    let mut tx = q.sender().expect("sender");
    let mut rx = peer_q.receiver().expect("receiver");

    // Fill the ring through one mapping, drain it through the other.
    for i in 0..SLOTS {
        tx.enqueue(&[i as u8; 9]).expect("enqueue");
    }
    assert!(!tx.is_enqueue_possible());
    for i in 0..SLOTS {
        let msg = rx.dequeue();
        assert_eq!(&*msg, &[i as u8; 9]);
    }
    assert!(tx.is_enqueue_possible());

    drop(tx);
    drop(rx);
    peer.detach(arid).expect("detach");
    creator.destroy(rid).expect("destroy");
}

#[test]
fn queue_parity_file_mapping() {
    queue_through_attached_region(BackendKind::FileMapping);
}

#[test]
fn queue_parity_sysv() {
    queue_through_attached_region(BackendKind::SysV);
}

#[test]
fn queue_parity_posix_shm() {
    queue_through_attached_region(BackendKind::PosixShm);
}

#[test]
fn sizes_round_up_to_pages() {
    let mut mgr = ShmManager::new(BackendKind::FileMapping).expect("manager");
    let rid = mgr.create(100, None).expect("create");
    assert_eq!(mgr.region(rid).expect("region").len(), PAGE_SIZE);

    let rid2 = mgr.create(PAGE_SIZE + 1, None).expect("create");
    assert_eq!(mgr.region(rid2).expect("region").len(), 2 * PAGE_SIZE);
}

#[test]
fn backing_file_removed_on_destroy() {
    let mut mgr = ShmManager::new(BackendKind::FileMapping).expect("manager");
    let rid = mgr.create(4096, None).expect("create");
    let token = mgr.contact(rid).expect("token");

    // The token leads with the NUL-terminated backing file path.
    let bytes = token.as_bytes();
    let nul = bytes.iter().position(|&b| b == 0).expect("terminator");
    let path = std::str::from_utf8(&bytes[..nul]).expect("utf-8 path");
    assert!(std::path::Path::new(path).exists(), "backing file should exist");

    mgr.destroy(rid).expect("destroy");
    assert!(
        !std::path::Path::new(path).exists(),
        "backing file should be gone after destroy"
    );
}

#[test]
fn offset_translation_is_symmetric() {
    let mut mgr = ShmManager::new(BackendKind::FileMapping).expect("manager");
    let rid = mgr.create(2 * PAGE_SIZE, None).expect("create");
    let region = mgr.region(rid).expect("region");

    let p = region.at_offset(123);
    assert_eq!(region.offset_of(p), 123);
    assert_eq!(region.at_offset(0), region.as_ptr());
}

#[test]
fn placement_hint_is_best_effort() {
    // Map, remember where the OS put it, tear down, then re-create with
    // that address as the hint. The OS is free to refuse; the call must
    // still succeed either way.
    let mut mgr = ShmManager::new(BackendKind::FileMapping).expect("manager");
    let rid = mgr.create(PAGE_SIZE, None).expect("create");
    let addr = mgr.region(rid).expect("region").as_ptr();
    mgr.destroy(rid).expect("destroy");

    let hint = NonNull::new(addr);
    let rid2 = mgr.create(PAGE_SIZE, hint).expect("create with hint");
    assert!(!mgr.region(rid2).expect("region").as_ptr().is_null());
    mgr.destroy(rid2).expect("destroy");
}
