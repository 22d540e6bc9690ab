// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Two-process ping-pong over a shared memory region.
//
// Usage:
//   demo_pingpong [mmap|sysv|posix] [num_msgs]
//
// The parent creates a region holding a small locator header plus two SPSC
// queues (one per direction), forks, and ships the region's contact token
// to the child over a pipe — the out-of-band bootstrap channel. The child
// attaches the region, locates the queues from the header offsets, and the
// two processes exchange `num_msgs` messages in each direction.
//
// Region layout (all locations as offsets, never pointers — the child maps
// the region at a different address):
//   u64  creator pid
//   u64  offset of the parent->child queue
//   u64  offset of the child->parent queue
//   ...  the two queues, each cache-line aligned

use df_shm::config::{align_up, CACHE_LINE_SIZE, PAGE_SIZE};
use df_shm::{calculate_queue_size, BackendKind, ContactToken, ShmManager, ShmQueue};

const NUM_SLOTS: u32 = 5;
const MAX_PAYLOAD: usize = 2048;
const MSG_SIZE: usize = 16;
const HEADER_WORDS: usize = 3;

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let kind = match args.get(1).map(String::as_str) {
        None | Some("mmap") => BackendKind::FileMapping,
        Some("sysv") => BackendKind::SysV,
        Some("posix") => BackendKind::PosixShm,
        Some(other) => {
            eprintln!("unknown backend: {other}");
            eprintln!("usage: demo_pingpong [mmap|sysv|posix] [num_msgs]");
            std::process::exit(1);
        }
    };
    let num_msgs: u64 = args
        .get(2)
        .map(|s| s.parse().expect("num_msgs"))
        .unwrap_or(1_000_000);

    // The pipe carries the contact token from creator to attacher.
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        panic!("pipe: {}", std::io::Error::last_os_error());
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);

    match unsafe { libc::fork() } {
        -1 => panic!("fork: {}", std::io::Error::last_os_error()),
        0 => {
            unsafe { libc::close(write_fd) };
            child(kind, read_fd, num_msgs);
        }
        pid => {
            unsafe { libc::close(read_fd) };
            parent(kind, write_fd, num_msgs);
            let mut status = 0;
            unsafe { libc::waitpid(pid, &mut status, 0) };
            std::process::exit(if status == 0 { 0 } else { 1 });
        }
    }
}

fn parent(kind: BackendKind, token_fd: i32, num_msgs: u64) {
    let mut mgr = ShmManager::new(kind).expect("init manager");

    let queue_size = calculate_queue_size(NUM_SLOTS, MAX_PAYLOAD);
    let header_size = align_up(HEADER_WORDS * 8, CACHE_LINE_SIZE);
    let region_size = align_up(header_size + 2 * queue_size + CACHE_LINE_SIZE, PAGE_SIZE);

    let rid = mgr.create(region_size, None).expect("create region");
    let region = mgr.region(rid).expect("region handle");

    let out_offset = header_size;
    let back_offset = align_up(out_offset + queue_size, CACHE_LINE_SIZE);

    // Locator header: creator pid + the two queue offsets.
    unsafe {
        let words = region.as_ptr() as *mut u64;
        words.write(libc::getpid() as u64);
        words.add(1).write(out_offset as u64);
        words.add(2).write(back_offset as u64);
    }

    let out_q = ShmQueue::create_in(region, out_offset, NUM_SLOTS, MAX_PAYLOAD).expect("out queue");
    let back_q =
        ShmQueue::create_in(region, back_offset, NUM_SLOTS, MAX_PAYLOAD).expect("back queue");
    let mut tx = out_q.sender().expect("sender");
    let mut rx = back_q.receiver().expect("receiver");

    let token = mgr.contact(rid).expect("contact token");
    send_token(token_fd, &token, region_size);
    unsafe { libc::close(token_fd) };

    let payload = [b'a'; MSG_SIZE];
    let expect = [b'b'; MSG_SIZE];
    let start = std::time::Instant::now();
    for _ in 0..num_msgs {
        tx.enqueue(&payload).expect("enqueue");
    }
    for _ in 0..num_msgs {
        let msg = rx.dequeue();
        assert_eq!(msg.len(), MSG_SIZE, "parent: bad length");
        assert_eq!(&*msg, &expect[..], "parent: bad payload");
    }
    let elapsed = start.elapsed();
    println!(
        "parent: {num_msgs} msgs each way in {elapsed:?} ({:.0} msgs/s)",
        2.0 * num_msgs as f64 / elapsed.as_secs_f64()
    );

    drop(tx);
    drop(rx);
    out_q.destroy();
    back_q.destroy();

    mgr.destroy(rid).expect("destroy region");
    mgr.finalize().expect("finalize");
}

fn child(kind: BackendKind, token_fd: i32, num_msgs: u64) {
    let (token, region_size) = recv_token(token_fd);
    unsafe { libc::close(token_fd) };

    let mut mgr = ShmManager::new(kind).expect("init manager");
    let rid = mgr
        .attach(None, &token, region_size, None)
        .expect("attach region");
    let region = mgr.region(rid).expect("region handle");

    let (creator_pid, out_offset, back_offset) = unsafe {
        let words = region.as_ptr() as *const u64;
        (words.read(), words.add(1).read(), words.add(2).read())
    };
    log::debug!("child: creator pid {creator_pid}, queues at {out_offset}/{back_offset}");

    // Mirror image of the parent: receive on its out queue, send on the
    // back queue.
    let out_q = ShmQueue::open_in(region, out_offset as usize).expect("open out queue");
    let back_q = ShmQueue::open_in(region, back_offset as usize).expect("open back queue");
    let mut rx = out_q.receiver().expect("receiver");
    let mut tx = back_q.sender().expect("sender");

    let expect = [b'a'; MSG_SIZE];
    for _ in 0..num_msgs {
        let msg = rx.dequeue();
        assert_eq!(msg.len(), MSG_SIZE, "child: bad length");
        assert_eq!(&*msg, &expect[..], "child: bad payload");
    }
    let payload = [b'b'; MSG_SIZE];
    for _ in 0..num_msgs {
        tx.enqueue(&payload).expect("enqueue");
    }

    drop(rx);
    drop(tx);
    mgr.detach(rid).expect("detach region");
    mgr.finalize().expect("finalize");
    std::process::exit(0);
}

// ---------------------------------------------------------------------------
// Token exchange over the pipe: token length, token bytes, region size.
// ---------------------------------------------------------------------------

fn send_token(fd: i32, token: &ContactToken, region_size: usize) {
    write_all(fd, &(token.len() as u64).to_ne_bytes());
    write_all(fd, token.as_bytes());
    write_all(fd, &(region_size as u64).to_ne_bytes());
}

fn recv_token(fd: i32) -> (ContactToken, usize) {
    let mut len = [0u8; 8];
    read_all(fd, &mut len);
    let mut token = vec![0u8; u64::from_ne_bytes(len) as usize];
    read_all(fd, &mut token);
    let mut size = [0u8; 8];
    read_all(fd, &mut size);
    (
        ContactToken::from_bytes(&token),
        u64::from_ne_bytes(size) as usize,
    )
}

fn write_all(fd: i32, buf: &[u8]) {
    let mut off = 0;
    while off < buf.len() {
        let n = unsafe { libc::write(fd, buf[off..].as_ptr().cast(), buf.len() - off) };
        if n <= 0 {
            panic!("pipe write: {}", std::io::Error::last_os_error());
        }
        off += n as usize;
    }
}

fn read_all(fd: i32, buf: &mut [u8]) {
    let mut off = 0;
    while off < buf.len() {
        let n = unsafe { libc::read(fd, buf[off..].as_mut_ptr().cast(), buf.len() - off) };
        if n <= 0 {
            panic!("pipe read: {}", std::io::Error::last_os_error());
        }
        off += n as usize;
    }
}
