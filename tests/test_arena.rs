// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmarena contributors
//
// Arena lifecycle tests: configuration, create, join, teardown.

use shmarena::{Arena, ArenaConfig, ConfigCmd, HEADER_SIZE};

fn arena_at(dir: &tempfile::TempDir, size: usize, users: usize) -> (std::path::PathBuf, Arena) {
    let path = dir.path().join("arena");
    let mut cfg = ArenaConfig::new();
    cfg.init_size(size);
    cfg.max_locks(users);
    let arena = Arena::init(&path, &cfg).expect("init arena");
    (path, arena)
}

#[test]
fn config_defaults() {
    let cfg = ArenaConfig::new();
    assert_eq!(cfg.size(), 65536 + HEADER_SIZE);
    assert_eq!(cfg.users(), 8);
    assert_eq!(cfg.perms(), 0o700);
    assert_eq!(cfg.attach_hint(), 0);
}

#[test]
fn config_init_size_math() {
    let mut cfg = ArenaConfig::new();
    // payload rounded to 8, plus rounded header, plus the 8-byte sentinel
    let got = cfg.init_size(1000);
    let expect = ((1000 + 7) & !7) + ((HEADER_SIZE + 7) & !7) + 8;
    assert_eq!(got, expect & !7);
    assert_eq!(cfg.size(), got);

    // already-aligned request
    let got = cfg.init_size(1 << 20);
    assert_eq!(got, (1 << 20) + HEADER_SIZE + 8);
}

#[test]
fn config_command_surface() {
    let mut cfg = ArenaConfig::new();

    assert_eq!(cfg.configure(ConfigCmd::GetUsers), 8);
    assert_eq!(cfg.configure(ConfigCmd::InitUsers(4)), 8);
    assert_eq!(cfg.configure(ConfigCmd::GetUsers), 4);

    // zero users clamps to one semaphore
    cfg.configure(ConfigCmd::InitUsers(0));
    assert_eq!(cfg.configure(ConfigCmd::GetUsers), 1);

    let size = cfg.configure(ConfigCmd::InitSize(4096));
    assert_eq!(cfg.configure(ConfigCmd::GetSize), size);

    assert_eq!(cfg.configure(ConfigCmd::Chmod(0o600)), 0o700);
    assert_eq!(cfg.configure(ConfigCmd::Chmod(0o700)), 0o600);

    assert_eq!(cfg.configure(ConfigCmd::AttachAddr(0x7000_0000)), 0);
    assert_eq!(cfg.configure(ConfigCmd::AttachAddr(0)), 0x7000_0000);

    // compatibility commands: accepted, ignored
    assert_eq!(cfg.configure(ConfigCmd::LockType), -1);
    assert_eq!(cfg.configure(ConfigCmd::ArenaType), -1);
    assert_eq!(cfg.configure(ConfigCmd::AutoGrow), -1);
    assert_eq!(cfg.configure(ConfigCmd::AutoResv), -1);
    assert_eq!(cfg.configure(ConfigCmd::HistOn), -1);
    assert_eq!(cfg.configure(ConfigCmd::HistOff), -1);
    assert_eq!(cfg.configure(ConfigCmd::HistSize(128)), -1);
    assert_eq!(cfg.configure(ConfigCmd::HistFetch), -1);
    assert_eq!(cfg.configure(ConfigCmd::HistReset), -1);
    assert_eq!(cfg.configure(ConfigCmd::SThreadIoOn), -1);
    assert_eq!(cfg.configure(ConfigCmd::SThreadIoOff), -1);

    // Initialize resets everything
    cfg.configure(ConfigCmd::Initialize);
    assert_eq!(cfg.configure(ConfigCmd::GetSize), (65536 + HEADER_SIZE) as isize);
    assert_eq!(cfg.configure(ConfigCmd::GetUsers), 8);
}

#[test]
fn create_lays_out_region() {
    let dir = tempfile::tempdir().unwrap();
    let (path, arena) = arena_at(&dir, 1 << 20, 4);

    assert!(path.exists());
    assert_eq!(arena.max_locks(), 4);
    // region = file size minus the header prefix
    assert_eq!(arena.total_size(), (1 << 20) + 8);

    // the whole region is one free chunk behind the sentinel
    let usage = arena.memuse(4);
    assert_eq!(usage.free, arena.total_size() - 8);
    assert_eq!(usage.inuse, 8);

    arena.free_arena();
}

#[test]
fn join_imports_header() {
    let dir = tempfile::tempdir().unwrap();
    let (path, creator) = arena_at(&dir, 1 << 18, 4);

    // second init on the same path joins instead of creating
    let joiner = Arena::init(&path, &ArenaConfig::new()).expect("join");
    assert_eq!(joiner.total_size(), creator.total_size());
    assert_eq!(joiner.max_locks(), creator.max_locks());
    assert_eq!(joiner.ipc_key(), creator.ipc_key());

    drop(joiner);
    creator.free_arena();
}

#[test]
fn join_sees_creator_allocations() {
    let dir = tempfile::tempdir().unwrap();
    let (path, creator) = arena_at(&dir, 1 << 18, 2);

    let p = creator.malloc(100);
    assert!(!p.is_null());

    let joiner = Arena::init(&path, &ArenaConfig::new()).expect("join");
    let mine = joiner.memuse(4);
    let theirs = creator.memuse(4);
    assert_eq!(mine, theirs);
    assert_eq!(mine.inuse, 8 + 120);

    // an allocation through the joiner is visible to the creator
    let q = joiner.malloc(100);
    assert!(!q.is_null());
    assert_eq!(creator.memuse(4).inuse, 8 + 2 * 120);

    drop(joiner);
    creator.free_arena();
}

#[test]
fn file_survives_free_arena() {
    let dir = tempfile::tempdir().unwrap();
    let (path, arena) = arena_at(&dir, 4096, 1);
    arena.free_arena();
    // teardown destroys the semaphore set but leaves the file
    assert!(path.exists());
}

#[test]
fn detach_leaves_arena_alive() {
    let dir = tempfile::tempdir().unwrap();
    let (path, creator) = arena_at(&dir, 1 << 16, 2);

    let p = creator.malloc(64);
    assert!(!p.is_null());
    // plain drop unmaps without tearing down
    drop(creator);

    let joiner = Arena::init(&path, &ArenaConfig::new()).expect("rejoin after detach");
    assert_eq!(joiner.memuse(4).inuse, 8 + 80);
    joiner.free_arena();
}

#[test]
fn oversized_config_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("arena");
    let mut cfg = ArenaConfig::new();
    cfg.init_size(1 << 33);
    let err = Arena::init(&path, &cfg).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    assert!(!path.exists());
}

#[test]
fn tiny_config_clamped_to_minimum() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("arena");
    let mut cfg = ArenaConfig::new();
    cfg.init_size(0);
    let arena = Arena::init(&path, &cfg).expect("init minimal arena");

    // exactly one minimum chunk is available
    let p = arena.malloc(16);
    assert!(!p.is_null());
    assert!(arena.malloc(16).is_null());
    unsafe { arena.free(p) };
    arena.free_arena();
}

#[test]
fn arena_lock_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let (_path, arena) = arena_at(&dir, 1 << 16, 1);

    arena.arena_lock().expect("lock");
    arena.arena_unlock().expect("unlock");
    // unlock is idempotent
    arena.arena_unlock().expect("unlock again");
    // re-arming the lock leaves it acquirable
    arena.arena_lock_init().expect("lock init");
    arena.arena_lock().expect("relock");
    arena.arena_unlock().expect("final unlock");

    arena.free_arena();
}
