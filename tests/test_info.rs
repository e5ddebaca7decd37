// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmarena contributors
//
// Info-slot tests: publish/read round trips, cross-handle visibility, and
// the compare-and-set election used to pick a single initializer.

use std::ptr;
use std::sync::Mutex;

use shmarena::{Arena, ArenaConfig};

fn arena_pair() -> (tempfile::TempDir, Arena, Arena) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("arena");
    let mut cfg = ArenaConfig::new();
    cfg.init_size(1 << 18);
    cfg.max_locks(8);
    let creator = Arena::init(&path, &cfg).expect("create");
    let joiner = Arena::init(&path, &ArenaConfig::new()).expect("join");
    (dir, creator, joiner)
}

#[test]
fn put_get_roundtrip() {
    let (_dir, a, joiner) = arena_pair();
    drop(joiner);

    assert!(a.get_info().unwrap().is_null());

    let p = a.malloc(64);
    unsafe { a.put_info(p).unwrap() };
    assert_eq!(a.get_info().unwrap(), p);

    // put(get()) is the identity
    let got = a.get_info().unwrap();
    unsafe { a.put_info(got).unwrap() };
    assert_eq!(a.get_info().unwrap(), p);

    unsafe { a.put_info(ptr::null_mut()).unwrap() };
    assert!(a.get_info().unwrap().is_null());

    unsafe { a.free(p) };
    a.free_arena();
}

#[test]
fn get_reads_shared_value_across_handles() {
    let (_dir, creator, joiner) = arena_pair();

    let p = creator.malloc(32);
    unsafe {
        ptr::copy_nonoverlapping(b"hello arena".as_ptr(), p, 11);
        creator.put_info(p).unwrap();
    }

    // the joiner resolves the same chunk in its own mapping; the bytes must
    // match even if the two mappings landed at different addresses
    let q = joiner.get_info().unwrap();
    assert!(!q.is_null());
    let seen = unsafe { std::slice::from_raw_parts(q, 11) };
    assert_eq!(seen, b"hello arena");

    // a later publication through the joiner is what the creator reads next
    let r = joiner.malloc(32);
    unsafe {
        *r = 0x5A;
        joiner.put_info(r).unwrap();
    }
    let back = creator.get_info().unwrap();
    assert!(!back.is_null());
    assert_eq!(unsafe { *back }, 0x5A);

    drop(joiner);
    creator.free_arena();
}

#[test]
fn cas_returns_predecessor() {
    let (_dir, a, joiner) = arena_pair();
    drop(joiner);

    let p1 = a.malloc(32);
    let p2 = a.malloc(32);

    let old = unsafe { a.cas_info(p1).unwrap() };
    assert!(old.is_null());
    let old = unsafe { a.cas_info(p2).unwrap() };
    assert_eq!(old, p1);
    let old = unsafe { a.cas_info(ptr::null_mut()).unwrap() };
    assert_eq!(old, p2);
    assert!(a.get_info().unwrap().is_null());

    unsafe {
        a.free(p1);
        a.free(p2);
    }
    a.free_arena();
}

// Scenario: 8 concurrent cas callers; exactly one sees the empty slot, the
// rest see a predecessor, and get_info afterwards returns the last writer.
#[test]
fn cas_race_single_null_observer() {
    let (_dir, a, joiner) = arena_pair();
    drop(joiner);

    let observed: Mutex<Vec<(usize, usize)>> = Mutex::new(Vec::new());

    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                let mine = a.malloc(48);
                assert!(!mine.is_null());
                let old = unsafe { a.cas_info(mine).unwrap() };
                observed
                    .lock()
                    .unwrap()
                    .push((old as usize, mine as usize));
            });
        }
    });

    let observed = observed.into_inner().unwrap();
    assert_eq!(observed.len(), 8);

    let nulls = observed.iter().filter(|&&(old, _)| old == 0).count();
    assert_eq!(nulls, 1, "exactly one caller sees the empty slot");

    // the predecessors chain: every observed old value is another caller's
    // pointer (or null), each at most once
    let mine: Vec<usize> = observed.iter().map(|&(_, m)| m).collect();
    let mut olds: Vec<usize> = observed.iter().map(|&(o, _)| o).filter(|&o| o != 0).collect();
    olds.sort_unstable();
    olds.dedup();
    assert_eq!(olds.len(), 7, "predecessors are distinct");
    assert!(olds.iter().all(|o| mine.contains(o)));

    // the final value is the one pointer nobody observed as a predecessor
    let last = a.get_info().unwrap() as usize;
    assert!(mine.contains(&last));
    assert!(!olds.contains(&last));

    a.free_arena();
}

// Scenario: two joiners race to initialize a shared record. Each allocates
// a candidate and swaps it in; the loser restores the winner's record and
// frees its own allocation.
#[test]
fn initializer_election() {
    let (_dir, a, joiner) = arena_pair();

    let results: Mutex<Vec<bool>> = Mutex::new(Vec::new());

    std::thread::scope(|s| {
        let results = &results;
        for handle in [&a, &joiner] {
            s.spawn(move || {
                let candidate = handle.calloc(1, 64);
                assert!(!candidate.is_null());
                let old = unsafe { handle.cas_info(candidate).unwrap() };
                let won = old.is_null();
                if !won {
                    // lost the election: reinstate the winner's record and
                    // drop the candidate
                    unsafe {
                        handle.cas_info(old).unwrap();
                        handle.free(candidate);
                    }
                }
                results.lock().unwrap().push(won);
            });
        }
    });

    let results = results.into_inner().unwrap();
    assert_eq!(results.iter().filter(|&&w| w).count(), 1, "one winner");

    // the surviving record is the winner's candidate, visible to both
    let from_a = a.get_info().unwrap();
    let from_j = joiner.get_info().unwrap();
    assert!(!from_a.is_null());
    assert!(!from_j.is_null());

    drop(joiner);
    a.free_arena();
}
