// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmarena contributors
//
// Named locks backed by the arena's semaphore set.
//
// Each lock is one slot in [0, max_locks). A slot holds SEM_UNUSED when
// unallocated, 0 when idle, and 1 while held. Acquisition is a single
// atomic wait-for-zero-then-increment with SEM_UNDO, so the kernel releases
// a dead holder's locks. The lock's identity record lives inside the arena
// itself, which lets one process hand a lock to another through the shared
// info slot.

use std::io;
use std::mem;
use std::ptr;

use crate::arena::Arena;
use crate::platform::posix::{self, SemWait, SEM_UNUSED};

/// Bound on EAGAIN retries before a blocking acquisition reports failure.
pub(crate) const EAGAIN_MAX: u32 = 10;

/// Shared acquisition loop: interrupts retry forever, spurious EAGAIN in
/// blocking mode retries up to [`EAGAIN_MAX`] times. Returns whether the
/// slot was acquired.
pub(crate) fn acquire_with_retry(semid: i32, slot: usize, blocking: bool) -> io::Result<bool> {
    let mut eagain = 0u32;
    loop {
        match posix::sem_acquire_once(semid, slot, blocking)? {
            SemWait::Ok => return Ok(true),
            SemWait::Interrupted => continue,
            SemWait::WouldBlock => {
                if !blocking {
                    return Ok(false);
                }
                eagain += 1;
                if eagain > EAGAIN_MAX {
                    return Ok(false);
                }
            }
        }
    }
}

/// In-arena identity of a named lock: enough for any attacher to rebuild a
/// handle from the record alone.
#[repr(C)]
struct LockRecord {
    slot: u64,
    semid: i64,
    max_locks: u64,
}

/// A named cross-process lock.
///
/// Obtained from [`Arena::new_lock`], or rebuilt from a shared record with
/// [`Lock::from_payload`]. Dropping a `Lock` does not release or free it;
/// use [`Lock::unset`] and [`Arena::free_lock`].
pub struct Lock {
    record: *mut LockRecord,
    slot: usize,
    semid: i32,
}

unsafe impl Send for Lock {}
unsafe impl Sync for Lock {}

impl Lock {
    /// Rebuild a lock handle from its in-arena record, as shared through
    /// the info slot by another attacher.
    ///
    /// # Safety
    /// `ptr` must point at the payload of a live lock record allocated by
    /// `new_lock` on an arena attached to the same mapping.
    pub unsafe fn from_payload(arena: &Arena, ptr: *mut u8) -> io::Result<Lock> {
        let record = ptr as *mut LockRecord;
        let rec = ptr::read(record);
        if rec.slot >= rec.max_locks || rec.max_locks as usize != arena.max_locks() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a lock record",
            ));
        }
        Ok(Lock {
            record,
            slot: rec.slot as usize,
            semid: rec.semid as i32,
        })
    }

    /// Semaphore slot this lock occupies.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Acquire the lock, blocking until the holder releases it.
    pub fn set(&self) -> io::Result<()> {
        if acquire_with_retry(self.semid, self.slot, true)? {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "lock: retries exhausted",
            ))
        }
    }

    /// Conditional acquire. `spins == 0` blocks like [`Lock::set`];
    /// otherwise a single non-blocking attempt is made. Always resolves to
    /// acquired (`true`) or contended (`false`) — a blocking caller whose
    /// retries run out is reported as contended, never as an error.
    pub fn cset(&self, spins: u32) -> io::Result<bool> {
        acquire_with_retry(self.semid, self.slot, spins == 0)
    }

    /// Spin-wait acquire. On a uniprocessor there is nothing to spin
    /// against, so this blocks exactly like [`Lock::set`].
    pub fn wset(&self, _spins: u32) -> io::Result<()> {
        self.set()
    }

    /// Release the lock (slot back to zero). Idempotent; never blocks.
    pub fn unset(&self) -> io::Result<()> {
        posix::sem_release(self.semid, self.slot)
    }

    /// Instantaneous slot value: 0 idle, 1 held. Racy by design; only
    /// useful for diagnostics.
    pub fn test(&self) -> io::Result<i32> {
        posix::sem_get_one(self.semid, self.slot)
    }

    /// Payload pointer of the in-arena identity record, suitable for
    /// publishing through the info slot so another attacher can rebuild
    /// this lock with [`Lock::from_payload`].
    pub fn payload_ptr(&self) -> *mut u8 {
        self.record as *mut u8
    }
}

impl Arena {
    /// Allocate a named lock: claim the first unallocated semaphore slot
    /// and give it an in-arena identity record.
    ///
    /// The slot scan and claim run under the arena-wide lock, so racing
    /// callers always end up on distinct slots. Fails when every slot is
    /// taken or the record cannot be allocated.
    pub fn new_lock(&self) -> io::Result<Lock> {
        let semid = self.semid();
        let slot = {
            let _g = self.guard()?;
            let vals = posix::sem_get_all(semid, self.max_locks() + 1)?;
            let Some(slot) = vals[..self.max_locks()]
                .iter()
                .position(|&v| v == SEM_UNUSED)
            else {
                return Err(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "all lock slots in use",
                ));
            };
            posix::sem_set_one(semid, slot, 0)?;
            unsafe { (*self.header()).locks_in_use += 1 };
            slot
        };

        // The record allocation takes the arena lock itself, so the claim
        // above must already be released; unwind it if allocation fails.
        let record = self.malloc(mem::size_of::<LockRecord>());
        if record.is_null() {
            let _ = posix::sem_set_one(semid, slot, SEM_UNUSED);
            if let Ok(_g) = self.guard() {
                unsafe { (*self.header()).locks_in_use -= 1 };
            }
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "arena exhausted allocating lock record",
            ));
        }
        self.memdesc(record, Some("lock"));

        let record = record as *mut LockRecord;
        unsafe {
            ptr::write(
                record,
                LockRecord {
                    slot: slot as u64,
                    semid: semid as i64,
                    max_locks: self.max_locks() as u64,
                },
            );
        }
        Ok(Lock {
            record,
            slot,
            semid,
        })
    }

    /// Return a lock's slot to the unallocated state and free its record.
    /// A process still blocked in `set` on this lock stays blocked until
    /// the slot is reallocated and released; freeing a lock others are
    /// waiting on is a caller protocol error.
    pub fn free_lock(&self, lock: Lock) -> io::Result<()> {
        if lock.slot >= self.max_locks() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "lock slot out of range",
            ));
        }
        posix::sem_set_one(self.semid(), lock.slot, SEM_UNUSED)?;
        {
            let _g = self.guard()?;
            unsafe { (*self.header()).locks_in_use -= 1 };
        }
        self.memdescfree(lock.payload_ptr());
        unsafe { self.free(lock.payload_ptr()) };
        Ok(())
    }

    /// Currently allocated named locks, as recorded in the shared header.
    pub fn locks_in_use(&self) -> i32 {
        unsafe { (*self.header()).locks_in_use }
    }
}
