// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmarena contributors
//
// Arena lifecycle: create-or-join a shared mapping, hand out a per-process
// handle, and serialize every mutation behind the arena-wide semaphore.
//
// The first process to open the path creates the file, lays out the shared
// header, formats the allocation region as one big free chunk, and builds
// the semaphore set. Later processes map the same file (at the creator's
// address when possible), import the header, and obtain the existing set.

use std::io;
use std::path::{Path, PathBuf};
use std::ptr;

use tracing::warn;

use crate::config::ArenaConfig;
use crate::layout::{ArenaHeader, FreeBin, HEADER_SIZE, MAX_ARENA_SIZE, MIN_CHUNK_SIZE, US_MAX_FREE_BIN};
use crate::lock::acquire_with_retry;
use crate::platform::posix::{self, FileLock};

/// Per-process handle to a shared arena.
///
/// The handle caches the immutable header fields (key, sizes, lock count);
/// mutable shared state (bins, info slot, lock bookkeeping) is always read
/// and written through the mapping itself, under the arena-wide lock.
#[derive(Debug)]
pub struct Arena {
    path: PathBuf,
    /// Mapping base; the shared header lives here.
    mempool: *mut u8,
    /// Bytes mapped (header + allocation region).
    mapped_size: usize,
    /// Start of the allocation region; chunk offsets are relative to this.
    base: *mut u8,
    /// Allocation-region size: the chunk walk from offset 8 ends here.
    memsize: usize,
    semid: i32,
    key: i32,
    max_locks: usize,
}

// The mapping is MAP_SHARED by design; every mutation of shared bytes runs
// under the arena-wide semaphore.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Create the arena at `path`, or join it if it already exists.
    ///
    /// Creation is detected by an exclusive create of the backing file, so
    /// two racing initializers resolve cleanly: one creates, the other
    /// joins (and blocks on the advisory lock until the header is ready).
    pub fn init(path: &Path, config: &ArenaConfig) -> io::Result<Self> {
        if config.size() as u64 > MAX_ARENA_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "arena size exceeds the 4 GiB bin-hash range",
            ));
        }
        match posix::open_create_excl(path, config.perms()) {
            Ok(fd) => Self::create(path, fd, config),
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => Self::join(path, config),
            Err(e) => Err(e),
        }
    }

    /// Create path: the file did not exist and `fd` is its exclusive-create
    /// descriptor. Any failure unwinds the completed prefix in reverse.
    fn create(path: &Path, fd: i32, config: &ArenaConfig) -> io::Result<Self> {
        // Undo ladder, mirrored by the cleanup calls below:
        //   1 file created   -> unlink
        //   2 flock held     -> unlock (before close)
        //   3 mapping live   -> unmap
        //   4 sem set built  -> destroy
        fn cleanup(progress: u8, fd: i32, path: &Path, base: *mut u8, size: usize, semid: i32) {
            if progress >= 4 {
                posix::sem_destroy(semid);
            }
            if progress >= 3 {
                unsafe { posix::unmap(base, size) };
            }
            if progress >= 2 {
                let _ = posix::advisory_lock(fd, FileLock::Unlock);
            }
            posix::close(fd);
            if progress >= 1 {
                posix::unlink(path);
            }
        }

        let min_size = HEADER_SIZE + 8 + MIN_CHUNK_SIZE;
        let size = config.size().max(min_size);

        if let Err(e) = posix::advisory_lock(fd, FileLock::Exclusive) {
            cleanup(1, fd, path, ptr::null_mut(), 0, -1);
            return Err(e);
        }

        if let Err(e) = posix::extend_to(fd, size) {
            cleanup(2, fd, path, ptr::null_mut(), 0, -1);
            return Err(e);
        }

        let mempool = match posix::map(config.attach_hint(), size, fd, false) {
            Ok(p) => p,
            Err(e) => {
                cleanup(2, fd, path, ptr::null_mut(), 0, -1);
                return Err(e);
            }
        };

        let key = match posix::ipc_key_from(path) {
            Ok(k) => k,
            Err(e) => {
                cleanup(3, fd, path, mempool, size, -1);
                return Err(e);
            }
        };

        // One extra slot past the named-lock pool for the arena-wide lock.
        let nsems = config.users() + 1;
        let semid = match posix::sem_create_excl(key, nsems, config.perms()) {
            Ok(id) => id,
            Err(_) => {
                // The set exists but the file did not: leftovers of a
                // crashed run. Remove the stale set and build a fresh one.
                warn!(key, "stale semaphore set for new arena; recreating");
                match posix::sem_open_existing(key) {
                    Ok(stale) => posix::sem_destroy(stale),
                    Err(e) => {
                        cleanup(3, fd, path, mempool, size, -1);
                        return Err(e);
                    }
                }
                match posix::sem_create_excl(key, nsems, config.perms()) {
                    Ok(id) => id,
                    Err(e) => {
                        cleanup(3, fd, path, mempool, size, -1);
                        return Err(e);
                    }
                }
            }
        };

        // Named-lock slots start unallocated; the arena-wide lock starts
        // released (zero).
        let mut vals = vec![posix::SEM_UNUSED; nsems];
        vals[config.users()] = 0;
        if let Err(e) = posix::sem_set_all(semid, &vals) {
            cleanup(4, fd, path, mempool, size, semid);
            return Err(e);
        }

        let memsize = size - HEADER_SIZE;
        let arena = Arena {
            path: path.to_path_buf(),
            mempool,
            mapped_size: size,
            base: unsafe { mempool.add(HEADER_SIZE) },
            memsize,
            semid,
            key,
            max_locks: config.users(),
        };

        let header = ArenaHeader {
            attach_hint: mempool as u64,
            ipc_key: key,
            locks_in_use: 0,
            total_size: memsize as u64,
            max_locks: config.users() as u64,
            info_offset: 0,
            bins: [FreeBin::default(); US_MAX_FREE_BIN],
        };
        unsafe { ptr::write(mempool as *mut ArenaHeader, header) };

        // One free chunk at offset 8 spanning the rest of the region; the
        // first 8 bytes stay zero as the no-chunk sentinel.
        arena.format_region();

        let _ = posix::advisory_lock(fd, FileLock::Unlock);
        posix::close(fd);
        Ok(arena)
    }

    /// Join path: the file already exists. Map at the creator's address if
    /// the range is free, import the header, and obtain the semaphore set.
    fn join(path: &Path, config: &ArenaConfig) -> io::Result<Self> {
        let fd = posix::open_existing(path)?;

        if let Err(e) = posix::advisory_lock(fd, FileLock::Exclusive) {
            posix::close(fd);
            return Err(e);
        }

        fn unwind(fd: i32, e: io::Error) -> io::Error {
            let _ = posix::advisory_lock(fd, FileLock::Unlock);
            posix::close(fd);
            e
        }

        // The creator persisted its attach address as the file's first
        // bytes; a configured attach address overrides it.
        let hint = if config.attach_hint() != 0 {
            config.attach_hint()
        } else {
            let mut buf = [0u8; 8];
            if let Err(e) = posix::read_prefix(fd, &mut buf) {
                return Err(unwind(fd, e));
            }
            u64::from_ne_bytes(buf) as usize
        };

        let size = match posix::file_size(fd) {
            Ok(s) => s,
            Err(e) => return Err(unwind(fd, e)),
        };
        if size < HEADER_SIZE + 8 {
            return Err(unwind(
                fd,
                io::Error::new(io::ErrorKind::InvalidData, "arena file too small"),
            ));
        }

        // Best-effort fixed-address map so in-arena pointers coincide with
        // the creator's; the offset graph stays valid when the kernel has
        // to place us elsewhere.
        let mempool = match posix::map(hint, size, fd, true) {
            Ok(p) => p,
            Err(_) => match posix::map(0, size, fd, false) {
                Ok(p) => p,
                Err(e) => return Err(unwind(fd, e)),
            },
        };

        let header: ArenaHeader = unsafe { ptr::read(mempool as *const ArenaHeader) };

        let semid = match posix::sem_open_existing(header.ipc_key) {
            Ok(id) => id,
            Err(e) => {
                unsafe { posix::unmap(mempool, size) };
                return Err(unwind(fd, e));
            }
        };

        let _ = posix::advisory_lock(fd, FileLock::Unlock);
        posix::close(fd);

        Ok(Arena {
            path: path.to_path_buf(),
            mempool,
            mapped_size: size,
            base: unsafe { mempool.add(HEADER_SIZE) },
            memsize: header.total_size as usize,
            semid,
            key: header.ipc_key,
            max_locks: header.max_locks as usize,
        })
    }

    /// Tear the arena down for every user: destroy the semaphore set and
    /// unmap. The backing file is left in place for external policy.
    ///
    /// Dropping an `Arena` without calling this merely detaches the
    /// process (unmaps), leaving the arena alive for other attachers.
    pub fn free_arena(self) {
        posix::sem_destroy(self.semid);
        // Drop unmaps.
    }

    // -- arena-wide lock ----------------------------------------------------

    /// Force the arena-wide lock released (slot value zero).
    pub fn arena_lock_init(&self) -> io::Result<()> {
        posix::sem_set_one(self.semid, self.max_locks, 0)
    }

    /// Acquire the arena-wide lock: block until the reserved slot is zero,
    /// then hold it at 1 (undone by the kernel if the process dies).
    pub fn arena_lock(&self) -> io::Result<()> {
        if acquire_with_retry(self.semid, self.max_locks, true)? {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "arena lock: retries exhausted",
            ))
        }
    }

    /// Release the arena-wide lock. Idempotent; never blocks.
    pub fn arena_unlock(&self) -> io::Result<()> {
        posix::sem_release(self.semid, self.max_locks)
    }

    /// RAII acquisition of the arena-wide lock. Every allocator entry point
    /// runs under one of these so each exit path, including the corruption
    /// panic, releases the lock.
    pub(crate) fn guard(&self) -> io::Result<ArenaGuard<'_>> {
        self.arena_lock()?;
        Ok(ArenaGuard { arena: self })
    }

    // -- accessors ----------------------------------------------------------

    /// Allocation-region size in bytes (the tiling walk bound).
    pub fn total_size(&self) -> usize {
        self.memsize
    }

    /// Number of named-lock slots.
    pub fn max_locks(&self) -> usize {
        self.max_locks
    }

    /// The arena file this handle is attached to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// IPC key of the semaphore set.
    pub fn ipc_key(&self) -> i32 {
        self.key
    }

    pub(crate) fn semid(&self) -> i32 {
        self.semid
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.base
    }

    pub(crate) fn header(&self) -> *mut ArenaHeader {
        self.mempool as *mut ArenaHeader
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if !self.mempool.is_null() {
            unsafe { posix::unmap(self.mempool, self.mapped_size) };
        }
    }
}

/// Holds the arena-wide lock; releases it on drop.
pub(crate) struct ArenaGuard<'a> {
    arena: &'a Arena,
}

impl Drop for ArenaGuard<'_> {
    fn drop(&mut self) {
        let _ = self.arena.arena_unlock();
    }
}
