// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmarena contributors
//
// POSIX bindings for the arena: file creation and advisory locks, mmap at a
// requested address, ftok key derivation, and SysV semaphore sets.
//
// Everything here is a thin wrapper that turns a raw libc call into an
// `io::Result`; policy (retry bounds, slot protocol, cleanup order) lives in
// the arena and lock layers.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

/// Semaphore slot value marking an unallocated named-lock slot.
/// SEMVMX on Linux; the largest value a SysV semaphore can hold.
pub const SEM_UNUSED: u16 = 32767;

// ---------------------------------------------------------------------------
// Files: open, advisory locks, sizing
// ---------------------------------------------------------------------------

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Create `path` exclusively with `perms`. Fails with `AlreadyExists`
/// (EEXIST) when the file is already there, which is how the arena layer
/// decides between the create and join paths.
pub fn open_create_excl(path: &Path, perms: u32) -> io::Result<i32> {
    let c = c_path(path)?;
    let fd = unsafe {
        libc::open(
            c.as_ptr(),
            libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
            perms as libc::c_uint,
        )
    };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Open an existing file read-write.
pub fn open_existing(path: &Path) -> io::Result<i32> {
    let c = c_path(path)?;
    let fd = unsafe { libc::open(c.as_ptr(), libc::O_RDWR) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

pub fn close(fd: i32) {
    unsafe { libc::close(fd) };
}

pub fn unlink(path: &Path) {
    if let Ok(c) = c_path(path) {
        unsafe { libc::unlink(c.as_ptr()) };
    }
}

/// Advisory whole-file lock modes (flock).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileLock {
    Exclusive,
    #[allow(dead_code)]
    Shared,
    Unlock,
}

pub fn advisory_lock(fd: i32, mode: FileLock) -> io::Result<()> {
    let op = match mode {
        FileLock::Exclusive => libc::LOCK_EX,
        FileLock::Shared => libc::LOCK_SH,
        FileLock::Unlock => libc::LOCK_UN,
    };
    if unsafe { libc::flock(fd, op) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Grow the file to `size` bytes so the whole mapping is backed.
pub fn extend_to(fd: i32, size: usize) -> io::Result<()> {
    if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn file_size(fd: i32) -> io::Result<usize> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(st.st_size as usize)
}

/// Read the first `buf.len()` bytes of the file (the creator's attach hint).
pub fn read_prefix(fd: i32, buf: &mut [u8]) -> io::Result<()> {
    let n = unsafe { libc::pread(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if n != buf.len() as libc::ssize_t {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

#[cfg(target_os = "linux")]
const MAP_AT_HINT: libc::c_int = libc::MAP_FIXED_NOREPLACE;
#[cfg(not(target_os = "linux"))]
const MAP_AT_HINT: libc::c_int = 0;

/// Map `size` bytes of `fd` shared and read-write.
///
/// With `fixed` set the hint is a best-effort fixed-address request: the map
/// fails (rather than relocating or clobbering an existing mapping) when the
/// range is taken, and the caller retries unhinted.
pub fn map(hint: usize, size: usize, fd: i32, fixed: bool) -> io::Result<*mut u8> {
    let addr = if hint == 0 {
        ptr::null_mut()
    } else {
        hint as *mut libc::c_void
    };
    let flags = libc::MAP_SHARED | if fixed && hint != 0 { MAP_AT_HINT } else { 0 };
    let mem = unsafe {
        libc::mmap(
            addr,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            fd,
            0,
        )
    };
    if mem == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(mem as *mut u8)
}

/// # Safety
/// `base` must be a live mapping of exactly `size` bytes obtained from `map`.
pub unsafe fn unmap(base: *mut u8, size: usize) {
    libc::munmap(base as *mut libc::c_void, size);
}

/// Derive the SysV IPC key for the arena file.
pub fn ipc_key_from(path: &Path) -> io::Result<i32> {
    let c = c_path(path)?;
    let key = unsafe { libc::ftok(c.as_ptr(), 0) };
    if key == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(key)
}

// ---------------------------------------------------------------------------
// SysV semaphore sets
// ---------------------------------------------------------------------------

/// The argument union semctl reads for SETVAL / GETALL / SETALL. Pointer
/// width so it matches the kernel's `union semun` in the variadic slot.
#[repr(C)]
#[derive(Clone, Copy)]
union SemArg {
    val: libc::c_int,
    array: *mut libc::c_ushort,
}

/// Create a fresh semaphore set of `n` slots. Fails if the key is taken.
pub fn sem_create_excl(key: i32, n: usize, perms: u32) -> io::Result<i32> {
    let id = unsafe {
        libc::semget(
            key,
            n as libc::c_int,
            libc::IPC_CREAT | libc::IPC_EXCL | perms as libc::c_int,
        )
    };
    if id == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(id)
}

/// Obtain the existing semaphore set for `key`. Never creates one.
pub fn sem_open_existing(key: i32) -> io::Result<i32> {
    let id = unsafe { libc::semget(key, 0, 0) };
    if id == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(id)
}

/// Remove the whole set. Waiters inside semop are woken with EIDRM.
pub fn sem_destroy(id: i32) {
    unsafe { libc::semctl(id, 0, libc::IPC_RMID) };
}

pub fn sem_set_all(id: i32, values: &[u16]) -> io::Result<()> {
    let mut vals: Vec<libc::c_ushort> = values.iter().map(|&v| v as libc::c_ushort).collect();
    let arg = SemArg {
        array: vals.as_mut_ptr(),
    };
    if unsafe { libc::semctl(id, 0, libc::SETALL, arg) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn sem_get_all(id: i32, n: usize) -> io::Result<Vec<u16>> {
    let mut vals = vec![0 as libc::c_ushort; n];
    let arg = SemArg {
        array: vals.as_mut_ptr(),
    };
    if unsafe { libc::semctl(id, 0, libc::GETALL, arg) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(vals.iter().map(|&v| v as u16).collect())
}

/// SETVAL on one slot. Also clears every process's pending undo adjustment
/// for that slot, which is what makes release-by-setval idempotent.
pub fn sem_set_one(id: i32, slot: usize, value: u16) -> io::Result<()> {
    let arg = SemArg {
        val: value as libc::c_int,
    };
    if unsafe { libc::semctl(id, slot as libc::c_int, libc::SETVAL, arg) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn sem_get_one(id: i32, slot: usize) -> io::Result<i32> {
    let v = unsafe { libc::semctl(id, slot as libc::c_int, libc::GETVAL) };
    if v == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(v)
}

/// One attempt at acquiring a slot: wait-for-zero then hold it at 1, as a
/// single atomic semop. The increment carries SEM_UNDO so the kernel drops
/// the hold if the process dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemWait {
    Ok,
    WouldBlock,
    Interrupted,
}

pub fn sem_acquire_once(id: i32, slot: usize, blocking: bool) -> io::Result<SemWait> {
    let nowait = if blocking { 0 } else { libc::IPC_NOWAIT };
    let mut sops = [
        libc::sembuf {
            sem_num: slot as libc::c_ushort,
            sem_op: 0,
            sem_flg: nowait as libc::c_short,
        },
        libc::sembuf {
            sem_num: slot as libc::c_ushort,
            sem_op: 1,
            sem_flg: (libc::SEM_UNDO | nowait) as libc::c_short,
        },
    ];
    let ret = unsafe { libc::semop(id, sops.as_mut_ptr(), sops.len()) };
    if ret == 0 {
        return Ok(SemWait::Ok);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN) => Ok(SemWait::WouldBlock),
        Some(libc::EINTR) => Ok(SemWait::Interrupted),
        _ => Err(err),
    }
}

/// Release a slot by forcing it back to zero. Never blocks; releasing an
/// already-released slot is a no-op.
pub fn sem_release(id: i32, slot: usize) -> io::Result<()> {
    sem_set_one(id, slot, 0)
}
