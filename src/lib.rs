// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmarena contributors
//
// Shared-memory arena allocator for cooperating, unrelated POSIX processes.
//
// Processes attach a common memory-mapped file and allocate from it with a
// segregated-free-list allocator that works in offsets rather than
// pointers, so every attacher sees the same graph regardless of where the
// kernel placed its mapping. A SysV semaphore set provides the arena-wide
// mutation lock, a pool of user-allocatable named locks, and death-robust
// release via SEM_UNDO. A single shared info slot bootstraps user-defined
// cross-process structures.

mod platform;

mod layout;
pub use layout::{
    ArenaHeader, FreeBin, ARENA_BIN_OFFSET, ARENA_INFO_OFFSET, HEADER_SIZE, MIN_CHUNK_SIZE,
    US_MAX_FREE_BIN,
};

mod config;
pub use config::{ArenaConfig, ConfigCmd, DEFAULT_MAX_LOCKS, DEFAULT_PERMISSION, DEFAULT_SEGMENT};

mod arena;
pub use arena::Arena;

mod alloc;
pub use alloc::{bin_of, MemUsage};

mod lock;
pub use lock::Lock;

mod info;
mod memdesc;

pub use platform::posix::SEM_UNUSED;
