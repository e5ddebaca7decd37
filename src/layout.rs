// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmarena contributors
//
// On-disk layout of the shared arena header. Every attacher observes these
// bytes directly, so the field order, widths, and derived offsets below are
// a cross-process contract; changing any of them breaks live arenas.
//
//   mapping:  [ ArenaHeader | allocation region ................ ]
//   region:   [ 8 zero bytes | chunk @8 | chunk | ... | ) total_size
//
// All intra-arena references are byte offsets from the region start.
// Offset 0 is the "no chunk" sentinel; the region's first word stays zero
// so the chunk at offset 8 reads a zero trailing size for its (absent)
// previous neighbor.

use std::mem;

/// Number of free-chunk bins. Bins [0, 63] hold a single size each
/// (8..512 in steps of 8); bins [64, 155] hold sorted size ranges.
pub const US_MAX_FREE_BIN: usize = 156;

/// Index of the last single-size bin.
pub const US_MAX_ONE_SIZE: usize = 63;

/// Smallest chunk the allocator will create. A free chunk stores four
/// distinct words (leading size, next, prev, trailing size), so anything
/// smaller would overlay its bin links onto its trailing size word.
pub const MIN_CHUNK_SIZE: usize = 32;

/// One chunk word: the size/status, link, and trailing-size fields.
pub const WORD: usize = 8;

/// Overhead of an in-use chunk: leading size word + trailing size word.
pub const INUSE_OVERHEAD: usize = 2 * WORD;

/// The multi-size bin hash covers 32 bits of `size >> 3`, so the region is
/// capped below 4 GiB to keep every reachable chunk size inside the bins.
pub const MAX_ARENA_SIZE: u64 = 1 << 32;

/// Head and tail of one free-chunk bin list (offsets; 0 = empty).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FreeBin {
    pub head: u64,
    pub tail: u64,
}

/// Fixed-layout prefix of the mapping, written once by the creator and read
/// by every joiner. `attach_hint` must stay the first field: joiners read
/// the file's leading bytes to learn where to map before they can mmap.
#[repr(C)]
pub struct ArenaHeader {
    /// Address the creating process mapped the file at.
    pub attach_hint: u64,
    /// ftok-derived key of the semaphore set.
    pub ipc_key: i32,
    /// Currently allocated named locks.
    pub locks_in_use: i32,
    /// Allocation-region size: the chunk walk from offset 8 ends here.
    pub total_size: u64,
    /// Semaphore-set size minus one; the last slot is the arena-wide lock.
    pub max_locks: u64,
    /// Shared info slot: 0, or the chunk offset of an in-use chunk.
    pub info_offset: u64,
    /// Free-chunk bin directory.
    pub bins: [FreeBin; US_MAX_FREE_BIN],
}

/// Byte offset of the bin directory within the header (layout contract).
pub const ARENA_BIN_OFFSET: usize = mem::offset_of!(ArenaHeader, bins);

/// Byte offset of the info slot within the header (layout contract).
pub const ARENA_INFO_OFFSET: usize = mem::offset_of!(ArenaHeader, info_offset);

/// Size of the header prefix, rounded so the allocation region that follows
/// starts 8-byte aligned.
pub const HEADER_SIZE: usize = (mem::size_of::<ArenaHeader>() + 7) & !7;

// The header is plain words; any padding would shift the contract offsets.
const _: () = assert!(mem::size_of::<ArenaHeader>() % WORD == 0);
const _: () = assert!(ARENA_INFO_OFFSET == 32);
const _: () = assert!(ARENA_BIN_OFFSET == 40);
const _: () = assert!(HEADER_SIZE == 40 + US_MAX_FREE_BIN * 2 * WORD);
