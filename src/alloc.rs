// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmarena contributors
//
// Segregated-free-list allocator over the arena's allocation region.
//
// Chunks are contiguous aligned byte ranges addressed by offset. Both ends
// of a chunk carry its size; the low bit of the leading word is the status
// (1 = free, 0 = in-use). Free chunks additionally carry bin links:
//
//   in-use:  [ size|status ][ payload ....................... ][ size ]
//   free:    [ size|status ][ next ][ prev ][ unused ......... ][ size ]
//
// The trailing size word is what makes the previous physical neighbor
// reachable, and the leading/trailing agreement is the corruption check.
// Free chunks hang off 156 bins: 64 single-size bins for sizes up to 512,
// then sorted multi-size bins. Freeing coalesces eagerly, so no two
// adjacent chunks are ever both free.
//
// Every mutating entry point runs under the arena-wide lock via the RAII
// guard; the lock is released on every exit path, including the corruption
// panic.

use std::ptr;

use tracing::{debug, error};

use crate::arena::Arena;
use crate::layout::{INUSE_OVERHEAD, MIN_CHUNK_SIZE, US_MAX_FREE_BIN, US_MAX_ONE_SIZE, WORD};
use crate::memdesc;

/// Totals computed by [`Arena::memuse`]: `inuse` counts everything that is
/// not on a free list, including the chunk overhead words and the 8-byte
/// offset-zero sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemUsage {
    pub inuse: usize,
    pub free: usize,
}

/// Map a chunk size to its bin index in [0, 155].
///
/// Sizes up to 512 land in single-size bins `(size >> 3) - 1`. Larger sizes
/// hash on `size >> 3`: an and-then-OR sweep at widths 16/8/4/2/1 locates
/// the highest set bit, the two bits just below it are appended, and the
/// result is shifted past the single-size range. This mapping is observed
/// by every attacher through the shared bins, so it must never change.
pub fn bin_of(size: usize) -> usize {
    debug_assert!(size >= WORD && size % WORD == 0);
    if size <= 512 {
        return (size >> 3) - 1;
    }
    let ssz = size >> 3;
    let mut isz = ssz;
    let mut hash: usize = 1;
    if isz & 0xffff_0000 != 0 {
        hash += 16;
        isz &= 0xffff_0000;
    }
    if isz & 0xff00_ff00 != 0 {
        hash += 8;
        isz &= 0xff00_ff00;
    }
    if isz & 0xf0f0_f0f0 != 0 {
        hash += 4;
        isz &= 0xf0f0_f0f0;
    }
    if isz & 0xcccc_cccc != 0 {
        hash += 2;
        isz &= 0xcccc_cccc;
    }
    if isz & 0xaaaa_aaaa != 0 {
        hash += 1;
    }
    // Two bits to the right of the leading bit, leading bit cleared.
    let offset = (ssz >> (hash - 3)) & !4;
    ((hash << 2) | offset) + 36
}

/// Round a total chunk request to a multiple of 8, clipped to the minimum
/// chunk size so the chunk can rejoin a free bin when released.
fn clamp_request(size: usize) -> usize {
    if size < MIN_CHUNK_SIZE {
        MIN_CHUNK_SIZE
    } else {
        ((size - 1) & !7) + 8
    }
}

fn absdiff(a: usize, b: usize) -> usize {
    if a >= b {
        a - b
    } else {
        b - a
    }
}

// ---------------------------------------------------------------------------
// Chunk word accessors
// ---------------------------------------------------------------------------
//
// All offsets handed to these are inside the allocation region; they come
// from the bins, from neighbor arithmetic validated against the region
// bounds, or from ptr2chunk on caller pointers (whose validity is the
// caller's contract, checked by sizecheck).

impl Arena {
    #[inline]
    fn word(&self, off: usize) -> *mut u64 {
        unsafe { self.base().add(off) as *mut u64 }
    }

    #[inline]
    fn size_bgn(&self, chunk: usize) -> usize {
        unsafe { (*self.word(chunk) & !1) as usize }
    }

    #[inline]
    fn size_end(&self, chunk: usize, sz: usize) -> usize {
        if sz == 0 {
            return 0;
        }
        unsafe { *self.word(chunk + sz - WORD) as usize }
    }

    #[inline]
    fn is_free(&self, chunk: usize) -> bool {
        unsafe { *self.word(chunk) & 1 == 1 }
    }

    #[inline]
    fn next_link(&self, chunk: usize) -> usize {
        unsafe { *self.word(chunk + WORD) as usize }
    }

    #[inline]
    fn prev_link(&self, chunk: usize) -> usize {
        unsafe { *self.word(chunk + 2 * WORD) as usize }
    }

    #[inline]
    fn set_next_link(&self, chunk: usize, nxt: usize) {
        unsafe { *self.word(chunk + WORD) = nxt as u64 };
    }

    #[inline]
    fn set_prev_link(&self, chunk: usize, prv: usize) {
        unsafe { *self.word(chunk + 2 * WORD) = prv as u64 };
    }

    /// Write the size into both end words, clearing the status bit.
    #[inline]
    fn set_size(&self, chunk: usize, sz: usize) {
        unsafe {
            *self.word(chunk) = sz as u64;
            *self.word(chunk + sz - WORD) = sz as u64;
        }
    }

    #[inline]
    fn set_free(&self, chunk: usize) {
        unsafe { *self.word(chunk) |= 1 };
    }

    #[inline]
    fn set_inuse(&self, chunk: usize) {
        unsafe { *self.word(chunk) &= !1 };
    }

    fn bin_head(&self, bin: usize) -> usize {
        unsafe { (*self.header()).bins[bin].head as usize }
    }

    fn bin_tail(&self, bin: usize) -> usize {
        unsafe { (*self.header()).bins[bin].tail as usize }
    }

    fn set_bin_head(&self, bin: usize, chunk: usize) {
        unsafe { (*self.header()).bins[bin].head = chunk as u64 };
    }

    fn set_bin_tail(&self, bin: usize, chunk: usize) {
        unsafe { (*self.header()).bins[bin].tail = chunk as u64 };
    }

    /// Payload pointer of an in-use chunk.
    #[inline]
    pub(crate) fn chunk2ptr(&self, chunk: usize) -> *mut u8 {
        unsafe { self.base().add(chunk + WORD) }
    }

    /// Chunk offset of a payload pointer previously handed out by malloc.
    #[inline]
    pub(crate) fn ptr2chunk(&self, ptr: *const u8) -> usize {
        (ptr as usize).wrapping_sub(self.base() as usize + WORD)
    }

    /// Next physical neighbor, or 0 at the end of the region.
    fn next_neighbor(&self, chunk: usize) -> usize {
        let nxt = chunk + self.size_bgn(chunk);
        if nxt >= self.total_size() {
            0
        } else {
            nxt
        }
    }

    /// Previous physical neighbor via its trailing size word, or 0 at the
    /// start of the region (the sentinel word below offset 8 reads zero).
    fn prev_neighbor(&self, chunk: usize) -> usize {
        let psz = unsafe { *self.word(chunk - WORD) as usize };
        if psz == 0 || psz > chunk {
            0
        } else {
            chunk - psz
        }
    }

    // -----------------------------------------------------------------------
    // Corruption check
    // -----------------------------------------------------------------------

    /// Verify that a chunk's two size words agree; returns the size.
    ///
    /// A mismatch means the shared memory has been overwritten. That is not
    /// recoverable: the diagnostic goes to the debug channel and the
    /// process panics with it. The arena lock, if held, is released by
    /// guard unwinding.
    pub(crate) fn sizecheck(&self, chunk: usize) -> usize {
        let sz = self.size_bgn(chunk);
        let endsz = self.size_end(chunk, sz);
        if sz != endsz {
            let tag = memdesc::lookup(chunk);
            error!(chunk, sz, endsz, tag = %tag, "shared memory corruption detected");
            panic!(
                "shared memory corruption detected concerning <{tag}> (sz={sz} != endsz={endsz})"
            );
        }
        sz & !7
    }

    // -----------------------------------------------------------------------
    // Free-list maintenance
    // -----------------------------------------------------------------------

    /// Unlink a free chunk from its bin.
    fn extract_chunk(&self, chunk: usize) {
        let prv = self.prev_link(chunk);
        let nxt = self.next_link(chunk);
        let mut bin = usize::MAX;

        if prv != 0 {
            self.set_next_link(prv, nxt);
        } else {
            bin = bin_of(self.size_bgn(chunk));
            self.set_bin_head(bin, nxt);
        }

        if nxt != 0 {
            self.set_prev_link(nxt, prv);
        } else {
            if bin == usize::MAX {
                bin = bin_of(self.size_bgn(chunk));
            }
            self.set_bin_tail(bin, prv);
        }

        self.set_next_link(chunk, 0);
        self.set_prev_link(chunk, 0);
    }

    /// Link a free chunk into the bin for its size. Single-size bins append;
    /// multi-size bins keep ascending size order, entered from whichever end
    /// is nearer in size.
    fn insert_free_chunk(&self, chunk: usize) {
        self.sizecheck(chunk);
        self.set_free(chunk);
        let isz = self.size_bgn(chunk);
        let bin = bin_of(isz);

        if self.bin_head(bin) == 0 {
            self.set_next_link(chunk, 0);
            self.set_prev_link(chunk, 0);
            self.set_bin_head(bin, chunk);
            self.set_bin_tail(bin, chunk);
            return;
        }

        if bin <= US_MAX_ONE_SIZE {
            let tl = self.bin_tail(bin);
            self.set_next_link(tl, chunk);
            self.set_prev_link(chunk, tl);
            self.set_next_link(chunk, 0);
            self.set_bin_tail(bin, chunk);
            return;
        }

        // The insertion point: the first member the new chunk must precede.
        let head = self.bin_head(bin);
        let tail = self.bin_tail(bin);
        let before = if absdiff(self.size_bgn(head), isz) < absdiff(self.size_bgn(tail), isz) {
            let mut cur = head;
            while cur != 0 && self.size_bgn(cur) <= isz {
                cur = self.next_link(cur);
            }
            cur
        } else {
            let mut stop = 0;
            let mut cur = tail;
            while cur != 0 && self.size_bgn(cur) >= isz {
                stop = cur;
                cur = self.prev_link(cur);
            }
            stop
        };

        if before == 0 {
            let tl = self.bin_tail(bin);
            self.set_next_link(tl, chunk);
            self.set_prev_link(chunk, tl);
            self.set_next_link(chunk, 0);
            self.set_bin_tail(bin, chunk);
        } else if before == self.bin_head(bin) {
            self.set_prev_link(before, chunk);
            self.set_next_link(chunk, before);
            self.set_prev_link(chunk, 0);
            self.set_bin_head(bin, chunk);
        } else {
            let after = self.prev_link(before);
            self.set_next_link(after, chunk);
            self.set_prev_link(before, chunk);
            self.set_next_link(chunk, before);
            self.set_prev_link(chunk, after);
        }
    }

    /// Absorb any free physical neighbors into `chunk`, then insert the
    /// result into its bin. The chunk must be marked free and must not be
    /// linked into any bin.
    fn merge_free_chunk(&self, chunk: usize) {
        let mut chunk = chunk;
        if !self.is_free(chunk) {
            return;
        }

        let prv = self.prev_neighbor(chunk);
        let nxt = self.next_neighbor(chunk);

        if prv != 0 && self.is_free(prv) {
            let isz = self.size_bgn(chunk);
            let psz = self.size_bgn(prv);
            self.extract_chunk(prv);
            self.set_size(prv, isz + psz);
            self.set_free(prv);
            chunk = prv;
        }

        if nxt != 0 && self.is_free(nxt) {
            let isz = self.size_bgn(chunk);
            let nsz = self.size_bgn(nxt);
            self.extract_chunk(nxt);
            self.set_size(chunk, isz + nsz);
            self.set_free(chunk);
        }

        self.insert_free_chunk(chunk);
    }

    /// Carve `need` bytes out of a free chunk and return the in-use piece.
    ///
    /// A leftover too small to stand alone is consumed whole. Otherwise the
    /// sliver is placed next to the larger free physical neighbor (ties
    /// prefer the previous; with both neighbors in use it goes after the
    /// allocated piece) and merged so the split never strands a fragment
    /// beside free space.
    fn split_chunk(&self, chunk: usize, need: usize) -> usize {
        self.sizecheck(chunk);
        let isz = self.size_bgn(chunk);
        debug_assert!(isz >= need);
        self.extract_chunk(chunk);

        if isz - need < MIN_CHUNK_SIZE {
            self.set_inuse(chunk);
            return chunk;
        }

        let fsz = isz - need;
        let nxt = self.next_neighbor(chunk);
        let prv = self.prev_neighbor(chunk);
        let prv_free = prv != 0 && self.is_free(prv);
        let nxt_free = nxt != 0 && self.is_free(nxt);

        if !prv_free && !nxt_free {
            let sliver = chunk + need;
            self.set_size(sliver, fsz);
            self.set_free(sliver);
            self.set_size(chunk, need);
            self.set_inuse(chunk);
            self.insert_free_chunk(sliver);
            return chunk;
        }

        let psz = if prv_free { self.size_bgn(prv) } else { 0 };
        let nsz = if nxt_free { self.size_bgn(nxt) } else { 0 };
        let (sliver, user) = if prv_free && (!nxt_free || psz >= nsz) {
            (chunk, chunk + fsz)
        } else {
            (chunk + need, chunk)
        };
        self.set_size(sliver, fsz);
        self.set_free(sliver);
        self.set_size(user, need);
        self.set_inuse(user);
        self.merge_free_chunk(sliver);
        user
    }

    /// Locate and split a free chunk of at least `need` total bytes.
    /// Returns 0 when nothing fits (there is no growing the arena).
    fn find_chunk(&self, need: usize) -> usize {
        if need > self.total_size() {
            return 0;
        }
        let need = clamp_request(need);
        let want = bin_of(need);

        let mut bin = want;
        while bin < US_MAX_FREE_BIN && self.bin_head(bin) == 0 {
            bin += 1;
        }

        // The home bin can hold several sizes; its tail is its largest
        // member, so a too-small tail sends the search onward. Every later
        // non-empty bin is guaranteed big enough.
        if bin == want {
            let tail = self.bin_tail(bin);
            let tsz = self.size_bgn(tail);
            if tsz == need {
                return self.split_chunk(tail, need);
            }
            if need > tsz {
                bin += 1;
                while bin < US_MAX_FREE_BIN && self.bin_head(bin) == 0 {
                    bin += 1;
                }
            }
        }

        if bin >= US_MAX_FREE_BIN {
            return 0;
        }
        if bin <= US_MAX_ONE_SIZE {
            return self.split_chunk(self.bin_head(bin), need);
        }

        // Multi-size bin: walk to the first fit from the nearer end.
        let head = self.bin_head(bin);
        let tail = self.bin_tail(bin);
        let found = if absdiff(self.size_bgn(head), need) < absdiff(self.size_bgn(tail), need) {
            let mut cur = head;
            while cur != 0 && self.size_bgn(cur) < need {
                cur = self.next_link(cur);
            }
            cur
        } else {
            let mut fit = 0;
            let mut cur = tail;
            while cur != 0 && self.size_bgn(cur) >= need {
                fit = cur;
                cur = self.prev_link(cur);
            }
            fit
        };

        if found == 0 {
            return 0;
        }
        self.split_chunk(found, need)
    }

    /// Lay the freshly created region out as one free chunk at offset 8.
    pub(crate) fn format_region(&self) {
        let chunk = WORD;
        let csz = self.total_size() - WORD;
        self.set_size(chunk, csz);
        self.set_free(chunk);
        self.set_next_link(chunk, 0);
        self.set_prev_link(chunk, 0);
        let bin = bin_of(csz);
        self.set_bin_head(bin, chunk);
        self.set_bin_tail(bin, chunk);
    }

    // -----------------------------------------------------------------------
    // Allocation entry points
    // -----------------------------------------------------------------------

    /// Allocate `size` bytes from the arena. Returns the payload pointer, or
    /// null when no free chunk fits. A zero-byte request yields a valid
    /// minimum chunk with at least 16 usable bytes.
    pub fn malloc(&self, size: usize) -> *mut u8 {
        let Some(need) = size.checked_add(INUSE_OVERHEAD) else {
            return ptr::null_mut();
        };
        let Ok(_g) = self.guard() else {
            return ptr::null_mut();
        };
        let chunk = self.find_chunk(need);
        if chunk == 0 {
            return ptr::null_mut();
        }
        self.chunk2ptr(chunk)
    }

    /// Allocate `nel * elsize` bytes and zero them.
    pub fn calloc(&self, nel: usize, elsize: usize) -> *mut u8 {
        let Some(total) = nel.checked_mul(elsize) else {
            return ptr::null_mut();
        };
        let p = self.malloc(total);
        if !p.is_null() {
            unsafe { ptr::write_bytes(p, 0, total) };
        }
        p
    }

    /// Release a chunk back to the arena and coalesce it with any free
    /// physical neighbor. Freeing null or an already-free chunk is a silent
    /// no-op; a corrupted chunk trips the fatal size check.
    ///
    /// # Safety
    /// `ptr` must be null or a pointer previously returned by an allocation
    /// call on an arena attached to the same mapping, not yet freed through
    /// any attacher.
    pub unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let Ok(_g) = self.guard() else {
            return;
        };
        let chunk = self.ptr2chunk(ptr);
        self.sizecheck(chunk);
        if self.is_free(chunk) {
            return;
        }
        self.set_free(chunk);
        self.merge_free_chunk(chunk);
    }

    /// Resize an allocation by allocate-copy-free (never in place). Null
    /// behaves as `malloc(size)`; a zero size frees and returns null; when
    /// no new chunk fits, the old one is left untouched and null returns.
    ///
    /// # Safety
    /// As [`Arena::free`].
    pub unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.malloc(size);
        }
        if size == 0 {
            self.free(ptr);
            return ptr::null_mut();
        }

        let old_payload = {
            let Ok(_g) = self.guard() else {
                return ptr::null_mut();
            };
            self.sizecheck(self.ptr2chunk(ptr)) - INUSE_OVERHEAD
        };

        let newptr = self.malloc(size);
        if !newptr.is_null() {
            ptr::copy_nonoverlapping(ptr, newptr, old_payload.min(size));
            self.free(ptr);
        }
        newptr
    }

    /// Resize to `nel * elsize` bytes, zeroing any grown tail and keeping
    /// the common prefix. Null behaves as `calloc`; a zero count or element
    /// size frees and returns null.
    ///
    /// # Safety
    /// As [`Arena::free`].
    pub unsafe fn recalloc(&self, ptr: *mut u8, nel: usize, elsize: usize) -> *mut u8 {
        if nel == 0 || elsize == 0 {
            self.free(ptr);
            return ptr::null_mut();
        }
        if ptr.is_null() {
            return self.calloc(nel, elsize);
        }
        let Some(newsize) = nel.checked_mul(elsize) else {
            return ptr::null_mut();
        };

        let old_payload = {
            let Ok(_g) = self.guard() else {
                return ptr::null_mut();
            };
            self.sizecheck(self.ptr2chunk(ptr)) - INUSE_OVERHEAD
        };

        let newptr = self.malloc(newsize);
        if !newptr.is_null() {
            if newsize < old_payload {
                ptr::copy_nonoverlapping(ptr, newptr, newsize);
            } else {
                ptr::copy_nonoverlapping(ptr, newptr, old_payload);
                ptr::write_bytes(newptr.add(old_payload), 0, newsize - old_payload);
            }
            self.free(ptr);
        }
        newptr
    }

    // -----------------------------------------------------------------------
    // Usage reports
    // -----------------------------------------------------------------------

    /// Dump memory usage and return the in-use/free totals.
    ///
    /// Mode bits: 1 = dump the free bins, 2 = dump every chunk in region
    /// order (this pass sizechecks each chunk, making it the reference
    /// consistency walk), 4 = write to the debug channel only, 8 = print
    /// the totals line. Totals are always computed and returned.
    ///
    /// Deliberately takes no lock: this is a diagnostic snapshot and may be
    /// run against a wedged arena.
    pub fn memuse(&self, mode: u32) -> MemUsage {
        let quiet = mode & 4 != 0;
        let report = |line: &str| {
            debug!("{line}");
            if !quiet {
                println!("{line}");
            }
        };

        if mode & 1 != 0 {
            report("Shared Free Memory, by bin:");
            for bin in 0..US_MAX_FREE_BIN {
                let mut chunk = self.bin_head(bin);
                while chunk != 0 {
                    let nxt = self.next_link(chunk);
                    let prv = self.prev_link(chunk);
                    let sz = self.size_bgn(chunk);
                    let endsz = self.size_end(chunk, sz);
                    let pos = if chunk == self.bin_head(bin) && chunk == self.bin_tail(bin) {
                        "ht"
                    } else if chunk == self.bin_head(bin) {
                        "hd"
                    } else if chunk == self.bin_tail(bin) {
                        "tl"
                    } else {
                        ""
                    };
                    report(&format!(
                        "   {chunk:>10}: bin[{bin:>3}] {pos:>2} prv={prv:>10} nxt={nxt:>10} sz={sz:>10} endsz={endsz:>10} {}",
                        if self.is_free(chunk) { "free" } else { "inuse" }
                    ));
                    if chunk % 8 != 0 || nxt % 8 != 0 || prv % 8 != 0 {
                        error!(bin, chunk, "misaligned bin link in shared memory");
                    }
                    chunk = nxt;
                }
            }
        }

        if mode & 2 != 0 {
            report("Shared Memory Snapshot:");
            let mut chunk = WORD;
            while chunk != 0 && chunk < self.total_size() {
                let sz = self.size_bgn(chunk);
                let endsz = self.size_end(chunk, sz);
                let desc = memdesc::lookup(chunk);
                if self.is_free(chunk) {
                    let nxt = self.next_link(chunk);
                    let prv = self.prev_link(chunk);
                    report(&format!(
                        " free  {chunk:>10}: sz={sz:>10} endsz={endsz:>10} nxt={nxt:>10} prv={prv:>10}: {desc}"
                    ));
                    if nxt % 8 != 0 || prv % 8 != 0 {
                        error!(chunk, "misaligned bin link in shared memory");
                    }
                } else {
                    report(&format!(
                        " inuse {chunk:>10}: sz={sz:>10} endsz={endsz:>10}: {desc}"
                    ));
                }
                self.sizecheck(chunk);
                if sz == 0 {
                    break;
                }
                chunk += sz;
            }
        }

        // Totals: everything the free bins hold, subtracted from the region.
        let mut total_free = 0usize;
        for bin in 0..US_MAX_FREE_BIN {
            let mut chunk = self.bin_head(bin);
            while chunk != 0 {
                total_free += self.size_bgn(chunk);
                chunk = self.next_link(chunk);
            }
        }
        let usage = MemUsage {
            inuse: self.total_size() - total_free,
            free: total_free,
        };
        if mode & 8 != 0 {
            report(&format!(
                "Totals:  inuse={} bytes   free={} bytes",
                usage.inuse, usage.free
            ));
        }
        usage
    }
}
