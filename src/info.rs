// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmarena contributors
//
// The shared info slot: a single offset-typed field in the arena header
// used to bootstrap user-defined cross-process structures. All three
// operations run under the arena-wide lock; the compare-and-set is the
// primitive joiners use to elect exactly one initializer.

use std::io;
use std::ptr;

use crate::arena::Arena;

impl Arena {
    /// Publish `ptr` (a payload pointer inside this arena, or null to
    /// clear) in the shared info slot.
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation from this arena; the stored
    /// offset is resolved back to a pointer by every attacher.
    pub unsafe fn put_info(&self, ptr: *mut u8) -> io::Result<()> {
        let off = if ptr.is_null() {
            0
        } else {
            self.ptr2chunk(ptr) as u64
        };
        let _g = self.guard()?;
        unsafe { (*self.header()).info_offset = off };
        Ok(())
    }

    /// Read the info slot and resolve it to a pointer in this process's
    /// mapping. Always returns the freshly read shared value, never a
    /// cached copy. Null means unset.
    pub fn get_info(&self) -> io::Result<*mut u8> {
        let _g = self.guard()?;
        let off = unsafe { (*self.header()).info_offset };
        Ok(self.resolve_info(off))
    }

    /// Atomically snapshot the current info pointer and replace it with
    /// `new` (null clears the slot). Returns the prior pointer.
    ///
    /// Serialized by the arena-wide lock, so for any set of racing callers
    /// exactly one observes each predecessor value; this is the
    /// initializer-election primitive.
    ///
    /// # Safety
    /// As [`Arena::put_info`].
    pub unsafe fn cas_info(&self, new: *mut u8) -> io::Result<*mut u8> {
        let newoff = if new.is_null() {
            0
        } else {
            self.ptr2chunk(new) as u64
        };
        let _g = self.guard()?;
        let old = unsafe { (*self.header()).info_offset };
        unsafe { (*self.header()).info_offset = newoff };
        Ok(self.resolve_info(old))
    }

    fn resolve_info(&self, off: u64) -> *mut u8 {
        if off == 0 {
            ptr::null_mut()
        } else {
            self.chunk2ptr(off as usize)
        }
    }
}
