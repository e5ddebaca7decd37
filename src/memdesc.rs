// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmarena contributors
//
// Per-process debug descriptors: human-readable tags attached to chunks so
// memuse reports and corruption diagnostics can say what a chunk was for.
// The registry is process-local and never touches shared memory.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::arena::Arena;

fn registry() -> &'static Mutex<HashMap<usize, String>> {
    static REGISTRY: OnceLock<Mutex<HashMap<usize, String>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Tag for a chunk offset; empty when none was recorded.
pub(crate) fn lookup(chunk: usize) -> String {
    registry()
        .lock()
        .unwrap()
        .get(&chunk)
        .cloned()
        .unwrap_or_default()
}

impl Arena {
    /// Record a descriptive tag for an allocation (`desc = Some(..)`), or
    /// look the current tag up (`desc = None`). Returns the tag in effect;
    /// an untagged chunk reads as the empty string, a null pointer as
    /// `"null ptr"`.
    pub fn memdesc(&self, ptr: *mut u8, desc: Option<&str>) -> String {
        if ptr.is_null() {
            return "null ptr".to_string();
        }
        let chunk = self.ptr2chunk(ptr);
        let mut map = registry().lock().unwrap();
        match desc {
            Some(d) => {
                map.insert(chunk, d.to_string());
                d.to_string()
            }
            None => map.get(&chunk).cloned().unwrap_or_default(),
        }
    }

    /// Drop the tag for an allocation, typically right before freeing it.
    pub fn memdescfree(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        registry().lock().unwrap().remove(&self.ptr2chunk(ptr));
    }
}
