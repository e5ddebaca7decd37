// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmarena contributors
//
// Pre-init arena configuration. An explicit value handed to `Arena::init`;
// nothing process-global.

use crate::layout::HEADER_SIZE;

/// Default allocatable segment size before the header is added.
pub const DEFAULT_SEGMENT: usize = 65536;

/// Default number of named-lock slots.
pub const DEFAULT_MAX_LOCKS: usize = 8;

/// Default permissions for the arena file and semaphore set.
pub const DEFAULT_PERMISSION: u32 = 0o700;

/// Configuration commands. The historical surface is kept whole: the
/// unsupported commands are accepted and ignored so callers written against
/// the full command set keep working.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigCmd {
    /// Reset every field to its default.
    Initialize,
    /// Set the allocatable size in bytes; returns the final mapping size.
    InitSize(usize),
    /// Set the named-lock slot count (clamped to at least 1).
    InitUsers(usize),
    /// Observe the configured mapping size.
    GetSize,
    /// Observe the configured lock-slot count.
    GetUsers,
    /// Permissions for the arena file and semaphore set.
    Chmod(u32),
    /// Preferred virtual address for the mapping.
    AttachAddr(usize),
    /// Accepted, ignored.
    ArenaType,
    /// Accepted, ignored.
    LockType,
    /// Accepted, ignored.
    AutoGrow,
    /// Accepted, ignored.
    AutoResv,
    /// Accepted, ignored.
    HistOn,
    /// Accepted, ignored.
    HistOff,
    /// Accepted, ignored.
    HistSize(usize),
    /// Accepted, ignored.
    HistFetch,
    /// Accepted, ignored.
    HistReset,
    /// Accepted, ignored.
    SThreadIoOn,
    /// Accepted, ignored.
    SThreadIoOff,
}

/// Arena parameters consumed by [`crate::Arena::init`].
///
/// `memsize` always includes the shared header; `init_size` does the
/// arithmetic from an allocatable-payload request.
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    memsize: usize,
    max_locks: usize,
    permission: u32,
    attach_addr: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            memsize: DEFAULT_SEGMENT + HEADER_SIZE,
            max_locks: DEFAULT_MAX_LOCKS,
            permission: DEFAULT_PERMISSION,
            attach_addr: 0,
        }
    }
}

impl ArenaConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request `bytes` of allocatable space. The stored size is the payload
    /// rounded to 8, plus the rounded header, plus the 8-byte offset-zero
    /// sentinel, rounded to 8 again. Returns the final mapping size.
    pub fn init_size(&mut self, bytes: usize) -> usize {
        let user = (bytes + 7) & !7;
        let header = (HEADER_SIZE + 7) & !7;
        self.memsize = (user + header + 8) & !7;
        self.memsize
    }

    /// Number of named-lock slots; the semaphore set gets one more for the
    /// arena-wide lock. Clamped to at least 1.
    pub fn max_locks(&mut self, n: usize) -> &mut Self {
        self.max_locks = n.max(1);
        self
    }

    /// Permissions for the arena file and semaphore set.
    pub fn permission(&mut self, perms: u32) -> &mut Self {
        self.permission = perms;
        self
    }

    /// Preferred virtual address for the mapping (0 = let the kernel pick).
    pub fn attach_addr(&mut self, addr: usize) -> &mut Self {
        self.attach_addr = addr;
        self
    }

    pub fn size(&self) -> usize {
        self.memsize
    }

    pub fn users(&self) -> usize {
        self.max_locks
    }

    pub fn perms(&self) -> u32 {
        self.permission
    }

    pub fn attach_hint(&self) -> usize {
        self.attach_addr
    }

    /// Command-style configuration. Returns the prior value for observable
    /// settings, the computed mapping size for `InitSize`, and -1 for the
    /// accepted-but-ignored commands.
    pub fn configure(&mut self, cmd: ConfigCmd) -> isize {
        match cmd {
            ConfigCmd::Initialize => {
                *self = Self::default();
                0
            }
            ConfigCmd::InitSize(bytes) => self.init_size(bytes) as isize,
            ConfigCmd::InitUsers(n) => {
                let prior = self.max_locks;
                self.max_locks(n);
                prior as isize
            }
            ConfigCmd::GetSize => self.memsize as isize,
            ConfigCmd::GetUsers => self.max_locks as isize,
            ConfigCmd::Chmod(perms) => {
                let prior = self.permission;
                self.permission = perms;
                prior as isize
            }
            ConfigCmd::AttachAddr(addr) => {
                let prior = self.attach_addr;
                self.attach_addr = addr;
                prior as isize
            }
            ConfigCmd::ArenaType
            | ConfigCmd::LockType
            | ConfigCmd::AutoGrow
            | ConfigCmd::AutoResv
            | ConfigCmd::HistOn
            | ConfigCmd::HistOff
            | ConfigCmd::HistSize(_)
            | ConfigCmd::HistFetch
            | ConfigCmd::HistReset
            | ConfigCmd::SThreadIoOn
            | ConfigCmd::SThreadIoOff => -1,
        }
    }
}
