// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Bounded per-core cache of recent translations.
//!
//! Entries are derived data and never authoritative: an entry is usable only
//! while its owning generation matches the address space's current
//! generation, and a mismatch is indistinguishable from a miss. Recency is
//! tracked by position (most recent first); the scan is O(capacity), which
//! the small fixed capacity keeps cheap.

use crate::frame::FrameRef;
use crate::vma::Protection;

/// Default number of entries a core's cache holds.
pub const DEFAULT_TLB_CAPACITY: usize = 64;

/// Cached translation for one virtual page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlbEntry {
    pub vpn: usize,
    pub frame: FrameRef,
    pub prot: Protection,
    pub dirty: bool,
    pub generation: u64,
}

/// Fixed-capacity cache with least-recently-used eviction.
pub struct TlbCache {
    entries: Vec<TlbEntry>,
    capacity: usize,
}

impl TlbCache {
    pub fn new(capacity: usize) -> Self {
        Self { entries: Vec::new(), capacity: capacity.max(1) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up `vpn`, promoting a hit to most-recently-used. An entry whose
    /// generation differs from `generation` is dropped and reported as a
    /// miss.
    pub fn lookup(&mut self, vpn: usize, generation: u64) -> Option<TlbEntry> {
        let pos = self.entries.iter().position(|entry| entry.vpn == vpn)?;
        let entry = self.entries.remove(pos);
        if entry.generation != generation {
            return None;
        }
        self.entries.insert(0, entry);
        Some(entry)
    }

    /// Inserts or replaces the entry for its page, evicting the
    /// least-recently-used entry when the cache is full.
    pub fn insert(&mut self, entry: TlbEntry) {
        if let Some(pos) = self.entries.iter().position(|cached| cached.vpn == entry.vpn) {
            self.entries.remove(pos);
        } else if self.entries.len() >= self.capacity {
            self.entries.pop();
        }
        self.entries.insert(0, entry);
    }

    /// Drops every entry whose page falls in `vpns`.
    pub fn invalidate(&mut self, vpns: core::ops::Range<usize>) {
        self.entries.retain(|entry| !vpns.contains(&entry.vpn));
    }

    /// Drops everything; used when precise invalidation is not worth it.
    pub fn invalidate_all(&mut self) {
        self.entries.clear();
    }
}
