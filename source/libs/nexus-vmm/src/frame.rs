// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Frame allocator collaborator boundary.
//!
//! The simulator never manages backing storage itself; it asks an external
//! allocator for opaque frame references and reports every retain/release so
//! the allocator can keep copy-on-write sharing counts.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Opaque reference to a backing frame handed out by the allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameRef(pub u64);

/// External allocator of backing frames.
///
/// `allocate` may block; callers must not hold translation locks across it.
pub trait FrameAllocator: Send + Sync {
    /// Hands out a fresh frame with a reference count of one, or `None`
    /// when the backing store is exhausted.
    fn allocate(&self) -> Option<FrameRef>;
    /// Drops one reference; the frame is reclaimed at zero.
    fn release(&self, frame: FrameRef);
    /// Adds one reference for a sharing mapper.
    fn retain(&self, frame: FrameRef);
}

/// Sequential allocator with per-frame reference counts.
///
/// Default collaborator for the simulation and the test double used by the
/// crate's own tests. Frame numbers are never reused, which makes stale
/// references easy to spot in assertions.
pub struct CountingFrames {
    inner: Mutex<CountingInner>,
}

struct CountingInner {
    next: u64,
    live: HashMap<FrameRef, u32>,
    limit: Option<usize>,
}

impl CountingFrames {
    pub fn new() -> Self {
        Self { inner: Mutex::new(CountingInner { next: 1, live: HashMap::new(), limit: None }) }
    }

    /// Caps the number of simultaneously live frames.
    pub fn with_limit(limit: usize) -> Self {
        let allocator = Self::new();
        allocator.inner.lock().limit = Some(limit);
        allocator
    }

    /// Number of frames currently live.
    pub fn live(&self) -> usize {
        self.inner.lock().live.len()
    }

    /// Reference count of `frame`, if it is live.
    pub fn refcount(&self, frame: FrameRef) -> Option<u32> {
        self.inner.lock().live.get(&frame).copied()
    }
}

impl Default for CountingFrames {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAllocator for CountingFrames {
    fn allocate(&self) -> Option<FrameRef> {
        let mut inner = self.inner.lock();
        if let Some(limit) = inner.limit {
            if inner.live.len() >= limit {
                return None;
            }
        }
        let frame = FrameRef(inner.next);
        inner.next += 1;
        inner.live.insert(frame, 1);
        Some(frame)
    }

    fn release(&self, frame: FrameRef) {
        let mut inner = self.inner.lock();
        match inner.live.get(&frame).copied() {
            Some(count) if count > 1 => {
                inner.live.insert(frame, count - 1);
            }
            Some(_) => {
                inner.live.remove(&frame);
            }
            None => log::warn!(target: "vmm", "release of unknown frame {frame:?}"),
        }
    }

    fn retain(&self, frame: FrameRef) {
        let mut inner = self.inner.lock();
        match inner.live.get_mut(&frame) {
            Some(count) => *count += 1,
            None => log::warn!(target: "vmm", "retain of unknown frame {frame:?}"),
        }
    }
}
