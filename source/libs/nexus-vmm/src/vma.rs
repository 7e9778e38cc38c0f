// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Ordered registry of virtual memory areas.
//!
//! The registry owns every area of one address space, keyed by start address
//! in a `BTreeMap`. Areas are pairwise non-overlapping and kept normalized:
//! adjacent areas with identical protection, sharing, and contiguous backing
//! are merged eagerly, so the map is always the minimal description of the
//! address space.

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::collections::BTreeMap;

use bitflags::bitflags;

use crate::addr::PageRange;
use crate::error::{Result, VmError};

bitflags! {
    /// Protection bits carried by a mapping.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Protection: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl Protection {
    /// True when `access` is allowed under these bits.
    pub fn permits(self, access: AccessKind) -> bool {
        match access {
            AccessKind::Read => self.contains(Self::READ),
            AccessKind::Write => self.contains(Self::WRITE),
            AccessKind::Execute => self.contains(Self::EXECUTE),
        }
    }
}

/// Kind of access a translation request performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessKind::Read => f.write_str("read"),
            AccessKind::Write => f.write_str("write"),
            AccessKind::Execute => f.write_str("execute"),
        }
    }
}

/// Sharing discipline of a mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapSharing {
    /// Copy-on-write private mapping; frames are never shared with peers.
    Private,
    /// Mappings of the same backing resource observe the same frames.
    Shared,
}

/// What backs a mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backing {
    Anonymous,
    /// External resource identified by an opaque handle, mapped at a
    /// page-aligned byte offset.
    External { handle: u64, offset: usize },
}

impl Backing {
    /// Backing as seen `delta` bytes further into the area; used when an
    /// area is split so the tail keeps addressing the same resource bytes.
    fn slide(self, delta: usize) -> Backing {
        match self {
            Backing::Anonymous => Backing::Anonymous,
            Backing::External { handle, offset } => {
                Backing::External { handle, offset: offset + delta }
            }
        }
    }
}

/// Identifier of a registered area; survives reflagging but not splits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VmaId(pub u64);

/// One contiguous, flag-uniform area of the address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Vma {
    pub id: VmaId,
    pub range: PageRange,
    pub prot: Protection,
    pub sharing: MapSharing,
    pub backing: Backing,
}

impl Vma {
    /// True when `right` starts where `self` ends and both describe the
    /// same protection, sharing, and contiguous backing bytes.
    fn mergeable_into(&self, right: &Vma) -> bool {
        if self.range.end != right.range.start
            || self.prot != right.prot
            || self.sharing != right.sharing
        {
            return false;
        }
        match (self.backing, right.backing) {
            (Backing::Anonymous, Backing::Anonymous) => true,
            (
                Backing::External { handle: lh, offset: lo },
                Backing::External { handle: rh, offset: ro },
            ) => lh == rh && lo + self.range.len_bytes() == ro,
            _ => false,
        }
    }
}

const NO_HINT: usize = usize::MAX;

/// Ordered, non-overlapping set of areas for one address space.
pub struct VmaRegistry {
    page_size: usize,
    vmas: BTreeMap<usize, Vma>,
    next_id: u64,
    /// Start address of the most recently found area. Repeated faults hit
    /// the same area far more often than not, so this is consulted before
    /// the ordered search.
    hint: AtomicUsize,
}

impl VmaRegistry {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            vmas: BTreeMap::new(),
            next_id: 0,
            hint: AtomicUsize::new(NO_HINT),
        }
    }

    pub fn len(&self) -> usize {
        self.vmas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vmas.is_empty()
    }

    /// Areas in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = &Vma> {
        self.vmas.values()
    }

    fn alloc_id(&mut self) -> VmaId {
        self.next_id += 1;
        VmaId(self.next_id)
    }

    fn check_range(&self, range: PageRange) -> Result<()> {
        if range.is_empty() {
            return Err(VmError::InvalidRange);
        }
        if range.start % self.page_size != 0 || range.end % self.page_size != 0 {
            return Err(VmError::Unaligned);
        }
        Ok(())
    }

    /// Registers a new area. Fails without mutation if the range is invalid
    /// or intersects an existing area. Returns the id of the surviving area,
    /// which may be a neighbor the new range was merged into.
    pub fn map(
        &mut self,
        range: PageRange,
        prot: Protection,
        sharing: MapSharing,
        backing: Backing,
    ) -> Result<VmaId> {
        self.check_range(range)?;
        if let Backing::External { offset, .. } = backing {
            if offset % self.page_size != 0 {
                return Err(VmError::Unaligned);
            }
        }
        if let Some((_, prev)) = self.vmas.range(..range.end).next_back() {
            if prev.range.end > range.start {
                return Err(VmError::Overlap);
            }
        }
        let id = self.alloc_id();
        self.vmas.insert(range.start, Vma { id, range, prot, sharing, backing });
        self.merge_span(range);
        self.hint.store(NO_HINT, Ordering::Relaxed);
        let surviving = self.find(range.start).expect("mapped area must be findable");
        Ok(surviving.id)
    }

    /// Removes every page of `range` from the registry, splitting areas that
    /// are only partially covered. Returns the ranges actually removed, in
    /// ascending order; unmapping a hole is not an error.
    pub fn unmap(&mut self, range: PageRange) -> Result<Vec<PageRange>> {
        self.check_range(range)?;
        let keys: Vec<usize> = self
            .vmas
            .range(..range.end)
            .filter(|(_, vma)| vma.range.end > range.start)
            .map(|(start, _)| *start)
            .collect();
        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            let vma = self.vmas.remove(&key).expect("collected key must exist");
            let cut = vma.range.intersection(&range).expect("collected area intersects");
            if vma.range.start < cut.start {
                let mut head = vma;
                head.range.end = cut.start;
                self.vmas.insert(head.range.start, head);
            }
            if cut.end < vma.range.end {
                let delta = cut.end - vma.range.start;
                let tail = Vma {
                    // The head kept the original id; a surviving tail next to
                    // it needs its own.
                    id: if vma.range.start < cut.start { self.alloc_id() } else { vma.id },
                    range: PageRange::new(cut.end, vma.range.end),
                    prot: vma.prot,
                    sharing: vma.sharing,
                    backing: vma.backing.slide(delta),
                };
                self.vmas.insert(tail.range.start, tail);
            }
            removed.push(cut);
        }
        self.hint.store(NO_HINT, Ordering::Relaxed);
        Ok(removed)
    }

    /// Finds the area covering `addr`, consulting the last-hit hint before
    /// the ordered search.
    pub fn find(&self, addr: usize) -> Option<&Vma> {
        let hinted = self.hint.load(Ordering::Relaxed);
        if hinted != NO_HINT {
            if let Some(vma) = self.vmas.get(&hinted) {
                if vma.range.contains(addr) {
                    return Some(vma);
                }
            }
        }
        let (_, vma) = self.vmas.range(..=addr).next_back()?;
        if vma.range.contains(addr) {
            self.hint.store(vma.range.start, Ordering::Relaxed);
            Some(vma)
        } else {
            None
        }
    }

    /// Applies `prot` to every page of `range`. The range must be fully
    /// covered; partially covered areas are split so untouched pages keep
    /// their flags, and the result is re-merged with equal neighbors.
    /// Returns the previously-existing ranges whose effective flags changed.
    pub fn protect(&mut self, range: PageRange, prot: Protection) -> Result<Vec<PageRange>> {
        self.check_range(range)?;
        let mut cursor = range.start;
        for (_, vma) in self
            .vmas
            .range(..range.end)
            .filter(|(_, vma)| vma.range.end > range.start)
        {
            if vma.range.start > cursor {
                return Err(VmError::Unmapped { addr: cursor });
            }
            cursor = vma.range.end.min(range.end);
        }
        if cursor < range.end {
            return Err(VmError::Unmapped { addr: cursor });
        }

        let keys: Vec<usize> = self
            .vmas
            .range(..range.end)
            .filter(|(_, vma)| vma.range.end > range.start)
            .map(|(start, _)| *start)
            .collect();
        let mut affected = Vec::new();
        for key in keys {
            let vma = self.vmas.remove(&key).expect("collected key must exist");
            if vma.prot == prot {
                self.vmas.insert(key, vma);
                continue;
            }
            let cut = vma.range.intersection(&range).expect("collected area intersects");
            let fully_covered = cut == vma.range;
            if vma.range.start < cut.start {
                let mut head = vma;
                head.range.end = cut.start;
                self.vmas.insert(head.range.start, head);
            }
            let middle = Vma {
                id: if fully_covered { vma.id } else { self.alloc_id() },
                range: cut,
                prot,
                sharing: vma.sharing,
                backing: vma.backing.slide(cut.start - vma.range.start),
            };
            self.vmas.insert(middle.range.start, middle);
            if cut.end < vma.range.end {
                let tail = Vma {
                    id: self.alloc_id(),
                    range: PageRange::new(cut.end, vma.range.end),
                    prot: vma.prot,
                    sharing: vma.sharing,
                    backing: vma.backing.slide(cut.end - vma.range.start),
                };
                self.vmas.insert(tail.range.start, tail);
            }
            affected.push(cut);
        }
        self.merge_span(range);
        self.hint.store(NO_HINT, Ordering::Relaxed);
        Ok(affected)
    }

    /// Merges the right neighbor into `left` if the pair is mergeable.
    fn try_merge(&mut self, left: usize, right: usize) -> bool {
        let l = match self.vmas.get(&left) {
            Some(vma) => *vma,
            None => return false,
        };
        let r = match self.vmas.get(&right) {
            Some(vma) => *vma,
            None => return false,
        };
        if !l.mergeable_into(&r) {
            return false;
        }
        self.vmas.remove(&right);
        self.vmas
            .get_mut(&left)
            .expect("left side of merge must exist")
            .range
            .end = r.range.end;
        true
    }

    /// Re-normalizes the neighborhood of `range` after a mutation.
    fn merge_span(&mut self, range: PageRange) {
        let mut key = match self.vmas.range(..=range.start).next_back() {
            Some((&key, _)) => key,
            None => match self.vmas.range(range.start..).next() {
                Some((&key, _)) => key,
                None => return,
            },
        };
        loop {
            let end = match self.vmas.get(&key) {
                Some(vma) => vma.range.end,
                None => return,
            };
            if self.vmas.contains_key(&end) && self.try_merge(key, end) {
                continue;
            }
            match self.vmas.range(end..).next() {
                Some((&next, _)) if next <= range.end => key = next,
                _ => return,
            }
        }
    }

    /// Checks ordering, alignment, non-overlap, and merge normalization.
    pub fn verify(&self) -> core::result::Result<(), &'static str> {
        let mut prev: Option<&Vma> = None;
        for (key, vma) in &self.vmas {
            if *key != vma.range.start {
                return Err("key does not match area start");
            }
            if vma.range.is_empty() {
                return Err("empty area");
            }
            if vma.range.start % self.page_size != 0 || vma.range.end % self.page_size != 0 {
                return Err("unaligned area");
            }
            if let Some(prev) = prev {
                if prev.range.end > vma.range.start {
                    return Err("overlapping areas");
                }
                if prev.mergeable_into(vma) {
                    return Err("unmerged equal neighbors");
                }
            }
            prev = Some(vma);
        }
        Ok(())
    }
}
