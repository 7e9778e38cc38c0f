// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Radix page table with lazy allocation of intermediate levels.
//!
//! Levels are owned maps indexed by the virtual-page-number slice for their
//! depth; a table exists only while at least one leaf lives beneath it, and
//! `clear` reclaims tables that lose their last child. Presence of a leaf
//! entry is the present bit; the entry itself carries the effective
//! protection and the dirty state.

use std::collections::BTreeMap;

use crate::addr::TableGeometry;
use crate::frame::FrameRef;
use crate::vma::Protection;

/// Leaf translation entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pte {
    pub frame: FrameRef,
    pub prot: Protection,
    pub dirty: bool,
}

enum Node {
    Interior(BTreeMap<usize, Node>),
    Leaf(BTreeMap<usize, Pte>),
}

/// Lazily-populated multi-level translation structure.
pub struct PageTable {
    geometry: TableGeometry,
    root: Node,
    leaves: usize,
}

impl PageTable {
    pub fn new(geometry: TableGeometry) -> Self {
        let root = if geometry.levels <= 1 {
            Node::Leaf(BTreeMap::new())
        } else {
            Node::Interior(BTreeMap::new())
        };
        Self { geometry, root, leaves: 0 }
    }

    pub fn geometry(&self) -> TableGeometry {
        self.geometry
    }

    /// Number of populated leaf entries.
    pub fn leaves(&self) -> usize {
        self.leaves
    }

    /// Number of allocated tables, including the root.
    pub fn node_count(&self) -> usize {
        fn count(node: &Node) -> usize {
            match node {
                Node::Leaf(_) => 1,
                Node::Interior(children) => 1 + children.values().map(count).sum::<usize>(),
            }
        }
        count(&self.root)
    }

    /// Read-only traversal; `None` when any level on the path is absent.
    pub fn walk(&self, vpn: usize) -> Option<Pte> {
        let mut node = &self.root;
        let mut depth = 0;
        loop {
            let idx = self.geometry.index_at(vpn, depth);
            match node {
                Node::Leaf(ptes) => return ptes.get(&idx).copied(),
                Node::Interior(children) => node = children.get(&idx)?,
            }
            depth += 1;
        }
    }

    /// Materializes the leaf for `vpn`, allocating missing intermediate
    /// tables on demand. Installs `pte` only if the slot was vacant; the
    /// returned reference is the live entry either way.
    pub fn ensure_leaf(&mut self, vpn: usize, pte: Pte) -> &mut Pte {
        let geometry = self.geometry;
        let leaves = &mut self.leaves;
        let mut node = &mut self.root;
        let mut depth = 0;
        loop {
            let idx = geometry.index_at(vpn, depth);
            match node {
                Node::Leaf(ptes) => {
                    return ptes.entry(idx).or_insert_with(|| {
                        *leaves += 1;
                        pte
                    });
                }
                Node::Interior(children) => {
                    let child_is_leaf = depth + 2 == geometry.levels;
                    node = children.entry(idx).or_insert_with(|| {
                        if child_is_leaf {
                            Node::Leaf(BTreeMap::new())
                        } else {
                            Node::Interior(BTreeMap::new())
                        }
                    });
                }
            }
            depth += 1;
        }
    }

    /// Sets the dirty bit on a present leaf; false when the leaf is absent.
    pub fn mark_dirty(&mut self, vpn: usize) -> bool {
        let mut node = &mut self.root;
        let mut depth = 0;
        loop {
            let idx = self.geometry.index_at(vpn, depth);
            match node {
                Node::Leaf(ptes) => {
                    return match ptes.get_mut(&idx) {
                        Some(pte) => {
                            pte.dirty = true;
                            true
                        }
                        None => false,
                    };
                }
                Node::Interior(children) => match children.get_mut(&idx) {
                    Some(child) => node = child,
                    None => return false,
                },
            }
            depth += 1;
        }
    }

    /// Applies `prot` to every populated leaf in the page range. Absent
    /// leaves stay absent and pick up their flags from the owning area when
    /// they are first materialized. Returns the number of updated leaves.
    pub fn set_flags(&mut self, vpns: core::ops::Range<usize>, prot: Protection) -> usize {
        if vpns.start >= vpns.end {
            return 0;
        }
        let geometry = self.geometry;
        Self::set_flags_node(&mut self.root, &geometry, 0, 0, &vpns, prot)
    }

    fn set_flags_node(
        node: &mut Node,
        geometry: &TableGeometry,
        depth: u32,
        base: usize,
        vpns: &core::ops::Range<usize>,
        prot: Protection,
    ) -> usize {
        match node {
            Node::Leaf(ptes) => {
                let lo = vpns.start.max(base) - base;
                let hi = vpns.end.min(base + geometry.fanout()) - base;
                if lo >= hi {
                    return 0;
                }
                let mut updated = 0;
                for (_, pte) in ptes.range_mut(lo..hi) {
                    pte.prot = prot;
                    updated += 1;
                }
                updated
            }
            Node::Interior(children) => {
                let span = geometry.span_at(depth);
                let mut updated = 0;
                for (idx, child) in children.iter_mut() {
                    let child_base = base + idx * span;
                    if child_base + span <= vpns.start || child_base >= vpns.end {
                        continue;
                    }
                    updated +=
                        Self::set_flags_node(child, geometry, depth + 1, child_base, vpns, prot);
                }
                updated
            }
        }
    }

    /// Removes every leaf in the page range and reclaims tables left with no
    /// children. Returns the frames the removed leaves referenced; ownership
    /// of releasing them stays with the caller.
    pub fn clear(&mut self, vpns: core::ops::Range<usize>) -> Vec<FrameRef> {
        let mut freed = Vec::new();
        if vpns.start < vpns.end {
            let geometry = self.geometry;
            Self::clear_node(&mut self.root, &geometry, 0, 0, &vpns, &mut freed);
            self.leaves -= freed.len();
        }
        freed
    }

    fn clear_node(
        node: &mut Node,
        geometry: &TableGeometry,
        depth: u32,
        base: usize,
        vpns: &core::ops::Range<usize>,
        freed: &mut Vec<FrameRef>,
    ) -> bool {
        match node {
            Node::Leaf(ptes) => {
                let lo = vpns.start.max(base) - base;
                let hi = vpns.end.min(base + geometry.fanout()) - base;
                if lo < hi {
                    let doomed: Vec<usize> = ptes.range(lo..hi).map(|(idx, _)| *idx).collect();
                    for idx in doomed {
                        let pte = ptes.remove(&idx).expect("collected leaf index must exist");
                        freed.push(pte.frame);
                    }
                }
                ptes.is_empty()
            }
            Node::Interior(children) => {
                let span = geometry.span_at(depth);
                let mut emptied = Vec::new();
                for (idx, child) in children.iter_mut() {
                    let child_base = base + idx * span;
                    if child_base + span <= vpns.start || child_base >= vpns.end {
                        continue;
                    }
                    if Self::clear_node(child, geometry, depth + 1, child_base, vpns, freed) {
                        emptied.push(*idx);
                    }
                }
                for idx in emptied {
                    children.remove(&idx);
                }
                children.is_empty()
            }
        }
    }
}
