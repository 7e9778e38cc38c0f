// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the radix table and the cache bound
//! NOTE: Tests only; a flat map shadows the multi-level table, which must
//! agree with it after arbitrary populate/reflag/clear sequences.
//!
//! TEST_SCOPE:
//!   - walk/ensure_leaf/set_flags/clear equivalence against a flat model
//!   - intermediate tables fully reclaimed once the last leaf is gone
//!   - cache occupancy never exceeds its capacity

use std::collections::BTreeMap;

use proptest::prelude::*;

use crate::addr::TableGeometry;
use crate::frame::FrameRef;
use crate::page_table::{PageTable, Pte};
use crate::tlb::{TlbCache, TlbEntry};
use crate::vma::Protection;

const ARENA: usize = 64;

#[derive(Clone, Copy, Debug)]
enum TableOp {
    Ensure { vpn: usize, prot: Protection },
    SetFlags { lo: usize, len: usize, prot: Protection },
    Clear { lo: usize, len: usize },
}

fn arb_prot() -> impl Strategy<Value = Protection> {
    (0u8..8).prop_map(Protection::from_bits_truncate)
}

fn arb_table_op() -> impl Strategy<Value = TableOp> {
    prop_oneof![
        (0..ARENA, arb_prot()).prop_map(|(vpn, prot)| TableOp::Ensure { vpn, prot }),
        (0..ARENA, 1usize..16, arb_prot())
            .prop_map(|(lo, len, prot)| TableOp::SetFlags { lo, len, prot }),
        (0..ARENA, 1usize..16).prop_map(|(lo, len)| TableOp::Clear { lo, len }),
    ]
}

proptest! {
    #[test]
    fn table_matches_a_flat_model(ops in proptest::collection::vec(arb_table_op(), 1..32)) {
        // Narrow geometry so sequences cross level boundaries often.
        let geometry = TableGeometry { levels: 3, index_bits: 3, page_shift: 8 };
        let mut table = PageTable::new(geometry);
        let mut model: BTreeMap<usize, Pte> = BTreeMap::new();
        let mut next_frame = 1u64;

        for op in ops {
            match op {
                TableOp::Ensure { vpn, prot } => {
                    let pte = Pte { frame: FrameRef(next_frame), prot, dirty: false };
                    next_frame += 1;
                    table.ensure_leaf(vpn, pte);
                    model.entry(vpn).or_insert(pte);
                }
                TableOp::SetFlags { lo, len, prot } => {
                    let hi = (lo + len).min(ARENA);
                    table.set_flags(lo..hi, prot);
                    for (_, pte) in model.range_mut(lo..hi) {
                        pte.prot = prot;
                    }
                }
                TableOp::Clear { lo, len } => {
                    let hi = (lo + len).min(ARENA);
                    let freed = table.clear(lo..hi);
                    let expected: Vec<FrameRef> = {
                        let doomed: Vec<usize> = model.range(lo..hi).map(|(vpn, _)| *vpn).collect();
                        doomed.iter().map(|vpn| model.remove(vpn).unwrap().frame).collect()
                    };
                    prop_assert_eq!(freed, expected);
                }
            }
            for vpn in 0..ARENA {
                prop_assert_eq!(table.walk(vpn), model.get(&vpn).copied(), "vpn {}", vpn);
            }
            prop_assert_eq!(table.leaves(), model.len());
        }

        table.clear(0..ARENA);
        prop_assert_eq!(table.node_count(), 1, "empty table must shed every level");
    }

    #[test]
    fn cache_occupancy_never_exceeds_capacity(
        capacity in 1usize..16,
        vpns in proptest::collection::vec(0usize..32, 1..64),
    ) {
        let mut cache = TlbCache::new(capacity);
        for vpn in vpns {
            cache.insert(TlbEntry {
                vpn,
                frame: FrameRef(vpn as u64),
                prot: Protection::READ,
                dirty: false,
                generation: 0,
            });
            prop_assert!(cache.len() <= capacity);
            // The most recent insert is always resident.
            prop_assert!(cache.lookup(vpn, 0).is_some());
        }
    }
}
