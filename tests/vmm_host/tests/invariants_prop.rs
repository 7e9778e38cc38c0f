// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Property-based tests for the vmm simulator
//! NOTE: A per-page model shadows every operation; the registry and the
//! full address space must agree with it after arbitrary op sequences.
//!
//! TEST_SCOPE:
//!   - Registry ordering/non-overlap/normalization invariants
//!   - Translation consistency: translate succeeds iff a covering area
//!     permits the access
//!   - Generation monotonicity across successful protects

use std::collections::BTreeMap;

use proptest::prelude::*;

use nexus_vmm::{
    AccessKind, Backing, CoreId, MapSharing, PageRange, Protection, VmaRegistry,
};
use vmm_host::space_with_cores;

const PAGE: usize = 4096;
const ARENA_PAGES: usize = 64;

#[derive(Clone, Copy, Debug)]
enum Op {
    Map { page: usize, pages: usize, prot: Protection },
    Unmap { page: usize, pages: usize },
    Protect { page: usize, pages: usize, prot: Protection },
}

fn arb_prot() -> impl Strategy<Value = Protection> {
    (0u8..8).prop_map(Protection::from_bits_truncate)
}

fn arb_op() -> impl Strategy<Value = Op> {
    let span = || (0usize..ARENA_PAGES, 1usize..8);
    prop_oneof![
        (span(), arb_prot()).prop_map(|((page, pages), prot)| Op::Map { page, pages, prot }),
        span().prop_map(|(page, pages)| Op::Unmap { page, pages }),
        (span(), arb_prot()).prop_map(|((page, pages), prot)| Op::Protect { page, pages, prot }),
    ]
}

fn range_of(page: usize, pages: usize) -> PageRange {
    let end = (page + pages).min(ARENA_PAGES);
    PageRange::new(page * PAGE, end * PAGE)
}

/// Applies `op` to the shadow model, mirroring the expected outcome.
/// Returns whether the real operation must succeed.
fn apply_to_model(model: &mut BTreeMap<usize, Protection>, op: Op) -> bool {
    match op {
        Op::Map { page, pages, prot } => {
            let end = (page + pages).min(ARENA_PAGES);
            if (page..end).any(|p| model.contains_key(&p)) {
                return false;
            }
            for p in page..end {
                model.insert(p, prot);
            }
            true
        }
        Op::Unmap { page, pages } => {
            let end = (page + pages).min(ARENA_PAGES);
            for p in page..end {
                model.remove(&p);
            }
            true
        }
        Op::Protect { page, pages, prot } => {
            let end = (page + pages).min(ARENA_PAGES);
            if !(page..end).all(|p| model.contains_key(&p)) {
                return false;
            }
            for p in page..end {
                model.insert(p, prot);
            }
            true
        }
    }
}

proptest! {
    #[test]
    fn registry_matches_the_page_model(ops in proptest::collection::vec(arb_op(), 1..24)) {
        let mut registry = VmaRegistry::new(PAGE);
        let mut model: BTreeMap<usize, Protection> = BTreeMap::new();

        for op in ops {
            let range = match op {
                Op::Map { page, pages, .. }
                | Op::Unmap { page, pages }
                | Op::Protect { page, pages, .. } => range_of(page, pages),
            };
            if range.is_empty() {
                continue;
            }
            let must_succeed = apply_to_model(&mut model, op);
            let outcome = match op {
                Op::Map { prot, .. } => {
                    registry.map(range, prot, MapSharing::Private, Backing::Anonymous).map(|_| ())
                }
                Op::Unmap { .. } => registry.unmap(range).map(|_| ()),
                Op::Protect { prot, .. } => registry.protect(range, prot).map(|_| ()),
            };
            prop_assert_eq!(outcome.is_ok(), must_succeed, "op {:?} disagreed with model", op);
            prop_assert!(registry.verify().is_ok(), "invariants broken after {:?}", op);
        }

        for page in 0..ARENA_PAGES {
            let found = registry.find(page * PAGE).map(|vma| vma.prot);
            prop_assert_eq!(found, model.get(&page).copied(), "page {} coverage", page);
        }
    }

    #[test]
    fn translation_agrees_with_the_model_and_generations_climb(
        ops in proptest::collection::vec(arb_op(), 1..16),
    ) {
        let (space, _) = space_with_cores(1);
        let mut model: BTreeMap<usize, Protection> = BTreeMap::new();

        for op in ops {
            let range = match op {
                Op::Map { page, pages, .. }
                | Op::Unmap { page, pages }
                | Op::Protect { page, pages, .. } => range_of(page, pages),
            };
            if range.is_empty() {
                continue;
            }
            let must_succeed = apply_to_model(&mut model, op);
            let generation_before = space.generation();
            let outcome = match op {
                Op::Map { prot, .. } => {
                    space.map(range, prot, MapSharing::Private, Backing::Anonymous).map(|_| ())
                }
                Op::Unmap { .. } => space.unmap(range, CoreId(0)),
                Op::Protect { prot, .. } => space.protect(range, prot, CoreId(0)),
            };
            prop_assert_eq!(outcome.is_ok(), must_succeed);
            if outcome.is_ok() {
                if let Op::Protect { .. } = op {
                    prop_assert!(space.generation() > generation_before);
                }
            }
            prop_assert!(space.generation() >= generation_before);
        }

        for page in 0..ARENA_PAGES {
            let addr = page * PAGE;
            let expected = model.get(&page).copied();
            for access in [AccessKind::Read, AccessKind::Write, AccessKind::Execute] {
                let granted = space.translate(addr, access, CoreId(0)).is_ok();
                let permitted = expected.map_or(false, |prot| prot.permits(access));
                prop_assert_eq!(granted, permitted, "page {} access {}", page, access);
            }
        }
    }
}
