// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Cross-core coherence scenarios for the vmm simulator
//! TESTS: stale-permission visibility after protect/unmap, concurrent
//! fault traffic racing protection changes, snapshot of a live space

use std::sync::Arc;
use std::thread;

use nexus_vmm::{
    AccessKind, Backing, CoreId, MapSharing, PageRange, Protection, TranslationSource, VmError,
};
use vmm_host::space_with_cores;

fn rw() -> Protection {
    Protection::READ | Protection::WRITE
}

#[test]
fn protect_return_means_no_core_sees_stale_permissions() {
    let (space, _) = space_with_cores(2);
    space
        .map(PageRange::new(0x7000, 0x8000), rw(), MapSharing::Private, Backing::Anonymous)
        .unwrap();

    // Core 1 populates its cache under rw.
    let populated = space.translate(0x7000, AccessKind::Write, CoreId(1)).unwrap();
    assert_eq!(populated.source, TranslationSource::Fault);
    let cached = space.translate(0x7000, AccessKind::Write, CoreId(1)).unwrap();
    assert_eq!(cached.source, TranslationSource::Cache);

    // Core 0 narrows the range; once this returns, core 1 must fault.
    space.protect(PageRange::new(0x7000, 0x8000), Protection::READ, CoreId(0)).unwrap();
    assert_eq!(
        space.translate(0x7000, AccessKind::Write, CoreId(1)),
        Err(VmError::Protection { addr: 0x7000, access: AccessKind::Write })
    );
    // Reading still works, against the already-populated leaf.
    assert!(space.translate(0x7000, AccessKind::Read, CoreId(1)).is_ok());
}

#[test]
fn unmap_return_means_no_core_resolves_the_dead_range() {
    let (space, frames) = space_with_cores(2);
    space
        .map(PageRange::new(0x7000, 0x9000), rw(), MapSharing::Private, Backing::Anonymous)
        .unwrap();
    space.translate(0x7000, AccessKind::Read, CoreId(1)).unwrap();
    space.translate(0x8000, AccessKind::Read, CoreId(1)).unwrap();
    assert_eq!(frames.live(), 2);

    space.unmap(PageRange::new(0x7000, 0x8000), CoreId(0)).unwrap();
    assert_eq!(
        space.translate(0x7000, AccessKind::Read, CoreId(1)),
        Err(VmError::Unmapped { addr: 0x7000 })
    );
    // The untouched tail keeps translating.
    assert!(space.translate(0x8000, AccessKind::Read, CoreId(1)).is_ok());
    assert_eq!(frames.live(), 1);
}

#[test]
fn every_registered_core_acknowledges_a_broadcast() {
    let (space, _) = space_with_cores(8);
    space
        .map(PageRange::new(0x4000, 0x5000), rw(), MapSharing::Private, Backing::Anonymous)
        .unwrap();
    for core in 0..8 {
        space.translate(0x4000, AccessKind::Read, CoreId(core)).unwrap();
    }
    // Blocks until all seven remote cores have acknowledged.
    space.protect(PageRange::new(0x4000, 0x5000), Protection::READ, CoreId(0)).unwrap();
    for core in 0..8 {
        assert_eq!(
            space.translate(0x4000, AccessKind::Write, CoreId(core)),
            Err(VmError::Protection { addr: 0x4000, access: AccessKind::Write })
        );
    }
}

#[test]
fn faulting_cores_race_protection_changes_without_tearing() {
    let (space, _) = space_with_cores(4);
    // Stable region each worker hammers, plus a contended region whose
    // write permission flips while they run.
    space
        .map(PageRange::new(0x10_0000, 0x20_0000), rw(), MapSharing::Private, Backing::Anonymous)
        .unwrap();
    space
        .map(PageRange::new(0x30_0000, 0x31_0000), rw(), MapSharing::Private, Backing::Anonymous)
        .unwrap();

    let workers: Vec<_> = (1..4)
        .map(|core| {
            let space = Arc::clone(&space);
            thread::spawn(move || {
                let mut state = core as usize * 7 + 1;
                for _ in 0..300 {
                    // Cheap deterministic page picker.
                    state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    let page = 0x10_0000 + (state >> 33 & 0xff) * 0x1000;
                    space
                        .translate(page, AccessKind::Read, CoreId(core))
                        .expect("stable region reads never fail");
                    match space.translate(0x30_0000, AccessKind::Write, CoreId(core)) {
                        Ok(_) | Err(VmError::Protection { .. }) => {}
                        other => panic!("torn observation: {other:?}"),
                    }
                }
            })
        })
        .collect();

    for _ in 0..50 {
        space.protect(PageRange::new(0x30_0000, 0x31_0000), Protection::READ, CoreId(0)).unwrap();
        space.protect(PageRange::new(0x30_0000, 0x31_0000), rw(), CoreId(0)).unwrap();
    }
    for worker in workers {
        worker.join().unwrap();
    }

    // Quiesced with write permission on: every core must succeed again.
    for core in 0..4 {
        space.translate(0x30_0000, AccessKind::Write, CoreId(core)).unwrap();
    }
}

#[test]
fn snapshot_reflects_split_and_merge_history() {
    let (space, _) = space_with_cores(1);
    space
        .map(PageRange::new(0x1000, 0x4000), rw(), MapSharing::Private, Backing::Anonymous)
        .unwrap();
    space.protect(PageRange::new(0x2000, 0x3000), Protection::READ, CoreId(0)).unwrap();
    assert_eq!(
        space.snapshot(),
        "1000-2000 rw-p 0 0\n\
         2000-3000 r--p 0 0\n\
         3000-4000 rw-p 0 0\n"
    );

    space.protect(PageRange::new(0x2000, 0x3000), rw(), CoreId(0)).unwrap();
    assert_eq!(space.snapshot(), "1000-4000 rw-p 0 0\n");
}
