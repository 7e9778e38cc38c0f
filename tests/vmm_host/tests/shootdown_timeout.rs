// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Shootdown failure injection for the vmm simulator
//! NOTE: Lives in its own binary; the deny-ack failpoint is process-global
//! and must not race other scenarios.

use std::time::Duration;

use nexus_vmm::{
    failpoints, AccessKind, Backing, CoreId, MapSharing, PageRange, Protection, SpaceConfig,
    VmError,
};
use vmm_host::space_with_config;

#[test]
fn silent_core_poisons_the_address_space() {
    let config = SpaceConfig { ack_budget: Duration::from_millis(50), ..SpaceConfig::default() };
    let (space, _) = space_with_config(config, 2);
    let rw = Protection::READ | Protection::WRITE;
    space
        .map(PageRange::new(0x7000, 0x8000), rw, MapSharing::Private, Backing::Anonymous)
        .unwrap();
    space.translate(0x7000, AccessKind::Write, CoreId(1)).unwrap();

    // Core 1's agent will swallow the next invalidation without acking.
    failpoints::deny_next_ack();
    assert_eq!(
        space.protect(PageRange::new(0x7000, 0x8000), Protection::READ, CoreId(0)),
        Err(VmError::ShootdownTimeout { core: CoreId(1) })
    );
    assert!(space.is_poisoned());

    // A poisoned space refuses everything afterwards.
    assert_eq!(
        space.translate(0x7000, AccessKind::Read, CoreId(1)),
        Err(VmError::Poisoned)
    );
    assert_eq!(
        space.map(PageRange::new(0x9000, 0xa000), rw, MapSharing::Private, Backing::Anonymous),
        Err(VmError::Poisoned)
    );
    assert_eq!(
        space.protect(PageRange::new(0x7000, 0x8000), rw, CoreId(0)),
        Err(VmError::Poisoned)
    );
    assert_eq!(space.unmap(PageRange::new(0x7000, 0x8000), CoreId(0)), Err(VmError::Poisoned));
}
