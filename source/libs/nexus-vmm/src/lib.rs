// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host-side simulator of per-process virtual memory management
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module; threaded + property suites in tests/vmm_host
//!
//! One [`AddressSpace`] models what a process owns inside a Unix-like
//! kernel: an ordered registry of virtual memory areas, a lazily-populated
//! radix page table, and a bounded per-core translation cache, tied
//! together by a generation counter. Translations resolve demand faults
//! through an external frame-allocator collaborator; protection changes
//! run a cross-core invalidation handshake before returning, so no core
//! observes stale permissions afterwards.

mod addr;
mod error;
mod frame;
mod page_table;
mod shootdown;
mod snapshot;
mod space;
#[cfg(test)]
mod tests_prop;
mod tlb;
mod translate;
mod vma;

pub use addr::{PageRange, TableGeometry};
pub use error::{Result, VmError};
pub use frame::{CountingFrames, FrameAllocator, FrameRef};
pub use page_table::{PageTable, Pte};
#[cfg(feature = "failpoints")]
pub use shootdown::failpoints;
pub use shootdown::CoreId;
pub use space::{AddressSpace, SpaceConfig, StatsSnapshot, DEFAULT_ACK_BUDGET};
pub use tlb::{TlbCache, TlbEntry, DEFAULT_TLB_CAPACITY};
pub use translate::{Translation, TranslationSource};
pub use vma::{AccessKind, Backing, MapSharing, Protection, Vma, VmaId, VmaRegistry};
