// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy shared by every public operation.

use thiserror::Error;

use crate::shootdown::CoreId;
use crate::vma::AccessKind;

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, VmError>;

/// Errors surfaced by address-space operations.
///
/// Faults (`Unmapped`, `Protection`) are terminal for the triggering access
/// but leave the address space fully usable; `ShootdownTimeout` poisons it.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum VmError {
    /// Address, length, or backing offset was not page aligned.
    #[error("address or length is not page aligned")]
    Unaligned,
    /// Range was empty or inverted.
    #[error("range is empty or inverted")]
    InvalidRange,
    /// Range extends beyond the configured address width.
    #[error("range exceeds the canonical address width")]
    OutOfRange,
    /// Requested range intersects an existing mapping.
    #[error("range overlaps an existing mapping")]
    Overlap,
    /// No mapping covers the address (the simulated segmentation fault).
    #[error("no mapping covers {addr:#x}")]
    Unmapped { addr: usize },
    /// Access kind is not permitted by the current protection.
    #[error("{access} access to {addr:#x} denied by current protection")]
    Protection { addr: usize, access: AccessKind },
    /// A core failed to acknowledge an invalidation within the budget.
    #[error("core {core} did not acknowledge invalidation in time")]
    ShootdownTimeout { core: CoreId },
    /// The core id has not been registered with this address space.
    #[error("core {core} is not registered with this address space")]
    UnknownCore { core: CoreId },
    /// The core id is already registered with this address space.
    #[error("core {core} is already registered")]
    CoreExists { core: CoreId },
    /// The external frame allocator could not provide a frame.
    #[error("frame allocator is exhausted")]
    OutOfFrames,
    /// A failed shootdown left the address space inconsistent.
    #[error("address space was poisoned by a failed shootdown")]
    Poisoned,
}
