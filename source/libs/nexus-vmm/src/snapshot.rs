// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Canonical text export of the area registry.
//!
//! One line per area in ascending address order:
//! `<start>-<end> <r|-><w|-><x|-><p|s> <offset> <backing-id>`
//! with hex bounds and offset. Anonymous areas print offset and backing 0.

use core::fmt::Write;

use crate::vma::{Backing, MapSharing, Protection, VmaRegistry};

pub(crate) fn render(vmas: &VmaRegistry) -> String {
    let mut out = String::new();
    for vma in vmas.iter() {
        let (offset, backing) = match vma.backing {
            Backing::Anonymous => (0, 0),
            Backing::External { handle, offset } => (offset, handle),
        };
        let _ = writeln!(
            out,
            "{:x}-{:x} {}{}{}{} {:x} {}",
            vma.range.start,
            vma.range.end,
            if vma.prot.contains(Protection::READ) { 'r' } else { '-' },
            if vma.prot.contains(Protection::WRITE) { 'w' } else { '-' },
            if vma.prot.contains(Protection::EXECUTE) { 'x' } else { '-' },
            match vma.sharing {
                MapSharing::Private => 'p',
                MapSharing::Shared => 's',
            },
            offset,
            backing,
        );
    }
    out
}
