// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-access translation state machine and demand-fault resolution.
//!
//! A request consults the core's cache, then the page table, then the area
//! registry. Only the final demand-populate step mutates the table, inside a
//! single write-locked section, so readers never observe a half-built leaf.
//! The frame is obtained with no lock held and the registry is re-validated
//! afterwards: a resolution racing a protection change either finishes
//! entirely before it or re-reads the post-change state — it is never torn.

use core::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, VmError};
use crate::frame::FrameRef;
use crate::page_table::Pte;
use crate::shootdown::CoreId;
use crate::space::AddressSpace;
use crate::tlb::{TlbCache, TlbEntry};
use crate::vma::AccessKind;

/// Which tier served a successful translation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TranslationSource {
    Cache,
    Walk,
    Fault,
}

/// Successful translation of one access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Translation {
    pub frame: FrameRef,
    pub source: TranslationSource,
}

impl AddressSpace {
    /// Translates `vaddr` for `access` on `core`, resolving a demand fault
    /// if the page is not yet materialized. All failures are returned; no
    /// partial state survives a failed request.
    pub fn translate(&self, vaddr: usize, access: AccessKind, core: CoreId) -> Result<Translation> {
        self.ensure_live()?;
        if vaddr >= self.config.geometry.max_va() {
            self.stats.unmapped_faults.fetch_add(1, Ordering::Relaxed);
            return Err(VmError::Unmapped { addr: vaddr });
        }
        let tlb = self.core_tlb(core)?;
        let vpn = self.config.geometry.vpn(vaddr);

        {
            let generation = self.generation();
            let mut tlb = tlb.lock();
            if let Some(entry) = tlb.lookup(vpn, generation) {
                if !entry.prot.permits(access) {
                    drop(tlb);
                    self.stats.protection_faults.fetch_add(1, Ordering::Relaxed);
                    return Err(VmError::Protection { addr: vaddr, access });
                }
                // A write through a clean entry must reach the table to set
                // the dirty bit; treat it as a miss.
                if !(access == AccessKind::Write && !entry.dirty) {
                    self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Translation { frame: entry.frame, source: TranslationSource::Cache });
                }
            }
        }
        self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);

        self.stats.walks.fetch_add(1, Ordering::Relaxed);
        let walked = {
            let table = self.table.read();
            // The generation is read under the same lock that covers the
            // walk, so a cached copy can never be newer than its source.
            table.walk(vpn).map(|pte| (pte, self.generation()))
        };
        if let Some((pte, generation)) = walked {
            self.stats.walk_hits.fetch_add(1, Ordering::Relaxed);
            if !pte.prot.permits(access) {
                self.stats.protection_faults.fetch_add(1, Ordering::Relaxed);
                return Err(VmError::Protection { addr: vaddr, access });
            }
            let mut entry =
                TlbEntry { vpn, frame: pte.frame, prot: pte.prot, dirty: pte.dirty, generation };
            if access == AccessKind::Write && !pte.dirty {
                let mut table = self.table.write();
                if table.mark_dirty(vpn) {
                    entry.dirty = true;
                    entry.generation = self.generation();
                } else {
                    // The leaf vanished between the two lock sections; the
                    // access is a genuine fault after all.
                    drop(table);
                    return self.resolve_fault(vaddr, vpn, access, &tlb);
                }
            }
            tlb.lock().insert(entry);
            return Ok(Translation { frame: entry.frame, source: TranslationSource::Walk });
        }

        self.resolve_fault(vaddr, vpn, access, &tlb)
    }

    /// Demand-populates `vpn` after a true miss, or reports the fault.
    fn resolve_fault(
        &self,
        vaddr: usize,
        vpn: usize,
        access: AccessKind,
        tlb: &Arc<Mutex<TlbCache>>,
    ) -> Result<Translation> {
        // Validate against the registry before paying for a frame.
        let candidate = {
            let vmas = self.vmas.read();
            vmas.find(vaddr).copied()
        };
        let candidate = match candidate {
            None => {
                self.stats.unmapped_faults.fetch_add(1, Ordering::Relaxed);
                return Err(VmError::Unmapped { addr: vaddr });
            }
            Some(vma) if !vma.prot.permits(access) => {
                self.stats.protection_faults.fetch_add(1, Ordering::Relaxed);
                return Err(VmError::Protection { addr: vaddr, access });
            }
            Some(vma) => vma,
        };
        let frame = self.obtain_frame(&candidate, vpn)?;

        // Re-validate with the locks held: the registry may have changed
        // while the allocator blocked.
        let vmas = self.vmas.read();
        let vma = match vmas.find(vaddr).copied() {
            Some(vma) => vma,
            None => {
                drop(vmas);
                self.discard_frame(frame);
                self.stats.unmapped_faults.fetch_add(1, Ordering::Relaxed);
                return Err(VmError::Unmapped { addr: vaddr });
            }
        };
        if vma.id != candidate.id || vma.backing != candidate.backing || vma.sharing != candidate.sharing
        {
            // The area was replaced underneath us; start over against the
            // current registry.
            drop(vmas);
            self.discard_frame(frame);
            return self.resolve_fault(vaddr, vpn, access, tlb);
        }
        if !vma.prot.permits(access) {
            drop(vmas);
            self.discard_frame(frame);
            self.stats.protection_faults.fetch_add(1, Ordering::Relaxed);
            return Err(VmError::Protection { addr: vaddr, access });
        }

        let mut table = self.table.write();
        if let Some(existing) = table.walk(vpn) {
            // Another core materialized this page first; ride its entry.
            if !existing.prot.permits(access) {
                drop(table);
                drop(vmas);
                self.discard_frame(frame);
                self.stats.protection_faults.fetch_add(1, Ordering::Relaxed);
                return Err(VmError::Protection { addr: vaddr, access });
            }
            let mut pte = existing;
            if access == AccessKind::Write && !pte.dirty {
                table.mark_dirty(vpn);
                pte.dirty = true;
            }
            let generation = self.generation();
            drop(table);
            drop(vmas);
            self.discard_frame(frame);
            self.stats.faults_resolved.fetch_add(1, Ordering::Relaxed);
            tlb.lock().insert(TlbEntry {
                vpn,
                frame: pte.frame,
                prot: pte.prot,
                dirty: pte.dirty,
                generation,
            });
            return Ok(Translation { frame: pte.frame, source: TranslationSource::Fault });
        }

        let pte = Pte { frame, prot: vma.prot, dirty: access == AccessKind::Write };
        table.ensure_leaf(vpn, pte);
        let generation = self.generation();
        drop(table);
        drop(vmas);
        self.stats.faults_resolved.fetch_add(1, Ordering::Relaxed);
        tlb.lock().insert(TlbEntry { vpn, frame, prot: pte.prot, dirty: pte.dirty, generation });
        Ok(Translation { frame, source: TranslationSource::Fault })
    }
}
