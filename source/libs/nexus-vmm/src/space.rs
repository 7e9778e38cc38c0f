// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Address-space state and the protection-change pipeline.
//!
//! One `AddressSpace` owns the area registry, the page table, the per-core
//! translation caches, and the generation counter that ties them together.
//! Lock discipline: the registry lock is taken before the table lock,
//! everywhere. Fault resolution runs under read locks (plus a short table
//! write section to materialize one leaf); `protect` and `unmap` hold both
//! write locks across their mutation steps, bump the generation while still
//! holding them, and only then run the invalidation handshake with no lock
//! held that a translation needs.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use log::{debug, error};
use parking_lot::{Mutex, RwLock};

use crate::addr::{PageRange, TableGeometry};
use crate::error::{Result, VmError};
use crate::frame::{FrameAllocator, FrameRef};
use crate::page_table::PageTable;
use crate::shootdown::{self, CoreId, CoreLink, Message};
use crate::tlb::{TlbCache, DEFAULT_TLB_CAPACITY};
use crate::vma::{Backing, MapSharing, Protection, Vma, VmaId, VmaRegistry};

/// Time an initiator waits for every invalidation acknowledgment.
pub const DEFAULT_ACK_BUDGET: Duration = Duration::from_millis(200);

/// Tunables of one address space.
#[derive(Clone, Copy, Debug)]
pub struct SpaceConfig {
    pub geometry: TableGeometry,
    pub tlb_capacity: usize,
    pub ack_budget: Duration,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            geometry: TableGeometry::default(),
            tlb_capacity: DEFAULT_TLB_CAPACITY,
            ack_budget: DEFAULT_ACK_BUDGET,
        }
    }
}

/// Monotonic counters describing translation traffic.
#[derive(Default)]
pub(crate) struct SpaceStats {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub walks: AtomicU64,
    pub walk_hits: AtomicU64,
    pub faults_resolved: AtomicU64,
    pub protection_faults: AtomicU64,
    pub unmapped_faults: AtomicU64,
    pub shootdowns: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub walks: u64,
    pub walk_hits: u64,
    pub faults_resolved: u64,
    pub protection_faults: u64,
    pub unmapped_faults: u64,
    pub shootdowns: u64,
}

impl SpaceStats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            walks: self.walks.load(Ordering::Relaxed),
            walk_hits: self.walk_hits.load(Ordering::Relaxed),
            faults_resolved: self.faults_resolved.load(Ordering::Relaxed),
            protection_faults: self.protection_faults.load(Ordering::Relaxed),
            unmapped_faults: self.unmapped_faults.load(Ordering::Relaxed),
            shootdowns: self.shootdowns.load(Ordering::Relaxed),
        }
    }
}

struct ResidentEntry {
    key: (u64, usize),
    mappers: u32,
}

/// Frames currently backing shared external pages, so a second mapping of
/// the same resource bytes retains the resident frame instead of allocating
/// a duplicate.
#[derive(Default)]
struct Residence {
    by_key: HashMap<(u64, usize), FrameRef>,
    by_frame: HashMap<FrameRef, ResidentEntry>,
}

/// A simulated process address space shared by several cores.
pub struct AddressSpace {
    pub(crate) config: SpaceConfig,
    pub(crate) vmas: RwLock<VmaRegistry>,
    pub(crate) table: RwLock<PageTable>,
    generation: AtomicU64,
    cores: RwLock<BTreeMap<CoreId, CoreLink>>,
    resident: Mutex<Residence>,
    allocator: Arc<dyn FrameAllocator>,
    pub(crate) stats: SpaceStats,
    poisoned: AtomicBool,
}

impl AddressSpace {
    pub fn new(config: SpaceConfig, allocator: Arc<dyn FrameAllocator>) -> Self {
        Self {
            config,
            vmas: RwLock::new(VmaRegistry::new(config.geometry.page_size())),
            table: RwLock::new(PageTable::new(config.geometry)),
            generation: AtomicU64::new(0),
            cores: RwLock::new(BTreeMap::new()),
            resident: Mutex::new(Residence::default()),
            allocator,
            stats: SpaceStats::default(),
            poisoned: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SpaceConfig {
        &self.config
    }

    /// Current coherence token. Advances on every protection-affecting
    /// mutation; cached translations from older generations are dead.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.is_poisoned() {
            Err(VmError::Poisoned)
        } else {
            Ok(())
        }
    }

    /// Adds a core and spawns its shootdown agent.
    pub fn register_core(&self, core: CoreId) -> Result<()> {
        let mut cores = self.cores.write();
        if cores.contains_key(&core) {
            return Err(VmError::CoreExists { core });
        }
        cores.insert(core, CoreLink::spawn(core, self.config.tlb_capacity));
        Ok(())
    }

    /// Removes a core, discarding its cache and stopping its agent.
    pub fn unregister_core(&self, core: CoreId) -> Result<()> {
        match self.cores.write().remove(&core) {
            Some(_) => Ok(()),
            None => Err(VmError::UnknownCore { core }),
        }
    }

    pub(crate) fn core_tlb(&self, core: CoreId) -> Result<Arc<Mutex<TlbCache>>> {
        self.cores
            .read()
            .get(&core)
            .map(|link| Arc::clone(&link.tlb))
            .ok_or(VmError::UnknownCore { core })
    }

    fn check_span(&self, range: PageRange) -> Result<()> {
        if range.is_empty() {
            return Err(VmError::InvalidRange);
        }
        if range.end > self.config.geometry.max_va() {
            return Err(VmError::OutOfRange);
        }
        Ok(())
    }

    fn vpn_range(&self, range: &PageRange) -> core::ops::Range<usize> {
        self.config.geometry.vpn(range.start)..self.config.geometry.vpn(range.end)
    }

    /// Registers a new area. Nothing is materialized in the page table;
    /// leaves appear on first fault.
    pub fn map(
        &self,
        range: PageRange,
        prot: Protection,
        sharing: MapSharing,
        backing: Backing,
    ) -> Result<VmaId> {
        self.ensure_live()?;
        self.check_span(range)?;
        let id = self.vmas.write().map(range, prot, sharing, backing)?;
        debug!(target: "vmm", "map {range} {prot:?} {sharing:?}");
        Ok(id)
    }

    /// Removes every mapping in `range`, releases the frames that backed it,
    /// and runs the invalidation handshake for the removed pages.
    pub fn unmap(&self, range: PageRange, initiator: CoreId) -> Result<()> {
        self.ensure_live()?;
        self.check_span(range)?;
        self.core_tlb(initiator)?;
        let (removed, freed) = {
            let mut vmas = self.vmas.write();
            let mut table = self.table.write();
            let removed = vmas.unmap(range)?;
            let mut freed = Vec::new();
            for cut in &removed {
                freed.extend(table.clear(self.vpn_range(cut)));
            }
            if !removed.is_empty() {
                self.generation.fetch_add(1, Ordering::AcqRel);
            }
            (removed, freed)
        };
        for frame in freed {
            self.discard_frame(frame);
        }
        if !removed.is_empty() {
            debug!(target: "vmm", "unmap {range}: {} range(s) removed", removed.len());
            self.invalidate_cores(&removed, initiator)?;
        }
        Ok(())
    }

    /// Changes the protection of `range` and blocks until every other core
    /// has acknowledged the invalidation of the affected translations.
    pub fn protect(&self, range: PageRange, prot: Protection, initiator: CoreId) -> Result<()> {
        self.ensure_live()?;
        self.check_span(range)?;
        self.core_tlb(initiator)?;
        let affected = {
            let mut vmas = self.vmas.write();
            let mut table = self.table.write();
            let affected = vmas.protect(range, prot)?;
            for cut in &affected {
                table.set_flags(self.vpn_range(cut), prot);
            }
            // Advance the token while still exclusive, so any resolution
            // that finishes after this point carries the new generation.
            self.generation.fetch_add(1, Ordering::AcqRel);
            affected
        };
        debug!(target: "vmm", "protect {range} -> {prot:?}: {} range(s) affected", affected.len());
        if !affected.is_empty() {
            self.invalidate_cores(&affected, initiator)?;
        }
        Ok(())
    }

    /// Steps 5 and 6 of a protection change: remote handshake, then the
    /// initiator's own cache.
    fn invalidate_cores(&self, ranges: &[PageRange], initiator: CoreId) -> Result<()> {
        let vpns: Vec<core::ops::Range<usize>> =
            ranges.iter().map(|range| self.vpn_range(range)).collect();
        let cores = self.cores.read();
        let targets: Vec<(CoreId, Sender<Message>)> = cores
            .iter()
            .filter(|(core, _)| **core != initiator)
            .map(|(core, link)| (*core, link.sender()))
            .collect();
        self.stats.shootdowns.fetch_add(1, Ordering::Relaxed);
        if let Err(core) = shootdown::broadcast(&targets, &vpns, self.config.ack_budget) {
            self.poisoned.store(true, Ordering::Release);
            error!(target: "vmm", "core {core} missed the ack budget; poisoning address space");
            return Err(VmError::ShootdownTimeout { core });
        }
        if let Some(link) = cores.get(&initiator) {
            shootdown::apply_invalidation(&link.tlb, &vpns);
        }
        Ok(())
    }

    /// Produces a frame for `vpn` of `vma`, sharing resident frames between
    /// shared mappings of the same external bytes. Runs without any
    /// translation lock held; the allocator may block.
    pub(crate) fn obtain_frame(&self, vma: &Vma, vpn: usize) -> Result<FrameRef> {
        let key = match (vma.sharing, vma.backing) {
            (MapSharing::Shared, Backing::External { handle, offset }) => {
                let rel = (vpn << self.config.geometry.page_shift) - vma.range.start;
                (handle, (offset + rel) >> self.config.geometry.page_shift)
            }
            _ => return self.allocator.allocate().ok_or(VmError::OutOfFrames),
        };
        {
            let mut resident = self.resident.lock();
            if let Some(frame) = resident.by_key.get(&key).copied() {
                resident
                    .by_frame
                    .get_mut(&frame)
                    .expect("residence maps are kept in step")
                    .mappers += 1;
                self.allocator.retain(frame);
                return Ok(frame);
            }
        }
        // Allocate outside the residence lock; a racing mapper of the same
        // bytes may beat us, in which case our frame goes straight back.
        let fresh = self.allocator.allocate().ok_or(VmError::OutOfFrames)?;
        let mut resident = self.resident.lock();
        if let Some(existing) = resident.by_key.get(&key).copied() {
            resident
                .by_frame
                .get_mut(&existing)
                .expect("residence maps are kept in step")
                .mappers += 1;
            self.allocator.retain(existing);
            drop(resident);
            self.allocator.release(fresh);
            return Ok(existing);
        }
        resident.by_key.insert(key, fresh);
        resident.by_frame.insert(fresh, ResidentEntry { key, mappers: 1 });
        Ok(fresh)
    }

    /// Drops one mapper's claim on `frame` and returns it to the allocator.
    pub(crate) fn discard_frame(&self, frame: FrameRef) {
        let mut resident = self.resident.lock();
        if let Some(entry) = resident.by_frame.get_mut(&frame) {
            entry.mappers -= 1;
            if entry.mappers == 0 {
                let key = entry.key;
                resident.by_frame.remove(&frame);
                resident.by_key.remove(&key);
            }
        }
        drop(resident);
        self.allocator.release(frame);
    }

    /// Renders the registry in the canonical one-line-per-area format.
    pub fn snapshot(&self) -> String {
        crate::snapshot::render(&self.vmas.read())
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        // Teardown releases whatever the table still references.
        let end_vpn = self.config.geometry.vpn(self.config.geometry.max_va());
        let freed = self.table.get_mut().clear(0..end_vpn);
        for frame in freed {
            let resident = self.resident.get_mut();
            if let Some(entry) = resident.by_frame.get_mut(&frame) {
                entry.mappers -= 1;
                if entry.mappers == 0 {
                    let key = entry.key;
                    resident.by_frame.remove(&frame);
                    resident.by_key.remove(&key);
                }
            }
            self.allocator.release(frame);
        }
    }
}
