// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Cross-core invalidation handshake.
//!
//! Every registered core owns a mailbox serviced by a dedicated agent
//! thread, so a core acknowledges invalidations even while it is not
//! translating. The initiator broadcasts one request per target core and
//! blocks until every target has applied the invalidation and acknowledged,
//! bounded by the configured budget; a silent core is an error, never
//! ignored. All coordination is request/acknowledge messages — the only
//! state an agent touches is its own core's cache.

use core::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::tlb::TlbCache;

/// Identifier of a simulated core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoreId(pub u32);

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) enum Message {
    /// Drop cached translations for the listed page ranges, then
    /// acknowledge.
    Invalidate { vpns: Vec<core::ops::Range<usize>>, ack: Sender<CoreId> },
    Shutdown,
}

/// A registered core's cache plus the mailbox its agent services.
pub(crate) struct CoreLink {
    pub(crate) tlb: Arc<Mutex<TlbCache>>,
    tx: Sender<Message>,
    agent: Option<JoinHandle<()>>,
}

impl CoreLink {
    pub(crate) fn spawn(core: CoreId, tlb_capacity: usize) -> Self {
        let tlb = Arc::new(Mutex::new(TlbCache::new(tlb_capacity)));
        let agent_tlb = Arc::clone(&tlb);
        let (tx, rx) = unbounded();
        let agent = thread::Builder::new()
            .name(format!("vmm-shootdown-{core}"))
            .spawn(move || agent_loop(core, agent_tlb, rx))
            .expect("spawning a shootdown agent cannot fail on a healthy host");
        Self { tlb, tx, agent: Some(agent) }
    }

    pub(crate) fn sender(&self) -> Sender<Message> {
        self.tx.clone()
    }
}

impl Drop for CoreLink {
    fn drop(&mut self) {
        let _ = self.tx.send(Message::Shutdown);
        if let Some(agent) = self.agent.take() {
            let _ = agent.join();
        }
    }
}

fn agent_loop(core: CoreId, tlb: Arc<Mutex<TlbCache>>, rx: Receiver<Message>) {
    while let Ok(message) = rx.recv() {
        match message {
            Message::Invalidate { vpns, ack } => {
                #[cfg(feature = "failpoints")]
                if failpoints::take_deny_ack() {
                    log::warn!(target: "vmm", "core {core}: dropping invalidation ack");
                    continue;
                }
                apply_invalidation(&tlb, &vpns);
                let _ = ack.send(core);
            }
            Message::Shutdown => break,
        }
    }
}

/// Applies an invalidation to one cache, clearing wholesale when the request
/// spans at least as many pages as the cache can hold.
pub(crate) fn apply_invalidation(tlb: &Mutex<TlbCache>, vpns: &[core::ops::Range<usize>]) {
    let mut tlb = tlb.lock();
    let pages: usize = vpns.iter().map(|range| range.end.saturating_sub(range.start)).sum();
    if pages >= tlb.capacity() {
        tlb.invalidate_all();
        return;
    }
    for range in vpns {
        tlb.invalidate(range.clone());
    }
}

/// Sends one invalidation per target and waits for every acknowledgment.
/// Returns the first core that failed to acknowledge within `budget`.
pub(crate) fn broadcast(
    targets: &[(CoreId, Sender<Message>)],
    vpns: &[core::ops::Range<usize>],
    budget: Duration,
) -> core::result::Result<(), CoreId> {
    if targets.is_empty() {
        return Ok(());
    }
    let (ack_tx, ack_rx) = bounded(targets.len());
    let mut pending: Vec<CoreId> = Vec::with_capacity(targets.len());
    for (core, tx) in targets {
        let message = Message::Invalidate { vpns: vpns.to_vec(), ack: ack_tx.clone() };
        if tx.send(message).is_err() {
            // A torn-down mailbox can never acknowledge.
            return Err(*core);
        }
        pending.push(*core);
    }
    drop(ack_tx);

    let deadline = Instant::now() + budget;
    while !pending.is_empty() {
        match ack_rx.recv_deadline(deadline) {
            Ok(core) => pending.retain(|acked| *acked != core),
            Err(_) => return Err(pending[0]),
        }
    }
    Ok(())
}

#[cfg(feature = "failpoints")]
pub mod failpoints {
    //! Deterministic fault injection for exercising failure paths in tests.

    use core::sync::atomic::{AtomicBool, Ordering};

    static DENY_NEXT_ACK: AtomicBool = AtomicBool::new(false);

    /// Makes the next agent that receives an invalidation drop its
    /// acknowledgment (and skip the invalidation), forcing the initiator
    /// into its timeout path.
    pub fn deny_next_ack() {
        DENY_NEXT_ACK.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_deny_ack() -> bool {
        DENY_NEXT_ACK.swap(false, Ordering::SeqCst)
    }
}
