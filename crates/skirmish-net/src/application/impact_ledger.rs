//! Damage bookkeeping.
//!
//! [`ImpactLedger`] is the server's record of every impact applied to each
//! player since that player last respawned.  A client joining mid-match gets
//! the whole ledger replayed so its view of everyone's damage matches.
//!
//! [`ImpactFilter`] drops duplicate deliveries.  Each impact carries the
//! reporting player and that player's sequence number, so
//! `(reporter, sequence)` identifies it uniquely; the filter remembers a
//! bounded window of those keys.  The weapon owner is not part of the key:
//! any peer may report a hit by anyone's weapon.

use std::collections::{HashMap, HashSet, VecDeque};

use skirmish_core::protocol::messages::{NetMessage, Payload};
use skirmish_core::PlayerId;

// ── Ledger ────────────────────────────────────────────────────────────────────

/// Impacts per victim player, in the order they were applied.
#[derive(Debug, Default)]
pub struct ImpactLedger {
    by_victim: HashMap<PlayerId, Vec<NetMessage>>,
}

impl ImpactLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an applied impact against `victim`.  Non-impact messages are
    /// ignored.
    pub fn record(&mut self, victim: PlayerId, message: NetMessage) {
        if matches!(message.payload, Payload::Impact(_)) {
            self.by_victim.entry(victim).or_default().push(message);
        }
    }

    /// Forgets everything recorded against `victim`.  Returns how many
    /// impacts were dropped.
    pub fn clear(&mut self, victim: PlayerId) -> usize {
        self.by_victim.remove(&victim).map_or(0, |v| v.len())
    }

    pub fn impacts_for(&self, victim: PlayerId) -> &[NetMessage] {
        self.by_victim.get(&victim).map_or(&[], Vec::as_slice)
    }

    /// Every recorded impact, grouped by victim in ascending player order.
    pub fn replay(&self) -> Vec<NetMessage> {
        let mut victims: Vec<&PlayerId> = self.by_victim.keys().collect();
        victims.sort();
        victims
            .into_iter()
            .flat_map(|v| self.by_victim[v].iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_victim.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Duplicate filter ──────────────────────────────────────────────────────────

/// Identifies one impact across every delivery of it.
pub type ImpactKey = (PlayerId, u32);

/// Sliding window of recently applied impact keys.
#[derive(Debug)]
pub struct ImpactFilter {
    order: VecDeque<ImpactKey>,
    seen: HashSet<ImpactKey>,
    window: usize,
}

impl ImpactFilter {
    pub fn new(window: usize) -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            window: window.max(1),
        }
    }

    pub fn contains(&self, key: &ImpactKey) -> bool {
        self.seen.contains(key)
    }

    /// Remembers `key`.  Returns `false` if it was already present.
    pub fn insert(&mut self, key: ImpactKey) -> bool {
        if !self.seen.insert(key) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > self.window {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    /// Drops every key reported by `reporter`.  Returns how many went.
    pub fn forget_reporter(&mut self, reporter: PlayerId) -> usize {
        let before = self.order.len();
        self.order.retain(|(r, _)| *r != reporter);
        self.seen.retain(|(r, _)| *r != reporter);
        before - self.order.len()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
