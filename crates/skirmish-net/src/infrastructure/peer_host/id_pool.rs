//! Player id allocation for the server.

use std::collections::BTreeSet;

use skirmish_core::PlayerId;

/// Hands out the lowest free player id in `1..=capacity`.
#[derive(Debug, Clone)]
pub struct PlayerIdPool {
    in_use: BTreeSet<PlayerId>,
    capacity: PlayerId,
}

impl PlayerIdPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            in_use: BTreeSet::new(),
            capacity: PlayerId::try_from(capacity).unwrap_or(PlayerId::MAX),
        }
    }

    /// `None` when every id is taken.
    pub fn acquire(&mut self) -> Option<PlayerId> {
        let id = (1..=self.capacity).find(|id| !self.in_use.contains(id))?;
        self.in_use.insert(id);
        Some(id)
    }

    pub fn release(&mut self, id: PlayerId) {
        self.in_use.remove(&id);
    }

    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }
}
