//! Entity identifiers.
//!
//! Every simulated object (a plane, a bullet, a missile, a decoy) is named by a
//! [`GameId`]: the player who created it plus a per-process object counter.
//! Two peers never mint the same id because their player ids differ; the
//! server mints world-owned objects under [`WORLD_PLAYER`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Player identifier assigned by the server on connect.
pub type PlayerId = i16;

/// Player id used for entities owned by the world rather than a player.
pub const WORLD_PLAYER: PlayerId = -1;

/// Object id reserved for the player itself in lifecycle messages.
pub const PLAYER_OBJECT: u32 = 0;

/// Composite identifier of a simulated object.
///
/// Equality and hashing are structural, so a `GameId` decoded from the wire
/// compares equal to the one the sender minted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GameId {
    /// Owning player, or [`WORLD_PLAYER`].
    pub player_id: PlayerId,
    /// Monotonic per-process counter value.
    pub object_id: u32,
}

impl GameId {
    /// Creates an identifier from its two parts.
    pub const fn new(player_id: PlayerId, object_id: u32) -> Self {
        Self {
            player_id,
            object_id,
        }
    }

    /// The identifier naming a player itself (object id 0).
    pub const fn player(player_id: PlayerId) -> Self {
        Self::new(player_id, PLAYER_OBJECT)
    }

    /// Returns `true` when the world, not a player, owns this object.
    pub fn is_world_owned(&self) -> bool {
        self.player_id == WORLD_PLAYER
    }
}

impl fmt::Display for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}:{}", self.player_id, self.object_id)
    }
}
