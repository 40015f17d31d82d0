//! Which transport channel each message kind travels on.

use skirmish_core::protocol::messages::Payload;

use crate::infrastructure::transport::{ChannelId, Delivery};

/// Transport channels used by the sync layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Channel {
    /// Session lifecycle, clock sync, game state and scores.  Reliable.
    Control = 0,
    /// Plane and missile state.  Unreliable; only the newest matters.
    Position = 1,
    /// Creations, batches, retire notices and chat.  Reliable.
    Entity = 2,
    /// Damage.  Reliable.
    Impact = 3,
}

impl Channel {
    pub fn for_payload(payload: &Payload) -> Channel {
        match payload {
            Payload::AssignId { .. }
            | Payload::SyncRequest { .. }
            | Payload::SyncResponse(_)
            | Payload::ResyncRequest
            | Payload::GameState(_)
            | Payload::PlayerDisconnect
            | Payload::PlayerReset
            | Payload::Kick { .. }
            | Payload::Score(_) => Channel::Control,
            Payload::PlaneUpdate(_) | Payload::MissileUpdate(_) => Channel::Position,
            Payload::NewPlane(_)
            | Payload::NewBullet(_)
            | Payload::NewMissile(_)
            | Payload::NewDecoy(_)
            | Payload::EntityRetired
            | Payload::Chat(_)
            | Payload::Batch(_) => Channel::Entity,
            Payload::Impact(_) => Channel::Impact,
        }
    }

    pub fn from_id(id: ChannelId) -> Option<Channel> {
        match id {
            0 => Some(Channel::Control),
            1 => Some(Channel::Position),
            2 => Some(Channel::Entity),
            3 => Some(Channel::Impact),
            _ => None,
        }
    }

    pub fn id(self) -> ChannelId {
        self as ChannelId
    }

    pub fn delivery(self) -> Delivery {
        match self {
            Channel::Position => Delivery::Unreliable,
            Channel::Control | Channel::Entity | Channel::Impact => Delivery::Reliable,
        }
    }

    /// `true` if the server forwards this channel's frames to the other
    /// peers as they arrive.  Control traffic is point-to-point.
    pub fn relayed(self) -> bool {
        !matches!(self, Channel::Control)
    }
}
