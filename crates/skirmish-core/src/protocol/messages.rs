//! The Skirmish message catalog.
//!
//! Every datagram carries exactly one [`NetMessage`]: a subject id, the
//! sender's frame time, and one variant of the closed [`Payload`] sum type.
//! The first byte of an encoded frame is the [`MessageKind`] of the payload.

use serde::{Deserialize, Serialize};

use crate::domain::entity::{EntityKind, Kinematics, Pilot};
use crate::domain::game_id::{GameId, PlayerId};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Size of the frame header: kind (1) + player id (2) + object id (4) + frame time (8).
pub const HEADER_SIZE: usize = 15;

/// Maximum number of messages carried by one [`Payload::Batch`].
pub const MAX_BATCH_SIZE: usize = 32;

/// Upper bound on the decompressed size of a frame.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

// ── Message kinds ─────────────────────────────────────────────────────────────

/// Leading byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    // Session and lifecycle (0x01–0x1F)
    AssignId = 0x01,
    SyncRequest = 0x02,
    SyncResponse = 0x03,
    ResyncRequest = 0x04,
    GameState = 0x05,
    PlayerDisconnect = 0x06,
    PlayerReset = 0x07,
    Kick = 0x08,
    Chat = 0x09,
    Score = 0x0A,
    EntityRetired = 0x0B,
    // Entity creation (0x20–0x2F)
    NewPlane = 0x20,
    NewBullet = 0x21,
    NewMissile = 0x22,
    NewDecoy = 0x23,
    // Entity state (0x30–0x3F)
    PlaneUpdate = 0x30,
    MissileUpdate = 0x31,
    // Damage (0x40–0x4F)
    Impact = 0x40,
    // Containers (0x50–0x5F)
    Batch = 0x50,
}

impl TryFrom<u8> for MessageKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(MessageKind::AssignId),
            0x02 => Ok(MessageKind::SyncRequest),
            0x03 => Ok(MessageKind::SyncResponse),
            0x04 => Ok(MessageKind::ResyncRequest),
            0x05 => Ok(MessageKind::GameState),
            0x06 => Ok(MessageKind::PlayerDisconnect),
            0x07 => Ok(MessageKind::PlayerReset),
            0x08 => Ok(MessageKind::Kick),
            0x09 => Ok(MessageKind::Chat),
            0x0A => Ok(MessageKind::Score),
            0x0B => Ok(MessageKind::EntityRetired),
            0x20 => Ok(MessageKind::NewPlane),
            0x21 => Ok(MessageKind::NewBullet),
            0x22 => Ok(MessageKind::NewMissile),
            0x23 => Ok(MessageKind::NewDecoy),
            0x30 => Ok(MessageKind::PlaneUpdate),
            0x31 => Ok(MessageKind::MissileUpdate),
            0x40 => Ok(MessageKind::Impact),
            0x50 => Ok(MessageKind::Batch),
            _ => Err(()),
        }
    }
}

// ── Per-message payload structs ───────────────────────────────────────────────

/// SYNC_RESPONSE (0x03): the responder's half of a clock exchange.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Requester's send time, echoed.
    pub t0: f64,
    /// Responder's receive time.
    pub t1: f64,
    /// Responder's send time.
    pub t2: f64,
}

/// GAME_STATE (0x05): global simulation settings broadcast by the server.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GameState {
    /// Hours, `0.0..24.0`.
    pub time_of_day: f32,
    pub paused: bool,
    /// Simulation speed multiplier.
    pub speed: f32,
}

impl Default for GameState {
    fn default() -> Self {
        Self {
            time_of_day: 12.0,
            paused: false,
            speed: 1.0,
        }
    }
}

/// CHAT (0x09).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub sender: String,
    pub text: String,
}

/// SCORE (0x0A): scoreboard entry for the player named by the message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Score {
    pub kills: u16,
    pub deaths: u16,
    pub points: i32,
}

/// NEW_PLANE (0x20).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPlane {
    pub pilot: Pilot,
    pub kinematics: Kinematics,
    pub health: f32,
}

/// NEW_BULLET (0x21) and NEW_DECOY (0x23).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Launch {
    /// Plane that fired.
    pub owner: GameId,
    pub kinematics: Kinematics,
}

/// NEW_MISSILE (0x22).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MissileLaunch {
    pub owner: GameId,
    pub target: Option<GameId>,
    pub kinematics: Kinematics,
}

/// PLANE_UPDATE (0x30).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlaneUpdate {
    pub kinematics: Kinematics,
    /// `0.0..=1.0`.
    pub throttle: f32,
    pub health: f32,
}

/// MISSILE_UPDATE (0x31).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MissileUpdate {
    pub kinematics: Kinematics,
    pub target: Option<GameId>,
}

/// IMPACT (0x40): damage dealt by the weapon named in the message id.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Impact {
    /// Entity that was hit.
    pub target: GameId,
    /// Kind of the weapon entity named by the message id.
    pub weapon: EntityKind,
    pub damage: f32,
    /// Victim pose as the sender saw it at the moment of the hit.
    pub hit: Kinematics,
    /// Per-sender sequence number used to drop duplicate deliveries.
    pub sequence: u32,
    /// Player that reported the hit and numbered it.
    pub reporter: PlayerId,
}

// ── Top-level message ─────────────────────────────────────────────────────────

/// The closed set of payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    AssignId { player_id: PlayerId },
    SyncRequest { t0: f64 },
    SyncResponse(SyncResponse),
    ResyncRequest,
    GameState(GameState),
    PlayerDisconnect,
    PlayerReset,
    Kick { reason: String },
    Chat(Chat),
    Score(Score),
    EntityRetired,
    NewPlane(NewPlane),
    NewBullet(Launch),
    NewMissile(MissileLaunch),
    NewDecoy(Launch),
    PlaneUpdate(PlaneUpdate),
    MissileUpdate(MissileUpdate),
    Impact(Impact),
    /// At most [`MAX_BATCH_SIZE`] non-batch messages.
    Batch(Vec<NetMessage>),
}

impl Payload {
    /// Returns the [`MessageKind`] discriminant for this payload.
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::AssignId { .. } => MessageKind::AssignId,
            Payload::SyncRequest { .. } => MessageKind::SyncRequest,
            Payload::SyncResponse(_) => MessageKind::SyncResponse,
            Payload::ResyncRequest => MessageKind::ResyncRequest,
            Payload::GameState(_) => MessageKind::GameState,
            Payload::PlayerDisconnect => MessageKind::PlayerDisconnect,
            Payload::PlayerReset => MessageKind::PlayerReset,
            Payload::Kick { .. } => MessageKind::Kick,
            Payload::Chat(_) => MessageKind::Chat,
            Payload::Score(_) => MessageKind::Score,
            Payload::EntityRetired => MessageKind::EntityRetired,
            Payload::NewPlane(_) => MessageKind::NewPlane,
            Payload::NewBullet(_) => MessageKind::NewBullet,
            Payload::NewMissile(_) => MessageKind::NewMissile,
            Payload::NewDecoy(_) => MessageKind::NewDecoy,
            Payload::PlaneUpdate(_) => MessageKind::PlaneUpdate,
            Payload::MissileUpdate(_) => MessageKind::MissileUpdate,
            Payload::Impact(_) => MessageKind::Impact,
            Payload::Batch(_) => MessageKind::Batch,
        }
    }
}

/// One message: subject id, origin frame time, payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetMessage {
    /// Entity or player the message is about.
    pub id: GameId,
    /// Origin timestamp in the sender's network clock, seconds.
    pub frame_time: f64,
    pub payload: Payload,
}

impl NetMessage {
    pub fn new(id: GameId, frame_time: f64, payload: Payload) -> Self {
        Self {
            id,
            frame_time,
            payload,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Seconds elapsed since the sender stamped this message.
    pub fn age(&self, now: f64) -> f64 {
        now - self.frame_time
    }
}

/// Packs `items` into as few batches as [`MAX_BATCH_SIZE`] allows.
///
/// A chunk holding a single message is emitted unwrapped.  Batches are stamped
/// with `id` and `frame_time`; the items keep their own.
pub fn batch_messages(id: GameId, frame_time: f64, items: Vec<NetMessage>) -> Vec<NetMessage> {
    let mut out = Vec::with_capacity(items.len().div_ceil(MAX_BATCH_SIZE));
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        let mut chunk: Vec<NetMessage> = iter.by_ref().take(MAX_BATCH_SIZE).collect();
        if chunk.len() == 1 {
            out.extend(chunk.pop());
        } else {
            out.push(NetMessage::new(id, frame_time, Payload::Batch(chunk)));
        }
    }
    out
}
