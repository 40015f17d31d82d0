//! Simulated entities as seen by the network layer.
//!
//! The simulation owns the real objects.  These types carry only the state
//! that crosses the wire: where an object is, how fast it moves, who owns it,
//! and how much health it has left.

use std::f32::consts::PI;

use serde::{Deserialize, Serialize};

use super::game_id::GameId;

/// The four kinds of synchronised objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntityKind {
    Plane = 0x01,
    Bullet = 0x02,
    Missile = 0x03,
    Decoy = 0x04,
}

impl TryFrom<u8> for EntityKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(EntityKind::Plane),
            0x02 => Ok(EntityKind::Bullet),
            0x03 => Ok(EntityKind::Missile),
            0x04 => Ok(EntityKind::Decoy),
            _ => Err(()),
        }
    }
}

/// Two-component vector in world units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to `other`.
    pub fn distance(&self, other: &Vec2) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Position, velocity and heading of an object.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Kinematics {
    pub position: Vec2,
    pub velocity: Vec2,
    /// Heading in radians.
    pub rotation: f32,
}

impl Kinematics {
    pub const fn at(position: Vec2) -> Self {
        Self {
            position,
            velocity: Vec2::ZERO,
            rotation: 0.0,
        }
    }

    /// Returns the kinematics advanced by `seconds` of straight-line motion.
    pub fn extrapolated(&self, seconds: f32) -> Self {
        Self {
            position: Vec2::new(
                self.position.x + self.velocity.x * seconds,
                self.position.y + self.velocity.y * seconds,
            ),
            ..*self
        }
    }
}

/// Wraps an angle into `[-PI, PI)`.
pub fn wrap_angle(radians: f32) -> f32 {
    let wrapped = (radians + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped >= PI {
        wrapped - 2.0 * PI
    } else {
        wrapped
    }
}

/// RGB colour with channels in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Color {
    pub const fn new(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b }
    }
}

/// Who flies a plane.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Pilot {
    pub name: String,
    pub team: u8,
    pub is_ai: bool,
    pub color: Color,
}

/// A synchronised object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: GameId,
    pub kind: EntityKind,
    pub kinematics: Kinematics,
    pub health: f32,
    /// Engine setting, `0.0..=1.0`.  Meaningful for planes only.
    pub throttle: f32,
    /// Plane that launched a bullet, missile or decoy.
    pub owner: Option<GameId>,
    /// Entity a missile is homing on.
    pub target: Option<GameId>,
    /// Present for planes only.
    pub pilot: Option<Pilot>,
    /// Retired entities stay in the registry until the simulation prunes them.
    pub retired: bool,
    /// Stand-in created to resolve an impact whose weapon is already gone.
    pub placeholder: bool,
}

impl Entity {
    /// A live plane.
    pub fn plane(id: GameId, pilot: Pilot, kinematics: Kinematics, health: f32) -> Self {
        Self {
            id,
            kind: EntityKind::Plane,
            kinematics,
            health,
            throttle: 1.0,
            owner: None,
            target: None,
            pilot: Some(pilot),
            retired: false,
            placeholder: false,
        }
    }

    /// A live weapon or countermeasure launched by `owner`.
    pub fn projectile(
        id: GameId,
        kind: EntityKind,
        owner: GameId,
        target: Option<GameId>,
        kinematics: Kinematics,
    ) -> Self {
        Self {
            id,
            kind,
            kinematics,
            health: 0.0,
            throttle: 1.0,
            owner: Some(owner),
            target,
            pilot: None,
            retired: false,
            placeholder: false,
        }
    }

    /// A short-lived placeholder standing in for a weapon that no longer exists.
    pub fn placeholder(id: GameId, kind: EntityKind, kinematics: Kinematics) -> Self {
        Self {
            id,
            kind,
            kinematics,
            health: 0.0,
            throttle: 0.0,
            owner: None,
            target: None,
            pilot: None,
            retired: false,
            placeholder: true,
        }
    }

    pub fn is_live(&self) -> bool {
        !self.retired
    }
}

/// A state update for an existing entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityUpdate {
    pub kinematics: Kinematics,
    pub throttle: Option<f32>,
    pub health: Option<f32>,
    pub target: Option<GameId>,
    /// Seconds between the sender stamping the update and now.
    pub age: f32,
}

impl EntityUpdate {
    /// An update that only moves the entity.
    pub fn pose(kinematics: Kinematics) -> Self {
        Self {
            kinematics,
            throttle: None,
            health: None,
            target: None,
            age: 0.0,
        }
    }
}
