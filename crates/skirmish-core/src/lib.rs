//! # skirmish-core
//!
//! Shared library for the Skirmish multiplayer layer: the message catalog, the
//! binary wire codec, and the world model the synchronisation core mutates.
//!
//! This crate is used by both the server and the client roles.  It opens no
//! sockets and spawns no threads.
//!
//! # Architecture overview (for beginners)
//!
//! Skirmish is a real-time 2-D air-combat simulation.  One authoritative
//! server and several clients each run their own copy of the world: planes,
//! bullets, guided missiles, decoys, and the damage they deal.  The network
//! layer keeps those copies consistent.
//!
//! This crate is the shared foundation.  It defines:
//!
//! - **`protocol`** – How state travels over the wire.  Typed messages are
//!   quantised into a compact binary frame, compressed, and decoded back into
//!   the same typed values on the other side.
//!
//! - **`domain`** – The vocabulary of the simulation as seen by the network
//!   layer: entity identifiers, kinematics, the `WorldRegistry` trait the sync
//!   core mutates through, and the `Clock` used to stamp messages.

pub mod domain;
pub mod protocol;

pub use domain::clock::{Clock, ManualClock, SystemClock};
pub use domain::entity::{Color, Entity, EntityKind, EntityUpdate, Kinematics, Pilot, Vec2};
pub use domain::game_id::{GameId, PlayerId, WORLD_PLAYER};
pub use domain::world::{InMemoryWorld, WorldMutation, WorldRegistry};
pub use protocol::codec::{decode_message, encode_message, ProtocolError, WireCodec};
pub use protocol::messages::{MessageKind, NetMessage, Payload};
