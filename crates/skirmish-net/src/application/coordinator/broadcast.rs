//! Outgoing state: recurring broadcasts and the join fan-out.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use skirmish_core::protocol::messages::{
    batch_messages, Launch, MissileLaunch, MissileUpdate, NetMessage, NewPlane, Payload,
    PlaneUpdate,
};
use skirmish_core::{Entity, EntityKind, GameId, WorldRegistry, WORLD_PLAYER};

use super::super::link::{PeerId, PeerLink, SendPolicy};
use super::{ClientPhase, SyncState};

/// The creation announcement for `entity`, stamped `frame_time`.
///
/// Returns `None` for a projectile without an owner; such an entity cannot be
/// announced.
pub(super) fn creation_message(entity: &Entity, frame_time: f64) -> Option<NetMessage> {
    let kinematics = entity.kinematics;
    let payload = match entity.kind {
        EntityKind::Plane => Payload::NewPlane(NewPlane {
            pilot: entity.pilot.clone().unwrap_or_default(),
            kinematics,
            health: entity.health,
        }),
        EntityKind::Bullet => Payload::NewBullet(Launch {
            owner: entity.owner?,
            kinematics,
        }),
        EntityKind::Missile => Payload::NewMissile(MissileLaunch {
            owner: entity.owner?,
            target: entity.target,
            kinematics,
        }),
        EntityKind::Decoy => Payload::NewDecoy(Launch {
            owner: entity.owner?,
            kinematics,
        }),
    };
    Some(NetMessage::new(entity.id, frame_time, payload))
}

/// The periodic state update for `entity`.  Bullets and decoys fly
/// ballistically and are never updated.
fn update_message(entity: &Entity, frame_time: f64) -> Option<NetMessage> {
    let payload = match entity.kind {
        EntityKind::Plane => Payload::PlaneUpdate(PlaneUpdate {
            kinematics: entity.kinematics,
            throttle: entity.throttle,
            health: entity.health,
        }),
        EntityKind::Missile => Payload::MissileUpdate(MissileUpdate {
            kinematics: entity.kinematics,
            target: entity.target,
        }),
        EntityKind::Bullet | EntityKind::Decoy => return None,
    };
    Some(NetMessage::new(entity.id, frame_time, payload))
}

impl<W: WorldRegistry, L: PeerLink> SyncState<W, L> {
    // ── Scheduled actions ─────────────────────────────────────────────────────

    /// Sends the current state of every live entity this peer owns.
    pub(super) fn broadcast_owned(&mut self) {
        if !self.is_ready() {
            return;
        }
        let Some(player_id) = self.player_id else {
            return;
        };
        let now = self.network_now();
        let updates: Vec<NetMessage> = self
            .world
            .owned_by(player_id)
            .iter()
            .filter_map(|id| self.world.get(id))
            .filter_map(|entity| update_message(entity, now))
            .collect();
        for message in updates {
            self.send(message, SendPolicy::ToAll);
        }
    }

    /// Client: sends the next clock-sync request when one is due.
    pub(super) fn poll_clock_sync(&mut self) {
        if matches!(
            self.phase,
            ClientPhase::Connecting | ClientPhase::IdentifierPending | ClientPhase::Disconnected
        ) {
            return;
        }
        let now = self.raw_now();
        if let Some(t0) = self.sync.poll(now) {
            let message =
                NetMessage::new(self.self_id(), self.network_now(), Payload::SyncRequest { t0 });
            self.send(message, SendPolicy::ToAll);
        }
    }

    /// Server: sends the global game state to everyone.
    pub(super) fn broadcast_game_state(&mut self) {
        if self.peers.is_empty() {
            return;
        }
        let message = NetMessage::new(
            GameId::player(WORLD_PLAYER),
            self.network_now(),
            Payload::GameState(self.game_state),
        );
        self.send(message, SendPolicy::ToAll);
    }

    /// Announces the retirement of owned entities whose lifetime ended.
    pub(super) fn announce_expired(&mut self) {
        let expired = self.world.take_expired();
        if expired.is_empty() {
            return;
        }
        let Some(player_id) = self.player_id else {
            return;
        };
        let now = self.network_now();
        let notices: Vec<NetMessage> = expired
            .into_iter()
            .filter(|id| id.player_id == player_id)
            .map(|id| NetMessage::new(id, now, Payload::EntityRetired))
            .collect();
        debug!(count = notices.len(), "announcing expired entities");
        for message in batch_messages(self.self_id(), now, notices) {
            self.send(message, SendPolicy::ToAll);
        }
    }

    // ── Join fan-out ──────────────────────────────────────────────────────────

    /// Server: brings a newly joined peer up to date.  Sends, in order, the
    /// game state, every live plane, bullet, missile and decoy, and the full
    /// impact ledger.
    pub(super) fn fan_out_to(&mut self, peer: PeerId) {
        let now = self.network_now();
        let from = GameId::player(WORLD_PLAYER);
        let policy = SendPolicy::ToPeer(peer);

        self.send(
            NetMessage::new(from, now, Payload::GameState(self.game_state)),
            policy,
        );

        // Planes are announced at their health before the replayed impacts,
        // so the joiner ends up at the current health after the replay.
        let impacts: Vec<NetMessage> = self
            .ledger
            .replay()
            .into_iter()
            .filter(|m| match &m.payload {
                Payload::Impact(impact) => self.world.is_live(&impact.target),
                _ => false,
            })
            .collect();
        let mut replayed_damage: HashMap<GameId, f32> = HashMap::new();
        for message in &impacts {
            if let Payload::Impact(impact) = &message.payload {
                *replayed_damage.entry(impact.target).or_default() += impact.damage;
            }
        }

        let mut sent = 0usize;
        for kind in [
            EntityKind::Plane,
            EntityKind::Bullet,
            EntityKind::Missile,
            EntityKind::Decoy,
        ] {
            let creations: Vec<NetMessage> = self
                .world
                .entities_of_kind(kind)
                .into_iter()
                .filter_map(|mut entity| {
                    if let Some(damage) = replayed_damage.get(&entity.id) {
                        entity.health += damage;
                    }
                    let message = creation_message(&entity, now);
                    if message.is_none() {
                        warn!(id = %entity.id, ?kind, "entity without owner left out of fan-out");
                    }
                    message
                })
                .collect();
            sent += creations.len();
            for message in batch_messages(from, now, creations) {
                self.send(message, policy);
            }
        }

        let replayed = impacts.len();
        for message in batch_messages(from, now, impacts) {
            self.send(message, policy);
        }
        info!(%peer, entities = sent, impacts = replayed, "fan-out sent");
    }
}
