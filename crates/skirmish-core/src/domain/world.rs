//! The World Registry seam.
//!
//! The simulation owns its entities.  The synchronisation core never touches
//! geometry directly; every change goes through one of the mutation entry
//! points of [`WorldRegistry`].  This keeps the registry single-owner: only the
//! coordinator on the simulation thread calls into it.
//!
//! [`InMemoryWorld`] is a complete implementation backed by an ordered map.
//! It records every mutation in a log, which is how the tests prove that a
//! message was (or was never) applied.

use std::collections::BTreeMap;

use tracing::debug;

use super::entity::{Entity, EntityKind, EntityUpdate, Kinematics, Vec2};
use super::game_id::{GameId, PlayerId};

/// Operations the synchronisation core needs from the simulation's store of
/// entities.
pub trait WorldRegistry {
    /// Looks up an entity by id, including retired ones not yet pruned.
    fn get(&self, id: &GameId) -> Option<&Entity>;

    /// Ids of the live entities minted by `player_id`.
    fn owned_by(&self, player_id: PlayerId) -> Vec<GameId>;

    /// Snapshot of every live entity of `kind`, ordered by id.
    fn entities_of_kind(&self, kind: EntityKind) -> Vec<Entity>;

    /// Entities whose lifetime ended since the previous call.
    fn take_expired(&mut self) -> Vec<GameId>;

    /// Stores `entity`, replacing anything already stored under its id.
    fn add_entity(&mut self, entity: Entity);

    /// Moves an entity.  Unknown and retired ids are ignored.
    fn apply_position_update(&mut self, id: &GameId, update: &EntityUpdate);

    /// Applies `damage` to `target`, attributed to `weapon`.
    fn apply_damage(&mut self, target: &GameId, damage: f32, weapon: &GameId);

    /// Marks an entity retired.  The entity is not removed.
    fn retire(&mut self, id: &GameId);

    /// Returns `true` when `id` names a live entity.
    fn is_live(&self, id: &GameId) -> bool {
        self.get(id).is_some_and(Entity::is_live)
    }
}

/// One recorded call into [`InMemoryWorld`].
#[derive(Debug, Clone, PartialEq)]
pub enum WorldMutation {
    Added { id: GameId, kind: EntityKind },
    Moved { id: GameId, kinematics: Kinematics },
    Damaged { id: GameId, damage: f32, position: Vec2, weapon: GameId },
    Retired { id: GameId },
}

/// Map-backed [`WorldRegistry`] with a mutation log.
#[derive(Debug, Default)]
pub struct InMemoryWorld {
    entities: BTreeMap<GameId, Entity>,
    expired: Vec<GameId>,
    log: Vec<WorldMutation>,
}

impl InMemoryWorld {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every mutation applied so far, oldest first.
    pub fn mutations(&self) -> &[WorldMutation] {
        &self.log
    }

    pub fn clear_mutations(&mut self) {
        self.log.clear();
    }

    /// Number of live entities.
    pub fn live_count(&self) -> usize {
        self.entities.values().filter(|e| e.is_live()).count()
    }

    /// Ends an entity's lifetime from the simulation side.  The id is reported
    /// by the next [`WorldRegistry::take_expired`].
    pub fn expire(&mut self, id: &GameId) {
        if let Some(entity) = self.entities.get_mut(id) {
            if entity.is_live() {
                entity.retired = true;
                self.expired.push(*id);
            }
        }
    }

    /// Sets an entity's kinematics without logging.  Simulation-side steering.
    pub fn steer(&mut self, id: &GameId, kinematics: Kinematics) {
        if let Some(entity) = self.entities.get_mut(id) {
            entity.kinematics = kinematics;
        }
    }

    /// Advances every live entity along its velocity.
    pub fn step(&mut self, seconds: f32) {
        for entity in self.entities.values_mut().filter(|e| e.is_live()) {
            entity.kinematics = entity.kinematics.extrapolated(seconds);
        }
    }

    /// Drops retired entities from the map.
    pub fn prune_retired(&mut self) -> usize {
        let before = self.entities.len();
        self.entities.retain(|_, e| e.is_live());
        before - self.entities.len()
    }
}

impl WorldRegistry for InMemoryWorld {
    fn get(&self, id: &GameId) -> Option<&Entity> {
        self.entities.get(id)
    }

    fn owned_by(&self, player_id: PlayerId) -> Vec<GameId> {
        self.entities
            .values()
            .filter(|e| e.is_live() && e.id.player_id == player_id)
            .map(|e| e.id)
            .collect()
    }

    fn entities_of_kind(&self, kind: EntityKind) -> Vec<Entity> {
        self.entities
            .values()
            .filter(|e| e.is_live() && e.kind == kind)
            .cloned()
            .collect()
    }

    fn take_expired(&mut self) -> Vec<GameId> {
        std::mem::take(&mut self.expired)
    }

    fn add_entity(&mut self, entity: Entity) {
        debug!(id = %entity.id, kind = ?entity.kind, "entity added");
        self.log.push(WorldMutation::Added {
            id: entity.id,
            kind: entity.kind,
        });
        self.entities.insert(entity.id, entity);
    }

    fn apply_position_update(&mut self, id: &GameId, update: &EntityUpdate) {
        let Some(entity) = self.entities.get_mut(id).filter(|e| e.is_live()) else {
            return;
        };
        entity.kinematics = update.kinematics.extrapolated(update.age);
        if let Some(health) = update.health {
            entity.health = health;
        }
        if let Some(throttle) = update.throttle {
            entity.throttle = throttle;
        }
        if update.target.is_some() {
            entity.target = update.target;
        }
        self.log.push(WorldMutation::Moved {
            id: *id,
            kinematics: entity.kinematics,
        });
    }

    fn apply_damage(&mut self, target: &GameId, damage: f32, weapon: &GameId) {
        let Some(entity) = self.entities.get_mut(target).filter(|e| e.is_live()) else {
            return;
        };
        entity.health = (entity.health - damage).max(0.0);
        self.log.push(WorldMutation::Damaged {
            id: *target,
            damage,
            position: entity.kinematics.position,
            weapon: *weapon,
        });
    }

    fn retire(&mut self, id: &GameId) {
        if let Some(entity) = self.entities.get_mut(id) {
            if entity.is_live() {
                entity.retired = true;
                self.log.push(WorldMutation::Retired { id: *id });
            }
        }
    }
}
