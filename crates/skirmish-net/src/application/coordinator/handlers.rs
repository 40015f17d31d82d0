//! Inbound dispatch: lifecycle events, received messages, deferred retries.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use skirmish_core::protocol::messages::{
    Impact, Launch, MissileLaunch, NetMessage, NewPlane, Payload, SyncResponse,
};
use skirmish_core::{
    Entity, EntityKind, EntityUpdate, GameId, Kinematics, PlayerId, WorldRegistry, WORLD_PLAYER,
};

use super::super::clock_sync::{respond, SyncOutcome};
use super::super::link::{HostEvent, Inbound, PeerLink, SendPolicy};
use super::{ClientPhase, SyncState};

/// Result of trying to apply one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Disposition {
    Applied,
    /// A prerequisite is missing; park and retry.
    Defer,
    /// Nothing to do: duplicate, stale, or not meant for this role.
    Ignored,
}

/// Creations, updates and impacts: everything a client holds back until ready.
fn is_world_state(payload: &Payload) -> bool {
    matches!(
        payload,
        Payload::NewPlane(_)
            | Payload::NewBullet(_)
            | Payload::NewMissile(_)
            | Payload::NewDecoy(_)
            | Payload::PlaneUpdate(_)
            | Payload::MissileUpdate(_)
            | Payload::Impact(_)
    )
}

fn is_creation(payload: &Payload) -> bool {
    matches!(
        payload,
        Payload::NewPlane(_) | Payload::NewBullet(_) | Payload::NewMissile(_) | Payload::NewDecoy(_)
    )
}

/// Messages that must not overtake an older parked message about the same id.
/// A creation never waits behind an update of the entity it creates.
fn keeps_receipt_order(payload: &Payload) -> bool {
    is_world_state(payload) && !is_creation(payload)
}

impl<W: WorldRegistry, L: PeerLink> SyncState<W, L> {
    // ── Lifecycle ─────────────────────────────────────────────────────────────

    pub(super) fn handle_events(&mut self) {
        while let Some(event) = self.link.try_recv_event() {
            match event {
                HostEvent::Connected { server } => {
                    info!(%server, "connected, waiting for player id");
                    self.server = Some(server);
                    if self.phase == ClientPhase::Connecting {
                        self.phase = ClientPhase::IdentifierPending;
                    }
                }
                HostEvent::Disconnected { timed_out } => {
                    warn!(timed_out, "lost connection to server");
                    self.phase = ClientPhase::Disconnected;
                }
                HostEvent::PeerJoined { peer, player_id } => {
                    info!(%peer, player_id, "peer joined");
                    self.peers.insert(peer, player_id);
                    self.fan_out_to(peer);
                }
                HostEvent::PeerLeft {
                    peer,
                    player_id,
                    timed_out,
                } => {
                    info!(%peer, player_id, timed_out, "peer left");
                    self.peers.remove(&peer);
                    self.last_resync.remove(&peer);
                    self.retire_player(player_id);
                    self.ledger.clear(player_id);
                    self.scores.remove(&player_id);
                }
            }
        }
    }

    // ── Receive path ──────────────────────────────────────────────────────────

    /// Drains the receive queue, applying or parking each message.
    pub(super) fn drain_inbound(&mut self) {
        while let Some(inbound) = self.link.try_recv() {
            if self.phase == ClientPhase::Disconnected {
                self.stats.dropped += 1;
                continue;
            }
            if self.is_server() {
                self.check_future_stamp(&inbound);
            }
            match inbound.message.payload {
                Payload::Batch(items) => {
                    for message in items {
                        self.receive(Inbound {
                            message,
                            origin: inbound.origin,
                            received_at: inbound.received_at,
                        });
                    }
                }
                _ => self.receive(inbound),
            }
        }
    }

    fn receive(&mut self, inbound: Inbound) {
        let keeps_order = keeps_receipt_order(&inbound.message.payload)
            && self.deferred.has_pending_for(&inbound.message.id);
        if keeps_order {
            self.park(inbound);
            return;
        }
        if self.dispatch(&inbound) == Disposition::Defer {
            self.park(inbound);
        }
    }

    fn park(&mut self, inbound: Inbound) {
        debug!(
            id = %inbound.message.id,
            kind = ?inbound.message.kind(),
            "deferring message"
        );
        self.stats.deferred += 1;
        let overflowed = self.deferred.overflowed();
        self.deferred.defer(inbound, 0.0);
        self.stats.dropped += self.deferred.overflowed() - overflowed;
    }

    /// Re-attempts every parked message once, in receipt order, after ageing
    /// the queue by `aging` seconds.
    pub(super) fn retry_deferred(&mut self, aging: f64) {
        if self.deferred.is_empty() {
            return;
        }
        let (entries, report) = self.deferred.age_and_take(aging);
        self.stats.expired += report.expired as u64;
        let mut blocked: HashSet<GameId> = HashSet::new();
        for entry in entries {
            let id = entry.inbound.message.id;
            if blocked.contains(&id) && keeps_receipt_order(&entry.inbound.message.payload) {
                self.deferred.restore(entry);
                continue;
            }
            if self.dispatch(&entry.inbound) == Disposition::Defer {
                blocked.insert(id);
                self.deferred.restore(entry);
            }
        }
    }

    /// Server: asks a client whose stamps run ahead of the server clock to
    /// resynchronise, at most once per cooldown.
    fn check_future_stamp(&mut self, inbound: &Inbound) {
        if matches!(inbound.message.payload, Payload::SyncRequest { .. }) {
            return;
        }
        let now = self.raw_now();
        let ahead = -inbound.message.age(now);
        if ahead <= self.config.future_tolerance.as_secs_f64() {
            return;
        }
        let cooldown = self.config.resync_cooldown.as_secs_f64();
        let due = self
            .last_resync
            .get(&inbound.origin)
            .map_or(true, |last| now - last >= cooldown);
        if !due {
            return;
        }
        self.last_resync.insert(inbound.origin, now);
        self.stats.resyncs += 1;
        warn!(peer = %inbound.origin, ahead, "message from the future, requesting resync");
        let message = NetMessage::new(inbound.message.id, now, Payload::ResyncRequest);
        self.send(message, SendPolicy::ToPeer(inbound.origin));
    }

    /// Applies one message if it can be applied now.
    pub(super) fn dispatch(&mut self, inbound: &Inbound) -> Disposition {
        let message = &inbound.message;
        if !self.is_ready() && is_world_state(&message.payload) {
            return Disposition::Defer;
        }
        let disposition = match &message.payload {
            Payload::AssignId { player_id } => self.on_assign_id(*player_id),
            Payload::SyncRequest { t0 } => self.on_sync_request(inbound, *t0),
            Payload::SyncResponse(response) => {
                self.on_sync_response(response, inbound.received_at)
            }
            Payload::ResyncRequest => self.on_resync_request(),
            Payload::GameState(state) => {
                if self.is_server() {
                    Disposition::Ignored
                } else {
                    self.game_state = *state;
                    Disposition::Applied
                }
            }
            Payload::PlayerDisconnect => {
                let player_id = message.id.player_id;
                info!(player_id, "player disconnected");
                self.retire_player(player_id);
                self.scores.remove(&player_id);
                Disposition::Applied
            }
            Payload::PlayerReset => {
                self.reset_player_state(message.id.player_id);
                if self.is_server() {
                    let relay =
                        NetMessage::new(message.id, self.network_now(), Payload::PlayerReset);
                    self.send(relay, SendPolicy::ToAllExcept(inbound.origin));
                }
                Disposition::Applied
            }
            Payload::Kick { reason } => self.on_kick(message.id.player_id, reason),
            Payload::Chat(chat) => {
                self.push_chat(chat.clone());
                Disposition::Applied
            }
            Payload::Score(score) => {
                self.scores.insert(message.id.player_id, *score);
                Disposition::Applied
            }
            Payload::EntityRetired => {
                let discarded = self.deferred.discard(&message.id);
                self.world.retire(&message.id);
                debug!(id = %message.id, discarded, "entity retired by owner");
                Disposition::Applied
            }
            Payload::NewPlane(plane) => self.on_new_plane(message, plane),
            Payload::NewBullet(launch) => self.on_launch(message, EntityKind::Bullet, launch),
            Payload::NewMissile(launch) => self.on_new_missile(message, launch),
            Payload::NewDecoy(launch) => self.on_launch(message, EntityKind::Decoy, launch),
            Payload::PlaneUpdate(update) => self.on_update(
                message,
                EntityUpdate {
                    kinematics: update.kinematics,
                    throttle: Some(update.throttle),
                    health: Some(update.health),
                    target: None,
                    age: 0.0,
                },
            ),
            Payload::MissileUpdate(update) => self.on_update(
                message,
                EntityUpdate {
                    kinematics: update.kinematics,
                    throttle: None,
                    health: None,
                    target: update.target,
                    age: 0.0,
                },
            ),
            Payload::Impact(impact) => self.on_impact(message, impact),
            Payload::Batch(_) => {
                warn!("nested batch reached dispatch, dropping");
                Disposition::Ignored
            }
        };
        match disposition {
            Disposition::Applied => self.stats.applied += 1,
            Disposition::Ignored => self.stats.dropped += 1,
            Disposition::Defer => {}
        }
        disposition
    }

    // ── Session handlers ──────────────────────────────────────────────────────

    fn on_assign_id(&mut self, player_id: PlayerId) -> Disposition {
        if self.is_server() {
            return Disposition::Ignored;
        }
        info!(player_id, "player id assigned");
        self.player_id = Some(player_id);
        if matches!(
            self.phase,
            ClientPhase::Connecting | ClientPhase::IdentifierPending
        ) {
            self.phase = ClientPhase::ClockSyncPending;
        }
        let now = self.raw_now();
        self.sync.begin(now);
        Disposition::Applied
    }

    fn on_sync_request(&mut self, inbound: &Inbound, t0: f64) -> Disposition {
        if !self.is_server() {
            return Disposition::Ignored;
        }
        let response = respond(t0, inbound.received_at, self.raw_now());
        let message = NetMessage::new(
            inbound.message.id,
            self.network_now(),
            Payload::SyncResponse(response),
        );
        self.send(message, SendPolicy::ToPeer(inbound.origin));
        Disposition::Applied
    }

    fn on_sync_response(
        &mut self,
        response: &SyncResponse,
        received_at: f64,
    ) -> Disposition {
        if self.is_server() {
            return Disposition::Ignored;
        }
        match self.sync.on_response(response, received_at) {
            SyncOutcome::Ignored => Disposition::Ignored,
            SyncOutcome::Continue { .. } => Disposition::Applied,
            SyncOutcome::Converged { offset, rounds } => {
                if self.phase == ClientPhase::ClockSyncPending {
                    info!(offset, rounds, player_id = ?self.player_id, "session ready");
                    self.phase = ClientPhase::Ready;
                    // Everything parked while waiting applies now, in receipt order.
                    self.retry_deferred(0.0);
                    self.flushed_this_tick = true;
                }
                Disposition::Applied
            }
        }
    }

    fn on_resync_request(&mut self) -> Disposition {
        if self.is_server() {
            return Disposition::Ignored;
        }
        info!("server requested clock resync");
        let now = self.raw_now();
        self.sync.request_resync(now);
        self.stats.resyncs += 1;
        Disposition::Applied
    }

    fn on_kick(&mut self, player_id: PlayerId, reason: &str) -> Disposition {
        if self.is_server() {
            return Disposition::Ignored;
        }
        if self.player_id == Some(player_id) {
            warn!(reason, "kicked by server");
            self.phase = ClientPhase::Disconnected;
        } else {
            info!(player_id, reason, "player kicked");
            self.retire_player(player_id);
        }
        Disposition::Applied
    }

    // ── Entity handlers ───────────────────────────────────────────────────────

    /// Seconds since the sender stamped `message`, never negative.
    fn message_age(&self, message: &NetMessage) -> f32 {
        message.age(self.network_now()).max(0.0) as f32
    }

    /// A creation for a live id is a repeat.  A retired id may be taken again
    /// by a player who rejoined under the same player id; the new entity
    /// replaces the retired one.
    fn is_duplicate_creation(&self, id: &GameId) -> bool {
        self.world.is_live(id)
    }

    fn on_new_plane(&mut self, message: &NetMessage, plane: &NewPlane) -> Disposition {
        if self.is_duplicate_creation(&message.id) {
            return Disposition::Ignored;
        }
        let kinematics = plane.kinematics.extrapolated(self.message_age(message));
        self.world.add_entity(Entity::plane(
            message.id,
            plane.pilot.clone(),
            kinematics,
            plane.health,
        ));
        Disposition::Applied
    }

    fn on_launch(
        &mut self,
        message: &NetMessage,
        kind: EntityKind,
        launch: &Launch,
    ) -> Disposition {
        self.create_projectile(message, kind, launch.owner, None, launch.kinematics)
    }

    fn on_new_missile(&mut self, message: &NetMessage, launch: &MissileLaunch) -> Disposition {
        if launch.target.is_some_and(|t| self.world.get(&t).is_none()) {
            return Disposition::Defer;
        }
        self.create_projectile(
            message,
            EntityKind::Missile,
            launch.owner,
            launch.target,
            launch.kinematics,
        )
    }

    fn create_projectile(
        &mut self,
        message: &NetMessage,
        kind: EntityKind,
        owner: GameId,
        target: Option<GameId>,
        kinematics: Kinematics,
    ) -> Disposition {
        if self.is_duplicate_creation(&message.id) {
            return Disposition::Ignored;
        }
        if self.world.get(&owner).is_none() {
            return Disposition::Defer;
        }
        let kinematics = kinematics.extrapolated(self.message_age(message));
        self.world
            .add_entity(Entity::projectile(message.id, kind, owner, target, kinematics));
        Disposition::Applied
    }

    fn on_update(&mut self, message: &NetMessage, mut update: EntityUpdate) -> Disposition {
        match self.world.get(&message.id) {
            None => Disposition::Defer,
            Some(entity) if !entity.is_live() => Disposition::Ignored,
            Some(_) => {
                update.age = self.message_age(message);
                self.world.apply_position_update(&message.id, &update);
                Disposition::Applied
            }
        }
    }

    /// Applies an impact the way the sender saw it: the target is moved to
    /// the reported pose for the damage call, then put back.
    fn on_impact(&mut self, message: &NetMessage, impact: &Impact) -> Disposition {
        let weapon = message.id;
        let key = (impact.reporter, impact.sequence);
        if self.impact_filter.contains(&key) {
            self.stats.duplicate_impacts += 1;
            debug!(
                %weapon,
                reporter = impact.reporter,
                sequence = impact.sequence,
                "duplicate impact dropped"
            );
            return Disposition::Ignored;
        }
        let Some(saved) = self.world.get(&impact.target).map(|e| e.kinematics) else {
            return Disposition::Defer;
        };
        let needs_placeholder = self.world.get(&weapon).is_none();
        if needs_placeholder && impact.weapon == EntityKind::Plane {
            return Disposition::Defer;
        }

        if needs_placeholder {
            self.world.add_entity(Entity::placeholder(
                weapon,
                impact.weapon,
                Kinematics::at(impact.hit.position),
            ));
        }
        self.world
            .apply_position_update(&impact.target, &EntityUpdate::pose(impact.hit));
        self.world.apply_damage(&impact.target, impact.damage, &weapon);
        self.world
            .apply_position_update(&impact.target, &EntityUpdate::pose(saved));
        if needs_placeholder {
            self.world.retire(&weapon);
        }

        self.impact_filter.insert(key);
        if self.is_server() && impact.target.player_id != WORLD_PLAYER {
            self.ledger.record(impact.target.player_id, message.clone());
        }
        debug!(
            target = %impact.target,
            %weapon,
            damage = impact.damage,
            placeholder = needs_placeholder,
            "impact applied"
        );
        Disposition::Applied
    }
}
