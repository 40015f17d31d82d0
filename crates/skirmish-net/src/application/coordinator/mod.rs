//! The synchronisation coordinator.
//!
//! # What it does (for beginners)
//!
//! Every peer runs one [`SyncCoordinator`] on its simulation thread.  Once
//! per frame the simulation calls [`SyncCoordinator::tick`], which:
//!
//! 1. consumes lifecycle events from the peer host (connects, disconnects),
//! 2. runs the recurring actions that are due (state broadcasts, clock-sync
//!    requests, retire notices),
//! 3. drains every received message and applies it to the world,
//! 4. retries the messages that were parked because something they depend on
//!    had not arrived yet.
//!
//! A client is only allowed to apply world state once it knows its player id
//! and its clock offset to the server; until then everything is parked.  The
//! server is always ready.
//!
//! The coordinator is the sole owner of the world registry, the deferred
//! queue and the impact ledger.  It never blocks: the link's queues are
//! try-only.

mod broadcast;
mod handlers;
#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use skirmish_core::protocol::messages::{Chat, GameState, Impact, NetMessage, Payload, Score};
use skirmish_core::protocol::SequenceCounter;
use skirmish_core::{
    Clock, Entity, EntityKind, GameId, Kinematics, Pilot, PlayerId, WorldRegistry, WORLD_PLAYER,
};

use super::clock_sync::{ClockSyncConfig, ClockSynchronizer};
use super::deferred::DeferredQueue;
use super::impact_ledger::{ImpactFilter, ImpactLedger};
use super::link::{PeerId, PeerLink, SendPolicy};
use super::scheduler::ActionScheduler;

// ── Configuration ─────────────────────────────────────────────────────────────

/// Coordinator tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Display name used for outgoing chat.
    pub player_name: String,
    /// Period of the owned-entity state broadcast.
    pub broadcast_interval: Duration,
    /// Period of the server's game-state broadcast.
    pub game_state_interval: Duration,
    /// Parked messages older than this are dropped.
    pub max_deferred_age: Duration,
    /// Capacity of the deferred queue.
    pub max_deferred: usize,
    /// How far ahead of the server clock a client message may be stamped
    /// before the server asks that client to resynchronise.
    pub future_tolerance: Duration,
    /// Minimum spacing of resync requests to one peer.
    pub resync_cooldown: Duration,
    /// Number of impact keys remembered for duplicate suppression.
    pub impact_window: usize,
    /// Lines of chat kept.
    pub chat_log_lines: usize,
    pub clock: ClockSyncConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            player_name: "pilot".to_string(),
            broadcast_interval: Duration::from_millis(50),
            game_state_interval: Duration::from_secs(1),
            max_deferred_age: Duration::from_millis(400),
            max_deferred: 4096,
            future_tolerance: Duration::from_millis(100),
            resync_cooldown: Duration::from_secs(5),
            impact_window: 4096,
            chat_log_lines: 64,
            clock: ClockSyncConfig::default(),
        }
    }
}

// ── Public state types ────────────────────────────────────────────────────────

/// Client session state.  A server reports `Ready` throughout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    /// Waiting for the transport handshake.
    Connecting,
    /// Connected; waiting for `AssignId`.
    IdentifierPending,
    /// Have an id; waiting for the first clock offset.
    ClockSyncPending,
    /// Applying world state.
    Ready,
    /// Terminal.
    Disconnected,
}

/// Which side of the session this coordinator plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRole {
    Client,
    Server,
}

/// Running counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Messages applied to the world.
    pub applied: u64,
    /// Messages parked at least once.
    pub deferred: u64,
    /// Parked messages that aged out unapplied.
    pub expired: u64,
    /// Impact deliveries dropped as repeats.
    pub duplicate_impacts: u64,
    /// Messages discarded: stale updates, overflow, misdirected kinds.
    pub dropped: u64,
    /// `ResyncRequest`s sent (server) or honoured (client).
    pub resyncs: u64,
}

/// Errors from the local-authority API.
#[derive(Debug, Error, PartialEq)]
pub enum SyncError {
    #[error("session is not ready")]
    NotReady,

    #[error("operation is only available on the server")]
    NotServer,

    #[error("unknown entity {0}")]
    UnknownEntity(GameId),

    #[error("no connected peer plays as player {0}")]
    UnknownPlayer(PlayerId),

    #[error("{kind:?} needs an owner")]
    MissingOwner { kind: EntityKind },

    #[error("outgoing queue rejected the message")]
    QueueFull,
}

/// What to create with [`SyncCoordinator::spawn`].
#[derive(Debug, Clone, PartialEq)]
pub enum Spawn {
    Plane {
        pilot: Pilot,
        kinematics: Kinematics,
        health: f32,
    },
    Bullet {
        owner: GameId,
        kinematics: Kinematics,
    },
    Missile {
        owner: GameId,
        target: Option<GameId>,
        kinematics: Kinematics,
    },
    Decoy {
        owner: GameId,
        kinematics: Kinematics,
    },
}

// ── Coordinator state ─────────────────────────────────────────────────────────

/// Everything the scheduled actions and message handlers mutate.
pub struct SyncState<W, L> {
    role: SyncRole,
    world: W,
    link: L,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    phase: ClientPhase,
    player_id: Option<PlayerId>,
    server: Option<PeerId>,
    sync: ClockSynchronizer,
    deferred: DeferredQueue,
    impact_filter: ImpactFilter,
    ledger: ImpactLedger,
    peers: HashMap<PeerId, PlayerId>,
    last_resync: HashMap<PeerId, f64>,
    objects: SequenceCounter,
    impact_sequence: SequenceCounter,
    game_state: GameState,
    chat_log: VecDeque<Chat>,
    scores: BTreeMap<PlayerId, Score>,
    stats: SyncStats,
    flushed_this_tick: bool,
}

impl<W: WorldRegistry, L: PeerLink> SyncState<W, L> {
    fn new(role: SyncRole, world: W, link: L, clock: Arc<dyn Clock>, config: SyncConfig) -> Self {
        let (phase, player_id) = match role {
            SyncRole::Client => (ClientPhase::Connecting, None),
            SyncRole::Server => (ClientPhase::Ready, Some(WORLD_PLAYER)),
        };
        Self {
            role,
            world,
            link,
            sync: ClockSynchronizer::new(config.clock.clone()),
            deferred: DeferredQueue::new(
                config.max_deferred_age.as_secs_f64(),
                config.max_deferred,
            ),
            impact_filter: ImpactFilter::new(config.impact_window),
            ledger: ImpactLedger::new(),
            clock,
            config,
            phase,
            player_id,
            server: None,
            peers: HashMap::new(),
            last_resync: HashMap::new(),
            objects: SequenceCounter::starting_at(1),
            impact_sequence: SequenceCounter::starting_at(1),
            game_state: GameState::default(),
            chat_log: VecDeque::new(),
            scores: BTreeMap::new(),
            stats: SyncStats::default(),
            flushed_this_tick: false,
        }
    }

    fn is_server(&self) -> bool {
        self.role == SyncRole::Server
    }

    fn is_ready(&self) -> bool {
        self.phase == ClientPhase::Ready
    }

    /// Local raw clock.
    fn raw_now(&self) -> f64 {
        self.clock.now()
    }

    /// Raw clock plus the accepted offset.  The server's offset is zero.
    fn network_now(&self) -> f64 {
        self.clock.now() + self.sync.offset()
    }

    /// Id naming this peer itself in lifecycle messages.
    fn self_id(&self) -> GameId {
        GameId::player(self.player_id.unwrap_or(WORLD_PLAYER))
    }

    fn send(&mut self, message: NetMessage, policy: SendPolicy) -> bool {
        let kind = message.kind();
        let queued = self.link.enqueue(message, policy);
        if !queued {
            self.stats.dropped += 1;
            warn!(?kind, "outgoing queue full, message dropped");
        }
        queued
    }

    fn push_chat(&mut self, chat: Chat) {
        info!(sender = %chat.sender, text = %chat.text, "chat");
        self.chat_log.push_back(chat);
        while self.chat_log.len() > self.config.chat_log_lines {
            self.chat_log.pop_front();
        }
    }

    /// Retires every live entity minted by `player_id` and drops anything
    /// parked on its behalf.
    fn retire_player(&mut self, player_id: PlayerId) -> usize {
        let owned = self.world.owned_by(player_id);
        for id in &owned {
            self.world.retire(id);
        }
        let discarded = self.deferred.discard_player(player_id);
        // A returning player with the same id numbers its impacts from 1 again.
        let forgotten = self.impact_filter.forget_reporter(player_id);
        debug!(
            player_id,
            retired = owned.len(),
            discarded,
            forgotten,
            "player entities retired"
        );
        owned.len()
    }

    /// Retires `player_id`'s planes and forgets damage dealt to it.
    fn reset_player_state(&mut self, player_id: PlayerId) {
        let planes: Vec<GameId> = self
            .world
            .owned_by(player_id)
            .into_iter()
            .filter(|id| self.world.get(id).is_some_and(|e| e.kind == EntityKind::Plane))
            .collect();
        for id in &planes {
            self.world.retire(id);
        }
        if self.is_server() {
            self.ledger.clear(player_id);
        }
        info!(player_id, planes = planes.len(), "player reset");
    }

    fn peer_for_player(&self, player_id: PlayerId) -> Option<PeerId> {
        self.peers
            .iter()
            .find(|(_, p)| **p == player_id)
            .map(|(peer, _)| *peer)
    }
}

// ── Coordinator ───────────────────────────────────────────────────────────────

/// Drives one peer's side of the session.
pub struct SyncCoordinator<W, L> {
    scheduler: ActionScheduler<SyncState<W, L>>,
    state: SyncState<W, L>,
}

impl<W, L> SyncCoordinator<W, L>
where
    W: WorldRegistry + 'static,
    L: PeerLink + 'static,
{
    /// A client coordinator.  It starts in [`ClientPhase::Connecting`].
    pub fn client(world: W, link: L, clock: Arc<dyn Clock>, config: SyncConfig) -> Self {
        let mut scheduler = ActionScheduler::new();
        scheduler.add_action(
            "broadcast_owned",
            config.broadcast_interval,
            SyncState::broadcast_owned,
        );
        scheduler.add_action(
            "clock_sync",
            Duration::from_secs_f64(config.clock.round_interval),
            SyncState::poll_clock_sync,
        );
        scheduler.add_action("retire_expired", Duration::ZERO, SyncState::announce_expired);
        Self {
            scheduler,
            state: SyncState::new(SyncRole::Client, world, link, clock, config),
        }
    }

    /// A server coordinator.  It is ready immediately and mints world-owned
    /// ids.
    pub fn server(world: W, link: L, clock: Arc<dyn Clock>, config: SyncConfig) -> Self {
        let mut scheduler = ActionScheduler::new();
        scheduler.add_action(
            "broadcast_owned",
            config.broadcast_interval,
            SyncState::broadcast_owned,
        );
        scheduler.add_action(
            "game_state",
            config.game_state_interval,
            SyncState::broadcast_game_state,
        );
        scheduler.add_action("retire_expired", Duration::ZERO, SyncState::announce_expired);
        Self {
            scheduler,
            state: SyncState::new(SyncRole::Server, world, link, clock, config),
        }
    }

    /// Advances the session by one simulation frame of length `dt`.
    pub fn tick(&mut self, dt: Duration) {
        self.state.flushed_this_tick = false;
        self.state.handle_events();
        self.scheduler.run_due_actions(dt, &mut self.state);
        self.state.drain_inbound();
        if !self.state.flushed_this_tick {
            let aging = if self.state.is_ready() {
                dt.as_secs_f64()
            } else {
                0.0
            };
            self.state.retry_deferred(aging);
        }
    }

    // ── Local-authority API ───────────────────────────────────────────────────

    /// Creates a locally owned entity and announces it.
    pub fn spawn(&mut self, spawn: Spawn) -> Result<GameId, SyncError> {
        let s = &mut self.state;
        if !s.is_ready() {
            return Err(SyncError::NotReady);
        }
        let player_id = s.player_id.ok_or(SyncError::NotReady)?;
        let id = GameId::new(player_id, s.objects.next_nonzero());
        let entity = match spawn {
            Spawn::Plane {
                pilot,
                kinematics,
                health,
            } => Entity::plane(id, pilot, kinematics, health),
            Spawn::Bullet { owner, kinematics } => {
                Entity::projectile(id, EntityKind::Bullet, owner, None, kinematics)
            }
            Spawn::Missile {
                owner,
                target,
                kinematics,
            } => Entity::projectile(id, EntityKind::Missile, owner, target, kinematics),
            Spawn::Decoy { owner, kinematics } => {
                Entity::projectile(id, EntityKind::Decoy, owner, None, kinematics)
            }
        };
        let message = broadcast::creation_message(&entity, s.network_now()).ok_or(
            SyncError::MissingOwner {
                kind: entity.kind,
            },
        )?;
        s.world.add_entity(entity);
        info!(%id, kind = ?message.kind(), "spawned");
        if !s.send(message, SendPolicy::ToAll) {
            return Err(SyncError::QueueFull);
        }
        Ok(id)
    }

    /// Applies `damage` from `weapon` to `target` locally and tells everyone.
    pub fn report_impact(
        &mut self,
        target: GameId,
        weapon: GameId,
        damage: f32,
    ) -> Result<(), SyncError> {
        let s = &mut self.state;
        if !s.is_ready() {
            return Err(SyncError::NotReady);
        }
        let hit = s
            .world
            .get(&target)
            .map(|e| e.kinematics)
            .ok_or(SyncError::UnknownEntity(target))?;
        let weapon_kind = s
            .world
            .get(&weapon)
            .map(|e| e.kind)
            .ok_or(SyncError::UnknownEntity(weapon))?;

        let sequence = s.impact_sequence.next();
        let reporter = s.self_id().player_id;
        let message = NetMessage::new(
            weapon,
            s.network_now(),
            Payload::Impact(Impact {
                target,
                weapon: weapon_kind,
                damage,
                hit,
                sequence,
                reporter,
            }),
        );
        s.impact_filter.insert((reporter, sequence));
        s.world.apply_damage(&target, damage, &weapon);
        if s.is_server() && target.player_id != WORLD_PLAYER {
            s.ledger.record(target.player_id, message.clone());
        }
        debug!(%target, %weapon, damage, sequence, "impact reported");
        if !s.send(message, SendPolicy::ToAll) {
            return Err(SyncError::QueueFull);
        }
        Ok(())
    }

    /// Sends a chat line to every peer and logs it locally.
    pub fn send_chat(&mut self, text: impl Into<String>) -> Result<(), SyncError> {
        let s = &mut self.state;
        if s.phase == ClientPhase::Disconnected {
            return Err(SyncError::NotReady);
        }
        let chat = Chat {
            sender: s.config.player_name.clone(),
            text: text.into(),
        };
        let message = NetMessage::new(s.self_id(), s.network_now(), Payload::Chat(chat.clone()));
        s.push_chat(chat);
        if !s.send(message, SendPolicy::ToAll) {
            return Err(SyncError::QueueFull);
        }
        Ok(())
    }

    /// Server: replaces the global game state and broadcasts it at once.
    pub fn set_game_state(&mut self, game_state: GameState) -> Result<(), SyncError> {
        let s = &mut self.state;
        if !s.is_server() {
            return Err(SyncError::NotServer);
        }
        s.game_state = game_state;
        s.broadcast_game_state();
        Ok(())
    }

    /// Server: removes a player from the session.
    pub fn kick(
        &mut self,
        player_id: PlayerId,
        reason: impl Into<String>,
    ) -> Result<(), SyncError> {
        let s = &mut self.state;
        if !s.is_server() {
            return Err(SyncError::NotServer);
        }
        let peer = s
            .peer_for_player(player_id)
            .ok_or(SyncError::UnknownPlayer(player_id))?;
        let reason = reason.into();
        info!(player_id, %peer, %reason, "kicking player");
        let message = NetMessage::new(
            GameId::player(player_id),
            s.network_now(),
            Payload::Kick { reason },
        );
        s.send(message, SendPolicy::ToAll);
        s.link.disconnect(peer);
        s.retire_player(player_id);
        s.ledger.clear(player_id);
        Ok(())
    }

    /// Server: respawns a player, clearing its damage history.
    pub fn reset_player(&mut self, player_id: PlayerId) -> Result<(), SyncError> {
        let s = &mut self.state;
        if !s.is_server() {
            return Err(SyncError::NotServer);
        }
        let message = NetMessage::new(
            GameId::player(player_id),
            s.network_now(),
            Payload::PlayerReset,
        );
        s.reset_player_state(player_id);
        if !s.send(message, SendPolicy::ToAll) {
            return Err(SyncError::QueueFull);
        }
        Ok(())
    }

    /// Server: updates and broadcasts a scoreboard entry.
    pub fn record_score(&mut self, player_id: PlayerId, score: Score) -> Result<(), SyncError> {
        let s = &mut self.state;
        if !s.is_server() {
            return Err(SyncError::NotServer);
        }
        s.scores.insert(player_id, score);
        let message = NetMessage::new(
            GameId::player(player_id),
            s.network_now(),
            Payload::Score(score),
        );
        if !s.send(message, SendPolicy::ToAll) {
            return Err(SyncError::QueueFull);
        }
        Ok(())
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn role(&self) -> SyncRole {
        self.state.role
    }

    pub fn phase(&self) -> ClientPhase {
        self.state.phase
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// Assigned player id; [`WORLD_PLAYER`] on the server.
    pub fn player_id(&self) -> Option<PlayerId> {
        self.state.player_id
    }

    /// Accepted offset to the server clock, seconds.
    pub fn clock_offset(&self) -> f64 {
        self.state.sync.offset()
    }

    /// Current network time: local clock plus the accepted offset.
    pub fn network_time(&self) -> f64 {
        self.state.network_now()
    }

    pub fn world(&self) -> &W {
        &self.state.world
    }

    pub fn world_mut(&mut self) -> &mut W {
        &mut self.state.world
    }

    pub fn link(&self) -> &L {
        &self.state.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.state.link
    }

    pub fn game_state(&self) -> GameState {
        self.state.game_state
    }

    /// Most recent chat lines, oldest first.
    pub fn chat_log(&self) -> impl Iterator<Item = &Chat> {
        self.state.chat_log.iter()
    }

    pub fn scores(&self) -> &BTreeMap<PlayerId, Score> {
        &self.state.scores
    }

    pub fn stats(&self) -> SyncStats {
        self.state.stats
    }

    /// Messages currently parked.
    pub fn deferred_len(&self) -> usize {
        self.state.deferred.len()
    }

    /// Impacts the server would replay to a joining client.
    pub fn ledger(&self) -> &ImpactLedger {
        &self.state.ledger
    }

    /// Server: connected peers and their player ids.
    pub fn peers(&self) -> &HashMap<PeerId, PlayerId> {
        &self.state.peers
    }
}
