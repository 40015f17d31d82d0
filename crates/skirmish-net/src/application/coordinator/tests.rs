use std::sync::Arc;
use std::time::Duration;

use skirmish_core::protocol::messages::{
    Impact, Launch, MessageKind, NetMessage, NewPlane, Payload, PlaneUpdate, SyncResponse,
};
use skirmish_core::{
    Clock, Entity, EntityKind, GameId, InMemoryWorld, Kinematics, ManualClock, Pilot, PlayerId,
    Vec2, WorldMutation, WorldRegistry, WORLD_PLAYER,
};

use super::*;
use crate::application::link::{HostEvent, PeerId, ScriptedLink, SendPolicy};

type Client = SyncCoordinator<InMemoryWorld, ScriptedLink>;
type Server = SyncCoordinator<InMemoryWorld, ScriptedLink>;

const SERVER_PEER: PeerId = PeerId(0);
const FRAME: Duration = Duration::from_millis(100);

fn manual_clock() -> (Arc<ManualClock>, Arc<dyn Clock>) {
    let clock = Arc::new(ManualClock::new(1_000.0));
    let shared: Arc<dyn Clock> = clock.clone();
    (clock, shared)
}

fn client() -> (Client, Arc<ManualClock>) {
    let (clock, shared) = manual_clock();
    let c = SyncCoordinator::client(
        InMemoryWorld::new(),
        ScriptedLink::new(),
        shared,
        SyncConfig::default(),
    );
    (c, clock)
}

fn server() -> (Server, Arc<ManualClock>) {
    let (clock, shared) = manual_clock();
    let s = SyncCoordinator::server(
        InMemoryWorld::new(),
        ScriptedLink::new(),
        shared,
        SyncConfig::default(),
    );
    (s, clock)
}

/// Answers every outstanding sync request with a zero-delay, zero-skew reply
/// until the client is ready.
fn complete_clock_sync(c: &mut Client, clock: &ManualClock) {
    for _ in 0..40 {
        if c.is_ready() {
            return;
        }
        clock.advance(0.1);
        c.tick(FRAME);
        let requests: Vec<f64> = c
            .link_mut()
            .take_sent()
            .into_iter()
            .filter_map(|(m, _)| match m.payload {
                Payload::SyncRequest { t0 } => Some(t0),
                _ => None,
            })
            .collect();
        for t0 in requests {
            let reply = NetMessage::new(
                GameId::player(WORLD_PLAYER),
                t0,
                Payload::SyncResponse(SyncResponse { t0, t1: t0, t2: t0 }),
            );
            c.link_mut().push_inbound(reply, SERVER_PEER, clock.now());
        }
    }
}

/// A client that has connected, been assigned player 1, and synced.
fn ready_client() -> (Client, Arc<ManualClock>) {
    let (mut c, clock) = client();
    c.link_mut().push_event(HostEvent::Connected {
        server: SERVER_PEER,
    });
    c.link_mut().push_inbound(
        NetMessage::new(GameId::player(1), clock.now(), Payload::AssignId { player_id: 1 }),
        SERVER_PEER,
        clock.now(),
    );
    complete_clock_sync(&mut c, &clock);
    assert!(c.is_ready(), "client should be ready");
    c.link_mut().take_sent();
    c.world_mut().clear_mutations();
    (c, clock)
}

fn new_plane(id: GameId, frame_time: f64) -> NetMessage {
    NetMessage::new(
        id,
        frame_time,
        Payload::NewPlane(NewPlane {
            pilot: Pilot::default(),
            kinematics: Kinematics::at(Vec2::new(10.0, 20.0)),
            health: 100.0,
        }),
    )
}

fn plane_update(id: GameId, frame_time: f64, x: f32) -> NetMessage {
    NetMessage::new(
        id,
        frame_time,
        Payload::PlaneUpdate(PlaneUpdate {
            kinematics: Kinematics::at(Vec2::new(x, 0.0)),
            throttle: 0.5,
            health: 100.0,
        }),
    )
}

fn new_bullet(id: GameId, owner: GameId, frame_time: f64) -> NetMessage {
    NetMessage::new(
        id,
        frame_time,
        Payload::NewBullet(Launch {
            owner,
            kinematics: Kinematics::default(),
        }),
    )
}

/// An impact reported by the weapon's owner.
fn impact(
    weapon: GameId,
    target: GameId,
    damage: f32,
    sequence: u32,
    frame_time: f64,
) -> NetMessage {
    impact_reported_by(weapon.player_id, weapon, target, damage, sequence, frame_time)
}

fn impact_reported_by(
    reporter: PlayerId,
    weapon: GameId,
    target: GameId,
    damage: f32,
    sequence: u32,
    frame_time: f64,
) -> NetMessage {
    NetMessage::new(
        weapon,
        frame_time,
        Payload::Impact(Impact {
            target,
            weapon: EntityKind::Bullet,
            damage,
            hit: Kinematics::at(Vec2::new(500.0, 500.0)),
            sequence,
            reporter,
        }),
    )
}

fn damage_events(world: &InMemoryWorld) -> Vec<(GameId, f32)> {
    world
        .mutations()
        .iter()
        .filter_map(|m| match m {
            WorldMutation::Damaged { id, damage, .. } => Some((*id, *damage)),
            _ => None,
        })
        .collect()
}

fn added_ids(world: &InMemoryWorld) -> Vec<GameId> {
    world
        .mutations()
        .iter()
        .filter_map(|m| match m {
            WorldMutation::Added { id, .. } => Some(*id),
            _ => None,
        })
        .collect()
}

/// Kinds of everything sent, with batches flattened to their item kinds.
fn flattened_kinds(sent: &[(NetMessage, SendPolicy)]) -> Vec<MessageKind> {
    sent.iter()
        .flat_map(|(m, _)| match &m.payload {
            Payload::Batch(items) => items.iter().map(NetMessage::kind).collect(),
            _ => vec![m.kind()],
        })
        .collect()
}

// ── Client session ────────────────────────────────────────────────────────────

#[test]
fn test_client_walks_through_phases_to_ready() {
    // Arrange
    let (mut c, clock) = client();
    assert_eq!(c.phase(), ClientPhase::Connecting);

    // Act / Assert
    c.link_mut().push_event(HostEvent::Connected {
        server: SERVER_PEER,
    });
    c.tick(FRAME);
    assert_eq!(c.phase(), ClientPhase::IdentifierPending);

    c.link_mut().push_inbound(
        NetMessage::new(GameId::player(4), clock.now(), Payload::AssignId { player_id: 4 }),
        SERVER_PEER,
        clock.now(),
    );
    c.tick(FRAME);
    assert_eq!(c.phase(), ClientPhase::ClockSyncPending);
    assert_eq!(c.player_id(), Some(4));

    complete_clock_sync(&mut c, &clock);
    assert_eq!(c.phase(), ClientPhase::Ready);
    assert!((c.clock_offset() - 0.05).abs() < 1e-9, "zero skew plus responder allowance");
}

#[test]
fn test_readiness_gate_holds_world_state_then_applies_in_receipt_order() {
    // Arrange
    let (mut c, clock) = client();
    c.link_mut().push_event(HostEvent::Connected {
        server: SERVER_PEER,
    });
    let planes = [GameId::new(2, 3), GameId::new(2, 1), GameId::new(3, 7)];
    for id in planes {
        c.link_mut().push_inbound(new_plane(id, clock.now()), SERVER_PEER, clock.now());
    }

    // Act – a second of ticks with no id and no clock sync
    for _ in 0..10 {
        clock.advance(0.1);
        c.tick(FRAME);
    }

    // Assert – nothing applied yet, nothing aged out
    assert!(c.world().mutations().is_empty());
    assert_eq!(c.deferred_len(), 3);

    // Act – id, then clock sync
    c.link_mut().push_inbound(
        NetMessage::new(GameId::player(1), clock.now(), Payload::AssignId { player_id: 1 }),
        SERVER_PEER,
        clock.now(),
    );
    complete_clock_sync(&mut c, &clock);

    // Assert
    assert_eq!(added_ids(c.world()), planes.to_vec());
    assert_eq!(c.stats().expired, 0);
    assert_eq!(c.deferred_len(), 0);
}

#[test]
fn test_spawn_before_ready_is_rejected() {
    let (mut c, _clock) = client();
    let result = c.spawn(Spawn::Plane {
        pilot: Pilot::default(),
        kinematics: Kinematics::default(),
        health: 100.0,
    });
    assert_eq!(result, Err(SyncError::NotReady));
}

#[test]
fn test_spawn_announces_creation_with_local_id() {
    // Arrange
    let (mut c, _clock) = ready_client();

    // Act
    let plane = c
        .spawn(Spawn::Plane {
            pilot: Pilot::default(),
            kinematics: Kinematics::default(),
            health: 100.0,
        })
        .unwrap();
    let bullet = c
        .spawn(Spawn::Bullet {
            owner: plane,
            kinematics: Kinematics::default(),
        })
        .unwrap();

    // Assert
    assert_eq!(plane, GameId::new(1, 1));
    assert_eq!(bullet, GameId::new(1, 2));
    let sent = c.link_mut().take_sent();
    assert_eq!(
        flattened_kinds(&sent),
        vec![MessageKind::NewPlane, MessageKind::NewBullet]
    );
    assert!(sent.iter().all(|(_, p)| *p == SendPolicy::ToAll));
    assert!(c.world().is_live(&bullet));
}

#[test]
fn test_owned_planes_are_broadcast_every_interval() {
    // Arrange
    let (mut c, clock) = ready_client();
    c.spawn(Spawn::Plane {
        pilot: Pilot::default(),
        kinematics: Kinematics::default(),
        health: 100.0,
    })
    .unwrap();
    c.link_mut().take_sent();

    // Act – 200 ms in 10 ms frames
    for _ in 0..20 {
        clock.advance(0.01);
        c.tick(Duration::from_millis(10));
    }

    // Assert
    let updates = c
        .link_mut()
        .take_sent()
        .iter()
        .filter(|(m, _)| m.kind() == MessageKind::PlaneUpdate)
        .count();
    assert_eq!(updates, 4);
}

#[test]
fn test_expired_entities_are_announced() {
    // Arrange
    let (mut c, _clock) = ready_client();
    let plane = c
        .spawn(Spawn::Plane {
            pilot: Pilot::default(),
            kinematics: Kinematics::default(),
            health: 100.0,
        })
        .unwrap();
    c.link_mut().take_sent();

    // Act
    c.world_mut().expire(&plane);
    c.tick(Duration::from_millis(1));

    // Assert
    let sent = c.link_mut().take_sent();
    assert!(sent
        .iter()
        .any(|(m, _)| m.kind() == MessageKind::EntityRetired && m.id == plane));
}

// ── Deferral ──────────────────────────────────────────────────────────────────

#[test]
fn test_message_deferred_past_max_age_is_never_applied() {
    // Arrange
    let (mut c, clock) = ready_client();
    let owner = GameId::new(2, 1);
    let bullet = GameId::new(2, 2);
    c.link_mut()
        .push_inbound(new_bullet(bullet, owner, clock.now()), SERVER_PEER, clock.now());

    // Act – five 100 ms frames exceed the 400 ms limit, then the owner shows up
    for _ in 0..5 {
        clock.advance(0.1);
        c.tick(FRAME);
    }
    c.link_mut()
        .push_inbound(new_plane(owner, clock.now()), SERVER_PEER, clock.now());
    c.tick(FRAME);

    // Assert
    assert_eq!(added_ids(c.world()), vec![owner]);
    assert!(c.world().get(&bullet).is_none());
    assert_eq!(c.stats().expired, 1);
}

#[test]
fn test_creation_waits_for_owner_then_applies() {
    // Arrange
    let (mut c, clock) = ready_client();
    let owner = GameId::new(2, 1);
    let bullet = GameId::new(2, 2);

    // Act – bullet arrives one frame before its plane
    c.link_mut()
        .push_inbound(new_bullet(bullet, owner, clock.now()), SERVER_PEER, clock.now());
    c.tick(FRAME);
    c.link_mut()
        .push_inbound(new_plane(owner, clock.now()), SERVER_PEER, clock.now());
    c.tick(FRAME);

    // Assert
    assert_eq!(added_ids(c.world()), vec![owner, bullet]);
    assert_eq!(c.stats().deferred, 1);
}

#[test]
fn test_updates_keep_receipt_order_behind_a_parked_update() {
    // Arrange
    let (mut c, clock) = ready_client();
    let plane = GameId::new(2, 1);
    let now = clock.now();

    // Act – update for a plane we have not seen, then the plane, then a newer update
    c.link_mut().push_inbound(plane_update(plane, now, 1.0), SERVER_PEER, now);
    c.link_mut().push_inbound(new_plane(plane, now), SERVER_PEER, now);
    c.link_mut().push_inbound(plane_update(plane, now, 2.0), SERVER_PEER, now);
    c.tick(Duration::from_millis(1));

    // Assert – the older update never lands after the newer one
    let moves: Vec<f32> = c
        .world()
        .mutations()
        .iter()
        .filter_map(|m| match m {
            WorldMutation::Moved { id, kinematics } if *id == plane => Some(kinematics.position.x),
            _ => None,
        })
        .collect();
    assert_eq!(moves.len(), 2);
    assert!(moves[0] < moves[1], "moves applied out of order: {moves:?}");
}

#[test]
fn test_entity_retired_discards_parked_messages_for_it() {
    // Arrange
    let (mut c, clock) = ready_client();
    let bullet = GameId::new(2, 2);
    c.link_mut().push_inbound(
        new_bullet(bullet, GameId::new(2, 1), clock.now()),
        SERVER_PEER,
        clock.now(),
    );
    c.tick(FRAME);
    assert_eq!(c.deferred_len(), 1);

    // Act
    c.link_mut().push_inbound(
        NetMessage::new(bullet, clock.now(), Payload::EntityRetired),
        SERVER_PEER,
        clock.now(),
    );
    c.tick(FRAME);

    // Assert
    assert_eq!(c.deferred_len(), 0);
    assert_eq!(c.stats().expired, 0);
}

#[test]
fn test_update_for_retired_entity_is_dropped() {
    // Arrange
    let (mut c, clock) = ready_client();
    let plane = GameId::new(2, 1);
    c.link_mut().push_inbound(new_plane(plane, clock.now()), SERVER_PEER, clock.now());
    c.tick(FRAME);
    c.world_mut().retire(&plane);
    c.world_mut().clear_mutations();

    // Act
    c.link_mut()
        .push_inbound(plane_update(plane, clock.now(), 9.0), SERVER_PEER, clock.now());
    c.tick(FRAME);

    // Assert
    assert!(c.world().mutations().is_empty());
    assert_eq!(c.deferred_len(), 0);
}

// ── Impacts ───────────────────────────────────────────────────────────────────

#[test]
fn test_impact_for_missing_target_is_deferred_then_applied() {
    // Arrange
    let (mut c, clock) = ready_client();
    let target = GameId::new(2, 1);
    let weapon = GameId::new(3, 9);

    // Act
    c.link_mut()
        .push_inbound(impact(weapon, target, 30.0, 1, clock.now()), SERVER_PEER, clock.now());
    c.tick(FRAME);
    assert!(damage_events(c.world()).is_empty());
    c.link_mut().push_inbound(new_plane(target, clock.now()), SERVER_PEER, clock.now());
    c.tick(FRAME);

    // Assert
    assert_eq!(damage_events(c.world()), vec![(target, 30.0)]);
    let victim = c.world().get(&target).unwrap();
    assert_eq!(victim.health, 70.0);
    assert_eq!(victim.kinematics.position, Vec2::new(10.0, 20.0), "pose restored after damage");
}

#[test]
fn test_impact_damage_lands_at_reported_pose_with_placeholder_weapon() {
    // Arrange
    let (mut c, clock) = ready_client();
    let target = GameId::new(2, 1);
    let weapon = GameId::new(3, 9);
    c.link_mut().push_inbound(new_plane(target, clock.now()), SERVER_PEER, clock.now());
    c.tick(FRAME);

    // Act
    c.link_mut()
        .push_inbound(impact(weapon, target, 10.0, 1, clock.now()), SERVER_PEER, clock.now());
    c.tick(FRAME);

    // Assert
    let position = c.world().mutations().iter().find_map(|m| match m {
        WorldMutation::Damaged { position, .. } => Some(*position),
        _ => None,
    });
    assert_eq!(position, Some(Vec2::new(500.0, 500.0)));
    let placeholder = c.world().get(&weapon).unwrap();
    assert!(placeholder.placeholder);
    assert!(placeholder.retired);
}

#[test]
fn test_duplicate_impact_applies_damage_once() {
    // Arrange
    let (mut c, clock) = ready_client();
    let target = GameId::new(2, 1);
    let weapon = GameId::new(3, 9);
    c.link_mut().push_inbound(new_plane(target, clock.now()), SERVER_PEER, clock.now());
    c.tick(FRAME);

    // Act – the same impact three times, across two frames
    for _ in 0..2 {
        c.link_mut()
            .push_inbound(impact(weapon, target, 25.0, 7, clock.now()), SERVER_PEER, clock.now());
    }
    c.tick(FRAME);
    c.link_mut()
        .push_inbound(impact(weapon, target, 25.0, 7, clock.now()), SERVER_PEER, clock.now());
    c.tick(FRAME);

    // Assert
    assert_eq!(damage_events(c.world()).len(), 1);
    assert_eq!(c.world().get(&target).unwrap().health, 75.0);
    assert_eq!(c.stats().duplicate_impacts, 2);
}

#[test]
fn test_impacts_from_two_reporters_with_same_sequence_both_apply() {
    // Arrange – player 2's weapons hit two planes; players 3 and 4 each
    // report one hit, both numbered 1 by their own counters
    let (mut c, clock) = ready_client();
    let first_victim = GameId::new(3, 1);
    let second_victim = GameId::new(4, 1);
    for plane in [first_victim, second_victim] {
        c.link_mut().push_inbound(new_plane(plane, clock.now()), SERVER_PEER, clock.now());
    }
    c.tick(FRAME);

    // Act
    let first = impact_reported_by(3, GameId::new(2, 5), first_victim, 20.0, 1, clock.now());
    let second = impact_reported_by(4, GameId::new(2, 6), second_victim, 20.0, 1, clock.now());
    c.link_mut().push_inbound(first, SERVER_PEER, clock.now());
    c.link_mut().push_inbound(second, SERVER_PEER, clock.now());
    c.tick(FRAME);

    // Assert
    assert_eq!(
        damage_events(c.world()),
        vec![(first_victim, 20.0), (second_victim, 20.0)]
    );
    assert_eq!(c.stats().duplicate_impacts, 0);
}

#[test]
fn test_report_impact_stamps_own_player_as_reporter() {
    // Arrange
    let (mut c, clock) = ready_client();
    let target = GameId::new(2, 1);
    let foreign_weapon = GameId::new(5, 3);
    c.link_mut().push_inbound(new_plane(target, clock.now()), SERVER_PEER, clock.now());
    c.world_mut().add_entity(Entity::projectile(
        foreign_weapon,
        EntityKind::Bullet,
        target,
        None,
        Kinematics::default(),
    ));
    c.tick(FRAME);
    c.link_mut().take_sent();

    // Act
    c.report_impact(target, foreign_weapon, 5.0).expect("ready");

    // Assert
    let reporters: Vec<PlayerId> = c
        .link_mut()
        .take_sent()
        .into_iter()
        .filter_map(|(m, _)| match m.payload {
            Payload::Impact(impact) => Some(impact.reporter),
            _ => None,
        })
        .collect();
    assert_eq!(reporters, vec![1]);
}

#[test]
fn test_kick_naming_self_disconnects() {
    // Arrange
    let (mut c, clock) = ready_client();

    // Act
    c.link_mut().push_inbound(
        NetMessage::new(
            GameId::player(1),
            clock.now(),
            Payload::Kick {
                reason: "idle".into(),
            },
        ),
        SERVER_PEER,
        clock.now(),
    );
    c.tick(FRAME);

    // Assert
    assert_eq!(c.phase(), ClientPhase::Disconnected);
}

#[test]
fn test_transport_disconnect_is_terminal() {
    let (mut c, _clock) = ready_client();
    c.link_mut()
        .push_event(HostEvent::Disconnected { timed_out: true });
    c.tick(FRAME);
    assert_eq!(c.phase(), ClientPhase::Disconnected);
}

#[test]
fn test_chat_log_is_bounded() {
    // Arrange
    let (mut c, clock) = ready_client();

    // Act
    for i in 0..70 {
        c.link_mut().push_inbound(
            NetMessage::new(
                GameId::player(2),
                clock.now(),
                Payload::Chat(skirmish_core::protocol::messages::Chat {
                    sender: "bob".into(),
                    text: format!("line {i}"),
                }),
            ),
            SERVER_PEER,
            clock.now(),
        );
    }
    c.tick(FRAME);

    // Assert
    let lines: Vec<&str> = c.chat_log().map(|chat| chat.text.as_str()).collect();
    assert_eq!(lines.len(), 64);
    assert_eq!(lines[0], "line 6");
}

// ── Server ────────────────────────────────────────────────────────────────────

fn add_plane(world: &mut InMemoryWorld, id: GameId) {
    world.add_entity(Entity::plane(
        id,
        Pilot::default(),
        Kinematics::at(Vec2::new(1.0, 1.0)),
        100.0,
    ));
}

#[test]
fn test_server_fans_out_world_to_joining_peer_in_order() {
    // Arrange
    let (mut s, clock) = server();
    let shooter = GameId::new(1, 1);
    let victim = GameId::new(2, 1);
    add_plane(s.world_mut(), shooter);
    add_plane(s.world_mut(), victim);
    s.world_mut().add_entity(Entity::projectile(
        GameId::new(1, 2),
        EntityKind::Bullet,
        shooter,
        None,
        Kinematics::default(),
    ));
    s.world_mut().add_entity(Entity::projectile(
        GameId::new(1, 3),
        EntityKind::Missile,
        shooter,
        Some(victim),
        Kinematics::default(),
    ));
    s.world_mut().add_entity(Entity::projectile(
        GameId::new(2, 2),
        EntityKind::Decoy,
        victim,
        None,
        Kinematics::default(),
    ));
    let hit = impact(GameId::new(1, 9), victim, 20.0, 1, clock.now());
    s.link_mut().push_inbound(hit, PeerId(1), clock.now());
    s.tick(Duration::from_millis(1));
    assert_eq!(s.ledger().len(), 1);
    s.link_mut().take_sent();

    // Act
    s.link_mut().push_event(HostEvent::PeerJoined {
        peer: PeerId(3),
        player_id: 3,
    });
    s.tick(Duration::from_millis(1));

    // Assert
    let sent = s.link_mut().take_sent();
    assert!(sent.iter().all(|(_, p)| *p == SendPolicy::ToPeer(PeerId(3))));
    assert_eq!(
        flattened_kinds(&sent),
        vec![
            MessageKind::GameState,
            MessageKind::NewPlane,
            MessageKind::NewPlane,
            MessageKind::NewBullet,
            MessageKind::NewMissile,
            MessageKind::NewDecoy,
            MessageKind::Impact,
        ]
    );
    // Announced before the replayed 20 damage, so the joiner lands on 80.
    let announced_victim_health = sent
        .iter()
        .flat_map(|(m, _)| match &m.payload {
            Payload::Batch(items) => items.clone(),
            _ => vec![m.clone()],
        })
        .find_map(|m| match m.payload {
            Payload::NewPlane(plane) if m.id == victim => Some(plane.health),
            _ => None,
        });
    assert_eq!(s.world().get(&victim).unwrap().health, 80.0);
    assert_eq!(announced_victim_health, Some(100.0));
}

#[test]
fn test_fan_out_batches_large_rosters() {
    // Arrange
    let (mut s, _clock) = server();
    for object in 1..=70 {
        add_plane(s.world_mut(), GameId::new(1, object));
    }

    // Act
    s.link_mut().push_event(HostEvent::PeerJoined {
        peer: PeerId(2),
        player_id: 2,
    });
    s.tick(Duration::from_millis(1));

    // Assert – game state, then 32 + 32 + 6 planes
    let sent = s.link_mut().take_sent();
    assert_eq!(sent.len(), 4);
    for (message, _) in &sent[1..] {
        match &message.payload {
            Payload::Batch(items) => {
                assert!(items.len() <= skirmish_core::protocol::MAX_BATCH_SIZE)
            }
            other => panic!("expected a batch, got {other:?}"),
        }
    }
}

#[test]
fn test_peer_leaving_retires_its_entities_and_clears_ledger() {
    // Arrange
    let (mut s, clock) = server();
    s.link_mut().push_event(HostEvent::PeerJoined {
        peer: PeerId(2),
        player_id: 2,
    });
    let victim = GameId::new(2, 1);
    add_plane(s.world_mut(), victim);
    let hit = impact(GameId::new(1, 9), victim, 5.0, 1, clock.now());
    s.link_mut().push_inbound(hit, PeerId(1), clock.now());
    s.tick(Duration::from_millis(1));
    assert_eq!(s.ledger().len(), 1);

    // Act
    s.link_mut().push_event(HostEvent::PeerLeft {
        peer: PeerId(2),
        player_id: 2,
        timed_out: true,
    });
    s.tick(Duration::from_millis(1));

    // Assert
    let plane = s.world().get(&victim).unwrap();
    assert!(plane.retired, "retired, not removed");
    assert!(s.ledger().is_empty());
    assert!(s.peers().is_empty());
}

#[test]
fn test_rejoining_player_with_reused_id_gets_its_plane_back() {
    // Arrange – player 1 flies, leaves, and a new client is handed id 1
    let (mut s, clock) = server();
    let plane = GameId::new(1, 1);
    s.link_mut().push_event(HostEvent::PeerJoined {
        peer: PeerId(1),
        player_id: 1,
    });
    s.link_mut().push_inbound(new_plane(plane, clock.now()), PeerId(1), clock.now());
    s.tick(Duration::from_millis(1));
    s.link_mut().push_event(HostEvent::PeerLeft {
        peer: PeerId(1),
        player_id: 1,
        timed_out: false,
    });
    s.tick(Duration::from_millis(1));
    assert!(!s.world().is_live(&plane));

    // Act
    s.link_mut().push_event(HostEvent::PeerJoined {
        peer: PeerId(2),
        player_id: 1,
    });
    s.link_mut().push_inbound(new_plane(plane, clock.now()), PeerId(2), clock.now());
    s.link_mut()
        .push_inbound(plane_update(plane, clock.now(), 42.0), PeerId(2), clock.now());
    s.tick(Duration::from_millis(1));

    // Assert
    assert!(s.world().is_live(&plane), "new plane replaces the retired one");
    let at = s.world().get(&plane).map(|e| e.kinematics.position);
    assert_eq!(at, Some(Vec2::new(42.0, 0.0)));
    assert_eq!(s.stats().dropped, 0);
}

#[test]
fn test_rejoining_player_impacts_are_not_taken_for_duplicates() {
    // Arrange – player 1 reports sequence 1, leaves, and a new player 1
    // starts numbering from 1 again
    let (mut s, clock) = server();
    let victim = GameId::new(2, 1);
    add_plane(s.world_mut(), victim);
    s.link_mut().push_event(HostEvent::PeerJoined {
        peer: PeerId(1),
        player_id: 1,
    });
    let hit = impact(GameId::new(1, 9), victim, 5.0, 1, clock.now());
    s.link_mut().push_inbound(hit, PeerId(1), clock.now());
    s.tick(Duration::from_millis(1));
    s.link_mut().push_event(HostEvent::PeerLeft {
        peer: PeerId(1),
        player_id: 1,
        timed_out: true,
    });
    s.tick(Duration::from_millis(1));

    // Act
    s.link_mut().push_event(HostEvent::PeerJoined {
        peer: PeerId(3),
        player_id: 1,
    });
    let hit = impact(GameId::new(1, 4), victim, 5.0, 1, clock.now());
    s.link_mut().push_inbound(hit, PeerId(3), clock.now());
    s.tick(Duration::from_millis(1));

    // Assert
    assert_eq!(s.world().get(&victim).map(|e| e.health), Some(90.0));
    assert_eq!(s.stats().duplicate_impacts, 0);
}

#[test]
fn test_server_answers_sync_request_to_origin_only() {
    // Arrange
    let (mut s, clock) = server();
    let received_at = clock.now();
    s.link_mut().push_inbound(
        NetMessage::new(GameId::player(2), received_at, Payload::SyncRequest { t0: 5.0 }),
        PeerId(2),
        received_at,
    );
    clock.advance(0.002);

    // Act
    s.tick(Duration::from_millis(1));

    // Assert
    let sent = s.link_mut().take_sent();
    assert_eq!(sent.len(), 1);
    let (message, policy) = &sent[0];
    assert_eq!(*policy, SendPolicy::ToPeer(PeerId(2)));
    match &message.payload {
        Payload::SyncResponse(r) => {
            assert_eq!(r.t0, 5.0);
            assert_eq!(r.t1, received_at);
            assert!(r.t2 >= r.t1);
        }
        other => panic!("expected a sync response, got {other:?}"),
    }
}

#[test]
fn test_message_from_the_future_triggers_rate_limited_resync() {
    // Arrange
    let (mut s, clock) = server();
    let plane = GameId::new(2, 1);
    add_plane(s.world_mut(), plane);
    let ahead = clock.now() + 1.0;

    // Act – two early messages in one cooldown window
    s.link_mut()
        .push_inbound(plane_update(plane, ahead, 1.0), PeerId(2), clock.now());
    s.link_mut()
        .push_inbound(plane_update(plane, ahead, 2.0), PeerId(2), clock.now());
    s.tick(Duration::from_millis(1));

    // Assert
    let resyncs: Vec<SendPolicy> = s
        .link_mut()
        .take_sent()
        .into_iter()
        .filter(|(m, _)| m.kind() == MessageKind::ResyncRequest)
        .map(|(_, p)| p)
        .collect();
    assert_eq!(resyncs, vec![SendPolicy::ToPeer(PeerId(2))]);

    // Act – after the cooldown another early message asks again
    clock.advance(6.0);
    s.link_mut()
        .push_inbound(plane_update(plane, clock.now() + 1.0, 3.0), PeerId(2), clock.now());
    s.tick(Duration::from_millis(1));

    // Assert
    assert_eq!(s.stats().resyncs, 2);
}

#[test]
fn test_resync_request_restarts_clock_sync_without_leaving_ready() {
    // Arrange
    let (mut c, clock) = ready_client();

    // Act
    c.link_mut().push_inbound(
        NetMessage::new(GameId::player(1), clock.now(), Payload::ResyncRequest),
        SERVER_PEER,
        clock.now(),
    );
    clock.advance(0.1);
    c.tick(FRAME);
    clock.advance(0.1);
    c.tick(FRAME);

    // Assert
    assert!(c.is_ready());
    assert!(c
        .link_mut()
        .take_sent()
        .iter()
        .any(|(m, _)| m.kind() == MessageKind::SyncRequest));
}

#[test]
fn test_report_impact_on_server_records_ledger_and_broadcasts() {
    // Arrange
    let (mut s, _clock) = server();
    let victim = GameId::new(2, 1);
    add_plane(s.world_mut(), victim);
    let missile = s
        .spawn(Spawn::Missile {
            owner: victim,
            target: Some(victim),
            kinematics: Kinematics::default(),
        })
        .unwrap();
    s.link_mut().take_sent();

    // Act
    s.report_impact(victim, missile, 40.0).unwrap();

    // Assert
    assert_eq!(s.world().get(&victim).unwrap().health, 60.0);
    assert_eq!(s.ledger().impacts_for(2).len(), 1);
    let sent = s.link_mut().take_sent();
    assert_eq!(flattened_kinds(&sent), vec![MessageKind::Impact]);
}

#[test]
fn test_reset_player_clears_ledger_and_retires_planes() {
    // Arrange
    let (mut s, clock) = server();
    let victim = GameId::new(2, 1);
    add_plane(s.world_mut(), victim);
    let hit = impact(GameId::new(1, 9), victim, 5.0, 1, clock.now());
    s.link_mut().push_inbound(hit, PeerId(1), clock.now());
    s.tick(Duration::from_millis(1));

    // Act
    s.reset_player(2).unwrap();

    // Assert
    assert!(s.ledger().is_empty());
    assert!(!s.world().is_live(&victim));
}

#[test]
fn test_kick_unknown_player_fails() {
    let (mut s, _clock) = server();
    assert_eq!(s.kick(9, "bye"), Err(SyncError::UnknownPlayer(9)));
}

#[test]
fn test_kick_disconnects_peer_and_notifies_everyone() {
    // Arrange
    let (mut s, _clock) = server();
    s.link_mut().push_event(HostEvent::PeerJoined {
        peer: PeerId(5),
        player_id: 2,
    });
    s.tick(Duration::from_millis(1));
    s.link_mut().take_sent();

    // Act
    s.kick(2, "cheating").unwrap();

    // Assert
    assert_eq!(s.link().disconnected(), &[PeerId(5)]);
    let sent = s.link_mut().take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.kind(), MessageKind::Kick);
    assert_eq!(sent[0].1, SendPolicy::ToAll);
}

#[test]
fn test_server_only_operations_rejected_on_client() {
    let (mut c, _clock) = ready_client();
    assert_eq!(c.reset_player(2), Err(SyncError::NotServer));
    assert_eq!(c.record_score(2, Default::default()), Err(SyncError::NotServer));
}

#[test]
fn test_game_state_broadcast_once_per_second_with_peers() {
    // Arrange
    let (mut s, clock) = server();
    s.link_mut().push_event(HostEvent::PeerJoined {
        peer: PeerId(1),
        player_id: 1,
    });
    s.tick(Duration::from_millis(1));
    s.link_mut().take_sent();

    // Act
    for _ in 0..30 {
        clock.advance(0.1);
        s.tick(FRAME);
    }

    // Assert
    let states = s
        .link_mut()
        .take_sent()
        .iter()
        .filter(|(m, _)| m.kind() == MessageKind::GameState)
        .count();
    assert_eq!(states, 3);
}
