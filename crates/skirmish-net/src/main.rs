//! `skirmish` – headless server / client runner.
//!
//! Wires a UDP transport, a peer host and a sync coordinator together and
//! ticks the coordinator at 60 Hz against an in-memory world.
//!
//! ```text
//! skirmish server [CONFIG]
//! skirmish client [CONFIG] [--server ADDR]
//! ```
//!
//! Without a `CONFIG` path the platform config file is used; a missing file
//! means defaults.  A client with `[player] is_ai = true` spawns a plane once
//! its session is ready and flies it in a circle.  Ctrl-C stops the host.

use std::f32::consts::FRAC_PI_2;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use skirmish_core::domain::entity::wrap_angle;
use skirmish_core::{Clock, Color, GameId, InMemoryWorld, Kinematics, Pilot, SystemClock, Vec2};
use skirmish_net::application::coordinator::{ClientPhase, Spawn, SyncCoordinator, SyncRole};
use skirmish_net::infrastructure::peer_host::{HostHandle, PeerHost};
use skirmish_net::infrastructure::storage::config::{load_config, load_config_from, AppConfig};
use skirmish_net::infrastructure::transport::udp::UdpTransport;
use skirmish_net::infrastructure::transport::Transport;

const TICK_RATE: f64 = 60.0;
const STATS_INTERVAL: Duration = Duration::from_secs(10);
const PRUNE_INTERVAL: Duration = Duration::from_secs(5);

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Skirmish multiplayer sync runner.
#[derive(Debug, Parser)]
#[command(name = "skirmish", about = "Headless Skirmish server or client", version)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Debug, Subcommand)]
enum Mode {
    /// Run the authoritative server.
    Server {
        /// Config file.  Defaults to the platform config location.
        config: Option<PathBuf>,
    },
    /// Connect to a server.
    Client {
        /// Config file.  Defaults to the platform config location.
        config: Option<PathBuf>,
        /// Server IP address, overriding `[network] server_address`.
        #[arg(long, env = "SKIRMISH_SERVER")]
        server: Option<String>,
    },
}

// ── AI pilot ──────────────────────────────────────────────────────────────────

/// Flies one plane around a fixed circle.
struct CirclingPilot {
    plane: Option<GameId>,
    angle: f32,
    center: Vec2,
}

impl CirclingPilot {
    const RADIUS: f32 = 400.0;
    const SPEED: f32 = 120.0;

    fn new() -> Self {
        Self {
            plane: None,
            angle: 0.0,
            center: Vec2::ZERO,
        }
    }

    fn kinematics(&self) -> Kinematics {
        let (sin, cos) = self.angle.sin_cos();
        Kinematics {
            position: Vec2::new(
                self.center.x + Self::RADIUS * cos,
                self.center.y + Self::RADIUS * sin,
            ),
            velocity: Vec2::new(-Self::SPEED * sin, Self::SPEED * cos),
            rotation: wrap_angle(self.angle + FRAC_PI_2),
        }
    }

    /// Spawns the plane once the session is ready, then steers it.
    fn fly(
        &mut self,
        coordinator: &mut SyncCoordinator<InMemoryWorld, HostHandle>,
        dt: f32,
        name: &str,
    ) {
        if !coordinator.is_ready() {
            return;
        }
        let Some(id) = self.plane else {
            let spawn = Spawn::Plane {
                pilot: Pilot {
                    name: name.to_string(),
                    team: 0,
                    is_ai: true,
                    color: Color::new(0.8, 0.2, 0.2),
                },
                kinematics: self.kinematics(),
                health: 100.0,
            };
            match coordinator.spawn(spawn) {
                Ok(id) => {
                    info!(%id, "AI plane spawned");
                    self.plane = Some(id);
                }
                Err(e) => warn!("could not spawn AI plane: {e}"),
            }
            return;
        };
        self.angle = wrap_angle(self.angle + dt * Self::SPEED / Self::RADIUS);
        let kinematics = self.kinematics();
        coordinator.world_mut().steer(&id, kinematics);
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (config_path, server_override) = match &cli.mode {
        Mode::Server { config } => (config.clone(), None),
        Mode::Client { config, server } => (config.clone(), server.clone()),
    };
    let mut config = match &config_path {
        Some(path) => load_config_from(path),
        None => load_config(),
    }
    .context("failed to load configuration")?;
    if let Some(server) = server_override {
        config.network.server_address = server;
    }

    // Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    let role = match cli.mode {
        Mode::Server { .. } => SyncRole::Server,
        Mode::Client { .. } => SyncRole::Client,
    };
    info!(?role, player = %config.player.name, "Skirmish starting");

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    let transport = open_transport(role, &config)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (mut host, handle) =
        PeerHost::start(transport, role, config.host_config(), Arc::clone(&clock))
            .context("failed to start peer host")?;

    let world = InMemoryWorld::new();
    let mut coordinator = match role {
        SyncRole::Server => SyncCoordinator::server(world, handle, clock, config.sync_config()),
        SyncRole::Client => SyncCoordinator::client(world, handle, clock, config.sync_config()),
    };

    run(&mut coordinator, &config, &running).await;

    host.stop();
    info!(stats = ?coordinator.stats(), "Skirmish stopped");
    Ok(())
}

fn open_transport(role: SyncRole, config: &AppConfig) -> anyhow::Result<Box<dyn Transport>> {
    let transport = match role {
        SyncRole::Server => {
            let listen = config.listen_addr()?;
            UdpTransport::server(listen, config.udp_config())?
        }
        SyncRole::Client => {
            let (bind, server) = config.client_addrs()?;
            UdpTransport::client(bind, server, config.udp_config())?
        }
    };
    Ok(Box::new(transport))
}

/// The 60 Hz simulation loop.  Returns on Ctrl-C, or when a client's
/// session ends.
async fn run(
    coordinator: &mut SyncCoordinator<InMemoryWorld, HostHandle>,
    config: &AppConfig,
    running: &AtomicBool,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / TICK_RATE));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut pilot = (coordinator.role() == SyncRole::Client && config.player.is_ai)
        .then(CirclingPilot::new);
    let mut last = Instant::now();
    let mut last_stats = Instant::now();
    let mut last_prune = Instant::now();
    let mut was_ready = false;

    while running.load(Ordering::Relaxed) {
        ticker.tick().await;
        let dt = last.elapsed();
        last = Instant::now();

        coordinator.world_mut().step(dt.as_secs_f32());
        coordinator.tick(dt);

        if coordinator.is_ready() && !was_ready {
            was_ready = true;
            info!(
                player_id = ?coordinator.player_id(),
                offset = coordinator.clock_offset(),
                "session ready"
            );
        }
        if coordinator.phase() == ClientPhase::Disconnected {
            warn!("session ended");
            break;
        }
        if let Some(pilot) = pilot.as_mut() {
            pilot.fly(coordinator, dt.as_secs_f32(), &config.player.name);
        }

        if last_prune.elapsed() >= PRUNE_INTERVAL {
            last_prune = Instant::now();
            coordinator.world_mut().prune_retired();
        }
        if last_stats.elapsed() >= STATS_INTERVAL {
            last_stats = Instant::now();
            info!(
                stats = ?coordinator.stats(),
                live = coordinator.world().live_count(),
                deferred = coordinator.deferred_len(),
                "sync stats"
            );
        }
    }
}
