//! Arena Sync demo
//!
//! Hosts an in-process session with four peers, plays a full match and
//! checks that every peer ends with the same replicated state.

use anyhow::{bail, Context};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use arena_sync::{
    config::ArenaConfig,
    game::{entity::EntityLedger, events::GameEventData, state::MatchPhase},
    network::{transport::{LoopbackHub, LoopbackTransport}, GameMode, Peer},
    TICK_RATE, VERSION,
};

const PEERS: usize = 4;
const MAX_TICKS: u32 = 60 * 60 * TICK_RATE;

type LoopbackPeer = Peer<LoopbackTransport>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")?;

    info!("Arena Sync v{}", VERSION);
    info!("Tick Rate: {} Hz", TICK_RATE);

    let config = ArenaConfig::load_or_default();
    config.validate().context("Invalid configuration")?;

    demo_match(&config).await
}

/// Four peers on one loopback hub, host first.
async fn demo_match(config: &ArenaConfig) -> anyhow::Result<()> {
    info!("=== Starting Demo Match ===");
    let hub = LoopbackHub::new();
    let mut peers: Vec<LoopbackPeer> = Vec::with_capacity(PEERS);

    for i in 0..PEERS {
        let mode = if i == 0 { GameMode::Host } else { GameMode::Client };
        let mut peer = Peer::new(hub.endpoint(), Box::new(EntityLedger::new()), config);
        let handle = peer
            .connect(mode, &config.session_name)
            .await
            .with_context(|| format!("peer {} failed to connect", i))?;
        info!("Peer {} joined as {:?} ({})", handle.local_peer, mode, handle.session_id);
        peers.push(peer);
        tick_all(&mut peers);
    }

    run_until(&mut peers, "everyone spawned", |p| {
        p.iter().all(|peer| peer.world().players.len() == PEERS && peer.phase().is_some())
    })?;
    info!("Session members: {:?}", hub.members(&config.session_name));

    let mut phases = peers[0].subscribe_events();

    let ids = peers[0].world().players.ids();
    for id in &ids {
        peers[0].set_ready(*id, true)?;
    }
    run_until(&mut peers, "first level", |p| all_in(p, MatchPhase::Level))?;

    let max_score = config.rules.max_score;
    let mut round = 0;
    loop {
        round += 1;
        // Rotate the survivor so scores spread before someone wins
        let survivor = ids[round % 2];
        for id in ids.iter().filter(|id| **id != survivor) {
            let lives = peers[0].world().players.get(*id).map(|p| p.record.lives).unwrap_or(0);
            for _ in 0..lives {
                peers[0].record_death(*id)?;
            }
        }
        run_until(&mut peers, "round end", |p| p[0].phase() == Some(MatchPhase::Transition))?;
        run_until(&mut peers, "next phase", |p| {
            all_in(p, MatchPhase::Level) || all_in(p, MatchPhase::Lobby)
        })?;

        let top = peers[0].world().players.iter().map(|p| p.record.score).max().unwrap_or(0);
        info!("Round {} won by {}, top score {}", round, survivor, top);
        if peers[0].phase() == Some(MatchPhase::Lobby) {
            break;
        }
        if top >= max_score {
            bail!("score {} reached without returning to the lobby", top);
        }
    }

    // Let trailing record updates land
    for _ in 0..TICK_RATE {
        tick_all(&mut peers);
    }

    info!("=== Phase Path ===");
    let mut path = vec![MatchPhase::Lobby];
    while let Ok(event) = phases.try_recv() {
        match event.data {
            GameEventData::PhaseChanged { to, .. } => path.push(to),
            GameEventData::MatchWon { winner_id } => info!("Match won by {:?} at tick {}", winner_id, event.tick),
            _ => {}
        }
    }
    info!("{}", path.iter().map(|p| p.name()).collect::<Vec<_>>().join(" -> "));

    info!("=== Match Results ===");
    for player in peers[0].world().players.iter() {
        info!("{} - Score: {}", player.id(), player.record.score);
    }

    info!("=== Verifying Convergence ===");
    let reference = peers[0].state_hash_hex();
    let mut diverged = false;
    for (i, peer) in peers.iter().enumerate() {
        let hash = peer.state_hash_hex();
        info!("Peer {} State Hash: {}", i, hash);
        if hash != reference {
            warn!("Peer {} diverged", i);
            diverged = true;
        }
    }
    if diverged {
        bail!("CONVERGENCE FAILURE: Hashes differ!");
    }
    info!("CONVERGENCE VERIFIED: Hashes match!");

    for peer in peers.iter_mut().rev() {
        peer.shutdown(arena_sync::ShutdownReason::Ok);
    }
    Ok(())
}

fn tick_all(peers: &mut [LoopbackPeer]) {
    for peer in peers.iter_mut() {
        peer.tick();
    }
}

fn all_in(peers: &[LoopbackPeer], phase: MatchPhase) -> bool {
    peers.iter().all(|p| p.phase() == Some(phase) && !p.is_transitioning())
}

fn run_until(
    peers: &mut [LoopbackPeer],
    what: &str,
    done: impl Fn(&[LoopbackPeer]) -> bool,
) -> anyhow::Result<()> {
    for _ in 0..MAX_TICKS {
        if done(&*peers) {
            return Ok(());
        }
        tick_all(peers);
    }
    bail!("timed out waiting for {}", what)
}
