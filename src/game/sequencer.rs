//! Level Transition Sequencer
//!
//! One transition is a fixed list of steps: wait, despawn every avatar,
//! show the transition effect, swap the active level, respawn every avatar.
//! The list is built up front from a snapshot of the registry and advanced
//! once per tick; waits are explicit steps carrying a tick count.
//!
//! The sequencer reports what happened through [`SequencerEvent`]s. The
//! three [`Milestone`]s are where the match state machine mutates state.

use std::collections::VecDeque;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, trace};

use crate::core::vec2::Transform;
use crate::game::entity::EntityKind;
use crate::game::level::LevelTarget;
use crate::game::state::PlayerId;
use crate::game::timer::duration_to_ticks;
use crate::game::world::World;

// =============================================================================
// CONFIG
// =============================================================================

/// Step delays of a transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionTimings {
    /// Pause before the first despawn
    pub initial_delay: Duration,
    /// Gap between consecutive despawns
    pub despawn_spacing: Duration,
    /// Score display time before the effect starts
    pub score_display: Duration,
    /// Effect lead-in before the level swap
    pub effect_lead_in: Duration,
    /// Pause after the effect ends
    pub effect_tail: Duration,
    /// Pause after each respawn
    pub respawn_spacing: Duration,
}

impl Default for TransitionTimings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            despawn_spacing: Duration::from_millis(100),
            score_display: Duration::from_millis(1500),
            effect_lead_in: Duration::from_millis(300),
            effect_tail: Duration::from_millis(300),
            respawn_spacing: Duration::from_millis(300),
        }
    }
}

// =============================================================================
// TYPES
// =============================================================================

/// One sequencer run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionPlan {
    /// Where the transition lands
    pub target: LevelTarget,
    /// Player that won the previous round, if any
    pub winner: Option<PlayerId>,
    /// Score the winner reached
    pub winning_score: u8,
}

/// Points in a run where the match state machine takes over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Milestone {
    /// Every avatar has been despawned
    PlayersDespawned,
    /// The transition effect fully covers the screen
    EffectVisible,
    /// Every avatar is back
    TransitionOver,
}

/// Something the sequencer did this tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SequencerEvent {
    /// A player's avatar left the world
    AvatarDespawned(PlayerId),
    /// A player's avatar re-entered the world
    AvatarRespawned {
        /// Player
        player_id: PlayerId,
        /// Spawn point used
        transform: Transform,
    },
    /// Transition effect toggled
    Effect {
        /// On or off
        active: bool,
    },
    /// A level became active
    LevelActivated(LevelTarget),
    /// A milestone was reached
    Milestone(Milestone),
}

/// Sequencer errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SequencerError {
    /// A run is already in flight
    #[error("transition to {0} already in progress")]
    Busy(LevelTarget),
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Step {
    Wait(u64),
    Despawn(PlayerId),
    Reach(Milestone),
    EffectOn,
    SwapLevel,
    EffectOff,
    Respawn(PlayerId),
}

#[derive(Debug)]
struct Run {
    plan: TransitionPlan,
    steps: VecDeque<Step>,
    resume_at: u64,
}

// =============================================================================
// SEQUENCER
// =============================================================================

/// Runs at most one transition at a time.
#[derive(Debug, Default)]
pub struct LevelTransitionSequencer {
    timings: TransitionTimings,
    run: Option<Run>,
}

impl LevelTransitionSequencer {
    /// Create a sequencer with the given step delays.
    pub fn new(timings: TransitionTimings) -> Self {
        Self { timings, run: None }
    }

    /// Start a transition into gameplay level `next_level`.
    pub fn run_level_transition(
        &mut self,
        next_level: usize,
        winner: Option<PlayerId>,
        winning_score: u8,
        world: &World,
        now: u64,
    ) -> Result<(), SequencerError> {
        self.start(
            TransitionPlan {
                target: LevelTarget::Level(next_level),
                winner,
                winning_score,
            },
            world,
            now,
        )
    }

    /// Start a transition back to the lobby.
    pub fn run_lobby_transition(
        &mut self,
        winner: Option<PlayerId>,
        winning_score: u8,
        world: &World,
        now: u64,
    ) -> Result<(), SequencerError> {
        self.start(
            TransitionPlan {
                target: LevelTarget::Lobby,
                winner,
                winning_score,
            },
            world,
            now,
        )
    }

    fn start(&mut self, plan: TransitionPlan, world: &World, now: u64) -> Result<(), SequencerError> {
        if let Some(run) = &self.run {
            return Err(SequencerError::Busy(run.plan.target));
        }

        let players = world.players.ids();
        let t = &self.timings;
        let mut steps = VecDeque::new();

        steps.push_back(Step::Wait(duration_to_ticks(t.initial_delay)));
        for id in &players {
            steps.push_back(Step::Despawn(*id));
            steps.push_back(Step::Wait(duration_to_ticks(t.despawn_spacing)));
        }
        steps.push_back(Step::Reach(Milestone::PlayersDespawned));
        steps.push_back(Step::Wait(duration_to_ticks(t.score_display)));
        steps.push_back(Step::EffectOn);
        steps.push_back(Step::Wait(duration_to_ticks(t.effect_lead_in)));
        steps.push_back(Step::Reach(Milestone::EffectVisible));
        steps.push_back(Step::SwapLevel);
        steps.push_back(Step::EffectOff);
        steps.push_back(Step::Wait(duration_to_ticks(t.effect_tail)));
        for id in &players {
            steps.push_back(Step::Respawn(*id));
            steps.push_back(Step::Wait(duration_to_ticks(t.respawn_spacing)));
        }
        steps.push_back(Step::Reach(Milestone::TransitionOver));

        info!(destination = %plan.target, winner = ?plan.winner, players = players.len(), "Transition started");
        self.run = Some(Run {
            plan,
            steps,
            resume_at: now,
        });
        Ok(())
    }

    /// Whether a run is in flight.
    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    /// Plan of the run in flight.
    pub fn plan(&self) -> Option<&TransitionPlan> {
        self.run.as_ref().map(|r| &r.plan)
    }

    /// Drop any pending steps. Nothing is resumed later.
    pub fn abort(&mut self) {
        if let Some(run) = self.run.take() {
            info!(destination = %run.plan.target, pending = run.steps.len(), "Transition aborted");
        }
    }

    /// Execute every step due at `now`.
    ///
    /// Returns the events produced and, when the run finished this tick,
    /// its plan.
    pub fn advance(&mut self, now: u64, world: &mut World) -> (Vec<SequencerEvent>, Option<TransitionPlan>) {
        let mut events = Vec::new();
        let Some(run) = self.run.as_mut() else {
            return (events, None);
        };

        while now >= run.resume_at {
            let Some(step) = run.steps.pop_front() else {
                break;
            };
            #[cfg(feature = "debug-tracing")]
            trace!(tick = now, ?step, "Sequencer step");

            match step {
                Step::Wait(ticks) => run.resume_at = now + ticks,
                Step::Despawn(id) => {
                    if despawn_avatar(world, id) {
                        events.push(SequencerEvent::AvatarDespawned(id));
                    }
                }
                Step::Reach(milestone) => {
                    debug!(?milestone, tick = now, "Transition milestone");
                    events.push(SequencerEvent::Milestone(milestone));
                }
                Step::EffectOn => events.push(SequencerEvent::Effect { active: true }),
                Step::EffectOff => events.push(SequencerEvent::Effect { active: false }),
                Step::SwapLevel => {
                    let target = swap_level(world, run.plan.target);
                    events.push(SequencerEvent::LevelActivated(target));
                }
                Step::Respawn(id) => {
                    if let Some(transform) = respawn_avatar(world, id) {
                        events.push(SequencerEvent::AvatarRespawned { player_id: id, transform });
                    }
                }
            }
        }

        if run.steps.is_empty() {
            let finished = self.run.take().map(|r| r.plan);
            trace!("Transition finished");
            return (events, finished);
        }
        (events, None)
    }
}

/// Take a player's avatar out of the world. Players that left meanwhile
/// are skipped.
fn despawn_avatar(world: &mut World, id: PlayerId) -> bool {
    let local = world.authority.local_peer;
    let Some(player) = world.players.get_mut(id) else {
        return false;
    };
    player.avatar_active = false;
    if player.record.owner == local {
        if let Some(handle) = player.avatar.take() {
            world.bridge.despawn(handle);
        }
    }
    true
}

fn swap_level(world: &mut World, target: LevelTarget) -> LevelTarget {
    world.levels.deactivate_current(world.bridge.as_mut());
    let authority = world.authority.owns_match.then_some(world.authority.local_peer);
    world.levels.activate(target, world.bridge.as_mut(), authority)
}

fn respawn_avatar(world: &mut World, id: PlayerId) -> Option<Transform> {
    let local = world.authority.local_peer;
    let transform = world.levels.spawn_point(id);
    let player = world.players.get_mut(id)?;
    player.avatar_active = true;
    if player.record.owner == local && player.avatar.is_none() {
        let handle = world.bridge.spawn(EntityKind::Avatar(id), transform, local);
        player.avatar = Some(handle);
    }
    Some(transform)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::EntityLedger;
    use crate::game::level::LevelSet;
    use crate::game::state::{PeerId, PlayerRecord, PlayerState};

    fn world_with_players(count: u32, ledger: &EntityLedger) -> World {
        let mut world = World::new(LevelSet::standard(3), Box::new(ledger.clone()));
        world.authority.local_peer = PeerId(0);
        world.authority.owns_match = true;
        for id in 0..count {
            let mut state = PlayerState::mirrored(PlayerRecord::new(PlayerId(id), PeerId(0), 3, 100));
            let transform = world.levels.spawn_point(PlayerId(id));
            state.avatar = Some(world.bridge.spawn(EntityKind::Avatar(PlayerId(id)), transform, PeerId(0)));
            state.avatar_active = true;
            world.players.insert(state);
        }
        world
    }

    fn run_to_end(seq: &mut LevelTransitionSequencer, world: &mut World, mut on_event: impl FnMut(u64, &SequencerEvent, &World)) -> u64 {
        let mut tick = 0;
        loop {
            let (events, finished) = seq.advance(tick, world);
            for event in &events {
                on_event(tick, event, world);
            }
            if finished.is_some() {
                return tick;
            }
            tick += 1;
            assert!(tick < 10_000, "sequencer never finished");
        }
    }

    #[test]
    fn test_level_transition_milestone_order() {
        let ledger = EntityLedger::new();
        let mut world = world_with_players(2, &ledger);
        let mut seq = LevelTransitionSequencer::default();

        seq.run_level_transition(2, Some(PlayerId(1)), 2, &world, 0).unwrap();

        let mut milestones = Vec::new();
        run_to_end(&mut seq, &mut world, |_, event, world| {
            if let SequencerEvent::Milestone(m) = event {
                milestones.push(*m);
                if *m == Milestone::TransitionOver {
                    // Swap happened between EffectVisible and TransitionOver
                    assert!(world.levels.get(LevelTarget::Level(2)).unwrap().is_active());
                    assert!(!world.levels.get(LevelTarget::Lobby).unwrap().is_active());
                }
                if *m == Milestone::EffectVisible {
                    assert!(world.levels.get(LevelTarget::Lobby).unwrap().is_active());
                }
            }
        });

        assert_eq!(
            milestones,
            vec![Milestone::PlayersDespawned, Milestone::EffectVisible, Milestone::TransitionOver]
        );
        assert!(!seq.is_running());
    }

    #[test]
    fn test_level_swap_follows_effect_visible() {
        let ledger = EntityLedger::new();
        let mut world = world_with_players(1, &ledger);
        let mut seq = LevelTransitionSequencer::default();
        seq.run_level_transition(2, None, 0, &world, 0).unwrap();

        let mut order = Vec::new();
        run_to_end(&mut seq, &mut world, |_, event, _| match event {
            SequencerEvent::Milestone(m) => order.push(format!("{:?}", m)),
            SequencerEvent::LevelActivated(t) => order.push(format!("activated {}", t)),
            _ => {}
        });
        assert_eq!(order, vec!["PlayersDespawned", "EffectVisible", "activated level 2", "TransitionOver"]);
    }

    #[test]
    fn test_step_timing() {
        let ledger = EntityLedger::new();
        let mut world = world_with_players(2, &ledger);
        let mut seq = LevelTransitionSequencer::default();
        seq.run_level_transition(0, None, 0, &world, 0).unwrap();

        let mut at = std::collections::BTreeMap::new();
        let mut respawns = Vec::new();
        let end = run_to_end(&mut seq, &mut world, |tick, event, _| {
            if let SequencerEvent::AvatarRespawned { player_id, .. } = event {
                respawns.push((*player_id, tick));
            }
            at.entry(format!("{:?}", event)).or_insert(tick);
        });

        // 1.0s wait, then despawns 0.1s apart
        assert_eq!(at["AvatarDespawned(PlayerId(0))"], 60);
        assert_eq!(at["AvatarDespawned(PlayerId(1))"], 66);
        assert_eq!(at["Milestone(PlayersDespawned)"], 72);
        // 1.5s score display, 0.3s lead-in
        assert_eq!(at["Effect { active: true }"], 162);
        assert_eq!(at["Milestone(EffectVisible)"], 180);
        // 0.3s tail, then 0.3s after each respawn, the last one included
        assert_eq!(respawns, vec![(PlayerId(0), 198), (PlayerId(1), 216)]);
        assert_eq!(at["Milestone(TransitionOver)"], 234);
        assert_eq!(end, 234);
    }

    #[test]
    fn test_despawn_and_respawn_through_bridge() {
        let ledger = EntityLedger::new();
        let mut world = world_with_players(3, &ledger);
        let mut seq = LevelTransitionSequencer::default();
        seq.run_level_transition(1, None, 0, &world, 0).unwrap();

        let mut despawned_avatars = 0;
        run_to_end(&mut seq, &mut world, |_, event, _| {
            if matches!(event, SequencerEvent::Milestone(Milestone::PlayersDespawned)) {
                despawned_avatars = ledger
                    .live_matching(|k| matches!(k, EntityKind::Avatar(_)))
                    .len();
            }
        });
        assert_eq!(despawned_avatars, 0);

        let avatars = ledger.live_matching(|k| matches!(k, EntityKind::Avatar(_)));
        assert_eq!(avatars.len(), 3);
        let level = world.levels.get(LevelTarget::Level(1)).unwrap();
        for (_, kind, transform) in avatars {
            let EntityKind::Avatar(id) = kind else { unreachable!() };
            assert_eq!(transform, level.spawn_point(id));
        }
    }

    #[test]
    fn test_non_authority_spawns_no_level_objects() {
        let ledger = EntityLedger::new();
        let mut world = world_with_players(1, &ledger);
        world.authority.owns_match = false;
        let mut seq = LevelTransitionSequencer::default();
        seq.run_level_transition(2, None, 0, &world, 0).unwrap();
        run_to_end(&mut seq, &mut world, |_, _, _| {});

        assert!(ledger.live_matching(|k| matches!(k, EntityKind::LevelObject { .. })).is_empty());
    }

    #[test]
    fn test_busy_rejects_second_run() {
        let ledger = EntityLedger::new();
        let world = world_with_players(1, &ledger);
        let mut seq = LevelTransitionSequencer::default();
        seq.run_level_transition(1, None, 0, &world, 0).unwrap();

        assert_eq!(
            seq.run_lobby_transition(None, 0, &world, 0),
            Err(SequencerError::Busy(LevelTarget::Level(1)))
        );
    }

    #[test]
    fn test_abort_stops_respawns() {
        let ledger = EntityLedger::new();
        let mut world = world_with_players(2, &ledger);
        let mut seq = LevelTransitionSequencer::default();
        seq.run_level_transition(1, None, 0, &world, 0).unwrap();

        for tick in 0..100 {
            seq.advance(tick, &mut world);
        }
        seq.abort();
        for tick in 100..1000 {
            let (events, finished) = seq.advance(tick, &mut world);
            assert!(events.is_empty());
            assert!(finished.is_none());
        }
        assert!(ledger.live_matching(|k| matches!(k, EntityKind::Avatar(_))).is_empty());
    }

    #[test]
    fn test_player_leaving_mid_run_is_skipped() {
        let ledger = EntityLedger::new();
        let mut world = world_with_players(2, &ledger);
        let mut seq = LevelTransitionSequencer::default();
        seq.run_lobby_transition(None, 0, &world, 0).unwrap();

        world.players.remove(PlayerId(1));
        let mut respawned = Vec::new();
        run_to_end(&mut seq, &mut world, |_, event, _| {
            if let SequencerEvent::AvatarRespawned { player_id, .. } = event {
                respawned.push(*player_id);
            }
        });
        assert_eq!(respawned, vec![PlayerId(0)]);
    }
}
