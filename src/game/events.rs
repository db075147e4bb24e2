//! Presentation Events
//!
//! Notifications for whatever renders the match (HUD, lobby panels, audio).
//! Coordination never waits on these; they are fanned out over a broadcast
//! channel and dropped if nobody listens.

use serde::{Serialize, Deserialize};

use crate::game::level::LevelTarget;
use crate::game::state::{MatchPhase, PlayerId};

/// Presentation event data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameEventData {
    /// Replicated phase changed on this peer
    PhaseChanged {
        /// Phase before the write
        from: MatchPhase,
        /// Phase now in effect
        to: MatchPhase,
    },

    /// Local input gate toggled
    InputEnabled(bool),

    /// A player's score should be shown
    ScoreUpdated {
        /// Player whose score changed
        player_id: PlayerId,
        /// Score to display
        score: u8,
    },

    /// In-level score display hidden and reset
    ScoreboardReset {
        /// True when returning to the lobby
        lobby: bool,
    },

    /// Lobby panel visibility
    LobbyUi {
        /// Whether the panel is shown
        visible: bool,
    },

    /// Final match result shown in the lobby
    LobbyScoreShown {
        /// Match winner, if any
        winner_id: Option<PlayerId>,
    },

    /// A player reached the winning score
    MatchWon {
        /// Player that reached the winning score
        winner_id: Option<PlayerId>,
    },

    /// Pre-level countdown; zero means go
    Countdown {
        /// Seconds left
        remaining: u8,
    },

    /// Full-screen transition effect
    TransitionEffect {
        /// Effect switched on or off
        active: bool,
    },

    /// A level (or the lobby) became the active one
    LevelActivated {
        /// Level now active
        target: LevelTarget,
    },
}

/// A presentation event stamped with the coordination tick.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameEvent {
    /// Tick when event occurred
    pub tick: u64,

    /// Event data
    pub data: GameEventData,
}

impl GameEvent {
    /// Create a new event.
    pub fn new(tick: u64, data: GameEventData) -> Self {
        Self { tick, data }
    }

    /// Player involved, if any.
    pub fn player_id(&self) -> Option<PlayerId> {
        match &self.data {
            GameEventData::ScoreUpdated { player_id, .. } => Some(*player_id),
            GameEventData::LobbyScoreShown { winner_id } => *winner_id,
            GameEventData::MatchWon { winner_id } => *winner_id,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_player_id_extraction() {
        let scored = GameEvent::new(3, GameEventData::ScoreUpdated { player_id: PlayerId(2), score: 1 });
        assert_eq!(scored.player_id(), Some(PlayerId(2)));

        let countdown = GameEvent::new(4, GameEventData::Countdown { remaining: 2 });
        assert_eq!(countdown.player_id(), None);
    }

    #[test]
    fn test_event_json_shape() {
        let event = GameEvent::new(10, GameEventData::PhaseChanged {
            from: MatchPhase::Lobby,
            to: MatchPhase::Transition,
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"PhaseChanged\""));
        assert!(json.contains("\"transition\""));
    }
}
