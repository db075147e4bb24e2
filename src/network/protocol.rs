//! Protocol Messages
//!
//! Wire format between peers. Every frame is an [`Envelope`] sent to all
//! peers of the session, the sender included. Frames travel as bincode;
//! JSON is available for logs and debugging.

use serde::{Serialize, Deserialize};
use uuid::Uuid;

use crate::game::machine::{AuthorityClaim, BroadcastCall};
use crate::game::state::{MatchState, PeerId, PhaseUpdate, PlayerId, PlayerRecord};

// =============================================================================
// SESSION TERMS
// =============================================================================

/// How a peer takes part in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameMode {
    /// Dedicated authority for everything; also plays
    Host,
    /// Joins a host; never authoritative
    Client,
    /// No host; an elected master owns match state and every peer owns
    /// its own player record
    Shared,
}

/// Why a session ended. Wire-visible; each cause has one fixed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShutdownReason {
    /// Closed on purpose
    Ok,
    /// Unclassified failure
    Error,
    /// The match in this room had already left the lobby
    GameAlreadyRunning,
    /// The room exists with a different game mode
    IncompatibleConfiguration,
    /// The room already has a host
    ServerInRoom,
    /// Removed by session policy
    DisconnectedByPolicy,
}

impl ShutdownReason {
    /// Human-readable message shown to the user.
    pub fn message(self) -> &'static str {
        match self {
            ShutdownReason::Ok => "User terminated network session!",
            ShutdownReason::Error => "Unknown network error!",
            ShutdownReason::GameAlreadyRunning => "Game in this room already started!",
            ShutdownReason::IncompatibleConfiguration => "This room already exist in a different game mode!",
            ShutdownReason::ServerInRoom => "There is already a server/host in this room",
            ShutdownReason::DisconnectedByPolicy => "The server terminated the network session!",
        }
    }
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// Why a connection attempt was refused before any session existed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectFailedReason {
    /// No session with that name
    NotFound,
    /// Session closed to new joins
    Closed,
    /// Session at capacity
    Full,
    /// Refused by the session for another reason
    Rejected(ShutdownReason),
}

impl std::fmt::Display for ConnectFailedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectFailedReason::NotFound => f.write_str("Session not found"),
            ConnectFailedReason::Closed => f.write_str("Session is closed"),
            ConnectFailedReason::Full => f.write_str("Session is full"),
            ConnectFailedReason::Rejected(reason) => f.write_str(reason.message()),
        }
    }
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// What a frame carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// The match authority exists, with its current state. Re-sent to
    /// bring late joiners up to date.
    AuthoritySpawned {
        /// Owner and entity of the authority
        claim: AuthorityClaim,
        /// Replicated match state at send time
        state: MatchState,
    },
    /// Authoritative call, applied by every peer
    Call(BroadcastCall),
    /// Replicated phase write
    Phase(PhaseUpdate),
    /// Replicated player record write
    PlayerUpsert(PlayerRecord),
    /// A player left the session
    PlayerRemoved {
        /// Player that left
        id: PlayerId,
    },
}

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Session the frame belongs to
    pub session: Uuid,
    /// Sending peer
    pub sender: PeerId,
    /// Per-sender sequence number, starting at 1
    pub seq: u64,
    /// Content
    pub payload: Payload,
}

impl Envelope {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Serialize to a bincode frame.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from a bincode frame.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::EntityHandle;
    use crate::game::machine::MatchCall;
    use crate::game::state::MatchPhase;

    fn envelope(payload: Payload) -> Envelope {
        Envelope {
            session: Uuid::new_v4(),
            sender: PeerId(2),
            seq: 7,
            payload,
        }
    }

    #[test]
    fn test_call_survives_binary_frame() {
        let msg = envelope(Payload::Call(BroadcastCall {
            id: 3,
            call: MatchCall::ScoreAndLoad {
                winner: Some(PlayerId(1)),
                winning_score: 2,
                next_level: 4,
            },
        }));

        let bytes = msg.to_bytes().unwrap();
        let parsed = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_authority_sync_json() {
        let msg = envelope(Payload::AuthoritySpawned {
            claim: AuthorityClaim { owner: PeerId(1), handle: EntityHandle(9) },
            state: MatchState { phase: MatchPhase::Level, generation: 4 },
        });

        let json = msg.to_json().unwrap();
        assert!(json.contains("AuthoritySpawned"));
        assert!(json.contains("\"level\""));

        if let Payload::AuthoritySpawned { state, .. } = Envelope::from_json(&json).unwrap().payload {
            assert_eq!(state.generation, 4);
        } else {
            panic!("Wrong payload type");
        }
    }

    #[test]
    fn test_shutdown_messages_are_distinct() {
        let reasons = [
            ShutdownReason::Ok,
            ShutdownReason::Error,
            ShutdownReason::GameAlreadyRunning,
            ShutdownReason::IncompatibleConfiguration,
            ShutdownReason::ServerInRoom,
            ShutdownReason::DisconnectedByPolicy,
        ];
        let messages: std::collections::BTreeSet<_> = reasons.iter().map(|r| r.message()).collect();
        assert_eq!(messages.len(), reasons.len());
        assert_eq!(ShutdownReason::GameAlreadyRunning.message(), "Game in this room already started!");
        assert_eq!(
            ShutdownReason::DisconnectedByPolicy.message(),
            "The server terminated the network session!"
        );
    }

    #[test]
    fn test_shutdown_reason_round_trips() {
        let bytes = bincode::serialize(&ShutdownReason::ServerInRoom).unwrap();
        let parsed: ShutdownReason = bincode::deserialize(&bytes).unwrap();
        assert_eq!(parsed, ShutdownReason::ServerInRoom);
    }
}
