//! Network Layer
//!
//! Session lifecycle and replication over an abstract transport.
//! Match rules live in `game/`; this layer only moves them between peers.

pub mod protocol;
pub mod transport;
pub mod session;
pub mod peer;

pub use protocol::{ConnectFailedReason, Envelope, GameMode, Payload, ShutdownReason};
pub use transport::{LoopbackHub, LoopbackTransport, Transport, TransportError, TransportEvent};
pub use session::{
    ConnectionStatus, SessionConfig, SessionConnector, SessionError, SessionHandle, SessionSignal,
    StatusUpdate,
};
pub use peer::{Peer, PeerError};
