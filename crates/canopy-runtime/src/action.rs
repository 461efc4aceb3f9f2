//! Actions a node asks its environment to perform

use canopy_core::PeerId;
use canopy_transport::{ConnectionId, TrackKind};
use canopy_wire::{ConnectMetadata, ControlEvent, ControlMessage};

/// Output of the node state machine
///
/// Actions are emitted in the order they must be executed. Link handles are
/// allocated by the node; the executor associates each new link with the
/// handle it is given.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Open a data link
    Connect {
        conn: ConnectionId,
        peer: PeerId,
        metadata: ConnectMetadata,
    },
    /// Place a media call carrying the local stream
    Call {
        conn: ConnectionId,
        peer: PeerId,
        metadata: ConnectMetadata,
    },
    /// Answer an inbound media call
    Answer { conn: ConnectionId },
    /// Send a control message on an open data link
    Send {
        conn: ConnectionId,
        message: ControlMessage,
    },
    /// Swap the outgoing track of this kind on a downstream call
    ReplaceTrack { conn: ConnectionId, track: TrackKind },
    Close { conn: ConnectionId },
    /// Hand a flooded control event to the local application
    Deliver(ControlEvent),
    /// The node has finished its close path; the process may exit
    Shutdown,
}

impl Action {
    /// Link the action refers to, if any
    pub fn conn(&self) -> Option<ConnectionId> {
        match self {
            Action::Connect { conn, .. }
            | Action::Call { conn, .. }
            | Action::Answer { conn }
            | Action::Send { conn, .. }
            | Action::ReplaceTrack { conn, .. }
            | Action::Close { conn } => Some(*conn),
            Action::Deliver(_) | Action::Shutdown => None,
        }
    }
}
