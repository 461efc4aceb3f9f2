//! Peer link primitives

use std::fmt;

use bytes::Bytes;

use canopy_core::{CanopyResult, PeerId};
use canopy_wire::ConnectMetadata;

/// Handle of one link, unique within a node
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ConnectionId(pub u64);

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Conn({})", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Data channel or media call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkKind {
    Data,
    Call,
}

/// Who opened the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Media track kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Underlying transport state of a media call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl TransportState {
    /// States that end a downstream's usefulness
    pub fn is_lost(self) -> bool {
        matches!(self, TransportState::Disconnected | TransportState::Failed)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Disconnected => "disconnected",
            TransportState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Events raised by a link
///
/// `Open` fires at most once. `Close` and `Failure` are terminal and fire at
/// most once between them.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Open,
    Data(Bytes),
    Track(TrackKind),
    Transport(TransportState),
    Close,
    Failure(String),
}

impl LinkEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkEvent::Close | LinkEvent::Failure(_))
    }
}

/// Seam to a concrete media/data transport
///
/// Connection handles are allocated by the node, so every call names the
/// handle the transport must associate with the new link.
pub trait PeerTransport: Send {
    /// Open a data link
    fn connect(
        &mut self,
        conn: ConnectionId,
        peer: PeerId,
        metadata: &ConnectMetadata,
    ) -> CanopyResult<()>;

    /// Place a media call carrying the local stream
    fn call(
        &mut self,
        conn: ConnectionId,
        peer: PeerId,
        metadata: &ConnectMetadata,
    ) -> CanopyResult<()>;

    /// Answer an inbound media call
    fn answer(&mut self, conn: ConnectionId) -> CanopyResult<()>;

    fn send(&mut self, conn: ConnectionId, payload: Bytes) -> CanopyResult<()>;

    /// Swap the outgoing track of this kind on a call
    fn replace_track(&mut self, conn: ConnectionId, track: TrackKind) -> CanopyResult<()>;

    fn close(&mut self, conn: ConnectionId);
}
