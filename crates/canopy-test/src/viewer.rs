//! Viewer stub - the leaf end of the tree
//!
//! Speaks just enough of the link protocol to be served: opens a viewer
//! link, answers the parent's replica with `Ready`, answers the media call
//! and records what arrives.

use std::collections::VecDeque;
use std::time::Instant;

use canopy_core::PeerId;
use canopy_runtime::Action;
use canopy_transport::{ConnectionId, Direction, LinkEvent, LinkKind, LinkRole, LinkTable};
use canopy_wire::{ConnectMetadata, ControlEvent, ControlMessage};

/// A simulated viewer
#[derive(Debug)]
pub struct ViewerStub {
    peer: PeerId,
    links: LinkTable,
    actions: VecDeque<Action>,
    events: Vec<ControlEvent>,
    has_stream: bool,
    kicked: usize,
}

impl ViewerStub {
    pub fn new(peer: PeerId) -> Self {
        ViewerStub {
            peer,
            links: LinkTable::new(),
            actions: VecDeque::new(),
            events: Vec::new(),
            has_stream: false,
            kicked: 0,
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Control events received, duplicates included
    pub fn events(&self) -> &[ControlEvent] {
        &self.events
    }

    pub fn has_stream(&self) -> bool {
        self.has_stream
    }

    /// Kick notices received
    pub fn kicked(&self) -> usize {
        self.kicked
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Open a viewer link to a viewer-facing node
    pub fn connect(&mut self, parent: PeerId, now: Instant) -> ConnectionId {
        let conn = self
            .links
            .insert(parent, LinkKind::Data, Direction::Outbound, LinkRole::Upstream, now);
        self.actions.push_back(Action::Connect {
            conn,
            peer: parent,
            metadata: ConnectMetadata::viewer(),
        });
        conn
    }

    /// Close every link
    pub fn disconnect(&mut self) {
        for conn in self.links.ids() {
            self.links.remove(conn);
            self.actions.push_back(Action::Close { conn });
        }
    }

    pub fn accept(
        &mut self,
        peer: PeerId,
        metadata: ConnectMetadata,
        kind: LinkKind,
        now: Instant,
    ) -> ConnectionId {
        let role = match kind {
            LinkKind::Call => LinkRole::UpstreamCall,
            LinkKind::Data if metadata.notice.is_some() => LinkRole::Notice,
            LinkKind::Data => LinkRole::ParentReplica,
        };
        let conn = self.links.insert(peer, kind, Direction::Inbound, role, now);
        match role {
            LinkRole::UpstreamCall => self.actions.push_back(Action::Answer { conn }),
            LinkRole::Notice => {
                self.kicked += 1;
                self.links.remove(conn);
                self.actions.push_back(Action::Close { conn });
            }
            _ => {}
        }
        conn
    }

    pub fn handle(&mut self, conn: ConnectionId, event: LinkEvent) {
        let Some(role) = self.links.get(conn).map(|l| l.role) else {
            return;
        };
        match event {
            LinkEvent::Open => {
                if self.links.mark_open(conn) && role == LinkRole::ParentReplica {
                    self.actions.push_back(Action::Send {
                        conn,
                        message: ControlMessage::Ready,
                    });
                }
            }
            LinkEvent::Data(payload) => {
                if let Ok(ControlMessage::Control(event)) = ControlMessage::decode(&payload) {
                    self.events.push(event);
                }
            }
            LinkEvent::Track(_) => self.has_stream = true,
            LinkEvent::Transport(_) => {}
            LinkEvent::Close | LinkEvent::Failure(_) => {
                self.links.remove(conn);
            }
        }
    }

    pub fn drain_actions(&mut self) -> Vec<Action> {
        self.actions.drain(..).collect()
    }
}
