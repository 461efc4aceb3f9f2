//! Overlay simulator
//!
//! Runs many [`Node`]s and [`ViewerStub`]s in one process against a shared
//! in-memory registry. Links are paired endpoint handles, delivery is FIFO
//! and time only moves when [`Overlay::advance`] is called, so every run is
//! deterministic.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use canopy_core::{Depth, NodeConfig, NodeIdentity, OwnerId, PeerId, SessionId};
use canopy_registry::{MemoryRegistry, MemorySessionLog};
use canopy_runtime::{Action, InitParams, Node};
use canopy_transport::{ConnectionId, LinkEvent, LinkKind, TrackKind};
use canopy_wire::{ConnectMetadata, ControlEvent, ControlMessage};

use crate::ViewerStub;

/// Work items processed before a simulation settles
pub const MAX_STEPS: usize = 100_000;

/// Participant in the overlay
#[derive(Debug)]
pub enum Endpoint {
    Node(Box<Node>),
    Viewer(ViewerStub),
}

impl Endpoint {
    fn accept(
        &mut self,
        from: PeerId,
        metadata: ConnectMetadata,
        kind: LinkKind,
        now: Instant,
    ) -> ConnectionId {
        match self {
            Endpoint::Node(node) => node.accept(from, metadata, kind, now),
            Endpoint::Viewer(viewer) => viewer.accept(from, metadata, kind, now),
        }
    }

    fn handle(&mut self, conn: ConnectionId, event: LinkEvent, now: Instant) {
        match self {
            Endpoint::Node(node) => node.handle(conn, event, now),
            Endpoint::Viewer(viewer) => viewer.handle(conn, event),
        }
    }

    fn drain(&mut self) -> Vec<Action> {
        match self {
            Endpoint::Node(node) => node.drain_actions(),
            Endpoint::Viewer(viewer) => viewer.drain_actions(),
        }
    }

    fn has_stream(&self) -> bool {
        match self {
            Endpoint::Node(node) => node.has_stream(),
            Endpoint::Viewer(viewer) => viewer.has_stream(),
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        match self {
            Endpoint::Node(node) => node.next_deadline(),
            Endpoint::Viewer(_) => None,
        }
    }
}

#[derive(Debug)]
enum Work {
    Act(PeerId, Action),
    Event(PeerId, ConnectionId, LinkEvent),
}

/// A control message observed on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct Sent {
    pub from: PeerId,
    pub to: PeerId,
    pub message: ControlMessage,
}

/// In-process overlay of nodes and viewers
pub struct Overlay {
    now: Instant,
    config: NodeConfig,
    session: SessionId,
    owner: OwnerId,
    registry: Arc<MemoryRegistry>,
    log: Arc<MemorySessionLog>,
    endpoints: BTreeMap<PeerId, Endpoint>,
    pairs: HashMap<(PeerId, ConnectionId), (PeerId, ConnectionId)>,
    unreachable: BTreeSet<PeerId>,
    delivered: BTreeMap<PeerId, Vec<ControlEvent>>,
    shutdowns: BTreeSet<PeerId>,
    sent: Vec<Sent>,
    queue: VecDeque<Work>,
}

impl Overlay {
    pub fn new(config: NodeConfig) -> Self {
        Overlay {
            now: Instant::now(),
            config,
            session: SessionId::new(1),
            owner: OwnerId::new(1),
            registry: Arc::new(MemoryRegistry::new()),
            log: Arc::new(MemorySessionLog::new()),
            endpoints: BTreeMap::new(),
            pairs: HashMap::new(),
            unreachable: BTreeSet::new(),
            delivered: BTreeMap::new(),
            shutdowns: BTreeSet::new(),
            sent: Vec::new(),
            queue: VecDeque::new(),
        }
    }

    // ------------------------------------------------------------------
    // Population
    // ------------------------------------------------------------------

    fn identity(&self, peer: PeerId) -> NodeIdentity {
        NodeIdentity::new(peer, self.session, self.owner)
    }

    /// Add the stream origin at `depth`
    pub fn add_origin(&mut self, peer: PeerId, depth: Depth) {
        let node = Node::origin(
            self.identity(peer),
            self.config.clone(),
            depth,
            self.registry.clone(),
            self.log.clone(),
        );
        self.endpoints.insert(peer, Endpoint::Node(Box::new(node)));
    }

    /// Create a node and bootstrap it without delivering anything
    ///
    /// Several nodes started this way race for the same registry state.
    pub fn bootstrap(&mut self, peer: PeerId, init: InitParams) {
        let mut node = Node::new(
            self.identity(peer),
            self.config.clone(),
            self.registry.clone(),
            self.log.clone(),
        );
        node.bootstrap(init, self.now);
        self.endpoints.insert(peer, Endpoint::Node(Box::new(node)));
        self.collect(peer);
    }

    /// Bootstrap a node and run until the overlay settles
    pub fn join(&mut self, peer: PeerId, init: InitParams) {
        self.bootstrap(peer, init);
        self.run();
    }

    /// Connect a new viewer to a viewer-facing node
    pub fn add_viewer(&mut self, viewer: PeerId, parent: PeerId) {
        let mut stub = ViewerStub::new(viewer);
        stub.connect(parent, self.now);
        self.endpoints.insert(viewer, Endpoint::Viewer(stub));
        self.collect(viewer);
        self.run();
    }

    /// Close every link a viewer holds
    pub fn disconnect_viewer(&mut self, viewer: PeerId) {
        if let Some(Endpoint::Viewer(stub)) = self.endpoints.get_mut(&viewer) {
            stub.disconnect();
        }
        self.collect(viewer);
        self.run();
    }

    /// Links to an unreachable peer never open
    pub fn set_unreachable(&mut self, peer: PeerId, unreachable: bool) {
        if unreachable {
            self.unreachable.insert(peer);
        } else {
            self.unreachable.remove(&peer);
        }
    }

    // ------------------------------------------------------------------
    // Signaling
    // ------------------------------------------------------------------

    pub fn kill(&mut self, peer: PeerId) {
        if let Some(node) = self.node_mut(peer) {
            node.kill();
        }
        self.collect(peer);
        self.run();
    }

    pub fn remove_peer(&mut self, peer: PeerId, child: PeerId) {
        let now = self.now;
        if let Some(node) = self.node_mut(peer) {
            node.remove_peer(child, now);
        }
        self.collect(peer);
        self.run();
    }

    /// Originate a control event at `peer` and flood it
    pub fn broadcast(
        &mut self,
        peer: PeerId,
        name: &str,
        payload: serde_json::Value,
    ) -> Option<ControlEvent> {
        let event = self.node_mut(peer)?.broadcast(name, payload);
        self.collect(peer);
        self.run();
        event
    }

    // ------------------------------------------------------------------
    // Time
    // ------------------------------------------------------------------

    pub fn now(&self) -> Instant {
        self.now
    }

    /// Move the clock forward, firing every deadline on the way in order
    pub fn advance(&mut self, by: Duration) {
        let target = self.now + by;
        loop {
            let next = self
                .endpoints
                .values()
                .filter_map(Endpoint::next_deadline)
                .filter(|d| *d <= target)
                .min();
            let Some(deadline) = next else {
                break;
            };
            self.now = self.now.max(deadline);

            let due: Vec<PeerId> = self
                .endpoints
                .iter()
                .filter(|(_, e)| e.next_deadline().is_some_and(|d| d <= self.now))
                .map(|(peer, _)| *peer)
                .collect();
            let now = self.now;
            for peer in due {
                if let Some(node) = self.node_mut(peer) {
                    node.tick(now);
                }
                self.collect(peer);
            }
            self.run();
        }
        self.now = target;
    }

    // ------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------

    /// Process queued work until nothing is left
    ///
    /// Returns the number of items processed.
    pub fn run(&mut self) -> usize {
        let mut steps = 0;
        while let Some(work) = self.queue.pop_front() {
            steps += 1;
            if steps > MAX_STEPS {
                tracing::error!(pending = self.queue.len(), "Overlay did not settle, dropping work");
                self.queue.clear();
                break;
            }
            match work {
                Work::Act(peer, action) => self.execute(peer, action),
                Work::Event(peer, conn, event) => self.deliver(peer, conn, event),
            }
        }
        steps
    }

    fn collect(&mut self, peer: PeerId) {
        let Some(endpoint) = self.endpoints.get_mut(&peer) else {
            return;
        };
        for action in endpoint.drain() {
            self.queue.push_back(Work::Act(peer, action));
        }
    }

    fn execute(&mut self, from: PeerId, action: Action) {
        match action {
            Action::Connect {
                conn,
                peer,
                metadata,
            } => {
                if let Some(remote) = self.open(from, conn, peer, metadata, LinkKind::Data) {
                    self.queue.push_back(Work::Event(peer, remote, LinkEvent::Open));
                    self.queue.push_back(Work::Event(from, conn, LinkEvent::Open));
                }
            }
            Action::Call {
                conn,
                peer,
                metadata,
            } => {
                // Opens once answered.
                self.open(from, conn, peer, metadata, LinkKind::Call);
            }
            Action::Answer { conn } => {
                let Some((caller, remote)) = self.pairs.get(&(from, conn)).copied() else {
                    return;
                };
                self.queue.push_back(Work::Event(from, conn, LinkEvent::Open));
                self.queue.push_back(Work::Event(caller, remote, LinkEvent::Open));
                if self.endpoints.get(&caller).is_some_and(Endpoint::has_stream) {
                    self.queue
                        .push_back(Work::Event(from, conn, LinkEvent::Track(TrackKind::Video)));
                }
            }
            Action::Send { conn, message } => {
                let Some((to, remote)) = self.pairs.get(&(from, conn)).copied() else {
                    return;
                };
                match message.encode() {
                    Ok(payload) => {
                        self.sent.push(Sent { from, to, message });
                        self.queue.push_back(Work::Event(to, remote, LinkEvent::Data(payload)));
                    }
                    Err(e) => tracing::error!(%from, error = %e, "Unencodable message"),
                }
            }
            Action::ReplaceTrack { conn, track } => {
                if let Some((to, remote)) = self.pairs.get(&(from, conn)).copied() {
                    self.queue.push_back(Work::Event(to, remote, LinkEvent::Track(track)));
                }
            }
            Action::Close { conn } => {
                if let Some((to, remote)) = self.pairs.remove(&(from, conn)) {
                    self.pairs.remove(&(to, remote));
                    self.queue.push_back(Work::Event(to, remote, LinkEvent::Close));
                }
            }
            Action::Deliver(event) => {
                self.delivered.entry(from).or_default().push(event);
            }
            Action::Shutdown => {
                self.shutdowns.insert(from);
            }
        }
    }

    /// Hand a new link to its destination and pair the two handles
    fn open(
        &mut self,
        from: PeerId,
        conn: ConnectionId,
        to: PeerId,
        metadata: ConnectMetadata,
        kind: LinkKind,
    ) -> Option<ConnectionId> {
        if self.unreachable.contains(&to) {
            tracing::debug!(%from, %to, "Destination unreachable, link hangs");
            return None;
        }
        let now = self.now;
        let endpoint = self.endpoints.get_mut(&to)?;
        let remote = endpoint.accept(from, metadata, kind, now);
        self.pairs.insert((from, conn), (to, remote));
        self.pairs.insert((to, remote), (from, conn));
        self.collect(to);
        Some(remote)
    }

    fn deliver(&mut self, peer: PeerId, conn: ConnectionId, event: LinkEvent) {
        // A link closed before its open was delivered never opens.
        if event == LinkEvent::Open && !self.pairs.contains_key(&(peer, conn)) {
            return;
        }
        let now = self.now;
        let Some(endpoint) = self.endpoints.get_mut(&peer) else {
            return;
        };
        endpoint.handle(conn, event, now);
        self.collect(peer);
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn registry(&self) -> &MemoryRegistry {
        &self.registry
    }

    pub fn session_log(&self) -> &MemorySessionLog {
        &self.log
    }

    pub fn node(&self, peer: PeerId) -> Option<&Node> {
        match self.endpoints.get(&peer)? {
            Endpoint::Node(node) => Some(&**node),
            Endpoint::Viewer(_) => None,
        }
    }

    fn node_mut(&mut self, peer: PeerId) -> Option<&mut Node> {
        match self.endpoints.get_mut(&peer)? {
            Endpoint::Node(node) => Some(&mut **node),
            Endpoint::Viewer(_) => None,
        }
    }

    pub fn viewer(&self, peer: PeerId) -> Option<&ViewerStub> {
        match self.endpoints.get(&peer)? {
            Endpoint::Viewer(viewer) => Some(viewer),
            Endpoint::Node(_) => None,
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.endpoints.values().filter_map(|e| match e {
            Endpoint::Node(node) => Some(&**node),
            Endpoint::Viewer(_) => None,
        })
    }

    pub fn children(&self, peer: PeerId) -> Vec<PeerId> {
        self.node(peer).map(Node::downstream_peers).unwrap_or_default()
    }

    pub fn upstream(&self, peer: PeerId) -> Option<PeerId> {
        self.node(peer)?.upstream()
    }

    /// Control events handed to the application at `peer`
    pub fn delivered(&self, peer: PeerId) -> &[ControlEvent] {
        self.delivered.get(&peer).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Deliveries of one event at `peer`, viewers included
    pub fn deliveries_of(&self, peer: PeerId, event: &ControlEvent) -> usize {
        let events = match self.endpoints.get(&peer) {
            Some(Endpoint::Viewer(viewer)) => viewer.events(),
            _ => self.delivered(peer),
        };
        events.iter().filter(|e| e.id == event.id).count()
    }

    pub fn is_shut_down(&self, peer: PeerId) -> bool {
        self.shutdowns.contains(&peer)
    }

    /// Every control message sent so far, in send order
    pub fn sent(&self) -> &[Sent] {
        &self.sent
    }

    /// Live links in the overlay
    pub fn link_count(&self) -> usize {
        self.pairs.len() / 2
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }
}

impl std::fmt::Debug for Overlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Overlay")
            .field("endpoints", &self.endpoints.len())
            .field("links", &self.link_count())
            .field("pending", &self.queue.len())
            .finish()
    }
}
