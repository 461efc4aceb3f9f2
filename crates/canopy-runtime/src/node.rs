//! Canopy Node - the relay state machine
//!
//! The node is sans-IO. Link events, signaling commands and timer deadlines
//! go in; [`Action`]s come out through [`Node::pop_action`]. All mutation of
//! the downstream set, limbo and tally happens on `&mut self`, so one node's
//! state is always updated serially.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use canopy_core::{
    CanopyError, CanopyResult, Depth, NodeConfig, NodeIdentity, PeerId, SessionToken,
};
use canopy_registry::{LogId, Registry, RegistryEntry, SessionLog, SessionLogEntry};
use canopy_transport::{
    ConnectionId, Direction, LinkEvent, LinkKind, LinkRole, LinkTable, TrackKind, TransportState,
};
use canopy_tree::{
    place, relocate, reported_viewers, select_bump_candidate, select_redirect_target, Departed,
    DownstreamEntry, DownstreamSet, FloodFilter, LimboEntry, PlacementRequest, RelocationPlan,
    ViewerTally,
};
use canopy_wire::{ConnectMetadata, ControlEvent, ControlMessage, InboundClass, NoticeKind};

use crate::{Action, Timer, TimerKey, Timers};

/// Lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Parameters loaded, no links yet
    Bootstrapping,
    /// Resolving a parent
    Placing,
    /// Upstream link opened, waiting for it to establish
    Attaching,
    /// Upstream healthy and the stream has arrived
    Streaming,
    /// Executing a relocation or reacting to a kick
    Rebalancing,
    /// Terminal
    Closed,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Bootstrapping => "bootstrapping",
            NodeState::Placing => "placing",
            NodeState::Attaching => "attaching",
            NodeState::Streaming => "streaming",
            NodeState::Rebalancing => "rebalancing",
            NodeState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Bootstrap parameters delivered by signaling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitParams {
    /// The stream origin, used when the registry offers no slot
    pub origin: PeerId,
    /// Directly supplied parent, preferred over the origin
    pub first_attach: Option<PeerId>,
    /// Initial depth; viewer-facing when absent
    pub depth: Option<Depth>,
}

impl InitParams {
    pub fn new(origin: PeerId) -> Self {
        InitParams {
            origin,
            first_attach: None,
            depth: None,
        }
    }

    pub fn with_first_attach(mut self, peer: PeerId) -> Self {
        self.first_attach = Some(peer);
        self
    }

    pub fn with_depth(mut self, depth: Depth) -> Self {
        self.depth = Some(depth);
        self
    }

    fn bootstrap_parent(&self) -> PeerId {
        self.first_attach.unwrap_or(self.origin)
    }
}

#[derive(Clone, Debug, Default)]
pub struct NodeStats {
    pub placements: u64,
    pub attach_timeouts: u64,
    pub admitted: u64,
    pub rejected: u64,
    pub redirects: u64,
    pub bumps: u64,
    pub relocations: u64,
    pub kicks_sent: u64,
    pub events_delivered: u64,
    pub events_relayed: u64,
}

/// Our current upstream
#[derive(Debug, Clone)]
struct Upstream {
    peer: PeerId,
    /// Our subtree attach link
    link: ConnectionId,
    /// Media call answered from the parent
    call: Option<ConnectionId>,
    origin_client: bool,
    open: bool,
}

/// Origin or relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Origin,
    Relay,
}

/// A relay-tree node
pub struct Node {
    identity: NodeIdentity,
    config: NodeConfig,
    role: Role,
    state: NodeState,
    depth: Depth,
    init: Option<InitParams>,
    upstream: Option<Upstream>,
    has_stream: bool,
    /// Metadata received with the upstream call, forwarded on our calls
    stream_metadata: ConnectMetadata,
    downstream: DownstreamSet,
    tally: ViewerTally,
    flood: FloodFilter,
    links: LinkTable,
    timers: Timers,
    attach_timer: Option<TimerKey>,
    /// Attach timeouts since the upstream last opened
    failed_attaches: u32,
    shutdown_timer: Option<TimerKey>,
    /// Turned-away attach links and the child each is pointed at
    redirects: HashMap<ConnectionId, PeerId>,
    actions: VecDeque<Action>,
    registry: Arc<dyn Registry>,
    session_log: Arc<dyn SessionLog>,
    log_id: LogId,
    last_reported: Option<u32>,
    stats: NodeStats,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("peer", &self.identity.peer)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("depth", &self.depth)
            .field("upstream", &self.upstream.as_ref().map(|u| u.peer))
            .field("downstream", &self.downstream.len())
            .finish()
    }
}

impl Node {
    /// Create a relay node; nothing happens until [`Node::bootstrap`]
    pub fn new(
        identity: NodeIdentity,
        config: NodeConfig,
        registry: Arc<dyn Registry>,
        session_log: Arc<dyn SessionLog>,
    ) -> Self {
        let capacity = config.fanout_capacity;
        Node {
            identity,
            config,
            role: Role::Relay,
            state: NodeState::Bootstrapping,
            depth: Depth::VIEWER,
            init: None,
            upstream: None,
            has_stream: false,
            stream_metadata: ConnectMetadata::default(),
            downstream: DownstreamSet::new(capacity),
            tally: ViewerTally::new(),
            flood: FloodFilter::default(),
            links: LinkTable::new(),
            timers: Timers::new(),
            attach_timer: None,
            failed_attaches: 0,
            shutdown_timer: None,
            redirects: HashMap::new(),
            actions: VecDeque::new(),
            registry,
            session_log,
            log_id: LogId::generate(),
            last_reported: None,
            stats: NodeStats::default(),
        }
    }

    /// Create the stream origin
    ///
    /// The origin owns the stream from the start, has no upstream and is never
    /// offered as a registry slot.
    pub fn origin(
        identity: NodeIdentity,
        config: NodeConfig,
        depth: Depth,
        registry: Arc<dyn Registry>,
        session_log: Arc<dyn SessionLog>,
    ) -> Self {
        let mut node = Node::new(identity, config, registry, session_log);
        node.role = Role::Origin;
        node.depth = depth;
        node.has_stream = true;
        node.state = NodeState::Streaming;
        node
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn peer(&self) -> PeerId {
        self.identity.peer
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn depth(&self) -> Depth {
        self.depth
    }

    pub fn is_origin(&self) -> bool {
        self.role == Role::Origin
    }

    pub fn is_closed(&self) -> bool {
        self.state == NodeState::Closed
    }

    pub fn has_stream(&self) -> bool {
        self.has_stream
    }

    pub fn upstream(&self) -> Option<PeerId> {
        self.upstream.as_ref().map(|u| u.peer)
    }

    /// Attached through the bootstrap parent rather than a registry slot
    pub fn is_origin_client(&self) -> bool {
        self.upstream.as_ref().is_some_and(|u| u.origin_client)
    }

    pub fn downstream(&self) -> &DownstreamSet {
        &self.downstream
    }

    pub fn downstream_peers(&self) -> Vec<PeerId> {
        self.downstream.entries().iter().map(|e| e.peer).collect()
    }

    pub fn limbo_peers(&self) -> Vec<PeerId> {
        self.downstream.limbo().iter().map(|e| e.peer).collect()
    }

    /// Count this node reports upstream (the live total at the origin)
    pub fn viewers(&self) -> u32 {
        reported_viewers(self.depth, self.downstream.len(), &self.tally)
    }

    pub fn token(&self) -> &SessionToken {
        &self.config.session_token
    }

    pub fn log_id(&self) -> LogId {
        self.log_id
    }

    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn shutdown_pending(&self) -> bool {
        self.shutdown_timer
            .is_some_and(|key| self.timers.is_pending(key))
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn pop_action(&mut self) -> Option<Action> {
        self.actions.pop_front()
    }

    pub fn drain_actions(&mut self) -> Vec<Action> {
        self.actions.drain(..).collect()
    }

    // ------------------------------------------------------------------
    // Signaling surface
    // ------------------------------------------------------------------

    /// Process the bootstrap parameters and start placement
    pub fn bootstrap(&mut self, init: InitParams, now: Instant) {
        if self.state != NodeState::Bootstrapping || self.is_origin() {
            tracing::warn!(peer = %self.peer(), state = %self.state, "Ignoring bootstrap");
            return;
        }

        self.init = Some(init);
        if let Some(depth) = init.depth {
            self.depth = depth;
        }

        let entry = SessionLogEntry::child(
            self.log_id,
            self.identity.owner,
            self.identity.session,
            SystemTime::now(),
        );
        if let Err(e) = self.session_log.open(entry) {
            tracing::warn!(peer = %self.peer(), error = %e, "Failed to open session log entry");
        }

        let entry = RegistryEntry::new(self.peer(), self.identity.owner, self.depth);
        if let Err(e) = self.registry.register(entry) {
            tracing::warn!(peer = %self.peer(), error = %e, "Failed to register node");
        }

        tracing::info!(
            peer = %self.peer(),
            origin = %init.origin,
            depth = %self.depth,
            "Node bootstrapped"
        );
        self.place(None, false, now);
    }

    /// Admit a peer named by signaling as if it had connected
    pub fn add_viewer(&mut self, peer: PeerId, now: Instant) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.admit(peer, None, None, None, now) {
            tracing::warn!(peer = %self.peer(), viewer = %peer, error = %e, "Signaled viewer rejected");
        }
    }

    /// Disconnect a downstream peer
    pub fn remove_peer(&mut self, peer: PeerId, now: Instant) {
        if self.is_closed() {
            return;
        }
        self.remove_downstream(peer, now);
    }

    /// Run the close path
    pub fn kill(&mut self) {
        tracing::info!(peer = %self.peer(), "Kill requested");
        self.close();
    }

    /// Originate a control event and flood it
    pub fn broadcast(&mut self, name: &str, payload: serde_json::Value) -> Option<ControlEvent> {
        if self.is_closed() {
            return None;
        }
        let id = self.flood.originate(self.peer());
        let event = ControlEvent::new(id, name, payload);
        for conn in self.links.flood_targets(None) {
            self.push_send(conn, ControlMessage::Control(event.clone()));
        }
        tracing::debug!(peer = %self.peer(), event = ?event.id, "Control event originated");
        Some(event)
    }

    // ------------------------------------------------------------------
    // Inbound links
    // ------------------------------------------------------------------

    /// Classify and take ownership of a link a peer opened to us
    ///
    /// Returns the handle the transport must use for the link's events.
    pub fn accept(
        &mut self,
        peer: PeerId,
        metadata: ConnectMetadata,
        kind: LinkKind,
        now: Instant,
    ) -> ConnectionId {
        let role = match kind {
            LinkKind::Call => LinkRole::UpstreamCall,
            LinkKind::Data => LinkRole::Notice,
        };
        let conn = self.links.insert(peer, kind, Direction::Inbound, role, now);

        if self.is_closed() {
            self.close_link(conn);
            return conn;
        }

        let result = match kind {
            LinkKind::Call => self.accept_call(conn, peer, metadata),
            LinkKind::Data => InboundClass::classify(&metadata, &self.config.session_token)
                .and_then(|class| self.accept_data(conn, peer, class, now)),
        };

        if let Err(e) = result {
            self.stats.rejected += 1;
            tracing::warn!(peer = %self.peer(), from = %peer, %conn, error = %e, "Inbound link rejected");
            self.close_link(conn);
        }
        conn
    }

    fn accept_call(
        &mut self,
        conn: ConnectionId,
        peer: PeerId,
        metadata: ConnectMetadata,
    ) -> CanopyResult<()> {
        let Some(upstream) = self.upstream.as_mut().filter(|u| u.peer == peer) else {
            return Err(CanopyError::ProtocolViolation(format!(
                "call from {} which is not our upstream",
                peer
            )));
        };

        let previous = upstream.call.replace(conn);
        self.stream_metadata = metadata;
        self.push(Action::Answer { conn });
        if let Some(old) = previous {
            self.close_link(old);
        }
        self.cancel_attach_timer();
        tracing::debug!(peer = %self.peer(), upstream = %peer, %conn, "Upstream call answered");
        Ok(())
    }

    fn accept_data(
        &mut self,
        conn: ConnectionId,
        peer: PeerId,
        class: InboundClass,
        now: Instant,
    ) -> CanopyResult<()> {
        tracing::debug!(peer = %self.peer(), from = %peer, %conn, ?class, "Inbound link");
        match class {
            InboundClass::ControlReplica => {
                self.links.set_role(conn, LinkRole::ParentReplica);
                Ok(())
            }
            InboundClass::RelocationNotice(kind) => {
                self.handle_notice(conn, peer, kind, now);
                Ok(())
            }
            InboundClass::ViewerAttach => {
                if !self.depth.is_viewer_facing() {
                    return Err(CanopyError::ProtocolViolation(format!(
                        "viewer link at depth {}",
                        self.depth
                    )));
                }
                self.links.set_role(conn, LinkRole::Viewer);
                self.admit(peer, Some(conn), None, None, now)
            }
            InboundClass::SubtreeAttach { depth, viewers, .. } => {
                self.links.set_role(conn, LinkRole::Subtree);
                self.admit(peer, Some(conn), Some(depth), Some(viewers), now)
            }
            InboundClass::ParentRenegotiate { bumped } => {
                self.links.set_role(conn, LinkRole::Renegotiate);
                self.renegotiate(conn, peer, bumped, now)
            }
        }
    }

    fn handle_notice(&mut self, conn: ConnectionId, peer: PeerId, kind: NoticeKind, now: Instant) {
        match kind {
            NoticeKind::Kicked if self.upstream() == Some(peer) => {
                tracing::info!(peer = %self.peer(), parent = %peer, "Kicked by upstream");
                self.close_link(conn);
                self.transition(NodeState::Rebalancing);
                self.place(None, false, now);
            }
            NoticeKind::Kicked => {
                tracing::debug!(peer = %self.peer(), from = %peer, "Stale kick notice ignored");
                self.close_link(conn);
            }
            NoticeKind::Relocated => {
                tracing::info!(peer = %self.peer(), child = %peer, "Peer relocated under us");
                self.close_link(conn);
            }
        }
    }

    fn renegotiate(
        &mut self,
        conn: ConnectionId,
        peer: PeerId,
        bumped: bool,
        now: Instant,
    ) -> CanopyResult<()> {
        if self.is_origin() {
            return Err(CanopyError::ProtocolViolation(
                "origin has no upstream".into(),
            ));
        }
        if self.upstream() != Some(peer) && !bumped {
            return Err(CanopyError::ProtocolViolation(format!(
                "renegotiation from {} which is not our upstream",
                peer
            )));
        }

        if bumped {
            let result =
                self.registry
                    .relocate_under(peer, self.peer(), self.depth, SystemTime::now());
            if let Err(e) = result {
                tracing::warn!(peer = %self.peer(), parent = %peer, error = %e, "Failed to record relocation");
            }
        }
        tracing::info!(peer = %self.peer(), parent = %peer, bumped, "Upstream renegotiated");
        self.close_link(conn);
        let origin_client = self.is_origin_client();
        self.attach_to(peer, bumped, origin_client, now);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// Admit a downstream peer, bumping a mismatched occupant if needed
    fn admit(
        &mut self,
        peer: PeerId,
        attach: Option<ConnectionId>,
        depth: Option<Depth>,
        viewers: Option<u32>,
        now: Instant,
    ) -> CanopyResult<()> {
        if self.downstream.contains(peer) {
            tracing::debug!(peer = %self.peer(), child = %peer, "Replacing previous links of returning peer");
            self.drop_downstream(peer);
        }

        if let Some(incoming) = depth {
            if let Some(occupant) =
                select_bump_candidate(self.depth, incoming, self.downstream.entries())
            {
                self.bump(occupant, peer, now);
            }
        }

        if !self.downstream.has_room() {
            if let (Some(conn), Some(_)) = (attach, depth) {
                if let Some(target) = self.redirect_target(peer) {
                    self.redirect(conn, peer, target);
                    return Ok(());
                }
            }
            return Err(CanopyError::CapacityExceeded {
                capacity: self.downstream.capacity(),
            });
        }

        if self.has_stream {
            let replica = self.open_replica(peer, now);
            self.downstream.admit(DownstreamEntry {
                peer,
                attach,
                replica: Some(replica),
                call: None,
                depth,
                attached_at: now,
            })?;
        } else {
            self.downstream.admit_limbo(LimboEntry {
                peer,
                attach,
                depth,
                accepted_at: now,
            })?;
        }

        self.stats.admitted += 1;
        self.cancel_shutdown();
        if let Some(viewers) = viewers {
            self.tally.record(peer, viewers);
        }
        tracing::info!(
            peer = %self.peer(),
            child = %peer,
            depth = ?depth,
            forwarding = self.has_stream,
            "Downstream admitted"
        );
        self.report_viewers();
        Ok(())
    }

    /// Relocate `occupant` under `newcomer`
    ///
    /// The occupant leaves the downstream set now; the instruction follows
    /// after the bump grace so its in-flight traffic can drain.
    fn bump(&mut self, occupant: PeerId, newcomer: PeerId, now: Instant) {
        let Some(departed) = self.downstream.remove(occupant) else {
            return;
        };
        self.stats.bumps += 1;
        self.tally.forget(occupant);

        let attach = departed
            .links
            .iter()
            .copied()
            .find(|conn| self.links.get(*conn).is_some_and(|l| l.role == LinkRole::Subtree));
        for conn in departed.links.iter().copied().filter(|c| Some(*c) != attach) {
            self.close_link(conn);
        }

        match attach {
            Some(link) => {
                self.timers.schedule(
                    now + self.config.bump_grace,
                    Timer::BumpSend {
                        occupant,
                        link,
                        new_parent: newcomer,
                    },
                );
            }
            None => {
                tracing::warn!(peer = %self.peer(), %occupant, "Bumped occupant has no attach link");
            }
        }
        tracing::info!(peer = %self.peer(), %occupant, %newcomer, "Occupant bumped");
    }

    /// Child with room for a newcomer we cannot hold
    ///
    /// Load is the larger of the child's registry child count and, for a
    /// viewer-facing child, its last raw report.
    fn redirect_target(&self, newcomer: PeerId) -> Option<PeerId> {
        let load = |child: PeerId| {
            let listed = match self.registry.entry(child) {
                Ok(entry) => entry.map(|e| e.children.len()),
                Err(e) => {
                    tracing::debug!(peer = %self.peer(), %child, error = %e, "Child load unknown");
                    None
                }
            };
            let reported = self
                .downstream
                .get(child)
                .and_then(|e| e.depth)
                .filter(|d| d.is_viewer_facing())
                .and_then(|_| self.tally.get(child))
                .and_then(|v| usize::try_from(v).ok());
            match (listed, reported) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            }
        };
        select_redirect_target(
            self.downstream.entries(),
            newcomer,
            self.downstream.capacity(),
            load,
        )
    }

    /// Point a newcomer at `target`; the instruction goes out once the link opens
    fn redirect(&mut self, conn: ConnectionId, newcomer: PeerId, target: PeerId) {
        self.stats.redirects += 1;
        self.links.set_role(conn, LinkRole::Redirected);
        self.redirects.insert(conn, target);
        tracing::info!(peer = %self.peer(), %newcomer, %target, "Full, redirecting newcomer");
    }

    fn send_relocation(&mut self, occupant: PeerId, link: ConnectionId, new_parent: PeerId) {
        if !self.links.contains(link) {
            tracing::debug!(peer = %self.peer(), %occupant, "Bumped occupant already gone");
            return;
        }
        let message = ControlMessage::Relocate {
            token: self.config.session_token.clone(),
            new_parent,
            depth: self.depth,
        };
        self.push_send(link, message);
        self.close_link(link);
        tracing::debug!(peer = %self.peer(), %occupant, %new_parent, "Relocation instruction sent");
    }

    // ------------------------------------------------------------------
    // Placement and attach
    // ------------------------------------------------------------------

    /// Resolve a parent and attach; `preferred` replaces the slot search
    fn place(&mut self, preferred: Option<PeerId>, bumped: bool, now: Instant) {
        let Some(init) = self.init else {
            self.close();
            return;
        };
        self.transition(NodeState::Placing);
        self.stats.placements += 1;

        let request = PlacementRequest {
            peer: self.peer(),
            owner: self.identity.owner,
            depth: self.depth,
            capacity: self.config.fanout_capacity,
            preferred,
            fallback: Some(init.bootstrap_parent()),
        };
        let Some(placement) = place(self.registry.as_ref(), &request, SystemTime::now()) else {
            tracing::warn!(peer = %self.peer(), "No parent available");
            self.close();
            return;
        };

        if let Some(depth) = placement.depth.filter(|d| *d != self.depth) {
            self.set_depth(depth);
        }
        self.attach_to(placement.parent, bumped, placement.origin_client, now);
    }

    fn attach_to(&mut self, parent: PeerId, bumped: bool, origin_client: bool, now: Instant) {
        self.cancel_attach_timer();
        let mut call = None;
        if let Some(old) = self.upstream.take() {
            self.close_link(old.link);
            if old.peer == parent {
                // Kept until the parent's next call replaces it.
                call = old.call;
            } else {
                if let Some(old_call) = old.call {
                    self.close_link(old_call);
                }
                for conn in self.links.to_peer(old.peer, Some(LinkRole::ParentReplica)) {
                    self.close_link(conn);
                }
            }
        }

        let metadata = ConnectMetadata::subtree(
            self.config.session_token.clone(),
            self.depth,
            bumped,
            self.viewers(),
        );
        let link = self
            .links
            .insert(parent, LinkKind::Data, Direction::Outbound, LinkRole::Upstream, now);
        self.push(Action::Connect {
            conn: link,
            peer: parent,
            metadata,
        });

        self.upstream = Some(Upstream {
            peer: parent,
            link,
            call,
            origin_client,
            open: false,
        });
        self.attach_timer = Some(self.timers.schedule(
            now + self.config.attach_timeout,
            Timer::AttachTimeout { link },
        ));
        self.transition(NodeState::Attaching);
        tracing::info!(peer = %self.peer(), %parent, depth = %self.depth, bumped, "Attaching upstream");
    }

    fn execute_relocation(&mut self, new_parent: PeerId, depth: Depth, now: Instant) {
        let plan = match RelocationPlan::under(depth) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(peer = %self.peer(), error = %e, "Relocation instruction rejected");
                return;
            }
        };
        self.transition(NodeState::Rebalancing);
        self.stats.relocations += 1;
        self.depth = plan.depth;

        let had_any = self.downstream.occupancy() > 0;
        let pruned = self.downstream.prune(|d| plan.keeps(d));
        for departed in pruned {
            self.kick(departed, now);
        }
        self.report_viewers();
        self.check_viewer_zero(had_any, now);

        let bookkeeping = relocate(
            self.registry.as_ref(),
            self.peer(),
            new_parent,
            plan.depth,
            SystemTime::now(),
        );
        if let Err(e) = bookkeeping {
            tracing::debug!(peer = %self.peer(), error = %e, "Relocation bookkeeping incomplete, placement records the move");
        }

        let notice = ConnectMetadata::notice(self.config.session_token.clone(), NoticeKind::Relocated);
        self.open_notice(new_parent, notice, now);

        tracing::info!(peer = %self.peer(), %new_parent, depth = %plan.depth, "Relocating");
        self.place(Some(new_parent), true, now);
    }

    fn set_depth(&mut self, depth: Depth) {
        self.depth = depth;
        let entry = RegistryEntry::new(self.peer(), self.identity.owner, depth);
        if let Err(e) = self.registry.register(entry) {
            tracing::warn!(peer = %self.peer(), error = %e, "Failed to record depth");
        }
    }

    // ------------------------------------------------------------------
    // Link events
    // ------------------------------------------------------------------

    /// Process an event on one of our links
    pub fn handle(&mut self, conn: ConnectionId, event: LinkEvent, now: Instant) {
        if self.is_closed() {
            return;
        }
        let Some(link) = self.links.get(conn).cloned() else {
            tracing::debug!(peer = %self.peer(), %conn, ?event, "Event for unknown link");
            return;
        };

        match event {
            LinkEvent::Open => {
                if self.links.mark_open(conn) {
                    self.on_open(conn, link.role);
                }
            }
            LinkEvent::Data(payload) => match ControlMessage::decode(&payload) {
                Ok(message) => self.on_message(conn, link.peer, link.role, message, now),
                Err(e) => {
                    tracing::warn!(peer = %self.peer(), from = %link.peer, %conn, error = %e, "Undecodable control message");
                }
            },
            LinkEvent::Track(track) => self.on_track(conn, link.role, track, now),
            LinkEvent::Transport(state) => self.on_transport(link.peer, link.role, state, now),
            LinkEvent::Close | LinkEvent::Failure(_) => {
                if let LinkEvent::Failure(reason) = &event {
                    tracing::warn!(peer = %self.peer(), remote = %link.peer, %conn, %reason, "Link failed");
                }
                self.links.remove(conn);
                self.on_terminal(conn, link.peer, link.role, now);
            }
        }
    }

    fn on_open(&mut self, conn: ConnectionId, role: LinkRole) {
        match role {
            LinkRole::Upstream => {
                let Some(upstream) = self.upstream.as_mut().filter(|u| u.link == conn) else {
                    return;
                };
                upstream.open = true;
                let parent = upstream.peer;
                self.failed_attaches = 0;
                self.cancel_attach_timer();
                if self.has_stream {
                    self.transition(NodeState::Streaming);
                }
                tracing::debug!(peer = %self.peer(), %parent, "Upstream open");
                self.last_reported = None;
                self.report_viewers();
            }
            LinkRole::ParentReplica => {
                self.push_send(conn, ControlMessage::Ready);
            }
            LinkRole::Redirected => {
                if let Some(parent) = self.redirects.remove(&conn) {
                    let message = ControlMessage::Redirect {
                        token: self.config.session_token.clone(),
                        parent,
                    };
                    self.push_send(conn, message);
                    self.close_link(conn);
                }
            }
            LinkRole::Notice => {
                if self
                    .links
                    .get(conn)
                    .is_some_and(|l| l.direction == Direction::Outbound)
                {
                    self.close_link(conn);
                }
            }
            _ => {}
        }
    }

    fn on_message(
        &mut self,
        conn: ConnectionId,
        from: PeerId,
        role: LinkRole,
        message: ControlMessage,
        now: Instant,
    ) {
        match message {
            ControlMessage::Viewers { viewers } => {
                if !self.downstream.contains(from) {
                    tracing::debug!(peer = %self.peer(), %from, "Viewer report from non-child ignored");
                    return;
                }
                if self.tally.record(from, viewers) {
                    self.report_viewers();
                }
            }
            ControlMessage::Ready => {
                if role == LinkRole::Replica && self.downstream.get(from).is_some() {
                    self.call_downstream(from, now);
                }
            }
            ControlMessage::Relocate {
                token,
                new_parent,
                depth,
            } => {
                if !self.is_upstream_link(conn, from) || token != self.config.session_token {
                    tracing::warn!(peer = %self.peer(), %from, "Relocation instruction from untrusted link");
                    return;
                }
                self.execute_relocation(new_parent, depth, now);
            }
            ControlMessage::Redirect { token, parent } => {
                if !self.is_upstream_link(conn, from) || token != self.config.session_token {
                    tracing::warn!(peer = %self.peer(), %from, "Redirect from untrusted link");
                    return;
                }
                tracing::info!(peer = %self.peer(), %from, %parent, "Redirected by full parent");
                self.place(Some(parent), false, now);
            }
            ControlMessage::Control(event) => self.on_control(from, event),
        }
    }

    fn is_upstream_link(&self, conn: ConnectionId, from: PeerId) -> bool {
        self.upstream
            .as_ref()
            .is_some_and(|u| u.link == conn && u.peer == from)
    }

    fn on_control(&mut self, from: PeerId, event: ControlEvent) {
        if !self.flood.accept(event.id) {
            return;
        }
        self.stats.events_delivered += 1;
        let relayed = event.relayed();
        self.push(Action::Deliver(event));
        for target in self.links.flood_targets(Some(from)) {
            self.stats.events_relayed += 1;
            self.push_send(target, ControlMessage::Control(relayed.clone()));
        }
    }

    fn on_track(&mut self, conn: ConnectionId, role: LinkRole, track: TrackKind, now: Instant) {
        let from_upstream = role == LinkRole::UpstreamCall
            && self.upstream.as_ref().is_some_and(|u| u.call == Some(conn));
        if !from_upstream {
            return;
        }

        if !self.has_stream {
            self.has_stream = true;
            let mut opened = Vec::new();
            let promoted = {
                let links = &mut self.links;
                self.downstream.promote_limbo(now, |peer| {
                    let replica =
                        links.insert(peer, LinkKind::Data, Direction::Outbound, LinkRole::Replica, now);
                    opened.push((replica, peer));
                    replica
                })
            };
            for (replica, peer) in opened {
                self.push(Action::Connect {
                    conn: replica,
                    peer,
                    metadata: ConnectMetadata::replica(),
                });
            }
            if self.upstream.as_ref().is_some_and(|u| u.open) {
                self.transition(NodeState::Streaming);
            }
            tracing::info!(peer = %self.peer(), ?track, promoted = promoted.len(), "Stream available");
            self.report_viewers();
        } else {
            for call in self.downstream.calls() {
                self.push(Action::ReplaceTrack { conn: call, track });
            }
            tracing::debug!(peer = %self.peer(), ?track, "Outgoing track replaced");
        }
    }

    fn on_transport(&mut self, peer: PeerId, role: LinkRole, state: TransportState, now: Instant) {
        if !state.is_lost() {
            return;
        }
        let error = CanopyError::TransportFailure {
            peer,
            state: state.to_string(),
        };
        match role {
            LinkRole::DownstreamCall => {
                if self.depth.is_viewer_facing() {
                    tracing::warn!(peer = %self.peer(), error = %error, "Viewer transport lost, correcting count");
                } else {
                    tracing::warn!(peer = %self.peer(), error = %error, "Descendant transport lost, removing");
                }
                self.remove_downstream(peer, now);
            }
            LinkRole::UpstreamCall => {
                tracing::warn!(peer = %self.peer(), error = %error, "Upstream media transport lost");
            }
            _ => {}
        }
    }

    fn on_terminal(&mut self, conn: ConnectionId, peer: PeerId, role: LinkRole, now: Instant) {
        match role {
            LinkRole::Upstream => {
                let Some(upstream) = self.upstream.as_ref().filter(|u| u.link == conn) else {
                    return;
                };
                if !upstream.open {
                    // Refused before opening; the attach timeout re-places.
                    tracing::debug!(peer = %self.peer(), parent = %peer, "Upstream refused");
                    return;
                }
                tracing::warn!(peer = %self.peer(), parent = %peer, "Upstream link lost");
                self.upstream = None;
                self.transition(NodeState::Rebalancing);
                self.place(None, false, now);
            }
            LinkRole::UpstreamCall => {
                if let Some(upstream) = self.upstream.as_mut().filter(|u| u.call == Some(conn)) {
                    upstream.call = None;
                }
            }
            LinkRole::Subtree | LinkRole::Viewer | LinkRole::Replica | LinkRole::DownstreamCall => {
                if self.downstream.peer_of_link(conn) == Some(peer) {
                    self.remove_downstream(peer, now);
                }
            }
            LinkRole::Redirected => {
                self.redirects.remove(&conn);
            }
            LinkRole::ParentReplica | LinkRole::Notice | LinkRole::Renegotiate => {}
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Fire every timer due at `now`
    pub fn tick(&mut self, now: Instant) {
        while let Some((key, timer)) = self.timers.pop_due(now) {
            if self.is_closed() {
                return;
            }
            match timer {
                Timer::AttachTimeout { link } => {
                    if self.attach_timer == Some(key) {
                        self.attach_timer = None;
                        self.on_attach_timeout(link, now);
                    }
                }
                Timer::BumpSend {
                    occupant,
                    link,
                    new_parent,
                } => self.send_relocation(occupant, link, new_parent),
                Timer::Shutdown => {
                    if self.shutdown_timer == Some(key) {
                        self.shutdown_timer = None;
                        tracing::info!(peer = %self.peer(), "No viewers left, shutting down");
                        self.close();
                    }
                }
            }
        }
    }

    fn on_attach_timeout(&mut self, link: ConnectionId, now: Instant) {
        let Some(upstream) = self.upstream.as_ref().filter(|u| u.link == link && !u.open) else {
            return;
        };
        let error = CanopyError::AttachTimeout {
            parent: upstream.peer,
        };
        self.stats.attach_timeouts += 1;
        self.failed_attaches += 1;
        if self.failed_attaches >= self.config.max_attach_attempts {
            tracing::warn!(
                peer = %self.peer(),
                error = %error,
                attempts = self.failed_attaches,
                "Attach retries exhausted, closing"
            );
            self.close();
            return;
        }
        tracing::warn!(peer = %self.peer(), error = %error, "Re-placing");
        self.place(None, false, now);
    }

    fn cancel_attach_timer(&mut self) {
        if let Some(key) = self.attach_timer.take() {
            self.timers.cancel(key);
        }
    }

    fn cancel_shutdown(&mut self) {
        if let Some(key) = self.shutdown_timer.take() {
            if self.timers.cancel(key) {
                tracing::debug!(peer = %self.peer(), "Pending shutdown cancelled");
            }
        }
    }

    // ------------------------------------------------------------------
    // Downstream helpers
    // ------------------------------------------------------------------

    fn open_replica(&mut self, peer: PeerId, now: Instant) -> ConnectionId {
        let conn = self
            .links
            .insert(peer, LinkKind::Data, Direction::Outbound, LinkRole::Replica, now);
        self.push(Action::Connect {
            conn,
            peer,
            metadata: ConnectMetadata::replica(),
        });
        conn
    }

    fn open_notice(&mut self, peer: PeerId, metadata: ConnectMetadata, now: Instant) {
        let conn = self
            .links
            .insert(peer, LinkKind::Data, Direction::Outbound, LinkRole::Notice, now);
        self.push(Action::Connect {
            conn,
            peer,
            metadata,
        });
    }

    fn call_downstream(&mut self, peer: PeerId, now: Instant) {
        let call = self
            .links
            .insert(peer, LinkKind::Call, Direction::Outbound, LinkRole::DownstreamCall, now);
        self.push(Action::Call {
            conn: call,
            peer,
            metadata: self.stream_metadata.clone(),
        });
        if let Some(old) = self.downstream.set_call(peer, call) {
            self.close_link(old);
        }
        tracing::debug!(peer = %self.peer(), child = %peer, %call, "Calling downstream");
    }

    /// Send a kick notice and close the departed peer's links
    fn kick(&mut self, departed: Departed, now: Instant) {
        self.stats.kicks_sent += 1;
        let notice = ConnectMetadata::notice(self.config.session_token.clone(), NoticeKind::Kicked);
        self.open_notice(departed.peer, notice, now);
        for conn in departed.links {
            self.close_link(conn);
        }
        self.tally.forget(departed.peer);
        tracing::info!(
            peer = %self.peer(),
            child = %departed.peer,
            depth = ?departed.depth,
            forwarding = departed.was_forwarding,
            "Downstream kicked"
        );
    }

    /// Remove a peer without reporting or shutdown checks
    fn drop_downstream(&mut self, peer: PeerId) -> Option<Departed> {
        let departed = self.downstream.remove(peer)?;
        for conn in departed.links.iter().copied() {
            self.close_link(conn);
        }
        self.tally.forget(peer);
        Some(departed)
    }

    fn remove_downstream(&mut self, peer: PeerId, now: Instant) {
        let had_any = self.downstream.occupancy() > 0;
        let Some(departed) = self.drop_downstream(peer) else {
            return;
        };
        tracing::info!(
            peer = %self.peer(),
            child = %peer,
            depth = ?departed.depth,
            forwarding = departed.was_forwarding,
            "Downstream removed"
        );
        self.report_viewers();
        self.check_viewer_zero(had_any, now);
    }

    /// Schedule shutdown when a viewer-facing node just lost its last peer
    fn check_viewer_zero(&mut self, had_any: bool, now: Instant) {
        if had_any
            && self.downstream.occupancy() == 0
            && self.depth.is_viewer_facing()
            && !self.is_origin()
            && self.shutdown_timer.is_none()
        {
            let deadline = now + self.config.shutdown_grace;
            self.shutdown_timer = Some(self.timers.schedule(deadline, Timer::Shutdown));
            tracing::info!(peer = %self.peer(), "Last viewer left, shutdown scheduled");
        }
    }

    /// Push the current viewer count upstream if it changed
    fn report_viewers(&mut self) {
        let viewers = self.viewers();
        if self.last_reported == Some(viewers) {
            return;
        }

        if self.is_origin() {
            self.last_reported = Some(viewers);
            tracing::info!(peer = %self.peer(), viewers, "Live viewer total");
            return;
        }

        let Some(link) = self.upstream.as_ref().filter(|u| u.open).map(|u| u.link) else {
            return;
        };
        self.last_reported = Some(viewers);
        self.push_send(link, ControlMessage::Viewers { viewers });
    }

    // ------------------------------------------------------------------
    // Close path
    // ------------------------------------------------------------------

    /// Release registry entries, close every link and stop
    fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.transition(NodeState::Closed);

        if !self.is_origin() {
            if let Err(e) = self.registry.release_self(self.peer()) {
                tracing::warn!(peer = %self.peer(), error = %e, "Failed to release registry entry");
            }
            if let Err(e) = self.registry.reclaim_empty_owners(self.identity.owner) {
                tracing::warn!(peer = %self.peer(), error = %e, "Failed to reclaim owners");
            }
        }

        self.downstream.drain();
        self.tally.clear();
        self.timers.clear();
        self.attach_timer = None;
        self.shutdown_timer = None;
        self.redirects.clear();
        self.upstream = None;
        for conn in self.links.ids() {
            self.close_link(conn);
        }

        if self.init.is_some() {
            if let Err(e) = self.session_log.close(self.log_id, SystemTime::now()) {
                tracing::warn!(peer = %self.peer(), error = %e, "Failed to stamp session end");
            }
        }
        self.push(Action::Shutdown);
    }

    /// Route an unexpected local failure to the close path
    pub fn fail(&mut self, error: CanopyError) {
        tracing::error!(peer = %self.peer(), error = %error, "Fatal failure, closing");
        self.close();
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn transition(&mut self, next: NodeState) {
        if self.state != next {
            tracing::info!(peer = %self.peer(), from = %self.state, to = %next, "State transition");
            self.state = next;
        }
    }

    fn push(&mut self, action: Action) {
        self.actions.push_back(action);
    }

    fn push_send(&mut self, conn: ConnectionId, message: ControlMessage) {
        self.push(Action::Send { conn, message });
    }

    /// Close a link we hold; every close removes the link record
    fn close_link(&mut self, conn: ConnectionId) {
        if self.links.remove(conn).is_some() {
            self.push(Action::Close { conn });
        }
    }
}
