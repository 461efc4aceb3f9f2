//! Async driver - runs one node on a tokio task
//!
//! Signaling commands and link events arrive over an mpsc channel and are
//! multiplexed with the node's next timer deadline. Every action the node
//! emits is executed against a [`PeerTransport`] before the next input is
//! taken, so the node never observes its own actions out of order.

use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use canopy_core::{CanopyError, CanopyResult, PeerId};
use canopy_transport::{ConnectionId, LinkEvent, LinkKind, PeerTransport};
use canopy_wire::{ConnectMetadata, ControlEvent};

use crate::{Action, InitParams, Node, NodeStats};

/// Command channel depth
const COMMAND_BUFFER: usize = 256;

/// Inputs accepted by a running node
#[derive(Debug)]
pub enum NodeCommand {
    Init(InitParams),
    /// A peer opened a link to us; the reply carries its handle
    Inbound {
        peer: PeerId,
        metadata: ConnectMetadata,
        kind: LinkKind,
        reply: oneshot::Sender<ConnectionId>,
    },
    Link {
        conn: ConnectionId,
        event: LinkEvent,
    },
    AddViewer(PeerId),
    RemovePeer(PeerId),
    Broadcast {
        name: String,
        payload: serde_json::Value,
    },
    Kill,
}

/// Cloneable handle for feeding a running node
#[derive(Debug, Clone)]
pub struct NodeHandle {
    tx: mpsc::Sender<NodeCommand>,
}

fn stopped() -> CanopyError {
    CanopyError::FatalLocalFailure("node driver stopped".into())
}

impl NodeHandle {
    async fn submit(&self, command: NodeCommand) -> CanopyResult<()> {
        self.tx.send(command).await.map_err(|_| stopped())
    }

    pub async fn init(&self, init: InitParams) -> CanopyResult<()> {
        self.submit(NodeCommand::Init(init)).await
    }

    /// Hand over an inbound link and wait for the handle the node assigned
    pub async fn inbound(
        &self,
        peer: PeerId,
        metadata: ConnectMetadata,
        kind: LinkKind,
    ) -> CanopyResult<ConnectionId> {
        let (reply, rx) = oneshot::channel();
        self.submit(NodeCommand::Inbound {
            peer,
            metadata,
            kind,
            reply,
        })
        .await?;
        rx.await.map_err(|_| stopped())
    }

    pub async fn link_event(&self, conn: ConnectionId, event: LinkEvent) -> CanopyResult<()> {
        self.submit(NodeCommand::Link { conn, event }).await
    }

    pub async fn add_viewer(&self, peer: PeerId) -> CanopyResult<()> {
        self.submit(NodeCommand::AddViewer(peer)).await
    }

    pub async fn remove_peer(&self, peer: PeerId) -> CanopyResult<()> {
        self.submit(NodeCommand::RemovePeer(peer)).await
    }

    pub async fn broadcast(&self, name: impl Into<String>, payload: serde_json::Value) -> CanopyResult<()> {
        self.submit(NodeCommand::Broadcast {
            name: name.into(),
            payload,
        })
        .await
    }

    pub async fn kill(&self) -> CanopyResult<()> {
        self.submit(NodeCommand::Kill).await
    }
}

/// Owns a node and its transport for the lifetime of the node
pub struct NodeDriver<T> {
    node: Node,
    transport: T,
    commands: mpsc::Receiver<NodeCommand>,
    delivered: mpsc::UnboundedSender<ControlEvent>,
}

impl<T: PeerTransport> NodeDriver<T> {
    /// Returns the driver, a handle to feed it and the stream of delivered
    /// control events
    pub fn new(
        node: Node,
        transport: T,
    ) -> (Self, NodeHandle, mpsc::UnboundedReceiver<ControlEvent>) {
        let (tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (delivered, events) = mpsc::unbounded_channel();
        let driver = NodeDriver {
            node,
            transport,
            commands,
            delivered,
        };
        (driver, NodeHandle { tx }, events)
    }

    /// Run until the node shuts down
    ///
    /// Dropping every [`NodeHandle`] runs the close path.
    pub async fn run(mut self) -> NodeStats {
        tracing::info!(peer = %self.node.peer(), "Node driver started");
        loop {
            if self.flush() {
                break;
            }

            let deadline = self.node.next_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => {
                        tracing::info!(peer = %self.node.peer(), "All handles dropped");
                        self.node.kill();
                    }
                },
                _ = wait_until(deadline) => {
                    self.node.tick(Instant::now());
                }
            }
        }
        tracing::info!(peer = %self.node.peer(), "Node driver stopped");
        self.node.stats().clone()
    }

    fn apply(&mut self, command: NodeCommand) {
        let now = Instant::now();
        match command {
            NodeCommand::Init(init) => self.node.bootstrap(init, now),
            NodeCommand::Inbound {
                peer,
                metadata,
                kind,
                reply,
            } => {
                let conn = self.node.accept(peer, metadata, kind, now);
                if reply.send(conn).is_err() {
                    tracing::debug!(%peer, %conn, "Inbound caller went away");
                }
            }
            NodeCommand::Link { conn, event } => self.node.handle(conn, event, now),
            NodeCommand::AddViewer(peer) => self.node.add_viewer(peer, now),
            NodeCommand::RemovePeer(peer) => self.node.remove_peer(peer, now),
            NodeCommand::Broadcast { name, payload } => {
                self.node.broadcast(&name, payload);
            }
            NodeCommand::Kill => self.node.kill(),
        }
    }

    /// Execute pending actions; returns true once the node has shut down
    ///
    /// A failure on one link is reported back as that link's failure. Fatal
    /// errors and failures tied to no link run the close path.
    fn flush(&mut self) -> bool {
        while let Some(action) = self.node.pop_action() {
            let conn = action.conn();
            match self.execute(action) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => match conn {
                    Some(conn) if !e.is_fatal() => {
                        tracing::warn!(peer = %self.node.peer(), %conn, error = %e, "Transport action failed");
                        self.node
                            .handle(conn, LinkEvent::Failure(e.to_string()), Instant::now());
                    }
                    _ => self.node.fail(e),
                },
            }
        }
        false
    }

    fn execute(&mut self, action: Action) -> CanopyResult<bool> {
        match action {
            Action::Connect {
                conn,
                peer,
                metadata,
            } => self.transport.connect(conn, peer, &metadata)?,
            Action::Call {
                conn,
                peer,
                metadata,
            } => self.transport.call(conn, peer, &metadata)?,
            Action::Answer { conn } => self.transport.answer(conn)?,
            Action::Send { conn, message } => {
                let payload = message.encode().map_err(|e| {
                    CanopyError::FatalLocalFailure(format!("unencodable control message: {}", e))
                })?;
                self.transport.send(conn, payload)?;
            }
            Action::ReplaceTrack { conn, track } => self.transport.replace_track(conn, track)?,
            Action::Close { conn } => self.transport.close(conn),
            Action::Deliver(event) => {
                if self.delivered.send(event).is_err() {
                    tracing::debug!(peer = %self.node.peer(), "No listener for control events");
                }
            }
            Action::Shutdown => return Ok(true),
        }
        Ok(false)
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use parking_lot::Mutex;

    use canopy_core::{Depth, NodeConfig, NodeIdentity, OwnerId, SessionId};
    use canopy_registry::{MemoryRegistry, MemorySessionLog, Registry, RegistryEntry};
    use canopy_transport::TrackKind;

    const ORIGIN: PeerId = PeerId(100);

    #[derive(Debug, Clone, PartialEq)]
    enum Op {
        Connect(ConnectionId, PeerId),
        Call(ConnectionId, PeerId),
        Answer(ConnectionId),
        Send(ConnectionId),
        Replace(ConnectionId),
        Close(ConnectionId),
    }

    #[derive(Clone, Default)]
    struct Recorder {
        ops: Arc<Mutex<Vec<Op>>>,
        refuse_connect: bool,
        broken_send: bool,
    }

    impl Recorder {
        fn ops(&self) -> Vec<Op> {
            self.ops.lock().clone()
        }

        fn connects(&self) -> usize {
            self.ops()
                .iter()
                .filter(|op| matches!(op, Op::Connect(..)))
                .count()
        }

        async fn first_connect(&self) -> ConnectionId {
            loop {
                if let Some(Op::Connect(link, _)) = self.ops().first().cloned() {
                    return link;
                }
                tokio::task::yield_now().await;
            }
        }
    }

    impl PeerTransport for Recorder {
        fn connect(
            &mut self,
            conn: ConnectionId,
            peer: PeerId,
            _metadata: &ConnectMetadata,
        ) -> CanopyResult<()> {
            self.ops.lock().push(Op::Connect(conn, peer));
            if self.refuse_connect {
                return Err(CanopyError::TransportFailure {
                    peer,
                    state: "failed".into(),
                });
            }
            Ok(())
        }

        fn call(
            &mut self,
            conn: ConnectionId,
            peer: PeerId,
            _metadata: &ConnectMetadata,
        ) -> CanopyResult<()> {
            self.ops.lock().push(Op::Call(conn, peer));
            Ok(())
        }

        fn answer(&mut self, conn: ConnectionId) -> CanopyResult<()> {
            self.ops.lock().push(Op::Answer(conn));
            Ok(())
        }

        fn send(&mut self, conn: ConnectionId, _payload: Bytes) -> CanopyResult<()> {
            if self.broken_send {
                return Err(CanopyError::FatalLocalFailure("send queue poisoned".into()));
            }
            self.ops.lock().push(Op::Send(conn));
            Ok(())
        }

        fn replace_track(&mut self, conn: ConnectionId, _track: TrackKind) -> CanopyResult<()> {
            self.ops.lock().push(Op::Replace(conn));
            Ok(())
        }

        fn close(&mut self, conn: ConnectionId) {
            self.ops.lock().push(Op::Close(conn));
        }
    }

    fn node(config: NodeConfig) -> (Node, Arc<MemorySessionLog>) {
        node_with(config, Arc::new(MemoryRegistry::new()))
    }

    fn node_with(config: NodeConfig, registry: Arc<MemoryRegistry>) -> (Node, Arc<MemorySessionLog>) {
        let identity = NodeIdentity::new(PeerId::new(1), SessionId::new(1), OwnerId::new(7));
        let log = Arc::new(MemorySessionLog::new());
        let node = Node::new(identity, config, registry, log.clone());
        (node, log)
    }

    #[tokio::test]
    async fn test_kill_stops_driver() {
        let (node, log) = node(NodeConfig::default());
        let log_id = node.log_id();
        let transport = Recorder::default();
        let (driver, handle, _events) = NodeDriver::new(node, transport.clone());
        let task = tokio::spawn(driver.run());

        handle.init(InitParams::new(ORIGIN)).await.unwrap();
        handle.kill().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        let ops = transport.ops();
        let Op::Connect(link, peer) = ops[0].clone() else {
            panic!("unexpected {:?}", ops);
        };
        assert_eq!(peer, ORIGIN);
        assert!(ops.contains(&Op::Close(link)));
        assert!(log.get(log_id).unwrap().end.is_some());
    }

    #[tokio::test]
    async fn test_dropping_handles_runs_close_path() {
        let (node, _) = node(NodeConfig::default());
        let (driver, handle, _events) = NodeDriver::new(node, Recorder::default());
        let task = tokio::spawn(driver.run());
        drop(handle);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_viewer_zero_shutdown_timer() {
        let config = NodeConfig::default().with_shutdown_grace(Duration::from_millis(20));
        let (node, _) = node(config);
        let transport = Recorder::default();
        let (driver, handle, _events) = NodeDriver::new(node, transport.clone());
        let task = tokio::spawn(driver.run());

        handle.init(InitParams::new(ORIGIN)).await.unwrap();
        handle.add_viewer(PeerId::new(9)).await.unwrap();
        let call = handle
            .inbound(ORIGIN, ConnectMetadata::default(), LinkKind::Call)
            .await
            .unwrap();
        handle
            .link_event(call, LinkEvent::Track(TrackKind::Video))
            .await
            .unwrap();
        handle.remove_peer(PeerId::new(9)).await.unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.admitted, 1);
        assert!(transport.ops().contains(&Op::Answer(call)));
    }

    #[tokio::test]
    async fn test_refused_connect_retried_until_attempts_run_out() {
        let config = NodeConfig::default()
            .with_attach_timeout(Duration::from_millis(10))
            .with_max_attach_attempts(3);
        let (node, log) = node(config);
        let log_id = node.log_id();
        let transport = Recorder {
            refuse_connect: true,
            ..Default::default()
        };
        let (driver, handle, _events) = NodeDriver::new(node, transport.clone());
        let task = tokio::spawn(driver.run());

        handle.init(InitParams::new(ORIGIN)).await.unwrap();

        // The driver stops on its own once the node gives up.
        let stats = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.attach_timeouts, 3);
        assert_eq!(stats.placements, 3);
        assert_eq!(transport.connects(), 3);
        assert!(log.get(log_id).unwrap().end.is_some());
    }

    #[tokio::test]
    async fn test_local_failure_runs_close_path() {
        let registry = Arc::new(MemoryRegistry::new());
        let relay = PeerId::new(50);
        registry
            .register(RegistryEntry::new(relay, OwnerId::new(7), Depth::new(2).unwrap()))
            .unwrap();
        let (node, log) = node_with(NodeConfig::default(), registry.clone());
        let log_id = node.log_id();
        let transport = Recorder {
            broken_send: true,
            ..Default::default()
        };
        let (driver, handle, _events) = NodeDriver::new(node, transport.clone());
        let task = tokio::spawn(driver.run());

        handle.init(InitParams::new(ORIGIN)).await.unwrap();
        let link = transport.first_connect().await;
        assert_eq!(registry.parents_of(PeerId::new(1)), vec![relay]);

        // Opening sends the first viewer report, which fails locally.
        handle.link_event(link, LinkEvent::Open).await.unwrap();

        // `run` only returns once the node has emitted `Shutdown`.
        let stats = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.placements, 1);
        assert!(registry.parents_of(PeerId::new(1)).is_empty());
        assert!(transport.ops().contains(&Op::Close(link)));
        assert!(log.get(log_id).unwrap().end.is_some());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_open_links() {
        let (node, _) = node(NodeConfig::default());
        let transport = Recorder::default();
        let (driver, handle, _events) = NodeDriver::new(node, transport.clone());
        let task = tokio::spawn(driver.run());

        handle
            .init(InitParams::new(ORIGIN).with_depth(Depth::VIEWER))
            .await
            .unwrap();
        let link = transport.first_connect().await;
        handle.link_event(link, LinkEvent::Open).await.unwrap();
        handle
            .broadcast("device-change", serde_json::json!({}))
            .await
            .unwrap();
        handle.kill().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        // Viewer report on open, then the broadcast.
        let sends = transport
            .ops()
            .iter()
            .filter(|op| **op == Op::Send(link))
            .count();
        assert_eq!(sends, 2);
    }
}
