//! # Connection Manager
//!
//! Owns every [`PeerConnection`] of the node: accepts inbound streams, dials
//! outbound ones, keeps an index from stable peer address to connection,
//! and fans connection events out to registered listeners as
//! [`NetworkEvent`]s.
//!
//! Background tasks started by [`ConnectionManager::start`]:
//!
//! ```text
//! accept loop   TcpListener -> PeerConnection
//! event loop    ConnectionEvent -> NetworkEvent (ping replies, bookkeeping)
//! keep-alive    ping connections that have been idle for a full interval
//! ```
//!
//! When the last connection goes away the manager emits
//! [`NetworkEvent::AllConnectionsLost`] and starts a bounded series of
//! reconnect attempts to the seed nodes. The first connection after that
//! emits [`NetworkEvent::Reconnected`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::connection::{
    CloseReason, ConnectionEvent, ConnectionId, Direction, PeerConnection, PeerType,
};
use super::error::NetworkError;
use super::message::{Message, NodeAddress};
use super::PeerMessenger;
use crate::config::NetworkConfig;

const LISTENER_CAPACITY: usize = 1024;
const CONNECTION_EVENT_CAPACITY: usize = 4096;

pub type ListenerId = u64;

/// What the network layer tells the rest of the node.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    ConnectionEstablished {
        connection_id: ConnectionId,
        peer: Option<NodeAddress>,
        direction: Direction,
    },
    MessageReceived {
        connection_id: ConnectionId,
        peer: Option<NodeAddress>,
        message: Message,
    },
    ConnectionLost {
        connection_id: ConnectionId,
        peer: Option<NodeAddress>,
        reason: CloseReason,
    },
    AllConnectionsLost,
    Reconnected,
}

pub struct ConnectionManager {
    own_address: RwLock<NodeAddress>,
    config: Arc<NetworkConfig>,
    seed_nodes: Vec<NodeAddress>,
    connections: DashMap<ConnectionId, Arc<PeerConnection>>,
    by_address: DashMap<NodeAddress, ConnectionId>,
    listeners: Mutex<Vec<(ListenerId, mpsc::Sender<NetworkEvent>)>>,
    next_listener_id: AtomicU64,
    events_tx: mpsc::Sender<ConnectionEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ConnectionEvent>>>,
    all_lost: AtomicBool,
    reconnecting: AtomicBool,
    messages_sent: AtomicU64,
    shutting_down: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        own_address: NodeAddress,
        config: NetworkConfig,
        seed_nodes: Vec<NodeAddress>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(CONNECTION_EVENT_CAPACITY);
        Arc::new(Self {
            own_address: RwLock::new(own_address),
            config: Arc::new(config),
            seed_nodes,
            connections: DashMap::new(),
            by_address: DashMap::new(),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            all_lost: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            messages_sent: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Bind the listener, start the background tasks and dial the seed
    /// nodes. Returns the bound socket address. If the configured own
    /// address has port 0 it is updated to the bound port.
    pub async fn start(self: &Arc<Self>, bind: SocketAddr) -> Result<SocketAddr, NetworkError> {
        let listener = TcpListener::bind(bind).await?;
        let local = listener.local_addr()?;
        {
            let mut own = self.own_address.write();
            if own.port == 0 {
                own.port = local.port();
            }
        }
        info!(%local, own = %self.own_address(), "p2p listener bound");

        let events_rx = self
            .events_rx
            .lock()
            .take()
            .ok_or(NetworkError::ShuttingDown)?;

        let mut tasks = Vec::with_capacity(3);
        tasks.push(tokio::spawn(self.clone().accept_loop(listener)));
        tasks.push(tokio::spawn(self.clone().event_loop(events_rx)));
        tasks.push(tokio::spawn(self.clone().keep_alive_loop()));
        self.tasks.lock().extend(tasks);

        for seed in self.seed_nodes.iter().filter(|s| **s != self.own_address()) {
            if let Err(e) = self.connect(seed).await {
                warn!(seed = %seed, error = %e, "seed node unreachable");
            }
        }
        Ok(local)
    }

    pub fn own_address(&self) -> NodeAddress {
        self.own_address.read().clone()
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------------

    pub fn add_listener(&self) -> (ListenerId, mpsc::Receiver<NetworkEvent>) {
        let (tx, rx) = mpsc::channel(LISTENER_CAPACITY);
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, tx));
        (id, rx)
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners.lock().retain(|(lid, _)| *lid != id);
    }

    async fn notify(&self, event: NetworkEvent) {
        let listeners: Vec<_> = self.listeners.lock().clone();
        for (id, tx) in listeners {
            if tx.send(event.clone()).await.is_err() {
                debug!(listener = id, "listener gone, removing");
                self.remove_listener(id);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Application messages sent since start, keep-alive traffic excluded.
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn connections(&self) -> Vec<Arc<PeerConnection>> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }

    pub fn connection_to(&self, peer: &NodeAddress) -> Option<Arc<PeerConnection>> {
        let id = self.by_address.get(peer)?.value().clone();
        let connection = self.connections.get(&id)?.value().clone();
        (!connection.is_stopped()).then_some(connection)
    }

    /// Dial `peer` and register the connection.
    pub async fn connect(&self, peer: &NodeAddress) -> Result<Arc<PeerConnection>, NetworkError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(NetworkError::ShuttingDown);
        }
        let stream = timeout(
            self.config.connect_timeout(),
            TcpStream::connect((peer.host.as_str(), peer.port)),
        )
        .await
        .map_err(|_| NetworkError::ConnectTimeout { peer: peer.clone() })?
        .map_err(|e| NetworkError::PeerUnreachable {
            peer: peer.clone(),
            reason: e.to_string(),
        })?;

        let connection = self.register(stream, Direction::Outbound, Some(peer.clone()))?;
        info!(peer = %peer, connection = %connection.id(), "outbound connection");
        Ok(connection)
    }

    fn register(
        &self,
        stream: TcpStream,
        direction: Direction,
        peer: Option<NodeAddress>,
    ) -> Result<Arc<PeerConnection>, NetworkError> {
        let (connection, reader) = PeerConnection::open(
            stream,
            direction,
            peer.clone(),
            self.config.clone(),
            self.events_tx.clone(),
        )?;
        if let Some(peer) = peer {
            if self.seed_nodes.contains(&peer) {
                connection.set_peer_type(PeerType::SeedNode);
            }
            self.by_address.insert(peer, connection.id().to_string());
        }
        self.connections
            .insert(connection.id().to_string(), connection.clone());
        connection.start(reader);
        Ok(connection)
    }

    /// Send to a peer, reusing a live connection or dialing a new one.
    pub async fn send_to(&self, peer: &NodeAddress, message: Message) -> Result<(), NetworkError> {
        let connection = match self.connection_to(peer) {
            Some(connection) => connection,
            None => self.connect(peer).await?,
        };
        connection.send(message).await?;
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Send to every live connection. Returns how many sends succeeded.
    pub async fn broadcast_message(&self, message: Message) -> usize {
        let sends = self
            .connections()
            .into_iter()
            .filter(|c| !c.is_stopped())
            .map(|c| {
                let message = message.clone();
                async move { c.send(message).await.is_ok() }
            });
        let sent = futures::future::join_all(sends)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();
        self.messages_sent.fetch_add(sent as u64, Ordering::Relaxed);
        sent
    }

    /// Close every connection with a close notice and stop the background
    /// tasks.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(connections = self.connection_count(), "network layer shutting down");
        let closes = self
            .connections()
            .into_iter()
            .map(|c| async move { c.shutdown(CloseReason::AppShutdown).await });
        futures::future::join_all(closes).await;

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.connections.clear();
        self.by_address.clear();
    }

    // -----------------------------------------------------------------------
    // Background tasks
    // -----------------------------------------------------------------------

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    if self.shutting_down.load(Ordering::SeqCst) {
                        return;
                    }
                    match self.register(stream, Direction::Inbound, None) {
                        Ok(connection) => {
                            debug!(%addr, connection = %connection.id(), "inbound connection")
                        }
                        Err(e) => warn!(%addr, error = %e, "failed to set up inbound connection"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn event_loop(self: Arc<Self>, mut events: mpsc::Receiver<ConnectionEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Opened { connection_id } => {
                    let Some(connection) = self.connections.get(&connection_id).map(|c| c.value().clone())
                    else {
                        continue;
                    };
                    self.notify(NetworkEvent::ConnectionEstablished {
                        connection_id,
                        peer: connection.peer_address(),
                        direction: connection.direction(),
                    })
                    .await;
                    if self.all_lost.swap(false, Ordering::SeqCst) {
                        info!("connectivity restored");
                        self.notify(NetworkEvent::Reconnected).await;
                    }
                }
                ConnectionEvent::AddressBound {
                    connection_id,
                    address,
                } => {
                    if let Some(connection) = self.connections.get(&connection_id) {
                        if self.seed_nodes.contains(&address) {
                            connection.set_peer_type(PeerType::SeedNode);
                        }
                    }
                    self.by_address.insert(address, connection_id);
                }
                ConnectionEvent::Message {
                    connection_id,
                    peer,
                    message,
                } => {
                    if let Message::Ping { nonce } = &message {
                        self.reply_pong(&connection_id, *nonce);
                    }
                    self.notify(NetworkEvent::MessageReceived {
                        connection_id,
                        peer,
                        message,
                    })
                    .await;
                }
                ConnectionEvent::Closed {
                    connection_id,
                    peer,
                    reason,
                } => {
                    self.connections.remove(&connection_id);
                    if let Some(peer) = &peer {
                        self.by_address
                            .remove_if(peer, |_, id| *id == connection_id);
                    }
                    info!(connection = %connection_id, ?peer, %reason, "connection lost");
                    self.notify(NetworkEvent::ConnectionLost {
                        connection_id,
                        peer,
                        reason,
                    })
                    .await;

                    if self.connections.is_empty() && !self.shutting_down.load(Ordering::SeqCst) {
                        warn!("all connections lost");
                        self.all_lost.store(true, Ordering::SeqCst);
                        self.notify(NetworkEvent::AllConnectionsLost).await;
                        self.spawn_reconnect();
                    }
                }
            }
        }
    }

    fn reply_pong(&self, connection_id: &str, nonce: u64) {
        if let Some(connection) = self.connections.get(connection_id).map(|c| c.value().clone()) {
            tokio::spawn(async move {
                if let Err(e) = connection.send(Message::Pong { nonce }).await {
                    debug!(connection = %connection.id(), error = %e, "pong not sent");
                }
            });
        }
    }

    async fn keep_alive_loop(self: Arc<Self>) {
        let interval = self.config.keep_alive_interval();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let now = Instant::now();
            for connection in self.connections() {
                let idle = now.saturating_duration_since(connection.statistics().last_activity);
                if idle >= interval && !connection.is_stopped() {
                    let nonce = rand::random();
                    if let Err(e) = connection.send(Message::Ping { nonce }).await {
                        debug!(connection = %connection.id(), error = %e, "keep-alive ping failed");
                    }
                }
            }
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        if self.seed_nodes.is_empty() || self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            manager.reconnect().await;
            manager.reconnecting.store(false, Ordering::SeqCst);
        });
        self.tasks.lock().push(handle);
    }

    async fn reconnect(&self) {
        let own = self.own_address();
        for attempt in 1..=self.config.max_reconnect_attempts {
            tokio::time::sleep(self.config.reconnect_delay()).await;
            if self.shutting_down.load(Ordering::SeqCst) || !self.connections.is_empty() {
                return;
            }
            info!(attempt, "reconnecting to seed nodes");
            for seed in self.seed_nodes.iter().filter(|s| **s != own) {
                match self.connect(seed).await {
                    Ok(_) => return,
                    Err(e) => debug!(seed = %seed, attempt, error = %e, "reconnect failed"),
                }
            }
        }
        warn!(
            attempts = self.config.max_reconnect_attempts,
            "giving up on seed nodes, waiting for inbound connections"
        );
    }
}

#[async_trait]
impl PeerMessenger for ConnectionManager {
    fn own_address(&self) -> NodeAddress {
        ConnectionManager::own_address(self)
    }

    async fn send_direct(&self, peer: &NodeAddress, message: Message) -> Result<(), NetworkError> {
        self.send_to(peer, message).await
    }

    async fn broadcast(&self, message: Message) -> Result<usize, NetworkError> {
        match self.broadcast_message(message).await {
            0 => Err(NetworkError::NoPeers),
            n => Ok(n),
        }
    }
}
