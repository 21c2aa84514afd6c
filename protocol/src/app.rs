//! # Application Context
//!
//! One task owns the node's state machines and processes everything that
//! can change them, one event at a time:
//!
//! ```text
//!   network listener ──┐
//!   offer timers ──────┤
//!   trade timers ──────┼──▶ Application::run ──▶ OpenOfferManager
//!   wallet events ─────┤                     ──▶ TradeManager
//!   AppHandle commands ┘                     ──▶ OfferBook
//! ```
//!
//! [`AppHandle`] is the only way in from outside. Its methods send a command
//! and wait for the reply with a timeout. Read-only queries go straight to
//! the managers, which hand out snapshots.
//!
//! Shutdown stops the trade manager first, then the offer manager (which
//! withdraws its offers from the overlay while peers are still connected),
//! then the network.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::config::{NetworkConfig, OfferConfig, TradeConfig, COMMAND_TIMEOUT};
use crate::crypto::{NodeKeypair, NodePublicKey};
use crate::events::{OfferEvent, TradeEvent};
use crate::network::{
    CloseReason, ConnectionManager, Direction, ListenerId, Message, NetworkError, NetworkEvent,
    NodeAddress,
};
use crate::offer::{
    BroadcastOverlay, Offer, OfferBook, OfferError, OfferTimerEvent, OpenOffer, OpenOfferManager,
    PlaceOfferRequest,
};
use crate::payment::PaymentAccount;
use crate::storage::PersistenceStore;
use crate::trade::{await_answer, Trade, TradeError, TradeId, TradeManager, TradeTimerEvent};
use crate::wallet::{WalletEvent, WalletService};

const COMMAND_CAPACITY: usize = 64;
const APP_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Offer(#[from] OfferError),

    #[error(transparent)]
    Trade(#[from] TradeError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("application is stopped")]
    Stopped,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Socket the P2P listener binds to.
    pub listen_addr: SocketAddr,
    /// Address peers should use for us. A port of 0 is replaced by the
    /// bound port.
    pub advertised_address: NodeAddress,
    pub seed_nodes: Vec<NodeAddress>,
    pub network: NetworkConfig,
    pub offers: OfferConfig,
    pub trades: TradeConfig,
    pub command_timeout: Duration,
}

impl AppConfig {
    pub fn new(listen_addr: SocketAddr, advertised_address: NodeAddress) -> Self {
        Self {
            listen_addr,
            advertised_address,
            seed_nodes: Vec::new(),
            network: NetworkConfig::default(),
            offers: OfferConfig::default(),
            trades: TradeConfig::default(),
            command_timeout: COMMAND_TIMEOUT,
        }
    }
}

/// Everything the node reports to observers such as the metrics exporter.
#[derive(Debug, Clone)]
pub enum AppEvent {
    PeerConnected {
        peer: Option<NodeAddress>,
        direction: Direction,
    },
    PeerDisconnected {
        peer: Option<NodeAddress>,
        reason: CloseReason,
    },
    MessageReceived {
        kind: &'static str,
    },
    Offer(OfferEvent),
    Trade(TradeEvent),
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    PlaceOffer {
        request: PlaceOfferRequest,
        reply: Reply<Result<Offer, OfferError>>,
    },
    RemoveOffer {
        offer_id: String,
        reply: Reply<Result<(), OfferError>>,
    },
    TakeOffer {
        offer_id: String,
        amount: u64,
        payment_account: PaymentAccount,
        reply: Reply<Result<TradeId, TradeError>>,
    },
    CancelTake {
        offer_id: String,
        reply: Reply<bool>,
    },
    CheckAvailability {
        offer_id: String,
        reply: Reply<Result<bool, TradeError>>,
    },
    PaymentStarted {
        trade_id: TradeId,
        reply: Reply<Result<(), TradeError>>,
    },
    PaymentReceived {
        trade_id: TradeId,
        reply: Reply<Result<(), TradeError>>,
    },
    Withdraw {
        trade_id: TradeId,
        reply: Reply<Result<(), TradeError>>,
    },
    OpenDispute {
        trade_id: TradeId,
        reason: String,
        reply: Reply<Result<(), TradeError>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

pub struct Application {
    config: AppConfig,
    own_key: NodePublicKey,
    network: Arc<ConnectionManager>,
    offers: Arc<OpenOfferManager>,
    trades: Arc<TradeManager>,
    book: Arc<OfferBook>,
    offer_timers: mpsc::UnboundedReceiver<OfferTimerEvent>,
    trade_timers: mpsc::UnboundedReceiver<TradeTimerEvent>,
    wallet_events: mpsc::UnboundedReceiver<WalletEvent>,
    events: broadcast::Sender<AppEvent>,
}

impl Application {
    /// Wire up the managers and restore persisted offers and trades.
    /// Nothing touches the network until [`Application::start`].
    pub fn new(
        config: AppConfig,
        keypair: NodeKeypair,
        wallet: Arc<dyn WalletService>,
        wallet_events: mpsc::UnboundedReceiver<WalletEvent>,
        store: Arc<dyn PersistenceStore>,
    ) -> Result<Self, AppError> {
        let network = ConnectionManager::new(
            config.advertised_address.clone(),
            config.network.clone(),
            config.seed_nodes.clone(),
        );
        let overlay = Arc::new(BroadcastOverlay::new(network.clone()));

        let (offers, offer_timers) = OpenOfferManager::new(
            keypair.clone(),
            network.clone(),
            overlay,
            wallet.clone(),
            store.clone(),
            config.offers.clone(),
            config.trades.tx_fee,
        );
        let offers = Arc::new(offers);
        let book = Arc::new(OfferBook::new(config.offers.ttl(), offers.event_sender()));

        let (trades, trade_timers) = TradeManager::new(
            keypair.clone(),
            network.clone(),
            wallet,
            store,
            offers.clone(),
            book.clone(),
            config.trades.clone(),
        );

        offers.load()?;
        trades.load()?;

        Ok(Self {
            own_key: keypair.public_key(),
            config,
            network,
            offers,
            trades: Arc::new(trades),
            book,
            offer_timers,
            trade_timers,
            wallet_events,
            events: broadcast::channel(APP_EVENT_CAPACITY).0,
        })
    }

    /// Bind the listener, dial the seeds and spawn the event loop.
    pub async fn start(self) -> Result<(AppHandle, JoinHandle<()>), AppError> {
        let bound = self.network.start(self.config.listen_addr).await?;
        let (listener_id, network_events) = self.network.add_listener();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);

        let handle = AppHandle {
            commands: commands_tx,
            network: self.network.clone(),
            offers: self.offers.clone(),
            trades: self.trades.clone(),
            book: self.book.clone(),
            events: self.events.clone(),
            timeout: self.config.command_timeout,
        };

        self.offers.start();
        info!(%bound, address = %self.network.own_address(), "application started");
        let task = tokio::spawn(self.run(listener_id, network_events, commands_rx));
        Ok((handle, task))
    }

    async fn run(
        mut self,
        listener_id: ListenerId,
        mut network_events: mpsc::Receiver<NetworkEvent>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        let mut offer_events = self.offers.subscribe();
        let mut trade_events = self.trades.subscribe();
        let mut expiry = tokio::time::interval(
            (self.config.offers.ttl() / 4).max(Duration::from_millis(100)),
        );
        expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown(listener_id).await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown(listener_id).await;
                        break;
                    }
                },
                Some(event) = network_events.recv() => self.dispatch(event).await,
                Some(event) = self.offer_timers.recv() => self.offers.handle_timer(event).await,
                Some(event) = self.trade_timers.recv() => self.trades.handle_timer(event),
                Some(event) = self.wallet_events.recv() => self.trades.handle_wallet_event(event),
                Ok(event) = offer_events.recv() => {
                    let _ = self.events.send(AppEvent::Offer(event));
                }
                Ok(event) = trade_events.recv() => {
                    let _ = self.events.send(AppEvent::Trade(event));
                }
                _ = expiry.tick() => {
                    let expired = self.book.expire(Instant::now());
                    if !expired.is_empty() {
                        debug!(count = expired.len(), "book entries expired");
                    }
                }
            }
        }
        info!("application stopped");
    }

    async fn handle_command(&self, command: Command) {
        match command {
            Command::PlaceOffer { request, reply } => {
                let _ = reply.send(self.offers.place_offer(request).await);
            }
            Command::RemoveOffer { offer_id, reply } => {
                let result = self.offers.remove_open_offer(&offer_id).await;
                if result.is_ok() && self.trades.cancel_availability_check(&offer_id) {
                    debug!(%offer_id, "availability check canceled with the offer");
                }
                let _ = reply.send(result);
            }
            Command::TakeOffer {
                offer_id,
                amount,
                payment_account,
                reply,
            } => {
                // Replies once the maker answered, from `dispatch`.
                self.trades
                    .take_offer(&offer_id, amount, payment_account, reply)
                    .await;
            }
            Command::CancelTake { offer_id, reply } => {
                let _ = reply.send(self.trades.cancel_availability_check(&offer_id));
            }
            Command::CheckAvailability { offer_id, reply } => {
                self.trades.check_availability(&offer_id, reply).await;
            }
            Command::PaymentStarted { trade_id, reply } => {
                let _ = reply.send(self.trades.payment_started(&trade_id).await);
            }
            Command::PaymentReceived { trade_id, reply } => {
                let _ = reply.send(self.trades.payment_received(&trade_id).await);
            }
            Command::Withdraw { trade_id, reply } => {
                let _ = reply.send(self.trades.withdraw_to_savings(&trade_id));
            }
            Command::OpenDispute {
                trade_id,
                reason,
                reply,
            } => {
                let _ = reply.send(self.trades.open_dispute(&trade_id, reason).await);
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn dispatch(&self, event: NetworkEvent) {
        match event {
            NetworkEvent::MessageReceived { peer, message, .. } => {
                let kind = message.type_name();
                trace!(kind, peer = ?peer, "dispatching");
                let _ = self.events.send(AppEvent::MessageReceived { kind });
                self.dispatch_message(message).await;
            }
            NetworkEvent::ConnectionEstablished {
                peer, direction, ..
            } => {
                let _ = self.events.send(AppEvent::PeerConnected { peer, direction });
            }
            NetworkEvent::ConnectionLost { peer, reason, .. } => {
                let _ = self
                    .events
                    .send(AppEvent::PeerDisconnected { peer, reason });
            }
            NetworkEvent::AllConnectionsLost => self.offers.on_all_connections_lost(),
            NetworkEvent::Reconnected => self.offers.on_reconnected(),
        }
    }

    async fn dispatch_message(&self, message: Message) {
        match message {
            Message::OfferAvailabilityRequest(request) => {
                self.offers.handle_availability_request(request).await
            }
            Message::OfferAvailabilityResponse(response) => {
                self.trades.handle_availability_response(response).await
            }
            Message::AddOffer(add) => {
                if add.offer.maker_pub_key() != &self.own_key {
                    self.book.handle_add(add, Instant::now());
                }
            }
            Message::RefreshOffer(refresh) => {
                self.book.handle_refresh(&refresh, Instant::now());
            }
            Message::RemoveOffer(remove) => {
                self.book.handle_remove(&remove);
            }
            Message::Trade(message) => self.trades.handle_trade_message(message).await,
            // Liveness and close notices stay inside the network layer.
            Message::Ping { .. } | Message::Pong { .. } | Message::CloseConnection { .. } => {}
        }
    }

    async fn shutdown(&self, listener_id: ListenerId) {
        info!("application shutting down");
        self.trades.shutdown();
        self.offers.shutdown().await;
        self.network.remove_listener(listener_id);
        self.network.shutdown().await;
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable entry point into a running [`Application`].
#[derive(Clone)]
pub struct AppHandle {
    commands: mpsc::Sender<Command>,
    network: Arc<ConnectionManager>,
    offers: Arc<OpenOfferManager>,
    trades: Arc<TradeManager>,
    book: Arc<OfferBook>,
    events: broadcast::Sender<AppEvent>,
    timeout: Duration,
}

impl AppHandle {
    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, AppError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| AppError::Stopped)?;
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(AppError::Stopped),
            Err(_) => Err(AppError::Timeout(self.timeout)),
        }
    }

    pub async fn place_offer(&self, request: PlaceOfferRequest) -> Result<Offer, AppError> {
        Ok(self
            .call(|reply| Command::PlaceOffer { request, reply })
            .await??)
    }

    pub async fn remove_offer(&self, offer_id: &str) -> Result<(), AppError> {
        let offer_id = offer_id.to_string();
        Ok(self
            .call(|reply| Command::RemoveOffer { offer_id, reply })
            .await??)
    }

    /// Take an offer from the book. Resolves once the maker confirmed
    /// availability and the trade is under way.
    pub async fn take_offer(
        &self,
        offer_id: &str,
        amount: u64,
        payment_account: PaymentAccount,
    ) -> Result<TradeId, AppError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::TakeOffer {
                offer_id: offer_id.to_string(),
                amount,
                payment_account,
                reply,
            })
            .await
            .map_err(|_| AppError::Stopped)?;
        match tokio::time::timeout(self.timeout, await_answer(rx)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(AppError::Timeout(self.timeout)),
        }
    }

    /// Abandon a pending take. The waiting `take_offer` call fails with
    /// [`TradeError::Canceled`].
    pub async fn cancel_take(&self, offer_id: &str) -> Result<bool, AppError> {
        let offer_id = offer_id.to_string();
        self.call(|reply| Command::CancelTake { offer_id, reply })
            .await
    }

    pub async fn check_availability(&self, offer_id: &str) -> Result<bool, AppError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::CheckAvailability {
                offer_id: offer_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| AppError::Stopped)?;
        match tokio::time::timeout(self.timeout, await_answer(rx)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(AppError::Timeout(self.timeout)),
        }
    }

    pub async fn payment_started(&self, trade_id: &str) -> Result<(), AppError> {
        let trade_id = trade_id.to_string();
        Ok(self
            .call(|reply| Command::PaymentStarted { trade_id, reply })
            .await??)
    }

    pub async fn payment_received(&self, trade_id: &str) -> Result<(), AppError> {
        let trade_id = trade_id.to_string();
        Ok(self
            .call(|reply| Command::PaymentReceived { trade_id, reply })
            .await??)
    }

    pub async fn withdraw(&self, trade_id: &str) -> Result<(), AppError> {
        let trade_id = trade_id.to_string();
        Ok(self
            .call(|reply| Command::Withdraw { trade_id, reply })
            .await??)
    }

    pub async fn open_dispute(&self, trade_id: &str, reason: &str) -> Result<(), AppError> {
        let trade_id = trade_id.to_string();
        let reason = reason.to_string();
        Ok(self
            .call(|reply| Command::OpenDispute {
                trade_id,
                reason,
                reply,
            })
            .await??)
    }

    /// Stop the application and wait until it has shut down.
    pub async fn shutdown(&self) -> Result<(), AppError> {
        match self.call(|reply| Command::Shutdown { reply }).await {
            Ok(()) | Err(AppError::Stopped) => Ok(()),
            Err(e) => {
                warn!(error = %e, "shutdown did not complete");
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.events.subscribe()
    }

    pub fn own_address(&self) -> NodeAddress {
        self.network.own_address()
    }

    pub fn connection_count(&self) -> usize {
        self.network.connection_count()
    }

    pub fn messages_sent(&self) -> u64 {
        self.network.messages_sent()
    }

    pub fn open_offers(&self) -> Vec<OpenOffer> {
        self.offers.open_offers()
    }

    pub fn book_offers(&self) -> Vec<Offer> {
        self.book.offers()
    }

    pub fn book_offer(&self, offer_id: &str) -> Option<Offer> {
        self.book.get(offer_id)
    }

    pub fn trade(&self, trade_id: &str) -> Option<Trade> {
        self.trades.trade(trade_id)
    }

    pub fn pending_trades(&self) -> Vec<Trade> {
        self.trades.pending_trades()
    }

    pub fn closed_trades(&self) -> Vec<Trade> {
        self.trades.closed_trades()
    }

    pub fn failed_trades(&self) -> Vec<Trade> {
        self.trades.failed_trades()
    }
}
