//! # Trade Manager
//!
//! Drives trades from the availability check to the withdrawal, for all
//! four roles.
//!
//! ## Collections
//!
//! | Set                 | Contents                                        |
//! |---------------------|-------------------------------------------------|
//! | `open_offer_trades` | maker trades whose deposit has not been seen    |
//! | `pending`           | trades under way (takers enter here directly)   |
//! | `closed`            | completed trades                                |
//! | `failed`            | trades that ended in an error                   |
//!
//! A maker trade moves from `open_offer_trades` to `pending` when the
//! taker reports the deposit, and the open offer is closed at the same
//! time. Completed trades move to `closed` once the funds are withdrawn.
//! Any error while executing the protocol moves the trade to `failed` and
//! leaves the record there.
//!
//! ## Concurrency
//!
//! All handlers run on the application context, one at a time. The state
//! lock is only held between awaits, never across one.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::availability::{AvailabilityCheck, AvailabilityChecks, AvailabilityPurpose};
use super::error::TradeError;
use super::funds::funds_needed_for_trade;
use super::protocol::{ExpectedMessage, TradeProtocol};
use super::role::RoleBehavior;
use super::types::{DisputeState, LifeCycleState, ProcessState, Trade, TradeId, TradeRole};
use crate::config::TradeConfig;
use crate::crypto::NodeKeypair;
use crate::events::TradeEvent;
use crate::network::{
    Message, NodeAddress, OfferAvailabilityRequest, OfferAvailabilityResponse, PeerMessenger,
    TradeMessage, TradePayload,
};
use crate::offer::{Offer, OfferBook, OfferId, OfferState, OpenOfferManager, OpenOfferState};
use crate::payment::PaymentAccount;
use crate::storage::store::{CLOSED_TRADES, FAILED_TRADES, OPEN_OFFER_TRADES, PENDING_TRADES};
use crate::storage::{load_collection, save_collection, PersistenceStore};
use crate::timer::Timer;
use crate::wallet::{AddressContext, WalletEvent, WalletService};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TradeTimerEvent {
    AvailabilityTimeout { offer_id: OfferId, uid: String },
}

#[derive(Default)]
struct TradeState {
    open_offer_trades: BTreeMap<TradeId, Trade>,
    pending: BTreeMap<TradeId, Trade>,
    closed: Vec<Trade>,
    failed: Vec<Trade>,
    protocols: HashMap<TradeId, TradeProtocol>,
    checks: AvailabilityChecks,
    stopped: bool,
}

impl TradeState {
    fn active(&self, trade_id: &str) -> Option<&Trade> {
        self.pending
            .get(trade_id)
            .or_else(|| self.open_offer_trades.get(trade_id))
    }

    fn active_mut(&mut self, trade_id: &str) -> Option<&mut Trade> {
        if self.pending.contains_key(trade_id) {
            self.pending.get_mut(trade_id)
        } else {
            self.open_offer_trades.get_mut(trade_id)
        }
    }

    fn knows(&self, trade_id: &str) -> bool {
        self.active(trade_id).is_some()
            || self.closed.iter().any(|t| t.id() == trade_id)
            || self.failed.iter().any(|t| t.id() == trade_id)
    }

    fn behavior(&self, trade_id: &str) -> Result<&'static dyn RoleBehavior, TradeError> {
        self.protocols
            .get(trade_id)
            .map(TradeProtocol::behavior)
            .ok_or_else(|| TradeError::NotFound(trade_id.to_string()))
    }
}

pub struct TradeManager {
    keypair: NodeKeypair,
    messenger: Arc<dyn PeerMessenger>,
    wallet: Arc<dyn WalletService>,
    store: Arc<dyn PersistenceStore>,
    offers: Arc<OpenOfferManager>,
    book: Arc<OfferBook>,
    config: TradeConfig,
    timer_tx: mpsc::UnboundedSender<TradeTimerEvent>,
    events: broadcast::Sender<TradeEvent>,
    state: Mutex<TradeState>,
}

impl TradeManager {
    pub fn new(
        keypair: NodeKeypair,
        messenger: Arc<dyn PeerMessenger>,
        wallet: Arc<dyn WalletService>,
        store: Arc<dyn PersistenceStore>,
        offers: Arc<OpenOfferManager>,
        book: Arc<OfferBook>,
        config: TradeConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TradeTimerEvent>) {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let manager = Self {
            keypair,
            messenger,
            wallet,
            store,
            offers,
            book,
            config,
            timer_tx,
            events: crate::events::trade_channel(),
            state: Mutex::new(TradeState::default()),
        };
        (manager, timer_rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TradeEvent> {
        self.events.subscribe()
    }

    /// Restore all trade collections from the store and resume watching
    /// deposits that have not confirmed yet.
    pub fn load(&self) -> Result<usize, TradeError> {
        let store = self.store.as_ref();
        let open: Vec<Trade> = load_collection(store, OPEN_OFFER_TRADES)?;
        let pending: Vec<Trade> = load_collection(store, PENDING_TRADES)?;
        let closed: Vec<Trade> = load_collection(store, CLOSED_TRADES)?;
        let failed: Vec<Trade> = load_collection(store, FAILED_TRADES)?;

        let mut watch = Vec::new();
        let active = {
            let mut st = self.state.lock();
            for trade in open.into_iter().chain(pending) {
                let id = trade.id().to_string();
                if trade.is_protocol_active() {
                    st.protocols.insert(id.clone(), TradeProtocol::resume(&trade));
                }
                if trade.process_state() == ProcessState::DepositPublished {
                    if let Some(tx_id) = &trade.deposit_tx_id {
                        watch.push((id.clone(), tx_id.clone()));
                    }
                }
                if trade.life_cycle_state() == LifeCycleState::OfferReserved {
                    st.open_offer_trades.insert(id, trade);
                } else {
                    st.pending.insert(id, trade);
                }
            }
            st.closed = closed;
            st.failed = failed;
            st.open_offer_trades.len() + st.pending.len()
        };

        for (trade_id, tx_id) in watch {
            self.wallet.watch_deposit(&trade_id, &tx_id);
        }
        info!(active, "trades loaded");
        Ok(active)
    }

    // -----------------------------------------------------------------------
    // Taker: availability and take-offer
    // -----------------------------------------------------------------------

    /// Everything that can be checked locally before a taker commits to
    /// anything. Nothing is sent or reserved if this fails.
    pub fn validate_take(
        &self,
        offer_id: &str,
        amount: u64,
        payment_account: &PaymentAccount,
    ) -> Result<Offer, TradeError> {
        {
            let st = self.state.lock();
            if st.stopped {
                return Err(TradeError::ShutDown);
            }
            if st.knows(offer_id) {
                return Err(TradeError::AlreadyExists(offer_id.to_string()));
            }
        }

        let offer = self
            .book
            .get(offer_id)
            .ok_or_else(|| TradeError::OfferNotAvailable(offer_id.to_string()))?;
        if offer.state().blocks_taking() || offer.maker_pub_key() == &self.keypair.public_key() {
            return Err(TradeError::OfferNotAvailable(offer_id.to_string()));
        }

        payment_account.check_compatible(&offer)?;

        if amount < offer.min_amount() || amount > offer.amount() {
            return Err(TradeError::InvalidAmount {
                amount,
                min: offer.min_amount(),
                max: offer.amount(),
            });
        }

        let available = self.wallet.available_balance();
        if amount > available {
            return Err(TradeError::InsufficientFunds {
                needed: amount,
                available,
            });
        }

        let is_seller = TradeRole::for_taker(offer.direction()).is_seller();
        let needed = funds_needed_for_trade(
            is_seller,
            amount,
            offer.security_deposit(),
            self.config.tx_fee,
        )
        .saturating_add(self.config.taker_fee);
        if needed > available {
            return Err(TradeError::InsufficientFunds { needed, available });
        }
        Ok(offer)
    }

    /// Validate, ask the maker whether the offer is still available, and
    /// start the trade if it is. The outcome goes to `reply`.
    pub async fn take_offer(
        &self,
        offer_id: &str,
        amount: u64,
        payment_account: PaymentAccount,
        reply: oneshot::Sender<Result<TradeId, TradeError>>,
    ) {
        match self.validate_take(offer_id, amount, &payment_account) {
            Ok(offer) => {
                let purpose = AvailabilityPurpose::Take {
                    amount,
                    payment_account,
                    reply,
                };
                self.request_availability(offer, purpose).await;
            }
            Err(err) => {
                warn!(offer = offer_id, error = %err, "take offer rejected");
                let _ = reply.send(Err(err));
            }
        }
    }

    /// Ask the maker whether the offer is still available, without taking it.
    pub async fn check_availability(
        &self,
        offer_id: &str,
        reply: oneshot::Sender<Result<bool, TradeError>>,
    ) {
        match self.book.get(offer_id) {
            Some(offer) => {
                self.request_availability(offer, AvailabilityPurpose::Probe { reply })
                    .await
            }
            None => {
                let _ = reply.send(Err(TradeError::OfferNotAvailable(offer_id.to_string())));
            }
        }
    }

    async fn request_availability(&self, offer: Offer, purpose: AvailabilityPurpose) {
        let offer_id = offer.id().to_string();
        let maker = offer.maker_address().clone();
        let uid = Uuid::new_v4().to_string();
        let timeout = Timer::once(
            self.config.availability_timeout(),
            self.timer_tx.clone(),
            TradeTimerEvent::AvailabilityTimeout {
                offer_id: offer_id.clone(),
                uid: uid.clone(),
            },
        );
        let check = AvailabilityCheck {
            offer,
            uid: uid.clone(),
            purpose,
            timeout,
        };

        let started = self.state.lock().checks.start(check);
        if let Err(check) = started {
            warn!(offer = %offer_id, "availability check already in progress");
            check
                .purpose
                .fail(TradeError::AvailabilityCheckInProgress(offer_id));
            return;
        }

        let request = OfferAvailabilityRequest {
            offer_id: offer_id.clone(),
            sender: self.messenger.own_address(),
            requester_pub_key: self.keypair.public_key(),
            uid: uid.clone(),
        };
        debug!(offer = %offer_id, maker = %maker, "availability request");
        if let Err(e) = self
            .messenger
            .send_direct(&maker, Message::OfferAvailabilityRequest(request))
            .await
        {
            warn!(offer = %offer_id, maker = %maker, error = %e, "maker unreachable");
            self.book.set_state(&offer_id, OfferState::OffererOffline);
            let check = self.state.lock().checks.take_matching(&offer_id, &uid);
            if let Some(check) = check {
                check.purpose.fail(e.into());
            }
        }
    }

    pub async fn handle_availability_response(&self, response: OfferAvailabilityResponse) {
        let check = self
            .state
            .lock()
            .checks
            .take_matching(&response.offer_id, &response.uid);
        let Some(AvailabilityCheck { offer, purpose, .. }) = check else {
            debug!(offer = %response.offer_id, "availability response without pending check");
            return;
        };
        let offer_id = response.offer_id;

        if !response.available {
            info!(offer = %offer_id, "offer no longer available");
            self.book.set_state(&offer_id, OfferState::NotAvailable);
            match purpose {
                AvailabilityPurpose::Probe { reply } => {
                    let _ = reply.send(Ok(false));
                }
                AvailabilityPurpose::Take { reply, .. } => {
                    let _ = reply.send(Err(TradeError::OfferNotAvailable(offer_id)));
                }
            }
            return;
        }

        self.book.set_state(&offer_id, OfferState::Available);
        match purpose {
            AvailabilityPurpose::Probe { reply } => {
                let _ = reply.send(Ok(true));
            }
            AvailabilityPurpose::Take {
                amount,
                payment_account,
                reply,
            } => {
                let result = self.start_taker_trade(offer, amount, payment_account).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn start_taker_trade(
        &self,
        offer: Offer,
        amount: u64,
        payment_account: PaymentAccount,
    ) -> Result<TradeId, TradeError> {
        if self.state.lock().stopped {
            return Err(TradeError::ShutDown);
        }
        let trade_id = offer.id().to_string();
        let role = TradeRole::for_taker(offer.direction());
        let protocol = TradeProtocol::new(&trade_id, role);
        let funds = protocol
            .behavior()
            .funds_needed(amount, offer.security_deposit(), self.config.tx_fee);

        let available = self.wallet.available_balance();
        let needed = funds.saturating_add(self.config.taker_fee);
        if needed > available {
            return Err(TradeError::InsufficientFunds { needed, available });
        }
        let fee_tx_id = self
            .wallet
            .pay_trade_fee(&trade_id, self.config.taker_fee)
            .await?;
        self.wallet.reserve_funds(&trade_id, funds)?;

        let maker = offer.maker_address().clone();
        let mut trade = Trade::new(
            role,
            offer,
            amount,
            maker.clone(),
            payment_account.clone(),
            self.config.tx_fee,
        );
        trade.taker_fee_tx_id = Some(fee_tx_id.clone());
        info!(trade = %trade, "trade created");
        {
            let mut st = self.state.lock();
            st.pending.insert(trade_id.clone(), trade);
            st.protocols.insert(trade_id.clone(), protocol);
        }
        self.persist();
        let _ = self.events.send(TradeEvent::Created {
            trade_id: trade_id.clone(),
            role,
        });

        let payload = TradePayload::PayDepositRequest {
            trade_amount: amount,
            taker_fee_tx_id: fee_tx_id,
            taker_payout_address: self.wallet.payout_address(&trade_id),
            taker_payment_account: payment_account,
            taker_pub_key: self.keypair.public_key(),
        };
        let sent = self.send_to_peer(&maker, &trade_id, payload).await;
        self.settle(&trade_id, sent).await?;
        Ok(trade_id)
    }

    /// Drop the pending availability check for `offer_id`. Whoever waits on
    /// it sees [`TradeError::Canceled`].
    pub fn cancel_availability_check(&self, offer_id: &str) -> bool {
        let canceled = self.state.lock().checks.cancel(offer_id);
        if canceled {
            debug!(offer = offer_id, "availability check canceled");
        }
        canceled
    }

    pub fn has_availability_check(&self, offer_id: &str) -> bool {
        self.state.lock().checks.contains(offer_id)
    }

    pub fn handle_timer(&self, event: TradeTimerEvent) {
        match event {
            TradeTimerEvent::AvailabilityTimeout { offer_id, uid } => {
                let check = self.state.lock().checks.take_matching(&offer_id, &uid);
                if let Some(check) = check {
                    warn!(offer = %offer_id, "no availability response, maker considered offline");
                    self.book.set_state(&offer_id, OfferState::OffererOffline);
                    check
                        .purpose
                        .fail(TradeError::Timeout(format!("availability of offer {offer_id}")));
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Incoming trade messages
    // -----------------------------------------------------------------------

    pub async fn handle_trade_message(&self, message: TradeMessage) {
        let TradeMessage {
            trade_id,
            sender,
            payload,
            ..
        } = message;
        let kind = payload.type_name();
        if self.state.lock().stopped {
            return;
        }
        debug!(trade = %trade_id, peer = %sender, kind, "trade message");

        if let TradePayload::PayDepositRequest { .. } = payload {
            self.on_pay_deposit_request(&trade_id, sender, payload).await;
            return;
        }

        let admitted = {
            let st = self.state.lock();
            match (st.active(&trade_id), st.protocols.get(&trade_id)) {
                (Some(trade), Some(protocol)) => {
                    if trade.trading_peer() != &sender {
                        Err("not from the trading peer".to_string())
                    } else if !protocol.accepts(&payload) {
                        Err(format!("out of turn, waiting for {:?}", protocol.expected()))
                    } else {
                        Ok(())
                    }
                }
                _ => Err("unknown or finished trade".to_string()),
            }
        };
        if let Err(reason) = admitted {
            warn!(trade = %trade_id, peer = %sender, kind, reason = %reason, "trade message dropped");
            return;
        }

        let result = match payload {
            TradePayload::PublishDepositTxRequest {
                maker_payout_address,
                maker_payment_account,
                prepared_deposit_tx,
            } => {
                self.on_publish_deposit_request(
                    &trade_id,
                    maker_payout_address,
                    maker_payment_account,
                    prepared_deposit_tx,
                )
                .await
            }
            TradePayload::DepositTxPublished { deposit_tx_id, .. } => {
                self.on_deposit_published(&trade_id, deposit_tx_id).await
            }
            TradePayload::FiatTransferStarted {
                buyer_payout_address,
            } => self.on_fiat_transfer_started(&trade_id, buyer_payout_address),
            TradePayload::FinalizePayoutTxRequest {
                seller_signature,
                seller_payout_address,
            } => {
                self.on_finalize_payout_request(&trade_id, seller_signature, seller_payout_address)
                    .await
            }
            TradePayload::PayoutTxPublished { payout_tx_id, .. } => {
                self.on_payout_published(&trade_id, payout_tx_id)
            }
            TradePayload::OpenDispute { reason } => {
                self.on_dispute(&trade_id, DisputeState::Opened, &reason)
            }
            TradePayload::DisputeClosed { summary } => {
                self.on_dispute(&trade_id, DisputeState::Closed, &summary)
            }
            TradePayload::PayDepositRequest { .. } => Ok(()),
        };
        let _ = self.settle(&trade_id, result).await;
    }

    /// Maker side: a taker wants to start a trade on one of our offers.
    async fn on_pay_deposit_request(&self, trade_id: &str, taker: NodeAddress, payload: TradePayload) {
        let TradePayload::PayDepositRequest {
            trade_amount,
            taker_fee_tx_id,
            taker_payout_address,
            taker_payment_account,
            taker_pub_key,
        } = payload
        else {
            return;
        };

        if !taker_pub_key.is_present() {
            warn!(trade = trade_id, peer = %taker, "deposit request without taker key");
            return;
        }
        let (offer, account) =
            match self.accept_taker(trade_id, trade_amount, &taker_payment_account) {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(trade = trade_id, peer = %taker, error = %e, "deposit request refused");
                    return;
                }
            };

        let role = TradeRole::for_maker(offer.direction());
        let protocol = TradeProtocol::new(trade_id, role);
        let funds = protocol.behavior().funds_needed(
            trade_amount,
            offer.security_deposit(),
            self.config.tx_fee,
        );
        let mut trade = Trade::new(
            role,
            offer,
            trade_amount,
            taker.clone(),
            account.clone(),
            self.config.tx_fee,
        );
        trade.taker_fee_tx_id = Some(taker_fee_tx_id);
        trade.peer_payment_account = Some(taker_payment_account);
        trade.peer_payout_address = Some(taker_payout_address);
        info!(trade = %trade, "trade created");
        {
            let mut st = self.state.lock();
            st.open_offer_trades.insert(trade_id.to_string(), trade);
            st.protocols.insert(trade_id.to_string(), protocol);
        }
        self.persist();
        let _ = self.events.send(TradeEvent::Created {
            trade_id: trade_id.to_string(),
            role,
        });

        let result = self
            .request_deposit_publication(trade_id, &taker, funds, account)
            .await;
        let _ = self.settle(trade_id, result).await;
    }

    fn accept_taker(
        &self,
        trade_id: &str,
        amount: u64,
        taker_account: &PaymentAccount,
    ) -> Result<(Offer, PaymentAccount), TradeError> {
        if self.state.lock().knows(trade_id) {
            return Err(TradeError::AlreadyExists(trade_id.to_string()));
        }
        let open = self
            .offers
            .open_offer(trade_id)
            .filter(|o| o.state() == OpenOfferState::Available)
            .ok_or_else(|| TradeError::OfferNotAvailable(trade_id.to_string()))?;
        let offer = open.offer();
        if amount < offer.min_amount() || amount > offer.amount() {
            return Err(TradeError::InvalidAmount {
                amount,
                min: offer.min_amount(),
                max: offer.amount(),
            });
        }
        taker_account.check_compatible(offer)?;

        let reserved = self.offers.reserve_open_offer(trade_id)?;
        Ok((reserved, open.payment_account().clone()))
    }

    async fn request_deposit_publication(
        &self,
        trade_id: &str,
        taker: &NodeAddress,
        funds: u64,
        account: PaymentAccount,
    ) -> Result<(), TradeError> {
        self.wallet.reserve_funds(trade_id, funds)?;
        let prepared = self.wallet.prepare_deposit_tx(trade_id, funds).await?;
        let payload = TradePayload::PublishDepositTxRequest {
            maker_payout_address: self.wallet.payout_address(trade_id),
            maker_payment_account: account,
            prepared_deposit_tx: prepared,
        };
        self.send_to_peer(taker, trade_id, payload).await
    }

    /// Taker side: complete and broadcast the deposit.
    async fn on_publish_deposit_request(
        &self,
        trade_id: &str,
        maker_payout_address: String,
        maker_payment_account: PaymentAccount,
        prepared: Vec<u8>,
    ) -> Result<(), TradeError> {
        let peer = self.update_trade(trade_id, |t| {
            maker_payment_account.check_compatible(t.offer())?;
            t.peer_payout_address = Some(maker_payout_address);
            t.peer_payment_account = Some(maker_payment_account);
            Ok(t.trading_peer().clone())
        })?;

        let tx = self.wallet.publish_deposit_tx(trade_id, &prepared).await?;
        self.update_trade(trade_id, |t| {
            t.deposit_tx_id = Some(tx.tx_id.clone());
            t.set_process_state(ProcessState::DepositPublished)
        })?;
        self.wallet.watch_deposit(trade_id, &tx.tx_id);
        self.set_expected(trade_id, |b| b.after_deposit());
        self.state_changed(trade_id, ProcessState::DepositPublished);

        let payload = TradePayload::DepositTxPublished {
            deposit_tx_id: tx.tx_id,
            deposit_tx: tx.raw,
        };
        self.send_to_peer(&peer, trade_id, payload).await
    }

    /// Maker side: the taker broadcast the deposit. The trade is now
    /// pending and the offer is retired.
    async fn on_deposit_published(&self, trade_id: &str, deposit_tx_id: String) -> Result<(), TradeError> {
        {
            let mut st = self.state.lock();
            let mut trade = st
                .open_offer_trades
                .remove(trade_id)
                .ok_or_else(|| TradeError::NotFound(trade_id.to_string()))?;
            trade.deposit_tx_id = Some(deposit_tx_id.clone());
            let moved = trade
                .set_process_state(ProcessState::DepositPublished)
                .and_then(|_| trade.set_life_cycle_state(LifeCycleState::Pending));
            st.pending.insert(trade_id.to_string(), trade);
            moved?;
        }
        self.wallet.watch_deposit(trade_id, &deposit_tx_id);
        self.set_expected(trade_id, |b| b.after_deposit());
        self.state_changed(trade_id, ProcessState::DepositPublished);

        if let Err(e) = self.offers.close_open_offer(trade_id).await {
            warn!(trade = trade_id, error = %e, "open offer not closed");
        }
        Ok(())
    }

    /// Seller side.
    fn on_fiat_transfer_started(&self, trade_id: &str, buyer_payout_address: String) -> Result<(), TradeError> {
        self.update_trade(trade_id, |t| {
            t.peer_payout_address = Some(buyer_payout_address);
            t.set_process_state(ProcessState::FiatPaymentStarted)
        })?;
        self.set_expected(trade_id, |_| ExpectedMessage::Nothing);
        self.state_changed(trade_id, ProcessState::FiatPaymentStarted);
        Ok(())
    }

    /// Buyer side: the seller confirmed receipt; co-sign and broadcast the
    /// payout.
    async fn on_finalize_payout_request(
        &self,
        trade_id: &str,
        seller_signature: Vec<u8>,
        seller_payout_address: String,
    ) -> Result<(), TradeError> {
        let peer = self.update_trade(trade_id, |t| {
            if t.process_state() != ProcessState::FiatPaymentStarted {
                return Err(TradeError::StateMismatch {
                    trade_id: t.id().to_string(),
                    expected: ProcessState::FiatPaymentStarted,
                    actual: t.process_state(),
                });
            }
            t.peer_payout_address = Some(seller_payout_address);
            Ok(t.trading_peer().clone())
        })?;

        let tx = self.wallet.publish_payout_tx(trade_id, &seller_signature).await?;
        self.update_trade(trade_id, |t| {
            t.payout_tx_id = Some(tx.tx_id.clone());
            t.set_process_state(ProcessState::PayoutPublished)
        })?;
        self.set_expected(trade_id, |_| ExpectedMessage::Nothing);
        self.state_changed(trade_id, ProcessState::PayoutPublished);

        let payload = TradePayload::PayoutTxPublished {
            payout_tx_id: tx.tx_id,
            payout_tx: tx.raw,
        };
        self.send_to_peer(&peer, trade_id, payload).await
    }

    /// Seller side.
    fn on_payout_published(&self, trade_id: &str, payout_tx_id: String) -> Result<(), TradeError> {
        self.update_trade(trade_id, |t| {
            t.payout_tx_id = Some(payout_tx_id);
            t.set_process_state(ProcessState::PayoutPublished)
        })?;
        self.set_expected(trade_id, |_| ExpectedMessage::Nothing);
        self.state_changed(trade_id, ProcessState::PayoutPublished);
        Ok(())
    }

    fn on_dispute(&self, trade_id: &str, state: DisputeState, note: &str) -> Result<(), TradeError> {
        self.update_trade(trade_id, |t| {
            t.set_dispute_state(state);
            Ok(())
        })?;
        info!(trade = trade_id, ?state, note, "dispute state changed by peer");
        self.persist();
        if state == DisputeState::Opened {
            let _ = self.events.send(TradeEvent::DisputeOpened {
                trade_id: trade_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn handle_wallet_event(&self, event: WalletEvent) {
        match event {
            WalletEvent::DepositConfirmed {
                trade_id,
                confirmations,
                ..
            } => {
                let confirmed = {
                    let mut st = self.state.lock();
                    match st.pending.get_mut(&trade_id) {
                        Some(t) if t.process_state() == ProcessState::DepositPublished => {
                            t.set_process_state(ProcessState::DepositConfirmed).is_ok()
                        }
                        _ => false,
                    }
                };
                if confirmed {
                    debug!(trade = %trade_id, confirmations, "deposit confirmed");
                    self.state_changed(&trade_id, ProcessState::DepositConfirmed);
                } else {
                    debug!(trade = %trade_id, "confirmation ignored");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // User actions
    // -----------------------------------------------------------------------

    /// Buyer: the counter-currency payment was sent. Only valid once the
    /// deposit is confirmed.
    pub async fn payment_started(&self, trade_id: &str) -> Result<(), TradeError> {
        let peer = {
            let mut st = self.state.lock();
            if !st.behavior(trade_id)?.sends_payment_started() {
                return Err(TradeError::WrongRole("announce a payment"));
            }
            let trade = st
                .active_mut(trade_id)
                .ok_or_else(|| TradeError::NotFound(trade_id.to_string()))?;
            if trade.process_state() != ProcessState::DepositConfirmed {
                return Err(TradeError::StateMismatch {
                    trade_id: trade_id.to_string(),
                    expected: ProcessState::DepositConfirmed,
                    actual: trade.process_state(),
                });
            }
            trade.set_process_state(ProcessState::FiatPaymentStarted)?;
            trade.trading_peer().clone()
        };
        self.set_expected(trade_id, |_| ExpectedMessage::FinalizePayoutTxRequest);
        self.state_changed(trade_id, ProcessState::FiatPaymentStarted);

        let payload = TradePayload::FiatTransferStarted {
            buyer_payout_address: self.wallet.payout_address(trade_id),
        };
        let sent = self.send_to_peer(&peer, trade_id, payload).await;
        self.settle(trade_id, sent).await
    }

    /// Seller: the counter-currency payment arrived. Only valid after the
    /// buyer announced it.
    pub async fn payment_received(&self, trade_id: &str) -> Result<(), TradeError> {
        let peer = {
            let mut st = self.state.lock();
            if !st.behavior(trade_id)?.confirms_payment_received() {
                return Err(TradeError::WrongRole("confirm a payment"));
            }
            let trade = st
                .active(trade_id)
                .ok_or_else(|| TradeError::NotFound(trade_id.to_string()))?;
            if trade.process_state() != ProcessState::FiatPaymentStarted {
                return Err(TradeError::StateMismatch {
                    trade_id: trade_id.to_string(),
                    expected: ProcessState::FiatPaymentStarted,
                    actual: trade.process_state(),
                });
            }
            trade.trading_peer().clone()
        };

        let result = self.finalize_payout(trade_id, &peer).await;
        self.settle(trade_id, result).await
    }

    async fn finalize_payout(&self, trade_id: &str, peer: &NodeAddress) -> Result<(), TradeError> {
        let seller_signature = self.wallet.sign_payout_tx(trade_id)?;
        self.update_trade(trade_id, |t| t.set_process_state(ProcessState::FiatPaymentReceived))?;
        self.set_expected(trade_id, |_| ExpectedMessage::PayoutTxPublished);
        self.state_changed(trade_id, ProcessState::FiatPaymentReceived);

        let payload = TradePayload::FinalizePayoutTxRequest {
            seller_signature,
            seller_payout_address: self.wallet.payout_address(trade_id),
        };
        self.send_to_peer(peer, trade_id, payload).await
    }

    /// Move the payout into the savings wallet and close the trade.
    pub fn withdraw_to_savings(&self, trade_id: &str) -> Result<(), TradeError> {
        {
            let mut st = self.state.lock();
            let trade = st
                .pending
                .get_mut(trade_id)
                .ok_or_else(|| TradeError::NotFound(trade_id.to_string()))?;
            if trade.process_state() != ProcessState::PayoutPublished {
                return Err(TradeError::StateMismatch {
                    trade_id: trade_id.to_string(),
                    expected: ProcessState::PayoutPublished,
                    actual: trade.process_state(),
                });
            }
            trade.set_process_state(ProcessState::WithdrawCompleted)?;
            trade.dispose_protocol();
            trade.set_life_cycle_state(LifeCycleState::Completed)?;
            st.protocols.remove(trade_id);
            if let Some(trade) = st.pending.remove(trade_id) {
                st.closed.push(trade);
            }
        }

        self.wallet
            .swap_trade_entry_to_available(trade_id, AddressContext::MultiSig);
        self.wallet
            .swap_trade_entry_to_available(trade_id, AddressContext::TradePayout);
        self.state_changed(trade_id, ProcessState::WithdrawCompleted);
        info!(trade = trade_id, "trade completed");
        let _ = self.events.send(TradeEvent::Completed {
            trade_id: trade_id.to_string(),
        });
        Ok(())
    }

    pub async fn open_dispute(&self, trade_id: &str, reason: String) -> Result<(), TradeError> {
        let peer = self.update_trade(trade_id, |t| {
            if t.dispute_state() == DisputeState::Opened {
                return Err(TradeError::ProtocolViolation(format!(
                    "dispute already open for {}",
                    t.id()
                )));
            }
            t.set_dispute_state(DisputeState::Opened);
            Ok(t.trading_peer().clone())
        })?;
        self.persist();
        info!(trade = trade_id, reason = %reason, "dispute opened");
        let _ = self.events.send(TradeEvent::DisputeOpened {
            trade_id: trade_id.to_string(),
        });
        self.send_to_peer(&peer, trade_id, TradePayload::OpenDispute { reason })
            .await
    }

    // -----------------------------------------------------------------------
    // Failure
    // -----------------------------------------------------------------------

    /// Pass `result` through, failing the trade first if it is an error.
    async fn settle(&self, trade_id: &str, result: Result<(), TradeError>) -> Result<(), TradeError> {
        if let Err(err) = &result {
            let state = match err {
                TradeError::Network(_) => ProcessState::MessageSendingFailed,
                _ => ProcessState::Exception,
            };
            self.fail_trade(trade_id, state, err).await;
        }
        result
    }

    /// Record the failure, dispose the protocol and move the trade to the
    /// failed set. Funds not yet committed to a deposit are released.
    pub async fn fail_trade(&self, trade_id: &str, state: ProcessState, err: &TradeError) {
        let (release, retire_offer) = {
            let mut st = self.state.lock();
            let removed = st
                .pending
                .remove(trade_id)
                .or_else(|| st.open_offer_trades.remove(trade_id));
            let Some(mut trade) = removed else {
                return;
            };
            st.protocols.remove(trade_id);
            trade.set_failed_state(state, err.to_string());
            trade.dispose_protocol();
            if let Err(e) = trade.set_life_cycle_state(LifeCycleState::Failed) {
                warn!(trade = trade_id, error = %e, "life cycle not updated");
            }
            let release = trade.deposit_tx_id.is_none();
            let retire_offer = release && trade.role().is_maker();
            st.failed.push(trade);
            (release, retire_offer)
        };

        if release {
            self.wallet.release_funds(trade_id);
        }
        self.persist();
        error!(trade = trade_id, %state, error = %err, "trade failed");
        let _ = self.events.send(TradeEvent::StateChanged {
            trade_id: trade_id.to_string(),
            state,
        });
        let _ = self.events.send(TradeEvent::Failed {
            trade_id: trade_id.to_string(),
            error: err.to_string(),
        });

        if retire_offer {
            if let Err(e) = self.offers.close_open_offer(trade_id).await {
                debug!(trade = trade_id, error = %e, "offer of failed trade not closed");
            }
        }
    }

    /// Refuse new work and drop pending availability checks.
    pub fn shutdown(&self) {
        {
            let mut st = self.state.lock();
            if st.stopped {
                return;
            }
            st.stopped = true;
            st.checks.cancel_all();
        }
        self.persist();
        info!("trade manager stopped");
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn trade(&self, trade_id: &str) -> Option<Trade> {
        let st = self.state.lock();
        st.active(trade_id)
            .or_else(|| st.closed.iter().find(|t| t.id() == trade_id))
            .or_else(|| st.failed.iter().find(|t| t.id() == trade_id))
            .cloned()
    }

    pub fn open_offer_trades(&self) -> Vec<Trade> {
        self.state.lock().open_offer_trades.values().cloned().collect()
    }

    pub fn pending_trades(&self) -> Vec<Trade> {
        self.state.lock().pending.values().cloned().collect()
    }

    pub fn closed_trades(&self) -> Vec<Trade> {
        self.state.lock().closed.clone()
    }

    pub fn failed_trades(&self) -> Vec<Trade> {
        self.state.lock().failed.clone()
    }

    pub fn has_protocol(&self, trade_id: &str) -> bool {
        self.state.lock().protocols.contains_key(trade_id)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn update_trade<R>(
        &self,
        trade_id: &str,
        f: impl FnOnce(&mut Trade) -> Result<R, TradeError>,
    ) -> Result<R, TradeError> {
        let mut st = self.state.lock();
        let trade = st
            .active_mut(trade_id)
            .ok_or_else(|| TradeError::NotFound(trade_id.to_string()))?;
        f(trade)
    }

    fn set_expected(&self, trade_id: &str, next: impl FnOnce(&dyn RoleBehavior) -> ExpectedMessage) {
        if let Some(protocol) = self.state.lock().protocols.get_mut(trade_id) {
            let expected = next(protocol.behavior());
            protocol.expect(expected);
        }
    }

    fn state_changed(&self, trade_id: &str, state: ProcessState) {
        info!(trade = trade_id, %state, "trade state changed");
        self.persist();
        let _ = self.events.send(TradeEvent::StateChanged {
            trade_id: trade_id.to_string(),
            state,
        });
    }

    async fn send_to_peer(
        &self,
        peer: &NodeAddress,
        trade_id: &str,
        payload: TradePayload,
    ) -> Result<(), TradeError> {
        let kind = payload.type_name();
        let message = Message::Trade(TradeMessage {
            trade_id: trade_id.to_string(),
            sender: self.messenger.own_address(),
            uid: Uuid::new_v4().to_string(),
            payload,
        });
        self.messenger.send_direct(peer, message).await?;
        debug!(trade = trade_id, peer = %peer, kind, "trade message sent");
        Ok(())
    }

    fn persist(&self) {
        let (open, pending, closed, failed) = {
            let st = self.state.lock();
            (
                st.open_offer_trades.values().cloned().collect::<Vec<_>>(),
                st.pending.values().cloned().collect::<Vec<_>>(),
                st.closed.clone(),
                st.failed.clone(),
            )
        };
        let store = self.store.as_ref();
        let result = save_collection(store, OPEN_OFFER_TRADES, &open)
            .and_then(|_| save_collection(store, PENDING_TRADES, &pending))
            .and_then(|_| save_collection(store, CLOSED_TRADES, &closed))
            .and_then(|_| save_collection(store, FAILED_TRADES, &failed));
        if let Err(e) = result {
            error!(error = %e, "failed to persist trades");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::config::OfferConfig;
    use crate::offer::overlay::sign_add;
    use crate::offer::test_support::{
        maker_keypair, sepa_account, RecordingMessenger, RecordingOverlay,
    };
    use crate::offer::{OfferDirection, PlaceOfferRequest, Price};
    use crate::storage::MemoryStore;
    use crate::trade::availability::await_answer;
    use crate::wallet::InMemoryWallet;

    const FUNDS: u64 = 10_000_000;

    struct Side {
        messenger: Arc<RecordingMessenger>,
        wallet: Arc<InMemoryWallet>,
        book: Arc<OfferBook>,
        offers: Arc<OpenOfferManager>,
        trades: TradeManager,
        store: Arc<MemoryStore>,
        _offer_timers: mpsc::UnboundedReceiver<crate::offer::OfferTimerEvent>,
        trade_timers: mpsc::UnboundedReceiver<TradeTimerEvent>,
    }

    fn trade_config() -> TradeConfig {
        TradeConfig {
            tx_fee: 1_000,
            taker_fee: 500,
            availability_timeout_ms: 5_000,
        }
    }

    fn side(port: u16, keypair: NodeKeypair, balance: u64) -> Side {
        let messenger = Arc::new(RecordingMessenger::new(NodeAddress::localhost(port)));
        let (wallet, _events) = InMemoryWallet::new(balance);
        let wallet = Arc::new(wallet);
        let store = Arc::new(MemoryStore::new());
        let book = Arc::new(OfferBook::new(
            Duration::from_secs(240),
            crate::events::offer_channel(),
        ));
        let (offers, offer_timers) = OpenOfferManager::new(
            keypair.clone(),
            messenger.clone(),
            Arc::new(RecordingOverlay::default()),
            wallet.clone(),
            store.clone(),
            OfferConfig {
                maker_fee: 500,
                ..OfferConfig::default()
            },
            trade_config().tx_fee,
        );
        let offers = Arc::new(offers);
        let (trades, trade_timers) = TradeManager::new(
            keypair,
            messenger.clone(),
            wallet.clone(),
            store.clone(),
            offers.clone(),
            book.clone(),
            trade_config(),
        );
        Side {
            messenger,
            wallet,
            book,
            offers,
            trades,
            store,
            _offer_timers: offer_timers,
            trade_timers,
        }
    }

    /// A maker on port 9000 with one placed offer, and a taker on 9100 that
    /// has the offer in its book.
    async fn market(direction: OfferDirection) -> (Side, Side, Offer) {
        let maker = side(9000, maker_keypair(), FUNDS);
        let taker = side(9100, NodeKeypair::from_seed(&[9u8; 32]), FUNDS);
        let offer = maker
            .offers
            .place_offer(PlaceOfferRequest {
                direction,
                base_currency: "BTC".into(),
                counter_currency: "EUR".into(),
                min_amount: 50_000,
                amount: 100_000,
                price: Price::Fixed(6_000_000),
                security_deposit: 20_000,
                payment_account: sepa_account("DE"),
                arbitrators: vec![],
            })
            .await
            .unwrap();
        taker
            .book
            .handle_add(sign_add(&maker_keypair(), &offer, 1), Instant::now());
        (maker, taker, offer)
    }

    /// Deliver everything `from` has sent to `to`. Returns how many
    /// messages were delivered.
    async fn deliver(from: &Side, to: &Side) -> usize {
        let messages = from.messenger.take_direct();
        let count = messages.len();
        for (addr, message) in messages {
            assert_eq!(addr, to.messenger.own_address());
            match message {
                Message::OfferAvailabilityRequest(req) => {
                    to.offers.handle_availability_request(req).await
                }
                Message::OfferAvailabilityResponse(resp) => {
                    to.trades.handle_availability_response(resp).await
                }
                Message::Trade(msg) => to.trades.handle_trade_message(msg).await,
                other => panic!("unexpected {}", other.type_name()),
            }
        }
        count
    }

    async fn exchange(a: &Side, b: &Side) {
        while deliver(a, b).await + deliver(b, a).await > 0 {}
    }

    fn confirm(side: &Side, trade_id: &str) {
        side.trades.handle_wallet_event(WalletEvent::DepositConfirmed {
            trade_id: trade_id.to_string(),
            tx_id: "any".into(),
            confirmations: 1,
        });
    }

    fn state_of(side: &Side, trade_id: &str) -> ProcessState {
        side.trades.trade(trade_id).unwrap().process_state()
    }

    async fn take(taker: &Side, offer_id: &str, amount: u64) -> oneshot::Receiver<Result<TradeId, TradeError>> {
        let (tx, rx) = oneshot::channel();
        taker
            .trades
            .take_offer(offer_id, amount, sepa_account("DE"), tx)
            .await;
        rx
    }

    async fn run_full_trade(direction: OfferDirection) {
        let (maker, taker, offer) = market(direction).await;
        let id = offer.id().to_string();

        let rx = take(&taker, &id, 80_000).await;
        exchange(&taker, &maker).await;
        assert_eq!(await_answer(rx).await.unwrap(), id);

        // Deposit is published and both sides know it.
        assert_eq!(state_of(&taker, &id), ProcessState::DepositPublished);
        assert_eq!(state_of(&maker, &id), ProcessState::DepositPublished);
        assert!(maker.trades.open_offer_trades().is_empty());
        assert_eq!(maker.trades.pending_trades().len(), 1);
        assert_eq!(
            maker.offers.closed_offers()[0].state(),
            OpenOfferState::Closed
        );

        confirm(&maker, &id);
        confirm(&taker, &id);

        let (buyer, seller) = if maker.trades.trade(&id).unwrap().role().is_buyer() {
            (&maker, &taker)
        } else {
            (&taker, &maker)
        };

        // Seller cannot confirm before the buyer announced the payment.
        assert!(matches!(
            seller.trades.payment_received(&id).await,
            Err(TradeError::StateMismatch { .. })
        ));

        buyer.trades.payment_started(&id).await.unwrap();
        exchange(buyer, seller).await;
        assert_eq!(state_of(seller, &id), ProcessState::FiatPaymentStarted);

        seller.trades.payment_received(&id).await.unwrap();
        exchange(seller, buyer).await;
        assert_eq!(state_of(buyer, &id), ProcessState::PayoutPublished);
        assert_eq!(state_of(seller, &id), ProcessState::PayoutPublished);

        for side in [&maker, &taker] {
            side.trades.withdraw_to_savings(&id).unwrap();
            let trade = side.trades.trade(&id).unwrap();
            assert_eq!(trade.life_cycle_state(), LifeCycleState::Completed);
            assert!(!trade.is_protocol_active());
            assert!(!side.trades.has_protocol(&id));
            assert_eq!(side.trades.closed_trades().len(), 1);
            assert_eq!(side.wallet.reserved_for(&id), 0);
        }
    }

    #[tokio::test]
    async fn full_trade_with_selling_maker() {
        run_full_trade(OfferDirection::Sell).await;
    }

    #[tokio::test]
    async fn full_trade_with_buying_maker() {
        run_full_trade(OfferDirection::Buy).await;
    }

    #[tokio::test]
    async fn take_beyond_balance_sends_nothing() {
        let (_maker, _, offer) = market(OfferDirection::Sell).await;
        let poor = side(9200, NodeKeypair::from_seed(&[3u8; 32]), 1_000);
        poor.book
            .handle_add(sign_add(&maker_keypair(), &offer, 1), Instant::now());

        let rx = take(&poor, offer.id(), 80_000).await;
        assert!(matches!(
            await_answer(rx).await,
            Err(TradeError::InsufficientFunds { .. })
        ));
        assert!(poor.messenger.direct().is_empty());
        assert_eq!(poor.wallet.balance(), 1_000);
        assert!(poor.trades.pending_trades().is_empty());
    }

    #[tokio::test]
    async fn take_outside_range_is_rejected() {
        let (_maker, taker, offer) = market(OfferDirection::Sell).await;
        let rx = take(&taker, offer.id(), 10).await;
        assert!(matches!(
            await_answer(rx).await,
            Err(TradeError::InvalidAmount { .. })
        ));
        let rx = take(&taker, offer.id(), 100_001).await;
        assert!(matches!(
            await_answer(rx).await,
            Err(TradeError::InvalidAmount { .. })
        ));
        assert!(taker.messenger.direct().is_empty());
    }

    #[tokio::test]
    async fn second_take_while_checking_is_refused() {
        let (maker, taker, offer) = market(OfferDirection::Sell).await;
        let first = take(&taker, offer.id(), 80_000).await;
        let second = take(&taker, offer.id(), 60_000).await;
        assert!(matches!(
            await_answer(second).await,
            Err(TradeError::AvailabilityCheckInProgress(_))
        ));
        assert_eq!(taker.messenger.direct().len(), 1);

        exchange(&taker, &maker).await;
        assert!(await_answer(first).await.is_ok());
        assert_eq!(taker.trades.pending_trades().len(), 1);
        assert_eq!(maker.trades.pending_trades().len(), 1);
    }

    #[tokio::test]
    async fn unavailable_answer_creates_no_trade() {
        let (maker, taker, offer) = market(OfferDirection::Sell).await;
        let rx = take(&taker, offer.id(), 80_000).await;
        // Offer gets reserved by someone else before the request arrives.
        maker.offers.reserve_open_offer(offer.id()).unwrap();
        exchange(&taker, &maker).await;

        assert!(matches!(
            await_answer(rx).await,
            Err(TradeError::OfferNotAvailable(_))
        ));
        assert!(taker.trades.trade(offer.id()).is_none());
        assert_eq!(
            taker.book.get(offer.id()).unwrap().state(),
            OfferState::NotAvailable
        );
        assert_eq!(taker.wallet.balance(), FUNDS);
    }

    #[tokio::test]
    async fn probe_reports_availability() {
        let (maker, taker, offer) = market(OfferDirection::Buy).await;
        let (tx, rx) = oneshot::channel();
        taker.trades.check_availability(offer.id(), tx).await;
        exchange(&taker, &maker).await;
        assert!(await_answer(rx).await.unwrap());
        assert!(taker.trades.trade(offer.id()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_maker_times_out_as_offline() {
        let (_maker, mut taker, offer) = market(OfferDirection::Sell).await;
        let rx = take(&taker, offer.id(), 80_000).await;
        // Never delivered. Let the timeout fire.
        let event = taker.trade_timers.recv().await.unwrap();
        taker.trades.handle_timer(event);

        assert!(matches!(await_answer(rx).await, Err(TradeError::Timeout(_))));
        assert_eq!(
            taker.book.get(offer.id()).unwrap().state(),
            OfferState::OffererOffline
        );
        assert!(!taker.trades.has_availability_check(offer.id()));
    }

    #[tokio::test]
    async fn canceled_check_reports_canceled() {
        let (_maker, taker, offer) = market(OfferDirection::Sell).await;
        let rx = take(&taker, offer.id(), 80_000).await;
        assert!(taker.trades.cancel_availability_check(offer.id()));
        assert!(matches!(await_answer(rx).await, Err(TradeError::Canceled)));
    }

    #[tokio::test]
    async fn payment_started_requires_confirmed_deposit() {
        let (maker, taker, offer) = market(OfferDirection::Sell).await;
        let id = offer.id().to_string();
        let rx = take(&taker, &id, 80_000).await;
        exchange(&taker, &maker).await;
        await_answer(rx).await.unwrap();

        // Taker is the buyer here.
        assert!(matches!(
            taker.trades.payment_started(&id).await,
            Err(TradeError::StateMismatch {
                expected: ProcessState::DepositConfirmed,
                actual: ProcessState::DepositPublished,
                ..
            })
        ));
        assert!(matches!(
            maker.trades.payment_started(&id).await,
            Err(TradeError::WrongRole(_))
        ));
        assert!(taker.messenger.direct().is_empty());
    }

    #[tokio::test]
    async fn send_failure_fails_the_maker_trade() {
        let (maker, taker, offer) = market(OfferDirection::Sell).await;
        let id = offer.id().to_string();
        let _rx = take(&taker, &id, 80_000).await;
        // Availability round trip, then the taker's deposit request.
        deliver(&taker, &maker).await;
        deliver(&maker, &taker).await;
        maker.messenger.fail_direct(true);
        deliver(&taker, &maker).await;

        let trade = maker.trades.trade(&id).unwrap();
        assert_eq!(trade.process_state(), ProcessState::MessageSendingFailed);
        assert_eq!(trade.life_cycle_state(), LifeCycleState::Failed);
        assert!(!trade.is_protocol_active());
        assert!(trade.error_message.is_some());
        assert_eq!(maker.trades.failed_trades().len(), 1);
        assert_eq!(maker.wallet.reserved_for(&id), 0);
        assert_eq!(
            maker.offers.closed_offers()[0].state(),
            OpenOfferState::Closed
        );
    }

    #[tokio::test]
    async fn messages_out_of_turn_are_dropped() {
        let (maker, taker, offer) = market(OfferDirection::Sell).await;
        let id = offer.id().to_string();
        let rx = take(&taker, &id, 80_000).await;
        exchange(&taker, &maker).await;
        await_answer(rx).await.unwrap();

        // A payout announcement before anything was paid does nothing.
        maker
            .trades
            .handle_trade_message(TradeMessage {
                trade_id: id.clone(),
                sender: taker.messenger.own_address(),
                uid: "x".into(),
                payload: TradePayload::PayoutTxPublished {
                    payout_tx_id: "p".into(),
                    payout_tx: vec![],
                },
            })
            .await;
        assert_eq!(state_of(&maker, &id), ProcessState::DepositPublished);

        // Messages from a stranger are ignored too.
        maker
            .trades
            .handle_trade_message(TradeMessage {
                trade_id: id.clone(),
                sender: NodeAddress::localhost(9999),
                uid: "y".into(),
                payload: TradePayload::OpenDispute {
                    reason: "x".into(),
                },
            })
            .await;
        assert_eq!(
            maker.trades.trade(&id).unwrap().dispute_state(),
            DisputeState::None
        );
    }

    #[tokio::test]
    async fn early_payout_request_leaves_the_buyer_trade_intact() {
        let (maker, taker, offer) = market(OfferDirection::Sell).await;
        let id = offer.id().to_string();
        let rx = take(&taker, &id, 80_000).await;
        exchange(&taker, &maker).await;
        await_answer(rx).await.unwrap();

        // Taker is the buyer and has not announced any payment yet.
        let early = || TradeMessage {
            trade_id: id.clone(),
            sender: maker.messenger.own_address(),
            uid: "early".into(),
            payload: TradePayload::FinalizePayoutTxRequest {
                seller_signature: vec![1, 2, 3],
                seller_payout_address: "seller".into(),
            },
        };
        taker.trades.handle_trade_message(early()).await;
        assert_eq!(state_of(&taker, &id), ProcessState::DepositPublished);

        confirm(&taker, &id);
        taker.trades.handle_trade_message(early()).await;
        assert_eq!(state_of(&taker, &id), ProcessState::DepositConfirmed);

        let trade = taker.trades.trade(&id).unwrap();
        assert_ne!(trade.life_cycle_state(), LifeCycleState::Failed);
        assert!(taker.trades.failed_trades().is_empty());
        assert!(taker.trades.has_protocol(&id));

        // Once the payment is announced the same request is welcome.
        confirm(&maker, &id);
        taker.trades.payment_started(&id).await.unwrap();
        exchange(&taker, &maker).await;
        maker.trades.payment_received(&id).await.unwrap();
        exchange(&maker, &taker).await;
        assert_eq!(state_of(&taker, &id), ProcessState::PayoutPublished);
    }

    #[tokio::test]
    async fn dispute_reaches_the_peer() {
        let (maker, taker, offer) = market(OfferDirection::Sell).await;
        let id = offer.id().to_string();
        let rx = take(&taker, &id, 80_000).await;
        exchange(&taker, &maker).await;
        await_answer(rx).await.unwrap();

        let mut events = maker.trades.subscribe();
        taker
            .trades
            .open_dispute(&id, "no payment".into())
            .await
            .unwrap();
        exchange(&taker, &maker).await;
        assert_eq!(
            maker.trades.trade(&id).unwrap().dispute_state(),
            DisputeState::Opened
        );
        assert_eq!(
            events.try_recv().unwrap(),
            TradeEvent::DisputeOpened { trade_id: id }
        );
    }

    #[tokio::test]
    async fn trades_reload_from_store() {
        let (maker, taker, offer) = market(OfferDirection::Sell).await;
        let id = offer.id().to_string();
        let rx = take(&taker, &id, 80_000).await;
        exchange(&taker, &maker).await;
        await_answer(rx).await.unwrap();

        let (reloaded, _timers) = TradeManager::new(
            NodeKeypair::from_seed(&[9u8; 32]),
            taker.messenger.clone(),
            taker.wallet.clone(),
            taker.store.clone(),
            taker.offers.clone(),
            taker.book.clone(),
            trade_config(),
        );
        assert_eq!(reloaded.load().unwrap(), 1);
        let trade = reloaded.trade(&id).unwrap();
        assert_eq!(trade.process_state(), ProcessState::DepositPublished);
        assert!(reloaded.has_protocol(&id));
    }
}
