//! # Open Offer Manager
//!
//! Everything a maker does with its own offers: placing them (fee, funds
//! reservation, overlay publication), answering availability requests,
//! keeping them alive in the overlay, reserving them for a trade, and
//! closing or canceling them.
//!
//! ## Keeping offers alive
//!
//! Overlay records expire after one TTL. Two timers keep them present:
//!
//! ```text
//! republish   every 10 x TTL   full AddOffer for each available offer,
//!                              each one delayed by a random 1 ms .. 1 s
//! refresh     every TTL / 2    RefreshOffer (hash + sequence number only)
//! ```
//!
//! The refresh timer starts after the first successful republish. A failed
//! republish arms a single retry of the whole pass. When all connections
//! are lost both timers stop; on reconnect the offers are republished at
//! once, again after a delay, and the periodic loop restarts.
//!
//! Timers only post [`OfferTimerEvent`]s. The owner of the receiver feeds
//! them back through [`OpenOfferManager::handle_timer`]. Every handler
//! checks the stopped and offline flags first, so an event that was
//! already queued when the timers were stopped does nothing.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::OfferError;
use super::open_offer::{OpenOffer, OpenOfferState};
use super::overlay::{sign_add, sign_refresh, sign_remove, OfferOverlay};
use super::types::{Offer, OfferDirection, OfferId, OfferPayload, OfferState, Price};
use crate::config::{OfferConfig, PROTOCOL_VERSION};
use crate::crypto::NodeKeypair;
use crate::events::OfferEvent;
use crate::network::{Message, NodeAddress, OfferAvailabilityRequest, OfferAvailabilityResponse, PeerMessenger};
use crate::payment::PaymentAccount;
use crate::storage::store::{CLOSED_OFFERS, OPEN_OFFERS};
use crate::storage::{load_collection, save_collection, PersistenceStore};
use crate::timer::Timer;
use crate::trade::funds::funds_needed_for_trade;
use crate::wallet::WalletService;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferTimerEvent {
    RepublishAll,
    RepublishOffer(OfferId),
    RetryRepublish,
    RepublishAfterReconnect,
    Refresh,
}

/// What a maker fills in to create an offer.
#[derive(Debug, Clone)]
pub struct PlaceOfferRequest {
    pub direction: OfferDirection,
    pub base_currency: String,
    pub counter_currency: String,
    pub min_amount: u64,
    pub amount: u64,
    pub price: Price,
    pub security_deposit: u64,
    pub payment_account: PaymentAccount,
    pub arbitrators: Vec<NodeAddress>,
}

#[derive(Default)]
struct ManagerState {
    open_offers: BTreeMap<OfferId, OpenOffer>,
    closed_offers: Vec<OpenOffer>,
    republish_timer: Option<Timer>,
    refresh_timer: Option<Timer>,
    retry_timer: Option<Timer>,
    after_reconnect_timer: Option<Timer>,
    jitter_timers: HashMap<OfferId, Timer>,
    stopped: bool,
    offline: bool,
}

impl ManagerState {
    fn stop_timers(&mut self) {
        self.republish_timer.take();
        self.refresh_timer.take();
        self.retry_timer.take();
        self.after_reconnect_timer.take();
        self.jitter_timers.clear();
    }

    fn inactive(&self) -> bool {
        self.stopped || self.offline
    }
}

pub struct OpenOfferManager {
    keypair: NodeKeypair,
    messenger: Arc<dyn PeerMessenger>,
    overlay: Arc<dyn OfferOverlay>,
    wallet: Arc<dyn WalletService>,
    store: Arc<dyn PersistenceStore>,
    config: OfferConfig,
    tx_fee: u64,
    timer_tx: mpsc::UnboundedSender<OfferTimerEvent>,
    events: broadcast::Sender<OfferEvent>,
    state: Mutex<ManagerState>,
}

impl OpenOfferManager {
    pub fn new(
        keypair: NodeKeypair,
        messenger: Arc<dyn PeerMessenger>,
        overlay: Arc<dyn OfferOverlay>,
        wallet: Arc<dyn WalletService>,
        store: Arc<dyn PersistenceStore>,
        config: OfferConfig,
        tx_fee: u64,
    ) -> (Self, mpsc::UnboundedReceiver<OfferTimerEvent>) {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let manager = Self {
            keypair,
            messenger,
            overlay,
            wallet,
            store,
            config,
            tx_fee,
            timer_tx,
            events: crate::events::offer_channel(),
            state: Mutex::new(ManagerState::default()),
        };
        (manager, timer_rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OfferEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<OfferEvent> {
        self.events.clone()
    }

    /// Restore open and closed offers from the store.
    pub fn load(&self) -> Result<usize, OfferError> {
        let mut open: Vec<OpenOffer> = load_collection(self.store.as_ref(), OPEN_OFFERS)?;
        let mut closed: Vec<OpenOffer> = load_collection(self.store.as_ref(), CLOSED_OFFERS)?;
        open.iter_mut().chain(closed.iter_mut()).for_each(OpenOffer::restore);

        let mut st = self.state.lock();
        let count = open.len();
        st.open_offers = open
            .into_iter()
            .map(|o| (o.id().to_string(), o))
            .collect();
        st.closed_offers = closed;
        info!(open = count, closed = st.closed_offers.len(), "offers loaded");
        Ok(count)
    }

    /// Begin keeping offers alive. Restored offers are republished at once.
    pub fn start(&self) {
        let has_offers = {
            let mut st = self.state.lock();
            st.stopped = false;
            st.offline = false;
            !st.open_offers.is_empty()
        };
        if has_offers {
            self.schedule_republish();
        }
        self.start_periodic_republish();
    }

    // -----------------------------------------------------------------------
    // Placing and removing
    // -----------------------------------------------------------------------

    pub async fn place_offer(&self, request: PlaceOfferRequest) -> Result<Offer, OfferError> {
        if self.state.lock().stopped {
            return Err(OfferError::ShutDown);
        }

        let account = &request.payment_account;
        if !account.supports_currency(&request.counter_currency) {
            return Err(OfferError::Invalid(format!(
                "payment account does not support {}",
                request.counter_currency
            )));
        }

        let offer_id = Uuid::new_v4().to_string();
        let mut payload = OfferPayload {
            id: offer_id.clone(),
            direction: request.direction,
            base_currency: request.base_currency.clone(),
            counter_currency: request.counter_currency.clone(),
            created_at: Utc::now().timestamp_millis(),
            protocol_version: PROTOCOL_VERSION,
            maker_address: self.messenger.own_address(),
            maker_pub_key: self.keypair.public_key(),
            min_amount: request.min_amount,
            amount: request.amount,
            price: request.price,
            payment_method: account.method,
            accepted_country_codes: account.country_code.clone().map(|cc| vec![cc]),
            accepted_bank_ids: account
                .method
                .is_bank_restricted()
                .then(|| account.bank_id.clone().map(|id| vec![id]))
                .flatten(),
            arbitrators: request.arbitrators.clone(),
            security_deposit: request.security_deposit,
            offer_fee_tx_id: None,
        };
        Offer::new(payload.clone()).validate()?;

        let is_seller = request.direction == OfferDirection::Sell;
        let funds = funds_needed_for_trade(
            is_seller,
            request.amount,
            request.security_deposit,
            self.tx_fee,
        );
        let needed = funds.saturating_add(self.config.maker_fee);
        let available = self.wallet.available_balance();
        if needed > available {
            return Err(OfferError::InsufficientFunds { needed, available });
        }

        // Funds are reserved before the fee is paid.
        self.wallet.reserve_funds(&offer_id, funds)?;
        let fee_tx = match self
            .wallet
            .pay_trade_fee(&offer_id, self.config.maker_fee)
            .await
        {
            Ok(tx) => tx,
            Err(e) => {
                self.wallet.release_funds(&offer_id);
                return Err(e.into());
            }
        };
        payload.offer_fee_tx_id = Some(fee_tx.clone());
        let mut offer = Offer::new(payload);
        offer.set_state(OfferState::OfferFeePaid);

        let mut open = OpenOffer::new(offer, request.payment_account.clone());
        let seq = open.next_sequence_number();
        let announcement = sign_add(&self.keypair, open.offer(), seq);
        if let Err(e) = self.overlay.add_offer(announcement).await {
            warn!(
                offer = %offer_id,
                fee_tx = %fee_tx,
                error = %e,
                "offer publication failed, maker fee already spent"
            );
            self.wallet.release_funds(&offer_id);
            return Err(e.into());
        }

        let offer = open.offer().clone();
        {
            let mut st = self.state.lock();
            st.open_offers.insert(offer_id.clone(), open);
        }
        self.persist();
        info!(offer = %offer, "offer placed");
        let _ = self.events.send(OfferEvent::Placed { offer_id });
        self.start_periodic_republish();
        Ok(offer)
    }

    /// Withdraw an available offer. Fails if the offer is reserved for a
    /// trade.
    pub async fn remove_open_offer(&self, offer_id: &str) -> Result<(), OfferError> {
        let announcement = {
            let mut st = self.state.lock();
            let open = st
                .open_offers
                .get_mut(offer_id)
                .ok_or_else(|| OfferError::NotFound(offer_id.to_string()))?;
            if !open.state().can_transition_to(OpenOfferState::Canceled) {
                return Err(OfferError::IllegalTransition {
                    offer_id: offer_id.to_string(),
                    from: open.state(),
                    to: OpenOfferState::Canceled,
                });
            }
            let seq = open.next_sequence_number();
            sign_remove(&self.keypair, open.offer(), seq)
        };

        self.overlay.remove_offer(announcement).await?;

        {
            let mut st = self.state.lock();
            let mut open = st
                .open_offers
                .remove(offer_id)
                .ok_or_else(|| OfferError::NotFound(offer_id.to_string()))?;
            if let Err(e) = open.cancel() {
                st.open_offers.insert(offer_id.to_string(), open);
                return Err(e);
            }
            st.jitter_timers.remove(offer_id);
            st.closed_offers.push(open);
        }
        self.wallet.release_funds(offer_id);
        self.persist();
        info!(offer = offer_id, "offer removed");
        let _ = self.events.send(OfferEvent::Removed {
            offer_id: offer_id.to_string(),
        });
        Ok(())
    }

    /// Bind an available offer to a trade that is being set up.
    pub fn reserve_open_offer(&self, offer_id: &str) -> Result<Offer, OfferError> {
        let offer = {
            let mut st = self.state.lock();
            let open = st
                .open_offers
                .get_mut(offer_id)
                .ok_or_else(|| OfferError::NotFound(offer_id.to_string()))?;
            open.reserve()?;
            open.offer().clone()
        };
        self.persist();
        debug!(offer = offer_id, "offer reserved");
        let _ = self.events.send(OfferEvent::Reserved {
            offer_id: offer_id.to_string(),
        });
        Ok(offer)
    }

    /// The reserved offer's trade is under way: retire it and take it out
    /// of the overlay.
    pub async fn close_open_offer(&self, offer_id: &str) -> Result<(), OfferError> {
        let announcement = {
            let mut st = self.state.lock();
            let mut open = st
                .open_offers
                .remove(offer_id)
                .ok_or_else(|| OfferError::NotFound(offer_id.to_string()))?;
            if let Err(e) = open.close() {
                st.open_offers.insert(offer_id.to_string(), open);
                return Err(e);
            }
            st.jitter_timers.remove(offer_id);
            let seq = open.next_sequence_number();
            let announcement = sign_remove(&self.keypair, open.offer(), seq);
            st.closed_offers.push(open);
            announcement
        };
        self.persist();
        info!(offer = offer_id, "offer closed");
        let _ = self.events.send(OfferEvent::Closed {
            offer_id: offer_id.to_string(),
        });

        if let Err(e) = self.overlay.remove_offer(announcement).await {
            warn!(offer = offer_id, error = %e, "closed offer not removed from overlay");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Availability
    // -----------------------------------------------------------------------

    /// Answer a taker's availability request. Requests without an offer id
    /// or requester key are dropped unanswered. Send failures are logged.
    pub async fn handle_availability_request(&self, request: OfferAvailabilityRequest) {
        if request.offer_id.is_empty() || !request.requester_pub_key.is_present() {
            debug!(peer = %request.sender, "dropping incomplete availability request");
            return;
        }

        let available = {
            let st = self.state.lock();
            !st.stopped
                && st
                    .open_offers
                    .get(&request.offer_id)
                    .is_some_and(|o| o.state() == OpenOfferState::Available)
        };
        debug!(offer = %request.offer_id, peer = %request.sender, available, "availability request");

        let response = OfferAvailabilityResponse {
            offer_id: request.offer_id,
            sender: self.messenger.own_address(),
            available,
            uid: request.uid,
        };
        if let Err(e) = self
            .messenger
            .send_direct(&request.sender, Message::OfferAvailabilityResponse(response))
            .await
        {
            warn!(peer = %request.sender, error = %e, "availability response not delivered");
        }
    }

    // -----------------------------------------------------------------------
    // Republish and refresh
    // -----------------------------------------------------------------------

    pub async fn handle_timer(&self, event: OfferTimerEvent) {
        match event {
            OfferTimerEvent::RepublishAll => self.schedule_republish(),
            OfferTimerEvent::RepublishOffer(offer_id) => self.republish_offer(&offer_id).await,
            OfferTimerEvent::RetryRepublish => {
                self.state.lock().retry_timer.take();
                self.schedule_republish();
            }
            OfferTimerEvent::RepublishAfterReconnect => {
                self.state.lock().after_reconnect_timer.take();
                self.schedule_republish();
            }
            OfferTimerEvent::Refresh => self.refresh_offers().await,
        }
    }

    /// Queue one delayed republish per available offer.
    fn schedule_republish(&self) {
        let mut st = self.state.lock();
        if st.inactive() {
            return;
        }
        let ids: Vec<OfferId> = st
            .open_offers
            .values()
            .filter(|o| o.state() == OpenOfferState::Available)
            .map(|o| o.id().to_string())
            .collect();
        let max_jitter = (self.config.max_jitter().as_millis() as u64).max(1);
        let mut rng = rand::thread_rng();
        for id in ids {
            let delay = Duration::from_millis(rng.gen_range(1..=max_jitter));
            let timer = Timer::once(
                delay,
                self.timer_tx.clone(),
                OfferTimerEvent::RepublishOffer(id.clone()),
            );
            st.jitter_timers.insert(id, timer);
        }
    }

    async fn republish_offer(&self, offer_id: &str) {
        let announcement = {
            let mut st = self.state.lock();
            st.jitter_timers.remove(offer_id);
            if st.inactive() {
                return;
            }
            let Some(open) = st.open_offers.get_mut(offer_id) else {
                return;
            };
            if open.state() != OpenOfferState::Available {
                return;
            }
            let seq = open.next_sequence_number();
            sign_add(&self.keypair, open.offer(), seq)
        };

        match self.overlay.add_offer(announcement).await {
            Ok(()) => {
                debug!(offer = offer_id, "offer republished");
                let mut st = self.state.lock();
                if !st.inactive() && st.refresh_timer.is_none() {
                    st.refresh_timer = Some(Timer::periodic(
                        self.config.refresh_interval(),
                        self.timer_tx.clone(),
                        OfferTimerEvent::Refresh,
                    ));
                }
            }
            Err(e) => {
                warn!(offer = offer_id, error = %e, "republish failed");
                let mut st = self.state.lock();
                if !st.inactive() && st.retry_timer.is_none() {
                    st.retry_timer = Some(Timer::once(
                        self.config.retry_delay(),
                        self.timer_tx.clone(),
                        OfferTimerEvent::RetryRepublish,
                    ));
                }
            }
        }
        self.persist();
    }

    async fn refresh_offers(&self) {
        let refreshes: Vec<_> = {
            let mut st = self.state.lock();
            if st.inactive() {
                return;
            }
            st.open_offers
                .values_mut()
                .filter(|o| o.state() == OpenOfferState::Available)
                .map(|o| {
                    let seq = o.next_sequence_number();
                    sign_refresh(&self.keypair, o.offer(), seq)
                })
                .collect()
        };
        for refresh in refreshes {
            let offer_id = refresh.offer_id.clone();
            if let Err(e) = self.overlay.refresh_offer(refresh).await {
                debug!(offer = %offer_id, error = %e, "refresh failed");
            }
        }
        self.persist();
    }

    fn start_periodic_republish(&self) {
        let mut st = self.state.lock();
        if !st.inactive() && st.republish_timer.is_none() {
            st.republish_timer = Some(Timer::periodic(
                self.config.republish_interval(),
                self.timer_tx.clone(),
                OfferTimerEvent::RepublishAll,
            ));
        }
    }

    // -----------------------------------------------------------------------
    // Connectivity
    // -----------------------------------------------------------------------

    pub fn on_all_connections_lost(&self) {
        let mut st = self.state.lock();
        st.offline = true;
        st.stop_timers();
        info!("offline, offer republishing paused");
    }

    pub fn on_reconnected(&self) {
        {
            let mut st = self.state.lock();
            if st.stopped {
                return;
            }
            st.offline = false;
        }
        info!("back online, republishing offers");
        self.schedule_republish();
        {
            let mut st = self.state.lock();
            st.after_reconnect_timer = Some(Timer::once(
                self.config.after_reconnect_delay(),
                self.timer_tx.clone(),
                OfferTimerEvent::RepublishAfterReconnect,
            ));
        }
        self.start_periodic_republish();
    }

    /// Stop all timers and withdraw available offers from the overlay. The
    /// offers stay open locally and are republished on the next start.
    pub async fn shutdown(&self) {
        let removals: Vec<_> = {
            let mut st = self.state.lock();
            if st.stopped {
                return;
            }
            st.stopped = true;
            st.stop_timers();
            st.open_offers
                .values_mut()
                .filter(|o| o.state() == OpenOfferState::Available)
                .map(|o| {
                    let seq = o.next_sequence_number();
                    sign_remove(&self.keypair, o.offer(), seq)
                })
                .collect()
        };
        for removal in removals {
            if let Err(e) = self.overlay.remove_offer(removal).await {
                debug!(error = %e, "offer not withdrawn at shutdown");
            }
        }
        self.persist();
        info!("offer manager stopped");
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn open_offers(&self) -> Vec<OpenOffer> {
        self.state.lock().open_offers.values().cloned().collect()
    }

    pub fn open_offer(&self, offer_id: &str) -> Option<OpenOffer> {
        self.state.lock().open_offers.get(offer_id).cloned()
    }

    pub fn closed_offers(&self) -> Vec<OpenOffer> {
        self.state.lock().closed_offers.clone()
    }

    pub fn is_republish_running(&self) -> bool {
        self.state
            .lock()
            .republish_timer
            .as_ref()
            .is_some_and(Timer::is_running)
    }

    pub fn is_refresh_running(&self) -> bool {
        self.state
            .lock()
            .refresh_timer
            .as_ref()
            .is_some_and(Timer::is_running)
    }

    fn persist(&self) {
        let (open, closed) = {
            let st = self.state.lock();
            (
                st.open_offers.values().cloned().collect::<Vec<_>>(),
                st.closed_offers.clone(),
            )
        };
        let result = save_collection(self.store.as_ref(), OPEN_OFFERS, &open)
            .and_then(|_| save_collection(self.store.as_ref(), CLOSED_OFFERS, &closed));
        if let Err(e) = result {
            error!(error = %e, "failed to persist offers");
        }
    }
}
