//! # In-Memory Wallet
//!
//! A wallet with a single balance and no chain behind it. Transactions are
//! opaque byte blobs with BLAKE3-derived ids. Deposit confirmations are
//! produced either on demand ([`InMemoryWallet::confirm_deposit`]) or
//! automatically after a delay, which is how development nodes run.
//!
//! ## Accounting
//!
//! ```text
//! available = balance - sum(reservations)
//! ```
//!
//! Fees are deducted from `balance` when paid. Reservations are released
//! when an offer is canceled, a trade fails, or a trade's entry is swapped
//! back to available.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{AddressContext, PublishedTx, WalletError, WalletEvent, WalletService};
use crate::crypto::{blake3_hash, sha256};

#[derive(Debug, Default)]
struct WalletState {
    balance: u64,
    reservations: HashMap<String, u64>,
    entries: HashMap<(String, AddressContext), String>,
    next_index: u64,
    watched: HashMap<String, String>,
    fail_next_publish: bool,
}

impl WalletState {
    fn available(&self) -> u64 {
        let reserved: u64 = self.reservations.values().sum();
        self.balance.saturating_sub(reserved)
    }

    fn entry(&mut self, trade_id: &str, context: AddressContext) -> String {
        let key = (trade_id.to_string(), context);
        if let Some(address) = self.entries.get(&key) {
            return address.clone();
        }
        self.next_index += 1;
        let digest = hex::encode(blake3_hash(&self.next_index.to_be_bytes()));
        let address = format!("bz1q{}", &digest[..38]);
        self.entries.insert(key, address.clone());
        address
    }
}

pub struct InMemoryWallet {
    state: Mutex<WalletState>,
    events: mpsc::UnboundedSender<WalletEvent>,
    auto_confirm: Option<Duration>,
}

impl InMemoryWallet {
    pub fn new(balance: u64) -> (Self, mpsc::UnboundedReceiver<WalletEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let wallet = Self {
            state: Mutex::new(WalletState {
                balance,
                ..WalletState::default()
            }),
            events,
            auto_confirm: None,
        };
        (wallet, rx)
    }

    /// Confirm watched deposits on their own after `delay`.
    pub fn with_auto_confirm(mut self, delay: Duration) -> Self {
        self.auto_confirm = Some(delay);
        self
    }

    pub fn balance(&self) -> u64 {
        self.state.lock().balance
    }

    pub fn reserved_for(&self, reference_id: &str) -> u64 {
        self.state
            .lock()
            .reservations
            .get(reference_id)
            .copied()
            .unwrap_or(0)
    }

    /// Report one confirmation of the deposit watched for `trade_id`.
    /// Returns `false` if nothing is being watched.
    pub fn confirm_deposit(&self, trade_id: &str) -> bool {
        let Some(tx_id) = self.state.lock().watched.get(trade_id).cloned() else {
            return false;
        };
        self.events
            .send(WalletEvent::DepositConfirmed {
                trade_id: trade_id.to_string(),
                tx_id,
                confirmations: 1,
            })
            .is_ok()
    }

    /// Make the next fee, deposit or payout broadcast fail.
    pub fn fail_next_publish(&self) {
        self.state.lock().fail_next_publish = true;
    }

    fn tx(kind: &str, trade_id: &str, payload: &[u8]) -> PublishedTx {
        let mut raw = Vec::with_capacity(kind.len() + trade_id.len() + payload.len());
        raw.extend_from_slice(kind.as_bytes());
        raw.extend_from_slice(trade_id.as_bytes());
        raw.extend_from_slice(payload);
        PublishedTx {
            tx_id: hex::encode(sha256(&raw)),
            raw,
        }
    }

    fn check_publish(&self) -> Result<(), WalletError> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_publish) {
            return Err(WalletError::TransactionRejected("broadcast refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl WalletService for InMemoryWallet {
    fn available_balance(&self) -> u64 {
        self.state.lock().available()
    }

    async fn pay_trade_fee(&self, reference_id: &str, fee: u64) -> Result<String, WalletError> {
        self.check_publish()?;
        let mut state = self.state.lock();
        let available = state.available();
        if fee > available {
            return Err(WalletError::InsufficientFunds {
                needed: fee,
                available,
            });
        }
        state.balance -= fee;
        let tx = Self::tx("fee", reference_id, &fee.to_be_bytes());
        debug!(reference = reference_id, fee, tx = %tx.tx_id, "fee paid");
        Ok(tx.tx_id)
    }

    fn reserve_funds(&self, reference_id: &str, amount: u64) -> Result<(), WalletError> {
        let mut state = self.state.lock();
        let already = state.reservations.get(reference_id).copied().unwrap_or(0);
        let available = state.available() + already;
        if amount > available {
            return Err(WalletError::InsufficientFunds {
                needed: amount,
                available,
            });
        }
        state.reservations.insert(reference_id.to_string(), amount);
        Ok(())
    }

    fn release_funds(&self, reference_id: &str) -> u64 {
        self.state
            .lock()
            .reservations
            .remove(reference_id)
            .unwrap_or(0)
    }

    fn payout_address(&self, trade_id: &str) -> String {
        self.state.lock().entry(trade_id, AddressContext::TradePayout)
    }

    async fn prepare_deposit_tx(
        &self,
        trade_id: &str,
        contribution: u64,
    ) -> Result<Vec<u8>, WalletError> {
        let mut state = self.state.lock();
        let held = state.reservations.get(trade_id).copied().unwrap_or(0);
        if held < contribution {
            return Err(WalletError::InsufficientFunds {
                needed: contribution,
                available: held,
            });
        }
        let multisig = state.entry(trade_id, AddressContext::MultiSig);
        let mut prepared = multisig.into_bytes();
        prepared.extend_from_slice(&contribution.to_be_bytes());
        Ok(prepared)
    }

    async fn publish_deposit_tx(
        &self,
        trade_id: &str,
        prepared: &[u8],
    ) -> Result<PublishedTx, WalletError> {
        self.check_publish()?;
        let tx = Self::tx("deposit", trade_id, prepared);
        info!(trade = trade_id, tx = %tx.tx_id, "deposit published");
        Ok(tx)
    }

    fn watch_deposit(&self, trade_id: &str, tx_id: &str) {
        self.state
            .lock()
            .watched
            .insert(trade_id.to_string(), tx_id.to_string());

        if let Some(delay) = self.auto_confirm {
            let events = self.events.clone();
            let trade_id = trade_id.to_string();
            let tx_id = tx_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = events.send(WalletEvent::DepositConfirmed {
                    trade_id,
                    tx_id,
                    confirmations: 1,
                });
            });
        }
    }

    fn sign_payout_tx(&self, trade_id: &str) -> Result<Vec<u8>, WalletError> {
        let state = self.state.lock();
        let Some(deposit) = state.watched.get(trade_id) else {
            return Err(WalletError::TransactionRejected(format!(
                "no deposit known for {trade_id}"
            )));
        };
        Ok(blake3_hash(deposit.as_bytes()).to_vec())
    }

    async fn publish_payout_tx(
        &self,
        trade_id: &str,
        seller_signature: &[u8],
    ) -> Result<PublishedTx, WalletError> {
        self.check_publish()?;
        if seller_signature.is_empty() {
            return Err(WalletError::TransactionRejected("missing seller signature".into()));
        }
        let tx = Self::tx("payout", trade_id, seller_signature);
        info!(trade = trade_id, tx = %tx.tx_id, "payout published");
        Ok(tx)
    }

    fn swap_trade_entry_to_available(&self, trade_id: &str, context: AddressContext) {
        let mut state = self.state.lock();
        if let Some(address) = state.entries.remove(&(trade_id.to_string(), context)) {
            state
                .entries
                .insert((address.clone(), AddressContext::Available), address);
        }
        state.reservations.remove(trade_id);
        state.watched.remove(trade_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reservations_reduce_available_balance() {
        let (wallet, _rx) = InMemoryWallet::new(1_000);
        wallet.reserve_funds("offer-1", 400).unwrap();
        assert_eq!(wallet.available_balance(), 600);
        assert!(matches!(
            wallet.reserve_funds("offer-2", 700),
            Err(WalletError::InsufficientFunds { needed: 700, available: 600 })
        ));
        assert_eq!(wallet.release_funds("offer-1"), 400);
        assert_eq!(wallet.available_balance(), 1_000);
    }

    #[tokio::test]
    async fn fees_come_out_of_the_balance() {
        let (wallet, _rx) = InMemoryWallet::new(100);
        wallet.pay_trade_fee("offer-1", 30).await.unwrap();
        assert_eq!(wallet.balance(), 70);
        assert!(wallet.pay_trade_fee("offer-1", 71).await.is_err());
    }

    #[tokio::test]
    async fn confirm_reports_watched_deposit() {
        let (wallet, mut rx) = InMemoryWallet::new(100);
        assert!(!wallet.confirm_deposit("t-1"));
        wallet.watch_deposit("t-1", "abc");
        assert!(wallet.confirm_deposit("t-1"));
        assert_eq!(
            rx.recv().await,
            Some(WalletEvent::DepositConfirmed {
                trade_id: "t-1".into(),
                tx_id: "abc".into(),
                confirmations: 1
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn auto_confirm_after_delay() {
        let (wallet, mut rx) = InMemoryWallet::new(100);
        let wallet = wallet.with_auto_confirm(Duration::from_secs(10));
        wallet.watch_deposit("t-1", "abc");
        assert!(matches!(rx.recv().await, Some(WalletEvent::DepositConfirmed { .. })));
    }

    #[tokio::test]
    async fn publish_failure_is_one_shot() {
        let (wallet, _rx) = InMemoryWallet::new(100);
        wallet.fail_next_publish();
        assert!(wallet.publish_deposit_tx("t-1", b"x").await.is_err());
        assert!(wallet.publish_deposit_tx("t-1", b"x").await.is_ok());
    }

    #[tokio::test]
    async fn payout_address_is_stable_per_trade() {
        let (wallet, _rx) = InMemoryWallet::new(100);
        let a = wallet.payout_address("t-1");
        assert_eq!(a, wallet.payout_address("t-1"));
        assert_ne!(a, wallet.payout_address("t-2"));
    }
}
