//! # Offer Book
//!
//! What this node knows about other makers' offers, as learned from the
//! overlay. Entries expire unless the maker keeps refreshing them, so an
//! offer whose maker went offline without removing it disappears after one
//! TTL.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::overlay::verify_record;
use super::types::{Offer, OfferId, OfferState};
use crate::events::OfferEvent;
use crate::network::{AddOfferMessage, RefreshOfferMessage, RemoveOfferMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookUpdate {
    Added,
    /// A newer announcement of a known offer.
    Renewed,
    /// Sequence number not newer than what we have.
    Stale,
    Rejected,
}

#[derive(Debug)]
struct BookEntry {
    offer: Offer,
    sequence_number: u64,
    expires_at: Instant,
}

pub struct OfferBook {
    entries: Mutex<HashMap<OfferId, BookEntry>>,
    ttl: Duration,
    events: broadcast::Sender<OfferEvent>,
}

impl OfferBook {
    pub fn new(ttl: Duration, events: broadcast::Sender<OfferEvent>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            events,
        }
    }

    pub fn handle_add(&self, message: AddOfferMessage, now: Instant) -> BookUpdate {
        let AddOfferMessage {
            mut offer,
            sequence_number,
            signature,
        } = message;

        if !verify_record(offer.maker_pub_key(), &offer.hash(), sequence_number, &signature) {
            warn!(offer = offer.id(), "offer announcement with bad signature");
            return BookUpdate::Rejected;
        }
        if offer.validate().is_err() {
            warn!(offer = offer.id(), "malformed offer announcement");
            return BookUpdate::Rejected;
        }

        let id = offer.id().to_string();
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&id) {
            if sequence_number <= entry.sequence_number || entry.offer != offer {
                return BookUpdate::Stale;
            }
            entry.sequence_number = sequence_number;
            entry.expires_at = now + self.ttl;
            return BookUpdate::Renewed;
        }

        offer.set_state(OfferState::Available);
        entries.insert(
            id.clone(),
            BookEntry {
                offer,
                sequence_number,
                expires_at: now + self.ttl,
            },
        );
        drop(entries);
        debug!(offer = %id, "offer added to book");
        let _ = self.events.send(OfferEvent::BookAdded { offer_id: id });
        BookUpdate::Added
    }

    /// Extend an entry's lifetime. Returns `false` if the refresh was
    /// ignored.
    pub fn handle_refresh(&self, message: &RefreshOfferMessage, now: Instant) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&message.offer_id) else {
            return false;
        };
        if message.sequence_number <= entry.sequence_number
            || message.offer_hash != entry.offer.hash()
            || !verify_record(
                entry.offer.maker_pub_key(),
                &message.offer_hash,
                message.sequence_number,
                &message.signature,
            )
        {
            return false;
        }
        entry.sequence_number = message.sequence_number;
        entry.expires_at = now + self.ttl;
        true
    }

    pub fn handle_remove(&self, message: &RemoveOfferMessage) -> bool {
        let mut entries = self.entries.lock();
        let valid = entries.get(&message.offer_id).is_some_and(|entry| {
            message.sequence_number > entry.sequence_number
                && message.offer_hash == entry.offer.hash()
                && verify_record(
                    entry.offer.maker_pub_key(),
                    &message.offer_hash,
                    message.sequence_number,
                    &message.signature,
                )
        });
        if valid {
            entries.remove(&message.offer_id);
            drop(entries);
            let _ = self.events.send(OfferEvent::BookRemoved {
                offer_id: message.offer_id.clone(),
            });
        }
        valid
    }

    /// Drop entries whose TTL ran out. Returns the ids removed.
    pub fn expire(&self, now: Instant) -> Vec<OfferId> {
        let mut expired = Vec::new();
        self.entries.lock().retain(|id, entry| {
            let keep = entry.expires_at > now;
            if !keep {
                expired.push(id.clone());
            }
            keep
        });
        for id in &expired {
            debug!(offer = %id, "offer expired from book");
            let _ = self.events.send(OfferEvent::BookRemoved {
                offer_id: id.clone(),
            });
        }
        expired
    }

    pub fn get(&self, offer_id: &str) -> Option<Offer> {
        self.entries.lock().get(offer_id).map(|e| e.offer.clone())
    }

    pub fn offers(&self) -> Vec<Offer> {
        self.entries.lock().values().map(|e| e.offer.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Record what a taker learned about an offer (unavailable, maker
    /// offline). No-op for offers not in the book.
    pub fn set_state(&self, offer_id: &str, state: OfferState) {
        if let Some(entry) = self.entries.lock().get_mut(offer_id) {
            entry.offer.set_state(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offer::overlay::{sign_add, sign_refresh, sign_remove};
    use crate::offer::test_support::{maker_keypair, sample_offer};

    fn book() -> OfferBook {
        let (tx, _) = broadcast::channel(16);
        OfferBook::new(Duration::from_secs(60), tx)
    }

    #[test]
    fn add_then_expire() {
        let book = book();
        let kp = maker_keypair();
        let now = Instant::now();
        assert_eq!(
            book.handle_add(sign_add(&kp, &sample_offer("o-1"), 1), now),
            BookUpdate::Added
        );
        assert_eq!(book.get("o-1").unwrap().state(), OfferState::Available);

        assert!(book.expire(now + Duration::from_secs(30)).is_empty());
        assert_eq!(book.expire(now + Duration::from_secs(61)), vec!["o-1".to_string()]);
        assert!(book.is_empty());
    }

    #[test]
    fn refresh_extends_lifetime() {
        let book = book();
        let kp = maker_keypair();
        let offer = sample_offer("o-1");
        let now = Instant::now();
        book.handle_add(sign_add(&kp, &offer, 1), now);

        let later = now + Duration::from_secs(50);
        assert!(book.handle_refresh(&sign_refresh(&kp, &offer, 2), later));
        // Replay of the same refresh is ignored.
        assert!(!book.handle_refresh(&sign_refresh(&kp, &offer, 2), later));

        assert!(book.expire(now + Duration::from_secs(100)).is_empty());
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn forged_announcements_are_rejected() {
        let book = book();
        let offer = sample_offer("o-1");
        let forged = sign_add(&crate::crypto::NodeKeypair::generate(), &offer, 1);
        assert_eq!(book.handle_add(forged, Instant::now()), BookUpdate::Rejected);
        assert!(book.is_empty());
    }

    #[test]
    fn remove_requires_newer_sequence() {
        let book = book();
        let kp = maker_keypair();
        let offer = sample_offer("o-1");
        book.handle_add(sign_add(&kp, &offer, 5), Instant::now());

        assert!(!book.handle_remove(&sign_remove(&kp, &offer, 5)));
        assert!(book.handle_remove(&sign_remove(&kp, &offer, 6)));
        assert!(book.get("o-1").is_none());
    }

    #[test]
    fn newer_add_renews_and_older_is_stale() {
        let book = book();
        let kp = maker_keypair();
        let offer = sample_offer("o-1");
        let now = Instant::now();
        book.handle_add(sign_add(&kp, &offer, 2), now);
        assert_eq!(book.handle_add(sign_add(&kp, &offer, 1), now), BookUpdate::Stale);
        assert_eq!(book.handle_add(sign_add(&kp, &offer, 3), now), BookUpdate::Renewed);
    }
}
