//! # Payment Accounts
//!
//! The counter-currency side of a trade happens outside Bazaar, over a bank
//! transfer or a payment service. A [`PaymentAccount`] describes where a
//! trader can send or receive that payment; offers name the method and the
//! constraints (countries, banks) a taker's account has to satisfy.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::offer::Offer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentMethod {
    Sepa,
    SepaInstant,
    NationalBank,
    SameBank,
    SpecificBanks,
    Revolut,
    Zelle,
    CashDeposit,
}

impl PaymentMethod {
    /// Methods whose offers restrict which banks a taker may use.
    pub fn is_bank_restricted(self) -> bool {
        matches!(self, PaymentMethod::SameBank | PaymentMethod::SpecificBanks)
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PaymentMethod::Sepa => "SEPA",
            PaymentMethod::SepaInstant => "SEPA_INSTANT",
            PaymentMethod::NationalBank => "NATIONAL_BANK",
            PaymentMethod::SameBank => "SAME_BANK",
            PaymentMethod::SpecificBanks => "SPECIFIC_BANKS",
            PaymentMethod::Revolut => "REVOLUT",
            PaymentMethod::Zelle => "ZELLE",
            PaymentMethod::CashDeposit => "CASH_DEPOSIT",
        };
        f.write_str(name)
    }
}

/// A trader's account for the counter-currency leg.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaymentAccount {
    pub id: String,
    pub method: PaymentMethod,
    pub holder_name: String,
    /// ISO 4217 codes this account can pay or receive.
    pub currencies: Vec<String>,
    pub country_code: Option<String>,
    pub bank_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaymentMismatch {
    #[error("payment method {account} does not match offer method {offer}")]
    Method {
        account: PaymentMethod,
        offer: PaymentMethod,
    },

    #[error("account does not support currency {0}")]
    Currency(String),

    #[error("account country {0:?} is not accepted by the offer")]
    Country(Option<String>),

    #[error("account bank {0:?} is not accepted by the offer")]
    Bank(Option<String>),
}

impl PaymentAccount {
    pub fn supports_currency(&self, code: &str) -> bool {
        self.currencies.iter().any(|c| c.eq_ignore_ascii_case(code))
    }

    /// Whether this account can settle `offer`.
    pub fn check_compatible(&self, offer: &Offer) -> Result<(), PaymentMismatch> {
        let payload = offer.payload();
        if self.method != payload.payment_method {
            return Err(PaymentMismatch::Method {
                account: self.method,
                offer: payload.payment_method,
            });
        }

        if !self.supports_currency(&payload.counter_currency) {
            return Err(PaymentMismatch::Currency(payload.counter_currency.clone()));
        }

        if let Some(countries) = &payload.accepted_country_codes {
            let accepted = self
                .country_code
                .as_ref()
                .is_some_and(|cc| countries.iter().any(|c| c.eq_ignore_ascii_case(cc)));
            if !accepted {
                return Err(PaymentMismatch::Country(self.country_code.clone()));
            }
        }

        if payload.payment_method.is_bank_restricted() {
            if let Some(banks) = &payload.accepted_bank_ids {
                let accepted = self
                    .bank_id
                    .as_ref()
                    .is_some_and(|id| banks.contains(id));
                if !accepted {
                    return Err(PaymentMismatch::Bank(self.bank_id.clone()));
                }
            }
        }
        Ok(())
    }
}
