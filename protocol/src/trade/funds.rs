//! How much of the wallet a trade ties up.
//!
//! Every party locks its security deposit plus a fee allowance for the
//! deposit and the payout transaction. The seller additionally locks the
//! traded amount itself.

/// Funds a trader must have available to enter a trade of `amount`.
pub fn funds_needed_for_trade(is_seller: bool, amount: u64, security_deposit: u64, tx_fee: u64) -> u64 {
    let base = security_deposit.saturating_add(tx_fee.saturating_mul(2));
    if is_seller {
        base.saturating_add(amount)
    } else {
        base
    }
}
