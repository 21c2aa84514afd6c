//! Rule violations and per-connection tolerance accounting.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Protocol misbehaviour a peer can be charged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleViolation {
    MaxMsgSizeExceeded,
    ThrottleLimitExceeded,
    /// Undecodable payload or unknown message type.
    InvalidDataType,
    /// Protocol version mismatch.
    WrongNetworkId,
    /// A direct message claimed a sender different from the one already
    /// bound to the connection.
    PeerAddressMismatch,
}

impl RuleViolation {
    /// How many occurrences are forgiven. The connection closes on the next.
    pub fn max_tolerance(self) -> u32 {
        match self {
            RuleViolation::MaxMsgSizeExceeded => 2,
            RuleViolation::ThrottleLimitExceeded => 2,
            RuleViolation::InvalidDataType => 0,
            RuleViolation::WrongNetworkId => 0,
            RuleViolation::PeerAddressMismatch => 0,
        }
    }
}

impl fmt::Display for RuleViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuleViolation::MaxMsgSizeExceeded => "MAX_MSG_SIZE_EXCEEDED",
            RuleViolation::ThrottleLimitExceeded => "THROTTLE_LIMIT_EXCEEDED",
            RuleViolation::InvalidDataType => "INVALID_DATA_TYPE",
            RuleViolation::WrongNetworkId => "WRONG_NETWORK_ID",
            RuleViolation::PeerAddressMismatch => "PEER_ADDRESS_MISMATCH",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Tolerated { count: u32 },
    Exceeded { count: u32 },
}

/// Violation counters for one connection.
#[derive(Debug, Default)]
pub struct ViolationLedger {
    counts: HashMap<RuleViolation, u32>,
    exceeded: Option<RuleViolation>,
}

impl ViolationLedger {
    pub fn record(&mut self, violation: RuleViolation) -> Verdict {
        let count = self.counts.entry(violation).or_insert(0);
        *count += 1;
        let count = *count;
        if count > violation.max_tolerance() {
            self.exceeded.get_or_insert(violation);
            Verdict::Exceeded { count }
        } else {
            Verdict::Tolerated { count }
        }
    }

    pub fn count(&self, violation: RuleViolation) -> u32 {
        self.counts.get(&violation).copied().unwrap_or(0)
    }

    /// The first violation that went over its tolerance, if any.
    pub fn exceeded(&self) -> Option<RuleViolation> {
        self.exceeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_messages_close_on_the_third() {
        let mut ledger = ViolationLedger::default();
        assert_eq!(
            ledger.record(RuleViolation::MaxMsgSizeExceeded),
            Verdict::Tolerated { count: 1 }
        );
        assert_eq!(
            ledger.record(RuleViolation::MaxMsgSizeExceeded),
            Verdict::Tolerated { count: 2 }
        );
        assert_eq!(
            ledger.record(RuleViolation::MaxMsgSizeExceeded),
            Verdict::Exceeded { count: 3 }
        );
        assert_eq!(ledger.exceeded(), Some(RuleViolation::MaxMsgSizeExceeded));
    }

    #[test]
    fn zero_tolerance_kinds_close_immediately() {
        for kind in [
            RuleViolation::InvalidDataType,
            RuleViolation::WrongNetworkId,
            RuleViolation::PeerAddressMismatch,
        ] {
            let mut ledger = ViolationLedger::default();
            assert_eq!(ledger.record(kind), Verdict::Exceeded { count: 1 });
        }
    }

    #[test]
    fn kinds_are_counted_separately() {
        let mut ledger = ViolationLedger::default();
        ledger.record(RuleViolation::ThrottleLimitExceeded);
        ledger.record(RuleViolation::MaxMsgSizeExceeded);
        ledger.record(RuleViolation::ThrottleLimitExceeded);
        assert_eq!(ledger.count(RuleViolation::ThrottleLimitExceeded), 2);
        assert_eq!(ledger.count(RuleViolation::MaxMsgSizeExceeded), 1);
        assert_eq!(ledger.exceeded(), None);
    }
}
