//! Inbound rate limiting.
//!
//! A connection may deliver at most `short_limit` messages per short window
//! and `long_limit` per long window. A message that would break either
//! limit is refused and never admitted. The first refusal is reported as a
//! violation; further refusals stay quiet until the broken window has slid
//! past the report, so a single flood costs the peer one strike.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::NetworkConfig;

/// What the window decided about one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Over a limit, already reported for this window.
    Refused,
    /// Over a limit; report it.
    Violation,
}

impl Admission {
    pub fn is_admitted(self) -> bool {
        self == Admission::Admitted
    }
}

#[derive(Debug)]
pub struct ThrottleWindow {
    admitted: VecDeque<Instant>,
    short_limit: usize,
    short_window: Duration,
    long_limit: usize,
    long_window: Duration,
    quiet_until: Option<Instant>,
}

impl ThrottleWindow {
    pub fn new(config: &NetworkConfig) -> Self {
        Self::with_limits(
            config.throttle_short_limit,
            Duration::from_millis(config.throttle_short_window_ms),
            config.throttle_long_limit,
            Duration::from_millis(config.throttle_long_window_ms),
        )
    }

    pub fn with_limits(
        short_limit: usize,
        short_window: Duration,
        long_limit: usize,
        long_window: Duration,
    ) -> Self {
        Self {
            admitted: VecDeque::with_capacity(long_limit.min(1024)),
            short_limit,
            short_window,
            long_limit,
            long_window,
            quiet_until: None,
        }
    }

    /// Account for a message arriving at `now`.
    pub fn admit(&mut self, now: Instant) -> Admission {
        while let Some(&oldest) = self.admitted.front() {
            if now.saturating_duration_since(oldest) >= self.long_window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }

        let in_short_window = self
            .admitted
            .iter()
            .rev()
            .take_while(|&&t| now.saturating_duration_since(t) < self.short_window)
            .count();

        let broken = if in_short_window >= self.short_limit {
            Some(self.short_window)
        } else if self.admitted.len() >= self.long_limit {
            Some(self.long_window)
        } else {
            None
        };

        if let Some(window) = broken {
            if self.quiet_until.is_some_and(|until| now < until) {
                return Admission::Refused;
            }
            self.quiet_until = Some(now + window);
            return Admission::Violation;
        }

        self.admitted.push_back(now);
        while self.admitted.len() > self.long_limit {
            self.admitted.pop_front();
        }
        Admission::Admitted
    }

    pub fn len(&self) -> usize {
        self.admitted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.admitted.is_empty()
    }
}
