//! Per-IP reconnect throttling for the account entry point.

use crate::config::ThrottleConfig;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Reconnected before the minimum interval ran out; the address is now
    /// blocked.
    TooFast,
    Blocked,
    Full,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::TooFast => write!(f, "reconnected too fast"),
            Rejection::Blocked => write!(f, "address is blocked"),
            Rejection::Full => write!(f, "connection limit reached"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    Reject(Rejection),
}

#[derive(Debug)]
pub struct ConnectionThrottle {
    min_interval: Duration,
    block_duration: Duration,
    last_attempt: HashMap<IpAddr, Instant>,
    blocked: HashMap<IpAddr, Instant>,
}

impl ConnectionThrottle {
    pub fn new(min_interval: Duration, block_duration: Duration) -> Self {
        Self {
            min_interval,
            block_duration,
            last_attempt: HashMap::new(),
            blocked: HashMap::new(),
        }
    }

    pub fn from_config(config: &ThrottleConfig) -> Self {
        Self::new(config.min_interval(), config.block_duration())
    }

    /// Decides on one connection attempt from `ip` at `now`.
    ///
    /// Attempts from a blocked address are rejected without touching the
    /// last-attempt time. Only accepted attempts move it forward.
    pub fn check(&mut self, ip: IpAddr, now: Instant) -> Admission {
        if let Some(&until) = self.blocked.get(&ip) {
            if now < until {
                return Admission::Reject(Rejection::Blocked);
            }
            self.blocked.remove(&ip);
        }

        if let Some(&last) = self.last_attempt.get(&ip) {
            if now.saturating_duration_since(last) < self.min_interval {
                self.blocked.insert(ip, now + self.block_duration);
                return Admission::Reject(Rejection::TooFast);
            }
        }

        self.last_attempt.insert(ip, now);
        Admission::Accept
    }

    pub fn is_blocked(&self, ip: IpAddr, now: Instant) -> bool {
        self.blocked.get(&ip).map_or(false, |&until| now < until)
    }

    pub fn last_attempt(&self, ip: IpAddr) -> Option<Instant> {
        self.last_attempt.get(&ip).copied()
    }

    /// Evicts expired blocks and attempt records too old to matter. Returns
    /// how many blocks were lifted.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.blocked.len();
        self.blocked.retain(|_, until| now < *until);
        let min_interval = self.min_interval;
        self.last_attempt
            .retain(|_, last| now.saturating_duration_since(*last) < min_interval);
        before - self.blocked.len()
    }

    pub fn blocked_count(&self) -> usize {
        self.blocked.len()
    }
}
