use std::time::Duration;

use tabsync_core::{Version, validate_version};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaDecision {
    Apply,
    Duplicate,
    AwaitingSnapshot,
    Gap { expected: Version, got: Version },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempt: u32 },
    GaveUp { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingRequest {
    attempt: u32,
    timeout: Duration,
    deadline: Instant,
}

#[derive(Debug, Clone)]
pub struct Replica {
    last_applied: Option<Version>,
    highest_seen: Version,
    pending: Option<PendingRequest>,
    base_timeout: Duration,
    max_attempts: u32,
}

impl Replica {
    pub fn new(base_timeout: Duration, max_attempts: u32) -> Self {
        Self {
            last_applied: None,
            highest_seen: 0,
            pending: None,
            base_timeout,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn last_applied(&self) -> Option<Version> {
        self.last_applied
    }

    pub fn highest_seen(&self) -> Version {
        self.highest_seen.max(self.last_applied.unwrap_or(0))
    }

    pub fn classify_delta(&mut self, version: Version) -> DeltaDecision {
        self.highest_seen = self.highest_seen.max(version);
        match self.last_applied {
            None => DeltaDecision::AwaitingSnapshot,
            Some(last) if version == last + 1 => DeltaDecision::Apply,
            Some(last) if version <= last => DeltaDecision::Duplicate,
            Some(last) => DeltaDecision::Gap {
                expected: last + 1,
                got: version,
            },
        }
    }

    /// Decides whether a snapshot response may be applied. Any response ends
    /// the pending request, since it proves a master is answering.
    pub fn accept_snapshot(&mut self, version: Version) -> bool {
        self.pending = None;
        self.highest_seen = self.highest_seen.max(version);
        validate_version(self.last_applied, version).is_ok()
    }

    pub fn mark_applied(&mut self, version: Version) {
        self.last_applied = Some(version);
        self.highest_seen = self.highest_seen.max(version);
    }

    pub fn begin_request(&mut self, now: Instant) -> Option<u32> {
        if self.pending.is_some() {
            return None;
        }
        self.pending = Some(PendingRequest {
            attempt: 1,
            timeout: self.base_timeout,
            deadline: now + self.base_timeout,
        });
        Some(1)
    }

    pub fn on_request_timeout(&mut self, now: Instant) -> RetryDecision {
        let Some(pending) = self.pending else {
            return RetryDecision::GaveUp { attempts: 0 };
        };
        if pending.attempt >= self.max_attempts {
            self.pending = None;
            return RetryDecision::GaveUp {
                attempts: pending.attempt,
            };
        }
        let timeout = pending.timeout.saturating_mul(2);
        let attempt = pending.attempt + 1;
        self.pending = Some(PendingRequest {
            attempt,
            timeout,
            deadline: now + timeout,
        });
        RetryDecision::Retry { attempt }
    }

    pub fn cancel_request(&mut self) {
        self.pending = None;
    }

    pub fn is_requesting(&self) -> bool {
        self.pending.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.map(|pending| pending.deadline)
    }
}
