//! Software timer facility.
//!
//! Entries are kept in a `BTreeMap` keyed by `(deadline, seq)`, so the first
//! key is always the next deadline to fire and any entry can be removed in
//! O(log n) through the [`TimerToken`] returned when it was scheduled.
//! Entries may be tagged with the [`ConnToken`] of the connection that owns
//! them; tearing a connection down purges its timers through a per-owner
//! index instead of scanning the whole queue.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use tracing::{error, trace};

use crate::error::TimerError;
use crate::handler::ConnToken;
use crate::metrics;

/// Wait returned by [`TimerFacility::next_deadline_delta`] when nothing is
/// scheduled and the caller supplied no bound.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(30);

/// Horizon used in place of deadlines that would overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// A scheduled action. Receives the facility so it can reschedule itself.
pub type TimerCallback = Box<dyn FnOnce(&mut TimerFacility) -> Result<(), TimerError>>;

/// Cancellation handle for a scheduled timer.
///
/// Ordered by deadline, then by scheduling order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerToken {
    deadline: Instant,
    seq: u64,
}

impl TimerToken {
    /// When the timer becomes eligible to fire.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

struct TimerEntry {
    owner: Option<ConnToken>,
    callback: TimerCallback,
}

/// Priority queue of `(deadline, callback)` entries.
pub struct TimerFacility {
    entries: BTreeMap<TimerToken, TimerEntry>,
    /// Owner → pending tokens, for teardown purges.
    owned: HashMap<ConnToken, BTreeSet<TimerToken>>,
    next_seq: u64,
    fallback_wait: Duration,
    /// Transports whose callbacks asked to be re-dialed.
    reconnects: Vec<ConnToken>,
}

impl Default for TimerFacility {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerFacility {
    pub fn new() -> Self {
        Self::with_fallback_wait(DEFAULT_WAIT)
    }

    /// Create a facility whose empty-queue wait is `fallback_wait` instead of
    /// [`DEFAULT_WAIT`].
    pub fn with_fallback_wait(fallback_wait: Duration) -> Self {
        TimerFacility {
            entries: BTreeMap::new(),
            owned: HashMap::new(),
            next_seq: 0,
            fallback_wait,
            reconnects: Vec::new(),
        }
    }

    /// Schedule `callback` to run at `deadline`.
    pub fn schedule_at<F>(&mut self, deadline: Instant, callback: F) -> TimerToken
    where
        F: FnOnce(&mut TimerFacility) -> Result<(), TimerError> + 'static,
    {
        self.insert(deadline, None, Box::new(callback))
    }

    /// Schedule `callback` to run `delay` from now.
    pub fn schedule_after<F>(&mut self, delay: Duration, callback: F) -> TimerToken
    where
        F: FnOnce(&mut TimerFacility) -> Result<(), TimerError> + 'static,
    {
        self.schedule_at(deadline_after(Instant::now(), delay), callback)
    }

    /// Schedule a timer owned by `owner`. It is purged when the owner's
    /// transport is torn down.
    pub fn schedule_at_for<F>(&mut self, owner: ConnToken, deadline: Instant, callback: F) -> TimerToken
    where
        F: FnOnce(&mut TimerFacility) -> Result<(), TimerError> + 'static,
    {
        self.insert(deadline, Some(owner), Box::new(callback))
    }

    /// Relative variant of [`schedule_at_for`](Self::schedule_at_for).
    pub fn schedule_after_for<F>(&mut self, owner: ConnToken, delay: Duration, callback: F) -> TimerToken
    where
        F: FnOnce(&mut TimerFacility) -> Result<(), TimerError> + 'static,
    {
        self.schedule_at_for(owner, deadline_after(Instant::now(), delay), callback)
    }

    fn insert(&mut self, deadline: Instant, owner: Option<ConnToken>, callback: TimerCallback) -> TimerToken {
        let token = TimerToken {
            deadline,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        if let Some(owner) = owner {
            self.owned.entry(owner).or_default().insert(token);
        }
        self.entries.insert(token, TimerEntry { owner, callback });
        token
    }

    /// Cancel a pending timer. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, token: TimerToken) -> bool {
        match self.entries.remove(&token) {
            Some(entry) => {
                if let Some(owner) = entry.owner {
                    self.unlink_owner(owner, token);
                }
                true
            }
            None => false,
        }
    }

    /// Cancel every pending timer owned by `owner`. Returns how many were removed.
    pub fn cancel_owned_by(&mut self, owner: ConnToken) -> usize {
        let Some(tokens) = self.owned.remove(&owner) else {
            return 0;
        };
        let mut removed = 0;
        for token in tokens {
            if self.entries.remove(&token).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            trace!(token = ?owner, removed, "purged owned timers");
        }
        removed
    }

    fn unlink_owner(&mut self, owner: ConnToken, token: TimerToken) {
        if let Some(set) = self.owned.get_mut(&owner) {
            set.remove(&token);
            if set.is_empty() {
                self.owned.remove(&owner);
            }
        }
    }

    /// Pop the earliest entry if its deadline is at or before `cutoff`.
    fn pop_due(&mut self, cutoff: Instant) -> Option<(TimerToken, TimerEntry)> {
        let (&token, _) = self.entries.first_key_value()?;
        if token.deadline > cutoff {
            return None;
        }
        let entry = self.entries.remove(&token)?;
        if let Some(owner) = entry.owner {
            self.unlink_owner(owner, token);
        }
        Some((token, entry))
    }

    /// Run every timer whose deadline is at or before the cutoff.
    ///
    /// The cutoff starts at `now` and is re-sampled after each callback, so
    /// timers that became due while a slow callback ran still fire in this
    /// pass. A callback returning `Err` is logged and the sweep continues.
    /// Returns the last cutoff, for use as the caller's current time.
    pub fn run_due_timers(&mut self, now: Instant) -> Instant {
        let mut cutoff = now;
        while let Some((token, entry)) = self.pop_due(cutoff) {
            let TimerEntry { owner, callback } = entry;
            match callback(self) {
                Ok(()) => {
                    metrics::TIMERS_FIRED.increment();
                }
                Err(e) => {
                    metrics::TIMERS_FAILED.increment();
                    let lag = cutoff.saturating_duration_since(token.deadline);
                    error!(
                        owner = ?owner,
                        lag_us = lag.as_micros() as u64,
                        error = %e,
                        "timer callback failed"
                    );
                }
            }
            cutoff = cutoff.max(Instant::now());
        }
        cutoff
    }

    /// Time until the next deadline, bounded by `default`.
    ///
    /// With nothing scheduled, returns `default`, or the fallback wait
    /// ([`DEFAULT_WAIT`] unless configured otherwise) when `default` is
    /// `None`. Overdue deadlines yield `Duration::ZERO`.
    pub fn next_deadline_delta(&self, now: Instant, default: Option<Duration>) -> Duration {
        match self.next_deadline() {
            Some(deadline) => {
                let delta = deadline.saturating_duration_since(now);
                match default {
                    Some(bound) => delta.min(bound),
                    None => delta,
                }
            }
            None => default.unwrap_or(self.fallback_wait),
        }
    }

    /// The earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.first_key_value().map(|(t, _)| t.deadline)
    }

    /// Whether `token` is still pending.
    pub fn contains(&self, token: TimerToken) -> bool {
        self.entries.contains_key(&token)
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ask the event loop to re-dial `token` once the current sweep or
    /// dispatch finishes. Requests for transports that are gone or not
    /// waiting for a reconnect are dropped.
    pub fn request_reconnect(&mut self, token: ConnToken) {
        if !self.reconnects.contains(&token) {
            self.reconnects.push(token);
        }
    }

    pub(crate) fn take_reconnect_requests(&mut self) -> Vec<ConnToken> {
        std::mem::take(&mut self.reconnects)
    }

    /// Number of pending timers owned by `owner`.
    pub fn owned_count(&self, owner: ConnToken) -> usize {
        self.owned.get(&owner).map_or(0, |s| s.len())
    }
}

/// `now + delay`, saturating at a far-future horizon instead of overflowing.
fn deadline_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}
