use std::time::{Duration, Instant};

use crate::buffer::OutboundBuffer;
use crate::error::TimerError;
use crate::timer::{TimerFacility, TimerToken};

/// Opaque handle for a registered transport.
///
/// The generation detects handles that outlived their transport after the
/// registry slot was reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnToken {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ConnToken {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        ConnToken { index, generation }
    }

    /// Returns the registry slot index.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// Read buffer size used when a connection does not suggest one.
pub const DEFAULT_READ_SIZE: usize = 4096;

/// Protocol connection driven by a transport.
///
/// The transport calls these from the event loop thread; implementations
/// must not block. Bytes to send go into [`outbound_buffer`](Self::outbound_buffer)
/// and are written as the socket accepts them.
pub trait Connection {
    /// The transport connect completed (before any TLS handshake).
    fn on_connected(&mut self, ctx: &mut DriverCtx<'_>);

    /// The transport was lost: peer close, socket error or failed connect.
    /// Called at most once per transport.
    fn on_disconnected(&mut self, ctx: &mut DriverCtx<'_>);

    /// Raw bytes read from the transport. No framing is applied.
    fn on_data_available(&mut self, ctx: &mut DriverCtx<'_>, data: &[u8]);

    /// Bytes waiting to be written.
    fn outbound_buffer(&mut self) -> &mut OutboundBuffer;

    /// Upper bound for a single socket read.
    fn suggested_buffer_size(&self) -> usize {
        DEFAULT_READ_SIZE
    }
}

/// Decides whether a lost connection will be retried.
pub trait ReconnectionStrategy {
    fn can_reconnect(&self) -> bool;
}

/// Never reconnects.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReconnectionStrategy;

impl ReconnectionStrategy for NullReconnectionStrategy {
    fn can_reconnect(&self) -> bool {
        false
    }
}

/// Reconnects while an attempt budget remains.
///
/// The connection object calls [`record_attempt`](Self::record_attempt) each
/// time it retries (typically before [`DriverCtx::reconnect_after`] in
/// `on_disconnected`) and [`reset`](Self::reset) once a connection opens.
#[derive(Debug, Clone)]
pub struct SimpleReconnectionStrategy {
    max_attempts: u32,
    attempts: std::cell::Cell<u32>,
}

impl SimpleReconnectionStrategy {
    pub fn new(max_attempts: u32) -> Self {
        SimpleReconnectionStrategy {
            max_attempts,
            attempts: std::cell::Cell::new(0),
        }
    }

    pub fn record_attempt(&self) {
        self.attempts.set(self.attempts.get().saturating_add(1));
    }

    pub fn reset(&self) {
        self.attempts.set(0);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.get()
    }
}

impl ReconnectionStrategy for SimpleReconnectionStrategy {
    fn can_reconnect(&self) -> bool {
        self.attempts.get() < self.max_attempts
    }
}

/// The context provided to connection callbacks.
///
/// A short-lived borrow into the event loop's timer facility, scoped to one
/// transport.
pub struct DriverCtx<'a> {
    pub(crate) timers: &'a mut TimerFacility,
    pub(crate) token: ConnToken,
    pub(crate) close_requested: bool,
    pub(crate) reconnect_requested: bool,
}

impl<'a> DriverCtx<'a> {
    pub(crate) fn new(timers: &'a mut TimerFacility, token: ConnToken) -> Self {
        DriverCtx {
            timers,
            token,
            close_requested: false,
            reconnect_requested: false,
        }
    }

    /// The transport this callback is running for.
    pub fn token(&self) -> ConnToken {
        self.token
    }

    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Schedule a timer owned by this transport. It is cancelled when the
    /// transport is torn down.
    pub fn schedule_after<F>(&mut self, delay: Duration, callback: F) -> TimerToken
    where
        F: FnOnce(&mut TimerFacility) -> Result<(), TimerError> + 'static,
    {
        self.timers.schedule_after_for(self.token, delay, callback)
    }

    /// Absolute variant of [`schedule_after`](Self::schedule_after).
    pub fn schedule_at<F>(&mut self, deadline: Instant, callback: F) -> TimerToken
    where
        F: FnOnce(&mut TimerFacility) -> Result<(), TimerError> + 'static,
    {
        self.timers.schedule_at_for(self.token, deadline, callback)
    }

    pub fn cancel(&mut self, timer: TimerToken) -> bool {
        self.timers.cancel(timer)
    }

    /// Direct access to the timer facility, for timers that must outlive
    /// this transport (e.g. a reconnect delay).
    pub fn timers(&mut self) -> &mut TimerFacility {
        self.timers
    }

    /// Close the transport once the current callback returns.
    pub fn request_close(&mut self) {
        self.close_requested = true;
    }

    /// A close or reconnect was requested; further callbacks for this event
    /// are skipped.
    pub(crate) fn interrupted(&self) -> bool {
        self.close_requested || self.reconnect_requested
    }

    /// Re-dial this transport's host and port once the current callback
    /// returns. The token stays valid across the reconnect.
    ///
    /// From `on_disconnected` this keeps the closed transport registered;
    /// on a live transport the current socket is torn down first, without
    /// an `on_disconnected` call. Only transports opened with
    /// [`EventLoop::connect`](crate::EventLoop::connect) can be re-dialed.
    pub fn reconnect(&mut self) {
        self.reconnect_requested = true;
        self.timers.request_reconnect(self.token);
    }

    /// Like [`reconnect`](Self::reconnect), but the new connect is issued
    /// after `delay`. The delay timer is not owned by the transport, so it
    /// survives the teardown of the current socket.
    pub fn reconnect_after(&mut self, delay: Duration) -> TimerToken {
        self.reconnect_requested = true;
        let token = self.token;
        self.timers.schedule_after(delay, move |timers| {
            timers.request_reconnect(token);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctx_timers_are_owned_by_connection() {
        let mut timers = TimerFacility::new();
        let token = ConnToken::new(2, 5);
        {
            let mut ctx = DriverCtx::new(&mut timers, token);
            ctx.schedule_after(Duration::from_secs(10), |_| Ok(()));
            ctx.timers().schedule_after(Duration::from_secs(10), |_| Ok(()));
        }
        assert_eq!(timers.owned_count(token), 1);
        assert_eq!(timers.len(), 2);
    }

    #[test]
    fn reconnect_after_queues_request_when_timer_fires() {
        let mut timers = TimerFacility::new();
        let token = ConnToken::new(4, 2);
        {
            let mut ctx = DriverCtx::new(&mut timers, token);
            ctx.reconnect_after(Duration::ZERO);
            assert!(ctx.reconnect_requested);
        }
        assert_eq!(timers.owned_count(token), 0);
        assert!(timers.take_reconnect_requests().is_empty());

        timers.run_due_timers(Instant::now());
        assert_eq!(timers.take_reconnect_requests(), vec![token]);
    }

    #[test]
    fn simple_strategy_budget() {
        let strategy = SimpleReconnectionStrategy::new(2);
        assert!(strategy.can_reconnect());
        strategy.record_attempt();
        strategy.record_attempt();
        assert!(!strategy.can_reconnect());
        strategy.reset();
        assert!(strategy.can_reconnect());
        assert!(!NullReconnectionStrategy.can_reconnect());
    }
}
