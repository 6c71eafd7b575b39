use std::cell::RefCell;
use std::io;
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::rc::{Rc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use tracing::{debug, trace, warn};

use crate::adapter::{Phase, Readiness, TransportAdapter};
use crate::config::Config;
use crate::error::Error;
use crate::handler::{ConnToken, Connection, DriverCtx, ReconnectionStrategy};
use crate::metrics;
use crate::socket::Socket;
use crate::timer::TimerFacility;

#[cfg(feature = "tls")]
use crate::tls::{TlsInfo, TlsSession};

/// Single-threaded readiness loop driving every registered transport and
/// the timer facility.
///
/// Each iteration waits (bounded by the next timer deadline), dispatches
/// socket readiness to the adapters, removes closed transports, then runs
/// due timers.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    ready: Vec<(usize, Readiness)>,
    adapters: Slab<TransportAdapter>,
    next_generation: u32,
    timers: TimerFacility,
    config: Config,
}

impl EventLoop {
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;
        Ok(EventLoop {
            poll: Poll::new()?,
            events: Events::with_capacity(config.poll_capacity),
            ready: Vec::with_capacity(config.poll_capacity),
            adapters: Slab::new(),
            next_generation: 0,
            timers: TimerFacility::with_fallback_wait(config.default_wait),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn timers(&self) -> &TimerFacility {
        &self.timers
    }

    pub fn timers_mut(&mut self) -> &mut TimerFacility {
        &mut self.timers
    }

    // ── Setup ────────────────────────────────────────────────────────

    /// Open an outbound TCP (or TLS, when configured) connection for `conn`.
    ///
    /// Returns once the non-blocking connect is issued. `on_connected` fires
    /// from a later iteration; a failed connect surfaces as
    /// `on_disconnected`.
    pub fn connect<C>(
        &mut self,
        host: &str,
        port: Option<u16>,
        conn: &Rc<RefCell<C>>,
    ) -> Result<ConnToken, Error>
    where
        C: Connection + 'static,
    {
        let port = port.unwrap_or(self.config.default_port);
        self.check_capacity()?;
        let dialed = self.dial(host, port)?;
        let addr = dialed.addr;

        let weak = downgrade(conn);
        let token = self.install(|token| {
            #[allow(unused_mut)]
            let mut adapter = TransportAdapter::new(token, Box::new(dialed.stream), weak)
                .with_target(host, port);
            #[cfg(feature = "tls")]
            if let Some(session) = dialed.tls {
                adapter = adapter.with_tls(session);
            }
            adapter.begin_connect();
            adapter
        })?;

        debug!(token = ?token, host, addr = %addr, tls = self.config.tls_enabled(), "connecting");
        Ok(token)
    }

    /// Resolve `host:port`, create the TLS session when configured, and
    /// issue a non-blocking connect.
    fn dial(&self, host: &str, port: u16) -> Result<Dialed, Error> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::Resolve(format!("{host}:{port}: {e}")))?
            .next()
            .ok_or_else(|| Error::Resolve(format!("{host}:{port}: no addresses")))?;

        #[cfg(feature = "tls")]
        let tls = match &self.config.tls {
            Some(tls_config) => Some(TlsSession::new(tls_config, host)?),
            None => None,
        };

        let stream = TcpStream::connect(addr)?;
        if self.config.tcp_nodelay
            && let Err(e) = stream.set_nodelay(true)
        {
            debug!(addr = %addr, error = %e, "set_nodelay failed");
        }
        Ok(Dialed {
            stream,
            addr,
            #[cfg(feature = "tls")]
            tls,
        })
    }

    /// Register a caller-provided socket for `conn`.
    ///
    /// With `connected` set, `on_connected` fires before this returns;
    /// otherwise the socket is treated as an in-flight connect.
    pub fn attach<C, S>(
        &mut self,
        socket: S,
        conn: &Rc<RefCell<C>>,
        connected: bool,
    ) -> Result<ConnToken, Error>
    where
        C: Connection + 'static,
        S: Socket + 'static,
    {
        self.check_capacity()?;
        let weak = downgrade(conn);
        let token = self.install(|token| {
            let mut adapter = TransportAdapter::new(token, Box::new(socket), weak);
            if !connected {
                adapter.begin_connect();
            }
            adapter
        })?;

        if connected {
            self.with_adapter(token, |adapter, ctx| adapter.handle_connect(ctx));
            self.reap(token);
        }
        Ok(token)
    }

    fn check_capacity(&self) -> Result<(), Error> {
        if self.adapters.len() >= self.config.max_connections {
            return Err(Error::ConnectionLimitReached);
        }
        Ok(())
    }

    fn install(
        &mut self,
        build: impl FnOnce(ConnToken) -> TransportAdapter,
    ) -> Result<ConnToken, Error> {
        let entry = self.adapters.vacant_entry();
        let index = entry.key();
        let token = ConnToken::new(index as u32, self.next_generation);
        self.next_generation = self.next_generation.wrapping_add(1);

        let mut adapter = build(token);
        let interest = adapter.interest();
        if let Some(socket) = adapter.socket_mut() {
            self.poll
                .registry()
                .register(socket, Token(index), interest)?;
        }
        entry.insert(adapter);
        metrics::CONNECTIONS_ACTIVE.increment();
        Ok(token)
    }

    // ── Lookup ───────────────────────────────────────────────────────

    fn adapter(&self, token: ConnToken) -> Option<&TransportAdapter> {
        self.adapters
            .get(token.index())
            .filter(|a| a.token() == token)
    }

    /// Current phase, or `None` once the transport has been removed.
    pub fn phase(&self, token: ConnToken) -> Option<Phase> {
        self.adapter(token).map(TransportAdapter::phase)
    }

    pub fn is_registered(&self, token: ConnToken) -> bool {
        self.adapter(token).is_some()
    }

    /// Number of registered transports.
    pub fn connection_count(&self) -> usize {
        self.adapters.len()
    }

    pub fn peer_addr(&self, token: ConnToken) -> Option<SocketAddr> {
        self.adapter(token).and_then(TransportAdapter::peer_addr)
    }

    pub fn local_addr(&self, token: ConnToken) -> Option<SocketAddr> {
        self.adapter(token).and_then(TransportAdapter::local_addr)
    }

    #[cfg(feature = "tls")]
    pub fn tls_info(&self, token: ConnToken) -> Option<TlsInfo> {
        self.adapter(token).and_then(TransportAdapter::tls_info)
    }

    /// Run `f` against the adapter with a callback context. A close
    /// requested by the connection is applied once `f` returns.
    fn with_adapter(
        &mut self,
        token: ConnToken,
        f: impl FnOnce(&mut TransportAdapter, &mut DriverCtx<'_>),
    ) {
        let Some(adapter) = self
            .adapters
            .get_mut(token.index())
            .filter(|a| a.token() == token)
        else {
            return;
        };
        let mut ctx = DriverCtx::new(&mut self.timers, token);
        f(adapter, &mut ctx);
        if ctx.close_requested && !adapter.is_closed() {
            debug!(token = ?token, "close requested by connection");
            adapter.close_quietly();
        } else if ctx.reconnect_requested && !adapter.is_closed() {
            debug!(token = ?token, "reconnect requested by connection");
            adapter.prepare_reconnect();
        }
    }

    // ── Loop ─────────────────────────────────────────────────────────

    /// One pass: wait, dispatch readiness, reap closed transports, run due
    /// timers.
    ///
    /// The wait is the time to the next timer deadline, capped by
    /// `bounded_wait` (or the configured default wait when nothing is
    /// scheduled). With no transports registered the loop sleeps instead of
    /// polling.
    pub fn run_iteration(&mut self, bounded_wait: Option<Duration>) -> Result<(), Error> {
        let wait = self
            .timers
            .next_deadline_delta(Instant::now(), bounded_wait);

        self.reap_closed();
        if self.adapters.is_empty() {
            if !wait.is_zero() {
                thread::sleep(wait);
            }
        } else {
            self.rearm();
            match self.poll.poll(&mut self.events, Some(wait)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => self.events.clear(),
                Err(e) => return Err(e.into()),
            }
            self.dispatch();
            self.reap_closed();
        }

        self.timers.run_due_timers(Instant::now());
        self.apply_reconnects();
        metrics::LOOP_ITERATIONS.increment();
        Ok(())
    }

    /// Run iterations while anything is registered or scheduled, at most
    /// `max_iterations` times when given. A bounded run finishes with one
    /// more timer sweep.
    pub fn run(
        &mut self,
        max_iterations: Option<usize>,
        wait_bound: Option<Duration>,
    ) -> Result<(), Error> {
        let mut remaining = max_iterations;
        while !self.adapters.is_empty() || !self.timers.is_empty() {
            if let Some(n) = remaining.as_mut() {
                if *n == 0 {
                    break;
                }
                *n -= 1;
            }
            self.run_iteration(wait_bound)?;
        }
        if max_iterations.is_some() {
            self.timers.run_due_timers(Instant::now());
        }
        Ok(())
    }

    /// A single bounded iteration followed by a timer sweep.
    pub fn drain_events(&mut self, wait_bound: Option<Duration>) -> Result<(), Error> {
        self.run(Some(1), wait_bound)
    }

    /// Re-register every live socket with its current interest. Writability
    /// is re-evaluated each pass, and re-registering re-arms mio's
    /// edge-triggered readiness.
    fn rearm(&mut self) {
        let registry = self.poll.registry();
        let mut failed = Vec::new();
        for (index, adapter) in self.adapters.iter_mut() {
            let interest = adapter.interest();
            let token = adapter.token();
            if let Some(socket) = adapter.socket_mut()
                && let Err(e) = registry.reregister(socket, Token(index), interest)
            {
                warn!(token = ?token, error = %e, "reregister failed");
                failed.push(token);
            }
        }
        for token in failed {
            self.with_adapter(token, |adapter, ctx| adapter.handle_close(ctx));
        }
    }

    fn dispatch(&mut self) {
        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();
        ready.extend(
            self.events
                .iter()
                .map(|event| (event.token().0, Readiness::from_event(event))),
        );
        trace!(events = ready.len(), "poll returned");

        for &(index, readiness) in &ready {
            let Some(token) = self.adapters.get(index).map(TransportAdapter::token) else {
                continue;
            };
            self.with_adapter(token, |adapter, ctx| adapter.handle_event(ctx, readiness));
        }
        self.ready = ready;
    }

    fn reap_closed(&mut self) {
        let closed: Vec<ConnToken> = self
            .adapters
            .iter()
            .filter(|(_, a)| a.needs_reap())
            .map(|(_, a)| a.token())
            .collect();
        for token in closed {
            self.reap(token);
        }
    }

    /// Deregister and drop a closed transport's socket and purge its timers.
    /// The registry entry survives while a reconnect is pending.
    fn reap(&mut self, token: ConnToken) {
        let Some(adapter) = self
            .adapters
            .get_mut(token.index())
            .filter(|a| a.token() == token && a.is_closed())
        else {
            return;
        };
        if let Some(mut socket) = adapter.take_socket()
            && let Err(e) = self.poll.registry().deregister(&mut *socket)
        {
            trace!(token = ?token, error = %e, "deregister failed");
        }
        let purged = self.timers.cancel_owned_by(token);
        if adapter.awaiting_reconnect() {
            debug!(token = ?token, purged_timers = purged, "transport awaiting reconnect");
            return;
        }
        let peer = adapter.peer_addr();
        self.adapters.remove(token.index());
        metrics::CONNECTIONS_ACTIVE.decrement();
        debug!(token = ?token, peer = ?peer, purged_timers = purged, "transport removed");
    }

    fn apply_reconnects(&mut self) {
        for token in self.timers.take_reconnect_requests() {
            self.reconnect_transport(token);
        }
    }

    /// Re-dial a transport waiting for its reconnect, keeping its token.
    fn reconnect_transport(&mut self, token: ConnToken) {
        self.reap(token);
        let Some(adapter) = self.adapter(token) else {
            trace!(token = ?token, "reconnect for a removed transport");
            return;
        };
        if !adapter.awaiting_reconnect() {
            return;
        }
        let Some((host, port)) = adapter.target().map(|(h, p)| (h.to_owned(), p)) else {
            return;
        };

        match self.dial(&host, port) {
            Ok(dialed) => {
                let addr = dialed.addr;
                let mut stream = dialed.stream;
                if let Err(e) = self.poll.registry().register(
                    &mut stream,
                    Token(token.index()),
                    Interest::READABLE | Interest::WRITABLE,
                ) {
                    warn!(token = ?token, error = %e, "register failed on reconnect");
                    self.fail_reconnect(token);
                    return;
                }
                let Some(adapter) = self.adapters.get_mut(token.index()) else {
                    return;
                };
                #[cfg(feature = "tls")]
                adapter.replace_tls(dialed.tls);
                adapter.restart(Box::new(stream));
                metrics::RECONNECTS.increment();
                debug!(token = ?token, host = %host, addr = %addr, "reconnecting");
            }
            Err(e) => {
                warn!(token = ?token, host = %host, port, error = %e, "reconnect failed");
                self.fail_reconnect(token);
            }
        }
    }

    fn fail_reconnect(&mut self, token: ConnToken) {
        self.with_adapter(token, |adapter, ctx| adapter.fail_reconnect(ctx));
        self.reap(token);
    }

    // ── Lifecycle helpers ────────────────────────────────────────────

    /// Tear down a transport from the local side.
    ///
    /// Sends a TLS close_notify when possible, shuts the socket down and
    /// removes it, and cancels every timer the connection owns. The
    /// connection gets no `on_disconnected` call. Unknown tokens are ignored.
    pub fn disconnect_transport(&mut self, token: ConnToken) {
        let Some(adapter) = self
            .adapters
            .get_mut(token.index())
            .filter(|a| a.token() == token)
        else {
            return;
        };
        adapter.close_quietly();
        if let Some(socket) = adapter.socket_mut()
            && let Err(e) = socket.shutdown(Shutdown::Both)
        {
            trace!(token = ?token, error = %e, "shutdown failed");
        }
        self.reap(token);
        debug!(token = ?token, "transport disconnected");
    }

    /// Run iterations until the transport has no pending output.
    ///
    /// Fails with [`Error::ConnectionClosed`] if the transport closes first.
    pub fn flush_outbound(&mut self, token: ConnToken) -> Result<(), Error> {
        loop {
            let adapter = self.adapter(token).ok_or(Error::ConnectionClosed)?;
            match adapter.phase() {
                Phase::Closed => return Err(Error::ConnectionClosed),
                Phase::Unconnected | Phase::Connecting | Phase::Handshaking => {}
                Phase::Open if !adapter.has_pending_output() => return Ok(()),
                Phase::Open => {}
            }
            self.run_iteration(None)?;
        }
    }

    /// [`wait_for_open_within`](Self::wait_for_open_within) bounded by the
    /// configured `open_timeout`.
    pub fn wait_for_open(
        &mut self,
        token: ConnToken,
        strategy: &dyn ReconnectionStrategy,
    ) -> Result<(), Error> {
        let bound = self.config.open_timeout;
        self.wait_for_open_within(token, strategy, bound)
    }

    /// Run iterations until the transport is open.
    ///
    /// Keeps going while the transport is still opening, or after it closed
    /// when `strategy` says a reconnect will follow (see
    /// [`DriverCtx::reconnect_after`]). The token stays the same across
    /// reconnects. Each iteration waits at most the time left in `bound`.
    pub fn wait_for_open_within(
        &mut self,
        token: ConnToken,
        strategy: &dyn ReconnectionStrategy,
        bound: Duration,
    ) -> Result<(), Error> {
        let start = Instant::now();
        loop {
            match self.phase(token) {
                Some(Phase::Open) => return Ok(()),
                // Removed transports never come back.
                None => return Err(Error::ConnectionClosed),
                Some(Phase::Closed) if !strategy.can_reconnect() => {
                    return Err(Error::ConnectionClosed);
                }
                _ => {}
            }
            let elapsed = start.elapsed();
            if elapsed >= bound {
                debug!(token = ?token, bound = ?bound, "wait for open timed out");
                return Err(Error::OpenTimeout(bound));
            }
            self.run_iteration(Some(bound - elapsed))?;
        }
    }
}

/// A freshly issued connect, not yet registered.
struct Dialed {
    stream: TcpStream,
    addr: SocketAddr,
    #[cfg(feature = "tls")]
    tls: Option<TlsSession>,
}

fn downgrade<C: Connection + 'static>(conn: &Rc<RefCell<C>>) -> Weak<RefCell<dyn Connection>> {
    let shared: Rc<RefCell<dyn Connection>> = conn.clone();
    Rc::downgrade(&shared)
}
