//! Per-connection transport adapter.
//!
//! Pairs one non-blocking [`Socket`] with one protocol [`Connection`]:
//! readiness events become `on_connected` / `on_data_available` /
//! `on_disconnected` calls, and the connection's outbound buffer becomes
//! socket writes. The adapter keeps only a `Weak` reference to the
//! connection; if the connection is dropped, the adapter closes itself on
//! its next event.

use std::cell::RefCell;
use std::io::{self, Read as _, Write as _};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use mio::Interest;
use tracing::{debug, trace, warn};

use crate::handler::{ConnToken, Connection, DriverCtx};
use crate::metrics;
use crate::socket::{ConnectStatus, Socket, check_connect};

#[cfg(feature = "tls")]
use crate::tls::{TlsInfo, TlsRecvResult, TlsSession, feed_tls_recv};

/// Lifecycle of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Created, connect not issued.
    Unconnected,
    /// Non-blocking connect in flight.
    Connecting,
    /// TCP connected, TLS handshake in progress.
    Handshaking,
    /// Usable for data.
    Open,
    /// Torn down. Terminal.
    Closed,
}

/// Readiness reported by the poller for one socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    pub const READABLE: Readiness = Readiness {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Readiness = Readiness {
        readable: false,
        writable: true,
    };
    pub const BOTH: Readiness = Readiness {
        readable: true,
        writable: true,
    };

    pub(crate) fn from_event(event: &mio::event::Event) -> Self {
        Readiness {
            // EOF and errors surface through the read path.
            readable: event.is_readable() || event.is_read_closed() || event.is_error(),
            writable: event.is_writable() || event.is_write_closed(),
        }
    }
}

type SharedConnection = Rc<RefCell<dyn Connection>>;

/// One socket bound to one connection object.
pub struct TransportAdapter {
    token: ConnToken,
    socket: Option<Box<dyn Socket>>,
    conn: Option<Weak<RefCell<dyn Connection>>>,
    phase: Phase,
    peer: Option<SocketAddr>,
    /// Host and port to re-dial, for transports opened by `connect`.
    target: Option<(String, u16)>,
    /// Closed, but kept registered until the requested reconnect is issued.
    reconnect_pending: bool,
    read_buf: Vec<u8>,
    #[cfg(feature = "tls")]
    tls: Option<TlsSession>,
    #[cfg(feature = "tls")]
    plaintext: Vec<u8>,
}

impl TransportAdapter {
    pub(crate) fn new(
        token: ConnToken,
        socket: Box<dyn Socket>,
        conn: Weak<RefCell<dyn Connection>>,
    ) -> Self {
        TransportAdapter {
            token,
            socket: Some(socket),
            conn: Some(conn),
            phase: Phase::Unconnected,
            peer: None,
            target: None,
            reconnect_pending: false,
            read_buf: Vec::new(),
            #[cfg(feature = "tls")]
            tls: None,
            #[cfg(feature = "tls")]
            plaintext: Vec::new(),
        }
    }

    /// Attach a TLS session. The handshake starts once the connect completes.
    #[cfg(feature = "tls")]
    pub(crate) fn with_tls(mut self, session: TlsSession) -> Self {
        self.tls = Some(session);
        self
    }

    pub(crate) fn with_target(mut self, host: &str, port: u16) -> Self {
        self.target = Some((host.to_owned(), port));
        self
    }

    /// Host and port this transport re-dials on reconnect.
    pub fn target(&self) -> Option<(&str, u16)> {
        self.target.as_ref().map(|(host, port)| (host.as_str(), *port))
    }

    /// Closed and waiting for a requested reconnect.
    pub fn awaiting_reconnect(&self) -> bool {
        self.is_closed() && self.reconnect_pending
    }

    /// Closed with a socket still to deregister, or closed for good.
    pub(crate) fn needs_reap(&self) -> bool {
        self.is_closed() && (self.socket.is_some() || !self.reconnect_pending)
    }

    pub fn token(&self) -> ConnToken {
        self.token
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_open(&self) -> bool {
        self.phase == Phase::Open
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Negotiated TLS parameters, once the handshake has completed.
    #[cfg(feature = "tls")]
    pub fn tls_info(&self) -> Option<TlsInfo> {
        self.tls
            .as_ref()
            .filter(|tls| self.phase == Phase::Open && !tls.is_handshaking())
            .map(TlsSession::info)
    }

    fn upgrade(&self) -> Option<SharedConnection> {
        self.conn.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn socket_mut(&mut self) -> Option<&mut (dyn Socket + 'static)> {
        self.socket.as_deref_mut()
    }

    /// Remove the socket for deregistration. The adapter must be closed.
    pub(crate) fn take_socket(&mut self) -> Option<Box<dyn Socket>> {
        debug_assert!(self.is_closed(), "socket taken from a live transport");
        self.socket.take()
    }

    pub(crate) fn begin_connect(&mut self) {
        if self.phase == Phase::Unconnected {
            self.phase = Phase::Connecting;
        }
    }

    /// Whether the adapter needs a writable notification this iteration.
    ///
    /// Evaluated fresh before every poll: a pending connect, buffered TLS
    /// records, or pending outbound bytes on an open transport.
    pub fn wants_write(&self) -> bool {
        match self.phase {
            Phase::Connecting => true,
            Phase::Unconnected | Phase::Closed => false,
            Phase::Handshaking | Phase::Open => {
                #[cfg(feature = "tls")]
                if self.tls.as_ref().is_some_and(|t| t.wants_write()) {
                    return true;
                }
                if self.phase != Phase::Open {
                    return false;
                }
                match self.upgrade() {
                    Some(conn) => conn
                        .try_borrow_mut()
                        .map_or(true, |mut c| c.outbound_buffer().has_pending()),
                    None => false,
                }
            }
        }
    }

    /// Whether bytes are still waiting to leave: buffered TLS records or
    /// unsent outbound data, regardless of phase.
    pub fn has_pending_output(&self) -> bool {
        #[cfg(feature = "tls")]
        if self.tls.as_ref().is_some_and(|t| t.wants_write()) {
            return true;
        }
        self.upgrade().is_some_and(|conn| {
            conn.try_borrow_mut()
                .map_or(true, |mut c| c.outbound_buffer().has_pending())
        })
    }

    /// Poll interest for the current state.
    pub(crate) fn interest(&self) -> Interest {
        if self.wants_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    /// Dispatch one readiness event: connect completion first, then read,
    /// then write. A close during any step ends dispatch for this event.
    pub fn handle_event(&mut self, ctx: &mut DriverCtx<'_>, readiness: Readiness) {
        if self.is_closed() {
            return;
        }
        if self.upgrade().is_none() {
            debug!(token = ?self.token, "connection dropped, closing transport");
            self.handle_close(ctx);
            return;
        }

        if self.phase == Phase::Connecting {
            let Some(socket) = self.socket.as_deref() else {
                return;
            };
            match check_connect(socket) {
                ConnectStatus::Pending => return,
                ConnectStatus::Failed(e) => {
                    warn!(token = ?self.token, error = %e, "connect failed");
                    self.handle_close(ctx);
                    return;
                }
                ConnectStatus::Connected => self.handle_connect(ctx),
            }
            if self.is_closed() || ctx.interrupted() {
                return;
            }
        }

        if readiness.readable {
            self.handle_read(ctx);
            if self.is_closed() || ctx.interrupted() {
                return;
            }
        }

        if readiness.writable {
            self.handle_write(ctx);
        }
    }

    /// The transport connect completed.
    pub fn handle_connect(&mut self, ctx: &mut DriverCtx<'_>) {
        if !matches!(self.phase, Phase::Unconnected | Phase::Connecting) {
            return;
        }
        let Some(conn) = self.upgrade() else {
            self.handle_close(ctx);
            return;
        };
        self.peer = self.socket.as_ref().and_then(|s| s.peer_addr().ok());

        #[cfg(feature = "tls")]
        let next = if self.tls.is_some() {
            Phase::Handshaking
        } else {
            Phase::Open
        };
        #[cfg(not(feature = "tls"))]
        let next = Phase::Open;
        self.phase = next;

        metrics::CONNECTIONS_OPENED.increment();
        debug!(token = ?self.token, peer = ?self.peer, phase = ?next, "transport connected");
        conn.borrow_mut().on_connected(ctx);
    }

    /// Read once from the socket and hand the bytes to the connection.
    pub fn handle_read(&mut self, ctx: &mut DriverCtx<'_>) {
        if !matches!(self.phase, Phase::Handshaking | Phase::Open) {
            return;
        }
        let Some(conn) = self.upgrade() else {
            self.handle_close(ctx);
            return;
        };

        #[cfg(feature = "tls")]
        if self.tls.is_some() {
            self.handle_read_tls(ctx, &conn);
            return;
        }

        let size = conn.borrow().suggested_buffer_size().max(1);
        if self.read_buf.len() < size {
            self.read_buf.resize(size, 0);
        }
        let Some(socket) = self.socket.as_mut() else {
            return;
        };

        match socket.read(&mut self.read_buf[..size]) {
            Ok(0) => {
                debug!(token = ?self.token, peer = ?self.peer, "peer closed");
                self.handle_close(ctx);
            }
            Ok(n) => {
                metrics::BYTES_RECEIVED.add(n as u64);
                trace!(token = ?self.token, len = n, "read from socket");
                conn.borrow_mut().on_data_available(ctx, &self.read_buf[..n]);
            }
            Err(e) if is_transient(&e) => {}
            Err(e) => {
                warn!(token = ?self.token, peer = ?self.peer, error = %e, "read failed");
                self.handle_close(ctx);
            }
        }
    }

    #[cfg(feature = "tls")]
    fn handle_read_tls(&mut self, ctx: &mut DriverCtx<'_>, conn: &SharedConnection) {
        let (Some(tls), Some(socket)) = (self.tls.as_mut(), self.socket.as_mut()) else {
            return;
        };
        self.plaintext.clear();
        let result = feed_tls_recv(tls, &mut **socket, &mut self.plaintext);

        let size = conn.borrow().suggested_buffer_size().max(1);
        match result {
            TlsRecvResult::WouldBlock => {}
            TlsRecvResult::Ok => deliver(conn, ctx, &self.plaintext, size),
            TlsRecvResult::HandshakeJustCompleted { peer_closed } => {
                self.phase = Phase::Open;
                debug!(token = ?self.token, peer = ?self.peer, "TLS handshake complete");
                deliver(conn, ctx, &self.plaintext, size);
                if peer_closed && !ctx.interrupted() {
                    debug!(token = ?self.token, peer = ?self.peer, "peer closed TLS session");
                    self.handle_close(ctx);
                }
            }
            TlsRecvResult::Closed => {
                deliver(conn, ctx, &self.plaintext, size);
                if !ctx.interrupted() {
                    debug!(token = ?self.token, peer = ?self.peer, "peer closed TLS session");
                    self.handle_close(ctx);
                }
            }
            TlsRecvResult::Error(e) => {
                warn!(token = ?self.token, peer = ?self.peer, error = %e, "TLS error");
                self.handle_close(ctx);
            }
            TlsRecvResult::Io(e) => {
                warn!(token = ?self.token, peer = ?self.peer, error = %e, "read failed");
                self.handle_close(ctx);
            }
        }
    }

    /// Write one chunk of the outbound buffer and consume exactly what the
    /// socket accepted.
    pub fn handle_write(&mut self, ctx: &mut DriverCtx<'_>) {
        if !matches!(self.phase, Phase::Handshaking | Phase::Open) {
            return;
        }
        let Some(conn) = self.upgrade() else {
            self.handle_close(ctx);
            return;
        };

        #[cfg(feature = "tls")]
        if self.tls.is_some() {
            self.handle_write_tls(ctx, &conn);
            return;
        }

        if self.phase != Phase::Open {
            return;
        }
        let Some(socket) = self.socket.as_mut() else {
            return;
        };
        let result = {
            let mut c = conn.borrow_mut();
            let buf = c.outbound_buffer();
            if !buf.has_pending() {
                return;
            }
            match socket.write(buf.chunk()) {
                Ok(n) => {
                    buf.consume(n);
                    Ok(n)
                }
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(n) => {
                metrics::BYTES_SENT.add(n as u64);
                trace!(token = ?self.token, len = n, "wrote to socket");
            }
            Err(e) if is_transient(&e) => {}
            Err(e) => {
                warn!(token = ?self.token, peer = ?self.peer, error = %e, "write failed");
                self.handle_close(ctx);
            }
        }
    }

    #[cfg(feature = "tls")]
    fn handle_write_tls(&mut self, ctx: &mut DriverCtx<'_>, conn: &SharedConnection) {
        let (Some(tls), Some(socket)) = (self.tls.as_mut(), self.socket.as_mut()) else {
            return;
        };

        if self.phase == Phase::Open {
            let mut c = conn.borrow_mut();
            let buf = c.outbound_buffer();
            if buf.has_pending() {
                match tls.write_plaintext(buf.chunk()) {
                    Ok(n) => buf.consume(n),
                    Err(e) => {
                        drop(c);
                        warn!(token = ?self.token, error = %e, "TLS encrypt failed");
                        self.handle_close(ctx);
                        return;
                    }
                }
            }
        }

        if !tls.wants_write() {
            return;
        }
        match tls.flush(&mut **socket) {
            Ok(n) => {
                metrics::BYTES_SENT.add(n as u64);
                trace!(token = ?self.token, len = n, "wrote TLS records");
            }
            Err(e) if is_transient(&e) => {}
            Err(e) => {
                warn!(token = ?self.token, peer = ?self.peer, error = %e, "write failed");
                self.handle_close(ctx);
            }
        }
    }

    /// Connection loss: enter `Closed`, tell the connection once, detach.
    ///
    /// If `on_disconnected` asks for a reconnect, the connection stays
    /// attached and the transport waits for the new connect.
    pub fn handle_close(&mut self, ctx: &mut DriverCtx<'_>) {
        if self.is_closed() {
            return;
        }
        self.phase = Phase::Closed;
        metrics::CONNECTIONS_CLOSED.increment();
        self.notify_disconnected(ctx);
    }

    fn notify_disconnected(&mut self, ctx: &mut DriverCtx<'_>) {
        let Some(weak) = self.conn.take() else {
            return;
        };
        let Some(conn) = weak.upgrade() else {
            return;
        };
        conn.borrow_mut().on_disconnected(ctx);
        if !ctx.reconnect_requested || ctx.close_requested {
            return;
        }
        if self.target.is_some() {
            self.conn = Some(weak);
            self.reconnect_pending = true;
        } else {
            warn!(token = ?self.token, "reconnect requested for a transport without an address");
        }
    }

    /// Local teardown: no callback, best-effort TLS close_notify.
    pub(crate) fn close_quietly(&mut self) {
        self.teardown();
        self.conn = None;
        self.reconnect_pending = false;
    }

    /// Tear down a live transport that asked to reconnect. The connection
    /// stays attached and gets no `on_disconnected`.
    pub(crate) fn prepare_reconnect(&mut self) {
        if self.target.is_none() {
            warn!(token = ?self.token, "reconnect requested for a transport without an address");
            return;
        }
        self.teardown();
        self.reconnect_pending = true;
    }

    fn teardown(&mut self) {
        if self.is_closed() {
            return;
        }
        #[cfg(feature = "tls")]
        if let (Some(tls), Some(socket)) = (self.tls.as_mut(), self.socket.as_mut())
            && self.phase == Phase::Open
        {
            tls.close_notify(&mut **socket);
        }
        self.phase = Phase::Closed;
        metrics::CONNECTIONS_CLOSED.increment();
    }

    /// Swap in a freshly dialed socket and go back to `Connecting`.
    pub(crate) fn restart(&mut self, socket: Box<dyn Socket>) {
        debug_assert!(self.awaiting_reconnect(), "restart of a transport not awaiting reconnect");
        self.socket = Some(socket);
        self.peer = None;
        self.reconnect_pending = false;
        self.phase = Phase::Connecting;
    }

    /// Replace the TLS session ahead of a restart.
    #[cfg(feature = "tls")]
    pub(crate) fn replace_tls(&mut self, session: Option<TlsSession>) {
        self.tls = session;
    }

    /// The re-dial itself failed: report the loss like a failed connect.
    pub(crate) fn fail_reconnect(&mut self, ctx: &mut DriverCtx<'_>) {
        self.reconnect_pending = false;
        self.notify_disconnected(ctx);
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[cfg(feature = "tls")]
fn deliver(conn: &SharedConnection, ctx: &mut DriverCtx<'_>, data: &[u8], size: usize) {
    for chunk in data.chunks(size) {
        if ctx.interrupted() {
            break;
        }
        conn.borrow_mut().on_data_available(ctx, chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::net::Shutdown;

    use crate::buffer::OutboundBuffer;
    use crate::timer::TimerFacility;

    /// Socket double: scripted reads, writes capped at `write_limit`.
    struct ScriptedSocket {
        reads: VecDeque<io::Result<Vec<u8>>>,
        write_limit: usize,
        written: Rc<RefCell<Vec<u8>>>,
        write_calls: Rc<Cell<usize>>,
    }

    impl ScriptedSocket {
        fn new(write_limit: usize) -> Self {
            ScriptedSocket {
                reads: VecDeque::new(),
                write_limit,
                written: Rc::new(RefCell::new(Vec::new())),
                write_calls: Rc::new(Cell::new(0)),
            }
        }
    }

    impl io::Read for ScriptedSocket {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                None => Err(io::ErrorKind::WouldBlock.into()),
                Some(Err(e)) => Err(e),
                Some(Ok(mut data)) => {
                    if data.len() > buf.len() {
                        let rest = data.split_off(buf.len());
                        self.reads.push_front(Ok(rest));
                    }
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
            }
        }
    }

    impl io::Write for ScriptedSocket {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.write_calls.set(self.write_calls.get() + 1);
            let n = buf.len().min(self.write_limit);
            self.written.borrow_mut().extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl mio::event::Source for ScriptedSocket {
        fn register(&mut self, _: &mio::Registry, _: mio::Token, _: Interest) -> io::Result<()> {
            Ok(())
        }

        fn reregister(&mut self, _: &mio::Registry, _: mio::Token, _: Interest) -> io::Result<()> {
            Ok(())
        }

        fn deregister(&mut self, _: &mio::Registry) -> io::Result<()> {
            Ok(())
        }
    }

    impl Socket for ScriptedSocket {
        fn take_error(&self) -> io::Result<Option<io::Error>> {
            Ok(None)
        }

        fn peer_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:5672".parse().unwrap())
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:40000".parse().unwrap())
        }

        fn shutdown(&self, _: Shutdown) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        connected: u32,
        disconnected: u32,
        data: Vec<Vec<u8>>,
        outbound: OutboundBuffer,
        read_size: Option<usize>,
        close_on_data: bool,
        reconnect_on_disconnect: bool,
        close_on_disconnect: bool,
    }

    impl Connection for Recorder {
        fn on_connected(&mut self, _ctx: &mut DriverCtx<'_>) {
            self.connected += 1;
        }

        fn on_disconnected(&mut self, ctx: &mut DriverCtx<'_>) {
            self.disconnected += 1;
            if self.reconnect_on_disconnect {
                ctx.reconnect();
            }
            if self.close_on_disconnect {
                ctx.request_close();
            }
        }

        fn on_data_available(&mut self, ctx: &mut DriverCtx<'_>, data: &[u8]) {
            self.data.push(data.to_vec());
            if self.close_on_data {
                ctx.request_close();
            }
        }

        fn outbound_buffer(&mut self) -> &mut OutboundBuffer {
            &mut self.outbound
        }

        fn suggested_buffer_size(&self) -> usize {
            self.read_size.unwrap_or(crate::handler::DEFAULT_READ_SIZE)
        }
    }

    fn open_adapter(
        socket: ScriptedSocket,
        conn: &Rc<RefCell<Recorder>>,
        timers: &mut TimerFacility,
    ) -> TransportAdapter {
        let shared: Rc<RefCell<dyn Connection>> = conn.clone();
        let token = ConnToken::new(0, 0);
        let mut adapter = TransportAdapter::new(token, Box::new(socket), Rc::downgrade(&shared));
        let mut ctx = DriverCtx::new(timers, token);
        adapter.handle_connect(&mut ctx);
        adapter
    }

    #[test]
    fn connect_fires_on_connected_and_opens() {
        let mut timers = TimerFacility::new();
        let conn = Rc::new(RefCell::new(Recorder::default()));
        let adapter = open_adapter(ScriptedSocket::new(64), &conn, &mut timers);

        assert_eq!(adapter.phase(), Phase::Open);
        assert_eq!(conn.borrow().connected, 1);
        assert_eq!(adapter.peer_addr(), Some("127.0.0.1:5672".parse().unwrap()));
    }

    #[test]
    fn zero_byte_read_disconnects_exactly_once() {
        let mut timers = TimerFacility::new();
        let conn = Rc::new(RefCell::new(Recorder::default()));
        let mut socket = ScriptedSocket::new(64);
        socket.reads.push_back(Ok(Vec::new()));
        socket.reads.push_back(Ok(b"late".to_vec()));
        let mut adapter = open_adapter(socket, &conn, &mut timers);
        conn.borrow_mut().outbound.push_slice(b"pending");

        let mut ctx = DriverCtx::new(&mut timers, adapter.token());
        adapter.handle_event(&mut ctx, Readiness::BOTH);
        assert!(adapter.is_closed());
        assert_eq!(conn.borrow().disconnected, 1);

        adapter.handle_event(&mut ctx, Readiness::BOTH);
        adapter.handle_read(&mut ctx);
        adapter.handle_write(&mut ctx);
        adapter.handle_close(&mut ctx);

        let c = conn.borrow();
        assert_eq!(c.disconnected, 1);
        assert!(c.data.is_empty());
        assert_eq!(c.outbound.len(), 7);
        assert!(!adapter.wants_write());
    }

    #[test]
    fn would_block_read_is_ignored() {
        let mut timers = TimerFacility::new();
        let conn = Rc::new(RefCell::new(Recorder::default()));
        let mut socket = ScriptedSocket::new(64);
        socket
            .reads
            .push_back(Err(io::ErrorKind::WouldBlock.into()));
        let mut adapter = open_adapter(socket, &conn, &mut timers);

        let mut ctx = DriverCtx::new(&mut timers, adapter.token());
        adapter.handle_read(&mut ctx);
        assert!(adapter.is_open());
        assert_eq!(conn.borrow().disconnected, 0);
        assert!(conn.borrow().data.is_empty());
    }

    #[test]
    fn read_error_is_treated_as_peer_close() {
        let mut timers = TimerFacility::new();
        let conn = Rc::new(RefCell::new(Recorder::default()));
        let mut socket = ScriptedSocket::new(64);
        socket
            .reads
            .push_back(Err(io::ErrorKind::ConnectionReset.into()));
        let mut adapter = open_adapter(socket, &conn, &mut timers);

        let mut ctx = DriverCtx::new(&mut timers, adapter.token());
        adapter.handle_read(&mut ctx);
        assert!(adapter.is_closed());
        assert_eq!(conn.borrow().disconnected, 1);
    }

    #[test]
    fn read_is_bounded_by_suggested_size() {
        let mut timers = TimerFacility::new();
        let conn = Rc::new(RefCell::new(Recorder {
            read_size: Some(4),
            ..Recorder::default()
        }));
        let mut socket = ScriptedSocket::new(64);
        socket.reads.push_back(Ok(b"abcdefgh".to_vec()));
        let mut adapter = open_adapter(socket, &conn, &mut timers);

        let mut ctx = DriverCtx::new(&mut timers, adapter.token());
        adapter.handle_read(&mut ctx);
        assert_eq!(conn.borrow().data, vec![b"abcd".to_vec()]);
        adapter.handle_read(&mut ctx);
        assert_eq!(conn.borrow().data, vec![b"abcd".to_vec(), b"efgh".to_vec()]);
    }

    #[test]
    fn short_write_consumes_only_accepted_bytes() {
        let mut timers = TimerFacility::new();
        let conn = Rc::new(RefCell::new(Recorder::default()));
        let socket = ScriptedSocket::new(3);
        let written = socket.written.clone();
        let mut adapter = open_adapter(socket, &conn, &mut timers);
        conn.borrow_mut().outbound.push_slice(b"12345678");
        assert!(adapter.wants_write());

        let mut ctx = DriverCtx::new(&mut timers, adapter.token());
        adapter.handle_write(&mut ctx);
        assert_eq!(conn.borrow().outbound.len(), 5);
        assert_eq!(*written.borrow(), b"123");
        assert!(adapter.wants_write());

        adapter.handle_write(&mut ctx);
        adapter.handle_write(&mut ctx);
        assert_eq!(*written.borrow(), b"12345678");
        assert!(!conn.borrow().outbound.has_pending());
        assert!(!adapter.wants_write());
    }

    #[test]
    fn one_write_per_writable_event() {
        let mut timers = TimerFacility::new();
        let conn = Rc::new(RefCell::new(Recorder::default()));
        let socket = ScriptedSocket::new(2);
        let calls = socket.write_calls.clone();
        let mut adapter = open_adapter(socket, &conn, &mut timers);
        conn.borrow_mut().outbound.push_slice(b"abcdef");

        let mut ctx = DriverCtx::new(&mut timers, adapter.token());
        adapter.handle_event(&mut ctx, Readiness::WRITABLE);
        assert_eq!(calls.get(), 1);
        assert_eq!(conn.borrow().outbound.len(), 4);
    }

    #[test]
    fn connecting_adapter_wants_write() {
        let conn: Rc<RefCell<dyn Connection>> = Rc::new(RefCell::new(Recorder::default()));
        let mut adapter = TransportAdapter::new(
            ConnToken::new(1, 0),
            Box::new(ScriptedSocket::new(8)),
            Rc::downgrade(&conn),
        );
        assert!(!adapter.wants_write());
        adapter.begin_connect();
        assert_eq!(adapter.phase(), Phase::Connecting);
        assert!(adapter.wants_write());
        assert_eq!(adapter.interest(), Interest::READABLE | Interest::WRITABLE);
    }

    #[test]
    fn connect_completion_via_event() {
        let mut timers = TimerFacility::new();
        let conn = Rc::new(RefCell::new(Recorder::default()));
        let shared: Rc<RefCell<dyn Connection>> = conn.clone();
        let token = ConnToken::new(1, 0);
        let mut adapter =
            TransportAdapter::new(token, Box::new(ScriptedSocket::new(8)), Rc::downgrade(&shared));
        adapter.begin_connect();

        let mut ctx = DriverCtx::new(&mut timers, token);
        adapter.handle_event(&mut ctx, Readiness::WRITABLE);
        assert!(adapter.is_open());
        assert_eq!(conn.borrow().connected, 1);
    }

    #[test]
    fn dropped_connection_closes_transport() {
        let mut timers = TimerFacility::new();
        let conn = Rc::new(RefCell::new(Recorder::default()));
        let mut adapter = open_adapter(ScriptedSocket::new(8), &conn, &mut timers);
        drop(conn);

        let mut ctx = DriverCtx::new(&mut timers, adapter.token());
        adapter.handle_event(&mut ctx, Readiness::READABLE);
        assert!(adapter.is_closed());
        assert!(adapter.take_socket().is_some());
    }

    #[test]
    fn reconnect_from_on_disconnected_keeps_connection_attached() {
        let mut timers = TimerFacility::new();
        let conn = Rc::new(RefCell::new(Recorder {
            reconnect_on_disconnect: true,
            ..Recorder::default()
        }));
        let shared: Rc<RefCell<dyn Connection>> = conn.clone();
        let token = ConnToken::new(0, 0);
        let mut socket = ScriptedSocket::new(8);
        socket.reads.push_back(Ok(Vec::new()));
        let mut adapter = TransportAdapter::new(token, Box::new(socket), Rc::downgrade(&shared))
            .with_target("broker.test", 5672);

        let mut ctx = DriverCtx::new(&mut timers, token);
        adapter.handle_connect(&mut ctx);
        adapter.handle_read(&mut ctx);
        assert!(adapter.awaiting_reconnect());
        assert!(adapter.needs_reap());
        assert!(adapter.take_socket().is_some());
        assert!(!adapter.needs_reap());
        drop(ctx);
        assert_eq!(timers.take_reconnect_requests(), vec![token]);

        adapter.restart(Box::new(ScriptedSocket::new(8)));
        assert_eq!(adapter.phase(), Phase::Connecting);
        let mut ctx = DriverCtx::new(&mut timers, token);
        adapter.handle_event(&mut ctx, Readiness::WRITABLE);
        assert!(adapter.is_open());
        assert_eq!(conn.borrow().connected, 2);
        assert_eq!(conn.borrow().disconnected, 1);
    }

    #[test]
    fn reconnect_without_address_detaches() {
        let mut timers = TimerFacility::new();
        let conn = Rc::new(RefCell::new(Recorder {
            reconnect_on_disconnect: true,
            ..Recorder::default()
        }));
        let mut socket = ScriptedSocket::new(8);
        socket.reads.push_back(Ok(Vec::new()));
        let mut adapter = open_adapter(socket, &conn, &mut timers);

        let mut ctx = DriverCtx::new(&mut timers, adapter.token());
        adapter.handle_read(&mut ctx);
        assert!(adapter.is_closed());
        assert!(!adapter.awaiting_reconnect());
        assert_eq!(adapter.target(), None);
    }

    #[test]
    fn close_request_overrides_reconnect() {
        let mut timers = TimerFacility::new();
        let conn = Rc::new(RefCell::new(Recorder {
            reconnect_on_disconnect: true,
            close_on_disconnect: true,
            ..Recorder::default()
        }));
        let mut socket = ScriptedSocket::new(8);
        socket.reads.push_back(Ok(Vec::new()));
        let mut adapter = open_adapter(socket, &conn, &mut timers).with_target("broker.test", 5672);

        let mut ctx = DriverCtx::new(&mut timers, adapter.token());
        adapter.handle_read(&mut ctx);
        assert!(adapter.is_closed());
        assert!(!adapter.awaiting_reconnect());
        assert!(adapter.needs_reap());
        assert_eq!(conn.borrow().disconnected, 1);
    }

    #[cfg(feature = "tls")]
    #[test]
    fn delivery_stops_once_close_is_requested() {
        let mut timers = TimerFacility::new();
        let conn = Rc::new(RefCell::new(Recorder {
            close_on_data: true,
            ..Recorder::default()
        }));
        let shared: Rc<RefCell<dyn Connection>> = conn.clone();

        let mut ctx = DriverCtx::new(&mut timers, ConnToken::new(0, 0));
        deliver(&shared, &mut ctx, b"abcdefgh", 4);
        assert!(ctx.close_requested);
        assert_eq!(conn.borrow().data, vec![b"abcd".to_vec()]);
    }

    #[test]
    fn quiet_close_skips_callback() {
        let mut timers = TimerFacility::new();
        let conn = Rc::new(RefCell::new(Recorder::default()));
        let mut adapter = open_adapter(ScriptedSocket::new(8), &conn, &mut timers);

        adapter.close_quietly();
        assert!(adapter.is_closed());
        assert_eq!(conn.borrow().disconnected, 0);
    }
}
