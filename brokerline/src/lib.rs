//! brokerline: single-threaded readiness event loop for message-broker
//! client transports.
//!
//! brokerline drives non-blocking TCP (optionally TLS) connections for a
//! protocol layer such as an AMQP client. The protocol object implements
//! [`Connection`]; the [`EventLoop`] turns socket readiness into
//! `on_connected` / `on_data_available` / `on_disconnected` calls, writes the
//! connection's [`OutboundBuffer`] as the socket accepts it, and runs timers
//! (heartbeats, reconnect delays) between polls.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use brokerline::{
//!     Config, Connection, DriverCtx, EventLoop, NullReconnectionStrategy, OutboundBuffer,
//! };
//!
//! #[derive(Default)]
//! struct Client {
//!     outbound: OutboundBuffer,
//!     received: Vec<u8>,
//! }
//!
//! impl Connection for Client {
//!     fn on_connected(&mut self, _ctx: &mut DriverCtx<'_>) {
//!         self.outbound.push_slice(b"AMQP\x00\x00\x09\x01");
//!     }
//!     fn on_disconnected(&mut self, _ctx: &mut DriverCtx<'_>) {}
//!     fn on_data_available(&mut self, _ctx: &mut DriverCtx<'_>, data: &[u8]) {
//!         self.received.extend_from_slice(data);
//!     }
//!     fn outbound_buffer(&mut self) -> &mut OutboundBuffer {
//!         &mut self.outbound
//!     }
//! }
//!
//! fn main() -> Result<(), brokerline::Error> {
//!     let mut event_loop = EventLoop::new(Config::default())?;
//!     let client = Rc::new(RefCell::new(Client::default()));
//!     let token = event_loop.connect("localhost", None, &client)?;
//!     event_loop.wait_for_open(token, &NullReconnectionStrategy)?;
//!     event_loop.flush_outbound(token)?;
//!     event_loop.run(None, None)
//! }
//! ```
//!
//! # Threading
//!
//! Everything runs on the thread that owns the [`EventLoop`]. Connections are
//! shared as `Rc<RefCell<_>>`, so the loop is `!Send`.

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod metrics;
pub(crate) mod socket;
#[cfg(feature = "tls")]
pub(crate) mod tls;

// ── Public modules ──────────────────────────────────────────────────────
pub mod adapter;
pub mod buffer;
pub mod config;
pub mod driver;
pub mod error;
pub mod handler;
pub mod timer;

// ── Re-exports: Handler types ───────────────────────────────────────────

/// Opaque transport handle.
pub use handler::ConnToken;
/// Protocol-side callbacks driven by a transport.
pub use handler::Connection;
/// Context passed to [`Connection`] callbacks.
pub use handler::DriverCtx;
/// Reconnection policy consulted by [`EventLoop::wait_for_open`].
pub use handler::{NullReconnectionStrategy, ReconnectionStrategy, SimpleReconnectionStrategy};

// ── Re-exports: Transport ───────────────────────────────────────────────

/// Transport lifecycle phase.
pub use adapter::Phase;
/// Outbound byte queue owned by a connection.
pub use buffer::OutboundBuffer;
/// Readiness event loop.
pub use driver::EventLoop;
/// Non-blocking socket abstraction.
pub use socket::Socket;
/// Negotiated TLS session parameters.
#[cfg(feature = "tls")]
pub use tls::TlsInfo;

// ── Re-exports: Timers ──────────────────────────────────────────────────

pub use timer::{DEFAULT_WAIT, TimerFacility, TimerToken};

// ── Re-exports: Config & errors ─────────────────────────────────────────

pub use config::{Config, ConfigBuilder, DEFAULT_PORT};
#[cfg(feature = "tls")]
pub use config::TlsClientConfig;
pub use error::{Error, TimerError};
