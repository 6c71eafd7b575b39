//! brokerline runtime metrics.
//!
//! Process-wide counters for transports, bytes, timers and loop iterations.
//! Exposed through metriken's registry, so any exporter that walks
//! `metriken::metrics()` picks them up.

use metriken::{Counter, Gauge, metric};

// ── Connection lifecycle ─────────────────────────────────────────

#[metric(
    name = "brokerline/connections/opened",
    description = "Transports that completed connect"
)]
pub static CONNECTIONS_OPENED: Counter = Counter::new();

#[metric(
    name = "brokerline/connections/closed",
    description = "Transports torn down (peer close, error or local disconnect)"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "brokerline/connections/active",
    description = "Currently registered transports"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "brokerline/connections/reconnects",
    description = "Re-dials issued for transports that asked to reconnect"
)]
pub static RECONNECTS: Counter = Counter::new();

// ── Bytes ────────────────────────────────────────────────────────

#[metric(name = "brokerline/bytes/received", description = "Total bytes received")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "brokerline/bytes/sent", description = "Total bytes sent")]
pub static BYTES_SENT: Counter = Counter::new();

// ── Timers ───────────────────────────────────────────────────────

#[metric(name = "brokerline/timers/fired", description = "Timer callbacks run")]
pub static TIMERS_FIRED: Counter = Counter::new();

#[metric(
    name = "brokerline/timers/failed",
    description = "Timer callbacks that returned an error"
)]
pub static TIMERS_FAILED: Counter = Counter::new();

// ── Loop ─────────────────────────────────────────────────────────

#[metric(
    name = "brokerline/loop/iterations",
    description = "Event loop iterations executed"
)]
pub static LOOP_ITERATIONS: Counter = Counter::new();
