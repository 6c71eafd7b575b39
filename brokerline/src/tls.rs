use std::io::{self, Read as _, Write as _};

use rustls::ClientConnection;
use rustls::pki_types::ServerName;

use crate::config::TlsClientConfig;
use crate::socket::Socket;

/// Information about a negotiated TLS session.
#[derive(Debug, Clone)]
pub struct TlsInfo {
    pub protocol_version: Option<rustls::ProtocolVersion>,
    pub cipher_suite: Option<rustls::SupportedCipherSuite>,
    pub alpn_protocol: Option<Vec<u8>>,
}

/// Per-transport client TLS state.
pub(crate) struct TlsSession {
    conn: ClientConnection,
}

impl TlsSession {
    /// Create a client session. The ClientHello is buffered until the first flush.
    pub(crate) fn new(config: &TlsClientConfig, host: &str) -> Result<Self, crate::error::Error> {
        let name = config.server_name.as_deref().unwrap_or(host).to_owned();
        let server_name = ServerName::try_from(name)
            .map_err(|e| crate::error::Error::InvalidServerName(e.to_string()))?;
        let conn = ClientConnection::new(config.client_config.clone(), server_name)?;
        Ok(TlsSession { conn })
    }

    pub(crate) fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    pub(crate) fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    pub(crate) fn info(&self) -> TlsInfo {
        TlsInfo {
            protocol_version: self.conn.protocol_version(),
            cipher_suite: self.conn.negotiated_cipher_suite(),
            alpn_protocol: self.conn.alpn_protocol().map(|s| s.to_vec()),
        }
    }

    /// Encrypt as much of `plaintext` as the session will buffer.
    /// Returns the number of plaintext bytes accepted.
    pub(crate) fn write_plaintext(&mut self, plaintext: &[u8]) -> io::Result<usize> {
        self.conn.writer().write(plaintext)
    }

    /// One socket write of pending ciphertext. Unwritten ciphertext stays in
    /// the session for the next writable event.
    pub(crate) fn flush(&mut self, mut socket: &mut dyn Socket) -> io::Result<usize> {
        self.conn.write_tls(&mut socket)
    }

    /// Queue a close_notify alert and try to send it.
    pub(crate) fn close_notify(&mut self, socket: &mut dyn Socket) {
        self.conn.send_close_notify();
        while self.conn.wants_write() {
            match self.flush(socket) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }
}

/// Result of feeding socket data into a TLS session.
#[derive(Debug)]
pub(crate) enum TlsRecvResult {
    /// Records processed; plaintext (if any) was appended.
    Ok,
    /// Nothing to read right now.
    WouldBlock,
    /// The handshake completed during this read. `peer_closed` is set when
    /// the same batch also carried the peer's close_notify.
    HandshakeJustCompleted { peer_closed: bool },
    /// Protocol error (alert already queued for sending).
    Error(rustls::Error),
    /// Socket read failed.
    Io(io::Error),
    /// Peer sent close_notify or the socket hit EOF.
    Closed,
}

/// Read one batch of ciphertext from `socket`, drive the session, and append
/// any decrypted plaintext to `plaintext`.
pub(crate) fn feed_tls_recv(
    session: &mut TlsSession,
    mut socket: &mut dyn Socket,
    plaintext: &mut Vec<u8>,
) -> TlsRecvResult {
    let was_handshaking = session.conn.is_handshaking();

    match session.conn.read_tls(&mut socket) {
        Ok(0) => return TlsRecvResult::Closed,
        Ok(n) => {
            crate::metrics::BYTES_RECEIVED.add(n as u64);
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return TlsRecvResult::WouldBlock,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => return TlsRecvResult::WouldBlock,
        Err(e) => return TlsRecvResult::Io(e),
    }

    let state = match session.conn.process_new_packets() {
        Ok(state) => state,
        Err(e) => {
            // Best effort: let the peer see the alert.
            if session.conn.wants_write() {
                let _ = session.flush(socket);
            }
            return TlsRecvResult::Error(e);
        }
    };

    if state.plaintext_bytes_to_read() > 0 {
        let start = plaintext.len();
        plaintext.resize(start + state.plaintext_bytes_to_read(), 0);
        let mut filled = start;
        let mut reader = session.conn.reader();
        while filled < plaintext.len() {
            match reader.read(&mut plaintext[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(_) => break,
            }
        }
        plaintext.truncate(filled);
    }

    recv_outcome(
        was_handshaking && !session.conn.is_handshaking(),
        state.peer_has_closed(),
    )
}

fn recv_outcome(handshake_completed: bool, peer_closed: bool) -> TlsRecvResult {
    match (handshake_completed, peer_closed) {
        (true, peer_closed) => TlsRecvResult::HandshakeJustCompleted { peer_closed },
        (false, true) => TlsRecvResult::Closed,
        (false, false) => TlsRecvResult::Ok,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_completion_keeps_peer_close() {
        assert!(matches!(
            recv_outcome(true, true),
            TlsRecvResult::HandshakeJustCompleted { peer_closed: true }
        ));
        assert!(matches!(
            recv_outcome(true, false),
            TlsRecvResult::HandshakeJustCompleted { peer_closed: false }
        ));
        assert!(matches!(recv_outcome(false, true), TlsRecvResult::Closed));
        assert!(matches!(recv_outcome(false, false), TlsRecvResult::Ok));
    }
}
