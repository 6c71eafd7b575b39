use std::io;
use std::net::{Shutdown, SocketAddr};

/// Non-blocking byte stream the transport reads from and writes to.
///
/// Implemented for `mio::net::TcpStream`. Test doubles wrap a real stream
/// (to stay pollable) and alter what `read`/`write` report.
pub trait Socket: io::Read + io::Write + mio::event::Source {
    /// Pending socket error (`SO_ERROR`), used to detect a failed connect.
    fn take_error(&self) -> io::Result<Option<io::Error>>;

    /// Remote address. `NotConnected` while a connect is still in progress.
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn shutdown(&self, how: Shutdown) -> io::Result<()>;
}

impl Socket for mio::net::TcpStream {
    fn take_error(&self) -> io::Result<Option<io::Error>> {
        mio::net::TcpStream::take_error(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        mio::net::TcpStream::peer_addr(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        mio::net::TcpStream::local_addr(self)
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        mio::net::TcpStream::shutdown(self, how)
    }
}

/// Outcome of checking a socket after a connect readiness event.
#[derive(Debug)]
pub(crate) enum ConnectStatus {
    Connected,
    Pending,
    Failed(io::Error),
}

/// Check whether a non-blocking connect has finished.
pub(crate) fn check_connect(socket: &dyn Socket) -> ConnectStatus {
    match socket.take_error() {
        Ok(Some(e)) | Err(e) => return ConnectStatus::Failed(e),
        Ok(None) => {}
    }
    match socket.peer_addr() {
        Ok(_) => ConnectStatus::Connected,
        Err(e) if e.kind() == io::ErrorKind::NotConnected => ConnectStatus::Pending,
        Err(e) => ConnectStatus::Failed(e),
    }
}

