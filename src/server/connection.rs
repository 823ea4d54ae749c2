//! The server side of a single connection.

use std::{
    future::poll_fn,
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

use log::debug;
use tokio::{io::AsyncWrite, net::TcpStream, time::Instant};
use tokio_rustls::server::TlsStream;

use crate::{deadline::Deadline, tls::SessionInfo};

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed")
}

/// The server side of an exchange, after the request line has been read.
///
/// Everything written goes to the client. The connection ends with exactly
/// one of [`finish`](Self::finish), which tells the client the response is
/// complete, or [`close`](Self::close), which drops the socket and leaves the
/// client to notice the response was cut short. Dropping the connection
/// without either behaves like `close`.
#[derive(Debug)]
pub struct ServerConnection {
    stream: Option<TlsStream<TcpStream>>, // None after finishing or closing.
    session: SessionInfo,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    deadline: Deadline,
}

impl ServerConnection {
    pub(crate) fn new(stream: TlsStream<TcpStream>, peer_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        let state = stream.get_ref().1;
        let session = SessionInfo::capture(state, state.server_name().map(str::to_string));

        Self { stream: Some(stream), session, peer_addr, local_addr, deadline: Deadline::default() }
    }

    /// The client's address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Our end of the connection.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The negotiated TLS parameters and the client's certificates, if it
    /// presented any.
    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    /// Whether the connection has been finished or closed.
    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Fail pending writes with [`io::ErrorKind::TimedOut`] after `at`;
    /// `None` removes the deadline.
    pub fn set_write_deadline(&mut self, at: Option<Instant>) {
        self.deadline.set(at);
    }

    /// Same as [`set_write_deadline`](Self::set_write_deadline): once the
    /// request has been read, writing is the only direction left.
    pub fn set_deadline(&mut self, at: Option<Instant>) {
        self.set_write_deadline(at);
    }

    /// Finish writing cleanly with a TLS close_notify.
    ///
    /// # Panics
    ///
    /// If the connection was already finished or closed.
    pub async fn finish(&mut self) -> io::Result<()> {
        assert!(self.stream.is_some(), "connection already closed");
        poll_fn(|cx| Pin::new(&mut *self).poll_shutdown(cx)).await
    }

    /// Close uncleanly, without a TLS close_notify. Does nothing if the
    /// connection was already finished or closed.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let (tcp, _) = stream.into_inner();
            drop(tcp);
            debug!("{}: connection closed", self.peer_addr);
        }
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        if self.stream.is_some() {
            debug!("{}: connection dropped without finishing", self.peer_addr);
        }
    }
}

impl AsyncWrite for ServerConnection {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let Some(stream) = this.stream.as_mut() else {
            return Poll::Ready(Err(closed()));
        };

        let poll = Pin::new(stream).poll_write(cx, buf);
        this.deadline.guard(cx, poll)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(stream) = this.stream.as_mut() else {
            return Poll::Ready(Err(closed()));
        };

        let poll = Pin::new(stream).poll_flush(cx);
        this.deadline.guard(cx, poll)
    }

    /// Sends close_notify and shuts the socket down for writing. Once this
    /// completes, successfully or not, the connection counts as finished.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(stream) = this.stream.as_mut() else {
            return Poll::Ready(Ok(()));
        };

        let poll = Pin::new(stream).poll_shutdown(cx);
        let poll = this.deadline.guard(cx, poll);
        if poll.is_ready() {
            this.stream = None;
            debug!("{}: connection finished", this.peer_addr);
        }
        poll
    }
}
