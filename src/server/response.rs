//! A writer that sends exactly one header ahead of the body.

use std::{
    future::poll_fn,
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use tokio::io::AsyncWrite;

use super::connection::ServerConnection;
use crate::header::{GEMTEXT, ResponseHeader};

#[derive(Debug)]
enum HeaderState {
    NotStarted,
    Sending { bytes: Vec<u8>, written: usize },
    Sent,
    Failed(io::ErrorKind),
}

/// Writes a response through a [`ServerConnection`], making sure exactly one
/// header goes out before the body.
///
/// Writing body bytes before a header sends `20 text/gemini` first.
#[derive(Debug)]
pub struct ResponseWriter {
    conn: ServerConnection,
    state: HeaderState,
}

impl ResponseWriter {
    /// Wrap a connection on which nothing has been written yet.
    pub fn new(conn: ServerConnection) -> Self {
        Self { conn, state: HeaderState::NotStarted }
    }

    /// Whether a header has been (or is being) written.
    pub fn header_written(&self) -> bool {
        !matches!(self.state, HeaderState::NotStarted)
    }

    /// Send the response header.
    ///
    /// # Panics
    ///
    /// If a header was already written, explicitly or by an earlier body
    /// write.
    pub async fn write_header(&mut self, header: &ResponseHeader) -> io::Result<()> {
        assert!(!self.header_written(), "header already written");
        self.state = HeaderState::Sending { bytes: header.to_bytes(), written: 0 };
        poll_fn(|cx| self.poll_header(cx)).await
    }

    /// Finish writing cleanly.
    ///
    /// # Panics
    ///
    /// If the connection was already finished or closed.
    pub async fn finish(&mut self) -> io::Result<()> {
        poll_fn(|cx| self.poll_header(cx)).await?;
        self.conn.finish().await
    }

    /// Close uncleanly. Does nothing if already finished or closed.
    pub fn close(&mut self) {
        self.conn.close();
    }

    /// The underlying connection.
    pub fn connection(&self) -> &ServerConnection {
        &self.conn
    }

    /// Give the connection back, e.g. to set a deadline.
    pub fn connection_mut(&mut self) -> &mut ServerConnection {
        &mut self.conn
    }

    /// Drive the header out. A header that was never started stays unsent.
    fn poll_header(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            match &mut self.state {
                HeaderState::NotStarted | HeaderState::Sent => return Poll::Ready(Ok(())),
                HeaderState::Failed(kind) => return Poll::Ready(Err(io::Error::from(*kind))),
                HeaderState::Sending { bytes, written } => {
                    if *written == bytes.len() {
                        self.state = HeaderState::Sent;
                        continue;
                    }

                    match ready!(Pin::new(&mut self.conn).poll_write(cx, &bytes[*written..])) {
                        Ok(0) => self.state = HeaderState::Failed(io::ErrorKind::WriteZero),
                        Ok(n) => *written += n,
                        Err(e) => {
                            self.state = HeaderState::Failed(e.kind());
                            return Poll::Ready(Err(e));
                        }
                    }
                }
            }
        }
    }
}

impl AsyncWrite for ResponseWriter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let HeaderState::NotStarted = this.state {
            this.state = HeaderState::Sending { bytes: ResponseHeader::success(GEMTEXT).to_bytes(), written: 0 };
        }

        ready!(this.poll_header(cx))?;
        Pin::new(&mut this.conn).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_header(cx))?;
        Pin::new(&mut this.conn).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_header(cx))?;
        Pin::new(&mut this.conn).poll_shutdown(cx)
    }
}
