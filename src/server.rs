//! Accepting connections and handing requests to a handler.

pub mod connection;
pub mod response;

use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use connection::ServerConnection;
use response::ResponseWriter;
use log::{debug, info, warn};
use rustls::ServerConfig;
use thiserror::Error;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::{
    header::ResponseHeader,
    line::{LineError, MAX_REQUEST_LINE, read_line},
    url::{URL, UrlError},
};

/// A byte sink that can be finished cleanly, as opposed to just dropped.
pub trait WriteFinisher: AsyncWrite + Unpin + Send {
    /// Send a response header. By default the encoded header is written like
    /// any other bytes.
    fn write_header(&mut self, header: &ResponseHeader) -> impl Future<Output = io::Result<()>> + Send {
        let bytes = header.to_bytes();
        async move { self.write_all(&bytes).await }
    }

    /// Finish writing cleanly.
    fn finish(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

impl WriteFinisher for ServerConnection {
    fn finish(&mut self) -> impl Future<Output = io::Result<()>> + Send {
        ServerConnection::finish(self)
    }
}

/// The header goes through [`ResponseWriter::write_header`], so it is the
/// response's one header rather than body text behind an automatic one.
impl WriteFinisher for ResponseWriter {
    fn write_header(&mut self, header: &ResponseHeader) -> impl Future<Output = io::Result<()>> + Send {
        ResponseWriter::write_header(self, header)
    }

    fn finish(&mut self) -> impl Future<Output = io::Result<()>> + Send {
        ResponseWriter::finish(self)
    }
}

/// A client could not be taken as far as its request line.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The TLS handshake failed.
    #[error("TLS handshake failed: {0}")]
    Tls(io::Error),
    /// The request line could not be read.
    #[error("failed to read request: {0}")]
    ReadRequest(#[from] LineError),
    /// The request line is not a URL.
    #[error("invalid request: {0}")]
    InvalidUrl(#[from] UrlError),
    /// The client took longer than the server's handshake timeout.
    #[error("handshake timed out")]
    Timeout,
    /// The socket failed before the handshake started.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Accepts connections and hands each request to a handler.
#[derive(Clone)]
pub struct Server {
    acceptor: TlsAcceptor,
    handshake_timeout: Option<Duration>,
}

impl Server {
    /// A server using `config`, typically built by [`crate::tls::server_config`].
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { acceptor: TlsAcceptor::from(config), handshake_timeout: None }
    }

    /// Drop clients that do not complete the TLS handshake and send their
    /// request line within `timeout`.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Perform the TLS handshake on `tcp` and read the request line.
    pub async fn handshake(&self, tcp: TcpStream) -> Result<(ServerConnection, URL), HandshakeError> {
        match self.handshake_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.handshake_inner(tcp))
                .await
                .map_err(|_| HandshakeError::Timeout)?,
            None => self.handshake_inner(tcp).await,
        }
    }

    async fn handshake_inner(&self, tcp: TcpStream) -> Result<(ServerConnection, URL), HandshakeError> {
        let peer_addr = tcp.peer_addr()?;
        let local_addr = tcp.local_addr()?;

        let stream = self.acceptor.accept(tcp).await.map_err(HandshakeError::Tls)?;
        let mut reader = BufReader::new(stream);
        let line = read_line(&mut reader, MAX_REQUEST_LINE).await?;
        let url: URL = line.parse()?;

        Ok((ServerConnection::new(reader.into_inner(), peer_addr, local_addr), url))
    }

    /// Serve until accepting fails. See [`listen_until`](Self::listen_until).
    pub async fn listen<H, Fut>(&self, listener: TcpListener, handler: H) -> io::Result<()>
    where
        H: Fn(ServerConnection, URL) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.listen_until(listener, handler, CancellationToken::new()).await
    }

    /// Accept connections until `shutdown` fires or accepting fails.
    ///
    /// Every accepted socket gets its own task, which performs the handshake
    /// and then runs `handler`, so slow clients never hold up `accept`.
    /// Handshake failures are logged and only cost that one client. The
    /// handler owns the connection and should finish or close it.
    pub async fn listen_until<H, Fut>(
        &self,
        listener: TcpListener,
        handler: H,
        shutdown: CancellationToken,
    ) -> io::Result<()>
    where
        H: Fn(ServerConnection, URL) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        info!("listening on {}", listener.local_addr()?);
        let handler = Arc::new(handler);

        loop {
            let (tcp, addr) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };

            self.spawn(tcp, addr, handler.clone());
        }
    }

    fn spawn<H, Fut>(&self, tcp: TcpStream, addr: SocketAddr, handler: Arc<H>)
    where
        H: Fn(ServerConnection, URL) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let server = self.clone();

        tokio::spawn(async move {
            match server.handshake(tcp).await {
                Ok((conn, url)) => {
                    debug!("{addr}: {url}");
                    (*handler)(conn, url).await;
                }
                Err(e) => warn!("{addr}: {e}"),
            }
        });
    }
}

/// Serve `listener` with a [`Server`] built from `config`.
pub async fn listen<H, Fut>(listener: TcpListener, config: Arc<ServerConfig>, handler: H) -> io::Result<()>
where
    H: Fn(ServerConnection, URL) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Server::new(config).listen(listener, handler).await
}
