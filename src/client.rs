//! Dialing servers and reading their responses.

pub mod request;
pub mod tofu;

use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use log::debug;
use request::Request;
use rustls::{ClientConfig, pki_types::ServerName};
use thiserror::Error;
use tokio::{
    io::{AsyncBufRead, AsyncRead, AsyncWriteExt, BufReader, ReadBuf},
    net::TcpStream,
    time::Instant,
};
use tokio_rustls::{TlsConnector, client::TlsStream};
use tokio_util::sync::CancellationToken;

use crate::{
    deadline::Deadline,
    header::{HeaderError, ResponseHeader},
    line::{LineError, MAX_HEADER_LINE, read_line},
    tls::SessionInfo,
    url::{URL, UrlError},
};

/// An error that can occur when the client tries to do something.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The URL could not be parsed.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] UrlError),
    /// The URL's scheme is not `gemini`.
    #[error("unsupported protocol: {0:?}")]
    UnsupportedProtocol(String),
    /// The URL has no host to connect to.
    #[error("URL must contain a host")]
    MissingHost,
    /// The request is too long (more than 1024 bytes).
    #[error("request is too long: {0} bytes")]
    RequestTooLong(usize),
    /// The host is not usable as a TLS server name.
    #[error("invalid server name: {0}")]
    InvalidServerName(String),
    /// The connection to the host could not be established.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// The address dialed.
        addr: String,
        /// The cause.
        source: io::Error,
    },
    /// Connecting and handshaking took longer than the dialer allows.
    #[error("connection to {0} timed out")]
    ConnectTimeout(String),
    /// The dial was cancelled by the caller.
    #[error("dial cancelled")]
    Cancelled,
    /// The TLS handshake failed.
    #[error("TLS handshake failed: {0}")]
    Handshake(io::Error),
    /// The request line could not be sent.
    #[error("failed to send request: {0}")]
    SendRequest(io::Error),
    /// The response header line could not be read.
    #[error("failed to read response header: {0}")]
    ReadHeader(#[from] LineError),
    /// The response header line is malformed.
    #[error(transparent)]
    InvalidHeader(#[from] HeaderError),
}

/// A client-side connection, positioned at the first byte of the response
/// body once the header has been read.
///
/// The body ends with `Ok(0)` when the server finished cleanly. A server
/// that dropped the connection without finishing shows up as an
/// [`io::ErrorKind::UnexpectedEof`] error instead.
#[derive(Debug)]
pub struct ClientConnection {
    reader: BufReader<TlsStream<TcpStream>>,
    session: SessionInfo,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    deadline: Deadline,
}

impl ClientConnection {
    /// The server's address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Our end of the connection.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The negotiated TLS parameters and the server's certificates.
    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    /// Fail pending reads with [`io::ErrorKind::TimedOut`] after `at`;
    /// `None` removes the deadline.
    pub fn set_read_deadline(&mut self, at: Option<Instant>) {
        self.deadline.set(at);
    }

    /// Same as [`set_read_deadline`](Self::set_read_deadline): reading is
    /// the only direction left once the request has been sent.
    pub fn set_deadline(&mut self, at: Option<Instant>) {
        self.set_read_deadline(at);
    }

    /// Close the TLS session.
    pub async fn close(self) -> io::Result<()> {
        let mut stream = self.reader.into_inner();
        stream.shutdown().await
    }
}

impl AsyncRead for ClientConnection {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.reader).poll_read(cx, buf);
        this.deadline.guard(cx, poll)
    }
}

impl AsyncBufRead for ClientConnection {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.reader).poll_fill_buf(cx);
        this.deadline.guard(cx, poll)
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        Pin::new(&mut self.get_mut().reader).consume(amt);
    }
}

/// Dials servers with a fixed TLS configuration.
#[derive(Debug, Clone)]
pub struct Dialer {
    config: Arc<ClientConfig>,
    addr: Option<String>,
    read_buffer_size: Option<usize>,
    connect_timeout: Option<Duration>,
}

impl Dialer {
    /// A dialer using `config`, typically built by [`crate::tls::client_config`].
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self { config, addr: None, read_buffer_size: None, connect_timeout: None }
    }

    /// Connect to `addr` instead of the URL's host and port. The URL's host
    /// is still used for SNI and in the request line.
    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = Some(addr.into());
        self
    }

    /// The capacity of the buffer used to read the response.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = Some(size);
        self
    }

    /// Limit the time spent on the TCP connect and the TLS handshake.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Parse `url` and [`dial_url`](Self::dial_url) it.
    pub async fn dial(&self, url: &str) -> Result<(ClientConnection, ResponseHeader), ClientError> {
        self.dial_url(url.parse()?).await
    }

    /// Like [`dial`](Self::dial), but gives up as soon as `cancel` fires.
    pub async fn dial_with_cancel(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<(ClientConnection, ResponseHeader), ClientError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            result = self.dial(url) => result,
        }
    }

    /// Send a request for `url` and read the response header. The returned
    /// connection is positioned at the body.
    pub async fn dial_url(&self, url: URL) -> Result<(ClientConnection, ResponseHeader), ClientError> {
        if !url.is_gemini() {
            return Err(ClientError::UnsupportedProtocol(url.scheme().to_string()));
        }
        let url = url.with_default_path();

        let host = url.host.clone().ok_or(ClientError::MissingHost)?;
        let request = Request(url);
        if !request.is_valid_length() {
            return Err(ClientError::RequestTooLong(request.url_length()));
        }

        let addr = self.addr.clone().unwrap_or_else(|| host.socket_addr());
        let server_name =
            ServerName::try_from(host.name.clone()).map_err(|_| ClientError::InvalidServerName(host.name.clone()))?;

        let connect = self.connect(&addr, server_name);
        let mut stream = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| ClientError::ConnectTimeout(addr.clone()))??,
            None => connect.await?,
        };

        debug!("sending request for {}", request.0);
        stream
            .write_all(request.to_string().as_bytes())
            .await
            .map_err(ClientError::SendRequest)?;
        stream.flush().await.map_err(ClientError::SendRequest)?;

        let (tcp, session) = stream.get_ref();
        let peer_addr = tcp.peer_addr().map_err(|source| ClientError::Connect { addr: addr.clone(), source })?;
        let local_addr = tcp.local_addr().map_err(|source| ClientError::Connect { addr: addr.clone(), source })?;
        let session = SessionInfo::capture(session, Some(host.name.clone()));

        let mut reader = match self.read_buffer_size {
            Some(size) => BufReader::with_capacity(size, stream),
            None => BufReader::new(stream),
        };

        let header = match read_header(&mut reader).await {
            Ok(header) => header,
            Err(e) => {
                // Best effort; the header error is what the caller needs.
                let _ = reader.into_inner().shutdown().await;
                return Err(e);
            }
        };
        debug!("{} responded {:02} {}", host.name, header.status.code(), header.meta);

        let connection = ClientConnection { reader, session, peer_addr, local_addr, deadline: Deadline::default() };
        Ok((connection, header))
    }

    async fn connect(&self, addr: &str, server_name: ServerName<'static>) -> Result<TlsStream<TcpStream>, ClientError> {
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|source| ClientError::Connect { addr: addr.to_string(), source })?;

        TlsConnector::from(self.config.clone())
            .connect(server_name, tcp)
            .await
            .map_err(ClientError::Handshake)
    }
}

async fn read_header(reader: &mut BufReader<TlsStream<TcpStream>>) -> Result<ResponseHeader, ClientError> {
    let line = read_line(reader, MAX_HEADER_LINE).await?;
    Ok(ResponseHeader::decode(&line)?)
}

/// Dial `url` with a one-off [`Dialer`].
pub async fn dial(url: &str, config: Arc<ClientConfig>) -> Result<(ClientConnection, ResponseHeader), ClientError> {
    Dialer::new(config).dial(url).await
}
