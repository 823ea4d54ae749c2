//! End-to-end exchanges between a [`Dialer`] and a [`Server`] over loopback.

use std::{
    io,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use rustls::{
    ServerConfig,
    pki_types::ServerName,
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::Instant,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;

use crate::{
    ClientError, Dialer, GEMTEXT, HeaderError, ResponseHeader, ResponseWriter, Server, ServerConnection,
    ServerVerification, Status, TlsProtocolVersion, TofuStore, URL, client::tofu::fingerprint, listen, tls,
};

fn testdata(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("testdata").join(name)
}

fn server_config() -> Arc<ServerConfig> {
    let chain = tls::load_certificates(testdata("cert.pem")).unwrap();
    let key = tls::load_private_key(testdata("key.pem")).unwrap();
    Arc::new(tls::server_config(chain, key).unwrap())
}

fn dialer(addr: SocketAddr, verification: ServerVerification) -> Dialer {
    Dialer::new(Arc::new(tls::client_config(verification).unwrap())).addr(addr.to_string())
}

fn insecure_dialer(addr: SocketAddr) -> Dialer {
    dialer(addr, ServerVerification::Insecure)
}

async fn serve<H, Fut>(handler: H) -> SocketAddr
where
    H: Fn(ServerConnection, URL) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(listen(listener, server_config(), handler));
    addr
}

#[tokio::test]
async fn success_with_body() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let addr = serve(move |mut conn, url| {
        let tx = tx.clone();
        async move {
            tx.send((url.to_string(), conn.session().server_name.clone())).unwrap();
            conn.write_all(&ResponseHeader::success(GEMTEXT).to_bytes()).await.unwrap();
            conn.write_all(b"# hi\n").await.unwrap();
            conn.finish().await.unwrap();
        }
    })
    .await;

    let (mut conn, header) = insecure_dialer(addr).dial("gemini://example.org").await.unwrap();
    assert_eq!(header.status, Status::SUCCESS);
    assert!(header.status.is_success());
    assert_eq!(header.meta, "text/gemini");

    let mut body = Vec::new();
    conn.read_to_end(&mut body).await.unwrap();
    assert_eq!(body, b"# hi\n");

    let (request, server_name) = rx.recv().await.unwrap();
    assert_eq!(request, "gemini://example.org/");
    assert_eq!(server_name.as_deref(), Some("example.org"));

    assert_eq!(conn.session().protocol_version, TlsProtocolVersion::Tls1_3);
    assert_eq!(conn.peer_addr(), addr);
    assert_eq!(conn.session().peer_certificates.len(), 1);
    conn.close().await.unwrap();
}

#[tokio::test]
async fn slow_down_without_body() {
    let addr = serve(|mut conn, _| async move {
        ResponseHeader::slow_down(Duration::from_secs(5)).finish_to(&mut conn).await.unwrap();
    })
    .await;

    let (mut conn, header) = insecure_dialer(addr).dial("gemini://example.org/").await.unwrap();
    assert_eq!(header.status, Status::SLOW_DOWN);
    assert!(header.status.is_temporary_failure());
    assert_eq!(header.meta, "5");

    let mut body = Vec::new();
    assert_eq!(conn.read_to_end(&mut body).await.unwrap(), 0);
}

#[tokio::test]
async fn explicit_port_and_query_reach_the_handler() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let addr = serve(move |mut conn, url| {
        let tx = tx.clone();
        async move {
            tx.send(url).unwrap();
            ResponseHeader::input("name?").finish_to(&mut conn).await.unwrap();
        }
    })
    .await;

    let (_conn, header) = insecure_dialer(addr).dial("gemini://example.org:1966/search?q").await.unwrap();
    assert_eq!(header, ResponseHeader::input("name?"));

    let url = rx.recv().await.unwrap();
    assert_eq!(url.port_or_default(), 1966);
    assert_eq!(url.path(), "/search");
    assert_eq!(url.query(), Some("q"));
}

#[tokio::test]
async fn response_writer_sends_default_header() {
    let addr = serve(|conn, _| async move {
        let mut writer = ResponseWriter::new(conn);
        writer.write_all(b"hello ").await.unwrap();
        writer.write_all(b"world").await.unwrap();
        writer.finish().await.unwrap();
    })
    .await;

    let (mut conn, header) = insecure_dialer(addr).dial("gemini://example.org/").await.unwrap();
    assert_eq!(header, ResponseHeader::success(GEMTEXT));

    let mut body = String::new();
    conn.read_to_string(&mut body).await.unwrap();
    assert_eq!(body, "hello world");
}

#[tokio::test]
async fn response_writer_explicit_header() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let addr = serve(move |conn, _| {
        let tx = tx.clone();
        async move {
            let mut writer = ResponseWriter::new(conn);
            writer.write_header(&ResponseHeader::success("text/plain")).await.unwrap();
            writer.write_all(b"plain").await.unwrap();
            writer.flush().await.unwrap();

            let second = tokio::spawn(async move {
                writer.write_header(&ResponseHeader::not_found()).await.ok();
            });
            tx.send(second.await.unwrap_err().is_panic()).unwrap();
        }
    })
    .await;

    let (mut conn, header) = insecure_dialer(addr).dial("gemini://example.org/").await.unwrap();
    assert_eq!(header.meta, "text/plain");

    assert!(rx.recv().await.unwrap(), "second header was accepted");

    // The panicking task dropped the connection without finishing.
    let mut body = Vec::new();
    let result = conn.read_to_end(&mut body).await;
    assert_eq!(body, b"plain");
    assert!(result.is_err());
}

#[tokio::test]
async fn finish_to_through_response_writer_sends_one_header() {
    let addr = serve(|conn, _| async move {
        let mut writer = ResponseWriter::new(conn);
        ResponseHeader::not_found().finish_to(&mut writer).await.unwrap();
        assert!(writer.header_written());
    })
    .await;

    let (mut conn, header) = insecure_dialer(addr).dial("gemini://example.org/missing").await.unwrap();
    assert_eq!(header.status, Status::NOT_FOUND);
    assert_eq!(header, ResponseHeader::not_found());

    let mut body = Vec::new();
    conn.read_to_end(&mut body).await.unwrap();
    assert!(body.is_empty());
}

#[tokio::test]
async fn writes_fail_after_termination() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let addr = serve(move |mut conn, url| {
        let tx = tx.clone();
        async move {
            ResponseHeader::success(GEMTEXT).finish_to(&mut conn).await.unwrap();
            let after_finish = conn.write_all(b"late").await.unwrap_err().kind();
            conn.close();
            let after_close = conn.write_all(b"later").await.unwrap_err().kind();
            tx.send((url.path().to_string(), after_finish, after_close, conn.is_closed())).unwrap();
        }
    })
    .await;

    let (mut conn, _) = insecure_dialer(addr).dial("gemini://example.org/finish").await.unwrap();
    let mut body = Vec::new();
    conn.read_to_end(&mut body).await.unwrap();
    assert!(body.is_empty());

    let (path, after_finish, after_close, closed) = rx.recv().await.unwrap();
    assert_eq!(path, "/finish");
    assert_eq!(after_finish, io::ErrorKind::NotConnected);
    assert_eq!(after_close, io::ErrorKind::NotConnected);
    assert!(closed);
}

#[tokio::test]
async fn finish_after_close_panics() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let addr = serve(move |mut conn, _| {
        let tx = tx.clone();
        async move {
            conn.close();
            let finish = tokio::spawn(async move {
                conn.finish().await.ok();
            });
            tx.send(finish.await.unwrap_err().is_panic()).unwrap();
        }
    })
    .await;

    let result = insecure_dialer(addr).dial("gemini://example.org/").await;
    assert!(matches!(result, Err(ClientError::ReadHeader(_))));
    assert!(rx.recv().await.unwrap());
}

#[tokio::test]
async fn abrupt_close_is_not_a_clean_end() {
    let addr = serve(|mut conn, _| async move {
        conn.write_all(&ResponseHeader::success(GEMTEXT).to_bytes()).await.unwrap();
        conn.write_all(b"partial").await.unwrap();
        conn.flush().await.unwrap();
        conn.close();
    })
    .await;

    let (mut conn, header) = insecure_dialer(addr).dial("gemini://example.org/").await.unwrap();
    assert!(header.status.is_success());

    let mut body = Vec::new();
    assert!(conn.read_to_end(&mut body).await.is_err());
}

#[tokio::test]
async fn malformed_response_headers() {
    let addr = serve(|mut conn, url| async move {
        let line: &[u8] = match url.path() {
            "/no-separator" => b"20\r\n",
            "/not-a-number" => b"abc meta\r\n",
            "/too-big" => b"100 meta\r\n",
            _ => b"20 text/gemini\n",
        };
        conn.write_all(line).await.unwrap();
        conn.finish().await.unwrap();
    })
    .await;
    let dialer = insecure_dialer(addr);

    let result = dialer.dial("gemini://example.org/no-separator").await;
    assert!(matches!(result, Err(ClientError::InvalidHeader(HeaderError::MissingSeparator))));

    let result = dialer.dial("gemini://example.org/not-a-number").await;
    assert!(matches!(result, Err(ClientError::InvalidHeader(HeaderError::InvalidStatus(_)))));

    let result = dialer.dial("gemini://example.org/too-big").await;
    assert!(matches!(result, Err(ClientError::InvalidHeader(HeaderError::InvalidStatus(_)))));

    let result = dialer.dial("gemini://example.org/bare-lf").await;
    assert!(matches!(result, Err(ClientError::ReadHeader(_))));
}

#[tokio::test]
async fn malformed_header_closes_the_session_cleanly() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = TlsAcceptor::from(server_config());

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut stream = BufReader::new(acceptor.accept(tcp).await.unwrap());
        let mut request = String::new();
        stream.read_line(&mut request).await.unwrap();
        stream.write_all(b"abc\r\n").await.unwrap();
        stream.flush().await.unwrap();

        // Only a close_notify ends the read cleanly.
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.map(|_| rest)
    });

    let result = insecure_dialer(addr).dial("gemini://example.org/").await;
    assert!(matches!(result, Err(ClientError::InvalidHeader(HeaderError::MissingSeparator))));

    let rest = server.await.unwrap().unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn bad_clients_do_not_stop_the_listener() {
    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    let addr = serve(move |mut conn, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            ResponseHeader::success(GEMTEXT).finish_to(&mut conn).await.unwrap();
        }
    })
    .await;

    // Not TLS at all.
    let mut tcp = TcpStream::connect(addr).await.unwrap();
    tcp.write_all(b"gemini://example.org/\r\n").await.unwrap();
    let mut sink = Vec::new();
    let _ = tcp.read_to_end(&mut sink).await;

    // TLS, but the request line ends in a bare line feed.
    let config = tls::client_config(ServerVerification::Insecure).unwrap();
    let tcp = TcpStream::connect(addr).await.unwrap();
    let server_name = ServerName::try_from("example.org").unwrap();
    let mut stream = TlsConnector::from(Arc::new(config)).connect(server_name, tcp).await.unwrap();
    stream.write_all(b"gemini://example.org/\n").await.unwrap();
    stream.flush().await.unwrap();
    let mut sink = Vec::new();
    let _ = stream.read_to_end(&mut sink).await;
    assert!(sink.is_empty());

    let (_conn, header) = insecure_dialer(addr).dial("gemini://example.org/").await.unwrap();
    assert!(header.status.is_success());
    assert_eq!(handled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn handshake_timeout_drops_silent_clients() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(server_config()).handshake_timeout(Duration::from_millis(100));
    tokio::spawn(async move {
        server
            .listen(listener, |mut conn, _| async move {
                ResponseHeader::success(GEMTEXT).finish_to(&mut conn).await.unwrap();
            })
            .await
    });

    let mut silent = TcpStream::connect(addr).await.unwrap();
    let mut sink = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), silent.read_to_end(&mut sink)).await;
    assert!(read.is_ok(), "silent client was never dropped");

    let (_conn, header) = insecure_dialer(addr).dial("gemini://example.org/").await.unwrap();
    assert!(header.status.is_success());
}

#[tokio::test]
async fn listen_until_stops_on_shutdown() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let shutdown = CancellationToken::new();
    let server = Server::new(server_config());

    let task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { server.listen_until(listener, |_conn, _url| async {}, shutdown).await }
    });

    shutdown.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn read_deadline() {
    let addr = serve(|mut conn, _| async move {
        conn.write_all(&ResponseHeader::success(GEMTEXT).to_bytes()).await.unwrap();
        conn.flush().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        conn.finish().await.ok();
    })
    .await;

    let (mut conn, _) = insecure_dialer(addr).dial("gemini://example.org/").await.unwrap();
    conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)));

    let mut body = Vec::new();
    let error = conn.read_to_end(&mut body).await.unwrap_err();
    assert_eq!(error.kind(), io::ErrorKind::TimedOut);
}

#[tokio::test]
async fn client_certificates() {
    let addr = serve(|mut conn, _| async move {
        let header = match conn.session().peer_certificates.len() {
            0 => ResponseHeader::client_certificate_required(),
            _ => ResponseHeader::success(GEMTEXT),
        };
        header.finish_to(&mut conn).await.unwrap();
    })
    .await;

    let (_conn, header) = insecure_dialer(addr).dial("gemini://example.org/").await.unwrap();
    assert_eq!(header.status, Status::CLIENT_CERTIFICATE_REQUIRED);
    assert!(header.status.is_client_certificate_required());

    let chain = tls::load_certificates(testdata("cert.pem")).unwrap();
    let key = tls::load_private_key(testdata("key.pem")).unwrap();
    let config = tls::client_config_with_identity(ServerVerification::Insecure, chain, key).unwrap();
    let (_conn, header) = Dialer::new(Arc::new(config))
        .addr(addr.to_string())
        .dial("gemini://example.org/")
        .await
        .unwrap();
    assert_eq!(header.status, Status::SUCCESS);
}

#[tokio::test]
async fn trust_on_first_use() {
    let addr = serve(|mut conn, _| async move {
        ResponseHeader::success(GEMTEXT).finish_to(&mut conn).await.unwrap();
    })
    .await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("known_hosts.json");

    let store = TofuStore::open(&path).unwrap();
    let (conn, _) = dialer(addr, ServerVerification::Tofu(store)).dial("gemini://localhost/").await.unwrap();
    let expected = fingerprint(&conn.session().peer_certificates[0]);
    assert_eq!(TofuStore::open(&path).unwrap().fingerprint("localhost"), Some(expected.as_str()));

    let store = TofuStore::open(&path).unwrap();
    let result = dialer(addr, ServerVerification::Tofu(store)).dial("gemini://localhost/").await;
    assert!(result.is_ok());

    std::fs::write(&path, r#"{"known_hosts":{"localhost":"00"}}"#).unwrap();
    let store = TofuStore::open(&path).unwrap();
    let result = dialer(addr, ServerVerification::Tofu(store)).dial("gemini://localhost/").await;
    assert!(matches!(result, Err(ClientError::Handshake(_))));
}

#[tokio::test]
async fn connect_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = insecure_dialer(addr)
        .connect_timeout(Duration::from_secs(5))
        .dial("gemini://example.org/")
        .await;
    assert!(matches!(result, Err(ClientError::Connect { .. })));
}

#[derive(Debug)]
struct FixedIdentity(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedIdentity {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

#[tokio::test]
async fn trust_on_first_use_needs_a_valid_signature() {
    // The test certificate, served with a key that does not belong to it.
    let provider = Arc::new(tls::default_provider());
    let chain = tls::load_certificates(testdata("cert.pem")).unwrap();
    let key = tls::load_private_key(testdata("other_key.pem")).unwrap();
    let signing_key = provider.key_provider.load_private_key(key).unwrap();
    let config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(tls::DEFAULT_PROTOCOL_VERSIONS)
        .unwrap()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(FixedIdentity(Arc::new(CertifiedKey::new(chain, signing_key)))));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(listen(listener, Arc::new(config), |mut conn, _| async move {
        ResponseHeader::success(GEMTEXT).finish_to(&mut conn).await.unwrap();
    }));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("known_hosts.json");
    let store = TofuStore::open(&path).unwrap();
    let result = dialer(addr, ServerVerification::Tofu(store)).dial("gemini://localhost/").await;
    assert!(matches!(result, Err(ClientError::Handshake(_))));

    assert!(!path.exists());
    assert_eq!(TofuStore::open(&path).unwrap().fingerprint("localhost"), None);
}
