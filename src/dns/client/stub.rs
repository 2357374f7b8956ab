//! Stub resolver-facing DNS listener backed by a persistent DoH session
//! (spec section 4.E)
//!
//! UDP and TCP ingress each spawn one task per query; every task shares
//! the same [`SessionManager`]-held HTTP/2 connection to the upstream
//! DoH server. A connection's queries are cancelled together when the
//! TCP client disconnects, so a late upstream answer is dropped instead
//! of written to a socket nobody is reading anymore.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http2::SendRequest;
use hyper::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Method, Request, Response, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dns::doh_codec::{b64_encode, DOH_MEDIA_TYPE};
use crate::dns::framing::{frame, FrameDecoder};
use crate::dns::message::DnsMessage;

#[derive(Error, Debug)]
enum StubError {
    #[error("failed to connect to upstream: {0}")]
    Connect(std::io::Error),
    #[error("TLS handshake with upstream failed: {0}")]
    Tls(std::io::Error),
    #[error("configured stub domain is not a valid TLS server name")]
    InvalidAuthority,
    #[error("HTTP/2 layer error: {0}")]
    Handshake(hyper::Error),
    #[error("failed to build request: {0}")]
    Request(http::Error),
}

/// Static configuration for one stub pipeline instance.
pub struct StubConfig {
    pub listen_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub authority: String,
    pub uri_path: String,
    pub use_post: bool,
    pub tls_config: Arc<ClientConfig>,
}

/// Holds the single shared upstream HTTP/2 session, guarded by a mutex
/// only for the "inspect or reconnect" window (spec section 5: the
/// mutex is never held across per-request I/O).
struct SessionManager {
    remote_addr: SocketAddr,
    authority: String,
    connector: TlsConnector,
    cell: Mutex<Option<SendRequest<Full<Bytes>>>>,
}

impl SessionManager {
    fn new(remote_addr: SocketAddr, authority: String, tls_config: Arc<ClientConfig>) -> Self {
        Self {
            remote_addr,
            authority,
            connector: TlsConnector::from(tls_config),
            cell: Mutex::new(None),
        }
    }

    async fn get_or_connect(&self) -> Result<SendRequest<Full<Bytes>>, StubError> {
        let mut guard = self.cell.lock().await;
        if let Some(existing) = guard.as_ref() {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
        }
        let fresh = self.connect().await?;
        *guard = Some(fresh.clone());
        Ok(fresh)
    }

    async fn force_reconnect(&self) -> Result<SendRequest<Full<Bytes>>, StubError> {
        let mut guard = self.cell.lock().await;
        let fresh = self.connect().await?;
        *guard = Some(fresh.clone());
        Ok(fresh)
    }

    async fn connect(&self) -> Result<SendRequest<Full<Bytes>>, StubError> {
        let tcp = TcpStream::connect(self.remote_addr)
            .await
            .map_err(StubError::Connect)?;
        let server_name = ServerName::try_from(self.authority.clone())
            .map_err(|_| StubError::InvalidAuthority)?;
        let tls_stream = self
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(StubError::Tls)?;
        let io = TokioIo::new(tls_stream);

        let (send_request, connection) =
            hyper::client::conn::http2::Builder::new(TokioExecutor::new())
                .handshake(io)
                .await
                .map_err(StubError::Handshake)?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "stub upstream session ended");
            }
        });
        debug!(upstream = %self.remote_addr, "established new stub upstream session");
        Ok(send_request)
    }
}

pub struct StubPipeline {
    config: StubConfig,
    sessions: SessionManager,
}

impl StubPipeline {
    pub fn new(config: StubConfig) -> Self {
        let sessions = SessionManager::new(
            config.remote_addr,
            config.authority.clone(),
            Arc::clone(&config.tls_config),
        );
        Self { config, sessions }
    }

    /// Bind both ingress listeners and run until `shutdown` fires.
    /// Binding failure here is the one fatal error this pipeline raises
    /// (spec section 7): everything after that point is logged and
    /// survived.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> std::io::Result<()> {
        let udp_socket = Arc::new(UdpSocket::bind(self.config.listen_addr).await?);
        let tcp_listener = TcpListener::bind(self.config.listen_addr).await?;

        let udp_task = {
            let this = Arc::clone(&self);
            let socket = Arc::clone(&udp_socket);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { this.run_udp(socket, shutdown).await })
        };
        let tcp_task = {
            let this = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { this.run_tcp(tcp_listener, shutdown).await })
        };

        let _ = tokio::join!(udp_task, tcp_task);
        Ok(())
    }

    async fn run_udp(self: Arc<Self>, socket: Arc<UdpSocket>, shutdown: CancellationToken) {
        let mut buf = vec![0u8; 65535];
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                result = socket.recv_from(&mut buf) => {
                    let (len, peer) = match result {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(error = %e, "udp recv failed");
                            continue;
                        }
                    };
                    let payload = buf[..len].to_vec();
                    let this = Arc::clone(&self);
                    let socket = Arc::clone(&socket);
                    tokio::spawn(async move {
                        if let Some(wire) = this.execute(&payload).await {
                            let _ = socket.send_to(&wire, peer).await;
                        }
                    });
                }
            }
        }
    }

    async fn run_tcp(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                result = listener.accept() => {
                    let (stream, peer) = match result {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(error = %e, "tcp accept failed");
                            continue;
                        }
                    };
                    let this = Arc::clone(&self);
                    let conn_token = shutdown.child_token();
                    tokio::spawn(async move { this.handle_tcp_connection(stream, peer, conn_token).await });
                }
            }
        }
    }

    /// One task per connection: frames are decoded as they arrive, each
    /// spawns its own request task racing the connection's
    /// cancellation token, and EOF/read errors cancel every in-flight
    /// request belonging to this connection.
    async fn handle_tcp_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        token: CancellationToken,
    ) {
        let (mut reader, writer) = stream.into_split();
        let writer = Arc::new(Mutex::new(writer));
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 4096];

        loop {
            if let Some(payload) = decoder.pop_frame() {
                let this = Arc::clone(&self);
                let writer = Arc::clone(&writer);
                let req_token = token.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = req_token.cancelled() => {
                            debug!(%peer, "dropping stub request, connection gone");
                        }
                        answer = this.execute(&payload) => {
                            if let Some(wire) = answer {
                                let mut w = writer.lock().await;
                                let _ = w.write_all(&frame(&wire)).await;
                            }
                        }
                    }
                });
                continue;
            }

            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    token.cancel();
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(%peer, error = %e, "tcp read failed");
                    token.cancel();
                    return;
                }
            };
            decoder.push(&buf[..n]);
        }
    }

    /// Resolve one ingress query upstream. Every failure path is a
    /// silent drop (the origin resolver will retransmit), per spec
    /// section 7 — nothing here is fatal to the pipeline.
    async fn execute(&self, payload: &[u8]) -> Option<Vec<u8>> {
        let query = match DnsMessage::parse(payload) {
            Ok(q) => q,
            Err(e) => {
                debug!(error = %e, "dropping malformed ingress query");
                return None;
            }
        };
        let original_id = query.id();

        let mut rewritten = query.clone();
        rewritten.set_id(0);
        let wire = match rewritten.serialize() {
            Ok(w) => w,
            Err(e) => {
                debug!(error = %e, "failed to serialize outbound query");
                return None;
            }
        };

        let mut send_request = match self.sessions.get_or_connect().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "no stub upstream session available");
                return None;
            }
        };

        let response = match self.send(&mut send_request, &wire).await {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "stub upstream request failed, rebuilding session and retrying once");
                let mut retried = match self.sessions.force_reconnect().await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(error = %e, "session rebuild failed, dropping query");
                        return None;
                    }
                };
                match self.send(&mut retried, &wire).await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "retry failed, dropping query");
                        return None;
                    }
                }
            }
        };

        if !response.status().is_success() {
            debug!(status = %response.status(), "stub upstream returned non-success status");
            return None;
        }

        let body = match response.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!(error = %e, "failed reading stub upstream response body");
                return None;
            }
        };

        let mut answer = match DnsMessage::parse(&body) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "malformed response from stub upstream");
                return None;
            }
        };
        answer.set_id(original_id);
        answer.serialize().ok()
    }

    async fn send(
        &self,
        send_request: &mut SendRequest<Full<Bytes>>,
        wire: &[u8],
    ) -> Result<Response<Incoming>, StubError> {
        let request = build_request(&self.config, wire).map_err(StubError::Request)?;
        send_request.ready().await.map_err(StubError::Handshake)?;
        send_request
            .send_request(request)
            .await
            .map_err(StubError::Handshake)
    }
}

/// Build one DoH request per spec section 4.E step 2-5: GET unless
/// `use_post`, `Accept: application/dns-message`, and for GET the wire
/// query is carried url-safe-base64 in the `dns` query parameter.
fn build_request(config: &StubConfig, wire: &[u8]) -> Result<Request<Full<Bytes>>, http::Error> {
    let (method, path_and_query, body, content_length) = if config.use_post {
        (
            Method::POST,
            config.uri_path.clone(),
            Full::new(Bytes::from(wire.to_vec())),
            wire.len(),
        )
    } else {
        let encoded = b64_encode(wire);
        (
            Method::GET,
            format!("{}?dns={}", config.uri_path, encoded),
            Full::new(Bytes::new()),
            0,
        )
    };

    let uri = Uri::builder()
        .scheme("https")
        .authority(config.authority.as_str())
        .path_and_query(path_and_query)
        .build()?;

    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(ACCEPT, DOH_MEDIA_TYPE)
        .header(CONTENT_LENGTH, content_length);

    if config.use_post {
        builder = builder.header(CONTENT_TYPE, DOH_MEDIA_TYPE);
    }

    builder.body(body)
}
