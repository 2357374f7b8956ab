//! DoH server stream state machine (spec sections 3 and 4.D)
//!
//! One `hyper` HTTP/2 connection per accepted TLS stream; `hyper`'s own
//! per-stream HEADERS/DATA/END_STREAM bookkeeping plays the role of the
//! `StreamEntry` spec section 3 describes — the validation pipeline
//! below is a pure function from request metadata to either an accepted
//! body or a terminal status, kept free of any HTTP/2 machinery per the
//! design notes in spec section 9.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::dns::doh_codec::{DohCodecError, DOH_MEDIA_TYPE};
use crate::dns::message::DnsMessage;
use crate::dns::trust::TrustedProxies;
use crate::dns::upstream::UpstreamClient;

const SERVER_IDENTIFIER: &str = "doh-gateway";

#[derive(Clone)]
pub struct DohServerConfig {
    pub endpoint_path: String,
    pub trusted_proxies: TrustedProxies,
    pub upstream_timeout: Duration,
    pub verbose_errors: bool,
}

pub struct DohServer {
    config: DohServerConfig,
    upstream: Arc<UpstreamClient>,
}

impl DohServer {
    pub fn new(config: DohServerConfig, upstream: Arc<UpstreamClient>) -> Self {
        Self { config, upstream }
    }

    /// Accept loop: one task per TCP connection, TLS handshake, then
    /// hand the connection to `hyper`'s HTTP/2 server. Malformed or
    /// reset connections never bring the listener down.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        tls_acceptor: TlsAcceptor,
    ) -> std::io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let acceptor = tls_acceptor.clone();
            let this = Arc::clone(&self);

            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(s) => s,
                    Err(e) => {
                        debug!(%peer, error = %e, "TLS handshake failed");
                        return;
                    }
                };

                let io = TokioIo::new(tls_stream);
                let service = hyper::service::service_fn(move |req| {
                    let this = Arc::clone(&this);
                    async move { this.handle(req, peer).await }
                });

                if let Err(e) = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await
                {
                    debug!(%peer, error = %e, "HTTP/2 connection ended");
                }
            });
        }
    }

    async fn handle(
        &self,
        req: Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let forwarded_for = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok());
        let client_ip = self
            .config
            .trusted_proxies
            .resolve_client_ip(peer.ip(), forwarded_for);

        // 1. Method
        let method = req.method().clone();
        if method != Method::GET && method != Method::POST && method != Method::HEAD {
            debug!(%client_ip, %method, "rejecting unsupported method");
            return Ok(text_response(
                StatusCode::NOT_IMPLEMENTED,
                "Not Implemented",
            ));
        }

        // 2. Path
        if req.uri().path() != self.config.endpoint_path {
            debug!(%client_ip, path = %req.uri().path(), "rejecting wrong path");
            return Ok(text_response(StatusCode::NOT_FOUND, "Wrong path"));
        }

        let is_head = method == Method::HEAD;

        // 3/4. Extract body bytes per method
        let body_bytes = if method == Method::POST {
            let content_type = req
                .headers()
                .get(hyper::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if content_type != DOH_MEDIA_TYPE {
                debug!(%client_ip, %content_type, "rejecting unsupported content type");
                return Ok(text_response(
                    StatusCode::UNSUPPORTED_MEDIA_TYPE,
                    "Unsupported content type",
                ));
            }

            match req.into_body().collect().await {
                Ok(collected) => {
                    let bytes = collected.to_bytes();
                    if bytes.is_empty() {
                        return Ok(codec_error_response(DohCodecError::MissingBody));
                    }
                    bytes.to_vec()
                }
                Err(e) => {
                    warn!(%client_ip, error = %e, "failed reading request body");
                    return Ok(text_response(StatusCode::BAD_REQUEST, "Failed to read body"));
                }
            }
        } else {
            let query = req.uri().query().unwrap_or("");
            match crate::dns::doh_codec::decode_get_query(query) {
                Ok(bytes) => bytes,
                Err(e) => return Ok(codec_error_response(e)),
            }
        };

        // 5. Parse DNS message
        let query_msg = match DnsMessage::parse(&body_bytes) {
            Ok(m) => m,
            Err(e) => {
                let body = if self.config.verbose_errors {
                    e.to_string()
                } else {
                    "Malformed DNS query".to_string()
                };
                return Ok(text_response(StatusCode::BAD_REQUEST, &body));
            }
        };

        debug!(%client_ip, question = ?query_msg.question_name(), "resolving DoH query");

        let answer = match self
            .upstream
            .query(&query_msg, client_ip, self.config.upstream_timeout)
            .await
        {
            Ok(Some(answer)) => answer,
            Ok(None) => servfail_for(&query_msg),
            Err(e) => {
                warn!(%client_ip, error = %e, "upstream returned malformed response");
                servfail_for(&query_msg)
            }
        };

        Ok(self.build_success_response(&answer, is_head))
    }

    fn build_success_response(&self, answer: &DnsMessage, is_head: bool) -> Response<Full<Bytes>> {
        let wire = match answer.serialize() {
            Ok(w) => w,
            Err(e) => {
                warn!(error = %e, "failed to serialize DoH answer");
                return text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to encode response",
                );
            }
        };

        let content_length = if is_head { 0 } else { wire.len() };
        let body = if is_head {
            Bytes::new()
        } else {
            Bytes::from(wire)
        };

        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, DOH_MEDIA_TYPE)
            .header(hyper::header::CONTENT_LENGTH, content_length)
            .header(hyper::header::SERVER, SERVER_IDENTIFIER);

        if let Some(ttl) = answer.min_answer_ttl() {
            builder = builder.header(hyper::header::CACHE_CONTROL, format!("max-age={}", ttl));
        }

        builder.body(Full::new(body)).expect("valid response")
    }
}

/// Synthesize a SERVFAIL answer echoing the original question, per
/// spec section 6 ("On SERVFAIL, the body is a synthesized response
/// with rcode 2 and the original question echoed") and section 8
/// scenario 7 (still a 200-status DoH response).
fn servfail_for(query: &DnsMessage) -> DnsMessage {
    match DnsMessage::make_response(query) {
        Ok(mut response) => {
            response.set_rcode(hickory_proto::op::ResponseCode::ServFail);
            response
        }
        Err(_) => DnsMessage::servfail_for_id(query.id()),
    }
}

fn codec_error_response(err: DohCodecError) -> Response<Full<Bytes>> {
    let body = match err {
        DohCodecError::InvalidBase64(_) | DohCodecError::MissingBodyParameter => {
            "Invalid Body Parameter"
        }
        DohCodecError::MissingBody => "Missing Body",
    };
    text_response(StatusCode::BAD_REQUEST, body)
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("valid response")
}
