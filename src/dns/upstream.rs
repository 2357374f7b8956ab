//! Upstream DNS client: UDP first, TCP fallback on truncation
//!
//! The server pipeline's sole collaborator for reaching a classical
//! recursive resolver. One call to `query` fixes a deadline, tries UDP,
//! and falls back to TCP when the UDP answer is truncated or doesn't
//! arrive in time — spec section 4.C.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use rand::random;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::framing::{frame, FrameDecoder};
use super::message::{DnsError, DnsMessage};

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("malformed response from upstream: {0}")]
    Malformed(#[from] DnsError),
}

/// UDP+TCP client for a single configured upstream `(host, port)`.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    addr: SocketAddr,
}

impl UpstreamClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Resolve `dnsq` against the upstream, fixing and restoring its
    /// original transaction id across the upstream round trip (spec
    /// section 4.C step 1, invariant in section 3). `origin_ip` is
    /// carried only for log correlation.
    ///
    /// Returns `Ok(None)` when the overall deadline expires with no
    /// usable answer — the caller turns that into a SERVFAIL. Malformed
    /// upstream wire data is surfaced as an error rather than treated as
    /// "no answer", per spec section 4.C error semantics.
    pub async fn query(
        &self,
        dnsq: &DnsMessage,
        origin_ip: IpAddr,
        deadline: Duration,
    ) -> Result<Option<DnsMessage>, UpstreamError> {
        let original_id = dnsq.id();
        let mut outbound = dnsq.clone();
        let upstream_id: u16 = random();
        outbound.set_id(upstream_id);

        let wire = match outbound.serialize() {
            Ok(w) => w,
            Err(e) => return Err(UpstreamError::Malformed(e)),
        };

        let start = Instant::now();
        debug!(origin_ip = %origin_ip, upstream = %self.addr, "upstream query start");

        let udp_outcome = timeout(deadline, self.query_udp(&wire)).await;

        let mut answer = match udp_outcome {
            Ok(Ok(Some(msg))) if !msg.truncated() => Some(msg),
            Ok(Ok(Some(_truncated))) => {
                debug!(upstream = %self.addr, "UDP answer truncated, falling back to TCP");
                None
            }
            Ok(Ok(None)) => None,
            Ok(Err(e)) => return Err(e),
            Err(_elapsed) => {
                debug!(upstream = %self.addr, "UDP attempt timed out, trying TCP");
                None
            }
        };

        if answer.is_none() {
            let remaining = deadline.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Ok(None);
            }
            answer = match timeout(remaining, self.query_tcp(&wire)).await {
                Ok(Ok(msg)) => msg,
                Ok(Err(e)) => return Err(e),
                Err(_elapsed) => {
                    debug!(upstream = %self.addr, "TCP fallback timed out");
                    None
                }
            };
        }

        Ok(answer.map(|mut msg| {
            msg.set_id(original_id);
            msg
        }))
    }

    /// Send over UDP and await one datagram. Socket errors are logged
    /// and folded into `Ok(None)`; a malformed reply is a hard error.
    async fn query_udp(&self, wire: &[u8]) -> Result<Option<DnsMessage>, UpstreamError> {
        let local: SocketAddr = if self.addr.is_ipv6() {
            "[::]:0".parse().unwrap()
        } else {
            "0.0.0.0:0".parse().unwrap()
        };

        let socket = match UdpSocket::bind(local).await {
            Ok(s) => s,
            Err(e) => {
                warn!(upstream = %self.addr, error = %e, "failed to bind UDP socket");
                return Ok(None);
            }
        };

        if let Err(e) = socket.connect(self.addr).await {
            warn!(upstream = %self.addr, error = %e, "failed to connect UDP socket");
            return Ok(None);
        }

        if let Err(e) = socket.send(wire).await {
            warn!(upstream = %self.addr, error = %e, "failed to send UDP query");
            return Ok(None);
        }

        let mut buf = vec![0u8; 65535];
        let len = match socket.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                warn!(upstream = %self.addr, error = %e, "UDP recv failed");
                return Ok(None);
            }
        };

        let msg = DnsMessage::parse(&buf[..len])?;
        Ok(Some(msg))
    }

    /// TCP fallback: length-prefixed request, length-prefixed response,
    /// using the shared `FrameDecoder` so split/concatenated reads are
    /// handled the same way the stub's ingress listener handles them.
    /// Socket-level failures fold into `Ok(None)` after logging; only a
    /// successfully decoded-but-malformed frame is an error.
    async fn query_tcp(&self, wire: &[u8]) -> Result<Option<DnsMessage>, UpstreamError> {
        let mut stream = match TcpStream::connect(self.addr).await {
            Ok(s) => s,
            Err(e) => {
                warn!(upstream = %self.addr, error = %e, "TCP connect failed");
                return Ok(None);
            }
        };

        if let Err(e) = stream.write_all(&frame(wire)).await {
            warn!(upstream = %self.addr, error = %e, "TCP write failed");
            return Ok(None);
        }

        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 4096];

        loop {
            if let Some(payload) = decoder.pop_frame() {
                let msg = DnsMessage::parse(&payload)?;
                return Ok(Some(msg));
            }

            let n = match stream.read(&mut buf).await {
                Ok(0) => {
                    if decoder.pending() > 0 {
                        debug!(upstream = %self.addr, "TCP EOF with unconsumed partial frame");
                    }
                    return Ok(None);
                }
                Ok(n) => n,
                Err(e) => {
                    warn!(upstream = %self.addr, error = %e, "TCP read failed");
                    return Ok(None);
                }
            };

            decoder.push(&buf[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::RecordType;
    use tokio::net::TcpListener;

    fn query(id: u16) -> DnsMessage {
        DnsMessage::make_query(id, "example.com", RecordType::A, false).unwrap()
    }

    #[tokio::test]
    async fn udp_success_preserves_original_id() {
        let upstream_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (len, peer) = upstream_socket.recv_from(&mut buf).await.unwrap();
            let received = DnsMessage::parse(&buf[..len]).unwrap();
            let response = DnsMessage::make_response(&received).unwrap();
            upstream_socket
                .send_to(&response.serialize().unwrap(), peer)
                .await
                .unwrap();
        });

        let client = UpstreamClient::new(upstream_addr);
        let q = query(0x1234);
        let result = client
            .query(&q, "127.0.0.1".parse().unwrap(), Duration::from_secs(2))
            .await
            .unwrap();

        let answer = result.expect("expected an answer");
        assert_eq!(answer.id(), 0x1234);
    }

    #[tokio::test]
    async fn truncated_udp_falls_back_to_tcp() {
        let udp_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp_addr = udp_socket.local_addr().unwrap();

        // UDP and TCP port numbers are independent namespaces, so binding
        // TCP on the same port the UDP socket picked is always legal.
        let tcp_listener = TcpListener::bind(udp_addr).await.unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (len, peer) = udp_socket.recv_from(&mut buf).await.unwrap();
            let received = DnsMessage::parse(&buf[..len]).unwrap();
            let mut response = DnsMessage::make_response(&received).unwrap();
            response.set_truncated(true);
            udp_socket
                .send_to(&response.serialize().unwrap(), peer)
                .await
                .unwrap();
        });

        tokio::spawn(async move {
            let (mut stream, _) = tcp_listener.accept().await.unwrap();
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; 4096];
            let payload = loop {
                if let Some(p) = decoder.pop_frame() {
                    break p;
                }
                let n = stream.read(&mut buf).await.unwrap();
                decoder.push(&buf[..n]);
            };
            let received = DnsMessage::parse(&payload).unwrap();
            let response = DnsMessage::make_response(&received).unwrap();
            stream
                .write_all(&frame(&response.serialize().unwrap()))
                .await
                .unwrap();
        });

        let client = UpstreamClient::new(udp_addr);
        let q = query(0xabcd);
        let result = client
            .query(&q, "127.0.0.1".parse().unwrap(), Duration::from_secs(2))
            .await
            .unwrap();

        let answer = result.expect("expected TCP fallback answer");
        assert_eq!(answer.id(), 0xabcd);
        assert!(!answer.truncated());
    }

    #[tokio::test]
    async fn no_response_returns_none_on_deadline() {
        // Nothing is listening on this address; the UDP send will
        // likely succeed locally (connected UDP) but nothing replies.
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        drop(socket); // free the port, ensure nobody answers

        let client = UpstreamClient::new(addr);
        let q = query(1);
        let result = client
            .query(&q, "127.0.0.1".parse().unwrap(), Duration::from_millis(200))
            .await
            .unwrap();

        assert!(result.is_none());
    }
}
