use async_trait::async_trait;
use log::{debug, warn};
use rand::Rng;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use crate::dns_message::{self, Question, Response};
use crate::errors::{DnsError, DnsResult};

/// A recursive resolver the policy handlers can query.
///
/// Implementations must chase CNAMEs themselves (a stub pointed at a real
/// recursive server does); the handlers treat the returned sections as
/// final.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn send_query(&self, qname: &str, qtype: u16, qclass: u16) -> DnsResult<Response>;
}

/// Forwards queries to one of the configured upstream servers over UDP,
/// falling back to TCP when the answer comes back truncated.
pub struct UdpUpstream {
    servers: Vec<String>,
    timeout_secs: u64,
    packet_len_max: usize,
}

impl UdpUpstream {
    pub fn new(servers: Vec<String>, timeout_secs: u64, packet_len_max: usize) -> Self {
        Self {
            servers,
            timeout_secs,
            packet_len_max,
        }
    }

    fn pick_server(&self) -> DnsResult<SocketAddr> {
        if self.servers.is_empty() {
            return Err(DnsError::UpstreamError(
                "No upstream servers configured".to_string(),
            ));
        }
        let server = &self.servers[rand::thread_rng().gen_range(0..self.servers.len())];
        server.parse::<SocketAddr>().map_err(|e| {
            DnsError::UpstreamError(format!("Failed to parse upstream server address {server}: {e}"))
        })
    }

    /// Retries the exchange over TCP with the 2-byte length prefix
    async fn exchange_tcp(&self, addr: SocketAddr, query_data: &[u8]) -> DnsResult<Vec<u8>> {
        let timeout = Duration::from_secs(self.timeout_secs);
        let connect = TcpStream::connect(addr);
        let mut stream = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| DnsError::UpstreamTimeout)?
            .map_err(|e| DnsError::UpstreamError(format!("TCP connect to {addr} failed: {e}")))?;

        let mut framed = Vec::with_capacity(query_data.len() + 2);
        framed.extend_from_slice(&(query_data.len() as u16).to_be_bytes());
        framed.extend_from_slice(query_data);
        stream
            .write_all(&framed)
            .await
            .map_err(|e| DnsError::UpstreamError(format!("TCP send to {addr} failed: {e}")))?;

        let exchange = async {
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let len = u16::from_be_bytes(len_buf) as usize;
            let mut response = vec![0u8; len];
            stream.read_exact(&mut response).await?;
            Ok::<Vec<u8>, std::io::Error>(response)
        };

        let response = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| DnsError::UpstreamTimeout)?
            .map_err(|e| DnsError::UpstreamError(format!("TCP receive from {addr} failed: {e}")))?;

        if response.len() > self.packet_len_max {
            return Err(DnsError::PacketTooLarge {
                size: response.len(),
                max_size: self.packet_len_max,
            });
        }
        Ok(response)
    }

    fn decode_checked(&self, packet: &[u8], expected_tid: u16) -> DnsResult<Response> {
        let (tid, response) = dns_message::decode_response(packet)?;
        if tid != expected_tid {
            return Err(DnsError::UpstreamError(format!(
                "transaction ID mismatch: sent {expected_tid}, got {tid}"
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl Upstream for UdpUpstream {
    async fn send_query(&self, qname: &str, qtype: u16, qclass: u16) -> DnsResult<Response> {
        let upstream_addr = self.pick_server()?;
        let tid: u16 = rand::thread_rng().gen();
        let question = Question {
            name: qname.to_string(),
            qtype,
            qclass,
        };
        let query_data = dns_message::encode_query(tid, &question)?;

        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(|e| {
            DnsError::UpstreamError(format!("Failed to bind socket for upstream connection: {e}"))
        })?;

        // First attempt gets half the budget, the retry gets the rest
        let initial_timeout = std::cmp::max(1, self.timeout_secs / 2);
        let mut buf = vec![0u8; self.packet_len_max];

        debug!("Sending query for {qname} to upstream server {upstream_addr}");
        socket
            .send_to(&query_data, &upstream_addr)
            .await
            .map_err(|e| {
                DnsError::UpstreamError(format!(
                    "Failed to send query to upstream server {upstream_addr}: {e}"
                ))
            })?;

        let received = match tokio::time::timeout(
            Duration::from_secs(initial_timeout),
            socket.recv_from(&mut buf),
        )
        .await
        {
            Ok(Ok((len, _))) => len,
            Ok(Err(e)) => {
                return Err(DnsError::UpstreamError(format!(
                    "Failed to receive response from upstream server {upstream_addr}: {e}"
                )));
            }
            Err(_) => {
                debug!(
                    "Timeout after {initial_timeout}s waiting for {upstream_addr}, retrying query for {qname}"
                );
                socket
                    .send_to(&query_data, &upstream_addr)
                    .await
                    .map_err(|e| {
                        DnsError::UpstreamError(format!(
                            "Failed to send retry query to upstream server {upstream_addr}: {e}"
                        ))
                    })?;

                let remaining = self.timeout_secs.saturating_sub(initial_timeout).max(1);
                match tokio::time::timeout(
                    Duration::from_secs(remaining),
                    socket.recv_from(&mut buf),
                )
                .await
                {
                    Ok(Ok((len, _))) => len,
                    Ok(Err(e)) => {
                        return Err(DnsError::UpstreamError(format!(
                            "Failed to receive response from upstream server {upstream_addr}: {e}"
                        )));
                    }
                    Err(_) => return Err(DnsError::UpstreamTimeout),
                }
            }
        };

        let packet = &buf[..received];
        if dns_message::is_truncated(packet) {
            debug!("Truncated answer for {qname} from {upstream_addr}, retrying over TCP");
            let tcp_response = self.exchange_tcp(upstream_addr, &query_data).await?;
            return self.decode_checked(&tcp_response, tid);
        }

        match self.decode_checked(packet, tid) {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!("Discarding bad response from {upstream_addr} for {qname}: {e}");
                Err(e)
            }
        }
    }
}
