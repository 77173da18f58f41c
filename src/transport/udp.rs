//! UDP server loop.
//!
//! Receives datagrams on the listening socket and spawns one task per
//! datagram: decode, run the pipeline, encode, send. A buffer that fails to
//! decode is dropped silently (no counters, no reply), and reply-send
//! failures are logged and swallowed; UDP retries are the client's problem.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::dns::DnsQuery;
use crate::pipeline::QueryPipeline;

use super::MAX_DNS_PACKET_SIZE;

/// UDP transport for the DNS server.
pub struct UdpServer {
    socket: Arc<UdpSocket>,
}

impl UdpServer {
    /// Bind the listening socket.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive loop: one spawned task per inbound datagram. Runs until the
    /// surrounding task is dropped.
    pub async fn run(&self, pipeline: Arc<QueryPipeline>) {
        let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

        loop {
            let (len, src) = match self.socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    debug!(error = %e, "UDP recv error");
                    continue;
                }
            };

            let datagram = buf[..len].to_vec();
            let socket = self.socket.clone();
            let pipeline = pipeline.clone();

            tokio::spawn(async move {
                handle_datagram(&datagram, src, &socket, &pipeline).await;
            });
        }
    }
}

async fn handle_datagram(
    datagram: &[u8],
    src: SocketAddr,
    socket: &UdpSocket,
    pipeline: &QueryPipeline,
) {
    let query = match DnsQuery::parse(datagram) {
        Ok(q) => q,
        Err(e) => {
            // Malformed input gets no reply and touches no counters
            debug!(client = %src, error = %e, "dropping undecodable datagram");
            return;
        }
    };

    trace!(client = %src, name = %query.name, qtype = query.qtype, "query received");

    let response = pipeline.handle(&query, src.ip());
    let reply = response.to_bytes();

    // Fire and forget: the send result is only observed for logging
    if let Err(e) = socket.send_to(&reply, src).await {
        debug!(client = %src, error = %e, "reply send failed");
    }
}
