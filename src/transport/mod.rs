//! Transport layer for the DNS server.
//!
//! One request per UDP datagram, one best-effort reply per request. The
//! transport owns decode and encode at the socket boundary; everything in
//! between is the pipeline's business.

pub mod udp;

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;
