//! UDP exchange with a pinned nameserver.
//!
//! Sends one A query and waits for the matching response, ignoring
//! datagrams from other peers or with a different query ID.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, SystemTime};

use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::dns::{DnsQuery, DnsResponse};
use crate::error::LookupError;

use super::MAX_DNS_PACKET_SIZE;

/// Resolve `host` to an IPv4 address by asking `server` directly.
pub async fn query_a(server: SocketAddr, host: &str, limit: Duration) -> Result<Ipv4Addr, LookupError> {
    let id = query_id();
    let query = DnsQuery::a_record(id, host)
        .to_bytes()
        .ok_or(LookupError::NoRecord)?;

    let bind_addr = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.send_to(&query, server).await?;

    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
    let answer = timeout(limit, async {
        loop {
            let (len, from) = socket.recv_from(&mut buf).await?;
            if from != server || len < 12 {
                continue;
            }
            if u16::from_be_bytes([buf[0], buf[1]]) != id {
                continue;
            }
            return Ok::<_, std::io::Error>(DnsResponse::first_a(&buf[..len], id));
        }
    })
    .await
    .map_err(|_| LookupError::Timeout(limit))??;

    answer.ok_or(LookupError::NoRecord)
}

fn query_id() -> u16 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| (d.subsec_nanos() as u16) ^ (d.as_secs() as u16))
        .unwrap_or(0x5a5a)
}
