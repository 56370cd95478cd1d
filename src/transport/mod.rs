//! Bounded network primitives used by the resolver, prober and fetcher.
//!
//! Each call carries its own deadline so one stuck stage cannot hold the
//! polling loop indefinitely.

pub mod http;
pub mod tcp;
pub mod tls;
pub mod udp;

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

/// Bytes of a response body kept for diagnostics.
pub const BODY_PREVIEW_BYTES: usize = 512;

/// Lossy UTF-8 preview of the start of a body, with line breaks flattened.
pub fn body_preview(body: &[u8]) -> String {
    let end = body.len().min(BODY_PREVIEW_BYTES);
    String::from_utf8_lossy(&body[..end]).replace(['\r', '\n'], " ")
}
