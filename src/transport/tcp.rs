//! Bounded TCP connects.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

/// Connect to an already-resolved address within `limit`.
pub async fn connect(addr: SocketAddr, limit: Duration) -> io::Result<TcpStream> {
    let stream = match timeout(limit, TcpStream::connect(addr)).await {
        Ok(result) => result?,
        Err(_) => return Err(timed_out(limit)),
    };
    stream.set_nodelay(true)?;

    Ok(stream)
}

/// Connect by hostname, letting the network stack resolve it.
pub async fn connect_host(host: &str, port: u16, limit: Duration) -> io::Result<TcpStream> {
    let stream = match timeout(limit, TcpStream::connect((host, port))).await {
        Ok(result) => result?,
        Err(_) => return Err(timed_out(limit)),
    };
    stream.set_nodelay(true)?;

    Ok(stream)
}

fn timed_out(limit: Duration) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("connect timed out after {}ms", limit.as_millis()),
    )
}
