//! One-shot HTTP/1.x GET over an established stream.

use std::time::Duration;

use http_body_util::{BodyExt, Empty, Limited};
use hyper::body::Bytes;
use hyper::header::{ACCEPT, CONNECTION, HOST, LOCATION, USER_AGENT};
use hyper::{Method, Request, Version};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::debug;

use crate::error::HttpError;

/// What to ask for.
#[derive(Debug, Clone, Copy)]
pub struct HttpRequest<'a> {
    /// Sent as the `Host` header.
    pub host: &'a str,
    pub path_and_query: &'a str,
    pub accept: &'a str,
    pub user_agent: &'a str,
    /// `HTTP_11` normally; `HTTP_10` for the fallback retry.
    pub version: Version,
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub location: Option<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }
}

/// Send a GET with `Connection: close` and buffer at most `max_body` bytes
/// of the response, all within `limit`.
pub async fn get<S>(
    stream: S,
    request: &HttpRequest<'_>,
    limit: Duration,
    max_body: usize,
) -> Result<HttpResponse, HttpError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match timeout(limit, exchange(stream, request, max_body)).await {
        Ok(result) => result,
        Err(_) => Err(HttpError::Timeout(limit)),
    }
}

async fn exchange<S>(
    stream: S,
    request: &HttpRequest<'_>,
    max_body: usize,
) -> Result<HttpResponse, HttpError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(HttpError::Handshake)?;

    tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!(error = %err, "HTTP connection closed with error");
        }
    });

    let req = Request::builder()
        .method(Method::GET)
        .version(request.version)
        .uri(request.path_and_query)
        .header(HOST, request.host)
        .header(USER_AGENT, request.user_agent)
        .header(ACCEPT, request.accept)
        .header(CONNECTION, "close")
        .body(Empty::<Bytes>::new())
        .map_err(|err| HttpError::Build(err.to_string()))?;

    let response = sender.send_request(req).await.map_err(HttpError::Request)?;

    let status = response.status().as_u16();
    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let body = Limited::new(response.into_body(), max_body)
        .collect()
        .await
        .map_err(|err| HttpError::Body(err.to_string()))?
        .to_bytes();

    Ok(HttpResponse {
        status,
        location,
        body: body.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const REQUEST: HttpRequest<'static> = HttpRequest {
        host: "aviationweather.gov",
        path_and_query: "/api/data/metar?format=json&ids=KPDX",
        accept: "application/json",
        user_agent: "metarwatch-test",
        version: Version::HTTP_11,
    };

    /// Serve one canned response after reading the request head.
    /// The request head is sent back through the returned handle.
    async fn serve_once(response: &'static [u8]) -> (SocketAddr, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = peer.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            peer.write_all(response).await.unwrap();
            peer.shutdown().await.unwrap();
            String::from_utf8(head).unwrap()
        });

        (addr, handle)
    }

    #[tokio::test]
    async fn get_returns_status_and_body() {
        let (addr, server) = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 2\r\nConnection: close\r\n\r\n[]",
        )
        .await;
        let stream = TcpStream::connect(addr).await.unwrap();

        let response = get(stream, &REQUEST, Duration::from_secs(2), 1024)
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert!(response.is_success());
        assert_eq!(response.body, b"[]");

        let head = server.await.unwrap().to_ascii_lowercase();
        assert!(head.starts_with("get /api/data/metar?format=json&ids=kpdx http/1.1"));
        assert!(head.contains("host: aviationweather.gov"));
        assert!(head.contains("accept: application/json"));
        assert!(head.contains("connection: close"));
    }

    #[tokio::test]
    async fn get_can_speak_http10() {
        let (addr, server) = serve_once(b"HTTP/1.0 200 OK\r\nContent-Length: 2\r\n\r\n[]").await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let request = HttpRequest {
            version: Version::HTTP_10,
            ..REQUEST
        };

        let response = get(stream, &request, Duration::from_secs(2), 1024)
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        let head = server.await.unwrap().to_ascii_lowercase();
        assert!(head.starts_with("get /api/data/metar?format=json&ids=kpdx http/1.0"));
    }

    #[tokio::test]
    async fn get_reports_redirect_location() {
        let (addr, _server) = serve_once(
            b"HTTP/1.1 301 Moved Permanently\r\nLocation: https://example.org/metar\r\nContent-Length: 0\r\n\r\n",
        )
        .await;
        let stream = TcpStream::connect(addr).await.unwrap();

        let response = get(stream, &REQUEST, Duration::from_secs(2), 1024)
            .await
            .unwrap();

        assert_eq!(response.status, 301);
        assert!(response.is_redirect());
        assert_eq!(response.location.as_deref(), Some("https://example.org/metar"));
    }

    #[tokio::test]
    async fn get_enforces_body_limit() {
        let (addr, _server) = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Length: 16\r\n\r\n0123456789abcdef",
        )
        .await;
        let stream = TcpStream::connect(addr).await.unwrap();

        let err = get(stream, &REQUEST, Duration::from_secs(2), 8)
            .await
            .unwrap_err();

        assert!(matches!(err, HttpError::Body(_)));
    }

    #[tokio::test]
    async fn get_times_out_on_silent_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();

        let err = get(stream, &REQUEST, Duration::from_millis(100), 1024)
            .await
            .unwrap_err();

        assert!(matches!(err, HttpError::Timeout(_)));
        drop(listener);
    }
}
