//! Staged connectivity probe and the per-attempt diagnostics record.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use futures::future::LocalBoxFuture;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use crate::error::FetchError;
use crate::fetch::parse::ParsePath;
use crate::resolver::{ProviderTag, ResolutionResult};
use crate::transport::tcp;
use crate::transport::tls::TlsClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Dns,
    Tcp,
    Tls,
    Http,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub elapsed_ms: u64,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Everything known about the most recent attempt.
///
/// Replaced wholesale at the start of every attempt.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProbeDiagnostics {
    pub host: String,
    pub ip: Option<IpAddr>,
    pub provider: Option<ProviderTag>,
    pub http_status: Option<u16>,
    pub response_bytes: usize,
    pub redirect: Option<String>,
    /// A chunk had to be retried over HTTP/1.0.
    pub http10_retry: bool,
    pub body_preview: Option<String>,
    pub parse_path: Option<ParsePath>,
    pub chunks_ok: usize,
    pub chunks_failed: usize,
    pub records_applied: usize,
    pub elapsed_ms: u64,
    pub error: Option<String>,
    pub stages: Vec<StageRecord>,
}

impl ProbeDiagnostics {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            ..Self::default()
        }
    }

    pub fn record(&mut self, stage: Stage, elapsed: Duration, succeeded: bool, detail: Option<String>) {
        self.stages.push(StageRecord {
            stage,
            elapsed_ms: elapsed.as_millis() as u64,
            succeeded,
            detail,
        });
    }

    /// Fill in the DNS stage from a resolution.
    pub fn record_resolution(&mut self, resolution: &ResolutionResult) {
        self.ip = Some(resolution.addr);
        self.provider = Some(resolution.provider.clone());
        let detail = if resolution.failures.is_empty() {
            None
        } else {
            Some(format!("{} tier(s) failed first", resolution.failures.len()))
        };
        self.record(Stage::Dns, resolution.elapsed, true, detail);
    }

    pub fn finish(&mut self, started: Instant, error: Option<&FetchError>) {
        self.elapsed_ms = started.elapsed().as_millis() as u64;
        self.error = error.map(ToString::to_string);
    }

    /// First stage that failed, if any.
    pub fn failed_stage(&self) -> Option<Stage> {
        self.stages.iter().find(|s| !s.succeeded).map(|s| s.stage)
    }

    pub fn used_doh(&self) -> bool {
        self.provider.as_ref().is_some_and(ProviderTag::is_doh)
    }
}

/// Where to connect.
#[derive(Debug, Clone, Copy)]
pub enum ProbeTarget {
    /// An address produced by the resolver chain.
    Resolved(SocketAddr),
    /// Let the platform resolve the hostname during connect.
    Hostname(u16),
}

/// Opens the stream a request goes out on, recording the stages it runs.
pub trait Connector {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect<'a>(
        &'a self,
        host: &'a str,
        target: ProbeTarget,
        diag: &'a mut ProbeDiagnostics,
    ) -> LocalBoxFuture<'a, Result<Self::Stream, FetchError>>;
}

/// Opens TCP then TLS, recording each stage. The returned stream is the
/// one the request goes out on.
pub struct Prober {
    tls: TlsClient,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl Prober {
    pub fn new(tls: TlsClient, connect_timeout: Duration, handshake_timeout: Duration) -> Self {
        Self {
            tls,
            connect_timeout,
            handshake_timeout,
        }
    }

    pub async fn probe(
        &self,
        host: &str,
        target: ProbeTarget,
        diag: &mut ProbeDiagnostics,
    ) -> Result<TlsStream<TcpStream>, FetchError> {
        let started = Instant::now();
        let connected = match target {
            ProbeTarget::Resolved(addr) => tcp::connect(addr, self.connect_timeout).await,
            ProbeTarget::Hostname(port) => tcp::connect_host(host, port, self.connect_timeout).await,
        };
        let stream = match connected {
            Ok(stream) => {
                diag.record(Stage::Tcp, started.elapsed(), true, None);
                if diag.ip.is_none() {
                    diag.ip = stream.peer_addr().ok().map(|peer| peer.ip());
                }
                stream
            }
            Err(err) => {
                diag.record(Stage::Tcp, started.elapsed(), false, Some(err.to_string()));
                return Err(FetchError::TcpConnectFailed {
                    addr: match target {
                        ProbeTarget::Resolved(addr) => addr.to_string(),
                        ProbeTarget::Hostname(port) => format!("{host}:{port}"),
                    },
                    detail: err.to_string(),
                });
            }
        };

        let started = Instant::now();
        match self.tls.handshake(stream, host, self.handshake_timeout).await {
            Ok(stream) => {
                diag.record(Stage::Tls, started.elapsed(), true, None);
                debug!(host, "TLS established");
                Ok(stream)
            }
            Err(err) => {
                diag.record(Stage::Tls, started.elapsed(), false, Some(err.to_string()));
                Err(FetchError::TlsHandshakeFailed {
                    host: host.to_string(),
                    detail: err.to_string(),
                })
            }
        }
    }
}

impl Connector for Prober {
    type Stream = TlsStream<TcpStream>;

    fn connect<'a>(
        &'a self,
        host: &'a str,
        target: ProbeTarget,
        diag: &'a mut ProbeDiagnostics,
    ) -> LocalBoxFuture<'a, Result<Self::Stream, FetchError>> {
        Box::pin(self.probe(host, target, diag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tls::client_config;
    use tokio::net::TcpListener;

    fn prober(limit: Duration) -> Prober {
        let tls = TlsClient::new(client_config(false).unwrap());
        Prober::new(tls, limit, limit)
    }

    #[tokio::test]
    async fn refused_connect_fails_tcp_stage() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let mut diag = ProbeDiagnostics::new("localhost");

        let err = prober(Duration::from_secs(1))
            .probe("localhost", ProbeTarget::Resolved(addr), &mut diag)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::TcpConnectFailed { .. }));
        assert_eq!(diag.failed_stage(), Some(Stage::Tcp));
        assert_eq!(diag.stages.len(), 1);
    }

    #[tokio::test]
    async fn silent_peer_fails_tls_stage() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut diag = ProbeDiagnostics::new("localhost");

        let err = prober(Duration::from_millis(200))
            .probe("localhost", ProbeTarget::Resolved(addr), &mut diag)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::TlsHandshakeFailed { .. }));
        let stages: Vec<_> = diag.stages.iter().map(|s| (s.stage, s.succeeded)).collect();
        assert_eq!(stages, vec![(Stage::Tcp, true), (Stage::Tls, false)]);
        assert_eq!(diag.ip, Some(addr.ip()));
        drop(listener);
    }

    #[test]
    fn resolution_fills_dns_stage() {
        let mut diag = ProbeDiagnostics::new("aviationweather.gov");
        diag.record_resolution(&ResolutionResult {
            host: "aviationweather.gov".into(),
            addr: "192.0.2.10".parse().unwrap(),
            provider: ProviderTag::Doh("google".into()),
            elapsed: Duration::from_millis(42),
            failures: vec![(ProviderTag::System, "timed out".into())],
        });

        assert!(diag.used_doh());
        assert_eq!(diag.stages[0].stage, Stage::Dns);
        assert_eq!(diag.stages[0].elapsed_ms, 42);
        assert_eq!(diag.failed_stage(), None);
    }

    #[test]
    fn diagnostics_serialize_stage_names() {
        let mut diag = ProbeDiagnostics::new("aviationweather.gov");
        diag.record(Stage::Http, Duration::from_millis(5), false, Some("status 503".into()));

        let json = serde_json::to_value(&diag).unwrap();

        assert_eq!(json["stages"][0]["stage"], "http");
        assert_eq!(json["stages"][0]["detail"], "status 503");
    }
}
