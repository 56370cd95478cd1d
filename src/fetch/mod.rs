//! Batched category fetches from the weather endpoint.

pub mod parse;

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use futures::future::LocalBoxFuture;
use hyper::Version;
use tracing::{debug, info, warn};

use crate::category::{Category, Icao};
use crate::config::{EndpointSettings, Settings};
use crate::error::{ConfigError, FetchError, HttpError};
use crate::probe::{Connector, ProbeDiagnostics, ProbeTarget, Prober, Stage};
use crate::resolver::{DohLookup, ResolutionResult, ResolverChain, SystemLookup};
use crate::transport::http::{self, HttpRequest, HttpResponse};
use crate::transport::tls::{self, TlsClient};
use crate::transport::body_preview;

use self::parse::parse_payload;

/// Largest number of identifiers sent in one request.
pub const MAX_BATCH_SIZE: usize = 50;

/// Accepted spellings for the identifier and category fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSchema {
    pub identifier: &'static [&'static str],
    pub category: &'static [&'static str],
}

impl FieldSchema {
    pub const AVIATION_WEATHER: FieldSchema = FieldSchema {
        identifier: &["icaoId", "station", "station_id"],
        category: &["fltCat", "flight_category", "fltcat"],
    };
}

/// One applied observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryRecord {
    pub key: Icao,
    pub category: Category,
}

/// Ordered, deduplicated identifiers split into request-sized chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchBatch {
    keys: Vec<Icao>,
    batch_size: usize,
}

impl FetchBatch {
    /// Normalize identifiers, dropping invalid ones and repeats (first wins).
    pub fn new<I, S>(identifiers: I, batch_size: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut keys: Vec<Icao> = Vec::new();
        for raw in identifiers {
            let raw = raw.as_ref();
            match Icao::parse(raw) {
                Some(key) if !keys.contains(&key) => keys.push(key),
                Some(_) => {}
                None => warn!(identifier = raw, "Ignoring invalid identifier"),
            }
        }

        Self {
            keys,
            batch_size: batch_size.clamp(1, MAX_BATCH_SIZE),
        }
    }

    pub fn keys(&self) -> &[Icao] {
        &self.keys
    }

    pub fn chunks(&self) -> std::slice::Chunks<'_, Icao> {
        self.keys.chunks(self.batch_size)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Result of one attempt, with the diagnostics it produced.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub result: Result<Vec<CategoryRecord>, FetchError>,
    pub diagnostics: ProbeDiagnostics,
}

/// Anything that can run an attempt for a batch.
pub trait FetchSource {
    fn fetch<'a>(&'a mut self, batch: &'a FetchBatch) -> LocalBoxFuture<'a, FetchOutcome>;

    /// Switch name resolution to the fallback nameserver pair.
    fn pin_nameservers(&mut self) {}

    fn restore_nameservers(&mut self) {}
}

/// The real network fetcher.
///
/// Generic over how the request stream is opened; [`Prober`] (TCP then TLS)
/// in production.
pub struct Fetcher<C = Prober> {
    endpoint: EndpointSettings,
    resolver: ResolverChain,
    connector: C,
    schema: FieldSchema,
    probe_first: bool,
    request_timeout: Duration,
    max_body_bytes: usize,
    user_agent: String,
    fallback_nameservers: Vec<IpAddr>,
}

impl Fetcher<Prober> {
    /// Wire up resolver tiers, TLS and timeouts from settings.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let tls = TlsClient::new(tls::client_config(settings.verify_certificates)?);
        let timeouts = &settings.timeouts;

        let mut resolver = ResolverChain::new(timeouts.dns());
        resolver.push(Box::new(SystemLookup::new(timeouts.dns())));
        for provider in &settings.resolver.doh {
            resolver.push(Box::new(DohLookup::new(
                provider.clone(),
                tls.clone(),
                timeouts.tcp(),
                timeouts.tls(),
                timeouts.http(),
                settings.user_agent.clone(),
            )));
        }

        Ok(Self {
            endpoint: settings.endpoint.clone(),
            resolver,
            connector: Prober::new(tls, timeouts.tcp(), timeouts.tls()),
            schema: FieldSchema::AVIATION_WEATHER,
            probe_first: settings.probe_before_request,
            request_timeout: timeouts.http(),
            max_body_bytes: settings.max_body_bytes,
            user_agent: settings.user_agent.clone(),
            fallback_nameservers: settings.resolver.fallback_nameservers.clone(),
        })
    }
}

impl<C: Connector> Fetcher<C> {
    pub fn new(
        endpoint: EndpointSettings,
        resolver: ResolverChain,
        connector: C,
        request_timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            resolver,
            connector,
            schema: FieldSchema::AVIATION_WEATHER,
            probe_first: true,
            request_timeout,
            max_body_bytes: 64 * 1024,
            user_agent: concat!("metarwatch/", env!("CARGO_PKG_VERSION")).to_string(),
            fallback_nameservers: Vec::new(),
        }
    }

    /// Connect by hostname instead of resolving through the chain first.
    pub fn skip_probe(mut self) -> Self {
        self.probe_first = false;
        self
    }

    /// Run one attempt: resolve once, then one request per chunk.
    pub async fn fetch_batch(&mut self, batch: &FetchBatch) -> FetchOutcome {
        let started = Instant::now();
        let host = self.endpoint.host.clone();
        let mut diag = ProbeDiagnostics::new(&host);

        let target = if self.probe_first {
            match self.resolver.resolve(&host).await {
                Ok(resolution) => {
                    diag.record_resolution(&resolution);
                    Some(resolution)
                }
                Err(err) => {
                    diag.record(Stage::Dns, started.elapsed(), false, Some(err.to_string()));
                    diag.finish(started, Some(&err));
                    return FetchOutcome {
                        result: Err(err),
                        diagnostics: diag,
                    };
                }
            }
        } else {
            None
        };

        let mut applied = Vec::new();
        let mut last_error = None;
        for (index, chunk) in batch.chunks().enumerate() {
            match self.fetch_chunk(chunk, target.as_ref(), &mut diag).await {
                Ok(records) => {
                    debug!(chunk = index, records = records.len(), "Chunk fetched");
                    diag.chunks_ok += 1;
                    applied.extend(records);
                }
                Err(err) => {
                    warn!(chunk = index, keys = chunk.len(), error = %err, "Chunk failed");
                    diag.chunks_failed += 1;
                    last_error = Some(err);
                }
            }
        }

        diag.records_applied = applied.len();
        let result = if applied.is_empty() {
            Err(last_error.unwrap_or(FetchError::EmptyOrMalformedPayload))
        } else {
            Ok(applied)
        };
        diag.finish(started, result.as_ref().err());

        FetchOutcome {
            result,
            diagnostics: diag,
        }
    }

    async fn fetch_chunk(
        &self,
        chunk: &[Icao],
        resolution: Option<&ResolutionResult>,
        diag: &mut ProbeDiagnostics,
    ) -> Result<Vec<CategoryRecord>, FetchError> {
        let target = match resolution {
            Some(resolution) => ProbeTarget::Resolved(SocketAddr::new(resolution.addr, self.endpoint.port)),
            None => ProbeTarget::Hostname(self.endpoint.port),
        };
        let path = self.endpoint.request_path(chunk);

        // A broken exchange gets one more try on a fresh connection over HTTP/1.0.
        let response = match self.request(target, &path, Version::HTTP_11, diag).await {
            Err(FetchError::Http(detail)) => {
                warn!(host = %self.endpoint.host, error = %detail, "Retrying over HTTP/1.0");
                diag.http10_retry = true;
                self.request(target, &path, Version::HTTP_10, diag).await?
            }
            other => other?,
        };

        let started = Instant::now();
        match parse_payload(&response.body, &self.schema) {
            Ok(parsed) => {
                diag.parse_path = Some(parsed.path);
                let detail = parsed
                    .structured_error
                    .map(|err| format!("permissive scan after: {err}"));
                diag.record(Stage::Json, started.elapsed(), true, detail);
                Ok(parsed.records)
            }
            Err(err) => {
                diag.record(Stage::Json, started.elapsed(), false, Some(err.to_string()));
                Err(err)
            }
        }
    }

    /// Open a stream and send one GET over it.
    async fn request(
        &self,
        target: ProbeTarget,
        path: &str,
        version: Version,
        diag: &mut ProbeDiagnostics,
    ) -> Result<HttpResponse, FetchError> {
        let stream = self.connector.connect(&self.endpoint.host, target, diag).await?;

        let request = HttpRequest {
            host: &self.endpoint.host,
            path_and_query: path,
            accept: "application/json",
            user_agent: &self.user_agent,
            version,
        };
        debug!(host = %self.endpoint.host, %path, ?version, "GET");

        let started = Instant::now();
        let response = match http::get(stream, &request, self.request_timeout, self.max_body_bytes).await {
            Ok(response) => response,
            Err(HttpError::Timeout(limit)) => {
                diag.record(Stage::Http, started.elapsed(), false, Some(format!("timed out after {limit:?}")));
                return Err(FetchError::HttpTimeout(limit));
            }
            Err(err) => {
                diag.record(Stage::Http, started.elapsed(), false, Some(err.to_string()));
                return Err(FetchError::Http(err.to_string()));
            }
        };

        let preview = body_preview(&response.body);
        diag.http_status = Some(response.status);
        diag.response_bytes = response.body.len();
        diag.body_preview = Some(preview.clone());
        if response.is_redirect() {
            diag.redirect = response.location.clone();
        }

        if !response.is_success() {
            let detail = match &response.location {
                Some(location) if response.is_redirect() => format!("status {} to {location}", response.status),
                _ => format!("status {}", response.status),
            };
            diag.record(Stage::Http, started.elapsed(), false, Some(detail));
            return Err(FetchError::HttpStatus {
                code: response.status,
                preview,
            });
        }

        diag.record(Stage::Http, started.elapsed(), true, None);
        Ok(response)
    }
}

impl<C: Connector> FetchSource for Fetcher<C> {
    fn fetch<'a>(&'a mut self, batch: &'a FetchBatch) -> LocalBoxFuture<'a, FetchOutcome> {
        Box::pin(self.fetch_batch(batch))
    }

    fn pin_nameservers(&mut self) {
        if self.fallback_nameservers.is_empty() {
            return;
        }
        info!(servers = ?self.fallback_nameservers, "Falling back to fixed nameservers");
        self.resolver.pin_nameservers(&self.fallback_nameservers);
    }

    fn restore_nameservers(&mut self) {
        self.resolver.restore_nameservers();
    }
}
