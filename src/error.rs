//! Error types for the acquisition pipeline.
//!
//! None of these are fatal: every failure is recorded in diagnostics and
//! fed back into the retry schedule.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Why an attempt (or one of its chunks) failed.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("dns resolution exhausted for {host}: {detail}")]
    DnsExhausted { host: String, detail: String },

    #[error("tcp connect to {addr} failed: {detail}")]
    TcpConnectFailed { addr: String, detail: String },

    #[error("tls handshake with {host} failed: {detail}")]
    TlsHandshakeFailed { host: String, detail: String },

    #[error("http status {code}")]
    HttpStatus { code: u16, preview: String },

    #[error("http exchange failed: {0}")]
    Http(String),

    #[error("http exchange timed out after {0:?}")]
    HttpTimeout(Duration),

    #[error("json parse failed: {0}")]
    JsonParse(String),

    #[error("empty or malformed payload")]
    EmptyOrMalformedPayload,
}

/// A single resolver tier failing.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("no usable address record")]
    NoRecord,

    #[error("doh status {0}")]
    Status(u16),

    #[error("doh payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("tls: {0}")]
    Tls(String),

    #[error("http: {0}")]
    Http(#[from] HttpError),
}

/// Failure of a raw HTTP exchange.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("handshake: {0}")]
    Handshake(hyper::Error),

    #[error("request: {0}")]
    Request(hyper::Error),

    #[error("invalid request: {0}")]
    Build(String),

    #[error("body: {0}")]
    Body(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Failure loading settings or building the TLS client.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("tls setup: {0}")]
    Tls(#[from] rustls::Error),
}
