//! Settings file loading.
//!
//! Every field has a default, so an empty file (or none at all) is valid.
//! Values out of range are clamped by [`Settings::normalize`] rather than
//! rejected.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::DEFAULT_CAPACITY;
use crate::category::Icao;
use crate::error::ConfigError;
use crate::fetch::MAX_BATCH_SIZE;
use crate::orchestrator::ConfigProvider;
use crate::resolver::DohProvider;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub enabled: bool,
    pub period_minutes: u32,
    pub batch_size: usize,
    pub identifiers: Vec<String>,
    pub start_delay_ms: u64,
    /// Attempt once shortly after start instead of waiting a full period.
    pub fetch_on_boot: bool,
    pub cache_capacity: usize,
    /// Entries older than this read as unknown.
    pub cache_max_age_secs: Option<u64>,
    /// Resolve and probe before each request; otherwise connect by hostname.
    pub probe_before_request: bool,
    pub verify_certificates: bool,
    pub max_body_bytes: usize,
    pub user_agent: String,
    pub endpoint: EndpointSettings,
    pub timeouts: TimeoutSettings,
    pub resolver: ResolverSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: false,
            period_minutes: 5,
            batch_size: 10,
            identifiers: Vec::new(),
            start_delay_ms: 5_000,
            fetch_on_boot: false,
            cache_capacity: DEFAULT_CAPACITY,
            cache_max_age_secs: None,
            probe_before_request: true,
            verify_certificates: false,
            max_body_bytes: 64 * 1024,
            user_agent: concat!("metarwatch/", env!("CARGO_PKG_VERSION")).to_string(),
            endpoint: EndpointSettings::default(),
            timeouts: TimeoutSettings::default(),
            resolver: ResolverSettings::default(),
        }
    }
}

impl Settings {
    /// Read and normalize a TOML settings file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let mut settings: Settings = toml::from_str(raw)?;
        settings.normalize();
        Ok(settings)
    }

    /// Clamp values into their accepted ranges.
    pub fn normalize(&mut self) {
        self.period_minutes = self.period_minutes.max(1);
        self.batch_size = self.batch_size.clamp(1, MAX_BATCH_SIZE);
        self.cache_capacity = self.cache_capacity.max(1);
        self.max_body_bytes = self.max_body_bytes.max(1024);
        if !self.endpoint.path.starts_with('/') {
            self.endpoint.path.insert(0, '/');
        }
    }
}

impl ConfigProvider for Settings {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn period_minutes(&self) -> u32 {
        self.period_minutes
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn identifiers(&self) -> Vec<String> {
        self.identifiers.clone()
    }
}

/// The weather API endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Fixed query parameters; `ids=` is appended per chunk.
    pub query: String,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            host: "aviationweather.gov".into(),
            port: 443,
            path: "/api/data/metar".into(),
            query: "format=json&age=2".into(),
        }
    }
}

impl EndpointSettings {
    /// Path and query for one chunk of identifiers.
    pub fn request_path(&self, chunk: &[Icao]) -> String {
        let ids = chunk.iter().map(Icao::as_str).collect::<Vec<_>>().join(",");
        if self.query.is_empty() {
            format!("{}?ids={ids}", self.path)
        } else {
            format!("{}?{}&ids={ids}", self.path, self.query)
        }
    }
}

/// Per-stage deadlines, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub dns_ms: u64,
    pub tcp_ms: u64,
    pub tls_ms: u64,
    pub http_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            dns_ms: 5_000,
            tcp_ms: 8_000,
            tls_ms: 8_000,
            http_ms: 15_000,
        }
    }
}

impl TimeoutSettings {
    pub fn dns(&self) -> Duration {
        Duration::from_millis(self.dns_ms)
    }

    pub fn tcp(&self) -> Duration {
        Duration::from_millis(self.tcp_ms)
    }

    pub fn tls(&self) -> Duration {
        Duration::from_millis(self.tls_ms)
    }

    pub fn http(&self) -> Duration {
        Duration::from_millis(self.http_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverSettings {
    /// DoH providers tried after the system resolver, in order.
    pub doh: Vec<DohProvider>,
    /// Nameservers pinned after a failed attempt that needed DoH.
    pub fallback_nameservers: Vec<IpAddr>,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            doh: DohProvider::defaults(),
            fallback_nameservers: vec![
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
                IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)),
            ],
        }
    }
}
