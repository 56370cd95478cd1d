//! Hostname resolution with a DNS-over-HTTPS fallback chain.
//!
//! Tiers are tried in order, each under its own deadline:
//! 1. The platform resolver (or the pinned nameserver pair, when pinned)
//! 2. Each configured DoH provider, addressed by literal IP
//!
//! The first tier to produce an address wins and is recorded for diagnostics.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use futures::future::LocalBoxFuture;
use hyper::Version;
use serde::{Deserialize, Serialize, Serializer};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::dns::TYPE_A;
use crate::error::{FetchError, LookupError};
use crate::transport::http::{self, HttpRequest};
use crate::transport::tls::TlsClient;
use crate::transport::{tcp, udp};

const DOH_MAX_BODY: usize = 8 * 1024;

/// Which tier answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderTag {
    System,
    Doh(String),
}

impl ProviderTag {
    pub fn is_doh(&self) -> bool {
        matches!(self, ProviderTag::Doh(_))
    }
}

impl fmt::Display for ProviderTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderTag::System => f.write_str("system"),
            ProviderTag::Doh(name) => write!(f, "doh:{name}"),
        }
    }
}

impl Serialize for ProviderTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One resolution tier.
pub trait Lookup {
    fn tag(&self) -> ProviderTag;

    fn lookup<'a>(&'a self, host: &'a str) -> LocalBoxFuture<'a, Result<IpAddr, LookupError>>;

    /// Point this tier at fixed nameservers. Only the system tier reacts.
    fn pin_nameservers(&mut self, _servers: &[IpAddr]) {}

    fn restore_nameservers(&mut self) {}
}

/// A successful resolution. Produced fresh for every attempt.
#[derive(Debug, Clone)]
pub struct ResolutionResult {
    pub host: String,
    pub addr: IpAddr,
    pub provider: ProviderTag,
    pub elapsed: Duration,
    /// Tiers that failed before the winner, with their error text.
    pub failures: Vec<(ProviderTag, String)>,
}

/// Ordered resolver tiers.
pub struct ResolverChain {
    tiers: Vec<Box<dyn Lookup>>,
    tier_timeout: Duration,
}

impl ResolverChain {
    pub fn new(tier_timeout: Duration) -> Self {
        Self {
            tiers: Vec::new(),
            tier_timeout,
        }
    }

    /// Append a tier at the lowest priority.
    pub fn push(&mut self, tier: Box<dyn Lookup>) {
        self.tiers.push(tier);
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Resolve `host`, stopping at the first tier that succeeds.
    pub async fn resolve(&self, host: &str) -> Result<ResolutionResult, FetchError> {
        let started = Instant::now();
        let mut failures = Vec::new();

        for tier in &self.tiers {
            let tag = tier.tag();
            let outcome = match timeout(self.tier_timeout, tier.lookup(host)).await {
                Ok(result) => result,
                Err(_) => Err(LookupError::Timeout(self.tier_timeout)),
            };

            match outcome {
                Ok(addr) => {
                    if tag.is_doh() {
                        info!(host, %addr, provider = %tag, "Resolved via DoH fallback");
                    } else {
                        debug!(host, %addr, provider = %tag, "Resolved");
                    }
                    return Ok(ResolutionResult {
                        host: host.to_string(),
                        addr,
                        provider: tag,
                        elapsed: started.elapsed(),
                        failures,
                    });
                }
                Err(err) => {
                    debug!(host, provider = %tag, error = %err, "Resolver tier failed");
                    failures.push((tag, err.to_string()));
                }
            }
        }

        let detail = if failures.is_empty() {
            "no resolver tiers configured".to_string()
        } else {
            failures
                .iter()
                .map(|(tag, err)| format!("{tag}: {err}"))
                .collect::<Vec<_>>()
                .join("; ")
        };
        warn!(host, %detail, "All resolver tiers failed");

        Err(FetchError::DnsExhausted {
            host: host.to_string(),
            detail,
        })
    }

    pub fn pin_nameservers(&mut self, servers: &[IpAddr]) {
        for tier in &mut self.tiers {
            tier.pin_nameservers(servers);
        }
    }

    pub fn restore_nameservers(&mut self) {
        for tier in &mut self.tiers {
            tier.restore_nameservers();
        }
    }
}

/// The platform resolver, or a pinned nameserver pair queried over UDP.
pub struct SystemLookup {
    query_timeout: Duration,
    pinned: Option<Vec<SocketAddr>>,
}

impl SystemLookup {
    pub fn new(query_timeout: Duration) -> Self {
        Self {
            query_timeout,
            pinned: None,
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.is_some()
    }

    async fn lookup_platform(&self, host: &str) -> Result<IpAddr, LookupError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, 0)).await?.collect();

        addrs
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| addrs.first())
            .map(SocketAddr::ip)
            .ok_or(LookupError::NoRecord)
    }

    async fn lookup_pinned(&self, servers: &[SocketAddr], host: &str) -> Result<IpAddr, LookupError> {
        let mut last_err = LookupError::NoRecord;
        for server in servers {
            match udp::query_a(*server, host, self.query_timeout).await {
                Ok(ip) => return Ok(IpAddr::V4(ip)),
                Err(err) => {
                    debug!(host, %server, error = %err, "Pinned nameserver failed");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }
}

impl Lookup for SystemLookup {
    fn tag(&self) -> ProviderTag {
        ProviderTag::System
    }

    fn lookup<'a>(&'a self, host: &'a str) -> LocalBoxFuture<'a, Result<IpAddr, LookupError>> {
        Box::pin(async move {
            match &self.pinned {
                Some(servers) => self.lookup_pinned(servers, host).await,
                None => self.lookup_platform(host).await,
            }
        })
    }

    fn pin_nameservers(&mut self, servers: &[IpAddr]) {
        if servers.is_empty() {
            return;
        }
        let servers: Vec<SocketAddr> = servers.iter().map(|ip| SocketAddr::new(*ip, 53)).collect();
        info!(?servers, "Pinning system resolver nameservers");
        self.pinned = Some(servers);
    }

    fn restore_nameservers(&mut self) {
        if self.pinned.take().is_some() {
            info!("Restored platform nameservers");
        }
    }
}

/// A DNS-over-HTTPS provider reachable at a literal address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DohProvider {
    pub name: String,
    pub ip: IpAddr,
    #[serde(default = "default_doh_port")]
    pub port: u16,
    /// Hostname for SNI and the `Host` header.
    pub host: String,
    /// JSON API path; `?name=<host>&type=A` is appended.
    pub path: String,
}

fn default_doh_port() -> u16 {
    443
}

impl DohProvider {
    /// Cloudflare, Google and Quad9, in that order.
    pub fn defaults() -> Vec<DohProvider> {
        vec![
            DohProvider {
                name: "cloudflare".into(),
                ip: IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
                port: 443,
                host: "cloudflare-dns.com".into(),
                path: "/dns-query".into(),
            },
            DohProvider {
                name: "google".into(),
                ip: IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
                port: 443,
                host: "dns.google".into(),
                path: "/resolve".into(),
            },
            DohProvider {
                name: "quad9".into(),
                ip: IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)),
                port: 5053,
                host: "dns.quad9.net".into(),
                path: "/dns-query".into(),
            },
        ]
    }
}

/// Resolves through one DoH provider's JSON API.
pub struct DohLookup {
    provider: DohProvider,
    tls: TlsClient,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    request_timeout: Duration,
    user_agent: String,
}

impl DohLookup {
    pub fn new(
        provider: DohProvider,
        tls: TlsClient,
        connect_timeout: Duration,
        handshake_timeout: Duration,
        request_timeout: Duration,
        user_agent: String,
    ) -> Self {
        Self {
            provider,
            tls,
            connect_timeout,
            handshake_timeout,
            request_timeout,
            user_agent,
        }
    }

    async fn query(&self, host: &str) -> Result<IpAddr, LookupError> {
        let addr = SocketAddr::new(self.provider.ip, self.provider.port);
        let stream = tcp::connect(addr, self.connect_timeout).await?;
        let stream = self
            .tls
            .handshake(stream, &self.provider.host, self.handshake_timeout)
            .await
            .map_err(|err| LookupError::Tls(err.to_string()))?;

        let path = format!("{}?name={}&type=A", self.provider.path, host);
        let request = HttpRequest {
            host: &self.provider.host,
            path_and_query: &path,
            accept: "application/dns-json",
            user_agent: &self.user_agent,
            version: Version::HTTP_11,
        };
        let response = http::get(stream, &request, self.request_timeout, DOH_MAX_BODY).await?;
        if !response.is_success() {
            return Err(LookupError::Status(response.status));
        }

        parse_doh_answer(&response.body)
    }
}

impl Lookup for DohLookup {
    fn tag(&self) -> ProviderTag {
        ProviderTag::Doh(self.provider.name.clone())
    }

    fn lookup<'a>(&'a self, host: &'a str) -> LocalBoxFuture<'a, Result<IpAddr, LookupError>> {
        Box::pin(self.query(host))
    }
}

#[derive(Deserialize)]
struct DohResponse {
    #[serde(rename = "Answer", default)]
    answer: Vec<DohRecord>,
}

#[derive(Deserialize)]
struct DohRecord {
    #[serde(rename = "type")]
    rtype: u16,
    #[serde(default)]
    data: String,
}

/// Extract the first A record from a DoH JSON answer.
pub fn parse_doh_answer(body: &[u8]) -> Result<IpAddr, LookupError> {
    let response: DohResponse = serde_json::from_slice(body)?;

    response
        .answer
        .iter()
        .filter(|record| record.rtype == TYPE_A)
        .find_map(|record| record.data.trim().parse::<Ipv4Addr>().ok())
        .map(IpAddr::V4)
        .ok_or(LookupError::NoRecord)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct FakeLookup {
        tag: ProviderTag,
        answer: Option<IpAddr>,
        calls: Rc<RefCell<Vec<String>>>,
    }

    impl Lookup for FakeLookup {
        fn tag(&self) -> ProviderTag {
            self.tag.clone()
        }

        fn lookup<'a>(&'a self, _host: &'a str) -> LocalBoxFuture<'a, Result<IpAddr, LookupError>> {
            self.calls.borrow_mut().push(self.tag.to_string());
            let answer = self.answer;
            Box::pin(async move { answer.ok_or(LookupError::NoRecord) })
        }
    }

    struct StuckLookup;

    impl Lookup for StuckLookup {
        fn tag(&self) -> ProviderTag {
            ProviderTag::System
        }

        fn lookup<'a>(&'a self, _host: &'a str) -> LocalBoxFuture<'a, Result<IpAddr, LookupError>> {
            Box::pin(std::future::pending())
        }
    }

    fn chain(tiers: &[(ProviderTag, Option<IpAddr>)]) -> (ResolverChain, Rc<RefCell<Vec<String>>>) {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut chain = ResolverChain::new(Duration::from_secs(1));
        for (tag, answer) in tiers {
            chain.push(Box::new(FakeLookup {
                tag: tag.clone(),
                answer: *answer,
                calls: calls.clone(),
            }));
        }
        (chain, calls)
    }

    fn doh(name: &str) -> ProviderTag {
        ProviderTag::Doh(name.to_string())
    }

    fn ip(last: u8) -> Option<IpAddr> {
        Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, last)))
    }

    #[tokio::test]
    async fn system_success_skips_doh() {
        let (chain, calls) = chain(&[(ProviderTag::System, ip(1)), (doh("cloudflare"), ip(2))]);

        let result = chain.resolve("aviationweather.gov").await.unwrap();

        assert_eq!(result.provider, ProviderTag::System);
        assert_eq!(Some(result.addr), ip(1));
        assert_eq!(*calls.borrow(), vec!["system"]);
    }

    #[tokio::test]
    async fn providers_are_tried_in_order_until_success() {
        let (chain, calls) = chain(&[
            (ProviderTag::System, None),
            (doh("cloudflare"), None),
            (doh("google"), ip(3)),
            (doh("quad9"), ip(4)),
        ]);

        let result = chain.resolve("aviationweather.gov").await.unwrap();

        assert_eq!(result.provider, doh("google"));
        assert_eq!(Some(result.addr), ip(3));
        assert_eq!(
            *calls.borrow(),
            vec!["system", "doh:cloudflare", "doh:google"]
        );
        assert_eq!(result.failures.len(), 2);
    }

    #[tokio::test]
    async fn exhausted_chain_reports_every_tier() {
        let (chain, _) = chain(&[(ProviderTag::System, None), (doh("cloudflare"), None)]);

        let err = chain.resolve("aviationweather.gov").await.unwrap_err();

        match err {
            FetchError::DnsExhausted { host, detail } => {
                assert_eq!(host, "aviationweather.gov");
                assert!(detail.contains("system"));
                assert!(detail.contains("doh:cloudflare"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn stuck_tier_is_bounded_by_timeout() {
        let mut chain = ResolverChain::new(Duration::from_millis(50));
        chain.push(Box::new(StuckLookup));
        let calls = Rc::new(RefCell::new(Vec::new()));
        chain.push(Box::new(FakeLookup {
            tag: doh("cloudflare"),
            answer: ip(9),
            calls: calls.clone(),
        }));

        let result = chain.resolve("aviationweather.gov").await.unwrap();

        assert_eq!(result.provider, doh("cloudflare"));
        assert!(result.failures[0].1.contains("timed out"));
    }

    #[test]
    fn doh_answer_takes_first_a_record() {
        let body = br#"{"Status":0,"Answer":[
            {"name":"aviationweather.gov.","type":5,"TTL":60,"data":"awc.example.net."},
            {"name":"awc.example.net.","type":1,"TTL":60,"data":"140.90.101.62"},
            {"name":"awc.example.net.","type":1,"TTL":60,"data":"140.90.101.63"}
        ]}"#;

        let addr = parse_doh_answer(body).unwrap();

        assert_eq!(addr, IpAddr::V4(Ipv4Addr::new(140, 90, 101, 62)));
    }

    #[test]
    fn doh_answer_without_a_record_is_no_record() {
        assert!(matches!(
            parse_doh_answer(br#"{"Status":3}"#),
            Err(LookupError::NoRecord)
        ));
        assert!(matches!(
            parse_doh_answer(br#"{"Answer":[{"type":1,"data":"not-an-ip"}]}"#),
            Err(LookupError::NoRecord)
        ));
    }

    #[test]
    fn doh_answer_rejects_invalid_json() {
        assert!(matches!(
            parse_doh_answer(b"<html>"),
            Err(LookupError::Json(_))
        ));
    }

    #[test]
    fn pinning_switches_system_tier() {
        let mut system = SystemLookup::new(Duration::from_secs(1));
        system.pin_nameservers(&[IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))]);
        assert!(system.is_pinned());

        system.restore_nameservers();
        assert!(!system.is_pinned());
    }

    #[tokio::test]
    async fn platform_lookup_resolves_literal_address() {
        let system = SystemLookup::new(Duration::from_secs(1));

        let addr = system.lookup("127.0.0.1").await.unwrap();

        assert_eq!(addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn provider_tags_display() {
        assert_eq!(ProviderTag::System.to_string(), "system");
        assert_eq!(doh("quad9").to_string(), "doh:quad9");
        assert_eq!(
            serde_json::to_string(&doh("google")).unwrap(),
            "\"doh:google\""
        );
    }
}
