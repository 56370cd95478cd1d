use std::io;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use metarwatch::category::{Category, Icao};
use metarwatch::config::Settings;
use metarwatch::error::ConfigError;
use metarwatch::fetch::Fetcher;
use metarwatch::orchestrator::{
    CategorySink, CycleOutcome, Orchestrator, OrchestratorOptions, SystemClock,
};
use metarwatch::stats::FetchStatsSnapshot;

#[derive(Parser)]
#[command(name = "metarwatch")]
#[command(about = "Polls flight categories and keeps the last known values", long_about = None)]
struct Args {
    /// Settings file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Airport identifiers, comma separated (overrides the settings file)
    #[arg(long, value_delimiter = ',')]
    ids: Vec<String>,

    #[arg(long)]
    period_minutes: Option<u32>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Enable polling regardless of the settings file
    #[arg(long)]
    enable: bool,

    /// Attempt shortly after start instead of waiting a full period
    #[arg(long)]
    fetch_on_boot: bool,

    /// Poll loop interval in milliseconds
    #[arg(long, default_value = "1000")]
    tick_ms: u64,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run a single attempt, print its diagnostics as JSON and exit
    #[arg(long)]
    once: bool,
}

impl Args {
    /// Settings file (or defaults) with command-line overrides applied.
    fn settings(&self) -> Result<Settings, ConfigError> {
        let mut settings = match &self.config {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };

        if !self.ids.is_empty() {
            settings.identifiers = self.ids.clone();
        }
        if let Some(minutes) = self.period_minutes {
            settings.period_minutes = minutes;
        }
        if let Some(size) = self.batch_size {
            settings.batch_size = size;
        }
        if self.enable {
            settings.enabled = true;
        }
        if self.fetch_on_boot {
            settings.fetch_on_boot = true;
        }
        settings.normalize();

        Ok(settings)
    }
}

/// Logs updates; stands in for the painting layer.
struct LogSink;

impl CategorySink for LogSink {
    fn on_category_updated(&mut self, key: &Icao, category: Category, updated_at: u64) {
        info!(%key, %category, updated_at, "Category updated");
    }

    fn on_cycle_outcome(&mut self, outcome: CycleOutcome) {
        match outcome {
            CycleOutcome::Fresh { applied } => info!(applied, "Cycle complete"),
            CycleOutcome::Masked { known } => warn!(known, "Showing last-known categories"),
            CycleOutcome::NoData => warn!("No category data available"),
        }
    }
}

enum Control {
    Reload,
    Refresh,
}

#[cfg(unix)]
struct Signals {
    hangup: tokio::signal::unix::Signal,
    refresh: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn new() -> io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            hangup: signal(SignalKind::hangup())?,
            refresh: signal(SignalKind::user_defined1())?,
        })
    }

    async fn recv(&mut self) -> Control {
        tokio::select! {
            _ = self.hangup.recv() => Control::Reload,
            _ = self.refresh.recv() => Control::Refresh,
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn new() -> io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> Control {
        std::future::pending().await
    }
}

fn log_stats(stats: &FetchStatsSnapshot, cache_len: usize) {
    info!(
        attempts = stats.attempts,
        successes = stats.successes,
        failures = stats.failures,
        doh = stats.doh_resolutions,
        applied = stats.records_applied,
        expired = stats.windows_expired,
        masked = stats.windows_masked,
        avg_attempt_ms = stats.avg_attempt_ms,
        cache = cache_len,
        "stats"
    );
}

async fn run_once(mut settings: Settings) -> io::Result<()> {
    settings.enabled = true;
    settings.fetch_on_boot = true;
    settings.start_delay_ms = 0;

    let fetcher = Fetcher::from_settings(&settings).map_err(io::Error::other)?;
    let options = OrchestratorOptions::from(&settings);
    let mut orchestrator = Orchestrator::new(fetcher, LogSink, settings, SystemClock::new(), options);

    orchestrator.tick().await;

    let report = serde_json::json!({
        "state": orchestrator.state(),
        "outcome": orchestrator.last_outcome(),
        "diagnostics": orchestrator.diagnostics_snapshot(),
    });
    let rendered = serde_json::to_string_pretty(&report).map_err(io::Error::other)?;
    println!("{rendered}");

    orchestrator.shutdown();
    Ok(())
}

async fn run(args: Args, settings: Settings) -> io::Result<()> {
    if args.once {
        return run_once(settings).await;
    }

    let fetcher = Fetcher::from_settings(&settings).map_err(io::Error::other)?;
    let options = OrchestratorOptions::from(&settings);

    info!(
        enabled = settings.enabled,
        period_minutes = settings.period_minutes,
        identifiers = settings.identifiers.len(),
        host = %settings.endpoint.host,
        "metarwatch starting"
    );

    let mut orchestrator = Orchestrator::new(fetcher, LogSink, settings, SystemClock::new(), options);
    let stats = orchestrator.stats();
    let mut signals = Signals::new()?;

    let mut ticker = interval(Duration::from_millis(args.tick_ms.max(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Log stats every minute
    let mut stats_interval = interval(Duration::from_secs(60));
    stats_interval.tick().await; // Skip first immediate tick

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => orchestrator.tick().await,
            _ = stats_interval.tick() => {
                log_stats(&stats.snapshot_and_reset(), orchestrator.cache().len());
            }
            control = signals.recv() => match control {
                Control::Reload => match args.settings() {
                    Ok(settings) => {
                        *orchestrator.provider_mut() = settings;
                        info!("Settings reloaded");
                    }
                    Err(err) => warn!(error = %err, "Settings reload failed, keeping current"),
                },
                Control::Refresh => {
                    orchestrator.request_refresh();
                }
            },
            _ = &mut shutdown => break,
        }
    }

    let last = orchestrator.shutdown();
    log_stats(&last, orchestrator.cache().len());
    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> io::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let settings = args.settings().map_err(io::Error::other)?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, run(args, settings))
}
