//! Tick-driven controller tying the scheduler, fetcher and cache together.
//!
//! The orchestrator owns every piece of cycle state. Collaborators are
//! reached through small traits so the painting layer, the configuration
//! source and the clock can be swapped out (and faked in tests).

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::cache::CategoryCache;
use crate::category::{Category, Icao};
use crate::config::Settings;
use crate::error::FetchError;
use crate::fetch::{CategoryRecord, FetchBatch, FetchSource};
use crate::probe::ProbeDiagnostics;
use crate::scheduler::{RetryDecision, ScheduleState, Scheduler, period_from_minutes};
use crate::stats::{FetchStats, FetchStatsSnapshot};

/// Wall-clock seconds below this mean the clock has not been synced yet.
const UNSYNCED_EPOCH_SECS: u64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Feature disabled.
    Idle,
    /// Armed, waiting for the next regular boundary.
    Waiting,
    Attempting,
    /// Last attempt failed; the next retry is inside the current window.
    RetryWaiting,
}

/// How a cycle ended, as reported to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum CycleOutcome {
    Fresh { applied: usize },
    /// Window expired but the cache still holds known categories.
    Masked { known: usize },
    /// Window expired and nothing usable is cached.
    NoData,
}

/// Receives applied records and cycle outcomes.
pub trait CategorySink {
    fn on_category_updated(&mut self, key: &Icao, category: Category, updated_at: u64);

    /// What to show for this cycle is up to the implementor.
    fn on_cycle_outcome(&mut self, _outcome: CycleOutcome) {}
}

/// Live configuration, read on every tick.
pub trait ConfigProvider {
    fn enabled(&self) -> bool;

    fn period_minutes(&self) -> u32;

    fn batch_size(&self) -> usize;

    fn identifiers(&self) -> Vec<String>;
}

pub trait Clock {
    /// Monotonic milliseconds.
    fn now_ms(&self) -> u64;

    /// Timestamp for cache records.
    fn wall_secs(&self) -> u64;
}

/// `Instant` for scheduling; epoch seconds for records, or uptime seconds
/// while the system clock is unsynced.
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn wall_secs(&self) -> u64 {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if epoch < UNSYNCED_EPOCH_SECS {
            self.started.elapsed().as_secs()
        } else {
            epoch
        }
    }
}

/// Fixed parameters not read from the live provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorOptions {
    pub start_delay_ms: u64,
    pub fetch_on_boot: bool,
    pub cache_capacity: usize,
    pub cache_max_age_secs: Option<u64>,
}

impl From<&Settings> for OrchestratorOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            start_delay_ms: settings.start_delay_ms,
            fetch_on_boot: settings.fetch_on_boot,
            cache_capacity: settings.cache_capacity,
            cache_max_age_secs: settings.cache_max_age_secs,
        }
    }
}

pub struct Orchestrator<F, S, C, K> {
    fetcher: F,
    sink: S,
    config: C,
    clock: K,
    scheduler: Scheduler,
    cache: CategoryCache,
    state: State,
    fetch_on_boot: bool,
    diagnostics: Option<ProbeDiagnostics>,
    last_outcome: Option<CycleOutcome>,
    /// Nameservers pinned during the current window.
    dns_forced: bool,
    stats: Arc<FetchStats>,
}

impl<F, S, C, K> Orchestrator<F, S, C, K>
where
    F: FetchSource,
    S: CategorySink,
    C: ConfigProvider,
    K: Clock,
{
    pub fn new(fetcher: F, sink: S, config: C, clock: K, options: OrchestratorOptions) -> Self {
        let period_ms = period_from_minutes(config.period_minutes());
        let cache = CategoryCache::new(options.cache_capacity).with_max_age(options.cache_max_age_secs);

        Self {
            fetcher,
            sink,
            config,
            clock,
            scheduler: Scheduler::new(period_ms, options.start_delay_ms),
            cache,
            state: State::Idle,
            fetch_on_boot: options.fetch_on_boot,
            diagnostics: None,
            last_outcome: None,
            dns_forced: false,
            stats: Arc::new(FetchStats::new()),
        }
    }

    /// Advance the state machine. Runs at most one attempt.
    pub async fn tick(&mut self) {
        let now = self.clock.now_ms();

        if !self.config.enabled() {
            if self.state != State::Idle {
                info!("Disabled, cycle state reset");
                self.go_idle();
            }
            return;
        }

        let period_ms = period_from_minutes(self.config.period_minutes());
        if !self.scheduler.is_armed() {
            self.scheduler.set_period(now, period_ms);
            self.scheduler.arm(now, self.fetch_on_boot);
            self.state = State::Waiting;
            info!(
                period_ms,
                next_scheduled_at = self.scheduler.next_scheduled_at(),
                next_attempt_at = self.scheduler.next_attempt_at(),
                "Schedule armed"
            );
        } else if period_ms != self.scheduler.period_ms() {
            self.scheduler.set_period(now, period_ms);
            self.end_window();
            self.state = State::Waiting;
            info!(
                period_ms,
                next_scheduled_at = self.scheduler.next_scheduled_at(),
                "Period changed, schedule realigned"
            );
        }

        if self.scheduler.due_now(now) {
            self.attempt(now).await;
        }
    }

    /// Ask for an attempt on the next tick without moving the regular
    /// boundary. Returns false when not armed.
    pub fn request_refresh(&mut self) -> bool {
        match self.state {
            State::Waiting | State::RetryWaiting => {
                let now = self.clock.now_ms();
                if let Some(next_scheduled_at) = self.scheduler.force_immediate(now) {
                    self.expire_window(next_scheduled_at);
                }
                self.state = State::RetryWaiting;
                info!(
                    window_deadline = self.scheduler.window_deadline(),
                    "Manual refresh requested"
                );
                true
            }
            state => {
                debug!(?state, "Manual refresh ignored");
                false
            }
        }
    }

    /// Restore resolver state and go idle. Returns the unreported counters.
    pub fn shutdown(&mut self) -> FetchStatsSnapshot {
        self.go_idle();
        info!("Orchestrator shut down");
        self.stats.snapshot_and_reset()
    }

    async fn attempt(&mut self, now: u64) {
        self.state = State::Attempting;
        let batch = FetchBatch::new(self.config.identifiers(), self.config.batch_size());

        if batch.is_empty() {
            debug!("No identifiers configured, skipping fetch");
            self.scheduler.on_success(now);
            self.end_window();
            self.state = State::Waiting;
            return;
        }

        info!(
            keys = batch.len(),
            batch_size = batch.batch_size(),
            retry_index = self.scheduler.state().retry_index,
            "Fetching flight categories"
        );
        let outcome = self.fetcher.fetch(&batch).await;
        let now = self.clock.now_ms();
        let used_doh = outcome.diagnostics.used_doh();
        let elapsed_ms = outcome.diagnostics.elapsed_ms;
        let failed_stage = outcome.diagnostics.failed_stage();
        self.diagnostics = Some(outcome.diagnostics);

        match outcome.result {
            Ok(records) => {
                let applied = self.apply(records);
                self.stats.record_success(elapsed_ms, applied, used_doh);
                self.scheduler.on_success(now);
                self.end_window();
                self.state = State::Waiting;
                info!(
                    applied,
                    elapsed_ms,
                    next_scheduled_at = self.scheduler.next_scheduled_at(),
                    "Fetch succeeded"
                );
                self.report(CycleOutcome::Fresh { applied });
            }
            Err(err) => {
                self.stats.record_failure(elapsed_ms, used_doh);
                warn!(error = %err, stage = ?failed_stage, elapsed_ms, "Fetch failed");

                let needed_doh = used_doh || matches!(err, FetchError::DnsExhausted { .. });
                if needed_doh && !self.dns_forced {
                    self.fetcher.pin_nameservers();
                    self.dns_forced = true;
                }

                self.scheduler.on_failure_enter_retry(now);
                match self.scheduler.on_retry_tick(now) {
                    RetryDecision::RetryAt(at) => {
                        self.state = State::RetryWaiting;
                        info!(
                            retry_in_ms = at.saturating_sub(now),
                            window_deadline = self.scheduler.window_deadline(),
                            "Retry scheduled"
                        );
                    }
                    RetryDecision::WindowExpired { next_scheduled_at } => {
                        self.expire_window(next_scheduled_at);
                    }
                }
            }
        }
    }

    fn apply(&mut self, records: Vec<CategoryRecord>) -> usize {
        let updated_at = self.clock.wall_secs();
        let applied = records.len();

        for record in records {
            if let Some(evicted) = self.cache.upsert(record.key, record.category, updated_at) {
                debug!(%evicted, "Evicted oldest cache entry");
            }
            trace!(key = %record.key, category = %record.category, "Applied");
            self.sink.on_category_updated(&record.key, record.category, updated_at);
        }

        applied
    }

    fn expire_window(&mut self, next_scheduled_at: u64) {
        self.stats.record_window_expired();
        self.end_window();
        self.state = State::Waiting;

        let known = self.cache.known_count(self.clock.wall_secs());
        let outcome = if known > 0 {
            self.stats.record_window_masked();
            warn!(known, next_scheduled_at, "Retry window expired, keeping last-known categories");
            CycleOutcome::Masked { known }
        } else {
            warn!(next_scheduled_at, "Retry window expired with no data");
            CycleOutcome::NoData
        };
        self.report(outcome);
    }

    fn report(&mut self, outcome: CycleOutcome) {
        self.last_outcome = Some(outcome);
        self.sink.on_cycle_outcome(outcome);
    }

    /// Undo per-window side effects.
    fn end_window(&mut self) {
        if self.dns_forced {
            self.fetcher.restore_nameservers();
            self.dns_forced = false;
        }
    }

    fn go_idle(&mut self) {
        self.end_window();
        self.scheduler.disarm();
        self.state = State::Idle;
    }

    /// Diagnostics from the most recent attempt.
    pub fn diagnostics_snapshot(&self) -> Option<&ProbeDiagnostics> {
        self.diagnostics.as_ref()
    }

    pub fn last_outcome(&self) -> Option<CycleOutcome> {
        self.last_outcome
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn schedule(&self) -> ScheduleState {
        self.scheduler.state()
    }

    pub fn cache(&self) -> &CategoryCache {
        &self.cache
    }

    pub fn stats(&self) -> Arc<FetchStats> {
        self.stats.clone()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn provider_mut(&mut self) -> &mut C {
        &mut self.config
    }
}
