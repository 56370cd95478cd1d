//! Drift-free periodic schedule with bounded in-window retries.
//!
//! The regular cadence is anchored once (at arm time or on a period change)
//! and only ever advanced by whole periods, so skipped ticks never shift it.
//! Failed attempts retry with backoff inside the current window, which ends
//! at the next regular boundary; retries never cross it.

use serde::Serialize;

/// Backoff delays for retries within a window, indexed by retry step.
pub const RETRY_DELAYS_MS: [u64; 4] = [5_000, 30_000, 90_000, 180_000];

/// Shortest allowed period.
pub const PERIOD_FLOOR_MS: u64 = 60_000;

/// Period in milliseconds for a configured number of minutes (floor of one minute).
pub fn period_from_minutes(minutes: u32) -> u64 {
    (u64::from(minutes) * 60_000).max(PERIOD_FLOOR_MS)
}

/// Outcome of handling a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again at this timestamp (never later than the window deadline).
    RetryAt(u64),
    /// The window is over; the cadence rolled to this new boundary.
    WindowExpired { next_scheduled_at: u64 },
}

/// Read-only copy of the scheduler fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScheduleState {
    pub period_ms: u64,
    pub next_scheduled_at: u64,
    pub window_deadline: u64,
    pub next_attempt_at: u64,
    pub retry_index: usize,
    pub in_retry_window: bool,
}

pub struct Scheduler {
    period_ms: u64,
    start_delay_ms: u64,
    armed: bool,
    next_scheduled_at: u64,
    window_deadline: u64,
    next_attempt_at: u64,
    retry_index: usize,
    in_retry_window: bool,
}

impl Scheduler {
    /// Create an unarmed scheduler. `period_ms` is raised to the floor.
    pub fn new(period_ms: u64, start_delay_ms: u64) -> Self {
        Self {
            period_ms: period_ms.max(PERIOD_FLOOR_MS),
            start_delay_ms,
            armed: false,
            next_scheduled_at: 0,
            window_deadline: 0,
            next_attempt_at: 0,
            retry_index: 0,
            in_retry_window: false,
        }
    }

    /// Anchor the cadence at `now + start_delay + period`.
    ///
    /// With `fetch_on_boot` the first attempt runs after the start delay in
    /// retry-eligible mode, bounded by that first boundary.
    pub fn arm(&mut self, now: u64, fetch_on_boot: bool) {
        self.armed = true;
        self.next_scheduled_at = now + self.start_delay_ms + self.period_ms;
        self.window_deadline = self.next_scheduled_at;
        self.retry_index = 0;

        if fetch_on_boot {
            self.next_attempt_at = now + self.start_delay_ms;
            self.in_retry_window = true;
        } else {
            self.next_attempt_at = self.next_scheduled_at;
            self.in_retry_window = false;
        }
    }

    /// Forget all cycle state; the next `arm` starts fresh.
    pub fn disarm(&mut self) {
        self.armed = false;
        self.in_retry_window = false;
        self.retry_index = 0;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Change the period. A different value realigns the cadence to
    /// `now + period` and abandons any open retry window.
    pub fn set_period(&mut self, now: u64, period_ms: u64) {
        let period_ms = period_ms.max(PERIOD_FLOOR_MS);
        if period_ms == self.period_ms {
            return;
        }

        self.period_ms = period_ms;
        if self.armed {
            self.next_scheduled_at = now + period_ms;
            self.window_deadline = self.next_scheduled_at;
            self.next_attempt_at = self.next_scheduled_at;
            self.in_retry_window = false;
            self.retry_index = 0;
        }
    }

    /// Whether an attempt should run now.
    ///
    /// Outside a retry window this also brings the regular boundary past
    /// `now` by whole periods.
    pub fn due_now(&mut self, now: u64) -> bool {
        if !self.armed {
            return false;
        }

        let due = now >= self.next_attempt_at;
        if !self.in_retry_window {
            self.settle(now);
        }
        due
    }

    /// Record a successful attempt: leave retry mode and wait for the next boundary.
    pub fn on_success(&mut self, now: u64) {
        self.in_retry_window = false;
        self.retry_index = 0;
        self.settle(now);
        self.next_attempt_at = self.next_scheduled_at;
    }

    /// Record a failed attempt, opening a retry window if none is open.
    pub fn on_failure_enter_retry(&mut self, _now: u64) {
        if !self.in_retry_window {
            self.in_retry_window = true;
            self.retry_index = 0;
            self.window_deadline = self.next_scheduled_at;
        }
    }

    /// Decide what follows a failure inside the open window.
    pub fn on_retry_tick(&mut self, now: u64) -> RetryDecision {
        if now >= self.window_deadline {
            return RetryDecision::WindowExpired {
                next_scheduled_at: self.expire(now),
            };
        }

        let delay = Self::backoff(self.retry_index);
        self.retry_index = self.retry_index.saturating_add(1);
        self.next_attempt_at = (now + delay).min(self.window_deadline);

        RetryDecision::RetryAt(self.next_attempt_at)
    }

    /// Manual refresh: attempt at `now` without moving the regular boundary.
    ///
    /// A retry window whose deadline has already passed is closed first, and
    /// the boundary it rolled to is returned so the expiry can be reported.
    pub fn force_immediate(&mut self, now: u64) -> Option<u64> {
        let expired = if self.in_retry_window && now >= self.window_deadline {
            Some(self.expire(now))
        } else {
            self.settle(now);
            None
        };

        self.next_attempt_at = now;
        self.in_retry_window = true;
        self.retry_index = 0;

        expired
    }

    /// Backoff for a retry step; steps past the table reuse its last entry.
    pub fn backoff(retry_index: usize) -> u64 {
        RETRY_DELAYS_MS[retry_index.min(RETRY_DELAYS_MS.len() - 1)]
    }

    /// Close the window and roll to the first boundary after `now`.
    fn expire(&mut self, now: u64) -> u64 {
        self.in_retry_window = false;
        self.retry_index = 0;
        self.next_scheduled_at += self.period_ms;
        self.settle(now);
        self.next_attempt_at = self.next_scheduled_at;

        self.next_scheduled_at
    }

    fn settle(&mut self, now: u64) {
        while self.next_scheduled_at <= now {
            self.next_scheduled_at += self.period_ms;
        }
        self.window_deadline = self.next_scheduled_at;
    }

    pub fn state(&self) -> ScheduleState {
        ScheduleState {
            period_ms: self.period_ms,
            next_scheduled_at: self.next_scheduled_at,
            window_deadline: self.window_deadline,
            next_attempt_at: self.next_attempt_at,
            retry_index: self.retry_index,
            in_retry_window: self.in_retry_window,
        }
    }

    pub fn period_ms(&self) -> u64 {
        self.period_ms
    }

    pub fn next_scheduled_at(&self) -> u64 {
        self.next_scheduled_at
    }

    pub fn window_deadline(&self) -> u64 {
        self.window_deadline
    }

    pub fn next_attempt_at(&self) -> u64 {
        self.next_attempt_at
    }

    pub fn in_retry_window(&self) -> bool {
        self.in_retry_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const PERIOD: u64 = 60_000;
    const START_DELAY: u64 = 5_000;

    fn armed_at_zero() -> Scheduler {
        let mut scheduler = Scheduler::new(PERIOD, START_DELAY);
        scheduler.arm(0, false);
        scheduler
    }

    fn assert_invariant(s: &Scheduler) {
        assert!(s.next_attempt_at() <= s.window_deadline());
        assert_eq!(s.window_deadline(), s.next_scheduled_at());
    }

    #[test]
    fn arm_anchors_after_start_delay() {
        let s = armed_at_zero();

        assert_eq!(s.next_scheduled_at(), PERIOD + START_DELAY);
        assert_eq!(s.next_attempt_at(), PERIOD + START_DELAY);
        assert_invariant(&s);
    }

    #[test]
    fn forced_refresh_keeps_deadline() {
        let mut s = armed_at_zero();

        assert_eq!(s.force_immediate(5_000), None);

        assert_eq!(s.next_attempt_at(), 5_000);
        assert_eq!(s.window_deadline(), PERIOD + START_DELAY);
        assert!(s.in_retry_window());
        assert!(s.due_now(5_000));
    }

    #[test]
    fn not_due_before_boundary() {
        let mut s = armed_at_zero();

        assert!(!s.due_now(1_000));
        assert!(s.due_now(PERIOD + START_DELAY));
    }

    #[test]
    fn skipped_ticks_advance_by_whole_periods() {
        let mut s = armed_at_zero();
        let anchor = PERIOD + START_DELAY;

        // Poll far past several boundaries at once.
        let now = anchor + 3 * PERIOD + 1_234;
        assert!(s.due_now(now));

        assert!(s.next_scheduled_at() > now);
        assert_eq!((s.next_scheduled_at() - anchor) % PERIOD, 0);
        assert_invariant(&s);
    }

    #[test]
    fn success_waits_for_next_boundary() {
        let mut s = armed_at_zero();
        let anchor = PERIOD + START_DELAY;
        assert!(s.due_now(anchor));

        s.on_success(anchor + 2_000);

        assert_eq!(s.next_attempt_at(), anchor + PERIOD);
        assert!(!s.in_retry_window());
        assert_invariant(&s);
    }

    #[test]
    fn failures_back_off_and_clamp_to_deadline() {
        let mut s = armed_at_zero();
        let anchor = PERIOD + START_DELAY;
        assert!(s.due_now(anchor));
        let deadline = anchor + PERIOD;

        let mut now = anchor;
        let mut previous_delay = 0;
        loop {
            s.on_failure_enter_retry(now);
            match s.on_retry_tick(now) {
                RetryDecision::RetryAt(at) => {
                    assert!(at <= deadline);
                    let delay = at - now;
                    if at < deadline {
                        assert!(delay >= previous_delay);
                        previous_delay = delay;
                    }
                    assert_invariant(&s);
                    now = at;
                }
                RetryDecision::WindowExpired { next_scheduled_at } => {
                    assert_eq!(now, deadline);
                    assert_eq!(next_scheduled_at, deadline + PERIOD);
                    break;
                }
            }
        }
        assert!(!s.in_retry_window());
        assert_eq!(s.next_attempt_at(), deadline + PERIOD);
    }

    #[test]
    fn backoff_is_non_decreasing_and_capped() {
        let mut previous = 0;
        for step in 0..10 {
            let delay = Scheduler::backoff(step);
            assert!(delay >= previous);
            previous = delay;
        }
        assert_eq!(Scheduler::backoff(100), RETRY_DELAYS_MS[RETRY_DELAYS_MS.len() - 1]);
    }

    #[test]
    fn forced_failure_retries_before_existing_boundary() {
        let mut s = armed_at_zero();
        s.force_immediate(5_000);
        assert!(s.due_now(5_000));

        s.on_failure_enter_retry(5_000);
        let decision = s.on_retry_tick(5_000);

        assert_eq!(decision, RetryDecision::RetryAt(5_000 + RETRY_DELAYS_MS[0]));
        assert_eq!(s.window_deadline(), PERIOD + START_DELAY);
    }

    #[test]
    fn late_expiry_rolls_past_now() {
        let mut s = armed_at_zero();
        s.force_immediate(1_000);
        s.on_failure_enter_retry(1_000);

        // The next poll happens long after the window closed.
        let now = 10 * PERIOD + 7;
        let decision = s.on_retry_tick(now);

        match decision {
            RetryDecision::WindowExpired { next_scheduled_at } => {
                assert!(next_scheduled_at > now);
                assert_eq!((next_scheduled_at - (PERIOD + START_DELAY)) % PERIOD, 0);
            }
            other => panic!("expected expiry, got {other:?}"),
        }
        assert_invariant(&s);
    }

    #[test]
    fn period_change_realigns() {
        let mut s = armed_at_zero();
        s.force_immediate(2_000);

        s.set_period(10_000, 120_000);

        assert_eq!(s.period_ms(), 120_000);
        assert_eq!(s.next_scheduled_at(), 130_000);
        assert_eq!(s.next_attempt_at(), 130_000);
        assert!(!s.in_retry_window());
    }

    #[test]
    fn unchanged_period_is_a_no_op() {
        let mut s = armed_at_zero();
        let before = s.state();

        s.set_period(30_000, PERIOD);

        assert_eq!(s.state(), before);
    }

    #[test]
    fn period_is_floored() {
        let s = Scheduler::new(1_000, 0);

        assert_eq!(s.period_ms(), PERIOD_FLOOR_MS);
        assert_eq!(period_from_minutes(0), PERIOD_FLOOR_MS);
        assert_eq!(period_from_minutes(5), 300_000);
    }

    #[test]
    fn boot_fetch_is_bounded_by_first_boundary() {
        let mut s = Scheduler::new(PERIOD, START_DELAY);
        s.arm(0, true);

        assert_eq!(s.next_attempt_at(), START_DELAY);
        assert_eq!(s.window_deadline(), PERIOD + START_DELAY);
        assert!(!s.due_now(START_DELAY - 1));
        assert!(s.due_now(START_DELAY));
    }

    #[test]
    fn disarmed_scheduler_is_never_due() {
        let mut s = armed_at_zero();
        s.disarm();

        assert!(!s.due_now(u64::MAX / 2));
        assert!(!s.is_armed());
    }

    #[test]
    fn refresh_after_stale_deadline_closes_window() {
        let mut s = armed_at_zero();
        let deadline = PERIOD + START_DELAY;
        s.force_immediate(1_000);
        s.on_failure_enter_retry(1_000);
        assert!(matches!(s.on_retry_tick(1_000), RetryDecision::RetryAt(_)));

        // The refresh lands after the deadline but before the next poll.
        let expired = s.force_immediate(deadline + 435_000);

        assert_eq!(expired, Some(deadline + 8 * PERIOD));
        assert_eq!(s.next_attempt_at(), deadline + 435_000);
        assert_eq!(s.window_deadline(), deadline + 8 * PERIOD);
        assert!(s.in_retry_window());
        assert_invariant(&s);
    }

    #[test]
    fn window_invariant_holds_for_random_call_sequences() {
        let mut rng = StdRng::seed_from_u64(0x6d65_7461_72);

        for _ in 0..200 {
            let mut s = Scheduler::new(PERIOD * rng.random_range(1..4), START_DELAY);
            let mut now = rng.random_range(0..PERIOD);
            s.arm(now, rng.random_bool(0.5));
            assert_invariant(&s);

            for _ in 0..100 {
                now += match rng.random_range(0..10) {
                    0 => rng.random_range(0..10 * PERIOD),
                    1..=3 => rng.random_range(0..PERIOD),
                    _ => rng.random_range(0..10_000),
                };

                match rng.random_range(0..5) {
                    0 => {
                        s.due_now(now);
                    }
                    1 => {
                        if let Some(next) = s.force_immediate(now) {
                            assert!(next > now);
                        }
                    }
                    2 => {
                        s.on_failure_enter_retry(now);
                        if let RetryDecision::WindowExpired { next_scheduled_at } = s.on_retry_tick(now) {
                            assert!(next_scheduled_at > now);
                        }
                    }
                    3 => s.on_success(now),
                    _ => s.set_period(now, PERIOD * rng.random_range(1..4)),
                }

                assert_invariant(&s);
            }
        }
    }
}
