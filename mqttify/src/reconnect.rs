/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Exponential backoff bookkeeping for reconnect attempts.

The controller never touches the transport itself.  The client reports connection outcomes to
it and asks it when (and whether) the next attempt should happen.
 */

use crate::config::*;

use log::*;
use rand::Rng;
use std::time::{Duration, Instant};

const DEFAULT_STABILITY_PERIOD: Duration = Duration::from_secs(30);

/// What the client should do after a failed attempt or a lost connection
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ReconnectDecision {

    /// Try again at the given time
    RetryAt(Instant),

    /// The retry budget is spent; the value is the number of reconnect attempts made
    Abandon(u32),
}

pub(crate) struct ReconnectController {
    options: ReconnectOptions,

    next_reconnect_period: Duration,

    // reconnect attempts scheduled since the last stable connection
    attempts: u32,

    next_attempt_timepoint: Option<Instant>,
    stability_timepoint: Option<Instant>,
}

impl ReconnectController {

    pub(crate) fn new(mut options: ReconnectOptions) -> Self {
        options.normalize();

        ReconnectController {
            next_reconnect_period: options.base_reconnect_period,
            options,
            attempts: 0,
            next_attempt_timepoint: None,
            stability_timepoint: None,
        }
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Starts a fresh backoff sequence; used when the user asks for a connection.
    pub(crate) fn reset(&mut self) {
        self.attempts = 0;
        self.next_reconnect_period = self.options.base_reconnect_period;
        self.cancel();
    }

    /// Cancels every pending timer.
    pub(crate) fn cancel(&mut self) {
        self.next_attempt_timepoint = None;
        self.stability_timepoint = None;
    }

    /// A connection reached the Connected state.  Once it has stayed up for the stability
    /// period (the negotiated keep alive unless overridden, or a fixed default when keep alive
    /// is disabled), the backoff resets.
    pub(crate) fn on_connection_established(&mut self, now: Instant, keep_alive_seconds: u16) {
        let stability_period = match (self.options.reconnect_stability_reset_period, keep_alive_seconds) {
            (Some(period), _) => { period }
            (None, 0) => { DEFAULT_STABILITY_PERIOD }
            (None, keep_alive) => { Duration::from_secs(keep_alive as u64) }
        };

        self.next_attempt_timepoint = None;
        self.stability_timepoint = Some(now + stability_period);
    }

    /// Records a failed attempt or a lost connection and decides what happens next.
    pub(crate) fn on_connection_failed(&mut self, now: Instant) -> ReconnectDecision {
        self.stability_timepoint = None;

        if let MaxRetriesPolicy::Limited(limit) = self.options.max_retries_policy {
            if self.attempts >= limit {
                warn!("ReconnectController - abandoning reconnection after {} attempts", self.attempts);
                self.next_attempt_timepoint = None;
                return ReconnectDecision::Abandon(self.attempts);
            }
        }

        self.attempts += 1;
        let delay = self.compute_reconnect_period();
        let timepoint = now + delay;

        info!("ReconnectController - reconnect attempt {} scheduled in {} ms", self.attempts, delay.as_millis());
        self.next_attempt_timepoint = Some(timepoint);

        ReconnectDecision::RetryAt(timepoint)
    }

    /// Updates the stability timer and reports whether a scheduled attempt is due.  A due
    /// attempt is consumed.
    pub(crate) fn service(&mut self, now: Instant) -> bool {
        if let Some(stability_timepoint) = self.stability_timepoint {
            if now >= stability_timepoint {
                debug!("ReconnectController - connection stable, resetting backoff");
                self.stability_timepoint = None;
                self.attempts = 0;
                self.next_reconnect_period = self.options.base_reconnect_period;
            }
        }

        if let Some(next_attempt) = self.next_attempt_timepoint {
            if now >= next_attempt {
                self.next_attempt_timepoint = None;
                return true;
            }
        }

        false
    }

    pub(crate) fn next_service_timepoint(&self) -> Option<Instant> {
        match (self.next_attempt_timepoint, self.stability_timepoint) {
            (Some(attempt), Some(stability)) => { Some(attempt.min(stability)) }
            (attempt, stability) => { attempt.or(stability) }
        }
    }

    fn clamp_reconnect_period(&self, reconnect_period: Duration) -> Duration {
        reconnect_period.min(self.options.max_reconnect_period)
    }

    // saturates at the max period instead of overflowing Duration
    fn scale_reconnect_period(&self, reconnect_period: Duration) -> Duration {
        let max_period = self.options.max_reconnect_period;
        let scaled_secs = reconnect_period.as_secs_f64() * self.options.reconnect_period_multiplier;
        if !scaled_secs.is_finite() || scaled_secs >= max_period.as_secs_f64() {
            return max_period;
        }

        self.clamp_reconnect_period(Duration::try_from_secs_f64(scaled_secs).unwrap_or(max_period))
    }

    fn compute_uniform_jitter_period(&self, max_nanos: u128) -> Duration {
        if max_nanos == 0 {
            return Duration::ZERO;
        }

        let mut rng = rand::thread_rng();
        let uniform_nanos = rng.gen_range(0..max_nanos);
        Duration::from_nanos(uniform_nanos.min(u64::MAX as u128) as u64)
    }

    fn compute_reconnect_period(&mut self) -> Duration {
        let reconnect_period = self.next_reconnect_period;
        self.next_reconnect_period = self.scale_reconnect_period(reconnect_period);

        match self.options.reconnect_period_jitter {
            ExponentialBackoffJitterType::None => {
                reconnect_period
            }
            ExponentialBackoffJitterType::Uniform => {
                self.compute_uniform_jitter_period(reconnect_period.as_nanos())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn no_jitter_options(policy: MaxRetriesPolicy) -> ReconnectOptions {
        ReconnectOptions::builder()
            .with_reconnect_period_jitter(ExponentialBackoffJitterType::None)
            .with_base_reconnect_period(Duration::from_secs(1))
            .with_max_reconnect_period(Duration::from_secs(10))
            .with_max_retries_policy(policy)
            .build()
    }

    #[test]
    fn backoff_grows_to_cap() {
        let mut controller = ReconnectController::new(no_jitter_options(MaxRetriesPolicy::Forever));
        let now = Instant::now();

        let expected = [1, 2, 4, 8, 10, 10];
        for seconds in expected {
            assert_eq!(ReconnectDecision::RetryAt(now + Duration::from_secs(seconds)), controller.on_connection_failed(now));
        }
    }

    #[test]
    fn backoff_respects_multiplier() {
        let options = ReconnectOptions::builder()
            .with_reconnect_period_jitter(ExponentialBackoffJitterType::None)
            .with_base_reconnect_period(Duration::from_secs(2))
            .with_reconnect_period_multiplier(3.0)
            .with_max_reconnect_period(Duration::from_secs(100))
            .build();
        let mut controller = ReconnectController::new(options);
        let now = Instant::now();

        for seconds in [2, 6, 18, 54, 100] {
            assert_eq!(ReconnectDecision::RetryAt(now + Duration::from_secs(seconds)), controller.on_connection_failed(now));
        }
    }

    #[test]
    fn huge_multiplier_saturates_at_max_period() {
        let options = ReconnectOptions::builder()
            .with_reconnect_period_jitter(ExponentialBackoffJitterType::None)
            .with_base_reconnect_period(Duration::from_secs(1))
            .with_reconnect_period_multiplier(1e30)
            .with_max_reconnect_period(Duration::from_secs(60))
            .build();
        let mut controller = ReconnectController::new(options);
        let now = Instant::now();

        for seconds in [1, 60, 60] {
            assert_eq!(ReconnectDecision::RetryAt(now + Duration::from_secs(seconds)), controller.on_connection_failed(now));
        }
    }

    #[test]
    fn uniform_jitter_stays_within_backoff() {
        let options = ReconnectOptions::builder()
            .with_base_reconnect_period(Duration::from_secs(4))
            .with_max_reconnect_period(Duration::from_secs(4))
            .build();
        let mut controller = ReconnectController::new(options);
        let now = Instant::now();

        for _ in 0..50 {
            assert_matches!(controller.on_connection_failed(now), ReconnectDecision::RetryAt(timepoint) if timepoint < now + Duration::from_secs(4));
        }
    }

    #[test]
    fn limited_policy_abandons() {
        let mut controller = ReconnectController::new(no_jitter_options(MaxRetriesPolicy::Limited(2)));
        let now = Instant::now();

        assert_matches!(controller.on_connection_failed(now), ReconnectDecision::RetryAt(_));
        assert_matches!(controller.on_connection_failed(now), ReconnectDecision::RetryAt(_));
        assert_eq!(ReconnectDecision::Abandon(2), controller.on_connection_failed(now));
        assert_eq!(None, controller.next_service_timepoint());
    }

    #[test]
    fn stable_connection_resets_attempts() {
        let mut controller = ReconnectController::new(no_jitter_options(MaxRetriesPolicy::Limited(3)));
        let now = Instant::now();

        controller.on_connection_failed(now);
        controller.on_connection_failed(now);
        assert_eq!(2, controller.attempts());

        controller.on_connection_established(now, 30);
        assert!(!controller.service(now + Duration::from_secs(29)));
        assert_eq!(2, controller.attempts());

        controller.service(now + Duration::from_secs(30));
        assert_eq!(0, controller.attempts());
        assert_eq!(ReconnectDecision::RetryAt(now + Duration::from_secs(31)), controller.on_connection_failed(now + Duration::from_secs(30)));
    }

    #[test]
    fn disabled_keep_alive_uses_default_stability_period() {
        let mut controller = ReconnectController::new(no_jitter_options(MaxRetriesPolicy::Forever));
        let now = Instant::now();

        controller.on_connection_failed(now);
        controller.on_connection_failed(now);
        controller.on_connection_established(now, 0);

        controller.service(now + Duration::from_millis(1));
        assert_eq!(2, controller.attempts());
        assert_eq!(Some(now + DEFAULT_STABILITY_PERIOD), controller.next_service_timepoint());

        controller.service(now + DEFAULT_STABILITY_PERIOD);
        assert_eq!(0, controller.attempts());
    }

    #[test]
    fn unstable_connection_keeps_backoff() {
        let mut controller = ReconnectController::new(no_jitter_options(MaxRetriesPolicy::Forever));
        let now = Instant::now();

        controller.on_connection_failed(now);
        controller.on_connection_established(now, 30);

        let later = now + Duration::from_secs(5);
        assert_eq!(ReconnectDecision::RetryAt(later + Duration::from_secs(2)), controller.on_connection_failed(later));
    }

    #[test]
    fn due_attempt_is_consumed() {
        let mut controller = ReconnectController::new(no_jitter_options(MaxRetriesPolicy::Forever));
        let now = Instant::now();

        controller.on_connection_failed(now);
        assert_eq!(Some(now + Duration::from_secs(1)), controller.next_service_timepoint());
        assert!(!controller.service(now));
        assert!(controller.service(now + Duration::from_secs(1)));
        assert!(!controller.service(now + Duration::from_secs(2)));
    }

    #[test]
    fn cancel_clears_timers() {
        let mut controller = ReconnectController::new(no_jitter_options(MaxRetriesPolicy::Forever));
        let now = Instant::now();

        controller.on_connection_failed(now);
        controller.cancel();

        assert_eq!(None, controller.next_service_timepoint());
        assert!(!controller.service(now + Duration::from_secs(100)));
    }
}
