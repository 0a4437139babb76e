//! The five update strategies. Each observes a rule source and decides
//! *when* an update is due, notifying the scheduler through a non-owning
//! `StrategyObserver` reference rather than performing the fetch itself.

use crate::schedule::Priority;
use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

pub trait StrategyObserver: Send + Sync {
    fn on_update_due(&self, source_id: &str, priority: Priority);
}

#[derive(Debug, Clone)]
pub enum StrategyConfig {
    Interval {
        interval_secs: u64,
        jitter_pct: f64,
    },
    Scheduled {
        times_of_day: Vec<NaiveTime>,
        weekdays: Option<HashSet<Weekday>>,
        timezone: Tz,
    },
    Manual {
        min_interval_secs: i64,
    },
    PushWithFallback {
        fallback_interval_secs: u64,
    },
    Adaptive {
        base_interval_secs: u64,
        success_mult: f64,
        failure_mult: f64,
        min_interval_secs: u64,
        max_interval_secs: u64,
    },
}

/// Apply `±jitter_pct` jitter to a base interval.
pub fn jittered_interval(base: Duration, jitter_pct: f64) -> Duration {
    let base_secs = base.as_secs_f64();
    let spread = base_secs * jitter_pct;
    let delta = rand::rng().random_range(-spread..=spread);
    Duration::from_secs_f64((base_secs + delta).max(0.0))
}

/// Compute the next instant at or after `now` matching one of `times_of_day`
/// in `timezone`, restricted to `weekdays` if given, rolling forward a day
/// at a time until a valid slot is found.
pub fn next_scheduled_fire(
    now: DateTime<Utc>,
    times_of_day: &[NaiveTime],
    weekdays: Option<&HashSet<Weekday>>,
    timezone: Tz,
) -> DateTime<Utc> {
    let local_now = now.with_timezone(&timezone);
    for day_offset in 0..8 {
        let candidate_date = local_now.date_naive() + chrono::Duration::days(day_offset);
        if let Some(allowed) = weekdays {
            if !allowed.contains(&candidate_date.weekday()) {
                continue;
            }
        }
        let mut times_sorted = times_of_day.to_vec();
        times_sorted.sort();
        for time in &times_sorted {
            let naive = candidate_date.and_time(*time);
            if let Some(local_dt) = timezone.from_local_datetime(&naive).single() {
                if local_dt > local_now {
                    return local_dt.with_timezone(&Utc);
                }
            }
        }
    }
    // Degenerate fallback (no times configured or an unreachable local
    // time due to a DST gap every day checked): try again in an hour.
    now + chrono::Duration::hours(1)
}

pub struct AdaptiveState {
    pub interval: Duration,
    min: Duration,
    max: Duration,
    success_mult: f64,
    failure_mult: f64,
}

impl AdaptiveState {
    pub fn new(base: Duration, min: Duration, max: Duration, success_mult: f64, failure_mult: f64) -> Self {
        Self {
            interval: base,
            min,
            max,
            success_mult,
            failure_mult,
        }
    }

    pub fn record_success(&mut self) {
        let grown = self.interval.mul_f64(self.success_mult);
        self.interval = grown.clamp(self.min, self.max);
    }

    pub fn record_failure(&mut self) {
        let shrunk = self.interval.mul_f64(self.failure_mult);
        self.interval = shrunk.clamp(self.min, self.max);
    }
}

/// Shared handle for feeding fetch outcomes back into an adaptive
/// strategy's interval, and for `Manual`'s externally-triggered fire.
#[derive(Clone)]
pub struct AdaptiveHandle(Arc<Mutex<AdaptiveState>>);

impl AdaptiveHandle {
    pub fn record_success(&self) {
        self.0.lock().record_success();
    }

    pub fn record_failure(&self) {
        self.0.lock().record_failure();
    }

    pub fn current_interval(&self) -> Duration {
        self.0.lock().interval
    }
}

#[derive(Clone)]
pub struct ManualTrigger {
    min_interval_secs: i64,
    last_trigger_epoch: Arc<AtomicI64>,
}

impl ManualTrigger {
    pub fn new(min_interval_secs: i64) -> Self {
        Self {
            min_interval_secs,
            last_trigger_epoch: Arc::new(AtomicI64::new(i64::MIN)),
        }
    }

    /// Returns true if the trigger was honored (outside the minimum
    /// interval since the last successful trigger).
    pub fn trigger(&self) -> bool {
        let now = Utc::now().timestamp();
        let last = self.last_trigger_epoch.load(Ordering::SeqCst);
        if now - last < self.min_interval_secs {
            return false;
        }
        self.last_trigger_epoch.store(now, Ordering::SeqCst);
        true
    }
}

/// Spawns the background task implementing `config`'s auto-fire behavior
/// for `source_id`. Returns a handle for `Manual`/`Adaptive` strategies
/// that need an externally-driven input; other strategies return `None`.
pub enum StrategyHandle {
    Manual(ManualTrigger),
    Adaptive(AdaptiveHandle),
    None,
}

pub fn spawn_strategy(
    source_id: String,
    config: StrategyConfig,
    observer: Arc<dyn StrategyObserver>,
    push_rx: Option<mpsc::Receiver<()>>,
) -> StrategyHandle {
    match config {
        StrategyConfig::Interval {
            interval_secs,
            jitter_pct,
        } => {
            tokio::spawn(async move {
                loop {
                    let delay = jittered_interval(Duration::from_secs(interval_secs), jitter_pct);
                    tokio::time::sleep(delay).await;
                    observer.on_update_due(&source_id, Priority::Normal);
                }
            });
            StrategyHandle::None
        }
        StrategyConfig::Scheduled {
            times_of_day,
            weekdays,
            timezone,
        } => {
            tokio::spawn(async move {
                loop {
                    let next = next_scheduled_fire(Utc::now(), &times_of_day, weekdays.as_ref(), timezone);
                    let wait = (next - Utc::now()).to_std().unwrap_or(Duration::from_secs(1));
                    tokio::time::sleep(wait).await;
                    observer.on_update_due(&source_id, Priority::Normal);
                }
            });
            StrategyHandle::None
        }
        StrategyConfig::Manual { min_interval_secs } => StrategyHandle::Manual(ManualTrigger::new(min_interval_secs)),
        StrategyConfig::PushWithFallback { fallback_interval_secs } => {
            let mut push_rx = push_rx.unwrap_or_else(|| mpsc::channel(1).1);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        received = push_rx.recv() => {
                            if received.is_none() {
                                debug!(source = %source_id, "push channel closed, relying on fallback interval only");
                            }
                            observer.on_update_due(&source_id, Priority::High);
                        }
                        _ = tokio::time::sleep(Duration::from_secs(fallback_interval_secs)) => {
                            observer.on_update_due(&source_id, Priority::Normal);
                        }
                    }
                }
            });
            StrategyHandle::None
        }
        StrategyConfig::Adaptive {
            base_interval_secs,
            success_mult,
            failure_mult,
            min_interval_secs,
            max_interval_secs,
        } => {
            let state = Arc::new(Mutex::new(AdaptiveState::new(
                Duration::from_secs(base_interval_secs),
                Duration::from_secs(min_interval_secs),
                Duration::from_secs(max_interval_secs),
                success_mult,
                failure_mult,
            )));
            let handle = AdaptiveHandle(state.clone());
            tokio::spawn(async move {
                loop {
                    let interval = state.lock().interval;
                    tokio::time::sleep(interval).await;
                    observer.on_update_due(&source_id, Priority::Normal);
                }
            });
            StrategyHandle::Adaptive(handle)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(100);
        for _ in 0..50 {
            let jittered = jittered_interval(base, 0.1);
            assert!(jittered.as_secs_f64() >= 90.0 && jittered.as_secs_f64() <= 110.0);
        }
    }

    #[test]
    fn scheduled_fire_rolls_to_next_day_when_time_passed() {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 23, 0, 0).unwrap();
        let times = vec![NaiveTime::from_hms_opt(9, 0, 0).unwrap()];
        let next = next_scheduled_fire(now, &times, None, chrono_tz::UTC);
        assert_eq!(next.date_naive(), (now + chrono::Duration::days(1)).date_naive());
        assert_eq!(next.hour(), 9);
    }

    #[test]
    fn scheduled_fire_same_day_when_time_ahead() {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 6, 0, 0).unwrap();
        let times = vec![NaiveTime::from_hms_opt(9, 0, 0).unwrap()];
        let next = next_scheduled_fire(now, &times, None, chrono_tz::UTC);
        assert_eq!(next.date_naive(), now.date_naive());
    }

    #[test]
    fn scheduled_fire_respects_weekday_restriction() {
        // 2026-08-01 is a Saturday; restrict to weekdays (Mon-Fri).
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 6, 0, 0).unwrap();
        let times = vec![NaiveTime::from_hms_opt(9, 0, 0).unwrap()];
        let weekdays: HashSet<Weekday> = [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
        ]
        .into_iter()
        .collect();
        let next = next_scheduled_fire(now, &times, Some(&weekdays), chrono_tz::UTC);
        assert_eq!(next.weekday(), Weekday::Mon);
    }

    #[test]
    fn adaptive_state_grows_on_success_and_shrinks_on_failure() {
        let mut state = AdaptiveState::new(
            Duration::from_secs(100),
            Duration::from_secs(10),
            Duration::from_secs(1000),
            2.0,
            0.5,
        );
        state.record_success();
        assert_eq!(state.interval, Duration::from_secs(200));
        state.record_failure();
        assert_eq!(state.interval, Duration::from_secs(100));
    }

    #[test]
    fn adaptive_state_clamps_to_bounds() {
        let mut state = AdaptiveState::new(
            Duration::from_secs(100),
            Duration::from_secs(50),
            Duration::from_secs(150),
            10.0,
            0.01,
        );
        state.record_success();
        assert_eq!(state.interval, Duration::from_secs(150));
        state.record_failure();
        state.record_failure();
        assert_eq!(state.interval, Duration::from_secs(50));
    }

    #[test]
    fn manual_trigger_enforces_minimum_interval() {
        let trigger = ManualTrigger::new(3600);
        assert!(trigger.trigger());
        assert!(!trigger.trigger());
    }
}
