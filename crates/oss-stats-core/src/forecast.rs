//! Live counter interpolation between two real data points.
//!
//! A display shows `value` at `range_start` and expects to reach `next_value`
//! at `range_end`. Between real syncs the counter estimates the current number
//! linearly. Missing or non-finite inputs never produce arithmetic on them:
//! the estimate falls back to `value` (or to no estimate when `value` itself
//! is missing).

use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};

use crate::{DayOfWeekAverages, DependentSnapshot};

pub const MIN_TICK_MS: u64 = 100;
pub const MAX_TICK_MS: u64 = 1000;
/// Interval changes smaller than this are ignored.
pub const TICK_HYSTERESIS_MS: u64 = 50;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ForecastInput {
    pub value: Option<f64>,
    pub next_value: Option<f64>,
    /// Milliseconds since the Unix epoch.
    pub range_start: Option<i64>,
    /// Milliseconds since the Unix epoch.
    pub range_end: Option<i64>,
}

fn finite(v: Option<f64>) -> Option<f64> {
    v.filter(|x| x.is_finite())
}

fn to_count(x: f64) -> i64 {
    // `as` saturates at the i64 bounds
    x.round() as i64
}

impl ForecastInput {
    pub fn new(
        value: Option<f64>,
        next_value: Option<f64>,
        range_start: Option<i64>,
        range_end: Option<i64>,
    ) -> Self {
        Self {
            value,
            next_value,
            range_start,
            range_end,
        }
    }

    /// Change per millisecond, when every input is present and the range is non-empty.
    fn rate_per_ms(&self) -> Option<f64> {
        let value = finite(self.value)?;
        let next = finite(self.next_value)?;
        let start = self.range_start?;
        let end = self.range_end?;
        if end <= start {
            return None;
        }
        let rate = (next - value) / (end - start) as f64;
        rate.is_finite().then_some(rate)
    }

    pub fn rate_per_sec(&self) -> Option<f64> {
        self.rate_per_ms().map(|r| r * 1000.0)
    }

    /// Estimated value at `now_ms`, rounded to the nearest integer.
    pub fn estimate(&self, now_ms: i64) -> Option<i64> {
        let value = finite(self.value)?;
        let (Some(rate), Some(start)) = (self.rate_per_ms(), self.range_start) else {
            return Some(to_count(value));
        };
        if now_ms <= start {
            return Some(to_count(value));
        }

        let elapsed = now_ms.saturating_sub(start) as f64;
        let mut estimate = value + rate * elapsed;
        if !estimate.is_finite() {
            return Some(to_count(value));
        }
        if let Some(next) = finite(self.next_value) {
            if next < value {
                // a decline stops at the projected value
                estimate = estimate.max(next);
            }
        }
        Some(to_count(estimate))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CadenceMode {
    Fixed(u64),
    Adaptive,
}

/// How often a counter recomputes its estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickCadence {
    mode: CadenceMode,
    interval_ms: u64,
}

impl TickCadence {
    pub fn fixed(interval_ms: u64) -> Self {
        Self {
            mode: CadenceMode::Fixed(interval_ms),
            interval_ms: interval_ms.max(1),
        }
    }

    pub fn adaptive() -> Self {
        Self {
            mode: CadenceMode::Adaptive,
            interval_ms: MAX_TICK_MS,
        }
    }

    pub fn mode(&self) -> CadenceMode {
        self.mode
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Interval that advances the display by about one unit per tick, clamped
    /// into `[MIN_TICK_MS, MAX_TICK_MS]`.
    pub fn ideal_interval_ms(rate_per_sec: Option<f64>) -> u64 {
        match rate_per_sec.map(f64::abs) {
            Some(rate) if rate.is_finite() && rate > 0.0 => {
                let ms = (1000.0 / rate).round();
                (ms as u64).clamp(MIN_TICK_MS, MAX_TICK_MS)
            }
            _ => MAX_TICK_MS,
        }
    }

    /// Recomputes the adaptive interval. Returns true when the interval changed.
    pub fn update(&mut self, rate_per_sec: Option<f64>) -> bool {
        if let CadenceMode::Fixed(_) = self.mode {
            return false;
        }
        let ideal = Self::ideal_interval_ms(rate_per_sec);
        if ideal.abs_diff(self.interval_ms) < TICK_HYSTERESIS_MS {
            return false;
        }
        self.interval_ms = ideal;
        true
    }
}

impl Default for TickCadence {
    fn default() -> Self {
        Self::fixed(MAX_TICK_MS)
    }
}

/// Restartable counter state for one display.
#[derive(Debug, Clone)]
pub struct ForecastCounter {
    input: ForecastInput,
    cadence: TickCadence,
    current: Option<i64>,
}

impl ForecastCounter {
    pub fn new(input: ForecastInput, cadence: TickCadence) -> Self {
        let mut counter = Self {
            input,
            cadence,
            current: None,
        };
        counter.cadence.update(input.rate_per_sec());
        counter
    }

    /// Starts over from a new baseline, discarding the previous estimate.
    pub fn restart(&mut self, input: ForecastInput) {
        self.input = input;
        self.current = None;
        self.cadence.update(input.rate_per_sec());
    }

    pub fn tick(&mut self, now_ms: i64) -> Option<i64> {
        let next = self.input.estimate(now_ms);
        let growing = matches!(
            (finite(self.input.value), finite(self.input.next_value)),
            (Some(v), Some(n)) if n >= v
        );
        self.current = match (self.current, next) {
            (Some(prev), Some(next)) if growing && next < prev => Some(prev),
            (_, next) => next,
        };
        self.current
    }

    pub fn current(&self) -> Option<i64> {
        self.current
    }

    pub fn interval(&self) -> Duration {
        self.cadence.interval()
    }

    pub fn input(&self) -> &ForecastInput {
        &self.input
    }
}

/// Download counter inputs: one day forward at tomorrow's weekday average.
pub fn npm_download_forecast(
    download_count: u64,
    day_of_week_averages: &DayOfWeekAverages,
    updated_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> ForecastInput {
    let tomorrow = (now.weekday().num_days_from_sunday() as usize + 1) % 7;
    let next = download_count.saturating_add(day_of_week_averages.get(tomorrow));
    let start = updated_at.timestamp_millis();
    ForecastInput::new(
        Some(download_count as f64),
        Some(next as f64),
        Some(start),
        Some(start.saturating_add(DAY_MS)),
    )
}

/// Dependent counter inputs: continue 80% of the last observed growth over an
/// equally long period. No projection without a positive, lower baseline.
pub fn github_dependent_forecast(
    dependent_count: u64,
    previous: Option<&DependentSnapshot>,
    updated_at: DateTime<Utc>,
) -> ForecastInput {
    let next_value = previous
        .filter(|p| dependent_count > 0 && p.count > 0 && p.count < dependent_count)
        .map(|p| {
            let growth = (dependent_count - p.count) as f64;
            (dependent_count as f64 + growth * 0.8).round()
        });
    let start = updated_at.timestamp_millis();
    let range_end = previous.map(|p| {
        let span = start.saturating_sub(p.updated_at.timestamp_millis());
        start.saturating_add(span)
    });
    ForecastInput::new(
        Some(dependent_count as f64),
        next_value,
        Some(start),
        range_end,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const T: i64 = 1_700_000_000_000;

    fn growth() -> ForecastInput {
        ForecastInput::new(Some(1000.0), Some(1100.0), Some(T), Some(T + DAY_MS))
    }

    #[test]
    fn halfway_through_range_is_halfway_between_values() {
        assert_eq!(growth().estimate(T + DAY_MS / 2), Some(1050));
    }

    #[test]
    fn before_range_start_yields_value() {
        assert_eq!(growth().estimate(T - 10_000), Some(1000));
        assert_eq!(growth().estimate(T), Some(1000));
    }

    #[test]
    fn missing_inputs_fall_back_to_value() {
        let mut input = growth();
        input.next_value = None;
        assert_eq!(input.estimate(T + 1000), Some(1000));

        let mut input = growth();
        input.range_end = None;
        assert_eq!(input.estimate(T + 1000), Some(1000));

        let mut input = growth();
        input.value = None;
        assert_eq!(input.estimate(T + 1000), None);

        let input = ForecastInput::new(Some(f64::NAN), Some(1.0), Some(T), Some(T + 1));
        assert_eq!(input.estimate(T + 1), None);

        let input = ForecastInput::new(Some(10.0), Some(f64::INFINITY), Some(T), Some(T + 1));
        assert_eq!(input.estimate(T + 1), Some(10));
    }

    #[test]
    fn empty_range_never_divides_by_zero() {
        let input = ForecastInput::new(Some(10.0), Some(20.0), Some(T), Some(T));
        assert_eq!(input.estimate(T + 5000), Some(10));
        assert_eq!(input.rate_per_sec(), None);
    }

    #[test]
    fn decline_is_bounded_by_next_value() {
        let input = ForecastInput::new(Some(100.0), Some(90.0), Some(T), Some(T + 10_000));
        assert_eq!(input.estimate(T + 5_000), Some(95));
        assert_eq!(input.estimate(T + 1_000_000), Some(90));
    }

    #[test]
    fn huge_values_saturate_instead_of_overflowing() {
        let input = ForecastInput::new(Some(1e300), Some(1e308), Some(0), Some(1));
        assert_eq!(input.estimate(i64::MAX), Some(i64::MAX));
    }

    #[test]
    fn adaptive_cadence_clamps_and_damps() {
        assert_eq!(TickCadence::ideal_interval_ms(Some(0.001)), MAX_TICK_MS);
        assert_eq!(TickCadence::ideal_interval_ms(Some(1_000.0)), MIN_TICK_MS);
        assert_eq!(TickCadence::ideal_interval_ms(Some(-4.0)), 250);
        assert_eq!(TickCadence::ideal_interval_ms(None), MAX_TICK_MS);

        let mut cadence = TickCadence::adaptive();
        assert!(cadence.update(Some(4.0)));
        assert_eq!(cadence.interval(), Duration::from_millis(250));
        // 1000 / 4.5 = 222ms, within the hysteresis band
        assert!(!cadence.update(Some(4.5)));
        assert_eq!(cadence.interval(), Duration::from_millis(250));
        assert!(cadence.update(Some(8.0)));
        assert_eq!(cadence.interval(), Duration::from_millis(125));
    }

    #[test]
    fn fixed_cadence_ignores_rate() {
        let mut cadence = TickCadence::fixed(1000);
        assert!(!cadence.update(Some(500.0)));
        assert_eq!(cadence.interval(), Duration::from_millis(1000));
    }

    #[test]
    fn counter_restarts_from_new_baseline() {
        let mut counter = ForecastCounter::new(growth(), TickCadence::adaptive());
        assert_eq!(counter.tick(T + DAY_MS / 2), Some(1050));
        // an earlier sample never moves a growing counter backward
        assert_eq!(counter.tick(T + DAY_MS / 4), Some(1050));

        counter.restart(ForecastInput::new(Some(2000.0), Some(2100.0), Some(T), Some(T + DAY_MS)));
        assert_eq!(counter.current(), None);
        assert_eq!(counter.tick(T), Some(2000));
    }

    #[test]
    fn npm_forecast_uses_tomorrows_weekday() {
        // 2024-01-06 is a Saturday, so tomorrow is Sunday (slot 0)
        let now = Utc.with_ymd_and_hms(2024, 1, 6, 12, 0, 0).single().unwrap();
        let averages = DayOfWeekAverages([70, 10, 20, 30, 40, 50, 60]);
        let input = npm_download_forecast(1000, &averages, now, now);
        assert_eq!(input.next_value, Some(1070.0));
        assert_eq!(input.range_end, Some(now.timestamp_millis() + DAY_MS));
    }

    #[test]
    fn dependent_forecast_requires_lower_positive_baseline() {
        let updated = Utc.timestamp_millis_opt(T).single().unwrap();
        let prev = DependentSnapshot {
            count: 100,
            updated_at: Utc.timestamp_millis_opt(T - DAY_MS).single().unwrap(),
        };
        let input = github_dependent_forecast(110, Some(&prev), updated);
        assert_eq!(input.next_value, Some(118.0));
        assert_eq!(input.range_end, Some(T + DAY_MS));

        let higher = DependentSnapshot { count: 200, ..prev };
        assert_eq!(github_dependent_forecast(110, Some(&higher), updated).next_value, None);

        let none = github_dependent_forecast(110, None, updated);
        assert_eq!(none.next_value, None);
        assert_eq!(none.estimate(T + 5), Some(110));
    }
}
