//! Request-scoped stage timing.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// A monotonic millisecond clock.
///
/// `std::time::Instant` is unavailable in the browser, so the wasm bindings
/// plug in `performance.now()` instead.
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary, fixed origin.
    fn now_ms(&self) -> f64;
}

/// [`Clock`] backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }
}

/// Timed pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Decode,
    Preprocess,
    Inference,
}

/// Stage durations of one request, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyBreakdown {
    pub decode_ms: f64,
    pub preprocess_ms: f64,
    pub inference_ms: f64,
    pub total_ms: f64,
}

/// Timer owned by exactly one request.
///
/// Each stage accumulates, so measuring the same stage twice adds up.
pub struct RequestTimer<'c> {
    clock: &'c dyn Clock,
    started: f64,
    breakdown: LatencyBreakdown,
}

impl<'c> RequestTimer<'c> {
    /// Start timing at request entry.
    pub fn start(clock: &'c dyn Clock) -> Self {
        Self {
            clock,
            started: clock.now_ms(),
            breakdown: LatencyBreakdown::default(),
        }
    }

    /// Run `f` and charge its duration to `stage`.
    pub fn measure<T>(&mut self, stage: Stage, f: impl FnOnce() -> T) -> T {
        let before = self.clock.now_ms();
        let out = f();
        let elapsed = (self.clock.now_ms() - before).max(0.0);

        match stage {
            Stage::Decode => self.breakdown.decode_ms += elapsed,
            Stage::Preprocess => self.breakdown.preprocess_ms += elapsed,
            Stage::Inference => self.breakdown.inference_ms += elapsed,
        }
        out
    }

    /// Stop the timer; total covers everything since [`RequestTimer::start`].
    pub fn finish(self) -> LatencyBreakdown {
        LatencyBreakdown {
            total_ms: (self.clock.now_ms() - self.started).max(0.0),
            ..self.breakdown
        }
    }
}

/// Distribution of one stage's durations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
}

impl StageSummary {
    fn from_values(mut values: Vec<f64>) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        values.sort_by(f64::total_cmp);

        let n = values.len();
        let percentile = |p: f64| {
            let rank = ((p / 100.0) * n as f64).ceil() as usize;
            values[rank.clamp(1, n) - 1]
        };

        Self {
            mean: values.iter().sum::<f64>() / n as f64,
            min: values[0],
            max: values[n - 1],
            p50: percentile(50.0),
            p95: percentile(95.0),
        }
    }
}

/// Summary over many requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub samples: usize,
    pub decode: StageSummary,
    pub preprocess: StageSummary,
    pub inference: StageSummary,
    pub total: StageSummary,
}

impl LatencyStats {
    pub fn from_samples(samples: &[LatencyBreakdown]) -> Self {
        let column = |f: fn(&LatencyBreakdown) -> f64| samples.iter().map(f).collect::<Vec<_>>();

        Self {
            samples: samples.len(),
            decode: StageSummary::from_values(column(|s| s.decode_ms)),
            preprocess: StageSummary::from_values(column(|s| s.preprocess_ms)),
            inference: StageSummary::from_values(column(|s| s.inference_ms)),
            total: StageSummary::from_values(column(|s| s.total_ms)),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_clock {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::Clock;

    /// Clock that advances a fixed step every time it is read.
    pub struct StepClock {
        ticks: AtomicU64,
        step_ms: u64,
    }

    impl StepClock {
        pub fn new(step_ms: u64) -> Self {
            Self {
                ticks: AtomicU64::new(0),
                step_ms,
            }
        }
    }

    impl Clock for StepClock {
        fn now_ms(&self) -> f64 {
            (self.ticks.fetch_add(1, Ordering::SeqCst) * self.step_ms) as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_clock::StepClock;
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_breakdown_from_step_clock() {
        // Every read advances 10ms: start=0, each stage spans one step.
        let clock = StepClock::new(10);
        let mut timer = RequestTimer::start(&clock);
        timer.measure(Stage::Decode, || ());
        let value = timer.measure(Stage::Preprocess, || 42);
        timer.measure(Stage::Inference, || ());
        let breakdown = timer.finish();

        assert_eq!(value, 42);
        assert_eq!(
            breakdown,
            LatencyBreakdown {
                decode_ms: 10.0,
                preprocess_ms: 10.0,
                inference_ms: 10.0,
                total_ms: 70.0,
            }
        );
    }

    #[test]
    fn test_timers_are_independent() {
        let clock = MonotonicClock::new();
        let mut a = RequestTimer::start(&clock);
        let b = RequestTimer::start(&clock);
        a.measure(Stage::Inference, || std::thread::sleep(std::time::Duration::from_millis(5)));

        let a = a.finish();
        let b = b.finish();
        assert!(a.inference_ms >= 5.0);
        assert_eq!(b.inference_ms, 0.0);
    }

    #[test]
    fn test_stats() {
        let samples: Vec<LatencyBreakdown> = (1..=20)
            .map(|i| LatencyBreakdown {
                inference_ms: i as f64,
                total_ms: i as f64 * 2.0,
                ..Default::default()
            })
            .collect();
        let stats = LatencyStats::from_samples(&samples);

        assert_eq!(stats.samples, 20);
        assert_eq!(stats.inference.min, 1.0);
        assert_eq!(stats.inference.max, 20.0);
        assert_eq!(stats.inference.p50, 10.0);
        assert_eq!(stats.inference.p95, 19.0);
        assert!((stats.inference.mean - 10.5).abs() < 1e-9);
        assert_eq!(stats.total.max, 40.0);
    }

    #[test]
    fn test_stats_empty() {
        assert_eq!(LatencyStats::from_samples(&[]), LatencyStats::default());
    }
}
