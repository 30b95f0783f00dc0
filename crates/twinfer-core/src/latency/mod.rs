//! Per-stage latency measurement and the warm-up protocol.

mod timing;
mod warmup;

pub use timing::{
    Clock, LatencyBreakdown, LatencyStats, MonotonicClock, RequestTimer, Stage, StageSummary,
};
pub use warmup::{DEFAULT_WARMUP_ITERATIONS, LifecycleState, WarmupController, WarmupReport};

#[cfg(test)]
pub(crate) use timing::test_clock;
