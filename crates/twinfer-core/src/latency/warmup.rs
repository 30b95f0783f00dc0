//! Warm-up lifecycle.
//!
//! `Uninitialized → WarmingUp → Ready`. Each backend runs a fixed number of
//! discarded dummy inferences so lazy kernel compilation and allocator
//! growth do not land on the first measured request. A failing warm-up run
//! degrades latency numbers, not correctness: it is logged and the backend
//! still becomes `Ready`.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::timing::Clock;
use crate::executor::{BackendKind, DualExecutor};
use twinfer_inference::{InferenceBackend, InputTensor};

/// Default number of dummy inferences per backend.
pub const DEFAULT_WARMUP_ITERATIONS: usize = 5;

/// Lifecycle of one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    WarmingUp,
    Ready,
}

/// Outcome of one warm-up pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmupReport {
    pub backend: BackendKind,
    pub requested: usize,
    pub completed: usize,
    pub failures: Vec<String>,
    pub duration_ms: f64,
}

impl WarmupReport {
    /// At least one dummy inference failed.
    pub fn degraded(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Drives both backends through warm-up, sequentially.
#[derive(Debug, Clone)]
pub struct WarmupController {
    iterations: usize,
    native: LifecycleState,
    portable: LifecycleState,
}

impl WarmupController {
    pub fn new(iterations: usize) -> Self {
        Self {
            iterations,
            native: LifecycleState::Uninitialized,
            portable: LifecycleState::Uninitialized,
        }
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn state(&self, kind: BackendKind) -> LifecycleState {
        match kind {
            BackendKind::Native => self.native,
            BackendKind::Portable => self.portable,
        }
    }

    /// Both backends have finished warm-up.
    pub fn is_ready(&self) -> bool {
        self.native == LifecycleState::Ready && self.portable == LifecycleState::Ready
    }

    fn set_state(&mut self, kind: BackendKind, state: LifecycleState) {
        match kind {
            BackendKind::Native => self.native = state,
            BackendKind::Portable => self.portable = state,
        }
    }

    /// Warm up one backend with all-zero tensors of `input_shape`.
    ///
    /// May be repeated on a `Ready` backend; it passes through `WarmingUp`
    /// again and ends `Ready`.
    pub fn warm_up(
        &mut self,
        kind: BackendKind,
        backend: &dyn InferenceBackend,
        input_shape: &[usize],
        clock: &dyn Clock,
    ) -> WarmupReport {
        self.set_state(kind, LifecycleState::WarmingUp);

        let dummy = InputTensor::zeros(input_shape);
        let started = clock.now_ms();
        let mut completed = 0;
        let mut failures = Vec::new();

        for i in 0..self.iterations {
            match backend.run(&dummy) {
                Ok(_) => completed += 1,
                Err(e) => {
                    warn!("{} warm-up run {}/{} failed: {}", kind, i + 1, self.iterations, e);
                    failures.push(e.to_string());
                }
            }
        }

        let report = WarmupReport {
            backend: kind,
            requested: self.iterations,
            completed,
            failures,
            duration_ms: (clock.now_ms() - started).max(0.0),
        };

        if report.degraded() {
            warn!(
                "{} backend ready in degraded mode ({}/{} warm-up runs succeeded)",
                kind, report.completed, report.requested
            );
        } else {
            info!(
                "{} backend ready after {} warm-up runs in {:.1}ms",
                kind, report.completed, report.duration_ms
            );
        }

        self.set_state(kind, LifecycleState::Ready);
        report
    }

    /// Warm up both backends of an executor, native first.
    pub fn warm_up_executor(&mut self, executor: &DualExecutor, clock: &dyn Clock) -> Vec<WarmupReport> {
        let shape = executor.spec().input_shape();
        BackendKind::ALL
            .iter()
            .map(|&kind| self.warm_up(kind, executor.backend(kind), &shape, clock))
            .collect()
    }
}

impl Default for WarmupController {
    fn default() -> Self {
        Self::new(DEFAULT_WARMUP_ITERATIONS)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::executor::ModelSpec;
    use crate::executor::fakes::LinearBackend;
    use crate::latency::test_clock::StepClock;
    use pretty_assertions::assert_eq;

    const SHAPE: [usize; 4] = [1, 3, 224, 224];

    #[test]
    fn test_transitions_to_ready() {
        let backend = LinearBackend::new(1000, 0.0);
        let clock = StepClock::new(1);
        let mut controller = WarmupController::default();
        assert_eq!(controller.state(BackendKind::Native), LifecycleState::Uninitialized);

        let report = controller.warm_up(BackendKind::Native, &backend, &SHAPE, &clock);

        assert_eq!(controller.state(BackendKind::Native), LifecycleState::Ready);
        assert_eq!(controller.state(BackendKind::Portable), LifecycleState::Uninitialized);
        assert!(!controller.is_ready());
        assert_eq!(report.completed, 5);
        assert!(!report.degraded());
        assert_eq!(backend.calls(), 5);
    }

    #[test]
    fn test_failures_degrade_but_do_not_block() {
        let backend = LinearBackend::new(1000, 0.0).failing_first(2);
        let clock = StepClock::new(1);
        let mut controller = WarmupController::new(3);

        let report = controller.warm_up(BackendKind::Portable, &backend, &SHAPE, &clock);

        assert_eq!(controller.state(BackendKind::Portable), LifecycleState::Ready);
        assert!(report.degraded());
        assert_eq!(report.completed, 1);
        assert_eq!(report.failures.len(), 2);
    }

    #[test]
    fn test_every_run_failing_still_ready() {
        let backend = LinearBackend::new(1000, 0.0).failing_first(usize::MAX);
        let clock = StepClock::new(1);
        let mut controller = WarmupController::new(4);

        let report = controller.warm_up(BackendKind::Native, &backend, &SHAPE, &clock);
        assert_eq!(report.completed, 0);
        assert_eq!(controller.state(BackendKind::Native), LifecycleState::Ready);
    }

    #[test]
    fn test_repeated_warm_up_is_stable() {
        let native = Arc::new(LinearBackend::new(1000, 0.0));
        let portable = Arc::new(LinearBackend::new(1000, 0.0));
        let executor = DualExecutor::new(native.clone(), portable.clone(), ModelSpec::default());
        let clock = StepClock::new(1);
        let mut controller = WarmupController::new(2);

        let first = controller.warm_up_executor(&executor, &clock);
        let second = controller.warm_up_executor(&executor, &clock);

        assert!(controller.is_ready());
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].backend, BackendKind::Native);
        assert_eq!(first[1].backend, BackendKind::Portable);
        // Each pass reads the clock exactly twice, so durations match.
        assert_eq!(first[0].duration_ms, second[0].duration_ms);
        assert_eq!(native.calls(), 4);
        assert_eq!(portable.calls(), 4);
    }

    #[test]
    fn test_zero_iterations() {
        let backend = LinearBackend::new(1000, 0.0);
        let clock = StepClock::new(1);
        let mut controller = WarmupController::new(0);
        let report = controller.warm_up(BackendKind::Native, &backend, &SHAPE, &clock);
        assert_eq!(report.requested, 0);
        assert_eq!(backend.calls(), 0);
        assert_eq!(controller.state(BackendKind::Native), LifecycleState::Ready);
    }
}
