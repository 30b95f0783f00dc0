//! Cross-backend comparison.
//!
//! A parity regression shows up as growing L2 distances or a top-1
//! disagreement, never as a crash, so everything here returns numbers and
//! leaves the verdict to [`ParityGate`] or the caller.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TwinferError};
use crate::executor::ScoreVector;
use crate::models::config::DiagnosticsConfig;

/// Scores after the normalized exponential.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbabilityDistribution(Vec<f32>);

/// Most likely class and its probability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Top1 {
    pub class_id: usize,
    pub probability: f32,
}

impl ProbabilityDistribution {
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn sum(&self) -> f64 {
        self.0.iter().map(|&p| p as f64).sum()
    }

    /// Most likely class. `None` only for an empty distribution.
    pub fn top1(&self) -> Option<Top1> {
        self.top_k(1).into_iter().next()
    }

    /// The `k` most likely classes, highest first. Ties keep index order.
    pub fn top_k(&self, k: usize) -> Vec<Top1> {
        let mut ranked: Vec<(usize, f32)> = self.0.iter().copied().enumerate().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked
            .into_iter()
            .take(k)
            .map(|(class_id, probability)| Top1 {
                class_id,
                probability,
            })
            .collect()
    }
}

/// Numerically stable softmax, accumulated in `f64`.
pub fn softmax(scores: &ScoreVector) -> ProbabilityDistribution {
    let values = scores.as_slice();
    if values.is_empty() {
        return ProbabilityDistribution(Vec::new());
    }

    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
    let exps: Vec<f64> = values.iter().map(|&v| (v as f64 - max).exp()).collect();
    let total: f64 = exps.iter().sum();

    ProbabilityDistribution(exps.into_iter().map(|e| (e / total) as f32).collect())
}

/// Divergence between the two backends for one logical input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DivergenceReport {
    /// `||scoreA - scoreB||₂`
    pub logit_l2_diff: f64,
    /// `||probA - probB||₂`
    pub probability_l2_diff: f64,
    /// Largest single-class logit difference.
    pub max_abs_logit_diff: f64,
    /// Whether both backends pick the same class.
    pub top1_agreement: bool,
    pub native: Top1,
    pub portable: Top1,
}

fn l2_diff(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = x as f64 - y as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

/// Compare the native (`a`) and portable (`b`) scores for the same input.
pub fn compare_scores(a: &ScoreVector, b: &ScoreVector) -> Result<DivergenceReport> {
    if a.len() != b.len() || a.is_empty() {
        return Err(TwinferError::ScoreLength {
            left: a.len(),
            right: b.len(),
        });
    }

    let prob_a = softmax(a);
    let prob_b = softmax(b);

    let max_abs_logit_diff = a
        .as_slice()
        .iter()
        .zip(b.as_slice())
        .map(|(&x, &y)| (x as f64 - y as f64).abs())
        .fold(0.0, f64::max);

    // Both vectors are non-empty, so top1 is always present.
    let native = prob_a.top1().ok_or(TwinferError::ScoreLength { left: 0, right: 0 })?;
    let portable = prob_b.top1().ok_or(TwinferError::ScoreLength { left: 0, right: 0 })?;

    Ok(DivergenceReport {
        logit_l2_diff: l2_diff(a.as_slice(), b.as_slice()),
        probability_l2_diff: l2_diff(prob_a.as_slice(), prob_b.as_slice()),
        max_abs_logit_diff,
        top1_agreement: native.class_id == portable.class_id,
        native,
        portable,
    })
}

/// Regression gate over a calibration set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParityGate {
    pub logit_l2_tolerance: f64,
    pub probability_l2_tolerance: f64,
}

/// Aggregate verdict of a [`ParityGate`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateOutcome {
    pub samples: usize,
    pub agreements: usize,
    pub max_logit_l2_diff: f64,
    pub max_probability_l2_diff: f64,
    pub passed: bool,
}

impl ParityGate {
    pub fn from_config(config: &DiagnosticsConfig) -> Self {
        Self {
            logit_l2_tolerance: config.logit_l2_tolerance,
            probability_l2_tolerance: config.probability_l2_tolerance,
        }
    }

    /// Whether a single report stays inside every tolerance.
    pub fn accepts(&self, report: &DivergenceReport) -> bool {
        report.top1_agreement
            && report.logit_l2_diff <= self.logit_l2_tolerance
            && report.probability_l2_diff <= self.probability_l2_tolerance
    }

    /// Evaluate every report. An empty set never passes.
    pub fn evaluate(&self, reports: &[DivergenceReport]) -> GateOutcome {
        let agreements = reports.iter().filter(|r| r.top1_agreement).count();
        let max_logit_l2_diff = reports.iter().map(|r| r.logit_l2_diff).fold(0.0, f64::max);
        let max_probability_l2_diff = reports
            .iter()
            .map(|r| r.probability_l2_diff)
            .fold(0.0, f64::max);

        GateOutcome {
            samples: reports.len(),
            agreements,
            max_logit_l2_diff,
            max_probability_l2_diff,
            passed: !reports.is_empty() && reports.iter().all(|r| self.accepts(r)),
        }
    }
}

impl Default for ParityGate {
    fn default() -> Self {
        Self::from_config(&DiagnosticsConfig::default())
    }
}
