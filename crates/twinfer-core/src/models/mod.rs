//! Data models for configuration and predictions.

pub mod config;
pub mod prediction;

pub use config::TwinferConfig;
pub use prediction::{PredictionResponse, PredictionResult};
