//! Offline artifact verifier.
//!
//! The portable runtime receives a model as one in-memory buffer and has no
//! filesystem, so any initializer stored in a side file is unreachable there.
//! [`inspect`] reports whether a model depends on side files and
//! [`consolidate`] folds them back into a single self-contained file.

#[cfg(feature = "fs")]
mod consolidate;
mod inspect;
mod proto;

#[cfg(feature = "fs")]
pub use consolidate::{
    ConsolidationOutcome, ExternalizeOutcome, consolidate, default_data_path, externalize,
};
pub use inspect::{
    ArtifactSummary, ExternalFile, ExternalRef, InitializerInfo, PortabilityReport, inspect,
};
