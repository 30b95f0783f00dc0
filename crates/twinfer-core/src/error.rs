//! Error types for the twinfer-core library.

use std::path::PathBuf;

use thiserror::Error;

use crate::executor::BackendKind;

/// Main error type for the twinfer library.
#[derive(Error, Debug)]
pub enum TwinferError {
    /// The request itself was malformed. Recovered per request.
    #[error("input error: {0}")]
    Input(#[from] InputError),

    /// A backend could not be loaded. Fatal at startup.
    #[error("{backend} backend unavailable: {reason}")]
    BackendUnavailable { backend: BackendKind, reason: String },

    /// Inference error from the inference layer.
    #[error("inference error: {0}")]
    Inference(#[from] twinfer_inference::InferenceError),

    /// Artifact inspection or consolidation failed.
    #[error("portability error: {0}")]
    Portability(#[from] PortabilityError),

    /// A request arrived before warm-up completed.
    #[error("{0} backend is not ready")]
    NotReady(BackendKind),

    /// The request exceeded its deadline at the handling boundary.
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    /// Two score vectors of different length were compared.
    #[error("score vectors differ in length: {left} vs {right}")]
    ScoreLength { left: usize, right: usize },

    /// Image processing error.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Per-request input errors.
#[derive(Error, Debug)]
pub enum InputError {
    /// Image bytes could not be decoded.
    #[error("failed to decode image: {0}")]
    Decode(String),

    /// Image has no pixels.
    #[error("image is empty ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },

    /// Tensor does not have the model's input shape.
    #[error("invalid tensor shape: expected {expected:?}, got {actual:?}")]
    Shape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Raw pixel buffer length does not match its declared dimensions.
    #[error("pixel buffer of {len} bytes does not match {width}x{height} RGBA")]
    RawBuffer { len: usize, width: u32, height: u32 },
}

/// Errors raised by the offline artifact verifier.
#[derive(Error, Debug)]
pub enum PortabilityError {
    /// The file is not a well-formed protobuf message.
    #[error("malformed model file: {0}")]
    Malformed(String),

    /// The message parsed but carries no graph.
    #[error("model file has no graph")]
    MissingGraph,

    /// An initializer points at external data without a location.
    #[error("initializer '{0}' references external data without a location")]
    MissingLocation(String),

    /// An external data location escapes the model directory.
    #[error("external data location '{0}' must be relative to the model directory")]
    UnsafeLocation(String),

    /// The external data file does not exist.
    #[error("external data file not found: {}", .0.display())]
    ExternalFileMissing(PathBuf),

    /// Offset/length fall outside the external data file.
    #[error("initializer '{name}' reads {offset}..{end} past the end of {} ({size} bytes)", .path.display())]
    ExternalRange {
        name: String,
        path: PathBuf,
        offset: u64,
        end: u64,
        size: u64,
    },

    /// I/O error while reading or writing artifacts.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<prost::DecodeError> for PortabilityError {
    fn from(e: prost::DecodeError) -> Self {
        PortabilityError::Malformed(e.to_string())
    }
}

impl TwinferError {
    /// Whether the error belongs to the request rather than the backends.
    pub fn is_input_error(&self) -> bool {
        matches!(self, TwinferError::Input(_))
    }
}

/// Result type for the twinfer library.
pub type Result<T> = std::result::Result<T, TwinferError>;
