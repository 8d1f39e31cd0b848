use std::path::PathBuf;
use thiserror::Error;

/// Boxed error source that can cross the worker thread boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Structured error types for the matting pipeline.
///
/// Variants are grouped by where they originate: model acquisition, backend
/// construction, inference at run time, and the caller-facing plumbing around
/// the worker. Acquisition and backend errors are retried across candidate
/// lists before one of them is surfaced.
#[derive(Error, Debug)]
pub enum CutoutError {
    #[error("model_not_found: no candidate source for {key:?} could be fetched ({attempts} attempted)")]
    ModelNotFound { key: String, attempts: usize },

    #[error("Download error: {url} failed: {reason}")]
    Download { url: String, reason: String },

    #[error("unsupported: {message}")]
    Unsupported { message: String },

    #[error("session_not_ready")]
    SessionNotReady,

    #[error("Model error: no output with {expected} elements")]
    MaskOutputMissing { expected: usize },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Cache error: {operation} failed for {path:?}")]
    Cache {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid image: {width}x{height} with {len} bytes (expected width*height*4, both sides >= 1)")]
    InvalidImage { width: u32, height: u32, len: usize },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Initialization failed: {message}")]
    Initialization { message: String },

    #[error("Worker unavailable: {operation}")]
    WorkerUnavailable { operation: String },

    #[error("Job {job_id} failed: {message}")]
    Job { job_id: u64, message: String },
}

pub type Result<T> = std::result::Result<T, CutoutError>;

impl CutoutError {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub(crate) fn model(operation: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Model {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub(crate) fn worker_unavailable(operation: impl Into<String>) -> Self {
        Self::WorkerUnavailable {
            operation: operation.into(),
        }
    }
}

/// Convert I/O errors to cache errors.
///
/// Code that knows the path and operation constructs `CutoutError::Cache`
/// directly; this is the fallback for the rest.
impl From<std::io::Error> for CutoutError {
    fn from(err: std::io::Error) -> Self {
        Self::Cache {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

/// Convert ONNX Runtime errors to model errors.
impl From<ort::Error> for CutoutError {
    fn from(err: ort::Error) -> Self {
        Self::model("ort operation", err)
    }
}

/// Shape errors come out of tensor reshaping during inference, so they are
/// reported as model errors.
impl From<ndarray::ShapeError> for CutoutError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::model("tensor shape conversion", err)
    }
}

impl From<image::ImageError> for CutoutError {
    fn from(err: image::ImageError) -> Self {
        Self::model("image processing", err)
    }
}
