use async_trait::async_trait;
use ndarray::{ArrayD, ArrayView4};

use crate::errors::Result;
use crate::types::{BackendTag, ModelBytes};

/// One named tensor produced by a forward pass.
#[derive(Debug, Clone)]
pub struct NamedOutput {
    pub name: String,
    pub data: ArrayD<f32>,
}

impl NamedOutput {
    pub fn new(name: impl Into<String>, data: ArrayD<f32>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A runnable model bound to one set of bytes and one backend.
///
/// Owned by the worker thread only, hence `Send` but not `Sync`.
pub trait InferenceSession: Send {
    /// Spatial input size when the model fixes it, `None` for dynamic axes.
    fn fixed_input_size(&self) -> Option<u32>;

    /// Runs one forward pass over an NCHW tensor and returns every output in
    /// declaration order.
    fn run(&mut self, input: ArrayView4<f32>) -> Result<Vec<NamedOutput>>;
}

/// Builds sessions for a given execution backend.
pub trait SessionFactory: Send {
    /// Whether the host can run the hardware-accelerated backend at all.
    /// An `Err` counts as "no".
    fn hardware_acceleration_supported(&self) -> Result<bool>;

    fn create(&self, model: &ModelBytes, backend: BackendTag) -> Result<Box<dyn InferenceSession>>;
}

/// Key/value store for model blobs that outlives the process.
pub trait BlobCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Stores a complete blob. Keys are written at most once; putting an
    /// existing key leaves the stored bytes untouched.
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;
}

/// Streams one remote source into memory.
#[async_trait]
pub trait ModelTransport: Send + Sync {
    /// `on_chunk` receives `(received_bytes, total_bytes)` after every chunk.
    async fn fetch(
        &self,
        url: &str,
        on_chunk: &mut (dyn FnMut(u64, Option<u64>) + Send),
    ) -> Result<Vec<u8>>;
}
