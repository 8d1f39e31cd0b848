//! On-device background removal.
//!
//! An [`Orchestrator`] owns one worker thread. The worker downloads and caches
//! a segmentation model, builds an inference session on the best backend the
//! host supports, and turns RGBA images into RGBA images whose alpha channel
//! separates the subject from the background. When the model path fails the
//! orchestrator falls back to a colour-distance heuristic and says so in the
//! returned [`MattingOutcome`].

pub mod cache;
pub mod config;
pub mod errors;
pub mod fetcher;
pub mod heuristic;
pub mod inference;
pub mod model;
pub mod orchestrator;
pub mod postprocess;
pub mod preprocess;
pub mod protocol;
pub mod refine;
pub mod session;
pub mod traits;
pub mod types;
pub mod worker;

pub mod mocks;

pub use cache::{FsBlobCache, InMemoryBlobCache};
pub use config::{ContrastCurve, CutoutConfig, HeuristicParams, ModelVariant, Normalization, RefineParams};
pub use errors::{CutoutError, Result};
pub use fetcher::{HttpTransport, ModelFetcher};
pub use model::{OrtSession, OrtSessionFactory};
pub use orchestrator::{MattingOutcome, Orchestrator};
pub use preprocess::LetterboxGeometry;
pub use traits::*;
pub use types::{BackendTag, Image, ModelBytes, ProgressEvent, Stage};
