use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ndarray::prelude::*;
use parking_lot::Mutex;

use crate::errors::{CutoutError, Result};
use crate::traits::{InferenceSession, ModelTransport, NamedOutput, SessionFactory};
use crate::types::{BackendTag, ModelBytes};

/// What a [`MockSession`] output contains.
#[derive(Debug, Clone, PartialEq)]
pub enum MockOutput {
    /// `(1, 1, H, W)` mask, `1 - mean(channels)`: dark input reads as foreground.
    Darkness(String),
    /// Flat tensor of the given length, never a valid mask.
    Flat(String, usize),
}

impl MockOutput {
    fn name(&self) -> &str {
        match self {
            MockOutput::Darkness(name) | MockOutput::Flat(name, _) => name,
        }
    }

    fn render(&self, input: &ArrayView4<f32>) -> ArrayD<f32> {
        let (h, w) = (input.shape()[2], input.shape()[3]);
        match self {
            MockOutput::Darkness(_) => {
                let mean = input
                    .index_axis(Axis(0), 0)
                    .mean_axis(Axis(0))
                    .unwrap_or_else(|| Array2::zeros((h, w)));
                mean.mapv(|v| (1.0 - v).clamp(0.0, 1.0))
                    .into_shape_with_order((1, 1, h, w))
                    .map(|a| a.into_dyn())
                    .unwrap_or_else(|_| ArrayD::zeros(IxDyn(&[1, 1, h, w])))
            }
            MockOutput::Flat(_, len) => ArrayD::zeros(IxDyn(&[*len])),
        }
    }
}

/// Session that computes its outputs from the input tensor, without a model.
///
/// A session with a fixed input size rejects tensors of any other size, as
/// a real runtime would.
#[derive(Debug, Clone)]
pub struct MockSession {
    outputs: Vec<MockOutput>,
    fixed_input_size: Option<u32>,
    fail_runs: bool,
    inputs: Arc<Mutex<Vec<[usize; 2]>>>,
}

impl MockSession {
    pub fn new(outputs: Vec<MockOutput>) -> Self {
        Self {
            outputs,
            fixed_input_size: None,
            fail_runs: false,
            inputs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn runs(&self) -> usize {
        self.inputs.lock().len()
    }
}

impl InferenceSession for MockSession {
    fn fixed_input_size(&self) -> Option<u32> {
        self.fixed_input_size
    }

    fn run(&mut self, input: ArrayView4<f32>) -> Result<Vec<NamedOutput>> {
        let (h, w) = (input.shape()[2], input.shape()[3]);
        self.inputs.lock().push([h, w]);
        if let Some(side) = self.fixed_input_size.map(|side| side as usize) {
            if (h, w) != (side, side) {
                return Err(CutoutError::model(
                    "session run",
                    std::io::Error::other(format!("expected {side}x{side} input, got {h}x{w}")),
                ));
            }
        }
        if self.fail_runs {
            return Err(CutoutError::model(
                "session run",
                std::io::Error::other("mock runtime fault"),
            ));
        }
        Ok(self
            .outputs
            .iter()
            .map(|output| NamedOutput::new(output.name(), output.render(&input)))
            .collect())
    }
}

/// Whether the mock host reports hardware acceleration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareProbe {
    Supported,
    Unsupported,
    Fails,
}

/// Factory handing out [`MockSession`]s and recording every build attempt.
///
/// Clones share the attempt log, so a test can keep one clone while the
/// worker owns another.
#[derive(Debug, Clone)]
pub struct MockSessionFactory {
    outputs: Vec<MockOutput>,
    hardware: HardwareProbe,
    failing_builds: HashSet<BackendTag>,
    failing_runs: HashSet<BackendTag>,
    fixed_input_size: Option<u32>,
    attempts: Arc<Mutex<Vec<BackendTag>>>,
    inputs: Arc<Mutex<Vec<[usize; 2]>>>,
}

impl Default for MockSessionFactory {
    fn default() -> Self {
        Self::new(vec![MockOutput::Darkness("d0".to_string())])
    }
}

impl MockSessionFactory {
    pub fn new(outputs: Vec<MockOutput>) -> Self {
        Self {
            outputs,
            hardware: HardwareProbe::Unsupported,
            failing_builds: HashSet::new(),
            failing_runs: HashSet::new(),
            fixed_input_size: None,
            attempts: Arc::new(Mutex::new(Vec::new())),
            inputs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub const fn with_hardware(mut self, probe: HardwareProbe) -> Self {
        self.hardware = probe;
        self
    }

    /// `create` fails for this backend.
    pub fn failing_build(mut self, backend: BackendTag) -> Self {
        self.failing_builds.insert(backend);
        self
    }

    /// `create` succeeds for this backend but every run fails.
    pub fn failing_run(mut self, backend: BackendTag) -> Self {
        self.failing_runs.insert(backend);
        self
    }

    /// Sessions report, and insist on, this spatial input size.
    pub const fn with_fixed_input_size(mut self, size: u32) -> Self {
        self.fixed_input_size = Some(size);
        self
    }

    pub fn attempts(&self) -> Vec<BackendTag> {
        self.attempts.lock().clone()
    }

    /// `[height, width]` of every tensor run by any session this factory built.
    pub fn input_sizes(&self) -> Vec<[usize; 2]> {
        self.inputs.lock().clone()
    }
}

impl SessionFactory for MockSessionFactory {
    fn hardware_acceleration_supported(&self) -> Result<bool> {
        match self.hardware {
            HardwareProbe::Supported => Ok(true),
            HardwareProbe::Unsupported => Ok(false),
            HardwareProbe::Fails => Err(CutoutError::model(
                "hardware capability probe",
                std::io::Error::other("mock probe fault"),
            )),
        }
    }

    fn create(&self, model: &ModelBytes, backend: BackendTag) -> Result<Box<dyn InferenceSession>> {
        self.attempts.lock().push(backend);
        if backend == BackendTag::Heuristic || self.failing_builds.contains(&backend) {
            return Err(CutoutError::model(
                format!("model load ({})", model.key()),
                std::io::Error::other(format!("mock {backend} build failure")),
            ));
        }
        let session = MockSession {
            outputs: self.outputs.clone(),
            fixed_input_size: self.fixed_input_size,
            fail_runs: self.failing_runs.contains(&backend),
            inputs: Arc::clone(&self.inputs),
        };
        Ok(Box::new(session))
    }
}

/// How a [`MockTransport`] source answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceBehavior {
    Fail,
    /// Never completes; only a timeout or cancellation ends it.
    Hang,
    /// Delivers the bytes in ten chunks with a known total.
    Serve(Vec<u8>),
    /// Like `Serve`, sleeping before each chunk.
    ServeSlowly(Vec<u8>, Duration),
    /// Announces the full length, delivers the first `n` bytes, then fails.
    FailAfter(Vec<u8>, usize),
}

/// Transport over an in-memory URL table. Unknown URLs fail.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    sources: HashMap<String, SourceBehavior>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, url: impl Into<String>, behavior: SourceBehavior) -> Self {
        self.sources.insert(url.into(), behavior);
        self
    }

    /// URLs requested so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    async fn serve(
        bytes: &[u8],
        delay: Option<Duration>,
        on_chunk: &mut (dyn FnMut(u64, Option<u64>) + Send),
    ) -> Vec<u8> {
        let total = bytes.len() as u64;
        let chunk_len = bytes.len().div_ceil(10).max(1);
        let mut buf = Vec::with_capacity(bytes.len());
        for chunk in bytes.chunks(chunk_len) {
            match delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => tokio::task::yield_now().await,
            }
            buf.extend_from_slice(chunk);
            on_chunk(buf.len() as u64, Some(total));
        }
        buf
    }
}

#[async_trait]
impl ModelTransport for MockTransport {
    async fn fetch(
        &self,
        url: &str,
        on_chunk: &mut (dyn FnMut(u64, Option<u64>) + Send),
    ) -> Result<Vec<u8>> {
        self.calls.lock().push(url.to_string());
        let behavior = self.sources.get(url).cloned().unwrap_or(SourceBehavior::Fail);
        match behavior {
            SourceBehavior::Fail => Err(CutoutError::Download {
                url: url.to_string(),
                reason: "http_404".to_string(),
            }),
            SourceBehavior::Hang => std::future::pending().await,
            SourceBehavior::Serve(bytes) => Ok(Self::serve(&bytes, None, on_chunk).await),
            SourceBehavior::ServeSlowly(bytes, delay) => {
                Ok(Self::serve(&bytes, Some(delay), on_chunk).await)
            }
            SourceBehavior::FailAfter(bytes, n) => {
                tokio::task::yield_now().await;
                on_chunk(n.min(bytes.len()) as u64, Some(bytes.len() as u64));
                Err(CutoutError::Download {
                    url: url.to_string(),
                    reason: "connection reset".to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_darkness_output_follows_input() -> Result<()> {
        let mut session = MockSession::new(vec![MockOutput::Darkness("d0".to_string())]);
        let mut input = Array4::<f32>::ones((1, 3, 4, 4));
        input.slice_mut(s![0, .., 1, 1]).fill(0.0);

        let outputs = session.run(input.view())?;
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].data.shape(), &[1, 1, 4, 4]);
        assert_eq!(outputs[0].data[[0, 0, 1, 1]], 1.0);
        assert_eq!(outputs[0].data[[0, 0, 0, 0]], 0.0);
        assert_eq!(session.runs(), 1);
        Ok(())
    }

    #[test]
    fn test_fixed_size_session_rejects_other_sizes() -> Result<()> {
        let factory = MockSessionFactory::default().with_fixed_input_size(8);
        let observer = factory.clone();
        let mut session = factory.create(&ModelBytes::new("m", vec![1]), BackendTag::BaselineCpu)?;

        assert_eq!(session.fixed_input_size(), Some(8));
        assert!(session.run(Array4::<f32>::zeros((1, 3, 8, 8)).view()).is_ok());
        assert!(session.run(Array4::<f32>::zeros((1, 3, 16, 16)).view()).is_err());
        assert_eq!(observer.input_sizes(), vec![[8, 8], [16, 16]]);
        Ok(())
    }

    #[test]
    fn test_factory_records_attempts() {
        let factory = MockSessionFactory::default().failing_build(BackendTag::VectorizedCpu);
        let observer = factory.clone();
        let bytes = ModelBytes::new("m", vec![1]);

        assert!(factory.create(&bytes, BackendTag::VectorizedCpu).is_err());
        assert!(factory.create(&bytes, BackendTag::BaselineCpu).is_ok());
        assert_eq!(
            observer.attempts(),
            vec![BackendTag::VectorizedCpu, BackendTag::BaselineCpu]
        );
    }

    #[tokio::test]
    async fn test_transport_serves_in_chunks() -> Result<()> {
        let transport = MockTransport::new().with_source("a", SourceBehavior::Serve(vec![1; 25]));
        let mut seen = Vec::new();
        let bytes = transport
            .fetch("a", &mut |received, total| seen.push((received, total)))
            .await?;
        assert_eq!(bytes.len(), 25);
        assert_eq!(seen.last(), Some(&(25, Some(25))));
        assert!(transport.fetch("missing", &mut |_, _| {}).await.is_err());
        assert_eq!(transport.calls(), vec!["a".to_string(), "missing".to_string()]);
        Ok(())
    }
}
