use ndarray::ArrayView4;
use ort::{
    execution_providers::{
        CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider,
        TensorRTExecutionProvider,
    },
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session,
    },
    value::TensorRef,
};
use tracing::debug;

use crate::{
    config::CutoutConfig,
    errors::{CutoutError, Result},
    traits::{InferenceSession, NamedOutput, SessionFactory},
    types::{BackendTag, ModelBytes},
};

/// ONNX Runtime session with its input/output names resolved up front.
pub struct OrtSession {
    session: Session,
    input_name: String,
    output_names: Vec<String>,
    fixed_input_size: Option<u32>,
}

impl OrtSession {
    pub fn new(session: Session) -> Result<Self> {
        let input = session.inputs.first().ok_or_else(|| {
            CutoutError::model(
                "model input lookup",
                std::io::Error::new(std::io::ErrorKind::InvalidData, "model declares no inputs"),
            )
        })?;
        let input_name = input.name.clone();
        let fixed_input_size = input
            .input_type
            .tensor_shape()
            .and_then(|shape| shape.get(2).copied())
            .filter(|side| *side > 0)
            .map(|side| side as u32);
        let output_names = session.outputs.iter().map(|o| o.name.clone()).collect();

        Ok(Self {
            session,
            input_name,
            output_names,
            fixed_input_size,
        })
    }
}

impl InferenceSession for OrtSession {
    fn fixed_input_size(&self) -> Option<u32> {
        self.fixed_input_size
    }

    fn run(&mut self, input: ArrayView4<f32>) -> Result<Vec<NamedOutput>> {
        let input = input.as_standard_layout();
        let tensor = TensorRef::from_array_view(&input)
            .map_err(|e| CutoutError::model("input tensor creation", e))?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => tensor])
            .map_err(|e| CutoutError::model("session run", e))?;

        let mut named = Vec::with_capacity(self.output_names.len());
        for name in &self.output_names {
            match outputs[name.as_str()].try_extract_array::<f32>() {
                Ok(array) => named.push(NamedOutput::new(name.clone(), array.to_owned())),
                // non-float outputs can't be a mask
                Err(e) => debug!(output = %name, error = %e, "skipping output"),
            }
        }
        Ok(named)
    }
}

/// Maps backend tags onto ONNX Runtime session configurations.
///
/// - hardware-accelerated: TensorRT (optional) then CUDA, CUDA must register
/// - vectorized-CPU: CPU provider, full graph optimization, `cpu_threads` intra-op threads
/// - baseline-CPU: default provider, no graph optimization, one thread
#[derive(Debug, Clone)]
pub struct OrtSessionFactory {
    allow_hardware_acceleration: bool,
    device_id: i32,
    cpu_threads: usize,
}

impl OrtSessionFactory {
    pub fn new(config: &CutoutConfig) -> Self {
        Self {
            allow_hardware_acceleration: config.allow_hardware_acceleration,
            device_id: config.device_id,
            cpu_threads: config.cpu_threads.max(1),
        }
    }

    fn configure(&self, builder: SessionBuilder, backend: BackendTag) -> Result<SessionBuilder> {
        let builder = match backend {
            BackendTag::HardwareAccelerated => builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_device_id(self.device_id)
                        .build(),
                    CUDAExecutionProvider::default()
                        .with_device_id(self.device_id)
                        .build()
                        .error_on_failure(),
                ])
                .map_err(|e| CutoutError::model("execution provider registration", e))?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .map_err(|e| CutoutError::model("optimization level", e))?
                .with_memory_pattern(true)
                .map_err(|e| CutoutError::model("memory pattern", e))?,
            BackendTag::VectorizedCpu => builder
                .with_execution_providers([CPUExecutionProvider::default()
                    .build()
                    .error_on_failure()])
                .map_err(|e| CutoutError::model("execution provider registration", e))?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .map_err(|e| CutoutError::model("optimization level", e))?
                .with_intra_threads(self.cpu_threads)
                .map_err(|e| CutoutError::model("intra-op threads", e))?,
            BackendTag::BaselineCpu => builder
                .with_optimization_level(GraphOptimizationLevel::Disable)
                .map_err(|e| CutoutError::model("optimization level", e))?
                .with_intra_threads(1)
                .map_err(|e| CutoutError::model("intra-op threads", e))?,
            BackendTag::Heuristic => return Err(no_session()),
        };
        Ok(builder)
    }
}

fn no_session() -> CutoutError {
    CutoutError::Unsupported {
        message: "the heuristic path has no model session".to_string(),
    }
}

impl SessionFactory for OrtSessionFactory {
    fn hardware_acceleration_supported(&self) -> Result<bool> {
        if !self.allow_hardware_acceleration {
            return Ok(false);
        }
        CUDAExecutionProvider::default()
            .is_available()
            .map_err(|e| CutoutError::model("hardware capability probe", e))
    }

    fn create(&self, model: &ModelBytes, backend: BackendTag) -> Result<Box<dyn InferenceSession>> {
        if backend == BackendTag::Heuristic {
            return Err(no_session());
        }
        let builder =
            Session::builder().map_err(|e| CutoutError::model("session builder", e))?;
        let session = self
            .configure(builder, backend)?
            .commit_from_memory(model.as_bytes())
            .map_err(|e| CutoutError::model(format!("model load ({})", model.key()), e))?;
        Ok(Box::new(OrtSession::new(session)?))
    }
}
