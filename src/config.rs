use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{CutoutError, Result};

/// Channel normalization applied after scaling bytes to [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Normalization {
    /// `v / 255`
    UnitRange,
    /// `(v / 255 - mean[c]) / std[c]`
    MeanStd { mean: [f32; 3], std: [f32; 3] },
}

impl Normalization {
    #[inline]
    pub fn apply(&self, channel: usize, value: u8) -> f32 {
        let v = f32::from(value) / 255.0;
        match self {
            Normalization::UnitRange => v,
            Normalization::MeanStd { mean, std } => (v - mean[channel]) / std[channel],
        }
    }
}

/// A model the pipeline can download, cache and run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVariant {
    /// Stable cache key, independent of where the bytes come from.
    pub key: String,
    /// Remote sources, tried in order.
    pub sources: Vec<String>,
    /// Side of the square network input.
    pub target_size: u32,
    pub normalization: Normalization,
    /// RGB fill for the letterbox margins.
    pub pad_color: [u8; 3],
    /// Output names probed first when looking for the mask tensor.
    pub output_candidates: Vec<String>,
}

impl ModelVariant {
    /// U²-Net (small), 320×320, plain [0, 1] scaling.
    pub fn u2netp() -> Self {
        Self {
            key: "u2netp".to_string(),
            sources: vec![
                "https://huggingface.co/jilijeanlouis/test-u2net/resolve/main/u2netp.onnx"
                    .to_string(),
                "https://github.com/danielgatis/rembg/releases/download/v0.0.0/u2netp.onnx"
                    .to_string(),
            ],
            target_size: 320,
            normalization: Normalization::UnitRange,
            pad_color: [255, 255, 255],
            output_candidates: vec!["d0".to_string(), "output".to_string(), "mask".to_string()],
        }
    }

    /// MODNet portrait matting, 256×256, mean/std 0.5.
    pub fn modnet() -> Self {
        Self {
            key: "modnet".to_string(),
            sources: vec![
                "https://huggingface.co/gradio/Modnet/resolve/main/modnet.onnx".to_string(),
            ],
            target_size: 256,
            normalization: Normalization::MeanStd {
                mean: [0.5; 3],
                std: [0.5; 3],
            },
            pad_color: [255, 255, 255],
            output_candidates: vec!["output".to_string(), "matte".to_string()],
        }
    }
}

/// Contrast curve applied to the normalized mask.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContrastCurve {
    /// Exponent in [1, 4]; larger values push mid-tones toward 0.
    pub exponent: f32,
    /// Values below this snap to 0.
    pub low: f32,
    /// Values above this snap to 1.
    pub high: f32,
}

impl Default for ContrastCurve {
    fn default() -> Self {
        Self {
            exponent: 1.5,
            low: 0.1,
            high: 0.9,
        }
    }
}

/// Radii for the open + feather refinement, each in [0, 8].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefineParams {
    pub morph_radius: u8,
    pub feather_radius: u8,
}

impl RefineParams {
    pub const MAX_RADIUS: u8 = 8;

    pub const fn new(morph_radius: u8, feather_radius: u8) -> Self {
        Self {
            morph_radius,
            feather_radius,
        }
    }
}

/// Cutoffs for the model-free matter.
///
/// Cutoffs are read off the sorted distance distribution at the given
/// quantiles, then shifted by the margins (in RGB distance units).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeuristicParams {
    pub low_quantile: f32,
    pub low_margin: f32,
    pub high_quantile: f32,
    pub high_margin: f32,
}

impl Default for HeuristicParams {
    fn default() -> Self {
        Self {
            low_quantile: 0.2,
            low_margin: 5.0,
            high_quantile: 0.6,
            high_margin: 20.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CutoutConfig {
    pub model: ModelVariant,
    pub cache_dir: PathBuf,
    pub download_timeout_secs: u64,
    pub allow_hardware_acceleration: bool,
    /// GPU ordinal for the hardware-accelerated backend.
    pub device_id: i32,
    /// Intra-op threads for the vectorized CPU backend.
    pub cpu_threads: usize,
    pub contrast: ContrastCurve,
    pub precise_refine: RefineParams,
    pub preview_refine: RefineParams,
    pub heuristic: HeuristicParams,
}

impl Default for CutoutConfig {
    fn default() -> Self {
        Self {
            model: ModelVariant::u2netp(),
            cache_dir: std::env::temp_dir().join("cutout-rs").join("models"),
            download_timeout_secs: 25,
            allow_hardware_acceleration: true,
            device_id: 0,
            cpu_threads: std::thread::available_parallelism()
                .map(|n| n.get().min(4))
                .unwrap_or(1),
            contrast: ContrastCurve::default(),
            precise_refine: RefineParams::new(2, 2),
            preview_refine: RefineParams::new(1, 2),
            heuristic: HeuristicParams::default(),
        }
    }
}

impl CutoutConfig {
    pub fn new(model: ModelVariant) -> Self {
        Self {
            model,
            ..Self::default()
        }
    }

    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = cache_dir.into();
        self
    }

    pub const fn with_download_timeout_secs(mut self, secs: u64) -> Self {
        self.download_timeout_secs = secs;
        self
    }

    pub const fn with_hardware_acceleration(mut self, allow: bool) -> Self {
        self.allow_hardware_acceleration = allow;
        self
    }

    pub const fn with_contrast(mut self, contrast: ContrastCurve) -> Self {
        self.contrast = contrast;
        self
    }

    pub const fn with_precise_refine(mut self, refine: RefineParams) -> Self {
        self.precise_refine = refine;
        self
    }

    pub const fn with_preview_refine(mut self, refine: RefineParams) -> Self {
        self.preview_refine = refine;
        self
    }

    pub const fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    /// Rejects parameters outside their documented ranges.
    pub fn validate(&self) -> Result<()> {
        let model = &self.model;
        if model.key.is_empty()
            || !model
                .key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(CutoutError::configuration(format!(
                "model key {:?} must be non-empty and use [A-Za-z0-9._-]",
                model.key
            )));
        }
        if model.target_size < 8 || model.target_size > 4096 {
            return Err(CutoutError::configuration(format!(
                "target_size {} outside [8, 4096]",
                model.target_size
            )));
        }
        if let Normalization::MeanStd { std, .. } = model.normalization {
            if std.iter().any(|s| !(*s > 0.0)) {
                return Err(CutoutError::configuration("normalization std must be > 0"));
            }
        }
        if self.cpu_threads == 0 {
            return Err(CutoutError::configuration("cpu_threads must be >= 1"));
        }
        if self.download_timeout_secs == 0 {
            return Err(CutoutError::configuration("download timeout must be > 0"));
        }

        let c = &self.contrast;
        if !(1.0..=4.0).contains(&c.exponent) {
            return Err(CutoutError::configuration(format!(
                "contrast exponent {} outside [1, 4]",
                c.exponent
            )));
        }
        if !(0.0..=1.0).contains(&c.low) || !(0.0..=1.0).contains(&c.high) || c.low >= c.high {
            return Err(CutoutError::configuration(format!(
                "contrast thresholds must satisfy 0 <= low < high <= 1 (got {} / {})",
                c.low, c.high
            )));
        }

        for (name, refine) in [
            ("precise_refine", &self.precise_refine),
            ("preview_refine", &self.preview_refine),
        ] {
            if refine.morph_radius > RefineParams::MAX_RADIUS
                || refine.feather_radius > RefineParams::MAX_RADIUS
            {
                return Err(CutoutError::configuration(format!(
                    "{name} radii must be <= {}",
                    RefineParams::MAX_RADIUS
                )));
            }
        }

        let h = &self.heuristic;
        if !(0.0..=1.0).contains(&h.low_quantile)
            || !(0.0..=1.0).contains(&h.high_quantile)
            || h.low_quantile > h.high_quantile
        {
            return Err(CutoutError::configuration(
                "heuristic quantiles must satisfy 0 <= low <= high <= 1",
            ));
        }
        if h.low_margin < 0.0 || h.high_margin < h.low_margin {
            return Err(CutoutError::configuration(
                "heuristic margins must satisfy 0 <= low_margin <= high_margin",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CutoutConfig::default().validate().is_ok());
        assert!(CutoutConfig::new(ModelVariant::modnet()).validate().is_ok());
    }

    #[test]
    fn test_rejects_out_of_range_contrast() {
        let config = CutoutConfig::default().with_contrast(ContrastCurve {
            exponent: 0.5,
            ..ContrastCurve::default()
        });
        assert!(matches!(
            config.validate(),
            Err(CutoutError::Configuration { .. })
        ));

        let config = CutoutConfig::default().with_contrast(ContrastCurve {
            exponent: 2.0,
            low: 0.8,
            high: 0.2,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_large_radii_and_bad_keys() {
        let config = CutoutConfig::default().with_precise_refine(RefineParams::new(9, 1));
        assert!(config.validate().is_err());

        let mut config = CutoutConfig::default();
        config.model.key = "../escape".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_normalization() {
        assert_eq!(Normalization::UnitRange.apply(0, 255), 1.0);
        let norm = Normalization::MeanStd {
            mean: [0.5; 3],
            std: [0.5; 3],
        };
        assert_eq!(norm.apply(1, 0), -1.0);
        assert_eq!(norm.apply(2, 255), 1.0);
    }
}
