use crate::{
    config::ExecutionProvider,
    core::dsp::Stft,
    error::{Result, WorkerError},
    model::model_manager::{ModelHandle, ModelManifest},
};

use ndarray::Array3;
use ort::{
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session,
    },
    value::{Tensor, Value},
};
use std::fmt::Display;

const DEMUCS_NFFT: usize = 4096;
const DEMUCS_HOP: usize = 1024;
/// Output holding the time-domain stems, `[1, S, 2, T]`.
const DEMUCS_OUTPUT: &str = "add_67";

/// A separation network that maps one fixed-size stereo window to stems.
pub trait StemModel: Send {
    fn sample_rate(&self) -> u32;

    /// Samples per inference window.
    fn window(&self) -> usize;

    /// Advance between consecutive windows, at most `window()`.
    fn hop(&self) -> usize;

    fn stems(&self) -> &[String];

    /// `left`/`right` hold exactly `window()` samples; returns `[S, 2, window]`.
    fn infer(&mut self, left: &[f32], right: &[f32]) -> Result<Array3<f32>>;
}

/// Hybrid Transformer Demucs exported to ONNX.
///
/// Takes the waveform (`input`, `[1, 2, T]`) and its complex-as-channels
/// spectrogram (`x`, `[1, 4, F, Frames]`).
pub struct OrtModel {
    session: Session,
    manifest: ModelManifest,
    stft: Stft,
}

impl OrtModel {
    pub fn load(handle: &ModelHandle, provider: ExecutionProvider) -> Result<Self> {
        let mf = &handle.manifest;
        if !(mf.window > 0 && mf.hop > 0 && mf.hop <= mf.window) {
            return Err(WorkerError::Model("Bad win/hop in manifest".into()));
        }
        if mf.stems.is_empty() {
            return Err(WorkerError::Model("manifest declares no stems".into()));
        }

        let builder = SessionBuilder::new()
            .map_err(model_err)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(model_err)?;
        let builder = with_provider(builder, provider)?;
        let session = builder
            .commit_from_file(&handle.local_path)
            .map_err(model_err)?;

        for name in ["input", "x"] {
            if !session.inputs.iter().any(|i| i.name == name) {
                return Err(WorkerError::Model(format!("Model missing input '{name}'")));
            }
        }

        tracing::info!(
            model = %mf.name,
            version = %mf.version,
            sample_rate = mf.sample_rate,
            window = mf.window,
            stems = ?mf.stems,
            ?provider,
            "model loaded"
        );

        Ok(Self {
            session,
            manifest: mf.clone(),
            stft: Stft::new(DEMUCS_NFFT, DEMUCS_HOP),
        })
    }
}

impl StemModel for OrtModel {
    fn sample_rate(&self) -> u32 {
        self.manifest.sample_rate
    }

    fn window(&self) -> usize {
        self.manifest.window
    }

    fn hop(&self) -> usize {
        self.manifest.hop
    }

    fn stems(&self) -> &[String] {
        &self.manifest.stems
    }

    fn infer(&mut self, left: &[f32], right: &[f32]) -> Result<Array3<f32>> {
        let t = left.len();
        if t != self.manifest.window || right.len() != t {
            return Err(WorkerError::separation(format!(
                "Bad window length {} (expected {})",
                t, self.manifest.window
            )));
        }
        let s = self.manifest.stems.len();

        let mut planar = Vec::with_capacity(2 * t);
        planar.extend_from_slice(left);
        planar.extend_from_slice(right);
        let time_value: Value = Tensor::from_array((vec![1, 2, t], planar))
            .map_err(inference_err)?
            .into_dyn();

        let (bins, frames) = self.stft.dims(t);
        let spec = self.stft.stereo_cac(left, right)?;
        let spec_value: Value = Tensor::from_array((vec![1, 4, bins, frames], spec))
            .map_err(inference_err)?
            .into_dyn();

        let outputs = self
            .session
            .run(vec![("input", time_value), ("x", spec_value)])
            .map_err(inference_err)?;

        let out_td = outputs
            .into_iter()
            .find_map(|(name, v)| if name == DEMUCS_OUTPUT { Some(v) } else { None })
            .ok_or_else(|| {
                WorkerError::separation(format!("Model did not return '{DEMUCS_OUTPUT}' output"))
            })?;

        let (_shape, data) = out_td.try_extract_tensor::<f32>().map_err(inference_err)?;
        if data.len() != s * 2 * t {
            return Err(WorkerError::separation(format!(
                "Unexpected {DEMUCS_OUTPUT} length {} (expected {})",
                data.len(),
                s * 2 * t
            )));
        }
        Array3::from_shape_vec((s, 2, t), data.to_vec())
            .map_err(|e| WorkerError::separation(e.to_string()))
    }
}

#[cfg(feature = "cuda")]
fn with_provider(builder: SessionBuilder, provider: ExecutionProvider) -> Result<SessionBuilder> {
    use ort::execution_providers::{CPUExecutionProvider, CUDAExecutionProvider};
    match provider {
        ExecutionProvider::Cuda => builder
            .with_execution_providers([
                CUDAExecutionProvider::default().build(),
                CPUExecutionProvider::default().build(),
            ])
            .map_err(model_err),
        ExecutionProvider::Cpu => Ok(builder),
    }
}

#[cfg(not(feature = "cuda"))]
fn with_provider(builder: SessionBuilder, provider: ExecutionProvider) -> Result<SessionBuilder> {
    if provider == ExecutionProvider::Cuda {
        tracing::warn!("built without the `cuda` feature, running on CPU");
    }
    Ok(builder)
}

fn model_err(e: impl Display) -> WorkerError {
    WorkerError::Model(e.to_string())
}

/// Runtime failures while a job is running. Allocation failures on the
/// device are reported separately so callers can tell them apart.
fn inference_err(e: impl Display) -> WorkerError {
    let msg = e.to_string();
    let lower = msg.to_ascii_lowercase();
    if lower.contains("out of memory")
        || lower.contains("failed to allocate")
        || lower.contains("bad_alloc")
    {
        WorkerError::ResourceExhausted(msg)
    } else {
        WorkerError::separation(format!("Separation failed: {msg}"))
    }
}
