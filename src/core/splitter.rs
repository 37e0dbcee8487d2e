use crate::{
    config::WorkerConfig,
    core::{
        audio::{read_audio, write_audio},
        dsp::{resample_stereo, split_channels, to_stereo_frames},
        engine::{OrtModel, StemModel},
        layout::DemucsLayout,
        separator::Separator,
    },
    error::{Result, WorkerError},
    model::model_manager::ensure_model,
    types::{AudioData, StemPaths},
};

use reqwest::blocking::Client;
use std::{
    fs,
    path::Path,
    sync::Mutex,
    time::{Duration, Instant},
};

/// Separates with a model held in memory for the lifetime of the worker.
///
/// Jobs share the model but run inference one at a time.
pub struct InProcessSeparator {
    model: Mutex<Box<dyn StemModel>>,
    model_name: String,
    aliases: Vec<String>,
    stems: Vec<String>,
    sample_rate: u32,
    timeout: Duration,
}

impl InProcessSeparator {
    pub fn new(model: Box<dyn StemModel>, model_name: &str, timeout: Duration) -> Result<Self> {
        let (win, hop) = (model.window(), model.hop());
        if !(win > 0 && hop > 0 && hop <= win) {
            return Err(WorkerError::Model(format!("bad window/hop {win}/{hop}")));
        }
        if model.sample_rate() == 0 {
            return Err(WorkerError::Model("model sample rate is zero".into()));
        }
        Ok(Self {
            stems: model.stems().iter().map(|s| s.to_ascii_lowercase()).collect(),
            sample_rate: model.sample_rate(),
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            aliases: vec![model_name.to_string()],
            timeout,
        })
    }

    /// Resolves, downloads and loads the ONNX model named by `config`.
    /// Called once at startup.
    pub fn from_config(config: &WorkerConfig, client: &Client) -> Result<Self> {
        let handle = ensure_model(
            client,
            &config.default_model,
            config.manifest_url.as_deref(),
        )?;
        let manifest_name = handle.manifest.name.clone();
        let model = OrtModel::load(&handle, config.execution_provider)?;

        let mut sep = Self::new(
            Box::new(model),
            &config.default_model,
            config.separation_timeout,
        )?;
        if manifest_name != sep.model_name {
            sep.aliases.push(manifest_name);
        }
        Ok(sep)
    }

    fn run_windows(
        &self,
        model: &mut dyn StemModel,
        left: &[f32],
        right: &[f32],
        started: Instant,
    ) -> Result<Vec<Vec<[f32; 2]>>> {
        let n = left.len();
        let win = model.window();
        let hop = model.hop();
        let stem_count = self.stems.len();

        // Triangular cross-fade between overlapping windows.
        let weights: Vec<f32> = (0..win)
            .map(|i| (i + 1).min(win - i) as f32)
            .collect();

        let mut acc = vec![vec![[0f32; 2]; n]; stem_count];
        let mut weight_sum = vec![0f32; n];

        let mut left_win = vec![0f32; win];
        let mut right_win = vec![0f32; win];

        let total_windows = if n <= win { 1 } else { (n - win).div_ceil(hop) + 1 };
        let mut pos = 0usize;
        let mut done = 0usize;

        while pos < n {
            if started.elapsed() > self.timeout {
                return Err(WorkerError::SeparationTimeout(self.timeout));
            }

            let len = win.min(n - pos);
            left_win[..len].copy_from_slice(&left[pos..pos + len]);
            right_win[..len].copy_from_slice(&right[pos..pos + len]);
            left_win[len..].fill(0.0);
            right_win[len..].fill(0.0);

            let out = model.infer(&left_win, &right_win)?;
            let shape = out.shape();
            if shape[0] < stem_count || shape[1] != 2 || shape[2] < len {
                return Err(WorkerError::separation(format!(
                    "Separation failed: model returned shape {shape:?}"
                )));
            }

            for i in 0..len {
                let w = weights[i];
                weight_sum[pos + i] += w;
                for (st, stem) in acc.iter_mut().enumerate() {
                    stem[pos + i][0] += out[(st, 0, i)] * w;
                    stem[pos + i][1] += out[(st, 1, i)] * w;
                }
            }

            done += 1;
            tracing::debug!(window = done, total = total_windows, "inference window done");

            if pos + win >= n {
                break;
            }
            pos += hop;
        }

        for stem in acc.iter_mut() {
            for (frame, &w) in stem.iter_mut().zip(&weight_sum) {
                if w > 0.0 {
                    frame[0] /= w;
                    frame[1] /= w;
                }
            }
        }
        Ok(acc)
    }
}

impl Separator for InProcessSeparator {
    fn separate(&self, input: &Path, output_dir: &Path, model: Option<&str>) -> Result<StemPaths> {
        if let Some(requested) = model {
            if !self.accepts_model(requested) {
                return Err(WorkerError::validation(format!(
                    "model `{requested}` is not loaded (resident model: {})",
                    self.model_name
                )));
            }
        }
        let started = Instant::now();

        let audio = read_audio(input)?;
        let frames = to_stereo_frames(&audio.samples, audio.channels);
        if frames.is_empty() {
            return Err(WorkerError::separation("Separation failed: empty audio"));
        }
        let frames = resample_stereo(&frames, audio.sample_rate, self.sample_rate)?;
        let (left, right) = split_channels(&frames);

        tracing::info!(
            frames = left.len(),
            source_rate = audio.sample_rate,
            source_channels = audio.channels,
            "running in-process separation"
        );

        let stems = {
            let mut guard = self
                .model
                .lock()
                .map_err(|_| WorkerError::separation("Separation failed: model lock poisoned"))?;
            self.run_windows(&mut **guard, &left, &right, started)?
        };

        let layout = DemucsLayout::new(output_dir, &self.model_name, input);
        fs::create_dir_all(layout.stems_dir())?;

        for (name, data) in self.stems.iter().zip(stems) {
            let audio = AudioData {
                samples: data.into_iter().flatten().collect(),
                sample_rate: self.sample_rate,
                channels: 2,
            };
            write_audio(layout.stem_path(name, "wav"), &audio)?;
        }

        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "in-process separation finished"
        );
        layout.collect()
    }

    fn accepts_model(&self, model: &str) -> bool {
        self.aliases.iter().any(|a| a == model)
    }

    fn default_model(&self) -> &str {
        &self.model_name
    }

    fn name(&self) -> &'static str {
        "in-process"
    }
}
