use crate::error::{Result, WorkerError};
use rubato::{FftFixedIn, Resampler};
use rustfft::{num_complex::Complex32, num_traits::Zero, Fft, FftPlanner};
use std::sync::Arc;

/// Interleaved samples to stereo frames.
///
/// Mono is duplicated to both sides; with more than two channels only the
/// first two of every frame are kept.
pub fn to_stereo_frames(interleaved: &[f32], channels: u16) -> Vec<[f32; 2]> {
    match channels {
        0 => Vec::new(),
        1 => interleaved.iter().map(|&x| [x, x]).collect(),
        n => interleaved
            .chunks_exact(n as usize)
            .map(|frame| [frame[0], frame[1]])
            .collect(),
    }
}

pub fn split_channels(frames: &[[f32; 2]]) -> (Vec<f32>, Vec<f32>) {
    frames.iter().map(|f| (f[0], f[1])).unzip()
}

/// Sample-rate conversion of stereo frames.
///
/// The output holds exactly `ceil(len * to / from)` frames and is aligned
/// with the input: the resampler's own delay is dropped from the front.
pub fn resample_stereo(frames: &[[f32; 2]], from: u32, to: u32) -> Result<Vec<[f32; 2]>> {
    if from == to || frames.is_empty() {
        return Ok(frames.to_vec());
    }
    if from == 0 || to == 0 {
        return Err(WorkerError::Audio(format!("cannot resample {from} Hz -> {to} Hz")));
    }

    let rs_err = |e: &dyn std::fmt::Display| WorkerError::Audio(format!("resampler: {e}"));

    let mut resampler = FftFixedIn::<f32>::new(from as usize, to as usize, 1024, 2, 2)
        .map_err(|e| rs_err(&e))?;

    let (left, right) = split_channels(frames);
    let n = left.len();
    let expected = ((n as u64 * to as u64).div_ceil(from as u64)) as usize;
    let delay = resampler.output_delay();
    let wanted = delay + expected;

    let mut out_l = Vec::with_capacity(wanted + 2048);
    let mut out_r = Vec::with_capacity(wanted + 2048);

    let mut pos = 0;
    loop {
        let need = resampler.input_frames_next();
        if pos + need > n {
            break;
        }
        let chunk: [&[f32]; 2] = [&left[pos..pos + need], &right[pos..pos + need]];
        let block = resampler
            .process(&chunk[..], None)
            .map_err(|e| rs_err(&e))?;
        append(&mut out_l, &mut out_r, &block);
        pos += need;
    }
    if pos < n {
        let rest: [&[f32]; 2] = [&left[pos..], &right[pos..]];
        let block = resampler
            .process_partial(Some(&rest[..]), None)
            .map_err(|e| rs_err(&e))?;
        append(&mut out_l, &mut out_r, &block);
    }
    // Flush with silence until the delayed tail has come out.
    while out_l.len() < wanted {
        let tail = resampler
            .process_partial::<&[f32]>(None, None)
            .map_err(|e| rs_err(&e))?;
        if tail[0].is_empty() {
            break;
        }
        append(&mut out_l, &mut out_r, &tail);
    }

    out_l.resize(wanted, 0.0);
    out_r.resize(wanted, 0.0);
    Ok(out_l
        .into_iter()
        .zip(out_r)
        .skip(delay)
        .map(|(l, r)| [l, r])
        .collect())
}

fn append(out_l: &mut Vec<f32>, out_r: &mut Vec<f32>, block: &[Vec<f32>]) {
    out_l.extend_from_slice(&block[0]);
    out_r.extend_from_slice(&block[1]);
}

/// Periodic Hann window, as used by `torch.hann_window`.
pub fn hann_window(n: usize) -> Vec<f32> {
    if n <= 1 {
        return vec![1.0; n];
    }
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / n as f32).cos())
        .collect()
}

/// Forward STFT planned once for a fixed FFT size and hop.
pub struct Stft {
    n_fft: usize,
    hop: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
}

impl Stft {
    pub fn new(n_fft: usize, hop: usize) -> Self {
        let fft = FftPlanner::new().plan_fft_forward(n_fft);
        Self {
            n_fft,
            hop,
            fft,
            window: hann_window(n_fft),
        }
    }

    /// Number of (bins, frames) produced for a signal of `len` samples.
    pub fn dims(&self, len: usize) -> (usize, usize) {
        (self.n_fft / 2, 1 + len / self.hop)
    }

    /// Complex-as-channels spectrogram of a centered (zero padded) stereo
    /// signal, flattened as `[4, F, Frames]` with channel order
    /// L.re, L.im, R.re, R.im. The Nyquist bin is dropped.
    pub fn stereo_cac(&self, left: &[f32], right: &[f32]) -> Result<Vec<f32>> {
        if left.len() != right.len() {
            return Err(WorkerError::Audio("L/R length mismatch".into()));
        }
        let n_fft = self.n_fft;
        let pad = n_fft / 2;
        let (bins, frames) = self.dims(left.len());
        let plane = bins * frames;

        let padded = |sig: &[f32]| {
            let mut v = vec![0.0f32; pad + sig.len() + pad];
            v[pad..pad + sig.len()].copy_from_slice(sig);
            v
        };
        let (l_sig, r_sig) = (padded(left), padded(right));

        let mut out = vec![0.0f32; 4 * plane];
        let mut buf_l = vec![Complex32::zero(); n_fft];
        let mut buf_r = vec![Complex32::zero(); n_fft];

        for fr in 0..frames {
            let start = fr * self.hop;
            for (i, w) in self.window.iter().enumerate() {
                let idx = start + i;
                let (l, r) = if idx < l_sig.len() {
                    (l_sig[idx], r_sig[idx])
                } else {
                    (0.0, 0.0)
                };
                buf_l[i] = Complex32::new(l * w, 0.0);
                buf_r[i] = Complex32::new(r * w, 0.0);
            }

            self.fft.process(&mut buf_l);
            self.fft.process(&mut buf_r);

            for bin in 0..bins {
                let at = bin * frames + fr;
                out[at] = buf_l[bin].re;
                out[plane + at] = buf_l[bin].im;
                out[2 * plane + at] = buf_r[bin].re;
                out[3 * plane + at] = buf_r[bin].im;
            }
        }

        Ok(out)
    }
}
