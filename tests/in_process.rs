use approx::assert_abs_diff_eq;
use ndarray::Array3;
use std::{
    fs,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};
use stem_worker::{
    read_audio, write_audio, AudioData, InProcessSeparator, Result, Separator, StemModel,
    WorkerError,
};
use tempfile::tempdir;

/// Returns its input, scaled per stem, for every stem.
struct EchoModel {
    stems: Vec<String>,
    window: usize,
    hop: usize,
    calls: Arc<AtomicUsize>,
    delay: Duration,
    gains: Vec<f32>,
}

impl EchoModel {
    fn new(window: usize, hop: usize) -> Self {
        Self {
            stems: ["vocals", "drums", "bass", "other"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            window,
            hop,
            calls: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
            gains: vec![1.0, 0.5, 0.25, 0.0],
        }
    }
}

impl StemModel for EchoModel {
    fn sample_rate(&self) -> u32 {
        44_100
    }

    fn window(&self) -> usize {
        self.window
    }

    fn hop(&self) -> usize {
        self.hop
    }

    fn stems(&self) -> &[String] {
        &self.stems
    }

    fn infer(&mut self, left: &[f32], right: &[f32]) -> Result<Array3<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let t = left.len();
        let mut out = Array3::<f32>::zeros((self.stems.len(), 2, t));
        for (s, g) in self.gains.iter().enumerate() {
            for i in 0..t {
                out[(s, 0, i)] = left[i] * g;
                out[(s, 1, i)] = right[i] * g;
            }
        }
        Ok(out)
    }
}

fn write_input(path: &std::path::Path, sample_rate: u32, channels: u16, frames: usize) -> Vec<f32> {
    let mut samples = Vec::with_capacity(frames * channels as usize);
    for i in 0..frames {
        let t = i as f32 / sample_rate as f32;
        samples.push((2.0 * std::f32::consts::PI * 220.0 * t).sin() * 0.4);
        if channels == 2 {
            samples.push((2.0 * std::f32::consts::PI * 330.0 * t).cos() * 0.3);
        }
    }
    let audio = AudioData {
        samples,
        sample_rate,
        channels,
    };
    write_audio(path, &audio).unwrap();
    audio.samples
}

#[test]
fn writes_one_wav_per_stem_in_demucs_layout() {
    let tmp = tempdir().unwrap();
    let input = tmp.path().join("input.wav");
    let original = write_input(&input, 44_100, 2, 20_000);
    let out_dir = tmp.path().join("separated");

    let model = EchoModel::new(4096, 2048);
    let calls = model.calls.clone();
    let sep = InProcessSeparator::new(Box::new(model), "htdemucs", Duration::from_secs(60)).unwrap();

    let stems = sep.separate(&input, &out_dir, None).unwrap();
    assert_eq!(stems.len(), 4);
    assert!(calls.load(Ordering::SeqCst) > 1, "audio longer than one window");

    let vocals = &stems["vocals"];
    assert_eq!(vocals, &out_dir.join("htdemucs").join("input").join("vocals.wav"));

    let back = read_audio(vocals).unwrap();
    assert_eq!(back.channels, 2);
    assert_eq!(back.sample_rate, 44_100);
    assert_eq!(back.samples.len(), original.len());

    // Overlap-add of an identity model reproduces the input.
    for i in (0..original.len()).step_by(101) {
        assert_abs_diff_eq!(back.samples[i], original[i], epsilon = 2e-3);
    }

    let other = read_audio(&stems["other"]).unwrap();
    assert!(other.samples.iter().all(|s| s.abs() < 1e-3));
}

#[test]
fn mono_input_at_other_rate_is_converted() {
    let tmp = tempdir().unwrap();
    let input = tmp.path().join("input.wav");
    write_input(&input, 22_050, 1, 11_025);
    let out_dir = tmp.path().join("separated");

    let sep = InProcessSeparator::new(
        Box::new(EchoModel::new(4096, 4096)),
        "htdemucs",
        Duration::from_secs(60),
    )
    .unwrap();
    let stems = sep.separate(&input, &out_dir, Some("htdemucs")).unwrap();

    let r = hound::WavReader::open(&stems["drums"]).unwrap();
    assert_eq!(r.spec().channels, 2);
    assert_eq!(r.spec().sample_rate, 44_100);
    assert_eq!(r.duration(), 22_050);
}

#[test]
fn only_the_resident_model_is_accepted() {
    let sep = InProcessSeparator::new(
        Box::new(EchoModel::new(1024, 512)),
        "htdemucs",
        Duration::from_secs(60),
    )
    .unwrap();
    assert!(sep.accepts_model("htdemucs"));
    assert!(!sep.accepts_model("htdemucs_ft"));
    assert_eq!(sep.default_model(), "htdemucs");
    assert_eq!(sep.name(), "in-process");

    let tmp = tempdir().unwrap();
    let input = tmp.path().join("input.wav");
    write_input(&input, 44_100, 2, 1000);
    let err = sep
        .separate(&input, tmp.path(), Some("mdx_extra"))
        .unwrap_err();
    assert!(err.is_validation());
    // Rejected before anything was written.
    assert!(!tmp.path().join("htdemucs").exists());
}

#[test]
fn long_inference_hits_the_time_limit() {
    let tmp = tempdir().unwrap();
    let input = tmp.path().join("input.wav");
    write_input(&input, 44_100, 2, 44_100);

    let mut model = EchoModel::new(2048, 1024);
    model.delay = Duration::from_millis(40);
    let sep = InProcessSeparator::new(Box::new(model), "htdemucs", Duration::from_millis(20)).unwrap();

    let err = sep.separate(&input, &tmp.path().join("out"), None).unwrap_err();
    assert!(matches!(err, WorkerError::SeparationTimeout(_)));
}

#[test]
fn concurrent_jobs_share_one_model() {
    let tmp = tempdir().unwrap();
    let model = EchoModel::new(4096, 2048);
    let calls = model.calls.clone();
    let sep = Arc::new(
        InProcessSeparator::new(Box::new(model), "htdemucs", Duration::from_secs(60)).unwrap(),
    );

    let handles: Vec<_> = (0..3)
        .map(|i| {
            let sep = sep.clone();
            let job_dir = tmp.path().join(format!("job{i}"));
            fs::create_dir_all(&job_dir).unwrap();
            let input = job_dir.join("input.wav");
            write_input(&input, 44_100, 2, 8000);
            thread::spawn(move || sep.separate(&input, &job_dir.join("separated"), None))
        })
        .collect();

    for h in handles {
        let stems = h.join().unwrap().unwrap();
        assert_eq!(stems.len(), 4);
    }
    assert!(calls.load(Ordering::SeqCst) >= 3);
}

#[test]
fn rejects_inconsistent_window_settings() {
    let bad = EchoModel::new(1024, 2048);
    assert!(InProcessSeparator::new(Box::new(bad), "htdemucs", Duration::from_secs(1)).is_err());
}
