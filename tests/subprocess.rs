#![cfg(unix)]

use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use stem_worker::{
    config::{OutputFormat, SubprocessConfig},
    Separator, SubprocessSeparator, WorkerError,
};
use tempfile::{tempdir, TempDir};

/// Mimics `demucs.separate`: writes every stem under `<out>/<model>/<track>/`.
const FAKE_DEMUCS: &str = r#"
model=""; out=""; input=""; ext=wav
while [ $# -gt 0 ]; do
  case "$1" in
    -n) model="$2"; shift 2;;
    -o) out="$2"; shift 2;;
    --mp3) ext=mp3; shift;;
    *) input="$1"; shift;;
  esac
done
name=$(basename "$input"); name="${name%.*}"
dir="$out/$model/$name"
mkdir -p "$dir"
for s in vocals drums bass other; do printf 'x' > "$dir/$s.$ext"; done
echo "separated $name with $model"
"#;

struct Fixture {
    tmp: TempDir,
    input: PathBuf,
    output: PathBuf,
}

fn fixture() -> Fixture {
    let tmp = tempdir().unwrap();
    let input = tmp.path().join("input.mp3");
    fs::write(&input, b"not really audio").unwrap();
    let output = tmp.path().join("separated");
    fs::create_dir_all(&output).unwrap();
    Fixture { tmp, input, output }
}

fn separator(dir: &Path, script: &str, format: OutputFormat, timeout: Duration) -> SubprocessSeparator {
    let path = dir.join("fake-demucs.sh");
    fs::write(&path, script).unwrap();
    let config = SubprocessConfig {
        program: "/bin/sh".into(),
        base_args: vec![path.display().to_string()],
        output_format: format,
    };
    SubprocessSeparator::new(config, "htdemucs", timeout)
}

#[test]
fn collects_stems_from_demucs_layout() {
    let f = fixture();
    let sep = separator(f.tmp.path(), FAKE_DEMUCS, OutputFormat::Mp3, Duration::from_secs(30));

    let stems = sep.separate(&f.input, &f.output, None).unwrap();
    assert_eq!(
        stems.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["bass", "drums", "other", "vocals"]
    );
    assert_eq!(
        stems["vocals"],
        f.output.join("htdemucs").join("input").join("vocals.mp3")
    );
}

#[test]
fn requested_model_and_format_reach_the_command() {
    let f = fixture();
    let sep = separator(f.tmp.path(), FAKE_DEMUCS, OutputFormat::Wav, Duration::from_secs(30));

    let stems = sep.separate(&f.input, &f.output, Some("htdemucs_ft")).unwrap();
    assert_eq!(
        stems["bass"],
        f.output.join("htdemucs_ft").join("input").join("bass.wav")
    );
}

#[test]
fn non_zero_exit_reports_stderr() {
    let f = fixture();
    let script = "echo 'progress 10%'\necho 'FileNotFoundError: input.mp3' >&2\nexit 1\n";
    let sep = separator(f.tmp.path(), script, OutputFormat::Mp3, Duration::from_secs(30));

    let err = sep.separate(&f.input, &f.output, None).unwrap_err();
    assert_eq!(err.to_string(), "Demucs failed: FileNotFoundError: input.mp3");
}

#[test]
fn out_of_memory_is_reported_separately() {
    let f = fixture();
    let script = "echo 'Traceback (most recent call last):' >&2\n\
                  echo 'RuntimeError: CUDA out of memory. Tried to allocate 2.00 GiB' >&2\n\
                  exit 1\n";
    let sep = separator(f.tmp.path(), script, OutputFormat::Mp3, Duration::from_secs(30));

    let err = sep.separate(&f.input, &f.output, None).unwrap_err();
    assert!(matches!(err, WorkerError::ResourceExhausted(_)));
    assert!(err.to_string().starts_with("Out of memory during separation:"));
}

#[test]
fn slow_demucs_is_killed_at_the_deadline() {
    let f = fixture();
    let sep = separator(f.tmp.path(), "exec sleep 30\n", OutputFormat::Mp3, Duration::from_millis(300));

    let started = Instant::now();
    let err = sep.separate(&f.input, &f.output, None).unwrap_err();
    assert!(matches!(err, WorkerError::SeparationTimeout(_)));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn timeout_does_not_wait_for_background_children() {
    let f = fixture();
    // The backgrounded sleep inherits stdout and stderr and outlives the kill.
    let sep = separator(
        f.tmp.path(),
        "sleep 8 &\nexec sleep 30\n",
        OutputFormat::Mp3,
        Duration::from_millis(300),
    );

    let started = Instant::now();
    let err = sep.separate(&f.input, &f.output, None).unwrap_err();
    assert!(matches!(err, WorkerError::SeparationTimeout(_)), "{err}");
    assert!(
        started.elapsed() < Duration::from_secs(4),
        "returned after {:?}",
        started.elapsed()
    );
}

#[test]
fn missing_output_directory_is_an_error() {
    let f = fixture();
    let sep = separator(f.tmp.path(), "exit 0\n", OutputFormat::Mp3, Duration::from_secs(30));

    let err = sep.separate(&f.input, &f.output, None).unwrap_err();
    assert!(
        err.to_string().starts_with("Output directory not found:"),
        "{err}"
    );
}

#[test]
fn missing_program_fails_cleanly() {
    let f = fixture();
    let config = SubprocessConfig {
        program: "/nonexistent/python".into(),
        ..SubprocessConfig::default()
    };
    let sep = SubprocessSeparator::new(config, "htdemucs", Duration::from_secs(5));
    let err = sep.separate(&f.input, &f.output, None).unwrap_err();
    assert!(err.to_string().starts_with("Demucs failed:"));
}
