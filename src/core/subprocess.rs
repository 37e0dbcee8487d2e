use crate::{
    config::{OutputFormat, SubprocessConfig},
    core::{layout::DemucsLayout, separator::Separator},
    error::{Result, WorkerError},
    types::StemPaths,
};
use std::{
    io::Read,
    path::Path,
    process::{Child, Command, ExitStatus, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs the Demucs command line tool as a child process.
pub struct SubprocessSeparator {
    config: SubprocessConfig,
    default_model: String,
    timeout: Duration,
}

impl SubprocessSeparator {
    pub fn new(config: SubprocessConfig, default_model: &str, timeout: Duration) -> Self {
        Self {
            config,
            default_model: default_model.to_string(),
            timeout,
        }
    }

    /// Arguments after the program name.
    pub fn args(&self, input: &Path, output_dir: &Path, model: &str) -> Vec<String> {
        let mut args = self.config.base_args.clone();
        args.extend([
            "-n".to_string(),
            model.to_string(),
            "-o".to_string(),
            output_dir.display().to_string(),
        ]);
        if self.config.output_format == OutputFormat::Mp3 {
            args.push("--mp3".into());
        }
        args.push(input.display().to_string());
        args
    }

    fn run(&self, args: &[String]) -> Result<(ExitStatus, String)> {
        let mut child = Command::new(&self.config.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                WorkerError::separation(format!(
                    "Demucs failed: cannot start `{}`: {e}",
                    self.config.program
                ))
            })?;

        // Drain both pipes concurrently so the child never blocks on a full pipe.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        match wait_with_deadline(&mut child, Instant::now() + self.timeout)? {
            Some(status) => {
                let stdout = stdout.join().unwrap_or_default();
                let stderr = stderr.join().unwrap_or_default();
                if !stdout.trim().is_empty() {
                    tracing::debug!(output = %stdout.trim_end(), "demucs stdout");
                }
                Ok((status, stderr))
            }
            // Descendants of the killed child may still hold the pipes open;
            // the drain threads are detached and finish when they close.
            None => Err(WorkerError::SeparationTimeout(self.timeout)),
        }
    }
}

impl Separator for SubprocessSeparator {
    fn separate(&self, input: &Path, output_dir: &Path, model: Option<&str>) -> Result<StemPaths> {
        let model = model.unwrap_or(&self.default_model);
        let args = self.args(input, output_dir, model);

        tracing::info!(
            program = %self.config.program,
            ?args,
            timeout_s = self.timeout.as_secs(),
            "starting demucs"
        );
        let started = Instant::now();

        let (status, stderr) = self.run(&args)?;

        tracing::info!(
            exit_code = ?status.code(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "demucs finished"
        );

        if !status.success() {
            let stderr = stderr.trim();
            if is_out_of_memory(stderr) {
                return Err(WorkerError::ResourceExhausted(last_line(stderr).to_string()));
            }
            return Err(WorkerError::separation(format!("Demucs failed: {stderr}")));
        }

        DemucsLayout::new(output_dir, model, input).collect()
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn name(&self) -> &'static str {
        "subprocess"
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut p) = pipe {
            p.read_to_end(&mut buf).ok();
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// `Ok(None)` when the deadline passed; the child is killed and reaped.
fn wait_with_deadline(child: &mut Child, deadline: Instant) -> Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            tracing::warn!(pid = child.id(), "demucs exceeded its time limit, killing");
            child.kill().ok();
            child.wait().ok();
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn is_out_of_memory(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("out of memory") || lower.contains("outofmemoryerror")
}

fn last_line(s: &str) -> &str {
    s.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or(s)
}
