use crate::error::{Result, WorkerError};
use std::{collections::HashMap, env, fmt, path::PathBuf, str::FromStr, time::Duration};

/// Upper bound on a single download.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(300);
/// Upper bound on a single separation run.
pub const SEPARATION_TIMEOUT: Duration = Duration::from_secs(600);

pub const DEFAULT_MODEL: &str = "htdemucs";

/// Snapshot of environment variables.
///
/// Credentials and settings are read through this instead of `std::env` so
/// tests can supply their own values without touching the process environment.
#[derive(Clone, Debug, Default)]
pub struct EnvVars(HashMap<String, String>);

impl EnvVars {
    pub fn from_process() -> Self {
        Self(env::vars().collect())
    }

    pub fn from_pairs<K: Into<String>, V: Into<String>>(
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    /// Non-empty value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| WorkerError::MissingCredentials(key.to_string()))
    }

    fn parse_or<T: FromStr<Err = WorkerError>>(&self, key: &str, default: T) -> Result<T> {
        match self.get(key) {
            Some(raw) => raw.parse(),
            None => Ok(default),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    S3,
    Supabase,
}

impl StorageBackend {
    /// Request fields that carry the bucket and prefix for this backend.
    pub fn destination_fields(self) -> (&'static str, &'static str) {
        match self {
            StorageBackend::S3 => ("s3_bucket", "s3_prefix"),
            StorageBackend::Supabase => ("storage_bucket", "storage_prefix"),
        }
    }
}

impl FromStr for StorageBackend {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "s3" => Ok(StorageBackend::S3),
            "supabase" => Ok(StorageBackend::Supabase),
            other => Err(WorkerError::Config(format!("unknown storage backend `{other}`"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeparatorKind {
    Subprocess,
    InProcess,
}

impl FromStr for SeparatorKind {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "subprocess" | "cli" => Ok(SeparatorKind::Subprocess),
            "in-process" | "inprocess" | "onnx" => Ok(SeparatorKind::InProcess),
            other => Err(WorkerError::Config(format!("unknown separator `{other}`"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchMode {
    Buffered,
    Streamed,
}

impl FromStr for FetchMode {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "buffered" => Ok(FetchMode::Buffered),
            "streamed" | "stream" => Ok(FetchMode::Streamed),
            other => Err(WorkerError::Config(format!("unknown fetch mode `{other}`"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Mp3,
    Wav,
}

impl FromStr for OutputFormat {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mp3" => Ok(OutputFormat::Mp3),
            "wav" => Ok(OutputFormat::Wav),
            other => Err(WorkerError::Config(format!("unknown output format `{other}`"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionProvider {
    Cpu,
    Cuda,
}

impl FromStr for ExecutionProvider {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(ExecutionProvider::Cpu),
            "cuda" | "gpu" => Ok(ExecutionProvider::Cuda),
            other => Err(WorkerError::Config(format!(
                "unknown execution provider `{other}`"
            ))),
        }
    }
}

/// Settings of the subprocess strategy.
#[derive(Clone, Debug)]
pub struct SubprocessConfig {
    pub program: String,
    /// Arguments placed before the Demucs flags.
    pub base_args: Vec<String>,
    pub output_format: OutputFormat,
}

impl Default for SubprocessConfig {
    fn default() -> Self {
        Self {
            program: "python".into(),
            base_args: vec!["-m".into(), "demucs.separate".into()],
            output_format: OutputFormat::Mp3,
        }
    }
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub storage: StorageBackend,
    pub separator: SeparatorKind,
    pub fetch_mode: FetchMode,
    pub scratch_root: PathBuf,
    pub default_model: String,
    pub subprocess: SubprocessConfig,
    pub manifest_url: Option<String>,
    pub execution_provider: ExecutionProvider,
    pub fetch_timeout: Duration,
    pub separation_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            storage: StorageBackend::S3,
            separator: SeparatorKind::Subprocess,
            fetch_mode: FetchMode::Streamed,
            scratch_root: env::temp_dir(),
            default_model: DEFAULT_MODEL.into(),
            subprocess: SubprocessConfig::default(),
            manifest_url: None,
            execution_provider: ExecutionProvider::Cpu,
            fetch_timeout: FETCH_TIMEOUT,
            separation_timeout: SEPARATION_TIMEOUT,
        }
    }
}

impl WorkerConfig {
    pub fn from_env(vars: &EnvVars) -> Result<Self> {
        let defaults = Self::default();

        let subprocess = SubprocessConfig {
            program: vars
                .get("DEMUCS_PYTHON")
                .map(str::to_string)
                .unwrap_or(defaults.subprocess.program),
            base_args: defaults.subprocess.base_args,
            output_format: vars.parse_or("DEMUCS_OUTPUT_FORMAT", OutputFormat::Mp3)?,
        };

        Ok(Self {
            storage: vars.parse_or("STEM_WORKER_STORAGE", defaults.storage)?,
            separator: vars.parse_or("STEM_WORKER_SEPARATOR", defaults.separator)?,
            fetch_mode: vars.parse_or("STEM_WORKER_FETCH_MODE", defaults.fetch_mode)?,
            scratch_root: vars
                .get("STEM_WORKER_SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.scratch_root),
            default_model: vars
                .get("DEMUCS_DEFAULT_MODEL")
                .map(str::to_string)
                .unwrap_or(defaults.default_model),
            subprocess,
            manifest_url: vars
                .get("STEM_WORKER_MODEL_MANIFEST_URL")
                .map(str::to_string),
            execution_provider: vars
                .parse_or("ORT_EXECUTION_PROVIDER", defaults.execution_provider)?,
            fetch_timeout: FETCH_TIMEOUT,
            separation_timeout: SEPARATION_TIMEOUT,
        })
    }
}

impl fmt::Display for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "storage:            {:?}", self.storage)?;
        writeln!(f, "separator:          {:?}", self.separator)?;
        writeln!(f, "fetch mode:         {:?}", self.fetch_mode)?;
        writeln!(f, "scratch root:       {}", self.scratch_root.display())?;
        writeln!(f, "default model:      {}", self.default_model)?;
        writeln!(
            f,
            "demucs command:     {} {}",
            self.subprocess.program,
            self.subprocess.base_args.join(" ")
        )?;
        writeln!(f, "output format:      {:?}", self.subprocess.output_format)?;
        writeln!(
            f,
            "manifest url:       {}",
            self.manifest_url.as_deref().unwrap_or("(registry)")
        )?;
        writeln!(f, "execution provider: {:?}", self.execution_provider)?;
        writeln!(f, "fetch timeout:      {}s", self.fetch_timeout.as_secs())?;
        write!(f, "separation timeout: {}s", self.separation_timeout.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_environment_is_empty() {
        let cfg = WorkerConfig::from_env(&EnvVars::default()).unwrap();
        assert_eq!(cfg.storage, StorageBackend::S3);
        assert_eq!(cfg.separator, SeparatorKind::Subprocess);
        assert_eq!(cfg.fetch_mode, FetchMode::Streamed);
        assert_eq!(cfg.default_model, "htdemucs");
        assert_eq!(cfg.subprocess.output_format, OutputFormat::Mp3);
        assert_eq!(cfg.separation_timeout, SEPARATION_TIMEOUT);
    }

    #[test]
    fn reads_overrides() {
        let vars = EnvVars::from_pairs([
            ("STEM_WORKER_STORAGE", "Supabase"),
            ("STEM_WORKER_SEPARATOR", "in-process"),
            ("STEM_WORKER_FETCH_MODE", "buffered"),
            ("DEMUCS_PYTHON", "/usr/bin/python3"),
            ("DEMUCS_OUTPUT_FORMAT", "wav"),
            ("STEM_WORKER_SCRATCH_DIR", "/scratch"),
        ]);
        let cfg = WorkerConfig::from_env(&vars).unwrap();
        assert_eq!(cfg.storage, StorageBackend::Supabase);
        assert_eq!(cfg.separator, SeparatorKind::InProcess);
        assert_eq!(cfg.fetch_mode, FetchMode::Buffered);
        assert_eq!(cfg.subprocess.program, "/usr/bin/python3");
        assert_eq!(cfg.subprocess.output_format, OutputFormat::Wav);
        assert_eq!(cfg.scratch_root, PathBuf::from("/scratch"));
    }

    #[test]
    fn rejects_unknown_backend() {
        let vars = EnvVars::from_pairs([("STEM_WORKER_STORAGE", "gcs")]);
        let err = WorkerConfig::from_env(&vars).unwrap_err();
        assert!(err.to_string().contains("gcs"));
    }

    #[test]
    fn blank_values_count_as_missing() {
        let vars = EnvVars::from_pairs([("AWS_ACCESS_KEY_ID", "  ")]);
        assert!(vars.get("AWS_ACCESS_KEY_ID").is_none());
        assert!(matches!(
            vars.require("AWS_ACCESS_KEY_ID"),
            Err(WorkerError::MissingCredentials(_))
        ));
    }
}
