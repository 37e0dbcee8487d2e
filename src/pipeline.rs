use crate::{
    config::{EnvVars, StorageBackend, WorkerConfig},
    core::{build_separator, separator::Separator},
    error::{Result, WorkerError},
    io::net::{fetch_audio, http_client},
    storage::{self, Publisher},
    types::{Destination, JobEvent, JobInput, JobOutput, JobRequest, StemName, DEFAULT_PREFIX},
};
use reqwest::{blocking::Client, Url};
use std::{
    any::Any,
    collections::BTreeMap,
    fs,
    panic::{catch_unwind, AssertUnwindSafe},
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};
use tempfile::TempDir;
use uuid::Uuid;

/// Generous bound for a single stem upload.
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Runs jobs: fetch, separate, publish, clean up.
///
/// Immutable once built; one instance can serve concurrent jobs.
pub struct Worker {
    config: WorkerConfig,
    env: EnvVars,
    separator: Arc<dyn Separator>,
    fetch_client: Client,
    upload_client: Client,
}

impl Worker {
    pub fn new(config: WorkerConfig, env: EnvVars, separator: Arc<dyn Separator>) -> Result<Self> {
        Ok(Self {
            fetch_client: http_client(config.fetch_timeout)?,
            upload_client: http_client(UPLOAD_TIMEOUT)?,
            config,
            env,
            separator,
        })
    }

    /// Startup path: builds the configured separator (loading the model for
    /// the in-process strategy) and fails if that is not possible.
    pub fn from_config(config: WorkerConfig, env: EnvVars) -> Result<Self> {
        let client = http_client(UPLOAD_TIMEOUT)?;
        let separator = build_separator(&config, &client)?;
        tracing::info!(
            separator = separator.name(),
            storage = ?config.storage,
            default_model = separator.default_model(),
            "worker ready"
        );
        Self::new(config, env, separator)
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Handles one event as it arrives on the wire. Text that is not JSON
    /// becomes an `error` response like any other bad payload.
    pub fn handle_raw(&self, raw: &str) -> (Option<String>, JobOutput) {
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(event) => self.handle_event(event),
            Err(e) => {
                tracing::warn!(error = %e, "event is not valid JSON");
                (None, JobOutput::error(format!("invalid event: {e}")))
            }
        }
    }

    /// Handles one runtime event (`{"id", "input"}` or a bare input object).
    pub fn handle_event(&self, event: serde_json::Value) -> (Option<String>, JobOutput) {
        match JobEvent::from_value(event) {
            Ok(ev) => {
                let output = self.handle(&ev.input);
                (ev.id, output)
            }
            Err(e) => (None, JobOutput::error(e)),
        }
    }

    /// Runs one job and folds any failure into the `error` response.
    pub fn handle(&self, input: &JobInput) -> JobOutput {
        let started = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.validate(input).and_then(|req| self.run(&req))
        }))
        .unwrap_or_else(|panic| Err(panic_error(panic)));
        match &result {
            Ok(urls) => tracing::info!(
                stems = urls.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "job finished"
            ),
            Err(e) if e.is_validation() => tracing::warn!(error = %e, "job rejected"),
            Err(e) => tracing::error!(error = %e, "job failed"),
        }
        result.into()
    }

    /// Checks the payload without touching the filesystem or the network.
    pub fn validate(&self, input: &JobInput) -> Result<JobRequest> {
        let audio_url = input
            .audio_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| WorkerError::validation("audio_url is required"))?;

        match Url::parse(audio_url) {
            Ok(u) if matches!(u.scheme(), "http" | "https") => {}
            _ => {
                return Err(WorkerError::validation(
                    "audio_url must be an http(s) URL",
                ))
            }
        }

        let (bucket_field, _) = self.config.storage.destination_fields();
        let (bucket, prefix) = match self.config.storage {
            StorageBackend::S3 => (&input.s3_bucket, &input.s3_prefix),
            StorageBackend::Supabase => (&input.storage_bucket, &input.storage_prefix),
        };
        let bucket = bucket
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .ok_or_else(|| {
                WorkerError::validation(format!(
                    "{bucket_field} is required for storing output stems"
                ))
            })?;
        let prefix = prefix.as_deref().unwrap_or(DEFAULT_PREFIX).trim();

        let stems = match &input.stems {
            None => StemName::defaults(),
            Some(list) => {
                let mut stems: Vec<StemName> = Vec::with_capacity(list.len());
                for raw in list {
                    let stem = StemName::parse(raw)?;
                    if !stems.contains(&stem) {
                        stems.push(stem);
                    }
                }
                if stems.is_empty() {
                    return Err(WorkerError::validation(
                        "stems must name at least one stem",
                    ));
                }
                stems
            }
        };

        let model = input
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string);
        if let Some(m) = &model {
            if !self.separator.accepts_model(m) {
                return Err(WorkerError::validation(format!(
                    "model `{m}` is not available on this worker (resident model: {})",
                    self.separator.default_model()
                )));
            }
        }

        Ok(JobRequest {
            audio_url: audio_url.to_string(),
            model,
            stems,
            destination: Destination {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
            },
        })
    }

    /// Runs a validated job. Scratch space is removed on every exit path.
    pub fn run(&self, req: &JobRequest) -> Result<BTreeMap<String, Option<String>>> {
        // Credentials are checked before anything is downloaded.
        let publisher = storage::connect(
            self.config.storage,
            &req.destination.bucket,
            &self.env,
            self.upload_client.clone(),
        )?;

        let job_id = new_job_id();
        let span = tracing::info_span!("job", job_id = %job_id);
        let _enter = span.enter();

        fs::create_dir_all(&self.config.scratch_root).map_err(WorkerError::Scratch)?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("stem-job-{job_id}-"))
            .tempdir_in(&self.config.scratch_root)
            .map_err(WorkerError::Scratch)?;
        tracing::debug!(path = %scratch.path().display(), "scratch directory created");

        let result = self.run_in(&scratch, &job_id, req, publisher.as_ref());

        let scratch_path = scratch.path().to_path_buf();
        if let Err(e) = scratch.close() {
            tracing::warn!(path = %scratch_path.display(), error = %e, "failed to remove scratch directory");
        }
        result
    }

    fn run_in(
        &self,
        scratch: &TempDir,
        job_id: &str,
        req: &JobRequest,
        publisher: &dyn Publisher,
    ) -> Result<BTreeMap<String, Option<String>>> {
        let input = fetch_audio(
            &self.fetch_client,
            &req.audio_url,
            scratch.path(),
            self.config.fetch_mode,
            self.config.fetch_timeout,
        )?;

        let output_dir = scratch.path().join("separated");
        fs::create_dir_all(&output_dir)?;

        let produced = self
            .separator
            .separate(&input, &output_dir, req.model.as_deref())?;
        tracing::info!(
            separator = self.separator.name(),
            produced = ?produced.keys().collect::<Vec<_>>(),
            "separation done"
        );

        let mut urls = BTreeMap::new();
        for stem in &req.stems {
            let url = match produced.get(stem.as_str()).filter(|p| p.is_file()) {
                Some(path) => {
                    let ext = path
                        .extension()
                        .and_then(|e| e.to_str())
                        .unwrap_or("wav");
                    let key = req.destination.object_key(job_id, stem, ext);
                    let url = publish_one(publisher, path, &key)?;
                    Some(url)
                }
                None => {
                    tracing::warn!(stem = %stem, "stem not produced by the model");
                    None
                }
            };
            urls.insert(stem.to_string(), url);
        }
        Ok(urls)
    }
}

/// A panic inside a job becomes that job's error; the scratch guard has
/// already been dropped during unwinding.
fn panic_error(panic: Box<dyn Any + Send>) -> WorkerError {
    let msg = if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    WorkerError::separation(format!("Separation failed: worker panicked: {msg}"))
}

fn publish_one(publisher: &dyn Publisher, path: &Path, key: &str) -> Result<String> {
    let started = Instant::now();
    let url = publisher.publish(path, key)?;
    tracing::info!(
        backend = publisher.name(),
        key,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "stem published"
    );
    Ok(url)
}

/// Short random identifier shared by a job's scratch directory and its
/// destination keys.
pub fn new_job_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StemPaths;
    use std::collections::HashSet;

    struct NoopSeparator;

    impl Separator for NoopSeparator {
        fn separate(&self, _: &Path, _: &Path, _: Option<&str>) -> Result<StemPaths> {
            Ok(StemPaths::new())
        }

        fn accepts_model(&self, model: &str) -> bool {
            model.starts_with("htdemucs")
        }

        fn default_model(&self) -> &str {
            "htdemucs"
        }

        fn name(&self) -> &'static str {
            "noop"
        }
    }

    fn worker(storage: StorageBackend) -> Worker {
        let config = WorkerConfig {
            storage,
            ..WorkerConfig::default()
        };
        Worker::new(config, EnvVars::default(), Arc::new(NoopSeparator)).unwrap()
    }

    fn input(url: Option<&str>) -> JobInput {
        JobInput {
            audio_url: url.map(str::to_string),
            s3_bucket: Some("bucket".into()),
            ..JobInput::default()
        }
    }

    #[test]
    fn job_ids_are_short_and_distinct() {
        let ids: HashSet<String> = (0..100).map(|_| new_job_id()).collect();
        assert_eq!(ids.len(), 100);
        assert!(ids.iter().all(|id| id.len() == 8));
    }

    #[test]
    fn audio_url_is_required() {
        let w = worker(StorageBackend::S3);
        let err = w.validate(&input(None)).unwrap_err();
        assert_eq!(err.to_string(), "audio_url is required");
        let err = w.validate(&input(Some("  "))).unwrap_err();
        assert_eq!(err.to_string(), "audio_url is required");
    }

    #[test]
    fn rejects_non_http_urls() {
        let w = worker(StorageBackend::S3);
        assert!(w.validate(&input(Some("file:///etc/passwd"))).is_err());
    }

    #[test]
    fn bucket_field_depends_on_backend() {
        let w = worker(StorageBackend::Supabase);
        let err = w.validate(&input(Some("https://x/y.mp3"))).unwrap_err();
        assert_eq!(
            err.to_string(),
            "storage_bucket is required for storing output stems"
        );

        let ok = w
            .validate(&JobInput {
                audio_url: Some("https://x/y.mp3".into()),
                storage_bucket: Some("stems".into()),
                storage_prefix: Some("user/42".into()),
                ..JobInput::default()
            })
            .unwrap();
        assert_eq!(ok.destination.bucket, "stems");
        assert_eq!(ok.destination.prefix, "user/42");
    }

    #[test]
    fn defaults_are_filled_in() {
        let w = worker(StorageBackend::S3);
        let req = w.validate(&input(Some("https://x/y.mp3"))).unwrap();
        assert_eq!(req.destination.prefix, "demucs-outputs");
        assert_eq!(
            req.stems.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
            vec!["vocals", "drums", "bass", "other"]
        );
        assert!(req.model.is_none());
    }

    #[test]
    fn stems_are_deduplicated_and_checked() {
        let w = worker(StorageBackend::S3);
        let mut i = input(Some("https://x/y.mp3"));
        i.stems = Some(vec!["vocals".into(), "VOCALS".into(), "bass".into()]);
        let req = w.validate(&i).unwrap();
        assert_eq!(req.stems.len(), 2);

        i.stems = Some(vec![]);
        assert!(w.validate(&i).is_err());

        i.stems = Some(vec!["vo/cals".into()]);
        assert!(w.validate(&i).is_err());
    }

    #[test]
    fn model_must_be_accepted_by_separator() {
        let w = worker(StorageBackend::S3);
        let mut i = input(Some("https://x/y.mp3"));
        i.model = Some("htdemucs_ft".into());
        assert_eq!(w.validate(&i).unwrap().model.as_deref(), Some("htdemucs_ft"));

        i.model = Some("spleeter".into());
        let err = w.validate(&i).unwrap_err();
        assert!(err.to_string().contains("spleeter"));
    }

    #[test]
    fn handle_event_passes_id_through() {
        let w = worker(StorageBackend::S3);
        let (id, out) = w.handle_event(serde_json::json!({"id": "req-1", "input": {}}));
        assert_eq!(id.as_deref(), Some("req-1"));
        assert_eq!(out, JobOutput::error("audio_url is required"));
    }
}
