use crate::error::{Result, WorkerError};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, path::PathBuf};

pub const DEFAULT_STEMS: [&str; 4] = ["vocals", "drums", "bass", "other"];
pub const DEFAULT_PREFIX: &str = "demucs-outputs";

#[derive(Clone, Debug)]
pub struct AudioData {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Name of a single stem, restricted to characters that are safe both as a
/// file name and as an object key segment.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct StemName(String);

impl StemName {
    pub fn parse(raw: &str) -> Result<Self> {
        let name = raw.trim().to_ascii_lowercase();
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(WorkerError::validation(format!("invalid stem name `{raw}`")));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn defaults() -> Vec<StemName> {
        DEFAULT_STEMS.iter().map(|s| StemName(s.to_string())).collect()
    }
}

impl fmt::Display for StemName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw job payload as delivered by the hosting runtime.
///
/// Every field is optional at this level so that missing values surface as
/// validation errors with stable messages instead of serde errors.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct JobInput {
    pub audio_url: Option<String>,
    pub model: Option<String>,
    pub stems: Option<Vec<String>>,
    pub s3_bucket: Option<String>,
    pub s3_prefix: Option<String>,
    pub storage_bucket: Option<String>,
    pub storage_prefix: Option<String>,
}

/// Envelope used by serverless runtimes: `{"id": "...", "input": {...}}`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct JobEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub input: JobInput,
}

impl JobEvent {
    /// Accepts either the envelope or a bare input object.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        if value.get("input").is_some() || value.get("id").is_some() {
            Ok(serde_json::from_value(value)?)
        } else {
            Ok(JobEvent {
                id: None,
                input: serde_json::from_value(value)?,
            })
        }
    }
}

/// Where the stems of one job go: a bucket plus a key prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Destination {
    pub bucket: String,
    pub prefix: String,
}

impl Destination {
    /// `<prefix>/<job-id>/<stem>.<ext>`
    pub fn object_key(&self, job_id: &str, stem: &StemName, ext: &str) -> String {
        let prefix = self.prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("{job_id}/{stem}.{ext}")
        } else {
            format!("{prefix}/{job_id}/{stem}.{ext}")
        }
    }
}

/// A validated job, ready to run.
#[derive(Clone, Debug)]
pub struct JobRequest {
    pub audio_url: String,
    pub model: Option<String>,
    pub stems: Vec<StemName>,
    pub destination: Destination,
}

/// Stem name to produced local file.
pub type StemPaths = BTreeMap<String, PathBuf>;

/// Response returned once per job: either every requested stem, or one error.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JobOutput {
    Stems(BTreeMap<String, Option<String>>),
    Error { error: String },
}

impl JobOutput {
    pub fn error(e: impl ToString) -> Self {
        JobOutput::Error {
            error: e.to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, JobOutput::Error { .. })
    }
}

impl From<Result<BTreeMap<String, Option<String>>>> for JobOutput {
    fn from(r: Result<BTreeMap<String, Option<String>>>) -> Self {
        match r {
            Ok(urls) => JobOutput::Stems(urls),
            Err(e) => JobOutput::error(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stem_names_are_normalized_and_checked() {
        assert_eq!(StemName::parse(" Vocals ").unwrap().as_str(), "vocals");
        assert!(StemName::parse("").is_err());
        assert!(StemName::parse("../etc").is_err());
        assert!(StemName::parse("guitar").is_ok());
    }

    #[test]
    fn object_key_layout() {
        let dest = Destination {
            bucket: "b".into(),
            prefix: "demucs-outputs/".into(),
        };
        let stem = StemName::parse("vocals").unwrap();
        assert_eq!(
            dest.object_key("ab12cd34", &stem, "mp3"),
            "demucs-outputs/ab12cd34/vocals.mp3"
        );

        let bare = Destination {
            bucket: "b".into(),
            prefix: String::new(),
        };
        assert_eq!(bare.object_key("j", &stem, "wav"), "j/vocals.wav");
    }

    #[test]
    fn event_envelope_and_bare_input() {
        let wrapped = JobEvent::from_value(json!({"id": "r1", "input": {"audio_url": "u"}})).unwrap();
        assert_eq!(wrapped.id.as_deref(), Some("r1"));
        assert_eq!(wrapped.input.audio_url.as_deref(), Some("u"));

        let bare = JobEvent::from_value(json!({"audio_url": "u", "stems": ["bass"]})).unwrap();
        assert!(bare.id.is_none());
        assert_eq!(bare.input.stems, Some(vec!["bass".to_string()]));
    }

    #[test]
    fn output_serializes_flat() {
        let mut m = BTreeMap::new();
        m.insert("vocals".to_string(), Some("https://x/v.mp3".to_string()));
        m.insert("bass".to_string(), None);
        let v = serde_json::to_value(JobOutput::Stems(m)).unwrap();
        assert_eq!(v, json!({"vocals": "https://x/v.mp3", "bass": null}));

        let e = serde_json::to_value(JobOutput::error("audio_url is required")).unwrap();
        assert_eq!(e, json!({"error": "audio_url is required"}));
    }
}
