//! Object storage backends.
//!
//! A [`Publisher`] moves one local file to a bucket under a given key and
//! returns the URL the object can be fetched from afterwards.

mod s3;
mod supabase;

pub use s3::{S3Credentials, S3Publisher};
pub use supabase::{SupabaseCredentials, SupabasePublisher};

use crate::{
    config::{EnvVars, StorageBackend},
    error::{Result, WorkerError},
};
use reqwest::blocking::{Body, Response};
use std::{fs::File, path::Path};

pub trait Publisher: Send + Sync {
    /// Uploads `file` to `key` and returns its public URL.
    fn publish(&self, file: &Path, key: &str) -> Result<String>;

    /// URL under which `key` is served. Depends only on the destination.
    fn public_url(&self, key: &str) -> String;

    /// Get the name of this backend (for logging)
    fn name(&self) -> &'static str;
}

/// Builds the publisher for `backend`, reading credentials from `env`.
///
/// No network activity happens here: missing credentials are reported before
/// anything is sent.
pub fn connect(
    backend: StorageBackend,
    bucket: &str,
    env: &EnvVars,
    client: reqwest::blocking::Client,
) -> Result<Box<dyn Publisher>> {
    match backend {
        StorageBackend::S3 => {
            let creds = S3Credentials::from_env(env)?;
            Ok(Box::new(S3Publisher::new(client, creds, bucket)))
        }
        StorageBackend::Supabase => {
            let creds = SupabaseCredentials::from_env(env)?;
            Ok(Box::new(SupabasePublisher::new(client, creds, bucket)))
        }
    }
}

pub fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("flac") => "audio/flac",
        Some("ogg") => "audio/ogg",
        Some("m4a") => "audio/mp4",
        _ => "application/octet-stream",
    }
}

/// Percent-encodes `s` per RFC 3986, keeping `/` when `keep_slash` is set.
pub(crate) fn uri_encode(s: &str, keep_slash: bool) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b'/' if keep_slash => out.push('/'),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Streaming request body for a file on disk, plus its length.
pub(crate) fn file_body(file: &Path) -> std::io::Result<(Body, u64)> {
    let f = File::open(file)?;
    let len = f.metadata()?.len();
    Ok((Body::sized(f, len), len))
}

/// Turns a non-success response into a publish error carrying status and body.
pub(crate) fn check_response(resp: Response, key: &str) -> Result<()> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let mut body = resp.text().unwrap_or_default();
    if body.len() > 512 {
        let mut cut = 512;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Err(WorkerError::publish(
        key,
        format!("HTTP {status}: {}", body.trim()),
    ))
}
