use crate::{
    config::FetchMode,
    error::{Result, WorkerError},
    io::progress::{emit_transfer_progress, Transfer},
};
use reqwest::{blocking::Client, Url};
use std::{
    fs::{self, File},
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

const KNOWN_AUDIO_EXTENSIONS: [&str; 5] = ["mp3", "wav", "flac", "ogg", "m4a"];
pub const DEFAULT_AUDIO_EXTENSION: &str = "wav";

pub fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(timeout)
        .build()
        .map_err(|e| WorkerError::Config(format!("http client build failed: {e}")))
}

/// Extension of the last path segment of `url` when it names a known audio
/// container, `wav` otherwise.
pub fn infer_extension(url: &str) -> &'static str {
    let path = match Url::parse(url) {
        Ok(u) => u.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
    };
    let ext = Path::new(&path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    ext.and_then(|e| KNOWN_AUDIO_EXTENSIONS.iter().copied().find(|k| *k == e))
        .unwrap_or(DEFAULT_AUDIO_EXTENSION)
}

/// Downloads `url` into `dir` and returns the created file.
///
/// The whole transfer is bounded by `timeout`, whichever mode is used.
pub fn fetch_audio(
    client: &Client,
    url: &str,
    dir: &Path,
    mode: FetchMode,
    timeout: Duration,
) -> Result<PathBuf> {
    let dest = dir.join(format!("input.{}", infer_extension(url)));
    let started = Instant::now();

    let resp = client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(describe_request_error)?;

    let total = resp.content_length().unwrap_or(0);
    tracing::debug!(url, total, ?mode, "fetching audio");

    let written = match mode {
        FetchMode::Buffered => write_buffered(resp, &dest)?,
        FetchMode::Streamed => write_streamed(resp, &dest, started, timeout)?,
    };

    if written == 0 {
        fs::remove_file(&dest).ok();
        return Err(WorkerError::Fetch(format!("{url} returned an empty body")));
    }

    tracing::info!(
        bytes = written,
        elapsed_ms = started.elapsed().as_millis() as u64,
        path = %dest.display(),
        "audio downloaded"
    );
    Ok(dest)
}

fn write_buffered(resp: reqwest::blocking::Response, dest: &Path) -> Result<u64> {
    let body = resp.bytes().map_err(describe_request_error)?;
    fs::write(dest, &body).map_err(|e| WorkerError::Fetch(e.to_string()))?;
    emit_transfer_progress(Transfer::Download, body.len() as u64, body.len() as u64);
    Ok(body.len() as u64)
}

fn write_streamed(
    resp: reqwest::blocking::Response,
    dest: &Path,
    started: Instant,
    timeout: Duration,
) -> Result<u64> {
    stream_to_file(resp, dest, Transfer::Download, Some(started + timeout)).map_err(|e| {
        if e.kind() == ErrorKind::TimedOut {
            WorkerError::Fetch(format!("download timed out after {}s", timeout.as_secs()))
        } else {
            WorkerError::Fetch(e.to_string())
        }
    })
}

/// Copies a response body to `dest` in 64 KiB chunks through a `.part` file.
///
/// Fails with `ErrorKind::TimedOut` once `deadline` passes; the partial file
/// is removed in that case.
pub fn stream_to_file(
    mut resp: reqwest::blocking::Response,
    dest: &Path,
    kind: Transfer,
    deadline: Option<Instant>,
) -> std::io::Result<u64> {
    let tmp = dest.with_extension("part");
    let total = resp.content_length().unwrap_or(0);

    emit_transfer_progress(kind, 0, total);

    let mut file = File::create(&tmp)?;
    let mut downloaded: u64 = 0;
    let mut buf = [0u8; 64 * 1024];
    loop {
        if deadline.is_some_and(|d| Instant::now() > d) {
            drop(file);
            fs::remove_file(&tmp).ok();
            return Err(std::io::Error::new(ErrorKind::TimedOut, "transfer deadline exceeded"));
        }
        let n = resp.read(&mut buf)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
        downloaded += n as u64;
        emit_transfer_progress(kind, downloaded, total);
    }
    file.flush()?;
    drop(file);

    if dest.exists() {
        fs::remove_file(dest).ok();
    }
    fs::rename(&tmp, dest)?;

    emit_transfer_progress(kind, total.max(downloaded), total.max(downloaded));
    Ok(downloaded)
}

fn describe_request_error(e: reqwest::Error) -> WorkerError {
    if e.is_timeout() {
        WorkerError::Fetch(format!("request timed out: {e}"))
    } else if let Some(status) = e.status() {
        WorkerError::Fetch(format!("HTTP {status}"))
    } else {
        WorkerError::Fetch(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_from_url_suffix() {
        assert_eq!(infer_extension("https://x/y.mp3"), "mp3");
        assert_eq!(infer_extension("https://x/song.FLAC?sig=abc"), "flac");
        assert_eq!(infer_extension("https://x/a.ogg#t=10"), "ogg");
        assert_eq!(infer_extension("https://x/track.m4a"), "m4a");
    }

    #[test]
    fn unknown_suffix_falls_back_to_wav() {
        assert_eq!(infer_extension("https://x/download?id=5"), "wav");
        assert_eq!(infer_extension("https://x/file.txt"), "wav");
        assert_eq!(infer_extension("https://x.mp3/stream"), "wav");
        assert_eq!(infer_extension("not a url.mp3"), "mp3");
    }
}
