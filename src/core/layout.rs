use crate::{
    error::{Result, WorkerError},
    types::StemPaths,
};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Where Demucs puts its stems:
/// `<output_root>/<model>/<input file stem>/<stem>.<ext>`.
///
/// The CLI derives this from its `-o` and `-n` flags and the input file name;
/// the in-process separator writes to the same place so both strategies are
/// read back the same way.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DemucsLayout {
    pub output_root: PathBuf,
    pub model: String,
    pub track: String,
}

impl DemucsLayout {
    pub fn new(output_root: &Path, model: &str, input: &Path) -> Self {
        let track = input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output")
            .to_string();
        Self {
            output_root: output_root.to_path_buf(),
            model: model.to_string(),
            track,
        }
    }

    pub fn stems_dir(&self) -> PathBuf {
        self.output_root.join(&self.model).join(&self.track)
    }

    pub fn stem_path(&self, stem: &str, ext: &str) -> PathBuf {
        self.stems_dir().join(format!("{stem}.{ext}"))
    }

    /// Every regular file in the stems directory, keyed by file stem.
    pub fn collect(&self) -> Result<StemPaths> {
        let dir = self.stems_dir();
        if !dir.is_dir() {
            return Err(WorkerError::separation(format!(
                "Output directory not found: {}",
                dir.display()
            )));
        }

        let mut stems = StemPaths::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            if let Some(name) = path.file_stem().and_then(|s| s.to_str()) {
                stems.insert(name.to_ascii_lowercase(), path.clone());
            }
        }
        Ok(stems)
    }
}
