//! Separation backends.
//!
//! Both strategies take one local audio file and leave one file per stem in
//! the [`DemucsLayout`](super::layout::DemucsLayout) under `output_dir`.

use crate::{error::Result, types::StemPaths};
use std::path::Path;

/// Stem separation backend
pub trait Separator: Send + Sync {
    /// Separate `input` into stems written below `output_dir`.
    ///
    /// `model` overrides the separator's default model when the backend
    /// supports it.
    fn separate(&self, input: &Path, output_dir: &Path, model: Option<&str>) -> Result<StemPaths>;

    /// Whether a job may ask for `model`. Checked before any work is done.
    fn accepts_model(&self, _model: &str) -> bool {
        true
    }

    /// Model used when a job does not name one.
    fn default_model(&self) -> &str;

    /// Get the name of this separator (for logging)
    fn name(&self) -> &'static str;
}
