pub mod audio;
pub mod dsp;
pub mod engine;
pub mod layout;
pub mod separator;
pub mod splitter;
pub mod subprocess;

use crate::{
    config::{SeparatorKind, WorkerConfig},
    error::Result,
};
use reqwest::blocking::Client;
use separator::Separator;
use splitter::InProcessSeparator;
use std::sync::Arc;
use subprocess::SubprocessSeparator;

/// Builds the separation strategy selected by `config`.
///
/// For the in-process strategy this loads the model, so it belongs in
/// startup: a failure here should stop the worker.
pub fn build_separator(config: &WorkerConfig, client: &Client) -> Result<Arc<dyn Separator>> {
    match config.separator {
        SeparatorKind::Subprocess => Ok(Arc::new(SubprocessSeparator::new(
            config.subprocess.clone(),
            &config.default_model,
            config.separation_timeout,
        ))),
        SeparatorKind::InProcess => Ok(Arc::new(InProcessSeparator::from_config(config, client)?)),
    }
}
