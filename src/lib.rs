//! # stem-worker
//!
//! Serverless stem separation: download an audio file, split it into stems
//! with Demucs (external CLI or an in-process ONNX model), upload the stems
//! to S3 or Supabase Storage and report their public URLs.

pub mod config;
pub mod core;
pub mod error;
pub mod io;
pub mod model;
pub mod pipeline;
pub mod storage;
pub mod types;

pub use crate::{
    config::{EnvVars, WorkerConfig},
    core::{
        audio::{read_audio, write_audio},
        engine::StemModel,
        layout::DemucsLayout,
        separator::Separator,
        splitter::InProcessSeparator,
        subprocess::SubprocessSeparator,
    },
    error::{Result, WorkerError},
    io::progress::{set_transfer_progress_callback, Transfer},
    model::model_manager::{ensure_model, ModelHandle, ModelManifest},
    pipeline::Worker,
    storage::Publisher,
    types::{AudioData, JobInput, JobOutput, JobRequest, StemName, StemPaths},
};
