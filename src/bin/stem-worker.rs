use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::{
    fs,
    io::{self, Read, Write},
    process, thread,
};
use stem_worker::{
    ensure_model, io::net::http_client, set_transfer_progress_callback, EnvVars, Transfer, Worker,
    WorkerConfig,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "stem-worker")]
#[command(about = "Split audio into stems and publish them to object storage", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process a single job event and print its output
    Run {
        /// JSON file holding the event, `-` for stdin
        #[arg(short, long, default_value = "-")]
        input: String,
    },

    /// Process newline-delimited job events from stdin
    Serve {
        #[arg(short, long, default_value_t = 1)]
        workers: usize,
    },

    /// Download and verify the ONNX model used by the in-process separator
    Prepare {
        #[arg(short, long)]
        model: Option<String>,

        #[arg(long)]
        manifest_url: Option<String>,

        #[arg(short, long)]
        quiet: bool,
    },

    /// Print the resolved configuration
    Config,
}

fn main() {
    let cli = Cli::parse();
    init_logging();

    let env = EnvVars::from_process();
    let result = WorkerConfig::from_env(&env)
        .context("invalid configuration")
        .and_then(|config| match cli.command {
            Commands::Run { input } => handle_run(config, env, &input),
            Commands::Serve { workers } => handle_serve(config, env, workers),
            Commands::Prepare {
                model,
                manifest_url,
                quiet,
            } => handle_prepare(config, model, manifest_url, quiet),
            Commands::Config => {
                println!("{config}");
                Ok(())
            }
        });

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

/// Logs go to stderr; stdout carries job output only.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let format = std::env::var("STEM_WORKER_LOG_FORMAT").unwrap_or_default();

    match format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(io::stderr))
                .init();
        }
    }
}

fn handle_run(config: WorkerConfig, env: EnvVars, input: &str) -> Result<()> {
    let raw = if input == "-" {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("reading event from stdin")?;
        buf
    } else {
        fs::read_to_string(input).with_context(|| format!("reading event from {input}"))?
    };

    let worker = Worker::from_config(config, env).context("worker startup failed")?;
    let (_, output) = worker.handle_raw(&raw);

    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

fn handle_serve(config: WorkerConfig, env: EnvVars, workers: usize) -> Result<()> {
    let worker = Worker::from_config(config, env).context("worker startup failed")?;
    let workers = workers.max(1);
    tracing::info!(workers, "serving job events from stdin");

    thread::scope(|s| {
        for _ in 0..workers {
            s.spawn(|| serve_loop(&worker));
        }
    });
    Ok(())
}

fn serve_loop(worker: &Worker) {
    let stdin = io::stdin();
    loop {
        let mut line = String::new();
        match stdin.read_line(&mut line) {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "failed to read from stdin");
                return;
            }
        }
        if line.trim().is_empty() {
            continue;
        }

        let (id, output) = worker.handle_raw(&line);
        let response = json!({ "id": id, "output": output });

        let stdout = io::stdout();
        let mut out = stdout.lock();
        if writeln!(out, "{response}").and_then(|_| out.flush()).is_err() {
            tracing::error!("stdout closed, stopping");
            return;
        }
    }
}

fn handle_prepare(
    config: WorkerConfig,
    model: Option<String>,
    manifest_url: Option<String>,
    quiet: bool,
) -> Result<()> {
    let model = model.unwrap_or(config.default_model.clone());
    let manifest_url = manifest_url.or(config.manifest_url.clone());

    if !quiet {
        eprintln!("Preparing model: {model}");
        set_transfer_progress_callback(|kind, downloaded, total| {
            if kind != Transfer::Model {
                return;
            }
            if total > 0 {
                let percent = (downloaded as f64 / total as f64 * 100.0).round() as u64;
                eprint!(
                    "\rDownloading model: {:>3}% ({:.2} MB / {:.2} MB)",
                    percent,
                    downloaded as f64 / 1_000_000.0,
                    total as f64 / 1_000_000.0
                );
                if downloaded >= total {
                    eprintln!();
                }
            } else {
                eprint!("\rDownloading model: {:.2} MB", downloaded as f64 / 1_000_000.0);
            }
        });
    }

    let client = http_client(config.fetch_timeout.max(std::time::Duration::from_secs(3600)))?;
    let handle = ensure_model(&client, &model, manifest_url.as_deref())?;

    if !quiet {
        eprintln!("Model ready: {}", handle.local_path.display());
        eprintln!(
            "Stems: {} @ {} Hz",
            handle.manifest.stems.join(", "),
            handle.manifest.sample_rate
        );
    } else {
        println!("{}", handle.local_path.display());
    }
    Ok(())
}
