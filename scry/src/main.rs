use std::collections::HashMap;
use std::path::Path;

use base64::{engine::general_purpose, Engine as _};
use clap::Parser;
use futures::StreamExt;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use scry::{Config, ImageSource, OcrRequest, Pipeline, ScryError};

#[derive(Parser, Debug)]
#[command(
    name = "scry",
    version,
    about = "Recognize text in images through a prioritized OCR pipeline"
)]
struct Args {
    /// Image inputs: file paths, URLs, or data URLs.
    #[arg(required = true)]
    inputs: Vec<String>,

    /// Priority applied to every submitted input (higher runs first).
    #[arg(short, long, default_value_t = 0)]
    priority: i32,

    /// Override the recognition prompt.
    #[arg(long)]
    prompt: Option<String>,

    /// Print full JSON outcomes instead of plain text.
    #[arg(long)]
    json: bool,

    /// Log windowed pipeline statistics while running.
    #[arg(long)]
    stats: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "scry=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::from_env();
    let pipeline = Pipeline::from_config(config)?;

    let mut results = pipeline.results();
    let mut errors = pipeline.errors();

    if args.stats {
        let snapshots = pipeline.statistics();
        tokio::spawn(async move {
            futures::pin_mut!(snapshots);
            while let Some(stats) = snapshots.next().await {
                tracing::info!(
                    "window: {} submitted, {} succeeded, {} failed, {} pending, {} in flight, {:.2}/s",
                    stats.submitted,
                    stats.succeeded,
                    stats.failed,
                    stats.pending,
                    stats.in_flight,
                    stats.throughput
                );
            }
        });
    }

    let mut labels: HashMap<String, String> = HashMap::new();
    let mut expected = 0usize;
    for input in &args.inputs {
        let source = read_source(input).await?;
        if source.is_blank() {
            tracing::warn!("Skipping blank input: {:?}", input);
            continue;
        }
        let mut request = OcrRequest::new(source).with_priority(args.priority);
        if let Some(prompt) = &args.prompt {
            request = request.with_prompt(prompt.clone());
        }
        let id = pipeline.submit(request)?;
        tracing::info!("Submitted {} as request {}", input, id);
        labels.insert(id, input.clone());
        expected += 1;
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut completed = 0usize;
    let mut failures = 0usize;
    while completed < expected {
        tokio::select! {
            received = results.recv() => match received {
                Ok(result) => {
                    completed += 1;
                    let label = labels
                        .get(&result.request_id)
                        .cloned()
                        .unwrap_or_else(|| result.request_id.clone());
                    if args.json {
                        println!("{}", serde_json::to_string_pretty(&result)?);
                    } else {
                        println!("==> {}", label);
                        println!("{}", result.text);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Results channel lagged, {} outcome(s) dropped", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            received = errors.recv() => match received {
                Ok(error) => {
                    completed += 1;
                    failures += 1;
                    let label = labels
                        .get(&error.request_id)
                        .cloned()
                        .unwrap_or_else(|| error.request_id.clone());
                    if args.json {
                        println!("{}", serde_json::to_string_pretty(&error)?);
                    } else {
                        eprintln!("==> {}: {} [{}]", label, error.message, error.code);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Errors channel lagged, {} outcome(s) dropped", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            _ = &mut shutdown => {
                tracing::info!("Interrupt received, shutting down");
                break;
            }
        }
    }

    pipeline.shutdown().await;

    if failures > 0 {
        anyhow::bail!("{} of {} request(s) failed", failures, expected);
    }
    Ok(())
}

/// Turn a command-line input into an image source. Local files are inlined as
/// data URLs when the extension names a known type, so they skip server-side
/// sniffing; everything else is passed along for the normalizer to resolve.
async fn read_source(input: &str) -> Result<ImageSource, ScryError> {
    if input.starts_with("data:") || input.starts_with("http://") || input.starts_with("https://") {
        return Ok(ImageSource::from(input));
    }

    let path = Path::new(input);
    if path.exists() {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ScryError::Argument(format!("cannot read {}: {}", input, e)))?;
        return Ok(match mime_guess::from_path(path).first() {
            Some(mime) => {
                let encoded = general_purpose::STANDARD.encode(&bytes);
                ImageSource::DataUrl(format!("data:{};base64,{}", mime.essence_str(), encoded))
            }
            None => ImageSource::Bytes(bytes),
        });
    }

    Ok(ImageSource::from(input))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
