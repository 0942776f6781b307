use std::{
    error::Error,
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::Parser;
use tokio::signal;
use tracing_subscriber::{
    EnvFilter, Registry, layer::SubscriberExt, reload, util::SubscriberInitExt,
};
use whisper_uds::{
    config::loader::init_settings,
    service::{socket_server, transcription_service::TranscriptionService},
    whisper::whisper_engine::WhisperEngine,
};

#[derive(Debug, Parser)]
#[command(version, about = "Speech-to-text over a Unix domain socket")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// JSON logs. `RUST_LOG` wins; otherwise the filter is replaced once the
/// configured level is known.
fn init_tracing() -> Option<FilterHandle> {
    let from_env = EnvFilter::try_from_default_env().ok();
    let user_set = from_env.is_some();
    let (filter, handle) =
        reload::Layer::new(from_env.unwrap_or_else(|| EnvFilter::new("info")));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    (!user_set).then_some(handle)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let filter = init_tracing();

    let settings = init_settings(&args.config).inspect_err(|e| {
        tracing::error!("Configuration error: {e}");
    })?;

    if let Some(handle) = filter {
        match EnvFilter::try_new(&settings.service.log_level) {
            Ok(level) => handle.reload(level)?,
            Err(e) => tracing::warn!(
                log_level = %settings.service.log_level,
                "Invalid log level, keeping info: {e}"
            ),
        }
    }

    let engine = {
        let settings = settings.clone();
        tokio::task::spawn_blocking(move || WhisperEngine::load(&settings)).await?
    }
    .inspect_err(|e| tracing::error!("Failed to load model: {e}"))?;

    let service = Arc::new(TranscriptionService::new(&settings, Arc::new(engine))?);
    let app = socket_server::router(service.clone(), settings.service.max_audio_bytes);

    let gate = service.gate().clone();
    socket_server::serve(Path::new(&settings.service.socket_path), app, async move {
        shutdown_signal().await;
        // Queued requests fail fast; running ones finish.
        gate.close();
    })
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    // Wait for Ctrl+C signal for graceful shutdown
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => tracing::info!("Ctrl+C pressed, shutting down"),
            Err(err) => tracing::error!("Failed to listen for Ctrl+C: {}", err),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                tracing::info!("Received terminate signal");
            }
            Err(err) => tracing::error!("Failed to install signal handler: {}", err),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
