//! Lightbox daemon
//!
//! Serves an image directory over HTTP.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::cache::{Cache, VersionedCache};
use daemon::config::{default_config_path, Config};
use daemon::{http, GalleryService, ImageRuntime};
use tokio::net::TcpListener;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Lightbox - browse image directories with cached thumbnails.
#[derive(Parser, Debug)]
#[command(name = "lightbox")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Address to listen on, overrides the configuration
        #[arg(long, value_name = "ADDR")]
        listen: Option<String>,

        /// Image directory, overrides the configuration
        #[arg(long, value_name = "DIR")]
        image_dir: Option<PathBuf>,
    },

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();

    match cli.command {
        Commands::Serve { listen, image_dir } => {
            if let Some(listen) = listen {
                config.server.listen_addr = listen;
            }
            if let Some(image_dir) = image_dir {
                config.paths.image_dir = image_dir;
            }
            config.validate()?;

            let _guards = init_logging(&config, cli.verbose);
            tracing::info!(config = %config_path.display(), "Lightbox starting");
            run_server(config).await
        }
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Config(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists: {} (use --force to overwrite)",
                    config_path.display()
                );
            }
            Config::default().save(&config_path)?;
            println!("Wrote {}", config_path.display());
            Ok(())
        }
    }
}

/// Initialize logging to stderr and, if configured, to daily log files.
/// Returns guards that must be kept alive for the duration of the program.
fn init_logging(
    config: &Config,
    verbose: bool,
) -> Vec<tracing_appender::non_blocking::WorkerGuard> {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        config
            .server
            .log_level
            .parse::<LevelFilter>()
            .unwrap_or(LevelFilter::INFO)
    };

    let mut guards = Vec::new();

    let (stderr_writer, stderr_guard) = tracing_appender::non_blocking(std::io::stderr());
    guards.push(stderr_guard);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(stderr_writer)
        .with_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        );

    if let Some(log_dir) = &config.server.log_dir {
        if let Err(e) = std::fs::create_dir_all(log_dir) {
            eprintln!(
                "Warning: Failed to create log directory {:?}: {}",
                log_dir, e
            );
        }

        let file_appender = tracing_appender::rolling::daily(log_dir, "lightbox.log");
        let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        guards.push(file_guard);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_filter(
                EnvFilter::builder()
                    .with_default_directive(level.into())
                    .from_env_lossy(),
            );

        tracing_subscriber::registry()
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry().with(stderr_layer).init();
    }

    guards
}

/// Run the gallery until a shutdown signal arrives.
///
/// The image runtime is torn down last, after the caches are closed.
async fn run_server(config: Config) -> anyhow::Result<()> {
    let image_dir = &config.paths.image_dir;
    if !image_dir.is_dir() {
        anyhow::bail!("Image directory does not exist: {}", image_dir.display());
    }

    config.create_default_cache_dirs()?;

    let imaging = Arc::new(ImageRuntime::init(&config.imaging));
    let result = serve_gallery(&config, Arc::clone(&imaging)).await;
    imaging.teardown();

    if let Err(e) = &result {
        tracing::error!(error = %format!("{:#}", e), "Lightbox stopped with an error");
    } else {
        tracing::info!("Lightbox stopped");
    }
    result
}

async fn serve_gallery(config: &Config, imaging: Arc<ImageRuntime>) -> anyhow::Result<()> {
    let thumbnails = Cache::from_config(&config.cache.thumbnails)
        .await
        .context("Failed to open thumbnail cache")?;

    let metadata = match Cache::from_config(&config.cache.metadata).await {
        Ok(cache) => cache,
        Err(e) => {
            if let Err(close_err) = thumbnails.close().await {
                tracing::warn!(error = %close_err, "Failed to close thumbnail cache");
            }
            return Err(e).context("Failed to open metadata cache");
        }
    };

    let service = Arc::new(GalleryService::new(
        &config.paths,
        thumbnails,
        metadata,
        imaging,
        config.imaging.fill_timeout(),
    ));

    let served = async {
        let addr = config.listen_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        http::serve(listener, Arc::clone(&service), wait_for_shutdown_signal()).await?;
        anyhow::Ok(())
    }
    .await;

    if let Err(e) = service.close().await {
        tracing::warn!(error = %e, "Failed to close caches");
    }

    served
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(error = %e, "Failed to register signal handlers, waiting for Ctrl-C");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Received Ctrl-C");
}
