//! Ferry - rewriting HTTP proxy.
//!
//! Runs a forward or reverse proxy until interrupted. Settings come from the
//! command line, then the environment (`FERRY_*`, `PROXY_*`, bare names), then
//! built-in defaults.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use directories::ProjectDirs;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ferry_core::{
    AccessLists, ConfigOverrides, Environment, LoaderScript, LoaderUrlOptions, ServerConfig,
};
use ferry_proxy::LifecycleController;

/// Ferry - HTTP proxy that injects a loader script into relayed pages
#[derive(Parser, Debug)]
#[command(name = "ferry", version, about)]
struct Args {
    /// Proxy direction (forward or reverse)
    #[arg(long)]
    direction: Option<String>,

    /// Hostname to listen on and advertise in rewritten URLs
    #[arg(long)]
    hostname: Option<String>,

    /// Port to listen on (0 picks a free port)
    #[arg(long)]
    port: Option<String>,

    /// Upstream origin for reverse mode
    #[arg(long)]
    target: Option<String>,

    /// Path prefix the proxy is mounted under
    #[arg(long)]
    context_path: Option<String>,

    /// Keep page links inside the proxy
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    proxy_links: Option<String>,

    /// JSON file with whitelist and blacklist entries
    #[arg(long)]
    lists: Option<PathBuf>,

    /// Site id to inject the loader script for
    #[arg(long)]
    site_id: Option<String>,

    /// Loader environment (prod, dev, local, or a host)
    #[arg(long, default_value = "prod")]
    loader_env: String,

    /// Loader branch (dev only)
    #[arg(long)]
    loader_branch: Option<String>,

    /// Loader version (dev only)
    #[arg(long)]
    loader_version: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Directory for rotated log files
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Log to the console only
    #[arg(long)]
    no_log_file: bool,
}

impl Args {
    /// Settings given on the command line.
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            direction: self.direction.clone(),
            hostname: self.hostname.clone(),
            port: self.port.clone(),
            target: self.target.clone(),
            context_path: self.context_path.clone(),
            proxy_links: self.proxy_links.clone(),
        }
    }

    fn loader(&self) -> anyhow::Result<Option<LoaderScript>> {
        let Some(site_id) = &self.site_id else {
            return Ok(None);
        };

        let environment: Environment = self.loader_env.parse().unwrap_or_default();
        let mut options = LoaderUrlOptions::new(site_id.as_str()).with_environment(environment);
        if let Some(branch) = &self.loader_branch {
            options = options.with_branch(branch.as_str());
        }
        if let Some(version) = &self.loader_version {
            options = options.with_version(version.as_str());
        }

        let loader = LoaderScript::from_options(&options).context("invalid loader options")?;
        Ok(Some(loader))
    }
}

/// Get the logs directory path.
fn logs_dir(args: &Args) -> Option<PathBuf> {
    args.log_dir.clone().or_else(|| {
        ProjectDirs::from("", "ferry", "Ferry").map(|dirs| dirs.data_dir().join("logs"))
    })
}

/// Daily rotated log file writer, unless disabled or unavailable.
fn file_writer(args: &Args) -> Option<(NonBlocking, WorkerGuard, PathBuf)> {
    if args.no_log_file {
        return None;
    }
    let log_dir = logs_dir(args)?;
    std::fs::create_dir_all(&log_dir).ok()?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(5)
        .filename_prefix("ferry")
        .filename_suffix("log")
        .build(&log_dir)
        .ok()?;
    let (writer, guard) = tracing_appender::non_blocking(appender);
    Some((writer, guard, log_dir))
}

/// Initialize console logging, plus the rotated file when available.
fn init_logging(args: &Args) -> Option<WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ferry={},warn", log_level)));

    let (file_layer, guard, log_dir) = match file_writer(args) {
        Some((writer, guard, dir)) => (
            Some(fmt::layer().with_writer(writer).with_ansi(false)),
            Some(guard),
            Some(dir),
        ),
        None => (None, None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stdout))
        .with(file_layer)
        .init();

    match log_dir {
        Some(dir) => tracing::info!("Logging to {:?}", dir),
        None => tracing::info!("Logging to console only"),
    }
    guard
}

/// Builds the server config from `args`, falling back to `env`.
fn build_config(args: &Args, env: &ConfigOverrides) -> anyhow::Result<ServerConfig> {
    let mut config =
        ServerConfig::resolve(&args.overrides(), env).context("invalid configuration")?;

    if let Some(path) = &args.lists {
        let lists = AccessLists::from_file(path)
            .with_context(|| format!("failed to load lists from {}", path.display()))?;
        tracing::info!(
            "Loaded {} whitelist and {} blacklist entries",
            lists.whitelist.len(),
            lists.blacklist.len()
        );
        config = config.with_lists(lists);
    }

    if let Some(loader) = args.loader()? {
        tracing::info!("Injecting loader for site {} from {}", loader.site_id, loader.script_url);
        config = config.with_loader(loader);
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ferry_proxy::mark_process_start();
    let args = Args::parse();
    let _log_guard = init_logging(&args);

    tracing::info!("Starting Ferry v{}", ferry_core::VERSION);

    let config = build_config(&args, &ConfigOverrides::from_env())?;
    tracing::info!(
        "{} proxy{}",
        config.direction.as_str(),
        config
            .target
            .as_ref()
            .map(|t| format!(" for {t}"))
            .unwrap_or_default()
    );

    let controller = LifecycleController::new(config)?;
    controller.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");

    controller.stop().await?;
    Ok(())
}
