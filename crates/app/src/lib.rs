use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use textreel_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use textreel_core::logging::{self, FileSink, LoggingOptions, DEFAULT_LOG_FILTER};
use textreel_core::server::{app_router, app_state_with_config};

#[derive(Parser, Debug)]
#[command(
    name = "textreel",
    about = "Renders scene text into vertical videos over HTTP"
)]
struct Cli {
    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(
        long,
        value_name = "PATH",
        help = "Encoder executable to run instead of the configured one"
    )]
    encoder: Option<String>,
}

#[derive(Debug, Default)]
struct ServerOverrides {
    port: Option<u16>,
    host: Option<String>,
    encoder: Option<String>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(Some(resolved_data_dir.as_path()));

    let overrides = ServerOverrides {
        port: cli.port,
        host: cli.host,
        encoder: cli.encoder,
    };
    run_server(overrides, resolved_data_dir).await
}

#[cfg(test)]
fn select_log_filter(
    noise_base: &str,
    rust_log_env: Option<&str>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) -> String {
    let options = LoggingOptions {
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: rust_log_env.map(ToString::to_string),
        noise_filter: noise_base.to_string(),
        ..Default::default()
    };

    logging::select_log_filter(&options)
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let options = LoggingOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let plan = logging::plan_logging(&options);
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&plan.filters.console, "console"));

    match plan.file_sink {
        FileSink::Rolling(appender) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(appender)
                .with_filter(parse_env_filter_with_fallback(&plan.filters.file, "file"));
            let subscriber = tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer);

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSink::ConsoleOnly { log_dir, reason } => {
            let subscriber = tracing_subscriber::registry().with(console_layer);

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                log_dir = ?log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: Option<&Path>) {
    let pid = std::process::id();
    if let Some(data_dir) = data_dir {
        let cfg_path = config_path(data_dir);
        info!(
            pid,
            data_dir = %data_dir.display(),
            config_path = %cfg_path.display(),
            "Runtime startup metadata"
        );
    } else {
        info!(pid, "Runtime startup metadata");
    }
}

/// CLI flags win over `PORT`, which wins over the config file.
fn apply_overrides(
    mut config: AppConfig,
    overrides: ServerOverrides,
    port_env: Option<&str>,
) -> AppConfig {
    if let Some(port) = overrides
        .port
        .or_else(|| port_env.and_then(|v| v.parse().ok()))
    {
        config.server.port = port;
    }
    if let Some(host) = overrides.host {
        config.server.host = host;
    }
    if let Some(encoder) = overrides.encoder {
        config.render.encoder_binary = encoder;
    }
    config
}

async fn run_server(overrides: ServerOverrides, data_dir: PathBuf) -> Result<()> {
    if let Err(e) = initialize_data_dir(&data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let cfg_path = config_path(&data_dir);
    let config = match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    let port_env = std::env::var("PORT").ok();
    let config = apply_overrides(config, overrides, port_env.as_deref());

    let state = app_state_with_config(&config, &data_dir);
    let service = state.service().clone();
    let app = app_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!(
        %addr,
        encoder = %config.render.encoder_binary,
        work_dir = %config.work_dir(&data_dir).display(),
        "Starting textreel server"
    );

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.shutdown().await;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(error = %error, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_server_flags() {
        let cli = Cli::try_parse_from([
            "textreel",
            "-p",
            "8080",
            "--host",
            "127.0.0.1",
            "--encoder",
            "/opt/ffmpeg/bin/ffmpeg",
            "-vv",
        ])
        .expect("parse cli");

        assert_eq!(cli.port, Some(8080));
        assert_eq!(cli.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(cli.encoder.as_deref(), Some("/opt/ffmpeg/bin/ffmpeg"));
        assert_eq!(cli.verbose, 2);
        assert!(cli.data_dir.is_none());
    }

    #[test]
    fn cli_port_beats_env_and_config() {
        let overrides = ServerOverrides {
            port: Some(9000),
            ..Default::default()
        };
        let config = apply_overrides(AppConfig::default(), overrides, Some("4000"));
        assert_eq!(config.server.port, 9000);
    }

    #[test]
    fn env_port_beats_config() {
        let config = apply_overrides(AppConfig::default(), ServerOverrides::default(), Some("4000"));
        assert_eq!(config.server.port, 4000);

        let config = apply_overrides(
            AppConfig::default(),
            ServerOverrides::default(),
            Some("not-a-port"),
        );
        assert_eq!(config.server.port, AppConfig::default().server.port);
    }

    #[test]
    fn encoder_and_host_overrides_replace_config() {
        let overrides = ServerOverrides {
            host: Some("127.0.0.1".to_string()),
            encoder: Some("ffmpeg-7".to_string()),
            ..Default::default()
        };
        let config = apply_overrides(AppConfig::default(), overrides, None);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.render.encoder_binary, "ffmpeg-7");
    }
}

#[cfg(test)]
mod log_filter_tests {
    use super::*;

    const NOISE: &str = "encoder_stderr=error,hyper=warn";

    #[test]
    fn uses_noise_and_default_info_without_overrides() {
        let selected = select_log_filter(NOISE, None, 0, None);
        assert_eq!(selected, format!("{NOISE},info"));
    }

    #[test]
    fn uses_noise_with_rust_log_when_no_cli_overrides() {
        let selected = select_log_filter(NOISE, Some("debug"), 0, None);
        assert_eq!(selected, format!("{NOISE},debug"));
    }

    #[test]
    fn verbose_flag_overrides_rust_log() {
        let selected = select_log_filter(NOISE, Some("info"), 1, None);
        assert_eq!(selected, "debug");
    }

    #[test]
    fn double_verbose_enables_trace() {
        let selected = select_log_filter(NOISE, Some("info"), 2, None);
        assert_eq!(selected, "trace");
    }

    #[test]
    fn explicit_log_filter_has_highest_precedence() {
        let selected = select_log_filter(NOISE, Some("warn"), 2, Some("textreel_core=trace"));
        assert_eq!(selected, "textreel_core=trace");
    }
}
