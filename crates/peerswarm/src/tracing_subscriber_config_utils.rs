use std::io::LineWriter;

use anyhow::Context;
use peerswarm_core::spawn_utils::spawn;
use tracing::error_span;
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

const DEFAULT_FILE_RUST_LOG: &str = "info,peerswarm=debug";

#[derive(Debug, Default)]
pub struct InitLoggingOptions<'a> {
    /// Used when RUST_LOG isn't set. "info" if None.
    pub default_rust_log_value: Option<&'a str>,
    /// Emit JSON lines to stderr instead of human-readable text.
    pub json: bool,
    pub log_file: Option<&'a str>,
    pub log_file_rust_log: Option<&'a str>,
}

pub struct InitLoggingResult {
    /// Send a new RUST_LOG value here to change stderr filtering at runtime.
    pub rust_log_reload_tx: tokio::sync::mpsc::UnboundedSender<String>,
}

/// Install the global subscriber. Must be called from within a tokio runtime.
#[inline(never)]
pub fn init_logging(opts: InitLoggingOptions) -> anyhow::Result<InitLoggingResult> {
    let stderr_filter = EnvFilter::builder()
        .with_default_directive(
            opts.default_rust_log_value
                .unwrap_or("info")
                .parse()
                .context("can't parse provided rust_log value")?,
        )
        .from_env()
        .context("invalid RUST_LOG value")?;

    let (stderr_filter, reload_stderr_filter) =
        tracing_subscriber::reload::Layer::new(stderr_filter);

    let stderr_layer = if opts.json {
        fmt::layer()
            .with_ansi(false)
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    let file_layer = match opts.log_file {
        Some(log_file) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_file)
                .with_context(|| format!("error opening log file {log_file:?}"))?;
            let filter = EnvFilter::builder()
                .parse(opts.log_file_rust_log.unwrap_or(DEFAULT_FILE_RUST_LOG))
                .context("can't parse log-file-rust-log")?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(LineWriter::new(file)))
                    .with_filter(filter),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stderr_layer.with_filter(stderr_filter))
        .with(file_layer)
        .try_init()
        .context("can't init logging")?;

    let (reload_tx, mut reload_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    spawn(error_span!("fmt_filter_reloader"), async move {
        while let Some(rust_log) = reload_rx.recv().await {
            let filter = match EnvFilter::builder().parse(&rust_log) {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("can't parse env filter {rust_log:?}: {e:#}");
                    continue;
                }
            };
            eprintln!("setting RUST_LOG to {rust_log:?}");
            let _ = reload_stderr_filter.reload(filter);
        }
        Ok(())
    });

    Ok(InitLoggingResult {
        rust_log_reload_tx: reload_tx,
    })
}
