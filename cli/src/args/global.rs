use std::fs::OpenOptions;
use std::io::IsTerminal;

use anyhow::Context;
use anyhow::Result;
use camino::Utf8PathBuf;
use clap::Args;
use tracing::debug;
use tracing_appender::non_blocking;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_glog::Glog;
use tracing_glog::GlogFields;
use tracing_glog::LocalTime;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

const HEADING: Option<&str> = Some("Global Options");

/// What goes to `--log-file`, independent of `--log`.
const FILE_FILTER: &str = "hostform=debug,hostform_cli=debug,russh=info";

#[derive(Debug, Args, Clone)]
pub struct GlobalArgs {
    /// Filter directive for stderr logs, e.g. `hostform=debug`
    #[clap(long, env = "HOSTFORM_LOG", default_value = "warn", help_heading = HEADING, global = true)]
    pub log: String,

    /// Also write debug logs to this file, truncating it
    #[clap(long, help_heading = HEADING, global = true)]
    pub log_file: Option<Utf8PathBuf>,
}

/// Keeps the log file writer flushing until dropped at the end of the
/// program.
#[derive(Debug, Default)]
#[must_use]
pub struct TracingGuard {
    _file: Option<WorkerGuard>,
}

impl GlobalArgs {
    /// Installs the global subscriber. Spans of running operations show as
    /// spinners on a terminal.
    pub fn init_tracing(&self) -> Result<TracingGuard> {
        let indicatif_layer = IndicatifLayer::new();

        let stderr_layer = tracing_subscriber::fmt::layer()
            .event_format(Glog::default().with_timer(LocalTime::default()))
            .fmt_fields(GlogFields::default())
            .with_ansi(std::io::stderr().is_terminal())
            .with_writer(indicatif_layer.get_stderr_writer())
            .with_filter(EnvFilter::builder().parse_lossy(&self.log));

        let (file_layer, file_guard) = match &self.log_file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(path)
                    .with_context(|| format!("unable to open log file {path}"))?;
                let (writer, guard) = non_blocking(file);
                let layer = tracing_subscriber::fmt::layer()
                    .event_format(Glog::default().with_timer(LocalTime::default()))
                    .fmt_fields(GlogFields::default())
                    .with_ansi(false)
                    .with_writer(writer)
                    .with_filter(EnvFilter::new(FILE_FILTER));
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        let subscriber = Registry::default()
            .with(stderr_layer)
            .with(file_layer)
            .with(indicatif_layer);
        tracing::subscriber::set_global_default(subscriber)?;

        debug!(log_file = ?self.log_file, "Initialized tracing");
        Ok(TracingGuard { _file: file_guard })
    }
}
