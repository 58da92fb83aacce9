//! # Logging Assembly
//!
//! Builds the `tracing` subscriber stack from a participant's (or the
//! registry's) logger configuration: a colorized stdout layer, optional
//! non-blocking daily-rolling file layers, and an optional remote layer
//! that forwards records over the bus to the registry.
//!
//! Initialization installs a process-global subscriber, so it is the
//! hosting application's decision; library code only emits events.

use crate::config::{LogLevel, LoggerConfig, SinkType};
use crate::wire::LogMessage;
use colored::*;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{Layer, Registry};

/// A custom tracing event formatter colorizing whole lines by level.
///
/// Produces clean, user-facing output: the line is colored according to
/// severity and carries no timestamps or level prefixes.
pub struct ColorizedFormatter;

impl<S, N> FormatEvent<S, N> for ColorizedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        // Buffer the formatted fields to color the entire line at once.
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let colored_output = match *event.metadata().level() {
            Level::INFO => buffer.white(),
            Level::WARN => buffer.yellow(),
            Level::ERROR => buffer.red(),
            Level::DEBUG => buffer.blue(),
            Level::TRACE => buffer.purple(),
        };

        writeln!(writer, "{}", colored_output)
    }
}

fn level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Trace => LevelFilter::TRACE,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Error => LevelFilter::ERROR,
        LogLevel::Off => LevelFilter::OFF,
    }
}

/// Handle carrying forwarded records toward the registry connection.
///
/// The participant drains the channel and ships each record as a
/// best-effort `LogMessage`; under congestion records are dropped rather
/// than stalling the simulation.
pub struct RemoteLogHandle {
    pub(crate) rx: mpsc::Receiver<LogMessage>,
}

/// Tracing layer feeding the remote sink.
struct RemoteLayer {
    participant_name: String,
    tx: mpsc::Sender<LogMessage>,
}

struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for RemoteLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor {
            message: String::new(),
        };
        event.record(&mut visitor);
        let record = LogMessage {
            participant_name: self.participant_name.clone(),
            level: event.metadata().level().to_string(),
            message: visitor.message,
        };
        // try_send: remote logging never blocks the emitting thread
        let _ = self.tx.try_send(record);
    }
}

/// Assemble and install the global subscriber for a participant from its
/// configured sinks.
///
/// Returns the file-appender guards (which must stay alive for file
/// logging to flush) and, when a `Remote` sink is configured, the handle
/// the participant forwards records from.
pub fn init_participant_logging(
    participant_name: &str,
    config: &LoggerConfig,
) -> (Vec<WorkerGuard>, Option<RemoteLogHandle>) {
    let mut guards = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    let mut remote = None;

    for sink in &config.sinks {
        match sink.sink_type {
            SinkType::Stdout => {
                layers.push(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stdout)
                        .event_format(ColorizedFormatter)
                        .with_filter(level_filter(sink.level))
                        .boxed(),
                );
            }
            SinkType::File => {
                let path = sink
                    .log_name
                    .clone()
                    .unwrap_or_else(|| format!("{participant_name}.log"));
                let log_path = std::path::Path::new(&path);
                let directory = log_path.parent().unwrap_or_else(|| std::path::Path::new("."));
                let file_name = log_path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("participant.log"));
                let appender = tracing_appender::rolling::daily(directory, file_name);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                guards.push(guard);
                layers.push(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_filter(level_filter(sink.level))
                        .boxed(),
                );
            }
            SinkType::Remote => {
                let (tx, rx) = mpsc::channel(256);
                layers.push(
                    RemoteLayer {
                        participant_name: participant_name.to_string(),
                        tx,
                    }
                    .with_filter(level_filter(sink.level))
                    .boxed(),
                );
                remote = Some(RemoteLogHandle { rx });
            }
        }
    }

    let subscriber = Registry::default().with(layers);
    // A subscriber may already be installed (embedding application or a
    // second participant in the same process); keep the existing one.
    let _ = tracing::subscriber::set_global_default(subscriber);

    (guards, remote)
}

/// Subscriber assembly for the registry binary: colorized stdout plus an
/// optional detail log file, verbosity from the CLI.
pub fn init_registry_logging(
    verbose: u8,
    quiet: bool,
    log_file: Option<&str>,
) -> Option<WorkerGuard> {
    let level = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let mut guard = None;
    let file_layer = log_file.map(|path| {
        let log_path = std::path::Path::new(path);
        let directory = log_path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let file_name = log_path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("ib-registry.log"));
        let appender = tracing_appender::rolling::daily(directory, file_name);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        guard = Some(file_guard);
        tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_filter(level)
    });

    let stdout_layer = if quiet {
        None
    } else {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(level),
        )
    };

    let subscriber = Registry::default().with(file_layer).with(stdout_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
    guard
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SinkConfig;

    #[test]
    fn test_level_mapping() {
        assert_eq!(level_filter(LogLevel::Info), LevelFilter::INFO);
        assert_eq!(level_filter(LogLevel::Off), LevelFilter::OFF);
    }

    #[test]
    fn test_remote_sink_yields_a_handle() {
        let config = LoggerConfig {
            sinks: vec![SinkConfig {
                sink_type: SinkType::Remote,
                level: LogLevel::Warn,
                log_name: None,
            }],
            ..Default::default()
        };
        let (guards, remote) = init_participant_logging("TestParticipant", &config);
        assert!(guards.is_empty());
        assert!(remote.is_some());
    }
}
