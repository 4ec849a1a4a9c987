//! Explicitly constructed tracing subscriber for one tournament or matrix run.

use std::{fs::OpenOptions, path::Path, sync::Mutex};

use anyhow::Context;
use time::{format_description, UtcOffset};
use tracing::{dispatcher, Dispatch};
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, time::OffsetTime},
    layer::SubscriberExt,
    Layer, Registry,
};

/// Owns the [`Dispatch`] every orchestrator thread logs through.
///
/// Nothing is installed globally: code runs under the logger with [`TournamentLogger::in_scope`],
/// and worker threads re-enter the dispatch they were spawned from.
#[derive(Clone, Debug)]
pub struct TournamentLogger {
    dispatch: Dispatch,
}

impl TournamentLogger {
    /// Log everything to `log_file` (when given, appending to it) and `INFO` and above to stdout when `verbose`.
    pub fn new(log_file: Option<&Path>, verbose: bool) -> anyhow::Result<Self> {
        // current_local_offset fails once other threads exist; fall back to UTC
        let local_offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
        let timer = OffsetTime::new(
            local_offset,
            format_description::parse_borrowed::<2>("[year]-[month]-[day] [hour]:[minute]:[second]")
                .context("invalid timestamp format")?,
        );

        let file_layer = match log_file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("could not create log file {}", path.display()))?;
                Some(
                    fmt::layer()
                        .with_ansi(false)
                        .with_timer(timer.clone())
                        .with_writer(Mutex::new(file))
                        .with_filter(LevelFilter::TRACE),
                )
            }
            None => None,
        };
        let stdout_layer = verbose.then(|| {
            fmt::layer()
                .with_target(false)
                .with_timer(timer)
                .with_filter(LevelFilter::INFO)
        });

        let subscriber = Registry::default().with(file_layer).with(stdout_layer);
        Ok(Self {
            dispatch: Dispatch::new(subscriber),
        })
    }

    /// A logger that drops every event.
    pub fn disabled() -> Self {
        Self {
            dispatch: Dispatch::none(),
        }
    }

    /// The underlying dispatch, for threads that need to re-enter it.
    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Run `f` with this logger as the thread's default subscriber.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        dispatcher::with_default(&self.dispatch, f)
    }
}

/// Dispatch of the calling thread, to hand over to spawned workers.
pub(crate) fn current_dispatch() -> Dispatch {
    dispatcher::get_default(|d| d.clone())
}
