use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use tracing::level_filters::LevelFilter as Level;
use tracing_subscriber::filter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::prelude::*;

/// The path of the log file of the cache `name` under `dir`.
#[must_use]
pub fn log_file_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("datenlord_arc_{name}.log"))
}

/// Initialize the logger of the cache `name`.
///
/// Logs go to `{dir}/datenlord_arc_{name}.log` when `dir` is given, to stderr
/// otherwise. Eviction events are only kept at `DEBUG`, the metrics module is
/// capped at `INFO`.
#[allow(clippy::let_underscore_must_use)]
#[inline]
pub fn init_logger(name: &str, level: Level, dir: Option<&Path>) -> io::Result<()> {
    let filter = filter::Targets::new()
        .with_target("datenlord_arc::metrics", Level::INFO)
        .with_target("", level);

    let writer = match dir {
        Some(dir) => {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(log_file_path(dir, name))?;
            BoxMakeWriter::new(std::sync::Mutex::new(file))
        }
        None => BoxMakeWriter::new(io::stderr),
    };

    let layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_file(false)
        .with_target(true)
        .with_ansi(false)
        .with_writer(writer)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_filter(filter);

    let subscriber = tracing_subscriber::Registry::default().with(layer);

    if cfg!(test) {
        let _: Result<(), tracing::subscriber::SetGlobalDefaultError> =
            tracing::subscriber::set_global_default(subscriber);
    } else {
        tracing::subscriber::set_global_default(subscriber)
            .unwrap_or_else(|error| panic!("Could not set logger ,err {error}"));
    }
    Ok(())
}
