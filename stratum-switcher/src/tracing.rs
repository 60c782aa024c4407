//! Provide tracing, tailored to this program.
//!
//! At startup, the daemon calls [`init_journald_or_stdout`] to install a
//! tracing subscriber (i.e., something that emits events to a log). The level
//! configured by `LogLevel` is only a default: `RUST_LOG`, when set, wins.
//!
//! Other modules import the logging macros through
//! `use crate::tracing::prelude::*`.

use std::env;
use std::str::FromStr;
use time::OffsetDateTime;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Initialize logging.
///
/// If running under systemd, use journald; otherwise fall
/// back to stdout.
pub fn init_journald_or_stdout(default_level: LevelFilter) {
    if env::var("JOURNAL_STREAM").is_ok() {
        if let Ok(layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter(default_level))
                .with(layer)
                .init();
        } else {
            use_stdout(default_level);
            error!("Failed to initialize journald logging, using stdout.");
        }
    } else {
        use_stdout(default_level);
    }
}

/// Map a `LogLevel` config value to a filter, falling back to INFO.
///
/// Accepts the usual level names in any case, plus "warning" and "fatal"
/// for compatibility with older configuration files.
pub fn parse_level(name: &str) -> LevelFilter {
    match name.trim().to_ascii_lowercase().as_str() {
        "warning" => LevelFilter::WARN,
        "fatal" | "panic" => LevelFilter::ERROR,
        other => LevelFilter::from_str(other).unwrap_or(LevelFilter::INFO),
    }
}

fn env_filter(default_level: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy()
}

// Log to stdout, filtering according to environment variable RUST_LOG.
fn use_stdout(default_level: LevelFilter) {
    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(tracing_subscriber::fmt::layer().with_timer(LocalTimer))
        .init();
}

// Format timestamps in local time, to the millisecond.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now =
            OffsetDateTime::now_local().unwrap_or(OffsetDateTime::now_utc());
        let formatted = now
            .format(time::macros::format_description!(
                "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
            ))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{}", formatted)
    }
}
