//! Telemetry initialization.
//!
//! Controlled by `FLOWSYNC_LOG`:
//! - unset → no-op (no subscriber installed)
//! - `"stderr"` → JSON events to stderr
//! - `"pretty"` → human-readable events to stderr
//!
//! Filtering follows `RUST_LOG` and defaults to `info`.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Environment variable selecting the log sink.
pub const LOG_ENV: &str = "FLOWSYNC_LOG";

/// Which sink [`init`] installs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogSink {
    /// Nothing installed.
    Off,
    /// JSON lines on stderr.
    Json,
    /// Human-readable lines on stderr.
    Pretty,
}

impl LogSink {
    /// Interpret a `FLOWSYNC_LOG` value. Unrecognized values fall back to
    /// [`LogSink::Off`] with a one-line notice.
    #[must_use]
    pub fn from_env_value(value: Option<&str>) -> Self {
        match value {
            None | Some("") => Self::Off,
            Some("stderr" | "json") => Self::Json,
            Some("pretty") => Self::Pretty,
            Some(other) => {
                eprintln!("warning: {LOG_ENV}={other} not recognized (expected stderr|pretty)");
                Self::Off
            }
        }
    }
}

/// Held in `main()` until exit.
pub struct TelemetryGuard {
    sink: LogSink,
}

impl TelemetryGuard {
    /// The sink that was installed.
    #[must_use]
    pub const fn sink(&self) -> LogSink {
        self.sink
    }
}

/// Initialize telemetry based on `FLOWSYNC_LOG`.
///
/// Returns a guard that must be held until the program exits.
#[must_use]
pub fn init() -> TelemetryGuard {
    let value = std::env::var(LOG_ENV).ok();
    let sink = LogSink::from_env_value(value.as_deref());
    match sink {
        LogSink::Off => {}
        LogSink::Json => {
            tracing_subscriber::registry()
                .with(filter())
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init();
        }
        LogSink::Pretty => {
            tracing_subscriber::registry()
                .with(filter())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_writer(std::io::stderr),
                )
                .init();
        }
    }
    TelemetryGuard { sink }
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
