//! Logging initialization: console plus a rolling file sink

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Map the numeric config level onto a tracing filter.
fn level_str(level: i32) -> &'static str {
    match level {
        0 => "debug",
        1 => "info",
        2 => "warn",
        _ => "error",
    }
}

/// Initialize the global subscriber. The returned guard must live as long
/// as the process or buffered file logs are lost.
pub fn init(level: i32, file_only: bool) -> WorkerGuard {
    let file = tracing_appender::rolling::never(".", "burrow.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_str(level)));
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false);

    if file_only {
        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(level_str(0), "debug");
        assert_eq!(level_str(1), "info");
        assert_eq!(level_str(2), "warn");
        assert_eq!(level_str(3), "error");
        assert_eq!(level_str(99), "error");
    }
}
