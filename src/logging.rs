use std::sync::Once;

static TRACING_INIT: Once = Once::new();

/// Initializes the global tracing subscriber. `RUST_LOG` takes precedence
/// over the configured level.
pub fn init_tracing(level: &str) {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("ledger_etl={},ledger_server={}", level, level))
        });

        fmt().with_env_filter(filter).with_target(true).init();
    });
}
