use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

/// Used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_FILTER: &str = "info,sqlx=warn";

/// sqlx logs every statement at info, which drowns the per-batch transfer events.
/// It stays at warn unless `RUST_LOG` mentions it explicitly.
fn filter_directives(rust_log: Option<&str>) -> String {
    match rust_log.map(str::trim).filter(|d| !d.is_empty()) {
        None => DEFAULT_FILTER.to_string(),
        Some(d) if d.contains("sqlx") => d.to_string(),
        Some(d) => format!("{d},sqlx=warn"),
    }
}

/// Installs the global fmt subscriber. Output goes to stdout; the scheduler running
/// the binary decides where that ends up.
pub fn init_tracing() -> Result<(), anyhow::Error> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = EnvFilter::try_new(filter_directives(rust_log.as_deref()))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}
