use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

/// Filter used when `RUST_LOG` is unset. sqlx logs every statement at info.
pub const DEFAULT_FILTER: &str = "info,sqlx=warn";

fn filter_for(rust_log: Option<&str>, default_filter: &str) -> Result<EnvFilter, anyhow::Error> {
    match rust_log.map(str::trim).filter(|s| !s.is_empty()) {
        Some(directives) => EnvFilter::try_new(directives)
            .map_err(|e| anyhow::anyhow!("invalid RUST_LOG `{directives}`: {e}")),
        None => EnvFilter::try_new(default_filter)
            .map_err(|e| anyhow::anyhow!("invalid default log filter: {e}")),
    }
}

/// Install the global subscriber: fmt to stderr so stdout stays free for the
/// run summary, filtered by `RUST_LOG` or `default_filter`.
pub fn init_tracing(default_filter: &str) -> Result<(), anyhow::Error> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = filter_for(rust_log.as_deref(), default_filter)?;

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_rust_log_falls_back_to_default() {
        assert_eq!(
            filter_for(Some("  "), DEFAULT_FILTER).unwrap().to_string(),
            EnvFilter::try_new(DEFAULT_FILTER).unwrap().to_string()
        );
        assert!(filter_for(Some("import=debug"), DEFAULT_FILTER).is_ok());
    }
}
