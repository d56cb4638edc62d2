use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const DEFAULT_FILTER: &str = "info,wxhub=debug";

/// Install the process-wide subscriber.
/// - JSON lines on stdout
/// - RUST_LOG respected; defaults to [`DEFAULT_FILTER`]
///
/// Calling it twice is harmless; the second call leaves the first subscriber in place.
pub fn init(service_name: &str) {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_FILTER.to_string());

    let installed = tracing_subscriber::registry()
        .with(EnvFilter::new(env_filter))
        .with(tracing_subscriber::fmt::layer().json())
        .try_init();

    if installed.is_ok() {
        tracing::info!(service = %service_name, "logging initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_does_not_panic() {
        init("wxhub-test");
        init("wxhub-test");
    }
}
