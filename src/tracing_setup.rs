use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Initialize tracing from the `[logging]` section of the configuration
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    init_tracing_with_config(&config.level, config.json, true)
}

/// Initialize tracing with custom configuration.
///
/// `RUST_LOG` takes precedence over `level` when it is set.
pub fn init_tracing_with_config(level: &str, json_format: bool, include_spans: bool) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}"))?
        }
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let installed = if json_format {
        Registry::default()
            .with(env_filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(include_spans)
                    .with_span_list(include_spans),
            )
            .try_init()
    } else {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
    };
    installed.wrap_err("A global tracing subscriber is already installed")?;

    tracing::info!(
        "fetchgate logging initialized (level: {}, json: {}, spans: {})",
        level,
        json_format,
        include_spans
    );
    Ok(())
}

/// Create a request-scoped tracing span
pub fn create_request_span(method: &str, path: &str, request_id: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        http.method = method,
        http.path = path,
        request.id = request_id,
        http.status_code = tracing::field::Empty,
        urls = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}

/// Create a span for one outbound fetch of a batch
pub fn create_fetch_span(url: &str) -> tracing::Span {
    tracing::debug_span!(
        "fetch",
        upstream.url = url,
        http.status_code = tracing::field::Empty,
    )
}
