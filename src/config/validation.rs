#![allow(clippy::collapsible_if)]

use std::{net::SocketAddr, time::Duration};

use eyre::Result;
use tracing_subscriber::EnvFilter;

use crate::config::models::{AdmissionConfig, FetchConfig, LoggingConfig, ServerConfig, ShutdownConfig};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Server configuration validator
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire server configuration, collecting every problem.
    pub fn validate(config: &ServerConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        errors.extend(Self::validate_admission(&config.admission));
        errors.extend(Self::validate_fetch(&config.fetch));
        errors.extend(Self::validate_shutdown(&config.shutdown));
        errors.extend(Self::validate_logging(&config.logging));

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_admission(config: &AdmissionConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if config.max_connections == 0 {
            errors.push(Self::invalid("admission.max_connections", "must be at least 1"));
        }

        match config.accept_timeout() {
            Ok(Some(timeout)) if timeout.is_zero() => {
                errors.push(Self::invalid("admission.accept_timeout", "must be greater than zero"));
            }
            Ok(_) => {}
            Err(message) => errors.push(Self::invalid("admission.accept_timeout", &message)),
        }

        errors
    }

    fn validate_fetch(config: &FetchConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if config.max_urls == 0 {
            errors.push(Self::invalid("fetch.max_urls", "must be at least 1"));
        }
        if config.max_concurrency == 0 {
            errors.push(Self::invalid("fetch.max_concurrency", "must be at least 1"));
        }
        if config.max_body_bytes == 0 {
            errors.push(Self::invalid("fetch.max_body_bytes", "must be at least 1"));
        }

        let fetch_timeout = Self::positive_duration("fetch.fetch_timeout", config.fetch_timeout(), &mut errors);
        let request_deadline =
            Self::positive_duration("fetch.request_deadline", config.request_deadline(), &mut errors);
        let join_timeout = Self::positive_duration("fetch.join_timeout", config.join_timeout(), &mut errors);

        if let (Some(fetch), Some(deadline)) = (fetch_timeout, request_deadline) {
            if fetch > deadline {
                errors.push(Self::invalid(
                    "fetch.fetch_timeout",
                    "must not exceed fetch.request_deadline",
                ));
            }
        }
        if let (Some(deadline), Some(join)) = (request_deadline, join_timeout) {
            if deadline > join {
                errors.push(Self::invalid(
                    "fetch.request_deadline",
                    "must not exceed fetch.join_timeout",
                ));
            }
        }

        if let Some(user_agent) = &config.user_agent {
            if hyper::header::HeaderValue::from_str(user_agent).is_err() {
                errors.push(Self::invalid("fetch.user_agent", "is not a valid header value"));
            }
        }

        errors
    }

    fn validate_shutdown(config: &ShutdownConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        Self::positive_duration("shutdown.timeout", config.timeout(), &mut errors);
        errors
    }

    fn validate_logging(config: &LoggingConfig) -> Vec<ValidationError> {
        match EnvFilter::try_new(&config.level) {
            Ok(_) => Vec::new(),
            Err(e) => vec![Self::invalid("logging.level", &e.to_string())],
        }
    }

    fn positive_duration(
        field: &str,
        parsed: Result<Duration, String>,
        errors: &mut Vec<ValidationError>,
    ) -> Option<Duration> {
        match parsed {
            Ok(duration) if duration.is_zero() => {
                errors.push(Self::invalid(field, "must be greater than zero"));
                None
            }
            Ok(duration) => Some(duration),
            Err(message) => {
                errors.push(Self::invalid(field, &message));
                None
            }
        }
    }

    fn invalid(field: &str, message: &str) -> ValidationError {
        ValidationError::InvalidField {
            field: field.to_string(),
            message: message.to_string(),
        }
    }

    /// Format multiple validation errors into a readable message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        let mut message = format!("Found {} configuration error(s):\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
