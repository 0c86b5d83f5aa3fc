use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::ServerConfig;

/// Prefix for environment overrides, e.g. `FETCHGATE__FETCH__MAX_URLS=10`
pub const ENV_PREFIX: &str = "FETCHGATE";

/// Load configuration from a file using the config crate.
/// Supports TOML, YAML, JSON and INI; environment variables override the file.
pub async fn load_config(config_path: &str) -> Result<ServerConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<ServerConfig> {
    let config_path = Path::new(config_path);

    // Determine file format based on extension
    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Toml,
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .add_source(env_source())
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let server_config: ServerConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    Ok(server_config)
}

/// Defaults overlaid with environment variables only, for running without a file.
pub fn load_config_from_env() -> Result<ServerConfig> {
    let settings = Config::builder()
        .add_source(env_source())
        .build()
        .wrap_err("Failed to build config from environment")?;

    settings
        .try_deserialize()
        .wrap_err("Failed to deserialize config from environment")
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[tokio::test]
    async fn test_load_toml_config() {
        let toml_content = r#"
listen_addr = "127.0.0.1:3000"

[admission]
max_connections = 10
accept_timeout = "250ms"

[fetch]
max_concurrency = 2
fetch_timeout = "2s"
"#;

        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:3000");
        assert_eq!(config.admission.max_connections, 10);
        assert_eq!(config.fetch.max_concurrency, 2);
        assert_eq!(config.fetch.max_urls, 20);
        assert_eq!(config.fetch.fetch_timeout, "2s");
        assert_eq!(config.shutdown.timeout, "5s");
    }

    #[tokio::test]
    async fn test_load_yaml_config() {
        let yaml_content = r#"
listen_addr: "127.0.0.1:3000"
fetch:
  max_urls: 5
logging:
  level: debug
  json: false
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.fetch.max_urls, 5);
        assert_eq!(config.logging.level, "debug");
        assert!(!config.logging.json);
    }

    #[tokio::test]
    async fn test_load_json_config() {
        let json_content = r#"
{
  "listen_addr": "127.0.0.1:3000",
  "shutdown": { "timeout": "1s" }
}
"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:3000");
        assert_eq!(config.shutdown.timeout, "1s");
    }

    #[tokio::test]
    async fn test_missing_file_is_error() {
        let result = load_config("/nonexistent/fetchgate.toml").await;
        assert!(result.is_err());
    }
}
