//! Layered configuration loading
//!
//! Priority (highest first): environment variables with the service prefix,
//! the configuration file, then the serde defaults of the target type.

use std::path::Path;

use figment::providers::{Env, Format, Json, Toml, Yaml};
use figment::Figment;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info};

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Unsupported config format: {0} (expected yaml, yml, json or toml)")]
    UnsupportedFormat(String),

    #[error("Config parse error: {0}")]
    Parse(#[from] Box<figment::Error>),
}

impl From<figment::Error> for ConfigLoadError {
    fn from(err: figment::Error) -> Self {
        ConfigLoadError::Parse(Box::new(err))
    }
}

/// Build the figment for `path` without extracting it
///
/// Nested keys in the environment are separated by `__`, so
/// `ECHOSRV_MQTT__BROKER` overrides `mqtt.broker`.
pub fn figment_for(path: &Path, env_prefix: &str) -> Result<Figment, ConfigLoadError> {
    if !path.exists() {
        return Err(ConfigLoadError::NotFound(path.display().to_string()));
    }

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let figment = match extension.as_str() {
        "yaml" | "yml" => Figment::new().merge(Yaml::file(path)),
        "json" => Figment::new().merge(Json::file(path)),
        "toml" => Figment::new().merge(Toml::file(path)),
        other => return Err(ConfigLoadError::UnsupportedFormat(other.to_string())),
    };

    debug!("Config source: {} (env prefix {})", path.display(), env_prefix);
    Ok(figment.merge(Env::prefixed(env_prefix).split("__")))
}

/// Load and deserialize a configuration file with environment overrides
pub fn load_config<T: DeserializeOwned>(path: &Path, env_prefix: &str) -> Result<T, ConfigLoadError> {
    let config = figment_for(path, env_prefix)?.extract()?;
    info!("Loaded config from {}", path.display());
    Ok(config)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Debug, Deserialize)]
    struct Sample {
        name: String,
        #[serde(default)]
        port: u16,
    }

    fn write_temp(suffix: &str, body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_yaml() {
        let file = write_temp(".yaml", "name: bridge\nport: 3610\n");
        let sample: Sample = load_config(file.path(), "CFGTEST_YAML_").unwrap();
        assert_eq!(sample.name, "bridge");
        assert_eq!(sample.port, 3610);
    }

    #[test]
    fn test_load_json_with_defaults() {
        let file = write_temp(".json", r#"{"name": "bridge"}"#);
        let sample: Sample = load_config(file.path(), "CFGTEST_JSON_").unwrap();
        assert_eq!(sample.port, 0);
    }

    #[test]
    fn test_missing_file() {
        let err = load_config::<Sample>(Path::new("/nonexistent/echosrv.yaml"), "X_").unwrap_err();
        assert!(matches!(err, ConfigLoadError::NotFound(_)));
    }

    #[test]
    fn test_unsupported_extension() {
        let file = write_temp(".ini", "name=bridge\n");
        let err = load_config::<Sample>(file.path(), "X_").unwrap_err();
        assert!(matches!(err, ConfigLoadError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_parse_error() {
        let file = write_temp(".toml", "port = \"not a number\"\n");
        let err = load_config::<Sample>(file.path(), "CFGTEST_BAD_").unwrap_err();
        assert!(matches!(err, ConfigLoadError::Parse(_)));
    }
}
