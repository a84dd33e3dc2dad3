use anyhow::{Context, Result};
use ledger_link_connector::{config::ConnectorConfig, ConnectionDescriptor};
use ledger_link_logger::LogConfig;
use serde::Deserialize;

const ENV_PREFIX: &str = "LEDGER_LINK";
const DEFAULT_PRESET: &str = "fld";

/// The top-level configuration for the probe binary.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct ProbeConfig {
    #[serde(default)]
    pub connector: ConnectorConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// The network to probe: an explicit descriptor, or one of the built-in presets.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct NetworkConfig {
    pub preset: Option<String>,
    pub custom: Option<ConnectionDescriptor>,
}

impl NetworkConfig {
    pub fn descriptor(&self) -> Result<ConnectionDescriptor> {
        if let Some(custom) = &self.custom {
            return Ok(custom.clone());
        }
        let preset = self.preset.as_deref().unwrap_or(DEFAULT_PRESET);
        Ok(ConnectionDescriptor::preset(preset)?)
    }
}

/// Loads the probe configuration from an optional TOML file plus
/// `LEDGER_LINK__…` environment overrides.
pub fn load_config(path: Option<&str>) -> Result<ProbeConfig> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::with_name(path));
    }
    builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"));

    let settings: ProbeConfig = builder
        .build()
        .context(format!(
            "Failed to build configuration from '{}'",
            path.unwrap_or("<defaults>")
        ))?
        .try_deserialize()
        .context("Failed to deserialize configuration")?;

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_link_connector::{transport::TransportKind, ConnectionParams};
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_without_file() {
        let config = load_config(None).unwrap();
        assert_eq!(config.connector.connection.health_check_timeout_secs, 10);
        assert_eq!(config.network.descriptor().unwrap().id, 10);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn preset_and_overrides_from_file() {
        let file = write_config(
            r#"
            [connector.polling]
            default-interval-ms = 3000

            [network]
            preset = "mainnet-jrpc"

            [log]
            level = "debug"
            format = "json"
            "#,
        );

        let config = load_config(file.path().to_str()).unwrap();
        assert_eq!(config.connector.polling.default_interval_ms, 3000);
        // Untouched keys of a partially specified section keep their defaults.
        assert_eq!(config.connector.polling.intensive_interval_ms, 2000);
        assert_eq!(config.network.descriptor().unwrap().kind(), TransportKind::Jrpc);
        assert_eq!(config.log.format, ledger_link_logger::LogFormat::Json);
    }

    #[test]
    fn custom_descriptor_wins() {
        let file = write_config(
            r#"
            [network]
            preset = "fld"

            [network.custom]
            id = 42
            group = "devnet"

            [network.custom.transport.graphql]
            endpoints = ["localhost:4000"]
            local = true
            "#,
        );

        let config = load_config(file.path().to_str()).unwrap();
        let descriptor = config.network.descriptor().unwrap();
        assert_eq!(descriptor.id, 42);
        assert_eq!(descriptor.group(), "devnet");
        match descriptor.transport {
            ConnectionParams::Graphql(params) => {
                assert_eq!(params.endpoints, vec!["localhost:4000".to_string()]);
                assert!(params.local);
            }
            other => panic!("unexpected transport: {other:?}"),
        }
    }

    #[test]
    fn unknown_preset_is_an_error() {
        let network = NetworkConfig {
            preset: Some("moon".to_string()),
            custom: None,
        };
        assert!(network.descriptor().is_err());
    }
}
