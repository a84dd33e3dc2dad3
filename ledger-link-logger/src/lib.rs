//! Tracing subscriber setup shared by the ledger-link binaries.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::{fs::File, str::FromStr, sync::Mutex};
use tracing::Level;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{self, writer::BoxMakeWriter},
    prelude::*,
};

#[derive(Debug, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Plain,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    File,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "kebab-case")]
pub struct LogConfig {
    /// Default level. `RUST_LOG` directives take precedence when set.
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
    pub file_path: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            output: LogOutput::default(),
            file_path: None,
        }
    }
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init(config: &LogConfig) -> Result<()> {
    let writer = make_writer(config)?;
    let ansi = config.output == LogOutput::Stdout;

    let layer = match config.format {
        LogFormat::Json => fmt::layer().with_writer(writer).json().boxed(),
        LogFormat::Plain => fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi)
            .pretty()
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(level_filter(&config.level))
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {e}"))
}

fn level_filter(level: &str) -> EnvFilter {
    let level = Level::from_str(level).unwrap_or(Level::INFO);
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy()
}

fn make_writer(config: &LogConfig) -> Result<BoxMakeWriter> {
    match config.output {
        LogOutput::Stdout => Ok(BoxMakeWriter::new(std::io::stdout)),
        LogOutput::File => {
            let file_path = config
                .file_path
                .as_deref()
                .ok_or_else(|| anyhow!("Log output is 'file' but 'file_path' is not specified"))?;
            let log_file = File::create(file_path)?;
            Ok(BoxMakeWriter::new(Mutex::new(log_file)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_output_requires_path() {
        let config = LogConfig {
            output: LogOutput::File,
            ..Default::default()
        };
        let err = init(&config).unwrap_err();
        assert!(err.to_string().contains("file_path"));
    }

    #[test]
    fn file_writer_creates_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.log");
        let config = LogConfig {
            output: LogOutput::File,
            file_path: Some(path.to_string_lossy().into_owned()),
            ..Default::default()
        };
        make_writer(&config).unwrap();
        assert!(path.exists());
    }
}
