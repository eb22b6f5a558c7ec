// ⚙️ Pipeline Configuration - loaded from YAML
// Every field has a serde default; a partial or missing file still works.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, PipelineResult};

/// SQLite ledger location and tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Milliseconds SQLite waits on a locked database before failing
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./ledger.db")
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Normalizer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Currency applied when a source row carries none
    #[serde(default = "default_base_currency")]
    pub base_currency: String,
    /// chrono formats, tried in order
    #[serde(default = "default_date_formats")]
    pub date_formats: Vec<String>,
    #[serde(default = "default_max_description_len")]
    pub max_description_len: usize,
    #[serde(default = "default_max_counterparty_len")]
    pub max_counterparty_len: usize,
    /// When an amount carries no sign and no direction, guess from the text
    /// instead of rejecting the row as incomplete
    #[serde(default = "default_true")]
    pub infer_unsigned_direction: bool,
}

fn default_base_currency() -> String {
    "INR".to_string()
}

fn default_date_formats() -> Vec<String> {
    [
        "%Y-%m-%d",
        "%d/%m/%Y",
        "%d-%m-%Y",
        "%m/%d/%Y",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_max_description_len() -> usize {
    1000
}

fn default_max_counterparty_len() -> usize {
    255
}

fn default_true() -> bool {
    true
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            base_currency: default_base_currency(),
            date_formats: default_date_formats(),
            max_description_len: default_max_description_len(),
            max_counterparty_len: default_max_counterparty_len(),
            infer_unsigned_direction: true,
        }
    }
}

/// Optional external taxonomy / rules files. Built-in defaults otherwise.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaxonomyConfig {
    #[serde(default)]
    pub taxonomy_path: Option<PathBuf>,
    #[serde(default)]
    pub rules_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Batches allowed to run at the same time
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,
}

fn default_max_concurrent_batches() -> usize {
    4
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_batches: default_max_concurrent_batches(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KpiConfig {
    /// Rows fetched per page by the lazy KPI cursor
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_page_size() -> usize {
    500
}

impl Default for KpiConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub taxonomy: TaxonomyConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub kpi: KpiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl PipelineConfig {
    /// Load from a YAML file. A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> PipelineResult<Self> {
        let config: PipelineConfig = serde_yaml::from_str(content)
            .map_err(|e| PipelineError::Config(format!("invalid YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        let currency = &self.ingest.base_currency;
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(PipelineError::Config(format!(
                "ingest.base_currency must be a 3-letter code, got {:?}",
                currency
            )));
        }
        if self.ingest.date_formats.is_empty() {
            return Err(PipelineError::Config(
                "ingest.date_formats must not be empty".to_string(),
            ));
        }
        if self.kpi.page_size == 0 {
            return Err(PipelineError::Config("kpi.page_size must be > 0".to_string()));
        }
        if self.workers.max_concurrent_batches == 0 {
            return Err(PipelineError::Config(
                "workers.max_concurrent_batches must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Base currency, upper-cased
    pub fn base_currency(&self) -> String {
        self.ingest.base_currency.to_uppercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.base_currency(), "INR");
        assert_eq!(config.ingest.date_formats[0], "%Y-%m-%d");
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let config = PipelineConfig::from_yaml(
            "ingest:\n  base_currency: usd\nworkers:\n  max_concurrent_batches: 2\n",
        )
        .unwrap();

        assert_eq!(config.base_currency(), "USD");
        assert_eq!(config.workers.max_concurrent_batches, 2);
        assert_eq!(config.kpi.page_size, 500);
        assert_eq!(config.ingest.max_description_len, 1000);
    }

    #[test]
    fn test_rejects_bad_currency() {
        let err = PipelineConfig::from_yaml("ingest:\n  base_currency: dollars\n").unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_rejects_zero_page_size() {
        assert!(PipelineConfig::from_yaml("kpi:\n  page_size: 0\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "database:\n  path: /tmp/x.db\nlogging:\n  level: debug").unwrap();

        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config.database.path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = PipelineConfig::load("/definitely/not/here.yaml").unwrap();
        assert_eq!(config.server.port, 3000);
    }
}
