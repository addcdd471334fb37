use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{CdcError, Result};
use crate::mysql::MysqlSettings;

fn default_true() -> bool {
    true
}

fn default_events() -> Vec<String> {
    vec!["insert".into(), "update".into(), "delete".into()]
}

fn default_latency() -> u64 {
    60_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_rows() -> usize {
    1_000_000
}

/// Producer configuration, the JSON equivalent of the original config
/// record. `redis_url` holds the binlog position (database N),
/// `cache_url` the staging cache (database N + 1).
#[derive(Debug, Clone, Deserialize)]
pub struct CdcConfig {
    pub redis_url: String,
    pub cache_url: String,
    pub server_id: u32,
    pub mysql: MysqlSettings,
    /// Watched schemas; everything when absent.
    #[serde(default)]
    pub schemas: Option<Vec<String>>,
    /// Watched tables; everything when absent.
    #[serde(default)]
    pub tables: Option<Vec<String>>,
    /// Surrogate unique keys for qualified tables without a primary
    /// key.
    #[serde(default)]
    pub tables_without_primary_key: HashMap<String, Vec<String>>,
    /// Park on the stream tail (true) or exit once it is reached.
    #[serde(default = "default_true")]
    pub blocking: bool,
    /// Subset of insert/update/delete to watch.
    #[serde(default = "default_events")]
    pub events: Vec<String>,
    /// Dump trigger threshold; 0 turns the trigger off.
    #[serde(default)]
    pub cache_max_rows: u64,
    /// Latency warning threshold in seconds.
    #[serde(default = "default_latency")]
    pub binlog_max_latency: u64,
    #[serde(default)]
    pub dump_command: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl CdcConfig {
    pub fn from_file(path: &Path) -> Result<CdcConfig> {
        let file = File::open(path)
            .map_err(|err| CdcError::Config(format!("cannot open {}: {}", path.display(), err)))?;
        let config: CdcConfig = serde_json::from_reader(file)
            .map_err(|err| CdcError::Config(format!("cannot parse {}: {}", path.display(), err)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for event in &self.events {
            if !matches!(event.as_str(), "insert" | "update" | "delete") {
                return Err(CdcError::Config(format!("unknown event type '{}'", event)));
            }
        }
        if self.events.is_empty() {
            return Err(CdcError::Config("no watched event types".into()));
        }
        Ok(())
    }
}

/// The dump tool's `-c` config file, the original `dump.conf` shape.
#[derive(Debug, Clone, Deserialize)]
pub struct DumpConfig {
    pub cache_url: String,
    pub server_id: u32,
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
    pub dump_dir: PathBuf,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub gs_url: Option<String>,
}

impl DumpConfig {
    pub fn from_file(path: &Path) -> Result<DumpConfig> {
        let file = File::open(path)
            .map_err(|err| CdcError::Config(format!("cannot open {}: {}", path.display(), err)))?;
        serde_json::from_reader(file)
            .map_err(|err| CdcError::Config(format!("cannot parse {}: {}", path.display(), err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn minimal_producer_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "redis_url": "redis://127.0.0.1/0",
                "cache_url": "redis://127.0.0.1/1",
                "server_id": 1,
                "mysql": {{"host": "127.0.0.1", "user": "repl", "password": "x"}},
                "tables_without_primary_key": {{"db_test.task_test": ["uuid"]}}
            }}"#
        )
        .unwrap();
        let config = CdcConfig::from_file(file.path()).unwrap();
        assert!(config.blocking);
        assert_eq!(config.mysql.port, 3306);
        assert_eq!(config.events, vec!["insert", "update", "delete"]);
        assert_eq!(
            config.tables_without_primary_key["db_test.task_test"],
            vec!["uuid"]
        );
    }

    #[test]
    fn bad_event_type_is_a_config_fault() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "redis_url": "redis://127.0.0.1/0",
                "cache_url": "redis://127.0.0.1/1",
                "server_id": 1,
                "mysql": {{"host": "127.0.0.1", "user": "repl"}},
                "events": ["upsert"]
            }}"#
        )
        .unwrap();
        let err = CdcConfig::from_file(file.path()).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }
}
