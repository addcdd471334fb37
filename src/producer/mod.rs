use std::collections::HashSet;
use std::process::Command;
use std::thread;

use encoding::EncodingRef;
use tracing::{debug, error, info, warn};

use crate::binlog::value::{encoding_for, render_value};
use crate::binlog::{BinlogEvent, RowAction, RowsEvent};
use crate::cache::{PositionStore, Rcache, Row, ACTION_COLUMN, TS_COLUMN};
use crate::config::CdcConfig;
use crate::error::{CacheError, CdcError, Result};
use crate::meta::{TableMeta, TableMetaCache};
use crate::mysql::MysqlConnector;
use crate::utils::time::now_secs;

const PROGRESS_EVERY: u64 = 1000;

/// The binlog reader. Opens a replication stream at the position
/// store's recorded offset, funnels merged mutations into the staging
/// cache and drives dump triggers. Runs in the calling thread until
/// the stream ends (non-blocking mode) or an error surfaces.
pub struct Producer {
    config: CdcConfig,
    position: PositionStore,
    cache: Rcache,
    charset: EncodingRef,
    events: HashSet<&'static str>,
}

impl Producer {
    pub fn new(config: CdcConfig) -> Result<Producer> {
        config.validate()?;
        let position = PositionStore::from_url(&config.redis_url)?;
        let cache = Rcache::from_url(&config.cache_url, config.server_id)?;
        let charset = encoding_for(&config.mysql.charset);
        let events = config
            .events
            .iter()
            .filter_map(|e| RowAction::from_str(e))
            .map(|a| a.as_str())
            .collect();
        Ok(Producer {
            config,
            position,
            cache,
            charset,
            events,
        })
    }

    pub fn run(&mut self) -> Result<()> {
        let mut meta_connector = MysqlConnector::new(self.config.mysql.clone());
        meta_connector.connect()?;

        // Resume from the stored position; a fresh pipeline starts at
        // the server's current tail.
        let (log_file, log_pos) = match self.position.get()? {
            Some(position) => position,
            None => {
                let tail = meta_connector.master_status()?;
                info!(file = %tail.0, pos = tail.1, "no stored position, starting at the tail");
                tail
            }
        };

        let mut meta_cache = TableMetaCache::new(meta_connector)?;

        let mut stream_connector = MysqlConnector::new(self.config.mysql.clone());
        stream_connector.connect()?;
        let mut stream = stream_connector.start_dump(
            &log_file,
            log_pos,
            self.config.server_id,
            !self.config.blocking,
        )?;

        let mut row_count: u64 = 0;
        while let Some(event) = stream.next_event()? {
            match event {
                BinlogEvent::Rotate {
                    next_file,
                    position,
                } => {
                    self.position.set_file(&next_file)?;
                    self.position.set_pos(position as u32)?;
                    info!(log_file = %next_file, log_position = position, "rotate");
                }
                BinlogEvent::Rows(rows_event) => {
                    if !self.watched(&rows_event) {
                        continue;
                    }
                    row_count += 1;
                    self.handle_rows(&mut meta_cache, rows_event)?;
                    if row_count % PROGRESS_EVERY == 0 {
                        info!("save {} changed rows", row_count);
                    }
                }
            }
        }
        info!("binlog stream ended after {} changed rows", row_count);
        Ok(())
    }

    fn watched(&self, event: &RowsEvent) -> bool {
        if !self.events.contains(event.action.as_str()) {
            return false;
        }
        if let Some(schemas) = &self.config.schemas {
            if !schemas.iter().any(|s| s == &event.schema) {
                return false;
            }
        }
        if let Some(tables) = &self.config.tables {
            if !tables.iter().any(|t| t == &event.table) {
                return false;
            }
        }
        true
    }

    fn handle_rows(&mut self, meta_cache: &mut TableMetaCache, event: RowsEvent) -> Result<()> {
        let latency = now_secs().saturating_sub(event.timestamp as u64);
        if latency > self.config.binlog_max_latency {
            warn!("latency[{}] too large", latency);
        }

        let table = format!("{}.{}", event.schema, event.table);
        let meta = meta_cache.table_meta(event.table_id, &event.schema, &event.table)?;

        let mut key_columns = meta.primary_key();
        if key_columns.is_empty() {
            key_columns = self
                .config
                .tables_without_primary_key
                .get(&table)
                .cloned()
                .unwrap_or_default();
            if key_columns.is_empty() {
                error!(
                    "{} has neither primary_key nor unique key configure",
                    table
                );
                return Err(CdcError::Config(format!(
                    "{} has neither a primary key nor a configured surrogate key",
                    table
                )));
            }
        }

        let rows = self.build_rows(&event, meta);
        match self.cache.save(&table, &key_columns, &rows) {
            Ok(()) => {
                debug!("save {} {} rows to cache", table, rows.len());
            }
            Err(CdcError::Cache(CacheError::SaveIgnore { table, skipped })) => {
                warn!("table[{}]: {} row(s) without a usable key, ignored", table, skipped);
            }
            Err(CdcError::Cache(CacheError::BackendFull(msg))) => {
                info!("cache OOM occured: {}. trigger dump command", msg);
                trigger_dump(&self.config.dump_command);
                // one retry after the dump freed space; a second
                // failure ends the process
                match self.cache.save(&table, &key_columns, &rows) {
                    Ok(()) => {}
                    Err(CdcError::Cache(CacheError::SaveIgnore { table, skipped })) => {
                        warn!(
                            "table[{}]: {} row(s) without a usable key, ignored",
                            table, skipped
                        );
                    }
                    Err(err) => return Err(err),
                }
            }
            Err(err) => return Err(err),
        }

        if self.config.cache_max_rows > 0 {
            let size = self.cache.size()?;
            if size > self.config.cache_max_rows {
                info!(
                    "cache size:{} >= {}, trigger dumping",
                    size, self.config.cache_max_rows
                );
                trigger_dump_async(self.config.dump_command.clone());
            }
        }

        self.position.set_pos(event.log_pos)?;
        Ok(())
    }

    /// One mutation record per affected row: the column names come
    /// from the table meta, values from the row image, plus the two
    /// reserved attributes.
    fn build_rows(&self, event: &RowsEvent, meta: &TableMeta) -> Vec<Row> {
        let ts = now_secs().to_string();
        let mut rows = Vec::with_capacity(event.rows.len());
        for values in &event.rows {
            if values.len() != meta.columns.len() {
                warn!(
                    "{}.{}: {} binlog columns but {} in information_schema",
                    event.schema,
                    event.table,
                    values.len(),
                    meta.columns.len()
                );
            }
            let mut row = Row::new();
            for (column, value) in meta.columns.iter().zip(values) {
                row.insert(
                    column.name.clone(),
                    render_value(value, &column.hint, self.charset),
                );
            }
            row.insert(ACTION_COLUMN.to_string(), event.action.as_str().to_string());
            row.insert(TS_COLUMN.to_string(), ts.clone());
            rows.push(row);
        }
        rows
    }
}

/// Runs the configured dump command and waits for it.
pub fn trigger_dump(command: &str) -> bool {
    if command.is_empty() {
        warn!("no dump command configured");
        return false;
    }
    match Command::new("sh").arg("-c").arg(command).output() {
        Ok(output) if output.status.success() => {
            info!("dump OK!");
            true
        }
        Ok(output) => {
            error!(
                "dump failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            false
        }
        Err(err) => {
            error!("dump failed: {}", err);
            false
        }
    }
}

/// Fire and forget variant for the size threshold trigger.
pub fn trigger_dump_async(command: String) {
    thread::spawn(move || {
        trigger_dump(&command);
    });
}
