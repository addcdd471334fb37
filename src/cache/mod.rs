//! The staging cache: for every qualified table it keeps the pending
//! net effect of all observed mutations, one hash per primary key.
//!
//! Key layout under one numeric server id namespace:
//!
//! ```text
//! {sid}#{schema.table}.{rid}    hash, the row's net effect
//! {sid}#row_ids#{schema.table}  set, pending rids of the table
//! {sid}#locking                 lease token, SET NX EX 60
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use redis::{Client, Commands, Connection};
use tracing::{debug, warn};

use crate::error::{CacheError, Result};

pub mod position;

pub use position::PositionStore;

/// A mutation record: column name to string value, plus the two
/// reserved attributes below.
pub type Row = BTreeMap<String, String>;

pub const ACTION_COLUMN: &str = "cdc_action";
pub const TS_COLUMN: &str = "cdc_ts";

const LOCK_TTL_SECS: u64 = 60;
const LOCK_REFRESH_SECS: u64 = LOCK_TTL_SECS - 10;
const LOCK_POLL_SECS: u64 = 1;
const SCAN_COUNT: usize = 100;
const SSCAN_COUNT: usize = 1000;

pub struct Rcache {
    client: Client,
    conn: Connection,
    locking_key: String,
    key_prefix: String,
    row_ids_prefix: String,
}

impl Rcache {
    pub fn from_url(url: &str, server_id: u32) -> Result<Rcache> {
        let client = Client::open(url).map_err(CacheError::from)?;
        let conn = client.get_connection().map_err(CacheError::from)?;
        Ok(Rcache {
            client,
            conn,
            locking_key: format!("{}#locking", server_id),
            key_prefix: format!("{}#", server_id),
            row_ids_prefix: format!("{}#row_ids#", server_id),
        })
    }

    /// Advisory entry count (rid sets included), used by the producer
    /// for threshold-based dump triggering.
    pub fn size(&mut self) -> Result<u64> {
        let size: u64 = redis::cmd("DBSIZE")
            .query(&mut self.conn)
            .map_err(CacheError::from)?;
        Ok(size)
    }

    /// Qualified names of all tables with pending rows.
    pub fn tables(&mut self) -> Result<Vec<String>> {
        let offset = self.row_ids_prefix.len();
        Ok(self
            .scan_row_id_keys()?
            .into_iter()
            .map(|key| key[offset..].to_string())
            .collect())
    }

    /// Unconditional removal of everything in the cache database.
    pub fn clear(&mut self) -> Result<()> {
        redis::cmd("FLUSHDB")
            .query::<()>(&mut self.conn)
            .map_err(CacheError::from)?;
        Ok(())
    }

    /// Merges `rows` into the cache under their derived rids.
    ///
    /// Rows with no derivable rid or broken reserved attributes are
    /// skipped; the well formed rows of the same call are still merged
    /// and the skip count is then reported as `SaveIgnore`. A write
    /// rejected for memory surfaces as `BackendFull`.
    pub fn save(&mut self, table: &str, key_columns: &[String], rows: &[Row]) -> Result<()> {
        self.acquire_lock()?;
        let result = self.save_locked(table, key_columns, rows);
        let freed = self.free_lock();
        result?;
        freed?;
        Ok(())
    }

    fn save_locked(&mut self, table: &str, key_columns: &[String], rows: &[Row]) -> Result<()> {
        let row_ids_key = format!("{}{}", self.row_ids_prefix, table);
        let mut skipped = 0usize;
        for row in rows {
            let rid = match gen_rid(row, key_columns) {
                Some(rid) if valid_reserved(row) => rid,
                _ => {
                    skipped += 1;
                    continue;
                }
            };
            let key = format!("{}{}.{}", self.key_prefix, table, rid);
            let old: HashMap<String, String> =
                self.conn.hgetall(&key).map_err(CacheError::from)?;
            let old: Option<Row> = if old.is_empty() {
                None
            } else {
                Some(old.into_iter().collect())
            };
            match merge_row(old, row.clone(), table) {
                Some(merged) => {
                    let items: Vec<(String, String)> = merged.into_iter().collect();
                    let _: () = self
                        .conn
                        .hset_multiple(&key, &items)
                        .map_err(oom_to_full)?;
                    let _: () = self.conn.sadd(&row_ids_key, &rid).map_err(oom_to_full)?;
                }
                None => {
                    // annihilated: insert then delete inside the window
                    let _: () = self.conn.del(&key).map_err(CacheError::from)?;
                    let _: () = self.conn.srem(&row_ids_key, &rid).map_err(CacheError::from)?;
                }
            }
        }
        if skipped > 0 {
            return Err(CacheError::SaveIgnore {
                table: table.to_string(),
                skipped,
            }
            .into());
        }
        Ok(())
    }

    /// Streams each pending table to `callback` in chunks of at most
    /// `max_rows` rows (0 means unbounded) and deletes a table's
    /// entries once its final chunk was accepted. `tables` narrows the
    /// dump to the given qualified names.
    pub fn dump_by_table<F>(
        &mut self,
        mut callback: F,
        max_rows: usize,
        tables: Option<&[String]>,
    ) -> Result<()>
    where
        F: FnMut(&str, Vec<Row>) -> Result<()>,
    {
        self.acquire_lock()?;
        let refresher = LeaseRefresher::start(self.client.clone(), self.locking_key.clone());
        let result = self.dump_tables_locked(&mut callback, max_rows, tables, &refresher);
        refresher.cancel();
        let freed = self.free_lock();
        result?;
        freed?;
        Ok(())
    }

    fn dump_tables_locked<F>(
        &mut self,
        callback: &mut F,
        max_rows: usize,
        tables: Option<&[String]>,
        refresher: &LeaseRefresher,
    ) -> Result<()>
    where
        F: FnMut(&str, Vec<Row>) -> Result<()>,
    {
        let tables: Vec<String> = match tables {
            Some(named) if !named.is_empty() => named.to_vec(),
            _ => self.tables()?,
        };
        for table in tables {
            let row_ids_key = format!("{}{}", self.row_ids_prefix, table);
            let rids = self.scan_set(&row_ids_key)?;
            let mut batch: Vec<Row> = Vec::new();
            for rid in &rids {
                let key = format!("{}{}.{}", self.key_prefix, table, rid);
                let row: HashMap<String, String> =
                    self.conn.hgetall(&key).map_err(CacheError::from)?;
                if row.is_empty() {
                    continue;
                }
                batch.push(row.into_iter().collect());
                if max_rows > 0 && batch.len() >= max_rows {
                    callback(&table, std::mem::take(&mut batch))?;
                }
            }
            callback(&table, std::mem::take(&mut batch))?;
            if refresher.lost() {
                return Err(CacheError::LeaseLost.into());
            }
            self.clear_table(&table)?;
            debug!(table = %table, rows = rids.len(), "table drained");
        }
        Ok(())
    }

    /// Yields every `(table, row)` pair, then clears the whole cache.
    pub fn dump_by_row<F>(&mut self, mut callback: F) -> Result<()>
    where
        F: FnMut(&str, Row) -> Result<()>,
    {
        self.acquire_lock()?;
        let refresher = LeaseRefresher::start(self.client.clone(), self.locking_key.clone());
        let result = self.dump_rows_locked(&mut callback, &refresher);
        refresher.cancel();
        let freed = self.free_lock();
        result?;
        freed?;
        Ok(())
    }

    fn dump_rows_locked<F>(&mut self, callback: &mut F, refresher: &LeaseRefresher) -> Result<()>
    where
        F: FnMut(&str, Row) -> Result<()>,
    {
        let offset = self.row_ids_prefix.len();
        for row_ids_key in self.scan_row_id_keys()? {
            let table = row_ids_key[offset..].to_string();
            for rid in self.scan_set(&row_ids_key)? {
                let key = format!("{}{}.{}", self.key_prefix, table, rid);
                let row: HashMap<String, String> =
                    self.conn.hgetall(&key).map_err(CacheError::from)?;
                if row.is_empty() {
                    continue;
                }
                callback(&table, row.into_iter().collect())?;
            }
        }
        if refresher.lost() {
            return Err(CacheError::LeaseLost.into());
        }
        self.clear()
    }

    fn clear_table(&mut self, table: &str) -> Result<()> {
        let row_ids_key = format!("{}{}", self.row_ids_prefix, table);
        let rids: Vec<String> = self.conn.smembers(&row_ids_key).map_err(CacheError::from)?;
        let mut keys: Vec<String> = rids
            .iter()
            .map(|rid| format!("{}{}.{}", self.key_prefix, table, rid))
            .collect();
        keys.push(row_ids_key);
        let _: () = self.conn.del(keys).map_err(CacheError::from)?;
        Ok(())
    }

    fn scan_row_id_keys(&mut self) -> Result<Vec<String>> {
        let pattern = format!("{}*", self.row_ids_prefix);
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query(&mut self.conn)
                .map_err(CacheError::from)?;
            keys.extend(page);
            cursor = next;
            if cursor == 0 {
                return Ok(keys);
            }
        }
    }

    fn scan_set(&mut self, key: &str) -> Result<Vec<String>> {
        let mut members = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, page): (u64, Vec<String>) = redis::cmd("SSCAN")
                .arg(key)
                .arg(cursor)
                .arg("COUNT")
                .arg(SSCAN_COUNT)
                .query(&mut self.conn)
                .map_err(CacheError::from)?;
            members.extend(page);
            cursor = next;
            if cursor == 0 {
                return Ok(members);
            }
        }
    }

    /// Blocking lease acquisition, polling once a second like the
    /// original; the token is SET NX with the 60 s TTL.
    fn acquire_lock(&mut self) -> Result<()> {
        loop {
            if self.try_lock(LOCK_TTL_SECS)? {
                return Ok(());
            }
            thread::sleep(Duration::from_secs(LOCK_POLL_SECS));
        }
    }

    fn try_lock(&mut self, ttl: u64) -> Result<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(&self.locking_key)
            .arg("")
            .arg("EX")
            .arg(ttl)
            .arg("NX")
            .query(&mut self.conn)
            .map_err(CacheError::from)?;
        Ok(reply.is_some())
    }

    fn free_lock(&mut self) -> Result<()> {
        let _: () = self.conn.del(&self.locking_key).map_err(CacheError::from)?;
        Ok(())
    }
}

/// Background lease renewal for the duration of a dump. A refresh that
/// finds the token gone (backend eviction) raises the lost flag; the
/// dump checks it before every clear.
struct LeaseRefresher {
    cancel: Sender<()>,
    lost: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl LeaseRefresher {
    fn start(client: Client, locking_key: String) -> LeaseRefresher {
        let (cancel, canceled) = bounded::<()>(1);
        let lost = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&lost);
        let handle = thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(%err, "lease refresher could not connect");
                    flag.store(true, Ordering::SeqCst);
                    return;
                }
            };
            loop {
                match canceled.recv_timeout(Duration::from_secs(LOCK_REFRESH_SECS)) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                    Err(RecvTimeoutError::Timeout) => {
                        let refreshed: std::result::Result<i64, redis::RedisError> =
                            conn.expire(&locking_key, LOCK_TTL_SECS as i64);
                        match refreshed {
                            Ok(1) => {}
                            other => {
                                warn!(?other, "lease refresh failed");
                                flag.store(true, Ordering::SeqCst);
                                return;
                            }
                        }
                    }
                }
            }
        });
        LeaseRefresher {
            cancel,
            lost,
            handle: Some(handle),
        }
    }

    fn lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    fn cancel(mut self) {
        let _ = self.cancel.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn oom_to_full(err: redis::RedisError) -> CacheError {
    if err.to_string().contains("OOM command not allowed") {
        CacheError::BackendFull(err.to_string())
    } else {
        CacheError::Redis(err)
    }
}

/// Rid of a row: the `&`-joined stringified key column values in
/// declared order. `None` when a key column is missing.
pub fn gen_rid(row: &Row, key_columns: &[String]) -> Option<String> {
    if key_columns.is_empty() {
        return None;
    }
    let mut parts = Vec::with_capacity(key_columns.len());
    for column in key_columns {
        parts.push(row.get(column)?.as_str());
    }
    Some(parts.join("&"))
}

fn valid_reserved(row: &Row) -> bool {
    let action_ok = matches!(
        row.get(ACTION_COLUMN).map(String::as_str),
        Some("insert") | Some("update") | Some("delete")
    );
    let ts_ok = row
        .get(TS_COLUMN)
        .map(|ts| ts.parse::<f64>().is_ok())
        .unwrap_or(false);
    action_ok && ts_ok
}

/// The merge state machine. The stored record is the net effect of the
/// covered window:
///
/// ```text
/// old \ new   insert       update        delete
/// (absent)    insert       update        delete
/// insert      update       insert        annihilate
/// update      update       update        delete
/// delete      update       update, warn  delete
/// ```
///
/// Insert after insert or update means a truncate or out-of-order
/// event slipped in; demoting to update makes the downstream loader
/// upsert instead of tripping on a duplicate key.
pub fn merge_row(old: Option<Row>, mut new: Row, table: &str) -> Option<Row> {
    let old = match old {
        Some(old) => old,
        None => return Some(new),
    };
    let old_action = old.get(ACTION_COLUMN).cloned().unwrap_or_default();
    let new_action = new.get(ACTION_COLUMN).cloned().unwrap_or_default();

    match (old_action.as_str(), new_action.as_str()) {
        ("insert", "delete") => None,
        ("insert", "update") => {
            new.insert(ACTION_COLUMN.to_string(), "insert".to_string());
            Some(new)
        }
        ("insert", "insert") | ("update", "insert") | ("delete", "insert") => {
            new.insert(ACTION_COLUMN.to_string(), "update".to_string());
            Some(new)
        }
        ("delete", "update") => {
            warn!(table, "update follows delete, storing the update as is");
            Some(new)
        }
        _ => Some(new),
    }
}
