use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;

use chrono::Local;
use crossbeam_channel::{bounded, Sender};
use tracing::{info, warn};

use crate::cache::{Rcache, Row};
use crate::error::Result;
use crate::utils::time::now_micros_suffix;

pub mod upload;

/// Capacity of the dumper-to-uploader handoff queue.
const HANDOFF_CAPACITY: usize = 1024;

/// Groups rows by their column signature. `Row` is an ordered map, so
/// the signature is already the sorted column tuple.
pub fn group_by_field(rows: &[Row]) -> BTreeMap<Vec<String>, Vec<&Row>> {
    let mut groups: BTreeMap<Vec<String>, Vec<&Row>> = BTreeMap::new();
    for row in rows {
        let fields: Vec<String> = row.keys().cloned().collect();
        groups.entry(fields).or_default().push(row);
    }
    groups
}

/// Writes one table's batch under `<dump_dir>/YYYYMMDD/`, one file per
/// column signature. More than one signature means the table was
/// probably altered mid-window; those files get the `.tmp` extension
/// so ingestion can quarantine them. Finished files go to `sink` for
/// the uploader.
pub fn save2csv(
    dump_dir: &Path,
    table: &str,
    rows: Vec<Row>,
    sink: Option<&Sender<Option<PathBuf>>>,
) -> Result<()> {
    if rows.is_empty() {
        info!("table[{}] has no rows to dump", table);
        return Ok(());
    }
    let groups = group_by_field(&rows);
    let table_alter = groups.len() > 1;
    if table_alter {
        warn!("table[{}] maybe altered.", table);
    }
    let save_dir = dump_dir.join(Local::now().format("%Y%m%d").to_string());
    fs::create_dir_all(&save_dir)?;
    let suffix = if table_alter { "tmp" } else { "csv" };

    for (fields, group) in &groups {
        let csv_file = save_dir.join(format!("{}.{}.{}", table, now_micros_suffix(), suffix));
        info!("dump to {}, rows:{}", csv_file.display(), group.len());
        let exists = csv_file.exists();
        let file = OpenOptions::new().create(true).append(true).open(&csv_file)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if !exists {
            writer.write_record(fields)?;
        }
        for row in group {
            writer.write_record(
                fields
                    .iter()
                    .map(|f| row.get(f).map(String::as_str).unwrap_or("")),
            )?;
        }
        writer.flush()?;
        drop(writer);
        info!("{} dump Done.", csv_file.display());
        if let Some(sink) = sink {
            info!("dispatch {} to upload queue", csv_file.display());
            let _ = sink.send(Some(csv_file));
        }
    }
    info!("table:{}, rows:{} dump OK!", table, rows.len());
    Ok(())
}

/// Full dump run: drains the cache table by table into CSV files and,
/// when an object store URL is given, pumps the finished files through
/// the background uploader.
pub fn run_dump(
    cache: &mut Rcache,
    dump_dir: &Path,
    max_rows: usize,
    tables: &[String],
    gs_url: Option<&str>,
    server_id: u32,
) -> Result<()> {
    let mut sender: Option<Sender<Option<PathBuf>>> = None;
    let mut uploader: Option<thread::JoinHandle<()>> = None;
    if let Some(gs_url) = gs_url {
        let destination = format!("{}/{}", gs_url.trim_end_matches('/'), server_id);
        let (tx, rx) = bounded::<Option<PathBuf>>(HANDOFF_CAPACITY);
        info!("upload csv files to {} thread running...", destination);
        uploader = Some(thread::spawn(move || upload::upload_worker(rx, destination)));
        sender = Some(tx);
    }

    info!("start dump from cache to csv files");
    let table_filter = if tables.is_empty() { None } else { Some(tables) };
    let result = cache.dump_by_table(
        |table, rows| save2csv(dump_dir, table, rows, sender.as_ref()),
        max_rows,
        table_filter,
    );

    if let (Some(tx), Some(handle)) = (sender, uploader) {
        info!("wait csv files uploading completed......");
        let _ = tx.send(None);
        let _ = handle.join();
    }
    result?;
    info!("dump complete!");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ACTION_COLUMN, TS_COLUMN};

    fn row(pairs: &[(&str, &str)]) -> Row {
        let mut row = Row::new();
        row.insert(ACTION_COLUMN.to_string(), "insert".to_string());
        row.insert(TS_COLUMN.to_string(), "10".to_string());
        for (k, v) in pairs {
            row.insert(k.to_string(), v.to_string());
        }
        row
    }

    #[test]
    fn uniform_rows_form_one_group() {
        let rows = vec![row(&[("id", "1"), ("x", "a")]), row(&[("id", "2"), ("x", "b")])];
        let groups = group_by_field(&rows);
        assert_eq!(groups.len(), 1);
        let fields: Vec<String> = groups.keys().next().unwrap().clone();
        assert_eq!(fields, vec!["cdc_action", "cdc_ts", "id", "x"]);
    }

    #[test]
    fn drifted_rows_split_into_groups() {
        let rows = vec![
            row(&[("id", "1"), ("x", "a")]),
            row(&[("id", "2"), ("x", "b"), ("y", "c")]),
        ];
        let groups = group_by_field(&rows);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn dump_writes_sorted_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![row(&[("id", "1"), ("x", "a")])];
        save2csv(dir.path(), "db.t", rows, None).unwrap();

        let day_dir = dir
            .path()
            .join(Local::now().format("%Y%m%d").to_string());
        let files: Vec<_> = fs::read_dir(&day_dir).unwrap().collect();
        assert_eq!(files.len(), 1);
        let path = files[0].as_ref().unwrap().path();
        assert_eq!(path.extension().unwrap(), "csv");
        let content = fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next().unwrap(), "cdc_action,cdc_ts,id,x");
        assert_eq!(lines.next().unwrap(), "insert,10,1,a");
    }

    #[test]
    fn drifted_dump_quarantines_with_tmp_extension() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![
            row(&[("id", "1"), ("x", "a")]),
            row(&[("id", "2"), ("x", "b"), ("y", "c")]),
        ];
        save2csv(dir.path(), "db.t", rows, None).unwrap();

        let day_dir = dir
            .path()
            .join(Local::now().format("%Y%m%d").to_string());
        let mut extensions: Vec<String> = fs::read_dir(&day_dir)
            .unwrap()
            .map(|e| {
                e.unwrap()
                    .path()
                    .extension()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        extensions.sort();
        assert_eq!(extensions, vec!["tmp", "tmp"]);
    }
}
