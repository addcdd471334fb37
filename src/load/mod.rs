//! Recovery path: re-injects a dumped CSV back into the staging
//! cache, the inverse of the dumper.

use std::path::Path;

use tracing::{error, info};

use crate::cache::{Rcache, Row};
use crate::error::{CdcError, Result};

/// The qualified table is encoded in the file basename:
/// `db.table.csv` or `db.table.<suffix>.csv`.
pub fn table_name_from(csv_file: &Path) -> Option<String> {
    let name = csv_file.file_name()?.to_str()?;
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() < 2 {
        return None;
    }
    Some(format!("{}.{}", parts[0], parts[1]))
}

pub fn read_csv(csv_file: &Path) -> Result<Vec<Row>> {
    let mut reader = csv::Reader::from_path(csv_file)?;
    let headers = reader.headers()?.clone();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut row = Row::new();
        for (header, value) in headers.iter().zip(record.iter()) {
            row.insert(header.to_string(), value.to_string());
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Loads one CSV into the cache under the caller-supplied key columns.
pub fn load_csv(cache: &mut Rcache, csv_file: &Path, primary_key: &[String]) -> Result<usize> {
    info!("start load {} to cache", csv_file.display());
    let table = table_name_from(csv_file).ok_or_else(|| {
        CdcError::Config(format!(
            "{} does not encode a qualified table name",
            csv_file.display()
        ))
    })?;
    let rows = read_csv(csv_file)?;
    if let Err(err) = cache.save(&table, primary_key, &rows) {
        error!("load {} failed, reason is {}", table, err);
        return Err(err);
    }
    info!("load {} ok, rows:{}", csv_file.display(), rows.len());
    Ok(rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn table_name_variants() {
        assert_eq!(
            table_name_from(Path::new("/x/db.table.csv")).unwrap(),
            "db.table"
        );
        assert_eq!(
            table_name_from(Path::new("db.table.1754012345.123456.csv")).unwrap(),
            "db.table"
        );
        assert!(table_name_from(Path::new("nodots")).is_none());
    }

    #[test]
    fn csv_roundtrips_into_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.t.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "cdc_action,cdc_ts,id,x").unwrap();
        writeln!(file, "insert,10,1,a").unwrap();
        writeln!(file, "delete,11,2,").unwrap();

        let rows = read_csv(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("id").unwrap(), "1");
        assert_eq!(rows[0].get("cdc_action").unwrap(), "insert");
        assert_eq!(rows[1].get("x").unwrap(), "");
    }
}
