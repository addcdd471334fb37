//! Warehouse schema bootstrap: turns `information_schema.columns` into
//! one JSON schema file per table, the shape the warehouse loader
//! expects alongside the dumped CSVs.

use std::fs::{self, File};
use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::error::{CdcError, Result};
use crate::mysql::MysqlConnector;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SchemaColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

/// MySQL data type to warehouse type.
pub fn type_trans(mysql_type: &str) -> &'static str {
    match mysql_type {
        "tinyint" | "smallint" | "mediumint" | "int" | "bigint" | "bit" => "integer",
        "decimal" | "float" | "double" => "float",
        "datetime" | "timestamp" => "timestamp",
        // char/text/blob/enum/set families, date/time/year and
        // anything unknown all load as strings
        _ => "string",
    }
}

/// The per-table schema: every column plus the two reserved CDC
/// attributes, sorted by name like the CSV headers.
pub fn table_schema(columns: &[(String, String)]) -> Vec<SchemaColumn> {
    let mut schema: Vec<SchemaColumn> = columns
        .iter()
        .map(|(name, data_type)| SchemaColumn {
            name: name.clone(),
            kind: type_trans(data_type),
        })
        .collect();
    schema.push(SchemaColumn {
        name: "cdc_action".to_string(),
        kind: "string",
    });
    schema.push(SchemaColumn {
        name: "cdc_ts".to_string(),
        kind: "string",
    });
    schema.sort_by(|a, b| a.name.cmp(&b.name));
    schema
}

/// Writes `<schema_dir>/<system>/<server_id>/<database>/<table>` for
/// each requested table (all of them when `tables` is empty).
pub fn generate(
    connector: &mut MysqlConnector,
    database: &str,
    tables: &[String],
    schema_dir: &Path,
    system: &str,
    server_id: u32,
) -> Result<()> {
    let tables: Vec<String> = if tables.is_empty() {
        let result = connector.query(&format!(
            "SELECT table_name FROM information_schema.tables WHERE table_schema = '{}'",
            escape(database)
        ))?;
        result
            .rows
            .iter()
            .filter_map(|row| row.first().cloned().flatten())
            .collect()
    } else {
        tables.to_vec()
    };
    if tables.is_empty() {
        return Err(CdcError::Config(format!(
            "database {} has no tables",
            database
        )));
    }

    let db_path = schema_dir
        .join(system)
        .join(server_id.to_string())
        .join(database);
    fs::create_dir_all(&db_path)?;

    for table in &tables {
        let result = connector.query(&format!(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_schema = '{}' AND table_name = '{}' \
             ORDER BY ordinal_position",
            escape(database),
            escape(table)
        ))?;
        if result.rows.is_empty() {
            return Err(CdcError::Config(format!(
                "table {}.{} not found",
                database, table
            )));
        }
        let columns: Vec<(String, String)> = result
            .rows
            .iter()
            .map(|row| {
                (
                    row.first().cloned().flatten().unwrap_or_default(),
                    row.get(1).cloned().flatten().unwrap_or_default(),
                )
            })
            .collect();
        let schema = table_schema(&columns);
        let file = File::create(db_path.join(table))?;
        serde_json::to_writer(file, &schema)?;
        info!(
            "generate {}.{} warehouse schema OK!",
            database, table
        );
    }
    Ok(())
}

fn escape(ident: &str) -> String {
    ident.replace('\'', "''")
}
