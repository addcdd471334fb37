use std::collections::hash_map::Entry;
use std::collections::HashMap;

use tracing::debug;

use crate::binlog::RenderHint;
use crate::error::{CdcError, Result};
use crate::mysql::MysqlConnector;

/// Binlog row events carry column values by position only; names, key
/// columns, signedness and enum/set labels all come from
/// `information_schema`.
#[derive(Debug, Clone)]
pub struct ColumnMeta {
    pub name: String,
    pub hint: RenderHint,
    pub key: bool,
}

#[derive(Debug, Clone)]
pub struct TableMeta {
    pub columns: Vec<ColumnMeta>,
}

impl TableMeta {
    pub fn primary_key(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.key)
            .map(|c| c.name.clone())
            .collect()
    }
}

/// Metadata cache keyed by binlog table id. Table ids change when a
/// table is altered, so an unseen id forces a re-read; that is what
/// keeps the stream usable across DDL on tables outside the watched
/// set.
pub struct TableMetaCache {
    connection: MysqlConnector,
    cache: HashMap<u64, TableMeta>,
}

impl TableMetaCache {
    pub fn new(mut connection: MysqlConnector) -> Result<TableMetaCache> {
        connection.connect()?;
        Ok(TableMetaCache {
            connection,
            cache: HashMap::new(),
        })
    }

    pub fn table_meta(&mut self, table_id: u64, schema: &str, table: &str) -> Result<&TableMeta> {
        match self.cache.entry(table_id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                debug!(table_id, schema, table, "fetching table meta");
                let meta = fetch_table_meta(&mut self.connection, schema, table)?;
                Ok(entry.insert(meta))
            }
        }
    }
}

fn fetch_table_meta(
    connection: &mut MysqlConnector,
    schema: &str,
    table: &str,
) -> Result<TableMeta> {
    let sql = format!(
        "SELECT column_name, column_type, column_key \
         FROM information_schema.columns \
         WHERE table_schema = '{}' AND table_name = '{}' \
         ORDER BY ordinal_position",
        escape(schema),
        escape(table)
    );
    let packet = connection.query(&sql)?;
    if packet.rows.is_empty() {
        return Err(CdcError::Event(format!(
            "no columns in information_schema for {}.{}",
            schema, table
        )));
    }
    let mut columns = Vec::with_capacity(packet.rows.len());
    for row in 0..packet.rows.len() {
        let name = packet.value(row, "column_name").unwrap_or("").to_string();
        let column_type = packet.value(row, "column_type").unwrap_or("");
        let key = packet.value(row, "column_key").unwrap_or("") == "PRI";
        columns.push(ColumnMeta {
            name,
            hint: hint_from_column_type(column_type),
            key,
        });
    }
    Ok(TableMeta { columns })
}

fn escape(ident: &str) -> String {
    ident.replace('\'', "''")
}

fn hint_from_column_type(column_type: &str) -> RenderHint {
    let mut hint = RenderHint {
        unsigned: column_type.contains("unsigned"),
        ..RenderHint::default()
    };
    if let Some(rest) = column_type.strip_prefix("enum(") {
        hint.enum_values = parse_labels(rest);
    } else if let Some(rest) = column_type.strip_prefix("set(") {
        hint.set_values = parse_labels(rest);
    }
    hint
}

/// Parses `'a','b','it''s'` up to the closing parenthesis.
fn parse_labels(body: &str) -> Vec<String> {
    let mut labels = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quote {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    current.push('\'');
                } else {
                    in_quote = false;
                    labels.push(std::mem::take(&mut current));
                }
            } else {
                current.push(c);
            }
        } else {
            match c {
                '\'' => in_quote = true,
                ')' => break,
                _ => {}
            }
        }
    }
    labels
}
