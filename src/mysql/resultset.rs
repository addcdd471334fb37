use crate::binlog::buffer::LogBuffer;
use crate::error::Result;

/// Column definition of a text-protocol result set. Only the name is
/// of interest downstream; the fixed tail is skipped.
pub struct FieldPacket {
    pub name: String,
}

impl FieldPacket {
    pub fn from_bytes(body: &[u8]) -> Result<FieldPacket> {
        let mut buf = LogBuffer::new(body);
        for _ in 0..4 {
            // catalog, schema, table, org_table
            buf.get_packed_bytes()?;
        }
        let name = buf
            .get_packed_bytes()?
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
            .unwrap_or_default();
        Ok(FieldPacket { name })
    }
}

/// One decoded row: NULL columns come back as `None`.
pub fn parse_row(body: &[u8], column_count: usize) -> Result<Vec<Option<String>>> {
    let mut buf = LogBuffer::new(body);
    let mut row = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        let value = buf
            .get_packed_bytes()?
            .map(|raw| String::from_utf8_lossy(raw).into_owned());
        row.push(value);
    }
    Ok(row)
}

/// A complete text-protocol result set.
pub struct ResultSetPacket {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSetPacket {
    pub fn new() -> ResultSetPacket {
        ResultSetPacket {
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Value at (row, column name); `None` for NULL or a missing
    /// column.
    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)?.as_deref()
    }
}

impl Default for ResultSetPacket {
    fn default() -> Self {
        Self::new()
    }
}
