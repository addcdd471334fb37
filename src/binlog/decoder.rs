use std::collections::HashMap;

use bit_set::BitSet;
use tracing::debug;

use crate::binlog::buffer::LogBuffer;
use crate::binlog::event::*;
use crate::binlog::value::{decode_value, ColumnValue};
use crate::error::{CdcError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowAction {
    Insert,
    Update,
    Delete,
}

impl RowAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowAction::Insert => "insert",
            RowAction::Update => "update",
            RowAction::Delete => "delete",
        }
    }

    pub fn from_str(s: &str) -> Option<RowAction> {
        match s {
            "insert" => Some(RowAction::Insert),
            "update" => Some(RowAction::Update),
            "delete" => Some(RowAction::Delete),
            _ => None,
        }
    }
}

/// One rows event, already resolved against its table map. For
/// updates, `rows` holds the after images; for deletes, the old
/// values.
#[derive(Debug)]
pub struct RowsEvent {
    pub schema: String,
    pub table: String,
    pub table_id: u64,
    pub action: RowAction,
    pub rows: Vec<Vec<ColumnValue>>,
    pub timestamp: u32,
    pub log_pos: u32,
}

/// The decoder's output, narrowed to what the pipeline consumes.
#[derive(Debug)]
pub enum BinlogEvent {
    Rotate { next_file: String, position: u64 },
    Rows(RowsEvent),
}

/// Stream state: format description of the current binlog plus the
/// live table id mapping. Everything else the server sends is decoded
/// just far enough to be skipped.
pub struct LogDecoder {
    fde: FormatDescription,
    table_map: HashMap<u64, TableMapEvent>,
}

impl LogDecoder {
    pub fn new() -> LogDecoder {
        LogDecoder {
            fde: FormatDescription::default(),
            table_map: HashMap::new(),
        }
    }

    /// Primes the checksum algorithm for the events that precede the
    /// format description (the artificial rotate at stream start).
    pub fn set_checksum_alg(&mut self, alg: u8) {
        self.fde.checksum_alg = alg;
    }

    /// Decodes one event body (header included, network wrapper and
    /// checksum handled here). Returns `None` for event types with no
    /// pipeline effect.
    pub fn decode(&mut self, body: &[u8]) -> Result<Option<BinlogEvent>> {
        if body.len() < EventHeader::LEN {
            return Err(CdcError::Event(format!("short event: {} bytes", body.len())));
        }
        let mut buf = LogBuffer::new(body);
        let header = EventHeader::from_buffer(&mut buf)?;

        if header.event_type == FORMAT_DESCRIPTION_EVENT {
            self.fde = FormatDescription::from_buffer(&mut buf, &header)?;
            debug!(checksum_alg = self.fde.checksum_alg, "format description");
            return Ok(None);
        }

        let end = if self.fde.checksum_alg == BINLOG_CHECKSUM_ALG_CRC32 {
            body.len().saturating_sub(BINLOG_CHECKSUM_LEN)
        } else {
            body.len()
        };
        let mut buf = LogBuffer::new(&body[..end]);

        match header.event_type {
            ROTATE_EVENT => {
                buf.seek(EventHeader::LEN)?;
                let position = buf.get_u64()?;
                let next_file = buf.get_fixed_string(buf.remaining())?;
                Ok(Some(BinlogEvent::Rotate {
                    next_file,
                    position,
                }))
            }
            TABLE_MAP_EVENT => {
                let map = TableMapEvent::from_buffer(&mut buf, &self.fde)?;
                self.table_map.insert(map.table_id, map);
                Ok(None)
            }
            WRITE_ROWS_EVENT_V1 | WRITE_ROWS_EVENT | UPDATE_ROWS_EVENT_V1 | UPDATE_ROWS_EVENT
            | DELETE_ROWS_EVENT_V1 | DELETE_ROWS_EVENT => {
                self.decode_rows(&mut buf, &header).map(Some)
            }
            other => {
                debug!(event_type = other, "skipping event");
                Ok(None)
            }
        }
    }

    fn decode_rows(&mut self, buf: &mut LogBuffer<'_>, header: &EventHeader) -> Result<BinlogEvent> {
        let rows_header = RowsEventHeader::from_buffer(buf, header, &self.fde)?;
        let table = self
            .table_map
            .get(&rows_header.table_id)
            .cloned()
            .ok_or_else(|| {
                CdcError::Event(format!("no table map for table id {}", rows_header.table_id))
            })?;

        let action = match header.event_type {
            WRITE_ROWS_EVENT_V1 | WRITE_ROWS_EVENT => RowAction::Insert,
            UPDATE_ROWS_EVENT_V1 | UPDATE_ROWS_EVENT => RowAction::Update,
            _ => RowAction::Delete,
        };

        let mut rows = Vec::new();
        while buf.has_remaining() {
            let image = decode_image(buf, &table, &rows_header.columns_present)?;
            if action == RowAction::Update {
                // keep the after image only
                rows.push(decode_image(buf, &table, &rows_header.columns_present_after)?);
            } else {
                rows.push(image);
            }
        }

        if rows_header.is_stmt_end() {
            self.table_map.clear();
        }

        Ok(BinlogEvent::Rows(RowsEvent {
            schema: table.schema,
            table: table.table,
            table_id: rows_header.table_id,
            action,
            rows,
            timestamp: header.timestamp,
            log_pos: header.log_pos,
        }))
    }
}

fn decode_image(
    buf: &mut LogBuffer<'_>,
    table: &TableMapEvent,
    present: &BitSet,
) -> Result<Vec<ColumnValue>> {
    let null_bits = buf.get_bit_map(present.len())?;
    let mut values = Vec::with_capacity(table.columns.len());
    let mut image_idx = 0;
    for (i, col) in table.columns.iter().enumerate() {
        if !present.contains(i) {
            values.push(ColumnValue::Null);
            continue;
        }
        if null_bits.contains(image_idx) {
            values.push(ColumnValue::Null);
        } else {
            values.push(decode_value(buf, col.kind, col.meta)?);
        }
        image_idx += 1;
    }
    Ok(values)
}
