use bit_set::BitSet;

use crate::binlog::buffer::LogBuffer;
use crate::error::{CdcError, Result};

// Event type codes, binlog format v4.
pub const ROTATE_EVENT: u8 = 4;
pub const FORMAT_DESCRIPTION_EVENT: u8 = 15;
pub const TABLE_MAP_EVENT: u8 = 19;
pub const WRITE_ROWS_EVENT_V1: u8 = 23;
pub const UPDATE_ROWS_EVENT_V1: u8 = 24;
pub const DELETE_ROWS_EVENT_V1: u8 = 25;
pub const WRITE_ROWS_EVENT: u8 = 30;
pub const UPDATE_ROWS_EVENT: u8 = 31;
pub const DELETE_ROWS_EVENT: u8 = 32;

pub const BINLOG_CHECKSUM_ALG_OFF: u8 = 0;
pub const BINLOG_CHECKSUM_ALG_CRC32: u8 = 1;
pub const BINLOG_CHECKSUM_LEN: usize = 4;

const STMT_END_F: u16 = 1;

// Column type codes as they appear in TABLE_MAP metadata.
pub const MYSQL_TYPE_DECIMAL: u8 = 0;
pub const MYSQL_TYPE_TINY: u8 = 1;
pub const MYSQL_TYPE_SHORT: u8 = 2;
pub const MYSQL_TYPE_LONG: u8 = 3;
pub const MYSQL_TYPE_FLOAT: u8 = 4;
pub const MYSQL_TYPE_DOUBLE: u8 = 5;
pub const MYSQL_TYPE_NULL: u8 = 6;
pub const MYSQL_TYPE_TIMESTAMP: u8 = 7;
pub const MYSQL_TYPE_LONGLONG: u8 = 8;
pub const MYSQL_TYPE_INT24: u8 = 9;
pub const MYSQL_TYPE_DATE: u8 = 10;
pub const MYSQL_TYPE_TIME: u8 = 11;
pub const MYSQL_TYPE_DATETIME: u8 = 12;
pub const MYSQL_TYPE_YEAR: u8 = 13;
pub const MYSQL_TYPE_VARCHAR: u8 = 15;
pub const MYSQL_TYPE_BIT: u8 = 16;
pub const MYSQL_TYPE_TIMESTAMP2: u8 = 17;
pub const MYSQL_TYPE_DATETIME2: u8 = 18;
pub const MYSQL_TYPE_TIME2: u8 = 19;
pub const MYSQL_TYPE_JSON: u8 = 245;
pub const MYSQL_TYPE_NEWDECIMAL: u8 = 246;
pub const MYSQL_TYPE_ENUM: u8 = 247;
pub const MYSQL_TYPE_SET: u8 = 248;
pub const MYSQL_TYPE_BLOB: u8 = 252;
pub const MYSQL_TYPE_VAR_STRING: u8 = 253;
pub const MYSQL_TYPE_STRING: u8 = 254;
pub const MYSQL_TYPE_GEOMETRY: u8 = 255;

/// Common event header, v4 layout:
///
/// ```text
/// Bytes  Name
/// -----  ----
/// 4      timestamp (seconds)
/// 1      event type code
/// 4      server id
/// 4      event length (header included)
/// 4      next event position
/// 2      flags
/// ```
#[derive(Debug, Clone)]
pub struct EventHeader {
    pub timestamp: u32,
    pub event_type: u8,
    pub server_id: u32,
    pub event_len: usize,
    pub log_pos: u32,
    pub flags: u16,
}

impl EventHeader {
    pub const LEN: usize = 19;

    pub fn from_buffer(buf: &mut LogBuffer<'_>) -> Result<EventHeader> {
        Ok(EventHeader {
            timestamp: buf.get_u32()?,
            event_type: buf.get_u8()?,
            server_id: buf.get_u32()?,
            event_len: buf.get_u32()? as usize,
            log_pos: buf.get_u32()?,
            flags: buf.get_u16()?,
        })
    }
}

/// FORMAT_DESCRIPTION state needed by later events: per-type post
/// header lengths and the checksum algorithm trailing every event.
#[derive(Debug, Clone)]
pub struct FormatDescription {
    post_header_len: Vec<u8>,
    pub checksum_alg: u8,
}

impl Default for FormatDescription {
    /// Binlog v4 defaults, used until the real event arrives.
    fn default() -> FormatDescription {
        let mut post_header_len = vec![0u8; 38];
        post_header_len[ROTATE_EVENT as usize - 1] = 8;
        post_header_len[FORMAT_DESCRIPTION_EVENT as usize - 1] = 84;
        post_header_len[TABLE_MAP_EVENT as usize - 1] = 8;
        post_header_len[WRITE_ROWS_EVENT_V1 as usize - 1] = 8;
        post_header_len[UPDATE_ROWS_EVENT_V1 as usize - 1] = 8;
        post_header_len[DELETE_ROWS_EVENT_V1 as usize - 1] = 8;
        post_header_len[WRITE_ROWS_EVENT as usize - 1] = 10;
        post_header_len[UPDATE_ROWS_EVENT as usize - 1] = 10;
        post_header_len[DELETE_ROWS_EVENT as usize - 1] = 10;
        FormatDescription {
            post_header_len,
            checksum_alg: BINLOG_CHECKSUM_ALG_OFF,
        }
    }
}

impl FormatDescription {
    const SERVER_VER_LEN: usize = 50;

    pub fn from_buffer(buf: &mut LogBuffer<'_>, header: &EventHeader) -> Result<FormatDescription> {
        buf.seek(EventHeader::LEN)?;
        let binlog_version = buf.get_u16()?;
        if binlog_version != 4 {
            return Err(CdcError::Event(format!(
                "unsupported binlog version {}",
                binlog_version
            )));
        }
        let server_version = buf.get_fixed_string(Self::SERVER_VER_LEN)?;
        buf.forward(4)?; // create timestamp
        let common_header_len = buf.get_u8()? as usize;
        if common_header_len != EventHeader::LEN {
            return Err(CdcError::Event(format!(
                "unsupported common header length {}",
                common_header_len
            )));
        }

        // Servers from 5.6.1 on append a checksum algorithm byte and a
        // checksum to this event; the post header table stops before
        // them.
        let with_checksum = version_product(&server_version) >= version_product("5.6.1");
        let tail = if with_checksum { 5 } else { 0 };
        let count = header
            .event_len
            .checked_sub(EventHeader::LEN + 2 + Self::SERVER_VER_LEN + 4 + 1 + tail)
            .ok_or_else(|| CdcError::Event("format description too short".into()))?;
        let post_header_len = buf.get_fixed_bytes(count)?.to_vec();
        let checksum_alg = if with_checksum {
            buf.get_u8()?
        } else {
            BINLOG_CHECKSUM_ALG_OFF
        };
        Ok(FormatDescription {
            post_header_len,
            checksum_alg,
        })
    }

    pub fn post_header_len(&self, event_type: u8) -> usize {
        self.post_header_len
            .get(event_type as usize - 1)
            .copied()
            .unwrap_or(0) as usize
    }
}

fn version_product(version: &str) -> u32 {
    let mut split = [0u32; 3];
    for (i, part) in version.split('.').take(3).enumerate() {
        let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
        split[i] = digits.parse().unwrap_or(0);
    }
    (split[0] * 256 + split[1]) * 256 + split[2]
}

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub kind: u8,
    pub meta: u16,
    pub nullable: bool,
}

/// TABLE_MAP: numeric table id to schema, table and column layout.
/// Row events only reference the table id.
#[derive(Debug, Clone)]
pub struct TableMapEvent {
    pub table_id: u64,
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnInfo>,
}

impl TableMapEvent {
    pub fn from_buffer(buf: &mut LogBuffer<'_>, fde: &FormatDescription) -> Result<TableMapEvent> {
        let post_header_len = fde.post_header_len(TABLE_MAP_EVENT);
        buf.seek(EventHeader::LEN)?;
        let table_id = if post_header_len == 6 {
            buf.get_u32()? as u64
        } else {
            buf.get_u48()?
        };
        buf.seek(EventHeader::LEN + post_header_len)?;

        let schema_len = buf.get_u8()? as usize;
        let schema = buf.get_fixed_string(schema_len)?;
        buf.forward(1)?;
        let table_len = buf.get_u8()? as usize;
        let table = buf.get_fixed_string(table_len)?;
        buf.forward(1)?;

        let column_cnt = buf.get_packed_num()? as usize;
        let mut columns = Vec::with_capacity(column_cnt);
        for _ in 0..column_cnt {
            columns.push(ColumnInfo {
                kind: buf.get_u8()?,
                meta: 0,
                nullable: false,
            });
        }

        let meta_len = buf.get_packed_num()? as usize;
        let meta_end = buf.position() + meta_len;
        for info in columns.iter_mut() {
            info.meta = match info.kind {
                MYSQL_TYPE_BLOB | MYSQL_TYPE_DOUBLE | MYSQL_TYPE_FLOAT | MYSQL_TYPE_GEOMETRY
                | MYSQL_TYPE_JSON | MYSQL_TYPE_TIME2 | MYSQL_TYPE_DATETIME2
                | MYSQL_TYPE_TIMESTAMP2 => buf.get_u8()? as u16,
                MYSQL_TYPE_SET | MYSQL_TYPE_ENUM | MYSQL_TYPE_STRING | MYSQL_TYPE_NEWDECIMAL => {
                    (buf.get_u8()? as u16) << 8 | buf.get_u8()? as u16
                }
                MYSQL_TYPE_BIT | MYSQL_TYPE_VARCHAR | MYSQL_TYPE_VAR_STRING => buf.get_u16()?,
                _ => 0,
            };
        }
        buf.seek(meta_end)?;

        let null_bits = buf.get_bit_map(column_cnt)?;
        for (i, info) in columns.iter_mut().enumerate() {
            info.nullable = null_bits.contains(i);
        }
        // Optional metadata (binlog_row_metadata=FULL) may follow; the
        // pipeline resolves names and signedness from
        // information_schema instead.
        Ok(TableMapEvent {
            table_id,
            schema,
            table,
            columns,
        })
    }

    /// ENUM and SET hide their real type behind MYSQL_TYPE_STRING with
    /// the type code folded into the metadata.
    pub fn real_type(kind: u8, meta: u16) -> (u8, u16) {
        if kind == MYSQL_TYPE_STRING {
            let byte0 = (meta >> 8) as u8;
            let byte1 = meta & 0xff;
            if byte0 & 0x30 != 0x30 {
                // Lengths above 255 borrow two bits from the type code.
                (byte0 | 0x30, byte1 | ((byte0 as u16 & 0x30) ^ 0x30) << 4)
            } else if byte0 == MYSQL_TYPE_ENUM || byte0 == MYSQL_TYPE_SET {
                (byte0, byte1)
            } else {
                (MYSQL_TYPE_STRING, byte1)
            }
        } else {
            (kind, meta)
        }
    }
}

/// Post header and bitmaps common to WRITE/UPDATE/DELETE rows events.
/// Row images themselves are decoded by the caller against the table
/// map.
pub struct RowsEventHeader {
    pub table_id: u64,
    pub flags: u16,
    pub column_cnt: usize,
    pub columns_present: BitSet,
    pub columns_present_after: BitSet,
}

impl RowsEventHeader {
    pub fn from_buffer(
        buf: &mut LogBuffer<'_>,
        header: &EventHeader,
        fde: &FormatDescription,
    ) -> Result<RowsEventHeader> {
        let post_header_len = fde.post_header_len(header.event_type);
        buf.seek(EventHeader::LEN)?;
        let table_id = if post_header_len == 6 {
            buf.get_u32()? as u64
        } else {
            buf.get_u48()?
        };
        let flags = buf.get_u16()?;
        if post_header_len == 10 {
            // v2 variable header, length includes its own two bytes
            let extra_len = buf.get_u16()? as usize;
            buf.forward(extra_len.saturating_sub(2))?;
        }

        let column_cnt = buf.get_packed_num()? as usize;
        let columns_present = buf.get_bit_map(column_cnt)?;
        let is_update = header.event_type == UPDATE_ROWS_EVENT_V1
            || header.event_type == UPDATE_ROWS_EVENT;
        let columns_present_after = if is_update {
            buf.get_bit_map(column_cnt)?
        } else {
            columns_present.clone()
        };
        Ok(RowsEventHeader {
            table_id,
            flags,
            column_cnt,
            columns_present,
            columns_present_after,
        })
    }

    pub fn is_stmt_end(&self) -> bool {
        self.flags & STMT_END_F != 0
    }
}
