use std::str::FromStr;

use bigdecimal::BigDecimal;
use encoding::all::{ISO_8859_1, UTF_8};
use encoding::label::encoding_from_whatwg_label;
use encoding::{DecoderTrap, EncodingRef};

use crate::binlog::buffer::LogBuffer;
use crate::binlog::event::*;
use crate::error::{CdcError, Result};
use crate::utils::time::timestamp_to_time;

/// One decoded column value. Integer, enum and set values stay raw
/// because rendering them needs `information_schema` knowledge
/// (signedness, labels) the binlog does not carry.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    /// Little endian raw bits plus storage width; sign decided at
    /// render time.
    Int { raw: u64, bytes: u8 },
    Float(f32),
    Double(f64),
    /// Plain digit string, for example `-12.34`.
    Decimal(String),
    /// Already rendered date/time text.
    Temporal(String),
    /// Epoch seconds and microseconds (TIMESTAMP/TIMESTAMP2).
    Timestamp { secs: u32, micros: u32 },
    Year(u16),
    Bit(u64),
    /// 1-based index into the column's enum labels; 0 is the empty
    /// value.
    Enum(u32),
    /// Member bitmask over the column's set labels.
    Set(u64),
    /// Undecoded text/blob payload; charset applied at render time.
    Bytes(Vec<u8>),
}

/// Decodes one column of a row image.
pub fn decode_value(buf: &mut LogBuffer<'_>, kind: u8, meta: u16) -> Result<ColumnValue> {
    let (kind, meta) = TableMapEvent::real_type(kind, meta);
    match kind {
        MYSQL_TYPE_NULL => Ok(ColumnValue::Null),
        MYSQL_TYPE_TINY => Ok(ColumnValue::Int {
            raw: buf.get_uint(1)?,
            bytes: 1,
        }),
        MYSQL_TYPE_SHORT => Ok(ColumnValue::Int {
            raw: buf.get_uint(2)?,
            bytes: 2,
        }),
        MYSQL_TYPE_INT24 => Ok(ColumnValue::Int {
            raw: buf.get_uint(3)?,
            bytes: 3,
        }),
        MYSQL_TYPE_LONG => Ok(ColumnValue::Int {
            raw: buf.get_uint(4)?,
            bytes: 4,
        }),
        MYSQL_TYPE_LONGLONG => Ok(ColumnValue::Int {
            raw: buf.get_uint(8)?,
            bytes: 8,
        }),
        MYSQL_TYPE_FLOAT => Ok(ColumnValue::Float(buf.get_f32()?)),
        MYSQL_TYPE_DOUBLE => Ok(ColumnValue::Double(buf.get_f64()?)),
        MYSQL_TYPE_DECIMAL | MYSQL_TYPE_NEWDECIMAL => {
            let precision = (meta >> 8) as usize;
            let scale = (meta & 0xff) as usize;
            Ok(ColumnValue::Decimal(buf.get_decimal(precision, scale)?))
        }
        MYSQL_TYPE_YEAR => {
            let v = buf.get_u8()? as u16;
            Ok(ColumnValue::Year(if v == 0 { 0 } else { 1900 + v }))
        }
        MYSQL_TYPE_DATE => {
            let v = buf.get_u24()?;
            Ok(ColumnValue::Temporal(format!(
                "{:04}-{:02}-{:02}",
                v >> 9,
                v >> 5 & 0x0f,
                v & 0x1f
            )))
        }
        MYSQL_TYPE_TIME => {
            // signed int24, sign extended
            let v = ((buf.get_u24()? << 8) as i32) >> 8;
            let (sign, v) = if v < 0 { ("-", -v) } else { ("", v) };
            Ok(ColumnValue::Temporal(format!(
                "{}{:02}:{:02}:{:02}",
                sign,
                v / 10000,
                v / 100 % 100,
                v % 100
            )))
        }
        MYSQL_TYPE_TIME2 => decode_time2(buf, meta as usize),
        MYSQL_TYPE_DATETIME => {
            let v = buf.get_u64()?;
            let (date, time) = (v / 1_000_000, v % 1_000_000);
            Ok(ColumnValue::Temporal(format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                date / 10000,
                date / 100 % 100,
                date % 100,
                time / 10000,
                time / 100 % 100,
                time % 100
            )))
        }
        MYSQL_TYPE_DATETIME2 => decode_datetime2(buf, meta as usize),
        MYSQL_TYPE_TIMESTAMP => Ok(ColumnValue::Timestamp {
            secs: buf.get_u32()?,
            micros: 0,
        }),
        MYSQL_TYPE_TIMESTAMP2 => {
            let secs = buf.get_uint_be(4)? as u32;
            let micros = decode_fractional(buf, meta as usize)?;
            Ok(ColumnValue::Timestamp { secs, micros })
        }
        MYSQL_TYPE_VARCHAR | MYSQL_TYPE_VAR_STRING | MYSQL_TYPE_STRING => {
            let len = if meta < 256 {
                buf.get_u8()? as usize
            } else {
                buf.get_u16()? as usize
            };
            Ok(ColumnValue::Bytes(buf.get_fixed_bytes(len)?.to_vec()))
        }
        MYSQL_TYPE_ENUM => {
            // meta is the pack length in bytes, 1 or 2
            Ok(ColumnValue::Enum(buf.get_uint(meta as usize)? as u32))
        }
        MYSQL_TYPE_SET => Ok(ColumnValue::Set(buf.get_uint(meta as usize)?)),
        MYSQL_TYPE_BIT => {
            let bits = (meta >> 8) as usize * 8 + (meta & 0xff) as usize;
            Ok(ColumnValue::Bit(buf.get_uint_be((bits + 7) / 8)?))
        }
        MYSQL_TYPE_BLOB | MYSQL_TYPE_JSON | MYSQL_TYPE_GEOMETRY => {
            let len = buf.get_uint(meta as usize)? as usize;
            Ok(ColumnValue::Bytes(buf.get_fixed_bytes(len)?.to_vec()))
        }
        other => Err(CdcError::Event(format!("unsupported column type {}", other))),
    }
}

/// TIME2: 3 bytes big endian offset-binary plus an optional fraction,
/// all of it one two's complement quantity for negative times.
fn decode_time2(buf: &mut LogBuffer<'_>, fsp: usize) -> Result<ColumnValue> {
    let frac_bytes = (fsp + 1) / 2;
    let int_part = buf.get_uint_be(3)? as i64;
    let frac = if frac_bytes > 0 {
        buf.get_uint_be(frac_bytes)? as i64
    } else {
        0
    };
    let combined = int_part << (8 * frac_bytes) | frac;
    let signed = combined - (1i64 << (8 * frac_bytes + 23));
    let (sign, magnitude) = if signed < 0 { ("-", -signed) } else { ("", signed) };
    let frac = magnitude & ((1i64 << (8 * frac_bytes)) - 1);
    let hms = magnitude >> (8 * frac_bytes);
    let mut out = format!(
        "{}{:02}:{:02}:{:02}",
        sign,
        hms >> 12 & 0x3ff,
        hms >> 6 & 0x3f,
        hms & 0x3f
    );
    if fsp > 0 {
        let micros = frac as u32 * 10u32.pow(6 - 2 * frac_bytes as u32);
        out.push_str(&format!(".{:06}", micros));
    }
    Ok(ColumnValue::Temporal(out))
}

/// DATETIME2: 5 bytes big endian with year*13+month packed in 17 bits.
fn decode_datetime2(buf: &mut LogBuffer<'_>, fsp: usize) -> Result<ColumnValue> {
    let v = buf.get_uint_be(5)? as i64 - 0x8000000000;
    let ym = v >> 22 & 0x1ffff;
    let mut out = format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        ym / 13,
        ym % 13,
        v >> 17 & 0x1f,
        v >> 12 & 0x1f,
        v >> 6 & 0x3f,
        v & 0x3f
    );
    if fsp > 0 {
        out.push_str(&format!(".{:06}", decode_fractional(buf, fsp)?));
    }
    Ok(ColumnValue::Temporal(out))
}

fn decode_fractional(buf: &mut LogBuffer<'_>, fsp: usize) -> Result<u32> {
    let frac_bytes = (fsp + 1) / 2;
    if frac_bytes == 0 {
        return Ok(0);
    }
    let frac = buf.get_uint_be(frac_bytes)? as u32;
    Ok(frac * 10u32.pow(6 - 2 * frac_bytes as u32))
}

/// Per-column knowledge from `information_schema` needed to turn a
/// `ColumnValue` into its text form.
#[derive(Debug, Clone, Default)]
pub struct RenderHint {
    pub unsigned: bool,
    pub enum_values: Vec<String>,
    pub set_values: Vec<String>,
}

/// Renders a value to the string stored in the cache and written to
/// CSV. SQL NULL renders as the empty string.
pub fn render_value(value: &ColumnValue, hint: &RenderHint, charset: EncodingRef) -> String {
    match value {
        ColumnValue::Null => String::new(),
        ColumnValue::Int { raw, bytes } => {
            if hint.unsigned {
                format!("{}", raw)
            } else {
                let shift = 64 - 8 * *bytes as u32;
                format!("{}", ((*raw << shift) as i64) >> shift)
            }
        }
        ColumnValue::Float(v) => format!("{}", v),
        ColumnValue::Double(v) => format!("{}", v),
        ColumnValue::Decimal(digits) => BigDecimal::from_str(digits)
            .map(|d| d.to_string())
            .unwrap_or_else(|_| digits.clone()),
        ColumnValue::Temporal(text) => text.clone(),
        ColumnValue::Timestamp { secs, micros } => {
            let mut out = timestamp_to_time(*secs as u64);
            if *micros > 0 {
                out.push_str(&format!(".{:06}", micros));
            }
            out
        }
        ColumnValue::Year(v) => format!("{:04}", v),
        ColumnValue::Bit(v) => format!("{}", v),
        ColumnValue::Enum(idx) => {
            if *idx == 0 {
                String::new()
            } else {
                hint.enum_values
                    .get(*idx as usize - 1)
                    .cloned()
                    .unwrap_or_else(|| format!("{}", idx))
            }
        }
        ColumnValue::Set(bits) => {
            if hint.set_values.is_empty() {
                return format!("{}", bits);
            }
            let mut members = Vec::new();
            for (i, label) in hint.set_values.iter().enumerate() {
                if bits >> i & 1 == 1 {
                    members.push(label.as_str());
                }
            }
            members.join(",")
        }
        ColumnValue::Bytes(raw) => charset
            .decode(raw, DecoderTrap::Replace)
            .unwrap_or_else(|_| String::from_utf8_lossy(raw).into_owned()),
    }
}

/// Maps a MySQL character set name to a text decoder. Binary data
/// passes through the latin1 decoder unchanged byte-for-byte.
pub fn encoding_for(charset: &str) -> EncodingRef {
    match charset {
        "utf8" | "utf8mb3" | "utf8mb4" => UTF_8,
        "latin1" | "binary" => ISO_8859_1,
        other => encoding_from_whatwg_label(other).unwrap_or(UTF_8),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(value: &ColumnValue) -> String {
        render_value(value, &RenderHint::default(), encoding_for("utf8"))
    }

    #[test]
    fn integer_signedness_comes_from_the_hint() {
        let value = ColumnValue::Int { raw: 0xff, bytes: 1 };
        assert_eq!(render(&value), "-1");
        let unsigned = RenderHint {
            unsigned: true,
            ..RenderHint::default()
        };
        assert_eq!(
            render_value(&value, &unsigned, encoding_for("utf8")),
            "255"
        );
    }

    #[test]
    fn wide_integers_sign_extend_by_width() {
        let value = ColumnValue::Int {
            raw: 0xff_fffe,
            bytes: 3,
        };
        assert_eq!(render(&value), "-2");
        let value = ColumnValue::Int {
            raw: 0x7f_ffff,
            bytes: 3,
        };
        assert_eq!(render(&value), "8388607");
    }

    #[test]
    fn enum_and_set_use_schema_labels() {
        let hint = RenderHint {
            enum_values: vec!["red".into(), "green".into()],
            set_values: vec!["a".into(), "b".into(), "c".into()],
            ..RenderHint::default()
        };
        let charset = encoding_for("utf8");
        assert_eq!(render_value(&ColumnValue::Enum(2), &hint, charset), "green");
        assert_eq!(render_value(&ColumnValue::Enum(0), &hint, charset), "");
        assert_eq!(render_value(&ColumnValue::Set(0b101), &hint, charset), "a,c");
    }

    #[test]
    fn datetime2_packs_year_month_in_thirteens() {
        // 2026-08-01 12:34:56
        let ym: i64 = 2026 * 13 + 8;
        let packed: i64 =
            (ym << 22 | 1 << 17 | 12 << 12 | 34 << 6 | 56) + 0x80_0000_0000u64 as i64;
        let bytes = packed.to_be_bytes();
        let mut buf = LogBuffer::new(&bytes[3..8]);
        let value = decode_value(&mut buf, MYSQL_TYPE_DATETIME2, 0).unwrap();
        assert_eq!(
            value,
            ColumnValue::Temporal("2026-08-01 12:34:56".to_string())
        );
    }

    #[test]
    fn time2_carries_its_sign_in_the_offset() {
        // 838:59:58 fits; test a plain 03:14:07
        let packed: i64 = (3 << 12 | 14 << 6 | 7) + 0x80_0000;
        let bytes = packed.to_be_bytes();
        let mut buf = LogBuffer::new(&bytes[5..8]);
        let value = decode_value(&mut buf, MYSQL_TYPE_TIME2, 0).unwrap();
        assert_eq!(value, ColumnValue::Temporal("03:14:07".to_string()));
    }

    #[test]
    fn legacy_date_splits_bit_fields() {
        // 2026-08-01: day 1, month 8, year 2026
        let packed: u32 = 2026 << 9 | 8 << 5 | 1;
        let bytes = packed.to_le_bytes();
        let mut buf = LogBuffer::new(&bytes[..3]);
        let value = decode_value(&mut buf, MYSQL_TYPE_DATE, 0).unwrap();
        assert_eq!(value, ColumnValue::Temporal("2026-08-01".to_string()));
    }

    #[test]
    fn timestamp_renders_utc() {
        let value = ColumnValue::Timestamp {
            secs: 0,
            micros: 0,
        };
        assert_eq!(render(&value), "1970-01-01 00:00:00");
        let value = ColumnValue::Timestamp {
            secs: 0,
            micros: 500_000,
        };
        assert_eq!(render(&value), "1970-01-01 00:00:00.500000");
    }

    #[test]
    fn latin1_text_decodes_lossless() {
        let value = ColumnValue::Bytes(vec![0x63, 0x61, 0x66, 0xe9]); // "café" in latin1
        assert_eq!(
            render_value(&value, &RenderHint::default(), encoding_for("latin1")),
            "café"
        );
    }
}
