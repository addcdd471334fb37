//! Decoder tests against hand built event bytes (binlog v4 layout,
//! checksums off).

use mysql_cdc::binlog::value::{encoding_for, render_value};
use mysql_cdc::binlog::{BinlogEvent, ColumnValue, LogDecoder, RenderHint, RowAction};

const ROTATE_EVENT: u8 = 4;
const TABLE_MAP_EVENT: u8 = 19;
const WRITE_ROWS_EVENT_V1: u8 = 23;
const UPDATE_ROWS_EVENT_V1: u8 = 24;
const DELETE_ROWS_EVENT_V1: u8 = 25;

fn header(event_type: u8, body_len: usize, log_pos: u32, flags: u16) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&1754012345u32.to_le_bytes()); // timestamp
    out.push(event_type);
    out.extend_from_slice(&1u32.to_le_bytes()); // server id
    out.extend_from_slice(&((19 + body_len) as u32).to_le_bytes());
    out.extend_from_slice(&log_pos.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out
}

fn rotate_event(next_file: &str, position: u64) -> Vec<u8> {
    let body_len = 8 + next_file.len();
    let mut out = header(ROTATE_EVENT, body_len, 0, 0x20);
    out.extend_from_slice(&position.to_le_bytes());
    out.extend_from_slice(next_file.as_bytes());
    out
}

/// `db.t (id INT, name VARCHAR(40) NULL)` under table id 100.
fn table_map_event() -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&100u64.to_le_bytes()[..6]); // table id
    body.extend_from_slice(&1u16.to_le_bytes()); // flags
    body.push(2);
    body.extend_from_slice(b"db");
    body.push(0);
    body.push(1);
    body.extend_from_slice(b"t");
    body.push(0);
    body.push(2); // column count
    body.push(3); // MYSQL_TYPE_LONG
    body.push(15); // MYSQL_TYPE_VARCHAR
    body.push(2); // metadata block length
    body.extend_from_slice(&40u16.to_le_bytes()); // varchar max length
    body.push(0b10); // null bitmap: name is nullable

    let mut out = header(TABLE_MAP_EVENT, body.len(), 400, 0);
    out.extend_from_slice(&body);
    out
}

fn rows_post_header(flags: u16) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&100u64.to_le_bytes()[..6]);
    body.extend_from_slice(&flags.to_le_bytes());
    body
}

fn write_rows_event(id: i32, name: Option<&str>) -> Vec<u8> {
    let mut body = rows_post_header(1); // STMT_END
    body.push(2); // column count
    body.push(0b11); // columns present
    match name {
        Some(name) => {
            body.push(0b00); // null bits
            body.extend_from_slice(&id.to_le_bytes());
            body.push(name.len() as u8);
            body.extend_from_slice(name.as_bytes());
        }
        None => {
            body.push(0b10); // name is NULL
            body.extend_from_slice(&id.to_le_bytes());
        }
    }
    let mut out = header(WRITE_ROWS_EVENT_V1, body.len(), 520, 0);
    out.extend_from_slice(&body);
    out
}

fn update_rows_event() -> Vec<u8> {
    let mut body = rows_post_header(1);
    body.push(2);
    body.push(0b11); // before image columns
    body.push(0b11); // after image columns
    // before: (7, "a")
    body.push(0b00);
    body.extend_from_slice(&7i32.to_le_bytes());
    body.push(1);
    body.extend_from_slice(b"a");
    // after: (7, "b")
    body.push(0b00);
    body.extend_from_slice(&7i32.to_le_bytes());
    body.push(1);
    body.extend_from_slice(b"b");
    let mut out = header(UPDATE_ROWS_EVENT_V1, body.len(), 640, 0);
    out.extend_from_slice(&body);
    out
}

fn delete_rows_event(id: i32) -> Vec<u8> {
    let mut body = rows_post_header(1);
    body.push(2);
    body.push(0b01); // only id in the image
    body.push(0b0);
    body.extend_from_slice(&id.to_le_bytes());
    let mut out = header(DELETE_ROWS_EVENT_V1, body.len(), 760, 0);
    out.extend_from_slice(&body);
    out
}

#[test]
fn rotate_decodes_to_the_tagged_sum() {
    let mut decoder = LogDecoder::new();
    let event = decoder
        .decode(&rotate_event("mysql-bin.000002", 4))
        .unwrap()
        .unwrap();
    match event {
        BinlogEvent::Rotate {
            next_file,
            position,
        } => {
            assert_eq!(next_file, "mysql-bin.000002");
            assert_eq!(position, 4);
        }
        other => panic!("expected rotate, got {:?}", other),
    }
}

#[test]
fn write_rows_resolve_against_the_table_map() {
    let mut decoder = LogDecoder::new();
    assert!(decoder.decode(&table_map_event()).unwrap().is_none());
    let event = decoder
        .decode(&write_rows_event(42, Some("hello")))
        .unwrap()
        .unwrap();
    let rows = match event {
        BinlogEvent::Rows(rows) => rows,
        other => panic!("expected rows, got {:?}", other),
    };
    assert_eq!(rows.schema, "db");
    assert_eq!(rows.table, "t");
    assert_eq!(rows.action, RowAction::Insert);
    assert_eq!(rows.log_pos, 520);
    assert_eq!(rows.rows.len(), 1);
    assert_eq!(rows.rows[0][0], ColumnValue::Int { raw: 42, bytes: 4 });
    assert_eq!(rows.rows[0][1], ColumnValue::Bytes(b"hello".to_vec()));

    let hint = RenderHint::default();
    let charset = encoding_for("utf8");
    assert_eq!(render_value(&rows.rows[0][0], &hint, charset), "42");
    assert_eq!(render_value(&rows.rows[0][1], &hint, charset), "hello");
}

#[test]
fn null_column_renders_empty() {
    let mut decoder = LogDecoder::new();
    decoder.decode(&table_map_event()).unwrap();
    let event = decoder.decode(&write_rows_event(7, None)).unwrap().unwrap();
    let rows = match event {
        BinlogEvent::Rows(rows) => rows,
        other => panic!("expected rows, got {:?}", other),
    };
    assert_eq!(rows.rows[0][1], ColumnValue::Null);
    let rendered = render_value(&rows.rows[0][1], &RenderHint::default(), encoding_for("utf8"));
    assert_eq!(rendered, "");
}

#[test]
fn update_rows_keep_the_after_image() {
    let mut decoder = LogDecoder::new();
    decoder.decode(&table_map_event()).unwrap();
    let event = decoder.decode(&update_rows_event()).unwrap().unwrap();
    let rows = match event {
        BinlogEvent::Rows(rows) => rows,
        other => panic!("expected rows, got {:?}", other),
    };
    assert_eq!(rows.action, RowAction::Update);
    assert_eq!(rows.rows.len(), 1);
    assert_eq!(rows.rows[0][1], ColumnValue::Bytes(b"b".to_vec()));
}

#[test]
fn delete_rows_carry_the_old_image() {
    let mut decoder = LogDecoder::new();
    decoder.decode(&table_map_event()).unwrap();
    let event = decoder.decode(&delete_rows_event(9)).unwrap().unwrap();
    let rows = match event {
        BinlogEvent::Rows(rows) => rows,
        other => panic!("expected rows, got {:?}", other),
    };
    assert_eq!(rows.action, RowAction::Delete);
    assert_eq!(rows.rows[0][0], ColumnValue::Int { raw: 9, bytes: 4 });
    // absent column comes back as NULL
    assert_eq!(rows.rows[0][1], ColumnValue::Null);
}

#[test]
fn stmt_end_clears_the_table_map() {
    let mut decoder = LogDecoder::new();
    decoder.decode(&table_map_event()).unwrap();
    decoder.decode(&write_rows_event(1, Some("x"))).unwrap();
    // the map was cleared, a rows event without a fresh table map is a
    // protocol error
    assert!(decoder.decode(&write_rows_event(2, Some("y"))).is_err());
}
