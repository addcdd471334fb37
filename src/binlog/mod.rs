pub mod buffer;
pub mod decoder;
pub mod event;
pub mod value;

pub use decoder::{BinlogEvent, LogDecoder, RowAction, RowsEvent};
pub use value::{ColumnValue, RenderHint};
