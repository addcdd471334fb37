use redis::{Client, Commands, Connection};

use crate::error::CacheError;

/// Last acknowledged binlog position, kept in its own redis database
/// so a cache flush can never touch it. Writes go straight to the
/// backend; the producer only advances the offset after the event's
/// effect is in the cache.
pub struct PositionStore {
    conn: Connection,
}

impl PositionStore {
    pub fn from_url(url: &str) -> Result<PositionStore, CacheError> {
        let client = Client::open(url)?;
        Ok(PositionStore {
            conn: client.get_connection()?,
        })
    }

    pub fn get(&mut self) -> Result<Option<(String, u32)>, CacheError> {
        let file: Option<String> = self.conn.get("log_file")?;
        let pos: Option<String> = self.conn.get("log_pos")?;
        match (file, pos) {
            (Some(file), Some(pos)) => {
                // A corrupted offset must surface, not fall back to the
                // start of the file and replay it.
                let pos = pos
                    .parse::<u32>()
                    .map_err(|_| CacheError::BadPosition(pos.clone()))?;
                Ok(Some((file, pos)))
            }
            _ => Ok(None),
        }
    }

    pub fn set_file(&mut self, file: &str) -> Result<(), CacheError> {
        let _: () = self.conn.set("log_file", file)?;
        Ok(())
    }

    pub fn set_pos(&mut self, pos: u32) -> Result<(), CacheError> {
        let _: () = self.conn.set("log_pos", pos)?;
        Ok(())
    }
}
