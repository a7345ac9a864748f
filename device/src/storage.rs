use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::info;

use crate::errors::StoreError;

/// Size of the emulated non-volatile region.
pub const REGION_SIZE: usize = 16;

/// Value of an erased, never-written cell.
const ERASED: u8 = 0xFF;

/// Byte-addressable non-volatile memory. Writes are durable once they return.
pub trait ByteStore {
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), StoreError>;
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StoreError>;
}

fn check_bounds(offset: usize, len: usize) -> Result<(), StoreError> {
    if offset.checked_add(len).map_or(true, |end| end > REGION_SIZE) {
        return Err(StoreError::OutOfBounds {
            offset,
            len,
            size: REGION_SIZE,
        });
    }
    Ok(())
}

/// Keeps the whole region as a single BLOB row in a local SQLite file.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "Opening non-volatile store");
        Self::init(conn)
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS nvram (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                bytes BLOB NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO nvram (id, bytes) VALUES (0, ?1)",
            params![vec![ERASED; REGION_SIZE]],
        )?;
        Ok(SqliteStore { conn })
    }

    fn region(&self) -> Result<Vec<u8>, StoreError> {
        let bytes: Option<Vec<u8>> = self
            .conn
            .query_row("SELECT bytes FROM nvram WHERE id = 0", [], |row| row.get(0))
            .optional()?;
        let mut bytes = bytes.unwrap_or_default();
        // A region written by an older, smaller layout reads as erased past its end.
        bytes.resize(REGION_SIZE, ERASED);
        Ok(bytes)
    }
}

impl ByteStore for SqliteStore {
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), StoreError> {
        check_bounds(offset, buf.len())?;
        let region = self.region()?;
        buf.copy_from_slice(&region[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StoreError> {
        check_bounds(offset, data.len())?;
        let tx = self.conn.transaction()?;
        let mut region: Vec<u8> =
            tx.query_row("SELECT bytes FROM nvram WHERE id = 0", [], |row| row.get(0))?;
        region.resize(REGION_SIZE, ERASED);
        region[offset..offset + data.len()].copy_from_slice(data);
        tx.execute("UPDATE nvram SET bytes = ?1 WHERE id = 0", params![region])?;
        tx.commit()?;
        Ok(())
    }
}

/// Volatile stand-in used by tests.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    bytes: [u8; REGION_SIZE],
}

impl MemoryStore {
    pub fn erased() -> Self {
        MemoryStore {
            bytes: [ERASED; REGION_SIZE],
        }
    }
}

impl ByteStore for MemoryStore {
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), StoreError> {
        check_bounds(offset, buf.len())?;
        buf.copy_from_slice(&self.bytes[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StoreError> {
        check_bounds(offset, data.len())?;
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}
