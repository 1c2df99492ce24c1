use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use super::{KvProvider, KvRead, KvStore, KvWrite};
use crate::types::{PenumbraError, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_IDLE_READERS: usize = 4;

/// Byte store persisted in a SQLite file.
///
/// Runs in WAL mode: read transactions see a stable snapshot from their first
/// query while a writer holds `BEGIN IMMEDIATE`, which also serializes writers
/// across processes sharing the file.
pub struct SqliteKv {
    path: PathBuf,
    writer: Mutex<Connection>,
    readers: Mutex<Vec<Connection>>,
    closed: AtomicBool,
}

impl SqliteKv {
    /// Opens or creates the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let writer = open_connection(&path)?;
        writer.execute_batch(
            "CREATE TABLE IF NOT EXISTS entries (key TEXT PRIMARY KEY NOT NULL, value BLOB NOT NULL)",
        )?;
        debug!(path = %path.display(), "kv.sqlite.open");
        Ok(Self {
            path,
            writer: Mutex::new(writer),
            readers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Location of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed() {
            return Err(PenumbraError::Closed);
        }
        Ok(())
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}

fn select(conn: &Connection, key: &str) -> Result<Option<Vec<u8>>> {
    Ok(conn
        .query_row(
            "SELECT value FROM entries WHERE key = ?1",
            params![key],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()?)
}

struct SqliteRead<'a> {
    store: &'a SqliteKv,
    conn: Option<Connection>,
}

impl KvRead for SqliteRead<'_> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match &self.conn {
            Some(conn) => select(conn, key),
            None => Err(PenumbraError::Closed),
        }
    }
}

impl Drop for SqliteRead<'_> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if let Err(err) = conn.execute_batch("COMMIT") {
            warn!(error = %err, "kv.sqlite.read_end_failed");
            return;
        }
        let mut idle = self.store.readers.lock();
        if idle.len() < MAX_IDLE_READERS {
            idle.push(conn);
        }
    }
}

struct SqliteWrite<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl KvRead for SqliteWrite<'_> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        select(&self.conn, key)
    }
}

impl KvWrite for SqliteWrite<'_> {
    fn put(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO entries (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn del(&mut self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM entries WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for SqliteWrite<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %err, "kv.sqlite.rollback_failed");
            }
        }
    }
}

impl KvStore for SqliteKv {
    fn read(&self) -> Result<Box<dyn KvRead + '_>> {
        self.ensure_open()?;
        let pooled = self.readers.lock().pop();
        let conn = match pooled {
            Some(conn) => conn,
            None => open_connection(&self.path)?,
        };
        conn.execute_batch("BEGIN")?;
        Ok(Box::new(SqliteRead {
            store: self,
            conn: Some(conn),
        }))
    }

    fn write(&self) -> Result<Box<dyn KvWrite + '_>> {
        self.ensure_open()?;
        let conn = self.writer.lock();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteWrite {
            conn,
            finished: false,
        }))
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.readers.lock().clear();
        Ok(())
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Opens one SQLite file per store name inside a directory.
pub struct SqliteKvProvider {
    dir: PathBuf,
}

impl SqliteKvProvider {
    /// Provider rooted at `dir`; the directory is created on first open.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// File backing the store called `name`.
    pub fn path_for(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(PenumbraError::InvalidArgument(format!(
                "invalid store name '{name}'"
            )));
        }
        Ok(self.dir.join(format!("{name}.sqlite3")))
    }
}

impl KvProvider for SqliteKvProvider {
    fn open(&self, name: &str) -> Result<Arc<dyn KvStore>> {
        let path = self.path_for(name)?;
        fs::create_dir_all(&self.dir)?;
        Ok(Arc::new(SqliteKv::open(path)?))
    }

    fn drop_store(&self, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        for suffix in ["", "-wal", "-shm"] {
            let mut target = path.clone().into_os_string();
            target.push(suffix);
            match fs::remove_file(PathBuf::from(target)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        debug!(store = name, "kv.sqlite.dropped");
        Ok(())
    }
}
