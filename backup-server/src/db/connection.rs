use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;

pub type DbPool = Pool<SqliteConnectionManager>;

const PRAGMAS: &str = "PRAGMA journal_mode = DELETE;
     PRAGMA synchronous = FULL;
     PRAGMA foreign_keys = ON;";

pub fn create_pool(db_path: &Path) -> anyhow::Result<DbPool> {
    let manager = SqliteConnectionManager::file(db_path).with_init(|c| c.execute_batch(PRAGMAS));
    let pool = Pool::builder().max_size(4).build(manager)?;
    Ok(pool)
}

/// Single-connection pool over a private in-memory database
#[cfg(test)]
pub fn create_memory_pool() -> anyhow::Result<DbPool> {
    let manager = SqliteConnectionManager::memory().with_init(|c| c.execute_batch(PRAGMAS));
    let pool = Pool::builder().max_size(1).build(manager)?;
    Ok(pool)
}

/// Run a blocking database closure on the blocking thread pool.
pub async fn with_conn<T, F>(pool: &DbPool, f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        f(&conn)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))?
}

pub fn close_pool(pool: &DbPool) {
    // r2d2 closes connections on drop; make sure nothing is left in a journal
    if let Ok(conn) = pool.get() {
        let _ = conn.execute_batch("PRAGMA optimize");
    }
}
