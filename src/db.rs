use std::io;
use std::path::{Path, PathBuf};

use rusqlite::ffi::ErrorCode;
use rusqlite::{Connection, Error as SqliteError, OpenFlags};
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};

#[derive(Debug)]
pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

#[derive(Debug)]
pub struct DatabaseBootstrap {
    pub context: DatabaseContext,
    pub recovered: bool,
}

/// Opens (or creates) the region cache under `data_dir`. A file that is not a
/// readable SQLite database is discarded and rebuilt; everything in it can be
/// fetched again from the provider.
pub fn bootstrap<P: AsRef<Path>>(data_dir: P, database_file: &str) -> AppResult<DatabaseBootstrap> {
    let data_dir = data_dir.as_ref();
    if data_dir.exists() && !data_dir.is_dir() {
        return Err(AppError::Path(format!(
            "{} is not a directory",
            data_dir.display()
        )));
    }
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join(database_file);

    match establish_context(&db_path) {
        Ok(context) => {
            info!(
                target: "database_bootstrap",
                path = %db_path.display(),
                "region cache opened"
            );
            Ok(DatabaseBootstrap {
                context,
                recovered: false,
            })
        }
        Err(AppError::Database(err)) if should_attempt_recovery(&err, &db_path) => {
            warn!(
                target: "database_bootstrap",
                path = %db_path.display(),
                error = %err,
                "region cache failed to open, rebuilding"
            );
            recover_store(&db_path)?;
            let context = establish_context(&db_path)?;
            Ok(DatabaseBootstrap {
                context,
                recovered: true,
            })
        }
        Err(err) => Err(err),
    }
}

pub fn open_in_memory() -> AppResult<Connection> {
    let connection = Connection::open_in_memory()?;
    configure(&connection)?;
    run_migrations(&connection)?;
    Ok(connection)
}

fn establish_context(db_path: &Path) -> AppResult<DatabaseContext> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(db_path, flags)?;
    configure(&connection)?;
    run_migrations(&connection)?;

    Ok(DatabaseContext {
        connection,
        path: db_path.to_path_buf(),
    })
}

fn configure(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
        "#,
    )?;
    Ok(())
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS region (
            osm_id INTEGER PRIMARY KEY,
            place_rank INTEGER NOT NULL,
            importance REAL NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (DATETIME('now'))
        );

        CREATE TABLE IF NOT EXISTS query (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            search_string TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL DEFAULT (DATETIME('now'))
        );

        CREATE TABLE IF NOT EXISTS query_region (
            query_id INTEGER NOT NULL,
            region_osm_id INTEGER NOT NULL,
            importance REAL NOT NULL CHECK (importance >= 0),
            PRIMARY KEY (query_id, region_osm_id),
            FOREIGN KEY (query_id) REFERENCES query(id),
            FOREIGN KEY (region_osm_id) REFERENCES region(osm_id)
        );

        CREATE INDEX IF NOT EXISTS idx_region_place_rank ON region(place_rank);
        "#,
    )?;
    Ok(())
}

fn should_attempt_recovery(err: &SqliteError, db_path: &Path) -> bool {
    if !db_path.exists() {
        return false;
    }

    match err {
        SqliteError::SqliteFailure(code, message) => {
            matches!(code.code, ErrorCode::NotADatabase)
                || message
                    .as_deref()
                    .map(|msg| msg.contains("database disk image is malformed"))
                    .unwrap_or(false)
        }
        _ => false,
    }
}

fn recover_store(db_path: &Path) -> AppResult<()> {
    remove_if_exists(db_path)?;
    remove_if_exists(&sibling_path(db_path, "-wal"))?;
    remove_if_exists(&sibling_path(db_path, "-shm"))?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> AppResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(AppError::Io(err)),
    }
}

fn sibling_path(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    db_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn runs_migrations_and_creates_tables() {
        let dir = tempdir().unwrap();
        let bootstrap = bootstrap(dir.path(), "test.db").unwrap();
        let ctx = bootstrap.context;

        let mut stmt = ctx
            .connection
            .prepare(
                "SELECT name FROM sqlite_master WHERE type='table' AND name IN ('region','query','query_region')",
            )
            .unwrap();
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .count();
        assert_eq!(rows, 3);
        assert!(ctx.path.ends_with("test.db"));
        assert!(!bootstrap.recovered);
    }

    #[test]
    fn reopening_keeps_cached_rows() {
        let dir = tempdir().unwrap();
        {
            let first = bootstrap(dir.path(), "keep.db").unwrap();
            first
                .context
                .connection
                .execute(
                    "INSERT INTO region (osm_id, place_rank, importance, payload) VALUES (1, 4, 0.5, '{}')",
                    [],
                )
                .unwrap();
        }
        let second = bootstrap(dir.path(), "keep.db").unwrap();
        let count: i64 = second
            .context
            .connection
            .query_row("SELECT COUNT(*) FROM region", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
        assert!(!second.recovered);
    }

    #[test]
    fn rebuilds_a_corrupt_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("broken.db"), vec![0x42_u8; 4096]).unwrap();

        let recovered = bootstrap(dir.path(), "broken.db").unwrap();
        assert!(recovered.recovered);
        let count: i64 = recovered
            .context
            .connection
            .query_row("SELECT COUNT(*) FROM query", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn data_dir_must_be_a_directory() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();

        let err = bootstrap(&file, "cache.db").unwrap_err();
        assert!(matches!(err, AppError::Path(_)));
    }

    #[test]
    fn rejects_negative_link_importance() {
        let conn = open_in_memory().unwrap();
        conn.execute(
            "INSERT INTO region (osm_id, place_rank, importance, payload) VALUES (1, 4, 0.5, '{}')",
            [],
        )
        .unwrap();
        conn.execute("INSERT INTO query (search_string) VALUES ('x')", [])
            .unwrap();
        let result = conn.execute(
            "INSERT INTO query_region (query_id, region_osm_id, importance) VALUES (1, 1, -1.0)",
            [],
        );
        assert!(result.is_err());
    }
}
