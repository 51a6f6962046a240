//! Persistence gateway: a connection pool plus the process-wide write lock.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("timed out after {0:?} waiting for the write lock")]
    LockTimeout(Duration),
    #[error("unsupported database backend: {0}")]
    UnsupportedBackend(String),
    #[error("invalid database url: {0}")]
    InvalidUrl(String),
    #[error("io error preparing database: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::Sqlx(sqlx::Error::Database(db)) if db.is_unique_violation())
    }
}

/// Parsed `DATABASE_URL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseUrl {
    Sqlite(String),
    Postgres(String),
}

impl DatabaseUrl {
    pub fn parse(raw: &str) -> Result<Self, StorageError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(StorageError::InvalidUrl("empty database url".to_string()));
        }
        if raw.starts_with("sqlite:") {
            return Ok(Self::Sqlite(raw.to_string()));
        }
        if raw.starts_with("postgres://") || raw.starts_with("postgresql://") {
            return Ok(Self::Postgres(raw.to_string()));
        }
        if raw.contains("://") {
            return Err(StorageError::InvalidUrl(raw.to_string()));
        }
        // Bare paths name a local SQLite file.
        Ok(Self::Sqlite(format!("sqlite:{raw}")))
    }

    pub fn dialect(&self) -> Dialect {
        match self {
            Self::Sqlite(_) => Dialect::Sqlite,
            Self::Postgres(_) => Dialect::Postgres,
        }
    }
}

/// SQL dialect differences the gateway papers over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    /// Rewrite `?` placeholders into the dialect's positional form.
    /// Question marks inside single-quoted literals are left alone.
    pub fn translate(&self, sql: &str) -> String {
        match self {
            Self::Sqlite => sql.to_string(),
            Self::Postgres => {
                let mut out = String::with_capacity(sql.len() + 8);
                let mut index = 0usize;
                let mut in_literal = false;
                for ch in sql.chars() {
                    match ch {
                        '\'' => {
                            in_literal = !in_literal;
                            out.push(ch);
                        }
                        '?' if !in_literal => {
                            index += 1;
                            out.push('$');
                            out.push_str(&index.to_string());
                        }
                        _ => out.push(ch),
                    }
                }
                out
            }
        }
    }

    pub fn autoincrement_pk(&self) -> &'static str {
        match self {
            Self::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
            Self::Postgres => "SERIAL PRIMARY KEY",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DbConfig {
    pub busy_timeout: Duration,
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(30),
            max_connections: 8,
        }
    }
}

/// Shared handle to the store. Cloning shares the pool and the write lock.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
    dialect: Dialect,
    lock_timeout: Duration,
}

impl Database {
    pub async fn connect(url: &str, config: DbConfig) -> Result<Self, StorageError> {
        let parsed = DatabaseUrl::parse(url)?;
        let DatabaseUrl::Sqlite(sqlite_url) = &parsed else {
            return Err(StorageError::UnsupportedBackend(
                "postgres (only the embedded sqlite engine is wired)".to_string(),
            ));
        };

        let options = SqliteConnectOptions::from_str(sqlite_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout);

        let in_memory = sqlite_url.contains(":memory:");
        if !in_memory {
            if let Some(parent) = options.get_filename().parent() {
                if parent != Path::new("") {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
        }

        // Every in-memory connection is its own database, so pin the pool to one.
        let max_connections = if in_memory { 1 } else { config.max_connections.max(1) };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(config.busy_timeout)
            .connect_with(options)
            .await?;

        info!(url = %sqlite_url, max_connections, "database connected");

        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
            dialect: parsed.dialect(),
            lock_timeout: config.busy_timeout,
        })
    }

    /// Pool for read queries. Reads never take the write lock.
    pub fn reader(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn sql(&self, sql: &str) -> String {
        self.dialect.translate(sql)
    }

    /// Acquire the write lock and open a transaction.
    ///
    /// The lock is held until the returned scope is committed or dropped;
    /// dropping without commit rolls the transaction back.
    pub async fn begin_write(&self) -> Result<WriteScope, StorageError> {
        let waited = Instant::now();
        let guard = tokio::time::timeout(self.lock_timeout, self.write_lock.clone().lock_owned())
            .await
            .map_err(|_| StorageError::LockTimeout(self.lock_timeout))?;
        debug!(waited_ms = waited.elapsed().as_millis() as u64, "write lock acquired");
        let tx = self.pool.begin().await?;
        Ok(WriteScope { tx, _guard: guard })
    }

    pub async fn init_schema(&self) -> Result<(), StorageError> {
        let statements = schema_statements(self.dialect);
        let mut scope = self.begin_write().await?;
        for statement in &statements {
            sqlx::query(statement).execute(scope.conn()).await?;
        }
        scope.commit().await?;
        info!(tables = 4, "schema ready");
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// An open write transaction holding the process-wide write lock.
pub struct WriteScope {
    // Field order matters: the transaction drops (and rolls back) before the lock releases.
    tx: Transaction<'static, Sqlite>,
    _guard: OwnedMutexGuard<()>,
}

impl WriteScope {
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    pub async fn commit(self) -> Result<(), StorageError> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), StorageError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn schema_statements(dialect: Dialect) -> Vec<String> {
    vec![
        r#"
        CREATE TABLE IF NOT EXISTS job_leads (
            id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            external_id TEXT NOT NULL,
            title TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            url TEXT NOT NULL DEFAULT '',
            budget TEXT NOT NULL DEFAULT 'N/A',
            company TEXT NOT NULL DEFAULT 'Unknown',
            posted_at TEXT NOT NULL,
            agency_match TEXT,
            match_score INTEGER NOT NULL DEFAULT 0,
            ai_confidence REAL NOT NULL DEFAULT 0,
            match_reasoning TEXT,
            scored INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'new',
            applied INTEGER NOT NULL DEFAULT 0,
            applied_at TEXT,
            applied_by TEXT,
            connect_score INTEGER NOT NULL DEFAULT 0,
            client_signals TEXT,
            client_proposal TEXT,
            client_plan TEXT,
            created_at TEXT NOT NULL
        )
        "#
        .to_string(),
        "CREATE UNIQUE INDEX IF NOT EXISTS job_leads_external_id_key ON job_leads (external_id)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS job_leads_pending_idx ON job_leads (scored, created_at)"
            .to_string(),
        r#"
        CREATE TABLE IF NOT EXISTS job_sources (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            type TEXT NOT NULL,
            url TEXT NOT NULL DEFAULT '',
            parsing_config TEXT,
            enabled INTEGER NOT NULL DEFAULT 1,
            last_checked TEXT
        )
        "#
        .to_string(),
        format!(
            "CREATE TABLE IF NOT EXISTS system_metrics (id {}, metric_type TEXT, value REAL, timestamp TEXT)",
            dialect.autoincrement_pk()
        ),
        r#"
        CREATE TABLE IF NOT EXISTS contacts (
            id TEXT PRIMARY KEY,
            name TEXT,
            role TEXT,
            location TEXT,
            url TEXT,
            email_guess TEXT,
            validation_status TEXT DEFAULT 'pending',
            source TEXT,
            created_at TEXT
        )
        "#
        .to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn temp_db(dir: &tempfile::TempDir) -> Database {
        let url = format!("sqlite:{}", dir.path().join("jobs.db").display());
        let db = Database::connect(&url, DbConfig::default()).await.expect("connect");
        db.init_schema().await.expect("schema");
        db
    }

    #[test]
    fn url_parsing_recognizes_backends() {
        assert_eq!(
            DatabaseUrl::parse("sqlite:data/jobs.db").unwrap(),
            DatabaseUrl::Sqlite("sqlite:data/jobs.db".to_string())
        );
        assert_eq!(
            DatabaseUrl::parse("jobs.db").unwrap(),
            DatabaseUrl::Sqlite("sqlite:jobs.db".to_string())
        );
        assert_eq!(
            DatabaseUrl::parse("postgres://u:p@localhost/jobs").unwrap().dialect(),
            Dialect::Postgres
        );
        assert!(DatabaseUrl::parse("mysql://localhost/jobs").is_err());
        assert!(DatabaseUrl::parse("  ").is_err());
    }

    #[test]
    fn postgres_dialect_numbers_placeholders_outside_literals() {
        let sql = "UPDATE job_leads SET status = 'new?' WHERE id = ? AND source = ?";
        assert_eq!(
            Dialect::Postgres.translate(sql),
            "UPDATE job_leads SET status = 'new?' WHERE id = $1 AND source = $2"
        );
        assert_eq!(Dialect::Sqlite.translate(sql), sql);
        assert_eq!(Dialect::Postgres.autoincrement_pk(), "SERIAL PRIMARY KEY");
    }

    #[tokio::test]
    async fn postgres_url_is_rejected_at_connect() {
        let err = Database::connect("postgres://localhost/jobs", DbConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedBackend(_)));
    }

    #[tokio::test]
    async fn dropped_scope_rolls_back_and_releases_lock() {
        let dir = tempdir().expect("tempdir");
        let db = temp_db(&dir).await;

        {
            let mut scope = db.begin_write().await.unwrap();
            sqlx::query("INSERT INTO job_sources (id, name, type) VALUES ('x', 'X', 'rss')")
                .execute(scope.conn())
                .await
                .unwrap();
        }

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_sources")
            .fetch_one(db.reader())
            .await
            .unwrap();
        assert_eq!(count, 0);

        let scope = tokio::time::timeout(Duration::from_secs(1), db.begin_write())
            .await
            .expect("lock released after drop")
            .unwrap();
        scope.commit().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_write_scopes_never_interleave() {
        let dir = tempdir().expect("tempdir");
        let db = temp_db(&dir).await;

        let first_db = db.clone();
        let first = tokio::spawn(async move {
            let mut scope = first_db.begin_write().await.unwrap();
            sqlx::query("INSERT INTO job_sources (id, name, type) VALUES ('a', 'A', 'rss')")
                .execute(scope.conn())
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            scope.commit().await.unwrap();
            Instant::now()
        });

        // Let the first task take the lock.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second_db = db.clone();
        let second = tokio::spawn(async move {
            let mut scope = second_db.begin_write().await.unwrap();
            let acquired = Instant::now();
            let seen: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_sources")
                .fetch_one(scope.conn())
                .await
                .unwrap();
            scope.commit().await.unwrap();
            (acquired, seen)
        });

        let first_committed = first.await.unwrap();
        let (second_acquired, seen) = second.await.unwrap();
        assert!(second_acquired >= first_committed);
        assert_eq!(seen, 1);
    }

    #[tokio::test]
    async fn lock_wait_is_bounded() {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite:{}", dir.path().join("jobs.db").display());
        let db = Database::connect(
            &url,
            DbConfig {
                busy_timeout: Duration::from_millis(100),
                max_connections: 2,
            },
        )
        .await
        .unwrap();

        let _held = db.begin_write().await.unwrap();
        let err = db.begin_write().await.err().expect("second writer times out");
        assert!(matches!(err, StorageError::LockTimeout(_)));
    }
}
