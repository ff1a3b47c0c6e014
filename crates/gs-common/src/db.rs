use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};

use crate::error::{GsError, GsResult};

/// Create a database connection pool.
/// Sets statement_timeout = 10s on every connection to prevent slow queries
/// from exhausting the pool.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("SET statement_timeout = '10s'").await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await
}

/// Process-wide exclusive lock over a (raw, transformed) keyspace pair.
///
/// One process may run the update strategy against a given sink pair at a
/// time. Acquisition is non-blocking with a short retry window; on failure
/// the caller should exit with the lock-contention exit code rather than
/// treat it as a generic fatal error, since a conflicting run is benign
/// under a supervisor that simply restarts later.
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub fn path_for(raw_keyspace: &str, transformed_keyspace: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{raw_keyspace}_{transformed_keyspace}.lock"))
    }

    /// Attempt to acquire the lock, retrying for up to `timeout` before
    /// giving up with [`GsError::LockContention`].
    pub async fn acquire(
        raw_keyspace: &str,
        transformed_keyspace: &str,
        timeout: std::time::Duration,
    ) -> GsResult<Self> {
        let path = Self::path_for(raw_keyspace, transformed_keyspace);
        let deadline = std::time::Instant::now() + timeout;

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut f) => {
                    let _ = write!(f, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if std::time::Instant::now() >= deadline {
                        return Err(GsError::LockContention(path.display().to_string()));
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
                Err(e) => return Err(GsError::Io(e)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
