// ABOUTME: SQLite-backed store for accepted manifests, keyed by generation
// ABOUTME: Lets drift correction resume from the last accepted manifest after a restart

use chrono::{DateTime, Utc};
use dockformer_manifest::{Generation, Manifest, ParseError};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{migrate::MigrateDatabase, Row};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Manifest has no generation assigned")]
    Unstamped,
    #[error("Generation {0} is already stored")]
    DuplicateGeneration(Generation),
    #[error("Stored manifest is corrupt: {0}")]
    Corrupt(String),
    #[error("Stored manifest no longer parses: {0}")]
    Parse(#[from] ParseError),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Path value selecting a throwaway in-memory database
pub const IN_MEMORY: &str = ":memory:";

/// A manifest row as persisted
#[derive(Debug, Clone, PartialEq)]
pub struct StoredManifest {
    pub generation: Generation,
    pub digest: String,
    pub source: String,
    pub container_count: usize,
    pub accepted_at: DateTime<Utc>,
}

impl StoredManifest {
    /// Re-parse the stored source and restamp its original generation
    pub fn manifest(&self) -> StorageResult<Manifest> {
        let manifest = dockformer_manifest::parse(self.source.as_bytes())?;
        Ok(manifest.with_generation(self.generation))
    }

    fn from_row(row: &SqliteRow) -> StorageResult<Self> {
        let generation: i64 = row.try_get("generation")?;
        let container_count: i64 = row.try_get("container_count")?;
        let accepted_at: String = row.try_get("accepted_at")?;

        let accepted_at = DateTime::parse_from_rfc3339(&accepted_at)
            .map_err(|_| StorageError::Corrupt(format!("bad accepted_at '{}'", accepted_at)))?
            .with_timezone(&Utc);

        Ok(Self {
            generation: u64::try_from(generation)
                .map_err(|_| StorageError::Corrupt(format!("negative generation {}", generation)))?,
            digest: row.try_get("digest")?,
            source: row.try_get("source")?,
            container_count: usize::try_from(container_count).unwrap_or_default(),
            accepted_at,
        })
    }
}

/// Durable history of accepted manifests
#[derive(Clone)]
pub struct ManifestStore {
    pool: SqlitePool,
}

impl ManifestStore {
    /// Open (creating if needed) the database at `path`. The special path
    /// `:memory:` opens a private in-memory database.
    pub async fn open(path: &Path) -> StorageResult<Self> {
        if path.as_os_str() == IN_MEMORY {
            return Self::in_memory().await;
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let database_url = format!("sqlite:{}", path.display());
        if !sqlx::Sqlite::database_exists(&database_url).await? {
            debug!("Creating database at: {}", database_url);
            sqlx::Sqlite::create_database(&database_url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&database_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await?;

        info!("Manifest store opened at {}", path.display());
        Self::migrated(pool).await
    }

    pub async fn in_memory() -> StorageResult<Self> {
        // One connection that never idles out, or the database vanishes
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::migrated(pool).await
    }

    async fn migrated(pool: SqlitePool) -> StorageResult<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Persist an accepted manifest. Its generation must already be stamped
    /// and must not have been stored before.
    pub async fn save(&self, manifest: &Manifest) -> StorageResult<()> {
        let generation = manifest.generation();
        if generation == 0 {
            return Err(StorageError::Unstamped);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO manifests (generation, digest, source, container_count, accepted_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(generation as i64)
        .bind(manifest.digest())
        .bind(manifest.source())
        .bind(manifest.len() as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!(generation, digest = manifest.digest(), "Stored manifest");
                Ok(())
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StorageError::DuplicateGeneration(generation))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The most recently accepted manifest, if any
    pub async fn load_latest(&self) -> StorageResult<Option<StoredManifest>> {
        let row = sqlx::query("SELECT * FROM manifests ORDER BY generation DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(StoredManifest::from_row).transpose()
    }

    pub async fn get(&self, generation: Generation) -> StorageResult<Option<StoredManifest>> {
        let row = sqlx::query("SELECT * FROM manifests WHERE generation = ?")
            .bind(generation as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(StoredManifest::from_row).transpose()
    }

    /// Newest first
    pub async fn history(&self, limit: u32) -> StorageResult<Vec<StoredManifest>> {
        let rows = sqlx::query("SELECT * FROM manifests ORDER BY generation DESC LIMIT ?")
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(StoredManifest::from_row).collect()
    }

    /// Highest generation ever stored, 0 when empty
    pub async fn latest_generation(&self) -> StorageResult<Generation> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(generation) FROM manifests")
            .fetch_one(&self.pool)
            .await?;
        Ok(max.and_then(|g| u64::try_from(g).ok()).unwrap_or(0))
    }

    /// Drop all but the newest `keep` generations; returns rows deleted
    pub async fn prune(&self, keep: u32) -> StorageResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM manifests WHERE generation NOT IN (
                SELECT generation FROM manifests ORDER BY generation DESC LIMIT ?
            )
            "#,
        )
        .bind(i64::from(keep.max(1)))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
