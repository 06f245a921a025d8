//! SQLite-backed persistent metadata.
//!
//! Holds the content-length table (one row per package basename, written
//! once and treated as authoritative from then on), the last mirror
//! scoring results, and the outcome of IP-family reachability probes.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};
use thiserror::Error;

/// Metadata persistence failure.
#[derive(Debug, Error)]
pub enum MetadataDbError {
    /// Query or connection error from the database layer.
    #[error("metadata database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    /// The database directory could not be created.
    #[error("failed to prepare metadata database directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Percent-encode a path for a `sqlite://` URI so spaces and reserved
/// characters survive URI parsing.
fn sqlite_uri(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let mut encoded = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => encoded.push_str("%25"),
            ' ' => encoded.push_str("%20"),
            '#' => encoded.push_str("%23"),
            '?' => encoded.push_str("%3F"),
            '&' => encoded.push_str("%26"),
            c => encoded.push(c),
        }
    }
    format!("sqlite://{encoded}?mode=rwc")
}

pub(crate) fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Handle to the SQLite metadata database. Cheap to clone.
#[derive(Clone)]
pub struct MetadataDb {
    pool: Pool<Sqlite>,
}

impl MetadataDb {
    /// Opens (or creates) the database at `path` and runs migrations.
    ///
    /// # Errors
    /// [`MetadataDbError::Io`] when the parent directory cannot be
    /// created, [`MetadataDbError::Sqlx`] on connection or migration
    /// failure.
    pub async fn open(path: &Path) -> Result<Self, MetadataDbError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(&sqlite_uri(path))
            .await?;
        let db = MetadataDb { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Opens an in-memory database, for tests.
    ///
    /// # Errors
    /// [`MetadataDbError::Sqlx`] on connection or migration failure.
    pub async fn open_in_memory() -> Result<Self, MetadataDbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = MetadataDb { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<(), MetadataDbError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS content_length (
                name TEXT PRIMARY KEY,
                bytes INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mirrors_status (
                url TEXT PRIMARY KEY,
                score REAL NOT NULL,
                checked_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ip_support (
                family TEXT PRIMARY KEY,
                supported INTEGER NOT NULL,
                checked_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Looks up the recorded total size for a package basename.
    ///
    /// # Errors
    /// Any database error.
    pub async fn content_length(&self, name: &str) -> Result<Option<u64>, MetadataDbError> {
        let row = sqlx::query("SELECT bytes FROM content_length WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get::<i64, _>(0) as u64))
    }

    /// Records the total size for a package basename. The first recorded
    /// value wins; later writes for the same name are ignored.
    ///
    /// # Errors
    /// Any database error.
    pub async fn record_content_length(
        &self,
        name: &str,
        bytes: u64,
    ) -> Result<(), MetadataDbError> {
        sqlx::query("INSERT OR IGNORE INTO content_length (name, bytes) VALUES (?, ?)")
            .bind(name)
            .bind(bytes as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The persisted mirror ranking, best score first.
    ///
    /// # Errors
    /// Any database error.
    pub async fn mirror_scores(&self) -> Result<Vec<(String, f64)>, MetadataDbError> {
        let rows = sqlx::query("SELECT url, score FROM mirrors_status ORDER BY score ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>(0), row.get::<f64, _>(1)))
            .collect())
    }

    /// Replaces the persisted mirror ranking with a fresh scoring round.
    ///
    /// # Errors
    /// Any database error.
    pub async fn replace_mirror_scores(
        &self,
        scores: &[(String, f64)],
    ) -> Result<(), MetadataDbError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM mirrors_status")
            .execute(&mut *tx)
            .await?;
        let checked_at = unix_timestamp();
        for (url, score) in scores {
            sqlx::query("INSERT INTO mirrors_status (url, score, checked_at) VALUES (?, ?, ?)")
                .bind(url)
                .bind(score)
                .bind(checked_at)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// The recorded reachability for an IP family (`"ipv4"` / `"ipv6"`),
    /// if it has been probed before.
    ///
    /// # Errors
    /// Any database error.
    pub async fn ip_support(&self, family: &str) -> Result<Option<bool>, MetadataDbError> {
        let row = sqlx::query("SELECT supported FROM ip_support WHERE family = ?")
            .bind(family)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get::<i64, _>(0) != 0))
    }

    /// Records the outcome of an IP-family reachability probe.
    ///
    /// # Errors
    /// Any database error.
    pub async fn record_ip_support(
        &self,
        family: &str,
        supported: bool,
    ) -> Result<(), MetadataDbError> {
        sqlx::query(
            "INSERT OR REPLACE INTO ip_support (family, supported, checked_at) VALUES (?, ?, ?)",
        )
        .bind(family)
        .bind(supported as i64)
        .bind(unix_timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn content_length_round_trip() {
        let db = MetadataDb::open_in_memory().await.unwrap();
        assert_eq!(db.content_length("linux.pkg").await.unwrap(), None);

        db.record_content_length("linux.pkg", 123_456).await.unwrap();
        assert_eq!(
            db.content_length("linux.pkg").await.unwrap(),
            Some(123_456)
        );
    }

    #[tokio::test]
    async fn first_recorded_length_wins() {
        let db = MetadataDb::open_in_memory().await.unwrap();
        db.record_content_length("linux.pkg", 1000).await.unwrap();
        db.record_content_length("linux.pkg", 2000).await.unwrap();
        assert_eq!(db.content_length("linux.pkg").await.unwrap(), Some(1000));
    }

    #[tokio::test]
    async fn mirror_scores_are_ordered_and_replaceable() {
        let db = MetadataDb::open_in_memory().await.unwrap();
        db.replace_mirror_scores(&[
            ("https://slow.example".to_string(), 2.0),
            ("https://fast.example".to_string(), 0.1),
        ])
        .await
        .unwrap();

        let scores = db.mirror_scores().await.unwrap();
        assert_eq!(scores[0].0, "https://fast.example");
        assert_eq!(scores[1].0, "https://slow.example");

        db.replace_mirror_scores(&[("https://other.example".to_string(), 0.5)])
            .await
            .unwrap();
        let scores = db.mirror_scores().await.unwrap();
        assert_eq!(scores.len(), 1);
    }

    #[tokio::test]
    async fn ip_support_round_trip() {
        let db = MetadataDb::open_in_memory().await.unwrap();
        assert_eq!(db.ip_support("ipv6").await.unwrap(), None);
        db.record_ip_support("ipv6", false).await.unwrap();
        assert_eq!(db.ip_support("ipv6").await.unwrap(), Some(false));
        db.record_ip_support("ipv6", true).await.unwrap();
        assert_eq!(db.ip_support("ipv6").await.unwrap(), Some(true));
    }
}
