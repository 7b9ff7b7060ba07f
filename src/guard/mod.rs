//! Idempotency guard
//!
//! A durable PROCESSING / COMPLETED / FAILED state machine keyed by an
//! arbitrary work key. Every transition is a single conditional write, so
//! concurrent workers racing on the same key see exactly one winner.
//!
//! Transitions:
//! - none → PROCESSING
//! - PROCESSING → COMPLETED | FAILED
//! - FAILED → PROCESSING (retry)
//! - PROCESSING past its TTL → PROCESSING (abandoned attempt taken over)
//!
//! Finishing is fenced by the attempt number handed out by `begin`, so a
//! worker whose attempt was taken over cannot finish the newer one.

mod schema;

pub use schema::*;

use crate::config::Config;
use crate::error::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuardState {
    Processing,
    Completed,
    Failed,
}

impl GuardState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardState::Processing => "PROCESSING",
            GuardState::Completed => "COMPLETED",
            GuardState::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for GuardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GuardState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PROCESSING" => Ok(GuardState::Processing),
            "COMPLETED" => Ok(GuardState::Completed),
            "FAILED" => Ok(GuardState::Failed),
            _ => Err(Error::Other(format!("Unknown guard state: {}", s))),
        }
    }
}

/// Result of [`IdempotencyGuard::begin`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The caller owns the key and must finish with `mark_completed` or
    /// `mark_failed`
    Acquired { attempt: u32 },
    /// Another worker holds an unexpired PROCESSING record
    InProgress,
    /// The work already finished
    Completed,
}

/// Outcome of [`IdempotencyGuard::run_once`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOnce<T> {
    Ran(T),
    InProgress,
    AlreadyCompleted,
}

#[derive(Debug, Clone, FromRow)]
struct KeyRow {
    key: String,
    state: String,
    attempts: i64,
    error: Option<String>,
    started_at: i64,
    expires_at: i64,
    updated_at: i64,
}

/// Stored state of one key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuardRecord {
    pub key: String,
    pub state: GuardState,
    pub attempts: u32,
    pub error: Option<String>,
    pub started_at_ms: i64,
    pub expires_at_ms: i64,
    pub updated_at_ms: i64,
}

impl TryFrom<KeyRow> for GuardRecord {
    type Error = Error;

    fn try_from(row: KeyRow) -> Result<Self> {
        Ok(Self {
            key: row.key,
            state: row.state.parse()?,
            attempts: row.attempts as u32,
            error: row.error,
            started_at_ms: row.started_at,
            expires_at_ms: row.expires_at,
            updated_at_ms: row.updated_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct IdempotencyGuard {
    pool: SqlitePool,
    ttl: Duration,
}

impl IdempotencyGuard {
    /// Open the guard database configured in `config`
    pub async fn connect(config: &Config) -> Result<Self> {
        let guard = Self::open(&config.paths.db_file).await?;
        Ok(guard.with_ttl(Duration::from_secs(config.guard.ttl_secs)))
    }

    /// Open (creating if needed) a guard database at `db_path`
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        debug!("Connecting to guard database at {:?}", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        Ok(Self {
            pool,
            ttl: Duration::from_secs(crate::config::default_guard_ttl_secs()),
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Try to take ownership of `key`
    pub async fn begin(&self, key: &str) -> Result<Admission> {
        let now = Utc::now().timestamp_millis();
        let expires = now + self.ttl.as_millis() as i64;

        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (key, state, attempts, error, started_at, expires_at, updated_at)
            VALUES (?, 'PROCESSING', 1, NULL, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                state = 'PROCESSING',
                attempts = idempotency_keys.attempts + 1,
                error = NULL,
                started_at = excluded.started_at,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            WHERE idempotency_keys.state = 'FAILED'
               OR (idempotency_keys.state = 'PROCESSING' AND idempotency_keys.expires_at <= excluded.started_at)
            "#,
        )
        .bind(key)
        .bind(now)
        .bind(expires)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let record = self
            .get(key)
            .await?
            .ok_or_else(|| Error::Other(format!("Guard record for {} vanished", key)))?;

        if result.rows_affected() == 1 {
            if record.attempts > 1 {
                info!(key, attempt = record.attempts, "Re-admitted key");
            }
            return Ok(Admission::Acquired {
                attempt: record.attempts,
            });
        }

        match record.state {
            GuardState::Completed => Ok(Admission::Completed),
            GuardState::Processing => Ok(Admission::InProgress),
            // A FAILED row is always re-admitted by the upsert above
            GuardState::Failed => Err(Error::InvalidTransition {
                key: key.to_string(),
                reason: "failed record was not re-admitted".to_string(),
            }),
        }
    }

    /// PROCESSING → COMPLETED for the attempt returned by `begin`
    pub async fn mark_completed(&self, key: &str, attempt: u32) -> Result<()> {
        self.finish(key, attempt, GuardState::Completed, None).await
    }

    /// PROCESSING → FAILED for the attempt returned by `begin`
    pub async fn mark_failed(&self, key: &str, attempt: u32, reason: &str) -> Result<()> {
        self.finish(key, attempt, GuardState::Failed, Some(reason)).await
    }

    async fn finish(
        &self,
        key: &str,
        attempt: u32,
        state: GuardState,
        error: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE idempotency_keys SET state = ?, error = ?, updated_at = ? \
             WHERE key = ? AND state = 'PROCESSING' AND attempts = ?",
        )
        .bind(state.as_str())
        .bind(error)
        .bind(Utc::now().timestamp_millis())
        .bind(key)
        .bind(attempt as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let reason = match self.get(key).await? {
                None => format!("cannot move from absent to {}", state),
                Some(record) if record.attempts != attempt => format!(
                    "attempt {} was superseded by attempt {}",
                    attempt, record.attempts
                ),
                Some(record) => format!("cannot move from {} to {}", record.state, state),
            };
            return Err(Error::InvalidTransition {
                key: key.to_string(),
                reason,
            });
        }
        debug!(key, attempt, state = %state, "Guard transition");
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<GuardRecord>> {
        let row = sqlx::query_as::<_, KeyRow>("SELECT * FROM idempotency_keys WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(GuardRecord::try_from).transpose()
    }

    /// Count of keys per state
    pub async fn counts(&self) -> Result<Vec<(GuardState, u64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM idempotency_keys GROUP BY state ORDER BY state")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(state, count)| Ok((state.parse()?, count as u64)))
            .collect()
    }

    /// Run `work` at most once per key; a failure is recorded and returned
    pub async fn run_once<T, F, Fut>(&self, key: &str, work: F) -> Result<RunOnce<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.begin(key).await? {
            Admission::Acquired { attempt } => match work().await {
                Ok(value) => {
                    self.mark_completed(key, attempt).await?;
                    Ok(RunOnce::Ran(value))
                }
                Err(e) => {
                    warn!(key, attempt, error = %e, "Guarded work failed");
                    self.mark_failed(key, attempt, &e.to_string()).await?;
                    Err(e)
                }
            },
            Admission::InProgress => Ok(RunOnce::InProgress),
            Admission::Completed => Ok(RunOnce::AlreadyCompleted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup_guard(ttl: Duration) -> (IdempotencyGuard, TempDir) {
        let tmp = TempDir::new().unwrap();
        let guard = IdempotencyGuard::open(&tmp.path().join("guard.db"))
            .await
            .unwrap()
            .with_ttl(ttl);
        (guard, tmp)
    }

    #[tokio::test]
    async fn test_double_begin_is_in_progress() {
        let (guard, _tmp) = setup_guard(Duration::from_secs(60)).await;
        assert_eq!(guard.begin("k").await.unwrap(), Admission::Acquired { attempt: 1 });
        assert_eq!(guard.begin("k").await.unwrap(), Admission::InProgress);
    }

    #[tokio::test]
    async fn test_completed_short_circuits() {
        let (guard, _tmp) = setup_guard(Duration::from_secs(60)).await;
        guard.begin("k").await.unwrap();
        guard.mark_completed("k", 1).await.unwrap();
        assert_eq!(guard.begin("k").await.unwrap(), Admission::Completed);

        let record = guard.get("k").await.unwrap().unwrap();
        assert_eq!(record.state, GuardState::Completed);
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn test_failed_is_readmitted() {
        let (guard, _tmp) = setup_guard(Duration::from_secs(60)).await;
        guard.begin("k").await.unwrap();
        guard.mark_failed("k", 1, "decoder crashed").await.unwrap();
        assert_eq!(
            guard.get("k").await.unwrap().unwrap().error.as_deref(),
            Some("decoder crashed")
        );

        assert_eq!(guard.begin("k").await.unwrap(), Admission::Acquired { attempt: 2 });
        assert!(guard.get("k").await.unwrap().unwrap().error.is_none());
    }

    #[tokio::test]
    async fn test_expired_processing_is_readmitted() {
        let (guard, _tmp) = setup_guard(Duration::from_millis(50)).await;
        guard.begin("k").await.unwrap();
        assert_eq!(guard.begin("k").await.unwrap(), Admission::InProgress);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(guard.begin("k").await.unwrap(), Admission::Acquired { attempt: 2 });
    }

    #[tokio::test]
    async fn test_taken_over_attempt_cannot_finish() {
        let (guard, _tmp) = setup_guard(Duration::from_millis(50)).await;
        assert_eq!(guard.begin("k").await.unwrap(), Admission::Acquired { attempt: 1 });
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(guard.begin("k").await.unwrap(), Admission::Acquired { attempt: 2 });

        assert!(matches!(
            guard.mark_completed("k", 1).await,
            Err(Error::InvalidTransition { .. })
        ));
        assert!(matches!(
            guard.mark_failed("k", 1, "late").await,
            Err(Error::InvalidTransition { .. })
        ));
        assert_eq!(guard.get("k").await.unwrap().unwrap().state, GuardState::Processing);

        guard.mark_completed("k", 2).await.unwrap();
        assert_eq!(guard.get("k").await.unwrap().unwrap().state, GuardState::Completed);
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let (guard, _tmp) = setup_guard(Duration::from_secs(60)).await;
        assert!(matches!(
            guard.mark_completed("missing", 1).await,
            Err(Error::InvalidTransition { .. })
        ));

        guard.begin("k").await.unwrap();
        guard.mark_completed("k", 1).await.unwrap();
        assert!(matches!(
            guard.mark_failed("k", 1, "late").await,
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_once() {
        let (guard, _tmp) = setup_guard(Duration::from_secs(60)).await;

        let first = guard.run_once("job", || async { Ok(42) }).await.unwrap();
        assert_eq!(first, RunOnce::Ran(42));
        let second = guard.run_once("job", || async { Ok(7) }).await.unwrap();
        assert_eq!(second, RunOnce::AlreadyCompleted);

        let err = guard
            .run_once("broken", || async { Err::<(), _>(Error::Other("boom".to_string())) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Other(_)));
        assert_eq!(
            guard.get("broken").await.unwrap().unwrap().state,
            GuardState::Failed
        );
        assert_eq!(
            guard.run_once("broken", || async { Ok(1) }).await.unwrap(),
            RunOnce::Ran(1)
        );

        let counts = guard.counts().await.unwrap();
        assert_eq!(counts, vec![(GuardState::Completed, 2)]);
    }
}
