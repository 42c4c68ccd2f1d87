//! Database-backed store implementations.
//!
//! PostgreSQL synchronizes state across service instances. The rate-limit
//! counter uses a single-statement upsert so the increment and the window
//! reset are atomic; backup-code consumption is a conditional `array_remove`
//! for the same reason.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::Instrument;
use uuid::Uuid;

use crate::events::{EventFilter, EventStore, SecurityEvent, SecurityEventKind};
use crate::mfa::{MfaEnrollment, MfaStore};
use crate::ratelimit::{CounterStore, WindowCounter};
use crate::session::{AdminSession, SessionInsert, SessionStore};

#[derive(Debug)]
pub struct PgCounterStore {
    pool: PgPool,
}

impl PgCounterStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CounterStore for PgCounterStore {
    async fn increment_and_get(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowCounter> {
        // One statement: expired windows restart at 1, live windows bump.
        let query = r"
            INSERT INTO rate_limit_counters (key, window_start, count)
            VALUES ($1, $2, 1)
            ON CONFLICT (key) DO UPDATE SET
                count = CASE
                    WHEN rate_limit_counters.window_start + ($3 * INTERVAL '1 second') <= excluded.window_start
                    THEN 1
                    ELSE rate_limit_counters.count + 1
                END,
                window_start = CASE
                    WHEN rate_limit_counters.window_start + ($3 * INTERVAL '1 second') <= excluded.window_start
                    THEN excluded.window_start
                    ELSE rate_limit_counters.window_start
                END
            RETURNING count, window_start
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT"
        );
        let row = sqlx::query(query)
            .bind(key)
            .bind(now)
            .bind(i64::try_from(window.as_secs()).unwrap_or(i64::MAX))
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to increment rate limit counter")?;

        Ok(WindowCounter {
            count: u32::try_from(row.get::<i32, _>("count")).unwrap_or(u32::MAX),
            window_start: row.get("window_start"),
        })
    }

    async fn peek(&self, key: &str, window: Duration, now: DateTime<Utc>) -> Result<WindowCounter> {
        let query = "SELECT count, window_start FROM rate_limit_counters WHERE key = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT"
        );
        let row = sqlx::query(query)
            .bind(key)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to read rate limit counter")?;

        let fresh = WindowCounter {
            count: 0,
            window_start: now,
        };
        let Some(row) = row else {
            return Ok(fresh);
        };
        let counter = WindowCounter {
            count: u32::try_from(row.get::<i32, _>("count")).unwrap_or(u32::MAX),
            window_start: row.get("window_start"),
        };
        let window = ChronoDuration::from_std(window).context("window out of range")?;
        if now >= counter.window_start + window {
            Ok(fresh)
        } else {
            Ok(counter)
        }
    }
}

#[derive(Debug)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn insert(&self, session: &AdminSession) -> Result<SessionInsert> {
        let query = r"
            INSERT INTO admin_sessions
                (id, user_id, token_hash, client_ip, user_agent, created_at, expires_at, revoked)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT"
        );
        let result = sqlx::query(query)
            .bind(session.id)
            .bind(session.user_id)
            .bind(&session.token_hash)
            .bind(session.client_ip.as_deref())
            .bind(session.user_agent.as_deref())
            .bind(session.created_at)
            .bind(session.expires_at)
            .bind(session.revoked)
            .execute(&self.pool)
            .instrument(span)
            .await;

        match result {
            Ok(_) => Ok(SessionInsert::Inserted),
            Err(err) if is_unique_violation(&err) => Ok(SessionInsert::Conflict),
            Err(err) => Err(err).context("failed to insert admin session"),
        }
    }

    async fn get(&self, token_hash: &[u8]) -> Result<Option<AdminSession>> {
        let query = r"
            SELECT id, user_id, token_hash, client_ip, user_agent, created_at, expires_at, revoked
            FROM admin_sessions
            WHERE token_hash = $1
            LIMIT 1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT"
        );
        let row = sqlx::query(query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup admin session")?;

        let Some(row) = row else {
            return Ok(None);
        };

        // Record activity for audit visibility without touching expires_at.
        let query = "UPDATE admin_sessions SET last_seen_at = NOW() WHERE token_hash = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE"
        );
        sqlx::query(query)
            .bind(token_hash)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to update session last_seen_at")?;

        Ok(Some(AdminSession {
            id: row.get("id"),
            user_id: row.get("user_id"),
            token_hash: row.get("token_hash"),
            client_ip: row.get("client_ip"),
            user_agent: row.get("user_agent"),
            created_at: row.get("created_at"),
            expires_at: row.get("expires_at"),
            revoked: row.get("revoked"),
        }))
    }

    async fn revoke(&self, token_hash: &[u8]) -> Result<()> {
        // Idempotent; revocation is never undone, so this only ever flips
        // the flag one way.
        let query = "UPDATE admin_sessions SET revoked = TRUE WHERE token_hash = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE"
        );
        sqlx::query(query)
            .bind(token_hash)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to revoke admin session")?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct PgMfaStore {
    pool: PgPool,
}

impl PgMfaStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MfaStore for PgMfaStore {
    async fn load(&self, user_id: Uuid) -> Result<Option<MfaEnrollment>> {
        let query = r"
            SELECT user_id, secret, backup_code_hashes, enabled, created_at
            FROM mfa_enrollments
            WHERE user_id = $1
            LIMIT 1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT"
        );
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to load MFA enrollment")?;

        Ok(row.map(|row| MfaEnrollment {
            user_id: row.get("user_id"),
            secret: row.get("secret"),
            backup_code_hashes: row.get("backup_code_hashes"),
            enabled: row.get("enabled"),
            created_at: row.get("created_at"),
        }))
    }

    async fn upsert(&self, enrollment: &MfaEnrollment) -> Result<()> {
        let query = r"
            INSERT INTO mfa_enrollments (user_id, secret, backup_code_hashes, enabled, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id) DO UPDATE SET
                secret = excluded.secret,
                backup_code_hashes = excluded.backup_code_hashes,
                enabled = excluded.enabled,
                created_at = excluded.created_at
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT"
        );
        sqlx::query(query)
            .bind(enrollment.user_id)
            .bind(&enrollment.secret)
            .bind(&enrollment.backup_code_hashes)
            .bind(enrollment.enabled)
            .bind(enrollment.created_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to upsert MFA enrollment")?;
        Ok(())
    }

    async fn consume_backup_code(&self, user_id: Uuid, code_hash: &str) -> Result<bool> {
        // Conditional removal keeps single-use atomic: of two racing
        // verifications, only one statement finds the hash still present.
        let query = r"
            UPDATE mfa_enrollments
            SET backup_code_hashes = array_remove(backup_code_hashes, $2)
            WHERE user_id = $1
              AND $2 = ANY(backup_code_hashes)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE"
        );
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(code_hash)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to consume backup code")?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, user_id: Uuid) -> Result<()> {
        let query = "DELETE FROM mfa_enrollments WHERE user_id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE"
        );
        sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to delete MFA enrollment")?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn append(&self, event: &SecurityEvent) -> Result<()> {
        let details = serde_json::to_string(&event.details)
            .context("failed to serialize event details")?;
        let query = r"
            INSERT INTO security_events
                (id, kind, user_id, client_ip, user_agent, details, created_at)
            VALUES ($1, $2, $3, $4, $5, $6::jsonb, $7)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT"
        );
        sqlx::query(query)
            .bind(event.id)
            .bind(event.kind.as_str())
            .bind(event.user_id)
            .bind(event.client_ip.as_deref())
            .bind(event.user_agent.as_deref())
            .bind(details)
            .bind(event.created_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to append security event")?;
        Ok(())
    }

    async fn recent(
        &self,
        filter: &EventFilter,
        since: DateTime<Utc>,
    ) -> Result<Vec<SecurityEvent>> {
        let query = r"
            SELECT id, kind, user_id, client_ip, user_agent, details::text AS details, created_at
            FROM security_events
            WHERE created_at >= $1
              AND ($2::uuid IS NULL OR user_id = $2)
              AND ($3::text IS NULL OR client_ip = $3)
              AND ($4::text IS NULL OR kind = $4)
            ORDER BY created_at
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT"
        );
        let rows = sqlx::query(query)
            .bind(since)
            .bind(filter.user_id)
            .bind(filter.client_ip.as_deref())
            .bind(filter.kind.map(SecurityEventKind::as_str))
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("failed to read security events")?;

        rows.into_iter()
            .map(|row| {
                let kind_raw: String = row.get("kind");
                let kind = SecurityEventKind::from_str(&kind_raw)
                    .with_context(|| format!("unknown security event kind: {kind_raw}"))?;
                let details_raw: String = row.get("details");
                let details = serde_json::from_str(&details_raw)
                    .context("failed to parse event details")?;
                Ok(SecurityEvent {
                    id: row.get("id"),
                    kind,
                    user_id: row.get("user_id"),
                    client_ip: row.get("client_ip"),
                    user_agent: row.get("user_agent"),
                    details,
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::is_unique_violation;
    use sqlx::error::{DatabaseError, ErrorKind};
    use std::borrow::Cow;
    use std::error::Error as StdError;
    use std::fmt;

    #[derive(Debug)]
    struct TestDbError {
        code: Option<&'static str>,
    }

    impl fmt::Display for TestDbError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test database error")
        }
    }

    impl StdError for TestDbError {}

    impl DatabaseError for TestDbError {
        fn message(&self) -> &'static str {
            "test database error"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            self.code.map(Cow::Borrowed)
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            ErrorKind::UniqueViolation
        }
    }

    #[test]
    fn is_unique_violation_matches_sqlstate() {
        let err = sqlx::Error::Database(Box::new(TestDbError {
            code: Some("23505"),
        }));
        assert!(is_unique_violation(&err));

        let err = sqlx::Error::Database(Box::new(TestDbError {
            code: Some("99999"),
        }));
        assert!(!is_unique_violation(&err));

        let err = sqlx::Error::RowNotFound;
        assert!(!is_unique_violation(&err));
    }
}
