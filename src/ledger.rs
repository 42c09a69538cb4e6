//! Ledger store: the single live PostgreSQL connection, the migration
//! table, the advisory lock, and the per-migration reservation transaction.
//!
//! The reservation protocol takes a row lock on the target version and flips
//! `is_applied` inside a still-open transaction; the migration body runs in
//! that transaction and the commit/rollback outcome decides the transition.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_postgres::{Client, NoTls, Row, Transaction};

use crate::config::Config;
use crate::domain::Migration;
use crate::error::{MigrateError, MigrateResult};
use crate::logger::ConsoleLogger;

/// Schema holding the ledger table.
pub const MIGRATIONS_SCHEMA: &str = "public";
/// Ledger table name.
pub const MIGRATIONS_TABLE: &str = "tmigration";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
/// Bound on the reservation statement. When a concurrent migrator holds the
/// row lock this fires instead of blocking the batch.
const CHECK_TIMEOUT: Duration = Duration::from_millis(200);

const CREATE_LEDGER: &str = r#"
CREATE TABLE IF NOT EXISTS "public"."tmigration" (
    version BIGINT NOT NULL,
    name VARCHAR(255) NOT NULL,
    is_applied BOOLEAN NOT NULL,
    update_at TIMESTAMP WITHOUT TIME ZONE NOT NULL DEFAULT now()
);
CREATE UNIQUE INDEX IF NOT EXISTS uidx_version ON "public"."tmigration" USING btree(version);
CREATE INDEX IF NOT EXISTS idx_applied_version ON "public"."tmigration" USING btree(is_applied, version);
"#;

const LEDGER_EXISTS: &str = r#"
SELECT EXISTS (
    SELECT FROM information_schema.tables
    WHERE table_schema = $1 AND table_name = $2
)
"#;

const PROVIDE_MIGRATION: &str = r#"
INSERT INTO "public"."tmigration" (version, name, is_applied)
VALUES ($1, $2, FALSE)
ON CONFLICT (version) DO NOTHING
"#;

const RESERVE_MIGRATION: &str = r#"
WITH desired AS (
    SELECT version
    FROM "public"."tmigration"
    WHERE version = $1
      AND is_applied = NOT $2
        FOR UPDATE
)
UPDATE "public"."tmigration" m
SET is_applied = $2,
    update_at  = localtimestamp
FROM desired
WHERE m.version = desired.version
RETURNING m.version
"#;

const RECENT_MIGRATION: &str = r#"
SELECT version, name, is_applied, update_at
FROM "public"."tmigration"
WHERE is_applied = TRUE
ORDER BY version DESC
LIMIT 1
"#;

const MIGRATIONS_BY_DIRECTION: &str = r#"
SELECT version, name, is_applied, update_at
FROM "public"."tmigration"
WHERE is_applied = $1
ORDER BY version DESC
"#;

const STATS: &str = r#"
SELECT version, name, is_applied, update_at
FROM "public"."tmigration"
ORDER BY version
"#;

/// Deterministic advisory-lock key: CRC32/IEEE over the lock name, with
/// optional qualifying keys joined by `:`.
pub fn lock_uid(name: &str, keys: &[&str]) -> u32 {
    if keys.is_empty() {
        crc32fast::hash(name.as_bytes())
    } else {
        let joined = format!("{}:{name}", keys.join(":"));
        crc32fast::hash(joined.as_bytes())
    }
}

pub struct Ledger<'a> {
    logger: &'a ConsoleLogger,
    client: Client,
    // Dropping this stops the connection driver task.
    _shutdown: oneshot::Sender<()>,
}

impl<'a> Ledger<'a> {
    /// Open the connection, make sure the ledger table exists, and take the
    /// advisory lock that serializes migrator processes.
    pub async fn connect(
        config: &Config,
        logger: &'a ConsoleLogger,
        lock_key: u32,
    ) -> MigrateResult<Ledger<'a>> {
        if config.dsn.is_empty() {
            return Err(MigrateError::Connection(
                "no DSN connection string".to_string(),
            ));
        }

        let connect = tokio_postgres::connect(&config.dsn, NoTls);
        let (client, connection) = timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| {
                MigrateError::Connection(format!(
                    "connection timed out after {}s",
                    CONNECT_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|err| MigrateError::Connection(err.to_string()))?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            tokio::select! {
                _ = connection => {}
                _ = shutdown_rx => {}
            }
        });

        let ledger = Ledger {
            logger,
            client,
            _shutdown: shutdown_tx,
        };
        ledger.ensure_schema().await?;
        ledger.lock(lock_key).await?;

        Ok(ledger)
    }

    /// Release the advisory lock and drop the connection. Close failures are
    /// logged, never propagated.
    pub async fn close(self) {
        let unlock = self.client.execute("SELECT pg_advisory_unlock_all()", &[]);
        match timeout(CLOSE_TIMEOUT, unlock).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => self
                .logger
                .error(&format!("failed to release advisory locks: {err}")),
            Err(_) => self
                .logger
                .error("timed out releasing advisory locks on close"),
        }
    }

    async fn ensure_schema(&self) -> MigrateResult<()> {
        let row = self
            .client
            .query_one(LEDGER_EXISTS, &[&MIGRATIONS_SCHEMA, &MIGRATIONS_TABLE])
            .await?;
        if !row.get::<_, bool>(0) {
            self.client.batch_execute(CREATE_LEDGER).await?;
        }
        Ok(())
    }

    async fn lock(&self, uid: u32) -> MigrateResult<()> {
        let row = self
            .client
            .query_one("SELECT pg_try_advisory_lock($1)", &[&i64::from(uid)])
            .await?;
        if !row.get::<_, bool>(0) {
            return Err(MigrateError::LockBusy);
        }
        Ok(())
    }

    /// Create the ledger row for `version` when absent, as not applied.
    /// Idempotent.
    pub async fn provide_migration(&self, version: u64, name: &str) -> MigrateResult<()> {
        if name.is_empty() {
            return Err(MigrateError::MigrationNameRequired);
        }
        let version = i64::try_from(version).map_err(|_| MigrateError::BadVersion)?;
        if version == 0 {
            return Err(MigrateError::BadVersion);
        }

        self.client
            .execute(PROVIDE_MIGRATION, &[&version, &name])
            .await?;
        Ok(())
    }

    /// The reservation protocol for one migration: provide the row, open a
    /// transaction, and flip `is_applied` under a row lock.
    ///
    /// Returns the still-open transaction; the caller runs the migration
    /// body inside it and commits or rolls back. `QueryNoAffectRows` means
    /// the row is already in the requested state and there is nothing to do;
    /// `QueryDeadlineExceeded` hints that a concurrent migrator holds the
    /// row lock.
    pub async fn begin_tx_migration(
        &mut self,
        version: u64,
        name: &str,
        applied: bool,
    ) -> MigrateResult<Transaction<'_>> {
        self.provide_migration(version, name).await?;
        let signed = i64::try_from(version).map_err(|_| MigrateError::BadVersion)?;

        let tx = self.client.transaction().await?;

        let params: [&(dyn tokio_postgres::types::ToSql + Sync); 2] = [&signed, &applied];
        let reserve = tx.execute(RESERVE_MIGRATION, &params);
        let affected = match timeout(CHECK_TIMEOUT, reserve).await {
            Ok(result) => result?,
            // Dropping the timed-out future drops the statement; the
            // transaction itself is rolled back when `tx` goes out of scope.
            Err(_) => return Err(MigrateError::QueryDeadlineExceeded),
        };

        if affected == 0 {
            return Err(MigrateError::QueryNoAffectRows);
        }

        Ok(tx)
    }

    /// The applied row with the greatest version, if any.
    pub async fn recent_migration(&self) -> MigrateResult<Option<Migration>> {
        let row = self.client.query_opt(RECENT_MIGRATION, &[]).await?;
        Ok(row.map(row_to_migration))
    }

    /// All rows with the given `is_applied` status, keyed by version.
    pub async fn migrations_by_direction(
        &self,
        is_applied: bool,
    ) -> MigrateResult<HashMap<u64, Migration>> {
        let rows = self
            .client
            .query(MIGRATIONS_BY_DIRECTION, &[&is_applied])
            .await?;
        Ok(rows
            .into_iter()
            .map(row_to_migration)
            .map(|m| (m.version, m))
            .collect())
    }

    /// The full ledger ordered by version, for the status command.
    pub async fn stats(&self) -> MigrateResult<Vec<Migration>> {
        let rows = self.client.query(STATS, &[]).await?;
        Ok(rows.into_iter().map(row_to_migration).collect())
    }
}

fn row_to_migration(row: Row) -> Migration {
    let version: i64 = row.get("version");
    Migration {
        version: version as u64,
        name: row.get("name"),
        is_applied: row.get("is_applied"),
        update_at: row.get("update_at"),
    }
}
