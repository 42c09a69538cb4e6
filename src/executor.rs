//! SQL executor: applies a planned batch of SQL migrations, one reservation
//! transaction per migration.

use crate::domain::Direction;
use crate::error::MigrateError;
use crate::ledger::Ledger;
use crate::loader::RawMigration;
use crate::logger::ConsoleLogger;

/// Outcome of a batch. `applied` counts the migrations that committed before
/// `failure` (if any) stopped the batch; partial progress is preserved.
pub struct BatchReport {
    pub applied: usize,
    pub failure: Option<MigrateError>,
}

impl BatchReport {
    fn done(applied: usize) -> BatchReport {
        BatchReport {
            applied,
            failure: None,
        }
    }

    fn stopped(applied: usize, failure: MigrateError) -> BatchReport {
        BatchReport {
            applied,
            failure: Some(failure),
        }
    }
}

/// Run the plan in its already-sorted order.
///
/// An empty up query means the user created an empty migration file; it is
/// skipped with a warning and the ledger is not touched. A reservation that
/// affects no row means the version already reached the requested state
/// (idempotent re-run or a concurrent apply) and advances the loop.
pub async fn run_sql_migrations(
    ledger: &mut Ledger<'_>,
    logger: &ConsoleLogger,
    plan: &[RawMigration],
    direction: Direction,
) -> BatchReport {
    let mut applied = 0;

    for migration in plan {
        let query = migration.query(direction);

        if direction.is_up() && query.is_empty() {
            let path = migration
                .path(direction)
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| format!("version {}", migration.version));
            logger.warn(&format!(
                "{path} empty migration file detected, it will be skipped"
            ));
            continue;
        }

        let tx = match ledger
            .begin_tx_migration(migration.version, &migration.name, direction.is_up())
            .await
        {
            Ok(tx) => tx,
            Err(MigrateError::QueryNoAffectRows) => continue,
            Err(err) => return BatchReport::stopped(applied, err),
        };

        logger.info(&format!(
            "running {} migration with version {} ({})...",
            migration.name,
            migration.version,
            direction.label()
        ));

        if let Err(err) = tx.batch_execute(query).await {
            let failure = match tx.rollback().await {
                Ok(()) => MigrateError::ApplyingMigration(err.to_string()),
                Err(rollback_err) => MigrateError::TransactionCancel(format!(
                    "{}: {rollback_err}",
                    MigrateError::ApplyingMigration(err.to_string())
                )),
            };
            return BatchReport::stopped(applied, failure);
        }

        if let Err(err) = tx.commit().await {
            // The body already ran; without the ledger acknowledgement the
            // operator must reconcile manually.
            return BatchReport::stopped(
                applied,
                MigrateError::ApplyingMigration(err.to_string()),
            );
        }

        logger.debug(&format!(
            "migration {} ({}) committed",
            migration.version,
            direction.label()
        ));
        applied += 1;
    }

    BatchReport::done(applied)
}
