//! Orchestrator: the public migration operations.
//!
//! Every operation except `create` opens the database connection (which
//! also takes the advisory lock serializing migrator processes), loads and
//! filters the plan, drives the executor for the configured format, and
//! closes the connection on the way out.

use std::fs;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use heck::ToSnakeCase;
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::config::{Config, Format};
use crate::domain::{Direction, Migration};
use crate::error::{MigrateError, MigrateResult};
use crate::executor;
use crate::filter::Filter;
use crate::ledger::{lock_uid, Ledger};
use crate::loader::{Loader, RawMigration};
use crate::logger::ConsoleLogger;
use crate::program;
use crate::template;

/// Name hashed into the advisory-lock key.
const LOCK_NAME: &str = "migrator";

pub struct Migrator {
    config: Config,
    logger: Arc<ConsoleLogger>,
    token: CancellationToken,
}

impl Migrator {
    pub fn new(config: Config, logger: Arc<ConsoleLogger>, token: CancellationToken) -> Migrator {
        Migrator {
            config,
            logger,
            token,
        }
    }

    /// Create migration files for `name`, versioned by the current Unix
    /// time. SQL format writes an empty up/down pair; Rust format writes a
    /// single stub source.
    pub fn create(&self, name: &str) -> MigrateResult<()> {
        let version = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        self.create_migration_file(name, version)
    }

    /// Apply migrations up to `target` inclusive, or all pending ones.
    pub async fn up(&self, target: Option<u64>) -> MigrateResult<usize> {
        let mut ledger = self.connect().await?;
        let result = self.run_plan(&mut ledger, target, Direction::Up).await;
        ledger.close().await;
        result
    }

    /// Roll back migrations down to `target` inclusive.
    pub async fn down(&self, target: u64) -> MigrateResult<usize> {
        let mut ledger = self.connect().await?;
        let result = self
            .run_plan(&mut ledger, Some(target), Direction::Down)
            .await;
        ledger.close().await;
        result
    }

    /// Roll back every applied migration.
    pub async fn down_all(&self) -> MigrateResult<usize> {
        let mut ledger = self.connect().await?;
        let result = self.run_plan(&mut ledger, None, Direction::Down).await;
        ledger.close().await;
        result
    }

    /// Roll back the most recently applied migration and apply it again.
    /// Returns that migration, or `None` when the ledger has none applied.
    pub async fn redo(&self) -> MigrateResult<Option<Migration>> {
        let mut ledger = self.connect().await?;
        let result = self.redo_recent(&mut ledger).await;
        ledger.close().await;
        result
    }

    /// The full ledger ordered by version.
    pub async fn status(&self) -> MigrateResult<Vec<Migration>> {
        let ledger = self.connect().await?;
        let result = ledger.stats().await;
        ledger.close().await;
        result
    }

    /// The most recently applied migration, if any.
    pub async fn version(&self) -> MigrateResult<Option<Migration>> {
        let ledger = self.connect().await?;
        let result = ledger.recent_migration().await;
        ledger.close().await;
        result
    }

    async fn connect(&self) -> MigrateResult<Ledger<'_>> {
        Ledger::connect(
            &self.config,
            self.logger.as_ref(),
            lock_uid(LOCK_NAME, &[]),
        )
        .await
    }

    async fn run_plan(
        &self,
        ledger: &mut Ledger<'_>,
        target: Option<u64>,
        direction: Direction,
    ) -> MigrateResult<usize> {
        let plan = self.load_migrations(ledger, target, direction).await?;
        if plan.is_empty() {
            return Ok(0);
        }
        self.start_migrate(ledger, &plan, direction).await
    }

    async fn redo_recent(&self, ledger: &mut Ledger<'_>) -> MigrateResult<Option<Migration>> {
        let Some(recent) = ledger
            .recent_migration()
            .await
            .map_err(MigrateError::recent)?
        else {
            return Ok(None);
        };

        let plan = self
            .load_migrations(ledger, Some(recent.version), Direction::Down)
            .await?;
        let Some(last) = plan.last().cloned() else {
            return Ok(Some(recent));
        };
        let single = std::slice::from_ref(&last);

        let rolled_back = self.start_migrate(ledger, single, Direction::Down).await?;
        if rolled_back == 0 {
            return Err(MigrateError::ApplyingMigration(format!(
                "failed to roll back migration with version {}",
                recent.version
            )));
        }

        let reapplied = self.start_migrate(ledger, single, Direction::Up).await?;
        if reapplied == 0 {
            return Err(MigrateError::ApplyingMigration(format!(
                "failed to apply migration with version {} again",
                recent.version
            )));
        }

        Ok(Some(recent))
    }

    /// Read the ledger snapshot, build the filter, and walk the migration
    /// directory. Exactly one of the boundary and the recent migration is
    /// set: a user-supplied target wins over the applied high-water mark.
    async fn load_migrations(
        &self,
        ledger: &Ledger<'_>,
        request_to_version: Option<u64>,
        direction: Direction,
    ) -> MigrateResult<Vec<RawMigration>> {
        let exclude = ledger
            .migrations_by_direction(direction.is_up())
            .await
            .map_err(MigrateError::load)?;

        let mut filter = Filter {
            exclude,
            ..Filter::default()
        };
        match request_to_version {
            Some(target) if target > 0 => filter.request_to_version = Some(target),
            _ => {
                filter.recent = ledger
                    .recent_migration()
                    .await
                    .map_err(MigrateError::recent)?;
                // Nothing applied means nothing to roll back; skip the walk.
                if filter.recent.is_none() && direction == Direction::Down {
                    return Ok(Vec::new());
                }
            }
        }

        let loader = Loader::new(
            self.logger.as_ref(),
            self.token.clone(),
            self.config.format,
        );
        loader
            .load(&filter, &self.config.path, direction)
            .map_err(MigrateError::load)
    }

    async fn start_migrate(
        &self,
        ledger: &mut Ledger<'_>,
        plan: &[RawMigration],
        direction: Direction,
    ) -> MigrateResult<usize> {
        match self.config.format {
            Format::Sql => {
                let report =
                    executor::run_sql_migrations(ledger, self.logger.as_ref(), plan, direction)
                        .await;
                match report.failure {
                    Some(failure) => {
                        if report.applied > 0 {
                            self.logger.info(&format!(
                                "{} migrations applied before the failure",
                                report.applied
                            ));
                        }
                        Err(failure)
                    }
                    None => Ok(report.applied),
                }
            }
            Format::Rust => {
                program::run_rust_migrations(
                    &self.config,
                    self.logger.as_ref(),
                    &self.token,
                    plan,
                    direction,
                )
                .await
            }
        }
    }

    /// Write the migration files for an explicit version. Fails when any
    /// target file already exists.
    pub fn create_migration_file(&self, name: &str, version: u64) -> MigrateResult<()> {
        if version == 0 || i64::try_from(version).is_err() {
            return Err(MigrateError::BadVersion);
        }
        if name.trim().is_empty() {
            return Err(MigrateError::MigrationNameRequired);
        }
        if self.config.path.as_os_str().is_empty() {
            return Err(MigrateError::MigrationPath(self.config.path.clone()));
        }

        let sanitized = codec::sanitize_name(name);
        let mut snake = sanitized.to_snake_case();
        if snake.ends_with("test") {
            snake.push('_');
        }
        let file_stem = format!("{version}_{snake}");

        let dir = &self.config.path;
        fs::create_dir_all(dir).map_err(|err| MigrateError::CreateMigrationFile {
            path: dir.clone(),
            detail: err.to_string(),
        })?;

        let paths = match self.config.format {
            Format::Sql => vec![
                dir.join(format!("{file_stem}.up.sql")),
                dir.join(format!("{file_stem}.down.sql")),
            ],
            Format::Rust => vec![dir.join(format!("{file_stem}.rs"))],
        };

        for path in &paths {
            if path.exists() {
                return Err(MigrateError::MigrationFileExists(path.clone()));
            }
        }

        match self.config.format {
            Format::Sql => {
                for path in &paths {
                    fs::File::create(path).map_err(|err| MigrateError::CreateMigrationFile {
                        path: path.clone(),
                        detail: err.to_string(),
                    })?;
                    self.logger
                        .info(&format!("{} created successfully", path.display()));
                }
            }
            Format::Rust => {
                let stub = template::rust_migration_stub(version, &codec::logical_name(&snake));
                fs::write(&paths[0], stub).map_err(|err| MigrateError::CreateMigrationFile {
                    path: paths[0].clone(),
                    detail: err.to_string(),
                })?;
                self.logger
                    .info(&format!("{} created successfully", paths[0].display()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::Level;
    use std::path::Path;

    fn migrator(dir: &Path, format: Format) -> Migrator {
        let config = Config {
            path: dir.to_path_buf(),
            format,
            ..Config::default()
        };
        let logger = Arc::new(ConsoleLogger::new(Level::Error, None).unwrap());
        Migrator::new(config, logger, CancellationToken::new())
    }

    #[test]
    fn test_create_sql_pair() {
        let dir = tempfile::tempdir().unwrap();
        let migrator = migrator(dir.path(), Format::Sql);

        migrator.create_migration_file("bad name *?$%:+=1", 1).unwrap();

        assert!(dir.path().join("1_bad_name_1.up.sql").exists());
        assert!(dir.path().join("1_bad_name_1.down.sql").exists());
        // SQL stubs start out empty; an empty up side is skipped at apply
        // time with a warning.
        let up = fs::read_to_string(dir.path().join("1_bad_name_1.up.sql")).unwrap();
        assert!(up.is_empty());
    }

    #[test]
    fn test_create_rust_stub() {
        let dir = tempfile::tempdir().unwrap();
        let migrator = migrator(dir.path(), Format::Rust);

        migrator
            .create_migration_file("Test empty migration", 4)
            .unwrap();

        let path = dir.path().join("4_test_empty_migration.rs");
        assert!(path.exists());
        let stub = fs::read_to_string(&path).unwrap();
        assert!(stub.contains("pub async fn up_4_test_empty_migration"));
        assert!(stub.contains("pub async fn down_4_test_empty_migration"));
    }

    #[test]
    fn test_create_zero_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let migrator = migrator(dir.path(), Format::Sql);
        let err = migrator.create_migration_file("name", 0).unwrap_err();
        assert!(matches!(err, MigrateError::BadVersion));
    }

    #[test]
    fn test_create_requires_a_name() {
        let dir = tempfile::tempdir().unwrap();
        let migrator = migrator(dir.path(), Format::Sql);
        let err = migrator.create_migration_file("  ", 1).unwrap_err();
        assert!(matches!(err, MigrateError::MigrationNameRequired));
    }

    #[test]
    fn test_create_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let migrator = migrator(dir.path(), Format::Rust);

        migrator.create_migration_file("again", 7).unwrap();
        let err = migrator.create_migration_file("again", 7).unwrap_err();
        assert!(matches!(err, MigrateError::MigrationFileExists(_)));
    }

    #[test]
    fn test_create_guards_test_suffix_in_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let migrator = migrator(dir.path(), Format::Rust);

        migrator.create_migration_file("smoke test", 9).unwrap();

        // A trailing underscore keeps the file from looking like a test
        // source to the toolchain.
        assert!(dir.path().join("9_smoke_test_.rs").exists());
    }

    #[test]
    fn test_created_rust_stub_round_trips_through_the_loader() {
        let dir = tempfile::tempdir().unwrap();
        let migrator = migrator(dir.path(), Format::Rust);
        migrator.create_migration_file("add users", 12).unwrap();

        let logger = ConsoleLogger::new(Level::Error, None).unwrap();
        let loader = Loader::new(&logger, CancellationToken::new(), Format::Rust);
        let plan = loader
            .load(&Filter::default(), dir.path(), Direction::Up)
            .unwrap();

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].version, 12);
        assert_eq!(plan[0].name, "addUsers");

        // The stub's entry points match what the generated driver will call.
        let stub = fs::read_to_string(plan[0].path(Direction::Up).unwrap()).unwrap();
        let up = template::entry_point(Direction::Up, 12, &plan[0].name);
        assert!(stub.contains(&up));
    }
}
