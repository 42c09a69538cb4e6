//! Program-builder executor for Rust-format migrations.
//!
//! The planned sources are staged into a scratch Cargo project together
//! with a generated driver that reserves each migration and calls its
//! `up_…`/`down_…` entry point. The driver is built and run with the host
//! toolchain; the scratch directory is removed on every path.

use std::fs;
use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::command;
use crate::config::Config;
use crate::domain::Direction;
use crate::error::{MigrateError, MigrateResult};
use crate::loader::RawMigration;
use crate::logger::ConsoleLogger;
use crate::template::{self, DriverEntry};

/// Environment variable carrying the DSN into the generated driver;
/// credentials stay out of the staged sources.
const DSN_ENV: &str = "MIGRATOR_DSN";

pub async fn run_rust_migrations(
    config: &Config,
    logger: &ConsoleLogger,
    token: &CancellationToken,
    plan: &[RawMigration],
    direction: Direction,
) -> MigrateResult<usize> {
    logger.info("building a program for migrations...");

    let scratch = tempfile::Builder::new()
        .prefix("migrator_")
        .tempdir()
        .map_err(|err| MigrateError::BuildProgramForMigrations(err.to_string()))?;

    stage_project(scratch.path(), plan, direction)?;

    command::run(token, "cargo", &["fetch"], scratch.path(), &[])
        .await
        .map_err(build_error)?;

    logger.info("starting a program for migrations...");
    let envs = [(DSN_ENV, config.dsn.clone())];
    command::run_with_graceful_shutdown(
        token,
        "cargo",
        &["run", "--quiet"],
        scratch.path(),
        &envs,
    )
    .await
    .map_err(|err| match err {
        MigrateError::Interrupted => err,
        other => MigrateError::StartingProgramForMigrations(other.to_string()),
    })?;

    // The driver reports row-level failures by a non-zero exit, so reaching
    // here means the whole plan ran.
    Ok(plan.len())
}

fn build_error(err: MigrateError) -> MigrateError {
    match err {
        MigrateError::Interrupted => err,
        other => MigrateError::BuildProgramForMigrations(other.to_string()),
    }
}

/// Copy the planned sources into `<scratch>/src` by base name and write the
/// generated driver and manifest beside them.
fn stage_project(
    scratch: &Path,
    plan: &[RawMigration],
    direction: Direction,
) -> MigrateResult<()> {
    let src = scratch.join("src");
    fs::create_dir_all(&src)
        .map_err(|err| MigrateError::BuildProgramForMigrations(err.to_string()))?;

    let mut entries = Vec::with_capacity(plan.len());
    for migration in plan {
        let source = migration.path(direction).ok_or_else(|| {
            MigrateError::BuildProgramForMigrations(format!(
                "migration {} has no source file",
                migration.version
            ))
        })?;
        let file_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                MigrateError::BuildProgramForMigrations(format!(
                    "migration source has no usable file name: {}",
                    source.display()
                ))
            })?;

        fs::copy(source, src.join(file_name)).map_err(|err| {
            MigrateError::BuildProgramForMigrations(format!(
                "could not copy {}: {err}",
                source.display()
            ))
        })?;

        entries.push(DriverEntry {
            version: migration.version,
            name: migration.name.clone(),
            file_name: file_name.to_string(),
        });
    }

    let write = |path: &Path, contents: &str| {
        fs::write(path, contents)
            .map_err(|err| MigrateError::BuildProgramForMigrations(err.to_string()))
    };
    write(
        &src.join("main.rs"),
        &template::driver_main(&entries, direction),
    )?;
    write(&scratch.join("Cargo.toml"), template::driver_manifest())?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Format;

    fn rust_migration(dir: &Path, version: u64, name: &str) -> RawMigration {
        let path = dir.join(format!("{version}_{name}.rs"));
        fs::write(&path, template::rust_migration_stub(version, name)).unwrap();
        RawMigration {
            version,
            name: crate::codec::logical_name(name),
            format: Format::Rust,
            path_up: Some(path.clone()),
            path_down: Some(path),
            query_up: String::new(),
            query_down: String::new(),
        }
    }

    #[test]
    fn test_stage_project_lays_out_a_cargo_package() {
        let source_dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let plan = vec![
            rust_migration(source_dir.path(), 1, "create_first_table"),
            rust_migration(source_dir.path(), 2, "create_second_table"),
        ];

        stage_project(scratch.path(), &plan, Direction::Up).unwrap();

        assert!(scratch.path().join("Cargo.toml").exists());
        assert!(scratch.path().join("src/main.rs").exists());
        assert!(scratch.path().join("src/1_create_first_table.rs").exists());
        assert!(scratch.path().join("src/2_create_second_table.rs").exists());

        let main = fs::read_to_string(scratch.path().join("src/main.rs")).unwrap();
        assert!(main.contains("migration_1::up_1_create_first_table"));
        assert!(main.contains("migration_2::up_2_create_second_table"));
    }

    #[test]
    fn test_stage_project_flattens_subdirectories() {
        let source_dir = tempfile::tempdir().unwrap();
        let nested = source_dir.path().join("third_table");
        fs::create_dir(&nested).unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let plan = vec![rust_migration(&nested, 3, "create_third_table")];

        stage_project(scratch.path(), &plan, Direction::Down).unwrap();

        assert!(scratch.path().join("src/3_create_third_table.rs").exists());
        let main = fs::read_to_string(scratch.path().join("src/main.rs")).unwrap();
        assert!(main.contains("migration_3::down_3_create_third_table"));
    }
}
