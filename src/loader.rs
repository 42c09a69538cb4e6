//! Artifact loader: walks the migration directory, parses file names,
//! merges paired SQL files, applies the plan filter, and orders the result.
//!
//! Subdirectories are recursed but contribute to the same flat version
//! namespace; versions must be unique across the whole tree.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::codec;
use crate::config::Format;
use crate::domain::Direction;
use crate::error::{MigrateError, MigrateResult};
use crate::filter::Filter;
use crate::logger::ConsoleLogger;

const POSTFIX_UP: &str = ".up";
const POSTFIX_DOWN: &str = ".down";

/// An in-memory plan item assembled from one or two files on disk.
///
/// For the SQL format the up and down sides come from separate files and a
/// missing or deliberately empty side leaves its query empty. For the Rust
/// format both paths point at the same source file.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMigration {
    pub version: u64,
    pub name: String,
    pub format: Format,
    pub path_up: Option<PathBuf>,
    pub path_down: Option<PathBuf>,
    pub query_up: String,
    pub query_down: String,
}

impl RawMigration {
    pub fn path(&self, direction: Direction) -> Option<&Path> {
        match direction {
            Direction::Up => self.path_up.as_deref(),
            Direction::Down => self.path_down.as_deref(),
        }
    }

    pub fn query(&self, direction: Direction) -> &str {
        match direction {
            Direction::Up => &self.query_up,
            Direction::Down => &self.query_down,
        }
    }
}

pub struct Loader<'a> {
    logger: &'a ConsoleLogger,
    token: CancellationToken,
    format: Format,
}

impl<'a> Loader<'a> {
    pub fn new(logger: &'a ConsoleLogger, token: CancellationToken, format: Format) -> Loader<'a> {
        Loader {
            logger,
            token,
            format,
        }
    }

    /// Walk `root` and return the filtered plan, sorted ascending for up and
    /// descending for down.
    pub fn load(
        &self,
        filter: &Filter,
        root: &Path,
        direction: Direction,
    ) -> MigrateResult<Vec<RawMigration>> {
        if root.as_os_str().is_empty() || !root.exists() {
            return Err(MigrateError::MigrationPath(root.to_path_buf()));
        }

        let mut list: Vec<RawMigration> = Vec::new();
        let mut by_version: HashMap<u64, usize> = HashMap::new();

        for entry in WalkDir::new(root) {
            if self.token.is_cancelled() {
                return Err(MigrateError::Interrupted);
            }

            let entry = entry.map_err(|err| MigrateError::ReadFile {
                path: err
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| root.to_path_buf()),
                detail: err.to_string(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let Some(migration) = self.parse_file(path)? else {
                self.logger
                    .debug(&format!("skipped {} file", path.display()));
                continue;
            };

            if filter.is_excluded(&migration) || !filter.allows(&migration, direction) {
                self.logger
                    .debug(&format!("{} file not loaded", path.display()));
                continue;
            }

            add_migration(&mut list, &mut by_version, migration)?;
        }

        match direction {
            Direction::Up => list.sort_by_key(|m| m.version),
            Direction::Down => list.sort_by(|a, b| b.version.cmp(&a.version)),
        }

        Ok(list)
    }

    /// Parse one file into a partial plan item. `Ok(None)` means the file is
    /// not a migration for the current format and is skipped.
    fn parse_file(&self, path: &Path) -> MigrateResult<Option<RawMigration>> {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            return Ok(None);
        };

        let ext = self.format.extension();
        let Some(stem) = file_name.strip_suffix(&format!(".{ext}")) else {
            return Ok(None);
        };

        let mut migration = RawMigration {
            version: 0,
            name: String::new(),
            format: self.format,
            path_up: None,
            path_down: None,
            query_up: String::new(),
            query_down: String::new(),
        };

        let base = match self.format {
            Format::Rust => {
                migration.path_up = Some(path.to_path_buf());
                migration.path_down = Some(path.to_path_buf());
                stem
            }
            Format::Sql => {
                let query = fs::read_to_string(path).map_err(|err| MigrateError::ReadFile {
                    path: path.to_path_buf(),
                    detail: err.to_string(),
                })?;

                if let Some(base) = stem.strip_suffix(POSTFIX_UP) {
                    migration.path_up = Some(path.to_path_buf());
                    migration.query_up = query;
                    base
                } else if let Some(base) = stem.strip_suffix(POSTFIX_DOWN) {
                    migration.path_down = Some(path.to_path_buf());
                    migration.query_down = query;
                    base
                } else {
                    return Err(MigrateError::Postfix(path.to_path_buf()));
                }
            }
        };

        let Some((version, raw_name)) = codec::split_base(base) else {
            return Err(MigrateError::SeparatorNotFound(path.to_path_buf()));
        };

        migration.name = codec::logical_name(raw_name);
        migration.version = match version.parse::<u64>() {
            // The ledger stores versions as BIGINT, so they must fit in i64.
            Ok(v) if v > 0 && i64::try_from(v).is_ok() => v,
            _ => return Err(MigrateError::MigrateVersionFile(path.to_path_buf())),
        };

        Ok(Some(migration))
    }
}

/// Insert a parsed migration, merging SQL pairs that share a version.
fn add_migration(
    list: &mut Vec<RawMigration>,
    by_version: &mut HashMap<u64, usize>,
    migration: RawMigration,
) -> MigrateResult<()> {
    let Some(&idx) = by_version.get(&migration.version) else {
        by_version.insert(migration.version, list.len());
        list.push(migration);
        return Ok(());
    };

    let existing = &mut list[idx];
    if existing.format == Format::Rust {
        return Err(MigrateError::VersionNotUnique(migration.version));
    }
    if existing.name != migration.name {
        return Err(MigrateError::SqlPairNameMismatch {
            version: migration.version,
            existing: existing.name.clone(),
            incoming: migration.name,
        });
    }

    if existing.path_up.is_none() {
        existing.path_up = migration.path_up;
    }
    if existing.path_down.is_none() {
        existing.path_down = migration.path_down;
    }
    if existing.query_up.is_empty() {
        existing.query_up = migration.query_up;
    }
    if existing.query_down.is_empty() {
        existing.query_down = migration.query_down;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Migration;
    use std::fs;

    fn loader(logger: &ConsoleLogger, format: Format) -> Loader<'_> {
        Loader::new(logger, CancellationToken::new(), format)
    }

    fn quiet_logger() -> ConsoleLogger {
        ConsoleLogger::new(crate::logger::Level::Error, None).unwrap()
    }

    fn ledger_row(version: u64, name: &str, is_applied: bool) -> Migration {
        Migration {
            version,
            name: name.to_string(),
            is_applied,
            update_at: chrono::NaiveDateTime::default(),
        }
    }

    fn write_sql_pair(dir: &Path, version: u64, name: &str, up: &str, down: &str) {
        fs::write(dir.join(format!("{version}_{name}.up.sql")), up).unwrap();
        fs::write(dir.join(format!("{version}_{name}.down.sql")), down).unwrap();
    }

    #[test]
    fn test_load_merges_sql_pairs_and_sorts_ascending() {
        let dir = tempfile::tempdir().unwrap();
        write_sql_pair(dir.path(), 2, "second", "CREATE TABLE b ();", "DROP TABLE b;");
        write_sql_pair(dir.path(), 1, "first", "CREATE TABLE a ();", "DROP TABLE a;");

        let logger = quiet_logger();
        let plan = loader(&logger, Format::Sql)
            .load(&Filter::default(), dir.path(), Direction::Up)
            .unwrap();

        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].version, 1);
        assert_eq!(plan[0].name, "first");
        assert_eq!(plan[0].query_up, "CREATE TABLE a ();");
        assert_eq!(plan[0].query_down, "DROP TABLE a;");
        assert_eq!(plan[1].version, 2);
    }

    #[test]
    fn test_load_descends_for_down() {
        let dir = tempfile::tempdir().unwrap();
        write_sql_pair(dir.path(), 1, "first", "up", "down");
        write_sql_pair(dir.path(), 3, "third", "up", "down");

        let logger = quiet_logger();
        let filter = Filter {
            recent: Some(ledger_row(3, "third", true)),
            ..Filter::default()
        };
        let plan = loader(&logger, Format::Sql)
            .load(&filter, dir.path(), Direction::Down)
            .unwrap();

        assert_eq!(
            plan.iter().map(|m| m.version).collect::<Vec<_>>(),
            vec![3, 1]
        );
    }

    #[test]
    fn test_load_recurses_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("third_table");
        fs::create_dir(&nested).unwrap();
        write_sql_pair(dir.path(), 1, "first", "up", "down");
        write_sql_pair(&nested, 3, "third", "up", "down");

        let logger = quiet_logger();
        let plan = loader(&logger, Format::Sql)
            .load(&Filter::default(), dir.path(), Direction::Up)
            .unwrap();

        assert_eq!(
            plan.iter().map(|m| m.version).collect::<Vec<_>>(),
            vec![1, 3]
        );
    }

    #[test]
    fn test_load_single_sided_pair_keeps_other_side_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("5_orphan.up.sql"), "CREATE TABLE o ();").unwrap();

        let logger = quiet_logger();
        let plan = loader(&logger, Format::Sql)
            .load(&Filter::default(), dir.path(), Direction::Up)
            .unwrap();

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].query_up, "CREATE TABLE o ();");
        assert!(plan[0].query_down.is_empty());
        assert!(plan[0].path_down.is_none());
    }

    #[test]
    fn test_load_ignores_foreign_extensions() {
        let dir = tempfile::tempdir().unwrap();
        write_sql_pair(dir.path(), 1, "first", "up", "down");
        fs::write(dir.path().join("notes.txt"), "not a migration").unwrap();
        fs::write(dir.path().join("2_later.rs"), "// rust file").unwrap();

        let logger = quiet_logger();
        let plan = loader(&logger, Format::Sql)
            .load(&Filter::default(), dir.path(), Direction::Up)
            .unwrap();
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn test_missing_postfix_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("1_plain.sql"), "SELECT 1;").unwrap();

        let logger = quiet_logger();
        let err = loader(&logger, Format::Sql)
            .load(&Filter::default(), dir.path(), Direction::Up)
            .unwrap_err();
        assert!(matches!(err, MigrateError::Postfix(_)));
    }

    #[test]
    fn test_missing_separator_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("1noseparator.up.sql"), "SELECT 1;").unwrap();

        let logger = quiet_logger();
        let err = loader(&logger, Format::Sql)
            .load(&Filter::default(), dir.path(), Direction::Up)
            .unwrap_err();
        assert!(matches!(err, MigrateError::SeparatorNotFound(_)));
    }

    #[test]
    fn test_zero_version_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("0_zero.up.sql"), "SELECT 1;").unwrap();

        let logger = quiet_logger();
        let err = loader(&logger, Format::Sql)
            .load(&Filter::default(), dir.path(), Direction::Up)
            .unwrap_err();
        assert!(matches!(err, MigrateError::MigrateVersionFile(_)));
    }

    #[test]
    fn test_duplicate_rust_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("sub");
        fs::create_dir(&nested).unwrap();
        fs::write(dir.path().join("1_one.rs"), "// a").unwrap();
        fs::write(nested.join("1_other.rs"), "// b").unwrap();

        let logger = quiet_logger();
        let err = loader(&logger, Format::Rust)
            .load(&Filter::default(), dir.path(), Direction::Up)
            .unwrap_err();
        assert!(matches!(err, MigrateError::VersionNotUnique(1)));
    }

    #[test]
    fn test_sql_pair_name_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("1_first.up.sql"), "up").unwrap();
        fs::write(dir.path().join("1_other.down.sql"), "down").unwrap();

        let logger = quiet_logger();
        let err = loader(&logger, Format::Sql)
            .load(&Filter::default(), dir.path(), Direction::Up)
            .unwrap_err();
        assert!(matches!(
            err,
            MigrateError::SqlPairNameMismatch { version: 1, .. }
        ));
    }

    #[test]
    fn test_rust_format_points_both_sides_at_one_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("7_add_users.rs"), "// migration").unwrap();

        let logger = quiet_logger();
        let plan = loader(&logger, Format::Rust)
            .load(&Filter::default(), dir.path(), Direction::Up)
            .unwrap();

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].name, "addUsers");
        assert_eq!(plan[0].path_up, plan[0].path_down);
    }

    #[test]
    fn test_excluded_versions_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        write_sql_pair(dir.path(), 1, "first", "up", "down");
        write_sql_pair(dir.path(), 2, "second", "up", "down");

        let mut exclude = HashMap::new();
        exclude.insert(1, ledger_row(1, "first", true));
        let filter = Filter {
            exclude,
            ..Filter::default()
        };

        let logger = quiet_logger();
        let plan = loader(&logger, Format::Sql)
            .load(&filter, dir.path(), Direction::Up)
            .unwrap();
        assert_eq!(
            plan.iter().map(|m| m.version).collect::<Vec<_>>(),
            vec![2]
        );
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let logger = quiet_logger();
        let err = loader(&logger, Format::Sql)
            .load(
                &Filter::default(),
                Path::new("/no/such/migrations"),
                Direction::Up,
            )
            .unwrap_err();
        assert!(matches!(err, MigrateError::MigrationPath(_)));
    }
}
