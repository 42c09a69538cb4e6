//! Source templates: the Rust migration stub written by `create`, and the
//! throwaway driver program synthesized by the program-builder executor.

use std::fmt::Write;

use heck::ToSnakeCase;

use crate::domain::Direction;

/// One migration the generated driver will run, in plan order.
#[derive(Debug, Clone)]
pub struct DriverEntry {
    pub version: u64,
    /// Logical (lower-camel) name recorded in the ledger.
    pub name: String,
    /// Base name of the staged source file inside the scratch `src/`.
    pub file_name: String,
}

/// Entry-point name for a migration function, e.g. `up_1_create_first_table`.
pub fn entry_point(direction: Direction, version: u64, name: &str) -> String {
    let prefix = match direction {
        Direction::Up => "up",
        Direction::Down => "down",
    };
    format!("{prefix}_{version}_{}", name.to_snake_case())
}

/// Stub migration source written by `create` for the Rust format. The
/// function bodies own the transaction; the default is an immediate commit.
pub fn rust_migration_stub(version: u64, name: &str) -> String {
    let up = entry_point(Direction::Up, version, name);
    let down = entry_point(Direction::Down, version, name);
    format!(
        r#"//! Migration {version}: {name}.

use tokio_postgres::Transaction;

/// Apply the migration. The body owns the transaction and must finish it:
/// commit on success, roll back on failure.
pub async fn {up}(tx: Transaction<'_>) -> Result<(), tokio_postgres::Error> {{
    // let rows = tx.execute("-- SQL SCRIPT", &[]).await?;
    // println!("rows affected: {{rows}}");
    tx.commit().await
}}

/// Roll back the migration.
pub async fn {down}(tx: Transaction<'_>) -> Result<(), tokio_postgres::Error> {{
    tx.commit().await
}}
"#
    )
}

/// Manifest of the scratch driver project. The `[workspace]` table detaches
/// it from any workspace enclosing the scratch directory.
pub fn driver_manifest() -> &'static str {
    r#"[package]
name = "migrations"
version = "0.1.0"
edition = "2021"
publish = false

[workspace]

[dependencies]
tokio = { version = "1", features = ["rt-multi-thread", "macros"] }
tokio-postgres = "0.7"
"#
}

const DRIVER_HEADER: &str = r#"//! Generated migration driver. Runs the planned migrations in order
//! inside reservation transactions; exits non-zero on the first error.

use tokio_postgres::{Client, NoTls, Transaction};

"#;

const DRIVER_RUN_OPEN: &str = r#"
#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("migration driver failed: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let dsn = std::env::var("MIGRATOR_DSN")?;
    let (mut client, connection) = tokio_postgres::connect(&dsn, NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });

"#;

const DRIVER_FOOTER: &str = r#"
    Ok(())
}

async fn reserve<'a>(
    client: &'a mut Client,
    version: i64,
    name: &str,
    applied: bool,
) -> Result<Option<Transaction<'a>>, tokio_postgres::Error> {
    client
        .execute(
            "INSERT INTO \"public\".\"tmigration\" (version, name, is_applied) \
             VALUES ($1, $2, FALSE) ON CONFLICT (version) DO NOTHING",
            &[&version, &name],
        )
        .await?;

    let tx = client.transaction().await?;
    let affected = tx
        .execute(
            "WITH desired AS (SELECT version FROM \"public\".\"tmigration\" \
             WHERE version = $1 AND is_applied = NOT $2 FOR UPDATE) \
             UPDATE \"public\".\"tmigration\" m SET is_applied = $2, \
             update_at = localtimestamp FROM desired \
             WHERE m.version = desired.version RETURNING m.version",
            &[&version, &applied],
        )
        .await?;

    if affected == 0 {
        return Ok(None);
    }
    Ok(Some(tx))
}
"#;

/// The generated `src/main.rs` of the driver: reserves each migration in
/// plan order and hands the open transaction to the user's entry point.
/// Commit/rollback decisions stay with the user body; a reservation that
/// affects no row is reported and skipped.
pub fn driver_main(entries: &[DriverEntry], direction: Direction) -> String {
    let mut out = String::from(DRIVER_HEADER);

    for entry in entries {
        let _ = writeln!(
            out,
            "#[path = \"{file}\"]\nmod migration_{version};",
            file = entry.file_name,
            version = entry.version
        );
    }

    out.push_str(DRIVER_RUN_OPEN);

    for entry in entries {
        let function = entry_point(direction, entry.version, &entry.name);
        let _ = writeln!(
            out,
            r#"    println!("running {name} migration with version {version} ({label})...");
    match reserve(&mut client, {version}, "{name}", {applied}).await? {{
        Some(tx) => migration_{version}::{function}(tx).await?,
        None => println!("migration {version} already in the requested state, skipping"),
    }}"#,
            name = entry.name,
            version = entry.version,
            label = direction.label(),
            applied = direction.is_up(),
            function = function,
        );
    }

    out.push_str(DRIVER_FOOTER);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_point_names() {
        assert_eq!(
            entry_point(Direction::Up, 1, "createFirstTable"),
            "up_1_create_first_table"
        );
        assert_eq!(
            entry_point(Direction::Down, 42, "addIndex"),
            "down_42_add_index"
        );
    }

    #[test]
    fn test_stub_exposes_both_entry_points() {
        let stub = rust_migration_stub(4, "testEmptyMigration");
        assert!(stub.contains("pub async fn up_4_test_empty_migration"));
        assert!(stub.contains("pub async fn down_4_test_empty_migration"));
        assert!(stub.contains("tx.commit().await"));
        assert!(stub.contains("use tokio_postgres::Transaction;"));
    }

    #[test]
    fn test_driver_main_wires_modules_in_plan_order() {
        let entries = vec![
            DriverEntry {
                version: 1,
                name: "createFirstTable".into(),
                file_name: "1_create_first_table.rs".into(),
            },
            DriverEntry {
                version: 2,
                name: "createSecondTable".into(),
                file_name: "2_create_second_table.rs".into(),
            },
        ];
        let main = driver_main(&entries, Direction::Up);

        assert!(main.contains("#[path = \"1_create_first_table.rs\"]\nmod migration_1;"));
        assert!(main.contains("migration_1::up_1_create_first_table(tx).await?"));
        assert!(main.contains("migration_2::up_2_create_second_table(tx).await?"));
        assert!(main.contains("FOR UPDATE"));
        assert!(main.contains("MIGRATOR_DSN"));

        // Plan order is preserved in the generated body.
        let first = main.find("reserve(&mut client, 1,").unwrap();
        let second = main.find("reserve(&mut client, 2,").unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_driver_main_down_direction() {
        let entries = vec![DriverEntry {
            version: 3,
            name: "thirdTable".into(),
            file_name: "3_third_table.rs".into(),
        }];
        let main = driver_main(&entries, Direction::Down);
        assert!(main.contains("migration_3::down_3_third_table(tx).await?"));
        assert!(main.contains(r#"reserve(&mut client, 3, "thirdTable", false)"#));
    }

    #[test]
    fn test_driver_manifest_is_self_contained() {
        let manifest = driver_manifest();
        assert!(manifest.contains("[workspace]"));
        assert!(manifest.contains("tokio-postgres"));
    }
}
