//! Configuration loading for the migrator.
//!
//! Settings come from a YAML file (default `config/config.yml`, overridable
//! via `MIGRATOR_CONFIG_PATH` or `-c/--config`) with CLI flags taking
//! precedence. `$VAR`/`${VAR}` references inside values are expanded from
//! the environment.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::logger::Level;

const DEFAULT_CONFIG_PATH: &str = "config/config.yml";
const CONFIG_PATH_ENV: &str = "MIGRATOR_CONFIG_PATH";

/// Migration artifact format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Format {
    /// Paired `.up.sql` / `.down.sql` files.
    Sql,
    /// Single `.rs` source with `up_…` / `down_…` entry points.
    Rust,
}

impl Format {
    /// File extension for this format, without the leading dot.
    pub fn extension(self) -> &'static str {
        match self {
            Format::Sql => "sql",
            Format::Rust => "rs",
        }
    }

    pub fn parse(value: &str) -> Result<Format, crate::error::MigrateError> {
        match value {
            "sql" => Ok(Format::Sql),
            "rust" => Ok(Format::Rust),
            other => Err(crate::error::MigrateError::InvalidFormat(other.to_string())),
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Format::Sql => "sql",
            Format::Rust => "rust",
        })
    }
}

/// Resolved process-wide configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data source name for the target database.
    pub dsn: String,
    /// Directory holding migration artifacts.
    pub path: PathBuf,
    pub format: Format,
    pub log_path: Option<PathBuf>,
    pub log_level: Level,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            dsn: String::new(),
            path: PathBuf::new(),
            format: Format::Sql,
            log_path: None,
            log_level: Level::Info,
        }
    }
}

/// On-disk layout: everything lives under the `migrator` key.
#[derive(Deserialize, Default, Debug)]
struct FileConfig {
    migrator: Option<MigratorSection>,
}

#[derive(Deserialize, Default, Debug)]
struct MigratorSection {
    dsn: Option<String>,
    path: Option<String>,
    format: Option<String>,
    log: Option<LogSection>,
}

#[derive(Deserialize, Default, Debug)]
struct LogSection {
    path: Option<String>,
    level: Option<String>,
}

impl Config {
    /// Load configuration from file.
    ///
    /// An explicitly given path MUST exist. Otherwise `MIGRATOR_CONFIG_PATH`
    /// is consulted, then the default location; when neither exists the
    /// defaults are returned.
    pub fn load(explicit_path: Option<&Path>) -> Result<Config> {
        let config_path = match explicit_path {
            Some(p) => {
                if !p.exists() {
                    bail!("configuration file not found: {}", p.display());
                }
                Some(p.to_path_buf())
            }
            None => match std::env::var(CONFIG_PATH_ENV) {
                Ok(p) if !p.is_empty() => {
                    let p = PathBuf::from(p);
                    if !p.exists() {
                        bail!("configuration file not found: {}", p.display());
                    }
                    Some(p)
                }
                _ => {
                    let default = Path::new(DEFAULT_CONFIG_PATH);
                    default.exists().then(|| default.to_path_buf())
                }
            },
        };

        let Some(config_path) = config_path else {
            return Ok(Config::default());
        };

        let contents = fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let file: FileConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", config_path.display()))?;

        let section = file.migrator.unwrap_or_default();
        let log = section.log.unwrap_or_default();

        let mut config = Config::default();
        if let Some(dsn) = section.dsn {
            config.dsn = expand_env(&dsn);
        }
        if let Some(path) = section.path {
            config.path = PathBuf::from(expand_env(&path));
        }
        if let Some(format) = section.format {
            config.format = Format::parse(&expand_env(&format))?;
        }
        if let Some(path) = log.path {
            config.log_path = Some(PathBuf::from(expand_env(&path)));
        }
        if let Some(level) = log.level {
            let level = expand_env(&level);
            config.log_level =
                Level::parse(&level).with_context(|| format!("unknown log level '{level}'"))?;
        }

        Ok(config)
    }

    /// Apply CLI flag overrides on top of file values.
    pub fn apply_cli(
        &mut self,
        dsn: Option<&str>,
        path: Option<&Path>,
        format: Option<Format>,
        log_path: Option<&Path>,
        log_level: Option<&str>,
    ) -> Result<()> {
        if let Some(dsn) = dsn {
            self.dsn = dsn.to_string();
        }
        if let Some(path) = path {
            self.path = path.to_path_buf();
        }
        if let Some(format) = format {
            self.format = format;
        }
        if let Some(log_path) = log_path {
            self.log_path = Some(log_path.to_path_buf());
        }
        if let Some(level) = log_level {
            self.log_level =
                Level::parse(level).with_context(|| format!("unknown log level '{level}'"))?;
        }
        Ok(())
    }

    /// Replace relative paths with absolute ones so later chdirs (e.g. the
    /// scratch build) cannot change their meaning.
    pub fn absolutize(&mut self) -> Result<()> {
        if !self.path.as_os_str().is_empty() {
            self.path = std::path::absolute(&self.path)
                .with_context(|| format!("invalid migration path {}", self.path.display()))?;
        }
        if let Some(ref log_path) = self.log_path {
            self.log_path = Some(
                std::path::absolute(log_path)
                    .with_context(|| format!("invalid log path {}", log_path.display()))?,
            );
        }
        Ok(())
    }
}

/// Expand `$VAR` and `${VAR}` references from the environment. Undefined
/// variables expand to the empty string.
fn expand_env(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('{') => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if closed {
                    out.push_str(&std::env::var(&name).unwrap_or_default());
                } else {
                    // Unterminated ${ — keep the literal text.
                    out.push_str("${");
                    out.push_str(&name);
                }
            }
            Some(c) if c.is_alphanumeric() || *c == '_' => {
                let mut name = String::new();
                while let Some(c) = chars.peek() {
                    if c.is_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&std::env::var(&name).unwrap_or_default());
            }
            _ => out.push('$'),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.format, Format::Sql);
        assert_eq!(config.log_level, Level::Info);
        assert!(config.dsn.is_empty());
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(Format::parse("sql").unwrap(), Format::Sql);
        assert_eq!(Format::parse("rust").unwrap(), Format::Rust);
        assert!(Format::parse("golang").is_err());
    }

    #[test]
    fn test_format_extension() {
        assert_eq!(Format::Sql.extension(), "sql");
        assert_eq!(Format::Rust.extension(), "rs");
    }

    #[test]
    fn test_expand_env_braced() {
        std::env::set_var("MIGRATOR_TEST_HOST", "localhost");
        assert_eq!(
            expand_env("postgres://${MIGRATOR_TEST_HOST}/db"),
            "postgres://localhost/db"
        );
        std::env::remove_var("MIGRATOR_TEST_HOST");
    }

    #[test]
    fn test_expand_env_bare() {
        std::env::set_var("MIGRATOR_TEST_DB", "appdb");
        assert_eq!(expand_env("db=$MIGRATOR_TEST_DB!"), "db=appdb!");
        std::env::remove_var("MIGRATOR_TEST_DB");
    }

    #[test]
    fn test_expand_env_undefined_is_empty() {
        assert_eq!(expand_env("x${MIGRATOR_TEST_UNDEFINED_12345}y"), "xy");
    }

    #[test]
    fn test_expand_env_plain_dollar() {
        assert_eq!(expand_env("cost: 5$"), "cost: 5$");
    }

    #[test]
    fn test_load_parses_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(
            &path,
            "migrator:\n  dsn: postgres://localhost/app\n  path: migrations\n  format: rust\n  log:\n    level: debug\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.dsn, "postgres://localhost/app");
        assert_eq!(config.path, PathBuf::from("migrations"));
        assert_eq!(config.format, Format::Rust);
        assert_eq!(config.log_level, Level::Debug);
        assert!(config.log_path.is_none());
    }

    #[test]
    fn test_load_rejects_unknown_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, "migrator:\n  format: golang\n").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn test_load_missing_explicit_path_errors() {
        let result = Config::load(Some(Path::new("/definitely/not/here.yml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_overrides_file_values() {
        let mut config = Config {
            dsn: "postgres://file/db".into(),
            ..Config::default()
        };
        config
            .apply_cli(
                Some("postgres://cli/db"),
                Some(Path::new("other")),
                Some(Format::Rust),
                None,
                Some("warn"),
            )
            .unwrap();
        assert_eq!(config.dsn, "postgres://cli/db");
        assert_eq!(config.path, PathBuf::from("other"));
        assert_eq!(config.format, Format::Rust);
        assert_eq!(config.log_level, Level::Warn);
    }
}
