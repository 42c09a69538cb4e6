//! Filename/version codec.
//!
//! Migration artifacts are named `<version>_<name><postfix><ext>` where the
//! version is a positive decimal integer (conventionally a Unix timestamp).
//! This module owns name sanitization, version parsing, and the logical-name
//! form used to compare paired SQL files.

use heck::ToLowerCamelCase;

use crate::error::{MigrateError, MigrateResult};

/// Separator between the version prefix and the migration name.
pub const SEPARATOR: char = '_';

/// Replace every character that is neither letter nor digit with `_`.
///
/// Names ending in `"test"` get a trailing `_` so a generated source file
/// never looks like a test file to the toolchain.
pub fn sanitize_name(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { SEPARATOR })
        .collect();
    if sanitized.ends_with("test") {
        sanitized.push(SEPARATOR);
    }
    sanitized
}

/// The logical name of a migration: lower-camel-cased, then sanitized.
/// Paired SQL files must agree on this form.
pub fn logical_name(raw: &str) -> String {
    sanitize_name(&raw.to_lower_camel_case())
}

/// Parse a version string into a number. Rejects non-numeric input and zero.
pub fn version_from_str(version: &str) -> MigrateResult<u64> {
    match version.parse::<u64>() {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(MigrateError::BadVersion),
    }
}

/// Split a file base name into its version prefix and the remainder after
/// the first separator. Returns `None` when no separator is present.
pub fn split_base(base: &str) -> Option<(&str, &str)> {
    let idx = base.find(SEPARATOR)?;
    Some((&base[..idx], &base[idx + 1..]))
}
