//! Status-table rendering for the `status` and `version` commands.
//!
//! Applied rows print cyan, unapplied rows blue, matching the console
//! logger's palette.

use colored::Colorize;

use crate::domain::Migration;

const STATUS_HEADERS: [&str; 5] = ["#", "Version", "Name", "Is applied?", "Date update"];
const VERSION_HEADERS: [&str; 3] = ["Version", "Name", "Date update"];

/// Print the full ledger as a table.
pub fn print_migrations(migrations: &[Migration]) {
    let rows: Vec<[String; 5]> = migrations
        .iter()
        .enumerate()
        .map(|(index, m)| {
            [
                (index + 1).to_string(),
                m.version.to_string(),
                m.name.clone(),
                if m.is_applied { "Yes" } else { "No" }.to_string(),
                m.update_at.to_string(),
            ]
        })
        .collect();

    let widths = column_widths(&STATUS_HEADERS, &rows);
    print_separator(&widths);
    print_row(&widths, &STATUS_HEADERS.map(String::from), None);
    print_separator(&widths);
    for (row, migration) in rows.iter().zip(migrations) {
        print_row(&widths, row, Some(migration.is_applied));
    }
    print_separator(&widths);
}

/// Print a single migration (the `version` command).
pub fn print_migration(migration: &Migration) {
    let row = [
        migration.version.to_string(),
        migration.name.clone(),
        migration.update_at.to_string(),
    ];

    let widths = column_widths(&VERSION_HEADERS, std::slice::from_ref(&row));
    print_separator(&widths);
    print_row(&widths, &VERSION_HEADERS.map(String::from), None);
    print_separator(&widths);
    print_row(&widths, &row, Some(migration.is_applied));
    print_separator(&widths);
}

fn column_widths<const N: usize>(headers: &[&str; N], rows: &[[String; N]]) -> [usize; N] {
    let mut widths = headers.map(str::len);
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }
    widths
}

fn print_separator<const N: usize>(widths: &[usize; N]) {
    let mut line = String::from("+");
    for width in widths {
        line.push_str(&"-".repeat(width + 2));
        line.push('+');
    }
    println!("{line}");
}

fn print_row<const N: usize>(widths: &[usize; N], cells: &[String; N], is_applied: Option<bool>) {
    let mut line = String::from("|");
    for (width, cell) in widths.iter().copied().zip(cells) {
        let padded = format!(" {cell:^width$} ");
        let colored = match is_applied {
            Some(true) => padded.cyan().to_string(),
            Some(false) => padded.blue().to_string(),
            None => padded,
        };
        line.push_str(&colored);
        line.push('|');
    }
    println!("{line}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_widths_track_longest_cell() {
        let headers = ["#", "Name"];
        let rows = vec![
            ["1".to_string(), "short".to_string()],
            ["2".to_string(), "a-much-longer-name".to_string()],
        ];
        let widths = column_widths(&headers, &rows);
        assert_eq!(widths, [1, 18]);
    }

    #[test]
    fn test_column_widths_fall_back_to_headers() {
        let headers = ["Version", "Name"];
        let widths = column_widths::<2>(&headers, &[]);
        assert_eq!(widths, [7, 4]);
    }
}
