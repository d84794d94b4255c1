//! Table and column level comparison of two live databases.
//!
//! [`snapshot`] reads the tables of one database through its executor;
//! [`diff`] compares a reference snapshot against a target snapshot. Only
//! tables and columns are covered: indexes, constraints, views and routines
//! are not.

use crate::executor::{Dialect, MigrationExecutor, Value};
use crate::migration::MigrationError;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Type and nullability of one column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Lowercased type name as the database reports it
    pub data_type: String,
    pub nullable: bool,
}

impl fmt::Display for ColumnInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.data_type, if self.nullable { "" } else { " not null" })
    }
}

/// Tables of one database, keyed by name, with their columns
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaSnapshot {
    pub tables: BTreeMap<String, BTreeMap<String, ColumnInfo>>,
}

/// A column present on both sides with different definitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnChange {
    pub column: String,
    pub reference: ColumnInfo,
    pub target: ColumnInfo,
}

/// Column differences of a table present on both sides
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableDiff {
    pub table: String,
    pub missing_columns: Vec<String>,
    pub unexpected_columns: Vec<String>,
    pub changed_columns: Vec<ColumnChange>,
}

impl TableDiff {
    fn is_empty(&self) -> bool {
        self.missing_columns.is_empty()
            && self.unexpected_columns.is_empty()
            && self.changed_columns.is_empty()
    }
}

/// Differences of the target relative to the reference
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffResult {
    /// In the reference, not in the target
    pub missing_tables: Vec<String>,
    /// In the target, not in the reference
    pub unexpected_tables: Vec<String>,
    pub changed_tables: Vec<TableDiff>,
}

impl DiffResult {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.missing_tables.is_empty()
            && self.unexpected_tables.is_empty()
            && self.changed_tables.is_empty()
    }
}

impl fmt::Display for DiffResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "No differences");
        }
        for table in &self.missing_tables {
            writeln!(f, "missing table {table}")?;
        }
        for table in &self.unexpected_tables {
            writeln!(f, "unexpected table {table}")?;
        }
        for table in &self.changed_tables {
            for column in &table.missing_columns {
                writeln!(f, "missing column {}.{column}", table.table)?;
            }
            for column in &table.unexpected_columns {
                writeln!(f, "unexpected column {}.{column}", table.table)?;
            }
            for change in &table.changed_columns {
                writeln!(
                    f,
                    "changed column {}.{}: {} -> {}",
                    table.table, change.column, change.reference, change.target
                )?;
            }
        }
        Ok(())
    }
}

/// Read tables and columns of the database behind `executor`
///
/// PostgreSQL: base tables of `current_schema()`. SQLite: every table except
/// SQLite's internal ones. Tables named in `exclude` are left out.
///
/// # Errors
///
/// Returns `MigrationError::Database` if the catalog cannot be read.
pub fn snapshot(
    executor: &dyn MigrationExecutor,
    exclude: &[&str],
) -> Result<SchemaSnapshot, MigrationError> {
    let excluded: BTreeSet<String> = exclude.iter().map(|t| t.to_ascii_lowercase()).collect();
    let mut tables: BTreeMap<String, BTreeMap<String, ColumnInfo>> = BTreeMap::new();

    match executor.dialect() {
        Dialect::Postgres => {
            let rows = executor.query(
                "SELECT c.table_name::text, c.column_name::text, c.data_type::text, \
                        c.is_nullable::text \
                 FROM information_schema.columns c \
                 JOIN information_schema.tables t \
                   ON t.table_schema = c.table_schema AND t.table_name = c.table_name \
                 WHERE c.table_schema = current_schema() AND t.table_type = 'BASE TABLE' \
                 ORDER BY c.table_name, c.ordinal_position",
                &[],
            )?;
            for row in rows {
                let table = row.text(0)?;
                if excluded.contains(&table.to_ascii_lowercase()) {
                    continue;
                }
                tables.entry(table).or_default().insert(
                    row.text(1)?,
                    ColumnInfo {
                        data_type: row.text(2)?.to_ascii_lowercase(),
                        nullable: row.text(3)?.eq_ignore_ascii_case("YES"),
                    },
                );
            }
        }
        Dialect::Sqlite => {
            let names = executor.query(
                "SELECT name FROM sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                &[],
            )?;
            for row in names {
                let table = row.text(0)?;
                if excluded.contains(&table.to_ascii_lowercase()) {
                    continue;
                }
                let columns = executor.query(
                    "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid",
                    &[Value::from(table.as_str())],
                )?;
                let mut info = BTreeMap::new();
                for column in columns {
                    // SQLite reports INTEGER PRIMARY KEY columns as nullable
                    let not_null = column.int(2)? != 0 || column.int(3)? != 0;
                    info.insert(
                        column.text(0)?,
                        ColumnInfo {
                            data_type: column.text(1)?.to_ascii_lowercase(),
                            nullable: !not_null,
                        },
                    );
                }
                tables.insert(table, info);
            }
        }
    }

    Ok(SchemaSnapshot { tables })
}

/// Compare `target` against `reference`
#[must_use]
pub fn diff(reference: &SchemaSnapshot, target: &SchemaSnapshot) -> DiffResult {
    let mut result = DiffResult::default();

    for (table, reference_columns) in &reference.tables {
        let Some(target_columns) = target.tables.get(table) else {
            result.missing_tables.push(table.clone());
            continue;
        };

        let mut table_diff = TableDiff {
            table: table.clone(),
            ..TableDiff::default()
        };
        for (column, reference_info) in reference_columns {
            match target_columns.get(column) {
                None => table_diff.missing_columns.push(column.clone()),
                Some(target_info) if target_info != reference_info => {
                    table_diff.changed_columns.push(ColumnChange {
                        column: column.clone(),
                        reference: reference_info.clone(),
                        target: target_info.clone(),
                    });
                }
                Some(_) => {}
            }
        }
        table_diff.unexpected_columns = target_columns
            .keys()
            .filter(|c| !reference_columns.contains_key(*c))
            .cloned()
            .collect();

        if !table_diff.is_empty() {
            result.changed_tables.push(table_diff);
        }
    }

    result.unexpected_tables = target
        .tables
        .keys()
        .filter(|t| !reference.tables.contains_key(*t))
        .cloned()
        .collect();

    result
}

/// Snapshot both databases and compare them
///
/// # Errors
///
/// Returns `MigrationError::Database` if either catalog cannot be read.
pub fn diff_databases(
    reference: &dyn MigrationExecutor,
    target: &dyn MigrationExecutor,
    exclude: &[&str],
) -> Result<DiffResult, MigrationError> {
    let reference = snapshot(reference, exclude)?;
    let target = snapshot(target, exclude)?;
    Ok(diff(&reference, &target))
}
