//! Formatted SQL changelogs
//!
//! A plain `.sql` file annotated with directive comments:
//!
//! ```sql
//! -- changeguard formatted sql
//!
//! -- changeset alice:create-users sequence:1
//! -- comment: users table
//! -- preconditions onFail:SKIP
//! -- precondition-sql-check expectedResult:0 SELECT COUNT(*) FROM sqlite_master WHERE name='users'
//! CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL);
//! -- rollback DROP TABLE users;
//! ```
//!
//! Every line after a `changeset` directive, up to the next one, belongs to that
//! changeset. `rollback` lines accumulate into the rollback body. Precondition
//! directives take their failure classes from the closest preceding
//! `preconditions` line.

use crate::migration::precondition::{Check, OnFail, Precondition};
use crate::migration::{ChangeEntry, MigrationError};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// First non-blank line of every formatted SQL changelog
pub const HEADER: &str = "-- changeguard formatted sql";

static HEADER_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^--\s*changeguard\s+formatted\s+sql\s*$")
        .expect("header pattern is a valid regex")
});

static CHANGESET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^--\s*changeset\s+([^:\s]+):(\S+)(.*)$")
        .expect("changeset pattern is a valid regex")
});

static DIRECTIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^--\s*(?:(comment):|(rollback|preconditions|precondition-[a-z-]+)(?:\s|$))\s*(.*)$",
    )
    .expect("directive pattern is a valid regex")
});

static ATTRIBUTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Za-z]+):(\S+)").expect("attribute pattern is a valid regex"));

#[derive(Debug)]
struct Pending {
    id: String,
    author: String,
    sequence: i64,
    line: usize,
    body: Vec<String>,
    rollback: Vec<String>,
    comment: Option<String>,
    preconditions: Vec<Precondition>,
    on_fail: OnFail,
    on_error: OnFail,
}

impl Pending {
    fn finish(self) -> Result<ChangeEntry, MigrationError> {
        if self.body.iter().all(|l| l.trim().is_empty()) {
            let message = format!("changeset {}:{} has no sql", self.author, self.id);
            return Err(malformed(self.line, message));
        }
        let mut entry = ChangeEntry::new(self.id, self.author, self.sequence, self.body.join("\n"));
        if !self.rollback.is_empty() {
            entry = entry.with_rollback(self.rollback.join("\n"));
        }
        if let Some(comment) = self.comment {
            entry = entry.with_comment(comment);
        }
        for precondition in self.preconditions {
            entry = entry.with_precondition(precondition);
        }
        Ok(entry)
    }
}

fn malformed(line: usize, message: impl AsRef<str>) -> MigrationError {
    MigrationError::MalformedChangelog(format!("line {line}: {}", message.as_ref()))
}

/// `key:value` pairs of a directive; the remainder is whatever follows the last pair
fn attributes(line: usize, raw: &str) -> Result<HashMap<String, String>, MigrationError> {
    let mut attrs = HashMap::new();
    for cap in ATTRIBUTE.captures_iter(raw) {
        if attrs.insert(cap[1].to_string(), cap[2].to_string()).is_some() {
            return Err(malformed(line, format!("attribute '{}' given twice", &cap[1])));
        }
    }
    Ok(attrs)
}

fn required(
    line: usize,
    directive: &str,
    attrs: &HashMap<String, String>,
    name: &str,
) -> Result<String, MigrationError> {
    attrs
        .get(name)
        .cloned()
        .ok_or_else(|| malformed(line, format!("{directive} needs {name}:<value>")))
}

fn class(line: usize, raw: Option<&String>) -> Result<Option<OnFail>, MigrationError> {
    raw.map(|value| {
        OnFail::parse(value)
            .ok_or_else(|| malformed(line, format!("unknown failure class '{value}'")))
    })
    .transpose()
}

fn precondition(line: usize, kind: &str, rest: &str) -> Result<Check, MigrationError> {
    match kind {
        "precondition-table-exists" => {
            let attrs = attributes(line, rest)?;
            let table = required(line, kind, &attrs, "table")?;
            Ok(Check::TableExists {
                table: qualified(attrs.get("schema"), table),
            })
        }
        "precondition-column-exists" => {
            let attrs = attributes(line, rest)?;
            let table = required(line, kind, &attrs, "table")?;
            Ok(Check::ColumnExists {
                table: qualified(attrs.get("schema"), table),
                column: required(line, kind, &attrs, "column")?,
            })
        }
        "precondition-change-executed" => {
            let attrs = attributes(line, rest)?;
            Ok(Check::ChangeExecuted {
                id: required(line, kind, &attrs, "id")?,
                author: required(line, kind, &attrs, "author")?,
            })
        }
        "precondition-dbms" => {
            let attrs = attributes(line, rest)?;
            Ok(Check::Dbms {
                name: required(line, kind, &attrs, "type")?,
            })
        }
        "precondition-sql-check" => {
            // expectedResult:<v> comes first; the rest of the line is the query
            let rest = rest.trim_start();
            const USAGE: &str = "precondition-sql-check needs expectedResult:<value> <sql>";
            let Some(cap) = ATTRIBUTE
                .captures(rest)
                .filter(|c| c.get(0).is_some_and(|m| m.start() == 0))
            else {
                return Err(malformed(line, USAGE));
            };
            if !cap[1].eq_ignore_ascii_case("expectedResult") {
                return Err(malformed(line, USAGE));
            }
            let sql = rest[cap.get(0).map_or(0, |m| m.end())..].trim();
            if sql.is_empty() {
                return Err(malformed(line, "precondition-sql-check has no query"));
            }
            Ok(Check::SqlCheck {
                sql: sql.trim_end_matches(';').to_string(),
                expected: cap[2].to_string(),
            })
        }
        other => Err(malformed(line, format!("unknown directive '{other}'"))),
    }
}

fn qualified(schema: Option<&String>, table: String) -> String {
    match schema {
        Some(schema) => format!("{schema}.{table}"),
        None => table,
    }
}

/// Parse a formatted SQL changelog into unvalidated entries
///
/// # Errors
///
/// Returns `MalformedChangelog` for a missing header, SQL outside a changeset,
/// or a directive that does not parse.
pub fn parse_entries(source: &str) -> Result<Vec<ChangeEntry>, MigrationError> {
    let mut lines = source.lines().enumerate().map(|(n, l)| (n + 1, l));

    match lines.by_ref().find(|(_, l)| !l.trim().is_empty()) {
        Some((_, first)) if HEADER_LINE.is_match(first.trim()) => {}
        Some((n, _)) => return Err(malformed(n, format!("expected '{HEADER}' as the first line"))),
        None => return Ok(Vec::new()),
    }

    let mut entries = Vec::new();
    let mut pending: Option<Pending> = None;

    for (n, raw) in lines {
        let trimmed = raw.trim();

        if let Some(cap) = CHANGESET.captures(trimmed) {
            if let Some(done) = pending.take() {
                entries.push(done.finish()?);
            }
            let attrs = attributes(n, &cap[3])?;
            let mut sequence = entries.len() as i64 + 1;
            for (key, value) in &attrs {
                match key.as_str() {
                    "sequence" => {
                        sequence = value.parse().map_err(|_| {
                            malformed(n, format!("sequence '{value}' is not an integer"))
                        })?;
                    }
                    other => {
                        return Err(malformed(n, format!("unknown changeset attribute '{other}'")));
                    }
                }
            }
            pending = Some(Pending {
                author: cap[1].to_string(),
                id: cap[2].to_string(),
                sequence,
                line: n,
                body: Vec::new(),
                rollback: Vec::new(),
                comment: None,
                preconditions: Vec::new(),
                on_fail: OnFail::Halt,
                on_error: OnFail::Halt,
            });
            continue;
        }

        let Some(current) = pending.as_mut() else {
            if trimmed.is_empty() || trimmed.starts_with("--") {
                continue;
            }
            return Err(malformed(n, "SQL outside of a changeset"));
        };

        let Some(cap) = DIRECTIVE.captures(trimmed) else {
            current.body.push(raw.to_string());
            continue;
        };
        let kind = cap
            .get(1)
            .or_else(|| cap.get(2))
            .map_or(String::new(), |m| m.as_str().to_ascii_lowercase());
        let rest = cap.get(3).map_or("", |m| m.as_str());
        match kind.as_str() {
            "rollback" => {
                if !rest.trim().is_empty() {
                    current.rollback.push(rest.to_string());
                }
            }
            "comment" => {
                let text = rest.trim();
                current.comment = match current.comment.take() {
                    Some(existing) => Some(format!("{existing}\n{text}")),
                    None => Some(text.to_string()),
                };
            }
            "preconditions" => {
                let attrs = attributes(n, rest)?;
                current.on_fail = class(n, attrs.get("onFail"))?.unwrap_or(OnFail::Halt);
                current.on_error = class(n, attrs.get("onError"))?.unwrap_or(OnFail::Halt);
            }
            kind => {
                let check = precondition(n, kind, rest)?;
                current.preconditions.push(
                    Precondition::new(check)
                        .on_fail(current.on_fail)
                        .on_error(current.on_error),
                );
            }
        }
    }

    if let Some(done) = pending.take() {
        entries.push(done.finish()?);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patterns_compile() {
        for pattern in [&HEADER_LINE, &CHANGESET, &DIRECTIVE, &ATTRIBUTE] {
            LazyLock::force(pattern);
        }
    }

    const CHANGELOG: &str = "\
-- changeguard formatted sql

-- changeset alice:create-users
-- comment: users table
CREATE TABLE users (
    id INTEGER PRIMARY KEY,
    email TEXT NOT NULL -- login
);
-- rollback DROP TABLE users;

-- changeset bob:seed-users sequence:10
-- preconditions onFail:SKIP onError:WARN
-- precondition-table-exists table:users
-- precondition-sql-check expectedResult:0 SELECT COUNT(*) FROM users;
INSERT INTO users (email) VALUES ('a@example.com');
";

    #[test]
    fn test_parse_two_changesets() {
        let entries = parse_entries(CHANGELOG).unwrap();
        assert_eq!(entries.len(), 2);

        let users = &entries[0];
        assert_eq!(users.id(), "create-users");
        assert_eq!(users.author(), "alice");
        assert_eq!(users.sequence_index(), 1);
        assert_eq!(users.comment(), Some("users table"));
        assert_eq!(users.rollback_body(), Some("DROP TABLE users;"));
        assert!(users.forward_body().contains("email TEXT NOT NULL -- login"));
        assert_eq!(users.forward_statements().unwrap().len(), 1);

        let seed = &entries[1];
        assert_eq!(seed.sequence_index(), 10);
        assert_eq!(seed.rollback_body(), None);
        assert_eq!(seed.preconditions().len(), 2);
        assert_eq!(seed.preconditions()[0].on_fail, OnFail::Skip);
        assert_eq!(seed.preconditions()[0].on_error, OnFail::Warn);
        assert_eq!(
            seed.preconditions()[1].check,
            Check::SqlCheck {
                sql: "SELECT COUNT(*) FROM users".to_string(),
                expected: "0".to_string(),
            }
        );
    }

    #[test]
    fn test_multi_line_rollback_joins() {
        let source = "\
-- changeguard formatted sql
-- changeset a:one
CREATE TABLE t (id INTEGER);
CREATE TABLE u (id INTEGER);
-- rollback DROP TABLE u;
-- rollback DROP TABLE t;
";
        let entries = parse_entries(source).unwrap();
        assert_eq!(entries[0].rollback_body(), Some("DROP TABLE u;\nDROP TABLE t;"));
        assert_eq!(entries[0].rollback_statements().unwrap().unwrap().len(), 2);
    }

    #[test]
    fn test_missing_header_is_malformed() {
        let err = parse_entries("-- changeset a:one\nSELECT 1;").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_sql_outside_changeset_is_malformed() {
        let err = parse_entries("-- changeguard formatted sql\nSELECT 1;\n").unwrap_err();
        assert!(err.to_string().contains("outside of a changeset"));
    }

    #[test]
    fn test_unknown_attribute_and_directive() {
        let source = "-- changeguard formatted sql\n-- changeset a:one runAlways:true\nSELECT 1;";
        assert!(parse_entries(source).is_err());

        let source = "-- changeguard formatted sql\n-- changeset a:one\n\
                      -- precondition-view-exists view:v\nSELECT 1;";
        assert!(parse_entries(source).unwrap_err().to_string().contains("unknown directive"));
    }

    #[test]
    fn test_column_and_change_executed_preconditions() {
        let source = "\
-- changeguard formatted sql
-- changeset a:one
-- precondition-column-exists schema:public table:users column:email
-- precondition-change-executed id:create-users author:alice
-- precondition-dbms type:postgresql
SELECT 1;
";
        let entries = parse_entries(source).unwrap();
        let checks: Vec<&Check> = entries[0].preconditions().iter().map(|p| &p.check).collect();
        assert_eq!(
            checks[0],
            &Check::ColumnExists {
                table: "public.users".to_string(),
                column: "email".to_string(),
            }
        );
        assert!(matches!(checks[1], Check::ChangeExecuted { id, .. } if id == "create-users"));
        assert!(matches!(checks[2], Check::Dbms { name } if name == "postgresql"));
    }

    #[test]
    fn test_empty_changeset_is_malformed() {
        let source = "-- changeguard formatted sql\n-- changeset a:one\n-- comment: nothing\n";
        assert!(parse_entries(source).unwrap_err().to_string().contains("has no sql"));
    }
}
