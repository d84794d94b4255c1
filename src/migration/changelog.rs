//! Changelog model and parser
//!
//! A changelog is an ordered list of changesets. Three source formats feed the
//! same validation: TOML (`[[changeset]]`), JSON (`{"changesets": [...]}`) and
//! formatted SQL (see [`crate::migration::formatted_sql`]). Parsing never
//! touches the database.

use crate::migration::formatted_sql;
use crate::migration::precondition::Precondition;
use crate::migration::MigrationError;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Identity of a changeset in history: `(id, author)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChangeKey {
    pub id: String,
    pub author: String,
}

impl ChangeKey {
    pub fn new(id: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            author: author.into(),
        }
    }
}

impl fmt::Display for ChangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.id, self.author)
    }
}

/// One immutable unit of migration work
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry {
    key: ChangeKey,
    sequence_index: i64,
    forward_body: String,
    rollback_body: Option<String>,
    preconditions: Vec<Precondition>,
    comment: Option<String>,
}

impl ChangeEntry {
    pub fn new(
        id: impl Into<String>,
        author: impl Into<String>,
        sequence_index: i64,
        forward_body: impl Into<String>,
    ) -> Self {
        Self {
            key: ChangeKey::new(id, author),
            sequence_index,
            forward_body: forward_body.into(),
            rollback_body: None,
            preconditions: Vec::new(),
            comment: None,
        }
    }

    #[must_use]
    pub fn with_rollback(mut self, rollback_body: impl Into<String>) -> Self {
        self.rollback_body = Some(rollback_body.into());
        self
    }

    #[must_use]
    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.preconditions.push(precondition);
        self
    }

    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn key(&self) -> &ChangeKey {
        &self.key
    }

    pub fn id(&self) -> &str {
        &self.key.id
    }

    pub fn author(&self) -> &str {
        &self.key.author
    }

    pub fn sequence_index(&self) -> i64 {
        self.sequence_index
    }

    pub fn forward_body(&self) -> &str {
        &self.forward_body
    }

    /// `None` means the changeset is irreversible
    pub fn rollback_body(&self) -> Option<&str> {
        self.rollback_body.as_deref()
    }

    pub fn preconditions(&self) -> &[Precondition] {
        &self.preconditions
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// Statements of the forward body, in order
    ///
    /// # Errors
    ///
    /// Returns `MalformedChangelog` if the body does not tokenize.
    pub fn forward_statements(&self) -> Result<Vec<String>, MigrationError> {
        split_statements(&self.forward_body).map_err(|e| {
            MigrationError::MalformedChangelog(format!("changeset '{}': {e}", self.key))
        })
    }

    /// Statements of the rollback body; `None` when irreversible
    ///
    /// # Errors
    ///
    /// Returns `MalformedChangelog` if the body does not tokenize.
    pub fn rollback_statements(&self) -> Result<Option<Vec<String>>, MigrationError> {
        self.rollback_body
            .as_deref()
            .map(|body| {
                split_statements(body).map_err(|e| {
                    let message = format!("changeset '{}' rollback: {e}", self.key);
                    MigrationError::MalformedChangelog(message)
                })
            })
            .transpose()
    }
}

/// Source syntax of a changelog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangelogFormat {
    Toml,
    Json,
    FormattedSql,
}

impl ChangelogFormat {
    /// Pick the format from a file extension
    ///
    /// # Errors
    ///
    /// Returns `MalformedChangelog` for unknown extensions.
    pub fn from_path(path: &Path) -> Result<Self, MigrationError> {
        match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() {
            Some("toml") => Ok(ChangelogFormat::Toml),
            Some("json") => Ok(ChangelogFormat::Json),
            Some("sql") => Ok(ChangelogFormat::FormattedSql),
            _ => Err(MigrationError::MalformedChangelog(format!(
                "cannot tell changelog format of {} (expected .toml, .json or .sql)",
                path.display()
            ))),
        }
    }
}

/// An ordered, validated changelog
#[derive(Debug, Clone, PartialEq)]
pub struct Changelog {
    source: Option<PathBuf>,
    entries: Vec<ChangeEntry>,
}

impl Changelog {
    /// Validate `entries` and order them by sequence index (stable on input order)
    ///
    /// # Errors
    ///
    /// Returns `MalformedChangelog` on an empty id/author, a duplicate
    /// `(id, author)`, or a body that is empty or does not tokenize.
    pub fn new(entries: Vec<ChangeEntry>) -> Result<Self, MigrationError> {
        let mut seen = HashSet::with_capacity(entries.len());
        for (position, entry) in entries.iter().enumerate() {
            if entry.id().trim().is_empty() {
                return Err(MigrationError::MalformedChangelog(format!(
                    "changeset #{} is missing an id",
                    position + 1
                )));
            }
            if entry.author().trim().is_empty() {
                return Err(MigrationError::MalformedChangelog(format!(
                    "changeset '{}' is missing an author",
                    entry.id()
                )));
            }
            if !seen.insert(entry.key().clone()) {
                return Err(MigrationError::MalformedChangelog(format!(
                    "duplicate changeset '{}'",
                    entry.key()
                )));
            }
            entry.forward_statements()?;
            entry.rollback_statements()?;
            for precondition in entry.preconditions() {
                precondition.validate().map_err(|e| {
                    MigrationError::MalformedChangelog(format!("changeset '{}': {e}", entry.key()))
                })?;
            }
        }

        let mut entries = entries;
        entries.sort_by_key(ChangeEntry::sequence_index);
        Ok(Self { source: None, entries })
    }

    /// Entries in apply order; each call starts from the beginning
    pub fn entries(&self) -> std::slice::Iter<'_, ChangeEntry> {
        self.entries.iter()
    }

    pub fn get(&self, key: &ChangeKey) -> Option<&ChangeEntry> {
        self.entries.iter().find(|e| e.key() == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// File this changelog was read from, if any
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

/// Parse changelog text in the given format
///
/// # Errors
///
/// Returns `MalformedChangelog` on syntax or structure errors.
pub fn parse(source: &str, format: ChangelogFormat) -> Result<Changelog, MigrationError> {
    let entries = match format {
        ChangelogFormat::Toml => {
            let raw: RawChangelog = toml::from_str(source)
                .map_err(|e| MigrationError::MalformedChangelog(format!("invalid TOML: {e}")))?;
            raw.into_entries()?
        }
        ChangelogFormat::Json => {
            let raw: RawChangelog = serde_json::from_str(source)
                .map_err(|e| MigrationError::MalformedChangelog(format!("invalid JSON: {e}")))?;
            raw.into_entries()?
        }
        ChangelogFormat::FormattedSql => formatted_sql::parse_entries(source)?,
    };
    Changelog::new(entries)
}

/// Read and parse a changelog file, picking the format from its extension
///
/// # Errors
///
/// Returns `Io` if the file cannot be read, `MalformedChangelog` otherwise.
pub fn parse_file(path: &Path) -> Result<Changelog, MigrationError> {
    let format = ChangelogFormat::from_path(path)?;
    let text = fs::read_to_string(path)?;
    let mut changelog = parse(&text, format)
        .map_err(|e| match e {
            MigrationError::MalformedChangelog(msg) => {
                MigrationError::MalformedChangelog(format!("{}: {msg}", path.display()))
            }
            other => other,
        })?;
    changelog.source = Some(path.to_path_buf());
    Ok(changelog)
}

#[derive(Debug, Deserialize)]
struct RawChangelog {
    #[serde(default, rename = "changeset", alias = "changesets")]
    changesets: Vec<RawChangeSet>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawChangeSet {
    id: Option<String>,
    author: Option<String>,
    sequence: Option<i64>,
    sql: Option<String>,
    rollback: Option<String>,
    comment: Option<String>,
    #[serde(default, alias = "precondition")]
    preconditions: Vec<Precondition>,
}

impl RawChangelog {
    fn into_entries(self) -> Result<Vec<ChangeEntry>, MigrationError> {
        self.changesets
            .into_iter()
            .enumerate()
            .map(|(position, raw)| {
                let label = raw.id.clone().unwrap_or_else(|| format!("#{}", position + 1));
                let id = raw.id.ok_or_else(|| {
                    let message = format!("changeset {label} is missing an id");
                    MigrationError::MalformedChangelog(message)
                })?;
                let author = raw.author.ok_or_else(|| {
                    let message = format!("changeset '{label}' is missing an author");
                    MigrationError::MalformedChangelog(message)
                })?;
                let sql = raw.sql.ok_or_else(|| {
                    MigrationError::MalformedChangelog(format!("changeset '{label}' has no sql"))
                })?;
                let sequence = raw.sequence.unwrap_or(position as i64 + 1);

                let mut entry = ChangeEntry::new(id, author, sequence, sql);
                entry.rollback_body = raw.rollback;
                entry.comment = raw.comment;
                entry.preconditions = raw.preconditions;
                Ok(entry)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lexer {
    Code,
    SingleQuote,
    DoubleQuote,
    LineComment,
    BlockComment,
    DollarQuote,
}

/// Split a body into statements on `;` outside quotes, comments and dollar quotes
///
/// # Errors
///
/// Returns a description of the first syntax problem: unterminated quote,
/// comment or dollar quote, unbalanced parentheses, or no statement at all.
pub fn split_statements(body: &str) -> Result<Vec<String>, String> {
    let chars: Vec<char> = body.chars().collect();
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut has_code = false;
    let mut depth: i64 = 0;
    let mut state = Lexer::Code;
    let mut dollar_tag = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match state {
            Lexer::Code => match c {
                ';' => {
                    if depth != 0 {
                        return Err("unbalanced parentheses".to_string());
                    }
                    if has_code {
                        statements.push(current.trim().to_string());
                    }
                    current.clear();
                    has_code = false;
                    i += 1;
                    continue;
                }
                '\'' => state = Lexer::SingleQuote,
                '"' => state = Lexer::DoubleQuote,
                '-' if next == Some('-') => state = Lexer::LineComment,
                '/' if next == Some('*') => {
                    state = Lexer::BlockComment;
                    current.push_str("/*");
                    i += 2;
                    continue;
                }
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth < 0 {
                        return Err("unbalanced parentheses".to_string());
                    }
                }
                '$' => {
                    if let Some(tag) = dollar_quote_tag(&chars[i..]) {
                        state = Lexer::DollarQuote;
                        current.push_str(&tag);
                        i += tag.chars().count();
                        dollar_tag = tag;
                        has_code = true;
                        continue;
                    }
                }
                _ => {}
            },
            Lexer::SingleQuote => {
                if c == '\'' {
                    if next == Some('\'') {
                        current.push_str("''");
                        i += 2;
                        continue;
                    }
                    state = Lexer::Code;
                }
            }
            Lexer::DoubleQuote => {
                if c == '"' {
                    state = Lexer::Code;
                }
            }
            Lexer::LineComment => {
                if c == '\n' {
                    state = Lexer::Code;
                }
            }
            Lexer::BlockComment => {
                if c == '*' && next == Some('/') {
                    state = Lexer::Code;
                    current.push_str("*/");
                    i += 2;
                    continue;
                }
            }
            Lexer::DollarQuote => {
                if c == '$' && starts_with_at(&chars, i, &dollar_tag) {
                    current.push_str(&dollar_tag);
                    i += dollar_tag.chars().count();
                    state = Lexer::Code;
                    continue;
                }
            }
        }

        if state != Lexer::LineComment
            && state != Lexer::BlockComment
            && !c.is_whitespace()
        {
            has_code = true;
        }
        current.push(c);
        i += 1;
    }

    match state {
        Lexer::SingleQuote => return Err("unterminated string literal".to_string()),
        Lexer::DoubleQuote => return Err("unterminated quoted identifier".to_string()),
        Lexer::BlockComment => return Err("unterminated block comment".to_string()),
        Lexer::DollarQuote => return Err(format!("unterminated dollar quote {dollar_tag}")),
        Lexer::Code | Lexer::LineComment => {}
    }
    if depth != 0 {
        return Err("unbalanced parentheses".to_string());
    }
    if has_code {
        statements.push(current.trim().to_string());
    }
    if statements.is_empty() {
        return Err("body contains no statements".to_string());
    }
    Ok(statements)
}

fn starts_with_at(chars: &[char], at: usize, needle: &str) -> bool {
    let mut rest = chars[at..].iter();
    needle.chars().all(|n| rest.next() == Some(&n))
}

// `$tag$` or `$$`; `$1` style placeholders are not dollar quotes.
fn dollar_quote_tag(chars: &[char]) -> Option<String> {
    let mut tag = String::from("$");
    for (offset, &c) in chars.iter().enumerate().skip(1) {
        if c == '$' {
            tag.push('$');
            return Some(tag);
        }
        let valid = c == '_' || c.is_ascii_alphabetic() || (offset > 1 && c.is_ascii_digit());
        if !valid {
            return None;
        }
        tag.push(c);
    }
    None
}
