//! Identifier whitelisting and placeholder rebinding.

use crate::error::{Error, ErrorKind};
use once_cell::sync::Lazy;
use regex::Regex;

/// SQL dialect, used only to choose the placeholder rebinding strategy
/// and to gate dialect-only emission variants (`DISTINCT ON`, full text
/// search config selection). This is the *only* dialect transform the
/// crate performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Postgres,
    Mysql,
    Sqlite,
}

static BARE_IDENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());
static QUALIFIED_IDENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*\.[A-Za-z_][A-Za-z0-9_]*$").unwrap());
static AGGREGATE_FORM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*\((\*|[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?)\)$").unwrap());

/// Validate a bare or dot-qualified identifier (`col`, `table.col`).
///
/// Rejects anything containing `;`, `--`, or unmatched parentheses.
/// Does not accept aggregate forms unless [`validate_identifier_or_aggregate`]
/// is used instead (callers must opt in explicitly).
pub fn validate_identifier(s: &str) -> crate::Result<()> {
    if s.is_empty() {
        return Err(Error::new(ErrorKind::InvalidIdentifier(s.to_string())));
    }
    if s.contains(';') || s.contains("--") {
        return Err(Error::new(ErrorKind::InvalidIdentifier(s.to_string())));
    }
    if BARE_IDENT.is_match(s) || QUALIFIED_IDENT.is_match(s) {
        return Ok(());
    }
    Err(Error::new(ErrorKind::InvalidIdentifier(s.to_string())))
}

/// Validate an identifier, additionally accepting an explicit
/// aggregate-call form (`COUNT(*)`, `MAX(col)`, `SUM(table.col)`), for
/// call sites that opt into aggregate projections/arguments.
pub fn validate_identifier_or_aggregate(s: &str) -> crate::Result<()> {
    if validate_identifier(s).is_ok() {
        return Ok(());
    }
    if s.contains(';') || s.contains("--") {
        return Err(Error::new(ErrorKind::InvalidIdentifier(s.to_string())));
    }
    let open = s.matches('(').count();
    let close = s.matches(')').count();
    if open != close {
        return Err(Error::new(ErrorKind::InvalidIdentifier(s.to_string())));
    }
    if AGGREGATE_FORM.is_match(s) {
        return Ok(());
    }
    Err(Error::new(ErrorKind::InvalidIdentifier(s.to_string())))
}

/// Rewrite `?` placeholders into dialect-native positional form.
///
/// PostgreSQL: the n-th unescaped `?` becomes `$n` (1-indexed).
/// MySQL/SQLite: left untouched. A `?` inside a single-quoted string
/// literal or a `$tag$ ... $tag$` dollar-quoted block is never
/// rewritten, matching standard SQL quoting rules.
pub fn rebind(sql: &str, dialect: Dialect) -> String {
    match dialect {
        Dialect::Mysql | Dialect::Sqlite => sql.to_string(),
        Dialect::Postgres => rebind_postgres(sql),
    }
}

fn rebind_postgres(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut chars = sql.char_indices().peekable();
    let mut n: usize = 0;
    let mut in_quote = false;
    let mut dollar_tag: Option<String> = None;

    let bytes = sql.as_bytes();

    while let Some((i, c)) = chars.next() {
        if let Some(tag) = &dollar_tag {
            out.push(c);
            if c == '$' && sql[i..].starts_with(tag.as_str()) {
                // consume the rest of the closing tag (already pushed first '$').
                for _ in 0..tag.len() - 1 {
                    if let Some((_, c2)) = chars.next() {
                        out.push(c2);
                    }
                }
                dollar_tag = None;
            }
            continue;
        }

        if in_quote {
            out.push(c);
            if c == '\'' {
                // `''` is an escaped quote inside a literal; peek ahead.
                if bytes.get(i + 1) == Some(&b'\'') {
                    if let Some((_, c2)) = chars.next() {
                        out.push(c2);
                    }
                } else {
                    in_quote = false;
                }
            }
            continue;
        }

        match c {
            '\'' => {
                in_quote = true;
                out.push(c);
            }
            '$' if sql[i..].starts_with("$$") || looks_like_dollar_tag(&sql[i..]) => {
                let tag = read_dollar_tag(&sql[i..]);
                out.push_str(&tag);
                for _ in 0..tag.len() - 1 {
                    chars.next();
                }
                dollar_tag = Some(tag);
            }
            '?' => {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            }
            _ => out.push(c),
        }
    }

    out
}

fn looks_like_dollar_tag(rest: &str) -> bool {
    let mut it = rest.char_indices().skip(1);
    for (_, c) in it.by_ref() {
        if c == '$' {
            return true;
        }
        if !(c.is_alphanumeric() || c == '_') {
            return false;
        }
    }
    false
}

fn read_dollar_tag(rest: &str) -> String {
    let mut tag = String::new();
    tag.push('$');
    for c in rest.chars().skip(1) {
        tag.push(c);
        if c == '$' {
            break;
        }
    }
    tag
}

/// Count the unquoted `?` placeholders in `sql`, using the same
/// quoting rules as [`rebind`]. Used by tests asserting that rebinding
/// a statement never changes its placeholder count.
pub fn count_unquoted_placeholders(sql: &str) -> usize {
    let mut count = 0;
    let mut in_quote = false;
    let mut dollar_tag: Option<String> = None;
    let mut chars = sql.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if let Some(tag) = &dollar_tag {
            if c == '$' && sql[i..].starts_with(tag.as_str()) {
                for _ in 0..tag.len() - 1 {
                    chars.next();
                }
                dollar_tag = None;
            }
            continue;
        }
        if in_quote {
            if c == '\'' {
                if sql.as_bytes().get(i + 1) == Some(&b'\'') {
                    chars.next();
                } else {
                    in_quote = false;
                }
            }
            continue;
        }
        match c {
            '\'' => in_quote = true,
            '$' if looks_like_dollar_tag(&sql[i..]) => {
                let tag = read_dollar_tag(&sql[i..]);
                for _ in 0..tag.len() - 1 {
                    chars.next();
                }
                dollar_tag = Some(tag);
            }
            '?' => count += 1,
            _ => {}
        }
    }

    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_bare_and_qualified() {
        assert!(validate_identifier("id").is_ok());
        assert!(validate_identifier("users.id").is_ok());
        assert!(validate_identifier("_private").is_ok());
    }

    #[test]
    fn rejects_dangerous_identifiers() {
        assert!(validate_identifier("id; DROP TABLE users").is_err());
        assert!(validate_identifier("id -- comment").is_err());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("id column").is_err());
    }

    #[test]
    fn aggregate_form_requires_opt_in() {
        assert!(validate_identifier("COUNT(*)").is_err());
        assert!(validate_identifier_or_aggregate("COUNT(*)").is_ok());
        assert!(validate_identifier_or_aggregate("MAX(col)").is_ok());
        assert!(validate_identifier_or_aggregate("MAX(col").is_err());
    }

    #[test]
    fn rebind_postgres_increments_monotonically() {
        let sql = "SELECT * FROM t WHERE a = ? AND b = ?";
        let out = rebind(sql, Dialect::Postgres);
        assert_eq!(out, "SELECT * FROM t WHERE a = $1 AND b = $2");
    }

    #[test]
    fn rebind_postgres_ignores_placeholders_in_string_literals() {
        let sql = "SELECT * FROM t WHERE a = ? AND b = 'what? is this'";
        let out = rebind(sql, Dialect::Postgres);
        assert_eq!(out, "SELECT * FROM t WHERE a = $1 AND b = 'what? is this'");
    }

    #[test]
    fn rebind_postgres_ignores_placeholders_in_dollar_quotes() {
        let sql = "SELECT ? , $$a ? b$$";
        let out = rebind(sql, Dialect::Postgres);
        assert_eq!(out, "SELECT $1 , $$a ? b$$");
    }

    #[test]
    fn rebind_mysql_and_sqlite_are_noops() {
        let sql = "SELECT * FROM t WHERE a = ?";
        assert_eq!(rebind(sql, Dialect::Mysql), sql);
        assert_eq!(rebind(sql, Dialect::Sqlite), sql);
    }
}
