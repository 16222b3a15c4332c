//! Catalog name rewriting for user SQL
//!
//! Users query an archive with the table names of their source database.
//! [`rewrite`] maps those logical names onto the namespaced catalog tables;
//! [`unqualify`] maps catalog-qualified view text back to logical names.
//!
//! Matching works on token positions of the original statement in one pass,
//! so a replacement is never re-scanned and the output is stable under a
//! second `rewrite`.

use std::cmp::Reverse;
use std::collections::BTreeSet;

use regex::Regex;

use super::naming::CatalogNames;

/// A quoted span of the statement, quotes included
#[derive(Debug, Clone, Copy)]
struct QuotedSpan {
    start: usize,
    end: usize,
}

impl QuotedSpan {
    fn contains(&self, start: usize, end: usize) -> bool {
        self.start < end && start < self.end
    }

    fn inner(&self) -> (usize, usize) {
        (self.start + 1, self.end.saturating_sub(1))
    }
}

#[derive(Debug, Clone, Copy)]
struct Replacement<'t> {
    start: usize,
    end: usize,
    table: &'t str,
}

/// Rewrite logical table references in `sql` to fully qualified catalog names
///
/// Every table of `known_tables` that is not also in `known_views` is replaced
/// wherever it appears as a whole token, ignoring case, either bare or as the
/// complete content of a single- or double-quoted span. Quoted spans that
/// merely contain a table name are left alone. With no known tables the
/// statement is returned as given.
pub fn rewrite(
    sql: &str,
    archive_id: &str,
    database: &str,
    known_tables: &BTreeSet<String>,
    known_views: &BTreeSet<String>,
) -> String {
    if known_tables.is_empty() {
        return sql.to_string();
    }

    let spans = quoted_spans(sql);
    let mut candidates: Vec<Replacement<'_>> = Vec::new();

    for table in known_tables {
        if table.is_empty() || known_views.contains(table) {
            continue;
        }
        let Ok(pattern) = Regex::new(&format!("(?i){}", regex::escape(table))) else {
            continue;
        };

        for found in pattern.find_iter(sql) {
            let (start, end) = (found.start(), found.end());
            match spans.iter().find(|s| s.contains(start, end)) {
                Some(span) => {
                    if span.inner() == (start, end) {
                        candidates.push(Replacement {
                            start: span.start,
                            end: span.end,
                            table,
                        });
                    }
                },
                None => {
                    if is_token_boundary(sql, start, end) {
                        candidates.push(Replacement { start, end, table });
                    }
                },
            }
        }
    }

    // earliest first, longest first at the same position
    candidates.sort_by_key(|r| (r.start, Reverse(r.end)));

    let names = CatalogNames::new(archive_id, database);
    let mut out = String::with_capacity(sql.len() + candidates.len() * 64);
    let mut cursor = 0;
    for replacement in candidates {
        if replacement.start < cursor {
            continue;
        }
        out.push_str(&sql[cursor..replacement.start]);
        out.push_str(&names.qualified_table(replacement.table));
        cursor = replacement.end;
    }
    out.push_str(&sql[cursor..]);
    out
}

/// Strip catalog qualification from view text produced against an archive
///
/// `"{id}-{db}-database"."{id}-{db}-orders-table"` becomes `orders` and
/// `"{id}-{db}-database"."recent_orders"` becomes `recent_orders`.
pub fn unqualify(sql: &str, archive_id: &str, database: &str) -> String {
    let names = CatalogNames::new(archive_id, database);
    let database_name = regex::escape(&names.database());
    let prefix = regex::escape(&format!("{archive_id}-{database}-"));

    let tables = format!(r#""{database_name}"\."{prefix}([^"]+)-table""#);
    let others = format!(r#""{database_name}"\."([^"]+)""#);

    let mut simplified = sql.to_string();
    for pattern in [tables, others] {
        if let Ok(re) = Regex::new(&pattern) {
            simplified = re.replace_all(&simplified, "$1").into_owned();
        }
    }
    simplified
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_token_boundary(sql: &str, start: usize, end: usize) -> bool {
    let before = sql[..start].chars().next_back();
    let after = sql[end..].chars().next();
    !before.is_some_and(is_word_char) && !after.is_some_and(is_word_char)
}

/// Locate single- and double-quoted spans; a doubled quote is an escape and an
/// unterminated quote runs to the end of the statement
fn quoted_spans(sql: &str) -> Vec<QuotedSpan> {
    let bytes = sql.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let quote = bytes[i];
        if quote != b'\'' && quote != b'"' {
            i += 1;
            continue;
        }

        let start = i;
        i += 1;
        loop {
            match bytes.get(i) {
                None => break,
                Some(&b) if b == quote => {
                    if bytes.get(i + 1) == Some(&quote) {
                        i += 2;
                    } else {
                        i += 1;
                        break;
                    }
                },
                Some(_) => i += 1,
            }
        }
        spans.push(QuotedSpan { start, end: i });
    }

    spans
}
