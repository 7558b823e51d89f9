//! Statement splitter.
//!
//! Turns one SQL blob into an ordered list of statements. The splitter does not
//! parse SQL; it follows a small set of text conventions instead:
//!
//! ```text
//! \;                          literal semicolon, restored after splitting
//! %%%JSEXEC_ESCAPE(expr)%%%   expression expanded for injection into a string literal
//! -- // /* */                 leading comments are stripped
//! ```

/// Marks the end of the bootstrap section of a batch.
pub const INIT_COMPLETE: &str = "%%%INITCOMPLETE%%%";

const JSEXEC_ESCAPE_OPEN: &str = "%%%JSEXEC_ESCAPE(";
const JSEXEC_ESCAPE_CLOSE: &str = ")%%%";

/// How a statement's result set is treated by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Pragma,
    Other,
}

impl StatementKind {
    /// Classify a trimmed statement by its leading keyword.
    pub fn classify(sql: &str) -> Self {
        let sql = sql.trim_start();
        if starts_with_keyword(sql, "select") || starts_with_keyword(sql, "with") {
            StatementKind::Select
        } else if starts_with_keyword(sql, "pragma") {
            StatementKind::Pragma
        } else {
            StatementKind::Other
        }
    }
}

fn starts_with_keyword(sql: &str, keyword: &str) -> bool {
    sql.len() >= keyword.len()
        && sql.as_bytes()[..keyword.len()].eq_ignore_ascii_case(keyword.as_bytes())
}

/// A single executable statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub kind: StatementKind,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        let sql = sql.into();
        let kind = StatementKind::classify(&sql);
        Self { sql, kind }
    }

    pub fn is_init_complete(&self) -> bool {
        self.sql == INIT_COMPLETE
    }

    /// Whether the executor keeps this statement's rows.
    pub fn returns_rows(&self) -> bool {
        matches!(self.kind, StatementKind::Select | StatementKind::Pragma)
    }
}

/// Escape a value for use inside a single-quoted SQL literal.
///
/// Quotes are doubled and semicolons escaped, so a literal can never end a
/// statement early.
pub fn escape(value: &str) -> String {
    value.replace('\'', "''").replace(';', "\\;")
}

/// Split a SQL blob into statements.
pub fn split_sql(sql: &str) -> Vec<Statement> {
    let sql = expand_jsexec_escapes(sql);

    let mut parts: Vec<&str> = Vec::new();
    let mut rest = sql.as_str();
    while !rest.is_empty() {
        match find_delimiter(rest) {
            None => {
                parts.push(rest.trim());
                rest = "";
            }
            Some(0) => rest = &rest[1..],
            Some(pos) => {
                parts.push(rest[..pos].trim());
                rest = &rest[pos + 1..];
            }
        }
    }

    parts
        .into_iter()
        .map(strip_leading_comments)
        .filter(|stmt| !stmt.is_empty())
        .map(|stmt| Statement::new(stmt.replace("\\;", ";")))
        .collect()
}

/// Position of the first `;` not preceded by a backslash.
fn find_delimiter(sql: &str) -> Option<usize> {
    let bytes = sql.as_bytes();
    let mut from = 0;
    while let Some(rel) = sql[from..].find(';') {
        let pos = from + rel;
        if pos > 0 && bytes[pos - 1] == b'\\' {
            from = pos + 1;
            continue;
        }
        return Some(pos);
    }
    None
}

fn strip_leading_comments(stmt: &str) -> &str {
    let mut stmt = stmt.trim();
    loop {
        if stmt.starts_with("--") || stmt.starts_with("//") {
            stmt = match stmt.find('\n') {
                Some(eol) => &stmt[eol + 1..],
                None => "",
            };
        } else if stmt.starts_with("/*") {
            stmt = match stmt.find("*/") {
                Some(end) => &stmt[end + 2..],
                None => "",
            };
        } else {
            return stmt;
        }
        stmt = stmt.trim();
    }
}

/// Expand `%%%JSEXEC_ESCAPE(expr)%%%` regions, right-most first, so nested
/// regions are escaped once per level.
fn expand_jsexec_escapes(sql: &str) -> String {
    let mut sql = sql.to_string();
    let mut search_end = sql.len();
    while let Some(start) = sql[..search_end].rfind(JSEXEC_ESCAPE_OPEN) {
        if let Some(rel) = sql[start..].find(JSEXEC_ESCAPE_CLOSE) {
            let end = start + rel;
            let expr = &sql[start + JSEXEC_ESCAPE_OPEN.len()..end];
            let escaped = escape_jsexec_expr(expr);
            sql.replace_range(start..end + JSEXEC_ESCAPE_CLOSE.len(), &escaped);
        }
        search_end = start;
    }
    sql
}

fn escape_jsexec_expr(expr: &str) -> String {
    expr.replace('\'', "''")
        .replace("\\;", "\\\\\\;")
        .replace('\r', " ")
        .replace('\n', "\\n ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(sql: &str) -> Vec<String> {
        split_sql(sql).into_iter().map(|s| s.sql).collect()
    }

    #[test]
    fn test_escaped_semicolon_is_kept() {
        assert_eq!(texts("a;b\\;c;"), vec!["a", "b;c"]);
    }

    #[test]
    fn test_empty_statements_dropped() {
        assert_eq!(texts(";;  ;select 1;\n;"), vec!["select 1"]);
    }

    #[test]
    fn test_leading_comments_stripped() {
        let sql = "-- header\n/* block */ select 1;\n// only a comment\n;update t set a=1";
        assert_eq!(texts(sql), vec!["select 1", "update t set a=1"]);
    }

    #[test]
    fn test_unterminated_block_comment_discarded() {
        assert_eq!(texts("select 1; /* never closed"), vec!["select 1"]);
    }

    #[test]
    fn test_jsexec_escape_expanded_before_split() {
        let sql = "update m set jsexec='%%%JSEXEC_ESCAPE(select 'x'\nfrom t)%%%';select 2";
        assert_eq!(
            texts(sql),
            vec!["update m set jsexec='select ''x''\\n from t'", "select 2"]
        );
    }

    #[test]
    fn test_jsexec_escape_double_escapes_semicolons() {
        let sql = "select '%%%JSEXEC_ESCAPE(a\\;b)%%%'";
        assert_eq!(texts(sql), vec!["select 'a\\\\;b'"]);
    }

    #[test]
    fn test_nested_jsexec_escape() {
        let sql = "%%%JSEXEC_ESCAPE(x '%%%JSEXEC_ESCAPE('y')%%%')%%%";
        // The inner region is expanded first, then escaped again by the outer one.
        assert_eq!(texts(sql), vec!["x ''''''y''''''"]);
    }

    #[test]
    fn test_classification() {
        assert_eq!(StatementKind::classify("  SELECT 1"), StatementKind::Select);
        assert_eq!(StatementKind::classify("with a as (select 1) select * from a"), StatementKind::Select);
        assert_eq!(StatementKind::classify("Pragma foreign_keys"), StatementKind::Pragma);
        assert_eq!(StatementKind::classify("insert into t values(1)"), StatementKind::Other);
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("it's; done"), "it''s\\; done");
    }

    #[test]
    fn test_init_complete_sentinel() {
        let stmts = split_sql("pragma foreign_keys = ON;%%%INITCOMPLETE%%%;select 1");
        assert!(stmts[1].is_init_complete());
        assert!(!stmts[2].is_init_complete());
    }
}
