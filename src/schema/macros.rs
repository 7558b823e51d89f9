//! SQL macro expansion.
//!
//! Two forms are recognized:
//!
//! ```text
//! %%%NAME%%%          parameterless macro
//! name(arg1, arg2)    parameterized macro; the body refers to %%%PARAM%%%
//! ```
//!
//! Expansion repeats until the text stops changing, so macros may expand into
//! other macros.

use std::collections::BTreeMap;

use nom::{
    IResult,
    branch::alt,
    bytes::complete::{is_not, tag},
    character::complete::char,
    combinator::recognize,
    multi::{many0, separated_list0},
    sequence::delimited,
};
use serde::{Deserialize, Serialize};

use super::MultiLine;
use crate::error::{ShimError, ShimResult};
use crate::meta::META_TABLE;

/// Expansion passes allowed before giving up on a recursive definition.
pub const MAX_EXPANSION_PASSES: usize = 32;

/// A named SQL fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlMacro {
    #[serde(default)]
    pub params: Vec<String>,
    pub sql: MultiLine,
}

impl SqlMacro {
    pub fn text(sql: impl Into<String>) -> Self {
        Self {
            params: Vec::new(),
            sql: MultiLine::Text(sql.into()),
        }
    }

    pub fn func(params: &[&str], sql: impl Into<String>) -> Self {
        Self {
            params: params.iter().map(|p| p.to_string()).collect(),
            sql: MultiLine::Text(sql.into()),
        }
    }

    fn is_func(&self) -> bool {
        !self.params.is_empty()
    }

    fn apply(&self, args: &[String]) -> String {
        let mut body = self.sql.to_text();
        for (i, param) in self.params.iter().enumerate() {
            let arg = args.get(i).map(String::as_str).unwrap_or("");
            body = body.replace(&format!("%%%{param}%%%"), arg);
        }
        body
    }
}

/// Trigger helpers available to every object.
pub fn builtin_macros() -> MacroSet {
    let mut set = MacroSet::new();
    set.insert(
        "errorif",
        SqlMacro::func(
            &["COND", "MSG"],
            "select case when (%%%COND%%%) then raise(FAIL,%%%MSG%%%) end",
        ),
    );
    set.insert(
        "notice",
        SqlMacro::func(
            &["MSG"],
            format!("update {META_TABLE} set errcode=-1,errmsg=%%%MSG%%%"),
        ),
    );
    set.insert(
        "warning",
        SqlMacro::func(
            &["MSG"],
            format!("update {META_TABLE} set errcode=-2,errmsg=%%%MSG%%%"),
        ),
    );
    set.insert(
        "signal_error",
        SqlMacro::func(
            &["CODE", "MSG"],
            format!("update {META_TABLE} set errcode=%%%CODE%%%,errmsg=%%%MSG%%%"),
        ),
    );
    set.insert(
        "queue_jsexec",
        SqlMacro::func(
            &["CMD"],
            format!("update {META_TABLE} set jsexec=jsexec||(%%%CMD%%%)||','"),
        ),
    );
    set.insert(
        "update",
        SqlMacro::func(&["COL"], "(old.%%%COL%%% is not new.%%%COL%%%)"),
    );
    set
}

/// A set of macros, expanded longest name first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MacroSet {
    macros: BTreeMap<String, SqlMacro>,
}

impl MacroSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a macro.
    pub fn insert(&mut self, name: impl Into<String>, sql_macro: SqlMacro) {
        self.macros.insert(name.into(), sql_macro);
    }

    pub fn with(mut self, name: impl Into<String>, sql_macro: SqlMacro) -> Self {
        self.insert(name, sql_macro);
        self
    }

    /// Merge `other` over this set.
    pub fn extend<'a>(&mut self, other: impl IntoIterator<Item = (&'a String, &'a SqlMacro)>) {
        for (name, sql_macro) in other {
            self.insert(name.clone(), sql_macro.clone());
        }
    }

    pub fn get(&self, name: &str) -> Option<&SqlMacro> {
        self.macros.get(name)
    }

    fn ordered(&self) -> Vec<(&String, &SqlMacro)> {
        let mut ordered: Vec<_> = self.macros.iter().collect();
        ordered.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));
        ordered
    }

    /// Expand every macro in `sql` until nothing changes.
    pub fn expand(&self, sql: &str) -> ShimResult<String> {
        let ordered = self.ordered();
        let mut current = sql.to_string();
        for _ in 0..MAX_EXPANSION_PASSES {
            let mut next = current.clone();
            for (name, sql_macro) in &ordered {
                next = if sql_macro.is_func() {
                    expand_calls(&next, name, sql_macro)
                } else {
                    next.replace(&format!("%%%{name}%%%"), &sql_macro.sql.to_text())
                };
            }
            if next == current {
                return Ok(current);
            }
            current = next;
        }
        Err(ShimError::MacroRecursion(MAX_EXPANSION_PASSES))
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Replace every `name(args)` call of one macro.
fn expand_calls(sql: &str, name: &str, sql_macro: &SqlMacro) -> String {
    let pattern = format!("{name}(");
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find(&pattern) {
        let preceded_by_ident = pos > 0 && is_ident_byte(rest.as_bytes()[pos - 1])
            || pos == 0 && out.as_bytes().last().is_some_and(|b| is_ident_byte(*b));
        let call_start = pos + name.len();
        match (preceded_by_ident, call_args(&rest[call_start..])) {
            (false, Ok((after, args))) => {
                out.push_str(&rest[..pos]);
                out.push_str(&sql_macro.apply(&args));
                rest = after;
            }
            _ => {
                out.push_str(&rest[..call_start]);
                rest = &rest[call_start..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn quoted(input: &str) -> IResult<&str, &str> {
    recognize(delimited(
        char('\''),
        many0(alt((tag("''"), is_not("'")))),
        char('\''),
    ))(input)
}

fn parenthesized(input: &str) -> IResult<&str, &str> {
    recognize(delimited(
        char('('),
        many0(alt((quoted, parenthesized, is_not("'()")))),
        char(')'),
    ))(input)
}

fn call_arg(input: &str) -> IResult<&str, &str> {
    recognize(many0(alt((quoted, parenthesized, is_not("',()")))))(input)
}

/// Parse `(a, b, ...)`, splitting at top-level commas. `()` has no arguments.
fn call_args(input: &str) -> IResult<&str, Vec<String>> {
    let (rest, args) = delimited(char('('), separated_list0(char(','), call_arg), char(')'))(input)?;
    let mut args: Vec<String> = args.into_iter().map(|a| a.trim().to_string()).collect();
    if args.len() == 1 && args[0].is_empty() {
        args.clear();
    }
    Ok((rest, args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_call_args() {
        assert_eq!(call_args("()").unwrap().1, Vec::<String>::new());
        assert_eq!(
            call_args("(a, 'x,y', f(b, c)) tail").unwrap(),
            (" tail", vec!["a".to_string(), "'x,y'".into(), "f(b, c)".into()])
        );
        assert_eq!(call_args("('it''s', 2)").unwrap().1, vec!["'it''s'", "2"]);
        assert!(call_args("(unclosed").is_err());
    }

    #[test]
    fn test_parameterless_macro() {
        let set = MacroSet::new().with("TABLENAME", SqlMacro::text("cust"));
        assert_eq!(
            set.expand("delete from %%%TABLENAME%%% where 1=0").unwrap(),
            "delete from cust where 1=0"
        );
    }

    #[test]
    fn test_nested_calls_expand_to_fixpoint() {
        let set = builtin_macros();
        let sql = set
            .expand("errorif(update(c_name), 'Cannot update c_name')")
            .unwrap();
        assert_eq!(
            sql,
            "select case when ((old.c_name is not new.c_name)) then raise(FAIL,'Cannot update c_name') end"
        );
    }

    #[test]
    fn test_identifier_boundary() {
        let set = builtin_macros();
        assert_eq!(set.expand("select do_update(x)").unwrap(), "select do_update(x)");
        assert_eq!(
            set.expand("notice('a'||new.x)").unwrap(),
            "update shim_meta set errcode=-1,errmsg='a'||new.x"
        );
    }

    #[test]
    fn test_override_replaces_builtin() {
        let mut set = builtin_macros();
        set.insert("update", SqlMacro::func(&["COL"], "(1=1)"));
        assert_eq!(set.expand("select update(a)").unwrap(), "select (1=1)");
    }

    #[test]
    fn test_recursion_is_capped() {
        let set = MacroSet::new().with("LOOP", SqlMacro::text("x%%%LOOP%%%"));
        assert!(matches!(
            set.expand("%%%LOOP%%%"),
            Err(ShimError::MacroRecursion(MAX_EXPANSION_PASSES))
        ));
    }

    #[test]
    fn test_queue_jsexec() {
        let sql = builtin_macros()
            .expand(r#"queue_jsexec('{"function":"exec","sql":"select 1"}')"#)
            .unwrap();
        assert_eq!(
            sql,
            r#"update shim_meta set jsexec=jsexec||('{"function":"exec","sql":"select 1"}')||','"#
        );
    }
}
