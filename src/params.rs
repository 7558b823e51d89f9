//! Parameter marshalling.
//!
//! Parameters are not bound through the driver: each `@name` placeholder is
//! replaced by a SQL literal rendered for its declared type. Batches are split
//! into statements afterwards, so every literal goes through [`escape`].

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime};

use crate::error::{ShimError, ShimResult};
use crate::splitter::escape;

/// Declared type of a parameter. Lengths of `None` mean unbounded (MAX).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbType {
    VarChar(Option<usize>),
    Char(Option<usize>),
    VarBinary(Option<usize>),
    BigInt,
    Int,
    SmallInt,
    TinyInt,
    Boolean,
    Decimal,
    Float,
    Date,
    Time,
    DateTime,
    Raw,
}

impl DbType {
    pub fn varchar_max() -> Self {
        DbType::VarChar(None)
    }

    pub fn varbinary_max() -> Self {
        DbType::VarBinary(None)
    }

    /// Resolve a type by name, as supplied by callers that describe
    /// parameters with strings.
    pub fn from_name(name: &str, length: Option<usize>) -> ShimResult<Self> {
        let ty = match name.trim().to_ascii_lowercase().as_str() {
            "varchar" => DbType::VarChar(length),
            "char" => DbType::Char(length),
            "varbinary" | "binary" => DbType::VarBinary(length),
            "bigint" => DbType::BigInt,
            "int" => DbType::Int,
            "smallint" => DbType::SmallInt,
            "tinyint" => DbType::TinyInt,
            "boolean" => DbType::Boolean,
            "decimal" => DbType::Decimal,
            "float" => DbType::Float,
            "date" => DbType::Date,
            "time" => DbType::Time,
            "datetime" => DbType::DateTime,
            "raw" => DbType::Raw,
            _ => return Err(ShimError::InvalidDatatype(name.to_string())),
        };
        Ok(ty)
    }

    /// Infer a type for an untyped parameter.
    pub fn from_value(value: &DbValue) -> Self {
        match value {
            DbValue::Bool(_) => DbType::Boolean,
            DbValue::Int(_) => DbType::BigInt,
            DbValue::Float(_) => DbType::Float,
            DbValue::Bytes(_) => DbType::varbinary_max(),
            DbValue::Date(_) => DbType::DateTime,
            DbValue::Null | DbValue::Text(_) => DbType::varchar_max(),
        }
    }
}

/// A date/time value with the annotations a caller may attach.
#[derive(Debug, Clone, PartialEq)]
pub struct DateParam {
    pub value: NaiveDateTime,
    /// Offset in minutes, positive when the zone is behind UTC. When set,
    /// `value` is a UTC clock time.
    pub utc_offset: Option<i32>,
    /// Sub-millisecond part, in microseconds (0..1000).
    pub microseconds: Option<f64>,
}

impl DateParam {
    pub fn new(value: NaiveDateTime) -> Self {
        Self {
            value,
            utc_offset: None,
            microseconds: None,
        }
    }

    pub fn with_utc_offset(mut self, minutes: i32) -> Self {
        self.utc_offset = Some(minutes);
        self
    }

    pub fn with_microseconds(mut self, microseconds: f64) -> Self {
        self.microseconds = Some(microseconds);
        self
    }
}

/// Dynamic parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(DateParam),
}

impl DbValue {
    fn is_empty_text(&self) -> bool {
        matches!(self, DbValue::Text(s) if s.is_empty())
    }

    fn to_text(&self) -> Option<String> {
        match self {
            DbValue::Null => None,
            DbValue::Bool(b) => Some(b.to_string()),
            DbValue::Int(i) => Some(i.to_string()),
            DbValue::Float(f) => Some(f.to_string()),
            DbValue::Text(s) => Some(s.clone()),
            DbValue::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
            DbValue::Date(d) => Some(d.value.format("%Y-%m-%d %H:%M:%S%.3f").to_string()),
        }
    }
}

/// A named parameter with an optional type hint.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlParam {
    pub name: String,
    pub ty: Option<DbType>,
    pub value: DbValue,
}

/// Ordered set of named parameters for one execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlParams {
    params: Vec<SqlParam>,
}

impl SqlParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a value whose type is inferred at render time.
    pub fn bind(mut self, name: impl Into<String>, value: impl Into<DbValue>) -> Self {
        self.push(name, None, value.into());
        self
    }

    /// Bind a value with a declared type.
    pub fn bind_typed(
        mut self,
        name: impl Into<String>,
        ty: DbType,
        value: impl Into<DbValue>,
    ) -> Self {
        self.push(name, Some(ty), value.into());
        self
    }

    pub fn push(&mut self, name: impl Into<String>, ty: Option<DbType>, value: DbValue) {
        self.params.push(SqlParam {
            name: name.into(),
            ty,
            value,
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &SqlParam> {
        self.params.iter()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Replace every `@name` placeholder in `sql` with its rendered literal.
///
/// Longer names go first so that `@p10` is never clobbered by `@p1`.
pub fn apply_params(sql: &str, params: &SqlParams) -> String {
    let mut ordered: Vec<&SqlParam> = params.iter().collect();
    ordered.sort_by(|a, b| b.name.len().cmp(&a.name.len()));

    let mut sql = sql.to_string();
    for param in ordered {
        let value = if param.value.is_empty_text() {
            &DbValue::Null
        } else {
            &param.value
        };
        let ty = param
            .ty
            .clone()
            .unwrap_or_else(|| DbType::from_value(value));
        sql = sql.replace(&format!("@{}", param.name), &render(&ty, value));
    }
    sql
}

/// Render a value as a SQL literal of the given type.
pub fn render(ty: &DbType, value: &DbValue) -> String {
    if matches!(value, DbValue::Null) {
        return "NULL".to_string();
    }
    let rendered = match ty {
        DbType::VarChar(len) | DbType::Char(len) => render_text(*len, value),
        DbType::VarBinary(_) => render_binary(value),
        DbType::BigInt | DbType::Int | DbType::SmallInt | DbType::TinyInt => render_integer(value),
        DbType::Boolean => render_boolean(value),
        DbType::Decimal => render_numeric(value, "numeric"),
        DbType::Float => render_numeric(value, "real"),
        DbType::Date | DbType::Time | DbType::DateTime => render_datetime(ty, value),
        DbType::Raw => value.to_text(),
    };
    rendered.unwrap_or_else(|| "NULL".to_string())
}

fn render_text(len: Option<usize>, value: &DbValue) -> Option<String> {
    let text = value.to_text()?;
    let text = match len {
        Some(len) => text.chars().take(len).collect(),
        None => text,
    };
    Some(format!("cast('{}' as text)", escape(&text)))
}

fn render_binary(value: &DbValue) -> Option<String> {
    let bytes = match value {
        DbValue::Bytes(b) => b.clone(),
        other => other.to_text()?.into_bytes(),
    };
    if bytes.is_empty() {
        return None;
    }
    Some(format!("X'{}'", to_hex(&bytes)))
}

fn render_integer(value: &DbValue) -> Option<String> {
    let int = match value {
        DbValue::Int(i) => *i,
        DbValue::Bool(b) => i64::from(*b),
        DbValue::Float(f) if f.is_finite() => f.trunc() as i64,
        DbValue::Text(s) => parse_leading_int(s)?,
        _ => return None,
    };
    Some(int.to_string())
}

fn render_boolean(value: &DbValue) -> Option<String> {
    if value.is_empty_text() {
        return None;
    }
    Some(if value_as_bool(value) { "1" } else { "0" }.to_string())
}

fn render_numeric(value: &DbValue, cast: &str) -> Option<String> {
    let text = match value {
        DbValue::Int(i) => i.to_string(),
        DbValue::Float(f) if f.is_finite() => f.to_string(),
        DbValue::Text(s) => {
            s.trim().parse::<f64>().ok()?;
            s.clone()
        }
        _ => return None,
    };
    Some(format!("cast('{}' as {})", escape(&text), cast))
}

fn render_datetime(ty: &DbType, value: &DbValue) -> Option<String> {
    let (mut clock, utc_offset, microseconds) = match value {
        DbValue::Date(d) => (d.value, d.utc_offset, d.microseconds),
        DbValue::Int(ms) => (DateTime::from_timestamp_millis(*ms)?.naive_utc(), None, None),
        DbValue::Float(ms) if ms.is_finite() => {
            (DateTime::from_timestamp_millis(*ms as i64)?.naive_utc(), None, None)
        }
        DbValue::Text(s) => (parse_datetime(s)?, None, None),
        _ => return None,
    };

    let mut suffix = String::new();
    if let Some(offset) = utc_offset {
        let sign = if offset < 0 { '+' } else { '-' };
        let abs = offset.unsigned_abs();
        suffix = format!(" {}{:02}:{:02}", sign, (abs / 60) % 24, abs % 60);
        clock -= Duration::minutes(i64::from(offset));
    }
    if let Some(us) = microseconds {
        let digits = format!("{:03}", us.abs().round() as u64);
        let digits = &digits[digits.len() - 3..];
        suffix = format!("{}{}", digits.trim_end_matches('0'), suffix);
    }

    let formatted = match ty {
        DbType::Date => clock.format("%Y-%m-%d").to_string(),
        DbType::Time => format!("{}{}", clock.format("%H:%M:%S%.3f"), suffix),
        _ => format!("{}{}", clock.format("%Y-%m-%d %H:%M:%S%.3f"), suffix),
    };
    Some(format!("'{}'", formatted))
}

/// Parse a date/time string in one of the accepted layouts. Values with an
/// explicit offset are normalized to UTC.
pub fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    const DATETIME_FORMATS: [&str; 6] = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ];
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(dt);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0);
    }
    for format in ["%H:%M:%S%.f", "%H:%M:%S", "%H:%M"] {
        if let Ok(time) = NaiveTime::parse_from_str(s, format) {
            return Some(NaiveDate::from_ymd_opt(1970, 1, 1)?.and_time(time));
        }
    }
    None
}

/// Integer prefix of a string (`"12abc"` → 12, `"3.7"` → 3).
fn parse_leading_int(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let sign_len = usize::from(s.starts_with(['-', '+']));
    let digits = s[sign_len..]
        .bytes()
        .take_while(|b| b.is_ascii_digit())
        .count();
    if digits == 0 {
        return None;
    }
    s[..sign_len + digits].parse().ok()
}

/// Truthiness rule shared by parameters and result post-processing.
pub fn text_as_bool(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "t" | "y" | "yes" | "on"
    )
}

pub fn value_as_bool(value: &DbValue) -> bool {
    match value {
        DbValue::Bool(b) => *b,
        DbValue::Int(i) => *i != 0,
        DbValue::Float(f) => *f != 0.0,
        DbValue::Text(s) => text_as_bool(s),
        DbValue::Null | DbValue::Bytes(_) | DbValue::Date(_) => false,
    }
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

impl From<bool> for DbValue {
    fn from(v: bool) -> Self {
        DbValue::Bool(v)
    }
}

impl From<i32> for DbValue {
    fn from(v: i32) -> Self {
        DbValue::Int(i64::from(v))
    }
}

impl From<i64> for DbValue {
    fn from(v: i64) -> Self {
        DbValue::Int(v)
    }
}

impl From<f64> for DbValue {
    fn from(v: f64) -> Self {
        DbValue::Float(v)
    }
}

impl From<&str> for DbValue {
    fn from(v: &str) -> Self {
        DbValue::Text(v.to_string())
    }
}

impl From<String> for DbValue {
    fn from(v: String) -> Self {
        DbValue::Text(v)
    }
}

impl From<Vec<u8>> for DbValue {
    fn from(v: Vec<u8>) -> Self {
        DbValue::Bytes(v)
    }
}

impl From<NaiveDateTime> for DbValue {
    fn from(v: NaiveDateTime) -> Self {
        DbValue::Date(DateParam::new(v))
    }
}

impl From<DateParam> for DbValue {
    fn from(v: DateParam) -> Self {
        DbValue::Date(v)
    }
}

impl<T: Into<DbValue>> From<Option<T>> for DbValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(DbValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").unwrap()
    }

    #[test]
    fn test_prefix_names_not_corrupted() {
        let params = SqlParams::new()
            .bind("p1", 1)
            .bind("p10", 10)
            .bind("p100", "x");
        let sql = apply_params("select @p1, @p10, @p100", &params);
        assert_eq!(sql, "select 1, 10, cast('x' as text)");
    }

    #[test]
    fn test_empty_string_is_null() {
        let params = SqlParams::new().bind_typed("a", DbType::Int, "");
        assert_eq!(apply_params("select @a", &params), "select NULL");
    }

    #[test]
    fn test_text_truncated_and_escaped() {
        assert_eq!(
            render(&DbType::VarChar(Some(4)), &"it's;long".into()),
            "cast('it''s' as text)"
        );
        assert_eq!(
            render(&DbType::varchar_max(), &"a;b".into()),
            "cast('a\\;b' as text)"
        );
    }

    #[test]
    fn test_binary() {
        assert_eq!(render(&DbType::varbinary_max(), &vec![0xAB, 0x01].into()), "X'ab01'");
        assert_eq!(render(&DbType::varbinary_max(), &Vec::<u8>::new().into()), "NULL");
    }

    #[test]
    fn test_integers() {
        assert_eq!(render(&DbType::BigInt, &"42abc".into()), "42");
        assert_eq!(render(&DbType::Int, &"-3.9".into()), "-3");
        assert_eq!(render(&DbType::SmallInt, &"abc".into()), "NULL");
        assert_eq!(render(&DbType::TinyInt, &7.8.into()), "7");
    }

    #[test]
    fn test_boolean() {
        assert_eq!(render(&DbType::Boolean, &"Yes".into()), "1");
        assert_eq!(render(&DbType::Boolean, &"no".into()), "0");
        assert_eq!(render(&DbType::Boolean, &false.into()), "0");
        assert_eq!(render(&DbType::Boolean, &DbValue::Null), "NULL");
    }

    #[test]
    fn test_numeric() {
        assert_eq!(render(&DbType::Decimal, &"12.50".into()), "cast('12.50' as numeric)");
        assert_eq!(render(&DbType::Float, &2.5.into()), "cast('2.5' as real)");
        assert_eq!(render(&DbType::Float, &"n/a".into()), "NULL");
    }

    #[test]
    fn test_datetime_layouts() {
        let value: DbValue = dt("2024-03-05 14:07:09.25").into();
        assert_eq!(render(&DbType::Date, &value), "'2024-03-05'");
        assert_eq!(render(&DbType::Time, &value), "'14:07:09.250'");
        assert_eq!(render(&DbType::DateTime, &value), "'2024-03-05 14:07:09.250'");
        assert_eq!(render(&DbType::DateTime, &"not a date".into()), "NULL");
    }

    #[test]
    fn test_datetime_from_epoch_millis() {
        assert_eq!(
            render(&DbType::DateTime, &DbValue::Int(86_400_000)),
            "'1970-01-02 00:00:00.000'"
        );
    }

    #[test]
    fn test_datetime_with_offset_and_microseconds() {
        // 12:00 UTC observed from UTC+02:00 (offset -120).
        let value = DateParam::new(dt("2024-03-05 12:00:00.5"))
            .with_utc_offset(-120)
            .with_microseconds(250.0);
        assert_eq!(
            render(&DbType::DateTime, &value.clone().into()),
            "'2024-03-05 14:00:00.50025 +02:00'"
        );
        assert_eq!(render(&DbType::Time, &value.into()), "'14:00:00.50025 +02:00'");

        let behind = DateParam::new(dt("2024-03-05 12:00:00")).with_utc_offset(330);
        assert_eq!(
            render(&DbType::DateTime, &behind.into()),
            "'2024-03-05 06:30:00.000 -05:30'"
        );
    }

    #[test]
    fn test_raw_verbatim() {
        assert_eq!(render(&DbType::Raw, &"datetime('now')".into()), "datetime('now')");
    }

    #[test]
    fn test_from_name() {
        assert_eq!(DbType::from_name("VarChar", Some(10)).unwrap(), DbType::VarChar(Some(10)));
        let err = DbType::from_name("geometry", None).unwrap_err();
        assert_eq!(err.to_string(), "Invalid datatype: geometry");
    }

    #[test]
    fn test_inferred_types() {
        let params = SqlParams::new()
            .bind("flag", true)
            .bind("ratio", 0.5)
            .bind("missing", Option::<i64>::None);
        assert_eq!(
            apply_params("@flag @ratio @missing", &params),
            "1 cast('0.5' as real) NULL"
        );
    }
}
