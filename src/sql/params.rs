//! SQL parameter types and conversion of query-string text and JSON defaults into
//! typed SQL values.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use std::str::FromStr;

/// Closed set of SQL Server parameter types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum SqlDbType {
    BigInt,
    Binary,
    Bit,
    Char,
    Date,
    DateTime,
    DateTime2,
    DateTimeOffset,
    Decimal,
    Float,
    Image,
    Int,
    Money,
    NChar,
    NText,
    NVarChar,
    Real,
    SmallDateTime,
    SmallInt,
    SmallMoney,
    Text,
    Time,
    Timestamp,
    TinyInt,
    UniqueIdentifier,
    VarBinary,
    VarChar,
    Variant,
    Xml,
}

impl SqlDbType {
    /// Map a lowercase SQL base type keyword.
    pub fn from_type_base(type_base: &str) -> Option<SqlDbType> {
        use SqlDbType as T;
        Some(match type_base {
            "bigint" => T::BigInt,
            "binary" => T::Binary,
            "bit" => T::Bit,
            "char" => T::Char,
            "date" => T::Date,
            "datetime" => T::DateTime,
            "datetime2" => T::DateTime2,
            "datetimeoffset" => T::DateTimeOffset,
            "decimal" | "numeric" => T::Decimal,
            "float" => T::Float,
            // Spatial types travel as text; hierarchyid as its integer form.
            "geography" | "geometry" => T::VarChar,
            "hierarchyid" => T::Int,
            "image" => T::Image,
            "int" => T::Int,
            "money" => T::Money,
            "nchar" => T::NChar,
            "nvarchar" => T::NVarChar,
            "ntext" => T::NText,
            "real" => T::Real,
            "smalldatetime" => T::SmallDateTime,
            "smallint" => T::SmallInt,
            "smallmoney" => T::SmallMoney,
            "sql_variant" => T::Variant,
            "text" => T::Text,
            "time" => T::Time,
            "timestamp" => T::Timestamp,
            "tinyint" => T::TinyInt,
            "uniqueidentifier" => T::UniqueIdentifier,
            "varbinary" => T::VarBinary,
            "varchar" => T::VarChar,
            "xml" => T::Xml,
            _ => return None,
        })
    }
}

/// Length value meaning `(max)`.
pub const LENGTH_MAX: i32 = -1;

/// Split `base[(length[,scale])]` or `base(max)` into its parts; the base is lowercased.
pub fn parse_sql_type(type_text: &str) -> Result<(String, Option<i32>, Option<i32>), String> {
    let text = type_text.trim();
    let open = match text.rfind('(') {
        Some(i) => i,
        None => return Ok((text.to_ascii_lowercase(), None, None)),
    };
    let inner = text[open + 1..]
        .strip_suffix(')')
        .ok_or_else(|| format!("Invalid SQL type '{}'", type_text))?;
    let base = text[..open].trim().to_ascii_lowercase();
    let (length_text, scale_text) = match inner.split_once(',') {
        Some((l, s)) => (l.trim(), Some(s.trim())),
        None => (inner.trim(), None),
    };
    let length = if length_text.eq_ignore_ascii_case("max") {
        LENGTH_MAX
    } else {
        length_text
            .parse::<i32>()
            .map_err(|_| format!("Invalid length '{}' in SQL type '{}'", length_text, type_text))?
    };
    let scale = match scale_text {
        Some(s) => Some(
            s.parse::<i32>()
                .map_err(|_| format!("Invalid scale '{}' in SQL type '{}'", s, type_text))?,
        ),
        None => None,
    };
    Ok((base, Some(length), scale))
}

/// A resolved SQL type, either named in `parameterTypes` or written inline as `sqlType`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParameterType {
    pub name: Option<String>,
    pub type_base: String,
    pub sql_db_type: SqlDbType,
    pub length: Option<i32>,
    pub scale: Option<i32>,
    pub description: Option<String>,
}

impl ParameterType {
    /// Parse a type text such as `varchar(20)`.
    pub fn parse(type_text: &str) -> Result<ParameterType, String> {
        let (type_base, length, scale) = parse_sql_type(type_text)?;
        let sql_db_type = SqlDbType::from_type_base(&type_base)
            .ok_or_else(|| format!("Unrecognized SQL type name '{}'", type_base))?;
        Ok(ParameterType {
            name: None,
            type_base,
            sql_db_type,
            length,
            scale,
            description: None,
        })
    }

    /// The type as written: `base`, `base(n)`, `base(n,s)` or `base(max)`.
    pub fn type_text(&self) -> String {
        match (self.length, self.scale) {
            (Some(LENGTH_MAX), _) => format!("{}(max)", self.type_base),
            (Some(l), Some(s)) => format!("{}({},{})", self.type_base, l, s),
            (Some(l), None) => format!("{}({})", self.type_base, l),
            (None, _) => self.type_base.clone(),
        }
    }

    /// Type usable in a `DECLARE` of a local variable.
    pub fn declared_type(&self) -> String {
        match self.type_base.as_str() {
            "text" => "varchar(max)".into(),
            "ntext" => "nvarchar(max)".into(),
            "image" => "varbinary(max)".into(),
            "timestamp" => "binary(8)".into(),
            "varchar" | "nvarchar" | "varbinary" if self.length.is_none() => format!("{}(max)", self.type_base),
            _ => self.type_text(),
        }
    }
}

/// A typed SQL value ready to bind.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    U8(u8),
    I16(i16),
    I32(i32),
    I64(i64),
    F64(f64),
    Decimal(Decimal),
    String(String),
    Binary(Vec<u8>),
    Guid(uuid::Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    DateTimeOffset(DateTime<FixedOffset>),
    Xml(String),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// JSON rendering used in meta views and data response metadata.
    pub fn to_json(&self) -> Value {
        match self {
            SqlValue::Null => Value::Null,
            SqlValue::Bool(b) => Value::Bool(*b),
            SqlValue::U8(n) => Value::from(*n),
            SqlValue::I16(n) => Value::from(*n),
            SqlValue::I32(n) => Value::from(*n),
            SqlValue::I64(n) => Value::from(*n),
            SqlValue::F64(n) => Value::from(*n),
            SqlValue::Decimal(d) => decimal_to_json(d),
            SqlValue::String(s) | SqlValue::Xml(s) => Value::String(s.clone()),
            SqlValue::Binary(b) => Value::String(BASE64.encode(b)),
            SqlValue::Guid(g) => Value::String(g.to_string()),
            SqlValue::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
            SqlValue::Time(t) => Value::String(t.format("%H:%M:%S%.f").to_string()),
            SqlValue::DateTime(dt) => Value::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            SqlValue::DateTimeOffset(dt) => Value::String(dt.to_rfc3339()),
        }
    }
}

impl Serialize for SqlValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// Decimals render as JSON numbers when representable, else as strings.
pub fn decimal_to_json(d: &Decimal) -> Value {
    serde_json::from_str::<serde_json::Number>(&d.normalize().to_string())
        .map(Value::Number)
        .unwrap_or_else(|_| Value::String(d.to_string()))
}

fn parse_bool(text: &str) -> Result<bool, String> {
    match text.trim() {
        t if t.eq_ignore_ascii_case("true") => Ok(true),
        t if t.eq_ignore_ascii_case("false") => Ok(false),
        "1" => Ok(true),
        "0" => Ok(false),
        _ => Err("String was not recognized as a valid Boolean.".into()),
    }
}

fn parse_number<T: FromStr>(text: &str, what: &str) -> Result<T, String> {
    text.trim()
        .parse::<T>()
        .map_err(|_| format!("'{}' is not a valid {} value", text, what))
}

fn parse_datetime(text: &str) -> Result<NaiveDateTime, String> {
    let t = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Ok(dt.naive_local());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(t, format) {
            return Ok(dt);
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(t, "%Y-%m-%d") {
        return Ok(d.and_time(NaiveTime::MIN));
    }
    Err(format!("String '{}' was not recognized as a valid DateTime.", text))
}

fn parse_datetime_offset(text: &str) -> Result<DateTime<FixedOffset>, String> {
    let t = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Ok(dt);
    }
    if let Ok(dt) = DateTime::parse_from_str(t, "%Y-%m-%d %H:%M:%S%.f %:z") {
        return Ok(dt);
    }
    parse_datetime(t).map(|naive| naive.and_utc().fixed_offset())
}

fn parse_time(text: &str) -> Result<NaiveTime, String> {
    let t = text.trim();
    for format in ["%H:%M:%S%.f", "%H:%M"] {
        if let Ok(time) = NaiveTime::parse_from_str(t, format) {
            return Ok(time);
        }
    }
    parse_datetime(t).map(|dt| dt.time())
}

fn parse_base64(text: &str) -> Result<Vec<u8>, String> {
    BASE64
        .decode(text.trim())
        .map_err(|e| format!("The input is not a valid Base-64 string: {}", e))
}

/// Convert a query-string value to a typed SQL value. The literal `"\0"` means NULL.
pub fn from_text(sql_db_type: SqlDbType, text: &str) -> Result<SqlValue, String> {
    use SqlDbType as T;
    if text == "\0" {
        return Ok(SqlValue::Null);
    }
    Ok(match sql_db_type {
        T::BigInt => SqlValue::I64(parse_number(text, "bigint")?),
        T::Int => SqlValue::I32(parse_number(text, "int")?),
        T::SmallInt => SqlValue::I16(parse_number(text, "smallint")?),
        T::TinyInt => SqlValue::U8(parse_number(text, "tinyint")?),
        T::Bit => SqlValue::Bool(parse_bool(text)?),
        T::Decimal | T::Money | T::SmallMoney => SqlValue::Decimal(parse_number(text, "decimal")?),
        T::Float | T::Real => SqlValue::F64(parse_number(text, "float")?),
        T::Char | T::NChar | T::VarChar | T::NVarChar | T::Text | T::NText => SqlValue::String(text.to_string()),
        T::Binary | T::VarBinary | T::Image | T::Timestamp => SqlValue::Binary(parse_base64(text)?),
        T::Date => SqlValue::Date(parse_datetime(text)?.date()),
        T::DateTime | T::DateTime2 | T::SmallDateTime => SqlValue::DateTime(parse_datetime(text)?),
        T::DateTimeOffset => SqlValue::DateTimeOffset(parse_datetime_offset(text)?),
        T::Time => SqlValue::Time(parse_time(text)?),
        T::UniqueIdentifier => SqlValue::Guid(
            uuid::Uuid::parse_str(text.trim()).map_err(|e| format!("'{}' is not a valid GUID: {}", text, e))?,
        ),
        T::Xml => SqlValue::Xml(text.to_string()),
        T::Variant => return Err(format!("Unsupported SQL type '{:?}'", sql_db_type)),
    })
}

/// Largest magnitudes that `float` and `real` hold without rounding.
const FLOAT_EXACT: u64 = 1 << 53;
const REAL_EXACT: u64 = 1 << 24;

fn integer_default(wide: i64, shown: &dyn std::fmt::Display, target: &ParameterType) -> Result<SqlValue, String> {
    use SqlDbType as T;
    let out_of_range = || format!("Default value {} is out of range for {}", shown, target.type_base);
    let exact_below = |limit: u64| {
        if wide.unsigned_abs() <= limit {
            Ok(SqlValue::F64(wide as f64))
        } else {
            Err(format!("Default value {} cannot be represented exactly as {}", shown, target.type_base))
        }
    };
    Ok(match target.sql_db_type {
        T::BigInt => SqlValue::I64(wide),
        T::SmallInt => SqlValue::I16(i16::try_from(wide).map_err(|_| out_of_range())?),
        T::TinyInt => SqlValue::U8(u8::try_from(wide).map_err(|_| out_of_range())?),
        T::Bit => match wide {
            0 => SqlValue::Bool(false),
            1 => SqlValue::Bool(true),
            _ => return Err(out_of_range()),
        },
        T::Decimal | T::Money | T::SmallMoney => SqlValue::Decimal(Decimal::from(wide)),
        T::Float => exact_below(FLOAT_EXACT)?,
        T::Real => exact_below(REAL_EXACT)?,
        _ => SqlValue::I32(i32::try_from(wide).map_err(|_| out_of_range())?),
    })
}

/// Convert a JSON `default` to a typed SQL value for a parameter of type `target`.
///
/// Integer and float literals are dispatched on the target type; a literal that does not
/// fit the target exactly is an error rather than being truncated or rounded.
pub fn from_json_default(value: &Value, target: &ParameterType) -> Result<SqlValue, String> {
    use SqlDbType as T;
    match value {
        Value::Null => Ok(SqlValue::Null),
        Value::Bool(b) => Ok(SqlValue::Bool(*b)),
        Value::String(s) => from_text(target.sql_db_type, s),
        Value::Number(n) if n.is_i64() || n.is_u64() => {
            let wide: i64 = n
                .as_i64()
                .ok_or_else(|| format!("Default value {} is out of range for {}", n, target.type_base))?;
            integer_default(wide, n, target)
        }
        Value::Number(n) => {
            let f = n
                .as_f64()
                .ok_or_else(|| format!("Default value {} is not a valid float", n))?;
            let lossy = || format!("Default value {} cannot be represented exactly as {}", n, target.type_base);
            match target.sql_db_type {
                T::Decimal | T::Money | T::SmallMoney => Decimal::from_str(&n.to_string())
                    .or_else(|_| Decimal::from_scientific(&n.to_string()))
                    .map(SqlValue::Decimal)
                    .map_err(|e| format!("Default value {} is not a valid decimal: {}", n, e)),
                T::Float => Ok(SqlValue::F64(f)),
                T::Real if (f as f32) as f64 == f => Ok(SqlValue::F64(f)),
                T::Real => Err(lossy()),
                T::BigInt | T::Int | T::SmallInt | T::TinyInt | T::Bit => {
                    // 2^63 is exactly representable; anything at or above it is out of range.
                    if f.fract() != 0.0 || !f.is_finite() {
                        Err(lossy())
                    } else if f >= -(i64::MIN as f64) || f < i64::MIN as f64 {
                        Err(format!("Default value {} is out of range for {}", n, target.type_base))
                    } else {
                        integer_default(f as i64, n, target)
                    }
                }
                _ => Ok(SqlValue::F64(f)),
            }
        }
        Value::Array(_) => Err("Unsupported JSON token type Array".into()),
        Value::Object(_) => Err("Unsupported JSON token type Object".into()),
    }
}
