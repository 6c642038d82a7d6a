//! Attribute codec
//!
//! Conversion between directory wire values (a list of raw octet strings per
//! attribute) and typed [`Value`]s. Decoding never fails: absent or malformed
//! data degrades to the type's zero/empty value. Encoding rejects values of
//! the wrong kind.

use std::sync::LazyLock;

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{DirectoryError, DirectoryResult};
use crate::predicate::Lookup;
use crate::value::Value;

/// Default format of [`FieldType::Date`] attributes.
pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";

/// Output format of generalized-time attributes.
const GENERALIZED_TIME_FORMAT: &str = "%Y%m%d%H%M%S.%6fZ";

const TRUE_TOKEN: &str = "TRUE";
const FALSE_TOKEN: &str = "FALSE";

/// `YYYYMMDDHH[MM[SS[(.|,)fraction]]](Z|(+|-)HH[MM])`
static GENERALIZED_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\d{4})(\d{2})(\d{2})(\d{2})(?:(\d{2})(?:(\d{2})(?:[.,](\d+))?)?)?(?:(Z)|([+-])(\d{2})(\d{2})?)$",
    )
    .expect("generalized time pattern is valid")
});

/// Storage type of a mapped field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldType {
    /// UTF-8 text, single-valued.
    Text,
    /// Decimal integer.
    Integer,
    /// Decimal floating point.
    Float,
    /// `TRUE` / `FALSE` tokens.
    Boolean,
    /// Every value of a multi-valued attribute, as strings.
    List,
    /// Date rendered with a `strftime` format.
    Date {
        #[serde(default = "default_date_format")]
        format: String,
    },
    /// Generalized time (`20180102030405.067874Z`).
    DateTime,
    /// Seconds since the Unix epoch, as decimal text.
    Timestamp,
    /// Opaque octets (photos, certificates).
    Binary,
}

fn default_date_format() -> String {
    DEFAULT_DATE_FORMAT.to_string()
}

impl FieldType {
    /// Date field using the default `%Y-%m-%d` format.
    pub fn date() -> Self {
        FieldType::Date {
            format: default_date_format(),
        }
    }

    /// Date field using a custom `strftime` format.
    pub fn date_with_format(format: impl Into<String>) -> Self {
        FieldType::Date {
            format: format.into(),
        }
    }

    /// Name of the domain type, used in type-mismatch errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
            FieldType::List => "list",
            FieldType::Date { .. } => "date",
            FieldType::DateTime | FieldType::Timestamp => "datetime",
            FieldType::Binary => "binary",
        }
    }

    /// Whether a lookup kind can be expressed for this type.
    pub fn supports(&self, lookup: Lookup) -> bool {
        match self {
            FieldType::Text => matches!(
                lookup,
                Lookup::Exact
                    | Lookup::StartsWith
                    | Lookup::EndsWith
                    | Lookup::Contains
                    | Lookup::IContains
                    | Lookup::In
            ),
            FieldType::Integer | FieldType::Float => {
                matches!(lookup, Lookup::Exact | Lookup::Gte | Lookup::Lte | Lookup::In)
            }
            FieldType::Boolean => lookup == Lookup::Exact,
            FieldType::List => lookup == Lookup::Contains,
            FieldType::Date { .. } | FieldType::DateTime | FieldType::Timestamp => {
                matches!(lookup, Lookup::Exact | Lookup::Gte | Lookup::Lte)
            }
            FieldType::Binary => false,
        }
    }

    /// Decode wire values into a domain value.
    ///
    /// `nullable` selects `Null` instead of the zero value for absent or
    /// malformed numeric and boolean data.
    pub fn decode(&self, raw: &[Vec<u8>], nullable: bool) -> Value {
        let first = raw.first().map(|bytes| String::from_utf8_lossy(bytes));
        let zero_or_null = |zero: Value| if nullable { Value::Null } else { zero };

        match self {
            FieldType::Text => Value::Text(first.map(|s| s.into_owned()).unwrap_or_default()),
            FieldType::Integer => first
                .and_then(|s| s.trim().parse::<i64>().ok())
                .map(Value::Integer)
                .unwrap_or_else(|| zero_or_null(Value::Integer(0))),
            FieldType::Float => first
                .and_then(|s| s.trim().parse::<f64>().ok())
                .map(Value::Float)
                .unwrap_or_else(|| zero_or_null(Value::Float(0.0))),
            FieldType::Boolean => match first.as_deref() {
                Some(TRUE_TOKEN) => Value::Boolean(true),
                Some(FALSE_TOKEN) => Value::Boolean(false),
                _ => zero_or_null(Value::Boolean(false)),
            },
            FieldType::List => Value::List(
                raw.iter()
                    .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                    .collect(),
            ),
            FieldType::Date { format } => first
                .and_then(|s| NaiveDate::parse_from_str(s.trim(), format).ok())
                .map_or(Value::Null, Value::Date),
            FieldType::DateTime => first
                .and_then(|s| parse_generalized_time(s.trim()))
                .map_or(Value::Null, Value::DateTime),
            FieldType::Timestamp => first
                .and_then(|s| s.trim().parse::<i64>().ok())
                .and_then(datetime_from_timestamp)
                .map_or(Value::Null, Value::DateTime),
            FieldType::Binary => Value::Binary(raw.first().cloned().unwrap_or_default()),
        }
    }

    /// Encode a domain value into wire values.
    ///
    /// An empty result means "attribute absent". `field` names the field in
    /// type-mismatch errors.
    pub fn encode(&self, field: &str, value: &Value) -> DirectoryResult<Vec<Vec<u8>>> {
        if value.is_null() {
            return Ok(Vec::new());
        }

        let encoded = match (self, value) {
            (FieldType::Text, Value::Text(s)) if s.is_empty() => Vec::new(),
            (FieldType::Text, Value::Text(s)) => vec![s.as_bytes().to_vec()],
            (FieldType::Integer, Value::Integer(i)) => vec![i.to_string().into_bytes()],
            (FieldType::Float, Value::Float(f)) => vec![f.to_string().into_bytes()],
            (FieldType::Float, Value::Integer(i)) => vec![(*i as f64).to_string().into_bytes()],
            (FieldType::Boolean, Value::Boolean(b)) => vec![boolean_token(*b).as_bytes().to_vec()],
            (FieldType::List, Value::List(items)) => {
                let mut items: Vec<&String> = items.iter().collect();
                items.sort();
                items.dedup();
                items.into_iter().map(|s| s.as_bytes().to_vec()).collect()
            }
            (FieldType::Date { format }, Value::Date(date)) => {
                vec![date.format(format).to_string().into_bytes()]
            }
            (FieldType::Date { format }, Value::DateTime(dt)) => {
                vec![dt.date_naive().format(format).to_string().into_bytes()]
            }
            (FieldType::DateTime, Value::DateTime(dt)) => {
                vec![format_generalized_time(dt).into_bytes()]
            }
            (FieldType::Timestamp, Value::DateTime(dt)) => {
                vec![timestamp_from_datetime(dt).to_string().into_bytes()]
            }
            (FieldType::Binary, Value::Binary(bytes)) if bytes.is_empty() => Vec::new(),
            (FieldType::Binary, Value::Binary(bytes)) => vec![bytes.clone()],
            _ => return Err(self.mismatch(field, value)),
        };

        Ok(encoded)
    }

    /// Render a lookup operand as unescaped filter text.
    pub fn render_operand(&self, field: &str, value: &Value) -> DirectoryResult<String> {
        let rendered = match (self, value) {
            (FieldType::Text | FieldType::List, Value::Text(s)) => s.clone(),
            (FieldType::Integer, Value::Integer(i)) => i.to_string(),
            (FieldType::Float, Value::Float(f)) => f.to_string(),
            (FieldType::Float, Value::Integer(i)) => (*i as f64).to_string(),
            (FieldType::Boolean, Value::Boolean(b)) => boolean_token(*b).to_string(),
            (FieldType::Date { format }, Value::Date(date)) => date.format(format).to_string(),
            (FieldType::DateTime, Value::DateTime(dt)) => format_generalized_time(dt),
            (FieldType::Timestamp, Value::DateTime(dt)) => timestamp_from_datetime(dt).to_string(),
            (FieldType::Timestamp, Value::Integer(t)) => t.to_string(),
            _ => return Err(self.mismatch(field, value)),
        };
        Ok(rendered)
    }

    fn mismatch(&self, field: &str, value: &Value) -> DirectoryError {
        DirectoryError::TypeMismatch {
            field: field.to_string(),
            expected: self.type_name(),
            found: value.kind_name(),
        }
    }
}

fn boolean_token(b: bool) -> &'static str {
    if b {
        TRUE_TOKEN
    } else {
        FALSE_TOKEN
    }
}

/// Convert seconds since the epoch into a UTC datetime.
///
/// Returns `None` outside chrono's representable range.
pub fn datetime_from_timestamp(ts: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0)
}

/// Convert a datetime into whole seconds since the epoch.
pub fn timestamp_from_datetime(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp()
}

/// Parse a generalized-time string.
///
/// Fractional digits beyond microseconds are truncated. Missing minutes and
/// seconds read as zero.
pub fn parse_generalized_time(input: &str) -> Option<DateTime<Utc>> {
    let caps = GENERALIZED_TIME.captures(input)?;
    let number = |idx: usize| -> Option<u32> {
        caps.get(idx).map_or(Some(0), |m| m.as_str().parse().ok())
    };

    let year: i32 = caps.get(1)?.as_str().parse().ok()?;
    let (month, day, hour) = (number(2)?, number(3)?, number(4)?);
    let (minute, second) = (number(5)?, number(6)?);

    let micros = match caps.get(7) {
        Some(m) => {
            let digits: String = m.as_str().chars().take(6).collect();
            format!("{digits:0<6}").parse::<u32>().ok()?
        }
        None => 0,
    };

    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_micro_opt(
        hour, minute, second, micros,
    )?;

    if caps.get(8).is_some() {
        return Some(Utc.from_utc_datetime(&naive));
    }

    let sign = if caps.get(9)?.as_str() == "-" { -1 } else { 1 };
    let offset_hours = i32::try_from(number(10)?).ok()?;
    let offset_minutes = i32::try_from(number(11)?).ok()?;
    let offset = FixedOffset::east_opt(sign * (offset_hours * 3600 + offset_minutes * 60))?;

    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Format a datetime as UTC generalized time with microsecond precision.
pub fn format_generalized_time(dt: &DateTime<Utc>) -> String {
    dt.format(GENERALIZED_TIME_FORMAT).to_string()
}
