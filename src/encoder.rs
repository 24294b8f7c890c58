//! Turns DuckDB rows into [`CellValue`]s.
//!
//! Mapping rules:
//!
//! | Engine value | Cell |
//! |---|---|
//! | `NULL` | `Null` |
//! | boolean | `Boolean` |
//! | integers, floats, decimals | `Number` |
//! | 128-bit integers outside the 64-bit range, `NaN`, `inf`, decimals an `f64` cannot hold exactly | `Text` (no exact JSON number form) |
//! | text, blob | `Text` (UTF-8), or `base64:` + padded base64 when the bytes are not UTF-8 |
//! | bit string | `Text` of `0`/`1` digits |
//! | enum | `Text` of the member name |
//! | timestamp / date / time | `Text` in RFC3339 / ISO-8601 form |
//! | interval | `Text` such as `1 year 2 months 3 days 04:05:06` |
//! | list, array, struct, map, union | `Text` in DuckDB's literal style: `[1, 2]`, `{'a': 1}`, `{'k'=1}` |
//! | anything else | `Text` of the engine's debug rendering |

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat};
use duckdb::core::LogicalTypeId;
use duckdb::types::{TimeUnit, Value, ValueRef};
use duckdb::{Row, Statement};
use std::time::Duration;
use thiserror::Error;

use crate::models::{CellValue, QueryResult};

/// Prefix marking a binary value that was not valid UTF-8.
pub const BINARY_PREFIX: &str = "base64:";

// days between 0001-01-01 and 1970-01-01
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("row {row} has {found} cells but the result has {expected} columns")]
    RowWidth {
        row: usize,
        expected: usize,
        found: usize,
    },
}

/// Marks the result columns of type BIT. Those arrive as raw bytes and are
/// indistinguishable from blobs without the declared type.
pub fn bit_columns(stmt: &Statement<'_>) -> Vec<bool> {
    (0..stmt.column_count())
        .map(|i| stmt.column_logical_type(i).id() == LogicalTypeId::Bit)
        .collect()
}

/// Reads every cell of `row` in column order.
pub fn encode_row(row: &Row<'_>, bit_columns: &[bool]) -> Vec<CellValue> {
    let mut cells = Vec::new();
    // get_ref fails past the last column
    while let Ok(value) = row.get_ref(cells.len()) {
        let cell = match (bit_columns.get(cells.len()), value) {
            (Some(true), ValueRef::Blob(bytes)) => match decode_bits(bytes) {
                Some(bits) => CellValue::Text(bits),
                None => encode_bytes(bytes),
            },
            _ => encode_value(value),
        };
        cells.push(cell);
    }
    cells
}

/// Drains `rows` one fetch at a time. The first error discards everything
/// encoded so far.
pub fn encode_rows<I, E>(rows: I) -> Result<Vec<Vec<CellValue>>, E>
where
    I: IntoIterator<Item = Result<Vec<CellValue>, E>>,
{
    rows.into_iter().collect()
}

/// Builds the final result, checking every row matches the column list.
pub fn assemble(
    columns: Vec<String>,
    rows: Vec<Vec<CellValue>>,
    elapsed: Duration,
) -> Result<QueryResult, EncodeError> {
    if let Some((row, cells)) = rows
        .iter()
        .enumerate()
        .find(|(_, cells)| cells.len() != columns.len())
    {
        return Err(EncodeError::RowWidth {
            row,
            expected: columns.len(),
            found: cells.len(),
        });
    }

    Ok(QueryResult {
        count: rows.len(),
        columns,
        rows,
        elapsed,
    })
}

pub fn encode_value(value: ValueRef<'_>) -> CellValue {
    match value {
        ValueRef::Null => CellValue::Null,
        ValueRef::Boolean(b) => CellValue::Boolean(b),
        ValueRef::TinyInt(i) => CellValue::Number(i.into()),
        ValueRef::SmallInt(i) => CellValue::Number(i.into()),
        ValueRef::Int(i) => CellValue::Number(i.into()),
        ValueRef::BigInt(i) => CellValue::Number(i.into()),
        ValueRef::UTinyInt(i) => CellValue::Number(i.into()),
        ValueRef::USmallInt(i) => CellValue::Number(i.into()),
        ValueRef::UInt(i) => CellValue::Number(i.into()),
        ValueRef::UBigInt(i) => CellValue::Number(i.into()),
        ValueRef::HugeInt(i) => encode_i128(i),
        // go through the shortest decimal rendering so 0.1f32 stays 0.1
        ValueRef::Float(f) => encode_f64(f.to_string().parse().unwrap_or(f as f64)),
        ValueRef::Double(f) => encode_f64(f),
        ValueRef::Decimal(d) => encode_decimal(d.to_string()),
        ValueRef::Text(bytes) => encode_bytes(bytes),
        ValueRef::Blob(bytes) => encode_bytes(bytes),
        ValueRef::Timestamp(unit, v) => match DateTime::from_timestamp_micros(to_micros(unit, v)) {
            Some(ts) => CellValue::Text(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            None => CellValue::Text(v.to_string()),
        },
        ValueRef::Date32(days) => {
            match NaiveDate::from_num_days_from_ce_opt(days.saturating_add(UNIX_EPOCH_DAYS_FROM_CE)) {
                Some(date) => CellValue::Text(date.to_string()),
                None => CellValue::Text(days.to_string()),
            }
        }
        ValueRef::Time64(unit, v) => {
            let micros = to_micros(unit, v);
            let secs = u32::try_from(micros.div_euclid(1_000_000)).ok();
            let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
            match secs.and_then(|s| NaiveTime::from_num_seconds_from_midnight_opt(s, nanos)) {
                Some(time) => CellValue::Text(time.to_string()),
                None => CellValue::Text(v.to_string()),
            }
        }
        ValueRef::Interval {
            months,
            days,
            nanos,
        } => CellValue::Text(format_interval(months, days, nanos)),
        enum_value @ ValueRef::Enum(..) => match enum_value.as_str() {
            Ok(name) => CellValue::text(name),
            Err(e) => CellValue::Text(e.to_string()),
        },
        nested @ (ValueRef::List(..)
        | ValueRef::Array(..)
        | ValueRef::Struct(..)
        | ValueRef::Map(..)
        | ValueRef::Union(..)) => CellValue::Text(render_nested(&nested.to_owned())),
        other => CellValue::Text(format!("{other:?}")),
    }
}

/// DuckDB-style literal text for a value inside a container. Strings are
/// single-quoted so `['1']` and `[1]` stay apart.
pub fn render_nested(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Text(text) | Value::Enum(text) => quote(text),
        Value::List(items) | Value::Array(items) => {
            let items: Vec<String> = items.iter().map(render_nested).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Struct(fields) => {
            let fields: Vec<String> = fields
                .iter()
                .map(|(name, field)| format!("{}: {}", quote(name), render_nested(field)))
                .collect();
            format!("{{{}}}", fields.join(", "))
        }
        Value::Map(entries) => {
            let entries: Vec<String> = entries
                .iter()
                .map(|(key, entry)| format!("{}={}", render_nested(key), render_nested(entry)))
                .collect();
            format!("{{{}}}", entries.join(", "))
        }
        Value::Union(inner) => render_nested(inner),
        Value::Interval {
            months,
            days,
            nanos,
        } => format_interval(*months, *days, *nanos),
        // every container variant is handled above
        scalar => match encode_value(ValueRef::from(scalar)) {
            CellValue::Null => "NULL".to_string(),
            CellValue::Boolean(b) => b.to_string(),
            CellValue::Number(n) => n.to_string(),
            CellValue::Text(text) => text,
        },
    }
}

fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Renders an interval the way DuckDB prints one: calendar parts first,
/// then a clock part when there is sub-day time.
pub fn format_interval(months: i32, days: i32, nanos: i64) -> String {
    fn unit(n: i64, name: &str) -> String {
        if n == 1 || n == -1 {
            format!("{n} {name}")
        } else {
            format!("{n} {name}s")
        }
    }

    let mut parts = Vec::new();
    let (years, months) = (months / 12, months % 12);
    if years != 0 {
        parts.push(unit(years.into(), "year"));
    }
    if months != 0 {
        parts.push(unit(months.into(), "month"));
    }
    if days != 0 {
        parts.push(unit(days.into(), "day"));
    }
    if nanos != 0 || parts.is_empty() {
        let sign = if nanos < 0 { "-" } else { "" };
        let micros = nanos.unsigned_abs() / 1_000;
        let secs = micros / 1_000_000;
        let mut clock = format!(
            "{sign}{:02}:{:02}:{:02}",
            secs / 3600,
            secs / 60 % 60,
            secs % 60
        );
        let fraction = micros % 1_000_000;
        if fraction != 0 {
            let digits = format!("{fraction:06}");
            clock.push('.');
            clock.push_str(digits.trim_end_matches('0'));
        }
        parts.push(clock);
    }
    parts.join(" ")
}

/// Decodes DuckDB's BIT layout: a leading byte with the number of padding
/// bits, then the bits most-significant first.
fn decode_bits(bytes: &[u8]) -> Option<String> {
    let (&padding, data) = bytes.split_first()?;
    if padding > 7 || data.is_empty() {
        return None;
    }
    let mut bits = String::with_capacity(data.len() * 8);
    for (i, byte) in data.iter().enumerate() {
        let first = if i == 0 { padding } else { 0 };
        for bit in first..8 {
            bits.push(if byte & (0x80 >> bit) != 0 { '1' } else { '0' });
        }
    }
    Some(bits)
}

// A decimal stays a number only if an f64 holds it exactly
fn encode_decimal(text: String) -> CellValue {
    let Ok(number) = text.parse::<serde_json::Number>() else {
        return CellValue::Text(text);
    };
    if !number.is_f64() {
        return CellValue::Number(number);
    }
    match number.as_f64() {
        Some(f) if f.is_finite() && f.to_string() == trim_decimal(&text) => {
            CellValue::Number(number)
        }
        _ => CellValue::Text(text),
    }
}

// "12.50" -> "12.5", "3.00" -> "3", "-0.0" -> "0"
fn trim_decimal(text: &str) -> &str {
    let trimmed = if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    };
    if trimmed == "-0" { "0" } else { trimmed }
}

/// UTF-8 text when possible, otherwise [`BINARY_PREFIX`] followed by
/// standard padded base64 of the raw bytes.
pub fn encode_bytes(bytes: &[u8]) -> CellValue {
    match std::str::from_utf8(bytes) {
        Ok(text) => CellValue::Text(text.to_string()),
        Err(_) => CellValue::Text(format!("{BINARY_PREFIX}{}", STANDARD.encode(bytes))),
    }
}

fn encode_i128(value: i128) -> CellValue {
    if let Ok(n) = i64::try_from(value) {
        CellValue::Number(n.into())
    } else if let Ok(n) = u64::try_from(value) {
        CellValue::Number(n.into())
    } else {
        CellValue::Text(value.to_string())
    }
}

fn encode_f64(value: f64) -> CellValue {
    match serde_json::Number::from_f64(value) {
        Some(n) => CellValue::Number(n),
        None => CellValue::Text(value.to_string()),
    }
}

fn to_micros(unit: TimeUnit, value: i64) -> i64 {
    match unit {
        TimeUnit::Second => value.saturating_mul(1_000_000),
        TimeUnit::Millisecond => value.saturating_mul(1_000),
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value.div_euclid(1_000),
    }
}
