//! Parser for InfluxDB annotated CSV.
//!
//! A response is a sequence of tables. Each table starts with `#datatype`,
//! `#group` and `#default` annotation rows followed by a header row; tables
//! are separated by an empty line.

use crate::error::FluxError;
use chrono::{DateTime, Utc};
use jobmon_core::{FluxValue, QueryResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
    String,
    Long,
    UnsignedLong,
    Double,
    Boolean,
    Time,
}

impl ColumnType {
    fn parse(s: &str) -> Self {
        match s {
            "long" => Self::Long,
            "unsignedLong" => Self::UnsignedLong,
            "double" => Self::Double,
            "boolean" => Self::Boolean,
            s if s.starts_with("dateTime") => Self::Time,
            _ => Self::String,
        }
    }

    fn value(&self, raw: &str, line: usize) -> Result<FluxValue, FluxError> {
        if raw.is_empty() {
            return Ok(FluxValue::Null);
        }
        let err = |what: &str| FluxError::CsvError {
            line,
            message: format!("invalid {what} {raw:?}"),
        };
        Ok(match self {
            Self::String => FluxValue::String(raw.to_string()),
            Self::Long => FluxValue::Long(raw.parse().map_err(|_| err("long"))?),
            Self::UnsignedLong => FluxValue::UnsignedLong(raw.parse().map_err(|_| err("unsignedLong"))?),
            Self::Double => FluxValue::Double(parse_double(raw).ok_or_else(|| err("double"))?),
            Self::Boolean => FluxValue::Bool(raw == "true"),
            Self::Time => FluxValue::Time(
                DateTime::parse_from_rfc3339(raw)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|_| err("dateTime"))?,
            ),
        })
    }
}

fn parse_double(raw: &str) -> Option<f64> {
    match raw {
        "+Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        "NaN" => Some(f64::NAN),
        _ => raw.parse().ok(),
    }
}

/// Split CSV text into records, honoring quoted fields.
///
/// Returns `(line, fields)` pairs; an empty line yields an empty field list.
fn split_records(text: &str) -> Result<Vec<(usize, Vec<String>)>, FluxError> {
    let mut records = Vec::new();
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut line = 1;
    let mut record_line = 1;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push('\n');
                }
                c => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => in_quotes = true,
            ',' => fields.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                if !fields.is_empty() || !field.is_empty() {
                    fields.push(std::mem::take(&mut field));
                }
                records.push((record_line, std::mem::take(&mut fields)));
                line += 1;
                record_line = line;
            }
            c => field.push(c),
        }
    }
    if in_quotes {
        return Err(FluxError::CsvError {
            line: record_line,
            message: "unterminated quoted field".to_string(),
        });
    }
    if !fields.is_empty() || !field.is_empty() {
        fields.push(field);
        records.push((record_line, fields));
    }
    Ok(records)
}

#[derive(Default)]
struct Table {
    types: Vec<ColumnType>,
    defaults: Vec<String>,
    header: Option<Vec<String>>,
}

/// Parse an annotated CSV response into records.
///
/// The leading annotation column is dropped. An error table (a table whose
/// header contains an `error` column) is turned into [`FluxError::QueryError`].
pub fn parse_annotated_csv(text: &str) -> Result<Vec<QueryResult>, FluxError> {
    let mut out = Vec::new();
    let mut table = Table::default();

    for (line, fields) in split_records(text)? {
        if fields.is_empty() {
            table = Table::default();
            continue;
        }
        let first = fields[0].as_str();
        if first.starts_with('#') {
            if table.header.is_some() {
                table = Table::default();
            }
            let rest = fields[1..].iter();
            match first {
                "#datatype" => table.types = rest.map(|s| ColumnType::parse(s)).collect(),
                "#default" => table.defaults = rest.cloned().collect(),
                _ => {}
            }
            continue;
        }

        let Some(header) = &table.header else {
            table.header = Some(fields[1..].to_vec());
            continue;
        };

        let values = &fields[1..];
        if values.len() != header.len() {
            return Err(FluxError::CsvError {
                line,
                message: format!("expected {} fields, got {}", header.len(), values.len()),
            });
        }

        if let Some(idx) = header.iter().position(|h| h == "error") {
            return Err(FluxError::QueryError(values[idx].clone()));
        }

        let mut record = QueryResult::new();
        for (i, (name, raw)) in header.iter().zip(values).enumerate() {
            let raw = if raw.is_empty() {
                table.defaults.get(i).map(String::as_str).unwrap_or("")
            } else {
                raw.as_str()
            };
            let kind = table.types.get(i).copied().unwrap_or(ColumnType::String);
            record.insert(name.clone(), kind.value(raw, line)?);
        }
        out.push(record);
    }
    Ok(out)
}
