//! Flattening raw message documents into the fixed row schema.
//!
//! The mapping is declarative: [`FLATTEN_RULES`] lists, in column order, where
//! each output column comes from, what type it must coerce to, and whether a
//! missing value rejects the document. Each rule carries candidate source
//! paths tried in order, so both the flat document shape and the nested
//! webhook update shape are accepted:
//!
//! ```text
//! {"message_id": 1, "message_date": "2025-10-29T10:00:00Z", "user_id": 100, ...}
//! {"update_id": 9, "message": {"message_id": 1, "date": 1761732000, "from": {"id": 100, ...}}}
//! ```
//!
//! Coercion never truncates: fractional numbers, out-of-range integers and
//! sub-microsecond timestamps reject the document.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use chatlake_core::ContextDate;

use crate::error::RejectReason;

/// Target type of a flattened column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// 64-bit signed integer. Accepts JSON integers and decimal strings.
    Int64,
    /// UTC timestamp, microsecond precision. Accepts RFC 3339 strings and
    /// integer epoch seconds.
    Timestamp,
    /// UTF-8 string. Accepts JSON strings only.
    Utf8,
}

/// Output column of a flattened row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Column {
    /// `message_id`
    MessageId,
    /// `message_date`
    MessageDate,
    /// `message_text`
    MessageText,
    /// `user_first_name`
    UserFirstName,
    /// `user_id`
    UserId,
}

impl Column {
    /// Column name in the output schema.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::MessageId => "message_id",
            Self::MessageDate => "message_date",
            Self::MessageText => "message_text",
            Self::UserFirstName => "user_first_name",
            Self::UserId => "user_id",
        }
    }
}

/// One mapping rule: `(source paths, target column, target type, required)`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FlattenRule {
    /// Dotted source paths, tried in order. The first one present wins.
    pub sources: &'static [&'static str],
    /// Output column.
    pub target: Column,
    /// Coercion target.
    pub field_type: FieldType,
    /// Whether a missing or null value rejects the document.
    pub required: bool,
}

/// The fixed raw-to-row mapping, in output column order.
pub const FLATTEN_RULES: &[FlattenRule] = &[
    FlattenRule {
        sources: &["message_id", "message.message_id"],
        target: Column::MessageId,
        field_type: FieldType::Int64,
        required: true,
    },
    FlattenRule {
        sources: &["message_date", "message.date"],
        target: Column::MessageDate,
        field_type: FieldType::Timestamp,
        required: true,
    },
    FlattenRule {
        sources: &["message_text", "message.text"],
        target: Column::MessageText,
        field_type: FieldType::Utf8,
        required: false,
    },
    FlattenRule {
        sources: &["user_first_name", "message.from.first_name"],
        target: Column::UserFirstName,
        field_type: FieldType::Utf8,
        required: true,
    },
    FlattenRule {
        sources: &["user_id", "message.from.id"],
        target: Column::UserId,
        field_type: FieldType::Int64,
        required: true,
    },
];

/// A raw message projected onto the output schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlattenedRow {
    /// Message id, unique within the source (not enforced).
    pub message_id: i64,
    /// When the message was sent.
    pub message_date: DateTime<Utc>,
    /// Message text; `None` for stickers, joins and other non-text events.
    pub message_text: Option<String>,
    /// Sender's first name.
    pub user_first_name: String,
    /// Sender id.
    pub user_id: i64,
    /// Bucket that produced this row. Never derived from `message_date`.
    pub context_date: ContextDate,
}

impl FlattenedRow {
    /// Sort key used for deterministic output.
    #[must_use]
    pub fn sort_key(&self) -> (DateTime<Utc>, i64, i64) {
        (self.message_date, self.message_id, self.user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Typed {
    Int64(i64),
    Timestamp(DateTime<Utc>),
    Utf8(String),
}

/// Parses and flattens one raw object.
///
/// # Errors
///
/// Returns a [`RejectReason`] if the bytes are not JSON or the document does
/// not satisfy [`FLATTEN_RULES`].
pub fn flatten_bytes(raw: &[u8], context_date: ContextDate) -> Result<FlattenedRow, RejectReason> {
    let doc: Value =
        serde_json::from_slice(raw).map_err(|e| RejectReason::InvalidJson(e.to_string()))?;
    flatten_document(&doc, context_date)
}

/// Flattens one parsed document.
///
/// # Errors
///
/// Returns a [`RejectReason`] for the first rule the document violates.
pub fn flatten_document(
    doc: &Value,
    context_date: ContextDate,
) -> Result<FlattenedRow, RejectReason> {
    let mut row = RowBuilder::default();
    for rule in FLATTEN_RULES {
        let value = apply_rule(doc, rule)?;
        row.set(rule.target, value);
    }
    row.finish(context_date)
}

fn apply_rule(doc: &Value, rule: &FlattenRule) -> Result<Option<Typed>, RejectReason> {
    let field = rule.target.name();
    let found = rule
        .sources
        .iter()
        .find_map(|path| lookup(doc, path))
        .filter(|v| !v.is_null());

    let Some(value) = found else {
        return if rule.required {
            Err(RejectReason::Missing { field })
        } else {
            Ok(None)
        };
    };

    let typed = match rule.field_type {
        FieldType::Int64 => Typed::Int64(coerce_i64(field, value)?),
        FieldType::Timestamp => Typed::Timestamp(coerce_timestamp(field, value)?),
        FieldType::Utf8 => Typed::Utf8(coerce_string(field, value)?),
    };
    Ok(Some(typed))
}

/// Resolves a dotted path. A present `null` is returned as `Some(Null)`.
fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |node, segment| node.get(segment))
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn uncoercible(field: &'static str, value: &Value) -> RejectReason {
    RejectReason::Uncoercible {
        field,
        value: value.to_string(),
    }
}

/// Whole-number JSON value as `i64`. Floats count only when they are exact
/// integers within the range an `f64` represents without loss.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn exact_integer(n: &serde_json::Number) -> Option<i64> {
    if let Some(i) = n.as_i64() {
        return Some(i);
    }
    let f = n.as_f64().filter(|_| n.is_f64())?;
    (f.fract() == 0.0 && f.abs() < 9.007_199_254_740_992e15).then_some(f as i64)
}

fn coerce_i64(field: &'static str, value: &Value) -> Result<i64, RejectReason> {
    match value {
        Value::Number(n) => exact_integer(n).ok_or_else(|| uncoercible(field, value)),
        Value::String(s) => s.parse::<i64>().map_err(|_| uncoercible(field, value)),
        other => Err(RejectReason::TypeMismatch {
            field,
            expected: "integer",
            found: json_type(other),
        }),
    }
}

fn coerce_timestamp(field: &'static str, value: &Value) -> Result<DateTime<Utc>, RejectReason> {
    let ts = match value {
        Value::Number(n) => exact_integer(n)
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| uncoercible(field, value))?,
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| uncoercible(field, value))?,
        other => {
            return Err(RejectReason::TypeMismatch {
                field,
                expected: "timestamp",
                found: json_type(other),
            });
        }
    };
    // Stored at microsecond precision; anything finer would be dropped.
    if ts.timestamp_subsec_nanos() % 1_000 != 0 {
        return Err(uncoercible(field, value));
    }
    Ok(ts)
}

fn coerce_string(field: &'static str, value: &Value) -> Result<String, RejectReason> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => Err(RejectReason::TypeMismatch {
            field,
            expected: "string",
            found: json_type(other),
        }),
    }
}

#[derive(Default)]
struct RowBuilder {
    message_id: Option<i64>,
    message_date: Option<DateTime<Utc>>,
    message_text: Option<String>,
    user_first_name: Option<String>,
    user_id: Option<i64>,
}

impl RowBuilder {
    fn set(&mut self, column: Column, value: Option<Typed>) {
        match (column, value) {
            (Column::MessageId, Some(Typed::Int64(v))) => self.message_id = Some(v),
            (Column::MessageDate, Some(Typed::Timestamp(v))) => self.message_date = Some(v),
            (Column::MessageText, Some(Typed::Utf8(v))) => self.message_text = Some(v),
            (Column::UserFirstName, Some(Typed::Utf8(v))) => self.user_first_name = Some(v),
            (Column::UserId, Some(Typed::Int64(v))) => self.user_id = Some(v),
            _ => {}
        }
    }

    fn finish(self, context_date: ContextDate) -> Result<FlattenedRow, RejectReason> {
        let missing = |column: Column| RejectReason::Missing {
            field: column.name(),
        };
        Ok(FlattenedRow {
            message_id: self.message_id.ok_or_else(|| missing(Column::MessageId))?,
            message_date: self.message_date.ok_or_else(|| missing(Column::MessageDate))?,
            message_text: self.message_text,
            user_first_name: self
                .user_first_name
                .ok_or_else(|| missing(Column::UserFirstName))?,
            user_id: self.user_id.ok_or_else(|| missing(Column::UserId))?,
            context_date,
        })
    }
}
