//! The filter mini-language understood by both backends:
//!
//! ```text
//! extra_<field> eq '<string>'
//! extra_<field> <eq|ge|gt|le|lt> <integer>L
//! ```
//!
//! The remote backend forwards filter strings verbatim. The local backend
//! evaluates them with [`FieldFilter`], and anything that does not parse into
//! one of the two shapes above matches nothing.

use std::cmp::Ordering;
use std::fmt;

use super::codec::{FieldValue, TableRecord, EXTRA_PREFIX};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ge,
    Gt,
    Le,
    Lt,
}

impl Comparison {
    fn parse(op: &str) -> Option<Self> {
        match op {
            "eq" => Some(Comparison::Eq),
            "ge" => Some(Comparison::Ge),
            "gt" => Some(Comparison::Gt),
            "le" => Some(Comparison::Le),
            "lt" => Some(Comparison::Lt),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Comparison::Eq => "eq",
            Comparison::Ge => "ge",
            Comparison::Gt => "gt",
            Comparison::Le => "le",
            Comparison::Lt => "lt",
        }
    }

    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Comparison::Eq => ordering == Ordering::Equal,
            Comparison::Ge => ordering != Ordering::Less,
            Comparison::Gt => ordering == Ordering::Greater,
            Comparison::Le => ordering != Ordering::Greater,
            Comparison::Lt => ordering == Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterLiteral {
    Text(String),
    Int(i64),
}

/// A single predicate on an `extra_` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFilter {
    /// Field name without the `extra_` prefix.
    pub field: String,
    pub op: Comparison,
    pub value: FilterLiteral,
}

impl FieldFilter {
    pub fn text_eq(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            op: Comparison::Eq,
            value: FilterLiteral::Text(value.into()),
        }
    }

    pub fn int(field: impl Into<String>, op: Comparison, value: i64) -> Self {
        Self {
            field: field.into(),
            op,
            value: FilterLiteral::Int(value),
        }
    }

    /// Parse one of the two supported shapes. Returns `None` for anything else.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        let (field, rest) = input.split_once(char::is_whitespace)?;
        let field = field.strip_prefix(EXTRA_PREFIX)?;
        if field.is_empty() || !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return None;
        }

        let (op, literal) = rest.trim_start().split_once(char::is_whitespace)?;
        let op = Comparison::parse(op)?;
        let literal = literal.trim();

        let value = if let Some(inner) = literal
            .strip_prefix('\'')
            .and_then(|l| l.strip_suffix('\''))
        {
            if op != Comparison::Eq || inner.replace("''", "").contains('\'') {
                return None;
            }
            FilterLiteral::Text(inner.replace("''", "'"))
        } else {
            let digits = literal.strip_suffix('L')?;
            FilterLiteral::Int(digits.parse().ok()?)
        };

        Some(Self {
            field: field.to_string(),
            op,
            value,
        })
    }

    pub fn matches(&self, record: &TableRecord) -> bool {
        let Some(actual) = record.fields.get(&format!("{}{}", EXTRA_PREFIX, self.field)) else {
            return false;
        };

        match (&self.value, actual) {
            (FilterLiteral::Text(expected), FieldValue::Text(actual)) => {
                self.op.holds(actual.as_str().cmp(expected.as_str()))
            }
            (FilterLiteral::Int(expected), FieldValue::Int(actual)) => {
                self.op.holds(actual.cmp(expected))
            }
            (FilterLiteral::Int(expected), FieldValue::Double(actual)) => actual
                .partial_cmp(&(*expected as f64))
                .is_some_and(|ordering| self.op.holds(ordering)),
            _ => false,
        }
    }
}

impl fmt::Display for FieldFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            FilterLiteral::Text(value) => write!(
                f,
                "{}{} {} '{}'",
                EXTRA_PREFIX,
                self.field,
                self.op.as_str(),
                value.replace('\'', "''")
            ),
            FilterLiteral::Int(value) => write!(
                f,
                "{}{} {} {}L",
                EXTRA_PREFIX,
                self.field,
                self.op.as_str(),
                value
            ),
        }
    }
}
