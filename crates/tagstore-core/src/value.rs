use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

use crate::schema::{Column, Tag, TypeKind};
use crate::KernelError;

/// Sparse row: column tag to value, iterated in ascending tag order.
pub type TaggedValues = BTreeMap<Tag, Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    String(String),
    Int(i64),
    Uint(u64),
    Float(f64),
    Bool(bool),
    Timestamp(OffsetDateTime),
}

impl Value {
    #[must_use]
    pub fn kind(&self) -> Option<TypeKind> {
        match self {
            Self::Null => None,
            Self::String(_) => Some(TypeKind::String),
            Self::Int(_) => Some(TypeKind::Int),
            Self::Uint(_) => Some(TypeKind::Uint),
            Self::Float(_) => Some(TypeKind::Float),
            Self::Bool(_) => Some(TypeKind::Bool),
            Self::Timestamp(_) => Some(TypeKind::Timestamp),
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn epoch() -> Self {
        Self::Timestamp(OffsetDateTime::UNIX_EPOCH)
    }

    /// Parse command-line text as a value of `column`'s declared kind.
    ///
    /// # Errors
    /// Returns [`KernelError::ValueParse`] when `raw` is not a valid literal
    /// for the column kind.
    pub fn parse(column: &Column, raw: &str) -> Result<Self, KernelError> {
        let parse_err = || KernelError::ValueParse {
            column: column.name.clone(),
            kind: column.kind,
            raw: raw.to_string(),
        };

        match column.kind {
            TypeKind::String => Ok(Self::String(raw.to_string())),
            TypeKind::Int => raw.trim().parse().map(Self::Int).map_err(|_| parse_err()),
            TypeKind::Uint => raw.trim().parse().map(Self::Uint).map_err(|_| parse_err()),
            TypeKind::Float => raw.trim().parse().map(Self::Float).map_err(|_| parse_err()),
            TypeKind::Bool => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(Self::Bool(true)),
                "false" | "0" => Ok(Self::Bool(false)),
                _ => Err(parse_err()),
            },
            TypeKind::Timestamp => OffsetDateTime::parse(raw.trim(), &Rfc3339)
                .map(Self::from)
                .map_err(|_| parse_err()),
        }
    }

    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::String(value) => serde_json::Value::String(value.clone()),
            Self::Int(value) => serde_json::Value::from(*value),
            Self::Uint(value) => serde_json::Value::from(*value),
            Self::Float(value) => serde_json::Value::from(*value),
            Self::Bool(value) => serde_json::Value::Bool(*value),
            Self::Timestamp(_) => serde_json::Value::String(self.to_string()),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::String(value) => f.write_str(value),
            Self::Int(value) => write!(f, "{value}"),
            Self::Uint(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Timestamp(value) => match value.format(&Rfc3339) {
                Ok(formatted) => f.write_str(&formatted),
                Err(_) => write!(f, "{value}"),
            },
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

/// Timestamps are stored as UTC instants; the source offset is dropped.
impl From<OffsetDateTime> for Value {
    fn from(value: OffsetDateTime) -> Self {
        Self::Timestamp(value.to_offset(UtcOffset::UTC))
    }
}
