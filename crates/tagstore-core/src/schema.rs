use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::KernelError;

/// Stable column identifier. Encoding order and row identity follow tags,
/// never the declared column position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct Tag(pub u64);

impl Display for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TypeKind {
    String,
    Int,
    Uint,
    Float,
    Bool,
    Timestamp,
}

impl TypeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Uint => "uint",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Timestamp => "timestamp",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "string" | "text" => Some(Self::String),
            "int" => Some(Self::Int),
            "uint" => Some(Self::Uint),
            "float" => Some(Self::Float),
            "bool" => Some(Self::Bool),
            "timestamp" => Some(Self::Timestamp),
            _ => None,
        }
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            Self::String => 1,
            Self::Int => 2,
            Self::Uint => 3,
            Self::Float => 4,
            Self::Bool => 5,
            Self::Timestamp => 6,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::String),
            2 => Some(Self::Int),
            3 => Some(Self::Uint),
            4 => Some(Self::Float),
            5 => Some(Self::Bool),
            6 => Some(Self::Timestamp),
            _ => None,
        }
    }
}

impl Display for TypeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Column {
    pub name: String,
    pub tag: Tag,
    pub kind: TypeKind,
    pub is_primary_key: bool,
    pub nullable: bool,
}

impl Column {
    #[must_use]
    pub fn new(name: &str, tag: u64, kind: TypeKind, is_primary_key: bool) -> Self {
        Self { name: name.to_string(), tag: Tag(tag), kind, is_primary_key, nullable: !is_primary_key }
    }

    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Ordered set of columns. Declared order is kept for display and name
/// lookup only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "Vec<Column>", into = "Vec<Column>")]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    /// Build a schema from columns in declared order.
    ///
    /// # Errors
    /// Returns [`KernelError::InvalidSchema`] when there is no primary-key
    /// column, when tags or names repeat, or when a key column is nullable.
    pub fn new(columns: Vec<Column>) -> Result<Self, KernelError> {
        if !columns.iter().any(|column| column.is_primary_key) {
            return Err(KernelError::InvalidSchema(
                "schema MUST declare at least one primary key column".to_string(),
            ));
        }

        let mut tags = BTreeSet::new();
        let mut names = BTreeSet::new();
        for column in &columns {
            if column.name.trim().is_empty() {
                return Err(KernelError::InvalidSchema("column names MUST be non-empty".to_string()));
            }
            if !tags.insert(column.tag) {
                return Err(KernelError::InvalidSchema(format!("duplicate tag {}", column.tag)));
            }
            if !names.insert(column.name.to_ascii_lowercase()) {
                return Err(KernelError::InvalidSchema(format!(
                    "duplicate column name `{}`",
                    column.name
                )));
            }
            if column.is_primary_key && column.nullable {
                return Err(KernelError::InvalidSchema(format!(
                    "primary key column `{}` cannot be nullable",
                    column.name
                )));
            }
        }

        Ok(Self { columns })
    }

    /// Built-in layouts whose invariants hold by construction.
    pub(crate) fn fixed(columns: Vec<Column>) -> Self {
        debug_assert!(Self::new(columns.clone()).is_ok());
        Self { columns }
    }

    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Exact name match first, then a case-insensitive one.
    #[must_use]
    pub fn column_by_name(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|column| column.name == name).or_else(|| {
            self.columns.iter().find(|column| column.name.eq_ignore_ascii_case(name))
        })
    }

    #[must_use]
    pub fn column_by_tag(&self, tag: Tag) -> Option<&Column> {
        self.columns.iter().find(|column| column.tag == tag)
    }

    /// Primary-key columns in ascending tag order.
    #[must_use]
    pub fn pk_columns(&self) -> Vec<&Column> {
        self.sorted_by_tag(|column| column.is_primary_key)
    }

    /// Non-key columns in ascending tag order.
    #[must_use]
    pub fn value_columns(&self) -> Vec<&Column> {
        self.sorted_by_tag(|column| !column.is_primary_key)
    }

    #[must_use]
    pub fn tags(&self) -> Vec<Tag> {
        self.sorted_by_tag(|_| true).into_iter().map(|column| column.tag).collect()
    }

    fn sorted_by_tag(&self, keep: impl Fn(&Column) -> bool) -> Vec<&Column> {
        let mut selected = self.columns.iter().filter(|column| keep(column)).collect::<Vec<_>>();
        selected.sort_by_key(|column| column.tag);
        selected
    }
}

impl TryFrom<Vec<Column>> for Schema {
    type Error = KernelError;

    fn try_from(columns: Vec<Column>) -> Result<Self, Self::Error> {
        Self::new(columns)
    }
}

impl From<Schema> for Vec<Column> {
    fn from(schema: Schema) -> Self {
        schema.columns
    }
}
