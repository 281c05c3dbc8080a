//! Tag-addressed row encoding and the schema-fragments system table.
//!
//! Rows are sparse `tag -> value` maps. The codec turns them into canonical
//! key/value tuples, tables hold those tuples inside an immutable
//! [`VersionedRoot`], and the [`fragments`] module migrates the built-in
//! schema-fragments table between its historical layouts.

pub mod codec;
pub mod fragments;
pub mod keyspec;
pub mod schema;
pub mod table;
pub mod value;

pub use codec::{decode, encode, encode_row, Row, Tuple, TupleSelection};
pub use fragments::{
    get_fragment, lookup_fragment, migrate_rows, open_schemas_table, swap_and_load, FragmentType,
    MigrationOutcome, MigrationPlan, OpenedTable, SchemaFragment, SchemaVersion,
    SchemasTableLayout, SCHEMAS_TABLE_NAME,
};
pub use keyspec::{parse_key_mappings, parse_key_values};
pub use schema::{Column, Schema, Tag, TypeKind};
pub use table::{
    Index, IndexLookup, Indexes, Inserter, RowData, Table, TableEditor, VersionedRoot,
    PRIMARY_INDEX_ID,
};
pub use value::{TaggedValues, Value};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("unknown tag {0} for schema")]
    UnknownTag(Tag),
    #[error("type mismatch for column `{column}`: expected {expected}, found {found}")]
    TypeMismatch { column: String, expected: TypeKind, found: String },
    #[error("cannot parse `{raw}` as {kind} for column `{column}`")]
    ValueParse { column: String, kind: TypeKind, raw: String },
    #[error("malformed key spec: {0}")]
    MalformedKeySpec(String),
    #[error("index `{index}` has {expected} column(s), got {got} value(s)")]
    IndexArity { index: String, expected: usize, got: usize },
    #[error("unsupported schema version for table `{table}` ({columns} columns)")]
    UnsupportedSchemaVersion { table: String, columns: usize },
    #[error("row decode error: {0}")]
    RowDecode(String),
    #[error("insert error: {0}")]
    Insert(String),
    #[error("table not found: {0}")]
    TableNotFound(String),
    #[error("table already exists: {0}")]
    TableExists(String),
    #[error("could not find primary key index on table `{0}`")]
    MissingPrimaryIndex(String),
}
