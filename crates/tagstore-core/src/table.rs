//! Immutable tables and the versioned root that holds them.
//!
//! Tables share row storage through `Arc` and are replaced by value; nothing
//! here mutates a table another root can observe. Storage capabilities are
//! exposed through the [`RowData`], [`Indexes`] and [`Inserter`] traits.

use std::collections::BTreeMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::codec::{encode, encode_row, Row, Tuple, TupleSelection};
use crate::schema::{Schema, Tag};
use crate::value::{TaggedValues, Value};
use crate::KernelError;

pub const PRIMARY_INDEX_ID: &str = "PRIMARY";

/// Ordered access to stored rows.
pub trait RowData {
    fn row_count(&self) -> usize;

    /// Rows in ascending key-tuple order.
    fn iter_rows(&self) -> impl Iterator<Item = Row> + '_;
}

pub trait Indexes {
    fn indexes(&self) -> Vec<Index<'_>>;

    fn index(&self, id: &str) -> Option<Index<'_>> {
        self.indexes().into_iter().find(|index| index.id().eq_ignore_ascii_case(id))
    }
}

/// Bulk-insert session. Errors are sticky: once an insert fails, `close`
/// reports that failure instead of producing a table.
pub trait Inserter {
    /// # Errors
    /// Returns [`KernelError::Insert`] on key collisions or missing required
    /// values, and codec errors for unknown tags or kind mismatches.
    fn insert(&mut self, values: &TaggedValues) -> Result<(), KernelError>;

    /// # Errors
    /// Returns the first error recorded by [`Inserter::insert`].
    fn close(self) -> Result<Table, KernelError>
    where
        Self: Sized;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    name: String,
    schema: Arc<Schema>,
    rows: Arc<BTreeMap<Tuple, Tuple>>,
}

impl Table {
    #[must_use]
    pub fn new(name: &str, schema: Schema) -> Self {
        Self { name: name.to_string(), schema: Arc::new(schema), rows: Arc::new(BTreeMap::new()) }
    }

    /// Rebuild a table from stored tuples, decoding each row once to reject
    /// data that does not match `schema`.
    ///
    /// # Errors
    /// Returns [`KernelError::RowDecode`] when any stored row fails to decode.
    pub fn from_rows(
        name: &str,
        schema: Schema,
        rows: BTreeMap<Tuple, Tuple>,
    ) -> Result<Self, KernelError> {
        for (key, value) in &rows {
            crate::codec::decode(&schema, key, value)?;
        }
        Ok(Self { name: name.to_string(), schema: Arc::new(schema), rows: Arc::new(rows) })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    #[must_use]
    pub fn get(&self, key: &Tuple) -> Option<Row> {
        self.rows.get(key).map(|value| Row { key: key.clone(), value: value.clone() })
    }

    #[must_use]
    pub fn editor(&self) -> TableEditor {
        TableEditor { table: self.clone(), failed: None }
    }

    /// Deterministic digest over the schema and every row.
    #[must_use]
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"table/v1");
        for column in self.schema.columns() {
            hash_bytes(&mut hasher, column.name.as_bytes());
            hasher.update(column.tag.0.to_be_bytes());
            hasher.update(column.kind.as_str().as_bytes());
            hasher.update([u8::from(column.is_primary_key), u8::from(column.nullable)]);
        }
        hasher.update((self.rows.len() as u64).to_be_bytes());
        for (key, value) in self.rows.iter() {
            hash_bytes(&mut hasher, key.as_bytes());
            hash_bytes(&mut hasher, value.as_bytes());
        }
        format!("sha256:{}", hex::encode(hasher.finalize()))
    }
}

impl RowData for Table {
    fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn iter_rows(&self) -> impl Iterator<Item = Row> + '_ {
        self.rows.iter().map(|(key, value)| Row { key: key.clone(), value: value.clone() })
    }
}

impl Indexes for Table {
    fn indexes(&self) -> Vec<Index<'_>> {
        let columns = self
            .schema
            .columns()
            .iter()
            .filter(|column| column.is_primary_key)
            .map(|column| column.tag)
            .collect();
        vec![Index { id: PRIMARY_INDEX_ID, table: self, columns }]
    }
}

/// An index over a table; the primary index covers the key columns in
/// declared order.
#[derive(Debug, Clone)]
pub struct Index<'a> {
    id: &'static str,
    table: &'a Table,
    columns: Vec<Tag>,
}

impl<'a> Index<'a> {
    #[must_use]
    pub fn id(&self) -> &str {
        self.id
    }

    #[must_use]
    pub fn columns(&self) -> &[Tag] {
        &self.columns
    }

    /// Bind leading index columns to `values`. Fewer values than columns
    /// give a prefix lookup.
    ///
    /// # Errors
    /// Returns [`KernelError::IndexArity`] when more values than index
    /// columns are given, and codec errors when a value has the wrong kind.
    pub fn get(&self, values: &[Value]) -> Result<IndexLookup<'a>, KernelError> {
        if values.len() > self.columns.len() {
            return Err(KernelError::IndexArity {
                index: format!("{}.{}", self.table.name, self.id),
                expected: self.columns.len(),
                got: values.len(),
            });
        }

        let bound: TaggedValues =
            self.columns.iter().copied().zip(values.iter().cloned()).collect();
        let key = encode(&self.table.schema, &bound, TupleSelection::Key)?;
        let complete = values.len() == self.columns.len();
        Ok(IndexLookup { table: self.table, key, bound, complete })
    }
}

#[derive(Debug, Clone)]
pub struct IndexLookup<'a> {
    table: &'a Table,
    key: Tuple,
    bound: TaggedValues,
    complete: bool,
}

impl<'a> IndexLookup<'a> {
    #[must_use]
    pub fn key(&self) -> &Tuple {
        &self.key
    }

    /// Matching rows in key order.
    pub fn row_iter(&self) -> Box<dyn Iterator<Item = Row> + 'a> {
        let table: &'a Table = self.table;
        if self.complete {
            return Box::new(table.get(&self.key).into_iter());
        }

        let key_tags = table.schema.pk_columns().iter().map(|c| c.tag).collect::<Vec<_>>();
        let is_tag_prefix =
            self.bound.keys().copied().eq(key_tags.iter().copied().take(self.bound.len()));
        let rows: &'a BTreeMap<Tuple, Tuple> = table.rows.as_ref();

        if is_tag_prefix {
            let prefix = self.key.clone();
            return Box::new(
                rows.range(prefix.clone()..)
                    .take_while(move |(key, _)| key.as_bytes().starts_with(prefix.as_bytes()))
                    .map(|(key, value)| Row { key: key.clone(), value: value.clone() }),
            );
        }

        let bound = self.bound.clone();
        Box::new(
            rows.iter()
                .filter(move |(key, _)| {
                    key.elements().is_ok_and(|elements| {
                        bound.iter().all(|(tag, value)| {
                            elements.iter().any(|(found, stored)| found == tag && stored == value)
                        })
                    })
                })
                .map(|(key, value)| Row { key: key.clone(), value: value.clone() }),
        )
    }
}

/// Copy-on-write bulk-insert session over a table.
#[derive(Debug, Clone)]
pub struct TableEditor {
    table: Table,
    failed: Option<KernelError>,
}

impl TableEditor {
    fn check_required(&self, values: &TaggedValues) -> Result<(), KernelError> {
        for column in self.table.schema.columns() {
            let present = values.get(&column.tag).is_some_and(|value| !value.is_null());
            if !present && (column.is_primary_key || !column.nullable) {
                return Err(KernelError::Insert(format!(
                    "column `{}` of table `{}` cannot be null",
                    column.name, self.table.name
                )));
            }
        }
        Ok(())
    }

    fn try_insert(&mut self, values: &TaggedValues) -> Result<(), KernelError> {
        self.check_required(values)?;
        let row = encode_row(&self.table.schema, values)?;
        let rows = Arc::make_mut(&mut self.table.rows);
        if rows.contains_key(&row.key) {
            return Err(KernelError::Insert(format!(
                "duplicate primary key {} in table `{}`",
                describe_key(&row.key),
                self.table.name
            )));
        }
        rows.insert(row.key, row.value);
        Ok(())
    }
}

impl Inserter for TableEditor {
    fn insert(&mut self, values: &TaggedValues) -> Result<(), KernelError> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        self.try_insert(values).inspect_err(|err| self.failed = Some(err.clone()))
    }

    fn close(self) -> Result<Table, KernelError> {
        match self.failed {
            Some(err) => Err(err),
            None => Ok(self.table),
        }
    }
}

fn describe_key(key: &Tuple) -> String {
    match key.elements() {
        Ok(elements) => {
            let parts = elements.iter().map(|(_, value)| value.to_string()).collect::<Vec<_>>();
            format!("({})", parts.join(", "))
        }
        Err(_) => key.to_hex(),
    }
}

fn hash_bytes(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

/// Immutable snapshot of every table in a working set.
///
/// Names are matched case-insensitively. Every mutation returns a new root;
/// unchanged tables are shared with the source root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionedRoot {
    tables: BTreeMap<String, Table>,
}

impl VersionedRoot {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get_table(&self, name: &str) -> Option<&Table> {
        self.tables.get(&name.to_ascii_lowercase())
    }

    #[must_use]
    pub fn has_table(&self, name: &str) -> bool {
        self.get_table(name).is_some()
    }

    /// Table names as they were created, in case-insensitive order.
    #[must_use]
    pub fn table_names(&self) -> Vec<&str> {
        self.tables.values().map(Table::name).collect()
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    /// # Errors
    /// Returns [`KernelError::TableExists`] when the name is taken.
    pub fn create_table(&self, name: &str, schema: Schema) -> Result<Self, KernelError> {
        if self.has_table(name) {
            return Err(KernelError::TableExists(name.to_string()));
        }
        Ok(self.put_table(Table::new(name, schema)))
    }

    /// # Errors
    /// Returns [`KernelError::TableNotFound`] when no table has that name.
    pub fn drop_table(&self, name: &str) -> Result<Self, KernelError> {
        let mut tables = self.tables.clone();
        if tables.remove(&name.to_ascii_lowercase()).is_none() {
            return Err(KernelError::TableNotFound(name.to_string()));
        }
        Ok(Self { tables })
    }

    /// Insert or replace a table by name.
    #[must_use]
    pub fn put_table(&self, table: Table) -> Self {
        let mut tables = self.tables.clone();
        tables.insert(table.name.to_ascii_lowercase(), table);
        Self { tables }
    }

    #[must_use]
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"root/v1");
        for table in self.tables.values() {
            hash_bytes(&mut hasher, table.name.as_bytes());
            hash_bytes(&mut hasher, table.content_hash().as_bytes());
        }
        format!("sha256:{}", hex::encode(hasher.finalize()))
    }
}
