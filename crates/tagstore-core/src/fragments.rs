//! The schema-fragments system table: stored views, triggers and procedures.
//!
//! The table has had three on-disk layouts. Opening it detects the layout,
//! rewrites legacy rows into the current one and swaps the table inside a new
//! [`VersionedRoot`]. The input root is only ever borrowed, so a failed
//! migration leaves it exactly as it was.

use std::fmt::{Display, Formatter};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::codec::Row;
use crate::schema::{Column, Schema, Tag, TypeKind};
use crate::table::{Indexes, Inserter, RowData, Table, VersionedRoot, PRIMARY_INDEX_ID};
use crate::value::{TaggedValues, Value};
use crate::KernelError;

pub const SCHEMAS_TABLE_NAME: &str = "ts_schemas";

/// Reserved tag range for system tables; user tags stay below it.
pub const SYSTEM_TAG_BASE: u64 = 1 << 50;
pub const TYPE_TAG: Tag = Tag(SYSTEM_TAG_BASE + 1);
pub const NAME_TAG: Tag = Tag(SYSTEM_TAG_BASE + 2);
pub const FRAGMENT_TAG: Tag = Tag(SYSTEM_TAG_BASE + 3);
pub const ID_TAG: Tag = Tag(SYSTEM_TAG_BASE + 4);
pub const CREATED_AT_TAG: Tag = Tag(SYSTEM_TAG_BASE + 5);
pub const MODIFIED_AT_TAG: Tag = Tag(SYSTEM_TAG_BASE + 6);
pub const METADATA_TAG: Tag = Tag(SYSTEM_TAG_BASE + 7);

pub const TYPE_COL: &str = "type";
pub const NAME_COL: &str = "name";
pub const FRAGMENT_COL: &str = "fragment";
pub const ID_COL: &str = "id";
pub const CREATED_AT_COL: &str = "created_at";
pub const MODIFIED_AT_COL: &str = "modified_at";
pub const METADATA_COL: &str = "metadata";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FragmentType {
    View,
    Trigger,
    Procedure,
}

impl FragmentType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Trigger => "trigger",
            Self::Procedure => "procedure",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "view" => Some(Self::View),
            "trigger" => Some(Self::Trigger),
            "procedure" => Some(Self::Procedure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SchemaFragment {
    pub fragment_type: FragmentType,
    pub name: String,
    pub fragment: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub modified_at: OffsetDateTime,
    pub metadata: String,
}

impl SchemaFragment {
    /// Build the typed fragment from a current-layout row.
    ///
    /// # Errors
    /// Returns [`KernelError::RowDecode`] when a required column is missing,
    /// has the wrong kind, or holds an unknown fragment type.
    pub fn from_values(values: &TaggedValues) -> Result<Self, KernelError> {
        let text = |tag: Tag, column: &str| match values.get(&tag) {
            Some(Value::String(value)) => Ok(value.clone()),
            None | Some(Value::Null) => Ok(String::new()),
            Some(other) => Err(KernelError::RowDecode(format!(
                "column `{column}` holds {other:?}, expected string"
            ))),
        };
        let timestamp = |tag: Tag, column: &str| match values.get(&tag) {
            Some(Value::Timestamp(at)) => Ok(*at),
            None | Some(Value::Null) => Ok(OffsetDateTime::UNIX_EPOCH),
            Some(other) => Err(KernelError::RowDecode(format!(
                "column `{column}` holds {other:?}, expected timestamp"
            ))),
        };

        let raw_type = text(TYPE_TAG, TYPE_COL)?;
        let fragment_type = FragmentType::parse(&raw_type)
            .ok_or_else(|| KernelError::RowDecode(format!("unknown fragment type: {raw_type}")))?;
        let name = text(NAME_TAG, NAME_COL)?;
        if name.is_empty() {
            return Err(KernelError::RowDecode("fragment row has no name".to_string()));
        }

        Ok(Self {
            fragment_type,
            name,
            fragment: text(FRAGMENT_TAG, FRAGMENT_COL)?,
            created_at: timestamp(CREATED_AT_TAG, CREATED_AT_COL)?,
            modified_at: timestamp(MODIFIED_AT_TAG, MODIFIED_AT_COL)?,
            metadata: text(METADATA_TAG, METADATA_COL)?,
        })
    }

    #[must_use]
    pub fn to_values(&self) -> TaggedValues {
        TaggedValues::from([
            (TYPE_TAG, Value::from(self.fragment_type.as_str())),
            (NAME_TAG, Value::from(self.name.as_str())),
            (FRAGMENT_TAG, Value::from(self.fragment.as_str())),
            (CREATED_AT_TAG, Value::Timestamp(self.created_at)),
            (MODIFIED_AT_TAG, Value::Timestamp(self.modified_at)),
            (METADATA_TAG, Value::from(self.metadata.as_str())),
        ])
    }
}

/// Fixed description of the schema-fragments table: its name, the current
/// schema, the historical layouts and the values given to columns a legacy
/// row lacks. Built once per process and passed explicitly.
#[derive(Debug, Clone)]
pub struct SchemasTableLayout {
    table_name: String,
    current: Schema,
    v1: Schema,
    v2: Schema,
    sentinels: TaggedValues,
}

impl SchemasTableLayout {
    #[must_use]
    pub fn current() -> &'static Self {
        static LAYOUT: OnceLock<SchemasTableLayout> = OnceLock::new();
        LAYOUT.get_or_init(Self::build)
    }

    fn build() -> Self {
        let string = |name: &str, tag: Tag, pk: bool| Column::new(name, tag.0, TypeKind::String, pk);

        let current = Schema::fixed(vec![
            string(TYPE_COL, TYPE_TAG, true),
            string(NAME_COL, NAME_TAG, true),
            string(FRAGMENT_COL, FRAGMENT_TAG, false),
            Column::new(CREATED_AT_COL, CREATED_AT_TAG.0, TypeKind::Timestamp, false).not_null(),
            Column::new(MODIFIED_AT_COL, MODIFIED_AT_TAG.0, TypeKind::Timestamp, false).not_null(),
            string(METADATA_COL, METADATA_TAG, false),
        ]);
        let v1 = Schema::fixed(vec![
            string(TYPE_COL, TYPE_TAG, true),
            string(NAME_COL, NAME_TAG, true),
            string(FRAGMENT_COL, FRAGMENT_TAG, false),
        ]);
        let v2 = Schema::fixed(vec![
            string(TYPE_COL, TYPE_TAG, false),
            string(NAME_COL, NAME_TAG, false),
            string(FRAGMENT_COL, FRAGMENT_TAG, false),
            Column::new(ID_COL, ID_TAG.0, TypeKind::Int, true),
        ]);
        let sentinels = TaggedValues::from([
            (CREATED_AT_TAG, Value::epoch()),
            (MODIFIED_AT_TAG, Value::epoch()),
            (METADATA_TAG, Value::from("")),
        ]);

        Self { table_name: SCHEMAS_TABLE_NAME.to_string(), current, v1, v2, sentinels }
    }

    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.current
    }

    /// Schema a table of the given version was written with.
    #[must_use]
    pub fn schema_for(&self, version: SchemaVersion) -> Option<&Schema> {
        match version {
            SchemaVersion::V1 => Some(&self.v1),
            SchemaVersion::V2 => Some(&self.v2),
            SchemaVersion::V3Current => Some(&self.current),
            SchemaVersion::Unsupported => None,
        }
    }

    fn sentinel(&self, tag: Tag) -> Option<&Value> {
        self.sentinels.get(&tag)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SchemaVersion {
    V1,
    V2,
    V3Current,
    Unsupported,
}

impl SchemaVersion {
    /// Classify a persisted schema by shape. Three columns is v1 and four is
    /// v2. It is v3 only when every current column is present with the same
    /// tag, name, kind and key flag; anything else is unsupported.
    #[must_use]
    pub fn classify(schema: &Schema, layout: &SchemasTableLayout) -> Self {
        match schema.len() {
            3 => Self::V1,
            4 => Self::V2,
            _ if matches_layout(schema, layout.schema()) => Self::V3Current,
            _ => Self::Unsupported,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V1 => "v1",
            Self::V2 => "v2",
            Self::V3Current => "v3",
            Self::Unsupported => "unsupported",
        }
    }

    #[must_use]
    pub fn is_current(self) -> bool {
        self == Self::V3Current
    }
}

impl Display for SchemaVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn matches_layout(schema: &Schema, current: &Schema) -> bool {
    schema.len() == current.len()
        && current.columns().iter().all(|expected| {
            schema.column_by_tag(expected.tag).is_some_and(|found| {
                found.name.eq_ignore_ascii_case(&expected.name)
                    && found.kind == expected.kind
                    && found.is_primary_key == expected.is_primary_key
            })
        })
}

/// One edge of the forward migration graph: columns copied by name into the
/// current layout and columns deliberately discarded. Every other source
/// column is an error, so a migration never loses data silently.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MigrationPlan {
    pub from: SchemaVersion,
    pub carried: &'static [&'static str],
    pub dropped: &'static [&'static str],
}

const TRANSITIONS: &[MigrationPlan] = &[
    MigrationPlan {
        from: SchemaVersion::V1,
        carried: &[TYPE_COL, NAME_COL, FRAGMENT_COL],
        dropped: &[],
    },
    MigrationPlan {
        from: SchemaVersion::V2,
        carried: &[TYPE_COL, NAME_COL, FRAGMENT_COL],
        dropped: &[ID_COL],
    },
];

impl MigrationPlan {
    #[must_use]
    pub fn for_version(version: SchemaVersion) -> Option<&'static Self> {
        TRANSITIONS.iter().find(|plan| plan.from == version)
    }
}

/// Stream `rows` of `old_schema` into current-layout mappings, in order.
///
/// Carried columns keep their values, dropped columns disappear and every
/// current column still unset receives its sentinel (epoch timestamps, empty
/// metadata).
///
/// # Errors
/// Fails up front with [`KernelError::UnknownColumn`] when a carried column
/// is missing from either schema or a source column has no mapping. Each
/// yielded item fails with [`KernelError::RowDecode`] when its source row
/// cannot be decoded.
pub fn migrate_rows<'a, I>(
    old_schema: &'a Schema,
    rows: I,
    plan: &MigrationPlan,
    layout: &'a SchemasTableLayout,
) -> Result<impl Iterator<Item = Result<TaggedValues, KernelError>> + 'a, KernelError>
where
    I: IntoIterator<Item = Row>,
    I::IntoIter: 'a,
{
    let target = layout.schema();
    let mut tag_map: Vec<(Tag, Tag)> = Vec::with_capacity(plan.carried.len());
    for name in plan.carried {
        let source = old_schema.column_by_name(name).ok_or_else(|| {
            KernelError::UnknownColumn(format!("{} layout has no `{name}` column", plan.from))
        })?;
        let dest = target.column_by_name(name).ok_or_else(|| {
            KernelError::UnknownColumn(format!("current layout has no `{name}` column"))
        })?;
        tag_map.push((source.tag, dest.tag));
    }

    for column in old_schema.columns() {
        let mapped = plan.carried.iter().chain(plan.dropped).any(|n| column.name.eq_ignore_ascii_case(n));
        if !mapped {
            return Err(KernelError::UnknownColumn(format!(
                "column `{}` has no mapping in the {} migration",
                column.name, plan.from
            )));
        }
    }

    let fill = target
        .columns()
        .iter()
        .filter(|column| !tag_map.iter().any(|(_, dest)| *dest == column.tag))
        .filter_map(|column| layout.sentinel(column.tag).map(|value| (column.tag, value.clone())))
        .collect::<Vec<_>>();

    Ok(rows.into_iter().map(move |row| {
        let source = row.decode(old_schema).map_err(|err| {
            KernelError::RowDecode(format!("legacy row {}: {err}", row.key.to_hex()))
        })?;
        let mut migrated = TaggedValues::new();
        for (from, to) in &tag_map {
            if let Some(value) = source.get(from) {
                migrated.insert(*to, value.clone());
            }
        }
        for (tag, value) in &fill {
            migrated.entry(*tag).or_insert_with(|| value.clone());
        }
        Ok(migrated)
    }))
}

/// Replace `table_name` in `root` with a table of `target_schema` holding
/// exactly `rows`.
///
/// Drops the old table, creates the new empty one, bulk-inserts every row and
/// closes the session. The new root is returned only when all of that
/// succeeds; `root` itself is never modified.
///
/// # Errors
/// Returns [`KernelError::TableNotFound`] when `root` lacks the table, the
/// first row error, or the bulk-insert failure.
pub fn swap_and_load<I>(
    root: &VersionedRoot,
    table_name: &str,
    target_schema: &Schema,
    rows: I,
) -> Result<VersionedRoot, KernelError>
where
    I: IntoIterator<Item = Result<TaggedValues, KernelError>>,
{
    let dropped = root.drop_table(table_name)?;
    let created = dropped.create_table(table_name, target_schema.clone())?;
    let empty = created
        .get_table(table_name)
        .ok_or_else(|| KernelError::TableNotFound(table_name.to_string()))?;

    let mut inserter = empty.editor();
    for row in rows {
        inserter.insert(&row?)?;
    }
    let loaded = inserter.close()?;

    Ok(created.put_table(loaded))
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct MigrationOutcome {
    /// `None` when the table did not exist and was created empty.
    pub detected: Option<SchemaVersion>,
    pub migrated_rows: usize,
}

impl MigrationOutcome {
    #[must_use]
    pub fn changed_root(&self) -> bool {
        !matches!(self.detected, Some(SchemaVersion::V3Current))
    }
}

#[derive(Debug, Clone)]
pub struct OpenedTable {
    pub root: VersionedRoot,
    pub table: Table,
    pub outcome: MigrationOutcome,
}

/// Return the schema-fragments table of `root`, migrating or creating it.
///
/// An already-current table comes back unchanged together with a clone of
/// `root`. A legacy table is migrated through [`migrate_rows`] and
/// [`swap_and_load`]; a missing one is created empty.
///
/// # Errors
/// Returns [`KernelError::UnsupportedSchemaVersion`] for an unrecognized
/// layout and any migration or insert error. `root` is left untouched on
/// every error path.
pub fn open_schemas_table(
    root: &VersionedRoot,
    layout: &SchemasTableLayout,
) -> Result<OpenedTable, KernelError> {
    let name = layout.table_name();

    let Some(existing) = root.get_table(name) else {
        let created = root.create_table(name, layout.schema().clone())?;
        let table = fetch(&created, name)?;
        tracing::info!(table = name, "created empty schemas table");
        return Ok(OpenedTable {
            root: created,
            table,
            outcome: MigrationOutcome { detected: None, migrated_rows: 0 },
        });
    };

    let detected = SchemaVersion::classify(existing.schema(), layout);
    if detected.is_current() {
        tracing::debug!(table = name, "schemas table already current");
        return Ok(OpenedTable {
            root: root.clone(),
            table: existing.clone(),
            outcome: MigrationOutcome { detected: Some(detected), migrated_rows: 0 },
        });
    }

    let unsupported = || KernelError::UnsupportedSchemaVersion {
        table: name.to_string(),
        columns: existing.schema().len(),
    };
    let plan = MigrationPlan::for_version(detected).ok_or_else(unsupported)?;

    tracing::info!(table = name, from = %detected, rows = existing.row_count(), "migrating schemas table");
    let rows = migrate_rows(existing.schema(), existing.iter_rows(), plan, layout)?;
    let migrated = swap_and_load(root, name, layout.schema(), rows)?;
    let table = fetch(&migrated, name)?;

    if table.row_count() != existing.row_count() {
        return Err(KernelError::Insert(format!(
            "migration of `{name}` produced {} rows from {}",
            table.row_count(),
            existing.row_count()
        )));
    }

    tracing::info!(table = name, from = %detected, rows = table.row_count(), "schemas table migrated");
    Ok(OpenedTable {
        root: migrated,
        outcome: MigrationOutcome { detected: Some(detected), migrated_rows: table.row_count() },
        table,
    })
}

fn fetch(root: &VersionedRoot, name: &str) -> Result<Table, KernelError> {
    root.get_table(name).cloned().ok_or_else(|| KernelError::TableNotFound(name.to_string()))
}

/// Point query on the primary index for one fragment.
///
/// # Errors
/// Returns [`KernelError::MissingPrimaryIndex`] when the table exposes no
/// primary index, and codec errors for a table whose key columns are not
/// strings. A missing row is `Ok(None)`.
pub fn lookup_fragment(
    table: &Table,
    fragment_type: FragmentType,
    name: &str,
) -> Result<Option<Row>, KernelError> {
    let index = table
        .index(PRIMARY_INDEX_ID)
        .ok_or_else(|| KernelError::MissingPrimaryIndex(table.name().to_string()))?;
    let lookup = index.get(&[Value::from(fragment_type.as_str()), Value::from(name)])?;
    Ok(lookup.row_iter().next())
}

/// [`lookup_fragment`] decoded into a [`SchemaFragment`].
///
/// # Errors
/// See [`lookup_fragment`]; decode failures surface as
/// [`KernelError::RowDecode`].
pub fn get_fragment(
    table: &Table,
    fragment_type: FragmentType,
    name: &str,
) -> Result<Option<SchemaFragment>, KernelError> {
    lookup_fragment(table, fragment_type, name)?
        .map(|row| SchemaFragment::from_values(&row.decode(table.schema())?))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn layout() -> &'static SchemasTableLayout {
        SchemasTableLayout::current()
    }

    fn legacy_schema(version: SchemaVersion) -> Schema {
        match layout().schema_for(version) {
            Some(schema) => schema.clone(),
            None => panic!("no schema for {version}"),
        }
    }

    fn v1_plan() -> &'static MigrationPlan {
        match MigrationPlan::for_version(SchemaVersion::V1) {
            Some(plan) => plan,
            None => panic!("no v1 migration plan"),
        }
    }

    fn v1_row(kind: &str, name: &str, fragment: &str) -> TaggedValues {
        TaggedValues::from([
            (TYPE_TAG, Value::from(kind)),
            (NAME_TAG, Value::from(name)),
            (FRAGMENT_TAG, Value::from(fragment)),
        ])
    }

    fn v2_row(kind: &str, name: &str, fragment: &str, id: i64) -> TaggedValues {
        let mut row = v1_row(kind, name, fragment);
        row.insert(ID_TAG, Value::Int(id));
        row
    }

    fn expected_v3(kind: &str, name: &str, fragment: &str) -> TaggedValues {
        let mut row = v1_row(kind, name, fragment);
        row.insert(CREATED_AT_TAG, Value::epoch());
        row.insert(MODIFIED_AT_TAG, Value::epoch());
        row.insert(METADATA_TAG, Value::from(""));
        row
    }

    fn root_with(schema: Schema, rows: &[TaggedValues]) -> Result<VersionedRoot, KernelError> {
        let root = VersionedRoot::empty().create_table(SCHEMAS_TABLE_NAME, schema)?;
        let Some(table) = root.get_table(SCHEMAS_TABLE_NAME) else {
            return Err(KernelError::TableNotFound(SCHEMAS_TABLE_NAME.to_string()));
        };
        let mut editor = table.editor();
        for row in rows {
            editor.insert(row)?;
        }
        Ok(root.put_table(editor.close()?))
    }

    fn decoded_rows(table: &Table) -> Result<Vec<TaggedValues>, KernelError> {
        table.iter_rows().map(|row| row.decode(table.schema())).collect()
    }

    fn extra_column_schema(count: usize) -> Schema {
        let mut columns = vec![Column::new("k", 1, TypeKind::Int, true)];
        for index in 1..count {
            columns.push(Column::new(&format!("c{index}"), 10 + index as u64, TypeKind::String, false));
        }
        match Schema::new(columns) {
            Ok(schema) => schema,
            Err(err) => panic!("fixture schema rejected: {err}"),
        }
    }

    // Test IDs: TFRAG-001
    #[test]
    fn classify_by_column_count_and_current_names() {
        let layout = layout();
        assert_eq!(SchemaVersion::classify(&legacy_schema(SchemaVersion::V1), layout), SchemaVersion::V1);
        assert_eq!(SchemaVersion::classify(&legacy_schema(SchemaVersion::V2), layout), SchemaVersion::V2);
        assert_eq!(SchemaVersion::classify(layout.schema(), layout), SchemaVersion::V3Current);
        assert_eq!(SchemaVersion::classify(&extra_column_schema(3), layout), SchemaVersion::V1);
        assert_eq!(SchemaVersion::classify(&extra_column_schema(4), layout), SchemaVersion::V2);
        assert_eq!(SchemaVersion::classify(&extra_column_schema(6), layout), SchemaVersion::Unsupported);
        assert_eq!(SchemaVersion::classify(&extra_column_schema(2), layout), SchemaVersion::Unsupported);
        assert_eq!(SchemaVersion::classify(&extra_column_schema(5), layout), SchemaVersion::Unsupported);
    }

    // Test IDs: TFRAG-002
    #[test]
    fn v1_table_is_migrated_with_epoch_sentinels() -> Result<(), KernelError> {
        let root = root_with(
            legacy_schema(SchemaVersion::V1),
            &[
                v1_row("view", "view1", "SELECT v1 FROM test;"),
                v1_row("view", "view2", "SELECT v2 FROM test;"),
            ],
        )?;

        let opened = open_schemas_table(&root, layout())?;
        assert_eq!(opened.outcome.detected, Some(SchemaVersion::V1));
        assert_eq!(opened.outcome.migrated_rows, 2);
        assert_eq!(opened.table.schema(), layout().schema());
        assert_eq!(
            decoded_rows(&opened.table)?,
            vec![
                expected_v3("view", "view1", "SELECT v1 FROM test;"),
                expected_v3("view", "view2", "SELECT v2 FROM test;"),
            ]
        );
        assert_eq!(root.get_table(SCHEMAS_TABLE_NAME).map(|t| t.schema().len()), Some(3));
        Ok(())
    }

    // Test IDs: TFRAG-003
    #[test]
    fn v2_table_drops_surrogate_id() -> Result<(), KernelError> {
        let root = root_with(
            legacy_schema(SchemaVersion::V2),
            &[
                v2_row("view", "view1", "SELECT v1 FROM test;", 1),
                v2_row("view", "view2", "SELECT v2 FROM test;", 2),
            ],
        )?;

        let opened = open_schemas_table(&root, layout())?;
        assert_eq!(opened.outcome.detected, Some(SchemaVersion::V2));
        let rows = decoded_rows(&opened.table)?;
        assert_eq!(
            rows,
            vec![
                expected_v3("view", "view1", "SELECT v1 FROM test;"),
                expected_v3("view", "view2", "SELECT v2 FROM test;"),
            ]
        );
        assert!(rows.iter().all(|row| !row.contains_key(&ID_TAG)));
        Ok(())
    }

    // Test IDs: TFRAG-004
    #[test]
    fn duplicate_type_name_in_v2_aborts_and_preserves_root() -> Result<(), KernelError> {
        let root = root_with(
            legacy_schema(SchemaVersion::V2),
            &[
                v2_row("view", "dup", "SELECT 1;", 1),
                v2_row("view", "dup", "SELECT 2;", 2),
            ],
        )?;
        let hash_before = root.content_hash();
        let Some(table_before) = root.get_table(SCHEMAS_TABLE_NAME).cloned() else {
            panic!("fixture table missing");
        };

        let err = match open_schemas_table(&root, layout()) {
            Ok(_) => panic!("expected duplicate (type, name) to abort the migration"),
            Err(err) => err,
        };
        assert!(matches!(err, KernelError::Insert(msg) if msg.contains("duplicate")));
        assert_eq!(root.content_hash(), hash_before);
        assert_eq!(root.get_table(SCHEMAS_TABLE_NAME), Some(&table_before));
        Ok(())
    }

    // Test IDs: TFRAG-005
    #[test]
    fn failing_row_stream_leaves_root_untouched() -> Result<(), KernelError> {
        let root = root_with(legacy_schema(SchemaVersion::V1), &[v1_row("view", "a", "x")])?;
        let hash_before = root.content_hash();
        let rows = vec![
            Ok(expected_v3("view", "a", "x")),
            Err(KernelError::RowDecode("injected".to_string())),
        ];

        let result = swap_and_load(&root, SCHEMAS_TABLE_NAME, layout().schema(), rows);
        assert_eq!(result, Err(KernelError::RowDecode("injected".to_string())));
        assert_eq!(root.content_hash(), hash_before);
        Ok(())
    }

    // Test IDs: TFRAG-006
    #[test]
    fn undecodable_legacy_row_aborts_migration() -> Result<(), KernelError> {
        let schema = legacy_schema(SchemaVersion::V1);
        let good = crate::codec::encode_row(&schema, &v1_row("view", "a", "x"))?;
        let bad = Row { key: good.key.clone(), value: crate::codec::Tuple::from_bytes(vec![9]) };

        let rows = migrate_rows(&schema, vec![good, bad], v1_plan(), layout())?
            .collect::<Vec<_>>();
        assert!(rows[0].is_ok());
        assert!(matches!(&rows[1], Err(KernelError::RowDecode(msg)) if msg.contains("legacy row")));
        Ok(())
    }

    // Test IDs: TFRAG-007
    #[test]
    fn unmapped_legacy_column_is_rejected_up_front() {
        let schema = extra_column_schema(3);
        let result = migrate_rows(&schema, Vec::new(), v1_plan(), layout());
        assert!(matches!(result, Err(KernelError::UnknownColumn(_))));
    }

    // Test IDs: TFRAG-008
    #[test]
    fn unsupported_layout_is_fatal() -> Result<(), KernelError> {
        let root = VersionedRoot::empty().create_table(SCHEMAS_TABLE_NAME, extra_column_schema(5))?;
        assert!(matches!(
            open_schemas_table(&root, layout()),
            Err(KernelError::UnsupportedSchemaVersion { columns: 5, .. })
        ));
        Ok(())
    }

    fn retagged_schema(retag: impl Fn(usize, &Column) -> Column) -> Schema {
        let columns =
            layout().schema().columns().iter().enumerate().map(|(i, c)| retag(i, c)).collect();
        match Schema::new(columns) {
            Ok(schema) => schema,
            Err(err) => panic!("fixture schema rejected: {err}"),
        }
    }

    // Test IDs: TFRAG-009
    #[test]
    fn current_names_under_foreign_tags_are_unsupported() -> Result<(), KernelError> {
        let renumbered = retagged_schema(|index, column| Column {
            tag: Tag(index as u64 + 1),
            ..column.clone()
        });
        assert_eq!(SchemaVersion::classify(&renumbered, layout()), SchemaVersion::Unsupported);

        let root = VersionedRoot::empty().create_table(SCHEMAS_TABLE_NAME, renumbered)?;
        assert!(matches!(
            open_schemas_table(&root, layout()),
            Err(KernelError::UnsupportedSchemaVersion { columns: 6, .. })
        ));

        let retyped = retagged_schema(|_, column| {
            if column.tag == METADATA_TAG {
                Column { kind: TypeKind::Int, ..column.clone() }
            } else {
                column.clone()
            }
        });
        assert_eq!(SchemaVersion::classify(&retyped, layout()), SchemaVersion::Unsupported);

        let upper = retagged_schema(|_, column| Column {
            name: column.name.to_ascii_uppercase(),
            ..column.clone()
        });
        assert_eq!(SchemaVersion::classify(&upper, layout()), SchemaVersion::V3Current);
        Ok(())
    }

    // Test IDs: TFRAG-010
    #[test]
    fn current_table_is_returned_unchanged() -> Result<(), KernelError> {
        let root = root_with(layout().schema().clone(), &[expected_v3("trigger", "t1", "BEGIN END")])?;
        let opened = open_schemas_table(&root, layout())?;
        assert_eq!(opened.outcome.detected, Some(SchemaVersion::V3Current));
        assert!(!opened.outcome.changed_root());
        assert_eq!(opened.root, root);

        let again = open_schemas_table(&opened.root, layout())?;
        assert_eq!(again.root.content_hash(), root.content_hash());
        Ok(())
    }

    // Test IDs: TFRAG-011
    #[test]
    fn missing_table_is_created_empty() -> Result<(), KernelError> {
        let opened = open_schemas_table(&VersionedRoot::empty(), layout())?;
        assert_eq!(opened.outcome.detected, None);
        assert!(opened.outcome.changed_root());
        assert_eq!(opened.table.row_count(), 0);
        assert!(opened.root.has_table(SCHEMAS_TABLE_NAME));
        Ok(())
    }

    // Test IDs: TFRAG-012
    #[test]
    fn lookup_finds_fragment_by_composite_key() -> Result<(), KernelError> {
        let created = OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000);
        let fragment = SchemaFragment {
            fragment_type: FragmentType::Procedure,
            name: "refresh".to_string(),
            fragment: "CREATE PROCEDURE refresh() SELECT 1".to_string(),
            created_at: created,
            modified_at: created,
            metadata: "{}".to_string(),
        };
        let root = root_with(
            layout().schema().clone(),
            &[fragment.to_values(), expected_v3("view", "refresh", "SELECT 2")],
        )?;
        let Some(table) = root.get_table(SCHEMAS_TABLE_NAME) else {
            panic!("fixture table missing");
        };

        assert_eq!(get_fragment(table, FragmentType::Procedure, "refresh")?, Some(fragment));
        let view = get_fragment(table, FragmentType::View, "refresh")?;
        assert_eq!(view.map(|f| f.fragment), Some("SELECT 2".to_string()));
        assert_eq!(lookup_fragment(table, FragmentType::Trigger, "refresh")?, None);
        Ok(())
    }

    // Test IDs: TFRAG-013
    #[test]
    fn lookup_after_v1_migration() -> Result<(), KernelError> {
        let root = root_with(legacy_schema(SchemaVersion::V1), &[v1_row("view", "view1", "SELECT 1")])?;
        let opened = open_schemas_table(&root, layout())?;
        let found = get_fragment(&opened.table, FragmentType::View, "view1")?;
        assert_eq!(found.map(|f| f.created_at), Some(OffsetDateTime::UNIX_EPOCH));
        Ok(())
    }

    // Test IDs: TFRAG-014
    #[test]
    fn every_legacy_version_has_a_transition() {
        for version in [SchemaVersion::V1, SchemaVersion::V2] {
            assert!(MigrationPlan::for_version(version).is_some(), "{version} has no plan");
        }
        assert!(MigrationPlan::for_version(SchemaVersion::V3Current).is_none());
        assert!(MigrationPlan::for_version(SchemaVersion::Unsupported).is_none());
    }
}
