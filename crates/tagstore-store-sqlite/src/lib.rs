use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tagstore_core::{
    open_schemas_table, KernelError, MigrationOutcome, RowData, Schema, SchemaVersion,
    SchemasTableLayout, Table, Tuple, VersionedRoot,
};
use time::OffsetDateTime;

pub const WORKING_REF: &str = "working";

const CREATE_STORE_SQL: &str = r"
CREATE TABLE IF NOT EXISTS chunks (
  hash TEXT PRIMARY KEY,
  kind TEXT NOT NULL CHECK (kind IN ('table','root')),
  body BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS refs (
  name TEXT PRIMARY KEY,
  root_hash TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (root_hash) REFERENCES chunks(hash)
);
";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum JournalMode {
    #[default]
    Wal,
    Delete,
    Memory,
}

impl JournalMode {
    fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "WAL",
            Self::Delete => "DELETE",
            Self::Memory => "MEMORY",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    pub busy_timeout_ms: u32,
    pub journal_mode: JournalMode,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { busy_timeout_ms: 5000, journal_mode: JournalMode::Wal }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkKind {
    Table,
    Root,
}

impl ChunkKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Table => "table",
            Self::Root => "root",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableChunk {
    name: String,
    schema: Schema,
    /// Hex-encoded `(key, value)` tuples in key order.
    rows: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct RootChunk {
    /// Table name as created → table chunk hash.
    tables: BTreeMap<String, String>,
}

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemasStatus {
    pub table: String,
    pub exists: bool,
    pub detected_version: Option<SchemaVersion>,
    pub columns: usize,
    pub rows: usize,
    pub migration_pending: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SchemasOpenReport {
    pub outcome: MigrationOutcome,
    pub committed: bool,
    pub root_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkMismatch {
    pub hash: String,
    pub problem: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub working_root_hash: Option<String>,
    pub verified_chunks: usize,
    pub chunk_mismatches: Vec<ChunkMismatch>,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.quick_check_ok && self.chunk_mismatches.is_empty()
    }
}

impl SqliteStore {
    /// Open a store with [`StoreConfig::default`].
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or initialized.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_config(path, &StoreConfig::default())
    }

    /// Open a SQLite-backed store, apply runtime pragmas and create the chunk
    /// and ref tables.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened, pragmas cannot be
    /// applied, or the store tables cannot be created.
    pub fn open_with_config(path: &Path, config: &StoreConfig) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(&format!(
            "PRAGMA journal_mode = {};
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {};",
            config.journal_mode.pragma_value(),
            config.busy_timeout_ms
        ))
        .context("failed to configure sqlite pragmas")?;

        conn.execute_batch(CREATE_STORE_SQL).context("failed to create store tables")?;
        tracing::debug!(path = %path.display(), "opened sqlite store");

        Ok(Self { conn })
    }

    /// Hash of the root chunk the working ref points at.
    ///
    /// # Errors
    /// Returns an error when the ref table cannot be read.
    pub fn working_root_hash(&self) -> Result<Option<String>> {
        read_ref(&self.conn, WORKING_REF)
    }

    /// Load the working root, verifying every chunk hash on the way. A store
    /// without a working ref yields an empty root.
    ///
    /// # Errors
    /// Returns an error when a chunk is missing, fails hash verification, or
    /// holds rows that do not decode under the stored schema.
    pub fn working_root(&self) -> Result<VersionedRoot> {
        let Some(root_hash) = self.working_root_hash()? else {
            return Ok(VersionedRoot::empty());
        };

        let root_chunk: RootChunk = load_chunk(&self.conn, &root_hash, ChunkKind::Root)?;
        let mut root = VersionedRoot::empty();
        for (name, table_hash) in &root_chunk.tables {
            let chunk: TableChunk = load_chunk(&self.conn, table_hash, ChunkKind::Table)
                .with_context(|| format!("failed to load table `{name}`"))?;
            root = root.put_table(table_from_chunk(chunk)?);
        }
        Ok(root)
    }

    /// Persist every chunk of `root` and move the working ref to it inside one
    /// transaction. Returns the new root chunk hash.
    ///
    /// # Errors
    /// Returns an error when serialization or any write fails; the working
    /// ref is unchanged in that case.
    pub fn commit_working_root(&mut self, root: &VersionedRoot) -> Result<String> {
        let tx = self.conn.transaction().context("failed to start commit transaction")?;
        let root_hash = write_root(&tx, root)?;
        tx.execute(
            "INSERT INTO refs(name, root_hash, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET root_hash = excluded.root_hash,
                                             updated_at = excluded.updated_at",
            params![WORKING_REF, root_hash, now_rfc3339()?],
        )
        .context("failed to move working ref")?;
        tx.commit().context("failed to commit working root")?;

        tracing::info!(root_hash = %root_hash, tables = root.tables().count(), "committed working root");
        Ok(root_hash)
    }

    /// Load the working root, apply `change` and commit the result when it
    /// differs from what was loaded.
    ///
    /// # Errors
    /// Returns the error from `change` or from loading and committing.
    pub fn update_working_root<F>(&mut self, change: F) -> Result<VersionedRoot>
    where
        F: FnOnce(&VersionedRoot) -> Result<VersionedRoot, KernelError>,
    {
        let before = self.working_root()?;
        let after = change(&before)?;
        if after.content_hash() != before.content_hash() {
            self.commit_working_root(&after)?;
        }
        Ok(after)
    }

    /// Open the schema-fragments table of the working root, migrating or
    /// creating it, and commit when that changed the root.
    ///
    /// # Errors
    /// Returns an error for unsupported layouts and failed migrations. The
    /// persisted working root is untouched on every error path.
    pub fn open_schemas_table(&mut self) -> Result<(Table, SchemasOpenReport)> {
        let layout = SchemasTableLayout::current();
        let before = self.working_root()?;
        let opened = open_schemas_table(&before, layout)
            .with_context(|| format!("failed to open `{}`", layout.table_name()))?;

        let changed = opened.root.content_hash() != before.content_hash();
        let root_hash = if changed {
            self.commit_working_root(&opened.root)?
        } else {
            self.working_root_hash()?.unwrap_or_default()
        };

        Ok((
            opened.table,
            SchemasOpenReport { outcome: opened.outcome, committed: changed, root_hash },
        ))
    }

    /// Describe the schema-fragments table without changing anything.
    ///
    /// # Errors
    /// Returns an error when the working root cannot be loaded.
    pub fn schemas_status(&self) -> Result<SchemasStatus> {
        let layout = SchemasTableLayout::current();
        let root = self.working_root()?;
        let table_name = layout.table_name().to_string();

        let Some(table) = root.get_table(&table_name) else {
            return Ok(SchemasStatus {
                table: table_name,
                exists: false,
                detected_version: None,
                columns: 0,
                rows: 0,
                migration_pending: true,
            });
        };

        let detected = SchemaVersion::classify(table.schema(), layout);
        Ok(SchemasStatus {
            table: table_name,
            exists: true,
            detected_version: Some(detected),
            columns: table.schema().len(),
            rows: table.row_count(),
            migration_pending: !detected.is_current(),
        })
    }

    /// Run `PRAGMA quick_check` and re-hash every chunk reachable from the
    /// working ref.
    ///
    /// # Errors
    /// Returns an error when a check query fails. Hash problems are reported,
    /// not returned as errors.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let working_root_hash = self.working_root_hash()?;
        let mut verified_chunks = 0;
        let mut chunk_mismatches = Vec::new();

        if let Some(root_hash) = &working_root_hash {
            let mut pending = vec![(root_hash.clone(), ChunkKind::Root)];
            while let Some((hash, kind)) = pending.pop() {
                match verify_chunk(&self.conn, &hash, kind)? {
                    Ok(body) => {
                        verified_chunks += 1;
                        if kind == ChunkKind::Root {
                            match serde_json::from_slice::<RootChunk>(&body) {
                                Ok(chunk) => pending.extend(
                                    chunk.tables.into_values().map(|h| (h, ChunkKind::Table)),
                                ),
                                Err(err) => chunk_mismatches.push(ChunkMismatch {
                                    hash: hash.clone(),
                                    problem: format!("unreadable root chunk: {err}"),
                                }),
                            }
                        }
                    }
                    Err(problem) => {
                        tracing::warn!(hash = %hash, problem = %problem, "chunk failed verification");
                        chunk_mismatches.push(ChunkMismatch { hash, problem });
                    }
                }
            }
        }

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            working_root_hash,
            verified_chunks,
            chunk_mismatches,
        })
    }
}

fn write_root(tx: &Transaction<'_>, root: &VersionedRoot) -> Result<String> {
    let mut root_chunk = RootChunk::default();
    for table in root.tables() {
        let chunk = TableChunk {
            name: table.name().to_string(),
            schema: table.schema().clone(),
            rows: table.iter_rows().map(|row| (row.key.to_hex(), row.value.to_hex())).collect(),
        };
        let hash = write_chunk(tx, ChunkKind::Table, &chunk)
            .with_context(|| format!("failed to write table `{}`", table.name()))?;
        root_chunk.tables.insert(table.name().to_string(), hash);
    }
    write_chunk(tx, ChunkKind::Root, &root_chunk)
}

fn write_chunk<T: Serialize>(tx: &Transaction<'_>, kind: ChunkKind, chunk: &T) -> Result<String> {
    let body = serde_json::to_vec(chunk).context("failed to serialize chunk")?;
    let hash = chunk_hash(&body);
    tx.execute(
        "INSERT OR IGNORE INTO chunks(hash, kind, body) VALUES (?1, ?2, ?3)",
        params![hash, kind.as_str(), body],
    )
    .with_context(|| format!("failed to write {} chunk {hash}", kind.as_str()))?;
    Ok(hash)
}

fn load_chunk<T: DeserializeOwned>(conn: &Connection, hash: &str, kind: ChunkKind) -> Result<T> {
    let body = verify_chunk(conn, hash, kind)?.map_err(|problem| anyhow!("chunk {hash}: {problem}"))?;
    serde_json::from_slice(&body)
        .with_context(|| format!("failed to parse {} chunk {hash}", kind.as_str()))
}

/// Outer error: the query failed. Inner error: the chunk is missing, has the
/// wrong kind, or its body does not hash to `hash`.
fn verify_chunk(
    conn: &Connection,
    hash: &str,
    kind: ChunkKind,
) -> Result<std::result::Result<Vec<u8>, String>> {
    let stored = conn
        .query_row("SELECT kind, body FROM chunks WHERE hash = ?1", params![hash], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })
        .optional()
        .with_context(|| format!("failed to read chunk {hash}"))?;

    let Some((stored_kind, body)) = stored else {
        return Ok(Err("chunk is missing".to_string()));
    };
    if stored_kind != kind.as_str() {
        return Ok(Err(format!("expected {} chunk, found {stored_kind}", kind.as_str())));
    }
    let actual = chunk_hash(&body);
    if actual != hash {
        return Ok(Err(format!("content hashes to {actual}")));
    }
    Ok(Ok(body))
}

fn table_from_chunk(chunk: TableChunk) -> Result<Table> {
    let mut rows = BTreeMap::new();
    for (key, value) in &chunk.rows {
        rows.insert(Tuple::from_hex(key)?, Tuple::from_hex(value)?);
    }
    if rows.len() != chunk.rows.len() {
        return Err(anyhow!("table `{}` stores duplicate keys", chunk.name));
    }
    Table::from_rows(&chunk.name, chunk.schema, rows)
        .with_context(|| format!("stored rows of `{}` do not match its schema", chunk.name))
}

fn read_ref(conn: &Connection, name: &str) -> Result<Option<String>> {
    conn.query_row("SELECT root_hash FROM refs WHERE name = ?1", params![name], |row| {
        row.get::<_, String>(0)
    })
    .optional()
    .with_context(|| format!("failed to read ref {name}"))
}

fn chunk_hash(body: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(body)))
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tagstore_core::fragments::{
        get_fragment, FragmentType, FRAGMENT_TAG, ID_TAG, NAME_TAG, TYPE_TAG,
    };
    use tagstore_core::{Column, Inserter, Tag, TaggedValues, TypeKind, Value};

    fn memory_store() -> Result<SqliteStore> {
        SqliteStore::open(Path::new(":memory:"))
    }

    fn people() -> Result<Schema> {
        Ok(Schema::new(vec![
            Column::new("last", 1, TypeKind::String, true),
            Column::new("first", 0, TypeKind::String, true),
            Column::new("age", 5, TypeKind::Int, false),
        ])?)
    }

    fn legacy_root(version: SchemaVersion, rows: &[TaggedValues]) -> Result<VersionedRoot> {
        let layout = SchemasTableLayout::current();
        let schema = layout
            .schema_for(version)
            .ok_or_else(|| anyhow!("no layout for {version}"))?
            .clone();
        let root = VersionedRoot::empty().create_table(layout.table_name(), schema)?;
        let table = root
            .get_table(layout.table_name())
            .ok_or_else(|| anyhow!("fixture table missing"))?;
        let mut editor = table.editor();
        for row in rows {
            editor.insert(row)?;
        }
        Ok(root.put_table(editor.close()?))
    }

    fn fragment_row(name: &str, sql: &str, id: Option<i64>) -> TaggedValues {
        let mut row = TaggedValues::from([
            (TYPE_TAG, Value::from("view")),
            (NAME_TAG, Value::from(name)),
            (FRAGMENT_TAG, Value::from(sql)),
        ]);
        if let Some(id) = id {
            row.insert(ID_TAG, Value::Int(id));
        }
        row
    }

    fn chunk_count(store: &SqliteStore) -> Result<i64> {
        Ok(store.conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?)
    }

    // Test IDs: TSTORE-001
    #[test]
    fn empty_store_has_empty_working_root() -> Result<()> {
        let store = memory_store()?;
        assert!(store.working_root_hash()?.is_none());
        assert_eq!(store.working_root()?, VersionedRoot::empty());

        let status = store.schemas_status()?;
        assert!(!status.exists);
        assert!(status.migration_pending);
        Ok(())
    }

    // Test IDs: TSTORE-002
    #[test]
    fn commit_and_reload_round_trip() -> Result<()> {
        let mut store = memory_store()?;
        let schema = people()?;
        let root = store.update_working_root(|root| {
            let root = root.create_table("People", schema)?;
            let table = root.get_table("people").cloned().ok_or_else(|| {
                KernelError::TableNotFound("people".to_string())
            })?;
            let mut editor = table.editor();
            editor.insert(&TaggedValues::from([
                (Tag(1), Value::from("robertson")),
                (Tag(0), Value::from("robert")),
                (Tag(5), Value::Int(40)),
            ]))?;
            Ok(root.put_table(editor.close()?))
        })?;

        let reloaded = store.working_root()?;
        assert_eq!(reloaded, root);
        assert_eq!(reloaded.table_names(), vec!["People"]);

        let chunks = chunk_count(&store)?;
        let hash = store.working_root_hash()?;
        store.commit_working_root(&reloaded)?;
        assert_eq!(chunk_count(&store)?, chunks);
        assert_eq!(store.working_root_hash()?, hash);
        Ok(())
    }

    // Test IDs: TSTORE-003
    #[test]
    fn open_schemas_table_migrates_and_commits_once() -> Result<()> {
        let mut store = memory_store()?;
        store.commit_working_root(&legacy_root(
            SchemaVersion::V1,
            &[
                fragment_row("view1", "SELECT v1 FROM test;", None),
                fragment_row("view2", "SELECT v2 FROM test;", None),
            ],
        )?)?;
        assert_eq!(store.schemas_status()?.detected_version, Some(SchemaVersion::V1));

        let (table, report) = store.open_schemas_table()?;
        assert!(report.committed);
        assert_eq!(report.outcome.detected, Some(SchemaVersion::V1));
        assert_eq!(report.outcome.migrated_rows, 2);
        assert_eq!(store.working_root_hash()?, Some(report.root_hash.clone()));

        let fragment = get_fragment(&table, FragmentType::View, "view2")?
            .ok_or_else(|| anyhow!("view2 missing after migration"))?;
        assert_eq!(fragment.fragment, "SELECT v2 FROM test;");
        assert_eq!(fragment.created_at, OffsetDateTime::UNIX_EPOCH);

        let status = store.schemas_status()?;
        assert_eq!(status.detected_version, Some(SchemaVersion::V3Current));
        assert_eq!(status.columns, 6);
        assert!(!status.migration_pending);

        let (_, again) = store.open_schemas_table()?;
        assert!(!again.committed);
        assert_eq!(again.root_hash, report.root_hash);
        Ok(())
    }

    // Test IDs: TSTORE-004
    #[test]
    fn failed_migration_leaves_persisted_root_unchanged() -> Result<()> {
        let mut store = memory_store()?;
        store.commit_working_root(&legacy_root(
            SchemaVersion::V2,
            &[
                fragment_row("dup", "SELECT 1;", Some(1)),
                fragment_row("dup", "SELECT 2;", Some(2)),
            ],
        )?)?;
        let hash_before = store.working_root_hash()?;
        let chunks_before = chunk_count(&store)?;

        let err = match store.open_schemas_table() {
            Ok(_) => panic!("duplicate (type, name) must abort the migration"),
            Err(err) => err,
        };
        assert!(matches!(
            err.downcast_ref::<KernelError>(),
            Some(KernelError::Insert(msg)) if msg.contains("duplicate")
        ));
        assert_eq!(store.working_root_hash()?, hash_before);
        assert_eq!(chunk_count(&store)?, chunks_before);
        assert_eq!(store.schemas_status()?.detected_version, Some(SchemaVersion::V2));
        Ok(())
    }

    // Test IDs: TSTORE-005
    #[test]
    fn integrity_check_detects_tampered_chunk() -> Result<()> {
        let mut store = memory_store()?;
        store.open_schemas_table()?;

        let clean = store.integrity_check()?;
        assert!(clean.is_clean());
        assert_eq!(clean.verified_chunks, 2);

        store.conn.execute("UPDATE chunks SET body = ?1 WHERE kind = 'table'", params![b"{}".to_vec()])?;
        let report = store.integrity_check()?;
        assert!(!report.is_clean());
        assert_eq!(report.chunk_mismatches.len(), 1);
        assert!(report.chunk_mismatches[0].problem.contains("hashes to"));
        assert!(store.working_root().is_err());
        Ok(())
    }

    // Test IDs: TSTORE-006
    #[test]
    fn open_with_config_applies_journal_mode() -> Result<()> {
        let dir = std::env::temp_dir().join(format!(
            "tagstore-config-{}-{}",
            std::process::id(),
            OffsetDateTime::now_utc().unix_timestamp_nanos()
        ));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("store.sqlite3");

        let config = StoreConfig { busy_timeout_ms: 250, journal_mode: JournalMode::Delete };
        let store = SqliteStore::open_with_config(&path, &config)?;
        let mode: String = store.conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        let timeout: i64 = store.conn.query_row("PRAGMA busy_timeout", [], |row| row.get(0))?;
        assert_eq!(mode.to_ascii_lowercase(), "delete");
        assert_eq!(timeout, 250);

        drop(store);
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
