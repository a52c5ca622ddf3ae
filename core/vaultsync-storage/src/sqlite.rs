//! SQLite system of record with a commit-hook change feed.
//!
//! Entity tables use `id INTEGER PRIMARY KEY`, so the rowid reported by
//! SQLite's update hook is the entity id. Row changes are buffered while a
//! transaction is open and published only when it commits; a rollback
//! discards them. Subscribers therefore never see uncommitted writes.

use crate::error::{StorageError, StorageResult};
use crate::relation::RelationMap;
use crate::store::{find_with_relations, scalar_filter, RecordStore, RowSource};
use async_trait::async_trait;
use rusqlite::hooks::Action;
use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ToSql};
use serde_json::{Number, Value};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;
use vaultsync_types::{EntityId, Record};

/// Kind of row change reported by the update hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowAction {
    Insert,
    Update,
    Delete,
}

/// A row change whose transaction has committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedRow {
    pub action: RowAction,
    pub table: String,
    pub rowid: i64,
}

/// Receiving end of a commit subscription.
pub type CommitFeed = mpsc::UnboundedReceiver<CommittedRow>;

#[derive(Default)]
struct HookState {
    pending: Vec<CommittedRow>,
    subscribers: Vec<mpsc::UnboundedSender<CommittedRow>>,
}

/// Record store backed by a single SQLite connection.
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
    hooks: Arc<Mutex<HookState>>,
    relations: Arc<RelationMap>,
}

impl SqliteRecordStore {
    /// Opens (or creates) a database file.
    pub fn open(path: impl AsRef<Path>, relations: RelationMap) -> StorageResult<Self> {
        Self::with_connection(Connection::open(path)?, relations)
    }

    /// Opens an in-memory database (for testing).
    pub fn open_in_memory(relations: RelationMap) -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, relations)
    }

    fn with_connection(conn: Connection, relations: RelationMap) -> StorageResult<Self> {
        let hooks: Arc<Mutex<HookState>> = Arc::default();

        let on_change = Arc::clone(&hooks);
        conn.update_hook(Some(move |action: Action, _db: &str, table: &str, rowid: i64| {
            let action = match action {
                Action::SQLITE_INSERT => RowAction::Insert,
                Action::SQLITE_UPDATE => RowAction::Update,
                Action::SQLITE_DELETE => RowAction::Delete,
                _ => return,
            };
            lock(&on_change).pending.push(CommittedRow {
                action,
                table: table.to_string(),
                rowid,
            });
        }));

        let on_commit = Arc::clone(&hooks);
        conn.commit_hook(Some(move || {
            let mut state = lock(&on_commit);
            let rows = std::mem::take(&mut state.pending);
            state
                .subscribers
                .retain(|tx| rows.iter().all(|row| tx.send(row.clone()).is_ok()));
            // false lets the commit proceed
            false
        }));

        let on_rollback = Arc::clone(&hooks);
        conn.rollback_hook(Some(move || {
            let mut state = lock(&on_rollback);
            if !state.pending.is_empty() {
                debug!(discarded = state.pending.len(), "transaction rolled back");
            }
            state.pending.clear();
        }));

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            hooks,
            relations: Arc::new(relations),
        })
    }

    /// Subscribes to committed row changes. Each call returns an independent
    /// feed; dropped feeds are pruned on the next commit.
    pub fn subscribe_commits(&self) -> CommitFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.hooks).subscribers.push(tx);
        rx
    }

    /// Number of live commit subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut state = lock(&self.hooks);
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }

    /// Runs a write (or any statement) on the underlying connection.
    pub fn write<T>(&self, f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>) -> StorageResult<T> {
        let mut conn = lock(&self.conn);
        Ok(f(&mut conn)?)
    }

    /// Executes a batch of SQL statements (schema setup, fixtures).
    pub fn execute_batch(&self, sql: &str) -> StorageResult<()> {
        self.write(|conn| conn.execute_batch(sql))
    }

    async fn blocking<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteReader<'_>) -> StorageResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let relations = Arc::clone(&self.relations);
        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn);
            let reader = SqliteReader { conn: &conn, relations: &relations };
            f(&reader)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn find_one(
        &self,
        table: &str,
        id: &EntityId,
        relations: &[String],
    ) -> StorageResult<Option<Record>> {
        let table = table.to_string();
        let id = id.to_string();
        let paths = relations.to_vec();
        self.blocking(move |reader| {
            find_with_relations(reader, reader.relations, &table, &id, &paths)
        })
        .await
    }

    async fn find_matching(&self, table: &str, fields: &Record) -> StorageResult<Option<Record>> {
        let table = table.to_string();
        let filter = scalar_filter(fields);
        self.blocking(move |reader| reader.first_matching(&table, &filter))
            .await
    }

    /// The commit feed reports rowids; they address junction rows too.
    async fn find_row(&self, table: &str, key: &EntityId) -> StorageResult<Option<Record>> {
        let Ok(rowid) = key.as_str().parse::<i64>() else {
            return Ok(None);
        };
        let table = table.to_string();
        self.blocking(move |reader| reader.row_by_rowid(&table, rowid))
            .await
    }
}

/// Borrowed connection used inside a blocking read.
struct SqliteReader<'a> {
    conn: &'a Connection,
    relations: &'a RelationMap,
}

impl SqliteReader<'_> {
    fn query(&self, sql: &str, params: &[JsonParam<'_>]) -> StorageResult<Vec<Record>> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Record::new();
            for (i, name) in columns.iter().enumerate() {
                if let Some(value) = json_from_sql(row.get_ref(i)?) {
                    record.insert(name.clone(), value);
                }
            }
            out.push(record);
        }
        Ok(out)
    }

    fn row_by_rowid(&self, table: &str, rowid: i64) -> StorageResult<Option<Record>> {
        let sql = format!("SELECT * FROM {} WHERE rowid = ?1", ident(table)?);
        let rowid = Value::from(rowid);
        Ok(self.query(&sql, &[JsonParam(&rowid)])?.into_iter().next())
    }
}

impl RowSource for SqliteReader<'_> {
    fn row_by_id(&self, table: &str, id: &str) -> StorageResult<Option<Record>> {
        let sql = format!("SELECT * FROM {} WHERE id = ?1 LIMIT 1", ident(table)?);
        let id = Value::String(id.to_string());
        Ok(self.query(&sql, &[JsonParam(&id)])?.into_iter().next())
    }

    fn rows_where(&self, table: &str, column: &str, value: &str) -> StorageResult<Vec<Record>> {
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ?1 ORDER BY rowid",
            ident(table)?,
            ident(column)?
        );
        let value = Value::String(value.to_string());
        self.query(&sql, &[JsonParam(&value)])
    }

    fn first_matching(&self, table: &str, fields: &[(String, Value)]) -> StorageResult<Option<Record>> {
        if fields.is_empty() {
            return Ok(None);
        }
        let mut clauses = Vec::with_capacity(fields.len());
        for (i, (column, _)) in fields.iter().enumerate() {
            clauses.push(format!("{} = ?{}", ident(column)?, i + 1));
        }
        let sql = format!(
            "SELECT * FROM {} WHERE {} ORDER BY rowid LIMIT 1",
            ident(table)?,
            clauses.join(" AND ")
        );
        let params: Vec<JsonParam<'_>> = fields.iter().map(|(_, v)| JsonParam(v)).collect();
        Ok(self.query(&sql, &params)?.into_iter().next())
    }
}

/// Binds a JSON scalar as an SQLite value.
struct JsonParam<'a>(&'a Value);

impl ToSql for JsonParam<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let value = match self.0 {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Integer(i),
                None => SqlValue::Real(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        };
        Ok(ToSqlOutput::Owned(value))
    }
}

fn json_from_sql(value: ValueRef<'_>) -> Option<Value> {
    match value {
        ValueRef::Null => Some(Value::Null),
        ValueRef::Integer(i) => Some(Value::Number(i.into())),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number),
        ValueRef::Text(t) => Some(Value::String(String::from_utf8_lossy(t).into_owned())),
        ValueRef::Blob(_) => None,
    }
}

/// Quotes a table or column name after checking it is a plain identifier.
fn ident(name: &str) -> StorageResult<String> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(format!("\"{name}\""))
    } else {
        Err(StorageError::InvalidIdentifier(name.to_string()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
