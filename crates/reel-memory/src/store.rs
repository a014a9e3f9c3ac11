//! The shared store and its connections.
//!
//! A [`MemoryStore`] owns one database shared by every connection opened on
//! it. Connections implement [`Executor`]. All operations execute
//! synchronously under the store mutex, so each statement is atomic.
//!
//! Writes become visible to other connections immediately. A transaction
//! keeps an undo log; `rollback` and `rollback_to` replay it newest first.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use reel_core::{
    Cx, Date, Dialect, Error, ExecResult, Executor, Outcome, QueryError, QueryErrorKind,
    Registry, Result, Row, SqlType, Statement, Value,
};

use crate::config::MemoryStoreConfig;
use crate::database::{Database, Undo, WriteOptions};
use crate::table::tables_from_registry;

struct Shared {
    db: Mutex<Database>,
    config: MemoryStoreConfig,
    statements: AtomicU64,
    connections: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An in-memory relational store built from the metadata registry.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Create tables for every registered entity, join table and element
    /// collection, with the default configuration.
    pub fn from_registry(registry: &Registry) -> Result<Self> {
        Self::with_config(registry, MemoryStoreConfig::default())
    }

    pub fn with_config(registry: &Registry, config: MemoryStoreConfig) -> Result<Self> {
        let (tables, sequences) = tables_from_registry(registry)?;
        let db = Database::new(tables, sequences)?;
        tracing::debug!(
            enforce_foreign_keys = config.enforce_foreign_keys,
            "Memory store created"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                db: Mutex::new(db),
                config,
                statements: AtomicU64::new(0),
                connections: AtomicU64::new(0),
            }),
        })
    }

    pub fn config(&self) -> &MemoryStoreConfig {
        &self.shared.config
    }

    /// Open a new connection.
    pub fn connect(&self) -> MemoryConnection {
        let id = self.shared.connections.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(connection = id, "Memory connection opened");
        MemoryConnection {
            shared: Arc::clone(&self.shared),
            tx: Mutex::new(None),
            id,
        }
    }

    /// Load fixture rows from a JSON document.
    ///
    /// The document maps table names to arrays of row objects keyed by
    /// column. Dates are written as `"YYYY-MM-DD"`. Foreign keys are checked
    /// once every row is in, so tables may appear in any order. Returns the
    /// number of rows loaded.
    pub fn seed_json(&self, json: &str) -> Result<usize> {
        let document: BTreeMap<String, Vec<serde_json::Map<String, serde_json::Value>>> =
            serde_json::from_str(json)?;
        let options = WriteOptions {
            enforce_foreign_keys: false,
            today: self.shared.config.today(),
        };

        let mut db = self.shared.lock();
        let mut staged = db.clone();
        let mut loaded = 0;
        for (table, records) in &document {
            let def = staged.table(table)?.def.clone();
            for record in records {
                let mut columns = Vec::with_capacity(record.len());
                let mut values = Vec::with_capacity(record.len());
                for (column, json) in record {
                    let index = def.column_index(column)?;
                    values.push(json_to_value(def.columns[index].sql_type, json, column)?);
                    columns.push(column.clone());
                }
                staged.insert(table, &columns, &values, options)?;
                loaded += 1;
            }
        }
        if self.shared.config.enforce_foreign_keys {
            staged.check_all_foreign_keys()?;
        }
        staged.sync_counters();
        *db = staged;
        tracing::info!(rows = loaded, tables = document.len(), "Fixtures loaded");
        Ok(loaded)
    }

    /// Every stored row of `table`, derived columns included.
    pub fn rows(&self, table: &str) -> Result<Vec<Row>> {
        self.shared.lock().dump(table)
    }

    pub fn row_count(&self, table: &str) -> Result<usize> {
        Ok(self.shared.lock().table(table)?.rows.len())
    }

    /// Number of statements executed by all connections so far.
    pub fn statement_count(&self) -> u64 {
        self.shared.statements.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

fn json_to_value(sql_type: SqlType, json: &serde_json::Value, column: &str) -> Result<Value> {
    let invalid = || {
        Error::Serde(format!(
            "column {column}: cannot read {json} as {}",
            sql_type.as_sql()
        ))
    };
    Ok(match (sql_type, json) {
        (_, serde_json::Value::Null) => Value::Null,
        (SqlType::Boolean, serde_json::Value::Bool(b)) => Value::Bool(*b),
        (SqlType::Integer, serde_json::Value::Number(n)) => n
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())
            .map(Value::Int)
            .ok_or_else(invalid)?,
        (SqlType::BigInt, serde_json::Value::Number(n)) => {
            n.as_i64().map(Value::BigInt).ok_or_else(invalid)?
        }
        (SqlType::Double, serde_json::Value::Number(n)) => {
            n.as_f64().map(Value::Double).ok_or_else(invalid)?
        }
        (SqlType::Text, serde_json::Value::String(s)) => Value::Text(s.clone()),
        (SqlType::Date, serde_json::Value::String(s)) => Value::Date(s.parse::<Date>()?),
        _ => return Err(invalid()),
    })
}

#[derive(Debug, Default)]
struct TxLog {
    undo: Vec<Undo>,
    savepoints: Vec<(String, usize)>,
}

/// A connection to a [`MemoryStore`].
///
/// Dropping a connection with an open transaction rolls it back.
pub struct MemoryConnection {
    shared: Arc<Shared>,
    tx: Mutex<Option<TxLog>>,
    id: u64,
}

fn transaction_error(message: impl Into<String>) -> Error {
    Error::Query(QueryError::new(QueryErrorKind::Transaction, message))
}

fn finish<T>(cx: &Cx, op: impl FnOnce() -> Result<T>) -> Outcome<T, Error> {
    if let Some(reason) = cx.cancel_reason() {
        return Outcome::Cancelled(reason);
    }
    op().map_or_else(Outcome::Err, Outcome::Ok)
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn in_transaction(&self) -> bool {
        self.tx_log().is_some()
    }

    fn tx_log(&self) -> MutexGuard<'_, Option<TxLog>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_options(&self) -> WriteOptions {
        WriteOptions {
            enforce_foreign_keys: self.shared.config.enforce_foreign_keys,
            today: self.shared.config.today(),
        }
    }

    /// Execute a write statement synchronously.
    pub fn execute_sync(&self, statement: &Statement, params: &[Value]) -> Result<ExecResult> {
        self.shared.statements.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            connection = self.id,
            sql = %statement.to_sql(Dialect::Postgres, params.len()).0,
            params = params.len(),
            "execute"
        );
        let options = self.write_options();
        let mut db = self.shared.lock();
        let (result, undo) = match statement {
            Statement::Insert {
                table,
                columns,
                returning,
            } => {
                let (identity, undo) = db.insert(table, columns, params, options)?;
                (
                    ExecResult {
                        rows_affected: 1,
                        generated_id: returning.as_ref().and(identity),
                    },
                    vec![undo],
                )
            }
            Statement::Update {
                table,
                columns,
                filter,
            } => {
                let (affected, undo) = db.update(table, columns, filter, params, options)?;
                (
                    ExecResult {
                        rows_affected: affected,
                        generated_id: None,
                    },
                    undo,
                )
            }
            Statement::Delete { table, filter } => {
                let (affected, undo) = db.delete(table, filter, params, options)?;
                (
                    ExecResult {
                        rows_affected: affected,
                        generated_id: None,
                    },
                    undo,
                )
            }
            Statement::Select(_) => {
                return Err(Error::Query(QueryError::new(
                    QueryErrorKind::Syntax,
                    "SELECT passed to execute; use query",
                )));
            }
        };
        if let Some(log) = self.tx_log().as_mut() {
            log.undo.extend(undo);
        }
        Ok(result)
    }

    /// Execute a SELECT synchronously.
    pub fn query_sync(&self, statement: &Statement, params: &[Value]) -> Result<Vec<Row>> {
        self.shared.statements.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            connection = self.id,
            sql = %statement.to_sql(Dialect::Postgres, params.len()).0,
            params = params.len(),
            "query"
        );
        let Statement::Select(select) = statement else {
            return Err(Error::Query(QueryError::new(
                QueryErrorKind::Syntax,
                "write statement passed to query; use execute",
            )));
        };
        self.shared
            .lock()
            .select(select, params, self.shared.config.today())
    }

    fn begin_sync(&self) -> Result<()> {
        let mut tx = self.tx_log();
        if tx.is_some() {
            return Err(transaction_error("a transaction is already open"));
        }
        *tx = Some(TxLog::default());
        tracing::debug!(connection = self.id, "BEGIN");
        Ok(())
    }

    fn commit_sync(&self) -> Result<()> {
        let log = self
            .tx_log()
            .take()
            .ok_or_else(|| transaction_error("no transaction to commit"))?;
        tracing::debug!(connection = self.id, changes = log.undo.len(), "COMMIT");
        Ok(())
    }

    fn rollback_sync(&self) -> Result<()> {
        let log = self
            .tx_log()
            .take()
            .ok_or_else(|| transaction_error("no transaction to roll back"))?;
        let reverted = log.undo.len();
        let mut db = self.shared.lock();
        for undo in log.undo.into_iter().rev() {
            db.apply_undo(undo);
        }
        tracing::debug!(connection = self.id, reverted, "ROLLBACK");
        Ok(())
    }

    fn savepoint_sync(&self, name: &str) -> Result<()> {
        let mut tx = self.tx_log();
        let log = tx
            .as_mut()
            .ok_or_else(|| transaction_error("SAVEPOINT outside a transaction"))?;
        let mark = log.undo.len();
        log.savepoints.push((name.to_string(), mark));
        Ok(())
    }

    fn rollback_to_sync(&self, name: &str) -> Result<()> {
        let mut db = self.shared.lock();
        let mut tx = self.tx_log();
        let log = tx
            .as_mut()
            .ok_or_else(|| transaction_error("ROLLBACK TO outside a transaction"))?;
        let position = log
            .savepoints
            .iter()
            .rposition(|(saved, _)| saved == name)
            .ok_or_else(|| transaction_error(format!("savepoint {name} does not exist")))?;
        let mark = log.savepoints[position].1;
        log.savepoints.truncate(position + 1);
        let reverted = log.undo.len() - mark;
        for undo in log.undo.drain(mark..).rev() {
            db.apply_undo(undo);
        }
        tracing::debug!(connection = self.id, savepoint = name, reverted, "ROLLBACK TO SAVEPOINT");
        Ok(())
    }

    fn release_sync(&self, name: &str) -> Result<()> {
        let mut tx = self.tx_log();
        let log = tx
            .as_mut()
            .ok_or_else(|| transaction_error("RELEASE outside a transaction"))?;
        let position = log
            .savepoints
            .iter()
            .rposition(|(saved, _)| saved == name)
            .ok_or_else(|| transaction_error(format!("savepoint {name} does not exist")))?;
        log.savepoints.truncate(position);
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if self.in_transaction() {
            tracing::warn!(connection = self.id, "Connection dropped inside a transaction; rolling back");
            let _ = self.rollback_sync();
        }
    }
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .field("in_transaction", &self.in_transaction())
            .finish_non_exhaustive()
    }
}

// ── Executor trait impl ───────────────────────────────────────────────────

impl Executor for MemoryConnection {
    fn execute(
        &self,
        cx: &Cx,
        statement: &Statement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<ExecResult, Error>> + Send {
        let outcome = finish(cx, || self.execute_sync(statement, params));
        async move { outcome }
    }

    fn query(
        &self,
        cx: &Cx,
        statement: &Statement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let outcome = finish(cx, || self.query_sync(statement, params));
        async move { outcome }
    }

    fn next_sequence_value(
        &self,
        cx: &Cx,
        sequence: &str,
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        let outcome = finish(cx, || self.shared.lock().next_sequence_value(sequence));
        async move { outcome }
    }

    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let outcome = finish(cx, || self.begin_sync());
        async move { outcome }
    }

    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let outcome = finish(cx, || self.commit_sync());
        async move { outcome }
    }

    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        // Rolling back must proceed even under cancellation.
        let outcome = self.rollback_sync().map_or_else(Outcome::Err, Outcome::Ok);
        async move { outcome }
    }

    fn savepoint(
        &self,
        cx: &Cx,
        name: &str,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let outcome = finish(cx, || self.savepoint_sync(name));
        async move { outcome }
    }

    fn rollback_to(
        &self,
        _cx: &Cx,
        name: &str,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let outcome = self.rollback_to_sync(name).map_or_else(Outcome::Err, Outcome::Ok);
        async move { outcome }
    }

    fn release(
        &self,
        cx: &Cx,
        name: &str,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let outcome = finish(cx, || self.release_sync(name));
        async move { outcome }
    }
}
