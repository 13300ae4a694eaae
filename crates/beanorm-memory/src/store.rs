//! `MemoryStore` and its transactions.

use crate::sql::{self, Command, Projection};
use beanorm_core::{
    Cx, Error, Outcome, QueryErrorKind, Result, Row, Statement, Store, StoreFuture,
    StoreTransaction, TransactionError, TransactionErrorKind, Value,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

const IDENTITY_COLUMN: &str = "id";
const DELAY_SLICE: Duration = Duration::from_millis(2);

#[derive(Debug)]
struct StoredRow {
    rowid: u64,
    values: Vec<Value>,
}

#[derive(Debug)]
struct Table {
    columns: Vec<String>,
    rows: Vec<StoredRow>,
    next_rowid: u64,
    next_identity: i64,
}

impl Table {
    fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            next_rowid: 1,
            next_identity: 1,
        }
    }

    fn index_of(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    fn ensure_column(&mut self, column: &str) -> usize {
        if let Some(index) = self.index_of(column) {
            return index;
        }
        self.columns.push(column.to_string());
        for row in &mut self.rows {
            row.values.push(Value::Null);
        }
        self.columns.len() - 1
    }

    fn observe_identity(&mut self, value: &Value) {
        if let Some(n) = value.as_i64() {
            self.next_identity = self.next_identity.max(n + 1);
        }
    }

    fn push(&mut self, values: Vec<Value>) -> u64 {
        let rowid = self.next_rowid;
        self.next_rowid += 1;
        self.rows.push(StoredRow { rowid, values });
        rowid
    }

    fn position(&self, rowid: u64) -> Option<usize> {
        self.rows.iter().position(|r| r.rowid == rowid)
    }

    fn reader<'r>(&'r self, row: &'r StoredRow) -> impl Fn(&str) -> Value + 'r {
        move |name: &str| {
            self.index_of(name)
                .and_then(|i| row.values.get(i).cloned())
                .unwrap_or(Value::Null)
        }
    }
}

#[derive(Debug)]
enum Undo {
    Inserted { table: String, rowid: u64 },
    Updated { table: String, rowid: u64, old: Vec<Value> },
    Deleted { table: String, row: StoredRow, position: usize },
}

#[derive(Debug, Default)]
struct Inner {
    tables: Mutex<HashMap<String, Table>>,
    log: Mutex<Vec<Statement>>,
    cancel_hints: Mutex<Vec<u64>>,
    cancelled: Mutex<HashSet<u64>>,
    query_delay: Mutex<Option<Duration>>,
    fail_next: Mutex<Option<String>>,
    next_tx: AtomicU64,
    begins: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// An in-process relational store.
///
/// Tables are created by [`MemoryStore::seed`] or by the first INSERT into
/// them. A column named `id` is the identity column: inserts that omit it get
/// the next integer. Cloning shares the underlying data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rows into `table`, creating it with `columns` when absent.
    pub fn seed(&self, table: &str, columns: &[&str], rows: Vec<Vec<Value>>) {
        let mut tables = locked(&self.inner.tables);
        let entry = tables
            .entry(table.to_string())
            .or_insert_with(|| Table::new(columns.iter().map(|c| (*c).to_string()).collect()));
        let positions: Vec<usize> = columns.iter().map(|c| entry.ensure_column(c)).collect();
        let id_position = entry.index_of(IDENTITY_COLUMN);
        for row in rows {
            let mut values = vec![Value::Null; entry.columns.len()];
            for (value, &position) in row.into_iter().zip(&positions) {
                values[position] = value;
            }
            if let Some(id) = id_position.map(|i| values[i].clone()) {
                entry.observe_identity(&id);
            }
            entry.push(values);
        }
        tracing::debug!(table, rows = entry.rows.len(), "Seeded table");
    }

    /// Overwrite one column of the row whose `key_column` equals `key`.
    ///
    /// Returns false when no such row exists.
    pub fn set_value(&self, table: &str, key_column: &str, key: &Value, column: &str, value: Value) -> bool {
        let mut tables = locked(&self.inner.tables);
        let Some(table) = tables.get_mut(table) else {
            return false;
        };
        let (Some(key_index), target) = (table.index_of(key_column), table.ensure_column(column)) else {
            return false;
        };
        match table.rows.iter_mut().find(|r| r.values[key_index].key_eq(key)) {
            Some(row) => {
                row.values[target] = value;
                true
            }
            None => false,
        }
    }

    /// Read one column of the row whose `key_column` equals `key`.
    pub fn value(&self, table: &str, key_column: &str, key: &Value, column: &str) -> Option<Value> {
        let tables = locked(&self.inner.tables);
        let table = tables.get(table)?;
        let key_index = table.index_of(key_column)?;
        let target = table.index_of(column)?;
        table
            .rows
            .iter()
            .find(|r| r.values[key_index].key_eq(key))
            .map(|r| r.values[target].clone())
    }

    pub fn row_count(&self, table: &str) -> usize {
        locked(&self.inner.tables).get(table).map_or(0, |t| t.rows.len())
    }

    /// SQL of every statement run since the last [`clear_log`](Self::clear_log).
    pub fn statements(&self) -> Vec<String> {
        locked(&self.inner.log).iter().map(|s| s.sql().to_string()).collect()
    }

    /// Logged statements with their binds.
    pub fn logged(&self) -> Vec<Statement> {
        locked(&self.inner.log).clone()
    }

    pub fn statement_count(&self) -> usize {
        locked(&self.inner.log).len()
    }

    /// Number of logged statements whose SQL starts with `prefix`.
    pub fn count_matching(&self, prefix: &str) -> usize {
        locked(&self.inner.log)
            .iter()
            .filter(|s| s.sql().starts_with(prefix))
            .count()
    }

    pub fn clear_log(&self) {
        locked(&self.inner.log).clear();
    }

    pub fn begin_count(&self) -> u64 {
        self.inner.begins.load(Ordering::Relaxed)
    }

    pub fn commit_count(&self) -> u64 {
        self.inner.commits.load(Ordering::Relaxed)
    }

    pub fn rollback_count(&self) -> u64 {
        self.inner.rollbacks.load(Ordering::Relaxed)
    }

    /// Transaction ids passed to [`Store::cancel_hint`], in order.
    pub fn cancel_hints(&self) -> Vec<u64> {
        locked(&self.inner.cancel_hints).clone()
    }

    /// Make every query wait this long before it reads. Cancel hints end the wait early.
    pub fn set_query_delay(&self, delay: Option<Duration>) {
        *locked(&self.inner.query_delay) = delay;
    }

    /// Fail the next statement with a database error carrying `message`.
    pub fn fail_next(&self, message: impl Into<String>) {
        *locked(&self.inner.fail_next) = Some(message.into());
    }
}

impl Store for MemoryStore {
    fn begin<'a>(&'a self, cx: &'a Cx, read_only: bool) -> StoreFuture<'a, Box<dyn StoreTransaction>> {
        let outcome = match cx.cancel_reason() {
            Some(reason) => Outcome::Cancelled(reason),
            None => {
                let id = self.inner.next_tx.fetch_add(1, Ordering::Relaxed) + 1;
                self.inner.begins.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(tx = id, read_only, "Begin");
                let tx: Box<dyn StoreTransaction> = Box::new(MemoryTransaction {
                    id,
                    read_only,
                    inner: Arc::clone(&self.inner),
                    undo: Mutex::new(Vec::new()),
                    finished: AtomicBool::new(false),
                });
                Outcome::Ok(tx)
            }
        };
        Box::pin(async move { outcome })
    }

    fn cancel_hint(&self, tx_id: u64) {
        tracing::debug!(tx = tx_id, "Cancel hint");
        locked(&self.inner.cancel_hints).push(tx_id);
        locked(&self.inner.cancelled).insert(tx_id);
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// A transaction over a [`MemoryStore`].
///
/// Writes apply immediately and are undone on rollback, or on drop without commit.
#[derive(Debug)]
pub struct MemoryTransaction {
    id: u64,
    read_only: bool,
    inner: Arc<Inner>,
    undo: Mutex<Vec<Undo>>,
    finished: AtomicBool,
}

impl MemoryTransaction {
    fn is_cancelled(&self) -> bool {
        locked(&self.inner.cancelled).contains(&self.id)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.finished.load(Ordering::Acquire) {
            return Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::AlreadyCommitted,
                message: format!("store transaction {} already finished", self.id),
            }));
        }
        Ok(())
    }

    /// Log, honour injected failures and cancel hints, then parse.
    fn prepare(&self, cx: &Cx, statement: &Statement) -> Outcome<Command, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }
        locked(&self.inner.log).push(statement.clone());
        if let Some(message) = locked(&self.inner.fail_next).take() {
            return Outcome::Err(Error::store(QueryErrorKind::Database, statement.sql(), message));
        }
        let command = match sql::parse(statement.sql()) {
            Ok(command) => command,
            Err(e) => return Outcome::Err(e),
        };
        if command.is_select() {
            let delay = *locked(&self.inner.query_delay);
            if let Some(delay) = delay {
                let started = Instant::now();
                while started.elapsed() < delay && !self.is_cancelled() && !cx.is_cancel_requested() {
                    std::thread::sleep(DELAY_SLICE);
                }
            }
        }
        if let Some(reason) = cx.cancel_reason() {
            tracing::debug!(tx = self.id, sql = statement.sql(), "Statement cancelled by context");
            return Outcome::Cancelled(reason);
        }
        if self.is_cancelled() {
            tracing::debug!(tx = self.id, sql = statement.sql(), "Statement cancelled");
            return Outcome::Err(Error::store(
                QueryErrorKind::Cancelled,
                statement.sql(),
                "statement cancelled by request",
            ));
        }
        if self.read_only && !command.is_select() {
            return Outcome::Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::ReadOnly,
                message: format!("DML in read-only store transaction {}", self.id),
            }));
        }
        Outcome::Ok(command)
    }

    fn select(&self, command: &Command, binds: &[Value]) -> Result<Vec<Row>> {
        let Command::Select {
            table,
            projection,
            filter,
            order,
            limit,
            offset,
        } = command
        else {
            return Err(Error::Custom("not a SELECT".to_string()));
        };
        let tables = locked(&self.inner.tables);
        let Some(table) = tables.get(table) else {
            return Ok(match projection {
                Projection::Count => vec![count_row(0)],
                Projection::Columns(_) => Vec::new(),
            });
        };

        let mut matched = Vec::new();
        for row in &table.rows {
            if sql::eval(filter, &table.reader(row), binds)? {
                matched.push(row);
            }
        }
        if let Projection::Count = projection {
            return Ok(vec![count_row(matched.len())]);
        }
        if !order.is_empty() {
            matched.sort_by(|a, b| {
                let (ra, rb) = (table.reader(a), table.reader(b));
                order
                    .iter()
                    .map(|term| {
                        let ordering = sql::order_values(&ra(&term.column), &rb(&term.column));
                        if term.descending { ordering.reverse() } else { ordering }
                    })
                    .find(|o| o.is_ne())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        let Projection::Columns(columns) = projection else {
            return Ok(Vec::new());
        };
        let names = columns.clone();
        Ok(matched
            .into_iter()
            .skip(offset.unwrap_or(0))
            .take(limit.unwrap_or(usize::MAX))
            .map(|row| {
                let read = table.reader(row);
                Row::new(names.clone(), columns.iter().map(|c| read(c)).collect())
            })
            .collect())
    }

    fn write(&self, command: Command, binds: &[Value]) -> Result<(u64, Option<Value>)> {
        let mut tables = locked(&self.inner.tables);
        let mut undo = locked(&self.undo);
        match command {
            Command::Insert {
                table: name,
                columns,
                binds: positions,
            } => {
                let table = tables.entry(name.clone()).or_insert_with(|| {
                    let mut columns = columns.clone();
                    if !columns.iter().any(|c| c == IDENTITY_COLUMN) {
                        columns.insert(0, IDENTITY_COLUMN.to_string());
                    }
                    Table::new(columns)
                });
                let targets: Vec<usize> = columns.iter().map(|c| table.ensure_column(c)).collect();
                let mut values = vec![Value::Null; table.columns.len()];
                for (&target, &position) in targets.iter().zip(&positions) {
                    values[target] = bind_value(binds, position)?.clone();
                }
                let mut generated = None;
                if let Some(id_index) = table.index_of(IDENTITY_COLUMN) {
                    if columns.iter().any(|c| c == IDENTITY_COLUMN) {
                        let id = values[id_index].clone();
                        table.observe_identity(&id);
                    } else {
                        let id = Value::BigInt(table.next_identity);
                        table.next_identity += 1;
                        values[id_index] = id.clone();
                        generated = Some(id);
                    }
                }
                let rowid = table.push(values);
                undo.push(Undo::Inserted { table: name, rowid });
                Ok((1, generated))
            }
            Command::Update {
                table: name,
                sets,
                filter,
            } => {
                let Some(table) = tables.get_mut(&name) else {
                    return Ok((0, None));
                };
                let targets: Vec<(usize, usize)> = sets
                    .iter()
                    .map(|(column, position)| (table.ensure_column(column), *position))
                    .collect();
                let mut hits = Vec::new();
                for row in &table.rows {
                    if sql::eval(&filter, &table.reader(row), binds)? {
                        hits.push(row.rowid);
                    }
                }
                for &rowid in &hits {
                    let Some(position) = table.position(rowid) else {
                        continue;
                    };
                    let row = &mut table.rows[position];
                    undo.push(Undo::Updated {
                        table: name.clone(),
                        rowid,
                        old: row.values.clone(),
                    });
                    for &(target, bind) in &targets {
                        row.values[target] = bind_value(binds, bind)?.clone();
                    }
                }
                Ok((hits.len() as u64, None))
            }
            Command::Delete { table: name, filter } => {
                let Some(table) = tables.get_mut(&name) else {
                    return Ok((0, None));
                };
                let mut hits = Vec::new();
                for row in &table.rows {
                    if sql::eval(&filter, &table.reader(row), binds)? {
                        hits.push(row.rowid);
                    }
                }
                for &rowid in &hits {
                    if let Some(position) = table.position(rowid) {
                        let row = table.rows.remove(position);
                        undo.push(Undo::Deleted {
                            table: name.clone(),
                            row,
                            position,
                        });
                    }
                }
                Ok((hits.len() as u64, None))
            }
            Command::Select { .. } => Err(Error::Custom("SELECT passed to execute".to_string())),
        }
    }

    fn run_write(&self, cx: &Cx, statement: &Statement) -> Outcome<(u64, Option<Value>), Error> {
        let command = match self.prepare(cx, statement) {
            Outcome::Ok(command) => command,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match self.write(command, &statement.binds) {
            Ok(result) => {
                tracing::trace!(tx = self.id, sql = statement.sql(), affected = result.0, "Executed");
                Outcome::Ok(result)
            }
            Err(e) => Outcome::Err(with_sql(e, statement.sql())),
        }
    }

    fn undo_all(&self) {
        let entries = std::mem::take(&mut *locked(&self.undo));
        if entries.is_empty() {
            return;
        }
        let mut tables = locked(&self.inner.tables);
        for entry in entries.into_iter().rev() {
            match entry {
                Undo::Inserted { table, rowid } => {
                    if let Some(table) = tables.get_mut(&table) {
                        table.rows.retain(|r| r.rowid != rowid);
                    }
                }
                Undo::Updated { table, rowid, old } => {
                    if let Some(table) = tables.get_mut(&table) {
                        if let Some(position) = table.position(rowid) {
                            table.rows[position].values = old;
                        }
                    }
                }
                Undo::Deleted { table, row, position } => {
                    if let Some(table) = tables.get_mut(&table) {
                        let at = position.min(table.rows.len());
                        table.rows.insert(at, row);
                    }
                }
            }
        }
    }

    fn finish(&self, commit: bool) -> Result<()> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return Err(Error::Transaction(TransactionError {
                kind: if commit {
                    TransactionErrorKind::AlreadyCommitted
                } else {
                    TransactionErrorKind::AlreadyRolledBack
                },
                message: format!("store transaction {} already finished", self.id),
            }));
        }
        if commit {
            locked(&self.undo).clear();
            self.inner.commits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.undo_all();
            self.inner.rollbacks.fetch_add(1, Ordering::Relaxed);
        }
        locked(&self.inner.cancelled).remove(&self.id);
        tracing::trace!(tx = self.id, commit, "Finished");
        Ok(())
    }
}

fn bind_value(binds: &[Value], position: usize) -> Result<&Value> {
    binds
        .get(position)
        .ok_or_else(|| Error::Custom(format!("missing bind ${}", position + 1)))
}

fn with_sql(error: Error, sql: &str) -> Error {
    match error {
        Error::Custom(message) => Error::store(QueryErrorKind::Database, sql, message),
        other => other,
    }
}

fn count_row(count: usize) -> Row {
    Row::new(vec!["count".to_string()], vec![Value::BigInt(count as i64)])
}

impl StoreTransaction for MemoryTransaction {
    fn id(&self) -> u64 {
        self.id
    }

    fn query<'a>(&'a self, cx: &'a Cx, statement: &'a Statement) -> StoreFuture<'a, Vec<Row>> {
        let outcome = match self.prepare(cx, statement) {
            Outcome::Ok(command) if command.is_select() => self
                .select(&command, &statement.binds)
                .map_err(|e| with_sql(e, statement.sql()))
                .map_or_else(Outcome::Err, Outcome::Ok),
            Outcome::Ok(_) => Outcome::Err(Error::store(
                QueryErrorKind::Syntax,
                statement.sql(),
                "query expects a SELECT",
            )),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        };
        Box::pin(async move { outcome })
    }

    fn execute<'a>(&'a self, cx: &'a Cx, statement: &'a Statement) -> StoreFuture<'a, u64> {
        let outcome = match self.run_write(cx, statement) {
            Outcome::Ok((affected, _)) => Outcome::Ok(affected),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        };
        Box::pin(async move { outcome })
    }

    fn insert<'a>(&'a self, cx: &'a Cx, statement: &'a Statement) -> StoreFuture<'a, Option<Value>> {
        let outcome = match self.run_write(cx, statement) {
            Outcome::Ok((_, generated)) => Outcome::Ok(generated),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        };
        Box::pin(async move { outcome })
    }

    fn commit<'a>(&'a self, _cx: &'a Cx) -> StoreFuture<'a, ()> {
        let result = self.finish(true);
        Box::pin(async move { result.map_or_else(Outcome::Err, Outcome::Ok) })
    }

    fn rollback<'a>(&'a self, _cx: &'a Cx) -> StoreFuture<'a, ()> {
        let result = self.finish(false);
        Box::pin(async move { result.map_or_else(Outcome::Err, Outcome::Ok) })
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished.load(Ordering::Acquire) {
            tracing::debug!(tx = self.id, "Transaction dropped without commit, rolling back");
            let _ = self.finish(false);
        }
    }
}
