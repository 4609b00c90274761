//! In-process store used for dry runs and tests.
//!
//! Mirrors the Postgres behavior the pipeline depends on: id sequences that
//! `truncate_table` resets, foreign keys checked on insert and cascaded on delete,
//! and all-or-nothing transactions. A transaction keeps a log of its deletes; reads
//! inside it see the live tables with that log applied, and commit replays the log
//! against whatever the tables hold at that moment, so writes made by other tasks
//! in the meantime survive.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    check_column, check_table, row_id, DynRow, DynValue, Store, StoreResult, StoreRole, StoreTx,
    FOREIGN_KEYS, TABLES,
};
use crate::error::StoreError;

/// Operation an injected failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOp {
    Read,
    Insert,
    Delete,
    Truncate,
    Commit,
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    op: FailOp,
    table: Option<String>,
    // matching calls still allowed to succeed before this one fires
    skip: usize,
}

#[derive(Debug, Clone, Default)]
struct Table {
    rows: BTreeMap<i64, DynRow>,
    // last value handed out by the id sequence
    sequence: i64,
}

type Tables = HashMap<&'static str, Table>;

#[derive(Debug, Default)]
struct State {
    tables: Tables,
    failures: Vec<InjectedFailure>,
}

#[derive(Clone)]
pub struct MemoryStore {
    role: StoreRole,
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new(role: StoreRole) -> Self {
        let tables = TABLES.iter().map(|t| (*t, Table::default())).collect();
        Self {
            role,
            state: Arc::new(Mutex::new(State {
                tables,
                failures: Vec::new(),
            })),
        }
    }

    /// Make the next matching call fail. `table: None` matches every table.
    pub fn fail_on(&self, op: FailOp, table: Option<&str>) {
        self.fail_after(op, table, 0);
    }

    /// Let `skip` matching calls succeed, then fail the next one.
    pub fn fail_after(&self, op: FailOp, table: Option<&str>, skip: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.failures.push(InjectedFailure {
                op,
                table: table.map(str::to_string),
                skip,
            });
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.failures.clear();
        }
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Other("memory store lock poisoned".into()))
    }
}

impl State {
    fn trip(&mut self, op: FailOp, table: &str) -> StoreResult<()> {
        trip(&mut self.failures, op, table)
    }
}

fn trip(failures: &mut Vec<InjectedFailure>, op: FailOp, table: &str) -> StoreResult<()> {
    let hit = failures
        .iter()
        .position(|f| f.op == op && f.table.as_deref().map_or(true, |t| t == table));
    let Some(idx) = hit else {
        return Ok(());
    };
    if failures[idx].skip > 0 {
        failures[idx].skip -= 1;
        return Ok(());
    }
    failures.remove(idx);
    Err(StoreError::Injected(format!("{op:?} on {table}")))
}

fn table_mut<'a>(tables: &'a mut Tables, table: &str) -> StoreResult<&'a mut Table> {
    tables
        .get_mut(table)
        .ok_or_else(|| StoreError::UnknownTable(table.to_string()))
}

fn table_ref<'a>(tables: &'a Tables, table: &str) -> StoreResult<&'a Table> {
    tables
        .get(table)
        .ok_or_else(|| StoreError::UnknownTable(table.to_string()))
}

fn check_foreign_keys(tables: &Tables, table: &str, row: &DynRow) -> StoreResult<()> {
    for (child, column, parent) in FOREIGN_KEYS {
        if child != table {
            continue;
        }
        let Some(value) = row.get(column).filter(|v| !v.is_null()) else {
            continue;
        };
        let present = value
            .as_i64()
            .map(|id| table_ref(tables, parent).map(|p| p.rows.contains_key(&id)))
            .transpose()?
            .unwrap_or(false);
        if !present {
            return Err(StoreError::Other(format!(
                "insert into {table} violates foreign key {column} -> {parent}({value})"
            )));
        }
    }
    Ok(())
}

/// Put `row` into `table`, assigning an id from the sequence when it has none.
fn put_row(tables: &mut Tables, table: &str, row: &DynRow, overwrite: bool) -> StoreResult<i64> {
    check_foreign_keys(tables, table, row)?;
    let target = table_mut(tables, table)?;
    let mut row = row.clone();
    let id = match row_id(&row) {
        Some(id) => {
            if !overwrite && target.rows.contains_key(&id) {
                return Err(StoreError::Other(format!(
                    "duplicate key value violates unique constraint {table}_pkey (id={id})"
                )));
            }
            id
        }
        None => {
            target.sequence += 1;
            row.shift_insert(0, "id".to_string(), DynValue::Int(target.sequence));
            target.sequence
        }
    };
    target.rows.insert(id, row);
    Ok(id)
}

/// Delete rows of `table` by id and everything referencing them.
fn delete_cascade(tables: &mut Tables, table: &str, ids: &[i64]) -> StoreResult<u64> {
    let target = table_mut(tables, table)?;
    let removed: Vec<i64> = ids
        .iter()
        .filter(|id| target.rows.remove(*id).is_some())
        .copied()
        .collect();
    if removed.is_empty() {
        return Ok(0);
    }
    for (child, column, parent) in FOREIGN_KEYS {
        if parent != table {
            continue;
        }
        let dependents: Vec<i64> = table_ref(tables, child)?
            .rows
            .iter()
            .filter(|(_, row)| {
                row.get(column)
                    .and_then(DynValue::as_i64)
                    .is_some_and(|v| removed.contains(&v))
            })
            .map(|(id, _)| *id)
            .collect();
        delete_cascade(tables, child, &dependents)?;
    }
    Ok(removed.len() as u64)
}

fn select_ids(tables: &Tables, table: &str, column: &str, value: &DynValue) -> StoreResult<Vec<i64>> {
    Ok(table_ref(tables, table)?
        .rows
        .iter()
        .filter(|(_, row)| row.get(column).is_some_and(|v| v.matches(value)))
        .map(|(id, _)| *id)
        .collect())
}

fn truncate_cascade(tables: &mut Tables, table: &str) -> StoreResult<()> {
    let target = table_mut(tables, table)?;
    target.rows.clear();
    target.sequence = 0;
    for (child, _, parent) in FOREIGN_KEYS {
        if parent == table {
            truncate_cascade(tables, child)?;
        }
    }
    Ok(())
}

#[async_trait]
impl Store for MemoryStore {
    fn role(&self) -> StoreRole {
        self.role
    }

    async fn count_rows(&self, table: &str) -> StoreResult<i64> {
        let mut state = self.lock()?;
        state.trip(FailOp::Read, table)?;
        Ok(table_ref(&state.tables, table)?.rows.len() as i64)
    }

    async fn fetch_all(&self, table: &str) -> StoreResult<Vec<DynRow>> {
        let mut state = self.lock()?;
        state.trip(FailOp::Read, table)?;
        Ok(table_ref(&state.tables, table)?.rows.values().cloned().collect())
    }

    async fn insert_rows(&self, table: &str, rows: &[DynRow]) -> StoreResult<u64> {
        let mut state = self.lock()?;
        state.trip(FailOp::Insert, table)?;
        // a failing row must leave the table untouched, like a single INSERT statement
        let mut staged = state.tables.clone();
        for row in rows {
            put_row(&mut staged, table, row, false)?;
        }
        state.tables = staged;
        Ok(rows.len() as u64)
    }

    async fn upsert_rows(&self, table: &str, rows: &[DynRow]) -> StoreResult<u64> {
        let mut state = self.lock()?;
        state.trip(FailOp::Insert, table)?;
        let mut staged = state.tables.clone();
        for row in rows {
            put_row(&mut staged, table, row, true)?;
        }
        state.tables = staged;
        Ok(rows.len() as u64)
    }

    async fn delete_ids(&self, table: &str, ids: &[i64]) -> StoreResult<u64> {
        let mut state = self.lock()?;
        state.trip(FailOp::Delete, table)?;
        delete_cascade(&mut state.tables, table, ids)
    }

    async fn exists(&self, table: &str, column: &str, value: &DynValue) -> StoreResult<bool> {
        Ok(self.find_id(table, &[(column, value.clone())]).await?.is_some())
    }

    async fn find_id(&self, table: &str, filters: &[(&str, DynValue)]) -> StoreResult<Option<i64>> {
        for (column, _) in filters {
            check_column(column)?;
        }
        let mut state = self.lock()?;
        state.trip(FailOp::Read, table)?;
        let found = table_ref(&state.tables, table)?
            .rows
            .iter()
            .find(|(_, row)| {
                filters
                    .iter()
                    .all(|(column, value)| row.get(*column).is_some_and(|v| v.matches(value)))
            })
            .map(|(id, _)| *id);
        Ok(found)
    }

    async fn insert_returning_id(&self, table: &str, row: &DynRow) -> StoreResult<i64> {
        let mut state = self.lock()?;
        state.trip(FailOp::Insert, table)?;
        put_row(&mut state.tables, table, row, false)
    }

    async fn truncate_table(&self, table: &str) -> StoreResult<()> {
        check_table(table)?;
        let mut state = self.lock()?;
        state.trip(FailOp::Truncate, table)?;
        truncate_cascade(&mut state.tables, table)
    }

    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        Ok(Box::new(MemoryTx {
            state: self.state.clone(),
            deletes: Vec::new(),
        }))
    }
}

#[derive(Debug, Clone)]
struct PendingDelete {
    table: String,
    column: String,
    ids: Vec<i64>,
}

struct MemoryTx {
    state: Arc<Mutex<State>>,
    deletes: Vec<PendingDelete>,
}

/// Delete rows of `table` whose `column` is one of `ids`, cascading.
fn delete_matching(tables: &mut Tables, delete: &PendingDelete) -> StoreResult<u64> {
    let matching: Vec<i64> = table_ref(tables, &delete.table)?
        .rows
        .iter()
        .filter(|(_, row)| {
            row.get(&delete.column)
                .and_then(DynValue::as_i64)
                .is_some_and(|v| delete.ids.contains(&v))
        })
        .map(|(id, _)| *id)
        .collect();
    delete_cascade(tables, &delete.table, &matching)
}

impl MemoryTx {
    fn lock(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Other("memory store lock poisoned".into()))
    }

    /// Live tables with this transaction's deletes applied.
    fn view(&self, tables: &Tables) -> StoreResult<Tables> {
        let mut view = tables.clone();
        for delete in &self.deletes {
            delete_matching(&mut view, delete)?;
        }
        Ok(view)
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn select_ids(
        &mut self,
        table: &str,
        column: &str,
        value: &DynValue,
    ) -> StoreResult<Vec<i64>> {
        check_column(column)?;
        let mut state = self.lock()?;
        state.trip(FailOp::Read, table)?;
        let view = self.view(&state.tables)?;
        select_ids(&view, table, column, value)
    }

    async fn delete_where_in(
        &mut self,
        table: &str,
        column: &str,
        ids: &[i64],
    ) -> StoreResult<u64> {
        check_column(column)?;
        let delete = PendingDelete {
            table: table.to_string(),
            column: column.to_string(),
            ids: ids.to_vec(),
        };
        let removed = {
            let mut state = self.lock()?;
            state.trip(FailOp::Delete, table)?;
            let mut view = self.view(&state.tables)?;
            delete_matching(&mut view, &delete)?
        };
        self.deletes.push(delete);
        Ok(removed)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let mut state = self.lock()?;
        state.trip(FailOp::Commit, "*")?;
        let committed = self.view(&state.tables)?;
        state.tables = committed;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}
