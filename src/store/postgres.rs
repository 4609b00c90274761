use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{
    postgres::{PgArguments, PgRow},
    query::Query,
    query_builder::Separated,
    Column, Postgres, QueryBuilder, Row, Transaction, TypeInfo,
};
use tracing::{debug, instrument};

use super::{
    check_column, check_table, DynRow, DynValue, Store, StoreResult, StoreRole, StoreTx,
};
use crate::error::StoreError;
use crate::util::db::Db;

/// Postgres caps a statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;

#[derive(Clone)]
pub struct PgStore {
    role: StoreRole,
    db: Db,
}

impl PgStore {
    pub fn new(role: StoreRole, db: Db) -> Self {
        Self { role, db }
    }

    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(
        role: StoreRole,
        database_url: &str,
        max_connections: u32,
    ) -> anyhow::Result<Self> {
        let db = Db::connect(database_url, max_connections).await?;
        Ok(Self::new(role, db))
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    async fn write_rows(&self, table: &str, rows: &[DynRow], upsert: bool) -> StoreResult<u64> {
        check_table(table)?;
        if rows.is_empty() {
            return Ok(0);
        }
        let columns = column_union(rows)?;
        if columns.is_empty() {
            return Err(StoreError::Other(format!("empty rows for {table}")));
        }
        let per_statement = (MAX_BIND_PARAMS / columns.len()).max(1);

        // one logical bulk insert even when it needs several statements
        let mut tx = self.db.pool.begin().await?;
        let mut written = 0u64;
        for chunk in rows.chunks(per_statement) {
            let mut qb = insert_builder(table, &columns);
            qb.push_values(chunk, |mut b, row| {
                for column in &columns {
                    push_value(&mut b, row.get(*column).unwrap_or(&DynValue::Null));
                }
            });
            if upsert {
                push_upsert_clause(&mut qb, &columns);
            }
            written += qb
                .build()
                .persistent(false)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        debug!(table, rows = written, upsert, "bulk write");
        Ok(written)
    }
}

/// Columns of all rows, in first-seen order.
fn column_union(rows: &[DynRow]) -> StoreResult<Vec<&str>> {
    let mut columns: Vec<&str> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !columns.contains(&key.as_str()) {
                check_column(key)?;
                columns.push(key.as_str());
            }
        }
    }
    Ok(columns)
}

fn insert_builder(table: &str, columns: &[&str]) -> QueryBuilder<'static, Postgres> {
    QueryBuilder::new(format!("INSERT INTO {} ({}) ", table, columns.join(", ")))
}

fn push_upsert_clause(qb: &mut QueryBuilder<'static, Postgres>, columns: &[&str]) {
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| **c != "id")
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect();
    if updates.is_empty() {
        qb.push(" ON CONFLICT (id) DO NOTHING");
    } else {
        qb.push(format!(" ON CONFLICT (id) DO UPDATE SET {}", updates.join(", ")));
    }
}

fn push_value(b: &mut Separated<'_, 'static, Postgres, &'static str>, value: &DynValue) {
    match value {
        // untyped literal so Postgres infers the column type
        DynValue::Null => b.push("NULL"),
        DynValue::Bool(v) => b.push_bind(*v),
        DynValue::Int(v) => b.push_bind(*v),
        DynValue::Float(v) => b.push_bind(*v),
        DynValue::Text(v) => b.push_bind(v.clone()),
        DynValue::Timestamp(v) => b.push_bind(*v),
    };
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &DynValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        DynValue::Null => query.bind(Option::<String>::None),
        DynValue::Bool(v) => query.bind(*v),
        DynValue::Int(v) => query.bind(*v),
        DynValue::Float(v) => query.bind(*v),
        DynValue::Text(v) => query.bind(v.clone()),
        DynValue::Timestamp(v) => query.bind(*v),
    }
}

fn decode_row(table: &str, row: &PgRow) -> StoreResult<DynRow> {
    let mut out = DynRow::with_capacity(row.columns().len());
    for column in row.columns() {
        let idx = column.ordinal();
        let value: DynValue = match column.type_info().name() {
            "BOOL" => row.try_get::<Option<bool>, _>(idx)?.into(),
            "INT2" => row.try_get::<Option<i16>, _>(idx)?.map(i64::from).into(),
            "INT4" => row.try_get::<Option<i32>, _>(idx)?.map(i64::from).into(),
            "INT8" => row.try_get::<Option<i64>, _>(idx)?.into(),
            "FLOAT4" => row.try_get::<Option<f32>, _>(idx)?.map(f64::from).into(),
            "FLOAT8" => row.try_get::<Option<f64>, _>(idx)?.into(),
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => row.try_get::<Option<String>, _>(idx)?.into(),
            "TIMESTAMPTZ" => row.try_get::<Option<DateTime<Utc>>, _>(idx)?.into(),
            "TIMESTAMP" => row
                .try_get::<Option<NaiveDateTime>, _>(idx)?
                .map(|v| v.and_utc())
                .into(),
            other => {
                return Err(StoreError::UnsupportedColumn {
                    table: table.to_string(),
                    column: column.name().to_string(),
                    type_name: other.to_string(),
                })
            }
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

#[async_trait]
impl Store for PgStore {
    fn role(&self) -> StoreRole {
        self.role
    }

    async fn count_rows(&self, table: &str) -> StoreResult<i64> {
        check_table(table)?;
        let sql = format!("SELECT COUNT(*) FROM {table}");
        let count: i64 = sqlx::query_scalar(&sql)
            .persistent(false)
            .fetch_one(&self.db.pool)
            .await?;
        Ok(count)
    }

    async fn fetch_all(&self, table: &str) -> StoreResult<Vec<DynRow>> {
        check_table(table)?;
        let sql = format!("SELECT * FROM {table} ORDER BY id");
        let rows = sqlx::query(&sql)
            .persistent(false)
            .fetch_all(&self.db.pool)
            .await?;
        rows.iter().map(|r| decode_row(table, r)).collect()
    }

    async fn insert_rows(&self, table: &str, rows: &[DynRow]) -> StoreResult<u64> {
        self.write_rows(table, rows, false).await
    }

    async fn upsert_rows(&self, table: &str, rows: &[DynRow]) -> StoreResult<u64> {
        self.write_rows(table, rows, true).await
    }

    async fn delete_ids(&self, table: &str, ids: &[i64]) -> StoreResult<u64> {
        check_table(table)?;
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!("DELETE FROM {table} WHERE id = ANY($1)");
        let res = sqlx::query(&sql)
            .persistent(false)
            .bind(ids.to_vec())
            .execute(&self.db.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn exists(&self, table: &str, column: &str, value: &DynValue) -> StoreResult<bool> {
        Ok(self.find_id(table, &[(column, value.clone())]).await?.is_some())
    }

    async fn find_id(&self, table: &str, filters: &[(&str, DynValue)]) -> StoreResult<Option<i64>> {
        check_table(table)?;
        if filters.is_empty() || filters.iter().any(|(_, v)| v.is_null()) {
            return Ok(None);
        }
        let mut conditions = Vec::with_capacity(filters.len());
        for (i, (column, _)) in filters.iter().enumerate() {
            check_column(column)?;
            conditions.push(format!("{column} = ${}", i + 1));
        }
        let sql = format!(
            "SELECT id FROM {table} WHERE {} ORDER BY id LIMIT 1",
            conditions.join(" AND ")
        );
        let mut query = sqlx::query(&sql).persistent(false);
        for (_, value) in filters {
            query = bind_value(query, value);
        }
        let row = query.fetch_optional(&self.db.pool).await?;
        match row {
            Some(r) => Ok(Some(r.try_get::<i64, _>(0)?)),
            None => Ok(None),
        }
    }

    async fn insert_returning_id(&self, table: &str, row: &DynRow) -> StoreResult<i64> {
        check_table(table)?;
        let rows = std::slice::from_ref(row);
        let columns = column_union(rows)?;
        if columns.is_empty() {
            return Err(StoreError::Other(format!("empty row for {table}")));
        }
        let mut qb = insert_builder(table, &columns);
        qb.push_values(rows, |mut b, row| {
            for column in &columns {
                push_value(&mut b, row.get(*column).unwrap_or(&DynValue::Null));
            }
        });
        qb.push(" RETURNING id");
        let id: i64 = qb
            .build_query_scalar()
            .persistent(false)
            .fetch_one(&self.db.pool)
            .await?;
        Ok(id)
    }

    async fn truncate_table(&self, table: &str) -> StoreResult<()> {
        check_table(table)?;
        let sql = format!("TRUNCATE TABLE {table} RESTART IDENTITY CASCADE");
        sqlx::raw_sql(&sql).execute(&self.db.pool).await?;
        debug!(role = %self.role, table, "truncated");
        Ok(())
    }

    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let tx = self.db.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn select_ids(
        &mut self,
        table: &str,
        column: &str,
        value: &DynValue,
    ) -> StoreResult<Vec<i64>> {
        check_table(table)?;
        check_column(column)?;
        let sql = format!("SELECT id FROM {table} WHERE {column} = $1 ORDER BY id");
        let rows = bind_value(sqlx::query(&sql).persistent(false), value)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter()
            .map(|r| r.try_get::<i64, _>(0).map_err(StoreError::from))
            .collect()
    }

    async fn delete_where_in(
        &mut self,
        table: &str,
        column: &str,
        ids: &[i64],
    ) -> StoreResult<u64> {
        check_table(table)?;
        check_column(column)?;
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!("DELETE FROM {table} WHERE {column} = ANY($1)");
        let res = sqlx::query(&sql)
            .persistent(false)
            .bind(ids.to_vec())
            .execute(&mut *self.tx)
            .await?;
        Ok(res.rows_affected())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, DynValue)]) -> DynRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn column_union_keeps_first_seen_order() {
        let rows = vec![
            row(&[("id", 1i64.into()), ("sku_id", 4i64.into())]),
            row(&[("id", 2i64.into()), ("unit", "Hrs".into())]),
        ];
        assert_eq!(column_union(&rows).unwrap(), vec!["id", "sku_id", "unit"]);
    }

    #[test]
    fn upsert_clause_skips_primary_key() {
        let mut qb = insert_builder("prices", &["id", "unit"]);
        push_upsert_clause(&mut qb, &["id", "unit"]);
        assert_eq!(
            qb.sql(),
            "INSERT INTO prices (id, unit)  ON CONFLICT (id) DO UPDATE SET unit = EXCLUDED.unit"
        );
    }

    #[test]
    fn rejects_hostile_column_names() {
        let rows = vec![row(&[("id; drop table skus", 1i64.into())])];
        assert!(column_union(&rows).is_err());
    }
}
