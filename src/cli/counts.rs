use std::fmt::Write as _;

use anyhow::Result;

use crate::error::StoreError;
use crate::store::{Store, StoreRole, TABLES};

/// Row counts of every managed table in one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCounts {
    pub role: StoreRole,
    pub tables: Vec<(&'static str, i64)>,
}

fn is_undefined_table_error(err: &StoreError) -> bool {
    match err {
        StoreError::Db(sqlx::Error::Database(db_err)) => db_err.code().as_deref() == Some("42P01"),
        _ => false,
    }
}

/// Missing tables count as zero so a freshly provisioned store can be inspected.
pub async fn collect(store: &dyn Store) -> Result<StoreCounts> {
    let mut tables = Vec::with_capacity(TABLES.len());
    for table in TABLES {
        let n = match store.count_rows(table).await {
            Ok(n) => n,
            Err(e) if is_undefined_table_error(&e) => 0,
            Err(e) => return Err(e.into()),
        };
        tables.push((table, n));
    }
    Ok(StoreCounts {
        role: store.role(),
        tables,
    })
}

pub fn render(counts: &[StoreCounts]) -> String {
    let mut out = String::new();
    write!(out, "{:<14}", "table").ok();
    for c in counts {
        write!(out, "{:>10}", c.role.as_str()).ok();
    }
    writeln!(out).ok();
    for (i, table) in TABLES.iter().enumerate() {
        write!(out, "{table:<14}").ok();
        for c in counts {
            let n = c.tables.get(i).map_or(0, |(_, n)| *n);
            write!(out, "{n:>10}").ok();
        }
        writeln!(out).ok();
    }
    out
}
