use std::collections::{HashMap, HashSet};

use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::engine::executor::{QueryBackend, SessionSource};
use crate::engine::table::{Operand, OrderBy, TableQuery};
use crate::error::StepError;

fn is_ident(part: &str) -> bool {
    !part.is_empty() && part.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Double-quoted column name. Only `[A-Za-z0-9_]` is accepted.
pub fn quote_ident(ident: &str) -> Result<String, StepError> {
    if is_ident(ident) {
        Ok(format!("\"{ident}\""))
    } else {
        Err(StepError::InvalidIdentifier(ident.to_string()))
    }
}

/// Table name with an optional `schema.` prefix, each part quoted.
pub fn quote_table(table: &str) -> Result<String, StepError> {
    match table.split_once('.') {
        Some((schema, name)) if is_ident(schema) && is_ident(name) => {
            Ok(format!("\"{schema}\".\"{name}\""))
        }
        Some(_) => Err(StepError::InvalidIdentifier(table.to_string())),
        None => quote_ident(table),
    }
}

struct Where {
    alias: &'static str,
    started: bool,
}

impl Where {
    fn new(alias: &'static str) -> Self {
        Self {
            alias,
            started: false,
        }
    }

    fn next(&mut self, qb: &mut QueryBuilder<'static, Postgres>) {
        qb.push(if self.started { " AND " } else { " WHERE " });
        self.started = true;
    }

    fn column(&self, column: &str) -> Result<String, StepError> {
        Ok(format!("{}.{}", self.alias, quote_ident(column)?))
    }

    fn equals(
        &mut self,
        qb: &mut QueryBuilder<'static, Postgres>,
        column: &str,
        value: &Operand,
    ) -> Result<(), StepError> {
        let col = self.column(column)?;
        self.next(qb);
        qb.push(format!("{col}::text = ")).push_bind(value.as_text());
        Ok(())
    }

    fn contains(
        &mut self,
        qb: &mut QueryBuilder<'static, Postgres>,
        column: &str,
        needle: &str,
    ) -> Result<(), StepError> {
        let col = self.column(column)?;
        self.next(qb);
        qb.push(format!("{col}::text ILIKE "))
            .push_bind(format!("%{needle}%"));
        Ok(())
    }

    fn bound(
        &mut self,
        qb: &mut QueryBuilder<'static, Postgres>,
        column: &str,
        op: &str,
        value: &Operand,
    ) -> Result<(), StepError> {
        let col = self.column(column)?;
        self.next(qb);
        match value {
            Operand::Int(n) => qb.push(format!("{col} {op} ")).push_bind(*n),
            Operand::Float(f) => qb.push(format!("{col} {op} ")).push_bind(*f),
            Operand::Bool(b) => qb.push(format!("{col} {op} ")).push_bind(*b),
            Operand::Text(s) => qb.push(format!("{col}::text {op} ")).push_bind(s.clone()),
        };
        Ok(())
    }
}

fn known_filters<'a>(
    filters: &'a [(String, Operand)],
    columns: Option<&HashSet<String>>,
) -> impl Iterator<Item = &'a (String, Operand)> {
    filters.iter().filter(move |(col, _)| match columns {
        Some(known) if !known.contains(col) => {
            tracing::debug!(column = %col, "Ignoring filter on unknown column");
            false
        }
        _ => true,
    })
}

fn push_order_limit(
    qb: &mut QueryBuilder<'static, Postgres>,
    order: &Option<OrderBy>,
    limit: i64,
) -> Result<(), StepError> {
    if let Some(order) = order {
        let direction = if order.descending { "DESC" } else { "ASC" };
        qb.push(format!(
            " ORDER BY t.{} {direction}",
            quote_ident(&order.column)?
        ));
    }
    qb.push(" LIMIT ").push_bind(limit);
    Ok(())
}

/// Builds the SQL for one step. Rows are selected as `row_to_json`, every
/// value is bound, and filters on columns outside `columns` are dropped.
pub fn build_query(
    query: &TableQuery,
    columns: Option<&HashSet<String>>,
) -> Result<QueryBuilder<'static, Postgres>, StepError> {
    let table = quote_table(query.table())?;

    if let TableQuery::Aggregate {
        group_by,
        function,
        column,
        filters,
        ..
    } = query
    {
        let group = quote_ident(group_by)?;
        let target = match column {
            Some(col) => format!("s.{}", quote_ident(col)?),
            None => "*".to_string(),
        };
        let mut qb = QueryBuilder::new(format!(
            "SELECT row_to_json(t) AS row FROM (SELECT s.{group}, {}({target}) AS aggregate_value FROM {table} AS s",
            function.sql()
        ));
        let mut conditions = Where::new("s");
        for (col, value) in known_filters(filters, columns) {
            conditions.equals(&mut qb, col, value)?;
        }
        qb.push(format!(
            " GROUP BY s.{group}) AS t ORDER BY t.aggregate_value DESC NULLS LAST"
        ));
        return Ok(qb);
    }

    let mut qb = QueryBuilder::new(format!("SELECT row_to_json(t) AS row FROM {table} AS t"));
    let mut conditions = Where::new("t");
    match query {
        TableQuery::Search {
            column,
            value,
            limit,
            order,
            ..
        } => {
            conditions.contains(&mut qb, column, value)?;
            push_order_limit(&mut qb, order, *limit)?;
        }
        TableQuery::Filter {
            filters,
            limit,
            order,
            ..
        } => {
            for (col, value) in known_filters(filters, columns) {
                conditions.equals(&mut qb, col, value)?;
            }
            push_order_limit(&mut qb, order, *limit)?;
        }
        TableQuery::Range {
            column,
            min,
            max,
            filters,
            search,
            limit,
            order,
            ..
        } => {
            if let Some(min) = min {
                conditions.bound(&mut qb, column, ">=", min)?;
            }
            if let Some(max) = max {
                conditions.bound(&mut qb, column, "<=", max)?;
            }
            for (col, value) in known_filters(filters, columns) {
                conditions.equals(&mut qb, col, value)?;
            }
            if let Some((search_col, needle)) = search {
                conditions.contains(&mut qb, search_col, needle)?;
            }
            push_order_limit(&mut qb, order, *limit)?;
        }
        TableQuery::Aggregate { .. } => {}
    }
    Ok(qb)
}

/// Hands out one pooled connection per run.
#[derive(Clone)]
pub struct PgSessionSource {
    pool: PgPool,
}

impl PgSessionSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SessionSource for PgSessionSource {
    async fn open(&self) -> Result<Box<dyn QueryBackend>, sqlx::Error> {
        let conn = self.pool.acquire().await?;
        tracing::debug!("Database session opened");
        Ok(Box::new(PgSession {
            conn,
            columns: HashMap::new(),
        }))
    }
}

/// A run's database session; the connection returns to the pool on drop.
pub struct PgSession {
    conn: PoolConnection<Postgres>,
    columns: HashMap<String, HashSet<String>>,
}

impl PgSession {
    async fn columns(&mut self, table: &str) -> Result<HashSet<String>, StepError> {
        if let Some(known) = self.columns.get(table) {
            return Ok(known.clone());
        }
        let (schema, name) = match table.split_once('.') {
            Some((schema, name)) => (Some(schema), name),
            None => (None, table),
        };
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT column_name::text FROM information_schema.columns \
             WHERE table_name = $1 AND table_schema = COALESCE($2, current_schema())",
        )
        .bind(name)
        .bind(schema)
        .fetch_all(&mut *self.conn)
        .await?;

        let known: HashSet<String> = names.into_iter().collect();
        self.columns.insert(table.to_string(), known.clone());
        Ok(known)
    }
}

#[async_trait::async_trait]
impl QueryBackend for PgSession {
    async fn run(&mut self, query: &TableQuery) -> Result<Vec<Value>, StepError> {
        quote_table(query.table())?;
        let known = self.columns(query.table()).await?;
        let columns = (!known.is_empty()).then_some(&known);
        let mut builder = build_query(query, columns)?;
        let rows = builder
            .build_query_scalar::<Value>()
            .fetch_all(&mut *self.conn)
            .await?;
        Ok(rows)
    }
}
