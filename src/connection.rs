use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{Executor as _, PgPool, Postgres, Transaction};
use tokio::sync::Mutex;

use crate::context::Context;
use crate::error::{Error, Result};

/// Shared handle to an open transaction.
///
/// The transaction is taken out of the `Option` exactly once, on commit or
/// rollback; every clone observes the consumed state afterwards.
pub(crate) type TxHandle = Arc<Mutex<Option<Transaction<'static, Postgres>>>>;

/// Stream of rows produced by [`Connection::query_many`].
pub type RowStream = BoxStream<'static, Result<PgRow>>;

/// An owned positional query argument.
///
/// Values are bound in slice order as `$1`, `$2`, … and are cheap enough
/// to clone into the driver, which keeps them available to logging and
/// tracing middleware.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    I32(i32),
    I64(i64),
    F64(f64),
    Text(String),
    Json(serde_json::Value),
    TextArray(Vec<String>),
    Timestamp(DateTime<Utc>),
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        SqlValue::I32(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::I64(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::F64(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_owned())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(value: serde_json::Value) -> Self {
        SqlValue::Json(value)
    }
}

impl From<Vec<String>> for SqlValue {
    fn from(value: Vec<String>) -> Self {
        SqlValue::TextArray(value)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(value)
    }
}

fn bind_values<'q>(
    sql: &'q str,
    args: &[SqlValue],
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    let mut query = sqlx::query::<Postgres>(sql);
    for arg in args {
        query = match arg {
            SqlValue::Null => query.bind(Option::<String>::None),
            SqlValue::Bool(v) => query.bind(*v),
            SqlValue::I32(v) => query.bind(*v),
            SqlValue::I64(v) => query.bind(*v),
            SqlValue::F64(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.clone()),
            SqlValue::Json(v) => query.bind(v.clone()),
            SqlValue::TextArray(v) => query.bind(v.clone()),
            SqlValue::Timestamp(v) => query.bind(*v),
        };
    }
    query
}

/// The uniform read/write surface shared by the pool and transaction
/// variants. Repositories code against this trait and stay oblivious to
/// whether they hold a transaction.
///
/// The abstraction adds no retry, rewrite or caching; driver errors
/// propagate verbatim. Every method races the driver call against the
/// context's cancellation token.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Runs a statement and returns the number of rows affected.
    async fn execute(&self, ctx: &Context, sql: &str, args: &[SqlValue]) -> Result<u64>;

    /// Runs a query expected to return exactly one row.
    async fn query_one(&self, ctx: &Context, sql: &str, args: &[SqlValue]) -> Result<PgRow>;

    /// Runs a query and returns its rows as a stream.
    async fn query_many(&self, ctx: &Context, sql: &str, args: &[SqlValue]) -> Result<RowStream>;

    /// Prepares a statement for repeated execution.
    async fn prepare(&self, ctx: &Context, sql: &str) -> Result<PreparedStatement>;
}

async fn race<T>(ctx: &Context, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        res = fut => res,
        () = ctx.cancelled() => Err(Error::Cancelled),
    }
}

#[derive(Clone)]
pub(crate) enum Raw {
    Pool(PgPool),
    Tx(TxHandle),
}

/// Concrete connection over either an autocommit pool or a shared
/// transaction handle. Obtained from
/// [`Uow::db`](crate::Uow::db) / [`Uow::db_or_tx`](crate::Uow::db_or_tx) /
/// [`Uow::tx`](crate::Uow::tx); both variants expose the identical
/// [`Connection`] surface.
#[derive(Clone)]
pub struct Conn {
    raw: Raw,
}

impl Conn {
    pub(crate) fn new(raw: Raw) -> Self {
        Self { raw }
    }
}

#[async_trait]
impl Connection for Conn {
    async fn execute(&self, ctx: &Context, sql: &str, args: &[SqlValue]) -> Result<u64> {
        race(ctx, async {
            match &self.raw {
                Raw::Pool(pool) => {
                    let done = bind_values(sql, args).execute(pool).await?;
                    Ok(done.rows_affected())
                }
                Raw::Tx(handle) => {
                    let mut guard = handle.lock().await;
                    let tx = guard.as_mut().ok_or(Error::NotInTransaction)?;
                    let done = bind_values(sql, args).execute(&mut **tx).await?;
                    Ok(done.rows_affected())
                }
            }
        })
        .await
    }

    async fn query_one(&self, ctx: &Context, sql: &str, args: &[SqlValue]) -> Result<PgRow> {
        race(ctx, async {
            match &self.raw {
                Raw::Pool(pool) => Ok(bind_values(sql, args).fetch_one(pool).await?),
                Raw::Tx(handle) => {
                    let mut guard = handle.lock().await;
                    let tx = guard.as_mut().ok_or(Error::NotInTransaction)?;
                    Ok(bind_values(sql, args).fetch_one(&mut **tx).await?)
                }
            }
        })
        .await
    }

    async fn query_many(&self, ctx: &Context, sql: &str, args: &[SqlValue]) -> Result<RowStream> {
        // Rows are drained at dispatch: the transaction variant cannot hold
        // its handle lock across caller-controlled stream polls without
        // deadlocking the next query on the same transaction.
        race(ctx, async {
            let rows = match &self.raw {
                Raw::Pool(pool) => bind_values(sql, args).fetch_all(pool).await?,
                Raw::Tx(handle) => {
                    let mut guard = handle.lock().await;
                    let tx = guard.as_mut().ok_or(Error::NotInTransaction)?;
                    bind_values(sql, args).fetch_all(&mut **tx).await?
                }
            };
            let stream: RowStream =
                Box::pin(futures::stream::iter(rows.into_iter().map(Ok::<_, Error>)));
            Ok(stream)
        })
        .await
    }

    async fn prepare(&self, ctx: &Context, sql: &str) -> Result<PreparedStatement> {
        race(ctx, async {
            // Round-trip once so syntax errors surface at prepare time;
            // sqlx keeps the statement cached per connection afterwards.
            match &self.raw {
                Raw::Pool(pool) => {
                    pool.prepare(sql).await?;
                }
                Raw::Tx(handle) => {
                    let mut guard = handle.lock().await;
                    let tx = guard.as_mut().ok_or(Error::NotInTransaction)?;
                    (&mut **tx).prepare(sql).await?;
                }
            }
            Ok(PreparedStatement {
                conn: self.clone(),
                sql: sql.to_owned(),
            })
        })
        .await
    }
}

/// A statement handle bound to the connection that prepared it.
///
/// Executions go through the underlying connection directly, not through
/// the middleware chain that produced it.
pub struct PreparedStatement {
    conn: Conn,
    sql: String,
}

impl PreparedStatement {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub async fn execute(&self, ctx: &Context, args: &[SqlValue]) -> Result<u64> {
        self.conn.execute(ctx, &self.sql, args).await
    }

    pub async fn query_one(&self, ctx: &Context, args: &[SqlValue]) -> Result<PgRow> {
        self.conn.query_one(ctx, &self.sql, args).await
    }

    pub async fn query_many(&self, ctx: &Context, args: &[SqlValue]) -> Result<RowStream> {
        self.conn.query_many(ctx, &self.sql, args).await
    }
}
