use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;

use crate::connection::{Connection, PreparedStatement, RowStream, SqlValue};
use crate::context::Context;
use crate::error::Result;

/// A connection handle behind a middleware chain.
pub type SharedConn = Arc<dyn Connection>;

/// A wrapper factory: takes a connection handle, returns another exposing
/// the same capability set. Wrappers may observe method dispatch but must
/// not alter arguments or buffer row streams.
pub type Middleware = Arc<dyn Fn(SharedConn) -> SharedConn + Send + Sync>;

/// Applies a middleware chain to a connection handle. The first listed
/// middleware is outermost: its method is entered first and exits last.
pub fn apply(conn: SharedConn, middlewares: &[Middleware]) -> SharedConn {
    middlewares.iter().rev().fold(conn, |conn, mw| mw(conn))
}

/// Sink for the [`Logger`] middleware.
pub trait QueryLogger: Send + Sync {
    fn log(&self, method: &'static str, sql: &str, args: &[SqlValue]);
}

/// Default [`QueryLogger`] emitting `tracing` debug events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl QueryLogger for TracingLogger {
    fn log(&self, method: &'static str, sql: &str, args: &[SqlValue]) {
        tracing::debug!(method, sql, ?args, "query dispatched");
    }
}

/// Middleware that reports `{method, sql, args}` to a sink before
/// delegating.
pub struct Logger {
    inner: SharedConn,
    sink: Arc<dyn QueryLogger>,
}

/// Builds a [`Logger`] middleware around the given sink.
pub fn with_logger(sink: Arc<dyn QueryLogger>) -> Middleware {
    Arc::new(move |conn| {
        Arc::new(Logger {
            inner: conn,
            sink: sink.clone(),
        })
    })
}

#[async_trait]
impl Connection for Logger {
    async fn execute(&self, ctx: &Context, sql: &str, args: &[SqlValue]) -> Result<u64> {
        self.sink.log("execute", sql, args);
        self.inner.execute(ctx, sql, args).await
    }

    async fn query_one(&self, ctx: &Context, sql: &str, args: &[SqlValue]) -> Result<PgRow> {
        self.sink.log("query_one", sql, args);
        self.inner.query_one(ctx, sql, args).await
    }

    async fn query_many(&self, ctx: &Context, sql: &str, args: &[SqlValue]) -> Result<RowStream> {
        self.sink.log("query_many", sql, args);
        self.inner.query_many(ctx, sql, args).await
    }

    async fn prepare(&self, ctx: &Context, sql: &str) -> Result<PreparedStatement> {
        self.sink.log("prepare", sql, &[]);
        self.inner.prepare(ctx, sql).await
    }
}

/// One traced method dispatch.
///
/// `err` reflects the dispatch result only; for `query_many`, errors that
/// surface while draining the row stream are not visible here.
#[derive(Debug, Clone)]
pub struct QuerySpan {
    pub method: &'static str,
    pub sql: String,
    pub args: Vec<SqlValue>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub err: Option<String>,
}

/// Sink for the [`Tracer`] middleware.
pub trait QueryTracer: Send + Sync {
    fn trace(&self, span: QuerySpan);
}

/// Middleware that records a [`QuerySpan`] per dispatched method.
pub struct Tracer {
    inner: SharedConn,
    sink: Arc<dyn QueryTracer>,
}

/// Builds a [`Tracer`] middleware around the given sink.
pub fn with_tracer(sink: Arc<dyn QueryTracer>) -> Middleware {
    Arc::new(move |conn| {
        Arc::new(Tracer {
            inner: conn,
            sink: sink.clone(),
        })
    })
}

impl Tracer {
    fn record<T>(
        &self,
        method: &'static str,
        sql: &str,
        args: &[SqlValue],
        started_at: DateTime<Utc>,
        result: &Result<T>,
    ) {
        self.sink.trace(QuerySpan {
            method,
            sql: sql.to_owned(),
            args: args.to_vec(),
            started_at,
            ended_at: Utc::now(),
            err: result.as_ref().err().map(ToString::to_string),
        });
    }
}

#[async_trait]
impl Connection for Tracer {
    async fn execute(&self, ctx: &Context, sql: &str, args: &[SqlValue]) -> Result<u64> {
        let started_at = Utc::now();
        let result = self.inner.execute(ctx, sql, args).await;
        self.record("execute", sql, args, started_at, &result);
        result
    }

    async fn query_one(&self, ctx: &Context, sql: &str, args: &[SqlValue]) -> Result<PgRow> {
        let started_at = Utc::now();
        let result = self.inner.query_one(ctx, sql, args).await;
        self.record("query_one", sql, args, started_at, &result);
        result
    }

    async fn query_many(&self, ctx: &Context, sql: &str, args: &[SqlValue]) -> Result<RowStream> {
        let started_at = Utc::now();
        let result = self.inner.query_many(ctx, sql, args).await;
        self.record("query_many", sql, args, started_at, &result);
        result
    }

    async fn prepare(&self, ctx: &Context, sql: &str) -> Result<PreparedStatement> {
        let started_at = Utc::now();
        let result = self.inner.prepare(ctx, sql).await;
        self.record("prepare", sql, &[], started_at, &result);
        result
    }
}
