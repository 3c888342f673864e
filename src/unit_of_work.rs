use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::Mutex;

use crate::connection::{Conn, Raw};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::middleware::{apply, Middleware, SharedConn};

/// A unit of work: the façade through which repositories obtain a
/// connection.
///
/// A `Uow` owns exactly one of a connection pool or an open transaction,
/// decided at construction, plus an ordered middleware list applied to
/// every handle it returns. It is immutable once built; `run_in_tx`
/// produces a new transaction-variant `Uow` bound to the child context
/// instead of mutating the receiver.
#[derive(Clone)]
pub struct Uow {
    raw: Raw,
    middlewares: Vec<Middleware>,
}

impl Uow {
    /// Builds a pool-variant unit of work with no middleware.
    pub fn new(pool: PgPool) -> Self {
        Self::with_middlewares(pool, Vec::new())
    }

    /// Builds a pool-variant unit of work. Middleware applies in the order
    /// given, first-listed outermost, to the pool handle and to every
    /// transaction handle derived from it.
    pub fn with_middlewares(pool: PgPool, middlewares: Vec<Middleware>) -> Self {
        Self {
            raw: Raw::Pool(pool),
            middlewares,
        }
    }

    fn from_tx(tx: Transaction<'static, Postgres>, middlewares: Vec<Middleware>) -> Self {
        Self {
            raw: Raw::Tx(Arc::new(Mutex::new(Some(tx)))),
            middlewares,
        }
    }

    /// True when this unit of work holds a transaction.
    pub fn is_tx(&self) -> bool {
        matches!(self.raw, Raw::Tx(_))
    }

    pub(crate) fn conn(&self) -> SharedConn {
        apply(Arc::new(Conn::new(self.raw.clone())), &self.middlewares)
    }

    /// Returns the autocommit pool handle with middleware applied.
    ///
    /// Fails with [`Error::UsedTxAsPool`] on a transaction-variant unit of
    /// work: autocommit access is not available while a transaction is
    /// open.
    pub fn db(&self) -> Result<SharedConn> {
        if self.is_tx() {
            return Err(Error::UsedTxAsPool);
        }
        Ok(self.conn())
    }

    /// Returns the transaction bound to `ctx` when present, the pool
    /// otherwise. This is the method repositories use: inside a
    /// `run_in_tx` body every call routes to the same transaction, outside
    /// one it autocommits.
    pub fn db_or_tx(&self, ctx: &Context) -> Result<SharedConn> {
        match ctx.tx_binding() {
            Some(bound) => bound.tx_conn(),
            None => self.db(),
        }
    }

    /// Returns the transaction bound to `ctx`, failing with
    /// [`Error::NotInTransaction`] when there is none. For operations that
    /// must run transactionally.
    pub fn tx(&self, ctx: &Context) -> Result<SharedConn> {
        match ctx.tx_binding() {
            Some(bound) => bound.tx_conn(),
            None => Err(Error::NotInTransaction),
        }
    }

    fn tx_conn(&self) -> Result<SharedConn> {
        if !self.is_tx() {
            return Err(Error::ContextMissingUow);
        }
        Ok(self.conn())
    }

    /// Begins a transaction and returns the transaction-variant unit of
    /// work directly. The caller owns commit/rollback; forgetting either
    /// leaves the cleanup to the driver's rollback-on-drop. Prefer
    /// [`run_in_tx`](Self::run_in_tx).
    pub async fn begin_tx(&self, ctx: &Context) -> Result<Uow> {
        let pool = match &self.raw {
            Raw::Pool(pool) => pool,
            Raw::Tx(_) => return Err(Error::NestedTransaction),
        };
        let tx = begin(pool, ctx).await?;
        Ok(Uow::from_tx(tx, self.middlewares.clone()))
    }

    /// Runs `body` inside a transaction.
    ///
    /// When `ctx` already carries a transaction binding the call is
    /// re-entrant: `body` runs against the existing transaction and no
    /// commit or rollback is issued here; the outermost call owns both.
    /// There are no savepoints; an inner failure does not form a
    /// sub-scope.
    ///
    /// Otherwise a transaction is begun with the options carried by `ctx`,
    /// a transaction-variant `Uow` is bound into the child context handed
    /// to `body`, and completion follows the body's outcome: a panic rolls
    /// back and resumes the panic; an error rolls back and is returned
    /// (rollback failures are logged and suppressed in favor of the
    /// original cause); cancellation rolls back and yields
    /// [`Error::Cancelled`]; success commits, and a commit failure is the
    /// returned error. The bound handle is consumed on completion;
    /// retaining it past the body is a usage error surfacing
    /// [`Error::NotInTransaction`] on use.
    pub async fn run_in_tx<T, E, F, Fut>(&self, ctx: &Context, body: F) -> Result<T, E>
    where
        E: From<Error>,
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if ctx.is_tx() {
            return body(ctx.clone()).await;
        }

        let pool = match &self.raw {
            Raw::Pool(pool) => pool,
            Raw::Tx(_) => return Err(E::from(Error::NestedTransaction)),
        };
        let tx = tokio::select! {
            res = begin(pool, ctx) => res.map_err(E::from)?,
            () = ctx.cancelled() => return Err(E::from(Error::Cancelled)),
        };
        let bound = Arc::new(Uow::from_tx(tx, self.middlewares.clone()));
        let child_ctx = ctx.with_tx(bound.clone());

        let outcome = {
            let body = AssertUnwindSafe(body(child_ctx)).catch_unwind();
            tokio::select! {
                res = body => res,
                () = ctx.cancelled() => Ok(Err(E::from(Error::Cancelled))),
            }
        };

        match outcome {
            Err(panic) => {
                if let Err(err) = bound.rollback().await {
                    tracing::warn!(error = %err, "rollback after panic failed");
                }
                std::panic::resume_unwind(panic);
            }
            Ok(Err(err)) => {
                if let Err(rollback_err) = bound.rollback().await {
                    tracing::warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
            Ok(Ok(value)) => {
                bound.commit().await.map_err(E::from)?;
                Ok(value)
            }
        }
    }

    /// Commits the held transaction. The handle is taken out on first use,
    /// so at most one commit or rollback ever reaches the driver; later
    /// calls are no-ops.
    pub async fn commit(&self) -> Result<()> {
        match &self.raw {
            Raw::Tx(handle) => match handle.lock().await.take() {
                Some(tx) => Ok(tx.commit().await?),
                None => Ok(()),
            },
            Raw::Pool(_) => Err(Error::NotInTransaction),
        }
    }

    /// Rolls back the held transaction. Same take-once semantics as
    /// [`commit`](Self::commit).
    pub async fn rollback(&self) -> Result<()> {
        match &self.raw {
            Raw::Tx(handle) => match handle.lock().await.take() {
                Some(tx) => Ok(tx.rollback().await?),
                None => Ok(()),
            },
            Raw::Pool(_) => Err(Error::NotInTransaction),
        }
    }
}

async fn begin(pool: &PgPool, ctx: &Context) -> Result<Transaction<'static, Postgres>> {
    let mut tx = pool.begin().await?;
    if let Some(set) = ctx.tx_options().to_set_statement() {
        sqlx::query(&set).execute(&mut *tx).await?;
    }
    Ok(tx)
}
