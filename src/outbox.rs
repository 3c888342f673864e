//! Transactional outbox: messages enqueued inside a transaction are
//! persisted atomically with it and consumed by a separate delivery
//! process.
//!
//! Expected table:
//!
//! ```sql
//! CREATE TABLE outbox (
//!     id             bigint  GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
//!     aggregate_id   text    NOT NULL,
//!     aggregate_type text    NOT NULL,
//!     type           text    NOT NULL,
//!     payload        jsonb   NOT NULL DEFAULT '{}',
//!     created_at     timestamptz NOT NULL DEFAULT now()
//! );
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::Row as _;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::connection::{Connection as _, SqlValue};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::unit_of_work::Uow;

const INSERT: &str = "INSERT INTO outbox(aggregate_id, aggregate_type, type, payload) VALUES (unnest($1::text[]), unnest($2::text[]), unnest($3::text[]), unnest($4::text[])::jsonb)";
const COUNT: &str = "SELECT COUNT(*) FROM outbox";
const LOAD_AND_DELETE: &str = "DELETE FROM outbox WHERE id = (SELECT id FROM outbox ORDER BY id FOR UPDATE SKIP LOCKED LIMIT 1) RETURNING *";

/// A message to enqueue. `kind` is stored in the `type` column.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub kind: String,
    pub payload: serde_json::Value,
}

/// A persisted outbox row. `id` is assigned by the store and totally
/// ordered in enqueue order.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEvent {
    pub id: i64,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Per-transaction staging buffer. Appends serialize under a mutex so the
/// body may fan out enqueues within one transaction.
#[derive(Default)]
pub(crate) struct Staging {
    messages: Mutex<Vec<Message>>,
}

impl Staging {
    fn enqueue(&self, messages: impl IntoIterator<Item = Message>) {
        self.messages.lock().extend(messages);
    }

    fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    fn snapshot(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }
}

/// Enqueues messages onto the staging buffer carried by `ctx`.
///
/// Returns `false` without side effects when `ctx` is not inside an
/// [`Outbox::run_in_tx`] scope. Safe to call concurrently from tasks
/// sharing the same transaction context.
pub fn enqueue(ctx: &Context, messages: impl IntoIterator<Item = Message>) -> bool {
    match ctx.staging() {
        Some(staging) => {
            staging.enqueue(messages);
            true
        }
        None => false,
    }
}

/// Options for the polling worker. All fields must be strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    /// Maximum number of concurrently processed messages.
    pub concurrency: usize,
    /// Number of tasks dispatched per tick.
    pub batch_size: usize,
    /// Ticker interval.
    pub poll_interval: Duration,
}

impl PollOptions {
    fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be greater than zero"));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be greater than zero"));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll_interval must be greater than zero"));
        }
        Ok(())
    }
}

/// Handle to a running polling worker.
pub struct PollHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollHandle {
    /// Halts dispatch and waits for in-flight tasks to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Outbox layered over a pool-variant [`Uow`].
#[derive(Clone)]
pub struct Outbox {
    db: Uow,
}

impl Outbox {
    /// Wraps a pool-variant unit of work; a transaction-variant receiver
    /// is rejected with [`Error::UsedTxAsPool`].
    pub fn new(db: Uow) -> Result<Self> {
        if db.is_tx() {
            return Err(Error::UsedTxAsPool);
        }
        Ok(Self { db })
    }

    /// Runs `body` inside a transaction whose child context additionally
    /// carries a fresh staging buffer for [`enqueue`].
    ///
    /// After `body` succeeds, staged messages are bulk-inserted into the
    /// `outbox` table within the same transaction, so they commit or roll
    /// back atomically with the body's effects. A rollback discards the
    /// buffer.
    pub async fn run_in_tx<T, E, F, Fut>(&self, ctx: &Context, body: F) -> Result<T, E>
    where
        E: From<Error>,
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let staging = Arc::new(Staging::default());
        let flush = staging.clone();
        self.db
            .run_in_tx(ctx, |tx_ctx| async move {
                let value = body(tx_ctx.with_staging(staging)).await?;

                if !flush.is_empty() {
                    let conn = match tx_ctx.tx_binding() {
                        Some(bound) => bound.tx(&tx_ctx).map_err(E::from)?,
                        None => return Err(E::from(Error::ContextMissingUow)),
                    };
                    let messages = flush.snapshot();
                    let mut aggregate_ids = Vec::with_capacity(messages.len());
                    let mut aggregate_types = Vec::with_capacity(messages.len());
                    let mut kinds = Vec::with_capacity(messages.len());
                    let mut payloads = Vec::with_capacity(messages.len());
                    for message in messages {
                        aggregate_ids.push(message.aggregate_id);
                        aggregate_types.push(message.aggregate_type);
                        kinds.push(message.kind);
                        payloads.push(message.payload.to_string());
                    }
                    conn.execute(
                        &tx_ctx,
                        INSERT,
                        &[
                            SqlValue::TextArray(aggregate_ids),
                            SqlValue::TextArray(aggregate_types),
                            SqlValue::TextArray(kinds),
                            SqlValue::TextArray(payloads),
                        ],
                    )
                    .await
                    .map_err(E::from)?;
                }

                Ok(value)
            })
            .await
    }

    /// Number of persisted, not-yet-consumed outbox rows.
    pub async fn count(&self, ctx: &Context) -> Result<i64> {
        let conn = self.db.db_or_tx(ctx)?;
        let row = conn.query_one(ctx, COUNT, &[]).await?;
        Ok(row.try_get(0)?)
    }

    /// Atomically claims and deletes the oldest available row.
    ///
    /// Must be called inside a transaction: the caller performs downstream
    /// side effects in the same transaction and returns an error to force
    /// redelivery. `FOR UPDATE SKIP LOCKED` keeps concurrent callers off
    /// each other's rows. Returns [`Error::Empty`] when no row is
    /// available.
    pub async fn load_and_delete(&self, ctx: &Context) -> Result<OutboxEvent> {
        let conn = self.db.tx(ctx)?;
        let row = match conn.query_one(ctx, LOAD_AND_DELETE, &[]).await {
            Err(Error::Sqlx(sqlx::Error::RowNotFound)) => return Err(Error::Empty),
            other => other?,
        };
        Ok(OutboxEvent {
            id: row.try_get("id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            kind: row.try_get("type")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
        })
    }

    /// Processes one message: a transaction wrapping
    /// [`load_and_delete`](Self::load_and_delete) and the handler. A
    /// handler error rolls the transaction back, so the row is redelivered
    /// later.
    pub async fn process<E, F, Fut>(&self, ctx: &Context, handler: F) -> Result<(), E>
    where
        E: From<Error>,
        F: FnOnce(Context, OutboxEvent) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        self.db
            .run_in_tx(ctx, |tx_ctx| async move {
                let event = self.load_and_delete(&tx_ctx).await.map_err(E::from)?;
                handler(tx_ctx.clone(), event).await
            })
            .await
    }

    /// Starts a polling worker: every `poll_interval` it dispatches up to
    /// `batch_size` tasks, bounded by `concurrency` in flight, each one a
    /// [`process`](Self::process) call in its own transaction.
    ///
    /// An empty outbox ends the task and the ticker continues. Handler
    /// errors are logged and the row redelivers on a later tick. With
    /// `concurrency = 1, batch_size = 1` delivery is strict FIFO;
    /// otherwise concurrent handlers may observe side effects out of `id`
    /// order. Dropping the returned handle without calling
    /// [`PollHandle::stop`] also shuts the worker down.
    pub fn poll<F, Fut>(
        &self,
        ctx: &Context,
        handler: F,
        options: PollOptions,
    ) -> Result<PollHandle>
    where
        F: Fn(Context, OutboxEvent) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        options.validate()?;

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let outbox = self.clone();
        let ctx = ctx.clone();

        let task = tokio::spawn(async move {
            let limit = Arc::new(Semaphore::new(options.concurrency));
            let start = tokio::time::Instant::now() + options.poll_interval;
            let mut ticker = tokio::time::interval_at(start, options.poll_interval);
            let mut tasks = JoinSet::new();

            tracing::info!(?options, "outbox poller started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        for _ in 0..options.batch_size {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                            let Ok(permit) = limit.clone().acquire_owned().await else {
                                break;
                            };
                            let outbox = outbox.clone();
                            let ctx = ctx.clone();
                            let handler = handler.clone();
                            tasks.spawn(async move {
                                let _permit = permit;
                                match outbox.process(&ctx, |c, e| handler(c, e)).await {
                                    Ok(()) | Err(Error::Empty) => {}
                                    Err(err) => {
                                        tracing::error!(error = %err, "outbox handler failed");
                                    }
                                }
                            });
                        }
                        while tasks.try_join_next().is_some() {}
                    }
                }
            }
            while tasks.join_next().await.is_some() {}
            tracing::info!("outbox poller stopped");
        });

        Ok(PollHandle { shutdown, task })
    }
}
