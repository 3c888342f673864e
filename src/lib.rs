//! Transaction orchestration for PostgreSQL.
//!
//! This crate isolates transaction management from repository
//! implementations. Repositories receive a [`Uow`] and call
//! [`Uow::db_or_tx`] to obtain a connection; whether that connection is an
//! autocommit pool or the transaction of an enclosing [`Uow::run_in_tx`]
//! is decided by the [`Context`] threaded through the call chain, never by
//! the repository's signature.
//!
//! At most one real transaction exists per logical unit: re-entrant
//! `run_in_tx` calls reuse the outer transaction and only the outermost
//! call commits or rolls back. On top of that invariant sit a
//! middleware-composable connection wrapper for logging and tracing, a
//! transactional [`outbox`], and transaction-scoped Postgres advisory
//! [`lock`]s.
//!
//! ```no_run
//! use pg_txkit::{Connection as _, Context, SqlValue, Uow};
//!
//! # async fn example(pool: sqlx::PgPool) -> Result<(), pg_txkit::Error> {
//! let uow = Uow::new(pool);
//! let ctx = Context::new();
//! uow.run_in_tx(&ctx, |tx_ctx| {
//!     let uow = uow.clone();
//!     async move {
//!         uow.db_or_tx(&tx_ctx)?
//!             .execute(&tx_ctx, "insert into numbers(n) values ($1)", &[SqlValue::I32(42)])
//!             .await?;
//!         Ok(())
//!     }
//! })
//! .await
//! # }
//! ```

pub mod connection;
pub mod context;
pub mod error;
pub mod lock;
pub mod middleware;
pub mod outbox;
pub mod unit_of_work;

pub use connection::{Conn, Connection, PreparedStatement, RowStream, SqlValue};
pub use context::{Context, IsolationLevel, TxOptions};
pub use error::{Error, Result};
pub use lock::{Key, Locker};
pub use middleware::{
    apply, with_logger, with_tracer, Logger, Middleware, QueryLogger, QuerySpan, QueryTracer,
    SharedConn, Tracer, TracingLogger,
};
pub use outbox::{Message, Outbox, OutboxEvent, PollHandle, PollOptions};
pub use unit_of_work::Uow;
