/// Error type for unit-of-work, advisory-lock and outbox operations.
///
/// Usage errors (`NotInTransaction`, `UsedTxAsPool`, `NestedTransaction`)
/// indicate programmer mistakes. They are returned as `Err` values rather
/// than panicking, so callers can match on them in tests and service code.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transaction handle was requested but the context carries none.
    #[error("not running inside a transaction")]
    NotInTransaction,

    /// `db()` was called on a unit of work that holds a transaction;
    /// autocommit access is not available while a transaction is open.
    #[error("transaction handle cannot be used as a pool")]
    UsedTxAsPool,

    /// `run_in_tx` or `begin_tx` was called on a unit of work that already
    /// holds a transaction, without a parent binding in the context.
    #[error("transaction cannot be nested")]
    NestedTransaction,

    /// An internal context lookup failed where an invariant required a
    /// bound unit of work.
    #[error("no unit of work bound to the context")]
    ContextMissingUow,

    /// An advisory lock was attempted outside a transaction.
    #[error("cannot lock outside a transaction: {0}")]
    LockOutsideTx(String),

    /// A non-blocking advisory lock is held by another transaction.
    #[error("already locked: {0}")]
    AlreadyLocked(String),

    /// The outbox has no messages available. A sentinel the caller is
    /// expected to match explicitly; never logged by the library.
    #[error("outbox is empty")]
    Empty,

    /// The context was cancelled while an operation was in flight.
    #[error("operation cancelled")]
    Cancelled,

    /// Worker options failed validation.
    #[error("invalid configuration: {0}")]
    Config(&'static str),

    /// Driver errors pass through unchanged.
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
