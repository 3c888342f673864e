use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::outbox::Staging;
use crate::unit_of_work::Uow;

/// Transaction isolation levels accepted by [`TxOptions`].
///
/// The full set mirrors what SQL drivers commonly name; levels a given
/// server does not support are rejected by the server itself and the
/// error propagates unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    Default,
    ReadUncommitted,
    ReadCommitted,
    WriteCommitted,
    RepeatableRead,
    Snapshot,
    Serializable,
    Linearizable,
}

impl IsolationLevel {
    fn as_sql(self) -> Option<&'static str> {
        match self {
            IsolationLevel::Default => None,
            IsolationLevel::ReadUncommitted => Some("READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => Some("READ COMMITTED"),
            IsolationLevel::WriteCommitted => Some("WRITE COMMITTED"),
            IsolationLevel::RepeatableRead => Some("REPEATABLE READ"),
            IsolationLevel::Snapshot => Some("SNAPSHOT"),
            IsolationLevel::Serializable => Some("SERIALIZABLE"),
            IsolationLevel::Linearizable => Some("LINEARIZABLE"),
        }
    }
}

/// Options applied to a transaction when it is begun.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxOptions {
    pub isolation: IsolationLevel,
    pub read_only: bool,
}

impl TxOptions {
    /// Renders the `SET TRANSACTION` statement for non-default options, or
    /// `None` when the driver defaults apply.
    pub(crate) fn to_set_statement(self) -> Option<String> {
        let mut modes = Vec::new();
        if let Some(level) = self.isolation.as_sql() {
            modes.push(format!("ISOLATION LEVEL {level}"));
        }
        if self.read_only {
            modes.push("READ ONLY".to_string());
        }
        if modes.is_empty() {
            None
        } else {
            Some(format!("SET TRANSACTION {}", modes.join(", ")))
        }
    }
}

/// Per-call-chain context carrying the active transaction binding,
/// transaction options, the outbox staging buffer and a cancellation
/// token.
///
/// A `Context` is an immutable value: the `with_*` builders return a new
/// context and leave the receiver untouched, so a binding set for a child
/// call chain is never visible to the parent. Transaction and staging
/// bindings live in distinct slots and are set only by
/// [`Uow::run_in_tx`](crate::Uow::run_in_tx) and
/// [`Outbox::run_in_tx`](crate::Outbox::run_in_tx) respectively.
#[derive(Clone, Default)]
pub struct Context {
    tx: Option<Arc<Uow>>,
    staging: Option<Arc<Staging>>,
    isolation: Option<IsolationLevel>,
    read_only: Option<bool>,
    cancel: CancellationToken,
}

impl Context {
    /// An empty context: no transaction, driver-default options, a
    /// cancellation token that never fires.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the read-only mode for transactions begun under this context.
    /// Must be set before `run_in_tx`; has no effect on an already-open
    /// transaction.
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }

    /// Sets the isolation level for transactions begun under this context.
    /// Must be set before `run_in_tx`.
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = Some(isolation);
        self
    }

    /// Attaches a cancellation token. Operations taking this context race
    /// against the token and report [`Error::Cancelled`](crate::Error) when
    /// it fires first.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// True when a transaction is bound to this context.
    pub fn is_tx(&self) -> bool {
        self.tx.as_ref().is_some_and(|uow| uow.is_tx())
    }

    /// The transaction options in effect for this context. Defaults are
    /// driver-default isolation and `read_only = false`.
    pub fn tx_options(&self) -> TxOptions {
        TxOptions {
            isolation: self.isolation.unwrap_or_default(),
            read_only: self.read_only.unwrap_or(false),
        }
    }

    /// Resolves once the attached cancellation token fires. The default
    /// token never does.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn with_tx(&self, uow: Arc<Uow>) -> Self {
        let mut child = self.clone();
        child.tx = Some(uow);
        child
    }

    pub(crate) fn with_staging(&self, staging: Arc<Staging>) -> Self {
        let mut child = self.clone();
        child.staging = Some(staging);
        child
    }

    pub(crate) fn tx_binding(&self) -> Option<&Arc<Uow>> {
        self.tx.as_ref()
    }

    pub(crate) fn staging(&self) -> Option<&Arc<Staging>> {
        self.staging.as_ref()
    }
}
