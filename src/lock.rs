//! Postgres advisory locks scoped to the current transaction.
//!
//! Keys are either a single 64-bit integer or a pair of 32-bit integers;
//! string keys hash into those spaces. Locks acquired here use the
//! `pg_advisory_xact_lock` family, so the database releases them on commit
//! or rollback and re-acquisition within the same transaction always
//! succeeds.

use sqlx::Row as _;
use tokio::sync::oneshot;

use crate::connection::{Connection as _, SqlValue};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::middleware::SharedConn;
use crate::unit_of_work::Uow;

const LOCK_SINGLE: &str = "SELECT pg_advisory_xact_lock($1)";
const LOCK_PAIR: &str = "SELECT pg_advisory_xact_lock($1, $2)";
const TRY_LOCK_SINGLE: &str = "SELECT pg_try_advisory_xact_lock($1)";
const TRY_LOCK_PAIR: &str = "SELECT pg_try_advisory_xact_lock($1, $2)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyKind {
    Single(i64),
    Pair(i32, i32),
}

/// An advisory lock key. The variant decides which lock function is
/// issued: a single `bigint` or an `integer` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    kind: KeyKind,
    repr: String,
}

impl Key {
    pub fn from_i64(z: i64) -> Self {
        Self {
            kind: KeyKind::Single(z),
            repr: format!("Key({z})"),
        }
    }

    pub fn from_i32_pair(x: i32, y: i32) -> Self {
        Self {
            kind: KeyKind::Pair(x, y),
            repr: format!("Key({x}, {y})"),
        }
    }

    /// Hashes the string into the `bigint` key space.
    pub fn from_text(z: &str) -> Self {
        Self {
            kind: KeyKind::Single(int_hash64(z)),
            repr: format!("Key({z:?})"),
        }
    }

    /// Hashes each string into the `integer` key space.
    pub fn from_text_pair(x: &str, y: &str) -> Self {
        Self {
            kind: KeyKind::Pair(int_hash32(x), int_hash32(y)),
            repr: format!("Key({x:?}, {y:?})"),
        }
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.repr)
    }
}

const FNV_OFFSET32: u32 = 0x811c_9dc5;
const FNV_PRIME32: u32 = 0x0100_0193;
const FNV_OFFSET64: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME64: u64 = 0x0000_0100_0000_01b3;

/// FNV-1 32-bit hash.
pub fn hash32(key: &str) -> u32 {
    key.bytes().fold(FNV_OFFSET32, |hash, byte| {
        hash.wrapping_mul(FNV_PRIME32) ^ u32::from(byte)
    })
}

/// FNV-1 64-bit hash.
pub fn hash64(key: &str) -> u64 {
    key.bytes().fold(FNV_OFFSET64, |hash, byte| {
        hash.wrapping_mul(FNV_PRIME64) ^ u64::from(byte)
    })
}

/// FNV-1 hash of `key` shifted onto the signed 32-bit key space, so the
/// full unsigned range stays usable for `integer` lock keys.
pub fn int_hash32(key: &str) -> i32 {
    u32_to_i32(hash32(key))
}

/// FNV-1 hash of `key` shifted onto the signed 64-bit key space.
pub fn int_hash64(key: &str) -> i64 {
    u64_to_i64(hash64(key))
}

/// Order-preserving shift of the unsigned range onto the signed range:
/// `0` maps to `i32::MIN`, `u32::MAX` to `i32::MAX`.
pub fn u32_to_i32(u: u32) -> i32 {
    (u ^ (1 << 31)) as i32
}

/// Order-preserving shift of the unsigned range onto the signed range:
/// `0` maps to `i64::MIN`, `u64::MAX` to `i64::MAX`.
pub fn u64_to_i64(u: u64) -> i64 {
    (u ^ (1 << 63)) as i64
}

fn tx_conn(ctx: &Context, key: &Key) -> Result<SharedConn> {
    match ctx.tx_binding() {
        Some(bound) => bound.tx(ctx),
        None => Err(Error::LockOutsideTx(key.to_string())),
    }
}

/// Acquires the key, blocking until the holder's transaction ends or the
/// context is cancelled. The lock is released when the surrounding
/// transaction commits or rolls back.
///
/// Fails with [`Error::LockOutsideTx`] when `ctx` carries no transaction.
pub async fn lock(ctx: &Context, key: &Key) -> Result<()> {
    let conn = tx_conn(ctx, key)?;
    match key.kind {
        KeyKind::Single(z) => {
            conn.execute(ctx, LOCK_SINGLE, &[SqlValue::I64(z)]).await?;
        }
        KeyKind::Pair(x, y) => {
            conn.execute(ctx, LOCK_PAIR, &[SqlValue::I32(x), SqlValue::I32(y)])
                .await?;
        }
    }
    Ok(())
}

/// Attempts to acquire the key without blocking.
///
/// Fails with [`Error::AlreadyLocked`] when another transaction holds it;
/// within the same transaction the acquisition always succeeds again.
/// Fails with [`Error::LockOutsideTx`] when `ctx` carries no transaction.
pub async fn try_lock(ctx: &Context, key: &Key) -> Result<()> {
    let conn = tx_conn(ctx, key)?;
    let row = match key.kind {
        KeyKind::Single(z) => {
            conn.query_one(ctx, TRY_LOCK_SINGLE, &[SqlValue::I64(z)])
                .await?
        }
        KeyKind::Pair(x, y) => {
            conn.query_one(ctx, TRY_LOCK_PAIR, &[SqlValue::I32(x), SqlValue::I32(y)])
                .await?
        }
    };
    let acquired: bool = row.try_get(0).map_err(Error::Sqlx)?;
    if acquired {
        Ok(())
    } else {
        Err(Error::AlreadyLocked(key.to_string()))
    }
}

/// Background lock holder: a cross-process mutex for the lifetime of an
/// operation rather than of a single `run_in_tx` body.
///
/// Each acquisition spawns a worker that opens a fresh transaction, takes
/// the key, and parks until the caller's cancellation token fires; the
/// cancel is the release mechanism, rolling back the guard transaction.
/// Callers must cancel the token when done or the lock (and its
/// connection) is held until the pool shuts down.
pub struct Locker {
    db: Uow,
}

impl Locker {
    /// Wraps a pool-variant unit of work. A transaction-variant receiver
    /// is rejected with [`Error::UsedTxAsPool`]: the holder must be able
    /// to begin fresh transactions of its own.
    pub fn new(db: Uow) -> Result<Self> {
        if db.is_tx() {
            return Err(Error::UsedTxAsPool);
        }
        Ok(Self { db })
    }

    /// Acquires the key in a background transaction, blocking until the
    /// current holder releases it. Returns once the acquisition succeeds
    /// or fails; the lock is held until `ctx`'s token is cancelled.
    pub async fn lock(&self, ctx: &Context, key: Key) -> Result<()> {
        self.hold(ctx, key, true).await
    }

    /// Like [`lock`](Self::lock) but non-blocking: contention reports
    /// [`Error::AlreadyLocked`] and no transaction is left open.
    pub async fn try_lock(&self, ctx: &Context, key: Key) -> Result<()> {
        self.hold(ctx, key, false).await
    }

    async fn hold(&self, ctx: &Context, key: Key, blocking: bool) -> Result<()> {
        let (ack, acked) = oneshot::channel::<Result<()>>();
        let db = self.db.clone();
        // The worker gets its own context carrying only the caller's
        // cancellation token: any transaction bound to `ctx` must not be
        // reused for the guard transaction.
        let worker_ctx = Context::new().with_cancellation(ctx.cancellation_token());

        tokio::spawn(async move {
            let mut ack = Some(ack);
            let ack_slot = &mut ack;
            let res: Result<()> = db
                .run_in_tx(&worker_ctx, |tx_ctx| async move {
                    if blocking {
                        lock(&tx_ctx, &key).await?;
                    } else {
                        try_lock(&tx_ctx, &key).await?;
                    }
                    if let Some(ack) = ack_slot.take() {
                        let _ = ack.send(Ok(()));
                    }
                    // Park forever: the body must never resolve on its own,
                    // so the token firing can only be observed by
                    // `run_in_tx`'s cancellation branch, which rolls the
                    // guard transaction back.
                    std::future::pending::<()>().await;
                    Ok(())
                })
                .await;
            // A failed acquisition has already rolled back; report it.
            if let Err(err) = res {
                match ack.take() {
                    Some(ack) => {
                        let _ = ack.send(Err(err));
                    }
                    // Past the acknowledgement nobody is listening.
                    // Cancellation is the expected release outcome; anything
                    // else is a real failure and must stay visible.
                    None => {
                        if !matches!(err, Error::Cancelled) {
                            tracing::warn!(error = %err, "lock guard transaction failed after acquisition");
                        }
                    }
                }
            }
        });

        acked.await.unwrap_or(Err(Error::Cancelled))
    }
}
