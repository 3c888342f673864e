mod common;

use std::sync::Arc;

use parking_lot::Mutex;
use pg_txkit::{
    with_logger, Connection, Context, Error, IsolationLevel, Middleware, QueryLogger, RowStream,
    SharedConn, SqlValue, Uow,
};
use sqlx::postgres::PgRow;
use sqlx::Row as _;

use common::{
    count_rows, create_numbers_table, drop_numbers_table, setup_pool, NumberRepository, TestError,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial_test::serial]
async fn test_rollback_on_body_error() {
    let pool = setup_pool().await;
    create_numbers_table(&pool).await;

    let uow = Uow::new(pool.clone());
    let repo = NumberRepository::new(uow.clone());
    let ctx = Context::new();

    let err = uow
        .run_in_tx::<(), TestError, _, _>(&ctx, |tx_ctx| {
            let repo = NumberRepository::new(uow.clone());
            async move {
                repo.insert(&tx_ctx, 42).await?;
                assert_eq!(repo.count(&tx_ctx).await?, 1);

                Err(TestError::Intentional)
            }
        })
        .await
        .expect_err("body error must surface");

    assert!(matches!(err, TestError::Intentional));
    assert_eq!(count_rows(&pool, "numbers").await, 0);
    assert_eq!(repo.count(&ctx).await.unwrap(), 0);

    drop_numbers_table(&pool).await;
    pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial_test::serial]
async fn test_rollback_on_body_panic() {
    let pool = setup_pool().await;
    create_numbers_table(&pool).await;

    let uow = Uow::new(pool.clone());
    let ctx = Context::new();

    let joined = tokio::spawn({
        let uow = uow.clone();
        let ctx = ctx.clone();
        async move {
            uow.run_in_tx::<(), Error, _, _>(&ctx, |tx_ctx| {
                let uow = uow.clone();
                async move {
                    uow.db_or_tx(&tx_ctx)?
                        .execute(
                            &tx_ctx,
                            "INSERT INTO numbers(n) VALUES ($1)",
                            &[SqlValue::I32(42)],
                        )
                        .await?;

                    panic!("server error");
                }
            })
            .await
        }
    })
    .await;

    let join_err = joined.expect_err("panic must propagate out of run_in_tx");
    assert!(join_err.is_panic());
    assert_eq!(count_rows(&pool, "numbers").await, 0);

    drop_numbers_table(&pool).await;
    pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial_test::serial]
async fn test_commit_persists_rows() {
    let pool = setup_pool().await;
    create_numbers_table(&pool).await;

    let uow = Uow::new(pool.clone());
    let ctx = Context::new();

    uow.run_in_tx::<(), TestError, _, _>(&ctx, |tx_ctx| {
        let repo = NumberRepository::new(uow.clone());
        async move {
            repo.insert(&tx_ctx, 1).await?;
            repo.insert(&tx_ctx, 2).await?;
            Ok(())
        }
    })
    .await
    .expect("commit should succeed");

    assert_eq!(count_rows(&pool, "numbers").await, 2);

    drop_numbers_table(&pool).await;
    pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial_test::serial]
async fn test_reentrant_run_in_tx_shares_the_outer_transaction() {
    let pool = setup_pool().await;
    create_numbers_table(&pool).await;

    let uow = Uow::new(pool.clone());
    let ctx = Context::new();

    // The inner error rolls back the single shared transaction: the inner
    // call must not have committed anything on its own.
    let err = uow
        .run_in_tx::<(), TestError, _, _>(&ctx, |ctx1| {
            let uow = uow.clone();
            async move {
                uow.clone()
                    .run_in_tx::<(), TestError, _, _>(&ctx1, |ctx2| {
                        let repo = NumberRepository::new(uow.clone());
                        async move {
                            repo.insert(&ctx2, 1).await?;
                            Err(TestError::Intentional)
                        }
                    })
                    .await
            }
        })
        .await
        .expect_err("inner error must reach the outer caller");

    assert!(matches!(err, TestError::Intentional));
    assert_eq!(count_rows(&pool, "numbers").await, 0);

    // And on success the outermost commit publishes the inner work.
    uow.run_in_tx::<(), TestError, _, _>(&ctx, |ctx1| {
        let uow = uow.clone();
        async move {
            uow.clone()
                .run_in_tx::<(), TestError, _, _>(&ctx1, |ctx2| {
                    let repo = NumberRepository::new(uow.clone());
                    async move { repo.insert(&ctx2, 1).await }
                })
                .await
        }
    })
    .await
    .expect("nested success should commit once at the outermost level");

    assert_eq!(count_rows(&pool, "numbers").await, 1);

    drop_numbers_table(&pool).await;
    pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial_test::serial]
async fn test_db_or_tx_routes_to_the_bound_transaction() {
    let pool = setup_pool().await;
    create_numbers_table(&pool).await;

    let uow = Uow::new(pool.clone());
    let ctx = Context::new();

    let err = uow
        .run_in_tx::<(), TestError, _, _>(&ctx, |tx_ctx| {
            let uow = uow.clone();
            let pool = pool.clone();
            async move {
                uow.db_or_tx(&tx_ctx)?
                    .execute(
                        &tx_ctx,
                        "INSERT INTO numbers(n) VALUES ($1)",
                        &[SqlValue::I32(7)],
                    )
                    .await?;

                // Visible through the transaction handle...
                let row = uow
                    .tx(&tx_ctx)?
                    .query_one(&tx_ctx, "SELECT COUNT(*) FROM numbers", &[])
                    .await?;
                let in_tx: i64 = row.try_get(0).map_err(pg_txkit::Error::from)?;
                assert_eq!(in_tx, 1);

                // ...but not from outside: the write never fell through to
                // autocommit.
                let outside: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM numbers")
                    .fetch_one(&pool)
                    .await
                    .map_err(pg_txkit::Error::from)?;
                assert_eq!(outside, 0);

                Err(TestError::Rollback)
            }
        })
        .await
        .expect_err("body requested a rollback");

    assert!(matches!(err, TestError::Rollback));
    assert_eq!(count_rows(&pool, "numbers").await, 0);

    drop_numbers_table(&pool).await;
    pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial_test::serial]
async fn test_usage_errors() {
    let pool = setup_pool().await;

    let uow = Uow::new(pool.clone());
    let ctx = Context::new();

    assert!(matches!(uow.tx(&ctx), Err(Error::NotInTransaction)));

    let tx_uow = uow.begin_tx(&ctx).await.expect("begin should succeed");
    assert!(tx_uow.is_tx());
    assert!(matches!(tx_uow.db(), Err(Error::UsedTxAsPool)));

    // Without a parent binding in the context, a transaction-variant unit
    // of work cannot begin another transaction.
    let err = tx_uow
        .run_in_tx::<(), Error, _, _>(&ctx, |_| async { Ok(()) })
        .await
        .expect_err("nested begin must be rejected");
    assert!(matches!(err, Error::NestedTransaction));

    let err = tx_uow.begin_tx(&ctx).await.err();
    assert!(matches!(err, Some(Error::NestedTransaction)));

    tx_uow.rollback().await.expect("rollback should succeed");
    // The handle is consumed; later commits and rollbacks are no-ops.
    tx_uow.commit().await.expect("second completion is a no-op");

    pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial_test::serial]
async fn test_read_only_transaction_rejects_writes() {
    let pool = setup_pool().await;
    create_numbers_table(&pool).await;

    let uow = Uow::new(pool.clone());
    let ctx = Context::new()
        .with_read_only(true)
        .with_isolation(IsolationLevel::RepeatableRead);

    let err = uow
        .run_in_tx::<(), TestError, _, _>(&ctx, |tx_ctx| {
            let repo = NumberRepository::new(uow.clone());
            async move { repo.insert(&tx_ctx, 1).await }
        })
        .await
        .expect_err("insert in a read-only transaction must fail");

    assert!(matches!(err, TestError::Db(Error::Sqlx(_))));
    assert_eq!(count_rows(&pool, "numbers").await, 0);

    drop_numbers_table(&pool).await;
    pool.close().await;
}

struct Probe {
    label: &'static str,
    entries: Arc<Mutex<Vec<String>>>,
    inner: SharedConn,
}

fn probe(label: &'static str, entries: Arc<Mutex<Vec<String>>>) -> Middleware {
    Arc::new(move |conn| {
        Arc::new(Probe {
            label,
            entries: entries.clone(),
            inner: conn,
        })
    })
}

#[async_trait::async_trait]
impl Connection for Probe {
    async fn execute(
        &self,
        ctx: &Context,
        sql: &str,
        args: &[SqlValue],
    ) -> pg_txkit::Result<u64> {
        self.entries.lock().push(format!("enter {}", self.label));
        let result = self.inner.execute(ctx, sql, args).await;
        self.entries.lock().push(format!("exit {}", self.label));
        result
    }

    async fn query_one(
        &self,
        ctx: &Context,
        sql: &str,
        args: &[SqlValue],
    ) -> pg_txkit::Result<PgRow> {
        self.inner.query_one(ctx, sql, args).await
    }

    async fn query_many(
        &self,
        ctx: &Context,
        sql: &str,
        args: &[SqlValue],
    ) -> pg_txkit::Result<RowStream> {
        self.inner.query_many(ctx, sql, args).await
    }

    async fn prepare(
        &self,
        ctx: &Context,
        sql: &str,
    ) -> pg_txkit::Result<pg_txkit::PreparedStatement> {
        self.inner.prepare(ctx, sql).await
    }
}

struct RecordingSink(Mutex<Vec<(&'static str, String)>>);

impl QueryLogger for RecordingSink {
    fn log(&self, method: &'static str, sql: &str, _args: &[SqlValue]) {
        self.0.lock().push((method, sql.to_owned()));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial_test::serial]
async fn test_middleware_applies_to_pool_and_derived_transactions() {
    let pool = setup_pool().await;
    create_numbers_table(&pool).await;

    let entries = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
    let uow = Uow::with_middlewares(
        pool.clone(),
        vec![
            probe("a", entries.clone()),
            probe("b", entries.clone()),
            with_logger(sink.clone()),
        ],
    );
    let ctx = Context::new();

    // Autocommit dispatch through the pool handle.
    uow.db()
        .unwrap()
        .execute(&ctx, "INSERT INTO numbers(n) VALUES ($1)", &[SqlValue::I32(1)])
        .await
        .unwrap();

    assert_eq!(
        *entries.lock(),
        vec!["enter a", "enter b", "exit b", "exit a"]
    );
    entries.lock().clear();

    // The same chain wraps the transaction handle inside run_in_tx.
    uow.run_in_tx::<(), Error, _, _>(&ctx, |tx_ctx| {
        let uow = uow.clone();
        async move {
            uow.db_or_tx(&tx_ctx)?
                .execute(
                    &tx_ctx,
                    "INSERT INTO numbers(n) VALUES ($1)",
                    &[SqlValue::I32(2)],
                )
                .await?;
            Ok(())
        }
    })
    .await
    .unwrap();

    assert_eq!(
        *entries.lock(),
        vec!["enter a", "enter b", "exit b", "exit a"]
    );
    let logged = sink.0.lock();
    assert_eq!(logged.len(), 2);
    assert!(logged
        .iter()
        .all(|(method, sql)| *method == "execute" && sql.starts_with("INSERT INTO numbers")));

    drop_numbers_table(&pool).await;
    pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial_test::serial]
async fn test_query_many_and_prepared_statements() {
    let pool = setup_pool().await;
    create_numbers_table(&pool).await;

    let uow = Uow::new(pool.clone());
    let ctx = Context::new();

    let conn = uow.db().unwrap();
    let insert = conn
        .prepare(&ctx, "INSERT INTO numbers(n) VALUES ($1)")
        .await
        .unwrap();
    for n in [3, 1, 2] {
        insert.execute(&ctx, &[SqlValue::I32(n)]).await.unwrap();
    }

    let mut stream = conn
        .query_many(&ctx, "SELECT n FROM numbers ORDER BY n", &[])
        .await
        .unwrap();

    use futures::TryStreamExt as _;
    let mut seen = Vec::new();
    while let Some(row) = stream.try_next().await.unwrap() {
        seen.push(row.try_get::<i32, _>(0).unwrap());
    }
    assert_eq!(seen, vec![1, 2, 3]);

    drop_numbers_table(&pool).await;
    pool.close().await;
}
