use sqlx::Row as _;

use pg_txkit::{Connection as _, Context, SqlValue, Uow};

use super::TestError;

/// Repository over the `numbers` table.
///
/// Oblivious to transactions: every query goes through `db_or_tx`, so the
/// same methods run autocommit or inside whichever transaction the context
/// carries.
pub struct NumberRepository {
    uow: Uow,
}

impl NumberRepository {
    pub fn new(uow: Uow) -> Self {
        Self { uow }
    }

    pub async fn insert(&self, ctx: &Context, n: i32) -> Result<(), TestError> {
        self.uow
            .db_or_tx(ctx)?
            .execute(ctx, "INSERT INTO numbers(n) VALUES ($1)", &[SqlValue::I32(n)])
            .await?;
        Ok(())
    }

    pub async fn count(&self, ctx: &Context) -> Result<i64, TestError> {
        let row = self
            .uow
            .db_or_tx(ctx)?
            .query_one(ctx, "SELECT COUNT(*) FROM numbers", &[])
            .await?;
        Ok(row.try_get(0).map_err(pg_txkit::Error::from)?)
    }
}
