//! Read/write pool routing for [`super::PostgresStorage`].
//!
//! Status transitions, inserts and metadata merges always go to
//! [`PoolProvider::write`]. Listings and batch status lookups go to
//! [`PoolProvider::read`], which may be a replica.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Source of the connection pools used by the store.
///
/// # Example
///
/// ```ignore
/// use volley::PoolProvider;
/// use sqlx::PgPool;
///
/// #[derive(Clone)]
/// struct Pools {
///     primary: PgPool,
///     replica: Option<PgPool>,
/// }
///
/// impl PoolProvider for Pools {
///     fn read(&self) -> &PgPool {
///         self.replica.as_ref().unwrap_or(&self.primary)
///     }
///
///     fn write(&self) -> &PgPool {
///         &self.primary
///     }
/// }
/// ```
pub trait PoolProvider: Clone + Send + Sync + 'static {
    /// Pool for queries that tolerate replica lag.
    fn read(&self) -> &PgPool;

    /// Pool for writes and for reads that must see the caller's own writes.
    fn write(&self) -> &PgPool;
}

/// A single pool serves both reads and writes.
impl PoolProvider for PgPool {
    fn read(&self) -> &PgPool {
        self
    }

    fn write(&self) -> &PgPool {
        self
    }
}

/// Pools for tests where the read side refuses writes.
///
/// The replica connects to the same database with
/// `default_transaction_read_only = on`, so a write routed through
/// [`PoolProvider::read`] fails instead of silently succeeding.
#[derive(Clone, Debug)]
pub struct TestDbPools {
    primary: PgPool,
    replica: PgPool,
}

impl TestDbPools {
    pub async fn new(pool: PgPool) -> Result<Self, sqlx::Error> {
        let replica = PgPoolOptions::new()
            .max_connections(pool.options().get_max_connections())
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("SET default_transaction_read_only = on")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect_with(pool.connect_options().as_ref().clone())
            .await?;

        Ok(Self {
            primary: pool,
            replica,
        })
    }
}

impl PoolProvider for TestDbPools {
    fn read(&self) -> &PgPool {
        &self.replica
    }

    fn write(&self) -> &PgPool {
        &self.primary
    }
}
