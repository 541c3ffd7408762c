//! PostgreSQL implementation of [`Storage`].
//!
//! Units live in the `work_units` table. Status writes are single `UPDATE`
//! statements guarded by the status rank, so a stale writer can never move a
//! unit backwards, and metadata merges use `jsonb ||` so concurrent merges to
//! the same unit never lose keys.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use super::{Storage, check_metadata_patch};
use crate::batch::BatchId;
use crate::error::{Result, VolleyError};
use crate::unit::{
    AnyUnit, Completed, ERROR_KEY, Failed, InProgress, Metadata, NewUnit, Pending, Terms, Unit,
    UnitData, UnitFilter, UnitId, UnitKind, UnitState, UnitStatus,
};

mod pool_provider;

pub use pool_provider::{PoolProvider, TestDbPools};

const UNIT_COLUMNS: &str = "id, title, description, kind, status, terms, result, deadline, \
     expedited_reason, batch_id, metadata, started_at, completed_at, failed_at, created_at, updated_at";

/// PostgreSQL implementation of the Storage trait.
///
/// Reads that must observe the caller's own writes (loading a unit before
/// transitioning it) go to the write pool; listings and batch lookups may be
/// served by a replica.
///
/// # Example
/// ```ignore
/// use volley::{PostgresStorage, Scheduler, SchedulerConfig, Addition, BatchManager};
///
/// let pool = PgPool::connect("postgresql://localhost/volley").await?;
/// volley::migrator().run(&pool).await?;
///
/// let storage = Arc::new(PostgresStorage::new(pool));
/// let scheduler = Scheduler::new(storage, Arc::new(Addition), Handle::current(), SchedulerConfig::default());
/// let manager = BatchManager::new(scheduler);
/// ```
#[derive(Clone)]
pub struct PostgresStorage<P: PoolProvider = PgPool> {
    pools: P,
}

impl<P: PoolProvider> PostgresStorage<P> {
    pub fn new(pools: P) -> Self {
        Self { pools }
    }

    /// Get the pool provider.
    pub fn pools(&self) -> &P {
        &self.pools
    }

    /// Explain a guarded update that touched no rows.
    async fn rejected_update(&self, id: UnitId, next: UnitStatus) -> VolleyError {
        let current = sqlx::query("SELECT status FROM work_units WHERE id = $1")
            .bind(id.0)
            .fetch_optional(self.pools.write())
            .await;

        match current {
            Ok(None) => VolleyError::UnitNotFound(id),
            Ok(Some(row)) => match row.try_get::<String, _>("status") {
                Ok(status) => {
                    VolleyError::InvalidState(id, status, next.as_str().to_string())
                }
                Err(e) => VolleyError::Service(anyhow!("Failed to read unit status: {}", e)),
            },
            Err(e) => VolleyError::Service(anyhow!("Failed to read unit status: {}", e)),
        }
    }
}

/// Column values written by a status transition.
struct StatusWrite {
    status: UnitStatus,
    result: Option<i64>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl From<&AnyUnit> for StatusWrite {
    fn from(unit: &AnyUnit) -> Self {
        let mut write = StatusWrite {
            status: unit.status(),
            result: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            error: None,
        };
        match unit {
            AnyUnit::Pending(_) => {}
            AnyUnit::InProgress(u) => write.started_at = Some(u.state.started_at),
            AnyUnit::Completed(u) => {
                write.result = Some(u.state.result);
                write.started_at = Some(u.state.started_at);
                write.completed_at = Some(u.state.completed_at);
            }
            AnyUnit::Failed(u) => {
                write.failed_at = Some(u.state.failed_at);
                write.error = Some(u.state.error.clone());
            }
        }
        write
    }
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| VolleyError::Service(anyhow!("Failed to read column {}: {}", name, e)))
}

fn required<T>(value: Option<T>, id: i64, name: &str) -> Result<T> {
    value.ok_or_else(|| {
        VolleyError::Service(anyhow!("Unit {} is missing {} for its status", id, name))
    })
}

fn unit_from_row(row: &PgRow) -> Result<AnyUnit> {
    let id: i64 = column(row, "id")?;
    let kind: String = column(row, "kind")?;
    let status: String = column(row, "status")?;
    let Json(terms): Json<Terms> = column(row, "terms")?;
    let Json(metadata): Json<Metadata> = column(row, "metadata")?;
    let batch_id: Option<String> = column(row, "batch_id")?;

    let data = UnitData {
        id: UnitId(id),
        title: column(row, "title")?,
        description: column(row, "description")?,
        kind: kind
            .parse::<UnitKind>()
            .map_err(|e| VolleyError::Service(anyhow!(e)))?,
        deadline: column(row, "deadline")?,
        expedited_reason: column(row, "expedited_reason")?,
        terms,
        batch_id: batch_id.map(BatchId::from),
        metadata,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
    };

    let started_at: Option<DateTime<Utc>> = column(row, "started_at")?;
    let status = status
        .parse::<UnitStatus>()
        .map_err(|e| VolleyError::Service(anyhow!(e)))?;

    Ok(match status {
        UnitStatus::Pending => AnyUnit::Pending(Unit {
            state: Pending {},
            data,
        }),
        UnitStatus::InProgress => AnyUnit::InProgress(Unit {
            state: InProgress {
                started_at: required(started_at, id, "started_at")?,
            },
            data,
        }),
        UnitStatus::Completed => {
            let completed_at = required(column(row, "completed_at")?, id, "completed_at")?;
            AnyUnit::Completed(Unit {
                state: Completed {
                    result: required(column(row, "result")?, id, "result")?,
                    started_at: started_at.unwrap_or(completed_at),
                    completed_at,
                },
                data,
            })
        }
        UnitStatus::Failed => {
            let error = data.error().unwrap_or_default().to_string();
            AnyUnit::Failed(Unit {
                state: Failed {
                    error,
                    failed_at: required(column(row, "failed_at")?, id, "failed_at")?,
                },
                data,
            })
        }
    })
}

#[async_trait]
impl<P: PoolProvider> Storage for PostgresStorage<P> {
    #[tracing::instrument(skip(self, units), fields(count = units.len()))]
    async fn insert_units(&self, units: Vec<NewUnit>) -> Result<Vec<Unit<Pending>>> {
        let mut tx = self
            .pools
            .write()
            .begin()
            .await
            .map_err(|e| VolleyError::Service(anyhow!("Failed to begin transaction: {}", e)))?;

        let mut created = Vec::with_capacity(units.len());
        for unit in units {
            let row = sqlx::query(
                r#"
                INSERT INTO work_units (
                    title, description, kind, terms, deadline, expedited_reason, batch_id, metadata
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                RETURNING id, created_at, updated_at
                "#,
            )
            .bind(&unit.title)
            .bind(&unit.description)
            .bind(unit.kind.as_str())
            .bind(Json(unit.terms))
            .bind(unit.deadline)
            .bind(&unit.expedited_reason)
            .bind(unit.batch_id.as_ref().map(|b| b.as_str().to_string()))
            .bind(Json(&unit.metadata))
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| VolleyError::Service(anyhow!("Failed to insert unit: {}", e)))?;

            created.push(Unit {
                state: Pending {},
                data: UnitData {
                    id: UnitId(column(&row, "id")?),
                    title: unit.title,
                    description: unit.description,
                    kind: unit.kind,
                    deadline: unit.deadline,
                    expedited_reason: unit.expedited_reason,
                    terms: unit.terms,
                    batch_id: unit.batch_id,
                    metadata: unit.metadata,
                    created_at: column(&row, "created_at")?,
                    updated_at: column(&row, "updated_at")?,
                },
            });
        }

        tx.commit()
            .await
            .map_err(|e| VolleyError::Service(anyhow!("Failed to commit units: {}", e)))?;

        tracing::debug!(count = created.len(), "Inserted units");
        Ok(created)
    }

    async fn get_unit(&self, id: UnitId) -> Result<AnyUnit> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM work_units WHERE id = $1",
            UNIT_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(self.pools.write())
        .await
        .map_err(|e| VolleyError::Service(anyhow!("Failed to fetch unit: {}", e)))?
        .ok_or(VolleyError::UnitNotFound(id))?;

        unit_from_row(&row)
    }

    #[tracing::instrument(skip(self, filter), fields(kind = ?filter.kind, batch_id = ?filter.batch_id, skip = filter.skip, limit = filter.limit))]
    async fn list_units(&self, filter: UnitFilter) -> Result<Vec<AnyUnit>> {
        let mut query: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM work_units WHERE TRUE", UNIT_COLUMNS));

        if let Some(kind) = filter.kind {
            query.push(" AND kind = ").push_bind(kind.as_str());
        }
        if let Some(batch_id) = filter.batch_id {
            query.push(" AND batch_id = ").push_bind(batch_id.0);
        }
        query
            .push(" ORDER BY id OFFSET ")
            .push_bind(filter.skip as i64)
            .push(" LIMIT ")
            .push_bind(filter.limit as i64);

        let rows = query
            .build()
            .fetch_all(self.pools.read())
            .await
            .map_err(|e| VolleyError::Service(anyhow!("Failed to list units: {}", e)))?;

        rows.iter().map(unit_from_row).collect()
    }

    async fn batch_units(&self, batch_id: &BatchId) -> Result<Vec<AnyUnit>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM work_units WHERE batch_id = $1 ORDER BY id",
            UNIT_COLUMNS
        ))
        .bind(batch_id.as_str())
        .fetch_all(self.pools.read())
        .await
        .map_err(|e| VolleyError::Service(anyhow!("Failed to fetch batch units: {}", e)))?;

        rows.iter().map(unit_from_row).collect()
    }

    async fn persist<T: UnitState + Clone>(&self, unit: &Unit<T>) -> Result<()>
    where
        AnyUnit: From<Unit<T>>,
    {
        let id = unit.data.id;
        let write = StatusWrite::from(&AnyUnit::from(unit.clone()));

        // A unit may be rewritten with its current status or moved to a higher rank.
        let rows_affected = sqlx::query(
            r#"
            UPDATE work_units SET
                status = $2,
                result = $3,
                started_at = COALESCE($4, started_at),
                completed_at = $5,
                failed_at = $6,
                metadata = CASE
                    WHEN $7::TEXT IS NULL THEN metadata
                    ELSE metadata || jsonb_build_object($8::TEXT, $7::TEXT)
                END,
                updated_at = NOW()
            WHERE id = $1
              AND (
                status = $2
                OR (CASE status WHEN 'pending' THEN 0 WHEN 'in_progress' THEN 1 ELSE 2 END) < $9
              )
            "#,
        )
        .bind(id.0)
        .bind(write.status.as_str())
        .bind(write.result)
        .bind(write.started_at)
        .bind(write.completed_at)
        .bind(write.failed_at)
        .bind(write.error)
        .bind(ERROR_KEY)
        .bind(write.status.rank())
        .execute(self.pools.write())
        .await
        .map_err(|e| VolleyError::Service(anyhow!("Failed to update unit: {}", e)))?
        .rows_affected();

        if rows_affected == 0 {
            return Err(self.rejected_update(id, write.status).await);
        }

        tracing::trace!(unit_id = %id, status = write.status.as_str(), "Persisted unit state");
        Ok(())
    }

    async fn merge_metadata(&self, id: UnitId, patch: Metadata) -> Result<()> {
        check_metadata_patch(id, &patch)?;

        let rows_affected = sqlx::query(
            "UPDATE work_units SET metadata = metadata || $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id.0)
        .bind(Json(patch))
        .execute(self.pools.write())
        .await
        .map_err(|e| VolleyError::Service(anyhow!("Failed to update unit metadata: {}", e)))?
        .rows_affected();

        if rows_affected == 0 {
            return Err(VolleyError::UnitNotFound(id));
        }
        Ok(())
    }

    async fn delete_unit(&self, id: UnitId) -> Result<()> {
        let rows_affected = sqlx::query("DELETE FROM work_units WHERE id = $1")
            .bind(id.0)
            .execute(self.pools.write())
            .await
            .map_err(|e| VolleyError::Service(anyhow!("Failed to delete unit: {}", e)))?
            .rows_affected();

        if rows_affected == 0 {
            return Err(VolleyError::UnitNotFound(id));
        }
        Ok(())
    }
}
