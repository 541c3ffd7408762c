//! In-memory implementation of [`Storage`].
//!
//! Units live in a [`DashMap`]; every write to a unit happens while holding
//! that unit's entry lock, which serializes read-modify-write per unit. A
//! secondary index maps batch ids to their member unit ids.
//!
//! The store can be told to fail specific operations, which lets tests
//! exercise rollback and resilience paths without a database.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{Storage, check_metadata_patch};
use crate::batch::BatchId;
use crate::error::{Result, VolleyError};
use crate::unit::{
    AnyUnit, ERROR_KEY, Metadata, NewUnit, Pending, Unit, UnitData, UnitFilter, UnitId, UnitState,
};

#[derive(Default)]
struct Faults {
    inserts: bool,
    persist: HashSet<UnitId>,
    metadata: HashSet<UnitId>,
}

struct Inner {
    units: DashMap<UnitId, AnyUnit>,
    by_batch: DashMap<BatchId, Vec<UnitId>>,
    next_id: AtomicI64,
    faults: Mutex<Faults>,
}

/// Work unit store held entirely in process memory.
///
/// Cloning is cheap and clones share the same underlying data.
#[derive(Clone)]
pub struct InMemoryStorage {
    inner: Arc<Inner>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                units: DashMap::new(),
                by_batch: DashMap::new(),
                next_id: AtomicI64::new(1),
                faults: Mutex::new(Faults::default()),
            }),
        }
    }

    /// Number of stored units.
    pub fn len(&self) -> usize {
        self.inner.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.units.is_empty()
    }

    /// Make every subsequent `insert_units` call fail (or stop failing).
    pub fn inject_insert_failure(&self, fail: bool) {
        self.inner.faults.lock().inserts = fail;
    }

    /// Make every subsequent `persist` of this unit fail.
    pub fn inject_persist_failure(&self, id: UnitId) {
        self.inner.faults.lock().persist.insert(id);
    }

    /// Make every subsequent `merge_metadata` on this unit fail.
    pub fn inject_metadata_failure(&self, id: UnitId) {
        self.inner.faults.lock().metadata.insert(id);
    }

    /// Remove all injected failures.
    pub fn clear_faults(&self) {
        *self.inner.faults.lock() = Faults::default();
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    #[tracing::instrument(skip(self, units), fields(count = units.len()))]
    async fn insert_units(&self, units: Vec<NewUnit>) -> Result<Vec<Unit<Pending>>> {
        if self.inner.faults.lock().inserts {
            return Err(VolleyError::Service(anyhow!(
                "Failed to insert units: injected store failure"
            )));
        }

        let now = Utc::now();
        let created: Vec<Unit<Pending>> = units
            .into_iter()
            .map(|unit| Unit {
                state: Pending {},
                data: UnitData {
                    id: UnitId(self.inner.next_id.fetch_add(1, Ordering::SeqCst)),
                    title: unit.title,
                    description: unit.description,
                    kind: unit.kind,
                    deadline: unit.deadline,
                    expedited_reason: unit.expedited_reason,
                    terms: unit.terms,
                    batch_id: unit.batch_id,
                    metadata: unit.metadata,
                    created_at: now,
                    updated_at: now,
                },
            })
            .collect();

        for unit in &created {
            self.inner
                .units
                .insert(unit.data.id, AnyUnit::Pending(unit.clone()));
        }
        // Index last, so batch queries see the whole set or none of it.
        for unit in &created {
            if let Some(batch_id) = &unit.data.batch_id {
                self.inner
                    .by_batch
                    .entry(batch_id.clone())
                    .or_default()
                    .push(unit.data.id);
            }
        }

        tracing::debug!(count = created.len(), "Inserted units");
        Ok(created)
    }

    async fn get_unit(&self, id: UnitId) -> Result<AnyUnit> {
        self.inner
            .units
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(VolleyError::UnitNotFound(id))
    }

    async fn list_units(&self, filter: UnitFilter) -> Result<Vec<AnyUnit>> {
        let mut units: Vec<AnyUnit> = self
            .inner
            .units
            .iter()
            .filter(|entry| filter.matches(entry.value().data()))
            .map(|entry| entry.value().clone())
            .collect();
        units.sort_by_key(|u| u.id());
        Ok(units
            .into_iter()
            .skip(filter.skip)
            .take(filter.limit)
            .collect())
    }

    async fn batch_units(&self, batch_id: &BatchId) -> Result<Vec<AnyUnit>> {
        let ids = match self.inner.by_batch.get(batch_id) {
            Some(entry) => entry.value().clone(),
            None => return Ok(Vec::new()),
        };
        let mut units: Vec<AnyUnit> = ids
            .into_iter()
            .filter_map(|id| self.inner.units.get(&id).map(|e| e.value().clone()))
            .collect();
        units.sort_by_key(|u| u.id());
        Ok(units)
    }

    async fn persist<T: UnitState + Clone>(&self, unit: &Unit<T>) -> Result<()>
    where
        AnyUnit: From<Unit<T>>,
    {
        let id = unit.data.id;
        if self.inner.faults.lock().persist.contains(&id) {
            return Err(VolleyError::Service(anyhow!(
                "Failed to persist unit {}: injected store failure",
                id
            )));
        }

        let mut next = AnyUnit::from(unit.clone());
        let mut entry = self
            .inner
            .units
            .get_mut(&id)
            .ok_or(VolleyError::UnitNotFound(id))?;

        let current = entry.status();
        if !current.can_become(next.status()) {
            return Err(VolleyError::InvalidState(
                id,
                current.as_str().to_string(),
                next.status().as_str().to_string(),
            ));
        }

        let mut metadata = entry.data().metadata.clone();
        if let Some(error) = next.data().metadata.get(ERROR_KEY) {
            metadata.insert(ERROR_KEY.to_string(), error.clone());
        }
        let data = next.data_mut();
        data.metadata = metadata;
        data.updated_at = Utc::now();
        *entry = next;

        tracing::trace!(unit_id = %id, status = current.as_str(), "Persisted unit state");
        Ok(())
    }

    async fn merge_metadata(&self, id: UnitId, patch: Metadata) -> Result<()> {
        check_metadata_patch(id, &patch)?;
        if self.inner.faults.lock().metadata.contains(&id) {
            return Err(VolleyError::Service(anyhow!(
                "Failed to update metadata of unit {}: injected store failure",
                id
            )));
        }

        let mut entry = self
            .inner
            .units
            .get_mut(&id)
            .ok_or(VolleyError::UnitNotFound(id))?;
        let data = entry.data_mut();
        data.metadata.extend(patch);
        data.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_unit(&self, id: UnitId) -> Result<()> {
        let (_, unit) = self
            .inner
            .units
            .remove(&id)
            .ok_or(VolleyError::UnitNotFound(id))?;

        if let Some(batch_id) = &unit.data().batch_id {
            let now_empty = match self.inner.by_batch.get_mut(batch_id) {
                Some(mut ids) => {
                    ids.retain(|member| *member != id);
                    ids.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.inner.by_batch.remove_if(batch_id, |_, ids| ids.is_empty());
            }
        }
        Ok(())
    }
}
