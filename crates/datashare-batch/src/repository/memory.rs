use std::collections::HashMap;

use async_trait::async_trait;
use datashare_common::{
    error::{DatashareError, Result},
    time,
    types::User,
};
use tokio::sync::RwLock;

use super::{
    BatchSearchRepository, ResultSet, current_run_results, prepare_for_save, sort_newest_first,
    sort_oldest_first,
};
use crate::{
    index::DocumentMatch,
    types::{BatchSearch, BatchSearchResult, BatchState, QueryFailure, StateChange},
};

#[derive(Debug, Default)]
struct Tables {
    batches: HashMap<String, BatchSearch>,
    results: HashMap<String, Vec<ResultSet>>,
}

/// Process-local repository. Every operation runs under one lock, so each
/// call is trivially atomic.
#[derive(Debug, Default)]
pub struct MemoryBatchSearchRepository {
    tables: RwLock<Tables>,
}

impl MemoryBatchSearchRepository {
    pub fn new() -> Self {
        Self::default()
    }

    async fn select(&self, predicate: impl Fn(&BatchSearch) -> bool) -> Vec<BatchSearch> {
        self.tables
            .read()
            .await
            .batches
            .values()
            .filter(|batch| predicate(batch))
            .cloned()
            .collect()
    }
}

fn not_found(id: &str) -> DatashareError {
    DatashareError::NotFound(format!("batch search {id}"))
}

#[async_trait]
impl BatchSearchRepository for MemoryBatchSearchRepository {
    async fn save(&self, owner: &User, batch: BatchSearch) -> Result<BatchSearch> {
        let batch = prepare_for_save(owner, batch)?;
        let mut tables = self.tables.write().await;
        if tables.batches.contains_key(&batch.id) {
            return Err(DatashareError::Conflict(format!(
                "batch search {} already exists",
                batch.id
            )));
        }
        tables.batches.insert(batch.id.clone(), batch.clone());
        Ok(batch)
    }

    async fn get(&self, owner: &User) -> Result<Vec<BatchSearch>> {
        let mut batches = self.select(|batch| batch.owner == owner.id).await;
        sort_newest_first(&mut batches);
        Ok(batches)
    }

    async fn get_by_id(&self, owner: &User, id: &str) -> Result<Option<BatchSearch>> {
        Ok(self
            .tables
            .read()
            .await
            .batches
            .get(id)
            .filter(|batch| batch.owner == owner.id)
            .cloned())
    }

    async fn get_queued(&self) -> Result<Vec<BatchSearch>> {
        let mut batches = self.select(|batch| batch.state == BatchState::Queued).await;
        sort_oldest_first(&mut batches);
        Ok(batches)
    }

    async fn get_running(&self) -> Result<Vec<BatchSearch>> {
        let mut batches = self
            .select(|batch| batch.state == BatchState::Running)
            .await;
        sort_oldest_first(&mut batches);
        Ok(batches)
    }

    async fn set_state(&self, id: &str, change: StateChange) -> Result<BatchSearch> {
        let mut tables = self.tables.write().await;
        let batch = tables.batches.get_mut(id).ok_or_else(|| not_found(id))?;
        batch.apply(&change)?;
        Ok(batch.clone())
    }

    async fn heartbeat(&self, id: &str, worker: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        let batch = tables.batches.get_mut(id).ok_or_else(|| not_found(id))?;
        batch.ensure_claimed_by(worker)?;
        batch.heartbeat_at = Some(time::now());
        Ok(())
    }

    async fn record_query_failure(
        &self,
        id: &str,
        worker: &str,
        failure: QueryFailure,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        let batch = tables.batches.get_mut(id).ok_or_else(|| not_found(id))?;
        batch.ensure_claimed_by(worker)?;
        batch.ensure_query(failure.query_index, &failure.query)?;
        batch.query_failures.push(failure);
        Ok(())
    }

    async fn append_results(
        &self,
        id: &str,
        worker: &str,
        query_index: usize,
        query: &str,
        matches: Vec<DocumentMatch>,
    ) -> Result<usize> {
        let mut tables = self.tables.write().await;
        let Tables { batches, results } = &mut *tables;
        let batch = batches.get_mut(id).ok_or_else(|| not_found(id))?;
        batch.ensure_claimed_by(worker)?;
        batch.ensure_query(query_index, query)?;

        let sets = results.entry(id.to_string()).or_default();
        if sets
            .iter()
            .any(|set| set.run == batch.run && set.query_index == query_index)
        {
            return Err(DatashareError::Conflict(format!(
                "results of query {query_index} already written for batch search {id} run {}",
                batch.run
            )));
        }

        let rows = BatchSearchResult::from_matches(batch, query_index, query, matches);
        let count = rows.len();
        sets.push(ResultSet {
            batch_id: id.to_string(),
            run: batch.run,
            query_index,
            results: rows,
        });
        batch.nb_results = batch.nb_results.saturating_add(count as u64);
        Ok(count)
    }

    async fn get_results(
        &self,
        owner: &User,
        id: &str,
        from: usize,
        size: usize,
    ) -> Result<Vec<BatchSearchResult>> {
        let tables = self.tables.read().await;
        let batch = tables
            .batches
            .get(id)
            .filter(|batch| batch.owner == owner.id)
            .ok_or_else(|| not_found(id))?;
        let sets = tables.results.get(id).cloned().unwrap_or_default();
        Ok(current_run_results(batch, sets, from, size))
    }

    async fn delete(&self, owner: &User, id: &str) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let owned = tables
            .batches
            .get(id)
            .is_some_and(|batch| batch.owner == owner.id);
        if !owned {
            return Ok(false);
        }
        tables.batches.remove(id);
        tables.results.remove(id);
        Ok(true)
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.tables.read().await.batches.contains_key(id))
    }
}
