pub mod fs;
pub mod memory;

use async_trait::async_trait;
use datashare_common::{error::Result, types::User};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    index::DocumentMatch,
    types::{BatchSearch, BatchSearchResult, QueryFailure, StateChange},
};

/// Persistence contract for batch searches and their results.
///
/// Multi-step writes (a batch with its queries, one query's result set) are
/// all-or-nothing: readers never observe a partial write. `set_state` is a
/// compare-and-set on the stored state, which makes the QUEUED -> RUNNING
/// claim the only serialization point between workers.
#[async_trait]
pub trait BatchSearchRepository: Send + Sync {
    async fn save(&self, owner: &User, batch: BatchSearch) -> Result<BatchSearch>;
    /// Batches of `owner`, newest first.
    async fn get(&self, owner: &User) -> Result<Vec<BatchSearch>>;
    async fn get_by_id(&self, owner: &User, id: &str) -> Result<Option<BatchSearch>>;
    /// QUEUED batches of every owner, oldest first.
    async fn get_queued(&self) -> Result<Vec<BatchSearch>>;
    async fn get_running(&self) -> Result<Vec<BatchSearch>>;
    async fn set_state(&self, id: &str, change: StateChange) -> Result<BatchSearch>;
    /// Run writes (`heartbeat`, `record_query_failure`, `append_results`)
    /// fail with `InvalidTransition` unless `worker` holds the claim.
    async fn heartbeat(&self, id: &str, worker: &str) -> Result<()>;
    async fn record_query_failure(
        &self,
        id: &str,
        worker: &str,
        failure: QueryFailure,
    ) -> Result<()>;
    /// Appends the result set of one query to the current run; returns the number of results.
    async fn append_results(
        &self,
        id: &str,
        worker: &str,
        query_index: usize,
        query: &str,
        matches: Vec<DocumentMatch>,
    ) -> Result<usize>;
    /// Results of the current run in query order, then rank order.
    async fn get_results(
        &self,
        owner: &User,
        id: &str,
        from: usize,
        size: usize,
    ) -> Result<Vec<BatchSearchResult>>;
    /// Removes the batch and its results. Running workers stop at their next query.
    async fn delete(&self, owner: &User, id: &str) -> Result<bool>;
    async fn exists(&self, id: &str) -> Result<bool>;
}

/// Unit of result persistence: everything one query produced during one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSet {
    pub batch_id: String,
    pub run: u32,
    pub query_index: usize,
    pub results: Vec<BatchSearchResult>,
}

pub(crate) fn prepare_for_save(owner: &User, mut batch: BatchSearch) -> Result<BatchSearch> {
    if batch.id.is_empty() {
        batch.id = Uuid::new_v4().to_string();
    }
    batch.validate()?;
    batch.owner = owner.id.clone();
    Ok(batch)
}

pub(crate) fn sort_newest_first(batches: &mut [BatchSearch]) {
    batches.sort_by(|left, right| {
        right
            .created_at
            .cmp(&left.created_at)
            .then_with(|| left.id.cmp(&right.id))
    });
}

pub(crate) fn sort_oldest_first(batches: &mut [BatchSearch]) {
    batches.sort_by(|left, right| {
        left.created_at
            .cmp(&right.created_at)
            .then_with(|| left.id.cmp(&right.id))
    });
}

pub(crate) fn current_run_results(
    batch: &BatchSearch,
    mut sets: Vec<ResultSet>,
    from: usize,
    size: usize,
) -> Vec<BatchSearchResult> {
    sets.retain(|set| set.run == batch.run);
    sets.sort_by_key(|set| set.query_index);
    sets.into_iter()
        .flat_map(|set| set.results)
        .skip(from)
        .take(size)
        .collect()
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every repository backend must share.

    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use datashare_common::{
        error::DatashareError,
        types::{Project, User},
    };

    use super::BatchSearchRepository;
    use crate::{
        index::DocumentMatch,
        types::{BatchSearch, BatchState, QueryFailure, StateChange},
    };

    pub fn batch(name: &str, queries: &[&str]) -> BatchSearch {
        BatchSearch::new(
            Project::new("prj"),
            name,
            format!("{name} description"),
            queries.iter().map(|query| query.to_string()).collect(),
        )
    }

    pub fn document(id: &str) -> DocumentMatch {
        DocumentMatch {
            id: id.to_string(),
            root_id: id.to_string(),
            path: format!("/data/{id}.txt"),
            content_type: Some("text/plain".to_string()),
            content_length: 42,
            score: 1.0,
        }
    }

    fn claim(worker: &str) -> StateChange {
        StateChange::Claim {
            worker: worker.to_string(),
        }
    }

    pub async fn save_and_list_newest_first(repository: &dyn BatchSearchRepository) {
        let now = Utc::now();
        let first = BatchSearch::with_created_at(
            Project::new("prj"),
            "name1",
            "description1",
            vec!["q1".to_string(), "q2".to_string()],
            now,
        );
        let second = BatchSearch::with_created_at(
            Project::new("prj"),
            "name2",
            "description2",
            vec!["q3".to_string(), "q4".to_string()],
            now + Duration::seconds(1_000_000),
        );
        repository.save(&User::local(), first).await.unwrap();
        repository.save(&User::local(), second).await.unwrap();
        repository
            .save(&User::new("other"), batch("foreign", &["q5"]))
            .await
            .unwrap();

        let batches = repository.get(&User::local()).await.unwrap();

        let names: Vec<&str> = batches.iter().map(|batch| batch.name.as_str()).collect();
        assert_eq!(names, vec!["name2", "name1"]);
        assert_eq!(batches[0].description, "description2");
        assert_eq!(batches[0].queries, vec!["q3", "q4"]);
        assert_eq!(batches[1].queries, vec!["q1", "q2"]);
        assert!(batches.iter().all(|batch| batch.owner == "local"));
        assert!(batches.iter().all(|batch| !batch.id.is_empty()));
    }

    pub async fn save_rejects_duplicate_id(repository: &dyn BatchSearchRepository) {
        repository
            .save(&User::local(), batch("a", &["q"]).with_id("dup"))
            .await
            .unwrap();

        let err = repository
            .save(&User::local(), batch("b", &["q"]).with_id("dup"))
            .await;

        assert!(matches!(err, Err(DatashareError::Conflict(_))));
        let batches = repository.get(&User::local()).await.unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].name, "a");
    }

    pub async fn save_rejects_empty_queries(repository: &dyn BatchSearchRepository) {
        let err = repository.save(&User::local(), batch("empty", &[])).await;

        assert!(matches!(err, Err(DatashareError::InvalidArgument(_))));
        assert!(repository.get(&User::local()).await.unwrap().is_empty());
    }

    pub async fn queued_excludes_other_states(repository: &dyn BatchSearchRepository) {
        let now = Utc::now();
        for (offset, (id, state)) in [
            ("queued-late", BatchState::Queued),
            ("running", BatchState::Running),
            ("success", BatchState::Success),
            ("failure", BatchState::Failure),
        ]
        .into_iter()
        .enumerate()
        {
            let batch = BatchSearch::with_created_at(
                Project::new("prj"),
                id,
                "",
                vec!["q".to_string()],
                now + Duration::seconds(offset as i64 + 10),
            )
            .with_id(id)
            .with_state(state);
            repository.save(&User::local(), batch).await.unwrap();
        }
        let early = BatchSearch::with_created_at(
            Project::new("prj"),
            "queued-early",
            "",
            vec!["q".to_string()],
            now,
        )
        .with_id("queued-early");
        repository.save(&User::new("other"), early).await.unwrap();

        let queued = repository.get_queued().await.unwrap();

        let ids: Vec<&str> = queued.iter().map(|batch| batch.id.as_str()).collect();
        assert_eq!(ids, vec!["queued-early", "queued-late"]);
    }

    pub async fn claim_is_exclusive(repository: Arc<dyn BatchSearchRepository>) {
        let saved = repository
            .save(&User::local(), batch("contended", &["q"]))
            .await
            .unwrap();

        let (left, right) = tokio::join!(
            repository.set_state(&saved.id, claim("node/worker-0")),
            repository.set_state(&saved.id, claim("node/worker-1")),
        );

        let outcomes = [left, right];
        let winners = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(outcomes.iter().any(|outcome| matches!(
            outcome,
            Err(DatashareError::InvalidTransition { .. })
        )));
        assert!(repository.get_queued().await.unwrap().is_empty());
        let running = repository.get_running().await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].run, 1);
    }

    pub async fn invalid_transition_has_no_side_effect(repository: &dyn BatchSearchRepository) {
        let saved = repository
            .save(&User::local(), batch("done", &["q"]).with_state(BatchState::Success))
            .await
            .unwrap();

        let err = repository.set_state(&saved.id, claim("w")).await;
        assert!(matches!(err, Err(DatashareError::InvalidTransition { .. })));
        let err = repository
            .set_state(
                &saved.id,
                StateChange::Succeed {
                    worker: "w".to_string(),
                },
            )
            .await;
        assert!(matches!(err, Err(DatashareError::InvalidTransition { .. })));

        let stored = repository
            .get_by_id(&User::local(), &saved.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, saved);

        let missing = repository.set_state("missing", claim("w")).await;
        assert!(matches!(missing, Err(DatashareError::NotFound(_))));
    }

    pub async fn results_follow_query_order(repository: &dyn BatchSearchRepository) {
        let saved = repository
            .save(&User::local(), batch("results", &["a", "b"]))
            .await
            .unwrap();

        let before_claim = repository
            .append_results(&saved.id, "w", 0, "a", vec![document("d0")])
            .await;
        assert!(before_claim.is_err());

        repository.set_state(&saved.id, claim("w")).await.unwrap();
        let wrong_query = repository
            .append_results(&saved.id, "w", 0, "b", vec![document("d0")])
            .await;
        assert!(matches!(wrong_query, Err(DatashareError::InvalidArgument(_))));

        repository
            .append_results(&saved.id, "w", 1, "b", vec![document("d3")])
            .await
            .unwrap();
        repository
            .append_results(&saved.id, "w", 0, "a", vec![document("d1"), document("d2")])
            .await
            .unwrap();
        let duplicate = repository
            .append_results(&saved.id, "w", 0, "a", vec![document("d9")])
            .await;
        assert!(matches!(duplicate, Err(DatashareError::Conflict(_))));

        let results = repository
            .get_results(&User::local(), &saved.id, 0, 10)
            .await
            .unwrap();
        let documents: Vec<(&str, &str, usize)> = results
            .iter()
            .map(|result| {
                (
                    result.query.as_str(),
                    result.document_id.as_str(),
                    result.rank,
                )
            })
            .collect();
        assert_eq!(documents, vec![("a", "d1", 1), ("a", "d2", 2), ("b", "d3", 1)]);

        let page = repository
            .get_results(&User::local(), &saved.id, 1, 1)
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].document_id, "d2");

        let stored = repository
            .get_by_id(&User::local(), &saved.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.nb_results, 3);

        let foreign = repository
            .get_results(&User::new("other"), &saved.id, 0, 10)
            .await;
        assert!(matches!(foreign, Err(DatashareError::NotFound(_))));
    }

    pub async fn fresh_run_supersedes_previous_results(repository: &dyn BatchSearchRepository) {
        let saved = repository
            .save(&User::local(), batch("rerun", &["a"]))
            .await
            .unwrap();
        repository.set_state(&saved.id, claim("old/worker-0")).await.unwrap();
        repository
            .append_results(&saved.id, "old/worker-0", 0, "a", vec![document("stale")])
            .await
            .unwrap();
        repository
            .set_state(
                &saved.id,
                StateChange::Requeue {
                    worker: Some("old/worker-0".to_string()),
                },
            )
            .await
            .unwrap();

        let reclaimed = repository.set_state(&saved.id, claim("new/worker-0")).await.unwrap();
        assert_eq!(reclaimed.run, 2);
        assert_eq!(reclaimed.nb_results, 0);
        assert!(
            repository
                .get_results(&User::local(), &saved.id, 0, 10)
                .await
                .unwrap()
                .is_empty()
        );

        repository
            .append_results(&saved.id, "new/worker-0", 0, "a", vec![document("fresh")])
            .await
            .unwrap();
        let results = repository
            .get_results(&User::local(), &saved.id, 0, 10)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].document_id, "fresh");
        assert_eq!(results[0].run, 2);
    }

    pub async fn stale_worker_cannot_write_after_reclaim(repository: &dyn BatchSearchRepository) {
        let saved = repository
            .save(&User::local(), batch("reclaimed", &["a", "b"]))
            .await
            .unwrap();
        repository.set_state(&saved.id, claim("n1/worker-0")).await.unwrap();
        repository
            .set_state(
                &saved.id,
                StateChange::Requeue {
                    worker: Some("n1/worker-0".to_string()),
                },
            )
            .await
            .unwrap();
        repository.set_state(&saved.id, claim("n2/worker-0")).await.unwrap();

        let append = repository
            .append_results(&saved.id, "n1/worker-0", 0, "a", vec![document("stale-a")])
            .await;
        assert!(matches!(append, Err(DatashareError::InvalidTransition { .. })));
        let failure = QueryFailure {
            query_index: 1,
            query: "b".to_string(),
            cause: "index query error: bad syntax".to_string(),
        };
        let record = repository
            .record_query_failure(&saved.id, "n1/worker-0", failure)
            .await;
        assert!(matches!(record, Err(DatashareError::InvalidTransition { .. })));
        let succeed = repository
            .set_state(
                &saved.id,
                StateChange::Succeed {
                    worker: "n1/worker-0".to_string(),
                },
            )
            .await;
        assert!(matches!(succeed, Err(DatashareError::InvalidTransition { .. })));
        let fail = repository
            .set_state(
                &saved.id,
                StateChange::Fail {
                    worker: "n1/worker-0".to_string(),
                    cause: "index unavailable: down".to_string(),
                },
            )
            .await;
        assert!(matches!(fail, Err(DatashareError::InvalidTransition { .. })));

        let stored = repository
            .get_by_id(&User::local(), &saved.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, BatchState::Running);
        assert_eq!(stored.worker.as_deref(), Some("n2/worker-0"));
        assert_eq!(stored.run, 2);
        assert_eq!(stored.nb_results, 0);
        assert!(stored.query_failures.is_empty());

        repository
            .append_results(&saved.id, "n2/worker-0", 0, "a", vec![document("fresh-a")])
            .await
            .unwrap();
        let results = repository
            .get_results(&User::local(), &saved.id, 0, 10)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].document_id, "fresh-a");
    }

    pub async fn heartbeat_requires_claim(repository: &dyn BatchSearchRepository) {
        let saved = repository
            .save(&User::local(), batch("beat", &["a"]))
            .await
            .unwrap();
        assert!(repository.heartbeat(&saved.id, "w").await.is_err());

        let claimed = repository.set_state(&saved.id, claim("w")).await.unwrap();
        repository.heartbeat(&saved.id, "w").await.unwrap();
        let stored = repository
            .get_by_id(&User::local(), &saved.id)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.heartbeat_at >= claimed.heartbeat_at);

        let stolen = repository.heartbeat(&saved.id, "intruder").await;
        assert!(matches!(stolen, Err(DatashareError::InvalidTransition { .. })));
    }

    pub async fn query_failures_are_recorded(repository: &dyn BatchSearchRepository) {
        let saved = repository
            .save(&User::local(), batch("failures", &["a", "b"]))
            .await
            .unwrap();
        repository.set_state(&saved.id, claim("w")).await.unwrap();

        let failure = QueryFailure {
            query_index: 1,
            query: "b".to_string(),
            cause: "index query error: bad syntax".to_string(),
        };
        repository
            .record_query_failure(&saved.id, "w", failure.clone())
            .await
            .unwrap();

        let stored = repository
            .get_by_id(&User::local(), &saved.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.query_failures, vec![failure]);
    }

    pub async fn delete_is_owner_scoped(repository: &dyn BatchSearchRepository) {
        let saved = repository
            .save(&User::local(), batch("doomed", &["a"]))
            .await
            .unwrap();
        repository.set_state(&saved.id, claim("w")).await.unwrap();
        repository
            .append_results(&saved.id, "w", 0, "a", vec![document("d")])
            .await
            .unwrap();

        assert!(!repository.delete(&User::new("other"), &saved.id).await.unwrap());
        assert!(repository.exists(&saved.id).await.unwrap());

        assert!(repository.delete(&User::local(), &saved.id).await.unwrap());
        assert!(!repository.exists(&saved.id).await.unwrap());
        assert!(
            repository
                .get_by_id(&User::local(), &saved.id)
                .await
                .unwrap()
                .is_none()
        );
        assert!(!repository.delete(&User::local(), &saved.id).await.unwrap());

        let late = repository
            .append_results(&saved.id, "w", 0, "a", vec![document("d")])
            .await;
        assert!(matches!(late, Err(DatashareError::NotFound(_))));
    }

    pub async fn get_by_id_is_owner_scoped(repository: &dyn BatchSearchRepository) {
        let saved = repository
            .save(&User::local(), batch("mine", &["a"]))
            .await
            .unwrap();

        assert!(
            repository
                .get_by_id(&User::local(), &saved.id)
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            repository
                .get_by_id(&User::new("other"), &saved.id)
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            repository
                .get_by_id(&User::local(), "../../etc/passwd")
                .await
                .unwrap()
                .is_none()
        );
    }

    /// Runs every contract check against fresh repositories built by `make`.
    pub async fn run_all<F, Fut>(make: F)
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Arc<dyn BatchSearchRepository>>,
    {
        save_and_list_newest_first(make().await.as_ref()).await;
        save_rejects_duplicate_id(make().await.as_ref()).await;
        save_rejects_empty_queries(make().await.as_ref()).await;
        queued_excludes_other_states(make().await.as_ref()).await;
        claim_is_exclusive(make().await).await;
        invalid_transition_has_no_side_effect(make().await.as_ref()).await;
        results_follow_query_order(make().await.as_ref()).await;
        fresh_run_supersedes_previous_results(make().await.as_ref()).await;
        stale_worker_cannot_write_after_reclaim(make().await.as_ref()).await;
        heartbeat_requires_claim(make().await.as_ref()).await;
        query_failures_are_recorded(make().await.as_ref()).await;
        delete_is_owner_scoped(make().await.as_ref()).await;
        get_by_id_is_owner_scoped(make().await.as_ref()).await;
    }
}
