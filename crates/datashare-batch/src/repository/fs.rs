use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use datashare_common::{
    error::{DatashareError, Result},
    time,
    types::User,
};
use serde::{Serialize, de::DeserializeOwned};
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};
use tracing::warn;
use uuid::Uuid;

use super::{
    BatchSearchRepository, ResultSet, current_run_results, prepare_for_save, sort_newest_first,
    sort_oldest_first,
};
use crate::{
    index::DocumentMatch,
    types::{BatchSearch, BatchSearchResult, BatchState, QueryFailure, StateChange, is_valid_id},
};

const BATCHES_DIR: &str = "batches";
const RESULTS_DIR: &str = "results";
const LOCKS_DIR: &str = "locks";
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(5);

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_LOCK_STALE_AFTER: Duration = Duration::from_secs(60);

/// Durable repository laid out as:
///
/// ```text
/// <root>/batches/<id>.json                  batch record with its ordered queries
/// <root>/results/<id>/<run>-<query>.json    one result set, append-only
/// <root>/locks/<id>.lock                    compare-and-set guard
/// ```
///
/// Files become visible through an atomic rename, so readers see either the
/// previous or the next version of a record. State changes take the batch
/// lock file (`create_new`), which also serializes workers running in other
/// processes on the same directory.
#[derive(Debug, Clone)]
pub struct FsBatchSearchRepository {
    batches_dir: PathBuf,
    results_dir: PathBuf,
    locks_dir: PathBuf,
    lock_timeout: Duration,
    lock_stale_after: Duration,
}

impl FsBatchSearchRepository {
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let batches_dir = root.join(BATCHES_DIR);
        let results_dir = root.join(RESULTS_DIR);
        let locks_dir = root.join(LOCKS_DIR);
        fs::create_dir_all(&batches_dir).await?;
        fs::create_dir_all(&results_dir).await?;
        fs::create_dir_all(&locks_dir).await?;

        Ok(Self {
            batches_dir,
            results_dir,
            locks_dir,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_stale_after: DEFAULT_LOCK_STALE_AFTER,
        })
    }

    pub fn with_lock_timeouts(mut self, timeout: Duration, stale_after: Duration) -> Self {
        self.lock_timeout = timeout;
        self.lock_stale_after = stale_after;
        self
    }

    fn batch_path(&self, id: &str) -> Option<PathBuf> {
        is_valid_id(id).then(|| self.batches_dir.join(format!("{id}.json")))
    }

    fn results_path(&self, id: &str) -> PathBuf {
        self.results_dir.join(id)
    }

    fn result_set_path(&self, id: &str, run: u32, query_index: usize) -> PathBuf {
        self.results_path(id)
            .join(format!("{run:06}-{query_index:06}.json"))
    }

    async fn read_batch(&self, id: &str) -> Result<Option<BatchSearch>> {
        match self.batch_path(id) {
            Some(path) => read_json_if_exists(&path).await,
            None => Ok(None),
        }
    }

    async fn write_batch(&self, batch: &BatchSearch) -> Result<()> {
        let path = self
            .batch_path(&batch.id)
            .ok_or_else(|| not_found(&batch.id))?;
        write_json_atomic(&path, batch).await
    }

    async fn select(&self, predicate: impl Fn(&BatchSearch) -> bool) -> Result<Vec<BatchSearch>> {
        let batches = read_json_dir::<BatchSearch>(&self.batches_dir).await?;
        Ok(batches.into_iter().filter(|batch| predicate(batch)).collect())
    }

    async fn lock(&self, id: &str) -> Result<BatchLock> {
        if !is_valid_id(id) {
            return Err(not_found(id));
        }
        let path = self.locks_dir.join(format!("{id}.lock"));
        let started = Instant::now();

        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    let payload = format!(
                        "{{\"created\":\"{}\",\"pid\":{}}}",
                        time::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                        std::process::id()
                    );
                    if let Err(err) = file.write_all(payload.as_bytes()).await {
                        let _ = remove_if_exists(&path).await;
                        return Err(err.into());
                    }
                    return Ok(BatchLock { path });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.is_stale(&path).await {
                        self.break_stale_lock(&path).await?;
                        continue;
                    }
                    if started.elapsed() >= self.lock_timeout {
                        return Err(DatashareError::Storage(format!(
                            "timed out waiting for lock on batch search {id}"
                        )));
                    }
                    tokio::time::sleep(LOCK_RETRY_DELAY).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn is_stale(&self, lock_path: &Path) -> bool {
        match fs::metadata(lock_path).await.and_then(|meta| meta.modified()) {
            Ok(modified) => modified
                .elapsed()
                .is_ok_and(|age| age >= self.lock_stale_after),
            Err(_) => false,
        }
    }

    /// Moves a stale lock aside under a unique name, so that of several
    /// processes racing to break it only the one whose rename succeeds does.
    /// A lock that turns out to be fresh once moved was re-taken in between
    /// and is linked back in place.
    async fn break_stale_lock(&self, path: &Path) -> Result<()> {
        let tombstone = path.with_extension(format!("lock.{}.stale", Uuid::new_v4().simple()));
        match fs::rename(path, &tombstone).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        if self.is_stale(&tombstone).await {
            warn!(path = %path.display(), "broke stale batch search lock");
        } else {
            match fs::hard_link(&tombstone, path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    warn!(path = %path.display(), "fresh batch search lock was replaced while restoring it");
                }
                Err(err) => {
                    let _ = remove_if_exists(&tombstone).await;
                    return Err(err.into());
                }
            }
        }
        remove_if_exists(&tombstone).await
    }

    /// Result sets are renamed into place before the batch record is
    /// rewritten, so the stored count of a RUNNING batch can lag behind
    /// after a crash. The count of visible current-run results wins.
    async fn with_visible_count(&self, mut batch: BatchSearch) -> Result<BatchSearch> {
        if batch.state == BatchState::Running {
            let sets = read_json_dir::<ResultSet>(&self.results_path(&batch.id)).await?;
            batch.nb_results = sets
                .iter()
                .filter(|set| set.run == batch.run)
                .map(|set| set.results.len() as u64)
                .sum();
        }
        Ok(batch)
    }

    /// Read-modify-write of one batch record under its lock. Nothing is
    /// written when `mutate` fails.
    async fn update<T: Send>(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut BatchSearch) -> Result<T> + Send,
    ) -> Result<T> {
        let lock = self.lock(id).await?;
        let result = self.update_locked(id, mutate).await;
        lock.release().await;
        result
    }

    async fn update_locked<T: Send>(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut BatchSearch) -> Result<T> + Send,
    ) -> Result<T> {
        let mut batch = self.read_batch(id).await?.ok_or_else(|| not_found(id))?;
        let value = mutate(&mut batch)?;
        self.write_batch(&batch).await?;
        Ok(value)
    }

    async fn insert_locked(&self, batch: &BatchSearch) -> Result<()> {
        let path = self
            .batch_path(&batch.id)
            .ok_or_else(|| not_found(&batch.id))?;
        if fs::try_exists(&path).await? {
            return Err(DatashareError::Conflict(format!(
                "batch search {} already exists",
                batch.id
            )));
        }
        write_json_atomic(&path, batch).await
    }

    async fn append_locked(
        &self,
        id: &str,
        worker: &str,
        query_index: usize,
        query: &str,
        matches: Vec<DocumentMatch>,
    ) -> Result<usize> {
        let mut batch = self.read_batch(id).await?.ok_or_else(|| not_found(id))?;
        batch.ensure_claimed_by(worker)?;
        batch.ensure_query(query_index, query)?;

        let set_path = self.result_set_path(id, batch.run, query_index);
        if fs::try_exists(&set_path).await? {
            return Err(DatashareError::Conflict(format!(
                "results of query {query_index} already written for batch search {id} run {}",
                batch.run
            )));
        }

        let rows = BatchSearchResult::from_matches(&batch, query_index, query, matches);
        let count = rows.len();
        let set = ResultSet {
            batch_id: id.to_string(),
            run: batch.run,
            query_index,
            results: rows,
        };
        fs::create_dir_all(self.results_path(id)).await?;
        write_json_atomic(&set_path, &set).await?;

        batch.nb_results = batch.nb_results.saturating_add(count as u64);
        self.write_batch(&batch).await?;
        Ok(count)
    }

    async fn delete_locked(&self, owner: &User, id: &str) -> Result<bool> {
        let owned = self
            .read_batch(id)
            .await?
            .is_some_and(|batch| batch.owner == owner.id);
        if !owned {
            return Ok(false);
        }
        if let Some(path) = self.batch_path(id) {
            remove_if_exists(&path).await?;
        }
        match fs::remove_dir_all(self.results_path(id)).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(true)
    }
}

#[async_trait]
impl BatchSearchRepository for FsBatchSearchRepository {
    async fn save(&self, owner: &User, batch: BatchSearch) -> Result<BatchSearch> {
        let batch = prepare_for_save(owner, batch)?;
        let lock = self.lock(&batch.id).await?;
        let result = self.insert_locked(&batch).await;
        lock.release().await;
        result.map(|()| batch)
    }

    async fn get(&self, owner: &User) -> Result<Vec<BatchSearch>> {
        let mut batches = Vec::new();
        for batch in self.select(|batch| batch.owner == owner.id).await? {
            batches.push(self.with_visible_count(batch).await?);
        }
        sort_newest_first(&mut batches);
        Ok(batches)
    }

    async fn get_by_id(&self, owner: &User, id: &str) -> Result<Option<BatchSearch>> {
        match self.read_batch(id).await? {
            Some(batch) if batch.owner == owner.id => {
                Ok(Some(self.with_visible_count(batch).await?))
            }
            _ => Ok(None),
        }
    }

    async fn get_queued(&self) -> Result<Vec<BatchSearch>> {
        let mut batches = self
            .select(|batch| batch.state == BatchState::Queued)
            .await?;
        sort_oldest_first(&mut batches);
        Ok(batches)
    }

    async fn get_running(&self) -> Result<Vec<BatchSearch>> {
        let mut batches = self
            .select(|batch| batch.state == BatchState::Running)
            .await?;
        sort_oldest_first(&mut batches);
        Ok(batches)
    }

    async fn set_state(&self, id: &str, change: StateChange) -> Result<BatchSearch> {
        self.update(id, |batch| {
            batch.apply(&change)?;
            Ok(batch.clone())
        })
        .await
    }

    async fn heartbeat(&self, id: &str, worker: &str) -> Result<()> {
        self.update(id, |batch| {
            batch.ensure_claimed_by(worker)?;
            batch.heartbeat_at = Some(time::now());
            Ok(())
        })
        .await
    }

    async fn record_query_failure(
        &self,
        id: &str,
        worker: &str,
        failure: QueryFailure,
    ) -> Result<()> {
        self.update(id, |batch| {
            batch.ensure_claimed_by(worker)?;
            batch.ensure_query(failure.query_index, &failure.query)?;
            batch.query_failures.push(failure);
            Ok(())
        })
        .await
    }

    async fn append_results(
        &self,
        id: &str,
        worker: &str,
        query_index: usize,
        query: &str,
        matches: Vec<DocumentMatch>,
    ) -> Result<usize> {
        let lock = self.lock(id).await?;
        let result = self
            .append_locked(id, worker, query_index, query, matches)
            .await;
        lock.release().await;
        result
    }

    async fn get_results(
        &self,
        owner: &User,
        id: &str,
        from: usize,
        size: usize,
    ) -> Result<Vec<BatchSearchResult>> {
        let batch = self
            .read_batch(id)
            .await?
            .filter(|batch| batch.owner == owner.id)
            .ok_or_else(|| not_found(id))?;
        let sets = read_json_dir::<ResultSet>(&self.results_path(id)).await?;
        Ok(current_run_results(&batch, sets, from, size))
    }

    async fn delete(&self, owner: &User, id: &str) -> Result<bool> {
        if !is_valid_id(id) {
            return Ok(false);
        }
        let lock = self.lock(id).await?;
        let result = self.delete_locked(owner, id).await;
        lock.release().await;
        result
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        match self.batch_path(id) {
            Some(path) => Ok(fs::try_exists(path).await?),
            None => Ok(false),
        }
    }
}

#[derive(Debug)]
struct BatchLock {
    path: PathBuf,
}

impl BatchLock {
    async fn release(self) {
        if let Err(err) = remove_if_exists(&self.path).await {
            warn!(path = %self.path.display(), error = %err, "failed to release batch search lock");
        }
    }
}

fn not_found(id: &str) -> DatashareError {
    DatashareError::NotFound(format!("batch search {id}"))
}

async fn read_json_if_exists<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|err| {
            DatashareError::Storage(format!("failed to parse {}: {err}", path.display()))
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Reads every `*.json` file of `dir`. Temp files and files removed while
/// listing are skipped; a missing directory reads as empty.
async fn read_json_dir<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut values = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let is_hidden = entry.file_name().to_string_lossy().starts_with('.');
        if !is_json || is_hidden {
            continue;
        }
        if let Some(value) = read_json_if_exists(&path).await? {
            values.push(value);
        }
    }
    Ok(values)
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let payload = serde_json::to_vec_pretty(value).map_err(|err| {
        DatashareError::Storage(format!("failed to serialize {}: {err}", path.display()))
    })?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    fs::write(&tmp_path, payload).await?;
    if let Err(err) = fs::rename(&tmp_path, path).await {
        let _ = remove_if_exists(&tmp_path).await;
        return Err(err.into());
    }
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
