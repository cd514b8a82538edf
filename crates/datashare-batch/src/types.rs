use std::fmt;

use chrono::{DateTime, Utc};
use datashare_common::{
    error::{DatashareError, Result},
    time,
    types::Project,
};
use serde::{Deserialize, Serialize};

use crate::index::DocumentMatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchState {
    Queued,
    Running,
    Success,
    Failure,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    /// Edges of the batch state graph. RUNNING -> QUEUED is reserved to crash recovery.
    pub fn can_transition_to(&self, next: BatchState) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Running, Self::Success)
                | (Self::Running, Self::Failure)
                | (Self::Running, Self::Queued)
        )
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A requested state change. Each change has exactly one legal source state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    Claim { worker: String },
    /// Only the worker holding the claim may complete the run.
    Succeed { worker: String },
    Fail { worker: String, cause: String },
    Requeue { worker: Option<String> },
}

impl StateChange {
    pub fn source(&self) -> BatchState {
        match self {
            Self::Claim { .. } => BatchState::Queued,
            Self::Succeed { .. } | Self::Fail { .. } | Self::Requeue { .. } => BatchState::Running,
        }
    }

    pub fn target(&self) -> BatchState {
        match self {
            Self::Claim { .. } => BatchState::Running,
            Self::Succeed { .. } => BatchState::Success,
            Self::Fail { .. } => BatchState::Failure,
            Self::Requeue { .. } => BatchState::Queued,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryFailure {
    pub query_index: usize,
    pub query: String,
    pub cause: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSearch {
    #[serde(default)]
    pub id: String,
    pub project: Project,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub queries: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub state: BatchState,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub run: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub query_failures: Vec<QueryFailure>,
    #[serde(default)]
    pub nb_results: u64,
    pub updated_at: DateTime<Utc>,
}

impl BatchSearch {
    pub fn new(
        project: Project,
        name: impl Into<String>,
        description: impl Into<String>,
        queries: Vec<String>,
    ) -> Self {
        Self::with_created_at(project, name, description, queries, time::now())
    }

    pub fn with_created_at(
        project: Project,
        name: impl Into<String>,
        description: impl Into<String>,
        queries: Vec<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: String::new(),
            project,
            name: name.into(),
            description: description.into(),
            queries,
            created_at,
            state: BatchState::Queued,
            owner: String::new(),
            run: 0,
            worker: None,
            heartbeat_at: None,
            error: None,
            query_failures: Vec::new(),
            nb_results: 0,
            updated_at: created_at,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_state(mut self, state: BatchState) -> Self {
        self.state = state;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.project.name.trim().is_empty() {
            return Err(DatashareError::InvalidArgument(
                "batch search project is required".to_string(),
            ));
        }
        if self.queries.is_empty() {
            return Err(DatashareError::InvalidArgument(
                "batch search must include at least one query".to_string(),
            ));
        }
        if let Some(position) = self.queries.iter().position(|query| query.trim().is_empty()) {
            return Err(DatashareError::InvalidArgument(format!(
                "batch search query {position} is blank"
            )));
        }
        if !self.id.is_empty() && !is_valid_id(&self.id) {
            return Err(DatashareError::InvalidArgument(format!(
                "invalid batch search id: {}",
                self.id
            )));
        }
        Ok(())
    }

    /// Applies `change` as a compare-and-set on `state`; on error the record is left untouched.
    pub fn apply(&mut self, change: &StateChange) -> Result<()> {
        let target = change.target();
        if self.state != change.source() || !self.state.can_transition_to(target) {
            return Err(self.invalid_transition(target));
        }
        let holder = match change {
            StateChange::Claim { .. } => None,
            StateChange::Succeed { worker } | StateChange::Fail { worker, .. } => Some(worker),
            StateChange::Requeue { worker } => worker.as_ref(),
        };
        if let Some(expected) = holder
            && self.worker.as_deref() != Some(expected.as_str())
        {
            return Err(self.invalid_transition(target));
        }

        let now = time::now();
        match change {
            StateChange::Claim { worker } => {
                self.run = self.run.saturating_add(1);
                self.worker = Some(worker.clone());
                self.heartbeat_at = Some(now);
                self.error = None;
                self.query_failures.clear();
                self.nb_results = 0;
            }
            StateChange::Succeed { .. } => {
                self.worker = None;
            }
            StateChange::Fail { cause, .. } => {
                self.worker = None;
                self.error = Some(cause.clone());
            }
            StateChange::Requeue { .. } => {
                self.worker = None;
                self.heartbeat_at = None;
            }
        }
        self.state = target;
        self.updated_at = now;
        Ok(())
    }

    /// Checks that `worker` still holds the claim on this batch. Every write
    /// of a run goes through this check, so a worker whose batch was requeued
    /// and claimed again cannot touch the new run.
    pub fn ensure_claimed_by(&self, worker: &str) -> Result<()> {
        if self.state == BatchState::Running && self.worker.as_deref() == Some(worker) {
            return Ok(());
        }
        Err(self.invalid_transition(BatchState::Running))
    }

    /// Checks that `query` is the batch query at `query_index`.
    pub fn ensure_query(&self, query_index: usize, query: &str) -> Result<()> {
        match self.queries.get(query_index) {
            Some(expected) if expected == query => Ok(()),
            _ => Err(DatashareError::InvalidArgument(format!(
                "query {query_index} ({query}) does not belong to batch search {}",
                self.id
            ))),
        }
    }

    fn invalid_transition(&self, target: BatchState) -> DatashareError {
        DatashareError::InvalidTransition {
            id: self.id.clone(),
            from: self.state.to_string(),
            to: target.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSearchResult {
    pub batch_id: String,
    pub run: u32,
    pub query: String,
    pub query_index: usize,
    pub document_id: String,
    pub root_id: String,
    pub document_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default)]
    pub content_length: u64,
    pub score: f64,
    pub rank: usize,
    pub created_at: DateTime<Utc>,
}

impl BatchSearchResult {
    pub fn from_matches(
        batch: &BatchSearch,
        query_index: usize,
        query: &str,
        matches: Vec<DocumentMatch>,
    ) -> Vec<Self> {
        let created_at = time::now();
        matches
            .into_iter()
            .enumerate()
            .map(|(position, document)| Self {
                batch_id: batch.id.clone(),
                run: batch.run,
                query: query.to_string(),
                query_index,
                document_id: document.id,
                root_id: document.root_id,
                document_path: document.path,
                content_type: document.content_type,
                content_length: document.content_length,
                score: document.score,
                rank: position + 1,
                created_at,
            })
            .collect()
    }
}

/// Ids are used as file names by the filesystem repository.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}
