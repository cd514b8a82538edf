use async_trait::async_trait;
use datashare_common::{
    error::{DatashareError, Result},
    types::Project,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMatch {
    pub id: String,
    pub root_id: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default)]
    pub content_length: u64,
    pub score: f64,
}

/// Index collaborator the runner queries.
///
/// Implementations report a lost or missing index with
/// [`DatashareError::IndexUnavailable`] and a rejected query with
/// [`DatashareError::IndexQuery`].
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn search(&self, project: &Project, query: &str) -> Result<Vec<DocumentMatch>>;
    async fn create_index(&self, name: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexErrorKind {
    Unavailable,
    Query,
}

impl IndexErrorKind {
    pub fn of(error: &DatashareError) -> Self {
        match error {
            DatashareError::IndexQuery(_) => Self::Query,
            _ => Self::Unavailable,
        }
    }
}
