use std::time::Duration;

use async_trait::async_trait;
use datashare_batch::index::{DocumentMatch, SearchIndex};
use datashare_common::{
    error::{DatashareError, Result},
    types::Project,
};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;
use url::Url;

pub const DEFAULT_ADDRESS: &str = "http://localhost:9200";
pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const INDEX_NOT_FOUND: &str = "index_not_found_exception";
const INDEX_ALREADY_EXISTS: &str = "resource_already_exists_exception";
const DOCUMENT_TYPE: &str = "Document";

#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub address: String,
    /// Maximum number of hits kept per query.
    pub page_size: usize,
    pub request_timeout: Duration,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl IndexConfig {
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(DatashareError::InvalidArgument(
                "index page size must be at least 1".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(DatashareError::InvalidArgument(
                "index request timeout must be positive".to_string(),
            ));
        }
        parse_address(&self.address).map(|_| ())
    }
}

/// [`SearchIndex`] backed by the Elasticsearch REST API.
#[derive(Debug, Clone)]
pub struct ElasticsearchIndex {
    client: reqwest::Client,
    base: Url,
    page_size: usize,
}

impl ElasticsearchIndex {
    pub fn new(config: &IndexConfig) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| {
                DatashareError::InternalError(format!("failed to build index client: {err}"))
            })?;
        Ok(Self {
            client,
            base: parse_address(&config.address)?,
            page_size: config.page_size,
        })
    }

    pub fn address(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                DatashareError::InvalidArgument("index address cannot be a base URL".to_string())
            })?;
            path.pop_if_empty();
            path.extend(segments);
        }
        Ok(url)
    }

    fn search_body(&self, query: &str) -> Value {
        json!({
            "size": self.page_size,
            "_source": ["path", "contentType", "contentLength"],
            "query": {
                "bool": {
                    "must": [{ "query_string": { "query": query } }],
                    "filter": [{ "term": { "type": DOCUMENT_TYPE } }]
                }
            }
        })
    }
}

#[async_trait]
impl SearchIndex for ElasticsearchIndex {
    async fn search(&self, project: &Project, query: &str) -> Result<Vec<DocumentMatch>> {
        let url = self.endpoint(&[project.name.as_str(), "_search"])?;
        let response = self
            .client
            .post(url)
            .json(&self.search_body(query))
            .send()
            .await
            .map_err(|err| unreachable_index(&self.base, err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(&project.name, status, &body));
        }

        let parsed: SearchResponse = response.json().await.map_err(|err| {
            DatashareError::IndexUnavailable(format!(
                "unexpected search response from index {}: {err}",
                project.name
            ))
        })?;
        let matches: Vec<DocumentMatch> =
            parsed.hits.hits.into_iter().map(Hit::into_match).collect();
        debug!(project = %project, hits = matches.len(), "index search completed");
        Ok(matches)
    }

    async fn create_index(&self, name: &str) -> Result<()> {
        let url = self.endpoint(&[name])?;
        let response = self
            .client
            .put(url)
            .send()
            .await
            .map_err(|err| unreachable_index(&self.base, err))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if error_type(&body).as_deref() == Some(INDEX_ALREADY_EXISTS) {
            debug!(index = %name, "index already exists");
            return Ok(());
        }
        Err(classify_failure(name, status, &body))
    }
}

fn parse_address(address: &str) -> Result<Url> {
    let address = if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{address}")
    };
    Url::parse(&address)
        .map_err(|err| DatashareError::InvalidArgument(format!("invalid index address: {err}")))
}

fn unreachable_index(base: &Url, err: reqwest::Error) -> DatashareError {
    DatashareError::IndexUnavailable(format!("request to {base} failed: {err}"))
}

/// Server errors and a missing index abort the batch; any other rejection
/// is blamed on the query itself.
fn classify_failure(index: &str, status: StatusCode, body: &str) -> DatashareError {
    let kind = error_type(body);
    let detail = kind.as_deref().unwrap_or("no error type");
    if status.is_server_error() || kind.as_deref() == Some(INDEX_NOT_FOUND) {
        DatashareError::IndexUnavailable(format!("index {index} returned {status}: {detail}"))
    } else {
        DatashareError::IndexQuery(format!("index {index} rejected query with {status}: {detail}"))
    }
}

fn error_type(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .pointer("/error/type")
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: Hits,
}

#[derive(Debug, Deserialize)]
struct Hits {
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_routing")]
    routing: Option<String>,
    #[serde(rename = "_score")]
    score: Option<f64>,
    #[serde(rename = "_source", default)]
    source: HitSource,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HitSource {
    #[serde(default)]
    path: String,
    content_type: Option<String>,
    #[serde(default)]
    content_length: u64,
}

impl Hit {
    fn into_match(self) -> DocumentMatch {
        DocumentMatch {
            root_id: self.routing.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            path: self.source.path,
            content_type: self.source.content_type,
            content_length: self.source.content_length,
            score: self.score.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::{Arc, Mutex},
    };

    use axum::{
        Json, Router,
        extract::{Path, State},
        http::StatusCode,
        response::IntoResponse,
        routing::{post, put},
    };
    use datashare_batch::index::SearchIndex;
    use datashare_common::{error::DatashareError, types::Project};
    use serde_json::{Value, json};

    use super::{ElasticsearchIndex, IndexConfig};

    #[derive(Clone, Default)]
    struct MockState {
        bodies: Arc<Mutex<Vec<Value>>>,
    }

    async fn search(
        State(state): State<MockState>,
        Path(index): Path<String>,
        Json(body): Json<Value>,
    ) -> impl IntoResponse {
        state.bodies.lock().unwrap().push(body.clone());
        let query = body
            .pointer("/query/bool/must/0/query_string/query")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match (index.as_str(), query.as_str()) {
            ("missing", _) => (
                StatusCode::NOT_FOUND,
                Json(json!({"error": {"type": "index_not_found_exception"}, "status": 404})),
            ),
            (_, "broken:(") => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": {"type": "search_phase_execution_exception"}, "status": 400})),
            ),
            (_, "overload") => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": {"type": "cluster_block_exception"}, "status": 503})),
            ),
            _ => (
                StatusCode::OK,
                Json(json!({
                    "hits": {
                        "total": {"value": 2},
                        "hits": [
                            {
                                "_id": "child",
                                "_routing": "parent",
                                "_score": 2.5,
                                "_source": {
                                    "path": "/vault/parent.eml/child.pdf",
                                    "contentType": "application/pdf",
                                    "contentLength": 2048
                                }
                            },
                            {
                                "_id": "parent",
                                "_score": 1.0,
                                "_source": {"path": "/vault/parent.eml"}
                            }
                        ]
                    }
                })),
            ),
        }
    }

    async fn create(Path(index): Path<String>) -> impl IntoResponse {
        if index == "existing" {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": {"type": "resource_already_exists_exception"}, "status": 400})),
            )
        } else {
            (StatusCode::OK, Json(json!({"acknowledged": true})))
        }
    }

    async fn mock_server() -> (SocketAddr, MockState) {
        let state = MockState::default();
        let app = Router::new()
            .route("/{index}/_search", post(search))
            .route("/{index}", put(create))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, state)
    }

    fn client(addr: SocketAddr) -> ElasticsearchIndex {
        ElasticsearchIndex::new(&IndexConfig {
            address: addr.to_string(),
            page_size: 25,
            ..IndexConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn search_maps_hits_to_document_matches() {
        let (addr, state) = mock_server().await;
        let index = client(addr);

        let matches = index
            .search(&Project::new("local-datashare"), "panama AND papers")
            .await
            .unwrap();

        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].id, "child");
        assert_eq!(matches[0].root_id, "parent");
        assert_eq!(matches[0].content_type.as_deref(), Some("application/pdf"));
        assert_eq!(matches[0].content_length, 2048);
        assert_eq!(matches[0].score, 2.5);
        assert_eq!(matches[1].root_id, "parent");
        assert_eq!(matches[1].content_type, None);

        let bodies = state.bodies.lock().unwrap();
        assert_eq!(bodies[0]["size"], 25);
        assert_eq!(
            bodies[0]["query"]["bool"]["must"][0]["query_string"]["query"],
            "panama AND papers"
        );
    }

    #[tokio::test]
    async fn rejected_query_is_a_query_error() {
        let (addr, _) = mock_server().await;

        let err = client(addr)
            .search(&Project::new("local-datashare"), "broken:(")
            .await
            .unwrap_err();

        assert!(matches!(err, DatashareError::IndexQuery(_)), "{err}");
    }

    #[tokio::test]
    async fn missing_index_and_server_errors_are_unavailable() {
        let (addr, _) = mock_server().await;
        let index = client(addr);

        let missing = index.search(&Project::new("missing"), "q").await.unwrap_err();
        let overloaded = index
            .search(&Project::new("local-datashare"), "overload")
            .await
            .unwrap_err();

        assert!(matches!(missing, DatashareError::IndexUnavailable(_)));
        assert!(matches!(overloaded, DatashareError::IndexUnavailable(_)));
    }

    #[tokio::test]
    async fn unreachable_cluster_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client(addr)
            .search(&Project::new("local-datashare"), "q")
            .await
            .unwrap_err();

        assert!(matches!(err, DatashareError::IndexUnavailable(_)));
    }

    #[tokio::test]
    async fn create_index_tolerates_existing_index() {
        let (addr, _) = mock_server().await;
        let index = client(addr);

        index.create_index("local-datashare").await.unwrap();
        index.create_index("existing").await.unwrap();
    }

    #[test]
    fn config_rejects_zero_page_size() {
        let config = IndexConfig {
            page_size: 0,
            ..IndexConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(IndexConfig::default().validate().is_ok());
    }
}
