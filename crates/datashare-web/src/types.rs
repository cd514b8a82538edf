use axum::http::HeaderValue;
use datashare_common::{
    error::{DatashareError, Result},
    types::{LOCAL_USER_ID, Project, User},
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_RESULTS_PAGE_SIZE: usize = 100;
pub const MAX_RESULTS_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Every request acts as the configured default user.
    #[default]
    Local,
    /// `Authorization: Basic` checked against the session store.
    Basic,
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub auth: AuthMode,
    pub default_user: String,
    /// Granted to the default user on top of its own `<user>-datashare` project.
    pub default_project: Option<String>,
    /// `*` or a single origin allowed to call the API from a browser.
    pub cors_allow_origin: Option<String>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            auth: AuthMode::Local,
            default_user: LOCAL_USER_ID.to_string(),
            default_project: None,
            cors_allow_origin: None,
        }
    }
}

impl WebConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_user.trim().is_empty() {
            return Err(DatashareError::InvalidArgument(
                "default user must not be empty".to_string(),
            ));
        }
        if let Some(origin) = self.cors_allow_origin.as_deref()
            && origin != "*"
            && HeaderValue::from_str(origin).is_err()
        {
            return Err(DatashareError::InvalidArgument(format!(
                "invalid cors origin: {origin}"
            )));
        }
        Ok(())
    }

    pub fn local_user(&self) -> User {
        let mut user = User::new(self.default_user.clone());
        if let Some(project) = self.default_project.as_deref()
            && !user.is_granted(&Project::new(project))
        {
            user.projects.push(project.to_string());
        }
        user
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitBatchSearchRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub queries: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultsPage {
    pub from: Option<usize>,
    pub size: Option<usize>,
}

impl ResultsPage {
    pub fn bounds(&self) -> (usize, usize) {
        let size = self
            .size
            .unwrap_or(DEFAULT_RESULTS_PAGE_SIZE)
            .min(MAX_RESULTS_PAGE_SIZE);
        (self.from.unwrap_or(0), size)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[cfg(test)]
mod tests {
    use super::{MAX_RESULTS_PAGE_SIZE, ResultsPage, WebConfig};

    #[test]
    fn local_user_is_granted_default_project() {
        let config = WebConfig {
            default_project: Some("panama".to_string()),
            ..WebConfig::default()
        };

        let user = config.local_user();

        assert_eq!(user.id, "local");
        assert_eq!(user.projects, vec!["panama"]);
        assert!(WebConfig::default().local_user().projects.is_empty());
    }

    #[test]
    fn results_page_is_clamped() {
        let page = ResultsPage {
            from: Some(20),
            size: Some(1_000_000),
        };

        assert_eq!(page.bounds(), (20, MAX_RESULTS_PAGE_SIZE));
        assert_eq!(ResultsPage::default().bounds(), (0, 100));
    }
}
