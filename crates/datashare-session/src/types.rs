use datashare_common::{
    error::{DatashareError, Result},
    types::User,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Session payload stored per login. Fields other than the ones below are
/// kept as-is so identity providers can attach their own details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub login: String,
    /// SHA-256 hex digest of the password, absent for externally authenticated users.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub projects: Vec<String>,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl UserRecord {
    pub fn new(login: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            password: None,
            projects: Vec::new(),
            details: Map::new(),
        }
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(hash_password(password));
        self
    }

    pub fn with_projects(mut self, projects: Vec<String>) -> Self {
        self.projects = projects;
        self
    }

    pub fn password_matches(&self, password: &str) -> bool {
        self.password
            .as_deref()
            .is_some_and(|stored| stored.eq_ignore_ascii_case(&hash_password(password)))
    }

    pub fn to_user(&self) -> User {
        User::with_projects(self.login.clone(), self.projects.clone())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|err| {
            DatashareError::InternalError(format!("failed to serialize user {}: {err}", self.login))
        })
    }

    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data).map_err(|err| {
            DatashareError::InternalError(format!("failed to parse user record: {err}"))
        })
    }
}

pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}
