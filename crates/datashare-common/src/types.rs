use std::fmt;

use serde::{Deserialize, Serialize};

pub const LOCAL_USER_ID: &str = "local";
pub const DEFAULT_PROJECT_SUFFIX: &str = "-datashare";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub projects: Vec<String>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            projects: Vec::new(),
        }
    }

    pub fn with_projects(id: impl Into<String>, projects: Vec<String>) -> Self {
        Self {
            id: id.into(),
            projects,
        }
    }

    pub fn local() -> Self {
        Self::new(LOCAL_USER_ID)
    }

    /// The project every user owns implicitly, e.g. `local-datashare`.
    pub fn default_project(&self) -> Project {
        Project::new(format!("{}{DEFAULT_PROJECT_SUFFIX}", self.id))
    }

    pub fn is_granted(&self, project: &Project) -> bool {
        project == &self.default_project() || self.projects.iter().any(|name| name == &project.name)
    }
}

#[cfg(test)]
mod tests {
    use super::{Project, User};

    #[test]
    fn user_is_granted_own_and_listed_projects() {
        let user = User::with_projects("cecile", vec!["panama".to_string()]);

        assert!(user.is_granted(&Project::new("cecile-datashare")));
        assert!(user.is_granted(&Project::new("panama")));
        assert!(!user.is_granted(&Project::new("local-datashare")));
    }
}
