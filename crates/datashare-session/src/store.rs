use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use datashare_common::error::{DatashareError, Result};
use tokio::{sync::RwLock, time::Instant};
use tracing::debug;

use crate::types::UserRecord;

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(1);

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Stores `record` under its login, replacing any previous session.
    async fn create_user(&self, record: UserRecord) -> Result<()>;
    async fn find(&self, login: &str) -> Result<Option<UserRecord>>;
    /// Returns the record only when `password` hashes to the stored digest.
    async fn find_with_password(&self, login: &str, password: &str) -> Result<Option<UserRecord>>;
    async fn remove_user(&self, login: &str) -> Result<()>;
}

#[derive(Debug)]
struct Entry {
    payload: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// Keeps serialized user records in memory; sessions expire `ttl` after creation.
#[derive(Debug)]
pub struct MemorySessionStore {
    ttl: Duration,
    entries: RwLock<HashMap<String, Entry>>,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

impl MemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Registers an account that never expires, e.g. loaded from a users file.
    pub async fn seed(&self, record: UserRecord) -> Result<()> {
        self.insert(record, None).await
    }

    async fn insert(&self, record: UserRecord, expires_at: Option<Instant>) -> Result<()> {
        if record.login.is_empty() {
            return Err(DatashareError::InvalidArgument(
                "user login must not be empty".to_string(),
            ));
        }
        let payload = record.to_json()?;
        self.entries
            .write()
            .await
            .insert(record.login, Entry { payload, expires_at });
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_user(&self, record: UserRecord) -> Result<()> {
        self.insert(record, Some(Instant::now() + self.ttl)).await
    }

    async fn find(&self, login: &str) -> Result<Option<UserRecord>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(login) {
                None => return Ok(None),
                Some(entry) if !entry.is_expired(now) => {
                    return UserRecord::from_json(&entry.payload).map(Some);
                }
                Some(_) => {}
            }
        }

        let mut entries = self.entries.write().await;
        if entries.get(login).is_some_and(|entry| entry.is_expired(now)) {
            entries.remove(login);
            debug!(login = %login, "session expired");
        }
        Ok(None)
    }

    async fn find_with_password(&self, login: &str, password: &str) -> Result<Option<UserRecord>> {
        Ok(self
            .find(login)
            .await?
            .filter(|record| record.password_matches(password)))
    }

    async fn remove_user(&self, login: &str) -> Result<()> {
        self.entries.write().await.remove(login);
        Ok(())
    }
}
