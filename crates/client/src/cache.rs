// Local identity cache.
//
// The cache is a hint: every cached identity is re-verified against the
// registry before a session uses it.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::Mutex,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use webinar_common::types::Participant;

use crate::{config::identity_cache_path, error::ClientError, security::write_private_file};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedIdentity {
    pub webinar_id: Uuid,
    pub participant_id: Uuid,
    /// Canonical phone as returned by the registry.
    pub phone: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub cached_at: DateTime<Utc>,
}

impl CachedIdentity {
    pub fn from_participant(participant: &Participant) -> Self {
        Self {
            webinar_id: participant.webinar_id,
            participant_id: participant.id,
            phone: participant.phone.clone(),
            display_name: participant.display_name.clone(),
            cached_at: Utc::now(),
        }
    }
}

pub trait IdentityCache: Send + Sync {
    fn load(&self, webinar_id: Uuid) -> Result<Option<CachedIdentity>, ClientError>;

    fn store(&self, identity: &CachedIdentity) -> Result<(), ClientError>;

    fn clear(&self, webinar_id: Uuid) -> Result<(), ClientError>;
}

/// JSON map keyed by webinar id, written with owner-only permissions.
#[derive(Debug)]
pub struct FileIdentityCache {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileIdentityCache {
    pub fn new(path: PathBuf) -> Self {
        Self { path, write_lock: Mutex::new(()) }
    }

    /// Cache at `~/.webinar/identity.json`.
    pub fn at_default_path() -> Result<Self, ClientError> {
        identity_cache_path()
            .map(Self::new)
            .ok_or_else(|| ClientError::Cache("could not determine home directory".into()))
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<Uuid, CachedIdentity>, ClientError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(BTreeMap::new())
            }
            Err(error) => {
                return Err(ClientError::Cache(format!(
                    "failed to read `{}`: {error}",
                    self.path.display()
                )))
            }
        };
        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&contents).map_err(|error| {
            ClientError::Cache(format!("corrupt identity cache `{}`: {error}", self.path.display()))
        })
    }

    fn write_all(&self, entries: &BTreeMap<Uuid, CachedIdentity>) -> Result<(), ClientError> {
        let contents = serde_json::to_vec_pretty(entries)
            .map_err(|error| ClientError::Cache(error.to_string()))?;
        write_private_file(&self.path, &contents).map_err(|error| ClientError::Cache(format!("{error:#}")))
    }

    fn update<F>(&self, mutate: F) -> Result<(), ClientError>
    where
        F: FnOnce(&mut BTreeMap<Uuid, CachedIdentity>),
    {
        let _guard = self.write_lock.lock().expect("identity cache write lock poisoned");
        // A corrupt file is replaced rather than blocking every future write.
        let mut entries = self.read_all().unwrap_or_default();
        mutate(&mut entries);
        self.write_all(&entries)
    }
}

impl IdentityCache for FileIdentityCache {
    fn load(&self, webinar_id: Uuid) -> Result<Option<CachedIdentity>, ClientError> {
        Ok(self.read_all()?.remove(&webinar_id))
    }

    fn store(&self, identity: &CachedIdentity) -> Result<(), ClientError> {
        self.update(|entries| {
            entries.insert(identity.webinar_id, identity.clone());
        })
    }

    fn clear(&self, webinar_id: Uuid) -> Result<(), ClientError> {
        self.update(|entries| {
            entries.remove(&webinar_id);
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryIdentityCache {
    entries: Mutex<BTreeMap<Uuid, CachedIdentity>>,
}

impl MemoryIdentityCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityCache for MemoryIdentityCache {
    fn load(&self, webinar_id: Uuid) -> Result<Option<CachedIdentity>, ClientError> {
        Ok(self.entries.lock().expect("identity cache lock poisoned").get(&webinar_id).cloned())
    }

    fn store(&self, identity: &CachedIdentity) -> Result<(), ClientError> {
        self.entries
            .lock()
            .expect("identity cache lock poisoned")
            .insert(identity.webinar_id, identity.clone());
        Ok(())
    }

    fn clear(&self, webinar_id: Uuid) -> Result<(), ClientError> {
        self.entries.lock().expect("identity cache lock poisoned").remove(&webinar_id);
        Ok(())
    }
}

impl<C: IdentityCache + ?Sized> IdentityCache for std::sync::Arc<C> {
    fn load(&self, webinar_id: Uuid) -> Result<Option<CachedIdentity>, ClientError> {
        (**self).load(webinar_id)
    }

    fn store(&self, identity: &CachedIdentity) -> Result<(), ClientError> {
        (**self).store(identity)
    }

    fn clear(&self, webinar_id: Uuid) -> Result<(), ClientError> {
        (**self).clear(webinar_id)
    }
}
