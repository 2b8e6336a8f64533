// Per-webinar state locks.
//
// Interaction state changes and webinar row changes take the write side;
// response submissions take the read side, so a response is always checked
// and stored against an interaction status that cannot change underneath it.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use uuid::Uuid;

/// Held while a webinar's interaction or webinar rows are being rewritten.
pub type WebinarWriteGuard = OwnedRwLockWriteGuard<()>;
/// Held while a response is validated against the current interaction state.
pub type WebinarReadGuard = OwnedRwLockReadGuard<()>;

#[derive(Clone, Default)]
pub struct WebinarLocks {
    locks: Arc<Mutex<HashMap<Uuid, Arc<RwLock<()>>>>>,
}

impl WebinarLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn write(&self, webinar_id: Uuid) -> WebinarWriteGuard {
        self.lock_for(webinar_id).write_owned().await
    }

    pub async fn read(&self, webinar_id: Uuid) -> WebinarReadGuard {
        self.lock_for(webinar_id).read_owned().await
    }

    fn lock_for(&self, webinar_id: Uuid) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().expect("webinar lock map poisoned");
        Arc::clone(locks.entry(webinar_id).or_default())
    }
}
