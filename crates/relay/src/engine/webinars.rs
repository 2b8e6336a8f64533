// Webinar rows: upserted by the scheduling flow, status driven by the host.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;
use webinar_common::types::{Webinar, WebinarStatus};

use super::{
    locks::{WebinarLocks, WebinarWriteGuard},
    EngineError,
};
use crate::store::{LiveStore, OnConflict};

const MAX_SLUG_LEN: usize = 100;
const MAX_TITLE_LEN: usize = 200;

/// Fields the scheduling flow controls. Status and timestamps are owned by the relay.
#[derive(Debug, Clone, Deserialize)]
pub struct WebinarUpsert {
    pub slug: String,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    pub stream_url: String,
    #[serde(default)]
    pub allow_late_responses: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub webinar: Webinar,
    pub previous: WebinarStatus,
}

impl StatusChange {
    pub fn changed(&self) -> bool {
        self.previous != self.webinar.status
    }
}

#[derive(Clone)]
pub struct WebinarDirectory {
    store: LiveStore,
    locks: WebinarLocks,
}

impl WebinarDirectory {
    pub fn new(store: LiveStore) -> Self {
        Self::with_locks(store, WebinarLocks::new())
    }

    pub fn with_locks(store: LiveStore, locks: WebinarLocks) -> Self {
        Self { store, locks }
    }

    pub fn locks(&self) -> &WebinarLocks {
        &self.locks
    }

    pub async fn get(&self, webinar_id: Uuid) -> Result<Webinar, EngineError> {
        self.store
            .get::<Webinar>(&webinar_id.to_string())
            .await?
            .ok_or(EngineError::NotFound("webinar"))
    }

    /// Create or update a webinar, returning the stored row and whether it is new.
    pub async fn upsert(
        &self,
        webinar_id: Uuid,
        input: WebinarUpsert,
    ) -> Result<(Webinar, bool), EngineError> {
        let input = validate_upsert(input)?;
        let _writer = self.locks.write(webinar_id).await;
        let now = Utc::now();
        let existing = self.store.get::<Webinar>(&webinar_id.to_string()).await?;
        let created = existing.is_none();

        let webinar = match existing {
            Some(existing) => Webinar {
                slug: input.slug,
                title: input.title,
                starts_at: input.starts_at,
                ends_at: input.ends_at,
                stream_url: input.stream_url,
                allow_late_responses: input.allow_late_responses,
                updated_at: now,
                ..existing
            },
            None => Webinar {
                id: webinar_id,
                slug: input.slug,
                title: input.title,
                starts_at: input.starts_at,
                ends_at: input.ends_at,
                status: WebinarStatus::Scheduled,
                stream_url: input.stream_url,
                allow_late_responses: input.allow_late_responses,
                created_at: now,
                updated_at: now,
            },
        };

        let stored = self.store.upsert(&webinar, OnConflict::Replace).await?;
        Ok((stored.row, created))
    }

    /// Move a webinar forward through its lifecycle. Repeating the current status is a no-op.
    pub async fn set_status(
        &self,
        webinar_id: Uuid,
        status: WebinarStatus,
    ) -> Result<StatusChange, EngineError> {
        let writer = self.locks.write(webinar_id).await;
        self.set_status_held(&writer, webinar_id, status).await
    }

    /// `set_status` for a caller already holding the webinar's write lock.
    pub async fn set_status_held(
        &self,
        _writer: &WebinarWriteGuard,
        webinar_id: Uuid,
        status: WebinarStatus,
    ) -> Result<StatusChange, EngineError> {
        let webinar = self.get(webinar_id).await?;
        let previous = webinar.status;
        if previous == status {
            return Ok(StatusChange { webinar, previous });
        }
        if !previous.can_transition_to(status) {
            return Err(EngineError::invalid_transition(format!(
                "webinar cannot move from {} to {}",
                previous.as_str(),
                status.as_str()
            )));
        }

        let updated = Webinar { status, updated_at: Utc::now(), ..webinar };
        let stored = self.store.upsert(&updated, OnConflict::Replace).await?;
        info!(
            webinar_id = %webinar_id,
            from = previous.as_str(),
            to = status.as_str(),
            "webinar status changed"
        );
        Ok(StatusChange { webinar: stored.row, previous })
    }
}

fn validate_upsert(mut input: WebinarUpsert) -> Result<WebinarUpsert, EngineError> {
    input.slug = input.slug.trim().to_string();
    input.title = input.title.trim().to_string();
    input.stream_url = input.stream_url.trim().to_string();

    if input.slug.is_empty() || input.slug.len() > MAX_SLUG_LEN {
        return Err(EngineError::validation(format!("slug must be 1-{MAX_SLUG_LEN} characters")));
    }
    if !input.slug.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return Err(EngineError::validation(
            "slug may only contain lowercase letters, digits and '-'",
        ));
    }
    if input.title.is_empty() || input.title.chars().count() > MAX_TITLE_LEN {
        return Err(EngineError::validation(format!(
            "title must be 1-{MAX_TITLE_LEN} characters"
        )));
    }
    if input.stream_url.is_empty() {
        return Err(EngineError::validation("stream_url must not be empty"));
    }
    if input.ends_at.is_some_and(|ends_at| ends_at < input.starts_at) {
        return Err(EngineError::validation("ends_at must not precede starts_at"));
    }

    Ok(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upsert_input(slug: &str) -> WebinarUpsert {
        WebinarUpsert {
            slug: slug.to_string(),
            title: "Intro to Rust".to_string(),
            starts_at: Utc::now(),
            ends_at: None,
            stream_url: "https://stream.example/embed/1".to_string(),
            allow_late_responses: false,
        }
    }

    #[tokio::test]
    async fn upsert_creates_then_updates_without_touching_status() {
        let directory = WebinarDirectory::new(LiveStore::memory());
        let webinar_id = Uuid::new_v4();

        let (created, is_new) = directory.upsert(webinar_id, upsert_input("intro")).await.unwrap();
        assert!(is_new);
        assert_eq!(created.status, WebinarStatus::Scheduled);

        directory.set_status(webinar_id, WebinarStatus::Live).await.unwrap();
        let mut renamed = upsert_input("intro");
        renamed.title = "Intro to Rust, part 2".into();
        let (updated, is_new) = directory.upsert(webinar_id, renamed).await.unwrap();

        assert!(!is_new);
        assert_eq!(updated.status, WebinarStatus::Live);
        assert_eq!(updated.created_at, created.created_at);
        assert_eq!(updated.title, "Intro to Rust, part 2");
    }

    #[tokio::test]
    async fn status_only_moves_forward() {
        let directory = WebinarDirectory::new(LiveStore::memory());
        let webinar_id = Uuid::new_v4();
        directory.upsert(webinar_id, upsert_input("intro")).await.unwrap();

        let live = directory.set_status(webinar_id, WebinarStatus::Live).await.unwrap();
        assert!(live.changed());
        let again = directory.set_status(webinar_id, WebinarStatus::Live).await.unwrap();
        assert!(!again.changed());
        directory.set_status(webinar_id, WebinarStatus::Ended).await.unwrap();

        let err = directory.set_status(webinar_id, WebinarStatus::Live).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn rejects_invalid_slug_and_missing_webinar() {
        let directory = WebinarDirectory::new(LiveStore::memory());
        let err = directory.upsert(Uuid::new_v4(), upsert_input("Not A Slug")).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let err = directory.get(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound("webinar")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_edit_and_go_live_keep_both_changes() {
        let directory = std::sync::Arc::new(WebinarDirectory::new(LiveStore::memory()));

        for round in 0..50 {
            let webinar_id = Uuid::new_v4();
            directory.upsert(webinar_id, upsert_input("intro")).await.unwrap();

            let mut renamed = upsert_input("intro");
            renamed.title = format!("Round {round}");
            let edit = {
                let directory = std::sync::Arc::clone(&directory);
                tokio::spawn(async move { directory.upsert(webinar_id, renamed).await })
            };
            let go_live = {
                let directory = std::sync::Arc::clone(&directory);
                tokio::spawn(async move { directory.set_status(webinar_id, WebinarStatus::Live).await })
            };
            edit.await.unwrap().unwrap();
            go_live.await.unwrap().unwrap();

            let stored = directory.get(webinar_id).await.unwrap();
            assert_eq!(stored.status, WebinarStatus::Live);
            assert_eq!(stored.title, format!("Round {round}"));
        }
    }
}
