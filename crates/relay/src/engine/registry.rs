// Participant registry: one participant per canonical phone per webinar.

use chrono::Utc;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;
use webinar_common::{
    phone::{normalize_phone, PhoneRules},
    types::{Participant, Webinar, WebinarStatus},
};

use super::EngineError;
use crate::store::{Filter, LiveStore, OnConflict, StoreError, UpsertOutcome};

const MAX_DISPLAY_NAME_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub participant: Participant,
    /// False when an existing participant was resolved.
    pub created: bool,
    pub webinar: Webinar,
}

#[derive(Clone)]
pub struct ParticipantRegistry {
    store: LiveStore,
    rules: PhoneRules,
}

impl ParticipantRegistry {
    pub fn new(store: LiveStore, rules: PhoneRules) -> Self {
        Self { store, rules }
    }

    pub fn rules(&self) -> &PhoneRules {
        &self.rules
    }

    /// Resolve the participant for `raw_phone`, creating it on first contact.
    ///
    /// Conflicting concurrent inserts resolve to the same row. A supplied
    /// display name replaces the stored one.
    pub async fn resolve_participant(
        &self,
        webinar_id: Uuid,
        raw_phone: &str,
        display_name: Option<&str>,
    ) -> Result<Registration, EngineError> {
        let phone = normalize_phone(raw_phone, &self.rules)?;
        let display_name = normalize_display_name(display_name)?;

        async {
            let webinar = self
                .store
                .get::<Webinar>(&webinar_id.to_string())
                .await
                .map_err(unavailable)?
                .ok_or(EngineError::NotFound("webinar"))?;
            if webinar.status == WebinarStatus::Ended {
                return Err(EngineError::invalid_transition("webinar has ended"));
            }

            let candidate = Participant {
                id: Uuid::new_v4(),
                webinar_id,
                phone,
                display_name: display_name.clone(),
                created_at: Utc::now(),
            };
            let upserted =
                self.store.upsert(&candidate, OnConflict::KeepExisting).await.map_err(unavailable)?;
            let created = upserted.outcome == UpsertOutcome::Inserted;
            let mut participant = upserted.row;

            if display_name.is_some() && participant.display_name != display_name {
                participant.display_name = display_name;
                participant = self
                    .store
                    .upsert(&participant, OnConflict::Replace)
                    .await
                    .map_err(unavailable)?
                    .row;
            }

            debug!(participant_id = %participant.id, created, "participant resolved");
            Ok(Registration { participant, created, webinar })
        }
        .instrument(info_span!("registry.resolve", webinar_id = %webinar_id))
        .await
    }

    /// Server-side existence check for a cached identity.
    pub async fn verify_participant(
        &self,
        webinar_id: Uuid,
        participant_id: Uuid,
    ) -> Result<Participant, EngineError> {
        let filter = Filter::webinar(webinar_id).field("id", participant_id.to_string());
        self.store
            .query::<Participant>(&filter)
            .await
            .map_err(unavailable)?
            .into_iter()
            .next()
            .ok_or(EngineError::StaleIdentity(participant_id))
    }
}

/// Store failures surface as an unavailable registry, never as "not registered".
fn unavailable(error: StoreError) -> EngineError {
    EngineError::RegistryUnavailable(error)
}

fn normalize_display_name(display_name: Option<&str>) -> Result<Option<String>, EngineError> {
    let Some(name) = display_name.map(str::trim).filter(|name| !name.is_empty()) else {
        return Ok(None);
    };
    if name.chars().count() > MAX_DISPLAY_NAME_CHARS {
        return Err(EngineError::validation(format!(
            "display_name must be at most {MAX_DISPLAY_NAME_CHARS} characters"
        )));
    }
    Ok(Some(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::webinars::{WebinarDirectory, WebinarUpsert};

    async fn setup() -> (ParticipantRegistry, WebinarDirectory, Uuid) {
        let store = LiveStore::memory();
        let directory = WebinarDirectory::new(store.clone());
        let webinar_id = Uuid::new_v4();
        directory
            .upsert(
                webinar_id,
                WebinarUpsert {
                    slug: "registry".into(),
                    title: "Registry".into(),
                    starts_at: Utc::now(),
                    ends_at: None,
                    stream_url: "https://stream.example/embed".into(),
                    allow_late_responses: false,
                },
            )
            .await
            .unwrap();
        (ParticipantRegistry::new(store, PhoneRules::default()), directory, webinar_id)
    }

    #[tokio::test]
    async fn equivalent_phones_resolve_to_same_participant() {
        let (registry, _, webinar_id) = setup().await;

        let first = registry.resolve_participant(webinar_id, "09123456789", None).await.unwrap();
        let second = registry.resolve_participant(webinar_id, "+989123456789", None).await.unwrap();
        let third =
            registry.resolve_participant(webinar_id, "۰۹۱۲ ۳۴۵ ۶۷۸۹", None).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.participant.phone, "+989123456789");
        assert_eq!(first.participant.id, second.participant.id);
        assert_eq!(first.participant.id, third.participant.id);
    }

    #[tokio::test]
    async fn display_name_is_updated_on_resolution() {
        let (registry, _, webinar_id) = setup().await;
        let first = registry.resolve_participant(webinar_id, "09123456789", None).await.unwrap();
        let named =
            registry.resolve_participant(webinar_id, "09123456789", Some(" Sara ")).await.unwrap();

        assert_eq!(named.participant.id, first.participant.id);
        assert_eq!(named.participant.display_name.as_deref(), Some("Sara"));
    }

    #[tokio::test]
    async fn invalid_phone_is_rejected_before_touching_the_store() {
        let (registry, _, webinar_id) = setup().await;
        let err = registry.resolve_participant(webinar_id, "12", None).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidPhone(_)));
    }

    #[tokio::test]
    async fn ended_webinar_refuses_registration() {
        let (registry, directory, webinar_id) = setup().await;
        directory.set_status(webinar_id, WebinarStatus::Ended).await.unwrap();

        let err = registry.resolve_participant(webinar_id, "09123456789", None).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn verify_reports_stale_identity_for_unknown_participant() {
        let (registry, _, webinar_id) = setup().await;
        let registered =
            registry.resolve_participant(webinar_id, "09123456789", None).await.unwrap();

        assert_eq!(
            registry.verify_participant(webinar_id, registered.participant.id).await.unwrap(),
            registered.participant
        );
        let stale = Uuid::new_v4();
        let err = registry.verify_participant(webinar_id, stale).await.unwrap_err();
        assert!(matches!(err, EngineError::StaleIdentity(id) if id == stale));
        // Participants never leak across webinars.
        let err = registry
            .verify_participant(Uuid::new_v4(), registered.participant.id)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StaleIdentity(_)));
    }
}
