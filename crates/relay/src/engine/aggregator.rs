// Response aggregator.
//
// One response row per (interaction, participant); a resubmission while the
// interaction is active overwrites the value in place. Tallies are always
// recomputed from the response rows.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;
use webinar_common::types::{
    sort_history, Interaction, InteractionKind, InteractionStatus, Participant, Response, Tally,
    TallyEntry, Webinar,
};

use super::{locks::WebinarLocks, EngineError};
use crate::{
    metrics,
    store::{Filter, LiveStore, OnConflict, UpsertOutcome},
};

pub const MAX_OPEN_TEXT_CHARS: usize = 2_000;

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseReceipt {
    pub response: Response,
    /// A previous response from the same participant was overwritten.
    pub updated: bool,
    pub late: bool,
}

#[derive(Clone)]
pub struct ResponseAggregator {
    store: LiveStore,
    locks: WebinarLocks,
}

impl ResponseAggregator {
    pub fn new(store: LiveStore) -> Self {
        Self::with_locks(store, WebinarLocks::new())
    }

    pub fn with_locks(store: LiveStore, locks: WebinarLocks) -> Self {
        Self { store, locks }
    }

    pub async fn submit_response(
        &self,
        interaction_id: Uuid,
        participant_id: Uuid,
        value: &str,
    ) -> Result<ResponseReceipt, EngineError> {
        async {
            let webinar_id = self.interaction(interaction_id).await?.webinar_id;
            // Status checks and the write below happen while no activation or
            // close can commit for this webinar.
            let _reader = self.locks.read(webinar_id).await;
            let interaction = self.interaction(interaction_id).await?;
            self.require_participant(interaction.webinar_id, participant_id).await?;
            let value = validate_value(&interaction, value)?;

            let now = Utc::now();
            let key = format!("{interaction_id}:{participant_id}");
            let existing = self.store.get::<Response>(&key).await?;

            let receipt = match interaction.status {
                InteractionStatus::Pending => {
                    return Err(EngineError::validation("interaction is not active yet"));
                }
                InteractionStatus::Active => {
                    let response = match existing {
                        Some(existing) => Response { value, updated_at: now, ..existing },
                        None => Response {
                            id: Uuid::new_v4(),
                            interaction_id,
                            webinar_id: interaction.webinar_id,
                            participant_id,
                            value,
                            late: false,
                            submitted_at: now,
                            updated_at: now,
                        },
                    };
                    let stored = self.store.upsert(&response, OnConflict::Replace).await?;
                    let updated = stored.outcome == UpsertOutcome::Replaced;
                    ResponseReceipt { late: stored.row.late, response: stored.row, updated }
                }
                InteractionStatus::Closed => {
                    self.accept_late(&interaction, participant_id, value, existing.is_some()).await?
                }
            };

            metrics::record_response(match (receipt.late, receipt.updated) {
                (true, _) => "late",
                (false, true) => "updated",
                (false, false) => "created",
            });
            debug!(
                response_id = %receipt.response.id,
                updated = receipt.updated,
                late = receipt.late,
                "response accepted"
            );
            Ok(receipt)
        }
        .instrument(info_span!(
            "aggregator.submit",
            interaction_id = %interaction_id,
            participant_id = %participant_id
        ))
        .await
    }

    /// A closed interaction accepts one first-time response per participant,
    /// and only when late responses are allowed and it closed most recently.
    async fn accept_late(
        &self,
        interaction: &Interaction,
        participant_id: Uuid,
        value: String,
        already_answered: bool,
    ) -> Result<ResponseReceipt, EngineError> {
        let closed = EngineError::InteractionClosed(interaction.id);
        if already_answered {
            return Err(closed);
        }

        let webinar = self
            .store
            .get::<Webinar>(&interaction.webinar_id.to_string())
            .await?
            .ok_or(EngineError::NotFound("webinar"))?;
        if !webinar.allow_late_responses {
            return Err(closed);
        }

        let filter = Filter::webinar(interaction.webinar_id).field("status", "closed");
        let mut history = self.store.query::<Interaction>(&filter).await?;
        sort_history(&mut history);
        if history.last().map(|latest| latest.id) != Some(interaction.id) {
            return Err(closed);
        }

        let now = Utc::now();
        let response = Response {
            id: Uuid::new_v4(),
            interaction_id: interaction.id,
            webinar_id: interaction.webinar_id,
            participant_id,
            value,
            late: true,
            submitted_at: now,
            updated_at: now,
        };
        let stored = self.store.upsert(&response, OnConflict::KeepExisting).await?;
        if stored.outcome != UpsertOutcome::Inserted {
            // Lost a race with another late submission from the same participant.
            return Err(closed);
        }
        Ok(ResponseReceipt { response: stored.row, updated: false, late: true })
    }

    pub async fn get_tally(&self, interaction_id: Uuid) -> Result<Tally, EngineError> {
        let interaction = self.interaction(interaction_id).await?;
        let filter = Filter::webinar(interaction.webinar_id)
            .field("interaction_id", interaction_id.to_string());
        let responses = self.store.query::<Response>(&filter).await?;
        Ok(compute_tally(&interaction, &responses))
    }

    pub async fn responses_for_participant(
        &self,
        webinar_id: Uuid,
        participant_id: Uuid,
    ) -> Result<Vec<Response>, EngineError> {
        let filter = Filter::webinar(webinar_id).field("participant_id", participant_id.to_string());
        Ok(self.store.query::<Response>(&filter).await?)
    }

    async fn interaction(&self, interaction_id: Uuid) -> Result<Interaction, EngineError> {
        self.store
            .get::<Interaction>(&interaction_id.to_string())
            .await?
            .ok_or(EngineError::NotFound("interaction"))
    }

    async fn require_participant(
        &self,
        webinar_id: Uuid,
        participant_id: Uuid,
    ) -> Result<Participant, EngineError> {
        let filter = Filter::webinar(webinar_id).field("id", participant_id.to_string());
        self.store
            .query::<Participant>(&filter)
            .await?
            .into_iter()
            .next()
            .ok_or(EngineError::StaleIdentity(participant_id))
    }
}

/// Canonical stored value for a submission, or a validation error.
pub fn validate_value(interaction: &Interaction, raw: &str) -> Result<String, EngineError> {
    let value = raw.trim();
    match interaction.kind {
        InteractionKind::Poll => interaction
            .options
            .iter()
            .find(|option| option.as_str() == value)
            .cloned()
            .ok_or_else(|| EngineError::validation(format!("`{value}` is not one of the poll options"))),
        InteractionKind::Rating => {
            let scale = interaction.scale.unwrap_or(5);
            match value.parse::<u8>() {
                Ok(rating) if (1..=scale).contains(&rating) => Ok(rating.to_string()),
                _ => Err(EngineError::validation(format!("rating must be an integer from 1 to {scale}"))),
            }
        }
        InteractionKind::OpenText => {
            if value.is_empty() || value.chars().count() > MAX_OPEN_TEXT_CHARS {
                return Err(EngineError::validation(format!(
                    "answer must be 1-{MAX_OPEN_TEXT_CHARS} characters"
                )));
            }
            Ok(value.to_string())
        }
    }
}

/// `COUNT(*) GROUP BY value` over the given responses.
///
/// Poll options and rating steps are always listed (zero counts included) in
/// their natural order; any other value follows, sorted.
pub fn compute_tally(interaction: &Interaction, responses: &[Response]) -> Tally {
    let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
    let mut total = 0;
    for response in responses.iter().filter(|response| response.interaction_id == interaction.id) {
        *counts.entry(response.value.as_str()).or_default() += 1;
        total += 1;
    }

    let fixed: Vec<String> = match interaction.kind {
        InteractionKind::Poll => interaction.options.clone(),
        InteractionKind::Rating => {
            (1..=interaction.scale.unwrap_or(5)).map(|step| step.to_string()).collect()
        }
        InteractionKind::OpenText => Vec::new(),
    };

    let mut entries: Vec<TallyEntry> = fixed
        .iter()
        .map(|value| TallyEntry {
            value: value.clone(),
            count: counts.remove(value.as_str()).unwrap_or(0),
        })
        .collect();
    entries.extend(
        counts.into_iter().map(|(value, count)| TallyEntry { value: value.to_string(), count }),
    );

    Tally { interaction_id: interaction.id, entries, total }
}
