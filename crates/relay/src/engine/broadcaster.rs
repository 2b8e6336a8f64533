// Interaction broadcaster.
//
// Per webinar: NoActiveInteraction -> Active(id) -> Closed(id) -> Active(next).
// Every state change is a single store commit taken under the webinar's
// writer lock, so no reader ever observes two active interactions.

use chrono::Utc;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;
use webinar_common::types::{
    sort_history, Interaction, InteractionDraft, InteractionKind, InteractionStatus, Webinar,
    WebinarStatus,
};

use super::{
    locks::{WebinarLocks, WebinarWriteGuard},
    EngineError,
};
use crate::{
    metrics,
    store::{Filter, LiveStore, OnConflict},
};

const MAX_PROMPT_CHARS: usize = 500;
const MAX_OPTION_CHARS: usize = 200;
const MIN_POLL_OPTIONS: usize = 2;
const MAX_POLL_OPTIONS: usize = 10;
const DEFAULT_RATING_SCALE: u8 = 5;
const MAX_RATING_SCALE: u8 = 10;

/// Result of an activation: the newly active interaction and the one it closed.
#[derive(Debug, Clone, PartialEq)]
pub struct Activation {
    pub activated: Interaction,
    pub closed: Option<Interaction>,
    /// False when the target was already active.
    pub changed: bool,
}

pub struct InteractionBroadcaster {
    store: LiveStore,
    locks: WebinarLocks,
}

impl InteractionBroadcaster {
    pub fn new(store: LiveStore) -> Self {
        Self::with_locks(store, WebinarLocks::new())
    }

    pub fn with_locks(store: LiveStore, locks: WebinarLocks) -> Self {
        Self { store, locks }
    }

    /// Single-writer lock for one webinar's interaction state.
    async fn writer(&self, webinar_id: Uuid) -> WebinarWriteGuard {
        self.locks.write(webinar_id).await
    }

    /// Create an interaction ahead of time. It stays `pending` until activated.
    pub async fn create_interaction(
        &self,
        webinar_id: Uuid,
        draft: InteractionDraft,
    ) -> Result<Interaction, EngineError> {
        let _writer = self.writer(webinar_id).await;
        let webinar = self.webinar(webinar_id).await?;
        if webinar.status == WebinarStatus::Ended {
            return Err(EngineError::invalid_transition("webinar has ended"));
        }

        let existing = self.list(webinar_id).await?;
        let interaction = new_interaction(webinar_id, draft, next_seq(&existing))?;
        let stored = self.store.upsert(&interaction, OnConflict::KeepExisting).await?;
        Ok(stored.row)
    }

    /// Close the current interaction (if any) and activate `interaction_id` in one commit.
    pub async fn activate(
        &self,
        webinar_id: Uuid,
        interaction_id: Uuid,
    ) -> Result<Activation, EngineError> {
        async {
            let _writer = self.writer(webinar_id).await;
            self.require_live(webinar_id).await?;

            let interactions = self.list(webinar_id).await?;
            let target = interactions
                .iter()
                .find(|interaction| interaction.id == interaction_id)
                .cloned()
                .ok_or(EngineError::NotFound("interaction"))?;

            match target.status {
                InteractionStatus::Active => {
                    return Ok(Activation { activated: target, closed: None, changed: false })
                }
                InteractionStatus::Closed => {
                    return Err(EngineError::invalid_transition(
                        "closed interactions cannot be re-activated",
                    ))
                }
                InteractionStatus::Pending => {}
            }

            self.commit_activation(&interactions, target).await
        }
        .instrument(info_span!("broadcaster.activate", webinar_id = %webinar_id, interaction_id = %interaction_id))
        .await
    }

    /// Create and activate in one commit.
    pub async fn publish(
        &self,
        webinar_id: Uuid,
        draft: InteractionDraft,
    ) -> Result<Activation, EngineError> {
        async {
            let _writer = self.writer(webinar_id).await;
            self.require_live(webinar_id).await?;

            let interactions = self.list(webinar_id).await?;
            let target = new_interaction(webinar_id, draft, next_seq(&interactions))?;
            self.commit_activation(&interactions, target).await
        }
        .instrument(info_span!("broadcaster.publish", webinar_id = %webinar_id))
        .await
    }

    /// Close the active interaction, leaving none active.
    pub async fn close_active(&self, webinar_id: Uuid) -> Result<Option<Interaction>, EngineError> {
        let writer = self.writer(webinar_id).await;
        self.close_active_held(&writer, webinar_id).await
    }

    /// `close_active` for a caller already holding the webinar's write lock.
    pub async fn close_active_held(
        &self,
        _writer: &WebinarWriteGuard,
        webinar_id: Uuid,
    ) -> Result<Option<Interaction>, EngineError> {
        let Some(active) = self.active(webinar_id).await? else {
            return Ok(None);
        };

        let closed = close(active);
        let stored = self.store.upsert(&closed, OnConflict::Replace).await?;
        info!(webinar_id = %webinar_id, interaction_id = %closed.id, "interaction closed");
        Ok(Some(stored.row))
    }

    pub async fn get(&self, interaction_id: Uuid) -> Result<Interaction, EngineError> {
        self.store
            .get::<Interaction>(&interaction_id.to_string())
            .await?
            .ok_or(EngineError::NotFound("interaction"))
    }

    pub async fn active(&self, webinar_id: Uuid) -> Result<Option<Interaction>, EngineError> {
        let filter = Filter::webinar(webinar_id).field("status", "active");
        Ok(self.store.query::<Interaction>(&filter).await?.into_iter().next())
    }

    /// Closed interactions in closing order.
    pub async fn history(&self, webinar_id: Uuid) -> Result<Vec<Interaction>, EngineError> {
        let filter = Filter::webinar(webinar_id).field("status", "closed");
        let mut history = self.store.query::<Interaction>(&filter).await?;
        sort_history(&mut history);
        Ok(history)
    }

    /// Every interaction of the webinar in creation order.
    pub async fn list(&self, webinar_id: Uuid) -> Result<Vec<Interaction>, EngineError> {
        let mut interactions = self.store.query::<Interaction>(&Filter::webinar(webinar_id)).await?;
        interactions.sort_by_key(|interaction| interaction.seq);
        Ok(interactions)
    }

    async fn commit_activation(
        &self,
        interactions: &[Interaction],
        mut target: Interaction,
    ) -> Result<Activation, EngineError> {
        let now = Utc::now();
        let closed = interactions.iter().find(|interaction| interaction.is_active()).cloned().map(close);

        target.status = InteractionStatus::Active;
        target.activated_at = Some(now);
        target.closed_at = None;

        let mut batch = Vec::with_capacity(2);
        batch.extend(closed.iter().cloned());
        batch.push(target);

        let mut committed = self.store.commit(&batch, OnConflict::Replace).await?;
        let activated = committed.pop().ok_or(EngineError::NotFound("interaction"))?.row;
        let closed = committed.pop().map(|upserted| upserted.row);

        metrics::increment_interactions_activated_total();
        info!(
            webinar_id = %activated.webinar_id,
            interaction_id = %activated.id,
            closed_interaction_id = ?closed.as_ref().map(|interaction| interaction.id),
            "interaction activated"
        );
        Ok(Activation { activated, closed, changed: true })
    }

    async fn webinar(&self, webinar_id: Uuid) -> Result<Webinar, EngineError> {
        self.store.get::<Webinar>(&webinar_id.to_string()).await?.ok_or(EngineError::NotFound("webinar"))
    }

    async fn require_live(&self, webinar_id: Uuid) -> Result<Webinar, EngineError> {
        let webinar = self.webinar(webinar_id).await?;
        if webinar.status != WebinarStatus::Live {
            return Err(EngineError::invalid_transition(format!(
                "interactions can only be activated while the webinar is live (status: {})",
                webinar.status.as_str()
            )));
        }
        Ok(webinar)
    }
}

fn close(mut interaction: Interaction) -> Interaction {
    interaction.status = InteractionStatus::Closed;
    interaction.closed_at = Some(Utc::now());
    interaction
}

fn next_seq(interactions: &[Interaction]) -> i64 {
    interactions.iter().map(|interaction| interaction.seq).max().unwrap_or(0) + 1
}

fn new_interaction(
    webinar_id: Uuid,
    draft: InteractionDraft,
    seq: i64,
) -> Result<Interaction, EngineError> {
    let draft = validate_draft(draft)?;
    Ok(Interaction {
        id: Uuid::new_v4(),
        webinar_id,
        kind: draft.kind,
        prompt: draft.prompt,
        options: draft.options,
        scale: draft.scale,
        seq,
        status: InteractionStatus::Pending,
        created_at: Utc::now(),
        activated_at: None,
        closed_at: None,
    })
}

/// Trim and check a draft against its kind's shape.
pub fn validate_draft(mut draft: InteractionDraft) -> Result<InteractionDraft, EngineError> {
    draft.prompt = draft.prompt.trim().to_string();
    if draft.prompt.is_empty() || draft.prompt.chars().count() > MAX_PROMPT_CHARS {
        return Err(EngineError::validation(format!(
            "prompt must be 1-{MAX_PROMPT_CHARS} characters"
        )));
    }

    match draft.kind {
        InteractionKind::Poll => {
            if draft.scale.is_some() {
                return Err(EngineError::validation("poll interactions do not take a scale"));
            }
            let options: Vec<String> =
                draft.options.iter().map(|option| option.trim().to_string()).collect();
            if !(MIN_POLL_OPTIONS..=MAX_POLL_OPTIONS).contains(&options.len()) {
                return Err(EngineError::validation(format!(
                    "polls need {MIN_POLL_OPTIONS}-{MAX_POLL_OPTIONS} options"
                )));
            }
            if options.iter().any(|option| option.is_empty() || option.chars().count() > MAX_OPTION_CHARS) {
                return Err(EngineError::validation(format!(
                    "poll options must be 1-{MAX_OPTION_CHARS} characters"
                )));
            }
            let mut unique = options.clone();
            unique.sort();
            unique.dedup();
            if unique.len() != options.len() {
                return Err(EngineError::validation("poll options must be distinct"));
            }
            draft.options = options;
        }
        InteractionKind::Rating => {
            if !draft.options.is_empty() {
                return Err(EngineError::validation("rating interactions do not take options"));
            }
            let scale = draft.scale.unwrap_or(DEFAULT_RATING_SCALE);
            if !(2..=MAX_RATING_SCALE).contains(&scale) {
                return Err(EngineError::validation(format!(
                    "rating scale must be 2-{MAX_RATING_SCALE}"
                )));
            }
            draft.scale = Some(scale);
        }
        InteractionKind::OpenText => {
            if !draft.options.is_empty() || draft.scale.is_some() {
                return Err(EngineError::validation(
                    "open text interactions take neither options nor a scale",
                ));
            }
        }
    }

    Ok(draft)
}
