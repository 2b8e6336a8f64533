// The live interaction engine.
//
// `LiveEngine` owns the six components and the background tasks that keep
// them moving (presence sweeps, reaction flushes, webhook delivery). It is
// built once at startup and shared with the HTTP and WebSocket layers
// through axum state.

pub mod aggregator;
pub mod broadcaster;
pub mod error;
pub mod locks;
pub mod presence;
pub mod qa;
pub mod reactions;
pub mod registry;
pub mod snapshot;
pub mod webinars;

use std::{sync::Arc, time::Duration};

use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info};
use uuid::Uuid;
use webinar_common::{
    phone::PhoneRules,
    protocol::ws::{HEARTBEAT_INTERVAL_MS, HEARTBEAT_TIMEOUT_MS},
    types::{
        Interaction, InteractionDraft, Participant, Question, QuestionOrder, QuestionView,
        ReactionCounts, SessionSnapshot, Tally, Webinar, WebinarStatus,
    },
    webhook::{
        InteractionActivated, ParticipantRegistered, QuestionSubmitted, WebhookEvent,
        WebinarStatusChanged,
    },
};

pub use error::EngineError;

use self::{
    aggregator::{ResponseAggregator, ResponseReceipt},
    broadcaster::{Activation, InteractionBroadcaster},
    locks::WebinarLocks,
    presence::PresenceTracker,
    qa::QaManager,
    reactions::{ReactionCounter, REACTION_FLUSH_INTERVAL_MS},
    registry::{ParticipantRegistry, Registration},
    snapshot::{build_session_snapshot, SESSION_TABLES},
    webinars::{StatusChange, WebinarDirectory, WebinarUpsert},
};
use crate::{
    config::{RelayConfig, DEFAULT_REACTION_KINDS},
    store::{LiveStore, Subscription},
    webhook::{WebhookConfig, WebhookDispatcher},
};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub phone_rules: PhoneRules,
    pub reaction_kinds: Vec<String>,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub reaction_flush_interval: Duration,
    pub webhook: Option<WebhookConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            phone_rules: PhoneRules::default(),
            reaction_kinds: DEFAULT_REACTION_KINDS.iter().map(|kind| kind.to_string()).collect(),
            heartbeat_interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            heartbeat_timeout: Duration::from_millis(HEARTBEAT_TIMEOUT_MS),
            reaction_flush_interval: Duration::from_millis(REACTION_FLUSH_INTERVAL_MS),
            webhook: None,
        }
    }
}

impl EngineConfig {
    pub fn from_relay_config(config: &RelayConfig) -> anyhow::Result<Self> {
        let template = config.compiled_webhook_template()?;
        let webhook =
            config.webhook_url.clone().map(|url| WebhookConfig { url, template: template.clone() });
        Ok(Self {
            phone_rules: config.phone_rules.clone(),
            reaction_kinds: config.reaction_kinds.clone(),
            webhook,
            ..Self::default()
        })
    }
}

pub struct LiveEngine {
    store: LiveStore,
    webinars: WebinarDirectory,
    registry: ParticipantRegistry,
    presence: Arc<PresenceTracker>,
    broadcaster: InteractionBroadcaster,
    aggregator: ResponseAggregator,
    reactions: Arc<ReactionCounter>,
    qa: QaManager,
    webhooks: Option<WebhookDispatcher>,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LiveEngine {
    /// Build the engine and start its background tasks. Must run inside a tokio runtime.
    pub fn init(store: LiveStore, config: EngineConfig) -> anyhow::Result<Arc<Self>> {
        let presence =
            Arc::new(PresenceTracker::new(config.heartbeat_interval + config.heartbeat_timeout));
        let reactions = Arc::new(ReactionCounter::new(store.clone(), config.reaction_kinds));

        let mut tasks = vec![
            spawn_presence_sweeper(Arc::clone(&presence), config.heartbeat_interval),
            spawn_reaction_flusher(Arc::clone(&reactions), config.reaction_flush_interval),
        ];

        let webhooks = match config.webhook {
            Some(webhook) => {
                info!(url = %webhook.url, "webhook delivery enabled");
                let (dispatcher, worker) = WebhookDispatcher::spawn(webhook)?;
                tasks.push(worker);
                Some(dispatcher)
            }
            None => None,
        };

        let locks = WebinarLocks::new();
        info!(backend = store.backend_name(), "live engine started");
        Ok(Arc::new(Self {
            webinars: WebinarDirectory::with_locks(store.clone(), locks.clone()),
            registry: ParticipantRegistry::new(store.clone(), config.phone_rules),
            broadcaster: InteractionBroadcaster::with_locks(store.clone(), locks.clone()),
            aggregator: ResponseAggregator::with_locks(store.clone(), locks),
            qa: QaManager::new(store.clone()),
            store,
            presence,
            reactions,
            webhooks,
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_timeout: config.heartbeat_timeout,
            tasks: Mutex::new(tasks),
        }))
    }

    /// Stop the background tasks, flushing queued reactions first.
    pub async fn dispose(&self) {
        if let Err(error) = self.reactions.flush().await {
            debug!(error = %error, "final reaction flush failed");
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!("live engine stopped");
    }

    pub fn store(&self) -> &LiveStore {
        &self.store
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    // Webinars.

    pub async fn upsert_webinar(
        &self,
        webinar_id: Uuid,
        input: WebinarUpsert,
    ) -> Result<(Webinar, bool), EngineError> {
        self.webinars.upsert(webinar_id, input).await
    }

    pub async fn webinar(&self, webinar_id: Uuid) -> Result<Webinar, EngineError> {
        self.webinars.get(webinar_id).await
    }

    /// Ending a webinar also closes its active interaction, under the same
    /// write lock as the status change.
    pub async fn set_webinar_status(
        &self,
        webinar_id: Uuid,
        status: WebinarStatus,
    ) -> Result<StatusChange, EngineError> {
        let change = {
            let writer = self.webinars.locks().write(webinar_id).await;
            let change = self.webinars.set_status_held(&writer, webinar_id, status).await?;
            if change.changed() && status == WebinarStatus::Ended {
                self.broadcaster.close_active_held(&writer, webinar_id).await?;
            }
            change
        };
        if !change.changed() {
            return Ok(change);
        }
        self.emit(WebhookEvent::WebinarStatusChanged(WebinarStatusChanged {
            webinar: (&change.webinar).into(),
            previous_status: change.previous,
            status: change.webinar.status,
        }));
        Ok(change)
    }

    // Participants.

    pub async fn register_participant(
        &self,
        webinar_id: Uuid,
        raw_phone: &str,
        display_name: Option<&str>,
    ) -> Result<Registration, EngineError> {
        let registration =
            self.registry.resolve_participant(webinar_id, raw_phone, display_name).await?;
        if registration.created {
            self.emit(WebhookEvent::ParticipantRegistered(ParticipantRegistered {
                webinar: (&registration.webinar).into(),
                participant: registration.participant.clone(),
            }));
        }
        Ok(registration)
    }

    pub async fn verify_participant(
        &self,
        webinar_id: Uuid,
        participant_id: Uuid,
    ) -> Result<Participant, EngineError> {
        self.registry.verify_participant(webinar_id, participant_id).await
    }

    // Interactions.

    pub async fn create_interaction(
        &self,
        webinar_id: Uuid,
        draft: InteractionDraft,
    ) -> Result<Interaction, EngineError> {
        self.broadcaster.create_interaction(webinar_id, draft).await
    }

    pub async fn activate_interaction(
        &self,
        webinar_id: Uuid,
        interaction_id: Uuid,
    ) -> Result<Activation, EngineError> {
        let activation = self.broadcaster.activate(webinar_id, interaction_id).await?;
        self.emit_activation(webinar_id, &activation).await;
        Ok(activation)
    }

    pub async fn publish_interaction(
        &self,
        webinar_id: Uuid,
        draft: InteractionDraft,
    ) -> Result<Activation, EngineError> {
        let activation = self.broadcaster.publish(webinar_id, draft).await?;
        self.emit_activation(webinar_id, &activation).await;
        Ok(activation)
    }

    pub async fn close_active_interaction(
        &self,
        webinar_id: Uuid,
    ) -> Result<Option<Interaction>, EngineError> {
        self.broadcaster.close_active(webinar_id).await
    }

    pub async fn interactions(&self, webinar_id: Uuid) -> Result<Vec<Interaction>, EngineError> {
        self.broadcaster.list(webinar_id).await
    }

    pub async fn active_interaction(
        &self,
        webinar_id: Uuid,
    ) -> Result<Option<Interaction>, EngineError> {
        self.broadcaster.active(webinar_id).await
    }

    pub async fn interaction_history(
        &self,
        webinar_id: Uuid,
    ) -> Result<Vec<Interaction>, EngineError> {
        self.broadcaster.history(webinar_id).await
    }

    // Responses.

    pub async fn submit_response(
        &self,
        webinar_id: Uuid,
        interaction_id: Uuid,
        participant_id: Uuid,
        value: &str,
    ) -> Result<ResponseReceipt, EngineError> {
        self.interaction_in(webinar_id, interaction_id).await?;
        self.aggregator.submit_response(interaction_id, participant_id, value).await
    }

    pub async fn tally(&self, webinar_id: Uuid, interaction_id: Uuid) -> Result<Tally, EngineError> {
        self.interaction_in(webinar_id, interaction_id).await?;
        self.aggregator.get_tally(interaction_id).await
    }

    // Reactions.

    pub fn fire_reactions(
        &self,
        webinar_id: Uuid,
        participant_id: Uuid,
        kind: &str,
        count: u32,
    ) -> Result<u32, EngineError> {
        self.reactions.fire(webinar_id, participant_id, kind, count)
    }

    pub async fn reaction_counts(&self, webinar_id: Uuid) -> Result<ReactionCounts, EngineError> {
        self.reactions.counts(webinar_id).await
    }

    /// Persist queued reactions now instead of waiting for the next tick.
    pub async fn flush_reactions(&self) -> Result<usize, EngineError> {
        self.reactions.flush().await
    }

    // Questions.

    pub async fn submit_question(
        &self,
        webinar_id: Uuid,
        participant_id: Uuid,
        text: &str,
    ) -> Result<Question, EngineError> {
        let question = self.qa.submit_question(webinar_id, participant_id, text).await?;
        if self.webhooks.is_some() {
            let webinar = self.webinars.get(webinar_id).await?;
            self.emit(WebhookEvent::QuestionSubmitted(QuestionSubmitted {
                webinar: (&webinar).into(),
                question: question.clone(),
            }));
        }
        Ok(question)
    }

    pub async fn upvote_question(
        &self,
        webinar_id: Uuid,
        question_id: Uuid,
        participant_id: Uuid,
    ) -> Result<QuestionView, EngineError> {
        self.qa.upvote(webinar_id, question_id, participant_id).await
    }

    pub async fn mark_question_answered(
        &self,
        webinar_id: Uuid,
        question_id: Uuid,
    ) -> Result<QuestionView, EngineError> {
        self.qa.mark_answered(webinar_id, question_id).await
    }

    pub async fn question(
        &self,
        webinar_id: Uuid,
        question_id: Uuid,
    ) -> Result<QuestionView, EngineError> {
        self.qa.get(webinar_id, question_id).await
    }

    pub async fn questions(
        &self,
        webinar_id: Uuid,
        order: QuestionOrder,
    ) -> Result<Vec<QuestionView>, EngineError> {
        self.qa.list(webinar_id, order).await
    }

    // Sessions.

    /// Live feed of every table a session renders.
    pub fn subscribe(&self, webinar_id: Uuid) -> Subscription {
        self.store.subscribe(webinar_id, &SESSION_TABLES)
    }

    pub async fn session_snapshot(
        &self,
        webinar_id: Uuid,
        participant_id: Uuid,
    ) -> Result<SessionSnapshot, EngineError> {
        let snapshot = self.store.snapshot(webinar_id, &SESSION_TABLES).await?;
        let presence = self.presence.count(webinar_id).await;
        build_session_snapshot(&snapshot, participant_id, presence)
    }

    async fn interaction_in(
        &self,
        webinar_id: Uuid,
        interaction_id: Uuid,
    ) -> Result<Interaction, EngineError> {
        let interaction = self.broadcaster.get(interaction_id).await?;
        if interaction.webinar_id != webinar_id {
            return Err(EngineError::NotFound("interaction"));
        }
        Ok(interaction)
    }

    async fn emit_activation(&self, webinar_id: Uuid, activation: &Activation) {
        if !activation.changed || self.webhooks.is_none() {
            return;
        }
        match self.webinars.get(webinar_id).await {
            Ok(webinar) => self.emit(WebhookEvent::InteractionActivated(InteractionActivated {
                webinar: (&webinar).into(),
                interaction: activation.activated.clone(),
            })),
            Err(error) => debug!(error = %error, "skipping activation webhook"),
        }
    }

    fn emit(&self, event: WebhookEvent) {
        if let Some(webhooks) = &self.webhooks {
            webhooks.emit(event);
        }
    }
}

fn spawn_presence_sweeper(presence: Arc<PresenceTracker>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let evicted = presence.sweep().await;
            if evicted > 0 {
                debug!(evicted, "stale presence evicted");
            }
        }
    })
}

fn spawn_reaction_flusher(reactions: Arc<ReactionCounter>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(error) = reactions.flush().await {
                debug!(error = %error, "reaction flush failed; deltas re-queued");
            }
        }
    })
}
