// Session view model.
//
// Folds server frames and local actions into what a participant screen
// renders. Invariants:
// - at most one interaction is ever exposed as active
// - history lists closed interactions in closing order
// - a snapshot replaces everything, including unacknowledged local actions

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::Serialize;
use uuid::Uuid;
use webinar_common::{
    protocol::ws::WsMessage,
    types::{
        sort_history, sort_questions, Interaction, InteractionStatus, QuestionOrder,
        QuestionView, ReactionCounts, SessionSnapshot, Tally, Webinar,
    },
};

use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Live,
    Reconnecting { attempt: u32 },
    Closed,
}

/// Embedded stream status. `Failed` offers a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Loading,
    Playing,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MyResponse {
    pub value: String,
    /// Acknowledged by the server.
    pub confirmed: bool,
    pub late: bool,
}

/// Inline, non-blocking feedback for the participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    InteractionClosed { interaction_id: Uuid },
    ResponseRejected { interaction_id: Uuid, message: String },
    QuestionRejected { text: String, message: String },
    Error { code: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingQuestion {
    pub client_request_id: Uuid,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
enum PendingAction {
    /// `last_confirmed` is what the server last accepted for the interaction,
    /// never another optimistic value.
    Response { interaction_id: Uuid, last_confirmed: Option<MyResponse> },
    Question,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub answered: usize,
    pub seen: usize,
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "answered {} / {}", self.answered, self.seen)
    }
}

#[derive(Debug, Clone)]
pub struct SessionView {
    participant_id: Option<Uuid>,
    webinar: Option<Webinar>,
    interactions: BTreeMap<Uuid, Interaction>,
    my_responses: HashMap<Uuid, MyResponse>,
    tallies: HashMap<Uuid, Tally>,
    reaction_counts: ReactionCounts,
    questions: Vec<QuestionView>,
    pending_questions: Vec<PendingQuestion>,
    presence: u64,
    connection: ConnectionState,
    stream: StreamState,
    pending: HashMap<Uuid, PendingAction>,
    notices: Vec<Notice>,
}

impl Default for SessionView {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionView {
    pub fn new() -> Self {
        Self {
            participant_id: None,
            webinar: None,
            interactions: BTreeMap::new(),
            my_responses: HashMap::new(),
            tallies: HashMap::new(),
            reaction_counts: ReactionCounts::new(),
            questions: Vec::new(),
            pending_questions: Vec::new(),
            presence: 0,
            connection: ConnectionState::Connecting,
            stream: StreamState::Loading,
            pending: HashMap::new(),
            notices: Vec::new(),
        }
    }

    // Reads.

    pub fn participant_id(&self) -> Option<Uuid> {
        self.participant_id
    }

    pub fn webinar(&self) -> Option<&Webinar> {
        self.webinar.as_ref()
    }

    /// The single active interaction, if any.
    pub fn active(&self) -> Option<&Interaction> {
        self.interactions
            .values()
            .filter(|interaction| interaction.is_active())
            .max_by_key(|interaction| (interaction.activated_at, interaction.seq))
    }

    /// Every interaction seen this session, in broadcast order.
    pub fn interactions(&self) -> Vec<&Interaction> {
        let mut seen: Vec<&Interaction> = self.interactions.values().collect();
        seen.sort_by_key(|interaction| interaction.seq);
        seen
    }

    /// Closed interactions, oldest close first.
    pub fn history(&self) -> Vec<&Interaction> {
        let mut closed: Vec<Interaction> =
            self.interactions.values().filter(|i| i.is_closed()).cloned().collect();
        sort_history(&mut closed);
        closed.iter().filter_map(|interaction| self.interactions.get(&interaction.id)).collect()
    }

    pub fn my_response(&self, interaction_id: Uuid) -> Option<&MyResponse> {
        self.my_responses.get(&interaction_id)
    }

    pub fn tally(&self, interaction_id: Uuid) -> Option<&Tally> {
        self.tallies.get(&interaction_id)
    }

    pub fn reaction_counts(&self) -> &ReactionCounts {
        &self.reaction_counts
    }

    pub fn questions(&self) -> &[QuestionView] {
        &self.questions
    }

    pub fn questions_by(&self, order: QuestionOrder) -> Vec<QuestionView> {
        let mut questions = self.questions.clone();
        sort_questions(&mut questions, order);
        questions
    }

    pub fn pending_questions(&self) -> &[PendingQuestion] {
        &self.pending_questions
    }

    pub fn presence(&self) -> u64 {
        self.presence
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn stream(&self) -> StreamState {
        self.stream
    }

    pub fn can_retry_stream(&self) -> bool {
        self.stream == StreamState::Failed
    }

    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    pub fn has_pending_actions(&self) -> bool {
        !self.pending.is_empty()
    }

    /// `answered N / M` over the interactions seen this session.
    pub fn progress(&self) -> Progress {
        let seen: Vec<Uuid> = self
            .interactions
            .values()
            .filter(|interaction| interaction.status != InteractionStatus::Pending)
            .map(|interaction| interaction.id)
            .collect();
        let answered = seen.iter().filter(|id| self.my_responses.contains_key(id)).count();
        Progress { answered, seen: seen.len() }
    }

    // Connection and stream lifecycle.

    pub fn mark_connecting(&mut self) {
        self.connection = ConnectionState::Connecting;
    }

    pub fn mark_reconnecting(&mut self, attempt: u32) {
        self.connection = ConnectionState::Reconnecting { attempt };
    }

    pub fn mark_closed(&mut self) {
        self.connection = ConnectionState::Closed;
    }

    pub fn stream_playing(&mut self) {
        self.stream = StreamState::Playing;
    }

    pub fn stream_failed(&mut self) {
        self.stream = StreamState::Failed;
    }

    pub fn retry_stream(&mut self) -> bool {
        if self.stream != StreamState::Failed {
            return false;
        }
        self.stream = StreamState::Loading;
        true
    }

    // Server frames.

    pub fn apply(&mut self, message: &WsMessage) {
        match message {
            WsMessage::HelloAck { participant, .. } => {
                self.participant_id = Some(participant.id);
            }
            WsMessage::Snapshot { snapshot } => self.replace_with(snapshot),
            WsMessage::InteractionsChanged { interactions } => {
                self.merge_interactions(interactions)
            }
            WsMessage::ResponseAccepted { response, late, client_request_id, .. } => {
                self.pending.remove(client_request_id);
                let accepted =
                    MyResponse { value: response.value.clone(), confirmed: true, late: *late };
                for action in self.pending.values_mut() {
                    if let PendingAction::Response { interaction_id, last_confirmed } = action {
                        if *interaction_id == response.interaction_id {
                            *last_confirmed = Some(accepted.clone());
                        }
                    }
                }
                if !self.has_pending_response(response.interaction_id) {
                    self.my_responses.insert(response.interaction_id, accepted);
                }
            }
            WsMessage::TallyUpdated { tally } => {
                self.tallies.insert(tally.interaction_id, tally.clone());
            }
            WsMessage::ReactionCounts { counts } => {
                for (kind, count) in counts {
                    let shown = self.reaction_counts.entry(kind.clone()).or_default();
                    *shown = (*shown).max(*count);
                }
            }
            WsMessage::QuestionUpserted { question } => self.upsert_question(question),
            WsMessage::PresenceChanged { count } => self.presence = *count,
            WsMessage::WebinarChanged { webinar } => self.webinar = Some(webinar.clone()),
            WsMessage::Error { code, message, client_request_id, .. } => {
                self.apply_error(code, message, *client_request_id)
            }
            WsMessage::Hello { .. }
            | WsMessage::SubmitResponse { .. }
            | WsMessage::FireReactions { .. }
            | WsMessage::SubmitQuestion { .. }
            | WsMessage::UpvoteQuestion { .. }
            | WsMessage::Resync {} => {}
        }
    }

    fn replace_with(&mut self, snapshot: &SessionSnapshot) {
        self.webinar = Some(snapshot.webinar.clone());
        self.interactions = snapshot
            .active
            .iter()
            .chain(snapshot.history.iter())
            .map(|interaction| (interaction.id, interaction.clone()))
            .collect();
        self.my_responses = snapshot
            .my_responses
            .iter()
            .map(|response| {
                (
                    response.interaction_id,
                    MyResponse { value: response.value.clone(), confirmed: true, late: response.late },
                )
            })
            .collect();
        self.tallies =
            snapshot.tallies.iter().map(|tally| (tally.interaction_id, tally.clone())).collect();
        self.reaction_counts = snapshot.reaction_counts.clone();
        self.questions = snapshot.questions.clone();
        sort_questions(&mut self.questions, QuestionOrder::Recent);
        self.pending_questions.clear();
        self.pending.clear();
        self.presence = snapshot.presence;
        self.connection = ConnectionState::Live;
    }

    fn merge_interactions(&mut self, incoming: &[Interaction]) {
        for interaction in incoming {
            if interaction.status == InteractionStatus::Pending {
                continue;
            }
            // Status only moves forward; a late or duplicated row never regresses it.
            if self
                .interactions
                .get(&interaction.id)
                .is_some_and(|known| status_rank(known.status) > status_rank(interaction.status))
            {
                continue;
            }
            self.interactions.insert(interaction.id, interaction.clone());
        }
        self.settle_active();
    }

    /// The newest activation supersedes any other row still marked active,
    /// even before the server's close for it arrives.
    fn settle_active(&mut self) {
        let Some((newest, superseded_at)) = self.active().map(|a| (a.id, a.activated_at)) else {
            return;
        };
        for interaction in self.interactions.values_mut() {
            if interaction.id != newest && interaction.is_active() {
                interaction.status = InteractionStatus::Closed;
                interaction.closed_at = interaction.closed_at.or(superseded_at);
            }
        }
    }

    fn upsert_question(&mut self, question: &QuestionView) {
        if Some(question.question.participant_id) == self.participant_id {
            if let Some(index) =
                self.pending_questions.iter().position(|p| p.text == question.question.text)
            {
                let resolved = self.pending_questions.remove(index);
                self.pending.remove(&resolved.client_request_id);
            }
        }
        match self.questions.iter_mut().find(|q| q.question.id == question.question.id) {
            Some(existing) => *existing = question.clone(),
            None => self.questions.push(question.clone()),
        }
        sort_questions(&mut self.questions, QuestionOrder::Recent);
    }

    fn apply_error(&mut self, code: &str, message: &str, client_request_id: Option<Uuid>) {
        let Some(request_id) = client_request_id else {
            self.notices.push(Notice::Error { code: code.to_string(), message: message.to_string() });
            return;
        };

        match self.pending.remove(&request_id) {
            Some(PendingAction::Response { interaction_id, last_confirmed }) => {
                match last_confirmed {
                    Some(confirmed) => {
                        self.my_responses.insert(interaction_id, confirmed);
                    }
                    None => {
                        self.my_responses.remove(&interaction_id);
                    }
                }
                self.notices.push(if code == "INTERACTION_CLOSED" {
                    Notice::InteractionClosed { interaction_id }
                } else {
                    Notice::ResponseRejected { interaction_id, message: message.to_string() }
                });
            }
            Some(PendingAction::Question) => {
                if let Some(index) =
                    self.pending_questions.iter().position(|p| p.client_request_id == request_id)
                {
                    let rejected = self.pending_questions.remove(index);
                    self.notices.push(Notice::QuestionRejected {
                        text: rejected.text,
                        message: message.to_string(),
                    });
                }
            }
            None => {
                self.notices
                    .push(Notice::Error { code: code.to_string(), message: message.to_string() });
            }
        }
    }

    fn has_pending_response(&self, interaction_id: Uuid) -> bool {
        self.pending.values().any(|action| {
            matches!(action, PendingAction::Response { interaction_id: id, .. } if *id == interaction_id)
        })
    }

    fn last_confirmed(&self, interaction_id: Uuid) -> Option<MyResponse> {
        self.pending.values().find_map(|action| match action {
            PendingAction::Response { interaction_id: id, last_confirmed } if *id == interaction_id => {
                last_confirmed.clone()
            }
            _ => None,
        })
    }

    // Local actions. Each returns the frame to send.

    /// Optimistically record a response.
    pub fn submit_response(
        &mut self,
        interaction_id: Uuid,
        value: &str,
    ) -> Result<WsMessage, ClientError> {
        let interaction = self
            .interactions
            .get(&interaction_id)
            .ok_or_else(|| ClientError::Protocol(format!("unknown interaction {interaction_id}")))?;

        let late = match interaction.status {
            InteractionStatus::Active => false,
            InteractionStatus::Closed if self.accepts_late_response(interaction_id) => true,
            _ => {
                self.notices.push(Notice::InteractionClosed { interaction_id });
                return Err(ClientError::InteractionClosed(interaction_id));
            }
        };

        let client_request_id = Uuid::new_v4();
        let shown = self.my_responses.insert(
            interaction_id,
            MyResponse { value: value.to_string(), confirmed: false, late },
        );
        let last_confirmed = match shown {
            Some(shown) if !shown.confirmed => self.last_confirmed(interaction_id),
            other => other,
        };
        self.pending
            .insert(client_request_id, PendingAction::Response { interaction_id, last_confirmed });
        Ok(WsMessage::SubmitResponse {
            interaction_id,
            value: value.to_string(),
            client_request_id,
        })
    }

    /// Answer whatever is active right now.
    pub fn submit_active_response(&mut self, value: &str) -> Result<WsMessage, ClientError> {
        let interaction_id = self
            .active()
            .map(|interaction| interaction.id)
            .ok_or_else(|| ClientError::Protocol("no interaction is active".into()))?;
        self.submit_response(interaction_id, value)
    }

    pub fn submit_question(&mut self, text: &str) -> Result<WsMessage, ClientError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ClientError::Protocol("question text is empty".into()));
        }
        let client_request_id = Uuid::new_v4();
        self.pending_questions.push(PendingQuestion { client_request_id, text: text.to_string() });
        self.pending.insert(client_request_id, PendingAction::Question);
        Ok(WsMessage::SubmitQuestion { text: text.to_string(), client_request_id })
    }

    pub fn upvote_question(&self, question_id: Uuid) -> Result<WsMessage, ClientError> {
        if !self.questions.iter().any(|q| q.question.id == question_id) {
            return Err(ClientError::Protocol(format!("unknown question {question_id}")));
        }
        Ok(WsMessage::UpvoteQuestion { question_id })
    }

    /// Late answers go only to the most recently closed interaction, once.
    fn accepts_late_response(&self, interaction_id: Uuid) -> bool {
        let allowed = self.webinar.as_ref().is_some_and(|webinar| webinar.allow_late_responses);
        let latest_closed = self.history().last().map(|interaction| interaction.id);
        allowed
            && latest_closed == Some(interaction_id)
            && !self.my_responses.contains_key(&interaction_id)
    }
}

fn status_rank(status: InteractionStatus) -> u8 {
    match status {
        InteractionStatus::Pending => 0,
        InteractionStatus::Active => 1,
        InteractionStatus::Closed => 2,
    }
}
