// Builds the per-participant session snapshot from a store snapshot.

use uuid::Uuid;
use webinar_common::types::{
    sort_history, Interaction, InteractionStatus, Question, QuestionOrder, QuestionVote, Response,
    SessionSnapshot, Webinar,
};

use super::{aggregator::compute_tally, qa::question_views, EngineError};
use crate::store::{ReactionTotals, StoreSnapshot, Table};

/// Tables a live session subscribes to.
pub const SESSION_TABLES: [Table; 6] = [
    Table::Webinars,
    Table::Interactions,
    Table::Responses,
    Table::ReactionTotals,
    Table::Questions,
    Table::QuestionVotes,
];

pub fn build_session_snapshot(
    snapshot: &StoreSnapshot,
    participant_id: Uuid,
    presence: u64,
) -> Result<SessionSnapshot, EngineError> {
    let webinar =
        snapshot.rows::<Webinar>()?.into_iter().next().ok_or(EngineError::NotFound("webinar"))?;

    let interactions = snapshot.rows::<Interaction>()?;
    let responses = snapshot.rows::<Response>()?;

    let active = interactions.iter().find(|interaction| interaction.is_active()).cloned();
    let mut history: Vec<Interaction> =
        interactions.iter().filter(|interaction| interaction.is_closed()).cloned().collect();
    sort_history(&mut history);

    let tallies = active
        .iter()
        .chain(history.iter())
        .filter(|interaction| interaction.status != InteractionStatus::Pending)
        .map(|interaction| compute_tally(interaction, &responses))
        .collect();

    let my_responses =
        responses.into_iter().filter(|response| response.participant_id == participant_id).collect();

    let reaction_counts = snapshot
        .rows::<ReactionTotals>()?
        .into_iter()
        .next()
        .map(|totals| totals.counts)
        .unwrap_or_default();

    let questions = question_views(
        snapshot.rows::<Question>()?,
        &snapshot.rows::<QuestionVote>()?,
        QuestionOrder::Recent,
    );

    Ok(SessionSnapshot {
        webinar,
        active,
        history,
        my_responses,
        tallies,
        reaction_counts,
        questions,
        presence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::to_value;
    use webinar_common::types::{InteractionKind, WebinarStatus};

    fn webinar(id: Uuid) -> Webinar {
        Webinar {
            id,
            slug: "snap".into(),
            title: "Snap".into(),
            starts_at: Utc::now(),
            ends_at: None,
            status: WebinarStatus::Live,
            stream_url: "https://stream.example/embed".into(),
            allow_late_responses: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn interaction(webinar_id: Uuid, seq: i64, status: InteractionStatus) -> Interaction {
        Interaction {
            id: Uuid::new_v4(),
            webinar_id,
            kind: InteractionKind::Poll,
            prompt: format!("Q{seq}"),
            options: vec!["A".into(), "B".into()],
            scale: None,
            seq,
            status,
            created_at: Utc::now(),
            activated_at: None,
            closed_at: (status == InteractionStatus::Closed)
                .then(|| Utc::now() + chrono::Duration::seconds(seq)),
        }
    }

    #[test]
    fn snapshot_scopes_responses_to_participant_and_skips_pending_tallies() {
        let webinar_id = Uuid::new_v4();
        let me = Uuid::new_v4();
        let closed = interaction(webinar_id, 1, InteractionStatus::Closed);
        let active = interaction(webinar_id, 2, InteractionStatus::Active);
        let pending = interaction(webinar_id, 3, InteractionStatus::Pending);
        let response = |participant_id: Uuid, value: &str| Response {
            id: Uuid::new_v4(),
            interaction_id: closed.id,
            webinar_id,
            participant_id,
            value: value.into(),
            late: false,
            submitted_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let mut store_snapshot = StoreSnapshot::default();
        store_snapshot.tables.insert(Table::Webinars, vec![to_value(webinar(webinar_id)).unwrap()]);
        store_snapshot.tables.insert(
            Table::Interactions,
            vec![
                to_value(&closed).unwrap(),
                to_value(&active).unwrap(),
                to_value(&pending).unwrap(),
            ],
        );
        store_snapshot.tables.insert(
            Table::Responses,
            vec![to_value(response(me, "A")).unwrap(), to_value(response(Uuid::new_v4(), "B")).unwrap()],
        );

        let snapshot = build_session_snapshot(&store_snapshot, me, 7).unwrap();

        assert_eq!(snapshot.active.as_ref().map(|i| i.id), Some(active.id));
        assert_eq!(snapshot.history.iter().map(|i| i.id).collect::<Vec<_>>(), vec![closed.id]);
        assert_eq!(snapshot.my_responses.len(), 1);
        assert_eq!(snapshot.tallies.len(), 2);
        let closed_tally = snapshot.tallies.iter().find(|t| t.interaction_id == closed.id).unwrap();
        assert_eq!(closed_tally.count_for("A"), 1);
        assert_eq!(closed_tally.count_for("B"), 1);
        assert_eq!(snapshot.presence, 7);
        assert!(snapshot.reaction_counts.is_empty());
    }

    #[test]
    fn missing_webinar_is_not_found() {
        let err = build_session_snapshot(&StoreSnapshot::default(), Uuid::new_v4(), 0).unwrap_err();
        assert!(matches!(err, EngineError::NotFound("webinar")));
    }
}
