// Property tests for the session view under at-least-once, reordered delivery.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::{prelude::*, sample::Index};
use uuid::Uuid;
use webinar_client::SessionView;
use webinar_common::{
    protocol::ws::WsMessage,
    types::{
        Interaction, InteractionKind, InteractionStatus, ReactionCounts, SessionSnapshot, Webinar,
        WebinarStatus,
    },
};

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap()
}

fn webinar() -> Webinar {
    Webinar {
        id: Uuid::from_u128(1),
        slug: "props".into(),
        title: "Props".into(),
        starts_at: base(),
        ends_at: None,
        status: WebinarStatus::Live,
        stream_url: "https://stream.example/embed".into(),
        allow_late_responses: false,
        created_at: base(),
        updated_at: base(),
    }
}

fn row(seq: i64, status: InteractionStatus) -> Interaction {
    Interaction {
        id: Uuid::from_u128(100 + seq as u128),
        webinar_id: Uuid::from_u128(1),
        kind: InteractionKind::Poll,
        prompt: format!("Question {seq}"),
        options: vec!["A".into(), "B".into()],
        scale: None,
        seq,
        status,
        created_at: base(),
        activated_at: Some(base() + Duration::minutes(seq)),
        // Each interaction closes the moment the next one activates.
        closed_at: (status == InteractionStatus::Closed).then(|| base() + Duration::minutes(seq + 1)),
    }
}

/// Frames a host emits when activating interactions 1..=count in turn.
fn activation_frames(count: i64) -> Vec<WsMessage> {
    (1..=count)
        .map(|seq| {
            let mut rows = Vec::new();
            if seq > 1 {
                rows.push(row(seq - 1, InteractionStatus::Closed));
            }
            rows.push(row(seq, InteractionStatus::Active));
            WsMessage::InteractionsChanged { interactions: rows }
        })
        .collect()
}

fn joined_view() -> SessionView {
    let mut view = SessionView::new();
    view.apply(&WsMessage::Snapshot {
        snapshot: Box::new(SessionSnapshot {
            webinar: webinar(),
            active: None,
            history: Vec::new(),
            my_responses: Vec::new(),
            tallies: Vec::new(),
            reaction_counts: ReactionCounts::new(),
            questions: Vec::new(),
            presence: 1,
        }),
    });
    view
}

fn assert_render_invariants(view: &SessionView) -> Result<(), TestCaseError> {
    let active: Vec<_> = view.interactions().into_iter().filter(|i| i.is_active()).collect();
    prop_assert!(active.len() <= 1, "more than one active interaction");
    if let Some(active) = view.active() {
        prop_assert!(view.history().iter().all(|closed| closed.id != active.id));
    }
    let closing: Vec<_> = view.history().iter().map(|i| i.closed_at).collect();
    prop_assert!(closing.windows(2).all(|pair| pair[0] <= pair[1]), "history out of order");
    let progress = view.progress();
    prop_assert!(progress.answered <= progress.seen);
    Ok(())
}

proptest! {
    #[test]
    fn reordered_and_duplicated_frames_keep_a_single_active(
        count in 1i64..8,
        deliveries in prop::collection::vec(any::<Index>(), 0..40),
    ) {
        let frames = activation_frames(count);
        let mut view = joined_view();

        for index in &deliveries {
            view.apply(&frames[index.index(frames.len())]);
            assert_render_invariants(&view)?;
        }

        // Every frame is eventually delivered at least once.
        for frame in &frames {
            view.apply(frame);
            assert_render_invariants(&view)?;
        }

        prop_assert_eq!(view.active().map(|i| i.seq), Some(count));
        let history: Vec<i64> = view.history().iter().map(|i| i.seq).collect();
        prop_assert_eq!(history, (1..count).collect::<Vec<_>>());
    }

    #[test]
    fn displayed_reaction_counts_never_decrease(
        updates in prop::collection::vec(
            prop::collection::btree_map(prop::sample::select(vec!["clap", "heart"]), 0u64..500, 0..3),
            1..30,
        ),
    ) {
        let mut view = joined_view();
        let mut high_water: BTreeMap<String, u64> = BTreeMap::new();

        for update in updates {
            let counts: ReactionCounts =
                update.into_iter().map(|(kind, count)| (kind.to_string(), count)).collect();
            view.apply(&WsMessage::ReactionCounts { counts: counts.clone() });

            for (kind, count) in counts {
                let seen = high_water.entry(kind).or_default();
                *seen = (*seen).max(count);
            }
            for (kind, expected) in &high_water {
                prop_assert_eq!(view.reaction_counts().get(kind).copied(), Some(*expected));
            }
        }
    }
}
