// Generic live datastore boundary.
//
// Every engine table is a set of JSON rows keyed by a conflict key and scoped
// to one webinar. The store offers upsert-with-conflict-semantics, atomic
// multi-row commits, filtered queries and snapshot-first subscriptions.

pub mod memory;
pub mod postgres;
mod records;

use std::{collections::HashMap, sync::Arc};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use sqlx::PgPool;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub use records::{participant_key, ReactionTotals};

/// Change sets buffered per subscriber before it is considered lagging.
pub const CHANGE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Webinars,
    Participants,
    Interactions,
    Responses,
    ReactionTotals,
    Questions,
    QuestionVotes,
}

impl Table {
    pub const ALL: [Table; 7] = [
        Table::Webinars,
        Table::Participants,
        Table::Interactions,
        Table::Responses,
        Table::ReactionTotals,
        Table::Questions,
        Table::QuestionVotes,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Webinars => "webinars",
            Self::Participants => "participants",
            Self::Interactions => "interactions",
            Self::Responses => "responses",
            Self::ReactionTotals => "reaction_totals",
            Self::Questions => "questions",
            Self::QuestionVotes => "question_votes",
        }
    }
}

/// A typed row stored in one [`Table`].
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const TABLE: Table;

    /// Uniqueness key within the table. Two rows with the same key conflict.
    fn conflict_key(&self) -> String;

    fn webinar_id(&self) -> Uuid;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflict {
    /// Leave the stored row untouched and return it.
    KeepExisting,
    /// Overwrite the stored row with the new one.
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Existing,
    Replaced,
}

impl UpsertOutcome {
    pub fn changed(self) -> bool {
        !matches!(self, Self::Existing)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Upserted<R> {
    pub row: R,
    pub outcome: UpsertOutcome,
}

/// Equality filter over top-level row fields, optionally scoped to a webinar.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub webinar_id: Option<Uuid>,
    pub eq: Map<String, Value>,
}

impl Filter {
    pub fn webinar(webinar_id: Uuid) -> Self {
        Self { webinar_id: Some(webinar_id), eq: Map::new() }
    }

    pub fn field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.eq.insert(name.to_string(), value.into());
        self
    }

    pub(crate) fn matches(&self, webinar_id: Uuid, body: &Value) -> bool {
        if self.webinar_id.is_some_and(|expected| expected != webinar_id) {
            return false;
        }
        self.eq.iter().all(|(name, expected)| body.get(name) == Some(expected))
    }
}

/// Rows of one table that changed in a single commit.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    pub table: Table,
    pub webinar_id: Uuid,
    pub rows: Vec<Value>,
}

impl ChangeSet {
    pub fn decode<R: Record>(&self) -> Result<Vec<R>, StoreError> {
        decode_rows(&self.rows)
    }
}

/// Current rows of the subscribed tables, in insertion order per table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    pub tables: HashMap<Table, Vec<Value>>,
}

impl StoreSnapshot {
    pub fn rows<R: Record>(&self) -> Result<Vec<R>, StoreError> {
        self.tables.get(&R::TABLE).map(|rows| decode_rows(rows)).unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    /// Current state, always delivered first.
    Snapshot(StoreSnapshot),
    Change(Arc<ChangeSet>),
    /// The subscriber fell behind; replaces all previously delivered state.
    Resync(StoreSnapshot),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("datastore backend error: {0}")]
    Backend(#[from] sqlx::Error),
    #[error("row serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Fan-out of committed change sets to live subscriptions.
#[derive(Debug, Clone)]
pub struct ChangeHub {
    sender: broadcast::Sender<Arc<ChangeSet>>,
}

impl Default for ChangeHub {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { sender }
    }
}

impl ChangeHub {
    pub(crate) fn publish(&self, change: ChangeSet) {
        if change.rows.is_empty() {
            return;
        }
        // No receivers is not an error: nobody is watching this webinar.
        let _ = self.sender.send(Arc::new(change));
    }

    fn receiver(&self) -> broadcast::Receiver<Arc<ChangeSet>> {
        self.sender.subscribe()
    }
}

#[derive(Clone)]
pub enum LiveStore {
    Postgres { pool: PgPool, hub: ChangeHub },
    Memory { tables: Arc<RwLock<memory::MemoryTables>>, hub: ChangeHub },
}

impl LiveStore {
    pub fn memory() -> Self {
        Self::Memory { tables: Arc::default(), hub: ChangeHub::default() }
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self::Postgres { pool, hub: ChangeHub::default() }
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Postgres { .. } => "postgres",
            Self::Memory { .. } => "memory",
        }
    }

    fn hub(&self) -> &ChangeHub {
        match self {
            Self::Postgres { hub, .. } | Self::Memory { hub, .. } => hub,
        }
    }

    /// Insert a row, resolving a conflict on its key per `on_conflict`.
    /// A conflict is never an error.
    pub async fn upsert<R: Record>(
        &self,
        row: &R,
        on_conflict: OnConflict,
    ) -> Result<Upserted<R>, StoreError> {
        let mut committed = self.commit(std::slice::from_ref(row), on_conflict).await?;
        Ok(committed.remove(0))
    }

    /// Upsert several rows of one table atomically, publishing one change set.
    pub async fn commit<R: Record>(
        &self,
        rows: &[R],
        on_conflict: OnConflict,
    ) -> Result<Vec<Upserted<R>>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let webinar_id = rows[0].webinar_id();
        let mutations = rows
            .iter()
            .map(|row| {
                Ok(Mutation {
                    conflict_key: row.conflict_key(),
                    webinar_id: row.webinar_id(),
                    body: serde_json::to_value(row)?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        let span = info_span!(
            "store.commit",
            backend = self.backend_name(),
            table = R::TABLE.as_str(),
            rows = mutations.len(),
        );
        let applied = async {
            match self {
                Self::Postgres { pool, hub } => {
                    let applied =
                        postgres::commit(pool, R::TABLE, &mutations, on_conflict).await?;
                    hub.publish(change_set(R::TABLE, webinar_id, &applied));
                    Ok::<_, StoreError>(applied)
                }
                Self::Memory { tables, hub } => {
                    let mut tables = tables.write().await;
                    let applied = tables.commit(R::TABLE, mutations, on_conflict);
                    // Published under the write lock so subscribers observe
                    // commits in order.
                    hub.publish(change_set(R::TABLE, webinar_id, &applied));
                    Ok(applied)
                }
            }
        }
        .instrument(span)
        .await?;

        applied
            .into_iter()
            .map(|(body, outcome)| Ok(Upserted { row: serde_json::from_value(body)?, outcome }))
            .collect()
    }

    pub async fn query<R: Record>(&self, filter: &Filter) -> Result<Vec<R>, StoreError> {
        let rows = self.query_raw(R::TABLE, filter).await?;
        decode_rows(&rows)
    }

    pub async fn get<R: Record>(&self, conflict_key: &str) -> Result<Option<R>, StoreError> {
        let body = match self {
            Self::Postgres { pool, .. } => postgres::get(pool, R::TABLE, conflict_key).await?,
            Self::Memory { tables, .. } => tables.read().await.get(R::TABLE, conflict_key),
        };
        body.map(serde_json::from_value).transpose().map_err(StoreError::from)
    }

    async fn query_raw(&self, table: Table, filter: &Filter) -> Result<Vec<Value>, StoreError> {
        match self {
            Self::Postgres { pool, .. } => postgres::query(pool, table, filter).await,
            Self::Memory { tables, .. } => Ok(tables.read().await.query(table, filter)),
        }
    }

    /// Subscribe to a webinar's rows in `tables`.
    ///
    /// The returned subscription yields the current snapshot first, then
    /// change sets committed after the subscription was taken.
    pub fn subscribe(&self, webinar_id: Uuid, tables: &[Table]) -> Subscription {
        Subscription {
            store: self.clone(),
            webinar_id,
            tables: tables.to_vec(),
            receiver: self.hub().receiver(),
            pending: Some(PendingSnapshot::Initial),
        }
    }

    /// Current rows of `tables` for one webinar.
    pub async fn snapshot(
        &self,
        webinar_id: Uuid,
        tables: &[Table],
    ) -> Result<StoreSnapshot, StoreError> {
        let filter = Filter::webinar(webinar_id);
        let mut snapshot = StoreSnapshot::default();
        for table in tables {
            snapshot.tables.insert(*table, self.query_raw(*table, &filter).await?);
        }
        Ok(snapshot)
    }
}

pub(crate) struct Mutation {
    pub conflict_key: String,
    pub webinar_id: Uuid,
    pub body: Value,
}

/// A live view over one webinar's tables.
pub struct Subscription {
    store: LiveStore,
    webinar_id: Uuid,
    tables: Vec<Table>,
    receiver: broadcast::Receiver<Arc<ChangeSet>>,
    pending: Option<PendingSnapshot>,
}

#[derive(Debug, Clone, Copy)]
enum PendingSnapshot {
    Initial,
    Resync,
}

impl Subscription {
    pub fn webinar_id(&self) -> Uuid {
        self.webinar_id
    }

    /// Next event, or `None` once the store has shut down.
    ///
    /// Cancel-safe: a snapshot interrupted mid-read is retried on the next call.
    pub async fn next(&mut self) -> Result<Option<SubscriptionEvent>, StoreError> {
        loop {
            if let Some(pending) = self.pending {
                // The receiver already exists, so nothing committed after this
                // read can be missed.
                let snapshot = self.store.snapshot(self.webinar_id, &self.tables).await?;
                self.pending = None;
                return Ok(Some(match pending {
                    PendingSnapshot::Initial => SubscriptionEvent::Snapshot(snapshot),
                    PendingSnapshot::Resync => SubscriptionEvent::Resync(snapshot),
                }));
            }

            match self.receiver.recv().await {
                Ok(change) => {
                    if change.webinar_id == self.webinar_id && self.tables.contains(&change.table) {
                        return Ok(Some(SubscriptionEvent::Change(change)));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(webinar_id = %self.webinar_id, skipped, "subscription lagged; resyncing");
                    self.receiver = self.receiver.resubscribe();
                    self.pending = Some(PendingSnapshot::Resync);
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}

fn change_set(table: Table, webinar_id: Uuid, applied: &[(Value, UpsertOutcome)]) -> ChangeSet {
    ChangeSet {
        table,
        webinar_id,
        rows: applied
            .iter()
            .filter(|(_, outcome)| outcome.changed())
            .map(|(body, _)| body.clone())
            .collect(),
    }
}

fn decode_rows<R: Record>(rows: &[Value]) -> Result<Vec<R>, StoreError> {
    rows.iter().map(|row| serde_json::from_value(row.clone()).map_err(StoreError::from)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use webinar_common::types::{Participant, QuestionVote};

    fn participant(webinar_id: Uuid, phone: &str, name: Option<&str>) -> Participant {
        Participant {
            id: Uuid::new_v4(),
            webinar_id,
            phone: phone.to_string(),
            display_name: name.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn keep_existing_returns_stored_row_on_conflict() {
        let store = LiveStore::memory();
        let webinar_id = Uuid::new_v4();
        let first = participant(webinar_id, "+989123456789", None);
        let second = participant(webinar_id, "+989123456789", Some("Sara"));

        let inserted = store.upsert(&first, OnConflict::KeepExisting).await.unwrap();
        let existing = store.upsert(&second, OnConflict::KeepExisting).await.unwrap();

        assert_eq!(inserted.outcome, UpsertOutcome::Inserted);
        assert_eq!(existing.outcome, UpsertOutcome::Existing);
        assert_eq!(existing.row.id, first.id);
        assert_eq!(store.query::<Participant>(&Filter::webinar(webinar_id)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replace_overwrites_stored_row() {
        let store = LiveStore::memory();
        let webinar_id = Uuid::new_v4();
        let first = participant(webinar_id, "+989123456789", None);
        store.upsert(&first, OnConflict::KeepExisting).await.unwrap();

        let mut renamed = first.clone();
        renamed.display_name = Some("Sara".into());
        let replaced = store.upsert(&renamed, OnConflict::Replace).await.unwrap();

        assert_eq!(replaced.outcome, UpsertOutcome::Replaced);
        let stored = store.get::<Participant>(&first.conflict_key()).await.unwrap().unwrap();
        assert_eq!(stored.display_name.as_deref(), Some("Sara"));
    }

    #[tokio::test]
    async fn query_filters_by_webinar_and_field() {
        let store = LiveStore::memory();
        let webinar_a = Uuid::new_v4();
        let webinar_b = Uuid::new_v4();
        let question_id = Uuid::new_v4();
        let votes = [
            QuestionVote {
                question_id,
                webinar_id: webinar_a,
                participant_id: Uuid::new_v4(),
                created_at: Utc::now(),
            },
            QuestionVote {
                question_id: Uuid::new_v4(),
                webinar_id: webinar_a,
                participant_id: Uuid::new_v4(),
                created_at: Utc::now(),
            },
        ];
        store.commit(&votes, OnConflict::KeepExisting).await.unwrap();
        store
            .upsert(&participant(webinar_b, "+989120000000", None), OnConflict::KeepExisting)
            .await
            .unwrap();

        let filter = Filter::webinar(webinar_a).field("question_id", question_id.to_string());
        let matched = store.query::<QuestionVote>(&filter).await.unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].question_id, question_id);
        assert!(store.query::<Participant>(&Filter::webinar(webinar_a)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscription_delivers_snapshot_then_changes() {
        let store = LiveStore::memory();
        let webinar_id = Uuid::new_v4();
        let early = participant(webinar_id, "+989121111111", None);
        store.upsert(&early, OnConflict::KeepExisting).await.unwrap();

        let mut subscription = store.subscribe(webinar_id, &[Table::Participants]);
        let late = participant(webinar_id, "+989122222222", None);
        store.upsert(&late, OnConflict::KeepExisting).await.unwrap();
        store
            .upsert(&participant(Uuid::new_v4(), "+989123333333", None), OnConflict::KeepExisting)
            .await
            .unwrap();

        match subscription.next().await.unwrap() {
            Some(SubscriptionEvent::Snapshot(snapshot)) => {
                let rows = snapshot.rows::<Participant>().unwrap();
                assert!(rows.iter().any(|row| row.id == early.id));
            }
            other => panic!("expected snapshot first, got {other:?}"),
        }
        match subscription.next().await.unwrap() {
            Some(SubscriptionEvent::Change(change)) => {
                let rows = change.decode::<Participant>().unwrap();
                assert_eq!(rows, vec![late]);
            }
            other => panic!("expected change, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unchanged_upsert_publishes_nothing() {
        let store = LiveStore::memory();
        let webinar_id = Uuid::new_v4();
        let row = participant(webinar_id, "+989121111111", None);
        store.upsert(&row, OnConflict::KeepExisting).await.unwrap();

        let mut subscription = store.subscribe(webinar_id, &[Table::Participants]);
        assert!(matches!(subscription.next().await.unwrap(), Some(SubscriptionEvent::Snapshot(_))));

        store.upsert(&row, OnConflict::KeepExisting).await.unwrap();
        let pending = tokio::time::timeout(std::time::Duration::from_millis(50), subscription.next()).await;
        assert!(pending.is_err(), "no change set expected for a kept row");
    }

    #[tokio::test]
    async fn lagging_subscriber_receives_resync_snapshot() {
        let store = LiveStore::memory();
        let webinar_id = Uuid::new_v4();
        let mut subscription = store.subscribe(webinar_id, &[Table::Participants]);
        assert!(matches!(subscription.next().await.unwrap(), Some(SubscriptionEvent::Snapshot(_))));

        for index in 0..(CHANGE_CHANNEL_CAPACITY + 8) {
            let phone = format!("+98912{index:07}");
            store.upsert(&participant(webinar_id, &phone, None), OnConflict::KeepExisting).await.unwrap();
        }

        match subscription.next().await.unwrap() {
            Some(SubscriptionEvent::Resync(snapshot)) => {
                assert_eq!(
                    snapshot.rows::<Participant>().unwrap().len(),
                    CHANGE_CHANNEL_CAPACITY + 8
                );
            }
            other => panic!("expected resync, got {other:?}"),
        }
    }
}
