// Reaction counter. Best-effort: bursts are coalesced in memory and flushed
// into the webinar's cumulative totals row on a short interval.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Mutex,
};

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;
use webinar_common::{protocol::ws::MAX_REACTION_BURST, types::ReactionCounts};

use super::EngineError;
use crate::{
    metrics,
    store::{LiveStore, OnConflict, ReactionTotals},
};

pub const REACTION_FLUSH_INTERVAL_MS: u64 = 250;

pub struct ReactionCounter {
    store: LiveStore,
    allowed: BTreeSet<String>,
    pending: Mutex<HashMap<Uuid, ReactionCounts>>,
    flushing: tokio::sync::Mutex<()>,
}

impl ReactionCounter {
    pub fn new(store: LiveStore, allowed: impl IntoIterator<Item = String>) -> Self {
        Self {
            store,
            allowed: allowed.into_iter().collect(),
            pending: Mutex::new(HashMap::new()),
            flushing: tokio::sync::Mutex::new(()),
        }
    }

    pub fn allowed_kinds(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }

    /// Queue `count` reactions of `kind`. Counts above the burst cap are clamped.
    pub fn fire(
        &self,
        webinar_id: Uuid,
        participant_id: Uuid,
        kind: &str,
        count: u32,
    ) -> Result<u32, EngineError> {
        if !self.allowed.contains(kind) {
            return Err(EngineError::validation(format!("reaction kind `{kind}` is not allowed")));
        }
        let accepted = count.min(MAX_REACTION_BURST);
        if accepted == 0 {
            return Ok(0);
        }

        {
            let mut pending = self.pending.lock().expect("reaction pending map lock poisoned");
            *pending.entry(webinar_id).or_default().entry(kind.to_string()).or_default() +=
                u64::from(accepted);
        }
        metrics::record_reactions(kind, u64::from(accepted));
        debug!(webinar_id = %webinar_id, participant_id = %participant_id, kind, accepted, "reactions queued");
        Ok(accepted)
    }

    /// Fold queued bursts into the stored totals. Returns how many webinars changed.
    ///
    /// Deltas that fail to persist are re-queued for the next flush.
    pub async fn flush(&self) -> Result<usize, EngineError> {
        let _flushing = self.flushing.lock().await;
        let drained: HashMap<Uuid, ReactionCounts> = {
            let mut pending = self.pending.lock().expect("reaction pending map lock poisoned");
            std::mem::take(&mut *pending)
        };

        let mut flushed = 0;
        let mut failure = None;
        for (webinar_id, deltas) in drained {
            match self.apply(webinar_id, &deltas).await {
                Ok(()) => flushed += 1,
                Err(error) => {
                    self.requeue(webinar_id, deltas);
                    failure = Some(error);
                }
            }
        }

        match failure {
            Some(error) => Err(error),
            None => Ok(flushed),
        }
    }

    pub async fn counts(&self, webinar_id: Uuid) -> Result<ReactionCounts, EngineError> {
        Ok(self
            .store
            .get::<ReactionTotals>(&webinar_id.to_string())
            .await?
            .map(|totals| totals.counts)
            .unwrap_or_default())
    }

    /// Callers hold `flushing`, so the read-modify-write cannot interleave.
    async fn apply(&self, webinar_id: Uuid, deltas: &ReactionCounts) -> Result<(), EngineError> {
        let mut counts = self.counts(webinar_id).await?;
        for (kind, delta) in deltas {
            *counts.entry(kind.clone()).or_default() += delta;
        }
        let totals = ReactionTotals { webinar_id, counts, updated_at: Utc::now() };
        self.store.upsert(&totals, OnConflict::Replace).await?;
        Ok(())
    }

    fn requeue(&self, webinar_id: Uuid, deltas: ReactionCounts) {
        let mut pending = self.pending.lock().expect("reaction pending map lock poisoned");
        let queued = pending.entry(webinar_id).or_default();
        for (kind, delta) in deltas {
            *queued.entry(kind).or_default() += delta;
        }
    }
}
