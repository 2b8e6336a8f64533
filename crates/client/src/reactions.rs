// Local reaction batching.
//
// Taps accumulate per kind and are flushed on a short interval as
// `fire_reactions` frames, each carrying at most `MAX_REACTION_BURST`.

use std::collections::BTreeMap;

use webinar_common::protocol::ws::{WsMessage, MAX_REACTION_BURST};

#[derive(Debug, Default)]
pub struct ReactionBatcher {
    pending: BTreeMap<String, u32>,
}

impl ReactionBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tap(&mut self, kind: &str) {
        self.add(kind, 1);
    }

    pub fn add(&mut self, kind: &str, count: u32) {
        if count == 0 {
            return;
        }
        let pending = self.pending.entry(kind.to_string()).or_default();
        *pending = pending.saturating_add(count);
    }

    pub fn pending(&self, kind: &str) -> u32 {
        self.pending.get(kind).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take everything batched so far as frames ready to send.
    pub fn drain(&mut self) -> Vec<WsMessage> {
        let mut frames = Vec::new();
        for (kind, mut remaining) in std::mem::take(&mut self.pending) {
            while remaining > 0 {
                let count = remaining.min(MAX_REACTION_BURST);
                frames.push(WsMessage::FireReactions { kind: kind.clone(), count });
                remaining -= count;
            }
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(frames: &[WsMessage]) -> Vec<(String, u32)> {
        frames
            .iter()
            .map(|frame| match frame {
                WsMessage::FireReactions { kind, count } => (kind.clone(), *count),
                other => panic!("unexpected frame {}", other.type_name()),
            })
            .collect()
    }

    #[test]
    fn taps_are_batched_per_kind() {
        let mut batcher = ReactionBatcher::new();
        batcher.tap("clap");
        batcher.tap("clap");
        batcher.tap("👍");
        assert_eq!(batcher.pending("clap"), 2);

        let frames = batcher.drain();
        assert_eq!(counts(&frames), vec![("clap".into(), 2), ("👍".into(), 1)]);
        assert!(batcher.is_empty());
        assert!(batcher.drain().is_empty());
    }

    #[test]
    fn large_bursts_are_split() {
        let mut batcher = ReactionBatcher::new();
        batcher.add("clap", MAX_REACTION_BURST * 2 + 3);
        let frames = batcher.drain();
        assert_eq!(
            counts(&frames),
            vec![
                ("clap".into(), MAX_REACTION_BURST),
                ("clap".into(), MAX_REACTION_BURST),
                ("clap".into(), 3)
            ]
        );
    }

    #[test]
    fn zero_counts_are_ignored() {
        let mut batcher = ReactionBatcher::new();
        batcher.add("clap", 0);
        assert!(batcher.is_empty());
    }
}
