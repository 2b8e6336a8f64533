// In-process table storage used when no database is configured and in tests.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use uuid::Uuid;

use super::{Filter, Mutation, OnConflict, Table, UpsertOutcome};

#[derive(Debug, Default)]
pub struct MemoryTables {
    tables: HashMap<Table, BTreeMap<String, StoredRow>>,
    next_seq: i64,
}

#[derive(Debug, Clone)]
struct StoredRow {
    webinar_id: Uuid,
    body: Value,
    seq: i64,
}

impl MemoryTables {
    /// Applies all mutations; the caller holds the write lock so the batch is
    /// atomic with respect to readers.
    pub(crate) fn commit(
        &mut self,
        table: Table,
        mutations: Vec<Mutation>,
        on_conflict: OnConflict,
    ) -> Vec<(Value, UpsertOutcome)> {
        let rows = self.tables.entry(table).or_default();
        let mut applied = Vec::with_capacity(mutations.len());

        for mutation in mutations {
            match rows.get_mut(&mutation.conflict_key) {
                Some(stored) => match on_conflict {
                    OnConflict::KeepExisting => {
                        applied.push((stored.body.clone(), UpsertOutcome::Existing));
                    }
                    OnConflict::Replace => {
                        stored.body = mutation.body;
                        stored.webinar_id = mutation.webinar_id;
                        applied.push((stored.body.clone(), UpsertOutcome::Replaced));
                    }
                },
                None => {
                    self.next_seq += 1;
                    applied.push((mutation.body.clone(), UpsertOutcome::Inserted));
                    rows.insert(
                        mutation.conflict_key,
                        StoredRow {
                            webinar_id: mutation.webinar_id,
                            body: mutation.body,
                            seq: self.next_seq,
                        },
                    );
                }
            }
        }

        applied
    }

    pub(crate) fn get(&self, table: Table, conflict_key: &str) -> Option<Value> {
        self.tables.get(&table)?.get(conflict_key).map(|stored| stored.body.clone())
    }

    pub(crate) fn query(&self, table: Table, filter: &Filter) -> Vec<Value> {
        let Some(rows) = self.tables.get(&table) else {
            return Vec::new();
        };

        let mut matched: Vec<&StoredRow> =
            rows.values().filter(|stored| filter.matches(stored.webinar_id, &stored.body)).collect();
        matched.sort_by_key(|stored| stored.seq);
        matched.into_iter().map(|stored| stored.body.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mutation(key: &str, webinar_id: Uuid, body: Value) -> Mutation {
        Mutation { conflict_key: key.to_string(), webinar_id, body }
    }

    #[test]
    fn query_returns_rows_in_insertion_order() {
        let mut tables = MemoryTables::default();
        let webinar_id = Uuid::new_v4();
        tables.commit(
            Table::Questions,
            vec![
                mutation("z", webinar_id, json!({ "n": 1 })),
                mutation("a", webinar_id, json!({ "n": 2 })),
            ],
            OnConflict::KeepExisting,
        );

        let rows = tables.query(Table::Questions, &Filter::webinar(webinar_id));
        assert_eq!(rows, vec![json!({ "n": 1 }), json!({ "n": 2 })]);
    }

    #[test]
    fn replace_keeps_original_position() {
        let mut tables = MemoryTables::default();
        let webinar_id = Uuid::new_v4();
        tables.commit(
            Table::Interactions,
            vec![
                mutation("first", webinar_id, json!({ "status": "active" })),
                mutation("second", webinar_id, json!({ "status": "pending" })),
            ],
            OnConflict::KeepExisting,
        );
        let applied = tables.commit(
            Table::Interactions,
            vec![mutation("first", webinar_id, json!({ "status": "closed" }))],
            OnConflict::Replace,
        );

        assert_eq!(applied[0].1, UpsertOutcome::Replaced);
        let rows = tables.query(Table::Interactions, &Filter::webinar(webinar_id));
        assert_eq!(rows[0], json!({ "status": "closed" }));
    }

    #[test]
    fn field_filter_matches_exact_values_only() {
        let mut tables = MemoryTables::default();
        let webinar_id = Uuid::new_v4();
        tables.commit(
            Table::Responses,
            vec![
                mutation("1", webinar_id, json!({ "value": "A" })),
                mutation("2", webinar_id, json!({ "value": "B" })),
            ],
            OnConflict::KeepExisting,
        );

        let filter = Filter::webinar(webinar_id).field("value", "B");
        assert_eq!(tables.query(Table::Responses, &filter), vec![json!({ "value": "B" })]);
        assert!(tables.query(Table::Responses, &Filter::webinar(Uuid::new_v4())).is_empty());
    }
}
