// Postgres backend for the live datastore.
//
// All tables share `live_rows`; uniqueness is the `(table_name, conflict_key)`
// primary key, so concurrent writers can never create duplicate rows.

use serde_json::Value;
use sqlx::PgPool;

use super::{Filter, Mutation, OnConflict, StoreError, Table, UpsertOutcome};

const UPSERT_SQL: &str = r#"
    INSERT INTO live_rows (table_name, conflict_key, webinar_id, body)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (table_name, conflict_key) DO UPDATE
    SET body = CASE WHEN $5 THEN EXCLUDED.body ELSE live_rows.body END,
        updated_at = CASE WHEN $5 THEN now() ELSE live_rows.updated_at END
    RETURNING body, (xmax = 0) AS inserted
"#;

pub(crate) async fn commit(
    pool: &PgPool,
    table: Table,
    mutations: &[Mutation],
    on_conflict: OnConflict,
) -> Result<Vec<(Value, UpsertOutcome)>, StoreError> {
    let replace = on_conflict == OnConflict::Replace;
    let mut tx = pool.begin().await?;
    let mut applied = Vec::with_capacity(mutations.len());

    for mutation in mutations {
        let (body, inserted) = sqlx::query_as::<_, (Value, bool)>(UPSERT_SQL)
            .bind(table.as_str())
            .bind(&mutation.conflict_key)
            .bind(mutation.webinar_id)
            .bind(&mutation.body)
            .bind(replace)
            .fetch_one(&mut *tx)
            .await?;

        let outcome = match (inserted, replace) {
            (true, _) => UpsertOutcome::Inserted,
            (false, true) => UpsertOutcome::Replaced,
            (false, false) => UpsertOutcome::Existing,
        };
        applied.push((body, outcome));
    }

    tx.commit().await?;
    Ok(applied)
}

pub(crate) async fn get(
    pool: &PgPool,
    table: Table,
    conflict_key: &str,
) -> Result<Option<Value>, StoreError> {
    let body = sqlx::query_scalar::<_, Value>(
        "SELECT body FROM live_rows WHERE table_name = $1 AND conflict_key = $2",
    )
    .bind(table.as_str())
    .bind(conflict_key)
    .fetch_optional(pool)
    .await?;

    Ok(body)
}

pub(crate) async fn query(
    pool: &PgPool,
    table: Table,
    filter: &Filter,
) -> Result<Vec<Value>, StoreError> {
    let rows = sqlx::query_scalar::<_, Value>(
        r#"
        SELECT body
        FROM live_rows
        WHERE table_name = $1
          AND ($2::uuid IS NULL OR webinar_id = $2)
          AND body @> $3::jsonb
        ORDER BY row_seq
        "#,
    )
    .bind(table.as_str())
    .bind(filter.webinar_id)
    .bind(Value::Object(filter.eq.clone()))
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
