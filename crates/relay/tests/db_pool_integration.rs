use serde_json::json;
use uuid::Uuid;
use webinar_relay::db::pool::{count_live_rows, open_live_store_pool, StorePoolConfig};

#[tokio::test]
async fn live_store_pool_round_trips_a_live_row() {
    let Some(database_url) = std::env::var("WEBINAR_RELAY_TEST_DATABASE_URL").ok() else {
        eprintln!("skipping db pool integration test: set WEBINAR_RELAY_TEST_DATABASE_URL to run it");
        return;
    };

    let config =
        StorePoolConfig { min_connections: 1, max_connections: 2, ..StorePoolConfig::default() };
    let pool = open_live_store_pool(&database_url, &config)
        .await
        .expect("pool should connect and migrate the test database");

    let webinar_id = Uuid::new_v4();
    let conflict_key = format!("pool-check:{webinar_id}");
    let upsert = "INSERT INTO live_rows (table_name, conflict_key, webinar_id, body) \
                  VALUES ('pool_check', $1, $2, $3) \
                  ON CONFLICT (table_name, conflict_key) \
                  DO UPDATE SET body = EXCLUDED.body, updated_at = now()";
    for value in ["A", "B"] {
        sqlx::query(upsert)
            .bind(&conflict_key)
            .bind(webinar_id)
            .bind(json!({ "value": value }))
            .execute(&pool)
            .await
            .expect("live row upsert should succeed");
    }

    let body: serde_json::Value = sqlx::query_scalar(
        "SELECT body FROM live_rows WHERE table_name = 'pool_check' AND conflict_key = $1",
    )
    .bind(&conflict_key)
    .fetch_one(&pool)
    .await
    .expect("live row should read back");
    assert_eq!(body, json!({ "value": "B" }));
    assert!(count_live_rows(&pool).await.expect("live_rows should be readable") >= 1);

    sqlx::query("DELETE FROM live_rows WHERE table_name = 'pool_check' AND conflict_key = $1")
        .bind(&conflict_key)
        .execute(&pool)
        .await
        .expect("cleanup should succeed");
}
