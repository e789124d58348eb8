//! Load policies against a live Postgres. Runs only when
//! `SINAPI_TEST_DATABASE_URL` points at a disposable database; the schema is
//! reset by every scenario.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use sinapi_core::{CatalogItem, ItemType, MaintenanceEvent, MonthlyFact, ReferencePeriod, Regime, StructureEdge};
use sinapi_pipeline::{PgStore, RelationalStore, Rows, SchemaMode, StoreError, Table, WritePolicy};
use sqlx::PgPool;

async fn store() -> Option<PgStore> {
    let url = std::env::var("SINAPI_TEST_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&url).await.expect("connect to test database");
    let store = PgStore::new(pool);
    store.prepare_schema(SchemaMode::Reset).await.expect("reset schema");
    Some(store)
}

fn august_fact(code: i32, region: &str, regime: Regime, cents: i64) -> MonthlyFact {
    MonthlyFact {
        item_code: code,
        region: region.to_string(),
        reference_date: NaiveDate::from_ymd_opt(2025, 8, 1).unwrap(),
        regime,
        value: Some(Decimal::new(cents, 2)),
    }
}

async fn count(store: &PgStore, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(store.pool()).await.unwrap()
}

async fn seed_inputs(store: &PgStore, codes: std::ops::Range<i32>) {
    let items: Vec<CatalogItem> = codes.map(|c| CatalogItem::new(c, format!("ITEM {c}"), None)).collect();
    store
        .save(Table::InputItems, Rows::Catalog(&items), WritePolicy::Upsert)
        .await
        .unwrap();
}

async fn replace_by_period_leaves_only_the_second_load(store: &PgStore) {
    seed_inputs(store, 1..30).await;
    let august = ReferencePeriod::new(2025, 8).unwrap();

    let first: Vec<MonthlyFact> = (1..11).map(|c| august_fact(c, "SP", Regime::NotExempt, 100)).collect();
    let written = store
        .save(Table::InputPricesMonthly, Rows::Facts(&first), WritePolicy::ReplaceByPeriod(august))
        .await
        .unwrap();
    assert_eq!(written, 10);

    let second: Vec<MonthlyFact> = (20..27).map(|c| august_fact(c, "SP", Regime::NotExempt, 200)).collect();
    for _ in 0..2 {
        store
            .save(Table::InputPricesMonthly, Rows::Facts(&second), WritePolicy::ReplaceByPeriod(august))
            .await
            .unwrap();
    }

    let remaining = count(
        store,
        "SELECT COUNT(*) FROM input_prices_monthly WHERE region = 'SP' AND reference_date = '2025-08-01'",
    )
    .await;
    assert_eq!(remaining, 7);
    let from_first = count(store, "SELECT COUNT(*) FROM input_prices_monthly WHERE item_code < 20").await;
    assert_eq!(from_first, 0);
}

async fn upsert_converges_and_keeps_status(store: &PgStore) {
    let first = vec![CatalogItem::new(500, "FIRST", Some("KG".into()))];
    store
        .save(Table::InputItems, Rows::Catalog(&first), WritePolicy::Upsert)
        .await
        .unwrap();
    sqlx::query("UPDATE input_items SET status = 'DEACTIVATED' WHERE code = 500")
        .execute(store.pool())
        .await
        .unwrap();

    let second = vec![CatalogItem::new(500, "SECOND", Some("KG".into()))];
    store
        .save(Table::InputItems, Rows::Catalog(&second), WritePolicy::Upsert)
        .await
        .unwrap();

    let (description, status): (String, String) =
        sqlx::query_as("SELECT description, status FROM input_items WHERE code = 500")
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(description, "SECOND");
    assert_eq!(status, "DEACTIVATED");
    assert_eq!(count(store, "SELECT COUNT(*) FROM input_items WHERE code = 500").await, 1);
}

async fn append_ignore_skips_existing_keys(store: &PgStore) {
    let event = MaintenanceEvent {
        item_code: 300,
        item_type: ItemType::Assembly,
        reference_date: NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(),
        event_type: "DEACTIVATION".into(),
        item_description: None,
    };
    let events = vec![event.clone(), event];
    let written = store
        .save(Table::MaintenanceEvents, Rows::Maintenance(&events), WritePolicy::AppendIgnore)
        .await
        .unwrap();
    assert_eq!(written, 1);
    let again = store
        .save(Table::MaintenanceEvents, Rows::Maintenance(&events[..1]), WritePolicy::AppendIgnore)
        .await
        .unwrap();
    assert_eq!(again, 0);
}

async fn deactivation_follows_latest_event(store: &PgStore) {
    let assemblies = vec![CatalogItem::new(300, "ESTACA", None), CatalogItem::new(301, "FORMA", None)];
    store
        .save(Table::AssemblyItems, Rows::Catalog(&assemblies), WritePolicy::Upsert)
        .await
        .unwrap();

    let keywords = vec!["DEACTIVATION".to_string(), "DESATIVAÇÃO".to_string()];
    assert_eq!(store.deactivate_from_events(ItemType::Assembly, &keywords).await.unwrap(), 1);
    assert_eq!(store.deactivate_from_events(ItemType::Assembly, &keywords).await.unwrap(), 0);

    let status: String = sqlx::query_scalar("SELECT status FROM assembly_items WHERE code = 300")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(status, "DEACTIVATED");
}

async fn orphan_edges_violate_foreign_keys(store: &PgStore) {
    let edges = vec![StructureEdge {
        parent_code: 300,
        child_code: 424242,
        coefficient: Some(Decimal::ONE),
    }];
    let err = store
        .save(Table::AssemblyInputEdges, Rows::Edges(&edges), WritePolicy::AppendIgnore)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ForeignKey { .. }), "{err}");
    assert_eq!(count(store, "SELECT COUNT(*) FROM assembly_input_edges").await, 0);
}

#[tokio::test]
async fn load_policies_against_postgres() {
    let Some(store) = store().await else {
        eprintln!("SINAPI_TEST_DATABASE_URL not set; skipping postgres policies");
        return;
    };

    replace_by_period_leaves_only_the_second_load(&store).await;
    upsert_converges_and_keeps_status(&store).await;
    append_ignore_skips_existing_keys(&store).await;
    deactivation_follows_latest_event(&store).await;
    orphan_edges_violate_foreign_keys(&store).await;

    store.prepare_schema(SchemaMode::Preserve).await.unwrap();
    assert_eq!(count(&store, "SELECT COUNT(*) FROM maintenance_events").await, 1);
    assert_eq!(count(&store, "SELECT COUNT(*) FROM structure_items_unified").await, 0);
}
