// Runs against a live Postgres 15+ when TUNEDW_TEST_DATABASE_URL is set; otherwise each
// test returns early.

use tunedw_core::ArtistRecord;
use tunedw_storage::{
    PgWarehouse, SqlValue, Warehouse, WarehouseError, WarehouseTables, MAX_VARCHAR_LEN,
};
use uuid::Uuid;

fn test_warehouse() -> Option<PgWarehouse> {
    let url = std::env::var("TUNEDW_TEST_DATABASE_URL").ok()?;
    let suffix = Uuid::new_v4().simple().to_string();
    let tables = WarehouseTables {
        target: format!("artist_data_t{}", &suffix[..12]),
        staging_prefix: format!("stg_t{}", &suffix[..12]),
    };
    Some(PgWarehouse::from_url(&url, tables).expect("warehouse"))
}

async fn drop_target(warehouse: &PgWarehouse) {
    warehouse
        .execute_in_transaction(&[format!(
            "DROP TABLE IF EXISTS {}",
            warehouse.tables().target
        )])
        .await
        .expect("drop target");
}

async fn leftover_staging_tables(warehouse: &PgWarehouse) -> i64 {
    let result = warehouse
        .query(
            "SELECT COUNT(*) AS n FROM information_schema.tables WHERE table_name LIKE $1",
            &[SqlValue::Text(format!("{}%", warehouse.tables().staging_prefix))],
        )
        .await
        .expect("count staging tables");
    result.rows[0][0].as_i64().expect("count")
}

fn rec(name: &str, popularity: i32, followers: i64, country: &str) -> ArtistRecord {
    ArtistRecord::new(name, popularity, followers, country)
}

#[tokio::test]
async fn merge_inserts_then_updates_without_touching_country() {
    let Some(warehouse) = test_warehouse() else {
        return;
    };

    let first = warehouse
        .reconcile(
            Uuid::new_v4(),
            &[rec("A", 10, 100, "X"), rec("B", 20, 200, "Y")],
        )
        .await
        .expect("first reconcile");
    assert_eq!(first.inserted, 2);
    assert_eq!(warehouse.row_count().await.unwrap(), 2);

    let second = warehouse
        .reconcile(Uuid::new_v4(), &[rec("A", 15, 150, "Z")])
        .await
        .expect("second reconcile");
    assert_eq!(second.updated, 1);
    assert_eq!(second.inserted, 0);

    assert_eq!(
        warehouse.fetch_all().await.unwrap(),
        vec![rec("A", 15, 150, "X"), rec("B", 20, 200, "Y")]
    );
    assert_eq!(leftover_staging_tables(&warehouse).await, 0);

    let row = warehouse
        .query(
            &format!(
                "SELECT country, artist_name FROM {} WHERE artist_name = $1",
                warehouse.tables().target
            ),
            &[SqlValue::Text("A".into())],
        )
        .await
        .unwrap();
    let name_idx = row.column_index("artist_name").expect("artist_name column");
    assert_eq!(name_idx, 1);
    assert_eq!(row.rows[0][name_idx].as_str(), Some("A"));
    assert_eq!(row.rows[0][0].as_str(), Some("X"));

    drop_target(&warehouse).await;
}

#[tokio::test]
async fn duplicate_staged_keys_resolve_to_the_last_row() {
    let Some(warehouse) = test_warehouse() else {
        return;
    };

    let outcome = warehouse
        .reconcile(
            Uuid::new_v4(),
            &[rec("A", 1, 1, "X"), rec("A", 2, 2, "Y"), rec("A", 3, 3, "Z")],
        )
        .await
        .expect("reconcile");

    assert_eq!(outcome.staged, 3);
    assert_eq!(outcome.distinct_keys, 1);
    assert_eq!(outcome.duplicates_dropped, 2);
    assert_eq!(warehouse.fetch_all().await.unwrap(), vec![rec("A", 3, 3, "Z")]);

    drop_target(&warehouse).await;
}

#[tokio::test]
async fn duplicates_across_insert_chunks_keep_the_last_row() {
    let Some(warehouse) = test_warehouse() else {
        return;
    };

    let mut records: Vec<ArtistRecord> = (0..2_500)
        .map(|i| rec(&format!("artist-{i:04}"), 1, i, "X"))
        .collect();
    records.push(rec("artist-0007", 99, 9_999, "Y"));

    let outcome = warehouse
        .reconcile(Uuid::new_v4(), &records)
        .await
        .expect("reconcile");

    assert_eq!(outcome.staged, 2_501);
    assert_eq!(outcome.distinct_keys, 2_500);
    assert_eq!(outcome.duplicates_dropped, 1);
    assert_eq!(outcome.inserted, 2_500);
    assert_eq!(warehouse.row_count().await.unwrap(), 2_500);

    let rows = warehouse.fetch_all().await.unwrap();
    let seventh = rows
        .iter()
        .find(|r| r.artist_name == "artist-0007")
        .expect("artist-0007");
    assert_eq!(seventh, &rec("artist-0007", 99, 9_999, "Y"));
    assert_eq!(leftover_staging_tables(&warehouse).await, 0);

    drop_target(&warehouse).await;
}

#[tokio::test]
async fn failing_merge_rolls_back_everything() {
    let Some(warehouse) = test_warehouse() else {
        return;
    };

    warehouse
        .reconcile(Uuid::new_v4(), &[rec("A", 10, 100, "X")])
        .await
        .expect("seed");
    let before = warehouse.fetch_all().await.unwrap();

    let too_long = "n".repeat(MAX_VARCHAR_LEN + 1);
    let err = warehouse
        .reconcile(
            Uuid::new_v4(),
            &[rec("A", 99, 999, "X"), rec("B", 1, 1, "Y"), rec(&too_long, 1, 1, "Z")],
        )
        .await
        .expect_err("merge must fail");

    assert!(matches!(
        err,
        WarehouseError::Statement { stage: "merge", .. }
    ));
    assert_eq!(warehouse.fetch_all().await.unwrap(), before);
    assert_eq!(leftover_staging_tables(&warehouse).await, 0);

    drop_target(&warehouse).await;
}

#[tokio::test]
async fn ensure_schema_is_idempotent() {
    let Some(warehouse) = test_warehouse() else {
        return;
    };

    warehouse.ensure_schema().await.expect("first");
    warehouse.ensure_schema().await.expect("second");
    assert_eq!(warehouse.row_count().await.unwrap(), 0);

    let result = warehouse
        .query(
            &format!(
                "SELECT artist_name, popularity FROM {} WHERE artist_name = $1",
                warehouse.tables().target
            ),
            &[SqlValue::Text("missing".into())],
        )
        .await
        .unwrap();
    assert!(result.rows.is_empty());

    drop_target(&warehouse).await;
}
