//! In-process warehouse with the same reconcile semantics as `PgWarehouse`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;
use tunedw_core::ArtistRecord;
use uuid::Uuid;

use crate::warehouse::{
    dedupe_keep_last, ReconcileOutcome, Warehouse, WarehouseError, WarehouseTables, MAX_VARCHAR_LEN,
};

#[derive(Debug, Default)]
struct MemoryState {
    schema_ready: bool,
    rows: BTreeMap<String, ArtistRecord>,
}

/// Keyed table held behind a mutex.
///
/// A reconcile works on a copy of the table and swaps it in only if every row
/// applied, so a failure leaves the previous contents untouched. Column widths
/// are enforced when rows land in the target, not while staging.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    tables: WarehouseTables,
    state: Mutex<MemoryState>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from existing target rows, as if a previous run had committed them.
    pub fn with_rows(rows: impl IntoIterator<Item = ArtistRecord>) -> Self {
        let rows = rows
            .into_iter()
            .map(|r| (r.artist_name.clone(), r))
            .collect();
        Self {
            tables: WarehouseTables::default(),
            state: Mutex::new(MemoryState {
                schema_ready: true,
                rows,
            }),
        }
    }

    pub async fn schema_ready(&self) -> bool {
        self.state.lock().await.schema_ready
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn check_width(column: &'static str, value: &str) -> Result<(), WarehouseError> {
    if value.chars().count() > MAX_VARCHAR_LEN {
        return Err(WarehouseError::ValueTooLong {
            column,
            max: MAX_VARCHAR_LEN,
            value: value.to_string(),
        });
    }
    Ok(())
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    fn target_table(&self) -> &str {
        &self.tables.target
    }

    async fn ensure_schema(&self) -> Result<(), WarehouseError> {
        self.state.lock().await.schema_ready = true;
        Ok(())
    }

    async fn reconcile(
        &self,
        run_id: Uuid,
        records: &[ArtistRecord],
    ) -> Result<ReconcileOutcome, WarehouseError> {
        let mut state = self.state.lock().await;
        let mut working = state.rows.clone();

        let staging = records.to_vec();
        let (deduped, duplicates_dropped) = dedupe_keep_last(&staging);

        let mut inserted = 0usize;
        let mut updated = 0usize;
        for record in &deduped {
            match working.get_mut(&record.artist_name) {
                Some(existing) => {
                    existing.popularity = record.popularity;
                    existing.followers = record.followers;
                    updated += 1;
                }
                None => {
                    check_width("artist_name", &record.artist_name)?;
                    check_width("country", &record.country)?;
                    working.insert(record.artist_name.clone(), record.clone());
                    inserted += 1;
                }
            }
        }

        state.rows = working;
        state.schema_ready = true;
        debug!(%run_id, inserted, updated, "memory reconcile committed");

        Ok(ReconcileOutcome {
            staged: staging.len(),
            distinct_keys: deduped.len(),
            duplicates_dropped,
            inserted,
            updated,
        })
    }

    async fn fetch_all(&self) -> Result<Vec<ArtistRecord>, WarehouseError> {
        Ok(self.state.lock().await.rows.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(name: &str, popularity: i32, followers: i64, country: &str) -> ArtistRecord {
        ArtistRecord::new(name, popularity, followers, country)
    }

    #[tokio::test]
    async fn first_run_inserts_every_row() {
        let warehouse = MemoryWarehouse::new();
        let batch = vec![rec("A", 10, 100, "X"), rec("B", 20, 200, "Y")];

        let outcome = warehouse.reconcile(Uuid::new_v4(), &batch).await.unwrap();

        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.updated, 0);
        assert!(warehouse.schema_ready().await);
        assert_eq!(warehouse.fetch_all().await.unwrap(), batch);
    }

    #[tokio::test]
    async fn update_changes_measures_but_keeps_country() {
        let warehouse = MemoryWarehouse::new();
        warehouse
            .reconcile(
                Uuid::new_v4(),
                &[rec("A", 10, 100, "X"), rec("B", 20, 200, "Y")],
            )
            .await
            .unwrap();

        let outcome = warehouse
            .reconcile(Uuid::new_v4(), &[rec("A", 15, 150, "Z")])
            .await
            .unwrap();

        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.inserted, 0);
        assert_eq!(
            warehouse.fetch_all().await.unwrap(),
            vec![rec("A", 15, 150, "X"), rec("B", 20, 200, "Y")]
        );
    }

    #[tokio::test]
    async fn reconciling_the_same_batch_twice_is_idempotent() {
        let warehouse = MemoryWarehouse::with_rows([rec("Old", 1, 1, "Q")]);
        let batch = vec![rec("A", 10, 100, "X"), rec("Old", 2, 3, "R")];

        warehouse.reconcile(Uuid::new_v4(), &batch).await.unwrap();
        let once = warehouse.fetch_all().await.unwrap();
        warehouse.reconcile(Uuid::new_v4(), &batch).await.unwrap();
        let twice = warehouse.fetch_all().await.unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_keys_in_one_batch_keep_the_last_row() {
        let warehouse = MemoryWarehouse::new();
        let batch = vec![
            rec("A", 10, 100, "X"),
            rec("A", 12, 120, "Y"),
            rec("B", 1, 1, "Y"),
        ];

        let outcome = warehouse.reconcile(Uuid::new_v4(), &batch).await.unwrap();

        assert_eq!(outcome.staged, 3);
        assert_eq!(outcome.distinct_keys, 2);
        assert_eq!(outcome.duplicates_dropped, 1);
        assert_eq!(
            warehouse.fetch_all().await.unwrap(),
            vec![rec("A", 12, 120, "Y"), rec("B", 1, 1, "Y")]
        );
    }

    #[tokio::test]
    async fn failed_merge_leaves_the_table_unchanged() {
        let warehouse = MemoryWarehouse::with_rows([rec("A", 10, 100, "X")]);
        let before = warehouse.fetch_all().await.unwrap();
        let batch = vec![
            rec("A", 99, 999, "X"),
            rec("B", 20, 200, "Y"),
            rec(&"C".repeat(MAX_VARCHAR_LEN + 1), 1, 1, "Z"),
        ];

        let err = warehouse
            .reconcile(Uuid::new_v4(), &batch)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            WarehouseError::ValueTooLong {
                column: "artist_name",
                ..
            }
        ));
        assert_eq!(warehouse.fetch_all().await.unwrap(), before);
        assert_eq!(warehouse.len().await, 1);
    }
}
