//! Warehouse access and the staged MERGE upsert.
//!
//! A reconcile run is one transaction on one connection:
//!
//! 1. `CREATE TABLE IF NOT EXISTS` for the target and a run-scoped staging table
//! 2. multi-row INSERT of every record into staging, in input order
//! 3. DELETE of every staged row superseded by a later row with the same key
//! 4. MERGE of staging into the target; a match only updates `popularity` and
//!    `followers`, a miss inserts the full row
//! 5. `DROP TABLE` staging, `COMMIT`
//!
//! Any failure rolls the whole thing back, including the DDL.

use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgRow};
use sqlx::{Column, Connection, PgConnection, Postgres, QueryBuilder, Row, TypeInfo};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use tunedw_core::ArtistRecord;
use uuid::Uuid;

/// Width of the `VARCHAR` key and country columns on the target table.
pub const MAX_VARCHAR_LEN: usize = 255;

/// Rows per multi-row INSERT. Five binds per row keeps this well under the
/// protocol's 65535 parameter limit.
const STAGE_CHUNK_ROWS: usize = 1000;

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("invalid table identifier `{0}`")]
    InvalidIdentifier(String),
    #[error("connecting to warehouse: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("{stage} failed: {source}")]
    Statement {
        stage: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("value too long for {column} (max {max} chars): {value:?}")]
    ValueTooLong {
        column: &'static str,
        max: usize,
        value: String,
    },
    #[error("unsupported column type {type_name} for column {column}")]
    UnsupportedType { column: String, type_name: String },
    #[error("unexpected value in column {column}")]
    UnexpectedValue { column: &'static str },
}

fn statement(stage: &'static str) -> impl FnOnce(sqlx::Error) -> WarehouseError {
    move |source| WarehouseError::Statement { stage, source }
}

/// Counts reported by a successful reconcile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub staged: usize,
    pub distinct_keys: usize,
    pub duplicates_dropped: usize,
    pub inserted: usize,
    pub updated: usize,
}

/// Scalar value used for parameters and results of the generic query path.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i32),
    BigInt(i64),
    Float(f64),
    Text(String),
}

impl SqlValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(i64::from(*v)),
            SqlValue::BigInt(v) => Some(*v),
            _ => None,
        }
    }
}

/// Rows returned by `PgWarehouse::query`, with the column names in select order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl QueryResult {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// Accepts lowercase SQL identifiers only; table names are interpolated into DDL.
pub fn validate_identifier(name: &str) -> Result<(), WarehouseError> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let valid_tail = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid_head && valid_tail && name.len() <= 63 {
        Ok(())
    } else {
        Err(WarehouseError::InvalidIdentifier(name.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarehouseTables {
    pub target: String,
    pub staging_prefix: String,
}

impl Default for WarehouseTables {
    fn default() -> Self {
        Self {
            target: "artist_data".to_string(),
            staging_prefix: "temp_artist_data".to_string(),
        }
    }
}

impl WarehouseTables {
    pub fn validate(&self) -> Result<(), WarehouseError> {
        validate_identifier(&self.target)?;
        validate_identifier(&self.staging_prefix)
    }

    /// Staging table for one run. Scoping by run id keeps overlapping runs apart.
    pub fn staging_for(&self, run_id: Uuid) -> Result<String, WarehouseError> {
        let name = format!("{}_{}", self.staging_prefix, run_id.simple());
        validate_identifier(&name)?;
        Ok(name)
    }
}

/// Connection settings, read from the `REDSHIFT_*` environment variables.
#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    pub name: String,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub tables: WarehouseTables,
}

impl WarehouseConfig {
    pub fn from_env() -> Self {
        let defaults = WarehouseTables::default();
        Self {
            name: std::env::var("REDSHIFT_NAME").unwrap_or_else(|_| "dev".to_string()),
            user: std::env::var("REDSHIFT_USER").unwrap_or_else(|_| "postgres".to_string()),
            password: std::env::var("REDSHIFT_PASSWORD").unwrap_or_default(),
            host: std::env::var("REDSHIFT_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("REDSHIFT_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5439),
            tables: WarehouseTables {
                target: std::env::var("TUNEDW_TARGET_TABLE").unwrap_or(defaults.target),
                staging_prefix: std::env::var("TUNEDW_STAGING_PREFIX")
                    .unwrap_or(defaults.staging_prefix),
            },
        }
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.name)
    }
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    fn target_table(&self) -> &str;

    /// Creates the target table if it is missing.
    async fn ensure_schema(&self) -> Result<(), WarehouseError>;

    /// Applies `records` to the target table as a single all-or-nothing upsert.
    async fn reconcile(
        &self,
        run_id: Uuid,
        records: &[ArtistRecord],
    ) -> Result<ReconcileOutcome, WarehouseError>;

    /// Every row of the target table, ordered by key.
    async fn fetch_all(&self) -> Result<Vec<ArtistRecord>, WarehouseError>;
}

/// Collapses duplicate keys, keeping the last occurrence of each.
///
/// Returns the surviving records ordered by key and the number of rows dropped.
pub fn dedupe_keep_last(records: &[ArtistRecord]) -> (Vec<ArtistRecord>, usize) {
    let mut by_key: BTreeMap<&str, &ArtistRecord> = BTreeMap::new();
    for record in records {
        by_key.insert(record.artist_name.as_str(), record);
    }
    let dropped = records.len() - by_key.len();
    (by_key.into_values().cloned().collect(), dropped)
}

/// Postgres-protocol warehouse (Postgres 15+ or Redshift; both support MERGE).
///
/// Each public call opens its own connection and closes it before returning.
#[derive(Debug, Clone)]
pub struct PgWarehouse {
    connect: PgConnectOptions,
    tables: WarehouseTables,
}

impl PgWarehouse {
    pub fn new(config: &WarehouseConfig) -> Result<Self, WarehouseError> {
        Self::with_options(config.connect_options(), config.tables.clone())
    }

    pub fn from_url(url: &str, tables: WarehouseTables) -> Result<Self, WarehouseError> {
        let connect = url.parse::<PgConnectOptions>().map_err(WarehouseError::Connect)?;
        Self::with_options(connect, tables)
    }

    pub fn with_options(
        connect: PgConnectOptions,
        tables: WarehouseTables,
    ) -> Result<Self, WarehouseError> {
        tables.validate()?;
        Ok(Self { connect, tables })
    }

    pub fn tables(&self) -> &WarehouseTables {
        &self.tables
    }

    async fn connect(&self) -> Result<PgConnection, WarehouseError> {
        PgConnection::connect_with(&self.connect)
            .await
            .map_err(WarehouseError::Connect)
    }

    async fn release(conn: PgConnection) {
        if let Err(err) = conn.close().await {
            warn!(error = %err, "closing warehouse connection");
        }
    }

    /// Runs a read query and returns the rows with their column names.
    pub async fn query(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<QueryResult, WarehouseError> {
        let mut conn = self.connect().await?;
        let result = run_query(&mut conn, sql, params).await;
        Self::release(conn).await;
        result
    }

    /// Executes `statements` in order inside one transaction.
    pub async fn execute_in_transaction(
        &self,
        statements: &[String],
    ) -> Result<(), WarehouseError> {
        let mut conn = self.connect().await?;
        let result = execute_all(&mut conn, statements).await;
        Self::release(conn).await;
        result
    }

    pub async fn row_count(&self) -> Result<i64, WarehouseError> {
        let sql = format!("SELECT COUNT(*) AS row_count FROM {}", self.tables.target);
        let result = self.query(&sql, &[]).await?;
        result
            .rows
            .first()
            .and_then(|row| row.first())
            .and_then(SqlValue::as_i64)
            .ok_or(WarehouseError::UnexpectedValue { column: "row_count" })
    }

    fn create_target_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                artist_name VARCHAR({MAX_VARCHAR_LEN}) PRIMARY KEY,
                popularity  INTEGER,
                followers   BIGINT,
                country     VARCHAR({MAX_VARCHAR_LEN})
            )",
            self.tables.target
        )
    }

    async fn reconcile_on(
        &self,
        conn: &mut PgConnection,
        staging: &str,
        records: &[ArtistRecord],
    ) -> Result<ReconcileOutcome, WarehouseError> {
        let mut tx = conn.begin().await.map_err(statement("begin"))?;
        match self.merge_in_transaction(&mut tx, staging, records).await {
            Ok(outcome) => {
                tx.commit().await.map_err(statement("commit"))?;
                Ok(outcome)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "rollback after failed reconcile");
                }
                Err(err)
            }
        }
    }

    async fn merge_in_transaction(
        &self,
        conn: &mut PgConnection,
        staging: &str,
        records: &[ArtistRecord],
    ) -> Result<ReconcileOutcome, WarehouseError> {
        let target = &self.tables.target;

        sqlx::query(&self.create_target_sql())
            .execute(&mut *conn)
            .await
            .map_err(statement("create target table"))?;

        // Unbounded text columns: staging accepts anything, the target enforces widths.
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {staging} (
                temp_seq         BIGINT NOT NULL,
                temp_artist_name TEXT,
                temp_popularity  INTEGER,
                temp_followers   BIGINT,
                temp_country     TEXT
            )"
        ))
        .execute(&mut *conn)
        .await
        .map_err(statement("create staging table"))?;

        for (chunk_index, chunk) in records.chunks(STAGE_CHUNK_ROWS).enumerate() {
            let offset = chunk_index * STAGE_CHUNK_ROWS;
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {staging} \
                 (temp_seq, temp_artist_name, temp_popularity, temp_followers, temp_country) "
            ));
            builder.push_values(chunk.iter().enumerate(), |mut b, (i, record)| {
                b.push_bind((offset + i) as i64)
                    .push_bind(record.artist_name.clone())
                    .push_bind(record.popularity)
                    .push_bind(record.followers)
                    .push_bind(record.country.clone());
            });
            builder
                .build()
                .execute(&mut *conn)
                .await
                .map_err(statement("stage records"))?;
        }

        let distinct_keys = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(DISTINCT temp_artist_name) FROM {staging}"
        ))
        .fetch_one(&mut *conn)
        .await
        .map_err(statement("count staged keys"))?;

        let matched_keys = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(DISTINCT s.temp_artist_name)
               FROM {staging} s
               JOIN {target} t ON t.artist_name = s.temp_artist_name"
        ))
        .fetch_one(&mut *conn)
        .await
        .map_err(statement("count matched keys"))?;

        sqlx::query(&dedupe_staging_sql(staging))
            .execute(&mut *conn)
            .await
            .map_err(statement("dedupe staging"))?;

        sqlx::query(&merge_sql(target, staging))
            .execute(&mut *conn)
            .await
            .map_err(statement("merge"))?;

        sqlx::query(&format!("DROP TABLE {staging}"))
            .execute(&mut *conn)
            .await
            .map_err(statement("drop staging table"))?;

        let distinct_keys = distinct_keys as usize;
        let matched_keys = matched_keys as usize;
        Ok(ReconcileOutcome {
            staged: records.len(),
            distinct_keys,
            duplicates_dropped: records.len() - distinct_keys,
            inserted: distinct_keys - matched_keys,
            updated: matched_keys,
        })
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    fn target_table(&self) -> &str {
        &self.tables.target
    }

    async fn ensure_schema(&self) -> Result<(), WarehouseError> {
        self.execute_in_transaction(&[self.create_target_sql()]).await
    }

    async fn reconcile(
        &self,
        run_id: Uuid,
        records: &[ArtistRecord],
    ) -> Result<ReconcileOutcome, WarehouseError> {
        let staging = self.tables.staging_for(run_id)?;
        let span = info_span!("reconcile", %run_id, target = %self.tables.target, %staging);
        async {
            let mut conn = self.connect().await?;
            let result = self.reconcile_on(&mut conn, &staging, records).await;
            Self::release(conn).await;
            if let Ok(outcome) = &result {
                info!(
                    staged = outcome.staged,
                    inserted = outcome.inserted,
                    updated = outcome.updated,
                    duplicates_dropped = outcome.duplicates_dropped,
                    "reconcile committed"
                );
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn fetch_all(&self) -> Result<Vec<ArtistRecord>, WarehouseError> {
        let sql = format!(
            "SELECT artist_name, popularity, followers, country FROM {} ORDER BY artist_name",
            self.tables.target
        );
        let result = self.query(&sql, &[]).await?;
        result.rows.iter().map(|row| record_from_values(row)).collect()
    }
}

/// Deletes every staged row that a later row with the same key supersedes.
fn dedupe_staging_sql(staging: &str) -> String {
    format!(
        "DELETE FROM {staging}
          USING (
              SELECT temp_artist_name AS latest_name, MAX(temp_seq) AS latest_seq
                FROM {staging}
               GROUP BY temp_artist_name
          ) latest
          WHERE {staging}.temp_artist_name = latest.latest_name
            AND {staging}.temp_seq < latest.latest_seq"
    )
}

/// MERGE straight from the staging table. The source must be a plain table with
/// unique keys to run on Redshift; `dedupe_staging_sql` runs first.
fn merge_sql(target: &str, staging: &str) -> String {
    format!(
        "MERGE INTO {target}
         USING {staging}
            ON {target}.artist_name = {staging}.temp_artist_name
         WHEN MATCHED THEN UPDATE SET
              popularity = {staging}.temp_popularity,
              followers  = {staging}.temp_followers
         WHEN NOT MATCHED THEN
              INSERT (artist_name, popularity, followers, country)
              VALUES ({staging}.temp_artist_name, {staging}.temp_popularity,
                      {staging}.temp_followers, {staging}.temp_country)"
    )
}

fn record_from_values(row: &[SqlValue]) -> Result<ArtistRecord, WarehouseError> {
    let text = |idx: usize, column: &'static str| {
        row.get(idx)
            .and_then(SqlValue::as_str)
            .map(str::to_string)
            .ok_or(WarehouseError::UnexpectedValue { column })
    };
    let int = |idx: usize, column: &'static str| {
        row.get(idx)
            .and_then(SqlValue::as_i64)
            .ok_or(WarehouseError::UnexpectedValue { column })
    };
    let popularity = i32::try_from(int(1, "popularity")?)
        .map_err(|_| WarehouseError::UnexpectedValue { column: "popularity" })?;
    Ok(ArtistRecord {
        artist_name: text(0, "artist_name")?,
        popularity,
        followers: int(2, "followers")?,
        country: text(3, "country")?,
    })
}

async fn run_query(
    conn: &mut PgConnection,
    sql: &str,
    params: &[SqlValue],
) -> Result<QueryResult, WarehouseError> {
    let mut query = sqlx::query(sql);
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(Option::<String>::None),
            SqlValue::Bool(v) => query.bind(*v),
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::BigInt(v) => query.bind(*v),
            SqlValue::Float(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.clone()),
        };
    }
    let rows = query
        .fetch_all(&mut *conn)
        .await
        .map_err(statement("query"))?;

    let columns = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();
    let rows = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;
    Ok(QueryResult { columns, rows })
}

fn decode_row(row: &PgRow) -> Result<Vec<SqlValue>, WarehouseError> {
    row.columns()
        .iter()
        .map(|column| {
            let idx = column.ordinal();
            let type_name = column.type_info().name();
            let decoded = match type_name {
                "BOOL" => row.try_get::<Option<bool>, _>(idx).map(|v| v.map(SqlValue::Bool)),
                "INT2" => row
                    .try_get::<Option<i16>, _>(idx)
                    .map(|v| v.map(|n| SqlValue::Int(i32::from(n)))),
                "INT4" => row.try_get::<Option<i32>, _>(idx).map(|v| v.map(SqlValue::Int)),
                "INT8" => row.try_get::<Option<i64>, _>(idx).map(|v| v.map(SqlValue::BigInt)),
                "FLOAT4" => row
                    .try_get::<Option<f32>, _>(idx)
                    .map(|v| v.map(|n| SqlValue::Float(f64::from(n)))),
                "FLOAT8" => row.try_get::<Option<f64>, _>(idx).map(|v| v.map(SqlValue::Float)),
                "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
                    row.try_get::<Option<String>, _>(idx).map(|v| v.map(SqlValue::Text))
                }
                other => {
                    return Err(WarehouseError::UnsupportedType {
                        column: column.name().to_string(),
                        type_name: other.to_string(),
                    })
                }
            };
            decoded
                .map(|v| v.unwrap_or(SqlValue::Null))
                .map_err(statement("decode row"))
        })
        .collect()
}

async fn execute_all(conn: &mut PgConnection, statements: &[String]) -> Result<(), WarehouseError> {
    let mut tx = conn.begin().await.map_err(statement("begin"))?;
    for sql in statements {
        if let Err(err) = sqlx::query(sql).execute(&mut *tx).await {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "rollback after failed statement");
            }
            return Err(WarehouseError::Statement {
                stage: "execute",
                source: err,
            });
        }
    }
    tx.commit().await.map_err(statement("commit"))
}
