use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, QueryBuilder, Row};
use tracing::debug;

use marketfeed_common::{PersistedRecord, SyncError};

use super::Sink;

/// Bind-parameter budget: 6 columns per record, Postgres caps a
/// statement at 65535 binds.
const INSERT_CHUNK: usize = 1000;

/// Relational sink: one `records` table keyed by `(store, natural_key)`.
/// The unique constraint does the deduplication; `insert_if_absent` is
/// a single constraint-guarded bulk insert per batch, one transaction
/// each, so a failure mid-batch rolls back cleanly.
pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    pub async fn connect(database_url: &str) -> Result<Self, SyncError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        let sink = Self { pool };
        sink.ensure_schema().await?;
        Ok(sink)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), SyncError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS records (
                store        TEXT NOT NULL,
                natural_key  TEXT NOT NULL,
                source_id    TEXT NOT NULL,
                categories   JSONB NOT NULL DEFAULT '[]',
                fields       JSONB NOT NULL DEFAULT '{}',
                observed_at  TIMESTAMPTZ NOT NULL,
                inserted_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (store, natural_key)
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Sink for PgSink {
    async fn known_keys(&self, store: &str) -> Result<HashSet<String>, SyncError> {
        let rows = sqlx::query("SELECT natural_key FROM records WHERE store = $1")
            .bind(store)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|row| row.get("natural_key")).collect())
    }

    async fn insert_if_absent(
        &self,
        store: &str,
        records: &[PersistedRecord],
    ) -> Result<u64, SyncError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        for chunk in records.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
                "INSERT INTO records (store, natural_key, source_id, categories, fields, observed_at) ",
            );
            builder.push_values(chunk, |mut row, record| {
                row.push_bind(store)
                    .push_bind(&record.natural_key)
                    .push_bind(&record.source_id)
                    .push_bind(Json(&record.categories))
                    .push_bind(Json(&record.fields))
                    .push_bind(record.observed_at);
            });
            builder.push(" ON CONFLICT (store, natural_key) DO NOTHING");
            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        debug!(store, inserted, batch = records.len(), "Inserted records");
        Ok(inserted)
    }

    /// The unique constraint means the table can never hold duplicate
    /// keys and reads order explicitly, so there is nothing to rewrite.
    async fn compact(&self, _store: &str) -> Result<u64, SyncError> {
        Ok(0)
    }
}
