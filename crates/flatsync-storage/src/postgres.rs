//! PostgreSQL-backed record store.

use std::time::Duration;

use async_trait::async_trait;
use flatsync_core::{
    CanonicalRecord, Listing, ListingCandidate, ListingKind, ListingState, ListingUpdate,
    RawFields, Result, SyncError,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::debug;

use crate::records::RecordStore;

pub async fn connect_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .map_err(SyncError::store)
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(SyncError::store)
}

const LISTING_COLUMNS: &str =
    "id, kind, link, state, raw_fields, canonical_record, created_at, updated_at";

/// One listing partition (`kind`) of the shared `listings` table.
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
    kind: ListingKind,
}

impl PgRecordStore {
    pub fn new(pool: PgPool, kind: ListingKind) -> Self {
        Self { pool, kind }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn listing_from_row(row: &PgRow) -> Result<Listing> {
    let kind: String = row.try_get("kind").map_err(SyncError::store)?;
    let state: String = row.try_get("state").map_err(SyncError::store)?;
    let raw_fields: Json<RawFields> = row.try_get("raw_fields").map_err(SyncError::store)?;
    let canonical_record: Option<Json<CanonicalRecord>> =
        row.try_get("canonical_record").map_err(SyncError::store)?;

    Ok(Listing {
        id: row.try_get("id").map_err(SyncError::store)?,
        kind: kind.parse().map_err(SyncError::store)?,
        link: row.try_get("link").map_err(SyncError::store)?,
        state: state.parse()?,
        raw_fields: raw_fields.0,
        canonical_record: canonical_record.map(|json| json.0),
        created_at: row.try_get("created_at").map_err(SyncError::store)?,
        updated_at: row.try_get("updated_at").map_err(SyncError::store)?,
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    fn kind(&self) -> ListingKind {
        self.kind
    }

    async fn find_latest(&self) -> Result<Option<Listing>> {
        let sql = format!(
            "SELECT {LISTING_COLUMNS} FROM listings
              WHERE kind = $1 AND ingest_batch > 0
              ORDER BY ingest_batch DESC, ingest_rank ASC
              LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(self.kind.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(SyncError::store)?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Listing>> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listings WHERE kind = $1 AND id = $2");
        let row = sqlx::query(&sql)
            .bind(self.kind.as_str())
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(SyncError::store)?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn find_by_state(&self, state: ListingState) -> Result<Vec<Listing>> {
        let sql = format!(
            "SELECT {LISTING_COLUMNS} FROM listings
              WHERE kind = $1 AND state = $2
              ORDER BY ingest_batch ASC, ingest_rank ASC, created_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(self.kind.as_str())
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(SyncError::store)?;
        rows.iter().map(listing_from_row).collect()
    }

    async fn upsert_many(&self, candidates: &[ListingCandidate]) -> Result<usize> {
        if candidates.is_empty() {
            return Ok(0);
        }
        let ids = candidates.iter().map(|c| c.id.clone()).collect::<Vec<_>>();
        let links = candidates.iter().map(|c| c.link.clone()).collect::<Vec<_>>();
        let ranks = (0..candidates.len() as i32).collect::<Vec<_>>();

        let result = sqlx::query(
            r#"
            WITH batch AS (SELECT nextval('listing_ingest_batch') AS n)
            INSERT INTO listings (kind, id, link, state, ingest_batch, ingest_rank)
            SELECT $1, u.id, u.link, 'collected', batch.n, u.rank
              FROM UNNEST($2::text[], $3::text[], $4::int4[]) AS u(id, link, rank), batch
            ON CONFLICT (kind, id) DO NOTHING
            "#,
        )
        .bind(self.kind.as_str())
        .bind(&ids)
        .bind(&links)
        .bind(&ranks)
        .execute(&self.pool)
        .await
        .map_err(SyncError::store)?;

        debug!(kind = %self.kind, inserted = result.rows_affected(), "upsert_many");
        Ok(result.rows_affected() as usize)
    }

    async fn upsert_one(
        &self,
        id: &str,
        update: &ListingUpdate,
        create_if_missing: bool,
    ) -> Result<bool> {
        let link = update.link.clone().unwrap_or_default();
        let raw_fields = Json(&update.raw_fields);
        let canonical_record = update.canonical_record.as_ref().map(Json);

        let sql = if create_if_missing {
            r#"
            INSERT INTO listings (kind, id, link, state, raw_fields, canonical_record)
            VALUES ($1, $2, $3, $4, $5::jsonb, $6::jsonb)
            ON CONFLICT (kind, id) DO UPDATE SET
                link = CASE WHEN listings.link = '' THEN EXCLUDED.link ELSE listings.link END,
                state = CASE WHEN listings.state = 'enriched' THEN listings.state ELSE EXCLUDED.state END,
                raw_fields = EXCLUDED.raw_fields,
                canonical_record = COALESCE(EXCLUDED.canonical_record, listings.canonical_record),
                updated_at = NOW()
            WHERE (listings.link = '' AND EXCLUDED.link <> '')
               OR (listings.state <> 'enriched' AND listings.state <> EXCLUDED.state)
               OR listings.raw_fields IS DISTINCT FROM EXCLUDED.raw_fields
               OR (EXCLUDED.canonical_record IS NOT NULL
                   AND listings.canonical_record IS DISTINCT FROM EXCLUDED.canonical_record)
            "#
        } else {
            r#"
            UPDATE listings SET
                link = CASE WHEN link = '' THEN $3 ELSE link END,
                state = CASE WHEN state = 'enriched' THEN state ELSE $4 END,
                raw_fields = $5::jsonb,
                canonical_record = COALESCE($6::jsonb, canonical_record),
                updated_at = NOW()
            WHERE kind = $1 AND id = $2
              AND ((link = '' AND $3 <> '')
                   OR (state <> 'enriched' AND state <> $4)
                   OR raw_fields IS DISTINCT FROM $5::jsonb
                   OR ($6::jsonb IS NOT NULL AND canonical_record IS DISTINCT FROM $6::jsonb))
            "#
        };

        let result = sqlx::query(sql)
            .bind(self.kind.as_str())
            .bind(id)
            .bind(&link)
            .bind(update.state.as_str())
            .bind(raw_fields)
            .bind(canonical_record)
            .execute(&self.pool)
            .await
            .map_err(SyncError::store)?;
        Ok(result.rows_affected() > 0)
    }
}
