//! PostgreSQL persistence gateway.
//!
//! Every batch is written in one transaction. Rows are validated before the
//! transaction opens; rows the database itself refuses (data exceptions and
//! integrity violations) are isolated with a savepoint each, so one bad row
//! never takes its batch down. Connection-level trouble is retried with the
//! shared [`RetryPolicy`]; when retries run out nothing from the batch, and
//! no checkpoint advance, is committed.

use crate::config::{DatabaseConfig, UpsertMode};
use crate::validate::partition;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use medlens_pipeline::store::{async_trait, CheckpointStore, RecordStore};
use medlens_pipeline::{
    Channel, Checkpoint, CheckpointAdvance, ClassificationResult, Failure, MessageKey,
    RawMessage, Record, RejectedRow, RetryPolicy, UpsertReport, ValidationError,
};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Connection, FromRow};
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const MESSAGE_UPSERT_FULL: &str = r#"
    INSERT INTO raw_messages (
        channel, message_id, posted_at, text, views,
        forwards, has_media, media_path, ingested_at
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
    ON CONFLICT (channel, message_id) DO UPDATE SET
        posted_at = EXCLUDED.posted_at,
        text = EXCLUDED.text,
        views = EXCLUDED.views,
        forwards = EXCLUDED.forwards,
        has_media = EXCLUDED.has_media,
        media_path = EXCLUDED.media_path,
        ingested_at = EXCLUDED.ingested_at
"#;

const MESSAGE_UPSERT_COUNTERS: &str = r#"
    INSERT INTO raw_messages (
        channel, message_id, posted_at, text, views,
        forwards, has_media, media_path, ingested_at
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
    ON CONFLICT (channel, message_id) DO UPDATE SET
        views = EXCLUDED.views,
        forwards = EXCLUDED.forwards,
        ingested_at = EXCLUDED.ingested_at
"#;

const CLASSIFICATION_UPSERT: &str = r#"
    INSERT INTO image_classifications (
        image_path, channel, message_id, category, threshold,
        detection_count, detected_labels, classified_at
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
    ON CONFLICT (image_path) DO UPDATE SET
        channel = EXCLUDED.channel,
        message_id = EXCLUDED.message_id,
        category = EXCLUDED.category,
        threshold = EXCLUDED.threshold,
        detection_count = EXCLUDED.detection_count,
        detected_labels = EXCLUDED.detected_labels,
        classified_at = NOW()
"#;

const CHECKPOINT_ADVANCE: &str = r#"
    INSERT INTO channel_checkpoints (channel, last_message_id, updated_at)
    VALUES ($1, $2, NOW())
    ON CONFLICT (channel) DO UPDATE SET
        last_message_id = GREATEST(channel_checkpoints.last_message_id, EXCLUDED.last_message_id),
        updated_at = NOW()
"#;

/// Conflict clause used for message rows under `mode`.
pub fn message_upsert_sql(mode: UpsertMode) -> &'static str {
    match mode {
        UpsertMode::FullReplace => MESSAGE_UPSERT_FULL,
        UpsertMode::CountersOnly => MESSAGE_UPSERT_COUNTERS,
    }
}

/// How a database error should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlErrorClass {
    /// Retry the whole batch
    Transient,
    /// Exclude the offending row, keep the batch
    RowRejected,
    /// Give up
    Fatal,
}

/// Classify a PostgreSQL SQLSTATE code.
pub fn classify_sqlstate(code: &str) -> SqlErrorClass {
    match code {
        // serialization_failure, deadlock_detected, admin_shutdown, too_many_connections
        "40001" | "40P01" | "57P01" | "53300" => SqlErrorClass::Transient,
        c if c.starts_with("08") => SqlErrorClass::Transient,
        // data_exception, integrity_constraint_violation
        c if c.starts_with("22") || c.starts_with("23") => SqlErrorClass::RowRejected,
        _ => SqlErrorClass::Fatal,
    }
}

/// Map a sqlx error onto the failure taxonomy.
pub fn classify_sqlx_error(err: sqlx::Error) -> Failure {
    match &err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => {
            Failure::transient(err.to_string())
        }
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            match classify_sqlstate(&code) {
                SqlErrorClass::Transient => Failure::transient(format!("{} ({})", db.message(), code)),
                SqlErrorClass::RowRejected => Failure::Validation(ValidationError::Rejected(
                    format!("{} ({})", db.message(), code),
                )),
                SqlErrorClass::Fatal => Failure::fatal(format!("{} ({})", db.message(), code)),
            }
        }
        _ => Failure::fatal(err.to_string()),
    }
}

#[derive(Debug, FromRow)]
struct CheckpointRow {
    channel: String,
    last_message_id: i64,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct MediaOwnerRow {
    media_path: String,
    channel: String,
    message_id: i64,
}

/// Summary of one ingest run as stored in `ingest_runs`.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: i32,
    pub failed: i32,
    pub cancelled: i32,
    pub report: serde_json::Value,
}

/// Idempotent persistence gateway over a PostgreSQL pool
pub struct PgGateway {
    pool: PgPool,
    retry: RetryPolicy,
    upsert_mode: UpsertMode,
}

impl PgGateway {
    /// Create a gateway with its own connection pool
    pub async fn connect(config: &DatabaseConfig, retry: RetryPolicy) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!(upsert_mode = ?config.upsert_mode, "Connected to PostgreSQL database");

        Ok(Self::from_pool(pool, retry, config.upsert_mode))
    }

    pub fn from_pool(pool: PgPool, retry: RetryPolicy, upsert_mode: UpsertMode) -> Self {
        Self {
            pool,
            retry,
            upsert_mode,
        }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Insert channels that are not registered yet. Existing rows are left untouched.
    #[instrument(skip(self, channels), fields(channels = channels.len()))]
    pub async fn register_channels(&self, channels: &[Channel]) -> Result<u64, Failure> {
        let inserted = self
            .retry
            .run("register_channels", move || self.insert_channels(channels))
            .await?;

        info!(inserted, "Channel registry up to date");
        Ok(inserted)
    }

    async fn insert_channels(&self, channels: &[Channel]) -> Result<u64, Failure> {
        let mut tx = self.pool.begin().await.map_err(classify_sqlx_error)?;
        let mut inserted = 0;

        for channel in channels {
            let result = sqlx::query(
                r#"
                INSERT INTO channels (handle, display_name, category)
                VALUES ($1, $2, $3)
                ON CONFLICT (handle) DO NOTHING
                "#,
            )
            .bind(&channel.handle)
            .bind(&channel.display_name)
            .bind(&channel.category)
            .execute(&mut *tx)
            .await
            .map_err(classify_sqlx_error)?;
            inserted += result.rows_affected();
        }

        tx.commit().await.map_err(classify_sqlx_error)?;
        Ok(inserted)
    }

    /// Store the summary of an ingest run
    #[instrument(skip(self, run), fields(run_id = %run.run_id))]
    pub async fn record_run(&self, run: &RunRecord) -> Result<(), Failure> {
        self.retry
            .run("record_run", move || async move {
                sqlx::query(
                    r#"
                    INSERT INTO ingest_runs (
                        run_id, started_at, finished_at,
                        succeeded, failed, cancelled, report
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (run_id) DO UPDATE SET
                        finished_at = EXCLUDED.finished_at,
                        succeeded = EXCLUDED.succeeded,
                        failed = EXCLUDED.failed,
                        cancelled = EXCLUDED.cancelled,
                        report = EXCLUDED.report
                    "#,
                )
                .bind(run.run_id)
                .bind(run.started_at)
                .bind(run.finished_at)
                .bind(run.succeeded)
                .bind(run.failed)
                .bind(run.cancelled)
                .bind(&run.report)
                .execute(&self.pool)
                .await
                .map_err(classify_sqlx_error)?;
                Ok(())
            })
            .await
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// One attempt at writing `records` (and `advance`) in a single transaction.
    ///
    /// Returns the rows the database refused. Any other error rolls the whole
    /// transaction back.
    async fn write_batch(
        &self,
        records: &[Record],
        advance: Option<&CheckpointAdvance>,
    ) -> Result<Vec<RejectedRow>, Failure> {
        let mut tx = self.pool.begin().await.map_err(classify_sqlx_error)?;
        let mut rejected = Vec::new();

        for record in records {
            let mut savepoint = Connection::begin(&mut *tx)
                .await
                .map_err(classify_sqlx_error)?;

            match self.write_record(&mut savepoint, record).await {
                Ok(()) => savepoint.commit().await.map_err(classify_sqlx_error)?,
                Err(Failure::Validation(reason)) => {
                    savepoint.rollback().await.map_err(classify_sqlx_error)?;
                    let key = record.key_label();
                    warn!(key = %key, reason = %reason, "Row rejected by database, excluded from batch");
                    metrics::counter!("medlens.gateway.rows_rejected", "stage" => "database")
                        .increment(1);
                    rejected.push(RejectedRow { key, reason });
                }
                Err(other) => return Err(other),
            }
        }

        if let Some(advance) = advance {
            sqlx::query(CHECKPOINT_ADVANCE)
                .bind(&advance.channel)
                .bind(advance.to)
                .execute(&mut *tx)
                .await
                .map_err(classify_sqlx_error)?;
        }

        tx.commit().await.map_err(classify_sqlx_error)?;
        Ok(rejected)
    }

    async fn write_record(&self, conn: &mut PgConnection, record: &Record) -> Result<(), Failure> {
        match record {
            Record::Message(message) => self.write_message(conn, message).await,
            Record::Classification(result) => write_classification(conn, result).await,
        }
    }

    async fn write_message(&self, conn: &mut PgConnection, message: &RawMessage) -> Result<(), Failure> {
        sqlx::query(message_upsert_sql(self.upsert_mode))
            .bind(&message.channel)
            .bind(message.message_id)
            .bind(message.posted_at)
            .bind(&message.text)
            .bind(message.views)
            .bind(message.forwards)
            .bind(message.has_media)
            .bind(&message.media_path)
            .bind(message.ingested_at)
            .execute(conn)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(())
    }

    async fn run_batch(
        &self,
        operation: &str,
        batch: Vec<Record>,
        advance: Option<CheckpointAdvance>,
    ) -> Result<UpsertReport, Failure> {
        let (valid, mut rejected) = partition(batch);

        if valid.is_empty() && advance.is_none() {
            return Ok(UpsertReport {
                committed: 0,
                rejected,
            });
        }

        let records = &valid;
        let advance = advance.as_ref();
        let db_rejected = self
            .retry
            .run(operation, move || self.write_batch(records, advance))
            .await?;

        let committed = valid.len() - db_rejected.len();
        rejected.extend(db_rejected);

        metrics::counter!("medlens.gateway.batches_committed").increment(1);
        metrics::counter!("medlens.gateway.rows_committed").increment(committed as u64);

        debug!(
            committed,
            rejected = rejected.len(),
            "Batch committed"
        );

        Ok(UpsertReport { committed, rejected })
    }
}

async fn write_classification(
    conn: &mut PgConnection,
    result: &ClassificationResult,
) -> Result<(), Failure> {
    sqlx::query(CLASSIFICATION_UPSERT)
        .bind(&result.image_path)
        .bind(&result.channel)
        .bind(result.message_id)
        .bind(result.category.as_str())
        .bind(result.threshold.value())
        .bind(result.detection_count as i32)
        .bind(&result.detected_labels)
        .execute(conn)
        .await
        .map_err(classify_sqlx_error)?;
    Ok(())
}

#[async_trait]
impl CheckpointStore for PgGateway {
    #[instrument(skip(self))]
    async fn load_checkpoint(&self, channel: &str) -> Result<Option<Checkpoint>, Failure> {
        let row = self
            .retry
            .run("load_checkpoint", move || async move {
                sqlx::query_as::<_, CheckpointRow>(
                    r#"
                    SELECT channel, last_message_id, updated_at
                    FROM channel_checkpoints
                    WHERE channel = $1
                    "#,
                )
                .bind(channel)
                .fetch_optional(&self.pool)
                .await
                .map_err(classify_sqlx_error)
            })
            .await?;

        Ok(row.map(|r| Checkpoint {
            channel: r.channel,
            last_message_id: r.last_message_id,
            updated_at: r.updated_at,
        }))
    }
}

#[async_trait]
impl RecordStore for PgGateway {
    #[instrument(skip(self, batch), fields(rows = batch.len()))]
    async fn upsert(&self, batch: Vec<Record>) -> Result<UpsertReport, Failure> {
        self.run_batch("upsert", batch, None).await
    }

    #[instrument(skip(self, batch), fields(channel = %advance.channel, to = advance.to, rows = batch.len()))]
    async fn commit_batch(
        &self,
        batch: Vec<RawMessage>,
        advance: CheckpointAdvance,
    ) -> Result<UpsertReport, Failure> {
        let records = batch.into_iter().map(Record::from).collect();
        let report = self.run_batch("commit_batch", records, Some(advance)).await?;
        metrics::counter!("medlens.checkpoint.advanced").increment(1);
        Ok(report)
    }

    #[instrument(skip(self, paths), fields(paths = paths.len()))]
    async fn attribute_media(&self, paths: &[String]) -> Result<HashMap<String, MessageKey>, Failure> {
        if paths.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = self
            .retry
            .run("attribute_media", move || async move {
                sqlx::query_as::<_, MediaOwnerRow>(
                    r#"
                    SELECT media_path, channel, message_id
                    FROM raw_messages
                    WHERE media_path = ANY($1)
                    "#,
                )
                .bind(paths)
                .fetch_all(&self.pool)
                .await
                .map_err(classify_sqlx_error)
            })
            .await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    r.media_path,
                    MessageKey {
                        channel: r.channel,
                        message_id: r.message_id,
                    },
                )
            })
            .collect())
    }
}
