use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{TryStreamExt, stream};
use sqlx::{PgPool, Postgres, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    CorrelationId, Event, EventId, EventQuery, EventStoreError, NewEvent, Result, StreamId,
    Version,
    store::{
        AppendOptions, EventStore, EventStream, READ_PAGE_SIZE, TransactionalEventStore,
        stamp_events, validate_append,
    },
};

/// Transaction handle shared by the PostgreSQL event store and repositories.
pub type PgTransaction = sqlx::Transaction<'static, Postgres>;

const SELECT_COLUMNS: &str =
    "SELECT id, stream_id, version, event_type, event_data, metadata, correlation_id, created_at FROM event_store";

/// PostgreSQL-backed event store implementation.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Creates a new PostgreSQL event store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_event(row: PgRow) -> Result<Event> {
        let metadata_json: serde_json::Value = row.try_get("metadata")?;
        let metadata: HashMap<String, serde_json::Value> = if metadata_json.is_null() {
            HashMap::new()
        } else {
            serde_json::from_value(metadata_json)?
        };

        Ok(Event {
            id: EventId::from_uuid(row.try_get::<Uuid, _>("id")?),
            stream_id: StreamId::new(row.try_get::<String, _>("stream_id")?),
            version: Version::new(row.try_get("version")?),
            event_type: row.try_get("event_type")?,
            payload: row.try_get("event_data")?,
            metadata,
            correlation_id: row
                .try_get::<Option<Uuid>, _>("correlation_id")?
                .map(CorrelationId::from_uuid),
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        })
    }

    async fn fetch_stream_page(
        pool: PgPool,
        stream_id: StreamId,
        next: Version,
        upper: Version,
    ) -> Result<Option<(Vec<Event>, Version)>> {
        if next > upper {
            return Ok(None);
        }

        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE stream_id = $1 AND version >= $2 AND version <= $3 ORDER BY version ASC LIMIT $4"
        ))
        .bind(stream_id.as_str())
        .bind(next.as_i64())
        .bind(upper.as_i64())
        .bind(READ_PAGE_SIZE)
        .fetch_all(&pool)
        .await?;

        let events = rows
            .into_iter()
            .map(Self::row_to_event)
            .collect::<Result<Vec<_>>>()?;

        match events.last() {
            Some(last) => {
                let after = last.version.next();
                Ok(Some((events, after)))
            }
            None => Ok(None),
        }
    }

    async fn fetch_correlation_page(
        pool: PgPool,
        correlation_id: CorrelationId,
        as_of: DateTime<Utc>,
        offset: i64,
    ) -> Result<Option<(Vec<Event>, i64)>> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE correlation_id = $1 AND created_at <= $2 ORDER BY created_at ASC, stream_id ASC, version ASC LIMIT $3 OFFSET $4"
        ))
        .bind(correlation_id.as_uuid())
        .bind(as_of)
        .bind(READ_PAGE_SIZE)
        .bind(offset)
        .fetch_all(&pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let fetched = rows.len() as i64;
        let events = rows
            .into_iter()
            .map(Self::row_to_event)
            .collect::<Result<Vec<_>>>()?;
        Ok(Some((events, offset + fetched)))
    }

    fn flatten_pages<S>(pages: S) -> EventStream
    where
        S: futures_core::Stream<Item = Result<Vec<Event>>> + Send + 'static,
    {
        Box::pin(
            pages
                .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, EventStoreError>)))
                .try_flatten(),
        )
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn append(
        &self,
        stream_id: &StreamId,
        events: Vec<NewEvent>,
        options: AppendOptions,
    ) -> Result<Vec<Event>> {
        let mut tx = self.begin().await?;
        let stored = self.append_in(&mut tx, stream_id, events, options).await?;
        self.commit(tx).await?;
        Ok(stored)
    }

    async fn read_stream(
        &self,
        stream_id: &StreamId,
        from_version: Option<Version>,
    ) -> Result<EventStream> {
        let upper = self
            .stream_version(stream_id)
            .await?
            .unwrap_or(Version::initial());
        let start = from_version.unwrap_or(Version::first());
        let pool = self.pool.clone();
        let stream_id = stream_id.clone();

        let pages = stream::try_unfold(start, move |next| {
            Self::fetch_stream_page(pool.clone(), stream_id.clone(), next, upper)
        });
        Ok(Self::flatten_pages(pages))
    }

    async fn read_by_correlation(&self, correlation_id: CorrelationId) -> Result<EventStream> {
        let as_of = Utc::now();
        let pool = self.pool.clone();

        let pages = stream::try_unfold(0_i64, move |offset| {
            Self::fetch_correlation_page(pool.clone(), correlation_id, as_of, offset)
        });
        Ok(Self::flatten_pages(pages))
    }

    async fn stream_version(&self, stream_id: &StreamId) -> Result<Option<Version>> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM event_store WHERE stream_id = $1")
                .bind(stream_id.as_str())
                .fetch_one(&self.pool)
                .await?;

        Ok(version.map(Version::new))
    }

    async fn query_events(&self, query: EventQuery) -> Result<Vec<Event>> {
        let mut sql = format!("{SELECT_COLUMNS} WHERE 1=1");
        let mut param_count = 0;

        // Build dynamic query
        if query.stream_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND stream_id = ${param_count}"));
        }
        if query.event_types.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND event_type = ANY(${param_count})"));
        }
        if query.correlation_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND correlation_id = ${param_count}"));
        }
        if query.from_version.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND version >= ${param_count}"));
        }
        if query.to_version.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND version <= ${param_count}"));
        }
        if query.from_timestamp.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND created_at >= ${param_count}"));
        }
        if query.to_timestamp.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND created_at <= ${param_count}"));
        }

        sql.push_str(" ORDER BY created_at ASC, version ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }
        if query.offset.is_some() {
            param_count += 1;
            sql.push_str(&format!(" OFFSET ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(stream_id) = query.stream_id {
            sqlx_query = sqlx_query.bind(stream_id.as_str().to_string());
        }
        if let Some(event_types) = query.event_types {
            sqlx_query = sqlx_query.bind(event_types);
        }
        if let Some(correlation_id) = query.correlation_id {
            sqlx_query = sqlx_query.bind(correlation_id.as_uuid());
        }
        if let Some(from_version) = query.from_version {
            sqlx_query = sqlx_query.bind(from_version.as_i64());
        }
        if let Some(to_version) = query.to_version {
            sqlx_query = sqlx_query.bind(to_version.as_i64());
        }
        if let Some(from_ts) = query.from_timestamp {
            sqlx_query = sqlx_query.bind(from_ts);
        }
        if let Some(to_ts) = query.to_timestamp {
            sqlx_query = sqlx_query.bind(to_ts);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            sqlx_query = sqlx_query.bind(offset as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_event).collect()
    }
}

#[async_trait]
impl TransactionalEventStore for PostgresEventStore {
    type Tx = PgTransaction;

    async fn begin(&self) -> Result<Self::Tx> {
        Ok(self.pool.begin().await?)
    }

    async fn append_in(
        &self,
        tx: &mut Self::Tx,
        stream_id: &StreamId,
        events: Vec<NewEvent>,
        options: AppendOptions,
    ) -> Result<Vec<Event>> {
        validate_append(stream_id, &events)?;

        let current: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM event_store WHERE stream_id = $1")
                .bind(stream_id.as_str())
                .fetch_one(&mut **tx)
                .await?;
        let current = Version::new(current.unwrap_or(0));
        options.check(stream_id, current)?;

        let stored = stamp_events(stream_id, current, events);
        for event in &stored {
            let metadata_json = serde_json::to_value(&event.metadata)?;

            sqlx::query(
                r#"
                INSERT INTO event_store (id, stream_id, version, event_type, event_data, metadata, correlation_id, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(event.id.as_uuid())
            .bind(event.stream_id.as_str())
            .bind(event.version.as_i64())
            .bind(&event.event_type)
            .bind(&event.payload)
            .bind(metadata_json)
            .bind(event.correlation_id.map(|c| c.as_uuid()))
            .bind(event.created_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                // A unique violation means another writer took this version first
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.constraint() == Some("unique_stream_version")
                {
                    return EventStoreError::ConcurrencyConflict {
                        stream_id: stream_id.clone(),
                        expected: options.expected_version.unwrap_or(current),
                        actual: event.version,
                    };
                }
                EventStoreError::Database(e)
            })?;
        }

        metrics::counter!("event_store_appends_total").increment(1);
        Ok(stored)
    }

    async fn commit(&self, tx: Self::Tx) -> Result<()> {
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<()> {
        tx.rollback().await?;
        Ok(())
    }
}
