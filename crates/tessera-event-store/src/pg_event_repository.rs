//! `PostgreSQL` implementation of the `EventRepository` trait.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use uuid::Uuid;

use tessera_core::event::EventRecord;
use tessera_core::identifiers::{
    AggregateId, AggregateType, GlobalSequence, SequenceNumber, TenantId,
};
use tessera_core::repository::{EventRepository, NewEvent, RepositoryError};
use tessera_core::snapshot::SnapshotRecord;
use tessera_core::token::TrackingToken;

use crate::error::{classify, is_stream_sequence_violation};
use crate::schema::{APPEND_LOCK_KEY, MIGRATOR};

/// Rows per multi-row `INSERT`; nine binds each stays well under the
/// protocol's bind parameter limit.
const INSERT_CHUNK: usize = 1000;

/// PostgreSQL-backed event repository.
#[derive(Debug, Clone)]
pub struct PgEventRepository {
    pool: PgPool,
    serialize_appends: bool,
}

impl PgEventRepository {
    /// Creates a new `PgEventRepository` that serializes appends.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            serialize_appends: true,
        }
    }

    /// Turns the append advisory lock on or off.
    ///
    /// Without it, concurrent appends to different aggregates may commit out
    /// of `global_sequence` order and a tracking reader can skip an event
    /// that commits late.
    #[must_use]
    pub fn with_serialize_appends(mut self, serialize_appends: bool) -> Self {
        self.serialize_appends = serialize_appends;
        self
    }

    /// Returns the connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the embedded schema migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails to apply.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        MIGRATOR.run(&self.pool).await
    }

    /// Checks every aggregate of the batch against its stored head inside
    /// the append transaction, with one grouped lookup for the whole batch.
    async fn check_heads(
        tx: &mut Transaction<'_, Postgres>,
        tenant: &TenantId,
        events: &[NewEvent],
    ) -> Result<(), RepositoryError> {
        let mut seen: HashSet<&str> = HashSet::new();
        let firsts: Vec<&NewEvent> = events
            .iter()
            .filter(|event| seen.insert(event.aggregate_id.as_str()))
            .collect();
        let aggregate_ids: Vec<&str> = firsts.iter().map(|e| e.aggregate_id.as_str()).collect();

        let heads: Vec<(String, i64)> = sqlx::query_as(
            "SELECT aggregate_id, MAX(sequence_number) FROM events \
             WHERE tenant_id = $1 AND aggregate_id = ANY($2) \
             GROUP BY aggregate_id",
        )
        .bind(tenant.as_str())
        .bind(&aggregate_ids)
        .fetch_all(&mut **tx)
        .await
        .map_err(classify)?;
        let mut heads: HashMap<String, SequenceNumber> = heads
            .into_iter()
            .map(|(aggregate_id, head)| {
                Ok((aggregate_id, SequenceNumber::new(from_db("sequence_number", head)?)))
            })
            .collect::<Result<_, RepositoryError>>()?;

        for event in firsts {
            let expected = match heads.remove(event.aggregate_id.as_str()) {
                Some(head) => head.checked_next().ok_or_else(|| RepositoryError::Conflict {
                    aggregate_id: event.aggregate_id.clone(),
                    sequence_number: event.sequence_number,
                })?,
                None => SequenceNumber::FIRST,
            };
            if event.sequence_number < expected {
                return Err(RepositoryError::Conflict {
                    aggregate_id: event.aggregate_id.clone(),
                    sequence_number: event.sequence_number,
                });
            }
            if event.sequence_number > expected {
                return Err(RepositoryError::SequenceGap {
                    aggregate_id: event.aggregate_id.clone(),
                    expected,
                    actual: event.sequence_number,
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventRepository for PgEventRepository {
    async fn insert_events(
        &self,
        tenant: &TenantId,
        events: &[NewEvent],
    ) -> Result<(), RepositoryError> {
        if events.is_empty() {
            return Ok(());
        }
        let sequence_numbers = events
            .iter()
            .map(|e| to_db(e.sequence_number.value()))
            .collect::<Result<Vec<i64>, _>>()?;

        let mut tx = self.pool.begin().await.map_err(classify)?;

        if self.serialize_appends {
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(APPEND_LOCK_KEY)
                .execute(&mut *tx)
                .await
                .map_err(classify)?;
        }

        Self::check_heads(&mut tx, tenant, events).await?;

        for (rows, numbers) in events
            .chunks(INSERT_CHUNK)
            .zip(sequence_numbers.chunks(INSERT_CHUNK))
        {
            let mut builder = QueryBuilder::<Postgres>::new(
                "INSERT INTO events (event_id, tenant_id, aggregate_type, aggregate_id, \
                 sequence_number, event_type, payload, metadata, occurred_at) ",
            );
            builder.push_values(rows.iter().zip(numbers), |mut row, (event, number)| {
                row.push_bind(event.event_id)
                    .push_bind(tenant.as_str())
                    .push_bind(event.aggregate_type.as_str())
                    .push_bind(event.aggregate_id.as_str())
                    .push_bind(*number)
                    .push_bind(event.event_type.as_str())
                    .push_bind(&event.payload)
                    .push_bind(&event.metadata)
                    .push_bind(event.timestamp);
            });

            if let Err(err) = builder.build().execute(&mut *tx).await {
                if is_stream_sequence_violation(&err) {
                    // The constraint does not say which row collided; report
                    // the first event of the chunk.
                    return Err(RepositoryError::Conflict {
                        aggregate_id: rows[0].aggregate_id.clone(),
                        sequence_number: rows[0].sequence_number,
                    });
                }
                return Err(classify(err));
            }
        }

        tx.commit().await.map_err(classify)?;
        tracing::debug!(%tenant, events = events.len(), "inserted events");
        Ok(())
    }

    async fn read_stream(
        &self,
        tenant: &TenantId,
        aggregate_id: &AggregateId,
        from: SequenceNumber,
        limit: u32,
    ) -> Result<Vec<EventRecord>, RepositoryError> {
        // Nothing is stored past the BIGINT range.
        let Ok(from) = i64::try_from(from.value()) else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT global_sequence, event_id, tenant_id, aggregate_type, aggregate_id, \
                    sequence_number, event_type, payload, metadata, occurred_at \
             FROM events \
             WHERE tenant_id = $1 AND aggregate_id = $2 AND sequence_number >= $3 \
             ORDER BY sequence_number \
             LIMIT $4",
        )
        .bind(tenant.as_str())
        .bind(aggregate_id.as_str())
        .bind(from)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        rows.into_iter().map(EventRecord::try_from).collect()
    }

    async fn read_tracked(
        &self,
        tenant: &TenantId,
        after: TrackingToken,
        excluded_event_types: &[String],
        limit: u32,
    ) -> Result<Vec<EventRecord>, RepositoryError> {
        let after = after
            .position()
            .map(|position| to_db(position.value()))
            .transpose()?;

        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT global_sequence, event_id, tenant_id, aggregate_type, aggregate_id, \
                    sequence_number, event_type, payload, metadata, occurred_at \
             FROM events \
             WHERE tenant_id = $1 \
               AND ($2::BIGINT IS NULL OR global_sequence > $2) \
               AND NOT (event_type = ANY($3)) \
             ORDER BY global_sequence \
             LIMIT $4",
        )
        .bind(tenant.as_str())
        .bind(after)
        .bind(excluded_event_types)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        rows.into_iter().map(EventRecord::try_from).collect()
    }

    async fn last_sequence_number(
        &self,
        tenant: &TenantId,
        aggregate_id: &AggregateId,
    ) -> Result<Option<SequenceNumber>, RepositoryError> {
        let head: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(sequence_number) FROM events WHERE tenant_id = $1 AND aggregate_id = $2",
        )
        .bind(tenant.as_str())
        .bind(aggregate_id.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;

        head.map(|value| from_db("sequence_number", value).map(SequenceNumber::new))
            .transpose()
    }

    async fn max_global_sequence(
        &self,
        tenant: &TenantId,
    ) -> Result<Option<GlobalSequence>, RepositoryError> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(global_sequence) FROM events WHERE tenant_id = $1")
                .bind(tenant.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(classify)?;

        max.map(|value| from_db("global_sequence", value).map(GlobalSequence::new))
            .transpose()
    }

    async fn first_global_sequence_since(
        &self,
        tenant: &TenantId,
        since: DateTime<Utc>,
    ) -> Result<Option<GlobalSequence>, RepositoryError> {
        let first: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(global_sequence) FROM events WHERE tenant_id = $1 AND occurred_at >= $2",
        )
        .bind(tenant.as_str())
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;

        first
            .map(|value| from_db("global_sequence", value).map(GlobalSequence::new))
            .transpose()
    }

    async fn upsert_snapshot(&self, snapshot: &SnapshotRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO snapshots (tenant_id, aggregate_type, aggregate_id, sequence_number, \
                                    payload, metadata, taken_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (tenant_id, aggregate_type, aggregate_id) DO UPDATE \
             SET sequence_number = EXCLUDED.sequence_number, \
                 payload = EXCLUDED.payload, \
                 metadata = EXCLUDED.metadata, \
                 taken_at = EXCLUDED.taken_at \
             WHERE snapshots.sequence_number <= EXCLUDED.sequence_number",
        )
        .bind(snapshot.tenant_id.as_str())
        .bind(snapshot.aggregate_type.as_str())
        .bind(snapshot.aggregate_id.as_str())
        .bind(to_db(snapshot.sequence_number.value())?)
        .bind(&snapshot.payload)
        .bind(&snapshot.metadata)
        .bind(snapshot.timestamp)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn find_snapshot(
        &self,
        tenant: &TenantId,
        aggregate_id: &AggregateId,
    ) -> Result<Option<SnapshotRecord>, RepositoryError> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            "SELECT tenant_id, aggregate_type, aggregate_id, sequence_number, payload, metadata, \
                    taken_at \
             FROM snapshots \
             WHERE tenant_id = $1 AND aggregate_id = $2 \
             ORDER BY sequence_number DESC, taken_at DESC \
             LIMIT 1",
        )
        .bind(tenant.as_str())
        .bind(aggregate_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        row.map(SnapshotRecord::try_from).transpose()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    global_sequence: i64,
    event_id: Uuid,
    tenant_id: String,
    aggregate_type: String,
    aggregate_id: String,
    sequence_number: i64,
    event_type: String,
    payload: serde_json::Value,
    metadata: serde_json::Value,
    occurred_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for EventRecord {
    type Error = RepositoryError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(EventRecord {
            event_id: row.event_id,
            tenant_id: tenant_from_db(row.tenant_id)?,
            aggregate_type: AggregateType::new(row.aggregate_type),
            aggregate_id: AggregateId::new(row.aggregate_id),
            sequence_number: SequenceNumber::new(from_db("sequence_number", row.sequence_number)?),
            global_sequence: GlobalSequence::new(from_db("global_sequence", row.global_sequence)?),
            event_type: row.event_type,
            payload: row.payload,
            metadata: row.metadata,
            timestamp: row.occurred_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SnapshotRow {
    tenant_id: String,
    aggregate_type: String,
    aggregate_id: String,
    sequence_number: i64,
    payload: serde_json::Value,
    metadata: serde_json::Value,
    taken_at: DateTime<Utc>,
}

impl TryFrom<SnapshotRow> for SnapshotRecord {
    type Error = RepositoryError;

    fn try_from(row: SnapshotRow) -> Result<Self, Self::Error> {
        Ok(SnapshotRecord {
            tenant_id: tenant_from_db(row.tenant_id)?,
            aggregate_type: AggregateType::new(row.aggregate_type),
            aggregate_id: AggregateId::new(row.aggregate_id),
            sequence_number: SequenceNumber::new(from_db("sequence_number", row.sequence_number)?),
            payload: row.payload,
            metadata: row.metadata,
            timestamp: row.taken_at,
        })
    }
}

fn to_db(value: u64) -> Result<i64, RepositoryError> {
    i64::try_from(value).map_err(|e| RepositoryError::Backend(Box::new(e)))
}

fn from_db(column: &str, value: i64) -> Result<u64, RepositoryError> {
    u64::try_from(value)
        .map_err(|_| RepositoryError::Corrupt(format!("negative {column} {value}")))
}

fn tenant_from_db(value: String) -> Result<TenantId, RepositoryError> {
    TenantId::new(value).map_err(|_| RepositoryError::Corrupt("row with blank tenant_id".into()))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn event_row() -> EventRow {
        EventRow {
            global_sequence: 7,
            event_id: Uuid::now_v7(),
            tenant_id: "acme".to_string(),
            aggregate_type: "Order".to_string(),
            aggregate_id: "order-1".to_string(),
            sequence_number: 2,
            event_type: "order.line_added".to_string(),
            payload: json!({"sku": "SKU-1"}),
            metadata: json!({}),
            occurred_at: Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_event_row_converts_to_record() {
        let record = EventRecord::try_from(event_row()).unwrap();

        assert_eq!(record.tenant_id.as_str(), "acme");
        assert_eq!(record.sequence_number, SequenceNumber::new(2));
        assert_eq!(record.global_sequence, GlobalSequence::new(7));
    }

    #[test]
    fn test_negative_sequence_is_corrupt() {
        let mut row = event_row();
        row.sequence_number = -1;

        assert!(matches!(
            EventRecord::try_from(row),
            Err(RepositoryError::Corrupt(_))
        ));
    }

    #[test]
    fn test_blank_tenant_is_corrupt() {
        let mut row = event_row();
        row.tenant_id = "  ".to_string();

        assert!(matches!(
            EventRecord::try_from(row),
            Err(RepositoryError::Corrupt(_))
        ));
    }

    #[test]
    fn test_sequence_beyond_bigint_is_rejected() {
        assert!(matches!(to_db(u64::MAX), Err(RepositoryError::Backend(_))));
        assert_eq!(to_db(42).unwrap(), 42);
    }
}
