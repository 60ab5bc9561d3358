//! Durable request store.
//!
//! The tracker sees storage through the [`UsageStore`] trait: upserts keyed
//! on the request id, an idempotent completion write, and retention
//! cleanup. [`SqliteStore`] is the production implementation — WAL journal
//! mode so dashboard readers can run while the single writer task applies
//! batches — and [`MemoryStore`] backs tests.
//!
//! Timestamps are rendered in the operator-selected time zone; cost
//! columns are decimal strings with sub-microdollar resolution.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;

use crate::error::{RelayError, RelayResult};
use crate::internals::sse::TokenUsage;
use crate::lifecycle::{RequestRecord, RequestStatus};
use crate::logging::{log_debug, log_info};
use crate::pricing::CostBreakdown;

/// Partial update applied on a status transition.
#[derive(Debug, Clone, Default)]
pub struct RequestUpdate {
    pub endpoint: Option<String>,
    pub group: Option<String>,
    pub status: Option<RequestStatus>,
    pub retry_count: Option<u32>,
    pub http_status: Option<u16>,
}

/// Append/update interface the lifecycle tracker writes through.
///
/// Implementations must keep exactly one row per request id, never regress
/// a terminal status, and make [`mark_completed`](Self::mark_completed)
/// idempotent.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Insert the initial `pending` row. A duplicate insert for the same
    /// request id is a no-op.
    async fn insert_request(&self, record: RequestRecord) -> RelayResult<()>;

    /// Upsert changing fields. Absent fields keep their stored values; a
    /// terminal status is never overwritten.
    async fn update_request(&self, request_id: &str, update: RequestUpdate) -> RelayResult<()>;

    /// Write token and cost fields for a request that did not complete.
    /// The status column is left alone.
    async fn record_failure_tokens(
        &self,
        request_id: &str,
        model: Option<String>,
        usage: TokenUsage,
        costs: CostBreakdown,
        failure_reason: String,
    ) -> RelayResult<()>;

    /// Transition to `completed` with final tokens, costs, and duration.
    /// Returns false when the request had already completed (no-op).
    async fn mark_completed(
        &self,
        request_id: &str,
        model: Option<String>,
        usage: TokenUsage,
        costs: CostBreakdown,
        end_time: DateTime<Utc>,
        duration_ms: u64,
    ) -> RelayResult<bool>;

    /// Read one row back (dashboards, tests).
    async fn fetch(&self, request_id: &str) -> RelayResult<Option<RequestRecord>>;

    /// Delete rows started before the cutoff. Returns the removed count.
    async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> RelayResult<u64>;
}

// ============================================================================
// SQLite implementation
// ============================================================================

const TERMINAL_STATUSES_SQL: &str =
    "('completed','error','timeout','cancelled','network_error','stream_error','rate_limited')";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS request_records (
    request_id            TEXT PRIMARY KEY,
    client_ip             TEXT NOT NULL,
    user_agent            TEXT NOT NULL,
    method                TEXT NOT NULL,
    path                  TEXT NOT NULL,
    is_streaming          INTEGER NOT NULL,
    start_time            TEXT NOT NULL,
    end_time              TEXT,
    endpoint_name         TEXT,
    group_name            TEXT,
    retry_count           INTEGER NOT NULL DEFAULT 0,
    http_status           INTEGER,
    status                TEXT NOT NULL,
    model_name            TEXT,
    input_tokens          INTEGER NOT NULL DEFAULT 0,
    output_tokens         INTEGER NOT NULL DEFAULT 0,
    cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
    cache_read_tokens     INTEGER NOT NULL DEFAULT 0,
    input_cost            TEXT NOT NULL DEFAULT '0',
    output_cost           TEXT NOT NULL DEFAULT '0',
    cache_creation_cost   TEXT NOT NULL DEFAULT '0',
    cache_read_cost       TEXT NOT NULL DEFAULT '0',
    total_cost            TEXT NOT NULL DEFAULT '0',
    failure_reason        TEXT,
    duration_ms           INTEGER
);
CREATE INDEX IF NOT EXISTS idx_request_records_start_time
    ON request_records(start_time);
";

/// SQLite-backed store. Writes arrive serialised from the tracker's writer
/// task; WAL mode keeps concurrent readers unblocked.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    tz: Tz,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>, tz: Tz) -> RelayResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| RelayError::store_error(format!("failed to open database: {e}")))?;
        Self::initialize(conn, tz)
    }

    /// In-memory database, mainly for tests.
    pub fn open_in_memory(tz: Tz) -> RelayResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| RelayError::store_error(format!("failed to open database: {e}")))?;
        Self::initialize(conn, tz)
    }

    fn initialize(conn: Connection, tz: Tz) -> RelayResult<Self> {
        // journal_mode returns the resulting mode as a row.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_row| Ok(0i32))
            .ok();
        conn.execute_batch("PRAGMA synchronous = NORMAL;").ok();
        conn.execute_batch(SCHEMA)?;
        log_info!(timezone = %tz, "Request store initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            tz,
        })
    }

    fn format_time(&self, time: DateTime<Utc>) -> String {
        time.with_timezone(&self.tz).to_rfc3339()
    }

    async fn call<T, F>(&self, operation: F) -> RelayResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("store lock poisoned");
            operation(&conn)
        })
        .await
        .map_err(|e| RelayError::store_error(format!("store task failed: {e}")))?
        .map_err(RelayError::from)
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<RequestRecord> {
    let parse_time = |value: Option<String>| {
        value.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|t| t.with_timezone(&Utc))
        })
    };
    let parse_cost =
        |value: String| Decimal::from_str(&value).unwrap_or(Decimal::ZERO);

    let status: String = row.get("status")?;
    Ok(RequestRecord {
        request_id: row.get("request_id")?,
        client_ip: row.get("client_ip")?,
        user_agent: row.get("user_agent")?,
        method: row.get("method")?,
        path: row.get("path")?,
        is_streaming: row.get::<_, i64>("is_streaming")? != 0,
        start_time: parse_time(Some(row.get("start_time")?)).unwrap_or_else(Utc::now),
        end_time: parse_time(row.get("end_time")?),
        endpoint_name: row.get("endpoint_name")?,
        group_name: row.get("group_name")?,
        retry_count: row.get("retry_count")?,
        http_status: row.get::<_, Option<u16>>("http_status")?,
        status: RequestStatus::parse(&status).unwrap_or(RequestStatus::Error),
        model_name: row.get("model_name")?,
        input_tokens: row.get::<_, i64>("input_tokens")? as u64,
        output_tokens: row.get::<_, i64>("output_tokens")? as u64,
        cache_creation_tokens: row.get::<_, i64>("cache_creation_tokens")? as u64,
        cache_read_tokens: row.get::<_, i64>("cache_read_tokens")? as u64,
        input_cost: parse_cost(row.get("input_cost")?),
        output_cost: parse_cost(row.get("output_cost")?),
        cache_creation_cost: parse_cost(row.get("cache_creation_cost")?),
        cache_read_cost: parse_cost(row.get("cache_read_cost")?),
        total_cost: parse_cost(row.get("total_cost")?),
        failure_reason: row.get("failure_reason")?,
        duration_ms: row.get::<_, Option<i64>>("duration_ms")?.map(|v| v as u64),
    })
}

#[async_trait]
impl UsageStore for SqliteStore {
    async fn insert_request(&self, record: RequestRecord) -> RelayResult<()> {
        let start_time = self.format_time(record.start_time);
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO request_records
                    (request_id, client_ip, user_agent, method, path,
                     is_streaming, start_time, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(request_id) DO NOTHING",
                params![
                    record.request_id,
                    record.client_ip,
                    record.user_agent,
                    record.method,
                    record.path,
                    record.is_streaming as i64,
                    start_time,
                    record.status.as_str(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_request(&self, request_id: &str, update: RequestUpdate) -> RelayResult<()> {
        let request_id = request_id.to_string();
        self.call(move |conn| {
            conn.execute(
                &format!(
                    "UPDATE request_records SET
                        endpoint_name = COALESCE(?2, endpoint_name),
                        group_name = COALESCE(?3, group_name),
                        status = CASE
                            WHEN status IN {TERMINAL_STATUSES_SQL} THEN status
                            ELSE COALESCE(?4, status)
                        END,
                        retry_count = COALESCE(?5, retry_count),
                        http_status = COALESCE(?6, http_status)
                     WHERE request_id = ?1"
                ),
                params![
                    request_id,
                    update.endpoint,
                    update.group,
                    update.status.map(|s| s.as_str()),
                    update.retry_count,
                    update.http_status,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn record_failure_tokens(
        &self,
        request_id: &str,
        model: Option<String>,
        usage: TokenUsage,
        costs: CostBreakdown,
        failure_reason: String,
    ) -> RelayResult<()> {
        let request_id = request_id.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE request_records SET
                    model_name = COALESCE(?2, model_name),
                    input_tokens = ?3,
                    output_tokens = ?4,
                    cache_creation_tokens = ?5,
                    cache_read_tokens = ?6,
                    input_cost = ?7,
                    output_cost = ?8,
                    cache_creation_cost = ?9,
                    cache_read_cost = ?10,
                    total_cost = ?11,
                    failure_reason = ?12
                 WHERE request_id = ?1 AND status != 'completed'",
                params![
                    request_id,
                    model,
                    usage.input_tokens as i64,
                    usage.output_tokens as i64,
                    usage.cache_creation_tokens as i64,
                    usage.cache_read_tokens as i64,
                    costs.input_cost.to_string(),
                    costs.output_cost.to_string(),
                    costs.cache_creation_cost.to_string(),
                    costs.cache_read_cost.to_string(),
                    costs.total_cost.to_string(),
                    failure_reason,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn mark_completed(
        &self,
        request_id: &str,
        model: Option<String>,
        usage: TokenUsage,
        costs: CostBreakdown,
        end_time: DateTime<Utc>,
        duration_ms: u64,
    ) -> RelayResult<bool> {
        let request_id = request_id.to_string();
        let end_time = self.format_time(end_time);
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE request_records SET
                    status = 'completed',
                    model_name = COALESCE(?2, model_name),
                    input_tokens = ?3,
                    output_tokens = ?4,
                    cache_creation_tokens = ?5,
                    cache_read_tokens = ?6,
                    input_cost = ?7,
                    output_cost = ?8,
                    cache_creation_cost = ?9,
                    cache_read_cost = ?10,
                    total_cost = ?11,
                    end_time = ?12,
                    duration_ms = ?13
                 WHERE request_id = ?1 AND status != 'completed'",
                params![
                    request_id,
                    model,
                    usage.input_tokens as i64,
                    usage.output_tokens as i64,
                    usage.cache_creation_tokens as i64,
                    usage.cache_read_tokens as i64,
                    costs.input_cost.to_string(),
                    costs.output_cost.to_string(),
                    costs.cache_creation_cost.to_string(),
                    costs.cache_read_cost.to_string(),
                    costs.total_cost.to_string(),
                    end_time,
                    duration_ms as i64,
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn fetch(&self, request_id: &str) -> RelayResult<Option<RequestRecord>> {
        let request_id = request_id.to_string();
        self.call(move |conn| {
            conn.query_row(
                "SELECT * FROM request_records WHERE request_id = ?1",
                params![request_id],
                row_to_record,
            )
            .optional()
        })
        .await
    }

    async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> RelayResult<u64> {
        let cutoff = self.format_time(cutoff);
        let removed = self
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM request_records WHERE start_time < ?1",
                    params![cutoff],
                )
            })
            .await?;
        log_debug!(removed = removed, "Retention sweep finished");
        Ok(removed as u64)
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// HashMap-backed store with the same semantics; used by tests.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, RequestRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total rows held (tests).
    pub fn len(&self) -> usize {
        self.records.lock().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn insert_request(&self, record: RequestRecord) -> RelayResult<()> {
        self.records
            .lock()
            .expect("store lock poisoned")
            .entry(record.request_id.clone())
            .or_insert(record);
        Ok(())
    }

    async fn update_request(&self, request_id: &str, update: RequestUpdate) -> RelayResult<()> {
        let mut records = self.records.lock().expect("store lock poisoned");
        let Some(record) = records.get_mut(request_id) else {
            return Ok(());
        };
        if let Some(endpoint) = update.endpoint {
            record.endpoint_name = Some(endpoint);
        }
        if let Some(group) = update.group {
            record.group_name = Some(group);
        }
        if let Some(status) = update.status {
            if !record.status.is_terminal() {
                record.status = status;
            }
        }
        if let Some(retry_count) = update.retry_count {
            record.retry_count = retry_count;
        }
        if let Some(http_status) = update.http_status {
            record.http_status = Some(http_status);
        }
        Ok(())
    }

    async fn record_failure_tokens(
        &self,
        request_id: &str,
        model: Option<String>,
        usage: TokenUsage,
        costs: CostBreakdown,
        failure_reason: String,
    ) -> RelayResult<()> {
        let mut records = self.records.lock().expect("store lock poisoned");
        let Some(record) = records.get_mut(request_id) else {
            return Ok(());
        };
        if record.status == RequestStatus::Completed {
            return Ok(());
        }
        if model.is_some() {
            record.model_name = model;
        }
        record.apply_usage(&usage);
        record.input_cost = costs.input_cost;
        record.output_cost = costs.output_cost;
        record.cache_creation_cost = costs.cache_creation_cost;
        record.cache_read_cost = costs.cache_read_cost;
        record.total_cost = costs.total_cost;
        record.failure_reason = Some(failure_reason);
        Ok(())
    }

    async fn mark_completed(
        &self,
        request_id: &str,
        model: Option<String>,
        usage: TokenUsage,
        costs: CostBreakdown,
        end_time: DateTime<Utc>,
        duration_ms: u64,
    ) -> RelayResult<bool> {
        let mut records = self.records.lock().expect("store lock poisoned");
        let Some(record) = records.get_mut(request_id) else {
            return Ok(false);
        };
        if record.status == RequestStatus::Completed {
            return Ok(false);
        }
        record.status = RequestStatus::Completed;
        if model.is_some() {
            record.model_name = model;
        }
        record.apply_usage(&usage);
        record.input_cost = costs.input_cost;
        record.output_cost = costs.output_cost;
        record.cache_creation_cost = costs.cache_creation_cost;
        record.cache_read_cost = costs.cache_read_cost;
        record.total_cost = costs.total_cost;
        record.end_time = Some(end_time);
        record.duration_ms = Some(duration_ms);
        Ok(true)
    }

    async fn fetch(&self, request_id: &str) -> RelayResult<Option<RequestRecord>> {
        Ok(self
            .records
            .lock()
            .expect("store lock poisoned")
            .get(request_id)
            .cloned())
    }

    async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> RelayResult<u64> {
        let mut records = self.records.lock().expect("store lock poisoned");
        let before = records.len();
        records.retain(|_, r| r.start_time >= cutoff);
        Ok((before - records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn pending_record(id: &str) -> RequestRecord {
        RequestRecord::new(
            id.to_string(),
            "10.0.0.1".to_string(),
            "test-agent".to_string(),
            "POST".to_string(),
            "/v1/messages".to_string(),
            false,
            Utc::now(),
        )
    }

    fn usage() -> TokenUsage {
        TokenUsage {
            input_tokens: 257,
            output_tokens: 25,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
        }
    }

    fn costs() -> CostBreakdown {
        CostBreakdown {
            input_cost: Decimal::new(771, 6),
            output_cost: Decimal::new(375, 6),
            cache_creation_cost: Decimal::ZERO,
            cache_read_cost: Decimal::ZERO,
            total_cost: Decimal::new(1146, 6),
        }
    }

    async fn exercise_store(store: &dyn UsageStore) {
        store.insert_request(pending_record("req-aaaaaaaa")).await.unwrap();
        // Duplicate insert is a no-op.
        store.insert_request(pending_record("req-aaaaaaaa")).await.unwrap();

        store
            .update_request(
                "req-aaaaaaaa",
                RequestUpdate {
                    endpoint: Some("primary".to_string()),
                    group: Some("main".to_string()),
                    status: Some(RequestStatus::Forwarding),
                    retry_count: Some(1),
                    http_status: Some(200),
                },
            )
            .await
            .unwrap();

        let first = store
            .mark_completed(
                "req-aaaaaaaa",
                Some("claude-3-5-haiku-20241022".to_string()),
                usage(),
                costs(),
                Utc::now(),
                1200,
            )
            .await
            .unwrap();
        assert!(first);

        // Completion is idempotent.
        let second = store
            .mark_completed(
                "req-aaaaaaaa",
                Some("other-model".to_string()),
                TokenUsage::default(),
                CostBreakdown::default(),
                Utc::now(),
                99,
            )
            .await
            .unwrap();
        assert!(!second);

        let record = store.fetch("req-aaaaaaaa").await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Completed);
        assert_eq!(record.model_name.as_deref(), Some("claude-3-5-haiku-20241022"));
        assert_eq!(record.input_tokens, 257);
        assert_eq!(record.output_tokens, 25);
        assert_eq!(record.total_cost, Decimal::new(1146, 6));
        assert_eq!(record.endpoint_name.as_deref(), Some("primary"));
        assert_eq!(record.retry_count, 1);

        // A status update after completion cannot regress the terminal state.
        store
            .update_request(
                "req-aaaaaaaa",
                RequestUpdate {
                    status: Some(RequestStatus::Retry),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let record = store.fetch("req-aaaaaaaa").await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Completed);
    }

    #[tokio::test]
    async fn sqlite_store_lifecycle_round_trip() {
        let store = SqliteStore::open_in_memory(chrono_tz::Asia::Shanghai).unwrap();
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn memory_store_lifecycle_round_trip() {
        let store = MemoryStore::new();
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn failure_tokens_do_not_touch_status() {
        let store = SqliteStore::open_in_memory(chrono_tz::Asia::Shanghai).unwrap();
        store.insert_request(pending_record("req-bbbbbbbb")).await.unwrap();
        store
            .update_request(
                "req-bbbbbbbb",
                RequestUpdate {
                    status: Some(RequestStatus::StreamError),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        store
            .record_failure_tokens(
                "req-bbbbbbbb",
                Some("claude-3-5-haiku-20241022".to_string()),
                usage(),
                costs(),
                "stream_status:stream_error:upstream closed mid-event".to_string(),
            )
            .await
            .unwrap();

        let record = store.fetch("req-bbbbbbbb").await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::StreamError);
        assert_eq!(record.input_tokens, 257);
        assert_eq!(record.total_cost, Decimal::new(1146, 6));
        assert!(record
            .failure_reason
            .as_deref()
            .unwrap()
            .starts_with("stream_status:"));
    }

    #[tokio::test]
    async fn completed_requests_reject_failure_tokens() {
        let store = MemoryStore::new();
        store.insert_request(pending_record("req-cccccccc")).await.unwrap();
        store
            .mark_completed("req-cccccccc", None, usage(), costs(), Utc::now(), 10)
            .await
            .unwrap();
        store
            .record_failure_tokens(
                "req-cccccccc",
                None,
                TokenUsage::default(),
                CostBreakdown::default(),
                "late failure".to_string(),
            )
            .await
            .unwrap();
        let record = store.fetch("req-cccccccc").await.unwrap().unwrap();
        assert_eq!(record.input_tokens, 257);
        assert_eq!(record.failure_reason, None);
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_rows() {
        let store = SqliteStore::open_in_memory(chrono_tz::Asia::Shanghai).unwrap();
        let mut old = pending_record("req-dddddddd");
        old.start_time = Utc::now() - ChronoDuration::days(40);
        store.insert_request(old).await.unwrap();
        store.insert_request(pending_record("req-eeeeeeee")).await.unwrap();

        let removed = store
            .cleanup_before(Utc::now() - ChronoDuration::days(30))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.fetch("req-dddddddd").await.unwrap().is_none());
        assert!(store.fetch("req-eeeeeeee").await.unwrap().is_some());
    }
}
