//! Hash-chained audit event storage
//!
//! Appends are serialized by a single writer mutex held across
//! read-last-hash → link → hash → INSERT, so no two events can claim the
//! same `prev_hash`. Readers never take that lock.
//!
//! Rows carry both indexed columns (for filtering) and a `raw_json` blob
//! holding the event exactly as it was hashed. Queries materialize from
//! `raw_json` and overlay the mutable outcome columns; integrity
//! verification reads `raw_json` alone, in insertion order, which is why
//! `record_outcome` can patch outcomes without breaking the chain, at the
//! documented cost that outcomes are not tamper-evident.

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use auditd_core::{
    compute_event_hash, new_event_id, verify_chain_status, AuditEvent, ChainStatus, OutcomeInfo,
    GENESIS_HASH,
};

use crate::backend::{
    bind_values, format_ts, query_err, rewrite_placeholders, DbPool, SqlValue, StorageError,
};
use crate::stream::StreamHub;

const INSERT_EVENT_SQL: &str = "INSERT INTO audit_events (\
     event_id, timestamp, event_type, trace_id, parent_id, action_class, \
     prev_hash, event_hash, session_id, user_id, user_query, \
     tool_name, tool_json, approval_status, approval_json, \
     decision_agent, decision_category, decision_confidence, decision_json, \
     outcome_status, outcome_error, outcome_duration_ms, raw_json, created_at) \
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

const SELECT_EVENT_COLUMNS: &str =
    "SELECT raw_json, outcome_status, outcome_error, outcome_duration_ms FROM audit_events";

/// Filters for [`EventStore::query`]; all optional, ANDed together
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub event_id: Option<String>,
    pub session_id: Option<String>,
    pub trace_id: Option<String>,
    pub event_type: Option<String>,
    pub agent: Option<String>,
    pub action_class: Option<String>,
    pub tool_name: Option<String>,
    pub approval_status: Option<String>,
    pub min_confidence: Option<f64>,
    pub max_confidence: Option<f64>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl EventQuery {
    pub const DEFAULT_LIMIT: i64 = 100;
}

/// Parse a stored row back into an event, overlaying patched outcome columns
fn materialize(
    raw: &str,
    outcome_status: Option<String>,
    outcome_error: Option<String>,
    outcome_duration_ms: Option<i64>,
) -> Result<AuditEvent, StorageError> {
    let mut event: AuditEvent = serde_json::from_str(raw)?;
    if let Some(status) = outcome_status.filter(|s| !s.is_empty()) {
        event.outcome = Some(OutcomeInfo {
            status,
            error: outcome_error,
            duration_ms: outcome_duration_ms,
        });
    }
    Ok(event)
}

/// Decode one event row; identical body for either engine's row type
macro_rules! event_from_row {
    ($row:expr) => {{
        let raw: String = $row.try_get("raw_json").map_err(query_err)?;
        let status: Option<String> = $row.try_get("outcome_status").map_err(query_err)?;
        let error: Option<String> = $row.try_get("outcome_error").map_err(query_err)?;
        let duration: Option<i64> = $row.try_get("outcome_duration_ms").map_err(query_err)?;
        materialize(&raw, status, error, duration)
    }};
}

/// Durable, hash-chained event store
pub struct EventStore {
    db: DbPool,
    hub: StreamHub,
    /// Chain head; updated only after a successful insert
    last_hash: Mutex<String>,
}

impl EventStore {
    /// Create the schema if needed and prime the chain head from the most
    /// recent row (genesis when empty).
    pub async fn open(db: DbPool, hub: StreamHub) -> Result<Self, StorageError> {
        init_schema(&db).await?;

        let last = db
            .fetch_opt_string(
                "SELECT raw_json FROM audit_events ORDER BY id DESC LIMIT 1",
                Vec::new(),
            )
            .await?;
        let last_hash = match last {
            Some(raw) => {
                let event: AuditEvent = serde_json::from_str(&raw)?;
                if event.event_hash.is_empty() {
                    compute_event_hash(&event)
                } else {
                    event.event_hash
                }
            }
            None => GENESIS_HASH.to_string(),
        };

        Ok(Self {
            db,
            hub,
            last_hash: Mutex::new(last_hash),
        })
    }

    pub fn hub(&self) -> &StreamHub {
        &self.hub
    }

    /// Append one event to the chain.
    ///
    /// Assigns `event_id` and `timestamp` when unset. The writer mutex is
    /// held until the row is inserted; on failure the chain head is left
    /// untouched.
    pub async fn record(&self, mut event: AuditEvent) -> Result<AuditEvent, StorageError> {
        if event.event_id.is_empty() {
            event.event_id = new_event_id(event.event_type);
        }
        if event.timestamp_is_zero() {
            event.timestamp = Utc::now();
        }

        let mut last_hash = self.last_hash.lock().await;

        event.prev_hash = last_hash.clone();
        event.event_hash = compute_event_hash(&event);
        let raw = serde_json::to_string(&event)?;

        let params = insert_params(&event, &raw)?;
        self.db.execute(INSERT_EVENT_SQL, params).await?;

        *last_hash = event.event_hash.clone();
        // Publish while still serialized so subscribers see chain order;
        // try_send never blocks the append path.
        self.hub.publish(&raw);
        drop(last_hash);

        debug!(event_id = %event.event_id, event_type = event.event_type.as_str(), "event recorded");
        Ok(event)
    }

    /// Patch the outcome of an existing event.
    ///
    /// Touches the mutable outcome columns only; `raw_json` and the stored
    /// hash are left alone, so the chain still verifies but the patched
    /// outcome is outside tamper evidence.
    pub async fn record_outcome(
        &self,
        event_id: &str,
        outcome: &OutcomeInfo,
    ) -> Result<(), StorageError> {
        let affected = self
            .db
            .execute(
                "UPDATE audit_events SET outcome_status = ?, outcome_error = ?, outcome_duration_ms = ? WHERE event_id = ?",
                vec![
                    SqlValue::Text(outcome.status.clone()),
                    SqlValue::OptText(outcome.error.clone()),
                    SqlValue::OptInt(outcome.duration_ms),
                    SqlValue::Text(event_id.to_string()),
                ],
            )
            .await?;
        if affected == 0 {
            return Err(StorageError::NotFound(format!("event {}", event_id)));
        }
        Ok(())
    }

    pub async fn get(&self, event_id: &str) -> Result<Option<AuditEvent>, StorageError> {
        let sql = format!("{} WHERE event_id = ?", SELECT_EVENT_COLUMNS);
        let events = self
            .fetch_events(&sql, vec![SqlValue::Text(event_id.to_string())])
            .await?;
        Ok(events.into_iter().next())
    }

    /// Filtered query.
    ///
    /// Trace reads come back in ascending timestamp order so a trace reads
    /// chronologically; everything else is newest-first. Never returns an
    /// error for an empty result.
    pub async fn query(&self, query: &EventQuery) -> Result<Vec<AuditEvent>, StorageError> {
        let mut sql = String::from(SELECT_EVENT_COLUMNS);
        let mut clauses: Vec<&str> = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();

        macro_rules! filter {
            ($field:expr, $clause:expr, $value:expr) => {
                if let Some(v) = $field {
                    clauses.push($clause);
                    params.push($value(v));
                }
            };
        }

        filter!(&query.event_id, "event_id = ?", |v: &String| SqlValue::Text(v.clone()));
        filter!(&query.session_id, "session_id = ?", |v: &String| SqlValue::Text(v.clone()));
        filter!(&query.trace_id, "trace_id = ?", |v: &String| SqlValue::Text(v.clone()));
        filter!(&query.event_type, "event_type = ?", |v: &String| SqlValue::Text(v.clone()));
        filter!(&query.agent, "decision_agent = ?", |v: &String| SqlValue::Text(v.clone()));
        filter!(&query.action_class, "action_class = ?", |v: &String| SqlValue::Text(v.clone()));
        filter!(&query.tool_name, "tool_name = ?", |v: &String| SqlValue::Text(v.clone()));
        filter!(&query.approval_status, "approval_status = ?", |v: &String| SqlValue::Text(v.clone()));
        filter!(&query.min_confidence, "decision_confidence >= ?", |v: &f64| SqlValue::Float(*v));
        filter!(&query.max_confidence, "decision_confidence <= ?", |v: &f64| SqlValue::Float(*v));
        filter!(&query.since, "timestamp >= ?", |v: &DateTime<Utc>| SqlValue::Text(format_ts(*v)));

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        if query.trace_id.is_some() {
            sql.push_str(" ORDER BY timestamp ASC");
        } else {
            sql.push_str(" ORDER BY timestamp DESC");
        }

        sql.push_str(" LIMIT ?");
        params.push(SqlValue::Int(query.limit.unwrap_or(EventQuery::DEFAULT_LIMIT)));

        self.fetch_events(&sql, params).await
    }

    /// Walk every row in insertion order and verify the chain.
    ///
    /// Insertion order, not timestamp order: timestamps may legitimately
    /// arrive out of order (a gateway event carries its request start time
    /// but is persisted after its children).
    pub async fn verify_integrity(&self) -> Result<ChainStatus, StorageError> {
        let raws = self
            .db
            .fetch_strings("SELECT raw_json FROM audit_events ORDER BY id ASC", Vec::new())
            .await?;
        let events: Vec<AuditEvent> = raws
            .iter()
            .map(|raw| serde_json::from_str(raw).map_err(StorageError::from))
            .collect::<Result<_, _>>()?;
        let status = verify_chain_status(&events);
        if !status.valid {
            warn!(broken_at = status.broken_at, "audit chain verification failed");
        }
        Ok(status)
    }

    /// Current chain head
    pub async fn get_last_hash(&self) -> String {
        self.last_hash.lock().await.clone()
    }

    pub async fn count(&self) -> Result<i64, StorageError> {
        self.db
            .fetch_count("SELECT COUNT(*) FROM audit_events", Vec::new())
            .await
    }

    /// Timestamp of the most recently inserted event
    pub async fn last_event_at(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        let ts = self
            .db
            .fetch_opt_string(
                "SELECT timestamp FROM audit_events ORDER BY id DESC LIMIT 1",
                Vec::new(),
            )
            .await?;
        crate::backend::parse_opt_ts(ts)
    }

    pub async fn close(&self) {
        self.db.close().await;
    }

    async fn fetch_events(
        &self,
        sql: &str,
        params: Vec<SqlValue>,
    ) -> Result<Vec<AuditEvent>, StorageError> {
        use sqlx::Row;
        match &self.db {
            DbPool::Sqlite(pool) => {
                let rows = bind_values!(sqlx::query(sql), params)
                    .fetch_all(pool)
                    .await
                    .map_err(query_err)?;
                rows.iter().map(|row| event_from_row!(row)).collect()
            }
            DbPool::Postgres(pool) => {
                let sql = rewrite_placeholders(sql);
                let rows = bind_values!(sqlx::query(&sql), params)
                    .fetch_all(pool)
                    .await
                    .map_err(query_err)?;
                rows.iter().map(|row| event_from_row!(row)).collect()
            }
        }
    }

    /// Direct access for tests and tooling
    #[doc(hidden)]
    pub fn db(&self) -> &DbPool {
        &self.db
    }
}

fn insert_params(event: &AuditEvent, raw: &str) -> Result<Vec<SqlValue>, StorageError> {
    let session_id = event.session.as_ref().map(|s| s.id.clone()).unwrap_or_default();
    let user_id = event.session.as_ref().map(|s| s.user_id.clone()).unwrap_or_default();
    let tool_json = event.tool.as_ref().map(serde_json::to_string).transpose()?;
    let approval_json = event.approval.as_ref().map(serde_json::to_string).transpose()?;
    let decision_json = event.decision.as_ref().map(serde_json::to_string).transpose()?;

    Ok(vec![
        SqlValue::Text(event.event_id.clone()),
        SqlValue::Text(format_ts(event.timestamp)),
        SqlValue::Text(event.event_type.as_str().to_string()),
        SqlValue::Text(event.trace_id.clone()),
        SqlValue::Text(event.parent_id.clone()),
        SqlValue::Text(event.action_class.as_str().to_string()),
        SqlValue::Text(event.prev_hash.clone()),
        SqlValue::Text(event.event_hash.clone()),
        SqlValue::Text(session_id),
        SqlValue::Text(user_id),
        SqlValue::OptText(event.user_query().map(|s| s.to_string())),
        SqlValue::OptText(event.tool_name().map(|s| s.to_string())),
        SqlValue::OptText(tool_json),
        SqlValue::OptText(
            event
                .approval
                .as_ref()
                .map(|a| a.status.clone())
                .filter(|s| !s.is_empty()),
        ),
        SqlValue::OptText(approval_json),
        SqlValue::OptText(
            event
                .decision
                .as_ref()
                .map(|d| d.agent.clone())
                .filter(|s| !s.is_empty()),
        ),
        SqlValue::OptText(event.decision.as_ref().and_then(|d| d.category.clone())),
        SqlValue::OptFloat(event.decision.as_ref().and_then(|d| d.confidence)),
        SqlValue::OptText(decision_json),
        SqlValue::OptText(
            event
                .outcome
                .as_ref()
                .map(|o| o.status.clone())
                .filter(|s| !s.is_empty()),
        ),
        SqlValue::OptText(event.outcome.as_ref().and_then(|o| o.error.clone())),
        SqlValue::OptInt(event.outcome.as_ref().and_then(|o| o.duration_ms)),
        SqlValue::Text(raw.to_string()),
        SqlValue::Text(format_ts(Utc::now())),
    ])
}

/// Create the audit table and its indices for the connected engine
async fn init_schema(db: &DbPool) -> Result<(), StorageError> {
    let id_column = if db.is_postgres() {
        "id BIGSERIAL PRIMARY KEY"
    } else {
        "id INTEGER PRIMARY KEY AUTOINCREMENT"
    };
    let float_type = if db.is_postgres() { "DOUBLE PRECISION" } else { "REAL" };
    let int_type = if db.is_postgres() { "BIGINT" } else { "INTEGER" };

    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS audit_events (\
         {id_column}, \
         event_id TEXT NOT NULL UNIQUE, \
         timestamp TEXT NOT NULL, \
         event_type TEXT NOT NULL, \
         trace_id TEXT NOT NULL DEFAULT '', \
         parent_id TEXT NOT NULL DEFAULT '', \
         action_class TEXT NOT NULL DEFAULT 'unknown', \
         prev_hash TEXT NOT NULL DEFAULT '', \
         event_hash TEXT NOT NULL DEFAULT '', \
         session_id TEXT NOT NULL DEFAULT '', \
         user_id TEXT NOT NULL DEFAULT '', \
         user_query TEXT, \
         tool_name TEXT, \
         tool_json TEXT, \
         approval_status TEXT, \
         approval_json TEXT, \
         decision_agent TEXT, \
         decision_category TEXT, \
         decision_confidence {float_type}, \
         decision_json TEXT, \
         outcome_status TEXT, \
         outcome_error TEXT, \
         outcome_duration_ms {int_type}, \
         raw_json TEXT NOT NULL, \
         created_at TEXT NOT NULL)"
    );
    db.execute(&ddl, Vec::new()).await?;

    for (name, column) in [
        ("idx_audit_timestamp", "timestamp"),
        ("idx_audit_session_id", "session_id"),
        ("idx_audit_event_type", "event_type"),
        ("idx_audit_decision_agent", "decision_agent"),
        ("idx_audit_trace_id", "trace_id"),
        ("idx_audit_parent_id", "parent_id"),
        ("idx_audit_action_class", "action_class"),
        ("idx_audit_tool_name", "tool_name"),
        ("idx_audit_approval_status", "approval_status"),
    ] {
        db.execute(
            &format!("CREATE INDEX IF NOT EXISTS {name} ON audit_events ({column})"),
            Vec::new(),
        )
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use auditd_core::{ActionClass, EventType, SessionInfo};
    use std::sync::Arc;

    async fn store() -> EventStore {
        let db = DbPool::connect("sqlite::memory:").await.unwrap();
        EventStore::open(db, StreamHub::new()).await.unwrap()
    }

    fn event(event_type: EventType, trace: &str) -> AuditEvent {
        let mut e = AuditEvent::new(event_type);
        e.trace_id = trace.to_string();
        e.action_class = ActionClass::Read;
        e
    }

    #[tokio::test]
    async fn record_assigns_id_timestamp_and_links() {
        let store = store().await;

        let first = store.record(event(EventType::GatewayRequest, "t1")).await.unwrap();
        assert!(first.event_id.starts_with("gw_"));
        assert!(!first.timestamp_is_zero());
        assert_eq!(first.prev_hash, GENESIS_HASH);
        assert!(!first.event_hash.is_empty());

        let second = store.record(event(EventType::ToolExecution, "t1")).await.unwrap();
        assert_eq!(second.prev_hash, first.event_hash);
        assert_eq!(store.get_last_hash().await, second.event_hash);
    }

    #[tokio::test]
    async fn chain_stays_valid_over_many_appends() {
        let store = store().await;
        for i in 0..20 {
            store
                .record(event(EventType::ToolExecution, &format!("t{}", i)))
                .await
                .unwrap();
        }
        let status = store.verify_integrity().await.unwrap();
        assert!(status.valid);
        assert_eq!(status.total, 20);
        assert_eq!(status.hashed_count, 20);
    }

    #[tokio::test]
    async fn concurrent_appends_produce_a_valid_chain() {
        let store = Arc::new(store().await);

        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .record(event(EventType::ToolExecution, &format!("t{}", i)))
                        .await
                        .unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let status = store.verify_integrity().await.unwrap();
        assert!(status.valid, "chain broken: {:?}", status.error);
        assert_eq!(status.total, 50);
    }

    #[tokio::test]
    async fn tampering_is_detected_at_the_right_index() {
        let store = store().await;
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(
                store
                    .record(event(EventType::ToolExecution, &format!("t{}", i)))
                    .await
                    .unwrap()
                    .event_id,
            );
        }

        // Bypass the store and flip a hashed field inside the persisted blob.
        let tampered = store.get(&ids[2]).await.unwrap().unwrap();
        let mut raw: serde_json::Value =
            serde_json::to_value(&tampered).unwrap();
        raw["trace_id"] = serde_json::Value::String("forged".to_string());
        store
            .db()
            .execute(
                "UPDATE audit_events SET raw_json = ? WHERE event_id = ?",
                vec![
                    SqlValue::Text(raw.to_string()),
                    SqlValue::Text(ids[2].clone()),
                ],
            )
            .await
            .unwrap();

        let status = store.verify_integrity().await.unwrap();
        assert!(!status.valid);
        assert_eq!(status.broken_at, 2);
    }

    #[tokio::test]
    async fn outcome_patch_shows_in_queries_but_keeps_chain_valid() {
        let store = store().await;
        let recorded = store.record(event(EventType::ToolExecution, "t1")).await.unwrap();

        store
            .record_outcome(
                &recorded.event_id,
                &OutcomeInfo {
                    status: "error".to_string(),
                    error: Some("connection refused".to_string()),
                    duration_ms: Some(42),
                },
            )
            .await
            .unwrap();

        let fetched = store.get(&recorded.event_id).await.unwrap().unwrap();
        let outcome = fetched.outcome.expect("outcome should overlay");
        assert_eq!(outcome.status, "error");
        assert_eq!(outcome.duration_ms, Some(42));

        let status = store.verify_integrity().await.unwrap();
        assert!(status.valid, "outcome patching must not break the chain");
    }

    #[tokio::test]
    async fn record_outcome_on_unknown_event_is_not_found() {
        let store = store().await;
        let err = store
            .record_outcome("evt_missing", &OutcomeInfo::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn trace_queries_are_chronological_others_newest_first() {
        let store = store().await;

        let mut early = event(EventType::GatewayRequest, "trace-a");
        early.timestamp = Utc::now() - chrono::Duration::seconds(30);
        store.record(early).await.unwrap();

        let mut late = event(EventType::ToolExecution, "trace-a");
        late.timestamp = Utc::now();
        store.record(late).await.unwrap();

        store.record(event(EventType::ToolExecution, "trace-b")).await.unwrap();

        let trace = store
            .query(&EventQuery {
                trace_id: Some("trace-a".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(trace.len(), 2);
        assert!(trace[0].timestamp <= trace[1].timestamp);

        let all = store.query(&EventQuery::default()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].timestamp >= all[1].timestamp);
    }

    #[tokio::test]
    async fn filters_narrow_results() {
        let store = store().await;

        let mut tooled = event(EventType::ToolExecution, "t1");
        tooled.tool = Some(auditd_core::ToolCall {
            name: "kubectl".to_string(),
            arguments: None,
            target: None,
        });
        tooled.session = Some(SessionInfo {
            id: "sess-1".to_string(),
            user_id: "u1".to_string(),
            started_at: None,
            delegation_count: 0,
        });
        store.record(tooled).await.unwrap();
        store.record(event(EventType::GatewayRequest, "t2")).await.unwrap();

        let by_tool = store
            .query(&EventQuery {
                tool_name: Some("kubectl".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_tool.len(), 1);

        let by_session = store
            .query(&EventQuery {
                session_id: Some("sess-1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_session.len(), 1);

        let none = store
            .query(&EventQuery {
                event_type: Some("policy_decision".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(none.is_empty(), "no match returns an empty list, not an error");
    }

    #[tokio::test]
    async fn restart_primes_the_chain_head() {
        let db = DbPool::connect("sqlite::memory:").await.unwrap();
        let store = EventStore::open(db.clone(), StreamHub::new()).await.unwrap();
        let last = store.record(event(EventType::ToolExecution, "t1")).await.unwrap();

        // Same pool, fresh store: simulates a process restart.
        let reopened = EventStore::open(db, StreamHub::new()).await.unwrap();
        assert_eq!(reopened.get_last_hash().await, last.event_hash);

        let next = reopened.record(event(EventType::ToolExecution, "t2")).await.unwrap();
        assert_eq!(next.prev_hash, last.event_hash);
        assert!(reopened.verify_integrity().await.unwrap().valid);
    }

    #[tokio::test]
    async fn appends_are_published_to_the_hub() {
        let db = DbPool::connect("sqlite::memory:").await.unwrap();
        let hub = StreamHub::new();
        let store = EventStore::open(db, hub.clone()).await.unwrap();

        let mut sub = hub.subscribe();
        let recorded = store.record(event(EventType::ToolExecution, "t1")).await.unwrap();

        let line = sub.rx.recv().await.unwrap();
        let published: AuditEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(published.event_id, recorded.event_id);
        assert_eq!(published.event_hash, recorded.event_hash);
    }
}
