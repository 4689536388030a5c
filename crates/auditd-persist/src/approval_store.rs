//! Durable approval requests with one-shot transitions and long-poll waiters
//!
//! Transitions are conditional UPDATEs guarded by `status = 'pending'`; a
//! zero-row update means the record was already resolved (or never existed)
//! and the caller gets an error naming the current status. On success the
//! per-id waiter list is removed under a short lock and each waiter gets the
//! freshly-fetched terminal record through its own one-shot slot, outside the
//! lock.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, info};

use auditd_core::{
    new_approval_id, ApprovalRequest, ApprovalStatus, NewApproval,
};

use crate::backend::{
    bind_values, format_ts, parse_opt_ts, parse_ts, query_err, rewrite_placeholders, DbPool,
    SqlValue, StorageError,
};

const APPROVAL_COLUMNS: &str = "approval_id, event_id, trace_id, status, action_class, \
     tool_name, agent_name, resource_type, resource_name, policy_name, approver_role, \
     requested_by, request_context, requested_at, expires_at, resolved_at, resolved_by, \
     resolution_reason, approval_valid_until, callback_url, callback_sent_at, \
     created_at, updated_at";

/// Filters for [`ApprovalStore::list`]
#[derive(Debug, Clone, Default)]
pub struct ApprovalFilter {
    pub status: Option<ApprovalStatus>,
    pub agent_name: Option<String>,
    pub trace_id: Option<String>,
    pub requested_by: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl ApprovalFilter {
    pub const DEFAULT_LIMIT: i64 = 100;
}

/// Decode one approval row; identical body for either engine's row type
macro_rules! approval_from_row {
    ($row:expr) => {{
        let row = $row;
        let status: String = row.try_get("status").map_err(query_err)?;
        let action: String = row.try_get("action_class").map_err(query_err)?;
        let context: Option<String> = row.try_get("request_context").map_err(query_err)?;
        let requested_at: String = row.try_get("requested_at").map_err(query_err)?;
        let expires_at: String = row.try_get("expires_at").map_err(query_err)?;
        let resolved_at: Option<String> = row.try_get("resolved_at").map_err(query_err)?;
        let valid_until: Option<String> = row.try_get("approval_valid_until").map_err(query_err)?;
        let callback_sent: Option<String> = row.try_get("callback_sent_at").map_err(query_err)?;
        let created_at: String = row.try_get("created_at").map_err(query_err)?;
        let updated_at: String = row.try_get("updated_at").map_err(query_err)?;

        Ok::<ApprovalRequest, StorageError>(ApprovalRequest {
            approval_id: row.try_get("approval_id").map_err(query_err)?,
            event_id: row.try_get("event_id").map_err(query_err)?,
            trace_id: row.try_get("trace_id").map_err(query_err)?,
            status: ApprovalStatus::parse(&status).ok_or_else(|| {
                StorageError::Serialization(format!("unknown approval status {:?}", status))
            })?,
            action_class: serde_json::from_value(serde_json::Value::String(action))
                .unwrap_or_default(),
            tool_name: row.try_get("tool_name").map_err(query_err)?,
            agent_name: row.try_get("agent_name").map_err(query_err)?,
            resource_type: row.try_get("resource_type").map_err(query_err)?,
            resource_name: row.try_get("resource_name").map_err(query_err)?,
            policy_name: row.try_get("policy_name").map_err(query_err)?,
            approver_role: row.try_get("approver_role").map_err(query_err)?,
            requested_by: row.try_get("requested_by").map_err(query_err)?,
            request_context: context
                .filter(|c| !c.is_empty())
                .map(|c| serde_json::from_str(&c))
                .transpose()?,
            requested_at: parse_ts(&requested_at)?,
            expires_at: parse_ts(&expires_at)?,
            resolved_at: parse_opt_ts(resolved_at)?,
            resolved_by: row.try_get("resolved_by").map_err(query_err)?,
            resolution_reason: row.try_get("resolution_reason").map_err(query_err)?,
            approval_valid_until: parse_opt_ts(valid_until)?,
            callback_url: row.try_get("callback_url").map_err(query_err)?,
            callback_sent_at: parse_opt_ts(callback_sent)?,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        })
    }};
}

type WaiterMap = Arc<Mutex<HashMap<String, Vec<Waiter>>>>;

struct Waiter {
    key: u64,
    tx: oneshot::Sender<ApprovalRequest>,
}

/// Removes its waiter slot when the waiting caller goes away
struct WaiterGuard {
    waiters: WaiterMap,
    approval_id: String,
    key: u64,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if let Ok(mut map) = self.waiters.lock() {
            if let Some(list) = map.get_mut(&self.approval_id) {
                // The slot may already be gone if a transition dispatched it;
                // duplicate removal is fine.
                list.retain(|w| w.key != self.key);
                if list.is_empty() {
                    map.remove(&self.approval_id);
                }
            }
        }
    }
}

/// Durable approval store
pub struct ApprovalStore {
    db: DbPool,
    waiters: WaiterMap,
    next_waiter_key: std::sync::atomic::AtomicU64,
}

impl ApprovalStore {
    pub async fn open(db: DbPool) -> Result<Self, StorageError> {
        init_schema(&db).await?;
        Ok(Self {
            db,
            waiters: Arc::new(Mutex::new(HashMap::new())),
            next_waiter_key: std::sync::atomic::AtomicU64::new(1),
        })
    }

    /// Open a new pending request
    pub async fn create(&self, req: NewApproval) -> Result<ApprovalRequest, StorageError> {
        let now = Utc::now();
        let expiry = req.expiry();
        let record = ApprovalRequest {
            approval_id: new_approval_id(),
            event_id: req.event_id,
            trace_id: req.trace_id,
            status: ApprovalStatus::Pending,
            action_class: req.action_class,
            tool_name: req.tool_name,
            agent_name: req.agent_name,
            resource_type: req.resource_type,
            resource_name: req.resource_name,
            policy_name: req.policy_name,
            approver_role: req.approver_role,
            requested_by: req.requested_by,
            request_context: req.request_context,
            requested_at: now,
            expires_at: now + expiry,
            resolved_at: None,
            resolved_by: None,
            resolution_reason: None,
            approval_valid_until: None,
            callback_url: req.callback_url,
            callback_sent_at: None,
            created_at: now,
            updated_at: now,
        };

        let context_json = record
            .request_context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.db
            .execute(
                &format!(
                    "INSERT INTO approval_requests ({APPROVAL_COLUMNS}) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
                ),
                vec![
                    SqlValue::Text(record.approval_id.clone()),
                    SqlValue::OptText(record.event_id.clone()),
                    SqlValue::Text(record.trace_id.clone()),
                    SqlValue::Text(record.status.as_str().to_string()),
                    SqlValue::Text(record.action_class.as_str().to_string()),
                    SqlValue::Text(record.tool_name.clone()),
                    SqlValue::Text(record.agent_name.clone()),
                    SqlValue::Text(record.resource_type.clone()),
                    SqlValue::Text(record.resource_name.clone()),
                    SqlValue::Text(record.policy_name.clone()),
                    SqlValue::Text(record.approver_role.clone()),
                    SqlValue::Text(record.requested_by.clone()),
                    SqlValue::OptText(context_json),
                    SqlValue::Text(format_ts(record.requested_at)),
                    SqlValue::Text(format_ts(record.expires_at)),
                    SqlValue::OptText(None),
                    SqlValue::OptText(None),
                    SqlValue::OptText(None),
                    SqlValue::OptText(None),
                    SqlValue::OptText(record.callback_url.clone()),
                    SqlValue::OptText(None),
                    SqlValue::Text(format_ts(record.created_at)),
                    SqlValue::Text(format_ts(record.updated_at)),
                ],
            )
            .await?;

        info!(approval_id = %record.approval_id, tool = %record.tool_name, "approval request created");
        Ok(record)
    }

    pub async fn get(&self, approval_id: &str) -> Result<Option<ApprovalRequest>, StorageError> {
        let sql = format!(
            "SELECT {APPROVAL_COLUMNS} FROM approval_requests WHERE approval_id = ?"
        );
        let mut rows = self
            .fetch_approvals(&sql, vec![SqlValue::Text(approval_id.to_string())])
            .await?;
        Ok(rows.pop())
    }

    /// Newest request created for a (trace, tool) pair
    pub async fn get_by_trace_and_tool(
        &self,
        trace_id: &str,
        tool_name: &str,
    ) -> Result<Option<ApprovalRequest>, StorageError> {
        let sql = format!(
            "SELECT {APPROVAL_COLUMNS} FROM approval_requests \
             WHERE trace_id = ? AND tool_name = ? ORDER BY created_at DESC LIMIT 1"
        );
        let mut rows = self
            .fetch_approvals(
                &sql,
                vec![
                    SqlValue::Text(trace_id.to_string()),
                    SqlValue::Text(tool_name.to_string()),
                ],
            )
            .await?;
        Ok(rows.pop())
    }

    pub async fn list(&self, filter: &ApprovalFilter) -> Result<Vec<ApprovalRequest>, StorageError> {
        let mut sql = format!("SELECT {APPROVAL_COLUMNS} FROM approval_requests");
        let mut clauses: Vec<&str> = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();

        if let Some(status) = filter.status {
            clauses.push("status = ?");
            params.push(SqlValue::Text(status.as_str().to_string()));
        }
        if let Some(agent) = &filter.agent_name {
            clauses.push("agent_name = ?");
            params.push(SqlValue::Text(agent.clone()));
        }
        if let Some(trace) = &filter.trace_id {
            clauses.push("trace_id = ?");
            params.push(SqlValue::Text(trace.clone()));
        }
        if let Some(by) = &filter.requested_by {
            clauses.push("requested_by = ?");
            params.push(SqlValue::Text(by.clone()));
        }
        if let Some(since) = filter.since {
            clauses.push("created_at >= ?");
            params.push(SqlValue::Text(format_ts(since)));
        }

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ?");
        params.push(SqlValue::Int(filter.limit.unwrap_or(ApprovalFilter::DEFAULT_LIMIT)));

        self.fetch_approvals(&sql, params).await
    }

    pub async fn pending_count(&self) -> Result<i64, StorageError> {
        self.db
            .fetch_count(
                "SELECT COUNT(*) FROM approval_requests WHERE status = 'pending'",
                Vec::new(),
            )
            .await
    }

    /// Approve a pending request; `valid_for` > 0 opens a grant window
    pub async fn approve(
        &self,
        approval_id: &str,
        approved_by: &str,
        reason: Option<String>,
        valid_for: Option<Duration>,
    ) -> Result<ApprovalRequest, StorageError> {
        let now = Utc::now();
        let valid_until = valid_for
            .filter(|d| *d > Duration::zero())
            .map(|d| format_ts(now + d));
        self.resolve(
            approval_id,
            ApprovalStatus::Approved,
            approved_by,
            reason,
            valid_until,
        )
        .await
    }

    pub async fn deny(
        &self,
        approval_id: &str,
        denied_by: &str,
        reason: Option<String>,
    ) -> Result<ApprovalRequest, StorageError> {
        self.resolve(approval_id, ApprovalStatus::Denied, denied_by, reason, None)
            .await
    }

    pub async fn cancel(
        &self,
        approval_id: &str,
        cancelled_by: &str,
        reason: Option<String>,
    ) -> Result<ApprovalRequest, StorageError> {
        self.resolve(approval_id, ApprovalStatus::Cancelled, cancelled_by, reason, None)
            .await
    }

    /// One-shot transition out of pending.
    ///
    /// The UPDATE is conditional on `status = 'pending'`; when no row
    /// matches, the error names the current status (or reports not-found).
    async fn resolve(
        &self,
        approval_id: &str,
        status: ApprovalStatus,
        resolved_by: &str,
        reason: Option<String>,
        valid_until: Option<String>,
    ) -> Result<ApprovalRequest, StorageError> {
        let now = format_ts(Utc::now());
        let affected = self
            .db
            .execute(
                "UPDATE approval_requests SET status = ?, resolved_at = ?, resolved_by = ?, \
                 resolution_reason = ?, approval_valid_until = ?, updated_at = ? \
                 WHERE approval_id = ? AND status = 'pending'",
                vec![
                    SqlValue::Text(status.as_str().to_string()),
                    SqlValue::Text(now.clone()),
                    SqlValue::Text(resolved_by.to_string()),
                    SqlValue::OptText(reason),
                    SqlValue::OptText(valid_until),
                    SqlValue::Text(now),
                    SqlValue::Text(approval_id.to_string()),
                ],
            )
            .await?;

        if affected == 0 {
            return match self.get(approval_id).await? {
                Some(current) => Err(StorageError::InvalidTransition {
                    current: current.status.as_str().to_string(),
                }),
                None => Err(StorageError::NotFound(format!("approval {}", approval_id))),
            };
        }

        let record = self
            .get(approval_id)
            .await?
            .ok_or_else(|| StorageError::Internal("resolved approval vanished".to_string()))?;
        info!(
            approval_id = %approval_id,
            status = status.as_str(),
            by = resolved_by,
            "approval resolved"
        );
        self.notify_waiters(approval_id, &record);
        Ok(record)
    }

    /// Expire every pending request whose deadline has passed.
    ///
    /// One statement, atomic on both engines; returns the swept IDs after
    /// waking their waiters.
    pub async fn expire_sweep(&self) -> Result<Vec<String>, StorageError> {
        let now = Utc::now();
        let now_s = format_ts(now);
        let ids = self
            .db
            .fetch_strings(
                "UPDATE approval_requests SET status = 'expired', resolved_at = ?, \
                 resolved_by = 'system', resolution_reason = 'expired before resolution', \
                 updated_at = ? \
                 WHERE status = 'pending' AND expires_at < ? \
                 RETURNING approval_id",
                vec![
                    SqlValue::Text(now_s.clone()),
                    SqlValue::Text(now_s.clone()),
                    SqlValue::Text(now_s),
                ],
            )
            .await?;

        for id in &ids {
            if let Some(record) = self.get(id).await? {
                self.notify_waiters(id, &record);
            }
        }
        Ok(ids)
    }

    /// Block until the request leaves `pending`.
    ///
    /// Returns immediately when it already has. The caller bounds the wait
    /// (the HTTP layer wraps this in a timeout); dropping the future
    /// deregisters the waiter.
    pub async fn wait_for_resolution(
        &self,
        approval_id: &str,
    ) -> Result<ApprovalRequest, StorageError> {
        let current = self
            .get(approval_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("approval {}", approval_id)))?;
        if current.status.is_terminal() {
            return Ok(current);
        }

        let (tx, rx) = oneshot::channel();
        let key = self
            .next_waiter_key
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let _guard = {
            let mut map = self
                .waiters
                .lock()
                .map_err(|_| StorageError::Internal("waiter map poisoned".to_string()))?;
            map.entry(approval_id.to_string())
                .or_default()
                .push(Waiter { key, tx });
            WaiterGuard {
                waiters: self.waiters.clone(),
                approval_id: approval_id.to_string(),
                key,
            }
        };

        // The record may have resolved between the first read and waiter
        // registration; re-check so the wakeup cannot be lost.
        if let Some(record) = self.get(approval_id).await? {
            if record.status.is_terminal() {
                return Ok(record);
            }
        }

        match rx.await {
            Ok(record) => Ok(record),
            // Sender dropped without a send; fall back to the stored state.
            Err(_) => self
                .get(approval_id)
                .await?
                .ok_or_else(|| StorageError::NotFound(format!("approval {}", approval_id))),
        }
    }

    /// Record that the resolution callback went out and clear the stored
    /// URL so it cannot fire twice; never changes status.
    pub async fn mark_callback_sent(&self, approval_id: &str) -> Result<(), StorageError> {
        let affected = self
            .db
            .execute(
                "UPDATE approval_requests SET callback_sent_at = ?, callback_url = NULL WHERE approval_id = ?",
                vec![
                    SqlValue::Text(format_ts(Utc::now())),
                    SqlValue::Text(approval_id.to_string()),
                ],
            )
            .await?;
        if affected == 0 {
            return Err(StorageError::NotFound(format!("approval {}", approval_id)));
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.db.close().await;
    }

    /// Snapshot-then-dispatch: remove the waiter list under the lock, send
    /// outside it. One-shot slots make every send non-blocking; waiters that
    /// went away are dropped silently.
    fn notify_waiters(&self, approval_id: &str, record: &ApprovalRequest) {
        let list = match self.waiters.lock() {
            Ok(mut map) => map.remove(approval_id),
            Err(_) => None,
        };
        if let Some(list) = list {
            let count = list.len();
            for waiter in list {
                let _ = waiter.tx.send(record.clone());
            }
            debug!(approval_id = %approval_id, waiters = count, "waiters notified");
        }
    }

    async fn fetch_approvals(
        &self,
        sql: &str,
        params: Vec<SqlValue>,
    ) -> Result<Vec<ApprovalRequest>, StorageError> {
        use sqlx::Row;
        match &self.db {
            DbPool::Sqlite(pool) => {
                let rows = bind_values!(sqlx::query(sql), params)
                    .fetch_all(pool)
                    .await
                    .map_err(query_err)?;
                rows.iter().map(|row| approval_from_row!(row)).collect()
            }
            DbPool::Postgres(pool) => {
                let sql = rewrite_placeholders(sql);
                let rows = bind_values!(sqlx::query(&sql), params)
                    .fetch_all(pool)
                    .await
                    .map_err(query_err)?;
                rows.iter().map(|row| approval_from_row!(row)).collect()
            }
        }
    }

    #[doc(hidden)]
    pub fn db(&self) -> &DbPool {
        &self.db
    }
}

/// Create the approval table and its indices for the connected engine
async fn init_schema(db: &DbPool) -> Result<(), StorageError> {
    let id_column = if db.is_postgres() {
        "id BIGSERIAL PRIMARY KEY"
    } else {
        "id INTEGER PRIMARY KEY AUTOINCREMENT"
    };

    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS approval_requests (\
         {id_column}, \
         approval_id TEXT NOT NULL UNIQUE, \
         event_id TEXT, \
         trace_id TEXT NOT NULL DEFAULT '', \
         status TEXT NOT NULL DEFAULT 'pending', \
         action_class TEXT NOT NULL DEFAULT 'unknown', \
         tool_name TEXT NOT NULL DEFAULT '', \
         agent_name TEXT NOT NULL DEFAULT '', \
         resource_type TEXT NOT NULL DEFAULT '', \
         resource_name TEXT NOT NULL DEFAULT '', \
         policy_name TEXT NOT NULL DEFAULT '', \
         approver_role TEXT NOT NULL DEFAULT '', \
         requested_by TEXT NOT NULL DEFAULT '', \
         request_context TEXT, \
         requested_at TEXT NOT NULL, \
         expires_at TEXT NOT NULL, \
         resolved_at TEXT, \
         resolved_by TEXT, \
         resolution_reason TEXT, \
         approval_valid_until TEXT, \
         callback_url TEXT, \
         callback_sent_at TEXT, \
         created_at TEXT NOT NULL, \
         updated_at TEXT NOT NULL)"
    );
    db.execute(&ddl, Vec::new()).await?;

    for (name, column) in [
        ("idx_approval_status", "status"),
        ("idx_approval_trace_id", "trace_id"),
        ("idx_approval_event_id", "event_id"),
        ("idx_approval_requested_by", "requested_by"),
        ("idx_approval_expires_at", "expires_at"),
        ("idx_approval_agent_name", "agent_name"),
        ("idx_approval_tool_name", "tool_name"),
    ] {
        db.execute(
            &format!("CREATE INDEX IF NOT EXISTS {name} ON approval_requests ({column})"),
            Vec::new(),
        )
        .await?;
    }
    Ok(())
}
