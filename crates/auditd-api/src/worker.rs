//! Expiration worker
//!
//! Periodically sweeps overdue pending approvals into `expired`, waking
//! their waiters, until process shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use auditd_persist::ApprovalStore;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Run the sweep loop; returns when `shutdown` flips
pub async fn run_expiration_worker(
    approvals: Arc<ApprovalStore>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; that sweep also catches requests
    // that expired while the daemon was down.
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match approvals.expire_sweep().await {
                    Ok(ids) if !ids.is_empty() => {
                        info!(count = ids.len(), "expired overdue approval requests");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "expiration sweep failed"),
                }
            }
            _ = shutdown.changed() => {
                info!("expiration worker stopping");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use auditd_core::NewApproval;
    use auditd_persist::DbPool;

    #[tokio::test]
    async fn worker_sweeps_and_stops_on_shutdown() {
        let db = DbPool::connect("sqlite::memory:").await.unwrap();
        let approvals = Arc::new(ApprovalStore::open(db).await.unwrap());

        let created = approvals
            .create(NewApproval {
                tool_name: "psql".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        // Backdate past the deadline so the first sweep catches it.
        approvals
            .db()
            .execute(
                "UPDATE approval_requests SET expires_at = ? WHERE approval_id = ?",
                vec![
                    auditd_persist::SqlValue::Text(
                        (chrono::Utc::now() - chrono::Duration::minutes(5)).to_rfc3339(),
                    ),
                    auditd_persist::SqlValue::Text(created.approval_id.clone()),
                ],
            )
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_expiration_worker(
            approvals.clone(),
            Duration::from_millis(10),
            rx,
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let record = approvals.get(&created.approval_id).await.unwrap().unwrap();
        assert_eq!(record.status, auditd_core::ApprovalStatus::Expired);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker must stop on shutdown")
            .unwrap();
    }
}
