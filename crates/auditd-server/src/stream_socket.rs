//! Unix-socket push stream
//!
//! Local subscribers connect to the socket and read newline-delimited event
//! JSON in insertion order. Each connection gets its own hub subscription
//! and writer loop; a write that fails or stalls past the deadline drops
//! only that subscriber. Disconnected clients recover missed events through
//! `GET /v1/events?since=...`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use auditd_persist::{StreamHub, StreamSubscription};

/// Per-write deadline; slower subscribers are dropped
const WRITE_DEADLINE: Duration = Duration::from_secs(5);

/// Accept loop for the push-stream socket; returns on shutdown
pub async fn run_stream_listener(
    path: PathBuf,
    hub: StreamHub,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    // A stale socket file from an unclean exit would block the bind.
    remove_stale_socket(&path);
    let listener = UnixListener::bind(&path)
        .with_context(|| format!("bind stream socket {}", path.display()))?;
    info!(socket = %path.display(), "event push stream listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let subscription = hub.subscribe();
                        debug!(subscriber = subscription.id, "stream client connected");
                        tokio::spawn(write_loop(stream, subscription, hub.clone()));
                    }
                    Err(e) => warn!(error = %e, "stream accept failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    remove_stale_socket(&path);
    info!("event push stream stopped");
    Ok(())
}

fn remove_stale_socket(path: &Path) {
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
}

/// Drain one subscriber's queue onto its socket, one JSON line per event
async fn write_loop(mut stream: UnixStream, mut subscription: StreamSubscription, hub: StreamHub) {
    while let Some(line) = subscription.rx.recv().await {
        let mut frame = line.into_bytes();
        frame.push(b'\n');
        match tokio::time::timeout(WRITE_DEADLINE, stream.write_all(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(subscriber = subscription.id, error = %e, "stream write failed");
                break;
            }
            Err(_) => {
                warn!(subscriber = subscription.id, "stream write deadline exceeded, dropping subscriber");
                break;
            }
        }
    }
    hub.unsubscribe(subscription.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn socket_path(label: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        path.push(format!("auditd-stream-{label}-{nanos}.sock"));
        path
    }

    #[tokio::test]
    async fn connected_client_reads_published_lines_in_order() {
        let path = socket_path("order");
        let hub = StreamHub::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = tokio::spawn(run_stream_listener(path.clone(), hub.clone(), shutdown_rx));

        // Wait for the socket to appear, then connect.
        for _ in 0..50 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let client = UnixStream::connect(&path).await.unwrap();
        let mut lines = BufReader::new(client).lines();

        // Let the accept loop register the subscription before publishing.
        for _ in 0..50 {
            if hub.subscriber_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        hub.publish(r#"{"event_id":"evt_1"}"#);
        hub.publish(r#"{"event_id":"evt_2"}"#);

        let first = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(first, r#"{"event_id":"evt_1"}"#);
        assert_eq!(second, r#"{"event_id":"evt_2"}"#);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), listener)
            .await
            .expect("listener must stop on shutdown")
            .unwrap()
            .unwrap();
        assert!(!path.exists(), "socket file removed on shutdown");
    }

    #[tokio::test]
    async fn disconnected_client_is_unsubscribed() {
        let path = socket_path("gone");
        let hub = StreamHub::new();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let _listener = tokio::spawn(run_stream_listener(path.clone(), hub.clone(), shutdown_rx));

        for _ in 0..50 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let client = UnixStream::connect(&path).await.unwrap();
        for _ in 0..50 {
            if hub.subscriber_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(client);

        // The writer loop notices on its next send and deregisters.
        for _ in 0..100 {
            hub.publish("{}");
            if hub.subscriber_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hub.subscriber_count(), 0);
    }
}
