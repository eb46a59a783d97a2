//! Stale-suffix cleanup
//!
//! Rows heartbeat their suffix into the cleaner; a fixed one-minute sweep
//! emits every suffix unseen for longer than the clean interval onto the
//! removal channel. Entries are never evicted: a re-observed suffix resets
//! its timestamp, and a truly gone one re-emits each sweep, which the
//! downstream NotFound-tolerant delete absorbs. Suffixes of duplicates that
//! predate a restart are seeded by the first scan, not from the cluster.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::CLEANER_TICK;
use crate::tablewatch::Row;

/// The sweep loop. Owns the last-seen map; nothing else touches it.
pub struct Cleaner {
    clean_interval: Duration,
    last_seen: HashMap<String, Instant>,
    heartbeat_rx: mpsc::Receiver<String>,
    remove_tx: mpsc::Sender<String>,
}

/// Heartbeat side of the cleaner, held by the row dispatch loop.
#[derive(Clone)]
pub struct CleanerHandle {
    suffix_column: String,
    heartbeat_tx: mpsc::Sender<String>,
}

impl CleanerHandle {
    /// Record the row's suffix as just seen.
    pub async fn on_row(&self, row: &Row) {
        match row.get(&self.suffix_column) {
            Some(suffix) if !suffix.is_empty() => self.on_deploy(suffix.clone()).await,
            _ => warn!(column = %self.suffix_column, "suffix column missing or empty on row"),
        }
    }

    /// Record a suffix as just seen.
    pub async fn on_deploy(&self, suffix: String) {
        let _ = self.heartbeat_tx.send(suffix).await;
    }
}

impl Cleaner {
    pub fn new(
        clean_interval: Duration,
        suffix_column: impl Into<String>,
        remove_tx: mpsc::Sender<String>,
    ) -> (Self, CleanerHandle) {
        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(1);

        (
            Self {
                clean_interval,
                last_seen: HashMap::new(),
                heartbeat_rx,
                remove_tx,
            },
            CleanerHandle {
                suffix_column: suffix_column.into(),
                heartbeat_tx,
            },
        )
    }

    /// Multiplex heartbeats and the sweep tick. Returns when every handle
    /// is dropped (shutdown).
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + CLEANER_TICK, CLEANER_TICK);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                heartbeat = self.heartbeat_rx.recv() => match heartbeat {
                    Some(suffix) => {
                        self.last_seen.insert(suffix, Instant::now());
                    }
                    None => return,
                },
            }
        }
    }

    async fn sweep(&mut self) {
        for (suffix, last_seen) in &self.last_seen {
            if last_seen.elapsed() > self.clean_interval {
                info!(suffix = %suffix, "suffix is stale, requesting removal");
                if self.remove_tx.send(suffix.clone()).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    const TTL: Duration = Duration::from_secs(30);

    fn spawn_cleaner(ttl: Duration) -> (CleanerHandle, mpsc::Receiver<String>) {
        let (remove_tx, remove_rx) = mpsc::channel(1);
        let (cleaner, handle) = Cleaner::new(ttl, "id", remove_tx);
        tokio::spawn(cleaner.run());
        (handle, remove_rx)
    }

    async fn settle() {
        // Let the cleaner task absorb pending heartbeats before moving the
        // clock.
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stale_suffix_is_emitted_after_ttl() {
        let (handle, mut remove_rx) = spawn_cleaner(TTL);

        handle.on_deploy("a".to_string()).await;
        settle().await;

        // First sweep at the one-minute tick: "a" is 60s old, past the TTL.
        advance(Duration::from_secs(61)).await;
        assert_eq!(remove_rx.recv().await.as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_suffix_is_not_emitted() {
        // TTL longer than one tick: the first sweep sees a fresh entry.
        let (handle, mut remove_rx) = spawn_cleaner(Duration::from_secs(90));

        handle.on_deploy("a".to_string()).await;
        settle().await;

        advance(Duration::from_secs(61)).await;
        settle().await;
        assert!(remove_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn re_observation_resets_the_clock() {
        let (handle, mut remove_rx) = spawn_cleaner(TTL);

        handle.on_deploy("a".to_string()).await;
        settle().await;

        advance(Duration::from_secs(50)).await;
        handle.on_deploy("a".to_string()).await;
        settle().await;

        // Sweep at t=60: "a" was re-seen 10s ago, well inside the TTL.
        advance(Duration::from_secs(11)).await;
        settle().await;
        assert!(remove_rx.try_recv().is_err());

        // No further heartbeats: the next sweep finds it stale.
        advance(Duration::from_secs(60)).await;
        assert_eq!(remove_rx.recv().await.as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn emission_repeats_until_re_observed() {
        let (handle, mut remove_rx) = spawn_cleaner(TTL);

        handle.on_deploy("a".to_string()).await;
        settle().await;

        advance(Duration::from_secs(61)).await;
        assert_eq!(remove_rx.recv().await.as_deref(), Some("a"));

        // The entry stays in the map, so every sweep re-emits it.
        advance(Duration::from_secs(60)).await;
        assert_eq!(remove_rx.recv().await.as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn rows_heartbeat_through_the_suffix_column() {
        let (handle, mut remove_rx) = spawn_cleaner(TTL);

        let row: Row = [
            ("id".to_string(), "a".to_string()),
            ("col_f".to_string(), "x".to_string()),
        ]
        .into_iter()
        .collect();
        handle.on_row(&row).await;
        settle().await;

        advance(Duration::from_secs(61)).await;
        assert_eq!(remove_rx.recv().await.as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn rows_without_suffix_are_ignored() {
        let (handle, mut remove_rx) = spawn_cleaner(TTL);

        let row: Row = [("col_f".to_string(), "x".to_string())].into_iter().collect();
        handle.on_row(&row).await;
        settle().await;

        advance(Duration::from_secs(61)).await;
        settle().await;
        assert!(remove_rx.try_recv().is_err());
    }
}
