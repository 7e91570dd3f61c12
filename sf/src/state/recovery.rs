//! Crash recovery
//!
//! Finds live instances and undelivered escalation tickets left behind by a
//! previous process so the runner can resume them.

use tracing::{debug, info};

use super::StateManager;

/// Recovery statistics
#[derive(Debug, Default)]
pub struct RecoveryStats {
    /// Non-terminal instances found in the store
    pub live_instances: usize,
    /// Signals still waiting to be consumed across all live instances
    pub pending_signals: usize,
    /// Escalation tickets committed but never handed to the sink
    pub undelivered_tickets: usize,
    /// Ids of the live instances, in store order
    pub instances: Vec<String>,
}

impl std::fmt::Display for RecoveryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "instances: {}, signals: {}, tickets: {}",
            self.live_instances, self.pending_signals, self.undelivered_tickets
        )
    }
}

/// Check for incomplete work and gather recovery statistics
///
/// Scans the store for:
/// - Instances in a non-terminal stage (possibly crashed mid-turn)
/// - Pending signals on those instances
/// - Tickets whose delivery to the escalation sink never completed
pub async fn scan_for_recovery(state: &StateManager) -> eyre::Result<RecoveryStats> {
    let mut stats = RecoveryStats::default();

    let live = state
        .list_snapshots(false)
        .await
        .map_err(|e| eyre::eyre!("Failed to list live instances: {}", e))?;
    stats.live_instances = live.len();

    for snapshot in &live {
        let pending = state
            .pending_signals(&snapshot.instance_id)
            .await
            .map_err(|e| eyre::eyre!("Failed to read signals for {}: {}", snapshot.instance_id, e))?;
        debug!(
            instance_id = %snapshot.instance_id,
            stage = %snapshot.stage,
            version = snapshot.version,
            pending = pending.len(),
            "Found live instance needing recovery"
        );
        stats.pending_signals += pending.len();
        stats.instances.push(snapshot.instance_id.clone());
    }

    let tickets = state
        .list_tickets(None, true)
        .await
        .map_err(|e| eyre::eyre!("Failed to list undelivered tickets: {}", e))?;
    stats.undelivered_tickets = tickets.len();

    if stats.live_instances > 0 || stats.undelivered_tickets > 0 {
        info!("Recovery scan found incomplete work: {}", stats);
    } else {
        debug!("Recovery scan found no incomplete work");
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sessionstore::{NewSignal, SnapshotRecord};
    use serde_json::json;
    use tempfile::tempdir;

    fn snapshot(id: &str, stage: &str, terminal: bool) -> SnapshotRecord {
        SnapshotRecord {
            instance_id: id.to_string(),
            generation: 1,
            version: 0,
            stage: stage.to_string(),
            terminal,
            body: json!({}),
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn test_recovery_empty_store() {
        let temp = tempdir().unwrap();
        let manager = StateManager::spawn(temp.path().join("sf.db")).unwrap();

        let stats = scan_for_recovery(&manager).await.unwrap();

        assert_eq!(stats.live_instances, 0);
        assert_eq!(stats.pending_signals, 0);
        assert_eq!(stats.undelivered_tickets, 0);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_recovery_skips_terminal_instances() {
        let manager = StateManager::spawn_in_memory().unwrap();
        manager
            .create_instance(snapshot("live", "BUDGET", false), vec![])
            .await
            .unwrap();
        manager
            .create_instance(snapshot("done", "COMPLETED", true), vec![])
            .await
            .unwrap();
        manager
            .enqueue_signal(
                NewSignal {
                    instance_id: "live".to_string(),
                    signal_id: "s1".to_string(),
                    critical: false,
                    payload: json!({}),
                    received_at: 0,
                },
                8,
            )
            .await
            .unwrap();

        let stats = scan_for_recovery(&manager).await.unwrap();

        assert_eq!(stats.live_instances, 1);
        assert_eq!(stats.pending_signals, 1);
        assert_eq!(stats.instances, vec!["live".to_string()]);
        assert_eq!(stats.to_string(), "instances: 1, signals: 1, tickets: 0");
    }
}
