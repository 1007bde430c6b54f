use std::sync::Arc;
use std::time::Duration;

use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use crate::connection::ConnectionTable;

/// Default time between liveness sweeps.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Outcome of one [`LivenessMonitor::sweep`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub pinged: usize,
    pub terminated: usize,
}

/// Periodic ping/pong sweep over every connected handle.
///
/// A handle whose `alive` flag is still clear from the previous sweep is
/// terminated; every other handle has its flag cleared and gets a ping. A
/// peer therefore has one full interval to answer a ping.
pub struct LivenessMonitor {
    connections: Arc<ConnectionTable>,
    interval: Duration,
    audit: Option<AuditSink>,
}

impl LivenessMonitor {
    pub fn new(connections: Arc<ConnectionTable>, interval: Duration) -> Self {
        Self {
            connections,
            interval,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditSink) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for conn in self.connections.iter() {
            if conn.is_terminated() {
                continue;
            }

            if !conn.take_alive() {
                tracing::info!(
                    connection_id = %conn.id(),
                    remote_addr = %conn.remote_addr(),
                    role = ?conn.role(),
                    "peer missed liveness ping; terminating"
                );
                conn.terminate();
                report.terminated += 1;

                if let Some(audit) = &self.audit {
                    audit.try_log(AuditEntry::new(
                        AuditEventType::ConnectionEvicted,
                        AuditSource::new("liveness").with_connection(conn.id(), conn.remote_addr()),
                        serde_json::json!({ "role": format!("{:?}", conn.role()) }),
                    ));
                }
                continue;
            }

            if let Err(err) = conn.ping() {
                tracing::debug!(connection_id = %conn.id(), %err, "failed to queue ping");
            }
            report.pinged += 1;
        }

        if report.terminated > 0 {
            tracing::debug!(?report, "liveness sweep finished");
        }
        report
    }

    /// Sweep every interval until `shutdown` fires. The first sweep happens
    /// one full interval after start.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.interval,
            self.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep();
                }
                _ = shutdown.recv() => {
                    tracing::debug!("liveness monitor shutting down");
                    return;
                }
            }
        }
    }
}
