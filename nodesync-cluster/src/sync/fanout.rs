//! Propagation of a confirmed change to sibling processes

use std::sync::Arc;

use tracing::{debug, error};

use super::message::PipeMessage;
use super::transport::{ProcessIdentity, RecipientKind, ServerTransport};
use nodesync_core::metrics::FANOUT_FAILURES;

/// Outcome of one broadcast
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FanOutReport {
    pub delivered: Vec<RecipientKind>,
    pub failed: Vec<RecipientKind>,
}

impl FanOutReport {
    #[must_use]
    pub fn total(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Sends a message to every sibling of one process
#[derive(Clone)]
pub struct FanOut {
    identity: ProcessIdentity,
    transport: Arc<ServerTransport>,
}

impl FanOut {
    #[must_use]
    pub const fn new(identity: ProcessIdentity, transport: Arc<ServerTransport>) -> Self {
        Self { identity, transport }
    }

    #[must_use]
    pub const fn identity(&self) -> ProcessIdentity {
        self.identity
    }

    /// Deliver to worker slots, then auxiliary processes
    ///
    /// The sender is skipped in both groups. A failed recipient is logged
    /// and the remaining ones are still attempted.
    pub async fn broadcast(&self, message: &PipeMessage) -> FanOutReport {
        let mut report = FanOutReport::default();

        for (recipient, sender) in self.transport.recipients_for(self.identity) {
            match sender.send(message).await {
                Ok(()) => report.delivered.push(recipient),
                Err(e) => {
                    error!(
                        recipient = %recipient,
                        pid = self.identity.pid,
                        error = %e,
                        "Failed to deliver node update"
                    );
                    FANOUT_FAILURES.with_label_values(&[recipient.label()]).inc();
                    report.failed.push(recipient);
                }
            }
        }

        debug!(
            pid = self.identity.pid,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Fan-out finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::RecordingSender;
    use nodesync_core::SyncBatch;

    fn transport(
        workers: &[(usize, Arc<RecordingSender>)],
        processes: &[(u32, Arc<RecordingSender>)],
    ) -> Arc<ServerTransport> {
        let mut transport = ServerTransport::new();
        for (id, sender) in workers {
            transport.add_worker(*id, sender.clone());
        }
        for (pid, sender) in processes {
            transport.add_process(*pid, sender.clone());
        }
        Arc::new(transport)
    }

    #[tokio::test]
    async fn test_broadcast_skips_own_worker() {
        let workers: Vec<_> = (0..3).map(|id| (id, Arc::new(RecordingSender::new()))).collect();
        let fetcher = Arc::new(RecordingSender::new());
        let fanout = FanOut::new(
            ProcessIdentity::worker(1, 11),
            transport(&workers, &[(100, fetcher.clone())]),
        );

        let report = fanout.broadcast(&PipeMessage::new(SyncBatch::default(), false)).await;

        assert!(report.is_complete());
        assert_eq!(report.total(), 3);
        assert_eq!(workers[0].1.received().len(), 1);
        assert!(workers[1].1.received().is_empty());
        assert_eq!(workers[2].1.received().len(), 1);
        assert_eq!(fetcher.received().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_skips_own_process() {
        let workers: Vec<_> = (0..2).map(|id| (id, Arc::new(RecordingSender::new()))).collect();
        let own = Arc::new(RecordingSender::new());
        let other = Arc::new(RecordingSender::new());
        let fanout = FanOut::new(
            ProcessIdentity::auxiliary(100),
            transport(&workers, &[(100, own.clone()), (101, other.clone())]),
        );

        fanout.broadcast(&PipeMessage::new(SyncBatch::default(), true)).await;

        assert!(own.received().is_empty());
        assert_eq!(other.received().len(), 1);
        assert!(other.received()[0].force_refresh());
        assert!(workers.iter().all(|(_, s)| s.received().len() == 1));
    }

    #[tokio::test]
    async fn test_failed_recipient_does_not_stop_others() {
        let workers = vec![
            (0, Arc::new(RecordingSender::failing())),
            (1, Arc::new(RecordingSender::new())),
            (2, Arc::new(RecordingSender::new())),
        ];
        let broken_process = Arc::new(RecordingSender::failing());
        let fanout = FanOut::new(
            ProcessIdentity::worker(2, 12),
            transport(&workers, &[(100, broken_process)]),
        );

        let report = fanout.broadcast(&PipeMessage::new(SyncBatch::default(), false)).await;

        assert_eq!(report.delivered, vec![RecipientKind::Worker(1)]);
        assert_eq!(
            report.failed,
            vec![RecipientKind::Worker(0), RecipientKind::Process(100)]
        );
        assert_eq!(workers[1].1.received().len(), 1);
    }
}
