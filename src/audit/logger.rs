//! Bounded, failure-swallowing notifier in front of a sink.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::warn;

use super::event::ViolationEvent;
use super::sink::ViolationSink;
use crate::error::SinkError;

/// Forwards violation events to a sink off the caller's path.
///
/// `report` hands each event to a background task and returns at once, so
/// a slow sink never delays an admission decision. Each delivery is bounded
/// by `timeout`; failures and timeouts are logged and dropped.
#[derive(Clone)]
pub struct ViolationLogger {
    sink: Arc<dyn ViolationSink>,
    timeout: Duration,
    pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for ViolationLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViolationLogger")
            .field("timeout", &self.timeout)
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl ViolationLogger {
    pub fn new(sink: Arc<dyn ViolationSink>, timeout: Duration) -> Self {
        Self {
            sink,
            timeout,
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue `event` for delivery without waiting on the sink.
    pub fn report(&self, event: ViolationEvent) {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!(
                    event_id = %event.id,
                    action = ?event.action,
                    error = %e,
                    "No runtime to deliver violation event, dropping it"
                );
                return;
            }
        };

        let task = runtime.spawn(deliver(Arc::clone(&self.sink), self.timeout, event));

        let mut pending = self.pending.lock();
        pending.retain(|t| !t.is_finished());
        pending.push(task);
    }

    /// Wait for every delivery queued so far to finish or time out.
    pub async fn flush(&self) {
        let tasks = std::mem::take(&mut *self.pending.lock());
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Violation delivery task failed");
            }
        }
    }

    /// Deliveries queued and not yet observed as finished.
    pub fn pending(&self) -> usize {
        self.pending.lock().iter().filter(|t| !t.is_finished()).count()
    }
}

async fn deliver(sink: Arc<dyn ViolationSink>, timeout: Duration, event: ViolationEvent) {
    let outcome = match tokio::time::timeout(timeout, sink.notify(&event)).await {
        Ok(result) => result,
        Err(_) => Err(SinkError::Timeout(timeout)),
    };

    if let Err(e) = outcome {
        warn!(
            event_id = %event.id,
            action = ?event.action,
            identifier = %event.identifier,
            error = %e,
            "Failed to deliver violation event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{RecordingSink, Severity, ViolationAction};
    use async_trait::async_trait;

    struct BrokenSink;

    #[async_trait]
    impl ViolationSink for BrokenSink {
        async fn notify(&self, _event: &ViolationEvent) -> Result<(), SinkError> {
            Err(SinkError::Rejected("disk full".into()))
        }
    }

    struct StuckSink;

    #[async_trait]
    impl ViolationSink for StuckSink {
        async fn notify(&self, _event: &ViolationEvent) -> Result<(), SinkError> {
            futures::future::pending().await
        }
    }

    fn event() -> ViolationEvent {
        ViolationEvent::new(
            ViolationAction::RateLimitExceeded,
            Severity::Medium,
            "ip:1.2.3.4",
            "GET /api/x",
            0,
        )
    }

    #[tokio::test]
    async fn test_report_delivers_to_sink() {
        let sink = Arc::new(RecordingSink::new());
        let logger = ViolationLogger::new(sink.clone(), Duration::from_millis(100));

        logger.report(event());
        logger.report(event());
        logger.flush().await;

        assert_eq!(sink.count(ViolationAction::RateLimitExceeded), 2);
        assert_eq!(logger.pending(), 0);
    }

    #[tokio::test]
    async fn test_report_swallows_sink_errors() {
        let logger = ViolationLogger::new(Arc::new(BrokenSink), Duration::from_millis(100));
        logger.report(event());
        logger.flush().await;
    }

    #[tokio::test]
    async fn test_report_does_not_wait_for_sink() {
        let logger = ViolationLogger::new(Arc::new(StuckSink), Duration::from_secs(5));

        let started = std::time::Instant::now();
        logger.report(event());

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(logger.pending(), 1);
    }

    #[tokio::test]
    async fn test_flush_bounded_by_timeout() {
        let logger = ViolationLogger::new(Arc::new(StuckSink), Duration::from_millis(20));

        let started = std::time::Instant::now();
        logger.report(event());
        logger.flush().await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(logger.pending(), 0);
    }

    #[test]
    fn test_report_without_runtime_drops_event() {
        let sink = Arc::new(RecordingSink::new());
        let logger = ViolationLogger::new(sink.clone(), Duration::from_millis(100));

        logger.report(event());

        assert_eq!(logger.pending(), 0);
        assert!(sink.events().is_empty());
    }
}
