use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use typed_builder::TypedBuilder;

use crate::coordinator::{Coordinator, DEFAULT_IO_TIMEOUT};
use crate::error::VisitError;
use crate::storage::EventLog;

/// Entry point for "a visit happened". Appends to the durable log first and
/// only then asks the coordinator for the count, so no count is ever reported
/// for a visit that was not recorded.
#[derive(Clone, TypedBuilder)]
pub struct VisitService {
    log: Arc<dyn EventLog>,
    coordinator: Coordinator,
    #[builder(default = DEFAULT_IO_TIMEOUT)]
    io_timeout: Duration,
}

impl VisitService {
    /// The append and the cache update run in their own task. Once the append
    /// has started, dropping this future or timing out on the append does not
    /// stop the cache from hearing about the visit.
    pub async fn record_visit(&self) -> Result<u64, VisitError> {
        let (appended_tx, appended_rx) = oneshot::channel();
        let log = Arc::clone(&self.log);
        let coordinator = self.coordinator.clone();

        let task = tokio::spawn(async move {
            let appended = log.append().await.map_err(VisitError::from);
            let _ = appended_tx.send(());
            let event = match appended {
                Ok(event) => event,
                Err(err) => {
                    tracing::error!("fail to record visit: {err}");
                    return Err(err);
                }
            };
            tracing::debug!(id = event.id, at = %event.occurred_at, "visit recorded");

            coordinator.record_and_report().await
        });

        if tokio::time::timeout(self.io_timeout, appended_rx).await.is_err() {
            let err = VisitError::Timeout {
                op: "append",
                after: self.io_timeout,
            };
            tracing::error!("{err}, cache update continues in the background");
            return Err(err);
        }

        task.await
            .map_err(|err| VisitError::StorageUnavailable(format!("visit task failed: {err}")))?
    }
}
