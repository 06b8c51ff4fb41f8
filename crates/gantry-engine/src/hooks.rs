//! Suite lifecycle events and listeners

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::HookError;
use crate::report::ResultRecord;

/// Lifecycle events emitted during a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuiteEvent {
    /// A worker is about to process a partition
    BeforeSuite { partition: String, worker: usize },
    /// A worker finished a partition, whatever the outcome. `results` holds
    /// one record per unit of the partition, in partition order.
    AfterSuite {
        partition: String,
        worker: usize,
        results: Vec<ResultRecord>,
    },
    /// A worker crashed or could not be started
    WorkerCrashed {
        partition: String,
        worker: usize,
        detail: String,
    },
}

impl SuiteEvent {
    /// Partition the event refers to
    pub fn partition(&self) -> &str {
        match self {
            Self::BeforeSuite { partition, .. }
            | Self::AfterSuite { partition, .. }
            | Self::WorkerCrashed { partition, .. } => partition,
        }
    }
}

/// Receives lifecycle events
pub trait SuiteListener: Send + Sync {
    /// Handle an event; errors are logged and never stop the run
    fn on_event(&self, event: &SuiteEvent) -> Result<(), HookError>;
}

/// Logs events with tracing
#[derive(Debug, Default)]
pub struct TracingListener;

impl SuiteListener for TracingListener {
    fn on_event(&self, event: &SuiteEvent) -> Result<(), HookError> {
        match event {
            SuiteEvent::BeforeSuite { partition, worker } => {
                info!("Starting partition {} on worker {}", partition, worker);
            }
            SuiteEvent::AfterSuite {
                partition,
                worker,
                results,
            } => {
                let passed = results.iter().filter(|r| r.status.is_passed()).count();
                info!(
                    "Partition {} finished on worker {}: {}/{} passed",
                    partition,
                    worker,
                    passed,
                    results.len()
                );
            }
            SuiteEvent::WorkerCrashed {
                partition,
                worker,
                detail,
            } => {
                error!("Worker {} crashed running {}: {}", worker, partition, detail);
            }
        }
        Ok(())
    }
}

/// Collects events for later inspection (useful for testing)
#[derive(Debug, Default)]
pub struct CollectingListener {
    events: Mutex<Vec<SuiteEvent>>,
}

impl CollectingListener {
    /// Get all collected events
    pub fn events(&self) -> Vec<SuiteEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl SuiteListener for CollectingListener {
    fn on_event(&self, event: &SuiteEvent) -> Result<(), HookError> {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
        Ok(())
    }
}

/// Registry of lifecycle listeners
pub struct ListenerRegistry {
    listeners: Vec<Arc<dyn SuiteListener>>,
}

impl ListenerRegistry {
    /// Registry with the tracing listener installed
    pub fn new() -> Self {
        Self {
            listeners: vec![Arc::new(TracingListener)],
        }
    }

    /// Registry with no listeners
    pub fn empty() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    /// Add a listener
    pub fn register<L: SuiteListener + 'static>(&mut self, listener: L) {
        self.listeners.push(Arc::new(listener));
    }

    /// Add a shared listener
    pub fn register_shared(&mut self, listener: Arc<dyn SuiteListener>) {
        self.listeners.push(listener);
    }

    /// All registered listeners
    pub fn all(&self) -> &[Arc<dyn SuiteListener>] {
        &self.listeners
    }

    /// Deliver an event to every listener in registration order.
    ///
    /// Errors and panics are logged and swallowed.
    pub fn broadcast(&self, event: &SuiteEvent) {
        for (index, listener) in self.listeners.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(listener = index, error = %e, ?event, "lifecycle listener failed");
                }
                Err(_) => {
                    warn!(listener = index, ?event, "lifecycle listener panicked");
                }
            }
        }
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Sending side of the event dispatcher; cheap to clone, never blocks
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<SuiteEvent>,
}

impl EventSender {
    /// Queue an event for delivery
    pub fn emit(&self, event: SuiteEvent) {
        if self.tx.send(event).is_err() {
            debug!("event dispatcher already stopped");
        }
    }
}

/// Delivers events to listeners on a blocking thread
pub struct EventDispatcher {
    task: JoinHandle<()>,
}

impl EventDispatcher {
    /// Start the dispatcher
    pub fn start(registry: Arc<ListenerRegistry>) -> (EventSender, Self) {
        let (tx, mut rx) = mpsc::unbounded_channel::<SuiteEvent>();
        let task = tokio::task::spawn_blocking(move || {
            while let Some(event) = rx.blocking_recv() {
                registry.broadcast(&event);
            }
        });
        (EventSender { tx }, Self { task })
    }

    /// Wait until every queued event has been delivered.
    ///
    /// Completes once all senders have been dropped.
    pub async fn drain(self) {
        if let Err(e) = self.task.await {
            warn!(error = %e, "event dispatcher stopped abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::UnitStatus;

    struct FailingListener;

    impl SuiteListener for FailingListener {
        fn on_event(&self, _event: &SuiteEvent) -> Result<(), HookError> {
            Err(HookError::new("listener is broken"))
        }
    }

    struct PanickingListener;

    impl SuiteListener for PanickingListener {
        fn on_event(&self, _event: &SuiteEvent) -> Result<(), HookError> {
            panic!("listener exploded");
        }
    }

    fn before(partition: &str) -> SuiteEvent {
        SuiteEvent::BeforeSuite {
            partition: partition.to_string(),
            worker: 0,
        }
    }

    #[test]
    fn test_empty_registry() {
        assert!(ListenerRegistry::empty().all().is_empty());
        assert_eq!(ListenerRegistry::new().all().len(), 1);
    }

    #[test]
    fn test_broadcast_survives_failing_listeners() {
        let collecting = Arc::new(CollectingListener::default());
        let mut registry = ListenerRegistry::empty();
        registry.register(FailingListener);
        registry.register(PanickingListener);
        registry.register_shared(collecting.clone());

        registry.broadcast(&before("auth"));
        registry.broadcast(&before("users"));

        let partitions: Vec<_> = collecting
            .events()
            .iter()
            .map(|e| e.partition().to_string())
            .collect();
        assert_eq!(partitions, vec!["auth", "users"]);
    }

    #[tokio::test]
    async fn test_dispatcher_delivers_in_order_before_drain_returns() {
        let collecting = Arc::new(CollectingListener::default());
        let mut registry = ListenerRegistry::empty();
        registry.register_shared(collecting.clone());

        let (sender, dispatcher) = EventDispatcher::start(Arc::new(registry));
        sender.emit(before("a"));
        sender.emit(SuiteEvent::WorkerCrashed {
            partition: "a".to_string(),
            worker: 0,
            detail: "exit".to_string(),
        });
        sender.emit(SuiteEvent::AfterSuite {
            partition: "a".to_string(),
            worker: 0,
            results: vec![ResultRecord::new("a::one", "a", UnitStatus::ErrorWorkerCrashed)],
        });
        drop(sender);
        dispatcher.drain().await;

        let events = collecting.events();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[1], SuiteEvent::WorkerCrashed { .. }));
        match &events[2] {
            SuiteEvent::AfterSuite { results, .. } => {
                assert_eq!(results[0].unit_id, "a::one");
            }
            other => panic!("expected after_suite, got {:?}", other),
        }
    }

    #[test]
    fn test_tracing_listener() {
        // Just verify it doesn't fail
        TracingListener.on_event(&before("auth")).unwrap();
        TracingListener
            .on_event(&SuiteEvent::AfterSuite {
                partition: "auth".to_string(),
                worker: 0,
                results: vec![ResultRecord::new("auth::login", "auth", UnitStatus::Passed)],
            })
            .unwrap();
    }
}
