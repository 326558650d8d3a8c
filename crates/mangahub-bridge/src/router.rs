//! Filtered in-process fan-out of typed events.
//!
//! Independent of the bridge queue: [`EventRouter::route`] runs every
//! handler registered for the event's type concurrently and returns once
//! all of them have finished. Filters are ANDed and evaluated first.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use mangahub_core::{EventType, UnifiedEvent};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Failure reported by an [`EventHandler`].
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler rejected or could not process the event.
    #[error("{0}")]
    Failed(String),
    /// The handler task panicked or was cancelled.
    #[error("handler task aborted: {0}")]
    Aborted(String),
}

impl HandlerError {
    /// Build a [`HandlerError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Consumer of routed events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Process one event.
    async fn handle(&self, event: &UnifiedEvent) -> Result<(), HandlerError>;
}

/// Predicate applied before any handler runs.
pub type EventFilter = Arc<dyn Fn(&UnifiedEvent) -> bool + Send + Sync>;

/// Handler backed by an async closure.
pub struct FnHandler<F> {
    name: String,
    f: F,
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(UnifiedEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(UnifiedEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &UnifiedEvent) -> Result<(), HandlerError> {
        (self.f)(event.clone()).await
    }
}

/// Outcome of one [`EventRouter::route`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouteReport {
    /// Whether every filter accepted the event.
    pub accepted: bool,
    /// Handlers that completed successfully.
    pub handled: usize,
    /// Handlers that returned an error or aborted.
    pub failed: usize,
}

/// Event-type keyed handler registry with filters.
#[derive(Default)]
pub struct EventRouter {
    handlers: RwLock<HashMap<EventType, Vec<Arc<dyn EventHandler>>>>,
    filters: RwLock<Vec<EventFilter>>,
}

impl EventRouter {
    /// Create a router with no handlers or filters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler for one event type.
    pub fn register_handler(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .entry(event_type)
            .or_default()
            .push(handler);
    }

    /// Add a filter. Every filter must accept an event for it to be routed.
    pub fn add_filter<F>(&self, filter: F)
    where
        F: Fn(&UnifiedEvent) -> bool + Send + Sync + 'static,
    {
        self.filters.write().push(Arc::new(filter));
    }

    /// Remove every handler for one event type.
    pub fn clear_handlers(&self, event_type: EventType) {
        let _ = self.handlers.write().remove(&event_type);
    }

    /// Handlers registered for one event type.
    pub fn handler_count(&self, event_type: EventType) -> usize {
        self.handlers.read().get(&event_type).map_or(0, Vec::len)
    }

    /// Run every matching handler and wait for all of them.
    pub async fn route(&self, event: &UnifiedEvent) -> RouteReport {
        let filters = self.filters.read().clone();
        if !filters.iter().all(|f| f(event)) {
            debug!(event_id = %event.id, event_type = %event.event_type, "event rejected by filter");
            return RouteReport::default();
        }

        let handlers = self
            .handlers
            .read()
            .get(&event.event_type)
            .cloned()
            .unwrap_or_default();

        let mut report = RouteReport {
            accepted: true,
            ..RouteReport::default()
        };
        if handlers.is_empty() {
            return report;
        }

        let shared = Arc::new(event.clone());
        let mut set = JoinSet::new();
        for handler in handlers {
            let event = Arc::clone(&shared);
            let _ = set.spawn(async move {
                let result = handler.handle(&event).await;
                (handler.name().to_owned(), result)
            });
        }

        while let Some(joined) = set.join_next().await {
            let (name, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => ("<aborted>".to_owned(), Err(HandlerError::Aborted(e.to_string()))),
            };
            match result {
                Ok(()) => report.handled += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        handler = %name,
                        event_id = %shared.id,
                        event_type = %shared.event_type,
                        error = %e,
                        "event handler failed"
                    );
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mangahub_core::ProtocolType;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn event(event_type: EventType, user: &str) -> UnifiedEvent {
        UnifiedEvent::new(event_type, user, ProtocolType::Tcp, Map::new())
    }

    fn counting(name: &str, hits: &Arc<AtomicUsize>) -> Arc<dyn EventHandler> {
        let hits = Arc::clone(hits);
        handler_fn(name, move |_| {
            let hits = Arc::clone(&hits);
            async move {
                let _ = hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn routes_only_to_matching_type() {
        let router = EventRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        router.register_handler(EventType::LibraryAdd, counting("a", &hits));
        router.register_handler(EventType::LibraryAdd, counting("b", &hits));

        let report = router.route(&event(EventType::LibraryAdd, "u1")).await;
        assert_eq!(report, RouteReport { accepted: true, handled: 2, failed: 0 });

        let report = router.route(&event(EventType::LibraryRemove, "u1")).await;
        assert_eq!(report.handled, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn any_rejecting_filter_drops_event() {
        let router = EventRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        router.register_handler(EventType::ProgressUpdate, counting("h", &hits));
        router.add_filter(|_| true);
        router.add_filter(|e| !e.user_id.is_empty());

        let report = router.route(&event(EventType::ProgressUpdate, "")).await;
        assert!(!report.accepted);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let report = router.route(&event(EventType::ProgressUpdate, "u1")).await;
        assert!(report.accepted);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_others() {
        let router = EventRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        router.register_handler(
            EventType::SyncRequest,
            handler_fn("broken", |_| async { Err(HandlerError::failed("nope")) }),
        );
        router.register_handler(EventType::SyncRequest, counting("ok", &hits));

        let report = router.route(&event(EventType::SyncRequest, "u1")).await;
        assert_eq!(report.handled, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_handler_is_contained() {
        let router = EventRouter::new();
        router.register_handler(
            EventType::HealthCheck,
            handler_fn("panics", |e| async move {
                if e.user_id.is_empty() {
                    panic!("handler bug");
                }
                Ok(())
            }),
        );
        let report = router.route(&event(EventType::HealthCheck, "")).await;
        assert_eq!(report.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn route_waits_for_slow_handlers() {
        let router = EventRouter::new();
        let done = Arc::new(AtomicUsize::new(0));
        for delay in [10u64, 50, 200] {
            let done = Arc::clone(&done);
            router.register_handler(
                EventType::ChapterRelease,
                handler_fn(format!("sleep-{delay}"), move |_| {
                    let done = Arc::clone(&done);
                    async move {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        let _ = done.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            );
        }

        let report = router.route(&event(EventType::ChapterRelease, "")).await;
        assert_eq!(report.handled, 3);
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn clear_handlers_removes_type() {
        let router = EventRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        router.register_handler(EventType::StatusChange, counting("h", &hits));
        assert_eq!(router.handler_count(EventType::StatusChange), 1);

        router.clear_handlers(EventType::StatusChange);
        assert_eq!(router.handler_count(EventType::StatusChange), 0);
        let report = router.route(&event(EventType::StatusChange, "u1")).await;
        assert!(report.accepted);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
