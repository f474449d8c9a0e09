//! Process-local pub/sub for pipeline lifecycle events.
//!
//! Contract:
//! - `emit` schedules every registered handler and returns immediately.
//! - Handler failures (errors and panics) are caught, logged and counted;
//!   they never propagate to the emitter.
//! - Delivery order between handlers of one event, and between different
//!   events, is unspecified. Consumers must be idempotent and tolerate
//!   unknown payload keys.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

// ── Reserved event names ───────────────────────────────────────────────

pub const IMAGE_APPROVED: &str = "IMAGE_APPROVED";
pub const IMAGE_REJECTED: &str = "IMAGE_REJECTED";
pub const TRAINING_STARTED: &str = "TRAINING_STARTED";
pub const TRAINING_COMPLETE: &str = "TRAINING_COMPLETE";
pub const SCENE_PLANNING_COMPLETE: &str = "SCENE_PLANNING_COMPLETE";
pub const SCENE_READY: &str = "SCENE_READY";
pub const EPISODE_ASSEMBLED: &str = "EPISODE_ASSEMBLED";
pub const EPISODE_PUBLISHED: &str = "EPISODE_PUBLISHED";
pub const PIPELINE_PHASE_ADVANCED: &str = "PIPELINE_PHASE_ADVANCED";

/// Event payloads are JSON maps; handlers must tolerate extra keys.
pub type Payload = Value;

type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type Handler = Arc<dyn Fn(Payload) -> HandlerFuture + Send + Sync>;

#[derive(Default)]
struct Counters {
    emits: AtomicU64,
    deliveries: AtomicU64,
    errors: AtomicU64,
}

/// The bus. Cheap to clone; clones share handlers and counters.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<HashMap<String, Vec<Handler>>>>,
    counters: Arc<Counters>,
}

/// Snapshot returned by [`EventBus::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub handlers_per_event: HashMap<String, usize>,
    pub emits_total: u64,
    pub deliveries_total: u64,
    pub errors_total: u64,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    /// Register an async handler for an event name. Multiple handlers per
    /// event are allowed.
    pub fn subscribe<F, Fut>(&self, event_name: &str, handler: F)
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let wrapped: Handler = Arc::new(move |payload| Box::pin(handler(payload)));
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers
            .entry(event_name.to_string())
            .or_default()
            .push(wrapped);
    }

    /// Schedule every handler registered for `event_name` and return
    /// immediately. Requires a running tokio runtime.
    pub fn emit(&self, event_name: &str, payload: Payload) {
        self.counters.emits.fetch_add(1, Ordering::Relaxed);

        let registered = {
            let handlers = self
                .handlers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            handlers.get(event_name).cloned().unwrap_or_default()
        };

        if registered.is_empty() {
            debug!("Event {} emitted with no subscribers", event_name);
            return;
        }

        for handler in registered {
            let payload = payload.clone();
            let counters = Arc::clone(&self.counters);
            let event = event_name.to_string();
            tokio::spawn(async move {
                // Run the handler as its own task so a panic is contained
                // in the JoinError instead of tearing anything down.
                let outcome = tokio::spawn(handler(payload)).await;
                match outcome {
                    Ok(Ok(())) => {
                        counters.deliveries.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Err(e)) => {
                        counters.errors.fetch_add(1, Ordering::Relaxed);
                        warn!("Handler for {} failed: {:#}", event, e);
                    }
                    Err(join_err) => {
                        counters.errors.fetch_add(1, Ordering::Relaxed);
                        warn!("Handler for {} panicked: {}", event, join_err);
                    }
                }
            });
        }
    }

    pub fn stats(&self) -> BusStats {
        let handlers_per_event = {
            let handlers = self
                .handlers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            handlers
                .iter()
                .map(|(name, list)| (name.clone(), list.len()))
                .collect()
        };
        BusStats {
            handlers_per_event,
            emits_total: self.counters.emits.load(Ordering::Relaxed),
            deliveries_total: self.counters.deliveries.load(Ordering::Relaxed),
            errors_total: self.counters.errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    async fn settle(bus: &EventBus, expected_done: u64) {
        // Handlers are fire-and-forget; poll stats until they drain.
        for _ in 0..100 {
            let stats = bus.stats();
            if stats.deliveries_total + stats.errors_total >= expected_done {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("handlers did not settle");
    }

    #[tokio::test]
    async fn test_all_subscribers_receive_each_emit() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let seen = Arc::clone(&seen);
            bus.subscribe(IMAGE_APPROVED, move |_payload| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }

        bus.emit(IMAGE_APPROVED, json!({"character_slug": "luigi"}));
        settle(&bus, 3).await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_handler_error_is_swallowed_and_counted() {
        let bus = EventBus::new();
        bus.subscribe(IMAGE_REJECTED, |_payload| async {
            anyhow::bail!("vision payload unparseable")
        });
        bus.subscribe(IMAGE_REJECTED, |_payload| async { Ok(()) });

        bus.emit(IMAGE_REJECTED, json!({}));
        settle(&bus, 2).await;

        let stats = bus.stats();
        assert_eq!(stats.errors_total, 1);
        assert_eq!(stats.deliveries_total, 1);
        assert_eq!(stats.emits_total, 1);
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let bus = EventBus::new();
        bus.subscribe(SCENE_READY, |payload| async move {
            if payload.get("scene_id").is_some() {
                panic!("handler bug");
            }
            Ok(())
        });

        bus.emit(SCENE_READY, json!({"scene_id": 1}));
        settle(&bus, 1).await;

        assert_eq!(bus.stats().errors_total, 1);
        // The bus itself is still usable.
        bus.emit(SCENE_READY, json!({"scene_id": 2}));
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_counted() {
        let bus = EventBus::new();
        bus.emit(EPISODE_PUBLISHED, json!({}));
        assert_eq!(bus.stats().emits_total, 1);
    }

    #[tokio::test]
    async fn test_handlers_tolerate_unknown_keys() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        bus.subscribe(PIPELINE_PHASE_ADVANCED, move |payload| {
            let seen = Arc::clone(&seen_clone);
            async move {
                // Only reads the key it cares about.
                if payload.get("entity_id").is_some() {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            }
        });

        bus.emit(
            PIPELINE_PHASE_ADVANCED,
            json!({"entity_id": "luigi", "surprise_key": true}),
        );
        settle(&bus, 1).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
