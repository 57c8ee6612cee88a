//! Event dispatch registry
//!
//! Handlers are registered per lifecycle action when discovery is built and
//! never change afterwards, so dispatch reads the registry without locking.

use crate::container::ContainerEvent;
use crate::error::{DispatchError, HandlerError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error};

/// Lifecycle actions handlers can be registered for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventAction {
    Start,
    Stop,
    Die,
    Kill,
}

impl EventAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventAction::Start => "start",
            EventAction::Stop => "stop",
            EventAction::Die => "die",
            EventAction::Kill => "kill",
        }
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(EventAction::Start),
            "stop" => Ok(EventAction::Stop),
            "die" => Ok(EventAction::Die),
            "kill" => Ok(EventAction::Kill),
            other => Err(format!("unrecognized event action: {}", other)),
        }
    }
}

/// Reacts to a container lifecycle event
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: &ContainerEvent) -> Result<(), HandlerError>;

    /// Handler name for logging
    fn name(&self) -> &str;
}

/// Action-keyed collection of event handlers
#[derive(Default)]
pub struct EventRegistry {
    handlers: HashMap<EventAction, Vec<Arc<dyn EventHandler>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler for `action`; handlers run in registration order
    pub fn register_handler(&mut self, action: EventAction, handler: Arc<dyn EventHandler>) {
        debug!(action = %action, handler = handler.name(), "Registered event handler");
        self.handlers.entry(action).or_default().push(handler);
    }

    /// Number of handlers registered for `action`
    pub fn handler_count(&self, action: EventAction) -> usize {
        self.handlers.get(&action).map_or(0, Vec::len)
    }

    /// Run every handler registered for the event's action
    ///
    /// Actions without handlers succeed without doing anything. The first
    /// failing handler stops the remaining ones and its error is returned.
    pub async fn dispatch(&self, event: &ContainerEvent) -> Result<(), DispatchError> {
        let Ok(action) = event.action.parse::<EventAction>() else {
            return Ok(());
        };
        let Some(handlers) = self.handlers.get(&action) else {
            return Ok(());
        };

        for handler in handlers {
            if let Err(e) = handler.handle_event(event).await {
                error!(
                    action = %action,
                    handler = handler.name(),
                    container_id = %event.container_id,
                    error = %e,
                    "Failed to process event"
                );
                return Err(DispatchError {
                    action: action.to_string(),
                    handler: handler.name().to_string(),
                    container_id: event.container_id.clone(),
                    source: e,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        name: String,
        calls: AtomicUsize,
        fail: bool,
        log: Option<Arc<Mutex<Vec<String>>>>,
    }

    impl CountingHandler {
        fn new(name: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                calls: AtomicUsize::new(0),
                fail,
                log: None,
            })
        }

        fn logging(name: &str, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                calls: AtomicUsize::new(0),
                fail: false,
                log: Some(log),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle_event(&self, _event: &ContainerEvent) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(log) = &self.log {
                log.lock().push(self.name.clone());
            }
            if self.fail {
                return Err(HandlerError::Other("handler error".to_string()));
            }
            Ok(())
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    #[test]
    fn test_parse_actions() {
        assert_eq!("start".parse::<EventAction>(), Ok(EventAction::Start));
        assert_eq!("stop".parse::<EventAction>(), Ok(EventAction::Stop));
        assert_eq!("die".parse::<EventAction>(), Ok(EventAction::Die));
        assert_eq!("kill".parse::<EventAction>(), Ok(EventAction::Kill));
        assert!("exec_start: sh".parse::<EventAction>().is_err());
    }

    #[tokio::test]
    async fn test_dispatch_invokes_handler() {
        let handler = CountingHandler::new("ok", false);
        let mut registry = EventRegistry::new();
        registry.register_handler(EventAction::Start, handler.clone());

        registry
            .dispatch(&ContainerEvent::container("start", "c1"))
            .await
            .unwrap();
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_unregistered_action_is_ignored() {
        let handler = CountingHandler::new("ok", false);
        let mut registry = EventRegistry::new();
        registry.register_handler(EventAction::Start, handler.clone());

        assert!(registry.dispatch(&ContainerEvent::container("stop", "c1")).await.is_ok());
        assert!(registry.dispatch(&ContainerEvent::container("unknown", "c1")).await.is_ok());
        assert_eq!(handler.calls(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_empty_registry() {
        let registry = EventRegistry::new();
        assert!(registry.dispatch(&ContainerEvent::container("start", "c1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_first_failure_stops_remaining_handlers() {
        let first = CountingHandler::new("first", true);
        let second = CountingHandler::new("second", false);
        let mut registry = EventRegistry::new();
        registry.register_handler(EventAction::Die, first.clone());
        registry.register_handler(EventAction::Die, second.clone());

        let err = registry
            .dispatch(&ContainerEvent::container("die", "c1"))
            .await
            .unwrap_err();

        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 0);
        assert_eq!(err.handler, "first");
        assert_eq!(err.action, "die");
        assert_eq!(err.container_id, "c1");
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = EventRegistry::new();
        for name in ["a", "b", "c"] {
            registry.register_handler(EventAction::Kill, CountingHandler::logging(name, log.clone()));
        }
        assert_eq!(registry.handler_count(EventAction::Kill), 3);
        assert_eq!(registry.handler_count(EventAction::Start), 0);

        registry
            .dispatch(&ContainerEvent::container("kill", "c1"))
            .await
            .unwrap();
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }
}
