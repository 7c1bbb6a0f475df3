//! Message Handler Dispatch
//!
//! Thin lookup from command id to application callable. Handlers are
//! registered up front; messages whose command has no handler are skipped.
//! A duplicate registration overwrites the previous handler. A panic inside
//! a handler is caught, logged and swallowed so it cannot take the engine
//! down with it.

use crate::message::MessagePtr;
use crate::registry;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{error, trace};
use uuid::Uuid;

pub type Handler = Box<dyn Fn(&MessagePtr) + Send + Sync>;

/// Command-to-handler map.
#[derive(Default)]
pub struct HandlerMap {
    handlers: HashMap<Uuid, Handler>,
}

impl HandlerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for a command, replacing a previous one.
    pub fn register<F>(&mut self, command: Uuid, handler: F)
    where
        F: Fn(&MessagePtr) + Send + Sync + 'static,
    {
        self.handlers.insert(command, Box::new(handler));
    }

    pub fn unregister(&mut self, command: &Uuid) -> bool {
        self.handlers.remove(command).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Routes a message to its handler. Returns false when no handler is
    /// registered for the command.
    pub fn dispatch(&self, message: &MessagePtr) -> bool {
        let handler = match self.handlers.get(&message.command()) {
            Some(handler) => handler,
            None => {
                trace!(
                    "No handler for command {}, message skipped",
                    registry::command_label(&message.command())
                );
                return false;
            }
        };
        let result = catch_unwind(AssertUnwindSafe(|| handler(message)));
        if let Err(panic) = result {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(
                "Failed processing message. Command: {}. Detail: {detail}",
                registry::command_label(&message.command())
            );
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, SerializeFormat};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn message(command: Uuid) -> MessagePtr {
        Arc::new(Message::create(command, SerializeFormat::QBinary))
    }

    #[test]
    fn test_dispatch_routes_by_command() {
        let command = Uuid::new_v4();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();

        let mut map = HandlerMap::new();
        map.register(command, move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        assert!(map.dispatch(&message(command)));
        assert!(map.dispatch(&message(command)));
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        // Unknown command is skipped
        assert!(!map.dispatch(&message(Uuid::new_v4())));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_duplicate_registration_overwrites() {
        let command = Uuid::new_v4();
        let hits = Arc::new(AtomicUsize::new(0));

        let mut map = HandlerMap::new();
        map.register(command, |_| panic!("must be replaced"));
        let hits2 = hits.clone();
        map.register(command, move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        map.dispatch(&message(command));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_panic_is_swallowed() {
        let command = Uuid::new_v4();
        let mut map = HandlerMap::new();
        map.register(command, |_| panic!("handler exploded"));

        // Does not propagate
        assert!(map.dispatch(&message(command)));
    }
}
