//! Table router: dispatches table events to the handler registered for
//! their table name.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, error};

use crate::driverapi::EventKind;
use crate::error::{DriverError, Result};

/// A table notification delivered by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEvent {
    pub kind: EventKind,
    pub network_id: String,
    pub table: String,
    pub key: String,
    pub value: Vec<u8>,
}

/// A handler for one table.
pub type TableHandler =
    Arc<dyn Fn(TableEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Default)]
pub struct TableRouter {
    handlers: HashMap<String, TableHandler>,
}

impl TableRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `table`. A table can only have one handler.
    pub fn register(&mut self, table: &str, handler: TableHandler) -> Result<()> {
        if self.handlers.contains_key(table) {
            return Err(DriverError::Internal(format!(
                "handler for table {table} already registered"
            )));
        }
        debug!("Registering handler for table: {table}");
        self.handlers.insert(table.to_string(), handler);
        Ok(())
    }

    pub fn has_handler(&self, table: &str) -> bool {
        self.handlers.contains_key(table)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Dispatch `event` to its table's handler. Returns false when no handler
    /// is registered.
    pub async fn dispatch(&self, event: TableEvent) -> bool {
        match self.handlers.get(&event.table) {
            Some(handler) => {
                debug!("Dispatching {:?} for {} key {}", event.kind, event.table, event.key);
                handler(event).await;
                true
            }
            None => {
                error!("Unexpected table notification for table {} received", event.table);
                false
            }
        }
    }
}
