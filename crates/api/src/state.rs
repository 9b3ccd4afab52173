//! Shared application state for the Axum API server.

use std::sync::Arc;

use courier_engine::DispatchEngine;
use courier_ingestor::normalize::EventIngestor;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DispatchEngine>,
    pub ingestor: Arc<EventIngestor>,
}

impl AppState {
    pub fn new(engine: Arc<DispatchEngine>, ingestor: EventIngestor) -> Self {
        Self {
            engine,
            ingestor: Arc::new(ingestor),
        }
    }
}
