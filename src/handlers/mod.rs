pub mod health;
pub mod metrics_handler;
pub mod query_api;
pub mod ws;

use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::hub::Hub;
use crate::store::StatStore;

/// Shared state for every HTTP and WebSocket handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<StatStore>,
    pub hub: Hub,
    pub metrics_handle: Arc<PrometheusHandle>,
}
