pub mod broker;
pub mod config;
pub mod error;
pub mod hub;
pub mod metrics;
pub mod routes;

use std::sync::Arc;

use config::Config;
use hub::Hub;
use metrics_exporter_prometheus::PrometheusHandle;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub config: Arc<Config>,
    /// Renders `/metrics`. `None` when no recorder was installed.
    pub metrics: Option<PrometheusHandle>,
}
