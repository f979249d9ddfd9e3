use std::path::PathBuf;
use std::sync::Arc;

use ccrelay_concurrency::ConcurrencyManager;
use ccrelay_observability::MetricsCollector;
use ccrelay_router::Router;
use ccrelay_store::Logger;

/// Everything the management handlers need, shared behind axum's `State`
/// extractor.
pub struct AdminState {
    pub router: Arc<Router>,
    pub concurrency: Arc<ConcurrencyManager>,
    pub logger: Logger,
    pub metrics: Arc<MetricsCollector>,
    pub port: u16,
    pub config_path: Option<String>,
    pub state_file: Option<PathBuf>,
}

pub type SharedAdminState = Arc<AdminState>;
