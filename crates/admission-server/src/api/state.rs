use std::sync::Arc;

use image_verifier::cache::Cache;
use image_verifier::config::Config;

/// Shared state of the API server. The config is immutable after
/// startup; the cache connection is safe for concurrent use.
pub struct AppState {
    pub config: Config,
    pub cache: Arc<dyn Cache>,
    pub kube_client: Option<kube::Client>,
}
