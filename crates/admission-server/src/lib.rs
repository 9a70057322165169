pub mod api;
pub mod cli;
pub mod metrics;
pub mod settings;
pub mod validation;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use axum_server::tls_rustls::RustlsConfig;
use image_verifier::cache::new_cache;
use image_verifier::config::Config;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use api::state::AppState;
use settings::ServerSettings;

const CONFIG_FILE: &str = "config.yaml";

pub fn setup_tracing(log_level: &str, log_format: &str) -> Result<()> {
    let filter_layer = EnvFilter::new(log_level);

    match log_format {
        "json" => tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt::layer().json())
            .init(),
        "text" => tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt::layer())
            .init(),
        _ => return Err(anyhow!("unknown log message format")),
    };

    Ok(())
}

pub async fn run(server_settings: ServerSettings) -> Result<()> {
    // configuration errors are startup-fatal
    let mut config = Config::load(&server_settings.config_dir, &[CONFIG_FILE])
        .map_err(|e| anyhow!("cannot load configuration: {e}"))?;
    config
        .initialize(
            &server_settings.secrets_dir,
            Some(server_settings.alert_template_dir.clone()),
        )
        .map_err(|e| anyhow!("cannot initialize configuration: {e}"))?;
    info!(
        validators = config.validators.len(),
        rules = config.rules.len(),
        "configuration loaded"
    );

    let cache = new_cache(
        settings::cache_expiry_seconds(),
        &server_settings.redis_cert_dir,
    )
    .await;

    let kube_client = match kube::Client::try_default().await {
        Ok(client) => Some(client),
        Err(e) => {
            warn!(error = %e, "cannot connect to Kubernetes cluster, automatic child approval will not work");
            None
        }
    };

    let state = Arc::new(AppState {
        config,
        cache,
        kube_client,
    });

    let tls_config = RustlsConfig::from_pem_file(
        &server_settings.cert_file,
        &server_settings.key_file,
    )
    .await
    .map_err(|e| anyhow!("cannot load TLS certificate: {e}"))?;

    info!(address = %server_settings.addr, "started HTTPS server");
    axum_server::bind_rustls(server_settings.addr, tls_config)
        .serve(api::router(state).into_make_service())
        .await
        .map_err(|e| anyhow!("HTTPS server error: {e}"))
}
