pub mod constants;
pub mod error;
pub mod models;
pub mod modules;
pub mod proxy;
#[cfg(test)]
mod test_utils;
pub mod utils;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use error::{AppError, AppResult};
use modules::system::{config as system_config, logger};
use proxy::state::CoreServices;

async fn start_runtime() -> AppResult<()> {
    let mut config = system_config::load_app_config().map_err(AppError::Config)?;
    system_config::apply_env_overrides(&mut config);

    let db_path = std::path::PathBuf::from(&config.database.path);
    modules::persistence::db::init_db(&db_path).map_err(AppError::Config)?;

    if config.admin_key.is_empty() {
        warn!("[W-ADMIN-KEY-EMPTY] admin_routes_disabled_set_ADMIN_KEY_to_enable");
    }

    let config = Arc::new(config);
    let core = Arc::new(CoreServices::build(config.clone()));

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Gateway listening on {}", bind_addr);

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(proxy::server::serve(
        core.clone(),
        listener,
        shutdown.clone(),
    ));

    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received, draining in-flight requests");
    shutdown.cancel();

    let grace = std::time::Duration::from_secs(config.shutdown_grace_secs);
    match tokio::time::timeout(grace, server).await {
        Ok(Ok(Ok(()))) => info!("Server stopped cleanly"),
        Ok(Ok(Err(e))) => warn!("[W-RUNTIME-STOP] server_stopped_with_error: {}", e),
        Ok(Err(e)) => warn!("[W-RUNTIME-STOP] server_task_panicked: {}", e),
        Err(_) => warn!(
            "[W-RUNTIME-STOP] drain_deadline_exceeded_after_{}s",
            config.shutdown_grace_secs
        ),
    }
    Ok(())
}

pub fn run() {
    logger::init_logger();

    let runtime = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    runtime.block_on(async {
        if let Err(e) = start_runtime().await {
            error!("[E-RUNTIME-STARTUP] {}", e);
            std::process::exit(1);
        }
    });
}
