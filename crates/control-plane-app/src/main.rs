use std::env;
use std::sync::Arc;

use actix_web::{middleware, App, HttpServer};
use dotenvy::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;

use control_plane_api::api;
use control_plane_api::bootstrap::ControlPlaneServer;
use control_plane_core::config::ControlPlaneConfig;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if env::var("LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = ControlPlaneConfig::from_env()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    let server = if env::var("IN_MEMORY_BACKENDS").as_deref() == Ok("1") {
        info!("using in-memory backends");
        Arc::new(ControlPlaneServer::build_in_memory(config))
    } else {
        Arc::new(
            ControlPlaneServer::build(config)
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?,
        )
    };

    server.start().await;
    info!(addr = %bind_addr, "control plane listening");

    let app_state = server.app_state();
    let http = HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .wrap(middleware::Logger::default())
            .configure(api::init_routes)
    })
    .bind(&bind_addr)?
    .run();

    let result = http.await;

    server.shutdown().await;
    result
}
