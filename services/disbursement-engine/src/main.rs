use actix_cors::Cors;
use actix_web::{middleware, App, HttpServer};
use anyhow::Context;
use disbursement_engine::middleware::{AccessLog, ProxyTrust};
use disbursement_engine::{config::Config, handlers, metrics, AppState};
use dotenv::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(&config.logging.level, config.logging.json);
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    metrics::register_metrics(prometheus::default_registry())
        .map_err(|e| anyhow::anyhow!("Failed to register metrics: {}", e))?;

    info!(
        "Starting Disbursement Engine on {}:{}",
        config.server.host, config.server.port
    );

    let state = AppState::from_config(&config)
        .await
        .context("Failed to initialize application state")?;

    let workers = config.server.workers.max(1);
    let proxy_trust = ProxyTrust(config.server.trust_forwarded_headers);
    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .app_data(proxy_trust)
            .wrap(cors)
            .wrap(AccessLog)
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::trim())
            .configure(|cfg| handlers::configure_routes(cfg, &state))
    })
    .workers(workers)
    .bind((config.server.host.as_str(), config.server.port))?
    .run()
    .await?;

    Ok(())
}
