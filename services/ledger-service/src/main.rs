use actix_web::{middleware, web, App, HttpServer};
use dotenv::dotenv;
use ledger_service::{
    cache::{LedgerCache, RedisCache},
    config::Config,
    database::Database,
    handlers,
    lock::{DistributedLock, LockOptions, RedisLock},
    services::LedgerService,
};
use redis::aio::ConnectionManager;
use std::io;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn startup_error(context: &str, err: impl std::fmt::Display) -> io::Error {
    error!("{}: {}", context, err);
    io::Error::new(io::ErrorKind::Other, format!("{}: {}", context, err))
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenv().ok();

    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false)
        .json()
        .init();

    let config = Config::from_env().map_err(|e| startup_error("Failed to load configuration", e))?;
    config
        .validate()
        .map_err(|e| startup_error("Invalid configuration", e))?;

    info!("Starting Ledger Service on port {}", config.server.port);

    let db = Arc::new(
        Database::connect_with_retry(&config.database)
            .await
            .map_err(|e| startup_error("Failed to connect to database", e))?,
    );

    let redis_client = redis::Client::open(config.redis.url.clone())
        .map_err(|e| startup_error("Failed to create Redis client", e))?;
    let redis_conn = ConnectionManager::new(redis_client)
        .await
        .map_err(|e| startup_error("Failed to connect to Redis", e))?;

    let cache = LedgerCache::new(Arc::new(RedisCache::new(redis_conn.clone())), &config.ledger);
    let lock = DistributedLock::new(
        Arc::new(RedisLock::new(redis_conn)),
        LockOptions::from(&config.lock),
    );

    let ledger_service = Arc::new(LedgerService::new(
        db,
        cache,
        lock,
        config.ledger.clone(),
    ));

    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::trim())
            .app_data(web::Data::new(ledger_service.clone()))
            .configure(handlers::configure_routes)
    })
    .workers(config.server.workers)
    .bind((config.server.host.as_str(), config.server.port))?
    .run()
    .await
}
