use actix_web::{web, App, HttpServer};
use crypto_core::jwt as core_jwt;
use secure_messaging_service::{
    config, db, error, logging, routes,
    state::AppState,
    store::{MemoryStore, PgStore},
};
use std::sync::Arc;

#[actix_web::main]
async fn main() -> Result<(), error::AppError> {
    logging::init_tracing();
    let cfg = Arc::new(config::Config::from_env()?);

    core_jwt::initialize_jwt_secret(&cfg.jwt_secret)
        .map_err(|e| error::AppError::StartServer(format!("jwt: {e}")))?;

    let state = match &cfg.database {
        Some(db_cfg) => {
            let pool = db::init_pool(db_cfg)
                .await
                .map_err(|e| error::AppError::StartServer(format!("db: {e}")))?;
            db::run_migrations(&pool)
                .await
                .map_err(|e| error::AppError::StartServer(format!("migrations: {e}")))?;

            let store = Arc::new(PgStore::new(pool, db_cfg.sealing_key.clone()));
            AppState::build(cfg.clone(), store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store; state is lost on restart");
            AppState::build(cfg.clone(), Arc::new(MemoryStore::new()))
        }
    };

    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    tracing::info!(
        %bind_addr,
        ping_interval_secs = cfg.websocket.ping_interval.as_secs(),
        client_timeout_secs = cfg.websocket.client_timeout.as_secs(),
        "starting secure-messaging-service"
    );

    HttpServer::new(move || {
        App::new()
            .wrap(actix_middleware::Logging)
            .app_data(web::Data::new(state.clone()))
            .configure(routes::configure)
    })
    .bind(&bind_addr)
    .map_err(|e| error::AppError::StartServer(format!("bind REST: {e}")))?
    .run()
    .await
    .map_err(|e| error::AppError::StartServer(format!("REST server: {e}")))
}
