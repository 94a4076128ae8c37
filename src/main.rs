mod config;
mod error;
mod handlers;
mod middleware;
mod models;
mod utils;

use std::io;

use actix_cors::Cors;
use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::{middleware::Logger, web, App, HttpServer};
use dotenv::dotenv;

use config::{AppState, Config};
use middleware::Authentication;
use utils::email::Mailer;

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenv().ok();
    env_logger::init();

    let config = Config::from_env().expect("Invalid configuration");
    config::set_environment(config.environment);

    let db = config::init_database(&config)
        .await
        .expect("Failed to connect to database");

    let port = config.port;
    let frontend_url = config.frontend_url.clone();
    log::info!(
        "Starting natours-api in {:?} mode on port {}",
        config.environment,
        port
    );

    let state = web::Data::new(AppState {
        db,
        mailer: Mailer::from_settings(&config.email),
        config,
    });

    // 100 requests per hour per IP
    let governor_conf = GovernorConfigBuilder::default()
        .per_second(36)
        .burst_size(100)
        .finish()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Invalid rate limit"))?;

    HttpServer::new(move || {
        let mut cors = Cors::default()
            .allowed_origin("http://localhost:3000")
            .allowed_origin("http://localhost:5173")
            .allow_any_method()
            .allow_any_header()
            .supports_credentials();
        if let Some(origin) = &frontend_url {
            cors = cors.allowed_origin(origin);
        }

        App::new()
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(Governor::new(&governor_conf))
            .wrap(Authentication)
            .app_data(state.clone())
            .app_data(handlers::json_config())
            .app_data(handlers::query_config())
            .configure(handlers::configure)
            .default_service(web::route().to(handlers::not_found))
    })
    .bind(("127.0.0.1", port))?
    .run()
    .await
}
