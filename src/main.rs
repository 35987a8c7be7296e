mod api;
mod auth;
mod config;
mod crypto;
mod db;
mod error;
mod firewall;
mod models;
mod net;
mod push;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use sqlx::sqlite::SqlitePoolOptions;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::firewall::FirewallService;
use crate::push::NotifierService;

pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub firewall: Arc<FirewallService>,
    pub notifier: Arc<NotifierService>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "wgadmin_api=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = config::Settings::from_env()?;
    let secrets = crypto::SecretBox::new(&cfg.encryption_secret);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&cfg.database_url)
        .await?;

    db::migrate(&pool).await?;

    let (firewall, apply_rx) = FirewallService::new(pool.clone(), cfg.clone());
    firewall.init().await?;

    let notifier = NotifierService::init(pool.clone(), secrets, &cfg.ssl_domain).await;
    firewall.register_block_sink(notifier.clone()).await;

    // Background tasks; all of them die with the process.
    tokio::spawn(firewall::nft::run_apply_worker(firewall.clone(), apply_rx));
    tokio::spawn(firewall::country::run_country_scheduler(firewall.clone()));
    tokio::spawn(firewall::traffic::run_traffic_monitor(firewall.clone()));
    firewall.start_enabled_jails().await?;

    // Expired-entry sweeper.
    {
        let firewall = firewall.clone();
        let interval = Duration::from_secs(cfg.cleanup_interval_min.max(1) * 60);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = firewall.sweep_expired().await {
                    tracing::warn!(error = %e, "expired-entry sweep failed");
                }
            }
        });
    }

    let state = Arc::new(AppState {
        db: pool,
        firewall,
        notifier,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        // Firewall policy
        .route("/api/fw/status", get(api::firewall::status))
        .route(
            "/api/fw/entries",
            get(api::firewall::list_entries).post(api::firewall::create_entry),
        )
        .route("/api/fw/entries/bulk", post(api::firewall::bulk))
        .route("/api/fw/entries/{id}", axum::routing::delete(api::firewall::delete_entry))
        .route("/api/fw/entries/{id}/toggle", post(api::firewall::toggle_entry))
        .route(
            "/api/fw/entries/source/{src}",
            axum::routing::delete(api::firewall::delete_by_source),
        )
        .route(
            "/api/fw/blocklists",
            get(api::blocklists::list).post(api::blocklists::import),
        )
        // Jails
        .route("/api/fw/jails", get(api::jails::list).post(api::jails::create))
        .route(
            "/api/fw/jails/{name}",
            get(api::jails::get)
                .put(api::jails::update)
                .delete(api::jails::delete),
        )
        // Traffic + apply
        .route("/api/fw/traffic", get(api::traffic::list))
        .route("/api/fw/apply", post(api::firewall::apply))
        .route(
            "/api/fw/ssh-port",
            get(api::firewall::get_ssh_port).post(api::firewall::set_ssh_port),
        )
        // Web push
        .route("/api/auth/pwa/vapid-key", get(api::pwa::vapid_key))
        .route("/api/auth/pwa/subscribe", post(api::pwa::subscribe))
        .route("/api/auth/pwa/unsubscribe", post(api::pwa::unsubscribe))
        .route("/api/auth/pwa/subscriptions", get(api::pwa::subscriptions))
        .route(
            "/api/auth/pwa/preferences",
            get(api::pwa::get_preferences).post(api::pwa::set_preferences),
        )
        .route("/api/auth/pwa/test", post(api::pwa::test_send))
        // Middleware
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", cfg.listen_port);
    tracing::info!("Starting wgadmin-api on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    })
    .await?;

    Ok(())
}
