//! Valhalla Storefront - order fulfillment service for digital goods

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use valhalla_storefront::api::{router, AppState};
use valhalla_storefront::config::Config;
use valhalla_storefront::infrastructure::events::{NatsPublisher, TracingPublisher};
use valhalla_storefront::infrastructure::{memory::in_memory_backends, postgres::postgres_backends};
use valhalla_storefront::ports::EventPublisher;
use valhalla_storefront::services::Storefront;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())).with(tracing_subscriber::fmt::layer()).init();

    let events: Arc<dyn EventPublisher> = match &config.nats_url {
        Some(url) => match async_nats::connect(url.as_str()).await {
            Ok(client) => {
                info!(%url, "publishing domain events to NATS");
                Arc::new(NatsPublisher::new(client))
            }
            Err(e) => {
                warn!(%url, error = %e, "NATS unavailable, domain events will only be logged");
                Arc::new(TracingPublisher)
            }
        },
        None => Arc::new(TracingPublisher),
    };

    let backends = match &config.database_url {
        Some(url) => {
            let db = PgPoolOptions::new().max_connections(config.database_max_connections).connect(url).await.context("Failed to connect to DATABASE_URL")?;
            sqlx::migrate!("./migrations").run(&db).await.context("Failed to run migrations")?;
            info!(max_connections = config.database_max_connections, "using PostgreSQL storage");
            postgres_backends(db, events)
        }
        None => {
            warn!("DATABASE_URL not set, using in-memory storage; data is lost on restart");
            in_memory_backends(events)
        }
    };

    info!(
        premium_product_id = %config.lifecycle.premium_product_id,
        refund_multiplier = %config.lifecycle.refund_multiplier,
        coin_value_usd = %config.loyalty.coin_value_usd,
        "loyalty and lifecycle settings loaded"
    );
    let storefront = Storefront::new(backends, config.loyalty, config.lifecycle);
    let app = router(AppState { storefront });

    info!("Valhalla Storefront listening on 0.0.0.0:{}", config.port);
    axum::serve(tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?, app).await?;
    Ok(())
}
