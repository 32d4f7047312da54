use crate::{
    app_state::AppState,
    configuration::{DatabaseSettings, Settings, StoreBackend},
    ingest::EventIngestor,
    orchestrator::CampaignOrchestrator,
    request_id::RequestUuid,
    routes::{admin, health_check, tracking, unsubscribe, webhooks},
    store::{MemoryStore, PgStore, Store},
    telemetry::request_span,
    tracking_links::TrackingLinks,
};
use axum::{serve::Serve, Router};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{request_id::PropagateRequestIdLayer, trace::TraceLayer, ServiceBuilderExt};

pub struct Application {
    local_addr: SocketAddr,
    server: Serve<Router, Router>,
}

impl Application {
    pub async fn build(config: Settings) -> Result<Self, anyhow::Error> {
        let store = build_store(&config.database).await?;
        Self::build_with_store(config, store).await
    }

    /// Binds the listener and wires the routes on top of an existing store,
    /// so the API and the scheduler worker can share one backend.
    pub async fn build_with_store(
        config: Settings,
        store: Arc<dyn Store>,
    ) -> Result<Self, anyhow::Error> {
        let address = format!("{}:{}", config.application.host, config.application.port);
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;

        let app_state = AppState {
            orchestrator: build_orchestrator(&config, Arc::clone(&store))?,
            ingestor: EventIngestor::new(store),
            links: TrackingLinks::new(&config.application.base_url)?,
            webhook_secret: config.application.webhook_secret,
        };

        let router = Router::new()
            .merge(health_check::router())
            .merge(tracking::router())
            .merge(unsubscribe::router())
            .merge(webhooks::router())
            .merge(admin::router())
            .layer(
                ServiceBuilder::new()
                    .set_x_request_id(RequestUuid)
                    .layer(TraceLayer::new_for_http().make_span_with(request_span))
                    .layer(PropagateRequestIdLayer::x_request_id()),
            )
            .with_state(app_state);

        tracing::info!("Listening on {local_addr}");
        let server = axum::serve(listener, router);

        Ok(Self { local_addr, server })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn run_until_stopped(self) -> Result<(), std::io::Error> {
        self.server.await
    }
}

pub fn get_connection_pool(config: &DatabaseSettings) -> PgPool {
    PgPoolOptions::new().connect_lazy_with(config.with_db())
}

pub async fn build_store(config: &DatabaseSettings) -> Result<Arc<dyn Store>, anyhow::Error> {
    match config.backend {
        StoreBackend::Postgres => {
            let store = PgStore::new(get_connection_pool(config));
            store.migrate().await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store, nothing will survive a restart");
            Ok(Arc::new(MemoryStore::default()))
        }
    }
}

pub fn build_orchestrator(
    config: &Settings,
    store: Arc<dyn Store>,
) -> Result<CampaignOrchestrator, anyhow::Error> {
    Ok(CampaignOrchestrator::new(
        store,
        config.email_client.client()?,
        TrackingLinks::new(&config.application.base_url)?,
        config.delivery.concurrency,
    ))
}
