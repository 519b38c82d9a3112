use mimalloc::MiMalloc;
use pg_provisioner::config::Config;
use pg_provisioner::db::ObjectStore;
use pg_provisioner::engine::PgAdmin;
use pg_provisioner::router::{ProvisionerState, provisioner_router};
use pg_provisioner::service::dispatcher::{self, DispatcherArgs};
use pg_provisioner::service::reconciler::{ReconcileSettings, Reconciler};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let cfg = Config::load()?;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.basic.loglevel.clone()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(false),
        )
        .init();

    info!(
        database_url = %cfg.basic.database_url,
        postgres_host = %cfg.postgres.host,
        postgres_port = cfg.postgres.port,
        advertised_host = %cfg.postgres.public_host(),
        workers = cfg.reconciler.workers,
        loglevel = %cfg.basic.loglevel,
    );

    if cfg.basic.api_key.is_empty() {
        warn!("basic.api_key is not set; the admin API will reject every request");
    }

    let store = ObjectStore::open(&cfg.basic.database_url).await?;
    let engine = PgAdmin::connect(&cfg.postgres).await?;

    let reconciler = Arc::new(Reconciler::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(engine),
        ReconcileSettings::from_config(&cfg),
    ));
    let (handle, dispatcher_join) = dispatcher::spawn(DispatcherArgs::new(
        reconciler,
        Arc::new(store.clone()),
        &cfg.reconciler,
    ))
    .await?;

    let state = ProvisionerState::new(store, cfg.basic.api_key.clone());
    let app = provisioner_router(state);

    let listener = TcpListener::bind(&cfg.basic.listen_addr).await?;
    info!("HTTP server listening on {}", cfg.basic.listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    handle.stop();
    let _ = dispatcher_join.await;
    Ok(())
}
