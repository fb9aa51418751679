//! Subscription migration HTTP service binary.

use std::sync::Arc;

use clap::Parser;
use submap_client::{ClientConfig, RapidProClient, StageBasedMessagingClient};
use submap_core::{
    Dispatcher, MigrationTask, OptoutService, PgIdentitySource, RunStore, SequenceMapper,
    SubscriptionGateway, TaskConfig,
};
use submap_server::{create_router, AppState, Args, ServerConfig};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --log-level
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .init();

    let config = ServerConfig::from(&args);

    info!(
        listen = %config.listen_addr,
        run_store = %config.database_url,
        sbm = %config.sbm_url,
        rapidpro = %config.rapidpro_url,
        "Starting subscription migration service"
    );

    if config.api_tokens.is_empty() {
        warn!("No API tokens configured, every API request will be rejected");
    }

    let store = RunStore::connect(&config.database_url).await?;
    let source = PgIdentitySource::connect(
        &config.identity_database_url,
        config.identity_max_connections,
    )
    .await?;
    info!(
        max_connections = config.identity_max_connections,
        "Connected to identity database"
    );

    let mut sbm_config = ClientConfig::new(&config.sbm_url).with_timeout(config.http_timeout);
    if let Some(token) = &config.sbm_token {
        sbm_config = sbm_config.with_token(token);
    }
    let gateway: Arc<dyn SubscriptionGateway> =
        Arc::new(StageBasedMessagingClient::new(sbm_config)?);

    let mut rapidpro_config =
        ClientConfig::new(&config.rapidpro_url).with_timeout(config.http_timeout);
    if let Some(token) = &config.rapidpro_token {
        rapidpro_config = rapidpro_config.with_token(token);
    }
    let directory = Arc::new(RapidProClient::new(rapidpro_config)?);

    let mapper = match &config.mapping_file {
        Some(path) => {
            let mapper = SequenceMapper::load(path)?;
            info!(path = %path.display(), rules = mapper.len(), "Loaded sequence mapping rules");
            mapper
        }
        None => {
            warn!("No mapping file configured, every migration will fail to map sequences");
            SequenceMapper::new()
        }
    };
    let mapper = Arc::new(mapper);

    let task = MigrationTask::new(
        store.clone(),
        Arc::new(source),
        gateway.clone(),
        mapper.clone(),
    )
    .with_config(TaskConfig::default().with_chunk_size(config.chunk_size));
    let dispatcher = Dispatcher::new(task, config.max_concurrent_runs);

    let optout = OptoutService::new(store, gateway.clone(), directory, mapper)
        .with_identity_field(config.rapidpro_identity_field.clone())
        .with_schedule_source(config.optout_schedule);

    let listen_addr = config.listen_addr.clone();
    let state = AppState::new(dispatcher, optout, gateway, config);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    info!("Listening on {}", listen_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
