//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use submap_core::{ScheduleSource, DEFAULT_CHUNK_SIZE, DEFAULT_IDENTITY_FIELD, DEFAULT_MAX_CONCURRENT_RUNS};

/// Subscription migration service command line arguments.
#[derive(Debug, Parser)]
#[command(name = "submap-server")]
#[command(about = "HTTP service for migrating subscriptions between messagesets")]
pub struct Args {
    /// Address to listen on for HTTP requests.
    #[arg(short, long, env = "SUBMAP_LISTEN", default_value = "0.0.0.0:8000")]
    pub listen: String,

    /// SQLite URL of the run store.
    #[arg(long, env = "SUBMAP_DATABASE_URL", default_value = "sqlite://submap.db")]
    pub database_url: String,

    /// PostgreSQL URL of the database holding the identity tables.
    #[arg(long, env = "SUBMAP_IDENTITY_DATABASE_URL")]
    pub identity_database_url: String,

    /// Maximum connections to the identity database.
    #[arg(long, env = "SUBMAP_IDENTITY_MAX_CONNECTIONS", default_value_t = 4)]
    pub identity_max_connections: u32,

    /// Base URL of the stage-based messaging API.
    #[arg(long, env = "SUBMAP_SBM_URL")]
    pub sbm_url: String,

    /// Token for the stage-based messaging API.
    #[arg(long, env = "SUBMAP_SBM_TOKEN", hide_env_values = true)]
    pub sbm_token: Option<String>,

    /// Base URL of the RapidPro instance.
    #[arg(long, env = "SUBMAP_RAPIDPRO_URL")]
    pub rapidpro_url: String,

    /// Token for the RapidPro API.
    #[arg(long, env = "SUBMAP_RAPIDPRO_TOKEN", hide_env_values = true)]
    pub rapidpro_token: Option<String>,

    /// RapidPro contact field holding the identity key.
    #[arg(long, env = "SUBMAP_RAPIDPRO_IDENTITY_FIELD", default_value = DEFAULT_IDENTITY_FIELD)]
    pub rapidpro_identity_field: String,

    /// Tokens accepted on the API, comma separated.
    #[arg(long, env = "SUBMAP_API_TOKENS", value_delimiter = ',', hide_env_values = true)]
    pub api_tokens: Vec<String>,

    /// Rows fetched per identity cursor round trip.
    #[arg(long, env = "SUBMAP_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Maximum migration runs executing at once.
    #[arg(long, env = "SUBMAP_MAX_CONCURRENT_RUNS", default_value_t = DEFAULT_MAX_CONCURRENT_RUNS)]
    pub max_concurrent_runs: usize,

    /// JSON file with the sequence mapping rules.
    #[arg(long, env = "SUBMAP_MAPPING_FILE")]
    pub mapping_file: Option<PathBuf>,

    /// Timeout (ms) for requests to the remote services.
    #[arg(long, env = "SUBMAP_HTTP_TIMEOUT_MS", default_value_t = 30_000)]
    pub http_timeout_ms: u64,

    /// Messageset whose default schedule a reverted subscription gets (target or source).
    #[arg(long, env = "SUBMAP_OPTOUT_SCHEDULE", default_value = "target")]
    pub optout_schedule: ScheduleSource,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, env = "SUBMAP_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on for HTTP requests.
    pub listen_addr: String,
    /// SQLite URL of the run store.
    pub database_url: String,
    /// PostgreSQL URL of the identity database.
    pub identity_database_url: String,
    /// Maximum connections to the identity database.
    pub identity_max_connections: u32,
    pub sbm_url: String,
    pub sbm_token: Option<String>,
    pub rapidpro_url: String,
    pub rapidpro_token: Option<String>,
    /// RapidPro contact field holding the identity key.
    pub rapidpro_identity_field: String,
    /// Tokens accepted on the API. Empty rejects every API request.
    pub api_tokens: Vec<String>,
    /// Rows fetched per identity cursor round trip.
    pub chunk_size: usize,
    /// Maximum migration runs executing at once.
    pub max_concurrent_runs: usize,
    /// JSON file with the sequence mapping rules.
    pub mapping_file: Option<PathBuf>,
    /// Timeout for requests to the remote services.
    pub http_timeout: Duration,
    /// Default schedule used by reverted subscriptions.
    pub optout_schedule: ScheduleSource,
}

impl ServerConfig {
    /// Whether a presented API token is accepted.
    pub fn accepts_token(&self, token: &str) -> bool {
        !token.is_empty() && self.api_tokens.iter().any(|t| t == token)
    }
}

impl From<&Args> for ServerConfig {
    fn from(args: &Args) -> Self {
        Self {
            listen_addr: args.listen.clone(),
            database_url: args.database_url.clone(),
            identity_database_url: args.identity_database_url.clone(),
            identity_max_connections: args.identity_max_connections,
            sbm_url: args.sbm_url.clone(),
            sbm_token: args.sbm_token.clone(),
            rapidpro_url: args.rapidpro_url.clone(),
            rapidpro_token: args.rapidpro_token.clone(),
            rapidpro_identity_field: args.rapidpro_identity_field.clone(),
            api_tokens: args
                .api_tokens
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            chunk_size: args.chunk_size.max(1),
            max_concurrent_runs: args.max_concurrent_runs.max(1),
            mapping_file: args.mapping_file.clone(),
            http_timeout: Duration::from_millis(args.http_timeout_ms),
            optout_schedule: args.optout_schedule,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8000".to_string(),
            database_url: "sqlite://submap.db".to_string(),
            identity_database_url: "postgres://localhost/identities".to_string(),
            identity_max_connections: 4,
            sbm_url: "http://localhost:8001/api/v1/".to_string(),
            sbm_token: None,
            rapidpro_url: "http://localhost:8002/".to_string(),
            rapidpro_token: None,
            rapidpro_identity_field: DEFAULT_IDENTITY_FIELD.to_string(),
            api_tokens: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent_runs: DEFAULT_MAX_CONCURRENT_RUNS,
            mapping_file: None,
            http_timeout: Duration::from_secs(30),
            optout_schedule: ScheduleSource::Target,
        }
    }
}
