use std::net::SocketAddr;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// Address to bind the gateway to
    #[clap(long, default_value = "127.0.0.1:8008")]
    pub address: SocketAddr,
    /// Path to the sqlite file backing the configuration store
    #[clap(long, default_value = "./gateway.sqlite")]
    pub state: String,
    /// Redis URL for the shared cache; the gateway falls back to a
    /// process-local cache when this is not set
    #[clap(long)]
    pub redis_uri: Option<String>,
    /// Secret used to sign and verify bearer tokens
    #[clap(long)]
    pub jwt_secret: String,
    /// Base64 encoded 32 byte key sealing per-application OAuth credentials
    #[clap(long)]
    pub config_key: String,
    /// Base URL of the auth service
    #[clap(long, default_value = "http://localhost:8001")]
    pub auth_uri: String,
    /// Base URL of the SSO service
    #[clap(long, default_value = "http://localhost:8002")]
    pub sso_uri: String,
    /// Base URL of the user service
    #[clap(long, default_value = "http://localhost:8003")]
    pub user_uri: String,
    /// Base URL of the permission service
    #[clap(long, default_value = "http://localhost:8004")]
    pub permission_uri: String,
    /// Capacity of the audit write queue
    #[clap(long, default_value = "1024")]
    pub audit_queue_size: usize,
}
