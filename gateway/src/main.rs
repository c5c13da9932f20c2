use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use tracing::trace;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gatehouse_common::backends::cache::{CacheBackend, InMemoryCache, RedisCache};
use gatehouse_common::claims::TokenKeys;
use gatehouse_common::secrets::ConfigCipher;
use gatehouse_gateway::api::{self, ApiBuilder};
use gatehouse_gateway::args::Args;
use gatehouse_gateway::dal::Sqlite;
use gatehouse_gateway::router::{Downstream, ServiceRouter};
use gatehouse_gateway::service::GatewayService;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let fmt_layer = fmt::layer();
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    trace!(args = ?args.address, "parsed args");

    let dal = Arc::new(Sqlite::new(&args.state).await);

    let backend: Arc<dyn CacheBackend> = match &args.redis_uri {
        Some(uri) => Arc::new(
            RedisCache::new(uri)
                .await
                .expect("failed to connect to the cache"),
        ),
        None => Arc::new(InMemoryCache::new()),
    };

    let router = ServiceRouter::new(HashMap::from([
        (Downstream::Auth, args.auth_uri.clone()),
        (Downstream::Sso, args.sso_uri.clone()),
        (Downstream::User, args.user_uri.clone()),
        (Downstream::Permission, args.permission_uri.clone()),
    ]));

    let tokens = TokenKeys::from_secret(args.jwt_secret.as_bytes());
    let cipher =
        ConfigCipher::from_base64(&args.config_key).expect("config key should be 32 bytes of base64");

    let service = Arc::new(GatewayService::init(
        dal,
        backend,
        router,
        tokens,
        cipher,
        args.audit_queue_size,
    ));

    service.probe_downstream().await;

    let router = ApiBuilder::new().with_service(service).into_router();

    api::serve(router, args.address).await;
}
