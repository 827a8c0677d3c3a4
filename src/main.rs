use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use governance_gateway::{
    AppState, cache::RedisHandle, config::Config, governance::GovernanceService, router,
};
#[cfg(debug_assertions)]
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // 初始化日志
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 加载配置
    let config = Config::from_env().expect("Failed to load configuration");

    #[cfg(debug_assertions)]
    tracing::info!("Running in debug mode with CORS enabled");

    #[cfg(not(debug_assertions))]
    tracing::info!("Running in production mode with CORS disabled");

    // 设置 Redis 客户端，未配置或地址无效时只用进程内后端
    let redis = match config.redis_url.as_deref() {
        Some(url) => match redis::Client::open(url) {
            Ok(client) => Some(RedisHandle::new(client, config.store_timeout())),
            Err(e) => {
                tracing::warn!("Invalid REDIS_URL, using in-process backends only: {}", e);
                None
            }
        },
        None => {
            tracing::info!("REDIS_URL not set, using in-process backends only");
            None
        }
    };

    // 治理服务与后台任务
    let governance = Arc::new(GovernanceService::new(&config, redis));
    let _workers = governance.spawn_workers();

    let state = AppState::new(config.clone(), governance);
    let router = router::create_router(state);

    // 根据编译模式决定是否添加CORS
    #[cfg(debug_assertions)]
    let router = {
        tracing::debug!("Adding CORS layer for development mode");
        router.layer(CorsLayer::permissive())
    };

    // 启动服务器
    let addr = SocketAddr::new(
        config.server_host.parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid server_host, falling back to dual-stack default");
            IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
        }),
        config.server_port,
    );
    tracing::info!("Server listening on {}", addr);
    axum::serve(
        tokio::net::TcpListener::bind(&addr)
            .await
            .expect("Failed to bind"),
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Failed to start server");
}
