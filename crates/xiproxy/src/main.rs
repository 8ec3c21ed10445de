use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use xiproxy::big_servant::{BigConfig, BigServant};
use xiproxy::lcache::LCache;
use xiproxy::quickie::{Quickie, XiProxyCtrl};
use xiproxy::xiservant::XiOptions;
use xiproxy::{http, logging};

/// Front-door RPC gateway: routes quests to configured backend services
/// and exposes the internal cache servants.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// Address to listen on for RPC sessions.
    #[arg(long, default_value = "0.0.0.0:9988", env = "XIPROXY_LISTEN")]
    listen: String,
    /// Address to listen on for the HTTP/JSON shim.
    #[arg(long, default_value = "0.0.0.0:9989", env = "XIPROXY_HTTP_LISTEN")]
    http_listen: String,
    /// The hot-reloaded service list file.
    #[arg(long, env = "XIPROXY_LIST_FILE")]
    list_file: std::path::PathBuf,

    /// This proxy's own address, used to spread instances across backend
    /// endpoints.
    #[arg(long, default_value = "", env = "XIPROXY_SELF_IP")]
    self_ip: String,

    /// Answer cache capacity, in entries.
    #[arg(long, default_value = "65536", env = "XIPROXY_CACHE_ENTRIES")]
    cache_entries: usize,
    /// Maximum age of answer cache entries before the reaper evicts them.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1day", env = "XIPROXY_CACHE_EXPIRE_MAX")]
    cache_expire_max: std::time::Duration,

    /// Upstream calls slower than this are logged.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
    slow_warning: std::time::Duration,
    /// Upstream calls slower than this additionally reset the upstream
    /// connection.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "66s")]
    ultra_slow: std::time::Duration,
    /// Upstream connections are reset after roughly this long to
    /// rebalance across endpoints.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1h")]
    refresh_time: std::time::Duration,

    /// Maximum number of inbound RPC connections.
    #[arg(long, default_value = "1024", env = "XIPROXY_MAX_CONNECTIONS")]
    max_connections: usize,
    /// How long to wait for a quest before closing an idle session.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5m")]
    idle_session_timeout: std::time::Duration,

    #[command(flatten)]
    log: logging::LogArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log);

    tracing::info!(list_file = %cli.list_file.display(), "starting xiproxy");

    let big = BigServant::new(
        &cli.list_file,
        BigConfig {
            rcache_entries: cli.cache_entries,
            rcache_max_age_secs: cli.cache_expire_max.as_secs().max(1),
            self_ip: cli.self_ip.clone(),
            xi_options: XiOptions {
                slow_warning_msec: cli.slow_warning.as_millis() as u64,
                ultra_slow_msec: cli.ultra_slow.as_millis() as u64,
                refresh_secs: cli.refresh_time.as_secs().max(1),
                log_errors: true,
            },
        },
    )
    .context("failed to load the service list")?;

    big.register_fixed("LCache", Arc::new(LCache::new(big.rcache())));
    big.register_fixed("Quickie", Arc::new(Quickie::new(big.clone())));
    big.register_fixed("XiProxyCtrl", Arc::new(XiProxyCtrl::new(big.clone())));
    big.clone().start_tasks();

    let cancel = tokio_util::sync::CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for CTRL-C");
        tracing::info!("received ctrl-c, shutting down");
        ctrl_c.cancel();
    });

    // HTTP shim.
    let http_listener = tokio::net::TcpListener::bind(&cli.http_listen)
        .await
        .context("failed to bind the HTTP port")?;
    let router = http::build_router(big.clone());
    tokio::spawn(async move {
        axum::serve(
            http_listener,
            router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .await
        .expect("HTTP shim server failed");
    });

    // RPC sessions.
    let listener = tokio::net::TcpListener::bind(&cli.listen)
        .await
        .context("failed to bind the RPC port")?;
    tracing::info!(listen = %cli.listen, http = %cli.http_listen, "serving");

    xic::serve(
        listener,
        big,
        xic::ServerConfig {
            max_connections: cli.max_connections,
            idle_timeout: cli.idle_session_timeout,
            ..Default::default()
        },
        cancel,
    )
    .await
}
