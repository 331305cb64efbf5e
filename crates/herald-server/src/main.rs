//! Herald server binary.
//!
//! Boot order matters: the listener must accept connections before the task
//! store rehydrates, because those reads loop back through the proxy itself.

use herald::config::{EnvConfig, GlobalConfig, Registry};
use herald::keystone::{KeystoneClient, TOKEN_REFRESH_INTERVAL, TokenStore};
use herald::mirror::MirrorEngine;
use herald::task_store::{SNAPSHOT_INTERVAL, StorageLocks, TaskStore, WORKER_CONTEXT_REFRESH_INTERVAL};
use herald::{HeraldContext, HeraldService, HeraldServiceBuilder, RemoteAddr};

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "herald-server", about = "S3 mirroring reverse proxy")]
struct Opt {
    /// Path to the config document.
    #[arg(long, default_value = "herald.json")]
    config: PathBuf,

    /// Overrides the configured listen port.
    #[arg(long)]
    port: Option<u16>,
}

fn setup_tracing(env: &EnvConfig) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&env.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::parse();
    let env = EnvConfig::from_env()?;
    setup_tracing(&env);

    let mut config = GlobalConfig::load(&opt.config)?;
    if let Some(port) = opt.port {
        config.port = port;
    }
    let registry = Registry::resolve(&config)?;
    info!(env = %env.env, port = config.port, "starting herald");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .connect_timeout(Duration::from_secs(10))
        .build()?;

    let keystone = KeystoneClient::new(client.clone());
    let tokens = Arc::new(TokenStore::new(registry.swift_configs(), keystone.clone()));
    tokens.initialize().await;

    let resolvers = herald::backend::Resolvers::new(client.clone());
    let engine = Arc::new(MirrorEngine::new(&registry));
    let locks = StorageLocks::new();
    let task_store = Arc::new(TaskStore::new(config.port, client.clone()));

    let port = config.port;
    let k8s_api = env.k8s_api.clone();
    let ctx = HeraldContext {
        config,
        registry,
        tokens: Arc::clone(&tokens),
        engine: Arc::clone(&engine),
        locks: locks.clone(),
        resolvers: resolvers.clone(),
    };
    let mut builder = HeraldServiceBuilder::new(ctx);
    if let Some(ref k8s_api) = k8s_api {
        builder.set_service_account_verifier(herald::auth::ServiceAccountVerifier::new(
            k8s_api,
            client.clone(),
        ));
    }
    let service = builder.build();

    engine.start(&resolvers, &keystone, &locks, &tokens.to_serializable());

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    spawn_rehydrate(Arc::clone(&task_store), Arc::clone(&engine), locks.clone());
    spawn_timers(Arc::clone(&task_store), Arc::clone(&engine), locks, Arc::clone(&tokens));

    serve(listener, service).await;
    Ok(())
}

/// Restores queues and locks from the task store once the listener is up.
fn spawn_rehydrate(task_store: Arc<TaskStore>, engine: Arc<MirrorEngine>, locks: StorageLocks) {
    tokio::spawn(async move {
        if let Err(err) = task_store.sync_from_remote(&engine, &locks).await {
            error!(?err, "task store rehydration failed");
        }
    });
}

fn spawn_timers(
    task_store: Arc<TaskStore>,
    engine: Arc<MirrorEngine>,
    locks: StorageLocks,
    tokens: Arc<TokenStore>,
) {
    {
        let tokens = Arc::clone(&tokens);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(TOKEN_REFRESH_INTERVAL);
            timer.tick().await;
            loop {
                timer.tick().await;
                tokens.refresh().await;
                info!("keystone tokens refreshed");
            }
        });
    }
    {
        let engine = Arc::clone(&engine);
        let tokens = Arc::clone(&tokens);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(WORKER_CONTEXT_REFRESH_INTERVAL);
            timer.tick().await;
            loop {
                timer.tick().await;
                engine.broadcast_context(&tokens.to_serializable()).await;
            }
        });
    }
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(SNAPSHOT_INTERVAL);
        timer.tick().await;
        loop {
            timer.tick().await;
            if let Err(err) = task_store.sync_to_remote(&engine, &locks).await {
                error!(?err, "task store snapshot failed");
            }
        }
    });
}

async fn serve(listener: TcpListener, service: HeraldService) {
    let http_server = ConnBuilder::new(TokioExecutor::new());
    let graceful = hyper_util::server::graceful::GracefulShutdown::new();
    let mut ctrl_c = std::pin::pin!(tokio::signal::ctrl_c());

    loop {
        let (stream, remote_addr) = tokio::select! {
            result = listener.accept() => match result {
                Ok(conn) => conn,
                Err(err) => {
                    error!(?err, "error accepting connection");
                    continue;
                }
            },
            _ = ctrl_c.as_mut() => {
                info!("shutdown signal received");
                break;
            }
        };

        let service = service.clone();
        let remote_ip = remote_addr.ip();
        let conn_service = hyper::service::service_fn(move |mut req: herald::service::HttpRequest| {
            req.extensions_mut().insert(RemoteAddr(remote_ip));
            let service = service.clone();
            async move { Ok::<_, std::convert::Infallible>(service.call(req).await) }
        });

        let conn = http_server.serve_connection(TokioIo::new(stream), conn_service);
        let conn = graceful.watch(conn.into_owned());
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                error!(?err, "error serving connection");
            }
        });
    }

    tokio::select! {
        () = graceful.shutdown() => {
            info!("gracefully shut down");
        }
        () = tokio::time::sleep(Duration::from_secs(10)) => {
            info!("graceful shutdown timed out, aborting");
        }
    }
}
