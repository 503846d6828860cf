use imageproxy::assets::StaticAssets;
use imageproxy::cache::CacheStore;
use imageproxy::config::Config;
use imageproxy::dispatcher::{self, AppState, RequestContext, Response};
use imageproxy::fetcher::FetchContext;
use imageproxy::registry::Registry;
use imageproxy::resize::ResizePool;
use imageproxy::wire::{self, Method};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::time::{timeout, Duration};

const CONNECTION_TIMEOUT_SECS: u64 = 30;
const KEEPALIVE_TIMEOUT_SECS: u64 = 5;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    let state = Arc::new(build_state(&config));

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.listen_port))
        .await
        .expect("failed to bind to listen address");

    tracing::info!(port = config.listen_port, "imageproxy listening");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let _ = stream.set_nodelay(true);
                        let state = Arc::clone(&state);
                        tokio::spawn(handle_connection(stream, state));
                    }
                    Err(_) => continue,
                }
            }
            _ = shutdown_signal() => {
                tracing::info!("shutdown signal received");
                SHUTDOWN.store(true, Ordering::Relaxed);
                break;
            }
        }
    }
}

fn build_state(config: &Config) -> AppState {
    let worker_binary = resize_worker_path();
    let fetch_ctx = FetchContext {
        client: reqwest::Client::builder()
            .timeout(config.upstream_timeout)
            .build()
            .expect("failed to build upstream HTTP client"),
        cache: CacheStore::new(config.cache_root.clone()),
        resize_pool: ResizePool::spawn(worker_binary, config.resize_pool_size, config.resize_recycle_count),
        temp_dir: config.cache_root.join("tmp"),
        max_size_bytes: config.max_size_bytes,
        upstream_timeout: config.upstream_timeout,
    };

    AppState {
        cache: CacheStore::new(config.cache_root.clone()),
        registry: Registry::new(),
        fetch_ctx,
        assets: StaticAssets::load(&config.asset_dir),
        referer_allow: config.referer_allow.clone(),
        uncache_hosts: config.uncache_hosts.clone(),
    }
}

/// Resolves the sibling `resize-worker` binary next to the running
/// executable; falls back to a bare name lookup on `$PATH` if the current
/// executable's path can't be determined.
fn resize_worker_path() -> std::path::PathBuf {
    match std::env::current_exe() {
        Ok(exe) => exe.with_file_name("resize-worker"),
        Err(_) => std::path::PathBuf::from("resize-worker"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn handle_connection(mut stream: TcpStream, state: Arc<AppState>) {
    let result = timeout(
        Duration::from_secs(CONNECTION_TIMEOUT_SECS),
        handle_connection_inner(&mut stream, &state),
    )
    .await;

    if result.is_err() {
        let _ = wire::write_internal_error(&mut stream).await;
    }
}

async fn handle_connection_inner(stream: &mut TcpStream, state: &Arc<AppState>) -> std::io::Result<()> {
    let mut line_buf = String::with_capacity(128);

    loop {
        if SHUTDOWN.load(Ordering::Relaxed) {
            break;
        }

        let mut reader = BufReader::new(&mut *stream);
        let parsed = match timeout(
            Duration::from_secs(KEEPALIVE_TIMEOUT_SECS),
            wire::read_request(&mut reader, &mut line_buf),
        )
        .await
        {
            Ok(Ok(Some(req))) => req,
            Ok(Ok(None)) | Err(_) => break,
            Ok(Err(_)) => break,
        };

        if parsed.path.is_empty() {
            // Blank keep-alive line; wait for the next request.
            continue;
        }

        if parsed.method == Method::Other {
            wire::write_method_not_allowed(stream).await?;
            break;
        }
        let is_head = parsed.method == Method::Head;
        let keep_alive = parsed.keep_alive;

        let req = RequestContext {
            path: &parsed.path,
            referer: parsed.referer.as_deref(),
            if_modified_since: parsed.if_modified_since.as_deref(),
            if_none_match: parsed.if_none_match.as_deref(),
        };

        match dispatcher::dispatch(state, req).await {
            Response::Ok { headers, body } => {
                wire::write_ok(
                    stream,
                    is_head,
                    &headers.content_type,
                    &headers.last_modified,
                    &headers.etag,
                    &headers.cache_control,
                    &body,
                )
                .await?;
            }
            Response::NotModified { etag, last_modified } => {
                wire::write_not_modified(stream, &etag, &last_modified).await?;
            }
            Response::Redirect { location } => {
                wire::write_redirect(stream, &location).await?;
            }
            Response::NotFound => {
                wire::write_not_found(stream).await?;
            }
            Response::InternalError => {
                wire::write_internal_error(stream).await?;
            }
        }

        if !keep_alive {
            break;
        }
    }

    Ok(())
}
