//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Build the Axum router: request ids, tracing, proxy middleware
//! - Match each request against the live route table
//! - Hand upgrades on `ws` routes to the tunnel, everything else to the engine
//! - Swap the route table when the config watcher delivers a new revision,
//!   unless the table was built in code
//! - Sweep idle upstream sessions in the background
//! - Drain on shutdown and release engine resources

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::http::request::{propagate_request_id_layer, set_request_id_layer, RequestIdExt};
use crate::net::tls::load_tls_config;
use crate::protocol::looks_like_upgrade;
use crate::proxy::headers::ClientTls;
use crate::proxy::route::RouteError;
use crate::proxy::ProxyEngine;
use crate::routing::RouteTable;

/// Errors that stop the server from starting or serving.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("route error: {0}")]
    Route(#[from] RouteError),

    #[error("engine error: {0}")]
    Engine(#[from] ProxyError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Application state injected into the proxy middleware.
#[derive(Clone)]
struct AppState {
    engine: Arc<ProxyEngine>,
    routes: Arc<ArcSwap<RouteTable>>,
    tls: bool,
}

/// HTTP server for the proxy.
pub struct HttpServer {
    config: ProxyConfig,
    engine: Arc<ProxyEngine>,
    routes: Arc<ArcSwap<RouteTable>>,
    /// Routes came from `with_routes`; file reloads would drop their hooks.
    code_routes: bool,
    local: Router,
}

impl HttpServer {
    /// Create a server whose routes come from the configuration.
    pub fn new(config: ProxyConfig) -> Result<Self, ServerError> {
        let table = RouteTable::from_config(&config.routes)?;
        let engine = Arc::new(ProxyEngine::new(config.engine())?);
        Ok(Self {
            config,
            engine,
            routes: Arc::new(ArcSwap::from_pointee(table)),
            code_routes: false,
            local: Router::new(),
        })
    }

    /// Replace the route table, e.g. with routes carrying code hooks.
    ///
    /// A table installed this way is kept for the server's lifetime: config
    /// file revisions no longer replace routes, since a table rebuilt from
    /// the file would lose the hooks.
    pub fn with_routes(mut self, table: RouteTable) -> Self {
        self.routes.store(Arc::new(table));
        self.code_routes = true;
        self
    }

    /// Handlers for requests that match no route or that a bypass hook
    /// hands back.
    pub fn with_local(mut self, router: Router) -> Self {
        self.local = router;
        self
    }

    pub fn engine(&self) -> &Arc<ProxyEngine> {
        &self.engine
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    fn build_router(&self) -> Router {
        let state = AppState {
            engine: self.engine.clone(),
            routes: self.routes.clone(),
            tls: self.config.listener.tls.is_some(),
        };

        self.local
            .clone()
            .fallback(no_route)
            .layer(middleware::from_fn_with_state(state, proxy_middleware))
            .layer(propagate_request_id_layer())
            .layer(TraceLayer::new_for_http())
            .layer(set_request_id_layer())
    }

    fn spawn_reloader(&self, updates: mpsc::UnboundedReceiver<ProxyConfig>) -> Option<JoinHandle<()>> {
        if self.code_routes {
            tracing::info!("Routes were built in code, config file revisions will not replace them");
            return None;
        }
        Some(tokio::spawn(apply_updates(self.routes.clone(), updates)))
    }

    /// Serve until `shutdown` fires, applying config revisions as they
    /// arrive.
    pub async fn run(
        self,
        listener: TcpListener,
        config_updates: mpsc::UnboundedReceiver<ProxyConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, routes = self.routes.load().len(), tls = self.config.listener.tls.is_some(), "HTTP server starting");

        let reloader = self.spawn_reloader(config_updates);
        let sweeper = tokio::spawn(sweep_idle_sessions(
            self.engine.clone(),
            self.config.pool.session_max_age(),
        ));

        let app = self.build_router().into_make_service_with_connect_info::<SocketAddr>();
        let engine = self.engine.clone();

        let served = match &self.config.listener.tls {
            Some(tls) => {
                let rustls = load_tls_config(Path::new(&tls.cert_path), Path::new(&tls.key_path)).await?;
                let handle = axum_server::Handle::new();
                let drain = handle.clone();
                tokio::spawn(async move {
                    let _ = shutdown.recv().await;
                    tracing::info!("Shutdown signal received, draining connections");
                    engine.shutdown();
                    drain.graceful_shutdown(Some(Duration::from_secs(30)));
                });
                axum_server::from_tcp_rustls(listener.into_std()?, rustls)
                    .handle(handle)
                    .serve(app)
                    .await
            }
            None => {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown.recv().await;
                        tracing::info!("Shutdown signal received, draining connections");
                        engine.shutdown();
                    })
                    .await
            }
        };

        if let Some(reloader) = reloader {
            reloader.abort();
        }
        sweeper.abort();
        self.engine.shutdown();
        served?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Route matching and dispatch into the engine.
async fn proxy_middleware(State(state): State<AppState>, mut request: Request<Body>, next: Next) -> Response {
    let matched = state.routes.load().match_path(request.uri().path());
    let Some(route) = matched else {
        return next.run(request).await;
    };

    tracing::debug!(
        request_id = %request.request_id(),
        route = %route.name,
        method = %request.method(),
        path = %request.uri().path(),
        "Route matched"
    );

    if state.tls {
        request.extensions_mut().insert(ClientTls);
    }

    if route.ws && looks_like_upgrade(request.headers()) {
        state.engine.handle_upgrade(request, &route).await
    } else {
        state.engine.handle_request(request, &route, next).await
    }
}

async fn no_route() -> Response {
    (StatusCode::NOT_FOUND, "No matching route found").into_response()
}

async fn apply_updates(routes: Arc<ArcSwap<RouteTable>>, mut updates: mpsc::UnboundedReceiver<ProxyConfig>) {
    while let Some(config) = updates.recv().await {
        match RouteTable::from_config(&config.routes) {
            Ok(table) => {
                tracing::info!(routes = table.len(), "Route table swapped");
                routes.store(Arc::new(table));
            }
            Err(e) => tracing::error!(error = %e, "Rejected route update, keeping current routes"),
        }
    }
}

async fn sweep_idle_sessions(engine: Arc<ProxyEngine>, max_age: Duration) {
    let period = (max_age / 2).max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        engine.pool().expire_idle();
    }
}
