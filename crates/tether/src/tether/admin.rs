use std::{path::PathBuf, sync::Arc};

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::{net::TcpListener, sync::watch};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::tether::tunnel::{client::ClientState, server::ServerState};

#[derive(Clone)]
pub struct AdminState {
    pub prom: Arc<PrometheusHandle>,
    pub config_path: PathBuf,
    pub server: Option<Arc<ServerState>>,
    pub client: Option<watch::Receiver<ClientState>>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/tunnel/proxies", get(tunnel_proxies))
        .route("/tunnel/client", get(tunnel_client))
        .route("/config", get(config))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    ln: TcpListener,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    if let Ok(addr) = ln.local_addr() {
        tracing::info!(admin_addr = %addr, "admin: listening");
    }

    axum::serve(ln, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow_and_update() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;

    tracing::info!("admin: stopped");
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        st.prom.render(),
    )
}

async fn tunnel_proxies(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let snap = match &st.server {
        Some(server) => server.snapshot().await,
        None => Vec::new(),
    };
    (StatusCode::OK, Json(snap))
}

#[derive(Debug, Serialize)]
struct ClientResponse {
    enabled: bool,
    state: Option<ClientState>,
}

async fn tunnel_client(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let state = st.client.as_ref().map(|rx| *rx.borrow());
    (
        StatusCode::OK,
        Json(ClientResponse {
            enabled: state.is_some(),
            state,
        }),
    )
}

#[derive(Debug, Serialize)]
struct ConfigResponse {
    path: String,
}

async fn config(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(ConfigResponse {
            path: st.config_path.display().to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    async fn get(addr: std::net::SocketAddr, path: &str) -> String {
        let mut s = tokio::net::TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        s.write_all(req.as_bytes()).await.unwrap();
        let mut out = String::new();
        s.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn endpoints_respond() {
        let prom = PrometheusBuilder::new().build_recorder().handle();
        let (_client_tx, client_rx) = watch::channel(ClientState::Authenticated);
        let state = AdminState {
            prom: Arc::new(prom),
            config_path: PathBuf::from("/tmp/tether.toml"),
            server: Some(Arc::new(ServerState::new())),
            client: Some(client_rx),
        };

        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(serve_with_shutdown(ln, state, stop_rx));

        let health = get(addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"), "{health}");
        assert!(health.contains(r#"{"ok":true}"#));

        let proxies = get(addr, "/tunnel/proxies").await;
        assert!(proxies.ends_with("[]"), "{proxies}");

        let client = get(addr, "/tunnel/client").await;
        let (_, body) = client.split_once("\r\n\r\n").unwrap();
        let v: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(v["enabled"], true);
        assert_eq!(v["state"], "authenticated");

        let metrics = get(addr, "/metrics").await;
        assert!(metrics.starts_with("HTTP/1.1 200"), "{metrics}");

        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
