use std::{collections::HashMap, io, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::{
    net::TcpListener,
    sync::{Mutex, watch},
};

use crate::tether::{
    net,
    telemetry::{self, GaugeGuard},
    tunnel::{
        crypto::{CipherError, SecretCipher},
        dispatch::{self, Connection, Handler},
        ids::{ConnId, ConnIds, SessionIds},
        message::{
            Auth, AuthAck, Heartbeat, HeartbeatAck, Message, OpenDataConnAck, OpenDataPort,
            OpenDataPortAck,
        },
        proxy::{DataProxy, DataProxyOptions, ProxyListener, ProxySnapshot},
    },
};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_addr: String,
    /// Empty accepts any token.
    pub auth_token: String,
    pub secret: String,
    /// Pre-shared cipher key for provisioning requests.
    pub key: String,
    pub judge_delay: Duration,
    pub heartbeat_delay: Duration,
    pub unbound_ttl: Duration,
    pub allow_host_override: bool,
    pub default_bind_host: String,
    pub close_on_auth_failure: bool,
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("not authenticated")]
    Unauthenticated,
    #[error("decrypt: {0}")]
    Decrypt(#[from] CipherError),
    #[error("secret mismatch")]
    BadSecret,
    #[error("proxy name is empty")]
    EmptyName,
    #[error("proxy name {0:?} is already in use")]
    NameTaken(String),
    #[error("connection already owns a data proxy")]
    AlreadyProvisioned,
    #[error("listen {addr}: {source}")]
    Bind { addr: String, source: io::Error },
}

/// Server-wide tables, shared by every control connection.
///
/// Owned by the [`Server`] that created it; several servers in one process
/// never share ids or registrations unless handed the same state.
#[derive(Default)]
pub struct ServerState {
    conn_ids: ConnIds,
    session_ids: Arc<SessionIds>,
    authenticated: DashMap<ConnId, u64>,
    // Held across check + bind + insert so name uniqueness is atomic.
    proxies: Mutex<HashMap<ConnId, DataProxy>>,
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState")
            .field("authenticated", &self.authenticated.len())
            .finish_non_exhaustive()
    }
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_authenticated(&self, id: ConnId) -> bool {
        self.authenticated.contains_key(&id)
    }

    pub async fn snapshot(&self) -> Vec<ProxySnapshot> {
        let proxies = self.proxies.lock().await;
        let mut out: Vec<_> = proxies.values().map(DataProxy::snapshot).collect();
        out.sort_by(|a, b| a.started_at_unix_ms.cmp(&b.started_at_unix_ms));
        out
    }
}

pub struct Server {
    opts: Arc<ServerOptions>,
    state: Arc<ServerState>,
    handler: Arc<ControlHandler>,
}

impl Server {
    pub fn new(opts: ServerOptions) -> anyhow::Result<Self> {
        Self::with_state(opts, Arc::new(ServerState::new()))
    }

    pub fn with_state(mut opts: ServerOptions, state: Arc<ServerState>) -> anyhow::Result<Self> {
        if opts.default_bind_host.trim().is_empty() {
            opts.default_bind_host = "0.0.0.0".to_string();
        }
        let key = if opts.key.is_empty() {
            &opts.secret
        } else {
            &opts.key
        };
        let cipher = SecretCipher::new(key).context("server: provisioning key")?;
        let opts = Arc::new(opts);
        let handler = Arc::new(ControlHandler {
            opts: opts.clone(),
            state: state.clone(),
            cipher,
        });
        Ok(Self {
            opts,
            state,
            handler,
        })
    }

    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    pub async fn listen(&self) -> anyhow::Result<TcpListener> {
        let addr = net::normalize_bind_addr(&self.opts.listen_addr);
        TcpListener::bind(addr.as_ref())
            .await
            .with_context(|| format!("control: listen {addr}"))
    }

    pub async fn listen_and_serve(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let ln = self.listen().await?;
        self.serve(ln, shutdown).await
    }

    pub async fn serve(
        &self,
        ln: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let addr = ln.local_addr()?;
        tracing::info!(addr = %addr, "control: listening");

        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accept = ln.accept() => {
                    let (stream, peer) = match accept {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::warn!(err = %err, "control: accept failed");
                            if let Some(pause) = net::accept_error_pause(&err) {
                                tokio::time::sleep(pause).await;
                            }
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    let id = self.state.conn_ids.next_id();
                    let handler = self.handler.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        metrics::counter!("tether_control_connections_total").increment(1);
                        let _active = GaugeGuard::new("tether_control_connections_active");
                        dispatch::serve(stream, id, Some(peer), handler, shutdown).await;
                    });
                }
            }
        }

        tracing::info!(addr = %addr, "control: stopped");
        Ok(())
    }
}

struct ControlHandler {
    opts: Arc<ServerOptions>,
    state: Arc<ServerState>,
    cipher: SecretCipher,
}

impl ControlHandler {
    fn on_auth(&self, conn: &Connection, token: &str) {
        let expected = self.opts.auth_token.as_str();
        let ok = expected.trim().is_empty() || token == expected;
        if ok {
            self.state
                .authenticated
                .insert(conn.id(), telemetry::now_unix_ms());
            tracing::info!(conn = %conn.id(), peer = ?conn.peer(), "control: authenticated");
        } else {
            self.state.authenticated.remove(&conn.id());
            tracing::warn!(conn = %conn.id(), peer = ?conn.peer(), "control: bad token");
        }

        conn.emit(Message::AuthAck(AuthAck {
            success: ok,
            message: if ok { String::new() } else { "invalid token".into() },
        }));
        if !ok && self.opts.close_on_auth_failure {
            conn.close();
        }
    }

    fn on_heartbeat(&self, conn: &Connection, hb: Heartbeat) {
        if !self.state.is_authenticated(conn.id()) {
            tracing::warn!(conn = %conn.id(), peer = ?conn.peer(), "control: heartbeat before auth; closing");
            conn.close();
            return;
        }
        conn.emit(Message::HeartbeatAck(HeartbeatAck {
            timestamp_ms: hb.timestamp_ms,
            server_time_ms: telemetry::now_unix_ms(),
        }));
    }

    async fn on_open_data_port(&self, conn: &Connection, req: OpenDataPort) {
        match self.provision(conn, &req.encrypted).await {
            Ok((port, listener)) => {
                conn.emit(Message::OpenDataPortAck(OpenDataPortAck {
                    success: true,
                    message: String::new(),
                    heartbeat_delay_ms: self.opts.heartbeat_delay.as_millis() as u64,
                    port,
                }));
                // Accept only after the ack is queued so OPEN_DATA_CONN never precedes it.
                listener.spawn();
            }
            Err(err) => {
                metrics::counter!("tether_provision_failures_total").increment(1);
                tracing::warn!(conn = %conn.id(), peer = ?conn.peer(), err = %err, "control: provisioning failed");
                conn.emit(Message::OpenDataPortAck(OpenDataPortAck {
                    success: false,
                    message: err.to_string(),
                    heartbeat_delay_ms: 0,
                    port: 0,
                }));
                conn.close();
            }
        }
    }

    /// Validates the request and binds its data proxy.
    async fn provision(
        &self,
        conn: &Connection,
        encrypted: &[u8],
    ) -> Result<(u16, ProxyListener), ProvisionError> {
        if !self.state.is_authenticated(conn.id()) {
            return Err(ProvisionError::Unauthenticated);
        }
        let req = self.cipher.open_request(encrypted)?;
        if req.secret != self.opts.secret {
            return Err(ProvisionError::BadSecret);
        }
        let name = req.name.trim();
        if name.is_empty() {
            return Err(ProvisionError::EmptyName);
        }

        let host = match req.host.as_deref().map(str::trim) {
            Some(h) if self.opts.allow_host_override && !h.is_empty() => h,
            _ => self.opts.default_bind_host.as_str(),
        };
        let bind_addr = net::join_host_port(host, req.port);

        let mut proxies = self.state.proxies.lock().await;
        if proxies.contains_key(&conn.id()) {
            return Err(ProvisionError::AlreadyProvisioned);
        }
        if proxies.values().any(|p| p.name() == name) {
            return Err(ProvisionError::NameTaken(name.to_string()));
        }

        let (dp, listener) = DataProxy::bind(
            DataProxyOptions {
                name: name.to_string(),
                bind_addr: bind_addr.clone(),
                judge_delay: self.opts.judge_delay,
                unbound_ttl: self.opts.unbound_ttl,
            },
            self.state.session_ids.clone(),
            conn.clone(),
        )
        .await
        .map_err(|source| ProvisionError::Bind {
            addr: bind_addr,
            source,
        })?;

        let port = dp.local_addr().port();
        tracing::info!(conn = %conn.id(), proxy = %name, addr = %dp.local_addr(), "control: data proxy provisioned");
        proxies.insert(conn.id(), dp);
        Ok((port, listener))
    }
}

#[async_trait]
impl Handler for ControlHandler {
    async fn connected(&self, conn: &Connection) {
        tracing::info!(conn = %conn.id(), peer = ?conn.peer(), "control: connection accepted");
    }

    async fn message(&self, conn: &Connection, msg: Message) {
        match msg {
            Message::Auth(Auth { token }) => self.on_auth(conn, &token),
            Message::Heartbeat(hb) => self.on_heartbeat(conn, hb),
            Message::OpenDataPort(req) => self.on_open_data_port(conn, req).await,
            Message::OpenDataConnAck(OpenDataConnAck {
                session_id,
                success,
            }) => {
                if success {
                    tracing::debug!(conn = %conn.id(), session = session_id, "control: dial-back accepted");
                } else {
                    tracing::warn!(conn = %conn.id(), session = session_id, "control: client failed to dial back");
                }
            }
            other => {
                tracing::debug!(conn = %conn.id(), kind = %other.kind(), "control: unexpected message");
            }
        }
    }

    async fn disconnected(&self, conn: &Connection) {
        self.state.authenticated.remove(&conn.id());
        if let Some(dp) = self.state.proxies.lock().await.remove(&conn.id()) {
            dp.stop();
        }
        tracing::info!(conn = %conn.id(), peer = ?conn.peer(), "control: connection closed");
    }
}
