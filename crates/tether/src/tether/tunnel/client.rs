use std::{
    sync::{
        Arc,
        atomic::{AtomicU16, AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::watch,
};

use crate::tether::{
    net, telemetry,
    tunnel::{
        crypto::SecretCipher,
        dispatch::{self, Connection, Handler},
        handshake::{self, HANDSHAKE_LEN},
        ids::ConnIds,
        message::{
            Auth, AuthAck, DataPortRequest, Heartbeat, HeartbeatAck, Message, OpenDataConn,
            OpenDataConnAck, OpenDataPort, OpenDataPortAck,
        },
    },
};

/// Floor for the heartbeat cadence, whether configured or dictated by the server.
pub const MIN_HEARTBEAT_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Disconnected,
    Connecting,
    ConnectedUnauth,
    Authenticated,
}

/// Backend the client asks the server to expose.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub name: String,
    pub local_addr: String,
    pub remote_host: Option<String>,
    pub remote_port: u16,
    pub secret: String,
    pub key: String,
    /// Host dialed for data connections; defaults to the control server host.
    pub data_host: String,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    pub auth_token: String,
    pub min_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub heartbeat_delay: Duration,
    pub dial_timeout: Duration,
    pub proxy: Option<ProxyOptions>,
}

/// Doubling reconnect delay, capped at `max`, no jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }

    /// Returns the delay to wait now and doubles the next one.
    pub fn next_delay(&mut self) -> Duration {
        let d = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        d
    }
}

struct Shared {
    opts: ClientOptions,
    cipher: Option<SecretCipher>,
    state: watch::Sender<ClientState>,
}

impl Shared {
    fn set_state(&self, s: ClientState) {
        self.state.send_if_modified(|cur| {
            if *cur == s {
                return false;
            }
            tracing::debug!(from = ?*cur, to = ?s, "client: state");
            *cur = s;
            true
        });
    }
}

pub struct Client {
    shared: Arc<Shared>,
    conn_ids: ConnIds,
}

impl Client {
    pub fn new(mut opts: ClientOptions) -> anyhow::Result<Self> {
        opts.server_addr = opts.server_addr.trim().to_string();
        if opts.server_addr.is_empty() {
            anyhow::bail!("client: server_addr is required");
        }
        if opts.dial_timeout.is_zero() {
            opts.dial_timeout = Duration::from_secs(5);
        }
        if opts.min_reconnect_delay.is_zero() {
            opts.min_reconnect_delay = Duration::from_secs(1);
        }
        if opts.heartbeat_delay.is_zero() {
            opts.heartbeat_delay = Duration::from_secs(10);
        }

        let cipher = match opts.proxy.as_mut() {
            Some(p) => {
                if p.name.trim().is_empty() {
                    anyhow::bail!("client: proxy name is required");
                }
                if p.local_addr.trim().is_empty() {
                    anyhow::bail!("client: proxy local_addr is required");
                }
                if p.data_host.trim().is_empty() {
                    p.data_host = net::host_of(&opts.server_addr).to_string();
                }
                let key = if p.key.is_empty() { &p.secret } else { &p.key };
                Some(SecretCipher::new(key).context("client: proxy key")?)
            }
            None => None,
        };

        let (state, _) = watch::channel(ClientState::Disconnected);
        Ok(Self {
            shared: Arc::new(Shared {
                opts,
                cipher,
                state,
            }),
            conn_ids: ConnIds::new(),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.shared.state.subscribe()
    }

    pub fn state(&self) -> ClientState {
        *self.shared.state.borrow()
    }

    /// Connect, serve, and reconnect with backoff until `shutdown` is set.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let opts = &self.shared.opts;
        let mut backoff = Backoff::new(opts.min_reconnect_delay, opts.max_reconnect_delay);

        loop {
            if *shutdown.borrow() {
                self.shared.set_state(ClientState::Disconnected);
                return Ok(());
            }

            self.shared.set_state(ClientState::Connecting);
            match self.connect().await {
                Ok(stream) => {
                    backoff.reset();
                    let id = self.conn_ids.next_id();
                    let peer = stream.peer_addr().ok();
                    tracing::info!(conn = %id, server = %opts.server_addr, "client: connected");

                    let session = Arc::new(ControlSession::new(self.shared.clone()));
                    dispatch::serve(stream, id, peer, session, shutdown.clone()).await;

                    tracing::warn!(
                        conn = %id,
                        server = %opts.server_addr,
                        backoff = %humantime::format_duration(backoff.current()),
                        "client: disconnected; retrying"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        server = %opts.server_addr,
                        err = %err,
                        backoff = %humantime::format_duration(backoff.current()),
                        "client: connect failed; retrying"
                    );
                }
            }

            self.shared.set_state(ClientState::Disconnected);
            let delay = backoff.next_delay();

            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn connect(&self) -> anyhow::Result<TcpStream> {
        let opts = &self.shared.opts;
        let c = tokio::time::timeout(opts.dial_timeout, TcpStream::connect(&opts.server_addr))
            .await
            .with_context(|| format!("dial timeout {}", opts.server_addr))??;
        let _ = c.set_nodelay(true);
        Ok(c)
    }
}

/// Handler state for one control connection; rebuilt on every reconnect.
struct ControlSession {
    shared: Arc<Shared>,
    heartbeat_delay_ms: AtomicU64,
    data_port: AtomicU16,
}

impl ControlSession {
    fn new(shared: Arc<Shared>) -> Self {
        let delay = shared.opts.heartbeat_delay.as_millis() as u64;
        Self {
            shared,
            heartbeat_delay_ms: AtomicU64::new(delay),
            data_port: AtomicU16::new(0),
        }
    }

    fn schedule_heartbeat(&self, conn: &Connection) {
        let delay = Duration::from_millis(self.heartbeat_delay_ms.load(Ordering::Relaxed));
        let conn = conn.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = conn.closed() => {}
                _ = tokio::time::sleep(delay) => {
                    if !conn.is_closed() {
                        conn.emit(Message::Heartbeat(Heartbeat {
                            timestamp_ms: telemetry::now_unix_ms(),
                        }));
                    }
                }
            }
        });
    }

    fn request_data_port(&self, conn: &Connection) {
        let (Some(p), Some(cipher)) = (&self.shared.opts.proxy, &self.shared.cipher) else {
            return;
        };
        let req = DataPortRequest {
            secret: p.secret.clone(),
            name: p.name.clone(),
            host: p.remote_host.clone(),
            port: p.remote_port,
        };
        match cipher.seal_request(&req) {
            Ok(encrypted) => {
                conn.emit(Message::OpenDataPort(OpenDataPort { encrypted }));
            }
            Err(err) => {
                tracing::error!(conn = %conn.id(), err = %err, "client: seal provisioning request failed");
            }
        }
    }

    fn open_data_conn(&self, conn: &Connection, session_id: u32) {
        let Some(p) = self.shared.opts.proxy.clone() else {
            tracing::warn!(conn = %conn.id(), session = session_id, "client: data connection requested but no proxy configured");
            return;
        };
        let port = self.data_port.load(Ordering::Relaxed);
        if port == 0 {
            tracing::warn!(conn = %conn.id(), session = session_id, "client: data connection requested before provisioning");
            return;
        }

        let data_addr = net::join_host_port(&p.data_host, port);
        let dial_timeout = self.shared.opts.dial_timeout;
        let conn = conn.clone();
        tokio::spawn(async move {
            match dial_back(&data_addr, &p.local_addr, session_id, dial_timeout).await {
                Ok((mut data, mut local)) => {
                    conn.emit(Message::OpenDataConnAck(OpenDataConnAck {
                        session_id,
                        success: true,
                    }));
                    match tokio::io::copy_bidirectional(&mut data, &mut local).await {
                        Ok((up, down)) => {
                            tracing::debug!(session = session_id, up, down, "client: data connection closed");
                        }
                        Err(err) => {
                            tracing::debug!(session = session_id, err = %err, "client: data connection ended with error");
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(session = session_id, data = %data_addr, local = %p.local_addr, err = %err, "client: dial-back failed");
                    conn.emit(Message::OpenDataConnAck(OpenDataConnAck {
                        session_id,
                        success: false,
                    }));
                }
            }
        });
    }
}

#[async_trait]
impl Handler for ControlSession {
    async fn connected(&self, conn: &Connection) {
        self.shared.set_state(ClientState::ConnectedUnauth);
        conn.emit(Message::Auth(Auth {
            token: self.shared.opts.auth_token.clone(),
        }));
    }

    async fn message(&self, conn: &Connection, msg: Message) {
        match msg {
            Message::AuthAck(AuthAck { success, message }) => {
                if !success {
                    // The server decides whether to drop us; stop heartbeating either way.
                    tracing::error!(conn = %conn.id(), message = %message, "client: auth rejected");
                    return;
                }
                tracing::info!(conn = %conn.id(), "client: authenticated");
                self.shared.set_state(ClientState::Authenticated);
                self.schedule_heartbeat(conn);
                self.request_data_port(conn);
            }
            Message::HeartbeatAck(HeartbeatAck { timestamp_ms, .. }) => {
                let rtt = telemetry::now_unix_ms().saturating_sub(timestamp_ms);
                tracing::trace!(conn = %conn.id(), rtt_ms = rtt, "client: heartbeat ack");
                self.schedule_heartbeat(conn);
            }
            Message::OpenDataPortAck(OpenDataPortAck {
                success,
                message,
                heartbeat_delay_ms,
                port,
            }) => {
                if !success {
                    tracing::error!(conn = %conn.id(), message = %message, "client: provisioning rejected");
                    return;
                }
                if heartbeat_delay_ms > 0 {
                    self.heartbeat_delay_ms.store(
                        heartbeat_delay_ms.max(MIN_HEARTBEAT_DELAY.as_millis() as u64),
                        Ordering::Relaxed,
                    );
                }
                self.data_port.store(port, Ordering::Relaxed);
                tracing::info!(
                    conn = %conn.id(),
                    port,
                    heartbeat_delay_ms,
                    "client: data proxy ready"
                );
            }
            Message::OpenDataConn(OpenDataConn { session_id }) => {
                self.open_data_conn(conn, session_id);
            }
            other => {
                tracing::debug!(conn = %conn.id(), kind = %other.kind(), "client: unexpected message");
            }
        }
    }

    async fn disconnected(&self, conn: &Connection) {
        tracing::debug!(conn = %conn.id(), "client: control connection closed");
    }
}

/// Dials the data proxy, performs the pairing handshake, then dials the local backend.
async fn dial_back(
    data_addr: &str,
    local_addr: &str,
    session_id: u32,
    dial_timeout: Duration,
) -> anyhow::Result<(TcpStream, TcpStream)> {
    let mut data = tokio::time::timeout(dial_timeout, TcpStream::connect(data_addr))
        .await
        .with_context(|| format!("dial timeout {data_addr}"))??;
    let _ = data.set_nodelay(true);

    let hello = handshake::encode(session_id);
    data.write_all(&hello).await?;

    let mut ack = [0u8; HANDSHAKE_LEN];
    tokio::time::timeout(dial_timeout, data.read_exact(&mut ack))
        .await
        .context("pairing ack timeout")??;
    if ack != hello {
        anyhow::bail!("unexpected pairing ack");
    }

    let local = tokio::time::timeout(dial_timeout, TcpStream::connect(local_addr))
        .await
        .with_context(|| format!("dial timeout {local_addr}"))??;
    let _ = local.set_nodelay(true);
    Ok((data, local))
}
