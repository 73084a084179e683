//! Data-proxy server: one public listener per provisioned backend.
//!
//! Every accepted connection is classified as a user or a data connection.
//! User connections wait in the unbound map until the owning client dials
//! back with the matching session id; the two are then relayed.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::watch,
    time::Instant,
};

use crate::tether::{
    net,
    telemetry::{self, GaugeGuard},
    tunnel::{
        dispatch::Connection,
        handshake::{self, HANDSHAKE_LEN, Prefix},
        ids::{ConnId, SessionIds},
        message::{Message, OpenDataConn},
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    /// Bytes read before the decision, to be replayed to the data side.
    User(Bytes),
    /// `rest` holds anything the dialer sent after the handshake.
    Data { session_id: u32, rest: Bytes },
    /// Peer closed (or failed) before a decision was reached.
    Closed,
}

enum Verdict {
    User,
    Data(u32),
    Eof,
}

/// Races the first bytes of `stream` against `judge_delay`.
///
/// A connection is a data connection only if it presents the full handshake
/// before the timer fires. Any byte that departs from the magic classifies it
/// as a user connection immediately.
pub async fn classify<S>(stream: &mut S, judge_delay: Duration) -> io::Result<Classified>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    let verdict = match tokio::time::timeout(judge_delay, read_prefix(stream, &mut buf)).await {
        Ok(res) => res?,
        Err(_) => Verdict::User,
    };

    Ok(match verdict {
        Verdict::User => Classified::User(buf.freeze()),
        Verdict::Data(session_id) => {
            let rest = buf.split_off(HANDSHAKE_LEN).freeze();
            Classified::Data { session_id, rest }
        }
        Verdict::Eof => Classified::Closed,
    })
}

async fn read_prefix<S>(stream: &mut S, buf: &mut BytesMut) -> io::Result<Verdict>
where
    S: AsyncRead + Unpin,
{
    loop {
        match handshake::inspect(buf) {
            Prefix::Mismatch => return Ok(Verdict::User),
            Prefix::Data(sid) => return Ok(Verdict::Data(sid)),
            Prefix::Partial => {}
        }
        if stream.read_buf(buf).await? == 0 {
            return Ok(Verdict::Eof);
        }
    }
}

struct UnboundUser<S> {
    stream: S,
    buffered: Bytes,
    created: Instant,
}

/// Session table for one data-proxy server.
pub(crate) struct Pairing<S> {
    name: String,
    owner: Connection,
    ids: Arc<SessionIds>,
    unbound: DashMap<u32, UnboundUser<S>>,
}

impl<S> Pairing<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub(crate) fn new(name: String, owner: Connection, ids: Arc<SessionIds>) -> Self {
        Self {
            name,
            owner,
            ids,
            unbound: DashMap::new(),
        }
    }

    pub(crate) async fn handle(self: Arc<Self>, mut stream: S, peer: Option<SocketAddr>, judge_delay: Duration) {
        match classify(&mut stream, judge_delay).await {
            Ok(Classified::User(buffered)) => {
                metrics::counter!("tether_user_connections_total").increment(1);
                self.register_user(stream, buffered, peer);
            }
            Ok(Classified::Data { session_id, rest }) => {
                metrics::counter!("tether_data_connections_total").increment(1);
                self.bind_data(stream, session_id, rest).await;
            }
            Ok(Classified::Closed) => {
                tracing::debug!(proxy = %self.name, peer = ?peer, "proxy: closed before classification");
            }
            Err(err) => {
                tracing::debug!(proxy = %self.name, peer = ?peer, err = %err, "proxy: read failed during classification");
            }
        }
    }

    /// Parks a user connection and asks the owning client to dial back.
    fn register_user(&self, stream: S, buffered: Bytes, peer: Option<SocketAddr>) -> Option<u32> {
        let sid = self.ids.next_id();
        self.unbound.insert(
            sid,
            UnboundUser {
                stream,
                buffered,
                created: Instant::now(),
            },
        );

        if !self
            .owner
            .emit(Message::OpenDataConn(OpenDataConn { session_id: sid }))
        {
            self.unbound.remove(&sid);
            return None;
        }
        tracing::debug!(proxy = %self.name, session = sid, peer = ?peer, "proxy: user waiting for data connection");
        Some(sid)
    }

    async fn bind_data(&self, data: S, session_id: u32, rest: Bytes) {
        let Some((_, user)) = self.unbound.remove(&session_id) else {
            metrics::counter!("tether_stale_data_connections_total").increment(1);
            tracing::debug!(proxy = %self.name, session = session_id, "proxy: unknown session; closing data connection");
            return;
        };
        metrics::counter!("tether_sessions_paired_total").increment(1);
        tracing::debug!(proxy = %self.name, session = session_id, "proxy: paired");
        relay(user, data, session_id, rest).await;
    }

    /// Drops unbound users older than `ttl`; returns how many were evicted.
    pub(crate) fn evict_expired(&self, ttl: Duration) -> usize {
        let before = self.unbound.len();
        self.unbound.retain(|_, u| u.created.elapsed() < ttl);
        let evicted = before.saturating_sub(self.unbound.len());
        if evicted > 0 {
            metrics::counter!("tether_unbound_evictions_total").increment(evicted as u64);
            tracing::info!(proxy = %self.name, evicted, "proxy: evicted unpaired user connections");
        }
        evicted
    }

    pub(crate) fn unbound_len(&self) -> usize {
        self.unbound.len()
    }

    pub(crate) fn clear(&self) {
        self.unbound.clear();
    }
}

async fn relay<S>(mut user: UnboundUser<S>, mut data: S, session_id: u32, rest: Bytes)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let res = async {
        data.write_all(&handshake::encode(session_id)).await?;
        data.write_all(&user.buffered).await?;
        user.stream.write_all(&rest).await?;
        tokio::io::copy_bidirectional(&mut user.stream, &mut data).await
    }
    .await;

    match res {
        Ok((up, down)) => {
            metrics::counter!("tether_relay_ingress_bytes_total")
                .increment(up + user.buffered.len() as u64);
            metrics::counter!("tether_relay_egress_bytes_total")
                .increment(down + rest.len() as u64);
            tracing::debug!(session = session_id, up, down, "proxy: relay closed");
        }
        Err(err) => {
            tracing::debug!(session = session_id, err = %err, "proxy: relay ended with error");
        }
    }
    let _ = user.stream.shutdown().await;
    let _ = data.shutdown().await;
}

#[derive(Debug, Clone)]
pub struct DataProxyOptions {
    pub name: String,
    pub bind_addr: String,
    pub judge_delay: Duration,
    pub unbound_ttl: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxySnapshot {
    pub name: String,
    pub bind_addr: String,
    pub owner: String,
    pub owner_peer: Option<String>,
    pub unbound: usize,
    pub started_at_unix_ms: u64,
}

pub struct DataProxy {
    name: String,
    local_addr: SocketAddr,
    started_at_unix_ms: u64,
    pairing: Arc<Pairing<TcpStream>>,
    stop: watch::Sender<bool>,
}

impl std::fmt::Debug for DataProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataProxy")
            .field("name", &self.name)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl DataProxy {
    /// Binds the public listener. Nothing is accepted until the returned
    /// [`ProxyListener`] is spawned, so the caller can acknowledge the
    /// provisioning first.
    pub async fn bind(
        opts: DataProxyOptions,
        ids: Arc<SessionIds>,
        owner: Connection,
    ) -> io::Result<(Self, ProxyListener)> {
        let ln = TcpListener::bind(&opts.bind_addr).await?;
        let local_addr = ln.local_addr()?;

        let pairing = Arc::new(Pairing::new(opts.name.clone(), owner, ids));
        let (stop, stop_rx) = watch::channel(false);

        let dp = Self {
            name: opts.name,
            local_addr,
            started_at_unix_ms: telemetry::now_unix_ms(),
            pairing: pairing.clone(),
            stop,
        };
        let listener = ProxyListener {
            ln,
            pairing,
            judge_delay: opts.judge_delay,
            unbound_ttl: opts.unbound_ttl,
            stop: stop_rx,
        };
        Ok((dp, listener))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn owner(&self) -> ConnId {
        self.pairing.owner.id()
    }

    /// Closes the listener and drops unpaired users. Paired relays run on.
    pub fn stop(&self) {
        if !self.stop.send_replace(true) {
            tracing::info!(proxy = %self.name, addr = %self.local_addr, "proxy: stopped");
        }
    }

    pub fn snapshot(&self) -> ProxySnapshot {
        ProxySnapshot {
            name: self.name.clone(),
            bind_addr: self.local_addr.to_string(),
            owner: self.pairing.owner.id().to_string(),
            owner_peer: self.pairing.owner.peer().map(|p| p.to_string()),
            unbound: self.pairing.unbound_len(),
            started_at_unix_ms: self.started_at_unix_ms,
        }
    }
}

impl Drop for DataProxy {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Accept side of a bound [`DataProxy`].
pub struct ProxyListener {
    ln: TcpListener,
    pairing: Arc<Pairing<TcpStream>>,
    judge_delay: Duration,
    unbound_ttl: Duration,
    stop: watch::Receiver<bool>,
}

impl ProxyListener {
    pub fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(mut self) {
        let _active = GaugeGuard::new("tether_data_proxies_active");
        let name = self.pairing.name.clone();
        if let Ok(addr) = self.ln.local_addr() {
            tracing::info!(proxy = %name, addr = %addr, "proxy: listening");
        }

        let sweep_every = (self.unbound_ttl / 2).max(Duration::from_millis(10));
        let mut sweep = tokio::time::interval(sweep_every);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                res = self.stop.changed() => {
                    if res.is_err() || *self.stop.borrow() {
                        break;
                    }
                }
                _ = sweep.tick() => {
                    self.pairing.evict_expired(self.unbound_ttl);
                }
                accept = self.ln.accept() => {
                    let (conn, peer) = match accept {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::warn!(proxy = %name, err = %err, "proxy: accept failed");
                            if let Some(pause) = net::accept_error_pause(&err) {
                                tokio::time::sleep(pause).await;
                            }
                            continue;
                        }
                    };
                    let _ = conn.set_nodelay(true);
                    tokio::spawn(self.pairing.clone().handle(conn, Some(peer), self.judge_delay));
                }
            }
        }

        self.pairing.clear();
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    use super::*;
    use crate::tether::tunnel::frame::Frame;

    const JUDGE: Duration = Duration::from_millis(300);

    #[tokio::test(start_paused = true)]
    async fn handshake_classifies_as_data() {
        let (mut srv, mut cli) = tokio::io::duplex(1024);
        let mut hello = handshake::encode(7).to_vec();
        hello.extend_from_slice(b"xyz");
        cli.write_all(&hello).await.unwrap();

        let got = classify(&mut srv, JUDGE).await.unwrap();
        assert_eq!(
            got,
            Classified::Data {
                session_id: 7,
                rest: Bytes::from_static(b"xyz")
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silence_classifies_as_user_after_judge_delay() {
        let (mut srv, _cli) = tokio::io::duplex(1024);
        let start = Instant::now();
        let got = classify(&mut srv, JUDGE).await.unwrap();
        assert_eq!(got, Classified::User(Bytes::new()));
        assert!(start.elapsed() >= JUDGE);
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_bytes_classify_as_user_without_waiting() {
        let (mut srv, mut cli) = tokio::io::duplex(1024);
        cli.write_all(b"GET /").await.unwrap();

        let start = Instant::now();
        let got = classify(&mut srv, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(got, Classified::User(Bytes::from_static(b"GET /")));
        assert!(start.elapsed() < JUDGE);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_magic_waits_for_timer() {
        let (mut srv, mut cli) = tokio::io::duplex(1024);
        cli.write_all(&[0x7f, b'T']).await.unwrap();

        let start = Instant::now();
        let got = classify(&mut srv, JUDGE).await.unwrap();
        assert_eq!(got, Classified::User(Bytes::from_static(&[0x7f, b'T'])));
        assert!(start.elapsed() >= JUDGE);
    }

    #[tokio::test(start_paused = true)]
    async fn eof_before_decision_is_closed() {
        let (mut srv, cli) = tokio::io::duplex(1024);
        drop(cli);
        assert_eq!(classify(&mut srv, JUDGE).await.unwrap(), Classified::Closed);
    }

    fn pairing() -> (Arc<Pairing<DuplexStream>>, mpsc::Receiver<Frame>) {
        let (owner, rx) = Connection::detached(ConnId(1));
        let p = Pairing::new("web".into(), owner, Arc::new(SessionIds::new()));
        (Arc::new(p), rx)
    }

    fn requested_session(rx: &mut mpsc::Receiver<Frame>) -> u32 {
        let f = rx.try_recv().expect("OPEN_DATA_CONN queued");
        match Message::from_frame(&f).unwrap() {
            Message::OpenDataConn(OpenDataConn { session_id }) => session_id,
            other => panic!("unexpected {other:?}"),
        }
    }

    async fn read_n(s: &mut DuplexStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        s.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test(start_paused = true)]
    async fn buffered_user_bytes_reach_data_side_first() {
        let (p, mut rx) = pairing();

        let (u_srv, mut u_cli) = tokio::io::duplex(1024);
        u_cli.write_all(b"GET /").await.unwrap();
        p.clone().handle(u_srv, None, JUDGE).await;
        let sid = requested_session(&mut rx);
        assert_eq!(sid, 1);
        assert_eq!(p.unbound_len(), 1);

        let (d_srv, mut d_cli) = tokio::io::duplex(1024);
        d_cli.write_all(&handshake::encode(sid)).await.unwrap();
        let relay = tokio::spawn(p.clone().handle(d_srv, None, JUDGE));

        assert_eq!(read_n(&mut d_cli, HANDSHAKE_LEN).await, handshake::encode(sid));
        assert_eq!(read_n(&mut d_cli, 5).await, b"GET /");
        assert_eq!(p.unbound_len(), 0);

        u_cli.write_all(b" HTTP/1.1").await.unwrap();
        assert_eq!(read_n(&mut d_cli, 9).await, b" HTTP/1.1");

        d_cli.write_all(b"200 OK").await.unwrap();
        assert_eq!(read_n(&mut u_cli, 6).await, b"200 OK");

        drop(d_cli);
        let mut tail = Vec::new();
        u_cli.read_to_end(&mut tail).await.unwrap();
        assert!(tail.is_empty());
        drop(u_cli);
        relay.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_pair_out_of_order() {
        let (p, mut rx) = pairing();

        let (u1, mut c1) = tokio::io::duplex(1024);
        let (u2, mut c2) = tokio::io::duplex(1024);
        c1.write_all(b"one").await.unwrap();
        c2.write_all(b"two").await.unwrap();
        p.clone().handle(u1, None, JUDGE).await;
        p.clone().handle(u2, None, JUDGE).await;
        let s1 = requested_session(&mut rx);
        let s2 = requested_session(&mut rx);
        assert!(s2 > s1);

        for (sid, want) in [(s2, b"two"), (s1, b"one")] {
            let (d, mut dc) = tokio::io::duplex(1024);
            dc.write_all(&handshake::encode(sid)).await.unwrap();
            tokio::spawn(p.clone().handle(d, None, JUDGE));
            read_n(&mut dc, HANDSHAKE_LEN).await;
            assert_eq!(read_n(&mut dc, 3).await, want);
        }
        assert_eq!(p.unbound_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_session_closes_only_that_data_connection() {
        let (p, mut rx) = pairing();

        let (u, mut uc) = tokio::io::duplex(1024);
        uc.write_all(b"hi").await.unwrap();
        p.clone().handle(u, None, JUDGE).await;
        let sid = requested_session(&mut rx);

        let (d, mut dc) = tokio::io::duplex(1024);
        dc.write_all(&handshake::encode(sid + 100)).await.unwrap();
        p.clone().handle(d, None, JUDGE).await;

        let mut sink = Vec::new();
        dc.read_to_end(&mut sink).await.unwrap();
        assert!(sink.is_empty());
        assert_eq!(p.unbound_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_unbound_users_are_evicted() {
        let (p, mut rx) = pairing();
        let ttl = JUDGE * 100;

        let (u, mut uc) = tokio::io::duplex(1024);
        uc.write_all(b"hello").await.unwrap();
        p.clone().handle(u, None, JUDGE).await;
        requested_session(&mut rx);

        tokio::time::advance(ttl / 2).await;
        assert_eq!(p.evict_expired(ttl), 0);

        tokio::time::advance(ttl).await;
        assert_eq!(p.evict_expired(ttl), 1);
        assert_eq!(p.unbound_len(), 0);

        let mut sink = Vec::new();
        uc.read_to_end(&mut sink).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn closed_owner_drops_user_immediately() {
        let (p, _rx) = pairing();
        p.owner.close();

        let (u, mut uc) = tokio::io::duplex(1024);
        uc.write_all(b"x").await.unwrap();
        p.clone().handle(u, None, JUDGE).await;
        assert_eq!(p.unbound_len(), 0);
    }

    #[tokio::test]
    async fn data_proxy_binds_and_stops() {
        let (owner, mut rx) = Connection::detached(ConnId(3));
        let (dp, listener) = DataProxy::bind(
            DataProxyOptions {
                name: "web".into(),
                bind_addr: "127.0.0.1:0".into(),
                judge_delay: Duration::from_millis(50),
                unbound_ttl: Duration::from_secs(5),
            },
            Arc::new(SessionIds::new()),
            owner,
        )
        .await
        .unwrap();
        listener.spawn();
        assert_ne!(dp.local_addr().port(), 0);
        assert_eq!(dp.owner(), ConnId(3));

        let mut user = TcpStream::connect(dp.local_addr()).await.unwrap();
        user.write_all(b"ping").await.unwrap();
        let f = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            Message::from_frame(&f).unwrap(),
            Message::OpenDataConn(_)
        ));
        assert_eq!(dp.snapshot().unbound, 1);

        dp.stop();
        // Unbound users are dropped with the listener.
        let mut sink = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), user.read_to_end(&mut sink))
            .await
            .unwrap()
            .unwrap();
    }
}
