//! Per-connection driver shared by the control client and server.
//!
//! Each control connection gets three tasks: the caller's task decodes frames,
//! a writer task drains the outbound queue, and a handler task runs
//! [`Handler`] callbacks one message at a time in arrival order. A slow handler
//! only backs up its own connection: once the inbound queue fills, socket reads
//! pause. A peer that stops reading is closed when the outbound queue fills.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, watch},
};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::tether::tunnel::{
    frame::{Frame, FrameCodec},
    ids::ConnId,
    message::Message,
};

/// Outbound frames a peer may leave unread before it is dropped as stalled.
pub const OUTBOUND_QUEUE: usize = 256;

/// Decoded messages waiting for the handler; a full queue stops socket reads.
const INBOUND_QUEUE: usize = 64;

/// Upper bound on flushing queued frames once a connection is closing.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Cheap, cloneable handle to one control connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    id: ConnId,
    peer: Option<SocketAddr>,
    tx: mpsc::Sender<Frame>,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .finish_non_exhaustive()
    }
}

impl Connection {
    fn new(id: ConnId, peer: Option<SocketAddr>) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (closed, _) = watch::channel(false);
        let conn = Self {
            inner: Arc::new(ConnInner {
                id,
                peer,
                tx,
                closed,
            }),
        };
        (conn, rx)
    }

    /// A connection with no socket behind it; emitted frames land in the receiver.
    #[cfg(test)]
    pub fn detached(id: ConnId) -> (Self, mpsc::Receiver<Frame>) {
        Self::new(id, None)
    }

    pub fn id(&self) -> ConnId {
        self.inner.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    /// Queues one message. Returns `false` (and logs) if the connection is gone.
    pub fn emit(&self, msg: Message) -> bool {
        let kind = msg.kind();
        if self.is_closed() {
            tracing::warn!(conn = %self.id(), kind = %kind, "control: emit on closed connection");
            return false;
        }
        let frame = match msg.to_frame() {
            Ok(f) => f,
            Err(err) => {
                tracing::warn!(conn = %self.id(), kind = %kind, err = %err, "control: encode failed");
                return false;
            }
        };
        match self.inner.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(conn = %self.id(), kind = %kind, "control: outbound queue full; closing stalled peer");
                metrics::counter!("tether_stalled_peers_total").increment(1);
                self.close();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(conn = %self.id(), kind = %kind, "control: writer gone");
                false
            }
        }
    }

    /// Requests close. Frames queued before this call are still flushed.
    pub fn close(&self) {
        self.inner.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        wait_true(&mut rx).await;
    }
}

#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Runs once, before any message is delivered.
    async fn connected(&self, _conn: &Connection) {}

    async fn message(&self, conn: &Connection, msg: Message);

    /// Runs once, after the last handler call for this connection returned.
    async fn disconnected(&self, _conn: &Connection) {}
}

/// Drives one control connection until either side closes it, a framing or
/// payload violation occurs, or `shutdown` flips to `true`.
pub async fn serve<S, H>(
    stream: S,
    id: ConnId,
    peer: Option<SocketAddr>,
    handler: Arc<H>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
    H: Handler,
{
    let (rd, wr) = tokio::io::split(stream);
    let mut reader = FramedRead::new(rd, FrameCodec);
    let writer = FramedWrite::new(wr, FrameCodec);

    let (conn, out_rx) = Connection::new(id, peer);

    let mut write_task = tokio::spawn(write_loop(conn.clone(), writer, out_rx));

    let (in_tx, mut in_rx) = mpsc::channel::<Message>(INBOUND_QUEUE);
    let handler_task = {
        let conn = conn.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            handler.connected(&conn).await;
            while let Some(msg) = in_rx.recv().await {
                handler.message(&conn, msg).await;
            }
        })
    };

    let mut closed = conn.inner.closed.subscribe();
    loop {
        tokio::select! {
            _ = wait_true(&mut closed) => break,
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            next = reader.next() => match next {
                None => {
                    tracing::debug!(conn = %id, "control: peer closed");
                    break;
                }
                Some(Err(err)) => {
                    tracing::warn!(conn = %id, peer = ?peer, err = %err, "control: framing violation; closing");
                    metrics::counter!("tether_framing_violations_total").increment(1);
                    break;
                }
                Some(Ok(frame)) => match Message::from_frame(&frame) {
                    Ok(msg) => {
                        let queued = tokio::select! {
                            res = in_tx.send(msg) => res.is_ok(),
                            _ = wait_true(&mut closed) => false,
                            _ = shutdown.changed() => false,
                        };
                        if !queued {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(conn = %id, kind = %frame.kind, err = %err, "control: bad payload; closing");
                        break;
                    }
                },
            }
        }
    }

    drop(in_tx);
    conn.close();
    let _ = handler_task.await;
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut write_task).await.is_err() {
        tracing::debug!(conn = %id, "control: flush timed out; dropping queued frames");
        write_task.abort();
    }
    handler.disconnected(&conn).await;
}

async fn write_loop<W>(
    conn: Connection,
    mut writer: FramedWrite<W, FrameCodec>,
    mut out_rx: mpsc::Receiver<Frame>,
) where
    W: AsyncWrite + Unpin,
{
    let mut closed = conn.inner.closed.subscribe();
    loop {
        tokio::select! {
            biased;
            frame = out_rx.recv() => {
                let Some(frame) = frame else { break; };
                if let Err(err) = writer.send(frame).await {
                    tracing::debug!(conn = %conn.id(), err = %err, "control: write failed");
                    conn.close();
                    return;
                }
            }
            _ = wait_true(&mut closed) => break,
        }
    }

    // A reply queued right before close() (e.g. a failure ack) still goes out.
    while let Ok(frame) = out_rx.try_recv() {
        if writer.send(frame).await.is_err() {
            break;
        }
    }
    let _ = writer.get_mut().shutdown().await;
    conn.close();
}

async fn wait_true(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::BufMut;
    use tokio::{io::AsyncReadExt, sync::Mutex};
    use tokio_util::codec::Framed;

    use super::*;
    use crate::tether::tunnel::message::{Auth, AuthAck, Heartbeat};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Handler for Recorder {
        async fn connected(&self, conn: &Connection) {
            self.events.lock().await.push("connected".into());
            conn.emit(Message::Auth(Auth { token: "t".into() }));
        }

        async fn message(&self, conn: &Connection, msg: Message) {
            // Slow handler; must not reorder later messages.
            if matches!(msg, Message::Heartbeat(Heartbeat { timestamp_ms: 1 })) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            self.events.lock().await.push(format!("{:?}", msg.kind()));
            if let Message::Auth(_) = msg {
                conn.emit(Message::AuthAck(AuthAck {
                    success: true,
                    message: String::new(),
                }));
            }
        }

        async fn disconnected(&self, _conn: &Connection) {
            self.events.lock().await.push("disconnected".into());
        }
    }

    fn spawn_serve(
        stream: tokio::io::DuplexStream,
        rec: Arc<Recorder>,
    ) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let h = tokio::spawn(serve(stream, ConnId(1), None, rec, rx));
        (h, tx)
    }

    #[tokio::test]
    async fn handlers_see_connected_then_messages_in_order() {
        let (a, b) = tokio::io::duplex(4096);
        let rec = Arc::new(Recorder::default());
        let (task, _shutdown) = spawn_serve(a, rec.clone());

        let mut peer = Framed::new(b, FrameCodec);
        let first = peer.next().await.unwrap().unwrap();
        assert_eq!(
            Message::from_frame(&first).unwrap(),
            Message::Auth(Auth { token: "t".into() })
        );

        for m in [
            Message::Heartbeat(Heartbeat { timestamp_ms: 1 }),
            Message::Heartbeat(Heartbeat { timestamp_ms: 2 }),
            Message::Auth(Auth { token: "x".into() }),
        ] {
            peer.send(m.to_frame().unwrap()).await.unwrap();
        }
        let reply = peer.next().await.unwrap().unwrap();
        assert!(matches!(
            Message::from_frame(&reply).unwrap(),
            Message::AuthAck(_)
        ));

        drop(peer);
        task.await.unwrap();

        let events = rec.events.lock().await.clone();
        assert_eq!(
            events,
            vec!["connected", "Heartbeat", "Heartbeat", "Auth", "disconnected"]
        );
    }

    #[tokio::test]
    async fn oversized_frame_closes_without_dispatch() {
        let (a, mut b) = tokio::io::duplex(4096);
        let rec = Arc::new(Recorder::default());
        let (task, _shutdown) = spawn_serve(a, rec.clone());

        let mut raw = bytes::BytesMut::new();
        raw.put_u32(crate::tether::tunnel::frame::MAX_FRAME_LENGTH + 1);
        raw.put_i16(3);
        b.write_all(&raw).await.unwrap();

        // Drain the connected-time AUTH, then expect EOF.
        let mut sink = Vec::new();
        b.read_to_end(&mut sink).await.unwrap();
        task.await.unwrap();

        let events = rec.events.lock().await.clone();
        assert_eq!(events, vec!["connected", "disconnected"]);
    }

    #[tokio::test]
    async fn unknown_type_closes_connection() {
        let (a, mut b) = tokio::io::duplex(4096);
        let rec = Arc::new(Recorder::default());
        let (task, _shutdown) = spawn_serve(a, rec.clone());

        let mut raw = bytes::BytesMut::new();
        crate::tether::tunnel::frame::encode(42, b"??", &mut raw).unwrap();
        b.write_all(&raw).await.unwrap();

        let mut sink = Vec::new();
        b.read_to_end(&mut sink).await.unwrap();
        task.await.unwrap();
        assert!(!rec.events.lock().await.iter().any(|e| e == "Heartbeat"));
    }

    #[tokio::test]
    async fn shutdown_stops_serving_and_emit_becomes_noop() {
        let (a, _b) = tokio::io::duplex(4096);
        let rec = Arc::new(Recorder::default());
        let (task, shutdown) = spawn_serve(a, rec.clone());

        shutdown.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(rec.events.lock().await.last().unwrap(), "disconnected");

        let (conn, _rx) = Connection::detached(ConnId(9));
        conn.close();
        assert!(!conn.emit(Message::Heartbeat(Heartbeat { timestamp_ms: 0 })));
        conn.closed().await;
    }

    #[derive(Default)]
    struct Replier {
        accepted: std::sync::atomic::AtomicUsize,
        gone: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Handler for Replier {
        async fn message(&self, conn: &Connection, msg: Message) {
            if let Message::Auth(_) = msg {
                let ack = Message::AuthAck(AuthAck {
                    success: false,
                    message: "x".repeat(1024),
                });
                if conn.emit(ack) {
                    self.accepted
                        .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            }
        }

        async fn disconnected(&self, _conn: &Connection) {
            self.gone.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn peer_that_never_reads_is_dropped() {
        let (a, b) = tokio::io::duplex(4096);
        let replier = Arc::new(Replier::default());
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(serve(a, ConnId(1), None, replier.clone(), stop_rx));

        let (_unread, wr) = tokio::io::split(b);
        let flood = tokio::spawn(async move {
            let mut wr = FramedWrite::new(wr, FrameCodec);
            let frame = Message::Auth(Auth { token: "t".into() }).to_frame().unwrap();
            for _ in 0..5_000 {
                if wr.send(frame.clone()).await.is_err() {
                    break;
                }
            }
        });

        tokio::time::timeout(Duration::from_secs(60), task)
            .await
            .expect("stalled peer was not dropped")
            .unwrap();
        flood.abort();

        let accepted = replier.accepted.load(std::sync::atomic::Ordering::SeqCst);
        assert!(accepted <= OUTBOUND_QUEUE + 8, "queued {accepted} unread replies");
        assert!(replier.gone.load(std::sync::atomic::Ordering::SeqCst));
        drop(stop_tx);
    }
}
