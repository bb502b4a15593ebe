//! One live client socket: outbound queue, lifecycle and the read/write pumps.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::Message as WsMessage;
use chat_common::id::prefix;
use chat_common::{Event, PrefixedId};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::HubError;
use crate::metrics::OUTBOUND_DROPPED_TOTAL;

use super::reconnect::Reconnector;
use super::Hub;

/// Capacity of every connection's outbound queue.
pub const OUTBOUND_CAPACITY: usize = 256;

/// Floor for the ping interval, which must never be zero.
const MIN_PING_PERIOD: Duration = Duration::from_millis(100);

/// Any full-duplex WebSocket transport the pumps can drive.
pub trait Socket:
    Stream<Item = Result<WsMessage, axum::Error>> + Sink<WsMessage, Error = axum::Error> + Send + 'static
{
}

impl<T> Socket for T where
    T: Stream<Item = Result<WsMessage, axum::Error>>
        + Sink<WsMessage, Error = axum::Error>
        + Send
        + 'static
{
}

/// Timing and sizing knobs for a connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub outbound_capacity: usize,
    /// Maximum silence (no pong) before the read side gives up.
    pub pong_wait: Duration,
    /// Deadline for a single frame write, pings included.
    pub write_wait: Duration,
    /// Largest inbound text frame, in bytes.
    pub max_message_size: usize,
}

impl ConnectionSettings {
    /// Ping often enough that at least one lands inside every pong window.
    pub fn ping_period(&self) -> Duration {
        (self.pong_wait * 9 / 10).max(MIN_PING_PERIOD)
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            outbound_capacity: OUTBOUND_CAPACITY,
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
            max_message_size: 512,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    Closing,
    Closed,
}

/// A single client connection.
///
/// Owns the producer side of a bounded outbound queue. The consumer side is
/// drained by the write pump once [`Connection::run`] starts, or by whoever
/// detaches it with [`Connection::take_outbound`].
pub struct Connection {
    id: String,
    username: String,
    settings: ConnectionSettings,
    state: Mutex<ConnectionState>,
    sender: Mutex<Option<mpsc::Sender<Event>>>,
    outbound: Mutex<Option<mpsc::Receiver<Event>>>,
    room_id: RwLock<Option<String>>,
    cancel: CancellationToken,
}

impl PrefixedId for Connection {
    const PREFIX: &'static str = prefix::CONNECTION;
}

impl Connection {
    /// Allocate the queue and cancellation token. No pump is started.
    pub fn new(username: impl Into<String>, settings: ConnectionSettings) -> Arc<Self> {
        let (sender, outbound) = mpsc::channel(settings.outbound_capacity.max(1));
        Arc::new(Self {
            id: Self::generate(),
            username: username.into(),
            settings,
            state: Mutex::new(ConnectionState::Active),
            sender: Mutex::new(Some(sender)),
            outbound: Mutex::new(Some(outbound)),
            room_id: RwLock::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// The room this connection last joined, kept for reconnection.
    pub fn room_id(&self) -> Option<String> {
        self.room_id.read().clone()
    }

    pub fn set_room_id(&self, room_id: impl Into<String>) {
        *self.room_id.write() = Some(room_id.into());
    }

    /// Forget the current room, but only if it is still `room_id`.
    pub fn clear_room_id(&self, room_id: &str) {
        let mut current = self.room_id.write();
        if current.as_deref() == Some(room_id) {
            *current = None;
        }
    }

    /// Detach the outbound queue's receiving end. Returns `None` once taken.
    pub fn take_outbound(&self) -> Option<mpsc::Receiver<Event>> {
        self.outbound.lock().take()
    }

    /// Queue an event for the write pump without waiting.
    ///
    /// Returns `false` and drops the event when the queue is full or the
    /// connection is no longer active.
    pub fn enqueue(&self, event: Event) -> bool {
        if !self.is_active() {
            return false;
        }

        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return false;
        };

        match sender.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                counter!(OUTBOUND_DROPPED_TOTAL).increment(1);
                tracing::warn!(
                    conn_id = %self.id,
                    username = %self.username,
                    "outbound queue full, dropping event"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Tear the connection down. Safe to call any number of times from any
    /// task; only the first call does the work and returns `true`.
    ///
    /// Cancelling the token makes both pumps release their socket halves; the
    /// write pump sends a close frame on its way out.
    pub fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Active {
                return false;
            }
            *state = ConnectionState::Closing;
        }

        self.cancel.cancel();
        self.sender.lock().take();
        *self.state.lock() = ConnectionState::Closed;

        tracing::info!(conn_id = %self.id, username = %self.username, "connection closed");
        true
    }

    /// Run both pumps over `socket` until the connection closes.
    pub async fn run<S: Socket>(self: Arc<Self>, socket: S, hub: Hub) {
        self.run_pumps(socket, hub, None).await
    }

    /// Like [`Connection::run`], but redial through `reconnector` when a
    /// write fails while the connection is still active.
    pub async fn run_with_reconnect<S: Socket>(
        self: Arc<Self>,
        socket: S,
        hub: Hub,
        reconnector: Reconnector<S>,
    ) {
        self.run_pumps(socket, hub, Some(reconnector)).await
    }

    async fn run_pumps<S: Socket>(
        self: Arc<Self>,
        socket: S,
        hub: Hub,
        reconnector: Option<Reconnector<S>>,
    ) {
        let Some(outbound) = self.take_outbound() else {
            tracing::warn!(conn_id = %self.id, "outbound queue already detached, not running");
            self.close();
            return;
        };

        let (sink, stream) = socket.split();
        let (handoff_tx, handoff_rx) = mpsc::channel(1);

        let reader = tokio::spawn(read_pump(self.clone(), stream, hub.clone(), handoff_rx));
        let writer = tokio::spawn(write_pump(
            self.clone(),
            sink,
            outbound,
            hub,
            reconnector,
            handoff_tx,
        ));

        let (read_result, write_result) = tokio::join!(reader, writer);
        for result in [read_result, write_result] {
            if let Err(err) = result {
                tracing::error!(conn_id = %self.id, ?err, "connection pump panicked");
            }
        }
        self.close();

        tracing::debug!(conn_id = %self.id, username = %self.username, "connection pumps stopped");
    }

    /// Decode one inbound frame and hand it to the hub. Failures are reported
    /// back to this connection as an `error` event, best effort.
    async fn dispatch(self: &Arc<Self>, hub: &Hub, raw: &str) {
        let result = match serde_json::from_str::<Event>(raw) {
            Ok(event) => hub.process_event(event, self).await,
            Err(err) => Err(HubError::from(err)),
        };

        if let Err(err) = result {
            tracing::debug!(conn_id = %self.id, username = %self.username, %err, "event rejected");
            let room_id = self.room_id().unwrap_or_default();
            if !self.enqueue(Event::error(format!("Error: {err}"), room_id)) {
                tracing::debug!(conn_id = %self.id, "error event dropped");
            }
        }
    }
}

async fn read_pump<S: Socket>(
    conn: Arc<Connection>,
    mut stream: SplitStream<S>,
    hub: Hub,
    mut handoff: mpsc::Receiver<SplitStream<S>>,
) {
    let pong_wait = conn.settings.pong_wait;
    let max_message_size = conn.settings.max_message_size;
    let mut deadline = Instant::now() + pong_wait;

    loop {
        let frame = tokio::select! {
            _ = conn.cancel.cancelled() => break,
            Some(fresh) = handoff.recv() => {
                stream = fresh;
                deadline = Instant::now() + pong_wait;
                continue;
            }
            frame = time::timeout_at(deadline, stream.next()) => frame,
        };

        let msg = match frame {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(err))) => {
                tracing::debug!(conn_id = %conn.id, ?err, "ws read error");
                break;
            }
            Ok(None) => break,
            Err(_elapsed) => {
                tracing::debug!(conn_id = %conn.id, "pong wait elapsed, closing connection");
                break;
            }
        };

        match msg {
            WsMessage::Text(text) => {
                if text.len() > max_message_size {
                    tracing::warn!(
                        conn_id = %conn.id,
                        size = text.len(),
                        "inbound frame too large, closing connection"
                    );
                    break;
                }
                conn.dispatch(&hub, text.as_str()).await;
            }
            WsMessage::Pong(_) => deadline = Instant::now() + pong_wait,
            WsMessage::Close(_) => break,
            WsMessage::Ping(_) | WsMessage::Binary(_) => {}
        }
    }

    conn.close();
    tracing::debug!(conn_id = %conn.id, "read pump stopped");
}

async fn write_pump<S: Socket>(
    conn: Arc<Connection>,
    mut sink: SplitSink<S, WsMessage>,
    mut outbound: mpsc::Receiver<Event>,
    hub: Hub,
    reconnector: Option<Reconnector<S>>,
    handoff: mpsc::Sender<SplitStream<S>>,
) {
    let write_wait = conn.settings.write_wait;
    let ping_period = conn.settings.ping_period();
    let mut ticker = time::interval_at(Instant::now() + ping_period, ping_period);

    loop {
        let frame = tokio::select! {
            _ = conn.cancel.cancelled() => {
                let _ = write_frame(&mut sink, WsMessage::Close(None), write_wait).await;
                break;
            }
            event = outbound.recv() => {
                let Some(event) = event else {
                    let _ = write_frame(&mut sink, WsMessage::Close(None), write_wait).await;
                    break;
                };
                match serde_json::to_string(&event) {
                    Ok(json) => WsMessage::Text(json.into()),
                    Err(err) => {
                        tracing::warn!(conn_id = %conn.id, ?err, "failed to encode event");
                        continue;
                    }
                }
            }
            _ = ticker.tick() => WsMessage::Ping(Bytes::new()),
        };

        if let Err(err) = write_frame(&mut sink, frame.clone(), write_wait).await {
            tracing::debug!(conn_id = %conn.id, %err, "ws write failed");
            match recover(&conn, &hub, reconnector.as_ref(), &handoff).await {
                Some(fresh) => {
                    sink = fresh;
                    if write_frame(&mut sink, frame, write_wait).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
    }

    let _ = sink.close().await;
    conn.close();
    tracing::debug!(conn_id = %conn.id, "write pump stopped");
}

/// Single failure point for the write path: redial, hand the new read half to
/// the read pump and restore room membership.
async fn recover<S: Socket>(
    conn: &Arc<Connection>,
    hub: &Hub,
    reconnector: Option<&Reconnector<S>>,
    handoff: &mpsc::Sender<SplitStream<S>>,
) -> Option<SplitSink<S, WsMessage>> {
    let reconnector = reconnector?;
    if !conn.is_active() {
        return None;
    }

    let socket = reconnector.redial(conn).await?;
    let (sink, stream) = socket.split();
    if handoff.send(stream).await.is_err() {
        // The read pump is gone, which means the connection is closing.
        return None;
    }

    hub.rejoin(conn).await;
    Some(sink)
}

async fn write_frame<S: Socket>(
    sink: &mut SplitSink<S, WsMessage>,
    frame: WsMessage,
    write_wait: Duration,
) -> Result<(), HubError> {
    match time::timeout(write_wait, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            tracing::debug!(?err, "socket write error");
            Err(HubError::ConnectionClosed)
        }
        Err(_elapsed) => Err(HubError::ConnectionClosed),
    }
}
