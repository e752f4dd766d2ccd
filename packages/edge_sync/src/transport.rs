//! One live WebSocket + MQTT session.
//!
//! `open` performs the socket upgrade and the CONNECT/CONNACK exchange, then
//! splits the socket into a writer task (publish queue and keep-alive pings)
//! and a reader task (frame decoding, PUBACKs, event forwarding). The returned
//! [`ConnectionHandle`] is the only way to talk to the session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use mqtt_wire::{Connect, ConnectReturnCode, FrameBuffer, Packet, Publish, QoS, Subscribe};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message, handshake::client::Request};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{Result, SyncError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Outbound queue depth. `publish` waits for room beyond this, `try_publish`
/// fails instead.
const OUTBOUND_QUEUE: usize = 64;

/// How long `close` waits for the DISCONNECT to flush.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// What the transport reports upward. Every event carries the id of the
/// connection it came from so stale connections can be ignored.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message {
        conn_id: u64,
        topic: String,
        payload: Vec<u8>,
    },
    /// The socket went away without `close` being called.
    Closed { conn_id: u64, reason: String },
}

pub struct OpenParams {
    pub conn_id: u64,
    pub request: Request,
    pub connect: Connect,
    pub connect_timeout: Duration,
    pub keepalive: Duration,
    pub events: mpsc::Sender<TransportEvent>,
}

/// State shared between the handle and its two tasks.
struct Shared {
    conn_id: u64,
    cancel: CancellationToken,
    /// Set once the connection is finished, by whoever gets there first.
    closed: AtomicBool,
    events: mpsc::Sender<TransportEvent>,
}

impl Shared {
    /// Report an unplanned close exactly once. Suppressed after `close`.
    async fn report_closed(&self, reason: String) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(conn_id = self.conn_id, %reason, "Edge connection lost");
            let _ = self
                .events
                .send(TransportEvent::Closed {
                    conn_id: self.conn_id,
                    reason,
                })
                .await;
        }
        self.cancel.cancel();
    }
}

pub struct ConnectionHandle {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Packet>,
    next_packet_id: AtomicU16,
    tasks: Vec<JoinHandle<()>>,
}

impl ConnectionHandle {
    pub fn conn_id(&self) -> u64 {
        self.shared.conn_id
    }

    pub fn is_open(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst)
    }

    /// Packet ids cycle through 1..=65535; zero is reserved.
    fn next_packet_id(&self) -> u16 {
        loop {
            let id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    async fn enqueue(&self, packet: Packet) -> Result<()> {
        if !self.is_open() {
            return Err(SyncError::Network("connection is closed".into()));
        }
        self.outbound
            .send(packet)
            .await
            .map_err(|_| SyncError::Network("connection writer has stopped".into()))
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<()> {
        let publish = match qos {
            QoS::AtMostOnce => Publish::at_most_once(topic, payload),
            QoS::AtLeastOnce => Publish::at_least_once(topic, payload, self.next_packet_id()),
        };
        trace!(conn_id = self.conn_id(), topic, ?qos, "Queueing publish");
        self.enqueue(Packet::Publish(publish)).await
    }

    /// Queue a QoS 0 publish without waiting. Fails when the queue is full
    /// or the connection is gone, so callers holding a lock never block.
    pub fn try_publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        if !self.is_open() {
            return Err(SyncError::Network("connection is closed".into()));
        }
        trace!(conn_id = self.conn_id(), topic, "Queueing publish");
        self.outbound
            .try_send(Packet::Publish(Publish::at_most_once(topic, payload)))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    SyncError::Network("outbound queue is full".into())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    SyncError::Network("connection writer has stopped".into())
                }
            })
    }

    pub async fn subscribe(&self, topics: &[&str], qos: QoS) -> Result<()> {
        let subscribe = Subscribe {
            packet_id: self.next_packet_id(),
            filters: topics.iter().map(|t| (t.to_string(), qos)).collect(),
        };
        self.enqueue(Packet::Subscribe(subscribe)).await
    }

    /// Close on purpose: no `Closed` event is emitted. Sends DISCONNECT on a
    /// best-effort basis and waits briefly for both tasks to finish.
    pub async fn close(mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.cancel.cancel();
        let conn_id = self.shared.conn_id;
        let tasks = std::mem::take(&mut self.tasks);

        let finished = tokio::time::timeout(CLOSE_GRACE, async {
            for task in tasks {
                let _ = task.await;
            }
        })
        .await;
        if finished.is_err() {
            warn!(conn_id, "Edge connection tasks did not stop in time");
        }
        debug!(conn_id, "Edge connection closed");
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        // A dropped handle must not leave tasks holding the socket
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.cancel.cancel();
    }
}

/// Upgrade the socket, run the MQTT handshake and start the I/O tasks.
pub async fn open(params: OpenParams) -> Result<ConnectionHandle> {
    let OpenParams {
        conn_id,
        request,
        connect,
        connect_timeout,
        keepalive,
        events,
    } = params;

    let (ws, _response) =
        tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| SyncError::Network("timed out opening edge socket".into()))?
            .map_err(SyncError::from_tungstenite)?;

    let (mut sink, mut source) = ws.split();
    let mut frames = FrameBuffer::new();

    send_packet(&mut sink, &Packet::Connect(connect)).await?;

    let connack = tokio::time::timeout(connect_timeout, async {
        loop {
            match next_packet(&mut source, &mut frames).await? {
                Some(Packet::ConnAck(ack)) => return Ok::<_, SyncError>(ack),
                Some(other) => {
                    debug!(conn_id, kind = other.kind(), "Ignoring packet before CONNACK");
                }
                None => {
                    return Err(SyncError::Network(
                        "edge closed the socket before CONNACK".into(),
                    ));
                }
            }
        }
    })
    .await
    .map_err(|_| SyncError::Network("timed out waiting for CONNACK".into()))??;

    match connack.code {
        ConnectReturnCode::Accepted => {}
        code if code.is_auth_failure() => {
            return Err(SyncError::Authentication(format!(
                "edge refused credentials (code {})",
                code.as_u8()
            )));
        }
        code => {
            return Err(SyncError::Network(format!(
                "edge refused connection (code {})",
                code.as_u8()
            )));
        }
    }

    let shared = Arc::new(Shared {
        conn_id,
        cancel: CancellationToken::new(),
        closed: AtomicBool::new(false),
        events,
    });
    let (outbound_tx, outbound_rx) = mpsc::channel::<Packet>(OUTBOUND_QUEUE);

    let writer = tokio::spawn(run_writer(shared.clone(), sink, outbound_rx, keepalive));
    let reader = tokio::spawn(run_reader(
        shared.clone(),
        source,
        frames,
        outbound_tx.clone(),
    ));

    Ok(ConnectionHandle {
        shared,
        outbound: outbound_tx,
        next_packet_id: AtomicU16::new(1),
        tasks: vec![writer, reader],
    })
}

async fn send_packet(sink: &mut WsSink, packet: &Packet) -> Result<()> {
    let bytes = packet.encode()?;
    sink.send(Message::binary(bytes))
        .await
        .map_err(SyncError::from_tungstenite)
}

/// Next complete MQTT packet, or `None` once the socket is closed.
async fn next_packet(source: &mut WsSource, frames: &mut FrameBuffer) -> Result<Option<Packet>> {
    loop {
        if let Some(packet) = frames.next_packet()? {
            return Ok(Some(packet));
        }
        match source.next().await {
            Some(Ok(Message::Binary(data))) => frames.extend(&data),
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => {}
            Some(Err(tungstenite::Error::ConnectionClosed)) => return Ok(None),
            Some(Err(e)) => return Err(SyncError::from_tungstenite(e)),
        }
    }
}

/// Drain the publish queue onto the socket and keep the session alive.
/// A zero keep-alive disables pings.
async fn run_writer(
    shared: Arc<Shared>,
    mut sink: WsSink,
    mut outbound: mpsc::Receiver<Packet>,
    keepalive: Duration,
) {
    let conn_id = shared.conn_id;
    let mut ping = (!keepalive.is_zero())
        .then(|| tokio::time::interval_at(tokio::time::Instant::now() + keepalive, keepalive));

    loop {
        let (packet, what) = tokio::select! {
            _ = shared.cancel.cancelled() => {
                let _ = tokio::time::timeout(CLOSE_GRACE, async {
                    let _ = send_packet(&mut sink, &Packet::Disconnect).await;
                    let _ = sink.close().await;
                })
                .await;
                break;
            }
            packet = outbound.recv() => match packet {
                Some(packet) => (packet, "write"),
                None => break,
            },
            _ = next_ping(&mut ping) => {
                trace!(conn_id, "PINGREQ");
                (Packet::PingReq, "ping")
            }
        };

        // A stalled socket must not keep the writer from seeing cancellation
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            sent = send_packet(&mut sink, &packet) => {
                if let Err(e) = sent {
                    shared.report_closed(format!("{what} failed: {e}")).await;
                    break;
                }
            }
        }
    }
}

async fn next_ping(ping: &mut Option<tokio::time::Interval>) {
    match ping {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Decode inbound packets and forward publishes upward.
async fn run_reader(
    shared: Arc<Shared>,
    mut source: WsSource,
    mut frames: FrameBuffer,
    outbound: mpsc::Sender<Packet>,
) {
    let conn_id = shared.conn_id;

    loop {
        let packet = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            packet = next_packet(&mut source, &mut frames) => packet,
        };

        match packet {
            Ok(Some(Packet::Publish(publish))) => {
                if let (QoS::AtLeastOnce, Some(id)) = (publish.qos, publish.packet_id) {
                    tokio::select! {
                        _ = shared.cancel.cancelled() => break,
                        _ = outbound.send(Packet::PubAck(id)) => {}
                    }
                }
                let event = TransportEvent::Message {
                    conn_id,
                    topic: publish.topic,
                    payload: publish.payload,
                };
                tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    sent = shared.events.send(event) => {
                        if sent.is_err() {
                            debug!(conn_id, "Event receiver dropped, stopping reader");
                            break;
                        }
                    }
                }
            }
            Ok(Some(Packet::SubAck(ack))) => {
                let refused = ack.return_codes.iter().filter(|c| **c == 0x80).count();
                if refused > 0 {
                    warn!(conn_id, refused, "Edge refused some subscriptions");
                } else {
                    debug!(conn_id, granted = ack.return_codes.len(), "Subscriptions granted");
                }
            }
            Ok(Some(Packet::PingResp)) => trace!(conn_id, "PINGRESP"),
            Ok(Some(Packet::PubAck(id))) => trace!(conn_id, packet_id = id, "PUBACK"),
            Ok(Some(Packet::Disconnect)) => {
                shared.report_closed("edge sent DISCONNECT".into()).await;
                break;
            }
            Ok(Some(other)) => debug!(conn_id, kind = other.kind(), "Ignoring packet"),
            Ok(None) => {
                shared.report_closed("socket closed by edge".into()).await;
                break;
            }
            Err(e) => {
                shared.report_closed(e.to_string()).await;
                break;
            }
        }
    }
}
