//! One broker session per gateway.
//!
//! Incoming publishes land in a FIFO queue read by exactly one consumer at a
//! time ([`GatewayConnection::inbound`] hands out an exclusive [`Inbound`]).
//! The queue only fills while an [`Inbound`] exists; traffic that arrives
//! with nobody reading is discarded. The same messages are also fanned out
//! on a broadcast tap so short-lived observers (find-unit) can watch traffic
//! without stealing from the queue.
//! Outbound publishes go through a single ordered queue drained by one task.

use anyhow::{anyhow, bail, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, OwnedMutexGuard};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::topic::subscription_filter;

/// Capacity of the client's internal request queue.
const REQUEST_CAPACITY: usize = 20;

/// Messages retained for tap subscribers that fall behind.
const TAP_CAPACITY: usize = 256;

/// Pause between event-loop polls after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Arrival order on this connection, starting at 0.
    pub seq: u64,
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub topic: String,
    pub payload: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("gateway '{0}' is disconnected")]
    Disconnected(String),
    #[error("gateway '{0}' already has an inbound consumer")]
    InboundBusy(String),
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub namespace: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
}

// ---------------------------------------------------------------------------
// Feed: the half shared with the event-loop task
// ---------------------------------------------------------------------------

struct Feed {
    queue: mpsc::UnboundedSender<RawMessage>,
    tap: broadcast::Sender<RawMessage>,
    seq: AtomicU64,
    connected: AtomicBool,
    /// Set while an [`Inbound`] is held.
    consuming: AtomicBool,
}

impl Feed {
    fn deliver(&self, topic: String, payload: Vec<u8>) {
        let msg = RawMessage {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            topic,
            payload,
        };
        // No tap subscribers is the normal case.
        let _ = self.tap.send(msg.clone());
        if self.consuming.load(Ordering::Acquire) {
            let _ = self.queue.send(msg);
        }
    }
}

fn discard(rx: &mut mpsc::UnboundedReceiver<RawMessage>) -> usize {
    let mut dropped = 0;
    while rx.try_recv().is_ok() {
        dropped += 1;
    }
    dropped
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

pub struct GatewayConnection {
    name: String,
    endpoint: String,
    feed: Arc<Feed>,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<RawMessage>>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: CancellationToken,
}

impl GatewayConnection {
    fn build(name: &str, endpoint: String) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (tap, _) = broadcast::channel(TAP_CAPACITY);

        let conn = Self {
            name: name.to_string(),
            endpoint,
            feed: Arc::new(Feed {
                queue: queue_tx,
                tap,
                seq: AtomicU64::new(0),
                connected: AtomicBool::new(false),
                consuming: AtomicBool::new(false),
            }),
            queue: Arc::new(Mutex::new(queue_rx)),
            outbound: outbound_tx,
            closed: CancellationToken::new(),
        };
        (conn, outbound_rx)
    }

    /// Open a broker session and subscribe to `<namespace>/#`.
    ///
    /// Resolves once the broker acknowledges the connection; an error or
    /// `connect_timeout` before that fails the call and tears the session
    /// down. After the first acknowledgment, connection errors are logged
    /// and the client reconnects, re-subscribing on every acknowledgment.
    pub async fn connect(
        name: &str,
        host: &str,
        port: u16,
        opts: &ConnectOptions,
    ) -> Result<Arc<Self>> {
        let (conn, outbound_rx) = Self::build(name, format!("{host}:{port}"));

        let client_id = format!("leafwatch-{name}-{}", std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, host, port);
        mqttoptions.set_keep_alive(opts.keep_alive);

        let (client, eventloop) = AsyncClient::new(mqttoptions, REQUEST_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(drive(
            name.to_string(),
            Arc::clone(&conn.feed),
            client.clone(),
            eventloop,
            subscription_filter(&opts.namespace),
            conn.closed.clone(),
            ready_tx,
        ));
        tokio::spawn(pump(
            name.to_string(),
            client,
            outbound_rx,
            conn.closed.clone(),
        ));

        let outcome = timeout(opts.connect_timeout, ready_rx).await;
        match outcome {
            Ok(Ok(Ok(()))) => Ok(Arc::new(conn)),
            Ok(Ok(Err(reason))) => {
                conn.disconnect();
                Err(anyhow!("{name}@{}: {reason}", conn.endpoint))
            }
            Ok(Err(_)) => {
                conn.disconnect();
                Err(anyhow!("{name}@{}: event loop exited", conn.endpoint))
            }
            Err(_) => {
                conn.disconnect();
                bail!(
                    "{name}@{}: no acknowledgment within {:?}",
                    conn.endpoint,
                    opts.connect_timeout
                )
            }
        }
    }

    /// In-process connection with no broker behind it. The returned
    /// [`Loopback`] injects inbound messages and observes publishes.
    pub fn loopback(name: &str) -> (Arc<Self>, Loopback) {
        let (conn, outbound_rx) = Self::build(name, "loopback".to_string());
        conn.feed.connected.store(true, Ordering::Relaxed);
        let feed = Arc::clone(&conn.feed);
        (
            Arc::new(conn),
            Loopback {
                feed,
                published: outbound_rx,
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.is_cancelled() && self.feed.connected.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Take the inbound queue. Only one [`Inbound`] exists at a time.
    /// Delivery into the queue starts now and stops when the [`Inbound`] is
    /// dropped, so a new reader never sees traffic from before it existed.
    pub fn inbound(&self) -> Result<Inbound, ConnectionError> {
        let mut rx = Arc::clone(&self.queue)
            .try_lock_owned()
            .map_err(|_| ConnectionError::InboundBusy(self.name.clone()))?;
        discard(&mut rx);
        self.feed.consuming.store(true, Ordering::Release);
        Ok(Inbound {
            rx,
            feed: Arc::clone(&self.feed),
            gateway: self.name.clone(),
            closed: self.closed.clone(),
        })
    }

    /// Watch inbound traffic from now on without consuming the queue.
    pub fn tap(&self) -> broadcast::Receiver<RawMessage> {
        self.feed.tap.subscribe()
    }

    /// Queue a publish. Returns as soon as it is queued; publishes from one
    /// connection reach the broker in call order.
    pub fn publish(&self, topic: &str, payload: &str) -> Result<(), ConnectionError> {
        if self.closed.is_cancelled() {
            return Err(ConnectionError::Disconnected(self.name.clone()));
        }
        debug!(gateway = %self.name, topic, payload, "publish");
        self.outbound
            .send(Outbound {
                topic: topic.to_string(),
                payload: payload.to_string(),
            })
            .map_err(|_| ConnectionError::Disconnected(self.name.clone()))
    }

    /// Stop delivery and release the session. Any [`Inbound::next`] in
    /// progress returns `None`.
    pub fn disconnect(&self) {
        if !self.closed.is_cancelled() {
            info!(gateway = %self.name, endpoint = %self.endpoint, "disconnecting");
            self.closed.cancel();
        }
    }
}

impl Drop for GatewayConnection {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Exclusive reader of a connection's inbound queue.
pub struct Inbound {
    rx: OwnedMutexGuard<mpsc::UnboundedReceiver<RawMessage>>,
    feed: Arc<Feed>,
    gateway: String,
    closed: CancellationToken,
}

impl Inbound {
    /// Next message in arrival order. Waits while the queue is empty and
    /// returns `None` once the connection is closed.
    pub async fn next(&mut self) -> Option<RawMessage> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            msg = self.rx.recv() => msg,
        }
    }
}

impl Drop for Inbound {
    fn drop(&mut self) {
        self.feed.consuming.store(false, Ordering::Release);
        let dropped = discard(&mut self.rx);
        if dropped > 0 {
            debug!(gateway = %self.gateway, dropped, "discarded unread messages");
        }
    }
}

// ---------------------------------------------------------------------------
// Loopback
// ---------------------------------------------------------------------------

pub struct Loopback {
    feed: Arc<Feed>,
    published: mpsc::UnboundedReceiver<Outbound>,
}

impl Loopback {
    /// Deliver a message as if the broker had sent it.
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        self.feed.deliver(topic.to_string(), payload.into());
    }

    /// Wait for the next publish made on the connection.
    pub async fn next_published(&mut self) -> Option<Outbound> {
        self.published.recv().await
    }

    /// Every publish made so far that has not been read yet.
    pub fn drain_published(&mut self) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(msg) = self.published.try_recv() {
            out.push(msg);
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

async fn drive(
    name: String,
    feed: Arc<Feed>,
    client: AsyncClient,
    mut eventloop: EventLoop,
    filter: String,
    closed: CancellationToken,
    ready: oneshot::Sender<Result<(), String>>,
) {
    let mut ready = Some(ready);

    loop {
        let event = tokio::select! {
            _ = closed.cancelled() => break,
            ev = eventloop.poll() => ev,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                feed.deliver(p.topic.clone(), p.payload.to_vec());
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(gateway = %name, "mqtt connected");
                feed.connected.store(true, Ordering::Relaxed);
                if let Err(e) = client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                    error!(gateway = %name, "subscribe to {filter} failed: {e}");
                } else {
                    info!(gateway = %name, "subscribed to {filter}");
                }
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!(gateway = %name, "mqtt disconnected");
                feed.connected.store(false, Ordering::Relaxed);
            }
            Ok(_) => {}
            Err(e) => {
                feed.connected.store(false, Ordering::Relaxed);
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(e.to_string()));
                    break;
                }
                warn!(gateway = %name, "mqtt error: {e}. reconnecting...");
                tokio::select! {
                    _ = closed.cancelled() => break,
                    _ = sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }

    feed.connected.store(false, Ordering::Relaxed);
    debug!(gateway = %name, "event loop stopped");
}

async fn pump(
    name: String,
    client: AsyncClient,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    closed: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = closed.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        if let Err(e) = client
            .publish(
                msg.topic.as_str(),
                QoS::AtLeastOnce,
                false,
                msg.payload.into_bytes(),
            )
            .await
        {
            warn!(gateway = %name, topic = %msg.topic, "publish failed: {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- publish ------------------------------------------------------------

    #[tokio::test]
    async fn publishes_keep_call_order() {
        let (conn, mut lb) = GatewayConnection::loopback("gw1");
        conn.publish("Yotta/aabbccddeeff/cmd", "set fast_period 1")
            .unwrap();
        conn.publish("Yotta/aabbccddeeff/cmd", "set fast_period 0")
            .unwrap();

        let sent: Vec<String> = lb.drain_published().into_iter().map(|o| o.payload).collect();
        assert_eq!(sent, vec!["set fast_period 1", "set fast_period 0"]);
    }

    #[tokio::test]
    async fn publish_after_disconnect_fails() {
        let (conn, _lb) = GatewayConnection::loopback("gw1");
        conn.disconnect();
        assert_eq!(
            conn.publish("Yotta/cmd", "getid"),
            Err(ConnectionError::Disconnected("gw1".into()))
        );
        assert!(!conn.is_connected());
    }

    // -- inbound ------------------------------------------------------------

    #[tokio::test]
    async fn inbound_is_fifo_with_sequence_numbers() {
        let (conn, lb) = GatewayConnection::loopback("gw1");
        let mut inbound = conn.inbound().unwrap();
        lb.inject("Yotta/aaaaaaaaaaaa/json", "{}");
        lb.inject("Yotta/bbbbbbbbbbbb/json", "{}");

        let first = inbound.next().await.unwrap();
        let second = inbound.next().await.unwrap();
        assert_eq!(first.topic, "Yotta/aaaaaaaaaaaa/json");
        assert_eq!(second.topic, "Yotta/bbbbbbbbbbbb/json");
        assert!(first.seq < second.seq);
    }

    #[tokio::test]
    async fn inbound_has_a_single_consumer() {
        let (conn, lb) = GatewayConnection::loopback("gw1");
        let first = conn.inbound().unwrap();
        assert!(matches!(
            conn.inbound(),
            Err(ConnectionError::InboundBusy(_))
        ));

        drop(first);
        let mut again = conn.inbound().unwrap();
        lb.inject("Yotta/aaaaaaaaaaaa/json", "{}");
        assert_eq!(again.next().await.unwrap().topic, "Yotta/aaaaaaaaaaaa/json");
    }

    #[tokio::test]
    async fn traffic_without_a_reader_is_not_queued() {
        let (conn, lb) = GatewayConnection::loopback("gw1");
        for _ in 0..100 {
            lb.inject("Yotta/aaaaaaaaaaaa/json", "{}");
        }

        let mut inbound = conn.inbound().unwrap();
        lb.inject("Yotta/bbbbbbbbbbbb/json", "{}");
        assert_eq!(inbound.next().await.unwrap().topic, "Yotta/bbbbbbbbbbbb/json");
    }

    #[tokio::test]
    async fn unread_messages_are_discarded_when_reader_drops() {
        let (conn, lb) = GatewayConnection::loopback("gw1");
        let inbound = conn.inbound().unwrap();
        lb.inject("Yotta/aaaaaaaaaaaa/json", "{}");
        lb.inject("Yotta/aaaaaaaaaaaa/json", "{}");
        drop(inbound);
        lb.inject("Yotta/aaaaaaaaaaaa/json", "{}");

        let mut again = conn.inbound().unwrap();
        lb.inject("Yotta/cccccccccccc/json", "{}");
        let next = again.next().await.unwrap();
        assert_eq!(next.topic, "Yotta/cccccccccccc/json");
        assert_eq!(next.seq, 3);
    }

    #[tokio::test]
    async fn disconnect_releases_blocked_reader() {
        let (conn, _lb) = GatewayConnection::loopback("gw1");
        let mut inbound = conn.inbound().unwrap();
        let reader = tokio::spawn(async move { inbound.next().await });

        tokio::task::yield_now().await;
        conn.disconnect();
        assert_eq!(reader.await.unwrap(), None);
    }

    #[tokio::test]
    async fn dropping_connection_closes_inbound() {
        let (conn, _lb) = GatewayConnection::loopback("gw1");
        let mut inbound = conn.inbound().unwrap();
        drop(conn);
        assert_eq!(inbound.next().await, None);
    }

    // -- tap ----------------------------------------------------------------

    #[tokio::test]
    async fn tap_sees_traffic_without_consuming_queue() {
        let (conn, lb) = GatewayConnection::loopback("gw1");
        let mut tap = conn.tap();
        let mut inbound = conn.inbound().unwrap();
        lb.inject("Yotta/aabbccddeeff/id", "aabbccddeeff");

        assert_eq!(tap.recv().await.unwrap().topic, "Yotta/aabbccddeeff/id");
        assert_eq!(inbound.next().await.unwrap().topic, "Yotta/aabbccddeeff/id");
    }

    // -- connect ------------------------------------------------------------

    #[tokio::test]
    async fn connect_to_unreachable_broker_fails() {
        let opts = ConnectOptions {
            namespace: "Yotta".into(),
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(2),
        };
        let result = GatewayConnection::connect("gw-dead", "127.0.0.1", 1, &opts).await;
        assert!(result.is_err());
    }
}
