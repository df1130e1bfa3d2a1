//! Persistent JSON-RPC client session to one wallet server.
//!
//! A [`ClientSession`] owns one TCP transport at a time. Outgoing calls are
//! matched to responses by request id; server-initiated notifications are
//! routed by method onto broadcast streams. A single long-lived reconnect
//! task per session ([`ClientSession::ensure_session`]) drives the
//! connect → handshake → idle-ping state machine with interruptible
//! backoff.

use crate::error::NetError;
use crate::net::events::EventStream;
use crate::net::message::{decode_frame, encode_request, line_codec, Incoming};
use crate::net::types::{
    parse_server_version, ServerEndpoint, CLIENT_VERSION, HANDSHAKE_TIMEOUT_SECS,
    INITIAL_RETRY_DELAY_SECS, MAX_RETRY_DELAY_SECS, MINIMUM_REQUIRED, RETRY_BACKOFF_FACTOR,
    SERVER_ERROR_RETRY_DELAY_SECS,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, watch, Notify};
use tokio::time;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info, warn};

/// External consumer of per-session address status updates.
pub trait Ledger: Send + Sync + 'static {
    /// Handle a `blockchain.address.subscribe` notification received on
    /// `session`. Implementations should hand the work off; this is called
    /// from the session's dispatch task.
    fn process_status_update(&self, session: Arc<ClientSession>, args: Value);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Exponential backoff for transport failures. Server-side errors use a
/// fixed long delay instead and do not advance this schedule.
pub(crate) struct RetryDelay {
    delay_secs: u64,
}

impl RetryDelay {
    pub fn new() -> Self {
        Self { delay_secs: INITIAL_RETRY_DELAY_SECS }
    }

    pub fn reset(&mut self) {
        self.delay_secs = INITIAL_RETRY_DELAY_SECS;
    }

    /// The delay to sleep for this failure; the next one doubles, clamped
    /// at [`MAX_RETRY_DELAY_SECS`].
    pub fn on_transport_error(&mut self) -> Duration {
        let current = self.delay_secs;
        self.delay_secs = (self.delay_secs * RETRY_BACKOFF_FACTOR).min(MAX_RETRY_DELAY_SECS);
        Duration::from_secs(current)
    }
}

/// Running mean of `server.version` round trips since the last connect.
struct RttStats {
    mean: Option<f64>,
    samples: u32,
}

impl RttStats {
    fn record(&mut self, seconds: f64) {
        let sum = self.mean.unwrap_or(0.0) * self.samples as f64 + seconds;
        self.samples += 1;
        self.mean = Some(sum / self.samples as f64);
    }

    fn clear(&mut self) {
        self.mean = None;
        self.samples = 0;
    }
}

struct Transport {
    writer: tokio::sync::Mutex<FramedWrite<OwnedWriteHalf, LinesCodec>>,
    reader_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    peer: SocketAddr,
}

pub struct ClientSession {
    pub server: ServerEndpoint,
    timeout: Duration,
    connect_timeout: Duration,
    max_seconds_idle: Duration,

    ledger: Arc<dyn Ledger>,
    /// Pool-global header stream; every session publishes into the same
    /// one so the consumer follows whichever session is master.
    header_events: EventStream<Value>,
    /// Per-session address status stream.
    pub on_status: EventStream<Value>,

    state_tx: watch::Sender<ConnectionState>,
    urgent_reconnect: Notify,
    on_connect_cb: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,

    transport: Mutex<Option<Arc<Transport>>>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, NetError>>>>,
    pending_amount: AtomicUsize,

    rtt: Mutex<RttStats>,
    connection_latency: Mutex<Option<f64>>,
    last_send: Mutex<Instant>,
    last_packet_received: Mutex<Instant>,
}

/// Decrements `pending_amount` when the tracked call completes or is
/// dropped mid-flight.
struct PendingGuard<'a>(&'a AtomicUsize);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ClientSession {
    pub fn new(
        server: ServerEndpoint,
        ledger: Arc<dyn Ledger>,
        header_events: EventStream<Value>,
        timeout: Duration,
        connect_timeout: Duration,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let now = Instant::now();
        let session = Arc::new(Self {
            server,
            timeout,
            connect_timeout,
            max_seconds_idle: timeout * 2,
            ledger,
            header_events,
            on_status: EventStream::merging(),
            state_tx,
            urgent_reconnect: Notify::new(),
            on_connect_cb: Mutex::new(None),
            transport: Mutex::new(None),
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            pending_amount: AtomicUsize::new(0),
            rtt: Mutex::new(RttStats { mean: None, samples: 0 }),
            connection_latency: Mutex::new(None),
            last_send: Mutex::new(now),
            last_packet_received: Mutex::new(now),
        });
        Self::spawn_status_listener(&session);
        session
    }

    // -------------------------------------------------------------------
    // state accessors
    // -------------------------------------------------------------------

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Connected and has at least one `server.version` sample, so it can
    /// be ranked by the pool.
    pub fn available(&self) -> bool {
        self.is_connected() && self.response_time().is_some()
    }

    /// Mean `server.version` round trip in seconds since the last connect.
    pub fn response_time(&self) -> Option<f64> {
        self.rtt.lock().unwrap().mean
    }

    /// Wall time of the last connect, in seconds.
    pub fn connection_latency(&self) -> Option<f64> {
        *self.connection_latency.lock().unwrap()
    }

    pub fn pending_amount(&self) -> usize {
        self.pending_amount.load(Ordering::SeqCst)
    }

    /// Resolved remote address of the live transport, used to detect
    /// endpoints that alias the same server.
    pub fn peer_address(&self) -> Option<SocketAddr> {
        self.transport.lock().unwrap().as_ref().map(|t| t.peer)
    }

    /// Wake the reconnect task out of its backoff sleep.
    pub fn trigger_urgent_reconnect(&self) {
        self.urgent_reconnect.notify_one();
    }

    pub(crate) fn set_on_connect(&self, cb: Box<dyn Fn() + Send + Sync>) {
        *self.on_connect_cb.lock().unwrap() = Some(cb);
    }

    /// Resolve as soon as the session is disconnected. Level-triggered:
    /// returns immediately when already disconnected.
    pub async fn wait_disconnected(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Disconnected).await;
    }

    // -------------------------------------------------------------------
    // calls
    // -------------------------------------------------------------------

    /// Send one JSON-RPC call and await its response.
    ///
    /// While waiting, unrelated packets arriving on the connection (for
    /// instance subscription notifications) extend the wait: the call only
    /// fails with `Timeout` once the quiet gap itself exceeds the session
    /// timeout. `server.version` is routed through the timed variant.
    pub async fn send_request(&self, method: &str, params: Value) -> Result<Value, NetError> {
        self.pending_amount.fetch_add(1, Ordering::SeqCst);
        let _guard = PendingGuard(&self.pending_amount);

        let result = if method == "server.version" {
            self.send_timed_server_version_request(params, self.timeout).await
        } else {
            debug!("send {} to {}", method, self.server);
            self.call(method, params, self.timeout, true).await
        };

        match &result {
            Err(NetError::Rpc { code, message }) => {
                warn!(
                    "wallet server ({}) returned an error. code: {} message: {}",
                    self.server, code, message
                );
            }
            Err(NetError::ConnectionLost) => {
                warn!("connection to {} lost", self.server);
                self.synchronous_close();
            }
            _ => {}
        }
        result
    }

    /// `server.version` with a strict timeout, feeding the latency mean
    /// used for fastest-session ranking.
    pub async fn send_timed_server_version_request(
        &self,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, NetError> {
        debug!("send version request to {}", self.server);
        let start = Instant::now();
        let result = self.call("server.version", params, timeout, false).await?;
        self.rtt.lock().unwrap().record(start.elapsed().as_secs_f64());
        Ok(result)
    }

    /// Negotiate versions with the server. Fails with `Incompatible` when
    /// the reported version tuple is below [`MINIMUM_REQUIRED`].
    pub async fn ensure_server_version(&self, required: Option<&str>) -> Result<Value, NetError> {
        let required = required.unwrap_or(CLIENT_VERSION);
        let response = time::timeout(
            Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            self.send_request("server.version", json!([CLIENT_VERSION, required])),
        )
        .await
        .map_err(|_| NetError::Timeout)??;

        let reported = response
            .get(0)
            .and_then(Value::as_str)
            .ok_or_else(|| NetError::Protocol(format!("unexpected server.version reply: {response}")))?;
        let version = parse_server_version(reported)
            .ok_or_else(|| NetError::Protocol(format!("unparseable server version {reported:?}")))?;
        if version.as_slice() < &MINIMUM_REQUIRED[..] {
            return Err(NetError::Incompatible(self.server.clone()));
        }
        Ok(response)
    }

    async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        keepalive: bool,
    ) -> Result<Value, NetError> {
        let transport = self
            .transport
            .lock()
            .unwrap()
            .clone()
            .ok_or(NetError::ConnectionLost)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let line = encode_request(id, method, &params);
        {
            let mut writer = transport.writer.lock().await;
            if let Err(e) = writer.send(line).await {
                self.pending.lock().unwrap().remove(&id);
                debug!("send to {} failed: {}", self.server, e);
                return Err(NetError::ConnectionLost);
            }
        }
        *self.last_send.lock().unwrap() = Instant::now();

        loop {
            match time::timeout(timeout, &mut rx).await {
                Ok(Ok(result)) => return result,
                Ok(Err(_)) => return Err(NetError::ConnectionLost),
                Err(_) => {
                    let gap = self.last_packet_received.lock().unwrap().elapsed();
                    if keepalive && gap < timeout {
                        debug!("time since last packet: {:.3}s, extending wait", gap.as_secs_f64());
                        continue;
                    }
                    self.pending.lock().unwrap().remove(&id);
                    info!("timeout sending {} to {}", method, self.server);
                    return Err(NetError::Timeout);
                }
            }
        }
    }

    // -------------------------------------------------------------------
    // transport lifecycle
    // -------------------------------------------------------------------

    /// Establish the TCP transport and start the dispatch task. Records
    /// `connection_latency` on success.
    pub async fn create_connection(self: &Arc<Self>, timeout: Duration) -> Result<(), NetError> {
        self.synchronous_close();
        let _ = self.state_tx.send_replace(ConnectionState::Connecting);

        let start = Instant::now();
        let connect = TcpStream::connect((self.server.host.as_str(), self.server.port));
        let stream = match time::timeout(timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let _ = self.state_tx.send_replace(ConnectionState::Disconnected);
                return Err(NetError::Io(e));
            }
            Err(_) => {
                let _ = self.state_tx.send_replace(ConnectionState::Disconnected);
                return Err(NetError::Timeout);
            }
        };
        *self.connection_latency.lock().unwrap() = Some(start.elapsed().as_secs_f64());

        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(e) => {
                let _ = self.state_tx.send_replace(ConnectionState::Disconnected);
                return Err(NetError::Io(e));
            }
        };
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();
        let transport = Arc::new(Transport {
            writer: tokio::sync::Mutex::new(FramedWrite::new(write_half, line_codec())),
            reader_task: Mutex::new(None),
            peer,
        });
        *self.transport.lock().unwrap() = Some(transport.clone());

        let now = Instant::now();
        *self.last_send.lock().unwrap() = now;
        *self.last_packet_received.lock().unwrap() = now;

        let session = self.clone();
        let reader = FramedRead::new(read_half, line_codec());
        let task = tokio::spawn(session.read_loop(reader));
        *transport.reader_task.lock().unwrap() = Some(task);

        let _ = self.state_tx.send_replace(ConnectionState::Connected);
        debug!("connected transport to {} ({})", self.server, peer);
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, mut reader: FramedRead<OwnedReadHalf, LinesCodec>) {
        loop {
            match reader.next().await {
                Some(Ok(line)) => {
                    *self.last_packet_received.lock().unwrap() = Instant::now();
                    self.handle_frame(&line);
                }
                Some(Err(e)) => {
                    debug!("transport error from {}: {}", self.server, e);
                    break;
                }
                None => break,
            }
        }
        self.connection_lost();
    }

    fn handle_frame(self: &Arc<Self>, line: &str) {
        match decode_frame(line) {
            Ok(Incoming::Response { id, result }) => {
                let Some(tx) = self.pending.lock().unwrap().remove(&id) else {
                    debug!("unmatched response id {} from {}", id, self.server);
                    return;
                };
                let _ = tx.send(result.map_err(|e| NetError::Rpc { code: e.code, message: e.message }));
            }
            Ok(Incoming::Notification { method, params }) => match method.as_str() {
                "blockchain.headers.subscribe" => self.header_events.send(params),
                "blockchain.address.subscribe" => self.on_status.send(params),
                other => debug!("unhandled notification {} from {}", other, self.server),
            },
            // Malformed frames are logged and skipped; the error budget on
            // a session is effectively unlimited.
            Err(reason) => debug!("bad frame from {}: {}", self.server, reason),
        }
    }

    fn connection_lost(&self) {
        let transport = self.transport.lock().unwrap().take();
        let had_transport = transport.is_some();
        if let Some(transport) = transport {
            if let Some(task) = transport.reader_task.lock().unwrap().take() {
                task.abort();
            }
        }
        self.rtt.lock().unwrap().clear();
        *self.connection_latency.lock().unwrap() = None;

        let pending: Vec<_> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().collect()
        };
        for (_, tx) in pending {
            let _ = tx.send(Err(NetError::ConnectionLost));
        }

        let _ = self.state_tx.send_replace(ConnectionState::Disconnected);
        if had_transport {
            debug!("connection lost: {}", self.server);
        }
    }

    /// Tear the transport down immediately, failing all in-flight calls.
    pub fn synchronous_close(&self) {
        self.connection_lost();
    }

    /// Immediate teardown; alias kept for call sites that abandon a
    /// session mid-subscription.
    pub fn abort(&self) {
        self.connection_lost();
    }

    pub async fn close(&self) {
        self.synchronous_close();
        // Give the aborted dispatch task a turn to unwind.
        tokio::task::yield_now().await;
    }

    // -------------------------------------------------------------------
    // reconnect loop
    // -------------------------------------------------------------------

    /// Keep this session alive forever: connect and handshake when
    /// disconnected, re-handshake when idle past `max_seconds_idle` or
    /// when the latency mean was cleared, back off on failure. The backoff
    /// sleep is cut short by [`ClientSession::trigger_urgent_reconnect`].
    pub async fn ensure_session(self: Arc<Self>) {
        let mut retry = RetryDelay::new();
        loop {
            let delay = match self.session_tick().await {
                Ok(()) => {
                    retry.reset();
                    Duration::from_secs(INITIAL_RETRY_DELAY_SECS)
                }
                Err(NetError::Cancelled) => return,
                Err(e) if e.is_server_error() => {
                    self.close().await;
                    debug!("server error, ignoring for 1h: {} -- {}", self.server, e);
                    Duration::from_secs(SERVER_ERROR_RETRY_DELAY_SECS)
                }
                Err(NetError::Incompatible(_)) => {
                    self.close().await;
                    debug!(
                        "wallet server has an incompatible version, retrying in 1h: {}",
                        self.server
                    );
                    Duration::from_secs(SERVER_ERROR_RETRY_DELAY_SECS)
                }
                Err(e) => {
                    self.close().await;
                    let delay = retry.on_transport_error();
                    debug!(
                        "wallet server timeout (retry in {}s): {} -- {}",
                        delay.as_secs(),
                        self.server,
                        e
                    );
                    delay
                }
            };
            tokio::select! {
                _ = time::sleep(delay) => {}
                _ = self.urgent_reconnect.notified() => {}
            }
        }
    }

    async fn session_tick(self: &Arc<Self>) -> Result<(), NetError> {
        if !self.is_connected() {
            self.create_connection(self.connect_timeout).await?;
            self.ensure_server_version(None).await?;
            self.notify_connected();
        }
        let idle = self.last_send.lock().unwrap().elapsed();
        if idle > self.max_seconds_idle || self.response_time().is_none() {
            self.ensure_server_version(None).await?;
        }
        Ok(())
    }

    fn notify_connected(&self) {
        if let Some(cb) = &*self.on_connect_cb.lock().unwrap() {
            cb();
        }
    }

    fn spawn_status_listener(session: &Arc<Self>) {
        let weak = Arc::downgrade(session);
        let mut rx = session.on_status.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(args) => match weak.upgrade() {
                        Some(session) => {
                            let ledger = session.ledger.clone();
                            ledger.process_status_update(session, args);
                        }
                        None => break,
                    },
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("server", &self.server)
            .field("state", &self.connection_state())
            .field("response_time", &self.response_time())
            .field("pending_amount", &self.pending_amount())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_progression_doubles_and_clamps() {
        let mut retry = RetryDelay::new();
        let observed: Vec<u64> =
            (0..8).map(|_| retry.on_transport_error().as_secs()).collect();
        assert_eq!(observed, vec![1, 2, 4, 8, 16, 32, 60, 60]);

        retry.reset();
        assert_eq!(retry.on_transport_error().as_secs(), 1);
    }

    #[test]
    fn rtt_running_mean() {
        let mut rtt = RttStats { mean: None, samples: 0 };
        rtt.record(0.1);
        assert!((rtt.mean.unwrap() - 0.1).abs() < 1e-9);
        rtt.record(0.3);
        assert!((rtt.mean.unwrap() - 0.2).abs() < 1e-9);
        assert_eq!(rtt.samples, 2);

        rtt.clear();
        assert!(rtt.mean.is_none());
        assert_eq!(rtt.samples, 0);
    }
}
