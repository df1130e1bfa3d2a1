//! Session pool: owns the reconnect tasks for the configured servers,
//! ranks available sessions by observed latency, and collapses endpoints
//! that resolve to the same peer.

use crate::error::NetError;
use crate::net::events::EventStream;
use crate::net::session::{ClientSession, Ledger};
use crate::net::types::{NetConfig, ServerEndpoint, DUPLICATE_RECHECK_DELAY_SECS};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

struct PoolEntry {
    session: Arc<ClientSession>,
    task: JoinHandle<()>,
}

struct WalletEntry {
    session: Arc<ClientSession>,
    task: JoinHandle<()>,
}

/// Snapshot of pool state.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub sessions: usize,
    pub available: usize,
    pub wallets: usize,
}

pub struct SessionPool {
    config: NetConfig,
    ledger: Arc<dyn Ledger>,
    /// Shared header stream published into by every session.
    header_events: EventStream<Value>,

    sessions: Mutex<Vec<PoolEntry>>,
    wallets: Mutex<HashMap<String, WalletEntry>>,
    /// Deferred re-probe tasks for collapsed duplicate endpoints.
    probes: Mutex<Vec<JoinHandle<()>>>,

    new_connection: Notify,
    stopped: AtomicBool,
}

impl SessionPool {
    pub fn new(config: NetConfig, ledger: Arc<dyn Ledger>, header_events: EventStream<Value>) -> Arc<Self> {
        Arc::new(Self {
            config,
            ledger,
            header_events,
            sessions: Mutex::new(Vec::new()),
            wallets: Mutex::new(HashMap::new()),
            probes: Mutex::new(Vec::new()),
            new_connection: Notify::new(),
            stopped: AtomicBool::new(false),
        })
    }

    /// Spawn a reconnect task per configured endpoint.
    pub fn start(self: &Arc<Self>, servers: &[ServerEndpoint]) {
        for server in servers {
            self.connect_session(server);
        }
    }

    /// Cancel every reconnect task and close every session synchronously.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        for entry in self.sessions.lock().unwrap().drain(..) {
            entry.task.abort();
            entry.session.synchronous_close();
        }
        for (_, entry) in self.wallets.lock().unwrap().drain() {
            entry.task.abort();
            entry.session.synchronous_close();
        }
        for probe in self.probes.lock().unwrap().drain(..) {
            probe.abort();
        }
    }

    pub fn stats(&self) -> PoolStats {
        let sessions = self.sessions.lock().unwrap();
        PoolStats {
            sessions: sessions.len(),
            available: sessions.iter().filter(|e| e.session.available()).count(),
            wallets: self.wallets.lock().unwrap().len(),
        }
    }

    /// Endpoints currently owned by the pool's default set.
    pub fn session_servers(&self) -> Vec<ServerEndpoint> {
        self.sessions.lock().unwrap().iter().map(|e| e.session.server.clone()).collect()
    }

    pub fn online(&self) -> bool {
        self.sessions.lock().unwrap().iter().any(|e| e.session.is_connected())
    }

    /// The available session minimizing
    /// `(response_time + connection_latency) * (pending_amount + 1)`.
    /// First-wins on ties; `None` when nothing is available.
    pub fn fastest_session(&self) -> Option<Arc<ClientSession>> {
        let sessions = self.sessions.lock().unwrap();
        let mut best: Option<(f64, Arc<ClientSession>)> = None;
        for entry in sessions.iter() {
            let session = &entry.session;
            if !session.available() {
                continue;
            }
            let score = session_score(
                session.response_time().unwrap_or(0.0),
                session.connection_latency().unwrap_or(0.0),
                session.pending_amount(),
            );
            match &best {
                Some((current, _)) if score >= *current => {}
                _ => best = Some((score, session.clone())),
            }
        }
        best.map(|(_, session)| session)
    }

    /// Block until a session is available, urging every reconnect task to
    /// retry without delay in the meantime.
    pub async fn wait_for_fastest_session(&self) -> Arc<ClientSession> {
        loop {
            if let Some(session) = self.fastest_session() {
                return session;
            }
            self.trigger_nodelay_connect();
            let notified = self.new_connection.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(session) = self.fastest_session() {
                return session;
            }
            notified.await;
        }
    }

    /// Wake every session sleeping in reconnect backoff. Used when other
    /// parts of the system believe connectivity has returned.
    pub fn trigger_nodelay_connect(&self) {
        for entry in self.sessions.lock().unwrap().iter() {
            entry.session.trigger_urgent_reconnect();
        }
    }

    /// Ensure a session and reconnect task exist for `server`. Reuses the
    /// existing session when present, respawning its task only if the old
    /// one has finished.
    pub fn connect_session(self: &Arc<Self>, server: &ServerEndpoint) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(entry) = sessions.iter_mut().find(|e| e.session.server == *server) {
            if entry.task.is_finished() {
                entry.task = tokio::spawn(entry.session.clone().ensure_session());
            }
            return;
        }
        let session = self.new_session(server.clone());
        let cb_pool = Arc::downgrade(self);
        let cb_session = Arc::downgrade(&session);
        session.set_on_connect(Box::new(move || {
            if let (Some(pool), Some(session)) = (cb_pool.upgrade(), cb_session.upgrade()) {
                pool.on_session_connected(&session);
            }
        }));
        let task = tokio::spawn(session.clone().ensure_session());
        sessions.push(PoolEntry { session, task });
    }

    fn new_session(&self, server: ServerEndpoint) -> Arc<ClientSession> {
        ClientSession::new(
            server,
            self.ledger.clone(),
            self.header_events.clone(),
            self.config.session_timeout,
            self.config.connect_timeout,
        )
    }

    /// Runs on every successful handshake of a pooled session. Collapses
    /// this session when another one already resolves to the same peer
    /// address, scheduling a re-probe of the endpoint in an hour;
    /// otherwise announces the new connection.
    fn on_session_connected(self: &Arc<Self>, session: &Arc<ClientSession>) {
        let peer = session.peer_address();
        let duplicate = {
            let mut sessions = self.sessions.lock().unwrap();
            let duplicate = peer.is_some()
                && sessions.iter().any(|e| {
                    !Arc::ptr_eq(&e.session, session) && e.session.peer_address() == peer
                });
            if duplicate {
                if let Some(pos) =
                    sessions.iter().position(|e| Arc::ptr_eq(&e.session, session))
                {
                    let entry = sessions.remove(pos);
                    entry.task.abort();
                }
            }
            duplicate
        };

        if duplicate {
            session.synchronous_close();
            debug!(
                "wallet server {} resolves to the same server as an existing session, rechecking in an hour",
                session.server
            );
            let pool = Arc::downgrade(self);
            let server = session.server.clone();
            let probe = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(DUPLICATE_RECHECK_DELAY_SECS)).await;
                if let Some(pool) = pool.upgrade() {
                    pool.connect_session(&server);
                }
            });
            self.probes.lock().unwrap().push(probe);
            return;
        }

        self.new_connection.notify_waiters();
        info!("connected to {}", session.server);
    }

    // -------------------------------------------------------------------
    // wallet-pinned sessions
    // -------------------------------------------------------------------

    /// Attach a wallet-pinned session using the current fastest session's
    /// endpoint, and wait for it to come up.
    pub async fn connect_wallet(self: &Arc<Self>, wallet_id: &str) -> Result<(), NetError> {
        let fastest = self.wait_for_fastest_session().await;

        let mut connected_rx = {
            let mut wallets = self.wallets.lock().unwrap();
            if let Some(entry) = wallets.get_mut(wallet_id) {
                if entry.session.is_connected() {
                    return Ok(());
                }
                let (tx, rx) = watch::channel(false);
                entry.session.set_on_connect(Box::new(move || {
                    let _ = tx.send(true);
                }));
                if entry.task.is_finished() {
                    entry.task = tokio::spawn(entry.session.clone().ensure_session());
                }
                rx
            } else {
                let session = self.new_session(fastest.server.clone());
                let (tx, rx) = watch::channel(false);
                session.set_on_connect(Box::new(move || {
                    let _ = tx.send(true);
                }));
                let task = tokio::spawn(session.clone().ensure_session());
                wallets.insert(wallet_id.to_string(), WalletEntry { session, task });
                rx
            }
        };
        connected_rx
            .wait_for(|connected| *connected)
            .await
            .map_err(|_| NetError::Cancelled)?;
        Ok(())
    }

    pub fn wallet_session(&self, wallet_id: &str) -> Option<Arc<ClientSession>> {
        self.wallets.lock().unwrap().get(wallet_id).map(|e| e.session.clone())
    }

    pub fn is_wallet_connected(&self, wallet_id: &str) -> bool {
        self.wallet_session(wallet_id).is_some_and(|s| s.is_connected())
    }

    /// Detach and close a wallet-pinned session.
    pub async fn close_wallet_session(&self, wallet_id: &str) -> Result<(), NetError> {
        let entry = self.wallets.lock().unwrap().remove(wallet_id);
        match entry {
            Some(entry) => {
                entry.task.abort();
                entry.session.close().await;
                Ok(())
            }
            None => Err(NetError::Connection(format!("no session for wallet {wallet_id}"))),
        }
    }
}

/// Selection score: smaller is better. Latency terms are in seconds; the
/// pending multiplier penalizes sessions with queued calls.
pub(crate) fn session_score(response_time: f64, connection_latency: f64, pending: usize) -> f64 {
    (response_time + connection_latency) * (pending as f64 + 1.0)
}
