//! Network runtime: owns the session pool, maintains the master session,
//! and routes RPC traffic.
//!
//! The master session is the one the switcher task most recently adopted
//! from the pool; subscriptions and calls that depend on a single server's
//! view of recent state are pinned to it, while cold queries spread over
//! whichever pooled session is currently fastest.

use crate::error::NetError;
use crate::net::events::EventStream;
use crate::net::pool::SessionPool;
use crate::net::session::{ClientSession, Ledger};
use crate::net::types::{NetConfig, MAX_CONCURRENT_CALLS};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct Network {
    config: NetConfig,
    ledger: Arc<dyn Ledger>,
    pub pool: Arc<SessionPool>,

    /// Master session adopted by the switcher; `None` between servers.
    client: Mutex<Option<Arc<ClientSession>>>,
    server_features: Mutex<Option<Value>>,
    remote_height: AtomicI32,

    running: watch::Sender<bool>,
    concurrency: Semaphore,

    /// Fires `true` once per master adoption.
    pub on_connected: EventStream<bool>,
    /// Header notifications from whichever session is master, consecutive
    /// duplicates collapsed.
    pub on_header: EventStream<Value>,

    switch_task: Mutex<Option<JoinHandle<()>>>,
    height_task: Mutex<Option<JoinHandle<()>>>,
    http: Mutex<Option<reqwest::Client>>,
}

impl Network {
    pub fn new(config: NetConfig, ledger: Arc<dyn Ledger>) -> Arc<Self> {
        let on_header = EventStream::merging();
        let pool = SessionPool::new(config.clone(), ledger.clone(), on_header.clone());
        let (running, _) = watch::channel(false);
        Arc::new(Self {
            config,
            ledger,
            pool,
            client: Mutex::new(None),
            server_features: Mutex::new(None),
            remote_height: AtomicI32::new(0),
            running,
            concurrency: Semaphore::new(MAX_CONCURRENT_CALLS),
            on_connected: EventStream::new(),
            on_header,
            switch_task: Mutex::new(None),
            height_task: Mutex::new(None),
            http: Mutex::new(None),
        })
    }

    // -------------------------------------------------------------------
    // lifecycle
    // -------------------------------------------------------------------

    pub async fn start(self: &Arc<Self>) {
        if self.is_running() {
            return;
        }
        let _ = self.running.send_replace(true);
        *self.http.lock().unwrap() = Some(reqwest::Client::new());

        let network = self.clone();
        *self.switch_task.lock().unwrap() = Some(tokio::spawn(async move {
            network.switch_forever().await;
            info!("wallet client switching task stopped");
        }));

        let network = self.clone();
        let mut headers = self.on_header.subscribe();
        *self.height_task.lock().unwrap() = Some(tokio::spawn(async move {
            loop {
                match headers.recv().await {
                    Ok(args) => network.update_remote_height(&args),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        self.pool.start(&self.config.default_servers);
    }

    /// Cancel the switcher, close the pool (which cancels every reconnect
    /// task and closes transports synchronously), and fail in-flight
    /// retriable calls with `Cancelled`.
    pub async fn stop(&self) {
        if !self.is_running() {
            return;
        }
        let _ = self.running.send_replace(false);
        self.concurrency.close();
        if let Some(task) = self.switch_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(task) = self.height_task.lock().unwrap().take() {
            task.abort();
        }
        *self.http.lock().unwrap() = None;
        self.pool.stop();
        *self.client.lock().unwrap() = None;
        *self.server_features.lock().unwrap() = None;
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// The current master session, if one is adopted.
    pub fn client(&self) -> Option<Arc<ClientSession>> {
        self.client.lock().unwrap().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.client().is_some_and(|c| c.is_connected())
    }

    pub fn server_features(&self) -> Option<Value> {
        self.server_features.lock().unwrap().clone()
    }

    /// Latest chain height observed on the master's header stream.
    pub fn remote_height(&self) -> i32 {
        self.remote_height.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------
    // master switching
    // -------------------------------------------------------------------

    async fn switch_forever(self: &Arc<Self>) {
        while self.is_running() {
            if let Some(client) = self.client() {
                if client.is_connected() {
                    client.wait_disconnected().await;
                }
                *self.server_features.lock().unwrap() = None;
                *self.client.lock().unwrap() = None;
                continue;
            }

            let client = self.pool.wait_for_fastest_session().await;
            info!("switching to SPV wallet server: {}", client.server);
            *self.client.lock().unwrap() = Some(client.clone());
            match self.adopt_master().await {
                Ok(()) => {
                    self.on_connected.send(true);
                    info!("subscribed to headers: {}", client.server);
                }
                Err(e) => {
                    info!("switching to {} failed ({}), closing and retrying", client.server, e);
                    client.synchronous_close();
                    *self.server_features.lock().unwrap() = None;
                    *self.client.lock().unwrap() = None;
                }
            }
        }
    }

    async fn adopt_master(&self) -> Result<(), NetError> {
        let features = self.get_server_features(None).await?;
        *self.server_features.lock().unwrap() = Some(features);
        let header = self.subscribe_headers().await?;
        self.update_remote_height(&json!([header]));
        Ok(())
    }

    fn update_remote_height(&self, args: &Value) {
        match args.get(0).and_then(|h| h.get("height")).and_then(Value::as_i64) {
            Some(height) => self.remote_height.store(height as i32, Ordering::SeqCst),
            None => debug!("header event without height: {}", args),
        }
    }

    // -------------------------------------------------------------------
    // rpc routing
    // -------------------------------------------------------------------

    /// Dispatch one call. Explicit `session` wins; otherwise restricted
    /// calls go to the master and unrestricted ones to the pool's fastest
    /// session. With nothing connected this urges the pool to reconnect
    /// and fails immediately.
    pub async fn rpc(
        &self,
        method: &str,
        args: Value,
        restricted: bool,
        session: Option<Arc<ClientSession>>,
    ) -> Result<Value, NetError> {
        let session = session.or_else(|| {
            if restricted {
                self.client()
            } else {
                self.pool.fastest_session()
            }
        });
        match session {
            Some(session) if session.is_connected() => session.send_request(method, args).await,
            _ => {
                self.pool.trigger_nodelay_connect();
                Err(NetError::Connection(
                    "attempting to send rpc request when connection is not available".into(),
                ))
            }
        }
    }

    /// Run `call` until it returns a non-retriable result, re-waiting for
    /// a master and a fastest session around each attempt. Concurrency is
    /// bounded by a global semaphore; shutdown resolves the call with
    /// `Cancelled`.
    pub async fn retriable_call<T, F, Fut>(&self, call: F) -> Result<T, NetError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, NetError>>,
    {
        let _permit = self
            .concurrency
            .acquire()
            .await
            .map_err(|_| NetError::Cancelled)?;
        let mut shutdown = self.running.subscribe();
        loop {
            if !self.is_running() {
                break;
            }
            let attempt = async {
                if !self.is_connected() {
                    // Subscribe before re-checking so an adoption landing
                    // in between is not missed.
                    let mut connected = self.on_connected.subscribe();
                    if !self.is_connected() {
                        warn!("wallet server unavailable, waiting for it to come back and retry");
                        loop {
                            match connected.recv().await {
                                Ok(_) => break,
                                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                                Err(broadcast::error::RecvError::Closed) => {
                                    return Err(NetError::Cancelled)
                                }
                            }
                        }
                    }
                }
                self.pool.wait_for_fastest_session().await;
                call().await
            };
            tokio::select! {
                result = attempt => match result {
                    Err(e) if e.is_retriable() => {
                        if matches!(e, NetError::Timeout) {
                            warn!("wallet server call timed out, retrying");
                        }
                        continue;
                    }
                    other => return other,
                },
                _ = shutdown.changed() => break,
            }
        }
        Err(NetError::Cancelled)
    }

    /// A fresh unpooled session to the current fastest endpoint, connected
    /// and version-checked. The caller owns it and must close it.
    pub async fn dedicated_session(&self) -> Result<Arc<ClientSession>, NetError> {
        let fastest = self.pool.wait_for_fastest_session().await;
        let session = ClientSession::new(
            fastest.server.clone(),
            self.ledger.clone(),
            self.on_header.clone(),
            self.config.session_timeout,
            self.config.connect_timeout,
        );
        session.create_connection(self.config.connect_timeout).await?;
        session.ensure_server_version(None).await?;
        Ok(session)
    }

    // -------------------------------------------------------------------
    // transaction and header queries
    // -------------------------------------------------------------------

    pub async fn get_transaction(
        &self,
        tx_hash: &str,
        known_height: Option<i32>,
        session: Option<Arc<ClientSession>>,
    ) -> Result<Value, NetError> {
        // Use any server if it's old, otherwise restrict to who gave us
        // the history.
        let restricted = recent_or_unconfirmed(known_height, self.remote_height());
        self.rpc("blockchain.transaction.get", json!([tx_hash]), restricted, session).await
    }

    pub async fn get_transaction_batch(
        &self,
        txids: &[String],
        restricted: bool,
        session: Option<Arc<ClientSession>>,
    ) -> Result<Value, NetError> {
        self.rpc("blockchain.transaction.get_batch", json!(txids), restricted, session).await
    }

    pub async fn get_transaction_and_merkle(
        &self,
        tx_hash: &str,
        known_height: Option<i32>,
        session: Option<Arc<ClientSession>>,
    ) -> Result<Value, NetError> {
        let restricted = recent_or_unconfirmed(known_height, self.remote_height());
        self.rpc("blockchain.transaction.info", json!([tx_hash]), restricted, session).await
    }

    pub async fn get_transaction_height(
        &self,
        tx_hash: &str,
        known_height: Option<i32>,
        session: Option<Arc<ClientSession>>,
    ) -> Result<Value, NetError> {
        let restricted = recent_or_unconfirmed(known_height, self.remote_height());
        self.rpc("blockchain.transaction.get_height", json!([tx_hash]), restricted, session).await
    }

    pub async fn get_merkle(
        &self,
        tx_hash: &str,
        height: i32,
        session: Option<Arc<ClientSession>>,
    ) -> Result<Value, NetError> {
        let restricted = recent_or_unconfirmed(Some(height), self.remote_height());
        self.rpc("blockchain.transaction.get_merkle", json!([tx_hash, height]), restricted, session)
            .await
    }

    pub async fn get_headers(&self, height: i32, count: u32, b64: bool) -> Result<Value, NetError> {
        let restricted = height >= self.remote_height() - 100;
        self.rpc("blockchain.block.headers", json!([height, count, 0, b64]), restricted, None).await
    }

    // --- Subscribes, history and broadcasts always aim at the master ---

    pub async fn get_history(
        &self,
        address: &str,
        session: Option<Arc<ClientSession>>,
    ) -> Result<Value, NetError> {
        self.rpc("blockchain.address.get_history", json!([address]), true, session).await
    }

    pub async fn broadcast(
        &self,
        raw_transaction: &str,
        session: Option<Arc<ClientSession>>,
    ) -> Result<Value, NetError> {
        self.rpc("blockchain.transaction.broadcast", json!([raw_transaction]), true, session).await
    }

    pub async fn subscribe_headers(&self) -> Result<Value, NetError> {
        self.rpc("blockchain.headers.subscribe", json!([true]), true, None).await
    }

    /// Subscribe the given session to address status updates. A timeout
    /// here aborts the session: a lost subscription must not go unnoticed,
    /// and the reconnect will re-subscribe.
    pub async fn subscribe_address(
        &self,
        session: Arc<ClientSession>,
        addresses: &[String],
    ) -> Result<Value, NetError> {
        let peer = session.peer_address();
        match self
            .rpc("blockchain.address.subscribe", json!(addresses), true, Some(session.clone()))
            .await
        {
            Err(NetError::Timeout) => {
                warn!("timed out subscribing to addresses from {:?}", peer);
                session.abort();
                Err(NetError::Cancelled)
            }
            other => other,
        }
    }

    pub async fn unsubscribe_address(
        &self,
        address: &str,
        session: Option<Arc<ClientSession>>,
    ) -> Result<Value, NetError> {
        self.rpc("blockchain.address.unsubscribe", json!([address]), true, session).await
    }

    pub async fn get_server_features(
        &self,
        session: Option<Arc<ClientSession>>,
    ) -> Result<Value, NetError> {
        self.rpc("server.features", json!([]), true, session).await
    }

    // -------------------------------------------------------------------
    // claim queries
    // -------------------------------------------------------------------

    pub async fn get_claims_by_ids(&self, claim_ids: &[String]) -> Result<Value, NetError> {
        self.rpc("blockchain.claimtrie.getclaimsbyids", json!(claim_ids), true, None).await
    }

    pub async fn resolve(
        &self,
        urls: &[String],
        session_override: Option<Arc<ClientSession>>,
    ) -> Result<Value, NetError> {
        self.rpc("blockchain.claimtrie.resolve", json!(urls), false, session_override).await
    }

    pub async fn claim_search(
        &self,
        kwargs: Value,
        session_override: Option<Arc<ClientSession>>,
    ) -> Result<Value, NetError> {
        self.rpc("blockchain.claimtrie.search", kwargs, false, session_override).await
    }

    // -------------------------------------------------------------------
    // HTTP resolver path
    // -------------------------------------------------------------------

    pub async fn new_resolve(&self, server: &str, urls: &[String]) -> Result<Value, NetError> {
        let message = json!({"method": "resolve", "params": {"urls": urls, "protobuf": true}});
        self.http_post(server, message).await
    }

    pub async fn new_claim_search(&self, server: &str, mut kwargs: Value) -> Result<Value, NetError> {
        kwargs["protobuf"] = json!(true);
        let message = json!({"method": "claim_search", "params": kwargs});
        self.http_post(server, message).await
    }

    pub async fn sum_supports(&self, server: &str, kwargs: Value) -> Result<Value, NetError> {
        let message = json!({"method": "support_sum", "params": kwargs});
        self.http_post(server, message).await
    }

    async fn http_post(&self, server: &str, message: Value) -> Result<Value, NetError> {
        let client = self
            .http
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| NetError::Connection("http client is not running".into()))?;
        let response = client.post(server).json(&message).send().await?;
        let mut body: Value = response.json().await?;
        Ok(body.get_mut("result").map(Value::take).unwrap_or(Value::Null))
    }

    // -------------------------------------------------------------------
    // wallet-pinned sessions
    // -------------------------------------------------------------------

    pub async fn connect_wallet(&self, wallet_id: &str) -> Result<(), NetError> {
        self.pool.connect_wallet(wallet_id).await
    }

    pub async fn connect_wallets(&self, wallet_ids: &[&str]) {
        let connects = wallet_ids.iter().map(|id| self.pool.connect_wallet(id));
        for result in futures::future::join_all(connects).await {
            if let Err(e) = result {
                warn!("wallet connect failed: {}", e);
            }
        }
    }

    pub fn get_wallet_session(&self, wallet_id: &str) -> Option<Arc<ClientSession>> {
        self.pool.wallet_session(wallet_id)
    }

    pub fn is_wallet_connected(&self, wallet_id: &str) -> bool {
        self.pool.is_wallet_connected(wallet_id)
    }

    pub async fn close_wallet_session(&self, wallet_id: &str) -> Result<(), NetError> {
        self.pool.close_wallet_session(wallet_id).await
    }
}

/// Transaction routing predicate: a query must go to the master when the
/// caller's height for it is missing or unconfirmed, or falls within the
/// last 10 blocks of the remote tip; older heights may be served by any
/// available session.
fn recent_or_unconfirmed(known_height: Option<i32>, remote_height: i32) -> bool {
    match known_height {
        None => true,
        Some(h) if h <= 0 => true,
        Some(h) => h > remote_height - 10,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_predicate_table() {
        // Missing or mempool heights always restrict to the master.
        assert!(recent_or_unconfirmed(None, 1000));
        assert!(recent_or_unconfirmed(Some(0), 1000));
        assert!(recent_or_unconfirmed(Some(-1), 1000));

        // Within the last 10 blocks of the tip.
        assert!(recent_or_unconfirmed(Some(995), 1000));
        assert!(recent_or_unconfirmed(Some(991), 1000));

        // Old enough to be served by anyone.
        assert!(!recent_or_unconfirmed(Some(990), 1000));
        assert!(!recent_or_unconfirmed(Some(500), 1000));
    }
}
