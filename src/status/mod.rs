//! UDP status endpoint: lightweight liveness and chain-tip advertisement.
//!
//! The server answers 69-byte pings with a cached 38-byte pong prefix plus
//! the sender's IPv4 octets. Per-host throttling and the pong cache keep
//! the datagram path allocation-free and cheap under flood.

pub mod codec;
pub mod throttle;

pub use codec::{DecodeError, SpvPing, SpvPong, FLAG_AVAILABLE, PROTOCOL_VERSION};
pub use throttle::ThrottleCache;

use crate::error::NetError;
use codec::{PONG_PREFIX_SIZE, PONG_SIZE};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Monotonic second counter for throttle buckets, advanced by the delta
/// between datagram arrivals. Independent of wall clock adjustments.
struct BucketClock {
    elapsed: f64,
    last: Instant,
}

impl BucketClock {
    fn new() -> Self {
        Self { elapsed: 0.0, last: Instant::now() }
    }

    fn advance(&mut self) -> u32 {
        let now = Instant::now();
        self.elapsed += now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.elapsed as u32
    }
}

struct PongState {
    height: i32,
    tip: [u8; 32],
    flags: u8,
    cached: [u8; PONG_PREFIX_SIZE],
}

impl PongState {
    fn new() -> Self {
        let mut state = Self { height: 0, tip: [0u8; 32], flags: 0, cached: [0u8; PONG_PREFIX_SIZE] };
        state.rebuild();
        state
    }

    fn rebuild(&mut self) {
        self.cached = SpvPong::make(self.height, &self.tip, self.flags, PROTOCOL_VERSION);
    }
}

/// The status endpoint. Chain state may be set before or after `start`;
/// the datagram task reads the cached pong on every response.
pub struct StatusServer {
    state: Arc<Mutex<PongState>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StatusServer {
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(PongState::new())), task: Mutex::new(None) }
    }

    /// Bind the datagram endpoint and start answering pings. `SO_REUSEPORT`
    /// is set so multiple processes may share the port. Returns the bound
    /// address; a second `start` while running is a no-op reporting an
    /// unspecified address.
    pub async fn start(&self, interface: &str, port: u16) -> Result<SocketAddr, NetError> {
        {
            let task = self.task.lock().unwrap();
            if task.as_ref().is_some_and(|t| !t.is_finished()) {
                return Ok(SocketAddr::new(IpAddr::from([0, 0, 0, 0]), 0));
            }
        }

        let ip: IpAddr = interface
            .parse()
            .map_err(|e| NetError::Connection(format!("bad status interface {interface:?}: {e}")))?;
        let addr = SocketAddr::new(ip, port);
        let socket = bind_reuseport(addr)?;
        let bound = socket.local_addr()?;

        let state = self.state.clone();
        let task = tokio::spawn(async move {
            datagram_loop(socket, state, ThrottleCache::default()).await;
        });
        *self.task.lock().unwrap() = Some(task);
        info!("started udp status server on {}", bound);
        Ok(bound)
    }

    /// Close the endpoint. Idempotent.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().unwrap().as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn set_available(&self) {
        let mut state = self.state.lock().unwrap();
        state.flags |= FLAG_AVAILABLE;
        state.rebuild();
    }

    pub fn set_unavailable(&self) {
        let mut state = self.state.lock().unwrap();
        state.flags &= !FLAG_AVAILABLE;
        state.rebuild();
    }

    pub fn set_height(&self, height: i32, tip: [u8; 32]) {
        let mut state = self.state.lock().unwrap();
        state.height = height;
        state.tip = tip;
        state.rebuild();
    }
}

impl Default for StatusServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StatusServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_reuseport(addr: SocketAddr) -> Result<UdpSocket, NetError> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

async fn datagram_loop(socket: UdpSocket, state: Arc<Mutex<PongState>>, mut throttle: ThrottleCache) {
    let mut clock = BucketClock::new();
    let mut buf = [0u8; 1024];
    loop {
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("status server receive error: {}", e);
                continue;
            }
        };
        let bucket = clock.advance();
        let host = addr.ip().to_string();
        if throttle.should_throttle(bucket, &host) {
            continue;
        }
        if let Err(e) = SpvPing::decode(&buf[..len]) {
            debug!("invalid ping from {}: {}", addr, e);
            continue;
        }
        // The pong format carries an IPv4 echo only.
        let IpAddr::V4(v4) = addr.ip() else {
            debug!("dropping ping from non-IPv4 source {}", addr);
            continue;
        };
        let mut pong = [0u8; PONG_SIZE];
        {
            let state = state.lock().unwrap();
            pong[..PONG_PREFIX_SIZE].copy_from_slice(&state.cached);
        }
        pong[PONG_PREFIX_SIZE..].copy_from_slice(&v4.octets());
        if let Err(e) = socket.send_to(&pong, addr).await {
            debug!("status reply to {} failed: {}", addr, e);
        }
    }
}

/// Send one ping to a status endpoint and decode the reply. Client-side
/// counterpart of [`StatusServer`], useful for liveness probes.
pub async fn probe(server: SocketAddr, timeout: Duration) -> Result<SpvPong, NetError> {
    let bind: SocketAddr = if server.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16, 0, 0, 0, 0, 0, 0, 0], 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.send_to(&SpvPing::make(), server).await?;

    let mut buf = [0u8; 128];
    let receive = async {
        loop {
            let (len, from) = socket.recv_from(&mut buf).await?;
            if from != server {
                continue;
            }
            match SpvPong::decode(&buf[..len]) {
                Ok(pong) => return Ok(pong),
                Err(e) => {
                    debug!("bad pong from {}: {}", from, e);
                    continue;
                }
            }
        }
    };
    tokio::time::timeout(timeout, receive).await.map_err(|_| NetError::Timeout)?
}
