use std::fmt::{Debug, Formatter};
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

use crate::session::multiplexer::Multiplexer;
use crate::session::port_allocation::first_free_port;

/// Identifies a logical endpoint on the far side of the serial link, independent of the
///  direction of traffic
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SessionKey {
    pub address_id: u8,
    pub port_b: u16,
}

pub struct Session {
    pub key: SessionKey,
    pub local_port: u16,
    pub socket: Arc<UdpSocket>,
}
impl Debug for Session {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SESSION{{{}:{}@{}}}", self.key.address_id, self.key.port_b, self.local_port)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no free local port for remote address {address_id}:{port_b} at or above {start}")]
    PortsExhausted { address_id: u8, port_b: u16, start: u16 },
    #[error("failed to bind local port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("session table was torn down")]
    TornDown,
}

#[derive(Default)]
struct SessionIndexes {
    by_key: FxHashMap<SessionKey, Arc<Session>>,
    by_local_port: FxHashMap<u16, SessionKey>,
}

/// Maps remote endpoints to locally bound UDP sockets and back. The inbound direction creates
///  sessions, the outbound direction does reverse lookups.
///
/// Both indexes and the multiplexer registration are only changed while holding the write lock,
///  so readers never see a session that is in one index but not the other, or a registered
///  socket without a session.
///
/// Sessions are never evicted: they live until [SessionTable::teardown]. After that, no new
///  sessions are created.
pub struct SessionTable {
    bind_addr: IpAddr,
    port_range: Range<u16>,
    indexes: RwLock<SessionIndexes>,
    multiplexer: Arc<Multiplexer>,
    torn_down: AtomicBool,
}

impl SessionTable {
    pub fn new(bind_addr: IpAddr, port_range: Range<u16>, multiplexer: Arc<Multiplexer>) -> SessionTable {
        SessionTable {
            bind_addr,
            port_range,
            indexes: Default::default(),
            multiplexer,
            torn_down: AtomicBool::new(false),
        }
    }

    /// Returns the session for `(address_id, port_b)`, binding a new local socket if there is
    ///  none yet. `delivery_port` is only used for logging.
    pub async fn resolve_or_create(&self, address_id: u8, port_b: u16, delivery_port: u16) -> Result<Arc<Session>, SessionError> {
        let key = SessionKey { address_id, port_b };

        {
            // trying with a read lock first is an optimization for the common case
            if let Some(session) = self.indexes.read().await.by_key.get(&key) {
                return Ok(session.clone());
            }
        }

        let mut indexes = self.indexes.write().await;
        // we need to check again now that we have the exclusive lock to avoid racy initialization
        if let Some(session) = indexes.by_key.get(&key) {
            return Ok(session.clone());
        }
        // checked under the write lock, which teardown acquires before deregistering sockets
        if self.torn_down.load(Ordering::Acquire) {
            debug!("not creating a session for {:?} after teardown", key);
            return Err(SessionError::TornDown);
        }

        let (local_port, socket) = self.bind_free_port(&indexes, key).await?;
        info!("binding remote address {}:{} to {}", address_id, port_b, local_port);
        trace!("first delivery for {:?} goes to port {}", key, delivery_port);

        let session = Arc::new(Session {
            key,
            local_port,
            socket: Arc::new(socket),
        });

        self.multiplexer.register(local_port, session.socket.clone());

        let prev_key = indexes.by_local_port.insert(local_port, key);
        debug_assert!(prev_key.is_none(), "local port {} was allocated twice", local_port);
        indexes.by_key.insert(key, session.clone());

        Ok(session)
    }

    async fn bind_free_port(&self, indexes: &SessionIndexes, key: SessionKey) -> Result<(u16, UdpSocket), SessionError> {
        // ports that some other process holds
        let mut refused = FxHashSet::default();

        loop {
            let candidate = first_free_port(key.port_b, &self.port_range, |port| {
                indexes.by_local_port.contains_key(&port) || refused.contains(&port)
            });
            let Some(candidate) = candidate else {
                warn!("no free local port for remote address {}:{}", key.address_id, key.port_b);
                return Err(SessionError::PortsExhausted {
                    address_id: key.address_id,
                    port_b: key.port_b,
                    start: key.port_b.max(self.port_range.start),
                });
            };

            match UdpSocket::bind(SocketAddr::new(self.bind_addr, candidate)).await {
                Ok(socket) => return Ok((candidate, socket)),
                Err(e) if e.kind() == ErrorKind::AddrInUse => {
                    debug!("local port {} is in use by another process - trying the next one", candidate);
                    refused.insert(candidate);
                }
                Err(e) => {
                    return Err(SessionError::Bind {
                        port: candidate,
                        source: e,
                    });
                }
            }
        }
    }

    pub async fn lookup_by_local_port(&self, local_port: u16) -> Option<SessionKey> {
        self.indexes.read().await
            .by_local_port
            .get(&local_port)
            .copied()
    }

    pub async fn len(&self) -> usize {
        self.indexes.read().await.by_key.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.indexes.read().await.by_key.is_empty()
    }

    /// Stops multiplexed reading on all session sockets, waits for `grace_period` to let
    ///  in-flight waits on them return, and then closes the sockets.
    ///
    /// This is intended to be called once on shutdown. Subsequent calls to
    ///  [SessionTable::resolve_or_create] fail with [SessionError::TornDown].
    pub async fn teardown(&self, grace_period: Duration) {
        {
            let _indexes = self.indexes.write().await;
            self.torn_down.store(true, Ordering::Release);
        }

        let num_deregistered = self.multiplexer.deregister_all();
        debug!("deregistered {} session sockets", num_deregistered);

        tokio::time::sleep(grace_period).await;

        let mut indexes = self.indexes.write().await;
        info!("closing {} sessions", indexes.by_key.len());
        indexes.by_key.clear();
        indexes.by_local_port.clear();
    }
}
