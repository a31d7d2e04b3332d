use std::fmt::{Debug, Formatter};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

/// A datagram that arrived on one of the registered session sockets
#[derive(Clone, Eq, PartialEq)]
pub struct ReceivedDatagram {
    /// the port of the session socket that received the datagram
    pub local_port: u16,
    pub from: SocketAddr,
    pub payload: Bytes,
}
impl Debug for ReceivedDatagram {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DGRAM{{{}->:{} [{} bytes]}}", self.from, self.local_port, self.payload.len())
    }
}

/// Fans in the datagrams of a dynamically growing set of UDP sockets: every registered socket
///  gets a reader task that forwards into a single bounded channel, which is drained through
///  the [DatagramReceiver].
///
/// Registration and deregistration are keyed by local port, so a socket can neither be missed
///  (the reader is spawned before `register` returns) nor registered twice.
pub struct Multiplexer {
    sender: mpsc::Sender<ReceivedDatagram>,
    max_datagram_size: usize,
    readers: Mutex<FxHashMap<u16, JoinHandle<()>>>,
}

pub struct DatagramReceiver {
    receiver: mpsc::Receiver<ReceivedDatagram>,
}

impl Multiplexer {
    pub fn new(queue_capacity: usize, max_datagram_size: usize) -> (Multiplexer, DatagramReceiver) {
        let (sender, receiver) = mpsc::channel(queue_capacity);

        let multiplexer = Multiplexer {
            sender,
            max_datagram_size,
            readers: Default::default(),
        };
        (multiplexer, DatagramReceiver { receiver })
    }

    fn readers(&self) -> MutexGuard<'_, FxHashMap<u16, JoinHandle<()>>> {
        self.readers.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts reading from `socket`. Returns `false` without doing anything if a socket is
    ///  already registered for `local_port`.
    ///
    /// NB: must be called from inside a Tokio runtime
    pub fn register(&self, local_port: u16, socket: Arc<UdpSocket>) -> bool {
        let mut readers = self.readers();
        if readers.contains_key(&local_port) {
            warn!("socket for local port {} is already registered - ignoring", local_port);
            return false;
        }

        let handle = tokio::spawn(read_loop(local_port, socket, self.sender.clone(), self.max_datagram_size));
        readers.insert(local_port, handle);
        true
    }

    /// Stops reading from all registered sockets, returning the number of sockets that were
    ///  registered. The sockets themselves are not closed by this.
    pub fn deregister_all(&self) -> usize {
        let mut readers = self.readers();
        let num_registered = readers.len();
        for (local_port, handle) in readers.drain() {
            trace!("deregistering socket for local port {}", local_port);
            handle.abort();
        }
        num_registered
    }

    pub fn num_registered(&self) -> usize {
        self.readers().len()
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.deregister_all();
    }
}

impl DatagramReceiver {
    /// Waits up to `timeout` for the next datagram from any registered socket
    pub async fn next(&mut self, timeout: Duration) -> Option<ReceivedDatagram> {
        tokio::time::timeout(timeout, self.receiver.recv()).await
            .ok()
            .flatten()
    }
}

async fn read_loop(local_port: u16, socket: Arc<UdpSocket>, sender: mpsc::Sender<ReceivedDatagram>, max_datagram_size: usize) {
    debug!("starting receive loop for local port {}", local_port);

    let mut buf = vec![0u8; max_datagram_size];
    loop {
        let (num_read, from) = match socket.recv_from(&mut buf).await {
            Ok(x) => x,
            Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused) => {
                // an ICMP 'unreachable' for something we sent earlier: nothing to forward
                trace!("local port {}: peer reset ({}) - skipping", local_port, e);
                continue;
            }
            Err(e) => {
                error!("local port {}: socket error, stopping receive loop: {}", local_port, e);
                return;
            }
        };

        let datagram = ReceivedDatagram {
            local_port,
            from,
            payload: Bytes::copy_from_slice(&buf[..num_read]),
        };
        trace!("received {:?}", datagram);

        if sender.send(datagram).await.is_err() {
            debug!("local port {}: multiplexer was closed, stopping receive loop", local_port);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bind_loopback() -> Arc<UdpSocket> {
        Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap())
    }

    #[tokio::test]
    async fn test_receives_from_registered_sockets() {
        let (multiplexer, mut receiver) = Multiplexer::new(16, 1024);

        let socket_a = bind_loopback().await;
        let socket_b = bind_loopback().await;
        let port_a = socket_a.local_addr().unwrap().port();
        let port_b = socket_b.local_addr().unwrap().port();

        assert!(multiplexer.register(port_a, socket_a.clone()));
        assert!(multiplexer.register(port_b, socket_b.clone()));
        assert_eq!(multiplexer.num_registered(), 2);

        let app = bind_loopback().await;
        app.send_to(b"to a", socket_a.local_addr().unwrap()).await.unwrap();

        let datagram = receiver.next(Duration::from_secs(5)).await.unwrap();
        assert_eq!(datagram.local_port, port_a);
        assert_eq!(datagram.from, app.local_addr().unwrap());
        assert_eq!(datagram.payload.as_ref(), b"to a");

        app.send_to(b"to b", socket_b.local_addr().unwrap()).await.unwrap();

        let datagram = receiver.next(Duration::from_secs(5)).await.unwrap();
        assert_eq!(datagram.local_port, port_b);
        assert_eq!(datagram.payload.as_ref(), b"to b");
    }

    #[tokio::test]
    async fn test_register_twice() {
        let (multiplexer, _receiver) = Multiplexer::new(16, 1024);
        let socket = bind_loopback().await;
        let port = socket.local_addr().unwrap().port();

        assert!(multiplexer.register(port, socket.clone()));
        assert!(!multiplexer.register(port, socket.clone()));
        assert_eq!(multiplexer.num_registered(), 1);
    }

    #[tokio::test]
    async fn test_truncates_to_max_datagram_size() {
        let (multiplexer, mut receiver) = Multiplexer::new(16, 4);
        let socket = bind_loopback().await;
        multiplexer.register(socket.local_addr().unwrap().port(), socket.clone());

        let app = bind_loopback().await;
        app.send_to(b"abcdefgh", socket.local_addr().unwrap()).await.unwrap();

        let datagram = receiver.next(Duration::from_secs(5)).await.unwrap();
        assert_eq!(datagram.payload.as_ref(), b"abcd");
    }

    #[tokio::test]
    async fn test_next_times_out() {
        let (_multiplexer, mut receiver) = Multiplexer::new(16, 1024);
        assert!(receiver.next(Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn test_deregister_all() {
        let (multiplexer, mut receiver) = Multiplexer::new(16, 1024);
        let socket = bind_loopback().await;
        multiplexer.register(socket.local_addr().unwrap().port(), socket.clone());

        assert_eq!(multiplexer.deregister_all(), 1);
        assert_eq!(multiplexer.num_registered(), 0);
        tokio::task::yield_now().await;

        let app = bind_loopback().await;
        app.send_to(b"late", socket.local_addr().unwrap()).await.unwrap();
        assert!(receiver.next(Duration::from_millis(100)).await.is_none());
    }
}
