//! Fixed-capacity pool of pre-dialed TCP connections to one HDC endpoint.
//!
//! The pool dials `capacity` connections up front. [`ConnectionPool::acquire`]
//! never waits: when the pool is empty it dials a fresh overflow connection.
//! [`ConnectionPool::release`] returns a connection only while the pool has
//! room and closes it otherwise, so the idle set never exceeds `capacity`.
//!
//! [`HdcClient`](crate::client::HdcClient) only draws from the pool: the
//! daemon serves one command per connection, so each command connection is
//! closed afterwards and never released. Once the pre-dialed set is used up,
//! every command dials an overflow connection.
//!
//! Pooled connections are not health-checked. A caller that sees a read or
//! write error must [`discard`](ConnectionPool::discard) the connection
//! rather than release it.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::transport::{self, Endpoint, TransportError, DEFAULT_READ_TIMEOUT};

/// Default HDC server port.
pub const DEFAULT_HDC_PORT: u16 = 8710;

/// Connection parameters for one HDC endpoint.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Daemon host name or address.
    pub host: String,
    /// Daemon TCP port.
    pub port: u16,
    /// Number of connections dialed eagerly and kept idle.
    pub capacity: usize,
    /// Timeout for dialing one connection.
    pub connect_timeout: Duration,
    /// Timeout for reading one response chunk.
    pub read_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_HDC_PORT,
            capacity: 2,
            connect_timeout: Duration::from_secs(5),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl ConnectionConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }
}

/// A bounded pool of raw, un-handshaken connections.
pub struct ConnectionPool {
    endpoint: Endpoint,
    capacity: usize,
    connect_timeout: Duration,
    idle: Mutex<VecDeque<TcpStream>>,
}

impl ConnectionPool {
    /// Create the pool and dial `capacity` connections.
    ///
    /// Fails if any of the initial dials fails.
    pub async fn new(config: &ConnectionConfig) -> Result<Self, TransportError> {
        let endpoint = config.endpoint();
        let mut idle = VecDeque::with_capacity(config.capacity);
        for _ in 0..config.capacity {
            idle.push_back(transport::dial(&endpoint, config.connect_timeout).await?);
        }
        debug!(%endpoint, capacity = config.capacity, "connection pool ready");

        Ok(Self {
            endpoint,
            capacity: config.capacity,
            connect_timeout: config.connect_timeout,
            idle: Mutex::new(idle),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of idle connections currently held.
    pub fn idle_count(&self) -> usize {
        self.idle().len()
    }

    /// Take an idle connection, or dial an overflow connection if none is left.
    pub async fn acquire(&self) -> Result<TcpStream, TransportError> {
        let pooled = self.idle().pop_front();
        match pooled {
            Some(stream) => {
                trace!("reusing pooled connection");
                Ok(stream)
            }
            None => {
                debug!(endpoint = %self.endpoint, "pool empty, dialing overflow connection");
                transport::dial(&self.endpoint, self.connect_timeout).await
            }
        }
    }

    /// Return a healthy connection. Closes it when the pool is already full.
    pub fn release(&self, stream: TcpStream) {
        let mut idle = self.idle();
        if idle.len() < self.capacity {
            idle.push_back(stream);
        } else {
            trace!("pool full, closing released connection");
            drop(stream);
        }
    }

    /// Close a connection that must not be reused.
    pub fn discard(&self, stream: TcpStream) {
        trace!("discarding connection");
        drop(stream);
    }

    /// Close every idle connection.
    pub fn close_all(&self) {
        let drained = self.idle().drain(..).count();
        debug!(closed = drained, "connection pool closed");
    }

    fn idle(&self) -> MutexGuard<'_, VecDeque<TcpStream>> {
        // A panic while holding the lock cannot leave the deque inconsistent.
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    /// Listener that accepts and holds every connection, counting accepts.
    async fn counting_listener() -> (ConnectionConfig, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();

        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        });

        let config = ConnectionConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            capacity: 2,
            ..Default::default()
        };
        (config, accepted)
    }

    #[tokio::test]
    async fn new_dials_capacity_connections() {
        let (config, _) = counting_listener().await;
        let pool = ConnectionPool::new(&config).await.unwrap();
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.capacity(), 2);
    }

    #[tokio::test]
    async fn new_fails_when_endpoint_is_down() {
        let config = ConnectionConfig {
            host: "127.0.0.1".into(),
            port: 1,
            capacity: 1,
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        assert!(ConnectionPool::new(&config).await.is_err());
    }

    #[tokio::test]
    async fn acquire_beyond_capacity_dials_overflow() {
        let (config, accepted) = counting_listener().await;
        let pool = ConnectionPool::new(&config).await.unwrap();

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_eq!(pool.idle_count(), 0);

        let overflow = tokio::time::timeout(Duration::from_secs(2), pool.acquire())
            .await
            .expect("acquire must not block on an empty pool")
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 3);
        drop((first, second, overflow));
    }

    #[tokio::test]
    async fn release_never_exceeds_capacity() {
        let (config, _) = counting_listener().await;
        let pool = ConnectionPool::new(&config).await.unwrap();

        let mut checked_out = Vec::new();
        for _ in 0..5 {
            checked_out.push(pool.acquire().await.unwrap());
        }
        assert_eq!(pool.idle_count(), 0);

        for stream in checked_out {
            pool.release(stream);
            assert!(pool.idle_count() <= pool.capacity());
        }
        assert_eq!(pool.idle_count(), 2);
    }

    #[tokio::test]
    async fn discard_does_not_return_to_pool() {
        let (config, _) = counting_listener().await;
        let pool = ConnectionPool::new(&config).await.unwrap();

        let stream = pool.acquire().await.unwrap();
        pool.discard(stream);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn close_all_empties_pool() {
        let (config, _) = counting_listener().await;
        let pool = ConnectionPool::new(&config).await.unwrap();
        pool.close_all();
        assert_eq!(pool.idle_count(), 0);
        // Still usable: acquire dials a fresh connection.
        assert!(pool.acquire().await.is_ok());
    }
}
