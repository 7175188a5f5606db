//! Per-address connection pool.

use crate::error::{Error, Result, TransportError};
use crate::transport::connection::{Connection, ConnectionContext, ConnectionState};
use crate::transport::connector::Connector;
use crate::transport::pending::closed_error;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, instrument};

/// How calls share a pooled connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SharingPolicy {
    /// Any number of calls in flight on one connection, matched by id.
    #[default]
    Multiplexed,
    /// One call per connection at a time; later borrowers wait.
    Exclusive,
}

/// Configuration for connection pooling.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// How long a failed dial is shared before the address is redialled.
    pub max_age: Duration,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Close a connection with calls pending once no bytes moved for this long.
    pub idle_timeout: Duration,
    /// Sharing policy.
    pub sharing: SharingPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            sharing: SharingPolicy::Multiplexed,
        }
    }
}

/// Snapshot of a pool's entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Entries still dialling.
    pub connecting: usize,
    /// Entries with an open stream.
    pub open: usize,
    /// Entries whose dial failed.
    pub failed: usize,
    /// Dials started over the pool's lifetime.
    pub dials: u64,
}

/// A connection checked out of the pool.
///
/// Dropping the lease releases it.
#[derive(Debug)]
pub struct Lease {
    connection: Arc<Connection>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Lease {
    /// The leased connection.
    #[must_use]
    pub const fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    context: ConnectionContext,
    entries: DashMap<String, Arc<Connection>>,
    next_id: AtomicU64,
    dials: AtomicU64,
    shutdown: AtomicBool,
}

/// Connection pool keyed by remote address.
///
/// Connections are created on demand, never blocking for capacity. Each
/// address maps to at most one connection; an invalid one is replaced the
/// next time the address is acquired.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub(crate) fn new(
        config: PoolConfig,
        connector: Arc<dyn Connector>,
        context: ConnectionContext,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                connector,
                context,
                entries: DashMap::new(),
                next_id: AtomicU64::new(0),
                dials: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Check out the connection for `address`, creating one if needed.
    ///
    /// The connection may still be dialling; see [`Connection::wait_ready`].
    ///
    /// # Errors
    ///
    /// Returns an error if the pool is shut down.
    #[instrument(skip(self))]
    pub async fn acquire(&self, address: &str) -> Result<Lease> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(TransportError::ShuttingDown.into());
        }

        let connection = self.connection_for(address);
        let permit = match self.inner.config.sharing {
            SharingPolicy::Multiplexed => None,
            SharingPolicy::Exclusive => Some(
                connection
                    .exclusive()
                    .acquire_owned()
                    .await
                    .map_err(|_| closed_error())?,
            ),
        };

        Ok(Lease {
            connection,
            _permit: permit,
        })
    }

    fn connection_for(&self, address: &str) -> Arc<Connection> {
        let max_age = self.inner.config.max_age;
        let current = self
            .inner
            .entries
            .get(address)
            .map(|entry| Arc::clone(entry.value()));
        if let Some(connection) = current.filter(|c| c.is_valid(max_age)) {
            return connection;
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let candidate = Connection::new(id, address, self.inner.context.clone());

        let (winner, evicted) = match self.inner.entries.entry(address.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&candidate));
                (Arc::clone(&candidate), None)
            }
            Entry::Occupied(slot) if slot.get().is_valid(max_age) => (Arc::clone(slot.get()), None),
            Entry::Occupied(mut slot) => {
                let evicted = slot.insert(Arc::clone(&candidate));
                (Arc::clone(&candidate), Some(evicted))
            }
        };

        if let Some(evicted) = evicted {
            debug!(
                connection = evicted.id(),
                address,
                state = ?evicted.state(),
                "Evicted invalid connection"
            );
            evicted.close(closed_error());
        }

        if Arc::ptr_eq(&winner, &candidate) {
            self.inner.dials.fetch_add(1, Ordering::Relaxed);
            winner.start(Arc::clone(&self.inner.connector));
        } else {
            debug!(address, "Another caller created the connection first");
        }
        winner
    }

    /// Return a lease.
    pub fn release(&self, lease: Lease) {
        drop(lease);
    }

    /// Discards `connection`, failing its pending requests with `error`.
    pub fn invalidate(&self, connection: &Arc<Connection>, error: Error) {
        let removed = self
            .inner
            .entries
            .remove_if(connection.address(), |_, current| Arc::ptr_eq(current, connection))
            .is_some();
        debug!(
            connection = connection.id(),
            address = connection.address(),
            removed,
            "Invalidated connection"
        );
        connection.close(error);
    }

    /// Current entry counts.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            dials: self.inner.dials.load(Ordering::Relaxed),
            ..PoolStats::default()
        };
        for entry in self.inner.entries.iter() {
            match entry.value().state() {
                ConnectionState::Connecting => stats.connecting += 1,
                ConnectionState::Open => stats.open += 1,
                ConnectionState::Failed => stats.failed += 1,
                ConnectionState::Closed => {}
            }
        }
        stats
    }

    /// Closes every connection. Later acquires fail.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);

        let connections: Vec<Arc<Connection>> = self
            .inner
            .entries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.inner.entries.clear();

        debug!(connections = connections.len(), "Shutting down connection pool");
        for connection in connections {
            connection.close(closed_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CodecRegistry, Framing, WireFormat};
    use crate::translator::ErrorTranslator;
    use crate::transport::connector::BoxedStream;
    use async_trait::async_trait;
    use std::io;
    use std::sync::atomic::AtomicUsize;

    /// Counts dials and answers each with a fresh in-memory pipe or a refusal.
    struct CountingConnector {
        dials: AtomicUsize,
        refuse: bool,
        peers: parking_lot::Mutex<Vec<tokio::io::DuplexStream>>,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(&self, _address: &str) -> io::Result<BoxedStream> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            }
            let (near, far) = tokio::io::duplex(1024);
            self.peers.lock().push(far);
            Ok(Box::new(near))
        }
    }

    fn pool(refuse: bool, config: PoolConfig) -> (ConnectionPool, Arc<CountingConnector>) {
        let connector = Arc::new(CountingConnector {
            dials: AtomicUsize::new(0),
            refuse,
            peers: parking_lot::Mutex::new(Vec::new()),
        });
        let context = ConnectionContext {
            codec: WireFormat::Binary.codec(Arc::new(CodecRegistry::new())),
            errors: Arc::new(ErrorTranslator::new()),
            framing: Framing::length_prefixed(),
            connect_timeout: config.connect_timeout,
            idle_timeout: config.idle_timeout,
        };
        let shared: Arc<dyn Connector> = connector.clone();
        (ConnectionPool::new(config, shared, context), connector)
    }

    #[tokio::test]
    async fn test_open_connection_is_reused() {
        let (pool, connector) = pool(false, PoolConfig::default());

        let first = pool.acquire("a").await.unwrap();
        first.connection().wait_ready().await.unwrap();
        let second = pool.acquire("a").await.unwrap();

        assert!(Arc::ptr_eq(first.connection(), second.connection()));
        assert_eq!(connector.dials.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().open, 1);
    }

    #[tokio::test]
    async fn test_addresses_get_separate_connections() {
        let (pool, _) = pool(false, PoolConfig::default());

        let a = pool.acquire("a").await.unwrap();
        let b = pool.acquire("b").await.unwrap();

        assert!(!Arc::ptr_eq(a.connection(), b.connection()));
        assert_eq!(pool.stats().dials, 2);
    }

    #[tokio::test]
    async fn test_failed_dial_shared_then_redialled() {
        let config = PoolConfig {
            max_age: Duration::from_millis(100),
            ..PoolConfig::default()
        };
        let (pool, connector) = pool(true, config);

        let first = pool.acquire("down").await.unwrap();
        assert!(first.connection().wait_ready().await.is_err());
        let second = pool.acquire("down").await.unwrap();
        assert!(second.connection().wait_ready().await.is_err());

        assert!(Arc::ptr_eq(first.connection(), second.connection()));
        assert_eq!(connector.dials.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().failed, 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let third = pool.acquire("down").await.unwrap();
        assert!(third.connection().wait_ready().await.is_err());

        assert!(!Arc::ptr_eq(first.connection(), third.connection()));
        assert_eq!(connector.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_replaces_connection() {
        let (pool, connector) = pool(false, PoolConfig::default());
        let first = pool.acquire("a").await.unwrap();
        first.connection().wait_ready().await.unwrap();

        pool.invalidate(first.connection(), closed_error());
        let second = pool.acquire("a").await.unwrap();

        assert_eq!(first.connection().state(), ConnectionState::Closed);
        assert!(!Arc::ptr_eq(first.connection(), second.connection()));
        assert_eq!(connector.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exclusive_lease_blocks_second_borrower() {
        let config = PoolConfig {
            sharing: SharingPolicy::Exclusive,
            ..PoolConfig::default()
        };
        let (pool, _) = pool(false, config);
        let first = pool.acquire("a").await.unwrap();

        let waiting = tokio::time::timeout(Duration::from_millis(50), pool.acquire("a")).await;
        assert!(waiting.is_err());

        pool.release(first);
        let second = tokio::time::timeout(Duration::from_millis(50), pool.acquire("a")).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_acquire() {
        let (pool, _) = pool(false, PoolConfig::default());
        let lease = pool.acquire("a").await.unwrap();

        pool.shutdown();

        assert_eq!(lease.connection().state(), ConnectionState::Closed);
        assert!(matches!(
            pool.acquire("a").await,
            Err(Error::Transport(TransportError::ShuttingDown))
        ));
    }
}
