//! Runtime context shared by clients and servers.
//!
//! An [`RpcRuntime`] owns everything that would otherwise be process-wide:
//! the bounded worker pool that runs service code, the codec registry, the
//! error translator and the dispatch table cache. Clients and servers built
//! from the same runtime share them; separate runtimes are fully isolated.

use crate::dispatch::{DispatchCache, DispatchTable, InterfaceDef};
use crate::error::{ConfigError, Result};
use crate::protocol::{CodecRegistry, TypeCodec};
use crate::translator::{ErrorKind, ErrorTranslator};
use crate::transport::client::ClientBuilder;
use crate::transport::server::RpcServer;
use crate::transport::Service;

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

/// Configuration for an [`RpcRuntime`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Maximum number of service invocations running at once.
    pub max_workers: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { max_workers: 64 }
    }
}

/// Bounded pool that runs service method bodies off the I/O path.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Pool running at most `size` tasks concurrently.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Spawns `task` into `tasks`. The task starts once a worker is free.
    ///
    /// Aborting the task while it waits for a worker gives up its place.
    pub fn spawn_in<F>(&self, tasks: &mut JoinSet<()>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            task.await;
        });
    }

    /// Configured size.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Workers currently idle.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

struct RuntimeInner {
    config: RuntimeConfig,
    workers: WorkerPool,
    codecs: Arc<CodecRegistry>,
    errors: Arc<ErrorTranslator>,
    dispatch: DispatchCache,
}

/// Shared runtime context.
///
/// Cloning is cheap and yields a handle to the same runtime.
#[derive(Clone)]
pub struct RpcRuntime {
    inner: Arc<RuntimeInner>,
}

impl RpcRuntime {
    /// Runtime with default configuration and the built-in codecs.
    #[must_use]
    pub fn new() -> Self {
        Self::from_parts(
            RuntimeConfig::default(),
            CodecRegistry::new(),
            ErrorTranslator::new(),
        )
    }

    /// Create a new runtime builder.
    #[must_use]
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    fn from_parts(config: RuntimeConfig, codecs: CodecRegistry, errors: ErrorTranslator) -> Self {
        debug!(
            max_workers = config.max_workers,
            codecs = ?codecs.names(),
            "Created RPC runtime"
        );
        Self {
            inner: Arc::new(RuntimeInner {
                workers: WorkerPool::new(config.max_workers),
                config,
                codecs: Arc::new(codecs),
                errors: Arc::new(errors),
                dispatch: DispatchCache::new(),
            }),
        }
    }

    /// Runtime configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Worker pool for service invocations.
    #[must_use]
    pub fn workers(&self) -> &WorkerPool {
        &self.inner.workers
    }

    /// Codec registry.
    #[must_use]
    pub fn codecs(&self) -> &Arc<CodecRegistry> {
        &self.inner.codecs
    }

    /// Error translator.
    #[must_use]
    pub fn errors(&self) -> &Arc<ErrorTranslator> {
        &self.inner.errors
    }

    /// Dispatch table for `interface`, built once and cached.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface is invalid.
    pub fn dispatch_table(&self, interface: &InterfaceDef) -> Result<Arc<DispatchTable>> {
        Ok(self.inner.dispatch.get_or_build(interface)?)
    }

    /// Builder for a client on this runtime.
    #[must_use]
    pub fn client(&self) -> ClientBuilder {
        ClientBuilder::new(self.clone())
    }

    /// Server on this runtime exposing `service` as `interface`.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface is invalid.
    pub fn server<S: Service>(&self, interface: &InterfaceDef, service: S) -> Result<RpcServer> {
        RpcServer::new(self.clone(), interface, service)
    }
}

impl Default for RpcRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`RpcRuntime`].
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    codecs: CodecRegistry,
    errors: ErrorTranslator,
    first_error: Option<ConfigError>,
}

impl RuntimeBuilder {
    /// Builder with defaults and the built-in codecs and error kinds.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            codecs: CodecRegistry::new(),
            errors: ErrorTranslator::new(),
            first_error: None,
        }
    }

    /// Set the worker pool size.
    #[must_use]
    pub const fn max_workers(mut self, max_workers: usize) -> Self {
        self.config.max_workers = max_workers;
        self
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a custom codec at `precedence`; see [`crate::protocol::precedence`].
    #[must_use]
    pub fn codec(mut self, precedence: u16, codec: impl TypeCodec) -> Self {
        self.codecs.register(precedence, codec);
        self
    }

    /// Register a custom error kind.
    #[must_use]
    pub fn error_kind(mut self, kind: ErrorKind) -> Self {
        if let Err(e) = self.errors.register(kind) {
            self.first_error.get_or_insert(e);
        }
        self
    }

    /// Build the runtime.
    ///
    /// # Errors
    ///
    /// Returns the first configuration error encountered.
    pub fn build(self) -> Result<RpcRuntime> {
        if let Some(e) = self.first_error {
            return Err(e.into());
        }
        if self.config.max_workers == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "max_workers",
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        Ok(RpcRuntime::from_parts(self.config, self.codecs, self.errors))
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::protocol::message::codes;

    #[tokio::test]
    async fn test_worker_pool_bounds_concurrency() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut tasks = JoinSet::new();

        for _ in 0..8 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.spawn_in(&mut tasks, async move {
                let now = running.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                peak.fetch_max(now, std::sync::atomic::Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                running.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            });
        }
        while tasks.join_next().await.is_some() {}

        assert_eq!(peak.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_builder_rejects_zero_workers() {
        let result = RpcRuntime::builder().max_workers(0).build();

        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_builder_reports_duplicate_error_kind() {
        let result = RpcRuntime::builder()
            .error_kind(ErrorKind::new(codes::ACCESS_DENIED, "Forbidden"))
            .build();

        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_dispatch_tables_are_cached() {
        let runtime = RpcRuntime::new();
        let interface = InterfaceDef::new("Empty");

        let first = runtime.dispatch_table(&interface).unwrap();
        let second = runtime.dispatch_table(&interface).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
    }
}
