//! RPC client implementation.

use crate::dispatch::{DispatchEntry, DispatchTable, InterfaceDef, MethodSignature};
use crate::error::{ConfigError, Error, Result, TransportError};
use crate::protocol::{Framing, Request, Value, WireFormat, WireValue};
use crate::runtime::RpcRuntime;
use crate::transport::connection::ConnectionContext;
use crate::transport::connector::{Connector, TcpConnector};
use crate::transport::pending::PendingRequest;
use crate::transport::pool::{ConnectionPool, PoolConfig, SharingPolicy};

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, instrument};

/// Configuration for the RPC client.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Connection pool configuration.
    pub pool: PoolConfig,
    /// Frame boundaries on the wire.
    pub framing: Framing,
    /// Message encoding.
    pub wire_format: WireFormat,
    /// Deadline applied to every call without its own. `None` leaves stalled
    /// calls to the idle timeout.
    pub call_timeout: Option<Duration>,
}

/// Per-call overrides.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    /// Deadline for this call.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    /// Options with a deadline.
    #[must_use]
    pub const fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

pub(crate) fn check_framing(framing: Framing, wire_format: WireFormat) -> Result<()> {
    framing.validate()?;
    if matches!(framing, Framing::Delimited { .. }) && wire_format == WireFormat::Binary {
        return Err(ConfigError::InvalidSetting {
            name: "framing",
            reason: "delimited framing requires the JSON wire format".to_string(),
        }
        .into());
    }
    Ok(())
}

/// Builder for creating RPC clients.
pub struct ClientBuilder {
    runtime: RpcRuntime,
    address: Option<String>,
    interface: Option<InterfaceDef>,
    connector: Option<Arc<dyn Connector>>,
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a new client builder on `runtime`.
    #[must_use]
    pub fn new(runtime: RpcRuntime) -> Self {
        Self {
            runtime,
            address: None,
            interface: None,
            connector: None,
            config: ClientConfig::default(),
        }
    }

    /// Set the address to connect to.
    #[must_use]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Set the remote interface.
    #[must_use]
    pub fn interface(mut self, interface: InterfaceDef) -> Self {
        self.interface = Some(interface);
        self
    }

    /// Use `connector` instead of TCP.
    #[must_use]
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the framing.
    #[must_use]
    pub const fn framing(mut self, framing: Framing) -> Self {
        self.config.framing = framing;
        self
    }

    /// Set the wire format.
    #[must_use]
    pub const fn wire_format(mut self, wire_format: WireFormat) -> Self {
        self.config.wire_format = wire_format;
        self
    }

    /// Set the default call deadline.
    #[must_use]
    pub const fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = Some(timeout);
        self
    }

    /// Set how long a failed dial is shared.
    #[must_use]
    pub const fn max_age(mut self, max_age: Duration) -> Self {
        self.config.pool.max_age = max_age;
        self
    }

    /// Set the sharing policy.
    #[must_use]
    pub const fn sharing(mut self, sharing: SharingPolicy) -> Self {
        self.config.pool.sharing = sharing;
        self
    }

    /// Build the RPC client.
    ///
    /// # Errors
    ///
    /// Returns an error if the address or interface is missing, the
    /// interface is invalid, or the framing does not suit the wire format.
    pub fn build(self) -> Result<RpcClient> {
        let address = self.address.ok_or(ConfigError::Missing("address"))?;
        let interface = self.interface.ok_or(ConfigError::Missing("interface"))?;
        check_framing(self.config.framing, self.config.wire_format)?;

        let table = self.runtime.dispatch_table(&interface)?;
        let context = ConnectionContext {
            codec: self
                .config
                .wire_format
                .codec(Arc::clone(self.runtime.codecs())),
            errors: Arc::clone(self.runtime.errors()),
            framing: self.config.framing,
            connect_timeout: self.config.pool.connect_timeout,
            idle_timeout: self.config.pool.idle_timeout,
        };
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TcpConnector::new()));
        let pool = ConnectionPool::new(self.config.pool.clone(), connector, context);

        debug!(
            address = %address,
            interface = interface.name(),
            wire_format = ?self.config.wire_format,
            "Built RPC client"
        );

        Ok(RpcClient {
            address,
            table,
            pool,
            config: self.config,
        })
    }
}

/// Cancels the request if the call future is dropped before it finishes.
struct CancelOnDrop(Arc<PendingRequest>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.0.cancel().is_ok() {
            debug!(request_id = self.0.id(), "Cancelled abandoned call");
        }
    }
}

/// RPC client for one remote interface at one address.
pub struct RpcClient {
    address: String,
    table: Arc<DispatchTable>,
    pool: ConnectionPool,
    config: ClientConfig,
}

impl RpcClient {
    /// Remote address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Dispatch table of the remote interface.
    #[must_use]
    pub const fn table(&self) -> &Arc<DispatchTable> {
        &self.table
    }

    /// Connection pool.
    #[must_use]
    pub const fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Call the method with wire name `method`.
    ///
    /// # Errors
    ///
    /// Returns an error if the method is unknown, the call fails in transit,
    /// or the remote method raised an exception.
    #[instrument(skip(self, args))]
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.invoke_with(method, args, CallOptions::default()).await
    }

    /// Call the method with wire name `method` using `options`.
    ///
    /// # Errors
    ///
    /// As [`invoke`](Self::invoke), plus [`TransportError::TimedOut`] when
    /// the deadline passes.
    #[instrument(skip(self, args, options))]
    pub async fn invoke_with(
        &self,
        method: &str,
        args: Vec<Value>,
        options: CallOptions,
    ) -> Result<Value> {
        let entry = Arc::clone(self.table.by_name(method)?);
        self.call(entry, args, options).await
    }

    /// Call the method with local signature `method`.
    ///
    /// # Errors
    ///
    /// As [`invoke`](Self::invoke).
    #[instrument(skip(self, args), fields(method = %method))]
    pub async fn invoke_signature(
        &self,
        method: &MethodSignature,
        args: Vec<Value>,
    ) -> Result<Value> {
        let entry = Arc::clone(self.table.by_method(method)?);
        self.call(entry, args, CallOptions::default()).await
    }

    /// Call `method` and convert the result.
    ///
    /// # Errors
    ///
    /// As [`invoke`](Self::invoke), plus a codec error if the result does not
    /// convert to `R`.
    pub async fn invoke_as<R: WireValue>(&self, method: &str, args: Vec<Value>) -> Result<R> {
        let value = self.invoke(method, args).await?;
        Ok(R::from_value(value)?)
    }

    async fn call(
        &self,
        entry: Arc<DispatchEntry>,
        args: Vec<Value>,
        options: CallOptions,
    ) -> Result<Value> {
        match options.timeout.or(self.config.call_timeout) {
            Some(deadline) => timeout(deadline, self.round_trip(entry, args))
                .await
                .map_err(|_| Error::from(TransportError::TimedOut(deadline)))?,
            None => self.round_trip(entry, args).await,
        }
    }

    async fn round_trip(&self, entry: Arc<DispatchEntry>, args: Vec<Value>) -> Result<Value> {
        let lease = self.pool.acquire(&self.address).await?;
        // A failed dial stays pooled until it ages out.
        lease.connection().wait_ready().await?;

        let (pending, completion) = PendingRequest::new(Arc::clone(&entry));
        let _cancel = CancelOnDrop(Arc::clone(&pending));
        let request = Request {
            id: pending.id(),
            method: entry,
            args,
        };

        if let Err(error) = lease.connection().send(&request, &pending).await {
            let _ = pending.fail(error.clone());
            if error.is_transport() {
                self.pool.invalidate(lease.connection(), error.clone());
            } else {
                self.pool.release(lease);
            }
            return Err(error);
        }

        let outcome = completion.wait().await;
        self.pool.release(lease);
        outcome
    }

    /// Closes every pooled connection, failing pending calls.
    pub fn shutdown(&self) {
        debug!(address = %self.address, "Shutting down RPC client");
        self.pool.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Primitive, TypeDesc};

    fn calculator() -> InterfaceDef {
        let int = TypeDesc::Primitive(Primitive::Int);
        InterfaceDef::new("Calculator").method(
            MethodSignature::new("add")
                .param(int.clone())
                .param(int.clone())
                .returns(int),
        )
    }

    #[test]
    fn test_build_requires_address() {
        let result = RpcRuntime::new().client().interface(calculator()).build();

        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::Missing("address")))
        ));
    }

    #[test]
    fn test_binary_rejects_delimited_framing() {
        let result = RpcRuntime::new()
            .client()
            .address("127.0.0.1:1")
            .interface(calculator())
            .framing(Framing::delimited())
            .build();

        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_unknown_method_fails_locally() {
        let client = RpcRuntime::new()
            .client()
            .address("127.0.0.1:1")
            .interface(calculator())
            .build()
            .unwrap();

        let result = client.invoke("mul", vec![Value::Int(1), Value::Int(2)]).await;

        assert!(matches!(result, Err(Error::Dispatch(_))));
        assert_eq!(client.pool().stats().dials, 0);
    }

    #[tokio::test]
    async fn test_refused_dial_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        let client = RpcRuntime::new()
            .client()
            .address(address)
            .interface(calculator())
            .build()
            .unwrap();

        let result = client.invoke("add", vec![Value::Int(1), Value::Int(2)]).await;

        assert!(matches!(result, Err(Error::Transport(_))));
    }
}
