//! Transport layer for the RPC runtime.
//!
//! This module contains the client invoker, the connection pool and the
//! per-connection request correlation it relies on, and the server side
//! that exposes a service.

pub mod client;
pub mod connection;
pub mod connector;
pub mod pending;
pub mod pool;
pub mod server;

pub use client::{CallOptions, ClientBuilder, ClientConfig, RpcClient};
pub use connection::{Connection, ConnectionState};
pub use connector::{BoxedStream, Connector, IoStream, TcpConnector};
pub use pending::{AlreadyTerminal, Completion, PendingRequest, PendingRequestRegistry, RequestState};
pub use pool::{ConnectionPool, Lease, PoolConfig, PoolStats, SharingPolicy};
pub use server::{RpcServer, ServerConfig, ServerDispatcher, Service};
