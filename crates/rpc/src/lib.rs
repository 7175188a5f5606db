//! Typed remote procedure calls over pooled, multiplexed connections.
//!
//! A client calls methods of a remote interface as if they were local; each
//! call becomes one request on a pooled connection, correlated with its
//! response by id, so many calls can share one connection at once.
//!
//! # Features
//!
//! - **Connection Pooling**: One connection per address, shared by
//!   concurrent calls, with failed dials shared until they age out
//! - **Two Wire Formats**: Compact type-driven binary or JSON-RPC 2.0
//! - **Extensible Codecs**: Ordered per-type strategies, open to custom ones
//! - **Exception Fidelity**: Remote exceptions are rebuilt on the caller,
//!   checked against the method's declared exceptions
//! - **Bounded Execution**: Service code runs on a bounded worker pool, off
//!   the I/O path
//!
//! # Example
//!
//! ```no_run
//! use wirecall_rpc::{
//!     DispatchEntry, InterfaceDef, MethodSignature, Primitive, RpcRuntime, Service, TypeDesc,
//!     Value,
//! };
//!
//! struct Calculator;
//!
//! #[async_trait::async_trait]
//! impl Service for Calculator {
//!     async fn call(&self, _method: &DispatchEntry, args: Vec<Value>) -> wirecall_rpc::Result<Value> {
//!         match args.as_slice() {
//!             [Value::Int(a), Value::Int(b)] => Ok(Value::Int(a + b)),
//!             _ => Err(wirecall_rpc::Error::Internal("bad arguments".to_string())),
//!         }
//!     }
//! }
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let int = TypeDesc::Primitive(Primitive::Int);
//!     let interface = InterfaceDef::new("Calculator").method(
//!         MethodSignature::new("add")
//!             .param(int.clone())
//!             .param(int.clone())
//!             .returns(int),
//!     );
//!
//!     let runtime = RpcRuntime::new();
//!     let server = runtime.server(&interface, Calculator)?;
//!     let address = server.expose("127.0.0.1:0").await?;
//!
//!     let client = runtime
//!         .client()
//!         .address(address.to_string())
//!         .interface(interface)
//!         .build()?;
//!
//!     let sum: i32 = client
//!         .invoke_as("add", vec![Value::Int(1), Value::Int(2)])
//!         .await?;
//!     assert_eq!(sum, 3);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod runtime;
pub mod translator;
pub mod transport;

// Re-export commonly used types
pub use dispatch::{DispatchCache, DispatchEntry, DispatchTable, InterfaceDef, MethodSignature};
pub use error::{
    CodecError, ConfigError, DispatchError, Error, ProtocolError, Result, TransportError,
};
pub use protocol::{
    CodecRegistry, ErrorDescriptor, Exception, Framing, Primitive, TypeCodec, TypeDesc, Value,
    WireFormat, WireValue, precedence,
};
pub use runtime::{RpcRuntime, RuntimeBuilder, RuntimeConfig, WorkerPool};
pub use translator::{ErrorKind, ErrorTranslator};
pub use transport::{
    CallOptions, ClientBuilder, ClientConfig, ConnectionPool, PoolConfig, RpcClient, RpcServer,
    ServerConfig, Service, SharingPolicy, TcpConnector,
};

// Re-export dependencies that are part of our public API
pub use bytes::Bytes;
