//! RPC server implementation.

use crate::dispatch::{DispatchEntry, DispatchTable, InterfaceDef};
use crate::error::{ConfigError, Result, TransportError};
use crate::protocol::{
    CodecRegistry, ErrorDescriptor, FrameCodec, Framing, Response, TypeDesc, Value, WireCodec,
    WireFormat, codes,
};
use crate::runtime::{RpcRuntime, WorkerPool};
use crate::translator::ErrorTranslator;
use crate::transport::client::check_framing;
use crate::transport::connector::IoStream;

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, instrument, warn};

/// Configuration for the RPC server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Frame boundaries on the wire.
    pub framing: Framing,
    /// Message encoding.
    pub wire_format: WireFormat,
    /// Close a connection with no calls in flight after this long without
    /// a request.
    pub idle_timeout: Duration,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            framing: Framing::default(),
            wire_format: WireFormat::default(),
            idle_timeout: Duration::from_secs(30),
            max_connections: 1024,
        }
    }
}

/// Implementation of an exposed interface.
///
/// Generated or hand-written skeletons match on the method and convert the
/// arguments back to typed values.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Run `method` with `args`, already checked against its signature.
    ///
    /// Return [`crate::Error::Application`] to raise an exception to the
    /// caller.
    async fn call(&self, method: &DispatchEntry, args: Vec<Value>) -> Result<Value>;
}

type FrameSink<S> = Arc<tokio::sync::Mutex<SplitSink<Framed<S, FrameCodec>, Bytes>>>;

/// Serves requests arriving on one connection.
///
/// Decoding happens on the connection's task; method bodies run on the
/// runtime's worker pool. When the connection ends, calls still running are
/// aborted and never answered.
#[derive(Clone)]
pub struct ServerDispatcher {
    table: Arc<DispatchTable>,
    service: Arc<dyn Service>,
    registry: Arc<CodecRegistry>,
    codec: Arc<dyn WireCodec>,
    errors: Arc<ErrorTranslator>,
    workers: WorkerPool,
    framing: Framing,
    idle_timeout: Duration,
}

impl ServerDispatcher {
    /// Serve `stream` until the peer goes away or it idles out.
    #[instrument(skip(self, stream))]
    pub async fn serve<S: IoStream>(&self, stream: S, peer: String) {
        debug!("New connection from {}", peer);

        let (sink, mut frames) = Framed::new(stream, FrameCodec::new(self.framing)).split();
        let sink: FrameSink<S> = Arc::new(tokio::sync::Mutex::new(sink));
        let mut calls = JoinSet::new();

        loop {
            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(frame)) => self.handle_frame(frame, &sink, &mut calls).await,
                    Some(Err(e)) => {
                        error!("Frame error from {}: {}", peer, e);
                        break;
                    }
                    None => {
                        debug!("Connection closed by client");
                        break;
                    }
                },
                Some(_) = calls.join_next(), if !calls.is_empty() => {}
                () = tokio::time::sleep(self.idle_timeout), if calls.is_empty() => {
                    warn!("Connection from {} idle for {:?}, closing", peer, self.idle_timeout);
                    break;
                }
            }
        }

        if !calls.is_empty() {
            debug!(in_flight = calls.len(), "Aborting calls on closed connection");
        }
        calls.shutdown().await;
    }

    async fn handle_frame<S: IoStream>(
        &self,
        frame: Bytes,
        sink: &FrameSink<S>,
        calls: &mut JoinSet<()>,
    ) {
        match self.codec.decode_request(frame, &self.table) {
            Ok(request) => {
                let dispatcher = self.clone();
                let sink = Arc::clone(sink);
                self.workers.spawn_in(calls, async move {
                    let returns = request.method.signature().return_type().clone();
                    let response = dispatcher
                        .execute(&request.method, request.id, request.args)
                        .await;
                    dispatcher.respond(&sink, &response, Some(&returns)).await;
                });
            }
            Err(malformed) => {
                warn!(
                    request_id = ?malformed.id,
                    code = malformed.error.code,
                    reason = %malformed.error.message,
                    "Rejecting malformed request"
                );
                let response = Response::failure(malformed.id, malformed.error);
                self.respond(sink, &response, None).await;
            }
        }
    }

    async fn execute(&self, method: &DispatchEntry, id: u64, args: Vec<Value>) -> Response {
        let outcome = AssertUnwindSafe(self.service.call(method, args))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(value)) => Response::success(id, value),
            Ok(Err(error)) => {
                debug!(request_id = id, method = method.wire_name(), error = %error, "Call failed");
                Response::failure(Some(id), self.errors.error_to_wire(&error))
            }
            Err(_) => {
                error!(request_id = id, method = method.wire_name(), "Service panicked");
                Response::failure(
                    Some(id),
                    ErrorDescriptor::new(
                        codes::INTERNAL_ERROR,
                        format!("{} panicked", method.wire_name()),
                    ),
                )
            }
        }
    }

    async fn respond<S: IoStream>(
        &self,
        sink: &FrameSink<S>,
        response: &Response,
        returns: Option<&TypeDesc>,
    ) {
        let bytes = match self.codec.encode_response(response, returns) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(request_id = ?response.id, error = %e, "Failed to encode response");
                let fallback = Response::failure(
                    response.id,
                    ErrorDescriptor::new(codes::INTERNAL_ERROR, e.to_string()),
                );
                match self.codec.encode_response(&fallback, None) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!(error = %e, "Failed to encode error response");
                        return;
                    }
                }
            }
        };

        let mut sink = sink.lock().await;
        if let Err(e) = sink.send(bytes).await {
            debug!(request_id = ?response.id, error = %e, "Failed to send response");
        }
    }
}

struct Exposure {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// RPC server exposing one interface.
pub struct RpcServer {
    dispatcher: ServerDispatcher,
    config: ServerConfig,
    exposure: tokio::sync::Mutex<Option<Exposure>>,
}

impl RpcServer {
    /// Create a new RPC server with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface is invalid.
    pub fn new<S: Service>(runtime: RpcRuntime, interface: &InterfaceDef, service: S) -> Result<Self> {
        let config = ServerConfig::default();
        let dispatcher = ServerDispatcher {
            table: runtime.dispatch_table(interface)?,
            service: Arc::new(service),
            registry: Arc::clone(runtime.codecs()),
            codec: config.wire_format.codec(Arc::clone(runtime.codecs())),
            errors: Arc::clone(runtime.errors()),
            workers: runtime.workers().clone(),
            framing: config.framing,
            idle_timeout: config.idle_timeout,
        };
        Ok(Self {
            dispatcher,
            config,
            exposure: tokio::sync::Mutex::new(None),
        })
    }

    /// Replace the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the framing does not suit the wire format or no
    /// connection would be allowed.
    pub fn with_config(mut self, config: ServerConfig) -> Result<Self> {
        check_framing(config.framing, config.wire_format)?;
        if config.max_connections == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "max_connections",
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        self.dispatcher.codec = config
            .wire_format
            .codec(Arc::clone(&self.dispatcher.registry));
        self.dispatcher.framing = config.framing;
        self.dispatcher.idle_timeout = config.idle_timeout;
        self.config = config;
        Ok(self)
    }

    /// Server configuration.
    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Dispatcher for serving streams accepted elsewhere.
    #[must_use]
    pub const fn dispatcher(&self) -> &ServerDispatcher {
        &self.dispatcher
    }

    /// Address the server listens on, if exposed.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.exposure.lock().await.as_ref().map(|e| e.local_addr)
    }

    /// Start listening on `address`. Returns the bound address.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is already exposed or the address
    /// cannot be bound.
    #[instrument(skip(self))]
    pub async fn expose(&self, address: &str) -> Result<SocketAddr> {
        let mut exposure = self.exposure.lock().await;
        if exposure.is_some() {
            return Err(ConfigError::InvalidSetting {
                name: "address",
                reason: "server is already exposed".to_string(),
            }
            .into());
        }

        let listener = TcpListener::bind(address)
            .await
            .map_err(TransportError::from)?;
        let local_addr = listener
            .local_addr()
            .map_err(TransportError::from)?;
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(
            listener,
            self.dispatcher.clone(),
            self.config.max_connections,
            shutdown_rx,
        ));

        info!(
            "RPC server for {} listening on {}",
            self.dispatcher.table.interface().name(),
            local_addr
        );
        *exposure = Some(Exposure {
            local_addr,
            shutdown,
            task,
        });
        Ok(local_addr)
    }

    /// Stop listening and close every connection, aborting calls in flight.
    /// Does nothing if the server is not exposed.
    #[instrument(skip(self))]
    pub async fn unexpose(&self) {
        let Some(exposure) = self.exposure.lock().await.take() else {
            return;
        };
        let _ = exposure.shutdown.send(());
        if let Err(e) = exposure.task.await {
            error!("Accept loop ended abnormally: {}", e);
        }
        info!("RPC server on {} unexposed", exposure.local_addr);
    }
}

async fn accept_loop(
    listener: TcpListener,
    dispatcher: ServerDispatcher,
    max_connections: usize,
    mut shutdown: oneshot::Receiver<()>,
) {
    let semaphore = Arc::new(Semaphore::new(max_connections));
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, addr)) => {
                        match Arc::clone(&semaphore).try_acquire_owned() {
                            Ok(permit) => {
                                if let Err(e) = stream.set_nodelay(true) {
                                    debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                                }
                                let dispatcher = dispatcher.clone();
                                connections.spawn(async move {
                                    dispatcher.serve(stream, addr.to_string()).await;
                                    drop(permit);
                                });
                            }
                            Err(_) => {
                                warn!("Max connections reached, rejecting connection from {}", addr);
                            }
                        }
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = &mut shutdown => {
                info!("Server shutdown requested");
                break;
            }
        }
    }

    drop(listener);
    connections.shutdown().await;
}
