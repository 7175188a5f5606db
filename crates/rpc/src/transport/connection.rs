//! Client side of one multiplexed connection.
//!
//! A [`Connection`] is created in the `Connecting` state and dials in the
//! background. Once open, one reader task correlates every inbound response
//! with the [`PendingRequest`] that awaits it; writers share the sink half
//! behind an async mutex.

use crate::error::{Error, ProtocolError, Result, TransportError};
use crate::protocol::framing::protocol_error;
use crate::protocol::{FrameCodec, Framing, Request, Response, ResponseDecodeError, WireCodec};
use crate::translator::ErrorTranslator;
use crate::transport::connector::{BoxedStream, Connector};
use crate::transport::pending::{
    AlreadyTerminal, PendingRequest, PendingRequestRegistry, closed_error,
};

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore, watch};
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::codec::Framed;
use tracing::{debug, error, warn};

type FrameSink = SplitSink<Framed<BoxedStream, FrameCodec>, Bytes>;
type FrameStream = SplitStream<Framed<BoxedStream, FrameCodec>>;
type SharedSink = Arc<tokio::sync::Mutex<FrameSink>>;

/// Observable state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Dial in progress.
    Connecting,
    /// Dial failed; the error is kept for callers sharing this attempt.
    Failed,
    /// Stream is up.
    Open,
    /// Stream closed, or the connection was discarded.
    Closed,
}

/// Everything a connection needs besides its address.
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub(crate) codec: Arc<dyn WireCodec>,
    pub(crate) errors: Arc<ErrorTranslator>,
    pub(crate) framing: Framing,
    pub(crate) connect_timeout: Duration,
    pub(crate) idle_timeout: Duration,
}

enum Phase {
    Connecting,
    Failed(Error),
    Open(SharedSink),
    Closed,
}

/// An outbound connection to one remote address.
pub struct Connection {
    id: u64,
    address: String,
    created_at: Instant,
    phase: Mutex<Phase>,
    state: watch::Sender<ConnectionState>,
    pending: PendingRequestRegistry,
    last_activity: Mutex<Instant>,
    closer: Notify,
    wake: Notify,
    exclusive: Arc<Semaphore>,
    context: ConnectionContext,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("state", &self.state())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

fn stream_error(err: io::Error) -> Error {
    protocol_error(&err).map_or_else(|| TransportError::from(err).into(), Error::Protocol)
}

async fn idle_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Connection {
    pub(crate) fn new(id: u64, address: &str, context: ConnectionContext) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            id,
            address: address.to_string(),
            created_at: now,
            phase: Mutex::new(Phase::Connecting),
            state: watch::Sender::new(ConnectionState::Connecting),
            pending: PendingRequestRegistry::new(),
            last_activity: Mutex::new(now),
            closer: Notify::new(),
            wake: Notify::new(),
            exclusive: Arc::new(Semaphore::new(1)),
            context,
        })
    }

    /// Spawns the task that dials and then reads.
    pub(crate) fn start(self: &Arc<Self>, connector: Arc<dyn Connector>) {
        let connection = Arc::clone(self);
        tokio::spawn(async move {
            connection.run(connector).await;
        });
    }

    /// Connection id, unique within its pool.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Remote address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// When the connection was created.
    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Requests in flight on this connection.
    #[must_use]
    pub const fn pending(&self) -> &PendingRequestRegistry {
        &self.pending
    }

    /// Whether a pool may hand this connection out.
    ///
    /// A dial in progress is valid, and so is an open stream. A failed dial
    /// stays valid until `max_age` after creation so callers share it
    /// instead of redialling.
    #[must_use]
    pub fn is_valid(&self, max_age: Duration) -> bool {
        match self.state() {
            ConnectionState::Connecting | ConnectionState::Open => true,
            ConnectionState::Failed => self.created_at.elapsed() < max_age,
            ConnectionState::Closed => false,
        }
    }

    pub(crate) fn exclusive(&self) -> Arc<Semaphore> {
        Arc::clone(&self.exclusive)
    }

    /// Waits until the dial finishes.
    ///
    /// # Errors
    ///
    /// Returns the dial error, or [`TransportError::Closed`] if the
    /// connection closed first.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut states = self.state.subscribe();
        let state = *states
            .wait_for(|state| *state != ConnectionState::Connecting)
            .await
            .map_err(|_| closed_error())?;

        match state {
            ConnectionState::Open => Ok(()),
            ConnectionState::Failed => Err(self.failure()),
            ConnectionState::Connecting | ConnectionState::Closed => Err(closed_error()),
        }
    }

    fn failure(&self) -> Error {
        match &*self.phase.lock() {
            Phase::Failed(error) => error.clone(),
            _ => closed_error(),
        }
    }

    fn sink(&self) -> Result<SharedSink> {
        match &*self.phase.lock() {
            Phase::Open(sink) => Ok(Arc::clone(sink)),
            Phase::Failed(error) => Err(error.clone()),
            Phase::Connecting => Err(Error::Internal(format!(
                "connection {} used before it opened",
                self.id
            ))),
            Phase::Closed => Err(closed_error()),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Registers `pending` and writes `request`.
    ///
    /// Nothing is registered if the request cannot be encoded. The caller
    /// fails `pending` if this returns an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not open, the request cannot be
    /// encoded or framed, or the write fails.
    pub async fn send(&self, request: &Request, pending: &Arc<PendingRequest>) -> Result<()> {
        let sink = self.sink()?;
        let bytes = self.context.codec.encode_request(request)?;

        if !self.pending.register(pending) {
            return Err(Error::Internal(format!(
                "request {} is already pending on connection {}",
                pending.id(),
                self.id
            )));
        }

        let result = {
            let mut sink = sink.lock().await;
            sink.send(bytes).await
        };
        self.touch();
        self.wake.notify_one();

        result.map_err(stream_error)
    }

    /// Closes the connection and fails everything pending on it with
    /// `error`. Closing twice does nothing.
    pub fn close(&self, error: Error) {
        {
            let mut phase = self.phase.lock();
            if matches!(*phase, Phase::Closed) {
                return;
            }
            // Dropping the sink half lets the stream shut once the reader exits.
            *phase = Phase::Closed;
        }
        self.state.send_replace(ConnectionState::Closed);
        self.exclusive.close();
        self.closer.notify_one();

        let failed = self.pending.close(&error);
        debug!(
            connection = self.id,
            address = %self.address,
            failed,
            reason = %error,
            "Connection closed"
        );
    }

    async fn run(self: Arc<Self>, connector: Arc<dyn Connector>) {
        let connect_timeout = self.context.connect_timeout;
        let dial = timeout(connect_timeout, connector.connect(&self.address));
        let dialled = tokio::select! {
            dialled = dial => dialled,
            () = self.closer.notified() => {
                debug!(connection = self.id, "Dial abandoned");
                return;
            }
        };

        let stream = match dialled {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.fail_dial(TransportError::ConnectFailed {
                    address: self.address.clone(),
                    source: Arc::new(e),
                });
                return;
            }
            Err(_) => {
                self.fail_dial(TransportError::ConnectTimedOut {
                    address: self.address.clone(),
                    timeout: connect_timeout,
                });
                return;
            }
        };

        let (sink, frames) = Framed::new(stream, FrameCodec::new(self.context.framing)).split();
        {
            let mut phase = self.phase.lock();
            if !matches!(*phase, Phase::Connecting) {
                return;
            }
            *phase = Phase::Open(Arc::new(tokio::sync::Mutex::new(sink)));
        }
        self.touch();
        self.state.send_replace(ConnectionState::Open);
        debug!(connection = self.id, address = %self.address, "Created new connection");

        let error = self.read_loop(frames).await;
        self.close(error);
    }

    fn fail_dial(&self, error: TransportError) {
        warn!(connection = self.id, address = %self.address, error = %error, "Failed to connect");
        let error = Error::from(error);
        {
            let mut phase = self.phase.lock();
            if !matches!(*phase, Phase::Connecting) {
                return;
            }
            *phase = Phase::Failed(error.clone());
        }
        self.state.send_replace(ConnectionState::Failed);
        self.pending.close(&error);
    }

    /// Reads until the stream ends or fails; returns the error to close with.
    async fn read_loop(&self, mut frames: FrameStream) -> Error {
        let idle_timeout = self.context.idle_timeout;
        loop {
            let deadline = (!self.pending.is_empty()).then(|| *self.last_activity.lock() + idle_timeout);

            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(frame)) => {
                        self.touch();
                        if let Err(error) = self.handle_frame(frame) {
                            return error;
                        }
                    }
                    Some(Err(e)) => {
                        let error = stream_error(e);
                        error!(connection = self.id, error = %error, "Stream error");
                        return error;
                    }
                    None => {
                        debug!(connection = self.id, "Stream closed");
                        return closed_error();
                    }
                },
                () = idle_deadline(deadline) => {
                    if self.last_activity.lock().elapsed() >= idle_timeout {
                        warn!(connection = self.id, ?idle_timeout, "Connection idle timeout");
                        return TransportError::TimedOut(idle_timeout).into();
                    }
                }
                () = self.wake.notified() => {}
                () = self.closer.notified() => {
                    return closed_error();
                }
            }
        }
    }

    /// Delivers one inbound frame. An error means the whole connection is
    /// unusable.
    fn handle_frame(&self, frame: Bytes) -> Result<()> {
        let pending = &self.pending;
        match self
            .context
            .codec
            .decode_response(frame, &|id| pending.return_type(id))
        {
            Ok(Response {
                id: Some(id),
                outcome,
            }) => {
                let Some(request) = pending.resolve(id) else {
                    self.unknown_response(id);
                    return Ok(());
                };
                let finished = match outcome {
                    Ok(value) => request.resolve(value),
                    Err(descriptor) => {
                        let throws = request.method().signature().declared_exceptions();
                        request.fail(self.context.errors.from_wire(&descriptor, throws))
                    }
                };
                self.settled(id, finished);
                Ok(())
            }
            Ok(Response {
                id: None,
                outcome: Err(descriptor),
            }) => {
                let error = self.context.errors.from_wire(&descriptor, &[]);
                error!(
                    connection = self.id,
                    error = %error,
                    "Peer rejected a request without naming it"
                );
                Err(error)
            }
            Ok(Response {
                id: None,
                outcome: Ok(_),
            }) => Err(ProtocolError::Malformed("result without request id".to_string()).into()),
            Err(ResponseDecodeError::UnknownId(id)) => {
                self.unknown_response(id);
                Ok(())
            }
            Err(ResponseDecodeError::Message { id, error }) => {
                match pending.resolve(id) {
                    Some(request) => {
                        warn!(connection = self.id, request_id = id, error = %error, "Failed to decode response");
                        self.settled(id, request.fail(error));
                    }
                    None => self.unknown_response(id),
                }
                Ok(())
            }
            Err(ResponseDecodeError::Connection(e)) => {
                error!(connection = self.id, error = %e, "Failed to decode response stream");
                Err(e.into())
            }
        }
    }

    /// Logs a response that lost the race with a cancellation or timeout.
    fn settled(&self, id: u64, finished: std::result::Result<(), AlreadyTerminal>) {
        if let Err(AlreadyTerminal(state)) = finished {
            debug!(
                connection = self.id,
                request_id = id,
                ?state,
                "Response for a request that already finished"
            );
        }
    }

    fn unknown_response(&self, id: u64) {
        warn!(
            monitor = "unknown_response_id",
            connection = self.id,
            request_id = id,
            "Received response for unknown request"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchTable, InterfaceDef, MethodSignature};
    use crate::protocol::{
        CodecRegistry, ErrorDescriptor, Exception, Primitive, TypeDesc, Value, WireFormat, codes,
    };
    use async_trait::async_trait;
    use tokio::io::DuplexStream;
    use tracing_test::traced_test;

    /// Hands out one end of an in-memory pipe.
    struct PipeConnector {
        end: Mutex<Option<DuplexStream>>,
    }

    #[async_trait]
    impl Connector for PipeConnector {
        async fn connect(&self, _address: &str) -> io::Result<BoxedStream> {
            self.end
                .lock()
                .take()
                .map(|end| Box::new(end) as BoxedStream)
                .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))
        }
    }

    struct Refusing;

    #[async_trait]
    impl Connector for Refusing {
        async fn connect(&self, _address: &str) -> io::Result<BoxedStream> {
            Err(io::Error::from(io::ErrorKind::ConnectionRefused))
        }
    }

    fn table() -> DispatchTable {
        let int = TypeDesc::Primitive(Primitive::Int);
        DispatchTable::for_interface(
            &InterfaceDef::new("Calculator").method(
                MethodSignature::new("add")
                    .param(int.clone())
                    .param(int.clone())
                    .returns(int)
                    .throws("E"),
            ),
        )
        .unwrap()
    }

    fn context() -> ConnectionContext {
        ConnectionContext {
            codec: WireFormat::Json.codec(Arc::new(CodecRegistry::new())),
            errors: Arc::new(ErrorTranslator::new()),
            framing: Framing::delimited(),
            connect_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(30),
        }
    }

    async fn open() -> (Arc<Connection>, Framed<DuplexStream, FrameCodec>) {
        let (near, far) = tokio::io::duplex(4096);
        let connection = Connection::new(1, "pipe", context());
        connection.start(Arc::new(PipeConnector {
            end: Mutex::new(Some(near)),
        }));
        connection.wait_ready().await.unwrap();
        (connection, Framed::new(far, FrameCodec::new(Framing::delimited())))
    }

    fn request(table: &DispatchTable) -> (Request, Arc<PendingRequest>, crate::transport::pending::Completion) {
        let method = Arc::clone(table.by_name("add").unwrap());
        let (pending, completion) = PendingRequest::new(Arc::clone(&method));
        let request = Request {
            id: pending.id(),
            method,
            args: vec![Value::Int(1), Value::Int(2)],
        };
        (request, pending, completion)
    }

    fn reply(table: &DispatchTable, response: &Response) -> Bytes {
        let returns = table.by_name("add").unwrap().signature().return_type().clone();
        context()
            .codec
            .encode_response(response, Some(&returns))
            .unwrap()
    }

    #[tokio::test]
    async fn test_response_resolves_request() {
        let table = table();
        let (connection, mut peer) = open().await;
        let (request, pending, completion) = request(&table);

        connection.send(&request, &pending).await.unwrap();
        assert!(peer.next().await.unwrap().is_ok());
        peer.send(reply(&table, &Response::success(request.id, Value::Int(3))))
            .await
            .unwrap();

        assert_eq!(completion.wait().await.unwrap(), Value::Int(3));
        assert!(connection.pending().is_empty());
    }

    #[tokio::test]
    async fn test_error_response_is_translated() {
        let table = table();
        let (connection, mut peer) = open().await;
        let (request, pending, completion) = request(&table);

        connection.send(&request, &pending).await.unwrap();
        let boom = Exception::new("E", "boom");
        let error = ErrorDescriptor::new(codes::APPLICATION, boom.to_string())
            .with_payload(Value::Exception(boom.clone()));
        peer.send(reply(&table, &Response::failure(Some(request.id), error)))
            .await
            .unwrap();

        let err = completion.wait().await.unwrap_err();
        assert_eq!(err.exception(), Some(&boom));
    }

    #[traced_test]
    #[tokio::test]
    async fn test_unknown_response_is_dropped() {
        let table = table();
        let (connection, mut peer) = open().await;

        peer.send(reply(&table, &Response::success(u64::MAX, Value::Int(3))))
            .await
            .unwrap();
        let (request, pending, completion) = request(&table);
        connection.send(&request, &pending).await.unwrap();
        peer.send(reply(&table, &Response::success(request.id, Value::Int(3))))
            .await
            .unwrap();

        assert_eq!(completion.wait().await.unwrap(), Value::Int(3));
        assert!(logs_contain("unknown_response_id"));
        assert_eq!(connection.state(), ConnectionState::Open);
    }

    #[traced_test]
    #[tokio::test]
    async fn test_late_outcome_for_finished_request_is_logged() {
        let table = table();
        let (connection, _peer) = open().await;
        let (request, pending, completion) = request(&table);
        pending.cancel().unwrap();

        connection.settled(request.id, pending.resolve(Value::Int(3)));
        connection.settled(request.id, pending.fail(closed_error()));

        assert!(matches!(completion.wait().await, Err(Error::Cancelled)));
        assert!(logs_contain("Response for a request that already finished"));
        assert!(logs_contain("Cancelled"));
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending() {
        let table = table();
        let (connection, peer) = open().await;
        let (request, pending, completion) = request(&table);
        connection.send(&request, &pending).await.unwrap();

        drop(peer);

        assert!(matches!(
            completion.wait().await,
            Err(Error::Transport(TransportError::Closed))
        ));
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(!connection.is_valid(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_garbage_fails_every_pending_request() {
        let table = table();
        let (connection, mut peer) = open().await;
        let (first, first_pending, first_done) = request(&table);
        let (second, second_pending, second_done) = request(&table);
        connection.send(&first, &first_pending).await.unwrap();
        connection.send(&second, &second_pending).await.unwrap();

        peer.send(Bytes::from_static(b"{oops")).await.unwrap();

        assert!(matches!(first_done.wait().await, Err(Error::Protocol(_))));
        assert!(matches!(second_done.wait().await, Err(Error::Protocol(_))));
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_applies_while_pending() {
        let table = table();
        let (connection, mut peer) = open().await;
        let (request, pending, completion) = request(&table);
        connection.send(&request, &pending).await.unwrap();
        assert!(peer.next().await.unwrap().is_ok());

        let result = completion.wait().await;

        assert!(matches!(
            result,
            Err(Error::Transport(TransportError::TimedOut(_)))
        ));
    }

    #[tokio::test]
    async fn test_failed_dial_is_shared_until_aged() {
        let connection = Connection::new(7, "nowhere", context());
        connection.start(Arc::new(Refusing));

        let err = connection.wait_ready().await.unwrap_err();

        assert!(matches!(
            err,
            Error::Transport(TransportError::ConnectFailed { .. })
        ));
        assert_eq!(connection.state(), ConnectionState::Failed);
        assert!(connection.is_valid(Duration::from_secs(60)));
        assert!(!connection.is_valid(Duration::ZERO));
    }
}
