use std::borrow::Cow;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use cqlroute_cql::frame::frame_errors::CqlResponseParseError;
use cqlroute_cql::frame::header::{FrameDirection, MAX_FRAME_LENGTH};
use cqlroute_cql::frame::request::{self, Options, RequestOpcode, SerializableRequest, Startup};
use cqlroute_cql::frame::response::{Response, ResponseOpcode, Supported};
use cqlroute_cql::frame::{self, SerializedRequest};
use cqlroute_cql::{Compression, Frame, FrameAssembler, ProtocolVersion};
use futures::future::RemoteHandle;
use futures::FutureExt;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::multiplexer::{
    HandlerLookupResult, RequestId, ResponseHandler, ResponseHandlerMap, TaskResponse,
    OLD_AGE_ORPHAN_THRESHOLD, OLD_ORPHAN_COUNT_THRESHOLD,
};
use crate::errors::{
    BrokenConnectionError, BrokenConnectionErrorKind, ConnectionError,
    ConnectionSetupRequestError, ConnectionSetupRequestErrorKind, RequestError,
};
use crate::routing::{ShardInfo, Sharder, ShardingError};

/// Capacity of the buffers wrapping both halves of the socket.
const SOCKET_BUFFER_SIZE: usize = 8192;

/// Receives the error that broke a connection, once.
pub(crate) type ErrorReceiver = oneshot::Receiver<ConnectionError>;

/// Configuration of a single connection.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Protocol version spoken on the connection. Fixed for its lifetime.
    pub protocol_version: ProtocolVersion,
    /// Compression to request during the handshake. If the server does not
    /// support it the connection falls back to no compression.
    pub compression: Option<Compression>,
    /// Sets `TCP_NODELAY` on the socket.
    pub tcp_nodelay: bool,
    /// Idle time after which the OS starts sending TCP keepalive probes.
    pub tcp_keepalive_interval: Option<Duration>,
    /// Local address to bind before connecting.
    pub local_ip_address: Option<IpAddr>,
    /// Limit on establishing the TCP connection.
    pub connect_timeout: Duration,
    /// A connection with requests pending breaks if no frame
    /// arrives within this long.
    pub read_timeout: Option<Duration>,
    /// Period of OPTIONS requests sent to keep the connection alive.
    pub keepalive_interval: Option<Duration>,
    /// Limit on a keepalive request; exceeding it breaks the connection.
    pub keepalive_timeout: Option<Duration>,
    /// Largest accepted response body, in bytes.
    pub max_frame_length: usize,
    /// Number of requests that can queue up for a stream id
    /// before senders start waiting.
    pub submit_queue_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::V4,
            compression: None,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            local_ip_address: None,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Some(Duration::from_secs(12)),
            keepalive_interval: None,
            keepalive_timeout: None,
            max_frame_length: MAX_FRAME_LENGTH,
            submit_queue_capacity: 1024,
        }
    }
}

/// A response, with the extensions the server attached to it.
#[derive(Debug)]
pub struct QueryResponse {
    /// The decoded response.
    pub response: Response,
    /// Id of the server-side trace, if tracing was requested.
    pub tracing_id: Option<Uuid>,
    /// Warnings raised by the server.
    pub warnings: Vec<String>,
    /// Custom payload, e.g. tablet routing information.
    pub custom_payload: Option<HashMap<String, Bytes>>,
}

#[derive(Default, Debug)]
struct ConnectionFeatures {
    shard_info: Option<ShardInfo>,
    compression: Option<Compression>,
}

struct Task {
    serialized_request: SerializedRequest,
    response_handler: ResponseHandler,
}

// Shared between the `Connection` and the router task.
struct RouterHandle {
    submit_channel: mpsc::Sender<Task>,

    // Each request send by `Connection::send_request` needs a unique request id.
    // This field is a monotonic generator of such ids.
    request_id_generator: AtomicU64,
    // If a `Connection::send_request` is cancelled, it sends notification
    // about orphaning via the sender below.
    // Also, this sender is unbounded, because:
    // - we need to be able to send notifications from a destructor,
    // - the channel is only used to inform about cancelled requests.
    orphan_notification_sender: mpsc::UnboundedSender<RequestId>,

    // Set before STARTUP is sent when compression was negotiated.
    compression: OnceLock<Compression>,
    // Set by the router once the connection breaks.
    broken: OnceLock<BrokenConnectionError>,

    version: ProtocolVersion,
    in_flight: AtomicUsize,
    streams_in_use: AtomicUsize,
}

impl RouterHandle {
    fn allocate_request_id(&self) -> RequestId {
        self.request_id_generator.fetch_add(1, Ordering::Relaxed)
    }

    fn broken_or_channel_error(&self) -> BrokenConnectionError {
        self.broken
            .get()
            .cloned()
            .unwrap_or_else(|| BrokenConnectionErrorKind::ChannelError.into())
    }

    async fn send_request(
        &self,
        serialized_request: SerializedRequest,
    ) -> Result<TaskResponse, RequestError> {
        if let Some(error) = self.broken.get() {
            return Err(error.clone().into());
        }

        let _in_flight = InFlightGuard::new(&self.in_flight);
        let request_id = self.allocate_request_id();
        let (response_sender, receiver) = oneshot::channel();
        let response_handler = ResponseHandler {
            response_sender,
            request_id,
        };

        let notifier = OrphanhoodNotifier::new(request_id, &self.orphan_notification_sender);

        self.submit_channel
            .send(Task {
                serialized_request,
                response_handler,
            })
            .await
            .map_err(|_| self.broken_or_channel_error())?;

        let task_response = receiver
            .await
            .map_err(|_| self.broken_or_channel_error())?;

        // Response was successfully received, so it's time to disable
        // notification about orphaning.
        notifier.disable();

        task_response
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

// Used to notify the router that a request was abandoned by its caller
// before the response came.
struct OrphanhoodNotifier<'a> {
    enabled: bool,
    request_id: RequestId,
    notification_sender: &'a mpsc::UnboundedSender<RequestId>,
}

impl<'a> OrphanhoodNotifier<'a> {
    fn new(
        request_id: RequestId,
        notification_sender: &'a mpsc::UnboundedSender<RequestId>,
    ) -> Self {
        Self {
            enabled: true,
            request_id,
            notification_sender,
        }
    }

    fn disable(mut self) {
        self.enabled = false;
    }
}

impl Drop for OrphanhoodNotifier<'_> {
    fn drop(&mut self) {
        if self.enabled {
            let _ = self.notification_sender.send(self.request_id);
        }
    }
}

/// A multiplexed connection to one host.
///
/// Any number of tasks may send requests concurrently; each request gets a
/// free stream id and its response is routed back by that id, in whatever
/// order the server answers. Once the connection breaks, every pending and
/// every later request fails with the same [`BrokenConnectionError`].
///
/// Dropping the connection closes the socket.
pub struct Connection {
    _worker_handle: RemoteHandle<()>,

    connect_address: SocketAddr,
    config: ConnectionConfig,
    features: ConnectionFeatures,
    router_handle: Arc<RouterHandle>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connect_address", &self.connect_address)
            .field("shard_info", &self.features.shard_info)
            .field("in_flight", &self.in_flight())
            .field("broken", &self.is_broken())
            .finish_non_exhaustive()
    }
}

impl Connection {
    // Connects to the host and spawns the router.
    // No requests are sent yet; see `open_connection` for the handshake.
    async fn new(
        addr: SocketAddr,
        config: ConnectionConfig,
    ) -> Result<(Self, ErrorReceiver), ConnectionError> {
        let stream_connector = tokio::time::timeout(
            config.connect_timeout,
            connect_with_source_ip(addr, config.local_ip_address),
        )
        .await;
        let stream = match stream_connector {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(ConnectionError::ConnectTimeout);
            }
        };
        stream.set_nodelay(config.tcp_nodelay)?;

        if let Some(tcp_keepalive_interval) = config.tcp_keepalive_interval {
            Self::setup_tcp_keepalive(&stream, tcp_keepalive_interval)?;
        }

        let (sender, receiver) = mpsc::channel(config.submit_queue_capacity.max(1));
        let (error_sender, error_receiver) = tokio::sync::oneshot::channel();
        let (orphan_notification_sender, orphan_notification_receiver) =
            mpsc::unbounded_channel();

        let router_handle = Arc::new(RouterHandle {
            submit_channel: sender,
            request_id_generator: AtomicU64::new(0),
            orphan_notification_sender,
            compression: OnceLock::new(),
            broken: OnceLock::new(),
            version: config.protocol_version,
            in_flight: AtomicUsize::new(0),
            streams_in_use: AtomicUsize::new(0),
        });

        let _worker_handle = Self::run_router(
            config.clone(),
            stream,
            receiver,
            error_sender,
            orphan_notification_receiver,
            Arc::clone(&router_handle),
            addr,
        )
        .await;

        let connection = Connection {
            _worker_handle,
            connect_address: addr,
            config,
            features: Default::default(),
            router_handle,
        };

        Ok((connection, error_receiver))
    }

    fn setup_tcp_keepalive(
        stream: &TcpStream,
        tcp_keepalive_interval: Duration,
    ) -> std::io::Result<()> {
        // Our "interval" is the idle time before the first probe, which
        // socket2 calls "time". Its "interval" is the gap between probes.
        let mut tcp_keepalive = TcpKeepalive::new().with_time(tcp_keepalive_interval);

        // These cfg values are taken from socket2 library, which uses the same constraints.
        #[cfg(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "fuchsia",
            target_os = "illumos",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "tvos",
            target_os = "watchos",
            target_os = "windows",
        ))]
        {
            tcp_keepalive = tcp_keepalive.with_interval(Duration::from_secs(1));
        }

        #[cfg(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "fuchsia",
            target_os = "illumos",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "tvos",
            target_os = "watchos",
        ))]
        {
            tcp_keepalive = tcp_keepalive.with_retries(10);
        }

        let sf = SockRef::from(&stream);
        sf.set_tcp_keepalive(&tcp_keepalive)
    }

    /// Sends a request serialized by the frame layer and waits for its response.
    ///
    /// `compress` applies the compression negotiated during the handshake,
    /// if any. `tracing` asks the server to trace the request.
    pub async fn send_request(
        &self,
        request: &impl SerializableRequest,
        compress: bool,
        tracing: bool,
    ) -> Result<QueryResponse, RequestError> {
        let compression = self.request_compression(compress);
        let serialized_request = SerializedRequest::make(
            request,
            self.config.protocol_version,
            compression,
            tracing,
        )?;
        self.send_serialized(serialized_request).await
    }

    /// Like [`send_request`](Self::send_request), for a body serialized
    /// by an upper layer.
    pub async fn send_raw(
        &self,
        opcode: RequestOpcode,
        body: &[u8],
        compress: bool,
        tracing: bool,
    ) -> Result<QueryResponse, RequestError> {
        let compression = self.request_compression(compress);
        let serialized_request = SerializedRequest::from_body(
            opcode,
            body,
            self.config.protocol_version,
            compression,
            tracing,
        )?;
        self.send_serialized(serialized_request).await
    }

    fn request_compression(&self, compress: bool) -> Option<Compression> {
        if compress {
            self.features.compression
        } else {
            None
        }
    }

    async fn send_serialized(
        &self,
        serialized_request: SerializedRequest,
    ) -> Result<QueryResponse, RequestError> {
        let task_response = self.router_handle.send_request(serialized_request).await?;
        Self::parse_response(task_response)
    }

    fn parse_response(task_response: TaskResponse) -> Result<QueryResponse, RequestError> {
        let body_with_ext =
            frame::parse_response_body_extensions(task_response.header.flags, task_response.body)?;

        for warn_description in &body_with_ext.warnings {
            warn!(
                warning = warn_description.as_str(),
                "Response from the database contains a warning",
            );
        }

        let opcode = ResponseOpcode::try_from(task_response.header.opcode)
            .map_err(CqlResponseParseError::from)?;
        let response = Response::deserialize(opcode, body_with_ext.body)?;

        Ok(QueryResponse {
            response,
            tracing_id: body_with_ext.trace_id,
            warnings: body_with_ext.warnings,
            custom_payload: body_with_ext.custom_payload,
        })
    }

    async fn get_options(&self) -> Result<Supported, ConnectionSetupRequestError> {
        let err = |kind: ConnectionSetupRequestErrorKind| {
            ConnectionSetupRequestError::new(RequestOpcode::Options, kind)
        };

        let response = self
            .send_request(&Options, false, false)
            .await
            .map_err(|e| err(e.into()))?;

        match response.response {
            Response::Supported(supported) => Ok(supported),
            Response::Error(e) => Err(err(ConnectionSetupRequestErrorKind::DbError(e))),
            other => Err(err(ConnectionSetupRequestErrorKind::UnexpectedResponse(
                other.opcode(),
            ))),
        }
    }

    async fn startup(
        &self,
        options: HashMap<Cow<'_, str>, Cow<'_, str>>,
    ) -> Result<(), ConnectionSetupRequestError> {
        let err = |kind: ConnectionSetupRequestErrorKind| {
            ConnectionSetupRequestError::new(RequestOpcode::Startup, kind)
        };

        let response = self
            .send_request(&Startup { options }, false, false)
            .await
            .map_err(|e| err(e.into()))?;

        match response.response {
            Response::Ready => Ok(()),
            Response::Authenticate { authenticator_name } => Err(err(
                ConnectionSetupRequestErrorKind::AuthenticationRequired {
                    authenticator: authenticator_name,
                },
            )),
            Response::Error(e) => Err(err(ConnectionSetupRequestErrorKind::DbError(e))),
            other => Err(err(ConnectionSetupRequestErrorKind::UnexpectedResponse(
                other.opcode(),
            ))),
        }
    }

    /// Requests started and not yet finished, queued ones included.
    pub fn in_flight(&self) -> usize {
        self.router_handle.in_flight.load(Ordering::Relaxed)
    }

    /// Stream ids not assigned to any request. Orphaned requests keep
    /// their ids until the server answers them.
    pub fn available_stream_ids(&self) -> usize {
        self.config
            .protocol_version
            .stream_id_count()
            .saturating_sub(self.router_handle.streams_in_use.load(Ordering::Relaxed))
    }

    /// Whether the connection broke. A broken connection never recovers.
    pub fn is_broken(&self) -> bool {
        self.router_handle.broken.get().is_some()
    }

    /// Sharding parameters advertised by a Scylla host.
    pub fn get_shard_info(&self) -> Option<&ShardInfo> {
        self.features.shard_info.as_ref()
    }

    /// Sharding function of the host, if it is sharded.
    pub fn get_sharder(&self) -> Option<Sharder> {
        self.features.shard_info.as_ref().map(ShardInfo::get_sharder)
    }

    /// Address this connection was opened to.
    pub fn get_connect_address(&self) -> SocketAddr {
        self.connect_address
    }

    /// Protocol version of the connection.
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.config.protocol_version
    }

    /// Compression negotiated during the handshake.
    pub fn compression(&self) -> Option<Compression> {
        self.features.compression
    }

    async fn run_router(
        config: ConnectionConfig,
        stream: TcpStream,
        receiver: mpsc::Receiver<Task>,
        error_sender: tokio::sync::oneshot::Sender<ConnectionError>,
        orphan_notification_receiver: mpsc::UnboundedReceiver<RequestId>,
        router_handle: Arc<RouterHandle>,
        node_address: SocketAddr,
    ) -> RemoteHandle<()> {
        let (task, handle) = Self::router(
            config,
            stream,
            receiver,
            error_sender,
            orphan_notification_receiver,
            router_handle,
            node_address,
        )
        .remote_handle();
        tokio::task::spawn(task);
        handle
    }

    async fn router(
        config: ConnectionConfig,
        stream: TcpStream,
        mut receiver: mpsc::Receiver<Task>,
        error_sender: tokio::sync::oneshot::Sender<ConnectionError>,
        orphan_notification_receiver: mpsc::UnboundedReceiver<RequestId>,
        router_handle: Arc<RouterHandle>,
        node_address: SocketAddr,
    ) {
        let (read_half, write_half) = split(stream);
        // Why are using a mutex here?
        //
        // The handler_map is supposed to be shared between reader and writer
        // futures, which will be run on the same task. The mutex should not
        // be contended and should never cause a wait.
        let handler_map = StdMutex::new(ResponseHandlerMap::new(
            config.protocol_version.stream_id_count(),
        ));
        // Wakes the writer when the reader frees a stream id.
        let stream_freed = Notify::new();

        let k = Self::keepaliver(
            Arc::clone(&router_handle),
            config.keepalive_interval,
            config.keepalive_timeout,
            node_address,
        );

        let r = Self::reader(
            BufReader::with_capacity(SOCKET_BUFFER_SIZE, read_half),
            &handler_map,
            &stream_freed,
            &router_handle,
            &config,
        );
        let w = Self::writer(
            BufWriter::with_capacity(SOCKET_BUFFER_SIZE, write_half),
            &handler_map,
            &stream_freed,
            &mut receiver,
            &router_handle,
        );
        let o = Self::orphaner(&handler_map, orphan_notification_receiver);

        // The error is recorded by the failing future itself, before
        // `try_join!` drops the others. A request the writer holds while
        // waiting for a stream id is dropped with them, and its caller
        // must see the error instead of a closed channel.
        let handle: &RouterHandle = &router_handle;
        let mark_broken = move |result: Result<(), BrokenConnectionError>| {
            if let Err(err) = &result {
                // From now on new requests fail before reaching the queue.
                let _ = handle.broken.set(err.clone());
            }
            result
        };
        let result = futures::try_join!(
            r.map(mark_broken),
            w.map(mark_broken),
            o.map(mark_broken),
            k.map(mark_broken)
        );

        let error: BrokenConnectionError = match result {
            Ok(_) => return, // Connection was dropped, we can return
            Err(err) => err,
        };
        debug!(address = %node_address, error = %error, "Connection broken");

        // Requests still waiting in the queue never got a stream id.
        receiver.close();
        while let Ok(task) = receiver.try_recv() {
            let _ = task
                .response_handler
                .response_sender
                .send(Err(error.clone().into()));
        }

        // The reader/writer futures are dropped, so nobody holds the lock.
        let response_handlers: HashMap<i16, ResponseHandler> =
            handler_map.into_inner().unwrap().into_handlers();
        for (_, handler) in response_handlers {
            // Ignore sending error, request was dropped
            let _ = handler.response_sender.send(Err(error.clone().into()));
        }

        // If someone is listening for connection errors notify them
        let _ = error_sender.send(error.into());
    }

    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        stream_freed: &Notify,
        router_handle: &RouterHandle,
        config: &ConnectionConfig,
    ) -> Result<(), BrokenConnectionError> {
        let mut assembler = FrameAssembler::new(None).with_max_frame_length(config.max_frame_length);

        loop {
            if assembler.compression().is_none() {
                if let Some(compression) = router_handle.compression.get() {
                    assembler.set_compression(Some(*compression));
                }
            }

            let frame =
                Self::read_frame(&mut assembler, &mut read_half, handler_map, config.read_timeout)
                    .await?;
            let header = frame.header;

            if header.direction != FrameDirection::Response {
                return Err(BrokenConnectionErrorKind::FrameFromClient.into());
            }
            if header.version != config.protocol_version {
                return Err(BrokenConnectionErrorKind::VersionMismatch {
                    expected: config.protocol_version,
                    received: header.version,
                }
                .into());
            }
            if header.stream < 0 {
                // Negative streams carry server-initiated EVENTs, which are
                // only delivered to connections that REGISTER for them.
                trace!(
                    stream = header.stream,
                    opcode = header.opcode,
                    "Ignoring frame on a server-initiated stream"
                );
                continue;
            }

            let handler_lookup_res = {
                // We are guaranteed here that handler_map will not be locked
                // by anybody else, so we can do try_lock().unwrap()
                let mut handler_map_guard = handler_map.try_lock().unwrap();
                let res = handler_map_guard.lookup(header.stream);
                router_handle
                    .streams_in_use
                    .store(handler_map_guard.streams_in_use(), Ordering::Relaxed);
                res
            };

            match handler_lookup_res {
                HandlerLookupResult::Handler(handler) => {
                    stream_freed.notify_one();
                    let response = TaskResponse {
                        header,
                        body: frame.body,
                    };
                    // Don't care if sending of the response fails. This must
                    // mean that the receiver side was impatient and is not
                    // waiting for the result anymore.
                    let _ = handler.response_sender.send(Ok(response));
                }
                HandlerLookupResult::Orphaned => {
                    stream_freed.notify_one();
                    trace!(
                        stream = header.stream,
                        "Dropped the response to an abandoned request"
                    );
                }
                HandlerLookupResult::Missing => {
                    // Unsolicited frame. This should not happen and indicates
                    // a bug either in the driver, or in the database
                    debug!(
                        "Received response with unexpected StreamId {}",
                        header.stream
                    );
                    return Err(BrokenConnectionErrorKind::UnexpectedStreamId(header.stream).into());
                }
            }
        }
    }

    // Reads the next frame. Fails if requests are pending and nothing
    // arrived for `read_timeout`; an idle connection never times out.
    async fn read_frame(
        assembler: &mut FrameAssembler,
        read_half: &mut (impl AsyncRead + Unpin),
        handler_map: &StdMutex<ResponseHandlerMap>,
        read_timeout: Option<Duration>,
    ) -> Result<Frame, BrokenConnectionError> {
        let result = match read_timeout {
            None => assembler.read_frame(read_half).await,
            Some(read_timeout) => loop {
                let pending_since = handler_map.try_lock().unwrap().pending_since();
                let deadline = pending_since.unwrap_or_else(Instant::now) + read_timeout;
                // FrameAssembler::read_frame is cancel safe, so retrying
                // after the timeout fires loses no bytes.
                match tokio::time::timeout_at(deadline, assembler.read_frame(read_half)).await {
                    Ok(result) => break result,
                    Err(_elapsed) => {
                        let timed_out = handler_map
                            .try_lock()
                            .unwrap()
                            .pending_since()
                            .is_some_and(|since| since + read_timeout <= Instant::now());
                        if timed_out {
                            warn!(
                                timeout = ?read_timeout,
                                "No response received while requests were pending"
                            );
                            return Err(BrokenConnectionErrorKind::ReadTimeout(read_timeout).into());
                        }
                    }
                }
            },
        };

        match result {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(BrokenConnectionErrorKind::ClosedByServer.into()),
            Err(err) => Err(BrokenConnectionErrorKind::FrameError(err).into()),
        }
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        stream_freed: &Notify,
        task_receiver: &mut mpsc::Receiver<Task>,
        router_handle: &RouterHandle,
    ) -> Result<(), BrokenConnectionError> {
        while let Some(task) = task_receiver.recv().await {
            let mut num_requests = 0;
            let mut total_sent = 0;
            let mut next_task = Some(task);
            while let Some(Task {
                mut serialized_request,
                response_handler,
            }) = next_task.take()
            {
                let stream_id = Self::alloc_stream_id(
                    &mut write_half,
                    handler_map,
                    stream_freed,
                    router_handle,
                    response_handler,
                )
                .await?;

                if let Some(stream_id) = stream_id {
                    match serialized_request.set_stream(stream_id) {
                        Ok(()) => {
                            let req_data: &[u8] = serialized_request.get_data();
                            total_sent += req_data.len();
                            num_requests += 1;
                            write_half
                                .write_all(req_data)
                                .await
                                .map_err(BrokenConnectionErrorKind::WriteError)?;
                        }
                        Err(err) => Self::fail_allocated(
                            handler_map,
                            stream_freed,
                            router_handle,
                            stream_id,
                            err.into(),
                        ),
                    }
                }
                next_task = task_receiver.try_recv().ok();
            }
            trace!("Sending {} requests; {} bytes", num_requests, total_sent);
            write_half
                .flush()
                .await
                .map_err(BrokenConnectionErrorKind::WriteError)?;
        }

        Ok(())
    }

    // Assigns a stream id to the request, waiting for one to be freed if
    // necessary. Returns `None` if the caller gave up in the meantime.
    async fn alloc_stream_id(
        write_half: &mut (impl AsyncWrite + Unpin),
        handler_map: &StdMutex<ResponseHandlerMap>,
        stream_freed: &Notify,
        router_handle: &RouterHandle,
        mut response_handler: ResponseHandler,
    ) -> Result<Option<i16>, BrokenConnectionError> {
        let mut exhausted_since: Option<Instant> = None;
        loop {
            if response_handler.response_sender.is_closed() {
                trace!(
                    request_id = response_handler.request_id,
                    "Skipping a request abandoned before it was sent"
                );
                return Ok(None);
            }

            let allocated = {
                let mut handler_map_guard = handler_map.try_lock().unwrap();
                let allocated = handler_map_guard.allocate(response_handler);
                router_handle
                    .streams_in_use
                    .store(handler_map_guard.streams_in_use(), Ordering::Relaxed);
                allocated
            };

            match allocated {
                Ok(stream_id) => {
                    if let Some(since) = exhausted_since {
                        debug!(waited = ?since.elapsed(), "Stream id freed, resuming writes");
                    }
                    return Ok(Some(stream_id));
                }
                Err(handler) => {
                    response_handler = handler;
                    if exhausted_since.is_none() {
                        warn!(
                            stream_ids = router_handle.version.stream_id_count(),
                            "All stream ids of the connection are in use, \
                             requests wait for responses to free some"
                        );
                        exhausted_since = Some(Instant::now());
                        // Requests buffered so far must reach the server,
                        // otherwise no stream id would ever come back.
                        write_half
                            .flush()
                            .await
                            .map_err(BrokenConnectionErrorKind::WriteError)?;
                    }
                    stream_freed.notified().await;
                }
            }
        }
    }

    fn fail_allocated(
        handler_map: &StdMutex<ResponseHandlerMap>,
        stream_freed: &Notify,
        router_handle: &RouterHandle,
        stream_id: i16,
        error: RequestError,
    ) {
        let lookup = {
            let mut handler_map_guard = handler_map.try_lock().unwrap();
            let lookup = handler_map_guard.lookup(stream_id);
            router_handle
                .streams_in_use
                .store(handler_map_guard.streams_in_use(), Ordering::Relaxed);
            lookup
        };
        stream_freed.notify_one();
        if let HandlerLookupResult::Handler(handler) = lookup {
            let _ = handler.response_sender.send(Err(error));
        }
    }

    // Receives notifications about abandoned requests and marks their
    // stream ids as orphaned. Breaks the connection if orphans pile up.
    async fn orphaner(
        handler_map: &StdMutex<ResponseHandlerMap>,
        mut orphan_receiver: mpsc::UnboundedReceiver<RequestId>,
    ) -> Result<(), BrokenConnectionError> {
        let mut interval = tokio::time::interval(OLD_AGE_ORPHAN_THRESHOLD);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // We are guaranteed here that handler_map will not be locked
                    // by anybody else, so we can do try_lock().unwrap()
                    let handler_map_guard = handler_map.try_lock().unwrap();
                    let old_orphan_count = handler_map_guard.old_orphans_count();
                    if old_orphan_count > OLD_ORPHAN_COUNT_THRESHOLD {
                        warn!(
                            "Too many old orphaned stream ids: {}",
                            old_orphan_count,
                        );
                        let count = u16::try_from(old_orphan_count).unwrap_or(u16::MAX);
                        return Err(BrokenConnectionErrorKind::TooManyOrphanedStreamIds(count).into())
                    }
                }
                Some(request_id) = orphan_receiver.recv() => {
                    trace!(
                        "Trying to orphan stream id associated with request_id = {}",
                        request_id,
                    );
                    let mut handler_map_guard = handler_map.try_lock().unwrap(); // Same as above
                    handler_map_guard.orphan(request_id);
                }
                else => { break }
            }
        }

        Ok(())
    }

    async fn keepaliver(
        router_handle: Arc<RouterHandle>,
        keepalive_interval: Option<Duration>,
        keepalive_timeout: Option<Duration>,
        node_address: SocketAddr, // This address is only used to enrich the log messages
    ) -> Result<(), BrokenConnectionError> {
        async fn issue_keepalive_query(
            router_handle: &RouterHandle,
        ) -> Result<(), BrokenConnectionError> {
            let serialized = SerializedRequest::make(&Options, router_handle.version, None, false)
                .map_err(|err| -> BrokenConnectionError {
                    BrokenConnectionErrorKind::KeepaliveRequestError(Arc::new(err)).into()
                })?;
            router_handle
                .send_request(serialized)
                .await
                .map(|_| ())
                .map_err(|req_err| {
                    BrokenConnectionErrorKind::KeepaliveRequestError(Arc::new(req_err)).into()
                })
        }

        let Some(keepalive_interval) = keepalive_interval else {
            // No keepalives are to be sent.
            return Ok(());
        };

        let mut interval = tokio::time::interval(keepalive_interval);
        interval.tick().await; // Use up the first, instant tick.

        // Default behaviour (Burst) is not suitable for sending keepalives.
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let keepalive_query = issue_keepalive_query(&router_handle);
            let query_result = if let Some(timeout) = keepalive_timeout {
                match tokio::time::timeout(timeout, keepalive_query).await {
                    Ok(res) => res,
                    Err(_) => {
                        warn!(
                            "Timed out while waiting for response to keepalive request on connection to node {}",
                            node_address
                        );
                        return Err(BrokenConnectionErrorKind::KeepaliveTimeout(node_address).into());
                    }
                }
            } else {
                keepalive_query.await
            };
            if let Err(err) = query_result {
                warn!(
                    "Failed to execute keepalive request on connection to node {} - {}",
                    node_address, err
                );
                return Err(err);
            }

            trace!(
                "Keepalive request successful on connection to node {}",
                node_address
            );
        }
    }
}

/// Opens a connection and performs the OPTIONS/STARTUP handshake.
///
/// The returned [`ErrorReceiver`] yields the error that broke the
/// connection, once it breaks.
pub(crate) async fn open_connection(
    addr: SocketAddr,
    config: &ConnectionConfig,
) -> Result<(Connection, ErrorReceiver), ConnectionError> {
    let (mut connection, error_receiver) = Connection::new(addr, config.clone()).await?;

    let mut supported = connection.get_options().await?;

    let shard_info = match ShardInfo::try_from(&supported.options) {
        Ok(info) => Some(info),
        Err(ShardingError::NoShardInfo) => {
            info!("Sharding information not provided by the server");
            None
        }
        Err(e) => {
            error!(
                "Error while parsing sharding information: {}. Proceeding with no sharding info.",
                e
            );
            None
        }
    };

    let supported_compression = supported
        .options
        .remove(request::COMPRESSION)
        .unwrap_or_default();
    let compression = match config.compression {
        Some(compression)
            if supported_compression
                .iter()
                .any(|name| name == compression.as_str()) =>
        {
            Some(compression)
        }
        Some(compression) => {
            warn!(
                requested = %compression,
                supported = ?supported_compression,
                address = %addr,
                "Requested compression is not supported by the server, falling back to no compression"
            );
            None
        }
        None => None,
    };

    let mut options = HashMap::new();
    options.insert(
        Cow::Borrowed(request::CQL_VERSION),
        Cow::Borrowed(request::DEFAULT_CQL_VERSION),
    );
    options.insert(
        Cow::Borrowed(request::DRIVER_NAME),
        Cow::Borrowed(request::DEFAULT_DRIVER_NAME),
    );
    options.insert(
        Cow::Borrowed(request::DRIVER_VERSION),
        Cow::Borrowed(request::DEFAULT_DRIVER_VERSION),
    );
    if let Some(compression) = compression {
        options.insert(
            Cow::Borrowed(request::COMPRESSION),
            Cow::Borrowed(compression.as_str()),
        );
        // Responses to STARTUP and later may come compressed.
        let _ = connection.router_handle.compression.set(compression);
    }

    connection.features = ConnectionFeatures {
        shard_info,
        compression,
    };

    connection.startup(options).await?;
    debug!(
        address = %addr,
        compression = ?compression,
        shard = ?connection.get_shard_info().map(|info| info.shard),
        "Connection established"
    );

    Ok((connection, error_receiver))
}

async fn connect_with_source_ip(
    connect_address: SocketAddr,
    source_ip: Option<IpAddr>,
) -> Result<TcpStream, std::io::Error> {
    // Binding to port 0 is equivalent to choosing random ephemeral port.
    match connect_address {
        SocketAddr::V4(_) => {
            // If source_ip not provided, bind to INADDR_ANY.
            let source_ipv4 = source_ip.unwrap_or(Ipv4Addr::UNSPECIFIED.into());
            let socket = TcpSocket::new_v4()?;
            socket.bind(SocketAddr::new(source_ipv4, 0))?;
            Ok(socket.connect(connect_address).await?)
        }
        SocketAddr::V6(_) => {
            // If source_ip not provided, bind to in6addr_any.
            let source_ipv6 = source_ip.unwrap_or(Ipv6Addr::UNSPECIFIED.into());
            let socket = TcpSocket::new_v6()?;
            socket.bind(SocketAddr::new(source_ipv6, 0))?;
            Ok(socket.connect(connect_address).await?)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use futures::future::join_all;

    use super::*;
    use crate::utils::test_utils::{setup_tracing, MockBehavior, MockNode, MockNodeConfig};

    async fn wait_until(condition: impl Fn() -> bool) {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn echo(connection: &Connection, body: &[u8]) -> Result<Bytes, RequestError> {
        let response = connection
            .send_raw(RequestOpcode::Query, body, true, false)
            .await?;
        match response.response {
            Response::Result(body) => Ok(body),
            other => panic!("Unexpected response: {:?}", other),
        }
    }

    fn broken_kind(error: &BrokenConnectionError) -> &BrokenConnectionErrorKind {
        error.downcast_ref::<BrokenConnectionErrorKind>().unwrap()
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn handshake_negotiates_compression() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::default()).await;

        for compression in [Compression::Lz4, Compression::Snappy] {
            let config = ConnectionConfig {
                compression: Some(compression),
                ..Default::default()
            };
            let (connection, _errors) = open_connection(node.address(), &config).await.unwrap();
            assert_eq!(connection.compression(), Some(compression));
            assert!(connection.get_shard_info().is_none());

            let body = vec![b'x'; 4096];
            assert_eq!(echo(&connection, &body).await.unwrap(), body);
        }
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn unsupported_compression_falls_back_to_none() {
        setup_tracing();
        let mut mock_config = MockNodeConfig::default();
        mock_config
            .supported
            .insert("COMPRESSION".to_owned(), vec!["snappy".to_owned()]);
        let node = MockNode::start(mock_config).await;

        let config = ConnectionConfig {
            compression: Some(Compression::Lz4),
            ..Default::default()
        };
        let (connection, _errors) = open_connection(node.address(), &config).await.unwrap();
        assert_eq!(connection.compression(), None);
        assert_eq!(echo(&connection, b"plain").await.unwrap(), &b"plain"[..]);
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn shard_info_is_read_from_supported() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig {
            shards: Some(4),
            ..Default::default()
        })
        .await;

        let config = ConnectionConfig::default();
        for expected_shard in 0..2 {
            let (connection, _errors) = open_connection(node.address(), &config).await.unwrap();
            let info = connection.get_shard_info().unwrap();
            assert_eq!(info.shard, expected_shard);
            assert_eq!(info.nr_shards.get(), 4);
            assert_eq!(info.msb_ignore, 12);
            assert!(connection.get_sharder().is_some());
        }
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn invalid_shard_info_is_ignored() {
        setup_tracing();
        let mut config = MockNodeConfig::default();
        for (key, value) in [
            ("SCYLLA_SHARD", "0"),
            ("SCYLLA_NR_SHARDS", "4"),
            ("SCYLLA_SHARDING_IGNORE_MSB", "64"),
        ] {
            config.supported.insert(key.to_owned(), vec![value.to_owned()]);
        }
        let node = MockNode::start(config).await;

        let (connection, _errors) = open_connection(node.address(), &ConnectionConfig::default())
            .await
            .unwrap();
        assert!(connection.get_shard_info().is_none());
        assert!(connection.get_sharder().is_none());
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn authentication_request_fails_the_handshake() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig {
            require_auth: true,
            ..Default::default()
        })
        .await;

        let err = open_connection(node.address(), &ConnectionConfig::default())
            .await
            .unwrap_err();
        assert_matches!(err, ConnectionError::ConnectionSetupRequestError(e) => {
            assert_eq!(e.request_kind(), RequestOpcode::Startup);
            assert_matches!(
                e.error(),
                ConnectionSetupRequestErrorKind::AuthenticationRequired { authenticator }
                    if authenticator.ends_with("PasswordAuthenticator")
            );
        });
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn connect_to_closed_port_fails() {
        setup_tracing();
        let address = {
            let node = MockNode::start(MockNodeConfig::default()).await;
            node.address()
        };
        // Give the listener time to go away.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = open_connection(address, &ConnectionConfig::default())
            .await
            .unwrap_err();
        assert_matches!(err, ConnectionError::IoError(_));
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn responses_out_of_order_reach_their_callers() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::with_behavior(MockBehavior::Permuted {
            batch: 16,
            seed: 0x2137,
        }))
        .await;
        let (connection, _errors) = open_connection(node.address(), &ConnectionConfig::default())
            .await
            .unwrap();

        let requests = (0..64u32).map(|i| {
            let connection = &connection;
            async move {
                let body = i.to_be_bytes();
                let response = echo(connection, &body).await.unwrap();
                assert_eq!(&response[..], &body[..]);
            }
        });
        join_all(requests).await;

        assert_eq!(connection.in_flight(), 0);
        assert_eq!(
            connection.available_stream_ids(),
            ProtocolVersion::V4.stream_id_count()
        );
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn requests_wait_for_free_stream_ids() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::with_behavior(MockBehavior::Hold)).await;
        let config = ConnectionConfig {
            protocol_version: ProtocolVersion::V2,
            ..Default::default()
        };
        let (connection, _errors) = open_connection(node.address(), &config).await.unwrap();
        let connection = Arc::new(connection);
        let capacity = ProtocolVersion::V2.stream_id_count();
        assert_eq!(capacity, 128);

        let handles: Vec<_> = (0..200u32)
            .map(|i| {
                let connection = Arc::clone(&connection);
                tokio::spawn(async move {
                    let body = i.to_be_bytes();
                    assert_eq!(&echo(&connection, &body).await.unwrap()[..], &body[..]);
                })
            })
            .collect();

        wait_until(|| node.requests_received() == capacity).await;
        assert_eq!(connection.available_stream_ids(), 0);
        assert_eq!(connection.in_flight(), 200);
        // The rest stays queued until ids are freed.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(node.requests_received(), capacity);

        node.set_behavior(MockBehavior::Echo);
        node.release();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(node.requests_received(), 200);
        assert!(!connection.is_broken());
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn closed_connection_fails_every_request() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::with_behavior(MockBehavior::Hold)).await;
        let (connection, errors) = open_connection(node.address(), &ConnectionConfig::default())
            .await
            .unwrap();
        let connection = Arc::new(connection);

        let handles: Vec<_> = (0..10u32)
            .map(|i| {
                let connection = Arc::clone(&connection);
                tokio::spawn(async move { echo(&connection, &i.to_be_bytes()).await })
            })
            .collect();
        wait_until(|| node.requests_received() == 10).await;

        node.kill_connections();

        for handle in handles {
            assert_matches!(handle.await.unwrap(), Err(RequestError::BrokenConnection(e)) => {
                assert_matches!(broken_kind(&e), BrokenConnectionErrorKind::ClosedByServer);
            });
        }
        assert_matches!(
            errors.await.unwrap(),
            ConnectionError::BrokenConnection(e) => {
                assert_matches!(broken_kind(&e), BrokenConnectionErrorKind::ClosedByServer);
            }
        );
        assert!(connection.is_broken());

        // Later requests fail right away with the same error.
        assert_matches!(
            echo(&connection, b"late").await,
            Err(RequestError::BrokenConnection(e)) => {
                assert_matches!(broken_kind(&e), BrokenConnectionErrorKind::ClosedByServer);
            }
        );
        assert_eq!(node.requests_received(), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ntest::timeout(20000)]
    async fn requests_waiting_for_stream_ids_see_the_breakage_error() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::with_behavior(MockBehavior::Hold)).await;
        let config = ConnectionConfig {
            protocol_version: ProtocolVersion::V2,
            ..Default::default()
        };
        let (connection, _errors) = open_connection(node.address(), &config).await.unwrap();
        let connection = Arc::new(connection);
        let capacity = ProtocolVersion::V2.stream_id_count();

        // One request beyond capacity is held by the writer, the rest queue.
        let handles: Vec<_> = (0..capacity as u32 + 20)
            .map(|i| {
                let connection = Arc::clone(&connection);
                tokio::spawn(async move { echo(&connection, &i.to_be_bytes()).await })
            })
            .collect();
        wait_until(|| node.requests_received() == capacity).await;
        wait_until(|| connection.in_flight() == capacity + 20).await;

        node.kill_connections();

        for handle in handles {
            assert_matches!(handle.await.unwrap(), Err(RequestError::BrokenConnection(e)) => {
                assert_matches!(broken_kind(&e), BrokenConnectionErrorKind::ClosedByServer);
            });
        }
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn read_timeout_applies_only_while_requests_are_pending() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::default()).await;
        let config = ConnectionConfig {
            read_timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let (connection, errors) = open_connection(node.address(), &config).await.unwrap();

        // Idle for several timeouts.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!connection.is_broken());
        assert_eq!(echo(&connection, b"alive").await.unwrap(), &b"alive"[..]);

        node.set_behavior(MockBehavior::Silent);
        assert_matches!(
            echo(&connection, b"lost").await,
            Err(RequestError::BrokenConnection(e)) => {
                assert_matches!(broken_kind(&e), BrokenConnectionErrorKind::ReadTimeout(_));
            }
        );
        assert_matches!(errors.await.unwrap(), ConnectionError::BrokenConnection(_));
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn abandoned_request_keeps_its_stream_id_until_answered() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::with_behavior(MockBehavior::Hold)).await;
        let (connection, _errors) = open_connection(node.address(), &ConnectionConfig::default())
            .await
            .unwrap();
        let capacity = ProtocolVersion::V4.stream_id_count();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), echo(&connection, b"slow")).await;
        assert!(abandoned.is_err());
        assert_eq!(connection.in_flight(), 0);
        assert_eq!(connection.available_stream_ids(), capacity - 1);

        node.set_behavior(MockBehavior::Echo);
        node.release();
        wait_until(|| connection.available_stream_ids() == capacity).await;

        // The late response did not break anything.
        assert_eq!(echo(&connection, b"fast").await.unwrap(), &b"fast"[..]);
        assert!(!connection.is_broken());
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn keepalive_keeps_healthy_connection_open() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::default()).await;
        let config = ConnectionConfig {
            keepalive_interval: Some(Duration::from_millis(30)),
            keepalive_timeout: Some(Duration::from_millis(500)),
            ..Default::default()
        };
        let (connection, _errors) = open_connection(node.address(), &config).await.unwrap();

        wait_until(|| node.requests_received() >= 3).await;
        assert!(!connection.is_broken());
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn unanswered_keepalive_breaks_connection() {
        setup_tracing();
        let node = MockNode::start(MockNodeConfig::with_behavior(MockBehavior::Silent)).await;
        let config = ConnectionConfig {
            keepalive_interval: Some(Duration::from_millis(30)),
            keepalive_timeout: Some(Duration::from_millis(100)),
            read_timeout: None,
            ..Default::default()
        };
        let (connection, errors) = open_connection(node.address(), &config).await.unwrap();

        assert_matches!(
            errors.await.unwrap(),
            ConnectionError::BrokenConnection(e) => {
                assert_matches!(
                    broken_kind(&e),
                    BrokenConnectionErrorKind::KeepaliveTimeout(address)
                        if *address == node.address()
                );
            }
        );
        assert!(connection.is_broken());
    }
}
