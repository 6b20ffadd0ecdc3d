//! Errors returned by the transport and routing core.

use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cqlroute_cql::frame::frame_errors::{
    CqlRequestSerializationError, CqlResponseParseError, FrameBodyExtensionsParseError,
    FrameError, FrameHeaderEncodeError,
};
use cqlroute_cql::frame::request::RequestOpcode;
use cqlroute_cql::frame::response::{self, ResponseOpcode};
use thiserror::Error;

/// An error that prevented a connection from being established.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    /// Connect timeout elapsed before the TCP handshake finished.
    #[error("Connect timeout elapsed")]
    ConnectTimeout,

    /// Socket-level failure while connecting or configuring the socket.
    #[error(transparent)]
    IoError(Arc<std::io::Error>),

    /// One of the handshake requests (OPTIONS, STARTUP) failed.
    #[error(transparent)]
    ConnectionSetupRequestError(#[from] ConnectionSetupRequestError),

    /// The connection broke, possibly during the handshake.
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),
}

impl From<std::io::Error> for ConnectionError {
    fn from(value: std::io::Error) -> Self {
        ConnectionError::IoError(Arc::new(value))
    }
}

/// A handshake request failed.
#[derive(Error, Debug, Clone)]
#[error("Failed to perform a connection setup request. Request: {request_kind:?}, reason: {error}")]
pub struct ConnectionSetupRequestError {
    request_kind: RequestOpcode,
    error: ConnectionSetupRequestErrorKind,
}

impl ConnectionSetupRequestError {
    pub(crate) fn new(request_kind: RequestOpcode, error: ConnectionSetupRequestErrorKind) -> Self {
        ConnectionSetupRequestError {
            request_kind,
            error,
        }
    }

    /// Which handshake request failed.
    pub fn request_kind(&self) -> RequestOpcode {
        self.request_kind
    }

    /// Why it failed.
    pub fn error(&self) -> &ConnectionSetupRequestErrorKind {
        &self.error
    }
}

/// The cause of a [`ConnectionSetupRequestError`].
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionSetupRequestErrorKind {
    /// Sending the request or receiving its response failed.
    #[error(transparent)]
    RequestError(#[from] RequestError),

    /// The server answered with an ERROR frame.
    #[error(transparent)]
    DbError(response::Error),

    /// The server answered with a frame the handshake does not expect.
    #[error("Received unexpected response from the server: {0:?}")]
    UnexpectedResponse(ResponseOpcode),

    /// The response body could not be parsed.
    #[error(transparent)]
    ResponseParse(#[from] CqlResponseParseError),

    /// The server demands authentication; credentials are not handled here.
    #[error("Server requires authentication with {authenticator}")]
    AuthenticationRequired { authenticator: String },
}

/// A fatal error that made a connection unusable.
///
/// It is cheap to clone, so one instance can be delivered to every request
/// that was pending when the connection broke.
#[derive(Error, Debug, Clone)]
#[error("Connection broken, reason: {0}")]
pub struct BrokenConnectionError(Arc<dyn StdError + Sync + Send>);

impl BrokenConnectionError {
    /// Retrieve an error reason by downcasting to specific type.
    pub fn downcast_ref<T: StdError + 'static>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

/// Why a connection broke.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BrokenConnectionErrorKind {
    /// The received byte stream could not be split into frames.
    #[error("Failed to read a frame: {0}")]
    FrameError(FrameError),

    /// The server closed the connection.
    #[error("Connection closed by the server")]
    ClosedByServer,

    /// A frame not marked as a response arrived.
    #[error("Received a frame marked as coming from a client")]
    FrameFromClient,

    /// A response frame of a different protocol version arrived.
    #[error("Received a frame of protocol {received}, connection uses {expected}")]
    VersionMismatch {
        expected: cqlroute_cql::ProtocolVersion,
        received: cqlroute_cql::ProtocolVersion,
    },

    /// No frame arrived for too long while responses were outstanding.
    #[error("No response received for {0:?} while requests were pending")]
    ReadTimeout(Duration),

    /// Keepalive request did not complete in time.
    #[error("Timed out while waiting for response to keepalive request on connection to node {0}")]
    KeepaliveTimeout(SocketAddr),

    /// Keepalive request failed.
    #[error("Failed to execute keepalive request: {0}")]
    KeepaliveRequestError(Arc<dyn StdError + Sync + Send>),

    /// Writing to the socket failed.
    #[error("Failed to write data: {0}")]
    WriteError(std::io::Error),

    /// The server answered on a stream id with nothing pending.
    #[error("Received response with unexpected StreamId {0}")]
    UnexpectedStreamId(i16),

    /// Too many stream ids stayed orphaned for too long.
    #[error("Too many orphaned stream ids: {0}")]
    TooManyOrphanedStreamIds(u16),

    /// The connection's worker is gone.
    #[error("Failed to send/receive data needed to perform a request via tokio channel.")]
    ChannelError,
}

impl From<BrokenConnectionErrorKind> for BrokenConnectionError {
    fn from(value: BrokenConnectionErrorKind) -> Self {
        BrokenConnectionError(Arc::new(value))
    }
}

/// A single request on an established connection failed.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestError {
    /// The request could not be serialized.
    #[error(transparent)]
    Serialization(#[from] CqlRequestSerializationError),

    /// The stream id assigned by the connection did not fit the frame header.
    #[error(transparent)]
    StreamIdEncoding(#[from] FrameHeaderEncodeError),

    /// The response's extensions (tracing id, warnings, custom payload) were malformed.
    #[error(transparent)]
    BodyExtensionsParse(#[from] FrameBodyExtensionsParseError),

    /// The response carried an opcode this driver does not know.
    #[error(transparent)]
    ResponseParse(#[from] CqlResponseParseError),

    /// The connection broke before the response arrived.
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),
}

/// A host's pool could not provide a connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionPoolError {
    /// Every connection attempt failed. Holds the most recent reason.
    #[error("The pool is broken; Last connection failed with: {last_connection_error}")]
    Broken {
        /// Error of the most recent failed connection attempt.
        last_connection_error: ConnectionError,
    },

    /// The pool has not opened any connection yet.
    #[error("Pool is still being initialized")]
    Initializing,

    /// The host is ignored and never gets connections.
    #[error("The host is ignored by its distance; no connections are kept to it")]
    HostIgnored,

    /// The pool was shut down.
    #[error("The pool was shut down")]
    Shutdown,

    /// No pool exists because the host is not part of the cluster.
    #[error("Host {0} is not known to the cluster")]
    UnknownHost(uuid::Uuid),

    /// The pool is at its maximum size and no connection has a free stream id.
    #[error("The pool to {address} is overloaded: {connections} connections, all saturated")]
    Overloaded {
        /// Address of the overloaded host.
        address: SocketAddr,
        /// Number of connections in the pool.
        connections: usize,
    },
}

/// Failure to parse a token advertised by a host.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Cannot parse {token:?} as a {partitioner} token")]
pub struct TokenParseError {
    pub(crate) token: String,
    pub(crate) partitioner: &'static str,
}

/// The tablet routing payload sent by the server was malformed.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TabletParsingError {
    /// A field of the payload could not be decoded.
    #[error("Failed to deserialize tablet payload: {0}")]
    Deserialization(#[from] cqlroute_cql::frame::frame_errors::LowLevelDeserializationError),

    /// The payload had bytes left over after the last field.
    #[error("Tablet payload has {0} trailing bytes")]
    TrailingBytes(usize),

    /// The tablet range was empty or reversed.
    #[error("Tablet range ({first}, {last}] is empty")]
    EmptyRange { first: i64, last: i64 },

    /// Shard number was negative.
    #[error("Shard id {0} is negative")]
    NegativeShard(i32),
}

impl From<std::num::TryFromIntError> for TabletParsingError {
    fn from(value: std::num::TryFromIntError) -> Self {
        TabletParsingError::Deserialization(value.into())
    }
}

/// A partition key could not be hashed into a token.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TokenCalculationError {
    /// A component of a composite partition key is longer than 65535 bytes.
    #[error("Partition key component of {0} bytes is too long")]
    ValueTooLong(usize),
}
