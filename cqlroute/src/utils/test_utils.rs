use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use cqlroute_cql::frame::header::{FrameDirection, FrameHeader};
use cqlroute_cql::frame::request::{RequestOpcode, Startup, COMPRESSION, CQL_VERSION};
use cqlroute_cql::frame::response::ResponseOpcode;
use cqlroute_cql::frame::{compress_append, flag, types};
use cqlroute_cql::{Compression, Frame, FrameAssembler};
use futures::future::RemoteHandle;
use futures::FutureExt;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_pcg::Pcg32;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use uuid::Uuid;

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

/// Serializes a `tablets-routing-v1` custom payload value.
pub(crate) fn serialize_tablet_payload(first: i64, last: i64, replicas: &[(Uuid, i32)]) -> Bytes {
    fn field(buf: &mut Vec<u8>, f: impl FnOnce(&mut Vec<u8>)) {
        let mut inner = Vec::new();
        f(&mut inner);
        types::write_bytes(&inner, buf).unwrap();
    }

    let mut buf = Vec::new();
    field(&mut buf, |b| types::write_long(first, b));
    field(&mut buf, |b| types::write_long(last, b));
    field(&mut buf, |b| {
        types::write_int(replicas.len() as i32, b);
        for (id, shard) in replicas {
            field(b, |e| {
                field(e, |u| types::write_uuid(id, u));
                field(e, |s| types::write_int(*shard, s));
            });
        }
    });
    buf.into()
}

/// How a [`MockNode`] answers requests made after the handshake,
/// keepalive OPTIONS included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MockBehavior {
    /// Answer right away with a RESULT whose body is the request body.
    Echo,
    /// Answer in batches of `batch` requests, each batch in shuffled order.
    Permuted { batch: usize, seed: u64 },
    /// Keep requests unanswered until [`MockNode::release`].
    Hold,
    /// Never answer.
    Silent,
    /// Close the socket on the first request.
    Close,
}

#[derive(Debug, Clone)]
pub(crate) struct MockNodeConfig {
    pub(crate) supported: HashMap<String, Vec<String>>,
    pub(crate) behavior: MockBehavior,
    /// When set, the n-th accepted connection lands on shard `n % shards`.
    pub(crate) shards: Option<u16>,
    pub(crate) require_auth: bool,
}

impl Default for MockNodeConfig {
    fn default() -> Self {
        let supported = HashMap::from([
            (CQL_VERSION.to_owned(), vec!["3.0.0".to_owned()]),
            (
                COMPRESSION.to_owned(),
                vec!["lz4".to_owned(), "snappy".to_owned()],
            ),
        ]);
        MockNodeConfig {
            supported,
            behavior: MockBehavior::Echo,
            shards: None,
            require_auth: false,
        }
    }
}

impl MockNodeConfig {
    pub(crate) fn with_behavior(behavior: MockBehavior) -> Self {
        MockNodeConfig {
            behavior,
            ..Default::default()
        }
    }
}

struct MockShared {
    config: MockNodeConfig,
    behavior: StdMutex<MockBehavior>,
    accepted: AtomicUsize,
    requests: AtomicUsize,
}

/// An in-process CQL node listening on a loopback port.
///
/// It performs the OPTIONS/STARTUP handshake like a real server and then
/// answers other requests according to its [`MockBehavior`]. Dropping the
/// node closes the listener and every connection.
pub(crate) struct MockNode {
    address: SocketAddr,
    shared: Arc<MockShared>,
    release: watch::Sender<u64>,
    kill: watch::Sender<u64>,
    _acceptor: RemoteHandle<()>,
}

impl MockNode {
    pub(crate) async fn start(config: MockNodeConfig) -> MockNode {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let shared = Arc::new(MockShared {
            behavior: StdMutex::new(config.behavior),
            config,
            accepted: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
        });
        let (release, release_receiver) = watch::channel(0);
        let (kill, kill_receiver) = watch::channel(0);

        let (fut, acceptor) = accept_loop(
            listener,
            Arc::clone(&shared),
            release_receiver,
            kill_receiver,
        )
        .remote_handle();
        tokio::spawn(fut);

        MockNode {
            address,
            shared,
            release,
            kill,
            _acceptor: acceptor,
        }
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.address
    }

    pub(crate) fn accepted_connections(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Requests received after the handshake, over all connections.
    pub(crate) fn requests_received(&self) -> usize {
        self.shared.requests.load(Ordering::SeqCst)
    }

    pub(crate) fn set_behavior(&self, behavior: MockBehavior) {
        *self.shared.behavior.lock().unwrap() = behavior;
    }

    /// Answers every request held so far, on all connections.
    pub(crate) fn release(&self) {
        self.release.send_modify(|generation| *generation += 1);
    }

    /// Closes every connection accepted so far. The listener stays open.
    pub(crate) fn kill_connections(&self) {
        self.kill.send_modify(|generation| *generation += 1);
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<MockShared>,
    release: watch::Receiver<u64>,
    kill: watch::Receiver<u64>,
) {
    while let Ok((socket, _)) = listener.accept().await {
        let index = shared.accepted.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(serve_connection(
            socket,
            index,
            Arc::clone(&shared),
            release.clone(),
            kill.clone(),
        ));
    }
}

async fn serve_connection(
    socket: TcpStream,
    index: usize,
    shared: Arc<MockShared>,
    mut release: watch::Receiver<u64>,
    mut kill: watch::Receiver<u64>,
) {
    release.borrow_and_update();
    kill.borrow_and_update();

    let (mut read_half, mut write_half) = socket.into_split();
    let mut assembler = FrameAssembler::new(None);
    let mut compression = None;
    let mut started = false;
    let mut held: Vec<Frame> = Vec::new();

    loop {
        let frame = tokio::select! {
            frame = assembler.read_frame(&mut read_half) => match frame {
                Ok(Some(frame)) => frame,
                _ => return,
            },
            released = release.changed() => {
                if released.is_err() {
                    return;
                }
                for frame in held.drain(..) {
                    if echo(&mut write_half, &frame, compression).await.is_err() {
                        return;
                    }
                }
                continue;
            }
            // Either a kill request or the node was dropped.
            _ = kill.changed() => return,
        };

        let Ok(opcode) = RequestOpcode::try_from(frame.header.opcode) else {
            return;
        };
        let result = match opcode {
            RequestOpcode::Options if !started => {
                let mut body = Vec::new();
                types::write_string_multimap(&supported_options(&shared.config, index), &mut body)
                    .unwrap();
                write_response(
                    &mut write_half,
                    &frame.header,
                    ResponseOpcode::Supported,
                    &body,
                    None,
                )
                .await
            }
            RequestOpcode::Startup => {
                let Ok(startup) = Startup::deserialize(&mut &frame.body[..]) else {
                    return;
                };
                let (opcode, body) = if shared.config.require_auth {
                    let mut body = Vec::new();
                    types::write_string("org.apache.cassandra.auth.PasswordAuthenticator", &mut body)
                        .unwrap();
                    (ResponseOpcode::Authenticate, body)
                } else {
                    (ResponseOpcode::Ready, Vec::new())
                };
                let result = write_response(&mut write_half, &frame.header, opcode, &body, None).await;
                started = true;
                compression = startup
                    .options
                    .get(COMPRESSION)
                    .and_then(|name| name.parse::<Compression>().ok());
                assembler.set_compression(compression);
                result
            }
            _ => {
                shared.requests.fetch_add(1, Ordering::SeqCst);
                let behavior = *shared.behavior.lock().unwrap();
                match behavior {
                    MockBehavior::Echo => echo(&mut write_half, &frame, compression).await,
                    MockBehavior::Permuted { batch, seed } => {
                        held.push(frame);
                        if held.len() < batch {
                            continue;
                        }
                        let mut rng = Pcg32::seed_from_u64(seed.wrapping_add(index as u64));
                        held.shuffle(&mut rng);
                        let mut result = Ok(());
                        for frame in held.drain(..) {
                            result = echo(&mut write_half, &frame, compression).await;
                            if result.is_err() {
                                break;
                            }
                        }
                        result
                    }
                    MockBehavior::Hold => {
                        held.push(frame);
                        Ok(())
                    }
                    MockBehavior::Silent => Ok(()),
                    MockBehavior::Close => return,
                }
            }
        };
        if result.is_err() {
            return;
        }
    }
}

fn supported_options(config: &MockNodeConfig, index: usize) -> HashMap<String, Vec<String>> {
    let mut options = config.supported.clone();
    if let Some(shards) = config.shards {
        let shard = index % usize::from(shards);
        options.insert("SCYLLA_SHARD".to_owned(), vec![shard.to_string()]);
        options.insert("SCYLLA_NR_SHARDS".to_owned(), vec![shards.to_string()]);
        options.insert("SCYLLA_SHARDING_IGNORE_MSB".to_owned(), vec!["12".to_owned()]);
    }
    options
}

async fn echo(
    writer: &mut (impl AsyncWrite + Unpin),
    request: &Frame,
    compression: Option<Compression>,
) -> std::io::Result<()> {
    write_response(
        writer,
        &request.header,
        ResponseOpcode::Result,
        &request.body,
        compression,
    )
    .await
}

async fn write_response(
    writer: &mut (impl AsyncWrite + Unpin),
    request: &FrameHeader,
    opcode: ResponseOpcode,
    body: &[u8],
    compression: Option<Compression>,
) -> std::io::Result<()> {
    let mut flags = 0;
    let mut payload = Vec::new();
    match compression {
        Some(compression) => {
            flags |= flag::COMPRESSION;
            compress_append(body, compression, &mut payload).map_err(std::io::Error::other)?;
        }
        None => payload.extend_from_slice(body),
    }

    let header = FrameHeader {
        version: request.version,
        direction: FrameDirection::Response,
        flags,
        stream: request.stream,
        opcode: opcode as u8,
        length: payload.len(),
    };
    let mut buf = Vec::with_capacity(header.encoded_len() + payload.len());
    header.encode(&mut buf).map_err(std::io::Error::other)?;
    buf.extend_from_slice(&payload);
    writer.write_all(&buf).await
}
