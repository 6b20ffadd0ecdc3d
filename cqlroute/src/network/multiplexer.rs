//! Stream id bookkeeping of a single connection.
//!
//! Every request in flight on a connection is tagged with a stream id, and
//! the server tags its response with the same id. [`ResponseHandlerMap`]
//! pairs the two: it hands out free ids, remembers who waits on each of them
//! and returns the id to the free set once the response arrives.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use bytes::Bytes;
use cqlroute_cql::frame::header::FrameHeader;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::errors::RequestError;

/// If more than this many stream ids stay orphaned for longer than
/// [`OLD_AGE_ORPHAN_THRESHOLD`], the connection is considered broken.
pub(crate) const OLD_ORPHAN_COUNT_THRESHOLD: usize = 1024;
pub(crate) const OLD_AGE_ORPHAN_THRESHOLD: Duration = Duration::from_secs(1);

pub(crate) type RequestId = u64;

/// A response frame, matched to its request but not yet parsed.
#[derive(Debug)]
pub(crate) struct TaskResponse {
    pub(crate) header: FrameHeader,
    pub(crate) body: Bytes,
}

pub(crate) type ResponseSender = oneshot::Sender<Result<TaskResponse, RequestError>>;

/// Completion sink of one pending request.
#[derive(Debug)]
pub(crate) struct ResponseHandler {
    pub(crate) response_sender: ResponseSender,
    pub(crate) request_id: RequestId,
}

#[derive(Debug)]
pub(crate) enum HandlerLookupResult {
    /// The request was abandoned by its caller; the response is dropped.
    Orphaned,
    Handler(ResponseHandler),
    /// Nothing was pending on this stream id.
    Missing,
}

/// Pending requests of a connection, keyed by stream id.
///
/// A stream id is either free or assigned to exactly one pending request
/// (possibly orphaned), never both.
pub(crate) struct ResponseHandlerMap {
    stream_set: StreamIdSet,
    handlers: HashMap<i16, ResponseHandler>,

    request_to_stream: HashMap<RequestId, i16>,
    orphanage_tracker: OrphanageTracker,

    // Last moment the connection made progress while something was pending:
    // when the first request got queued, or when the last response arrived.
    pending_since: Option<Instant>,
}

impl ResponseHandlerMap {
    pub(crate) fn new(stream_id_count: usize) -> Self {
        Self {
            stream_set: StreamIdSet::new(stream_id_count),
            handlers: HashMap::new(),
            request_to_stream: HashMap::new(),
            orphanage_tracker: OrphanageTracker::new(),
            pending_since: None,
        }
    }

    /// Assigns a free stream id to the handler. Gives the handler back
    /// if all ids are taken.
    pub(crate) fn allocate(
        &mut self,
        response_handler: ResponseHandler,
    ) -> Result<i16, ResponseHandler> {
        let Some(stream_id) = self.stream_set.allocate() else {
            return Err(response_handler);
        };
        if self.handlers.is_empty() {
            self.pending_since = Some(Instant::now());
        }
        self.request_to_stream
            .insert(response_handler.request_id, stream_id);
        let prev_handler = self.handlers.insert(stream_id, response_handler);
        debug_assert!(prev_handler.is_none());

        Ok(stream_id)
    }

    /// Drops the handler of an abandoned request. Its stream id stays
    /// reserved until the server answers on it.
    pub(crate) fn orphan(&mut self, request_id: RequestId) {
        if let Some(stream_id) = self.request_to_stream.remove(&request_id) {
            debug!(
                "Orphaning stream_id = {} associated with request_id = {}",
                stream_id, request_id
            );
            self.orphanage_tracker.insert(stream_id);
            self.handlers.remove(&stream_id);
            if self.handlers.is_empty() {
                self.pending_since = None;
            }
        }
    }

    pub(crate) fn old_orphans_count(&self) -> usize {
        self.orphanage_tracker
            .orphans_older_than(OLD_AGE_ORPHAN_THRESHOLD)
    }

    /// Finds who waits on `stream_id` and frees the id.
    pub(crate) fn lookup(&mut self, stream_id: i16) -> HandlerLookupResult {
        if !self.stream_set.free(stream_id) {
            return HandlerLookupResult::Missing;
        }

        if self.orphanage_tracker.remove(stream_id) {
            return HandlerLookupResult::Orphaned;
        }

        let Some(handler) = self.handlers.remove(&stream_id) else {
            return HandlerLookupResult::Missing;
        };
        // A late orphan notification must not touch the next request
        // that gets this stream id.
        self.request_to_stream.remove(&handler.request_id);
        self.pending_since = if self.handlers.is_empty() {
            None
        } else {
            Some(Instant::now())
        };

        HandlerLookupResult::Handler(handler)
    }

    /// Moment from which the read timeout counts, if any request is pending.
    pub(crate) fn pending_since(&self) -> Option<Instant> {
        self.pending_since
    }

    /// Stream ids not free, orphaned ones included.
    pub(crate) fn streams_in_use(&self) -> usize {
        self.stream_set.in_use()
    }

    /// Handlers of all pending requests, used to fail them
    /// after the connection breaks.
    pub(crate) fn into_handlers(self) -> HashMap<i16, ResponseHandler> {
        self.handlers
    }
}

struct OrphanageTracker {
    orphans: HashMap<i16, Instant>,
    by_orphaning_times: BTreeSet<(Instant, i16)>,
}

impl OrphanageTracker {
    fn new() -> Self {
        Self {
            orphans: HashMap::new(),
            by_orphaning_times: BTreeSet::new(),
        }
    }

    fn insert(&mut self, stream_id: i16) {
        let now = Instant::now();
        self.orphans.insert(stream_id, now);
        self.by_orphaning_times.insert((now, stream_id));
    }

    fn remove(&mut self, stream_id: i16) -> bool {
        match self.orphans.remove(&stream_id) {
            Some(time) => {
                self.by_orphaning_times.remove(&(time, stream_id));
                true
            }
            None => false,
        }
    }

    fn orphans_older_than(&self, age: Duration) -> usize {
        let Some(minimal_age) = Instant::now().checked_sub(age) else {
            return 0;
        };
        // Linear in the number of old orphans only, so cheap on a healthy connection.
        self.by_orphaning_times
            .range(..(minimal_age, i16::MAX))
            .count()
    }
}

/// Set of stream ids `0..capacity`, as a bitmap of used ids.
struct StreamIdSet {
    used_bitmap: Box<[u64]>,
    capacity: usize,
    in_use: usize,
}

impl StreamIdSet {
    fn new(capacity: usize) -> Self {
        Self {
            used_bitmap: vec![0; capacity.div_ceil(64)].into_boxed_slice(),
            capacity,
            in_use: 0,
        }
    }

    fn allocate(&mut self) -> Option<i16> {
        for (block_id, block) in self.used_bitmap.iter_mut().enumerate() {
            if *block != !0 {
                let off = block.trailing_ones() as usize;
                let stream_id = block_id * 64 + off;
                if stream_id >= self.capacity {
                    return None;
                }
                *block |= 1u64 << off;
                self.in_use += 1;
                return Some(stream_id as i16);
            }
        }
        None
    }

    /// Returns whether the id was in use.
    fn free(&mut self, stream_id: i16) -> bool {
        let Ok(id) = usize::try_from(stream_id) else {
            return false;
        };
        if id >= self.capacity {
            return false;
        }
        let mask = 1u64 << (id % 64);
        let block = &mut self.used_bitmap[id / 64];
        if *block & mask == 0 {
            return false;
        }
        *block &= !mask;
        self.in_use -= 1;
        true
    }

    fn in_use(&self) -> usize {
        self.in_use
    }
}
