use bytes::Bytes;
use http_body::{Body, Frame};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

/// Boxed streaming body used on every outgoing request and on the response
/// returned to the client.
pub type ProxyBody = UnsyncBoxBody<Bytes, StreamError>;

/// Error type for fan-out stream operations
#[derive(Debug, Clone)]
pub enum StreamError {
    /// The source stream failed before completing (a client disconnect
    /// surfaces here as well)
    Source(String),
    /// The stream was abandoned before completion and could not be drained
    Interrupted,
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Source(msg) => write!(f, "source error: {}", msg),
            StreamError::Interrupted => write!(f, "stream interrupted before completion"),
        }
    }
}

impl std::error::Error for StreamError {}

/// Build a complete in-memory [`ProxyBody`] from a fixed payload.
pub fn full(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|err| match err {}).boxed_unsync()
}

/// Sticky terminal event of the source: end-of-stream or the first error.
#[derive(Debug, Clone)]
enum Terminal {
    End,
    Failed(StreamError),
}

/// Per-consumer state kept in the hub registry.
#[derive(Debug, Default)]
struct ConsumerSlot {
    /// Index into `chunks` of the next chunk to deliver.
    chunk_index: usize,
    /// Parked waker, taken and woken on every append or terminal.
    waker: Option<Waker>,
}

/// State shared between the hub and its consumers.
///
/// One mutex guards everything: the chunk sequence and terminal are written
/// on the producer path while the registry is mutated by attach/detach, and
/// the release step needs a consistent snapshot of both.
#[derive(Debug, Default)]
struct Shared {
    /// Ordered, append-only chunk slots. A released slot keeps its position
    /// so consumer indices stay valid.
    chunks: Vec<Option<Bytes>>,
    /// Watermark: every slot below this index has been released.
    released: usize,
    terminal: Option<Terminal>,
    consumers: HashMap<u64, ConsumerSlot>,
    next_id: u64,
}

impl Shared {
    /// Append one source read, release chunks no live consumer needs
    /// anymore, and wake everyone.
    ///
    /// With an empty registry the payload is dropped on the spot: no
    /// reader will ever claim it, and retaining it would buffer the whole
    /// body on the plain-proxy path. The slot is still pushed so positions
    /// stay stable for consumers attached later.
    fn append(&mut self, data: Bytes) {
        if self.consumers.is_empty() {
            self.chunks.push(None);
            return;
        }
        self.chunks.push(Some(data));
        self.release_consumed();
        self.wake_all();
    }

    /// Record the terminal event. The first one is sticky.
    fn terminate(&mut self, terminal: Terminal) {
        if self.terminal.is_none() {
            self.terminal = Some(terminal);
        }
        self.wake_all();
    }

    /// Release every chunk strictly below the slowest live consumer. With an
    /// empty registry nothing is released.
    fn release_consumed(&mut self) {
        let Some(min_index) = self.consumers.values().map(|slot| slot.chunk_index).min() else {
            return;
        };
        // A late attacher can sit below the watermark; it holds no claim on
        // already-released slots, so never release backwards.
        let min_index = min_index.max(self.released);
        for slot in &mut self.chunks[self.released..min_index] {
            *slot = None;
        }
        self.released = min_index;
    }

    fn wake_all(&mut self) {
        for slot in self.consumers.values_mut() {
            if let Some(waker) = slot.waker.take() {
                waker.wake();
            }
        }
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Single-source, many-consumer streaming fan-out.
///
/// The hub wraps one streaming body and multiplexes it to any number of
/// attached [`Consumer`]s, each advancing at its own pace. Chunks already
/// seen by every live consumer are released, so retained memory is bounded
/// by the spread between the fastest and slowest reader plus one source
/// read.
///
/// The hub itself implements [`Body`] and is the primary's read path:
/// polling it pulls from the source, appends a shared copy of the chunk for
/// the consumers, and yields the same bytes to the caller. Consumers that
/// have caught up park until the next pull or the terminal event.
///
/// The hub owns the source, so dropping it releases the inbound stream. If
/// it is dropped while consumers are still live and the stream has not
/// finished, a background task takes over the source and keeps feeding the
/// registry until end-of-stream, an error, or the last consumer detaches.
#[derive(Debug)]
pub struct MultiReader<B>
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: fmt::Display,
{
    source: Option<B>,
    shared: Arc<Mutex<Shared>>,
}

impl<B> MultiReader<B>
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: fmt::Display,
{
    /// Bind a new hub to `source`. No read is performed.
    pub fn new(source: B) -> Self {
        Self {
            source: Some(source),
            shared: Arc::new(Mutex::new(Shared::default())),
        }
    }

    /// Attach a new consumer.
    ///
    /// A consumer observes every chunk still retained at the moment of
    /// attach, then the live suffix of the stream. Callers that need the
    /// entire stream must attach before the first read is initiated on any
    /// handle. Dropping the consumer detaches it.
    pub fn attach(&self) -> Consumer {
        let mut state = lock(&self.shared);
        let id = state.next_id;
        state.next_id += 1;
        state.consumers.insert(id, ConsumerSlot::default());
        Consumer {
            shared: Arc::clone(&self.shared),
            id,
        }
    }
}

impl<B> Body for MultiReader<B>
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: fmt::Display,
{
    type Data = Bytes;
    type Error = StreamError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        // The terminal is sticky: once set, the source is never touched again.
        {
            let state = lock(&this.shared);
            if let Some(terminal) = &state.terminal {
                return match terminal {
                    Terminal::End => Poll::Ready(None),
                    Terminal::Failed(err) => Poll::Ready(Some(Err(err.clone()))),
                };
            }
        }

        let Some(source) = this.source.as_mut() else {
            return Poll::Ready(None);
        };

        loop {
            match Pin::new(&mut *source).poll_frame(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                    Ok(data) => {
                        // A zero-length read appends nothing and wakes no one.
                        if data.is_empty() {
                            continue;
                        }
                        lock(&this.shared).append(data.clone());
                        return Poll::Ready(Some(Ok(Frame::data(data))));
                    }
                    // Trailer frames are not fanned out: Trailer and
                    // Transfer-Encoding are stripped from every clone, so no
                    // upstream expects them.
                    Err(_frame) => continue,
                },
                Poll::Ready(Some(Err(err))) => {
                    let err = StreamError::Source(err.to_string());
                    lock(&this.shared).terminate(Terminal::Failed(err.clone()));
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    lock(&this.shared).terminate(Terminal::End);
                    return Poll::Ready(None);
                }
            }
        }
    }
}

impl<B> Drop for MultiReader<B>
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: fmt::Display,
{
    fn drop(&mut self) {
        let Some(source) = self.source.take() else {
            return;
        };
        {
            let state = lock(&self.shared);
            if state.terminal.is_some() || state.consumers.is_empty() {
                return;
            }
        }
        // The primary gave up before the stream completed but consumers are
        // still reading: hand the source to a background drain so they can
        // finish.
        let shared = Arc::clone(&self.shared);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(drain_source(source, shared));
            }
            Err(_) => lock(&shared).terminate(Terminal::Failed(StreamError::Interrupted)),
        }
    }
}

/// Pull the orphaned source to completion on behalf of the remaining
/// consumers.
async fn drain_source<B>(mut source: B, shared: Arc<Mutex<Shared>>)
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: fmt::Display,
{
    loop {
        if lock(&shared).consumers.is_empty() {
            break;
        }
        match source.frame().await {
            Some(Ok(frame)) => {
                if let Ok(data) = frame.into_data() {
                    if !data.is_empty() {
                        lock(&shared).append(data);
                    }
                }
            }
            Some(Err(err)) => {
                let err = StreamError::Source(err.to_string());
                lock(&shared).terminate(Terminal::Failed(err));
                break;
            }
            None => {
                lock(&shared).terminate(Terminal::End);
                break;
            }
        }
    }
}

/// One attached reader of a [`MultiReader`].
///
/// Delivers the source's chunks in order, at this handle's own pace,
/// independent of every other consumer. Implements both [`Body`] (for use
/// as an outgoing request body) and [`futures_core::Stream`].
#[derive(Debug)]
pub struct Consumer {
    shared: Arc<Mutex<Shared>>,
    id: u64,
}

impl Body for Consumer {
    type Data = Bytes;
    type Error = StreamError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let mut guard = lock(&this.shared);
        let state = &mut *guard;

        let Some(slot) = state.consumers.get_mut(&this.id) else {
            // Detached; callers do not read after close.
            return Poll::Ready(None);
        };

        // Skip released slots so a late attacher lands on the retained
        // suffix; positions only ever advance.
        while slot.chunk_index < state.chunks.len() {
            let index = slot.chunk_index;
            slot.chunk_index += 1;
            if let Some(chunk) = &state.chunks[index] {
                return Poll::Ready(Some(Ok(Frame::data(chunk.clone()))));
            }
        }

        match &state.terminal {
            Some(Terminal::End) => Poll::Ready(None),
            Some(Terminal::Failed(err)) => Poll::Ready(Some(Err(err.clone()))),
            None => {
                // Caught up with the producer: park until the next append or
                // the terminal. Parking and appending happen under the same
                // lock, so this wakeup cannot be lost.
                slot.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl futures_core::Stream for Consumer {
    type Item = Result<Bytes, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Body::poll_frame(self, cx) {
            Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                Ok(data) => Poll::Ready(Some(Ok(data))),
                Err(_frame) => Poll::Ready(None),
            },
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        lock(&self.shared).consumers.remove(&self.id);
    }
}
