//! Interfaces to the collaborators surrounding a request handler.
//!
//! The handler never owns a socket, a timer wheel or a worker pool; it
//! talks to all of them through the traits here, injected once through a
//! [`HandlerContext`]. Tests supply fakes, production wires the connection
//! layer and the tokio-backed implementations from
//! [`runtime`](crate::runtime).

use std::{
    io,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use crate::{
    config::Config,
    handler::{
        raw::{RawStep, SocketRead, SocketWrite},
        HandlerRef,
    },
    message::Message,
    response::ResponseBody,
    sid::{SidManager, StreamId},
    status::Status,
    url::Url,
};

/// One endpoint visited while driving a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostInfo {
    /// Location of the endpoint.
    pub url: Url,
    /// Whether the endpoint acts as the load balancer for this request.
    pub load_balancer: bool,
}

impl HostInfo {
    /// A plain data-server entry.
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self {
            url,
            load_balancer: false,
        }
    }
}

/// Ordered endpoints contacted for one request, surfaced to the caller on
/// completion.
pub type HostList = Vec<HostInfo>;

/// What the handler wants done with an arriving frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameAction {
    /// Not ours; leave it for someone else.
    Ignore,
    /// The body is in the frame buffer; deliver it through
    /// [`MessageHandler::process`].
    Take,
    /// The body must be streamed from the socket through
    /// [`MessageHandler::read_message_body`] before delivery.
    TakeRaw,
}

/// Decision returned by [`MessageHandler::examine`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExamineResult {
    /// How to move the frame body.
    pub action: FrameAction,
    /// Whether the dispatch table may drop the handler once this frame is
    /// delivered (set on final frames).
    pub remove_handler: bool,
}

impl ExamineResult {
    /// Frame is not for this handler.
    #[must_use]
    pub const fn ignore() -> Self {
        Self {
            action: FrameAction::Ignore,
            remove_handler: false,
        }
    }

    /// Deliver a buffered frame, keeping the handler registered.
    #[must_use]
    pub const fn take() -> Self {
        Self {
            action: FrameAction::Take,
            remove_handler: false,
        }
    }

    /// Deliver a buffered frame and drop the handler afterwards.
    #[must_use]
    pub const fn take_final() -> Self {
        Self {
            action: FrameAction::Take,
            remove_handler: true,
        }
    }

    /// Stream the body from the socket, keeping the handler registered.
    #[must_use]
    pub const fn take_raw() -> Self {
        Self {
            action: FrameAction::TakeRaw,
            remove_handler: false,
        }
    }

    /// Stream the body from the socket and drop the handler afterwards.
    #[must_use]
    pub const fn take_raw_final() -> Self {
        Self {
            action: FrameAction::TakeRaw,
            remove_handler: true,
        }
    }
}

/// Out-of-band condition on the stream carrying the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// The stream (re)connected and can accept traffic.
    ReadyToSend,
    /// The connection dropped; in-flight requests are in doubt.
    Broken,
    /// The stream failed permanently.
    FatalError,
    /// The timer wheel passed the request deadline.
    Timeout,
}

/// What the dispatch table should do with the handler after a stream
/// event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamAction {
    /// Keep the handler registered.
    None,
    /// Drop the handler from the dispatch table.
    RemoveHandler,
}

/// The inbound interface a request handler exposes to the connection
/// layer. Calls for one handler are serialised by the caller.
pub trait MessageHandler: Send {
    /// Inspect an arriving frame header and decide what to do with it.
    fn examine(&mut self, msg: &Message) -> ExamineResult;

    /// Consume a frame whose body is already buffered (or whose raw body
    /// finished streaming).
    fn process(&mut self, msg: Message);

    /// Stream the current frame's body directly from the socket.
    ///
    /// # Errors
    ///
    /// Only socket-level failures are surfaced here.
    fn read_message_body(
        &mut self,
        msg: &Message,
        socket: &mut dyn SocketRead,
        bytes_read: &mut u32,
    ) -> io::Result<RawStep>;

    /// Stream the request body directly to the socket; only called when
    /// [`is_raw`](Self::is_raw) reports true.
    ///
    /// # Errors
    ///
    /// Only socket-level failures are surfaced here.
    fn write_message_body(
        &mut self,
        socket: &mut dyn SocketWrite,
        bytes_written: &mut u32,
    ) -> io::Result<RawStep>;

    /// React to a stream-level event.
    fn on_stream_event(&mut self, event: StreamEvent, status: Status) -> StreamAction;

    /// The outbound message has left the socket (or failed to).
    fn on_status_ready(&mut self, msg: &Message, status: Status);

    /// Whether the request body is streamed raw rather than sent from the
    /// frame buffer.
    fn is_raw(&self) -> bool;

    /// Stream id the handler is listening on, when one is bound.
    fn sid(&self) -> Option<StreamId>;
}

/// Shared, serialised handle to a handler, as stored in dispatch tables
/// and captured by deferred tasks.
pub type SharedHandler = Arc<Mutex<dyn MessageHandler>>;

/// The connection pool and transport: frames go out through it, incoming
/// frames are routed back to the registered handler.
pub trait Postmaster: Send + Sync {
    /// Frame and transmit `msg` to `url`, registering `handler` under the
    /// message's stream id until it is removed or redirected.
    ///
    /// The call may arrive while the handler's own lock is held (the
    /// handler resends from inside its frame processing), so the
    /// implementation must only queue work here and never call back into
    /// `handler` synchronously.
    ///
    /// # Errors
    ///
    /// Returns a status describing why the message could not be queued.
    fn send(
        &self,
        url: &Url,
        msg: &Message,
        handler: &SharedHandler,
        stateful: bool,
        expires: Instant,
    ) -> Result<(), Status>;

    /// Route `msg` through a virtual redirector instead of a socket; the
    /// redirector answers with a redirect frame naming a concrete replica.
    ///
    /// # Errors
    ///
    /// Returns a status describing why the message could not be routed.
    fn redirect(&self, url: &Url, msg: &Message, handler: &SharedHandler) -> Result<(), Status>;

    /// The stream-id allocator of the connection serving `url`.
    fn sid_manager(&self, url: &Url) -> Arc<SidManager>;
}

/// Deferred wake-up service for server-directed waits.
pub trait WaitScheduler: Send + Sync {
    /// Arrange for `task` to fire after `delay`.
    fn schedule(&self, delay: Duration, task: WaitTask);
}

/// A pending wake-up holding a counted reference to its handler; firing
/// against a handler that already terminated is a no-op.
pub struct WaitTask {
    handler_ref: Arc<HandlerRef>,
}

impl WaitTask {
    /// Capture a reference for a deferred wake-up.
    #[must_use]
    pub fn new(handler_ref: Arc<HandlerRef>) -> Self { Self { handler_ref } }

    /// Fire the wake-up. Returns whether a live handler was reached.
    pub fn run(self, now: Instant) -> bool { self.handler_ref.wait_done(now) }
}

/// Executor that moves the user callback off the I/O thread.
pub trait CallbackRunner: Send + Sync {
    /// Run `job` on a worker.
    fn run(&self, job: Box<dyn FnOnce() + Send>);
}

/// Executes a request against a local file when a redirect names a
/// `file://` target.
pub trait LocalFileHandler: Send + Sync {
    /// Perform the request locally, producing the terminal outcome.
    fn execute(&self, request: &Message, url: &Url) -> (Status, Option<ResponseBody>);
}

/// Registry of virtual (metalink) locations and their replicas.
pub trait Redirector: Send + Sync {
    /// Note a virtual location so its replicas can be resolved later.
    ///
    /// # Errors
    ///
    /// Returns a status when the location cannot be registered.
    fn register(&self, url: &Url) -> Result<(), Status>;

    /// Whether `url` is a virtual location handled by this registry.
    fn is_virtual(&self, url: &Url) -> bool;

    /// The next untried concrete replica for a virtual location.
    fn next_replica(&self, url: &Url) -> Option<Url>;
}

/// Terminal sink for the request outcome; consumed on delivery, which
/// makes a second delivery unrepresentable.
pub trait ResponseHandler: Send {
    /// Receive the final status, the typed response (when the operation
    /// produces one) and the endpoints visited.
    fn on_response(self: Box<Self>, status: Status, response: Option<ResponseBody>, hosts: HostList);
}

/// Everything a request handler needs from its surroundings.
#[derive(Clone)]
pub struct HandlerContext {
    /// Connection pool and transport.
    pub postmaster: Arc<dyn Postmaster>,
    /// Timer service for server-directed waits.
    pub scheduler: Arc<dyn WaitScheduler>,
    /// Worker executor for user callbacks.
    pub runner: Arc<dyn CallbackRunner>,
    /// Local execution for `file://` redirects, when installed.
    pub local_files: Option<Arc<dyn LocalFileHandler>>,
    /// Metalink registry, when installed.
    pub redirector: Option<Arc<dyn Redirector>>,
    /// Limits applied to the request.
    pub config: Config,
}
