//! The per-request state machine.
//!
//! A [`RequestHandler`] owns one outstanding request from the moment it is
//! handed to the connection layer until the response callback fires. It
//! classifies arriving frames, accumulates partial responses, streams raw
//! bodies, interprets server-directed redirects and waits, retries
//! recoverable failures at the load balancer, and enforces the wall-clock
//! deadline. The callback fires exactly once; afterwards the handler is
//! inert.
//!
//! The handler performs no I/O of its own. The connection layer calls in
//! through [`MessageHandler`](crate::postmaster::MessageHandler) from its
//! stream thread (calls for one handler are serialised), wait wake-ups
//! arrive through the [`HandlerRef`] cell, and the user callback is moved
//! to a worker through the injected
//! [`CallbackRunner`](crate::postmaster::CallbackRunner).

mod handler_ref;
pub mod raw;
pub mod redirect;

use std::{
    io,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

pub use handler_ref::HandlerRef;
use log::{debug, error, info, warn};
use raw::{OtherReader, PlainReader, RawReader, RawStep, SocketRead, SocketWrite, VectorReader};
use redirect::{parse_redirect_body, RedirectEntry, RedirectTraceBack, TriedCgi};

use crate::{
    chunk::{ChunkList, ChunkStatus},
    message::Message,
    postmaster::{
        ExamineResult,
        HandlerContext,
        HostInfo,
        HostList,
        MessageHandler,
        ResponseHandler,
        StreamAction,
        StreamEvent,
        WaitTask,
    },
    protocol::{crc, AttnCode, BodyReader, RequestCode, ResponseCode, ServerErrno, StatusFrame},
    response::{
        merge_response_bodies,
        parse_typed_response,
        unpack_readv_body,
        Buffer,
        ReadInfo,
        ResponseBody,
        VectorReadInfo,
    },
    sid::{SidManager, StreamId},
    status::{Status, StatusCode},
    url::Url,
};

/// Lifecycle phase of a handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HandlerState {
    /// The request is with the connection layer; frames may arrive.
    InFlight,
    /// A server-directed wait is pending; nothing is on the wire.
    Waiting,
    /// The callback fired (or is queued); the handler is inert.
    Terminal,
}

/// Drives a single request through its full lifecycle.
///
/// Construction wires in the collaborators and the marshalled request;
/// the setters mirror the send-parameter surface of the dispatch layer.
/// Once [`into_shared`](Self::into_shared) hands the handler to the
/// connection layer, all further interaction happens through the
/// [`MessageHandler`] methods and the wait-task cell.
pub struct RequestHandler {
    ctx: HandlerContext,
    request: Message,
    url: Url,
    user_handler: Option<Box<dyn ResponseHandler>>,

    sid_mgr: Arc<SidManager>,
    sid: Option<StreamId>,

    response: Option<Message>,
    partials: Vec<Message>,

    hosts: HostList,
    load_balancer: Option<HostInfo>,
    tried: TriedCgi,
    trace: RedirectTraceBack,

    chunk_list: Option<ChunkList>,
    chunk_status: Vec<ChunkStatus>,
    raw_reader: Option<RawReader>,
    raw_writer: Option<raw::RawWriter>,
    raw_write: bool,
    /// Body collected by an internal-buffer raw read, waiting to be
    /// attached to its header frame in `process`.
    pending_raw_body: Option<Vec<u8>>,
    /// Cursor for buffered (non-raw) contiguous reads.
    read_cursor: usize,
    read_delivered: u32,

    expiration: Instant,
    redirect_counter: u16,
    redirect_as_answer: bool,
    follow_metalink: bool,
    stateful: bool,
    session_bound: bool,
    aggregated_wait: Duration,

    /// Body checksum and length announced by a status sub-frame.
    announced: Option<StatusFrame>,
    /// Running checksum over buffered body bytes, kept frame by frame.
    body_crc: u32,
    status_frame_seen: bool,

    msg_in_fly: bool,
    response_ready: bool,
    state: HandlerState,

    handler_ref: Arc<HandlerRef>,
    /// Terminal outcome parked until the in-fly gate opens.
    parked_outcome: Option<Status>,
}

impl RequestHandler {
    /// Create a handler for `request`, to be answered through
    /// `user_handler`. The stream id is expected to be stamped already;
    /// [`bind_sid`](Self::bind_sid) records it together with the
    /// allocator that issued it.
    #[must_use]
    pub fn new(
        ctx: HandlerContext,
        request: Message,
        user_handler: Box<dyn ResponseHandler>,
        url: Url,
    ) -> Self {
        let sid_mgr = ctx.postmaster.sid_manager(&url);
        let session_bound = request.session_id().is_some();
        let redirect_counter = ctx.config.redirect_limit;
        let expiration = Instant::now() + ctx.config.request_timeout;
        Self {
            ctx,
            request,
            url,
            user_handler: Some(user_handler),
            sid_mgr,
            sid: None,
            response: None,
            partials: Vec::new(),
            hosts: Vec::new(),
            load_balancer: None,
            tried: TriedCgi::default(),
            trace: RedirectTraceBack::default(),
            chunk_list: None,
            chunk_status: Vec::new(),
            raw_reader: None,
            raw_writer: None,
            raw_write: false,
            pending_raw_body: None,
            read_cursor: 0,
            read_delivered: 0,
            expiration,
            redirect_counter,
            redirect_as_answer: false,
            follow_metalink: false,
            stateful: false,
            session_bound,
            aggregated_wait: Duration::ZERO,
            announced: None,
            body_crc: 0,
            status_frame_seen: false,
            msg_in_fly: false,
            response_ready: false,
            state: HandlerState::InFlight,
            handler_ref: HandlerRef::new(),
            parked_outcome: None,
        }
    }

    /// Set the deadline after which no further network activity starts.
    pub fn set_expiration(&mut self, expiration: Instant) { self.expiration = expiration; }

    /// Report redirects to the caller instead of following them.
    pub fn set_redirect_as_answer(&mut self, redirect_as_answer: bool) {
        self.redirect_as_answer = redirect_as_answer;
    }

    /// Attach the caller's scatter/gather chunks.
    pub fn set_chunk_list(&mut self, chunks: Option<ChunkList>) {
        self.chunk_status = chunks
            .as_ref()
            .map(|c| vec![ChunkStatus::default(); c.len()])
            .unwrap_or_default();
        self.chunk_list = chunks;
    }

    /// Override the redirect budget.
    pub fn set_redirect_counter(&mut self, counter: u16) { self.redirect_counter = counter; }

    /// Mark the first endpoint as load balancer up front.
    pub fn set_load_balancer(&mut self, host: HostInfo) { self.load_balancer = Some(host); }

    /// Seed the visited-host list (normally just the origin).
    pub fn set_host_list(&mut self, hosts: HostList) { self.hosts = hosts; }

    /// Enable reconnect semantics for session-bound operations.
    pub fn set_stateful(&mut self, stateful: bool) { self.stateful = stateful; }

    /// Resolve virtual redirect targets through the metalink registry.
    pub fn set_follow_metalink(&mut self, follow: bool) { self.follow_metalink = follow; }

    /// Stream the request body from the chunk list instead of the frame
    /// buffer (large writes).
    pub fn set_raw_write(&mut self, raw: bool) { self.raw_write = raw; }

    /// Record the allocated stream id and its issuing pool.
    pub fn bind_sid(&mut self, sid: StreamId, sid_mgr: Arc<SidManager>) {
        self.sid = Some(sid);
        self.sid_mgr = sid_mgr;
    }

    /// Note that the request was handed to the connection layer.
    pub fn mark_in_fly(&mut self) { self.msg_in_fly = true; }

    /// The deadline in force.
    #[must_use]
    pub const fn expiration(&self) -> Instant { self.expiration }

    /// The cell deferred wake-ups go through.
    #[must_use]
    pub fn handler_ref(&self) -> Arc<HandlerRef> { Arc::clone(&self.handler_ref) }

    /// Bytes of the (possibly rewritten) request frame.
    #[must_use]
    pub fn request_bytes(&self) -> &[u8] { self.request.bytes() }

    /// Forget the callback and the stream id. Used when the initial
    /// hand-off failed and the caller receives the error synchronously;
    /// the id has already been rolled back by the dispatcher.
    pub fn disarm(&mut self) {
        self.user_handler = None;
        self.sid = None;
        self.state = HandlerState::Terminal;
        self.handler_ref.invalidate();
    }

    /// Endpoints visited so far.
    #[must_use]
    pub fn hosts(&self) -> &HostList { &self.hosts }

    /// Wrap the handler for sharing with the connection layer and bind
    /// the wait-task cell to the shared instance.
    #[must_use]
    pub fn into_shared(self) -> Arc<Mutex<RequestHandler>> {
        let handler_ref = Arc::clone(&self.handler_ref);
        let shared = Arc::new(Mutex::new(self));
        handler_ref.bind(&shared);
        shared
    }

    /// Deliver a frame with an explicit clock reading; see
    /// [`MessageHandler::process`].
    pub fn process_at(&mut self, msg: Message, now: Instant) {
        if self.state == HandlerState::Terminal {
            debug!("frame after terminal state dropped: request={}", self.request.description());
            return;
        }
        let Ok(header) = msg.response_header() else {
            self.terminate(Status::error(StatusCode::InvalidResponse, "malformed response header"));
            return;
        };
        let Some(code) = ResponseCode::from_wire(header.status) else {
            self.terminate(Status::error(
                StatusCode::InvalidResponse,
                format!("unknown response status {}", header.status),
            ));
            return;
        };
        // Data transfers stream into caller chunks; everything else ends
        // up buffered and is subject to the negotiated body cap.
        let is_data = matches!(
            self.request.request_code(),
            Some(RequestCode::Read | RequestCode::ReadV)
        );
        if !is_data && header.dlen > self.ctx.config.max_raw_buffer {
            self.terminate(Status::error(
                StatusCode::InvalidResponse,
                format!("response body of {} bytes exceeds the negotiated cap", header.dlen),
            ));
            return;
        }
        match code {
            ResponseCode::OkSoFar => self.absorb_partial(msg),
            ResponseCode::Ok => self.absorb_final(msg),
            ResponseCode::AuthMore => self.absorb_final(msg),
            ResponseCode::Status => self.absorb_status_frame(&msg),
            ResponseCode::Error => self.handle_error_response(&msg, now),
            ResponseCode::Redirect => self.handle_redirect(&msg, now),
            ResponseCode::Wait => self.handle_wait(&msg, now),
            ResponseCode::WaitResp => {
                debug!(
                    "server deferred the response: request={}, sid={:?}",
                    self.request.description(),
                    self.sid
                );
            }
            ResponseCode::Attn => self.handle_attn(msg, now),
        }
    }

    /// Called by the wait-task cell when a scheduled wait elapses.
    pub fn wait_done(&mut self, now: Instant) {
        if self.state != HandlerState::Waiting {
            return;
        }
        if now >= self.expiration {
            self.terminate(Status::error(StatusCode::OperationExpired, "deadline passed during wait"));
            return;
        }
        // Some operations must be refreshed before a resend or the server
        // keeps answering from the same stale state.
        self.request.switch_on_refresh_flag();
        self.state = HandlerState::InFlight;
        debug!("wait elapsed, resending: request={}", self.request.description());
        self.resend_to(self.url.clone(), now);
    }

    fn absorb_partial(&mut self, mut msg: Message) {
        if let Some(body) = self.pending_raw_body.take() {
            msg.set_response_body(&body);
        }
        if self.status_frame_seen {
            warn!(
                "partial frame after status sub-frame: request={}",
                self.request.description()
            );
        }
        match self.request.request_code() {
            Some(RequestCode::Read) => self.absorb_buffered_read(&msg),
            Some(RequestCode::ReadV) => self.absorb_buffered_readv(&msg),
            _ => {
                self.body_crc = crc::crc32c_append(self.body_crc, msg.response_body());
            }
        }
        self.partials.push(msg);
    }

    fn absorb_final(&mut self, mut msg: Message) {
        if let Some(body) = self.pending_raw_body.take() {
            msg.set_response_body(&body);
        }
        match self.request.request_code() {
            Some(RequestCode::Read) => self.absorb_buffered_read(&msg),
            Some(RequestCode::ReadV) => self.absorb_buffered_readv(&msg),
            _ => {
                self.body_crc = crc::crc32c_append(self.body_crc, msg.response_body());
            }
        }
        self.response = Some(msg);
        self.response_ready = true;
        self.maybe_finalize();
    }

    /// Copy a buffered read body into the caller's chunk at the running
    /// offset. Raw reads bypass this; their bytes never enter the frame.
    fn absorb_buffered_read(&mut self, msg: &Message) {
        if matches!(self.raw_reader, Some(RawReader::Plain(_))) {
            return;
        }
        let body = msg.response_body();
        let Some(chunks) = self.chunk_list.as_mut() else {
            return;
        };
        let Some(chunk) = chunks.first_mut() else {
            return;
        };
        let space = chunk.data.len().saturating_sub(self.read_cursor);
        let take = body.len().min(space);
        chunk.data[self.read_cursor..self.read_cursor + take].copy_from_slice(&body[..take]);
        self.read_cursor += take;
        self.read_delivered += u32::try_from(take).unwrap_or(u32::MAX);
        if take < body.len() {
            warn!(
                "read reply overran the destination chunk: request={}, excess={}",
                self.request.description(),
                body.len() - take
            );
            if let Some(status) = self.chunk_status.first_mut() {
                status.size_error = true;
            }
        }
    }

    fn absorb_buffered_readv(&mut self, msg: &Message) {
        if matches!(self.raw_reader, Some(RawReader::Vector(_))) {
            return;
        }
        let Some(chunks) = self.chunk_list.as_mut() else {
            return;
        };
        match unpack_readv_body(msg.response_body(), chunks, &mut self.chunk_status) {
            Ok(delivered) => self.read_delivered += delivered,
            Err(e) => {
                self.terminate(Status::error(
                    StatusCode::InvalidResponse,
                    format!("malformed vector-read body: {e}"),
                ));
            }
        }
    }

    fn absorb_status_frame(&mut self, msg: &Message) {
        match StatusFrame::parse(msg.response_body()) {
            Ok(frame) => {
                if Some(frame.stream_id) != self.sid {
                    self.terminate(Status::error(
                        StatusCode::InvalidResponse,
                        "status sub-frame names a foreign stream",
                    ));
                    return;
                }
                self.announced = Some(frame);
                self.status_frame_seen = true;
            }
            Err(e) => {
                self.terminate(Status::error(
                    StatusCode::InvalidResponse,
                    format!("bad status sub-frame: {e}"),
                ));
            }
        }
    }

    fn handle_attn(&mut self, msg: Message, now: Instant) {
        let body = msg.response_body();
        let mut reader = BodyReader::new(body);
        let Ok(actnum) = reader.get_u32() else {
            self.terminate(Status::error(StatusCode::InvalidResponse, "truncated attention frame"));
            return;
        };
        match AttnCode::from_wire(actnum) {
            Some(AttnCode::Response) => {
                // Skip the reserved word, then the embedded frame is a
                // complete response of its own.
                if reader.get_u32().is_err() {
                    self.terminate(Status::error(
                        StatusCode::InvalidResponse,
                        "truncated embedded response",
                    ));
                    return;
                }
                let embedded = Message::from_bytes(&body[8..]);
                match embedded.response_header() {
                    Ok(header) if Some(header.stream_id) == self.sid => {
                        self.process_at(embedded, now);
                    }
                    _ => debug!(
                        "embedded response for a foreign stream ignored: sid={:?}",
                        self.sid
                    ),
                }
            }
            Some(AttnCode::Redirect) => self.handle_redirect(&msg_with_body(&body[4..]), now),
            Some(AttnCode::Abort) => {
                self.terminate(Status::error(
                    StatusCode::ErrorResponse,
                    "server aborted the request",
                ));
            }
            Some(AttnCode::Wait) => self.handle_wait(&msg_with_body(&body[4..]), now),
            Some(AttnCode::Disconnect | AttnCode::Message) | None => {
                debug!("connection-level attention left to the connection layer: actnum={actnum}");
            }
        }
    }

    fn handle_error_response(&mut self, msg: &Message, now: Instant) {
        let mut reader = BodyReader::new(msg.response_body());
        let errno = reader.get_u32().unwrap_or(0);
        let message = reader.get_cstr().unwrap_or("").to_owned();
        let errno = ServerErrno::from_wire(errno);
        debug!(
            "server error: request={}, errno={errno:?}, message={message}",
            self.request.description()
        );

        let Some(errno) = errno else {
            self.terminate(Status::error(StatusCode::ErrorResponse, message));
            return;
        };
        if self.recoverable_at_balancer(errno) && self.is_retryable() {
            let target = self
                .load_balancer
                .as_ref()
                .map(|h| h.url.clone())
                .unwrap_or_else(|| self.url.clone());
            self.tried
                .record(&self.url.host_id(), errno.tried_mnemonic());
            self.trace.push(RedirectEntry {
                from: self.url.clone(),
                to: target.clone(),
                status: Status::server_error(errno, message),
            });
            self.retry_at(target, now);
            return;
        }
        self.terminate(Status::server_error(errno, message));
    }

    /// Recoverable server errors feed the tried-CGI loop and go back to
    /// the load balancer.
    fn recoverable_at_balancer(&self, errno: ServerErrno) -> bool {
        match errno {
            ServerErrno::ServerError | ServerErrno::NoMemory => true,
            ServerErrno::IoError => self
                .request
                .request_code()
                .is_some_and(RequestCode::is_idempotent),
            ServerErrno::NotFound => self
                .load_balancer
                .as_ref()
                .is_some_and(|lb| lb.url.host_id() != self.url.host_id()),
            _ => false,
        }
    }

    /// Whether this request may be reissued at all.
    fn is_retryable(&self) -> bool {
        if self.session_bound {
            // Operations bound to an open file survive a retry only when
            // the caller enabled reconnect semantics.
            return self.stateful;
        }
        self.request
            .request_code()
            .is_some_and(RequestCode::is_idempotent)
    }

    fn handle_redirect(&mut self, msg: &Message, now: Instant) {
        if self.redirect_counter == 0 {
            self.terminate(Status::error(
                StatusCode::RedirectLimitReached,
                "redirect limit reached",
            ));
            return;
        }
        self.redirect_counter -= 1;

        let Some(mut target) = parse_redirect_body(msg.response_body(), &self.url) else {
            self.terminate(Status::error(StatusCode::InvalidRedirect, "unusable redirect target"));
            return;
        };

        // A virtual target resolves to its next concrete replica.
        if self.follow_metalink {
            if let Some(redirector) = self.ctx.redirector.as_ref() {
                if redirector.is_virtual(&target.url) {
                    match redirector.next_replica(&target.url) {
                        Some(replica) => {
                            debug!(
                                "virtual target resolved: virtual={}, replica={}",
                                target.url,
                                replica
                            );
                            target.url = replica;
                        }
                        None => {
                            self.terminate(Status::error(
                                StatusCode::InvalidRedirect,
                                "virtual target has no replicas left",
                            ));
                            return;
                        }
                    }
                }
            }
        }

        info!(
            "redirected: request={}, from={}, to={}",
            self.request.description(),
            self.url.host_id(),
            target.url.host_id()
        );

        if self.redirect_as_answer {
            let mut answer = target.url.clone();
            if let Some(path) = &target.path {
                answer.set_path(path);
            }
            answer.merge_params(&target.cgi, true);
            self.release_sid();
            self.deliver(Status::ok(), Some(ResponseBody::Redirect(answer)));
            return;
        }

        self.trace.push(RedirectEntry {
            from: self.url.clone(),
            to: target.url.clone(),
            status: Status::ok(),
        });

        // The origin becomes the load balancer on the first hop.
        if self.load_balancer.is_none() {
            if let Some(origin) = self.hosts.first_mut() {
                origin.load_balancer = true;
                self.load_balancer = Some(origin.clone());
            }
        }

        if target.url.is_local_file() {
            self.handle_local_redirect(&target.url);
            return;
        }

        self.hosts.push(HostInfo::new(target.url.clone()));
        self.tried.record(&self.url.host_id(), None);
        self.request
            .rewrite_path_and_cgi(&target.cgi, true, target.path.as_deref());
        self.rewrite_tried_cgi(&target.url);
        self.release_sid();
        self.url = target.url.clone();
        self.sid_mgr = self.ctx.postmaster.sid_manager(&self.url);
        self.send_current(now);
    }

    /// Execute the request against a local file and inject the result as
    /// the terminal response.
    fn handle_local_redirect(&mut self, target: &Url) {
        self.hosts.push(HostInfo::new(target.clone()));
        self.release_sid();
        let Some(local) = self.ctx.local_files.as_ref() else {
            self.terminate(Status::error(
                StatusCode::NotSupported,
                "redirected to a local file but no local handler is installed",
            ));
            return;
        };
        info!("executing locally: request={}, target={target}", self.request.description());
        let (status, body) = local.execute(&self.request, target);
        self.deliver(status, body);
    }

    fn handle_wait(&mut self, msg: &Message, now: Instant) {
        let mut reader = BodyReader::new(msg.response_body());
        let seconds = reader.get_u32().unwrap_or(0);
        let reason = reader.get_cstr().unwrap_or("").to_owned();

        let remaining = whole_seconds_left(self.expiration, now);
        if remaining.is_zero() {
            self.terminate(Status::error(
                StatusCode::OperationExpired,
                "deadline passed before the requested wait",
            ));
            return;
        }

        let mut delay = Duration::from_secs(u64::from(seconds.max(1))).min(remaining);

        // Once the aggregated wait crosses the threshold, cap further
        // waits to what is left of it; with a metalink replica available
        // an idempotent request skips the wait entirely.
        let threshold = self.ctx.config.wait_threshold;
        if self.aggregated_wait + delay > threshold {
            if self.follow_metalink && self.is_retryable() {
                if let Some(replica) = self
                    .ctx
                    .redirector
                    .as_ref()
                    .and_then(|r| r.next_replica(&self.url))
                {
                    info!(
                        "skipping a long wait in favour of a replica: request={}, replica={replica}",
                        self.request.description()
                    );
                    self.tried.record(&self.url.host_id(), None);
                    self.retry_at(replica, now);
                    return;
                }
            }
            delay = delay.min(threshold.saturating_sub(self.aggregated_wait).max(Duration::from_secs(1)));
        }

        info!(
            "server asked us to wait: request={}, seconds={}, granted={}s, reason={reason}",
            self.request.description(),
            seconds,
            delay.as_secs()
        );
        self.aggregated_wait += delay;
        self.state = HandlerState::Waiting;
        self.ctx
            .scheduler
            .schedule(delay, WaitTask::new(self.handler_ref()));
    }

    /// Stamp the accumulated tried/triedrc keys into the request CGI.
    fn rewrite_tried_cgi(&mut self, next_target: &Url) {
        if self.tried.is_empty() {
            return;
        }
        let params = self.tried.to_params(Some(&next_target.host_id()));
        if !params.is_empty() {
            self.request.rewrite_path_and_cgi(&params, true, None);
        }
    }

    /// Reissue the request at `target` after a failure there or here.
    fn retry_at(&mut self, target: Url, now: Instant) {
        self.hosts.push(HostInfo::new(target.clone()));
        self.rewrite_tried_cgi(&target);
        self.release_sid();
        self.url = target;
        self.sid_mgr = self.ctx.postmaster.sid_manager(&self.url);
        self.state = HandlerState::InFlight;
        self.send_current(now);
    }

    /// Resend to `target` without recording a new visit (wait resends).
    fn resend_to(&mut self, target: Url, now: Instant) {
        self.url = target;
        self.send_current(now);
    }

    /// Allocate a stream id if needed, stamp it, and hand the request to
    /// the connection layer.
    fn send_current(&mut self, now: Instant) {
        if now >= self.expiration {
            self.terminate(Status::error(StatusCode::OperationExpired, "deadline passed"));
            return;
        }
        if self.sid.is_none() {
            match self.sid_mgr.allocate() {
                Ok(sid) => self.sid = Some(sid),
                Err(e) => {
                    self.terminate(Status::error(StatusCode::Internal, e.to_string()));
                    return;
                }
            }
        }
        if let Some(sid) = self.sid {
            self.request.set_stream_id(sid);
        }
        // Fresh attempt: any previously collected partial state belongs
        // to the endpoint we just left.
        self.partials.clear();
        self.response = None;
        self.response_ready = false;
        self.raw_reader = None;
        self.pending_raw_body = None;
        self.announced = None;
        self.status_frame_seen = false;
        self.body_crc = 0;
        self.read_cursor = 0;
        self.read_delivered = 0;
        self.chunk_status.fill(ChunkStatus::default());

        let shared = match self.handler_ref.shared_handler() {
            Some(shared) => shared,
            None => {
                self.terminate(Status::error(
                    StatusCode::Internal,
                    "handler is not shared; nothing can route frames back",
                ));
                return;
            }
        };
        debug!(
            "sending: request={}, target={}, sid={:?}",
            self.request.description(),
            self.url.host_id(),
            self.sid
        );
        match self.ctx.postmaster.send(
            &self.url,
            &self.request,
            &shared,
            self.stateful,
            self.expiration,
        ) {
            Ok(()) => self.msg_in_fly = true,
            Err(status) => {
                warn!(
                    "send failed: request={}, target={}, status={status}",
                    self.request.description(),
                    self.url.host_id()
                );
                // A failed retry does not spawn another retry; the
                // deadline is the only thing that could stop the loop.
                self.terminate(status);
            }
        }
    }

    /// Shared decision tree for stream events and failed sends.
    fn handle_transport_failure(&mut self, status: Status, now: Instant) {
        // A broken stream invalidates the id implicitly; quarantine it so
        // it cannot be handed out while the old server may still answer.
        if let Some(sid) = self.sid.take() {
            let _ = self.sid_mgr.time_out(sid);
        }
        self.msg_in_fly = false;
        if let Some(parked) = self.parked_outcome.take() {
            self.deliver(parked, None);
            return;
        }
        if self.is_retryable() {
            let target = self
                .load_balancer
                .as_ref()
                .map(|h| h.url.clone())
                .unwrap_or_else(|| self.url.clone());
            self.tried.record(&self.url.host_id(), None);
            self.trace.push(RedirectEntry {
                from: self.url.clone(),
                to: target.clone(),
                status: status.clone(),
            });
            self.retry_at(target, now);
            return;
        }
        self.terminate(status);
    }

    /// Finalize when both gates are open: the final response arrived and
    /// the outbound message is confirmed off the socket.
    fn maybe_finalize(&mut self) {
        if self.response_ready && !self.msg_in_fly {
            self.finalize();
        }
    }

    fn finalize(&mut self) {
        let Some(final_msg) = self.response.take() else {
            self.terminate(Status::error(StatusCode::Internal, "finalize without a response"));
            return;
        };
        let merged = merge_response_bodies(&self.partials, &final_msg);

        // Verify the announced checksum over everything that was buffered.
        if let Some(announced) = self.announced {
            let is_buffered = !matches!(
                self.raw_reader,
                Some(RawReader::Plain(_) | RawReader::Vector(_))
            );
            if is_buffered && announced.body_crc32c != self.body_crc {
                self.terminate(Status::error(
                    StatusCode::InvalidResponse,
                    format!(
                        "body checksum mismatch: announced {:#010x}, computed {:#010x}",
                        announced.body_crc32c, self.body_crc
                    ),
                ));
                return;
            }
        }

        let final_code = final_msg
            .response_header()
            .ok()
            .and_then(|h| ResponseCode::from_wire(h.status));

        let (status, body) = match self.request.request_code() {
            Some(RequestCode::Read) => self.finish_read(),
            Some(RequestCode::ReadV) => self.finish_readv(),
            _ if final_code == Some(ResponseCode::AuthMore) => {
                (Status::ok(), Some(ResponseBody::Buffer(Buffer(merged))))
            }
            _ => match parse_typed_response(&self.request, &merged) {
                Ok(body) => (Status::ok(), body),
                Err(e) => (
                    Status::error(StatusCode::InvalidResponse, format!("undecodable response: {e}")),
                    None,
                ),
            },
        };
        self.release_sid();
        self.deliver(status, body);
    }

    fn finish_read(&mut self) -> (Status, Option<ResponseBody>) {
        let delivered = match &self.raw_reader {
            Some(RawReader::Plain(reader)) => {
                u32::try_from(reader.bytes_delivered()).unwrap_or(u32::MAX)
            }
            _ => self.read_delivered,
        };
        let overflowed = match &self.raw_reader {
            Some(RawReader::Plain(reader)) => reader.overflowed(),
            _ => self.chunk_status.first().is_some_and(|s| s.size_error),
        };
        let Some(mut chunks) = self.chunk_list.take() else {
            return (
                Status::error(StatusCode::Internal, "read completed without a chunk list"),
                None,
            );
        };
        let chunk = chunks.swap_remove(0);
        let status = if overflowed { Status::partial() } else { Status::ok() };
        (
            status,
            Some(ResponseBody::Read(ReadInfo {
                chunk,
                bytes_read: delivered,
            })),
        )
    }

    fn finish_readv(&mut self) -> (Status, Option<ResponseBody>) {
        let delivered = match &self.raw_reader {
            Some(RawReader::Vector(reader)) => reader.bytes_delivered(),
            _ => self.read_delivered,
        };
        let Some(chunks) = self.chunk_list.take() else {
            return (
                Status::error(StatusCode::Internal, "vector read completed without a chunk list"),
                None,
            );
        };
        let statuses = std::mem::take(&mut self.chunk_status);
        let complete = statuses.iter().all(|s| s.done && !s.size_error);
        let info = VectorReadInfo {
            size: delivered,
            chunks,
            statuses,
        };
        let status = if complete { Status::ok() } else { Status::partial() };
        (status, Some(ResponseBody::VectorRead(info)))
    }

    /// Terminal funnel for failures; respects the in-fly gate so the
    /// connection layer is never surprised by a vanished handler.
    fn terminate(&mut self, status: Status) {
        if self.state == HandlerState::Terminal {
            return;
        }
        if self.msg_in_fly {
            self.parked_outcome = Some(status);
            return;
        }
        self.release_sid();
        self.deliver(status, None);
    }

    /// Hand the outcome to the user exactly once, off the stream thread.
    fn deliver(&mut self, status: Status, body: Option<ResponseBody>) {
        let Some(user_handler) = self.user_handler.take() else {
            error!(
                "second terminal outcome suppressed: request={}, status={status}",
                self.request.description()
            );
            return;
        };
        self.state = HandlerState::Terminal;
        self.handler_ref.invalidate();
        if !status.is_ok() && !self.trace.is_empty() {
            info!(
                "request failed after {} hops: request={}, trace: {}",
                self.trace.len(),
                self.request.description(),
                self.trace
            );
        }
        debug!(
            "completing: request={}, status={status}",
            self.request.description()
        );
        let hosts = std::mem::take(&mut self.hosts);
        self.ctx.runner.run(Box::new(move || {
            user_handler.on_response(status, body, hosts);
        }));
    }

    fn release_sid(&mut self) {
        if let Some(sid) = self.sid.take() {
            if let Err(e) = self.sid_mgr.release(sid) {
                debug!("stream id release skipped: sid={sid}, reason={e}");
            }
        }
    }
}

impl MessageHandler for RequestHandler {
    fn examine(&mut self, msg: &Message) -> ExamineResult {
        let Ok(header) = msg.response_header() else {
            return ExamineResult::ignore();
        };
        let Some(code) = ResponseCode::from_wire(header.status) else {
            // Ours by stream id, undecodable by status word; take it so
            // process can fail the request.
            return if Some(header.stream_id) == self.sid {
                ExamineResult::take_final()
            } else {
                ExamineResult::ignore()
            };
        };

        if code == ResponseCode::Attn {
            return self.examine_attn(msg);
        }
        if Some(header.stream_id) != self.sid {
            return ExamineResult::ignore();
        }

        match code {
            ResponseCode::OkSoFar => {
                if self.wants_raw_body(header.dlen) {
                    self.arm_raw_reader(header.dlen);
                    ExamineResult::take_raw()
                } else {
                    ExamineResult::take()
                }
            }
            ResponseCode::Ok => {
                if self.wants_raw_body(header.dlen) {
                    self.arm_raw_reader(header.dlen);
                    ExamineResult::take_raw_final()
                } else {
                    ExamineResult::take_final()
                }
            }
            ResponseCode::Status | ResponseCode::WaitResp => ExamineResult::take(),
            ResponseCode::Error
            | ResponseCode::Redirect
            | ResponseCode::Wait
            | ResponseCode::AuthMore => ExamineResult::take_final(),
            ResponseCode::Attn => ExamineResult::ignore(),
        }
    }

    fn process(&mut self, msg: Message) { self.process_at(msg, Instant::now()); }

    fn read_message_body(
        &mut self,
        msg: &Message,
        socket: &mut dyn SocketRead,
        bytes_read: &mut u32,
    ) -> io::Result<RawStep> {
        let _ = msg;
        let step = match self.raw_reader.as_mut() {
            Some(RawReader::Plain(reader)) => {
                let Some(chunk) = self.chunk_list.as_mut().and_then(|c| c.first_mut()) else {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "raw read without a destination chunk",
                    ));
                };
                reader.step(socket, &mut chunk.data, bytes_read)?
            }
            Some(RawReader::Vector(reader)) => {
                let Some(chunks) = self.chunk_list.as_mut() else {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "raw vector read without a chunk list",
                    ));
                };
                reader.step(socket, chunks, &mut self.chunk_status, bytes_read)?
            }
            Some(RawReader::Other(reader)) => {
                let step = reader.step(socket, bytes_read)?;
                if step == RawStep::Done {
                    if let Some(RawReader::Other(reader)) = self.raw_reader.take() {
                        self.pending_raw_body = Some(reader.into_body());
                    }
                }
                step
            }
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "no raw read in progress",
                ));
            }
        };
        if step == RawStep::Done {
            if let Some(RawReader::Plain(reader)) = &self.raw_reader {
                if let Some(status) = self.chunk_status.first_mut() {
                    status.done = true;
                    status.size_error = reader.overflowed();
                }
            }
        }
        Ok(step)
    }

    fn write_message_body(
        &mut self,
        socket: &mut dyn SocketWrite,
        bytes_written: &mut u32,
    ) -> io::Result<RawStep> {
        let writer = self.raw_writer.get_or_insert_with(raw::RawWriter::new);
        let Some(chunks) = self.chunk_list.as_ref() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "raw write without a chunk list",
            ));
        };
        writer.step(socket, chunks, bytes_written)
    }

    fn on_stream_event(&mut self, event: StreamEvent, status: Status) -> StreamAction {
        if self.state == HandlerState::Terminal {
            return StreamAction::RemoveHandler;
        }
        match event {
            StreamEvent::ReadyToSend => StreamAction::None,
            StreamEvent::Timeout => {
                self.msg_in_fly = false;
                self.terminate(Status::error(StatusCode::OperationExpired, "deadline passed"));
                StreamAction::RemoveHandler
            }
            StreamEvent::Broken | StreamEvent::FatalError => {
                warn!(
                    "stream failed: request={}, event={event:?}, status={status}",
                    self.request.description()
                );
                let failure = if status.is_ok() {
                    Status::error(StatusCode::StreamBroken, "stream failed")
                } else {
                    status
                };
                self.handle_transport_failure(failure, Instant::now());
                StreamAction::RemoveHandler
            }
        }
    }

    fn on_status_ready(&mut self, msg: &Message, status: Status) {
        let _ = msg;
        if status.is_ok() {
            self.msg_in_fly = false;
            if let Some(parked) = self.parked_outcome.take() {
                self.release_sid();
                self.deliver(parked, None);
                return;
            }
            self.maybe_finalize();
            return;
        }
        warn!(
            "outbound message failed: request={}, status={status}",
            self.request.description()
        );
        self.handle_transport_failure(status, Instant::now());
    }

    fn is_raw(&self) -> bool {
        self.raw_write && self.request.request_code() == Some(RequestCode::Write)
    }

    fn sid(&self) -> Option<StreamId> { self.sid }
}

impl RequestHandler {
    fn examine_attn(&mut self, msg: &Message) -> ExamineResult {
        let body = msg.response_body();
        let mut reader = BodyReader::new(body);
        let Ok(actnum) = reader.get_u32() else {
            return ExamineResult::ignore();
        };
        match AttnCode::from_wire(actnum) {
            Some(AttnCode::Response) => {
                // Ours only when the embedded frame names our stream.
                let embedded_sid = body
                    .get(8..16)
                    .and_then(|b| Message::from_bytes(b).response_header().ok())
                    .map(|h| h.stream_id);
                if embedded_sid == self.sid {
                    ExamineResult::take_final()
                } else {
                    ExamineResult::ignore()
                }
            }
            Some(AttnCode::Redirect | AttnCode::Wait | AttnCode::Abort) => ExamineResult::take(),
            Some(AttnCode::Disconnect | AttnCode::Message) | None => ExamineResult::ignore(),
        }
    }

    /// Raw streaming applies to data transfers and to oversized frames.
    fn wants_raw_body(&self, dlen: u32) -> bool {
        match self.request.request_code() {
            Some(RequestCode::Read | RequestCode::ReadV) => {
                dlen > 0 && self.chunk_list.is_some()
            }
            _ => dlen > self.ctx.config.raw_threshold && dlen <= self.ctx.config.max_raw_buffer,
        }
    }

    fn arm_raw_reader(&mut self, dlen: u32) {
        match self.request.request_code() {
            Some(RequestCode::Read) => {
                if !matches!(self.raw_reader, Some(RawReader::Plain(_))) {
                    self.raw_reader = Some(RawReader::Plain(PlainReader::new()));
                }
                if let Some(RawReader::Plain(reader)) = self.raw_reader.as_mut() {
                    reader.begin_frame(dlen);
                }
            }
            Some(RequestCode::ReadV) => {
                if !matches!(self.raw_reader, Some(RawReader::Vector(_))) {
                    self.raw_reader = Some(RawReader::Vector(VectorReader::new()));
                }
                if let Some(RawReader::Vector(reader)) = self.raw_reader.as_mut() {
                    reader.begin_frame(dlen);
                }
            }
            _ => {
                self.raw_reader = Some(RawReader::Other(OtherReader::new(dlen)));
            }
        }
    }
}

impl Drop for RequestHandler {
    fn drop(&mut self) {
        self.handler_ref.invalidate();
        if !self.trace.is_empty() {
            debug!(
                "handler dropped: request={}, trace: {}",
                self.request.description(),
                self.trace
            );
        }
        // A session-bound request may still be answered through the
        // session; its id must survive the handler.
        if !self.session_bound {
            self.release_sid();
        }
    }
}

/// Wrap raw body bytes in a response-shaped frame so the redirect and
/// wait paths can parse attention payloads uniformly.
fn msg_with_body(body: &[u8]) -> Message {
    let mut frame = Vec::with_capacity(8 + body.len());
    frame.extend_from_slice(&[0, 0, 0, 0]);
    frame.extend_from_slice(&u32::try_from(body.len()).unwrap_or(u32::MAX).to_be_bytes());
    frame.extend_from_slice(body);
    Message::from_bytes(frame.as_slice())
}

fn whole_seconds_left(expiration: Instant, now: Instant) -> Duration {
    if now >= expiration {
        return Duration::ZERO;
    }
    // Round down to whole seconds; a sub-second remainder does not buy a
    // resend.
    Duration::from_secs(expiration.duration_since(now).as_secs())
}

#[cfg(test)]
#[path = "handler_tests.rs"]
mod tests;
