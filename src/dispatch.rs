//! Front door for sending a request through the handler machinery.
//!
//! Callers hand over a marshalled request, a callback and send
//! parameters; this layer allocates the stream id, applies defaults from
//! [`Config`](crate::config::Config), seeds the visited-host list, builds
//! the [`RequestHandler`] and gives the message to the postmaster. When
//! the hand-off fails, the stream id is rolled back and the error is
//! returned synchronously; the callback never fires for a request that
//! was never in flight.

use std::time::{Duration, Instant};

use log::{debug, error};

use crate::{
    chunk::ChunkList,
    handler::RequestHandler,
    message::Message,
    postmaster::{HandlerContext, HostInfo, ResponseHandler, SharedHandler},
    status::{Status, StatusCode},
    url::Url,
};

/// Per-request knobs accepted by [`send_request`]; unset fields fall back
/// to the context configuration.
#[derive(Default)]
pub struct SendParams {
    /// Wall-clock deadline; defaults to now plus the configured request
    /// timeout.
    pub expires: Option<Instant>,
    /// Explicit timeout overriding the configured one (ignored when
    /// `expires` is set).
    pub timeout: Option<Duration>,
    /// Redirect budget; defaults to the configured limit.
    pub redirect_limit: Option<u16>,
    /// Scatter/gather buffers for data transfers.
    pub chunk_list: Option<ChunkList>,
    /// Report redirects to the caller instead of following them.
    pub redirect_as_answer: bool,
    /// Enable reconnect semantics for session-bound operations.
    pub stateful: bool,
    /// Stream the request body raw from the chunk list (large writes).
    pub raw_write: bool,
    /// Pre-set load balancer, when the caller already knows it.
    pub load_balancer: Option<HostInfo>,
}

/// Send `request` to `url`, answering through `handler` exactly once.
///
/// # Errors
///
/// Returns the postmaster's status when the message could not be handed
/// over; in that case no callback will fire and the stream id has been
/// released.
pub fn send_request(
    ctx: &HandlerContext,
    url: &Url,
    request: Message,
    handler: Box<dyn ResponseHandler>,
    params: SendParams,
) -> Result<(), Status> {
    let sid_mgr = ctx.postmaster.sid_manager(url);
    let sid = sid_mgr
        .allocate()
        .map_err(|e| Status::error(StatusCode::Internal, e.to_string()))?;

    let mut request = request;
    request.set_stream_id(sid);
    debug!(
        "sending message: request={}, target={}, sid={sid}",
        request.description(),
        url.host_id()
    );

    let expires = params.expires.unwrap_or_else(|| {
        Instant::now() + params.timeout.unwrap_or(ctx.config.request_timeout)
    });

    let mut msg_handler = RequestHandler::new(ctx.clone(), request, handler, url.clone());
    msg_handler.bind_sid(sid, sid_mgr.clone());
    msg_handler.set_expiration(expires);
    msg_handler.set_redirect_counter(params.redirect_limit.unwrap_or(ctx.config.redirect_limit));
    msg_handler.set_redirect_as_answer(params.redirect_as_answer);
    msg_handler.set_chunk_list(params.chunk_list);
    msg_handler.set_stateful(params.stateful);
    msg_handler.set_raw_write(params.raw_write);
    if let Some(lb) = params.load_balancer {
        msg_handler.set_load_balancer(lb);
    }
    msg_handler.set_host_list(vec![HostInfo::new(url.clone())]);

    let stateful = params.stateful;
    let shared = msg_handler.into_shared();
    let dispatch_handle: SharedHandler = shared.clone();
    let request_view = {
        let guarded = shared.lock().expect("fresh handler");
        // The postmaster frames from its own copy of the bytes; cloning
        // here keeps the buffer rewritable by the handler.
        Message::from_bytes(guarded.request_bytes())
    };
    match ctx
        .postmaster
        .send(url, &request_view, &dispatch_handle, stateful, expires)
    {
        Ok(()) => {
            shared.lock().expect("fresh handler").mark_in_fly();
            Ok(())
        }
        Err(status) => {
            error!(
                "unable to hand over the message: target={}, status={status}",
                url.host_id()
            );
            // The request was never on the wire; roll the id back and let
            // the caller see the failure directly.
            let _ = sid_mgr.release(sid);
            shared.lock().expect("fresh handler").disarm();
            Err(status)
        }
    }
}

/// Send `request` through a virtual (metalink) location.
///
/// The location is registered with the redirector, the handler follows
/// virtual targets, and the virtual host acts as load balancer for the
/// whole request.
///
/// # Errors
///
/// Returns a status when no redirector is installed, registration fails,
/// or the postmaster refuses the message.
pub fn redirect_request(
    ctx: &HandlerContext,
    url: &Url,
    request: Message,
    handler: Box<dyn ResponseHandler>,
    params: SendParams,
) -> Result<(), Status> {
    let Some(redirector) = ctx.redirector.as_ref() else {
        return Err(Status::error(
            StatusCode::NotSupported,
            "no redirector registry installed",
        ));
    };
    redirector.register(url)?;

    let expires = params.expires.unwrap_or_else(|| {
        Instant::now() + params.timeout.unwrap_or(ctx.config.request_timeout)
    });

    let mut msg_handler = RequestHandler::new(ctx.clone(), request, handler, url.clone());
    msg_handler.set_expiration(expires);
    msg_handler.set_redirect_counter(params.redirect_limit.unwrap_or(ctx.config.redirect_limit));
    msg_handler.set_redirect_as_answer(params.redirect_as_answer);
    msg_handler.set_chunk_list(params.chunk_list);
    msg_handler.set_stateful(params.stateful);
    msg_handler.set_follow_metalink(true);
    let virtual_host = HostInfo {
        url: url.clone(),
        load_balancer: true,
    };
    msg_handler.set_load_balancer(virtual_host.clone());
    msg_handler.set_host_list(vec![virtual_host]);

    let shared = msg_handler.into_shared();
    let dispatch_handle: SharedHandler = shared.clone();
    let request_view = {
        let guarded = shared.lock().expect("fresh handler");
        Message::from_bytes(guarded.request_bytes())
    };
    debug!(
        "routing message through a virtual location: target={}",
        url.host_id()
    );
    match ctx.postmaster.redirect(url, &request_view, &dispatch_handle) {
        Ok(()) => Ok(()),
        Err(status) => {
            error!(
                "unable to route the message: target={}, status={status}",
                url.host_id()
            );
            shared.lock().expect("fresh handler").disarm();
            Err(status)
        }
    }
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
