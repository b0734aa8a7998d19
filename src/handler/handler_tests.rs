//! Unit tests for the request state machine.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bytes::BytesMut;

use super::RequestHandler;
use crate::{
    chunk::Chunk,
    config::Config,
    message::{readv_request_body, Message},
    postmaster::{
        ExamineResult,
        FrameAction,
        HandlerContext,
        HostInfo,
        MessageHandler,
        Postmaster,
        StreamAction,
        StreamEvent,
    },
    protocol::{crc, wire::ReadAheadHeader, RequestCode, ResponseCode, ServerErrno, StatusFrame},
    response::ResponseBody,
    sid::StreamId,
    status::{Status, StatusCode},
    test_support::{
        error_body,
        frame,
        redirect_body,
        test_context,
        wait_body,
        CollectingHandler,
        FakeLocalFiles,
        FakeRedirector,
        ManualScheduler,
        Outcome,
        RecordingPostmaster,
    },
    url::Url,
};

struct Rig {
    pm: Arc<RecordingPostmaster>,
    sched: Arc<ManualScheduler>,
    shared: Arc<Mutex<RequestHandler>>,
    outcomes: Arc<Mutex<Vec<Outcome>>>,
    sid: StreamId,
    origin: Url,
}

impl Rig {
    fn examine(&self, msg: &Message) -> ExamineResult {
        self.shared.lock().expect("lock").examine(msg)
    }

    fn process(&self, msg: Message) {
        self.shared.lock().expect("lock").process(msg);
    }

    fn process_at(&self, msg: Message, now: Instant) {
        self.shared.lock().expect("lock").process_at(msg, now);
    }

    fn status_ready_ok(&self) {
        let probe = frame(self.sid, ResponseCode::Ok, b"");
        self.shared
            .lock()
            .expect("lock")
            .on_status_ready(&probe, Status::ok());
    }

    fn outcome(&self) -> Outcome {
        let outcomes = self.outcomes.lock().expect("lock");
        assert_eq!(outcomes.len(), 1, "callback must fire exactly once");
        outcomes[0].clone()
    }

    fn no_outcome_yet(&self) {
        assert!(self.outcomes.lock().expect("lock").is_empty());
    }
}

fn origin_url() -> Url { "root://origin.example:1094//data/f".parse().expect("valid") }

fn build_rig_with(
    pm: Arc<RecordingPostmaster>,
    sched: Arc<ManualScheduler>,
    ctx: HandlerContext,
    request: Message,
    configure: impl FnOnce(&mut RequestHandler),
) -> Rig {
    let origin = origin_url();
    let (callback, outcomes) = CollectingHandler::new();
    let mut handler = RequestHandler::new(ctx, request, callback, origin.clone());
    let mgr = handler_pm(&pm, &origin);
    let sid = mgr.allocate().expect("fresh pool");
    handler.bind_sid(sid, mgr);
    handler.set_host_list(vec![HostInfo::new(origin.clone())]);
    configure(&mut handler);
    let shared = handler.into_shared();
    shared.lock().expect("lock").mark_in_fly();
    Rig {
        pm,
        sched,
        shared,
        outcomes,
        sid,
        origin,
    }
}

fn handler_pm(pm: &Arc<RecordingPostmaster>, url: &Url) -> Arc<crate::sid::SidManager> {
    let as_postmaster: &dyn Postmaster = pm.as_ref();
    as_postmaster.sid_manager(url)
}

fn build_rig(request: Message, configure: impl FnOnce(&mut RequestHandler)) -> Rig {
    let pm = RecordingPostmaster::new();
    let sched = ManualScheduler::new();
    let ctx = test_context(&pm, &sched, Config::default());
    build_rig_with(pm, sched, ctx, request, configure)
}

fn rig(request: Message) -> Rig { build_rig(request, |_| {}) }

fn open_request() -> Message { Message::request(RequestCode::Open, [0; 16], b"/data/f") }

#[test]
fn simple_open_completes_exactly_once() {
    let rig = rig(open_request());
    rig.status_ready_ok();
    rig.no_outcome_yet();

    let ok = frame(rig.sid, ResponseCode::Ok, &[1, 2, 3, 4]);
    assert_eq!(rig.examine(&ok), ExamineResult::take_final());
    rig.process(ok);

    let (status, body, hosts) = rig.outcome();
    assert!(status.is_ok());
    let Some(ResponseBody::Open(info)) = body else {
        panic!("expected open info, got {body:?}");
    };
    assert_eq!(info.file_handle, [1, 2, 3, 4]);
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].url, rig.origin);

    // The stream id went back to the pool.
    let mgr = handler_pm(&rig.pm, &rig.origin);
    assert_eq!(mgr.allocated_count(), 0);
}

#[test]
fn frames_for_other_streams_are_ignored() {
    let rig = rig(open_request());
    let foreign = frame(StreamId(9999), ResponseCode::Ok, &[1, 2, 3, 4]);
    assert_eq!(rig.examine(&foreign), ExamineResult::ignore());
}

#[test]
fn completion_waits_for_the_in_fly_confirmation() {
    let rig = rig(open_request());
    let ok = frame(rig.sid, ResponseCode::Ok, &[1, 2, 3, 4]);
    rig.process(ok);
    // Final response arrived but the outbound confirmation has not.
    rig.no_outcome_yet();
    rig.status_ready_ok();
    assert!(rig.outcome().0.is_ok());
}

#[test]
fn second_terminal_frame_is_dropped() {
    let rig = rig(open_request());
    rig.status_ready_ok();
    rig.process(frame(rig.sid, ResponseCode::Ok, &[1, 2, 3, 4]));
    rig.process(frame(rig.sid, ResponseCode::Ok, &[5, 6, 7, 8]));
    let (status, _, _) = rig.outcome();
    assert!(status.is_ok());
}

#[test]
fn redirect_then_ok_tracks_hosts_and_tried_cgi() {
    let rig = rig(open_request());
    rig.status_ready_ok();

    let redirect = frame(rig.sid, ResponseCode::Redirect, &redirect_body(1094, "host2.example"));
    assert_eq!(rig.examine(&redirect), ExamineResult::take_final());
    rig.process(redirect);
    rig.no_outcome_yet();

    // The request went out again, to the new endpoint, with the origin in
    // its tried list.
    assert_eq!(rig.pm.sent_count(), 1);
    let resent = rig.pm.last_request().expect("resent request");
    let params = resent.path_params();
    assert_eq!(
        params.get("tried").map(String::as_str),
        Some("origin.example:1094")
    );
    assert_eq!(
        rig.pm.last_send_url().expect("target").host_id(),
        "host2.example:1094"
    );

    // The new endpoint answers; the handler reports the full host trail.
    let new_sid = resent.stream_id();
    rig.status_ready_ok();
    {
        let mut h = rig.shared.lock().expect("lock");
        let ok = frame(new_sid, ResponseCode::Ok, &[9, 9, 9, 9]);
        assert_eq!(h.examine(&ok).action, FrameAction::Take);
        h.process(ok);
    }
    let (status, _, hosts) = rig.outcome();
    assert!(status.is_ok());
    let host_ids: Vec<String> = hosts.iter().map(|h| h.url.host_id()).collect();
    assert_eq!(host_ids, vec!["origin.example:1094", "host2.example:1094"]);
    assert!(hosts[0].load_balancer, "origin becomes the load balancer");
}

#[test]
fn redirect_releases_the_old_stream_id() {
    let rig = rig(open_request());
    rig.status_ready_ok();
    let origin_pool = handler_pm(&rig.pm, &rig.origin);
    assert_eq!(origin_pool.allocated_count(), 1);

    rig.process(frame(rig.sid, ResponseCode::Redirect, &redirect_body(1094, "host2.example")));

    assert_eq!(origin_pool.allocated_count(), 0);
    let new_pool = handler_pm(&rig.pm, &"root://host2.example:1094/".parse().expect("valid"));
    assert_eq!(new_pool.allocated_count(), 1);
}

#[test]
fn redirect_budget_exhaustion_is_terminal() {
    let rig = build_rig(open_request(), |h| h.set_redirect_counter(3));
    rig.status_ready_ok();

    for hop in 1..=3u16 {
        let sid = rig
            .pm
            .last_request()
            .map_or(rig.sid, |r| r.stream_id());
        rig.process(frame(
            sid,
            ResponseCode::Redirect,
            &redirect_body(1094, &format!("hop{hop}.example")),
        ));
        rig.status_ready_ok();
    }
    rig.no_outcome_yet();

    let sid = rig.pm.last_request().expect("resent").stream_id();
    rig.process(frame(
        sid,
        ResponseCode::Redirect,
        &redirect_body(1094, "hop4.example"),
    ));

    let (status, _, hosts) = rig.outcome();
    assert_eq!(status.code, StatusCode::RedirectLimitReached);
    assert_eq!(hosts.len(), 4, "origin plus three followed hops");
}

#[test]
fn redirect_as_answer_reports_instead_of_following() {
    let rig = build_rig(open_request(), |h| h.set_redirect_as_answer(true));
    rig.status_ready_ok();
    rig.process(frame(
        rig.sid,
        ResponseCode::Redirect,
        &redirect_body(2094, "elsewhere.example?token=t"),
    ));
    let (status, body, _) = rig.outcome();
    assert!(status.is_ok());
    let Some(ResponseBody::Redirect(url)) = body else {
        panic!("expected redirect payload, got {body:?}");
    };
    assert_eq!(url.host_id(), "elsewhere.example:2094");
    assert_eq!(url.params().get("token").map(String::as_str), Some("t"));
    assert_eq!(rig.pm.sent_count(), 0, "nothing is resent");
}

#[test]
fn unparsable_redirect_is_terminal() {
    let rig = rig(open_request());
    rig.status_ready_ok();
    rig.process(frame(rig.sid, ResponseCode::Redirect, &redirect_body(0, "")));
    let (status, _, _) = rig.outcome();
    assert_eq!(status.code, StatusCode::InvalidRedirect);
}

#[test]
fn wait_then_ok_resends_after_the_delay() {
    let rig = rig(open_request());
    rig.status_ready_ok();

    let start = Instant::now();
    rig.process_at(frame(rig.sid, ResponseCode::Wait, &wait_body(2, "busy")), start);
    rig.no_outcome_yet();
    assert_eq!(rig.sched.last_delay(), Some(Duration::from_secs(2)));
    assert_eq!(rig.pm.sent_count(), 0);

    rig.sched.fire_all(start + Duration::from_secs(2));
    assert_eq!(rig.pm.sent_count(), 1, "resent after the wait");
    // An open gains the refresh flag on the resend.
    let resent = rig.pm.last_request().expect("resent");
    assert_eq!(resent.bytes()[7] & 0x80, 0x80);

    rig.status_ready_ok();
    rig.process(frame(rig.sid, ResponseCode::Ok, &[1, 2, 3, 4]));
    let (status, _, hosts) = rig.outcome();
    assert!(status.is_ok());
    assert_eq!(hosts.len(), 1, "a wait resend is not a new visit");
}

#[test]
fn wait_is_clamped_to_the_deadline_and_expires_on_wake() {
    let start = Instant::now();
    let rig = build_rig(open_request(), |h| {
        h.set_expiration(start + Duration::from_secs(1));
    });
    rig.status_ready_ok();

    rig.process_at(frame(rig.sid, ResponseCode::Wait, &wait_body(10, "try later")), start);
    assert_eq!(
        rig.sched.last_delay(),
        Some(Duration::from_secs(1)),
        "wait is clamped to the remaining budget"
    );

    rig.sched.fire_all(start + Duration::from_secs(1));
    let (status, _, _) = rig.outcome();
    assert_eq!(status.code, StatusCode::OperationExpired);
    assert_eq!(rig.pm.sent_count(), 0, "no resend after the deadline");
}

#[test]
fn wait_with_no_remaining_budget_expires_immediately() {
    let start = Instant::now();
    let rig = build_rig(open_request(), |h| {
        h.set_expiration(start + Duration::from_millis(300));
    });
    rig.status_ready_ok();
    // Less than a whole second left rounds down to nothing.
    rig.process_at(frame(rig.sid, ResponseCode::Wait, &wait_body(5, "busy")), start);
    let (status, _, _) = rig.outcome();
    assert_eq!(status.code, StatusCode::OperationExpired);
    assert_eq!(rig.sched.pending(), 0);
}

#[test]
fn waitresp_keeps_the_handler_armed() {
    let rig = rig(open_request());
    rig.status_ready_ok();
    let waitresp = frame(rig.sid, ResponseCode::WaitResp, &wait_body(30, ""));
    assert_eq!(rig.examine(&waitresp).action, FrameAction::Take);
    assert!(!rig.examine(&waitresp).remove_handler);
    rig.process(waitresp);
    rig.no_outcome_yet();

    rig.process(frame(rig.sid, ResponseCode::Ok, &[1, 2, 3, 4]));
    assert!(rig.outcome().0.is_ok());
}

#[test]
fn recoverable_error_retries_at_the_load_balancer() {
    let rig = rig(open_request());
    rig.status_ready_ok();

    // First hop makes the origin the load balancer.
    rig.process(frame(rig.sid, ResponseCode::Redirect, &redirect_body(1094, "data1.example")));
    rig.status_ready_ok();

    let sid = rig.pm.last_request().expect("resent").stream_id();
    rig.process(frame(
        sid,
        ResponseCode::Error,
        &error_body(ServerErrno::ServerError, "try elsewhere"),
    ));
    rig.no_outcome_yet();

    assert_eq!(rig.pm.sent_count(), 2);
    let back_at = rig.pm.last_send_url().expect("target");
    assert_eq!(back_at.host_id(), "origin.example:1094");
    let params = rig.pm.last_request().expect("request").path_params();
    assert_eq!(
        params.get("tried").map(String::as_str),
        Some("data1.example:1094"),
        "the tried list never names the next target"
    );
    assert_eq!(params.get("triedrc").map(String::as_str), Some("srverr"));
}

#[test]
fn unrecoverable_error_reaches_the_caller_with_the_server_message() {
    let rig = rig(open_request());
    rig.status_ready_ok();
    rig.process(frame(
        rig.sid,
        ResponseCode::Error,
        &error_body(ServerErrno::NotAuthorized, "credentials rejected"),
    ));
    let (status, body, _) = rig.outcome();
    assert_eq!(status.code, StatusCode::ErrorResponse);
    assert_eq!(status.server_errno, ServerErrno::NotAuthorized.wire_value());
    assert_eq!(status.message, "credentials rejected");
    assert!(body.is_none());
}

#[test]
fn not_found_retries_only_away_from_the_balancer() {
    // Without a load balancer, not-found is terminal.
    let rig = rig(open_request());
    rig.status_ready_ok();
    rig.process(frame(
        rig.sid,
        ResponseCode::Error,
        &error_body(ServerErrno::NotFound, "no such file"),
    ));
    let (status, _, _) = rig.outcome();
    assert_eq!(status.code, StatusCode::ErrorResponse);
}

#[test]
fn broken_stream_retries_idempotent_requests() {
    let rig = rig(open_request());
    rig.status_ready_ok();
    let action = rig.shared.lock().expect("lock").on_stream_event(
        StreamEvent::Broken,
        Status::error(StatusCode::StreamBroken, "connection reset"),
    );
    assert_eq!(action, StreamAction::RemoveHandler);
    rig.no_outcome_yet();
    assert_eq!(rig.pm.sent_count(), 1, "reissued");

    // The broken stream's id is quarantined, not recycled.
    let pool = handler_pm(&rig.pm, &rig.origin);
    assert_eq!(pool.timed_out_count(), 1);
}

#[test]
fn broken_stream_fails_session_bound_requests_without_reconnect() {
    let mut request = Message::request(RequestCode::Write, [0; 16], b"");
    request.set_session_id(42);
    let rig = rig(request);
    rig.status_ready_ok();
    rig.shared.lock().expect("lock").on_stream_event(
        StreamEvent::Broken,
        Status::error(StatusCode::StreamBroken, "connection reset"),
    );
    let (status, _, _) = rig.outcome();
    assert_eq!(status.code, StatusCode::StreamBroken);
}

#[test]
fn timeout_event_is_terminal() {
    let rig = rig(open_request());
    rig.status_ready_ok();
    rig.shared
        .lock()
        .expect("lock")
        .on_stream_event(StreamEvent::Timeout, Status::ok());
    let (status, _, _) = rig.outcome();
    assert_eq!(status.code, StatusCode::OperationExpired);
}

#[test]
fn oksofar_segments_merge_in_arrival_order() {
    let rig = rig(Message::request(RequestCode::DirList, [0; 16], b"/d"));
    rig.status_ready_ok();

    let partial = frame(rig.sid, ResponseCode::OkSoFar, b"file-a\nfile-b\n");
    let examined = rig.examine(&partial);
    assert_eq!(examined.action, FrameAction::Take);
    assert!(!examined.remove_handler, "more frames follow");
    rig.process(partial);
    rig.process(frame(rig.sid, ResponseCode::Ok, b"file-c"));

    let (status, body, _) = rig.outcome();
    assert!(status.is_ok());
    let Some(ResponseBody::DirList(list)) = body else {
        panic!("expected a directory listing, got {body:?}");
    };
    assert_eq!(list.entries, vec!["file-a", "file-b", "file-c"]);
}

#[test]
fn announced_checksum_is_verified_over_the_merged_body() {
    let rig = rig(Message::request(RequestCode::Query, [0; 16], b""));
    rig.status_ready_ok();

    let body_a = b"first-half-";
    let body_b = b"second-half";
    let full: Vec<u8> = [&body_a[..], &body_b[..]].concat();
    let mut status_body = BytesMut::new();
    StatusFrame {
        stream_id: rig.sid,
        resp_kind: 0,
        body_crc32c: crc::crc32c(&full),
        body_len: u32::try_from(full.len()).expect("fits"),
    }
    .encode(&mut status_body);

    rig.process(frame(rig.sid, ResponseCode::Status, &status_body));
    rig.process(frame(rig.sid, ResponseCode::OkSoFar, body_a));
    rig.process(frame(rig.sid, ResponseCode::Ok, body_b));

    let (status, body, _) = rig.outcome();
    assert!(status.is_ok(), "matching checksum passes: {status}");
    let Some(ResponseBody::Buffer(buffer)) = body else {
        panic!("expected a buffer, got {body:?}");
    };
    assert_eq!(buffer.0, full);
}

#[test]
fn checksum_mismatch_is_a_protocol_error() {
    let rig = rig(Message::request(RequestCode::Query, [0; 16], b""));
    rig.status_ready_ok();

    let mut status_body = BytesMut::new();
    StatusFrame {
        stream_id: rig.sid,
        resp_kind: 0,
        body_crc32c: 0xBAD0_BAD0,
        body_len: 4,
    }
    .encode(&mut status_body);

    rig.process(frame(rig.sid, ResponseCode::Status, &status_body));
    rig.process(frame(rig.sid, ResponseCode::Ok, b"data"));

    let (status, _, _) = rig.outcome();
    assert_eq!(status.code, StatusCode::InvalidResponse);
}

#[test]
fn buffered_vector_read_reports_partial_chunks() {
    let chunks = vec![Chunk::for_read(0, 4), Chunk::for_read(8192, 4)];
    let request = Message::request(
        RequestCode::ReadV,
        [0; 16],
        &readv_request_body([1, 0, 0, 0], &chunks),
    );
    let rig = build_rig(request, |h| {
        h.set_chunk_list(Some(chunks));
    });
    rig.status_ready_ok();

    // The server honours the first chunk and botches the second's length.
    let mut body = BytesMut::new();
    ReadAheadHeader {
        fhandle: [1, 0, 0, 0],
        rlen: 4,
        offset: 0,
    }
    .encode(&mut body);
    body.extend_from_slice(b"abcd");
    ReadAheadHeader {
        fhandle: [1, 0, 0, 0],
        rlen: 6,
        offset: 8192,
    }
    .encode(&mut body);
    body.extend_from_slice(b"XXXXXX");

    let ok = frame(rig.sid, ResponseCode::Ok, &body);
    // Buffered because no chunk list is armed raw; examine still takes it.
    rig.process(ok);

    let (status, body, _) = rig.outcome();
    assert_eq!(status.code, StatusCode::OkPartial);
    let Some(ResponseBody::VectorRead(info)) = body else {
        panic!("expected vector-read info, got {body:?}");
    };
    assert!(info.statuses[0].done);
    assert!(info.statuses[1].size_error);
    assert!(!info.statuses[1].done);
    assert_eq!(info.chunks[0].data, b"abcd");
    assert_eq!(info.size, 4);
}

#[test]
fn buffered_read_lands_at_the_running_offset() {
    let chunks = vec![Chunk::for_read(0, 8)];
    let mut params = [0u8; 16];
    params[4..12].copy_from_slice(&0u64.to_be_bytes());
    let rig = build_rig(Message::request(RequestCode::Read, params, b""), |h| {
        h.set_chunk_list(Some(chunks));
    });
    rig.status_ready_ok();

    rig.process(frame(rig.sid, ResponseCode::OkSoFar, b"abcd"));
    rig.process(frame(rig.sid, ResponseCode::Ok, b"efgh"));

    let (status, body, _) = rig.outcome();
    assert!(status.is_ok());
    let Some(ResponseBody::Read(info)) = body else {
        panic!("expected read info, got {body:?}");
    };
    assert_eq!(info.chunk.data, b"abcdefgh");
    assert_eq!(info.bytes_read, 8);
}

#[test]
fn attention_wrapped_response_is_unwrapped() {
    let rig = rig(open_request());
    rig.status_ready_ok();

    let inner = frame(rig.sid, ResponseCode::Ok, &[1, 2, 3, 4]);
    let mut body = 5005u32.to_be_bytes().to_vec();
    body.extend_from_slice(&[0; 4]);
    body.extend_from_slice(inner.bytes());
    let attn = frame(StreamId(0), ResponseCode::Attn, &body);

    assert_eq!(rig.examine(&attn), ExamineResult::take_final());
    rig.process(attn);

    let (status, body, _) = rig.outcome();
    assert!(status.is_ok());
    assert!(matches!(body, Some(ResponseBody::Open(_))));
}

#[test]
fn attention_for_a_foreign_stream_is_ignored() {
    let rig = rig(open_request());
    let inner = frame(StreamId(9999), ResponseCode::Ok, &[1, 2, 3, 4]);
    let mut body = 5005u32.to_be_bytes().to_vec();
    body.extend_from_slice(&[0; 4]);
    body.extend_from_slice(inner.bytes());
    let attn = frame(StreamId(0), ResponseCode::Attn, &body);
    assert_eq!(rig.examine(&attn), ExamineResult::ignore());
}

#[test]
fn local_redirect_executes_without_further_network_activity() {
    let pm = RecordingPostmaster::new();
    let sched = ManualScheduler::new();
    let mut ctx = test_context(&pm, &sched, Config::default());
    let local = Arc::new(FakeLocalFiles {
        outcome: (Status::ok(), None),
        calls: Mutex::new(Vec::new()),
    });
    ctx.local_files = Some(local.clone());

    let rig = build_rig_with(pm, sched, ctx, open_request(), |_| {});
    rig.status_ready_ok();
    rig.process(frame(
        rig.sid,
        ResponseCode::Redirect,
        &redirect_body(0, "file://localhost/tmp/cached"),
    ));

    let (status, _, hosts) = rig.outcome();
    assert!(status.is_ok());
    assert_eq!(local.calls.lock().expect("lock").len(), 1);
    assert_eq!(rig.pm.sent_count(), 0);
    assert_eq!(hosts.len(), 2, "the local target still counts as a visit");
}

#[test]
fn metalink_redirect_resolves_to_the_next_replica() {
    let pm = RecordingPostmaster::new();
    let sched = ManualScheduler::new();
    let mut ctx = test_context(&pm, &sched, Config::default());
    let redirector = Arc::new(FakeRedirector {
        virtual_host: "meta.example".to_owned(),
        replicas: Mutex::new(vec!["root://replica1.example:1094/".parse().expect("valid")]),
    });
    ctx.redirector = Some(redirector);

    let rig = build_rig_with(pm, sched, ctx, open_request(), |h| h.set_follow_metalink(true));
    rig.status_ready_ok();
    rig.process(frame(
        rig.sid,
        ResponseCode::Redirect,
        &redirect_body(1094, "meta.example"),
    ));

    assert_eq!(
        rig.pm.last_send_url().expect("target").host_id(),
        "replica1.example:1094"
    );
}

#[test]
fn long_waits_are_traded_for_a_replica_when_one_exists() {
    let pm = RecordingPostmaster::new();
    let sched = ManualScheduler::new();
    let mut config = Config::default();
    config.wait_threshold = Duration::from_secs(5);
    let mut ctx = test_context(&pm, &sched, config);
    let redirector = Arc::new(FakeRedirector {
        virtual_host: "meta.example".to_owned(),
        replicas: Mutex::new(vec!["root://replica1.example:1094/".parse().expect("valid")]),
    });
    ctx.redirector = Some(redirector);

    let rig = build_rig_with(pm, sched, ctx, open_request(), |h| h.set_follow_metalink(true));
    rig.status_ready_ok();

    rig.process(frame(rig.sid, ResponseCode::Wait, &wait_body(30, "maintenance")));

    assert_eq!(rig.sched.pending(), 0, "no wait is scheduled");
    assert_eq!(
        rig.pm.last_send_url().expect("target").host_id(),
        "replica1.example:1094"
    );
}

#[test]
fn disarmed_handler_never_calls_back() {
    let rig = rig(open_request());
    rig.shared.lock().expect("lock").disarm();
    drop(rig.shared);
    assert!(rig.outcomes.lock().expect("lock").is_empty());
}
