//! Shared fakes and frame builders for the unit tests.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bytes::BytesMut;

use crate::{
    config::Config,
    message::Message,
    postmaster::{
        CallbackRunner,
        HandlerContext,
        HostList,
        LocalFileHandler,
        Postmaster,
        Redirector,
        ResponseHandler,
        SharedHandler,
        WaitScheduler,
        WaitTask,
    },
    protocol::{wire::ResponseHeader, ResponseCode, ServerErrno},
    response::ResponseBody,
    runtime::InlineCallbackRunner,
    sid::SidManager,
    status::Status,
    url::Url,
};

/// One observed hand-off to the fake postmaster. Holding the shared
/// handler mirrors the real dispatch table keeping it registered.
pub struct SendRecord {
    pub url: Url,
    pub request: Message,
    pub handler: SharedHandler,
    pub stateful: bool,
    pub expires: Instant,
}

/// Postmaster fake that records hand-offs and keeps one stream-id pool
/// per host.
#[derive(Default)]
pub struct RecordingPostmaster {
    pools: Mutex<HashMap<String, Arc<SidManager>>>,
    pub sends: Mutex<Vec<SendRecord>>,
    pub redirects: Mutex<Vec<SendRecord>>,
    pub fail_sends: Mutex<Option<Status>>,
}

impl RecordingPostmaster {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    pub fn sent_count(&self) -> usize { self.sends.lock().expect("lock").len() }

    pub fn last_send_url(&self) -> Option<Url> {
        self.sends.lock().expect("lock").last().map(|r| r.url.clone())
    }

    pub fn last_request(&self) -> Option<Message> {
        self.sends
            .lock()
            .expect("lock")
            .last()
            .map(|r| r.request.clone())
    }
}

impl Postmaster for RecordingPostmaster {
    fn send(
        &self,
        url: &Url,
        msg: &Message,
        handler: &SharedHandler,
        stateful: bool,
        expires: Instant,
    ) -> Result<(), Status> {
        if let Some(status) = self.fail_sends.lock().expect("lock").clone() {
            return Err(status);
        }
        self.sends.lock().expect("lock").push(SendRecord {
            url: url.clone(),
            request: msg.clone(),
            handler: Arc::clone(handler),
            stateful,
            expires,
        });
        Ok(())
    }

    fn redirect(&self, url: &Url, msg: &Message, handler: &SharedHandler) -> Result<(), Status> {
        self.redirects.lock().expect("lock").push(SendRecord {
            url: url.clone(),
            request: msg.clone(),
            handler: Arc::clone(handler),
            stateful: false,
            expires: Instant::now(),
        });
        Ok(())
    }

    fn sid_manager(&self, url: &Url) -> Arc<SidManager> {
        let mut pools = self.pools.lock().expect("lock");
        Arc::clone(
            pools
                .entry(url.host_id())
                .or_insert_with(|| Arc::new(SidManager::new())),
        )
    }
}

/// Scheduler fake that parks tasks until the test fires them.
#[derive(Default)]
pub struct ManualScheduler {
    pub scheduled: Mutex<Vec<(Duration, WaitTask)>>,
}

impl ManualScheduler {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    pub fn pending(&self) -> usize { self.scheduled.lock().expect("lock").len() }

    pub fn last_delay(&self) -> Option<Duration> {
        self.scheduled.lock().expect("lock").last().map(|(d, _)| *d)
    }

    /// Fire every parked task with the given clock reading.
    pub fn fire_all(&self, now: Instant) {
        let tasks: Vec<_> = self.scheduled.lock().expect("lock").drain(..).collect();
        for (_, task) in tasks {
            task.run(now);
        }
    }
}

impl WaitScheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: WaitTask) {
        self.scheduled.lock().expect("lock").push((delay, task));
    }
}

/// Outcome captured by [`CollectingHandler`].
pub type Outcome = (Status, Option<ResponseBody>, HostList);

/// Response callback that stores its (single) outcome for inspection.
pub struct CollectingHandler {
    slot: Arc<Mutex<Vec<Outcome>>>,
}

impl CollectingHandler {
    pub fn new() -> (Box<Self>, Arc<Mutex<Vec<Outcome>>>) {
        let slot = Arc::new(Mutex::new(Vec::new()));
        (
            Box::new(Self {
                slot: Arc::clone(&slot),
            }),
            slot,
        )
    }
}

impl ResponseHandler for CollectingHandler {
    fn on_response(
        self: Box<Self>,
        status: Status,
        response: Option<ResponseBody>,
        hosts: HostList,
    ) {
        self.slot.lock().expect("lock").push((status, response, hosts));
    }
}

/// Local-file fake returning a canned outcome.
pub struct FakeLocalFiles {
    pub outcome: (Status, Option<ResponseBody>),
    pub calls: Mutex<Vec<Url>>,
}

impl LocalFileHandler for FakeLocalFiles {
    fn execute(&self, _request: &Message, url: &Url) -> (Status, Option<ResponseBody>) {
        self.calls.lock().expect("lock").push(url.clone());
        self.outcome.clone()
    }
}

/// Redirector fake mapping one virtual host to a queue of replicas.
#[derive(Default)]
pub struct FakeRedirector {
    pub virtual_host: String,
    pub replicas: Mutex<Vec<Url>>,
}

impl Redirector for FakeRedirector {
    fn register(&self, _url: &Url) -> Result<(), Status> { Ok(()) }

    fn is_virtual(&self, url: &Url) -> bool { url.host() == self.virtual_host }

    fn next_replica(&self, _url: &Url) -> Option<Url> {
        let mut replicas = self.replicas.lock().expect("lock");
        if replicas.is_empty() {
            None
        } else {
            Some(replicas.remove(0))
        }
    }
}

/// A context wired with the given fakes and an inline callback runner.
pub fn test_context(
    postmaster: &Arc<RecordingPostmaster>,
    scheduler: &Arc<ManualScheduler>,
    config: Config,
) -> HandlerContext {
    let postmaster: Arc<dyn Postmaster> = postmaster.clone();
    let scheduler: Arc<dyn WaitScheduler> = scheduler.clone();
    let runner: Arc<dyn CallbackRunner> = Arc::new(InlineCallbackRunner);
    HandlerContext {
        postmaster,
        scheduler,
        runner,
        local_files: None,
        redirector: None,
        config,
    }
}

/// Build a response frame for the given stream id.
pub fn frame(sid: crate::sid::StreamId, code: ResponseCode, body: &[u8]) -> Message {
    let mut buf = BytesMut::new();
    ResponseHeader {
        stream_id: sid,
        status: code.wire_value(),
        dlen: u32::try_from(body.len()).expect("test body fits"),
    }
    .encode(&mut buf);
    buf.extend_from_slice(body);
    Message::from_bytes(buf)
}

/// Body of an error response.
pub fn error_body(errno: ServerErrno, message: &str) -> Vec<u8> {
    let mut body = errno.wire_value().to_be_bytes().to_vec();
    body.extend_from_slice(message.as_bytes());
    body.push(0);
    body
}

/// Body of a redirect response.
pub fn redirect_body(port: u32, text: &str) -> Vec<u8> {
    let mut body = port.to_be_bytes().to_vec();
    body.extend_from_slice(text.as_bytes());
    body
}

/// Body of a wait response.
pub fn wait_body(seconds: u32, reason: &str) -> Vec<u8> {
    let mut body = seconds.to_be_bytes().to_vec();
    body.extend_from_slice(reason.as_bytes());
    body.push(0);
    body
}
