//! Shared fixtures for the integration tests: fake collaborators and
//! frame builders speaking the public API only.
#![allow(dead_code)]

use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bytes::BytesMut;
use rootwire::{
    handler::raw::SocketRead,
    protocol::{wire::ResponseHeader, ResponseCode, ServerErrno},
    CallbackRunner,
    Config,
    HandlerContext,
    HostList,
    Message,
    Postmaster,
    ResponseBody,
    ResponseHandler,
    SharedHandler,
    SidManager,
    Status,
    StreamId,
    Url,
    WaitScheduler,
    WaitTask,
};

/// One observed hand-off to the fake postmaster.
pub struct SendRecord {
    pub url: Url,
    pub request: Message,
    pub handler: SharedHandler,
    pub expires: Instant,
}

/// Postmaster fake recording hand-offs, with one stream-id pool per host.
#[derive(Default)]
pub struct RecordingPostmaster {
    pools: Mutex<HashMap<String, Arc<SidManager>>>,
    pub sends: Mutex<Vec<SendRecord>>,
}

impl RecordingPostmaster {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    pub fn sent_count(&self) -> usize { self.sends.lock().expect("lock").len() }

    pub fn last(&self) -> (Url, Message, SharedHandler) {
        let sends = self.sends.lock().expect("lock");
        let record = sends.last().expect("at least one send");
        (
            record.url.clone(),
            record.request.clone(),
            Arc::clone(&record.handler),
        )
    }

    pub fn pool(&self, url: &Url) -> Arc<SidManager> {
        let mut pools = self.pools.lock().expect("lock");
        Arc::clone(
            pools
                .entry(url.host_id())
                .or_insert_with(|| Arc::new(SidManager::new())),
        )
    }
}

impl Postmaster for RecordingPostmaster {
    fn send(
        &self,
        url: &Url,
        msg: &Message,
        handler: &SharedHandler,
        _stateful: bool,
        expires: Instant,
    ) -> Result<(), Status> {
        self.sends.lock().expect("lock").push(SendRecord {
            url: url.clone(),
            request: msg.clone(),
            handler: Arc::clone(handler),
            expires,
        });
        Ok(())
    }

    fn redirect(&self, url: &Url, msg: &Message, handler: &SharedHandler) -> Result<(), Status> {
        self.send(url, msg, handler, false, Instant::now())
    }

    fn sid_manager(&self, url: &Url) -> Arc<SidManager> { self.pool(url) }
}

/// Scheduler fake parking wait tasks until the test fires them.
#[derive(Default)]
pub struct ManualScheduler {
    pub scheduled: Mutex<Vec<(Duration, WaitTask)>>,
}

impl ManualScheduler {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    pub fn last_delay(&self) -> Option<Duration> {
        self.scheduled.lock().expect("lock").last().map(|(d, _)| *d)
    }

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

/// Runs callbacks inline; the tests assert on the recorded outcome.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineRunner;

impl CallbackRunner for InlineRunner {
    fn run(&self, job: Box<dyn FnOnce() + Send>) { job(); }
}

pub type Outcome = (Status, Option<ResponseBody>, HostList);

/// Response callback recording its single outcome.
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

/// A handler context wired to the given fakes.
pub fn context(
    pm: &Arc<RecordingPostmaster>,
    sched: &Arc<ManualScheduler>,
    config: Config,
) -> HandlerContext {
    let postmaster: Arc<dyn Postmaster> = pm.clone();
    let scheduler: Arc<dyn WaitScheduler> = sched.clone();
    HandlerContext {
        postmaster,
        scheduler,
        runner: Arc::new(InlineRunner),
        local_files: None,
        redirector: None,
        config,
    }
}

/// Build a response frame addressed to `sid`.
pub fn frame(sid: StreamId, code: ResponseCode, body: &[u8]) -> Message {
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

pub fn redirect_body(port: u32, text: &str) -> Vec<u8> {
    let mut body = port.to_be_bytes().to_vec();
    body.extend_from_slice(text.as_bytes());
    body
}

pub fn error_body(errno: ServerErrno, message: &str) -> Vec<u8> {
    let mut body = errno.wire_value().to_be_bytes().to_vec();
    body.extend_from_slice(message.as_bytes());
    body.push(0);
    body
}

pub fn wait_body(seconds: u32, reason: &str) -> Vec<u8> {
    let mut body = seconds.to_be_bytes().to_vec();
    body.extend_from_slice(reason.as_bytes());
    body.push(0);
    body
}

/// Socket fake delivering a fixed byte stream in bounded slices.
pub struct SliceSocket {
    data: Vec<u8>,
    pos: usize,
    slice: usize,
}

impl SliceSocket {
    pub fn new(data: Vec<u8>, slice: usize) -> Self {
        Self {
            data,
            pos: 0,
            slice: slice.max(1),
        }
    }

    pub fn exhausted(&self) -> bool { self.pos == self.data.len() }
}

impl SocketRead for SliceSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.exhausted() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.slice).min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
